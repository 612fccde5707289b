// Shared HTTP plumbing for source adapters.
//
// A thin reqwest wrapper with a generic JSON GET helper. Responses are mapped
// onto the SourceError taxonomy here so every adapter classifies failures the
// same way. No timeouts are set on the client: the pacing controller owns the
// per-call deadline.

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::SourceError;

/// Default user agent when PROSPECTOR_USER_AGENT is not set.
pub const DEFAULT_USER_AGENT: &str = "prospector/0.1 (influencer-discovery)";

/// Cheap-to-clone HTTP client shared by all adapters.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    /// GET `url` with query parameters and extra headers, decoding a JSON body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
        headers: &[(&str, &str)],
    ) -> Result<T, SourceError> {
        debug!(url = url, "Source GET request");

        let mut request = self.client.get(url).query(query);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        response.json::<T>().await.map_err(|e| {
            SourceError::Fatal(format!("unexpected response shape from {url}: {e}"))
        })
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> SourceError {
    let detail = format!("HTTP {status}: {}", crate::output::truncate_chars(body.trim(), 200));
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => SourceError::NotFound(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
            SourceError::Blocked(detail)
        }
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
            SourceError::TransientNetwork(detail)
        }
        _ => SourceError::Fatal(detail),
    }
}
