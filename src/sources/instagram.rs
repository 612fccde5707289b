// Instagram profile fetch adapter.
//
// Uses the public web-profile-info endpoint the Instagram web app calls when
// it renders a profile page. The endpoint wants the web app's id header and
// answers 401/429 (or a `"status": "fail"` body) once it decides the caller
// is scraping. A session cookie raises the limits when configured.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::filter::clean_profile;
use super::http::HttpClient;
use super::{Candidate, ProfileSource, ScrapedProfile, SourceKind};
use crate::db::models::{InstagramPayload, Platform, ScrapedPayload};
use crate::error::SourceError;

pub const DEFAULT_INSTAGRAM_API_URL: &str =
    "https://i.instagram.com/api/v1/users/web_profile_info/";

/// App id the Instagram web client sends.
const IG_APP_ID: &str = "936619743392459";

pub struct InstagramProfiles {
    client: HttpClient,
    api_url: String,
    session_id: Option<String>,
}

impl InstagramProfiles {
    pub fn new(client: HttpClient, api_url: &str, session_id: Option<String>) -> Self {
        Self {
            client,
            api_url: api_url.to_string(),
            session_id: session_id.filter(|s| !s.trim().is_empty()),
        }
    }
}

// --- Response shape ---

#[derive(Debug, Deserialize)]
struct WebProfileResponse {
    data: Option<WebProfileData>,
    status: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebProfileData {
    user: Option<WebUser>,
}

#[derive(Debug, Default, Deserialize)]
struct EdgeCount {
    #[serde(default)]
    count: i64,
}

#[derive(Debug, Deserialize)]
struct WebUser {
    id: String,
    username: String,
    full_name: Option<String>,
    biography: Option<String>,
    profile_pic_url_hd: Option<String>,
    profile_pic_url: Option<String>,
    #[serde(default)]
    edge_followed_by: EdgeCount,
    #[serde(default)]
    edge_follow: EdgeCount,
    #[serde(default)]
    edge_owner_to_timeline_media: EdgeCount,
    #[serde(default)]
    is_private: bool,
    #[serde(default)]
    is_verified: bool,
    business_email: Option<String>,
    external_url: Option<String>,
    category_name: Option<String>,
}

/// Map a decoded response onto a profile, or the error it represents.
fn parse_profile(target: &str, response: WebProfileResponse) -> Result<ScrapedProfile, SourceError> {
    if response.status.as_deref() == Some("fail") {
        let message = response.message.unwrap_or_else(|| "request refused".to_string());
        return Err(SourceError::Blocked(message));
    }

    let user = response
        .data
        .and_then(|d| d.user)
        .ok_or_else(|| SourceError::NotFound(format!("instagram user {target}")))?;

    let non_empty = |s: Option<String>| s.filter(|s| !s.trim().is_empty());
    let handle = user.username.to_lowercase();
    let payload = InstagramPayload {
        user_id: user.id,
        username: user.username,
        full_name: user.full_name.clone(),
        biography: user.biography.clone(),
        followers: user.edge_followed_by.count,
        following: user.edge_follow.count,
        posts: user.edge_owner_to_timeline_media.count,
        is_private: user.is_private,
        is_verified: user.is_verified,
        business_email: non_empty(user.business_email.clone()),
        external_url: non_empty(user.external_url),
        category: non_empty(user.category_name),
    };

    Ok(clean_profile(ScrapedProfile {
        platform: Platform::Instagram,
        url: Some(Platform::Instagram.profile_url(&handle)),
        handle,
        display_name: user.full_name,
        bio: user.biography,
        avatar_url: non_empty(user.profile_pic_url_hd).or_else(|| non_empty(user.profile_pic_url)),
        followers: user.edge_followed_by.count,
        email: non_empty(user.business_email),
        payload: ScrapedPayload::Instagram(payload),
    }))
}

#[async_trait]
impl ProfileSource for InstagramProfiles {
    fn kind(&self) -> SourceKind {
        SourceKind::Instagram
    }

    async fn fetch_profile(&self, candidate: &Candidate) -> Result<ScrapedProfile, SourceError> {
        if candidate.platform != Platform::Instagram {
            return Err(SourceError::Fatal(format!(
                "instagram adapter cannot fetch {} profiles",
                candidate.platform
            )));
        }

        let cookie = self.session_id.as_ref().map(|s| format!("sessionid={s}"));
        let mut headers = vec![("x-ig-app-id", IG_APP_ID)];
        if let Some(cookie) = cookie.as_deref() {
            headers.push(("cookie", cookie));
        }

        let response: WebProfileResponse = self
            .client
            .get_json(&self.api_url, &[("username", candidate.identifier.as_str())], &headers)
            .await?;

        let profile = parse_profile(&candidate.identifier, response)?;
        debug!(
            target_handle = %profile.handle,
            followers = profile.followers,
            "Instagram profile fetched"
        );
        Ok(profile)
    }
}
