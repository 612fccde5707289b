// Source adapters — the only code that talks to external platforms.
//
// Two capabilities, two traits:
// - DiscoverySource turns a (keyword, country, platform) query into pages of
//   candidate identifiers.
// - ProfileSource fetches one candidate's public profile.
//
// Adapters are picked per run from a SourceSet. Every call they make is
// wrapped by the pacing controller; adapters themselves never sleep or retry.

pub mod filter;
pub mod http;
pub mod instagram;
pub mod search;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::Config;
use crate::db::models::{Platform, PlatformHandle, ProfileFields, ScrapedPayload, SearchHit};
use crate::error::SourceError;

/// Which upstream service a call goes to. Pacing is tracked per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Search-engine API used for discovery.
    Search,
    Instagram,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Search => "search",
            SourceKind::Instagram => "instagram",
        }
    }

    /// Prefix of the pacing environment variables for this source.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            SourceKind::Search => "PROSPECTOR_SEARCH",
            SourceKind::Instagram => "PROSPECTOR_INSTAGRAM",
        }
    }

    pub const ALL: [SourceKind; 2] = [SourceKind::Search, SourceKind::Instagram];
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One keyword-expansion query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveryQuery {
    pub platform: Platform,
    pub keyword: String,
    /// ISO country code the results should come from.
    pub country: String,
}

impl DiscoveryQuery {
    /// Search terms restricted to the platform's profile pages.
    pub fn search_terms(&self) -> String {
        format!(
            "site:{} {} {}",
            self.platform.host(),
            self.keyword.trim(),
            self.country
        )
    }
}

/// A target identified by discovery (or by the canonical store on refresh).
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub platform: Platform,
    /// Normalized handle on `platform`.
    pub identifier: String,
    pub country: Option<String>,
    /// The search result that surfaced this candidate, if any.
    pub hit: Option<SearchHit>,
}

/// One page of discovery results.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryPage {
    pub candidates: Vec<Candidate>,
    /// Page index to request next; None when the query is exhausted.
    pub next_page: Option<u32>,
}

/// A fetched public profile.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapedProfile {
    pub platform: Platform,
    pub handle: String,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub url: Option<String>,
    pub followers: i64,
    pub email: Option<String>,
    pub payload: ScrapedPayload,
}

impl ScrapedProfile {
    /// Convert into prospect fields, attributing the candidate's country.
    pub fn into_fields(self, country: Option<String>) -> ProfileFields {
        ProfileFields {
            display_name: self.display_name,
            bio: self.bio,
            avatar_url: self.avatar_url,
            country,
            email: self.email,
            total_followers: self.followers,
            handles: vec![PlatformHandle {
                platform: self.platform,
                handle: self.handle,
                url: self.url,
                followers: Some(self.followers),
                raw: Some(self.payload),
            }],
        }
    }
}

#[async_trait]
pub trait DiscoverySource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Fetch one page of candidates. Pages are zero-based and restartable.
    async fn discover(&self, query: &DiscoveryQuery, page: u32) -> Result<DiscoveryPage, SourceError>;
}

#[async_trait]
pub trait ProfileSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn fetch_profile(&self, candidate: &Candidate) -> Result<ScrapedProfile, SourceError>;
}

/// The adapters available to runs.
#[derive(Clone, Default)]
pub struct SourceSet {
    discovery: Option<Arc<dyn DiscoverySource>>,
    profiles: HashMap<Platform, Arc<dyn ProfileSource>>,
}

impl SourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_discovery(mut self, source: Arc<dyn DiscoverySource>) -> Self {
        self.discovery = Some(source);
        self
    }

    pub fn with_profile_source(mut self, platform: Platform, source: Arc<dyn ProfileSource>) -> Self {
        self.profiles.insert(platform, source);
        self
    }

    pub fn discovery(&self) -> Option<&Arc<dyn DiscoverySource>> {
        self.discovery.as_ref()
    }

    pub fn profile_source(&self, platform: Platform) -> Option<&Arc<dyn ProfileSource>> {
        self.profiles.get(&platform)
    }

    /// Build the production adapters from configuration. Discovery is only
    /// wired up when search credentials are present.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = http::HttpClient::new(&config.user_agent)?;

        let mut set = Self::new().with_profile_source(
            Platform::Instagram,
            Arc::new(instagram::InstagramProfiles::new(
                client.clone(),
                &config.instagram_api_url,
                config.instagram_session_id.clone(),
            )),
        );

        if config.require_search().is_ok() {
            set = set.with_discovery(Arc::new(search::SearchDiscovery::new(
                client,
                &config.search_api_url,
                &config.search_api_key,
                &config.search_engine_id,
            )));
        }

        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_terms_target_profile_pages() {
        let query = DiscoveryQuery {
            platform: Platform::Instagram,
            keyword: " fashion ".to_string(),
            country: "CZ".to_string(),
        };
        assert_eq!(query.search_terms(), "site:instagram.com fashion CZ");
    }

    #[test]
    fn test_scraped_profile_into_fields() {
        let profile = ScrapedProfile {
            platform: Platform::Instagram,
            handle: "anna".to_string(),
            display_name: Some("Anna".to_string()),
            bio: None,
            avatar_url: None,
            url: Some("https://www.instagram.com/anna/".to_string()),
            followers: 12_000,
            email: None,
            payload: ScrapedPayload::SearchHit(SearchHit {
                link: "https://www.instagram.com/anna/".to_string(),
                title: "Anna".to_string(),
                snippet: String::new(),
            }),
        };
        let fields = profile.into_fields(Some("CZ".to_string()));
        assert_eq!(fields.total_followers, 12_000);
        assert_eq!(fields.country.as_deref(), Some("CZ"));
        assert_eq!(fields.handles.len(), 1);
        assert_eq!(fields.handles[0].followers, Some(12_000));
    }
}
