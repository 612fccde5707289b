// Search-engine discovery adapter.
//
// Talks to a Google Custom Search compatible JSON API. Each query is
// restricted to the platform's profile pages with a `site:` operator; hits
// are reduced to profile candidates by the pure filters in `filter`.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::filter::{candidates_from_hits, MIN_SNIPPET_CHARS};
use super::http::HttpClient;
use super::{DiscoveryPage, DiscoveryQuery, DiscoverySource, SourceKind};
use crate::db::models::SearchHit;
use crate::error::SourceError;

/// Default Custom Search endpoint.
pub const DEFAULT_SEARCH_API_URL: &str = "https://www.googleapis.com/customsearch/v1";

/// Results per page. The API caps `num` at 10.
const PAGE_SIZE: u32 = 10;

/// The API refuses `start` values past 91 (100 results per query).
const MAX_START: u32 = 91;

pub struct SearchDiscovery {
    client: HttpClient,
    api_url: String,
    api_key: String,
    engine_id: String,
}

impl SearchDiscovery {
    pub fn new(client: HttpClient, api_url: &str, api_key: &str, engine_id: &str) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            engine_id: engine_id.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
    #[serde(default)]
    queries: SearchQueries,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    link: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    snippet: String,
}

#[derive(Debug, Default, Deserialize)]
struct SearchQueries {
    #[serde(default, rename = "nextPage")]
    next_page: Vec<serde_json::Value>,
}

/// 1-based `start` parameter for a zero-based page index, or None when the
/// page lies past what the API will serve.
fn start_index(page: u32) -> Option<u32> {
    let start = page.checked_mul(PAGE_SIZE)?.checked_add(1)?;
    (start <= MAX_START).then_some(start)
}

/// Convert a decoded response into a discovery page.
fn into_page(query: &DiscoveryQuery, page: u32, response: SearchResponse) -> DiscoveryPage {
    let has_more = !response.items.is_empty() && !response.queries.next_page.is_empty();
    let hits = response
        .items
        .into_iter()
        .map(|item| SearchHit {
            link: item.link,
            title: item.title,
            snippet: item.snippet,
        })
        .collect();

    let next_page = page + 1;
    DiscoveryPage {
        candidates: candidates_from_hits(query.platform, &query.country, hits, MIN_SNIPPET_CHARS),
        next_page: (has_more && start_index(next_page).is_some()).then_some(next_page),
    }
}

#[async_trait]
impl DiscoverySource for SearchDiscovery {
    fn kind(&self) -> SourceKind {
        SourceKind::Search
    }

    async fn discover(&self, query: &DiscoveryQuery, page: u32) -> Result<DiscoveryPage, SourceError> {
        let Some(start) = start_index(page) else {
            return Ok(DiscoveryPage::default());
        };

        let terms = query.search_terms();
        let start = start.to_string();
        let num = PAGE_SIZE.to_string();
        let params = [
            ("key", self.api_key.as_str()),
            ("cx", self.engine_id.as_str()),
            ("q", terms.as_str()),
            ("start", start.as_str()),
            ("num", num.as_str()),
        ];

        let response: SearchResponse = self.client.get_json(&self.api_url, &params, &[]).await?;
        let result = into_page(query, page, response);

        debug!(
            query = %terms,
            page = page,
            candidates = result.candidates.len(),
            "Search page fetched"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Platform;

    fn query() -> DiscoveryQuery {
        DiscoveryQuery {
            platform: Platform::Instagram,
            keyword: "fashion".to_string(),
            country: "CZ".to_string(),
        }
    }

    fn parse(json: &str) -> SearchResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_start_index_bounds() {
        assert_eq!(start_index(0), Some(1));
        assert_eq!(start_index(3), Some(31));
        assert_eq!(start_index(9), Some(91));
        assert_eq!(start_index(10), None);
    }

    #[test]
    fn test_page_from_response() {
        let response = parse(
            r#"{
                "items": [
                    {"link": "https://www.instagram.com/anna.style/", "title": "Anna (@anna.style)",
                     "snippet": "Prague based fashion creator, daily outfits and styling tips"},
                    {"link": "https://www.instagram.com/p/Cx1/", "title": "Post",
                     "snippet": "A post about fashion in Prague with a long enough snippet"}
                ],
                "queries": {"nextPage": [{"startIndex": 11}]}
            }"#,
        );
        let page = into_page(&query(), 0, response);
        assert_eq!(page.candidates.len(), 1);
        assert_eq!(page.candidates[0].identifier, "anna.style");
        assert_eq!(page.candidates[0].country.as_deref(), Some("CZ"));
        assert_eq!(page.next_page, Some(1));
    }

    #[test]
    fn test_empty_response_exhausts_query() {
        let page = into_page(&query(), 2, parse("{}"));
        assert!(page.candidates.is_empty());
        assert_eq!(page.next_page, None);
    }

    #[test]
    fn test_last_servable_page_has_no_next() {
        let response = parse(
            r#"{"items": [{"link": "https://www.instagram.com/jana/", "snippet": "x"}],
                "queries": {"nextPage": [{"startIndex": 101}]}}"#,
        );
        let page = into_page(&query(), 9, response);
        assert_eq!(page.next_page, None);
    }
}
