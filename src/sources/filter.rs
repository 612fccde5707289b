// Pure result filters for source adapters.
//
// Search hits are reduced to profile candidates (non-profile pages dropped,
// short snippets dropped, duplicates collapsed). Fetched profiles get their
// free-text fields de-noised and a contact email pulled from the bio when the
// source didn't expose one. Nothing in here does I/O.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex_lite::Regex;

use super::{Candidate, ScrapedProfile};
use crate::db::models::{Platform, SearchHit};
use crate::pipeline::dedup::{normalize_email, normalize_handle, normalize_url, profile_path};

/// Search hits with less snippet text than this are usually login walls or
/// empty pages.
pub const MIN_SNIPPET_CHARS: usize = 20;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("valid regex")
});

/// First path segments that are never profiles.
const RESERVED_SEGMENTS: &[&str] = &[
    "p", "reel", "reels", "tv", "explore", "stories", "accounts", "about", "developer", "legal",
    "directory", "web", "api", "tags", "locations", "video", "watch", "channel", "shorts",
    "results", "discover", "music", "tag",
];

/// Extract the normalized handle from a profile link, or None when the link
/// points at a post, reel, explore page or another platform.
///
/// `"https://www.instagram.com/anna.style/?hl=cs"` → `Some("anna.style")`
/// `"https://www.instagram.com/p/C1x2y3/"` → `None`
pub fn profile_handle_from_url(platform: Platform, link: &str) -> Option<String> {
    let url = normalize_url(link)?;
    let path = profile_path(platform, &url)?;

    let mut segments = path.split('/').filter(|s| !s.is_empty());
    let first = segments.next()?;
    // Anything deeper than /<handle>/ is content, not the profile page
    if segments.next().is_some() {
        return None;
    }

    let needs_at = matches!(platform, Platform::TikTok | Platform::YouTube);
    if needs_at && !first.starts_with('@') {
        return None;
    }
    if RESERVED_SEGMENTS.contains(&first) {
        return None;
    }
    normalize_handle(platform, first)
}

/// Collapse runs of whitespace and strip zero-width characters.
pub fn denoise(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}'))
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// First plausible email address in `text`, lower-cased.
pub fn extract_email(text: &str) -> Option<String> {
    EMAIL_RE
        .find_iter(text)
        .find_map(|m| normalize_email(m.as_str().trim_end_matches('.')))
}

/// Turn one page of search hits into candidates, in result order.
pub fn candidates_from_hits(
    platform: Platform,
    country: &str,
    hits: Vec<SearchHit>,
    min_snippet_chars: usize,
) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    for mut hit in hits {
        hit.snippet = denoise(&hit.snippet);
        hit.title = denoise(&hit.title);
        if hit.snippet.chars().count() < min_snippet_chars {
            continue;
        }
        let Some(identifier) = profile_handle_from_url(platform, &hit.link) else {
            continue;
        };
        if seen.insert(identifier.clone()) {
            candidates.push(Candidate {
                platform,
                identifier,
                country: Some(country.to_string()),
                hit: Some(hit),
            });
        }
    }

    candidates
}

/// Clean a fetched profile's text fields and fill the email from the bio.
pub fn clean_profile(mut profile: ScrapedProfile) -> ScrapedProfile {
    let tidy = |s: Option<String>| s.map(|s| denoise(&s)).filter(|s| !s.is_empty());
    profile.display_name = tidy(profile.display_name);
    profile.bio = tidy(profile.bio);
    profile.email = profile
        .email
        .as_deref()
        .and_then(normalize_email)
        .or_else(|| profile.bio.as_deref().and_then(extract_email));
    profile
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{InstagramPayload, ScrapedPayload};

    fn hit(link: &str, snippet: &str) -> SearchHit {
        SearchHit {
            link: link.to_string(),
            title: "title".to_string(),
            snippet: snippet.to_string(),
        }
    }

    #[test]
    fn test_profile_urls_accepted() {
        assert_eq!(
            profile_handle_from_url(Platform::Instagram, "https://www.instagram.com/Anna.Style/?hl=cs"),
            Some("anna.style".to_string())
        );
        assert_eq!(
            profile_handle_from_url(Platform::TikTok, "https://www.tiktok.com/@petra_k"),
            Some("petra_k".to_string())
        );
        assert_eq!(
            profile_handle_from_url(Platform::Instagram, "https://www.instagram.com/instagram.comics/"),
            Some("instagram.comics".to_string())
        );
        // Only the exact host counts
        assert_eq!(
            profile_handle_from_url(Platform::Instagram, "https://instagram.comics/anna"),
            None
        );
    }

    #[test]
    fn test_non_profile_urls_rejected() {
        for link in [
            "https://www.instagram.com/p/C1x2y3/",
            "https://www.instagram.com/reel/C1x2y3/",
            "https://www.instagram.com/explore/tags/fashion/",
            "https://www.instagram.com/anna/reels/",
            "https://www.facebook.com/anna",
            "https://www.instagram.com/",
        ] {
            assert_eq!(profile_handle_from_url(Platform::Instagram, link), None, "{link}");
        }
        assert_eq!(
            profile_handle_from_url(Platform::TikTok, "https://www.tiktok.com/discover/fashion"),
            None
        );
    }

    #[test]
    fn test_denoise_collapses_whitespace() {
        assert_eq!(denoise("  Prague \n\n fashion\u{200B}  blogger "), "Prague fashion blogger");
    }

    #[test]
    fn test_extract_email() {
        assert_eq!(
            extract_email("Collabs: Anna.Style@Gmail.com. DM for rates"),
            Some("anna.style@gmail.com".to_string())
        );
        assert_eq!(extract_email("no contact here @anna"), None);
    }

    #[test]
    fn test_candidates_from_hits_filters_and_collapses() {
        let long = "Prague fashion and lifestyle creator sharing daily outfits";
        let hits = vec![
            hit("https://www.instagram.com/anna/", long),
            hit("https://instagram.com/ANNA", long),
            hit("https://www.instagram.com/p/xyz/", long),
            hit("https://www.instagram.com/petra/", "too short"),
            hit("https://www.instagram.com/jana/", long),
        ];
        let candidates = candidates_from_hits(Platform::Instagram, "CZ", hits, MIN_SNIPPET_CHARS);
        let ids: Vec<&str> = candidates.iter().map(|c| c.identifier.as_str()).collect();
        assert_eq!(ids, vec!["anna", "jana"]);
        assert_eq!(candidates[0].country.as_deref(), Some("CZ"));
    }

    #[test]
    fn test_clean_profile_pulls_email_from_bio() {
        let profile = ScrapedProfile {
            platform: Platform::Instagram,
            handle: "anna".to_string(),
            display_name: Some("  Anna   Nováková ".to_string()),
            bio: Some("Stylist\n\nbusiness: anna@studio.cz".to_string()),
            avatar_url: None,
            url: None,
            followers: 10,
            email: None,
            payload: ScrapedPayload::Instagram(InstagramPayload::default()),
        };
        let cleaned = clean_profile(profile);
        assert_eq!(cleaned.display_name.as_deref(), Some("Anna Nováková"));
        assert_eq!(cleaned.bio.as_deref(), Some("Stylist business: anna@studio.cz"));
        assert_eq!(cleaned.email.as_deref(), Some("anna@studio.cz"));
    }
}
