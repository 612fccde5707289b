// Deduplication engine — identity fingerprints and duplicate matching.
//
// A scraped profile is reduced to a set of fingerprints: one normalized
// handle per platform, one normalized profile URL per handle, and the contact
// email when the source exposed one. Any single fingerprint hit marks the
// profile as a duplicate (OR semantics). Hits on two different records are a
// conflict and go to manual review instead of being merged.
//
// Writes that depend on a "no match" answer are serialized per fingerprint
// with in-process advisory locks. The storage layer's unique key on
// (platform, normalized_handle) backs this up across processes.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::db::models::{
    Fingerprint, FingerprintMatch, Platform, PlatformHandle, ProfileFields, RecordKind,
    RecordRef,
};
use crate::db::Database;

// --- Normalization ---

/// Case-fold a handle and strip `@`, profile URL prefixes, query strings and
/// trailing slashes. Returns None when nothing handle-like is left.
///
/// `"https://www.Instagram.com/Anna.Style/?hl=cs"` → `"anna.style"`
pub fn normalize_handle(platform: Platform, raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let url = normalize_url(trimmed);
    let candidate = match url.as_deref().and_then(|url| profile_path(platform, url)) {
        Some(path) => path.split('/').next().unwrap_or_default().to_string(),
        None => trimmed.to_lowercase(),
    };

    let handle = candidate.trim_start_matches('@').trim();
    let valid = !handle.is_empty()
        && handle
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-'));
    valid.then(|| handle.to_string())
}

/// The path of a normalized URL on `platform`'s host, without the leading
/// slash. The host must end where the path begins: `instagram.comics` is a
/// handle, not a URL on `instagram.com`.
pub fn profile_path(platform: Platform, url: &str) -> Option<&str> {
    let rest = url.strip_prefix(platform.host())?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix('/')
    }
}

/// Reduce a profile URL to `host/path`: lower-cased, without scheme, `www.`
/// or `m.` prefix, query, fragment or trailing slash. Returns None for input
/// that doesn't look like a URL.
///
/// `"HTTPS://m.instagram.com/anna/?igsh=x"` → `"instagram.com/anna"`
pub fn normalize_url(raw: &str) -> Option<String> {
    let lower = raw.trim().to_lowercase();
    let without_scheme = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .unwrap_or(&lower);
    let without_prefix = without_scheme
        .strip_prefix("www.")
        .or_else(|| without_scheme.strip_prefix("m."))
        .unwrap_or(without_scheme);
    let without_query = without_prefix
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .trim_end_matches('/');

    let host = without_query.split('/').next().unwrap_or_default();
    if !host.contains('.') || host.contains(char::is_whitespace) {
        return None;
    }
    Some(without_query.to_string())
}

/// Lower-case and sanity-check an email address.
pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    let (local, domain) = email.split_once('@')?;
    let valid = !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.contains(char::is_whitespace);
    valid.then_some(email)
}

/// Storage keys of one handle: the normalized handle and its normalized
/// profile URL (derived from the handle when the source gave no URL).
pub fn handle_keys(h: &PlatformHandle) -> (String, Option<String>) {
    let handle = normalize_handle(h.platform, &h.handle)
        .unwrap_or_else(|| h.handle.trim().to_lowercase());
    let url = h
        .url
        .as_deref()
        .and_then(normalize_url)
        .or_else(|| normalize_url(&h.platform.profile_url(&handle)));
    (handle, url)
}

/// Compute the fingerprint set of a profile, sorted and deduplicated.
pub fn fingerprints(fields: &ProfileFields) -> Vec<Fingerprint> {
    let mut set = BTreeSet::new();

    for h in &fields.handles {
        if let Some(handle) = normalize_handle(h.platform, &h.handle) {
            let url = h
                .url
                .as_deref()
                .and_then(normalize_url)
                .or_else(|| normalize_url(&h.platform.profile_url(&handle)));
            if let Some(url) = url {
                set.insert(Fingerprint::Url { url });
            }
            set.insert(Fingerprint::Handle {
                platform: h.platform,
                handle,
            });
        }
    }

    if let Some(email) = fields.email.as_deref().and_then(normalize_email) {
        set.insert(Fingerprint::Email { email });
    }

    set.into_iter().collect()
}

// --- Matching ---

/// Result of looking a profile up against the stores.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Unique,
    Duplicate(RecordRef),
    /// Several distinct records matched through different fingerprints.
    Conflict(Vec<RecordRef>),
}

/// Collapse raw storage hits into a match outcome. Promoted prospects resolve
/// to the canonical profile they became, so a prospect and its own canonical
/// record count as one match.
pub fn resolve_matches(matches: &[FingerprintMatch]) -> MatchOutcome {
    let records: BTreeSet<RecordRef> = matches
        .iter()
        .map(|m| match m.converted_to {
            Some(canonical_id) => RecordRef::canonical(canonical_id),
            None => m.record,
        })
        .collect();
    outcome_from(records)
}

/// Like `resolve_matches`, restricted to the canonical store: unpromoted
/// prospects are ignored.
pub fn resolve_canonical_matches(matches: &[FingerprintMatch]) -> MatchOutcome {
    let records: BTreeSet<RecordRef> = matches
        .iter()
        .filter_map(|m| match (m.record.kind, m.converted_to) {
            (RecordKind::Canonical, _) => Some(m.record),
            (RecordKind::Prospect, Some(canonical_id)) => Some(RecordRef::canonical(canonical_id)),
            (RecordKind::Prospect, None) => None,
        })
        .collect();
    outcome_from(records)
}

fn outcome_from(records: BTreeSet<RecordRef>) -> MatchOutcome {
    let mut records: Vec<RecordRef> = records.into_iter().collect();
    match records.len() {
        0 => MatchOutcome::Unique,
        1 => MatchOutcome::Duplicate(records.remove(0)),
        _ => MatchOutcome::Conflict(records),
    }
}

/// Shared deduplication engine. Cheap to clone; all clones share one lock table.
#[derive(Clone)]
pub struct DedupEngine {
    db: Arc<dyn Database>,
    locks: FingerprintLocks,
}

impl DedupEngine {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            locks: FingerprintLocks::default(),
        }
    }

    /// Serialize work on these fingerprints until the guard is dropped.
    pub async fn lock(&self, fingerprints: &[Fingerprint]) -> FingerprintGuard {
        self.locks.acquire(fingerprints).await
    }

    /// Search prospects and canonical profiles for any fingerprint.
    pub async fn find_match(&self, fingerprints: &[Fingerprint]) -> Result<MatchOutcome> {
        if fingerprints.is_empty() {
            return Ok(MatchOutcome::Unique);
        }
        let matches = self.db.find_fingerprint_matches(fingerprints).await?;
        let outcome = resolve_matches(&matches);
        debug!(fingerprints = fingerprints.len(), outcome = ?outcome, "Dedup lookup");
        Ok(outcome)
    }

    /// Search only the canonical store (used by promotion).
    pub async fn find_canonical_match(&self, fingerprints: &[Fingerprint]) -> Result<MatchOutcome> {
        if fingerprints.is_empty() {
            return Ok(MatchOutcome::Unique);
        }
        let matches = self.db.find_fingerprint_matches(fingerprints).await?;
        Ok(resolve_canonical_matches(&matches))
    }
}

// --- Advisory locks ---

type LockTable = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Per-fingerprint async locks. Entries are dropped from the table once no
/// guard references them.
#[derive(Clone, Default)]
pub struct FingerprintLocks {
    table: LockTable,
}

impl FingerprintLocks {
    /// Lock every fingerprint, in sorted key order so two callers with
    /// overlapping sets can't deadlock.
    pub async fn acquire(&self, fingerprints: &[Fingerprint]) -> FingerprintGuard {
        let keys: BTreeSet<String> = fingerprints.iter().map(Fingerprint::lock_key).collect();
        let mut guards = Vec::with_capacity(keys.len());

        for key in &keys {
            let slot = {
                let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
                table.entry(key.clone()).or_default().clone()
            };
            guards.push(slot.lock_owned().await);
        }

        FingerprintGuard {
            guards,
            keys: keys.into_iter().collect(),
            table: self.table.clone(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Holds fingerprint locks; released on drop.
pub struct FingerprintGuard {
    guards: Vec<OwnedMutexGuard<()>>,
    keys: Vec<String>,
    table: LockTable,
}

impl Drop for FingerprintGuard {
    fn drop(&mut self) {
        self.guards.clear();
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        for key in &self.keys {
            if table.get(key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
                table.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn handle(platform: Platform, handle: &str) -> PlatformHandle {
        PlatformHandle {
            platform,
            handle: handle.to_string(),
            url: None,
            followers: None,
            raw: None,
        }
    }

    #[test]
    fn test_normalize_handle_strips_url_and_case() {
        assert_eq!(
            normalize_handle(Platform::Instagram, "https://www.Instagram.com/Anna.Style/?hl=cs"),
            Some("anna.style".to_string())
        );
        assert_eq!(
            normalize_handle(Platform::Instagram, "  @Anna.Style "),
            Some("anna.style".to_string())
        );
        assert_eq!(
            normalize_handle(Platform::TikTok, "tiktok.com/@Petra_k"),
            Some("petra_k".to_string())
        );
    }

    #[test]
    fn test_normalize_handle_keeps_handles_that_start_with_the_host() {
        assert_eq!(
            normalize_handle(Platform::Instagram, "instagram.comics"),
            Some("instagram.comics".to_string())
        );
        assert_eq!(
            normalize_handle(Platform::Instagram, "https://www.instagram.com/instagram.comics/"),
            Some("instagram.comics".to_string())
        );
        assert_eq!(normalize_handle(Platform::Instagram, "instagram.com"), None);

        let comics = ProfileFields {
            handles: vec![handle(Platform::Instagram, "instagram.comics")],
            ..Default::default()
        };
        let ics = ProfileFields {
            handles: vec![handle(Platform::Instagram, "ics")],
            ..Default::default()
        };
        assert_ne!(fingerprints(&comics), fingerprints(&ics));
    }

    #[test]
    fn test_normalize_handle_rejects_garbage() {
        assert_eq!(normalize_handle(Platform::Instagram, ""), None);
        assert_eq!(normalize_handle(Platform::Instagram, "@"), None);
        assert_eq!(normalize_handle(Platform::Instagram, "two words"), None);
    }

    #[test]
    fn test_normalize_url_drops_scheme_prefix_and_query() {
        assert_eq!(
            normalize_url("HTTPS://m.instagram.com/anna/?igsh=x"),
            Some("instagram.com/anna".to_string())
        );
        assert_eq!(
            normalize_url("http://www.tiktok.com/@anna#top"),
            Some("tiktok.com/@anna".to_string())
        );
        assert_eq!(normalize_url("anna"), None);
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(
            normalize_email(" Anna@Studio.CZ "),
            Some("anna@studio.cz".to_string())
        );
        assert_eq!(normalize_email("not-an-email"), None);
        assert_eq!(normalize_email("anna@localhost"), None);
    }

    #[test]
    fn test_fingerprints_cover_handle_url_and_email() {
        let fields = ProfileFields {
            email: Some("Anna@Studio.cz".to_string()),
            handles: vec![handle(Platform::Instagram, "@Anna")],
            ..Default::default()
        };
        let fps = fingerprints(&fields);
        assert_eq!(fps.len(), 3);
        assert!(fps.contains(&Fingerprint::Handle {
            platform: Platform::Instagram,
            handle: "anna".to_string()
        }));
        assert!(fps.contains(&Fingerprint::Url {
            url: "instagram.com/anna".to_string()
        }));
        assert!(fps.contains(&Fingerprint::Email {
            email: "anna@studio.cz".to_string()
        }));
    }

    #[test]
    fn test_fingerprints_equal_across_handle_spellings() {
        let a = ProfileFields {
            handles: vec![handle(Platform::Instagram, "ANNA")],
            ..Default::default()
        };
        let b = ProfileFields {
            handles: vec![handle(Platform::Instagram, "https://instagram.com/anna/")],
            ..Default::default()
        };
        assert_eq!(fingerprints(&a), fingerprints(&b));
    }

    #[test]
    fn test_resolve_matches_collapses_converted_prospect() {
        let matches = vec![
            FingerprintMatch {
                record: RecordRef::prospect(4),
                converted_to: Some(9),
            },
            FingerprintMatch {
                record: RecordRef::canonical(9),
                converted_to: None,
            },
        ];
        assert_eq!(
            resolve_matches(&matches),
            MatchOutcome::Duplicate(RecordRef::canonical(9))
        );
    }

    #[test]
    fn test_resolve_matches_flags_conflict() {
        let matches = vec![
            FingerprintMatch {
                record: RecordRef::canonical(1),
                converted_to: None,
            },
            FingerprintMatch {
                record: RecordRef::canonical(2),
                converted_to: None,
            },
        ];
        assert_eq!(
            resolve_matches(&matches),
            MatchOutcome::Conflict(vec![RecordRef::canonical(1), RecordRef::canonical(2)])
        );
        assert_eq!(resolve_matches(&[]), MatchOutcome::Unique);
    }

    #[test]
    fn test_resolve_canonical_matches_ignores_pending_prospects() {
        let matches = vec![FingerprintMatch {
            record: RecordRef::prospect(4),
            converted_to: None,
        }];
        assert_eq!(resolve_canonical_matches(&matches), MatchOutcome::Unique);
    }

    #[tokio::test]
    async fn test_locks_serialize_overlapping_sets_and_clean_up() {
        let locks = FingerprintLocks::default();
        let fp = vec![Fingerprint::Email {
            email: "a@b.cz".to_string(),
        }];

        let guard = locks.acquire(&fp).await;
        let contender = {
            let locks = locks.clone();
            let fp = fp.clone();
            tokio::spawn(async move {
                let _g = locks.acquire(&fp).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!contender.is_finished(), "second acquire should wait");

        drop(guard);
        contender.await.unwrap();
        assert_eq!(locks.len(), 0);
    }
}
