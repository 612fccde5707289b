// Data models — Rust structs that map to database rows.
//
// These are the types that flow through the pipeline. They're separate
// from the database queries so other modules can use them without depending
// on rusqlite or sqlx directly. Enums are persisted through `as_str()` and
// parsed back with `FromStr` at the storage boundary.

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum using
/// one snake_case name per variant.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(anyhow!(concat!("unknown ", stringify!($name), ": {}"), other)),
                }
            }
        }
    };
}

// --- Platforms ---

/// A social platform a prospect can have a presence on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Instagram,
    TikTok,
    YouTube,
}

string_enum!(Platform {
    Instagram => "instagram",
    TikTok => "tiktok",
    YouTube => "youtube",
});

impl Platform {
    /// Host used when building and recognizing profile URLs.
    pub fn host(&self) -> &'static str {
        match self {
            Platform::Instagram => "instagram.com",
            Platform::TikTok => "tiktok.com",
            Platform::YouTube => "youtube.com",
        }
    }

    /// Canonical public profile URL for a handle.
    pub fn profile_url(&self, handle: &str) -> String {
        match self {
            Platform::Instagram => format!("https://www.instagram.com/{handle}/"),
            Platform::TikTok => format!("https://www.tiktok.com/@{handle}"),
            Platform::YouTube => format!("https://www.youtube.com/@{handle}"),
        }
    }
}

// --- Scraping config ---

/// Immutable parameters for a discovery batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapingConfig {
    /// ISO 3166-1 alpha-2 country codes, upper-cased.
    pub countries: Vec<String>,
    pub min_followers: i64,
    pub max_followers: i64,
    #[serde(default)]
    pub include_keywords: Vec<String>,
    #[serde(default)]
    pub exclude_keywords: Vec<String>,
    pub platforms: Vec<Platform>,
    /// How many new prospects the run should produce.
    pub result_count: u32,
}

impl ScrapingConfig {
    /// True when `followers` falls inside the configured inclusive range.
    pub fn accepts_followers(&self, followers: i64) -> bool {
        followers >= self.min_followers && followers <= self.max_followers
    }

    /// Returns the first exclude keyword found in `text` (case-insensitive).
    pub fn excluded_keyword(&self, text: &str) -> Option<&str> {
        let lower = text.to_lowercase();
        self.exclude_keywords
            .iter()
            .map(String::as_str)
            .find(|kw| !kw.trim().is_empty() && lower.contains(&kw.trim().to_lowercase()))
    }
}

// --- Runs ---

/// Where a run gets its candidate targets from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    /// Keyword expansion through the search-engine discovery source.
    Discovery,
    /// Re-scrape of canonical profiles matching the config criteria.
    Refresh,
}

string_enum!(RunType {
    Discovery => "discovery",
    Refresh => "refresh",
});

impl RunType {
    /// Provenance tag written to `found_by` on promoted profiles.
    pub fn provenance(&self) -> &'static str {
        match self {
            RunType::Discovery => "search_discovery",
            RunType::Refresh => "profile_refresh",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Column default. start_run validates before inserting, so its rows
    /// start out `running`.
    Pending,
    Running,
    Completed,
    Failed,
}

string_enum!(RunStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    /// Operator cancellation sentinel.
    Cancelled,
    Adapter,
    Storage,
    /// Non-fatal discovery trouble (a query page failed or was blocked).
    Discovery,
    /// Reconciled after a crash or restart.
    Interrupted,
}

string_enum!(RunErrorKind {
    Cancelled => "cancelled",
    Adapter => "adapter",
    Storage => "storage",
    Discovery => "discovery",
    Interrupted => "interrupted",
});

/// One structured entry in a run's error list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: RunErrorKind,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl RunError {
    pub fn new(kind: RunErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            occurred_at: Utc::now(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(RunErrorKind::Cancelled, "cancelled by operator")
    }
}

/// One execution of a scraping config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapingRun {
    pub id: i64,
    pub config_id: i64,
    pub run_type: RunType,
    pub status: RunStatus,
    pub total_found: i64,
    pub total_processed: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub errors: Vec<RunError>,
    /// Provenance tags (`found_by`) a refresh run is restricted to.
    pub source_filter: Vec<String>,
}

impl ScrapingRun {
    /// A cancelled run is stored as failed with a cancellation sentinel.
    pub fn is_cancelled(&self) -> bool {
        self.status == RunStatus::Failed
            && self
                .errors
                .iter()
                .any(|e| e.kind == RunErrorKind::Cancelled)
    }

    /// Status label for display, distinguishing cancellation from failure.
    pub fn display_status(&self) -> &'static str {
        if self.is_cancelled() {
            "cancelled"
        } else {
            self.status.as_str()
        }
    }
}

// --- Attempts ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Failed,
    Skipped,
}

string_enum!(AttemptStatus {
    Success => "success",
    Failed => "failed",
    Skipped => "skipped",
});

/// Why an attempt ended the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptReason {
    Blocked,
    NotFound,
    TransientNetwork,
    Fatal,
    /// A previous run saw Blocked/NotFound for this target recently.
    CoolDown,
    /// Outside the follower range or matched an exclude keyword.
    Filtered,
    /// Matched an existing prospect or canonical profile.
    Duplicate,
    /// Matched several distinct records; flagged for manual review.
    DedupConflict,
    /// Fetched after the run was cancelled.
    Cancelled,
    /// Admitted, but the run had already produced its desired result count.
    QuotaReached,
}

string_enum!(AttemptReason {
    Blocked => "blocked",
    NotFound => "not_found",
    TransientNetwork => "transient_network",
    Fatal => "fatal",
    CoolDown => "cool_down",
    Filtered => "filtered",
    Duplicate => "duplicate",
    DedupConflict => "dedup_conflict",
    Cancelled => "cancelled",
    QuotaReached => "quota_reached",
});

/// Raw data kept from a source, tagged by the source that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ScrapedPayload {
    Instagram(InstagramPayload),
    SearchHit(SearchHit),
}

/// The subset of Instagram's web profile info we keep as evidence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstagramPayload {
    pub user_id: String,
    pub username: String,
    pub full_name: Option<String>,
    pub biography: Option<String>,
    pub followers: i64,
    pub following: i64,
    pub posts: i64,
    pub is_private: bool,
    pub is_verified: bool,
    pub business_email: Option<String>,
    pub external_url: Option<String>,
    pub category: Option<String>,
}

/// A single search-engine result that pointed at a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub link: String,
    pub title: String,
    pub snippet: String,
}

/// An attempt about to be appended to the ledger.
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub run_id: i64,
    pub platform: Platform,
    /// Normalized candidate identifier (handle).
    pub target: String,
    pub status: AttemptStatus,
    pub reason: Option<AttemptReason>,
    pub error_message: Option<String>,
    pub payload: Option<ScrapedPayload>,
    pub prospect_id: Option<i64>,
}

/// A persisted fetch attempt. Never updated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapingAttempt {
    pub id: i64,
    pub run_id: i64,
    pub platform: Platform,
    pub target: String,
    pub status: AttemptStatus,
    pub reason: Option<AttemptReason>,
    pub error_message: Option<String>,
    pub payload: Option<ScrapedPayload>,
    pub prospect_id: Option<i64>,
    pub attempted_at: DateTime<Utc>,
}

// --- Prospects and canonical profiles ---

/// A profile's presence on one platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformHandle {
    pub platform: Platform,
    pub handle: String,
    pub url: Option<String>,
    pub followers: Option<i64>,
    pub raw: Option<ScrapedPayload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProspectStatus {
    Pending,
    Approved,
    Rejected,
    Converted,
}

string_enum!(ProspectStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
    Converted => "converted",
});

impl ProspectStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProspectStatus::Rejected | ProspectStatus::Converted)
    }
}

/// Identity and evidence fields shared by prospects and canonical profiles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileFields {
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub country: Option<String>,
    /// Lower-cased contact email, when the source exposed one.
    pub email: Option<String>,
    pub handles: Vec<PlatformHandle>,
    pub total_followers: i64,
}

/// A prospect about to be created by a run.
#[derive(Debug, Clone)]
pub struct ProspectDraft {
    pub run_id: i64,
    pub fields: ProfileFields,
}

/// Outcome of creating a prospect on behalf of its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProspectInsert {
    /// Prospect written and counted in the run's `total_processed`.
    Created(i64),
    /// A handle collides with an existing prospect's (platform, handle) key.
    Duplicate,
    /// The run is terminal, or every candidate it found is already counted.
    RunClosed,
}

impl ProspectInsert {
    pub fn created(self) -> Option<i64> {
        match self {
            ProspectInsert::Created(id) => Some(id),
            _ => None,
        }
    }
}

/// A discovered-but-unvetted profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluencerProspect {
    pub id: i64,
    pub run_id: i64,
    #[serde(flatten)]
    pub fields: ProfileFields,
    pub status: ProspectStatus,
    pub notes: Option<String>,
    /// Set when the prospect was promoted.
    pub canonical_profile_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

/// Provenance recorded when a canonical profile is created or merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub found_by: String,
    pub source_hashtags: Vec<String>,
    pub source_country: Option<String>,
}

/// A canonical profile about to be created or merged into.
#[derive(Debug, Clone)]
pub struct ProfileDraft {
    pub fields: ProfileFields,
    pub provenance: Provenance,
}

/// The vetted, durable profile record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalProfile {
    pub id: i64,
    #[serde(flatten)]
    pub fields: ProfileFields,
    pub is_validated: bool,
    pub has_email: bool,
    pub is_active: bool,
    pub last_scraped_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub provenance: Provenance,
    pub created_at: DateTime<Utc>,
}

/// Filter used to pick canonical profiles for a refresh run.
#[derive(Debug, Clone)]
pub struct RefreshCriteria {
    pub countries: Vec<String>,
    pub min_followers: i64,
    pub max_followers: i64,
    pub platforms: Vec<Platform>,
    /// Empty means any provenance.
    pub found_by: Vec<String>,
    pub limit: u32,
}

/// A refresh target: one handle of one canonical profile.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshTarget {
    pub profile_id: i64,
    pub platform: Platform,
    pub handle: String,
    pub country: Option<String>,
}

// --- Deduplication ---

/// A normalized identity key used for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fingerprint {
    Handle { platform: Platform, handle: String },
    Url { url: String },
    Email { email: String },
}

impl Fingerprint {
    /// Stable key for advisory locking.
    pub fn lock_key(&self) -> String {
        match self {
            Fingerprint::Handle { platform, handle } => format!("handle:{platform}:{handle}"),
            Fingerprint::Url { url } => format!("url:{url}"),
            Fingerprint::Email { email } => format!("email:{email}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Prospect,
    Canonical,
}

string_enum!(RecordKind {
    Prospect => "prospect",
    Canonical => "canonical",
});

/// Reference to an existing prospect or canonical profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordRef {
    pub kind: RecordKind,
    pub id: i64,
}

impl RecordRef {
    pub fn prospect(id: i64) -> Self {
        Self {
            kind: RecordKind::Prospect,
            id,
        }
    }

    pub fn canonical(id: i64) -> Self {
        Self {
            kind: RecordKind::Canonical,
            id,
        }
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}", self.kind, self.id)
    }
}

/// A storage hit for one fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct FingerprintMatch {
    pub record: RecordRef,
    /// For prospects that were already promoted, the canonical profile they became.
    pub converted_to: Option<i64>,
}

/// An ambiguous match flagged for manual resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConflict {
    pub id: i64,
    pub run_id: Option<i64>,
    pub platform: Platform,
    pub target: String,
    pub records: Vec<RecordRef>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ScrapingConfig {
        ScrapingConfig {
            countries: vec!["CZ".to_string()],
            min_followers: 5_000,
            max_followers: 50_000,
            include_keywords: vec!["fashion".to_string()],
            exclude_keywords: vec!["Giveaway".to_string()],
            platforms: vec![Platform::Instagram],
            result_count: 10,
        }
    }

    #[test]
    fn test_enum_round_trip_through_str() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert_eq!("not_found".parse::<AttemptReason>().unwrap(), AttemptReason::NotFound);
        assert!("bogus".parse::<Platform>().is_err());
    }

    #[test]
    fn test_follower_range_is_inclusive() {
        let c = config();
        assert!(c.accepts_followers(5_000));
        assert!(c.accepts_followers(50_000));
        assert!(!c.accepts_followers(4_999));
        assert!(!c.accepts_followers(50_001));
    }

    #[test]
    fn test_excluded_keyword_is_case_insensitive() {
        let c = config();
        assert_eq!(c.excluded_keyword("Big GIVEAWAY today"), Some("Giveaway"));
        assert_eq!(c.excluded_keyword("Prague street style"), None);
    }

    #[test]
    fn test_cancelled_run_displays_as_cancelled() {
        let run = ScrapingRun {
            id: 1,
            config_id: 1,
            run_type: RunType::Discovery,
            status: RunStatus::Failed,
            total_found: 3,
            total_processed: 1,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            errors: vec![RunError::cancelled()],
            source_filter: vec![],
        };
        assert!(run.is_cancelled());
        assert_eq!(run.display_status(), "cancelled");
    }

    #[test]
    fn test_payload_is_tagged_by_source() {
        let payload = ScrapedPayload::SearchHit(SearchHit {
            link: "https://www.instagram.com/anna/".to_string(),
            title: "Anna".to_string(),
            snippet: "Prague fashion".to_string(),
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["source"], "search_hit");
        let back: ScrapedPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }
}
