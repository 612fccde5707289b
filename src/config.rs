use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::pacing::SourcePolicy;
use crate::pipeline::PipelineSettings;
use crate::sources::http::DEFAULT_USER_AGENT;
use crate::sources::instagram::DEFAULT_INSTAGRAM_API_URL;
use crate::sources::search::DEFAULT_SEARCH_API_URL;
use crate::sources::SourceKind;

/// Central configuration loaded from environment variables.
///
/// All secrets come from env vars (never hardcoded). The .env file
/// is loaded automatically at startup via dotenvy.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    /// PostgreSQL connection URL (when set and starts with postgres://, uses Postgres backend)
    pub database_url: Option<String>,
    /// Custom Search compatible endpoint used for discovery runs.
    pub search_api_url: String,
    pub search_api_key: String,
    pub search_engine_id: String,
    pub instagram_api_url: String,
    /// Optional logged-in session cookie for the Instagram adapter.
    pub instagram_session_id: Option<String>,
    pub user_agent: String,
    /// Pacing policy per source, defaults overridden from the environment.
    pub source_policies: Vec<(SourceKind, SourcePolicy)>,
    /// Blocked/NotFound targets are skipped for this many days.
    pub cooldown_days: i64,
    /// Unfinished runs with no activity for this long are treated as crashed.
    pub stale_run_minutes: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "./prospector.db".to_string(),
            database_url: None,
            search_api_url: DEFAULT_SEARCH_API_URL.to_string(),
            search_api_key: String::new(),
            search_engine_id: String::new(),
            instagram_api_url: DEFAULT_INSTAGRAM_API_URL.to_string(),
            instagram_session_id: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            source_policies: SourceKind::ALL
                .iter()
                .map(|kind| (*kind, SourcePolicy::defaults_for(*kind)))
                .collect(),
            cooldown_days: 7,
            stale_run_minutes: 30,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Everything has a default; search credentials are only checked when a
    /// discovery run is requested (see `require_search`).
    pub fn load() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a config from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let mut source_policies = Vec::new();
        for kind in SourceKind::ALL {
            source_policies.push((kind, policy_from_lookup(kind, &var)?));
        }

        Ok(Self {
            db_path: var("PROSPECTOR_DB_PATH").unwrap_or(defaults.db_path),
            database_url: var("DATABASE_URL"),
            search_api_url: var("SEARCH_API_URL").unwrap_or(defaults.search_api_url),
            search_api_key: var("SEARCH_API_KEY").unwrap_or_default(),
            search_engine_id: var("SEARCH_ENGINE_ID").unwrap_or_default(),
            instagram_api_url: var("INSTAGRAM_API_URL").unwrap_or(defaults.instagram_api_url),
            instagram_session_id: var("INSTAGRAM_SESSION_ID"),
            user_agent: var("PROSPECTOR_USER_AGENT").unwrap_or(defaults.user_agent),
            source_policies,
            cooldown_days: parse_var(&var, "PROSPECTOR_COOLDOWN_DAYS")?
                .unwrap_or(defaults.cooldown_days),
            stale_run_minutes: parse_var(&var, "PROSPECTOR_STALE_RUN_MINUTES")?
                .unwrap_or(defaults.stale_run_minutes),
        })
    }

    /// Check that search credentials are configured.
    /// Call this before starting a discovery run.
    pub fn require_search(&self) -> Result<()> {
        if self.search_api_key.is_empty() || self.search_engine_id.is_empty() {
            anyhow::bail!(
                "SEARCH_API_KEY and SEARCH_ENGINE_ID must be set for discovery runs.\n\
                 Add them to your .env file, or start a refresh run instead."
            );
        }
        Ok(())
    }

    /// Orchestrator settings derived from this config.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            cooldown: chrono::Duration::days(self.cooldown_days.max(0)),
            stale_run_after: chrono::Duration::minutes(self.stale_run_minutes.max(1)),
            ..PipelineSettings::default()
        }
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("{name} must be a number, got {raw:?}"))
        })
        .transpose()
}

/// Apply `<PREFIX>_MIN_INTERVAL_MS`, `_CONCURRENCY`, `_TIMEOUT_SECS` and
/// `_MAX_BACKOFF_SECS` on top of the source's defaults.
fn policy_from_lookup(
    kind: SourceKind,
    var: &impl Fn(&str) -> Option<String>,
) -> Result<SourcePolicy> {
    let prefix = kind.env_prefix();
    let mut policy = SourcePolicy::defaults_for(kind);

    if let Some(ms) = parse_var::<u64>(var, &format!("{prefix}_MIN_INTERVAL_MS"))? {
        policy.min_interval = Duration::from_millis(ms);
    }
    if let Some(n) = parse_var::<usize>(var, &format!("{prefix}_CONCURRENCY"))? {
        policy.max_concurrency = n.max(1);
    }
    if let Some(secs) = parse_var::<u64>(var, &format!("{prefix}_TIMEOUT_SECS"))? {
        policy.timeout = Duration::from_secs(secs.max(1));
    }
    if let Some(secs) = parse_var::<u64>(var, &format!("{prefix}_MAX_BACKOFF_SECS"))? {
        policy.max_backoff = Duration::from_secs(secs).max(policy.base_backoff);
    }

    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.db_path, "./prospector.db");
        assert_eq!(config.search_api_url, DEFAULT_SEARCH_API_URL);
        assert_eq!(config.cooldown_days, 7);
        assert!(config.instagram_session_id.is_none());
        assert!(config.require_search().is_err());
    }

    #[test]
    fn test_pacing_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("PROSPECTOR_INSTAGRAM_MIN_INTERVAL_MS", "4000"),
            ("PROSPECTOR_INSTAGRAM_CONCURRENCY", "0"),
            ("PROSPECTOR_SEARCH_TIMEOUT_SECS", "30"),
        ]))
        .unwrap();
        let policy = |kind| {
            config
                .source_policies
                .iter()
                .find(|(k, _)| *k == kind)
                .map(|(_, p)| p.clone())
                .unwrap()
        };
        assert_eq!(policy(SourceKind::Instagram).min_interval, Duration::from_millis(4_000));
        assert_eq!(policy(SourceKind::Instagram).max_concurrency, 1);
        assert_eq!(policy(SourceKind::Search).timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_number_is_an_error() {
        let err = Config::from_lookup(lookup(&[("PROSPECTOR_COOLDOWN_DAYS", "a week")])).unwrap_err();
        assert!(err.to_string().contains("PROSPECTOR_COOLDOWN_DAYS"));
    }

    #[test]
    fn test_search_credentials_and_settings() {
        let config = Config::from_lookup(lookup(&[
            ("SEARCH_API_KEY", "key"),
            ("SEARCH_ENGINE_ID", "cx"),
            ("PROSPECTOR_STALE_RUN_MINUTES", "5"),
        ]))
        .unwrap();
        assert!(config.require_search().is_ok());
        assert_eq!(
            config.pipeline_settings().stale_run_after,
            chrono::Duration::minutes(5)
        );
    }
}
