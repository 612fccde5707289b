// Promotion pipeline — moves vetted prospects into the canonical store.
//
// Promotion is an upsert keyed by the prospect's fingerprints: one canonical
// match gets the new evidence merged in, no match creates a profile, and
// several distinct matches are refused as a conflict. The lookup and the
// write happen under the same fingerprint locks runs use, so a promotion
// can't race a run (or another promotion) into creating a second profile.

use std::sync::Arc;

use anyhow::anyhow;
use tracing::{info, warn};

use super::dedup::{fingerprints, handle_keys, DedupEngine, MatchOutcome};
use crate::db::models::{
    CanonicalProfile, InfluencerProspect, ProfileDraft, ProspectStatus, Provenance,
};
use crate::db::Database;
use crate::error::PipelineError;

pub struct Promoter {
    db: Arc<dyn Database>,
    dedup: DedupEngine,
}

impl Promoter {
    /// `dedup` should be the engine the orchestrator uses so both share one
    /// lock table.
    pub fn new(db: Arc<dyn Database>, dedup: DedupEngine) -> Self {
        Self { db, dedup }
    }

    async fn pending_prospect(&self, prospect_id: i64) -> Result<InfluencerProspect, PipelineError> {
        let prospect = self
            .db
            .get_prospect(prospect_id)
            .await?
            .ok_or(PipelineError::ProspectNotFound(prospect_id))?;
        if prospect.status != ProspectStatus::Pending {
            return Err(PipelineError::AlreadyProcessed {
                prospect_id,
                status: prospect.status.to_string(),
            });
        }
        Ok(prospect)
    }

    async fn already_processed(&self, prospect_id: i64) -> PipelineError {
        let status = match self.db.get_prospect(prospect_id).await {
            Ok(Some(p)) => p.status.to_string(),
            _ => "unknown".to_string(),
        };
        PipelineError::AlreadyProcessed {
            prospect_id,
            status,
        }
    }

    /// Provenance for a prospect: how its run found it and with which keywords.
    async fn provenance(&self, prospect: &InfluencerProspect) -> Result<Provenance, PipelineError> {
        let run = self.db.get_run(prospect.run_id).await?;
        let (found_by, source_hashtags) = match run {
            Some(run) => {
                let keywords = self
                    .db
                    .get_config(run.config_id)
                    .await?
                    .map(|c| c.include_keywords)
                    .unwrap_or_default();
                (run.run_type.provenance().to_string(), keywords)
            }
            None => (String::new(), Vec::new()),
        };
        Ok(Provenance {
            found_by,
            source_hashtags,
            source_country: prospect.fields.country.clone(),
        })
    }

    /// Promote a pending prospect and return the canonical profile it became
    /// (new, or the existing one it was merged into).
    pub async fn promote_prospect(&self, prospect_id: i64) -> Result<CanonicalProfile, PipelineError> {
        let prospect = self.pending_prospect(prospect_id).await?;
        let fps = fingerprints(&prospect.fields);
        let _guard = self.dedup.lock(&fps).await;

        // Re-check under the lock; a concurrent promote may have won
        let prospect = self.pending_prospect(prospect.id).await?;
        let provenance = self.provenance(&prospect).await?;
        let draft = ProfileDraft {
            fields: prospect.fields.clone(),
            provenance,
        };

        let (profile_id, merged) = match self.dedup.find_canonical_match(&fps).await? {
            MatchOutcome::Unique => (self.db.insert_profile(&draft).await?, false),
            MatchOutcome::Duplicate(record) => {
                self.db.merge_profile_evidence(record.id, &draft).await?;
                (record.id, true)
            }
            MatchOutcome::Conflict(records) => {
                if let Some(handle) = prospect.fields.handles.first() {
                    let (target, _) = handle_keys(handle);
                    self.db
                        .insert_conflict(Some(prospect.run_id), handle.platform, &target, &records)
                        .await?;
                }
                warn!(prospect_id, matches = records.len(), "Promotion refused: ambiguous canonical match");
                return Err(PipelineError::Conflict {
                    prospect_id,
                    records,
                });
            }
        };

        if !self
            .db
            .review_prospect(prospect_id, ProspectStatus::Converted, None, Some(profile_id))
            .await?
        {
            return Err(self.already_processed(prospect_id).await);
        }

        info!(prospect_id, profile_id, merged, "Prospect promoted");

        let profile = self
            .db
            .get_profile(profile_id)
            .await?
            .ok_or_else(|| anyhow!("canonical profile {profile_id} vanished after promotion"))?;
        Ok(profile)
    }

    /// Reject a pending prospect. Rejecting twice is an error and keeps the
    /// first notes.
    pub async fn reject_prospect(
        &self,
        prospect_id: i64,
        notes: &str,
    ) -> Result<InfluencerProspect, PipelineError> {
        self.pending_prospect(prospect_id).await?;

        let notes = notes.trim();
        let notes = (!notes.is_empty()).then_some(notes);
        if !self
            .db
            .review_prospect(prospect_id, ProspectStatus::Rejected, notes, None)
            .await?
        {
            return Err(self.already_processed(prospect_id).await);
        }

        info!(prospect_id, "Prospect rejected");
        self.db
            .get_prospect(prospect_id)
            .await?
            .ok_or(PipelineError::ProspectNotFound(prospect_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{
        Platform, PlatformHandle, ProfileDraft, ProfileFields, ProspectDraft, Provenance, RunType,
        ScrapingConfig,
    };
    use crate::db::open_sqlite_in_memory;

    fn fields(handle: &str, email: Option<&str>) -> ProfileFields {
        ProfileFields {
            display_name: Some(handle.to_string()),
            bio: None,
            avatar_url: None,
            country: Some("CZ".to_string()),
            email: email.map(str::to_string),
            handles: vec![PlatformHandle {
                platform: Platform::Instagram,
                handle: handle.to_string(),
                url: None,
                followers: Some(10_000),
                raw: None,
            }],
            total_followers: 10_000,
        }
    }

    async fn setup() -> (Arc<dyn Database>, Promoter, i64) {
        let db = open_sqlite_in_memory().unwrap();
        let config = ScrapingConfig {
            countries: vec!["CZ".to_string()],
            min_followers: 0,
            max_followers: 100_000,
            include_keywords: vec!["fashion".to_string()],
            exclude_keywords: vec![],
            platforms: vec![Platform::Instagram],
            result_count: 5,
        };
        let config_id = db.insert_config(&config).await.unwrap();
        let run_id = db.insert_run(config_id, RunType::Discovery, &[]).await.unwrap();
        db.add_run_found(run_id, 10).await.unwrap();
        let promoter = Promoter::new(db.clone(), DedupEngine::new(db.clone()));
        (db, promoter, run_id)
    }

    async fn prospect(db: &Arc<dyn Database>, run_id: i64, fields: ProfileFields) -> i64 {
        db.insert_prospect(&ProspectDraft { run_id, fields })
            .await
            .unwrap()
            .created()
            .unwrap()
    }

    #[tokio::test]
    async fn test_promote_creates_profile_with_provenance() {
        let (db, promoter, run_id) = setup().await;
        let id = prospect(&db, run_id, fields("anna", None)).await;

        let profile = promoter.promote_prospect(id).await.unwrap();
        assert_eq!(profile.provenance.found_by, "search_discovery");
        assert_eq!(profile.provenance.source_hashtags, vec!["fashion"]);
        assert_eq!(profile.provenance.source_country.as_deref(), Some("CZ"));

        let converted = db.get_prospect(id).await.unwrap().unwrap();
        assert_eq!(converted.status, ProspectStatus::Converted);
        assert_eq!(converted.canonical_profile_id, Some(profile.id));
    }

    #[tokio::test]
    async fn test_promote_twice_is_already_processed() {
        let (db, promoter, run_id) = setup().await;
        let id = prospect(&db, run_id, fields("anna", None)).await;
        promoter.promote_prospect(id).await.unwrap();

        let err = promoter.promote_prospect(id).await.unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyProcessed { .. }));
        assert_eq!(db.count_profiles().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_promotion_merges_into_existing_profile() {
        let (db, promoter, run_id) = setup().await;
        // Same email, different handles: both resolve to one canonical profile
        let first = prospect(&db, run_id, fields("anna", Some("anna@studio.cz"))).await;
        let second = prospect(&db, run_id, fields("anna.style", Some("Anna@Studio.cz"))).await;

        let a = promoter.promote_prospect(first).await.unwrap();
        let b = promoter.promote_prospect(second).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(db.count_profiles().await.unwrap(), 1);
        assert_eq!(b.fields.handles.len(), 2);
    }

    #[tokio::test]
    async fn test_reject_twice_keeps_first_notes() {
        let (db, promoter, run_id) = setup().await;
        let id = prospect(&db, run_id, fields("anna", None)).await;

        let rejected = promoter.reject_prospect(id, "not a fit").await.unwrap();
        assert_eq!(rejected.status, ProspectStatus::Rejected);

        let err = promoter.reject_prospect(id, "second thoughts").await.unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyProcessed { ref status, .. } if status == "rejected"));

        let unchanged = db.get_prospect(id).await.unwrap().unwrap();
        assert_eq!(unchanged.notes.as_deref(), Some("not a fit"));
        assert_eq!(unchanged.status, ProspectStatus::Rejected);
    }

    #[tokio::test]
    async fn test_rejected_prospect_cannot_be_promoted() {
        let (db, promoter, run_id) = setup().await;
        let id = prospect(&db, run_id, fields("anna", None)).await;
        promoter.reject_prospect(id, "spam").await.unwrap();
        assert!(matches!(
            promoter.promote_prospect(id).await,
            Err(PipelineError::AlreadyProcessed { .. })
        ));
        assert_eq!(db.count_profiles().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ambiguous_promotion_is_flagged_once() {
        let (db, promoter, run_id) = setup().await;
        for fields in [fields("anna", None), fields("studio.anna", Some("anna@studio.cz"))] {
            db.insert_profile(&ProfileDraft {
                fields,
                provenance: Provenance::default(),
            })
            .await
            .unwrap();
        }
        let id = prospect(&db, run_id, fields("ANNA", Some("anna@studio.cz"))).await;

        for _ in 0..2 {
            let err = promoter.promote_prospect(id).await.unwrap_err();
            assert!(matches!(err, PipelineError::Conflict { ref records, .. } if records.len() == 2));
        }

        let conflicts = db.list_conflicts(10).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].target, "anna");
        let pending = db.get_prospect(id).await.unwrap().unwrap();
        assert_eq!(pending.status, ProspectStatus::Pending);
    }

    #[tokio::test]
    async fn test_missing_prospect() {
        let (_, promoter, _) = setup().await;
        assert!(matches!(
            promoter.reject_prospect(404, "x").await,
            Err(PipelineError::ProspectNotFound(404))
        ));
    }
}
