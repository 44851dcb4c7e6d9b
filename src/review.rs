//! Admin review workflow.
//!
//! Flagged risk records land in an admin inbox, receive a review decision,
//! and gate downstream auto-processing. Review never re-scores: decisions
//! append audit entries to the evaluation history with the score unchanged.
//! Admin overrides are a separate, stronger handle that clears the flag
//! independently of the review state.

use crate::store::{AuditEvent, AuditSink, RiskRecordPersistence};
use crate::{EvaluationLogEntry, ReviewStatus, RiskError, RiskLevel, RiskRecord};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// History entry tags for admin actions.
pub const ADMIN_REVIEW_RULE: &str = "ADMIN_REVIEW";
pub const ADMIN_OVERRIDE_RULE: &str = "ADMIN_OVERRIDE";

/// Decision an admin can apply to a flagged record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Approved,
    Rejected,
    Escalated,
}

impl From<ReviewDecision> for ReviewStatus {
    fn from(decision: ReviewDecision) -> Self {
        match decision {
            ReviewDecision::Approved => ReviewStatus::Approved,
            ReviewDecision::Rejected => ReviewStatus::Rejected,
            ReviewDecision::Escalated => ReviewStatus::Escalated,
        }
    }
}

/// Inbox filter. The default view shows unreviewed records only.
#[derive(Debug, Clone)]
pub struct FlaggedFilter {
    pub risk_level: Option<RiskLevel>,
    /// `None` means any review status.
    pub review_status: Option<ReviewStatus>,
    pub min_score: Option<u32>,
    pub max_score: Option<u32>,
}

impl Default for FlaggedFilter {
    fn default() -> Self {
        Self {
            risk_level: None,
            review_status: Some(ReviewStatus::PendingReview),
            min_score: None,
            max_score: None,
        }
    }
}

impl FlaggedFilter {
    /// Inbox view across every review status.
    pub fn any_status() -> Self {
        Self {
            review_status: None,
            ..Default::default()
        }
    }
}

/// Admin-facing review operations over risk records.
pub struct ReviewWorkflow {
    records: Arc<dyn RiskRecordPersistence>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl ReviewWorkflow {
    pub fn new(records: Arc<dyn RiskRecordPersistence>) -> Self {
        Self {
            records,
            audit: None,
        }
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Page through flagged, non-overridden records. `page` is 1-based.
    pub fn list_flagged(
        &self,
        filter: &FlaggedFilter,
        page: usize,
        limit: usize,
    ) -> Result<(Vec<RiskRecord>, usize), RiskError> {
        let query = crate::store::RiskRecordFilter {
            flagged_only: true,
            exclude_overridden: true,
            risk_level: filter.risk_level,
            review_status: filter.review_status,
            min_score: filter.min_score,
            max_score: filter.max_score,
        };
        self.records.query(&query, page, limit)
    }

    /// Apply an admin decision. Re-review is allowed; no state is terminal
    /// here.
    pub fn review(
        &self,
        risk_record_id: &str,
        admin_id: &str,
        decision: ReviewDecision,
        notes: Option<String>,
        allow_auto_processing: Option<bool>,
    ) -> Result<RiskRecord, RiskError> {
        let mut record = self.records.find_by_id(risk_record_id)?.ok_or_else(|| {
            RiskError::NotFound(format!("no risk record with id {}", risk_record_id))
        })?;

        let now = Utc::now();
        record.review_status = decision.into();
        record.reviewed_by = Some(admin_id.to_string());
        record.reviewed_at = Some(now);
        record.admin_notes = notes;

        // Audit entry, not a re-scoring: the score is unchanged.
        let mut entry = EvaluationLogEntry {
            evaluated_at: now,
            previous_score: record.risk_score,
            new_score: record.risk_score,
            factors: Vec::new(),
            triggered_rules: vec![ADMIN_REVIEW_RULE.to_string()],
            evaluated_by: Some(admin_id.to_string()),
            metadata: Default::default(),
        };
        entry
            .metadata
            .insert("decision".to_string(), record.review_status.to_string());
        if let Some(allow) = allow_auto_processing {
            entry
                .metadata
                .insert("allow_auto_processing".to_string(), allow.to_string());
        }
        record.evaluation_history.push(entry);
        record.updated_at = now;

        self.records.update(&record)?;

        info!(
            risk_record_id,
            admin_id,
            status = %record.review_status,
            "review decision applied"
        );
        self.emit(AuditEvent::ReviewApplied {
            risk_record_id: risk_record_id.to_string(),
            admin_id: admin_id.to_string(),
            status: record.review_status,
            at: now,
        });

        Ok(record)
    }

    /// Whether the transaction may proceed without human intervention.
    ///
    /// A transaction with no risk record was never scored and passes. A
    /// flagged record still pending or escalated blocks, as does any
    /// rejected record; everything else passes.
    pub fn can_auto_process(&self, transaction_id: &str) -> Result<bool, RiskError> {
        let record = match self.records.find_by_transaction_id(transaction_id)? {
            Some(record) => record,
            None => return Ok(true),
        };

        if record.review_status == ReviewStatus::Rejected {
            return Ok(false);
        }
        if record.is_flagged
            && matches!(
                record.review_status,
                ReviewStatus::PendingReview | ReviewStatus::Escalated
            )
        {
            return Ok(false);
        }
        Ok(true)
    }

    /// Force a record past the normal workflow. Distinct from review: the
    /// override flag, actor, and reason are recorded, and `clear_flag`
    /// decides the resulting flag state (cleared when omitted).
    pub fn admin_override(
        &self,
        transaction_id: &str,
        admin_id: &str,
        reason: &str,
        clear_flag: Option<bool>,
        override_level: Option<RiskLevel>,
    ) -> Result<RiskRecord, RiskError> {
        let mut record = self
            .records
            .find_by_transaction_id(transaction_id)?
            .ok_or_else(|| {
                RiskError::NotFound(format!("no risk record for transaction {}", transaction_id))
            })?;

        let now = Utc::now();
        record.overridden = true;
        record.overridden_by = Some(admin_id.to_string());
        record.override_reason = Some(reason.to_string());
        record.override_level = override_level;
        // `clear_flag` carries the resulting flag state; omitting it
        // clears the flag.
        record.is_flagged = clear_flag.unwrap_or(false);
        let cleared = !record.is_flagged;

        let mut entry = EvaluationLogEntry {
            evaluated_at: now,
            previous_score: record.risk_score,
            new_score: record.risk_score,
            factors: Vec::new(),
            triggered_rules: vec![ADMIN_OVERRIDE_RULE.to_string()],
            evaluated_by: Some(admin_id.to_string()),
            metadata: Default::default(),
        };
        entry
            .metadata
            .insert("reason".to_string(), reason.to_string());
        entry
            .metadata
            .insert("cleared_flag".to_string(), cleared.to_string());
        record.evaluation_history.push(entry);
        record.updated_at = now;

        self.records.update(&record)?;

        warn!(
            transaction_id,
            admin_id, cleared_flag = cleared, "admin override applied"
        );
        self.emit(AuditEvent::OverrideApplied {
            transaction_id: transaction_id.to_string(),
            admin_id: admin_id.to_string(),
            cleared_flag: cleared,
            at: now,
        });

        Ok(record)
    }

    fn emit(&self, event: AuditEvent) {
        if let Some(sink) = &self.audit {
            if let Err(e) = sink.emit(&event) {
                warn!(error = %e, "audit sink emit failed, continuing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRiskRecordStore;

    fn seeded(
        records: &[(&str, u32, bool)],
    ) -> (Arc<InMemoryRiskRecordStore>, ReviewWorkflow, Vec<String>) {
        let store = Arc::new(InMemoryRiskRecordStore::new());
        let mut ids = Vec::new();
        for (txn, score, flagged) in records {
            let mut record = RiskRecord::new(txn.to_string(), Some("USER-1".to_string()));
            record.risk_score = *score;
            record.is_flagged = *flagged;
            if *flagged {
                record.flagged_at = Some(Utc::now());
            }
            store.insert(&record).unwrap();
            ids.push(record.id.clone());
        }
        let workflow = ReviewWorkflow::new(store.clone());
        (store, workflow, ids)
    }

    #[test]
    fn test_list_flagged_default_inbox() {
        let (_, workflow, _) = seeded(&[
            ("TXN-1", 80, true),
            ("TXN-2", 10, false),
            ("TXN-3", 95, true),
        ]);

        let (items, total) = workflow
            .list_flagged(&FlaggedFilter::default(), 1, 10)
            .unwrap();

        assert_eq!(total, 2);
        assert!(items.iter().all(|r| r.is_flagged));
    }

    #[test]
    fn test_list_flagged_excludes_overridden() {
        let (store, workflow, _) = seeded(&[("TXN-1", 80, true), ("TXN-2", 85, true)]);

        workflow
            .admin_override("TXN-1", "ADMIN-1", "false positive", Some(true), None)
            .unwrap();

        let (items, total) = workflow
            .list_flagged(&FlaggedFilter::default(), 1, 10)
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(items[0].transaction_id, "TXN-2");

        // The overridden record still exists, it is just out of the inbox.
        assert!(store.find_by_transaction_id("TXN-1").unwrap().is_some());
    }

    #[test]
    fn test_list_flagged_score_filter() {
        let (_, workflow, _) = seeded(&[("TXN-1", 75, true), ("TXN-2", 95, true)]);

        let filter = FlaggedFilter {
            min_score: Some(90),
            ..FlaggedFilter::default()
        };
        let (items, total) = workflow.list_flagged(&filter, 1, 10).unwrap();
        assert_eq!(total, 1);
        assert_eq!(items[0].transaction_id, "TXN-2");
    }

    #[test]
    fn test_review_applies_decision_without_rescoring() {
        let (_, workflow, ids) = seeded(&[("TXN-1", 80, true)]);

        let record = workflow
            .review(
                &ids[0],
                "ADMIN-1",
                ReviewDecision::Approved,
                Some("checked with the customer".to_string()),
                Some(true),
            )
            .unwrap();

        assert_eq!(record.review_status, ReviewStatus::Approved);
        assert_eq!(record.reviewed_by.as_deref(), Some("ADMIN-1"));
        assert!(record.reviewed_at.is_some());
        assert_eq!(record.risk_score, 80);

        let entry = record.evaluation_history.last().unwrap();
        assert_eq!(entry.triggered_rules, vec![ADMIN_REVIEW_RULE.to_string()]);
        assert_eq!(entry.previous_score, entry.new_score);
        assert_eq!(entry.evaluated_by.as_deref(), Some("ADMIN-1"));
        assert_eq!(
            entry.metadata.get("allow_auto_processing").map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn test_review_unknown_record() {
        let (_, workflow, _) = seeded(&[]);
        let err = workflow
            .review("no-such-id", "ADMIN-1", ReviewDecision::Approved, None, None)
            .unwrap_err();
        assert!(matches!(err, RiskError::NotFound(_)));
    }

    #[test]
    fn test_re_review_is_allowed() {
        let (_, workflow, ids) = seeded(&[("TXN-1", 80, true)]);

        workflow
            .review(&ids[0], "ADMIN-1", ReviewDecision::Escalated, None, None)
            .unwrap();
        let record = workflow
            .review(&ids[0], "ADMIN-2", ReviewDecision::Rejected, None, None)
            .unwrap();

        assert_eq!(record.review_status, ReviewStatus::Rejected);
        assert_eq!(record.evaluation_history.len(), 2);
    }

    #[test]
    fn test_can_auto_process_transitions() {
        let (_, workflow, ids) = seeded(&[("TXN-1", 80, true)]);

        // No record at all: never scored, passes.
        assert!(workflow.can_auto_process("TXN-UNKNOWN").unwrap());

        // Flagged and pending: blocked.
        assert!(!workflow.can_auto_process("TXN-1").unwrap());

        workflow
            .review(&ids[0], "ADMIN-1", ReviewDecision::Approved, None, Some(true))
            .unwrap();
        assert!(workflow.can_auto_process("TXN-1").unwrap());
    }

    #[test]
    fn test_can_auto_process_rejected_blocks() {
        let (_, workflow, ids) = seeded(&[("TXN-1", 10, false)]);

        workflow
            .review(&ids[0], "ADMIN-1", ReviewDecision::Rejected, None, None)
            .unwrap();

        // Rejected blocks even when the record was never flagged.
        assert!(!workflow.can_auto_process("TXN-1").unwrap());
    }

    #[test]
    fn test_can_auto_process_escalated() {
        let (_, workflow, ids) = seeded(&[("TXN-1", 80, true), ("TXN-2", 10, false)]);

        workflow
            .review(&ids[0], "ADMIN-1", ReviewDecision::Escalated, None, None)
            .unwrap();
        workflow
            .review(&ids[1], "ADMIN-1", ReviewDecision::Escalated, None, None)
            .unwrap();

        // Escalated and still flagged: nobody cleared it, stays blocked.
        assert!(!workflow.can_auto_process("TXN-1").unwrap());
        // Escalated but never flagged: passes.
        assert!(workflow.can_auto_process("TXN-2").unwrap());
    }

    #[test]
    fn test_admin_override_clears_flag_by_default() {
        let (_, workflow, _) = seeded(&[("TXN-1", 80, true)]);

        let record = workflow
            .admin_override(
                "TXN-1",
                "ADMIN-1",
                "verified with issuing bank",
                None,
                Some(RiskLevel::Low),
            )
            .unwrap();

        assert!(record.overridden);
        assert_eq!(record.overridden_by.as_deref(), Some("ADMIN-1"));
        assert_eq!(record.override_level, Some(RiskLevel::Low));
        assert!(!record.is_flagged);

        // Clearing the flag opens the auto-processing gate.
        assert!(workflow.can_auto_process("TXN-1").unwrap());

        let entry = record.evaluation_history.last().unwrap();
        assert_eq!(entry.triggered_rules, vec![ADMIN_OVERRIDE_RULE.to_string()]);
    }

    #[test]
    fn test_admin_override_can_keep_flag_set() {
        let (_, workflow, _) = seeded(&[("TXN-1", 80, true)]);

        let record = workflow
            .admin_override("TXN-1", "ADMIN-1", "keeping on file", Some(true), None)
            .unwrap();

        assert!(record.overridden);
        assert!(record.is_flagged);
        // Still flagged and pending, so the gate stays shut.
        assert!(!workflow.can_auto_process("TXN-1").unwrap());

        // Overridden records leave the inbox regardless of the flag.
        let (_, total) = workflow
            .list_flagged(&FlaggedFilter::default(), 1, 10)
            .unwrap();
        assert_eq!(total, 0);
    }

    #[test]
    fn test_admin_override_requires_existing_record() {
        let (_, workflow, _) = seeded(&[]);
        let err = workflow
            .admin_override("TXN-GHOST", "ADMIN-1", "n/a", None, None)
            .unwrap_err();
        assert!(matches!(err, RiskError::NotFound(_)));
    }

    #[test]
    fn test_override_independent_of_review_status() {
        let (_, workflow, ids) = seeded(&[("TXN-1", 80, true)]);

        workflow
            .review(&ids[0], "ADMIN-1", ReviewDecision::Escalated, None, None)
            .unwrap();
        let record = workflow
            .admin_override("TXN-1", "ADMIN-2", "management call", Some(true), None)
            .unwrap();

        // Review status survives the override untouched.
        assert_eq!(record.review_status, ReviewStatus::Escalated);
        assert!(record.overridden);
    }
}
