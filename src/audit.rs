//! Compliance statistics and evaluation-log export.
//!
//! Read-only derivations over stored risk records: point-in-time
//! statistics for dashboards, ranged audit reports, and JSON/CSV export
//! for compliance extraction.

use crate::review::{ADMIN_OVERRIDE_RULE, ADMIN_REVIEW_RULE};
use crate::store::{RiskRecordFilter, RiskRecordPersistence};
use crate::{ReviewStatus, RiskError, RiskLevel, RiskRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;

/// Export serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

/// Point-in-time aggregates over all risk records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskStatistics {
    pub total_flagged: usize,
    pub pending_review: usize,
    pub approved: usize,
    pub rejected: usize,
    pub escalated: usize,
    pub average_risk_score: f64,
    pub counts_by_level: BTreeMap<String, usize>,
}

/// Rule name frequency inside an audit report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorFrequency {
    pub rule: String,
    pub count: usize,
}

/// Aggregates over records created in a time range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub total_evaluations: usize,
    pub flagged_count: usize,
    pub reviewed_count: usize,
    pub average_risk_score: f64,
    pub top_risk_factors: Vec<FactorFrequency>,
}

/// Maximum rule names listed in a report.
const TOP_FACTOR_LIMIT: usize = 10;

/// Read-only statistics and export over risk records.
pub struct AuditReporter {
    records: Arc<dyn RiskRecordPersistence>,
}

impl AuditReporter {
    pub fn new(records: Arc<dyn RiskRecordPersistence>) -> Self {
        Self { records }
    }

    /// Aggregates over the whole record store.
    pub fn statistics(&self) -> Result<RiskStatistics, RiskError> {
        let flagged = RiskRecordFilter {
            flagged_only: true,
            ..Default::default()
        };
        let by_status = |status: ReviewStatus| RiskRecordFilter {
            review_status: Some(status),
            ..Default::default()
        };

        let mut counts_by_level = BTreeMap::new();
        for level in [
            RiskLevel::Low,
            RiskLevel::Medium,
            RiskLevel::High,
            RiskLevel::Critical,
        ] {
            let filter = RiskRecordFilter {
                risk_level: Some(level),
                ..Default::default()
            };
            counts_by_level.insert(level.to_string(), self.records.count(&filter)?);
        }

        Ok(RiskStatistics {
            total_flagged: self.records.count(&flagged)?,
            pending_review: self.records.count(&by_status(ReviewStatus::PendingReview))?,
            approved: self.records.count(&by_status(ReviewStatus::Approved))?,
            rejected: self.records.count(&by_status(ReviewStatus::Rejected))?,
            escalated: self.records.count(&by_status(ReviewStatus::Escalated))?,
            average_risk_score: self.records.average_risk_score()?,
            counts_by_level,
        })
    }

    /// Aggregates over records created in `[from, to)`. Admin review and
    /// override entries are audit markers, not risk rules, so they stay
    /// out of the factor frequencies.
    pub fn generate_audit_report(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<AuditReport, RiskError> {
        let records = self.records.find_created_between(from, to)?;

        let total_evaluations = records.len();
        let flagged_count = records.iter().filter(|r| r.is_flagged).count();
        let reviewed_count = records.iter().filter(|r| r.is_reviewed()).count();
        let average_risk_score = if records.is_empty() {
            0.0
        } else {
            records.iter().map(|r| r.risk_score as f64).sum::<f64>() / records.len() as f64
        };

        let mut frequencies: HashMap<String, usize> = HashMap::new();
        for record in &records {
            for entry in &record.evaluation_history {
                for rule in &entry.triggered_rules {
                    if rule == ADMIN_REVIEW_RULE || rule == ADMIN_OVERRIDE_RULE {
                        continue;
                    }
                    *frequencies.entry(rule.clone()).or_default() += 1;
                }
            }
        }
        let mut top_risk_factors: Vec<FactorFrequency> = frequencies
            .into_iter()
            .map(|(rule, count)| FactorFrequency { rule, count })
            .collect();
        top_risk_factors.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.rule.cmp(&b.rule)));
        top_risk_factors.truncate(TOP_FACTOR_LIMIT);

        info!(
            total_evaluations,
            flagged_count, reviewed_count, "audit report generated"
        );

        Ok(AuditReport {
            from,
            to,
            total_evaluations,
            flagged_count,
            reviewed_count,
            average_risk_score,
            top_risk_factors,
        })
    }

    /// Serialize the records created in `[from, to)` for compliance
    /// extraction. Read-only, no side effects.
    pub fn export_evaluation_logs(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        format: ExportFormat,
    ) -> Result<String, RiskError> {
        let records = self.records.find_created_between(from, to)?;

        match format {
            ExportFormat::Json => serde_json::to_string_pretty(&records)
                .map_err(|e| RiskError::ExportFailure(e.to_string())),
            ExportFormat::Csv => Ok(to_csv(&records)),
        }
    }
}

fn to_csv(records: &[RiskRecord]) -> String {
    let mut out = String::from(
        "record_id,transaction_id,user_id,risk_score,risk_level,is_flagged,\
         review_status,overridden,evaluations,triggered_rules,created_at,updated_at\n",
    );
    for record in records {
        let rules: Vec<&str> = record
            .risk_factors
            .iter()
            .map(|f| f.rule.as_str())
            .collect();
        out.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{},{},{}\n",
            record.id,
            record.transaction_id,
            record.user_id.as_deref().unwrap_or(""),
            record.risk_score,
            record.risk_level,
            record.is_flagged,
            record.review_status,
            record.overridden,
            record.evaluation_history.len(),
            rules.join("|"),
            record.created_at.to_rfc3339(),
            record.updated_at.to_rfc3339(),
        ));
    }
    out
}
