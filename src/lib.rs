//! # Transaction Risk Engine
//!
//! A rule-based risk scoring engine for financial transactions.
//!
//! ## Features
//!
//! - **Pluggable Risk Checks**: High-value, rapid-transfer, velocity-anomaly,
//!   and device-trust rules composed through an injected, ordered rule set
//! - **Velocity Analysis**: Windowed transaction counts and volumes per user
//! - **Device Trust Scoring**: Per-(user, device) trust records driven by
//!   login, IP, and geolocation signals with admin overrides
//! - **Review Workflow**: Flagged-record inbox, admin decisions, and an
//!   auto-processing gate for downstream execution
//! - **Audit Reporting**: Point-in-time statistics, ranged audit reports,
//!   and JSON/CSV evaluation-log export for compliance extraction
//!
//! Evaluations are idempotent per transaction: re-scoring the same
//! transaction updates its risk record in place and appends to an
//! append-only evaluation history, never duplicating records.

pub mod audit;
pub mod checks;
pub mod device_trust;
pub mod engine;
pub mod review;
pub mod store;
pub mod velocity;

pub use audit::{AuditReport, AuditReporter, ExportFormat, RiskStatistics};
pub use checks::{default_checks, CheckInputs, RiskCheck, RiskChecksConfig};
pub use device_trust::{
    DeviceContext, DeviceSignal, DeviceTrustConfig, DeviceTrustRecord, DeviceTrustStore, GeoPoint,
    TrustLevel,
};
pub use engine::{RiskEvaluationResult, RiskScoringEngine};
pub use review::{FlaggedFilter, ReviewDecision, ReviewWorkflow};
pub use store::{
    AuditEvent, AuditSink, DevicePersistence, RiskRecordFilter, RiskRecordPersistence,
    Transaction, TransactionStatus, TransactionStore,
};
pub use velocity::{VelocityAggregator, VelocityConfig, VelocityData};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Risk engine errors
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum RiskError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Export failure: {0}")]
    ExportFailure(String),
}

/// Coarse risk bucket derived from the numeric score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: u32, thresholds: &RiskThresholds) -> Self {
        if score >= thresholds.critical_threshold {
            RiskLevel::Critical
        } else if score >= thresholds.auto_flag_threshold {
            RiskLevel::High
        } else if score >= thresholds.medium_threshold {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "LOW"),
            RiskLevel::Medium => write!(f, "MEDIUM"),
            RiskLevel::High => write!(f, "HIGH"),
            RiskLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Admin workflow state of a risk record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewStatus {
    PendingReview,
    Approved,
    Rejected,
    Escalated,
}

impl std::fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReviewStatus::PendingReview => write!(f, "PENDING_REVIEW"),
            ReviewStatus::Approved => write!(f, "APPROVED"),
            ReviewStatus::Rejected => write!(f, "REJECTED"),
            ReviewStatus::Escalated => write!(f, "ESCALATED"),
        }
    }
}

/// Per-call evaluation input. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEvaluationContext {
    pub transaction_id: String,
    pub user_id: Option<String>,
    pub amount: f64,
    pub currency: String,
    pub device_key: Option<String>,
    pub ip_address: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Admin id when an evaluation is re-run manually; recorded in the
    /// evaluation history as `evaluated_by`.
    pub requested_by: Option<String>,
}

impl RiskEvaluationContext {
    pub fn new(
        transaction_id: impl Into<String>,
        amount: f64,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            user_id: None,
            amount,
            currency: currency.into(),
            device_key: None,
            ip_address: None,
            metadata: HashMap::new(),
            requested_by: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_device(mut self, device_key: impl Into<String>) -> Self {
        self.device_key = Some(device_key.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_requested_by(mut self, admin_id: impl Into<String>) -> Self {
        self.requested_by = Some(admin_id.into());
        self
    }
}

/// A single triggered rule's score and explanation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskFactor {
    pub rule: String,
    pub score: u32,
    pub reason: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RiskFactor {
    pub fn new(rule: impl Into<String>, score: u32, reason: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            score,
            reason: reason.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// One entry in a risk record's append-only evaluation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationLogEntry {
    pub evaluated_at: DateTime<Utc>,
    pub previous_score: u32,
    pub new_score: u32,
    pub factors: Vec<RiskFactor>,
    pub triggered_rules: Vec<String>,
    pub evaluated_by: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Durable risk verdict for a transaction. Unique on `transaction_id`;
/// never physically deleted by this subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskRecord {
    pub id: String,
    pub transaction_id: String,
    pub user_id: Option<String>,
    pub risk_score: u32,
    pub risk_level: RiskLevel,
    pub is_flagged: bool,
    pub flagged_at: Option<DateTime<Utc>>,
    pub flag_reason: Option<String>,
    /// Factors from the latest evaluation only.
    pub risk_factors: Vec<RiskFactor>,
    pub evaluation_history: Vec<EvaluationLogEntry>,
    pub review_status: ReviewStatus,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub admin_notes: Option<String>,
    pub overridden: bool,
    pub overridden_by: Option<String>,
    pub override_reason: Option<String>,
    pub override_level: Option<RiskLevel>,
    pub velocity_data: Option<velocity::VelocityData>,
    pub device_context: Option<device_trust::DeviceContext>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RiskRecord {
    /// Zero-value record for a transaction that has not been scored yet.
    pub fn new(transaction_id: impl Into<String>, user_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            transaction_id: transaction_id.into(),
            user_id,
            risk_score: 0,
            risk_level: RiskLevel::Low,
            is_flagged: false,
            flagged_at: None,
            flag_reason: None,
            risk_factors: Vec::new(),
            evaluation_history: Vec::new(),
            review_status: ReviewStatus::PendingReview,
            reviewed_by: None,
            reviewed_at: None,
            admin_notes: None,
            overridden: false,
            overridden_by: None,
            override_reason: None,
            override_level: None,
            velocity_data: None,
            device_context: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_reviewed(&self) -> bool {
        self.review_status != ReviewStatus::PendingReview
    }

    /// Export as JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Score-to-level and flagging thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskThresholds {
    /// Score at or above which the level is MEDIUM.
    pub medium_threshold: u32,
    /// Score at or above which the level is HIGH and the record is flagged
    /// for manual review.
    pub auto_flag_threshold: u32,
    /// Score at or above which the level is CRITICAL.
    pub critical_threshold: u32,
    /// Individual factor score at or above which the factor's name is used
    /// when composing the flag reason.
    pub critical_factor_cutoff: u32,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            medium_threshold: 35,
            auto_flag_threshold: 70,
            critical_threshold: 90,
            critical_factor_cutoff: 30,
        }
    }
}
