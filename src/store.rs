//! Collaborator interfaces consumed by the risk engine.
//!
//! The engine talks to transaction, device, and risk-record persistence
//! through narrow traits; no storage technology is mandated. In-memory
//! implementations backed by `parking_lot` locks are provided for tests,
//! demos, and embedding without an external store.

use crate::device_trust::DeviceTrustRecord;
use crate::{ReviewStatus, RiskError, RiskLevel, RiskRecord};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Transaction lifecycle state as seen by the risk engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Transaction projection used for velocity analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub user_id: String,
    pub amount: f64,
    pub currency: String,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

/// Count and sum of a user's transactions inside a window.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WindowTotals {
    pub count: u64,
    pub total_amount: f64,
}

/// Read access to the transaction ledger.
pub trait TransactionStore: Send + Sync {
    fn find_by_id(&self, id: &str) -> Result<Option<Transaction>, RiskError>;

    /// Count and sum the user's transactions created in `(from, to]`.
    /// Failed transactions are excluded.
    fn count_and_sum_in_window(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<WindowTotals, RiskError>;
}

/// Persistence for device trust records, keyed by (user, device).
pub trait DevicePersistence: Send + Sync {
    fn find_by_user_and_key(
        &self,
        user_id: &str,
        device_key: &str,
    ) -> Result<Option<DeviceTrustRecord>, RiskError>;

    fn save(&self, record: &DeviceTrustRecord) -> Result<(), RiskError>;
}

/// Query filter over risk records.
#[derive(Debug, Clone, Default)]
pub struct RiskRecordFilter {
    pub flagged_only: bool,
    pub exclude_overridden: bool,
    pub risk_level: Option<RiskLevel>,
    pub review_status: Option<ReviewStatus>,
    pub min_score: Option<u32>,
    pub max_score: Option<u32>,
}

impl RiskRecordFilter {
    pub fn matches(&self, record: &RiskRecord) -> bool {
        if self.flagged_only && !record.is_flagged {
            return false;
        }
        if self.exclude_overridden && record.overridden {
            return false;
        }
        if let Some(level) = self.risk_level {
            if record.risk_level != level {
                return false;
            }
        }
        if let Some(status) = self.review_status {
            if record.review_status != status {
                return false;
            }
        }
        if let Some(min) = self.min_score {
            if record.risk_score < min {
                return false;
            }
        }
        if let Some(max) = self.max_score {
            if record.risk_score > max {
                return false;
            }
        }
        true
    }
}

/// Persistence for risk records. `insert` enforces the transaction_id
/// uniqueness invariant by returning `Conflict` for duplicates; the engine
/// resolves that race internally.
pub trait RiskRecordPersistence: Send + Sync {
    fn find_by_id(&self, id: &str) -> Result<Option<RiskRecord>, RiskError>;

    fn find_by_transaction_id(&self, transaction_id: &str)
        -> Result<Option<RiskRecord>, RiskError>;

    fn insert(&self, record: &RiskRecord) -> Result<(), RiskError>;

    fn update(&self, record: &RiskRecord) -> Result<(), RiskError>;

    /// Page through records matching the filter, newest first. `page` is
    /// 1-based. Returns the page items and the total match count.
    fn query(
        &self,
        filter: &RiskRecordFilter,
        page: usize,
        limit: usize,
    ) -> Result<(Vec<RiskRecord>, usize), RiskError>;

    fn count(&self, filter: &RiskRecordFilter) -> Result<usize, RiskError>;

    /// Records created in `[from, to)`.
    fn find_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RiskRecord>, RiskError>;

    fn average_risk_score(&self) -> Result<f64, RiskError>;
}

/// Structured event emitted to an external audit collaborator. The engine
/// never depends on the sink succeeding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEvent {
    EvaluationStarted {
        transaction_id: String,
        at: DateTime<Utc>,
    },
    EvaluationCompleted {
        transaction_id: String,
        risk_score: u32,
        risk_level: RiskLevel,
        at: DateTime<Utc>,
    },
    TransactionFlagged {
        transaction_id: String,
        risk_score: u32,
        flag_reason: Option<String>,
        at: DateTime<Utc>,
    },
    ReviewApplied {
        risk_record_id: String,
        admin_id: String,
        status: ReviewStatus,
        at: DateTime<Utc>,
    },
    OverrideApplied {
        transaction_id: String,
        admin_id: String,
        cleared_flag: bool,
        at: DateTime<Utc>,
    },
}

/// Audit/notification sink. Failures are logged and swallowed by callers.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: &AuditEvent) -> Result<(), RiskError>;
}

/// In-memory transaction ledger.
#[derive(Default)]
pub struct InMemoryTransactionStore {
    transactions: RwLock<Vec<Transaction>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, transaction: Transaction) {
        self.transactions.write().push(transaction);
    }

    pub fn len(&self) -> usize {
        self.transactions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.read().is_empty()
    }
}

impl TransactionStore for InMemoryTransactionStore {
    fn find_by_id(&self, id: &str) -> Result<Option<Transaction>, RiskError> {
        Ok(self.transactions.read().iter().find(|t| t.id == id).cloned())
    }

    fn count_and_sum_in_window(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<WindowTotals, RiskError> {
        let transactions = self.transactions.read();
        let mut totals = WindowTotals::default();
        for t in transactions.iter() {
            if t.user_id == user_id
                && t.status != TransactionStatus::Failed
                && t.created_at > from
                && t.created_at <= to
            {
                totals.count += 1;
                totals.total_amount += t.amount;
            }
        }
        Ok(totals)
    }
}

/// In-memory device trust persistence.
#[derive(Default)]
pub struct InMemoryDeviceStore {
    records: RwLock<HashMap<(String, String), DeviceTrustRecord>>,
}

impl InMemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DevicePersistence for InMemoryDeviceStore {
    fn find_by_user_and_key(
        &self,
        user_id: &str,
        device_key: &str,
    ) -> Result<Option<DeviceTrustRecord>, RiskError> {
        Ok(self
            .records
            .read()
            .get(&(user_id.to_string(), device_key.to_string()))
            .cloned())
    }

    fn save(&self, record: &DeviceTrustRecord) -> Result<(), RiskError> {
        self.records.write().insert(
            (record.user_id.clone(), record.device_key.clone()),
            record.clone(),
        );
        Ok(())
    }
}

/// In-memory risk record store, keyed by transaction id.
#[derive(Default)]
pub struct InMemoryRiskRecordStore {
    records: RwLock<HashMap<String, RiskRecord>>,
}

impl InMemoryRiskRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn matched(&self, filter: &RiskRecordFilter) -> Vec<RiskRecord> {
        let records = self.records.read();
        let mut matched: Vec<RiskRecord> = records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.transaction_id.cmp(&b.transaction_id))
        });
        matched
    }
}

impl RiskRecordPersistence for InMemoryRiskRecordStore {
    fn find_by_id(&self, id: &str) -> Result<Option<RiskRecord>, RiskError> {
        Ok(self.records.read().values().find(|r| r.id == id).cloned())
    }

    fn find_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<Option<RiskRecord>, RiskError> {
        Ok(self.records.read().get(transaction_id).cloned())
    }

    fn insert(&self, record: &RiskRecord) -> Result<(), RiskError> {
        let mut records = self.records.write();
        if records.contains_key(&record.transaction_id) {
            return Err(RiskError::Conflict(format!(
                "risk record already exists for transaction {}",
                record.transaction_id
            )));
        }
        records.insert(record.transaction_id.clone(), record.clone());
        Ok(())
    }

    fn update(&self, record: &RiskRecord) -> Result<(), RiskError> {
        let mut records = self.records.write();
        if !records.contains_key(&record.transaction_id) {
            return Err(RiskError::NotFound(format!(
                "no risk record for transaction {}",
                record.transaction_id
            )));
        }
        records.insert(record.transaction_id.clone(), record.clone());
        Ok(())
    }

    fn query(
        &self,
        filter: &RiskRecordFilter,
        page: usize,
        limit: usize,
    ) -> Result<(Vec<RiskRecord>, usize), RiskError> {
        let matched = self.matched(filter);
        let total = matched.len();
        let page = page.max(1);
        let items = matched
            .into_iter()
            .skip((page - 1) * limit)
            .take(limit)
            .collect();
        Ok((items, total))
    }

    fn count(&self, filter: &RiskRecordFilter) -> Result<usize, RiskError> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| filter.matches(r))
            .count())
    }

    fn find_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RiskRecord>, RiskError> {
        let records = self.records.read();
        let mut matched: Vec<RiskRecord> = records
            .values()
            .filter(|r| r.created_at >= from && r.created_at < to)
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matched)
    }

    fn average_risk_score(&self) -> Result<f64, RiskError> {
        let records = self.records.read();
        if records.is_empty() {
            return Ok(0.0);
        }
        let sum: u64 = records.values().map(|r| r.risk_score as u64).sum();
        Ok(sum as f64 / records.len() as f64)
    }
}

/// Audit sink that records events in memory.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: RwLock<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.read().clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, event: &AuditEvent) -> Result<(), RiskError> {
        self.events.write().push(event.clone());
        Ok(())
    }
}
