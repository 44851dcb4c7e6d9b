//! Windowed transaction velocity aggregation.
//!
//! Computes per-user counts and volumes over trailing windows ending at an
//! `as_of` instant. Reads tolerate concurrent writers: a transaction that
//! commits mid-computation may or may not be included in the window.

use crate::store::TransactionStore;
use crate::RiskError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Velocity window configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VelocityConfig {
    /// Short trailing window, used for burst detection.
    pub short_window_minutes: i64,
    /// Long trailing window, used for volume and average analysis.
    pub long_window_hours: i64,
}

impl Default for VelocityConfig {
    fn default() -> Self {
        Self {
            short_window_minutes: 60,
            long_window_hours: 24,
        }
    }
}

/// Point-in-time velocity snapshot for a user.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VelocityData {
    pub count_1h: u64,
    pub amount_1h: f64,
    pub count_24h: u64,
    pub amount_24h: f64,
    pub avg_amount_24h: f64,
}

/// Read-only velocity computer over the transaction ledger.
pub struct VelocityAggregator {
    transactions: Arc<dyn TransactionStore>,
    config: VelocityConfig,
}

impl VelocityAggregator {
    pub fn new(transactions: Arc<dyn TransactionStore>) -> Self {
        Self {
            transactions,
            config: VelocityConfig::default(),
        }
    }

    pub fn with_config(transactions: Arc<dyn TransactionStore>, config: VelocityConfig) -> Self {
        Self {
            transactions,
            config,
        }
    }

    /// Compute windowed totals for the user relative to `as_of`.
    pub fn compute(
        &self,
        user_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<VelocityData, RiskError> {
        let short_from = as_of - Duration::minutes(self.config.short_window_minutes);
        let long_from = as_of - Duration::hours(self.config.long_window_hours);

        let short = self
            .transactions
            .count_and_sum_in_window(user_id, short_from, as_of)?;
        let long = self
            .transactions
            .count_and_sum_in_window(user_id, long_from, as_of)?;

        let avg_amount_24h = if long.count == 0 {
            0.0
        } else {
            long.total_amount / long.count as f64
        };

        Ok(VelocityData {
            count_1h: short.count,
            amount_1h: short.total_amount,
            count_24h: long.count,
            amount_24h: long.total_amount,
            avg_amount_24h,
        })
    }
}
