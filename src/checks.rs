//! Pluggable risk checks.
//!
//! Each check is a pure evaluator over the shared evaluation context plus
//! read-only auxiliary inputs, returning at most one triggered factor.
//! Checks carry no mutable state and are registered as an ordered list
//! injected into the engine, so new rules can be added without touching
//! the aggregation logic.

use crate::device_trust::{DeviceTrustRecord, TrustLevel};
use crate::velocity::VelocityData;
use crate::{RiskEvaluationContext, RiskFactor};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Rule names as they appear in factors, flag reasons, and history entries.
pub mod rules {
    pub const HIGH_VALUE_TRANSACTION: &str = "HIGH_VALUE_TRANSACTION";
    pub const RAPID_CONSECUTIVE_TRANSFERS: &str = "RAPID_CONSECUTIVE_TRANSFERS";
    pub const VELOCITY_ANOMALY: &str = "VELOCITY_ANOMALY";
    pub const NEW_DEVICE: &str = "NEW_DEVICE";
    pub const UNTRUSTED_DEVICE: &str = "UNTRUSTED_DEVICE";
    pub const RECENT_DEVICE: &str = "RECENT_DEVICE";
}

/// Read-only auxiliary inputs shared by all checks in one evaluation.
pub struct CheckInputs<'a> {
    pub velocity: &'a VelocityData,
    pub device: Option<&'a DeviceTrustRecord>,
    pub as_of: DateTime<Utc>,
}

/// A single risk rule. Implementations must be pure with respect to their
/// inputs; they may run in any order or concurrently.
pub trait RiskCheck: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, ctx: &RiskEvaluationContext, aux: &CheckInputs<'_>) -> Option<RiskFactor>;
}

/// High-value transaction thresholds. Amounts are compared raw across
/// currencies; FX normalization is an upstream concern this engine does
/// not take on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HighValueConfig {
    pub threshold: f64,
    pub score_cap: u32,
}

impl Default for HighValueConfig {
    fn default() -> Self {
        Self {
            threshold: 10_000.0,
            score_cap: 30,
        }
    }
}

/// Triggers when the amount meets the high-value threshold; the score
/// scales with how far above the threshold the amount sits.
pub struct HighValueCheck {
    config: HighValueConfig,
}

impl HighValueCheck {
    pub fn new(config: HighValueConfig) -> Self {
        Self { config }
    }
}

impl RiskCheck for HighValueCheck {
    fn name(&self) -> &'static str {
        rules::HIGH_VALUE_TRANSACTION
    }

    fn run(&self, ctx: &RiskEvaluationContext, _aux: &CheckInputs<'_>) -> Option<RiskFactor> {
        if ctx.amount < self.config.threshold {
            return None;
        }
        let raw = (ctx.amount / self.config.threshold * 10.0).floor();
        let score = raw.min(self.config.score_cap as f64) as u32;

        Some(
            RiskFactor::new(
                rules::HIGH_VALUE_TRANSACTION,
                score,
                format!(
                    "Amount {:.2} {} meets high-value threshold {:.2}",
                    ctx.amount, ctx.currency, self.config.threshold
                ),
            )
            .with_metadata("amount", format!("{:.2}", ctx.amount))
            .with_metadata("threshold", format!("{:.2}", self.config.threshold)),
        )
    }
}

/// Rapid consecutive transfer thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RapidTransfersConfig {
    /// Count in the aggregator's short window at or above which the rule
    /// fires.
    pub count_threshold: u64,
    pub score: u32,
}

impl Default for RapidTransfersConfig {
    fn default() -> Self {
        Self {
            count_threshold: 5,
            score: 25,
        }
    }
}

/// Triggers on a burst of transactions inside the short trailing window.
pub struct RapidTransfersCheck {
    config: RapidTransfersConfig,
}

impl RapidTransfersCheck {
    pub fn new(config: RapidTransfersConfig) -> Self {
        Self { config }
    }
}

impl RiskCheck for RapidTransfersCheck {
    fn name(&self) -> &'static str {
        rules::RAPID_CONSECUTIVE_TRANSFERS
    }

    fn run(&self, _ctx: &RiskEvaluationContext, aux: &CheckInputs<'_>) -> Option<RiskFactor> {
        if aux.velocity.count_1h < self.config.count_threshold {
            return None;
        }
        Some(
            RiskFactor::new(
                rules::RAPID_CONSECUTIVE_TRANSFERS,
                self.config.score,
                format!(
                    "{} transactions in the trailing hour (threshold {})",
                    aux.velocity.count_1h, self.config.count_threshold
                ),
            )
            .with_metadata("count_1h", aux.velocity.count_1h.to_string()),
        )
    }
}

/// Velocity anomaly thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VelocityAnomalyConfig {
    /// Multiplier over the 24h average amount for the amount sub-trigger.
    pub avg_multiplier: f64,
    pub amount_anomaly_score: u32,
    /// Hourly count strictly above which the count sub-trigger fires.
    pub hourly_count_threshold: u64,
    pub count_anomaly_score: u32,
}

impl Default for VelocityAnomalyConfig {
    fn default() -> Self {
        Self {
            avg_multiplier: 3.0,
            amount_anomaly_score: 35,
            hourly_count_threshold: 10,
            count_anomaly_score: 20,
        }
    }
}

/// Two sub-triggers, at most one factor per call: the amount anomaly is
/// evaluated first and wins when both fire (it also carries the higher
/// score).
pub struct VelocityAnomalyCheck {
    config: VelocityAnomalyConfig,
}

impl VelocityAnomalyCheck {
    pub fn new(config: VelocityAnomalyConfig) -> Self {
        Self { config }
    }
}

impl RiskCheck for VelocityAnomalyCheck {
    fn name(&self) -> &'static str {
        rules::VELOCITY_ANOMALY
    }

    fn run(&self, ctx: &RiskEvaluationContext, aux: &CheckInputs<'_>) -> Option<RiskFactor> {
        let avg = aux.velocity.avg_amount_24h;
        if avg > 0.0 && ctx.amount > avg * self.config.avg_multiplier {
            let ratio = ctx.amount / avg;
            return Some(
                RiskFactor::new(
                    rules::VELOCITY_ANOMALY,
                    self.config.amount_anomaly_score,
                    format!(
                        "Amount {:.2} is {:.1}x the 24h average of {:.2}",
                        ctx.amount, ratio, avg
                    ),
                )
                .with_metadata("trigger", "amount_anomaly")
                .with_metadata("ratio", format!("{:.2}", ratio)),
            );
        }

        if aux.velocity.count_1h > self.config.hourly_count_threshold {
            return Some(
                RiskFactor::new(
                    rules::VELOCITY_ANOMALY,
                    self.config.count_anomaly_score,
                    format!(
                        "{} transactions in the last hour exceeds limit {}",
                        aux.velocity.count_1h, self.config.hourly_count_threshold
                    ),
                )
                .with_metadata("trigger", "hourly_count")
                .with_metadata("count_1h", aux.velocity.count_1h.to_string()),
            );
        }

        None
    }
}

/// Device check scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCheckConfig {
    pub new_device_score: u32,
    pub untrusted_device_score: u32,
    pub recent_device_score: u32,
    /// A known device younger than this is still considered recent.
    pub recent_window_hours: i64,
}

impl Default for DeviceCheckConfig {
    fn default() -> Self {
        Self {
            new_device_score: 25,
            untrusted_device_score: 40,
            recent_device_score: 15,
            recent_window_hours: 24,
        }
    }
}

/// Exactly one of UNTRUSTED_DEVICE, NEW_DEVICE, RECENT_DEVICE, or nothing
/// fires per call. Contexts without a (user, device) pair are skipped.
pub struct DeviceCheck {
    config: DeviceCheckConfig,
}

impl DeviceCheck {
    pub fn new(config: DeviceCheckConfig) -> Self {
        Self { config }
    }
}

impl RiskCheck for DeviceCheck {
    fn name(&self) -> &'static str {
        "DEVICE_TRUST"
    }

    fn run(&self, ctx: &RiskEvaluationContext, aux: &CheckInputs<'_>) -> Option<RiskFactor> {
        let device_key = ctx.device_key.as_deref()?;
        ctx.user_id.as_deref()?;

        let record = match aux.device {
            None => {
                return Some(
                    RiskFactor::new(
                        rules::NEW_DEVICE,
                        self.config.new_device_score,
                        format!("First transaction from device {}", device_key),
                    )
                    .with_metadata("device_key", device_key),
                );
            }
            Some(record) => record,
        };

        if record.trust_level == TrustLevel::Risky {
            return Some(
                RiskFactor::new(
                    rules::UNTRUSTED_DEVICE,
                    self.config.untrusted_device_score,
                    format!(
                        "Device {} is marked risky (trust score {})",
                        device_key, record.trust_score
                    ),
                )
                .with_metadata("device_key", device_key)
                .with_metadata("trust_score", record.trust_score.to_string()),
            );
        }

        let recent_cutoff = aux.as_of - Duration::hours(self.config.recent_window_hours);
        if record.created_at > recent_cutoff {
            return Some(
                RiskFactor::new(
                    rules::RECENT_DEVICE,
                    self.config.recent_device_score,
                    format!(
                        "Device {} first seen less than {}h ago",
                        device_key, self.config.recent_window_hours
                    ),
                )
                .with_metadata("device_key", device_key),
            );
        }

        None
    }
}

/// Configuration for the standard rule set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskChecksConfig {
    #[serde(default)]
    pub high_value: HighValueConfig,
    #[serde(default)]
    pub rapid_transfers: RapidTransfersConfig,
    #[serde(default)]
    pub velocity_anomaly: VelocityAnomalyConfig,
    #[serde(default)]
    pub device: DeviceCheckConfig,
}

/// Build the standard ordered rule set. The order determines factor order
/// in records and flag reasons, not the numeric score.
pub fn default_checks(config: &RiskChecksConfig) -> Vec<Box<dyn RiskCheck>> {
    vec![
        Box::new(HighValueCheck::new(config.high_value.clone())),
        Box::new(RapidTransfersCheck::new(config.rapid_transfers.clone())),
        Box::new(VelocityAnomalyCheck::new(config.velocity_anomaly.clone())),
        Box::new(DeviceCheck::new(config.device.clone())),
    ]
}
