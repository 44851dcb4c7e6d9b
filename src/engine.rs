//! Risk scoring engine.
//!
//! Orchestrates the registered rule set over a per-transaction evaluation
//! context, aggregates triggered factors into a score/level/flag verdict,
//! and persists an idempotent risk record per transaction. Re-evaluations
//! update the record in place and append to its evaluation history; the
//! review workflow's fields are never touched here.

use crate::checks::{CheckInputs, RiskCheck};
use crate::device_trust::{DeviceContext, DeviceTrustStore};
use crate::store::{AuditEvent, AuditSink, RiskRecordPersistence};
use crate::velocity::VelocityAggregator;
use crate::{
    EvaluationLogEntry, RiskError, RiskEvaluationContext, RiskFactor, RiskLevel, RiskRecord,
    RiskThresholds,
};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Bounded internal retries for the duplicate-insert race.
const MAX_UPSERT_RETRIES: u32 = 3;

/// Evaluation verdict returned to the caller.
#[derive(Debug, Clone)]
pub struct RiskEvaluationResult {
    pub record_id: String,
    pub transaction_id: String,
    pub risk_score: u32,
    pub risk_level: RiskLevel,
    pub is_flagged: bool,
    pub factors: Vec<RiskFactor>,
    pub requires_manual_review: bool,
}

struct EvaluationOutcome {
    score: u32,
    level: RiskLevel,
    flagged: bool,
    factors: Vec<RiskFactor>,
    velocity: Option<crate::velocity::VelocityData>,
    device_context: Option<DeviceContext>,
}

/// Rule-set orchestrator and risk record owner.
pub struct RiskScoringEngine {
    checks: Vec<Box<dyn RiskCheck>>,
    thresholds: RiskThresholds,
    velocity: VelocityAggregator,
    devices: Arc<DeviceTrustStore>,
    records: Arc<dyn RiskRecordPersistence>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl RiskScoringEngine {
    pub fn new(
        checks: Vec<Box<dyn RiskCheck>>,
        velocity: VelocityAggregator,
        devices: Arc<DeviceTrustStore>,
        records: Arc<dyn RiskRecordPersistence>,
    ) -> Self {
        Self {
            checks,
            thresholds: RiskThresholds::default(),
            velocity,
            devices,
            records,
            audit: None,
        }
    }

    pub fn with_thresholds(mut self, thresholds: RiskThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Evaluate with no time budget.
    pub fn evaluate(
        &self,
        ctx: &RiskEvaluationContext,
    ) -> Result<RiskEvaluationResult, RiskError> {
        self.evaluate_with_timeout(ctx, None)
    }

    /// Evaluate under a caller-supplied time budget. Exceeding the budget
    /// while fetching auxiliary data fails the whole call closed; an
    /// incomplete evaluation is worse than a delayed one.
    pub fn evaluate_with_timeout(
        &self,
        ctx: &RiskEvaluationContext,
        budget: Option<Duration>,
    ) -> Result<RiskEvaluationResult, RiskError> {
        self.validate(ctx)?;

        let started = Instant::now();
        let as_of = Utc::now();
        self.emit(AuditEvent::EvaluationStarted {
            transaction_id: ctx.transaction_id.clone(),
            at: as_of,
        });

        let velocity = match ctx.user_id.as_deref() {
            Some(user_id) => Some(self.velocity.compute(user_id, as_of)?),
            None => None,
        };
        check_deadline(started, budget, "velocity lookup")?;

        let device = match (ctx.user_id.as_deref(), ctx.device_key.as_deref()) {
            (Some(user_id), Some(device_key)) => self.devices.find(user_id, device_key)?,
            _ => None,
        };
        check_deadline(started, budget, "device trust lookup")?;

        let velocity_snapshot = velocity.unwrap_or_default();
        let aux = CheckInputs {
            velocity: &velocity_snapshot,
            device: device.as_ref(),
            as_of,
        };

        let mut factors = Vec::new();
        for check in &self.checks {
            if let Some(factor) = check.run(ctx, &aux) {
                debug!(
                    transaction_id = %ctx.transaction_id,
                    rule = %factor.rule,
                    score = factor.score,
                    "risk check triggered"
                );
                factors.push(factor);
            }
        }

        let score: u32 = factors.iter().map(|f| f.score).sum();
        let level = RiskLevel::from_score(score, &self.thresholds);
        let flagged = score >= self.thresholds.auto_flag_threshold;

        let outcome = EvaluationOutcome {
            score,
            level,
            flagged,
            factors,
            velocity: ctx.user_id.as_ref().map(|_| velocity_snapshot),
            device_context: ctx
                .device_key
                .as_deref()
                .map(|key| DeviceContext::from_record(key, device.as_ref())),
        };

        let record = self.upsert(ctx, &outcome, as_of)?;

        info!(
            transaction_id = %ctx.transaction_id,
            risk_score = record.risk_score,
            risk_level = %record.risk_level,
            is_flagged = record.is_flagged,
            "risk evaluation completed"
        );
        self.emit(AuditEvent::EvaluationCompleted {
            transaction_id: ctx.transaction_id.clone(),
            risk_score: record.risk_score,
            risk_level: record.risk_level,
            at: Utc::now(),
        });
        if record.is_flagged {
            self.emit(AuditEvent::TransactionFlagged {
                transaction_id: ctx.transaction_id.clone(),
                risk_score: record.risk_score,
                flag_reason: record.flag_reason.clone(),
                at: Utc::now(),
            });
        }

        Ok(RiskEvaluationResult {
            record_id: record.id.clone(),
            transaction_id: record.transaction_id.clone(),
            risk_score: record.risk_score,
            risk_level: record.risk_level,
            is_flagged: record.is_flagged,
            factors: record.risk_factors.clone(),
            requires_manual_review: record.is_flagged,
        })
    }

    /// Fetch the stored verdict for a transaction.
    pub fn get_by_transaction_id(&self, transaction_id: &str) -> Result<RiskRecord, RiskError> {
        self.records
            .find_by_transaction_id(transaction_id)?
            .ok_or_else(|| {
                RiskError::NotFound(format!("no risk record for transaction {}", transaction_id))
            })
    }

    fn validate(&self, ctx: &RiskEvaluationContext) -> Result<(), RiskError> {
        if ctx.transaction_id.trim().is_empty() {
            return Err(RiskError::InvalidInput(
                "transaction id must not be empty".to_string(),
            ));
        }
        if !ctx.amount.is_finite() || ctx.amount <= 0.0 {
            return Err(RiskError::InvalidInput(format!(
                "amount must be positive, got {}",
                ctx.amount
            )));
        }
        let currency_regex = Regex::new(r"^[A-Z]{3}$").unwrap();
        if !currency_regex.is_match(&ctx.currency) {
            return Err(RiskError::InvalidInput(format!(
                "malformed currency code: {}",
                ctx.currency
            )));
        }
        Ok(())
    }

    // Insert-or-update with the create race resolved internally: losing
    // the insert means another evaluation created the record first, so
    // re-fetch and fall through to the update path.
    fn upsert(
        &self,
        ctx: &RiskEvaluationContext,
        outcome: &EvaluationOutcome,
        now: DateTime<Utc>,
    ) -> Result<RiskRecord, RiskError> {
        let mut attempts = 0;
        loop {
            if let Some(mut existing) = self.records.find_by_transaction_id(&ctx.transaction_id)? {
                self.apply_evaluation(&mut existing, ctx, outcome, now);
                self.records.update(&existing)?;
                return Ok(existing);
            }

            let mut fresh = RiskRecord::new(ctx.transaction_id.clone(), ctx.user_id.clone());
            self.apply_evaluation(&mut fresh, ctx, outcome, now);
            match self.records.insert(&fresh) {
                Ok(()) => return Ok(fresh),
                Err(RiskError::Conflict(reason)) => {
                    attempts += 1;
                    if attempts > MAX_UPSERT_RETRIES {
                        return Err(RiskError::PersistenceFailure(format!(
                            "duplicate risk record for {} not resolved after {} retries: {}",
                            ctx.transaction_id, MAX_UPSERT_RETRIES, reason
                        )));
                    }
                    debug!(
                        transaction_id = %ctx.transaction_id,
                        attempts,
                        "lost risk record insert race, re-fetching"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn apply_evaluation(
        &self,
        record: &mut RiskRecord,
        ctx: &RiskEvaluationContext,
        outcome: &EvaluationOutcome,
        now: DateTime<Utc>,
    ) {
        let previous_score = record.risk_score;

        record.risk_score = outcome.score;
        record.risk_level = outcome.level;
        record.is_flagged = outcome.flagged;
        record.risk_factors = outcome.factors.clone();
        record.velocity_data = outcome.velocity;
        record.device_context = outcome.device_context.clone();

        if outcome.flagged && record.flagged_at.is_none() {
            record.flagged_at = Some(now);
            record.flag_reason = self.compose_flag_reason(&outcome.factors);
        }

        record.evaluation_history.push(EvaluationLogEntry {
            evaluated_at: now,
            previous_score,
            new_score: outcome.score,
            factors: outcome.factors.clone(),
            triggered_rules: outcome.factors.iter().map(|f| f.rule.clone()).collect(),
            evaluated_by: ctx.requested_by.clone(),
            metadata: Default::default(),
        });
        record.updated_at = now;
    }

    // Flag reason is composed from the factors whose individual score
    // meets the critical-factor cutoff; when none qualify, all triggered
    // rule names are used instead.
    fn compose_flag_reason(&self, factors: &[RiskFactor]) -> Option<String> {
        let critical: Vec<&str> = factors
            .iter()
            .filter(|f| f.score >= self.thresholds.critical_factor_cutoff)
            .map(|f| f.rule.as_str())
            .collect();
        let names = if critical.is_empty() {
            factors.iter().map(|f| f.rule.as_str()).collect()
        } else {
            critical
        };
        if names.is_empty() {
            None
        } else {
            Some(names.join(", "))
        }
    }

    fn emit(&self, event: AuditEvent) {
        if let Some(sink) = &self.audit {
            if let Err(e) = sink.emit(&event) {
                warn!(error = %e, "audit sink emit failed, continuing");
            }
        }
    }
}

fn check_deadline(
    started: Instant,
    budget: Option<Duration>,
    stage: &str,
) -> Result<(), RiskError> {
    if let Some(budget) = budget {
        if started.elapsed() > budget {
            return Err(RiskError::Timeout(format!(
                "evaluation budget exceeded during {}",
                stage
            )));
        }
    }
    Ok(())
}
