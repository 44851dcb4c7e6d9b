//! Transaction risk scoring walkthrough
//!
//! This example wires the engine to in-memory stores and demonstrates
//! evaluation, flagging, the admin review workflow, and audit reporting.

use chrono::{Duration, Utc};
use std::sync::Arc;
use transaction_risk_engine::store::{
    InMemoryDeviceStore, InMemoryRiskRecordStore, InMemoryTransactionStore, MemoryAuditSink,
};
use transaction_risk_engine::{
    default_checks, AuditReporter, DeviceSignal, DeviceTrustStore, ExportFormat, FlaggedFilter,
    ReviewDecision, ReviewWorkflow, RiskChecksConfig, RiskEvaluationContext, RiskScoringEngine,
    Transaction, TransactionStatus, VelocityAggregator,
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("=== Transaction Risk Scoring Engine ===\n");

    let transactions = Arc::new(InMemoryTransactionStore::new());
    let devices = Arc::new(InMemoryDeviceStore::new());
    let device_store = Arc::new(DeviceTrustStore::new(devices));
    let records = Arc::new(InMemoryRiskRecordStore::new());
    let sink = Arc::new(MemoryAuditSink::new());

    let engine = RiskScoringEngine::new(
        default_checks(&RiskChecksConfig::default()),
        VelocityAggregator::new(transactions.clone()),
        device_store.clone(),
        records.clone(),
    )
    .with_audit_sink(sink.clone());
    let workflow = ReviewWorkflow::new(records.clone()).with_audit_sink(sink);
    let reporter = AuditReporter::new(records);

    // Establish a device for the user.
    device_store
        .record_signal(
            "USER-12345",
            "DEV-LAPTOP",
            &DeviceSignal::successful_login("203.0.113.7"),
        )
        .expect("device signal");

    // Example 1: everyday payment, nothing fires.
    println!("1. Evaluating Everyday Payment");
    let ctx = RiskEvaluationContext::new("TXN-2026-08-06-001", 120.0, "USD")
        .with_user("USER-12345")
        .with_device("DEV-LAPTOP");
    let result = engine.evaluate(&ctx).expect("evaluation");
    println!("   Score: {}", result.risk_score);
    println!("   Level: {}", result.risk_level);
    println!("   Flagged: {}\n", result.is_flagged);

    // Example 2: a large wire from a brand-new device.
    println!("2. Evaluating High-Value Transfer From New Device");
    let ctx = RiskEvaluationContext::new("TXN-2026-08-06-002", 50_000.0, "USD")
        .with_user("USER-67890")
        .with_device("DEV-UNKNOWN")
        .with_ip("198.51.100.23");
    let result = engine.evaluate(&ctx).expect("evaluation");
    println!("   Score: {}", result.risk_score);
    println!("   Level: {}", result.risk_level);
    for factor in &result.factors {
        println!("   - {} ({}): {}", factor.rule, factor.score, factor.reason);
    }
    println!();

    // Example 3: a burst of transfers pushes the user over the line.
    println!("3. Evaluating Transaction Burst");
    for i in 0..12 {
        transactions.add(Transaction {
            id: format!("T-BURST-{}", i),
            user_id: "USER-67890".to_string(),
            amount: 900.0,
            currency: "USD".to_string(),
            status: TransactionStatus::Completed,
            created_at: Utc::now() - Duration::minutes(i),
        });
    }
    let ctx = RiskEvaluationContext::new("TXN-2026-08-06-003", 30_000.0, "USD")
        .with_user("USER-67890")
        .with_device("DEV-UNKNOWN");
    let result = engine.evaluate(&ctx).expect("evaluation");
    println!("   Score: {}", result.risk_score);
    println!("   Level: {}", result.risk_level);
    println!("   Requires manual review: {}\n", result.requires_manual_review);

    // Example 4: the admin inbox and the auto-processing gate.
    println!("4. Review Workflow");
    let (flagged, total) = workflow
        .list_flagged(&FlaggedFilter::default(), 1, 10)
        .expect("inbox");
    println!("   Flagged records pending review: {}", total);
    for record in &flagged {
        println!(
            "   - {} score={} reason={}",
            record.transaction_id,
            record.risk_score,
            record.flag_reason.as_deref().unwrap_or("-")
        );
    }
    if let Some(first) = flagged.first() {
        let gate_before = workflow
            .can_auto_process(&first.transaction_id)
            .expect("gate");
        let reviewed = workflow
            .review(
                &first.id,
                "ADMIN-42",
                ReviewDecision::Approved,
                Some("confirmed with account holder".to_string()),
                Some(true),
            )
            .expect("review");
        let gate_after = workflow
            .can_auto_process(&reviewed.transaction_id)
            .expect("gate");
        println!(
            "   {}: auto-process {} -> {} after approval",
            reviewed.transaction_id, gate_before, gate_after
        );
    }
    println!();

    // Example 5: compliance reporting.
    println!("5. Audit Reporting");
    let stats = reporter.statistics().expect("statistics");
    println!("   Total flagged: {}", stats.total_flagged);
    println!("   Average risk score: {:.1}", stats.average_risk_score);
    println!("   Counts by level: {:?}", stats.counts_by_level);

    let from = Utc::now() - Duration::hours(1);
    let to = Utc::now() + Duration::seconds(1);
    let report = reporter.generate_audit_report(from, to).expect("report");
    println!("   Evaluations in the last hour: {}", report.total_evaluations);
    if let Some(top) = report.top_risk_factors.first() {
        println!("   Top risk factor: {} ({}x)", top.rule, top.count);
    }

    let csv = reporter
        .export_evaluation_logs(from, to, ExportFormat::Csv)
        .expect("export");
    println!("   CSV export:\n{}", csv);
}
