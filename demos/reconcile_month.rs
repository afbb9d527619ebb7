//! Month reconciliation example

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use reconciliation_core::utils::MemoryStorage;
use reconciliation_core::{
    BulkCreateItem, LedgerRecord, MatchState, MatchingConfig, Period, ReconciliationEngine,
    StatementRecord,
};
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"
weight_date = 0.3
weight_value = 0.5
weight_description = 0.2
date_tolerance_days = 5
value_tolerance_fraction = 0.01
probable_threshold = 0.6
exact_threshold = 0.9
"#;

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    println!("🏦 Reconciliation Core - Month Reconciliation Example\n");

    let account = 10;
    let storage = MemoryStorage::with_config(MatchingConfig::from_toml_str(CONFIG)?);
    let engine = ReconciliationEngine::new(storage.clone());

    // 1. Alias rules for this account
    engine
        .create_alias(account, "pago a".to_string(), "pago".to_string())
        .await?;
    engine
        .create_alias(account, "transf".to_string(), "transferencia".to_string())
        .await?;

    // 2. Bank statement lines
    let statement_lines = [
        (1, day(5), -150000, "PAGO PROVEEDOR X"),
        (2, day(8), -42000, "TRANSF NOMINA"),
        (3, day(12), 980000, "ABONO CLIENTE ACME"),
        (4, day(31), -3500, "COMISION BANCARIA"),
    ];
    for (id, date, amount, description) in statement_lines {
        storage.add_statement(StatementRecord::new(
            id,
            account,
            date,
            description.to_string(),
            BigDecimal::from(amount),
        ))?;
    }

    // 3. Ledger records
    let ledger_records = [
        (100, day(5), -150000, "Pago a Proveedor X"),
        (101, day(10), -42000, "Transferencia nomina marzo"),
        (102, day(12), 980000, "Factura 118 ACME"),
        (103, day(20), -7800, "Cheque 2231"),
    ];
    for (id, date, amount, description) in ledger_records {
        storage.add_ledger_record(LedgerRecord::new(
            id,
            account,
            date,
            description.to_string(),
            BigDecimal::from(amount),
        ))?;
    }

    // 4. Automatic matching
    let period = Period::new(account, 2024, 3);
    let outcome = engine.run_matching(period).await?;
    println!("🔎 Matching results for {}:", period);
    for link in &outcome.links {
        println!(
            "  {:<9} statement {} → ledger {:?} (score {:.2})",
            link.state.as_str(),
            link.statement_id,
            link.ledger_id,
            link.scores.total
        );
    }
    println!();

    // 5. Operator review
    for link in outcome.links.iter().filter(|l| l.state == MatchState::Probable) {
        engine.approve_link(link.id, "demo").await?;
        println!("  ✓ Approved statement {}", link.statement_id);
    }

    let unmatched: Vec<BulkCreateItem> = outcome
        .links
        .iter()
        .filter(|l| l.state == MatchState::NoMatch)
        .map(|l| BulkCreateItem::for_statement(l.statement_id))
        .collect();
    let created = engine
        .bulk_create_ledger_from_unmatched(&unmatched, "demo")
        .await?;
    println!("  ✓ Created {} ledger record(s) from the statement", created.created);
    println!();

    // 6. Final picture
    let final_outcome = engine.run_matching(period).await?;
    let stats = &final_outcome.statistics;
    println!("📊 Statistics:");
    println!("  Exact:    {} ({:.2}%)", stats.exact, stats.exact_pct);
    println!("  Probable: {} ({:.2}%)", stats.probable, stats.probable_pct);
    println!("  Manual:   {} ({:.2}%)", stats.manual, stats.manual_pct);
    println!("  No match: {} ({:.2}%)", stats.no_match, stats.no_match_pct);
    println!("  Ledger in transit: {}", stats.unmatched_ledger);
    for record in &final_outcome.unmatched_ledger {
        println!("    {} {:?} {}", record.id, record.amount, record.description);
    }

    let conflicts = engine.detect_conflicts(period).await?;
    println!("\n🔐 One-to-many conflicts: {}", conflicts.cases.len());

    Ok(())
}
