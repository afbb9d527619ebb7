//! Integration tests for reconciliation-core

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use proptest::prelude::*;
use reconciliation_core::{
    utils::MemoryStorage, AccountId, AliasRule, BulkCreateItem, LedgerId, LedgerMaintenance,
    LedgerRecord, LinkChange, MatchLink, MatchState, MatchingConfig, NewLedgerRecord, Period,
    ReconError, ReconResult, ReconciliationEngine, ReconciliationStorage, RemediationPolicy,
    StatementId, StatementRecord,
};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const ACCOUNT: i64 = 10;

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
}

fn march() -> Period {
    Period::new(ACCOUNT, 2024, 3)
}

fn statement(id: i64, date: NaiveDate, amount: i64, description: &str) -> StatementRecord {
    StatementRecord::new(
        id,
        ACCOUNT,
        date,
        description.to_string(),
        BigDecimal::from(amount),
    )
}

fn ledger(id: i64, date: NaiveDate, amount: i64, description: &str) -> LedgerRecord {
    LedgerRecord::new(
        id,
        ACCOUNT,
        date,
        description.to_string(),
        BigDecimal::from(amount),
    )
}

fn setup() -> (MemoryStorage, ReconciliationEngine<MemoryStorage>) {
    let storage = MemoryStorage::with_config(MatchingConfig::default());
    let engine = ReconciliationEngine::new(storage.clone());
    (storage, engine)
}

fn link_of(links: &[MatchLink], statement_id: i64) -> &MatchLink {
    links
        .iter()
        .find(|l| l.statement_id == statement_id)
        .expect("every statement line has a link")
}

async fn engine_with_alias() -> (MemoryStorage, ReconciliationEngine<MemoryStorage>) {
    let (storage, engine) = setup();
    engine
        .create_alias(ACCOUNT, "pago a".to_string(), "pago".to_string())
        .await
        .unwrap();
    (storage, engine)
}

#[tokio::test]
async fn test_alias_normalized_exact_match() {
    let (storage, engine) = engine_with_alias().await;
    storage
        .add_statement(statement(1, day(5), -150000, "PAGO PROVEEDOR X"))
        .unwrap();
    storage
        .add_ledger_record(ledger(100, day(5), -150000, "Pago a Proveedor X"))
        .unwrap();

    let outcome = engine.run_matching(march()).await.unwrap();
    let link = link_of(&outcome.links, 1);

    assert_eq!(link.state, MatchState::Exact);
    assert_eq!(link.ledger_id, Some(100));
    assert_eq!(link.scores.description, 1.0);
    assert!(link.scores.total >= 0.9);

    let record = storage.get_ledger_record(100).await.unwrap().unwrap();
    assert_eq!(record.linked_statement_id, Some(1));
    assert!(outcome.unmatched_ledger.is_empty());
}

#[tokio::test]
async fn test_date_offset_gives_probable() {
    let (storage, engine) = engine_with_alias().await;
    storage
        .add_statement(statement(1, day(5), -150000, "PAGO PROVEEDOR X"))
        .unwrap();
    storage
        .add_ledger_record(ledger(100, day(8), -150000, "Pago a Proveedor X"))
        .unwrap();

    let outcome = engine.run_matching(march()).await.unwrap();
    let link = link_of(&outcome.links, 1);

    assert_eq!(link.state, MatchState::Probable);
    assert_eq!(link.ledger_id, Some(100));
    assert_eq!(link.scores.date, 0.4);
    assert!(link.scores.total >= 0.6 && link.scores.total < 0.9);

    // Probable links do not hold the ledger record
    let record = storage.get_ledger_record(100).await.unwrap().unwrap();
    assert_eq!(record.linked_statement_id, None);
}

#[tokio::test]
async fn test_amount_out_of_tolerance_is_pruned() {
    let (storage, engine) = setup();
    engine
        .update_config(MatchingConfig {
            value_tolerance_fraction: 0.02,
            ..MatchingConfig::default()
        })
        .await
        .unwrap();
    storage
        .add_statement(statement(1, day(5), -150000, "Pago proveedor X"))
        .unwrap();
    storage
        .add_ledger_record(ledger(100, day(5), -75000, "Pago proveedor X"))
        .unwrap();

    let outcome = engine.run_matching(march()).await.unwrap();
    let link = link_of(&outcome.links, 1);

    assert_eq!(link.state, MatchState::NoMatch);
    assert_eq!(link.ledger_id, None);
    assert_eq!(outcome.unmatched_ledger.len(), 1);
    assert_eq!(outcome.statistics.unmatched_ledger, 1);
}

#[tokio::test]
async fn test_contested_ledger_goes_to_best_statement() {
    let (storage, engine) = setup();
    storage.add_statement(statement(1, day(5), -100, "pago luz")).unwrap();
    storage.add_statement(statement(2, day(6), -100, "pago luz")).unwrap();
    storage.add_ledger_record(ledger(100, day(5), -100, "pago luz")).unwrap();
    storage.add_ledger_record(ledger(101, day(9), -100, "pago luz")).unwrap();

    let outcome = engine.run_matching(march()).await.unwrap();

    let winner = link_of(&outcome.links, 1);
    assert_eq!(winner.state, MatchState::Exact);
    assert_eq!(winner.ledger_id, Some(100));

    let loser = link_of(&outcome.links, 2);
    assert_eq!(loser.state, MatchState::Probable);
    assert_eq!(loser.ledger_id, Some(101));
}

#[tokio::test]
async fn test_equal_scores_break_ties_by_lower_ids() {
    let (storage, engine) = setup();
    storage.add_statement(statement(2, day(5), -100, "cuota")).unwrap();
    storage.add_statement(statement(1, day(5), -100, "cuota")).unwrap();
    storage.add_ledger_record(ledger(101, day(5), -100, "cuota")).unwrap();
    storage.add_ledger_record(ledger(100, day(5), -100, "cuota")).unwrap();

    let outcome = engine.run_matching(march()).await.unwrap();
    assert_eq!(link_of(&outcome.links, 1).ledger_id, Some(100));
    assert_eq!(link_of(&outcome.links, 2).ledger_id, Some(101));
}

#[tokio::test]
async fn test_manual_link_to_committed_ledger_is_rejected() {
    let (storage, engine) = setup();
    storage.add_statement(statement(1, day(5), -100, "pago luz")).unwrap();
    storage.add_statement(statement(2, day(20), -999, "otro")).unwrap();
    storage.add_ledger_record(ledger(100, day(5), -100, "pago luz")).unwrap();
    engine.run_matching(march()).await.unwrap();

    let before = storage.link_for_statement(2).await.unwrap().unwrap();
    let result = engine
        .create_manual_link(2, 100, "ana", Some("same payment".to_string()))
        .await;

    assert!(matches!(
        result,
        Err(ReconError::InvariantViolation {
            ledger_id: 100,
            statement_id: 2,
            existing_statement_id: 1,
        })
    ));
    let after = storage.link_for_statement(2).await.unwrap().unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let (storage, engine) = setup();
    storage.add_statement(statement(1, day(5), -100, "pago luz")).unwrap();
    storage.add_statement(statement(2, day(6), -100, "pago luz")).unwrap();
    storage.add_statement(statement(3, day(7), -5000, "transferencia")).unwrap();
    storage.add_ledger_record(ledger(100, day(5), -100, "pago luz")).unwrap();
    storage.add_ledger_record(ledger(101, day(9), -100, "pago luz")).unwrap();

    let first = engine.run_matching(march()).await.unwrap();
    let second = engine.run_matching(march()).await.unwrap();

    assert_eq!(first.links, second.links);
    assert_eq!(first.statistics, second.statistics);
}

#[tokio::test]
async fn test_operator_states_survive_rerun() {
    let (storage, engine) = setup();
    storage.add_statement(statement(1, day(5), -100, "pago luz")).unwrap();
    storage.add_statement(statement(2, day(12), -300, "comision")).unwrap();
    storage.add_ledger_record(ledger(100, day(5), -100, "pago luz")).unwrap();
    storage.add_ledger_record(ledger(101, day(25), -250, "ajuste")).unwrap();

    let ignored = engine
        .ignore_link(1, "ana", Some("handled elsewhere".to_string()))
        .await
        .unwrap();
    assert_eq!(ignored.state, MatchState::Ignored);

    let manual = engine.create_manual_link(2, 101, "ana", None).await.unwrap();
    assert_eq!(manual.state, MatchState::Manual);

    let outcome = engine.run_matching(march()).await.unwrap();
    assert_eq!(link_of(&outcome.links, 1), &ignored);
    assert_eq!(link_of(&outcome.links, 2), &manual);
    assert_eq!(outcome.statistics.ignored, 1);
    assert_eq!(outcome.statistics.manual, 1);

    // The ignored line's natural counterpart stays in transit
    let unmatched: Vec<i64> = outcome.unmatched_ledger.iter().map(|r| r.id).collect();
    assert_eq!(unmatched, vec![100]);
}

#[tokio::test]
async fn test_probable_is_not_promoted_by_rerun() {
    let (storage, engine) = setup();
    storage.add_statement(statement(1, day(5), -100, "pago luz")).unwrap();
    storage.add_ledger_record(ledger(100, day(8), -100, "pago luz")).unwrap();

    let first = engine.run_matching(march()).await.unwrap();
    assert_eq!(link_of(&first.links, 1).state, MatchState::Probable);

    // A better record appears at the same date
    storage.add_ledger_record(ledger(101, day(5), -100, "pago luz")).unwrap();
    let second = engine.run_matching(march()).await.unwrap();
    let link = link_of(&second.links, 1);
    assert_eq!(link.state, MatchState::Probable);
    assert_eq!(link.ledger_id, Some(101));
    assert_eq!(link.scores.total, 1.0);
}

#[tokio::test]
async fn test_approve_unlink_and_rematch() {
    let (storage, engine) = setup();
    storage.add_statement(statement(1, day(5), -100, "pago luz")).unwrap();
    storage.add_ledger_record(ledger(100, day(7), -100, "pago luz")).unwrap();

    let outcome = engine.run_matching(march()).await.unwrap();
    let probable = link_of(&outcome.links, 1).clone();
    assert_eq!(probable.state, MatchState::Probable);

    let approved = engine.approve_link(probable.id, "ana").await.unwrap();
    assert_eq!(approved.state, MatchState::Exact);
    assert_eq!(approved.actor.as_deref(), Some("ana"));
    let record = storage.get_ledger_record(100).await.unwrap().unwrap();
    assert_eq!(record.linked_statement_id, Some(1));

    // Approving twice is not a valid transition
    assert!(matches!(
        engine.approve_link(probable.id, "ana").await,
        Err(ReconError::InvalidTransition { .. })
    ));

    let unlinked = engine.unlink(1).await.unwrap();
    assert_eq!(unlinked.state, MatchState::NoMatch);
    assert_eq!(unlinked.ledger_id, None);
    let record = storage.get_ledger_record(100).await.unwrap().unwrap();
    assert_eq!(record.linked_statement_id, None);

    let rerun = engine.run_matching(march()).await.unwrap();
    assert_eq!(link_of(&rerun.links, 1).state, MatchState::Probable);
}

#[tokio::test]
async fn test_stale_write_is_rejected() {
    let (storage, engine) = setup();
    storage.add_statement(statement(1, day(5), -100, "pago luz")).unwrap();
    storage.add_ledger_record(ledger(100, day(7), -100, "pago luz")).unwrap();

    let outcome = engine.run_matching(march()).await.unwrap();
    let stale = link_of(&outcome.links, 1).clone();
    engine.approve_link(stale.id, "ana").await.unwrap();

    let mut edit = stale.clone();
    edit.state = MatchState::Ignored;
    let result = storage.commit_links(&[LinkChange::update(edit)]).await;
    assert!(matches!(
        result,
        Err(ReconError::ConcurrentModification { .. })
    ));
    let current = storage.get_link(stale.id).await.unwrap().unwrap();
    assert_eq!(current.state, MatchState::Exact);
}

#[tokio::test]
async fn test_malformed_and_duplicate_records_are_skipped() {
    let (storage, engine) = setup();
    let mut no_amount = statement(1, day(5), -100, "pago luz");
    no_amount.amount = None;
    storage.add_statement(no_amount).unwrap();

    let mut duplicate = statement(2, day(6), -200, "pago agua");
    duplicate.is_duplicate = true;
    storage.add_statement(duplicate).unwrap();

    let mut undated = ledger(101, day(6), -100, "pago luz");
    undated.date = None;
    storage.add_ledger_record(undated).unwrap();
    storage.add_ledger_record(ledger(100, day(5), -100, "pago luz")).unwrap();
    storage.add_ledger_record(ledger(102, day(6), -200, "pago agua")).unwrap();

    let outcome = engine.run_matching(march()).await.unwrap();

    assert_eq!(outcome.links.len(), 2);
    assert!(outcome.links.iter().all(|l| l.state == MatchState::NoMatch));
    assert_eq!(outcome.warnings.len(), 2);
    assert_eq!(outcome.statistics.skipped_records, 2);
    assert_eq!(outcome.statistics.no_match_pct, 100.0);

    let unmatched: Vec<i64> = outcome.unmatched_ledger.iter().map(|r| r.id).collect();
    assert_eq!(unmatched, vec![100, 102]);
}

#[tokio::test]
async fn test_missing_config_fails_run() {
    let storage = MemoryStorage::new();
    storage.add_statement(statement(1, day(5), -100, "pago luz")).unwrap();
    let engine = ReconciliationEngine::new(storage.clone());

    assert!(matches!(
        engine.run_matching(march()).await,
        Err(ReconError::ConfigMissing)
    ));
    assert!(matches!(engine.get_config().await, Err(ReconError::ConfigMissing)));
    assert!(storage.links_for_period(&march()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let (_, engine) = setup();
    let result = engine
        .update_config(MatchingConfig {
            probable_threshold: 0.95,
            exact_threshold: 0.9,
            ..MatchingConfig::default()
        })
        .await;
    assert!(matches!(result, Err(ReconError::Validation(_))));
    assert_eq!(engine.get_config().await.unwrap(), MatchingConfig::default());
}

#[tokio::test]
async fn test_statistics() {
    let (storage, engine) = setup();
    storage.add_statement(statement(1, day(5), -100, "pago luz")).unwrap();
    storage.add_statement(statement(2, day(6), -100, "pago luz")).unwrap();
    storage.add_statement(statement(3, day(7), -5000, "transferencia")).unwrap();
    storage.add_ledger_record(ledger(100, day(5), -100, "pago luz")).unwrap();
    storage.add_ledger_record(ledger(101, day(9), -100, "pago luz")).unwrap();
    storage.add_ledger_record(ledger(102, day(28), -42, "intereses")).unwrap();
    // Next month
    storage.add_ledger_record(ledger(103, NaiveDate::from_ymd_opt(2024, 4, 20).unwrap(), -1, "x")).unwrap();

    let stats = engine.run_matching(march()).await.unwrap().statistics;

    assert_eq!(stats.total_statements, 3);
    assert_eq!(stats.total_ledger, 3);
    assert_eq!((stats.exact, stats.probable, stats.no_match), (1, 1, 1));
    assert_eq!(stats.exact_pct, 33.33);
    assert_eq!(stats.probable_pct, 33.33);
    assert_eq!(stats.no_match_pct, 33.33);
    assert_eq!(stats.unmatched_ledger, 1);
}

#[tokio::test]
async fn test_empty_period() {
    let (_, engine) = setup();
    let outcome = engine.run_matching(march()).await.unwrap();
    assert!(outcome.links.is_empty());
    assert_eq!(outcome.statistics.exact_pct, 0.0);
}

#[tokio::test]
async fn test_bulk_create_from_unmatched() {
    let (storage, engine) = setup();
    storage.add_statement(statement(1, day(5), -35, "comision bancaria")).unwrap();
    storage.add_statement(statement(2, day(6), -12, "iva comision")).unwrap();
    storage.add_statement(statement(3, day(7), -100, "pago luz")).unwrap();
    storage.add_ledger_record(ledger(60, day(7), -100, "pago luz")).unwrap();
    engine.run_matching(march()).await.unwrap();
    // Free record identical to line 2, booked after the run
    storage.add_ledger_record(ledger(50, day(6), -12, "iva comision")).unwrap();

    let items = vec![
        BulkCreateItem::for_statement(1),
        BulkCreateItem::for_statement(2),
        BulkCreateItem::for_statement(3),
        BulkCreateItem::for_statement(99),
    ];
    let outcome = engine
        .bulk_create_ledger_from_unmatched(&items, "ana")
        .await
        .unwrap();

    assert_eq!(outcome.created, 1);
    assert_eq!(outcome.links.len(), 2);
    assert_eq!(outcome.errors.len(), 2);
    assert!(outcome
        .links
        .iter()
        .all(|l| l.state == MatchState::Manual && l.note.as_deref() == Some("created from statement")));

    let reused = link_of(&outcome.links, 2);
    assert_eq!(reused.ledger_id, Some(50));

    let created_id = link_of(&outcome.links, 1).ledger_id.unwrap();
    let created = storage.get_ledger_record(created_id).await.unwrap().unwrap();
    assert_eq!(created.amount, Some(BigDecimal::from(-35)));
    assert_eq!(created.linked_statement_id, Some(1));

    // A later run keeps the manual links
    let rerun = engine.run_matching(march()).await.unwrap();
    assert_eq!(link_of(&rerun.links, 1).state, MatchState::Manual);
    assert_eq!(link_of(&rerun.links, 3).state, MatchState::Exact);
}

#[tokio::test]
async fn test_conflict_detection_and_remediation() {
    let (storage, engine) = setup();
    let period = march();
    for id in 1..=3 {
        storage.add_statement(statement(id, day(5), -100, "pago luz")).unwrap();
    }
    storage.add_ledger_record(ledger(100, day(5), -100, "pago luz")).unwrap();

    // Legacy data with one ledger record linked to three lines
    for (statement_id, total) in [(1, 0.95), (2, 0.99), (3, 0.91)] {
        let mut link = MatchLink::placeholder(period, statement_id);
        link.state = MatchState::Exact;
        link.ledger_id = Some(100);
        link.scores.total = total;
        storage.seed_link(link).unwrap();
    }

    let report = engine.detect_conflicts(period).await.unwrap();
    assert_eq!(report.cases.len(), 1);
    assert_eq!(report.cases[0].statement_ids, vec![1, 2, 3]);
    assert_eq!(report.affected_ledger_count, 1);
    assert_eq!(report.affected_statement_count, 3);

    let reverted = engine
        .remediate_conflicts(period, RemediationPolicy::KeepHighestScore)
        .await
        .unwrap();
    let reverted_ids: HashSet<i64> = reverted.iter().map(|l| l.statement_id).collect();
    assert_eq!(reverted_ids, HashSet::from([1, 3]));
    assert!(reverted.iter().all(|l| l.state == MatchState::NoMatch));

    assert!(engine.detect_conflicts(period).await.unwrap().is_clean());
    let kept = storage.link_for_statement(2).await.unwrap().unwrap();
    assert_eq!(kept.state, MatchState::Exact);

    // Remediating a clean period changes nothing
    assert!(engine
        .remediate_conflicts(period, RemediationPolicy::RevertAll)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_orphan_confirmed_link_is_reported() {
    let (storage, engine) = setup();
    storage.add_statement(statement(1, day(5), -100, "pago luz")).unwrap();
    storage.add_ledger_record(ledger(100, day(5), -100, "pago luz")).unwrap();
    engine.run_matching(march()).await.unwrap();

    storage.remove_ledger_record(100).unwrap();
    let outcome = engine.run_matching(march()).await.unwrap();

    let link = link_of(&outcome.links, 1);
    assert_eq!(link.state, MatchState::Exact);
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(outcome.warnings[0].record_id, 1);
}

#[tokio::test]
async fn test_orphan_probable_link_is_reset() {
    let (storage, engine) = setup();
    storage.add_statement(statement(1, day(5), -100, "pago luz")).unwrap();
    storage.add_ledger_record(ledger(100, day(8), -100, "pago luz")).unwrap();
    engine.run_matching(march()).await.unwrap();

    storage.remove_ledger_record(100).unwrap();
    let outcome = engine.run_matching(march()).await.unwrap();
    let link = link_of(&outcome.links, 1);
    assert_eq!(link.state, MatchState::NoMatch);
    assert_eq!(link.ledger_id, None);
}

#[tokio::test]
async fn test_concurrent_runs_on_one_period() {
    let (storage, engine) = setup();
    for id in 1..=20 {
        storage
            .add_statement(statement(id, day((id % 28 + 1) as u32), -(id * 10), "cargo"))
            .unwrap();
        storage
            .add_ledger_record(ledger(100 + id, day((id % 28 + 1) as u32), -(id * 10), "cargo"))
            .unwrap();
    }
    let engine = std::sync::Arc::new(engine);

    let runs: Vec<_> = (0..4)
        .map(|_| {
            let engine = std::sync::Arc::clone(&engine);
            tokio::spawn(async move { engine.run_matching(march()).await })
        })
        .collect();
    for run in runs {
        run.await.unwrap().unwrap();
    }

    let links = storage.links_for_period(&march()).await.unwrap();
    assert_eq!(links.len(), 20);
    assert!(links.iter().all(|l| l.state == MatchState::Exact));
}

fn april() -> Period {
    Period::new(ACCOUNT, 2024, 4)
}

fn april_day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 4, d).unwrap()
}

fn exact_link(period: Period, statement_id: i64, ledger_id: i64) -> MatchLink {
    let mut link = MatchLink::placeholder(period, statement_id);
    link.state = MatchState::Exact;
    link.ledger_id = Some(ledger_id);
    link.scores.total = 1.0;
    link
}

/// A write another request slips in right before one of ours
enum Interference {
    /// Commit this link as if another period's run had just stored it
    Claim(MatchLink),
    /// Edit the link of this statement line, bumping its version
    Touch(StatementId),
}

/// Memory storage that applies queued interference before each commit
#[derive(Clone)]
struct RacingStorage {
    inner: MemoryStorage,
    queued: Arc<Mutex<VecDeque<Interference>>>,
}

impl RacingStorage {
    fn new(inner: MemoryStorage) -> Self {
        Self {
            inner,
            queued: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    fn queue(&self, interference: Interference) {
        self.queued.lock().unwrap().push_back(interference);
    }
}

#[async_trait]
impl ReconciliationStorage for RacingStorage {
    async fn active_config(&self) -> ReconResult<Option<MatchingConfig>> {
        self.inner.active_config().await
    }

    async fn save_config(&self, config: &MatchingConfig) -> ReconResult<()> {
        self.inner.save_config(config).await
    }

    async fn statements_for_period(&self, period: &Period) -> ReconResult<Vec<StatementRecord>> {
        self.inner.statements_for_period(period).await
    }

    async fn get_statement(
        &self,
        statement_id: StatementId,
    ) -> ReconResult<Option<StatementRecord>> {
        self.inner.get_statement(statement_id).await
    }

    async fn ledger_records_between(
        &self,
        account_id: AccountId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> ReconResult<Vec<LedgerRecord>> {
        self.inner.ledger_records_between(account_id, start, end).await
    }

    async fn get_ledger_record(&self, ledger_id: LedgerId) -> ReconResult<Option<LedgerRecord>> {
        self.inner.get_ledger_record(ledger_id).await
    }

    async fn links_for_period(&self, period: &Period) -> ReconResult<Vec<MatchLink>> {
        self.inner.links_for_period(period).await
    }

    async fn get_link(&self, link_id: Uuid) -> ReconResult<Option<MatchLink>> {
        self.inner.get_link(link_id).await
    }

    async fn link_for_statement(
        &self,
        statement_id: StatementId,
    ) -> ReconResult<Option<MatchLink>> {
        self.inner.link_for_statement(statement_id).await
    }

    async fn committed_link_for_ledger(
        &self,
        ledger_id: LedgerId,
    ) -> ReconResult<Option<MatchLink>> {
        self.inner.committed_link_for_ledger(ledger_id).await
    }

    async fn committed_links_for_ledgers(
        &self,
        ledger_ids: &[LedgerId],
    ) -> ReconResult<Vec<MatchLink>> {
        self.inner.committed_links_for_ledgers(ledger_ids).await
    }

    async fn commit_links(&self, changes: &[LinkChange]) -> ReconResult<Vec<MatchLink>> {
        let next = self.queued.lock().unwrap().pop_front();
        match next {
            Some(Interference::Claim(link)) => {
                self.inner.commit_links(&[LinkChange::insert(link)]).await?;
            }
            Some(Interference::Touch(statement_id)) => {
                let mut link = self.inner.link_for_statement(statement_id).await?.unwrap();
                link.note = Some("edited elsewhere".to_string());
                self.inner.commit_links(&[LinkChange::update(link)]).await?;
            }
            None => {}
        }
        self.inner.commit_links(changes).await
    }

    async fn list_aliases(&self, account_id: AccountId) -> ReconResult<Vec<AliasRule>> {
        self.inner.list_aliases(account_id).await
    }

    async fn get_alias(&self, alias_id: Uuid) -> ReconResult<Option<AliasRule>> {
        self.inner.get_alias(alias_id).await
    }

    async fn save_alias(&self, alias: &AliasRule) -> ReconResult<()> {
        self.inner.save_alias(alias).await
    }

    async fn delete_alias(&self, alias_id: Uuid) -> ReconResult<()> {
        self.inner.delete_alias(alias_id).await
    }
}

#[async_trait]
impl LedgerMaintenance for RacingStorage {
    async fn find_free_ledger_record(
        &self,
        account_id: AccountId,
        date: NaiveDate,
        amount: &BigDecimal,
        description: &str,
        reference: Option<&str>,
    ) -> ReconResult<Option<LedgerRecord>> {
        self.inner
            .find_free_ledger_record(account_id, date, amount, description, reference)
            .await
    }

    async fn create_ledger_record(&self, record: &NewLedgerRecord) -> ReconResult<LedgerRecord> {
        self.inner.create_ledger_record(record).await
    }
}

fn racing_setup() -> (MemoryStorage, RacingStorage, ReconciliationEngine<RacingStorage>) {
    let storage = MemoryStorage::with_config(MatchingConfig::default());
    let racing = RacingStorage::new(storage.clone());
    let engine = ReconciliationEngine::new(racing.clone());
    (storage, racing, engine)
}

#[tokio::test]
async fn test_ledger_held_by_adjacent_period_is_not_offered() {
    let (storage, engine) = setup();
    storage
        .add_statement(statement(2, april_day(1), -100, "pago luz"))
        .unwrap();
    // Legacy April link imported before its ledger record
    storage.seed_link(exact_link(april(), 2, 100)).unwrap();
    storage.add_ledger_record(ledger(100, day(31), -100, "pago luz")).unwrap();
    storage.add_statement(statement(1, day(31), -100, "pago luz")).unwrap();

    let outcome = engine.run_matching(march()).await.unwrap();

    let link = link_of(&outcome.links, 1);
    assert_eq!(link.state, MatchState::NoMatch);
    assert_eq!(link.ledger_id, None);
    assert!(outcome.unmatched_ledger.is_empty());

    let holder = storage.committed_link_for_ledger(100).await.unwrap().unwrap();
    assert_eq!(holder.statement_id, 2);
}

#[tokio::test]
async fn test_seeded_link_claims_free_ledger_record() {
    let (storage, _) = setup();
    storage.add_ledger_record(ledger(100, day(31), -100, "pago luz")).unwrap();
    storage.add_ledger_record(ledger(101, day(31), -100, "pago luz")).unwrap();

    storage.seed_link(exact_link(april(), 2, 100)).unwrap();
    storage.seed_link(exact_link(april(), 3, 100)).unwrap();
    let mut probable = exact_link(april(), 4, 101);
    probable.state = MatchState::Probable;
    storage.seed_link(probable).unwrap();

    let held = storage.get_ledger_record(100).await.unwrap().unwrap();
    assert_eq!(held.linked_statement_id, Some(2));
    let free = storage.get_ledger_record(101).await.unwrap().unwrap();
    assert_eq!(free.linked_statement_id, None);
}

#[tokio::test]
async fn test_run_replans_after_losing_ledger_race() {
    let (storage, racing, engine) = racing_setup();
    storage.add_statement(statement(1, day(31), -100, "pago luz")).unwrap();
    storage.add_statement(statement(2, april_day(1), -100, "pago luz")).unwrap();
    storage.add_ledger_record(ledger(100, day(31), -100, "pago luz")).unwrap();
    storage.add_ledger_record(ledger(101, day(30), -100, "pago luz")).unwrap();

    // The April run commits ledger 100 while March is planning
    racing.queue(Interference::Claim(exact_link(april(), 2, 100)));
    let outcome = engine.run_matching(march()).await.unwrap();

    let link = link_of(&outcome.links, 1);
    assert_eq!(link.state, MatchState::Exact);
    assert_eq!(link.ledger_id, Some(101));
    assert!(engine.detect_conflicts(april()).await.unwrap().is_clean());
}

#[tokio::test]
async fn test_run_reports_retryable_error_after_repeated_races() {
    let (storage, racing, engine) = racing_setup();
    storage.add_statement(statement(1, day(31), -100, "pago luz")).unwrap();
    storage.add_ledger_record(ledger(100, day(31), -100, "pago luz")).unwrap();
    storage.add_ledger_record(ledger(101, day(30), -100, "pago luz")).unwrap();

    racing.queue(Interference::Claim(exact_link(april(), 2, 100)));
    racing.queue(Interference::Claim(exact_link(april(), 3, 101)));
    let result = engine.run_matching(march()).await;

    assert!(matches!(
        result,
        Err(ReconError::ConcurrentModification { .. })
    ));
    assert!(storage.links_for_period(&march()).await.unwrap().is_empty());

    // A retry on fresh state succeeds
    let outcome = engine.run_matching(march()).await.unwrap();
    assert_eq!(link_of(&outcome.links, 1).state, MatchState::NoMatch);
}

#[tokio::test]
async fn test_operator_action_on_stale_link_is_rejected() {
    let (storage, racing, engine) = racing_setup();
    storage.add_statement(statement(1, day(5), -100, "pago luz")).unwrap();
    storage.add_ledger_record(ledger(100, day(7), -100, "pago luz")).unwrap();
    engine.run_matching(march()).await.unwrap();

    racing.queue(Interference::Touch(1));
    let result = engine
        .ignore_link(1, "ana", Some("duplicate charge".to_string()))
        .await;

    assert!(matches!(
        result,
        Err(ReconError::ConcurrentModification { .. })
    ));
    let current = storage.link_for_statement(1).await.unwrap().unwrap();
    assert_eq!(current.state, MatchState::Probable);
    assert_eq!(current.note.as_deref(), Some("edited elsewhere"));
}

fn arb_records() -> impl Strategy<Value = (Vec<(u32, i64)>, Vec<(u32, i64)>)> {
    (
        prop::collection::vec((1u32..=28, 1i64..=20), 0..12),
        prop::collection::vec((1u32..=28, 1i64..=20), 0..12),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_links_are_one_to_one_and_stable((statements, records) in arb_records()) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let (storage, engine) = setup();
            for (i, (d, amount)) in statements.iter().enumerate() {
                storage
                    .add_statement(statement(i as i64 + 1, day(*d), -amount * 100, "movimiento"))
                    .unwrap();
            }
            for (i, (d, amount)) in records.iter().enumerate() {
                storage
                    .add_ledger_record(ledger(i as i64 + 1000, day(*d), -amount * 100, "movimiento"))
                    .unwrap();
            }

            let first = engine.run_matching(march()).await.unwrap();
            let second = engine.run_matching(march()).await.unwrap();
            prop_assert_eq!(&first.links, &second.links);
            prop_assert_eq!(first.links.len(), statements.len());

            let mut used = HashSet::new();
            for link in &first.links {
                if let Some(ledger_id) = link.ledger_id {
                    prop_assert!(used.insert(ledger_id));
                    prop_assert!(link.scores.total >= 0.6);
                }
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
