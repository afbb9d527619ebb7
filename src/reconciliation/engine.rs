//! Main reconciliation orchestrator that coordinates matching and link actions

use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MatchingConfig;
use crate::matching::{
    conflicts, resolver, scorer, state, AliasNormalizer, Comparable, ConflictReport,
    RemediationPolicy,
};
use crate::reconciliation::{AliasManager, LinkManager, PeriodLocks};
use crate::traits::*;
use crate::types::*;

/// Reconciliation system that orchestrates matching runs and operator actions
pub struct ReconciliationEngine<S: ReconciliationStorage + LedgerMaintenance> {
    storage: S,
    link_manager: LinkManager<S>,
    alias_manager: AliasManager<S>,
    validator: Box<dyn RecordValidator>,
    locks: PeriodLocks,
}

impl<S: ReconciliationStorage + LedgerMaintenance + Clone> ReconciliationEngine<S> {
    /// Create a new engine with the given storage backend
    pub fn new(storage: S) -> Self {
        Self::with_validator(storage, Box::new(DefaultRecordValidator))
    }

    /// Create a new engine with a custom record validator
    pub fn with_validator(storage: S, validator: Box<dyn RecordValidator>) -> Self {
        Self {
            link_manager: LinkManager::new(storage.clone()),
            alias_manager: AliasManager::new(storage.clone()),
            storage,
            validator,
            locks: PeriodLocks::new(),
        }
    }

    /// Match the statement lines of a period against the ledger
    ///
    /// Loads the period, scores and resolves the eligible pairs, applies the
    /// sticky-state rules to the stored links and commits every change in one
    /// batch. Runs for the same period are serialized. Malformed records are
    /// reported as warnings; a missing configuration fails the call.
    ///
    /// Ledger records near the month boundary are shared with the adjacent
    /// periods, whose runs take a different lock. When another writer commits
    /// one of the chosen records first, the run is planned again from fresh
    /// state; if that also loses the race the call fails with
    /// `ConcurrentModification` and the caller should retry it.
    pub async fn run_matching(&self, period: Period) -> ReconResult<ReconciliationOutcome> {
        let month = period.date_range()?;
        let _guard = self.locks.acquire(period).await?;
        info!(%period, "Running matching");

        let config = self
            .storage
            .active_config()
            .await?
            .ok_or(ReconError::ConfigMissing)?;
        config.validate()?;

        let statements = self.storage.statements_for_period(&period).await?;
        let aliases = self.storage.list_aliases(period.account_id).await?;
        let normalizer = AliasNormalizer::for_account(period.account_id, &aliases);

        let mut attempt = 1;
        let plan = loop {
            let plan = self
                .plan_period(period, month, &config, &normalizer, &statements)
                .await?;
            if plan.changes.is_empty() {
                break plan;
            }
            let committed = self.storage.commit_links(&plan.changes).await;
            match committed {
                Ok(_) => break plan,
                Err(err) if attempt < RUN_COMMIT_ATTEMPTS && is_lost_race(&err) => {
                    warn!(%period, attempt, error = %err, "Matching lost a write race, planning again");
                    attempt += 1;
                }
                Err(ReconError::InvariantViolation {
                    ledger_id,
                    statement_id,
                    existing_statement_id,
                }) => {
                    return Err(self
                        .lost_ledger_race(ledger_id, statement_id, existing_statement_id)
                        .await)
                }
                Err(err) => return Err(err),
            }
        };

        let links = self.storage.links_for_period(&period).await?;
        let referenced: HashSet<LedgerId> = links.iter().filter_map(|l| l.ledger_id).collect();
        let month_ledger: Vec<&LedgerRecord> = plan
            .ledger
            .iter()
            .filter(|r| r.date.is_some_and(|d| period.contains(d)))
            .collect();
        let unmatched_ledger: Vec<LedgerRecord> = month_ledger
            .iter()
            .filter(|r| {
                r.linked_statement_id.is_none()
                    && !referenced.contains(&r.id)
                    && !plan.taken.contains(&r.id)
            })
            .map(|r| (*r).clone())
            .collect();

        let statistics = compute_statistics(
            &links,
            statements.len(),
            month_ledger.len(),
            unmatched_ledger.len(),
            plan.skipped_records,
        );
        info!(
            %period,
            changed = plan.changes.len(),
            exact = statistics.exact,
            probable = statistics.probable,
            no_match = statistics.no_match,
            manual = statistics.manual,
            ignored = statistics.ignored,
            unmatched_ledger = statistics.unmatched_ledger,
            skipped = statistics.skipped_records,
            "Matching finished"
        );

        Ok(ReconciliationOutcome {
            period,
            links,
            statistics,
            unmatched_ledger,
            warnings: plan.warnings,
        })
    }

    /// Score and resolve a period against the current stored state
    async fn plan_period(
        &self,
        period: Period,
        month: (NaiveDate, NaiveDate),
        config: &MatchingConfig,
        normalizer: &AliasNormalizer,
        statements: &[StatementRecord],
    ) -> ReconResult<MatchPlan> {
        let existing: HashMap<StatementId, MatchLink> = self
            .storage
            .links_for_period(&period)
            .await?
            .into_iter()
            .map(|link| (link.statement_id, link))
            .collect();

        let mut warnings = Vec::new();

        // Statement side
        let mut eligible = Vec::new();
        for statement in statements {
            if let Err(err) = self.validator.validate_statement(statement) {
                record_warning(&mut warnings, RecordKind::Statement, statement.id, &err);
                continue;
            }
            if statement.is_duplicate {
                debug!(statement_id = statement.id, "Duplicate statement line kept out of matching");
                continue;
            }
            if existing
                .get(&statement.id)
                .is_some_and(|link| link.state.is_sticky())
            {
                continue;
            }
            let text = normalizer.normalize(&statement.description);
            if let Some(view) = Comparable::from_statement(statement, text) {
                eligible.push(view);
            }
        }

        // Ledger side
        let (start, end) = ledger_window(statements, config.date_tolerance_days, month);
        let ledger_records = self
            .storage
            .ledger_records_between(period.account_id, start, end)
            .await?;

        // Held by a confirmed link of this or any other period
        let loaded_ids: Vec<LedgerId> = ledger_records.iter().map(|r| r.id).collect();
        let mut taken: HashSet<LedgerId> = existing
            .values()
            .filter_map(MatchLink::committed_ledger_id)
            .collect();
        taken.extend(
            self.storage
                .committed_links_for_ledgers(&loaded_ids)
                .await?
                .iter()
                .filter_map(MatchLink::committed_ledger_id),
        );

        let mut available = Vec::new();
        let mut ledger = Vec::new();
        for record in &ledger_records {
            if let Err(err) = self.validator.validate_ledger_record(record) {
                record_warning(&mut warnings, RecordKind::Ledger, record.id, &err);
                continue;
            }
            ledger.push(record.clone());
            if record.linked_statement_id.is_some() || taken.contains(&record.id) {
                continue;
            }
            let text = normalizer.normalize(&record.description);
            if let Some(view) = Comparable::from_ledger(record, text) {
                available.push(view);
            }
        }

        let skipped_records = warnings.len();
        self.report_orphans(&existing, &ledger_records, &mut warnings)
            .await?;

        let candidates = scorer::build_candidates(&eligible, &available, config);
        let eligible_ids: Vec<StatementId> = eligible.iter().map(|s| s.id).collect();
        let assignments: HashMap<StatementId, resolver::Assignment> =
            resolver::resolve(&eligible_ids, &candidates, config)
                .into_iter()
                .map(|a| (a.statement_id, a))
                .collect();
        debug!(
            %period,
            eligible = eligible.len(),
            available = available.len(),
            candidates = candidates.len(),
            "Scored candidate pairs"
        );

        let mut changes = Vec::new();
        for statement in statements {
            let current = existing.get(&statement.id);
            let base = current
                .cloned()
                .unwrap_or_else(|| MatchLink::placeholder(period, statement.id));
            match state::apply_assignment(&base, assignments.get(&statement.id), config) {
                Some(next) => changes.push(LinkChange::update(next)),
                None if current.is_none() => changes.push(LinkChange::insert(base)),
                None => {}
            }
        }

        Ok(MatchPlan {
            changes,
            warnings,
            skipped_records,
            ledger,
            taken,
        })
    }

    /// Retryable error for a run whose chosen ledger record was committed by
    /// another writer
    async fn lost_ledger_race(
        &self,
        ledger_id: LedgerId,
        statement_id: StatementId,
        existing_statement_id: StatementId,
    ) -> ReconError {
        warn!(ledger_id, statement_id, existing_statement_id, "Matching lost a write race twice");
        match self.storage.link_for_statement(existing_statement_id).await {
            Ok(Some(holder)) => ReconError::ConcurrentModification {
                link_id: holder.id,
                expected: None,
                found: Some(holder.version),
            },
            Ok(None) => ReconError::InvariantViolation {
                ledger_id,
                statement_id,
                existing_statement_id,
            },
            Err(err) => err,
        }
    }

    // Operator actions
    /// PROBABLE → EXACT
    pub async fn approve_link(&self, link_id: Uuid, actor: &str) -> ReconResult<MatchLink> {
        self.link_manager.approve(link_id, actor).await
    }

    /// Link a statement line to a ledger record by hand
    pub async fn create_manual_link(
        &self,
        statement_id: StatementId,
        ledger_id: LedgerId,
        actor: &str,
        note: Option<String>,
    ) -> ReconResult<MatchLink> {
        self.link_manager
            .create_manual_link(statement_id, ledger_id, actor, note)
            .await
    }

    /// Return a statement line to NO_MATCH
    pub async fn unlink(&self, statement_id: StatementId) -> ReconResult<MatchLink> {
        self.link_manager.unlink(statement_id).await
    }

    /// Exclude a statement line from automatic matching
    pub async fn ignore_link(
        &self,
        statement_id: StatementId,
        actor: &str,
        reason: Option<String>,
    ) -> ReconResult<MatchLink> {
        self.link_manager.ignore(statement_id, actor, reason).await
    }

    /// Create ledger records for unmatched statement lines and link them
    pub async fn bulk_create_ledger_from_unmatched(
        &self,
        items: &[BulkCreateItem],
        actor: &str,
    ) -> ReconResult<BulkCreateOutcome> {
        self.link_manager
            .bulk_create_from_unmatched(items, actor)
            .await
    }

    // Invariant audit
    /// Report ledger records committed to more than one statement line
    pub async fn detect_conflicts(&self, period: Period) -> ReconResult<ConflictReport> {
        let links = self.storage.links_for_period(&period).await?;
        let report = conflicts::detect(&links);
        if !report.is_clean() {
            warn!(
                %period,
                ledger = report.affected_ledger_count,
                statements = report.affected_statement_count,
                "Found one-to-many links"
            );
        }
        Ok(report)
    }

    /// Revert offending links of a period according to `policy`
    pub async fn remediate_conflicts(
        &self,
        period: Period,
        policy: RemediationPolicy,
    ) -> ReconResult<Vec<MatchLink>> {
        let _guard = self.locks.acquire(period).await?;
        let links = self.storage.links_for_period(&period).await?;
        let report = conflicts::detect(&links);
        let reverted = conflicts::plan_remediation(&report, &links, policy);
        if reverted.is_empty() {
            return Ok(reverted);
        }

        let changes: Vec<LinkChange> = reverted.into_iter().map(LinkChange::update).collect();
        let stored = self.storage.commit_links(&changes).await?;
        info!(%period, ?policy, reverted = stored.len(), "Remediated one-to-many links");
        Ok(stored)
    }

    // Configuration
    /// Get the active matching configuration
    pub async fn get_config(&self) -> ReconResult<MatchingConfig> {
        self.storage
            .active_config()
            .await?
            .ok_or(ReconError::ConfigMissing)
    }

    /// Validate and replace the active matching configuration
    pub async fn update_config(&self, config: MatchingConfig) -> ReconResult<MatchingConfig> {
        config.validate()?;
        self.storage.save_config(&config).await?;
        info!(
            weight_date = config.weight_date,
            weight_value = config.weight_value,
            weight_description = config.weight_description,
            probable_threshold = config.probable_threshold,
            exact_threshold = config.exact_threshold,
            "Updated matching configuration"
        );
        Ok(config)
    }

    // Alias rules
    /// List the alias rules of an account
    pub async fn list_aliases(&self, account_id: AccountId) -> ReconResult<Vec<AliasRule>> {
        self.alias_manager.list(account_id).await
    }

    /// Create an alias rule
    pub async fn create_alias(
        &self,
        account_id: AccountId,
        pattern: String,
        replacement: String,
    ) -> ReconResult<AliasRule> {
        self.alias_manager
            .create(account_id, pattern, replacement)
            .await
    }

    /// Update an alias rule
    pub async fn update_alias(
        &self,
        alias_id: Uuid,
        pattern: String,
        replacement: String,
    ) -> ReconResult<AliasRule> {
        self.alias_manager
            .update(alias_id, pattern, replacement)
            .await
    }

    /// Delete an alias rule
    pub async fn delete_alias(&self, alias_id: Uuid) -> ReconResult<()> {
        self.alias_manager.delete(alias_id).await
    }

    /// Warn about confirmed links whose ledger record no longer exists
    ///
    /// Such links are left alone; PROBABLE ones are re-resolved by the run.
    async fn report_orphans(
        &self,
        existing: &HashMap<StatementId, MatchLink>,
        loaded: &[LedgerRecord],
        warnings: &mut Vec<RecordWarning>,
    ) -> ReconResult<()> {
        let loaded_ids: HashSet<LedgerId> = loaded.iter().map(|r| r.id).collect();
        for link in existing.values() {
            let Some(ledger_id) = link.committed_ledger_id() else {
                continue;
            };
            if loaded_ids.contains(&ledger_id)
                || self.storage.get_ledger_record(ledger_id).await?.is_some()
            {
                continue;
            }
            warn!(
                statement_id = link.statement_id,
                ledger_id,
                state = %link.state,
                "Confirmed link points to a missing ledger record"
            );
            warnings.push(RecordWarning {
                kind: RecordKind::Statement,
                record_id: link.statement_id,
                message: format!(
                    "{} link points to missing ledger record {}",
                    link.state, ledger_id
                ),
            });
        }
        Ok(())
    }
}

const RUN_COMMIT_ATTEMPTS: usize = 2;

/// Link writes planned by one matching pass
struct MatchPlan {
    changes: Vec<LinkChange>,
    warnings: Vec<RecordWarning>,
    skipped_records: usize,
    /// Well-formed ledger records of the window
    ledger: Vec<LedgerRecord>,
    /// Ledger records held by a confirmed link before the pass
    taken: HashSet<LedgerId>,
}

fn is_lost_race(err: &ReconError) -> bool {
    matches!(
        err,
        ReconError::InvariantViolation { .. } | ReconError::ConcurrentModification { .. }
    )
}

/// Dates of the ledger records to load for a period
///
/// Covers the calendar month, widened to the statement lines' dates plus or
/// minus the date tolerance.
fn ledger_window(
    statements: &[StatementRecord],
    tolerance_days: u32,
    month: (NaiveDate, NaiveDate),
) -> (NaiveDate, NaiveDate) {
    let dates = statements.iter().filter_map(|s| s.date);
    let (Some(first), Some(last)) = (dates.clone().min(), dates.max()) else {
        return month;
    };
    let pad = chrono::Duration::days(i64::from(tolerance_days));
    let start = first.checked_sub_signed(pad).unwrap_or(first);
    let end = last.checked_add_signed(pad).unwrap_or(last);
    (start.min(month.0), end.max(month.1))
}

fn record_warning(
    warnings: &mut Vec<RecordWarning>,
    kind: RecordKind,
    record_id: i64,
    err: &ReconError,
) {
    warn!(%kind, record_id, error = %err, "Skipping malformed record");
    warnings.push(RecordWarning {
        kind,
        record_id,
        message: err.to_string(),
    });
}

fn compute_statistics(
    links: &[MatchLink],
    total_statements: usize,
    total_ledger: usize,
    unmatched_ledger: usize,
    skipped_records: usize,
) -> MatchStatistics {
    let count = |state: MatchState| links.iter().filter(|l| l.state == state).count();
    let pct = |n: usize| {
        if total_statements == 0 {
            0.0
        } else {
            (n as f64 * 10_000.0 / total_statements as f64).round() / 100.0
        }
    };

    let exact = count(MatchState::Exact);
    let probable = count(MatchState::Probable);
    let no_match = count(MatchState::NoMatch);
    let manual = count(MatchState::Manual);
    let ignored = count(MatchState::Ignored);

    MatchStatistics {
        total_statements,
        total_ledger,
        exact,
        probable,
        no_match,
        manual,
        ignored,
        exact_pct: pct(exact),
        probable_pct: pct(probable),
        no_match_pct: pct(no_match),
        manual_pct: pct(manual),
        ignored_pct: pct(ignored),
        unmatched_ledger,
        skipped_records,
    }
}
