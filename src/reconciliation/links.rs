//! Operator actions on individual links

use tracing::{info, warn};
use uuid::Uuid;

use crate::matching::{scorer, state, AliasNormalizer, Comparable};
use crate::traits::*;
use crate::types::*;
use crate::utils::validation::{validate_actor, validate_note};

const BULK_CREATE_NOTE: &str = "created from statement";
const BULK_CREATE_DETAIL: &str = "created from reconciliation";

/// Link manager for manual link, approval, unlink and ignore actions
///
/// Each action is a single-record write checked against the version it was
/// read at; conflicting writes fail with `ConcurrentModification` and must be
/// retried on fresh state.
pub struct LinkManager<S: ReconciliationStorage + LedgerMaintenance> {
    storage: S,
}

impl<S: ReconciliationStorage + LedgerMaintenance> LinkManager<S> {
    /// Create a new link manager
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// PROBABLE → EXACT
    pub async fn approve(&self, link_id: Uuid, actor: &str) -> ReconResult<MatchLink> {
        validate_actor(actor)?;
        let link = self
            .storage
            .get_link(link_id)
            .await?
            .ok_or_else(|| ReconError::NotFound(format!("link {}", link_id)))?;

        let approved = state::approve(&link, actor)?;
        if let Some(ledger_id) = approved.ledger_id {
            self.require_ledger_record(ledger_id).await?;
            self.ensure_ledger_free(ledger_id, approved.statement_id)
                .await?;
        }

        let stored = self.commit_one(approved).await?;
        info!(
            link_id = %stored.id,
            statement_id = stored.statement_id,
            ledger_id = ?stored.ledger_id,
            actor,
            "Approved probable link"
        );
        Ok(stored)
    }

    /// Link a statement line to a ledger record by hand
    pub async fn create_manual_link(
        &self,
        statement_id: StatementId,
        ledger_id: LedgerId,
        actor: &str,
        note: Option<String>,
    ) -> ReconResult<MatchLink> {
        validate_actor(actor)?;
        if let Some(ref note) = note {
            validate_note(note)?;
        }

        let statement = self.require_statement(statement_id).await?;
        let record = self.require_ledger_record(ledger_id).await?;
        if record.account_id != statement.account_id {
            return Err(ReconError::Validation(format!(
                "Ledger record {} belongs to account {}, statement line {} to account {}",
                ledger_id, record.account_id, statement_id, statement.account_id
            )));
        }
        self.ensure_ledger_free(ledger_id, statement_id).await?;

        let current = self.current_link(&statement).await?;
        let scores = self.audit_scores(&statement, &record).await?;
        let stored = self
            .commit_one(state::link_manually(&current, ledger_id, scores, actor, note))
            .await?;
        info!(
            statement_id,
            ledger_id,
            actor,
            previous_state = %current.state,
            "Created manual link"
        );
        Ok(stored)
    }

    /// Any state → NO_MATCH
    pub async fn unlink(&self, statement_id: StatementId) -> ReconResult<MatchLink> {
        let link = self
            .storage
            .link_for_statement(statement_id)
            .await?
            .ok_or_else(|| ReconError::NotFound(format!("link for statement {}", statement_id)))?;

        let next = state::unlink(&link);
        if next.same_decision(&link) {
            return Ok(link);
        }

        let stored = self.commit_one(next).await?;
        info!(statement_id, previous_state = %link.state, "Unlinked statement line");
        Ok(stored)
    }

    /// Any state → IGNORED
    pub async fn ignore(
        &self,
        statement_id: StatementId,
        actor: &str,
        reason: Option<String>,
    ) -> ReconResult<MatchLink> {
        validate_actor(actor)?;
        if let Some(ref reason) = reason {
            validate_note(reason)?;
        }

        let statement = self.require_statement(statement_id).await?;
        let current = self.current_link(&statement).await?;
        let stored = self
            .commit_one(state::ignore(&current, actor, reason))
            .await?;
        info!(statement_id, actor, "Ignored statement line");
        Ok(stored)
    }

    /// Legalize unmatched statement lines by creating (or reusing) ledger
    /// records and linking them manually
    ///
    /// Failures are collected per item; the call itself only fails on an
    /// invalid actor.
    pub async fn bulk_create_from_unmatched(
        &self,
        items: &[BulkCreateItem],
        actor: &str,
    ) -> ReconResult<BulkCreateOutcome> {
        validate_actor(actor)?;
        let mut outcome = BulkCreateOutcome::default();

        for item in items {
            match self.create_for_item(item, actor).await {
                Ok((link, created)) => {
                    if created {
                        outcome.created += 1;
                    }
                    outcome.links.push(link);
                }
                Err(err) => {
                    warn!(statement_id = item.statement_id, error = %err, "Bulk ledger creation failed");
                    outcome
                        .errors
                        .push(format!("statement {}: {}", item.statement_id, err));
                }
            }
        }

        info!(
            requested = items.len(),
            created = outcome.created,
            linked = outcome.links.len(),
            failed = outcome.errors.len(),
            "Bulk ledger creation finished"
        );
        Ok(outcome)
    }

    async fn create_for_item(
        &self,
        item: &BulkCreateItem,
        actor: &str,
    ) -> ReconResult<(MatchLink, bool)> {
        let statement = self.require_statement(item.statement_id).await?;
        let current = self.current_link(&statement).await?;
        if current.state.is_committed() {
            return Err(ReconError::InvalidTransition {
                from: current.state,
                action: "create a ledger record for",
            });
        }

        let date = item.date.or(statement.date);
        let (date, amount) = match (date, statement.amount.clone()) {
            (Some(date), Some(amount)) => (date, amount),
            _ => {
                return Err(ReconError::RecordMalformed {
                    kind: RecordKind::Statement,
                    id: statement.id,
                    reason: "missing date or amount".to_string(),
                })
            }
        };
        let description = item
            .description
            .clone()
            .unwrap_or_else(|| statement.description.clone());

        let reused = self
            .storage
            .find_free_ledger_record(
                statement.account_id,
                date,
                &amount,
                &description,
                statement.reference.as_deref(),
            )
            .await?;
        let (record, created) = match reused {
            Some(record) => (record, false),
            None => {
                let record = self
                    .storage
                    .create_ledger_record(&NewLedgerRecord {
                        account_id: statement.account_id,
                        date,
                        description,
                        reference: statement.reference.clone(),
                        amount,
                        foreign_amount: statement.foreign_amount.clone(),
                        fx_rate: statement.fx_rate.clone(),
                        detail: Some(BULK_CREATE_DETAIL.to_string()),
                    })
                    .await?;
                (record, true)
            }
        };

        let scores = self.audit_scores(&statement, &record).await?;
        let link = state::link_manually(
            &current,
            record.id,
            scores,
            actor,
            Some(BULK_CREATE_NOTE.to_string()),
        );
        let stored = self.commit_one(link).await?;
        Ok((stored, created))
    }

    /// Existing link of a statement line, or a fresh NO_MATCH placeholder
    async fn current_link(&self, statement: &StatementRecord) -> ReconResult<MatchLink> {
        Ok(self
            .storage
            .link_for_statement(statement.id)
            .await?
            .unwrap_or_else(|| MatchLink::placeholder(statement.period(), statement.id)))
    }

    async fn ensure_ledger_free(
        &self,
        ledger_id: LedgerId,
        statement_id: StatementId,
    ) -> ReconResult<()> {
        if let Some(holder) = self.storage.committed_link_for_ledger(ledger_id).await? {
            if holder.statement_id != statement_id {
                return Err(ReconError::InvariantViolation {
                    ledger_id,
                    statement_id,
                    existing_statement_id: holder.statement_id,
                });
            }
        }
        Ok(())
    }

    /// Scores recorded on operator-created links for audit
    async fn audit_scores(
        &self,
        statement: &StatementRecord,
        record: &LedgerRecord,
    ) -> ReconResult<ScoreBreakdown> {
        let config = match self.storage.active_config().await? {
            Some(config) => config,
            None => return Ok(ScoreBreakdown::zero()),
        };
        let aliases = self.storage.list_aliases(statement.account_id).await?;
        let normalizer = AliasNormalizer::for_account(statement.account_id, &aliases);

        let left = Comparable::from_statement(statement, normalizer.normalize(&statement.description));
        let right = Comparable::from_ledger(record, normalizer.normalize(&record.description));
        Ok(match (left, right) {
            (Some(left), Some(right)) => scorer::score(&left, &right, &config),
            _ => ScoreBreakdown::zero(),
        })
    }

    async fn require_statement(&self, statement_id: StatementId) -> ReconResult<StatementRecord> {
        self.storage
            .get_statement(statement_id)
            .await?
            .ok_or_else(|| ReconError::NotFound(format!("statement line {}", statement_id)))
    }

    async fn require_ledger_record(&self, ledger_id: LedgerId) -> ReconResult<LedgerRecord> {
        self.storage
            .get_ledger_record(ledger_id)
            .await?
            .ok_or_else(|| ReconError::NotFound(format!("ledger record {}", ledger_id)))
    }

    async fn commit_one(&self, link: MatchLink) -> ReconResult<MatchLink> {
        self.storage
            .commit_links(&[LinkChange::update(link)])
            .await?
            .pop()
            .ok_or_else(|| ReconError::Storage("commit returned no link".to_string()))
    }
}
