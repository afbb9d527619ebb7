//! Traits for storage abstraction and extensibility

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::config::MatchingConfig;
use crate::types::*;

/// Storage abstraction for reconciliation data
///
/// Statement and ledger records are owned by ingestion and only read here.
/// Links are written exclusively through [`ReconciliationStorage::commit_links`],
/// which must apply a batch atomically. Methods take `&self`: implementations
/// are shared between concurrent requests and manage their own locking.
#[async_trait]
pub trait ReconciliationStorage: Send + Sync {
    /// Get the active matching configuration, if one was created
    async fn active_config(&self) -> ReconResult<Option<MatchingConfig>>;

    /// Replace the active matching configuration
    async fn save_config(&self, config: &MatchingConfig) -> ReconResult<()>;

    /// List statement lines ingested under a period
    async fn statements_for_period(&self, period: &Period) -> ReconResult<Vec<StatementRecord>>;

    /// Get a statement line by ID
    async fn get_statement(&self, statement_id: StatementId)
        -> ReconResult<Option<StatementRecord>>;

    /// List ledger records of an account dated within `[start, end]`
    ///
    /// Records of the account with no date at all are included so that the
    /// caller can report them.
    async fn ledger_records_between(
        &self,
        account_id: AccountId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> ReconResult<Vec<LedgerRecord>>;

    /// Get a ledger record by ID
    async fn get_ledger_record(&self, ledger_id: LedgerId) -> ReconResult<Option<LedgerRecord>>;

    /// List links of a period
    async fn links_for_period(&self, period: &Period) -> ReconResult<Vec<MatchLink>>;

    /// Get a link by ID
    async fn get_link(&self, link_id: Uuid) -> ReconResult<Option<MatchLink>>;

    /// Get the link of a statement line
    async fn link_for_statement(&self, statement_id: StatementId)
        -> ReconResult<Option<MatchLink>>;

    /// Get the EXACT/MANUAL link holding a ledger record, in any period
    async fn committed_link_for_ledger(&self, ledger_id: LedgerId)
        -> ReconResult<Option<MatchLink>>;

    /// Get the EXACT/MANUAL links, in any period, holding any of `ledger_ids`
    async fn committed_links_for_ledgers(
        &self,
        ledger_ids: &[LedgerId],
    ) -> ReconResult<Vec<MatchLink>>;

    /// Apply a batch of link writes atomically
    ///
    /// Fails with `ConcurrentModification` when a stored version differs from
    /// the expected one, and with `InvariantViolation` when a ledger record
    /// would end up committed to two statement lines. Nothing is written on
    /// failure. Keeps `LedgerRecord::linked_statement_id` in step with the
    /// committed links and returns the stored links.
    async fn commit_links(&self, changes: &[LinkChange]) -> ReconResult<Vec<MatchLink>>;

    /// List alias rules of an account
    async fn list_aliases(&self, account_id: AccountId) -> ReconResult<Vec<AliasRule>>;

    /// Get an alias rule by ID
    async fn get_alias(&self, alias_id: Uuid) -> ReconResult<Option<AliasRule>>;

    /// Insert or replace an alias rule
    async fn save_alias(&self, alias: &AliasRule) -> ReconResult<()>;

    /// Delete an alias rule
    async fn delete_alias(&self, alias_id: Uuid) -> ReconResult<()>;
}

/// Ledger-maintenance collaborator used when legalizing unmatched statement lines
#[async_trait]
pub trait LedgerMaintenance: Send + Sync {
    /// Find a ledger record identical to the given movement that no statement
    /// line holds a committed link to
    ///
    /// A missing reference and an empty one are the same reference.
    async fn find_free_ledger_record(
        &self,
        account_id: AccountId,
        date: NaiveDate,
        amount: &BigDecimal,
        description: &str,
        reference: Option<&str>,
    ) -> ReconResult<Option<LedgerRecord>>;

    /// Create a new, unclassified ledger record
    async fn create_ledger_record(&self, record: &NewLedgerRecord) -> ReconResult<LedgerRecord>;
}

/// Trait for deciding whether a record can take part in matching
pub trait RecordValidator: Send + Sync {
    /// Validate a statement line before scoring
    fn validate_statement(&self, statement: &StatementRecord) -> ReconResult<()>;

    /// Validate a ledger record before scoring
    fn validate_ledger_record(&self, record: &LedgerRecord) -> ReconResult<()>;
}

/// Default validator: a record needs a date and an amount
pub struct DefaultRecordValidator;

impl RecordValidator for DefaultRecordValidator {
    fn validate_statement(&self, statement: &StatementRecord) -> ReconResult<()> {
        crate::utils::validation::require_date_and_amount(
            RecordKind::Statement,
            statement.id,
            statement.date.as_ref(),
            statement.amount.as_ref(),
        )
    }

    fn validate_ledger_record(&self, record: &LedgerRecord) -> ReconResult<()> {
        crate::utils::validation::require_date_and_amount(
            RecordKind::Ledger,
            record.id,
            record.date.as_ref(),
            record.amount.as_ref(),
        )
    }
}
