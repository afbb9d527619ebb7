//! Core types and data structures for the reconciliation engine

use bigdecimal::BigDecimal;
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a bank account as known to ingestion
pub type AccountId = i64;
/// Identifier of a statement ("extracto") line
pub type StatementId = i64;
/// Identifier of a ledger ("sistema") movement
pub type LedgerId = i64;

/// An (account, year, month) reconciliation period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Period {
    pub account_id: AccountId,
    pub year: i32,
    pub month: u32,
}

impl Period {
    /// Create a new period
    pub fn new(account_id: AccountId, year: i32, month: u32) -> Self {
        Self {
            account_id,
            year,
            month,
        }
    }

    /// First and last calendar day of the period
    pub fn date_range(&self) -> ReconResult<(NaiveDate, NaiveDate)> {
        let first = NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .ok_or_else(|| ReconError::Validation(format!("Invalid period: {}", self)))?;
        let next_month = if self.month == 12 {
            NaiveDate::from_ymd_opt(self.year + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(self.year, self.month + 1, 1)
        };
        let last = next_month
            .and_then(|d| d.pred_opt())
            .ok_or_else(|| ReconError::Validation(format!("Invalid period: {}", self)))?;
        Ok((first, last))
    }

    /// Whether a date falls inside the calendar month
    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:04}-{:02}", self.account_id, self.year, self.month)
    }
}

/// A bank statement line, as produced by ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementRecord {
    pub id: StatementId,
    pub account_id: AccountId,
    /// Statement year/month the line was ingested under
    pub year: i32,
    pub month: u32,
    /// Transaction date; `None` when the parser could not read it
    pub date: Option<NaiveDate>,
    /// Raw description as printed on the statement
    pub description: String,
    /// Description as canonicalized at ingestion time
    pub normalized_description: String,
    pub reference: Option<String>,
    /// Signed amount in functional currency; `None` when unreadable
    pub amount: Option<BigDecimal>,
    pub foreign_amount: Option<BigDecimal>,
    pub fx_rate: Option<BigDecimal>,
    /// Line number in the source document
    pub line_number: Option<u32>,
    /// Set by ingestion when the line repeats another one
    pub is_duplicate: bool,
}

impl StatementRecord {
    /// Create a well-formed statement line for the period of its date
    pub fn new(
        id: StatementId,
        account_id: AccountId,
        date: NaiveDate,
        description: String,
        amount: BigDecimal,
    ) -> Self {
        Self {
            id,
            account_id,
            year: date.year(),
            month: date.month(),
            date: Some(date),
            normalized_description: String::new(),
            description,
            reference: None,
            amount: Some(amount),
            foreign_amount: None,
            fx_rate: None,
            line_number: None,
            is_duplicate: false,
        }
    }

    /// The period this line belongs to
    pub fn period(&self) -> Period {
        Period::new(self.account_id, self.year, self.month)
    }
}

/// A movement recorded in the organization's ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub id: LedgerId,
    pub account_id: AccountId,
    pub date: Option<NaiveDate>,
    pub description: String,
    pub reference: Option<String>,
    pub amount: Option<BigDecimal>,
    pub foreign_amount: Option<BigDecimal>,
    pub fx_rate: Option<BigDecimal>,
    /// Classification fields, opaque to matching
    pub third_party_id: Option<String>,
    pub cost_center_id: Option<String>,
    pub concept_id: Option<String>,
    /// Statement line holding a confirmed (EXACT/MANUAL) link to this record
    pub linked_statement_id: Option<StatementId>,
}

impl LedgerRecord {
    /// Create a well-formed, unclassified ledger record
    pub fn new(
        id: LedgerId,
        account_id: AccountId,
        date: NaiveDate,
        description: String,
        amount: BigDecimal,
    ) -> Self {
        Self {
            id,
            account_id,
            date: Some(date),
            description,
            reference: None,
            amount: Some(amount),
            foreign_amount: None,
            fx_rate: None,
            third_party_id: None,
            cost_center_id: None,
            concept_id: None,
            linked_statement_id: None,
        }
    }
}

/// Fields needed to create a ledger record through the maintenance collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLedgerRecord {
    pub account_id: AccountId,
    pub date: NaiveDate,
    pub description: String,
    pub reference: Option<String>,
    pub amount: BigDecimal,
    pub foreign_amount: Option<BigDecimal>,
    pub fx_rate: Option<BigDecimal>,
    pub detail: Option<String>,
}

/// State of a match link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchState {
    /// No counterpart found (placeholder)
    NoMatch,
    /// Candidate found with moderate confidence, awaiting approval
    Probable,
    /// High-confidence match, or an approved probable one
    Exact,
    /// Operator-created link
    Manual,
    /// Excluded by an operator from automatic matching
    Ignored,
}

impl MatchState {
    /// States that an automatic run never overwrites
    pub fn is_sticky(&self) -> bool {
        matches!(self, MatchState::Exact | MatchState::Manual | MatchState::Ignored)
    }

    /// States whose ledger id is covered by the 1-to-1 invariant
    pub fn is_committed(&self) -> bool {
        matches!(self, MatchState::Exact | MatchState::Manual)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchState::NoMatch => "NO_MATCH",
            MatchState::Probable => "PROBABLE",
            MatchState::Exact => "EXACT",
            MatchState::Manual => "MANUAL",
            MatchState::Ignored => "IGNORED",
        }
    }
}

impl fmt::Display for MatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Three-part similarity score of a statement/ledger pair, each in [0, 1]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    #[serde(rename = "score_date")]
    pub date: f64,
    #[serde(rename = "score_value")]
    pub value: f64,
    #[serde(rename = "score_description")]
    pub description: f64,
    #[serde(rename = "score_total")]
    pub total: f64,
}

impl ScoreBreakdown {
    pub fn zero() -> Self {
        Self::default()
    }
}

/// The persisted reconciliation fact for one statement line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchLink {
    pub id: Uuid,
    pub period: Period,
    pub statement_id: StatementId,
    pub ledger_id: Option<LedgerId>,
    pub state: MatchState,
    #[serde(flatten)]
    pub scores: ScoreBreakdown,
    pub note: Option<String>,
    pub actor: Option<String>,
    /// Optimistic-lock version, bumped by storage on every write (0 = never stored)
    pub version: u64,
    pub updated_at: NaiveDateTime,
}

impl MatchLink {
    /// A NO_MATCH placeholder for a statement line that has no link yet
    pub fn placeholder(period: Period, statement_id: StatementId) -> Self {
        Self {
            id: Uuid::new_v4(),
            period,
            statement_id,
            ledger_id: None,
            state: MatchState::NoMatch,
            scores: ScoreBreakdown::zero(),
            note: None,
            actor: None,
            version: 0,
            updated_at: chrono::Utc::now().naive_utc(),
        }
    }

    /// Ledger id when the link is EXACT or MANUAL
    pub fn committed_ledger_id(&self) -> Option<LedgerId> {
        if self.state.is_committed() {
            self.ledger_id
        } else {
            None
        }
    }

    /// Whether two versions of a link carry the same reconciliation decision
    pub fn same_decision(&self, other: &MatchLink) -> bool {
        self.state == other.state
            && self.ledger_id == other.ledger_id
            && self.scores == other.scores
            && self.note == other.note
            && self.actor == other.actor
    }
}

/// A pending write of one link, checked against its stored version
#[derive(Debug, Clone, PartialEq)]
pub struct LinkChange {
    pub link: MatchLink,
    /// `None` inserts a new link; `Some(v)` requires the stored version to be `v`
    pub expected_version: Option<u64>,
}

impl LinkChange {
    pub fn insert(link: MatchLink) -> Self {
        Self {
            link,
            expected_version: None,
        }
    }

    /// Update a previously loaded link, keyed on the version it was read at
    pub fn update(link: MatchLink) -> Self {
        let expected_version = if link.version == 0 {
            None
        } else {
            Some(link.version)
        };
        Self {
            link,
            expected_version,
        }
    }
}

/// Account-scoped description rewrite rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasRule {
    pub id: Uuid,
    pub account_id: AccountId,
    /// Literal fragment, matched case-insensitively with whitespace collapsed
    pub pattern: String,
    pub replacement: String,
    pub created_at: NaiveDateTime,
}

impl AliasRule {
    pub fn new(account_id: AccountId, pattern: String, replacement: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            pattern,
            replacement,
            created_at: chrono::Utc::now().naive_utc(),
        }
    }
}

/// Which side of the reconciliation a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Statement,
    Ledger,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Statement => f.write_str("statement"),
            RecordKind::Ledger => f.write_str("ledger"),
        }
    }
}

/// A record-level problem recovered during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordWarning {
    pub kind: RecordKind,
    pub record_id: i64,
    pub message: String,
}

/// Counts and percentages of a reconciled period
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MatchStatistics {
    pub total_statements: usize,
    pub total_ledger: usize,
    pub exact: usize,
    pub probable: usize,
    pub no_match: usize,
    pub manual: usize,
    pub ignored: usize,
    pub exact_pct: f64,
    pub probable_pct: f64,
    pub no_match_pct: f64,
    pub manual_pct: f64,
    pub ignored_pct: f64,
    /// Ledger records of the month that nothing references ("in transit")
    pub unmatched_ledger: usize,
    /// Records left out of candidacy because they were malformed
    pub skipped_records: usize,
}

/// Result of running the matching for one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationOutcome {
    pub period: Period,
    pub links: Vec<MatchLink>,
    pub statistics: MatchStatistics,
    pub unmatched_ledger: Vec<LedgerRecord>,
    pub warnings: Vec<RecordWarning>,
}

/// One request of a bulk ledger creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkCreateItem {
    pub statement_id: StatementId,
    /// Overrides the statement date for the new ledger record
    pub date: Option<NaiveDate>,
    /// Overrides the statement description for the new ledger record
    pub description: Option<String>,
}

impl BulkCreateItem {
    pub fn for_statement(statement_id: StatementId) -> Self {
        Self {
            statement_id,
            date: None,
            description: None,
        }
    }
}

/// Outcome of a bulk ledger creation
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BulkCreateOutcome {
    /// Ledger records newly created (reused ones are not counted)
    pub created: usize,
    pub links: Vec<MatchLink>,
    pub errors: Vec<String>,
}

/// Errors that can occur in the reconciliation engine
#[derive(Debug, thiserror::Error)]
pub enum ReconError {
    #[error("No active matching configuration")]
    ConfigMissing,
    #[error("Malformed {kind} record {id}: {reason}")]
    RecordMalformed {
        kind: RecordKind,
        id: i64,
        reason: String,
    },
    #[error(
        "Ledger record {ledger_id} is already linked to statement {existing_statement_id}; \
         cannot link it to statement {statement_id}"
    )]
    InvariantViolation {
        ledger_id: LedgerId,
        statement_id: StatementId,
        existing_statement_id: StatementId,
    },
    #[error("Link {link_id} was modified concurrently (expected version {expected:?}, found {found:?})")]
    ConcurrentModification {
        link_id: Uuid,
        expected: Option<u64>,
        found: Option<u64>,
    },
    #[error("Cannot {action} a link in state {from}")]
    InvalidTransition {
        from: MatchState,
        action: &'static str,
    },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result type for reconciliation operations
pub type ReconResult<T> = Result<T, ReconError>;
