//! Pairwise scoring of statement lines against ledger records

use bigdecimal::{BigDecimal, Signed, ToPrimitive, Zero};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::config::MatchingConfig;
use crate::types::*;

/// The scoring-relevant view of a well-formed record
#[derive(Debug, Clone, PartialEq)]
pub struct Comparable {
    pub id: i64,
    pub date: NaiveDate,
    pub amount: BigDecimal,
    /// Normalized description
    pub text: String,
}

impl Comparable {
    /// View of a statement line; `None` when date or amount is missing
    pub fn from_statement(statement: &StatementRecord, text: String) -> Option<Self> {
        Some(Self {
            id: statement.id,
            date: statement.date?,
            amount: statement.amount.clone()?,
            text,
        })
    }

    /// View of a ledger record; `None` when date or amount is missing
    pub fn from_ledger(record: &LedgerRecord, text: String) -> Option<Self> {
        Some(Self {
            id: record.id,
            date: record.date?,
            amount: record.amount.clone()?,
            text,
        })
    }
}

/// A scored pair that survived pruning
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub statement_id: StatementId,
    pub ledger_id: LedgerId,
    pub scores: ScoreBreakdown,
}

/// 1.0 on the same day, decaying linearly to 0 at `tolerance_days`
pub fn score_date(a: NaiveDate, b: NaiveDate, tolerance_days: u32) -> f64 {
    let days = (a - b).num_days().unsigned_abs();
    if days == 0 {
        return 1.0;
    }
    let tolerance = u64::from(tolerance_days);
    if days >= tolerance {
        return 0.0;
    }
    round4(1.0 - days as f64 / tolerance as f64)
}

/// 1.0 on equal amounts, decaying linearly to 0 at `tolerance_fraction` of
/// relative difference; opposite signs always score 0
pub fn score_value(a: &BigDecimal, b: &BigDecimal, tolerance_fraction: f64) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.sign() != b.sign() {
        return 0.0;
    }

    let magnitude = a.abs().max(b.abs());
    if magnitude.is_zero() {
        return 1.0;
    }
    let difference = (a - b).abs();
    let relative = match (&difference / &magnitude).to_f64() {
        Some(ratio) => ratio,
        None => return 0.0,
    };

    if tolerance_fraction <= 0.0 || relative >= tolerance_fraction {
        return 0.0;
    }
    round4(1.0 - relative / tolerance_fraction)
}

/// Token-set Jaccard similarity of two normalized descriptions
///
/// Two empty descriptions score 0: absence of text is not a match signal.
pub fn score_description(a: &str, b: &str) -> f64 {
    let left: BTreeSet<&str> = a.split_whitespace().collect();
    let right: BTreeSet<&str> = b.split_whitespace().collect();
    if left.is_empty() && right.is_empty() {
        return 0.0;
    }

    let shared = left.intersection(&right).count();
    let union = left.union(&right).count();
    round4(shared as f64 / union as f64)
}

/// Full score breakdown of a pair, without pruning
pub fn score(statement: &Comparable, ledger: &Comparable, config: &MatchingConfig) -> ScoreBreakdown {
    let date = score_date(statement.date, ledger.date, config.date_tolerance_days);
    let value = score_value(
        &statement.amount,
        &ledger.amount,
        config.value_tolerance_fraction,
    );
    let mut description = score_description(&statement.text, &ledger.text);
    if description < config.min_description_similarity {
        description = 0.0;
    }

    ScoreBreakdown {
        date,
        value,
        description,
        total: round4(config.weighted_total(date, value, description)),
    }
}

/// Score a pair and prune it when its date or amount is out of tolerance
///
/// Description similarity never rescues a pruned pair.
pub fn candidate(
    statement: &Comparable,
    ledger: &Comparable,
    config: &MatchingConfig,
) -> Option<Candidate> {
    let scores = score(statement, ledger, config);
    if scores.date == 0.0 || scores.value == 0.0 {
        return None;
    }
    Some(Candidate {
        statement_id: statement.id,
        ledger_id: ledger.id,
        scores,
    })
}

/// All unpruned pairs between two sets of records
pub fn build_candidates(
    statements: &[Comparable],
    ledger: &[Comparable],
    config: &MatchingConfig,
) -> Vec<Candidate> {
    statements
        .iter()
        .flat_map(|s| ledger.iter().filter_map(move |l| candidate(s, l, config)))
        .collect()
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
