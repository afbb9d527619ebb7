//! Audit of the 1-to-1 invariant over persisted links

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::matching::state;
use crate::types::*;

/// A ledger record committed to more than one statement line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictCase {
    pub period: Period,
    pub ledger_id: LedgerId,
    /// Offending statement lines, ascending
    pub statement_ids: Vec<StatementId>,
}

/// All 1-to-1 violations found in a set of links
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConflictReport {
    pub cases: Vec<ConflictCase>,
    pub affected_ledger_count: usize,
    pub affected_statement_count: usize,
}

impl ConflictReport {
    pub fn is_clean(&self) -> bool {
        self.cases.is_empty()
    }
}

/// How to resolve the offenders of a conflict case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationPolicy {
    /// Keep the highest-scoring link (ties: lower statement id), revert the rest
    KeepHighestScore,
    /// Revert every offending link
    RevertAll,
}

/// Find ledger records referenced by more than one EXACT/MANUAL link
///
/// Cases are grouped by period and ordered by (period, ledger id).
pub fn detect(links: &[MatchLink]) -> ConflictReport {
    let mut holders: BTreeMap<(Period, LedgerId), BTreeSet<StatementId>> = BTreeMap::new();
    for link in links {
        if let Some(ledger_id) = link.committed_ledger_id() {
            holders
                .entry((link.period, ledger_id))
                .or_default()
                .insert(link.statement_id);
        }
    }

    let cases: Vec<ConflictCase> = holders
        .into_iter()
        .filter(|(_, statements)| statements.len() > 1)
        .map(|((period, ledger_id), statements)| ConflictCase {
            period,
            ledger_id,
            statement_ids: statements.into_iter().collect(),
        })
        .collect();

    let affected_statement_count = cases.iter().map(|c| c.statement_ids.len()).sum();
    ConflictReport {
        affected_ledger_count: cases.len(),
        affected_statement_count,
        cases,
    }
}

/// Links to revert to NO_MATCH for the given report and policy
pub fn plan_remediation(
    report: &ConflictReport,
    links: &[MatchLink],
    policy: RemediationPolicy,
) -> Vec<MatchLink> {
    let mut reverted = Vec::new();
    for case in &report.cases {
        let mut offenders: Vec<&MatchLink> = links
            .iter()
            .filter(|l| {
                l.period == case.period
                    && l.committed_ledger_id() == Some(case.ledger_id)
                    && case.statement_ids.contains(&l.statement_id)
            })
            .collect();
        offenders.sort_by(|a, b| {
            b.scores
                .total
                .total_cmp(&a.scores.total)
                .then_with(|| a.statement_id.cmp(&b.statement_id))
        });

        let skip = match policy {
            RemediationPolicy::KeepHighestScore => 1,
            RemediationPolicy::RevertAll => 0,
        };
        let note = format!("reverted: ledger {} linked to several statement lines", case.ledger_id);
        reverted.extend(
            offenders
                .into_iter()
                .skip(skip)
                .map(|l| state::revert(l, Some(note.clone()))),
        );
    }
    reverted
}
