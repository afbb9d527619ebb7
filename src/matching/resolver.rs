//! Conflict-free 1-to-1 assignment of candidates

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::config::MatchingConfig;
use crate::matching::scorer::Candidate;
use crate::types::*;

/// Resolved counterpart of one statement line
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub statement_id: StatementId,
    pub ledger_id: Option<LedgerId>,
    pub scores: ScoreBreakdown,
}

impl Assignment {
    fn unassigned(statement_id: StatementId) -> Self {
        Self {
            statement_id,
            ledger_id: None,
            scores: ScoreBreakdown::zero(),
        }
    }
}

/// Greedy maximum-weight assignment
///
/// Candidates below `probable_threshold` are discarded. The rest are taken in
/// descending `score_total` order, ties broken by lower statement id then
/// lower ledger id; a pair is accepted only when neither side is assigned yet.
/// Returns one assignment per statement id, ordered by statement id.
pub fn resolve(
    statement_ids: &[StatementId],
    candidates: &[Candidate],
    config: &MatchingConfig,
) -> Vec<Assignment> {
    let mut ranked: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| c.scores.total >= config.probable_threshold)
        .collect();
    ranked.sort_by(|a, b| {
        b.scores
            .total
            .total_cmp(&a.scores.total)
            .then_with(|| a.statement_id.cmp(&b.statement_id))
            .then_with(|| a.ledger_id.cmp(&b.ledger_id))
    });

    let wanted: BTreeSet<StatementId> = statement_ids.iter().copied().collect();
    let mut accepted: BTreeMap<StatementId, Assignment> = BTreeMap::new();
    let mut taken_ledger: HashSet<LedgerId> = HashSet::new();

    for c in ranked {
        if !wanted.contains(&c.statement_id)
            || accepted.contains_key(&c.statement_id)
            || taken_ledger.contains(&c.ledger_id)
        {
            continue;
        }
        taken_ledger.insert(c.ledger_id);
        accepted.insert(
            c.statement_id,
            Assignment {
                statement_id: c.statement_id,
                ledger_id: Some(c.ledger_id),
                scores: c.scores,
            },
        );
    }

    wanted
        .into_iter()
        .map(|id| {
            accepted
                .remove(&id)
                .unwrap_or_else(|| Assignment::unassigned(id))
        })
        .collect()
}
