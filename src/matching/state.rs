//! Link state machine
//!
//! Every function here is pure: it takes the current link and returns the
//! next version of it. Persisting the result (and the 1-to-1 re-check that
//! goes with it) is the caller's job.

use crate::config::MatchingConfig;
use crate::matching::resolver::Assignment;
use crate::types::*;

/// Classify a total score into the state an automatic run would assign
pub fn classify(total: f64, config: &MatchingConfig) -> Option<MatchState> {
    if total >= config.exact_threshold {
        Some(MatchState::Exact)
    } else if total >= config.probable_threshold {
        Some(MatchState::Probable)
    } else {
        None
    }
}

/// Apply a fresh resolver result to a link
///
/// Returns `None` when the link must not change: sticky links are never
/// touched, and an unchanged decision is not rewritten. A PROBABLE link is
/// not promoted to EXACT even if it now scores above the exact threshold;
/// only its candidate and scores are refreshed.
pub fn apply_assignment(
    link: &MatchLink,
    assignment: Option<&Assignment>,
    config: &MatchingConfig,
) -> Option<MatchLink> {
    if link.state.is_sticky() {
        return None;
    }

    let proposed = assignment.and_then(|a| {
        let ledger_id = a.ledger_id?;
        let state = classify(a.scores.total, config)?;
        Some((ledger_id, state, a.scores))
    });

    let mut next = link.clone();
    match proposed {
        Some((ledger_id, state, scores)) => {
            next.state = match (link.state, state) {
                (MatchState::Probable, MatchState::Exact) => MatchState::Probable,
                (_, state) => state,
            };
            next.ledger_id = Some(ledger_id);
            next.scores = scores;
        }
        None => {
            next.state = MatchState::NoMatch;
            next.ledger_id = None;
            next.scores = ScoreBreakdown::zero();
        }
    }
    if next.same_decision(link) {
        return None;
    }
    next.actor = None;
    next.note = None;
    next.updated_at = chrono::Utc::now().naive_utc();
    Some(next)
}

/// PROBABLE → EXACT on explicit operator approval
pub fn approve(link: &MatchLink, actor: &str) -> ReconResult<MatchLink> {
    if link.state != MatchState::Probable || link.ledger_id.is_none() {
        return Err(ReconError::InvalidTransition {
            from: link.state,
            action: "approve",
        });
    }

    let mut next = link.clone();
    next.state = MatchState::Exact;
    next.actor = Some(actor.to_string());
    next.updated_at = chrono::Utc::now().naive_utc();
    Ok(next)
}

/// Any state → MANUAL, bypassing scoring
///
/// The scores are kept for audit only.
pub fn link_manually(
    link: &MatchLink,
    ledger_id: LedgerId,
    scores: ScoreBreakdown,
    actor: &str,
    note: Option<String>,
) -> MatchLink {
    let mut next = link.clone();
    next.state = MatchState::Manual;
    next.ledger_id = Some(ledger_id);
    next.scores = scores;
    next.actor = Some(actor.to_string());
    next.note = note;
    next.updated_at = chrono::Utc::now().naive_utc();
    next
}

/// Any state → IGNORED; the line leaves automatic matching
pub fn ignore(link: &MatchLink, actor: &str, reason: Option<String>) -> MatchLink {
    let mut next = link.clone();
    next.state = MatchState::Ignored;
    next.ledger_id = None;
    next.scores = ScoreBreakdown::zero();
    next.actor = Some(actor.to_string());
    next.note = reason;
    next.updated_at = chrono::Utc::now().naive_utc();
    next
}

/// Any state → NO_MATCH; the only exit from EXACT, MANUAL and IGNORED
pub fn unlink(link: &MatchLink) -> MatchLink {
    revert(link, None)
}

/// Back to NO_MATCH with an explanatory note
pub fn revert(link: &MatchLink, note: Option<String>) -> MatchLink {
    let mut next = link.clone();
    next.state = MatchState::NoMatch;
    next.ledger_id = None;
    next.scores = ScoreBreakdown::zero();
    next.actor = None;
    next.note = note;
    next.updated_at = chrono::Utc::now().naive_utc();
    next
}
