//! Validation utilities

use bigdecimal::BigDecimal;
use chrono::NaiveDate;

use crate::types::*;

/// Validate that a record carries the fields scoring depends on
pub fn require_date_and_amount(
    kind: RecordKind,
    id: i64,
    date: Option<&NaiveDate>,
    amount: Option<&BigDecimal>,
) -> ReconResult<()> {
    let reason = match (date, amount) {
        (None, None) => "missing date and amount",
        (None, Some(_)) => "missing date",
        (Some(_), None) => "missing amount",
        (Some(_), Some(_)) => return Ok(()),
    };

    Err(ReconError::RecordMalformed {
        kind,
        id,
        reason: reason.to_string(),
    })
}

/// Validate the name of the operator performing a manual action
pub fn validate_actor(actor: &str) -> ReconResult<()> {
    if actor.trim().is_empty() {
        return Err(ReconError::Validation("Actor cannot be empty".to_string()));
    }

    if actor.len() > 100 {
        return Err(ReconError::Validation(
            "Actor cannot exceed 100 characters".to_string(),
        ));
    }

    Ok(())
}

/// Validate a free-text note attached to a link
pub fn validate_note(note: &str) -> ReconResult<()> {
    if note.len() > 500 {
        return Err(ReconError::Validation(
            "Note cannot exceed 500 characters".to_string(),
        ));
    }

    Ok(())
}

/// Validate the pattern and replacement of an alias rule
pub fn validate_alias(pattern: &str, replacement: &str) -> ReconResult<()> {
    if pattern.split_whitespace().next().is_none() {
        return Err(ReconError::Validation(
            "Alias pattern cannot be empty".to_string(),
        ));
    }

    if pattern.len() > 200 || replacement.len() > 200 {
        return Err(ReconError::Validation(
            "Alias pattern and replacement cannot exceed 200 characters".to_string(),
        ));
    }

    Ok(())
}
