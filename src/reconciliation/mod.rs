//! Reconciliation of bank statement lines against ledger records
//!
//! This module contains the matching engine and the operator actions that
//! edit its results.

pub mod aliases;
pub mod engine;
pub mod links;
pub mod lock;

pub use aliases::*;
pub use engine::*;
pub use links::*;
pub use lock::*;
