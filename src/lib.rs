//! # Reconciliation Core
//!
//! A bank reconciliation library that pairs the lines of a bank statement
//! with the entries of an accounting ledger, one period at a time.
//!
//! ## Features
//!
//! - **Alias normalization**: Account-scoped rewrite rules applied to descriptions before comparison
//! - **Weighted scoring**: Date, amount and description similarity with configurable weights and tolerances
//! - **1-to-1 assignment**: Deterministic greedy resolution so no ledger record serves two statement lines
//! - **Link states**: EXACT, PROBABLE, NO_MATCH, MANUAL and IGNORED with operator overrides kept across runs
//! - **Invariant audit**: Detection and remediation of ledger records linked more than once
//! - **Storage abstraction**: Database-agnostic design with trait-based storage
//!
//! ## Quick Start
//!
//! ```rust
//! use reconciliation_core::utils::MemoryStorage;
//! use reconciliation_core::{
//!     LedgerRecord, MatchState, MatchingConfig, Period, ReconciliationEngine, StatementRecord,
//! };
//! use bigdecimal::BigDecimal;
//! use chrono::NaiveDate;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let storage = MemoryStorage::with_config(MatchingConfig::default());
//! let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
//! storage
//!     .add_statement(StatementRecord::new(1, 10, date, "Pago proveedor".to_string(), BigDecimal::from(-150)))
//!     .unwrap();
//! storage
//!     .add_ledger_record(LedgerRecord::new(7, 10, date, "Pago proveedor".to_string(), BigDecimal::from(-150)))
//!     .unwrap();
//!
//! let engine = ReconciliationEngine::new(storage);
//! let outcome = engine.run_matching(Period::new(10, 2024, 3)).await.unwrap();
//! assert_eq!(outcome.links[0].state, MatchState::Exact);
//! # }
//! ```

pub mod config;
pub mod matching;
pub mod reconciliation;
pub mod traits;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use config::*;
pub use matching::{
    AliasNormalizer, Assignment, Candidate, Comparable, ConflictCase, ConflictReport,
    RemediationPolicy,
};
pub use reconciliation::*;
pub use traits::*;
pub use types::*;
