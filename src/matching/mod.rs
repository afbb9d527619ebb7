//! Matching building blocks: normalization, scoring, assignment, link states
//! and invariant audit

pub mod conflicts;
pub mod normalizer;
pub mod resolver;
pub mod scorer;
pub mod state;

pub use conflicts::{ConflictCase, ConflictReport, RemediationPolicy};
pub use normalizer::AliasNormalizer;
pub use resolver::Assignment;
pub use scorer::{Candidate, Comparable};
