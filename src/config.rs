//! Matching configuration: weights, tolerances and thresholds

use serde::{Deserialize, Serialize};

use crate::types::*;

const WEIGHT_SUM_EPSILON: f64 = 1e-6;

/// Parameters of the scoring and classification algorithm
///
/// One configuration is active per deployment. It is loaded from storage at
/// the start of every request and passed down explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Weight of the date score in the total
    pub weight_date: f64,
    /// Weight of the amount score in the total
    pub weight_value: f64,
    /// Weight of the description score in the total
    pub weight_description: f64,
    /// Days apart at which the date score reaches 0
    pub date_tolerance_days: u32,
    /// Relative amount difference at which the value score reaches 0
    pub value_tolerance_fraction: f64,
    /// Description similarity below this floor counts as 0
    pub min_description_similarity: f64,
    /// Lowest total for a PROBABLE link
    pub probable_threshold: f64,
    /// Lowest total for an EXACT link
    pub exact_threshold: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            weight_date: 0.3,
            weight_value: 0.5,
            weight_description: 0.2,
            date_tolerance_days: 5,
            value_tolerance_fraction: 0.01,
            min_description_similarity: 0.0,
            probable_threshold: 0.6,
            exact_threshold: 0.9,
        }
    }
}

impl MatchingConfig {
    /// Parse and validate a configuration from TOML
    pub fn from_toml_str(input: &str) -> ReconResult<Self> {
        let config: MatchingConfig = toml::from_str(input)
            .map_err(|e| ReconError::Validation(format!("Invalid matching config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate weights, tolerances and thresholds
    pub fn validate(&self) -> ReconResult<()> {
        let weights = [
            ("weight_date", self.weight_date),
            ("weight_value", self.weight_value),
            ("weight_description", self.weight_description),
        ];
        for (name, weight) in weights {
            check_unit_interval(name, weight)?;
        }

        let sum = self.weight_date + self.weight_value + self.weight_description;
        if (sum - 1.0).abs() > WEIGHT_SUM_EPSILON {
            return Err(ReconError::Validation(format!(
                "Weights must sum to 1.0, got {}",
                sum
            )));
        }

        check_unit_interval("value_tolerance_fraction", self.value_tolerance_fraction)?;
        check_unit_interval("min_description_similarity", self.min_description_similarity)?;
        check_unit_interval("probable_threshold", self.probable_threshold)?;
        check_unit_interval("exact_threshold", self.exact_threshold)?;

        if self.probable_threshold >= self.exact_threshold {
            return Err(ReconError::Validation(format!(
                "probable_threshold ({}) must be lower than exact_threshold ({})",
                self.probable_threshold, self.exact_threshold
            )));
        }

        Ok(())
    }

    /// Weighted total of the three partial scores
    pub fn weighted_total(&self, date: f64, value: f64, description: f64) -> f64 {
        self.weight_date * date + self.weight_value * value + self.weight_description * description
    }
}

fn check_unit_interval(name: &str, value: f64) -> ReconResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ReconError::Validation(format!(
            "{} must be between 0 and 1, got {}",
            name, value
        )));
    }
    Ok(())
}
