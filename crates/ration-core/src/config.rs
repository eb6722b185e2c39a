use std::fmt::{Display, Formatter};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::classify::ClassificationTable;
use crate::coefficients::TierWeights;
use crate::{AllocationError, SizeTier};

const DEFAULT_BASE_SHARE_PERCENT: u8 = 70;
const DEFAULT_BONUS_PRECISION: u32 = 2;
const MAX_BONUS_PRECISION: u32 = 6;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConfigViolation {
    pub field: String,
    pub message: String,
}

impl ConfigViolation {
    pub(crate) fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { field: field.into(), message: message.into() }
    }
}

impl Display for ConfigViolation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Tunables for one allocation run. Missing fields fall back to defaults when
/// deserialized.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub base_share_percent: u8,
    pub preference_share_percent: u8,
    pub fixed_coefficients: Option<TierWeights>,
    pub max_fairness_ratio: Decimal,
    /// Fractional digits kept on bonus bundle totals.
    pub bonus_precision: u32,
    pub classification: ClassificationTable,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_share_percent: DEFAULT_BASE_SHARE_PERCENT,
            preference_share_percent: 100 - DEFAULT_BASE_SHARE_PERCENT,
            fixed_coefficients: None,
            max_fairness_ratio: Decimal::from(3),
            bonus_precision: DEFAULT_BONUS_PRECISION,
            classification: ClassificationTable::default(),
        }
    }
}

impl EngineConfig {
    /// Set the base share and derive the preference share from it.
    #[must_use]
    pub fn with_base_share(mut self, percent: u8) -> Self {
        self.base_share_percent = percent;
        self.preference_share_percent = 100_u8.saturating_sub(percent);
        self
    }

    #[must_use]
    pub fn with_fixed_coefficients(mut self, weights: TierWeights) -> Self {
        self.fixed_coefficients = Some(weights);
        self
    }

    /// Largest per-item conservation drift tolerated after bonus rounding.
    #[must_use]
    pub fn conservation_tolerance(&self) -> Decimal {
        Decimal::new(1, self.bonus_precision.min(MAX_BONUS_PRECISION))
    }

    /// Check every configuration rule and report all violations at once.
    ///
    /// # Errors
    /// Returns [`AllocationError::InvalidConfiguration`] listing each violated rule.
    pub fn validate(&self) -> Result<(), AllocationError> {
        let violations = self.violations();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(AllocationError::InvalidConfiguration(violations))
        }
    }

    #[must_use]
    pub fn violations(&self) -> Vec<ConfigViolation> {
        let mut violations = Vec::new();

        let share_sum =
            u16::from(self.base_share_percent) + u16::from(self.preference_share_percent);
        if share_sum != 100 {
            violations.push(ConfigViolation::new(
                "base_share_percent",
                format!(
                    "base_share_percent + preference_share_percent MUST equal 100 (got {share_sum})"
                ),
            ));
        }

        if self.max_fairness_ratio < Decimal::ONE {
            violations.push(ConfigViolation::new(
                "max_fairness_ratio",
                format!("MUST be >= 1 (got {})", self.max_fairness_ratio),
            ));
        }

        if self.bonus_precision > MAX_BONUS_PRECISION {
            violations.push(ConfigViolation::new(
                "bonus_precision",
                format!("MUST be <= {MAX_BONUS_PRECISION} (got {})", self.bonus_precision),
            ));
        }

        if let Some(weights) = &self.fixed_coefficients {
            let lower = Decimal::new(1, 1);
            let upper = Decimal::from(10);
            for tier in SizeTier::ALL {
                let weight = weights.get(tier);
                if weight < lower || weight > upper {
                    violations.push(ConfigViolation::new(
                        format!("fixed_coefficients.{}", tier.as_str()),
                        format!("MUST be within [0.1, 10] (got {weight})"),
                    ));
                }
            }

            if let Some(ratio) = weights.fairness_ratio() {
                if ratio > self.max_fairness_ratio {
                    violations.push(ConfigViolation::new(
                        "fixed_coefficients",
                        format!(
                            "large/small ratio {ratio} exceeds max_fairness_ratio {}",
                            self.max_fairness_ratio
                        ),
                    ));
                }
            }
        }

        violations.extend(self.classification.violations());
        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_violation_fields(config: &EngineConfig, expected: &[&str]) {
        let fields = config.violations().into_iter().map(|v| v.field).collect::<Vec<_>>();
        assert_eq!(fields, expected, "unexpected violation set for {config:?}");
    }

    #[test]
    fn default_config_is_valid() {
        assert_eq!(EngineConfig::default().validate(), Ok(()));
        assert_eq!(EngineConfig::default().preference_share_percent, 30);
    }

    #[test]
    fn shares_must_sum_to_one_hundred() {
        let mut config = EngineConfig::default();
        config.preference_share_percent = 20;
        assert_violation_fields(&config, &["base_share_percent"]);
    }

    #[test]
    fn with_base_share_keeps_shares_consistent() {
        let config = EngineConfig::default().with_base_share(85);
        assert_eq!(config.preference_share_percent, 15);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn validation_reports_every_violated_rule() {
        let mut config = EngineConfig::default().with_fixed_coefficients(TierWeights {
            small: Decimal::new(5, 2),
            medium: Decimal::from(2),
            large: Decimal::from(12),
        });
        config.preference_share_percent = 10;
        config.max_fairness_ratio = Decimal::new(5, 1);

        let err = match config.validate() {
            Ok(()) => panic!("expected configuration violations"),
            Err(err) => err,
        };
        let AllocationError::InvalidConfiguration(violations) = err else {
            panic!("expected InvalidConfiguration, got {err:?}");
        };
        let fields = violations.iter().map(|v| v.field.as_str()).collect::<Vec<_>>();
        assert_eq!(
            fields,
            vec![
                "base_share_percent",
                "max_fairness_ratio",
                "fixed_coefficients.small",
                "fixed_coefficients.large",
                "fixed_coefficients",
            ]
        );
    }

    #[test]
    fn fixed_coefficients_must_respect_fairness_ratio() {
        let config = EngineConfig::default().with_fixed_coefficients(TierWeights {
            small: Decimal::ONE,
            medium: Decimal::from(2),
            large: Decimal::from(4),
        });
        assert_violation_fields(&config, &["fixed_coefficients"]);

        let canonical = EngineConfig::default().with_fixed_coefficients(TierWeights::canonical());
        assert_eq!(canonical.validate(), Ok(()));
    }

    #[test]
    fn bonus_precision_is_bounded() {
        let mut config = EngineConfig::default();
        config.bonus_precision = 9;
        assert_violation_fields(&config, &["bonus_precision"]);
    }

    #[test]
    fn conservation_tolerance_follows_bonus_precision() {
        let config = EngineConfig::default();
        assert_eq!(config.conservation_tolerance(), Decimal::new(1, 2));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: EngineConfig =
            match serde_json::from_str(r#"{"base_share_percent": 60, "preference_share_percent": 40}"#)
            {
                Ok(config) => config,
                Err(err) => panic!("config should parse: {err}"),
            };
        assert_eq!(config.base_share_percent, 60);
        assert_eq!(config.max_fairness_ratio, Decimal::from(3));
        assert_eq!(config.bonus_precision, 2);
        assert_eq!(config.validate(), Ok(()));
    }
}
