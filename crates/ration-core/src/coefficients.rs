use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EngineConfig;
use crate::eligibility::TierCounts;
use crate::SizeTier;

/// Fractional digits kept on dynamically derived weights.
const COEFFICIENT_SCALE: u32 = 6;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct TierWeights {
    pub small: Decimal,
    pub medium: Decimal,
    pub large: Decimal,
}

impl TierWeights {
    /// The 1 / 2 / 3 weighting used when nothing better can be derived.
    #[must_use]
    pub fn canonical() -> Self {
        Self { small: Decimal::ONE, medium: Decimal::from(2), large: Decimal::from(3) }
    }

    #[must_use]
    pub fn get(&self, tier: SizeTier) -> Decimal {
        match tier {
            SizeTier::Small => self.small,
            SizeTier::Medium => self.medium,
            SizeTier::Large => self.large,
        }
    }

    /// Large weight over small weight; `None` when the small weight is zero.
    #[must_use]
    pub fn fairness_ratio(&self) -> Option<Decimal> {
        if self.small.is_zero() {
            return None;
        }
        self.large.checked_div(self.small)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CoefficientSource {
    Fixed,
    Dynamic,
    SmallOnly,
    CanonicalFallback,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ResolvedCoefficients {
    pub weights: TierWeights,
    pub source: CoefficientSource,
    /// Mass the dynamic derivation was solved for.
    pub reference_mass: Decimal,
    /// True when the fairness cap or the progression floor altered the solution.
    pub clamped: bool,
}

/// Derive one set of tier weights for the whole run.
///
/// Fixed weights from the configuration are returned unchanged; they were
/// already checked against the fairness cap by [`EngineConfig::validate`].
/// Otherwise the small weight is pinned to 1 and the medium and large weights
/// are solved from `P + M*Y + L*X = Q` with `X - Y = Y - 1`, then capped so
/// that `X <= max_fairness_ratio`.
#[must_use]
pub fn resolve_coefficients(
    reference_mass: Decimal,
    tiers: &TierCounts,
    config: &EngineConfig,
) -> ResolvedCoefficients {
    if let Some(weights) = config.fixed_coefficients {
        return ResolvedCoefficients {
            weights,
            source: CoefficientSource::Fixed,
            reference_mass,
            clamped: false,
        };
    }

    let small = Decimal::from(tiers.small);
    let medium = Decimal::from(tiers.medium);
    let large = Decimal::from(tiers.large);

    if tiers.medium == 0 && tiers.large == 0 {
        if tiers.small == 0 {
            return canonical_fallback(reference_mass);
        }
        let per_small = (reference_mass / small).round_dp(COEFFICIENT_SCALE).max(Decimal::ONE);
        debug!(%per_small, "only the small tier is populated");
        return ResolvedCoefficients {
            weights: TierWeights { small: per_small, medium: Decimal::ZERO, large: Decimal::ZERO },
            source: CoefficientSource::SmallOnly,
            reference_mass,
            clamped: false,
        };
    }

    let denominator = Decimal::TWO * large + medium;
    if denominator.is_zero() {
        return canonical_fallback(reference_mass);
    }

    let unit = Decimal::ONE;
    let mut y = ((reference_mass + unit * (large - small)) / denominator).round_dp(COEFFICIENT_SCALE);
    let mut x = Decimal::TWO * y - unit;
    let mut clamped = false;

    let cap = config.max_fairness_ratio * unit;
    if x > cap {
        x = cap;
        y = (unit + x) / Decimal::TWO;
        clamped = true;
    }
    if y < unit {
        y = unit;
        clamped = true;
    }
    if x < y {
        x = y;
        clamped = true;
    }

    let weights = TierWeights { small: unit, medium: y, large: x };
    debug!(
        small = %weights.small,
        medium = %weights.medium,
        large = %weights.large,
        clamped,
        "derived dynamic coefficients"
    );
    ResolvedCoefficients { weights, source: CoefficientSource::Dynamic, reference_mass, clamped }
}

fn canonical_fallback(reference_mass: Decimal) -> ResolvedCoefficients {
    debug!("degenerate population, using canonical coefficients");
    ResolvedCoefficients {
        weights: TierWeights::canonical(),
        source: CoefficientSource::CanonicalFallback,
        reference_mass,
        clamped: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiers(small: u64, medium: u64, large: u64) -> TierCounts {
        TierCounts { small, medium, large }
    }

    #[test]
    fn fixed_coefficients_are_returned_unchanged() {
        let config = EngineConfig::default().with_fixed_coefficients(TierWeights::canonical());
        let resolved = resolve_coefficients(Decimal::from(500), &tiers(4, 4, 4), &config);
        assert_eq!(resolved.source, CoefficientSource::Fixed);
        assert_eq!(resolved.weights, TierWeights::canonical());
        assert!(!resolved.clamped);
    }

    #[test]
    fn dynamic_solution_satisfies_mass_identity_when_unclamped() {
        // P=2, M=3, L=1, Q=20: Y = (20 + 1 - 2) / 5 = 3.8, X = 6.6, above the default cap.
        let mut config = EngineConfig::default();
        config.max_fairness_ratio = Decimal::from(10);
        let resolved = resolve_coefficients(Decimal::from(20), &tiers(2, 3, 1), &config);
        assert_eq!(resolved.source, CoefficientSource::Dynamic);
        assert!(!resolved.clamped);
        let weights = resolved.weights;
        assert_eq!(weights.small, Decimal::ONE);
        assert_eq!(weights.medium, Decimal::new(38, 1));
        assert_eq!(weights.large, Decimal::new(66, 1));
        let mass = Decimal::from(2) * weights.small
            + Decimal::from(3) * weights.medium
            + Decimal::from(1) * weights.large;
        assert_eq!(mass, Decimal::from(20));
    }

    #[test]
    fn large_weight_is_capped_by_fairness_ratio() {
        // P=10, M=0, L=1, Q=50: Y = (50 - 9) / 2 = 20.5, X = 40 -> capped to 3, Y = 2.
        let config = EngineConfig::default();
        let resolved = resolve_coefficients(Decimal::from(50), &tiers(10, 0, 1), &config);
        assert_eq!(resolved.source, CoefficientSource::Dynamic);
        assert!(resolved.clamped);
        assert_eq!(resolved.weights.large, Decimal::from(3));
        assert_eq!(resolved.weights.medium, Decimal::from(2));
        assert_eq!(resolved.weights.fairness_ratio(), Some(Decimal::from(3)));
    }

    #[test]
    fn scarce_mass_keeps_progression_floor() {
        // Q=5 for 10 small and 5 large: Y < 1, so every weight floors to 1.
        let resolved =
            resolve_coefficients(Decimal::from(5), &tiers(10, 0, 5), &EngineConfig::default());
        assert!(resolved.clamped);
        assert_eq!(resolved.weights.small, Decimal::ONE);
        assert_eq!(resolved.weights.medium, Decimal::ONE);
        assert_eq!(resolved.weights.large, Decimal::ONE);
    }

    #[test]
    fn small_only_population_gets_all_mass() {
        let resolved =
            resolve_coefficients(Decimal::from(40), &tiers(8, 0, 0), &EngineConfig::default());
        assert_eq!(resolved.source, CoefficientSource::SmallOnly);
        assert_eq!(resolved.weights.small, Decimal::from(5));
        assert_eq!(resolved.weights.medium, Decimal::ZERO);
        assert_eq!(resolved.weights.large, Decimal::ZERO);

        let scarce =
            resolve_coefficients(Decimal::from(3), &tiers(8, 0, 0), &EngineConfig::default());
        assert_eq!(scarce.weights.small, Decimal::ONE);
    }

    #[test]
    fn empty_population_falls_back_to_canonical_weights() {
        let resolved =
            resolve_coefficients(Decimal::from(10), &tiers(0, 0, 0), &EngineConfig::default());
        assert_eq!(resolved.source, CoefficientSource::CanonicalFallback);
        assert_eq!(resolved.weights, TierWeights::canonical());
    }

    #[test]
    fn fairness_ratio_is_none_for_zero_small_weight() {
        let weights =
            TierWeights { small: Decimal::ZERO, medium: Decimal::ONE, large: Decimal::ONE };
        assert_eq!(weights.fairness_ratio(), None);
    }
}
