use std::collections::BTreeMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::coefficients::TierWeights;
use crate::eligibility::TierCounts;
use crate::SizeTier;

/// Largest integer `k` with `k * denominator <= numerator`.
///
/// Decimal division rounds at 28 significant digits, so the floored quotient
/// is corrected against the exact products before it is trusted.
pub(crate) fn floor_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    debug_assert!(denominator > Decimal::ZERO, "floor_div requires a positive denominator");
    if numerator <= Decimal::ZERO || denominator <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let quotient = (numerator / denominator).floor();
    if (quotient + Decimal::ONE) * denominator <= numerator {
        quotient + Decimal::ONE
    } else if quotient * denominator > numerator {
        (quotient - Decimal::ONE).max(Decimal::ZERO)
    } else {
        quotient
    }
}

/// Whole units as an integer. Callers only pass floored, non-negative values
/// bounded by the inventory limit.
pub(crate) fn whole_units(value: Decimal) -> u64 {
    debug_assert!(value.fract().is_zero() && value >= Decimal::ZERO, "not a whole unit count: {value}");
    value.trunc().to_u64().unwrap_or(0)
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct TierShare {
    pub per_recipient: u64,
    /// Fraction lost when the theoretical share was floored.
    pub remainder: Decimal,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct ProportionalAllocation {
    pub shares: BTreeMap<SizeTier, TierShare>,
    /// `quantity - sum(per_recipient * count)`, exact.
    pub leftover: Decimal,
}

/// Split `quantity` across the populated tiers in proportion to
/// `count * weight`, flooring every per-recipient share.
pub(crate) fn allocate_proportionally(
    quantity: Decimal,
    tiers: &TierCounts,
    weights: &TierWeights,
) -> ProportionalAllocation {
    let total_parts = tiers
        .populated(SizeTier::ALL)
        .map(|tier| Decimal::from(tiers.get(tier)) * weights.get(tier))
        .sum::<Decimal>();

    let mut shares = BTreeMap::new();
    if total_parts <= Decimal::ZERO || quantity <= Decimal::ZERO {
        return ProportionalAllocation { shares, leftover: quantity };
    }

    let mut distributed = Decimal::ZERO;
    for tier in tiers.populated(SizeTier::ALL) {
        let weighted = quantity * weights.get(tier);
        let per_recipient = floor_div(weighted, total_parts);
        let theoretical = weighted / total_parts;
        let remainder = (theoretical - per_recipient).max(Decimal::ZERO);
        distributed += per_recipient * Decimal::from(tiers.get(tier));
        shares.insert(tier, TierShare { per_recipient: whole_units(per_recipient), remainder });
    }

    ProportionalAllocation { shares, leftover: quantity - distributed }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct PreferenceSplit {
    pub base: Decimal,
    pub preference: Decimal,
}

/// `base = total * base_percent / 100`; the preference share is whatever is
/// left so the two always add back up to `total`.
pub(crate) fn split_preference(total: Decimal, base_share_percent: u8) -> PreferenceSplit {
    let base = total * Decimal::from(base_share_percent) / Decimal::ONE_HUNDRED;
    PreferenceSplit { base, preference: total - base }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct PreferenceShare {
    pub per_recipient: u64,
    pub remainder: Decimal,
}

/// Divide a preference share equally among `recipients`, without weights.
/// With nobody to share with, the whole share is the remainder.
pub(crate) fn share_equally(share: Decimal, recipients: u64) -> PreferenceShare {
    if recipients == 0 {
        return PreferenceShare { per_recipient: 0, remainder: share };
    }
    let count = Decimal::from(recipients);
    let per_recipient = floor_div(share, count);
    PreferenceShare {
        per_recipient: whole_units(per_recipient),
        remainder: share - per_recipient * count,
    }
}
