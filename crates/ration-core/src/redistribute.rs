//! Four-pass remainder waterfall.
//!
//! Every pass reuses [`push_surplus`]: walk the tiers in some order and give
//! each populated tier one more whole unit per recipient while the surplus
//! still covers the whole tier. Pass 1 ranks tiers by fractional remainder,
//! the later passes use [`SizeTier::PRIORITY`]. What no tier can absorb ends
//! up in the bonus bundle.

use std::collections::BTreeMap;

use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{debug, info};

use crate::allocate::TierShare;
use crate::eligibility::TierCounts;
use crate::plan::{BundleKind, ItemLedger, LineDelta, LineSource};
use crate::SizeTier;

#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct Push {
    /// Tiers that received one extra unit per recipient, in award order.
    pub awarded: Vec<SizeTier>,
    pub consumed: Decimal,
    pub remaining: Decimal,
}

/// Single pass over `order`: a populated tier with `count` recipients gets
/// one extra unit each when the surplus covers `count`.
pub(crate) fn push_surplus(surplus: Decimal, tiers: &TierCounts, order: &[SizeTier]) -> Push {
    let mut remaining = surplus.max(Decimal::ZERO);
    let mut awarded = Vec::new();
    for tier in order {
        let count = tiers.get(*tier);
        if count == 0 {
            continue;
        }
        let need = Decimal::from(count);
        if remaining >= need {
            remaining -= need;
            awarded.push(*tier);
        }
        if remaining.is_zero() {
            break;
        }
    }
    Push { awarded, consumed: surplus.max(Decimal::ZERO) - remaining, remaining }
}

/// Tiers sorted by descending flooring remainder; ties keep the fixed
/// large-to-small priority.
pub(crate) fn remainder_order(shares: &BTreeMap<SizeTier, TierShare>) -> Vec<SizeTier> {
    let mut order = SizeTier::PRIORITY
        .into_iter()
        .filter(|tier| shares.contains_key(tier))
        .collect::<Vec<_>>();
    let remainder = |tier: &SizeTier| shares.get(tier).map_or(Decimal::ZERO, |share| share.remainder);
    order.sort_by(|left, right| remainder(right).cmp(&remainder(left)));
    order
}

/// Everything the waterfall needs to know about one item.
#[derive(Debug, Clone)]
pub(crate) struct ItemPools {
    /// Partially filled ledger: totals, split, first-pass leftover and
    /// preference remainder are already set.
    pub ledger: ItemLedger,
    pub remainder_order: Vec<SizeTier>,
    /// Recipients carrying the item's preference tag.
    pub preference_recipients: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct Redistribution {
    pub deltas: Vec<LineDelta>,
    pub ledgers: Vec<ItemLedger>,
}

pub(crate) fn redistribute(
    pools: Vec<ItemPools>,
    tiers: &TierCounts,
    bonus_precision: u32,
) -> Redistribution {
    let mut deltas = Vec::new();
    let mut ledgers = Vec::with_capacity(pools.len());
    let mut held = Vec::with_capacity(pools.len());

    // Phase 1: first-pass leftovers, closest-to-rounding-up tiers first.
    for pool in &pools {
        let ledger = &pool.ledger;
        let push = push_surplus(ledger.first_pass_leftover, tiers, &pool.remainder_order);
        emit_awards(&mut deltas, &ledger.item, &push);
        debug!(item = %ledger.item, consumed = %push.consumed, "phase 1 redistribution");
        held.push((push.consumed, push.remaining));
    }

    // Phase 2: preference remainders pushed into the standard bundles.
    let smallest_tier = tiers.smallest_populated().map(Decimal::from);
    for (pool, (phase1_consumed, phase1_left)) in pools.into_iter().zip(held) {
        let mut ledger = pool.ledger;
        ledger.phase1_consumed = phase1_consumed;

        let preference_left = match (ledger.preference_tag, smallest_tier) {
            (Some(_), Some(smallest))
                if pool.preference_recipients > 0 && ledger.preference_remainder >= smallest =>
            {
                let push = push_surplus(ledger.preference_remainder, tiers, &SizeTier::PRIORITY);
                emit_awards(&mut deltas, &ledger.item, &push);
                debug!(item = %ledger.item, consumed = %push.consumed, "phase 2 redistribution");
                ledger.phase2_consumed = push.consumed;
                push.remaining
            }
            _ => ledger.preference_remainder,
        };

        // Phase 3: whatever is still unconsumed becomes the bonus pool.
        let pool_quantity = phase1_left + preference_left;
        let bonus_pool =
            pool_quantity.round_dp_with_strategy(bonus_precision, RoundingStrategy::ToZero);
        ledger.bonus_pool = bonus_pool;
        ledger.rounding_drift = pool_quantity - bonus_pool;

        // Phase 4: one more attempt from the bonus pool itself.
        let push = push_surplus(bonus_pool, tiers, &SizeTier::PRIORITY);
        emit_awards(&mut deltas, &ledger.item, &push);
        ledger.phase4_consumed = push.consumed;
        ledger.bonus = push.remaining;
        if push.remaining > Decimal::ZERO {
            deltas.push(LineDelta::BonusTotal {
                item: ledger.item.clone(),
                quantity: push.remaining,
            });
        }
        ledgers.push(ledger);
    }

    let bonus_items = ledgers.iter().filter(|ledger| ledger.bonus > Decimal::ZERO).count();
    if bonus_items == 0 {
        info!("bonus bundle is empty; every unit reached a standard or preference bundle");
    } else {
        info!(bonus_items, "bonus bundle keeps residual quantity");
    }

    Redistribution { deltas, ledgers }
}

fn emit_awards(deltas: &mut Vec<LineDelta>, item: &str, push: &Push) {
    deltas.extend(push.awarded.iter().map(|tier| LineDelta::PerRecipient {
        kind: BundleKind::Standard(*tier),
        item: item.to_string(),
        units: 1,
        source: LineSource::Redistributed,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiers(small: u64, medium: u64, large: u64) -> TierCounts {
        TierCounts { small, medium, large }
    }

    fn share(per_recipient: u64, remainder: Decimal) -> TierShare {
        TierShare { per_recipient, remainder }
    }

    fn pools(
        item: &str,
        first_pass_leftover: Decimal,
        preference: Option<(crate::PreferenceTag, u64, Decimal)>,
        remainder_order: Vec<SizeTier>,
    ) -> ItemPools {
        let (preference_tag, preference_recipients, preference_remainder) = match preference {
            Some((tag, recipients, remainder)) => (Some(tag), recipients, remainder),
            None => (None, 0, Decimal::ZERO),
        };
        ItemPools {
            ledger: ItemLedger {
                item: item.to_string(),
                preference_tag,
                first_pass_leftover,
                preference_remainder,
                ..ItemLedger::default()
            },
            remainder_order,
            preference_recipients,
        }
    }

    fn awarded_tiers(deltas: &[LineDelta]) -> Vec<SizeTier> {
        deltas
            .iter()
            .filter_map(|delta| match delta {
                LineDelta::PerRecipient { kind: BundleKind::Standard(tier), .. } => Some(*tier),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn push_awards_whole_tiers_in_order_and_skips_unaffordable_ones() {
        let push = push_surplus(Decimal::from(4), &tiers(2, 3, 1), &SizeTier::PRIORITY);
        assert_eq!(push.awarded, vec![SizeTier::Large, SizeTier::Medium]);
        assert_eq!(push.consumed, Decimal::from(4));
        assert_eq!(push.remaining, Decimal::ZERO);

        let push = push_surplus(Decimal::new(25, 1), &tiers(2, 3, 0), &SizeTier::PRIORITY);
        assert_eq!(push.awarded, vec![SizeTier::Small]);
        assert_eq!(push.remaining, Decimal::new(5, 1));
    }

    #[test]
    fn push_never_awards_a_tier_twice() {
        let push = push_surplus(Decimal::from(50), &tiers(1, 0, 1), &SizeTier::PRIORITY);
        assert_eq!(push.awarded, vec![SizeTier::Large, SizeTier::Small]);
        assert_eq!(push.remaining, Decimal::from(48));
    }

    #[test]
    fn remainder_order_prefers_largest_fraction_then_priority() {
        let mut shares = BTreeMap::new();
        shares.insert(SizeTier::Small, share(9, Decimal::new(9, 1)));
        shares.insert(SizeTier::Medium, share(18, Decimal::new(2, 1)));
        shares.insert(SizeTier::Large, share(27, Decimal::new(2, 1)));
        assert_eq!(
            remainder_order(&shares),
            vec![SizeTier::Small, SizeTier::Large, SizeTier::Medium]
        );
    }

    #[test]
    fn leftover_goes_to_tier_with_largest_remainder() {
        // Rice 100 over S=2, M=3, L=1 with weights 1/2/3 leaves 1 unit; large has
        // the largest fraction (27.27) and is the only tier a single unit covers.
        let order = vec![SizeTier::Large, SizeTier::Medium, SizeTier::Small];
        let result = redistribute(
            vec![pools("Rice", Decimal::ONE, None, order)],
            &tiers(2, 3, 1),
            2,
        );
        assert_eq!(awarded_tiers(&result.deltas), vec![SizeTier::Large]);
        assert_eq!(result.ledgers[0].phase1_consumed, Decimal::ONE);
        assert_eq!(result.ledgers[0].bonus, Decimal::ZERO);
        assert!(result.deltas.iter().all(|delta| !matches!(delta, LineDelta::BonusTotal { .. })));
    }

    #[test]
    fn preference_remainder_without_tagged_recipients_lands_in_bonus() {
        let tag = crate::PreferenceTag::Baby;
        let result = redistribute(
            vec![pools("Diapers", Decimal::ZERO, Some((tag, 0, Decimal::new(75, 2))), vec![])],
            &tiers(1, 0, 0),
            2,
        );
        let ledger = &result.ledgers[0];
        assert_eq!(ledger.phase2_consumed, Decimal::ZERO);
        assert_eq!(ledger.bonus, Decimal::new(75, 2));
        assert_eq!(
            result.deltas,
            vec![LineDelta::BonusTotal { item: "Diapers".to_string(), quantity: Decimal::new(75, 2) }]
        );
    }

    #[test]
    fn zero_tagged_recipients_bypass_phase_two_but_not_phase_four() {
        // 30 units of preference share with nobody tagged: phase 2 is skipped,
        // phase 4 pushes what the tiers can take and the rest stays as bonus.
        let tag = crate::PreferenceTag::Halal;
        let result = redistribute(
            vec![pools("Lamb", Decimal::ZERO, Some((tag, 0, Decimal::from(30))), vec![])],
            &tiers(2, 3, 1),
            2,
        );
        let ledger = &result.ledgers[0];
        assert_eq!(ledger.phase2_consumed, Decimal::ZERO);
        assert_eq!(ledger.phase4_consumed, Decimal::from(6));
        assert_eq!(ledger.bonus, Decimal::from(24));
    }

    #[test]
    fn preference_remainder_is_cross_pollinated_into_standard_bundles() {
        let tag = crate::PreferenceTag::Vegetarian;
        let result = redistribute(
            vec![pools("Tofu", Decimal::ZERO, Some((tag, 4, Decimal::from(2))), vec![])],
            &tiers(2, 3, 1),
            2,
        );
        let ledger = &result.ledgers[0];
        assert_eq!(ledger.phase2_consumed, Decimal::from(1));
        // The unit phase 2 could not place reaches the large tier again in phase 4.
        assert_eq!(awarded_tiers(&result.deltas), vec![SizeTier::Large, SizeTier::Large]);
        assert_eq!(ledger.phase4_consumed, Decimal::from(1));
        assert_eq!(ledger.bonus, Decimal::ZERO);
    }

    #[test]
    fn remainder_below_smallest_tier_skips_phase_two() {
        let tag = crate::PreferenceTag::Vegetarian;
        let result = redistribute(
            vec![pools("Tofu", Decimal::ZERO, Some((tag, 4, Decimal::new(15, 1))), vec![])],
            &tiers(2, 3, 0),
            2,
        );
        let ledger = &result.ledgers[0];
        assert_eq!(ledger.phase2_consumed, Decimal::ZERO);
        assert_eq!(ledger.bonus, Decimal::new(15, 1));
    }

    #[test]
    fn bonus_pool_is_rounded_toward_zero() {
        let third = Decimal::ONE / Decimal::from(3);
        let result = redistribute(
            vec![pools("Flour", third, None, vec![SizeTier::Small])],
            &tiers(5, 0, 0),
            2,
        );
        let ledger = &result.ledgers[0];
        assert_eq!(ledger.bonus_pool, Decimal::new(33, 2));
        assert_eq!(ledger.bonus, Decimal::new(33, 2));
        assert!(ledger.rounding_drift > Decimal::ZERO);
        assert!(ledger.rounding_drift < Decimal::new(1, 2));
    }

    #[test]
    fn combined_leftovers_can_be_pushed_in_the_final_pass() {
        // 0.6 first-pass leftover + 0.6 preference remainder: neither covers the
        // single large recipient on its own, together they do.
        let tag = crate::PreferenceTag::Halal;
        let result = redistribute(
            vec![pools(
                "Chicken",
                Decimal::new(6, 1),
                Some((tag, 3, Decimal::new(6, 1))),
                vec![SizeTier::Large],
            )],
            &tiers(0, 0, 1),
            2,
        );
        let ledger = &result.ledgers[0];
        assert_eq!(ledger.phase1_consumed, Decimal::ZERO);
        assert_eq!(ledger.phase2_consumed, Decimal::ZERO);
        assert_eq!(ledger.phase4_consumed, Decimal::ONE);
        assert_eq!(ledger.bonus, Decimal::new(2, 1));
    }
}
