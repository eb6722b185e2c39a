use std::collections::BTreeSet;

use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::allocate::{allocate_proportionally, share_equally, split_preference};
use crate::coefficients::resolve_coefficients;
use crate::config::EngineConfig;
use crate::eligibility::partition;
use crate::plan::{AllocationPlan, BundleKind, ItemLedger, LineDelta, LineSource, PlanBuilder, RunReport};
use crate::redistribute::{redistribute, remainder_order, ItemPools};
use crate::{AllocationError, InventoryItem, Recipient};

pub const RULESET_VERSION: &str = "allocation.v1";

/// Upper bound on a single item's quantity (one billion units).
pub const MAX_ITEM_QUANTITY: Decimal = Decimal::from_parts(1_000_000_000, 0, 0, false, 0);

/// Compute a fresh allocation plan from the current inventory, recipients and
/// configuration.
///
/// The run is a pure function of its inputs: items are processed in name
/// order and every collection in the plan is ordered, so identical inputs
/// give identical plans, ids included.
///
/// # Errors
/// Returns an [`AllocationError`] when the configuration or inventory is
/// invalid, the inventory is empty, or no recipient is eligible.
pub fn regenerate(
    inventory: &[InventoryItem],
    recipients: &[Recipient],
    config: &EngineConfig,
) -> Result<AllocationPlan, AllocationError> {
    config.validate()?;
    if inventory.is_empty() {
        return Err(AllocationError::EmptyInventory);
    }
    validate_inventory(inventory)?;
    let population = partition(recipients)?;
    let tiers = population.tiers;

    let mut items = inventory.iter().collect::<Vec<_>>();
    items.sort_by(|left, right| left.name.cmp(&right.name));

    let classifier = config.classification.compile();
    let ledgers = items
        .iter()
        .map(|item| {
            let preference_tag = classifier.classify(&item.name);
            let (base_quantity, preference_quantity) = match preference_tag {
                Some(_) => {
                    let split = split_preference(item.quantity, config.base_share_percent);
                    (split.base, split.preference)
                }
                None => (item.quantity, Decimal::ZERO),
            };
            ItemLedger {
                item: item.name.clone(),
                total: item.quantity,
                preference_tag,
                base_quantity,
                preference_quantity,
                ..ItemLedger::default()
            }
        })
        .collect::<Vec<_>>();

    let reference_mass = ledgers.iter().map(|ledger| ledger.base_quantity).sum::<Decimal>();
    let coefficients = resolve_coefficients(reference_mass, &tiers, config);

    let mut builder = PlanBuilder::new(inventory, &population);
    let mut pools = Vec::with_capacity(ledgers.len());
    for mut ledger in ledgers {
        let base_source = match ledger.preference_tag {
            Some(_) => LineSource::Base(config.base_share_percent),
            None => LineSource::Base(100),
        };

        let allocation = allocate_proportionally(ledger.base_quantity, &tiers, &coefficients.weights);
        builder.extend(allocation.shares.iter().map(|(tier, share)| LineDelta::PerRecipient {
            kind: BundleKind::Standard(*tier),
            item: ledger.item.clone(),
            units: share.per_recipient,
            source: base_source,
        }));
        ledger.first_pass_leftover = allocation.leftover;

        let mut preference_recipients = 0;
        if let Some(tag) = ledger.preference_tag {
            preference_recipients = population.preference_count(tag);
            let share = share_equally(ledger.preference_quantity, preference_recipients);
            builder.extend([LineDelta::PerRecipient {
                kind: BundleKind::Preference(tag),
                item: ledger.item.clone(),
                units: share.per_recipient,
                source: LineSource::Preference(config.preference_share_percent),
            }]);
            ledger.preference_remainder = share.remainder;
        }

        debug!(
            item = %ledger.item,
            base = %ledger.base_quantity,
            preference = %ledger.preference_quantity,
            leftover = %ledger.first_pass_leftover,
            "first pass allocated"
        );
        pools.push(ItemPools {
            remainder_order: remainder_order(&allocation.shares),
            ledger,
            preference_recipients,
        });
    }

    let redistribution = redistribute(pools, &tiers, config.bonus_precision);
    builder.extend(redistribution.deltas);

    let report = RunReport {
        coefficients,
        population,
        items: redistribution.ledgers,
        conservation: Vec::new(),
    };
    let plan = builder.build(report, inventory, config.conservation_tolerance());
    info!(
        plan_id = %plan.plan_id,
        standard_bundles = plan.standard_bundles.len(),
        preference_bundles = plan.preference_bundles.len(),
        bonus = plan.bonus_bundle.is_some(),
        "allocation plan regenerated"
    );
    Ok(plan)
}

fn validate_inventory(inventory: &[InventoryItem]) -> Result<(), AllocationError> {
    let mut errors = Vec::new();
    let mut names = BTreeSet::new();
    for item in inventory {
        if item.name.trim().is_empty() {
            errors.push("item name MUST be non-empty".to_string());
        }
        if !names.insert(item.name.as_str()) {
            errors.push(format!("item {} appears more than once", item.name));
        }
        if item.quantity < Decimal::ZERO {
            errors.push(format!("item {} has a negative quantity ({})", item.name, item.quantity));
        }
        if item.quantity > MAX_ITEM_QUANTITY {
            errors.push(format!(
                "item {} quantity {} exceeds {MAX_ITEM_QUANTITY}",
                item.name, item.quantity
            ));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AllocationError::InvalidInventory(errors))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::coefficients::{CoefficientSource, TierWeights};
    use crate::plan::LineQuantity;
    use crate::{PreferenceTag, RecipientId, SizeTier};

    fn item(name: &str, quantity: Decimal) -> InventoryItem {
        InventoryItem { name: name.to_string(), quantity, unit: "kg".to_string() }
    }

    fn recipient(id: &str, tier: SizeTier, tag: Option<PreferenceTag>) -> Recipient {
        Recipient { id: RecipientId::new(id), size_tier: tier, preference_tag: tag, eligible: true }
    }

    /// Small=2, Medium=3, Large=1 with `tagged` of them carrying `tag`.
    fn six_households(tag: PreferenceTag, tagged: usize) -> Vec<Recipient> {
        let tiers = [
            SizeTier::Small,
            SizeTier::Small,
            SizeTier::Medium,
            SizeTier::Medium,
            SizeTier::Medium,
            SizeTier::Large,
        ];
        tiers
            .iter()
            .enumerate()
            .map(|(index, tier)| {
                let tag = (index >= tiers.len() - tagged).then_some(tag);
                recipient(&format!("r-{index}"), *tier, tag)
            })
            .collect()
    }

    fn fixed_config() -> EngineConfig {
        EngineConfig::default().with_fixed_coefficients(TierWeights::canonical())
    }

    fn run(
        inventory: &[InventoryItem],
        recipients: &[Recipient],
        config: &EngineConfig,
    ) -> AllocationPlan {
        match regenerate(inventory, recipients, config) {
            Ok(plan) => plan,
            Err(err) => panic!("regenerate failed: {err}"),
        }
    }

    fn per_recipient(plan: &AllocationPlan, kind: BundleKind, item: &str) -> Option<u64> {
        plan.bundles()
            .find(|bundle| bundle.kind == kind)
            .and_then(|bundle| bundle.line(item))
            .and_then(|line| match line.quantity {
                LineQuantity::PerRecipient(units) => Some(units),
                LineQuantity::Total(_) => None,
            })
    }

    fn ledger<'a>(plan: &'a AllocationPlan, item: &str) -> &'a ItemLedger {
        match plan.report.items.iter().find(|ledger| ledger.item == item) {
            Some(ledger) => ledger,
            None => panic!("missing ledger for {item}"),
        }
    }

    fn assert_conserved(plan: &AllocationPlan, inventory: &[InventoryItem]) {
        for item in inventory {
            assert_eq!(plan.allocated(&item.name), item.quantity, "item {} not conserved", item.name);
        }
    }

    #[test]
    fn rice_without_preference_follows_eleven_parts_and_rewards_largest_remainder() {
        let inventory = vec![item("Rice", Decimal::from(100))];
        let recipients = six_households(PreferenceTag::Halal, 0);
        let plan = run(&inventory, &recipients, &fixed_config());

        let rice = ledger(&plan, "Rice");
        assert_eq!(rice.first_pass_leftover, Decimal::ONE);
        assert_eq!(rice.phase1_consumed, Decimal::ONE);
        assert_eq!(per_recipient(&plan, BundleKind::Standard(SizeTier::Small), "Rice"), Some(9));
        assert_eq!(per_recipient(&plan, BundleKind::Standard(SizeTier::Medium), "Rice"), Some(18));
        assert_eq!(per_recipient(&plan, BundleKind::Standard(SizeTier::Large), "Rice"), Some(28));
        assert!(plan.bonus_bundle.is_none());
        assert!(plan.preference_bundles.is_empty());
        assert_conserved(&plan, &inventory);

        let large_line = plan
            .standard_bundle(SizeTier::Large)
            .and_then(|bundle| bundle.line("Rice"))
            .map(|line| (line.source, line.redistributed_units));
        assert_eq!(large_line, Some((Some(LineSource::Base(100)), 1)));
    }

    #[test]
    fn preference_item_splits_seventy_thirty() {
        let inventory = vec![item("Halal rice", Decimal::from(100))];
        let recipients = six_households(PreferenceTag::Halal, 4);
        let plan = run(&inventory, &recipients, &fixed_config());

        let rice = ledger(&plan, "Halal rice");
        assert_eq!(rice.preference_tag, Some(PreferenceTag::Halal));
        assert_eq!(rice.base_quantity, Decimal::from(70));
        assert_eq!(rice.preference_quantity, Decimal::from(30));
        assert_eq!(rice.first_pass_leftover, Decimal::from(3));
        assert_eq!(rice.preference_remainder, Decimal::from(2));
        assert_eq!(rice.phase2_consumed, Decimal::ONE);
        assert_eq!(rice.phase4_consumed, Decimal::ONE);
        assert_eq!(rice.bonus, Decimal::ZERO);

        let halal = BundleKind::Preference(PreferenceTag::Halal);
        assert_eq!(per_recipient(&plan, halal, "Halal rice"), Some(7));
        assert_eq!(plan.preference_bundle(PreferenceTag::Halal).and_then(|b| b.recipient_count), Some(4));
        assert_eq!(per_recipient(&plan, BundleKind::Standard(SizeTier::Small), "Halal rice"), Some(6));
        assert_eq!(per_recipient(&plan, BundleKind::Standard(SizeTier::Medium), "Halal rice"), Some(13));
        assert_eq!(per_recipient(&plan, BundleKind::Standard(SizeTier::Large), "Halal rice"), Some(21));
        assert_conserved(&plan, &inventory);

        let sources = plan
            .bundles()
            .flat_map(|bundle| bundle.lines.iter().map(|line| line.source))
            .collect::<Vec<_>>();
        assert!(sources.contains(&Some(LineSource::Base(70))));
        assert!(sources.contains(&Some(LineSource::Preference(30))));
    }

    #[test]
    fn untagged_population_sends_preference_share_to_bonus_path() {
        let inventory = vec![item("Halal rice", Decimal::from(100))];
        let recipients = six_households(PreferenceTag::Halal, 0);
        let plan = run(&inventory, &recipients, &fixed_config());

        let rice = ledger(&plan, "Halal rice");
        assert_eq!(rice.phase2_consumed, Decimal::ZERO);
        assert_eq!(rice.bonus_pool, Decimal::from(30));
        assert_eq!(rice.phase4_consumed, Decimal::from(6));
        assert_eq!(rice.bonus, Decimal::from(24));
        assert!(plan.preference_bundles.is_empty());

        let bonus = match &plan.bonus_bundle {
            Some(bundle) => bundle,
            None => panic!("expected a bonus bundle"),
        };
        assert_eq!(bonus.recipient_count, None);
        assert_eq!(
            bonus.line("Halal rice").map(|line| line.quantity),
            Some(LineQuantity::Total(Decimal::from(24)))
        );
        assert_conserved(&plan, &inventory);
    }

    #[test]
    fn dynamic_coefficients_respect_fairness_ratio_without_medium_tier() {
        let inventory = vec![item("Rice", Decimal::from(50))];
        let mut recipients = (0..10)
            .map(|index| recipient(&format!("s-{index}"), SizeTier::Small, None))
            .collect::<Vec<_>>();
        recipients.push(recipient("l-0", SizeTier::Large, None));
        let plan = run(&inventory, &recipients, &EngineConfig::default());

        let coefficients = plan.report.coefficients;
        assert_eq!(coefficients.source, CoefficientSource::Dynamic);
        assert_eq!(coefficients.reference_mass, Decimal::from(50));
        let ratio = match coefficients.weights.fairness_ratio() {
            Some(ratio) => ratio,
            None => panic!("small weight must be positive"),
        };
        assert!(ratio <= Decimal::from(3));
        assert_eq!(per_recipient(&plan, BundleKind::Standard(SizeTier::Large), "Rice"), Some(13));
        assert!(plan.standard_bundle(SizeTier::Medium).is_none());
        assert_conserved(&plan, &inventory);
    }

    #[test]
    fn every_configuration_violation_is_reported_before_running() {
        let mut config = EngineConfig::default();
        config.base_share_percent = 80;
        config.max_fairness_ratio = Decimal::ZERO;
        let err = match regenerate(&[], &[], &config) {
            Ok(plan) => panic!("expected configuration failure, got {plan:?}"),
            Err(err) => err,
        };
        match err {
            AllocationError::InvalidConfiguration(violations) => assert_eq!(violations.len(), 2),
            other => panic!("expected InvalidConfiguration, got {other:?}"),
        }
    }

    #[test]
    fn empty_inputs_are_distinct_failures() {
        let recipients = six_households(PreferenceTag::Halal, 0);
        assert_eq!(
            regenerate(&[], &recipients, &EngineConfig::default()),
            Err(AllocationError::EmptyInventory)
        );

        let inventory = vec![item("Rice", Decimal::from(10))];
        let mut ineligible = recipients;
        for recipient in &mut ineligible {
            recipient.eligible = false;
        }
        assert_eq!(
            regenerate(&inventory, &ineligible, &EngineConfig::default()),
            Err(AllocationError::NoEligibleRecipients)
        );
    }

    #[test]
    fn invalid_inventory_lists_every_problem() {
        let inventory = vec![
            item("Rice", Decimal::from(10)),
            item("Rice", Decimal::from(5)),
            item("Oil", Decimal::from(-1)),
            item(" ", Decimal::ONE),
            item("Sand", MAX_ITEM_QUANTITY + Decimal::ONE),
        ];
        let recipients = six_households(PreferenceTag::Halal, 0);
        match regenerate(&inventory, &recipients, &EngineConfig::default()) {
            Err(AllocationError::InvalidInventory(errors)) => assert_eq!(errors.len(), 4),
            other => panic!("expected InvalidInventory, got {other:?}"),
        }
    }

    #[test]
    fn zero_quantity_item_produces_no_lines() {
        let inventory = vec![item("Rice", Decimal::from(12)), item("Oil", Decimal::ZERO)];
        let recipients = six_households(PreferenceTag::Halal, 0);
        let plan = run(&inventory, &recipients, &fixed_config());
        assert!(plan.bundles().all(|bundle| bundle.line("Oil").is_none()));
        assert_conserved(&plan, &inventory);
    }

    #[test]
    fn fractional_quantities_leave_a_rounded_bonus() {
        let inventory = vec![item("Flour", Decimal::new(10_005, 3))];
        let recipients = six_households(PreferenceTag::Halal, 0);
        let plan = run(&inventory, &recipients, &fixed_config());
        let flour = ledger(&plan, "Flour");
        assert_eq!(flour.rounding_drift, Decimal::new(5, 3));
        assert_eq!(plan.allocated("Flour"), Decimal::from(10));
        assert!(plan.report.conservation.iter().all(|check| check.within_tolerance));
    }

    #[test]
    fn input_order_does_not_change_the_plan() {
        let inventory = vec![
            item("Rice", Decimal::from(100)),
            item("Halal chicken", Decimal::new(4125, 2)),
            item("Couches", Decimal::from(37)),
        ];
        let mut recipients = six_households(PreferenceTag::Halal, 3);
        recipients.push(recipient("b-1", SizeTier::Medium, Some(PreferenceTag::Baby)));

        let plan_a = run(&inventory, &recipients, &EngineConfig::default());
        let mut reversed_inventory = inventory.clone();
        reversed_inventory.reverse();
        let mut reversed_recipients = recipients.clone();
        reversed_recipients.reverse();
        let plan_b = run(&reversed_inventory, &reversed_recipients, &EngineConfig::default());

        let json_a = serde_json::to_string(&plan_a).unwrap_or_default();
        let json_b = serde_json::to_string(&plan_b).unwrap_or_default();
        assert!(!json_a.is_empty());
        assert_eq!(json_a, json_b);
        assert_eq!(plan_a.plan_id, plan_b.plan_id);
    }

    fn tier_strategy() -> impl Strategy<Value = SizeTier> {
        prop_oneof![Just(SizeTier::Small), Just(SizeTier::Medium), Just(SizeTier::Large)]
    }

    fn tag_strategy() -> impl Strategy<Value = Option<PreferenceTag>> {
        prop_oneof![
            Just(None),
            Just(Some(PreferenceTag::Baby)),
            Just(Some(PreferenceTag::Vegetarian)),
            Just(Some(PreferenceTag::Halal)),
        ]
    }

    fn recipients_strategy() -> impl Strategy<Value = Vec<Recipient>> {
        prop::collection::vec((tier_strategy(), tag_strategy(), any::<bool>()), 1..40).prop_map(
            |rows| {
                rows.into_iter()
                    .enumerate()
                    .map(|(index, (tier, tag, eligible))| Recipient {
                        id: RecipientId::new(format!("r-{index:03}")),
                        size_tier: tier,
                        preference_tag: tag,
                        // First recipient always eligible so the run has a population.
                        eligible: eligible || index == 0,
                    })
                    .collect()
            },
        )
    }

    fn inventory_strategy() -> impl Strategy<Value = Vec<InventoryItem>> {
        let names = ["Rice", "Pasta", "Halal beef", "Tofu", "Baby food", "Oil", "Couches"];
        prop::collection::vec((0..names.len(), 0_i64..5_000_000, 0_u32..4), 1..6).prop_map(
            move |rows| {
                let mut seen = BTreeSet::new();
                rows.into_iter()
                    .filter(|(index, _, _)| seen.insert(*index))
                    .map(|(index, mantissa, scale)| InventoryItem {
                        name: names[index].to_string(),
                        quantity: Decimal::new(mantissa, scale),
                        unit: "unit".to_string(),
                    })
                    .collect()
            },
        )
    }

    fn config_strategy() -> impl Strategy<Value = EngineConfig> {
        (0_u8..=100, 1_u32..=6, any::<bool>(), 10_i64..=60).prop_map(
            |(base_share, precision, fixed, ratio_tenths)| {
                let mut config = EngineConfig::default().with_base_share(base_share);
                config.bonus_precision = precision;
                config.max_fairness_ratio = Decimal::new(ratio_tenths, 1);
                if fixed {
                    config.fixed_coefficients = Some(TierWeights {
                        small: Decimal::ONE,
                        medium: Decimal::new(15, 1),
                        large: Decimal::new(ratio_tenths, 1),
                    });
                }
                config
            },
        )
    }

    proptest! {
        #[test]
        fn property_every_item_is_conserved_within_tolerance(
            inventory in inventory_strategy(),
            recipients in recipients_strategy(),
            config in config_strategy(),
        ) {
            let plan = regenerate(&inventory, &recipients, &config);
            prop_assert!(plan.is_ok(), "{plan:?}");
            let plan = plan.unwrap_or_else(|_| unreachable!());
            let tolerance = config.conservation_tolerance();
            for item in &inventory {
                let drift = item.quantity - plan.allocated(&item.name);
                prop_assert!(drift >= Decimal::ZERO, "units created for {}: {drift}", item.name);
                prop_assert!(drift < tolerance, "drift {drift} for {}", item.name);
            }
        }

        #[test]
        fn property_standard_and_preference_lines_are_whole_units(
            inventory in inventory_strategy(),
            recipients in recipients_strategy(),
            config in config_strategy(),
        ) {
            let plan = regenerate(&inventory, &recipients, &config).unwrap_or_else(|_| unreachable!());
            for bundle in plan.standard_bundles.iter().chain(plan.preference_bundles.iter()) {
                prop_assert!(bundle.recipient_count.unwrap_or(0) > 0);
                for line in &bundle.lines {
                    let is_positive_whole =
                        matches!(line.quantity, LineQuantity::PerRecipient(units) if units > 0);
                    prop_assert!(is_positive_whole, "{line:?}");
                }
            }
            if let Some(bonus) = &plan.bonus_bundle {
                prop_assert!(!bonus.lines.is_empty());
            }
        }

        #[test]
        fn property_dynamic_coefficients_respect_fairness_ratio(
            inventory in inventory_strategy(),
            recipients in recipients_strategy(),
            config in config_strategy(),
        ) {
            let plan = regenerate(&inventory, &recipients, &config).unwrap_or_else(|_| unreachable!());
            let coefficients = plan.report.coefficients;
            if coefficients.source == CoefficientSource::Dynamic {
                let weights = coefficients.weights;
                prop_assert!(weights.large <= config.max_fairness_ratio * weights.small);
                prop_assert!(weights.small <= weights.medium && weights.medium <= weights.large);
            }
        }

        #[test]
        fn property_regeneration_is_deterministic(
            inventory in inventory_strategy(),
            recipients in recipients_strategy(),
            config in config_strategy(),
        ) {
            let first = regenerate(&inventory, &recipients, &config);
            let second = regenerate(&inventory, &recipients, &config);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn property_attribution_is_idempotent(
            inventory in inventory_strategy(),
            recipients in recipients_strategy(),
        ) {
            let plan = regenerate(&inventory, &recipients, &EngineConfig::default())
                .unwrap_or_else(|_| unreachable!());
            let first = crate::attribute(&plan, &recipients, &[]);
            let second = crate::attribute(&plan, &recipients, &first.attributions);
            prop_assert_eq!(first.attributions, second.attributions);
            prop_assert_eq!(first.skipped, second.skipped);
        }
    }
}
