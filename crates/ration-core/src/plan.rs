use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::error;

use crate::coefficients::ResolvedCoefficients;
use crate::eligibility::Population;
use crate::engine::RULESET_VERSION;
use crate::{InventoryItem, PreferenceTag, SizeTier};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(tag = "type", content = "key", rename_all = "snake_case")]
pub enum BundleKind {
    Standard(SizeTier),
    Preference(PreferenceTag),
    Bonus,
}

impl BundleKind {
    /// Stable string form used as a storage and attribution reference.
    #[must_use]
    pub fn key(self) -> String {
        match self {
            Self::Standard(tier) => format!("standard:{}", tier.as_str()),
            Self::Preference(tag) => format!("preference:{}", tag.as_str()),
            Self::Bonus => "bonus".to_string(),
        }
    }

    #[must_use]
    pub fn parse_key(value: &str) -> Option<Self> {
        if value == "bonus" {
            return Some(Self::Bonus);
        }
        let (kind, key) = value.split_once(':')?;
        match kind {
            "standard" => SizeTier::parse(key).map(Self::Standard),
            "preference" => PreferenceTag::parse(key).map(Self::Preference),
            _ => None,
        }
    }
}

impl Display for BundleKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Where the bulk of a line's quantity came from. Display-only metadata.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(into = "String", try_from = "String")]
pub enum LineSource {
    Base(u8),
    Preference(u8),
    Redistributed,
}

impl Display for LineSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Base(percent) => write!(f, "base-{percent}%"),
            Self::Preference(percent) => write!(f, "preference-{percent}%"),
            Self::Redistributed => write!(f, "redistributed"),
        }
    }
}

impl From<LineSource> for String {
    fn from(value: LineSource) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for LineSource {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == "redistributed" {
            return Ok(Self::Redistributed);
        }
        let parse_percent = |raw: &str| {
            raw.strip_suffix('%')
                .and_then(|digits| digits.parse::<u8>().ok())
                .filter(|percent| *percent <= 100)
        };
        if let Some(percent) = value.strip_prefix("base-").and_then(parse_percent) {
            return Ok(Self::Base(percent));
        }
        if let Some(percent) = value.strip_prefix("preference-").and_then(parse_percent) {
            return Ok(Self::Preference(percent));
        }
        Err(format!("unsupported line source: {value}"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LineQuantity {
    PerRecipient(u64),
    Total(Decimal),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BundleLine {
    pub item: String,
    pub quantity: LineQuantity,
    pub unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<LineSource>,
    /// Per-recipient units added by the redistribution passes.
    #[serde(default)]
    pub redistributed_units: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Bundle {
    pub kind: BundleKind,
    /// Recipients served by the bundle; `None` for the bonus bundle.
    pub recipient_count: Option<u64>,
    pub lines: Vec<BundleLine>,
}

impl Bundle {
    #[must_use]
    pub fn line(&self, item: &str) -> Option<&BundleLine> {
        self.lines.iter().find(|line| line.item == item)
    }

    /// Quantity of `item` held by the whole bundle.
    #[must_use]
    pub fn quantity_of(&self, item: &str) -> Decimal {
        match self.line(item).map(|line| line.quantity) {
            Some(LineQuantity::PerRecipient(units)) => {
                Decimal::from(units) * Decimal::from(self.recipient_count.unwrap_or(0))
            }
            Some(LineQuantity::Total(total)) => total,
            None => Decimal::ZERO,
        }
    }
}

/// Per-item trace of every phase of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ItemLedger {
    pub item: String,
    pub total: Decimal,
    pub preference_tag: Option<PreferenceTag>,
    pub base_quantity: Decimal,
    pub preference_quantity: Decimal,
    pub first_pass_leftover: Decimal,
    pub phase1_consumed: Decimal,
    pub preference_remainder: Decimal,
    pub phase2_consumed: Decimal,
    /// Bonus pool after phase 3 rounding, before the final pass.
    pub bonus_pool: Decimal,
    pub rounding_drift: Decimal,
    pub phase4_consumed: Decimal,
    pub bonus: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConservationCheck {
    pub item: String,
    pub expected: Decimal,
    pub allocated: Decimal,
    pub drift: Decimal,
    pub within_tolerance: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunReport {
    pub coefficients: ResolvedCoefficients,
    pub population: Population,
    pub items: Vec<ItemLedger>,
    pub conservation: Vec<ConservationCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AllocationPlan {
    pub plan_id: String,
    pub ruleset_version: String,
    pub standard_bundles: Vec<Bundle>,
    pub preference_bundles: Vec<Bundle>,
    pub bonus_bundle: Option<Bundle>,
    pub report: RunReport,
}

impl AllocationPlan {
    #[must_use]
    pub fn standard_bundle(&self, tier: SizeTier) -> Option<&Bundle> {
        self.standard_bundles.iter().find(|bundle| bundle.kind == BundleKind::Standard(tier))
    }

    #[must_use]
    pub fn preference_bundle(&self, tag: PreferenceTag) -> Option<&Bundle> {
        self.preference_bundles.iter().find(|bundle| bundle.kind == BundleKind::Preference(tag))
    }

    pub fn bundles(&self) -> impl Iterator<Item = &Bundle> {
        self.standard_bundles
            .iter()
            .chain(self.preference_bundles.iter())
            .chain(self.bonus_bundle.iter())
    }

    /// Quantity of `item` across every bundle of the plan.
    #[must_use]
    pub fn allocated(&self, item: &str) -> Decimal {
        self.bundles().map(|bundle| bundle.quantity_of(item)).sum()
    }
}

/// One immutable contribution emitted by an allocation phase.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum LineDelta {
    PerRecipient { kind: BundleKind, item: String, units: u64, source: LineSource },
    BonusTotal { item: String, quantity: Decimal },
}

#[derive(Debug, Default)]
struct MergedLine {
    units: u64,
    total: Decimal,
    source: Option<LineSource>,
    redistributed_units: u64,
}

/// Collects phase deltas and merges them into bundles exactly once.
#[derive(Debug)]
pub(crate) struct PlanBuilder {
    units: BTreeMap<String, String>,
    population: Population,
    deltas: Vec<LineDelta>,
}

impl PlanBuilder {
    pub(crate) fn new(inventory: &[InventoryItem], population: &Population) -> Self {
        let units =
            inventory.iter().map(|item| (item.name.clone(), item.unit.clone())).collect();
        Self { units, population: population.clone(), deltas: Vec::new() }
    }

    pub(crate) fn extend(&mut self, deltas: impl IntoIterator<Item = LineDelta>) {
        self.deltas.extend(deltas);
    }

    fn recipient_count(&self, kind: BundleKind) -> Option<u64> {
        match kind {
            BundleKind::Standard(tier) => Some(self.population.tiers.get(tier)),
            BundleKind::Preference(tag) => Some(self.population.preference_count(tag)),
            BundleKind::Bonus => None,
        }
    }

    fn merge(&self) -> BTreeMap<(BundleKind, String), MergedLine> {
        let mut merged: BTreeMap<(BundleKind, String), MergedLine> = BTreeMap::new();
        for delta in &self.deltas {
            match delta {
                LineDelta::PerRecipient { kind, item, units, source } => {
                    let line = merged.entry((*kind, item.clone())).or_default();
                    line.units += units;
                    if *source == LineSource::Redistributed {
                        line.redistributed_units += units;
                    } else {
                        line.source = Some(*source);
                    }
                }
                LineDelta::BonusTotal { item, quantity } => {
                    let line = merged.entry((BundleKind::Bonus, item.clone())).or_default();
                    line.total += quantity;
                }
            }
        }
        merged
    }

    /// Assemble the plan, dropping zero lines and bundles without lines or
    /// recipients, then check conservation item by item.
    pub(crate) fn build(
        self,
        report: RunReport,
        inventory: &[InventoryItem],
        tolerance: Decimal,
    ) -> AllocationPlan {
        let mut grouped: BTreeMap<BundleKind, Vec<BundleLine>> = BTreeMap::new();
        for ((kind, item), line) in self.merge() {
            let quantity = if kind == BundleKind::Bonus {
                if line.total <= Decimal::ZERO {
                    continue;
                }
                LineQuantity::Total(line.total.normalize())
            } else {
                if line.units == 0 {
                    continue;
                }
                LineQuantity::PerRecipient(line.units)
            };
            let source = match kind {
                BundleKind::Bonus => None,
                _ => Some(line.source.unwrap_or(LineSource::Redistributed)),
            };
            let unit = self.units.get(&item).cloned().unwrap_or_default();
            grouped.entry(kind).or_default().push(BundleLine {
                item,
                quantity,
                unit,
                source,
                redistributed_units: line.redistributed_units,
            });
        }

        let mut standard_bundles = Vec::new();
        let mut preference_bundles = Vec::new();
        let mut bonus_bundle = None;
        for (kind, lines) in grouped {
            let recipient_count = self.recipient_count(kind);
            if lines.is_empty() || recipient_count == Some(0) {
                continue;
            }
            let bundle = Bundle { kind, recipient_count, lines };
            match kind {
                BundleKind::Standard(_) => standard_bundles.push(bundle),
                BundleKind::Preference(_) => preference_bundles.push(bundle),
                BundleKind::Bonus => bonus_bundle = Some(bundle),
            }
        }

        let mut plan = AllocationPlan {
            plan_id: String::new(),
            ruleset_version: RULESET_VERSION.to_string(),
            standard_bundles,
            preference_bundles,
            bonus_bundle,
            report,
        };
        plan.report.conservation = check_conservation(&plan, inventory, tolerance);
        plan.plan_id = compute_plan_id(&plan);
        plan
    }
}

/// Compare every item's allocated quantity with its input total.
///
/// A breach beyond `tolerance` is logged, and debug builds treat it as a
/// broken invariant.
pub(crate) fn check_conservation(
    plan: &AllocationPlan,
    inventory: &[InventoryItem],
    tolerance: Decimal,
) -> Vec<ConservationCheck> {
    let mut checks = inventory
        .iter()
        .map(|item| {
            let allocated = plan.allocated(&item.name);
            let drift = item.quantity - allocated;
            let within_tolerance = drift >= Decimal::ZERO && drift < tolerance;
            if !within_tolerance {
                error!(
                    item = %item.name,
                    expected = %item.quantity,
                    allocated = %allocated,
                    "conservation invariant violated"
                );
            }
            ConservationCheck {
                item: item.name.clone(),
                expected: item.quantity,
                allocated,
                drift,
                within_tolerance,
            }
        })
        .collect::<Vec<_>>();
    checks.sort_by(|left, right| left.item.cmp(&right.item));

    debug_assert!(
        checks.iter().all(|check| check.within_tolerance),
        "conservation drift beyond tolerance: {checks:?}"
    );
    checks
}

fn compute_plan_id(plan: &AllocationPlan) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plan.ruleset_version.as_bytes());

    let weights = plan.report.coefficients.weights;
    for weight in [weights.small, weights.medium, weights.large] {
        hasher.update(weight.normalize().to_string().as_bytes());
    }

    for bundle in plan.bundles() {
        hasher.update(bundle.kind.key().as_bytes());
        hasher.update(bundle.recipient_count.unwrap_or(0).to_string().as_bytes());
        for line in &bundle.lines {
            let quantity = match line.quantity {
                LineQuantity::PerRecipient(units) => format!("per:{units}"),
                LineQuantity::Total(total) => format!("total:{}", total.normalize()),
            };
            hasher.update(format!("{}|{}|{}", line.item, quantity, line.unit).as_bytes());
        }
    }

    let digest = hasher.finalize();
    let prefix = digest.iter().take(8).map(|byte| format!("{byte:02x}")).collect::<String>();
    format!("plan_{prefix}")
}
