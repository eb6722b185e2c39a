//! Deterministic allocation engine for charity distribution runs.
//!
//! A run takes a divisible inventory, the eligible recipient population and an
//! [`EngineConfig`], and produces an [`AllocationPlan`]: one standard bundle per
//! size tier, one preference bundle per preference tag and at most one bonus
//! bundle. Every unit of every item ends up in exactly one of those bundles.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

mod allocate;
mod attribution;
mod classify;
mod coefficients;
mod config;
mod eligibility;
mod engine;
mod plan;
mod redistribute;

pub use attribution::{
    attribute, reconcile, Attribution, AttributionOutcome, BundleRef, Reconciliation,
    RecipientFingerprint, Revocation, RevocationReason, SkippedRecipient,
};
pub use classify::{normalize_label, ClassificationRule, ClassificationTable, Classifier};
pub use coefficients::{resolve_coefficients, CoefficientSource, ResolvedCoefficients, TierWeights};
pub use config::{ConfigViolation, EngineConfig};
pub use eligibility::{partition, Population, TierCounts};
pub use engine::{regenerate, MAX_ITEM_QUANTITY, RULESET_VERSION};
pub use plan::{
    AllocationPlan, Bundle, BundleKind, BundleLine, ConservationCheck, ItemLedger, LineQuantity,
    LineSource, RunReport,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AllocationError {
    #[error("invalid configuration: {}", join_violations(.0))]
    InvalidConfiguration(Vec<ConfigViolation>),
    #[error("invalid inventory: {}", join_messages(.0))]
    InvalidInventory(Vec<String>),
    #[error("inventory is empty; nothing to allocate")]
    EmptyInventory,
    #[error("no eligible recipients; nothing to allocate to")]
    NoEligibleRecipients,
    #[error("recipient {recipient_id} appears more than once")]
    DuplicateRecipient { recipient_id: RecipientId },
    #[error("recipient {recipient_id} has neither a size tier nor a household size")]
    UnresolvedTier { recipient_id: RecipientId },
}

fn join_violations(violations: &[ConfigViolation]) -> String {
    violations.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

fn join_messages(messages: &[String]) -> String {
    messages.join("; ")
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecipientId(pub String);

impl RecipientId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RecipientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SizeTier {
    Small,
    Medium,
    Large,
}

impl SizeTier {
    pub const ALL: [Self; 3] = [Self::Small, Self::Medium, Self::Large];

    /// Fixed waterfall priority used whenever remainders are pushed without a
    /// per-tier ranking.
    pub const PRIORITY: [Self; 3] = [Self::Large, Self::Medium, Self::Small];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "small" => Some(Self::Small),
            "medium" => Some(Self::Medium),
            "large" => Some(Self::Large),
            _ => None,
        }
    }

    /// Household size to tier: up to 2 persons is small, 3 to 5 medium, 6 and more large.
    #[must_use]
    pub fn from_household_size(persons: u32) -> Self {
        match persons {
            0..=2 => Self::Small,
            3..=5 => Self::Medium,
            _ => Self::Large,
        }
    }

    /// An explicit tier always wins over a household size.
    #[must_use]
    pub fn resolve(explicit: Option<Self>, household_size: Option<u32>) -> Option<Self> {
        explicit.or_else(|| household_size.map(Self::from_household_size))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceTag {
    Baby,
    Vegetarian,
    Halal,
}

impl PreferenceTag {
    pub const ALL: [Self; 3] = [Self::Baby, Self::Vegetarian, Self::Halal];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baby => "baby",
            Self::Vegetarian => "vegetarian",
            Self::Halal => "halal",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "baby" => Some(Self::Baby),
            "vegetarian" => Some(Self::Vegetarian),
            "halal" => Some(Self::Halal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct InventoryItem {
    pub name: String,
    pub quantity: rust_decimal::Decimal,
    pub unit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Recipient {
    pub id: RecipientId,
    pub size_tier: SizeTier,
    pub preference_tag: Option<PreferenceTag>,
    pub eligible: bool,
}

impl Recipient {
    /// Build a recipient from the raw fields kept by the external store.
    ///
    /// # Errors
    /// Returns [`AllocationError::UnresolvedTier`] when neither a tier nor a
    /// household size is known.
    pub fn from_parts(
        id: RecipientId,
        size_tier: Option<SizeTier>,
        household_size: Option<u32>,
        preference_tag: Option<PreferenceTag>,
        eligible: bool,
    ) -> Result<Self, AllocationError> {
        let Some(size_tier) = SizeTier::resolve(size_tier, household_size) else {
            return Err(AllocationError::UnresolvedTier { recipient_id: id });
        };
        Ok(Self { id, size_tier, preference_tag, eligible })
    }

    #[must_use]
    pub fn fingerprint(&self) -> RecipientFingerprint {
        RecipientFingerprint {
            size_tier: self.size_tier,
            preference_tag: self.preference_tag,
            eligible: self.eligible,
        }
    }
}
