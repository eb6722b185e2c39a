use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{AllocationError, PreferenceTag, Recipient, SizeTier};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct TierCounts {
    pub small: u64,
    pub medium: u64,
    pub large: u64,
}

impl TierCounts {
    #[must_use]
    pub fn get(&self, tier: SizeTier) -> u64 {
        match tier {
            SizeTier::Small => self.small,
            SizeTier::Medium => self.medium,
            SizeTier::Large => self.large,
        }
    }

    fn bump(&mut self, tier: SizeTier) {
        match tier {
            SizeTier::Small => self.small += 1,
            SizeTier::Medium => self.medium += 1,
            SizeTier::Large => self.large += 1,
        }
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.small + self.medium + self.large
    }

    /// Tiers with at least one recipient, in the order given.
    pub fn populated(&self, order: [SizeTier; 3]) -> impl Iterator<Item = SizeTier> + '_ {
        order.into_iter().filter(|tier| self.get(*tier) > 0)
    }

    /// Smallest nonzero tier population, if any tier is populated.
    #[must_use]
    pub fn smallest_populated(&self) -> Option<u64> {
        self.populated(SizeTier::ALL).map(|tier| self.get(tier)).min()
    }
}

/// Eligible population split by size tier and by preference tag.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Population {
    pub tiers: TierCounts,
    pub preferences: BTreeMap<PreferenceTag, u64>,
}

impl Population {
    #[must_use]
    pub fn preference_count(&self, tag: PreferenceTag) -> u64 {
        self.preferences.get(&tag).copied().unwrap_or(0)
    }
}

/// Count eligible recipients per tier and per preference tag.
///
/// # Errors
/// Returns [`AllocationError::DuplicateRecipient`] when an id repeats and
/// [`AllocationError::NoEligibleRecipients`] when nobody is eligible.
pub fn partition(recipients: &[Recipient]) -> Result<Population, AllocationError> {
    let mut seen = BTreeSet::new();
    let mut population = Population::default();

    for recipient in recipients {
        if !seen.insert(&recipient.id) {
            return Err(AllocationError::DuplicateRecipient {
                recipient_id: recipient.id.clone(),
            });
        }
        if !recipient.eligible {
            continue;
        }
        population.tiers.bump(recipient.size_tier);
        if let Some(tag) = recipient.preference_tag {
            *population.preferences.entry(tag).or_insert(0) += 1;
        }
    }

    if population.tiers.total() == 0 {
        return Err(AllocationError::NoEligibleRecipients);
    }
    Ok(population)
}
