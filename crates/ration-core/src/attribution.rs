use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::plan::{AllocationPlan, BundleKind};
use crate::{PreferenceTag, Recipient, RecipientId, SizeTier};

/// The recipient fields an attribution depends on. Any change revokes it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecipientFingerprint {
    pub size_tier: SizeTier,
    pub preference_tag: Option<PreferenceTag>,
    pub eligible: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BundleRef {
    pub plan_id: String,
    pub kind: BundleKind,
}

impl Display for BundleRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.plan_id, self.kind.key())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Attribution {
    pub recipient_id: RecipientId,
    pub plan_id: String,
    pub standard_bundle: BundleRef,
    pub preference_bundle: Option<BundleRef>,
    /// Recipient state the assignment was computed from.
    pub fingerprint: RecipientFingerprint,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    RecipientRemoved,
    NoLongerEligible,
    FingerprintChanged,
}

impl RevocationReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RecipientRemoved => "recipient_removed",
            Self::NoLongerEligible => "no_longer_eligible",
            Self::FingerprintChanged => "fingerprint_changed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Revocation {
    pub recipient_id: RecipientId,
    pub reason: RevocationReason,
    pub previous: Attribution,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SkippedRecipient {
    pub recipient_id: RecipientId,
    pub reason: String,
}

/// Previous attributions checked against the current recipients.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Reconciliation {
    /// Attributions whose recipient is unchanged.
    pub kept: Vec<Attribution>,
    pub revoked: Vec<Revocation>,
    /// Eligible recipients without a valid attribution, sorted by id.
    pub pending: Vec<RecipientId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AttributionOutcome {
    pub plan_id: String,
    /// Sorted by recipient id.
    pub attributions: Vec<Attribution>,
    /// Eligible recipients still unattributed after this pass.
    pub pending: Vec<RecipientId>,
    pub revoked: Vec<Revocation>,
    pub skipped: Vec<SkippedRecipient>,
}

/// Revoke every previous attribution whose recipient disappeared, lost
/// eligibility, or changed tier or preference tag since it was attributed.
#[must_use]
pub fn reconcile(previous: &[Attribution], recipients: &[Recipient]) -> Reconciliation {
    let mut by_id: BTreeMap<&RecipientId, &Recipient> = BTreeMap::new();
    for recipient in recipients {
        by_id.entry(&recipient.id).or_insert(recipient);
    }

    let mut kept = Vec::new();
    let mut revoked = Vec::new();
    for attribution in previous {
        let reason = match by_id.get(&attribution.recipient_id) {
            None => Some(RevocationReason::RecipientRemoved),
            Some(recipient) if !recipient.eligible => Some(RevocationReason::NoLongerEligible),
            Some(recipient) if recipient.fingerprint() != attribution.fingerprint => {
                Some(RevocationReason::FingerprintChanged)
            }
            Some(_) => None,
        };
        match reason {
            Some(reason) => {
                warn!(
                    recipient_id = %attribution.recipient_id,
                    reason = reason.as_str(),
                    "revoking stale attribution"
                );
                revoked.push(Revocation {
                    recipient_id: attribution.recipient_id.clone(),
                    reason,
                    previous: attribution.clone(),
                });
            }
            None => kept.push(attribution.clone()),
        }
    }
    kept.sort_by(|left, right| left.recipient_id.cmp(&right.recipient_id));
    kept.dedup_by(|left, right| left.recipient_id == right.recipient_id);
    revoked.sort_by(|left, right| left.recipient_id.cmp(&right.recipient_id));

    let pending = by_id
        .values()
        .filter(|recipient| recipient.eligible)
        .filter(|recipient| {
            kept.binary_search_by(|attribution| attribution.recipient_id.cmp(&recipient.id)).is_err()
        })
        .map(|recipient| recipient.id.clone())
        .collect();

    Reconciliation { kept, revoked, pending }
}

/// Attribute every eligible recipient to the bundles of `plan`.
///
/// Attributions already pointing at this plan for an unchanged recipient are
/// kept as they are, so running this twice gives the same result. A bundle
/// never receives more recipients than its `recipient_count`. A recipient
/// whose attribution to this same plan was revoked because its tier or tag
/// changed stays pending until a plan computed from its new state exists. A
/// recipient whose tier has no standard bundle, or whose standard bundle is
/// already fully attributed, is skipped with a reason and stays pending; it
/// does not abort the pass.
#[must_use]
pub fn attribute(
    plan: &AllocationPlan,
    recipients: &[Recipient],
    previous: &[Attribution],
) -> AttributionOutcome {
    let reconciliation = reconcile(previous, recipients);
    let by_id = recipients
        .iter()
        .map(|recipient| (&recipient.id, recipient))
        .collect::<BTreeMap<_, _>>();

    let mut seats = Seats::open(plan);
    let mut attributions = Vec::new();
    let mut to_assign = Vec::new();
    for attribution in reconciliation.kept {
        if attribution.plan_id == plan.plan_id {
            seats.take(&attribution);
            attributions.push(attribution);
        } else {
            to_assign.push(attribution.recipient_id);
        }
    }

    let mut pending = Vec::new();
    for recipient_id in reconciliation.pending {
        let changed_since_plan = reconciliation.revoked.iter().any(|revocation| {
            revocation.recipient_id == recipient_id
                && revocation.reason == RevocationReason::FingerprintChanged
                && revocation.previous.plan_id == plan.plan_id
        });
        if changed_since_plan {
            debug!(
                recipient_id = %recipient_id,
                plan_id = %plan.plan_id,
                "recipient changed after this plan was computed, left pending"
            );
            pending.push(recipient_id);
        } else {
            to_assign.push(recipient_id);
        }
    }
    to_assign.sort();

    let mut skipped = Vec::new();
    for recipient_id in to_assign {
        let Some(recipient) = by_id.get(&recipient_id) else {
            continue;
        };
        match assign(plan, recipient, &seats) {
            Ok(attribution) => {
                debug!(recipient_id = %recipient_id, "attributed recipient");
                seats.take(&attribution);
                attributions.push(attribution);
            }
            Err(reason) => {
                warn!(recipient_id = %recipient_id, reason = %reason, "skipping recipient");
                skipped.push(SkippedRecipient { recipient_id: recipient_id.clone(), reason });
                pending.push(recipient_id);
            }
        }
    }
    attributions.sort_by(|left, right| left.recipient_id.cmp(&right.recipient_id));
    pending.sort();

    AttributionOutcome {
        plan_id: plan.plan_id.clone(),
        attributions,
        pending,
        revoked: reconciliation.revoked,
        skipped,
    }
}

/// Unclaimed recipient slots per bundle of one plan.
struct Seats {
    free: BTreeMap<BundleKind, u64>,
}

impl Seats {
    fn open(plan: &AllocationPlan) -> Self {
        let free = plan
            .standard_bundles
            .iter()
            .chain(&plan.preference_bundles)
            .filter_map(|bundle| bundle.recipient_count.map(|count| (bundle.kind, count)))
            .collect();
        Self { free }
    }

    fn available(&self, kind: BundleKind) -> bool {
        self.free.get(&kind).is_some_and(|free| *free > 0)
    }

    fn take(&mut self, attribution: &Attribution) {
        let kinds = std::iter::once(attribution.standard_bundle.kind)
            .chain(attribution.preference_bundle.as_ref().map(|bundle| bundle.kind));
        for kind in kinds {
            if let Some(free) = self.free.get_mut(&kind) {
                *free = free.saturating_sub(1);
            }
        }
    }
}

fn assign(plan: &AllocationPlan, recipient: &Recipient, seats: &Seats) -> Result<Attribution, String> {
    let Some(standard) = plan.standard_bundle(recipient.size_tier) else {
        return Err(format!(
            "no standard bundle for size tier {} in plan {}",
            recipient.size_tier.as_str(),
            plan.plan_id
        ));
    };
    if !seats.available(standard.kind) {
        return Err(format!(
            "standard bundle {} in plan {} is already attributed to {} recipients",
            standard.kind.key(),
            plan.plan_id,
            standard.recipient_count.unwrap_or(0)
        ));
    }

    let preference_bundle = recipient
        .preference_tag
        .and_then(|tag| plan.preference_bundle(tag))
        .filter(|bundle| !bundle.lines.is_empty() && seats.available(bundle.kind))
        .map(|bundle| BundleRef { plan_id: plan.plan_id.clone(), kind: bundle.kind });

    Ok(Attribution {
        recipient_id: recipient.id.clone(),
        plan_id: plan.plan_id.clone(),
        standard_bundle: BundleRef { plan_id: plan.plan_id.clone(), kind: standard.kind },
        preference_bundle,
        fingerprint: recipient.fingerprint(),
    })
}
