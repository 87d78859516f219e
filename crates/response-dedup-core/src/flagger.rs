//! Table-wide verbatim duplicate detection.
//!
//! Responses sharing an `(external_id, content_digest)` class are verbatim
//! repeats regardless of survey module. Every member but the most recently
//! ingested one is flagged as a duplicate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{Classification, ClassificationUpdate, PointerPolicy, ResponseId};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FlagCandidate {
    pub response_id: ResponseId,
    pub external_id: String,
    pub content_digest: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ingested_at: OffsetDateTime,
    pub classification: Option<Classification>,
}

impl FlagCandidate {
    fn is_eligible(&self) -> bool {
        !self.external_id.trim().is_empty()
            && !self.content_digest.trim().is_empty()
            && self.classification != Some(Classification::Duplicate)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DuplicateFlag {
    pub response_id: ResponseId,
    pub duplicate_of: ResponseId,
    /// Last member of the class; equal to `duplicate_of` under the canonical policy.
    pub canonical: ResponseId,
    pub reason: String,
}

impl DuplicateFlag {
    #[must_use]
    pub fn to_update(&self) -> ClassificationUpdate {
        ClassificationUpdate {
            response_id: self.response_id,
            classification: Classification::Duplicate,
            duplicate_of: Some(self.duplicate_of),
            reason: self.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct FlagPlan {
    pub candidates_considered: usize,
    pub candidates_excluded: usize,
    pub classes_examined: usize,
    pub classes_with_duplicates: usize,
    pub flags: Vec<DuplicateFlag>,
}

/// Decide which candidates become duplicates and where their pointers go.
///
/// Candidates with a blank external id or digest, and candidates already
/// flagged as duplicates, never take part. A member is flagged only when the
/// class holds a row ingested strictly later; members sharing the latest
/// `ingested_at` all stay unflagged. The canonical row is the last member in
/// `(ingested_at, response_id)` order.
#[must_use]
pub fn plan_duplicate_flags(candidates: &[FlagCandidate], policy: PointerPolicy) -> FlagPlan {
    let mut classes: BTreeMap<(&str, &str), Vec<&FlagCandidate>> = BTreeMap::new();
    let mut plan = FlagPlan { candidates_considered: candidates.len(), ..FlagPlan::default() };

    for candidate in candidates {
        if !candidate.is_eligible() {
            plan.candidates_excluded += 1;
            continue;
        }
        classes
            .entry((candidate.external_id.as_str(), candidate.content_digest.as_str()))
            .or_default()
            .push(candidate);
    }

    plan.classes_examined = classes.len();
    for ((external_id, _), mut members) in classes {
        members.sort_by(|lhs, rhs| {
            lhs.ingested_at
                .cmp(&rhs.ingested_at)
                .then_with(|| lhs.response_id.cmp(&rhs.response_id))
        });
        members.dedup_by_key(|member| member.response_id);

        let Some(&canonical) = members.last() else {
            continue;
        };
        let before = plan.flags.len();

        for (index, member) in members.iter().enumerate() {
            // Rows ingested at the same instant are never ordered against each other.
            let Some(&successor) =
                members[index + 1..].iter().find(|later| later.ingested_at > member.ingested_at)
            else {
                break;
            };
            let duplicate_of = match policy {
                PointerPolicy::Canonical => canonical.response_id,
                PointerPolicy::Immediate => successor.response_id,
            };
            plan.flags.push(DuplicateFlag {
                response_id: member.response_id,
                duplicate_of,
                canonical: canonical.response_id,
                reason: format!(
                    "verbatim repeat of external_id {external_id} resubmitted as {}",
                    successor.response_id
                ),
            });
        }

        if plan.flags.len() > before {
            plan.classes_with_duplicates += 1;
        }
    }

    plan
}
