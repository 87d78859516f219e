//! Participant module history classification.
//!
//! One history is every response of one participant for one survey module.
//! Responses are ordered by `(authored, ingested_at, response_id)` and walked
//! once; earlier rows may be rewritten when later evidence subsumes them.
//! The result depends only on that ordered sequence and the module config, so
//! re-running over unchanged input yields identical annotations.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    AnswerSet, Classification, ClassificationUpdate, DedupError, EngineConfig, HistoryKey,
    ModuleConfig, PointerPolicy, Response, ResponseId,
};

pub const NO_COMPLETE_SUBMISSION_NOTE: &str = "no complete submission in history";

/// A row that could not be placed in the ordering and was left untouched.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IntegrityIssue {
    pub response_id: ResponseId,
    pub participant_id: String,
    pub module_id: String,
    pub problem: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryClassification {
    pub key: HistoryKey,
    /// Annotations in history order.
    pub classified: Vec<ClassificationUpdate>,
    pub integrity_issues: Vec<IntegrityIssue>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum DuplicateBasis {
    IdenticalResubmission,
    AbsorbedBySuperset,
}

impl DuplicateBasis {
    fn describe(self) -> &'static str {
        match self {
            Self::IdenticalResubmission => "identical answers resubmitted by",
            Self::AbsorbedBySuperset => "answers absorbed by later superset",
        }
    }
}

#[derive(Debug)]
struct Entry<'a> {
    response: &'a Response,
    authored: OffsetDateTime,
    answers: AnswerSet,
    digest: String,
    content: Classification,
    classification: Classification,
    duplicate_of: Option<usize>,
    superseded_by: Option<usize>,
    duplicate_basis: Option<DuplicateBasis>,
    resubmission_of: Option<usize>,
    notes: Vec<String>,
}

impl Entry<'_> {
    fn mark_duplicate(&mut self, of: usize, basis: DuplicateBasis) {
        self.classification = Classification::Duplicate;
        self.duplicate_of = Some(of);
        self.superseded_by = Some(of);
        self.duplicate_basis = Some(basis);
        self.resubmission_of = None;
    }
}

/// Classify every response of one participant/module history.
///
/// Rows with a missing authored time or answer payload, or rows that belong to
/// another history, are reported as [`IntegrityIssue`]s and excluded from the
/// ordering; all remaining rows receive exactly one classification.
#[must_use]
pub fn classify_history(
    key: &HistoryKey,
    history: &[Response],
    module: &ModuleConfig,
    policy: PointerPolicy,
) -> HistoryClassification {
    let (mut entries, integrity_issues) = prepare_entries(key, history, module);
    entries.sort_by(|lhs, rhs| {
        lhs.authored
            .cmp(&rhs.authored)
            .then_with(|| lhs.response.ingested_at.cmp(&rhs.response.ingested_at))
            .then_with(|| lhs.response.response_id.cmp(&rhs.response.response_id))
    });

    let saw_complete = walk(&mut entries);

    if policy == PointerPolicy::Canonical {
        resolve_pointers(&mut entries);
    }

    if !saw_complete {
        if let Some(last) = entries.last_mut() {
            last.notes.push(NO_COMPLETE_SUBMISSION_NOTE.to_string());
        }
    }
    annotate_ambiguous_ordering(&mut entries);

    let classified = entries.iter().map(|entry| to_update(entry, &entries)).collect();
    HistoryClassification { key: key.clone(), classified, integrity_issues }
}

/// Classify several histories, spreading them over `config.workers` threads.
///
/// Results come back in the same order as `histories`.
///
/// # Errors
/// Returns [`DedupError::Config`] when a history's module is not configured, or
/// [`DedupError::Validation`] when a worker thread fails.
pub fn classify_histories(
    histories: &[(HistoryKey, Vec<Response>)],
    config: &EngineConfig,
) -> Result<Vec<HistoryClassification>, DedupError> {
    let classify_part = |part: &[(HistoryKey, Vec<Response>)]| {
        part.iter()
            .map(|(key, history)| {
                let module = config.module(&key.module_id)?;
                Ok(classify_history(key, history, module, config.pointer_policy))
            })
            .collect::<Result<Vec<_>, DedupError>>()
    };

    let workers = config.workers.clamp(1, histories.len().max(1));
    if workers == 1 {
        return classify_part(histories);
    }

    let per_worker = histories.len().div_ceil(workers);
    std::thread::scope(|scope| {
        let handles = histories
            .chunks(per_worker)
            .map(|part| scope.spawn(move || classify_part(part)))
            .collect::<Vec<_>>();

        let mut results = Vec::with_capacity(histories.len());
        for handle in handles {
            let part = handle.join().map_err(|_| {
                DedupError::Validation("classifier worker thread panicked".to_string())
            })??;
            results.extend(part);
        }
        Ok(results)
    })
}

fn prepare_entries<'a>(
    key: &HistoryKey,
    history: &'a [Response],
    module: &ModuleConfig,
) -> (Vec<Entry<'a>>, Vec<IntegrityIssue>) {
    let mut entries = Vec::with_capacity(history.len());
    let mut issues = Vec::new();
    let mut seen_ids = BTreeSet::new();

    for response in history {
        let issue = |problem: String| IntegrityIssue {
            response_id: response.response_id,
            participant_id: response.participant_id.clone(),
            module_id: response.module_id.clone(),
            problem,
        };

        if response.participant_id != key.participant_id || response.module_id != key.module_id {
            issues.push(issue(format!(
                "response belongs to history {}, not {key}",
                response.history_key()
            )));
            continue;
        }
        if !seen_ids.insert(response.response_id) {
            issues.push(issue("response id appears more than once in history".to_string()));
            continue;
        }
        let Some(authored) = response.authored else {
            issues.push(issue("authored time is missing; response cannot be ordered".to_string()));
            continue;
        };
        let Some(answers) = response.answers.as_ref() else {
            issues.push(issue("answer payload is missing".to_string()));
            continue;
        };

        let answers = AnswerSet::from_answers(answers);
        let content = content_classification(&answers, module);
        entries.push(Entry {
            response,
            authored,
            digest: answers.digest(),
            answers,
            content,
            classification: content,
            duplicate_of: None,
            superseded_by: None,
            duplicate_basis: None,
            resubmission_of: None,
            notes: Vec::new(),
        });
    }

    issues.sort_by(|lhs, rhs| lhs.response_id.cmp(&rhs.response_id));
    (entries, issues)
}

fn content_classification(answers: &AnswerSet, module: &ModuleConfig) -> Classification {
    if answers.is_empty() {
        Classification::NoAnswerValues
    } else if answers.codes().any(|code| !module.is_profile_update_code(code)) {
        Classification::Complete
    } else {
        Classification::Partial
    }
}

/// Single forward pass; returns whether any row was ever complete.
fn walk(entries: &mut [Entry<'_>]) -> bool {
    let mut first_seen: BTreeMap<String, usize> = BTreeMap::new();
    let mut latest_seen: BTreeMap<String, usize> = BTreeMap::new();
    let mut saw_complete = false;

    for index in 0..entries.len() {
        let content = entries[index].content;
        if content == Classification::Complete {
            saw_complete = true;
        }
        if content == Classification::NoAnswerValues {
            continue;
        }

        let digest = entries[index].digest.clone();
        if let Some(&latest) = latest_seen.get(&digest) {
            entries[latest].mark_duplicate(index, DuplicateBasis::IdenticalResubmission);

            let first = first_seen.get(&digest).copied().unwrap_or(latest);
            if content == Classification::Complete
                && entries[first].authored != entries[index].authored
            {
                entries[index].classification = Classification::AuthoredTimeUpdated;
                entries[index].resubmission_of = Some(first);
            }
        } else {
            first_seen.insert(digest.clone(), index);
        }
        latest_seen.insert(digest, index);

        if let Some(previous) = index.checked_sub(1) {
            let absorbs_previous = entries[previous].content != Classification::NoAnswerValues
                && entries[index].answers.is_strict_superset_of(&entries[previous].answers);
            if absorbs_previous {
                entries[previous].mark_duplicate(index, DuplicateBasis::AbsorbedBySuperset);
            }
        }
    }

    saw_complete
}

/// Point every duplicate at the end of its chain. Pointers only ever reference
/// later rows, so each walk terminates.
fn resolve_pointers(entries: &mut [Entry<'_>]) {
    for index in 0..entries.len() {
        let Some(mut target) = entries[index].duplicate_of else {
            continue;
        };
        while entries[target].classification == Classification::Duplicate {
            match entries[target].duplicate_of {
                Some(next) if next > target => target = next,
                _ => break,
            }
        }
        entries[index].duplicate_of = Some(target);
    }
}

fn annotate_ambiguous_ordering(entries: &mut [Entry<'_>]) {
    for index in 1..entries.len() {
        let previous = index - 1;
        if entries[previous].authored == entries[index].authored
            && entries[previous].classification != entries[index].classification
        {
            let previous_id = entries[previous].response.response_id;
            let current_id = entries[index].response.response_id;
            entries[previous]
                .notes
                .push(format!("indeterminate ordering: authored time shared with {current_id}"));
            entries[index]
                .notes
                .push(format!("indeterminate ordering: authored time shared with {previous_id}"));
        }
    }
}

fn to_update(entry: &Entry<'_>, entries: &[Entry<'_>]) -> ClassificationUpdate {
    let id_at = |index: usize| entries[index].response.response_id;

    let mut parts = vec![match (entry.classification, entry.duplicate_basis) {
        (Classification::Duplicate, Some(basis)) => {
            let mut text = basis.describe().to_string();
            if let Some(immediate) = entry.superseded_by {
                text.push_str(&format!(" {}", id_at(immediate)));
            }
            if let Some(target) =
                entry.duplicate_of.filter(|target| Some(*target) != entry.superseded_by)
            {
                text.push_str(&format!(", resolved to {}", id_at(target)));
            }
            text
        }
        (Classification::AuthoredTimeUpdated, _) => format!(
            "identical answers resubmitted with revised authored time; first seen as {}",
            entry.resubmission_of.map_or_else(String::new, |index| id_at(index).to_string())
        ),
        (Classification::Complete, _) => "answers include non-profile question codes".to_string(),
        (Classification::Partial, _) => "only profile-update question codes answered".to_string(),
        (Classification::NoAnswerValues, _) => "no answer values".to_string(),
        (Classification::Duplicate, None) => "duplicate".to_string(),
    }];
    parts.extend(entry.notes.iter().cloned());

    ClassificationUpdate {
        response_id: entry.response.response_id,
        classification: entry.classification,
        duplicate_of: entry.duplicate_of.map(id_at),
        reason: parts.join("; "),
    }
}
