use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

mod config;
mod digest;
mod flagger;
mod history;
mod pass;

pub use config::{EngineConfig, ModuleConfig, MAX_WORKERS};
pub use digest::{content_digest, is_well_formed_digest, AnswerSet, DIGEST_PREFIX};
pub use flagger::{plan_duplicate_flags, DuplicateFlag, FlagCandidate, FlagPlan};
pub use history::{
    classify_histories, classify_history, HistoryClassification, IntegrityIssue,
    NO_COMPLETE_SUBMISSION_NOTE,
};
pub use pass::{
    run_classification_pass, run_flagging_pass, BatchOutcome, ClassificationOptions,
    ClassificationSummary, FlaggingOptions, FlaggingSlice, FlaggingSummary, HistorySelection,
    ParticipantSelection, PointerRedirect, ResponseStore, WriteBatch,
};

/// Question code to raw answer value, as received from the survey source.
pub type Answers = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DedupError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("integrity error: {0}")]
    Integrity(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ResponseId(pub Ulid);

impl ResponseId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a response identifier from its ULID text form.
    ///
    /// # Errors
    /// Returns [`DedupError::Validation`] when `value` is not a valid ULID.
    pub fn parse(value: &str) -> Result<Self, DedupError> {
        Ulid::from_string(value.trim())
            .map(Self)
            .map_err(|err| DedupError::Validation(format!("invalid response id {value}: {err}")))
    }
}

impl Default for ResponseId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ResponseId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Complete,
    Partial,
    Duplicate,
    NoAnswerValues,
    AuthoredTimeUpdated,
}

impl Classification {
    pub const ALL: [Self; 5] = [
        Self::Complete,
        Self::Partial,
        Self::Duplicate,
        Self::NoAnswerValues,
        Self::AuthoredTimeUpdated,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Duplicate => "duplicate",
            Self::NoAnswerValues => "no_answer_values",
            Self::AuthoredTimeUpdated => "authored_time_updated",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "complete" => Some(Self::Complete),
            "partial" => Some(Self::Partial),
            "duplicate" => Some(Self::Duplicate),
            "no_answer_values" => Some(Self::NoAnswerValues),
            "authored_time_updated" => Some(Self::AuthoredTimeUpdated),
            _ => None,
        }
    }
}

/// Where a `duplicate_of` pointer lands when duplicates form a chain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PointerPolicy {
    /// Follow the chain and point at the final non-duplicate row.
    #[default]
    Canonical,
    /// Point at the nearest later row; readers walk the chain themselves.
    Immediate,
}

impl PointerPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Canonical => "canonical",
            Self::Immediate => "immediate",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "canonical" => Some(Self::Canonical),
            "immediate" => Some(Self::Immediate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HistoryKey {
    pub participant_id: String,
    pub module_id: String,
}

impl HistoryKey {
    #[must_use]
    pub fn new(participant_id: impl Into<String>, module_id: impl Into<String>) -> Self {
        Self { participant_id: participant_id.into(), module_id: module_id.into() }
    }
}

impl Display for HistoryKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.participant_id, self.module_id)
    }
}

/// One received survey submission together with its current annotation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub response_id: ResponseId,
    pub participant_id: String,
    pub module_id: String,
    pub external_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub authored: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub ingested_at: OffsetDateTime,
    pub answers: Option<Answers>,
    pub content_digest: Option<String>,
    pub classification: Option<Classification>,
    pub duplicate_of: Option<ResponseId>,
    pub reason: Option<String>,
}

impl Response {
    #[must_use]
    pub fn history_key(&self) -> HistoryKey {
        HistoryKey::new(self.participant_id.clone(), self.module_id.clone())
    }
}

/// The full annotation written for one response in a single atomic update.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ClassificationUpdate {
    pub response_id: ResponseId,
    pub classification: Classification,
    pub duplicate_of: Option<ResponseId>,
    pub reason: String,
}

impl ClassificationUpdate {
    /// True when writing this update would change the stored annotation.
    #[must_use]
    pub fn differs_from(&self, response: &Response) -> bool {
        response.classification != Some(self.classification)
            || response.duplicate_of != self.duplicate_of
            || response.reason.as_deref() != Some(self.reason.as_str())
    }

    /// Copy the annotation onto an in-memory response.
    pub fn apply_to(&self, response: &mut Response) {
        response.classification = Some(self.classification);
        response.duplicate_of = self.duplicate_of;
        response.reason = Some(self.reason.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_names_round_trip() {
        for classification in Classification::ALL {
            assert_eq!(Classification::parse(classification.as_str()), Some(classification));
        }
        assert_eq!(Classification::parse("COMPLETE"), None);
    }

    #[test]
    fn classification_serializes_as_snake_case() {
        let json = match serde_json::to_string(&Classification::AuthoredTimeUpdated) {
            Ok(json) => json,
            Err(err) => panic!("classification should serialize: {err}"),
        };
        assert_eq!(json, "\"authored_time_updated\"");
    }

    #[test]
    fn response_id_parse_rejects_garbage() {
        let err = match ResponseId::parse("not-a-ulid") {
            Ok(id) => panic!("expected parse failure, got {id}"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("invalid response id"));
    }

    #[test]
    fn update_differs_from_unannotated_response() {
        let response = Response {
            response_id: ResponseId(Ulid::from_parts(1_700_000_000_000, 1)),
            participant_id: "p-1".to_string(),
            module_id: "baseline".to_string(),
            external_id: None,
            authored: None,
            ingested_at: OffsetDateTime::UNIX_EPOCH,
            answers: None,
            content_digest: None,
            classification: None,
            duplicate_of: None,
            reason: None,
        };
        let update = ClassificationUpdate {
            response_id: response.response_id,
            classification: Classification::Complete,
            duplicate_of: None,
            reason: "answers include non-profile question codes".to_string(),
        };
        assert!(update.differs_from(&response));

        let mut annotated = response;
        update.apply_to(&mut annotated);
        assert!(!update.differs_from(&annotated));
    }
}
