//! Batch passes over a response store.
//!
//! Reads happen up front per unit of work; writes are committed in
//! `chunk_size` batches so an aborted run loses at most one batch and can be
//! resumed by running the pass again.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    classify_histories, plan_duplicate_flags, Classification, ClassificationUpdate, DedupError,
    EngineConfig, FlagCandidate, HistoryKey, IntegrityIssue, PointerPolicy, Response, ResponseId,
};

/// Histories loaded per worker before a classification window is processed.
const HISTORIES_PER_WORKER: usize = 64;

/// Read and write interface of the underlying response store.
pub trait ResponseStore {
    /// List the (participant, module) histories matching `selection`, in key order.
    ///
    /// # Errors
    /// Returns [`DedupError::Store`] when the store cannot be read.
    fn history_keys(&self, selection: &HistorySelection) -> Result<Vec<HistoryKey>, DedupError>;

    /// Fetch every response of one history, in any order.
    ///
    /// # Errors
    /// Returns [`DedupError::Store`] when the store cannot be read.
    fn fetch_history(&self, key: &HistoryKey) -> Result<Vec<Response>, DedupError>;

    /// Fetch non-duplicate responses with an external id and digest. With
    /// `since`, only classes touched by rows ingested after that watermark.
    ///
    /// # Errors
    /// Returns [`DedupError::Store`] when the store cannot be read.
    fn fetch_responses_for_flagging(&self, since: Option<i64>)
        -> Result<FlaggingSlice, DedupError>;

    /// Commit one batch atomically: every update, then every redirect.
    ///
    /// # Errors
    /// Returns [`DedupError::Store`] when the batch could not be committed; nothing
    /// of the batch is applied in that case.
    fn apply_batch(&mut self, batch: &WriteBatch) -> Result<BatchOutcome, DedupError>;

    /// Watermark recorded by the last flagging run, if any.
    ///
    /// # Errors
    /// Returns [`DedupError::Store`] when the store cannot be read.
    fn flag_watermark(&self) -> Result<Option<i64>, DedupError>;

    /// Record a completed flagging run.
    ///
    /// # Errors
    /// Returns [`DedupError::Store`] when the run cannot be recorded.
    fn record_flag_run(&mut self, watermark: i64, rows_flagged: usize) -> Result<(), DedupError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "mode", content = "participant_ids", rename_all = "snake_case")]
pub enum ParticipantSelection {
    All,
    Only(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistorySelection {
    pub participants: ParticipantSelection,
    pub module_id: Option<String>,
}

impl HistorySelection {
    #[must_use]
    pub fn all() -> Self {
        Self { participants: ParticipantSelection::All, module_id: None }
    }

    #[must_use]
    pub fn matches(&self, key: &HistoryKey) -> bool {
        let participant_ok = match &self.participants {
            ParticipantSelection::All => true,
            ParticipantSelection::Only(ids) => ids.contains(&key.participant_id),
        };
        participant_ok && self.module_id.as_ref().map_or(true, |module| *module == key.module_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct FlaggingSlice {
    pub candidates: Vec<FlagCandidate>,
    /// Highest ingestion sequence in the store when the slice was read.
    pub high_water_mark: Option<i64>,
}

/// Rows already flagged that pointed at `from` move to `to`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PointerRedirect {
    pub from: ResponseId,
    pub to: ResponseId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct WriteBatch {
    pub updates: Vec<ClassificationUpdate>,
    pub redirects: Vec<PointerRedirect>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct BatchOutcome {
    pub rows_updated: usize,
    pub pointers_redirected: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct FlaggingOptions {
    pub policy: PointerPolicy,
    pub chunk_size: usize,
    pub max_write_attempts: u32,
    pub incremental: bool,
    pub dry_run: bool,
}

impl FlaggingOptions {
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            policy: config.pointer_policy,
            chunk_size: config.chunk_size,
            max_write_attempts: config.max_write_attempts,
            incremental: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct FlaggingSummary {
    pub dry_run: bool,
    pub incremental: bool,
    pub pointer_policy: String,
    pub since_watermark: Option<i64>,
    pub new_watermark: Option<i64>,
    pub candidates_scanned: usize,
    pub candidates_excluded: usize,
    pub classes_examined: usize,
    pub classes_with_duplicates: usize,
    pub rows_flagged: usize,
    pub rows_written: usize,
    pub pointers_redirected: usize,
    pub batches_committed: usize,
    pub batch_retries: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct ClassificationOptions {
    pub dry_run: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct ClassificationSummary {
    pub dry_run: bool,
    pub pointer_policy: String,
    pub histories_processed: usize,
    pub rows_processed: usize,
    pub rows_classified: usize,
    /// Rows whose annotation changed; written unless `dry_run`.
    pub rows_changed: usize,
    pub rows_written: usize,
    pub rows_unchanged: usize,
    pub rows_skipped: usize,
    pub by_classification: BTreeMap<String, usize>,
    pub integrity_issues: Vec<IntegrityIssue>,
    pub batches_committed: usize,
    pub batch_retries: usize,
    /// Per-row results, only collected in verbose mode.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ClassificationUpdate>,
}

/// Run the table-wide duplicate flagger.
///
/// # Errors
/// Returns [`DedupError::Config`] for an invalid chunk size or attempt count, or the
/// store error of a read or of a batch that failed every attempt.
pub fn run_flagging_pass<S: ResponseStore>(
    store: &mut S,
    options: &FlaggingOptions,
) -> Result<FlaggingSummary, DedupError> {
    validate_write_options(options.chunk_size, options.max_write_attempts)?;

    let previous_watermark = store.flag_watermark()?;
    let since = if options.incremental { previous_watermark } else { None };
    let slice = store.fetch_responses_for_flagging(since)?;
    let plan = plan_duplicate_flags(&slice.candidates, options.policy);
    info!(
        candidates = plan.candidates_considered,
        classes = plan.classes_examined,
        flags = plan.flags.len(),
        incremental = options.incremental,
        "planned duplicate flags"
    );

    let mut summary = FlaggingSummary {
        dry_run: options.dry_run,
        incremental: options.incremental,
        pointer_policy: options.policy.as_str().to_string(),
        since_watermark: since,
        new_watermark: previous_watermark,
        candidates_scanned: plan.candidates_considered,
        candidates_excluded: plan.candidates_excluded,
        classes_examined: plan.classes_examined,
        classes_with_duplicates: plan.classes_with_duplicates,
        rows_flagged: plan.flags.len(),
        ..FlaggingSummary::default()
    };

    if options.dry_run {
        return Ok(summary);
    }

    for chunk in plan.flags.chunks(options.chunk_size) {
        let batch = WriteBatch {
            updates: chunk.iter().map(crate::DuplicateFlag::to_update).collect(),
            redirects: match options.policy {
                PointerPolicy::Canonical => chunk
                    .iter()
                    .map(|flag| PointerRedirect { from: flag.response_id, to: flag.canonical })
                    .collect(),
                PointerPolicy::Immediate => Vec::new(),
            },
        };
        let (outcome, retries) = write_with_retry(store, &batch, options.max_write_attempts)?;
        summary.rows_written += outcome.rows_updated;
        summary.pointers_redirected += outcome.pointers_redirected;
        summary.batches_committed += 1;
        summary.batch_retries += retries;
    }

    if let Some(high_water_mark) = slice.high_water_mark {
        if previous_watermark.map_or(true, |previous| high_water_mark > previous) {
            store.record_flag_run(high_water_mark, summary.rows_flagged)?;
            summary.new_watermark = Some(high_water_mark);
        }
    }

    info!(
        rows_written = summary.rows_written,
        pointers_redirected = summary.pointers_redirected,
        batches = summary.batches_committed,
        "duplicate flagging complete"
    );
    Ok(summary)
}

/// Run the participant module history classifier over the selected histories.
///
/// Every selected module must be configured; this is checked before any write.
/// Only rows whose stored annotation differs from the computed one are written.
///
/// # Errors
/// Returns [`DedupError::Config`] for invalid configuration or an unknown module, or
/// the store error of a read or of a batch that failed every attempt.
pub fn run_classification_pass<S: ResponseStore>(
    store: &mut S,
    config: &EngineConfig,
    selection: &HistorySelection,
    options: ClassificationOptions,
) -> Result<ClassificationSummary, DedupError> {
    config.validate()?;
    let keys = store.history_keys(selection)?;
    for key in &keys {
        config.module(&key.module_id)?;
    }
    info!(histories = keys.len(), workers = config.workers, "starting classification pass");

    let mut summary = ClassificationSummary {
        dry_run: options.dry_run,
        pointer_policy: config.pointer_policy.as_str().to_string(),
        by_classification: Classification::ALL
            .iter()
            .map(|classification| (classification.as_str().to_string(), 0))
            .collect(),
        ..ClassificationSummary::default()
    };
    let mut pending: Vec<ClassificationUpdate> = Vec::new();

    for window in keys.chunks(config.workers.saturating_mul(HISTORIES_PER_WORKER).max(1)) {
        let histories = window
            .iter()
            .map(|key| Ok((key.clone(), store.fetch_history(key)?)))
            .collect::<Result<Vec<_>, DedupError>>()?;
        let results = classify_histories(&histories, config)?;

        for ((_, history), result) in histories.iter().zip(results) {
            let stored = history
                .iter()
                .map(|response| (response.response_id, response))
                .collect::<HashMap<_, _>>();

            summary.histories_processed += 1;
            summary.rows_processed += history.len();
            summary.rows_skipped += result.integrity_issues.len();
            for issue in &result.integrity_issues {
                warn!(
                    response_id = %issue.response_id,
                    history = %result.key,
                    problem = %issue.problem,
                    "skipping response with integrity problem"
                );
            }
            summary.integrity_issues.extend(result.integrity_issues);

            for update in result.classified {
                summary.rows_classified += 1;
                *summary
                    .by_classification
                    .entry(update.classification.as_str().to_string())
                    .or_insert(0) += 1;

                let changed =
                    stored.get(&update.response_id).map_or(true, |prior| update.differs_from(prior));
                if options.verbose {
                    summary.results.push(update.clone());
                }
                if changed {
                    summary.rows_changed += 1;
                    pending.push(update);
                } else {
                    summary.rows_unchanged += 1;
                }
            }
        }

        while pending.len() >= config.chunk_size {
            let rest = pending.split_off(config.chunk_size);
            flush_updates(store, config, options, &pending, &mut summary)?;
            pending = rest;
        }
    }

    if !pending.is_empty() {
        flush_updates(store, config, options, &pending, &mut summary)?;
    }

    info!(
        rows_classified = summary.rows_classified,
        rows_written = summary.rows_written,
        rows_skipped = summary.rows_skipped,
        "classification pass complete"
    );
    Ok(summary)
}

fn flush_updates<S: ResponseStore>(
    store: &mut S,
    config: &EngineConfig,
    options: ClassificationOptions,
    updates: &[ClassificationUpdate],
    summary: &mut ClassificationSummary,
) -> Result<(), DedupError> {
    if options.dry_run {
        debug!(rows = updates.len(), "dry run: skipping batch write");
        return Ok(());
    }

    let batch = WriteBatch { updates: updates.to_vec(), redirects: Vec::new() };
    let (outcome, retries) = write_with_retry(store, &batch, config.max_write_attempts)?;
    summary.rows_written += outcome.rows_updated;
    summary.batches_committed += 1;
    summary.batch_retries += retries;
    Ok(())
}

fn write_with_retry<S: ResponseStore>(
    store: &mut S,
    batch: &WriteBatch,
    max_attempts: u32,
) -> Result<(BatchOutcome, usize), DedupError> {
    let mut retries = 0;
    let mut attempt = 1;
    loop {
        match store.apply_batch(batch) {
            Ok(outcome) => {
                debug!(rows = outcome.rows_updated, attempt, "committed batch");
                return Ok((outcome, retries));
            }
            Err(err) if attempt < max_attempts => {
                warn!(error = %err, attempt, max_attempts, "batch write failed; retrying");
                attempt += 1;
                retries += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn validate_write_options(chunk_size: usize, max_write_attempts: u32) -> Result<(), DedupError> {
    if chunk_size == 0 {
        return Err(DedupError::Config("chunk_size MUST be >= 1".to_string()));
    }
    if max_write_attempts == 0 {
        return Err(DedupError::Config("max_write_attempts MUST be >= 1".to_string()));
    }
    Ok(())
}
