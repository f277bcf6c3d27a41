//! Chunked Mutator
//!
//! Splits a keyed operation list into protocol-legal chunks and drives each
//! chunk through the rate governor and retry classifier. The report accounts
//! for every input key exactly once: succeeded, failed, or (when the stream
//! was cancelled before dispatch) deferred.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use metrics::counter;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::MutatorConfig;
use crate::governor::RateGovernor;
use crate::remote::{Operation, RemoteApi, RemoteError, RemoteOperation};
use crate::retry::{ErrorKind, RetryClassifier, RetryDecision, classify};

/// One logical operation tied to the caller's item key. Keys must be unique
/// within a single `execute` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedOperation {
    pub key: String,
    pub operation: Operation,
}

impl KeyedOperation {
    pub fn new<S: Into<String>>(key: S, operation: Operation) -> Self {
        Self {
            key: key.into(),
            operation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationFailure {
    /// Remote error text, verbatim
    pub error: String,
    pub kind: ErrorKind,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MutationReport {
    /// key -> remote resource reference
    pub succeeded: BTreeMap<String, String>,
    pub failed: BTreeMap<String, MutationFailure>,
    /// Keys never dispatched because the stream was cancelled
    pub deferred: Vec<String>,
}

impl MutationReport {
    pub fn len(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.deferred.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fail_all(&mut self, chunk: Vec<KeyedOperation>, error: &RemoteError, kind: ErrorKind) {
        for op in chunk {
            self.failed.insert(
                op.key,
                MutationFailure {
                    error: error.message.clone(),
                    kind,
                },
            );
        }
    }

    fn defer_all(&mut self, chunk: Vec<KeyedOperation>) {
        self.deferred.extend(chunk.into_iter().map(|op| op.key));
    }
}

#[derive(Clone)]
pub struct ChunkedMutator {
    remote: Arc<dyn RemoteApi>,
    classifier: RetryClassifier,
    config: MutatorConfig,
}

impl ChunkedMutator {
    pub fn new(remote: Arc<dyn RemoteApi>, classifier: RetryClassifier, config: MutatorConfig) -> Self {
        Self {
            remote,
            classifier,
            config,
        }
    }

    pub fn default_chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    /// Executes `operations` for one account in chunks of at most
    /// `chunk_size` (clamped to the protocol maximum).
    ///
    /// Chunks already in flight when `cancel` fires run to completion;
    /// chunks not yet dispatched are reported as deferred.
    #[instrument(skip_all, fields(account = %account, operations = operations.len()))]
    pub async fn execute(
        &self,
        account: &str,
        operations: Vec<KeyedOperation>,
        chunk_size: usize,
        governor: &RateGovernor,
        cancel: &CancellationToken,
    ) -> MutationReport {
        let mut report = MutationReport::default();
        if operations.is_empty() {
            return report;
        }

        let operations = dedupe_keys(operations);
        let expected = operations.len();
        let mut queue: VecDeque<Vec<KeyedOperation>> = self.split(operations, chunk_size).into();
        debug!(chunks = queue.len(), "Split operations into chunks");

        while let Some(chunk) = queue.pop_front() {
            if cancel.is_cancelled() {
                report.defer_all(chunk);
                while let Some(rest) = queue.pop_front() {
                    report.defer_all(rest);
                }
                break;
            }

            governor.wait().await;
            self.run_chunk(account, chunk, governor, cancel, &mut report, &mut queue)
                .await;
        }

        debug_assert_eq!(report.len(), expected);
        counter!("mutator_operations_total", "outcome" => "succeeded")
            .increment(report.succeeded.len() as u64);
        counter!("mutator_operations_total", "outcome" => "failed")
            .increment(report.failed.len() as u64);
        if !report.deferred.is_empty() {
            counter!("mutator_operations_total", "outcome" => "deferred")
                .increment(report.deferred.len() as u64);
        }
        report
    }

    /// Greedy split honouring the operation count and the byte ceiling.
    fn split(&self, operations: Vec<KeyedOperation>, chunk_size: usize) -> Vec<Vec<KeyedOperation>> {
        let max_ops = chunk_size.clamp(1, self.config.max_operations_per_request);
        let max_bytes = self.config.max_request_bytes;

        let mut chunks = Vec::new();
        let mut current = Vec::new();
        let mut current_bytes = 0usize;

        for op in operations {
            let size = estimated_size(&op);
            if !current.is_empty() && (current.len() >= max_ops || current_bytes + size > max_bytes)
            {
                chunks.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            current_bytes += size;
            current.push(op);
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }

    async fn run_chunk(
        &self,
        account: &str,
        mut chunk: Vec<KeyedOperation>,
        governor: &RateGovernor,
        cancel: &CancellationToken,
        report: &mut MutationReport,
        queue: &mut VecDeque<Vec<KeyedOperation>>,
    ) {
        let mut attempt = 1;
        loop {
            let request: Vec<RemoteOperation> = chunk
                .iter()
                .map(|op| RemoteOperation::new(op.key.clone(), op.operation.clone()))
                .collect();
            counter!("mutator_chunks_total").increment(1);

            let err = match self.remote.mutate(account, &request).await {
                Ok(results) => {
                    governor.on_success();
                    reconcile(chunk, results, report);
                    return;
                }
                Err(err) => err,
            };

            let kind = classify(&err);
            governor.on_error(kind);

            match self.classifier.decide(&err, attempt, chunk.len()) {
                RetryDecision::ShrinkAndRetry => {
                    let right = chunk.split_off(chunk.len() / 2);
                    warn!(
                        chunk_len = chunk.len() + right.len(),
                        error = %err,
                        "Request too large; resubmitting as two halves"
                    );
                    counter!("mutator_chunk_shrinks_total").increment(1);
                    queue.push_front(right);
                    queue.push_front(chunk);
                    return;
                }
                RetryDecision::FailNow => {
                    warn!(
                        chunk_len = chunk.len(),
                        attempt,
                        kind = kind.as_str(),
                        error = %err,
                        "Chunk failed; recording its operations as failed"
                    );
                    report.fail_all(chunk, &err, kind);
                    return;
                }
                decision => {
                    let delay = decision.delay().unwrap_or_default();
                    warn!(
                        chunk_len = chunk.len(),
                        attempt,
                        kind = kind.as_str(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Chunk failed; retrying after backoff"
                    );
                    counter!("mutator_chunk_retries_total", "kind" => kind.as_str()).increment(1);

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            // Rejected calls apply nothing, so the chunk can wait for resume.
                            report.defer_all(chunk);
                            return;
                        }
                        _ = sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// Attributes per-operation results by echoed id, never by position.
fn reconcile(
    chunk: Vec<KeyedOperation>,
    results: Vec<crate::remote::OperationResult>,
    report: &mut MutationReport,
) {
    let mut by_id: HashMap<String, Result<String, RemoteError>> = results
        .into_iter()
        .map(|result| (result.id, result.outcome))
        .collect();

    for op in chunk {
        match by_id.remove(&op.key) {
            Some(Ok(resource)) => {
                report.succeeded.insert(op.key, resource);
            }
            Some(Err(err)) => {
                let kind = classify(&err);
                report.failed.insert(
                    op.key,
                    MutationFailure {
                        error: err.message,
                        kind,
                    },
                );
            }
            None => {
                report.failed.insert(
                    op.key,
                    MutationFailure {
                        error: "remote returned no result for this operation".to_string(),
                        kind: ErrorKind::Permanent,
                    },
                );
            }
        }
    }

    if !by_id.is_empty() {
        warn!(
            unknown = by_id.len(),
            "Remote returned results for operations that were not submitted"
        );
    }
}

fn dedupe_keys(operations: Vec<KeyedOperation>) -> Vec<KeyedOperation> {
    let mut seen = HashSet::with_capacity(operations.len());
    let before = operations.len();
    let unique: Vec<_> = operations
        .into_iter()
        .filter(|op| seen.insert(op.key.clone()))
        .collect();
    if unique.len() != before {
        warn!(
            dropped = before - unique.len(),
            "Duplicate operation keys dropped before submission"
        );
    }
    unique
}

fn estimated_size(op: &KeyedOperation) -> usize {
    serde_json::to_vec(&op.operation)
        .map(|bytes| bytes.len() + op.key.len())
        .unwrap_or(0)
}
