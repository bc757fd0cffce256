//! Execution controller: drives submissions through generate/execute rounds.

mod lookup;

pub use lookup::{LookupConfig, LookupTask};

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backends::{
    BackendError, BackendResult, LockRegistry, OutputAdapterOracle, ProcessChainRegistry,
    ResultMap, ServiceRegistry, SignalBus, SubmissionRegistry, topics,
};
use crate::compiler::{CompileError, Compiler};
use crate::id::IdGenerator;
use crate::model::{ProcessChain, ProcessChainStatus, Submission, SubmissionStatus};

const MAX_TRANSIENT_RETRIES: u32 = 3;
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(100);

/// Raised when a submission loop cannot make progress.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("invalid execution state: {0}")]
    State(#[from] serde_json::Error),
    #[error("submission loop cancelled")]
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub tmp_path: String,
    pub out_path: String,
    /// Poll interval while awaiting process-chain terminals.
    pub lookup_interval: Duration,
    /// Acquisition timeout for the per-submission lease.
    pub lock_timeout: Duration,
}

impl ControllerConfig {
    pub fn new(tmp_path: impl Into<String>, out_path: impl Into<String>) -> Self {
        Self {
            tmp_path: tmp_path.into(),
            out_path: out_path.into(),
            lookup_interval: Duration::from_millis(2000),
            lock_timeout: Duration::from_millis(1000),
        }
    }
}

struct SubmissionOutcome {
    status: SubmissionStatus,
    results: ResultMap,
}

/// Long-running driver owning the per-submission generate/execute loops.
///
/// One controller serves many submissions concurrently; each submission loop
/// holds its own compiler and the exclusive lease for its submission.
pub struct Controller {
    submissions: Arc<dyn SubmissionRegistry>,
    process_chains: Arc<dyn ProcessChainRegistry>,
    services: Arc<dyn ServiceRegistry>,
    adapters: Arc<dyn OutputAdapterOracle>,
    locks: Arc<dyn LockRegistry>,
    signals: Arc<dyn SignalBus>,
    id_generator: Arc<dyn IdGenerator>,
    config: ControllerConfig,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        submissions: Arc<dyn SubmissionRegistry>,
        process_chains: Arc<dyn ProcessChainRegistry>,
        services: Arc<dyn ServiceRegistry>,
        adapters: Arc<dyn OutputAdapterOracle>,
        locks: Arc<dyn LockRegistry>,
        signals: Arc<dyn SignalBus>,
        id_generator: Arc<dyn IdGenerator>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            submissions,
            process_chains,
            services,
            adapters,
            locks,
            signals,
            id_generator,
            config,
        }
    }

    /// Atomically claim the next ACCEPTED submission, transitioning it to
    /// RUNNING.
    pub async fn claim_next_submission(&self) -> BackendResult<Option<Submission>> {
        self.submissions
            .fetch_next_submission(SubmissionStatus::Accepted, SubmissionStatus::Running)
            .await
    }

    /// Drive one submission to a terminal status, tolerating restarts.
    ///
    /// Acquires the submission lease first; if another worker holds it the
    /// call returns without touching anything. Any failure inside the loop
    /// marks the submission ERROR; cancellation leaves the persisted state
    /// in place for recovery.
    pub async fn handle_submission(
        self: Arc<Self>,
        submission: Submission,
        shutdown: CancellationToken,
    ) {
        let submission_id = submission.id.clone();
        let lease_name = format!("submissions.{submission_id}");
        let lease = match self.locks.try_lock(&lease_name, self.config.lock_timeout).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!(submission_id = %submission_id, "submission owned by another worker");
                return;
            }
            Err(err) => {
                error!(submission_id = %submission_id, error = %err, "lease acquisition failed");
                return;
            }
        };

        let outcome = self.run_locked(&submission, &shutdown).await;
        match outcome {
            Ok(outcome) => {
                info!(
                    submission_id = %submission_id,
                    status = %outcome.status,
                    "submission finished"
                );
                if !outcome.results.is_empty() {
                    self.record(
                        &submission_id,
                        "results",
                        self.submissions
                            .set_submission_results(&submission_id, Some(outcome.results)),
                    )
                    .await;
                }
                self.finish(&submission_id, outcome.status).await;
            }
            Err(ControllerError::Cancelled) => {
                info!(
                    submission_id = %submission_id,
                    "submission loop cancelled; state kept for recovery"
                );
            }
            Err(err) => {
                error!(submission_id = %submission_id, error = %err, "submission failed");
                self.finish(&submission_id, SubmissionStatus::Error).await;
            }
        }
        lease.release().await;
    }

    /// Record the terminal status, the end time, and drop the checkpoint.
    async fn finish(&self, submission_id: &str, status: SubmissionStatus) {
        self.record(
            submission_id,
            "status",
            self.submissions.set_submission_status(submission_id, status),
        )
        .await;
        self.record(
            submission_id,
            "end time",
            self.submissions
                .set_submission_end_time(submission_id, Utc::now()),
        )
        .await;
        self.record(
            submission_id,
            "execution state",
            self.submissions.set_execution_state(submission_id, None),
        )
        .await;
    }

    async fn record(
        &self,
        submission_id: &str,
        what: &str,
        operation: impl Future<Output = BackendResult<()>>,
    ) {
        if let Err(err) = operation.await {
            error!(
                submission_id = %submission_id,
                error = %err,
                "failed to record submission {what}"
            );
        }
    }

    async fn run_locked(
        &self,
        submission: &Submission,
        shutdown: &CancellationToken,
    ) -> Result<SubmissionOutcome, ControllerError> {
        if submission.start_time.is_none() {
            self.submissions
                .set_submission_start_time(&submission.id, Utc::now())
                .await?;
        }

        let services = self.services.find_services().await?;
        let mut compiler = Compiler::new(
            submission.workflow.clone(),
            self.config.tmp_path.clone(),
            self.config.out_path.clone(),
            services,
            Arc::clone(&self.adapters),
            Arc::clone(&self.id_generator),
        );

        // A persisted checkpoint means a previous worker died mid-run; the
        // stored process chains become the first batch to await.
        let mut recovered_batch: Option<Vec<ProcessChain>> = None;
        if let Some(state) = self.submissions.get_execution_state(&submission.id).await? {
            compiler.load_state(state)?;
            let chains = self
                .process_chains
                .find_process_chains_by_submission_id(&submission.id)
                .await?;
            for chain in &chains {
                let status = self.process_chains.get_process_chain_status(&chain.id).await?;
                if matches!(
                    status,
                    ProcessChainStatus::Running | ProcessChainStatus::Error
                ) {
                    self.process_chains
                        .set_process_chain_status(&chain.id, ProcessChainStatus::Registered)
                        .await?;
                    self.process_chains
                        .set_process_chain_error_message(&chain.id, None)
                        .await?;
                }
            }
            if !chains.is_empty() {
                info!(
                    submission_id = %submission.id,
                    chains = chains.len(),
                    "resuming submission from checkpoint"
                );
                recovered_batch = Some(chains);
            }
        }

        let mut round_results: ResultMap = ResultMap::new();
        let mut accumulated: ResultMap = ResultMap::new();
        let mut total_chains = 0usize;
        let mut errors = 0usize;

        loop {
            if shutdown.is_cancelled() {
                return Err(ControllerError::Cancelled);
            }
            let batch = match recovered_batch.take() {
                Some(batch) => batch,
                None => {
                    let chains = compiler.generate(&round_results)?;
                    if chains.is_empty() {
                        break;
                    }
                    retry_transient(|| {
                        self.process_chains.add_process_chains(
                            &chains,
                            &submission.id,
                            ProcessChainStatus::Registered,
                        )
                    })
                    .await?;
                    retry_transient(|| {
                        self.submissions
                            .set_execution_state(&submission.id, Some(compiler.save_state()))
                    })
                    .await?;
                    chains
                }
            };
            self.signals.publish(topics::PROCESS_CHAINS_ADDED).await;

            total_chains += batch.len();
            let (results, batch_errors) = self
                .await_process_chains(&submission.id, &batch, shutdown)
                .await?;
            errors += batch_errors;
            for (variable_id, values) in &results {
                accumulated.insert(variable_id.clone(), values.clone());
            }
            round_results = results;
        }

        let status = if compiler.is_finished() {
            if errors == 0 {
                SubmissionStatus::Success
            } else if errors == total_chains {
                SubmissionStatus::Error
            } else {
                SubmissionStatus::PartialSuccess
            }
        } else {
            warn!(submission_id = %submission.id, "submission not executed completely");
            SubmissionStatus::Error
        };
        Ok(SubmissionOutcome {
            status,
            results: accumulated,
        })
    }

    /// Poll until every chain in the batch reaches a terminal status,
    /// merging SUCCESS results and counting ERRORs.
    async fn await_process_chains(
        &self,
        submission_id: &str,
        batch: &[ProcessChain],
        shutdown: &CancellationToken,
    ) -> Result<(ResultMap, usize), ControllerError> {
        let mut pending: HashSet<String> = batch.iter().map(|chain| chain.id.clone()).collect();
        let mut results = ResultMap::new();
        let mut errors = 0usize;

        while !pending.is_empty() {
            let statuses = retry_transient(|| {
                self.process_chains
                    .find_process_chain_statuses_by_submission_id(submission_id)
            })
            .await?;
            let mut still_pending: HashSet<String> = HashSet::new();
            for id in pending {
                match statuses.get(&id) {
                    Some(ProcessChainStatus::Success) => {
                        if let Some(chain_results) =
                            self.process_chains.get_process_chain_results(&id).await?
                        {
                            results.extend(chain_results);
                        }
                    }
                    Some(ProcessChainStatus::Error) => {
                        errors += 1;
                        let message = self
                            .process_chains
                            .get_process_chain_error_message(&id)
                            .await?;
                        warn!(
                            process_chain_id = %id,
                            error = ?message,
                            "process chain failed"
                        );
                    }
                    _ => {
                        still_pending.insert(id);
                    }
                }
            }
            pending = still_pending;
            if pending.is_empty() {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Err(ControllerError::Cancelled),
                _ = tokio::time::sleep(self.config.lookup_interval) => {}
            }
        }
        Ok((results, errors))
    }

    /// Find RUNNING submissions nobody owns and restart their loops.
    ///
    /// The probe lease is released before the relaunched loop re-acquires
    /// it; the loop itself never mutates anything without the lease.
    pub async fn recover_orphans(self: &Arc<Self>, shutdown: &CancellationToken) {
        let ids = match self
            .submissions
            .find_submission_ids_by_status(SubmissionStatus::Running)
            .await
        {
            Ok(ids) => ids,
            Err(err) => {
                error!(error = %err, "orphan scan failed");
                return;
            }
        };
        for id in ids {
            let lease_name = format!("submissions.{id}");
            match self.locks.try_lock(&lease_name, self.config.lock_timeout).await {
                Ok(Some(lease)) => {
                    lease.release().await;
                    let submission = match self.submissions.find_submission_by_id(&id).await {
                        Ok(submission) => submission,
                        Err(err) => {
                            error!(submission_id = %id, error = %err, "orphan fetch failed");
                            continue;
                        }
                    };
                    info!(submission_id = %id, "recovering orphaned submission");
                    tokio::spawn(
                        Arc::clone(self).handle_submission(submission, shutdown.child_token()),
                    );
                }
                Ok(None) => {
                    debug!(submission_id = %id, "running submission is owned, skipping");
                }
                Err(err) => {
                    error!(submission_id = %id, error = %err, "orphan lease probe failed");
                }
            }
        }
    }
}

/// Retry an operation on transient registry errors with exponential backoff.
async fn retry_transient<T, F, Fut>(mut operation: F) -> BackendResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BackendResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Err(BackendError::Transient(message)) if attempt < MAX_TRANSIENT_RETRIES => {
                attempt += 1;
                warn!(error = %message, attempt, "transient registry error, retrying");
                tokio::time::sleep(TRANSIENT_BACKOFF * 2u32.pow(attempt - 1)).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[tokio::test]
    async fn retry_transient_retries_then_succeeds() {
        let attempts = Mutex::new(0u32);
        let attempts = &attempts;
        let value = retry_transient(move || async move {
            let mut attempts = attempts.lock().expect("counter poisoned");
            *attempts += 1;
            if *attempts < 3 {
                Err(BackendError::Transient("registry flake".to_string()))
            } else {
                Ok(*attempts)
            }
        })
        .await
        .expect("eventual success");
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn retry_transient_escalates_after_limit() {
        let error = retry_transient::<(), _, _>(|| async {
            Err(BackendError::Transient("registry down".to_string()))
        })
        .await
        .expect_err("exhausted retries");
        assert!(matches!(error, BackendError::Transient(_)));
    }

    #[tokio::test]
    async fn retry_transient_passes_through_other_errors() {
        let error = retry_transient::<(), _, _>(|| async {
            Err(BackendError::NotFound("submission x".to_string()))
        })
        .await
        .expect_err("not retried");
        assert!(matches!(error, BackendError::NotFound(_)));
    }
}
