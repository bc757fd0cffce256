//! Registry contracts the core depends on.
//!
//! The compiler and controller only see these traits; concrete persistence
//! lives behind them. [`MemoryBackend`] implements the full set for tests
//! and local runs.

mod memory;

pub use memory::MemoryBackend;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::model::{
    ProcessChain, ProcessChainStatus, ServiceMetadata, Submission, SubmissionStatus,
};

/// The common registry error.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{0}")]
    Message(String),

    #[error("entity not found: {0}")]
    NotFound(String),

    /// Retryable I/O failure; the controller retries with backoff before
    /// escalating.
    #[error("transient registry error: {0}")]
    Transient(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Utility type alias for registry results.
pub type BackendResult<T> = Result<T, BackendError>;

/// Per-variable result values of an executed process chain.
pub type ResultMap = HashMap<String, Vec<Value>>;

/// Persistent store of submissions and their checkpointed execution state.
#[async_trait::async_trait]
pub trait SubmissionRegistry: Send + Sync {
    /// Atomically pop the oldest submission in `from` and transition it to
    /// `to`. The returned submission already carries the new status.
    async fn fetch_next_submission(
        &self,
        from: SubmissionStatus,
        to: SubmissionStatus,
    ) -> BackendResult<Option<Submission>>;
    async fn find_submission_by_id(&self, submission_id: &str) -> BackendResult<Submission>;
    async fn find_submission_ids_by_status(
        &self,
        status: SubmissionStatus,
    ) -> BackendResult<Vec<String>>;
    async fn get_submission_status(&self, submission_id: &str)
    -> BackendResult<SubmissionStatus>;
    async fn set_submission_status(
        &self,
        submission_id: &str,
        status: SubmissionStatus,
    ) -> BackendResult<()>;
    async fn set_submission_start_time(
        &self,
        submission_id: &str,
        start_time: DateTime<Utc>,
    ) -> BackendResult<()>;
    async fn set_submission_end_time(
        &self,
        submission_id: &str,
        end_time: DateTime<Utc>,
    ) -> BackendResult<()>;
    /// Checkpointed compiler state, or `None` once the submission completes.
    async fn get_execution_state(&self, submission_id: &str) -> BackendResult<Option<Value>>;
    async fn set_execution_state(
        &self,
        submission_id: &str,
        state: Option<Value>,
    ) -> BackendResult<()>;
    async fn set_submission_results(
        &self,
        submission_id: &str,
        results: Option<ResultMap>,
    ) -> BackendResult<()>;
}

/// Persistent store of process chains, their statuses and results.
#[async_trait::async_trait]
pub trait ProcessChainRegistry: Send + Sync {
    async fn add_process_chains(
        &self,
        chains: &[ProcessChain],
        submission_id: &str,
        status: ProcessChainStatus,
    ) -> BackendResult<()>;
    async fn find_process_chains_by_submission_id(
        &self,
        submission_id: &str,
    ) -> BackendResult<Vec<ProcessChain>>;
    async fn find_process_chain_statuses_by_submission_id(
        &self,
        submission_id: &str,
    ) -> BackendResult<HashMap<String, ProcessChainStatus>>;
    async fn count_process_chains_by_status(
        &self,
        submission_id: &str,
        status: ProcessChainStatus,
    ) -> BackendResult<usize>;
    async fn get_process_chain_status(
        &self,
        process_chain_id: &str,
    ) -> BackendResult<ProcessChainStatus>;
    async fn set_process_chain_status(
        &self,
        process_chain_id: &str,
        status: ProcessChainStatus,
    ) -> BackendResult<()>;
    async fn get_process_chain_results(
        &self,
        process_chain_id: &str,
    ) -> BackendResult<Option<ResultMap>>;
    async fn get_process_chain_error_message(
        &self,
        process_chain_id: &str,
    ) -> BackendResult<Option<String>>;
    async fn set_process_chain_error_message(
        &self,
        process_chain_id: &str,
        message: Option<String>,
    ) -> BackendResult<()>;
}

/// Source of service signatures.
#[async_trait::async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn find_services(&self) -> BackendResult<Vec<ServiceMetadata>>;
}

/// Presence check for output adapters, consulted during fusion. Only the
/// existence of an adapter matters to the compiler.
pub trait OutputAdapterOracle: Send + Sync {
    fn has_adapter_for(&self, data_type: &str) -> bool;
}

/// Oracle reporting no adapters at all; fusion never stops at an adapter
/// boundary.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOutputAdapters;

impl OutputAdapterOracle for NoOutputAdapters {
    fn has_adapter_for(&self, _data_type: &str) -> bool {
        false
    }
}

/// Named, time-bounded exclusive token. Release is idempotent; backends also
/// release on drop as a crash backstop.
#[async_trait::async_trait]
pub trait Lease: Send + Sync {
    async fn release(&self);
}

/// Distributed lock registry providing the single-writer guarantee per
/// submission.
#[async_trait::async_trait]
pub trait LockRegistry: Send + Sync {
    /// Try to acquire the named lease, giving up after `timeout`. `None`
    /// means another worker holds it.
    async fn try_lock(
        &self,
        name: &str,
        timeout: Duration,
    ) -> BackendResult<Option<Box<dyn Lease>>>;
}

/// Fire-and-forget notification channel towards the external scheduler.
#[async_trait::async_trait]
pub trait SignalBus: Send + Sync {
    async fn publish(&self, topic: &str);
}

/// Well-known signal topics.
pub mod topics {
    /// New process chains were registered and can be scheduled.
    pub const PROCESS_CHAINS_ADDED: &str = "drover.processchains.added";
}
