//! In-memory registry implementation for tests and local runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::model::{
    ProcessChain, ProcessChainStatus, ServiceMetadata, Submission, SubmissionStatus,
};

use super::{
    BackendError, BackendResult, Lease, LockRegistry, OutputAdapterOracle, ProcessChainRegistry,
    ResultMap, ServiceRegistry, SignalBus, SubmissionRegistry,
};

#[derive(Clone, Debug)]
struct SubmissionRecord {
    submission: Submission,
    execution_state: Option<Value>,
    results: Option<ResultMap>,
}

#[derive(Clone, Debug)]
struct ProcessChainRecord {
    chain: ProcessChain,
    submission_id: String,
    status: ProcessChainStatus,
    results: Option<ResultMap>,
    error_message: Option<String>,
}

/// Backend that keeps every registry in process memory.
///
/// Cloning shares the underlying stores, so a clone handed to a test acts as
/// a window onto the same state the controller mutates.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    submissions: Arc<Mutex<Vec<SubmissionRecord>>>,
    process_chains: Arc<Mutex<Vec<ProcessChainRecord>>>,
    services: Arc<Mutex<Vec<ServiceMetadata>>>,
    adapter_data_types: Arc<Mutex<HashSet<String>>>,
    locks: Arc<Mutex<HashSet<String>>>,
    published_topics: Arc<Mutex<Vec<String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_submission(&self, submission: Submission) {
        self.submissions
            .lock()
            .expect("submission store poisoned")
            .push(SubmissionRecord {
                submission,
                execution_state: None,
                results: None,
            });
    }

    pub fn register_service(&self, service: ServiceMetadata) {
        self.services
            .lock()
            .expect("service store poisoned")
            .push(service);
    }

    /// Register an output adapter for the given data type, making fusion
    /// stop at executables producing it.
    pub fn register_output_adapter(&self, data_type: impl Into<String>) {
        self.adapter_data_types
            .lock()
            .expect("adapter store poisoned")
            .insert(data_type.into());
    }

    pub fn published_topics(&self) -> Vec<String> {
        self.published_topics
            .lock()
            .expect("topic store poisoned")
            .clone()
    }

    pub fn submission_results(&self, submission_id: &str) -> Option<ResultMap> {
        self.submissions
            .lock()
            .expect("submission store poisoned")
            .iter()
            .find(|record| record.submission.id == submission_id)
            .and_then(|record| record.results.clone())
    }

    /// Complete a process chain the way the external agent layer would.
    pub fn finish_process_chain(
        &self,
        process_chain_id: &str,
        status: ProcessChainStatus,
        results: Option<ResultMap>,
        error_message: Option<String>,
    ) {
        let mut chains = self.process_chains.lock().expect("chain store poisoned");
        if let Some(record) = chains
            .iter_mut()
            .find(|record| record.chain.id == process_chain_id)
        {
            record.status = status;
            record.results = results;
            record.error_message = error_message;
        }
    }

    fn with_submission<T>(
        &self,
        submission_id: &str,
        f: impl FnOnce(&mut SubmissionRecord) -> T,
    ) -> BackendResult<T> {
        let mut submissions = self.submissions.lock().expect("submission store poisoned");
        let record = submissions
            .iter_mut()
            .find(|record| record.submission.id == submission_id)
            .ok_or_else(|| BackendError::NotFound(format!("submission {submission_id}")))?;
        Ok(f(record))
    }

    fn with_process_chain<T>(
        &self,
        process_chain_id: &str,
        f: impl FnOnce(&mut ProcessChainRecord) -> T,
    ) -> BackendResult<T> {
        let mut chains = self.process_chains.lock().expect("chain store poisoned");
        let record = chains
            .iter_mut()
            .find(|record| record.chain.id == process_chain_id)
            .ok_or_else(|| BackendError::NotFound(format!("process chain {process_chain_id}")))?;
        Ok(f(record))
    }
}

#[async_trait::async_trait]
impl SubmissionRegistry for MemoryBackend {
    async fn fetch_next_submission(
        &self,
        from: SubmissionStatus,
        to: SubmissionStatus,
    ) -> BackendResult<Option<Submission>> {
        let mut submissions = self.submissions.lock().expect("submission store poisoned");
        for record in submissions.iter_mut() {
            if record.submission.status == from {
                record.submission.status = to;
                return Ok(Some(record.submission.clone()));
            }
        }
        Ok(None)
    }

    async fn find_submission_by_id(&self, submission_id: &str) -> BackendResult<Submission> {
        self.with_submission(submission_id, |record| record.submission.clone())
    }

    async fn find_submission_ids_by_status(
        &self,
        status: SubmissionStatus,
    ) -> BackendResult<Vec<String>> {
        Ok(self
            .submissions
            .lock()
            .expect("submission store poisoned")
            .iter()
            .filter(|record| record.submission.status == status)
            .map(|record| record.submission.id.clone())
            .collect())
    }

    async fn get_submission_status(
        &self,
        submission_id: &str,
    ) -> BackendResult<SubmissionStatus> {
        self.with_submission(submission_id, |record| record.submission.status)
    }

    async fn set_submission_status(
        &self,
        submission_id: &str,
        status: SubmissionStatus,
    ) -> BackendResult<()> {
        self.with_submission(submission_id, |record| {
            record.submission.status = status;
        })
    }

    async fn set_submission_start_time(
        &self,
        submission_id: &str,
        start_time: DateTime<Utc>,
    ) -> BackendResult<()> {
        self.with_submission(submission_id, |record| {
            record.submission.start_time = Some(start_time);
        })
    }

    async fn set_submission_end_time(
        &self,
        submission_id: &str,
        end_time: DateTime<Utc>,
    ) -> BackendResult<()> {
        self.with_submission(submission_id, |record| {
            record.submission.end_time = Some(end_time);
        })
    }

    async fn get_execution_state(&self, submission_id: &str) -> BackendResult<Option<Value>> {
        self.with_submission(submission_id, |record| record.execution_state.clone())
    }

    async fn set_execution_state(
        &self,
        submission_id: &str,
        state: Option<Value>,
    ) -> BackendResult<()> {
        self.with_submission(submission_id, |record| {
            record.execution_state = state;
        })
    }

    async fn set_submission_results(
        &self,
        submission_id: &str,
        results: Option<ResultMap>,
    ) -> BackendResult<()> {
        self.with_submission(submission_id, |record| {
            record.results = results;
        })
    }
}

#[async_trait::async_trait]
impl ProcessChainRegistry for MemoryBackend {
    async fn add_process_chains(
        &self,
        chains: &[ProcessChain],
        submission_id: &str,
        status: ProcessChainStatus,
    ) -> BackendResult<()> {
        let mut store = self.process_chains.lock().expect("chain store poisoned");
        for chain in chains {
            store.push(ProcessChainRecord {
                chain: chain.clone(),
                submission_id: submission_id.to_string(),
                status,
                results: None,
                error_message: None,
            });
        }
        Ok(())
    }

    async fn find_process_chains_by_submission_id(
        &self,
        submission_id: &str,
    ) -> BackendResult<Vec<ProcessChain>> {
        Ok(self
            .process_chains
            .lock()
            .expect("chain store poisoned")
            .iter()
            .filter(|record| record.submission_id == submission_id)
            .map(|record| record.chain.clone())
            .collect())
    }

    async fn find_process_chain_statuses_by_submission_id(
        &self,
        submission_id: &str,
    ) -> BackendResult<HashMap<String, ProcessChainStatus>> {
        Ok(self
            .process_chains
            .lock()
            .expect("chain store poisoned")
            .iter()
            .filter(|record| record.submission_id == submission_id)
            .map(|record| (record.chain.id.clone(), record.status))
            .collect())
    }

    async fn count_process_chains_by_status(
        &self,
        submission_id: &str,
        status: ProcessChainStatus,
    ) -> BackendResult<usize> {
        Ok(self
            .process_chains
            .lock()
            .expect("chain store poisoned")
            .iter()
            .filter(|record| record.submission_id == submission_id && record.status == status)
            .count())
    }

    async fn get_process_chain_status(
        &self,
        process_chain_id: &str,
    ) -> BackendResult<ProcessChainStatus> {
        self.with_process_chain(process_chain_id, |record| record.status)
    }

    async fn set_process_chain_status(
        &self,
        process_chain_id: &str,
        status: ProcessChainStatus,
    ) -> BackendResult<()> {
        self.with_process_chain(process_chain_id, |record| {
            record.status = status;
        })
    }

    async fn get_process_chain_results(
        &self,
        process_chain_id: &str,
    ) -> BackendResult<Option<ResultMap>> {
        self.with_process_chain(process_chain_id, |record| record.results.clone())
    }

    async fn get_process_chain_error_message(
        &self,
        process_chain_id: &str,
    ) -> BackendResult<Option<String>> {
        self.with_process_chain(process_chain_id, |record| record.error_message.clone())
    }

    async fn set_process_chain_error_message(
        &self,
        process_chain_id: &str,
        message: Option<String>,
    ) -> BackendResult<()> {
        self.with_process_chain(process_chain_id, |record| {
            record.error_message = message;
        })
    }
}

#[async_trait::async_trait]
impl ServiceRegistry for MemoryBackend {
    async fn find_services(&self) -> BackendResult<Vec<ServiceMetadata>> {
        Ok(self.services.lock().expect("service store poisoned").clone())
    }
}

impl OutputAdapterOracle for MemoryBackend {
    fn has_adapter_for(&self, data_type: &str) -> bool {
        self.adapter_data_types
            .lock()
            .expect("adapter store poisoned")
            .contains(data_type)
    }
}

struct MemoryLease {
    name: String,
    locks: Arc<Mutex<HashSet<String>>>,
    released: AtomicBool,
}

impl MemoryLease {
    fn release_once(&self) {
        if !self.released.swap(true, Ordering::SeqCst)
            && let Ok(mut locks) = self.locks.lock()
        {
            locks.remove(&self.name);
        }
    }
}

#[async_trait::async_trait]
impl Lease for MemoryLease {
    async fn release(&self) {
        self.release_once();
    }
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        self.release_once();
    }
}

#[async_trait::async_trait]
impl LockRegistry for MemoryBackend {
    async fn try_lock(
        &self,
        name: &str,
        _timeout: Duration,
    ) -> BackendResult<Option<Box<dyn Lease>>> {
        let mut locks = self.locks.lock().expect("lock store poisoned");
        if locks.contains(name) {
            return Ok(None);
        }
        locks.insert(name.to_string());
        Ok(Some(Box::new(MemoryLease {
            name: name.to_string(),
            locks: Arc::clone(&self.locks),
            released: AtomicBool::new(false),
        })))
    }
}

#[async_trait::async_trait]
impl SignalBus for MemoryBackend {
    async fn publish(&self, topic: &str) {
        self.published_topics
            .lock()
            .expect("topic store poisoned")
            .push(topic.to_string());
    }
}
