//! Common test utilities
//!
//! Scripted mock transport, recording notifier and a temp-dir engine
//! environment, shared across the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use megaferry::storage::db;
use megaferry::transfer::{
    Direction, EngineConfig, NewTransfer, Notifier, Orchestrator, Transfer, TransferState, Transport, TransportError,
    TransportStream,
};

/// One `open()` call as the transport saw it.
#[derive(Debug, Clone)]
pub struct OpenRecord {
    pub source: String,
    pub direction: Direction,
    pub resume_offset: u64,
}

/// Scripted behavior for one open attempt against a source.
///
/// Plans are consumed front-to-back, one per `open()`; the last plan is
/// sticky so later attempts (retries, resumes) repeat it.
#[derive(Debug, Clone)]
pub enum Plan {
    /// Serve a payload of `payload_len` bytes, then end-of-stream.
    Serve {
        payload_len: u64,
        /// Size the stream reports; independent of the payload so tests
        /// can exercise unknown and wrong sizes
        total: Option<u64>,
        /// Whether the provider honours the requested resume offset
        honor_resume: bool,
        /// Whether partial artifacts of this stream are resumable
        supports_resume: bool,
        /// Pause before each chunk, to hold streams open in tests
        chunk_delay: Duration,
    },
    /// Fail the `open()` call itself.
    OpenError(TransportError),
    /// Serve bytes until the absolute offset `at`, then fail.
    FailAt { at: u64, error: TransportError },
}

impl Plan {
    /// A plain serve with no delay and honoured resume.
    pub fn serve(payload_len: u64, total: Option<u64>) -> Self {
        Plan::Serve {
            payload_len,
            total,
            honor_resume: true,
            supports_resume: true,
            chunk_delay: Duration::ZERO,
        }
    }

    /// A serve that holds each chunk for `delay`.
    pub fn serve_slow(payload_len: u64, total: Option<u64>, delay: Duration) -> Self {
        Plan::Serve {
            payload_len,
            total,
            honor_resume: true,
            supports_resume: true,
            chunk_delay: delay,
        }
    }
}

#[derive(Default)]
struct MockState {
    plans: HashMap<String, VecDeque<Plan>>,
    opens: Vec<OpenRecord>,
    /// Data-bearing `read_chunk` calls per source
    reads: HashMap<String, u64>,
    /// Bytes accepted through `write_chunk` per source
    uploaded: HashMap<String, u64>,
}

/// Transport double driven by per-source [`Plan`] scripts.
#[derive(Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues plans for a source, replacing any existing script.
    pub async fn script(&self, source: &str, plans: Vec<Plan>) {
        let mut state = self.state.lock().await;
        state.plans.insert(source.to_string(), plans.into());
    }

    pub async fn opens(&self) -> Vec<OpenRecord> {
        self.state.lock().await.opens.clone()
    }

    pub async fn reads(&self, source: &str) -> u64 {
        self.state.lock().await.reads.get(source).copied().unwrap_or(0)
    }

    pub async fn uploaded(&self, source: &str) -> u64 {
        self.state.lock().await.uploaded.get(source).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(
        &self,
        source: &str,
        direction: Direction,
        resume_offset: u64,
    ) -> Result<Box<dyn TransportStream>, TransportError> {
        let plan = {
            let mut state = self.state.lock().await;
            state.opens.push(OpenRecord {
                source: source.to_string(),
                direction,
                resume_offset,
            });

            let queue = state
                .plans
                .get_mut(source)
                .ok_or_else(|| TransportError::NotFound(format!("unscripted source: {}", source)))?;
            let plan = queue
                .pop_front()
                .ok_or_else(|| TransportError::NotFound(format!("script exhausted: {}", source)))?;
            // Sticky last plan: retries and resumes repeat it
            if queue.is_empty() {
                queue.push_back(plan.clone());
            }
            plan
        };

        match plan {
            Plan::OpenError(error) => Err(error),
            Plan::Serve {
                payload_len,
                total,
                honor_resume,
                supports_resume,
                chunk_delay,
            } => {
                let start = if honor_resume { resume_offset.min(payload_len) } else { 0 };
                Ok(Box::new(MockStream {
                    source: source.to_string(),
                    pos: start,
                    payload_len,
                    total,
                    resumed_from: start,
                    supports_resume,
                    chunk_delay,
                    fail_at: None,
                    state: Arc::clone(&self.state),
                }))
            }
            Plan::FailAt { at, error } => {
                let start = resume_offset.min(at);
                Ok(Box::new(MockStream {
                    source: source.to_string(),
                    pos: start,
                    payload_len: u64::MAX,
                    total: None,
                    resumed_from: start,
                    supports_resume: true,
                    chunk_delay: Duration::ZERO,
                    fail_at: Some((at, error)),
                    state: Arc::clone(&self.state),
                }))
            }
        }
    }
}

struct MockStream {
    source: String,
    pos: u64,
    payload_len: u64,
    total: Option<u64>,
    resumed_from: u64,
    supports_resume: bool,
    chunk_delay: Duration,
    fail_at: Option<(u64, TransportError)>,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl TransportStream for MockStream {
    fn total_bytes(&self) -> Option<u64> {
        self.total
    }

    fn resumed_from(&self) -> u64 {
        self.resumed_from
    }

    fn supports_resume(&self) -> bool {
        self.supports_resume
    }

    async fn read_chunk(&mut self, max_len: usize) -> Result<Option<Bytes>, TransportError> {
        if !self.chunk_delay.is_zero() {
            tokio::time::sleep(self.chunk_delay).await;
        }
        if let Some((at, error)) = &self.fail_at {
            if self.pos >= *at {
                return Err(error.clone());
            }
        }

        let mut limit = self.payload_len.saturating_sub(self.pos);
        if let Some((at, _)) = &self.fail_at {
            limit = limit.min(at.saturating_sub(self.pos));
        }
        if limit == 0 && self.fail_at.is_none() {
            return Ok(None);
        }

        let n = (max_len as u64).min(limit) as usize;
        self.pos += n as u64;
        {
            let mut state = self.state.lock().await;
            *state.reads.entry(self.source.clone()).or_insert(0) += 1;
        }
        Ok(Some(Bytes::from(vec![0xAB; n])))
    }

    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), TransportError> {
        if !self.chunk_delay.is_zero() {
            tokio::time::sleep(self.chunk_delay).await;
        }
        if let Some((at, error)) = &self.fail_at {
            if self.pos + chunk.len() as u64 > *at {
                return Err(error.clone());
            }
        }
        self.pos += chunk.len() as u64;
        let mut state = self.state.lock().await;
        *state.uploaded.entry(self.source.clone()).or_insert(0) += chunk.len() as u64;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Terminal notification as recorded for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyEvent {
    Completed { id: String, artifact: Option<PathBuf> },
    Failed { id: String, reason: String },
    Cancelled { id: String },
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<NotifyEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn events(&self) -> Vec<NotifyEvent> {
        self.events.lock().await.clone()
    }

    pub async fn events_for(&self, id: &str) -> Vec<NotifyEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| match e {
                NotifyEvent::Completed { id: e_id, .. } => e_id == id,
                NotifyEvent::Failed { id: e_id, .. } => e_id == id,
                NotifyEvent::Cancelled { id: e_id } => e_id == id,
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn transfer_completed(&self, transfer: &Transfer, artifact: Option<&std::path::Path>) {
        self.events.lock().await.push(NotifyEvent::Completed {
            id: transfer.id.clone(),
            artifact: artifact.map(|p| p.to_path_buf()),
        });
    }

    async fn transfer_failed(&self, transfer: &Transfer, reason: &str) {
        self.events.lock().await.push(NotifyEvent::Failed {
            id: transfer.id.clone(),
            reason: reason.to_string(),
        });
    }

    async fn transfer_cancelled(&self, transfer: &Transfer) {
        self.events.lock().await.push(NotifyEvent::Cancelled { id: transfer.id.clone() });
    }
}

/// Engine-under-test environment: temp store, temp downloads area, scripted
/// transport, recording notifier.
pub struct TestEnvironment {
    pub dir: tempfile::TempDir,
    pub transport: Arc<MockTransport>,
    pub notifier: Arc<RecordingNotifier>,
}

impl TestEnvironment {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
            transport: MockTransport::new(),
            notifier: RecordingNotifier::new(),
        }
    }

    pub fn db_path(&self) -> String {
        self.dir.path().join("engine.sqlite").to_string_lossy().into_owned()
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.dir.path().join("downloads")
    }

    /// Fast-interval config suited to tests.
    pub fn config(&self) -> EngineConfig {
        EngineConfig::default()
            .downloads_dir(self.downloads_dir())
            .queue_check_interval(Duration::from_millis(10))
            .budget_recheck_interval(Duration::from_millis(50))
            .retry(
                megaferry::core::retry::RetryConfig::new()
                    .initial_delay(Duration::from_millis(10))
                    .max_delay(Duration::from_millis(50))
                    .no_jitter(),
            )
    }

    /// Builds an engine over this environment's store. Several engines may
    /// be built against the same store to simulate restarts.
    pub fn engine_with(&self, config: EngineConfig) -> Orchestrator {
        let pool = db::create_pool(&self.db_path()).expect("store pool");
        Orchestrator::new(
            pool,
            Arc::clone(&self.transport) as Arc<dyn Transport>,
            Arc::clone(&self.notifier) as Arc<dyn Notifier>,
            config,
        )
    }

    pub fn engine(&self) -> Orchestrator {
        self.engine_with(self.config())
    }

    /// Direct store access for arranging crash scenarios.
    pub fn raw_pool(&self) -> db::DbPool {
        db::create_pool(&self.db_path()).expect("store pool")
    }
}

/// Polls until the transfer reaches `state` or the timeout expires.
pub async fn wait_for_state(engine: &Orchestrator, id: &str, state: TransferState, timeout: Duration) -> Transfer {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let snapshot = engine.status(id).await.expect("status");
        if snapshot.state == state {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "transfer {} stuck in {:?} waiting for {:?}",
            id,
            snapshot.state,
            state
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Convenience download submit.
pub async fn submit_download(engine: &Orchestrator, owner: i64, source: &str, declared: Option<u64>) -> String {
    engine
        .submit(NewTransfer::download(owner, source, declared))
        .await
        .expect("submit")
}
