//! Audit Recording
//!
//! Security-relevant outcomes (logins, registrations, rejected tokens,
//! throttled attempts) become [`AuditEvent`]s carrying a risk level that is
//! derived from the outcome, never supplied by the caller.
//!
//! Delivery:
//! - producers call [`AuditRecorder::record`], which only enqueues and never
//!   awaits the sink
//! - a single consumer task drains the bounded queue into an [`AuditSink`]
//! - when the queue is full the configured [`OverflowPolicy`] decides which
//!   event is lost, and the loss is counted
//!
//! Sinks:
//! - [`FileSink`] - append-only JSON lines with an optional SHA-256 hash chain
//! - [`MemorySink`] - in-process buffer
//! - [`TracingSink`] - one log line per event

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, SecurityError};
use crate::metrics::METRICS;
use crate::token_issuer::{SubjectId, TenantId};

/// Coarse severity of a recorded outcome
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Successful outcome
    Low,
    /// Rejected request other than an auth failure
    Medium,
    /// Authentication or authorization failure
    High,
}

impl RiskLevel {
    /// Stored name
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

/// Risk of an outcome, from its status code alone.
///
/// 401/403 are High, any other status of 400 and above is Medium, the rest
/// are Low.
pub fn classify_risk(status: u16) -> RiskLevel {
    match status {
        401 | 403 => RiskLevel::High,
        s if s >= 400 => RiskLevel::Medium,
        _ => RiskLevel::Low,
    }
}

/// Audit event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEvent {
    /// Unique event ID
    pub event_id: Uuid,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,

    /// Authenticated subject, if a session was established
    pub actor_id: Option<SubjectId>,

    /// Tenant of the actor
    pub tenant_id: Option<TenantId>,

    /// Action descriptor, e.g. `POST /api/auth/login`
    pub action: String,

    /// Source address
    pub source_addr: Option<String>,

    /// Client agent string
    pub user_agent: Option<String>,

    /// Outcome status
    pub status: u16,

    /// Why the request was rejected, e.g. `token_expired`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    risk_level: RiskLevel,

    /// Previous event hash (for hash chain)
    pub previous_hash: String,

    /// Current event hash
    pub hash: String,
}

impl AuditEvent {
    /// Event for an action that ended with `status`
    pub fn from_outcome(action: impl Into<String>, status: u16) -> Self {
        let mut event = Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            actor_id: None,
            tenant_id: None,
            action: action.into(),
            source_addr: None,
            user_agent: None,
            status,
            reason: None,
            risk_level: classify_risk(status),
            previous_hash: String::new(),
            hash: String::new(),
        };
        event.hash = event.compute_hash();
        event
    }

    /// Derived risk level
    pub fn risk_level(&self) -> RiskLevel {
        self.risk_level
    }

    fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();

        hasher.update(self.event_id.as_bytes());
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        if let Some(actor) = self.actor_id {
            hasher.update(actor.to_be_bytes());
        }
        if let Some(tenant) = self.tenant_id {
            hasher.update(tenant.to_be_bytes());
        }
        hasher.update(self.action.as_bytes());
        if let Some(addr) = &self.source_addr {
            hasher.update(addr.as_bytes());
        }
        if let Some(agent) = &self.user_agent {
            hasher.update(agent.as_bytes());
        }
        hasher.update(self.status.to_be_bytes());
        if let Some(reason) = &self.reason {
            hasher.update(reason.as_bytes());
        }
        hasher.update(self.risk_level.as_str().as_bytes());
        hasher.update(self.previous_hash.as_bytes());

        hex::encode(hasher.finalize())
    }

    /// Verify event hash
    pub fn verify_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }

    /// Chain onto the previous event
    pub fn set_previous_hash(&mut self, previous_hash: String) {
        self.previous_hash = previous_hash;
        self.hash = self.compute_hash();
    }

    /// Attach the authenticated actor
    pub fn with_actor(mut self, actor_id: SubjectId, tenant_id: Option<TenantId>) -> Self {
        self.actor_id = Some(actor_id);
        self.tenant_id = tenant_id;
        self.hash = self.compute_hash();
        self
    }

    /// Attach the source address
    pub fn with_source(mut self, addr: impl Into<String>) -> Self {
        self.source_addr = Some(addr.into());
        self.hash = self.compute_hash();
        self
    }

    /// Attach the client agent string
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self.hash = self.compute_hash();
        self
    }

    /// Attach the rejection reason
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self.hash = self.compute_hash();
        self
    }
}

/// Destination for drained audit events
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist one event
    async fn write(&self, event: AuditEvent) -> Result<()>;

    /// Called once when the recorder shuts down
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Short name for logs
    fn kind(&self) -> &'static str {
        "custom"
    }
}

fn sink_error(e: impl std::fmt::Display) -> SecurityError {
    SecurityError::AuditSink(e.to_string())
}

/// Filter for [`FileSink::search`]
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    /// Only events by this actor
    pub actor_id: Option<SubjectId>,
    /// Only events at or above this risk
    pub min_risk: Option<RiskLevel>,
    /// Not before
    pub since: Option<DateTime<Utc>>,
    /// Not after
    pub until: Option<DateTime<Utc>>,
}

impl AuditQuery {
    fn matches(&self, event: &AuditEvent) -> bool {
        self.actor_id.map_or(true, |a| event.actor_id == Some(a))
            && self.min_risk.map_or(true, |r| event.risk_level >= r)
            && self.since.map_or(true, |t| event.timestamp >= t)
            && self.until.map_or(true, |t| event.timestamp <= t)
    }
}

/// Append-only JSON lines file
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    hash_chain: bool,
    state: Mutex<FileState>,
}

#[derive(Debug)]
struct FileState {
    file: File,
    last_hash: String,
}

impl FileSink {
    /// Open (or create) the log at `path`, resuming its hash chain
    pub fn open(path: impl Into<PathBuf>, hash_chain: bool) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(sink_error)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(sink_error)?;

        let last_hash = Self::last_hash(&path)?;

        info!("Audit log opened at {}", path.display());
        Ok(Self {
            path,
            hash_chain,
            state: Mutex::new(FileState { file, last_hash }),
        })
    }

    /// Log file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn last_hash(path: &Path) -> Result<String> {
        let reader = BufReader::new(File::open(path).map_err(sink_error)?);
        match reader.lines().last() {
            Some(line) => {
                let event: AuditEvent =
                    serde_json::from_str(&line.map_err(sink_error)?).map_err(sink_error)?;
                Ok(event.hash)
            }
            None => Ok(String::new()),
        }
    }

    fn read_all(&self) -> Result<Vec<AuditEvent>> {
        let reader = BufReader::new(File::open(&self.path).map_err(sink_error)?);
        reader
            .lines()
            .map(|line| {
                let line = line.map_err(sink_error)?;
                serde_json::from_str(&line).map_err(sink_error)
            })
            .collect()
    }

    /// Check every event hash and every chain link.
    /// Returns false at the first mismatch.
    pub async fn verify_integrity(&self) -> Result<bool> {
        let _guard = self.state.lock().await;
        let mut previous_hash = String::new();

        for (i, event) in self.read_all()?.iter().enumerate() {
            if !event.verify_hash() {
                warn!("Audit event hash mismatch at line {}", i + 1);
                return Ok(false);
            }
            if self.hash_chain && event.previous_hash != previous_hash {
                warn!("Audit hash chain broken at line {}", i + 1);
                return Ok(false);
            }
            previous_hash = event.hash.clone();
        }

        Ok(true)
    }

    /// Events matching `query`, in file order
    pub async fn search(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let _guard = self.state.lock().await;
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| query.matches(e))
            .collect())
    }
}

#[async_trait]
impl AuditSink for FileSink {
    async fn write(&self, mut event: AuditEvent) -> Result<()> {
        let mut state = self.state.lock().await;

        if self.hash_chain {
            event.set_previous_hash(state.last_hash.clone());
        }

        let mut json = serde_json::to_string(&event).map_err(sink_error)?;
        json.push('\n');

        state.file.write_all(json.as_bytes()).map_err(sink_error)?;
        state.file.flush().map_err(sink_error)?;
        state.last_hash = event.hash;

        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let state = self.state.lock().await;
        state.file.sync_all().map_err(sink_error)
    }

    fn kind(&self) -> &'static str {
        "file"
    }
}

/// Keeps events in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of written events
    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn write(&self, event: AuditEvent) -> Result<()> {
        self.events.lock().await.push(event);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

/// Writes each event as a structured log line
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl AuditSink for TracingSink {
    async fn write(&self, event: AuditEvent) -> Result<()> {
        match event.risk_level {
            RiskLevel::High => warn!(
                target: "audit",
                event_id = %event.event_id,
                actor_id = ?event.actor_id,
                source = ?event.source_addr,
                status = event.status,
                reason = ?event.reason,
                risk = event.risk_level.as_str(),
                "{}", event.action
            ),
            _ => info!(
                target: "audit",
                event_id = %event.event_id,
                actor_id = ?event.actor_id,
                source = ?event.source_addr,
                status = event.status,
                reason = ?event.reason,
                risk = event.risk_level.as_str(),
                "{}", event.action
            ),
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "tracing"
    }
}

/// Which event is lost when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued event
    DropOldest,
    /// Reject the incoming event
    DropNewest,
}

/// Sink selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    /// JSON lines file
    File {
        /// Log file path
        log_path: PathBuf,
        /// Enable hash chain
        #[serde(default = "default_hash_chain")]
        hash_chain: bool,
    },
    /// In-memory buffer
    Memory,
    /// Structured log lines
    Tracing,
}

fn default_hash_chain() -> bool {
    true
}

impl SinkConfig {
    /// Build the configured sink
    pub fn build(&self) -> Result<Arc<dyn AuditSink>> {
        Ok(match self {
            SinkConfig::File {
                log_path,
                hash_chain,
            } => Arc::new(FileSink::open(log_path.clone(), *hash_chain)?),
            SinkConfig::Memory => Arc::new(MemorySink::new()),
            SinkConfig::Tracing => Arc::new(TracingSink),
        })
    }
}

/// Audit recorder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Queue capacity
    pub queue_capacity: usize,

    /// Overflow policy
    pub overflow_policy: OverflowPolicy,

    /// Sink
    pub sink: SinkConfig,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            overflow_policy: OverflowPolicy::DropOldest,
            sink: SinkConfig::File {
                log_path: PathBuf::from("./data/audit.log"),
                hash_chain: true,
            },
        }
    }
}

impl AuditConfig {
    /// Reject an empty queue
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(SecurityError::Config(
                "Audit queue capacity cannot be zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Shared {
    queue: ArrayQueue<AuditEvent>,
    policy: OverflowPolicy,
    notify: Notify,
    closed: AtomicBool,
    /// `record` calls between the closed check and the push
    producers: AtomicUsize,
    recorded: AtomicU64,
    dropped: AtomicU64,
    sink_failures: AtomicU64,
}

/// Bounded asynchronous audit queue with a single consumer
#[derive(Debug)]
pub struct AuditRecorder {
    shared: Arc<Shared>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl AuditRecorder {
    /// Start the consumer task draining into `sink`.
    /// Must be called from within a tokio runtime.
    pub fn spawn(sink: Arc<dyn AuditSink>, config: &AuditConfig) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            queue: ArrayQueue::new(config.queue_capacity),
            policy: config.overflow_policy,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            producers: AtomicUsize::new(0),
            recorded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
        });

        let sink_kind = sink.kind();
        let consumer = tokio::spawn(consume(shared.clone(), sink));
        info!(
            "Audit recorder started ({} sink, capacity {}, {:?})",
            sink_kind, config.queue_capacity, config.overflow_policy
        );

        Ok(Self {
            shared,
            consumer: Mutex::new(Some(consumer)),
        })
    }

    /// Enqueue an event without waiting for the sink.
    ///
    /// A full queue loses one event according to the overflow policy; the
    /// loss is counted rather than reported to the caller.
    pub fn record(&self, event: AuditEvent) -> Result<()> {
        // The consumer only exits once no producer is past this check
        self.shared.producers.fetch_add(1, Ordering::SeqCst);
        if self.shared.closed.load(Ordering::SeqCst) {
            self.shared.producers.fetch_sub(1, Ordering::SeqCst);
            self.shared.notify.notify_one();
            return Err(SecurityError::AuditQueueClosed);
        }

        let lost = match self.shared.policy {
            OverflowPolicy::DropOldest => self.shared.queue.force_push(event),
            OverflowPolicy::DropNewest => self.shared.queue.push(event).err(),
        };

        if let Some(lost) = lost {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            METRICS.audit_events_dropped_total.inc();
            warn!(
                "Audit queue full, dropped event {} ({})",
                lost.event_id, lost.action
            );
        }

        self.shared.producers.fetch_sub(1, Ordering::SeqCst);
        METRICS.audit_queue_depth.set(self.shared.queue.len() as i64);
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Events written by the sink
    pub fn recorded_count(&self) -> u64 {
        self.shared.recorded.load(Ordering::Relaxed)
    }

    /// Events lost to overflow
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Sink write failures
    pub fn sink_failure_count(&self) -> u64 {
        self.shared.sink_failures.load(Ordering::Relaxed)
    }

    /// Events waiting for the consumer
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Stop accepting events, drain what is queued and stop the consumer
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();

        if let Some(handle) = self.consumer.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Audit consumer terminated abnormally: {}", e);
            }
        }
        info!(
            "Audit recorder stopped ({} recorded, {} dropped, {} sink failures)",
            self.recorded_count(),
            self.dropped_count(),
            self.sink_failure_count()
        );
    }
}

async fn consume(shared: Arc<Shared>, sink: Arc<dyn AuditSink>) {
    loop {
        while let Some(event) = shared.queue.pop() {
            METRICS.audit_queue_depth.set(shared.queue.len() as i64);
            let event_id = event.event_id;

            match sink.write(event).await {
                Ok(()) => {
                    shared.recorded.fetch_add(1, Ordering::Relaxed);
                    METRICS.audit_events_recorded_total.inc();
                }
                Err(e) => {
                    shared.sink_failures.fetch_add(1, Ordering::Relaxed);
                    METRICS.audit_sink_failures_total.inc();
                    error!("Audit sink failed for event {}: {}", event_id, e);
                }
            }
        }

        if shared.closed.load(Ordering::SeqCst)
            && shared.producers.load(Ordering::SeqCst) == 0
            && shared.queue.is_empty()
        {
            break;
        }
        shared.notify.notified().await;
    }

    if let Err(e) = sink.flush().await {
        error!("Audit sink flush failed: {}", e);
    }
    debug!("Audit consumer exited");
}
