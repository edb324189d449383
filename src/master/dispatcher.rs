//! # Master Dispatch Core
//!
//! Routes every image request to exactly one worker, enforces at most one
//! in-flight job per worker, and delivers every response to exactly the
//! submitter that originated its packet id.
//!
//! ## State discipline
//!
//! All dispatch state lives behind one coarse mutex so that picking a free
//! worker and marking it busy is a single critical section: two requests
//! arriving together can never select the same free worker. Socket writes
//! happen after the lock is released.
//!
//! ## Message flow
//!
//! ```text
//! Submitter -> Master (ImageRequest)   accept_job: record + select or queue
//! Master -> Worker (ImageRequest)      assign: mark busy, forward
//! Worker -> Master (SlaveStatistics)   handle_stats: refresh cached stats
//! Worker -> Master (ImageResponse)     handle_result: free worker, route back
//! Master -> Submitter (ImageResponse)  payload forwarded byte-identical
//! ```

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::common::connection::{ConnectionHandle, NetEvent};
use crate::common::messages::{
    ImagePacket, MessageKind, NetworkMessage, SlaveRegistrationData, SlaveStatistics,
};
use crate::master::policy::SelectionPolicy;
use crate::master::report::BatchReport;

// ============================================================================
// RECORDS
// ============================================================================

/// One registered worker. At most one record per `(ip, port)`.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub id: Uuid,
    pub ip: String,
    pub port: u16,
    pub registered_at: DateTime<Utc>,
    /// Last statistics frame received from this worker.
    pub stats: SlaveStatistics,
}

impl WorkerRecord {
    pub fn key(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Tracks one in-flight job from reception until its response is routed.
#[derive(Debug)]
struct PendingRequest {
    submitter: ConnectionHandle,
    submitter_addr: SocketAddr,
    file_name: String,
    /// Set when the job is handed to a worker; start of the per-job latency.
    dispatched_at: Option<Instant>,
}

/// A job that arrived while every worker was busy.
#[derive(Debug)]
struct PendingTask {
    packet_id: String,
    /// The original request payload, forwarded unmodified on assignment.
    data: String,
}

// ============================================================================
// DISPATCH STATE
// ============================================================================

#[derive(Default)]
struct DispatchState {
    /// Insertion order determines "Slave #N" numbering and policy iteration.
    workers: Vec<WorkerRecord>,
    connections: HashMap<String, ConnectionHandle>,
    busy: HashMap<String, bool>,
    pending: HashMap<String, PendingRequest>,
    queue: VecDeque<PendingTask>,
    rr_counter: u64,
    received: u64,
    completed: u64,
    assigned: HashMap<String, u64>,
    first_job_at: Option<DateTime<Utc>>,
    last_event_at: Option<DateTime<Utc>>,
    job_latencies: Vec<Duration>,
}

impl DispatchState {
    /// Pick a free worker under the configured policy, registry order.
    /// Does not flip the busy flag; the caller does that in the same
    /// critical section.
    fn select_free_worker(&mut self, policy: &SelectionPolicy) -> Option<String> {
        let free: Vec<&WorkerRecord> = self
            .workers
            .iter()
            .filter(|w| !self.busy.get(&w.key()).copied().unwrap_or(false))
            .collect();
        policy.pick(&free, &mut self.rr_counter).map(|w| w.key())
    }

    fn display_index(&self, key: &str) -> usize {
        self.workers
            .iter()
            .position(|w| w.key() == key)
            .map(|i| i + 1)
            .unwrap_or(0)
    }
}

/// Everything prepared under the lock for one assignment; the send itself
/// happens after the lock is dropped.
struct Assignment {
    worker_key: String,
    conn: ConnectionHandle,
    packet_id: String,
    data: String,
}

// ============================================================================
// DISPATCHER
// ============================================================================

/// The master's coordination component. Shared across connection reader
/// tasks via `Arc`; every operation locks the single state mutex.
pub struct Dispatcher {
    policy: SelectionPolicy,
    state: Mutex<DispatchState>,
}

impl Dispatcher {
    pub fn new(policy: SelectionPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(DispatchState::default()),
        }
    }

    /// Consume transport events until the channel closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<NetEvent>) {
        info!("🚀 Dispatcher running with policy {:?}", self.policy);
        while let Some(event) = events.recv().await {
            match event {
                NetEvent::Message { msg, conn } => self.handle_message(msg, conn).await,
                NetEvent::Disconnected { conn } => {
                    debug!("🔌 Connection {} ({}) closed", conn.id(), conn.peer());
                }
                NetEvent::ConnectionError { peer, error } => {
                    error!("❌ Connection to {} failed: {}", peer, error);
                }
            }
        }
        info!("🔌 Dispatcher event channel closed, stopping");
    }

    /// Route one inbound message by kind. Malformed payloads are logged and
    /// dropped; they never take the dispatcher down.
    pub async fn handle_message(&self, msg: NetworkMessage, conn: ConnectionHandle) {
        match msg.kind {
            MessageKind::SlaveRegister => match msg.payload::<SlaveRegistrationData>() {
                Ok(reg) => self.register_worker(reg, conn).await,
                Err(e) => warn!("⚠️  Discarding bad registration: {}", e),
            },
            MessageKind::ImageRequest => match msg.payload::<ImagePacket>() {
                Ok(packet) => self.accept_job(packet, &msg.data, conn).await,
                Err(e) => warn!("⚠️  Discarding bad image request: {}", e),
            },
            MessageKind::ImageResponse => match msg.payload::<ImagePacket>() {
                Ok(packet) => self.handle_result(packet, &msg.data, conn).await,
                Err(e) => warn!("⚠️  Discarding bad image response: {}", e),
            },
            MessageKind::SlaveStatistics => match msg.payload::<SlaveStatistics>() {
                Ok(stats) => self.handle_stats(stats).await,
                Err(e) => warn!("⚠️  Discarding bad statistics frame: {}", e),
            },
            MessageKind::Acknowledgment => {
                debug!("📋 Stray acknowledgment from {}", conn.peer());
            }
        }
    }

    // ========================================================================
    // REGISTRATION
    // ========================================================================

    /// Add a worker to the registry. Idempotent on `(ip, port)`: a repeat
    /// registration is ignored without a second acknowledgment.
    async fn register_worker(&self, reg: SlaveRegistrationData, conn: ConnectionHandle) {
        let key = format!("{}:{}", reg.ip_address, reg.port);
        let display_index = {
            let mut state = self.state.lock().await;
            if state.workers.iter().any(|w| w.key() == key) {
                debug!("📋 Worker {} re-registered, ignoring", key);
                return;
            }
            state.workers.push(WorkerRecord {
                id: Uuid::new_v4(),
                ip: reg.ip_address.clone(),
                port: reg.port,
                registered_at: Utc::now(),
                stats: SlaveStatistics::empty(reg.port),
            });
            state.connections.insert(key.clone(), conn.clone());
            state.busy.insert(key.clone(), false);
            state.assigned.insert(key.clone(), 0);
            state.workers.len()
        };

        info!("👷 Slave #{} registered at {}", display_index, key);

        if let Err(e) = conn.send(&NetworkMessage::acknowledgment()).await {
            error!("❌ Failed to acknowledge worker {}: {}", key, e);
        }

        // A new worker is new capacity; queued jobs may proceed.
        self.drain_queue().await;
    }

    // ========================================================================
    // JOB INTAKE
    // ========================================================================

    /// Accept one image request from a submitter: record where it came from,
    /// then dispatch immediately or queue.
    ///
    /// Jobs arriving before any worker has registered are dropped, not
    /// queued.
    async fn accept_job(&self, packet: ImagePacket, raw_data: &str, conn: ConnectionHandle) {
        let packet_id = packet.packet_id.clone();
        let outcome = {
            let mut state = self.state.lock().await;
            if state.workers.is_empty() {
                warn!(
                    "⚠️  Dropping job '{}' ({}): no workers registered",
                    packet_id, packet.file_name
                );
                return;
            }

            state.received += 1;
            if state.first_job_at.is_none() {
                state.first_job_at = Some(Utc::now());
            }
            state.pending.insert(
                packet_id.clone(),
                PendingRequest {
                    submitter: conn.clone(),
                    submitter_addr: conn.peer(),
                    file_name: packet.file_name.clone(),
                    dispatched_at: None,
                },
            );

            let task = PendingTask {
                packet_id: packet_id.clone(),
                data: raw_data.to_string(),
            };
            match Self::stage_assignment(&mut state, &self.policy, task) {
                Ok(assignment) => Some(assignment),
                Err(task) => {
                    state.queue.push_back(task);
                    None
                }
            }
        };

        match outcome {
            Some(assignment) => self.deliver(assignment).await,
            None => debug!("⏳ Job '{}' queued, all workers busy", packet_id),
        }
    }

    /// Under the lock: pick a worker, flip its busy flag, stamp the dispatch
    /// time. Gives the task back when no worker is free so the caller decides
    /// where it waits.
    fn stage_assignment(
        state: &mut DispatchState,
        policy: &SelectionPolicy,
        task: PendingTask,
    ) -> Result<Assignment, PendingTask> {
        let worker_key = match state.select_free_worker(policy) {
            Some(key) => key,
            None => return Err(task),
        };
        let conn = match state.connections.get(&worker_key) {
            Some(conn) => conn.clone(),
            None => {
                warn!("⚠️  Worker {} has no live connection", worker_key);
                return Err(task);
            }
        };

        state.busy.insert(worker_key.clone(), true);
        if let Some(pending) = state.pending.get_mut(&task.packet_id) {
            pending.dispatched_at = Some(Instant::now());
        }
        *state.assigned.entry(worker_key.clone()).or_insert(0) += 1;

        Ok(Assignment {
            worker_key,
            conn,
            packet_id: task.packet_id,
            data: task.data,
        })
    }

    /// Send a staged assignment to its worker. On failure the busy flag is
    /// reverted and the task is lost; there is no retry path.
    async fn deliver(&self, assignment: Assignment) {
        let msg = NetworkMessage::with_raw_data(MessageKind::ImageRequest, assignment.data);
        debug!(
            "📤 Job '{}' dispatched to worker {}",
            assignment.packet_id, assignment.worker_key
        );
        if let Err(e) = assignment.conn.send(&msg).await {
            error!(
                "❌ Failed to send job '{}' to worker {}: {} (task lost)",
                assignment.packet_id, assignment.worker_key, e
            );
            let mut state = self.state.lock().await;
            state.busy.insert(assignment.worker_key.clone(), false);
            if let Some(count) = state.assigned.get_mut(&assignment.worker_key) {
                *count = count.saturating_sub(1);
            }
        }
    }

    // ========================================================================
    // RESULTS
    // ========================================================================

    /// Route a finished job back to its submitter and free the worker.
    async fn handle_result(&self, packet: ImagePacket, raw_data: &str, conn: ConnectionHandle) {
        let packet_id = packet.packet_id.clone();
        let (forward, report) = {
            let mut state = self.state.lock().await;
            state.completed += 1;
            state.last_event_at = Some(Utc::now());

            let pending = match state.pending.remove(&packet_id) {
                Some(pending) => pending,
                None => {
                    warn!(
                        "⚠️  Result for unknown packet '{}', discarding (no worker freed)",
                        packet_id
                    );
                    return;
                }
            };

            let worker_key = format!("{}:{}", conn.peer().ip(), packet.slave_port);
            match state.busy.get_mut(&worker_key) {
                Some(flag) => {
                    *flag = false;
                    debug!(
                        "✅ Worker {} (Slave #{}) freed by '{}'",
                        worker_key,
                        state.display_index(&worker_key),
                        packet_id
                    );
                }
                None => warn!(
                    "⚠️  Result '{}' names unknown worker {}",
                    packet_id, worker_key
                ),
            }

            if let Some(started) = pending.dispatched_at {
                state.job_latencies.push(started.elapsed());
            }

            let report = if state.received > 0 && state.completed == state.received {
                Some(self.build_report(&state))
            } else {
                None
            };

            (pending, report)
        };

        info!(
            "📥 Job '{}' ({}) completed, routing back to {}",
            packet_id, forward.file_name, forward.submitter_addr
        );

        if forward.submitter.is_closed() {
            debug!(
                "🔌 Submitter {} gone, dropping result '{}'",
                forward.submitter_addr, packet_id
            );
        } else {
            let response =
                NetworkMessage::with_raw_data(MessageKind::ImageResponse, raw_data.to_string());
            if let Err(e) = forward.submitter.send(&response).await {
                debug!(
                    "🔌 Could not return '{}' to {}: {}",
                    packet_id, forward.submitter_addr, e
                );
            }
        }

        if let Some(report) = report {
            report.log();
        }

        // The freed worker can pick up queued work.
        self.drain_queue().await;
    }

    /// Refresh the cached statistics of the worker with this port.
    async fn handle_stats(&self, stats: SlaveStatistics) {
        let mut state = self.state.lock().await;
        match state.workers.iter_mut().find(|w| w.port == stats.port) {
            Some(worker) => {
                debug!(
                    "📊 Worker {} stats: {} tasks, avg {:.3}s",
                    worker.key(),
                    stats.tasks_completed,
                    stats.average_processing_time
                );
                worker.stats = stats;
            }
            None => warn!("⚠️  Statistics from unknown worker port {}", stats.port),
        }
    }

    // ========================================================================
    // QUEUE DRAIN
    // ========================================================================

    /// Hand queued tasks to free workers, FIFO, until either runs out.
    /// Called after every event that may add capacity.
    async fn drain_queue(&self) {
        loop {
            let assignment = {
                let mut state = self.state.lock().await;
                let task = match state.queue.pop_front() {
                    Some(task) => task,
                    None => return,
                };
                match Self::stage_assignment(&mut state, &self.policy, task) {
                    Ok(assignment) => assignment,
                    Err(task) => {
                        // Nobody free; the task keeps its place in line.
                        state.queue.push_front(task);
                        return;
                    }
                }
            };
            self.deliver(assignment).await;
        }
    }

    fn build_report(&self, state: &DispatchState) -> BatchReport {
        BatchReport::build(
            state.completed,
            state
                .workers
                .iter()
                .enumerate()
                .map(|(i, w)| {
                    (
                        format!("Slave #{} ({})", i + 1, w.key()),
                        state.assigned.get(&w.key()).copied().unwrap_or(0),
                    )
                })
                .collect(),
            state.first_job_at,
            state.last_event_at,
            &state.job_latencies,
        )
    }

    // ========================================================================
    // OBSERVABILITY
    // ========================================================================

    pub async fn worker_count(&self) -> usize {
        self.state.lock().await.workers.len()
    }

    /// `(received, completed)` so far.
    pub async fn counters(&self) -> (u64, u64) {
        let state = self.state.lock().await;
        (state.received, state.completed)
    }

    pub async fn queue_len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    #[cfg(test)]
    async fn is_busy(&self, key: &str) -> bool {
        self.state
            .lock()
            .await
            .busy
            .get(key)
            .copied()
            .unwrap_or(false)
    }

    #[cfg(test)]
    async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}
