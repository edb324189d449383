//! # Worker Node
//!
//! Dials the master, registers, then serves image jobs until shutdown: decode
//! the inbound bytes, run the filter pipeline, push the statistics frame and
//! the response back on the same connection.
//!
//! The connection reader must stay responsive while a job crunches pixels, so
//! every job runs in its own spawned task with the actual transform inside
//! `spawn_blocking`. The master never dispatches a second job to a busy
//! worker, so one transform at a time is the steady state.

use anyhow::{bail, Result};
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, Mutex};

use crate::common::config::WorkerConfig;
use crate::common::connection::{self, ConnectionHandle, NetEvent};
use crate::common::messages::{
    ImagePacket, MessageKind, NetworkMessage, SlaveRegistrationData, SlaveStatistics,
};
use crate::filter::pipeline::process_image;

const EVENT_QUEUE_CAPACITY: usize = 64;

/// Running totals for this worker. Times are wall-clock seconds.
#[derive(Debug, Default)]
struct WorkerTotals {
    tasks_completed: u64,
    total_processing_time: f64,
}

impl WorkerTotals {
    fn record(&mut self, elapsed_secs: f64, port: u16) -> SlaveStatistics {
        self.tasks_completed += 1;
        self.total_processing_time += elapsed_secs;
        SlaveStatistics {
            port,
            tasks_completed: self.tasks_completed,
            total_processing_time: self.total_processing_time,
            average_processing_time: self.total_processing_time / self.tasks_completed as f64,
        }
    }
}

pub struct WorkerNode {
    config: WorkerConfig,
    totals: Arc<Mutex<WorkerTotals>>,
}

impl WorkerNode {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            totals: Arc::new(Mutex::new(WorkerTotals::default())),
        }
    }

    /// Register with the master, then process jobs until the master goes away
    /// or shutdown flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let (event_tx, mut event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let master = connection::connect(
            &self.config.master.address,
            event_tx,
            shutdown.clone(),
        )
        .await?;

        info!(
            "🚀 Worker {}:{} ({:?} mode) dialing in",
            self.config.worker.advertised_ip, self.config.worker.port, self.config.worker.mode
        );

        let registration = NetworkMessage::with_payload(
            MessageKind::SlaveRegister,
            &SlaveRegistrationData {
                ip_address: self.config.worker.advertised_ip.clone(),
                port: self.config.worker.port,
            },
        )?;
        master.send(&registration).await?;

        // The master answers a first-time registration with an OK frame.
        match event_rx.recv().await {
            Some(NetEvent::Message { msg, .. }) if msg.is_ack_ok() => {
                info!("🤝 Registered with master at {}", master.peer());
            }
            Some(NetEvent::Message { msg, .. }) => {
                bail!("expected acknowledgment, got {}", msg.kind);
            }
            Some(NetEvent::Disconnected { .. }) | None => {
                bail!("master closed the connection during registration");
            }
            Some(NetEvent::ConnectionError { error, .. }) => {
                bail!("registration failed: {}", error);
            }
        }

        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => {
                    info!("🔌 Worker {} stopping", self.config.worker.port);
                    return Ok(());
                }
                event = event_rx.recv() => event,
            };
            match event {
                Some(NetEvent::Message { msg, .. }) => self.handle_frame(msg, &master),
                Some(NetEvent::Disconnected { .. }) => {
                    info!("🔌 Master disconnected, worker exiting");
                    return Ok(());
                }
                Some(NetEvent::ConnectionError { error, .. }) => {
                    bail!("connection to master failed: {}", error);
                }
                None => return Ok(()),
            }
        }
    }

    fn handle_frame(&self, msg: NetworkMessage, master: &ConnectionHandle) {
        match msg.kind {
            MessageKind::ImageRequest => match msg.payload::<ImagePacket>() {
                Ok(packet) => self.spawn_job(packet, master.clone()),
                Err(e) => error!("❌ Discarding bad job frame: {}", e),
            },
            other => debug!("📋 Ignoring {} frame from master", other),
        }
    }

    /// Run one job off the reader task. The transform itself goes to the
    /// blocking pool; the reader never waits on it.
    fn spawn_job(&self, mut packet: ImagePacket, master: ConnectionHandle) {
        let mode = self.config.worker.mode;
        let port = self.config.worker.port;
        let totals = self.totals.clone();

        tokio::spawn(async move {
            info!(
                "📷 Processing job '{}' ({}, {} bytes, filter size {})",
                packet.packet_id,
                packet.file_name,
                packet.image_data.len(),
                packet.filter_size
            );
            let started = Instant::now();

            let input = std::mem::take(&mut packet.image_data);
            let filter_size = packet.filter_size;
            let transform =
                tokio::task::spawn_blocking(move || process_image(&input, filter_size, mode))
                    .await;

            let processed = match transform {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(e)) => {
                    error!("❌ Filter pipeline failed for '{}': {}", packet.packet_id, e);
                    return;
                }
                Err(e) => {
                    error!("❌ Filter task panicked for '{}': {}", packet.packet_id, e);
                    return;
                }
            };

            let elapsed = started.elapsed().as_secs_f64();
            let stats = totals.lock().await.record(elapsed, port);
            info!(
                "✅ Job '{}' done in {:.3}s (total {} task(s), avg {:.3}s)",
                packet.packet_id, elapsed, stats.tasks_completed, stats.average_processing_time
            );

            // Statistics first, then the result, on the same connection.
            match NetworkMessage::with_payload(MessageKind::SlaveStatistics, &stats) {
                Ok(frame) => {
                    if let Err(e) = master.send(&frame).await {
                        error!("❌ Failed to send statistics: {}", e);
                    }
                }
                Err(e) => error!("❌ Failed to encode statistics: {}", e),
            }

            let response = ImagePacket {
                packet_id: packet.packet_id.clone(),
                file_name: packet.file_name,
                image_data: processed,
                width: packet.width,
                height: packet.height,
                format: packet.format,
                filter_size: packet.filter_size,
                slave_port: port,
            };
            match NetworkMessage::with_payload(MessageKind::ImageResponse, &response) {
                Ok(frame) => {
                    if let Err(e) = master.send(&frame).await {
                        error!(
                            "❌ Failed to return job '{}': {}",
                            response.packet_id, e
                        );
                    }
                }
                Err(e) => error!("❌ Failed to encode response: {}", e),
            }
        });
    }
}
