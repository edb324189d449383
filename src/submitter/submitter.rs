//! # Submitter
//!
//! Pushes a batch of image jobs to the master over one persistent connection
//! and collects the processed results, which come back in whatever order the
//! workers finish them. Each job gets a fresh UUID packet id; the id on every
//! response picks out which job it answers.
//!
//! The submitter library never touches the filesystem; results are handed to
//! a caller-supplied sink and the binary decides where they land.

use anyhow::{bail, Result};
use log::{info, warn};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::common::connection::{self, NetEvent};
use crate::common::messages::{ImagePacket, MessageKind, NetworkMessage};

const EVENT_QUEUE_CAPACITY: usize = 64;

/// One job to submit.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub file_name: String,
    pub image_data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub filter_size: u32,
}

/// One completed job as returned by a worker.
#[derive(Debug)]
pub struct JobResult {
    pub packet_id: String,
    pub file_name: String,
    pub image_data: Vec<u8>,
    pub latency: Duration,
}

/// Latency figures for a finished batch.
#[derive(Debug)]
pub struct BatchSummary {
    pub jobs: usize,
    pub wall_clock: Duration,
    pub min_latency: Duration,
    pub max_latency: Duration,
    pub avg_latency: Duration,
}

impl BatchSummary {
    pub fn log(&self) {
        info!(
            "📊 Batch of {} job(s) finished in {:.3}s (latency min {:.3}s / avg {:.3}s / max {:.3}s)",
            self.jobs,
            self.wall_clock.as_secs_f64(),
            self.min_latency.as_secs_f64(),
            self.avg_latency.as_secs_f64(),
            self.max_latency.as_secs_f64()
        );
    }
}

pub struct Submitter {
    master_addr: String,
}

impl Submitter {
    pub fn new(master_addr: String) -> Self {
        Self { master_addr }
    }

    /// Send every job, then wait until every response arrived. `on_result` is
    /// called once per completed job, in completion order.
    pub async fn submit_batch(
        &self,
        jobs: Vec<JobSpec>,
        shutdown: watch::Receiver<bool>,
        mut on_result: impl FnMut(JobResult) -> Result<()>,
    ) -> Result<BatchSummary> {
        if jobs.is_empty() {
            bail!("nothing to submit");
        }

        let (event_tx, mut event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let master = connection::connect(&self.master_addr, event_tx, shutdown).await?;

        let batch_started = Instant::now();
        let mut in_flight: HashMap<String, (String, Instant)> = HashMap::new();
        let mut outbound = Vec::with_capacity(jobs.len());

        for job in jobs {
            let packet_id = Uuid::new_v4().to_string();
            let packet = ImagePacket {
                packet_id: packet_id.clone(),
                file_name: job.file_name.clone(),
                image_data: job.image_data,
                width: job.width,
                height: job.height,
                format: job.format,
                filter_size: job.filter_size,
                slave_port: 0,
            };
            outbound.push(NetworkMessage::with_payload(MessageKind::ImageRequest, &packet)?);
            info!("📤 Submitting '{}' as packet {}", job.file_name, packet_id);
            in_flight.insert(packet_id, (job.file_name, Instant::now()));
        }

        // Push requests from a separate task so results streaming back never
        // block the sends (one socket carries both directions).
        let sender_conn = master.clone();
        let sender = tokio::spawn(async move {
            for msg in outbound {
                sender_conn.send(&msg).await?;
            }
            Ok::<(), anyhow::Error>(())
        });

        let mut latencies: Vec<Duration> = Vec::new();
        while !in_flight.is_empty() {
            let event = match event_rx.recv().await {
                Some(event) => event,
                None => bail!("transport stopped with {} job(s) outstanding", in_flight.len()),
            };
            match event {
                NetEvent::Message { msg, .. } => {
                    if msg.kind != MessageKind::ImageResponse {
                        warn!("⚠️  Unexpected {} frame from master", msg.kind);
                        continue;
                    }
                    let packet: ImagePacket = match msg.payload() {
                        Ok(packet) => packet,
                        Err(e) => {
                            warn!("⚠️  Discarding bad response: {}", e);
                            continue;
                        }
                    };
                    let (file_name, sent_at) = match in_flight.remove(&packet.packet_id) {
                        Some(entry) => entry,
                        None => {
                            warn!("⚠️  Response for unknown packet {}", packet.packet_id);
                            continue;
                        }
                    };
                    let latency = sent_at.elapsed();
                    latencies.push(latency);
                    info!(
                        "📥 Received '{}' ({} bytes) after {:.3}s, {} outstanding",
                        file_name,
                        packet.image_data.len(),
                        latency.as_secs_f64(),
                        in_flight.len()
                    );
                    on_result(JobResult {
                        packet_id: packet.packet_id,
                        file_name,
                        image_data: packet.image_data,
                        latency,
                    })?;
                }
                NetEvent::Disconnected { .. } => {
                    bail!(
                        "master closed the connection with {} job(s) outstanding",
                        in_flight.len()
                    );
                }
                NetEvent::ConnectionError { error, .. } => {
                    bail!("connection to master failed: {}", error);
                }
            }
        }

        match sender.await {
            Ok(result) => result?,
            Err(e) => bail!("send task failed: {}", e),
        }

        let wall_clock = batch_started.elapsed();
        let min_latency = latencies.iter().min().copied().unwrap_or_default();
        let max_latency = latencies.iter().max().copied().unwrap_or_default();
        let avg_latency = latencies.iter().sum::<Duration>() / latencies.len() as u32;

        Ok(BatchSummary {
            jobs: latencies.len(),
            wall_clock,
            min_latency,
            max_latency,
            avg_latency,
        })
    }
}
