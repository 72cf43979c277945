//! Bounded hand-off from admission to the durable write path.
//!
//! The queue is split into one shard per writer worker and a connection
//! always submits to the same shard, so its events are written, broadcast and
//! acknowledged in the order it submitted them. Across shards, writers take
//! an [`OrderTicket`](crate::fanout::OrderTicket) around write and broadcast,
//! so subscribers see events in durability order. A full shard makes the
//! submitter wait up to the enqueue deadline, then fails with
//! [`SubmitError::Backpressure`].

use crate::error::{StoreError, SubmitError};
use crate::fanout::BroadcastFanout;
use crate::identity::VerifierHandle;
use crate::metrics::{counters, gauges, histograms, HealthState};
use crate::registry::ConnId;
use crate::storage::{EventStore, WriteStatus};
use ostrich_common::types::KIND_METADATA;
use ostrich_common::Event;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The writer's answer for one submitted event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    /// Newly durable and broadcast.
    Stored,
    /// Already stored; not broadcast again.
    Duplicate,
    /// Ephemeral kind: broadcast without storage.
    Ephemeral,
    /// The write failed; the event was not broadcast.
    Failed(String),
}

struct Job {
    event: Arc<Event>,
    ack: oneshot::Sender<Ack>,
}

/// Everything a writer worker needs after the write succeeds or fails.
pub struct WriterContext {
    /// Storage writer handle.
    pub store: Arc<dyn EventStore>,
    /// Broadcast for newly durable events.
    pub fanout: Arc<BroadcastFanout>,
    /// Receives durable metadata events carrying identity claims.
    pub verifier: Option<VerifierHandle>,
    /// Readiness; cleared when storage becomes unavailable.
    pub health: HealthState,
    /// Set to `true` when storage becomes unavailable.
    pub fatal: watch::Sender<bool>,
}

impl WriterContext {
    async fn persist(&self, event: &Arc<Event>) -> Ack {
        let _ticket = self.fanout.ticket().await;
        if event.is_ephemeral() {
            self.fanout.broadcast(event);
            counters::writes_total("ephemeral");
            return Ack::Ephemeral;
        }

        let start = Instant::now();
        let result = self.store.write(event).await;
        histograms::write_latency_seconds(start.elapsed().as_secs_f64());

        match result {
            Ok(WriteStatus::Stored) => {
                counters::writes_total("stored");
                self.fanout.broadcast(event);
                if event.kind == KIND_METADATA {
                    if let Some(verifier) = &self.verifier {
                        verifier.claim(event);
                    }
                }
                Ack::Stored
            }
            Ok(WriteStatus::Duplicate) => {
                counters::writes_total("duplicate");
                Ack::Duplicate
            }
            Err(StoreError::Unavailable(reason)) => {
                counters::writes_total("failed");
                error!(event = event.id_prefix(), "storage unavailable: {}", reason);
                self.health.set_ready(false);
                self.fatal.send_replace(true);
                Ack::Failed(reason)
            }
            Err(StoreError::Rejected(reason)) => {
                counters::writes_total("failed");
                warn!(event = event.id_prefix(), "write rejected: {}", reason);
                Ack::Failed(reason)
            }
        }
    }
}

/// Sizing of the persistence queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Total capacity in events, split across shards.
    pub capacity: usize,
    /// Number of writer workers (one shard each).
    pub workers: usize,
    /// How long a submitter may wait for room.
    pub deadline: Duration,
}

/// Producer side of the persistence queue.
pub struct PersistenceQueue {
    shards: Vec<mpsc::Sender<Job>>,
    deadline: Duration,
}

impl PersistenceQueue {
    /// Spawns `config.workers` writer tasks and returns the queue feeding them.
    ///
    /// Workers exit once the queue is dropped and their shard is drained.
    pub fn spawn(config: QueueConfig, ctx: Arc<WriterContext>) -> (Self, Vec<JoinHandle<()>>) {
        let workers = config.workers.max(1);
        let per_shard = (config.capacity / workers).max(1);
        let mut shards = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for shard in 0..workers {
            let (tx, rx) = mpsc::channel(per_shard);
            shards.push(tx);
            handles.push(tokio::spawn(write_loop(shard, rx, Arc::clone(&ctx))));
        }
        info!(workers, per_shard, "persistence queue started");
        (
            Self {
                shards,
                deadline: config.deadline,
            },
            handles,
        )
    }

    /// Queues `event` on behalf of `conn`, waiting up to the deadline for room.
    ///
    /// The returned receiver resolves once the writer has handled the event.
    ///
    /// # Errors
    ///
    /// [`SubmitError::Backpressure`] if the shard stayed full past the
    /// deadline; [`SubmitError::Closed`] if the writers are gone.
    pub async fn submit(
        &self,
        conn: ConnId,
        event: Arc<Event>,
    ) -> Result<oneshot::Receiver<Ack>, SubmitError> {
        let shard = (conn % self.shards.len() as u64) as usize;
        let tx = &self.shards[shard];
        let (ack, ack_rx) = oneshot::channel();
        match tokio::time::timeout(self.deadline, tx.send(Job { event, ack })).await {
            Ok(Ok(())) => {
                gauges::persist_queue_depth(shard, tx.max_capacity() - tx.capacity());
                Ok(ack_rx)
            }
            Ok(Err(_)) => Err(SubmitError::Closed),
            Err(_) => {
                debug!(cid = conn, shard, "persistence queue full");
                Err(SubmitError::Backpressure)
            }
        }
    }
}

async fn write_loop(shard: usize, mut rx: mpsc::Receiver<Job>, ctx: Arc<WriterContext>) {
    while let Some(job) = rx.recv().await {
        let ack = ctx.persist(&job.event).await;
        // the submitter may have gone away; the event is durable regardless
        let _ = job.ack.send(ack);
    }
    debug!(shard, "writer stopped");
}
