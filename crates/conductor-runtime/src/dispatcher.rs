//! Inbound dispatch loop
//!
//! Correlated messages are routed inline. Start messages are admitted inline
//! (so they count as active the moment they are read) and spawned inline when
//! their admission turn is free and nothing is queued ahead of them;
//! otherwise a starter task spawns them in arrival order. A sequential
//! spawner waiting for its permit therefore never blocks delivery to the
//! running session.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use conductor_core::types::Message;

use crate::concurrency::ExecutionMode;
use crate::spawner::{RuntimeError, SpawnerHandle};

/// Counters returned when the inbound stream ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: usize,
    pub started: usize,
    pub rejected: usize,
}

pub struct Dispatcher {
    spawner: SpawnerHandle,
}

impl Dispatcher {
    pub fn new(spawner: SpawnerHandle) -> Self {
        Self { spawner }
    }

    pub fn spawner(&self) -> &SpawnerHandle {
        &self.spawner
    }

    /// Drain `inbound` until it closes; returns once every admitted start
    /// message was spawned.
    pub async fn run(self, mut inbound: mpsc::Receiver<Message>) -> DispatchStats {
        let (start_tx, mut start_rx) = mpsc::unbounded_channel::<Message>();
        let queued = Arc::new(AtomicUsize::new(0));
        let starter = {
            let spawner = self.spawner.clone();
            let queued = queued.clone();
            tokio::spawn(async move {
                let mut started = 0usize;
                let mut failed = 0usize;
                while let Some(message) = start_rx.recv().await {
                    let result = spawner.spawn_admitted(message).await;
                    queued.fetch_sub(1, Ordering::SeqCst);
                    match result {
                        Ok(_) => started += 1,
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to spawn admitted session");
                            failed += 1;
                        }
                    }
                }
                (started, failed)
            })
        };

        let mut stats = DispatchStats::default();
        while let Some(message) = inbound.recv().await {
            let message = match self.spawner.try_deliver(message).await {
                Ok(_) => {
                    stats.delivered += 1;
                    continue;
                }
                Err(message) => message,
            };

            if self.spawner.mode() == ExecutionMode::Single
                || !self.spawner.is_start_operation(&message.operation_id)
            {
                self.spawner.reject(message).await;
                stats.rejected += 1;
                continue;
            }

            match self.spawner.admit() {
                Ok(()) => {
                    let message = if queued.load(Ordering::SeqCst) == 0 {
                        match self.spawner.try_spawn_admitted(message) {
                            Ok(_) => {
                                stats.started += 1;
                                continue;
                            }
                            Err(message) => message,
                        }
                    } else {
                        message
                    };
                    queued.fetch_add(1, Ordering::SeqCst);
                    if let Err(mpsc::error::SendError(_)) = start_tx.send(message) {
                        queued.fetch_sub(1, Ordering::SeqCst);
                        self.spawner.release_admission();
                        stats.rejected += 1;
                    }
                }
                Err(RuntimeError::ShuttingDown) => {
                    tracing::debug!(
                        operation = %message.operation_id,
                        "start message refused during shutdown"
                    );
                    stats.rejected += 1;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "start message refused");
                    stats.rejected += 1;
                }
            }
        }
        drop(start_tx);

        match starter.await {
            Ok((started, failed)) => {
                stats.started += started;
                stats.rejected += failed;
            }
            Err(err) => {
                tracing::error!(error = %err, "session starter task failed");
            }
        }
        tracing::info!(
            delivered = stats.delivered,
            started = stats.started,
            rejected = stats.rejected,
            "inbound stream closed"
        );
        stats
    }
}
