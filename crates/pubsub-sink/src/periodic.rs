// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory periodic shipping.
//!
//! Formatted records are queued by [`PeriodicHandle::emit`] and shipped by the
//! service on every tick. Records of a failed batch go back to the front of
//! the queue for the next tick. The queue is bounded: past the limit the
//! oldest records are dropped.

use crate::engine::{DeliveryEngine, DeliveryOutcome};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug)]
pub enum ShipperCommand {
    Emit(String),
    Flush(oneshot::Sender<FlushResponse>),
    Shutdown,
}

/// Result of one shipping round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushResponse {
    pub outcome: DeliveryOutcome,
    pub delivered: usize,
    pub skipped: usize,
    /// Records still queued afterwards.
    pub pending: usize,
}

#[derive(Clone, Debug)]
pub struct PeriodicHandle {
    tx: mpsc::UnboundedSender<ShipperCommand>,
}

impl PeriodicHandle {
    pub fn emit(&self, text: String) -> Result<(), mpsc::error::SendError<ShipperCommand>> {
        self.tx.send(ShipperCommand::Emit(text))
    }

    /// Ships everything queued so far without waiting for the next tick.
    pub async fn flush(&self) -> Result<FlushResponse, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(ShipperCommand::Flush(response_tx))
            .map_err(|e| format!("Failed to send flush command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive flush response: {}", e))
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<ShipperCommand>> {
        self.tx.send(ShipperCommand::Shutdown)
    }
}

pub struct PeriodicShipper {
    engine: Arc<DeliveryEngine>,
    rx: mpsc::UnboundedReceiver<ShipperCommand>,
    queue: VecDeque<String>,
    queue_limit: usize,
    period: Duration,
    cancel_token: CancellationToken,
    evicted: usize,
}

impl PeriodicShipper {
    pub fn new(
        engine: Arc<DeliveryEngine>,
        period: Duration,
        queue_limit: usize,
        cancel_token: CancellationToken,
    ) -> (Self, PeriodicHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = PeriodicShipper {
            engine,
            rx,
            queue: VecDeque::new(),
            queue_limit: queue_limit.max(1),
            period,
            cancel_token,
            evicted: 0,
        };
        (service, PeriodicHandle { tx })
    }

    /// Runs until shut down, cancelled, or every handle is dropped. Whatever
    /// is still queued gets one last shipping attempt on the way out.
    pub async fn run(mut self) {
        debug!("PUBSUB | Periodic shipper started");

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!("PUBSUB | Periodic shipper cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    self.ship().await;
                }
                command = self.rx.recv() => match command {
                    Some(ShipperCommand::Emit(text)) => self.enqueue(text),
                    Some(ShipperCommand::Flush(response_tx)) => {
                        let response = self.ship().await;
                        if response_tx.send(response).is_err() {
                            error!("PUBSUB | Failed to send flush response - receiver dropped");
                        }
                    }
                    Some(ShipperCommand::Shutdown) | None => {
                        debug!("PUBSUB | Periodic shipper shutting down");
                        break;
                    }
                },
            }
        }

        // Pick up emits that were sent before the shutdown.
        while let Ok(command) = self.rx.try_recv() {
            if let ShipperCommand::Emit(text) = command {
                self.enqueue(text);
            }
        }
        if !self.queue.is_empty() {
            let response = self.ship().await;
            if response.pending > 0 {
                warn!(
                    "PUBSUB | Periodic shipper stopped with {} undelivered records",
                    response.pending
                );
            }
        }
        debug!("PUBSUB | Periodic shipper stopped");
    }

    fn enqueue(&mut self, text: String) {
        self.queue.push_back(text);
        self.enforce_limit();
    }

    fn enforce_limit(&mut self) {
        while self.queue.len() > self.queue_limit {
            self.queue.pop_front();
            self.evicted += 1;
        }
    }

    async fn ship(&mut self) -> FlushResponse {
        if self.evicted > 0 {
            warn!(
                "PUBSUB | Queue limit of {} reached, dropped {} oldest records",
                self.queue_limit, self.evicted
            );
            self.evicted = 0;
        }
        if self.queue.is_empty() {
            return FlushResponse {
                outcome: DeliveryOutcome::Success,
                delivered: 0,
                skipped: 0,
                pending: 0,
            };
        }

        let texts: Vec<String> = self.queue.drain(..).collect();
        let report = self.engine.ship(&texts).await;

        if !report.outcome.is_success() {
            debug!(
                "PUBSUB | Requeueing {} records after failed publish",
                report.unsent.len()
            );
            for text in report.unsent.into_iter().rev() {
                self.queue.push_front(text);
            }
            // Records emitted during the ship sit in the channel, not the
            // queue, so only requeued records can exceed the limit here.
            self.enforce_limit();
        }

        FlushResponse {
            outcome: report.outcome,
            delivered: report.delivered,
            skipped: report.skipped,
            pending: self.queue.len(),
        }
    }
}
