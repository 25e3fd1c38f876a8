// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::buffer::DurableBuffer;
use crate::engine::{DeliveryEngine, DeliveryOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Totals of one shipping cycle over the durable buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub outcome: DeliveryOutcome,
    pub delivered: usize,
    pub skipped: usize,
}

/// Ships the durable buffer on a fixed interval.
///
/// The bookmark moves only after a chunk was published successfully. A failed
/// chunk is read again on the next cycle.
#[derive(Debug)]
pub struct DurableShipper {
    engine: Arc<DeliveryEngine>,
    buffer: Arc<DurableBuffer>,
    interval: Duration,
    in_flight: Mutex<()>,
}

impl DurableShipper {
    pub fn new(engine: Arc<DeliveryEngine>, buffer: Arc<DurableBuffer>, interval: Duration) -> Self {
        DurableShipper {
            engine,
            buffer,
            interval,
            in_flight: Mutex::new(()),
        }
    }

    pub fn buffer(&self) -> &Arc<DurableBuffer> {
        &self.buffer
    }

    pub async fn run(self: Arc<Self>, cancel_token: CancellationToken) {
        debug!("PUBSUB | Durable shipper started");

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    self.ship_pending().await;
                }
            }
        }

        // Last attempt before exit; whatever fails stays in the buffer.
        self.ship_pending().await;
        debug!("PUBSUB | Durable shipper stopped");
    }

    /// Publishes everything past the bookmark, one chunk of at most
    /// `BatchPostingLimit` records at a time, stopping at the first failure.
    pub async fn ship_pending(&self) -> CycleReport {
        let _guard = self.in_flight.lock().await;
        let limit = self.engine.assembler().max_count();
        let sideband = self.engine.sideband();

        let mut report = CycleReport {
            outcome: DeliveryOutcome::Success,
            delivered: 0,
            skipped: 0,
        };

        loop {
            let chunk = match self.buffer.read_pending(limit, None, sideband) {
                Ok(chunk) => chunk,
                Err(e) => {
                    error!("PUBSUB | Failed to read durable buffer: {}", e);
                    sideband.report_error(&format!("Failed to read durable buffer: {e}"), None);
                    report.outcome = DeliveryOutcome::Failure(e.to_string());
                    return report;
                }
            };

            if !chunk.is_empty() {
                let shipped = self.engine.ship(&chunk.records).await;
                report.delivered += shipped.delivered;
                report.skipped += shipped.skipped;
                if !shipped.outcome.is_success() {
                    debug!(
                        "PUBSUB | Publish failed, {} buffered records will be retried",
                        chunk.records.len()
                    );
                    report.outcome = shipped.outcome;
                    return report;
                }
            }

            // Also moves past chunks made only of corrupt lines.
            if let Some(position) = &chunk.position {
                if let Err(e) = self.buffer.advance(position) {
                    error!("PUBSUB | Failed to advance buffer bookmark: {}", e);
                    sideband.report_error(
                        &format!("Failed to advance buffer bookmark: {e}"),
                        None,
                    );
                    report.outcome = DeliveryOutcome::Failure(e.to_string());
                    return report;
                }
            }

            if chunk.records.len() < limit || chunk.position.is_none() {
                return report;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::SinkConfig;
    use crate::rotating_file::RotatingFileConfig;
    use crate::test_support::{config, RecordingPublisher};
    use std::path::Path;

    fn shipper_in(
        dir: &Path,
        prefix: &str,
        config: &SinkConfig,
        publisher: Arc<RecordingPublisher>,
    ) -> DurableShipper {
        let engine = Arc::new(DeliveryEngine::new(config, publisher, None).unwrap());
        let buffer =
            Arc::new(DurableBuffer::open(RotatingFileConfig::new(dir, prefix)).unwrap());
        DurableShipper::new(engine, buffer, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_ships_and_advances() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = Arc::new(RecordingPublisher::default());
        let shipper = shipper_in(dir.path(), "ship", &config(), publisher.clone());

        shipper.buffer().append("one").unwrap();
        shipper.buffer().append("two").unwrap();

        let report = shipper.ship_pending().await;
        assert_eq!(report.outcome, DeliveryOutcome::Success);
        assert_eq!(report.delivered, 2);
        assert!(shipper.buffer().read_bookmark().is_some());

        let again = shipper.ship_pending().await;
        assert_eq!(again.delivered, 0);
        assert_eq!(publisher.texts(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_failure_keeps_records_for_next_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = Arc::new(RecordingPublisher::failing_first(1));
        let shipper = shipper_in(dir.path(), "retry", &config(), publisher.clone());

        shipper.buffer().append("durable").unwrap();

        let failed = shipper.ship_pending().await;
        assert!(!failed.outcome.is_success());
        assert!(shipper.buffer().read_bookmark().is_none());

        let retried = shipper.ship_pending().await;
        assert_eq!(retried.outcome, DeliveryOutcome::Success);
        assert_eq!(retried.delivered, 1);
        assert_eq!(publisher.texts(), vec!["durable", "durable"]);
    }

    #[tokio::test]
    async fn test_ships_in_chunks_of_batch_posting_limit() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = Arc::new(RecordingPublisher::default());
        let config = SinkConfig {
            batch_posting_limit: 2,
            ..config()
        };
        let shipper = shipper_in(dir.path(), "chunks", &config, publisher.clone());

        for text in ["1", "2", "3", "4", "5"] {
            shipper.buffer().append(text).unwrap();
        }

        let report = shipper.ship_pending().await;
        assert_eq!(report.delivered, 5);
        assert_eq!(publisher.calls(), 3);
        assert_eq!(publisher.texts(), vec!["1", "2", "3", "4", "5"]);
    }

    #[tokio::test]
    async fn test_partial_failure_stops_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = Arc::new(RecordingPublisher {
            fail_from_call: Some(1),
            ..Default::default()
        });
        let config = SinkConfig {
            batch_posting_limit: 1,
            ..config()
        };
        let shipper = shipper_in(dir.path(), "partial", &config, publisher.clone());

        for text in ["a", "b", "c"] {
            shipper.buffer().append(text).unwrap();
        }

        let report = shipper.ship_pending().await;
        assert!(!report.outcome.is_success());
        assert_eq!(report.delivered, 1);
        assert_eq!(publisher.calls(), 2);

        let pending = shipper
            .buffer()
            .read_pending(10, None, shipper.engine.sideband())
            .unwrap();
        assert_eq!(pending.records, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_run_ships_before_exit() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = Arc::new(RecordingPublisher::default());
        let shipper = Arc::new(shipper_in(dir.path(), "exit", &config(), publisher.clone()));

        shipper.buffer().append("final").unwrap();
        let cancel_token = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&shipper).run(cancel_token.clone()));
        cancel_token.cancel();
        task.await.unwrap();

        assert_eq!(publisher.texts(), vec!["final"]);
    }
}
