// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Front-end of the crate: accepts records from the logging pipeline and
//! routes them to the periodic queue or to the durable buffer.

use crate::buffer::DurableBuffer;
use crate::config::SinkConfig;
use crate::durable::DurableShipper;
use crate::engine::{DeliveryEngine, DeliveryOutcome};
use crate::error::SinkError;
use crate::periodic::{PeriodicHandle, PeriodicShipper};
use crate::publisher::Publisher;
use crate::record::{Level, Record, RecordFormatter};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

enum Mode {
    Periodic(PeriodicHandle),
    Durable(Arc<DurableShipper>),
}

pub struct PubSubSink {
    engine: Arc<DeliveryEngine>,
    minimum_level: Option<Level>,
    mode: Mode,
    cancel_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for PubSubSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubSink")
            .field("engine", &self.engine)
            .field("minimum_level", &self.minimum_level)
            .field("durable", &self.is_durable())
            .finish_non_exhaustive()
    }
}

impl PubSubSink {
    /// Builds the engine and spawns the shipper for the configured mode on
    /// the current tokio runtime.
    pub fn start(
        config: &SinkConfig,
        publisher: Arc<dyn Publisher>,
        formatter: Option<Arc<dyn RecordFormatter>>,
    ) -> Result<Self, SinkError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SinkError::Runtime(e.to_string()))?;
        let engine = Arc::new(DeliveryEngine::new(config, publisher, formatter)?);
        let cancel_token = CancellationToken::new();

        let (mode, task) = match config.buffer_file_config() {
            Some(buffer_config) => {
                let buffer = Arc::new(DurableBuffer::open(buffer_config)?);
                let shipper = Arc::new(DurableShipper::new(
                    Arc::clone(&engine),
                    buffer,
                    config.buffer_log_shipping_interval,
                ));
                let task = runtime.spawn(Arc::clone(&shipper).run(cancel_token.clone()));
                debug!("PUBSUB | Sink started in durable mode for {}", engine.topic());
                (Mode::Durable(shipper), task)
            }
            None => {
                let (service, handle) = PeriodicShipper::new(
                    Arc::clone(&engine),
                    config.period,
                    config.queue_limit,
                    cancel_token.clone(),
                );
                let task = runtime.spawn(service.run());
                debug!("PUBSUB | Sink started in periodic mode for {}", engine.topic());
                (Mode::Periodic(handle), task)
            }
        };

        Ok(PubSubSink {
            engine,
            minimum_level: config.minimum_log_event_level,
            mode,
            cancel_token,
            task: Some(task),
        })
    }

    pub fn minimum_level(&self) -> Option<Level> {
        self.minimum_level
    }

    pub fn engine(&self) -> &Arc<DeliveryEngine> {
        &self.engine
    }

    pub fn is_durable(&self) -> bool {
        matches!(self.mode, Mode::Durable(_))
    }

    /// Hands one record to the sink. Never fails; problems are logged and,
    /// when enabled, written to the error sideband.
    pub fn emit(&self, record: &Record) {
        if self.minimum_level.is_some_and(|min| record.level < min) {
            return;
        }
        let text = self.engine.format(record);

        match &self.mode {
            Mode::Periodic(handle) => {
                if handle.emit(text).is_err() {
                    warn!("PUBSUB | Periodic shipper is stopped, record dropped");
                }
            }
            Mode::Durable(shipper) => {
                if let Err(e) = shipper.buffer().append(&text) {
                    error!("PUBSUB | Failed to write record to durable buffer: {}", e);
                    self.engine.sideband().report_error(
                        &format!("Failed to write record to durable buffer: {e}"),
                        Some(&[text]),
                    );
                }
            }
        }
    }

    /// Ships what is pending now instead of waiting for the next interval.
    pub async fn flush(&self) -> DeliveryOutcome {
        match &self.mode {
            Mode::Periodic(handle) => match handle.flush().await {
                Ok(response) => response.outcome,
                Err(e) => DeliveryOutcome::Failure(e),
            },
            Mode::Durable(shipper) => shipper.ship_pending().await.outcome,
        }
    }

    /// Stops the shipper after one last shipping attempt.
    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("PUBSUB | Shipper task ended abnormally: {}", e);
            }
        }
        if let Mode::Durable(shipper) = &self.mode {
            if let Err(e) = shipper.buffer().flush() {
                warn!("PUBSUB | Failed to flush durable buffer: {}", e);
            }
        }
    }
}

impl Drop for PubSubSink {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
