// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery engine: the codec, the batch assembler and the sideband wired to
//! one publisher and one topic.
//!
//! # Reliability Contract
//!
//! [`DeliveryEngine::publish`] and [`DeliveryEngine::publish_async`] always
//! return a [`DeliveryOutcome`]. Publisher errors and publisher panics both
//! become [`DeliveryOutcome::Failure`]; nothing is raised to the caller.
//!
//! The engine keeps no state between calls and schedules no retries. Whoever
//! drives it (the periodic or the durable shipper) decides what to do with a
//! failed batch.

use crate::batch::{Batch, BatchAssembler};
use crate::codec::{MessageCodec, WireMessage};
use crate::config::SinkConfig;
use crate::error::SinkError;
use crate::publisher::{Publisher, TopicPath};
use crate::record::{RawFormatter, Record, RecordFormatter};
use crate::sideband::Sideband;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use tokio::runtime::Runtime;
use tracing::debug;

/// All-or-nothing result of one publish attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    Failure(String),
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Success)
    }
}

/// Outcome of shipping a sequence of formatted records as one or more batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipReport {
    pub outcome: DeliveryOutcome,
    /// Messages accepted by the endpoint.
    pub delivered: usize,
    /// Messages dropped for exceeding the batch byte limit.
    pub skipped: usize,
    /// Texts of the failed batch and every batch after it, in order.
    pub unsent: Vec<String>,
}

pub struct DeliveryEngine {
    topic: TopicPath,
    codec: MessageCodec,
    assembler: BatchAssembler,
    sideband: Sideband,
    publisher: Arc<dyn Publisher>,
    // Only built when the blocking entry point is used.
    runtime: OnceLock<Result<Runtime, String>>,
}

impl std::fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("topic", &self.topic)
            .field("assembler", &self.assembler)
            .finish_non_exhaustive()
    }
}

impl DeliveryEngine {
    /// Validates `config` and builds the engine. Invalid configuration is the
    /// only error this type ever returns.
    pub fn new(
        config: &SinkConfig,
        publisher: Arc<dyn Publisher>,
        formatter: Option<Arc<dyn RecordFormatter>>,
    ) -> Result<Self, SinkError> {
        config.validate()?;

        let formatter = formatter.unwrap_or_else(|| Arc::new(RawFormatter));
        let codec = MessageCodec::new(
            formatter,
            config.message_data_to_base64,
            config.message_attr_fixed.clone(),
            config.event_field_separator.clone(),
            config.min_value_attr(),
        );
        let assembler = BatchAssembler::new(config.batch_posting_limit, config.batch_size_limit_bytes);
        let sideband = Sideband::new(config.error_file_config(), config.sideband_flags())?;

        Ok(DeliveryEngine {
            topic: TopicPath::new(config.project_id.trim(), config.topic_id.trim()),
            codec,
            assembler,
            sideband,
            publisher,
            runtime: OnceLock::new(),
        })
    }

    pub fn topic(&self) -> &TopicPath {
        &self.topic
    }

    pub fn formatter(&self) -> &Arc<dyn RecordFormatter> {
        self.codec.formatter()
    }

    pub fn codec(&self) -> &MessageCodec {
        &self.codec
    }

    pub fn assembler(&self) -> &BatchAssembler {
        &self.assembler
    }

    pub fn sideband(&self) -> &Sideband {
        &self.sideband
    }

    /// Encodes each string in order. An empty input yields an empty output.
    pub fn to_wire_messages(&self, records: &[String]) -> Vec<WireMessage> {
        records.iter().map(|text| self.codec.encode(text)).collect()
    }

    pub fn format(&self, record: &Record) -> String {
        self.codec.formatter().format(record)
    }

    /// Publishes `messages` as a single batch, blocking the calling thread.
    ///
    /// Safe to call from inside an async context: the publish then runs on a
    /// helper thread so the caller's runtime is never blocked re-entrantly.
    pub fn publish(&self, messages: Vec<WireMessage>) -> DeliveryOutcome {
        let runtime = match self.runtime() {
            Ok(runtime) => runtime,
            Err(e) => return self.failed(&messages, &e),
        };

        if tokio::runtime::Handle::try_current().is_err() {
            return runtime.block_on(self.publish_async(messages));
        }

        std::thread::scope(|scope| {
            scope
                .spawn(|| runtime.block_on(self.publish_async(messages)))
                .join()
        })
        .unwrap_or_else(|panic| DeliveryOutcome::Failure(panic_message(&*panic)))
    }

    /// Publishes `messages` as a single batch. Suspends only while the
    /// publisher call is outstanding.
    pub async fn publish_async(&self, messages: Vec<WireMessage>) -> DeliveryOutcome {
        if messages.is_empty() {
            return DeliveryOutcome::Success;
        }
        let mut batch = Batch::new(messages);
        if let Some((name, value)) = self.codec.batch_attribute(&batch.messages) {
            batch.attributes.insert(name, value);
        }
        self.publish_batch(&batch).await
    }

    /// Assembles `texts` into batches and publishes them in order, stopping at
    /// the first failed batch.
    pub async fn ship(&self, texts: &[String]) -> ShipReport {
        let assembly = self.assembler.assemble(
            self.to_wire_messages(texts),
            &self.codec,
            &self.sideband,
        );

        let mut delivered = 0;
        let mut batches = assembly.batches.into_iter();
        while let Some(batch) = batches.next() {
            match self.publish_batch(&batch).await {
                DeliveryOutcome::Success => delivered += batch.len(),
                failure => {
                    let unsent = std::iter::once(batch)
                        .chain(batches)
                        .flat_map(|b| b.messages)
                        .filter_map(|m| self.codec.decode(&m))
                        .collect();
                    return ShipReport {
                        outcome: failure,
                        delivered,
                        skipped: assembly.skipped.len(),
                        unsent,
                    };
                }
            }
        }

        ShipReport {
            outcome: DeliveryOutcome::Success,
            delivered,
            skipped: assembly.skipped.len(),
            unsent: Vec::new(),
        }
    }

    async fn publish_batch(&self, batch: &Batch) -> DeliveryOutcome {
        debug!(
            "PUBSUB | Publishing {} messages ({} bytes) to {}",
            batch.len(),
            batch.size_bytes(),
            self.topic
        );

        let result = AssertUnwindSafe(self.publisher.publish(&self.topic, batch))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(accepted)) => {
                debug!("PUBSUB | Endpoint accepted {} messages", accepted);
                if self.sideband.flags().debug_store_all {
                    self.sideband.report_debug(
                        &format!("Published {} messages to {}", batch.len(), self.topic),
                        Some(&self.decode_all(&batch.messages)),
                    );
                }
                DeliveryOutcome::Success
            }
            Ok(Err(e)) => self.failed(&batch.messages, &e.to_string()),
            Err(panic) => self.failed(&batch.messages, &panic_message(&*panic)),
        }
    }

    fn decode_all(&self, messages: &[WireMessage]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|m| self.codec.decode(m))
            .collect()
    }

    fn failed(&self, messages: &[WireMessage], reason: &str) -> DeliveryOutcome {
        let payload = self.decode_all(messages);
        self.sideband.report_error(
            &format!(
                "Failed to publish {} messages to {}: {}",
                messages.len(),
                self.topic,
                reason
            ),
            Some(&payload),
        );
        DeliveryOutcome::Failure(reason.to_string())
    }

    fn runtime(&self) -> Result<&Runtime, String> {
        self.runtime
            .get_or_init(|| {
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| SinkError::Runtime(e.to_string()).to_string())
            })
            .as_ref()
            .map_err(Clone::clone)
    }
}

impl Drop for DeliveryEngine {
    fn drop(&mut self) {
        // A runtime dropped inside another runtime panics; shut it down instead.
        if let Some(Ok(runtime)) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "publisher panicked".to_string()
    }
}
