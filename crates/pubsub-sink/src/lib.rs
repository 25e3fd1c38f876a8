// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! At-least-once delivery of log records to a Pub/Sub topic.
//!
//! Records enter through [`PubSubSink::emit`], are formatted once, and then
//! take one of two paths:
//!
//! - periodic mode: an in-memory queue shipped every `Period`
//!   ([`periodic::PeriodicShipper`]);
//! - durable mode: an on-disk buffer shipped every `BufferLogShippingInterval`
//!   and tracked with a bookmark ([`buffer::DurableBuffer`],
//!   [`durable::DurableShipper`]).
//!
//! Both paths publish through the same [`DeliveryEngine`], which encodes,
//! batches and hands batches to a [`Publisher`]. Failures never reach the
//! caller; they are logged with `tracing` and optionally written to the
//! error sideband ([`sideband::Sideband`]).

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batch;
pub mod buffer;
pub mod codec;
pub mod config;
pub mod durable;
pub mod engine;
pub mod error;
pub mod periodic;
pub mod publisher;
pub mod record;
pub mod rotating_file;
pub mod sideband;
pub mod sink;
pub mod token;

#[cfg(test)]
mod test_support;

pub use config::SinkConfig;
pub use engine::{DeliveryEngine, DeliveryOutcome, ShipReport};
pub use error::{BufferError, ConfigError, PublishError, SinkError};
pub use publisher::{HttpPublisher, HttpPublisherConfig, Publisher, RetryStrategy, TopicPath};
pub use record::{JsonFormatter, Level, RawFormatter, Record, RecordFormatter};
pub use sink::PubSubSink;
