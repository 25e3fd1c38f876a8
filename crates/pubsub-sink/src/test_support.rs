// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(clippy::unwrap_used)]

use crate::batch::Batch;
use crate::config::SinkConfig;
use crate::error::PublishError;
use crate::publisher::{Publisher, TopicPath};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::StatusCode;
use std::sync::Mutex;

/// Records every batch it is handed and answers with a canned result.
#[derive(Debug, Default)]
pub(crate) struct RecordingPublisher {
    pub batches: Mutex<Vec<Batch>>,
    /// Calls with this index and later fail.
    pub fail_from_call: Option<usize>,
    /// The first `n` calls fail.
    pub fail_first_calls: usize,
}

impl RecordingPublisher {
    pub fn failing_first(calls: usize) -> Self {
        RecordingPublisher {
            fail_first_calls: calls,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    /// Payload texts of every batch received, base64 decoded where possible.
    pub fn texts(&self) -> Vec<String> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|batch| batch.messages.iter())
            .map(|message| {
                let data = STANDARD
                    .decode(&message.data)
                    .unwrap_or_else(|_| message.data.clone());
                String::from_utf8(data).unwrap()
            })
            .collect()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, _topic: &TopicPath, batch: &Batch) -> Result<usize, PublishError> {
        let mut batches = self.batches.lock().unwrap();
        let call = batches.len();
        batches.push(batch.clone());
        let fails = call < self.fail_first_calls || self.fail_from_call.is_some_and(|n| call >= n);
        if fails {
            return Err(PublishError::Status {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: "unavailable".to_string(),
            });
        }
        Ok(batch.len())
    }
}

pub(crate) struct PanickingPublisher;

#[async_trait]
impl Publisher for PanickingPublisher {
    async fn publish(&self, _topic: &TopicPath, _batch: &Batch) -> Result<usize, PublishError> {
        panic!("connection pool exploded");
    }
}

pub(crate) fn config() -> SinkConfig {
    SinkConfig {
        project_id: "my-project".to_string(),
        topic_id: "app-logs".to_string(),
        ..Default::default()
    }
}

pub(crate) fn texts(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
