// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The publish capability the delivery engine sends batches through, and its
//! HTTP implementation against the Pub/Sub REST API.

use crate::batch::Batch;
use crate::error::PublishError;
use crate::token::TokenFactory;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

pub const DEFAULT_ENDPOINT: &str = "https://pubsub.googleapis.com";

/// Fully qualified destination topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPath {
    pub project_id: String,
    pub topic_id: String,
}

impl TopicPath {
    pub fn new(project_id: impl Into<String>, topic_id: impl Into<String>) -> Self {
        TopicPath {
            project_id: project_id.into(),
            topic_id: topic_id.into(),
        }
    }
}

impl fmt::Display for TopicPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "projects/{}/topics/{}", self.project_id, self.topic_id)
    }
}

/// Delivers one batch to a topic. Returns the number of accepted messages.
///
/// Implementations own authentication, connection reuse and transport-level
/// retries. Acceptance is all-or-nothing per batch.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &TopicPath, batch: &Batch) -> Result<usize, PublishError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Up to `n` attempts back to back.
    Immediate(u64),
    /// Up to `n` attempts, sleeping `delay_ms` between them.
    LinearBackoff(u64, u64),
}

impl RetryStrategy {
    fn attempts(&self) -> u64 {
        match self {
            RetryStrategy::Immediate(n) | RetryStrategy::LinearBackoff(n, _) => (*n).max(1),
        }
    }
}

#[derive(Debug, Serialize)]
struct PublishRequest<'a> {
    messages: Vec<PubsubMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct PubsubMessage<'a> {
    data: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    attributes: HashMap<&'a str, &'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct HttpPublisherConfig {
    pub endpoint: String,
    pub token_factory: Arc<TokenFactory>,
    pub https_proxy: Option<String>,
    pub timeout: Duration,
    pub retry_strategy: RetryStrategy,
}

#[derive(Debug, Clone)]
pub struct HttpPublisher {
    client: reqwest::Client,
    endpoint: String,
    token_factory: Arc<TokenFactory>,
    retry_strategy: RetryStrategy,
}

impl HttpPublisher {
    #[must_use]
    pub fn new(config: HttpPublisherConfig) -> Self {
        HttpPublisher {
            client: build_client(config.https_proxy.as_deref(), config.timeout),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            token_factory: config.token_factory,
            retry_strategy: config.retry_strategy,
        }
    }

    fn url(&self, topic: &TopicPath) -> String {
        format!("{}/v1/{}:publish", self.endpoint, topic)
    }

    fn body(batch: &Batch) -> PublishRequest<'_> {
        let messages = batch
            .messages
            .iter()
            .map(|message| {
                let mut attributes: HashMap<&str, &str> = batch
                    .attributes
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str()))
                    .collect();
                attributes.extend(
                    message
                        .attributes
                        .iter()
                        .map(|(k, v)| (k.as_str(), v.as_str())),
                );
                PubsubMessage {
                    data: STANDARD.encode(&message.data),
                    attributes,
                }
            })
            .collect();
        PublishRequest { messages }
    }

    async fn try_publish(
        &self,
        url: &str,
        body: &PublishRequest<'_>,
    ) -> Result<usize, PublishError> {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = self.token_factory.get_token().await? {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Status { status, body });
        }

        let parsed: PublishResponse = response
            .json()
            .await
            .map_err(|e| PublishError::Payload(e.to_string()))?;
        Ok(parsed.message_ids.len())
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, topic: &TopicPath, batch: &Batch) -> Result<usize, PublishError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let url = self.url(topic);
        let body = Self::body(batch);
        let attempts = self.retry_strategy.attempts();

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_publish(&url, &body).await {
                Ok(accepted) => {
                    debug!(
                        "PUBSUB | Published {} messages to {} ({} accepted)",
                        batch.len(),
                        topic,
                        accepted
                    );
                    return Ok(accepted);
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        "PUBSUB | Publish attempt {}/{} to {} failed, retrying: {}",
                        attempt, attempts, topic, e
                    );
                    if let RetryStrategy::LinearBackoff(_, delay_ms) = self.retry_strategy {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                }
                Err(e) => {
                    error!(
                        "PUBSUB | Publish to {} failed after {} attempts: {}",
                        topic, attempt, e
                    );
                    return Err(e);
                }
            }
        }
    }
}

/// Builds the HTTP client, falling back to a direct connection when the proxy
/// setting cannot be used.
fn build_client(https_proxy: Option<&str>, timeout: Duration) -> reqwest::Client {
    let builder = reqwest::Client::builder().timeout(timeout);
    let with_proxy = match https_proxy {
        Some(proxy) => reqwest::Proxy::https(proxy).map(|p| builder.proxy(p)),
        None => Ok(builder),
    };

    let result = match with_proxy {
        Ok(builder) => builder.build(),
        Err(e) => {
            error!(
                "PUBSUB | Unable to parse proxy configuration: {}, falling back to direct connection",
                e
            );
            reqwest::Client::builder().timeout(timeout).build()
        }
    };

    match result {
        Ok(client) => client,
        Err(e) => {
            error!(
                "PUBSUB | Failed to build HTTP client: {}, using reqwest defaults",
                e
            );
            reqwest::Client::new()
        }
    }
}
