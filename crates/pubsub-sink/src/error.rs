// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the Pub/Sub sink.
//!
//! Only [`ConfigError`] ever escapes to a caller as a hard failure, and only at
//! construction time. Publish failures are folded into
//! [`DeliveryOutcome`](crate::engine::DeliveryOutcome) and buffer failures are
//! logged and reported to the sideband.

use reqwest::StatusCode;

/// Invalid sink configuration. Raised once, when the sink is built.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required option: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {option}: {reason}")]
    Invalid {
        option: &'static str,
        reason: String,
    },

    #[error("Rotating logs '{first}' and '{second}' share a file name prefix in {dir}")]
    PrefixCollision {
        dir: String,
        first: String,
        second: String,
    },
}

/// Failure of a single publish call against the remote endpoint.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Publish request rejected with status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Failed to resolve access token")]
    Token,

    #[error("Invalid publish response: {0}")]
    Payload(String),
}

impl PublishError {
    /// Whether a later attempt of the same request can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            PublishError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            PublishError::Transport(_) => true,
            PublishError::Token | PublishError::Payload(_) => false,
        }
    }
}

/// Failure reading or writing a rotating log or its bookmark.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt bookmark {path}: {content}")]
    Bookmark { path: String, content: String },

    #[error("File name prefix '{0}' is already in use by another rotating log")]
    PrefixInUse(String),
}

impl BufferError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        BufferError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Top-level error of the crate surface.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("Failed to start async runtime: {0}")]
    Runtime(String),
}
