// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::PublishError;
use std::fmt::Debug;
use std::sync::Arc;
use std::{future::Future, pin::Pin};
use tokio::sync::OnceCell;

pub type TokenResolverFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Option<String>> + Send>> + Send + Sync>;

/// Source of the bearer token sent with publish requests.
///
/// A dynamic token is resolved on first use and cached. A resolver that
/// returns `None` is retried on the next call.
#[derive(Clone)]
pub enum TokenFactory {
    /// No `Authorization` header, e.g. for the Pub/Sub emulator.
    Anonymous,
    Static(String),
    Dynamic {
        resolver_fn: TokenResolverFn,
        token: Arc<OnceCell<String>>,
    },
}

impl TokenFactory {
    pub fn new_from_resolver(resolver_fn: TokenResolverFn) -> Self {
        Self::Dynamic {
            resolver_fn,
            token: Arc::new(OnceCell::new()),
        }
    }

    pub fn new_from_static_token(token: &str) -> Self {
        Self::Static(token.to_string())
    }

    /// `Ok(None)` means no token is needed.
    pub async fn get_token(&self) -> Result<Option<&str>, PublishError> {
        match self {
            Self::Anonymous => Ok(None),
            Self::Static(token) => Ok(Some(token.as_str())),
            Self::Dynamic { resolver_fn, token } => token
                .get_or_try_init(|| async { (resolver_fn)().await.ok_or(PublishError::Token) })
                .await
                .map(|t| Some(t.as_str())),
        }
    }
}

impl Debug for TokenFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TokenFactory")
    }
}
