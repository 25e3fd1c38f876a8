// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc, time::Duration};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use pubsub_sink::{
    token::TokenFactory, HttpPublisher, HttpPublisherConfig, JsonFormatter, Level, PubSubSink,
    RawFormatter, Record, RecordFormatter, RetryStrategy, SinkConfig,
};

const PUBLISH_RETRY_DELAY_MS: u64 = 100;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("PUBSUB_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match SinkConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Error creating config on pubsub forwarder startup: {e}");
            return;
        }
    };

    let token_factory = match config.access_token.as_deref() {
        Some(token) => TokenFactory::new_from_static_token(token),
        None => TokenFactory::Anonymous,
    };
    let publisher = HttpPublisher::new(HttpPublisherConfig {
        endpoint: config.endpoint.clone(),
        token_factory: Arc::new(token_factory),
        https_proxy: config.https_proxy.clone(),
        timeout: config.publish_timeout(),
        retry_strategy: RetryStrategy::LinearBackoff(config.publish_retries, PUBLISH_RETRY_DELAY_MS),
    });

    let formatter: Arc<dyn RecordFormatter> = match env::var("PUBSUB_FORMAT") {
        Ok(format) if format.eq_ignore_ascii_case("json") => Arc::new(JsonFormatter),
        _ => Arc::new(RawFormatter),
    };

    let sink = match PubSubSink::start(&config, Arc::new(publisher), Some(formatter)) {
        Ok(sink) => sink,
        Err(e) => {
            error!("Error starting pubsub sink: {e}");
            return;
        }
    };
    info!(
        "Forwarding stdin to {} ({} mode)",
        sink.engine().topic(),
        if sink.is_durable() { "durable" } else { "periodic" }
    );

    let mut lines = BufReader::new(io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !line.trim().is_empty() {
                        sink.emit(&parse_line(&line));
                    }
                }
                Ok(None) => {
                    debug!("End of input reached");
                    break;
                }
                Err(e) => {
                    error!("Failed to read from stdin: {e}");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, flushing pending records");
                break;
            }
        }
    }

    if tokio::time::timeout(Duration::from_secs(30), sink.shutdown())
        .await
        .is_err()
    {
        error!("Timed out while flushing pending records");
    }
}

/// `[WRN] disk almost full` becomes a warning; lines without a level tag are
/// informational.
fn parse_line(line: &str) -> Record {
    let tagged = line
        .strip_prefix('[')
        .and_then(|rest| rest.split_once(']'))
        .and_then(|(tag, message)| Some((tag.parse::<Level>().ok()?, message.trim_start())));

    match tagged {
        Some((level, message)) => Record::new(level, message),
        None => Record::new(Level::Information, line),
    }
}
