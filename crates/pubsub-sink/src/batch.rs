// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Grouping of wire messages into count- and size-bounded batches.
//!
//! # Batching Rules
//!
//! Messages are taken in arrival order. A batch is closed when the next
//! message would push it past `max_count` entries or `max_bytes` bytes, and
//! the message opens the next batch. A message that alone exceeds
//! `max_bytes` can never be delivered: it goes to `skipped` and into no batch.

use crate::codec::{MessageCodec, WireMessage};
use crate::sideband::Sideband;
use std::collections::HashMap;

/// Messages delivered in one publish call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub messages: Vec<WireMessage>,
    /// Attributes that apply to the batch as a whole.
    pub attributes: HashMap<String, String>,
    size_bytes: usize,
}

impl Batch {
    pub fn new(messages: Vec<WireMessage>) -> Self {
        let size_bytes = messages.iter().map(WireMessage::serialized_size).sum();
        Batch {
            messages,
            attributes: HashMap::new(),
            size_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    fn push(&mut self, message: WireMessage) {
        self.size_bytes += message.serialized_size();
        self.messages.push(message);
    }
}

/// Result of one assembly pass.
#[derive(Debug, Default)]
pub struct Assembly {
    pub batches: Vec<Batch>,
    pub skipped: Vec<WireMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchAssembler {
    max_count: usize,
    max_bytes: Option<usize>,
}

impl BatchAssembler {
    /// `max_count` below 1 is treated as 1; configuration validation rejects
    /// it long before it gets here.
    pub fn new(max_count: usize, max_bytes: Option<usize>) -> Self {
        BatchAssembler {
            max_count: max_count.max(1),
            max_bytes,
        }
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    pub fn max_bytes(&self) -> Option<usize> {
        self.max_bytes
    }

    pub fn assemble(
        &self,
        pending: Vec<WireMessage>,
        codec: &MessageCodec,
        sideband: &Sideband,
    ) -> Assembly {
        let mut assembly = Assembly::default();
        let mut current = Batch::default();

        for message in pending {
            let size = message.serialized_size();

            if self.max_bytes.is_some_and(|limit| size > limit) {
                let text = codec.decode(&message).unwrap_or_default();
                sideband.report_event_skip(
                    &format!(
                        "Event skipped: size {} bytes exceeds batch size limit {} bytes",
                        size,
                        self.max_bytes.unwrap_or_default()
                    ),
                    Some(&[text]),
                );
                assembly.skipped.push(message);
                continue;
            }

            let over_count = current.len() + 1 > self.max_count;
            let over_bytes = self
                .max_bytes
                .is_some_and(|limit| current.size_bytes() + size > limit);

            if !current.is_empty() && (over_count || over_bytes) {
                sideband.report_overflow(
                    "Batch limits reached, starting a new batch",
                    current.len(),
                    self.max_count,
                    current.size_bytes(),
                    self.max_bytes,
                );
                assembly.batches.push(self.close(current, codec));
                current = Batch::default();
            }

            current.push(message);
        }

        if !current.is_empty() {
            assembly.batches.push(self.close(current, codec));
        }
        assembly
    }

    fn close(&self, mut batch: Batch, codec: &MessageCodec) -> Batch {
        if let Some((name, value)) = codec.batch_attribute(&batch.messages) {
            batch.attributes.insert(name, value);
        }
        batch
    }
}
