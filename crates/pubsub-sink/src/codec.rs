// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Conversion of records and raw strings into wire messages.
//!
//! The codec is a pure transformation: it holds only immutable configuration
//! and may be shared freely between threads.

use crate::record::{Record, RecordFormatter};
use base64::{engine::general_purpose::STANDARD, Engine};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// A message ready to be published: payload bytes plus string attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    /// Value of the configured minimum-value field, extracted before encoding.
    pub(crate) min_field: Option<String>,
}

impl WireMessage {
    pub fn new(data: Vec<u8>) -> Self {
        WireMessage {
            data,
            attributes: HashMap::new(),
            min_field: None,
        }
    }

    /// Size counted against the batch byte limit: payload plus every
    /// attribute key and value.
    pub fn serialized_size(&self) -> usize {
        self.data.len()
            + self
                .attributes
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

/// Parsed `MessageAttrMinValue` option, written as `<fieldIndex>#<attributeName>`.
///
/// The attribute carries the smallest value of the selected field across the
/// batch. Two values that both parse as `f64` compare numerically, so `"9"` is
/// below `"10"`. Any other pair compares as strings, so `"abc"` is below `"b"`
/// and a numeric `"10"` is below `"x"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinValueAttr {
    pub field_index: usize,
    pub name: String,
}

impl MinValueAttr {
    /// Returns `None` for anything malformed; the attribute is then never set.
    pub fn parse(value: &str) -> Option<Self> {
        let (index, name) = value.split_once('#')?;
        let field_index = index.trim().parse::<usize>().ok()?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some(MinValueAttr {
            field_index,
            name: name.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct MessageCodec {
    formatter: Arc<dyn RecordFormatter>,
    data_to_base64: bool,
    fixed_attributes: HashMap<String, String>,
    field_separator: Option<String>,
    min_value_attr: Option<MinValueAttr>,
}

impl MessageCodec {
    pub fn new(
        formatter: Arc<dyn RecordFormatter>,
        data_to_base64: bool,
        fixed_attributes: HashMap<String, String>,
        field_separator: Option<String>,
        min_value_attr: Option<MinValueAttr>,
    ) -> Self {
        MessageCodec {
            formatter,
            data_to_base64,
            fixed_attributes,
            field_separator,
            min_value_attr,
        }
    }

    pub fn formatter(&self) -> &Arc<dyn RecordFormatter> {
        &self.formatter
    }

    /// Formats the record with the configured formatter and encodes the text.
    pub fn encode_record(&self, record: &Record) -> WireMessage {
        self.encode(&self.formatter.format(record))
    }

    pub fn encode(&self, text: &str) -> WireMessage {
        let data = if self.data_to_base64 {
            STANDARD.encode(text.as_bytes()).into_bytes()
        } else {
            text.as_bytes().to_vec()
        };

        WireMessage {
            data,
            attributes: self.fixed_attributes.clone(),
            min_field: self.extract_min_field(text),
        }
    }

    /// Recovers the text a message was encoded from.
    pub fn decode(&self, message: &WireMessage) -> Option<String> {
        let bytes = if self.data_to_base64 {
            STANDARD.decode(&message.data).ok()?
        } else {
            message.data.clone()
        };
        String::from_utf8(bytes).ok()
    }

    /// Minimum of the configured field across `messages`, as the
    /// `(attribute name, value)` pair to attach to their batch.
    pub fn batch_attribute(&self, messages: &[WireMessage]) -> Option<(String, String)> {
        let attr = self.min_value_attr.as_ref()?;
        let min = messages
            .iter()
            .filter_map(|m| m.min_field.as_deref())
            .min_by(|a, b| compare_field_values(a, b))?;
        Some((attr.name.clone(), min.to_string()))
    }

    fn extract_min_field(&self, text: &str) -> Option<String> {
        let attr = self.min_value_attr.as_ref()?;
        let separator = self.field_separator.as_deref().filter(|s| !s.is_empty())?;
        if !text.contains(separator) {
            return None;
        }
        text.split(separator)
            .nth(attr.field_index)
            .map(str::to_string)
    }
}

/// Numeric comparison when both sides parse as numbers, string comparison otherwise.
fn compare_field_values(a: &str, b: &str) -> Ordering {
    match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or_else(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}
