// Copyright 2025 Tapline Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Sink Trait and Error Types
//!
//! A [`Sink`] receives the current full state of every forwarded document.
//! It holds no relay state of its own.
//!
//! # Write modes
//!
//! - [`WriteMode::Insert`] appends every forwarded document. A crash after
//!   the write but before the cursor is saved re-forwards the same document
//!   on restart, so the sink may see duplicates (at-least-once).
//! - [`WriteMode::UpsertByKey`] replaces the document matching the event's
//!   document key, inserting it if absent. Re-forwarding then converges to
//!   the same sink state.
//!
//! # Example
//!
//! ```rust
//! use tapline_core::sink::{MemorySink, Sink};
//! use bson::doc;
//!
//! # async fn example() -> Result<(), tapline_core::sink::SinkError> {
//! let mut sink = MemorySink::new();
//! sink.forward(&doc! { "_id": 1, "name": "Alice" }, Some(&doc! { "_id": 1 })).await?;
//! assert_eq!(sink.forwarded_count(), 1);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use thiserror::Error;

/// How forwarded documents are written to the sink collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Append every document.
    #[default]
    Insert,
    /// Replace by document key, inserting when absent.
    UpsertByKey,
}

impl std::str::FromStr for WriteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Ok(Self::Insert),
            "upsert" | "upsert-by-key" | "upsert_by_key" => Ok(Self::UpsertByKey),
            other => Err(format!("unknown write mode: {other}")),
        }
    }
}

/// Builds the filter that identifies a document for an upsert.
///
/// Uses the event's document key when available (it carries the shard key on
/// sharded collections), falling back to the document's own `_id`.
///
/// Returns `None` when neither is available.
#[must_use]
pub fn upsert_filter(document: &Document, document_key: Option<&Document>) -> Option<Document> {
    match document_key {
        Some(key) if !key.is_empty() => Some(key.clone()),
        _ => document.get("_id").map(|id: &Bson| doc! { "_id": id.clone() }),
    }
}

/// Errors that can occur when writing to a sink.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Connection to the sink failed.
    #[error("Connection error: {message}")]
    ConnectionError {
        /// Human-readable error message
        message: String,
        /// The underlying connection error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The write itself failed.
    #[error("Write error: {message}")]
    WriteError {
        /// Human-readable error message
        message: String,
        /// Whether this specific write error is retryable
        retryable: bool,
        /// The underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The document cannot be written in the configured mode.
    #[error("Invalid document: {message}")]
    InvalidDocument {
        /// Human-readable error message
        message: String,
    },
}

impl SinkError {
    /// Creates a connection error from any error type.
    #[must_use]
    pub fn connection(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::ConnectionError {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a write error with retryability information.
    #[must_use]
    pub fn write(source: impl std::error::Error + Send + Sync + 'static, retryable: bool) -> Self {
        Self::WriteError {
            message: source.to_string(),
            retryable,
            source: Some(Box::new(source)),
        }
    }

    /// Creates a write error with a custom message.
    #[must_use]
    pub fn write_msg(message: impl Into<String>, retryable: bool) -> Self {
        Self::WriteError {
            message: message.into(),
            retryable,
            source: None,
        }
    }

    /// Creates an invalid-document error.
    #[must_use]
    pub fn invalid_document(message: impl Into<String>) -> Self {
        Self::InvalidDocument {
            message: message.into(),
        }
    }

    /// Returns whether restarting the relay may get past this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionError { .. } => true,
            Self::WriteError { retryable, .. } => *retryable,
            Self::InvalidDocument { .. } => false,
        }
    }
}

/// Destination for forwarded documents.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Writes the current full state of a document.
    ///
    /// `document_key` is the event's document key, used by key-aware write
    /// modes.
    ///
    /// # Errors
    ///
    /// Returns an error if the document could not be written. The relay
    /// treats any error as fatal and does not advance the cursor.
    async fn forward(
        &mut self,
        document: &Document,
        document_key: Option<&Document>,
    ) -> Result<(), SinkError>;

    /// Releases any resources held by the sink.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot shut down cleanly.
    async fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Short name for logs, e.g. "mongodb".
    fn name(&self) -> &str {
        "sink"
    }
}

/// An in-memory sink for tests and local runs.
///
/// Honors [`WriteMode`]: in upsert mode a document with an existing key
/// replaces the earlier one.
#[derive(Debug, Default)]
pub struct MemorySink {
    mode: WriteMode,
    documents: Vec<Document>,
    forward_calls: usize,
    fail_after: Option<usize>,
}

impl MemorySink {
    /// Creates an empty insert-mode sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty sink with the given write mode.
    #[must_use]
    pub fn with_mode(mode: WriteMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Fails every write after the first `successful` ones.
    #[must_use]
    pub const fn failing_after(mut self, successful: usize) -> Self {
        self.fail_after = Some(successful);
        self
    }

    /// Documents currently held, in write order.
    #[must_use]
    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    /// Number of documents currently held.
    #[must_use]
    pub fn forwarded_count(&self) -> usize {
        self.documents.len()
    }

    /// Number of `forward` calls, including failed ones.
    #[must_use]
    pub const fn forward_calls(&self) -> usize {
        self.forward_calls
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn forward(
        &mut self,
        document: &Document,
        document_key: Option<&Document>,
    ) -> Result<(), SinkError> {
        self.forward_calls += 1;

        if let Some(limit) = self.fail_after {
            if self.forward_calls > limit {
                return Err(SinkError::write_msg("simulated sink failure", true));
            }
        }

        match self.mode {
            WriteMode::Insert => self.documents.push(document.clone()),
            WriteMode::UpsertByKey => {
                let filter = upsert_filter(document, document_key).ok_or_else(|| {
                    SinkError::invalid_document("upsert requires a document key or _id")
                })?;
                let existing = self
                    .documents
                    .iter()
                    .position(|d| filter.iter().all(|(k, v)| d.get(k) == Some(v)));
                match existing {
                    Some(index) => self.documents[index] = document.clone(),
                    None => self.documents.push(document.clone()),
                }
            }
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_mode_parsing() {
        assert_eq!("insert".parse::<WriteMode>().unwrap(), WriteMode::Insert);
        assert_eq!("UPSERT".parse::<WriteMode>().unwrap(), WriteMode::UpsertByKey);
        assert_eq!(
            "upsert-by-key".parse::<WriteMode>().unwrap(),
            WriteMode::UpsertByKey
        );
        assert!("merge".parse::<WriteMode>().is_err());
        assert_eq!(WriteMode::default(), WriteMode::Insert);
    }

    #[test]
    fn test_upsert_filter_prefers_document_key() {
        let document = doc! { "_id": 1, "region": "eu", "v": 3 };
        let key = doc! { "_id": 1, "region": "eu" };

        assert_eq!(upsert_filter(&document, Some(&key)), Some(key.clone()));
        assert_eq!(upsert_filter(&document, None), Some(doc! { "_id": 1 }));
        assert_eq!(
            upsert_filter(&document, Some(&Document::new())),
            Some(doc! { "_id": 1 })
        );
        assert_eq!(upsert_filter(&doc! { "v": 1 }, None), None);
    }

    #[tokio::test]
    async fn test_memory_sink_insert_keeps_duplicates() {
        let mut sink = MemorySink::new();
        let document = doc! { "_id": 1, "v": 1 };

        sink.forward(&document, None).await.unwrap();
        sink.forward(&document, None).await.unwrap();

        assert_eq!(sink.forwarded_count(), 2);
    }

    #[tokio::test]
    async fn test_memory_sink_upsert_replaces_by_key() {
        let mut sink = MemorySink::with_mode(WriteMode::UpsertByKey);
        let key = doc! { "_id": 1 };

        sink.forward(&doc! { "_id": 1, "v": 1 }, Some(&key)).await.unwrap();
        sink.forward(&doc! { "_id": 1, "v": 2 }, Some(&key)).await.unwrap();
        sink.forward(&doc! { "_id": 2, "v": 1 }, None).await.unwrap();

        assert_eq!(
            sink.documents(),
            &[doc! { "_id": 1, "v": 2 }, doc! { "_id": 2, "v": 1 }]
        );
    }

    #[tokio::test]
    async fn test_memory_sink_upsert_without_key_fails() {
        let mut sink = MemorySink::with_mode(WriteMode::UpsertByKey);
        let err = sink.forward(&doc! { "v": 1 }, None).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_memory_sink_failure_injection() {
        let mut sink = MemorySink::new().failing_after(1);

        sink.forward(&doc! { "_id": 1 }, None).await.unwrap();
        let err = sink.forward(&doc! { "_id": 2 }, None).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(sink.forwarded_count(), 1);
        assert_eq!(sink.forward_calls(), 2);
    }
}
