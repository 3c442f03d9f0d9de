//! MongoDB Change Event Representation
//!
//! This module defines the event type the relay reads from a change feed.
//! Only the fields the relay needs survive the feed's server-side projection:
//! the operation kind, the namespace, the document key, the full current
//! document and the position token.
//!
//! # Examples
//!
//! ```rust
//! use tapline_core::event::{ChangeEvent, Namespace, OperationType};
//! use bson::doc;
//!
//! let event = ChangeEvent {
//!     operation: OperationType::Insert,
//!     namespace: Namespace::new("db1", "inputChangeStream"),
//!     document_key: Some(doc! { "_id": 123 }),
//!     full_document: Some(doc! { "_id": 123, "name": "Alice" }),
//!     cluster_time: None,
//!     resume_token: doc! { "_data": "token123" },
//! };
//!
//! assert!(event.operation.is_forwardable());
//! assert_eq!(event.collection_name(), "inputChangeStream");
//! assert!(event.forwardable_document().is_some());
//! ```

use bson::Document;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error that can occur when converting from MongoDB driver's `ChangeStreamEvent`.
#[derive(Debug, Clone)]
pub enum ConversionError {
    /// Failed to convert the position token to a BSON document
    ResumeTokenConversion(String),
}

impl fmt::Display for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionError::ResumeTokenConversion(msg) => {
                write!(f, "Failed to convert resume token: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConversionError {}

/// MongoDB change stream operation types.
///
/// The `Unknown` variant keeps operation kinds introduced by newer servers
/// instead of failing the conversion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum OperationType {
    /// A document was inserted into a collection
    Insert,

    /// A document was updated in place
    Update,

    /// A document was deleted from a collection
    Delete,

    /// A document was replaced entirely
    Replace,

    /// The change stream was invalidated (collection dropped, renamed, etc.)
    Invalidate,

    /// A collection was dropped
    Drop,

    /// A database was dropped
    #[serde(rename = "dropDatabase")]
    DropDatabase,

    /// A collection was renamed
    Rename,

    /// An operation type this crate does not know about
    #[serde(untagged)]
    Unknown(String),
}

impl OperationType {
    /// Returns true for the operations that carry a full current document
    /// snapshot (insert, update with lookup, replace).
    ///
    /// These are the only operations the relay forwards to the sink.
    #[inline]
    pub fn is_forwardable(&self) -> bool {
        matches!(
            self,
            OperationType::Insert | OperationType::Update | OperationType::Replace
        )
    }

    /// Returns the lowercase wire name, used for metric labels and logs.
    pub fn as_str(&self) -> &str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::Replace => "replace",
            OperationType::Invalidate => "invalidate",
            OperationType::Drop => "drop",
            OperationType::DropDatabase => "dropDatabase",
            OperationType::Rename => "rename",
            OperationType::Unknown(name) => name,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// MongoDB namespace (database + collection).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    /// Database name
    pub database: String,

    /// Collection name
    pub collection: String,
}

impl Namespace {
    /// Creates a new namespace from database and collection names.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Returns the fully qualified namespace as "database.collection".
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

/// A single change read from the feed.
///
/// Events are ephemeral: the relay reads each one once and persists only its
/// `resume_token`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Type of operation that occurred
    #[serde(rename = "operationType")]
    pub operation: OperationType,

    /// Namespace (database + collection) where the operation occurred
    #[serde(rename = "ns")]
    pub namespace: Namespace,

    /// Document key (`_id` and shard key if sharded)
    #[serde(rename = "documentKey", skip_serializing_if = "Option::is_none")]
    pub document_key: Option<Document>,

    /// Full document after the operation.
    ///
    /// Present for inserts and replaces, and for updates when the feed runs
    /// in update-lookup mode. A lookup that finds nothing (the document was
    /// deleted in the meantime) leaves this empty.
    #[serde(rename = "fullDocument", skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Document>,

    /// Timestamp of the operation in the oplog, when the server reports it
    #[serde(rename = "clusterTime", skip_serializing_if = "Option::is_none")]
    pub cluster_time: Option<DateTime<Utc>>,

    /// Store-issued position token of this event
    #[serde(rename = "_id")]
    pub resume_token: Document,
}

impl ChangeEvent {
    /// Returns true if this is an invalidate operation.
    #[inline]
    pub fn is_invalidate(&self) -> bool {
        self.operation == OperationType::Invalidate
    }

    /// Returns the collection name.
    #[inline]
    pub fn collection_name(&self) -> &str {
        &self.namespace.collection
    }

    /// Returns the database name.
    #[inline]
    pub fn database_name(&self) -> &str {
        &self.namespace.database
    }

    /// Returns the document ID if present in the document key.
    pub fn document_id(&self) -> Option<&bson::Bson> {
        self.document_key.as_ref()?.get("_id")
    }

    /// Returns the document to forward, or `None` when the payload is
    /// missing or empty.
    pub fn forwardable_document(&self) -> Option<&Document> {
        self.full_document.as_ref().filter(|doc| !doc.is_empty())
    }
}

/// Conversion from MongoDB driver's `ChangeStreamEvent`.
///
/// Returns an error if the position token cannot be represented as a BSON
/// document.
impl TryFrom<mongodb::change_stream::event::ChangeStreamEvent<Document>> for ChangeEvent {
    type Error = ConversionError;

    fn try_from(
        event: mongodb::change_stream::event::ChangeStreamEvent<Document>,
    ) -> Result<Self, Self::Error> {
        use mongodb::change_stream::event::OperationType as MongoOpType;

        let operation = match event.operation_type {
            MongoOpType::Insert => OperationType::Insert,
            MongoOpType::Update => OperationType::Update,
            MongoOpType::Delete => OperationType::Delete,
            MongoOpType::Replace => OperationType::Replace,
            MongoOpType::Invalidate => OperationType::Invalidate,
            MongoOpType::Drop => OperationType::Drop,
            MongoOpType::DropDatabase => OperationType::DropDatabase,
            MongoOpType::Rename => OperationType::Rename,
            other => {
                let op_str = format!("{other:?}");
                tracing::warn!(
                    operation = %op_str,
                    "Unknown MongoDB operation type encountered"
                );
                OperationType::Unknown(op_str)
            }
        };

        let namespace = event
            .ns
            .map(|ns| Namespace {
                database: ns.db,
                collection: ns.coll.unwrap_or_default(),
            })
            .unwrap_or_else(|| Namespace::new(String::new(), String::new()));

        // Increment is mapped to milliseconds so events inside one second stay ordered
        let cluster_time = event.cluster_time.and_then(|ts| {
            DateTime::from_timestamp(i64::from(ts.time), ts.increment.min(999) * 1_000_000)
        });

        let resume_token = bson::to_document(&event.id).map_err(|e| {
            ConversionError::ResumeTokenConversion(format!(
                "Failed to serialize resume token to BSON document: {}",
                e
            ))
        })?;

        Ok(Self {
            operation,
            namespace,
            document_key: event.document_key,
            full_document: event.full_document,
            cluster_time,
            resume_token,
        })
    }
}
