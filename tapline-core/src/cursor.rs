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

//! Durable cursor records for change feed resumption.
//!
//! The [`CursorStore`] trait abstracts the collection that remembers the last
//! safely consumed feed position. Records are never updated in place: a new
//! record is inserted for every forwarded event and the superseded one is
//! deleted afterwards. "Most recent" is decided by the store's own insertion
//! order.
//!
//! # Persisted layout
//!
//! ```text
//! { "_id": <store id>, "resumeToken": { "_data": "8263..." } }
//! ```
//!
//! Records written by older relays stored the whole projected change
//! document under `resumeToken`. [`CursorRecord::from_stored`] reads both
//! layouts.
//!
//! # Example
//!
//! ```rust
//! use tapline_core::cursor::{CursorRecord, CursorStore, CursorStoreError};
//! use bson::Document;
//! use std::sync::Arc;
//! use tokio::sync::Mutex;
//!
//! #[derive(Default)]
//! struct VecCursorStore {
//!     records: Arc<Mutex<Vec<CursorRecord>>>,
//! }
//!
//! #[async_trait::async_trait]
//! impl CursorStore for VecCursorStore {
//!     async fn latest(&self) -> Result<Option<CursorRecord>, CursorStoreError> {
//!         Ok(self.records.lock().await.last().cloned())
//!     }
//!
//!     async fn insert(&self, token: &Document) -> Result<CursorRecord, CursorStoreError> {
//!         let record = CursorRecord::new(token.clone());
//!         self.records.lock().await.push(record.clone());
//!         Ok(record)
//!     }
//!
//!     async fn delete(&self, record: &CursorRecord) -> Result<bool, CursorStoreError> {
//!         let mut records = self.records.lock().await;
//!         match records.iter().position(|r| r.stored() == record.stored()) {
//!             Some(index) => {
//!                 records.remove(index);
//!                 Ok(true)
//!             }
//!             None => Ok(false),
//!         }
//!     }
//!
//!     async fn list(&self) -> Result<Vec<CursorRecord>, CursorStoreError> {
//!         Ok(self.records.lock().await.iter().rev().cloned().collect())
//!     }
//!
//!     async fn close(&self) -> Result<(), CursorStoreError> {
//!         Ok(())
//!     }
//! }
//! ```

use bson::{doc, Bson, Document};

/// Field holding the position token in a persisted cursor document.
pub const RESUME_TOKEN_FIELD: &str = "resumeToken";

/// A persisted feed position.
///
/// Two records are the same record when their stored values are equal;
/// deletion matches by content, never by a store-assigned identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorRecord {
    resume_token: Document,
    stored: Document,
}

impl CursorRecord {
    /// Creates a record that stores the token as-is.
    #[must_use]
    pub fn new(resume_token: Document) -> Self {
        Self {
            stored: resume_token.clone(),
            resume_token,
        }
    }

    /// Rebuilds a record from the value found under `resumeToken`.
    ///
    /// A value carrying an `_id` sub-document is a whole change document
    /// written by an older relay; its `_id` is the position token.
    ///
    /// # Errors
    ///
    /// Returns [`CursorStoreError::Malformed`] if the legacy `_id` is not a
    /// document.
    pub fn from_stored(stored: Document) -> Result<Self, CursorStoreError> {
        let resume_token = match stored.get("_id") {
            Some(Bson::Document(token)) => token.clone(),
            Some(other) => {
                return Err(CursorStoreError::Malformed(format!(
                    "legacy cursor _id must be a document, found {:?}",
                    other.element_type()
                )))
            }
            None => stored.clone(),
        };

        Ok(Self {
            resume_token,
            stored,
        })
    }

    /// Rebuilds a record from a full persisted cursor document.
    ///
    /// # Errors
    ///
    /// Returns [`CursorStoreError::Malformed`] if the document has no
    /// `resumeToken` sub-document.
    pub fn from_document(document: &Document) -> Result<Self, CursorStoreError> {
        let stored = document.get_document(RESUME_TOKEN_FIELD).map_err(|e| {
            CursorStoreError::Malformed(format!("cursor document has no {RESUME_TOKEN_FIELD}: {e}"))
        })?;
        Self::from_stored(stored.clone())
    }

    /// The token to hand back to the change feed.
    #[must_use]
    pub fn resume_token(&self) -> &Document {
        &self.resume_token
    }

    /// The value persisted under `resumeToken`.
    #[must_use]
    pub fn stored(&self) -> &Document {
        &self.stored
    }

    /// The document to insert for this record.
    #[must_use]
    pub fn to_document(&self) -> Document {
        doc! { RESUME_TOKEN_FIELD: self.stored.clone() }
    }

    /// The content filter that matches this record for deletion.
    #[must_use]
    pub fn filter(&self) -> Document {
        self.to_document()
    }
}

/// Trait for cursor storage backends.
///
/// There is exactly one writer of cursor state, so implementations need no
/// locking beyond what the backing store makes atomic per document.
#[async_trait::async_trait]
pub trait CursorStore: Send + Sync {
    /// Returns the most recently inserted record, if any.
    ///
    /// An empty store is a normal state and yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be queried.
    async fn latest(&self) -> Result<Option<CursorRecord>, CursorStoreError>;

    /// Durably inserts a new record wrapping the token.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    async fn insert(&self, token: &Document) -> Result<CursorRecord, CursorStoreError>;

    /// Deletes one record whose stored value equals `record`'s.
    ///
    /// Returns `Ok(false)` if no such record exists; that is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn delete(&self, record: &CursorRecord) -> Result<bool, CursorStoreError>;

    /// Lists all records, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be read.
    async fn list(&self) -> Result<Vec<CursorRecord>, CursorStoreError>;

    /// Closes the store, releasing any resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be closed cleanly.
    async fn close(&self) -> Result<(), CursorStoreError>;
}

/// Errors that can occur during cursor store operations.
#[derive(Debug, thiserror::Error)]
pub enum CursorStoreError {
    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A persisted record does not have the expected shape
    #[error("Malformed cursor record: {0}")]
    Malformed(String),

    /// Other errors
    #[error("Cursor store error: {0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_stores_token_as_is() {
        let token = doc! { "_data": "826A" };
        let record = CursorRecord::new(token.clone());

        assert_eq!(record.resume_token(), &token);
        assert_eq!(record.stored(), &token);
        assert_eq!(record.to_document(), doc! { "resumeToken": { "_data": "826A" } });
        assert_eq!(record.filter(), record.to_document());
    }

    #[test]
    fn test_from_document_plain_layout() {
        let record =
            CursorRecord::from_document(&doc! { "_id": 7, "resumeToken": { "_data": "826B" } })
                .unwrap();
        assert_eq!(record.resume_token(), &doc! { "_data": "826B" });
    }

    #[test]
    fn test_from_document_legacy_layout() {
        let legacy = doc! {
            "_id": { "_data": "826C" },
            "fullDocument": { "_id": 1, "name": "x" },
            "ns": { "db": "db1", "coll": "inputChangeStream" },
            "documentKey": { "_id": 1 },
        };
        let record = CursorRecord::from_document(&doc! { "resumeToken": legacy.clone() }).unwrap();

        assert_eq!(record.resume_token(), &doc! { "_data": "826C" });
        // Deletion must still match what was written
        assert_eq!(record.filter(), doc! { "resumeToken": legacy });
    }

    #[test]
    fn test_from_document_rejects_missing_token() {
        let err = CursorRecord::from_document(&doc! { "_id": 1 }).unwrap_err();
        assert!(matches!(err, CursorStoreError::Malformed(_)));

        let err = CursorRecord::from_stored(doc! { "_id": "not-a-document" }).unwrap_err();
        assert!(matches!(err, CursorStoreError::Malformed(_)));
    }
}
