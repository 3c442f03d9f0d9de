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

//! `MongoDB` cursor store.
//!
//! Cursor records live in a dedicated collection, one document per record:
//!
//! ```text
//! { "_id": ObjectId(...), "resumeToken": { "_data": "8263..." } }
//! ```
//!
//! Recency is the `_id` order of driver-generated `ObjectId`s, so the newest
//! record is `find().sort({_id: -1}).limit(1)`. Deletion matches on the
//! `resumeToken` value, never on `_id`.
//!
//! # Example
//!
//! ```rust,no_run
//! use tapline_stores::mongo::MongoCursorStore;
//! use tapline_core::cursor::CursorStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = mongodb::Client::with_uri_str("mongodb://localhost:27017").await?;
//! let store = MongoCursorStore::from_client(&client, "db1", "changeStreamTokens");
//!
//! store.ping().await?;
//! if let Some(record) = store.latest().await? {
//!     println!("resuming after {}", record.resume_token());
//! }
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bson::{doc, Document};
use futures::TryStreamExt;
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::{Client, Collection};
use tapline_core::cursor::{CursorRecord, CursorStore, CursorStoreError};
use tracing::{debug, error, trace};

/// Cursor store backed by a `MongoDB` collection.
#[derive(Debug, Clone)]
pub struct MongoCursorStore {
    collection: Collection<Document>,
}

impl MongoCursorStore {
    /// Creates a store over an existing collection handle.
    #[must_use]
    pub fn new(collection: Collection<Document>) -> Self {
        debug!(
            namespace = %collection.namespace(),
            "Creating MongoDB cursor store"
        );
        Self { collection }
    }

    /// Creates a store for `database.collection` on a shared client.
    #[must_use]
    pub fn from_client(client: &Client, database: &str, collection: &str) -> Self {
        Self::new(client.database(database).collection(collection))
    }

    /// The backing collection.
    #[must_use]
    pub fn collection(&self) -> &Collection<Document> {
        &self.collection
    }

    /// Verifies the server is reachable.
    ///
    /// # Errors
    ///
    /// Returns [`CursorStoreError::Connection`] if the ping fails.
    pub async fn ping(&self) -> Result<(), CursorStoreError> {
        self.collection
            .client()
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| {
                error!("MongoDB ping failed: {}", e);
                map_error(e)
            })?;
        Ok(())
    }

    fn newest_first() -> Document {
        doc! { "_id": -1 }
    }
}

/// Maps driver errors onto cursor store errors.
fn map_error(err: MongoError) -> CursorStoreError {
    match err.kind.as_ref() {
        ErrorKind::BsonSerialization(_) | ErrorKind::BsonDeserialization(_) => {
            CursorStoreError::Serialization(err.to_string())
        }
        _ => CursorStoreError::Connection(err.to_string()),
    }
}

#[async_trait]
impl CursorStore for MongoCursorStore {
    async fn latest(&self) -> Result<Option<CursorRecord>, CursorStoreError> {
        let document = self
            .collection
            .find_one(doc! {})
            .sort(Self::newest_first())
            .await
            .map_err(map_error)?;

        document.as_ref().map(CursorRecord::from_document).transpose()
    }

    async fn insert(&self, token: &Document) -> Result<CursorRecord, CursorStoreError> {
        let record = CursorRecord::new(token.clone());

        let result = self
            .collection
            .insert_one(record.to_document())
            .await
            .map_err(map_error)?;

        trace!(id = %result.inserted_id, "Inserted cursor record");
        Ok(record)
    }

    async fn delete(&self, record: &CursorRecord) -> Result<bool, CursorStoreError> {
        let result = self
            .collection
            .delete_one(record.filter())
            .await
            .map_err(map_error)?;

        Ok(result.deleted_count > 0)
    }

    async fn list(&self) -> Result<Vec<CursorRecord>, CursorStoreError> {
        let documents: Vec<Document> = self
            .collection
            .find(doc! {})
            .sort(Self::newest_first())
            .await
            .map_err(map_error)?
            .try_collect()
            .await
            .map_err(map_error)?;

        documents.iter().map(CursorRecord::from_document).collect()
    }

    async fn close(&self) -> Result<(), CursorStoreError> {
        // The client is shared with the feed and sink; its owner shuts it down
        debug!("Closing MongoDB cursor store");
        Ok(())
    }
}
