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

//! In-memory cursor store implementation.
//!
//! Records are kept in insertion order, so "most recent" is simply the last
//! one pushed.
//!
//! # Limitations
//!
//! ⚠️ **Important**: nothing survives a restart. A relay using this store
//! falls back to the horizon every time it starts. Use it for tests,
//! benchmarks and local experiments; use
//! [`MongoCursorStore`](crate::mongo::MongoCursorStore) anywhere resuming
//! matters.
//!
//! # Example
//!
//! ```rust
//! use tapline_stores::memory::MemoryCursorStore;
//! use tapline_core::cursor::CursorStore;
//! use bson::doc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryCursorStore::new();
//!
//! let old = store.insert(&doc! { "_data": "01" }).await?;
//! store.insert(&doc! { "_data": "02" }).await?;
//! store.delete(&old).await?;
//!
//! let latest = store.latest().await?.unwrap();
//! assert_eq!(latest.resume_token(), &doc! { "_data": "02" });
//! assert_eq!(store.len().await, 1);
//! # Ok(())
//! # }
//! ```
//!
//! # Thread Safety
//!
//! The store uses [`Arc`] and [`RwLock`] internally; clones share the same
//! records.

use bson::Document;
use std::sync::Arc;
use tapline_core::cursor::{CursorRecord, CursorStore, CursorStoreError};
use tokio::sync::RwLock;
use tracing::{debug, trace};

/// In-memory cursor store.
#[derive(Debug, Clone, Default)]
pub struct MemoryCursorStore {
    /// Records, oldest first
    records: Arc<RwLock<Vec<CursorRecord>>>,
}

impl MemoryCursorStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        debug!("Creating new in-memory cursor store");
        Self::default()
    }

    /// Creates a store holding one record per token, oldest first.
    ///
    /// ```rust
    /// use tapline_stores::memory::MemoryCursorStore;
    /// use bson::doc;
    ///
    /// let store = MemoryCursorStore::with_tokens(vec![doc! { "_data": "01" }]);
    /// ```
    #[must_use]
    pub fn with_tokens(tokens: Vec<Document>) -> Self {
        debug!(
            token_count = tokens.len(),
            "Creating in-memory cursor store with initial tokens"
        );
        Self {
            records: Arc::new(RwLock::new(
                tokens.into_iter().map(CursorRecord::new).collect(),
            )),
        }
    }

    /// Returns the number of records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Returns `true` if the store holds no records.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Returns the stored tokens, oldest first.
    pub async fn tokens(&self) -> Vec<Document> {
        self.records
            .read()
            .await
            .iter()
            .map(|r| r.resume_token().clone())
            .collect()
    }

    /// Removes every record.
    pub async fn clear(&self) {
        let mut records = self.records.write().await;
        let count = records.len();
        records.clear();
        debug!(cleared_count = count, "Cleared all records from memory store");
    }
}

#[async_trait::async_trait]
impl CursorStore for MemoryCursorStore {
    async fn latest(&self) -> Result<Option<CursorRecord>, CursorStoreError> {
        Ok(self.records.read().await.last().cloned())
    }

    async fn insert(&self, token: &Document) -> Result<CursorRecord, CursorStoreError> {
        trace!(token = ?token, "Saving cursor to memory");

        let record = CursorRecord::new(token.clone());
        let mut records = self.records.write().await;
        records.push(record.clone());

        debug!(total_records = records.len(), "Saved cursor to memory");
        Ok(record)
    }

    async fn delete(&self, record: &CursorRecord) -> Result<bool, CursorStoreError> {
        let mut records = self.records.write().await;

        match records.iter().position(|r| r.stored() == record.stored()) {
            Some(index) => {
                records.remove(index);
                debug!(remaining_records = records.len(), "Deleted cursor from memory");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self) -> Result<Vec<CursorRecord>, CursorStoreError> {
        Ok(self.records.read().await.iter().rev().cloned().collect())
    }

    async fn close(&self) -> Result<(), CursorStoreError> {
        debug!("Closing in-memory cursor store (no-op)");
        Ok(())
    }
}
