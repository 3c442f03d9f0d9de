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

//! Resume token lifecycle on top of a [`CursorStore`].
//!
//! The [`TokenManager`] loads the newest cursor at startup and advances the
//! cursor as events are forwarded. Advancing is always insert-then-delete:
//! the new record must be durable before the superseded one is removed, so a
//! crash between the two leaves an extra record rather than none.

use crate::cursor::{CursorRecord, CursorStore, CursorStoreError};
use crate::metrics::{self, CursorDeletion};
use bson::Document;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Loads, saves and deletes cursor records.
#[derive(Debug)]
pub struct TokenManager<S: CursorStore> {
    store: Arc<S>,
}

impl<S: CursorStore> Clone for TokenManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: CursorStore> TokenManager<S> {
    /// Creates a token manager owning the store.
    pub fn new(store: S) -> Self {
        Self::from_arc(Arc::new(store))
    }

    /// Creates a token manager sharing an existing store.
    pub fn from_arc(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns the newest cursor record, or `None` for an empty store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be queried. An empty store is
    /// not an error.
    #[instrument(skip(self))]
    pub async fn load_latest_cursor(&self) -> Result<Option<CursorRecord>, CursorStoreError> {
        let latest = self.store.latest().await?;

        match &latest {
            Some(record) => info!(token = ?record.resume_token(), "Loaded saved resume token"),
            None => info!("No saved resume token found"),
        }

        Ok(latest)
    }

    /// Durably inserts a record for `token` and returns its handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written. The caller must not
    /// delete the superseded record in that case.
    pub async fn save_cursor(&self, token: &Document) -> Result<CursorRecord, CursorStoreError> {
        let record = self.store.insert(token).await?;
        metrics::increment_cursors_saved();
        debug!(token = ?token, "Resume token saved");
        Ok(record)
    }

    /// Deletes a superseded record, matching it by content.
    ///
    /// Deleting a record that is already gone is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    pub async fn delete_cursor(&self, record: &CursorRecord) -> Result<(), CursorStoreError> {
        if self.store.delete(record).await? {
            metrics::increment_cursors_deleted(CursorDeletion::Superseded);
            debug!(token = ?record.resume_token(), "Superseded resume token deleted");
        } else {
            debug!(
                token = ?record.resume_token(),
                "Superseded resume token already absent"
            );
        }
        Ok(())
    }

    /// Deletes every record other than `latest`.
    ///
    /// Extra records only exist after a crash between saving a new cursor and
    /// deleting the old one. They are never read again, since loading always
    /// picks the newest record, so removing them at startup is safe.
    ///
    /// Returns the number of records deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    #[instrument(skip(self, latest))]
    pub async fn sweep_stale_cursors(
        &self,
        latest: &CursorRecord,
    ) -> Result<usize, CursorStoreError> {
        let mut swept = 0;

        for record in self.store.list().await? {
            if record.stored() == latest.stored() {
                continue;
            }

            if self.store.delete(&record).await? {
                swept += 1;
                metrics::increment_cursors_deleted(CursorDeletion::Stale);
            }
        }

        if swept > 0 {
            warn!(swept, "Removed stale resume tokens left by an interrupted commit");
        }

        Ok(swept)
    }
}
