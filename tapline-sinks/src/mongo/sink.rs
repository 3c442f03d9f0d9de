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

//! `MongoDB` sink implementation.

use super::config::MongoSinkConfig;
use async_trait::async_trait;
use bson::Document;
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::{Client, Collection};
use tapline_core::sink::{upsert_filter, Sink, SinkError, WriteMode};
use tracing::{debug, info, trace};

/// Duplicate key error code.
const DUPLICATE_KEY: i32 = 11000;

/// Writes forwarded documents into a `MongoDB` collection.
///
/// One write per document, no buffering: when `forward` returns `Ok` the
/// write has been acknowledged under the client's write concern.
#[derive(Debug)]
pub struct MongoSink {
    collection: Collection<Document>,
    write_mode: WriteMode,
    closed: bool,
}

impl MongoSink {
    /// Creates a sink on a shared client.
    #[must_use]
    pub fn new(client: &Client, config: MongoSinkConfig) -> Self {
        info!(
            database = %config.database,
            collection = %config.collection,
            write_mode = ?config.write_mode,
            "Initializing MongoDB sink"
        );

        Self::from_collection(
            client
                .database(&config.database)
                .collection(&config.collection),
            config.write_mode,
        )
    }

    /// Creates a sink over an existing collection handle.
    #[must_use]
    pub fn from_collection(collection: Collection<Document>, write_mode: WriteMode) -> Self {
        Self {
            collection,
            write_mode,
            closed: false,
        }
    }

    /// The configured write mode.
    #[must_use]
    pub fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    /// Classifies driver errors into [`SinkError`] variants.
    fn classify_mongo_error(error: MongoError) -> SinkError {
        if let ErrorKind::Write(WriteFailure::WriteError(write_error)) = error.kind.as_ref() {
            if write_error.code == DUPLICATE_KEY {
                return SinkError::write_msg(
                    format!(
                        "{error}; the sink already holds a document with this _id \
                         (upsert write mode accepts later versions)"
                    ),
                    false,
                );
            }
        }

        if error.contains_label("RetryableWriteError") || error.contains_label("NetworkError") {
            return SinkError::connection(error);
        }

        match error.kind.as_ref() {
            ErrorKind::Io(_)
            | ErrorKind::ServerSelection { .. }
            | ErrorKind::ConnectionPoolCleared { .. } => SinkError::connection(error),
            ErrorKind::BsonSerialization(_) => SinkError::invalid_document(error.to_string()),
            _ => SinkError::write(error, false),
        }
    }
}

#[async_trait]
impl Sink for MongoSink {
    async fn forward(
        &mut self,
        document: &Document,
        document_key: Option<&Document>,
    ) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::write_msg("Cannot write to closed MongoDB sink", false));
        }

        match self.write_mode {
            WriteMode::Insert => {
                self.collection
                    .insert_one(document)
                    .await
                    .map_err(Self::classify_mongo_error)?;
            }
            WriteMode::UpsertByKey => {
                let filter = upsert_filter(document, document_key).ok_or_else(|| {
                    SinkError::invalid_document("upsert requires a document key or _id")
                })?;

                trace!(filter = ?filter, "Upserting document");
                self.collection
                    .replace_one(filter, document)
                    .upsert(true)
                    .await
                    .map_err(Self::classify_mongo_error)?;
            }
        }

        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        if !self.closed {
            debug!("Closing MongoDB sink");
            self.closed = true;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "mongodb"
    }
}
