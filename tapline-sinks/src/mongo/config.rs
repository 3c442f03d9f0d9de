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

//! `MongoDB` sink configuration.

use tapline_core::sink::WriteMode;

/// Configuration for [`MongoSink`](super::MongoSink).
///
/// # Examples
///
/// ```rust
/// use tapline_sinks::mongo::MongoSinkConfig;
///
/// let config = MongoSinkConfig::builder()
///     .database("db1")
///     .collection("outputChangeStream")
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct MongoSinkConfig {
    /// Database holding the sink collection (required).
    pub database: String,

    /// Sink collection name (required).
    pub collection: String,

    /// How documents are written (default: insert).
    pub write_mode: WriteMode,
}

/// Builder for `MongoSinkConfig`.
#[derive(Debug, Default)]
pub struct MongoSinkConfigBuilder {
    database: Option<String>,
    collection: Option<String>,
    write_mode: Option<WriteMode>,
}

impl MongoSinkConfigBuilder {
    /// Sets the database name.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Sets the sink collection name.
    #[must_use]
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Sets the write mode.
    #[must_use]
    pub fn write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = Some(mode);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `database` or `collection` is missing or empty.
    pub fn build(self) -> Result<MongoSinkConfig, String> {
        let database = self.database.ok_or("database is required")?;
        if database.is_empty() {
            return Err("database cannot be empty".to_string());
        }

        let collection = self.collection.ok_or("collection is required")?;
        if collection.is_empty() {
            return Err("collection cannot be empty".to_string());
        }

        Ok(MongoSinkConfig {
            database,
            collection,
            write_mode: self.write_mode.unwrap_or_default(),
        })
    }
}

impl MongoSinkConfig {
    /// Creates a new builder for `MongoSinkConfig`.
    #[must_use]
    pub fn builder() -> MongoSinkConfigBuilder {
        MongoSinkConfigBuilder::default()
    }
}
