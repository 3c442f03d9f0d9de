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

//! `MongoDB` collection sink.
//!
//! Writes each forwarded document into a sink collection, either appending
//! it ([`WriteMode::Insert`]) or replacing the document with the same key
//! ([`WriteMode::UpsertByKey`]).
//!
//! # Examples
//!
//! ```rust,no_run
//! use tapline_sinks::mongo::{MongoSink, MongoSinkConfig};
//! use tapline_core::sink::{Sink, WriteMode};
//! use bson::doc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = mongodb::Client::with_uri_str("mongodb://localhost:27017").await?;
//!
//! let config = MongoSinkConfig::builder()
//!     .database("db1")
//!     .collection("outputChangeStream")
//!     .write_mode(WriteMode::UpsertByKey)
//!     .build()?;
//!
//! let mut sink = MongoSink::new(&client, config);
//! sink.forward(&doc! { "_id": 1, "name": "Alice" }, Some(&doc! { "_id": 1 })).await?;
//! sink.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`WriteMode::Insert`]: tapline_core::sink::WriteMode::Insert
//! [`WriteMode::UpsertByKey`]: tapline_core::sink::WriteMode::UpsertByKey

mod config;
mod sink;

pub use config::{MongoSinkConfig, MongoSinkConfigBuilder};
pub use sink::MongoSink;
