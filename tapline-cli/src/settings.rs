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

//! Command-line and environment settings.

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use tapline_core::feed::{FeedConfig, FeedError};
use tapline_core::relay::{MalformedEventPolicy, RelayConfig, RelayError};
use tapline_core::sink::WriteMode;
use tapline_sinks::mongo::MongoSinkConfig;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Relay settings. Every option can also be set through its environment
/// variable.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "tapline",
    version,
    about = "Relays MongoDB change stream documents into a sink collection"
)]
pub struct Settings {
    /// MongoDB connection string
    #[arg(long, env = "TAPLINE_MONGODB_URI", hide_env_values = true)]
    pub mongodb_uri: String,

    /// Database holding the source, sink and cursor collections
    #[arg(long, env = "TAPLINE_DATABASE", default_value = "db1")]
    pub database: String,

    /// Collection whose changes are relayed
    #[arg(long, env = "TAPLINE_SOURCE_COLLECTION", default_value = "inputChangeStream")]
    pub source_collection: String,

    /// Collection receiving forwarded documents
    #[arg(long, env = "TAPLINE_SINK_COLLECTION", default_value = "outputChangeStream")]
    pub sink_collection: String,

    /// Collection holding resume cursors
    #[arg(long, env = "TAPLINE_CURSOR_COLLECTION", default_value = "changeStreamTokens")]
    pub cursor_collection: String,

    /// Look-back window in days when no cursor is saved
    #[arg(
        long,
        env = "TAPLINE_HORIZON_DAYS",
        default_value_t = 100,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub horizon_days: u64,

    /// Sink write mode: insert or upsert
    #[arg(long, env = "TAPLINE_WRITE_MODE", default_value = "insert")]
    pub write_mode: WriteMode,

    /// Events without a document: skip or fail
    #[arg(long, env = "TAPLINE_MALFORMED_POLICY", default_value = "skip")]
    pub malformed_policy: MalformedEventPolicy,

    /// Change stream batch size
    #[arg(long, env = "TAPLINE_BATCH_SIZE")]
    pub batch_size: Option<u32>,

    /// Server-side wait for new events, in milliseconds
    #[arg(long, env = "TAPLINE_MAX_AWAIT_MS")]
    pub max_await_ms: Option<u64>,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "TAPLINE_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// In-process restarts after a transient relay error
    #[arg(long, env = "TAPLINE_MAX_RESTARTS", default_value_t = 0)]
    pub max_restarts: u32,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, env = "TAPLINE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "TAPLINE_LOG_JSON")]
    pub log_json: bool,
}

/// Invalid settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Rejected change feed options
    #[error("Invalid change feed settings: {0}")]
    Feed(#[from] FeedError),

    /// Rejected relay options
    #[error("Invalid relay settings: {0}")]
    Relay(#[from] RelayError),

    /// Rejected sink options
    #[error("Invalid sink settings: {0}")]
    Sink(String),
}

impl Settings {
    /// The fallback look-back window.
    pub fn horizon(&self) -> Duration {
        Duration::from_secs(self.horizon_days.saturating_mul(SECONDS_PER_DAY))
    }

    /// Change feed configuration.
    pub fn feed_config(&self) -> Result<FeedConfig, ConfigError> {
        let mut builder = FeedConfig::builder();
        if let Some(size) = self.batch_size {
            builder = builder.batch_size(size);
        }
        if let Some(ms) = self.max_await_ms {
            builder = builder.max_await_time(Duration::from_millis(ms));
        }
        Ok(builder.build()?)
    }

    /// Relay configuration.
    pub fn relay_config(&self) -> Result<RelayConfig, ConfigError> {
        Ok(RelayConfig::builder()
            .horizon(self.horizon())
            .malformed_policy(self.malformed_policy)
            .build()?)
    }

    /// Sink configuration.
    pub fn sink_config(&self) -> Result<MongoSinkConfig, ConfigError> {
        MongoSinkConfig::builder()
            .database(&self.database)
            .collection(&self.sink_collection)
            .write_mode(self.write_mode)
            .build()
            .map_err(ConfigError::Sink)
    }
}
