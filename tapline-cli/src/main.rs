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

//! `tapline` - relay a MongoDB collection's changes into a sink collection.
//!
//! The process runs until the change stream fails or it is interrupted. It
//! exits non-zero on any relay error (including the stream ending) so an
//! external supervisor restarts it; restarting always resumes from the last
//! durable cursor.

mod settings;
mod supervisor;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use mongodb::Client;
use settings::{ConfigError, Settings};
use std::process::ExitCode;
use supervisor::RestartPolicy;
use tapline_core::cursor::CursorStoreError;
use tapline_core::feed::MongoFeedSource;
use tapline_core::metrics;
use tapline_core::relay::{Relay, RelayError, RelayStats};
use tapline_core::token::TokenManager;
use tapline_sinks::mongo::MongoSink;
use tapline_stores::mongo::MongoCursorStore;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Fatal process errors.
#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to create MongoDB client: {0}")]
    Client(#[from] mongodb::error::Error),

    #[error("Cursor store unavailable: {0}")]
    Store(#[from] CursorStoreError),

    #[error("Failed to install metrics exporter: {0}")]
    Metrics(String),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("Change stream ended after forwarding {} events", .0.events_forwarded)]
    FeedEnded(RelayStats),
}

fn init_logging(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if settings.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(settings: Settings) -> Result<(), AppError> {
    if let Some(addr) = settings.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| AppError::Metrics(e.to_string()))?;
        metrics::init_metrics();
        info!(%addr, "Prometheus metrics exporter listening");
    }

    let feed_config = settings.feed_config()?;
    let relay_config = settings.relay_config()?;
    let sink_config = settings.sink_config()?;

    let client = Client::with_uri_str(&settings.mongodb_uri).await?;
    MongoCursorStore::from_client(&client, &settings.database, &settings.cursor_collection)
        .ping()
        .await?;

    info!(
        database = %settings.database,
        source = %settings.source_collection,
        sink = %settings.sink_collection,
        cursors = %settings.cursor_collection,
        "Connected to MongoDB"
    );

    let policy = RestartPolicy::new(settings.max_restarts);

    let relay_loop = supervisor::supervise(&policy, |attempt| {
        let source = MongoFeedSource::new(
            client
                .database(&settings.database)
                .collection(&settings.source_collection),
            feed_config.clone(),
        );
        let store =
            MongoCursorStore::from_client(&client, &settings.database, &settings.cursor_collection);
        let sink = MongoSink::new(&client, sink_config.clone());
        let relay_config = relay_config.clone();

        async move {
            info!(attempt, "Starting relay");
            let mut relay = Relay::new(relay_config, source, TokenManager::new(store), sink);
            let result = relay.run().await;
            if let Err(e) = relay.close().await {
                warn!(error = %e, "Failed to close relay cleanly");
            }
            result
        }
    });

    tokio::select! {
        result = relay_loop => match result {
            Ok(stats) => Err(AppError::FeedEnded(stats)),
            Err(e) => Err(e.into()),
        },
        _ = tokio::signal::ctrl_c() => {
            // Nothing to drain: the next start resumes from the last saved cursor
            info!("Interrupted, exiting");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let settings = Settings::parse();
    init_logging(&settings);

    match run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "tapline exiting");
            ExitCode::FAILURE
        }
    }
}
