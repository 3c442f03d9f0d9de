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


//! Relay a scripted change feed into a console sink, twice.
//!
//! The first run forwards everything and leaves one cursor behind. The second
//! run, sharing the same cursor store, resumes after it and forwards nothing.
//!
//! ```bash
//! cargo run -p tapline-stores --example relay_in_memory
//! ```

use async_trait::async_trait;
use bson::{doc, Document};
use std::error::Error;
use std::sync::Arc;
use tapline_core::event::{ChangeEvent, Namespace, OperationType};
use tapline_core::feed::ScriptedFeedSource;
use tapline_core::relay::{Relay, RelayConfig};
use tapline_core::sink::{Sink, SinkError};
use tapline_core::token::TokenManager;
use tapline_stores::memory::MemoryCursorStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Prints every forwarded document.
#[derive(Debug, Default)]
struct ConsoleSink {
    count: usize,
}

#[async_trait]
impl Sink for ConsoleSink {
    async fn forward(
        &mut self,
        document: &Document,
        _document_key: Option<&Document>,
    ) -> Result<(), SinkError> {
        self.count += 1;
        info!(count = self.count, %document, "Forwarded");
        Ok(())
    }

    fn name(&self) -> &str {
        "console"
    }
}

fn event(n: i64, operation: OperationType, full_document: Option<Document>) -> ChangeEvent {
    ChangeEvent {
        operation,
        namespace: Namespace::new("db1", "inputChangeStream"),
        document_key: Some(doc! { "_id": n }),
        full_document,
        cluster_time: None,
        resume_token: doc! { "_data": format!("{n:04}") },
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("info"))
        .init();

    let source = ScriptedFeedSource::new(vec![
        vec![
            event(1, OperationType::Insert, Some(doc! { "_id": 1, "name": "Alice" })),
            event(2, OperationType::Insert, Some(doc! { "_id": 2, "name": "Bob" })),
        ],
        vec![
            event(3, OperationType::Update, Some(doc! { "_id": 1, "name": "Alice B." })),
            event(4, OperationType::Delete, None),
        ],
    ]);
    let store = Arc::new(MemoryCursorStore::new());

    for run in 1..=2 {
        let mut relay = Relay::new(
            RelayConfig::default(),
            source.clone(),
            TokenManager::from_arc(Arc::clone(&store)),
            ConsoleSink::default(),
        );
        let stats = relay.run().await?;
        relay.close().await?;

        info!(
            run,
            forwarded = stats.events_forwarded,
            filtered = stats.events_filtered,
            cursors = store.len().await,
            "Run finished"
        );
    }

    Ok(())
}
