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

//! End-to-end relay tests against a single-node replica set.
//!
//! Change streams need a replica set, so these tests start one in Docker.
//! They are ignored by default: `cargo test -p tapline-cli -- --ignored`

use bson::{doc, Document};
use futures::TryStreamExt;
use mongodb::{Client, Collection};
use std::time::Duration;
use tapline_core::feed::{FeedConfig, MongoFeedSource};
use tapline_core::relay::{Relay, RelayConfig};
use tapline_core::sink::WriteMode;
use tapline_core::token::TokenManager;
use tapline_sinks::mongo::{MongoSink, MongoSinkConfig};
use tapline_stores::mongo::MongoCursorStore;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::mongo::Mongo;
use tokio::task::JoinHandle;

const DB: &str = "db1";

async fn start_replica_set() -> (ContainerAsync<Mongo>, Client) {
    let container = Mongo::repl_set()
        .start()
        .await
        .expect("failed to start MongoDB container");

    let host_port = container
        .get_host_port_ipv4(27017)
        .await
        .expect("failed to get port");

    let client = Client::with_uri_str(format!(
        "mongodb://127.0.0.1:{host_port}/?directConnection=true"
    ))
    .await
    .expect("failed to create client");

    (container, client)
}

fn spawn_relay(client: &Client, mode: WriteMode) -> JoinHandle<()> {
    let source = MongoFeedSource::new(
        client.database(DB).collection("inputChangeStream"),
        FeedConfig::builder()
            .max_await_time(Duration::from_millis(200))
            .build()
            .unwrap(),
    );
    let store = MongoCursorStore::from_client(client, DB, "changeStreamTokens");
    let sink = MongoSink::new(
        client,
        MongoSinkConfig::builder()
            .database(DB)
            .collection("outputChangeStream")
            .write_mode(mode)
            .build()
            .unwrap(),
    );

    tokio::spawn(async move {
        let mut relay = Relay::new(RelayConfig::default(), source, TokenManager::new(store), sink);
        let _ = relay.run().await;
    })
}

async fn all(collection: &Collection<Document>) -> Vec<Document> {
    collection
        .find(doc! {})
        .sort(doc! { "_id": 1 })
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap()
}

async fn wait_for_count(collection: &Collection<Document>, expected: u64) {
    for _ in 0..100 {
        if collection.count_documents(doc! {}).await.unwrap() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {expected} documents");
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_relay_forwards_and_resumes_after_restart() {
    let (_container, client) = start_replica_set().await;
    let source = client.database(DB).collection::<Document>("inputChangeStream");
    let sink = client.database(DB).collection::<Document>("outputChangeStream");
    let cursors = client.database(DB).collection::<Document>("changeStreamTokens");

    let relay = spawn_relay(&client, WriteMode::Insert);
    tokio::time::sleep(Duration::from_secs(1)).await;

    source.insert_one(doc! { "_id": 1, "v": 1 }).await.unwrap();
    source.insert_one(doc! { "_id": 2, "v": 1 }).await.unwrap();
    source.delete_one(doc! { "_id": 2 }).await.unwrap();
    wait_for_count(&sink, 2).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    relay.abort();
    let _ = relay.await;

    // An abort inside the commit window may leave the previous record too
    assert!(cursors.count_documents(doc! {}).await.unwrap() <= 2);

    // Written while the relay is down
    source.insert_one(doc! { "_id": 3, "v": 1 }).await.unwrap();

    let relay = spawn_relay(&client, WriteMode::Insert);
    wait_for_count(&sink, 3).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    relay.abort();

    assert_eq!(
        all(&sink).await,
        vec![
            doc! { "_id": 1, "v": 1 },
            doc! { "_id": 2, "v": 1 },
            doc! { "_id": 3, "v": 1 },
        ]
    );
    assert_eq!(cursors.count_documents(doc! {}).await.unwrap(), 1);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_relay_upsert_mode_tracks_updates() {
    let (_container, client) = start_replica_set().await;
    let source = client.database(DB).collection::<Document>("inputChangeStream");
    let sink = client.database(DB).collection::<Document>("outputChangeStream");

    let relay = spawn_relay(&client, WriteMode::UpsertByKey);
    tokio::time::sleep(Duration::from_secs(1)).await;

    source.insert_one(doc! { "_id": 1, "v": 1 }).await.unwrap();
    source
        .update_one(doc! { "_id": 1 }, doc! { "$set": { "v": 2 } })
        .await
        .unwrap();
    source
        .replace_one(doc! { "_id": 1 }, doc! { "_id": 1, "v": 3 })
        .await
        .unwrap();

    for _ in 0..100 {
        if all(&sink).await == vec![doc! { "_id": 1, "v": 3 }] {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    relay.abort();

    assert_eq!(all(&sink).await, vec![doc! { "_id": 1, "v": 3 }]);
}
