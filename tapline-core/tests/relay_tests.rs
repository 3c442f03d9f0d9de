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

//! Integration tests for the relay loop.
//!
//! These tests drive the relay with a scripted feed, an instrumented
//! in-memory cursor store and a memory sink, covering:
//! - Start position selection (saved token vs horizon)
//! - Cursor cleanup and the two-record bound
//! - Crash recovery between sink write, cursor save and cursor delete
//! - Operation filtering and malformed event handling

use bson::{doc, Document};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tapline_core::cursor::{CursorRecord, CursorStore, CursorStoreError};
use tapline_core::event::{ChangeEvent, Namespace, OperationType};
use tapline_core::feed::{
    FeedError, FeedSource, MongoChangeFeed, ScriptedFeedSource, StartPosition,
    DEFAULT_HORIZON, DEFAULT_MAX_BATCH_EVENTS,
};
use tapline_core::relay::{MalformedEventPolicy, Phase, Relay, RelayConfig, RelayError};
use tapline_core::sink::{MemorySink, WriteMode};
use tapline_core::token::TokenManager;
use tokio::sync::Mutex;

/// In-memory cursor store that records its high-water mark and can fail
/// the next insert or delete once.
#[derive(Debug, Clone, Default)]
struct RecordingCursorStore {
    records: Arc<Mutex<Vec<CursorRecord>>>,
    max_records: Arc<Mutex<usize>>,
    fail_next_insert: Arc<AtomicBool>,
    fail_next_delete: Arc<AtomicBool>,
}

impl RecordingCursorStore {
    async fn seeded(tokens: &[Document]) -> Self {
        let store = Self::default();
        for token in tokens {
            store.insert(token).await.unwrap();
        }
        store
    }

    fn crash_before_next_save(&self) {
        self.fail_next_insert.store(true, Ordering::SeqCst);
    }

    fn crash_before_next_delete(&self) {
        self.fail_next_delete.store(true, Ordering::SeqCst);
    }

    async fn tokens(&self) -> Vec<Document> {
        self.records
            .lock()
            .await
            .iter()
            .map(|r| r.resume_token().clone())
            .collect()
    }

    async fn max_records(&self) -> usize {
        *self.max_records.lock().await
    }
}

#[async_trait::async_trait]
impl CursorStore for RecordingCursorStore {
    async fn latest(&self) -> Result<Option<CursorRecord>, CursorStoreError> {
        Ok(self.records.lock().await.last().cloned())
    }

    async fn insert(&self, token: &Document) -> Result<CursorRecord, CursorStoreError> {
        if self.fail_next_insert.swap(false, Ordering::SeqCst) {
            return Err(CursorStoreError::Connection("simulated crash".to_string()));
        }

        let record = CursorRecord::new(token.clone());
        let mut records = self.records.lock().await;
        records.push(record.clone());

        let mut max = self.max_records.lock().await;
        *max = (*max).max(records.len());

        Ok(record)
    }

    async fn delete(&self, record: &CursorRecord) -> Result<bool, CursorStoreError> {
        if self.fail_next_delete.swap(false, Ordering::SeqCst) {
            return Err(CursorStoreError::Connection("simulated crash".to_string()));
        }

        let mut records = self.records.lock().await;
        match records.iter().position(|r| r.stored() == record.stored()) {
            Some(index) => {
                records.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self) -> Result<Vec<CursorRecord>, CursorStoreError> {
        Ok(self.records.lock().await.iter().rev().cloned().collect())
    }

    async fn close(&self) -> Result<(), CursorStoreError> {
        Ok(())
    }
}

/// A source whose feed holds every event in one driver buffer and ends with
/// an invalidation, the way a dropped collection shows up mid-batch.
#[derive(Debug, Clone)]
struct InvalidatedFeedSource {
    events: Vec<ChangeEvent>,
}

#[async_trait::async_trait]
impl FeedSource for InvalidatedFeedSource {
    type Feed = MongoChangeFeed;

    async fn open(&self, start: &StartPosition) -> Result<MongoChangeFeed, FeedError> {
        let skip = match start {
            StartPosition::ResumeAfter(token) => self
                .events
                .iter()
                .position(|e| &e.resume_token == token)
                .map_or(0, |index| index + 1),
            StartPosition::AtOperationTime(_) => 0,
        };

        let mut buffered: Vec<Result<ChangeEvent, FeedError>> =
            self.events[skip..].iter().cloned().map(Ok).collect();
        buffered.push(Err(FeedError::Invalidated {
            reason: "Collection db1.inputChangeStream was dropped or renamed".to_string(),
        }));

        let events = futures::stream::iter(buffered);
        Ok(MongoChangeFeed::from_stream(events, DEFAULT_MAX_BATCH_EVENTS))
    }
}

fn token(n: i32) -> Document {
    doc! { "_data": format!("{n:04}") }
}

fn change(operation: OperationType, n: i32, full_document: Option<Document>) -> ChangeEvent {
    ChangeEvent {
        operation,
        namespace: Namespace::new("db1", "inputChangeStream"),
        document_key: Some(doc! { "_id": n }),
        full_document,
        cluster_time: None,
        resume_token: token(n),
    }
}

fn insert(n: i32) -> ChangeEvent {
    change(OperationType::Insert, n, Some(doc! { "_id": n, "v": n }))
}

fn delete(n: i32) -> ChangeEvent {
    change(OperationType::Delete, n, None)
}

fn ids(sink: &MemorySink) -> Vec<i32> {
    sink.documents()
        .iter()
        .filter_map(|d| d.get_i32("_id").ok())
        .collect()
}

fn relay(
    source: &ScriptedFeedSource,
    store: &RecordingCursorStore,
    sink: MemorySink,
) -> Relay<ScriptedFeedSource, RecordingCursorStore, MemorySink> {
    Relay::new(
        RelayConfig::default(),
        source.clone(),
        TokenManager::new(store.clone()),
        sink,
    )
}

#[tokio::test]
async fn test_resumes_strictly_after_saved_token() {
    let store = RecordingCursorStore::seeded(&[token(2)]).await;
    let source = ScriptedFeedSource::new(vec![
        vec![insert(1), insert(2)],
        vec![insert(3), insert(4)],
    ]);

    let mut relay = relay(&source, &store, MemorySink::new());
    let stats = relay.run().await.unwrap();

    assert_eq!(source.opened(), vec![StartPosition::ResumeAfter(token(2))]);
    assert_eq!(ids(relay.sink()), vec![3, 4]);
    assert_eq!(stats.events_forwarded, 2);
    assert_eq!(store.tokens().await, vec![token(4)]);
}

#[tokio::test]
async fn test_empty_store_starts_at_bounded_horizon() {
    let store = RecordingCursorStore::default();
    let source = ScriptedFeedSource::new(vec![vec![insert(1)]]);
    let horizon = Duration::from_secs(24 * 60 * 60);

    let before = Utc::now().timestamp();
    let mut relay = Relay::new(
        RelayConfig::builder().horizon(horizon).build().unwrap(),
        source.clone(),
        TokenManager::new(store.clone()),
        MemorySink::new(),
    );
    relay.run().await.unwrap();
    let after = Utc::now().timestamp();

    let opened = source.opened();
    assert_eq!(opened.len(), 1);
    match &opened[0] {
        StartPosition::AtOperationTime(ts) => {
            let start = i64::from(ts.time);
            assert!(start >= before - 24 * 60 * 60);
            assert!(start <= after - 24 * 60 * 60);
        }
        other => panic!("expected horizon start, got {other:?}"),
    }
    assert_eq!(store.tokens().await, vec![token(1)]);
}

#[tokio::test]
async fn test_start_reports_phase() {
    let source = ScriptedFeedSource::new(vec![vec![insert(1)]]);

    let empty = RecordingCursorStore::default();
    let started = relay(&source, &empty, MemorySink::new()).start().await.unwrap();
    assert_eq!(started.phase, Phase::CatchingUpFromHorizon);
    assert!(!started.position.is_resume());
    assert_eq!(started.state.superseded(), None);

    let seeded = RecordingCursorStore::seeded(&[token(1)]).await;
    let started = relay(&source, &seeded, MemorySink::new()).start().await.unwrap();
    assert_eq!(started.phase, Phase::CatchingUpFromSavedToken);
    assert_eq!(started.position, StartPosition::ResumeAfter(token(1)));
    assert_eq!(
        started.state.pending_delete().map(CursorRecord::resume_token),
        Some(&token(1))
    );
}

#[tokio::test]
async fn test_n_events_leave_exactly_one_record() {
    let store = RecordingCursorStore::default();
    let source = ScriptedFeedSource::new(vec![
        (1..=4).map(insert).collect(),
        (5..=7).map(insert).collect(),
        (8..=10).map(insert).collect(),
    ]);

    let mut relay = relay(&source, &store, MemorySink::new());
    let stats = relay.run().await.unwrap();

    assert_eq!(stats.events_forwarded, 10);
    assert_eq!(stats.batches_read, 3);
    assert_eq!(store.tokens().await, vec![token(10)]);
    assert!(store.max_records().await <= 2);
}

#[tokio::test]
async fn test_at_most_two_records_when_resuming() {
    let store = RecordingCursorStore::seeded(&[token(0)]).await;
    let source = ScriptedFeedSource::new(vec![(0..=20).map(insert).collect()]);

    let mut relay = relay(&source, &store, MemorySink::new());
    relay.run().await.unwrap();

    assert_eq!(ids(relay.sink()), (1..=20).collect::<Vec<_>>());
    assert_eq!(store.max_records().await, 2);
    assert_eq!(store.tokens().await, vec![token(20)]);
}

#[tokio::test]
async fn test_crash_between_save_and_delete() {
    let store = RecordingCursorStore::seeded(&[token(0)]).await;
    let source = ScriptedFeedSource::new(vec![vec![insert(0), insert(1), insert(2), insert(3)]]);

    // First run dies right after saving the cursor for event 1
    store.crash_before_next_delete();
    let mut first = relay(&source, &store, MemorySink::new());
    let err = first.run().await.unwrap_err();

    assert!(err.is_transient());
    assert_eq!(ids(first.sink()), vec![1]);
    assert_eq!(store.tokens().await, vec![token(0), token(1)]);

    // Restart resumes after the new token and removes the orphan
    let mut second = relay(&source, &store, MemorySink::new());
    let stats = second.run().await.unwrap();

    assert_eq!(
        source.opened().last(),
        Some(&StartPosition::ResumeAfter(token(1)))
    );
    assert_eq!(stats.stale_cursors_swept, 1);
    assert_eq!(ids(second.sink()), vec![2, 3]);
    assert_eq!(store.tokens().await, vec![token(3)]);
    assert!(store.max_records().await <= 2);
}

#[tokio::test]
async fn test_crash_between_forward_and_save_reforwards() {
    let store = RecordingCursorStore::seeded(&[token(0)]).await;
    let source = ScriptedFeedSource::new(vec![vec![insert(0), insert(1), insert(2)]]);

    store.crash_before_next_save();
    let mut first = relay(&source, &store, MemorySink::new());
    assert!(first.run().await.is_err());
    assert_eq!(ids(first.sink()), vec![1]);
    assert_eq!(store.tokens().await, vec![token(0)]);

    let mut second = relay(&source, &store, MemorySink::new());
    second.run().await.unwrap();

    // Event 1 is delivered again: at-least-once, never skipped
    assert_eq!(ids(second.sink()), vec![1, 2]);
    assert_eq!(store.tokens().await, vec![token(2)]);
}

#[tokio::test]
async fn test_upsert_mode_absorbs_replayed_forward() {
    let store = RecordingCursorStore::seeded(&[token(0)]).await;
    let source = ScriptedFeedSource::new(vec![vec![insert(0), insert(1), insert(2)]]);
    let mut sink = MemorySink::with_mode(WriteMode::UpsertByKey);

    store.crash_before_next_save();
    let mut first = relay(&source, &store, MemorySink::with_mode(WriteMode::UpsertByKey));
    assert!(first.run().await.is_err());

    // Carry the sink contents over, as a durable collection would
    for document in first.sink().documents() {
        tapline_core::sink::Sink::forward(&mut sink, document, None)
            .await
            .unwrap();
    }

    let mut second = relay(&source, &store, sink);
    second.run().await.unwrap();

    assert_eq!(ids(second.sink()), vec![1, 2]);
}

#[tokio::test]
async fn test_only_insert_update_replace_are_forwarded() {
    let store = RecordingCursorStore::default();
    let source = ScriptedFeedSource::new(vec![vec![
        insert(1),
        delete(2),
        change(OperationType::Update, 3, Some(doc! { "_id": 3, "v": 30 })),
        change(OperationType::Replace, 4, Some(doc! { "_id": 4, "v": 40 })),
        delete(5),
    ]]);

    let mut relay = relay(&source, &store, MemorySink::new());
    let stats = relay.run().await.unwrap();

    assert_eq!(ids(relay.sink()), vec![1, 3, 4]);
    assert_eq!(stats.events_filtered, 2);
    // The trailing delete does not move the cursor
    assert_eq!(store.tokens().await, vec![token(4)]);
}

#[tokio::test]
async fn test_malformed_event_is_dropped() {
    let store = RecordingCursorStore::default();
    let source = ScriptedFeedSource::new(vec![vec![
        insert(1),
        change(OperationType::Update, 2, None),
        change(OperationType::Insert, 3, Some(Document::new())),
        insert(4),
    ]]);

    let mut relay = relay(&source, &store, MemorySink::new());
    let stats = relay.run().await.unwrap();

    assert_eq!(ids(relay.sink()), vec![1, 4]);
    assert_eq!(stats.events_malformed, 2);
    assert_eq!(store.tokens().await, vec![token(4)]);
    assert!(store.max_records().await <= 2);
}

#[tokio::test]
async fn test_trailing_malformed_event_does_not_move_cursor() {
    let store = RecordingCursorStore::default();
    let source = ScriptedFeedSource::new(vec![vec![
        insert(1),
        change(OperationType::Update, 2, None),
    ]]);

    let mut relay = relay(&source, &store, MemorySink::new());
    relay.run().await.unwrap();

    assert_eq!(store.tokens().await, vec![token(1)]);
}

#[tokio::test]
async fn test_fail_policy_stops_on_malformed_event() {
    let store = RecordingCursorStore::default();
    let source = ScriptedFeedSource::new(vec![vec![
        insert(1),
        change(OperationType::Update, 2, None),
        insert(3),
    ]]);

    let mut relay = Relay::new(
        RelayConfig::builder()
            .malformed_policy(MalformedEventPolicy::Fail)
            .build()
            .unwrap(),
        source.clone(),
        TokenManager::new(store.clone()),
        MemorySink::new(),
    );

    let err = relay.run().await.unwrap_err();
    assert!(matches!(err, RelayError::MalformedEvent { .. }));
    assert!(!err.is_transient());
    assert_eq!(ids(relay.sink()), vec![1]);
    assert_eq!(store.tokens().await, vec![token(1)]);
}

#[tokio::test]
async fn test_sink_failure_does_not_advance_cursor() {
    let store = RecordingCursorStore::default();
    let source = ScriptedFeedSource::new(vec![vec![insert(1), insert(2), insert(3)]]);

    let mut relay = relay(&source, &store, MemorySink::new().failing_after(1));
    let err = relay.run().await.unwrap_err();

    assert!(matches!(err, RelayError::Sink(_)));
    assert_eq!(store.tokens().await, vec![token(1)]);
}

#[tokio::test]
async fn test_feed_error_is_fatal_after_committing_prior_events() {
    let store = RecordingCursorStore::default();
    let source = ScriptedFeedSource::new(vec![vec![insert(1), insert(2)]]).failing_when_drained();

    let mut relay = relay(&source, &store, MemorySink::new());
    let err = relay.run().await.unwrap_err();

    assert!(matches!(err, RelayError::Feed(_)));
    assert!(err.is_transient());
    assert_eq!(relay.stats().events_forwarded, 2);
    assert_eq!(store.tokens().await, vec![token(2)]);
}

#[tokio::test]
async fn test_expired_token_fails_startup() {
    let store = RecordingCursorStore::seeded(&[token(99)]).await;
    let source = ScriptedFeedSource::new(vec![vec![insert(1)]]);

    let mut relay = relay(&source, &store, MemorySink::new());
    let err = relay.run().await.unwrap_err();

    assert!(matches!(
        err,
        RelayError::Feed(FeedError::InvalidResumeToken { code: 286 })
    ));
    assert!(!err.is_transient());
    assert_eq!(store.tokens().await, vec![token(99)]);
}

#[tokio::test]
async fn test_default_horizon_is_one_hundred_days() {
    assert_eq!(RelayConfig::default().horizon, DEFAULT_HORIZON);
    assert_eq!(DEFAULT_HORIZON, Duration::from_secs(100 * 24 * 60 * 60));
}

#[tokio::test]
async fn test_invalidation_after_buffered_events_commits_them_first() {
    let store = RecordingCursorStore::default();
    let source = InvalidatedFeedSource {
        events: vec![insert(1), insert(2)],
    };

    let mut relay = Relay::new(
        RelayConfig::default(),
        source.clone(),
        TokenManager::new(store.clone()),
        MemorySink::new(),
    );
    let err = relay.run().await.unwrap_err();

    assert!(matches!(err, RelayError::Feed(FeedError::Invalidated { .. })));
    assert_eq!(ids(relay.sink()), vec![1, 2]);
    assert_eq!(store.tokens().await, vec![token(2)]);

    // A restart moves past the committed events instead of replaying them
    let mut relay = Relay::new(
        RelayConfig::default(),
        source,
        TokenManager::new(store.clone()),
        MemorySink::new(),
    );
    let err = relay.run().await.unwrap_err();

    assert!(matches!(err, RelayError::Feed(FeedError::Invalidated { .. })));
    assert!(relay.sink().documents().is_empty());
    assert_eq!(store.tokens().await, vec![token(2)]);
}

#[tokio::test]
async fn test_run_from_uses_the_started_feed() {
    let store = RecordingCursorStore::seeded(&[token(1)]).await;
    let source = ScriptedFeedSource::new(vec![vec![insert(1), insert(2), insert(3)]]);

    let mut relay = relay(&source, &store, MemorySink::new());
    let started = relay.start().await.unwrap();
    assert_eq!(started.phase, Phase::CatchingUpFromSavedToken);

    let stats = relay.run_from(started).await.unwrap();

    assert_eq!(source.opened().len(), 1);
    assert_eq!(ids(relay.sink()), vec![2, 3]);
    assert_eq!(stats.events_forwarded, 2);
    assert_eq!(store.tokens().await, vec![token(3)]);
}

#[tokio::test]
async fn test_stats_reset_on_each_run() {
    let store = RecordingCursorStore::default();
    let source = ScriptedFeedSource::new(vec![vec![insert(1), insert(2)]]);

    let mut relay = relay(&source, &store, MemorySink::new());
    let first = relay.run().await.unwrap();
    let second = relay.run().await.unwrap();

    assert_eq!(first.events_forwarded, 2);
    assert_eq!(second.events_forwarded, 0);
    assert_eq!(relay.stats(), &second);
}
