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

//! The relay loop: change feed to sink, with crash-safe cursor tracking.
//!
//! The [`Relay`] ties a [`FeedSource`], a [`CursorStore`] (through the
//! [`TokenManager`]) and a [`Sink`] together:
//!
//! ```text
//! STARTING ──► CATCHING_UP_FROM_SAVED_TOKEN ─┐
//!          └─► CATCHING_UP_FROM_HORIZON ─────┴─► STREAMING ──► (feed error)
//! ```
//!
//! For every forwardable event, in feed order:
//!
//! 1. forward the full document to the sink
//! 2. save a cursor record for the event's token
//! 3. delete the superseded record (the one loaded at startup, or the
//!    previous event's)
//!
//! A crash between 2 and 3 leaves two records. The next start loads the
//! newer one and removes the other, so no event before the last durable
//! token is replayed and none after it is skipped. A crash between 1 and 2
//! re-forwards the event on restart (at-least-once).
//!
//! The per-event bookkeeping lives in [`RelayState`], a plain value threaded
//! through the loop so the transitions can be tested without a store.
//!
//! # Example
//!
//! ```rust,no_run
//! use tapline_core::feed::{FeedConfig, MongoFeedSource};
//! use tapline_core::relay::{Relay, RelayConfig};
//! use tapline_core::sink::MemorySink;
//! use tapline_core::token::TokenManager;
//! # use tapline_core::cursor::{CursorRecord, CursorStore, CursorStoreError};
//! # use bson::Document;
//! # struct Store;
//! # #[async_trait::async_trait]
//! # impl CursorStore for Store {
//! #     async fn latest(&self) -> Result<Option<CursorRecord>, CursorStoreError> { Ok(None) }
//! #     async fn insert(&self, t: &Document) -> Result<CursorRecord, CursorStoreError> {
//! #         Ok(CursorRecord::new(t.clone()))
//! #     }
//! #     async fn delete(&self, _: &CursorRecord) -> Result<bool, CursorStoreError> { Ok(true) }
//! #     async fn list(&self) -> Result<Vec<CursorRecord>, CursorStoreError> { Ok(vec![]) }
//! #     async fn close(&self) -> Result<(), CursorStoreError> { Ok(()) }
//! # }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = mongodb::Client::with_uri_str("mongodb://localhost:27017").await?;
//! let source = MongoFeedSource::new(
//!     client.database("db1").collection("inputChangeStream"),
//!     FeedConfig::default(),
//! );
//!
//! let mut relay = Relay::new(
//!     RelayConfig::default(),
//!     source,
//!     TokenManager::new(Store),
//!     MemorySink::new(),
//! );
//!
//! let stats = relay.run().await?;
//! println!("forwarded {} events", stats.events_forwarded);
//! # Ok(())
//! # }
//! ```

use crate::cursor::{CursorRecord, CursorStore, CursorStoreError};
use crate::event::ChangeEvent;
use crate::feed::{ChangeFeed, FeedError, FeedSource, StartPosition, DEFAULT_HORIZON};
use crate::metrics::{self, RelayStatus, SkipReason};
use crate::sink::{Sink, SinkError};
use crate::token::TokenManager;
use bson::Document;
use chrono::Utc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// What to do with a forwardable event whose document is missing or empty.
///
/// Such events come from update lookups that found nothing, typically
/// because the document was deleted before the lookup ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MalformedEventPolicy {
    /// Drop the event, log a warning and count it. The cursor is not
    /// advanced for it.
    #[default]
    Skip,
    /// Stop the relay with [`RelayError::MalformedEvent`].
    Fail,
}

impl std::str::FromStr for MalformedEventPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "fail" => Ok(Self::Fail),
            other => Err(format!("unknown malformed event policy: {other}")),
        }
    }
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Look-back window used when no cursor has been saved
    pub horizon: Duration,

    /// Handling of events without a usable document
    pub malformed_policy: MalformedEventPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            horizon: DEFAULT_HORIZON,
            malformed_policy: MalformedEventPolicy::default(),
        }
    }
}

impl RelayConfig {
    /// Creates a new builder for `RelayConfig`.
    #[must_use]
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::default()
    }
}

/// Builder for [`RelayConfig`].
#[derive(Debug, Default)]
pub struct RelayConfigBuilder {
    horizon: Option<Duration>,
    malformed_policy: Option<MalformedEventPolicy>,
}

impl RelayConfigBuilder {
    /// Sets the fallback look-back window. Default: 100 days.
    #[must_use]
    pub fn horizon(mut self, horizon: Duration) -> Self {
        self.horizon = Some(horizon);
        self
    }

    /// Sets the malformed event policy. Default: [`MalformedEventPolicy::Skip`].
    #[must_use]
    pub fn malformed_policy(mut self, policy: MalformedEventPolicy) -> Self {
        self.malformed_policy = Some(policy);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Configuration`] if the horizon is zero.
    pub fn build(self) -> Result<RelayConfig, RelayError> {
        let horizon = self.horizon.unwrap_or(DEFAULT_HORIZON);
        if horizon.is_zero() {
            return Err(RelayError::Configuration(
                "horizon must be greater than 0".to_string(),
            ));
        }

        Ok(RelayConfig {
            horizon,
            malformed_policy: self.malformed_policy.unwrap_or_default(),
        })
    }
}

/// How the relay treats one event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Disposition<'a> {
    /// Forward this document and advance the cursor.
    Forward(&'a Document),
    /// Not an insert, update or replace. Ignored.
    Filtered,
    /// Forwardable kind with no usable document.
    Malformed,
}

/// Cursor bookkeeping carried from one event to the next.
///
/// At most one of the two records is set: the startup record is the
/// superseded one only until the first event is committed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayState {
    pending_delete: Option<CursorRecord>,
    last_saved: Option<CursorRecord>,
}

impl RelayState {
    /// State for a run that loaded `loaded` at startup.
    #[must_use]
    pub fn resume_from(loaded: Option<CursorRecord>) -> Self {
        Self {
            pending_delete: loaded,
            last_saved: None,
        }
    }

    /// The record loaded at startup that has not been cleaned up yet.
    #[must_use]
    pub fn pending_delete(&self) -> Option<&CursorRecord> {
        self.pending_delete.as_ref()
    }

    /// The record saved for the previous forwarded event in this run.
    #[must_use]
    pub fn last_saved(&self) -> Option<&CursorRecord> {
        self.last_saved.as_ref()
    }

    /// The record to delete once the next event's cursor is durable.
    #[must_use]
    pub fn superseded(&self) -> Option<&CursorRecord> {
        self.pending_delete.as_ref().or(self.last_saved.as_ref())
    }

    /// The state after `saved` has been written and the superseded record
    /// deleted.
    #[must_use]
    pub fn committed(self, saved: CursorRecord) -> Self {
        Self {
            pending_delete: None,
            last_saved: Some(saved),
        }
    }

    /// Decides what to do with an event.
    #[must_use]
    pub fn classify(event: &ChangeEvent) -> Disposition<'_> {
        if !event.operation.is_forwardable() {
            return Disposition::Filtered;
        }

        match event.forwardable_document() {
            Some(document) => Disposition::Forward(document),
            None => Disposition::Malformed,
        }
    }
}

/// Where the feed was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Resuming after a saved cursor
    CatchingUpFromSavedToken,
    /// No cursor; starting at the look-back horizon
    CatchingUpFromHorizon,
}

impl Phase {
    /// Returns the phase as a static string for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CatchingUpFromSavedToken => "catching_up_from_saved_token",
            Self::CatchingUpFromHorizon => "catching_up_from_horizon",
        }
    }
}

/// Result of the startup transition.
#[derive(Debug)]
pub struct RelayStart<F> {
    /// Which start path was taken
    pub phase: Phase,
    /// The position the feed was opened at
    pub position: StartPosition,
    /// The open feed
    pub feed: F,
    /// Initial cursor bookkeeping
    pub state: RelayState,
}

/// Counters for one relay run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Batches read from the feed
    pub batches_read: u64,

    /// Events written to the sink
    pub events_forwarded: u64,

    /// Events ignored for their operation kind
    pub events_filtered: u64,

    /// Events dropped for a missing document
    pub events_malformed: u64,

    /// Orphaned cursor records removed at startup
    pub stale_cursors_swept: u64,
}

/// Relays change events from a feed into a sink.
pub struct Relay<F: FeedSource, S: CursorStore, K: Sink> {
    config: RelayConfig,
    source: F,
    tokens: TokenManager<S>,
    sink: K,
    stats: RelayStats,
}

impl<F: FeedSource, S: CursorStore, K: Sink> Relay<F, S, K> {
    /// Creates a relay. Nothing is read or opened until [`Relay::start`]
    /// or [`Relay::run`].
    pub fn new(config: RelayConfig, source: F, tokens: TokenManager<S>, sink: K) -> Self {
        info!(
            horizon_secs = config.horizon.as_secs(),
            malformed_policy = ?config.malformed_policy,
            sink = sink.name(),
            "Creating relay"
        );

        Self {
            config,
            source,
            tokens,
            sink,
            stats: RelayStats::default(),
        }
    }

    /// The sink.
    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// The token manager.
    pub fn tokens(&self) -> &TokenManager<S> {
        &self.tokens
    }

    /// Counters accumulated so far.
    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Performs the startup transition.
    ///
    /// Loads the newest cursor, removes any older orphans, and opens the
    /// feed after the loaded token or at `now - horizon`. Resets the
    /// counters. Hand the result to [`Relay::run_from`]; [`Relay::run`]
    /// does both steps.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor store cannot be read or the feed
    /// cannot be opened.
    #[instrument(skip(self))]
    pub async fn start(&mut self) -> Result<RelayStart<F::Feed>, RelayError> {
        self.stats = RelayStats::default();

        let loaded = self.tokens.load_latest_cursor().await?;

        let (phase, position) = match &loaded {
            Some(latest) => {
                let swept = self.tokens.sweep_stale_cursors(latest).await?;
                self.stats.stale_cursors_swept += swept as u64;
                (
                    Phase::CatchingUpFromSavedToken,
                    StartPosition::ResumeAfter(latest.resume_token().clone()),
                )
            }
            None => (
                Phase::CatchingUpFromHorizon,
                StartPosition::from_horizon(Utc::now(), self.config.horizon),
            ),
        };

        let feed = self.source.open(&position).await?;

        metrics::set_relay_status(RelayStatus::CatchingUp);
        info!(phase = phase.as_str(), position = ?position, "Change feed opened");

        Ok(RelayStart {
            phase,
            position,
            feed,
            state: RelayState::resume_from(loaded),
        })
    }

    /// Runs the relay until the feed ends or an error occurs.
    ///
    /// A live change stream does not end on its own, so in production this
    /// only returns with an error. Restarting after any error is safe.
    ///
    /// # Errors
    ///
    /// Returns the first feed, sink or cursor store error, or
    /// [`RelayError::MalformedEvent`] under [`MalformedEventPolicy::Fail`].
    pub async fn run(&mut self) -> Result<RelayStats, RelayError> {
        match self.start().await {
            Ok(started) => self.run_from(started).await,
            Err(e) => Err(self.stopped(e)),
        }
    }

    /// Runs the relay on a feed opened by [`Relay::start`].
    ///
    /// # Errors
    ///
    /// Same as [`Relay::run`], minus startup errors.
    pub async fn run_from(
        &mut self,
        started: RelayStart<F::Feed>,
    ) -> Result<RelayStats, RelayError> {
        match self.stream(started).await {
            Ok(()) => {
                metrics::set_relay_status(RelayStatus::Stopped);
                info!(stats = ?self.stats, "Change feed ended");
                Ok(self.stats.clone())
            }
            Err(e) => Err(self.stopped(e)),
        }
    }

    fn stopped(&self, e: RelayError) -> RelayError {
        metrics::increment_relay_errors(e.category());
        metrics::set_relay_status(RelayStatus::Error);
        error!(
            error = %e,
            transient = e.is_transient(),
            stats = ?self.stats,
            "Relay stopped"
        );
        e
    }

    async fn stream(&mut self, started: RelayStart<F::Feed>) -> Result<(), RelayError> {
        let RelayStart {
            phase,
            mut feed,
            mut state,
            ..
        } = started;

        let mut streaming = false;

        while let Some(batch) = feed.next_batch().await? {
            self.stats.batches_read += 1;
            metrics::record_feed_batch_size(batch.len());

            state = self.process_batch(state, &batch).await?;

            if !streaming {
                streaming = true;
                metrics::set_relay_status(RelayStatus::Streaming);
                info!(from = phase.as_str(), "Relay streaming");
            }
        }

        Ok(())
    }

    /// Processes a batch sequentially, in feed order.
    ///
    /// # Errors
    ///
    /// Stops at the first failing event; events before it are committed.
    pub async fn process_batch(
        &mut self,
        mut state: RelayState,
        batch: &[ChangeEvent],
    ) -> Result<RelayState, RelayError> {
        for event in batch {
            state = self.process_event(state, event).await?;
        }
        Ok(state)
    }

    /// Processes one event and returns the next state.
    ///
    /// # Errors
    ///
    /// Returns an error if the forward, the save or the delete fails. The
    /// cursor only advances once the forward has succeeded.
    pub async fn process_event(
        &mut self,
        state: RelayState,
        event: &ChangeEvent,
    ) -> Result<RelayState, RelayError> {
        match RelayState::classify(event) {
            Disposition::Filtered => {
                self.stats.events_filtered += 1;
                metrics::increment_events_skipped(SkipReason::FilteredOperation);
                debug!(operation = %event.operation, "Ignoring event");
                Ok(state)
            }
            Disposition::Malformed => {
                if self.config.malformed_policy == MalformedEventPolicy::Fail {
                    return Err(RelayError::MalformedEvent {
                        operation: event.operation.to_string(),
                        resume_token: event.resume_token.clone(),
                    });
                }

                self.stats.events_malformed += 1;
                metrics::increment_events_skipped(SkipReason::MalformedPayload);
                warn!(
                    operation = %event.operation,
                    document_key = ?event.document_key,
                    "Dropping event without a document"
                );
                Ok(state)
            }
            Disposition::Forward(document) => {
                let started = Instant::now();
                self.sink
                    .forward(document, event.document_key.as_ref())
                    .await?;
                metrics::record_forward_duration(started.elapsed());
                metrics::increment_events_forwarded(event.operation.as_str());

                let saved = self.tokens.save_cursor(&event.resume_token).await?;

                if let Some(superseded) = state.superseded() {
                    self.tokens.delete_cursor(superseded).await?;
                }

                self.stats.events_forwarded += 1;
                debug!(
                    operation = %event.operation,
                    document_key = ?event.document_key,
                    "Event forwarded"
                );

                Ok(state.committed(saved))
            }
        }
    }

    /// Closes the sink and the cursor store.
    ///
    /// # Errors
    ///
    /// Returns the first close error.
    pub async fn close(&mut self) -> Result<(), RelayError> {
        self.sink.close().await?;
        self.tokens.store().close().await?;
        Ok(())
    }
}

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The change feed failed
    #[error("Change feed error: {0}")]
    Feed(#[from] FeedError),

    /// The sink rejected a document
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// The cursor store failed
    #[error("Cursor store error: {0}")]
    CursorStore(#[from] CursorStoreError),

    /// An event had no document and the policy is [`MalformedEventPolicy::Fail`]
    #[error("{operation} event without a document at {resume_token}")]
    MalformedEvent {
        /// Operation kind of the event
        operation: String,
        /// Position token of the event
        resume_token: Document,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl RelayError {
    /// Returns true if restarting the relay may get past this error.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Feed(e) => e.is_retryable(),
            Self::Sink(e) => e.is_retryable(),
            Self::CursorStore(e) => matches!(e, CursorStoreError::Connection(_)),
            Self::MalformedEvent { .. } | Self::Configuration(_) => false,
        }
    }

    /// Returns the error category for metrics/logging.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Feed(_) => "feed",
            Self::Sink(_) => "sink",
            Self::CursorStore(_) => "cursor_store",
            Self::MalformedEvent { .. } => "malformed_event",
            Self::Configuration(_) => "configuration",
        }
    }
}
