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

//! Change feed abstraction and the `MongoDB` change stream implementation.
//!
//! A [`FeedSource`] opens a [`ChangeFeed`] at a [`StartPosition`]. The feed
//! yields batches of [`ChangeEvent`]s in store order, forever, until the
//! stream is invalidated or the connection fails.
//!
//! ## Start positions
//!
//! ```text
//! saved cursor T  ──► ResumeAfter(T)        (first event is the one after T)
//! no cursor       ──► AtOperationTime(now - horizon)
//! ```
//!
//! The horizon bounds catch-up work on a first run; the feed never starts
//! from the beginning of the oplog.
//!
//! ## Server-side shaping
//!
//! [`FeedConfig::pipeline`] filters to insert/update/replace and projects
//! away everything the relay does not read. Update events are delivered with
//! the full current document (`fullDocument: "updateLookup"`).
//!
//! ## Failure model
//!
//! There is no reconnection loop here. The driver performs its own single
//! automatic resume on resumable errors; anything that still surfaces ends
//! the feed and the relay with it. A restart resumes from the last durable
//! cursor.
//!
//! # Example
//!
//! ```rust,no_run
//! use tapline_core::feed::{ChangeFeed, FeedConfig, FeedSource, MongoFeedSource, StartPosition};
//! use mongodb::{bson::Document, Client};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::with_uri_str("mongodb://localhost:27017").await?;
//! let collection = client.database("db1").collection::<Document>("inputChangeStream");
//!
//! let source = MongoFeedSource::new(collection, FeedConfig::default());
//! let start = StartPosition::from_horizon(chrono::Utc::now(), Duration::from_secs(3600));
//! let mut feed = source.open(&start).await?;
//!
//! while let Some(batch) = feed.next_batch().await? {
//!     for event in batch {
//!         println!("{} {:?}", event.operation, event.document_key);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use crate::event::{ChangeEvent, ConversionError};
use async_trait::async_trait;
use bson::{doc, Document, Timestamp};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use mongodb::{
    change_stream::event::ResumeToken,
    error::{Error as MongoError, ErrorKind as MongoErrorKind},
    options::{ChangeStreamOptions, FullDocumentType},
    Collection,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

/// Look-back window used when no cursor has been saved yet.
pub const DEFAULT_HORIZON: Duration = Duration::from_secs(100 * 24 * 60 * 60);

/// Upper bound on events handed to the relay in one batch.
pub const DEFAULT_MAX_BATCH_EVENTS: usize = 1000;

/// Error code the server returns when a resume token is no longer in the oplog.
const CHANGE_STREAM_FATAL_ERROR: i32 = 286;

/// Where a feed starts reading.
#[derive(Debug, Clone, PartialEq)]
pub enum StartPosition {
    /// Resume strictly after the event that produced this token.
    ResumeAfter(Document),
    /// Start at an operation time (the horizon fallback).
    AtOperationTime(Timestamp),
}

impl StartPosition {
    /// Builds the fallback position `now - horizon`.
    ///
    /// Clamped to the Unix epoch for horizons reaching further back.
    #[must_use]
    pub fn from_horizon(now: DateTime<Utc>, horizon: Duration) -> Self {
        let horizon_secs = i64::try_from(horizon.as_secs()).unwrap_or(i64::MAX);
        let start = now.timestamp().saturating_sub(horizon_secs);
        let time = u32::try_from(start.max(0)).unwrap_or(u32::MAX);

        Self::AtOperationTime(Timestamp { time, increment: 0 })
    }

    /// Returns true for a saved-token resume.
    #[must_use]
    pub fn is_resume(&self) -> bool {
        matches!(self, Self::ResumeAfter(_))
    }
}

/// Errors that can occur while reading a change feed.
#[derive(Debug, Error)]
pub enum FeedError {
    /// `MongoDB` connection or command error
    #[error("Connection error: {message}")]
    Connection {
        /// Human-readable error message
        message: String,
        /// The underlying driver error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        /// `MongoDB` error code
        code: Option<i32>,
        /// `MongoDB` error labels (e.g., "ResumableChangeStreamError")
        labels: Vec<String>,
    },

    /// Failed to convert a driver event to a [`ChangeEvent`]
    #[error("Event conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    /// Stream was invalidated (collection dropped/renamed)
    #[error("Stream invalidated: {reason}")]
    Invalidated {
        /// What invalidated the stream
        reason: String,
    },

    /// Resume token is no longer in the oplog (error code 286)
    #[error("Invalid resume token (code {code}): oplog may be truncated")]
    InvalidResumeToken {
        /// Server error code
        code: i32,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<MongoError> for FeedError {
    fn from(err: MongoError) -> Self {
        Self::from_mongo_error(err)
    }
}

impl FeedError {
    /// Classifies a driver error by code and labels.
    pub fn from_mongo_error(err: MongoError) -> Self {
        let code = match err.kind.as_ref() {
            MongoErrorKind::Command(cmd_err) => Some(cmd_err.code),
            _ => None,
        };

        if code == Some(CHANGE_STREAM_FATAL_ERROR) {
            return Self::InvalidResumeToken {
                code: CHANGE_STREAM_FATAL_ERROR,
            };
        }

        let labels: Vec<String> = err.labels().iter().cloned().collect();

        Self::Connection {
            message: err.to_string(),
            source: Some(Box::new(err)),
            code,
            labels,
        }
    }

    /// Returns true if reopening the feed from the last durable cursor may
    /// succeed.
    ///
    /// Uses error labels (`ResumableChangeStreamError`, `NetworkError`,
    /// `RetryableWriteError`, `TransientTransactionError`) and the transient
    /// codes 6, 7, 43, 89, 91, 10107, 11600, 11602, 13435, 13436.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { code, labels, .. } => {
                if labels.iter().any(|l| {
                    l == "ResumableChangeStreamError"
                        || l == "NetworkError"
                        || l == "RetryableWriteError"
                        || l == "TransientTransactionError"
                }) {
                    return true;
                }

                matches!(
                    code,
                    Some(
                        6 |     // HostUnreachable
                        7 |     // HostNotFound
                        43 |    // CursorNotFound
                        89 |    // NetworkTimeout
                        91 |    // ShutdownInProgress
                        10107 | // NotWritablePrimary
                        11600 | // InterruptedAtShutdown
                        11602 | // InterruptedDueToReplStateChange
                        13435 | // NotPrimaryNoSecondaryOk
                        13436   // NotPrimaryOrSecondary
                    )
                )
            }
            Self::Conversion(_)
            | Self::Invalidated { .. }
            | Self::InvalidResumeToken { .. }
            | Self::Configuration(_) => false,
        }
    }

    /// Returns the error category for metrics/logging.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Conversion(_) => "conversion",
            Self::Invalidated { .. } => "invalidated",
            Self::InvalidResumeToken { .. } => "invalid_token",
            Self::Configuration(_) => "configuration",
        }
    }
}

/// Configuration for the change feed.
///
/// ```rust
/// use tapline_core::feed::FeedConfig;
/// use std::time::Duration;
///
/// let config = FeedConfig::builder()
///     .batch_size(500)
///     .max_await_time(Duration::from_secs(1))
///     .build()
///     .unwrap();
/// assert!(config.full_document_update_lookup);
/// ```
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Deliver the current full document for update events
    pub full_document_update_lookup: bool,

    /// Project events down to the fields the relay reads
    pub project_fields: bool,

    /// Driver batch size for each `getMore`
    pub batch_size: Option<u32>,

    /// How long the server waits for new events before returning an empty batch
    pub max_await_time: Option<Duration>,

    /// Maximum events handed to the relay in one batch
    pub max_batch_events: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            full_document_update_lookup: true,
            project_fields: true,
            batch_size: None,
            max_await_time: None,
            max_batch_events: DEFAULT_MAX_BATCH_EVENTS,
        }
    }
}

impl FeedConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> FeedConfigBuilder {
        FeedConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Configuration`] if `max_batch_events` or
    /// `batch_size` is zero, or `max_await_time` is zero.
    pub fn validate(&self) -> Result<(), FeedError> {
        if self.max_batch_events == 0 {
            return Err(FeedError::Configuration(
                "max_batch_events must be greater than 0".to_string(),
            ));
        }

        if self.batch_size == Some(0) {
            return Err(FeedError::Configuration(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.max_await_time.is_some_and(|d| d.is_zero()) {
            return Err(FeedError::Configuration(
                "max_await_time must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// The aggregation pipeline applied to the change stream.
    #[must_use]
    pub fn pipeline(&self) -> Vec<Document> {
        let mut pipeline = vec![doc! {
            "$match": {
                "operationType": { "$in": ["insert", "update", "replace"] }
            }
        }];

        if self.project_fields {
            // `_id` must survive: the driver needs it to track resume tokens
            pipeline.push(doc! {
                "$project": {
                    "_id": 1,
                    "operationType": 1,
                    "fullDocument": 1,
                    "ns": 1,
                    "documentKey": 1,
                    "clusterTime": 1,
                }
            });
        }

        pipeline
    }

    /// Converts this config and a start position to driver options.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Conversion`] if the saved token cannot be read
    /// back as a driver resume token.
    pub fn to_mongo_options(
        &self,
        start: &StartPosition,
    ) -> Result<ChangeStreamOptions, FeedError> {
        let mut options = ChangeStreamOptions::default();

        if self.full_document_update_lookup {
            options.full_document = Some(FullDocumentType::UpdateLookup);
        }

        options.batch_size = self.batch_size;
        options.max_await_time = self.max_await_time;

        match start {
            StartPosition::ResumeAfter(token) => {
                options.resume_after = Some(resume_token_from_document(token)?);
            }
            StartPosition::AtOperationTime(timestamp) => {
                options.start_at_operation_time = Some(*timestamp);
            }
        }

        Ok(options)
    }
}

/// Reads a persisted token document back as a driver resume token.
fn resume_token_from_document(token: &Document) -> Result<ResumeToken, ConversionError> {
    let bytes = bson::to_vec(token)
        .map_err(|e| ConversionError::ResumeTokenConversion(e.to_string()))?;
    bson::from_slice::<ResumeToken>(&bytes)
        .map_err(|e| ConversionError::ResumeTokenConversion(e.to_string()))
}

/// Builder for [`FeedConfig`].
#[derive(Debug, Default)]
pub struct FeedConfigBuilder {
    full_document_update_lookup: Option<bool>,
    project_fields: Option<bool>,
    batch_size: Option<u32>,
    max_await_time: Option<Duration>,
    max_batch_events: Option<usize>,
}

impl FeedConfigBuilder {
    /// Enables or disables update lookup. Default: enabled.
    ///
    /// Without it update events carry no full document and are dropped as
    /// malformed.
    #[must_use]
    pub fn full_document_update_lookup(mut self, enabled: bool) -> Self {
        self.full_document_update_lookup = Some(enabled);
        self
    }

    /// Enables or disables the `$project` stage. Default: enabled.
    #[must_use]
    pub fn project_fields(mut self, enabled: bool) -> Self {
        self.project_fields = Some(enabled);
        self
    }

    /// Sets the driver batch size.
    #[must_use]
    pub fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Sets the server-side await time for empty batches.
    #[must_use]
    pub fn max_await_time(mut self, duration: Duration) -> Self {
        self.max_await_time = Some(duration);
        self
    }

    /// Sets the maximum number of events per relay batch. Default: 1000.
    #[must_use]
    pub fn max_batch_events(mut self, max: usize) -> Self {
        self.max_batch_events = Some(max);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Configuration`] if validation fails.
    pub fn build(self) -> Result<FeedConfig, FeedError> {
        let defaults = FeedConfig::default();
        let config = FeedConfig {
            full_document_update_lookup: self
                .full_document_update_lookup
                .unwrap_or(defaults.full_document_update_lookup),
            project_fields: self.project_fields.unwrap_or(defaults.project_fields),
            batch_size: self.batch_size,
            max_await_time: self.max_await_time,
            max_batch_events: self.max_batch_events.unwrap_or(defaults.max_batch_events),
        };

        config.validate()?;
        Ok(config)
    }
}

/// An open, non-restartable sequence of change event batches.
#[async_trait]
pub trait ChangeFeed: Send {
    /// Waits for the next batch.
    ///
    /// Returns `Ok(None)` once the feed has ended; a live change stream only
    /// ends when it is closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the feed cannot be read. The feed must not be
    /// used after an error.
    async fn next_batch(&mut self) -> Result<Option<Vec<ChangeEvent>>, FeedError>;
}

/// Opens change feeds at a start position.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// The feed type this source opens.
    type Feed: ChangeFeed;

    /// Opens a feed at `start`.
    ///
    /// # Errors
    ///
    /// Returns an error if the feed cannot be opened, including when a
    /// resume token is no longer available.
    async fn open(&self, start: &StartPosition) -> Result<Self::Feed, FeedError>;
}

/// Opens `MongoDB` change streams on one collection.
#[derive(Debug, Clone)]
pub struct MongoFeedSource {
    collection: Collection<Document>,
    config: FeedConfig,
}

impl MongoFeedSource {
    /// Creates a source watching `collection`.
    #[must_use]
    pub fn new(collection: Collection<Document>, config: FeedConfig) -> Self {
        Self { collection, config }
    }

    /// The feed configuration.
    #[must_use]
    pub fn config(&self) -> &FeedConfig {
        &self.config
    }
}

#[async_trait]
impl FeedSource for MongoFeedSource {
    type Feed = MongoChangeFeed;

    async fn open(&self, start: &StartPosition) -> Result<MongoChangeFeed, FeedError> {
        let namespace = format!(
            "{}.{}",
            self.collection.namespace().db,
            self.collection.namespace().coll
        );

        info!(namespace = %namespace, start = ?start, "Opening change stream");

        let options = self.config.to_mongo_options(start)?;
        let stream = self
            .collection
            .watch()
            .pipeline(self.config.pipeline())
            .with_options(options)
            .await?;

        let events = stream.map(move |result| -> Result<ChangeEvent, FeedError> {
            let event = ChangeEvent::try_from(result?)?;
            if event.is_invalidate() {
                let reason = format!("Collection {namespace} was dropped or renamed");
                error!("{}", reason);
                return Err(FeedError::Invalidated { reason });
            }
            Ok(event)
        });

        Ok(MongoChangeFeed::from_stream(events, self.config.max_batch_events))
    }
}

/// A live `MongoDB` change stream.
///
/// A batch is the first available event plus every event the driver has
/// already buffered, so batches follow the server's `getMore` batches.
///
/// An error met while draining the buffer ends the batch early. The events
/// read before it are returned first and the error is returned by the next
/// call, so the relay commits them before it stops.
pub struct MongoChangeFeed {
    events: BoxStream<'static, Result<ChangeEvent, FeedError>>,
    max_batch_events: usize,
    pending_error: Option<FeedError>,
}

impl MongoChangeFeed {
    /// Batches an already converted event stream.
    pub fn from_stream<St>(events: St, max_batch_events: usize) -> Self
    where
        St: Stream<Item = Result<ChangeEvent, FeedError>> + Send + 'static,
    {
        Self {
            events: events.boxed(),
            max_batch_events: max_batch_events.max(1),
            pending_error: None,
        }
    }
}

impl std::fmt::Debug for MongoChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoChangeFeed")
            .field("max_batch_events", &self.max_batch_events)
            .field("pending_error", &self.pending_error)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ChangeFeed for MongoChangeFeed {
    async fn next_batch(&mut self) -> Result<Option<Vec<ChangeEvent>>, FeedError> {
        if let Some(err) = self.pending_error.take() {
            return Err(err);
        }

        let first = match self.events.next().await {
            Some(result) => result?,
            None => return Ok(None),
        };

        let mut batch = vec![first];

        // Only take what is ready; a pending poll leaves the getMore with the cursor
        while batch.len() < self.max_batch_events {
            match self.events.next().now_or_never() {
                Some(Some(Ok(event))) => batch.push(event),
                Some(Some(Err(err))) => {
                    debug!(
                        batch_size = batch.len(),
                        error = %err,
                        "Deferring change stream error until the batch is processed"
                    );
                    self.pending_error = Some(err);
                    break;
                }
                Some(None) | None => break,
            }
        }

        debug!(batch_size = batch.len(), "Read change stream batch");
        Ok(Some(batch))
    }
}

/// A feed source that replays a fixed script of batches.
///
/// Resuming after a token skips every event up to and including the event
/// carrying that token, like a real change stream. Resuming after a token
/// that is not in the script fails with [`FeedError::InvalidResumeToken`].
/// Each `open` records its start position.
#[derive(Debug, Clone, Default)]
pub struct ScriptedFeedSource {
    batches: Vec<Vec<ChangeEvent>>,
    fail_when_drained: bool,
    opened: Arc<Mutex<Vec<StartPosition>>>,
}

impl ScriptedFeedSource {
    /// Creates a source replaying `batches`.
    #[must_use]
    pub fn new(batches: Vec<Vec<ChangeEvent>>) -> Self {
        Self {
            batches,
            ..Self::default()
        }
    }

    /// Ends every feed with a retryable connection error instead of `None`.
    #[must_use]
    pub fn failing_when_drained(mut self) -> Self {
        self.fail_when_drained = true;
        self
    }

    /// Start positions passed to `open`, oldest first.
    #[must_use]
    pub fn opened(&self) -> Vec<StartPosition> {
        self.opened
            .lock()
            .map(|opened| opened.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl FeedSource for ScriptedFeedSource {
    type Feed = ScriptedFeed;

    async fn open(&self, start: &StartPosition) -> Result<ScriptedFeed, FeedError> {
        if let Ok(mut opened) = self.opened.lock() {
            opened.push(start.clone());
        }

        let mut batches: VecDeque<Vec<ChangeEvent>> = self.batches.iter().cloned().collect();

        if let StartPosition::ResumeAfter(token) = start {
            let mut found = false;
            while let Some(mut batch) = batches.pop_front() {
                if let Some(index) = batch.iter().position(|e| &e.resume_token == token) {
                    batch.drain(..=index);
                    if !batch.is_empty() {
                        batches.push_front(batch);
                    }
                    found = true;
                    break;
                }
            }

            if !found {
                return Err(FeedError::InvalidResumeToken {
                    code: CHANGE_STREAM_FATAL_ERROR,
                });
            }
        }

        Ok(ScriptedFeed {
            batches,
            fail_when_drained: self.fail_when_drained,
        })
    }
}

/// Feed opened by [`ScriptedFeedSource`].
#[derive(Debug)]
pub struct ScriptedFeed {
    batches: VecDeque<Vec<ChangeEvent>>,
    fail_when_drained: bool,
}

#[async_trait]
impl ChangeFeed for ScriptedFeed {
    async fn next_batch(&mut self) -> Result<Option<Vec<ChangeEvent>>, FeedError> {
        match self.batches.pop_front() {
            Some(batch) => Ok(Some(batch)),
            None if self.fail_when_drained => Err(FeedError::Connection {
                message: "scripted feed drained".to_string(),
                source: None,
                code: Some(89),
                labels: Vec::new(),
            }),
            None => Ok(None),
        }
    }
}
