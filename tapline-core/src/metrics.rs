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

//! Metrics instrumentation for relay observability.
//!
//! Built on the `metrics` facade, so any exporter can be installed by the
//! binary (the `tapline` CLI installs Prometheus). With no recorder
//! installed every call here is a no-op.
//!
//! # Naming Conventions
//!
//! - Prefix with `tapline_`
//! - Counters end with `_total`
//! - Durations end with `_seconds`
//!
//! Labels are limited to low-cardinality values: operation kind, skip
//! reason, error category. Never label with document ids or tokens.
//!
//! # Examples
//!
//! ```rust
//! use tapline_core::metrics::{self, SkipReason};
//!
//! metrics::init_metrics();
//! metrics::increment_events_forwarded("insert");
//! metrics::increment_events_skipped(SkipReason::MalformedPayload);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric name prefix for all relay metrics.
#[doc(hidden)]
pub const METRIC_PREFIX: &str = "tapline";

/// Events written to the sink.
///
/// Type: Counter
/// Labels: operation
#[doc(hidden)]
pub const EVENTS_FORWARDED_TOTAL: &str = "tapline_events_forwarded_total";

/// Events read from the feed but not forwarded.
///
/// Type: Counter
/// Labels: reason
#[doc(hidden)]
pub const EVENTS_SKIPPED_TOTAL: &str = "tapline_events_skipped_total";

/// Cursor records inserted.
///
/// Type: Counter
#[doc(hidden)]
pub const CURSORS_SAVED_TOTAL: &str = "tapline_cursors_saved_total";

/// Cursor records deleted.
///
/// Type: Counter
/// Labels: kind (superseded, stale)
#[doc(hidden)]
pub const CURSORS_DELETED_TOTAL: &str = "tapline_cursors_deleted_total";

/// Sink write latency.
///
/// Type: Histogram
/// Unit: seconds
#[doc(hidden)]
pub const FORWARD_DURATION_SECONDS: &str = "tapline_forward_duration_seconds";

/// Events per batch read from the feed.
///
/// Type: Histogram
const FEED_BATCH_SIZE: &str = "tapline_feed_batch_size";

/// Relay failures.
///
/// Type: Counter
/// Labels: error_type
const RELAY_ERRORS_TOTAL: &str = "tapline_relay_errors_total";

/// Current relay status (0=stopped, 1=catching up, 2=streaming, 3=error).
///
/// Type: Gauge
const RELAY_STATUS: &str = "tapline_relay_status";

/// Initializes metric descriptions.
///
/// Call once at startup, after installing a recorder.
pub fn init_metrics() {
    describe_counter!(
        EVENTS_FORWARDED_TOTAL,
        "Total number of change events whose document was written to the sink"
    );

    describe_counter!(
        EVENTS_SKIPPED_TOTAL,
        "Total number of change events read from the feed but not forwarded"
    );

    describe_counter!(
        CURSORS_SAVED_TOTAL,
        "Total number of cursor records inserted into the cursor store"
    );

    describe_counter!(
        CURSORS_DELETED_TOTAL,
        "Total number of cursor records removed from the cursor store"
    );

    describe_counter!(RELAY_ERRORS_TOTAL, "Total number of fatal relay errors");

    describe_histogram!(
        FORWARD_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Time taken to write one document to the sink"
    );

    describe_histogram!(
        FEED_BATCH_SIZE,
        metrics::Unit::Count,
        "Number of events in each batch read from the change feed"
    );

    describe_gauge!(
        RELAY_STATUS,
        "Current relay status: 0=stopped, 1=catching up, 2=streaming, 3=error"
    );
}

/// Why an event read from the feed was not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// Operation kind carries no current document (delete, drop, ...)
    FilteredOperation,
    /// Forwardable kind but the document payload is missing or empty
    MalformedPayload,
}

impl SkipReason {
    /// Returns the reason as a static string for metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FilteredOperation => "filtered_operation",
            Self::MalformedPayload => "malformed_payload",
        }
    }
}

/// Kind of cursor deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorDeletion {
    /// The record replaced by a newly saved one
    Superseded,
    /// An orphan found at startup
    Stale,
}

impl CursorDeletion {
    /// Returns the kind as a static string for metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Superseded => "superseded",
            Self::Stale => "stale",
        }
    }
}

/// Relay status values for the status gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayStatus {
    /// Not running
    Stopped = 0,
    /// Feed opened, first batch not yet processed
    CatchingUp = 1,
    /// Processing batches
    Streaming = 2,
    /// Stopped on a fatal error
    Error = 3,
}

/// Increments the forwarded-events counter.
pub fn increment_events_forwarded(operation: &str) {
    counter!(EVENTS_FORWARDED_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Increments the skipped-events counter.
pub fn increment_events_skipped(reason: SkipReason) {
    counter!(EVENTS_SKIPPED_TOTAL, "reason" => reason.as_str()).increment(1);
}

/// Increments the saved-cursors counter.
pub fn increment_cursors_saved() {
    counter!(CURSORS_SAVED_TOTAL).increment(1);
}

/// Increments the deleted-cursors counter.
pub fn increment_cursors_deleted(kind: CursorDeletion) {
    counter!(CURSORS_DELETED_TOTAL, "kind" => kind.as_str()).increment(1);
}

/// Increments the relay error counter.
pub fn increment_relay_errors(error_type: &'static str) {
    counter!(RELAY_ERRORS_TOTAL, "error_type" => error_type).increment(1);
}

/// Records how long one sink write took.
pub fn record_forward_duration(duration: Duration) {
    histogram!(FORWARD_DURATION_SECONDS).record(duration.as_secs_f64());
}

/// Records the size of a feed batch.
#[allow(clippy::cast_precision_loss)]
pub fn record_feed_batch_size(size: usize) {
    histogram!(FEED_BATCH_SIZE).record(size as f64);
}

/// Sets the relay status gauge.
pub fn set_relay_status(status: RelayStatus) {
    gauge!(RELAY_STATUS).set(f64::from(status as u8));
}
