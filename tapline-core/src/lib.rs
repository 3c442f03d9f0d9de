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

//! Tapline Core - MongoDB change data capture relay
//!
//! This crate tails a collection's change stream, writes the current state of
//! every inserted, updated or replaced document into a sink, and tracks its
//! position in a cursor store so a restart resumes where the last run left
//! off.
//!
//! # Key Components
//!
//! - **Events**: [`event`] defines change events read from the feed
//! - **Feed**: [`feed`] opens change streams at a saved token or a horizon
//! - **Cursors**: [`cursor`] and [`token`] persist and advance the position
//! - **Sink**: [`sink`] defines where forwarded documents go
//! - **Relay**: [`relay`] runs the loop and holds the crash-recovery logic
//! - **Metrics**: [`metrics`] instruments all of the above
//!
//! Storage backends live in `tapline-stores`, the `MongoDB` sink in
//! `tapline-sinks`, and the `tapline` binary in `tapline-cli`.
//!
//! # Example
//!
//! ```rust
//! use tapline_core::event::{ChangeEvent, OperationType};
//! use tapline_core::relay::{Disposition, RelayState};
//!
//! fn describe(event: &ChangeEvent) -> &'static str {
//!     match RelayState::classify(event) {
//!         Disposition::Forward(_) => "forwarded",
//!         Disposition::Filtered => "ignored",
//!         Disposition::Malformed => "dropped",
//!     }
//! }
//! ```

pub mod cursor;
pub mod event;
pub mod feed;
pub mod metrics;
pub mod relay;
pub mod sink;
pub mod token;
