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

//! Tapline Sinks - sink writer implementations
//!
//! This crate provides [`Sink`](tapline_core::sink::Sink) implementations
//! for the Tapline relay. A sink receives the current full state of every
//! inserted, updated or replaced document.
//!
//! # Available Sinks
//!
//! - **MongoDB**: a collection, written by insert or by upsert on the
//!   document key
//!
//! The in-memory [`MemorySink`](tapline_core::sink::MemorySink) lives in
//! `tapline-core` for tests.

pub mod mongo;
