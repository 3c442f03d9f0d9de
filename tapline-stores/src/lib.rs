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

//! Cursor store implementations for the Tapline relay.
//!
//! This crate provides backends for the
//! [`CursorStore`](tapline_core::cursor::CursorStore) trait, which persists
//! the relay's change stream position.
//!
//! # Available Stores
//!
//! - **Memory** (`memory` feature): in-process, lost on restart
//! - **MongoDB** (`mongo` feature): a dedicated collection next to the data
//!
//! # Example: MongoDB Store
//!
//! ```rust,ignore
//! use tapline_stores::mongo::MongoCursorStore;
//! use tapline_core::token::TokenManager;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = mongodb::Client::with_uri_str("mongodb://localhost:27017").await?;
//! let store = MongoCursorStore::from_client(&client, "db1", "changeStreamTokens");
//!
//! let tokens = TokenManager::new(store);
//! let latest = tokens.load_latest_cursor().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "mongo")]
pub mod mongo;
