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

//! In-process restarts of the relay.
//!
//! Each attempt re-runs the full startup transition, so it resumes from the
//! last durable cursor exactly as a process restart would. Only transient
//! errors are retried; with `max_restarts = 0` every error is returned.

use std::future::Future;
use std::time::Duration;
use tapline_core::relay::{RelayError, RelayStats};
use tracing::{error, warn};

/// Restart limits and backoff.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Restarts allowed over the process lifetime
    pub max_restarts: u32,

    /// Backoff before the first restart
    pub initial_backoff: Duration,

    /// Upper bound on the backoff
    pub max_backoff: Duration,

    /// Jitter factor (0.0 = none, 0.2 = +/-10%)
    pub jitter: f64,
}

impl RestartPolicy {
    /// Policy with the default backoff of 1s doubling up to 60s, 20% jitter.
    pub fn new(max_restarts: u32) -> Self {
        Self {
            max_restarts,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            jitter: 0.2,
        }
    }

    /// Backoff before restart number `attempt` (1-based).
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_backoff.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_backoff.as_millis()).unwrap_or(u64::MAX);

        let base_ms = initial_ms
            .saturating_mul(1_u64 << attempt.saturating_sub(1).min(63))
            .min(max_ms);

        // Random value in [base * (1 - jitter/2), base * (1 + jitter/2)]
        if self.jitter > 0.0 {
            let jitter_range = (base_ms as f64) * self.jitter;
            let jitter = (rand::random::<f64>() * jitter_range) - (jitter_range / 2.0);
            let final_ms = ((base_ms as f64) + jitter).max(0.0) as u64;
            Duration::from_millis(final_ms)
        } else {
            Duration::from_millis(base_ms)
        }
    }

    /// Whether to restart after `err`, given `restarts` already performed.
    pub fn should_restart(&self, restarts: u32, err: &RelayError) -> bool {
        restarts < self.max_restarts && err.is_transient()
    }
}

/// Runs `run_once` until it returns `Ok` or a non-restartable error.
///
/// `run_once` receives the 0-based attempt number.
pub async fn supervise<F, Fut>(
    policy: &RestartPolicy,
    mut run_once: F,
) -> Result<RelayStats, RelayError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<RelayStats, RelayError>>,
{
    let mut restarts = 0;

    loop {
        match run_once(restarts).await {
            Ok(stats) => return Ok(stats),
            Err(e) if policy.should_restart(restarts, &e) => {
                restarts += 1;
                let backoff = policy.calculate_backoff(restarts);
                warn!(
                    error = %e,
                    restart = restarts,
                    max_restarts = policy.max_restarts,
                    backoff_ms = backoff.as_millis(),
                    "Relay failed, restarting"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                if e.is_transient() && policy.max_restarts > 0 {
                    error!(restarts, "Restart limit reached");
                }
                return Err(e);
            }
        }
    }
}
