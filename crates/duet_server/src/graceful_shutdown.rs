/* Copyright 2023- The Binedge, Lda team. All rights reserved.
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *     http://www.apache.org/licenses/LICENSE-2.0
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Mechanisms for shutting down the application without destroying anything
//! important. Suspended rendezvous callers are woken by the session directory
//! teardown that follows the shutdown signal.

use std::time::Duration;

use tokio::signal;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::warn;

/// The duration between [`global_shutdown_starts`] and [`global_shutdown_ends`].
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

static SHUTDOWN_INVOKED_AT: OnceCell<Instant> = OnceCell::const_new();

/// Listens for signals that cause the application to shut down; namely, `CTRL+C`.
async fn signal_listener() -> Instant {
    while signal::ctrl_c().await.is_err() { /* spin */ }

    warn!(
        "Global shutdown has been invoked; a hard termination follows in {}s",
        SHUTDOWN_GRACE_PERIOD.as_secs()
    );

    Instant::now()
}

/// Resolves when a global shutdown has started.
///
/// All tasks **should** start gracefully exiting by this time.
pub async fn global_shutdown_starts() {
    let invoked_at = *SHUTDOWN_INVOKED_AT.get_or_init(signal_listener).await;
    tokio::time::sleep_until(invoked_at).await;
}

/// Resolves when the application is about to unconditionally shut down,
/// following [`global_shutdown_starts`] by [`SHUTDOWN_GRACE_PERIOD`].
pub async fn global_shutdown_ends() {
    let invoked_at = *SHUTDOWN_INVOKED_AT.get_or_init(signal_listener).await;
    tokio::time::sleep_until(invoked_at + SHUTDOWN_GRACE_PERIOD).await;
}
