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

//! The directory of live sessions.
//!
//! A single [`SessionManager`] is owned by the server and injected into every
//! handler. It creates sessions lazily on first sight of a session id,
//! enforces the directory capacity, and runs the periodic TTL sweep that
//! closes idle sessions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::envelope::{CloseReason, ProxyError};
use crate::session::{Session, SessionState};

/// Directory-level knobs, snapshotted from settings at server start.
#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    /// Hard directory capacity.
    pub max_sessions: usize,
    /// Idle TTL before the sweep closes a session.
    pub session_ttl: Duration,
    /// Sweep period.
    pub cleanup_interval: Duration,
    /// When full, close the idlest session instead of refusing admission.
    pub evict_when_full: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            session_ttl: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(60),
            evict_when_full: true,
        }
    }
}

/// A redacted view of one directory entry, for admin listings.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SessionSnapshot {
    /// The rendezvous key.
    pub id: String,
    /// Lifecycle state at snapshot time.
    pub state: SessionState,
    /// Seconds since the session was created.
    pub age_seconds: u64,
    /// Seconds since the last accepted request or delivery.
    pub idle_seconds: u64,
}

/// The session directory: id to [`Session`], plus admission control and the
/// TTL sweep.
pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    config: ManagerConfig,

    /// Serializes creation and eviction so the capacity check is exact and
    /// two simultaneous first arrivals of one id observe one session.
    admission: Mutex<()>,

    created_total: AtomicU64,
    evicted_total: AtomicU64,
    expired_total: AtomicU64,
}

impl SessionManager {
    /// Creates an empty directory.
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
            admission: Mutex::new(()),
            created_total: AtomicU64::new(0),
            evicted_total: AtomicU64::new(0),
            expired_total: AtomicU64::new(0),
        }
    }

    /// The directory configuration in force.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Looks up the session for `id`, creating it when absent. A session
    /// already closed (handshake timeout, TTL) counts as absent and is
    /// replaced, so a retry starts a fresh handshake.
    pub fn get_or_create(&self, id: &str) -> Result<Arc<Session>, ProxyError> {
        if let Some(live) = self.get(id) {
            return Ok(live);
        }

        let _admission = self
            .admission
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        // Re-check: another caller may have created it while we queued.
        if let Some(live) = self.get(id) {
            return Ok(live);
        }
        self.drop_closed(id);

        if self.sessions.len() >= self.config.max_sessions {
            if self.config.evict_when_full {
                self.evict_idlest();
            }

            if self.sessions.len() >= self.config.max_sessions {
                warn!(
                    session = id,
                    capacity = self.config.max_sessions,
                    "directory full, refusing admission"
                );
                return Err(ProxyError::Overloaded);
            }
        }

        let session = Arc::new(Session::new(id));
        self.sessions.insert(id.to_string(), session.clone());
        self.created_total.fetch_add(1, Ordering::Relaxed);
        info!(session = id, "session created");

        Ok(session)
    }

    /// Looks up a live session without creating one.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.get(id).map(|entry| entry.value().clone())?;

        (!session.is_closed()).then_some(session)
    }

    /// Closes and removes one session. Returns whether it existed.
    pub fn close(&self, id: &str, reason: CloseReason) -> bool {
        let Some((_, session)) = self.sessions.remove(id) else {
            return false;
        };

        session.close(reason);
        info!(session = id, %reason, "session removed");

        true
    }

    /// Closes every session. Used at shutdown.
    pub fn close_all(&self, reason: CloseReason) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();

        for id in ids {
            self.close(&id, reason);
        }
    }

    /// Number of live (non-closed) sessions.
    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .count()
    }

    /// Sessions created since startup.
    pub fn created_total(&self) -> u64 {
        self.created_total.load(Ordering::Relaxed)
    }

    /// Sessions evicted by admission control since startup.
    pub fn evicted_total(&self) -> u64 {
        self.evicted_total.load(Ordering::Relaxed)
    }

    /// Sessions expired by the TTL sweep since startup.
    pub fn expired_total(&self) -> u64 {
        self.expired_total.load(Ordering::Relaxed)
    }

    /// A redacted listing of every directory entry.
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .iter()
            .map(|entry| {
                let session = entry.value();
                SessionSnapshot {
                    id: entry.key().clone(),
                    state: session.state(),
                    age_seconds: session.age().as_secs(),
                    idle_seconds: session.idle_for().as_secs(),
                }
            })
            .collect()
    }

    /// One sweep pass: closes sessions idle past the TTL and drops sessions
    /// that already closed themselves. Candidate ids are collected first so
    /// no directory shard stays locked while sessions are being closed.
    pub fn sweep_expired(&self) {
        let candidates: Vec<(String, bool)> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry.value().is_closed()
                    || entry.value().is_idle_for(self.config.session_ttl)
            })
            .map(|entry| (entry.key().clone(), entry.value().is_closed()))
            .collect();

        for (id, husk) in candidates {
            if husk {
                self.sessions.remove(&id);
            } else if self.close(&id, CloseReason::TtlExpired) {
                self.expired_total.fetch_add(1, Ordering::Relaxed);
                info!(session = %id, "session expired by ttl sweep");
            }
        }
    }

    /// Removes `id` if present but closed.
    fn drop_closed(&self, id: &str) {
        let closed = self
            .sessions
            .get(id)
            .map(|entry| entry.value().is_closed())
            .unwrap_or(false);

        if closed {
            self.sessions.remove(id);
        }
    }

    /// Closes the session with the largest idle time. Called under the
    /// admission lock.
    fn evict_idlest(&self) {
        let candidate = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().idle_for()))
            .max_by_key(|(_, idle)| *idle)
            .map(|(id, _)| id);

        if let Some(id) = candidate {
            if self.close(&id, CloseReason::Evicted) {
                self.evicted_total.fetch_add(1, Ordering::Relaxed);
                warn!(session = %id, "session evicted to admit a new one");
            }
        }
    }
}

/// Spawns the background sweep loop for `manager`. The handle is aborted at
/// shutdown, after [`SessionManager::close_all`] has run.
pub fn spawn_sweeper(manager: Arc<SessionManager>) -> JoinHandle<()> {
    let period = manager.config().cleanup_interval;

    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // The first tick of an interval fires immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            manager.sweep_expired();
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn config(max: usize, ttl_ms: u64, evict: bool) -> ManagerConfig {
        ManagerConfig {
            max_sessions: max,
            session_ttl: Duration::from_millis(ttl_ms),
            cleanup_interval: Duration::from_millis(10),
            evict_when_full: evict,
        }
    }

    #[tokio::test]
    async fn get_or_create_returns_one_session_per_id() {
        let manager = SessionManager::new(config(10, 60_000, false));

        let first = manager.get_or_create("s").expect("admission failed");
        let second = manager.get_or_create("s").expect("admission failed");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.active_count(), 1);
        assert_eq!(manager.created_total(), 1);
    }

    #[tokio::test]
    async fn closed_sessions_are_replaced_on_the_next_request() {
        let manager = SessionManager::new(config(10, 60_000, false));

        let first = manager.get_or_create("s").expect("admission failed");
        first.close(CloseReason::HandshakeTimeout);

        let second = manager.get_or_create("s").expect("admission failed");
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_closed());
        assert_eq!(manager.created_total(), 2);
    }

    #[tokio::test]
    async fn full_directory_refuses_admission_without_eviction() {
        let manager = SessionManager::new(config(1, 60_000, false));

        manager.get_or_create("first").expect("admission failed");
        let denied = manager.get_or_create("second");

        assert!(matches!(denied, Err(ProxyError::Overloaded)));
        assert!(manager.get("first").is_some());
    }

    #[tokio::test]
    async fn full_directory_evicts_the_idlest_session() {
        let manager = SessionManager::new(config(2, 60_000, true));

        let oldest = manager.get_or_create("oldest").expect("admission failed");
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.get_or_create("newer").expect("admission failed");
        tokio::time::sleep(Duration::from_millis(5)).await;

        manager.get_or_create("incoming").expect("admission failed");

        assert!(manager.get("oldest").is_none());
        assert!(oldest.is_closed());
        assert!(manager.get("newer").is_some());
        assert!(manager.get("incoming").is_some());
        assert_eq!(manager.evicted_total(), 1);
    }

    #[tokio::test]
    async fn sweep_closes_idle_sessions() {
        let manager = SessionManager::new(config(10, 30, false));

        let session = manager.get_or_create("s").expect("admission failed");
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.sweep_expired();

        assert!(session.is_closed());
        assert!(manager.get("s").is_none());
        assert_eq!(manager.expired_total(), 1);
        assert!(manager.snapshot().is_empty());
    }

    #[tokio::test]
    async fn sweep_spares_recently_active_sessions() {
        let manager = SessionManager::new(config(10, 10_000, false));

        manager.get_or_create("s").expect("admission failed");
        manager.sweep_expired();

        assert!(manager.get("s").is_some());
        assert_eq!(manager.expired_total(), 0);
    }

    #[tokio::test]
    async fn background_sweeper_evicts_on_its_own() {
        let manager = Arc::new(SessionManager::new(config(10, 30, false)));
        let handle = spawn_sweeper(manager.clone());

        manager.get_or_create("s").expect("admission failed");
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(manager.get("s").is_none());
        handle.abort();
    }

    #[tokio::test]
    async fn snapshot_lists_state_and_idleness() {
        let manager = SessionManager::new(config(10, 60_000, false));
        manager.get_or_create("s").expect("admission failed");

        let listing = manager.snapshot();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].id, "s");
        assert_eq!(listing[0].state, SessionState::Empty);
    }
}
