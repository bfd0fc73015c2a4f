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

//! The per-pair rendezvous primitive.
//!
//! A [`Session`] pairs the two clients that share a session id. Each side's
//! HTTP request becomes half a duplex turn: one [`Session::exchange`] call
//! deposits the caller's utterance for the peer and suspends until the peer's
//! utterance arrives in return.
//!
//! The rendezvous is built from two one-slot delivery queues guarded by a
//! single short-held mutex, with a [`Notify`] per side for wake-up. The mutex
//! is never held across an `.await`; every suspension happens on the notifier
//! with a deadline.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use utoipa::ToSchema;

use crate::envelope::{CloseReason, ProxyError, TimeoutPhase};

/// The wall-clock wait budgets applied to one `exchange` call.
#[derive(Debug, Clone, Copy)]
pub struct TurnBudgets {
    /// Longest a new session's first caller waits for the second participant.
    pub handshake: Duration,
    /// Longest any later receive leg waits for a peer utterance.
    pub turn: Duration,
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No request has touched the session yet.
    Empty,
    /// Side A is in its handshake; Side B has not arrived.
    AwaitingPeer,
    /// Both sides have been claimed; turns are flowing.
    Active,
    /// Terminal. A closed session never transitions out.
    Closed,
}

/// The two participant slots. A is whichever client arrived first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    A,
    B,
}

/// State behind the session mutex.
struct SessionInner {
    state: SessionState,
    close_reason: Option<CloseReason>,

    /// Set while a receiver for that side is suspended. At most one per side.
    a_waiting: bool,
    b_waiting: bool,

    /// One-slot delivery queues. `a_to_b` holds an utterance deposited by A
    /// and not yet consumed by B; `b_to_a` the reverse.
    a_to_b: Option<String>,
    b_to_a: Option<String>,

    last_activity: Instant,
}

/// A logical pairing of the two clients sharing a session id.
pub struct Session {
    id: String,
    created_at: Instant,
    inner: Mutex<SessionInner>,

    /// Signaled when `b_to_a` is filled or the session closes.
    wake_a: Notify,
    /// Signaled when `a_to_b` is filled or the session closes.
    wake_b: Notify,
}

/// Clears the waiting flag for a side when its receive leg ends, whichever
/// way it ends: delivery, timeout, or the caller's connection dropping.
struct WaitGuard<'a> {
    session: &'a Session,
    side: Side,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.session.lock();
        match self.side {
            Side::A => inner.a_waiting = false,
            Side::B => inner.b_waiting = false,
        }
    }
}

impl Session {
    /// Creates an empty session. Sides are assigned by the first two
    /// [`exchange`][Self::exchange] calls that reach it.
    pub fn new(id: impl Into<String>) -> Self {
        let now = Instant::now();

        Self {
            id: id.into(),
            created_at: now,
            inner: Mutex::new(SessionInner {
                state: SessionState::Empty,
                close_reason: None,
                a_waiting: false,
                b_waiting: false,
                a_to_b: None,
                b_to_a: None,
                last_activity: now,
            }),
            wake_a: Notify::new(),
            wake_b: Notify::new(),
        }
    }

    /// The session id both clients rendezvous on.
    pub fn id(&self) -> &str {
        &self.id
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        // A poisoned lock only means a panicking thread held it; the state
        // itself is plain data and stays usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One atomic half-turn: deliver the caller's utterance to the opposite
    /// side and suspend until the opposite side's utterance arrives.
    ///
    /// The first call on a fresh session is the handshake: its utterance is
    /// consumed and discarded, and the caller waits under the handshake
    /// budget for the second participant. Every later call deposits under
    /// the turn budget.
    pub async fn exchange(
        &self,
        utterance: String,
        budgets: &TurnBudgets,
    ) -> Result<String, ProxyError> {
        let (side, phase) = self.enter(utterance)?;

        let budget = match phase {
            TimeoutPhase::Handshake => budgets.handshake,
            TimeoutPhase::Turn => budgets.turn,
        };

        self.await_delivery(side, phase, budget).await
    }

    /// Classifies the caller, performs its deposit, and registers it as the
    /// pending receiver for its side. Runs entirely under the session mutex.
    fn enter(&self, utterance: String) -> Result<(Side, TimeoutPhase), ProxyError> {
        let mut inner = self.lock();
        inner.last_activity = Instant::now();

        match inner.state {
            SessionState::Closed => {
                let reason = inner.close_reason.unwrap_or(CloseReason::Shutdown);
                Err(ProxyError::SessionGone(reason))
            }

            SessionState::Empty => {
                // First arrival claims side A. The handshake ping is consumed
                // here and never delivered.
                inner.state = SessionState::AwaitingPeer;
                inner.a_waiting = true;
                debug!(session = %self.id, "side A claimed, handshake ping discarded");

                Ok((Side::A, TimeoutPhase::Handshake))
            }

            SessionState::AwaitingPeer => {
                // Second arrival claims side B. Its utterance answers A's
                // pending handshake.
                inner.state = SessionState::Active;
                inner.b_to_a = Some(utterance);
                inner.b_waiting = true;
                self.wake_a.notify_one();
                debug!(session = %self.id, "side B claimed, session active");

                Ok((Side::B, TimeoutPhase::Turn))
            }

            SessionState::Active => {
                let side = classify(&inner)?;

                let slot = match side {
                    Side::A => &mut inner.a_to_b,
                    Side::B => &mut inner.b_to_a,
                };

                if slot.is_some() {
                    return Err(ProxyError::SessionConflict {
                        code: "delivery_pending",
                        message: "the previous utterance from this side has not been \
                                  consumed yet"
                            .to_string(),
                    });
                }

                *slot = Some(utterance);
                match side {
                    Side::A => {
                        inner.a_waiting = true;
                        self.wake_b.notify_one();
                    }
                    Side::B => {
                        inner.b_waiting = true;
                        self.wake_a.notify_one();
                    }
                }

                Ok((side, TimeoutPhase::Turn))
            }
        }
    }

    /// Suspends until the caller's receive slot is filled, the session
    /// closes, or the budget elapses. The mutex is re-taken only for the
    /// state checks between waits.
    async fn await_delivery(
        &self,
        side: Side,
        phase: TimeoutPhase,
        budget: Duration,
    ) -> Result<String, ProxyError> {
        let deadline = Instant::now() + budget;
        let _guard = WaitGuard {
            session: self,
            side,
        };

        loop {
            {
                let mut inner = self.lock();

                let slot = match side {
                    Side::A => &mut inner.b_to_a,
                    Side::B => &mut inner.a_to_b,
                };

                if let Some(text) = slot.take() {
                    inner.last_activity = Instant::now();
                    return Ok(text);
                }

                if inner.state == SessionState::Closed {
                    let reason = inner.close_reason.unwrap_or(CloseReason::Shutdown);
                    return Err(close_observation(reason, phase));
                }
            }

            let waker = match side {
                Side::A => &self.wake_a,
                Side::B => &self.wake_b,
            };

            if tokio::time::timeout_at(deadline, waker.notified())
                .await
                .is_err()
            {
                // The budget is gone. A deposit already made on the other
                // queue stays there; the peer consumes it on its next turn.
                let mut inner = self.lock();
                inner.last_activity = Instant::now();

                if phase == TimeoutPhase::Handshake
                    && inner.state == SessionState::AwaitingPeer
                {
                    inner.state = SessionState::Closed;
                    inner.close_reason = Some(CloseReason::HandshakeTimeout);
                    inner.a_to_b = None;
                    inner.b_to_a = None;
                    debug!(session = %self.id, "handshake budget exhausted, session closed");
                }

                return Err(ProxyError::Timeout(phase));
            }
        }
    }

    /// Closes the session, dropping queued deliveries and waking both sides.
    /// Idempotent; the first reason wins.
    pub fn close(&self, reason: CloseReason) {
        let mut inner = self.lock();

        if inner.state == SessionState::Closed {
            return;
        }

        inner.state = SessionState::Closed;
        inner.close_reason = Some(reason);
        inner.a_to_b = None;
        inner.b_to_a = None;
        debug!(session = %self.id, %reason, "session closed");

        self.wake_a.notify_one();
        self.wake_b.notify_one();
    }

    /// Whether the session has been idle for at least `duration`.
    pub fn is_idle_for(&self, duration: Duration) -> bool {
        self.lock().last_activity.elapsed() >= duration
    }

    /// The current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Whether the session has reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Time since the session was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last accepted request or delivery.
    pub fn idle_for(&self) -> Duration {
        self.lock().last_activity.elapsed()
    }
}

/// Derives the caller's side from queue state, per the cookie-less identity
/// rule: an occupied receiver pins the caller to the opposite side; with both
/// sides idle the caller is the side whose delivery queue is free, defaulting
/// to A when both are.
fn classify(inner: &SessionInner) -> Result<Side, ProxyError> {
    match (inner.a_waiting, inner.b_waiting) {
        (true, true) => Err(ProxyError::SessionConflict {
            code: "third_participant",
            message: "both sides of this session already have a request in flight".to_string(),
        }),
        (true, false) => Ok(Side::B),
        (false, true) => Ok(Side::A),
        (false, false) => match (inner.a_to_b.is_some(), inner.b_to_a.is_some()) {
            (true, true) => Err(ProxyError::SessionConflict {
                code: "deliveries_backlogged",
                message: "both delivery queues are full".to_string(),
            }),
            (true, false) => Ok(Side::B),
            _ => Ok(Side::A),
        },
    }
}

/// What a waiter woken by `close` observes. TTL and handshake expiry read as
/// timeouts; every other reason reads as the session being gone.
fn close_observation(reason: CloseReason, phase: TimeoutPhase) -> ProxyError {
    match reason {
        CloseReason::TtlExpired | CloseReason::HandshakeTimeout => ProxyError::Timeout(phase),
        other => ProxyError::SessionGone(other),
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;

    fn budgets(handshake_ms: u64, turn_ms: u64) -> TurnBudgets {
        TurnBudgets {
            handshake: Duration::from_millis(handshake_ms),
            turn: Duration::from_millis(turn_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_ping_is_discarded_and_first_turn_flows() {
        let session = Arc::new(Session::new("s"));

        let a = {
            let session = session.clone();
            tokio::spawn(async move { session.exchange("ping".to_string(), &budgets(5_000, 5_000)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.state(), SessionState::AwaitingPeer);

        let b = {
            let session = session.clone();
            tokio::spawn(async move { session.exchange("Hello?".to_string(), &budgets(5_000, 5_000)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.state(), SessionState::Active);

        // A's handshake resolves to B's utterance; "ping" never surfaces.
        assert_eq!(a.await.unwrap().unwrap(), "Hello?");

        // A's next turn answers B's still-pending request.
        let a2 = {
            let session = session.clone();
            tokio::spawn(async move { session.exchange("Hi there".to_string(), &budgets(5_000, 50)).await })
        };
        assert_eq!(b.await.unwrap().unwrap(), "Hi there");

        // Nobody answers A's second turn in this test.
        assert!(matches!(
            a2.await.unwrap(),
            Err(ProxyError::Timeout(TimeoutPhase::Turn))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn third_concurrent_request_is_a_conflict() {
        let session = Arc::new(Session::new("s"));

        let _a = {
            let session = session.clone();
            tokio::spawn(async move { session.exchange("ping".to_string(), &budgets(5_000, 5_000)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let _b = {
            let session = session.clone();
            tokio::spawn(async move { session.exchange("hello".to_string(), &budgets(5_000, 5_000)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let third = session
            .exchange("who am I".to_string(), &budgets(5_000, 5_000))
            .await;
        match third {
            Err(ProxyError::SessionConflict { code, .. }) => {
                assert_eq!(code, "third_participant")
            }
            other => panic!("expected a session conflict, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_timeout_closes_the_session() {
        let session = Session::new("s");

        let res = session.exchange("ping".to_string(), &budgets(100, 5_000)).await;
        assert!(matches!(
            res,
            Err(ProxyError::Timeout(TimeoutPhase::Handshake))
        ));
        assert!(session.is_closed());

        // The closed session rejects further traffic; a fresh handshake needs
        // a fresh session from the directory.
        let res = session.exchange("ping".to_string(), &budgets(100, 5_000)).await;
        assert!(matches!(
            res,
            Err(ProxyError::SessionGone(CloseReason::HandshakeTimeout))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_close_reads_as_timeout_for_the_waiter() {
        let session = Arc::new(Session::new("s"));

        let a = {
            let session = session.clone();
            tokio::spawn(async move { session.exchange("ping".to_string(), &budgets(60_000, 60_000)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        session.close(CloseReason::TtlExpired);
        assert!(matches!(
            a.await.unwrap(),
            Err(ProxyError::Timeout(TimeoutPhase::Handshake))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn administrative_close_reads_as_gone_for_the_waiter() {
        let session = Arc::new(Session::new("s"));

        let a = {
            let session = session.clone();
            tokio::spawn(async move { session.exchange("ping".to_string(), &budgets(60_000, 60_000)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        session.close(CloseReason::Admin);
        assert!(matches!(
            a.await.unwrap(),
            Err(ProxyError::SessionGone(CloseReason::Admin))
        ));
        // Closing twice is a no-op.
        session.close(CloseReason::Shutdown);
        assert!(matches!(
            session.exchange("x".to_string(), &budgets(100, 100)).await,
            Err(ProxyError::SessionGone(CloseReason::Admin))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn deposit_survives_the_depositors_receive_timeout() {
        let session = Arc::new(Session::new("s"));

        // Pair the session: A handshakes, B answers, A consumes, B times out.
        let a = {
            let session = session.clone();
            tokio::spawn(async move { session.exchange("ping".to_string(), &budgets(5_000, 5_000)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let b = {
            let session = session.clone();
            tokio::spawn(async move { session.exchange("b-one".to_string(), &budgets(5_000, 50)).await })
        };
        assert_eq!(a.await.unwrap().unwrap(), "b-one");
        assert!(matches!(
            b.await.unwrap(),
            Err(ProxyError::Timeout(TimeoutPhase::Turn))
        ));

        // A deposits and times out on its own receive leg.
        let res = session.exchange("a-two".to_string(), &budgets(5_000, 50)).await;
        assert!(matches!(res, Err(ProxyError::Timeout(TimeoutPhase::Turn))));

        // The deposit was not rescinded: B's next turn receives it.
        let res = session
            .exchange("b-three".to_string(), &budgets(5_000, 50))
            .await;
        assert_eq!(res.unwrap(), "a-two");
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_sender_on_one_side_is_a_conflict() {
        use std::future::{poll_fn, Future};
        use std::pin::pin;
        use std::task::Poll;

        let session = Arc::new(Session::new("s"));

        // A suspended in its handshake, not yet scheduled to consume anything.
        let a = {
            let session = session.clone();
            tokio::spawn(async move { session.exchange("ping".to_string(), &budgets(5_000, 5_000)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // B deposits, then its connection drops before A consumes: poll the
        // exchange once to run the deposit, then cancel it.
        {
            let b_one_budgets = budgets(5_000, 5_000);
            let mut fut = pin!(session.exchange("b-one".to_string(), &b_one_budgets));
            poll_fn(|cx| {
                assert!(fut.as_mut().poll(cx).is_pending());
                Poll::Ready(())
            })
            .await;
        }

        // The B slot's delivery is still queued; a second request landing on
        // the same side before A consumes it is rejected.
        let dup = session
            .exchange("b-dup".to_string(), &budgets(5_000, 50))
            .await;
        match dup {
            Err(ProxyError::SessionConflict { code, .. }) => {
                assert_eq!(code, "delivery_pending")
            }
            other => panic!("expected a session conflict, got {other:?}"),
        }

        // The cancelled sender's deposit was not rescinded.
        assert_eq!(a.await.unwrap().unwrap(), "b-one");
    }

    #[tokio::test]
    async fn idle_time_tracks_activity() {
        let session = Session::new("s");
        assert!(!session.is_idle_for(Duration::from_secs(1)));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(session.is_idle_for(Duration::from_millis(10)));

        let _ = session
            .exchange(
                "ping".to_string(),
                &budgets(10, 10),
            )
            .await;
        assert!(!session.is_idle_for(Duration::from_secs(1)));
    }
}
