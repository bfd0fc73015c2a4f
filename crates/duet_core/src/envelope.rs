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

//! Internal request/response envelopes shared by every protocol adapter, and
//! the closed error taxonomy every endpoint reports from.

use core::fmt::{Display, Formatter};

use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

/// The wire format a request arrived in.
///
/// Adapters produce and consume the same internal envelopes regardless of the
/// tag; it exists so the turn handler can pick the matching encoder for the
/// response leg, and for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// OpenAI-shaped `POST /v1/chat/completions`.
    ChatCompletions,
    /// Claude-shaped `POST /v1/messages`.
    Messages,
}

impl Display for WireFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            WireFormat::ChatCompletions => write!(f, "chat_completions"),
            WireFormat::Messages => write!(f, "messages"),
        }
    }
}

/// A decoded inbound turn, stripped of everything the proxy does not forward.
///
/// Only `utterance` ever reaches the peer; sampling knobs, history and other
/// wire metadata are accepted by the adapters and discarded there.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// The rendezvous key, taken from the `model` field of the inbound body.
    pub session_id: String,

    /// The content of the last `user` message in the inbound message array.
    pub utterance: String,

    /// Whether the caller asked for a streamed response.
    pub stream: bool,

    /// The wire format the request arrived in.
    pub format: WireFormat,
}

/// The peer's utterance, on its way back out through an adapter encoder.
#[derive(Debug, Clone)]
pub struct TurnResponse {
    /// The whole utterance produced by the opposite side.
    pub utterance: String,
}

impl TurnResponse {
    /// The only termination cause the proxy ever reports; the peer always
    /// delivers a whole utterance in one shot.
    pub const FINISH_REASON: &'static str = "stop";

    /// Wraps a peer utterance.
    pub fn new(utterance: String) -> Self {
        Self { utterance }
    }
}

/// Why a session stopped existing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Side B never arrived within the handshake budget.
    HandshakeTimeout,
    /// The idle TTL elapsed and the sweeper closed the session.
    TtlExpired,
    /// The directory was full and this session was the eviction candidate.
    Evicted,
    /// An administrative close request.
    Admin,
    /// The server is shutting down.
    Shutdown,
}

impl Display for CloseReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let reason = match self {
            CloseReason::HandshakeTimeout => "handshake_timeout",
            CloseReason::TtlExpired => "ttl_expired",
            CloseReason::Evicted => "evicted",
            CloseReason::Admin => "admin_closed",
            CloseReason::Shutdown => "shutdown",
        };

        write!(f, "{reason}")
    }
}

/// Which wait a timed-out call was suspended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPhase {
    /// Waiting for the second participant to claim the session.
    Handshake,
    /// Waiting for the peer's next utterance.
    Turn,
}

impl Display for TimeoutPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            TimeoutPhase::Handshake => write!(f, "handshake"),
            TimeoutPhase::Turn => write!(f, "turn"),
        }
    }
}

/// Every failure the proxy can report to a client.
///
/// The taxonomy is closed: each variant has a stable `type` identifier, a
/// finer-grained `code`, and a fixed HTTP status, so clients can branch on
/// machine-readable fields instead of message text.
#[derive(Debug, Serialize, Error)]
pub enum ProxyError {
    /// The payload decoded, but violates a semantic rule.
    #[error("{message}")]
    InvalidRequest {
        /// The specific rule that was violated.
        code: &'static str,
        /// A human-readable description.
        message: String,
    },

    /// The payload could not be decoded into the adapter's input schema.
    #[error("could not decode request body: {0}")]
    Schema(String),

    /// The body exceeded the configured size cap.
    #[error("payload of {actual} bytes exceeds the configured limit of {limit} bytes")]
    PayloadTooLarge {
        /// Observed body size.
        actual: usize,
        /// The configured cap.
        limit: usize,
    },

    /// A wait exceeded its budget.
    #[error("timed out waiting for the peer during the {0} phase")]
    Timeout(TimeoutPhase),

    /// A second in-flight request was observed on an occupied side, or a
    /// third participant tried to join.
    #[error("{message}")]
    SessionConflict {
        /// The specific conflict that was detected.
        code: &'static str,
        /// A human-readable description.
        message: String,
    },

    /// The target session was closed or evicted.
    #[error("session is gone: {0}")]
    SessionGone(CloseReason),

    /// The directory is at capacity and nothing could be evicted.
    #[error("the session directory is full")]
    Overloaded,

    /// A failure nothing above describes. Always logged with its correlation id.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// A request with an empty rendezvous key.
    pub fn empty_session_id() -> Self {
        ProxyError::InvalidRequest {
            code: "empty_session_id",
            message: "the model field must carry a non-empty session id".to_string(),
        }
    }

    /// A message array with nothing the proxy could forward.
    pub fn missing_user_message() -> Self {
        ProxyError::InvalidRequest {
            code: "missing_user_message",
            message: "the messages array must end with a non-empty user message".to_string(),
        }
    }

    /// The stable `type` identifier of this error.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::InvalidRequest { .. } => "invalid_request",
            ProxyError::Schema(_) => "schema_error",
            ProxyError::PayloadTooLarge { .. } => "payload_too_large",
            ProxyError::Timeout(_) => "timeout",
            ProxyError::SessionConflict { .. } => "session_conflict",
            ProxyError::SessionGone(_) => "session_gone",
            ProxyError::Overloaded => "overloaded",
            ProxyError::Internal(_) => "internal",
        }
    }

    /// The finer-grained `code` reported next to [`kind`][Self::kind] on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::InvalidRequest { code, .. } => code,
            ProxyError::Schema(_) => "malformed_body",
            ProxyError::PayloadTooLarge { .. } => "body_over_limit",
            ProxyError::Timeout(TimeoutPhase::Handshake) => "handshake_timeout",
            ProxyError::Timeout(TimeoutPhase::Turn) => "turn_timeout",
            ProxyError::SessionConflict { code, .. } => code,
            ProxyError::SessionGone(CloseReason::HandshakeTimeout) => "handshake_timeout",
            ProxyError::SessionGone(CloseReason::TtlExpired) => "ttl_expired",
            ProxyError::SessionGone(CloseReason::Evicted) => "evicted",
            ProxyError::SessionGone(CloseReason::Admin) => "admin_closed",
            ProxyError::SessionGone(CloseReason::Shutdown) => "shutdown",
            ProxyError::Overloaded => "max_sessions_reached",
            ProxyError::Internal(_) => "internal_error",
        }
    }

    /// The HTTP status this error maps to at the boundary.
    pub fn status(&self) -> u16 {
        match self {
            ProxyError::InvalidRequest { .. } => 400,
            ProxyError::Schema(_) => 422,
            ProxyError::PayloadTooLarge { .. } => 413,
            ProxyError::Timeout(_) => 408,
            ProxyError::SessionConflict { .. } => 409,
            ProxyError::SessionGone(_) => 410,
            ProxyError::Overloaded => 503,
            ProxyError::Internal(_) => 500,
        }
    }
}
