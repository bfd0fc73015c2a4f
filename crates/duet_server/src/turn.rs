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

//! The per-request turn pipeline shared by every protocol adapter: payload
//! caps, correlation ids, envelope validation, the session exchange itself,
//! and the uniform error encoding at the HTTP boundary.

use std::sync::atomic::Ordering;

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_derive::Serialize;
use tracing::{error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use duet_core::envelope::{ProxyError, TurnRequest, TurnResponse};

use crate::ProxyState;

/// The header a correlation id travels in, both directions.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Reads the caller-supplied correlation id, or mints one.
pub fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Rejects bodies over the configured cap, before any decode is attempted.
pub fn check_payload(state: &ProxyState, len: usize) -> Result<(), ProxyError> {
    let limit = state.config.max_payload_bytes;

    if len > limit {
        return Err(ProxyError::PayloadTooLarge { actual: len, limit });
    }

    Ok(())
}

/// Runs one half-turn: validates the envelope, finds or creates the session,
/// and suspends in its exchange until the peer utterance arrives.
pub async fn execute(
    state: &ProxyState,
    request_id: &str,
    request: TurnRequest,
) -> Result<TurnResponse, ProxyError> {
    if request.session_id.is_empty() {
        return Err(ProxyError::empty_session_id());
    }
    if request.utterance.is_empty() {
        return Err(ProxyError::missing_user_message());
    }

    info!(
        request_id,
        session = %request.session_id,
        format = %request.format,
        stream = request.stream,
        "turn accepted"
    );

    let session = state.manager.get_or_create(&request.session_id)?;
    let peer_utterance = session
        .exchange(request.utterance, &state.config.budgets)
        .await?;

    state.metrics.turns_total.fetch_add(1, Ordering::Relaxed);
    info!(request_id, session = %request.session_id, "turn completed");

    Ok(TurnResponse::new(peer_utterance))
}

/// Splits a whole peer utterance into the coarse segments a streaming
/// response is chunked into. Whitespace is preserved, so concatenating the
/// segments reproduces the utterance exactly.
pub fn stream_segments(utterance: &str) -> Vec<String> {
    utterance
        .split_inclusive(char::is_whitespace)
        .map(str::to_string)
        .collect()
}

/// The uniform error wire shape: `{"error": {"message", "type", "code"}}`.
#[derive(Serialize, ToSchema)]
pub struct ErrorBody {
    /// The error payload.
    pub error: ErrorDetail,
}

/// The inner error object of an [`ErrorBody`].
#[derive(Serialize, ToSchema)]
pub struct ErrorDetail {
    /// A human-readable description.
    pub message: String,
    /// The error kind from the closed taxonomy.
    #[serde(rename = "type")]
    pub kind: String,
    /// The finer-grained situation code.
    pub code: String,
}

/// Encodes a [`ProxyError`] at the boundary: taxonomy status, uniform JSON
/// body, echoed correlation id.
pub fn error_response(state: &ProxyState, err: ProxyError, request_id: &str) -> Response {
    state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);

    match &err {
        ProxyError::Internal(cause) => {
            error!(request_id, %cause, "request failed unexpectedly")
        }
        other => warn!(
            request_id,
            kind = other.kind(),
            code = other.code(),
            "request failed: {other}"
        ),
    }

    let status =
        StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ErrorBody {
        error: ErrorDetail {
            message: err.to_string(),
            kind: err.kind().to_string(),
            code: err.code().to_string(),
        },
    };

    with_request_id((status, Json(body)).into_response(), request_id)
}

/// Echoes the correlation id on an outbound response.
pub fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn correlation_id_honors_the_inbound_header() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("req-42"));

        assert_eq!(correlation_id(&headers), "req-42");
    }

    #[test]
    fn correlation_id_is_minted_when_absent() {
        let first = correlation_id(&HeaderMap::new());
        let second = correlation_id(&HeaderMap::new());

        assert!(!first.is_empty());
        assert_ne!(first, second);
    }

    #[test]
    fn segments_preserve_whitespace() {
        assert_eq!(
            stream_segments("alpha beta gamma"),
            vec!["alpha ", "beta ", "gamma"]
        );
        assert_eq!(stream_segments("one"), vec!["one"]);
        assert_eq!(stream_segments("a  b"), vec!["a ", " ", "b"]);
        assert_eq!(stream_segments("tabs\there"), vec!["tabs\t", "here"]);

        let original = "  leading and trailing  ";
        assert_eq!(stream_segments(original).concat(), original);
    }

    #[test]
    fn error_body_uses_the_documented_wire_shape() {
        let body = ErrorBody {
            error: ErrorDetail {
                message: "nope".to_string(),
                kind: "invalid_request".to_string(),
                code: "empty_session_id".to_string(),
            },
        };

        let encoded = serde_json::to_value(&body).expect("serialization failed");
        assert_eq!(encoded["error"]["message"], "nope");
        assert_eq!(encoded["error"]["type"], "invalid_request");
        assert_eq!(encoded["error"]["code"], "empty_session_id");
    }
}
