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

//! JSON structures and the Axum endpoint compatible with the
//! [Anthropic Messages API][anthropic], mapping that wire format onto the
//! same internal rendezvous envelopes as the chat completions shim.
//!
//! Both shims share one session directory, so a client speaking this wire
//! format pairs transparently with a peer speaking the OpenAI one.
//!
//! [anthropic]: https://docs.anthropic.com/en/api/messages

use std::borrow::Cow;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use either::Either;
use serde_derive::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use duet_core::envelope::{ProxyError, TurnRequest, TurnResponse, WireFormat};

use crate::turn;
use crate::turn::ErrorBody;
use crate::ProxyState;

/// One block of structured message content.
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(tag = "type")]
pub enum ContentBlock<'a> {
    /// Plain text.
    #[serde(rename = "text")]
    Text {
        /// The plain text.
        text: Cow<'a, str>,
    },
}

impl<'a> Display for ContentBlock<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentBlock::Text { text } => write!(f, "{}", text),
        }
    }
}

/// One message of the dialogue so far.
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MessageParam<'a> {
    /// Either `user` or `assistant`.
    pub role: Cow<'a, str>,

    /// Plain text, or a sequence of content blocks.
    #[serde(with = "either::serde_untagged")]
    #[schema(value_type = String)]
    pub content: Either<Cow<'a, str>, Vec<ContentBlock<'a>>>,
}

impl<'a> MessageParam<'a> {
    fn text(&self) -> String {
        match &self.content {
            Either::Left(text) => text.to_string(),
            Either::Right(blocks) => blocks.iter().map(ToString::to_string).collect(),
        }
    }
}

/// A request to exchange one chat turn through the rendezvous, in Anthropic's
/// message shape.
///
/// An `axum` handler, [`create_message`], handles this request. As in the
/// chat completions shim, `model` carries the session id, the last `user`
/// message is the utterance, and the remaining fields are accepted and
/// discarded.
#[derive(Serialize, Deserialize, ToSchema)]
pub struct CreateMessageRequest<'a> {
    /// The session id both clients rendezvous on.
    pub model: Cow<'a, str>,

    /// The messages that have been sent in the dialogue so far.
    #[serde(default)]
    pub messages: Vec<MessageParam<'a>>,

    /// Accepted and discarded.
    pub max_tokens: Option<u32>,

    /// The system prompt. Accepted and discarded.
    pub system: Option<serde_json::Value>,

    /// If `true`, the peer's utterance is emitted as an Anthropic-shaped
    /// event stream instead of a single [`MessageResponse`].
    pub stream: Option<bool>,

    /// Accepted and discarded.
    pub temperature: Option<f32>,

    /// Accepted and discarded.
    pub top_p: Option<f32>,

    /// Accepted and discarded.
    pub top_k: Option<u32>,

    /// Accepted and discarded.
    pub stop_sequences: Option<Vec<Cow<'a, str>>>,

    /// Request metadata. Accepted and discarded.
    pub metadata: Option<serde_json::Value>,
}

impl<'a> CreateMessageRequest<'a> {
    /// Decodes this wire request into the internal envelope.
    pub fn rendezvous_request(&self) -> Result<TurnRequest, ProxyError> {
        let utterance = self
            .messages
            .iter()
            .rev()
            .find(|message| message.role == "user")
            .map(MessageParam::text)
            .ok_or_else(ProxyError::missing_user_message)?;

        Ok(TurnRequest {
            session_id: self.model.to_string(),
            utterance,
            stream: self.stream.unwrap_or(false),
            format: WireFormat::Messages,
        })
    }
}

/// Token accounting in a [`MessageResponse`]. Always zeroed; the proxy never
/// tokenizes anything.
#[derive(Serialize, Deserialize, Default, ToSchema)]
pub struct MessageUsage {
    /// The number of tokens in the prompt.
    pub input_tokens: u32,

    /// The number of generated tokens.
    pub output_tokens: u32,
}

/// A full message response carrying one whole peer utterance.
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MessageResponse<'a> {
    /// A unique identifier for this message.
    pub id: Cow<'a, str>,

    /// The object type. This is always `message`.
    #[serde(rename = "type")]
    pub type_: Cow<'a, str>,

    /// The producing role. This is always `assistant`.
    pub role: Cow<'a, str>,

    /// Echoes the session id the request arrived with.
    pub model: Cow<'a, str>,

    /// The content blocks carrying the peer's utterance.
    pub content: Vec<ContentBlock<'a>>,

    /// Why the turn ended. Always `end_turn`; the peer delivers whole
    /// utterances.
    pub stop_reason: Cow<'a, str>,

    /// The matched stop sequence, never present.
    pub stop_sequence: Option<Cow<'a, str>>,

    /// Usage information about this message.
    pub usage: MessageUsage,
}

/// The `stop_reason` reported on every message.
const STOP_REASON: &str = "end_turn";

fn message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

/// Encodes a peer utterance as a single non-streamed message.
pub fn encode_message(session_id: &str, response: &TurnResponse) -> MessageResponse<'static> {
    MessageResponse {
        id: Cow::Owned(message_id()),
        type_: Cow::Borrowed("message"),
        role: Cow::Borrowed("assistant"),
        model: Cow::Owned(session_id.to_string()),
        content: vec![ContentBlock::Text {
            text: Cow::Owned(response.utterance.clone()),
        }],
        stop_reason: Cow::Borrowed(STOP_REASON),
        stop_sequence: None,
        usage: MessageUsage::default(),
    }
}

/// Encodes a peer utterance as the Anthropic event stream:
/// `message_start`, one `content_block_delta` per whitespace-preserving
/// segment, `message_delta`, and the closing `message_stop`.
pub fn encode_stream_events(
    session_id: &str,
    response: &TurnResponse,
) -> Vec<Result<Event, axum::Error>> {
    let id = message_id();
    let mut events = Vec::new();

    events.push(Event::default().event("message_start").json_data(
        serde_json::json!({
            "type": "message_start",
            "message": {
                "id": id,
                "type": "message",
                "role": "assistant",
                "model": session_id,
                "content": [],
                "stop_reason": null,
                "stop_sequence": null,
                "usage": {"input_tokens": 0, "output_tokens": 0},
            },
        }),
    ));

    events.push(Event::default().event("content_block_start").json_data(
        serde_json::json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": {"type": "text", "text": ""},
        }),
    ));

    for segment in turn::stream_segments(&response.utterance) {
        events.push(Event::default().event("content_block_delta").json_data(
            serde_json::json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "text_delta", "text": segment},
            }),
        ));
    }

    events.push(Event::default().event("content_block_stop").json_data(
        serde_json::json!({"type": "content_block_stop", "index": 0}),
    ));

    events.push(Event::default().event("message_delta").json_data(
        serde_json::json!({
            "type": "message_delta",
            "delta": {"stop_reason": STOP_REASON, "stop_sequence": null},
            "usage": {"output_tokens": 0},
        }),
    ));

    events.push(
        Event::default()
            .event("message_stop")
            .json_data(serde_json::json!({"type": "message_stop"})),
    );

    events
}

/// POST `/v1/messages`: exchange one chat turn with the peer sharing the
/// session id carried in `model`, speaking the Anthropic wire format.
///
/// See [the Anthropic Messages API][anthropic], which this endpoint is
/// compatible with.
///
/// [anthropic]: https://docs.anthropic.com/en/api/messages
#[utoipa::path(
post,
path = "/v1/messages",
request_body = CreateMessageRequest,
responses(
(status = 200, description = "OK", body = MessageResponse),
(status = 408, description = "the peer did not answer in time", body = ErrorBody),
(status = 409, description = "the session already has both sides in flight", body = ErrorBody),
(status = 410, description = "the session was closed or evicted", body = ErrorBody),
),
)]
pub async fn create_message(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = turn::correlation_id(&headers);

    match message_turn(&state, &request_id, &body).await {
        Ok(response) => turn::with_request_id(response, &request_id),
        Err(err) => turn::error_response(&state, err, &request_id),
    }
}

async fn message_turn(
    state: &ProxyState,
    request_id: &str,
    body: &Bytes,
) -> Result<Response, ProxyError> {
    turn::check_payload(state, body.len())?;

    let request: CreateMessageRequest =
        serde_json::from_slice(body).map_err(|e| ProxyError::Schema(e.to_string()))?;
    let envelope = request.rendezvous_request()?;

    let session_id = envelope.session_id.clone();
    let stream = envelope.stream;
    let response = turn::execute(state, request_id, envelope).await?;

    if stream {
        let events = encode_stream_events(&session_id, &response);
        Ok(Sse::new(tokio_stream::iter(events))
            .keep_alive(KeepAlive::default())
            .into_response())
    } else {
        Ok(Json(encode_message(&session_id, &response)).into_response())
    }
}
