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

//! JSON structures and the Axum endpoint compatible with [OpenAI's chat
//! API][openai], mapping that wire format onto Duet's internal rendezvous
//! envelopes.
//!
//! The `model` field carries the session id; the last `user` message is the
//! utterance. Everything else a chat client usually sends (sampling knobs,
//! history, names) is accepted and discarded.
//!
//! [openai]: https://platform.openai.com/docs/api-reference/chat/create

use std::borrow::Cow;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use derive_more::{Deref, DerefMut, From};
use either::Either;
use serde_derive::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use time::OffsetDateTime;
use tinyvec::{tiny_vec, TinyVec};
use utoipa::ToSchema;
use uuid::Uuid;

use duet_core::envelope::{ProxyError, TurnRequest, TurnResponse, WireFormat};

use crate::turn;
use crate::turn::ErrorBody;
use crate::ProxyState;

/// The plaintext or image content of a [`ChatMessage`].
///
/// See [the documentation for creating chat completions][openai] for more
/// details.
///
/// [openai]: https://platform.openai.com/docs/api-reference/chat/create
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(tag = "type")]
pub enum ContentPart<'a> {
    /// Plain text.
    #[serde(rename = "text")]
    Text {
        /// The plain text.
        text: Cow<'a, str>,
    },
    /// A URL to an image. Duet forwards a textual marker in its place.
    #[serde(rename = "image_url")]
    ImageUrl {
        /// The URL.
        url: Cow<'a, str>,

        /// A description of the image behind the URL, if any.
        detail: Option<Cow<'a, str>>,
    },
}

impl<'a> Display for ContentPart<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentPart::Text { text } => write!(f, "{}", text),
            ContentPart::ImageUrl { url, detail } => {
                if let Some(detail) = detail {
                    write!(f, "<IMAGE {}> ({})", url, detail)
                } else {
                    write!(f, "<IMAGE {}>", url)
                }
            }
        }
    }
}

/// A chat message in a multi-user dialogue.
///
/// Only the final `user` message matters to the proxy; each side resends its
/// own history, which is ignored here.
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(tag = "role")]
pub enum ChatMessage<'a> {
    /// A message from the system, typically the initial system prompt.
    #[serde(rename = "system")]
    System {
        /// The content of the message, if any.
        content: Option<Cow<'a, str>>,

        /// If present, a name for the system.
        name: Option<Cow<'a, str>>,
    },
    /// A message from a user.
    #[serde(rename = "user")]
    User {
        /// The content of the message. This can be a sequence of multiple
        /// plain text or image parts.
        #[serde(with = "either::serde_untagged")]
        #[schema(value_type = String)]
        content: Either<Cow<'a, str>, Vec<ContentPart<'a>>>,

        /// If present, a name for the user.
        name: Option<Cow<'a, str>>,
    },
    /// A message from an assistant.
    #[serde(rename = "assistant")]
    Assistant {
        /// The plaintext of the message, if any.
        content: Option<Cow<'a, str>>,

        /// The name of the assistant, if any.
        name: Option<Cow<'a, str>>,
    },
    /// A message from a tool invoked by an assistant.
    #[serde(rename = "tool")]
    Tool {
        /// The plaintext that the tool generated, if any.
        content: Option<Cow<'a, str>>,

        /// A unique identifier for the invocation that generated this message.
        tool_call_id: Cow<'a, str>,
    },
}

/// A sequence of chat messages in a [`CreateChatCompletionRequest`].
#[derive(Serialize, Deserialize, Default, Deref, DerefMut, From, ToSchema)]
pub struct ChatMessages<'a>(
    #[deref]
    #[deref_mut]
    Vec<ChatMessage<'a>>,
);

impl<'a> ChatMessages<'a> {
    /// The content of the last `user` message, flattened to plain text.
    pub fn last_user_utterance(&self) -> Option<String> {
        self.0.iter().rev().find_map(|message| match message {
            ChatMessage::User { content, .. } => Some(match content {
                Either::Left(text) => text.to_string(),
                Either::Right(parts) => {
                    parts.iter().map(ToString::to_string).collect::<String>()
                }
            }),
            _ => None,
        })
    }
}

/// A request to exchange one chat turn through the rendezvous.
///
/// An `axum` handler, [`chat_completions`], handles this request. The request
/// shape is OpenAI's; fields the proxy does not forward are still decoded so
/// well-behaved clients are never rejected for sending them.
///
/// See [the documentation for creating chat completions][openai] for more
/// details.
///
/// [openai]: https://platform.openai.com/docs/api-reference/chat/create
#[derive(Serialize, Deserialize, ToSchema)]
pub struct CreateChatCompletionRequest<'a> {
    /// The messages that have been sent in the dialogue so far.
    #[serde(default)]
    pub messages: ChatMessages<'a>,

    /// The session id both clients rendezvous on.
    pub model: Cow<'a, str>,

    /// Accepted and discarded.
    pub frequency_penalty: Option<f32>,

    /// Accepted and discarded.
    pub max_tokens: Option<u32>,

    /// Accepted and discarded.
    pub n: Option<f32>,

    /// Accepted and discarded.
    pub presence_penalty: Option<f32>,

    /// Accepted and discarded.
    pub seed: Option<u32>,

    /// A stop phrase or set of stop phrases. Accepted and discarded.
    #[serde(default, with = "either::serde_untagged_optional")]
    #[schema(value_type = String)]
    pub stop: Option<Either<Cow<'a, str>, Vec<Cow<'a, str>>>>,

    /// If `true`, the peer's utterance is emitted as [`ChatCompletionChunk`]s
    /// over [server-sent events][sse] instead of a single [`ChatCompletion`].
    ///
    /// [sse]: https://developer.mozilla.org/en-US/docs/Web/API/Server-sent_events
    pub stream: Option<bool>,

    /// Accepted and discarded.
    pub response_format: Option<serde_json::Value>,

    /// Accepted and discarded.
    pub temperature: Option<f32>,

    /// Accepted and discarded.
    pub top_p: Option<f32>,

    /// A unique identifier for the end user creating this request. Accepted
    /// and discarded.
    pub user: Option<Cow<'a, str>>,
}

impl<'a> CreateChatCompletionRequest<'a> {
    /// Decodes this wire request into the internal envelope.
    pub fn rendezvous_request(&self) -> Result<TurnRequest, ProxyError> {
        let utterance = self
            .messages
            .last_user_utterance()
            .ok_or_else(ProxyError::missing_user_message)?;

        Ok(TurnRequest {
            session_id: self.model.to_string(),
            utterance,
            stream: self.stream.unwrap_or(false),
            format: WireFormat::ChatCompletions,
        })
    }
}

/// A message in a chat completion.
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChatCompletionChoice<'a> {
    /// The message carrying the peer's utterance.
    pub message: ChatMessage<'a>,

    /// The reason that generation terminated at this choice. Always `stop`;
    /// the peer delivers whole utterances.
    pub finish_reason: Option<Cow<'a, str>>,

    /// The index of this choice.
    pub index: i32,
}

/// Usage statistics in a completed chat completion. Always zeroed; the proxy
/// never tokenizes anything.
#[derive(Serialize, Deserialize, Default, ToSchema)]
pub struct ChatCompletionUsage {
    /// The number of generated tokens.
    pub completion_tokens: u32,

    /// The number of tokens in the prompt.
    pub prompt_tokens: u32,

    /// `completion_tokens` + `prompt_tokens`.
    pub total_tokens: u32,
}

/// A full chat completion carrying one whole peer utterance.
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChatCompletion<'a> {
    /// A unique identifier for this completion.
    pub id: Cow<'a, str>,

    /// The single choice carrying the peer's utterance.
    pub choices: Vec<ChatCompletionChoice<'a>>,

    /// The UNIX timestamp at which the completion was generated.
    pub created: i64,

    /// Echoes the session id the request arrived with.
    pub model: Cow<'a, str>,

    /// The object type. This is always `chat.completion`.
    pub object: Cow<'a, str>,

    /// Usage information about this completion.
    pub usage: ChatCompletionUsage,
}

/// A delta-encoded difference for an ongoing, stream-mode chat completion.
#[derive(Serialize, Deserialize, Default, ToSchema)]
pub struct ChatCompletionChunkDelta<'a> {
    /// If present, new content added to the end of the completion stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Cow<'a, str>>,

    /// If present, `content` is being generated under a new role.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Cow<'a, str>>,
}

/// One choice of a stream-mode chat completion chunk.
#[derive(Serialize, Deserialize, Default, ToSchema)]
pub struct ChatCompletionChunkChoice<'a> {
    /// The delta-encoded difference to append to the completion stream.
    pub delta: ChatCompletionChunkDelta<'a>,

    /// If present, this choice terminated the stream. Always `stop` when set.
    pub finish_reason: Option<Cow<'a, str>>,

    /// The index of this choice.
    pub index: u32,
}

/// A chunk generated in streaming mode from a [`CreateChatCompletionRequest`].
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChatCompletionChunk<'a> {
    /// A unique identifier for this chunk.
    pub id: Cow<'a, str>,

    /// The choice deltas of this chunk.
    #[schema(value_type = [ChatCompletionChunkChoice])]
    pub choices: TinyVec<[ChatCompletionChunkChoice<'a>; 1]>,

    /// The UNIX timestamp at which the chunk was generated.
    pub created: i64,

    /// Echoes the session id the request arrived with.
    pub model: Cow<'a, str>,

    /// The object type. This is always `chat.completion.chunk`.
    pub object: Cow<'a, str>,
}

fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4())
}

/// Encodes a peer utterance as a single non-streamed completion.
pub fn encode_completion(session_id: &str, response: &TurnResponse) -> ChatCompletion<'static> {
    ChatCompletion {
        id: Cow::Owned(completion_id()),
        choices: vec![ChatCompletionChoice {
            message: ChatMessage::Assistant {
                content: Some(Cow::Owned(response.utterance.clone())),
                name: None,
            },
            finish_reason: Some(Cow::Borrowed(TurnResponse::FINISH_REASON)),
            index: 0,
        }],
        created: OffsetDateTime::now_utc().unix_timestamp(),
        model: Cow::Owned(session_id.to_string()),
        object: Cow::Borrowed("chat.completion"),
        usage: ChatCompletionUsage::default(),
    }
}

/// Encodes a peer utterance as a chunk sequence: one content delta per
/// whitespace-preserving segment, a `stop` chunk, and the `[DONE]` sentinel.
pub fn encode_chunk_events(
    session_id: &str,
    response: &TurnResponse,
) -> Vec<Result<Event, axum::Error>> {
    let id = completion_id();
    let created = OffsetDateTime::now_utc().unix_timestamp();

    let chunk = |choice: ChatCompletionChunkChoice<'static>| ChatCompletionChunk {
        id: Cow::Owned(id.clone()),
        choices: tiny_vec![[ChatCompletionChunkChoice<'static>; 1] => choice],
        created,
        model: Cow::Owned(session_id.to_string()),
        object: Cow::Borrowed("chat.completion.chunk"),
    };

    let mut events = Vec::new();

    for (index, segment) in turn::stream_segments(&response.utterance)
        .into_iter()
        .enumerate()
    {
        events.push(Event::default().json_data(chunk(ChatCompletionChunkChoice {
            delta: ChatCompletionChunkDelta {
                content: Some(Cow::Owned(segment)),
                role: (index == 0).then(|| Cow::Borrowed("assistant")),
            },
            finish_reason: None,
            index: 0,
        })));
    }

    events.push(Event::default().json_data(chunk(ChatCompletionChunkChoice {
        delta: ChatCompletionChunkDelta::default(),
        finish_reason: Some(Cow::Borrowed(TurnResponse::FINISH_REASON)),
        index: 0,
    })));

    events.push(Ok(Event::default().data("[DONE]")));

    events
}

/// POST `/v1/chat/completions`: exchange one chat turn with the peer sharing
/// the session id carried in `model`.
///
/// The request suspends until the opposite side produces the utterance that
/// answers it, then returns that utterance as a chat completion; with
/// `stream` set, as chunked [server-sent events][sse] instead.
///
/// See [the original OpenAI API specification][openai], which this endpoint is
/// compatible with.
///
/// [sse]: https://developer.mozilla.org/en-US/docs/Web/API/Server-sent_events
/// [openai]: https://platform.openai.com/docs/api-reference/chat/create
#[utoipa::path(
post,
path = "/v1/chat/completions",
request_body = CreateChatCompletionRequest,
responses(
(status = 200, description = "OK", body = ChatCompletion),
(status = 408, description = "the peer did not answer in time", body = ErrorBody),
(status = 409, description = "the session already has both sides in flight", body = ErrorBody),
(status = 410, description = "the session was closed or evicted", body = ErrorBody),
),
)]
pub async fn chat_completions(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = turn::correlation_id(&headers);

    match chat_turn(&state, &request_id, &body).await {
        Ok(response) => turn::with_request_id(response, &request_id),
        Err(err) => turn::error_response(&state, err, &request_id),
    }
}

async fn chat_turn(
    state: &ProxyState,
    request_id: &str,
    body: &Bytes,
) -> Result<Response, ProxyError> {
    turn::check_payload(state, body.len())?;

    let request: CreateChatCompletionRequest =
        serde_json::from_slice(body).map_err(|e| ProxyError::Schema(e.to_string()))?;
    let envelope = request.rendezvous_request()?;

    let session_id = envelope.session_id.clone();
    let stream = envelope.stream;
    let response = turn::execute(state, request_id, envelope).await?;

    if stream {
        let events = encode_chunk_events(&session_id, &response);
        Ok(Sse::new(tokio_stream::iter(events))
            .keep_alive(KeepAlive::default())
            .into_response())
    } else {
        Ok(Json(encode_completion(&session_id, &response)).into_response())
    }
}
