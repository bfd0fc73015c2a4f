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

//! Contains all routes served by Duet

use std::sync::Arc;

use axum::Router;

use crate::messages_shim;
use crate::misc;
use crate::openai_shim;
use crate::status;
use crate::ProxyState;

pub fn routes(state: Arc<ProxyState>) -> Router {
    Router::new()
        // -- Rendezvous endpoints ---------------------------------------------
        // ---- OpenAI wire format ---------------------------------------------
        .route(
            "/v1/chat/completions",
            axum::routing::post(openai_shim::chat_completions),
        )
        // ---- Anthropic wire format ------------------------------------------
        .route(
            "/v1/messages",
            axum::routing::post(messages_shim::create_message),
        )
        // -- Observability ----------------------------------------------------
        .route("/health", axum::routing::get(status::health))
        .route("/metrics", axum::routing::get(status::metrics))
        // -- Administration ---------------------------------------------------
        .route(
            "/admin/sessions",
            axum::routing::get(status::admin_sessions),
        )
        .route(
            "/admin/sessions/:id",
            axum::routing::delete(status::admin_close_session),
        )
        // -- Miscellaneous services -------------------------------------------
        .route("/v1/misc/version", axum::routing::get(misc::duet_version))
        .with_state(state)
}
