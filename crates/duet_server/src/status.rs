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

//! Duet service status: liveness, counters, and the redacted admin view of
//! the session directory.

use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_derive::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;

use duet_core::envelope::CloseReason;
use duet_core::manager::SessionSnapshot;

use crate::ProxyState;

/// The liveness report served by `GET /health`.
#[derive(ToSchema, Deserialize, Serialize, Debug, PartialEq, Eq)]
pub struct HealthResponse {
    /// Always `ok` while the process serves requests.
    pub status: String,

    /// Seconds since the server started.
    pub uptime_seconds: u64,

    /// Number of live sessions in the directory.
    pub active_sessions: usize,
}

/// GET `/health`: returns liveness, uptime, and the live session count.
#[utoipa::path(
        get,
        path = "/health",
        responses(
            (status = 200, description = "OK", body = HealthResponse),
        ),
)]
pub async fn health(State(state): State<Arc<ProxyState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_sessions: state.manager.active_count(),
    })
}

/// GET `/metrics`: counters and gauges in the Prometheus text exposition
/// format. Served only when metrics are enabled in the settings or on the
/// command line.
#[utoipa::path(
        get,
        path = "/metrics",
        responses(
            (status = 200, description = "OK"),
            (status = 404, description = "metrics are not enabled"),
        ),
)]
pub async fn metrics(State(state): State<Arc<ProxyState>>) -> Response {
    if !state.config.enable_metrics {
        return StatusCode::NOT_FOUND.into_response();
    }

    let mut body = String::new();
    let mut gauge = |name: &str, help: &str, value: u64| {
        let _ = writeln!(body, "# HELP {name} {help}");
        let _ = writeln!(body, "# TYPE {name} gauge");
        let _ = writeln!(body, "{name} {value}");
    };

    gauge(
        "duet_uptime_seconds",
        "Seconds since the server started.",
        state.started_at.elapsed().as_secs(),
    );
    gauge(
        "duet_sessions_active",
        "Live sessions in the directory.",
        state.manager.active_count() as u64,
    );

    let mut counter = |name: &str, help: &str, value: u64| {
        let _ = writeln!(body, "# HELP {name} {help}");
        let _ = writeln!(body, "# TYPE {name} counter");
        let _ = writeln!(body, "{name} {value}");
    };

    counter(
        "duet_turns_total",
        "Completed turn exchanges.",
        state.metrics.turns_total.load(Ordering::Relaxed),
    );
    counter(
        "duet_errors_total",
        "Requests that ended in an error response.",
        state.metrics.errors_total.load(Ordering::Relaxed),
    );
    counter(
        "duet_sessions_created_total",
        "Sessions created since startup.",
        state.manager.created_total(),
    );
    counter(
        "duet_sessions_evicted_total",
        "Sessions evicted by admission control.",
        state.manager.evicted_total(),
    );
    counter(
        "duet_sessions_expired_total",
        "Sessions closed by the TTL sweep.",
        state.manager.expired_total(),
    );

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

/// GET `/admin/sessions`: the redacted session directory listing.
#[utoipa::path(
        get,
        path = "/admin/sessions",
        responses(
            (status = 200, description = "OK", body = [SessionSnapshot]),
        ),
)]
pub async fn admin_sessions(State(state): State<Arc<ProxyState>>) -> Json<Vec<SessionSnapshot>> {
    Json(state.manager.snapshot())
}

/// DELETE `/admin/sessions/{id}`: administratively closes one session,
/// waking its suspended callers.
#[utoipa::path(
        delete,
        path = "/admin/sessions/{id}",
        responses(
            (status = 204, description = "the session was closed"),
            (status = 404, description = "no such session"),
        ),
)]
pub async fn admin_close_session(
    State(state): State<Arc<ProxyState>>,
    Path(id): Path<String>,
) -> StatusCode {
    if state.manager.close(&id, CloseReason::Admin) {
        info!(session = %id, "session closed by admin request");
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
