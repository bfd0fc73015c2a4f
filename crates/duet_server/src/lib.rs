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

//! A stateful, bidirectional HTTP rendezvous proxy that pairs two chat
//! clients by session id and exchanges their utterances through
//! OpenAI-compatible and Anthropic-compatible endpoints.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::select;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use utoipa::OpenApi;

use duet_core::envelope::CloseReason;
use duet_core::manager::{spawn_sweeper, ManagerConfig, SessionManager};
use duet_core::session::TurnBudgets;
use duet_core::settings;
use duet_core::settings::{SettingsHandle, SettingsParams};

pub mod cli;
pub mod graceful_shutdown;
pub mod messages_shim;
pub mod misc;
pub mod openai_shim;
pub mod routes;
pub mod status;
pub mod turn;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Duet API",
        description = "Duet rendezvous proxy with OpenAI-compatible and \
                       Anthropic-compatible endpoints.",
    ),
    paths(
        misc::duet_version,
        openai_shim::chat_completions,
        messages_shim::create_message,
        status::health,
        status::metrics,
        status::admin_sessions,
        status::admin_close_session,
    ),
    components(schemas(
        misc::Version,
        openai_shim::CreateChatCompletionRequest,
        openai_shim::ChatCompletion,
        openai_shim::ChatCompletionChoice,
        openai_shim::ChatCompletionUsage,
        openai_shim::ChatCompletionChunk,
        openai_shim::ChatCompletionChunkDelta,
        openai_shim::ChatCompletionChunkChoice,
        openai_shim::ChatMessage,
        openai_shim::ChatMessages,
        openai_shim::ContentPart,
        messages_shim::CreateMessageRequest,
        messages_shim::MessageParam,
        messages_shim::ContentBlock,
        messages_shim::MessageResponse,
        messages_shim::MessageUsage,
        status::HealthResponse,
        turn::ErrorBody,
        turn::ErrorDetail,
        duet_core::envelope::WireFormat,
        duet_core::envelope::CloseReason,
        duet_core::session::SessionState,
        duet_core::manager::SessionSnapshot,
    ))
)]
struct ApiDoc;

/// Result for main functions
pub type DuetResult = Result<(), String>;

/// The immutable per-process proxy configuration, snapshotted from the
/// settings at server start.
#[derive(Debug, Clone, Copy)]
pub struct ProxyConfig {
    /// Handshake and per-turn wait budgets.
    pub budgets: TurnBudgets,

    /// Inbound body cap, in bytes.
    pub max_payload_bytes: usize,

    /// Serve the plaintext metrics endpoint.
    pub enable_metrics: bool,
}

/// Counters behind the metrics endpoint.
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    /// Completed turn exchanges.
    pub turns_total: AtomicU64,

    /// Requests that ended in an error response.
    pub errors_total: AtomicU64,
}

/// Everything the HTTP handlers share: the session directory, the
/// configuration snapshot, and the observability counters.
pub struct ProxyState {
    /// The session directory.
    pub manager: Arc<SessionManager>,

    /// The configuration in force.
    pub config: ProxyConfig,

    /// When this serving environment came up.
    pub started_at: Instant,

    /// Request counters.
    pub metrics: ProxyMetrics,
}

impl ProxyState {
    /// Assembles the shared state around an existing session directory.
    pub fn new(config: ProxyConfig, manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            config,
            started_at: Instant::now(),
            metrics: ProxyMetrics::default(),
        }
    }
}

/// Main entry point for the server process
pub fn start(command: &cli::TopLevel) -> DuetResult {
    match &command.subcommand {
        None => serve(&cli::Serve::default())?,
        Some(cli::Command::Serve(serve_args)) => serve(serve_args)?,
        Some(cli::Command::Config(config_args)) => config(config_args)?,
        Some(cli::Command::Version(_)) => version()?,
        Some(cli::Command::Oasgen(oasgen_args)) => oasgen(oasgen_args)?,
    };

    Ok(())
}

/// Prints the duet version to stdout
pub fn version() -> DuetResult {
    println!("{}", misc::VERSION);

    Ok(())
}

fn config(config_args: &cli::Config) -> DuetResult {
    match &config_args.subcommand {
        cli::ConfigCommand::Reset(_) => config_reset()?,
    };

    Ok(())
}

/// Resets the configuration file to the default settings.
pub fn config_reset() -> DuetResult {
    settings::reset_file(&settings::config_file_path()).map_err(|e| e.to_string())
}

/// Generates the OpenAPI Spec.
pub fn oasgen(args: &cli::Oasgen) -> DuetResult {
    if args.json {
        println!(
            "{}",
            ApiDoc::openapi()
                .to_pretty_json()
                .map_err(|e| e.to_string())?
        );
    } else {
        println!("{}", ApiDoc::openapi().to_yaml().map_err(|e| e.to_string())?);
    }

    Ok(())
}

// Synchronous code that must run before the tokio runtime starts goes here.
fn serve(args: &cli::Serve) -> DuetResult {
    start_server(args)
}

#[tokio::main]
async fn start_server(args: &cli::Serve) -> DuetResult {
    init_tracing();

    let config_path = settings::config_file_path();
    let initial = settings::load_or_seed(&config_path)
        .await
        .map_err(|e| e.to_string())?;
    let (mut settings_handle, reloader) = settings::watch_file(
        &config_path,
        initial,
        settings::DEFAULT_POLL_PERIOD,
    )
    .map_err(|e| e.to_string())?;

    // Each pass builds a serving environment from the parameters of the
    // moment; a settings edit drains it and comes back around.
    loop {
        let restart = run_server(args, &mut settings_handle).await?;

        if !restart {
            break;
        }
        info!("recycling the proxy with the updated settings");
    }

    reloader.abort();

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Serves until the settings change (`Ok(true)`) or a shutdown signal
/// arrives (`Ok(false)`).
async fn run_server(args: &cli::Serve, settings: &mut SettingsHandle) -> Result<bool, String> {
    let params = settings.current();

    let manager = Arc::new(SessionManager::new(ManagerConfig {
        max_sessions: params.max_sessions,
        session_ttl: params.session_ttl(),
        cleanup_interval: params.cleanup_interval(),
        evict_when_full: params.evict_when_full,
    }));
    let state = Arc::new(ProxyState::new(
        ProxyConfig {
            budgets: TurnBudgets {
                handshake: params.handshake_timeout(),
                turn: params.turn_timeout(),
            },
            max_payload_bytes: params.max_payload_bytes,
            enable_metrics: params.enable_metrics || args.metrics,
        },
        manager.clone(),
    ));
    let sweeper = spawn_sweeper(manager.clone());

    let http_app = routes::routes(state).layer(CorsLayer::permissive());
    let stop = CancellationToken::new();
    let mut servers = JoinSet::new();

    for uri in listen_uris(args, &params) {
        let listener = bind_uri(&uri).await?;
        info!(%uri, "duet accepting rendezvous traffic");

        let app = http_app.clone();
        let drained = stop.clone().cancelled_owned();
        servers.spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(drained)
                .await
        });
    }

    let restart = select! {
        _ = settings.changed() => {
            info!("settings file changed on disk, draining the listeners");
            true
        }
        _ = graceful_shutdown::global_shutdown_starts() => false,
    };

    // Wake every suspended exchange first, so in-flight requests get their
    // responses and the drain below is quick.
    stop.cancel();
    sweeper.abort();
    manager.close_all(CloseReason::Shutdown);

    while let Some(finished) = select! {
        joined = servers.join_next() => joined,
        _ = graceful_shutdown::global_shutdown_ends() => {
            return Err("open connections outlived the shutdown grace period".to_string());
        }
    } {
        match finished {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(%err, "a listener exited with an error"),
            Err(err) => warn!(%err, "a listener task panicked"),
        }
    }

    Ok(restart)
}

/// The URIs to serve on: the command line wins, then the settings file.
fn listen_uris(args: &cli::Serve, params: &SettingsParams) -> Vec<String> {
    if args.uri.is_empty() {
        vec![params.default_uri.clone()]
    } else {
        args.uri.clone()
    }
}

/// Turns one `http://host:port` URI into a bound listener.
async fn bind_uri(uri: &str) -> Result<TcpListener, String> {
    let addr = uri.strip_prefix("http://").ok_or_else(|| {
        format!("unsupported listen uri {uri:?}; only http:// addresses are accepted")
    })?;

    TcpListener::bind(addr)
        .await
        .map_err(|err| format!("cannot listen on {addr}: {err}"))
}
