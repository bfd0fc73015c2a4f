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

//! The proxy's on-disk configuration.
//!
//! Settings live in one YAML file under the platform config directory,
//! seeded with defaults on first run. A running server holds a
//! [`SettingsHandle`]: a [`watch`] receiver fed by a reloader task that
//! re-reads the file whenever the file watcher reports an edit. Edits that do
//! not parse are ignored until the file is valid again, and republishing only
//! happens when the parsed parameters actually differ, so touching the file
//! without changing it never recycles the server.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use notify::{PollWatcher, RecursiveMode, Watcher};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How often the reloader's watcher polls the file for edits.
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(3);

static PROJECT_DIRS: Lazy<Option<ProjectDirs>> =
    Lazy::new(|| ProjectDirs::from("com", "EdgenAI", "Duet"));

/// Where the settings file lives: the platform config directory, or the
/// working directory when the platform offers none.
pub fn config_file_path() -> PathBuf {
    match PROJECT_DIRS.as_ref() {
        Some(dirs) => dirs.config_dir().join("duet.yaml"),
        None => PathBuf::from("duet.yaml"),
    }
}

/// Everything that can go wrong around the settings file.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// The file exists but could not be read.
    #[error("cannot read settings at {path}: {source}")]
    Read {
        /// The offending file.
        path: PathBuf,
        /// The underlying I/O failure.
        source: std::io::Error,
    },

    /// The file or its directory could not be written.
    #[error("cannot write settings at {path}: {source}")]
    Write {
        /// The offending file.
        path: PathBuf,
        /// The underlying I/O failure.
        source: std::io::Error,
    },

    /// The file's contents are not a valid parameter set.
    #[error("settings at {path} do not parse: {source}")]
    Parse {
        /// The offending file.
        path: PathBuf,
        /// The underlying YAML failure.
        source: serde_yaml::Error,
    },

    /// The parameters could not be rendered to YAML.
    #[error("settings cannot be encoded: {0}")]
    Encode(serde_yaml::Error),

    /// The file watcher could not be set up.
    #[error("cannot watch the settings file: {0}")]
    Watch(notify::Error),
}

/// Every tunable the proxy reads at startup.
///
/// Unknown keys in the file are ignored and missing keys fall back to their
/// defaults, so a hand-written partial file is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsParams {
    /// The default URI that Duet will receive requests on.
    pub default_uri: String,

    /// Max seconds side A waits for side B to arrive after the opening ping.
    pub handshake_timeout_seconds: u64,

    /// Max seconds a paired side waits for a peer utterance per turn.
    pub turn_timeout_seconds: u64,

    /// Idle seconds before the sweep closes a session.
    pub session_ttl_seconds: u64,

    /// Hard session directory capacity.
    pub max_sessions: usize,

    /// Seconds between TTL sweep passes.
    pub cleanup_interval_seconds: u64,

    /// The maximum size, in bytes, any request body can have.
    pub max_payload_bytes: usize,

    /// When the directory is full, close the idlest session to admit a new
    /// one instead of refusing with an overload error.
    pub evict_when_full: bool,

    /// Serve the plaintext metrics endpoint.
    pub enable_metrics: bool,
}

impl SettingsParams {
    /// The handshake budget as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }

    /// The per-turn budget as a [`Duration`].
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_seconds)
    }

    /// The session idle TTL as a [`Duration`].
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_seconds)
    }

    /// The sweep period as a [`Duration`].
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

impl Default for SettingsParams {
    fn default() -> Self {
        Self {
            default_uri: "http://127.0.0.1:3544".to_string(),
            handshake_timeout_seconds: 30,
            turn_timeout_seconds: 30,
            session_ttl_seconds: 3600,
            max_sessions: 100,
            cleanup_interval_seconds: 60,
            max_payload_bytes: 1024 * 1024,
            evict_when_full: true,
            enable_metrics: false,
        }
    }
}

/// Reads and parses the settings file as-is.
pub async fn read_params(path: &Path) -> Result<SettingsParams, SettingsError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| SettingsError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    serde_yaml::from_slice(&bytes).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads the settings file, seeding it with defaults when it does not exist
/// yet.
pub async fn load_or_seed(path: &Path) -> Result<SettingsParams, SettingsError> {
    match read_params(path).await {
        Err(SettingsError::Read { source, .. }) if source.kind() == ErrorKind::NotFound => {
            let params = SettingsParams::default();
            write_params(path, &params).await?;
            info!(path = %path.display(), "seeded a fresh settings file");

            Ok(params)
        }
        other => other,
    }
}

async fn write_params(path: &Path, params: &SettingsParams) -> Result<(), SettingsError> {
    let yaml = serde_yaml::to_string(params).map_err(SettingsError::Encode)?;

    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| SettingsError::Write {
                path: path.to_path_buf(),
                source,
            })?;
    }

    tokio::fs::write(path, yaml)
        .await
        .map_err(|source| SettingsError::Write {
            path: path.to_path_buf(),
            source,
        })
}

/// Overwrites the file at `path` with the default parameters. Backs the
/// `duet config reset` command, which runs before any runtime exists.
pub fn reset_file(path: &Path) -> Result<(), SettingsError> {
    let yaml =
        serde_yaml::to_string(&SettingsParams::default()).map_err(SettingsError::Encode)?;

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| SettingsError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    }

    std::fs::write(path, yaml).map_err(|source| SettingsError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// A live view of the settings: the current parameters plus a change signal.
pub struct SettingsHandle {
    rx: watch::Receiver<SettingsParams>,
}

impl SettingsHandle {
    /// An owned snapshot of the parameters as of now.
    pub fn current(&self) -> SettingsParams {
        self.rx.borrow().clone()
    }

    /// Resolves when a differing, valid parameter set lands on disk. Pends
    /// forever if the reloader task is gone.
    pub async fn changed(&mut self) {
        if self.rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Watches the settings file and republishes every edit that parses into a
/// parameter set different from the current one.
///
/// Returns the handle plus the reloader task; aborting the task (or dropping
/// every handle) ends the watch.
pub fn watch_file(
    path: &Path,
    initial: SettingsParams,
    poll_period: Duration,
) -> Result<(SettingsHandle, JoinHandle<()>), SettingsError> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    // The PollWatcher tracks the path rather than the inode, surviving the
    // write-to-temp-then-rename dance editors do.
    let mut watcher = PollWatcher::new(
        move |event: notify::Result<notify::Event>| {
            if event.is_ok() {
                let _ = event_tx.send(());
            }
        },
        notify::Config::default().with_poll_interval(poll_period),
    )
    .map_err(SettingsError::Watch)?;
    watcher
        .watch(path, RecursiveMode::NonRecursive)
        .map_err(SettingsError::Watch)?;

    let (params_tx, params_rx) = watch::channel(initial);
    let path = path.to_path_buf();

    let reloader = tokio::spawn(async move {
        // The watcher lives inside the task; its polling stops with us.
        let _watcher = watcher;

        while event_rx.recv().await.is_some() {
            // One save can surface as several events; drain the burst and
            // read once.
            while event_rx.try_recv().is_ok() {}

            match read_params(&path).await {
                Ok(params) => {
                    let published = params_tx.send_if_modified(|current| {
                        if *current == params {
                            false
                        } else {
                            *current = params;
                            true
                        }
                    });

                    if published {
                        info!(path = %path.display(), "settings reloaded");
                    }
                }
                Err(err) => warn!(%err, "ignoring a settings edit that does not parse"),
            }
        }
    });

    Ok((SettingsHandle { rx: params_rx }, reloader))
}
