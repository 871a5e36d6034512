// Copyright 2025 jscgi Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # jscgi CLI
//!
//! Command-line interface for the jscgi process manager.
//!
//! The same binary plays two roles:
//!
//! - **Supervisor** (`jscgi serve`): loads the configuration and keeps a pool
//!   of worker processes running
//! - **Worker** (`jscgi worker`): started by the supervisor, serves requests
//!   on the shared port
//!
//! This crate holds what both roles share: log sink setup and the process
//! span that tags every log line with the emitting process.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context as _, Result};
use jscgi_common::config::WORKER_CONFIG_ENV;
use jscgi_common::Config;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Installs the global subscriber.
///
/// Events go to stderr, to `output_log` when configured, and (warnings and
/// errors only) to `error_log` when configured. The level defaults to INFO
/// and can be overridden with `RUST_LOG`.
pub fn init_logging(config: &Config) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr = fmt::layer().with_writer(std::io::stderr);

    let output = match &config.output_log {
        Some(path) => Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(open_log(path)?)),
        ),
        None => None,
    };

    let errors = match &config.error_log {
        Some(path) => Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(open_log(path)?))
                .with_filter(LevelFilter::WARN),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr)
        .with(output)
        .with(errors)
        .try_init()
        .context("failed to install the log subscriber")?;

    Ok(())
}

/// Opens a log file for appending, creating it if needed.
fn open_log(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}

/// Span identifying this process in every log line.
pub fn process_span(role: &str) -> tracing::Span {
    tracing::info_span!("jscgi", pid = std::process::id(), role)
}

/// Reads the configuration the supervisor handed to this worker.
pub fn worker_config_from_env() -> Result<Config> {
    let raw = std::env::var(WORKER_CONFIG_ENV)
        .with_context(|| format!("{} is not set; workers are started by `jscgi serve`", WORKER_CONFIG_ENV))?;
    Ok(Config::from_json(&raw)?)
}
