// src/logger.rs
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

pub const LOG_FILE_PREFIX: &str = "plugin_host.log";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber: a stdout printer plus, when `log_dir` is
/// given, a daily rolling plain-text file. `level` is an `EnvFilter`
/// directive (`info`, `plugin_host=debug`, ...); `RUST_LOG` wins over it.
///
/// Only the first call installs anything. Later calls return `Ok(false)`.
pub fn init_tracing(level: &str, log_dir: Option<&Path>) -> anyhow::Result<bool> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level `{level}`"))?;

    let stdout_layer = fmt::layer().with_thread_names(true).with_target(true);

    let file_layer = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir).with_context(|| format!("could not create log dir {}", dir.display()))?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            Some((fmt::layer().with_writer(writer).with_ansi(false), guard))
        }
        None => None,
    };
    let (file_layer, guard) = match file_layer {
        Some((layer, guard)) => (Some(layer), Some(guard)),
        None => (None, None),
    };

    let installed = Registry::default()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    if installed {
        if let Some(guard) = guard {
            let _ = FILE_GUARD.set(guard);
        }
    }
    Ok(installed)
}
