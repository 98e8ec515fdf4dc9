//! Process diagnostics via `tracing`.
//!
//! The user-facing run feed lives in each `RunRecord`; this is only the
//! operator log. `RUST_LOG` overrides the configured level.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::LoggingSection;

const LOG_FILE_PREFIX: &str = "studio.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Resolve the filter: `RUST_LOG`, then `--verbose`, then `logging.level`.
pub fn filter_for(logging: &LoggingSection, verbose: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = if verbose { "debug" } else { logging.level.as_str() };
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Keep the returned guard alive for the life
/// of the process or buffered file output is lost.
pub fn init(logging: &LoggingSection, verbose: bool) -> Result<Option<WorkerGuard>> {
    let mut layers: Vec<BoxedLayer> = Vec::new();

    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    if logging.json {
        layers.push(stderr.json().boxed());
    } else {
        layers.push(stderr.with_target(false).boxed());
    }

    let guard = match &logging.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            if logging.json {
                layers.push(file.json().boxed());
            } else {
                layers.push(file.boxed());
            }
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter_for(logging, verbose))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
