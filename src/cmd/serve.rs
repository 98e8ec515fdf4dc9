//! HTTP server command: `studio serve`.

use std::path::{Path, PathBuf};

use anyhow::Result;

use brand_studio::config::StudioConfig;
use brand_studio::studio::server::start_server;
use brand_studio::telemetry;

pub async fn cmd_serve(
    project_dir: &Path,
    verbose: bool,
    host: Option<String>,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    let config = StudioConfig::new(project_dir.to_path_buf())?.with_cli_args(host, port, db_path, dev);
    let _guard = telemetry::init(&config.toml.logging, verbose)?;

    if !config.config_file().exists() {
        tracing::info!(
            path = %config.config_file().display(),
            "no studio.toml found, using defaults (run `studio init` to create one)"
        );
    }
    for warning in config.validate() {
        tracing::warn!(%warning, "configuration warning");
    }

    start_server(&config).await
}
