//! Configuration for the studio orchestrator.
//!
//! Settings live in `.studio/studio.toml` and are layered:
//! file → environment (`STUDIO_*`, `.env` honored) → CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8787
//!
//! [storage]
//! backend = "sqlite"
//! db_path = ".studio/runs.db"
//!
//! [pipeline]
//! log_limit = 500
//! kill_grace_secs = 5
//! stage_timeout_secs = 900
//! fallback = "on_missing"
//!
//! [paths]
//! assets_root = ".studio/assets"
//! output_root = ".studio/output"
//!
//! [logging]
//! level = "info"
//! json = false
//!
//! [[tools.ingest]]
//! program = "python3"
//! args = ["tools/ingest.py", "--client", "{client}", "--assets", "{asset_dir}"]
//!
//! [tools.generate]
//! program = "python3"
//! args = ["tools/generate.py", "--media", "{media}", "--prompt", "{prompt}", "--out", "{output}"]
//!
//! [tools.drift]
//! program = "python3"
//! args = ["tools/drift.py", "--client", "{client}", "--image", "{target}"]
//!
//! [[clients]]
//! id = "client_acme"
//! name = "Acme Outdoor"
//! requires_review = true
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::studio::models::ClientEntry;

/// Directory holding studio state, relative to the project directory.
pub const STUDIO_DIR: &str = ".studio";

/// Config file name inside [`STUDIO_DIR`].
pub const CONFIG_FILE: &str = "studio.toml";

/// Placeholders substituted into tool arguments before spawning.
pub const TOOL_PLACEHOLDERS: &[&str] = &[
    "client",
    "client_name",
    "run_id",
    "asset_dir",
    "prompt",
    "media",
    "output",
    "output_dir",
    "target",
    "query",
];

/// What the stage executors do when an external tool cannot be used.
///
/// | Policy       | Tool absent     | Tool exited non-zero |
/// |--------------|-----------------|----------------------|
/// | `on_missing` | simulated       | stage failure        |
/// | `always`     | simulated       | simulated            |
/// | `never`      | stage failure   | stage failure        |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    #[default]
    OnMissing,
    Always,
    Never,
}

impl std::fmt::Display for FallbackPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FallbackPolicy::OnMissing => write!(f, "on_missing"),
            FallbackPolicy::Always => write!(f, "always"),
            FallbackPolicy::Never => write!(f, "never"),
        }
    }
}

impl std::str::FromStr for FallbackPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "on_missing" => Ok(FallbackPolicy::OnMissing),
            "always" => Ok(FallbackPolicy::Always),
            "never" => Ok(FallbackPolicy::Never),
            _ => anyhow::bail!(
                "Invalid fallback policy '{}'. Valid values: on_missing, always, never",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS for a locally served frontend.
    #[serde(default)]
    pub dev: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(STUDIO_DIR).join("runs.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Rolling window of log entries kept per run.
    #[serde(default = "default_log_limit")]
    pub log_limit: usize,
    /// Grace period between SIGTERM and SIGKILL on cancellation.
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
    /// Per-stage timeout. Unset means a stage may run indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_timeout_secs: Option<u64>,
    #[serde(default)]
    pub fallback: FallbackPolicy,
    /// How long a cancel request waits for the run to settle.
    #[serde(default = "default_cancel_wait_ms")]
    pub cancel_wait_ms: u64,
}

fn default_log_limit() -> usize {
    500
}

fn default_kill_grace_secs() -> u64 {
    5
}

fn default_cancel_wait_ms() -> u64 {
    6000
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            log_limit: default_log_limit(),
            kill_grace_secs: default_kill_grace_secs(),
            stage_timeout_secs: None,
            fallback: FallbackPolicy::default(),
            cancel_wait_ms: default_cancel_wait_ms(),
        }
    }
}

impl PipelineSection {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs.map(Duration::from_secs)
    }

    pub fn cancel_wait(&self) -> Duration {
        Duration::from_millis(self.cancel_wait_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsSection {
    /// Per-client asset directories live at `<assets_root>/<clientId>`.
    #[serde(default = "default_assets_root")]
    pub assets_root: PathBuf,
    /// Generated media, drift reports and exports.
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
}

fn default_assets_root() -> PathBuf {
    PathBuf::from(STUDIO_DIR).join("assets")
}

fn default_output_root() -> PathBuf {
    PathBuf::from(STUDIO_DIR).join("output")
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            assets_root: default_assets_root(),
            output_root: default_output_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Directory for a daily-rotated log file. Stderr only when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

/// One external tool invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

impl ToolCommand {
    /// Short name used in log lines.
    pub fn display_name(&self) -> String {
        let program = Path::new(&self.program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.clone());
        match self.args.first() {
            Some(first) if !first.starts_with('-') && !first.contains('{') => {
                let script = Path::new(first)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| first.clone());
                format!("{} {}", program, script)
            }
            _ => program,
        }
    }

    /// Placeholder names referenced by the arguments, env values and cwd.
    pub fn placeholders(&self) -> Vec<String> {
        let mut found = Vec::new();
        let cwd = self.cwd.as_ref().map(|p| p.to_string_lossy().into_owned());
        let texts = self
            .args
            .iter()
            .chain(self.env.values())
            .map(String::as_str)
            .chain(cwd.as_deref());
        for text in texts {
            let mut rest = text;
            while let Some(start) = rest.find('{') {
                let after = &rest[start + 1..];
                let Some(end) = after.find('}') else { break };
                let name = &after[..end];
                if !name.is_empty() && !found.iter().any(|f| f == name) {
                    found.push(name.to_string());
                }
                rest = &after[end + 1..];
            }
        }
        found
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsSection {
    /// Ingest runs every entry in order and stops at the first failure.
    #[serde(default)]
    pub ingest: Vec<ToolCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate: Option<ToolCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift: Option<ToolCommand>,
}

/// Top-level `studio.toml` contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StudioToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub clients: Vec<ClientEntry>,
}

/// Written by `studio init`.
pub const DEFAULT_CONFIG: &str = r#"# Brand studio orchestrator configuration.

[server]
host = "127.0.0.1"
port = 8787

[storage]
backend = "sqlite"
db_path = ".studio/runs.db"

[pipeline]
log_limit = 500
kill_grace_secs = 5
# stage_timeout_secs = 900
# on_missing | always | never
fallback = "on_missing"

[paths]
assets_root = ".studio/assets"
output_root = ".studio/output"

[logging]
level = "info"
json = false

# [[tools.ingest]]
# program = "python3"
# args = ["tools/ingest.py", "--client", "{client}", "--assets", "{asset_dir}"]

# [tools.generate]
# program = "python3"
# args = ["tools/generate.py", "--media", "{media}", "--prompt", "{prompt}", "--out", "{output}"]

# [tools.drift]
# program = "python3"
# args = ["tools/drift.py", "--client", "{client}", "--image", "{target}"]

[[clients]]
id = "client_demo"
name = "Demo Brand"
requires_review = false
"#;

impl StudioToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse studio.toml")
    }

    /// Load `studio.toml` from `studio_dir`, or defaults if it doesn't exist.
    pub fn load_or_default(studio_dir: &Path) -> Result<Self> {
        let config_path = studio_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize studio.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `STUDIO_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("STUDIO_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid STUDIO_PORT '{}'", port))?;
        }
        if let Some(host) = lookup("STUDIO_HOST") {
            self.server.host = host;
        }
        if let Some(path) = lookup("STUDIO_DB_PATH") {
            self.storage.db_path = PathBuf::from(path);
        }
        if let Some(policy) = lookup("STUDIO_FALLBACK") {
            self.pipeline.fallback = policy.parse()?;
        }
        Ok(())
    }

    /// Make every relative path absolute against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.storage.db_path);
        resolve(&mut self.paths.assets_root);
        resolve(&mut self.paths.output_root);
        if let Some(dir) = self.logging.dir.as_mut() {
            resolve(dir);
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.pipeline.log_limit == 0 {
            warnings.push("pipeline.log_limit is 0: runs will keep no log history".to_string());
        }
        if self.pipeline.stage_timeout_secs == Some(0) {
            warnings.push("pipeline.stage_timeout_secs is 0: every stage will time out".to_string());
        }

        let tools = self
            .tools
            .ingest
            .iter()
            .map(|t| ("tools.ingest", t))
            .chain(self.tools.generate.iter().map(|t| ("tools.generate", t)))
            .chain(self.tools.drift.iter().map(|t| ("tools.drift", t)));
        for (section, tool) in tools {
            if tool.program.trim().is_empty() {
                warnings.push(format!("{} has an empty program", section));
            }
            for name in tool.placeholders() {
                if !TOOL_PLACEHOLDERS.contains(&name.as_str()) {
                    warnings.push(format!("Unknown placeholder '{{{}}}' in {}", name, section));
                }
            }
        }

        let mut seen = HashSet::new();
        for client in &self.clients {
            if !seen.insert(client.id.as_str()) {
                warnings.push(format!("Duplicate client id '{}'", client.id));
            }
        }

        warnings
    }
}

/// Resolved configuration for one project directory.
///
/// It merges settings from:
/// 1. studio.toml file
/// 2. Environment variables
/// 3. CLI arguments
#[derive(Debug, Clone)]
pub struct StudioConfig {
    pub project_dir: PathBuf,
    pub studio_dir: PathBuf,
    pub toml: StudioToml,
}

impl StudioConfig {
    /// Load `studio.toml` (if any) from `project_dir` and apply environment overrides.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        Self::with_env(project_dir, |key| std::env::var(key).ok())
    }

    /// Like [`StudioConfig::new`] with an explicit environment lookup.
    pub fn with_env<F>(project_dir: PathBuf, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let studio_dir = project_dir.join(STUDIO_DIR);
        let mut toml = StudioToml::load_or_default(&studio_dir)?;
        toml.apply_env(lookup)?;
        toml.resolve_paths(&project_dir);

        Ok(Self {
            project_dir,
            studio_dir,
            toml,
        })
    }

    /// Apply `studio serve` flags on top of file and environment settings.
    pub fn with_cli_args(
        mut self,
        host: Option<String>,
        port: Option<u16>,
        db_path: Option<PathBuf>,
        dev: bool,
    ) -> Self {
        if let Some(host) = host {
            self.toml.server.host = host;
        }
        if let Some(port) = port {
            self.toml.server.port = port;
        }
        if let Some(path) = db_path {
            self.toml.storage.db_path = if path.is_relative() {
                self.project_dir.join(path)
            } else {
                path
            };
        }
        self.toml.server.dev |= dev;
        self
    }

    pub fn config_file(&self) -> PathBuf {
        self.studio_dir.join(CONFIG_FILE)
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

/// Outcome of [`init_studio_dir`].
#[derive(Debug, Clone)]
pub struct InitResult {
    pub studio_dir: PathBuf,
    pub config_file: PathBuf,
    /// False when a `studio.toml` already existed and was left untouched.
    pub created: bool,
}

/// Create `.studio/` under `project_dir` with a default `studio.toml`.
pub fn init_studio_dir(project_dir: &Path) -> Result<InitResult> {
    let studio_dir = project_dir.join(STUDIO_DIR);
    std::fs::create_dir_all(&studio_dir)
        .with_context(|| format!("Failed to create {}", studio_dir.display()))?;
    let config_file = studio_dir.join(CONFIG_FILE);
    let created = !config_file.exists();
    if created {
        std::fs::write(&config_file, DEFAULT_CONFIG)
            .with_context(|| format!("Failed to write {}", config_file.display()))?;
    }
    Ok(InitResult {
        studio_dir,
        config_file,
        created,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_init_writes_default_config_once() {
        let dir = tempdir().unwrap();
        let first = init_studio_dir(dir.path()).unwrap();
        assert!(first.created);
        let parsed = StudioToml::load(&first.config_file).unwrap();
        assert_eq!(parsed.clients.len(), 1);
        assert!(parsed.validate().is_empty());

        std::fs::write(&first.config_file, "[server]\nport = 9000\n").unwrap();
        let second = init_studio_dir(dir.path()).unwrap();
        assert!(!second.created);
        assert_eq!(StudioToml::load(&second.config_file).unwrap().server.port, 9000);
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let toml = StudioToml::parse("").unwrap();
        assert_eq!(toml.server.port, 8787);
        assert_eq!(toml.pipeline.log_limit, 500);
        assert_eq!(toml.pipeline.kill_grace_secs, 5);
        assert_eq!(toml.pipeline.fallback, FallbackPolicy::OnMissing);
        assert!(toml.pipeline.stage_timeout().is_none());
        assert_eq!(toml.storage.backend, StorageBackend::Sqlite);
        assert!(toml.tools.ingest.is_empty());
        assert!(toml.clients.is_empty());
    }

    #[test]
    fn test_default_config_template_parses_cleanly() {
        let toml = StudioToml::parse(DEFAULT_CONFIG).unwrap();
        assert_eq!(toml.clients.len(), 1);
        assert_eq!(toml.clients[0].id, "client_demo");
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_parse_tools_and_clients() {
        let content = r#"
[pipeline]
fallback = "never"
stage_timeout_secs = 30

[[tools.ingest]]
program = "python3"
args = ["index.py", "{asset_dir}"]

[[tools.ingest]]
program = "python3"
args = ["embed.py", "{client}"]

[tools.drift]
program = "drift-check"
args = ["--image", "{target}"]
env = { MODEL = "small" }

[[clients]]
id = "client_acme"
name = "Acme"
requires_review = true
asset_dir = "/data/acme"
"#;
        let toml = StudioToml::parse(content).unwrap();
        assert_eq!(toml.pipeline.fallback, FallbackPolicy::Never);
        assert_eq!(toml.pipeline.stage_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(toml.tools.ingest.len(), 2);
        assert!(toml.tools.generate.is_none());
        let drift = toml.tools.drift.as_ref().unwrap();
        assert_eq!(drift.env.get("MODEL").map(String::as_str), Some("small"));
        assert!(toml.clients[0].requires_review);
        assert_eq!(toml.clients[0].asset_dir.as_deref(), Some("/data/acme"));
    }

    #[test]
    fn test_fallback_policy_from_str() {
        assert_eq!("on-missing".parse::<FallbackPolicy>().unwrap(), FallbackPolicy::OnMissing);
        assert_eq!("ALWAYS".parse::<FallbackPolicy>().unwrap(), FallbackPolicy::Always);
        let err = "sometimes".parse::<FallbackPolicy>().unwrap_err();
        assert!(err.to_string().contains("on_missing, always, never"));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut toml = StudioToml::default();
        toml.apply_env(|key| match key {
            "STUDIO_PORT" => Some("9999".to_string()),
            "STUDIO_FALLBACK" => Some("always".to_string()),
            "STUDIO_DB_PATH" => Some("/tmp/other.db".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(toml.server.port, 9999);
        assert_eq!(toml.pipeline.fallback, FallbackPolicy::Always);
        assert_eq!(toml.storage.db_path, PathBuf::from("/tmp/other.db"));
    }

    #[test]
    fn test_invalid_env_port_is_an_error() {
        let mut toml = StudioToml::default();
        let err = toml
            .apply_env(|key| (key == "STUDIO_PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("STUDIO_PORT"));
    }

    #[test]
    fn test_validate_flags_unknown_placeholder_and_duplicates() {
        let content = r#"
[tools.generate]
program = "gen"
args = ["--out", "{output}", "--style", "{mood}"]

[[clients]]
id = "a"
name = "A"

[[clients]]
id = "a"
name = "A again"
"#;
        let warnings = StudioToml::parse(content).unwrap().validate();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.contains("{mood}")));
        assert!(warnings.iter().any(|w| w.contains("Duplicate client id 'a'")));
    }

    #[test]
    fn test_tool_display_name() {
        let tool = ToolCommand {
            program: "/usr/bin/python3".into(),
            args: vec!["tools/drift.py".into(), "--image".into()],
            ..Default::default()
        };
        assert_eq!(tool.display_name(), "python3 drift.py");
        let bare = ToolCommand {
            program: "drift-check".into(),
            args: vec!["--image".into()],
            ..Default::default()
        };
        assert_eq!(bare.display_name(), "drift-check");
    }

    #[test]
    fn test_load_and_save_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        let mut toml = StudioToml::default();
        toml.server.port = 4000;
        toml.pipeline.fallback = FallbackPolicy::Never;
        toml.save(&path).unwrap();

        let loaded = StudioToml::load(&path).unwrap();
        assert_eq!(loaded.server.port, 4000);
        assert_eq!(loaded.pipeline.fallback, FallbackPolicy::Never);
    }

    #[test]
    fn test_studio_config_resolves_relative_paths() {
        let dir = tempdir().unwrap();
        let config = StudioConfig::with_env(dir.path().to_path_buf(), no_env).unwrap();
        assert!(config.toml.storage.db_path.is_absolute());
        assert!(config.toml.storage.db_path.ends_with(".studio/runs.db"));
        assert!(config.toml.paths.assets_root.ends_with(".studio/assets"));
        assert!(config.config_file().ends_with(".studio/studio.toml"));
    }

    #[test]
    fn test_cli_args_override_file_and_env() {
        let dir = tempdir().unwrap();
        let studio_dir = dir.path().join(STUDIO_DIR);
        std::fs::create_dir_all(&studio_dir).unwrap();
        std::fs::write(studio_dir.join(CONFIG_FILE), "[server]\nport = 5000\n").unwrap();

        let config = StudioConfig::with_env(dir.path().to_path_buf(), |key| {
            (key == "STUDIO_PORT").then(|| "6000".to_string())
        })
        .unwrap();
        assert_eq!(config.toml.server.port, 6000);

        let config = config.with_cli_args(None, Some(7000), Some(PathBuf::from("state.db")), true);
        assert_eq!(config.toml.server.port, 7000);
        assert!(config.toml.server.dev);
        assert!(config.toml.storage.db_path.is_absolute());
        assert!(config.toml.storage.db_path.ends_with("state.db"));
    }
}
