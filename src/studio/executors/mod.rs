//! Stage executors.
//!
//! One executor per stage kind. Each turns tool results into a
//! [`StageReport`]; the pipeline engine alone decides what the report means
//! for the run.
//!
//! - `ingest`: index the client's asset directory
//! - `generate`: produce image/video media from a prompt
//! - `drift`: grade the latest media against the brand profile
//! - `review`: decide whether a human must sign off
//! - `export`: write the run summary package

pub mod drift;
pub mod export;
pub mod fallback;
pub mod generate;
pub mod ingest;
pub mod review;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::models::{Artifact, ClientEntry, LogLevel, RunRecord, StageDefinition, StageId};
use super::process::{LogSink, ProcessRunner, ProcessSpec};
use crate::config::{FallbackPolicy, PathsSection, ToolCommand, ToolsSection};

pub use fallback::{ToolInvocation, ToolResult, execute_with_fallback};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Completed,
    Skipped,
    Failed,
    Canceled,
}

/// What an executor hands back to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub outcome: StageOutcome,
    pub message: Option<String>,
    pub artifacts: Vec<Artifact>,
    /// `Some(true)` asks the engine to require human review for the run.
    pub review_required: Option<bool>,
}

impl StageReport {
    fn with_outcome(outcome: StageOutcome, message: Option<String>) -> Self {
        Self {
            outcome,
            message,
            artifacts: Vec::new(),
            review_required: None,
        }
    }

    pub fn completed() -> Self {
        Self::with_outcome(StageOutcome::Completed, None)
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self::with_outcome(StageOutcome::Skipped, Some(message.into()))
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::with_outcome(StageOutcome::Failed, Some(message.into()))
    }

    pub fn canceled() -> Self {
        Self::with_outcome(StageOutcome::Canceled, Some("Canceled".to_string()))
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn artifacts(mut self, artifacts: Vec<Artifact>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn review_required(mut self, required: bool) -> Self {
        self.review_required = Some(required);
        self
    }
}

/// Settings shared by every executor invocation.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub tools: ToolsSection,
    pub paths: PathsSection,
    pub fallback: FallbackPolicy,
    pub runner: ProcessRunner,
}

/// Everything an executor may look at while running one stage.
#[derive(Clone)]
pub struct StageContext {
    /// Snapshot of the run taken when the stage started.
    pub run: RunRecord,
    pub client: ClientEntry,
    pub stage: StageDefinition,
    pub logger: Arc<dyn LogSink>,
    pub cancel: CancellationToken,
    pub settings: Arc<ExecutorSettings>,
}

impl StageContext {
    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.logger.emit(level, message.into()).await;
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message).await;
    }

    pub async fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message).await;
    }

    /// `<output_root>/<clientId>`
    pub fn client_output_dir(&self) -> PathBuf {
        self.settings.paths.output_root.join(&self.client.id)
    }

    /// Placeholder values every tool invocation can reference.
    pub fn base_vars(&self) -> HashMap<&'static str, String> {
        HashMap::from([
            ("client", self.client.id.clone()),
            ("client_name", self.client.name.clone()),
            ("run_id", self.run.run_id.to_string()),
            (
                "output_dir",
                self.client_output_dir().to_string_lossy().into_owned(),
            ),
        ])
    }

    /// Resolve a configured tool into a concrete process spec.
    pub fn tool_spec(&self, tool: &ToolCommand, extra: &[(&'static str, String)]) -> ProcessSpec {
        let mut vars = self.base_vars();
        vars.extend(extra.iter().cloned());
        ProcessSpec {
            program: substitute(&tool.program, &vars),
            args: tool.args.iter().map(|a| substitute(a, &vars)).collect(),
            cwd: tool
                .cwd
                .as_ref()
                .map(|p| PathBuf::from(substitute(&p.to_string_lossy(), &vars))),
            env: tool
                .env
                .iter()
                .map(|(k, v)| (k.clone(), substitute(v, &vars)))
                .collect(),
        }
    }
}

/// Replace `{name}` occurrences with values from `vars`. Unknown names are
/// left untouched.
pub fn substitute(template: &str, vars: &HashMap<&'static str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => match vars.get(&after[..end]) {
                Some(value) => {
                    out.push_str(value);
                    rest = &after[end + 1..];
                }
                None => {
                    out.push('{');
                    rest = after;
                }
            },
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Run the stage. An `Err` is reported as a stage failure carrying the
    /// error text.
    async fn execute(&self, ctx: &StageContext) -> anyhow::Result<StageReport>;
}

pub type ExecutorMap = HashMap<StageId, Arc<dyn StageExecutor>>;

/// The built-in executor for every stage kind.
pub fn default_executors() -> ExecutorMap {
    let mut map: ExecutorMap = HashMap::new();
    map.insert(StageId::Ingest, Arc::new(ingest::IngestExecutor));
    map.insert(StageId::Generate, Arc::new(generate::GenerateExecutor));
    map.insert(StageId::Drift, Arc::new(drift::DriftExecutor));
    map.insert(StageId::Review, Arc::new(review::ReviewExecutor));
    map.insert(StageId::Export, Arc::new(export::ExportExecutor));
    map
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_known_placeholders() {
        let vars = HashMap::from([("client", "acme".to_string()), ("media", "image".to_string())]);
        assert_eq!(
            substitute("--client={client} --media {media}", &vars),
            "--client=acme --media image"
        );
    }

    #[test]
    fn test_substitute_leaves_unknown_and_unbalanced() {
        let vars = HashMap::from([("client", "acme".to_string())]);
        assert_eq!(substitute("{other}-{client}", &vars), "{other}-acme");
        assert_eq!(substitute("json {\"a\": 1", &vars), "json {\"a\": 1");
        assert_eq!(substitute("trailing {", &vars), "trailing {");
    }

    #[test]
    fn test_default_executors_cover_every_stage() {
        let map = default_executors();
        for id in [
            StageId::Ingest,
            StageId::Generate,
            StageId::Drift,
            StageId::Review,
            StageId::Export,
        ] {
            assert!(map.contains_key(&id), "missing executor for {}", id);
        }
    }

    #[test]
    fn test_report_builders() {
        let report = StageReport::completed().message("done").review_required(true);
        assert_eq!(report.outcome, StageOutcome::Completed);
        assert_eq!(report.message.as_deref(), Some("done"));
        assert_eq!(report.review_required, Some(true));
        assert_eq!(StageReport::canceled().message.as_deref(), Some("Canceled"));
    }
}
