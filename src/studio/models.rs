use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::OrchestratorError;

/// Opaque key-value payload supplied when a run is created.
pub type RunInputs = serde_json::Map<String, serde_json::Value>;

/// Label used for log lines the engine emits outside any stage.
pub const SYSTEM_STAGE: &str = "System";

/// Unique identifier of a run. Generated once at creation and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RunId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| format!("Invalid run id: {}", s))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Full,
    Ingest,
    Images,
    Video,
    Drift,
    Export,
}

impl RunMode {
    pub const ALL: [RunMode; 6] = [
        Self::Full,
        Self::Ingest,
        Self::Images,
        Self::Video,
        Self::Drift,
        Self::Export,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Ingest => "ingest",
            Self::Images => "images",
            Self::Video => "video",
            Self::Drift => "drift",
            Self::Export => "export",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "ingest" => Ok(Self::Ingest),
            "images" => Ok(Self::Images),
            "video" => Ok(Self::Video),
            "drift" => Ok(Self::Drift),
            "export" => Ok(Self::Export),
            _ => Err(OrchestratorError::InvalidMode(s.to_string())),
        }
    }
}

/// Run lifecycle.
///
/// ```text
/// ready ──> running ──> needs_review ──> complete | blocked
///   │          ├──────> blocked
///   │          ├──────> complete
///   │          └──────> canceled
///   ├──> canceled   (canceled before the pipeline started)
///   └──> blocked    (pipeline could not start)
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ready,
    Running,
    NeedsReview,
    Blocked,
    Complete,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::NeedsReview => "needs_review",
            Self::Blocked => "blocked",
            Self::Complete => "complete",
            Self::Canceled => "canceled",
        }
    }

    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Blocked | Self::Complete | Self::Canceled)
    }

    pub fn can_transition_to(&self, to: RunStatus) -> bool {
        matches!(
            (self, to),
            (Self::Ready, Self::Running)
                | (Self::Ready, Self::Canceled)
                | (Self::Ready, Self::Blocked)
                | (Self::Running, Self::NeedsReview)
                | (Self::Running, Self::Blocked)
                | (Self::Running, Self::Complete)
                | (Self::Running, Self::Canceled)
                | (Self::NeedsReview, Self::Complete)
                | (Self::NeedsReview, Self::Blocked)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "needs_review" => Ok(Self::NeedsReview),
            "blocked" => Ok(Self::Blocked),
            "complete" => Ok(Self::Complete),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Ingest,
    Generate,
    Drift,
    Review,
    Export,
}

impl StageId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Generate => "generate",
            Self::Drift => "drift",
            Self::Review => "review",
            Self::Export => "export",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingest" => Ok(Self::Ingest),
            "generate" => Ok(Self::Generate),
            "drift" => Ok(Self::Drift),
            "review" => Ok(Self::Review),
            "export" => Ok(Self::Export),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Skipped,
    Blocked,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Blocked => "blocked",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of a stage, as handed out by the stage registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageDefinition {
    pub id: StageId,
    pub label: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StageState {
    pub id: StageId,
    pub label: String,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

impl StageState {
    pub fn pending(def: &StageDefinition) -> Self {
        Self {
            id: def.id,
            label: def.label.to_string(),
            status: StageStatus::Pending,
            started_at: None,
            ended_at: None,
            message: None,
        }
    }

    pub fn start(&mut self) {
        self.status = StageStatus::Running;
        self.started_at.get_or_insert_with(Utc::now);
    }

    pub fn finish(&mut self, status: StageStatus, message: Option<String>) {
        self.status = status;
        self.message = message;
        self.ended_at.get_or_insert_with(Utc::now);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub message: String,
    pub stage: String,
    pub level: LogLevel,
}

impl LogEntry {
    pub fn new(stage: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            message: message.into(),
            stage: stage.into(),
            level,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Image,
    Video,
    Report,
    Package,
    Summary,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Report => "report",
            Self::Package => "package",
            Self::Summary => "summary",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ArtifactKind,
    pub path: String,
    pub stage: StageId,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(
        name: impl Into<String>,
        kind: ArtifactKind,
        path: impl Into<String>,
        stage: StageId,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            path: path.into(),
            stage,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReviewState {
    pub required: bool,
    pub status: ReviewStatus,
    pub notes: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ReviewState {
    pub fn new(required: bool) -> Self {
        Self {
            required,
            status: ReviewStatus::Pending,
            notes: None,
            updated_at: Utc::now(),
        }
    }

    /// True while a required review has not been approved.
    pub fn is_blocking(&self) -> bool {
        self.required && self.status != ReviewStatus::Approved
    }
}

/// One end-to-end execution of the pipeline for a client and mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: RunId,
    pub client_id: String,
    pub mode: RunMode,
    pub status: RunStatus,
    pub stages: Vec<StageState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub review_state: Option<ReviewState>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub inputs: RunInputs,
    #[serde(default)]
    pub error: Option<String>,
}

impl RunRecord {
    pub fn new(
        client_id: impl Into<String>,
        mode: RunMode,
        stages: &[StageDefinition],
        inputs: RunInputs,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: RunId::new(),
            client_id: client_id.into(),
            mode,
            status: RunStatus::Ready,
            stages: stages.iter().map(StageState::pending).collect(),
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
            review_state: None,
            artifacts: Vec::new(),
            logs: Vec::new(),
            inputs,
            error: None,
        }
    }

    /// Advance `updated_at`, never moving it backwards.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// Apply a status transition, stamping `startedAt`/`endedAt` at most once.
    pub fn transition(&mut self, to: RunStatus) -> Result<(), OrchestratorError> {
        if !self.status.can_transition_to(to) {
            return Err(OrchestratorError::InvalidTransition {
                id: self.run_id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to == RunStatus::Running {
            self.started_at.get_or_insert_with(Utc::now);
        }
        if to.is_terminal() {
            self.ended_at.get_or_insert_with(Utc::now);
        }
        self.touch();
        Ok(())
    }

    /// Append a log entry, keeping only the most recent `limit` entries.
    pub fn push_log(&mut self, entry: LogEntry, limit: usize) {
        self.logs.push(entry);
        if self.logs.len() > limit {
            let excess = self.logs.len() - limit;
            self.logs.drain(..excess);
        }
    }

    pub fn stage(&self, id: StageId) -> Option<&StageState> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn review_blocking(&self) -> bool {
        self.review_state.as_ref().is_some_and(ReviewState::is_blocking)
    }

    /// Most recent image or video artifact, the default drift-check target.
    pub fn latest_media_artifact(&self) -> Option<&Artifact> {
        self.artifacts
            .iter()
            .rev()
            .find(|a| matches!(a.kind, ArtifactKind::Image | ArtifactKind::Video))
    }

    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.inputs
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn input_bool(&self, key: &str) -> Option<bool> {
        self.inputs.get(key).and_then(|v| v.as_bool())
    }
}

/// Entry of the external, read-only client directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientEntry {
    pub id: String,
    pub name: String,
    #[serde(default, alias = "requires_review")]
    pub requires_review: bool,
    #[serde(default, alias = "asset_dir", skip_serializing_if = "Option::is_none")]
    pub asset_dir: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defs() -> Vec<StageDefinition> {
        vec![
            StageDefinition {
                id: StageId::Ingest,
                label: "Ingest",
            },
            StageDefinition {
                id: StageId::Export,
                label: "Export",
            },
        ]
    }

    #[test]
    fn test_new_run_is_ready_with_pending_stages() {
        let run = RunRecord::new("client_a", RunMode::Full, &defs(), RunInputs::new());
        assert_eq!(run.status, RunStatus::Ready);
        assert_eq!(run.stages.len(), 2);
        assert!(run.stages.iter().all(|s| s.status == StageStatus::Pending));
        assert!(run.started_at.is_none());
        assert!(run.ended_at.is_none());
    }

    #[test]
    fn test_run_ids_are_unique() {
        let a = RunRecord::new("c", RunMode::Drift, &defs(), RunInputs::new());
        let b = RunRecord::new("c", RunMode::Drift, &defs(), RunInputs::new());
        assert_ne!(a.run_id, b.run_id);
    }

    #[test]
    fn test_valid_transitions() {
        assert!(RunStatus::Ready.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Ready.can_transition_to(RunStatus::Canceled));
        assert!(RunStatus::Running.can_transition_to(RunStatus::NeedsReview));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Complete));
        assert!(RunStatus::NeedsReview.can_transition_to(RunStatus::Complete));
        assert!(RunStatus::NeedsReview.can_transition_to(RunStatus::Blocked));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Ready));
        assert!(!RunStatus::Complete.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Canceled.can_transition_to(RunStatus::Complete));
        assert!(!RunStatus::Blocked.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::NeedsReview.can_transition_to(RunStatus::Canceled));
        assert!(!RunStatus::NeedsReview.can_transition_to(RunStatus::Ready));
    }

    #[test]
    fn test_transition_stamps_timestamps_once() {
        let mut run = RunRecord::new("c", RunMode::Full, &defs(), RunInputs::new());
        run.transition(RunStatus::Running).unwrap();
        let started = run.started_at.expect("startedAt set");
        run.transition(RunStatus::NeedsReview).unwrap();
        assert!(run.ended_at.is_none());
        run.transition(RunStatus::Complete).unwrap();
        let ended = run.ended_at.expect("endedAt set");
        assert_eq!(run.started_at, Some(started));
        assert!(ended >= started);
        assert!(run.transition(RunStatus::Blocked).is_err());
        assert_eq!(run.ended_at, Some(ended));
    }

    #[test]
    fn test_push_log_keeps_rolling_window() {
        let mut run = RunRecord::new("c", RunMode::Full, &defs(), RunInputs::new());
        for i in 0..10 {
            run.push_log(LogEntry::new("Ingest", LogLevel::Info, format!("line {}", i)), 4);
        }
        assert_eq!(run.logs.len(), 4);
        assert_eq!(run.logs[0].message, "line 6");
        assert_eq!(run.logs[3].message, "line 9");
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("drift".parse::<RunMode>().unwrap(), RunMode::Drift);
        assert_eq!(" FULL ".parse::<RunMode>().unwrap(), RunMode::Full);
        assert!(matches!(
            "campaign".parse::<RunMode>(),
            Err(OrchestratorError::InvalidMode(_))
        ));
    }

    #[test]
    fn test_run_record_serializes_camel_case() {
        let run = RunRecord::new("client_a", RunMode::Video, &defs(), RunInputs::new());
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["clientId"], "client_a");
        assert_eq!(json["mode"], "video");
        assert_eq!(json["status"], "ready");
        assert_eq!(json["stages"][0]["status"], "pending");
        assert!(json.get("runId").is_some());
    }

    #[test]
    fn test_artifact_serializes_type_field() {
        let artifact = Artifact::new("a.png", ArtifactKind::Image, "/tmp/a.png", StageId::Generate);
        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["stage"], "generate");
    }

    #[test]
    fn test_review_blocking() {
        let mut run = RunRecord::new("c", RunMode::Full, &defs(), RunInputs::new());
        assert!(!run.review_blocking());
        run.review_state = Some(ReviewState::new(true));
        assert!(run.review_blocking());
        if let Some(review) = run.review_state.as_mut() {
            review.status = ReviewStatus::Approved;
        }
        assert!(!run.review_blocking());
    }

    #[test]
    fn test_latest_media_artifact_skips_reports() {
        let mut run = RunRecord::new("c", RunMode::Full, &defs(), RunInputs::new());
        run.artifacts
            .push(Artifact::new("a.png", ArtifactKind::Image, "/a.png", StageId::Generate));
        run.artifacts
            .push(Artifact::new("b.mp4", ArtifactKind::Video, "/b.mp4", StageId::Generate));
        run.artifacts
            .push(Artifact::new("r.json", ArtifactKind::Report, "/r.json", StageId::Drift));
        assert_eq!(run.latest_media_artifact().unwrap().name, "b.mp4");
    }
}
