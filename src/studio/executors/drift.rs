use std::fmt;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use super::{StageContext, StageExecutor, StageReport, ToolInvocation, ToolResult, execute_with_fallback};
use crate::studio::models::{Artifact, ArtifactKind, StageId};

const DEFAULT_QUERY: &str = "Brand lifestyle image with natural lighting";

/// Grades the latest generated media against the client's brand profile.
pub struct DriftExecutor;

/// Gate decision reported by the drift tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    AutoPass,
    AutoFail,
    HumanReview,
}

impl GateDecision {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "AUTO_PASS" => Some(Self::AutoPass),
            "AUTO_FAIL" => Some(Self::AutoFail),
            "HITL_REVIEW" => Some(Self::HumanReview),
            _ => None,
        }
    }
}

impl fmt::Display for GateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AutoPass => "AUTO_PASS",
            Self::AutoFail => "AUTO_FAIL",
            Self::HumanReview => "HITL_REVIEW",
        })
    }
}

/// The last stdout line that parses as a JSON object, if any.
pub fn last_json_object(lines: &[String]) -> Option<Value> {
    lines
        .iter()
        .rev()
        .filter_map(|l| serde_json::from_str::<Value>(l.trim()).ok())
        .find(Value::is_object)
}

/// `fusion.gate_decision`, falling back to a top-level `gate_decision`.
pub fn gate_decision(result: &Value) -> Option<GateDecision> {
    result
        .pointer("/fusion/gate_decision")
        .or_else(|| result.get("gate_decision"))
        .and_then(Value::as_str)
        .and_then(GateDecision::parse)
}

fn score(result: &Value) -> Option<f64> {
    result
        .pointer("/fusion/final_score")
        .or_else(|| result.get("score"))
        .and_then(Value::as_f64)
}

impl DriftExecutor {
    fn target(ctx: &StageContext) -> Option<String> {
        ctx.run
            .input_str("imagePath")
            .map(str::to_string)
            .or_else(|| ctx.run.latest_media_artifact().map(|a| a.path.clone()))
    }

    fn demo_script(target: Option<&str>) -> Vec<String> {
        vec![
            format!("Comparing {} against brand profile", target.unwrap_or("sample media")),
            "Visual similarity 0.91, semantic similarity 0.88".to_string(),
            "Gate decision: AUTO_PASS".to_string(),
        ]
    }

    async fn write_report(ctx: &StageContext, report: &Value) -> anyhow::Result<Artifact> {
        let dir = ctx.client_output_dir().join("reports");
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create report directory {}", dir.display()))?;
        let name = format!("drift_{}.json", ctx.run.run_id);
        let path: PathBuf = dir.join(&name);
        let body = serde_json::to_vec_pretty(report).context("Failed to encode drift report")?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("Failed to write drift report {}", path.display()))?;
        Ok(Artifact::new(name, ArtifactKind::Report, path.to_string_lossy(), StageId::Drift))
    }
}

#[async_trait]
impl StageExecutor for DriftExecutor {
    async fn execute(&self, ctx: &StageContext) -> anyhow::Result<StageReport> {
        let target = Self::target(ctx);
        let query = ctx
            .run
            .input_str("textQuery")
            .unwrap_or(DEFAULT_QUERY)
            .to_string();

        let invocation = match (ctx.settings.tools.drift.as_ref(), target.as_deref()) {
            (Some(_), None) => {
                ctx.info("No generated media to check").await;
                return Ok(StageReport::skipped("No media to check"));
            }
            (Some(tool), Some(target)) => {
                ctx.info(format!("Checking {}", target)).await;
                ToolInvocation::ready(
                    tool.display_name(),
                    ctx.tool_spec(
                        tool,
                        &[("target", target.to_string()), ("query", query.clone())],
                    ),
                )
            }
            (None, _) => ToolInvocation::absent("drift", "no drift tool configured"),
        };

        let demo = Self::demo_script(target.as_deref());
        let (decision, result, simulated) =
            match execute_with_fallback(ctx, &invocation, &demo).await {
                ToolResult::Ran(outcome) => {
                    let result = last_json_object(&outcome.stdout_tail);
                    let decision = result.as_ref().and_then(gate_decision);
                    (decision, result, false)
                }
                ToolResult::Simulated => (Some(GateDecision::AutoPass), None, true),
                ToolResult::Failed(message) => return Ok(StageReport::failed(message)),
                ToolResult::Canceled => return Ok(StageReport::canceled()),
            };

        let report = json!({
            "runId": ctx.run.run_id,
            "clientId": ctx.client.id,
            "target": target,
            "query": query,
            "decision": decision.map(|d| d.to_string()),
            "score": result.as_ref().and_then(score),
            "result": result,
            "simulated": simulated,
            "createdAt": Utc::now(),
        });
        let artifact = Self::write_report(ctx, &report).await?;
        ctx.info(format!("Drift report written to {}", artifact.path)).await;
        let artifacts = vec![artifact];

        let score_note = result
            .as_ref()
            .and_then(score)
            .map(|s| format!(" (score {:.2})", s))
            .unwrap_or_default();

        Ok(match decision {
            Some(GateDecision::AutoPass) => StageReport::completed()
                .message(format!("Drift check passed{}", score_note))
                .artifacts(artifacts),
            Some(GateDecision::AutoFail) => {
                StageReport::failed(format!("Drift check failed: AUTO_FAIL{}", score_note))
                    .artifacts(artifacts)
            }
            Some(GateDecision::HumanReview) => {
                ctx.warn("Drift check flagged media for human review").await;
                StageReport::completed()
                    .message(format!("Human review requested{}", score_note))
                    .artifacts(artifacts)
                    .review_required(true)
            }
            None => {
                ctx.warn("Drift tool reported no gate decision").await;
                StageReport::completed()
                    .message("Drift check finished without a gate decision")
                    .artifacts(artifacts)
            }
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::studio::executors::StageOutcome;
    use crate::studio::executors::test_support::{harness, shell_tool};
    use crate::studio::models::RunMode;

    fn tool_printing(json_line: &str) -> crate::config::ToolCommand {
        shell_tool(&format!("echo 'checking {{target}}'; echo '{}'", json_line))
    }

    #[test]
    fn test_gate_decision_prefers_fusion() {
        let v = json!({"gate_decision": "AUTO_FAIL", "fusion": {"gate_decision": "HITL_REVIEW"}});
        assert_eq!(gate_decision(&v), Some(GateDecision::HumanReview));
        let v = json!({"gate_decision": "auto_pass"});
        assert_eq!(gate_decision(&v), Some(GateDecision::AutoPass));
        assert_eq!(gate_decision(&json!({"other": 1})), None);
    }

    #[test]
    fn test_last_json_object_skips_noise() {
        let lines = vec![
            "{\"gate_decision\": \"AUTO_FAIL\"}".to_string(),
            "loading model".to_string(),
            "{\"gate_decision\": \"AUTO_PASS\"}".to_string(),
            "[1, 2]".to_string(),
        ];
        let v = last_json_object(&lines).unwrap();
        assert_eq!(v["gate_decision"], "AUTO_PASS");
    }

    #[tokio::test]
    async fn test_no_tool_simulates_pass_and_writes_report() {
        let h = harness(RunMode::Drift, StageId::Drift, json!({}));
        let report = DriftExecutor.execute(&h.ctx).await.unwrap();
        assert_eq!(report.outcome, StageOutcome::Completed);
        assert_eq!(report.artifacts.len(), 1);
        assert_eq!(report.artifacts[0].kind, ArtifactKind::Report);
        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(&report.artifacts[0].path).unwrap())
                .unwrap();
        assert_eq!(written["simulated"], true);
        assert!(report.artifacts[0].path.contains("client_acme/reports/drift_"));
        assert!(h.has_demo_line());
    }

    #[tokio::test]
    async fn test_tool_present_without_target_skips() {
        let mut h = harness(RunMode::Drift, StageId::Drift, json!({}));
        h.settings_mut().tools.drift = Some(tool_printing("{}"));
        let report = DriftExecutor.execute(&h.ctx).await.unwrap();
        assert_eq!(report.outcome, StageOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_auto_fail_fails_stage() {
        let mut h = harness(RunMode::Drift, StageId::Drift, json!({"imagePath": "/tmp/hero.png"}));
        h.settings_mut().tools.drift =
            Some(tool_printing(r#"{"fusion": {"gate_decision": "AUTO_FAIL", "final_score": 0.41}}"#));
        let report = DriftExecutor.execute(&h.ctx).await.unwrap();
        assert_eq!(report.outcome, StageOutcome::Failed);
        assert_eq!(report.message.as_deref(), Some("Drift check failed: AUTO_FAIL (score 0.41)"));
        assert!(h.messages().contains(&"checking /tmp/hero.png".to_string()));
    }

    #[tokio::test]
    async fn test_hitl_review_requires_review() {
        let mut h = harness(RunMode::Drift, StageId::Drift, json!({"imagePath": "/tmp/hero.png"}));
        h.settings_mut().tools.drift = Some(tool_printing(r#"{"gate_decision": "HITL_REVIEW"}"#));
        let report = DriftExecutor.execute(&h.ctx).await.unwrap();
        assert_eq!(report.outcome, StageOutcome::Completed);
        assert_eq!(report.review_required, Some(true));
    }

    #[tokio::test]
    async fn test_latest_media_artifact_is_default_target() {
        let mut h = harness(RunMode::Full, StageId::Drift, json!({}));
        h.ctx.run.artifacts.push(Artifact::new(
            "hero.png",
            ArtifactKind::Image,
            "/tmp/generated/hero.png",
            StageId::Generate,
        ));
        h.settings_mut().tools.drift = Some(tool_printing(r#"{"gate_decision": "AUTO_PASS"}"#));
        let report = DriftExecutor.execute(&h.ctx).await.unwrap();
        assert_eq!(report.outcome, StageOutcome::Completed);
        assert!(h.messages().contains(&"checking /tmp/generated/hero.png".to_string()));
    }
}
