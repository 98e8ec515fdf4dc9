use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use super::{StageContext, StageExecutor, StageReport};
use crate::studio::models::{Artifact, ArtifactKind, RunRecord, StageId};

/// Writes the run summary package once review allows it.
pub struct ExportExecutor;

/// Stage message of an export held back by a pending review.
pub const HELD_FOR_REVIEW: &str = "Awaiting human review";

/// Serialize a summary of `run` to `<output_root>/<clientId>/exports/<runId>.json`.
///
/// Shared by the export stage and out-of-band forced exports.
pub async fn write_export(run: &RunRecord, output_root: &Path) -> anyhow::Result<Artifact> {
    let dir = output_root.join(&run.client_id).join("exports");
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("Failed to create export directory {}", dir.display()))?;

    let summary = json!({
        "runId": run.run_id,
        "clientId": run.client_id,
        "mode": run.mode,
        "status": run.status,
        "createdAt": run.created_at,
        "exportedAt": Utc::now(),
        "reviewState": run.review_state,
        "stages": run.stages.iter().map(|s| json!({
            "id": s.id,
            "label": s.label,
            "status": s.status,
            "message": s.message,
        })).collect::<Vec<_>>(),
        "artifacts": run.artifacts,
        "inputs": run.inputs,
    });

    let name = format!("{}.json", run.run_id);
    let path = dir.join(&name);
    let body = serde_json::to_vec_pretty(&summary).context("Failed to encode export summary")?;
    tokio::fs::write(&path, body)
        .await
        .with_context(|| format!("Failed to write export {}", path.display()))?;

    Ok(Artifact::new(name, ArtifactKind::Package, path.to_string_lossy(), StageId::Export))
}

#[async_trait]
impl StageExecutor for ExportExecutor {
    async fn execute(&self, ctx: &StageContext) -> anyhow::Result<StageReport> {
        if ctx.run.review_blocking() {
            ctx.info("Export held until the run is approved").await;
            return Ok(StageReport::skipped(HELD_FOR_REVIEW));
        }

        let artifact = write_export(&ctx.run, &ctx.settings.paths.output_root).await?;
        ctx.info(format!("Exported run summary to {}", artifact.path)).await;
        Ok(StageReport::completed()
            .message("Export package written")
            .artifacts(vec![artifact]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::studio::executors::StageOutcome;
    use crate::studio::executors::test_support::harness;
    use crate::studio::models::{ReviewState, ReviewStatus, RunMode};

    #[tokio::test]
    async fn test_skips_while_review_pending() {
        let mut h = harness(RunMode::Export, StageId::Export, json!({}));
        h.ctx.run.review_state = Some(ReviewState::new(true));
        let report = ExportExecutor.execute(&h.ctx).await.unwrap();
        assert_eq!(report.outcome, StageOutcome::Skipped);
        assert_eq!(report.message.as_deref(), Some("Awaiting human review"));
        assert!(report.artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_writes_package_when_not_blocked() {
        let mut h = harness(RunMode::Export, StageId::Export, json!({}));
        let mut review = ReviewState::new(true);
        review.status = ReviewStatus::Approved;
        h.ctx.run.review_state = Some(review);
        let report = ExportExecutor.execute(&h.ctx).await.unwrap();
        assert_eq!(report.outcome, StageOutcome::Completed);
        let artifact = &report.artifacts[0];
        assert_eq!(artifact.kind, ArtifactKind::Package);
        assert!(artifact.path.ends_with(&format!("client_acme/exports/{}.json", h.ctx.run.run_id)));
        let summary: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&artifact.path).unwrap()).unwrap();
        assert_eq!(summary["clientId"], "client_acme");
        assert_eq!(summary["stages"].as_array().unwrap().len(), 2);
    }
}
