use async_trait::async_trait;

use super::{StageContext, StageExecutor, StageReport};

/// Decides whether the run needs a human sign-off. Never blocks; the engine
/// parks the run in `needs_review` once every stage has finished.
pub struct ReviewExecutor;

impl ReviewExecutor {
    pub fn required(ctx: &StageContext) -> bool {
        ctx.run.input_bool("requireReview").unwrap_or(false)
            || ctx.client.requires_review
            || ctx.run.review_state.as_ref().is_some_and(|r| r.required)
    }
}

#[async_trait]
impl StageExecutor for ReviewExecutor {
    async fn execute(&self, ctx: &StageContext) -> anyhow::Result<StageReport> {
        let required = Self::required(ctx);
        let message = if required {
            "Human review required"
        } else {
            "No human review required"
        };
        ctx.info(message).await;
        Ok(StageReport::completed().message(message).review_required(required))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::studio::executors::StageOutcome;
    use crate::studio::executors::test_support::harness;
    use crate::studio::models::{ReviewState, RunMode, StageId};
    use serde_json::json;

    #[tokio::test]
    async fn test_not_required_by_default() {
        let h = harness(RunMode::Export, StageId::Review, json!({}));
        let report = ReviewExecutor.execute(&h.ctx).await.unwrap();
        assert_eq!(report.outcome, StageOutcome::Completed);
        assert_eq!(report.review_required, Some(false));
    }

    #[tokio::test]
    async fn test_input_flag_requires_review() {
        let h = harness(RunMode::Export, StageId::Review, json!({"requireReview": true}));
        let report = ReviewExecutor.execute(&h.ctx).await.unwrap();
        assert_eq!(report.review_required, Some(true));
        assert_eq!(h.messages(), vec!["Human review required"]);
    }

    #[tokio::test]
    async fn test_client_flag_requires_review() {
        let mut h = harness(RunMode::Export, StageId::Review, json!({}));
        h.ctx.client.requires_review = true;
        assert!(ReviewExecutor::required(&h.ctx));
    }

    #[tokio::test]
    async fn test_earlier_request_is_kept() {
        let mut h = harness(RunMode::Full, StageId::Review, json!({}));
        h.ctx.run.review_state = Some(ReviewState::new(true));
        assert!(ReviewExecutor::required(&h.ctx));
    }
}
