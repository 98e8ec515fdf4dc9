//! The single place that decides between real tool output and simulated
//! demo output.

use super::StageContext;
use crate::config::FallbackPolicy;
use crate::studio::models::LogLevel;
use crate::studio::process::{ProcessOutcome, ProcessSpec};

/// A tool the executor wants to run, or the reason it cannot.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    /// Name used in log lines.
    pub name: String,
    pub spec: Result<ProcessSpec, String>,
}

impl ToolInvocation {
    pub fn ready(name: impl Into<String>, spec: ProcessSpec) -> Self {
        Self {
            name: name.into(),
            spec: Ok(spec),
        }
    }

    pub fn absent(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            spec: Err(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolResult {
    /// The tool ran and exited zero.
    Ran(ProcessOutcome),
    /// Demo output was emitted in place of the tool.
    Simulated,
    /// The stage must fail with this message.
    Failed(String),
    Canceled,
}

enum Trouble {
    Absent(String),
    Failed(String),
}

/// Run `invocation`, falling back to `demo_script` according to the
/// configured policy.
///
/// | Policy       | absent    | exited non-zero |
/// |--------------|-----------|-----------------|
/// | `on_missing` | simulate  | fail            |
/// | `always`     | simulate  | simulate        |
/// | `never`      | fail      | fail            |
pub async fn execute_with_fallback(
    ctx: &StageContext,
    invocation: &ToolInvocation,
    demo_script: &[String],
) -> ToolResult {
    let trouble = match &invocation.spec {
        Err(reason) => Trouble::Absent(reason.clone()),
        Ok(spec) => {
            ctx.info(format!("Running {}", invocation.name)).await;
            let outcome = ctx
                .settings
                .runner
                .run(spec, ctx.logger.as_ref(), &ctx.cancel)
                .await;
            if outcome.canceled {
                return ToolResult::Canceled;
            }
            if outcome.ok {
                return ToolResult::Ran(outcome);
            }
            if outcome.spawn_failed {
                Trouble::Absent("could not be started".to_string())
            } else {
                Trouble::Failed(match outcome.exit_code {
                    Some(code) => format!("exited with code {}", code),
                    None => "terminated by signal".to_string(),
                })
            }
        }
    };

    let policy = ctx.settings.fallback;
    let reason = match (trouble, policy) {
        (Trouble::Absent(reason), FallbackPolicy::OnMissing | FallbackPolicy::Always) => reason,
        (Trouble::Failed(reason), FallbackPolicy::Always) => reason,
        (Trouble::Absent(reason), FallbackPolicy::Never) => {
            let message = format!("{} unavailable ({})", invocation.name, reason);
            ctx.log(LogLevel::Error, format!("{}; fallback disabled", message))
                .await;
            return ToolResult::Failed(message);
        }
        (Trouble::Failed(reason), FallbackPolicy::OnMissing | FallbackPolicy::Never) => {
            let message = format!("{} {}", invocation.name, reason);
            ctx.log(LogLevel::Error, message.clone()).await;
            return ToolResult::Failed(message);
        }
    };

    tracing::warn!(
        run_id = %ctx.run.run_id,
        stage = ctx.stage.label,
        tool = %invocation.name,
        %reason,
        "falling back to simulated output"
    );
    ctx.warn(format!(
        "[DEMO] {} unavailable ({}); using simulated output",
        invocation.name, reason
    ))
    .await;
    for line in demo_script {
        if ctx.cancel.is_cancelled() {
            return ToolResult::Canceled;
        }
        ctx.info(format!("[DEMO] {}", line)).await;
    }
    ToolResult::Simulated
}
