use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;

use super::{StageContext, StageExecutor, StageReport, ToolInvocation, ToolResult, execute_with_fallback};
use crate::studio::models::{Artifact, ArtifactKind, RunMode, StageId};

/// Produces image and/or video media from the run's prompt.
pub struct GenerateExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Media {
    Image,
    Video,
}

impl Media {
    pub fn as_str(&self) -> &'static str {
        match self {
            Media::Image => "image",
            Media::Video => "video",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            Media::Image => "png",
            Media::Video => "mp4",
        }
    }

    fn kind(&self) -> ArtifactKind {
        match self {
            Media::Image => ArtifactKind::Image,
            Media::Video => ArtifactKind::Video,
        }
    }
}

impl GenerateExecutor {
    pub fn prompt(ctx: &StageContext) -> String {
        ctx.run
            .input_str("prompt")
            .map(str::to_string)
            .unwrap_or_else(|| format!("Brand lifestyle hero image for {}", ctx.client.name))
    }

    /// Media to produce, in order. `inputs.media` overrides the mode default.
    pub fn media(ctx: &StageContext) -> Vec<Media> {
        let requested: Vec<Media> = ctx
            .run
            .inputs
            .get("media")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| match v.as_str()?.trim().to_lowercase().as_str() {
                        "image" => Some(Media::Image),
                        "video" => Some(Media::Video),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        if !requested.is_empty() {
            return requested;
        }
        match ctx.run.mode {
            RunMode::Video => vec![Media::Video],
            RunMode::Full => vec![Media::Image, Media::Video],
            _ => vec![Media::Image],
        }
    }

    fn demo_script(media: Media, prompt: &str) -> Vec<String> {
        vec![
            format!("Generating {} for prompt: {}", media.as_str(), prompt),
            format!("Wrote placeholder {}", media.as_str()),
        ]
    }

    async fn write_placeholder(path: &Path, media: Media, prompt: &str) -> anyhow::Result<()> {
        let body = format!(
            "Placeholder {}\nPrompt: {}\nGenerated: {}\n",
            media.as_str(),
            prompt,
            Utc::now().to_rfc3339()
        );
        tokio::fs::write(path, body)
            .await
            .with_context(|| format!("Failed to write placeholder {}", path.display()))
    }
}

#[async_trait]
impl StageExecutor for GenerateExecutor {
    async fn execute(&self, ctx: &StageContext) -> anyhow::Result<StageReport> {
        let prompt = Self::prompt(ctx);
        let out_dir = ctx.client_output_dir().join("generated");
        tokio::fs::create_dir_all(&out_dir)
            .await
            .with_context(|| format!("Failed to create output directory {}", out_dir.display()))?;

        ctx.info(format!("Prompt: {}", prompt)).await;

        let mut artifacts = Vec::new();
        let mut simulated = false;
        for media in Self::media(ctx) {
            let file_name = format!("{}_{}.{}", ctx.run.run_id, media.as_str(), media.extension());
            let output: PathBuf = out_dir.join(&file_name);

            let invocation = match ctx.settings.tools.generate.as_ref() {
                Some(tool) => ToolInvocation::ready(
                    tool.display_name(),
                    ctx.tool_spec(
                        tool,
                        &[
                            ("media", media.as_str().to_string()),
                            ("prompt", prompt.clone()),
                            ("output", output.to_string_lossy().into_owned()),
                        ],
                    ),
                ),
                None => ToolInvocation::absent("generate", "no generation tool configured"),
            };

            match execute_with_fallback(ctx, &invocation, &Self::demo_script(media, &prompt)).await {
                ToolResult::Ran(_) => {
                    if output.exists() {
                        ctx.info(format!("Generated {}", file_name)).await;
                        artifacts.push(Artifact::new(
                            file_name,
                            media.kind(),
                            output.to_string_lossy(),
                            StageId::Generate,
                        ));
                    } else {
                        ctx.warn(format!(
                            "{} exited cleanly but produced no {}",
                            invocation.name,
                            media.as_str()
                        ))
                        .await;
                    }
                }
                ToolResult::Simulated => {
                    simulated = true;
                    let placeholder = output.with_extension("txt");
                    Self::write_placeholder(&placeholder, media, &prompt).await?;
                    let name = placeholder
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or(file_name);
                    artifacts.push(Artifact::new(
                        name,
                        media.kind(),
                        placeholder.to_string_lossy(),
                        StageId::Generate,
                    ));
                }
                ToolResult::Failed(message) => {
                    return Ok(StageReport::failed(message).artifacts(artifacts));
                }
                ToolResult::Canceled => return Ok(StageReport::canceled().artifacts(artifacts)),
            }
        }

        let message = match (artifacts.len(), simulated) {
            (0, _) => "No media produced".to_string(),
            (n, true) => format!("Generated {} placeholder file(s)", n),
            (n, false) => format!("Generated {} file(s)", n),
        };
        Ok(StageReport::completed().message(message).artifacts(artifacts))
    }
}
