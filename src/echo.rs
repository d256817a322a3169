//! Offline agents and tools for the CLI: every configured profile becomes an
//! echo agent that streams a short summary of what it was asked to do.

use std::path::PathBuf;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};

use hivemind_core::error::{HivemindError, Result};
use hivemind_core::frame::{ControlFrame, ControlType, Frame, TokenFrame};
use hivemind_core::traits::{AgentRuntime, Tool};
use hivemind_core::types::{StepContext, ToolOutcome};

pub struct EchoAgent {
    id: String,
    role: String,
    /// Save each result through the `file_write` tool.
    save_output: bool,
}

impl EchoAgent {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            save_output: false,
        }
    }

    pub fn saving_output(mut self, save: bool) -> Self {
        self.save_output = save;
        self
    }

    fn reply(&self, ctx: &StepContext) -> String {
        let request = &ctx.request;
        let headline = request
            .task
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with("**"))
            .unwrap_or("(empty task)");
        let role = if self.role.is_empty() { "agent" } else { &self.role };
        match request.parent_result {
            Some(ref parent) => format!(
                "[{}] {} (building on {} chars of upstream output)",
                role,
                truncate(headline, 120),
                parent.len()
            ),
            None => format!("[{}] {}", role, truncate(headline, 120)),
        }
    }
}

impl AgentRuntime for EchoAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn stream(&self, ctx: StepContext) -> BoxStream<'_, Frame> {
        let reply = self.reply(&ctx);
        respond(self, ctx, reply)
            .into_stream()
            .flat_map(futures::stream::iter)
            .boxed()
    }
}

async fn respond(agent: &EchoAgent, ctx: StepContext, reply: String) -> Vec<Frame> {
    let exec = ctx.request.execution_id.clone();
    let words: Vec<&str> = reply.split_whitespace().collect();
    let mut frames: Vec<Frame> = words
        .iter()
        .enumerate()
        .map(|(i, word)| {
            let text = if i + 1 < words.len() {
                format!("{} ", word)
            } else {
                word.to_string()
            };
            let frame = TokenFrame::new(
                exec.clone(),
                &agent.id,
                ctx.request.first_sequence + i as u64,
                text,
            );
            if i + 1 == words.len() {
                frame.finalize().into()
            } else {
                frame.into()
            }
        })
        .collect();

    let mut result = reply.clone();
    if agent.save_output {
        if let Some(ref tools) = ctx.tools {
            let params = serde_json::json!({
                "path": format!("{}.md", agent.id),
                "content": reply,
            });
            match tools.invoke(&agent.id, "file_write", params).await {
                Ok(ToolOutcome::Executed(value)) => {
                    result.push_str(&format!("\n(saved: {})", value));
                }
                Ok(ToolOutcome::Refused { status, .. }) => {
                    result.push_str(&format!("\n(not saved: {})", status));
                }
                Err(e) => {
                    frames.push(ControlFrame::error(exec, &agent.id, e.to_string()).into());
                    return frames;
                }
            }
        }
    }

    frames.push(
        ControlFrame::new(exec, ControlType::AgentCompleted)
            .with_agent(&agent.id)
            .with_payload(serde_json::json!({ "result": result }))
            .into(),
    );
    frames
}

/// Writes agent output below a fixed directory. Gated by approval.
pub struct FileWriteTool {
    root: PathBuf,
}

impl FileWriteTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Tool for FileWriteTool {
    fn name(&self) -> &str {
        "file_write"
    }

    fn execute(&self, parameters: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let path = parameters["path"].as_str().unwrap_or_default();
            let content = parameters["content"].as_str().unwrap_or_default();
            let file_name = std::path::Path::new(path)
                .file_name()
                .ok_or_else(|| HivemindError::ToolExecution {
                    tool: "file_write".into(),
                    message: format!("invalid path: {:?}", path),
                })?;

            tokio::fs::create_dir_all(&self.root).await?;
            let target = self.root.join(file_name);
            tokio::fs::write(&target, content).await?;
            Ok(serde_json::json!({
                "path": target.display().to_string(),
                "bytes": content.len(),
            }))
        })
    }

    fn timeout_secs(&self) -> u64 {
        10
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
