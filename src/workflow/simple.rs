//! Whole-file rewrite workflow.
//!
//! Two self-contained model calls: pick the relevant files from the digest,
//! then rewrite them. Each returned file is overwritten verbatim.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Result, ToolError};
use crate::llm::Message;
use crate::tools::PathResolver;

use super::{EditRequest, Workflow, WorkflowContext, WorkflowExit, WorkflowName, WorkflowResult};

/// Upper bound on files inlined into the rewrite prompt.
const MAX_SELECTED_FILES: usize = 8;

const SELECT_SYSTEM_PROMPT: &str = "You select which files of a web project must change to carry out an instruction. \
Reply with a JSON array of file paths copied from the project listing, most relevant first. \
Reply with [] if no file needs to change. Do not explain.";

const REWRITE_SYSTEM_PROMPT: &str = "You modify source files. Make the smallest change that carries out the instruction \
and keep everything else byte-for-byte identical. Reply with one JSON object mapping each changed file path to its \
complete new contents. Omit files you did not change. Do not explain.";

#[derive(Deserialize)]
#[serde(untagged)]
enum FileSelection {
    Wrapped { files: Vec<String> },
    List(Vec<String>),
}

impl FileSelection {
    fn into_paths(self) -> Vec<String> {
        match self {
            FileSelection::Wrapped { files } | FileSelection::List(files) => files,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RewritePayload {
    Wrapped { files: BTreeMap<String, String> },
    Bare(BTreeMap<String, String>),
}

impl RewritePayload {
    fn into_files(self) -> BTreeMap<String, String> {
        match self {
            RewritePayload::Wrapped { files } | RewritePayload::Bare(files) => files,
        }
    }
}

/// Single-pass workflow for small, localized edits.
#[derive(Debug, Default, Clone)]
pub struct SimpleModification;

impl SimpleModification {
    pub fn new() -> Self {
        Self
    }

    /// Resolves model-chosen paths to existing files, dropping the rest.
    fn resolve_selection(resolver: &PathResolver, paths: Vec<String>) -> Vec<String> {
        let mut resolved = Vec::new();
        for raw in paths {
            match resolver.resolve(&raw) {
                Ok(path) if path.is_file() => {
                    let display = resolver.display(&path);
                    if !resolved.contains(&display) {
                        resolved.push(display);
                    }
                }
                Ok(_) => tracing::debug!(path = %raw, "dropping unresolvable file selection"),
                Err(ToolError::PathEscape(_)) => {
                    tracing::warn!(security = true, path = %raw, "selected path escapes sandbox")
                }
                Err(e) => tracing::debug!(path = %raw, error = %e, "dropping file selection"),
            }
            if resolved.len() == MAX_SELECTED_FILES {
                break;
            }
        }
        resolved
    }

    async fn concatenate(resolver: &PathResolver, files: &[String]) -> Result<String> {
        let mut out = String::new();
        for rel in files {
            let contents = tokio::fs::read_to_string(resolver.root().join(rel)).await?;
            out.push_str(&format!("=== FILE: {} ===\n", rel));
            out.push_str(&contents);
            if !contents.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("=== END FILE ===\n\n");
        }
        Ok(out)
    }

    fn cancelled(ctx: &WorkflowContext<'_>, stage: &str) -> bool {
        let cancelled = ctx.is_cancelled();
        if cancelled {
            tracing::info!(session_id = %ctx.session_id, stage, "rewrite cancelled");
        }
        cancelled
    }
}

#[async_trait]
impl Workflow for SimpleModification {
    fn name(&self) -> WorkflowName {
        WorkflowName::SimpleModification
    }

    async fn run(&self, ctx: &WorkflowContext<'_>, request: &EditRequest) -> Result<WorkflowResult> {
        let resolver = ctx.resolver()?;
        let mut result = WorkflowResult::new(WorkflowExit::NoOp);
        let history = request.history_block();

        let contents = match &request.file_contents {
            Some(contents) => contents.clone(),
            None => {
                if Self::cancelled(ctx, "select") {
                    result.exit = WorkflowExit::Cancelled;
                    return Ok(result);
                }
                let messages = [
                    Message::system(SELECT_SYSTEM_PROMPT),
                    Message::user(format!(
                        "{}Instruction: {}\n\nProject files:\n{}",
                        history,
                        request.instruction,
                        request.digest.render()
                    )),
                ];
                let completion = ctx.complete(&messages).await?;
                result.usage += completion.usage;
                result.model_calls += 1;

                let selection: FileSelection = ctx.parser.parse(&completion.text)?;
                result.raw_output = completion.text;
                let files = Self::resolve_selection(&resolver, selection.into_paths());

                tracing::info!(
                    session_id = %ctx.session_id,
                    files = ?files,
                    "selected files for rewrite"
                );
                if files.is_empty() {
                    return Ok(result);
                }
                Self::concatenate(&resolver, &files).await?
            }
        };

        if Self::cancelled(ctx, "rewrite") {
            result.exit = WorkflowExit::Cancelled;
            return Ok(result);
        }
        let messages = [
            Message::system(REWRITE_SYSTEM_PROMPT),
            Message::user(format!(
                "{}Instruction: {}\n\nFiles:\n{}",
                history, request.instruction, contents
            )),
        ];
        let completion = ctx.complete(&messages).await?;
        result.usage += completion.usage;
        result.model_calls += 1;

        let payload: RewritePayload = ctx.parser.parse(&completion.text)?;
        result.raw_output = completion.text;

        for (raw_path, new_contents) in payload.into_files() {
            let path = match resolver.resolve(&raw_path) {
                Ok(path) => path,
                Err(ToolError::PathEscape(_)) => {
                    tracing::warn!(security = true, path = %raw_path, "rewrite target escapes sandbox");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(path = %raw_path, error = %e, "skipping rewrite target");
                    continue;
                }
            };
            if path.is_dir() {
                tracing::warn!(path = %raw_path, "skipping rewrite target that is a directory");
                continue;
            }

            let unchanged = tokio::fs::read_to_string(&path)
                .await
                .map(|current| current == new_contents)
                .unwrap_or(false);
            if unchanged {
                continue;
            }

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &new_contents).await?;
            let shown = resolver.display(&path);
            tracing::debug!(path = %shown, "rewrote file");
            result.record_change(shown);
        }

        if !result.changed_files.is_empty() {
            result.exit = WorkflowExit::Completed;
        }
        Ok(result)
    }
}
