//! Editing strategies that turn one instruction into file mutations.
//!
//! Supports a single-shot whole-file rewrite ([`SimpleModification`]) and a
//! bounded tool-calling agent loop ([`ExplorativeModification`]).

mod explorative;
mod simple;

pub use explorative::{AgentReply, AgentState, ExplorativeModification};
pub use simple::SimpleModification;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::digest::ProjectDigest;
use crate::error::{Error, Result};
use crate::llm::{complete_with_timeout, Completion, LlmClient, Message, Usage};
use crate::parser::ResponseParser;
use crate::sandbox::SandboxLayout;
use crate::tools::{PathResolver, ToolExecutor};

/// Identifier of a workflow in the closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowName {
    SimpleModification,
    ExplorativeModification,
}

impl WorkflowName {
    pub const ALL: [WorkflowName; 2] = [
        WorkflowName::SimpleModification,
        WorkflowName::ExplorativeModification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowName::SimpleModification => "simple_modification",
            WorkflowName::ExplorativeModification => "explorative_modification",
        }
    }

    /// One-line description shown to the router.
    pub fn description(&self) -> &'static str {
        match self {
            WorkflowName::SimpleModification => {
                "Rewrites a few already-identifiable files in one pass. Best for small, \
                 localized changes such as text, colors, styles or a single prop."
            }
            WorkflowName::ExplorativeModification => {
                "Explores the code with search, read and edit tools over several steps. \
                 Best for changes spanning multiple files, new features or unclear locations."
            }
        }
    }

    pub fn complexity(&self) -> &'static str {
        match self {
            WorkflowName::SimpleModification => "low",
            WorkflowName::ExplorativeModification => "high",
        }
    }
}

impl fmt::Display for WorkflowName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let key: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .flat_map(char::to_lowercase)
            .collect();

        match key.as_str() {
            "simplemodification" | "simple" => Ok(WorkflowName::SimpleModification),
            "explorativemodification" | "explorative" | "exploratory" | "exploratorymodification" => {
                Ok(WorkflowName::ExplorativeModification)
            }
            _ => Err(Error::UnknownWorkflow(s.to_string())),
        }
    }
}

/// How a workflow run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowExit {
    /// The workflow applied its changes and finished normally.
    Completed,
    /// Nothing to do (no relevant files or an empty payload).
    NoOp,
    /// The agent replied without tool calls or a completion signal.
    NoToolCalls,
    /// The iteration cap was reached.
    IterationCap,
    /// A stop request interrupted the run.
    Cancelled,
}

/// Input to a workflow run.
#[derive(Debug, Clone)]
pub struct EditRequest {
    /// Current instruction.
    pub instruction: String,
    /// Prior instructions of the session, oldest first.
    pub history: Vec<String>,
    /// Digest of the current sandbox state.
    pub digest: ProjectDigest,
    /// Pre-concatenated file contents, if the caller already has them.
    pub file_contents: Option<String>,
}

impl EditRequest {
    pub fn new(instruction: impl Into<String>, history: Vec<String>, digest: ProjectDigest) -> Self {
        Self {
            instruction: instruction.into(),
            history,
            digest,
            file_contents: None,
        }
    }

    /// Prior instructions rendered for a prompt, empty when there are none.
    pub fn history_block(&self) -> String {
        if self.history.is_empty() {
            return String::new();
        }
        let mut block = String::from("Previous instructions in this session (oldest first):\n");
        for (i, instruction) in self.history.iter().enumerate() {
            block.push_str(&format!("{}. {}\n", i + 1, instruction));
        }
        block.push('\n');
        block
    }
}

/// Output of a workflow run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    /// Relative paths written during the run, in write order.
    pub changed_files: Vec<String>,
    /// Last raw model output.
    pub raw_output: String,
    /// Token usage across all calls of the run.
    pub usage: Usage,
    /// Number of model calls made.
    pub model_calls: u32,
    pub exit: WorkflowExit,
}

impl WorkflowResult {
    pub(crate) fn new(exit: WorkflowExit) -> Self {
        Self {
            changed_files: Vec::new(),
            raw_output: String::new(),
            usage: Usage::default(),
            model_calls: 0,
            exit,
        }
    }

    pub(crate) fn record_change(&mut self, path: String) {
        if !self.changed_files.contains(&path) {
            self.changed_files.push(path);
        }
    }
}

/// Everything a workflow needs from the session for one turn.
pub struct WorkflowContext<'a> {
    pub session_id: &'a str,
    pub llm: &'a dyn LlmClient,
    pub config: &'a Config,
    pub parser: ResponseParser,
    /// Directory tools and writes are confined to.
    pub source_root: &'a Path,
    /// Sandbox working copy (accepted as an absolute path prefix).
    pub workspace: &'a Path,
    pub layout: &'a SandboxLayout,
    pub cancel: &'a AtomicBool,
}

impl WorkflowContext<'_> {
    /// Builds a path resolver for the source root.
    pub fn resolver(&self) -> Result<PathResolver> {
        Ok(PathResolver::new(self.source_root)?
            .with_redundant_prefix(self.layout.source_dir.clone())
            .with_known_prefix(self.workspace))
    }

    /// Builds a tool executor for the source root.
    pub fn executor(&self) -> Result<ToolExecutor> {
        let mut ignore = self.layout.ignore.clone();
        ignore.push(self.layout.dependency_dir.clone());
        Ok(ToolExecutor::new(self.resolver()?, ignore)
            .with_grep_max_output(self.config.agent.grep_max_output_chars))
    }

    /// One model call bounded by the configured timeout.
    pub async fn complete(&self, messages: &[Message]) -> Result<Completion> {
        complete_with_timeout(
            self.llm,
            messages,
            self.config.llm.max_tokens,
            self.config.llm.request_timeout(),
        )
        .await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// An interchangeable editing strategy.
#[async_trait]
pub trait Workflow: Send + Sync {
    /// Identifier of this workflow.
    fn name(&self) -> WorkflowName;

    /// Runs the workflow against the sandbox in `ctx`.
    ///
    /// Edits are applied as they are produced; an error leaves every edit
    /// made before it in place.
    async fn run(&self, ctx: &WorkflowContext<'_>, request: &EditRequest) -> Result<WorkflowResult>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_names_parse_leniently() {
        for raw in ["simple_modification", "Simple", "SimpleModification", "simple-modification"] {
            assert_eq!(raw.parse::<WorkflowName>().unwrap(), WorkflowName::SimpleModification);
        }
        for raw in ["explorative_modification", "exploratory", "Explorative"] {
            assert_eq!(
                raw.parse::<WorkflowName>().unwrap(),
                WorkflowName::ExplorativeModification
            );
        }
        assert!(matches!(
            "refactor_everything".parse::<WorkflowName>(),
            Err(Error::UnknownWorkflow(_))
        ));
    }

    #[test]
    fn workflow_name_round_trips_through_serde() {
        let json = serde_json::to_string(&WorkflowName::ExplorativeModification).unwrap();
        assert_eq!(json, "\"explorative_modification\"");
        assert_eq!(WorkflowName::SimpleModification.to_string(), "simple_modification");
    }

    #[test]
    fn history_block_is_numbered_oldest_first() {
        let request = EditRequest {
            instruction: "change it back".to_string(),
            history: vec!["make the button blue".to_string(), "add a border".to_string()],
            digest: test_support::Fixture::new().request("x", &[]).digest,
            file_contents: None,
        };

        let block = request.history_block();
        assert!(block.starts_with("Previous instructions"));
        assert!(block.contains("1. make the button blue\n2. add a border\n"));
    }

    #[test]
    fn record_change_deduplicates() {
        let mut result = WorkflowResult::new(WorkflowExit::Completed);
        result.record_change("App.jsx".into());
        result.record_change("App.jsx".into());
        assert_eq!(result.changed_files, vec!["App.jsx"]);
    }
}
