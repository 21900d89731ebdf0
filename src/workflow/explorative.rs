//! Tool-calling agent loop.
//!
//! The model is shown the capability set and drives the sandbox through it,
//! one batch of tool calls per iteration, until it signals completion, stops
//! asking for tools, or hits the iteration cap.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;
use crate::error::Result;
use crate::llm::Message;
use crate::tools::{describe_tools, RawToolCall, ToolCall, ToolExecutor};

use super::{EditRequest, Workflow, WorkflowContext, WorkflowExit, WorkflowName, WorkflowResult};

/// A parsed agent turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    #[serde(default)]
    pub thought: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<RawToolCall>,
    /// Set when the instruction has been carried out.
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// States of the agent loop.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentState {
    /// Waiting on the model.
    Thinking,
    /// Executing the requested calls in order.
    ToolDispatch {
        calls: Vec<RawToolCall>,
        finish: bool,
    },
    /// Feeding results back into the transcript.
    Observing {
        observations: Vec<String>,
        finish: bool,
    },
    Terminal(WorkflowExit),
}

#[derive(Debug, Default)]
struct ToolStat {
    calls: u32,
    failures: u32,
    elapsed: Duration,
}

/// Per-tool counters for the end-of-loop summary.
#[derive(Debug, Default)]
struct ToolStats(BTreeMap<String, ToolStat>);

impl ToolStats {
    fn record(&mut self, tool: &str, elapsed: Duration, ok: bool) {
        let stat = self.0.entry(tool.to_string()).or_default();
        stat.calls += 1;
        stat.elapsed += elapsed;
        if !ok {
            stat.failures += 1;
        }
    }

    fn log(&self, session_id: &str) {
        for (tool, stat) in &self.0 {
            tracing::info!(
                session_id = %session_id,
                tool = %tool,
                calls = stat.calls,
                failures = stat.failures,
                elapsed_ms = stat.elapsed.as_millis() as u64,
                "tool usage"
            );
        }
    }
}

fn system_prompt() -> String {
    format!(
        r#"You are a coding agent editing a web project inside a sandbox.
All paths are relative to the project's source directory.

Tools:
{}

Reply with exactly one JSON object and nothing else:
{{"thought": "what you will do next", "tool_calls": [{{"tool": "grep_code", "parameters": {{"pattern": "Add Todo"}}}}]}}
When the instruction has been carried out, reply:
{{"done": true, "message": "one-sentence summary"}}

Rules:
- Locate code with grep_code or list_files, then read it with read_file_lines before editing.
- Copy old_str exactly from the file, without the line-number prefix.
- Make the smallest edit that carries out the instruction."#,
        describe_tools()
    )
}

/// Bounded agentic workflow for multi-file or exploratory edits.
#[derive(Debug, Clone)]
pub struct ExplorativeModification {
    max_iterations: u32,
}

impl Default for ExplorativeModification {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

impl ExplorativeModification {
    pub fn new(max_iterations: u32) -> Self {
        Self { max_iterations }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.max_iterations)
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    async fn drive(
        &self,
        ctx: &WorkflowContext<'_>,
        executor: &ToolExecutor,
        transcript: &mut Vec<Message>,
        stats: &mut ToolStats,
    ) -> Result<WorkflowResult> {
        let mut result = WorkflowResult::new(WorkflowExit::Completed);
        let mut iteration = 0u32;
        let mut state = AgentState::Thinking;

        let exit = loop {
            state = match state {
                AgentState::Thinking => {
                    if ctx.is_cancelled() {
                        tracing::info!(session_id = %ctx.session_id, iteration, "agent loop cancelled");
                        AgentState::Terminal(WorkflowExit::Cancelled)
                    } else if iteration >= self.max_iterations {
                        tracing::warn!(
                            session_id = %ctx.session_id,
                            max_iterations = self.max_iterations,
                            "agent loop reached iteration cap"
                        );
                        AgentState::Terminal(WorkflowExit::IterationCap)
                    } else {
                        iteration += 1;
                        let completion = ctx.complete(transcript).await?;
                        result.usage += completion.usage;
                        result.model_calls += 1;
                        transcript.push(Message::assistant(completion.text.clone()));

                        let reply: AgentReply = ctx.parser.parse(&completion.text)?;
                        result.raw_output = completion.text;

                        tracing::debug!(
                            session_id = %ctx.session_id,
                            iteration,
                            thought = reply.thought.as_deref().unwrap_or(""),
                            tool_calls = reply.tool_calls.len(),
                            done = reply.done,
                            "agent reply"
                        );

                        match (reply.tool_calls.is_empty(), reply.done) {
                            (true, true) => AgentState::Terminal(WorkflowExit::Completed),
                            (true, false) => AgentState::Terminal(WorkflowExit::NoToolCalls),
                            (false, finish) => AgentState::ToolDispatch {
                                calls: reply.tool_calls,
                                finish,
                            },
                        }
                    }
                }
                AgentState::ToolDispatch { calls, finish } => {
                    let mut observations = Vec::with_capacity(calls.len());
                    for raw in &calls {
                        observations.push(dispatch(ctx, executor, raw, &mut result, stats).await);
                    }
                    AgentState::Observing {
                        observations,
                        finish,
                    }
                }
                AgentState::Observing {
                    observations,
                    finish,
                } => {
                    transcript.push(Message::user(observations.join("\n\n")));
                    if finish {
                        AgentState::Terminal(WorkflowExit::Completed)
                    } else {
                        AgentState::Thinking
                    }
                }
                AgentState::Terminal(exit) => break exit,
            };
        };

        result.exit = exit;
        tracing::info!(
            session_id = %ctx.session_id,
            iterations = iteration,
            exit = ?exit,
            changed_files = result.changed_files.len(),
            "agent loop finished"
        );
        Ok(result)
    }
}

/// Runs one raw call and renders the observation fed back to the model.
async fn dispatch(
    ctx: &WorkflowContext<'_>,
    executor: &ToolExecutor,
    raw: &RawToolCall,
    result: &mut WorkflowResult,
    stats: &mut ToolStats,
) -> String {
    let started = Instant::now();
    let outcome = match ToolCall::from_raw(raw) {
        Ok(call) => executor.execute(&call).await,
        Err(e) => Err(e),
    };
    stats.record(&raw.tool, started.elapsed(), outcome.is_ok());

    match outcome {
        Ok(outcome) => {
            if let Some(path) = outcome.modified {
                result.record_change(path);
            }
            format!("[{}] RESULT:\n{}", raw.tool, outcome.output)
        }
        Err(e) => {
            if e.is_security_event() {
                tracing::warn!(
                    security = true,
                    session_id = %ctx.session_id,
                    tool = %raw.tool,
                    error = %e,
                    "rejected tool call"
                );
            } else {
                tracing::debug!(tool = %raw.tool, error = %e, "tool call failed");
            }
            format!("[{}] ERROR: {}", raw.tool, e)
        }
    }
}

async fn dump_transcript(dir: &Path, session_id: &str, transcript: &[Message]) {
    let file = dir.join(format!(
        "{}-{}.json",
        session_id,
        chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f")
    ));

    let json = match serde_json::to_string_pretty(transcript) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize transcript");
            return;
        }
    };

    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        tracing::warn!(dir = %dir.display(), error = %e, "failed to create transcript dir");
        return;
    }
    match tokio::fs::write(&file, json).await {
        Ok(()) => tracing::debug!(path = %file.display(), "wrote agent transcript"),
        Err(e) => tracing::warn!(path = %file.display(), error = %e, "failed to write transcript"),
    }
}

#[async_trait]
impl Workflow for ExplorativeModification {
    fn name(&self) -> WorkflowName {
        WorkflowName::ExplorativeModification
    }

    async fn run(&self, ctx: &WorkflowContext<'_>, request: &EditRequest) -> Result<WorkflowResult> {
        let executor = ctx.executor()?;
        let mut transcript = vec![
            Message::system(system_prompt()),
            Message::user(format!(
                "{}Instruction: {}\n\nProject files:\n{}",
                request.history_block(),
                request.instruction,
                request.digest.render_simple()
            )),
        ];
        let mut stats = ToolStats::default();

        let outcome = self.drive(ctx, &executor, &mut transcript, &mut stats).await;

        stats.log(ctx.session_id);
        if let Some(dir) = &ctx.config.logging.transcript_dir {
            dump_transcript(dir, ctx.session_id, &transcript).await;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::llm::{MockClient, MockReply, Role};
    use crate::workflow::test_support::Fixture;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn call(tool: &str, parameters: serde_json::Value) -> String {
        json!({"thought": "next step", "tool_calls": [{"tool": tool, "parameters": parameters}]})
            .to_string()
    }

    fn done() -> String {
        json!({"done": true, "message": "finished"}).to_string()
    }

    fn observations(llm: &MockClient, request: usize) -> String {
        let messages = &llm.requests()[request];
        let last = messages.last().unwrap();
        assert_eq!(last.role, Role::User);
        last.content.clone()
    }

    #[tokio::test]
    async fn search_read_edit_then_done() {
        let fixture = Fixture::new();
        let src = fixture.src();
        let llm = MockClient::new("mock").with_replies([
            call("grep_code", json!({"pattern": "Add Todo"})),
            call(
                "read_file_lines",
                json!({"file_path": "./src/components/TodoForm.jsx", "start_line": 4, "end_line": 4}),
            ),
            call(
                "apply_edit",
                json!({
                    "file_path": "src/components/TodoForm.jsx",
                    "old_str": "backgroundColor: 'green'",
                    "new_str": "backgroundColor: 'blue'"
                }),
            ),
            done(),
        ]);

        let result = ExplorativeModification::new(25)
            .run(&fixture.context(&llm, &src), &fixture.request("make Add Todo blue", &[]))
            .await
            .unwrap();

        assert_eq!(result.exit, WorkflowExit::Completed);
        assert_eq!(result.model_calls, 4);
        assert_eq!(result.changed_files, vec!["components/TodoForm.jsx"]);
        assert!(fixture.read("components/TodoForm.jsx").contains("'blue'"));

        assert!(observations(&llm, 1).contains("components/TodoForm.jsx:4:"));
        assert!(observations(&llm, 2).contains("   4 | "));
        assert!(observations(&llm, 3).starts_with("[apply_edit] RESULT:"));
    }

    #[tokio::test]
    async fn halts_at_exactly_the_iteration_cap() {
        let fixture = Fixture::new();
        let src = fixture.src();
        let llm = MockClient::new("mock")
            .with_responder(|_| MockReply::Text(call("list_files", json!({"directory": "."}))));

        let result = ExplorativeModification::new(3)
            .run(&fixture.context(&llm, &src), &fixture.request("loop forever", &[]))
            .await
            .unwrap();

        assert_eq!(result.exit, WorkflowExit::IterationCap);
        assert_eq!(result.model_calls, 3);
        assert_eq!(llm.call_count(), 3);
        assert!(result.changed_files.is_empty());
    }

    #[tokio::test]
    async fn path_escape_becomes_error_observation() {
        let fixture = Fixture::new();
        let src = fixture.src();
        let llm = MockClient::new("mock").with_replies([
            call(
                "apply_edit",
                json!({"file_path": "../../escape.js", "old_str": "", "new_str": "x"}),
            ),
            done(),
        ]);

        let result = ExplorativeModification::new(25)
            .run(&fixture.context(&llm, &src), &fixture.request("escape", &[]))
            .await
            .unwrap();

        assert_eq!(result.exit, WorkflowExit::Completed);
        assert!(result.changed_files.is_empty());
        assert!(observations(&llm, 1).contains("ERROR: path escapes sandbox root"));
        assert!(!fixture.dir.path().join("escape.js").exists());
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_and_loop_continues() {
        let fixture = Fixture::new();
        let src = fixture.src();
        let llm = MockClient::new("mock")
            .with_replies([call("run_shell", json!({"cmd": "ls"})), done()]);

        let result = ExplorativeModification::new(25)
            .run(&fixture.context(&llm, &src), &fixture.request("x", &[]))
            .await
            .unwrap();

        assert_eq!(result.model_calls, 2);
        assert!(observations(&llm, 1).contains("[run_shell] ERROR: unknown tool"));
    }

    #[tokio::test]
    async fn reply_without_tool_calls_ends_loop() {
        let fixture = Fixture::new();
        let src = fixture.src();
        let llm = MockClient::new("mock").with_reply(r#"{"thought": "nothing to do"}"#);

        let result = ExplorativeModification::new(25)
            .run(&fixture.context(&llm, &src), &fixture.request("x", &[]))
            .await
            .unwrap();

        assert_eq!(result.exit, WorkflowExit::NoToolCalls);
    }

    #[tokio::test]
    async fn cancelled_before_first_call() {
        let fixture = Fixture::new();
        let src = fixture.src();
        fixture.cancel.store(true, Ordering::SeqCst);
        let llm = MockClient::new("mock");

        let result = ExplorativeModification::new(25)
            .run(&fixture.context(&llm, &src), &fixture.request("x", &[]))
            .await
            .unwrap();

        assert_eq!(result.exit, WorkflowExit::Cancelled);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn parse_failure_keeps_prior_edits() {
        let fixture = Fixture::new();
        let src = fixture.src();
        let llm = MockClient::new("mock").with_replies([
            call(
                "apply_edit",
                json!({
                    "file_path": "components/TodoForm.jsx",
                    "old_str": "'green'",
                    "new_str": "'blue'"
                }),
            ),
            "All done, the button is blue now!".to_string(),
        ]);

        let result = ExplorativeModification::new(25)
            .run(&fixture.context(&llm, &src), &fixture.request("blue", &[]))
            .await;

        assert!(matches!(result, Err(Error::ResponseFormat { .. })));
        assert!(fixture.read("components/TodoForm.jsx").contains("'blue'"));
    }

    #[tokio::test]
    async fn done_with_calls_executes_them_first() {
        let fixture = Fixture::new();
        let src = fixture.src();
        let reply = json!({
            "done": true,
            "tool_calls": [{
                "tool": "apply_edit",
                "parameters": {"file_path": "index.css", "old_str": "margin: 0", "new_str": "margin: 4px"}
            }]
        })
        .to_string();
        let llm = MockClient::new("mock").with_reply(reply);

        let result = ExplorativeModification::new(25)
            .run(&fixture.context(&llm, &src), &fixture.request("margin", &[]))
            .await
            .unwrap();

        assert_eq!(result.exit, WorkflowExit::Completed);
        assert_eq!(llm.call_count(), 1);
        assert!(fixture.read("index.css").contains("margin: 4px"));
    }

    #[tokio::test]
    async fn transcript_is_dumped_when_configured() {
        let mut fixture = Fixture::new();
        let dump_dir = fixture.dir.path().join("transcripts");
        fixture.config.logging.transcript_dir = Some(dump_dir.clone());
        let src = fixture.src();
        let llm = MockClient::new("mock").with_reply(done());

        ExplorativeModification::new(25)
            .run(&fixture.context(&llm, &src), &fixture.request("x", &[]))
            .await
            .unwrap();

        let entries: Vec<_> = std::fs::read_dir(&dump_dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
