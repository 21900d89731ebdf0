//! Instruction classifier that picks a workflow.
//!
//! One model call with a closed list of workflow identifiers. Any failure
//! (transport, timeout, unparseable or unknown answer) falls back to the
//! explorative workflow instead of aborting the turn.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::llm::{complete_with_timeout, LlmClient, Message, Usage};
use crate::parser::ResponseParser;
use crate::workflow::WorkflowName;

/// Workflow chosen when classification fails.
pub const FALLBACK_WORKFLOW: WorkflowName = WorkflowName::ExplorativeModification;

const ROUTER_MAX_TOKENS: u32 = 256;

/// Outcome of routing one instruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteDecision {
    pub workflow: WorkflowName,
    pub reason: String,
    /// True when the router could not classify and used the fallback.
    pub fallback: bool,
    /// True when the session pinned the workflow and no call was made.
    pub pinned: bool,
    pub usage: Usage,
}

impl RouteDecision {
    /// Decision for a session with a pinned workflow.
    pub fn pinned(workflow: WorkflowName) -> Self {
        Self {
            workflow,
            reason: "workflow pinned for this session".to_string(),
            fallback: false,
            pinned: true,
            usage: Usage::default(),
        }
    }

    fn fallback(reason: String, usage: Usage) -> Self {
        Self {
            workflow: FALLBACK_WORKFLOW,
            reason,
            fallback: true,
            pinned: false,
            usage,
        }
    }
}

#[derive(Deserialize)]
struct RawDecision {
    workflow: String,
    #[serde(default)]
    reason: String,
}

/// Routes instructions to workflows with a (typically cheaper) model.
pub struct Router {
    client: Arc<dyn LlmClient>,
    parser: ResponseParser,
    timeout: Duration,
}

impl Router {
    pub fn new(client: Arc<dyn LlmClient>, parser: ResponseParser, timeout: Duration) -> Self {
        Self {
            client,
            parser,
            timeout,
        }
    }

    fn system_prompt() -> String {
        let mut prompt = String::from(
            "You route code-change instructions for a web project to one of these workflows:\n\n",
        );
        for name in WorkflowName::ALL {
            prompt.push_str(&format!(
                "- {} (complexity: {}): {}\n",
                name,
                name.complexity(),
                name.description()
            ));
        }
        prompt.push_str(
            "\nExamples:\n\
             Instruction: Change the Add Todo button color to blue\n\
             {\"workflow\": \"simple_modification\", \"reason\": \"single style change in one component\"}\n\
             Instruction: Add due dates to todos, show them in the list and allow sorting by date\n\
             {\"workflow\": \"explorative_modification\", \"reason\": \"new feature touching state, form and list\"}\n\n\
             Reply with exactly one JSON object: {\"workflow\": \"<name>\", \"reason\": \"<one sentence>\"}",
        );
        prompt
    }

    /// Classifies `instruction`. Never fails.
    pub async fn classify(&self, instruction: &str, history: &[String]) -> RouteDecision {
        let mut user = String::new();
        if !history.is_empty() {
            user.push_str("Previous instructions (oldest first):\n");
            for (i, previous) in history.iter().enumerate() {
                user.push_str(&format!("{}. {}\n", i + 1, previous));
            }
            user.push('\n');
        }
        user.push_str(&format!("Instruction: {}", instruction));

        let messages = [Message::system(Self::system_prompt()), Message::user(user)];

        let completion = match complete_with_timeout(
            self.client.as_ref(),
            &messages,
            ROUTER_MAX_TOKENS,
            self.timeout,
        )
        .await
        {
            Ok(completion) => completion,
            Err(e) => {
                tracing::warn!(error = %e, fallback = %FALLBACK_WORKFLOW, "router call failed");
                return RouteDecision::fallback(format!("router call failed: {}", e), Usage::default());
            }
        };

        let raw: RawDecision = match self.parser.parse(&completion.text) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, fallback = %FALLBACK_WORKFLOW, "unparseable router decision");
                return RouteDecision::fallback(
                    format!("unparseable router decision: {}", e),
                    completion.usage,
                );
            }
        };

        match raw.workflow.parse::<WorkflowName>() {
            Ok(workflow) => {
                tracing::info!(workflow = %workflow, reason = %raw.reason, "routed instruction");
                RouteDecision {
                    workflow,
                    reason: raw.reason,
                    fallback: false,
                    pinned: false,
                    usage: completion.usage,
                }
            }
            Err(_) => {
                tracing::warn!(
                    workflow = %raw.workflow,
                    fallback = %FALLBACK_WORKFLOW,
                    "router returned unknown workflow"
                );
                RouteDecision::fallback(
                    format!("unknown workflow '{}'", raw.workflow),
                    completion.usage,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockClient, MockReply};

    fn router(client: MockClient) -> Router {
        Router::new(
            Arc::new(client),
            ResponseParser::default(),
            Duration::from_secs(5),
        )
    }

    /// Stand-in classifier: single styling tweaks are simple, the rest explorative.
    fn heuristic_model() -> MockClient {
        MockClient::new("router").with_responder(|messages| {
            let instruction = messages
                .last()
                .and_then(|m| m.content.rsplit("Instruction: ").next())
                .unwrap_or_default()
                .to_lowercase();
            let styling = ["color", "font", "padding", "margin", "text"]
                .iter()
                .any(|w| instruction.contains(w));
            let workflow = if styling && !instruction.contains(" and ") {
                "simple_modification"
            } else {
                "explorative_modification"
            };
            MockReply::Text(format!(
                r#"{{"workflow": "{}", "reason": "heuristic"}}"#,
                workflow
            ))
        })
    }

    #[tokio::test]
    async fn css_color_change_routes_to_simple() {
        let decision = router(heuristic_model())
            .classify("Change the Add Todo button color to blue", &[])
            .await;

        assert_eq!(decision.workflow, WorkflowName::SimpleModification);
        assert!(!decision.fallback);
    }

    #[tokio::test]
    async fn structural_change_routes_to_explorative() {
        let decision = router(heuristic_model())
            .classify(
                "Split the todo list into pending and completed sections and persist them to localStorage",
                &[],
            )
            .await;

        assert_eq!(decision.workflow, WorkflowName::ExplorativeModification);
        assert!(!decision.fallback);
    }

    #[tokio::test]
    async fn prompt_lists_workflows_and_examples() {
        let client = MockClient::new("router")
            .with_reply(r#"{"workflow": "simple_modification", "reason": "r"}"#);
        let router = router(client.clone());

        router
            .classify("make it blue", &["add a border".to_string()])
            .await;

        let request = client.last_request().unwrap();
        assert!(request[0].content.contains("simple_modification (complexity: low)"));
        assert!(request[0].content.contains("explorative_modification (complexity: high)"));
        assert!(request[0].content.contains("Change the Add Todo button color to blue"));
        assert!(request[1].content.contains("1. add a border"));
        assert!(request[1].content.ends_with("Instruction: make it blue"));
    }

    #[tokio::test]
    async fn unknown_workflow_falls_back() {
        let decision = router(
            MockClient::new("router").with_reply(r#"{"workflow": "rewrite_everything"}"#),
        )
        .classify("x", &[])
        .await;

        assert_eq!(decision.workflow, FALLBACK_WORKFLOW);
        assert!(decision.fallback);
    }

    #[tokio::test]
    async fn unparseable_answer_falls_back() {
        let decision = router(MockClient::new("router").with_reply("I think simple is best."))
            .classify("x", &[])
            .await;

        assert_eq!(decision.workflow, FALLBACK_WORKFLOW);
        assert!(decision.fallback);
    }

    #[tokio::test]
    async fn transport_failure_falls_back() {
        let decision = router(MockClient::new("router").with_error("connection refused"))
            .classify("x", &[])
            .await;

        assert_eq!(decision.workflow, FALLBACK_WORKFLOW);
        assert!(decision.reason.contains("connection refused"));
    }

    #[test]
    fn pinned_decision_makes_no_claims_about_usage() {
        let decision = RouteDecision::pinned(WorkflowName::SimpleModification);
        assert!(decision.pinned);
        assert_eq!(decision.usage, Usage::default());
    }
}
