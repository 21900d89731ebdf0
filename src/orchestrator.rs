//! Session lifecycle: `init`, `chat`, `stop`.
//!
//! The orchestrator owns the session registry, the router and the
//! workflows. Each chat turn routes the instruction (unless the session pins
//! a workflow), runs the workflow against the session sandbox and finishes
//! with a diff against the pristine baseline.

use std::sync::Arc;

use serde::Serialize;

use crate::config::{Config, Validate};
use crate::diff::{Diff, DiffEngine};
use crate::digest::ProjectDigest;
use crate::error::{Error, ErrorCategory, Result};
use crate::llm::{LlmClient, Usage};
use crate::parser::ResponseParser;
use crate::router::{RouteDecision, Router};
use crate::sandbox::{PreviewLauncher, Sandbox, SandboxProvider};
use crate::session::{Session, SessionInfo, SessionStore};
use crate::workflow::{
    EditRequest, ExplorativeModification, SimpleModification, Workflow, WorkflowContext,
    WorkflowExit, WorkflowName,
};

/// Parameters for [`SessionOrchestrator::init`].
#[derive(Debug, Clone, Default)]
pub struct InitRequest {
    pub project_name: String,
    /// Pins every turn of the session to this workflow.
    pub workflow_override: Option<WorkflowName>,
    /// Start a dev preview next to the sandbox.
    pub preview: bool,
}

impl InitRequest {
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            ..Default::default()
        }
    }

    pub fn with_workflow(mut self, workflow: WorkflowName) -> Self {
        self.workflow_override = Some(workflow);
        self
    }

    pub fn with_preview(mut self) -> Self {
        self.preview = true;
        self
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnStatus {
    Completed {
        exit: WorkflowExit,
        changed_files: Vec<String>,
    },
    /// The workflow failed; edits applied before the failure are kept.
    Failed {
        category: ErrorCategory,
        message: String,
    },
}

impl TurnStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, TurnStatus::Failed { .. })
    }
}

/// Result of one chat turn.
#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    /// Cumulative diff against the pristine baseline.
    pub diff: Diff,
    /// Changes made by this turn alone.
    pub turn_diff: Diff,
    pub workflow: WorkflowName,
    pub route: RouteDecision,
    /// Tokens spent by this turn, routing included.
    pub usage: Usage,
    pub status: TurnStatus,
}

/// Drives sessions against a sandbox provider.
pub struct SessionOrchestrator<P: SandboxProvider> {
    provider: P,
    store: Arc<SessionStore>,
    llm: Arc<dyn LlmClient>,
    router: Router,
    simple: SimpleModification,
    explorative: ExplorativeModification,
    parser: ResponseParser,
    preview: Option<Arc<dyn PreviewLauncher>>,
    config: Config,
}

impl<P: SandboxProvider> SessionOrchestrator<P> {
    /// Creates an orchestrator. `router_llm` may be a cheaper model than `llm`.
    pub fn new(
        provider: P,
        llm: Arc<dyn LlmClient>,
        router_llm: Arc<dyn LlmClient>,
        config: Config,
    ) -> Result<Self> {
        let warnings = config.validate().into_result()?;
        for warning in warnings {
            tracing::warn!(warning = %warning, "configuration warning");
        }

        let parser = ResponseParser::new(config.agent.min_payload_share);
        Ok(Self {
            router: Router::new(router_llm, parser, config.llm.request_timeout()),
            simple: SimpleModification::new(),
            explorative: ExplorativeModification::from_config(&config.agent),
            store: Arc::new(SessionStore::new()),
            preview: None,
            provider,
            llm,
            parser,
            config,
        })
    }

    /// Uses an externally owned session registry.
    pub fn with_store(mut self, store: Arc<SessionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_preview_launcher(mut self, launcher: Arc<dyn PreviewLauncher>) -> Self {
        self.preview = Some(launcher);
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn workflow(&self, name: WorkflowName) -> &dyn Workflow {
        match name {
            WorkflowName::SimpleModification => &self.simple,
            WorkflowName::ExplorativeModification => &self.explorative,
        }
    }

    /// Creates a sandboxed session and returns its id.
    pub async fn init(&self, request: InitRequest) -> Result<String> {
        let mut sandbox = self.provider.create(&request.project_name)?;

        let preview = if !request.preview {
            None
        } else if let Some(launcher) = &self.preview {
            match launcher.launch(sandbox.path()).await {
                Ok(handle) => Some(handle),
                Err(e) => {
                    if let Err(cleanup) = sandbox.cleanup() {
                        tracing::warn!(error = %cleanup, "failed to clean up after preview failure");
                    }
                    return Err(e);
                }
            }
        } else {
            tracing::warn!(project = %request.project_name, "preview requested but no launcher configured");
            None
        };

        let mut session = Session::new(
            &request.project_name,
            Box::new(sandbox),
            request.workflow_override,
        );
        if let Some(handle) = preview {
            session = session.with_preview(handle);
        }

        let id = session.id().to_string();
        tracing::info!(
            session_id = %id,
            project = %request.project_name,
            sandbox = %session.sandbox_path().display(),
            pinned_workflow = ?request.workflow_override,
            "session initialized"
        );
        self.store.insert(session).await;
        Ok(id)
    }

    /// Runs one instruction against a session.
    ///
    /// Workflow failures are reported in [`ChatResponse::status`]; only
    /// session lookup, busy sessions and diff I/O fail the call itself.
    pub async fn chat(&self, session_id: &str, instruction: &str) -> Result<ChatResponse> {
        let slot = self.store.get(session_id).await?;
        let mut session = slot.try_acquire()?;
        // Stopped between lookup and lock.
        if slot.is_cancelled() {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }
        let instruction = instruction.trim();

        let workspace = session.sandbox_path().to_path_buf();
        let pristine = session.pristine_snapshot_path().to_path_buf();
        let source_root = session.sandbox().source_root();
        let layout = session.sandbox().layout().clone();
        let diff_engine = DiffEngine::new(layout.clone());

        let before = diff_engine.snapshot(&workspace)?;

        let route = match session.pinned_workflow() {
            Some(pinned) => RouteDecision::pinned(pinned),
            None => {
                self.router
                    .classify(instruction, session.history().as_slice())
                    .await
            }
        };
        let workflow = self.workflow(route.workflow);

        tracing::info!(
            session_id = %session_id,
            workflow = %route.workflow,
            fallback = route.fallback,
            pinned = route.pinned,
            "starting turn"
        );

        let ctx = WorkflowContext {
            session_id,
            llm: self.llm.as_ref(),
            config: &self.config,
            parser: self.parser,
            source_root: &source_root,
            workspace: &workspace,
            layout: &layout,
            cancel: slot.cancel_flag(),
        };

        let outcome = match ProjectDigest::build(
            &source_root,
            &layout.ignore,
            self.config.agent.digest_max_depth,
        ) {
            Ok(digest) => {
                let request =
                    EditRequest::new(instruction, session.history().to_vec(), digest);
                workflow.run(&ctx, &request).await
            }
            Err(e) => Err(e),
        };

        let mut usage = route.usage;
        let status = match outcome {
            Ok(result) => {
                usage += result.usage;
                tracing::info!(
                    session_id = %session_id,
                    exit = ?result.exit,
                    model_calls = result.model_calls,
                    changed_files = ?result.changed_files,
                    "turn completed"
                );
                TurnStatus::Completed {
                    exit: result.exit,
                    changed_files: result.changed_files,
                }
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    category = %e.category(),
                    error = %e,
                    "turn failed"
                );
                TurnStatus::Failed {
                    category: e.category(),
                    message: e.to_string(),
                }
            }
        };

        session.record_turn(instruction, route.workflow, usage);

        let diff = diff_engine.compute(&pristine, &workspace)?;
        let after = diff_engine.snapshot(&workspace)?;
        let turn_diff = DiffEngine::between(&before, &after);

        Ok(ChatResponse {
            session_id: session_id.to_string(),
            diff,
            turn_diff,
            workflow: route.workflow,
            route,
            usage,
            status,
        })
    }

    /// Ends a session and removes its sandbox.
    ///
    /// The session is unregistered first, then any in-flight turn is asked
    /// to stop and awaited before files are deleted.
    pub async fn stop(&self, session_id: &str) -> Result<()> {
        let slot = self.store.remove(session_id).await?;
        slot.cancel();

        let mut session = slot.acquire().await;
        session.release().await?;

        tracing::info!(
            session_id = %session_id,
            turns = session.turns(),
            input_tokens = session.usage().input_tokens,
            output_tokens = session.usage().output_tokens,
            "session stopped"
        );
        Ok(())
    }

    /// Returns a snapshot of a live session. Waits for an in-flight turn.
    pub async fn session_info(&self, session_id: &str) -> Result<SessionInfo> {
        let slot = self.store.get(session_id).await?;
        let session = slot.acquire().await;
        Ok(session.info())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockClient;
    use crate::sandbox::{CopySandbox, PreviewHandle, SandboxLayout};
    use async_trait::async_trait;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    struct Env {
        projects: TempDir,
        boxes: TempDir,
    }

    impl Env {
        fn new() -> Self {
            let projects = TempDir::new().unwrap();
            let src = projects.path().join("todo-app/src");
            fs::create_dir_all(&src).unwrap();
            fs::write(src.join("App.jsx"), "const color = 'green';\n").unwrap();
            Self {
                projects,
                boxes: TempDir::new().unwrap(),
            }
        }

        fn orchestrator(&self, llm: MockClient, router: MockClient) -> SessionOrchestrator<CopySandbox> {
            let provider = CopySandbox::new(
                self.projects.path().to_path_buf(),
                self.boxes.path().to_path_buf(),
                SandboxLayout::default(),
            );
            SessionOrchestrator::new(provider, Arc::new(llm), Arc::new(router), Config::default())
                .unwrap()
        }
    }

    #[tokio::test]
    async fn init_then_stop_removes_sandbox() {
        let env = Env::new();
        let orchestrator = env.orchestrator(MockClient::new("m"), MockClient::new("r"));

        let id = orchestrator.init(InitRequest::new("todo-app")).await.unwrap();
        let info = orchestrator.session_info(&id).await.unwrap();
        assert!(info.sandbox_path.exists());

        orchestrator.stop(&id).await.unwrap();
        assert!(!info.sandbox_path.exists());
        assert!(matches!(
            orchestrator.chat(&id, "x").await,
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn unknown_project_creates_no_session() {
        let env = Env::new();
        let orchestrator = env.orchestrator(MockClient::new("m"), MockClient::new("r"));

        let result = orchestrator.init(InitRequest::new("missing")).await;
        assert!(matches!(result, Err(Error::ProjectNotFound(_))));
        assert!(orchestrator.store().is_empty().await);
    }

    #[tokio::test]
    async fn pinned_workflow_skips_router() {
        let env = Env::new();
        let router = MockClient::new("r");
        let llm = MockClient::new("m").with_replies([
            r#"["App.jsx"]"#.to_string(),
            serde_json::json!({"App.jsx": "const color = 'blue';\n"}).to_string(),
        ]);
        let orchestrator = env.orchestrator(llm, router.clone());

        let id = orchestrator
            .init(InitRequest::new("todo-app").with_workflow(WorkflowName::SimpleModification))
            .await
            .unwrap();
        let response = orchestrator.chat(&id, "make it blue").await.unwrap();

        assert_eq!(router.call_count(), 0);
        assert!(response.route.pinned);
        assert_eq!(response.diff.paths(), vec!["src/App.jsx"]);
        assert_eq!(response.turn_diff.paths(), vec!["src/App.jsx"]);
        orchestrator.stop(&id).await.unwrap();
    }

    #[tokio::test]
    async fn workflow_failure_is_reported_not_raised() {
        let env = Env::new();
        let llm = MockClient::new("m").with_error("upstream 502");
        let orchestrator = env.orchestrator(llm, MockClient::new("r"));

        let id = orchestrator
            .init(InitRequest::new("todo-app").with_workflow(WorkflowName::ExplorativeModification))
            .await
            .unwrap();
        let response = orchestrator.chat(&id, "do something").await.unwrap();

        match &response.status {
            TurnStatus::Failed { category, message } => {
                assert_eq!(*category, ErrorCategory::Model);
                assert!(message.contains("upstream 502"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(response.diff.is_empty());

        let info = orchestrator.session_info(&id).await.unwrap();
        assert_eq!(info.instruction_history, vec!["do something"]);
        orchestrator.stop(&id).await.unwrap();
    }

    struct FakePreview {
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl PreviewHandle for FakePreview {
        fn url(&self) -> Option<&str> {
            Some("http://localhost:5173")
        }

        async fn stop(&mut self) -> Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeLauncher {
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl PreviewLauncher for FakeLauncher {
        async fn launch(&self, _workspace: &Path) -> Result<Box<dyn PreviewHandle>> {
            Ok(Box::new(FakePreview {
                stopped: Arc::clone(&self.stopped),
            }))
        }
    }

    #[tokio::test]
    async fn preview_is_started_and_stopped_with_session() {
        let env = Env::new();
        let stopped = Arc::new(AtomicBool::new(false));
        let orchestrator = env
            .orchestrator(MockClient::new("m"), MockClient::new("r"))
            .with_preview_launcher(Arc::new(FakeLauncher {
                stopped: Arc::clone(&stopped),
            }));

        let id = orchestrator
            .init(InitRequest::new("todo-app").with_preview())
            .await
            .unwrap();
        let info = orchestrator.session_info(&id).await.unwrap();
        assert_eq!(info.preview_url.as_deref(), Some("http://localhost:5173"));

        orchestrator.stop(&id).await.unwrap();
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn preview_without_launcher_is_ignored() {
        let env = Env::new();
        let orchestrator = env.orchestrator(MockClient::new("m"), MockClient::new("r"));

        let id = orchestrator
            .init(InitRequest::new("todo-app").with_preview())
            .await
            .unwrap();
        assert!(orchestrator.session_info(&id).await.unwrap().preview_url.is_none());
        orchestrator.stop(&id).await.unwrap();
    }

    #[test]
    fn invalid_config_is_rejected() {
        let env = Env::new();
        let mut config = Config::default();
        config.agent.max_iterations = 0;

        let provider = CopySandbox::new(
            env.projects.path().to_path_buf(),
            env.boxes.path().to_path_buf(),
            SandboxLayout::default(),
        );
        let result = SessionOrchestrator::new(
            provider,
            Arc::new(MockClient::new("m")),
            Arc::new(MockClient::new("r")),
            config,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
