//! Patchwright - sandboxed, LLM-driven code modification
//!
//! This library turns natural-language edit instructions into minimal,
//! reviewable patches. Each session works on an isolated copy of a project;
//! a router picks an editing workflow per instruction and every turn ends
//! with a unified diff against the untouched baseline.

pub mod config;
pub mod diff;
pub mod digest;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod parser;
pub mod router;
pub mod sandbox;
pub mod session;
pub mod tools;
pub mod workflow;

pub use config::{Config, Validate, ValidationResult};
pub use diff::{ChangeKind, Diff, DiffEngine, FileDiff, TreeSnapshot};
pub use digest::ProjectDigest;
pub use error::{Error, ErrorCategory, Result, ToolError};
pub use llm::{LlmClient, Message, MockClient, MockReply, OpenAiCompatibleClient, Usage};
pub use orchestrator::{ChatResponse, InitRequest, SessionOrchestrator, TurnStatus};
pub use parser::ResponseParser;
pub use router::{RouteDecision, Router};
pub use sandbox::{CopySandbox, PreviewHandle, PreviewLauncher, Sandbox, SandboxProvider};
pub use session::{InstructionHistory, Session, SessionInfo, SessionStore};
pub use tools::{PathResolver, RawToolCall, ToolCall, ToolExecutor};
pub use workflow::{
    EditRequest, ExplorativeModification, SimpleModification, Workflow, WorkflowExit,
    WorkflowName, WorkflowResult,
};
