//! Patchwright CLI
//!
//! Runs a single instruction against a project and prints the resulting patch.

use std::path::PathBuf;
use std::sync::Arc;

use patchwright::{
    Config, CopySandbox, InitRequest, OpenAiCompatibleClient, SessionOrchestrator, TurnStatus,
    WorkflowName,
};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!("Usage: {} <project> <instruction...>", args[0]);
        eprintln!("\nApplies the instruction to a sandboxed copy of the project and prints the diff.");
        eprintln!("\nEnvironment variables:");
        eprintln!("  PATCHWRIGHT_CONFIG=<path>           TOML or YAML config file");
        eprintln!("  PATCHWRIGHT_WORKFLOW=simple|explorative  Skip routing");
        eprintln!("  PATCHWRIGHT_LLM_BASE_URL, PATCHWRIGHT_LLM_API_KEY,");
        eprintln!("  PATCHWRIGHT_LLM_MODEL, PATCHWRIGHT_ROUTER_MODEL");
        std::process::exit(1);
    }

    let project = &args[1];
    let instruction = args[2..].join(" ");

    let config = match std::env::var("PATCHWRIGHT_CONFIG") {
        Ok(path) => match Config::load(&PathBuf::from(&path)) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load {}: {}", path, e);
                std::process::exit(1);
            }
        },
        Err(_) => Config::default(),
    }
    .with_env_overrides();

    let workflow_override = match std::env::var("PATCHWRIGHT_WORKFLOW") {
        Ok(name) => match name.parse::<WorkflowName>() {
            Ok(workflow) => Some(workflow),
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        },
        Err(_) => None,
    };

    let llm = Arc::new(OpenAiCompatibleClient::from_config(&config.llm));
    let router_llm = Arc::new(OpenAiCompatibleClient::router_from_config(&config.llm));
    let provider = CopySandbox::from_config(&config.sandbox);

    let orchestrator = match SessionOrchestrator::new(provider, llm, router_llm, config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let mut request = InitRequest::new(project);
    request.workflow_override = workflow_override;

    let session_id = match orchestrator.init(request).await {
        Ok(id) => id,
        Err(e) => {
            eprintln!("Failed to start session: {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!(session_id = %session_id, instruction = %instruction, "running instruction");
    let outcome = orchestrator.chat(&session_id, &instruction).await;

    if let Err(e) = orchestrator.stop(&session_id).await {
        tracing::warn!(error = %e, "failed to stop session");
    }

    match outcome {
        Ok(response) => {
            print!("{}", response.diff.render());
            eprintln!();
            eprintln!("Workflow: {} ({})", response.workflow, response.route.reason);
            eprintln!(
                "Changed: {} file(s), +{} -{}",
                response.diff.files_changed, response.diff.additions, response.diff.deletions
            );
            eprintln!(
                "Tokens: {} in / {} out",
                response.usage.input_tokens, response.usage.output_tokens
            );

            if let TurnStatus::Failed { category, message } = &response.status {
                eprintln!("Turn failed ({}): {}", category, message);
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Chat failed: {}", e);
            std::process::exit(1);
        }
    }
}
