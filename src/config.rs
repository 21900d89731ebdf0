//! Orchestrator configuration and validation.
//!
//! Configuration is read from TOML or YAML, then overlaid with environment
//! variables, then validated before any session is created.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable overriding `llm.base_url`.
pub const ENV_BASE_URL: &str = "PATCHWRIGHT_LLM_BASE_URL";
/// Environment variable overriding `llm.api_key`.
pub const ENV_API_KEY: &str = "PATCHWRIGHT_LLM_API_KEY";
/// Environment variable overriding `llm.model`.
pub const ENV_MODEL: &str = "PATCHWRIGHT_LLM_MODEL";
/// Environment variable overriding `llm.router_model`.
pub const ENV_ROUTER_MODEL: &str = "PATCHWRIGHT_ROUTER_MODEL";

/// Sandbox layout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Directory containing one sub-directory per project.
    #[serde(default = "default_projects_root")]
    pub projects_root: PathBuf,
    /// The only directory sandboxes are created under.
    #[serde(default = "default_sandbox_root")]
    pub sandbox_root: PathBuf,
    /// Large reproducible directory that is linked, never copied.
    #[serde(default = "default_dependency_dir")]
    pub dependency_dir: String,
    /// Sub-directory the workflows operate in. Falls back to the project root when absent.
    #[serde(default = "default_source_dir")]
    pub source_dir: String,
    /// Entry names skipped while copying and diffing.
    #[serde(default = "default_ignore")]
    pub ignore: Vec<String>,
}

fn default_projects_root() -> PathBuf {
    PathBuf::from("projects")
}

fn default_sandbox_root() -> PathBuf {
    std::env::temp_dir().join("patchwright-sandboxes")
}

fn default_dependency_dir() -> String {
    "node_modules".to_string()
}

fn default_source_dir() -> String {
    "src".to_string()
}

fn default_ignore() -> Vec<String> {
    ["node_modules", ".git", "dist", "build"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            projects_root: default_projects_root(),
            sandbox_root: default_sandbox_root(),
            dependency_dir: default_dependency_dir(),
            source_dir: default_source_dir(),
            ignore: default_ignore(),
        }
    }
}

/// Model endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible API base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token, if the endpoint needs one.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Model used by the workflows.
    #[serde(default = "default_model")]
    pub model: String,
    /// Cheaper model used for routing. Falls back to `model`.
    #[serde(default)]
    pub router_model: Option<String>,
    /// Completion budget per call.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Sampling temperature for workflow calls.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Per-call timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:1234/v1".to_string()
}

fn default_model() -> String {
    "qwen3-coder-30b-a3b-instruct-mlx".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.1
}

fn default_request_timeout() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            router_model: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl LlmConfig {
    /// Returns the per-call timeout as a Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Returns the model used for routing decisions.
    pub fn effective_router_model(&self) -> &str {
        self.router_model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(&self.model)
    }
}

/// Workflow tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Iteration cap for the explorative loop.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Minimum share of the response a recovered payload span must cover.
    #[serde(default = "default_min_payload_share")]
    pub min_payload_share: f64,
    /// Output cap for `grep_code` results.
    #[serde(default = "default_grep_max_output")]
    pub grep_max_output_chars: usize,
    /// Directory depth walked when building the project digest.
    #[serde(default = "default_digest_max_depth")]
    pub digest_max_depth: usize,
}

fn default_max_iterations() -> u32 {
    25
}

fn default_min_payload_share() -> f64 {
    0.2
}

fn default_grep_max_output() -> usize {
    5000
}

fn default_digest_max_depth() -> usize {
    5
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            min_payload_share: default_min_payload_share(),
            grep_max_output_chars: default_grep_max_output(),
            digest_max_depth: default_digest_max_depth(),
        }
    }
}

/// Diagnostic output configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// When set, explorative transcripts are written here after each turn.
    #[serde(default)]
    pub transcript_dir: Option<PathBuf>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads configuration from a TOML or YAML file, chosen by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        match ext.as_str() {
            "yaml" | "yml" => Self::from_yaml(&raw),
            "toml" => Self::from_toml(&raw),
            other => Err(Error::Config(format!(
                "unsupported config extension '{}' for {}",
                other,
                path.display()
            ))),
        }
    }

    /// Parses TOML configuration.
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(format!("invalid TOML: {}", e)))
    }

    /// Parses YAML configuration.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| Error::Config(format!("invalid YAML: {}", e)))
    }

    /// Applies `PATCHWRIGHT_*` environment overrides.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup (used by tests).
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup(ENV_BASE_URL) {
            self.llm.base_url = url;
        }
        if let Some(key) = lookup(ENV_API_KEY) {
            self.llm.api_key = Some(key);
        }
        if let Some(model) = lookup(ENV_MODEL) {
            self.llm.model = model;
        }
        if let Some(model) = lookup(ENV_ROUTER_MODEL) {
            self.llm.router_model = Some(model);
        }
        self
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

impl Validate for SandboxConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.sandbox_root.as_os_str().is_empty() {
            result.add_error("sandbox_root cannot be empty");
        }
        if self.sandbox_root == self.projects_root {
            result.add_error("sandbox_root must differ from projects_root");
        }
        if self.dependency_dir.contains('/') || self.dependency_dir.contains('\\') {
            result.add_error("dependency_dir must be a single directory name");
        }
        if !self.ignore.iter().any(|i| i == &self.dependency_dir) {
            result.add_warning(format!(
                "dependency_dir '{}' is not in the ignore list; it is still linked rather than copied",
                self.dependency_dir
            ));
        }

        result
    }
}

impl Validate for LlmConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.base_url.trim().is_empty() {
            result.add_error("llm.base_url cannot be empty");
        }
        if self.model.trim().is_empty() {
            result.add_error("llm.model cannot be empty");
        }
        if self.max_tokens == 0 {
            result.add_error("llm.max_tokens must be at least 1");
        }
        if self.request_timeout_secs == 0 {
            result.add_error("llm.request_timeout_secs must be at least 1");
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            result.add_warning("llm.temperature outside 0.0-2.0 may be rejected by the endpoint");
        }

        result
    }
}

impl Validate for AgentConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.max_iterations == 0 {
            result.add_error("agent.max_iterations must be at least 1");
        }
        if self.max_iterations > 100 {
            result.add_warning("agent.max_iterations > 100 may lead to excessive LLM calls");
        }
        if !(self.min_payload_share > 0.0 && self.min_payload_share <= 1.0) {
            result.add_error("agent.min_payload_share must be in (0, 1]");
        }
        if self.digest_max_depth == 0 {
            result.add_error("agent.digest_max_depth must be at least 1");
        }

        result
    }
}

impl Validate for Config {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        result.merge(self.sandbox.validate());
        result.merge(self.llm.validate());
        result.merge(self.agent.validate());
        result
    }
}
