//! Sandbox provider traits and layout types.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::config::SandboxConfig;
use crate::error::Result;

/// Names that decide what a sandbox copies, links and tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLayout {
    /// Directory linked into the workspace instead of copied.
    pub dependency_dir: String,
    /// Sub-directory the workflows are rooted at.
    pub source_dir: String,
    /// Entry names skipped while copying and diffing.
    pub ignore: Vec<String>,
}

impl SandboxLayout {
    /// Returns true if an entry with this file name is outside the tracked tree.
    pub fn is_ignored(&self, name: &str) -> bool {
        name == self.dependency_dir || self.ignore.iter().any(|i| i == name)
    }
}

impl Default for SandboxLayout {
    fn default() -> Self {
        Self::from(&SandboxConfig::default())
    }
}

impl From<&SandboxConfig> for SandboxLayout {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            dependency_dir: config.dependency_dir.clone(),
            source_dir: config.source_dir.clone(),
            ignore: config.ignore.clone(),
        }
    }
}

/// Represents an active sandbox environment.
pub trait Sandbox: Send + Sync {
    /// Unique id of this sandbox (also its directory name).
    fn id(&self) -> &str;

    /// Returns the mutable working copy.
    fn path(&self) -> &PathBuf;

    /// Returns the immutable baseline copy.
    fn pristine_path(&self) -> &PathBuf;

    /// Returns the layout used to create this sandbox.
    fn layout(&self) -> &SandboxLayout;

    /// Directory workflows and tools are confined to.
    fn source_root(&self) -> PathBuf {
        let source = self.path().join(&self.layout().source_dir);
        if source.is_dir() {
            source
        } else {
            self.path().clone()
        }
    }

    /// Cleans up the sandbox, removing all resources.
    fn cleanup(&mut self) -> Result<()>;
}

/// Provider for creating sandboxed environments.
pub trait SandboxProvider: Send + Sync {
    /// The type of sandbox this provider creates.
    type Sandbox: Sandbox + 'static;

    /// Creates a new sandbox holding a copy of the named project.
    fn create(&self, project_name: &str) -> Result<Self::Sandbox>;

    /// Returns the directory projects are resolved against.
    fn projects_root(&self) -> &PathBuf;

    /// Returns the directory all sandboxes live under.
    fn sandbox_root(&self) -> &PathBuf;
}

/// A running auxiliary process attached to a session (e.g. a dev server).
#[async_trait]
pub trait PreviewHandle: Send + Sync {
    /// Address the preview is reachable at, if any.
    fn url(&self) -> Option<&str>;

    /// Stops the process. Must be idempotent.
    async fn stop(&mut self) -> Result<()>;
}

/// Starts preview processes for freshly created sandboxes.
#[async_trait]
pub trait PreviewLauncher: Send + Sync {
    /// Launches a preview rooted at the sandbox workspace.
    async fn launch(&self, workspace: &Path) -> Result<Box<dyn PreviewHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_defaults_follow_sandbox_config() {
        let layout = SandboxLayout::default();

        assert_eq!(layout.dependency_dir, "node_modules");
        assert_eq!(layout.source_dir, "src");
        assert!(layout.ignore.contains(&".git".to_string()));
    }

    #[test]
    fn dependency_dir_is_always_ignored() {
        let layout = SandboxLayout {
            dependency_dir: "vendor".to_string(),
            source_dir: "src".to_string(),
            ignore: vec![],
        };

        assert!(layout.is_ignored("vendor"));
        assert!(!layout.is_ignored("src"));
    }
}
