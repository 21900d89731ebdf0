//! Directory-copy sandbox implementation.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::config::SandboxConfig;
use crate::error::{Error, Result};

use super::provider::{Sandbox, SandboxLayout, SandboxProvider};

const WORKSPACE_DIR: &str = "workspace";
const PRISTINE_DIR: &str = "pristine";

/// A sandbox made of two plain directory copies of a project.
///
/// `workspace` is mutated by workflows; `pristine` is written once at
/// creation and only ever read afterwards. The project's dependency
/// directory is symlinked into `workspace` and absent from `pristine`.
pub struct CopySandboxInstance {
    /// Session-unique id, also the directory name under the sandbox root.
    id: String,
    /// `<sandbox_root>/<id>`.
    root: PathBuf,
    /// Mutable working copy.
    workspace: PathBuf,
    /// Diff baseline.
    pristine: PathBuf,
    layout: SandboxLayout,
    /// Whether the sandbox has been cleaned up.
    cleaned_up: bool,
}

impl Sandbox for CopySandboxInstance {
    fn id(&self) -> &str {
        &self.id
    }

    fn path(&self) -> &PathBuf {
        &self.workspace
    }

    fn pristine_path(&self) -> &PathBuf {
        &self.pristine
    }

    fn layout(&self) -> &SandboxLayout {
        &self.layout
    }

    fn cleanup(&mut self) -> Result<()> {
        if self.cleaned_up {
            return Ok(());
        }

        // Drop the link on its own so removal can never reach the link target.
        let link = self.workspace.join(&self.layout.dependency_dir);
        if link.is_symlink() {
            remove_link(&link).map_err(|e| Error::SandboxCleanup {
                path: link.clone(),
                reason: e.to_string(),
            })?;
        }

        if self.root.exists() {
            std::fs::remove_dir_all(&self.root).map_err(|e| Error::SandboxCleanup {
                path: self.root.clone(),
                reason: e.to_string(),
            })?;
        }

        tracing::info!(sandbox_id = %self.id, path = ?self.root, "removed sandbox");
        self.cleaned_up = true;
        Ok(())
    }
}

impl Drop for CopySandboxInstance {
    fn drop(&mut self) {
        if !self.cleaned_up {
            if let Err(e) = self.cleanup() {
                tracing::error!(error = %e, path = ?self.root, "failed to cleanup sandbox on drop");
            }
        }
    }
}

/// Provider that creates sandboxes by copying project directories.
#[derive(Debug, Clone)]
pub struct CopySandbox {
    projects_root: PathBuf,
    sandbox_root: PathBuf,
    layout: SandboxLayout,
}

impl CopySandbox {
    /// Creates a provider resolving projects under `projects_root` and
    /// placing every sandbox under `sandbox_root`.
    pub fn new(projects_root: PathBuf, sandbox_root: PathBuf, layout: SandboxLayout) -> Self {
        Self {
            projects_root,
            sandbox_root,
            layout,
        }
    }

    /// Creates a provider from the sandbox section of the configuration.
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(
            config.projects_root.clone(),
            config.sandbox_root.clone(),
            SandboxLayout::from(config),
        )
    }

    fn resolve_project(&self, project_name: &str) -> Result<PathBuf> {
        let valid_name = !project_name.trim().is_empty()
            && project_name != "."
            && project_name != ".."
            && !project_name.contains(['/', '\\']);
        if !valid_name {
            return Err(Error::ProjectNotFound(project_name.to_string()));
        }

        let path = self.projects_root.join(project_name);
        if !path.is_dir() {
            return Err(Error::ProjectNotFound(project_name.to_string()));
        }
        Ok(path)
    }

    fn populate(&self, source: &Path, workspace: &Path, pristine: &Path) -> Result<()> {
        copy_tree(source, pristine, &self.layout)?;
        copy_tree(source, workspace, &self.layout)?;

        let deps = source.join(&self.layout.dependency_dir);
        if deps.is_dir() {
            let target = deps.canonicalize()?;
            create_dir_link(&target, &workspace.join(&self.layout.dependency_dir))?;
            tracing::debug!(target = ?target, "linked dependency directory");
        }
        Ok(())
    }
}

impl SandboxProvider for CopySandbox {
    type Sandbox = CopySandboxInstance;

    fn create(&self, project_name: &str) -> Result<Self::Sandbox> {
        let source = self.resolve_project(project_name)?;

        std::fs::create_dir_all(&self.sandbox_root).map_err(|e| {
            Error::SandboxCreation(format!(
                "cannot create sandbox root {}: {}",
                self.sandbox_root.display(),
                e
            ))
        })?;

        let id = uuid::Uuid::new_v4().to_string();
        let root = self.sandbox_root.join(&id);
        std::fs::create_dir(&root).map_err(|e| {
            Error::SandboxCreation(format!("cannot create {}: {}", root.display(), e))
        })?;

        let workspace = root.join(WORKSPACE_DIR);
        let pristine = root.join(PRISTINE_DIR);

        if let Err(e) = self.populate(&source, &workspace, &pristine) {
            if let Err(cleanup_err) = std::fs::remove_dir_all(&root) {
                tracing::error!(error = %cleanup_err, path = ?root, "failed to remove partial sandbox");
            }
            return Err(Error::SandboxCreation(format!(
                "copying {} failed: {}",
                source.display(),
                e
            )));
        }

        tracing::info!(
            project = %project_name,
            sandbox_id = %id,
            path = ?workspace,
            "created sandbox"
        );

        Ok(CopySandboxInstance {
            id,
            root,
            workspace,
            pristine,
            layout: self.layout.clone(),
            cleaned_up: false,
        })
    }

    fn projects_root(&self) -> &PathBuf {
        &self.projects_root
    }

    fn sandbox_root(&self) -> &PathBuf {
        &self.sandbox_root
    }
}

/// Recursively copies `src` into `dst`, skipping ignored entries and symlinks.
fn copy_tree(src: &Path, dst: &Path, layout: &SandboxLayout) -> Result<()> {
    std::fs::create_dir_all(dst)?;

    let walker = WalkDir::new(src)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || e
                    .file_name()
                    .to_str()
                    .map(|n| !layout.is_ignored(n))
                    .unwrap_or(true)
        });

    for entry in walker {
        let entry = entry.map_err(|e| std::io::Error::other(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
        } else {
            tracing::debug!(path = ?entry.path(), "skipping non-regular entry");
        }
    }

    Ok(())
}

#[cfg(unix)]
fn create_dir_link(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_dir_link(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

#[cfg(unix)]
fn remove_link(link: &Path) -> std::io::Result<()> {
    std::fs::remove_file(link)
}

#[cfg(windows)]
fn remove_link(link: &Path) -> std::io::Result<()> {
    std::fs::remove_dir(link)
}
