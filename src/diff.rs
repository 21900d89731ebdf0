//! Textual differences between sandbox trees.
//!
//! [`DiffEngine::compute`] compares the pristine baseline with the working
//! copy on disk; [`DiffEngine::between`] compares two in-memory
//! [`TreeSnapshot`]s so a single turn's delta can be reported.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;
use similar::{ChangeTag, TextDiff};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::sandbox::SandboxLayout;

/// Lines of context around each hunk.
const CONTEXT_LINES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
enum FileContent {
    Text(String),
    Binary(Vec<u8>),
}

/// Contents of every tracked file under a root, keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeSnapshot {
    files: BTreeMap<String, FileContent>,
}

impl TreeSnapshot {
    /// Reads every regular file under `root`, skipping ignored names and symlinks.
    pub fn capture(root: &Path, layout: &SandboxLayout) -> Result<Self> {
        let mut files = BTreeMap::new();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !layout.is_ignored(&e.file_name().to_string_lossy()));

        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                Error::DiffComputation {
                    path,
                    source: e.into(),
                }
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let bytes = std::fs::read(entry.path()).map_err(|source| Error::DiffComputation {
                path: entry.path().to_path_buf(),
                source,
            })?;
            let content = match String::from_utf8(bytes) {
                Ok(text) => FileContent::Text(text),
                Err(e) => FileContent::Binary(e.into_bytes()),
            };
            files.insert(relative_path(root, entry.path()), content);
        }

        Ok(Self { files })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Text contents of `path`, if it is a tracked UTF-8 file.
    pub fn text(&self, path: &str) -> Option<&str> {
        match self.files.get(path) {
            Some(FileContent::Text(text)) => Some(text),
            _ => None,
        }
    }
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Kind of change to one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// Unified diff block for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDiff {
    pub path: String,
    pub kind: ChangeKind,
    pub additions: usize,
    pub deletions: usize,
    /// Git-style block, headers included.
    pub unified: String,
}

/// Ordered per-file blocks plus totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diff {
    pub files: Vec<FileDiff>,
    pub files_changed: usize,
    pub additions: usize,
    pub deletions: usize,
}

impl Diff {
    fn from_files(files: Vec<FileDiff>) -> Self {
        Self {
            files_changed: files.len(),
            additions: files.iter().map(|f| f.additions).sum(),
            deletions: files.iter().map(|f| f.deletions).sum(),
            files,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Returns the block for `path`, if it changed.
    pub fn file(&self, path: &str) -> Option<&FileDiff> {
        self.files.iter().find(|f| f.path == path)
    }

    /// Paths of every changed file, in order.
    pub fn paths(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.path.as_str()).collect()
    }

    /// Concatenation of every block, suitable for `git apply`.
    pub fn render(&self) -> String {
        self.files.iter().map(|f| f.unified.as_str()).collect()
    }
}

/// Computes diffs over the tracked part of a sandbox.
#[derive(Debug, Clone, Default)]
pub struct DiffEngine {
    layout: SandboxLayout,
}

impl DiffEngine {
    pub fn new(layout: SandboxLayout) -> Self {
        Self { layout }
    }

    /// Captures the tracked tree under `root`.
    pub fn snapshot(&self, root: &Path) -> Result<TreeSnapshot> {
        TreeSnapshot::capture(root, &self.layout)
    }

    /// Diffs the working copy against the pristine baseline.
    pub fn compute(&self, pristine: &Path, workspace: &Path) -> Result<Diff> {
        for root in [pristine, workspace] {
            if !root.is_dir() {
                return Err(Error::DiffComputation {
                    path: PathBuf::from(root),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "tree not found"),
                });
            }
        }
        let old = self.snapshot(pristine)?;
        let new = self.snapshot(workspace)?;
        Ok(Self::between(&old, &new))
    }

    /// Diffs two snapshots. Paths are visited in sorted order.
    pub fn between(old: &TreeSnapshot, new: &TreeSnapshot) -> Diff {
        let paths: BTreeSet<&String> = old.files.keys().chain(new.files.keys()).collect();

        let files = paths
            .into_iter()
            .filter_map(|path| file_diff(path, old.files.get(path), new.files.get(path)))
            .collect();

        Diff::from_files(files)
    }
}

/// Absent files diff as empty text; binary files have no text.
fn as_text(content: Option<&FileContent>) -> Option<&str> {
    match content {
        None => Some(""),
        Some(FileContent::Text(text)) => Some(text.as_str()),
        Some(FileContent::Binary(_)) => None,
    }
}

fn file_diff(path: &str, old: Option<&FileContent>, new: Option<&FileContent>) -> Option<FileDiff> {
    let kind = match (old, new) {
        (None, None) => return None,
        (Some(a), Some(b)) if a == b => return None,
        (None, Some(_)) => ChangeKind::Added,
        (Some(_), None) => ChangeKind::Deleted,
        (Some(_), Some(_)) => ChangeKind::Modified,
    };

    let mut unified = format!("diff --git a/{path} b/{path}\n");
    match kind {
        ChangeKind::Added => unified.push_str("new file mode 100644\n"),
        ChangeKind::Deleted => unified.push_str("deleted file mode 100644\n"),
        ChangeKind::Modified => {}
    }

    let (Some(old_text), Some(new_text)) = (as_text(old), as_text(new)) else {
        let _ = writeln!(unified, "Binary files a/{path} and b/{path} differ");
        return Some(FileDiff {
            path: path.to_string(),
            kind,
            additions: 0,
            deletions: 0,
            unified,
        });
    };

    let old_header = match kind {
        ChangeKind::Added => "/dev/null".to_string(),
        _ => format!("a/{}", path),
    };
    let new_header = match kind {
        ChangeKind::Deleted => "/dev/null".to_string(),
        _ => format!("b/{}", path),
    };

    let text_diff = TextDiff::from_lines(old_text, new_text);
    let mut additions = 0;
    let mut deletions = 0;
    for change in text_diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => additions += 1,
            ChangeTag::Delete => deletions += 1,
            ChangeTag::Equal => {}
        }
    }

    let body = text_diff
        .unified_diff()
        .context_radius(CONTEXT_LINES)
        .header(&old_header, &new_header)
        .to_string();
    unified.push_str(&body);

    Some(FileDiff {
        path: path.to_string(),
        kind,
        additions,
        deletions,
        unified,
    })
}
