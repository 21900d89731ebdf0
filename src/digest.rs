//! Structural digest of a project for prompt context.
//!
//! The digest lists every relevant source file under the sandbox source root
//! with its size and a short outline (imports, components, functions). It is
//! rebuilt from the current sandbox state at the start of every turn.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Entry names never included in a digest.
const DIGEST_IGNORE: &[&str] = &[
    "node_modules",
    ".git",
    ".next",
    "dist",
    "build",
    "coverage",
    ".vscode",
    ".idea",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    ".DS_Store",
];

/// File extensions worth showing to the model.
const RELEVANT_EXTENSIONS: &[&str] = &["js", "jsx", "ts", "tsx", "css", "scss", "json", "html"];

/// Extensions whose contents get an outline.
const SCRIPT_EXTENSIONS: &[&str] = &["js", "jsx", "ts", "tsx"];

/// Default traversal depth.
pub const DEFAULT_MAX_DEPTH: usize = 5;

struct OutlinePatterns {
    import_from: Regex,
    import_bare: Regex,
    component_fn: Regex,
    component_arrow: Regex,
    component_class: Regex,
    function_decl: Regex,
    function_arrow: Regex,
}

fn patterns() -> &'static OutlinePatterns {
    static PATTERNS: OnceLock<OutlinePatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |p: &str| Regex::new(p).expect("outline regex is valid");
        OutlinePatterns {
            import_from: re(r#"(?m)^\s*import\s+[^;'"]*?\s+from\s+['"]([^'"]+)['"]"#),
            import_bare: re(r#"(?m)^\s*import\s+['"]([^'"]+)['"]"#),
            component_fn: re(r"(?m)^(?:export\s+(?:default\s+)?)?function\s+([A-Z][\w$]*)"),
            component_arrow: re(
                r"(?m)^(?:export\s+)?const\s+([A-Z][\w$]*)\s*=\s*(?:React\.memo\()?\s*(?:\([^)]*\)|[\w$]+)\s*=>",
            ),
            component_class: re(r"(?m)^(?:export\s+(?:default\s+)?)?class\s+([A-Z][\w$]*)"),
            function_decl: re(
                r"(?m)^(?:export\s+(?:default\s+)?)?(?:async\s+)?function\s+([a-z_$][\w$]*)",
            ),
            function_arrow: re(
                r"(?m)^(?:export\s+)?const\s+([a-z_$][\w$]*)\s*=\s*(?:async\s*)?(?:\([^)]*\)|[\w$]+)\s*=>",
            ),
        }
    })
}

/// Outline of one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileSummary {
    /// Path relative to the digest root, `/`-separated.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Imported module specifiers.
    pub imports: Vec<String>,
    /// Capitalized functions, arrow components and classes.
    pub components: Vec<String>,
    /// Other top-level function names.
    pub functions: Vec<String>,
}

impl FileSummary {
    fn outline(path: String, size: u64, contents: &str) -> Self {
        let p = patterns();
        let capture = |re: &Regex| -> Vec<String> {
            re.captures_iter(contents)
                .filter_map(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .collect()
        };

        let mut imports = capture(&p.import_from);
        imports.extend(capture(&p.import_bare));

        let mut components = capture(&p.component_fn);
        components.extend(capture(&p.component_arrow));
        components.extend(capture(&p.component_class));
        dedup_in_order(&mut components);

        let mut functions = capture(&p.function_decl);
        functions.extend(capture(&p.function_arrow));
        dedup_in_order(&mut functions);

        Self {
            path,
            size,
            imports,
            components,
            functions,
        }
    }
}

fn dedup_in_order(items: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    items.retain(|item| seen.insert(item.clone()));
}

/// Aggregate counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DigestStats {
    pub total_files: usize,
    pub total_bytes: u64,
    pub by_extension: BTreeMap<String, usize>,
}

/// Compact, ordered description of a project tree.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectDigest {
    root: PathBuf,
    files: Vec<FileSummary>,
    stats: DigestStats,
}

impl ProjectDigest {
    /// Walks `root` up to `max_depth`, skipping the digest ignore set and `extra_ignore`.
    pub fn build(root: &Path, extra_ignore: &[String], max_depth: usize) -> Result<Self> {
        let is_ignored =
            |name: &str| DIGEST_IGNORE.contains(&name) || extra_ignore.iter().any(|i| i == name);

        let mut files = Vec::new();
        let mut stats = DigestStats::default();

        let walker = WalkDir::new(root)
            .max_depth(max_depth)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_ignored(&e.file_name().to_string_lossy()));

        for entry in walker {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let Some(ext) = entry.path().extension().and_then(|e| e.to_str()) else {
                continue;
            };
            let ext = ext.to_ascii_lowercase();
            if !RELEVANT_EXTENSIONS.contains(&ext.as_str()) {
                continue;
            }

            let rel = relative_path(root, entry.path());
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);

            let summary = if SCRIPT_EXTENSIONS.contains(&ext.as_str()) {
                match std::fs::read_to_string(entry.path()) {
                    Ok(contents) => FileSummary::outline(rel, size, &contents),
                    Err(e) => {
                        tracing::debug!(path = %entry.path().display(), error = %e, "skipping outline");
                        FileSummary {
                            path: rel,
                            size,
                            ..Default::default()
                        }
                    }
                }
            } else {
                FileSummary {
                    path: rel,
                    size,
                    ..Default::default()
                }
            };

            stats.total_files += 1;
            stats.total_bytes += size;
            *stats.by_extension.entry(ext).or_insert(0) += 1;
            files.push(summary);
        }

        tracing::debug!(
            root = %root.display(),
            files = stats.total_files,
            "built project digest"
        );

        Ok(Self {
            root: root.to_path_buf(),
            files,
            stats,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> &[FileSummary] {
        &self.files
    }

    pub fn stats(&self) -> &DigestStats {
        &self.stats
    }

    /// Ordered relative paths.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.path.as_str())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.iter().any(|f| f.path == path)
    }

    /// One path per line.
    pub fn render_simple(&self) -> String {
        let mut out = String::new();
        for file in &self.files {
            let _ = writeln!(out, "{}", file.path);
        }
        out
    }

    /// Paths with sizes and outlines, followed by a stats line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for file in &self.files {
            let _ = writeln!(out, "{} ({} bytes)", file.path, file.size);
            if !file.imports.is_empty() {
                let _ = writeln!(out, "  imports: {}", file.imports.join(", "));
            }
            if !file.components.is_empty() {
                let _ = writeln!(out, "  components: {}", file.components.join(", "));
            }
            if !file.functions.is_empty() {
                let _ = writeln!(out, "  functions: {}", file.functions.join(", "));
            }
        }

        let by_ext: Vec<String> = self
            .stats
            .by_extension
            .iter()
            .map(|(ext, n)| format!(".{}: {}", ext, n))
            .collect();
        let _ = writeln!(
            out,
            "\n{} files, {} bytes ({})",
            self.stats.total_files,
            self.stats.total_bytes,
            by_ext.join(", ")
        );
        out
    }
}

fn relative_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
