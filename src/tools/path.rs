//! Sandbox path normalization.
//!
//! Models routinely send paths like `./src/App.jsx`, `src/src/App.jsx`,
//! `/src/App.jsx` or the absolute sandbox path. All of them must land on the
//! same file, and nothing may resolve outside the sandbox root.

use std::path::{Component, Path, PathBuf};

use crate::error::ToolError;

/// Resolves model-supplied paths against one sandbox root.
#[derive(Debug, Clone)]
pub struct PathResolver {
    /// Root as given (used for display and prefix stripping).
    root: PathBuf,
    /// Canonical root used for containment checks.
    canonical_root: PathBuf,
    /// Extra absolute prefixes the model may echo back (e.g. the workspace).
    known_prefixes: Vec<PathBuf>,
    /// Leading component the model tends to repeat (e.g. `src`).
    redundant_prefix: Option<String>,
}

impl PathResolver {
    /// Creates a resolver confined to `root`, which must exist.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ToolError> {
        let root = root.into();
        let canonical_root = root.canonicalize()?;
        Ok(Self {
            known_prefixes: vec![root.clone(), canonical_root.clone()],
            root,
            canonical_root,
            redundant_prefix: None,
        })
    }

    /// Strips this leading component when it does not exist under the root.
    pub fn with_redundant_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        if !prefix.is_empty() {
            self.redundant_prefix = Some(prefix);
        }
        self
    }

    /// Also accepts absolute paths under `prefix` (typically the workspace).
    pub fn with_known_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        let prefix = prefix.into();
        if let Ok(canonical) = prefix.canonicalize() {
            self.known_prefixes.push(canonical);
        }
        self.known_prefixes.push(prefix);
        // Longest first so the workspace root never shadows the source root.
        self.known_prefixes
            .sort_by_key(|p| std::cmp::Reverse(p.as_os_str().len()));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Normalizes `raw` into a `/`-separated path relative to the root.
    ///
    /// An empty result denotes the root itself.
    pub fn normalize(&self, raw: &str) -> Result<String, ToolError> {
        let cleaned = raw
            .trim()
            .trim_matches(|c| c == '`' || c == '"' || c == '\'')
            .replace('\\', "/");

        let relative = self.strip_absolute(&cleaned, raw)?;

        let mut parts: Vec<String> = Vec::new();
        for component in Path::new(&relative).components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                Component::CurDir | Component::RootDir => {}
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(ToolError::PathEscape(raw.to_string()));
                    }
                }
                Component::Prefix(_) => return Err(ToolError::PathEscape(raw.to_string())),
            }
        }

        if let Some(prefix) = &self.redundant_prefix {
            let nested_exists = self.root.join(prefix).is_dir();
            while !nested_exists && parts.len() > 1 && parts[0] == *prefix {
                parts.remove(0);
            }
            if !nested_exists && parts.len() == 1 && parts[0] == *prefix {
                parts.clear();
            }
        }

        Ok(parts.join("/"))
    }

    /// Rewrites a glob pattern so it matches root-relative paths.
    ///
    /// Leading `./`, known absolute prefixes and the redundant prefix are
    /// dropped the same way [`normalize`](Self::normalize) drops them from paths.
    pub fn normalize_pattern(&self, pattern: &str) -> String {
        let mut cleaned = pattern
            .trim()
            .trim_matches(|c| c == '`' || c == '"' || c == '\'')
            .replace('\\', "/");

        if cleaned.starts_with('/') {
            for prefix in &self.known_prefixes {
                let prefix = prefix.to_string_lossy();
                if let Some(rest) = cleaned.strip_prefix(&*prefix) {
                    cleaned = rest.to_string();
                    break;
                }
            }
        }

        let mut rest = cleaned.as_str();
        loop {
            let trimmed = rest.trim_start_matches('/');
            let trimmed = trimmed.strip_prefix("./").unwrap_or(trimmed);
            if trimmed == rest {
                break;
            }
            rest = trimmed;
        }

        if let Some(prefix) = &self.redundant_prefix {
            if !self.root.join(prefix).is_dir() {
                while let Some(stripped) = rest
                    .strip_prefix(prefix.as_str())
                    .and_then(|r| r.strip_prefix('/'))
                {
                    rest = stripped;
                }
            }
        }

        rest.to_string()
    }

    /// Normalizes `raw` and returns the absolute path, checked to stay inside the root.
    ///
    /// The target need not exist; its nearest existing ancestor is
    /// canonicalized so symlinks pointing out of the sandbox are rejected.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, ToolError> {
        let relative = self.normalize(raw)?;
        let full = if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&relative)
        };

        let mut existing = full.as_path();
        let mut missing: Vec<&std::ffi::OsStr> = Vec::new();
        while !existing.exists() {
            match (existing.file_name(), existing.parent()) {
                (Some(name), Some(parent)) => {
                    missing.push(name);
                    existing = parent;
                }
                _ => return Err(ToolError::PathEscape(raw.to_string())),
            }
        }

        let canonical = existing.canonicalize()?;
        if !canonical.starts_with(&self.canonical_root) {
            return Err(ToolError::PathEscape(raw.to_string()));
        }

        let mut resolved = canonical;
        for name in missing.into_iter().rev() {
            resolved.push(name);
        }
        Ok(resolved)
    }

    /// Renders an absolute path under the root as a relative display path.
    pub fn display(&self, path: &Path) -> String {
        let rel = path
            .strip_prefix(&self.canonical_root)
            .or_else(|_| path.strip_prefix(&self.root))
            .unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn strip_absolute(&self, cleaned: &str, raw: &str) -> Result<String, ToolError> {
        if !cleaned.starts_with('/') {
            return Ok(cleaned.to_string());
        }

        let as_path = Path::new(cleaned);
        for prefix in &self.known_prefixes {
            if let Ok(rest) = as_path.strip_prefix(prefix) {
                return Ok(rest.to_string_lossy().into_owned());
            }
        }

        // `/src/App.jsx` is a rooted-looking relative path, not a host path.
        let first = cleaned.trim_start_matches('/').split('/').next().unwrap_or("");
        let sandbox_relative = self.redundant_prefix.as_deref() == Some(first)
            || self.root.join(first).exists();
        if sandbox_relative && !first.is_empty() {
            return Ok(cleaned.trim_start_matches('/').to_string());
        }

        Err(ToolError::PathEscape(raw.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// `<tmp>/workspace/src/App.jsx` with the resolver rooted at `src`.
    fn fixture() -> (TempDir, PathResolver) {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("workspace/src");
        fs::create_dir_all(src.join("components")).unwrap();
        fs::write(src.join("App.jsx"), "app").unwrap();
        fs::write(src.join("components/TodoForm.jsx"), "form").unwrap();

        let resolver = PathResolver::new(&src)
            .unwrap()
            .with_redundant_prefix("src")
            .with_known_prefix(dir.path().join("workspace"));
        (dir, resolver)
    }

    #[test]
    fn redundant_prefixes_resolve_identically() {
        let (_dir, resolver) = fixture();
        let expected = resolver.resolve("App.jsx").unwrap();

        for raw in [
            "src/App.jsx",
            "./src/App.jsx",
            "src/src/App.jsx",
            "/src/App.jsx",
            ".\\src\\App.jsx",
            "`src/App.jsx`",
        ] {
            assert_eq!(resolver.resolve(raw).unwrap(), expected, "raw: {}", raw);
        }
    }

    #[test]
    fn absolute_sandbox_paths_are_stripped() {
        let (dir, resolver) = fixture();
        let absolute = dir.path().join("workspace/src/components/TodoForm.jsx");
        let via_workspace = dir.path().join("workspace/src/App.jsx");

        assert_eq!(
            resolver.normalize(absolute.to_str().unwrap()).unwrap(),
            "components/TodoForm.jsx"
        );
        assert_eq!(
            resolver.normalize(via_workspace.to_str().unwrap()).unwrap(),
            "App.jsx"
        );
    }

    #[test]
    fn parent_traversal_is_rejected() {
        let (_dir, resolver) = fixture();

        for raw in ["../package.json", "src/../../etc/passwd", "components/../../x"] {
            assert!(
                matches!(resolver.resolve(raw), Err(ToolError::PathEscape(_))),
                "raw: {}",
                raw
            );
        }
        assert!(resolver.resolve("components/../App.jsx").is_ok());
    }

    #[test]
    fn foreign_absolute_path_is_rejected() {
        let (_dir, resolver) = fixture();
        assert!(matches!(
            resolver.resolve("/etc/passwd"),
            Err(ToolError::PathEscape(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_root_is_rejected() {
        let (dir, resolver) = fixture();
        let outside = dir.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, resolver.root().join("linked")).unwrap();

        assert!(matches!(
            resolver.resolve("linked/new.js"),
            Err(ToolError::PathEscape(_))
        ));
    }

    #[test]
    fn missing_targets_resolve_inside_root() {
        let (_dir, resolver) = fixture();
        let resolved = resolver.resolve("src/components/New.jsx").unwrap();

        assert!(resolved.ends_with("components/New.jsx"));
        assert_eq!(resolver.display(&resolved), "components/New.jsx");
    }

    #[test]
    fn empty_and_dot_resolve_to_root() {
        let (_dir, resolver) = fixture();
        assert_eq!(resolver.normalize(".").unwrap(), "");
        assert_eq!(resolver.normalize("src").unwrap(), "");
        assert_eq!(resolver.normalize("").unwrap(), "");
    }

    #[test]
    fn glob_patterns_drop_redundant_prefixes() {
        let (dir, resolver) = fixture();
        let absolute = format!("{}/src/**/*.jsx", dir.path().join("workspace").display());

        assert_eq!(resolver.normalize_pattern("src/components/*.jsx"), "components/*.jsx");
        assert_eq!(resolver.normalize_pattern("./src/**/*.jsx"), "**/*.jsx");
        assert_eq!(resolver.normalize_pattern("/src/*.jsx"), "*.jsx");
        assert_eq!(resolver.normalize_pattern(&absolute), "**/*.jsx");
        assert_eq!(resolver.normalize_pattern("*.css"), "*.css");
    }

    #[test]
    fn genuine_nested_prefix_dir_is_kept() {
        let (_dir, resolver) = fixture();
        fs::create_dir_all(resolver.root().join("src")).unwrap();
        assert_eq!(resolver.normalize("src/lib.js").unwrap(), "src/lib.js");
    }
}
