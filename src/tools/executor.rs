//! Executes validated tool calls inside one sandbox.

use std::fmt::Write as _;
use std::path::Path;

use regex::Regex;
use walkdir::WalkDir;

use crate::error::ToolError;

use super::path::PathResolver;
use super::ToolCall;

/// Maximum number of entries returned by `list_files`.
const LIST_LIMIT: usize = 500;

/// Default output cap for `grep_code`.
pub const DEFAULT_GREP_MAX_OUTPUT: usize = 5000;

/// Result of a successful tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    /// Text fed back to the model.
    pub output: String,
    /// Relative path written by the call, if any.
    pub modified: Option<String>,
}

impl ToolOutcome {
    fn read(output: String) -> Self {
        Self {
            output,
            modified: None,
        }
    }
}

/// Runs [`ToolCall`]s confined to a sandbox root.
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    resolver: PathResolver,
    ignore: Vec<String>,
    grep_max_output: usize,
}

impl ToolExecutor {
    pub fn new(resolver: PathResolver, ignore: Vec<String>) -> Self {
        Self {
            resolver,
            ignore,
            grep_max_output: DEFAULT_GREP_MAX_OUTPUT,
        }
    }

    pub fn with_grep_max_output(mut self, chars: usize) -> Self {
        self.grep_max_output = chars;
        self
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// Executes one call. Every path is resolved before any I/O happens.
    pub async fn execute(&self, call: &ToolCall) -> Result<ToolOutcome, ToolError> {
        match call {
            ToolCall::ListFiles { directory, pattern } => self
                .list_files(directory, pattern.as_deref())
                .map(ToolOutcome::read),
            ToolCall::GrepCode {
                pattern,
                file_pattern,
                context_lines,
            } => self
                .grep_code(pattern, file_pattern.as_deref(), *context_lines)
                .map(ToolOutcome::read),
            ToolCall::ReadFileLines {
                file_path,
                start_line,
                end_line,
            } => self
                .read_file_lines(file_path, *start_line, *end_line)
                .await
                .map(ToolOutcome::read),
            ToolCall::ApplyEdit {
                file_path,
                old_str,
                new_str,
            } => self.apply_edit(file_path, old_str, new_str).await,
        }
    }

    fn is_ignored(&self, name: &str) -> bool {
        self.ignore.iter().any(|i| i == name)
    }

    /// Walks regular files under `dir`, skipping ignored entries and symlinks.
    fn walk_files<'a>(&'a self, dir: &Path) -> impl Iterator<Item = walkdir::DirEntry> + 'a {
        WalkDir::new(dir)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |e| e.depth() == 0 || !self.is_ignored(&e.file_name().to_string_lossy()))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
    }

    fn list_files(&self, directory: &str, pattern: Option<&str>) -> Result<String, ToolError> {
        let dir = self.resolver.resolve(directory)?;
        if !dir.is_dir() {
            return Err(ToolError::NotFound(directory.to_string()));
        }

        let matchers = pattern
            .map(|p| compile_glob(&self.resolver.normalize_pattern(p)))
            .transpose()?;

        let mut entries = Vec::new();
        let mut truncated = false;
        for entry in self.walk_files(&dir) {
            let rel = self.resolver.display(entry.path());
            if let Some(matchers) = &matchers {
                if !glob_matches(matchers, &rel) {
                    continue;
                }
            }
            if entries.len() == LIST_LIMIT {
                truncated = true;
                break;
            }
            entries.push(rel);
        }

        if entries.is_empty() {
            return Ok("No files found".to_string());
        }

        let mut out = entries.join("\n");
        if truncated {
            let _ = write!(out, "\n... (limited to {} entries)", LIST_LIMIT);
        }
        Ok(out)
    }

    fn grep_code(
        &self,
        pattern: &str,
        file_pattern: Option<&str>,
        context_lines: usize,
    ) -> Result<String, ToolError> {
        let regex = Regex::new(pattern).map_err(|e| ToolError::InvalidParameters {
            tool: "grep_code".to_string(),
            reason: format!("invalid regex: {}", e),
        })?;
        let matchers = file_pattern
            .map(|p| compile_glob(&self.resolver.normalize_pattern(p)))
            .transpose()?;

        let mut out = String::new();
        let mut matches = 0usize;
        let mut truncated = false;

        'files: for entry in self.walk_files(self.resolver.root()) {
            let rel = self.resolver.display(entry.path());
            if let Some(matchers) = &matchers {
                if !glob_matches(matchers, &rel) {
                    continue;
                }
            }

            // Non-UTF-8 files are skipped.
            let Ok(contents) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let lines: Vec<&str> = contents.lines().collect();

            let hits: Vec<usize> = lines
                .iter()
                .enumerate()
                .filter(|(_, line)| regex.is_match(line))
                .map(|(i, _)| i)
                .collect();

            for group in group_hits(&hits, context_lines, lines.len()) {
                if !out.is_empty() {
                    out.push_str("--\n");
                }
                for idx in group.start..group.end {
                    let sep = if hits.binary_search(&idx).is_ok() {
                        matches += 1;
                        ':'
                    } else {
                        '-'
                    };
                    let _ = writeln!(out, "{}{}{}{} {}", rel, sep, idx + 1, sep, lines[idx]);
                }
                if out.chars().count() > self.grep_max_output {
                    truncated = true;
                    break 'files;
                }
            }
        }

        if out.is_empty() {
            return Ok("No matches found".to_string());
        }
        if truncated {
            let mut capped = crate::error::truncate_chars(&out, self.grep_max_output);
            capped.push_str("\n... (output truncated, narrow the pattern or file_pattern)");
            return Ok(capped);
        }

        tracing::debug!(pattern, matches, "grep completed");
        Ok(out)
    }

    async fn read_file_lines(
        &self,
        file_path: &str,
        start_line: usize,
        end_line: Option<usize>,
    ) -> Result<String, ToolError> {
        let path = self.resolver.resolve(file_path)?;
        if !path.is_file() {
            return Err(ToolError::NotFound(file_path.to_string()));
        }

        let contents = tokio::fs::read_to_string(&path).await?;
        let lines: Vec<&str> = contents.lines().collect();
        let total = lines.len();
        let start = start_line.max(1);

        if total == 0 {
            return Ok(format!("{} is empty", self.resolver.display(&path)));
        }
        if start > total {
            return Err(ToolError::InvalidParameters {
                tool: "read_file_lines".to_string(),
                reason: format!("start_line {} is past the end of the file ({} lines)", start, total),
            });
        }

        let end = end_line.unwrap_or(total).min(total);
        if end < start {
            return Err(ToolError::InvalidParameters {
                tool: "read_file_lines".to_string(),
                reason: format!("end_line {} is before start_line {}", end, start),
            });
        }
        let mut out = format!(
            "{} (lines {}-{} of {})\n",
            self.resolver.display(&path),
            start,
            end,
            total
        );
        for (offset, line) in lines[start - 1..end].iter().enumerate() {
            let _ = writeln!(out, "{:4} | {}", start + offset, line);
        }
        Ok(out)
    }

    async fn apply_edit(
        &self,
        file_path: &str,
        old_str: &str,
        new_str: &str,
    ) -> Result<ToolOutcome, ToolError> {
        let path = self.resolver.resolve(file_path)?;
        let shown = self.resolver.display(&path);

        if !path.exists() {
            if !old_str.is_empty() {
                return Err(ToolError::NotFound(file_path.to_string()));
            }
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, new_str).await?;
            tracing::debug!(path = %shown, "created file");
            return Ok(ToolOutcome {
                output: format!("Created {} ({} lines)", shown, new_str.lines().count()),
                modified: Some(shown),
            });
        }

        if !path.is_file() {
            return Err(ToolError::EditRejected {
                path: shown,
                reason: "target is a directory".to_string(),
            });
        }
        if old_str.is_empty() {
            return Err(ToolError::EditRejected {
                path: shown,
                reason: "old_str must not be empty when the file exists".to_string(),
            });
        }

        let contents = tokio::fs::read_to_string(&path).await?;
        let occurrences = contents.matches(old_str).count();
        if occurrences == 1 && old_str == new_str {
            return Ok(ToolOutcome::read(format!(
                "No change to {}: old_str and new_str are identical",
                shown
            )));
        }
        match occurrences {
            0 => Err(ToolError::EditRejected {
                path: shown,
                reason: "old_str not found; read the file and copy the exact text".to_string(),
            }),
            1 => {
                let updated = contents.replacen(old_str, new_str, 1);
                tokio::fs::write(&path, updated).await?;
                tracing::debug!(path = %shown, "applied edit");
                Ok(ToolOutcome {
                    output: format!(
                        "Edited {}: replaced {} line(s) with {} line(s)",
                        shown,
                        old_str.lines().count().max(1),
                        new_str.lines().count()
                    ),
                    modified: Some(shown),
                })
            }
            n => Err(ToolError::EditRejected {
                path: shown,
                reason: format!("old_str matches {} times; include more surrounding text", n),
            }),
        }
    }
}

/// Merges match windows that overlap or touch.
fn group_hits(hits: &[usize], context: usize, len: usize) -> Vec<std::ops::Range<usize>> {
    let mut groups: Vec<std::ops::Range<usize>> = Vec::new();
    for &hit in hits {
        let start = hit.saturating_sub(context);
        let end = (hit + context + 1).min(len);
        match groups.last_mut() {
            Some(last) if start <= last.end => last.end = last.end.max(end),
            _ => groups.push(start..end),
        }
    }
    groups
}

/// Compiles a glob, expanding one level of `{a,b}` alternatives.
fn compile_glob(pattern: &str) -> Result<Vec<glob::Pattern>, ToolError> {
    expand_braces(pattern)
        .iter()
        .map(|p| {
            glob::Pattern::new(p).map_err(|e| ToolError::InvalidParameters {
                tool: "glob".to_string(),
                reason: format!("invalid pattern '{}': {}", pattern, e),
            })
        })
        .collect()
}

fn expand_braces(pattern: &str) -> Vec<String> {
    let (Some(open), Some(close)) = (pattern.find('{'), pattern.find('}')) else {
        return vec![pattern.to_string()];
    };
    if close < open {
        return vec![pattern.to_string()];
    }

    let prefix = &pattern[..open];
    let suffix = &pattern[close + 1..];
    pattern[open + 1..close]
        .split(',')
        .map(|alt| format!("{}{}{}", prefix, alt.trim(), suffix))
        .collect()
}

/// Patterns without a `/` match the file name, others the relative path.
fn glob_matches(patterns: &[glob::Pattern], rel: &str) -> bool {
    let name = rel.rsplit('/').next().unwrap_or(rel);
    patterns.iter().any(|p| {
        if p.as_str().contains('/') {
            p.matches(rel)
        } else {
            p.matches(name)
        }
    })
}
