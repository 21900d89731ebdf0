//! The bounded capability set offered to the explorative workflow.
//!
//! Model replies carry loosely-typed [`RawToolCall`]s; [`ToolCall::from_raw`]
//! turns them into the closed [`ToolCall`] enum, and [`ToolExecutor`] runs
//! them against a sandbox through a [`PathResolver`].

mod executor;
mod path;

pub use executor::{ToolExecutor, ToolOutcome};
pub use path::PathResolver;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToolError;

/// Default number of context lines around grep matches.
pub const DEFAULT_CONTEXT_LINES: usize = 2;

/// A tool call as it appears in a model reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawToolCall {
    #[serde(alias = "name")]
    pub tool: String,
    #[serde(default, alias = "params", alias = "arguments", alias = "args")]
    pub parameters: Value,
}

/// A validated call into the capability set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    /// Lists files under `directory`, optionally filtered by a glob.
    ListFiles {
        directory: String,
        pattern: Option<String>,
    },
    /// Regex search returning `file:line:` matches.
    GrepCode {
        pattern: String,
        file_pattern: Option<String>,
        context_lines: usize,
    },
    /// Reads an inclusive, 1-based line range.
    ReadFileLines {
        file_path: String,
        start_line: usize,
        end_line: Option<usize>,
    },
    /// Replaces the unique occurrence of `old_str`, or creates the file when
    /// `old_str` is empty and the file does not exist.
    ApplyEdit {
        file_path: String,
        old_str: String,
        new_str: String,
    },
}

#[derive(Deserialize)]
struct ListFilesParams {
    #[serde(default = "default_directory", alias = "path", alias = "dir")]
    directory: String,
    #[serde(default, alias = "glob")]
    pattern: Option<String>,
}

fn default_directory() -> String {
    ".".to_string()
}

#[derive(Deserialize)]
struct GrepCodeParams {
    #[serde(alias = "query", alias = "regex")]
    pattern: String,
    #[serde(default, alias = "include", alias = "glob")]
    file_pattern: Option<String>,
    #[serde(default)]
    context_lines: Option<usize>,
}

#[derive(Deserialize)]
struct ReadFileLinesParams {
    #[serde(alias = "path", alias = "file")]
    file_path: String,
    #[serde(default)]
    start_line: Option<usize>,
    #[serde(default)]
    end_line: Option<usize>,
}

#[derive(Deserialize)]
struct ApplyEditParams {
    #[serde(alias = "path", alias = "file")]
    file_path: String,
    #[serde(default, alias = "old_string", alias = "search")]
    old_str: String,
    #[serde(alias = "new_string", alias = "replace")]
    new_str: String,
}

fn params<T: DeserializeOwned>(tool: &str, value: &Value) -> Result<T, ToolError> {
    let value = match value {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(value).map_err(|e| ToolError::InvalidParameters {
        tool: tool.to_string(),
        reason: e.to_string(),
    })
}

impl ToolCall {
    /// Names of every tool in the capability set.
    pub const NAMES: [&'static str; 4] =
        ["list_files", "grep_code", "read_file_lines", "apply_edit"];

    /// Validates a raw call against the capability set.
    pub fn from_raw(raw: &RawToolCall) -> Result<Self, ToolError> {
        let name = raw.tool.trim();
        match name {
            "list_files" => {
                let p: ListFilesParams = params(name, &raw.parameters)?;
                Ok(ToolCall::ListFiles {
                    directory: p.directory,
                    pattern: p.pattern.filter(|s| !s.trim().is_empty()),
                })
            }
            "grep_code" => {
                let p: GrepCodeParams = params(name, &raw.parameters)?;
                if p.pattern.is_empty() {
                    return Err(ToolError::InvalidParameters {
                        tool: name.to_string(),
                        reason: "pattern must not be empty".to_string(),
                    });
                }
                Ok(ToolCall::GrepCode {
                    pattern: p.pattern,
                    file_pattern: p.file_pattern.filter(|s| !s.trim().is_empty()),
                    context_lines: p.context_lines.unwrap_or(DEFAULT_CONTEXT_LINES),
                })
            }
            "read_file_lines" => {
                let p: ReadFileLinesParams = params(name, &raw.parameters)?;
                let start_line = p.start_line.unwrap_or(1).max(1);
                if let Some(end) = p.end_line {
                    if end < start_line {
                        return Err(ToolError::InvalidParameters {
                            tool: name.to_string(),
                            reason: format!("end_line {} is before start_line {}", end, start_line),
                        });
                    }
                }
                Ok(ToolCall::ReadFileLines {
                    file_path: p.file_path,
                    start_line,
                    end_line: p.end_line,
                })
            }
            "apply_edit" => {
                let p: ApplyEditParams = params(name, &raw.parameters)?;
                Ok(ToolCall::ApplyEdit {
                    file_path: p.file_path,
                    old_str: p.old_str,
                    new_str: p.new_str,
                })
            }
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    /// Returns the tool name.
    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::ListFiles { .. } => "list_files",
            ToolCall::GrepCode { .. } => "grep_code",
            ToolCall::ReadFileLines { .. } => "read_file_lines",
            ToolCall::ApplyEdit { .. } => "apply_edit",
        }
    }
}

/// Tool documentation embedded in the explorative system prompt.
pub fn describe_tools() -> &'static str {
    r#"- list_files {"directory": ".", "pattern": "*.jsx"}
  List files under a directory (recursive). "pattern" is an optional glob.
- grep_code {"pattern": "regex", "file_pattern": "*.{js,jsx}", "context_lines": 2}
  Search file contents. Returns "path:line: text" for each match.
- read_file_lines {"file_path": "App.jsx", "start_line": 1, "end_line": 40}
  Read a 1-based, inclusive line range. Omit end_line to read to the end.
- apply_edit {"file_path": "App.jsx", "old_str": "exact text", "new_str": "replacement"}
  Replace text that occurs exactly once in the file. Use an empty old_str to create a new file."#
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(tool: &str, parameters: Value) -> RawToolCall {
        RawToolCall {
            tool: tool.to_string(),
            parameters,
        }
    }

    #[test]
    fn parses_every_tool() {
        assert_eq!(
            ToolCall::from_raw(&raw("list_files", json!({}))).unwrap(),
            ToolCall::ListFiles {
                directory: ".".into(),
                pattern: None
            }
        );
        assert_eq!(
            ToolCall::from_raw(&raw("grep_code", json!({"pattern": "Add Todo"}))).unwrap(),
            ToolCall::GrepCode {
                pattern: "Add Todo".into(),
                file_pattern: None,
                context_lines: DEFAULT_CONTEXT_LINES
            }
        );
        assert_eq!(
            ToolCall::from_raw(&raw("read_file_lines", json!({"file_path": "App.jsx"}))).unwrap(),
            ToolCall::ReadFileLines {
                file_path: "App.jsx".into(),
                start_line: 1,
                end_line: None
            }
        );
        assert_eq!(
            ToolCall::from_raw(&raw(
                "apply_edit",
                json!({"file_path": "App.jsx", "old_str": "red", "new_str": "blue"})
            ))
            .unwrap()
            .name(),
            "apply_edit"
        );
    }

    #[test]
    fn accepts_common_parameter_aliases() {
        let call = ToolCall::from_raw(&raw(
            "apply_edit",
            json!({"path": "App.jsx", "old_string": "a", "new_string": "b"}),
        ))
        .unwrap();

        assert_eq!(
            call,
            ToolCall::ApplyEdit {
                file_path: "App.jsx".into(),
                old_str: "a".into(),
                new_str: "b".into()
            }
        );
    }

    #[test]
    fn unknown_tool_is_rejected() {
        assert!(matches!(
            ToolCall::from_raw(&raw("run_shell", json!({"cmd": "rm -rf /"}))),
            Err(ToolError::UnknownTool(name)) if name == "run_shell"
        ));
    }

    #[test]
    fn missing_required_parameter_is_invalid() {
        assert!(matches!(
            ToolCall::from_raw(&raw("read_file_lines", Value::Null)),
            Err(ToolError::InvalidParameters { .. })
        ));
        assert!(matches!(
            ToolCall::from_raw(&raw("grep_code", json!({"pattern": ""}))),
            Err(ToolError::InvalidParameters { .. })
        ));
    }

    #[test]
    fn inverted_range_is_invalid() {
        assert!(matches!(
            ToolCall::from_raw(&raw(
                "read_file_lines",
                json!({"file_path": "a.js", "start_line": 10, "end_line": 2})
            )),
            Err(ToolError::InvalidParameters { .. })
        ));
    }

    #[test]
    fn raw_call_deserializes_with_aliases() {
        let call: RawToolCall =
            serde_json::from_value(json!({"name": "list_files", "arguments": {"path": "components"}}))
                .unwrap();
        assert_eq!(
            ToolCall::from_raw(&call).unwrap(),
            ToolCall::ListFiles {
                directory: "components".into(),
                pattern: None
            }
        );
    }
}
