//! Tolerant extraction of JSON payloads from model output.
//!
//! Models wrap payloads in prose, markdown fences or typographic quotes.
//! [`ResponseParser`] tries a strict parse first and then falls back to the
//! largest structured-looking span, but only when that span covers at least
//! a minimum share of the whole response. Anything below the threshold is
//! reported as [`Error::ResponseFormat`] instead of guessed at.

use std::sync::OnceLock;

use regex::Regex;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Default minimum share of the response a recovered span must cover.
pub const DEFAULT_MIN_SHARE: f64 = 0.2;

fn fence_regex() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\r?\n(.*?)```").expect("fence regex is valid")
    })
}

/// Parses structured payloads out of free-form model responses.
#[derive(Debug, Clone, Copy)]
pub struct ResponseParser {
    min_share: f64,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SHARE)
    }
}

impl ResponseParser {
    /// Creates a parser accepting recovered spans covering at least `min_share`.
    pub fn new(min_share: f64) -> Self {
        Self { min_share }
    }

    /// Returns the configured minimum share.
    pub fn min_share(&self) -> f64 {
        self.min_share
    }

    /// Parses `response` into `T`.
    pub fn parse<T: DeserializeOwned>(&self, response: &str) -> Result<T> {
        let text = response.trim();
        if text.is_empty() {
            return Err(Error::response_format("empty response", response));
        }

        match self.parse_text(text) {
            Ok(value) => Ok(value),
            Err(first) => {
                let normalized = normalize_quotes(text);
                if normalized == text {
                    return Err(first);
                }
                tracing::debug!("retrying parse with normalized quotes");
                self.parse_text(&normalized).map_err(|_| first)
            }
        }
    }

    fn parse_text<T: DeserializeOwned>(&self, text: &str) -> Result<T> {
        let strict_err = match serde_json::from_str::<T>(text) {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let mut candidates = candidate_spans(text);
        candidates.sort_by_key(|span| std::cmp::Reverse(span.len()));

        let total = text.len() as f64;
        let largest = candidates.first().map(|s| s.len()).unwrap_or(0);
        let qualifying: Vec<&str> = candidates
            .into_iter()
            .filter(|span| span.len() as f64 >= total * self.min_share)
            .collect();

        if qualifying.is_empty() {
            return Err(Error::response_format(
                format!(
                    "largest structured span covers {:.0}% of the response, below the {:.0}% minimum ({})",
                    100.0 * largest as f64 / total,
                    100.0 * self.min_share,
                    strict_err
                ),
                text,
            ));
        }

        let mut last_err = strict_err;
        for span in qualifying {
            match serde_json::from_str::<T>(span) {
                Ok(value) => {
                    tracing::debug!(
                        span_len = span.len(),
                        total_len = text.len(),
                        "recovered payload from response span"
                    );
                    return Ok(value);
                }
                Err(e) => last_err = e,
            }
        }

        Err(Error::response_format(
            format!("no structured span parsed: {}", last_err),
            text,
        ))
    }
}

/// Collects fenced blocks and balanced `{}` / `[]` spans.
fn candidate_spans(text: &str) -> Vec<&str> {
    let mut spans: Vec<&str> = fence_regex()
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .collect();

    spans.extend(balanced_spans(text, '{', '}'));
    spans.extend(balanced_spans(text, '[', ']'));
    spans
}

/// Finds outermost balanced spans opened by `open`, skipping string contents.
fn balanced_spans(text: &str, open: char, close: char) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut start = 0;

    while let Some(offset) = text[start..].find(open) {
        let begin = start + offset;
        match match_close(&text[begin..], open, close) {
            Some(len) => {
                spans.push(&text[begin..begin + len]);
                start = begin + len;
            }
            None => start = begin + open.len_utf8(),
        }
    }

    spans
}

/// Returns the byte length of the balanced span at the start of `text`.
fn match_close(text: &str, open: char, close: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        if c == '"' {
            in_string = true;
        } else if c == open {
            depth += 1;
        } else if c == close {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return Some(idx + c.len_utf8());
            }
        }
    }

    None
}

fn normalize_quotes(text: &str) -> String {
    text.replace(['\u{201C}', '\u{201D}', '\u{201E}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
}
