//! Format-preserving key patches for the node's TOML-like config files.
//!
//! This is deliberately not a TOML model. Each operation touches exactly one
//! line and leaves comments, ordering and spacing of every other line alone.
//!
//! Known limits:
//! - keys are never inserted; updating a missing key is a logged no-op
//! - the first textual match wins, so duplicate unsectioned keys are ambiguous
//! - multi-line values are not supported
//!
//! Written values are always double-quoted, whatever quoting the line had.
//! A trailing `# comment` on a rewritten line is kept.

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{NodeError, Result};

// ---------------------------------------------------------------------------
// Pure text operations
// ---------------------------------------------------------------------------

/// Value of the first non-indented `key = …` line, or `""` when absent.
pub fn extract(content: &str, key: &str) -> String {
    content
        .lines()
        .find_map(|line| assignment_value(line, key, false))
        .map(parse_value)
        .unwrap_or_default()
}

/// Like [`extract`], restricted to the body of `[section]`.
pub fn extract_in_section(content: &str, section: &str, key: &str) -> String {
    content
        .lines()
        .skip_while(|line| !is_header(line, section))
        .skip(1)
        .take_while(|line| !line.trim_start().starts_with('['))
        .find_map(|line| assignment_value(line, key, true))
        .map(parse_value)
        .unwrap_or_default()
}

/// Rewrite the first non-indented `key = …` line. `None` if the key is absent.
pub fn patch(content: &str, key: &str, value: &str) -> Option<String> {
    let mut lines = split_lines(content);
    let idx = lines
        .iter()
        .position(|(body, _)| assignment_value(body, key, false).is_some())?;
    lines[idx].0 = render(&lines[idx].0, key, value);
    Some(join_lines(&lines))
}

/// Rewrite `key` inside `[section]` only. `None` if section or key is absent.
pub fn patch_in_section(content: &str, section: &str, key: &str, value: &str) -> Option<String> {
    let mut lines = split_lines(content);
    let start = lines.iter().position(|(body, _)| is_header(body, section))? + 1;
    let idx = lines[start..]
        .iter()
        .take_while(|(body, _)| !body.trim_start().starts_with('['))
        .position(|(body, _)| assignment_value(body, key, true).is_some())?
        + start;
    lines[idx].0 = render(&lines[idx].0, key, value);
    Some(join_lines(&lines))
}

fn is_header(line: &str, section: &str) -> bool {
    line.trim()
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .is_some_and(|name| name.trim() == section)
}

/// The raw text after `=` when `line` assigns `key`.
fn assignment_value<'a>(line: &'a str, key: &str, allow_indent: bool) -> Option<&'a str> {
    let body = if allow_indent { line.trim_start() } else { line };
    let rest = body.strip_prefix(key)?;
    // `key` must not be a prefix of a longer key.
    let rest = rest.trim_start_matches([' ', '\t']);
    rest.strip_prefix('=')
}

fn parse_value(raw: &str) -> String {
    let raw = raw.trim();
    if let Some(quoted) = raw.strip_prefix('"') {
        let mut out = String::new();
        let mut chars = quoted.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                }
                '"' => return out,
                _ => out.push(c),
            }
        }
        return out;
    }
    if let Some(quoted) = raw.strip_prefix('\'') {
        return quoted.split('\'').next().unwrap_or_default().to_string();
    }
    raw.split('#').next().unwrap_or_default().trim().to_string()
}

/// `value` as a double-quoted string with `\` and `"` escaped.
pub(crate) fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// The `# comment` after the value in `raw`, with its leading whitespace.
fn trailing_comment(raw: &str) -> &str {
    let lead = raw.len() - raw.trim_start().len();
    let body = &raw[lead..];
    let value_len = match body.chars().next() {
        Some('"') => {
            let mut escaped = false;
            body.char_indices()
                .skip(1)
                .find(|&(_, c)| {
                    let closes = c == '"' && !escaped;
                    escaped = c == '\\' && !escaped;
                    closes
                })
                .map_or(body.len(), |(i, _)| i + 1)
        }
        Some('\'') => body[1..].find('\'').map_or(body.len(), |i| i + 2),
        _ => {
            let before_hash = body.find('#').map_or(body, |i| &body[..i]);
            before_hash.trim_end().len()
        }
    };
    let rest = &body[value_len..];
    if rest.trim_start().starts_with('#') {
        rest.trim_end()
    } else {
        ""
    }
}

fn render(original: &str, key: &str, value: &str) -> String {
    let indent_len = original.len() - original.trim_start().len();
    let comment = assignment_value(original, key, true).map_or("", trailing_comment);
    format!("{}{key} = {}{comment}", &original[..indent_len], quote(value))
}

/// Split into `(body, line ending)` pairs so `\r\n` files keep their endings.
fn split_lines(content: &str) -> Vec<(String, &'static str)> {
    content
        .split_inclusive('\n')
        .map(|line| {
            if let Some(body) = line.strip_suffix("\r\n") {
                (body.to_string(), "\r\n")
            } else if let Some(body) = line.strip_suffix('\n') {
                (body.to_string(), "\n")
            } else {
                (line.to_string(), "")
            }
        })
        .collect()
}

fn join_lines(lines: &[(String, &str)]) -> String {
    let mut out = String::new();
    for (body, ending) in lines {
        out.push_str(body);
        out.push_str(ending);
    }
    out
}

// ---------------------------------------------------------------------------
// File-backed patcher
// ---------------------------------------------------------------------------

/// Seam over the text-patch strategy so a structured TOML editor can replace it.
#[async_trait]
pub trait ConfigPatcher: Send + Sync {
    /// Read a whole config file.
    async fn read(&self, path: &Path) -> Result<String>;

    /// Rewrite `key` in `path`. `Ok(false)` when the key does not exist.
    async fn update(&self, path: &Path, key: &str, value: &str) -> Result<bool>;

    /// Rewrite `key` inside `[section]` of `path`. `Ok(false)` when absent.
    async fn update_in_section(
        &self,
        path: &Path,
        section: &str,
        key: &str,
        value: &str,
    ) -> Result<bool>;
}

/// Line-oriented patcher writing through a sibling temp file and rename.
#[derive(Debug, Default, Clone)]
pub struct LinePatcher;

impl LinePatcher {
    async fn apply(&self, path: &Path, key: &str, patched: Option<String>) -> Result<bool> {
        match patched {
            Some(content) => {
                write_atomic(path, &content).await?;
                debug!(path = %path.display(), key, "config key updated");
                Ok(true)
            }
            None => {
                let missing = NodeError::ConfigKeyMissing {
                    path: path.to_path_buf(),
                    key: key.to_string(),
                };
                warn!(error = %missing, "skipping config write");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl ConfigPatcher for LinePatcher {
    async fn read(&self, path: &Path) -> Result<String> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| NodeError::io(path, e))
    }

    async fn update(&self, path: &Path, key: &str, value: &str) -> Result<bool> {
        let content = self.read(path).await?;
        self.apply(path, key, patch(&content, key, value)).await
    }

    async fn update_in_section(
        &self,
        path: &Path,
        section: &str,
        key: &str,
        value: &str,
    ) -> Result<bool> {
        let content = self.read(path).await?;
        self.apply(path, key, patch_in_section(&content, section, key, value))
            .await
    }
}

async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);
    tokio::fs::write(&tmp, content)
        .await
        .map_err(|e| NodeError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| NodeError::io(path, e))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
