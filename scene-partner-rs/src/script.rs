//! Parsed script model.
//!
//! The parsing collaborator hands us an ordered list of lines as JSON,
//! either wrapped as `{"lines": [...]}` or as a bare array. Order is
//! performance order and the model is never mutated after loading.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::info;

use crate::error::{RehearsalError, Result};

static PARENTHETICAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\([^)]*\)").expect("valid regex"));

static TRAILING_PARENTHETICAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\([^)]*\)\s*$").expect("valid regex"));

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// One line of dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptLine {
    pub index: usize,
    pub character: String,
    pub dialog: String,
    pub cue_phrase: String,
    pub action: Option<String>,
    pub emotion: Option<String>,
}

/// Wire shape of a line as produced by the parsing collaborator.
#[derive(Debug, Deserialize)]
struct RawLine {
    character: String,
    #[serde(default)]
    dialog: String,
    #[serde(default)]
    cue: String,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    emotion: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawScript {
    Wrapped { lines: Vec<RawLine> },
    Bare(Vec<RawLine>),
}

/// Immutable ordered view of a parsed script.
#[derive(Debug, Clone, Default)]
pub struct ScriptModel {
    lines: Vec<ScriptLine>,
}

impl ScriptModel {
    pub fn new(lines: Vec<ScriptLine>) -> Self {
        let lines = lines
            .into_iter()
            .enumerate()
            .map(|(index, line)| ScriptLine { index, ..line })
            .collect();
        Self { lines }
    }

    /// Parse the collaborator's JSON output.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawScript =
            serde_json::from_str(json).map_err(|e| RehearsalError::ScriptFormat(e.to_string()))?;
        let raw_lines = match raw {
            RawScript::Wrapped { lines } | RawScript::Bare(lines) => lines,
        };

        let lines = raw_lines
            .into_iter()
            .enumerate()
            .map(|(index, raw)| ScriptLine {
                index,
                character: raw.character.trim().to_string(),
                dialog: raw.dialog,
                cue_phrase: raw.cue,
                action: raw.action.filter(|a| !a.trim().is_empty()),
                emotion: raw.emotion.filter(|e| !e.trim().is_empty()),
            })
            .collect();

        Ok(Self { lines })
    }

    /// Load a script JSON file from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| RehearsalError::ScriptRead {
            path: path.to_path_buf(),
            source,
        })?;
        let model = Self::from_json(&contents)?;
        info!("Loaded {} lines from {}", model.len(), path.display());
        Ok(model)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> &[ScriptLine] {
        &self.lines
    }

    /// Line at `index`, or `OutOfRange`.
    pub fn line_at(&self, index: usize) -> Result<&ScriptLine> {
        self.lines.get(index).ok_or(RehearsalError::OutOfRange {
            index,
            len: self.lines.len(),
        })
    }

    /// Whether the performer speaks line `index`.
    pub fn is_user_line(&self, index: usize, active_character: &str) -> Result<bool> {
        Ok(self.line_at(index)?.character == active_character)
    }

    /// Distinct character names in order of first appearance.
    pub fn characters(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for line in &self.lines {
            if !seen.contains(&line.character.as_str()) {
                seen.push(line.character.as_str());
            }
        }
        seen
    }

    pub fn has_character(&self, name: &str) -> bool {
        self.lines.iter().any(|l| l.character == name)
    }
}

/// Remove every parenthetical aside, e.g. stage directions, before synthesis.
pub fn strip_parentheticals(text: &str) -> String {
    let stripped = PARENTHETICAL.replace_all(text, "");
    WHITESPACE.replace_all(stripped.trim(), " ").into_owned()
}

/// Normalize a cue phrase for matching: drop a trailing `(action)`, lower-case.
pub fn normalize_cue(cue: &str) -> String {
    TRAILING_PARENTHETICAL
        .replace(cue, "")
        .trim()
        .to_lowercase()
}
