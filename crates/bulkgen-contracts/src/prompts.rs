use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One non-empty, trimmed line of a prompt file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Prompt(String);

impl Prompt {
    /// Returns `None` when the text is blank after trimming.
    pub fn new(text: &str) -> Option<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Prompt {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Splits `text` on newlines, trims every line and keeps the non-empty ones
/// in file order. Duplicates are kept.
pub fn parse_prompts(text: &str) -> Vec<Prompt> {
    text.split('\n').filter_map(Prompt::new).collect()
}

pub fn load_prompts(path: &Path) -> Result<Vec<Prompt>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading prompt file {}", path.display()))?;
    Ok(parse_prompts(&raw))
}
