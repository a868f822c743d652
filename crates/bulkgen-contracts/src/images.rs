use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::prompts::Prompt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "16:9")]
    Landscape,
    #[serde(rename = "9:16")]
    Portrait,
    #[serde(rename = "4:3")]
    Standard,
    #[serde(rename = "3:4")]
    StandardPortrait,
}

impl AspectRatio {
    pub const ALL: [AspectRatio; 5] = [
        AspectRatio::Square,
        AspectRatio::Landscape,
        AspectRatio::Portrait,
        AspectRatio::Standard,
        AspectRatio::StandardPortrait,
    ];

    pub fn label(self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Landscape => "16:9",
            AspectRatio::Portrait => "9:16",
            AspectRatio::Standard => "4:3",
            AspectRatio::StandardPortrait => "3:4",
        }
    }

    fn parts(self) -> (u32, u32) {
        match self {
            AspectRatio::Square => (1, 1),
            AspectRatio::Landscape => (16, 9),
            AspectRatio::Portrait => (9, 16),
            AspectRatio::Standard => (4, 3),
            AspectRatio::StandardPortrait => (3, 4),
        }
    }

    /// Width and height with the longer side equal to `long_edge`.
    pub fn dimensions(self, long_edge: u32) -> (u32, u32) {
        let (w, h) = self.parts();
        if w >= h {
            (long_edge, (long_edge * h / w).max(1))
        } else {
            ((long_edge * w / h).max(1), long_edge)
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for AspectRatio {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let value = raw.trim().replace('/', ":");
        AspectRatio::ALL
            .into_iter()
            .find(|candidate| candidate.label() == value)
            .ok_or_else(|| {
                let allowed = AspectRatio::ALL
                    .iter()
                    .map(|ratio| ratio.label())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("unsupported aspect ratio '{raw}' (expected one of: {allowed})")
            })
    }
}

/// One unit of work handed to an image provider. Built per call, never stored.
#[derive(Clone)]
pub struct GenerationRequest {
    pub prompt: Prompt,
    pub aspect_ratio: AspectRatio,
    pub credential: String,
    pub model: String,
    /// Zero-based position of the unit within its batch.
    pub unit_index: u64,
}

impl fmt::Debug for GenerationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationRequest")
            .field("prompt", &self.prompt)
            .field("aspect_ratio", &self.aspect_ratio)
            .field("credential", &"<redacted>")
            .field("model", &self.model)
            .field("unit_index", &self.unit_index)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub prompt: Prompt,
    /// `https://` or `data:` URL of the image.
    pub reference: String,
}

impl GeneratedImage {
    pub fn new(prompt: Prompt, reference: impl Into<String>) -> Self {
        Self {
            prompt,
            reference: reference.into(),
        }
    }

    pub fn reference_kind(&self) -> &'static str {
        reference_kind(&self.reference)
    }
}

pub fn reference_kind(reference: &str) -> &'static str {
    let lower = reference.trim_start().to_ascii_lowercase();
    if lower.starts_with("data:") {
        "data_url"
    } else if lower.starts_with("https://") || lower.starts_with("http://") {
        "http_url"
    } else {
        "other"
    }
}
