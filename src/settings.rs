use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Tunables for one pipeline run. Every field has a default so a settings
/// file only needs the values it overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub matcher: MatcherSettings,
    pub segmenter: SegmenterSettings,
    pub ocr: OcrSettings,
    pub render: RenderSettings,
    pub control: ControlSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherSettings {
    pub id_weight: f64,
    pub name_weight: f64,
    pub id_threshold: f64,
    pub name_threshold: f64,
    pub confident_threshold: f64,
    pub semantic_names: bool,
}

impl Default for MatcherSettings {
    fn default() -> Self {
        Self {
            id_weight: 0.7,
            name_weight: 0.3,
            id_threshold: 0.6,
            name_threshold: 0.7,
            confident_threshold: 0.8,
            semantic_names: false,
        }
    }
}

impl MatcherSettings {
    pub fn acceptance_floor(&self) -> f64 {
        self.id_threshold.min(self.name_threshold)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterSettings {
    pub front_page_threshold: f64,
    pub scan_lines: usize,
    pub top_lines: usize,
    pub keywords: Vec<String>,
}

impl Default for SegmenterSettings {
    fn default() -> Self {
        Self {
            front_page_threshold: 0.25,
            scan_lines: 10,
            top_lines: 5,
            keywords: [
                "name",
                "student name",
                "full name",
                "id",
                "student id",
                "reg no",
                "registration number",
            ]
            .iter()
            .map(|value| value.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrCommand {
    pub label: String,
    pub program: String,
    /// `{image}` is replaced with the page raster path.
    pub args: Vec<String>,
}

impl OcrCommand {
    pub fn tesseract(label: &str, psm: u32) -> Self {
        Self {
            label: label.to_string(),
            program: "tesseract".to_string(),
            args: vec![
                "{image}".to_string(),
                "stdout".to_string(),
                "--psm".to_string(),
                psm.to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrSettings {
    pub primary: OcrCommand,
    pub fallback: Option<OcrCommand>,
    pub min_text_chars: usize,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            primary: OcrCommand::tesseract("tesseract-block", 6),
            fallback: Some(OcrCommand::tesseract("tesseract-sparse", 11)),
            min_text_chars: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub program: String,
    pub dpi: u32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            program: "pdftoppm".to_string(),
            dpi: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    pub poll_interval_ms: u64,
    pub stale_after_secs: u64,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            stale_after_secs: 900,
        }
    }
}

impl ControlSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl PipelineSettings {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) => {
                let raw = fs::read(path)
                    .with_context(|| format!("failed to read settings {}", path.display()))?;
                serde_json::from_slice::<Self>(&raw)
                    .with_context(|| format!("failed to parse settings {}", path.display()))?
            }
            None => Self::default(),
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let matcher = &self.matcher;
        if matcher.id_weight < 0.0 || matcher.name_weight < 0.0 {
            bail!(
                "matcher weights must be non-negative (id_weight={}, name_weight={})",
                matcher.id_weight,
                matcher.name_weight
            );
        }
        if matcher.id_weight + matcher.name_weight <= 0.0 {
            bail!("matcher weights must not both be zero");
        }

        for (name, value) in [
            ("matcher.id_threshold", matcher.id_threshold),
            ("matcher.name_threshold", matcher.name_threshold),
            ("matcher.confident_threshold", matcher.confident_threshold),
            (
                "segmenter.front_page_threshold",
                self.segmenter.front_page_threshold,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{name} must be within [0, 1], got {value}");
            }
        }

        if self.ocr.primary.program.trim().is_empty() {
            bail!("ocr.primary.program must not be empty");
        }
        if self.segmenter.keywords.is_empty() {
            bail!("segmenter.keywords must contain at least one keyword");
        }

        Ok(())
    }
}
