use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use regex::Regex;
use tracing::{debug, warn};

use super::render::PageImage;
use crate::model::ExtractedIdentity;
use crate::settings::{OcrCommand, OcrSettings};
use crate::util::non_whitespace_char_count;

const NOISE_CHARACTERS: &[char] = &['#', '@', '~', '%', '^', '*'];

const LABEL_WORDS: &str = r"(?i)\b(?:student\s+(?:name|id|no|number)|full\s+name|name|id|reg(?:istration)?\.?\s*(?:no|number)|roll\s*no)\b";

/// Lines containing these words are exam headers, not names.
const HEADER_WORDS: &[&str] = &[
    "exam",
    "examination",
    "test",
    "paper",
    "course",
    "answer",
    "booklet",
    "page",
    "date",
    "signature",
    "university",
    "school",
    "college",
    "department",
    "question",
    "marks",
    "instructions",
];

/// Opaque OCR capability: page image in, raw text out.
pub trait TextBackend: Send + Sync {
    fn label(&self) -> &str;
    fn extract_text(&self, page: &PageImage) -> Result<String>;
}

/// Runs an external OCR program; `{image}` in the argument template is
/// replaced with the raster path and stdout is taken as the page text.
pub struct CommandBackend {
    command: OcrCommand,
}

impl CommandBackend {
    pub fn new(command: OcrCommand) -> Self {
        Self { command }
    }
}

impl TextBackend for CommandBackend {
    fn label(&self) -> &str {
        &self.command.label
    }

    fn extract_text(&self, page: &PageImage) -> Result<String> {
        let Some(raster) = page.raster.as_ref() else {
            bail!("page {} has no rendered image", page.index);
        };

        let image = raster.display().to_string();
        let args = self
            .command
            .args
            .iter()
            .map(|arg| arg.replace("{image}", &image))
            .collect::<Vec<String>>();

        let output = Command::new(&self.command.program)
            .args(&args)
            .output()
            .with_context(|| {
                format!(
                    "failed to execute {} for page {}",
                    self.command.program, page.index
                )
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} returned non-zero exit status for page {}: {}",
                self.command.program,
                page.index,
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .replace('\u{0000}', "")
            .trim()
            .to_string())
    }
}

pub struct IdentityParser {
    labelled_name: Regex,
    labelled_id: Regex,
    label_words: Regex,
    bare_id: Regex,
    bare_name: Regex,
}

impl IdentityParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            labelled_name: Regex::new(
                r"(?i)\b(?:student\s+name|full\s+name|name)\b\s*([:\-]?)\s*(.+)$",
            )
            .context("invalid labelled name pattern")?,
            labelled_id: Regex::new(
                r"(?i)\b(?:student\s+(?:id|no|number)|id|reg(?:istration)?\.?\s*(?:no|number)|roll\s*no)\b\.?\s*([:#\-]?)\s*([A-Za-z0-9][A-Za-z0-9\-/]+)",
            )
            .context("invalid labelled id pattern")?,
            label_words: Regex::new(LABEL_WORDS).context("invalid label pattern")?,
            bare_id: Regex::new(r"^[A-Za-z0-9][A-Za-z0-9\-/]{2,19}$")
                .context("invalid id token pattern")?,
            bare_name: Regex::new(r"^[A-Z][A-Za-z'\-]+(?:\s+[A-Z][A-Za-z'\-]+){0,3}$")
                .context("invalid name pattern")?,
        })
    }

    /// Returns `(name, id)`. Labelled fields take priority; unlabelled
    /// heuristics fill whichever role is still missing. First match wins
    /// per role.
    pub fn parse(&self, text: &str) -> (String, String) {
        let lines = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<&str>>();

        let mut name: Option<String> = None;
        let mut id: Option<String> = None;

        for line in &lines {
            if name.is_none() {
                name = self.labelled_name_value(line);
            }
            if id.is_none() {
                id = self.labelled_id_value(line);
            }
            if name.is_some() && id.is_some() {
                break;
            }
        }

        for line in &lines {
            if name.is_some() && id.is_some() {
                break;
            }
            if self.label_words.is_match(line) {
                continue;
            }
            if id.is_none() {
                id = line
                    .split_whitespace()
                    .map(|token| token.trim_matches(|character: char| ",.;:()".contains(character)))
                    .find(|token| self.is_bare_id(token))
                    .map(str::to_string);
            }
            if name.is_none() && self.is_bare_name(line) {
                name = Some(clean_name(line));
            }
        }

        (name.unwrap_or_default(), id.unwrap_or_default())
    }

    /// A label counts only at the start of the line or when followed by a
    /// separator, so instruction prose mentioning "name" is ignored. Without
    /// a separator the value must itself look like a name.
    fn labelled_name_value(&self, line: &str) -> Option<String> {
        self.labelled_name.captures_iter(line).find_map(|captures| {
            let at_start = captures.get(0).is_some_and(|found| found.start() == 0);
            let separated = !captures[1].is_empty();
            if !at_start && !separated {
                return None;
            }
            let value = clean_name(&self.strip_trailing_labels(&captures[2]));
            if value.is_empty() || (!separated && !self.is_bare_name(&value)) {
                return None;
            }
            Some(value)
        })
    }

    /// Same label placement rule as names; the value must contain a digit.
    fn labelled_id_value(&self, line: &str) -> Option<String> {
        self.labelled_id.captures_iter(line).find_map(|captures| {
            let at_start = captures.get(0).is_some_and(|found| found.start() == 0);
            let separated = !captures[1].is_empty();
            let value = &captures[2];
            ((at_start || separated) && value.chars().any(|character| character.is_ascii_digit()))
                .then(|| value.to_string())
        })
    }

    fn strip_trailing_labels(&self, value: &str) -> String {
        match self.label_words.find(value) {
            Some(found) => value[..found.start()].to_string(),
            None => value.to_string(),
        }
    }

    fn is_bare_id(&self, token: &str) -> bool {
        self.bare_id.is_match(token) && token.chars().any(|character| character.is_ascii_digit())
    }

    fn is_bare_name(&self, line: &str) -> bool {
        if !self.bare_name.is_match(line) {
            return false;
        }
        let lowered = line.to_lowercase();
        !lowered
            .split_whitespace()
            .any(|word| HEADER_WORDS.contains(&word))
    }
}

/// Deterministic confidence proxy for OCR text quality.
pub fn estimate_text_confidence(text: &str) -> f64 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0.0;
    }

    let mut confidence = 1.0_f64;
    if has_noise_run(trimmed) {
        confidence -= 0.3;
    }
    if trimmed.chars().count() < 5 {
        confidence -= 0.2;
    }
    confidence.clamp(0.0, 1.0)
}

fn has_noise_run(text: &str) -> bool {
    let mut run = 0_usize;
    for character in text.chars() {
        if NOISE_CHARACTERS.contains(&character) {
            run += 1;
            if run >= 2 {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

fn clean_name(value: &str) -> String {
    value
        .chars()
        .map(|character| {
            if character.is_alphabetic() || matches!(character, '\'' | '-' | '.') {
                character
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
        .trim_matches(|character| character == '-' || character == '.')
        .to_string()
}

pub struct IdentityExtractor {
    primary: Arc<dyn TextBackend>,
    fallback: Option<Arc<dyn TextBackend>>,
    min_text_chars: usize,
    parser: IdentityParser,
}

impl IdentityExtractor {
    pub fn new(
        primary: Arc<dyn TextBackend>,
        fallback: Option<Arc<dyn TextBackend>>,
        min_text_chars: usize,
    ) -> Result<Self> {
        Ok(Self {
            primary,
            fallback,
            min_text_chars,
            parser: IdentityParser::new()?,
        })
    }

    pub fn from_settings(settings: &OcrSettings) -> Result<Self> {
        let primary: Arc<dyn TextBackend> = Arc::new(CommandBackend::new(settings.primary.clone()));
        let fallback = settings
            .fallback
            .clone()
            .map(|command| Arc::new(CommandBackend::new(command)) as Arc<dyn TextBackend>);
        Self::new(primary, fallback, settings.min_text_chars)
    }

    pub fn primary_backend(&self) -> Arc<dyn TextBackend> {
        Arc::clone(&self.primary)
    }

    /// Text for one page with the label of the backend that produced it, or
    /// `None` when no backend produced any text.
    pub fn read_text(&self, page: &PageImage) -> Option<(String, String)> {
        let primary_text = run_backend(self.primary.as_ref(), page);
        let primary_chars = non_whitespace_char_count(&primary_text);
        if primary_chars >= self.min_text_chars {
            return Some((primary_text, self.primary.label().to_string()));
        }

        if let Some(fallback) = self.fallback.as_ref() {
            debug!(
                page = page.index,
                chars = primary_chars,
                fallback = fallback.label(),
                "primary text too short; trying fallback"
            );
            let fallback_text = run_backend(fallback.as_ref(), page);
            if non_whitespace_char_count(&fallback_text) > primary_chars {
                return Some((fallback_text, fallback.label().to_string()));
            }
        }

        if primary_chars > 0 {
            Some((primary_text, self.primary.label().to_string()))
        } else {
            None
        }
    }

    /// Never fails: unreadable pages yield an empty identity.
    pub fn extract(&self, page: &PageImage) -> ExtractedIdentity {
        let Some((text, backend)) = self.read_text(page) else {
            warn!(page = page.index, "no text recovered from front page");
            return ExtractedIdentity::empty();
        };

        let (raw_name, raw_id) = self.parser.parse(&text);
        let mut identity = ExtractedIdentity {
            raw_name,
            raw_id,
            confidence: estimate_text_confidence(&text),
            backend: Some(backend),
        };
        if identity.is_blank() {
            identity.confidence = 0.0;
        }

        debug!(
            page = page.index,
            name = %identity.raw_name,
            id = %identity.raw_id,
            confidence = identity.confidence,
            "identity extracted"
        );
        identity
    }
}

fn run_backend(backend: &dyn TextBackend, page: &PageImage) -> String {
    match backend.extract_text(page) {
        Ok(text) => text,
        Err(err) => {
            warn!(page = page.index, backend = backend.label(), error = %err, "text extraction failed");
            String::new()
        }
    }
}
