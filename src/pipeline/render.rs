use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use crate::settings::RenderSettings;
use crate::util::ensure_directory;

/// One rendered page. `raster` is absent when the page failed to render;
/// such a page is treated as a continuation page downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub index: usize,
    pub raster: Option<PathBuf>,
}

pub trait PageRenderer {
    fn render_pages(&self, document: &Path, scratch_dir: &Path) -> Result<Vec<PageImage>>;
}

pub struct PopplerRenderer {
    program: String,
    dpi: u32,
}

impl PopplerRenderer {
    pub fn new(settings: &RenderSettings) -> Self {
        Self {
            program: settings.program.clone(),
            dpi: settings.dpi,
        }
    }

    fn render_page(&self, document: &Path, index: usize, scratch_dir: &Path) -> Result<PathBuf> {
        let page_number = index + 1;
        let output_root = scratch_dir.join(format!("page_{page_number:05}"));
        let png_path = PathBuf::from(format!("{}.png", output_root.display()));

        let output = Command::new(&self.program)
            .arg("-f")
            .arg(page_number.to_string())
            .arg("-l")
            .arg(page_number.to_string())
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg("-singlefile")
            .arg("-png")
            .arg(document)
            .arg(&output_root)
            .output()
            .with_context(|| format!("failed to execute {} for {}", self.program, document.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} returned non-zero exit status for {} page {}: {}",
                self.program,
                document.display(),
                page_number,
                stderr.trim()
            );
        }

        if !png_path.exists() {
            bail!(
                "{} did not produce expected image for {} page {}",
                self.program,
                document.display(),
                page_number
            );
        }

        Ok(png_path)
    }
}

impl PageRenderer for PopplerRenderer {
    fn render_pages(&self, document: &Path, scratch_dir: &Path) -> Result<Vec<PageImage>> {
        let page_count = pdf_page_count(document)?;
        if page_count == 0 {
            warn!(document = %document.display(), "document has no pages");
            return Ok(Vec::new());
        }

        if !command_available(&self.program) {
            bail!(
                "{} is required to render pages but was not found on PATH",
                self.program
            );
        }

        ensure_directory(scratch_dir)?;
        info!(document = %document.display(), pages = page_count, dpi = self.dpi, "rendering pages");

        let mut pages = Vec::<PageImage>::with_capacity(page_count);
        for index in 0..page_count {
            let raster = match self.render_page(document, index, scratch_dir) {
                Ok(path) => {
                    debug!(page = index, path = %path.display(), "page rendered");
                    Some(path)
                }
                Err(err) => {
                    warn!(page = index, error = %err, "page render failed; treating as continuation page");
                    None
                }
            };
            pages.push(PageImage { index, raster });
        }

        Ok(pages)
    }
}

pub fn pdf_page_count(document: &Path) -> Result<usize> {
    if !document.is_file() {
        bail!("document not found: {}", document.display());
    }

    let loaded = lopdf::Document::load(document)
        .with_context(|| format!("failed to read PDF {}", document.display()))?;
    Ok(loaded.get_pages().len())
}

pub fn command_available(program: &str) -> bool {
    Command::new(program).arg("-v").output().is_ok()
}
