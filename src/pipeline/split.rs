use std::cell::RefCell;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use lopdf::Document;
use tracing::{info, warn};

use crate::model::{MatchResult, OutputDocument, RosterEntry, Segment};
use crate::util::ensure_directory;

pub const UNKNOWN_ID: &str = "UNKNOWN";
pub const UNMATCHED_NAME: &str = "UNMATCHED";

/// Opaque "copy this page range into a new document" capability.
pub trait PageRangeExtractor {
    fn page_count(&self, document: &Path) -> Result<usize>;

    /// Writes pages `start..=end` (0-based) of `document` to `destination`.
    fn extract_subrange(
        &self,
        document: &Path,
        start: usize,
        end: usize,
        destination: &Path,
    ) -> Result<()>;
}

/// Page-range extraction with `lopdf`. The parsed source is cached so a
/// run with many segments parses the combined scan once.
#[derive(Default)]
pub struct LopdfExtractor {
    cache: RefCell<Option<(PathBuf, Document)>>,
}

impl LopdfExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    fn loaded(&self, document: &Path) -> Result<Document> {
        let mut cache = self.cache.borrow_mut();
        if let Some((path, loaded)) = cache.as_ref()
            && path == document
        {
            return Ok(loaded.clone());
        }

        let loaded = Document::load(document)
            .with_context(|| format!("failed to read PDF {}", document.display()))?;
        *cache = Some((document.to_path_buf(), loaded.clone()));
        Ok(loaded)
    }
}

impl PageRangeExtractor for LopdfExtractor {
    fn page_count(&self, document: &Path) -> Result<usize> {
        Ok(self.loaded(document)?.get_pages().len())
    }

    fn extract_subrange(
        &self,
        document: &Path,
        start: usize,
        end: usize,
        destination: &Path,
    ) -> Result<()> {
        let mut subset = self.loaded(document)?;
        let page_count = subset.get_pages().len();
        if start > end || end >= page_count {
            bail!(
                "page range {start}..={end} is outside {} ({page_count} pages)",
                document.display()
            );
        }

        let outside = (1..=page_count as u32)
            .filter(|number| {
                let index = (*number - 1) as usize;
                index < start || index > end
            })
            .collect::<Vec<u32>>();
        subset.delete_pages(&outside);
        subset.prune_objects();

        subset
            .save(destination)
            .with_context(|| format!("failed to write {}", destination.display()))?;
        Ok(())
    }
}

/// Strips filesystem-unsafe characters and joins words with `_`. Returns an
/// empty string when nothing usable is left.
pub fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .filter(|character| {
            character.is_alphanumeric()
                || character.is_whitespace()
                || matches!(character, '-' | '_' | '.')
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join("_")
        .trim_matches(|character| character == '.' || character == '_')
        .to_string()
}

/// `{matched id or UNKNOWN}-{matched name, raw name or UNMATCHED}`.
pub fn output_stem(result: &MatchResult, roster: &[RosterEntry]) -> String {
    let entry = result.matched_entry.and_then(|index| roster.get(index));

    let id = entry
        .map(|entry| sanitize_component(&entry.external_id))
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| UNKNOWN_ID.to_string());

    let name_source = entry
        .map(|entry| entry.display_name.as_str())
        .unwrap_or(result.identity.raw_name.as_str());
    let name = Some(sanitize_component(name_source))
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| UNMATCHED_NAME.to_string());

    format!("{id}-{name}")
}

/// Unique `.pdf` names in input order; repeats get `_2`, `_3`, ... suffixes.
/// Comparison is case-insensitive.
pub fn assign_file_names(stems: &[String]) -> Vec<String> {
    let mut used = HashSet::<String>::new();
    let mut names = Vec::<String>::with_capacity(stems.len());

    for stem in stems {
        let mut candidate = format!("{stem}.pdf");
        let mut suffix = 2_usize;
        while used.contains(&candidate.to_lowercase()) {
            candidate = format!("{stem}_{suffix}.pdf");
            suffix += 1;
        }
        used.insert(candidate.to_lowercase());
        names.push(candidate);
    }

    names
}

#[derive(Debug, Clone)]
pub struct SplitFailure {
    pub segment_index: usize,
    pub segment: Segment,
    pub file_name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct SplitOutcome {
    pub documents: Vec<OutputDocument>,
    pub failures: Vec<SplitFailure>,
}

impl SplitOutcome {
    pub fn document_for(&self, segment_index: usize) -> Option<&OutputDocument> {
        self.documents
            .iter()
            .find(|document| document.segment_index == segment_index)
    }

    pub fn failure_for(&self, segment_index: usize) -> Option<&SplitFailure> {
        self.failures
            .iter()
            .find(|failure| failure.segment_index == segment_index)
    }
}

/// Removes previous `.pdf` outputs so a retried job reproduces the same
/// file names.
pub fn clear_previous_outputs(output_dir: &Path) -> Result<usize> {
    if !output_dir.exists() {
        return Ok(0);
    }

    let mut removed = 0_usize;
    for entry in fs::read_dir(output_dir)
        .with_context(|| format!("failed to list {}", output_dir.display()))?
    {
        let path = entry
            .with_context(|| format!("failed to list {}", output_dir.display()))?
            .path();
        let is_pdf = path
            .extension()
            .and_then(|value| value.to_str())
            .is_some_and(|value| value.eq_ignore_ascii_case("pdf"));
        if path.is_file() && is_pdf {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}

pub fn split_segments(
    extractor: &dyn PageRangeExtractor,
    document: &Path,
    matches: &[MatchResult],
    roster: &[RosterEntry],
    output_dir: &Path,
) -> Result<SplitOutcome> {
    ensure_directory(output_dir)?;
    let removed = clear_previous_outputs(output_dir)?;
    if removed > 0 {
        info!(dir = %output_dir.display(), removed, "cleared previous split outputs");
    }

    let stems = matches
        .iter()
        .map(|result| output_stem(result, roster))
        .collect::<Vec<String>>();
    let file_names = assign_file_names(&stems);

    let mut outcome = SplitOutcome::default();
    for (segment_index, (result, file_name)) in matches.iter().zip(file_names).enumerate() {
        let segment = result.segment;
        let path = output_dir.join(&file_name);

        match extractor.extract_subrange(document, segment.start_page, segment.end_page, &path) {
            Ok(()) => {
                info!(
                    segment = segment_index,
                    start_page = segment.start_page,
                    end_page = segment.end_page,
                    file = %file_name,
                    "split document written"
                );
                outcome.documents.push(OutputDocument {
                    file_name,
                    path,
                    segment_index,
                    segment,
                    page_count: segment.page_count(),
                });
            }
            Err(err) => {
                warn!(segment = segment_index, file = %file_name, error = %err, "segment split failed");
                outcome.failures.push(SplitFailure {
                    segment_index,
                    segment,
                    file_name,
                    error: format!("{err:#}"),
                });
            }
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use lopdf::{Object, Stream, dictionary};

    use super::*;
    use crate::model::ExtractedIdentity;

    fn write_sample_pdf(path: &Path, pages: usize) {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();

        let mut kids = Vec::<Object>::new();
        for index in 0..pages {
            let content = format!("% page {index}").into_bytes();
            let content_id = doc.add_object(Stream::new(dictionary! {}, content));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(page_id.into());
        }

        let pages_dict = dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        };
        doc.objects.insert(pages_id, Object::Dictionary(pages_dict));
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc.save(path).expect("sample pdf should be written");
    }

    fn result(segment: Segment, matched_entry: Option<usize>, raw_name: &str) -> MatchResult {
        MatchResult {
            segment,
            identity: ExtractedIdentity {
                raw_name: raw_name.to_string(),
                raw_id: String::new(),
                confidence: 0.5,
                backend: None,
            },
            matched_entry,
            id_similarity: 0.0,
            name_similarity: 0.0,
            score: 0.0,
            uncertain: matched_entry.is_none(),
        }
    }

    #[test]
    fn sanitize_strips_unsafe_characters_and_collapses_whitespace() {
        assert_eq!(sanitize_component("  Alice   Smith "), "Alice_Smith");
        assert_eq!(sanitize_component("O'Brien/../etc"), "OBrien..etc");
        assert_eq!(sanitize_component("a:b*c?d"), "abcd");
        assert_eq!(sanitize_component("..."), "");
        assert_eq!(sanitize_component("José Núñez"), "José_Núñez");
    }

    #[test]
    fn stem_prefers_roster_identity_then_raw_name() {
        let roster = vec![RosterEntry::new("101", "Alice Smith")];
        assert_eq!(
            output_stem(&result(Segment::new(0, 1), Some(0), "Alise"), &roster),
            "101-Alice_Smith"
        );
        assert_eq!(
            output_stem(&result(Segment::new(0, 1), None, "Bob Jones"), &roster),
            "UNKNOWN-Bob_Jones"
        );
        assert_eq!(
            output_stem(&result(Segment::new(0, 1), None, ""), &roster),
            "UNKNOWN-UNMATCHED"
        );
    }

    #[test]
    fn colliding_names_get_numeric_suffixes() {
        let stems = vec![
            "UNKNOWN-UNMATCHED".to_string(),
            "101-Alice".to_string(),
            "unknown-unmatched".to_string(),
            "UNKNOWN-UNMATCHED".to_string(),
            "UNKNOWN-UNMATCHED_2".to_string(),
        ];
        let names = assign_file_names(&stems);
        assert_eq!(
            names,
            vec![
                "UNKNOWN-UNMATCHED.pdf",
                "101-Alice.pdf",
                "unknown-unmatched_2.pdf",
                "UNKNOWN-UNMATCHED_3.pdf",
                "UNKNOWN-UNMATCHED_2_2.pdf",
            ]
        );

        let unique = names
            .iter()
            .map(|name| name.to_lowercase())
            .collect::<HashSet<String>>();
        assert_eq!(unique.len(), names.len());
    }

    #[test]
    fn lopdf_extracts_inclusive_page_range() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("combined.pdf");
        write_sample_pdf(&source, 5);

        let extractor = LopdfExtractor::new();
        assert_eq!(extractor.page_count(&source).expect("page count"), 5);

        let destination = dir.path().join("part.pdf");
        extractor
            .extract_subrange(&source, 1, 3, &destination)
            .expect("subrange");

        let part = Document::load(&destination).expect("part loads");
        assert_eq!(part.get_pages().len(), 3);

        let again = dir.path().join("last.pdf");
        extractor
            .extract_subrange(&source, 4, 4, &again)
            .expect("last page");
        assert_eq!(Document::load(&again).expect("loads").get_pages().len(), 1);
    }

    #[test]
    fn lopdf_rejects_out_of_range_pages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("combined.pdf");
        write_sample_pdf(&source, 2);

        let extractor = LopdfExtractor::new();
        let err = extractor
            .extract_subrange(&source, 1, 2, &dir.path().join("bad.pdf"))
            .expect_err("range past the end");
        assert!(err.to_string().contains("outside"));
    }

    #[test]
    fn split_skips_failed_segments_and_clears_old_outputs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("combined.pdf");
        write_sample_pdf(&source, 4);

        let output_dir = dir.path().join("split-documents");
        fs::create_dir_all(&output_dir).expect("dir");
        fs::write(output_dir.join("stale.pdf"), b"old").expect("stale file");
        fs::write(output_dir.join("notes.txt"), b"keep").expect("other file");

        let roster = vec![RosterEntry::new("101", "Alice Smith")];
        let matches = vec![
            result(Segment::new(0, 1), Some(0), ""),
            result(Segment::new(2, 3), None, ""),
            result(Segment::new(4, 6), None, ""),
        ];

        let extractor = LopdfExtractor::new();
        let outcome = split_segments(&extractor, &source, &matches, &roster, &output_dir)
            .expect("split runs");

        let names = outcome
            .documents
            .iter()
            .map(|document| document.file_name.as_str())
            .collect::<Vec<&str>>();
        assert_eq!(names, vec!["101-Alice_Smith.pdf", "UNKNOWN-UNMATCHED.pdf"]);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].file_name, "UNKNOWN-UNMATCHED_2.pdf");
        assert!(outcome.failure_for(2).is_some());
        assert!(!output_dir.join("stale.pdf").exists());
        assert!(output_dir.join("notes.txt").exists());
        assert_eq!(outcome.document_for(1).map(|document| document.page_count), Some(2));
    }
}
