use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, warn};

use super::extract::TextBackend;
use super::render::PageImage;
use crate::model::Segment;
use crate::settings::SegmenterSettings;

pub trait FrontPageClassifier {
    /// Front-page likelihood in `[0, 1]`.
    fn score(&self, page: &PageImage) -> Result<f64>;
    fn threshold(&self) -> f64;
}

/// Scores a page by identity-keyword density near the top of its OCR text.
pub struct KeywordClassifier {
    backend: Arc<dyn TextBackend>,
    patterns: Vec<Regex>,
    scan_lines: usize,
    top_lines: usize,
    threshold: f64,
}

impl KeywordClassifier {
    pub fn new(backend: Arc<dyn TextBackend>, settings: &SegmenterSettings) -> Result<Self> {
        let patterns = keyword_patterns(&settings.keywords)?;
        Ok(Self {
            backend,
            patterns,
            scan_lines: settings.scan_lines,
            top_lines: settings.top_lines,
            threshold: settings.front_page_threshold,
        })
    }
}

impl FrontPageClassifier for KeywordClassifier {
    fn score(&self, page: &PageImage) -> Result<f64> {
        let text = self.backend.extract_text(page)?;
        Ok(keyword_score(
            &text,
            &self.patterns,
            self.scan_lines,
            self.top_lines,
        ))
    }

    fn threshold(&self) -> f64 {
        self.threshold
    }
}

pub fn keyword_patterns(keywords: &[String]) -> Result<Vec<Regex>> {
    keywords
        .iter()
        .map(|keyword| {
            let body = keyword
                .split_whitespace()
                .map(regex::escape)
                .collect::<Vec<String>>()
                .join(r"\s+");
            Regex::new(&format!(r"(?i)\b{body}\b"))
                .with_context(|| format!("invalid segmenter keyword '{keyword}'"))
        })
        .collect()
}

/// `min((hits + 0.5 * top_hits) / (keywords + 5), 1)` over the first
/// `scan_lines` non-empty lines; `top_hits` counts hits in the first
/// `top_lines` of those.
pub fn keyword_score(text: &str, patterns: &[Regex], scan_lines: usize, top_lines: usize) -> f64 {
    if patterns.is_empty() {
        return 0.0;
    }

    let mut hits = 0_usize;
    let mut top_hits = 0_usize;
    for (line_index, line) in text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(scan_lines)
        .enumerate()
    {
        let line_hits = patterns
            .iter()
            .filter(|pattern| pattern.is_match(line))
            .count();
        hits += line_hits;
        if line_index < top_lines {
            top_hits += line_hits;
        }
    }

    let raw = (hits as f64 + 0.5 * top_hits as f64) / (patterns.len() as f64 + 5.0);
    raw.min(1.0)
}

/// Classification failures and missing rasters count as continuation pages.
pub fn is_front_page(page: &PageImage, classifier: &dyn FrontPageClassifier) -> bool {
    if page.raster.is_none() {
        debug!(page = page.index, "page has no raster; continuation page");
        return false;
    }

    match classifier.score(page) {
        Ok(score) => {
            let front = score >= classifier.threshold();
            debug!(page = page.index, score, front, "page classified");
            front
        }
        Err(err) => {
            warn!(page = page.index, error = %err, "page classification failed; continuation page");
            false
        }
    }
}

/// Builds the page partition from per-page front-page flags. Page 0 always
/// opens a segment.
pub fn segments_from_front_pages(front_pages: &[bool]) -> Vec<Segment> {
    let page_count = front_pages.len();
    if page_count == 0 {
        return Vec::new();
    }

    let mut starts = vec![0_usize];
    starts.extend(
        front_pages
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, front)| **front)
            .map(|(index, _)| index),
    );

    starts
        .iter()
        .enumerate()
        .map(|(position, start)| {
            let end = starts
                .get(position + 1)
                .map(|next| next - 1)
                .unwrap_or(page_count - 1);
            Segment::new(*start, end)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    use anyhow::bail;

    use super::*;

    fn segment_pages(pages: &[PageImage], classifier: &dyn FrontPageClassifier) -> Vec<Segment> {
        let flags = pages
            .iter()
            .map(|page| is_front_page(page, classifier))
            .collect::<Vec<bool>>();
        segments_from_front_pages(&flags)
    }

    struct FixedClassifier {
        front: BTreeSet<usize>,
        failing: BTreeSet<usize>,
    }

    impl FrontPageClassifier for FixedClassifier {
        fn score(&self, page: &PageImage) -> Result<f64> {
            if self.failing.contains(&page.index) {
                bail!("classifier unavailable");
            }
            Ok(if self.front.contains(&page.index) { 0.9 } else { 0.1 })
        }

        fn threshold(&self) -> f64 {
            0.5
        }
    }

    fn pages(count: usize) -> Vec<PageImage> {
        (0..count)
            .map(|index| PageImage {
                index,
                raster: Some(PathBuf::from(format!("page_{index}.png"))),
            })
            .collect()
    }

    fn classifier(front: &[usize]) -> FixedClassifier {
        FixedClassifier {
            front: front.iter().copied().collect(),
            failing: BTreeSet::new(),
        }
    }

    #[test]
    fn front_pages_zero_and_three_of_six() {
        let segments = segment_pages(&pages(6), &classifier(&[0, 3]));
        assert_eq!(segments, vec![Segment::new(0, 2), Segment::new(3, 5)]);
    }

    #[test]
    fn no_front_pages_yields_one_segment() {
        let segments = segment_pages(&pages(4), &classifier(&[]));
        assert_eq!(segments, vec![Segment::new(0, 3)]);
    }

    #[test]
    fn adjacent_front_pages_yield_single_page_segments() {
        let segments = segment_pages(&pages(3), &classifier(&[0, 1, 2]));
        assert_eq!(
            segments,
            vec![Segment::new(0, 0), Segment::new(1, 1), Segment::new(2, 2)]
        );
    }

    #[test]
    fn zero_pages_yield_zero_segments() {
        assert!(segment_pages(&[], &classifier(&[0])).is_empty());
    }

    #[test]
    fn failed_or_missing_pages_are_continuations() {
        let mut input = pages(5);
        input[2].raster = None;
        let classifier = FixedClassifier {
            front: [0, 2, 4].into_iter().collect(),
            failing: [4].into_iter().collect(),
        };

        let segments = segment_pages(&input, &classifier);
        assert_eq!(segments, vec![Segment::new(0, 4)]);
    }

    #[test]
    fn every_flag_pattern_partitions_all_pages() {
        for page_count in 0..=8_usize {
            for mask in 0..(1_u32 << page_count) {
                let flags = (0..page_count)
                    .map(|index| mask & (1 << index) != 0)
                    .collect::<Vec<bool>>();
                let segments = segments_from_front_pages(&flags);

                let mut expected_start = 0;
                for segment in &segments {
                    assert_eq!(segment.start_page, expected_start);
                    assert!(segment.end_page >= segment.start_page);
                    expected_start = segment.end_page + 1;
                }
                assert_eq!(expected_start, page_count);

                let expected_segments = if page_count == 0 {
                    0
                } else {
                    1 + flags.iter().skip(1).filter(|flag| **flag).count()
                };
                assert_eq!(segments.len(), expected_segments);
            }
        }
    }

    #[test]
    fn keyword_score_rewards_labels_near_the_top() {
        let patterns = keyword_patterns(
            &crate::settings::SegmenterSettings::default().keywords,
        )
        .expect("patterns");

        let front = "Name: Alice Smith\nStudent ID: 101\nMidterm";
        let score = keyword_score(front, &patterns, 10, 5);
        // "name" once, "id" and "student id" on line two: (3 + 1.5) / 12.
        assert!((score - 0.375).abs() < 1e-9, "score was {score}");
        assert!(score >= 0.25);

        let continuation = "3. Explain the identity of the name server.";
        assert!(keyword_score(continuation, &patterns, 10, 5) < 0.25);
        assert_eq!(keyword_score("", &patterns, 10, 5), 0.0);
    }

    #[test]
    fn keyword_score_ignores_lines_past_the_scan_window() {
        let patterns = keyword_patterns(&["name".to_string()]).expect("patterns");
        let text = "a\nb\nc\nName: late";
        assert_eq!(keyword_score(text, &patterns, 3, 2), 0.0);
        assert!(keyword_score(text, &patterns, 4, 2) > 0.0);
    }
}
