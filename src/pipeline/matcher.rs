use std::sync::Arc;

use strsim::normalized_levenshtein;
use tracing::debug;

use crate::model::{ExtractedIdentity, MatchResult, RosterEntry, Segment};
use crate::semantic::{NAME_EMBEDDING_BACKEND, name_embedding_similarity};
use crate::settings::MatcherSettings;

const SCORE_EPSILON: f64 = 1e-9;

/// Optional semantic capability for comparing names. The matcher keeps the
/// larger of this and the edit-distance ratio.
pub trait NameSimilarity: Send + Sync {
    fn label(&self) -> &str;
    fn similarity(&self, left: &str, right: &str) -> f64;
}

pub struct LocalHashNameSimilarity;

impl NameSimilarity for LocalHashNameSimilarity {
    fn label(&self) -> &str {
        NAME_EMBEDDING_BACKEND
    }

    fn similarity(&self, left: &str, right: &str) -> f64 {
        name_embedding_similarity(left, right)
    }
}

/// Normalized edit-distance ratio on trimmed, lower-cased text. Blank input
/// on either side scores 0.
pub fn text_similarity(left: &str, right: &str) -> f64 {
    let left = left.trim().to_lowercase();
    let right = right.trim().to_lowercase();
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    normalized_levenshtein(&left, &right)
}

pub fn round_score(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

pub struct Matcher {
    settings: MatcherSettings,
    name_similarity: Option<Arc<dyn NameSimilarity>>,
}

struct Candidate {
    index: usize,
    id_similarity: f64,
    name_similarity: f64,
    score: f64,
}

impl Matcher {
    pub fn new(settings: &MatcherSettings, name_similarity: Option<Arc<dyn NameSimilarity>>) -> Self {
        Self {
            settings: settings.clone(),
            name_similarity,
        }
    }

    pub fn name_similarity(&self, raw_name: &str, display_name: &str) -> f64 {
        let edit = text_similarity(raw_name, display_name);
        match self.name_similarity.as_ref() {
            Some(semantic) => edit.max(semantic.similarity(raw_name, display_name).clamp(0.0, 1.0)),
            None => edit,
        }
    }

    /// Weighted blend of the two similarities, clamped to `[0, 1]`.
    /// Non-decreasing in each argument while the weights are non-negative.
    pub fn combined_score(&self, id_similarity: f64, name_similarity: f64) -> f64 {
        (self.settings.id_weight * id_similarity + self.settings.name_weight * name_similarity)
            .clamp(0.0, 1.0)
    }

    pub fn match_identity(
        &self,
        segment: Segment,
        identity: &ExtractedIdentity,
        roster: &[RosterEntry],
    ) -> MatchResult {
        let mut best: Option<Candidate> = None;

        for (index, entry) in roster.iter().enumerate() {
            let id_similarity = text_similarity(&identity.raw_id, &entry.external_id);
            let name_similarity = self.name_similarity(&identity.raw_name, &entry.display_name);
            let score = self.combined_score(id_similarity, name_similarity);

            let better = match best.as_ref() {
                None => true,
                Some(current) => {
                    score > current.score + SCORE_EPSILON
                        || ((score - current.score).abs() <= SCORE_EPSILON
                            && id_similarity > current.id_similarity + SCORE_EPSILON)
                }
            };
            if better {
                best = Some(Candidate {
                    index,
                    id_similarity,
                    name_similarity,
                    score,
                });
            }
        }

        let Some(best) = best else {
            return MatchResult {
                segment,
                identity: identity.clone(),
                matched_entry: None,
                id_similarity: 0.0,
                name_similarity: 0.0,
                score: 0.0,
                uncertain: true,
            };
        };

        let accepted = best.score + SCORE_EPSILON >= self.settings.acceptance_floor();
        let uncertain = !accepted || best.score + SCORE_EPSILON < self.settings.confident_threshold;

        debug!(
            start_page = segment.start_page,
            candidate = %roster[best.index].external_id,
            score = round_score(best.score),
            accepted,
            uncertain,
            "segment matched against roster"
        );

        MatchResult {
            segment,
            identity: identity.clone(),
            matched_entry: accepted.then_some(best.index),
            id_similarity: best.id_similarity,
            name_similarity: best.name_similarity,
            score: best.score,
            uncertain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> Matcher {
        Matcher::new(&MatcherSettings::default(), None)
    }

    fn identity(name: &str, id: &str, confidence: f64) -> ExtractedIdentity {
        ExtractedIdentity {
            raw_name: name.to_string(),
            raw_id: id.to_string(),
            confidence,
            backend: Some("test".to_string()),
        }
    }

    #[test]
    fn close_name_and_exact_id_is_confident_match() {
        let roster = vec![RosterEntry::new("101", "Alice Smith")];
        let result = matcher().match_identity(
            Segment::new(0, 2),
            &identity("Alice Smyth", "101", 0.9),
            &roster,
        );

        assert_eq!(result.matched_entry, Some(0));
        assert_eq!(result.id_similarity, 1.0);
        assert!((result.name_similarity - 0.9091).abs() < 1e-3);
        assert!((result.score - 0.9727).abs() < 1e-3);
        assert!(!result.uncertain);
    }

    #[test]
    fn blank_identity_is_unmatched_and_uncertain() {
        let roster = vec![
            RosterEntry::new("101", "Alice Smith"),
            RosterEntry::new("102", "Bob Jones"),
        ];
        let result = matcher().match_identity(
            Segment::new(3, 5),
            &ExtractedIdentity::empty(),
            &roster,
        );

        assert_eq!(result.matched_entry, None);
        assert!(result.uncertain);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn empty_roster_is_unmatched() {
        let result =
            matcher().match_identity(Segment::new(0, 0), &identity("Alice", "101", 1.0), &[]);
        assert!(!result.is_matched());
        assert!(result.uncertain);
    }

    #[test]
    fn score_between_floor_and_confident_threshold_is_uncertain_match() {
        let roster = vec![RosterEntry::new("12345", "Dana Scully")];
        // id 4/5 similar, name absent: 0.7 * 0.8 = 0.56 is below the floor.
        let below = matcher().match_identity(Segment::new(0, 0), &identity("", "12346", 1.0), &roster);
        assert!(!below.is_matched());

        // id exact, name absent: 0.7 is accepted but not confident.
        let accepted =
            matcher().match_identity(Segment::new(0, 0), &identity("", "12345", 1.0), &roster);
        assert_eq!(accepted.matched_entry, Some(0));
        assert!(accepted.uncertain);
    }

    #[test]
    fn ties_prefer_higher_id_similarity_then_roster_order() {
        let settings = MatcherSettings {
            id_weight: 0.5,
            name_weight: 0.5,
            id_threshold: 0.4,
            name_threshold: 0.4,
            ..MatcherSettings::default()
        };
        let matcher = Matcher::new(&settings, None);
        let roster = vec![
            RosterEntry::new("999", "Ann Lee"),
            RosterEntry::new("100", "Qx"),
        ];
        // Entry 0: id 0, name 1 -> 0.5. Entry 1: id 1, name 0 -> 0.5.
        let result = matcher.match_identity(Segment::new(0, 0), &identity("Ann Lee", "100", 1.0), &roster);
        assert_eq!(result.matched_entry, Some(1));

        let duplicates = vec![
            RosterEntry::new("100", "Ann Lee"),
            RosterEntry::new("100", "Ann Lee"),
        ];
        let result =
            matcher.match_identity(Segment::new(0, 0), &identity("Ann Lee", "100", 1.0), &duplicates);
        assert_eq!(result.matched_entry, Some(0));
    }

    #[test]
    fn combined_score_is_monotonic_in_each_similarity() {
        let matcher = matcher();
        let steps = [0.0, 0.1, 0.35, 0.5, 0.8, 1.0];
        for &fixed in &steps {
            for pair in steps.windows(2) {
                assert!(matcher.combined_score(pair[1], fixed) >= matcher.combined_score(pair[0], fixed));
                assert!(matcher.combined_score(fixed, pair[1]) >= matcher.combined_score(fixed, pair[0]));
            }
        }
    }

    #[test]
    fn text_similarity_ignores_case_and_padding() {
        assert_eq!(text_similarity("  ALICE ", "alice"), 1.0);
        assert_eq!(text_similarity("", "alice"), 0.0);
        assert_eq!(text_similarity("alice", "   "), 0.0);
    }

    #[test]
    fn semantic_similarity_rescues_reordered_names() {
        let roster = vec![RosterEntry::new("555", "Jane Doe")];
        let plain = matcher().match_identity(Segment::new(0, 0), &identity("Doe Jane", "", 1.0), &roster);

        let semantic: Arc<dyn NameSimilarity> = Arc::new(LocalHashNameSimilarity);
        let boosted = Matcher::new(&MatcherSettings::default(), Some(semantic))
            .match_identity(Segment::new(0, 0), &identity("Doe Jane", "", 1.0), &roster);

        assert!(boosted.name_similarity > plain.name_similarity);
        assert!((boosted.name_similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn round_score_keeps_four_decimals() {
        assert_eq!(round_score(0.972_727), 0.9727);
        assert_eq!(round_score(1.0), 1.0);
    }
}
