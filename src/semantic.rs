use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub const NAME_EMBEDDING_DIM: usize = 256;
pub const NAME_EMBEDDING_BACKEND: &str = "local-hash-name-v1";

pub fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<&str>>().join(" ")
}

/// Order-insensitive hashed embedding of a personal name. Word tokens and
/// padded character trigrams share one signed feature space, so "Doe Jane"
/// and "Jane Doe" embed identically and small OCR slips keep most trigrams.
pub fn embed_name(name: &str, dimensions: usize) -> Vec<f32> {
    let dims = dimensions.max(8);
    let mut vector = vec![0_f32; dims];

    for feature in name_features(name) {
        let hash = stable_hash(&feature);
        let index = (hash as usize) % dims;
        let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        let weight = if feature.starts_with("w:") { 2.0 } else { 1.0 };
        vector[index] += sign * weight;
    }

    normalize_vector(&mut vector);
    vector
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f64 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }

    left.iter()
        .zip(right.iter())
        .map(|(left_value, right_value)| f64::from(*left_value) * f64::from(*right_value))
        .sum::<f64>()
}

/// Cosine between two name embeddings, clamped to `[0, 1]`. Blank input on
/// either side scores 0.
pub fn name_embedding_similarity(left: &str, right: &str) -> f64 {
    if left.trim().is_empty() || right.trim().is_empty() {
        return 0.0;
    }

    let left = embed_name(left, NAME_EMBEDDING_DIM);
    let right = embed_name(right, NAME_EMBEDDING_DIM);
    cosine_similarity(&left, &right).clamp(0.0, 1.0)
}

fn stable_hash(value: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

fn name_features(name: &str) -> Vec<String> {
    let normalized = normalize_whitespace(name);
    if normalized.is_empty() {
        return Vec::new();
    }

    let words = normalized
        .split(' ')
        .map(|value| {
            value
                .chars()
                .filter(|character| character.is_alphanumeric())
                .flat_map(char::to_lowercase)
                .collect::<String>()
        })
        .filter(|value| !value.is_empty())
        .collect::<Vec<String>>();

    let mut features = Vec::<String>::new();
    for word in &words {
        features.push(format!("w:{word}"));

        let padded = format!("^{word}$").chars().collect::<Vec<char>>();
        for window in padded.windows(3) {
            features.push(format!("t:{}", window.iter().collect::<String>()));
        }
    }
    features
}

fn normalize_vector(values: &mut [f32]) {
    let squared_norm = values
        .iter()
        .map(|value| f64::from(*value) * f64::from(*value))
        .sum::<f64>();

    if squared_norm <= 0.0 {
        return;
    }

    let norm = squared_norm.sqrt() as f32;
    if norm == 0.0 {
        return;
    }

    for value in values {
        *value /= norm;
    }
}
