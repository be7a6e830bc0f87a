//! Keyword pre-filtering and lightweight relevance scoring.
//!
//! Keyword overlap is the cheap first pass before any semantic ranking;
//! when the caller supplies a query embedding, cosine similarity against
//! entity embeddings sharpens the score.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;

lazy_static! {
    static ref TOKEN: Regex = Regex::new(r"[A-Za-z0-9_]+").unwrap();
}

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "in", "on", "of", "to", "and", "or", "for", "with",
    "what", "which", "how", "does", "do", "where", "who", "this", "that", "it",
];

/// Lowercased tokens with identifier splitting: `PaymentService` and
/// `payment_service` both yield `payment` and `service`.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for m in TOKEN.find_iter(text) {
        for part in split_identifier(m.as_str()) {
            let lower = part.to_lowercase();
            if lower.len() > 1 && !STOPWORDS.contains(&lower.as_str()) {
                tokens.push(lower);
            }
        }
    }
    tokens
}

fn split_identifier(word: &str) -> Vec<String> {
    let mut parts = Vec::new();
    for snake_part in word.split('_') {
        let mut current = String::new();
        for c in snake_part.chars() {
            if c.is_uppercase() && !current.is_empty() {
                parts.push(current.clone());
                current.clear();
            }
            current.push(c);
        }
        if !current.is_empty() {
            parts.push(current);
        }
    }
    // The unsplit word matters too: a query for "PaymentService" should
    // hit the exact identifier ahead of its halves.
    if parts.len() > 1 {
        parts.push(word.to_string());
    }
    parts
}

/// Fraction of query tokens found in the candidate text, in [0, 1].
pub fn keyword_overlap(query_tokens: &[String], text: &str) -> f64 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let candidate: HashSet<String> = tokenize(text).into_iter().collect();
    let hits = query_tokens
        .iter()
        .filter(|t| candidate.contains(*t))
        .count();
    hits as f64 / query_tokens.len() as f64
}

/// Standard cosine similarity, 0.0 on dimension mismatch or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += x as f64 * y as f64;
        norm_a += x as f64 * x as f64;
        norm_b += y as f64 * y as f64;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Keyword overlap, blended with cosine similarity when an embedding pair
/// is available.
pub fn match_score(
    query_tokens: &[String],
    text: &str,
    query_embedding: Option<&[f32]>,
    candidate_embedding: &[f32],
) -> f64 {
    let keyword = keyword_overlap(query_tokens, text);
    match query_embedding {
        Some(embedding) if !candidate_embedding.is_empty() => {
            let semantic = cosine_similarity(embedding, candidate_embedding).max(0.0);
            0.5 * keyword + 0.5 * semantic
        }
        _ => keyword,
    }
}
