//! Vector similarity and retrieval-quality metrics.
//!
//! Pure functions over `f32` vectors plus the ranking metrics used to tune
//! and evaluate retrieval: precision/recall/F1 at a threshold, threshold
//! optimisation, reranking, MRR, and NDCG@k.

use serde::Serialize;

use crate::error::{IndexError, IndexResult, ValidationReport};

/// Cosine similarity. Returns 0.0 for mismatched lengths or a zero vector.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    (dot / denom).clamp(-1.0, 1.0)
}

fn same_dims(a: &[f32], b: &[f32]) -> IndexResult<()> {
    if a.len() == b.len() {
        return Ok(());
    }
    let mut report = ValidationReport::new();
    report.error(
        format!("vector dimensions differ: {} vs {}", a.len(), b.len()),
        "Compare vectors from the same embedding model",
    );
    Err(IndexError::Validation(report))
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> IndexResult<f32> {
    same_dims(a, b)?;
    Ok(a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt())
}

pub fn manhattan_distance(a: &[f32], b: &[f32]) -> IndexResult<f32> {
    same_dims(a, b)?;
    Ok(a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum())
}

pub fn dot_product(a: &[f32], b: &[f32]) -> IndexResult<f32> {
    same_dims(a, b)?;
    Ok(a.iter().zip(b.iter()).map(|(x, y)| x * y).sum())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimilarityMetric {
    #[default]
    Cosine,
    Euclidean,
    Manhattan,
    Dot,
}

impl SimilarityMetric {
    /// Higher is more similar for every metric; distances map to
    /// `1 / (1 + d)`. Vectors of different lengths are a validation error
    /// for every metric except cosine, which scores them 0.0.
    pub fn score(&self, a: &[f32], b: &[f32]) -> IndexResult<f32> {
        Ok(match self {
            SimilarityMetric::Cosine => cosine_similarity(a, b),
            SimilarityMetric::Euclidean => 1.0 / (1.0 + euclidean_distance(a, b)?),
            SimilarityMetric::Manhattan => 1.0 / (1.0 + manhattan_distance(a, b)?),
            SimilarityMetric::Dot => dot_product(a, b)?,
        })
    }
}

/// Score `query` against every candidate, preserving candidate order.
pub fn batch_similarity<V: AsRef<[f32]>>(
    query: &[f32],
    candidates: &[V],
    metric: SimilarityMetric,
) -> IndexResult<Vec<f32>> {
    candidates
        .iter()
        .map(|c| metric.score(query, c.as_ref()))
        .collect()
}

/// Indices and cosine scores of the `k` best candidates, best first.
pub fn top_k<V: AsRef<[f32]>>(query: &[f32], candidates: &[V], k: usize) -> Vec<(usize, f32)> {
    let mut scored: Vec<(usize, f32)> = candidates
        .iter()
        .map(|c| cosine_similarity(query, c.as_ref()))
        .enumerate()
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k);
    scored
}

/// Min-max normalize scores to [0, 1]. Equal scores all map to 1.0.
pub fn normalize_scores(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }
    let min = scores.iter().copied().fold(f32::INFINITY, f32::min);
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    scores
        .iter()
        .map(|s| {
            if (max - min).abs() < f32::EPSILON {
                1.0
            } else {
                (s - min) / (max - min)
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct RetrievalMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// Treat `score >= threshold` as a positive prediction and compare with
/// the ground-truth `relevant` labels.
pub fn precision_recall_f1(scores: &[f32], relevant: &[bool], threshold: f32) -> RetrievalMetrics {
    let mut tp = 0usize;
    let mut fp = 0usize;
    let mut fn_ = 0usize;
    for (score, rel) in scores.iter().zip(relevant.iter()) {
        match (*score >= threshold, *rel) {
            (true, true) => tp += 1,
            (true, false) => fp += 1,
            (false, true) => fn_ += 1,
            (false, false) => {}
        }
    }

    let precision = if tp + fp == 0 {
        0.0
    } else {
        tp as f64 / (tp + fp) as f64
    };
    let recall = if tp + fn_ == 0 {
        0.0
    } else {
        tp as f64 / (tp + fn_) as f64
    };
    let f1 = if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    };
    RetrievalMetrics {
        precision,
        recall,
        f1,
    }
}

/// Sweep thresholds 0.1..=0.9 in steps of 0.1 and return the one with the
/// best F1. Ties keep the lower threshold.
pub fn optimize_threshold(scores: &[f32], relevant: &[bool]) -> (f32, RetrievalMetrics) {
    let mut best = (0.1f32, precision_recall_f1(scores, relevant, 0.1));
    for step in 2..=9 {
        let threshold = step as f32 / 10.0;
        let metrics = precision_recall_f1(scores, relevant, threshold);
        if metrics.f1 > best.1.f1 {
            best = (threshold, metrics);
        }
    }
    best
}

const INITIAL_WEIGHT: f32 = 0.6;
const COSINE_WEIGHT: f32 = 0.4;

/// Blend each candidate's initial score with fresh cosine similarity
/// (60/40) and return candidate indices, best first.
pub fn rerank<V: AsRef<[f32]>>(query: &[f32], candidates: &[V], initial_scores: &[f32]) -> Vec<usize> {
    let mut blended: Vec<(usize, f32)> = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let initial = initial_scores.get(i).copied().unwrap_or(0.0);
            (
                i,
                INITIAL_WEIGHT * initial + COSINE_WEIGHT * cosine_similarity(query, c.as_ref()),
            )
        })
        .collect();
    blended.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    blended.into_iter().map(|(i, _)| i).collect()
}

/// `1 / rank` of the first relevant result, 0.0 when none is relevant.
pub fn reciprocal_rank(relevant_in_rank_order: &[bool]) -> f64 {
    relevant_in_rank_order
        .iter()
        .position(|r| *r)
        .map(|i| 1.0 / (i + 1) as f64)
        .unwrap_or(0.0)
}

pub fn mean_reciprocal_rank(queries: &[Vec<bool>]) -> f64 {
    if queries.is_empty() {
        return 0.0;
    }
    queries.iter().map(|q| reciprocal_rank(q)).sum::<f64>() / queries.len() as f64
}

fn dcg(gains: &[f64]) -> f64 {
    gains
        .iter()
        .enumerate()
        .map(|(i, g)| g / ((i + 2) as f64).log2())
        .sum()
}

/// NDCG@k over graded relevances listed in ranked order.
pub fn ndcg_at_k(relevances: &[f64], k: usize) -> f64 {
    let k = k.min(relevances.len());
    if k == 0 {
        return 0.0;
    }
    let actual = dcg(&relevances[..k]);

    let mut ideal = relevances.to_vec();
    ideal.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let best = dcg(&ideal[..k]);

    if best <= 0.0 {
        0.0
    } else {
        (actual / best).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_bounds_and_zero_vector() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);

        let a = [0.3, -0.7, 2.5, 0.01];
        let b = [-4.0, 0.2, 0.9, 3.3];
        let s = cosine_similarity(&a, &b);
        assert!((-1.0..=1.0).contains(&s));
    }

    #[test]
    fn test_distances() {
        assert!((euclidean_distance(&[0.0, 0.0], &[3.0, 4.0]).unwrap() - 5.0).abs() < 1e-6);
        assert!((manhattan_distance(&[0.0, 0.0], &[3.0, -4.0]).unwrap() - 7.0).abs() < 1e-6);
        assert!((dot_product(&[1.0, 2.0], &[3.0, 4.0]).unwrap() - 11.0).abs() < 1e-6);
    }

    #[test]
    fn test_mismatched_lengths_are_rejected_not_truncated() {
        let short = [3.0];
        let long = [0.0, 4.0];
        for result in [
            euclidean_distance(&short, &long),
            manhattan_distance(&short, &long),
            dot_product(&short, &long),
        ] {
            assert!(matches!(result, Err(IndexError::Validation(_))));
        }

        let candidates = vec![vec![1.0, 0.0], vec![1.0]];
        assert!(batch_similarity(&[1.0, 0.0], &candidates, SimilarityMetric::Manhattan).is_err());
        let cosine = batch_similarity(&[1.0, 0.0], &candidates, SimilarityMetric::Cosine).unwrap();
        assert_eq!(cosine[1], 0.0);
    }

    #[test]
    fn test_batch_and_top_k() {
        let candidates = vec![vec![0.0, 1.0], vec![1.0, 0.0], vec![0.7, 0.7]];
        let scores =
            batch_similarity(&[1.0, 0.0], &candidates, SimilarityMetric::Euclidean).unwrap();
        assert_eq!(scores.len(), 3);
        assert!((scores[1] - 1.0).abs() < 1e-6);

        let best = top_k(&[1.0, 0.0], &candidates, 2);
        assert_eq!(best.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_normalize_scores() {
        assert!(normalize_scores(&[]).is_empty());
        assert_eq!(normalize_scores(&[0.5, 0.5]), vec![1.0, 1.0]);
        assert_eq!(normalize_scores(&[1.0, 3.0, 2.0]), vec![0.0, 1.0, 0.5]);
    }

    #[test]
    fn test_precision_recall_f1() {
        let m = precision_recall_f1(&[0.9, 0.8, 0.2, 0.1], &[true, false, true, false], 0.5);
        assert!((m.precision - 0.5).abs() < 1e-9);
        assert!((m.recall - 0.5).abs() < 1e-9);
        assert!((m.f1 - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_optimize_threshold_picks_best_f1() {
        let scores = [0.95, 0.85, 0.75, 0.45, 0.35, 0.15];
        let labels = [true, true, true, false, false, false];
        let (threshold, metrics) = optimize_threshold(&scores, &labels);
        assert!((metrics.f1 - 1.0).abs() < 1e-9);
        assert!(threshold > 0.45 && threshold <= 0.75);
    }

    #[test]
    fn test_rerank_blends_scores() {
        let candidates = vec![vec![0.0, 1.0], vec![1.0, 0.0]];
        // Equal initial scores: cosine decides.
        assert_eq!(rerank(&[1.0, 0.0], &candidates, &[0.5, 0.5]), vec![1, 0]);
        // A large initial lead outweighs the 40% cosine share.
        assert_eq!(rerank(&[1.0, 0.0], &candidates, &[1.0, 0.0]), vec![0, 1]);
    }

    #[test]
    fn test_reciprocal_rank_and_mrr() {
        assert_eq!(reciprocal_rank(&[false, false, true]), 1.0 / 3.0);
        assert_eq!(reciprocal_rank(&[false, false]), 0.0);
        let mrr = mean_reciprocal_rank(&[vec![true], vec![false, true]]);
        assert!((mrr - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_ndcg_bounds() {
        assert!((ndcg_at_k(&[3.0, 2.0, 1.0], 3) - 1.0).abs() < 1e-9);
        let reversed = ndcg_at_k(&[1.0, 2.0, 3.0], 3);
        assert!(reversed > 0.0 && reversed < 1.0);
        assert_eq!(ndcg_at_k(&[0.0, 0.0], 2), 0.0);
        assert_eq!(ndcg_at_k(&[], 5), 0.0);
    }
}
