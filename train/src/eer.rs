//! Cosine scoring and equal error rate.

use serde::{Deserialize, Serialize};

use crate::TrainError;

/// Cosine similarity in `[-1, 1]`, accumulated in f64. Zero when either
/// vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    (dot / denom).clamp(-1.0, 1.0) as f32
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EerReport {
    /// Equal error rate in `[0, 1]`.
    pub eer: f32,
    /// Score threshold where the false accept and false reject rates meet.
    pub threshold: f32,
    pub positives: usize,
    pub negatives: usize,
}

/// Computes the equal error rate of `scores`, higher meaning "same".
///
/// A trial is accepted when its score is at least the threshold. Rates
/// are evaluated at every distinct score plus a threshold above all
/// scores, and the crossing of FAR and FRR is linearly interpolated
/// between the two thresholds around it. A NaN or infinite score is
/// rejected with the index of its trial.
pub fn compute_eer(scores: &[f32], labels: &[bool]) -> Result<EerReport, TrainError> {
    if scores.len() != labels.len() {
        return Err(TrainError::Model(format!(
            "{} scores for {} trial labels",
            scores.len(),
            labels.len()
        )));
    }
    if let Some((trial, &score)) = scores.iter().enumerate().find(|(_, s)| !s.is_finite()) {
        return Err(TrainError::NonFiniteScore { trial, score });
    }
    let positives = labels.iter().filter(|&&l| l).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(TrainError::EmptyTrialSet {
            positives,
            negatives,
        });
    }

    let mut trials: Vec<(f32, bool)> = scores.iter().copied().zip(labels.iter().copied()).collect();
    trials.sort_by(|a, b| a.0.total_cmp(&b.0));

    // (threshold, far, frr), threshold ascending.
    let mut curve: Vec<(f64, f64, f64)> = Vec::new();
    let (np, nn) = (positives as f64, negatives as f64);
    let mut pos_below = 0usize;
    let mut neg_below = 0usize;
    let mut i = 0;
    while i < trials.len() {
        let score = trials[i].0;
        curve.push((
            score as f64,
            (negatives - neg_below) as f64 / nn,
            pos_below as f64 / np,
        ));
        while i < trials.len() && trials[i].0 == score {
            if trials[i].1 {
                pos_below += 1;
            } else {
                neg_below += 1;
            }
            i += 1;
        }
    }
    curve.push((f64::INFINITY, 0.0, 1.0));

    // FAR falls and FRR rises along the curve, and the last point has
    // FRR > FAR, so a crossing exists.
    let k = curve
        .iter()
        .position(|&(_, far, frr)| frr >= far)
        .unwrap_or(curve.len() - 1);
    let (theta_k, far_k, frr_k) = curve[k];
    let (eer, threshold) = if k == 0 {
        ((far_k + frr_k) / 2.0, theta_k)
    } else {
        let (theta_p, far_p, frr_p) = curve[k - 1];
        let dp = frr_p - far_p;
        let dk = frr_k - far_k;
        let t = -dp / (dk - dp);
        let eer = far_p + t * (far_k - far_p);
        let threshold = if theta_k.is_finite() {
            theta_p + t * (theta_k - theta_p)
        } else {
            theta_p
        };
        (eer, threshold)
    };

    Ok(EerReport {
        eer: eer as f32,
        threshold: threshold as f32,
        positives,
        negatives,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 2.0], &[-2.0, -4.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_perfect_separation() {
        let scores = [0.9, 0.8, 0.95, 0.1, 0.2, 0.3];
        let labels = [true, true, true, false, false, false];
        let r = compute_eer(&scores, &labels).unwrap();
        assert_eq!(r.eer, 0.0);
        assert!(r.threshold > 0.3 && r.threshold <= 0.8);
        assert_eq!((r.positives, r.negatives), (3, 3));
    }

    #[test]
    fn test_inverted_scores() {
        let scores = [0.1, 0.2, 0.9, 0.8];
        let labels = [true, true, false, false];
        let r = compute_eer(&scores, &labels).unwrap();
        assert!((r.eer - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_all_equal_scores() {
        let r = compute_eer(&[0.5; 4], &[true, false, true, false]).unwrap();
        assert!((r.eer - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_exact_crossing() {
        let scores = [0.6, 0.2, 0.4, 0.1];
        let labels = [true, true, false, false];
        let r = compute_eer(&scores, &labels).unwrap();
        assert!((r.eer - 0.5).abs() < 1e-6);
        assert!((r.threshold - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_interpolated_crossing() {
        let scores = [0.1, 0.3, 0.5, 0.7];
        let labels = [false, true, false, false];
        let r = compute_eer(&scores, &labels).unwrap();
        // at 0.3: far 2/3 frr 0; at 0.5: far 2/3 frr 1 -> t = 2/3
        let t = 2.0 / 3.0;
        assert!((r.eer as f64 - 2.0 / 3.0).abs() < 1e-6);
        assert!((r.threshold as f64 - (0.3 + 0.2 * t)).abs() < 1e-6);
    }

    #[test]
    fn test_single_class_rejected() {
        assert!(matches!(
            compute_eer(&[0.1, 0.2], &[true, true]),
            Err(TrainError::EmptyTrialSet { positives: 2, negatives: 0 })
        ));
        assert!(matches!(
            compute_eer(&[], &[]),
            Err(TrainError::EmptyTrialSet { .. })
        ));
    }

    #[test]
    fn test_non_finite_score_rejected() {
        assert!(matches!(
            compute_eer(&[0.2, f32::NAN, 0.7], &[false, true, true]),
            Err(TrainError::NonFiniteScore { trial: 1, .. })
        ));
        assert!(matches!(
            compute_eer(&[0.2, 0.4, f32::NEG_INFINITY], &[false, true, true]),
            Err(TrainError::NonFiniteScore { trial: 2, .. })
        ));
    }

    #[test]
    fn test_cosine_nan_input_is_nan() {
        assert!(cosine_similarity(&[f32::NAN, 1.0], &[1.0, 1.0]).is_nan());
    }

    #[test]
    fn test_order_independent() {
        let scores = [0.3, 0.9, 0.1, 0.7, 0.5, 0.2];
        let labels = [true, true, false, true, false, false];
        let a = compute_eer(&scores, &labels).unwrap();
        let mut idx: Vec<usize> = (0..6).collect();
        idx.reverse();
        let s: Vec<f32> = idx.iter().map(|&i| scores[i]).collect();
        let l: Vec<bool> = idx.iter().map(|&i| labels[i]).collect();
        assert_eq!(a, compute_eer(&s, &l).unwrap());
    }
}
