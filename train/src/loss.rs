//! Classification and contrastive objectives.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::TrainError;
use crate::model::{ModelOutput, OutputGrads};

/// Mean negative log-likelihood of `targets`, with its gradient.
pub fn nll_loss(log_probs: &[Vec<f32>], targets: &[u32]) -> Result<(f32, Vec<Vec<f32>>), TrainError> {
    if log_probs.len() != targets.len() {
        return Err(TrainError::Model(format!(
            "{} output rows for {} targets",
            log_probs.len(),
            targets.len()
        )));
    }
    if targets.is_empty() {
        return Ok((0.0, Vec::new()));
    }
    let scale = 1.0 / targets.len() as f32;
    let mut loss = 0.0f64;
    let mut grads = Vec::with_capacity(targets.len());
    for (row, &y) in log_probs.iter().zip(targets) {
        let y = y as usize;
        let Some(&lp) = row.get(y) else {
            return Err(TrainError::Model(format!(
                "target speaker {y} outside {} model outputs",
                row.len()
            )));
        };
        loss -= lp as f64;
        let mut g = vec![0.0; row.len()];
        g[y] = -scale;
        grads.push(g);
    }
    Ok(((loss * scale as f64) as f32, grads))
}

pub fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = (x - y) as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt() as f32
}

/// Gradients of the contrastive loss for both pair sides.
pub struct ContrastiveGrads {
    pub first: Vec<Vec<f32>>,
    pub second: Vec<Vec<f32>>,
}

/// Mean contrastive loss over pairs: `d²/2` for same-speaker pairs and
/// `max(0, margin - d)²/2` otherwise, `d` being the Euclidean distance.
///
/// Returns the loss, its gradient and the pair distances.
pub fn contrastive_loss(
    first: &[Vec<f32>],
    second: &[Vec<f32>],
    same: &[bool],
    margin: f32,
) -> (f32, ContrastiveGrads, Vec<f32>) {
    let n = same.len().min(first.len()).min(second.len());
    let mut grads = ContrastiveGrads {
        first: first.iter().map(|r| vec![0.0; r.len()]).collect(),
        second: second.iter().map(|r| vec![0.0; r.len()]).collect(),
    };
    if n == 0 {
        return (0.0, grads, Vec::new());
    }
    let scale = 1.0 / n as f32;
    let mut loss = 0.0f64;
    let mut distances = Vec::with_capacity(n);
    for k in 0..n {
        let (a, b) = (&first[k], &second[k]);
        let d = euclidean(a, b);
        distances.push(d);
        // coeff * (a - b) is dL/da.
        let coeff = if same[k] {
            loss += 0.5 * (d as f64).powi(2);
            1.0
        } else if d < margin {
            let gap = margin - d;
            loss += 0.5 * (gap as f64).powi(2);
            if d > 0.0 { -gap / d } else { 0.0 }
        } else {
            0.0
        };
        if coeff != 0.0 {
            for (j, (x, y)) in a.iter().zip(b).enumerate() {
                let g = coeff * (x - y) * scale;
                grads.first[k][j] += g;
                grads.second[k][j] -= g;
            }
        }
    }
    ((loss * scale as f64) as f32, grads, distances)
}

/// Distance threshold that best separates same-speaker pairs (below)
/// from different-speaker pairs (at or above). `None` unless both kinds
/// are present.
pub fn best_margin(distances: &[f32], same: &[bool]) -> Option<f32> {
    let mut pairs: Vec<(f32, bool)> = distances.iter().copied().zip(same.iter().copied()).collect();
    if !pairs.iter().any(|p| p.1) || !pairs.iter().any(|p| !p.1) {
        return None;
    }
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    // Threshold below everything: all negatives correct.
    let mut correct: i64 = pairs.iter().filter(|p| !p.1).count() as i64;
    let mut best = (correct, pairs[0].0);
    for i in 0..pairs.len() {
        correct += if pairs[i].1 { 1 } else { -1 };
        let boundary = match pairs.get(i + 1) {
            Some(next) if next.0 == pairs[i].0 => continue,
            Some(next) => 0.5 * (pairs[i].0 + next.0),
            None => pairs[i].0 + f32::EPSILON.max(pairs[i].0.abs() * 1e-6),
        };
        if correct > best.0 {
            best = (correct, boundary);
        }
    }
    Some(best.1)
}

/// How the contrastive margin evolves during training.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarginPolicy {
    Fixed { margin: f32 },
    /// Moves toward each batch's best separating distance:
    /// `margin = momentum * margin + (1 - momentum) * best`, never below
    /// `floor`.
    Adaptive { initial: f32, momentum: f32, floor: f32 },
}

impl Default for MarginPolicy {
    fn default() -> Self {
        Self::Adaptive {
            initial: 1.0,
            momentum: 0.9,
            floor: 0.1,
        }
    }
}

impl MarginPolicy {
    pub fn initial(&self) -> f32 {
        match *self {
            Self::Fixed { margin } => margin,
            Self::Adaptive { initial, .. } => initial,
        }
    }

    pub fn update(&self, current: f32, distances: &[f32], same: &[bool]) -> f32 {
        match *self {
            Self::Fixed { margin } => margin,
            Self::Adaptive { momentum, floor, .. } => match best_margin(distances, same) {
                Some(best) => (momentum * current + (1.0 - momentum) * best).max(floor),
                None => current,
            },
        }
    }

    pub fn validate(&self) -> Result<(), TrainError> {
        let ok = match *self {
            Self::Fixed { margin } => margin > 0.0,
            Self::Adaptive {
                initial,
                momentum,
                floor,
            } => initial > 0.0 && (0.0..=1.0).contains(&momentum) && floor >= 0.0,
        };
        if ok {
            Ok(())
        } else {
            Err(TrainError::Config(format!("invalid margin policy {self:?}")))
        }
    }
}

/// Which objective a training step optimizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingMode {
    /// Speaker classification only.
    Classification,
    /// Weighted contrastive plus classification over pair batches.
    #[default]
    Verification,
}

impl fmt::Display for TrainingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Classification => "classification",
            Self::Verification => "verification",
        })
    }
}

impl FromStr for TrainingMode {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classification" => Ok(Self::Classification),
            "verification" => Ok(Self::Verification),
            other => Err(TrainError::Config(format!("unknown training mode {other:?}"))),
        }
    }
}

/// Loss terms of one batch and the gradient of `total`.
#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Contrastive term, zero in classification mode.
    pub verification: f32,
    pub classification: f32,
    pub total: f32,
    pub grads: OutputGrads,
    /// Pair distances and targets, empty in classification mode.
    pub distances: Vec<f32>,
    pub same: Vec<bool>,
    /// Rows that count towards training accuracy.
    pub anchor_rows: usize,
}

impl TrainingMode {
    /// Computes the loss of a forward pass.
    ///
    /// In verification mode the batch is two stacked halves: row `k` and
    /// row `k + B/2` form pair `k`. The total is
    /// `alpha * contrastive + (1 - alpha) * nll`, the NLL covering both
    /// halves.
    pub fn compute_loss(
        &self,
        output: &ModelOutput,
        labels: &[u32],
        alpha: f32,
        margin: f32,
    ) -> Result<LossOutput, TrainError> {
        let (classification, nll_grads) = nll_loss(&output.log_probs, labels)?;
        let mut grads = OutputGrads::zeros_like(output);

        match self {
            Self::Classification => {
                grads.log_probs = nll_grads;
                Ok(LossOutput {
                    verification: 0.0,
                    classification,
                    total: classification,
                    grads,
                    distances: Vec::new(),
                    same: Vec::new(),
                    anchor_rows: labels.len(),
                })
            }
            Self::Verification => {
                let rows = labels.len();
                if rows % 2 != 0 {
                    return Err(TrainError::Model(format!(
                        "pair batch has an odd number of rows ({rows})"
                    )));
                }
                let half = rows / 2;
                let same: Vec<bool> = (0..half).map(|k| labels[k] == labels[half + k]).collect();
                let (first, second) = output.embeddings.split_at(half);
                let (verification, pair_grads, distances) =
                    contrastive_loss(first, second, &same, margin);

                for (dst, src) in grads.log_probs.iter_mut().zip(nll_grads) {
                    *dst = src.into_iter().map(|g| (1.0 - alpha) * g).collect();
                }
                for (dst, src) in grads
                    .embeddings
                    .iter_mut()
                    .zip(pair_grads.first.into_iter().chain(pair_grads.second))
                {
                    *dst = src.into_iter().map(|g| alpha * g).collect();
                }
                Ok(LossOutput {
                    verification,
                    classification,
                    total: alpha * verification + (1.0 - alpha) * classification,
                    grads,
                    distances,
                    same,
                    anchor_rows: half,
                })
            }
        }
    }
}
