//! Reference speaker model: statistics pooling, a linear embedding layer
//! and a linear speaker classifier with log-softmax.
//!
//! ```text
//! frames[T][F] ──mean, std over valid t──> x[2F] ──W_e,b_e──> e[D] ──W_c,b_c──> z[C] ──log_softmax──> y[C]
//! ```
//!
//! Inputs are centered per utterance, so the mean half is close to zero
//! and speaker identity is carried mostly by the standard deviation.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use voxver_data::PaddedBatch;

use crate::TrainError;
use crate::model::{ModelOutput, OutputGrads, Parameter, SpeakerModel};

const EMBED_WEIGHT: usize = 0;
const EMBED_BIAS: usize = 1;
const CLASSIFY_WEIGHT: usize = 2;
const CLASSIFY_BIAS: usize = 3;

const STD_EPS: f32 = 1e-5;

/// Activations of the last training forward pass.
struct Cache {
    pooled: Vec<Vec<f32>>,
    embeddings: Vec<Vec<f32>>,
    probs: Vec<Vec<f32>>,
}

pub struct PooledLinear {
    feature_dim: usize,
    embedding_dim: usize,
    num_speakers: usize,
    params: Vec<Parameter>,
    inference: bool,
    cache: Option<Cache>,
}

impl PooledLinear {
    /// Creates a model with weights drawn uniformly from
    /// `[-1/sqrt(fan_in), 1/sqrt(fan_in)]` and zero biases.
    pub fn new(feature_dim: usize, embedding_dim: usize, num_speakers: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut uniform = |n: usize, fan_in: usize| -> Vec<f32> {
            let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
            (0..n).map(|_| rng.gen_range(-bound..=bound)).collect()
        };
        let pooled_dim = 2 * feature_dim;
        let params = vec![
            Parameter::new("embed.weight", uniform(embedding_dim * pooled_dim, pooled_dim)),
            Parameter::new("embed.bias", vec![0.0; embedding_dim]),
            Parameter::new(
                "classify.weight",
                uniform(num_speakers * embedding_dim, embedding_dim),
            ),
            Parameter::new("classify.bias", vec![0.0; num_speakers]),
        ];
        Self {
            feature_dim,
            embedding_dim,
            num_speakers,
            params,
            inference: false,
            cache: None,
        }
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    /// Per-dimension mean and standard deviation over the valid frames of
    /// row `b`; padding frames are ignored.
    fn pool(&self, batch: &PaddedBatch, b: usize) -> Vec<f32> {
        let f = self.feature_dim;
        let mut x = vec![0.0f32; 2 * f];
        let len = batch.lengths[b].min(batch.max_len);
        if len == 0 {
            return x;
        }
        let mut sum = vec![0.0f64; f];
        let mut sq = vec![0.0f64; f];
        for t in 0..len {
            for (i, &v) in batch.frame(b, t).iter().enumerate() {
                sum[i] += v as f64;
                sq[i] += (v as f64) * (v as f64);
            }
        }
        let n = len as f64;
        for i in 0..f {
            let mean = sum[i] / n;
            let var = (sq[i] / n - mean * mean).max(0.0);
            x[i] = mean as f32;
            x[f + i] = (var as f32 + STD_EPS).sqrt();
        }
        x
    }

    fn affine(weight: &[f32], bias: &[f32], input: &[f32]) -> Vec<f32> {
        let cols = input.len();
        bias.iter()
            .enumerate()
            .map(|(r, &b)| {
                let row = &weight[r * cols..(r + 1) * cols];
                b + row.iter().zip(input).map(|(w, x)| w * x).sum::<f32>()
            })
            .collect()
    }
}

fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = logits.iter().map(|&z| (z - max).exp()).sum();
    let log_sum = max + sum.ln();
    logits.iter().map(|&z| z - log_sum).collect()
}

impl SpeakerModel for PooledLinear {
    fn forward(&mut self, batch: &PaddedBatch) -> Result<ModelOutput, TrainError> {
        if batch.batch_size() > 0 && batch.dim != self.feature_dim {
            return Err(TrainError::Model(format!(
                "feature width {} does not match model input {}",
                batch.dim, self.feature_dim
            )));
        }
        let mut pooled = Vec::with_capacity(batch.batch_size());
        let mut embeddings = Vec::with_capacity(batch.batch_size());
        let mut log_probs = Vec::with_capacity(batch.batch_size());
        for b in 0..batch.batch_size() {
            let x = self.pool(batch, b);
            let e = Self::affine(
                &self.params[EMBED_WEIGHT].data,
                &self.params[EMBED_BIAS].data,
                &x,
            );
            let z = Self::affine(
                &self.params[CLASSIFY_WEIGHT].data,
                &self.params[CLASSIFY_BIAS].data,
                &e,
            );
            pooled.push(x);
            embeddings.push(e);
            log_probs.push(log_softmax(&z));
        }

        self.cache = if self.inference {
            None
        } else {
            Some(Cache {
                pooled,
                embeddings: embeddings.clone(),
                probs: log_probs
                    .iter()
                    .map(|row| row.iter().map(|v| v.exp()).collect())
                    .collect(),
            })
        };
        Ok(ModelOutput {
            log_probs,
            embeddings,
        })
    }

    fn backward(&mut self, grads: &OutputGrads) -> Result<(), TrainError> {
        let cache = self
            .cache
            .take()
            .ok_or_else(|| TrainError::Model("backward without a training forward pass".into()))?;
        let rows = cache.pooled.len();
        if grads.log_probs.len() != rows || grads.embeddings.len() != rows {
            return Err(TrainError::Model(format!(
                "gradient batch {} does not match forward batch {rows}",
                grads.log_probs.len()
            )));
        }

        let (f, d) = (2 * self.feature_dim, self.embedding_dim);
        let mut d_embed_w = vec![0.0f32; d * f];
        let mut d_embed_b = vec![0.0f32; d];
        let mut d_class_w = vec![0.0f32; self.num_speakers * d];
        let mut d_class_b = vec![0.0f32; self.num_speakers];
        let class_w = &self.params[CLASSIFY_WEIGHT].data;

        for b in 0..rows {
            let g = &grads.log_probs[b];
            let p = &cache.probs[b];
            let e = &cache.embeddings[b];
            let x = &cache.pooled[b];

            // d/dz of log_softmax: g - p * sum(g).
            let g_sum: f32 = g.iter().sum();
            let dz: Vec<f32> = g.iter().zip(p).map(|(&gk, &pk)| gk - pk * g_sum).collect();

            let mut de = grads.embeddings[b].clone();
            for (k, &dzk) in dz.iter().enumerate() {
                d_class_b[k] += dzk;
                let row = k * d;
                for j in 0..d {
                    d_class_w[row + j] += dzk * e[j];
                    de[j] += dzk * class_w[row + j];
                }
            }
            for (j, &dej) in de.iter().enumerate() {
                d_embed_b[j] += dej;
                let row = j * f;
                for i in 0..f {
                    d_embed_w[row + i] += dej * x[i];
                }
            }
        }

        for (idx, delta) in [
            (EMBED_WEIGHT, d_embed_w),
            (EMBED_BIAS, d_embed_b),
            (CLASSIFY_WEIGHT, d_class_w),
            (CLASSIFY_BIAS, d_class_b),
        ] {
            for (g, dv) in self.params[idx].grad.iter_mut().zip(delta) {
                *g += dv;
            }
        }
        Ok(())
    }

    fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }

    fn set_inference(&mut self, inference: bool) {
        self.inference = inference;
        if inference {
            self.cache = None;
        }
    }

    fn is_inference(&self) -> bool {
        self.inference
    }

    fn num_speakers(&self) -> usize {
        self.num_speakers
    }

    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxver_data::{Frames, PadMode};

    fn batch() -> PaddedBatch {
        let seqs: Vec<Frames> = vec![
            vec![vec![0.5, -1.0, 2.0], vec![1.5, 0.0, -1.0]],
            vec![vec![-0.3, 0.7, 0.1]],
        ];
        PaddedBatch::pad(&seqs, PadMode::Zeros).unwrap()
    }

    /// Scalar test objective: sum of weighted outputs.
    fn objective(out: &ModelOutput, grads: &OutputGrads) -> f32 {
        let dot = |a: &Vec<Vec<f32>>, b: &Vec<Vec<f32>>| -> f32 {
            a.iter()
                .flatten()
                .zip(b.iter().flatten())
                .map(|(x, y)| x * y)
                .sum()
        };
        dot(&out.log_probs, &grads.log_probs) + dot(&out.embeddings, &grads.embeddings)
    }

    #[test]
    fn test_forward_shapes_and_normalization() {
        let mut model = PooledLinear::new(3, 4, 5, 0);
        let out = model.forward(&batch()).unwrap();
        assert_eq!(out.batch_size(), 2);
        assert_eq!(out.embeddings[0].len(), 4);
        for row in &out.log_probs {
            let total: f32 = row.iter().map(|v| v.exp()).sum();
            assert!((total - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_padding_frames_ignored() {
        let mut model = PooledLinear::new(3, 4, 5, 0);
        let short = vec![vec![vec![1.0, 2.0, 3.0]]];
        let long = vec![vec![vec![1.0, 2.0, 3.0]], vec![vec![9.0; 3]; 4]];
        let a = model.forward(&PaddedBatch::pad(&short, PadMode::Zeros).unwrap()).unwrap();
        let b = model.forward(&PaddedBatch::pad(&long, PadMode::Wrap).unwrap()).unwrap();
        assert_eq!(a.embeddings[0], b.embeddings[0]);
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let batch = batch();
        let mut model = PooledLinear::new(3, 4, 5, 7);
        let out = model.forward(&batch).unwrap();
        let mut upstream = OutputGrads::zeros_like(&out);
        for (r, row) in upstream.log_probs.iter_mut().enumerate() {
            for (k, v) in row.iter_mut().enumerate() {
                *v = ((r * 7 + k * 3) % 5) as f32 * 0.1 - 0.2;
            }
        }
        for (r, row) in upstream.embeddings.iter_mut().enumerate() {
            for (k, v) in row.iter_mut().enumerate() {
                *v = ((r + k) % 3) as f32 * 0.2 - 0.1;
            }
        }
        model.zero_grad();
        model.backward(&upstream).unwrap();
        let analytic: Vec<Vec<f32>> = model.parameters().iter().map(|p| p.grad.clone()).collect();

        let eps = 1e-2f32;
        model.set_inference(true);
        for (pi, grads) in analytic.iter().enumerate() {
            for (i, &g) in grads.iter().enumerate() {
                let orig = model.parameters()[pi].data[i];
                model.parameters_mut()[pi].data[i] = orig + eps;
                let up = objective(&model.forward(&batch).unwrap(), &upstream);
                model.parameters_mut()[pi].data[i] = orig - eps;
                let down = objective(&model.forward(&batch).unwrap(), &upstream);
                model.parameters_mut()[pi].data[i] = orig;
                let numeric = (up - down) / (2.0 * eps);
                assert!(
                    (numeric - g).abs() < 2e-3,
                    "param {pi}[{i}]: numeric {numeric} analytic {g}"
                );
            }
        }
    }

    #[test]
    fn test_backward_requires_training_forward() {
        let mut model = PooledLinear::new(3, 4, 5, 0);
        model.set_inference(true);
        let out = model.forward(&batch()).unwrap();
        let grads = OutputGrads::zeros_like(&out);
        assert!(model.backward(&grads).is_err());
    }

    #[test]
    fn test_rejects_wrong_width() {
        let mut model = PooledLinear::new(2, 4, 5, 0);
        assert!(matches!(model.forward(&batch()), Err(TrainError::Model(_))));
    }

    #[test]
    fn test_seeded_init() {
        let a = PooledLinear::new(3, 4, 5, 9);
        let b = PooledLinear::new(3, 4, 5, 9);
        assert_eq!(a.parameters(), b.parameters());
    }
}
