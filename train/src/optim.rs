//! Adam with coupled L2 weight decay.
//!
//! ```text
//! g  = grad + weight_decay * θ
//! m  = β1 m + (1 - β1) g
//! v  = β2 v + (1 - β2) g²
//! θ -= lr * m̂ / (sqrt(v̂) + ε)      m̂ = m / (1 - β1^t), v̂ = v / (1 - β2^t)
//! ```

use serde::{Deserialize, Serialize};

use crate::TrainError;
use crate::model::Parameter;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 5e-4,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 5e-4,
        }
    }
}

impl AdamConfig {
    pub fn validate(&self) -> Result<(), TrainError> {
        if self.lr.is_nan() || self.lr <= 0.0 {
            return Err(TrainError::Config(format!("learning rate must be positive, got {}", self.lr)));
        }
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(TrainError::Config(format!("{name} must be in [0, 1), got {beta}")));
            }
        }
        if self.weight_decay < 0.0 || self.eps <= 0.0 {
            return Err(TrainError::Config(
                "weight decay must be non-negative and eps positive".into(),
            ));
        }
        Ok(())
    }
}

/// Moment estimates, saved in checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdamState {
    pub step: u64,
    pub m: Vec<Vec<f32>>,
    pub v: Vec<Vec<f32>>,
}

pub struct Adam {
    config: AdamConfig,
    state: AdamState,
}

impl Adam {
    pub fn new(config: AdamConfig) -> Self {
        Self {
            config,
            state: AdamState::default(),
        }
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    pub fn set_lr(&mut self, lr: f32) {
        self.config.lr = lr;
    }

    /// Number of updates applied so far.
    pub fn step_count(&self) -> u64 {
        self.state.step
    }

    pub fn state(&self) -> &AdamState {
        &self.state
    }

    /// Restores moments. An empty state resets the optimizer.
    pub fn load_state(&mut self, state: AdamState) -> Result<(), TrainError> {
        if state.m.len() != state.v.len() {
            return Err(TrainError::Model(format!(
                "optimizer state has {} first and {} second moments",
                state.m.len(),
                state.v.len()
            )));
        }
        self.state = state;
        Ok(())
    }

    /// Applies one update from the accumulated gradients.
    pub fn step(&mut self, params: &mut [Parameter]) -> Result<(), TrainError> {
        if self.state.m.is_empty() {
            self.state.m = params.iter().map(|p| vec![0.0; p.len()]).collect();
            self.state.v = self.state.m.clone();
        }
        if self.state.m.len() != params.len()
            || params.iter().zip(&self.state.m).any(|(p, m)| p.len() != m.len())
        {
            return Err(TrainError::Model(
                "optimizer state does not match model parameters".into(),
            ));
        }

        self.state.step += 1;
        let AdamConfig {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;
        let t = self.state.step as i32;
        let bias1 = 1.0 - beta1.powi(t);
        let bias2 = 1.0 - beta2.powi(t);

        for ((param, m), v) in params
            .iter_mut()
            .zip(&mut self.state.m)
            .zip(&mut self.state.v)
        {
            for i in 0..param.data.len() {
                let g = param.grad[i] + weight_decay * param.data[i];
                m[i] = beta1 * m[i] + (1.0 - beta1) * g;
                v[i] = beta2 * v[i] + (1.0 - beta2) * g * g;
                let m_hat = m[i] / bias1;
                let v_hat = v[i] / bias2;
                param.data[i] -= lr * m_hat / (v_hat.sqrt() + eps);
            }
        }
        Ok(())
    }
}
