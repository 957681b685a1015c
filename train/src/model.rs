//! Speaker model abstraction.
//!
//! A [`SpeakerModel`] maps a padded batch of feature sequences to per-row
//! log-probabilities over the training speakers plus a fixed-size
//! embedding, and accumulates parameter gradients from the gradient of a
//! loss with respect to those outputs. The training loop never looks
//! inside a model beyond its flat [`Parameter`] list.

use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};
use voxver_data::PaddedBatch;

use crate::TrainError;

/// A named flat parameter tensor and its accumulated gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub data: Vec<f32>,
    pub grad: Vec<f32>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, data: Vec<f32>) -> Self {
        let grad = vec![0.0; data.len()];
        Self {
            name: name.into(),
            data,
            grad,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn zero_grad(&mut self) {
        self.grad.iter_mut().for_each(|g| *g = 0.0);
    }
}

/// Forward output of a batch of `B` rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    /// `[B][num_speakers]` log-probabilities.
    pub log_probs: Vec<Vec<f32>>,
    /// `[B][embedding_dim]` embeddings.
    pub embeddings: Vec<Vec<f32>>,
}

impl ModelOutput {
    pub fn batch_size(&self) -> usize {
        self.log_probs.len()
    }

    /// Argmax speaker of every row.
    pub fn predictions(&self) -> Vec<u32> {
        self.log_probs
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0usize, f32::NEG_INFINITY), |best, (k, &v)| {
                        if v > best.1 { (k, v) } else { best }
                    })
                    .0 as u32
            })
            .collect()
    }
}

/// Loss gradient with respect to each [`ModelOutput`] field; same shapes.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputGrads {
    pub log_probs: Vec<Vec<f32>>,
    pub embeddings: Vec<Vec<f32>>,
}

impl OutputGrads {
    pub fn zeros_like(output: &ModelOutput) -> Self {
        let zeros = |rows: &Vec<Vec<f32>>| rows.iter().map(|r| vec![0.0; r.len()]).collect();
        Self {
            log_probs: zeros(&output.log_probs),
            embeddings: zeros(&output.embeddings),
        }
    }
}

/// Serializable parameter values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub tensors: Vec<(String, Vec<f32>)>,
}

/// A trainable speaker model.
pub trait SpeakerModel: Send {
    /// Runs the model on a batch. In training mode the model keeps what
    /// [`SpeakerModel::backward`] needs.
    fn forward(&mut self, batch: &PaddedBatch) -> Result<ModelOutput, TrainError>;

    /// Accumulates parameter gradients for the last forward pass.
    fn backward(&mut self, grads: &OutputGrads) -> Result<(), TrainError>;

    fn parameters(&self) -> &[Parameter];

    fn parameters_mut(&mut self) -> &mut [Parameter];

    /// Switches between inference (`true`) and training (`false`).
    fn set_inference(&mut self, inference: bool);

    fn is_inference(&self) -> bool;

    fn num_speakers(&self) -> usize;

    fn embedding_dim(&self) -> usize;

    fn zero_grad(&mut self) {
        self.parameters_mut().iter_mut().for_each(Parameter::zero_grad);
    }

    fn state(&self) -> ModelState {
        ModelState {
            tensors: self
                .parameters()
                .iter()
                .map(|p| (p.name.clone(), p.data.clone()))
                .collect(),
        }
    }

    /// Restores parameter values. Names and sizes must match exactly.
    fn load_state(&mut self, state: &ModelState) -> Result<(), TrainError> {
        let params = self.parameters_mut();
        if params.len() != state.tensors.len() {
            return Err(TrainError::Model(format!(
                "state has {} tensors, model has {}",
                state.tensors.len(),
                params.len()
            )));
        }
        for (param, (name, data)) in params.iter_mut().zip(&state.tensors) {
            if &param.name != name || param.len() != data.len() {
                return Err(TrainError::Model(format!(
                    "state tensor {name}[{}] does not match {}[{}]",
                    data.len(),
                    param.name,
                    param.len()
                )));
            }
            param.data.copy_from_slice(data);
            param.zero_grad();
        }
        Ok(())
    }
}

/// Holds a model in inference mode and restores its previous mode on drop.
pub struct InferenceGuard<'a, M: SpeakerModel + ?Sized> {
    model: &'a mut M,
    was_inference: bool,
}

impl<'a, M: SpeakerModel + ?Sized> InferenceGuard<'a, M> {
    pub fn new(model: &'a mut M) -> Self {
        let was_inference = model.is_inference();
        model.set_inference(true);
        Self {
            model,
            was_inference,
        }
    }
}

impl<M: SpeakerModel + ?Sized> Deref for InferenceGuard<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        self.model
    }
}

impl<M: SpeakerModel + ?Sized> DerefMut for InferenceGuard<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        self.model
    }
}

impl<M: SpeakerModel + ?Sized> Drop for InferenceGuard<'_, M> {
    fn drop(&mut self) {
        self.model.set_inference(self.was_inference);
    }
}
