use tracing::{debug, info};
use voxver_data::loader::{load_items, prefetch};
use voxver_data::{FeatureSet, Frames, PadMode, PaddedBatch, VerificationTrials, center, clip_top};

use crate::TrainError;
use crate::eer::{EerReport, compute_eer, cosine_similarity};
use crate::model::{InferenceGuard, SpeakerModel};

/// Scores a trial list with a model and reports its EER.
///
/// Every distinct enrol and test utterance is embedded once; trials look
/// their embeddings up through the sets' `sample_idxs`.
pub struct VerificationEvaluator {
    trials: VerificationTrials,
    max_frames: usize,
    batch_size: usize,
    prefetch: usize,
}

impl VerificationEvaluator {
    /// Fails when the trial list lacks positive or negative trials.
    pub fn new(
        trials: VerificationTrials,
        max_frames: usize,
        batch_size: usize,
    ) -> Result<Self, TrainError> {
        let (positives, negatives) = (trials.positives(), trials.negatives());
        if positives == 0 || negatives == 0 {
            return Err(TrainError::EmptyTrialSet {
                positives,
                negatives,
            });
        }
        if max_frames == 0 || batch_size == 0 {
            return Err(TrainError::Config(
                "evaluation clip length and batch size must be positive".into(),
            ));
        }
        Ok(Self {
            trials,
            max_frames,
            batch_size,
            prefetch: 2,
        })
    }

    /// Sets how many batches are loaded ahead of the model.
    pub fn with_prefetch(mut self, depth: usize) -> Self {
        self.prefetch = depth.max(1);
        self
    }

    pub fn trials(&self) -> &VerificationTrials {
        &self.trials
    }

    /// Cosine score of every trial, in trial order.
    pub fn score<M: SpeakerModel + ?Sized>(&self, model: &mut M) -> Result<Vec<f32>, TrainError> {
        let mut model = InferenceGuard::new(model);
        let enrol = embed_all(
            &mut *model,
            &self.trials.enrol,
            self.max_frames,
            self.batch_size,
            self.prefetch,
        )?;
        let test = embed_all(
            &mut *model,
            &self.trials.test,
            self.max_frames,
            self.batch_size,
            self.prefetch,
        )?;
        Ok(self
            .trials
            .enrol
            .sample_idxs()
            .iter()
            .zip(self.trials.test.sample_idxs())
            .map(|(&e, &t)| cosine_similarity(&enrol[e], &test[t]))
            .collect())
    }

    pub fn evaluate<M: SpeakerModel + ?Sized>(&self, model: &mut M) -> Result<EerReport, TrainError> {
        let scores = self.score(model)?;
        let report = compute_eer(&scores, &self.trials.labels)?;
        info!(
            trials = self.trials.len(),
            eer = report.eer,
            threshold = report.threshold,
            "verification evaluated"
        );
        Ok(report)
    }
}

/// Embeds every item of `set` in order, `batch_size` items per forward
/// pass. Sequences are centered and keep their first `max_frames` frames.
pub fn embed_all<M, S>(
    model: &mut M,
    set: &S,
    max_frames: usize,
    batch_size: usize,
    depth: usize,
) -> Result<Vec<Vec<f32>>, TrainError>
where
    M: SpeakerModel + ?Sized,
    S: FeatureSet + ?Sized,
{
    let indices: Vec<usize> = (0..set.len()).collect();
    let chunks: Vec<Vec<usize>> = indices.chunks(batch_size.max(1)).map(<[usize]>::to_vec).collect();
    let mut embeddings = Vec::with_capacity(set.len());

    prefetch(
        chunks,
        depth,
        |chunk: Vec<usize>| {
            let sequences: Vec<Frames> = load_items(set, &chunk)?
                .into_iter()
                .map(|u| {
                    let mut frames = u.frames;
                    center(&mut frames);
                    clip_top(frames, max_frames)
                })
                .collect();
            PaddedBatch::pad(&sequences, PadMode::Zeros)
        },
        |batch: PaddedBatch| -> Result<(), TrainError> {
            let output = model.forward(&batch)?;
            debug!(rows = output.batch_size(), "embedded batch");
            embeddings.extend(output.embeddings);
            Ok(())
        },
    )?;
    Ok(embeddings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PooledLinear;
    use std::path::Path;
    use std::sync::Arc;
    use voxver_data::{MemoryStore, UtteranceStore, parse_trials_str};

    fn store() -> Arc<MemoryStore> {
        let mut store = MemoryStore::new();
        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            let frames: Frames = (0..6)
                .map(|t| vec![(i * 3 + t) as f32, (i as f32 - 1.5) * (t as f32)])
                .collect();
            store.insert(format!("/t/{name}.npy"), frames);
        }
        Arc::new(store)
    }

    fn trials(text: &str, store: Arc<MemoryStore>) -> VerificationTrials {
        let parsed = parse_trials_str(text, Path::new("veri.txt"), Path::new("/t"), "npy").unwrap();
        VerificationTrials::from_trials(&parsed, store)
    }

    #[test]
    fn test_shared_enrol_loaded_once() {
        let store = store();
        let t = trials("1 a.wav b.wav\n0 a.wav c.wav\n1 d.wav c.wav\n", Arc::clone(&store));
        let evaluator = VerificationEvaluator::new(t, 100, 2).unwrap();
        let mut model = PooledLinear::new(2, 3, 4, 0);
        let scores = evaluator.score(&mut model).unwrap();
        assert_eq!(scores.len(), 3);
        assert_eq!(store.load_count_for(Path::new("/t/a.npy")), 1);
        assert_eq!(store.load_count_for(Path::new("/t/c.npy")), 1);
        assert_eq!(store.load_count(), 2 + 2);
        assert!(!model.is_inference());
    }

    #[test]
    fn test_scores_match_direct_embedding() {
        let store = store();
        let t = trials("1 a.wav b.wav\n0 c.wav d.wav\n", Arc::clone(&store));
        let evaluator = VerificationEvaluator::new(t, 4, 1).unwrap();
        let mut model = PooledLinear::new(2, 3, 4, 5);
        let scores = evaluator.score(&mut model).unwrap();

        let mut embed = |p: &str| {
            let mut frames = store.load(Path::new(p)).unwrap();
            center(&mut frames);
            let batch = PaddedBatch::pad(&[clip_top(frames, 4)], PadMode::Zeros).unwrap();
            model.forward(&batch).unwrap().embeddings.remove(0)
        };
        let expect = cosine_similarity(&embed("/t/a.npy"), &embed("/t/b.npy"));
        assert_eq!(scores[0], expect);
    }

    #[test]
    fn test_deterministic_scores() {
        let store = store();
        let t = trials("1 a.wav b.wav\n0 c.wav d.wav\n0 a.wav d.wav\n", store);
        let evaluator = VerificationEvaluator::new(t, 3, 2).unwrap();
        let mut model = PooledLinear::new(2, 3, 4, 1);
        let first = evaluator.evaluate(&mut model).unwrap();
        let second = evaluator.evaluate(&mut model).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_rejects_single_class_trials() {
        let t = trials("1 a.wav b.wav\n1 c.wav d.wav\n", store());
        assert!(matches!(
            VerificationEvaluator::new(t, 10, 2),
            Err(TrainError::EmptyTrialSet { positives: 2, negatives: 0 })
        ));
    }

    #[test]
    fn test_nan_features_fail_evaluation() {
        let mut store = MemoryStore::new();
        store.insert("/t/a.npy", vec![vec![1.0, 2.0], vec![3.0, -1.0], vec![0.5, 0.5]]);
        store.insert("/t/b.npy", vec![vec![2.0, 0.0], vec![-1.0, 4.0], vec![1.5, 1.0]]);
        store.insert("/t/n.npy", vec![vec![f32::NAN, 1.0], vec![2.0, 3.0]]);
        let t = trials("1 a.wav n.wav\n0 a.wav b.wav\n", Arc::new(store));
        let evaluator = VerificationEvaluator::new(t, 10, 2).unwrap();
        let mut model = PooledLinear::new(2, 3, 4, 0);
        assert!(matches!(
            evaluator.evaluate(&mut model),
            Err(TrainError::NonFiniteScore { trial: 0, .. })
        ));
        assert!(!model.is_inference());
    }

    #[test]
    fn test_missing_sample_propagates() {
        let t = trials("1 a.wav zzz.wav\n0 a.wav b.wav\n", store());
        let evaluator = VerificationEvaluator::new(t, 10, 2).unwrap();
        let mut model = PooledLinear::new(2, 3, 4, 0);
        assert!(matches!(evaluator.evaluate(&mut model), Err(TrainError::Data(_))));
        assert!(!model.is_inference());
    }
}
