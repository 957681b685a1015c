//! End-to-end runs over `.npy` corpora and in-memory stores.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use ndarray::Array2;
use ndarray_npy::write_npy;
use voxver_data::{
    ContrastiveSampler, DatasetOptions, FeatureSet, IdentityDataset, MemoryStore, NpyStore,
    SpeakerSet, UtteranceStore, VerificationTrials,
};
use voxver_train::{
    Checkpoint, PooledLinear, SpeakerModel, TrainConfig, Trainer, TrainingMode,
    VerificationEvaluator,
};

const FEATURES: usize = 4;

fn utterance(speaker: usize, seed: usize, frames: usize) -> Array2<f32> {
    Array2::from_shape_fn((frames, FEATURES), |(t, d)| {
        let wave = ((t * (d + 2) + seed * 3) % 9) as f32 - 4.0;
        wave * 0.2 * (1 + (speaker + d) % 4) as f32
    })
}

/// Writes `speakers` x `per_speaker` utterances as
/// `<root>/id<10001+s>/<video>/<u>.npy`.
fn write_corpus(root: &Path, speakers: usize, per_speaker: usize, seed: usize) {
    for s in 0..speakers {
        for u in 0..per_speaker {
            let dir = root.join(format!("id{}", 10001 + s)).join(format!("v{}", u % 2));
            std::fs::create_dir_all(&dir).unwrap();
            let frames = 6 + (u * 5 + s) % 9;
            write_npy(dir.join(format!("{u:05}.npy")), &utterance(s, u + seed, frames)).unwrap();
        }
    }
}

fn write_trials(file: &Path, speakers: usize) {
    let mut lines = Vec::new();
    for s in 0..speakers {
        let other = (s + 1) % speakers;
        lines.push(format!(
            "1 id{}/v0/00000.wav id{}/v1/00001.wav",
            10001 + s,
            10001 + s
        ));
        lines.push(format!(
            "0 id{}/v0/00000.wav id{}/v0/00002.wav",
            10001 + s,
            10001 + other
        ));
    }
    std::fs::write(file, lines.join("\n") + "\n").unwrap();
}

#[test]
fn test_contrastive_batches_span_speakers() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path(), 4, 10, 0);
    let full = IdentityDataset::build(
        dir.path(),
        &SpeakerSet::first(4).unwrap(),
        Arc::new(NpyStore::new()),
        &DatasetOptions::default(),
    )
    .unwrap();
    assert_eq!(full.len(), 40);
    let (train, val) = full.split(0.8, Some(3)).unwrap();
    assert_eq!((train.len(), val.len()), (32, 8));

    let sampler = ContrastiveSampler::new(&train.labels(), train.num_speakers(), 8, 5).unwrap();
    for epoch in 0..3 {
        for batch in sampler.epoch(epoch) {
            let speakers: BTreeSet<u32> = batch
                .iter()
                .flat_map(|&(a, b)| [train.label(a).unwrap(), train.label(b).unwrap()])
                .collect();
            assert!(speakers.len() >= 2, "batch {batch:?}");
        }
    }
}

#[test]
fn test_shared_enrol_paths_loaded_once() {
    let mut store = MemoryStore::new();
    for name in ["e1", "e2", "t1", "t2", "t3"] {
        store.insert(format!("/test/{name}.npy"), vec![vec![1.0, 2.0, 0.5, -1.0]; 5]);
    }
    let store = Arc::new(store);
    let trials_file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(
        trials_file.path(),
        "1 e1.wav t1.wav\n0 e1.wav t2.wav\n1 e2.wav t3.wav\n",
    )
    .unwrap();
    let trials = VerificationTrials::build(trials_file.path(), Path::new("/test"), store.clone()).unwrap();
    assert_eq!(trials.enrol.len(), 2);

    let evaluator = VerificationEvaluator::new(trials, 100, 8).unwrap();
    let mut model = PooledLinear::new(FEATURES, 6, 4, 0);
    evaluator.evaluate(&mut model).unwrap();
    let enrol_loads = store.load_count_for(Path::new("/test/e1.npy"))
        + store.load_count_for(Path::new("/test/e2.npy"));
    assert_eq!(enrol_loads, 2);
    assert_eq!(store.load_count(), 5);
}

#[test]
fn test_train_checkpoint_resume_on_npy_corpus() {
    let dir = tempfile::tempdir().unwrap();
    let train_root = dir.path().join("dev");
    let test_root = dir.path().join("test");
    write_corpus(&train_root, 4, 8, 0);
    write_corpus(&test_root, 4, 3, 100);
    let trial_file = dir.path().join("veri.txt");
    write_trials(&trial_file, 4);

    let mut config = TrainConfig::default();
    config.mode = TrainingMode::Verification;
    config.epochs = 2;
    config.batch_size = 6;
    config.eval_batch_size = 5;
    config.train_max_frames = 8;
    config.eval_max_frames = 12;
    config.checkpoint = dir.path().join("ckpt/best.ckpt");
    config.optimizer.lr = 0.01;

    let store: Arc<dyn UtteranceStore> = Arc::new(NpyStore::new());
    let full = IdentityDataset::build(
        &train_root,
        &SpeakerSet::first(4).unwrap(),
        store.clone(),
        &DatasetOptions {
            preload: true,
            ..DatasetOptions::default()
        },
    )
    .unwrap();
    let (train, val) = full.split(0.8, Some(config.seed)).unwrap();
    let trials = VerificationTrials::build(&trial_file, &test_root, store).unwrap();
    assert_eq!((trials.positives(), trials.negatives()), (4, 4));
    let evaluator = VerificationEvaluator::new(trials, config.eval_max_frames, config.eval_batch_size).unwrap();

    let mut trainer = Trainer::new(PooledLinear::new(FEATURES, 8, 4, 1), config.clone()).unwrap();
    let history = trainer.run(&train, &val, &evaluator).unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].checkpointed);

    let saved = Checkpoint::load(&config.checkpoint).unwrap();
    let best = history
        .iter()
        .map(|s| s.eer)
        .fold(f32::INFINITY, f32::min);
    assert_eq!(saved.run.best_eer, Some(best));
    assert_eq!(trainer.state().best_eer, Some(best));

    // Resuming from the best checkpoint reproduces its parameters and
    // counters, then keeps training.
    config.epochs = saved.run.epoch + 1;
    let mut resumed =
        Trainer::resume(PooledLinear::new(FEATURES, 8, 4, 42), config, &dir.path().join("ckpt/best.ckpt"))
            .unwrap();
    assert_eq!(resumed.model().state(), saved.model);
    assert_eq!(resumed.state(), &saved.run);
    let more = resumed.run(&train, &val, &evaluator).unwrap();
    assert_eq!(more.len(), 1);
    assert_eq!(more[0].epoch, saved.run.epoch);
    assert!(resumed.state().step > saved.run.step);
}

#[test]
fn test_missing_trial_file_is_reported() {
    let store: Arc<dyn UtteranceStore> = Arc::new(NpyStore::new());
    let err = VerificationTrials::build(Path::new("/no/such/veri.txt"), Path::new("/no"), store);
    assert!(err.is_err());
}
