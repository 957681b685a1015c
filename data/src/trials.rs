use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::DataError;
use crate::dataset::FeatureSet;
use crate::store::{Utterance, UtteranceStore};

/// A single verification trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trial {
    pub enrol: PathBuf,
    pub test: PathBuf,
    /// True when both utterances come from the same speaker.
    pub same: bool,
}

/// Parses a trial list file.
///
/// Each line is `<label> <enrol> <test>` separated by single spaces;
/// whitespace around the line is ignored. The
/// label is an integer, non-zero meaning "same speaker". Paths are joined
/// to `root` and their extension replaced with `ext`. Blank lines are
/// ignored.
pub fn parse_trials(file: &Path, root: &Path, ext: &str) -> Result<Vec<Trial>, DataError> {
    let text = std::fs::read_to_string(file).map_err(|source| DataError::Io {
        path: file.to_path_buf(),
        source,
    })?;
    parse_trials_str(&text, file, root, ext)
}

/// Parses trial list text. `source` is only used for error messages.
pub fn parse_trials_str(
    text: &str,
    source: &Path,
    root: &Path,
    ext: &str,
) -> Result<Vec<Trial>, DataError> {
    let mut trials = Vec::new();
    for (n, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let malformed = |reason: String| DataError::MalformedTrialLine {
            path: source.to_path_buf(),
            line: n + 1,
            reason,
        };
        let tokens: Vec<&str> = line.split(' ').collect();
        let [label, enrol, test] = tokens[..] else {
            return Err(malformed(format!("expected 3 tokens, got {}", tokens.len())));
        };
        let label: i64 = label
            .parse()
            .map_err(|_| malformed(format!("label {label:?} is not an integer")))?;
        trials.push(Trial {
            enrol: resolve(root, enrol, ext),
            test: resolve(root, test, ext),
            same: label != 0,
        });
    }
    Ok(trials)
}

fn resolve(root: &Path, rel: &str, ext: &str) -> PathBuf {
    root.join(rel).with_extension(ext)
}

/// One side (enrol or test) of a trial list, deduplicated by path.
///
/// Holds each distinct path once, sorted, and maps every trial to its
/// distinct index through [`TrialSet::sample_idxs`]. Callers must go
/// through that mapping: loading per trial would reload shared samples.
pub struct TrialSet {
    distinct: Vec<PathBuf>,
    sample_idxs: Vec<usize>,
    store: Arc<dyn UtteranceStore>,
}

impl TrialSet {
    /// Deduplicates `paths`, one entry per trial.
    pub fn new(paths: &[PathBuf], store: Arc<dyn UtteranceStore>) -> Self {
        let distinct: Vec<PathBuf> = paths
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let index: BTreeMap<&Path, usize> = distinct
            .iter()
            .enumerate()
            .map(|(i, p)| (p.as_path(), i))
            .collect();
        let sample_idxs = paths.iter().map(|p| index[p.as_path()]).collect();
        Self {
            distinct,
            sample_idxs,
            store,
        }
    }

    /// Distinct paths, sorted.
    pub fn distinct_paths(&self) -> &[PathBuf] {
        &self.distinct
    }

    /// For trial `j`, the index of its sample in [`Self::distinct_paths`].
    pub fn sample_idxs(&self) -> &[usize] {
        &self.sample_idxs
    }

    /// Number of trials indexed by this set.
    pub fn trial_count(&self) -> usize {
        self.sample_idxs.len()
    }
}

impl FeatureSet for TrialSet {
    fn len(&self) -> usize {
        self.distinct.len()
    }

    fn path(&self, index: usize) -> Result<&Path, DataError> {
        self.distinct
            .get(index)
            .map(PathBuf::as_path)
            .ok_or(DataError::IndexOutOfRange {
                index,
                len: self.distinct.len(),
            })
    }

    fn load(&self, index: usize) -> Result<Utterance, DataError> {
        let path = self.path(index)?;
        Ok(Utterance {
            path: path.to_path_buf(),
            frames: self.store.load(path)?,
        })
    }
}

/// A parsed trial list: deduplicated enrol and test sets plus the
/// same-speaker label of every trial.
pub struct VerificationTrials {
    pub enrol: TrialSet,
    pub test: TrialSet,
    pub labels: Vec<bool>,
}

impl VerificationTrials {
    /// Parses `trial_file`, resolving sample paths below `root` with the
    /// store's native extension.
    pub fn build(
        trial_file: &Path,
        root: &Path,
        store: Arc<dyn UtteranceStore>,
    ) -> Result<Self, DataError> {
        let trials = parse_trials(trial_file, root, store.extension())?;
        let trials = Self::from_trials(&trials, store);
        info!(
            file = %trial_file.display(),
            trials = trials.len(),
            enrol = trials.enrol.len(),
            test = trials.test.len(),
            "verification trials built"
        );
        Ok(trials)
    }

    pub fn from_trials(trials: &[Trial], store: Arc<dyn UtteranceStore>) -> Self {
        let enrol: Vec<PathBuf> = trials.iter().map(|t| t.enrol.clone()).collect();
        let test: Vec<PathBuf> = trials.iter().map(|t| t.test.clone()).collect();
        Self {
            enrol: TrialSet::new(&enrol, Arc::clone(&store)),
            test: TrialSet::new(&test, store),
            labels: trials.iter().map(|t| t.same).collect(),
        }
    }

    /// Number of trials.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn positives(&self) -> usize {
        self.labels.iter().filter(|&&l| l).count()
    }

    pub fn negatives(&self) -> usize {
        self.len() - self.positives()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const TRIALS: &str = "1 id10270/x6uYqmx31kE/00001.wav id10270/8jEAjG6SegY/00008.wav\n\
                          0 id10270/x6uYqmx31kE/00001.wav id10300/ize_eiCFEg0/00003.wav\n\
                          1 id10270/5r0dWxy17C8/00001.wav id10270/GWXujl-xAVM/00017.wav\n";

    fn parse(text: &str) -> Result<Vec<Trial>, DataError> {
        parse_trials_str(text, Path::new("veri.txt"), Path::new("/test"), "npy")
    }

    #[test]
    fn test_parse_resolves_paths() {
        let trials = parse(TRIALS).unwrap();
        assert_eq!(trials.len(), 3);
        assert_eq!(
            trials[0].enrol,
            PathBuf::from("/test/id10270/x6uYqmx31kE/00001.npy")
        );
        assert_eq!(
            trials[1].test,
            PathBuf::from("/test/id10300/ize_eiCFEg0/00003.npy")
        );
        assert!(trials[0].same);
        assert!(!trials[1].same);
    }

    #[test]
    fn test_parse_wrong_token_count() {
        let err = parse("1 a.wav b.wav\n0 a.wav\n").unwrap_err();
        match err {
            DataError::MalformedTrialLine { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_parse_double_space_is_malformed() {
        assert!(matches!(
            parse("1 a.wav  b.wav\n"),
            Err(DataError::MalformedTrialLine { line: 1, .. })
        ));
    }

    #[test]
    fn test_parse_ignores_surrounding_whitespace() {
        let trials = parse("1 a.wav b.wav \n\t0 c.wav d.wav\t\r\n").unwrap();
        assert_eq!(trials.len(), 2);
        assert_eq!(trials[0].test, PathBuf::from("/test/b.npy"));
        assert_eq!(trials[1].enrol, PathBuf::from("/test/c.npy"));
        assert!(!trials[1].same);
    }

    #[test]
    fn test_parse_bad_label() {
        assert!(matches!(
            parse("yes a.wav b.wav\n"),
            Err(DataError::MalformedTrialLine { .. })
        ));
    }

    #[test]
    fn test_parse_skips_blank_lines_and_crlf() {
        let trials = parse("1 a.wav b.wav\r\n\n0 c.wav d.wav\r\n").unwrap();
        assert_eq!(trials.len(), 2);
        assert_eq!(trials[1].test, PathBuf::from("/test/d.npy"));
    }

    #[test]
    fn test_trial_set_dedup() {
        let trials = parse(TRIALS).unwrap();
        let set = VerificationTrials::from_trials(&trials, Arc::new(MemoryStore::new()));
        assert_eq!(set.len(), 3);
        assert_eq!(set.enrol.len(), 2);
        assert_eq!(set.test.len(), 3);
        assert_eq!(set.enrol.trial_count(), 3);

        let idx = set.enrol.sample_idxs();
        assert_eq!(idx[0], idx[1]);
        assert_ne!(idx[0], idx[2]);
        for (j, t) in trials.iter().enumerate() {
            assert_eq!(set.enrol.path(idx[j]).unwrap(), t.enrol.as_path());
            assert_eq!(set.test.path(set.test.sample_idxs()[j]).unwrap(), t.test.as_path());
        }

        let distinct = set.enrol.distinct_paths();
        assert!(distinct.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_trial_set_out_of_range() {
        let trials = parse(TRIALS).unwrap();
        let set = VerificationTrials::from_trials(&trials, Arc::new(MemoryStore::new()));
        let n = set.enrol.len();
        assert!(matches!(
            set.enrol.load(n),
            Err(DataError::IndexOutOfRange { index, len }) if index == n && len == n
        ));
        assert!(set.test.path(set.test.len()).is_err());
    }

    #[test]
    fn test_trial_set_all_unique() {
        let paths: Vec<PathBuf> = (0..5).map(|i| PathBuf::from(format!("/t/{i}.npy"))).collect();
        let set = TrialSet::new(&paths, Arc::new(MemoryStore::new()));
        assert_eq!(set.len(), paths.len());
    }

    #[test]
    fn test_trial_set_deterministic() {
        let trials = parse(TRIALS).unwrap();
        let a = VerificationTrials::from_trials(&trials, Arc::new(MemoryStore::new()));
        let b = VerificationTrials::from_trials(&trials, Arc::new(MemoryStore::new()));
        assert_eq!(a.enrol.sample_idxs(), b.enrol.sample_idxs());
        assert_eq!(a.test.sample_idxs(), b.test.sample_idxs());
    }

    #[test]
    fn test_build_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("veri.txt");
        std::fs::write(&file, TRIALS).unwrap();
        let set = VerificationTrials::build(&file, Path::new("/test"), Arc::new(MemoryStore::new()))
            .unwrap();
        assert_eq!(set.positives(), 2);
        assert_eq!(set.negatives(), 1);
    }

    #[test]
    fn test_build_missing_file() {
        let res = VerificationTrials::build(
            Path::new("/definitely/missing/veri.txt"),
            Path::new("/test"),
            Arc::new(MemoryStore::new()),
        );
        assert!(matches!(res, Err(DataError::Io { .. })));
    }
}
