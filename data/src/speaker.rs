use std::collections::BTreeMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::DataError;

/// Base offset of speaker ids in the VoxCeleb naming scheme (`id10001` -> 0).
pub const VOXCELEB_ID_BASE: u32 = 10001;

static SPEAKER_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"id(\d+)").expect("valid speaker id pattern"));

/// Extracts raw speaker ids from sample paths.
///
/// A path must contain `id<digits>`; the raw id is the number minus the
/// base offset. The first match in the path wins.
#[derive(Debug, Clone)]
pub struct SpeakerPattern {
    base: u32,
}

impl SpeakerPattern {
    pub fn new(base: u32) -> Self {
        Self { base }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    /// Returns the offset-subtracted speaker id for `path`.
    pub fn speaker_of(&self, path: &Path) -> Result<u32, DataError> {
        let text = path.to_string_lossy();
        let id = SPEAKER_ID
            .captures(&text)
            .and_then(|c| c[1].parse::<u32>().ok())
            .ok_or_else(|| DataError::SpeakerPattern {
                path: path.to_path_buf(),
            })?;
        id.checked_sub(self.base)
            .ok_or_else(|| DataError::SpeakerBelowBase {
                path: path.to_path_buf(),
                id,
                base: self.base,
            })
    }
}

impl Default for SpeakerPattern {
    fn default() -> Self {
        Self::new(VOXCELEB_ID_BASE)
    }
}

/// The set of speakers a dataset is restricted to, with a dense label for
/// each one.
///
/// Labels are ranks in ascending raw-id order, so the mapping is a
/// bijection onto `[0, len)`. For a contiguous set `0..n` the label equals
/// the raw id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakerSet {
    labels: BTreeMap<u32, u32>,
}

impl SpeakerSet {
    pub fn new(ids: impl IntoIterator<Item = u32>) -> Result<Self, DataError> {
        let mut labels: BTreeMap<u32, u32> = ids.into_iter().map(|id| (id, 0)).collect();
        if labels.is_empty() {
            return Err(DataError::EmptySpeakerSet);
        }
        for (rank, label) in labels.values_mut().enumerate() {
            *label = rank as u32;
        }
        Ok(Self { labels })
    }

    /// Speakers `0..n`.
    pub fn first(n: u32) -> Result<Self, DataError> {
        Self::new(0..n)
    }

    /// Dense label of a raw speaker id, `None` if the speaker is excluded.
    pub fn label_of(&self, raw: u32) -> Option<u32> {
        self.labels.get(&raw).copied()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_speaker_of_voxceleb_path() {
        let p = SpeakerPattern::default();
        let id = p
            .speaker_of(Path::new("/data/processed/id10003/abc/00001.npy"))
            .unwrap();
        assert_eq!(id, 2);
    }

    #[test]
    fn test_speaker_of_missing_pattern() {
        let p = SpeakerPattern::default();
        let err = p.speaker_of(Path::new("/data/speaker7/a.npy")).unwrap_err();
        assert!(matches!(err, DataError::SpeakerPattern { .. }));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_speaker_below_base() {
        let p = SpeakerPattern::default();
        let err = p.speaker_of(&PathBuf::from("/d/id00042/a.npy")).unwrap_err();
        assert!(matches!(err, DataError::SpeakerBelowBase { id: 42, .. }));
    }

    #[test]
    fn test_speaker_set_dense_ranks() {
        let set = SpeakerSet::new([40, 7, 19]).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.label_of(7), Some(0));
        assert_eq!(set.label_of(19), Some(1));
        assert_eq!(set.label_of(40), Some(2));
        assert_eq!(set.label_of(8), None);
    }

    #[test]
    fn test_speaker_set_contiguous_identity() {
        let set = SpeakerSet::first(5).unwrap();
        for id in 0..5 {
            assert_eq!(set.label_of(id), Some(id));
        }
    }

    #[test]
    fn test_speaker_set_empty() {
        assert!(matches!(
            SpeakerSet::new(std::iter::empty()),
            Err(DataError::EmptySpeakerSet)
        ));
    }
}
