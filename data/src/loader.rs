//! Parallel sample loading and bounded in-order prefetch.

use std::path::PathBuf;
use std::sync::mpsc::sync_channel;

use rayon::prelude::*;

use crate::DataError;
use crate::dataset::FeatureSet;
use crate::store::{Frames, Utterance, UtteranceStore};

/// Loads every path in parallel. The result keeps the order of `paths`;
/// the first failure aborts the whole load.
pub fn load_all(store: &dyn UtteranceStore, paths: &[PathBuf]) -> Result<Vec<Frames>, DataError> {
    paths.par_iter().map(|p| store.load(p)).collect()
}

/// Loads the given items of a feature set in parallel, in order.
pub fn load_items<S>(set: &S, indices: &[usize]) -> Result<Vec<Utterance>, DataError>
where
    S: FeatureSet + ?Sized,
{
    indices.par_iter().map(|&i| set.load(i)).collect()
}

/// Runs `load` on a producer thread at most `depth` jobs ahead of
/// `consume`, which sees results in job order.
///
/// A load error is forwarded to the consumer and stops the producer. If
/// `consume` fails, the producer is stopped and its error is returned.
pub fn prefetch<J, T, E, I, L, C>(jobs: I, depth: usize, load: L, mut consume: C) -> Result<(), E>
where
    I: IntoIterator<Item = J>,
    I::IntoIter: Send,
    T: Send,
    E: From<DataError>,
    L: Fn(J) -> Result<T, DataError> + Sync,
    C: FnMut(T) -> Result<(), E>,
{
    let jobs = jobs.into_iter();
    std::thread::scope(|scope| {
        let (tx, rx) = sync_channel(depth.max(1));
        let load = &load;
        scope.spawn(move || {
            for job in jobs {
                let item = load(job);
                let failed = item.is_err();
                if tx.send(item).is_err() || failed {
                    break;
                }
            }
        });
        // Dropping `rx` on early return unblocks the producer.
        for item in rx {
            consume(item?)?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::path::Path;

    #[test]
    fn test_load_all_keeps_order() {
        let mut store = MemoryStore::new();
        let paths: Vec<PathBuf> = (0..16).map(|i| PathBuf::from(format!("/s/{i:02}.npy"))).collect();
        for (i, p) in paths.iter().enumerate() {
            store.insert(p.clone(), vec![vec![i as f32]]);
        }
        let frames = load_all(&store, &paths).unwrap();
        for (i, f) in frames.iter().enumerate() {
            assert_eq!(f[0][0], i as f32);
        }
    }

    #[test]
    fn test_load_all_fails_as_a_whole() {
        let mut store = MemoryStore::new();
        store.insert("/s/a.npy", vec![vec![1.0]]);
        let paths = vec![PathBuf::from("/s/a.npy"), PathBuf::from("/s/missing.npy")];
        let err = load_all(&store, &paths).unwrap_err();
        match err {
            DataError::StorageRead { path, .. } => assert_eq!(path, Path::new("/s/missing.npy")),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_prefetch_in_order() {
        let mut seen = Vec::new();
        let res: Result<(), DataError> = prefetch(0..50, 3, |j| Ok(j * 2), |v| {
            seen.push(v);
            Ok(())
        });
        res.unwrap();
        assert_eq!(seen, (0..50).map(|j| j * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_prefetch_load_error() {
        let mut seen = Vec::new();
        let res: Result<(), DataError> = prefetch(
            0..10,
            2,
            |j| {
                if j == 4 {
                    Err(DataError::Config("boom".into()))
                } else {
                    Ok(j)
                }
            },
            |v| {
                seen.push(v);
                Ok(())
            },
        );
        assert!(res.is_err());
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_prefetch_consumer_stops_early() {
        let mut count = 0;
        let res: Result<(), DataError> = prefetch(0..1000, 1, |j| Ok(j), |_| {
            count += 1;
            if count == 5 {
                return Err(DataError::Config("stop".into()));
            }
            Ok(())
        });
        assert!(res.is_err());
        assert_eq!(count, 5);
    }
}
