//! File-based process group.
//!
//! Workers meet at a rendezvous file on a filesystem every rank can see. Each
//! rank appends its rank number; the group is complete once every rank is
//! listed. Later collectives exchange per-generation files named
//! `<rendezvous>.<generation>.<rank>` next to it.

use crate::artifacts::write_atomic;
use crate::error::{TrainingError, TrainingResult};
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tessera_abstraction::{Collective, EngineError, EngineResult};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Returns `path`, or `path` with `_` appended until nothing exists there.
#[must_use]
pub fn unused_rendezvous_path(path: &Path) -> PathBuf {
    let mut candidate = path.to_path_buf();
    while candidate.exists() {
        warn!(path = %candidate.display(), "rendezvous file already exists, trying a different one");
        let mut name = candidate.into_os_string();
        name.push("_");
        candidate = PathBuf::from(name);
    }
    candidate
}

/// Removes the rendezvous file and every exchange file derived from it.
pub fn cleanup_rendezvous(path: &Path) -> TrainingResult<()> {
    remove_if_exists(path)?;
    let (Some(dir), Some(name)) = (path.parent(), path.file_name().and_then(|n| n.to_str())) else {
        return Ok(());
    };
    let dir = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };
    let prefix = format!("{name}.");
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_name().to_str().is_some_and(|n| n.starts_with(&prefix)) {
            remove_if_exists(&entry.path())?;
        }
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> TrainingResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// A joined group of `world_size` ranks.
#[derive(Debug)]
pub struct FileProcessGroup {
    path: PathBuf,
    rank: usize,
    world_size: usize,
    timeout: Duration,
    generation: u64,
}

impl FileProcessGroup {
    /// Registers `rank` at `path` and blocks until all ranks have registered.
    pub fn join(path: &Path, rank: usize, world_size: usize, timeout: Duration) -> TrainingResult<Self> {
        if rank >= world_size {
            return Err(TrainingError::CollectiveCommunicationFailure(format!(
                "rank {rank} is outside a group of {world_size}"
            )));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(format!("{rank}\n").as_bytes())?;
        file.sync_all()?;
        drop(file);

        let deadline = Instant::now() + timeout;
        loop {
            let joined = registered_ranks(path)?;
            if (0..world_size).all(|r| joined.contains(&r)) {
                break;
            }
            if Instant::now() >= deadline {
                return Err(TrainingError::CollectiveCommunicationFailure(format!(
                    "only {} of {world_size} ranks joined {} within {timeout:?}",
                    joined.len(),
                    path.display()
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        debug!(rank, world_size, path = %path.display(), "joined process group");

        Ok(Self { path: path.to_path_buf(), rank, world_size, timeout, generation: 0 })
    }

    fn exchange_path(&self, generation: u64, rank: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{generation}.{rank}"));
        PathBuf::from(name)
    }

    /// Publishes `payload` for the next generation and returns every rank's
    /// payload in rank order.
    fn exchange(&mut self, payload: &[u8]) -> EngineResult<Vec<Vec<u8>>> {
        self.generation += 1;
        let generation = self.generation;
        write_atomic(&self.exchange_path(generation, self.rank), payload)
            .map_err(|e| EngineError::Collective(e.to_string()))?;

        let deadline = Instant::now() + self.timeout;
        let mut received: Vec<Option<Vec<u8>>> = vec![None; self.world_size];
        while received.iter().any(Option::is_none) {
            for (rank, slot) in received.iter_mut().enumerate() {
                if slot.is_some() {
                    continue;
                }
                match std::fs::read(self.exchange_path(generation, rank)) {
                    Ok(bytes) => *slot = Some(bytes),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(EngineError::Collective(e.to_string())),
                }
            }
            if received.iter().all(Option::is_some) {
                break;
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Collective(format!(
                    "generation {generation} timed out after {:?} on rank {}",
                    self.timeout, self.rank
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        // Every rank has published this generation, so all of them are done
        // reading the one before the previous.
        if generation > 2 {
            let _ = std::fs::remove_file(self.exchange_path(generation - 2, self.rank));
        }
        Ok(received.into_iter().flatten().collect())
    }
}

fn registered_ranks(path: &Path) -> TrainingResult<BTreeSet<usize>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    Ok(content.lines().filter_map(|l| l.trim().parse().ok()).collect())
}

impl Collective for FileProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&mut self) -> EngineResult<()> {
        self.exchange(&[]).map(|_| ())
    }

    fn all_reduce_mean(&mut self, values: &mut [f32]) -> EngineResult<()> {
        // Raw little-endian floats: overflowed gradients must survive the trip.
        let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut sums = vec![0.0_f64; values.len()];
        for (rank, bytes) in self.exchange(&payload)?.iter().enumerate() {
            if bytes.len() != payload.len() {
                return Err(EngineError::Collective(format!(
                    "rank {rank} sent {} bytes, expected {}",
                    bytes.len(),
                    payload.len()
                )));
            }
            for (sum, chunk) in sums.iter_mut().zip(bytes.chunks_exact(4)) {
                *sum += f64::from(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
            }
        }
        let world = self.world_size as f64;
        for (v, sum) in values.iter_mut().zip(sums) {
            *v = (sum / world) as f32;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_unused_path_appends_underscores() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("rdv");
        assert_eq!(unused_rendezvous_path(&base), base);

        std::fs::write(&base, "").unwrap();
        std::fs::write(temp.path().join("rdv_"), "").unwrap();
        let picked = unused_rendezvous_path(&base);
        assert_eq!(picked, temp.path().join("rdv__"));
        assert_eq!(unused_rendezvous_path(&base), picked);
    }

    #[test]
    fn test_join_times_out_without_peers() {
        let temp = TempDir::new().unwrap();
        let err = FileProcessGroup::join(&temp.path().join("rdv"), 0, 2, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, TrainingError::CollectiveCommunicationFailure(_)));
    }

    #[test]
    fn test_group_averages_across_ranks() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("rdv");
        let world = 3;

        let handles: Vec<_> = (0..world)
            .map(|rank| {
                let path = path.clone();
                thread::spawn(move || {
                    let mut group = FileProcessGroup::join(&path, rank, world, Duration::from_secs(10)).unwrap();
                    group.barrier().unwrap();
                    let mut values = vec![rank as f32, 1.0];
                    group.all_reduce_mean(&mut values).unwrap();
                    let mut again = vec![10.0 * rank as f32];
                    group.all_reduce_mean(&mut again).unwrap();
                    group.barrier().unwrap();
                    (values, again)
                })
            })
            .collect();

        for handle in handles {
            let (values, again) = handle.join().unwrap();
            assert_eq!(values, vec![1.0, 1.0]);
            assert_eq!(again, vec![10.0]);
        }

        cleanup_rendezvous(&path).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(temp.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_single_rank_group() {
        let temp = TempDir::new().unwrap();
        let mut group = FileProcessGroup::join(&temp.path().join("solo"), 0, 1, Duration::from_secs(1)).unwrap();
        let mut values = vec![2.5];
        group.all_reduce_mean(&mut values).unwrap();
        assert_eq!(values, vec![2.5]);
        assert_eq!((group.rank(), group.world_size()), (0, 1));
    }

    #[test]
    fn test_cleanup_leaves_sibling_runs() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("rdv");
        for name in ["rdv", "rdv.1.0", "rdv.2.1", "rdv_", "rdv_.1.0"] {
            std::fs::write(temp.path().join(name), "").unwrap();
        }
        cleanup_rendezvous(&path).unwrap();
        let mut left: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        left.sort();
        assert_eq!(left, vec!["rdv_", "rdv_.1.0"]);
    }
}
