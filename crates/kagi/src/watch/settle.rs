use std::{
    collections::{hash_map::Entry, HashMap},
    io::ErrorKind,
    path::PathBuf,
    time::{Duration, Instant},
};

use super::WatchEvent;
use crate::util::Fingerprint;

struct Observation {
    fingerprint: Fingerprint,
    /// When `fingerprint` was last seen to change.
    observed_at: Instant,
    /// When the file became pending.
    since: Instant,
    warned: bool,
}

/// Tracks files and determines when they've stopped changing.
///
/// A file is settled once its size and modification time are the same in two
/// observations taken at least `interval` apart.
pub struct SettleTracker {
    pending: HashMap<PathBuf, Observation>,
    interval: Duration,
    stall_after: Duration,
}

impl SettleTracker {
    pub fn new(interval: Duration, stall_after: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            interval,
            stall_after,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Record that a file was created, modified or removed.
    ///
    /// Returns `Pending` the first time a file shows up and `Removed` when it
    /// no longer exists.
    pub fn file_changed(&mut self, path: PathBuf) -> Option<WatchEvent> {
        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.pending.remove(&path);
                return Some(WatchEvent::Removed(path));
            }
            Err(e) => {
                log::debug!("Failed to stat {}: {e}", path.display());
                return None;
            }
        };
        if !metadata.is_file() {
            return None;
        }

        let fingerprint = Fingerprint::from(&metadata);
        let now = Instant::now();
        match self.pending.entry(path) {
            Entry::Occupied(mut entry) => {
                let observation = entry.get_mut();
                if observation.fingerprint != fingerprint {
                    observation.fingerprint = fingerprint;
                    observation.observed_at = now;
                }
                None
            }
            Entry::Vacant(entry) => {
                let path = entry.key().clone();
                entry.insert(Observation {
                    fingerprint,
                    observed_at: now,
                    since: now,
                    warned: false,
                });
                Some(WatchEvent::Pending(path))
            }
        }
    }

    /// Observe every pending file again and return the ones that settled or vanished.
    pub fn check_settled(&mut self) -> Vec<WatchEvent> {
        let now = Instant::now();
        let interval = self.interval;
        let stall_after = self.stall_after;
        let mut events = Vec::new();

        self.pending.retain(|path, observation| {
            if now.duration_since(observation.observed_at) < interval {
                return true;
            }

            match std::fs::metadata(path) {
                Ok(metadata) => {
                    let fingerprint = Fingerprint::from(&metadata);
                    if fingerprint == observation.fingerprint {
                        events.push(WatchEvent::Ready(path.clone()));
                        return false;
                    }
                    observation.fingerprint = fingerprint;
                    observation.observed_at = now;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    events.push(WatchEvent::Removed(path.clone()));
                    return false;
                }
                Err(e) => {
                    log::debug!("Failed to stat {}: {e}", path.display());
                    observation.observed_at = now;
                }
            }

            if !observation.warned && now.duration_since(observation.since) >= stall_after {
                observation.warned = true;
                log::warn!(
                    "{} is still being written after {:?}, waiting.",
                    path.display(),
                    now.duration_since(observation.since)
                );
            }
            true
        });

        events.sort_by(|a, b| a.path().cmp(b.path()));
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const INTERVAL: Duration = Duration::from_millis(50);

    #[test]
    fn test_settles_after_two_observations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index000.m4s");
        std::fs::write(&path, b"abc").unwrap();

        let mut tracker = SettleTracker::new(INTERVAL, Duration::from_secs(30));
        assert_eq!(
            tracker.file_changed(path.clone()),
            Some(WatchEvent::Pending(path.clone()))
        );
        // a second notification for the same file is folded into the first one
        assert_eq!(tracker.file_changed(path.clone()), None);

        // not enough time has passed yet
        assert!(tracker.check_settled().is_empty());

        std::thread::sleep(INTERVAL * 2);
        assert_eq!(tracker.check_settled(), vec![WatchEvent::Ready(path)]);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_growing_file_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index001.m4s");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"first flush").unwrap();

        let mut tracker = SettleTracker::new(INTERVAL, Duration::from_secs(30));
        tracker.file_changed(path.clone());

        std::thread::sleep(INTERVAL * 2);
        file.write_all(b"second flush").unwrap();
        file.flush().unwrap();
        assert!(tracker.check_settled().is_empty());

        std::thread::sleep(INTERVAL * 2);
        assert_eq!(tracker.check_settled(), vec![WatchEvent::Ready(path)]);
    }

    #[test]
    fn test_removed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index002.m4s");
        std::fs::write(&path, b"abc").unwrap();

        let mut tracker = SettleTracker::new(INTERVAL, Duration::from_secs(30));
        tracker.file_changed(path.clone());
        std::fs::remove_file(&path).unwrap();

        std::thread::sleep(INTERVAL * 2);
        assert_eq!(tracker.check_settled(), vec![WatchEvent::Removed(path.clone())]);
        assert_eq!(tracker.file_changed(path.clone()), Some(WatchEvent::Removed(path)));
    }

    #[test]
    fn test_directories_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = SettleTracker::new(INTERVAL, Duration::from_secs(30));
        assert_eq!(tracker.file_changed(dir.path().to_path_buf()), None);
        assert_eq!(tracker.pending_count(), 0);
    }
}
