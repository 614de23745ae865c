//! In-memory worker liveness tracking.
//!
//! The persisted worker rows survive master restarts; this tracker holds the
//! master's own view of who pinged recently, used to gate scheduling and to
//! detect workers that went silent.

use boardlab_core::Hostname;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

struct Presence {
    last_seen: Instant,
    online: bool,
}

/// Tracks the last time each worker was heard from.
pub struct WorkerTracker {
    workers: HashMap<Hostname, Presence>,
    timeout: Duration,
}

impl WorkerTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            workers: HashMap::new(),
            timeout,
        }
    }

    /// Record traffic from a worker. Returns `true` when the worker was
    /// already known to this master instance.
    pub fn seen(&mut self, worker: &Hostname) -> bool {
        match self.workers.get_mut(worker) {
            Some(presence) => {
                presence.last_seen = Instant::now();
                presence.online = true;
                true
            }
            None => {
                self.workers.insert(
                    worker.clone(),
                    Presence {
                        last_seen: Instant::now(),
                        online: true,
                    },
                );
                false
            }
        }
    }

    pub fn is_online(&self, worker: &Hostname) -> bool {
        self.workers.get(worker).is_some_and(|p| p.online)
    }

    /// Hostnames of every worker currently considered online.
    pub fn online_workers(&self) -> HashSet<Hostname> {
        self.workers
            .iter()
            .filter(|(_, p)| p.online)
            .map(|(h, _)| h.clone())
            .collect()
    }

    /// Mark workers that exceeded the ping timeout as offline. Returns the
    /// workers that went offline in this pass.
    pub fn expire(&mut self) -> Vec<Hostname> {
        let now = Instant::now();
        let mut expired = Vec::new();
        for (hostname, presence) in &mut self.workers {
            if presence.online && now.duration_since(presence.last_seen) > self.timeout {
                presence.online = false;
                expired.push(hostname.clone());
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seen_reports_known_workers() {
        let mut tracker = WorkerTracker::new(Duration::from_secs(60));
        let worker = Hostname::new("worker-01");
        assert!(!tracker.seen(&worker));
        assert!(tracker.seen(&worker));
        assert!(tracker.is_online(&worker));
    }

    #[test]
    fn test_silent_workers_expire() {
        let mut tracker = WorkerTracker::new(Duration::from_millis(5));
        let worker = Hostname::new("worker-01");
        tracker.seen(&worker);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(tracker.expire(), vec![worker.clone()]);
        assert!(!tracker.is_online(&worker));
        // Already offline: not reported again.
        assert!(tracker.expire().is_empty());
    }

    #[test]
    fn test_ping_revives_expired_worker() {
        let mut tracker = WorkerTracker::new(Duration::from_millis(5));
        let worker = Hostname::new("worker-01");
        tracker.seen(&worker);
        std::thread::sleep(Duration::from_millis(10));
        tracker.expire();
        assert!(tracker.seen(&worker));
        assert!(tracker.is_online(&worker));
    }
}
