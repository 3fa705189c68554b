//! Aggregation of SceneGraph rendezvous traces.
//!
//! When `logrendezvous` is enabled the device logs every cross-thread
//! field access as a BLOCK line (where the wait started) and an UNBLOCK
//! line (how long it took), correlated by a numeric rendezvous id. This
//! module pairs the two and folds completed waits into a per-site
//! histogram for display.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

/// Open BLOCK lines we keep around waiting for their UNBLOCK. The device
/// drops UNBLOCK lines under load, so the table is capped and the oldest
/// unmatched entries are evicted first.
const MAX_OPEN_RENDEZVOUS: usize = 512;

/// One rendezvous site (file + line) with its accumulated wait totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RendezvousEntry {
    /// Runtime-space path as the device reported it (`pkg:/...`).
    pub path: String,
    pub line: u32,
    pub hit_count: u64,
    pub total_seconds: f64,
    pub max_seconds: f64,
}

/// Snapshot of every site observed so far, sorted by (path, line) so
/// repeated snapshots of the same state compare equal.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RendezvousHistogram {
    pub entries: Vec<RendezvousEntry>,
}

#[derive(Debug, Clone)]
struct OpenRendezvous {
    path: String,
    line: u32,
}

/// Pairs BLOCK/UNBLOCK lines and owns the histogram.
#[derive(Debug, Default)]
pub struct RendezvousTracker {
    open: HashMap<u64, OpenRendezvous>,
    open_order: VecDeque<u64>,
    sites: HashMap<(String, u32), RendezvousEntry>,
}

impl RendezvousTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start of a wait. Evicts the oldest unmatched entry when
    /// the open table is full.
    pub fn observe_block(&mut self, id: u64, path: &str, line: u32) {
        while self.open.len() >= MAX_OPEN_RENDEZVOUS {
            match self.open_order.pop_front() {
                Some(stale) => {
                    self.open.remove(&stale);
                }
                None => break,
            }
        }
        self.open.insert(
            id,
            OpenRendezvous {
                path: path.to_string(),
                line,
            },
        );
        self.open_order.push_back(id);
    }

    /// Record the end of a wait. Returns a histogram snapshot when the
    /// UNBLOCK matched an open BLOCK, `None` for ids we never saw (or
    /// already evicted).
    pub fn observe_unblock(&mut self, id: u64, seconds: f64) -> Option<RendezvousHistogram> {
        let open = self.open.remove(&id)?;
        self.open_order.retain(|queued| *queued != id);

        let entry = self
            .sites
            .entry((open.path.clone(), open.line))
            .or_insert_with(|| RendezvousEntry {
                path: open.path,
                line: open.line,
                hit_count: 0,
                total_seconds: 0.0,
                max_seconds: 0.0,
            });
        entry.hit_count += 1;
        entry.total_seconds += seconds;
        if seconds > entry.max_seconds {
            entry.max_seconds = seconds;
        }

        Some(self.snapshot())
    }

    pub fn snapshot(&self) -> RendezvousHistogram {
        let mut entries: Vec<RendezvousEntry> = self.sites.values().cloned().collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path).then(a.line.cmp(&b.line)));
        RendezvousHistogram { entries }
    }

    pub fn clear(&mut self) {
        self.open.clear();
        self.open_order.clear();
        self.sites.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairing_accumulates_totals() {
        let mut tracker = RendezvousTracker::new();
        tracker.observe_block(1, "pkg:/components/task.brs", 42);
        let histogram = tracker.observe_unblock(1, 0.020).expect("paired");

        assert_eq!(histogram.entries.len(), 1);
        assert_eq!(histogram.entries[0].hit_count, 1);
        assert!((histogram.entries[0].total_seconds - 0.020).abs() < 1e-9);

        tracker.observe_block(2, "pkg:/components/task.brs", 42);
        let histogram = tracker.observe_unblock(2, 0.050).expect("paired");
        assert_eq!(histogram.entries[0].hit_count, 2);
        assert!((histogram.entries[0].total_seconds - 0.070).abs() < 1e-9);
        assert!((histogram.entries[0].max_seconds - 0.050).abs() < 1e-9);
    }

    #[test]
    fn test_unmatched_unblock_is_ignored() {
        let mut tracker = RendezvousTracker::new();
        assert!(tracker.observe_unblock(99, 1.0).is_none());
        assert!(tracker.snapshot().entries.is_empty());
    }

    #[test]
    fn test_snapshot_order_is_deterministic() {
        let mut tracker = RendezvousTracker::new();
        tracker.observe_block(1, "pkg:/b.brs", 9);
        tracker.observe_unblock(1, 0.1);
        tracker.observe_block(2, "pkg:/a.brs", 3);
        let histogram = tracker.observe_unblock(2, 0.1).expect("paired");

        assert_eq!(histogram.entries[0].path, "pkg:/a.brs");
        assert_eq!(histogram.entries[1].path, "pkg:/b.brs");
    }

    #[test]
    fn test_open_table_eviction() {
        let mut tracker = RendezvousTracker::new();
        for id in 0..(MAX_OPEN_RENDEZVOUS as u64 + 8) {
            tracker.observe_block(id, "pkg:/a.brs", 1);
        }
        // The earliest ids were evicted to make room.
        assert!(tracker.observe_unblock(0, 0.1).is_none());
        assert!(tracker
            .observe_unblock(MAX_OPEN_RENDEZVOUS as u64 + 7, 0.1)
            .is_some());
    }
}
