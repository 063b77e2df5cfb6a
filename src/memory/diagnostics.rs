use super::config::LeakPolicy;
use super::size_class::PoolId;
use super::stats::PoolStats;
use std::collections::HashMap;
use std::fmt;
use std::panic::Location;

/// Where a live allocation came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Pool { id: PoolId, block_size: usize },
    /// `exhausted_class` is set when the request belonged to a pool that was
    /// full and spilled over under `ExhaustionPolicy::Fallback`.
    Fallback { exhausted_class: Option<usize> },
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Pool { id, block_size } => {
                write!(f, "{block_size}-byte pool #{}", id.index())
            }
            Origin::Fallback {
                exhausted_class: Some(class),
            } => write!(f, "fallback (spilled from full {class}-byte pool)"),
            Origin::Fallback {
                exhausted_class: None,
            } => f.write_str("fallback"),
        }
    }
}

/// Metadata kept for every live allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationRecord {
    pub address: usize,
    /// Bytes the caller asked for (not the block size).
    pub size: usize,
    pub align: usize,
    pub origin: Origin,
    /// Creation order within the owning manager.
    pub sequence: u64,
    /// Call site of the allocation.
    pub site: &'static Location<'static>,
}

impl AllocationRecord {
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        matches!(self.origin, Origin::Fallback { .. })
    }
}

impl fmt::Display for AllocationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#x} ({} bytes, {}, seq {}) allocated at {}",
            self.address, self.size, self.origin, self.sequence, self.site
        )
    }
}

/// Live allocations keyed by address.
#[derive(Debug, Default)]
pub(crate) struct LeakTracker {
    live: HashMap<usize, AllocationRecord>,
}

impl LeakTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: AllocationRecord) {
        let previous = self.live.insert(record.address, record);
        debug_assert!(
            previous.is_none(),
            "address {:#x} handed out twice: {previous:?} and {record:?}",
            record.address
        );
    }

    pub fn remove(&mut self, addr: usize) -> Option<AllocationRecord> {
        self.live.remove(&addr)
    }

    pub fn get(&self, addr: usize) -> Option<&AllocationRecord> {
        self.live.get(&addr)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn records(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.live.values()
    }

    /// Remove every record, oldest first.
    pub fn drain_sorted(&mut self) -> Vec<AllocationRecord> {
        let mut records: Vec<_> = self.live.drain().map(|(_, record)| record).collect();
        records.sort_by_key(|record| record.sequence);
        records
    }
}

/// Sort records by creation order.
pub(crate) fn sorted(mut records: Vec<AllocationRecord>) -> Vec<AllocationRecord> {
    records.sort_by_key(|record| record.sequence);
    records
}

/// Result of tearing a manager down.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Allocations still outstanding at teardown, oldest first.
    pub leaks: Vec<AllocationRecord>,
    /// Final state of every pool.
    pub pools: Vec<PoolStats>,
}

impl TeardownReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.leaks.is_empty()
    }

    #[must_use]
    pub fn leaked_bytes(&self) -> usize {
        self.leaks.iter().map(|leak| leak.size).sum()
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            return f.write_str("no leaks");
        }
        writeln!(
            f,
            "{} leaked allocation(s), {} bytes:",
            self.leaks.len(),
            self.leaked_bytes()
        )?;
        for leak in &self.leaks {
            writeln!(f, "  {leak}")?;
        }
        Ok(())
    }
}

/// Log the report and apply the configured leak policy.
pub(crate) fn enforce_leak_policy(report: &TeardownReport, policy: LeakPolicy) {
    for leak in &report.leaks {
        log::warn!("leak: {leak}");
    }
    log::debug!(
        "teardown: {} pool(s), {} leak(s)",
        report.pools.len(),
        report.leaks.len()
    );
    if policy == LeakPolicy::Panic && !report.is_clean() {
        panic!("memory manager torn down with {report}");
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[track_caller]
    fn record(address: usize, sequence: u64) -> AllocationRecord {
        AllocationRecord {
            address,
            size: 10,
            align: 1,
            origin: Origin::Pool {
                id: PoolId(0),
                block_size: 16,
            },
            sequence,
            site: Location::caller(),
        }
    }

    #[test]
    fn test_tracker_insert_remove() {
        let mut tracker = LeakTracker::new();
        tracker.insert(record(0x1000, 1));
        tracker.insert(record(0x2000, 2));
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.remove(0x1000).map(|r| r.sequence), Some(1));
        assert!(tracker.remove(0x1000).is_none());
        assert!(tracker.get(0x2000).is_some());
    }

    #[test]
    fn test_drain_sorted_by_sequence() {
        let mut tracker = LeakTracker::new();
        for (addr, seq) in [(0x30, 3), (0x10, 1), (0x20, 2)] {
            tracker.insert(record(addr, seq));
        }
        let seqs: Vec<_> = tracker.drain_sorted().iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn test_record_display_names_site_and_pool() {
        let rec = record(0xABC0, 9);
        let text = rec.to_string();
        assert!(text.contains("0xabc0"));
        assert!(text.contains("16-byte pool #0"));
        assert!(text.contains("diagnostics.rs"));
    }

    #[test]
    fn test_report_totals() {
        let report = TeardownReport {
            leaks: vec![record(0x10, 1), record(0x20, 2)],
            pools: Vec::new(),
        };
        assert!(!report.is_clean());
        assert_eq!(report.leaked_bytes(), 20);
        assert!(report.to_string().starts_with("2 leaked allocation(s), 20 bytes"));
    }

    #[test]
    #[should_panic(expected = "torn down with 1 leaked allocation")]
    fn test_panic_policy_panics_on_leaks() {
        let report = TeardownReport {
            leaks: vec![record(0x10, 1)],
            pools: Vec::new(),
        };
        enforce_leak_policy(&report, LeakPolicy::Panic);
    }

    #[test]
    fn test_panic_policy_quiet_when_clean() {
        enforce_leak_policy(&TeardownReport::default(), LeakPolicy::Panic);
    }
}
