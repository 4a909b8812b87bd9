//! Flush decisions and the global memory watcher

use std::cmp::Reverse;
use std::sync::Arc;

use sysinfo::System;
use tracing::{info, warn};

use super::config::TsdbConfig;
use super::family::DataFamily;

/// Why a family is flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Frozen memdbs or a mutable memdb past its age or size limit
    Ready,
    /// A previous flush failed
    Degraded,
    /// The shard holds too many memdbs or too many memdb bytes
    ShardLimit,
    /// Resident memory of the node is above the high watermark
    MemoryPressure,
}

/// Families of one shard to flush this round, with their reason
pub fn pick_families(
    families: &[Arc<DataFamily>],
    config: &TsdbConfig,
    memory_pressure: bool,
) -> Vec<(Arc<DataFamily>, FlushReason)> {
    let mut picked = Vec::new();
    let mut rest = Vec::new();
    for family in families {
        if family.num_memdbs() == 0 {
            continue;
        }
        if family.is_degraded() {
            picked.push((family.clone(), FlushReason::Degraded));
        } else if family.is_flushable() {
            picked.push((family.clone(), FlushReason::Ready));
        } else {
            rest.push(family.clone());
        }
    }

    // largest first until the shard is back under its limits
    rest.sort_by_key(|f| Reverse(f.memdb_size()));
    let mut size: u64 = rest.iter().map(|f| f.memdb_size()).sum();
    let mut count: usize = rest.iter().map(|f| f.num_memdbs()).sum();
    for family in rest {
        if memory_pressure {
            picked.push((family, FlushReason::MemoryPressure));
            continue;
        }
        if size <= config.max_memdb_total_size && count <= config.max_memdb_number {
            break;
        }
        size = size.saturating_sub(family.memdb_size());
        count = count.saturating_sub(family.num_memdbs());
        picked.push((family, FlushReason::ShardLimit));
    }
    picked
}

/// Hysteresis over the node's resident memory ratio: pressure starts at
/// `high` and lasts until usage falls to `low`
pub struct MemoryWatcher {
    system: System,
    high: f64,
    low: f64,
    pressure: bool,
}

impl MemoryWatcher {
    pub fn new(config: &TsdbConfig) -> Self {
        Self {
            system: System::new(),
            high: config.max_mem_usage_before_flush,
            low: config.target_mem_usage_after_flush,
            pressure: false,
        }
    }

    /// Refresh memory usage and return whether the node is under pressure
    pub fn check(&mut self) -> bool {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return self.pressure;
        }
        let ratio = self.system.used_memory() as f64 / total as f64;
        self.observe(ratio)
    }

    /// Feed one usage ratio sample
    pub fn observe(&mut self, ratio: f64) -> bool {
        let next = next_pressure(self.pressure, ratio, self.high, self.low);
        if next != self.pressure {
            if next {
                warn!(usage = ratio, high = self.high, "memory usage high, force flush");
            } else {
                info!(usage = ratio, low = self.low, "memory usage back to normal");
            }
            self.pressure = next;
        }
        next
    }
}

fn next_pressure(pressure: bool, ratio: f64, high: f64, low: f64) -> bool {
    if pressure {
        ratio > low
    } else {
        ratio >= high
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DataFamilyOptions;
    use crate::types::timeutil::{ONE_HOUR, ONE_SECOND};
    use crate::types::{FieldType, Interval, Row};
    use crate::version::TableCache;
    use std::time::Duration;
    use tempfile::TempDir;

    fn family(dir: &TempDir, family_time: i64) -> Arc<DataFamily> {
        Arc::new(
            DataFamily::open(
                &dir.path().join(format!("family-{family_time}")),
                1,
                DataFamilyOptions {
                    family_time,
                    family_width: ONE_HOUR,
                    interval: Interval::from_millis(10 * ONE_SECOND).unwrap(),
                    max_memdb_size: 1 << 30,
                    mutable_memdb_ttl: Duration::from_secs(1800),
                },
                Arc::new(TableCache::new(8)),
            )
            .unwrap(),
        )
    }

    fn fill(family: &DataFamily, series: u32) {
        let rows: Vec<Row> = (0..series)
            .map(|s| Row::new(1, s, family.family_time()).with_field(1, FieldType::Sum, 1.0))
            .collect();
        family.write_rows(&rows).unwrap();
    }

    #[test]
    fn test_hysteresis() {
        assert!(!next_pressure(false, 0.7, 0.75, 0.6));
        assert!(next_pressure(false, 0.75, 0.75, 0.6));
        assert!(next_pressure(true, 0.65, 0.75, 0.6));
        assert!(!next_pressure(true, 0.6, 0.75, 0.6));
    }

    #[test]
    fn test_pick_families() {
        let dir = TempDir::new().unwrap();
        let small = family(&dir, 0);
        let big = family(&dir, ONE_HOUR);
        let frozen = family(&dir, 2 * ONE_HOUR);
        let empty = family(&dir, 3 * ONE_HOUR);
        fill(&small, 1);
        fill(&big, 100);
        fill(&frozen, 1);
        frozen.freeze();
        let all = vec![small.clone(), big.clone(), frozen.clone(), empty];

        let config = TsdbConfig::default();
        let picked = pick_families(&all, &config, false);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].0.family_time(), 2 * ONE_HOUR);
        assert_eq!(picked[0].1, FlushReason::Ready);

        let tight = TsdbConfig {
            max_memdb_number: 1,
            ..TsdbConfig::default()
        };
        let picked = pick_families(&all, &tight, false);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[1].0.family_time(), ONE_HOUR);
        assert_eq!(picked[1].1, FlushReason::ShardLimit);

        let picked = pick_families(&all, &config, true);
        assert_eq!(picked.len(), 3);
        assert!(picked.iter().skip(1).all(|(_, r)| *r == FlushReason::MemoryPressure));
    }
}
