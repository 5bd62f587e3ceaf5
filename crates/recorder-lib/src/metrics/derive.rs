//! Derived values computed from raw stats samples
//!
//! Absent fields count as zero and every division by zero yields zero;
//! a partially reported sample never fails the phase.

use crate::models::{CpuStats, FsStats, InterfaceStats, MemoryStats, SwapStats};
use crate::store::to_db;

const NANOS_PER_CORE: f64 = 1e9;

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// `usageNanoCores / (cores × 1e9) × 100`
pub fn cpu_percent(cpu: Option<&CpuStats>, cores: u32) -> f64 {
    match cpu.and_then(|c| c.usage_nano_cores) {
        Some(nano) if cores > 0 => nano as f64 / (f64::from(cores) * NANOS_PER_CORE) * 100.0,
        _ => 0.0,
    }
}

/// Working set (usage when absent) over working set plus available
pub fn memory_percent(memory: Option<&MemoryStats>) -> f64 {
    let Some(memory) = memory else {
        return 0.0;
    };
    let Some(available) = memory.available_bytes else {
        return 0.0;
    };
    let used = memory
        .working_set_bytes
        .or(memory.usage_bytes)
        .unwrap_or(0);
    percent(used, used.saturating_add(available))
}

pub fn swap_percent(swap: Option<&SwapStats>) -> f64 {
    let Some(swap) = swap else {
        return 0.0;
    };
    let used = swap.swap_usage_bytes.unwrap_or(0);
    let available = swap.swap_available_bytes.unwrap_or(0);
    percent(used, used.saturating_add(available))
}

pub fn memory_size(memory: Option<&MemoryStats>) -> i64 {
    to_db(memory.and_then(|m| m.usage_bytes).unwrap_or(0))
}

pub fn memory_rss(memory: Option<&MemoryStats>) -> i64 {
    to_db(memory.and_then(|m| m.rss_bytes).unwrap_or(0))
}

/// Capacity, usage and inode figures of one filesystem
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FsUsage {
    pub percent: f64,
    pub total: i64,
    pub free: i64,
    pub used: i64,
    pub inode_percent: f64,
    pub inode_total: i64,
    pub inode_free: i64,
    pub inodes_used: i64,
}

impl FsUsage {
    pub fn from_stats(fs: Option<&FsStats>) -> Self {
        let Some(fs) = fs else {
            return Self::default();
        };
        let capacity = fs.capacity_bytes.unwrap_or(0);
        let used = fs.used_bytes.unwrap_or(0);
        let inodes = fs.inodes.unwrap_or(0);
        let inodes_used = fs.inodes_used.unwrap_or(0);

        Self {
            percent: percent(used, capacity),
            total: to_db(capacity),
            free: to_db(fs.available_bytes.unwrap_or(0)),
            used: to_db(used),
            inode_percent: percent(inodes_used, inodes),
            inode_total: to_db(inodes),
            inode_free: to_db(fs.inodes_free.unwrap_or(0)),
            inodes_used: to_db(inodes_used),
        }
    }
}

/// Cumulative `[rx+tx, rx, tx, rxErrors, txErrors]` summed over interfaces
pub fn network_totals(interfaces: &[InterfaceStats]) -> Vec<i64> {
    let mut totals = [0u64; 5];
    for interface in interfaces {
        let rx = interface.rx_bytes.unwrap_or(0);
        let tx = interface.tx_bytes.unwrap_or(0);
        totals[0] = totals[0].saturating_add(rx.saturating_add(tx));
        totals[1] = totals[1].saturating_add(rx);
        totals[2] = totals[2].saturating_add(tx);
        totals[3] = totals[3].saturating_add(interface.rx_errors.unwrap_or(0));
        totals[4] = totals[4].saturating_add(interface.tx_errors.unwrap_or(0));
    }
    totals.into_iter().map(to_db).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_percent() {
        let cpu = CpuStats {
            usage_nano_cores: Some(500_000_000),
            usage_core_nano_seconds: None,
        };
        assert!((cpu_percent(Some(&cpu), 2) - 25.0).abs() < 1e-9);
        assert_eq!(cpu_percent(Some(&cpu), 0), 0.0);
        assert_eq!(cpu_percent(Some(&CpuStats::default()), 4), 0.0);
        assert_eq!(cpu_percent(None, 4), 0.0);
    }

    #[test]
    fn test_memory_percent_prefers_working_set() {
        let memory = MemoryStats {
            available_bytes: Some(300),
            usage_bytes: Some(900),
            working_set_bytes: Some(100),
            ..MemoryStats::default()
        };
        assert!((memory_percent(Some(&memory)) - 25.0).abs() < 1e-9);
        assert_eq!(memory_size(Some(&memory)), 900);
        assert_eq!(memory_rss(Some(&memory)), 0);

        let no_available = MemoryStats {
            usage_bytes: Some(900),
            ..MemoryStats::default()
        };
        assert_eq!(memory_percent(Some(&no_available)), 0.0);
    }

    #[test]
    fn test_swap_percent() {
        let swap = SwapStats {
            swap_available_bytes: Some(75),
            swap_usage_bytes: Some(25),
        };
        assert!((swap_percent(Some(&swap)) - 25.0).abs() < 1e-9);
        assert_eq!(swap_percent(Some(&SwapStats::default())), 0.0);
    }

    #[test]
    fn test_fs_usage_zero_capacity() {
        let fs = FsStats {
            used_bytes: Some(10),
            capacity_bytes: Some(0),
            ..FsStats::default()
        };
        let usage = FsUsage::from_stats(Some(&fs));
        assert_eq!(usage.percent, 0.0);
        assert_eq!(usage.used, 10);
        assert_eq!(FsUsage::from_stats(None), FsUsage::default());
    }

    #[test]
    fn test_fs_usage() {
        let fs = FsStats {
            available_bytes: Some(600),
            capacity_bytes: Some(1000),
            used_bytes: Some(400),
            inodes_free: Some(90),
            inodes: Some(100),
            inodes_used: Some(10),
        };
        let usage = FsUsage::from_stats(Some(&fs));
        assert!((usage.percent - 40.0).abs() < 1e-9);
        assert!((usage.inode_percent - 10.0).abs() < 1e-9);
        assert_eq!((usage.total, usage.free), (1000, 600));
        assert_eq!((usage.inode_total, usage.inode_free), (100, 90));
    }

    #[test]
    fn test_network_totals_sum_interfaces() {
        let interfaces = vec![
            InterfaceStats {
                name: "eth0".to_string(),
                rx_bytes: Some(10),
                rx_errors: Some(1),
                tx_bytes: Some(5),
                tx_errors: None,
            },
            InterfaceStats {
                name: "eth1".to_string(),
                rx_bytes: Some(1),
                rx_errors: None,
                tx_bytes: None,
                tx_errors: Some(2),
            },
        ];
        assert_eq!(network_totals(&interfaces), vec![16, 11, 5, 1, 2]);
        assert_eq!(network_totals(&[]), vec![0; 5]);
    }
}
