//! Whole-process and whole-host samples read from procfs.
//!
//! On hosts without procfs every reading falls back to zero.

use serde::{Deserialize, Serialize};

use crate::pool::PoolSample;
use crate::trace::wall_clock_secs;

/// Resource usage of this process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// User CPU time in clock ticks.
    pub user_ticks: u64,
    /// System CPU time in clock ticks.
    pub system_ticks: u64,
    pub voluntary_context_switches: u64,
    pub involuntary_context_switches: u64,
}

/// Periodic whole-process sample, independent of any call path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStat {
    pub pool_size: u64,
    pub pool_total_size: u64,
    /// Fraction of host CPU time busy since the previous sample.
    pub cpu_utilization: f64,
    /// Fraction of host memory in use.
    pub memory_utilization: f64,
    pub loadavg_1m: f64,
    pub loadavg_5m: f64,
    pub loadavg_15m: f64,
    pub timestamp: f64,
}

/// Stateful sampler; CPU utilization is a delta between successive samples.
#[derive(Debug, Default)]
pub struct SystemSampler {
    prev_cpu: Option<CpuTimes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self, pool: PoolSample) -> SystemStat {
        let (loadavg_1m, loadavg_5m, loadavg_15m) = read_proc("/proc/loadavg")
            .and_then(|s| parse_loadavg(&s))
            .unwrap_or((0.0, 0.0, 0.0));
        let memory_utilization = read_proc("/proc/meminfo")
            .and_then(|s| parse_meminfo(&s))
            .unwrap_or(0.0);

        let cpu = read_proc("/proc/stat").and_then(|s| parse_cpu_times(&s));
        let cpu_utilization = match (self.prev_cpu, cpu) {
            (Some(prev), Some(now)) if now.total > prev.total => {
                now.busy.saturating_sub(prev.busy) as f64 / (now.total - prev.total) as f64
            }
            _ => 0.0,
        };
        if cpu.is_some() {
            self.prev_cpu = cpu;
        }

        SystemStat {
            pool_size: pool.size,
            pool_total_size: pool.total_size,
            cpu_utilization,
            memory_utilization,
            loadavg_1m,
            loadavg_5m,
            loadavg_15m,
            timestamp: wall_clock_secs(),
        }
    }
}

/// Current resource usage of this process.
pub fn resource_usage() -> ResourceUsage {
    let (user_ticks, system_ticks) = read_proc("/proc/self/stat")
        .and_then(|s| parse_self_stat(&s))
        .unwrap_or((0, 0));
    let (voluntary, involuntary) = read_proc("/proc/self/status")
        .map(|s| parse_ctxt_switches(&s))
        .unwrap_or((0, 0));
    ResourceUsage {
        user_ticks,
        system_ticks,
        voluntary_context_switches: voluntary,
        involuntary_context_switches: involuntary,
    }
}

fn read_proc(path: &str) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

fn parse_loadavg(text: &str) -> Option<(f64, f64, f64)> {
    let mut fields = text.split_whitespace();
    let one = fields.next()?.parse().ok()?;
    let five = fields.next()?.parse().ok()?;
    let fifteen = fields.next()?.parse().ok()?;
    Some((one, five, fifteen))
}

fn parse_meminfo(text: &str) -> Option<f64> {
    let field = |name: &str| -> Option<u64> {
        text.lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total == 0 {
        return None;
    }
    Some(1.0 - available.min(total) as f64 / total as f64)
}

fn parse_cpu_times(text: &str) -> Option<CpuTimes> {
    let line = text.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() < 4 {
        return None;
    }
    let total: u64 = values.iter().sum();
    // idle + iowait
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

fn parse_self_stat(text: &str) -> Option<(u64, u64)> {
    // comm may contain spaces; fields resume after the last ')'
    let rest = &text[text.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // utime and stime are fields 14 and 15; `rest` starts at field 3
    let utime = fields.get(11)?.parse().ok()?;
    let stime = fields.get(12)?.parse().ok()?;
    Some((utime, stime))
}

fn parse_ctxt_switches(text: &str) -> (u64, u64) {
    let field = |name: &str| -> u64 {
        text.lines()
            .find(|l| l.starts_with(name))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    };
    (
        field("voluntary_ctxt_switches:"),
        field("nonvoluntary_ctxt_switches:"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_loadavg() {
        assert_eq!(
            parse_loadavg("0.52 0.58 0.59 1/467 12345\n"),
            Some((0.52, 0.58, 0.59))
        );
        assert_eq!(parse_loadavg("garbage"), None);
    }

    #[test]
    fn test_parse_meminfo() {
        let text = "MemTotal:       1000 kB\nMemFree:         100 kB\nMemAvailable:    250 kB\n";
        assert_eq!(parse_meminfo(text), Some(0.75));
        assert_eq!(parse_meminfo("MemTotal: 0 kB\nMemAvailable: 0 kB\n"), None);
    }

    #[test]
    fn test_parse_cpu_times() {
        let text = "cpu  10 0 10 70 10 0 0 0 0 0\ncpu0 5 0 5 35 5 0 0 0 0 0\n";
        let cpu = parse_cpu_times(text).unwrap();
        assert_eq!(cpu.total, 100);
        assert_eq!(cpu.busy, 20);
    }

    #[test]
    fn test_parse_self_stat_with_spaces_in_comm() {
        let text = "4242 (my prog (x)) S 1 4242 4242 0 -1 4194560 100 0 0 0 17 9 0 0 20 0 1 0 100 0 0";
        assert_eq!(parse_self_stat(text), Some((17, 9)));
    }

    #[test]
    fn test_parse_ctxt_switches() {
        let text = "Name:\tx\nvoluntary_ctxt_switches:\t12\nnonvoluntary_ctxt_switches:\t3\n";
        assert_eq!(parse_ctxt_switches(text), (12, 3));
        assert_eq!(parse_ctxt_switches(""), (0, 0));
    }

    #[test]
    fn test_sampler_carries_pool_sample() {
        let mut sampler = SystemSampler::new();
        let stat = sampler.sample(PoolSample {
            size: 3,
            total_size: 5,
        });
        assert_eq!(stat.pool_size, 3);
        assert_eq!(stat.pool_total_size, 5);
        assert!(stat.cpu_utilization >= 0.0 && stat.cpu_utilization <= 1.0);
        assert!(stat.timestamp > 0.0);
    }
}
