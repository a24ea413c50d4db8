//! Instance configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};

/// Configuration for one [`Instance`](crate::instance::Instance).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Upper bound for one blocking wait inside the progress loop (default: 100).
    pub progress_timeout_ms: u64,
    /// Whether trace records and system stats are kept (default: true).
    pub trace_enabled: bool,
    /// Records kept in memory before the oldest are dropped (default: 65536).
    /// With 0 records still reach the sink but nothing is buffered.
    pub trace_capacity: usize,
    /// Period of the system-stat sampler; `None` disables it (default: None).
    pub system_stat_interval_ms: Option<u64>,
    /// Cap on distinct breadcrumb entries; `None` keeps every call path (default: None).
    pub breadcrumb_max_entries: Option<usize>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            progress_timeout_ms: 100,
            trace_enabled: true,
            trace_capacity: 65536,
            system_stat_interval_ms: None,
            breadcrumb_max_entries: None,
        }
    }
}

impl InstanceConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| RpcError::Serialization(e.to_string()))
    }

    pub fn progress_timeout(&self) -> Duration {
        Duration::from_millis(self.progress_timeout_ms.max(1))
    }

    pub fn system_stat_interval(&self) -> Option<Duration> {
        self.system_stat_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = InstanceConfig::default();
        assert_eq!(cfg.progress_timeout(), Duration::from_millis(100));
        assert!(cfg.trace_enabled);
        assert_eq!(cfg.trace_capacity, 65536);
        assert!(cfg.system_stat_interval().is_none());
        assert!(cfg.breadcrumb_max_entries.is_none());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg = InstanceConfig::from_json(r#"{"system_stat_interval_ms": 250, "trace_capacity": 8}"#).unwrap();
        assert_eq!(cfg.system_stat_interval(), Some(Duration::from_millis(250)));
        assert_eq!(cfg.trace_capacity, 8);
        assert_eq!(cfg.progress_timeout_ms, 100);
    }

    #[test]
    fn test_zero_interval_disables_sampler() {
        let cfg = InstanceConfig {
            system_stat_interval_ms: Some(0),
            ..InstanceConfig::default()
        };
        assert!(cfg.system_stat_interval().is_none());
    }

    #[test]
    fn test_bad_json() {
        assert!(matches!(
            InstanceConfig::from_json("{not json"),
            Err(RpcError::Serialization(_))
        ));
    }
}
