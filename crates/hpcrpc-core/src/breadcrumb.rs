//! Call-path identity and the per-path statistics accumulator.

use serde::{Deserialize, Serialize};

/// Bits each RPC hop contributes to a chained call path.
pub const CALL_PATH_HOP_BITS: u32 = 16;

/// Identity of one logical call path towards one endpoint.
///
/// Call paths that differ only by peer or provider are kept apart so the
/// aggregate can be broken down per endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallPathKey {
    /// Chained RPC breadcrumb.
    pub call_path_id: u64,
    /// Stable hash of the remote address for `Origin` entries, and of the
    /// serving instance's own address for `Target` entries.
    pub peer_address_hash: u64,
    /// Provider within the peer. Not globally unique.
    pub provider_id: u16,
}

impl CallPathKey {
    pub fn new(call_path_id: u64, peer_address_hash: u64, provider_id: u16) -> Self {
        Self {
            call_path_id,
            peer_address_hash,
            provider_id,
        }
    }
}

/// Extends a parent call path with one more RPC hop.
pub fn chain_call_path(parent: u64, rpc_id: u64) -> u64 {
    (parent << CALL_PATH_HOP_BITS) | (rpc_id & 0xffff)
}

/// Which side of an RPC an aggregate describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BreadcrumbType {
    /// The side issuing the RPC.
    Origin,
    /// The side executing the handler.
    Target,
}

/// One completed operation, ready to be folded into an aggregate.
///
/// All times are in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub elapsed: f64,
    pub handler_time: f64,
    pub completion_callback_time: f64,
    pub rdma_transfer_time: f64,
    pub rdma_transfer_size: u64,
    pub bulk_transfer_time: f64,
    pub input_serial_time: f64,
    pub input_deserial_time: f64,
    pub output_serial_time: f64,
    pub output_deserial_time: f64,
    pub operation_time: f64,
    /// Runnable units in the sampled pool.
    pub pool_size: u64,
    /// Runnable plus blocked units in the sampled pool.
    pub pool_total_size: u64,
}

impl Observation {
    pub fn with_elapsed(elapsed: f64) -> Self {
        Self {
            elapsed,
            ..Self::default()
        }
    }

    pub fn with_pool_sample(mut self, pool_size: u64, pool_total_size: u64) -> Self {
        self.pool_size = pool_size;
        self.pool_total_size = pool_total_size;
        self
    }
}

/// Accumulated statistics for one (call path, breadcrumb type) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsAggregate {
    pub min: f64,
    pub max: f64,
    pub cumulative: f64,

    pub handler_time: f64,
    pub completion_callback_time: f64,
    pub rdma_transfer_time: f64,
    pub rdma_transfer_size: u64,
    pub bulk_transfer_time: f64,
    pub input_serial_time: f64,
    pub input_deserial_time: f64,
    pub output_serial_time: f64,
    pub output_deserial_time: f64,
    pub operation_time: f64,

    // total pool size = runnable + blocked
    pub pool_total_size_lwm: u64,
    pub pool_total_size_hwm: u64,
    pub pool_total_size_cumulative: u64,

    pub pool_size_lwm: u64,
    pub pool_size_hwm: u64,
    pub pool_size_cumulative: u64,

    pub count: u64,
}

impl StatsAggregate {
    /// Creates an aggregate holding exactly one observation.
    pub fn from_observation(obs: &Observation) -> Self {
        let mut agg = Self::default();
        agg.fold(obs);
        agg
    }

    /// Folds one observation in.
    pub fn fold(&mut self, obs: &Observation) {
        if self.count == 0 {
            self.min = obs.elapsed;
            self.max = obs.elapsed;
            self.pool_size_lwm = obs.pool_size;
            self.pool_size_hwm = obs.pool_size;
            self.pool_total_size_lwm = obs.pool_total_size;
            self.pool_total_size_hwm = obs.pool_total_size;
        } else {
            self.min = self.min.min(obs.elapsed);
            self.max = self.max.max(obs.elapsed);
            self.pool_size_lwm = self.pool_size_lwm.min(obs.pool_size);
            self.pool_size_hwm = self.pool_size_hwm.max(obs.pool_size);
            self.pool_total_size_lwm = self.pool_total_size_lwm.min(obs.pool_total_size);
            self.pool_total_size_hwm = self.pool_total_size_hwm.max(obs.pool_total_size);
        }
        self.cumulative += obs.elapsed;

        self.handler_time += obs.handler_time;
        self.completion_callback_time += obs.completion_callback_time;
        self.rdma_transfer_time += obs.rdma_transfer_time;
        self.rdma_transfer_size = self.rdma_transfer_size.saturating_add(obs.rdma_transfer_size);
        self.bulk_transfer_time += obs.bulk_transfer_time;
        self.input_serial_time += obs.input_serial_time;
        self.input_deserial_time += obs.input_deserial_time;
        self.output_serial_time += obs.output_serial_time;
        self.output_deserial_time += obs.output_deserial_time;
        self.operation_time += obs.operation_time;

        self.pool_size_cumulative = self.pool_size_cumulative.saturating_add(obs.pool_size);
        self.pool_total_size_cumulative = self
            .pool_total_size_cumulative
            .saturating_add(obs.pool_total_size);

        self.count += 1;
    }

    /// Mean elapsed time, or 0 when empty.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.cumulative / self.count as f64
        }
    }

    /// Mean runnable pool size across all folded samples.
    pub fn mean_pool_size(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.pool_size_cumulative as f64 / self.count as f64
        }
    }

    /// Mean total pool size across all folded samples.
    pub fn mean_pool_total_size(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.pool_total_size_cumulative as f64 / self.count as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_equality_needs_all_fields() {
        let a = CallPathKey::new(42, 7, 3);
        assert_eq!(a, CallPathKey::new(42, 7, 3));
        assert_ne!(a, CallPathKey::new(42, 8, 3));
        assert_ne!(a, CallPathKey::new(42, 7, 4));
        assert_ne!(a, CallPathKey::new(43, 7, 3));
    }

    #[test]
    fn test_chain_call_path() {
        let first = chain_call_path(0, 0xABCD_1234);
        assert_eq!(first, 0x1234);
        let second = chain_call_path(first, 0x0000_BEEF);
        assert_eq!(second, 0x1234_BEEF);
    }

    #[test]
    fn test_fold_three_observations() {
        let mut agg = StatsAggregate::default();
        for elapsed in [1.0, 2.5, 0.5] {
            agg.fold(&Observation::with_elapsed(elapsed));
        }
        assert_eq!(agg.count, 3);
        assert_eq!(agg.min, 0.5);
        assert_eq!(agg.max, 2.5);
        assert!((agg.cumulative - 4.0).abs() < 1e-12);
        assert!((agg.mean() - 4.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_watermarks() {
        let mut agg = StatsAggregate::default();
        agg.fold(&Observation::with_elapsed(1.0).with_pool_sample(4, 6));
        agg.fold(&Observation::with_elapsed(1.0).with_pool_sample(2, 9));
        agg.fold(&Observation::with_elapsed(1.0).with_pool_sample(5, 5));

        assert_eq!(agg.pool_size_lwm, 2);
        assert_eq!(agg.pool_size_hwm, 5);
        assert_eq!(agg.pool_size_cumulative, 11);
        assert_eq!(agg.pool_total_size_lwm, 5);
        assert_eq!(agg.pool_total_size_hwm, 9);
        assert_eq!(agg.pool_total_size_cumulative, 20);
        assert!((agg.mean_pool_total_size() - 20.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_phase_timings_accumulate_independently() {
        let obs = Observation {
            elapsed: 1.0,
            handler_time: 0.25,
            bulk_transfer_time: 0.5,
            rdma_transfer_size: 4096,
            input_serial_time: 0.01,
            ..Observation::default()
        };
        let mut agg = StatsAggregate::from_observation(&obs);
        agg.fold(&obs);
        assert_eq!(agg.handler_time, 0.5);
        assert_eq!(agg.bulk_transfer_time, 1.0);
        assert_eq!(agg.rdma_transfer_size, 8192);
        assert!((agg.input_serial_time - 0.02).abs() < 1e-12);
        assert_eq!(agg.output_deserial_time, 0.0);
    }

    #[test]
    fn test_empty_means() {
        let agg = StatsAggregate::default();
        assert_eq!(agg.mean(), 0.0);
        assert_eq!(agg.mean_pool_size(), 0.0);
    }
}
