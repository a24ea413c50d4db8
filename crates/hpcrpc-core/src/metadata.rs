//! Per-request metadata owned by the execution unit serving the request.

use std::cell::RefCell;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::trace::Window;

/// Metadata of the request the current unit is serving.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub rpc_breadcrumb: u64,
    pub trace_id: u64,
    pub ordering_sequence: u64,
    pub current_rpc_id: u64,
}

/// Metadata an origin attaches to a forwarded request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub rpc_breadcrumb: u64,
    pub trace_id: u64,
    pub ordering_sequence: u64,
}

/// Phase timings a handler body reports back to the unit that runs it.
#[derive(Debug, Clone, Default)]
pub(crate) struct UnitTimings {
    pub input_deserial_time: f64,
    pub output_serial_time: f64,
    pub bulk_transfer_time: f64,
    pub rdma_transfer_size: u64,
    pub bulk_window: Option<Window>,
}

#[derive(Debug)]
pub(crate) struct UnitState {
    pub metadata: RequestMetadata,
    pub timings: UnitTimings,
}

tokio::task_local! {
    static UNIT: RefCell<UnitState>;
}

/// Metadata of the request being served by the current unit, if any.
pub fn current() -> Option<RequestMetadata> {
    UNIT.try_with(|unit| unit.borrow().metadata).ok()
}

/// Runs `fut` with `metadata` as the current unit's request metadata.
pub(crate) fn scope<F: Future>(metadata: RequestMetadata, fut: F) -> impl Future<Output = F::Output> {
    UNIT.scope(
        RefCell::new(UnitState {
            metadata,
            timings: UnitTimings::default(),
        }),
        fut,
    )
}

/// Applies `f` to the current unit's timings. No-op outside a handler unit.
pub(crate) fn with_timings(f: impl FnOnce(&mut UnitTimings)) {
    let _ = UNIT.try_with(|unit| f(&mut unit.borrow_mut().timings));
}

pub(crate) fn take_timings() -> UnitTimings {
    UNIT.try_with(|unit| std::mem::take(&mut unit.borrow_mut().timings))
        .unwrap_or_default()
}

/// Fresh random trace identifier.
pub fn new_trace_id() -> u64 {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).ok();
    // 0 means "no trace"
    u64::from_le_bytes(bytes).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_current_is_scoped() {
        assert!(current().is_none());
        let md = RequestMetadata {
            rpc_breadcrumb: 0x12,
            trace_id: 9,
            ordering_sequence: 4,
            current_rpc_id: 77,
        };
        let seen = scope(md, async { current() }).await;
        assert_eq!(seen, Some(md));
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn test_timings_accumulate_inside_scope() {
        let taken = scope(RequestMetadata::default(), async {
            with_timings(|t| t.bulk_transfer_time += 0.5);
            with_timings(|t| t.rdma_transfer_size += 128);
            take_timings()
        })
        .await;
        assert_eq!(taken.bulk_transfer_time, 0.5);
        assert_eq!(taken.rdma_transfer_size, 128);
    }

    #[test]
    fn test_with_timings_outside_unit_is_noop() {
        with_timings(|t| t.output_serial_time = 1.0);
        assert_eq!(take_timings().output_serial_time, 0.0);
    }

    #[test]
    fn test_trace_ids_nonzero() {
        assert_ne!(new_trace_id(), 0);
    }
}
