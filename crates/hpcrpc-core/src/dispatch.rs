//! Outbound dispatch: forward and bulk transfer.
//!
//! Each operation issues a transport request whose completion callback owns
//! the sending half of a oneshot channel, then suspends the calling unit on
//! the receiving half. The callback runs on the progress pool and resumes
//! exactly the unit that issued the operation. Successful operations are
//! folded into the `Origin` breadcrumb for their call path and traced.

use std::time::Instant;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::debug;

use crate::address::Address;
use crate::breadcrumb::{chain_call_path, BreadcrumbType, CallPathKey, Observation};
use crate::error::{Result, RpcError};
use crate::instance::Instance;
use crate::metadata::{self, RequestHeader};
use crate::pool::Pool;
use crate::trace::{wall_clock_secs, EventType, TraceEvent, Window};
use crate::transport::{BulkHandle, BulkOp, BulkRequest, RpcHandle};

/// Waits for a completion, counting the current unit as blocked meanwhile.
/// Returns the result and the instant the callback fired.
async fn suspend<T>(rx: oneshot::Receiver<(Result<T>, Instant)>) -> Result<(T, Instant)> {
    let completion = {
        let _blocked = Pool::current_unit_pool().map(|pool| pool.block_current());
        rx.await
    };
    let (result, fired) = completion.map_err(|_| RpcError::CompletionDropped)?;
    result.map(|value| (value, fired))
}

impl Instance {
    /// Sends `input` on `handle` and waits for the response payload.
    pub async fn forward(&self, handle: &RpcHandle, input: Bytes) -> Result<Bytes> {
        self.forward_with(handle, input, Instant::now(), 0.0, Ok).await
    }

    /// Like [`forward`](Self::forward), with bincode-encoded input and output.
    pub async fn forward_typed<I, O>(&self, handle: &RpcHandle, input: &I) -> Result<O>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let started = Instant::now();
        let encoded = bincode::serialize(input)?;
        let input_serial_time = started.elapsed().as_secs_f64();
        self.forward_with(handle, Bytes::from(encoded), started, input_serial_time, |out| {
            Ok(bincode::deserialize(&out)?)
        })
        .await
    }

    async fn forward_with<O>(
        &self,
        handle: &RpcHandle,
        input: Bytes,
        started: Instant,
        input_serial_time: f64,
        decode: impl FnOnce(Bytes) -> Result<O>,
    ) -> Result<O> {
        self.assert_live();
        let inner = &self.inner;

        let parent = metadata::current();
        let call_path_id = chain_call_path(
            parent.map_or(0, |md| md.rpc_breadcrumb),
            handle.rpc_id.as_u64(),
        );
        let trace_id = parent
            .map(|md| md.trace_id)
            .filter(|id| *id != 0)
            .unwrap_or_else(metadata::new_trace_id);
        let name = handle.rpc_id.to_string();
        let pool = inner.handler_pool.sample();
        let start_wall = wall_clock_secs();

        // the sequence travels in the header, the record waits until the send is accepted
        let send_sequence = inner.tracer.reserve_sequence();
        let send_event = TraceEvent::new(EventType::ClientSend, trace_id, call_path_id, name.as_str())
            .pool(pool)
            .size(input.len() as u64);
        let header = RequestHeader {
            rpc_breadcrumb: call_path_id,
            trace_id,
            ordering_sequence: send_sequence,
        };

        let _outstanding = self.track_outstanding();
        let (tx, rx) = oneshot::channel();
        inner.transport.forward(
            handle,
            header,
            input,
            Box::new(move |result| {
                let _ = tx.send((result, Instant::now()));
            }),
        )?;
        let issued = Instant::now();
        inner.tracer.record_reserved(send_sequence, send_event);

        let (output, fired) = match suspend(rx).await {
            Ok(done) => done,
            Err(e) => {
                debug!(rpc = %name, peer = %handle.peer, error = %e, "forward failed");
                return Err(e);
            }
        };
        let resumed = Instant::now();

        let output_len = output.len() as u64;
        let decoded = decode(output)?;
        let output_deserial_time = resumed.elapsed().as_secs_f64();

        let obs = Observation {
            elapsed: started.elapsed().as_secs_f64(),
            completion_callback_time: resumed.saturating_duration_since(fired).as_secs_f64(),
            operation_time: fired.saturating_duration_since(issued).as_secs_f64(),
            input_serial_time,
            output_deserial_time,
            ..Observation::default()
        };
        let at_update = inner.handler_pool.sample();
        let obs = obs.with_pool_sample(at_update.size, at_update.total_size);
        let key = CallPathKey::new(call_path_id, handle.peer.hash64(), handle.provider_id);
        inner.table.update(key, BreadcrumbType::Origin, &obs);

        inner.tracer.record(
            TraceEvent::new(EventType::ClientReceive, trace_id, call_path_id, name)
                .pool(at_update)
                .operation(Window::new(start_wall, wall_clock_secs()))
                .size(output_len),
        );
        Ok(decoded)
    }

    /// Moves `size` bytes between local memory and memory registered by the
    /// peer at `origin_addr`, and waits for the transfer to finish.
    ///
    /// Inside a handler unit the transfer time and size are also charged to
    /// the RPC being served.
    #[allow(clippy::too_many_arguments)]
    pub async fn bulk_transfer(
        &self,
        op: BulkOp,
        origin_addr: &Address,
        origin_handle: &BulkHandle,
        origin_offset: usize,
        local_handle: &BulkHandle,
        local_offset: usize,
        size: usize,
    ) -> Result<usize> {
        self.assert_live();
        let inner = &self.inner;

        let current = metadata::current();
        let call_path_id = current.map_or(0, |md| md.rpc_breadcrumb);
        let trace_id = current.map_or(0, |md| md.trace_id);
        let started = Instant::now();
        let start_wall = wall_clock_secs();

        let request = BulkRequest {
            op,
            origin_addr: origin_addr.clone(),
            origin_handle: origin_handle.clone(),
            origin_offset,
            local_handle: local_handle.clone(),
            local_offset,
            size,
        };
        let _outstanding = self.track_outstanding();
        let (tx, rx) = oneshot::channel();
        inner.transport.bulk_transfer(
            request,
            Box::new(move |result| {
                let _ = tx.send((result, Instant::now()));
            }),
        )?;

        let (moved, fired) = match suspend(rx).await {
            Ok(done) => done,
            Err(e) => {
                debug!(peer = %origin_addr, ?op, size, error = %e, "bulk transfer failed");
                return Err(e);
            }
        };
        let end_wall = wall_clock_secs();
        let elapsed = started.elapsed().as_secs_f64();
        let window = Window::new(start_wall, end_wall);

        metadata::with_timings(|t| {
            t.bulk_transfer_time += elapsed;
            t.rdma_transfer_size += moved as u64;
            t.bulk_window = Some(match t.bulk_window {
                Some(prev) => Window::new(prev.start.min(window.start), prev.end.max(window.end)),
                None => window,
            });
        });

        let obs = Observation {
            elapsed,
            bulk_transfer_time: elapsed,
            rdma_transfer_time: fired.saturating_duration_since(started).as_secs_f64(),
            rdma_transfer_size: moved as u64,
            ..Observation::default()
        };
        let at_update = inner.handler_pool.sample();
        let obs = obs.with_pool_sample(at_update.size, at_update.total_size);
        // bulk transfers are not addressed to a provider
        let key = CallPathKey::new(call_path_id, origin_addr.hash64(), 0);
        inner.table.update(key, BreadcrumbType::Origin, &obs);

        inner.tracer.record(
            TraceEvent::new(EventType::ClientReceive, trace_id, call_path_id, "bulk_transfer")
                .pool(at_update)
                .bulk(window, moved as u64),
        );
        Ok(moved)
    }
}
