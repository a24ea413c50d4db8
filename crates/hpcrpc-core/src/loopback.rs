//! In-process loopback transport.
//!
//! Every context created from one [`LoopbackFabric`] can reach every other
//! listening context of that fabric by its `loop://` address. Sends,
//! responses and bulk transfers are queued on the receiving context and
//! their callbacks fire from that context's [`Transport::progress`], the same
//! way a network transport defers work to its progress loop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::address::{Address, RpcId};
use crate::error::{Result, RpcError};
use crate::metadata::RequestHeader;
use crate::transport::{
    BulkAccess, BulkHandle, BulkOp, BulkRequest, Completion, InboundHook, RpcHandle, Transport,
    TransportContextId, TransportFactory,
};

/// Address scheme understood by the loopback fabric.
pub const LOOPBACK_SCHEME: &str = "loop://";

// Context ids are unique per process, not per fabric, since instances are
// looked up by context id.
static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// Faults a test can arm on one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// `forward` is accepted, then completes with a transport error.
    FailForward,
    /// `forward` is refused immediately with `ResourceExhausted`.
    ExhaustForward,
    /// `create_handle` is refused with `ResourceExhausted`.
    ExhaustHandle,
    /// `bulk_transfer` is accepted, then completes with an error.
    FailBulk,
    /// `bulk_create` is refused with `ResourceExhausted`.
    ExhaustBulk,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricStats {
    pub forwards: u64,
    pub responses: u64,
    pub bulk_transfers: u64,
    pub failed: u64,
    pub bytes_transferred: u64,
}

#[derive(Default)]
struct FabricShared {
    endpoints: Mutex<HashMap<String, Weak<LoopbackTransport>>>,
    next_id: AtomicU64,
    stats: Mutex<FabricStats>,
}

impl FabricShared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn lookup(&self, addr: &str) -> Option<Arc<LoopbackTransport>> {
        let endpoints = self.endpoints.lock().ok()?;
        endpoints
            .get(addr)
            .and_then(Weak::upgrade)
            .filter(|ep| !ep.closed.load(Ordering::Acquire))
    }

    fn with_stats(&self, f: impl FnOnce(&mut FabricStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

/// A set of loopback contexts that can reach each other.
#[derive(Clone, Default)]
pub struct LoopbackFabric {
    shared: Arc<FabricShared>,
}

impl std::fmt::Debug for LoopbackFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackFabric")
            .field("stats", &self.stats())
            .finish()
    }
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `fault` for the next `times` matching operations on the context
    /// bound to `addr`. Returns false if no such context exists.
    pub fn inject(&self, addr: &str, fault: Fault, times: usize) -> bool {
        match self.shared.lookup(addr) {
            Some(ep) => {
                if let Ok(mut faults) = ep.faults.lock() {
                    *faults.entry(fault).or_insert(0) += times;
                }
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> FabricStats {
        self.shared
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

fn validate(address: &str) -> Result<()> {
    match address.strip_prefix(LOOPBACK_SCHEME) {
        Some(rest) if !rest.is_empty() && !rest.contains(char::is_whitespace) => Ok(()),
        _ => Err(RpcError::InvalidAddress {
            addr: address.to_string(),
        }),
    }
}

impl TransportFactory for LoopbackFabric {
    fn create(&self, listen: bool, address: &str) -> Result<Arc<dyn Transport>> {
        validate(address)?;
        let mut endpoints = self
            .shared
            .endpoints
            .lock()
            .map_err(|_| RpcError::Transport {
                reason: "fabric registry poisoned".to_string(),
            })?;
        if endpoints.get(address).and_then(Weak::upgrade).is_some() {
            return Err(RpcError::AddressInUse {
                addr: address.to_string(),
            });
        }

        let ctx = TransportContextId(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed));
        let endpoint = Arc::new(LoopbackTransport {
            ctx,
            addr: Address::new(address),
            listening: listen,
            shared: Arc::clone(&self.shared),
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            hook: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        endpoints.insert(address.to_string(), Arc::downgrade(&endpoint));
        debug!(ctx = ctx.0, addr = address, listen, "loopback context created");
        Ok(endpoint)
    }
}

enum Event {
    Fire(Box<dyn FnOnce() + Send>),
    Inbound(RpcHandle),
}

/// Forward waiting for its response on the origin context.
struct PendingCall {
    target: Address,
    on_complete: Completion<Bytes>,
}

/// One loopback transport context.
pub struct LoopbackTransport {
    ctx: TransportContextId,
    addr: Address,
    listening: bool,
    shared: Arc<FabricShared>,
    events: Mutex<VecDeque<Event>>,
    notify: Notify,
    hook: Mutex<Option<InboundHook>>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    faults: Mutex<HashMap<Fault, usize>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("ctx", &self.ctx)
            .field("addr", &self.addr)
            .field("listening", &self.listening)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl LoopbackTransport {
    /// Queues `event`, or hands it back if the context is finalized.
    ///
    /// `closed` is checked under the queue lock, so an event either lands
    /// before `finalize` drains the queue or is refused.
    fn enqueue(&self, event: Event) -> std::result::Result<(), Event> {
        {
            let Ok(mut events) = self.events.lock() else {
                return Err(event);
            };
            if self.closed.load(Ordering::Acquire) {
                return Err(event);
            }
            events.push_back(event);
        }
        self.notify.notify_one();
        Ok(())
    }

    fn fire(&self, f: impl FnOnce() + Send + 'static) {
        // a finalized context never runs progress again
        let _ = self.enqueue(Event::Fire(Box::new(f)));
    }

    /// Completes the forward waiting under `token` with `err`. Returns false
    /// if it already completed.
    fn fail_pending(&self, token: u64, err: RpcError) -> bool {
        let call = self.pending.lock().ok().and_then(|mut p| p.remove(&token));
        match call {
            Some(call) => {
                self.shared.with_stats(|s| s.failed += 1);
                self.fire(move || (call.on_complete)(Err(err)));
                true
            }
            None => false,
        }
    }

    /// Fails every forward from this context still waiting on `target`.
    fn fail_calls_to(&self, target: &Address) -> usize {
        let tokens: Vec<u64> = match self.pending.lock() {
            Ok(pending) => pending
                .iter()
                .filter(|(_, call)| &call.target == target)
                .map(|(token, _)| *token)
                .collect(),
            Err(_) => return 0,
        };
        tokens
            .into_iter()
            .filter(|token| self.fail_pending(*token, target_finalized(target)))
            .count()
    }

    fn take_events(&self) -> VecDeque<Event> {
        self.events
            .lock()
            .map(|mut events| std::mem::take(&mut *events))
            .unwrap_or_default()
    }

    fn take_fault(&self, fault: Fault) -> bool {
        let Ok(mut faults) = self.faults.lock() else {
            return false;
        };
        match faults.get_mut(&fault) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::Transport {
                reason: format!("context {} is finalized", self.addr),
            });
        }
        Ok(())
    }

    fn dispatch_inbound(&self, handle: RpcHandle) {
        let hook = self.hook.lock().ok().and_then(|h| h.clone());
        let result = match hook {
            Some(hook) => hook(self.ctx, handle.clone()),
            None => Err(RpcError::Transport {
                reason: format!("{} has no inbound hook", self.addr),
            }),
        };
        if let Err(e) = result {
            warn!(addr = %self.addr, rpc = %handle.rpc_id, error = %e, "inbound rpc refused");
            self.shared.with_stats(|s| s.failed += 1);
            if let Err(e) = self.respond(&handle, Err(e), Box::new(|_| {})) {
                debug!(error = %e, "could not report refused rpc");
            }
        }
    }
}

fn target_finalized(target: &Address) -> RpcError {
    RpcError::Transport {
        reason: format!("target {target} was finalized"),
    }
}

fn copy_bulk(request: &BulkRequest) -> Result<usize> {
    let (src, src_off, dst, dst_off) = match request.op {
        BulkOp::Push => (
            &request.local_handle,
            request.local_offset,
            &request.origin_handle,
            request.origin_offset,
        ),
        BulkOp::Pull => (
            &request.origin_handle,
            request.origin_offset,
            &request.local_handle,
            request.local_offset,
        ),
    };
    if !src.access().can_read() {
        return Err(RpcError::BulkTransfer {
            reason: format!("source region {} is not readable", src.id()),
        });
    }
    if !dst.access().can_write() {
        return Err(RpcError::BulkTransfer {
            reason: format!("destination region {} is not writable", dst.id()),
        });
    }
    let data = src
        .read_at(src_off, request.size)
        .ok_or_else(|| RpcError::BulkTransfer {
            reason: format!("read of {} bytes at {} out of range", request.size, src_off),
        })?;
    if !dst.write_at(dst_off, &data) {
        return Err(RpcError::BulkTransfer {
            reason: format!("write of {} bytes at {} out of range", request.size, dst_off),
        });
    }
    Ok(data.len())
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn context_id(&self) -> TransportContextId {
        self.ctx
    }

    fn self_addr(&self) -> Address {
        self.addr.clone()
    }

    fn addr_lookup(&self, name: &str) -> Result<Address> {
        validate(name)?;
        Ok(Address::new(name))
    }

    fn create_handle(&self, addr: &Address, rpc_id: RpcId, provider_id: u16) -> Result<RpcHandle> {
        self.ensure_open()?;
        if self.take_fault(Fault::ExhaustHandle) {
            return Err(RpcError::ResourceExhausted {
                reason: "no free rpc handles".to_string(),
            });
        }
        Ok(RpcHandle::outbound(
            self.shared.next_id(),
            addr.clone(),
            rpc_id,
            provider_id,
        ))
    }

    fn forward(
        &self,
        handle: &RpcHandle,
        header: RequestHeader,
        input: Bytes,
        on_complete: Completion<Bytes>,
    ) -> Result<()> {
        self.ensure_open()?;
        if self.take_fault(Fault::ExhaustForward) {
            return Err(RpcError::ResourceExhausted {
                reason: "send queue full".to_string(),
            });
        }
        if self.take_fault(Fault::FailForward) {
            self.shared.with_stats(|s| s.failed += 1);
            self.fire(move || {
                on_complete(Err(RpcError::Transport {
                    reason: "injected send failure".to_string(),
                }))
            });
            return Ok(());
        }

        let target = self
            .shared
            .lookup(handle.peer.as_str())
            .filter(|ep| ep.listening);
        let Some(target) = target else {
            let peer = handle.peer.clone();
            self.shared.with_stats(|s| s.failed += 1);
            self.fire(move || {
                on_complete(Err(RpcError::Transport {
                    reason: format!("no listener at {peer}"),
                }))
            });
            return Ok(());
        };

        let token = self.shared.next_id();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(
                token,
                PendingCall {
                    target: handle.peer.clone(),
                    on_complete,
                },
            );
        }
        let size = input.len() as u64;
        let inbound = RpcHandle {
            id: self.shared.next_id(),
            rpc_id: handle.rpc_id,
            provider_id: handle.provider_id,
            peer: self.addr.clone(),
            header,
            input,
            reply_token: token,
        };
        if target.enqueue(Event::Inbound(inbound)).is_err() {
            self.fail_pending(token, target_finalized(&handle.peer));
            return Ok(());
        }
        self.shared.with_stats(|s| {
            s.forwards += 1;
            s.bytes_transferred += size;
        });
        Ok(())
    }

    fn respond(&self, handle: &RpcHandle, response: Result<Bytes>, on_complete: Completion<()>) -> Result<()> {
        let origin = self.shared.lookup(handle.peer.as_str());
        if let Err(e) = self.ensure_open() {
            if let Some(origin) = &origin {
                origin.fail_pending(handle.reply_token, target_finalized(&self.addr));
            }
            return Err(e);
        }
        let waiting = origin.and_then(|origin| {
            let call = origin.pending.lock().ok()?.remove(&handle.reply_token)?;
            Some((origin, call.on_complete))
        });

        match waiting {
            Some((origin, cb)) => {
                let size = response.as_ref().map(|b| b.len() as u64).unwrap_or(0);
                self.shared.with_stats(|s| {
                    s.responses += 1;
                    s.bytes_transferred += size;
                });
                origin.fire(move || cb(response));
                self.fire(move || on_complete(Ok(())));
            }
            None => {
                let peer = handle.peer.clone();
                self.fire(move || {
                    on_complete(Err(RpcError::Transport {
                        reason: format!("origin {peer} is no longer waiting"),
                    }))
                });
            }
        }
        Ok(())
    }

    fn bulk_create(&self, buffer: Vec<u8>, access: BulkAccess) -> Result<BulkHandle> {
        self.ensure_open()?;
        if self.take_fault(Fault::ExhaustBulk) {
            return Err(RpcError::ResourceExhausted {
                reason: "cannot register bulk memory".to_string(),
            });
        }
        Ok(BulkHandle::new(self.shared.next_id(), buffer, access))
    }

    fn bulk_transfer(&self, request: BulkRequest, on_complete: Completion<usize>) -> Result<()> {
        self.ensure_open()?;
        let injected = self.take_fault(Fault::FailBulk);
        let reachable = self.shared.lookup(request.origin_addr.as_str()).is_some();
        let shared = Arc::clone(&self.shared);
        self.fire(move || {
            let result = if injected {
                Err(RpcError::BulkTransfer {
                    reason: "injected transfer failure".to_string(),
                })
            } else if !reachable {
                Err(RpcError::BulkTransfer {
                    reason: format!("origin {} unreachable", request.origin_addr),
                })
            } else {
                copy_bulk(&request)
            };
            shared.with_stats(|s| match &result {
                Ok(n) => {
                    s.bulk_transfers += 1;
                    s.bytes_transferred += *n as u64;
                }
                Err(_) => s.failed += 1,
            });
            on_complete(result)
        });
        Ok(())
    }

    fn set_inbound_hook(&self, hook: InboundHook) {
        if let Ok(mut slot) = self.hook.lock() {
            *slot = Some(hook);
        }
    }

    async fn progress(&self, timeout: Duration) -> Result<usize> {
        self.ensure_open()?;
        let mut batch = self.take_events();
        if batch.is_empty() {
            let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
            batch = self.take_events();
        }

        let fired = batch.len();
        for event in batch {
            match event {
                Event::Fire(f) => f(),
                Event::Inbound(handle) => self.dispatch_inbound(handle),
            }
        }
        Ok(fired)
    }

    fn finalize(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // dropping queued callbacks drops their completion senders
        drop(self.take_events());
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
        if let Ok(mut hook) = self.hook.lock() {
            hook.take();
        }
        let peers: Vec<Arc<LoopbackTransport>> = match self.shared.endpoints.lock() {
            Ok(mut endpoints) => {
                endpoints.remove(self.addr.as_str());
                endpoints.values().filter_map(Weak::upgrade).collect()
            }
            Err(_) => Vec::new(),
        };
        // queued or in service here, these requests will never be answered
        let failed: usize = peers.iter().map(|peer| peer.fail_calls_to(&self.addr)).sum();
        self.notify.notify_one();
        debug!(ctx = self.ctx.0, addr = %self.addr, failed, "loopback context finalized");
    }
}
