//! Transport interface consumed by the RPC core.
//!
//! The core never talks to the network directly. It resolves addresses,
//! creates handles, issues sends, responses and bulk transfers through the
//! [`Transport`] trait, and learns about completions and inbound requests
//! through callbacks that the transport fires from inside [`Transport::progress`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::address::{Address, RpcId};
use crate::error::Result;
use crate::metadata::RequestHeader;

/// Completion callback for one asynchronous transport operation. Fired
/// exactly once.
pub type Completion<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// Hook invoked once per inbound RPC with the receiving context and the
/// inbound handle. An error tells the transport to fail that RPC.
pub type InboundHook = Arc<dyn Fn(TransportContextId, RpcHandle) -> Result<()> + Send + Sync>;

/// Identity of one transport context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportContextId(pub u64);

/// Handle for one RPC.
///
/// Outbound handles come from [`Transport::create_handle`] and name the
/// target. Inbound handles are built by the transport, name the origin and
/// carry the request header and payload.
#[derive(Debug, Clone)]
pub struct RpcHandle {
    pub id: u64,
    pub rpc_id: RpcId,
    pub provider_id: u16,
    pub peer: Address,
    pub header: RequestHeader,
    pub input: Bytes,
    /// Transport-defined routing token for the response.
    pub reply_token: u64,
}

impl RpcHandle {
    pub fn outbound(id: u64, peer: Address, rpc_id: RpcId, provider_id: u16) -> Self {
        Self {
            id,
            rpc_id,
            provider_id,
            peer,
            header: RequestHeader::default(),
            input: Bytes::new(),
            reply_token: 0,
        }
    }
}

/// Direction of a bulk transfer, seen from the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkOp {
    /// Local memory to origin memory.
    Push,
    /// Origin memory to local memory.
    Pull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl BulkAccess {
    pub fn can_read(self) -> bool {
        matches!(self, BulkAccess::ReadOnly | BulkAccess::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, BulkAccess::WriteOnly | BulkAccess::ReadWrite)
    }
}

/// Registered memory usable as a bulk transfer source or destination.
#[derive(Clone)]
pub struct BulkHandle {
    id: u64,
    access: BulkAccess,
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl std::fmt::Debug for BulkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkHandle")
            .field("id", &self.id)
            .field("access", &self.access)
            .field("len", &self.len())
            .finish()
    }
}

impl BulkHandle {
    pub fn new(id: u64, buffer: Vec<u8>, access: BulkAccess) -> Self {
        Self {
            id,
            access,
            buffer: Arc::new(Mutex::new(buffer)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn access(&self) -> BulkAccess {
        self.access
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `len` bytes at `offset`, or None if out of range.
    pub fn read_at(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let buf = self.buffer.lock().ok()?;
        let end = offset.checked_add(len)?;
        if end > buf.len() {
            return None;
        }
        Some(buf[offset..end].to_vec())
    }

    /// Writes `data` at `offset`. Returns false if out of range.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> bool {
        let mut buf = match self.buffer.lock() {
            Ok(b) => b,
            Err(_) => return false,
        };
        let end = match offset.checked_add(data.len()) {
            Some(end) if end <= buf.len() => end,
            _ => return false,
        };
        buf[offset..end].copy_from_slice(data);
        true
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.buffer.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

/// One bulk transfer request.
#[derive(Debug, Clone)]
pub struct BulkRequest {
    pub op: BulkOp,
    pub origin_addr: Address,
    pub origin_handle: BulkHandle,
    pub origin_offset: usize,
    pub local_handle: BulkHandle,
    pub local_offset: usize,
    pub size: usize,
}

/// One transport context.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn context_id(&self) -> TransportContextId;

    /// Address other contexts use to reach this one.
    fn self_addr(&self) -> Address;

    /// Resolves a string address.
    fn addr_lookup(&self, name: &str) -> Result<Address>;

    /// Creates a handle for one outbound RPC.
    fn create_handle(&self, addr: &Address, rpc_id: RpcId, provider_id: u16) -> Result<RpcHandle>;

    /// Sends a request. `on_complete` receives the response payload.
    ///
    /// Errors returned directly mean nothing was issued and the callback
    /// will never fire.
    fn forward(
        &self,
        handle: &RpcHandle,
        header: RequestHeader,
        input: Bytes,
        on_complete: Completion<Bytes>,
    ) -> Result<()>;

    /// Sends the response for an inbound handle.
    fn respond(&self, handle: &RpcHandle, response: Result<Bytes>, on_complete: Completion<()>) -> Result<()>;

    /// Registers memory for bulk transfers.
    fn bulk_create(&self, buffer: Vec<u8>, access: BulkAccess) -> Result<BulkHandle>;

    /// Starts a bulk transfer. `on_complete` receives the bytes moved.
    fn bulk_transfer(&self, request: BulkRequest, on_complete: Completion<usize>) -> Result<()>;

    fn set_inbound_hook(&self, hook: InboundHook);

    /// Waits up to `timeout` for network events and fires their callbacks.
    /// Returns the number of callbacks fired.
    async fn progress(&self, timeout: Duration) -> Result<usize>;

    /// Releases the context. Outstanding callbacks are dropped.
    fn finalize(&self);
}

/// Creates transport contexts.
pub trait TransportFactory: Send + Sync {
    fn create(&self, listen: bool, address: &str) -> Result<Arc<dyn Transport>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_access() {
        assert!(BulkAccess::ReadOnly.can_read());
        assert!(!BulkAccess::ReadOnly.can_write());
        assert!(BulkAccess::WriteOnly.can_write());
        assert!(BulkAccess::ReadWrite.can_read() && BulkAccess::ReadWrite.can_write());
    }

    #[test]
    fn test_bulk_handle_bounds() {
        let h = BulkHandle::new(1, vec![0u8; 8], BulkAccess::ReadWrite);
        assert!(h.write_at(4, b"abcd"));
        assert!(!h.write_at(6, b"abcd"));
        assert!(!h.write_at(usize::MAX, b"a"));
        assert_eq!(h.read_at(4, 4).unwrap(), b"abcd");
        assert!(h.read_at(5, 4).is_none());
        assert_eq!(h.len(), 8);
    }

    #[test]
    fn test_bulk_handle_clones_share_memory() {
        let h = BulkHandle::new(1, vec![0u8; 4], BulkAccess::ReadWrite);
        let other = h.clone();
        other.write_at(0, b"zz");
        assert_eq!(&h.to_vec()[..2], b"zz");
    }
}
