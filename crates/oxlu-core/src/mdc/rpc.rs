//! Metadata RPC operation set consumed by the proxy.

use std::fmt;

use super::OpData;
use crate::attr::{AttrValid, MdtBody};
use crate::fid::Fid;

type ReleaseHook = Box<dyn FnOnce(u64) + Send>;

/// A completed metadata request.
///
/// The request owns its reply buffers. They are released when the request is
/// finished or dropped, whichever comes first.
pub struct RpcRequest {
    xid: u64,
    status: i32,
    reply: Option<MdtBody>,
    release: Option<ReleaseHook>,
}

impl RpcRequest {
    pub fn new(xid: u64, status: i32, reply: Option<MdtBody>) -> Self {
        Self {
            xid,
            status,
            reply,
            release: None,
        }
    }

    /// A successful request with `body` in its reply.
    pub fn ok(xid: u64, body: MdtBody) -> Self {
        Self::new(xid, 0, Some(body))
    }

    /// A request the server answered with `status`.
    pub fn failed(xid: u64, status: i32) -> Self {
        Self::new(xid, status, None)
    }

    /// Run `hook` with the xid when the request is released.
    #[must_use]
    pub fn on_release(mut self, hook: impl FnOnce(u64) + Send + 'static) -> Self {
        self.release = Some(Box::new(hook));
        self
    }

    pub fn xid(&self) -> u64 {
        self.xid
    }

    /// Zero on success, a negative errno otherwise.
    pub fn status(&self) -> i32 {
        self.status
    }

    /// The attribute body of the reply, if the server sent one.
    pub fn reply_body(&self) -> Option<&MdtBody> {
        self.reply.as_ref()
    }

    /// Release the request and its reply buffers.
    pub fn finished(self) {}
}

impl Drop for RpcRequest {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(self.xid);
        }
    }
}

impl fmt::Debug for RpcRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcRequest")
            .field("xid", &self.xid)
            .field("status", &self.status)
            .field("reply", &self.reply)
            .finish_non_exhaustive()
    }
}

/// Owner and type of an object being created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateAttr {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Capabilities of the creator.
    pub cap: u32,
    pub rdev: u32,
}

/// Client side of the metadata protocol.
///
/// Each call sends one request and waits for the reply. Transport failures and
/// server errors are reported through [`RpcRequest::status`].
pub trait MdRpc: Send + Sync {
    fn getattr(&self, fid: &Fid, valid: AttrValid) -> RpcRequest;

    /// Create `op.fid2` under `op.fid1`. `payload` is the symlink target or the
    /// striping data of a directory shard.
    fn create(&self, op: &OpData, payload: &[u8], attr: &CreateAttr) -> RpcRequest;

    /// Add a link to `op.fid1`.
    fn link(&self, op: &OpData) -> RpcRequest;

    /// Drop a link from `op.fid1`.
    fn unlink(&self, op: &OpData) -> RpcRequest;

    /// Rename `old` under `op.fid1` to `new`. Without `old`, only the target
    /// entry `new` is pointed at `op.fid2`.
    fn rename(&self, op: &OpData, old: Option<&str>, new: &str) -> RpcRequest;
}
