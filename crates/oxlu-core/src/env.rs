//! Per-request context.
//!
//! An [`Env`] lives for exactly one request and is passed by reference through
//! every layer the request touches. Each layer keeps its scratch state in its
//! own slot and resets it at the start of an operation.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::mdc::OpData;

static NEXT_XID: AtomicU64 = AtomicU64::new(1);

/// Scratch state of the metadata proxy layer.
#[derive(Debug, Default)]
pub struct MdcInfo {
    /// Operation descriptor built for the RPC in flight.
    pub opdata: OpData,
}

/// Scratch state of the object filter layer.
#[derive(Debug, Default)]
pub struct FilterInfo {
    /// Name buffer used while building device and namespace names.
    pub name: String,
}

/// Request context.
#[derive(Debug)]
pub struct Env {
    xid: u64,
    mdc: MdcInfo,
    filter: FilterInfo,
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

impl Env {
    /// Create a context for a new request.
    pub fn new() -> Self {
        Self {
            xid: NEXT_XID.fetch_add(1, Ordering::Relaxed),
            mdc: MdcInfo::default(),
            filter: FilterInfo::default(),
        }
    }

    /// Transaction id of the request this context belongs to.
    pub fn xid(&self) -> u64 {
        self.xid
    }

    /// Proxy scratch state, as left by the previous operation.
    pub fn mdc_info(&mut self) -> &mut MdcInfo {
        &mut self.mdc
    }

    /// Proxy scratch state, cleared for a new operation.
    pub fn mdc_info_init(&mut self) -> &mut MdcInfo {
        self.mdc = MdcInfo::default();
        &mut self.mdc
    }

    /// Filter scratch state, cleared for a new operation.
    pub fn filter_info_init(&mut self) -> &mut FilterInfo {
        self.filter.name.clear();
        &mut self.filter
    }
}
