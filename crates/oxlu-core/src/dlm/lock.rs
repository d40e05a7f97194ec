use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::{Arc, Weak};

use super::{Export, Extent, GlimpseAst, LockFlags, LockMode, Resource};
use crate::fid::Fid;

#[derive(Debug, Default)]
struct LockState {
    granted: Option<LockMode>,
    flags: LockFlags,
}

/// An extent lock held, or requested, by one export.
///
/// Locks are shared through `Arc`; a scan that keeps a lock beyond the
/// resource critical section holds its own clone. Grant state only changes
/// while the owning resource is locked.
pub struct Lock {
    handle: u64,
    res_id: Fid,
    resource: Weak<Resource>,
    export: Arc<Export>,
    req_mode: LockMode,
    extent: Extent,
    state: Mutex<LockState>,
    glimpse: RwLock<Option<Arc<dyn GlimpseAst>>>,
}

impl Lock {
    pub(crate) fn new(
        handle: u64,
        resource: &Arc<Resource>,
        export: Arc<Export>,
        req_mode: LockMode,
        extent: Extent,
        flags: LockFlags,
        glimpse: Option<Arc<dyn GlimpseAst>>,
    ) -> Self {
        Self {
            handle,
            res_id: *resource.id(),
            resource: Arc::downgrade(resource),
            export,
            req_mode,
            extent,
            state: Mutex::new(LockState {
                granted: None,
                flags,
            }),
            glimpse: RwLock::new(glimpse),
        }
    }

    /// Cookie identifying the lock in its namespace.
    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn res_id(&self) -> &Fid {
        &self.res_id
    }

    /// The resource, unless it has already been freed.
    pub fn resource(&self) -> Option<Arc<Resource>> {
        self.resource.upgrade()
    }

    pub fn export(&self) -> &Arc<Export> {
        &self.export
    }

    pub fn req_mode(&self) -> LockMode {
        self.req_mode
    }

    pub fn granted_mode(&self) -> Option<LockMode> {
        self.state.lock().granted
    }

    pub fn is_granted(&self) -> bool {
        self.granted_mode().is_some()
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn flags(&self) -> LockFlags {
        self.state.lock().flags
    }

    pub fn is_destroyed(&self) -> bool {
        self.flags().contains(LockFlags::DESTROYED)
    }

    pub(crate) fn set_granted(&self, mode: Option<LockMode>) {
        self.state.lock().granted = mode;
    }

    pub(crate) fn mark_destroyed(&self) {
        let mut state = self.state.lock();
        state.granted = None;
        state.flags.insert(LockFlags::DESTROYED);
    }

    /// The callback that makes the holder report its size, if any.
    ///
    /// Locks taken by the server while an object is being destroyed have
    /// none.
    pub fn glimpse_ast(&self) -> Option<Arc<dyn GlimpseAst>> {
        self.glimpse.read().clone()
    }

    pub fn clear_glimpse_ast(&self) {
        *self.glimpse.write() = None;
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Lock")
            .field("handle", &format_args!("{:#x}", self.handle))
            .field("res_id", &self.res_id)
            .field("export", &self.export.id())
            .field("req_mode", &self.req_mode)
            .field("granted", &state.granted)
            .field("extent", &self.extent)
            .field("flags", &state.flags)
            .finish()
    }
}
