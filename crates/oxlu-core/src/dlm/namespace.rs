use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, instrument, trace};

use super::{Export, Extent, Lock, LockFlags, LockMode, Lvb, Resource, process_extent};
use crate::error::LockError;
use crate::fid::Fid;

/// Outcome of an intent policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentDisposition {
    /// The request lock was granted as is.
    Replaced,
    /// No lock is granted. The reply carries the answer, if any.
    Aborted,
}

/// Reply payload an intent policy fills in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockReply {
    /// Policy status, a negative errno or zero.
    pub policy_res1: i32,
    pub lvb: Lvb,
}

/// Decides intent requests instead of the plain extent policy.
///
/// Called without the resource locked; the policy takes the lock itself.
pub trait IntentPolicy: Send + Sync {
    fn intent(
        &self,
        ns: &Namespace,
        lock: &Arc<Lock>,
        reply: &mut LockReply,
        flags: LockFlags,
    ) -> Result<IntentDisposition, LockError>;
}

/// Value block accessor of a namespace.
pub trait LvbOps: Send + Sync {
    /// Fill the value block of a new resource.
    fn init(&self, res: &Resource) -> Result<(), LockError>;

    /// Merge `new` into the value block, or re-read it from storage when
    /// `new` is `None`.
    fn update(&self, res: &Resource, new: Option<&Lvb>, increase_only: bool)
    -> Result<(), LockError>;
}

/// Server callback asking a lock holder for its size.
///
/// Updates the value block of the lock's resource as a side effect. May block
/// on the network; never called with the resource locked.
pub trait GlimpseAst: Send + Sync {
    fn glimpse(&self, ns: &Namespace, lock: &Arc<Lock>) -> Result<(), LockError>;
}

/// Glimpse through the callback channel of the export holding the lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientGlimpse;

impl GlimpseAst for ClientGlimpse {
    fn glimpse(&self, ns: &Namespace, lock: &Arc<Lock>) -> Result<(), LockError> {
        let callbacks = lock
            .export()
            .callbacks()
            .ok_or(LockError::NoCallback {
                handle: lock.handle(),
            })?;
        let lvb = callbacks.glimpse(lock)?;
        let res = lock.resource().ok_or(LockError::NoResource {
            res_id: *lock.res_id(),
        })?;
        let ops = ns.lvb_ops().ok_or_else(|| LockError::NoLvbOps {
            namespace: ns.name().to_string(),
        })?;
        trace!(handle = lock.handle(), size = lvb.size, "Glimpse reply");
        ops.update(&res, Some(&lvb), true)
    }
}

/// A lock request.
pub struct EnqueueRequest {
    pub res_id: Fid,
    pub export: Arc<Export>,
    pub mode: LockMode,
    pub extent: Extent,
    pub flags: LockFlags,
    pub glimpse: Option<Arc<dyn GlimpseAst>>,
}

impl EnqueueRequest {
    /// Whole-object request of `mode`, answering glimpses through the
    /// export's callback channel.
    pub fn new(res_id: Fid, export: Arc<Export>, mode: LockMode) -> Self {
        Self {
            res_id,
            export,
            mode,
            extent: Extent::WHOLE,
            flags: LockFlags::empty(),
            glimpse: Some(Arc::new(ClientGlimpse)),
        }
    }

    #[must_use]
    pub fn extent(mut self, extent: Extent) -> Self {
        self.extent = extent;
        self
    }

    #[must_use]
    pub fn flags(mut self, flags: LockFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Mark the request as a size glimpse for the intent policy.
    #[must_use]
    pub fn glimpse_intent(self) -> Self {
        self.flags(LockFlags::HAS_INTENT)
    }

    /// Drop the glimpse callback, as server-side locks taken during object
    /// destruction do.
    #[must_use]
    pub fn without_glimpse(mut self) -> Self {
        self.glimpse = None;
        self
    }
}

impl fmt::Debug for EnqueueRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnqueueRequest")
            .field("res_id", &self.res_id)
            .field("export", &self.export.id())
            .field("mode", &self.mode)
            .field("extent", &self.extent)
            .field("flags", &self.flags)
            .field("glimpse", &self.glimpse.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueStatus {
    Granted,
    /// Queued behind conflicting locks.
    Waiting,
    /// No lock; see the reply payload.
    Aborted,
}

/// Result of an enqueue.
#[derive(Debug)]
pub struct EnqueueReply {
    pub status: EnqueueStatus,
    /// The lock, unless the request was aborted.
    pub lock: Option<Arc<Lock>>,
    pub policy_res1: i32,
    /// Value block returned by the intent policy.
    pub lvb: Option<Lvb>,
}

/// A lock namespace: resources keyed by fid plus the owner's hooks.
pub struct Namespace {
    name: String,
    resources: DashMap<Fid, Arc<Resource>>,
    locks: DashMap<u64, Arc<Lock>>,
    intent: RwLock<Option<Arc<dyn IntentPolicy>>>,
    lvbo: RwLock<Option<Arc<dyn LvbOps>>>,
    next_handle: AtomicU64,
    stopping: AtomicBool,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        debug!(namespace = %name, "Created lock namespace");
        Arc::new(Self {
            name,
            resources: DashMap::new(),
            locks: DashMap::new(),
            intent: RwLock::new(None),
            lvbo: RwLock::new(None),
            next_handle: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register_intent(&self, policy: Arc<dyn IntentPolicy>) {
        *self.intent.write() = Some(policy);
    }

    pub fn set_lvb_ops(&self, ops: Arc<dyn LvbOps>) {
        *self.lvbo.write() = Some(ops);
    }

    pub fn lvb_ops(&self) -> Option<Arc<dyn LvbOps>> {
        self.lvbo.read().clone()
    }

    /// The resource for `res_id`, created and filled on first use when
    /// `create` is set.
    pub fn resource_get(&self, res_id: &Fid, create: bool) -> Result<Option<Arc<Resource>>, LockError> {
        if let Some(res) = self.resources.get(res_id) {
            return Ok(Some(Arc::clone(res.value())));
        }
        if !create {
            return Ok(None);
        }

        let res = Arc::new(Resource::new(*res_id));
        if let Some(ops) = self.lvb_ops() {
            ops.init(&res)?;
        }
        let res = match self.resources.entry(*res_id) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            // Checked under the shard guard so no resource outlives `free`.
            Entry::Vacant(_) if self.is_stopping() => {
                return Err(LockError::Stopping {
                    namespace: self.name.clone(),
                });
            }
            Entry::Vacant(entry) => {
                trace!(namespace = %self.name, res_id = %res_id, "Created resource");
                Arc::clone(entry.insert(res).value())
            }
        };
        Ok(Some(res))
    }

    /// Request a lock.
    ///
    /// Intent requests are decided by the registered intent policy. Other
    /// requests are granted when nothing conflicts, queued otherwise, or
    /// refused with [`LockError::Conflict`] if they must not wait.
    #[instrument(level = "debug", skip_all, fields(namespace = %self.name, res_id = %req.res_id, mode = %req.mode, extent = %req.extent))]
    pub fn enqueue(&self, req: EnqueueRequest) -> Result<EnqueueReply, LockError> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(LockError::Stopping {
                namespace: self.name.clone(),
            });
        }
        let intent = if req.flags.contains(LockFlags::HAS_INTENT) {
            let policy = self.intent.read().clone();
            Some(policy.ok_or_else(|| LockError::NoIntentPolicy {
                namespace: self.name.clone(),
            })?)
        } else {
            None
        };

        let res = self
            .resource_get(&req.res_id, true)?
            .ok_or(LockError::NoResource { res_id: req.res_id })?;
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let lock = Arc::new(Lock::new(
            handle,
            &res,
            req.export,
            req.mode,
            req.extent,
            req.flags,
            req.glimpse,
        ));
        self.locks.insert(handle, Arc::clone(&lock));
        if self.is_stopping() {
            self.destroy(&res, &lock);
            return Err(LockError::Stopping {
                namespace: self.name.clone(),
            });
        }

        if let Some(policy) = intent {
            let mut reply = LockReply::default();
            let disposition = match policy.intent(self, &lock, &mut reply, req.flags) {
                Ok(disposition) => disposition,
                Err(e) => {
                    self.destroy(&res, &lock);
                    return Err(e);
                }
            };
            let (status, lock) = match disposition {
                IntentDisposition::Replaced => {
                    // A granted lock carries the resource's current value block.
                    reply.lvb = res.lvb();
                    (EnqueueStatus::Granted, Some(lock))
                }
                IntentDisposition::Aborted => {
                    self.destroy(&res, &lock);
                    (EnqueueStatus::Aborted, None)
                }
            };
            debug!(?status, policy_res1 = reply.policy_res1, size = reply.lvb.size, "Intent request done");
            return Ok(EnqueueReply {
                status,
                lock,
                policy_res1: reply.policy_res1,
                lvb: Some(reply.lvb),
            });
        }

        let mut inner = res.lock();
        if process_extent(&mut inner, &lock) {
            drop(inner);
            trace!(handle, "Granted lock");
            return Ok(EnqueueReply {
                status: EnqueueStatus::Granted,
                lock: Some(lock),
                policy_res1: 0,
                lvb: None,
            });
        }
        if req.flags.contains(LockFlags::BLOCK_NOWAIT) {
            let conflicts = inner.conflicts(&lock);
            drop(inner);
            self.destroy(&res, &lock);
            return Err(LockError::Conflict {
                res_id: req.res_id,
                mode: req.mode,
                conflicts,
            });
        }
        inner.add_waiting(Arc::clone(&lock));
        drop(inner);
        trace!(handle, "Lock waiting for conflicts to clear");
        Ok(EnqueueReply {
            status: EnqueueStatus::Waiting,
            lock: Some(lock),
            policy_res1: 0,
            lvb: None,
        })
    }

    /// Cancel a lock and grant whatever was waiting on it.
    ///
    /// Returns the locks granted as a result.
    #[instrument(level = "debug", skip(self), fields(namespace = %self.name))]
    pub fn cancel(&self, handle: u64) -> Result<Vec<Arc<Lock>>, LockError> {
        let (_, lock) = self
            .locks
            .remove(&handle)
            .ok_or(LockError::UnknownHandle { handle })?;
        let Some(res) = lock.resource() else {
            lock.mark_destroyed();
            return Ok(Vec::new());
        };

        let mut inner = res.lock();
        inner.unlink_lock(&lock);
        lock.mark_destroyed();
        Ok(inner.reprocess_waiting())
    }

    fn destroy(&self, res: &Resource, lock: &Arc<Lock>) {
        res.lock().unlink_lock(lock);
        lock.mark_destroyed();
        self.locks.remove(&lock.handle());
    }

    /// Drop every lock of every resource. Returns how many were dropped.
    #[instrument(level = "debug", skip(self), fields(namespace = %self.name))]
    pub fn purge(&self) -> usize {
        let mut purged = 0;
        for entry in &self.resources {
            let locks = entry.value().lock().drain();
            for lock in &locks {
                lock.mark_destroyed();
            }
            purged += locks.len();
        }
        self.locks.clear();
        debug!(purged, "Purged namespace");
        purged
    }

    /// Tear the namespace down: refuse new requests, drop every lock and
    /// resource and detach the hooks.
    pub fn free(&self) {
        self.stopping.store(true, Ordering::Release);
        let purged = self.purge();
        self.resources.clear();
        *self.intent.write() = None;
        *self.lvbo.write() = None;
        info!(namespace = %self.name, purged, "Freed lock namespace");
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.name)
            .field("resources", &self.resources.len())
            .field("locks", &self.locks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlm::ClientCallbacks;
    use parking_lot::Mutex;
    use std::sync::Weak;

    const RES: Fid = Fid::new(0x100000400, 5, 0);

    fn export(id: u64) -> Arc<Export> {
        Arc::new(Export::new(id, format!("client-{id}")))
    }

    /// Value block ops that keep a fixed storage size.
    struct FixedLvbo {
        stored: Mutex<Lvb>,
    }

    impl LvbOps for FixedLvbo {
        fn init(&self, res: &Resource) -> Result<(), LockError> {
            *res.lock().lvb_mut() = *self.stored.lock();
            Ok(())
        }

        fn update(
            &self,
            res: &Resource,
            new: Option<&Lvb>,
            increase_only: bool,
        ) -> Result<(), LockError> {
            let new = new.copied().unwrap_or(*self.stored.lock());
            res.lock().lvb_mut().merge(&new, increase_only);
            Ok(())
        }
    }

    struct FixedClient(u64);

    impl ClientCallbacks for FixedClient {
        fn glimpse(&self, _lock: &Lock) -> Result<Lvb, LockError> {
            Ok(Lvb {
                size: self.0,
                ..Lvb::default()
            })
        }
    }

    struct AlwaysAbort;

    impl IntentPolicy for AlwaysAbort {
        fn intent(
            &self,
            _ns: &Namespace,
            _lock: &Arc<Lock>,
            reply: &mut LockReply,
            _flags: LockFlags,
        ) -> Result<IntentDisposition, LockError> {
            reply.policy_res1 = -libc::EAGAIN;
            Ok(IntentDisposition::Aborted)
        }
    }

    #[test]
    fn test_resource_created_with_lvb() {
        let ns = Namespace::new("test");
        ns.set_lvb_ops(Arc::new(FixedLvbo {
            stored: Mutex::new(Lvb {
                size: 4096,
                ..Lvb::default()
            }),
        }));

        assert!(ns.resource_get(&RES, false).unwrap().is_none());
        let res = ns.resource_get(&RES, true).unwrap().unwrap();
        assert_eq!(res.lvb().size, 4096);
        let again = ns.resource_get(&RES, false).unwrap().unwrap();
        assert!(Arc::ptr_eq(&res, &again));
    }

    #[test]
    fn test_conflicting_request_waits_until_cancel() {
        let ns = Namespace::new("test");

        let writer = ns
            .enqueue(EnqueueRequest::new(RES, export(1), LockMode::Pw))
            .unwrap();
        assert_eq!(writer.status, EnqueueStatus::Granted);

        let reader = ns
            .enqueue(EnqueueRequest::new(RES, export(2), LockMode::Pr))
            .unwrap();
        assert_eq!(reader.status, EnqueueStatus::Waiting);

        let handle = writer.lock.unwrap().handle();
        let granted = ns.cancel(handle).unwrap();
        assert_eq!(granted.len(), 1);
        assert!(reader.lock.unwrap().is_granted());
        assert_eq!(
            ns.cancel(handle).unwrap_err(),
            LockError::UnknownHandle { handle }
        );
    }

    #[test]
    fn test_nowait_conflict_is_refused() {
        let ns = Namespace::new("test");
        ns.enqueue(EnqueueRequest::new(RES, export(1), LockMode::Ex))
            .unwrap();

        let err = ns
            .enqueue(
                EnqueueRequest::new(RES, export(2), LockMode::Pr).flags(LockFlags::BLOCK_NOWAIT),
            )
            .unwrap_err();
        assert!(matches!(err, LockError::Conflict { conflicts: 1, .. }));
        assert_eq!(err.errno(), -libc::EAGAIN);
        assert_eq!(ns.lock_count(), 1);
    }

    #[test]
    fn test_intent_without_policy() {
        let ns = Namespace::new("test");
        let err = ns
            .enqueue(EnqueueRequest::new(RES, export(1), LockMode::Pr).glimpse_intent())
            .unwrap_err();
        assert!(matches!(err, LockError::NoIntentPolicy { .. }));
        assert_eq!(ns.lock_count(), 0);
    }

    #[test]
    fn test_aborted_intent_destroys_lock() {
        let ns = Namespace::new("test");
        ns.register_intent(Arc::new(AlwaysAbort));

        let reply = ns
            .enqueue(EnqueueRequest::new(RES, export(1), LockMode::Pr).glimpse_intent())
            .unwrap();
        assert_eq!(reply.status, EnqueueStatus::Aborted);
        assert!(reply.lock.is_none());
        assert_eq!(reply.policy_res1, -libc::EAGAIN);
        assert_eq!(ns.lock_count(), 0);
        let res = ns.resource_get(&RES, false).unwrap().unwrap();
        assert_eq!(res.lock().granted_count(), 0);
    }

    #[test]
    fn test_client_glimpse_updates_lvb() {
        let ns = Namespace::new("test");
        ns.set_lvb_ops(Arc::new(FixedLvbo {
            stored: Mutex::new(Lvb {
                size: 100,
                ..Lvb::default()
            }),
        }));

        let holder = Arc::new(Export::new(1, "client-1").with_callbacks(Arc::new(FixedClient(300))));
        let reply = ns
            .enqueue(EnqueueRequest::new(RES, holder, LockMode::Pw))
            .unwrap();
        let lock = reply.lock.unwrap();

        ClientGlimpse.glimpse(&ns, &lock).unwrap();
        assert_eq!(lock.resource().unwrap().lvb().size, 300);
    }

    #[test]
    fn test_client_glimpse_without_channel() {
        let ns = Namespace::new("test");
        let reply = ns
            .enqueue(EnqueueRequest::new(RES, export(1), LockMode::Pw))
            .unwrap();
        let lock = reply.lock.unwrap();
        assert_eq!(
            ClientGlimpse.glimpse(&ns, &lock).unwrap_err(),
            LockError::NoCallback {
                handle: lock.handle()
            }
        );
    }

    #[test]
    fn test_free_refuses_new_requests() {
        let ns = Namespace::new("test");
        let lock = ns
            .enqueue(EnqueueRequest::new(RES, export(1), LockMode::Pw))
            .unwrap()
            .lock
            .unwrap();
        ns.free();

        assert!(lock.is_destroyed());
        assert_eq!(ns.resource_count(), 0);
        assert!(lock.resource().is_none());
        assert!(matches!(
            ns.enqueue(EnqueueRequest::new(RES, export(1), LockMode::Pr)),
            Err(LockError::Stopping { .. })
        ));
    }

    /// Frees its namespace while a resource is being set up.
    struct FreeDuringInit {
        ns: Weak<Namespace>,
    }

    impl LvbOps for FreeDuringInit {
        fn init(&self, _res: &Resource) -> Result<(), LockError> {
            if let Some(ns) = self.ns.upgrade() {
                ns.free();
            }
            Ok(())
        }

        fn update(&self, _res: &Resource, _new: Option<&Lvb>, _inc: bool) -> Result<(), LockError> {
            Ok(())
        }
    }

    #[test]
    fn test_free_racing_resource_creation() {
        let ns = Namespace::new("test");
        ns.set_lvb_ops(Arc::new(FreeDuringInit {
            ns: Arc::downgrade(&ns),
        }));

        let err = ns
            .enqueue(EnqueueRequest::new(RES, export(1), LockMode::Pw))
            .unwrap_err();
        assert!(matches!(err, LockError::Stopping { .. }));
        assert_eq!(err.errno(), -libc::ESHUTDOWN);
        assert_eq!(ns.resource_count(), 0);
        assert_eq!(ns.lock_count(), 0);
    }

    struct AlwaysGrant;

    impl IntentPolicy for AlwaysGrant {
        fn intent(
            &self,
            _ns: &Namespace,
            lock: &Arc<Lock>,
            _reply: &mut LockReply,
            _flags: LockFlags,
        ) -> Result<IntentDisposition, LockError> {
            let res = lock.resource().ok_or(LockError::NoResource {
                res_id: *lock.res_id(),
            })?;
            assert!(process_extent(&mut res.lock(), lock));
            Ok(IntentDisposition::Replaced)
        }
    }

    #[test]
    fn test_granted_intent_carries_resource_lvb() {
        let ns = Namespace::new("test");
        ns.set_lvb_ops(Arc::new(FixedLvbo {
            stored: Mutex::new(Lvb {
                size: 4096,
                ..Lvb::default()
            }),
        }));
        ns.register_intent(Arc::new(AlwaysGrant));

        let reply = ns
            .enqueue(EnqueueRequest::new(RES, export(1), LockMode::Pr).glimpse_intent())
            .unwrap();
        assert_eq!(reply.status, EnqueueStatus::Granted);
        assert_eq!(reply.lvb.unwrap().size, 4096);
        assert_eq!(reply.lock.unwrap().granted_mode(), Some(LockMode::Pr));
    }
}
