use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

use super::{IntervalTree, Lock, LockMode, Lvb};
use crate::fid::Fid;

/// A lockable object: granted and waiting locks plus the cached value block.
pub struct Resource {
    id: Fid,
    inner: Mutex<ResourceInner>,
}

/// Lock state of a resource, only reachable with the resource locked.
#[derive(Debug, Default)]
pub struct ResourceInner {
    granted: [IntervalTree; LockMode::COUNT],
    waiting: Vec<Arc<Lock>>,
    lvb: Lvb,
}

impl Resource {
    pub fn new(id: Fid) -> Self {
        Self {
            id,
            inner: Mutex::new(ResourceInner::default()),
        }
    }

    pub fn id(&self) -> &Fid {
        &self.id
    }

    /// Lock the resource. No lock can be granted or cancelled on it, and its
    /// value block cannot change, until the guard is dropped.
    pub fn lock(&self) -> MutexGuard<'_, ResourceInner> {
        self.inner.lock()
    }

    /// Copy of the value block.
    pub fn lvb(&self) -> Lvb {
        self.inner.lock().lvb
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl ResourceInner {
    /// Granted locks of `mode`.
    pub fn tree(&self, mode: LockMode) -> &IntervalTree {
        &self.granted[mode.index()]
    }

    pub fn lvb(&self) -> &Lvb {
        &self.lvb
    }

    pub fn lvb_mut(&mut self) -> &mut Lvb {
        &mut self.lvb
    }

    /// Number of granted locks that conflict with `lock`: incompatible mode,
    /// overlapping extent, held by another lock.
    pub fn conflicts(&self, lock: &Arc<Lock>) -> usize {
        let extent = lock.extent();
        LockMode::ALL
            .iter()
            .filter(|mode| !mode.compatible(lock.req_mode()))
            .map(|mode| {
                self.granted[mode.index()]
                    .overlapping(&extent)
                    .filter(|held| !Arc::ptr_eq(held, lock))
                    .count()
            })
            .sum()
    }

    pub(crate) fn grant(&mut self, lock: &Arc<Lock>) {
        self.waiting.retain(|waiting| !Arc::ptr_eq(waiting, lock));
        lock.set_granted(Some(lock.req_mode()));
        self.granted[lock.req_mode().index()].insert(Arc::clone(lock));
    }

    pub(crate) fn add_waiting(&mut self, lock: Arc<Lock>) {
        self.waiting.push(lock);
    }

    /// Take `lock` off the granted trees or the waiting list.
    pub fn unlink_lock(&mut self, lock: &Arc<Lock>) -> bool {
        let unlinked = match lock.granted_mode() {
            Some(mode) => self.granted[mode.index()].remove(lock),
            None => {
                let before = self.waiting.len();
                self.waiting.retain(|waiting| !Arc::ptr_eq(waiting, lock));
                before != self.waiting.len()
            }
        };
        lock.set_granted(None);
        unlinked
    }

    /// Grant every waiting lock that no longer conflicts, in arrival order.
    pub(crate) fn reprocess_waiting(&mut self) -> Vec<Arc<Lock>> {
        let mut granted = Vec::new();
        let mut idx = 0;
        while idx < self.waiting.len() {
            let lock = Arc::clone(&self.waiting[idx]);
            if self.conflicts(&lock) == 0 {
                self.grant(&lock);
                trace!(handle = lock.handle(), "Granted waiting lock");
                granted.push(lock);
            } else {
                idx += 1;
            }
        }
        granted
    }

    /// Remove every lock, granted or waiting.
    pub(crate) fn drain(&mut self) -> Vec<Arc<Lock>> {
        let mut locks: Vec<Arc<Lock>> = self.waiting.drain(..).collect();
        for tree in &mut self.granted {
            locks.extend(tree.drain());
        }
        for lock in &locks {
            lock.set_granted(None);
        }
        locks
    }

    pub fn granted_count(&self) -> usize {
        self.granted.iter().map(IntervalTree::len).sum()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }
}

/// Plain extent policy: grant `lock` if no granted lock conflicts with it.
///
/// Returns whether the lock was granted.
pub fn process_extent(inner: &mut ResourceInner, lock: &Arc<Lock>) -> bool {
    if inner.conflicts(lock) == 0 {
        inner.grant(lock);
        true
    } else {
        false
    }
}
