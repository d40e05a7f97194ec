//! Per-stack object cache.
//!
//! The site maps each fid to at most one live [`LuObject`]. References are
//! handed out as [`ObjectRef`] guards; the header reference count is only
//! raised while the cache shard holding the object is locked, and an object is
//! only evicted while its count is zero, so a guard can never observe a freed
//! object.
//!
//! Unreferenced objects stay cached until [`Site::purge`] evicts them, except
//! dying objects, which are evicted on their last release.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

use super::{LuDevice, LuObject, ObjectConf};
use crate::env::Env;
use crate::error::ObjectError;
use crate::fid::Fid;

#[derive(Debug, Default)]
struct SiteStats {
    created: AtomicU64,
    cache_hits: AtomicU64,
    cache_races: AtomicU64,
    evicted: AtomicU64,
}

/// Point-in-time snapshot of site counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteStatsSnapshot {
    pub created: u64,
    pub cache_hits: u64,
    pub cache_races: u64,
    pub evicted: u64,
    pub cached: usize,
}

/// Object cache shared by every device of one stack.
pub struct Site {
    objects: DashMap<Fid, Arc<LuObject>>,
    top: RwLock<Option<Weak<dyn LuDevice>>>,
    stats: SiteStats,
}

impl Default for Site {
    fn default() -> Self {
        Self {
            objects: DashMap::new(),
            top: RwLock::new(None),
            stats: SiteStats::default(),
        }
    }
}

impl Site {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `dev` the device new objects are allocated through.
    ///
    /// A stack has one top device. Fails with [`ObjectError::TopBusy`] while
    /// another live device holds the place.
    pub fn set_top(&self, dev: &Arc<dyn LuDevice>) -> Result<(), ObjectError> {
        let mut top = self.top.write();
        if let Some(current) = top.as_ref().and_then(Weak::upgrade)
            && !Arc::ptr_eq(&current, dev)
        {
            debug!(top = current.name(), device = dev.name(), "Site already has a top device");
            return Err(ObjectError::TopBusy {
                top: current.name().to_string(),
            });
        }
        *top = Some(Arc::downgrade(dev));
        Ok(())
    }

    pub fn clear_top(&self) {
        *self.top.write() = None;
    }

    pub fn top(&self) -> Option<Arc<dyn LuDevice>> {
        self.top.read().as_ref().and_then(Weak::upgrade)
    }

    /// Find the object for `fid`, allocating and initializing it on a miss.
    pub fn find(
        self: &Arc<Self>,
        env: &mut Env,
        fid: Fid,
        conf: ObjectConf,
    ) -> Result<ObjectRef, ObjectError> {
        if let Some(found) = self.lookup(&fid)? {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(found);
        }

        let top = self.top().ok_or(ObjectError::NoTopDevice)?;
        let mut obj = LuObject::alloc(env, top.as_ref(), fid)?;
        if let Err(e) = obj.init(env, conf) {
            debug!(fid = %fid, error = %e, "Object initialization failed");
            return Err(e);
        }

        let outcome = match self.objects.entry(fid) {
            Entry::Occupied(entry) => {
                let existing = entry.get();
                if existing.header().is_dying() {
                    Err(ObjectError::Stale { fid })
                } else {
                    existing.header().get();
                    Ok((Arc::clone(existing), true))
                }
            }
            Entry::Vacant(entry) => {
                obj.header().get();
                let shared = Arc::new(obj);
                entry.insert(Arc::clone(&shared));
                Ok((shared, false))
            }
        };

        let (shared, raced) = outcome?;
        if raced {
            // Another request cached the fid first; ours is freed on return.
            self.stats.cache_races.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.created.fetch_add(1, Ordering::Relaxed);
            trace!(fid = %fid, layers = shared.layer_count(), "Cached new object");
        }
        Ok(ObjectRef {
            obj: shared,
            site: Arc::clone(self),
        })
    }

    /// Take a reference on a cached object without allocating.
    pub fn lookup(self: &Arc<Self>, fid: &Fid) -> Result<Option<ObjectRef>, ObjectError> {
        let Some(entry) = self.objects.get(fid) else {
            return Ok(None);
        };
        if entry.header().is_dying() {
            return Err(ObjectError::Stale { fid: *fid });
        }
        entry.header().get();
        Ok(Some(ObjectRef {
            obj: Arc::clone(entry.value()),
            site: Arc::clone(self),
        }))
    }

    fn release(&self, obj: &Arc<LuObject>) {
        let fid = *obj.fid();
        if obj.header().put() > 0 || !obj.header().is_dying() {
            return;
        }
        if self
            .objects
            .remove_if(&fid, |_, cached| cached.header().refs() == 0)
            .is_some()
        {
            self.stats.evicted.fetch_add(1, Ordering::Relaxed);
            trace!(fid = %fid, "Evicted dying object on last release");
        }
    }

    /// Evict up to `nr` unreferenced objects. Returns how many were evicted.
    pub fn purge(&self, nr: usize) -> usize {
        let idle: Vec<Fid> = self
            .objects
            .iter()
            .filter(|entry| entry.header().refs() == 0)
            .map(|entry| *entry.key())
            .take(nr)
            .collect();

        let mut evicted = 0;
        for fid in idle {
            if self
                .objects
                .remove_if(&fid, |_, cached| cached.header().refs() == 0)
                .is_some()
            {
                evicted += 1;
            }
        }
        self.stats.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        debug!(evicted, remaining = self.objects.len(), "Purged site");
        evicted
    }

    /// Number of cached objects, referenced or not.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn stats(&self) -> SiteStatsSnapshot {
        SiteStatsSnapshot {
            created: self.stats.created.load(Ordering::Relaxed),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            cache_races: self.stats.cache_races.load(Ordering::Relaxed),
            evicted: self.stats.evicted.load(Ordering::Relaxed),
            cached: self.objects.len(),
        }
    }
}

impl std::fmt::Debug for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Site")
            .field("cached", &self.objects.len())
            .field("has_top", &self.top().is_some())
            .finish()
    }
}

/// A counted reference to a cached object.
///
/// Dropping the guard releases the reference.
pub struct ObjectRef {
    obj: Arc<LuObject>,
    site: Arc<Site>,
}

impl ObjectRef {
    /// Mark the object as being destroyed. It is evicted once the last
    /// reference is released and later lookups see it as stale.
    pub fn set_dying(&self) {
        self.obj.header().set_dying();
    }
}

impl Deref for ObjectRef {
    type Target = LuObject;

    fn deref(&self) -> &LuObject {
        &self.obj
    }
}

impl Clone for ObjectRef {
    fn clone(&self) -> Self {
        self.obj.header().get();
        Self {
            obj: Arc::clone(&self.obj),
            site: Arc::clone(&self.site),
        }
    }
}

impl Drop for ObjectRef {
    fn drop(&mut self) {
        self.site.release(&self.obj);
    }
}

impl std::fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ObjectRef").field(&self.obj).finish()
    }
}
