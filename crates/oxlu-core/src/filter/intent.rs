//! Size glimpse resolution.
//!
//! A glimpse request asks for the current size of an object. The size cached
//! on the lock resource may be behind when clients hold write locks beyond it
//! and have dirty data under them. The resolver never grants a glimpse lock
//! that would conflict: it picks the one write lock most likely to know the
//! real size, asks its holder through the glimpse callback and returns the
//! refreshed value block with an aborted status. The client then reissues a
//! normal request if it needs a lock at all.

use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

use crate::dlm::{
    IntentDisposition, IntentPolicy, Lock, LockFlags, LockMode, LockReply, Namespace,
    ResourceInner, process_extent,
};
use crate::error::LockError;
use crate::stats::FilterStats;

/// Outcome of the candidate search over a locked resource.
#[derive(Debug, Default)]
pub struct GlimpseCandidate {
    /// The lock to glimpse, if any callback-capable holder qualified.
    pub lock: Option<Arc<Lock>>,
    /// No callback-capable holder was found among the qualifying locks.
    pub only_incapable: bool,
    /// Interval trees walked.
    pub trees_scanned: u32,
}

/// Find the granted lock whose holder should be asked for the size.
///
/// Walks the tree of every mode but `PR` from the highest extent down and
/// stops each walk at the first extent ending at or below `size`. Within a
/// group of same-extent locks only the first holder able to take callbacks is
/// considered. The lock with the greatest extent start wins; on equal starts
/// the first one found is kept.
pub fn select_glimpse_candidate(inner: &ResourceInner, size: u64) -> GlimpseCandidate {
    let mut found = GlimpseCandidate {
        lock: None,
        only_incapable: true,
        trees_scanned: 0,
    };

    for mode in LockMode::ALL {
        if mode == LockMode::Pr {
            continue;
        }
        let tree = inner.tree(mode);
        if tree.is_empty() {
            continue;
        }
        found.trees_scanned += 1;

        for (extent, group) in tree.iter_rev() {
            if extent.end <= size {
                trace!(%mode, %extent, size, "Extent within cached size, tree done");
                break;
            }
            let Some(lock) = group
                .iter()
                .find(|lock| lock.export().callback_capable())
            else {
                continue;
            };
            found.only_incapable = false;
            let replace = found
                .lock
                .as_ref()
                .is_none_or(|victim| victim.extent().start < lock.extent().start);
            if replace {
                found.lock = Some(Arc::clone(lock));
            }
        }
    }
    found
}

/// Intent policy of the filter namespace.
pub struct FilterIntentPolicy {
    stats: Arc<FilterStats>,
}

impl FilterIntentPolicy {
    pub fn new(stats: Arc<FilterStats>) -> Self {
        Self { stats }
    }

    fn aborted(&self) -> Result<IntentDisposition, LockError> {
        self.stats.record_intent_aborted();
        Ok(IntentDisposition::Aborted)
    }
}

impl IntentPolicy for FilterIntentPolicy {
    #[instrument(level = "debug", skip_all, fields(res_id = %lock.res_id(), handle = lock.handle()))]
    fn intent(
        &self,
        ns: &Namespace,
        lock: &Arc<Lock>,
        reply: &mut LockReply,
        flags: LockFlags,
    ) -> Result<IntentDisposition, LockError> {
        let res = lock.resource().ok_or(LockError::NoResource {
            res_id: *lock.res_id(),
        })?;

        let mut inner = res.lock();
        if process_extent(&mut inner, lock) {
            if lock.export().callback_capable() {
                drop(inner);
                debug!("No conflicting locks, granting");
                self.stats.record_intent_replaced();
                return Ok(IntentDisposition::Replaced);
            }
            // The client cannot be called back to give the lock up.
            inner.unlink_lock(lock);
            drop(inner);
            debug!("No conflicting locks, but client takes no callbacks");
            return self.aborted();
        }
        if flags.contains(LockFlags::BLOCK_NOWAIT) {
            drop(inner);
            debug!("Conflicting locks and request must not block");
            return self.aborted();
        }

        reply.lvb = *inner.lvb();
        let size = reply.lvb.size;
        let candidate = select_glimpse_candidate(&inner, size);
        drop(inner);
        for _ in 0..candidate.trees_scanned {
            self.stats.record_tree_scan();
        }

        let Some(victim) = candidate.lock else {
            if candidate.only_incapable {
                // Holders that never glimpse or cancel leave the cached size
                // stale; read it back from storage.
                debug!(size, "No candidate with callbacks, refreshing from storage");
                self.stats.record_forced_refresh();
                match ns.lvb_ops() {
                    Some(ops) => {
                        if let Err(e) = ops.update(&res, None, true) {
                            warn!(error = %e, "Value block refresh failed");
                        }
                    }
                    None => warn!(namespace = ns.name(), "No value block operations to refresh with"),
                }
            }
            return self.aborted();
        };

        let Some(glimpse) = victim.glimpse_ast() else {
            // Server-side locks without a glimpse hook are only taken while
            // the object is being destroyed.
            debug!(victim = victim.handle(), "Candidate object is being destroyed");
            self.stats.record_stale_candidate();
            reply.policy_res1 = -libc::ENOENT;
            return self.aborted();
        };

        debug!(victim = victim.handle(), extent = %victim.extent(), size, "Glimpsing lock holder");
        let result = glimpse.glimpse(ns, &victim);
        self.stats.record_glimpse_callback(result.is_ok());
        if let Err(e) = result {
            warn!(victim = victim.handle(), error = %e, "Glimpse callback failed");
        }

        reply.lvb = *res.lock().lvb();
        trace!(size = reply.lvb.size, "Reply value block refreshed");
        self.aborted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlm::{Export, Extent, Lvb, Resource};
    use crate::fid::Fid;

    fn granted(
        res: &Arc<Resource>,
        handle: u64,
        mode: LockMode,
        extent: Extent,
        capable: bool,
    ) -> Arc<Lock> {
        let mut export = Export::new(handle, format!("client-{handle}"));
        if !capable {
            export = export.without_callbacks();
        }
        let lock = Arc::new(Lock::new(
            handle,
            res,
            Arc::new(export),
            mode,
            extent,
            LockFlags::empty(),
            None,
        ));
        res.lock().grant(&lock);
        lock
    }

    fn resource(size: u64) -> Arc<Resource> {
        let res = Arc::new(Resource::new(Fid::new(0x100000400, 1, 0)));
        res.lock().lvb_mut().size = size;
        res
    }

    #[test]
    fn test_scan_stops_at_cached_size() {
        let res = resource(100);
        granted(&res, 1, LockMode::Pw, Extent::new(50, 90), true);
        granted(&res, 2, LockMode::Pw, Extent::new(70, 200), true);
        granted(&res, 3, LockMode::Pw, Extent::new(10, 40), false);

        let found = select_glimpse_candidate(&res.lock(), 100);
        assert_eq!(found.lock.map(|lock| lock.handle()), Some(2));
        assert!(!found.only_incapable);
        assert_eq!(found.trees_scanned, 1);
    }

    #[test]
    fn test_greatest_start_wins_across_modes() {
        let res = resource(0);
        granted(&res, 1, LockMode::Pw, Extent::new(100, 199), true);
        granted(&res, 2, LockMode::Cw, Extent::new(400, 499), true);
        granted(&res, 3, LockMode::Group, Extent::new(300, 399), true);
        // Read locks are never glimpsed.
        granted(&res, 4, LockMode::Pr, Extent::new(900, 999), true);

        let found = select_glimpse_candidate(&res.lock(), 0);
        assert_eq!(found.lock.map(|lock| lock.handle()), Some(2));
        assert_eq!(found.trees_scanned, 3);
    }

    #[test]
    fn test_equal_start_keeps_first_found() {
        let res = resource(0);
        granted(&res, 1, LockMode::Cw, Extent::new(70, 200), true);
        granted(&res, 2, LockMode::Cw, Extent::new(70, 300), true);
        granted(&res, 3, LockMode::Cw, Extent::new(70, 300), true);

        // [70, 300] sorts above [70, 200]; its group yields lock 2 first.
        let found = select_glimpse_candidate(&res.lock(), 0);
        assert_eq!(found.lock.map(|lock| lock.handle()), Some(2));
    }

    #[test]
    fn test_incapable_holders_only() {
        let res = resource(10);
        granted(&res, 1, LockMode::Pw, Extent::new(0, 99), false);
        granted(&res, 2, LockMode::Pw, Extent::new(100, 199), false);

        let found = select_glimpse_candidate(&res.lock(), 10);
        assert!(found.lock.is_none());
        assert!(found.only_incapable);
    }

    #[test]
    fn test_incapable_first_in_group_is_skipped() {
        let res = resource(0);
        granted(&res, 1, LockMode::Cw, Extent::new(10, 20), false);
        granted(&res, 2, LockMode::Cw, Extent::new(10, 20), true);

        let found = select_glimpse_candidate(&res.lock(), 0);
        assert_eq!(found.lock.map(|lock| lock.handle()), Some(2));
    }

    #[test]
    fn test_nothing_beyond_size() {
        let res = resource(1000);
        granted(&res, 1, LockMode::Pw, Extent::new(0, 999), true);

        let found = select_glimpse_candidate(&res.lock(), 1000);
        assert!(found.lock.is_none());
        assert!(found.only_incapable);
        assert_eq!(res.lvb(), Lvb { size: 1000, ..Lvb::default() });
    }

    #[test]
    fn test_walk_stops_at_first_low_extent() {
        let res = resource(700);
        granted(&res, 1, LockMode::Cw, Extent::new(500, 600), true);
        granted(&res, 2, LockMode::Cw, Extent::new(100, 900), true);

        // [500, 600] sorts first and ends the walk before [100, 900].
        let found = select_glimpse_candidate(&res.lock(), 700);
        assert!(found.lock.is_none());
        assert!(found.only_incapable);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_candidate_has_greatest_start(
                locks in prop::collection::vec((1000u64..2000, 0u64..1000, any::<bool>()), 1..24),
                size in 0u64..1000,
            ) {
                // Every extent ends beyond the cached size, so no walk stops early.
                let res = resource(size);
                let mut held = Vec::new();
                for (idx, (start, len, capable)) in locks.into_iter().enumerate() {
                    let extent = Extent::new(start, start + len);
                    held.push(granted(&res, idx as u64 + 1, LockMode::Cw, extent, capable));
                }

                let found = select_glimpse_candidate(&res.lock(), size);
                let best = held
                    .iter()
                    .filter(|lock| lock.export().callback_capable())
                    .map(|lock| lock.extent().start)
                    .max();

                match found.lock {
                    None => {
                        prop_assert!(best.is_none());
                        prop_assert!(found.only_incapable);
                    }
                    Some(victim) => {
                        prop_assert!(victim.export().callback_capable());
                        prop_assert_eq!(Some(victim.extent().start), best);
                        prop_assert!(!found.only_incapable);
                    }
                }
            }
        }
    }
}
