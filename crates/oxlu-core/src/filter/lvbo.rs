use std::sync::Arc;
use tracing::{debug, trace};

use crate::dlm::{LvbOps, Lvb, Resource};
use crate::error::{LockError, ObjectError};
use crate::object::StorageDevice;

/// Value block operations backed by the storage device.
///
/// Storage is always read before the resource is locked.
pub struct FilterLvbo {
    lower: Arc<dyn StorageDevice>,
}

impl FilterLvbo {
    pub fn new(lower: Arc<dyn StorageDevice>) -> Self {
        Self { lower }
    }

    /// The value block storage holds for the resource's object, `None` if the
    /// object does not exist there yet.
    fn read(&self, res: &Resource) -> Result<Option<Lvb>, LockError> {
        match self.lower.attr_get(res.id()) {
            Ok(attr) => Ok(Some(Lvb::from_attr(&attr))),
            Err(ObjectError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl LvbOps for FilterLvbo {
    fn init(&self, res: &Resource) -> Result<(), LockError> {
        let lvb = self.read(res)?.unwrap_or_default();
        trace!(res_id = %res.id(), size = lvb.size, "Initialized value block");
        *res.lock().lvb_mut() = lvb;
        Ok(())
    }

    fn update(
        &self,
        res: &Resource,
        new: Option<&Lvb>,
        increase_only: bool,
    ) -> Result<(), LockError> {
        let new = match new {
            Some(lvb) => *lvb,
            None => match self.read(res)? {
                Some(lvb) => lvb,
                None => {
                    debug!(res_id = %res.id(), "No object in storage, value block unchanged");
                    return Ok(());
                }
            },
        };

        let mut inner = res.lock();
        let old_size = inner.lvb().size;
        inner.lvb_mut().merge(&new, increase_only);
        trace!(res_id = %res.id(), old_size, size = inner.lvb().size, "Updated value block");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fid::Fid;
    use crate::osd::MemOsd;

    const FID: Fid = Fid::new(0x100000400, 8, 0);

    #[test]
    fn test_init_reads_storage() {
        let osd = MemOsd::new("OST0000-dsk");
        osd.write(FID, 8192, 42);
        let lvbo = FilterLvbo::new(osd);

        let res = Resource::new(FID);
        lvbo.init(&res).unwrap();
        let lvb = res.lvb();
        assert_eq!(lvb.size, 8192);
        assert_eq!(lvb.blocks, 16);
        assert_eq!(lvb.mtime, 42);
    }

    #[test]
    fn test_init_missing_object_is_empty() {
        let lvbo = FilterLvbo::new(MemOsd::new("OST0000-dsk"));
        let res = Resource::new(FID);
        lvbo.init(&res).unwrap();
        assert_eq!(res.lvb(), Lvb::default());
    }

    #[test]
    fn test_client_update_only_grows() {
        let osd = MemOsd::new("OST0000-dsk");
        osd.write(FID, 500, 1);
        let lvbo = FilterLvbo::new(osd);
        let res = Resource::new(FID);
        lvbo.init(&res).unwrap();

        let smaller = Lvb {
            size: 100,
            ..Lvb::default()
        };
        lvbo.update(&res, Some(&smaller), true).unwrap();
        assert_eq!(res.lvb().size, 500);

        let larger = Lvb {
            size: 900,
            ..Lvb::default()
        };
        lvbo.update(&res, Some(&larger), true).unwrap();
        assert_eq!(res.lvb().size, 900);
    }

    #[test]
    fn test_forced_update_rereads_storage() {
        let osd = MemOsd::new("OST0000-dsk");
        let lvbo = FilterLvbo::new(osd.clone());
        let res = Resource::new(FID);
        lvbo.init(&res).unwrap();
        assert_eq!(res.lvb().size, 0);

        // Still nothing in storage.
        lvbo.update(&res, None, true).unwrap();
        assert_eq!(res.lvb().size, 0);

        osd.write(FID, 3000, 7);
        lvbo.update(&res, None, true).unwrap();
        assert_eq!(res.lvb().size, 3000);
        assert_eq!(res.lvb().mtime, 7);
    }
}
