//! In-memory object storage device.
//!
//! [`MemOsd`] sits at the bottom of a stack. It keeps object attributes in a
//! concurrent map, anchors the stack's [`Site`] and records every
//! configuration record it receives.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use tracing::{debug, info, trace};

use crate::attr::LuAttr;
use crate::config::{ConfigOutcome, ConfigRecord};
use crate::env::Env;
use crate::error::{ConfigError, DeviceError, ObjectError};
use crate::fid::Fid;
use crate::object::{
    HeaderAttr, LuDevice, ObjectConf, ObjectHeader, ObjectLayer, Site, StorageDevice,
};

/// Storage device keeping object attributes in memory.
pub struct MemOsd {
    name: String,
    site: Arc<Site>,
    store: DashMap<Fid, LuAttr>,
    /// Maximum number of live object layers, `None` for unlimited.
    capacity: Option<usize>,
    live: Arc<AtomicUsize>,
    started: AtomicBool,
    connections: AtomicU32,
    config_log: Mutex<Vec<ConfigRecord>>,
}

impl MemOsd {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::build(name.into(), None)
    }

    /// A device that fails allocations once `capacity` layers are live.
    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Arc<Self> {
        Self::build(name.into(), Some(capacity))
    }

    fn build(name: String, capacity: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            name,
            site: Site::new(),
            store: DashMap::new(),
            capacity,
            live: Arc::new(AtomicUsize::new(0)),
            started: AtomicBool::new(false),
            connections: AtomicU32::new(0),
            config_log: Mutex::new(Vec::new()),
        })
    }

    /// Store attributes for `fid`, replacing what was there.
    pub fn set_attr(&self, fid: Fid, attr: LuAttr) {
        self.store.insert(fid, attr);
    }

    /// Extend the object to `size` bytes as a write ending there would.
    pub fn write(&self, fid: Fid, size: u64, mtime: i64) {
        let mut attr = self.store.entry(fid).or_default();
        attr.size = attr.size.max(size);
        attr.blocks = attr.size.div_ceil(512);
        attr.mtime = attr.mtime.max(mtime);
        attr.ctime = attr.ctime.max(mtime);
    }

    pub fn remove(&self, fid: &Fid) -> Option<LuAttr> {
        self.store.remove(fid).map(|(_, attr)| attr)
    }

    pub fn contains(&self, fid: &Fid) -> bool {
        self.store.contains_key(fid)
    }

    /// Number of object layers allocated and not yet freed.
    pub fn live_objects(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Number of upper devices connected.
    pub fn connections(&self) -> u32 {
        self.connections.load(Ordering::Acquire)
    }

    /// Configuration records received, in arrival order.
    pub fn config_log(&self) -> Vec<ConfigRecord> {
        self.config_log.lock().clone()
    }

    fn reject(&self, record: &ConfigRecord, reason: &str) -> ConfigError {
        ConfigError::Rejected {
            device: self.name.clone(),
            command: record.command().to_string(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Debug for MemOsd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemOsd")
            .field("name", &self.name)
            .field("objects", &self.store.len())
            .field("live", &self.live_objects())
            .field("connections", &self.connections())
            .finish_non_exhaustive()
    }
}

impl LuDevice for MemOsd {
    fn name(&self) -> &str {
        &self.name
    }

    fn object_alloc(
        &self,
        _env: &mut Env,
        header: &ObjectHeader,
    ) -> Result<Box<dyn ObjectLayer>, ObjectError> {
        let live = self.live.fetch_add(1, Ordering::AcqRel);
        if self.capacity.is_some_and(|cap| live >= cap) {
            self.live.fetch_sub(1, Ordering::AcqRel);
            debug!(device = %self.name, fid = %header.fid(), live, "Layer allocation refused");
            return Err(ObjectError::OutOfMemory { fid: *header.fid() });
        }
        Ok(Box::new(OsdObject {
            device: self.name.clone(),
            exists: false,
            live: Arc::clone(&self.live),
            probe: self.store.contains_key(header.fid()),
        }))
    }

    fn start(&self, _env: &mut Env) -> Result<(), DeviceError> {
        self.started.store(true, Ordering::Release);
        info!(device = %self.name, "Storage device started");
        Ok(())
    }

    fn process_config(
        &self,
        _env: &mut Env,
        record: &ConfigRecord,
    ) -> Result<ConfigOutcome, ConfigError> {
        self.config_log.lock().push(record.clone());
        match record {
            ConfigRecord::Cleanup { flags } => {
                info!(device = %self.name, flags = %flags, "Storage device cleanup");
                self.started.store(false, Ordering::Release);
                Ok(ConfigOutcome::Applied)
            }
            ConfigRecord::Param { key, .. } if key.starts_with("osd.") => {
                trace!(device = %self.name, key, "Applied storage parameter");
                Ok(ConfigOutcome::Applied)
            }
            ConfigRecord::Param { .. } => Err(self.reject(record, "unknown parameter")),
            _ => Err(self.reject(record, "unsupported record")),
        }
    }
}

impl StorageDevice for MemOsd {
    fn site(&self) -> Arc<Site> {
        Arc::clone(&self.site)
    }

    fn connect(&self, _env: &mut Env) -> Result<(), DeviceError> {
        let count = self.connections.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(device = %self.name, connections = count, "Upper device connected");
        Ok(())
    }

    fn disconnect(&self) {
        let prev = self
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        debug!(device = %self.name, connected = prev.is_ok(), "Upper device disconnected");
    }

    fn attr_get(&self, fid: &Fid) -> Result<LuAttr, ObjectError> {
        self.store
            .get(fid)
            .map(|attr| *attr)
            .ok_or(ObjectError::NotFound { fid: *fid })
    }
}

/// The storage layer of an object.
pub struct OsdObject {
    device: String,
    exists: bool,
    probe: bool,
    live: Arc<AtomicUsize>,
}

impl OsdObject {
    /// Whether storage held the object when the layer was initialized.
    pub fn exists(&self) -> bool {
        self.exists
    }
}

impl ObjectLayer for OsdObject {
    fn device_name(&self) -> &str {
        &self.device
    }

    fn init(
        &mut self,
        _env: &mut Env,
        header: &ObjectHeader,
        conf: ObjectConf,
    ) -> Result<Option<Box<dyn ObjectLayer>>, ObjectError> {
        // A new object has nothing in storage yet, whatever the probe found.
        self.exists = self.probe && !conf.contains(ObjectConf::NEW);
        if self.exists {
            header.set_attr(HeaderAttr::EXISTS);
        }
        Ok(None)
    }

    fn free(self: Box<Self>, header: &ObjectHeader) {
        trace!(fid = %header.fid(), device = %self.device, "Freeing storage layer");
        // Dropping the box releases the live count.
    }

    fn print(&self, _header: &ObjectHeader, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "osd-object@{:p}[exists={}]", self, self.exists)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for OsdObject {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}
