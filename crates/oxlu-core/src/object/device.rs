//! Device interfaces and the device registry.

use dashmap::DashMap;
use std::sync::Arc;

use super::{ObjectHeader, ObjectLayer, Site};
use crate::attr::LuAttr;
use crate::config::{ConfigOutcome, ConfigRecord};
use crate::env::Env;
use crate::error::{ConfigError, DeviceError, ObjectError};
use crate::fid::Fid;

/// Operations every device of a stack provides.
pub trait LuDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Allocate this device's layer for the object described by `header`.
    fn object_alloc(
        &self,
        env: &mut Env,
        header: &ObjectHeader,
    ) -> Result<Box<dyn ObjectLayer>, ObjectError>;

    /// Bring the device into service.
    fn start(&self, env: &mut Env) -> Result<(), DeviceError>;

    /// Apply a configuration record, or hand it to the device below.
    fn process_config(
        &self,
        env: &mut Env,
        record: &ConfigRecord,
    ) -> Result<ConfigOutcome, ConfigError>;
}

/// A device at the bottom of a stack that owns durable state.
pub trait StorageDevice: LuDevice {
    /// The object cache of the stack this device anchors.
    fn site(&self) -> Arc<Site>;

    /// Register an upper device as a user of this one.
    fn connect(&self, env: &mut Env) -> Result<(), DeviceError>;

    fn disconnect(&self);

    /// Attributes as recorded in storage.
    fn attr_get(&self, fid: &Fid) -> Result<LuAttr, ObjectError>;
}

/// Named devices an upper device can stack on.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: DashMap<String, Arc<dyn StorageDevice>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device under its own name, replacing any previous one.
    pub fn register(&self, dev: Arc<dyn StorageDevice>) {
        self.devices.insert(dev.name().to_string(), dev);
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn StorageDevice>> {
        self.devices.get(name).map(|dev| Arc::clone(dev.value()))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn StorageDevice>> {
        self.devices.remove(name).map(|(_, dev)| dev)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.devices.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("DeviceRegistry").field("devices", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osd::MemOsd;

    #[test]
    fn test_registry_lookup_by_name() {
        let registry = DeviceRegistry::new();
        assert!(registry.is_empty());

        registry.register(MemOsd::new("OST0000-dsk"));
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup("OST0000-dsk").is_some());
        assert!(registry.lookup("OST0001-dsk").is_none());

        assert!(registry.remove("OST0000-dsk").is_some());
        assert!(registry.is_empty());
    }
}
