//! Object filter device.
//!
//! [`FilterDevice`] is the top of an object server stack. It stacks on a
//! storage device, owns the server lock namespace for the objects it serves
//! and answers size glimpses through [`FilterIntentPolicy`].
//!
//! # Lifecycle
//!
//! ```text
//! Allocated -> Stacked -> NamespaceReady -> Running -> Stopping -> TornDown
//! ```
//!
//! [`FilterDevice::setup`] walks the first three steps and unwinds whatever
//! it completed if a later step fails. Connections are refused until
//! [`FilterDevice::start`] succeeds. [`FilterDevice::shutdown`] reverses every
//! step and never fails; steps that go wrong are logged and skipped.

mod handlers;
mod intent;
mod lvbo;
mod object;

pub use intent::{FilterIntentPolicy, GlimpseCandidate, select_glimpse_candidate};
pub use lvbo::FilterLvbo;
pub use object::FilterObject;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::fmt::{self, Write as _};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{
    CleanupFlags, ConfigOutcome, ConfigRecord, Flavor, FilterConfig, RuleDirection,
    SecurityRuleSet,
};
use crate::dlm::{EnqueueReply, EnqueueRequest, Export, Lock, Namespace};
use crate::env::Env;
use crate::error::{ConfigError, DeviceError, LockError, ObjectError};
use crate::fid::Fid;
use crate::object::{
    DeviceRegistry, LuDevice, ObjectConf, ObjectHeader, ObjectLayer, ObjectRef, Site,
    StorageDevice,
};
use crate::stats::{FilterStats, StatsRegistry};
use handlers::{CONFIG_HANDLERS, HandlerOutcome};

/// Lifecycle state of a filter device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Allocated,
    /// Stacked on the storage device and its site.
    Stacked,
    /// Lock namespace created and statistics registered.
    NamespaceReady,
    /// Accepting connections.
    Running,
    Stopping,
    TornDown,
}

/// The object filter device.
pub struct FilterDevice {
    name: String,
    config: RwLock<FilterConfig>,
    state: Mutex<DeviceState>,
    /// Set while connections must be refused.
    no_conn: AtomicBool,
    lower: Arc<dyn StorageDevice>,
    site: Arc<Site>,
    namespace: RwLock<Option<Arc<Namespace>>>,
    stats: Arc<FilterStats>,
    stats_registry: Arc<dyn StatsRegistry>,
    security: RwLock<SecurityRuleSet>,
    exports: DashMap<u64, Arc<Export>>,
    cleanup_flags: Mutex<CleanupFlags>,
}

impl FilterDevice {
    /// Build a device from `config`, stack it on its storage device and
    /// create its lock namespace.
    ///
    /// The returned device is in [`DeviceState::NamespaceReady`] and still
    /// refuses connections. On failure every completed step is undone in
    /// reverse order and the error of the failing step is returned.
    #[instrument(level = "info", skip_all, fields(device = %config.name))]
    pub fn setup(
        env: &mut Env,
        devices: &DeviceRegistry,
        stats_registry: Arc<dyn StatsRegistry>,
        config: FilterConfig,
    ) -> Result<Arc<Self>, DeviceError> {
        let lower_name = config.lower_name();
        let Some(lower) = devices.lookup(&lower_name) else {
            error!(lower = %lower_name, "Cannot locate storage device");
            return Err(DeviceError::NoDevice { name: lower_name });
        };
        if !config.recovery {
            info!("Recovery disabled");
        }

        let dev = Arc::new(Self {
            name: config.name.clone(),
            site: lower.site(),
            lower,
            config: RwLock::new(config),
            state: Mutex::new(DeviceState::Allocated),
            no_conn: AtomicBool::new(true),
            namespace: RwLock::new(None),
            stats: Arc::new(FilterStats::new()),
            stats_registry,
            security: RwLock::new(SecurityRuleSet::default()),
            exports: DashMap::new(),
            cleanup_flags: Mutex::new(CleanupFlags::empty()),
        });

        dev.stack_init(env)?;
        if let Err(e) = dev.namespace_init(env) {
            error!(error = %e, "Namespace setup failed");
            dev.stack_fini(env);
            *dev.state.lock() = DeviceState::TornDown;
            return Err(e);
        }
        info!(namespace = %dev.namespace_name(), "Filter device set up");
        Ok(dev)
    }

    fn stack_init(self: &Arc<Self>, env: &mut Env) -> Result<(), DeviceError> {
        if let Err(e) = self.lower.connect(env) {
            error!(lower = self.lower.name(), error = %e, "Cannot connect to storage device");
            return Err(e);
        }
        let top: Arc<dyn LuDevice> = Arc::clone(self) as Arc<dyn LuDevice>;
        if let Err(e) = self.site.set_top(&top) {
            error!(lower = self.lower.name(), error = %e, "Storage device is already stacked on");
            self.lower.disconnect();
            return Err(e.into());
        }
        self.set_state(DeviceState::Stacked);
        Ok(())
    }

    fn namespace_init(&self, env: &mut Env) -> Result<(), DeviceError> {
        let info = env.filter_info_init();
        let _ = write!(info.name, "filter-{}", self.name);
        let ns = Namespace::new(info.name.clone());
        ns.register_intent(Arc::new(FilterIntentPolicy::new(Arc::clone(&self.stats))));
        ns.set_lvb_ops(Arc::new(FilterLvbo::new(Arc::clone(&self.lower))));

        if let Err(e) = self
            .stats_registry
            .register(&self.name, Arc::clone(&self.stats))
        {
            ns.free();
            return Err(e.into());
        }
        *self.namespace.write() = Some(ns);
        self.set_state(DeviceState::NamespaceReady);
        Ok(())
    }

    /// Stop using the storage device: flush the site, send it a cleanup
    /// record and disconnect.
    fn stack_fini(&self, env: &mut Env) {
        self.site.purge(usize::MAX);

        let flags = *self.cleanup_flags.lock();
        let record = ConfigRecord::Cleanup { flags };
        if let Err(e) = self.lower.process_config(env, &record) {
            warn!(lower = self.lower.name(), flags = %flags, error = %e, "Storage device cleanup failed");
        }

        self.site.purge(usize::MAX);
        let left = self.site.len();
        if left > 0 {
            warn!(left, "Objects still referenced after cleanup");
        }
        self.lower.disconnect();
        self.site.clear_top();
    }

    /// Start the storage device and begin accepting connections.
    #[instrument(level = "info", skip_all, fields(device = %self.name))]
    pub fn start(&self, env: &mut Env) -> Result<(), DeviceError> {
        let state = self.state();
        if state != DeviceState::NamespaceReady {
            return Err(DeviceError::InvalidState {
                name: self.name.clone(),
                from: state,
                to: DeviceState::Running,
            });
        }
        if let Err(e) = self.lower.start(env) {
            error!(error = %e, "Storage device failed to start");
            return Err(DeviceError::StartFailed {
                name: self.name.clone(),
                status: e.errno(),
            });
        }
        self.no_conn.store(false, Ordering::Release);
        self.set_state(DeviceState::Running);
        info!("Filter device running");
        Ok(())
    }

    /// Tear the device down in reverse order of setup.
    ///
    /// Safe to call in any state and more than once.
    #[instrument(level = "info", skip_all, fields(device = %self.name))]
    pub fn shutdown(&self, env: &mut Env) {
        {
            let mut state = self.state.lock();
            if matches!(*state, DeviceState::TornDown | DeviceState::Stopping) {
                return;
            }
            *state = DeviceState::Stopping;
        }
        self.no_conn.store(true, Ordering::Release);

        let exports = self.exports.len();
        self.exports.clear();
        self.stats.clear_exports();

        let ns = self.namespace.write().take();
        if let Some(ns) = &ns {
            ns.purge();
        }
        self.stack_fini(env);
        if let Some(ns) = ns {
            ns.free();
        }
        self.stats_registry.unregister(&self.name);

        self.set_state(DeviceState::TornDown);
        info!(exports, "Filter device torn down");
    }

    /// Flags sent to the storage device in the cleanup record.
    pub fn set_cleanup_flags(&self, flags: CleanupFlags) {
        *self.cleanup_flags.lock() = flags;
    }

    /// Admit a client.
    pub fn connect(&self, export: Arc<Export>) -> Result<(), DeviceError> {
        if self.no_conn.load(Ordering::Acquire) {
            debug!(device = %self.name, export = export.id(), "Refusing connection");
            return Err(DeviceError::ConnectionRefused {
                name: self.name.clone(),
            });
        }
        self.stats.export(export.id());
        debug!(device = %self.name, export = export.id(), client = export.client_uuid(), "Client connected");
        self.exports.insert(export.id(), export);
        Ok(())
    }

    pub fn disconnect(&self, export_id: u64) -> Result<(), DeviceError> {
        if self.exports.remove(&export_id).is_none() {
            return Err(DeviceError::NotConnected {
                name: self.name.clone(),
                export_id,
            });
        }
        self.stats.remove_export(export_id);
        debug!(device = %self.name, export = export_id, "Client disconnected");
        Ok(())
    }

    pub fn is_connected(&self, export_id: u64) -> bool {
        self.exports.contains_key(&export_id)
    }

    /// Find or build the object for `fid` in this device's stack.
    pub fn object_find(&self, env: &mut Env, fid: Fid) -> Result<ObjectRef, ObjectError> {
        self.site.find(env, fid, ObjectConf::empty())
    }

    /// Request a lock on behalf of a connected client.
    #[instrument(level = "debug", skip_all, fields(device = %self.name, export = req.export.id()))]
    pub fn lock_enqueue(&self, req: EnqueueRequest) -> Result<EnqueueReply, DeviceError> {
        let export_id = req.export.id();
        if !self.is_connected(export_id) {
            return Err(DeviceError::NotConnected {
                name: self.name.clone(),
                export_id,
            });
        }
        Ok(self.namespace()?.enqueue(req)?)
    }

    /// Cancel a lock; returns the waiting locks granted as a result.
    pub fn lock_cancel(&self, handle: u64) -> Result<Vec<Arc<Lock>>, DeviceError> {
        Ok(self.namespace()?.cancel(handle)?)
    }

    /// The lock namespace, unless the device has been torn down.
    pub fn namespace(&self) -> Result<Arc<Namespace>, LockError> {
        self.namespace
            .read()
            .clone()
            .ok_or_else(|| LockError::Stopping {
                namespace: self.namespace_name(),
            })
    }

    fn namespace_name(&self) -> String {
        format!("filter-{}", self.name)
    }

    /// Apply a configuration record.
    ///
    /// Records no handler of this device claims go to the storage device,
    /// whose answer is returned unchanged.
    #[instrument(level = "debug", skip_all, fields(device = %self.name, command = record.command()))]
    pub fn process_config(
        &self,
        env: &mut Env,
        record: &ConfigRecord,
    ) -> Result<ConfigOutcome, ConfigError> {
        for handler in CONFIG_HANDLERS {
            if handler.handle(self, record)? == HandlerOutcome::Handled {
                return Ok(ConfigOutcome::Applied);
            }
        }
        self.lower.process_config(env, record)?;
        debug!(lower = self.lower.name(), "Forwarded configuration record");
        Ok(ConfigOutcome::Forwarded)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    fn set_state(&self, to: DeviceState) {
        let mut state = self.state.lock();
        debug!(device = %self.name, from = ?*state, to = ?to, "State change");
        *state = to;
    }

    /// Current configuration.
    pub fn config(&self) -> FilterConfig {
        self.config.read().clone()
    }

    pub fn stats(&self) -> &Arc<FilterStats> {
        &self.stats
    }

    pub fn site(&self) -> &Arc<Site> {
        &self.site
    }

    /// Security flavor for peers on `network` in `direction`.
    pub fn flavor_for(&self, network: &str, direction: RuleDirection) -> Flavor {
        self.security.read().flavor_for(network, direction)
    }

    pub fn security_rules(&self) -> SecurityRuleSet {
        self.security.read().clone()
    }
}

impl fmt::Debug for FilterDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterDevice")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("lower", &self.lower.name())
            .field("exports", &self.exports.len())
            .finish_non_exhaustive()
    }
}

impl LuDevice for FilterDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn object_alloc(
        &self,
        _env: &mut Env,
        header: &ObjectHeader,
    ) -> Result<Box<dyn ObjectLayer>, ObjectError> {
        trace!(device = %self.name, fid = %header.fid(), "Allocating filter layer");
        Ok(Box::new(FilterObject::new(
            self.name.clone(),
            Arc::clone(&self.lower),
        )))
    }

    fn start(&self, env: &mut Env) -> Result<(), DeviceError> {
        FilterDevice::start(self, env)
    }

    fn process_config(
        &self,
        env: &mut Env,
        record: &ConfigRecord,
    ) -> Result<ConfigOutcome, ConfigError> {
        FilterDevice::process_config(self, env, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatsError;
    use crate::osd::MemOsd;
    use crate::stats::MemoryStatsRegistry;

    fn stack(name: &str) -> (DeviceRegistry, Arc<MemOsd>) {
        let devices = DeviceRegistry::new();
        let osd = MemOsd::new(format!("{name}-dsk"));
        devices.register(Arc::clone(&osd) as Arc<dyn StorageDevice>);
        (devices, osd)
    }

    #[test]
    fn test_setup_reaches_namespace_ready() {
        let (devices, osd) = stack("OST0000");
        let registry = Arc::new(MemoryStatsRegistry::new());
        let mut env = Env::new();

        let dev = FilterDevice::setup(
            &mut env,
            &devices,
            Arc::clone(&registry) as Arc<dyn StatsRegistry>,
            FilterConfig::new("OST0000"),
        )
        .unwrap();

        assert_eq!(dev.state(), DeviceState::NamespaceReady);
        assert_eq!(dev.namespace().unwrap().name(), "filter-OST0000");
        assert_eq!(osd.connections(), 1);
        assert_eq!(registry.registrations(), 1);
        assert!(registry.get("OST0000").is_some());
        assert!(dev.site().top().is_some());
    }

    #[test]
    fn test_setup_without_lower_device() {
        let devices = DeviceRegistry::new();
        let mut env = Env::new();
        let err = FilterDevice::setup(
            &mut env,
            &devices,
            Arc::new(MemoryStatsRegistry::new()),
            FilterConfig::new("OST0000"),
        )
        .unwrap_err();

        assert!(matches!(err, DeviceError::NoDevice { ref name } if name == "OST0000-dsk"));
        assert_eq!(err.errno(), -libc::ENODEV);
    }

    #[test]
    fn test_setup_unwinds_when_stats_registration_fails() {
        let (devices, osd) = stack("OST0000");
        let registry = Arc::new(MemoryStatsRegistry::new());
        registry
            .register("OST0000", Arc::new(FilterStats::new()))
            .unwrap();
        let mut env = Env::new();

        let err = FilterDevice::setup(
            &mut env,
            &devices,
            Arc::clone(&registry) as Arc<dyn StatsRegistry>,
            FilterConfig::new("OST0000"),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            DeviceError::Stats(StatsError::AlreadyRegistered { .. })
        ));
        assert_eq!(osd.connections(), 0);
        assert!(osd.site().top().is_none());
        assert_eq!(registry.registrations(), 1);
        // The storage device saw the cleanup record of the unwind.
        assert!(matches!(
            osd.config_log().last(),
            Some(ConfigRecord::Cleanup { .. })
        ));
    }

    #[test]
    fn test_connections_refused_until_running() {
        let (devices, _osd) = stack("OST0000");
        let mut env = Env::new();
        let dev = FilterDevice::setup(
            &mut env,
            &devices,
            Arc::new(MemoryStatsRegistry::new()),
            FilterConfig::new("OST0000"),
        )
        .unwrap();

        let export = Arc::new(Export::new(1, "client-1"));
        assert!(matches!(
            dev.connect(Arc::clone(&export)),
            Err(DeviceError::ConnectionRefused { .. })
        ));

        dev.start(&mut env).unwrap();
        assert_eq!(dev.state(), DeviceState::Running);
        dev.connect(export).unwrap();
        assert!(dev.is_connected(1));

        assert!(matches!(
            dev.start(&mut env),
            Err(DeviceError::InvalidState {
                from: DeviceState::Running,
                ..
            })
        ));

        dev.disconnect(1).unwrap();
        assert!(matches!(
            dev.disconnect(1),
            Err(DeviceError::NotConnected { export_id: 1, .. })
        ));
    }

    #[test]
    fn test_shutdown_reverses_setup() {
        let (devices, osd) = stack("OST0000");
        let registry = Arc::new(MemoryStatsRegistry::new());
        let mut env = Env::new();
        let dev = FilterDevice::setup(
            &mut env,
            &devices,
            Arc::clone(&registry) as Arc<dyn StatsRegistry>,
            FilterConfig::new("OST0000"),
        )
        .unwrap();
        dev.start(&mut env).unwrap();
        dev.set_cleanup_flags(CleanupFlags::FORCE | CleanupFlags::FAILOVER);

        let fid = Fid::new(0x100000400, 3, 0);
        drop(dev.object_find(&mut env, fid).unwrap());
        assert_eq!(dev.site().len(), 1);

        dev.shutdown(&mut env);
        assert_eq!(dev.state(), DeviceState::TornDown);
        assert!(dev.site().is_empty());
        assert_eq!(osd.connections(), 0);
        assert!(!osd.is_started());
        assert!(registry.is_empty());
        assert!(dev.namespace().is_err());
        assert_eq!(
            osd.config_log().last(),
            Some(&ConfigRecord::Cleanup {
                flags: CleanupFlags::FORCE | CleanupFlags::FAILOVER
            })
        );

        // A second shutdown is a no-op.
        dev.shutdown(&mut env);
        assert_eq!(osd.config_log().len(), 1);
        assert!(matches!(
            dev.object_find(&mut env, fid),
            Err(ObjectError::NoTopDevice)
        ));
    }
}
