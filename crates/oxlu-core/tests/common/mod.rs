//! Shared helpers for oxlu-core integration tests.

#![allow(dead_code)]

use oxlu_core::dlm::{ClientCallbacks, Export, Lock, Lvb};
use oxlu_core::stats::{MemoryStatsRegistry, StatsRegistry};
use oxlu_core::{DeviceRegistry, Env, FilterConfig, FilterDevice, LockError, MemOsd, StorageDevice};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// A filter device running on an in-memory storage device.
pub struct TestStack {
    pub devices: DeviceRegistry,
    pub osd: Arc<MemOsd>,
    pub registry: Arc<MemoryStatsRegistry>,
    pub dev: Arc<FilterDevice>,
    pub env: Env,
}

impl TestStack {
    pub fn running(name: &str) -> Self {
        let devices = DeviceRegistry::new();
        let osd = MemOsd::new(format!("{name}-dsk"));
        devices.register(Arc::clone(&osd) as Arc<dyn StorageDevice>);
        let registry = Arc::new(MemoryStatsRegistry::new());
        let mut env = Env::new();

        let dev = FilterDevice::setup(
            &mut env,
            &devices,
            Arc::clone(&registry) as Arc<dyn StatsRegistry>,
            FilterConfig::new(name),
        )
        .expect("setup");
        dev.start(&mut env).expect("start");

        Self {
            devices,
            osd,
            registry,
            dev,
            env,
        }
    }
}

/// Client callback channel answering glimpses with a fixed size.
#[derive(Default)]
pub struct SizeClient {
    pub size: AtomicU64,
    pub calls: AtomicU32,
    pub fail: AtomicBool,
}

impl SizeClient {
    pub fn with_size(size: u64) -> Arc<Self> {
        let client = Self::default();
        client.size.store(size, Ordering::Relaxed);
        Arc::new(client)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ClientCallbacks for SizeClient {
    fn glimpse(&self, lock: &Lock) -> Result<Lvb, LockError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::Relaxed) {
            return Err(LockError::Callback {
                handle: lock.handle(),
                status: -libc::ETIMEDOUT,
            });
        }
        Ok(Lvb {
            size: self.size.load(Ordering::Relaxed),
            ..Lvb::default()
        })
    }
}

/// Connect a client that answers glimpses through `client`.
pub fn connect_client(dev: &FilterDevice, id: u64, client: &Arc<SizeClient>) -> Arc<Export> {
    let export = Arc::new(
        Export::new(id, format!("client-{id}"))
            .with_callbacks(Arc::clone(client) as Arc<dyn ClientCallbacks>),
    );
    dev.connect(Arc::clone(&export)).expect("connect");
    export
}

/// Connect a client that takes no callbacks.
pub fn connect_incapable(dev: &FilterDevice, id: u64) -> Arc<Export> {
    let export = Arc::new(Export::new(id, format!("client-{id}")).without_callbacks());
    dev.connect(Arc::clone(&export)).expect("connect");
    export
}
