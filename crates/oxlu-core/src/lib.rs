//! Server-side object and lock layer for a clustered filesystem.
//!
//! This crate provides the pieces a metadata or object storage server needs
//! between its RPC front end and its storage back end:
//!
//! - [`object`] - Layered objects keyed by [`Fid`], the per-stack object cache
//!   ([`Site`]) and the device trait every layer implements
//! - [`mdc`] - Proxy objects that forward metadata operations to a remote node
//! - [`dlm`] - Lock namespace, resources, interval trees and the policy hooks
//! - [`filter`] - The object filter device: lifecycle controller, glimpse
//!   intent resolver and value-block accessor
//! - [`osd`] - An in-memory storage device used at the bottom of a stack
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use oxlu_core::{DeviceRegistry, Env, FilterConfig, FilterDevice, Fid, MemOsd};
//! use oxlu_core::stats::MemoryStatsRegistry;
//!
//! let registry = DeviceRegistry::new();
//! registry.register(MemOsd::new("OST0000-dsk"));
//!
//! let mut env = Env::new();
//! let config = FilterConfig::new("OST0000");
//! let stats = Arc::new(MemoryStatsRegistry::new());
//! let dev = FilterDevice::setup(&mut env, &registry, stats, config).unwrap();
//! dev.start(&mut env).unwrap();
//!
//! let object = dev.object_find(&mut env, Fid::new(0x100000400, 1, 0)).unwrap();
//! assert_eq!(object.layer_count(), 2);
//! drop(object);
//!
//! dev.shutdown(&mut env);
//! ```

pub mod attr;
pub mod config;
pub mod dlm;
pub mod env;
pub mod error;
pub mod fid;
pub mod filter;
pub mod mdc;
pub mod object;
pub mod osd;
pub mod stats;

pub use attr::{AttrValid, LuAttr, MdAttr, MdtBody};
pub use config::{ConfigOutcome, ConfigRecord, FilterConfig};
pub use env::Env;
pub use error::{ConfigError, DeviceError, LockError, ObjectError, RpcError};
pub use fid::Fid;
pub use filter::{DeviceState, FilterDevice};
pub use mdc::{MdcDevice, MdcObject};
pub use object::{DeviceRegistry, LuDevice, LuObject, ObjectHeader, ObjectRef, Site, StorageDevice};
pub use osd::MemOsd;
