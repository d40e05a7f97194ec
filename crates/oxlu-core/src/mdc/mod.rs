//! Proxy objects for metadata that lives on another node.
//!
//! An [`MdcDevice`] sits where a local metadata device would and forwards
//! every operation on its objects as one synchronous RPC through an
//! [`MdRpc`] transport. Reply bodies are merged into the caller's attributes
//! with the rule of [`LuAttr::merge_body`](crate::attr::LuAttr::merge_body).

mod object;
mod rpc;

pub use object::MdcObject;
pub use rpc::{CreateAttr, MdRpc, RpcRequest};

use std::fmt;
use std::sync::Arc;
use tracing::trace;

use crate::config::{ConfigOutcome, ConfigRecord};
use crate::env::Env;
use crate::error::{ConfigError, DeviceError, ObjectError};
use crate::fid::Fid;
use crate::object::{CreateFlags, LuDevice, ObjectHeader, ObjectLayer};

/// Metadata operations sent to the remote node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MdsOp {
    Getattr,
    Create,
    Link,
    Unlink,
    Rename,
}

impl fmt::Display for MdsOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Getattr => "getattr",
            Self::Create => "create",
            Self::Link => "link",
            Self::Unlink => "unlink",
            Self::Rename => "rename",
        })
    }
}

/// Operation descriptor carried by a metadata request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpData {
    pub fid1: Fid,
    pub fid2: Fid,
    pub mod_time: i64,
    pub fsuid: u32,
    pub fsgid: u32,
    pub create_mode: u32,
    pub flags: CreateFlags,
}

/// Device whose objects are served by a remote metadata target.
pub struct MdcDevice {
    name: String,
    /// Index of the remote target in the cluster.
    target: u32,
    rpc: Arc<dyn MdRpc>,
}

impl MdcDevice {
    pub fn new(name: impl Into<String>, target: u32, rpc: Arc<dyn MdRpc>) -> Self {
        Self {
            name: name.into(),
            target,
            rpc,
        }
    }

    pub fn target(&self) -> u32 {
        self.target
    }
}

impl fmt::Debug for MdcDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MdcDevice")
            .field("name", &self.name)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl LuDevice for MdcDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn object_alloc(
        &self,
        _env: &mut Env,
        header: &ObjectHeader,
    ) -> Result<Box<dyn ObjectLayer>, ObjectError> {
        trace!(device = %self.name, fid = %header.fid(), "Allocating proxy object");
        Ok(Box::new(MdcObject::new(
            self.name.clone(),
            Arc::clone(&self.rpc),
        )))
    }

    fn start(&self, _env: &mut Env) -> Result<(), DeviceError> {
        Ok(())
    }

    /// The proxy has no device below it, so nothing can be forwarded.
    fn process_config(
        &self,
        _env: &mut Env,
        record: &ConfigRecord,
    ) -> Result<ConfigOutcome, ConfigError> {
        Err(ConfigError::Rejected {
            device: self.name.clone(),
            command: record.command().to_string(),
            reason: "proxy devices take no configuration".to_string(),
        })
    }
}
