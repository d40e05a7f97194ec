//! Error types for the oxlu-core crate
//!
//! Every error can be reduced to a negative POSIX errno through `errno()`, so
//! request handlers can put the status on the wire unchanged.

use thiserror::Error;

use crate::dlm::LockMode;
use crate::fid::Fid;
use crate::filter::DeviceState;
use crate::mdc::MdsOp;

/// Errors raised while allocating, initializing or looking up objects.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObjectError {
    #[error("Out of memory allocating object {fid}")]
    OutOfMemory { fid: Fid },

    #[error("Device '{device}' cannot allocate a layer for {fid}")]
    ResourceExhausted { fid: Fid, device: String },

    #[error("Object {fid} not found")]
    NotFound { fid: Fid },

    #[error("Object {fid} is being destroyed")]
    Stale { fid: Fid },

    #[error("Site has no top device")]
    NoTopDevice,

    #[error("Site is already topped by device '{top}'")]
    TopBusy { top: String },
}

impl ObjectError {
    /// Negative errno for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::OutOfMemory { .. } | Self::ResourceExhausted { .. } => -libc::ENOMEM,
            Self::NotFound { .. } | Self::Stale { .. } => -libc::ENOENT,
            Self::NoTopDevice => -libc::ENODEV,
            Self::TopBusy { .. } => -libc::EBUSY,
        }
    }
}

/// A remote metadata call returned a non-zero status.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("{op} RPC failed with status {status}")]
    Status { op: MdsOp, status: i32 },

    #[error("{op} RPC reply carries no body")]
    MissingReply { op: MdsOp },
}

impl RpcError {
    /// The status the transport returned, passed through verbatim.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Status { status, .. } => *status,
            Self::MissingReply { .. } => -libc::EPROTO,
        }
    }
}

/// Errors from the lock namespace and its policies.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Lock resource for {res_id} no longer exists")]
    NoResource { res_id: Fid },

    #[error("Namespace '{namespace}' has no intent policy registered")]
    NoIntentPolicy { namespace: String },

    #[error("Namespace '{namespace}' has no value block operations")]
    NoLvbOps { namespace: String },

    #[error("{mode} request on {res_id} conflicts with {conflicts} granted lock(s)")]
    Conflict {
        res_id: Fid,
        mode: LockMode,
        conflicts: usize,
    },

    #[error("Lock {handle:#x} not found")]
    UnknownHandle { handle: u64 },

    #[error("Lock {handle:#x} has no client to call back")]
    NoCallback { handle: u64 },

    #[error("Glimpse callback for lock {handle:#x} failed with status {status}")]
    Callback { handle: u64, status: i32 },

    #[error("Namespace '{namespace}' is shutting down")]
    Stopping { namespace: String },

    #[error("Backing store refresh failed: {0}")]
    Backing(#[from] ObjectError),
}

impl LockError {
    /// Negative errno for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::NoResource { .. } | Self::UnknownHandle { .. } => -libc::ENOENT,
            Self::NoIntentPolicy { .. } | Self::NoLvbOps { .. } => -libc::EPROTO,
            Self::Conflict { .. } => -libc::EAGAIN,
            Self::NoCallback { .. } => -libc::ENOTCONN,
            Self::Callback { status, .. } => *status,
            Self::Stopping { .. } => -libc::ESHUTDOWN,
            Self::Backing(e) => e.errno(),
        }
    }
}

/// Errors raised while parsing or applying configuration records.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Device '{device}' rejected {command} record: {reason}")]
    Rejected {
        device: String,
        command: String,
        reason: String,
    },

    #[error("Invalid value '{value}' for parameter '{key}'")]
    InvalidParam { key: String, value: String },

    #[error("Malformed parameter '{0}', expected key=value")]
    MalformedParam(String),

    #[error("Invalid security rule '{rule}': {reason}")]
    InvalidSecurityRule { rule: String, reason: &'static str },

    #[error("Setup record is missing buffer {index}")]
    MissingBuffer { index: usize },

    #[error("Configuration parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    /// Negative errno for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Rejected { .. } => -libc::ENOSYS,
            Self::InvalidParam { .. }
            | Self::MalformedParam(_)
            | Self::InvalidSecurityRule { .. }
            | Self::MissingBuffer { .. }
            | Self::Parse(_) => -libc::EINVAL,
        }
    }
}

/// Errors from the statistics registration hook.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatsError {
    #[error("Statistics for '{device}' are already registered")]
    AlreadyRegistered { device: String },

    #[error("Statistics registry unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Errors from device setup, start and connection handling.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Cannot locate device '{name}'")]
    NoDevice { name: String },

    #[error("Device '{name}' is not accepting connections")]
    ConnectionRefused { name: String },

    #[error("Export {export_id} is not connected to '{name}'")]
    NotConnected { name: String, export_id: u64 },

    #[error("Device '{name}' cannot go from {from:?} to {to:?}")]
    InvalidState {
        name: String,
        from: DeviceState,
        to: DeviceState,
    },

    #[error("Device '{name}' failed to start with status {status}")]
    StartFailed { name: String, status: i32 },

    #[error("Object error: {0}")]
    Object(#[from] ObjectError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Statistics registration failed: {0}")]
    Stats(#[from] StatsError),
}

impl DeviceError {
    /// Negative errno for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::NoDevice { .. } => -libc::ENODEV,
            Self::ConnectionRefused { .. } => -libc::EAGAIN,
            Self::NotConnected { .. } => -libc::ENOTCONN,
            Self::InvalidState { .. } => -libc::EALREADY,
            Self::StartFailed { status, .. } => *status,
            Self::Object(e) => e.errno(),
            Self::Lock(e) => e.errno(),
            Self::Config(e) => e.errno(),
            Self::Stats(_) => -libc::ENOMEM,
        }
    }
}
