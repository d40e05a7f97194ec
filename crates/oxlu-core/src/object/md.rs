//! Metadata and directory capability groups.

use bitflags::bitflags;

use super::LuObject;
use crate::attr::MdAttr;
use crate::env::Env;
use crate::error::RpcError;
use crate::fid::Fid;

bitflags! {
    /// Flags carried by a create request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CreateFlags: u32 {
        /// Create a shard of a split directory on the node that will own it.
        const SLAVE_OBJ = 0x0000_0001;
    }
}

/// What is being created, with the payload that goes along with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateKind {
    /// A regular object, a directory, or a symlink with its target.
    Regular { symlink_target: Option<String> },
    /// A directory shard. The extended-attribute payload becomes the link
    /// data and `fid` replaces the parent fid in the request.
    SlaveObject { fid: Fid, eadata: Vec<u8> },
}

/// Create request as seen by a metadata layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdCreateSpec {
    /// Parent directory, needed to build `..` on the remote node.
    pub parent: Fid,
    pub flags: CreateFlags,
    pub kind: CreateKind,
}

impl MdCreateSpec {
    pub fn regular(parent: Fid) -> Self {
        Self {
            parent,
            flags: CreateFlags::empty(),
            kind: CreateKind::Regular {
                symlink_target: None,
            },
        }
    }

    pub fn symlink(parent: Fid, target: impl Into<String>) -> Self {
        Self {
            parent,
            flags: CreateFlags::empty(),
            kind: CreateKind::Regular {
                symlink_target: Some(target.into()),
            },
        }
    }

    pub fn slave(parent: Fid, fid: Fid, eadata: Vec<u8>) -> Self {
        Self {
            parent,
            flags: CreateFlags::SLAVE_OBJ,
            kind: CreateKind::SlaveObject { fid, eadata },
        }
    }

    pub fn is_slave(&self) -> bool {
        self.flags.contains(CreateFlags::SLAVE_OBJ)
    }
}

/// Metadata operations on a single object.
pub trait MdObjectOps {
    /// Fetch attributes into `ma`.
    fn attr_get(&self, env: &mut Env, obj: &LuObject, ma: &mut MdAttr) -> Result<(), RpcError>;

    /// Create the object described by `spec`, merging the resulting
    /// attributes into `ma`.
    fn object_create(
        &self,
        env: &mut Env,
        obj: &LuObject,
        spec: &MdCreateSpec,
        ma: &mut MdAttr,
    ) -> Result<(), RpcError>;

    /// Add one link to the object.
    fn ref_add(&self, env: &mut Env, obj: &LuObject) -> Result<(), RpcError>;

    /// Drop one link from the object, merging the resulting attributes into
    /// `ma`.
    fn ref_del(&self, env: &mut Env, obj: &LuObject, ma: &mut MdAttr) -> Result<(), RpcError>;
}

/// Directory operations.
pub trait MdDirOps {
    /// Point `name` under `parent` at `link_fid`.
    ///
    /// Only the destination entry is touched; the source side of the rename is
    /// handled by whoever owns it.
    fn rename_tgt(
        &self,
        env: &mut Env,
        parent: &LuObject,
        target: Option<&LuObject>,
        link_fid: &Fid,
        name: &str,
        ma: &MdAttr,
    ) -> Result<(), RpcError>;
}
