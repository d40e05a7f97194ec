use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument, trace};

use super::{CreateAttr, MdRpc, MdsOp, RpcRequest};
use crate::attr::{AttrValid, MdAttr};
use crate::env::Env;
use crate::error::{ObjectError, RpcError};
use crate::fid::Fid;
use crate::object::{
    CreateFlags, CreateKind, HeaderAttr, LuObject, MdCreateSpec, MdDirOps, MdObjectOps,
    ObjectConf, ObjectHeader, ObjectLayer,
};

/// Attributes fetched by a proxy getattr, whatever the caller asked for.
const GETATTR_VALID: AttrValid = AttrValid::MODE.union(AttrValid::UID).union(AttrValid::GID);

/// Proxy layer of an object served by a remote metadata target.
pub struct MdcObject {
    device: String,
    rpc: Arc<dyn MdRpc>,
}

impl MdcObject {
    pub(super) fn new(device: String, rpc: Arc<dyn MdRpc>) -> Self {
        Self { device, rpc }
    }
}

/// Check the status of a finished call and merge its reply body into `ma`.
///
/// The request is released on every path.
fn complete(op: MdsOp, req: RpcRequest, ma: Option<&mut MdAttr>) -> Result<(), RpcError> {
    let status = req.status();
    let result = if status != 0 {
        debug!(%op, status, xid = req.xid(), "Remote call failed");
        Err(RpcError::Status { op, status })
    } else if let Some(ma) = ma {
        match req.reply_body() {
            Some(body) => {
                ma.update_from_body(body);
                Ok(())
            }
            None => Err(RpcError::MissingReply { op }),
        }
    } else {
        Ok(())
    };
    req.finished();
    result
}

impl ObjectLayer for MdcObject {
    fn device_name(&self) -> &str {
        &self.device
    }

    fn init(
        &mut self,
        _env: &mut Env,
        header: &ObjectHeader,
        _conf: ObjectConf,
    ) -> Result<Option<Box<dyn ObjectLayer>>, ObjectError> {
        header.set_attr(HeaderAttr::REMOTE);
        Ok(None)
    }

    fn free(self: Box<Self>, header: &ObjectHeader) {
        trace!(fid = %header.fid(), device = %self.device, "Freeing proxy object");
    }

    fn print(&self, _header: &ObjectHeader, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "mdc-object@{:p}", self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn md_ops(&self) -> Option<&dyn MdObjectOps> {
        Some(self)
    }

    fn dir_ops(&self) -> Option<&dyn MdDirOps> {
        Some(self)
    }
}

impl MdObjectOps for MdcObject {
    #[instrument(level = "debug", skip_all, fields(fid = %obj.fid()))]
    fn attr_get(&self, env: &mut Env, obj: &LuObject, ma: &mut MdAttr) -> Result<(), RpcError> {
        env.mdc_info_init();
        let req = self.rpc.getattr(obj.fid(), GETATTR_VALID);
        complete(MdsOp::Getattr, req, Some(ma))
    }

    #[instrument(level = "debug", skip_all, fields(fid = %obj.fid(), parent = %spec.parent, slave = spec.is_slave()))]
    fn object_create(
        &self,
        env: &mut Env,
        obj: &LuObject,
        spec: &MdCreateSpec,
        ma: &mut MdAttr,
    ) -> Result<(), RpcError> {
        let la = ma.attr;
        let op = &mut env.mdc_info_init().opdata;
        op.fid2 = *obj.fid();
        // The remote node needs the parent to build "..".
        op.fid1 = spec.parent;
        op.mod_time = la.mtime;

        let payload: Vec<u8> = match &spec.kind {
            CreateKind::SlaveObject { fid, eadata } if spec.is_slave() => {
                op.fid1 = *fid;
                op.flags |= CreateFlags::SLAVE_OBJ;
                eadata.clone()
            }
            CreateKind::Regular {
                symlink_target: Some(target),
            } => {
                let mut bytes = Vec::with_capacity(target.len() + 1);
                bytes.extend_from_slice(target.as_bytes());
                bytes.push(0);
                bytes
            }
            _ => Vec::new(),
        };

        let attr = CreateAttr {
            mode: la.mode,
            uid: la.uid,
            gid: la.gid,
            cap: 0,
            rdev: la.rdev,
        };
        let req = self.rpc.create(op, &payload, &attr);
        complete(MdsOp::Create, req, Some(ma))
    }

    #[instrument(level = "debug", skip_all, fields(fid = %obj.fid()))]
    fn ref_add(&self, env: &mut Env, obj: &LuObject) -> Result<(), RpcError> {
        let op = &mut env.mdc_info_init().opdata;
        op.fid1 = *obj.fid();
        let req = self.rpc.link(op);
        complete(MdsOp::Link, req, None)
    }

    #[instrument(level = "debug", skip_all, fields(fid = %obj.fid()))]
    fn ref_del(&self, env: &mut Env, obj: &LuObject, ma: &mut MdAttr) -> Result<(), RpcError> {
        let la = ma.attr;
        let op = &mut env.mdc_info_init().opdata;
        op.fid1 = *obj.fid();
        op.create_mode = la.mode;
        op.mod_time = la.ctime;
        op.fsuid = la.uid;
        op.fsgid = la.gid;
        let req = self.rpc.unlink(op);
        complete(MdsOp::Unlink, req, Some(ma))
    }
}

impl MdDirOps for MdcObject {
    #[instrument(level = "debug", skip_all, fields(parent = %parent.fid(), link = %link_fid, name = %name))]
    fn rename_tgt(
        &self,
        env: &mut Env,
        parent: &LuObject,
        _target: Option<&LuObject>,
        link_fid: &Fid,
        name: &str,
        ma: &MdAttr,
    ) -> Result<(), RpcError> {
        let la = &ma.attr;
        let op = &mut env.mdc_info_init().opdata;
        op.fid1 = *parent.fid();
        op.fid2 = *link_fid;
        op.mod_time = la.ctime;
        op.fsuid = la.uid;
        op.fsgid = la.gid;
        let req = self.rpc.rename(op, None, name);
        complete(MdsOp::Rename, req, None)
    }
}
