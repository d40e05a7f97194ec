use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::env::Env;
use crate::error::ObjectError;
use crate::object::{ObjectConf, ObjectHeader, ObjectLayer, StorageDevice};

/// The filter layer of an object.
///
/// Holds its storage device only until initialization has stacked the
/// storage layer below it.
pub struct FilterObject {
    device: String,
    lower: Option<Arc<dyn StorageDevice>>,
}

impl FilterObject {
    pub fn new(device: String, lower: Arc<dyn StorageDevice>) -> Self {
        Self {
            device,
            lower: Some(lower),
        }
    }
}

impl ObjectLayer for FilterObject {
    fn device_name(&self) -> &str {
        &self.device
    }

    fn init(
        &mut self,
        env: &mut Env,
        header: &ObjectHeader,
        _conf: ObjectConf,
    ) -> Result<Option<Box<dyn ObjectLayer>>, ObjectError> {
        let Some(lower) = self.lower.take() else {
            return Ok(None);
        };
        match lower.object_alloc(env, header) {
            Ok(below) => Ok(Some(below)),
            Err(e) => {
                debug!(fid = %header.fid(), lower = lower.name(), error = %e, "Storage layer allocation failed");
                Err(ObjectError::ResourceExhausted {
                    fid: *header.fid(),
                    device: lower.name().to_string(),
                })
            }
        }
    }

    fn free(self: Box<Self>, header: &ObjectHeader) {
        trace!(fid = %header.fid(), device = %self.device, "Freeing filter layer");
    }

    fn print(&self, _header: &ObjectHeader, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "ofd-object@{self:p}")
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
