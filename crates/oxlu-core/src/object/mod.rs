//! Layered objects.
//!
//! One filesystem object is represented once per device of a vertical stack.
//! The representations ("layers") are owned, top to bottom, by a single
//! [`LuObject`] and addressed by index. Construction is two-phase:
//!
//! 1. **Allocate**: the top device allocates its layer for the fid
//! 2. **Initialize**: each layer, starting at the top, may allocate the layer
//!    of the device below it; the new layer is appended and initialized next
//!
//! Objects are shared through the [`Site`] cache of their stack and are freed
//! when the site evicts them with no references left.

mod device;
mod md;
mod site;

pub use device::{DeviceRegistry, LuDevice, StorageDevice};
pub use md::{CreateFlags, CreateKind, MdCreateSpec, MdDirOps, MdObjectOps};
pub use site::{ObjectRef, Site, SiteStatsSnapshot};

use bitflags::bitflags;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, trace};

use crate::env::Env;
use crate::error::ObjectError;
use crate::fid::Fid;

bitflags! {
    /// Object attributes recorded in the header by the layers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HeaderAttr: u32 {
        /// The object exists in storage.
        const EXISTS = 0x01;
        /// The object lives on another node.
        const REMOTE = 0x02;
    }
}

bitflags! {
    /// Flags passed to object initialization.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ObjectConf: u32 {
        /// The object is being created, storage has nothing for it yet.
        const NEW = 0x01;
    }
}

/// State shared by every layer of one object.
#[derive(Debug)]
pub struct ObjectHeader {
    fid: Fid,
    refs: AtomicU32,
    attr: AtomicU32,
    dying: AtomicU32,
}

impl ObjectHeader {
    pub fn new(fid: Fid) -> Self {
        Self {
            fid,
            refs: AtomicU32::new(0),
            attr: AtomicU32::new(0),
            dying: AtomicU32::new(0),
        }
    }

    pub fn fid(&self) -> &Fid {
        &self.fid
    }

    /// Number of outstanding references handed out by the site.
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn get(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference and return how many remain.
    pub(crate) fn put(&self) -> u32 {
        self.refs.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn attr(&self) -> HeaderAttr {
        HeaderAttr::from_bits_truncate(self.attr.load(Ordering::Acquire))
    }

    pub fn set_attr(&self, attr: HeaderAttr) {
        self.attr.fetch_or(attr.bits(), Ordering::AcqRel);
    }

    pub fn is_remote(&self) -> bool {
        self.attr().contains(HeaderAttr::REMOTE)
    }

    /// The object is being destroyed and is evicted on its last release.
    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Acquire) != 0
    }

    pub fn set_dying(&self) {
        self.dying.store(1, Ordering::Release);
    }
}

/// The representation of an object at one device of the stack.
///
/// This is the basic capability group every layer provides. Metadata and
/// directory capabilities are exposed through [`ObjectLayer::md_ops`] and
/// [`ObjectLayer::dir_ops`].
pub trait ObjectLayer: Send + Sync + 'static {
    /// Name of the device this layer belongs to.
    fn device_name(&self) -> &str;

    /// Second phase of construction.
    ///
    /// Returns the layer of the device below, if this device stacks on one.
    fn init(
        &mut self,
        env: &mut Env,
        header: &ObjectHeader,
        conf: ObjectConf,
    ) -> Result<Option<Box<dyn ObjectLayer>>, ObjectError>;

    /// Finalize this layer. Called exactly once, top layer first.
    fn free(self: Box<Self>, header: &ObjectHeader);

    /// Write a one-line description of this layer.
    fn print(&self, header: &ObjectHeader, out: &mut dyn fmt::Write) -> fmt::Result;

    fn as_any(&self) -> &dyn Any;

    fn md_ops(&self) -> Option<&dyn MdObjectOps> {
        None
    }

    fn dir_ops(&self) -> Option<&dyn MdDirOps> {
        None
    }
}

/// An object with all of its layers, top layer at index 0.
pub struct LuObject {
    header: ObjectHeader,
    layers: Vec<Box<dyn ObjectLayer>>,
}

impl LuObject {
    /// Allocate the top layer through `dev`. The object is not initialized.
    pub fn alloc(env: &mut Env, dev: &dyn LuDevice, fid: Fid) -> Result<Self, ObjectError> {
        let header = ObjectHeader::new(fid);
        let top = dev.object_alloc(env, &header)?;
        trace!(fid = %fid, device = dev.name(), "Allocated top layer");
        Ok(Self {
            header,
            layers: vec![top],
        })
    }

    /// Initialize every layer top-down, appending lower layers as they are
    /// allocated.
    ///
    /// On failure the layers allocated so far stay attached and are freed with
    /// the object.
    pub fn init(&mut self, env: &mut Env, conf: ObjectConf) -> Result<(), ObjectError> {
        let mut idx = 0;
        while idx < self.layers.len() {
            if let Some(below) = self.layers[idx].init(env, &self.header, conf)? {
                trace!(fid = %self.header.fid, device = below.device_name(), "Stacked lower layer");
                self.layers.push(below);
            }
            idx += 1;
        }
        Ok(())
    }

    pub fn fid(&self) -> &Fid {
        &self.header.fid
    }

    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Layer at `idx`, counting from the top.
    pub fn layer(&self, idx: usize) -> Option<&dyn ObjectLayer> {
        self.layers.get(idx).map(|layer| &**layer)
    }

    /// First layer of concrete type `T`.
    pub fn find_layer<T: ObjectLayer>(&self) -> Option<&T> {
        self.layers
            .iter()
            .find_map(|layer| layer.as_any().downcast_ref::<T>())
    }

    /// Metadata operations of the topmost layer that provides them.
    pub fn md_ops(&self) -> Option<&dyn MdObjectOps> {
        self.layers.iter().find_map(|layer| layer.md_ops())
    }

    /// Directory operations of the topmost layer that provides them.
    pub fn dir_ops(&self) -> Option<&dyn MdDirOps> {
        self.layers.iter().find_map(|layer| layer.dir_ops())
    }

    /// Diagnostic description: the header followed by one line per layer.
    pub fn print(&self) -> String {
        let mut out = String::new();
        let _ = self.write_description(&mut out);
        out
    }

    fn write_description(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(
            out,
            "header@{:p}[refs={}, attr={:?}, dying={}] {}",
            &self.header,
            self.header.refs(),
            self.header.attr(),
            self.header.is_dying(),
            self.header.fid
        )?;
        for layer in &self.layers {
            out.write_str("    ")?;
            layer.print(&self.header, out)?;
            out.write_char('\n')?;
        }
        Ok(())
    }
}

impl fmt::Debug for LuObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LuObject")
            .field("fid", &self.header.fid)
            .field("refs", &self.header.refs())
            .field("layers", &self.layers.len())
            .finish()
    }
}

impl Drop for LuObject {
    /// Frees the layers top to bottom, then the header goes with the object.
    fn drop(&mut self) {
        debug!(fid = %self.header.fid, layers = self.layers.len(), "Freeing object");
        for layer in self.layers.drain(..) {
            layer.free(&self.header);
        }
    }
}
