//! Distributed lock manager, server side.
//!
//! Locks are granted on [`Resource`]s, one per object, in a [`Namespace`].
//! Granted extent locks live in one [`IntervalTree`] per [`LockMode`]. The
//! namespace owner plugs its behavior in through two hooks:
//!
//! - an [`IntentPolicy`], run for requests carrying an intent instead of the
//!   plain extent policy
//! - [`LvbOps`], which fill and refresh each resource's value block
//!
//! Clients are represented by [`Export`]s. A client that listens for
//! asynchronous callbacks supplies [`ClientCallbacks`]; [`ClientGlimpse`]
//! relays a server glimpse to it.

mod interval;
mod lock;
mod namespace;
mod resource;

pub use interval::IntervalTree;
pub use lock::Lock;
pub use namespace::{
    ClientGlimpse, EnqueueReply, EnqueueRequest, EnqueueStatus, GlimpseAst, IntentDisposition,
    IntentPolicy, LockReply, LvbOps, Namespace,
};
pub use resource::{Resource, ResourceInner, process_extent};

use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;

use crate::attr::LuAttr;
use crate::error::LockError;

/// Lock modes, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockMode {
    /// Exclusive.
    Ex,
    /// Protected write.
    Pw,
    /// Protected read.
    Pr,
    /// Concurrent write.
    Cw,
    /// Concurrent read.
    Cr,
    /// Null, for holding a reference only.
    Nl,
    /// Group lock, compatible with itself only.
    Group,
}

impl LockMode {
    pub const COUNT: usize = 7;

    pub const ALL: [LockMode; Self::COUNT] = [
        Self::Ex,
        Self::Pw,
        Self::Pr,
        Self::Cw,
        Self::Cr,
        Self::Nl,
        Self::Group,
    ];

    /// Position of the mode in [`LockMode::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    const fn bit(self) -> u8 {
        1 << self as u8
    }

    const fn compat_mask(self) -> u8 {
        const EX: u8 = LockMode::Ex.bit();
        const PW: u8 = LockMode::Pw.bit();
        const PR: u8 = LockMode::Pr.bit();
        const CW: u8 = LockMode::Cw.bit();
        const CR: u8 = LockMode::Cr.bit();
        const NL: u8 = LockMode::Nl.bit();
        const GROUP: u8 = LockMode::Group.bit();

        match self {
            Self::Ex => NL,
            Self::Pw => NL | CR,
            Self::Pr => NL | CR | PR,
            Self::Cw => NL | CR | CW,
            Self::Cr => NL | CR | PR | PW | CW,
            Self::Nl => EX | PW | PR | CW | CR | NL | GROUP,
            Self::Group => NL | GROUP,
        }
    }

    /// Whether locks of the two modes may be granted on overlapping extents.
    pub fn compatible(self, other: LockMode) -> bool {
        self.compat_mask() & other.bit() != 0
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ex => "EX",
            Self::Pw => "PW",
            Self::Pr => "PR",
            Self::Cw => "CW",
            Self::Cr => "CR",
            Self::Nl => "NL",
            Self::Group => "GROUP",
        })
    }
}

bitflags! {
    /// Lock request and lock state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LockFlags: u32 {
        /// Fail instead of waiting for conflicting locks.
        const BLOCK_NOWAIT = 0x0000_0002;
        /// The request carries an intent for the namespace policy.
        const HAS_INTENT = 0x0000_1000;
        /// The lock has been cancelled or aborted.
        const DESTROYED = 0x0004_0000;
    }
}

/// Inclusive byte range covered by an extent lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Extent {
    pub start: u64,
    pub end: u64,
}

impl Extent {
    /// The whole object.
    pub const WHOLE: Extent = Extent {
        start: 0,
        end: u64::MAX,
    };

    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn overlaps(&self, other: &Extent) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.end == u64::MAX {
            write!(f, "[{}->EOF]", self.start)
        } else {
            write!(f, "[{}->{}]", self.start, self.end)
        }
    }
}

/// Value block: the authoritative size and times of an object, cached on
/// its lock resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lvb {
    pub size: u64,
    pub mtime: i64,
    pub atime: i64,
    pub ctime: i64,
    pub blocks: u64,
}

impl Lvb {
    pub fn from_attr(attr: &LuAttr) -> Self {
        Self {
            size: attr.size,
            mtime: attr.mtime,
            atime: attr.atime,
            ctime: attr.ctime,
            blocks: attr.blocks,
        }
    }

    /// Merge `new` into this block.
    ///
    /// Times never move backwards. Size and blocks only grow when
    /// `increase_only` is set and are replaced otherwise.
    pub fn merge(&mut self, new: &Lvb, increase_only: bool) {
        if new.size > self.size || !increase_only {
            self.size = new.size;
        }
        if new.blocks > self.blocks || !increase_only {
            self.blocks = new.blocks;
        }
        self.mtime = self.mtime.max(new.mtime);
        self.atime = self.atime.max(new.atime);
        self.ctime = self.ctime.max(new.ctime);
    }
}

/// Callbacks a client accepts from the server.
pub trait ClientCallbacks: Send + Sync {
    /// Ask the holder of `lock` for its view of the object.
    fn glimpse(&self, lock: &Lock) -> Result<Lvb, LockError>;
}

/// Server-side handle of one connected client.
pub struct Export {
    id: u64,
    client_uuid: String,
    callback_capable: bool,
    callbacks: Option<Arc<dyn ClientCallbacks>>,
}

impl Export {
    /// A client that accepts callbacks but has not supplied a channel yet.
    pub fn new(id: u64, client_uuid: impl Into<String>) -> Self {
        Self {
            id,
            client_uuid: client_uuid.into(),
            callback_capable: true,
            callbacks: None,
        }
    }

    #[must_use]
    pub fn with_callbacks(mut self, callbacks: Arc<dyn ClientCallbacks>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    /// Mark the client as doing synchronous I/O without a callback listener.
    #[must_use]
    pub fn without_callbacks(mut self) -> Self {
        self.callback_capable = false;
        self.callbacks = None;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client_uuid(&self) -> &str {
        &self.client_uuid
    }

    pub fn callback_capable(&self) -> bool {
        self.callback_capable
    }

    pub fn callbacks(&self) -> Option<&Arc<dyn ClientCallbacks>> {
        self.callbacks.as_ref()
    }
}

impl fmt::Debug for Export {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Export")
            .field("id", &self.id)
            .field("client_uuid", &self.client_uuid)
            .field("callback_capable", &self.callback_capable)
            .field("has_callbacks", &self.callbacks.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatibility_matrix() {
        use LockMode::{Cr, Cw, Ex, Group, Nl, Pr, Pw};

        assert!(Pr.compatible(Pr));
        assert!(!Pr.compatible(Pw));
        assert!(!Pw.compatible(Pw));
        assert!(Pw.compatible(Cr));
        assert!(Cw.compatible(Cw));
        assert!(!Cw.compatible(Pr));
        assert!(!Ex.compatible(Cr));
        assert!(Group.compatible(Group));
        assert!(!Group.compatible(Pr));

        // The matrix is symmetric and NL is compatible with everything.
        for a in LockMode::ALL {
            assert!(a.compatible(Nl));
            for b in LockMode::ALL {
                assert_eq!(a.compatible(b), b.compatible(a), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_mode_index_matches_all() {
        for (idx, mode) in LockMode::ALL.iter().enumerate() {
            assert_eq!(mode.index(), idx);
        }
    }

    #[test]
    fn test_extent_overlap() {
        let a = Extent::new(0, 99);
        assert!(a.overlaps(&Extent::new(99, 200)));
        assert!(!a.overlaps(&Extent::new(100, 200)));
        assert!(Extent::WHOLE.overlaps(&Extent::new(u64::MAX, u64::MAX)));
        assert_eq!(Extent::new(5, u64::MAX).to_string(), "[5->EOF]");
    }

    #[test]
    fn test_lvb_merge() {
        let mut lvb = Lvb {
            size: 100,
            mtime: 10,
            blocks: 8,
            ..Lvb::default()
        };

        lvb.merge(
            &Lvb {
                size: 50,
                mtime: 5,
                blocks: 1,
                ..Lvb::default()
            },
            true,
        );
        assert_eq!((lvb.size, lvb.mtime, lvb.blocks), (100, 10, 8));

        lvb.merge(
            &Lvb {
                size: 50,
                mtime: 5,
                blocks: 1,
                ..Lvb::default()
            },
            false,
        );
        assert_eq!((lvb.size, lvb.mtime, lvb.blocks), (50, 10, 1));
    }

    #[test]
    fn test_export_without_callbacks() {
        let export = Export::new(4, "client-uuid").without_callbacks();
        assert!(!export.callback_capable());
        assert!(export.callbacks().is_none());
        assert_eq!(export.client_uuid(), "client-uuid");
    }
}
