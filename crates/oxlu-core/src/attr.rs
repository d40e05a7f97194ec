//! Attribute records and reply translation.
//!
//! A remote reply only ever touches the fields it marks valid. Timestamps are
//! monotonic: ctime moves forward only, and mtime moves only together with a
//! ctime that is not older than the one already held.

use bitflags::bitflags;

use crate::fid::Fid;

bitflags! {
    /// Which fields of a reply body carry meaningful values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AttrValid: u64 {
        const ID = 0x0000_0001;
        const ATIME = 0x0000_0002;
        const MTIME = 0x0000_0004;
        const CTIME = 0x0000_0008;
        const SIZE = 0x0000_0010;
        const BLOCKS = 0x0000_0020;
        const BLKSZ = 0x0000_0040;
        const MODE = 0x0000_0080;
        const TYPE = 0x0000_0100;
        const UID = 0x0000_0200;
        const GID = 0x0000_0400;
        const FLAGS = 0x0000_0800;
        const NLINK = 0x0000_2000;
        const GENERATION = 0x0000_4000;
        const RDEV = 0x0001_0000;
    }
}

bitflags! {
    /// Which parts of an [`MdAttr`] are populated.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MaValid: u32 {
        const INODE = 0x01;
    }
}

/// In-memory attributes of one object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LuAttr {
    pub size: u64,
    pub mtime: i64,
    pub atime: i64,
    pub ctime: i64,
    pub blocks: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub flags: u32,
    pub nlink: u32,
    pub rdev: u32,
}

impl LuAttr {
    /// Merge the valid fields of a reply body into this record.
    pub fn merge_body(&mut self, body: &MdtBody) {
        let valid = body.valid;

        if valid.contains(AttrValid::CTIME) && body.ctime >= self.ctime {
            self.ctime = body.ctime;
            if valid.contains(AttrValid::MTIME) {
                self.mtime = body.mtime;
            }
        }

        if valid.contains(AttrValid::MODE) {
            self.mode = body.mode;
        }
        if valid.contains(AttrValid::SIZE) {
            self.size = body.size;
        }
        if valid.contains(AttrValid::BLOCKS) {
            self.blocks = body.blocks;
        }
        if valid.contains(AttrValid::UID) {
            self.uid = body.uid;
        }
        if valid.contains(AttrValid::GID) {
            self.gid = body.gid;
        }
        if valid.contains(AttrValid::FLAGS) {
            self.flags = body.flags;
        }
        if valid.contains(AttrValid::NLINK) {
            self.nlink = body.nlink;
        }
        if valid.contains(AttrValid::RDEV) {
            self.rdev = body.rdev;
        }
    }
}

/// Attributes handed through the metadata operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MdAttr {
    pub attr: LuAttr,
    pub valid: MaValid,
    /// Fields the caller would like filled. The proxy always asks for a fixed
    /// set, so this is advisory.
    pub need: AttrValid,
}

impl MdAttr {
    pub fn new(attr: LuAttr) -> Self {
        Self {
            attr,
            ..Self::default()
        }
    }

    /// Apply a reply body and mark the inode part as populated.
    pub fn update_from_body(&mut self, body: &MdtBody) {
        self.attr.merge_body(body);
        self.valid = MaValid::INODE;
    }
}

/// Attribute body carried by a metadata reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MdtBody {
    pub fid1: Fid,
    pub valid: AttrValid,
    pub size: u64,
    pub mtime: i64,
    pub atime: i64,
    pub ctime: i64,
    pub blocks: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub flags: u32,
    pub nlink: u32,
    pub rdev: u32,
}

impl MdtBody {
    /// Build a body that reports every field of `attr` as valid.
    pub fn from_attr(fid: Fid, attr: &LuAttr) -> Self {
        Self {
            fid1: fid,
            valid: AttrValid::all(),
            size: attr.size,
            mtime: attr.mtime,
            atime: attr.atime,
            ctime: attr.ctime,
            blocks: attr.blocks,
            mode: attr.mode,
            uid: attr.uid,
            gid: attr.gid,
            flags: attr.flags,
            nlink: attr.nlink,
            rdev: attr.rdev,
        }
    }
}


/// Property-based tests for the merge rule.
#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_attr() -> impl Strategy<Value = LuAttr> {
        (
            any::<u64>(),
            any::<i64>(),
            any::<i64>(),
            any::<u32>(),
            any::<u32>(),
            any::<u32>(),
            any::<u32>(),
        )
            .prop_map(|(size, mtime, ctime, mode, uid, gid, nlink)| LuAttr {
                size,
                mtime,
                atime: 0,
                ctime,
                blocks: size / 512,
                mode,
                uid,
                gid,
                flags: 0,
                nlink,
                rdev: 0,
            })
    }

    proptest! {
        /// A field changes only when its valid bit is set.
        #[test]
        fn fields_change_only_when_marked(
            before in arb_attr(),
            reply in arb_attr(),
            bits in any::<u64>(),
        ) {
            let valid = AttrValid::from_bits_truncate(bits);
            let mut body = MdtBody::from_attr(Fid::new(1, 2, 0), &reply);
            body.valid = valid;

            let mut after = before;
            after.merge_body(&body);

            if !valid.contains(AttrValid::MODE) { prop_assert_eq!(after.mode, before.mode); }
            if !valid.contains(AttrValid::SIZE) { prop_assert_eq!(after.size, before.size); }
            if !valid.contains(AttrValid::UID) { prop_assert_eq!(after.uid, before.uid); }
            if !valid.contains(AttrValid::GID) { prop_assert_eq!(after.gid, before.gid); }
            if !valid.contains(AttrValid::NLINK) { prop_assert_eq!(after.nlink, before.nlink); }
            if !valid.contains(AttrValid::BLOCKS) { prop_assert_eq!(after.blocks, before.blocks); }
            if valid.contains(AttrValid::MODE) { prop_assert_eq!(after.mode, reply.mode); }
            if valid.contains(AttrValid::SIZE) { prop_assert_eq!(after.size, reply.size); }
            prop_assert_eq!(after.atime, before.atime);
        }

        /// ctime never goes backwards, and mtime only moves with it.
        #[test]
        fn ctime_is_monotonic(before in arb_attr(), reply in arb_attr(), bits in any::<u64>()) {
            let mut body = MdtBody::from_attr(Fid::new(1, 2, 0), &reply);
            body.valid = AttrValid::from_bits_truncate(bits);

            let mut after = before;
            after.merge_body(&body);

            prop_assert!(after.ctime >= before.ctime);
            if after.ctime == before.ctime && reply.ctime != before.ctime {
                prop_assert_eq!(after.mtime, before.mtime);
            }
        }
    }
}
