//! Change flag decoding
//!
//! The bit layout follows macOS FSEvents so a platform mask can be carried
//! through untouched. Backends that synthesize flags (inotify, ReadDirectoryChangesW)
//! map their native kinds onto the same bits.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Decoded facets of a single change notification
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ChangeFlags: u32 {
        // Stream facets
        const MUST_SCAN_SUB_DIRS = 0x0000_0001;
        const USER_DROPPED = 0x0000_0002;
        const KERNEL_DROPPED = 0x0000_0004;
        const EVENT_IDS_WRAPPED = 0x0000_0008;
        const HISTORY_DONE = 0x0000_0010;
        const ROOT_CHANGED = 0x0000_0020;
        const MOUNT = 0x0000_0040;
        const UNMOUNT = 0x0000_0080;

        // Action facets
        const CREATED = 0x0000_0100;
        const REMOVED = 0x0000_0200;
        const RENAMED = 0x0000_0800;
        const MODIFIED = 0x0000_1000;

        // Metadata facets
        const INODE_META_MOD = 0x0000_0400;
        const FINDER_INFO_MOD = 0x0000_2000;
        const CHANGE_OWNER = 0x0000_4000;
        const XATTR_MOD = 0x0000_8000;

        // Type facets
        const IS_FILE = 0x0001_0000;
        const IS_DIR = 0x0002_0000;
        const IS_SYMLINK = 0x0004_0000;

        const OWN_EVENT = 0x0008_0000;
        const IS_HARDLINK = 0x0010_0000;
        const IS_LAST_HARDLINK = 0x0020_0000;
        const CLONED = 0x0040_0000;
    }
}

/// Rendering order for [`ChangeFlags::describe`]: type, action, metadata, stream.
const FACETS: &[(ChangeFlags, &str)] = &[
    (ChangeFlags::IS_FILE, "isFile"),
    (ChangeFlags::IS_DIR, "isDirectory"),
    (ChangeFlags::IS_SYMLINK, "isSymlink"),
    (ChangeFlags::IS_HARDLINK, "isHardlink"),
    (ChangeFlags::IS_LAST_HARDLINK, "isLastHardlink"),
    (ChangeFlags::CREATED, "created"),
    (ChangeFlags::MODIFIED, "modified"),
    (ChangeFlags::REMOVED, "removed"),
    (ChangeFlags::RENAMED, "renamed"),
    (ChangeFlags::CLONED, "cloned"),
    (ChangeFlags::INODE_META_MOD, "inodeMetaMod"),
    (ChangeFlags::FINDER_INFO_MOD, "finderInfoMod"),
    (ChangeFlags::CHANGE_OWNER, "changeOwner"),
    (ChangeFlags::XATTR_MOD, "xattrMod"),
    (ChangeFlags::MUST_SCAN_SUB_DIRS, "mustScanSubDirs"),
    (ChangeFlags::USER_DROPPED, "userDropped"),
    (ChangeFlags::KERNEL_DROPPED, "kernelDropped"),
    (ChangeFlags::EVENT_IDS_WRAPPED, "eventIdsWrapped"),
    (ChangeFlags::HISTORY_DONE, "historyDone"),
    (ChangeFlags::ROOT_CHANGED, "rootChanged"),
    (ChangeFlags::MOUNT, "mount"),
    (ChangeFlags::UNMOUNT, "unmount"),
    (ChangeFlags::OWN_EVENT, "ownEvent"),
];

impl ChangeFlags {
    /// Decode a raw platform mask. Unknown bits are kept.
    pub const fn from_raw(raw: u32) -> Self {
        Self::from_bits_retain(raw)
    }

    /// The raw mask, including bits without a name
    pub const fn raw(&self) -> u32 {
        self.bits()
    }

    /// Names of the active facets in rendering order
    pub fn facet_names(&self) -> Vec<&'static str> {
        FACETS
            .iter()
            .filter(|(facet, _)| self.contains(*facet))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Comma-joined facet names, `"none"` when nothing named is set
    pub fn describe(&self) -> String {
        let names = self.facet_names();
        if names.is_empty() {
            "none".to_string()
        } else {
            names.join(", ")
        }
    }

    pub fn is_file(&self) -> bool {
        self.contains(Self::IS_FILE)
    }

    pub fn is_dir(&self) -> bool {
        self.contains(Self::IS_DIR)
    }

    pub fn is_symlink(&self) -> bool {
        self.contains(Self::IS_SYMLINK)
    }

    pub fn is_created(&self) -> bool {
        self.contains(Self::CREATED)
    }

    pub fn is_removed(&self) -> bool {
        self.contains(Self::REMOVED)
    }

    pub fn is_renamed(&self) -> bool {
        self.contains(Self::RENAMED)
    }

    pub fn is_modified(&self) -> bool {
        self.contains(Self::MODIFIED)
    }

    /// Any ownership, inode, Finder info or xattr change
    pub fn is_metadata_change(&self) -> bool {
        self.intersects(
            Self::INODE_META_MOD | Self::FINDER_INFO_MOD | Self::CHANGE_OWNER | Self::XATTR_MOD,
        )
    }

    /// The producer lost events and the consumer should rescan the tree
    pub fn needs_rescan(&self) -> bool {
        self.intersects(Self::MUST_SCAN_SUB_DIRS | Self::USER_DROPPED | Self::KERNEL_DROPPED)
    }
}

impl std::fmt::Display for ChangeFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}
