// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! File Handle Value Objects
//!
//! A [`FileHandle`] names exactly one backend object inside exactly one
//! export. Clients hold the encoded form and treat it as opaque; the wire
//! layout lives in `infrastructure::nfs::file_handle`.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Export and object identity carried inside every handle

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Namespace for export ids derived from export names.
const EXPORT_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6e, 0x66, 0x73, 0x33, 0x67, 0x77, 0x40, 0x00, 0x80, 0x00, 0x65, 0x78, 0x70, 0x6f, 0x72, 0x74,
]);

/// Export identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExportId(pub Uuid);

impl ExportId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Derive a stable id from the export name so issued handles survive
    /// restarts when the operator never pinned an explicit id.
    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&EXPORT_NAMESPACE, name.as_bytes()))
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for ExportId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend object identity (a gfid-style 128-bit id).
///
/// The all-zero id with a trailing `1` byte is reserved for the root of
/// every export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub Uuid);

impl ObjectId {
    pub const ROOT: ObjectId = ObjectId(Uuid::from_bytes([
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1,
    ]));

    /// Fileid reported for the export root and its synthesized `.`/`..`.
    pub const ROOT_FILEID: u64 = 1;

    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }

    /// NFS `fileid3` for this object: the low 64 bits of the id, with the
    /// root pinned to [`Self::ROOT_FILEID`].
    pub fn fileid(&self) -> u64 {
        if self.is_root() {
            return Self::ROOT_FILEID;
        }
        let bytes = self.0.as_bytes();
        let mut low = [0u8; 8];
        low.copy_from_slice(&bytes[8..16]);
        u64::from_be_bytes(low)
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct HandleFlags(pub u8);

impl HandleFlags {
    pub const NONE: HandleFlags = HandleFlags(0);
    /// Handle was minted for an export root.
    pub const ROOT: HandleFlags = HandleFlags(0x01);
    /// Handle refers to a directory.
    pub const DIRECTORY: HandleFlags = HandleFlags(0x02);

    pub fn contains(&self, other: HandleFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for HandleFlags {
    type Output = HandleFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        HandleFlags(self.0 | rhs.0)
    }
}

/// Decoded file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle {
    pub export_id: ExportId,
    pub object_id: ObjectId,
    pub flags: HandleFlags,
}

impl FileHandle {
    pub fn new(export_id: ExportId, object_id: ObjectId, flags: HandleFlags) -> Self {
        Self {
            export_id,
            object_id,
            flags,
        }
    }

    /// Handle for the root directory of `export_id`.
    pub fn root(export_id: ExportId) -> Self {
        Self::new(
            export_id,
            ObjectId::ROOT,
            HandleFlags::ROOT | HandleFlags::DIRECTORY,
        )
    }

    /// Handle for an object living in the same export as `self`.
    pub fn child(&self, object_id: ObjectId, is_directory: bool) -> Self {
        if object_id.is_root() {
            return Self::root(self.export_id);
        }
        let flags = if is_directory {
            HandleFlags::DIRECTORY
        } else {
            HandleFlags::NONE
        };
        Self::new(self.export_id, object_id, flags)
    }

    pub fn is_root(&self) -> bool {
        self.object_id.is_root()
    }
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.export_id, self.object_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_marker() {
        let export = ExportId::new();
        let root = FileHandle::root(export);
        assert!(root.is_root());
        assert_eq!(root.object_id.as_bytes()[15], 1);
        assert!(root.object_id.as_bytes()[..15].iter().all(|b| *b == 0));
        assert!(!root.child(ObjectId::new(), false).is_root());
    }

    #[test]
    fn test_root_fileid_is_one() {
        assert_eq!(ObjectId::ROOT.fileid(), 1);
    }

    #[test]
    fn test_export_id_from_name_is_stable() {
        assert_eq!(ExportId::from_name("vol0"), ExportId::from_name("vol0"));
        assert_ne!(ExportId::from_name("vol0"), ExportId::from_name("vol1"));
    }

    #[test]
    fn test_child_of_root_id_is_root_handle() {
        let export = ExportId::new();
        let fh = FileHandle::new(export, ObjectId::new(), HandleFlags::NONE);
        let root = fh.child(ObjectId::ROOT, true);
        assert_eq!(root, FileHandle::root(export));
    }

    #[test]
    fn test_flags() {
        let flags = HandleFlags::ROOT | HandleFlags::DIRECTORY;
        assert!(flags.contains(HandleFlags::ROOT));
        assert!(flags.contains(HandleFlags::DIRECTORY));
        assert!(!HandleFlags::NONE.contains(HandleFlags::ROOT));
    }
}
