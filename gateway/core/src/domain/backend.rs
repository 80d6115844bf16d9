// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Backend Trait - Anti-Corruption Layer for the distributed filesystem
//!
//! Every export is served by one [`Backend`]. The resolver and the lock
//! coordinator only ever see this trait, so the underlying namespace can be
//! a remote volume graph, a local directory or the in-memory backend used by
//! tests.
//!
//! Objects are handed out as reference-counted [`ObjectRef`]s. Holding one
//! keeps the backend's view of the object alive; dropping the last clone
//! releases it.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::file_handle::ObjectId;
use crate::domain::lock::{LockHolder, LockOwner, LockRange, LockRequest};

/// Caller identity used for backend permission checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub uid: u32,
    pub gid: u32,
    pub gids: Vec<u32>,
}

impl Principal {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            gids: Vec::new(),
        }
    }

    pub fn root() -> Self {
        Self::new(0, 0)
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    pub fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.gids.contains(&gid)
    }
}

/// Transport-level facts about one inbound RPC request.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub xid: u32,
    pub principal: Principal,
    /// Address the request arrived from; reverse callbacks dial back here.
    pub peer: SocketAddr,
}

impl RequestInfo {
    pub fn new(xid: u32, principal: Principal, peer: SocketAddr) -> Self {
        Self {
            xid,
            principal,
            peer,
        }
    }
}

/// Object type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FileType {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    BlockDevice,
    CharDevice,
    Socket,
    Fifo,
}

/// Major/minor pair of a device node (`specdata3`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceNumber {
    pub major: u32,
    pub minor: u32,
}

/// What MKNOD should create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialFile {
    Block(DeviceNumber),
    Char(DeviceNumber),
    Socket,
    Fifo,
}

impl SpecialFile {
    pub fn file_type(self) -> FileType {
        match self {
            SpecialFile::Block(_) => FileType::BlockDevice,
            SpecialFile::Char(_) => FileType::CharDevice,
            SpecialFile::Socket => FileType::Socket,
            SpecialFile::Fifo => FileType::Fifo,
        }
    }

    /// Device number; zero for sockets and FIFOs
    pub fn device(self) -> DeviceNumber {
        match self {
            SpecialFile::Block(dev) | SpecialFile::Char(dev) => dev,
            SpecialFile::Socket | SpecialFile::Fifo => DeviceNumber::default(),
        }
    }
}

/// Object attributes as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attrs {
    pub object_id: ObjectId,
    pub file_type: FileType,
    /// Permission bits (e.g. `0o755`)
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// Device number of block and character devices
    #[serde(default)]
    pub rdev: DeviceNumber,
    /// NFS `fileid3`
    pub fileid: u64,
    pub atime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
    pub ctime: DateTime<Utc>,
}

/// Permission mask bits for [`Attrs::permits`].
pub const ACCESS_READ: u32 = 0o4;
pub const ACCESS_WRITE: u32 = 0o2;
pub const ACCESS_EXECUTE: u32 = 0o1;

impl Attrs {
    /// POSIX owner/group/other permission check. Root is always allowed.
    pub fn permits(&self, principal: &Principal, mask: u32) -> bool {
        if principal.is_root() {
            return true;
        }
        let bits = if principal.uid == self.uid {
            (self.mode >> 6) & 0o7
        } else if principal.in_group(self.gid) {
            (self.mode >> 3) & 0o7
        } else {
            self.mode & 0o7
        };
        bits & mask == mask
    }

    pub fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }
}

/// Time value for SETATTR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetTime {
    ServerNow,
    Client(DateTime<Utc>),
}

/// Attributes a client asked to change. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttrs {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SetTime>,
    pub mtime: Option<SetTime>,
}

impl SetAttrs {
    pub fn is_empty(&self) -> bool {
        self == &SetAttrs::default()
    }
}

#[derive(Debug)]
struct ObjectInner {
    id: ObjectId,
    file_type: FileType,
}

/// Reference-counted handle on a live backend object.
#[derive(Debug, Clone)]
pub struct ObjectRef(Arc<ObjectInner>);

impl ObjectRef {
    pub fn new(id: ObjectId, file_type: FileType) -> Self {
        Self(Arc::new(ObjectInner { id, file_type }))
    }

    pub fn id(&self) -> ObjectId {
        self.0.id
    }

    pub fn file_type(&self) -> FileType {
        self.0.file_type
    }

    pub fn is_directory(&self) -> bool {
        self.0.file_type == FileType::Directory
    }

    /// Number of live references to this handle.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for ObjectRef {}

/// File open mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only access
    ReadOnly,
    /// Write-only access
    WriteOnly,
    /// Read-write access
    ReadWrite,
}

#[derive(Debug)]
struct DescriptorInner {
    id: u64,
    object: ObjectRef,
    mode: OpenMode,
}

/// An open backend descriptor. Byte-range locks are held through one.
#[derive(Debug, Clone)]
pub struct Descriptor(Arc<DescriptorInner>);

impl Descriptor {
    pub fn new(id: u64, object: ObjectRef, mode: OpenMode) -> Self {
        Self(Arc::new(DescriptorInner { id, object, mode }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn object(&self) -> &ObjectRef {
        &self.0.object
    }

    pub fn mode(&self) -> OpenMode {
        self.0.mode
    }
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Descriptor {}

/// How CREATE treats an existing name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Succeed and return the existing file.
    Unchecked,
    /// Fail with `Exists` if the name is taken.
    Guarded,
    /// Fail unless the existing file was created with the same verifier.
    Exclusive(u64),
}

/// NFSv3 `stable_how`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StableHow {
    Unstable,
    DataSync,
    FileSync,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    pub data: Bytes,
    pub eof: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub count: u32,
    pub committed: StableHow,
}

/// Directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub object_id: ObjectId,
    pub file_type: FileType,
    pub fileid: u64,
    /// Resume point for the next READDIR call
    pub cookie: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaddirPage {
    pub entries: Vec<DirEntry>,
    pub eof: bool,
}

/// Volume usage, as reported by `statvfs`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsStats {
    pub total_bytes: u64,
    pub free_bytes: u64,
    /// Free bytes available to unprivileged callers
    pub avail_bytes: u64,
    pub total_files: u64,
    pub free_files: u64,
    pub avail_files: u64,
}

/// Backend failure kinds, errno-style.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("No such file or directory")]
    NotFound,

    #[error("Stale object reference")]
    Stale,

    #[error("File exists")]
    Exists,

    #[error("Not a directory")]
    NotDirectory,

    #[error("Is a directory")]
    IsDirectory,

    #[error("Directory not empty")]
    NotEmpty,

    #[error("Access denied")]
    AccessDenied,

    #[error("Operation not permitted")]
    PermissionDenied,

    #[error("Read-only filesystem")]
    ReadOnly,

    #[error("No space left on device")]
    NoSpace,

    #[error("File too large")]
    FileTooLarge,

    #[error("File name too long")]
    NameTooLong,

    #[error("Invalid argument: {0}")]
    Invalid(String),

    #[error("Lock is held by another owner")]
    WouldBlock,

    #[error("No locks available")]
    NoLocks,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Backend error: {0}")]
    Other(String),
}

/// Asynchronous object operations of one backend mount.
///
/// Each call yields exactly one completion. Implementations never retry on
/// behalf of the caller.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Look up the mount's root directory
    ///
    /// # Returns
    /// * `Ok((ObjectRef, Attrs))` - Live root reference and its attributes
    /// * `Err(BackendError)` if the mount is unreachable
    async fn lookup_root(&self, principal: &Principal) -> Result<(ObjectRef, Attrs), BackendError>;

    /// Look up `name` inside directory `parent`
    ///
    /// # Arguments
    /// * `principal` - Caller identity
    /// * `parent` - Directory to search
    /// * `name` - Single path component (`.` and `..` are honoured)
    ///
    /// # Returns
    /// * `Ok((ObjectRef, Attrs))` - The child
    /// * `Err(BackendError::NotFound)` if no such entry exists
    async fn lookup_by_name(
        &self,
        principal: &Principal,
        parent: &ObjectRef,
        name: &str,
    ) -> Result<(ObjectRef, Attrs), BackendError>;

    /// Locate an object purely by its durable id
    ///
    /// # Arguments
    /// * `principal` - Caller identity
    /// * `root` - Root of the export the id belongs to
    /// * `id` - Object id carried by a file handle
    ///
    /// # Returns
    /// * `Ok((ObjectRef, Attrs))` - The object
    /// * `Err(BackendError::Stale)` if the object no longer exists
    async fn lookup_by_id(
        &self,
        principal: &Principal,
        root: &ObjectRef,
        id: ObjectId,
    ) -> Result<(ObjectRef, Attrs), BackendError>;

    /// Fetch current attributes
    async fn stat(&self, principal: &Principal, object: &ObjectRef) -> Result<Attrs, BackendError>;

    /// Change attributes, returning the post-operation attributes
    async fn setattr(
        &self,
        principal: &Principal,
        object: &ObjectRef,
        attrs: &SetAttrs,
    ) -> Result<Attrs, BackendError>;

    /// Open a descriptor for lock operations
    async fn open(
        &self,
        principal: &Principal,
        object: &ObjectRef,
        mode: OpenMode,
    ) -> Result<Descriptor, BackendError>;

    /// Release a descriptor. Every lock still held through it is dropped.
    fn close(&self, fd: &Descriptor);

    /// Acquire a byte-range lock
    ///
    /// # Arguments
    /// * `fd` - Descriptor the lock is held through
    /// * `request` - Owner, range and kind
    /// * `blocking` - Wait for conflicting holders instead of failing
    ///
    /// # Returns
    /// * `Ok(())` once the lock is held
    /// * `Err(BackendError::WouldBlock)` for a non-blocking request that conflicts
    ///
    /// Dropping the future of a blocking request abandons the wait.
    async fn lock(
        &self,
        fd: &Descriptor,
        request: &LockRequest,
        blocking: bool,
    ) -> Result<(), BackendError>;

    /// Report the first lock that would block `request`, if any
    async fn test_lock(
        &self,
        fd: &Descriptor,
        request: &LockRequest,
    ) -> Result<Option<LockHolder>, BackendError>;

    /// Release `range` for `owner`. Unlocking an unheld range succeeds.
    async fn unlock(
        &self,
        fd: &Descriptor,
        owner: &LockOwner,
        range: LockRange,
    ) -> Result<(), BackendError>;

    async fn read(
        &self,
        principal: &Principal,
        object: &ObjectRef,
        offset: u64,
        count: u32,
    ) -> Result<ReadOutcome, BackendError>;

    async fn write(
        &self,
        principal: &Principal,
        object: &ObjectRef,
        offset: u64,
        data: &[u8],
        stable: StableHow,
    ) -> Result<WriteOutcome, BackendError>;

    /// Flush previously written data to stable storage
    async fn fsync(&self, principal: &Principal, object: &ObjectRef) -> Result<(), BackendError>;

    async fn create(
        &self,
        principal: &Principal,
        parent: &ObjectRef,
        name: &str,
        mode: CreateMode,
        perm: u32,
    ) -> Result<(ObjectRef, Attrs), BackendError>;

    async fn mkdir(
        &self,
        principal: &Principal,
        parent: &ObjectRef,
        name: &str,
        perm: u32,
    ) -> Result<(ObjectRef, Attrs), BackendError>;

    async fn symlink(
        &self,
        principal: &Principal,
        parent: &ObjectRef,
        name: &str,
        target: &str,
    ) -> Result<(ObjectRef, Attrs), BackendError>;

    async fn readlink(&self, principal: &Principal, object: &ObjectRef)
        -> Result<String, BackendError>;

    /// Create a device node, socket or FIFO
    async fn mknod(
        &self,
        principal: &Principal,
        parent: &ObjectRef,
        name: &str,
        kind: SpecialFile,
        perm: u32,
    ) -> Result<(ObjectRef, Attrs), BackendError>;

    /// Usage of the volume `object` lives on
    async fn statfs(&self, principal: &Principal, object: &ObjectRef)
        -> Result<FsStats, BackendError>;

    /// Unlink a non-directory entry
    async fn remove(
        &self,
        principal: &Principal,
        parent: &ObjectRef,
        name: &str,
    ) -> Result<(), BackendError>;

    /// Remove an empty directory
    async fn rmdir(
        &self,
        principal: &Principal,
        parent: &ObjectRef,
        name: &str,
    ) -> Result<(), BackendError>;

    async fn rename(
        &self,
        principal: &Principal,
        from_parent: &ObjectRef,
        from_name: &str,
        to_parent: &ObjectRef,
        to_name: &str,
    ) -> Result<(), BackendError>;

    /// Add a hard link `name` in `parent` pointing at `object`
    async fn link(
        &self,
        principal: &Principal,
        object: &ObjectRef,
        parent: &ObjectRef,
        name: &str,
    ) -> Result<Attrs, BackendError>;

    /// List a directory starting after `cookie` (0 = from the beginning)
    ///
    /// `.` and `..` are returned as ordinary entries.
    async fn readdir(
        &self,
        principal: &Principal,
        dir: &ObjectRef,
        cookie: u64,
        max_entries: usize,
    ) -> Result<ReaddirPage, BackendError>;
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => BackendError::NotFound,
            std::io::ErrorKind::AlreadyExists => BackendError::Exists,
            std::io::ErrorKind::PermissionDenied => BackendError::AccessDenied,
            std::io::ErrorKind::InvalidInput => BackendError::Invalid(err.to_string()),
            _ => BackendError::Io(err.to_string()),
        }
    }
}
