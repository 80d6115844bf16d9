// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-Memory Backend
//!
//! Volatile, single-process implementation of [`Backend`] for development
//! and testing. It keeps a full directory tree keyed by gfid-style object
//! ids, so lookup-by-id is a map lookup, and implements POSIX-style advisory
//! byte-range locks with real blocking waits.
//!
//! **Lock semantics:**
//! - Locks of the same owner never conflict; a new lock replaces the
//!   owner's overlapping ranges.
//! - Unlock splits ranges.
//! - Closing a descriptor drops every lock held through it.
//! - Blocked waiters are woken on every unlock or close and retry.
//!
//! Files are capped at [`MAX_FILE_SIZE`]; writes or truncations past it fail
//! with `FileTooLarge` before anything is allocated.
//!
//! **Use Cases:**
//! - ✅ Unit/integration testing of the resolver and lock coordinator
//! - ✅ Local experiments without a cluster
//! - ❌ Anything that must survive a restart

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{watch, Notify};
use tracing::debug;

use crate::domain::backend::{
    Attrs, Backend, BackendError, CreateMode, Descriptor, DeviceNumber, DirEntry, FileType,
    FsStats, ObjectRef, OpenMode, Principal, ReadOutcome, ReaddirPage, SetAttrs, SetTime,
    SpecialFile, StableHow, WriteOutcome, ACCESS_EXECUTE, ACCESS_READ, ACCESS_WRITE,
};
use crate::domain::file_handle::ObjectId;
use crate::domain::lock::{LockHolder, LockKind, LockOwner, LockRange, LockRequest};

const MAX_NAME_LEN: usize = 255;

/// Largest file the backend will hold, in bytes
pub const MAX_FILE_SIZE: u64 = 1 << 32;

/// Nominal volume size reported by `statfs`
const CAPACITY_BYTES: u64 = 1 << 40;
const CAPACITY_FILES: u64 = 1 << 20;

/// Snapshot of lookup and lock call counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendCallCounts {
    pub lookup_root: usize,
    pub lookup_by_name: usize,
    pub lookup_by_id: usize,
    pub lock: usize,
}

#[derive(Default)]
struct CallCounters {
    lookup_root: AtomicUsize,
    lookup_by_name: AtomicUsize,
    lookup_by_id: AtomicUsize,
    lock: AtomicUsize,
}

enum Content {
    File(Vec<u8>),
    Directory(BTreeMap<String, ObjectId>),
    Symlink(String),
    Special(DeviceNumber),
}

struct Node {
    attrs: Attrs,
    parent: ObjectId,
    content: Content,
    verifier: Option<u64>,
}

impl Node {
    fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.attrs.object_id, self.attrs.file_type)
    }

    fn entries(&self) -> Result<&BTreeMap<String, ObjectId>, BackendError> {
        match &self.content {
            Content::Directory(entries) => Ok(entries),
            _ => Err(BackendError::NotDirectory),
        }
    }

    fn touch(&mut self) {
        let now = Utc::now();
        self.attrs.mtime = now;
        self.attrs.ctime = now;
    }
}

struct Namespace {
    nodes: HashMap<ObjectId, Node>,
}

impl Namespace {
    fn node(&self, id: ObjectId) -> Result<&Node, BackendError> {
        self.nodes.get(&id).ok_or(BackendError::Stale)
    }

    fn node_mut(&mut self, id: ObjectId) -> Result<&mut Node, BackendError> {
        self.nodes.get_mut(&id).ok_or(BackendError::Stale)
    }

    /// Directory node the caller may modify
    fn writable_dir(&self, id: ObjectId, principal: &Principal) -> Result<&Node, BackendError> {
        let dir = self.node(id)?;
        dir.entries()?;
        if !dir.attrs.permits(principal, ACCESS_WRITE | ACCESS_EXECUTE) {
            return Err(BackendError::AccessDenied);
        }
        Ok(dir)
    }

    fn child(&self, parent: ObjectId, name: &str) -> Result<ObjectId, BackendError> {
        self.node(parent)?
            .entries()?
            .get(name)
            .copied()
            .ok_or(BackendError::NotFound)
    }

    fn insert_child(
        &mut self,
        parent: ObjectId,
        name: &str,
        node: Node,
    ) -> Result<(), BackendError> {
        let id = node.attrs.object_id;
        let is_dir = node.attrs.is_directory();
        let dir = self.node_mut(parent)?;
        match &mut dir.content {
            Content::Directory(entries) => {
                entries.insert(name.to_string(), id);
            }
            _ => return Err(BackendError::NotDirectory),
        }
        if is_dir {
            dir.attrs.nlink += 1;
        }
        dir.touch();
        self.nodes.insert(id, node);
        Ok(())
    }

    fn detach_child(&mut self, parent: ObjectId, name: &str) -> Result<ObjectId, BackendError> {
        let dir = self.node_mut(parent)?;
        let id = match &mut dir.content {
            Content::Directory(entries) => entries.remove(name).ok_or(BackendError::NotFound)?,
            _ => return Err(BackendError::NotDirectory),
        };
        dir.touch();
        Ok(id)
    }

    /// Drop one link to `id`, removing the node once nothing refers to it
    fn release_link(&mut self, id: ObjectId) {
        let remove = match self.nodes.get_mut(&id) {
            Some(node) if node.attrs.is_directory() => true,
            Some(node) => {
                node.attrs.nlink = node.attrs.nlink.saturating_sub(1);
                node.attrs.ctime = Utc::now();
                node.attrs.nlink == 0
            }
            None => false,
        };
        if remove {
            self.nodes.remove(&id);
        }
    }

    fn is_ancestor(&self, candidate: ObjectId, mut id: ObjectId) -> bool {
        loop {
            if id == candidate {
                return true;
            }
            match self.nodes.get(&id) {
                Some(node) if node.parent != id => id = node.parent,
                _ => return false,
            }
        }
    }
}

#[derive(Debug, Clone)]
struct HeldLock {
    fd: u64,
    owner: LockOwner,
    svid: u32,
    range: LockRange,
    kind: LockKind,
}

impl HeldLock {
    fn blocks(&self, request: &LockRequest) -> bool {
        self.owner != request.owner
            && self.range.overlaps(&request.range)
            && (self.kind.is_exclusive() || request.kind.is_exclusive())
    }

    fn holder(&self) -> LockHolder {
        LockHolder {
            owner: self.owner.clone(),
            svid: self.svid,
            range: self.range,
            kind: self.kind,
        }
    }
}

#[derive(Default)]
struct LockTable {
    open_fds: HashSet<u64>,
    held: HashMap<ObjectId, Vec<HeldLock>>,
}

/// Check that a file may grow to `end` bytes and convert it to a length
fn file_len(end: u64) -> Result<usize, BackendError> {
    if end > MAX_FILE_SIZE {
        return Err(BackendError::FileTooLarge);
    }
    usize::try_from(end).map_err(|_| BackendError::FileTooLarge)
}

/// In-memory backend mount
pub struct InMemoryBackend {
    namespace: Mutex<Namespace>,
    locks: Mutex<LockTable>,
    lock_released: Notify,
    next_fd: AtomicU64,
    counters: CallCounters,
    opens_held: watch::Sender<bool>,
    parked_opens: AtomicUsize,
}

impl InMemoryBackend {
    /// Create a backend holding only an empty, world-writable root
    pub fn new() -> Self {
        let now = Utc::now();
        let root = Node {
            attrs: Attrs {
                object_id: ObjectId::ROOT,
                file_type: FileType::Directory,
                mode: 0o777,
                nlink: 2,
                uid: 0,
                gid: 0,
                size: 4096,
                rdev: DeviceNumber::default(),
                fileid: ObjectId::ROOT.fileid(),
                atime: now,
                mtime: now,
                ctime: now,
            },
            parent: ObjectId::ROOT,
            content: Content::Directory(BTreeMap::new()),
            verifier: None,
        };
        let mut nodes = HashMap::new();
        nodes.insert(ObjectId::ROOT, root);

        Self {
            namespace: Mutex::new(Namespace { nodes }),
            locks: Mutex::new(LockTable::default()),
            lock_released: Notify::new(),
            next_fd: AtomicU64::new(1),
            counters: CallCounters::default(),
            opens_held: watch::Sender::new(false),
            parked_opens: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> BackendCallCounts {
        BackendCallCounts {
            lookup_root: self.counters.lookup_root.load(Ordering::SeqCst),
            lookup_by_name: self.counters.lookup_by_name.load(Ordering::SeqCst),
            lookup_by_id: self.counters.lookup_by_id.load(Ordering::SeqCst),
            lock: self.counters.lock.load(Ordering::SeqCst),
        }
    }

    /// Number of lock ranges currently held on `id`
    pub fn held_lock_count(&self, id: ObjectId) -> usize {
        self.locks.lock().held.get(&id).map_or(0, Vec::len)
    }

    pub fn open_descriptor_count(&self) -> usize {
        self.locks.lock().open_fds.len()
    }

    /// Park every `open` call until [`release_opens`](Self::release_opens)
    ///
    /// Lets tests hold a request at a known await point.
    pub fn hold_opens(&self) {
        self.opens_held.send_replace(true);
    }

    pub fn release_opens(&self) {
        self.opens_held.send_replace(false);
    }

    /// Number of `open` calls currently parked by [`hold_opens`](Self::hold_opens)
    pub fn parked_open_count(&self) -> usize {
        self.parked_opens.load(Ordering::SeqCst)
    }

    fn new_node(
        principal: &Principal,
        parent: ObjectId,
        file_type: FileType,
        perm: u32,
        content: Content,
    ) -> Node {
        let now = Utc::now();
        let object_id = ObjectId::new();
        let (size, nlink, rdev) = match &content {
            Content::File(data) => (data.len() as u64, 1, DeviceNumber::default()),
            Content::Directory(_) => (4096, 2, DeviceNumber::default()),
            Content::Symlink(target) => (target.len() as u64, 1, DeviceNumber::default()),
            Content::Special(dev) => (0, 1, *dev),
        };
        Node {
            attrs: Attrs {
                object_id,
                file_type,
                mode: perm & 0o7777,
                nlink,
                uid: principal.uid,
                gid: principal.gid,
                size,
                rdev,
                fileid: object_id.fileid(),
                atime: now,
                mtime: now,
                ctime: now,
            },
            parent,
            content,
            verifier: None,
        }
    }

    fn try_acquire(&self, fd: &Descriptor, request: &LockRequest) -> Result<(), BackendError> {
        let mut table = self.locks.lock();
        if !table.open_fds.contains(&fd.id()) {
            return Err(BackendError::Invalid("descriptor is closed".to_string()));
        }
        let held = table.held.entry(fd.object().id()).or_default();
        if held.iter().any(|h| h.blocks(request)) {
            return Err(BackendError::WouldBlock);
        }

        let mut kept = Vec::with_capacity(held.len() + 1);
        for lock in held.drain(..) {
            if lock.owner == request.owner && lock.range.overlaps(&request.range) {
                for piece in lock.range.subtract(&request.range) {
                    kept.push(HeldLock {
                        range: piece,
                        ..lock.clone()
                    });
                }
            } else {
                kept.push(lock);
            }
        }
        kept.push(HeldLock {
            fd: fd.id(),
            owner: request.owner.clone(),
            svid: request.svid,
            range: request.range,
            kind: request.kind,
        });
        *held = kept;
        Ok(())
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_name(name: &str) -> Result<(), BackendError> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(BackendError::Invalid(format!("bad name '{}'", name)));
    }
    if name == "." || name == ".." {
        return Err(BackendError::Exists);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(BackendError::NameTooLong);
    }
    Ok(())
}

fn resolve_time(time: SetTime) -> chrono::DateTime<Utc> {
    match time {
        SetTime::ServerNow => Utc::now(),
        SetTime::Client(t) => t,
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn lookup_root(
        &self,
        _principal: &Principal,
    ) -> Result<(ObjectRef, Attrs), BackendError> {
        self.counters.lookup_root.fetch_add(1, Ordering::SeqCst);
        let ns = self.namespace.lock();
        let root = ns.node(ObjectId::ROOT)?;
        Ok((root.object_ref(), root.attrs.clone()))
    }

    async fn lookup_by_name(
        &self,
        principal: &Principal,
        parent: &ObjectRef,
        name: &str,
    ) -> Result<(ObjectRef, Attrs), BackendError> {
        self.counters.lookup_by_name.fetch_add(1, Ordering::SeqCst);
        let ns = self.namespace.lock();
        let dir = ns.node(parent.id())?;
        let entries = dir.entries()?;
        if !dir.attrs.permits(principal, ACCESS_EXECUTE) {
            return Err(BackendError::AccessDenied);
        }
        let id = match name {
            "." => parent.id(),
            ".." => dir.parent,
            _ => *entries.get(name).ok_or(BackendError::NotFound)?,
        };
        let node = ns.node(id)?;
        Ok((node.object_ref(), node.attrs.clone()))
    }

    async fn lookup_by_id(
        &self,
        _principal: &Principal,
        root: &ObjectRef,
        id: ObjectId,
    ) -> Result<(ObjectRef, Attrs), BackendError> {
        self.counters.lookup_by_id.fetch_add(1, Ordering::SeqCst);
        let ns = self.namespace.lock();
        ns.node(root.id())?;
        let node = ns.node(id)?;
        Ok((node.object_ref(), node.attrs.clone()))
    }

    async fn stat(
        &self,
        _principal: &Principal,
        object: &ObjectRef,
    ) -> Result<Attrs, BackendError> {
        Ok(self.namespace.lock().node(object.id())?.attrs.clone())
    }

    async fn setattr(
        &self,
        principal: &Principal,
        object: &ObjectRef,
        attrs: &SetAttrs,
    ) -> Result<Attrs, BackendError> {
        let mut ns = self.namespace.lock();
        let node = ns.node_mut(object.id())?;
        let is_owner = principal.is_root() || principal.uid == node.attrs.uid;

        if (attrs.mode.is_some() || attrs.atime.is_some() || attrs.mtime.is_some()) && !is_owner {
            return Err(BackendError::PermissionDenied);
        }
        if (attrs.uid.is_some() || attrs.gid.is_some()) && !principal.is_root() {
            return Err(BackendError::PermissionDenied);
        }

        if let Some(size) = attrs.size {
            if !node.attrs.permits(principal, ACCESS_WRITE) {
                return Err(BackendError::AccessDenied);
            }
            match &mut node.content {
                Content::File(data) => data.resize(file_len(size)?, 0),
                Content::Directory(_) => return Err(BackendError::IsDirectory),
                Content::Symlink(_) | Content::Special(_) => {
                    return Err(BackendError::Invalid("cannot truncate a special file".to_string()))
                }
            }
            node.attrs.size = size;
            node.attrs.mtime = Utc::now();
        }
        if let Some(mode) = attrs.mode {
            node.attrs.mode = mode & 0o7777;
        }
        if let Some(uid) = attrs.uid {
            node.attrs.uid = uid;
        }
        if let Some(gid) = attrs.gid {
            node.attrs.gid = gid;
        }
        if let Some(atime) = attrs.atime {
            node.attrs.atime = resolve_time(atime);
        }
        if let Some(mtime) = attrs.mtime {
            node.attrs.mtime = resolve_time(mtime);
        }
        node.attrs.ctime = Utc::now();
        Ok(node.attrs.clone())
    }

    async fn open(
        &self,
        _principal: &Principal,
        object: &ObjectRef,
        mode: OpenMode,
    ) -> Result<Descriptor, BackendError> {
        let mut gate = self.opens_held.subscribe();
        if *gate.borrow_and_update() {
            self.parked_opens.fetch_add(1, Ordering::SeqCst);
            let _ = gate.wait_for(|held| !*held).await;
            self.parked_opens.fetch_sub(1, Ordering::SeqCst);
        }

        self.namespace.lock().node(object.id())?;
        let id = self.next_fd.fetch_add(1, Ordering::SeqCst);
        self.locks.lock().open_fds.insert(id);
        debug!("Opened descriptor {} on {} ({:?})", id, object.id(), mode);
        Ok(Descriptor::new(id, object.clone(), mode))
    }

    fn close(&self, fd: &Descriptor) {
        {
            let mut table = self.locks.lock();
            table.open_fds.remove(&fd.id());
            if let Some(held) = table.held.get_mut(&fd.object().id()) {
                held.retain(|lock| lock.fd != fd.id());
                if held.is_empty() {
                    table.held.remove(&fd.object().id());
                }
            }
        }
        debug!("Closed descriptor {}", fd.id());
        self.lock_released.notify_waiters();
    }

    async fn lock(
        &self,
        fd: &Descriptor,
        request: &LockRequest,
        blocking: bool,
    ) -> Result<(), BackendError> {
        self.counters.lock.fetch_add(1, Ordering::SeqCst);
        loop {
            // Register for wakeups before probing so an unlock in between is not lost.
            let released = self.lock_released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            match self.try_acquire(fd, request) {
                Err(BackendError::WouldBlock) if blocking => {
                    debug!(
                        "Lock on {} for owner {} blocked, waiting",
                        fd.object().id(),
                        request.owner
                    );
                    released.await;
                }
                other => return other,
            }
        }
    }

    async fn test_lock(
        &self,
        fd: &Descriptor,
        request: &LockRequest,
    ) -> Result<Option<LockHolder>, BackendError> {
        let table = self.locks.lock();
        if !table.open_fds.contains(&fd.id()) {
            return Err(BackendError::Invalid("descriptor is closed".to_string()));
        }
        Ok(table
            .held
            .get(&fd.object().id())
            .and_then(|held| held.iter().find(|h| h.blocks(request)))
            .map(HeldLock::holder))
    }

    async fn unlock(
        &self,
        fd: &Descriptor,
        owner: &LockOwner,
        range: LockRange,
    ) -> Result<(), BackendError> {
        {
            let mut table = self.locks.lock();
            let object = fd.object().id();
            if let Some(held) = table.held.get_mut(&object) {
                let mut kept = Vec::with_capacity(held.len());
                for lock in held.drain(..) {
                    if &lock.owner == owner && lock.range.overlaps(&range) {
                        for piece in lock.range.subtract(&range) {
                            kept.push(HeldLock {
                                range: piece,
                                ..lock.clone()
                            });
                        }
                    } else {
                        kept.push(lock);
                    }
                }
                if kept.is_empty() {
                    table.held.remove(&object);
                } else {
                    *held = kept;
                }
            }
        }
        self.lock_released.notify_waiters();
        Ok(())
    }

    async fn read(
        &self,
        principal: &Principal,
        object: &ObjectRef,
        offset: u64,
        count: u32,
    ) -> Result<ReadOutcome, BackendError> {
        let ns = self.namespace.lock();
        let node = ns.node(object.id())?;
        let data = match &node.content {
            Content::File(data) => data,
            Content::Directory(_) => return Err(BackendError::IsDirectory),
            Content::Symlink(_) | Content::Special(_) => {
                return Err(BackendError::Invalid("cannot read a special file".to_string()))
            }
        };
        if !node.attrs.permits(principal, ACCESS_READ) {
            return Err(BackendError::AccessDenied);
        }
        let len = data.len() as u64;
        let start = offset.min(len) as usize;
        let end = offset.saturating_add(count as u64).min(len) as usize;
        Ok(ReadOutcome {
            data: Bytes::copy_from_slice(&data[start..end]),
            eof: end as u64 >= len,
        })
    }

    async fn write(
        &self,
        principal: &Principal,
        object: &ObjectRef,
        offset: u64,
        data: &[u8],
        stable: StableHow,
    ) -> Result<WriteOutcome, BackendError> {
        let mut ns = self.namespace.lock();
        let node = ns.node_mut(object.id())?;
        if !node.attrs.permits(principal, ACCESS_WRITE) {
            return Err(BackendError::AccessDenied);
        }
        let contents = match &mut node.content {
            Content::File(contents) => contents,
            Content::Directory(_) => return Err(BackendError::IsDirectory),
            Content::Symlink(_) | Content::Special(_) => {
                return Err(BackendError::Invalid("cannot write a special file".to_string()))
            }
        };
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(BackendError::FileTooLarge)?;
        let end = file_len(end)?;
        let start = end - data.len();
        if contents.len() < end {
            contents.resize(end, 0);
        }
        contents[start..end].copy_from_slice(data);
        node.attrs.size = contents.len() as u64;
        node.touch();
        Ok(WriteOutcome {
            count: data.len() as u32,
            committed: stable,
        })
    }

    async fn fsync(&self, _principal: &Principal, object: &ObjectRef) -> Result<(), BackendError> {
        self.namespace.lock().node(object.id())?;
        Ok(())
    }

    async fn create(
        &self,
        principal: &Principal,
        parent: &ObjectRef,
        name: &str,
        mode: CreateMode,
        perm: u32,
    ) -> Result<(ObjectRef, Attrs), BackendError> {
        validate_name(name)?;
        let mut ns = self.namespace.lock();
        let existing = ns.writable_dir(parent.id(), principal)?.entries()?.get(name).copied();

        if let Some(id) = existing {
            let node = ns.node(id)?;
            return match mode {
                CreateMode::Unchecked if node.attrs.file_type == FileType::Regular => {
                    Ok((node.object_ref(), node.attrs.clone()))
                }
                CreateMode::Exclusive(verf) if node.verifier == Some(verf) => {
                    Ok((node.object_ref(), node.attrs.clone()))
                }
                _ => Err(BackendError::Exists),
            };
        }

        let mut node = Self::new_node(
            principal,
            parent.id(),
            FileType::Regular,
            perm,
            Content::File(Vec::new()),
        );
        if let CreateMode::Exclusive(verf) = mode {
            node.verifier = Some(verf);
        }
        let result = (node.object_ref(), node.attrs.clone());
        ns.insert_child(parent.id(), name, node)?;
        Ok(result)
    }

    async fn mkdir(
        &self,
        principal: &Principal,
        parent: &ObjectRef,
        name: &str,
        perm: u32,
    ) -> Result<(ObjectRef, Attrs), BackendError> {
        validate_name(name)?;
        let mut ns = self.namespace.lock();
        if ns.writable_dir(parent.id(), principal)?.entries()?.contains_key(name) {
            return Err(BackendError::Exists);
        }
        let node = Self::new_node(
            principal,
            parent.id(),
            FileType::Directory,
            perm,
            Content::Directory(BTreeMap::new()),
        );
        let result = (node.object_ref(), node.attrs.clone());
        ns.insert_child(parent.id(), name, node)?;
        Ok(result)
    }

    async fn symlink(
        &self,
        principal: &Principal,
        parent: &ObjectRef,
        name: &str,
        target: &str,
    ) -> Result<(ObjectRef, Attrs), BackendError> {
        validate_name(name)?;
        let mut ns = self.namespace.lock();
        if ns.writable_dir(parent.id(), principal)?.entries()?.contains_key(name) {
            return Err(BackendError::Exists);
        }
        let node = Self::new_node(
            principal,
            parent.id(),
            FileType::Symlink,
            0o777,
            Content::Symlink(target.to_string()),
        );
        let result = (node.object_ref(), node.attrs.clone());
        ns.insert_child(parent.id(), name, node)?;
        Ok(result)
    }

    async fn readlink(
        &self,
        _principal: &Principal,
        object: &ObjectRef,
    ) -> Result<String, BackendError> {
        let ns = self.namespace.lock();
        match &ns.node(object.id())?.content {
            Content::Symlink(target) => Ok(target.clone()),
            _ => Err(BackendError::Invalid("not a symlink".to_string())),
        }
    }

    async fn mknod(
        &self,
        principal: &Principal,
        parent: &ObjectRef,
        name: &str,
        kind: SpecialFile,
        perm: u32,
    ) -> Result<(ObjectRef, Attrs), BackendError> {
        validate_name(name)?;
        if matches!(kind, SpecialFile::Block(_) | SpecialFile::Char(_)) && !principal.is_root() {
            return Err(BackendError::PermissionDenied);
        }
        let mut ns = self.namespace.lock();
        if ns.writable_dir(parent.id(), principal)?.entries()?.contains_key(name) {
            return Err(BackendError::Exists);
        }
        let node = Self::new_node(
            principal,
            parent.id(),
            kind.file_type(),
            perm,
            Content::Special(kind.device()),
        );
        let result = (node.object_ref(), node.attrs.clone());
        ns.insert_child(parent.id(), name, node)?;
        Ok(result)
    }

    async fn statfs(
        &self,
        _principal: &Principal,
        object: &ObjectRef,
    ) -> Result<FsStats, BackendError> {
        let ns = self.namespace.lock();
        ns.node(object.id())?;
        let used_bytes: u64 = ns
            .nodes
            .values()
            .map(|node| match &node.content {
                Content::File(data) => data.len() as u64,
                _ => 0,
            })
            .sum();
        let free_bytes = CAPACITY_BYTES.saturating_sub(used_bytes);
        let free_files = CAPACITY_FILES.saturating_sub(ns.nodes.len() as u64);
        Ok(FsStats {
            total_bytes: CAPACITY_BYTES,
            free_bytes,
            avail_bytes: free_bytes,
            total_files: CAPACITY_FILES,
            free_files,
            avail_files: free_files,
        })
    }

    async fn remove(
        &self,
        principal: &Principal,
        parent: &ObjectRef,
        name: &str,
    ) -> Result<(), BackendError> {
        let mut ns = self.namespace.lock();
        ns.writable_dir(parent.id(), principal)?;
        let id = ns.child(parent.id(), name)?;
        if ns.node(id)?.attrs.is_directory() {
            return Err(BackendError::IsDirectory);
        }
        ns.detach_child(parent.id(), name)?;
        ns.release_link(id);
        Ok(())
    }

    async fn rmdir(
        &self,
        principal: &Principal,
        parent: &ObjectRef,
        name: &str,
    ) -> Result<(), BackendError> {
        match name {
            "." => return Err(BackendError::Invalid("cannot remove '.'".to_string())),
            ".." => return Err(BackendError::NotEmpty),
            _ => {}
        }
        let mut ns = self.namespace.lock();
        ns.writable_dir(parent.id(), principal)?;
        let id = ns.child(parent.id(), name)?;
        if !ns.node(id)?.entries()?.is_empty() {
            return Err(BackendError::NotEmpty);
        }
        ns.detach_child(parent.id(), name)?;
        let dir = ns.node_mut(parent.id())?;
        dir.attrs.nlink = dir.attrs.nlink.saturating_sub(1);
        ns.release_link(id);
        Ok(())
    }

    async fn rename(
        &self,
        principal: &Principal,
        from_parent: &ObjectRef,
        from_name: &str,
        to_parent: &ObjectRef,
        to_name: &str,
    ) -> Result<(), BackendError> {
        validate_name(to_name)?;
        let mut ns = self.namespace.lock();
        ns.writable_dir(from_parent.id(), principal)?;
        ns.writable_dir(to_parent.id(), principal)?;

        let source = ns.child(from_parent.id(), from_name)?;
        let source_is_dir = ns.node(source)?.attrs.is_directory();
        if source_is_dir && ns.is_ancestor(source, to_parent.id()) {
            return Err(BackendError::Invalid(
                "cannot move a directory beneath itself".to_string(),
            ));
        }

        match ns.child(to_parent.id(), to_name) {
            Ok(target) if target == source => return Ok(()),
            Ok(target) => {
                let target_node = ns.node(target)?;
                match (source_is_dir, target_node.attrs.is_directory()) {
                    (false, true) => return Err(BackendError::IsDirectory),
                    (true, false) => return Err(BackendError::NotDirectory),
                    (true, true) if !target_node.entries()?.is_empty() => {
                        return Err(BackendError::NotEmpty)
                    }
                    _ => {}
                }
                ns.detach_child(to_parent.id(), to_name)?;
                if source_is_dir {
                    let dir = ns.node_mut(to_parent.id())?;
                    dir.attrs.nlink = dir.attrs.nlink.saturating_sub(1);
                }
                ns.release_link(target);
            }
            Err(BackendError::NotFound) => {}
            Err(e) => return Err(e),
        }

        ns.detach_child(from_parent.id(), from_name)?;
        if source_is_dir {
            let dir = ns.node_mut(from_parent.id())?;
            dir.attrs.nlink = dir.attrs.nlink.saturating_sub(1);
        }
        let dest = ns.node_mut(to_parent.id())?;
        if let Content::Directory(entries) = &mut dest.content {
            entries.insert(to_name.to_string(), source);
        }
        if source_is_dir {
            dest.attrs.nlink += 1;
        }
        dest.touch();
        let moved = ns.node_mut(source)?;
        moved.parent = to_parent.id();
        moved.attrs.ctime = Utc::now();
        Ok(())
    }

    async fn link(
        &self,
        principal: &Principal,
        object: &ObjectRef,
        parent: &ObjectRef,
        name: &str,
    ) -> Result<Attrs, BackendError> {
        validate_name(name)?;
        let mut ns = self.namespace.lock();
        if ns.writable_dir(parent.id(), principal)?.entries()?.contains_key(name) {
            return Err(BackendError::Exists);
        }
        if ns.node(object.id())?.attrs.is_directory() {
            return Err(BackendError::IsDirectory);
        }
        let dir = ns.node_mut(parent.id())?;
        if let Content::Directory(entries) = &mut dir.content {
            entries.insert(name.to_string(), object.id());
        }
        dir.touch();
        let node = ns.node_mut(object.id())?;
        node.attrs.nlink += 1;
        node.attrs.ctime = Utc::now();
        Ok(node.attrs.clone())
    }

    async fn readdir(
        &self,
        principal: &Principal,
        dir: &ObjectRef,
        cookie: u64,
        max_entries: usize,
    ) -> Result<ReaddirPage, BackendError> {
        let ns = self.namespace.lock();
        let node = ns.node(dir.id())?;
        let entries = node.entries()?;
        if !node.attrs.permits(principal, ACCESS_READ) {
            return Err(BackendError::AccessDenied);
        }

        let mut listing: Vec<(String, ObjectId)> = Vec::with_capacity(entries.len() + 2);
        listing.push((".".to_string(), dir.id()));
        listing.push(("..".to_string(), node.parent));
        listing.extend(entries.iter().map(|(name, id)| (name.clone(), *id)));

        let start = usize::try_from(cookie).unwrap_or(usize::MAX);
        let limit = max_entries.max(1);
        let mut page = ReaddirPage::default();
        for (index, (name, id)) in listing.iter().enumerate().skip(start).take(limit) {
            let file_type = ns.node(*id).map(|n| n.attrs.file_type).unwrap_or(FileType::Regular);
            page.entries.push(DirEntry {
                name: name.clone(),
                object_id: *id,
                file_type,
                fileid: id.fileid(),
                cookie: index as u64 + 1,
            });
        }
        page.eof = start.saturating_add(limit) >= listing.len();
        Ok(page)
    }
}
