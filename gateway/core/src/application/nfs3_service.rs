// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! NFSv3 Procedure Service
//!
//! One handler per NFSv3 procedure. Each follows the same shape: acquire a
//! call context, resolve the handle (and child name where the procedure
//! takes one), then run the backend operation in the continuation. Replies
//! are plain values; failures are `nfsstat3` codes.
//!
//! XDR marshaling and the RPC transport live in the dispatcher; this
//! service only sees decoded arguments.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** NFSv3 procedure semantics over the resolver

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::application::call_context::{CallContext, CallContextPool};
use crate::application::export_table::Export;
use crate::application::resolver::{EntryIntent, EntryTarget, Resolver};
use crate::domain::backend::{
    Attrs, BackendError, CreateMode, FileType, FsStats, ObjectRef, RequestInfo, SetAttrs,
    SpecialFile, StableHow, ACCESS_EXECUTE, ACCESS_READ, ACCESS_WRITE,
};
use crate::domain::errors::{NfsError, Nfs3Status};
use crate::domain::file_handle::{FileHandle, HandleFlags, ObjectId};
use crate::infrastructure::nfs::encode_file_handle;

pub type Nfs3Result<T> = Result<T, Nfs3Status>;

/// ACCESS3 request/reply bits
pub const ACCESS3_READ: u32 = 0x0001;
pub const ACCESS3_LOOKUP: u32 = 0x0002;
pub const ACCESS3_MODIFY: u32 = 0x0004;
pub const ACCESS3_EXTEND: u32 = 0x0008;
pub const ACCESS3_DELETE: u32 = 0x0010;
pub const ACCESS3_EXECUTE: u32 = 0x0020;

/// FSINFO `properties` bits
pub const FSF3_LINK: u32 = 0x0001;
pub const FSF3_SYMLINK: u32 = 0x0002;
pub const FSF3_HOMOGENEOUS: u32 = 0x0008;
pub const FSF3_CANSETTIME: u32 = 0x0010;

/// Largest READ or WRITE transfer advertised by FSINFO
pub const NFS3_IO_SIZE: u32 = 1024 * 1024;
/// Preferred READDIR reply size
pub const NFS3_DIR_SIZE: u32 = 64 * 1024;
const NFS3_IO_MULTIPLE: u32 = 4096;
const NFS3_MAX_FILE_SIZE: u64 = 1 << 63;
const NFS3_LINK_MAX: u32 = 256;
const NFS3_NAME_MAX: u32 = 255;

/// Weak cache consistency data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WccData {
    pub before: Option<Attrs>,
    pub after: Option<Attrs>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupRes {
    pub fh: Bytes,
    pub attrs: Attrs,
    pub dir_attrs: Option<Attrs>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRes {
    pub access: u32,
    pub attrs: Attrs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadlinkRes {
    pub target: String,
    pub attrs: Option<Attrs>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRes {
    pub data: Bytes,
    pub eof: bool,
    pub attrs: Option<Attrs>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRes {
    pub count: u32,
    pub committed: StableHow,
    pub verifier: u64,
    pub wcc: WccData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRes {
    pub verifier: u64,
    pub wcc: WccData,
}

/// Reply of CREATE, MKDIR and SYMLINK
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRes {
    pub fh: Bytes,
    pub attrs: Option<Attrs>,
    pub dir_wcc: WccData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameRes {
    pub from_dir_wcc: WccData,
    pub to_dir_wcc: WccData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRes {
    pub attrs: Option<Attrs>,
    pub dir_wcc: WccData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nfs3DirEntry {
    pub fileid: u64,
    pub name: String,
    pub cookie: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaddirRes {
    pub entries: Vec<Nfs3DirEntry>,
    pub eof: bool,
    pub dir_attrs: Option<Attrs>,
}

/// READDIRPLUS entry; handle and attributes are omitted when the child
/// could not be looked up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nfs3DirEntryPlus {
    pub fileid: u64,
    pub name: String,
    pub cookie: u64,
    pub fh: Option<Bytes>,
    pub attrs: Option<Attrs>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaddirPlusRes {
    pub entries: Vec<Nfs3DirEntryPlus>,
    pub eof: bool,
    pub dir_attrs: Option<Attrs>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsstatRes {
    pub attrs: Option<Attrs>,
    pub stats: FsStats,
    /// Seconds the figures are not expected to change; always 0
    pub invarsec: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsinfoRes {
    pub attrs: Option<Attrs>,
    pub rtmax: u32,
    pub rtpref: u32,
    pub rtmult: u32,
    pub wtmax: u32,
    pub wtpref: u32,
    pub wtmult: u32,
    pub dtpref: u32,
    pub maxfilesize: u64,
    pub time_delta: Duration,
    pub properties: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathconfRes {
    pub attrs: Option<Attrs>,
    pub linkmax: u32,
    pub name_max: u32,
    pub no_trunc: bool,
    pub chown_restricted: bool,
    pub case_insensitive: bool,
    pub case_preserving: bool,
}

/// `createhow3`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateHow {
    Unchecked(SetAttrs),
    Guarded(SetAttrs),
    Exclusive(u64),
}

/// NFSv3 procedure handlers for every configured export
#[derive(Clone)]
pub struct Nfs3Service {
    resolver: Resolver,
    pool: CallContextPool,
    write_verifier: u64,
}

impl Nfs3Service {
    pub fn new(resolver: Resolver, pool: CallContextPool) -> Self {
        // Changes on every restart so clients resend uncommitted writes
        let write_verifier = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
        Self {
            resolver,
            pool,
            write_verifier,
        }
    }

    pub fn write_verifier(&self) -> u64 {
        self.write_verifier
    }

    /// GETATTR
    pub async fn getattr(&self, request: RequestInfo, fh: &[u8]) -> Nfs3Result<Attrs> {
        let ctx = self.pool.acquire(request);
        self.resolver
            .resolve_and_resume(ctx, fh, None, |ctx| async move {
                let (export, object) = resolved_object(&ctx)?;
                match ctx.location().attrs.clone() {
                    Some(attrs) => Ok(attrs),
                    None => stat(&ctx, &export, &object).await,
                }
            })
            .await
    }

    /// SETATTR
    pub async fn setattr(
        &self,
        request: RequestInfo,
        fh: &[u8],
        attrs: SetAttrs,
    ) -> Nfs3Result<WccData> {
        let ctx = self.pool.acquire(request);
        self.resolver
            .resolve_and_resume(ctx, fh, None, |mut ctx| async move {
                let (export, object) = resolved_object(&ctx)?;
                writable(&export)?;
                if let Ok(before) = stat(&ctx, &export, &object).await {
                    ctx.set_pre_attrs(before);
                }
                let after = export
                    .backend()
                    .setattr(&ctx.principal(), &object, &attrs)
                    .await
                    .map_err(status)?;
                Ok(WccData {
                    before: ctx.pre_attrs().cloned(),
                    after: Some(after),
                })
            })
            .await
    }

    /// LOOKUP; `..` of the export root is the root itself
    pub async fn lookup(
        &self,
        request: RequestInfo,
        dir_fh: &[u8],
        name: &str,
    ) -> Nfs3Result<LookupRes> {
        let ctx = self.pool.acquire(request);
        let target = Some(EntryTarget::new(name, EntryIntent::Lookup));
        self.resolver
            .resolve_and_resume(ctx, dir_fh, target, |ctx| async move {
                let (export, parent, object) = resolved_entry(&ctx)?;
                let attrs = match ctx.location().attrs.clone() {
                    Some(attrs) => attrs,
                    None => stat(&ctx, &export, &object).await?,
                };
                Ok(LookupRes {
                    fh: handle_for(&export, &object)?,
                    attrs,
                    dir_attrs: stat(&ctx, &export, &parent).await.ok(),
                })
            })
            .await
    }

    /// ACCESS; modify bits are never granted on a read-only export
    pub async fn access(
        &self,
        request: RequestInfo,
        fh: &[u8],
        requested: u32,
    ) -> Nfs3Result<AccessRes> {
        let ctx = self.pool.acquire(request);
        self.resolver
            .resolve_and_resume(ctx, fh, None, |ctx| async move {
                let (export, object) = resolved_object(&ctx)?;
                let attrs = stat(&ctx, &export, &object).await?;
                let principal = ctx.principal();

                let mut granted = 0;
                if attrs.permits(&principal, ACCESS_READ) {
                    granted |= ACCESS3_READ;
                }
                if attrs.is_directory() && attrs.permits(&principal, ACCESS_EXECUTE) {
                    granted |= ACCESS3_LOOKUP;
                }
                if !attrs.is_directory() && attrs.permits(&principal, ACCESS_EXECUTE) {
                    granted |= ACCESS3_EXECUTE;
                }
                if !export.policy.is_read_only() && attrs.permits(&principal, ACCESS_WRITE) {
                    granted |= ACCESS3_MODIFY | ACCESS3_EXTEND;
                    if attrs.is_directory() {
                        granted |= ACCESS3_DELETE;
                    }
                }
                Ok(AccessRes {
                    access: granted & requested,
                    attrs,
                })
            })
            .await
    }

    /// READLINK
    pub async fn readlink(&self, request: RequestInfo, fh: &[u8]) -> Nfs3Result<ReadlinkRes> {
        let ctx = self.pool.acquire(request);
        self.resolver
            .resolve_and_resume(ctx, fh, None, |ctx| async move {
                let (export, object) = resolved_object(&ctx)?;
                if object.file_type() != FileType::Symlink {
                    return Err(Nfs3Status::Inval);
                }
                let target = export
                    .backend()
                    .readlink(&ctx.principal(), &object)
                    .await
                    .map_err(status)?;
                Ok(ReadlinkRes {
                    target,
                    attrs: stat(&ctx, &export, &object).await.ok(),
                })
            })
            .await
    }

    /// READ
    pub async fn read(
        &self,
        request: RequestInfo,
        fh: &[u8],
        offset: u64,
        count: u32,
    ) -> Nfs3Result<ReadRes> {
        let ctx = self.pool.acquire(request);
        self.resolver
            .resolve_and_resume(ctx, fh, None, |ctx| async move {
                let (export, object) = resolved_object(&ctx)?;
                if object.is_directory() {
                    return Err(Nfs3Status::IsDir);
                }
                let outcome = export
                    .backend()
                    .read(&ctx.principal(), &object, offset, count)
                    .await
                    .map_err(status)?;
                Ok(ReadRes {
                    data: outcome.data,
                    eof: outcome.eof,
                    attrs: stat(&ctx, &export, &object).await.ok(),
                })
            })
            .await
    }

    /// WRITE
    ///
    /// `trusted_sync` exports treat every write as FILE_SYNC; `trusted_write`
    /// exports acknowledge the requested stability without flushing.
    pub async fn write(
        &self,
        request: RequestInfo,
        fh: &[u8],
        offset: u64,
        data: Bytes,
        stable: StableHow,
    ) -> Nfs3Result<WriteRes> {
        let ctx = self.pool.acquire(request);
        let verifier = self.write_verifier;
        self.resolver
            .resolve_and_resume(ctx, fh, None, |mut ctx| async move {
                let (export, object) = resolved_object(&ctx)?;
                writable(&export)?;
                if object.is_directory() {
                    return Err(Nfs3Status::IsDir);
                }
                let policy = export.policy;
                let stable = if policy.trusted_sync {
                    StableHow::FileSync
                } else {
                    stable
                };
                let backend_stable = if policy.trusted_write {
                    StableHow::Unstable
                } else {
                    stable
                };

                let principal = ctx.principal();
                if let Ok(before) = stat(&ctx, &export, &object).await {
                    ctx.set_pre_attrs(before);
                }
                ctx.buffer_mut().extend_from_slice(&data);
                let outcome = export
                    .backend()
                    .write(&principal, &object, offset, &ctx.buffer_mut()[..], backend_stable)
                    .await
                    .map_err(status)?;

                let mut committed = outcome.committed;
                if committed < stable {
                    if !policy.trusted_write {
                        export
                            .backend()
                            .fsync(&principal, &object)
                            .await
                            .map_err(status)?;
                    }
                    committed = stable;
                }

                Ok(WriteRes {
                    count: outcome.count,
                    committed,
                    verifier,
                    wcc: WccData {
                        before: ctx.pre_attrs().cloned(),
                        after: stat(&ctx, &export, &object).await.ok(),
                    },
                })
            })
            .await
    }

    /// COMMIT; a no-op flush on `trusted_write` exports
    pub async fn commit(&self, request: RequestInfo, fh: &[u8]) -> Nfs3Result<CommitRes> {
        let ctx = self.pool.acquire(request);
        let verifier = self.write_verifier;
        self.resolver
            .resolve_and_resume(ctx, fh, None, |ctx| async move {
                let (export, object) = resolved_object(&ctx)?;
                writable(&export)?;
                let before = stat(&ctx, &export, &object).await.ok();
                if !export.policy.trusted_write {
                    export
                        .backend()
                        .fsync(&ctx.principal(), &object)
                        .await
                        .map_err(status)?;
                }
                Ok(CommitRes {
                    verifier,
                    wcc: WccData {
                        before,
                        after: stat(&ctx, &export, &object).await.ok(),
                    },
                })
            })
            .await
    }

    /// CREATE
    ///
    /// The child is not looked up first; the backend reports an existing
    /// name itself. Attributes beyond the mode are applied afterwards and a
    /// failure there does not undo the create.
    pub async fn create(
        &self,
        request: RequestInfo,
        dir_fh: &[u8],
        name: &str,
        how: CreateHow,
    ) -> Nfs3Result<CreateRes> {
        let ctx = self.pool.acquire(request);
        let target = Some(EntryTarget::new(name, EntryIntent::Create));
        self.resolver
            .resolve_and_resume(ctx, dir_fh, target, |ctx| async move {
                let (export, parent) = resolved_parent(&ctx)?;
                writable(&export)?;
                let before = stat(&ctx, &export, &parent).await.ok();

                let (mode, attrs) = match how {
                    CreateHow::Unchecked(attrs) => (CreateMode::Unchecked, attrs),
                    CreateHow::Guarded(attrs) => (CreateMode::Guarded, attrs),
                    CreateHow::Exclusive(verf) => {
                        (CreateMode::Exclusive(verf), SetAttrs::default())
                    }
                };
                let perm = attrs.mode.unwrap_or(0o644);
                let (object, created) = export
                    .backend()
                    .create(&ctx.principal(), &parent, name, mode, perm)
                    .await
                    .map_err(status)?;
                export.cache().link_entry(&parent, name, &object);

                let attrs = apply_follow_up(&ctx, &export, &object, attrs, created).await;
                created_reply(&ctx, &export, &parent, &object, attrs, before).await
            })
            .await
    }

    /// MKDIR
    pub async fn mkdir(
        &self,
        request: RequestInfo,
        dir_fh: &[u8],
        name: &str,
        attrs: SetAttrs,
    ) -> Nfs3Result<CreateRes> {
        let ctx = self.pool.acquire(request);
        let target = Some(EntryTarget::new(name, EntryIntent::Create));
        self.resolver
            .resolve_and_resume(ctx, dir_fh, target, |ctx| async move {
                let (export, parent) = resolved_parent(&ctx)?;
                writable(&export)?;
                let before = stat(&ctx, &export, &parent).await.ok();
                let perm = attrs.mode.unwrap_or(0o755);
                let (object, created) = export
                    .backend()
                    .mkdir(&ctx.principal(), &parent, name, perm)
                    .await
                    .map_err(status)?;
                export.cache().link_entry(&parent, name, &object);

                let attrs = apply_follow_up(&ctx, &export, &object, attrs, created).await;
                created_reply(&ctx, &export, &parent, &object, attrs, before).await
            })
            .await
    }

    /// SYMLINK
    pub async fn symlink(
        &self,
        request: RequestInfo,
        dir_fh: &[u8],
        name: &str,
        link_target: &str,
    ) -> Nfs3Result<CreateRes> {
        let ctx = self.pool.acquire(request);
        let target = Some(EntryTarget::new(name, EntryIntent::Create));
        self.resolver
            .resolve_and_resume(ctx, dir_fh, target, |ctx| async move {
                let (export, parent) = resolved_parent(&ctx)?;
                writable(&export)?;
                let before = stat(&ctx, &export, &parent).await.ok();
                let (object, created) = export
                    .backend()
                    .symlink(&ctx.principal(), &parent, name, link_target)
                    .await
                    .map_err(status)?;
                export.cache().link_entry(&parent, name, &object);
                created_reply(&ctx, &export, &parent, &object, Some(created), before).await
            })
            .await
    }

    /// MKNOD
    ///
    /// Device nodes need a privileged caller; the backend decides.
    pub async fn mknod(
        &self,
        request: RequestInfo,
        dir_fh: &[u8],
        name: &str,
        kind: SpecialFile,
        attrs: SetAttrs,
    ) -> Nfs3Result<CreateRes> {
        let ctx = self.pool.acquire(request);
        let target = Some(EntryTarget::new(name, EntryIntent::Create));
        self.resolver
            .resolve_and_resume(ctx, dir_fh, target, |ctx| async move {
                let (export, parent) = resolved_parent(&ctx)?;
                writable(&export)?;
                let before = stat(&ctx, &export, &parent).await.ok();
                let perm = attrs.mode.unwrap_or(0o644);
                let (object, created) = export
                    .backend()
                    .mknod(&ctx.principal(), &parent, name, kind, perm)
                    .await
                    .map_err(status)?;
                export.cache().link_entry(&parent, name, &object);
                debug!("Created {:?} node {} in export {}", kind, name, export.name);

                let attrs = apply_follow_up(&ctx, &export, &object, attrs, created).await;
                created_reply(&ctx, &export, &parent, &object, attrs, before).await
            })
            .await
    }

    /// REMOVE
    pub async fn remove(
        &self,
        request: RequestInfo,
        dir_fh: &[u8],
        name: &str,
    ) -> Nfs3Result<WccData> {
        self.unlink(request, dir_fh, name, false).await
    }

    /// RMDIR
    pub async fn rmdir(
        &self,
        request: RequestInfo,
        dir_fh: &[u8],
        name: &str,
    ) -> Nfs3Result<WccData> {
        self.unlink(request, dir_fh, name, true).await
    }

    async fn unlink(
        &self,
        request: RequestInfo,
        dir_fh: &[u8],
        name: &str,
        directory: bool,
    ) -> Nfs3Result<WccData> {
        let ctx = self.pool.acquire(request);
        let target = Some(EntryTarget::new(name, EntryIntent::Existing));
        self.resolver
            .resolve_and_resume(ctx, dir_fh, target, |ctx| async move {
                let (export, parent, object) = resolved_entry(&ctx)?;
                writable(&export)?;
                let before = stat(&ctx, &export, &parent).await.ok();
                let principal = ctx.principal();
                let result = if directory {
                    export.backend().rmdir(&principal, &parent, name).await
                } else {
                    export.backend().remove(&principal, &parent, name).await
                };
                // Whatever the outcome, the cached link can no longer be trusted
                export.cache().unlink_entry(parent.id(), name);
                result.map_err(status)?;
                forget_if_unlinked(&ctx, &export, &object).await;

                Ok(WccData {
                    before,
                    after: stat(&ctx, &export, &parent).await.ok(),
                })
            })
            .await
    }

    /// RENAME
    pub async fn rename(
        &self,
        request: RequestInfo,
        from_dir_fh: &[u8],
        from_name: &str,
        to_dir_fh: &[u8],
        to_name: &str,
    ) -> Nfs3Result<RenameRes> {
        let ctx = self.pool.acquire(request.clone());
        let source = Some(EntryTarget::new(from_name, EntryIntent::Existing));
        self.resolver
            .resolve_and_resume(ctx, from_dir_fh, source, |ctx| async move {
                let (export, from_parent, object) = resolved_entry(&ctx)?;
                writable(&export)?;

                let mut to_ctx = self.pool.acquire(request);
                let dest = Some(EntryTarget::new(to_name, EntryIntent::Create));
                self.resolver
                    .resolve(&mut to_ctx, to_dir_fh, dest)
                    .await
                    .map_err(Nfs3Status::from)?;
                let (to_export, to_parent) = resolved_parent(&to_ctx)?;
                if to_export.id != export.id {
                    return Err(Nfs3Status::XDev);
                }

                let from_before = stat(&ctx, &export, &from_parent).await.ok();
                let to_before = stat(&ctx, &export, &to_parent).await.ok();
                export
                    .backend()
                    .rename(&ctx.principal(), &from_parent, from_name, &to_parent, to_name)
                    .await
                    .map_err(status)?;

                let cache = export.cache();
                cache.unlink_entry(from_parent.id(), from_name);
                let replaced = cache
                    .unlink_entry(to_parent.id(), to_name)
                    .filter(|id| *id != object.id())
                    .and_then(|id| cache.find(id));
                cache.link_entry(&to_parent, to_name, &object);
                if let Some(replaced) = replaced {
                    forget_if_unlinked(&ctx, &export, &replaced).await;
                }
                debug!("Renamed {} to {} in export {}", from_name, to_name, export.name);

                Ok(RenameRes {
                    from_dir_wcc: WccData {
                        before: from_before,
                        after: stat(&ctx, &export, &from_parent).await.ok(),
                    },
                    to_dir_wcc: WccData {
                        before: to_before,
                        after: stat(&ctx, &export, &to_parent).await.ok(),
                    },
                })
            })
            .await
    }

    /// LINK
    pub async fn link(
        &self,
        request: RequestInfo,
        fh: &[u8],
        dir_fh: &[u8],
        name: &str,
    ) -> Nfs3Result<LinkRes> {
        let ctx = self.pool.acquire(request.clone());
        self.resolver
            .resolve_and_resume(ctx, fh, None, |ctx| async move {
                let (export, object) = resolved_object(&ctx)?;
                writable(&export)?;

                let mut dir_ctx = self.pool.acquire(request);
                let target = Some(EntryTarget::new(name, EntryIntent::Create));
                self.resolver
                    .resolve(&mut dir_ctx, dir_fh, target)
                    .await
                    .map_err(Nfs3Status::from)?;
                let (dir_export, parent) = resolved_parent(&dir_ctx)?;
                if dir_export.id != export.id {
                    return Err(Nfs3Status::XDev);
                }

                let before = stat(&ctx, &export, &parent).await.ok();
                let attrs = export
                    .backend()
                    .link(&ctx.principal(), &object, &parent, name)
                    .await
                    .map_err(status)?;
                export.cache().link_entry(&parent, name, &object);

                Ok(LinkRes {
                    attrs: Some(attrs),
                    dir_wcc: WccData {
                        before,
                        after: stat(&ctx, &export, &parent).await.ok(),
                    },
                })
            })
            .await
    }

    /// READDIR; the root's `.` and `..` always carry fileid 1
    pub async fn readdir(
        &self,
        request: RequestInfo,
        dir_fh: &[u8],
        cookie: u64,
        max_entries: usize,
    ) -> Nfs3Result<ReaddirRes> {
        let ctx = self.pool.acquire(request);
        self.resolver
            .resolve_and_resume(ctx, dir_fh, None, |mut ctx| async move {
                let (export, dir) = resolved_object(&ctx)?;
                if !dir.is_directory() {
                    return Err(Nfs3Status::NotDir);
                }
                let page = export
                    .backend()
                    .readdir(&ctx.principal(), &dir, cookie, max_entries)
                    .await
                    .map_err(status)?;
                let at_root = export.root().is_some_and(|root| root.id() == dir.id());

                ctx.entries_mut().extend(page.entries);
                let entries = ctx
                    .take_entries()
                    .into_iter()
                    .map(|entry| {
                        let fileid = if at_root && (entry.name == "." || entry.name == "..") {
                            ObjectId::ROOT_FILEID
                        } else {
                            entry.fileid
                        };
                        Nfs3DirEntry {
                            fileid,
                            name: entry.name,
                            cookie: entry.cookie,
                        }
                    })
                    .collect();

                Ok(ReaddirRes {
                    entries,
                    eof: page.eof,
                    dir_attrs: stat(&ctx, &export, &dir).await.ok(),
                })
            })
            .await
    }

    /// READDIRPLUS: READDIR plus a handle and attributes per entry
    ///
    /// Children found here are linked into the name cache, so a following
    /// LOOKUP of the same name is served without a backend call.
    pub async fn readdirplus(
        &self,
        request: RequestInfo,
        dir_fh: &[u8],
        cookie: u64,
        max_entries: usize,
    ) -> Nfs3Result<ReaddirPlusRes> {
        let ctx = self.pool.acquire(request);
        self.resolver
            .resolve_and_resume(ctx, dir_fh, None, |mut ctx| async move {
                let (export, dir) = resolved_object(&ctx)?;
                if !dir.is_directory() {
                    return Err(Nfs3Status::NotDir);
                }
                let principal = ctx.principal();
                let page = export
                    .backend()
                    .readdir(&principal, &dir, cookie, max_entries)
                    .await
                    .map_err(status)?;
                let at_root = export.root().is_some_and(|root| root.id() == dir.id());

                ctx.entries_mut().extend(page.entries);
                let mut entries = Vec::with_capacity(ctx.entries_mut().len());
                for entry in ctx.take_entries() {
                    let is_dot = entry.name == "." || entry.name == "..";
                    let child = match entry.name.as_str() {
                        "." => Some((dir.clone(), stat(&ctx, &export, &dir).await.ok())),
                        _ => match export
                            .backend()
                            .lookup_by_name(&principal, &dir, &entry.name)
                            .await
                        {
                            Ok((object, attrs)) => {
                                export.cache().link_entry(&dir, &entry.name, &object);
                                Some((object, Some(attrs)))
                            }
                            Err(err) => {
                                debug!("READDIRPLUS skipped attributes of {}: {}", entry.name, err);
                                None
                            }
                        },
                    };
                    let (fh, mut attrs) = match child {
                        Some((object, attrs)) => (handle_for(&export, &object).ok(), attrs),
                        None => (None, None),
                    };

                    let fileid = if at_root && is_dot {
                        if let Some(attrs) = attrs.as_mut() {
                            attrs.fileid = ObjectId::ROOT_FILEID;
                        }
                        ObjectId::ROOT_FILEID
                    } else {
                        entry.fileid
                    };
                    entries.push(Nfs3DirEntryPlus {
                        fileid,
                        name: entry.name,
                        cookie: entry.cookie,
                        fh,
                        attrs,
                    });
                }

                Ok(ReaddirPlusRes {
                    entries,
                    eof: page.eof,
                    dir_attrs: stat(&ctx, &export, &dir).await.ok(),
                })
            })
            .await
    }

    /// FSSTAT
    pub async fn fsstat(&self, request: RequestInfo, fh: &[u8]) -> Nfs3Result<FsstatRes> {
        let ctx = self.pool.acquire(request);
        self.resolver
            .resolve_and_resume(ctx, fh, None, |ctx| async move {
                let (export, object) = resolved_object(&ctx)?;
                let stats = export
                    .backend()
                    .statfs(&ctx.principal(), &object)
                    .await
                    .map_err(status)?;
                Ok(FsstatRes {
                    attrs: stat(&ctx, &export, &object).await.ok(),
                    stats,
                    invarsec: 0,
                })
            })
            .await
    }

    /// FSINFO; static transfer limits, sent by clients at mount time
    pub async fn fsinfo(&self, request: RequestInfo, fh: &[u8]) -> Nfs3Result<FsinfoRes> {
        let ctx = self.pool.acquire(request);
        self.resolver
            .resolve_and_resume(ctx, fh, None, |ctx| async move {
                let (export, object) = resolved_object(&ctx)?;
                let attrs = stat(&ctx, &export, &object).await?;
                Ok(FsinfoRes {
                    attrs: Some(attrs),
                    rtmax: NFS3_IO_SIZE,
                    rtpref: NFS3_IO_SIZE,
                    rtmult: NFS3_IO_MULTIPLE,
                    wtmax: NFS3_IO_SIZE,
                    wtpref: NFS3_IO_SIZE,
                    wtmult: NFS3_IO_MULTIPLE,
                    dtpref: NFS3_DIR_SIZE,
                    maxfilesize: NFS3_MAX_FILE_SIZE,
                    time_delta: Duration::from_secs(1),
                    properties: FSF3_LINK | FSF3_SYMLINK | FSF3_HOMOGENEOUS | FSF3_CANSETTIME,
                })
            })
            .await
    }

    /// PATHCONF
    pub async fn pathconf(&self, request: RequestInfo, fh: &[u8]) -> Nfs3Result<PathconfRes> {
        let ctx = self.pool.acquire(request);
        self.resolver
            .resolve_and_resume(ctx, fh, None, |ctx| async move {
                let (export, object) = resolved_object(&ctx)?;
                let attrs = stat(&ctx, &export, &object).await?;
                Ok(PathconfRes {
                    attrs: Some(attrs),
                    linkmax: NFS3_LINK_MAX,
                    name_max: NFS3_NAME_MAX,
                    no_trunc: true,
                    chown_restricted: false,
                    case_insensitive: false,
                    case_preserving: true,
                })
            })
            .await
    }
}

fn status(err: BackendError) -> Nfs3Status {
    Nfs3Status::from(NfsError::from(err))
}

fn writable(export: &Export) -> Nfs3Result<()> {
    export.policy.check_writable().map_err(Nfs3Status::from)
}

fn resolved_object(ctx: &CallContext) -> Nfs3Result<(Arc<Export>, ObjectRef)> {
    ctx.resolution().map_err(Nfs3Status::from)?;
    let export = ctx.export().cloned().ok_or(Nfs3Status::Stale)?;
    let object = ctx.location().object.clone().ok_or(Nfs3Status::Stale)?;
    Ok((export, object))
}

fn resolved_parent(ctx: &CallContext) -> Nfs3Result<(Arc<Export>, ObjectRef)> {
    ctx.resolution().map_err(Nfs3Status::from)?;
    let export = ctx.export().cloned().ok_or(Nfs3Status::Stale)?;
    let parent = ctx.location().parent.clone().ok_or(Nfs3Status::Stale)?;
    Ok((export, parent))
}

fn resolved_entry(ctx: &CallContext) -> Nfs3Result<(Arc<Export>, ObjectRef, ObjectRef)> {
    let (export, parent) = resolved_parent(ctx)?;
    let object = ctx.location().object.clone().ok_or(Nfs3Status::NoEnt)?;
    Ok((export, parent, object))
}

async fn stat(ctx: &CallContext, export: &Export, object: &ObjectRef) -> Nfs3Result<Attrs> {
    export
        .backend()
        .stat(&ctx.principal(), object)
        .await
        .map_err(status)
}

/// Drop a removed object from the cache once no link to it remains
async fn forget_if_unlinked(ctx: &CallContext, export: &Export, object: &ObjectRef) {
    match export.backend().stat(&ctx.principal(), object).await {
        Ok(attrs) if attrs.nlink > 0 && !attrs.is_directory() => {}
        _ => export.cache().forget(object.id()),
    }
}

/// Encode the handle a client should use for `object`
fn handle_for(export: &Export, object: &ObjectRef) -> Nfs3Result<Bytes> {
    let is_root = export.root().is_some_and(|root| root.id() == object.id());
    let handle = if is_root {
        export.root_handle()
    } else {
        let flags = if object.is_directory() {
            HandleFlags::DIRECTORY
        } else {
            HandleFlags::NONE
        };
        FileHandle::new(export.id, object.id(), flags)
    };
    encode_file_handle(&handle).map_err(|e| {
        warn!("Failed to encode handle for {}: {}", object.id(), e);
        Nfs3Status::ServerFault
    })
}

/// Apply the attributes the create itself could not set
async fn apply_follow_up(
    ctx: &CallContext,
    export: &Export,
    object: &ObjectRef,
    requested: SetAttrs,
    created: Attrs,
) -> Option<Attrs> {
    let follow_up = SetAttrs {
        mode: None,
        ..requested
    };
    if follow_up.is_empty() {
        return Some(created);
    }
    match export
        .backend()
        .setattr(&ctx.principal(), object, &follow_up)
        .await
    {
        Ok(attrs) => Some(attrs),
        Err(err) => {
            warn!(
                "Created {} but could not apply its attributes: {}",
                object.id(),
                err
            );
            stat(ctx, export, object).await.ok()
        }
    }
}

async fn created_reply(
    ctx: &CallContext,
    export: &Export,
    parent: &ObjectRef,
    object: &ObjectRef,
    attrs: Option<Attrs>,
    before: Option<Attrs>,
) -> Nfs3Result<CreateRes> {
    Ok(CreateRes {
        fh: handle_for(export, object)?,
        attrs,
        dir_wcc: WccData {
            before,
            after: stat(ctx, export, parent).await.ok(),
        },
    })
}
