// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Handle Resolver
//!
//! Turns the opaque handle of an incoming call (and, for directory
//! operations, a child name) into live backend objects, then hands the
//! call context to the procedure's continuation.
//!
//! Resolution order:
//! 1. Decode the handle; malformed bytes are `BadHandle`
//! 2. Find the export; an unknown id is `StaleHandle`
//! 3. Warm the export root if this is its first use
//! 4. Soft path: serve the object (or `parent/name` link) from the cache
//! 5. Hard path: ask the backend by id or by name and link the result
//!
//! Whatever the outcome, the continuation runs exactly once. A failure is
//! recorded on the context for the continuation to report.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** File handle to live object resolution

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use crate::application::call_context::CallContext;
use crate::application::export_table::{Export, ExportTable};
use crate::domain::backend::{BackendError, ObjectRef, Principal};
use crate::domain::errors::NfsError;
use crate::domain::file_handle::{FileHandle, ObjectId};
use crate::infrastructure::nfs::decode_file_handle;
use crate::infrastructure::object_cache::EntryFill;

/// What the continuation intends to do with a named child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryIntent {
    /// LOOKUP: a cached link past its timeout is revalidated
    Lookup,
    /// The child must exist; any cached link is trusted
    Existing,
    /// The child is about to be created; only the parent matters
    Create,
}

/// Parent-relative part of a resolution request
#[derive(Debug, Clone, Copy)]
pub struct EntryTarget<'a> {
    pub name: &'a str,
    pub intent: EntryIntent,
}

impl<'a> EntryTarget<'a> {
    pub fn new(name: &'a str, intent: EntryIntent) -> Self {
        Self { name, intent }
    }
}

#[derive(Clone)]
pub struct Resolver {
    exports: ExportTable,
}

impl Resolver {
    pub fn new(exports: ExportTable) -> Self {
        Self { exports }
    }

    pub fn exports(&self) -> &ExportTable {
        &self.exports
    }

    /// Resolve `fh` (and optionally a child of it) and resume the call.
    ///
    /// # Arguments
    /// * `ctx` - Context of the call being served
    /// * `fh` - Raw handle bytes from the request
    /// * `entry` - Child name and intent for directory operations
    /// * `continuation` - Procedure body; runs exactly once, success or not
    pub async fn resolve_and_resume<F, Fut, T>(
        &self,
        mut ctx: CallContext,
        fh: &[u8],
        entry: Option<EntryTarget<'_>>,
        continuation: F,
    ) -> T
    where
        F: FnOnce(CallContext) -> Fut,
        Fut: Future<Output = T>,
    {
        if let Err(err) = self.resolve(&mut ctx, fh, entry).await {
            debug!("Resolution failed: {}", err);
            ctx.fail(err);
        }
        continuation(ctx).await
    }

    /// Fill the context's location for `fh`, without resuming
    pub async fn resolve(
        &self,
        ctx: &mut CallContext,
        fh: &[u8],
        entry: Option<EntryTarget<'_>>,
    ) -> Result<(), NfsError> {
        let handle = decode_file_handle(fh)?;
        ctx.set_handle(handle);

        let export = self.exports.lookup(handle.export_id)?;
        ctx.set_export(export.clone());

        let principal = ctx.principal();
        let root = self.exports.warm_root(&export, &principal).await?;

        match entry {
            None => self.resolve_object(ctx, &export, &root, &handle, &principal).await,
            Some(target) => {
                self.resolve_entry(ctx, &export, &root, &handle, target, &principal)
                    .await
            }
        }
    }

    async fn resolve_object(
        &self,
        ctx: &mut CallContext,
        export: &Arc<Export>,
        root: &ObjectRef,
        handle: &FileHandle,
        principal: &Principal,
    ) -> Result<(), NfsError> {
        let location = ctx.location_mut();
        location.path = gfid_path(handle.object_id);

        if handle.is_root() {
            location.object = Some(root.clone());
            return Ok(());
        }

        if let Some(object) = export.cache().find(handle.object_id) {
            debug!("Soft resolved {}", handle);
            location.object = Some(object);
            return Ok(());
        }

        let (object, attrs) = hard_resolve(export, root, handle.object_id, principal).await?;
        let location = ctx.location_mut();
        location.object = Some(object);
        location.attrs = Some(attrs);
        Ok(())
    }

    async fn resolve_entry(
        &self,
        ctx: &mut CallContext,
        export: &Arc<Export>,
        root: &ObjectRef,
        handle: &FileHandle,
        target: EntryTarget<'_>,
        principal: &Principal,
    ) -> Result<(), NfsError> {
        let name = target.name;
        let parent_id = if handle.is_root() {
            root.id()
        } else {
            handle.object_id
        };
        {
            let location = ctx.location_mut();
            location.path = format!("{}/{}", gfid_path(handle.object_id), name);
            location.name = Some(name.to_string());
        }

        // The root has no parent inside the export
        if handle.is_root() && (name == ".." || name == ".") {
            let location = ctx.location_mut();
            location.parent = Some(root.clone());
            location.object = Some(root.clone());
            return Ok(());
        }

        let cache = export.cache();
        let mut restarted = false;
        let mut parent_fetched = false;

        loop {
            match cache.fill_entry(parent_id, name) {
                EntryFill::Resolved {
                    parent,
                    child,
                    fresh,
                } => {
                    if fresh || target.intent != EntryIntent::Lookup {
                        set_entry(ctx, parent, Some(child), None);
                        return Ok(());
                    }

                    match export.backend().lookup_by_name(principal, &parent, name).await {
                        Ok((object, attrs)) if object.id() == child.id() => {
                            cache.link_entry(&parent, name, &object);
                            set_entry(ctx, parent, Some(object), Some(attrs));
                            return Ok(());
                        }
                        Ok(_) | Err(BackendError::NotFound) | Err(BackendError::Stale)
                            if !restarted =>
                        {
                            info!(
                                "Cached entry {} under {} went stale, looking it up afresh",
                                name, parent_id
                            );
                            cache.unlink_entry(parent_id, name);
                            restarted = true;
                        }
                        Ok((object, attrs)) => {
                            cache.link_entry(&parent, name, &object);
                            set_entry(ctx, parent, Some(object), Some(attrs));
                            return Ok(());
                        }
                        Err(err) => return Err(entry_error(err, name)),
                    }
                }
                EntryFill::NeedsLookup { parent } => {
                    if target.intent == EntryIntent::Create {
                        set_entry(ctx, parent, None, None);
                        return Ok(());
                    }
                    let (object, attrs) = export
                        .backend()
                        .lookup_by_name(principal, &parent, name)
                        .await
                        .map_err(|e| entry_error(e, name))?;
                    cache.link_entry(&parent, name, &object);
                    set_entry(ctx, parent, Some(object), Some(attrs));
                    return Ok(());
                }
                EntryFill::ParentUnresolved => {
                    if parent_fetched {
                        return Err(NfsError::StaleHandle);
                    }
                    hard_resolve(export, root, parent_id, principal).await?;
                    parent_fetched = true;
                }
            }
        }
    }
}

/// Backend lookup by id, linking the result into the export cache
async fn hard_resolve(
    export: &Export,
    root: &ObjectRef,
    id: ObjectId,
    principal: &Principal,
) -> Result<(ObjectRef, crate::domain::backend::Attrs), NfsError> {
    debug!("Hard resolving {} in export {}", id, export.name);
    let (object, attrs) = export
        .backend()
        .lookup_by_id(principal, root, id)
        .await
        .map_err(|e| match e {
            BackendError::NotFound | BackendError::Stale => NfsError::StaleHandle,
            other => NfsError::from(other),
        })?;
    export.cache().link_object(&object);
    Ok((object, attrs))
}

fn set_entry(
    ctx: &mut CallContext,
    parent: ObjectRef,
    child: Option<ObjectRef>,
    attrs: Option<crate::domain::backend::Attrs>,
) {
    let location = ctx.location_mut();
    location.parent = Some(parent);
    location.object = child;
    location.attrs = attrs;
}

fn entry_error(err: BackendError, name: &str) -> NfsError {
    match err {
        BackendError::NotFound => NfsError::NotFound(name.to_string()),
        other => NfsError::from(other),
    }
}

fn gfid_path(id: ObjectId) -> String {
    format!("<gfid:{}>", id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::call_context::CallContextPool;
    use crate::domain::backend::{Backend, CreateMode, RequestInfo};
    use crate::domain::export::ExportPolicy;
    use crate::domain::file_handle::ExportId;
    use crate::infrastructure::nfs::encode_file_handle;
    use crate::infrastructure::InMemoryBackend;
    use std::time::Duration;

    struct Fixture {
        resolver: Resolver,
        pool: CallContextPool,
        backend: Arc<InMemoryBackend>,
        export: Arc<Export>,
    }

    fn fixture(entry_timeout: Duration) -> Fixture {
        let backend = Arc::new(InMemoryBackend::new());
        let table = ExportTable::new();
        let export = table.register(Export::new(
            ExportId::from_name("vol0"),
            "vol0",
            ExportPolicy::default(),
            backend.clone(),
            entry_timeout,
        ));
        Fixture {
            resolver: Resolver::new(table),
            pool: CallContextPool::new(8),
            backend,
            export,
        }
    }

    fn request() -> RequestInfo {
        RequestInfo::new(7, Principal::root(), "10.0.0.2:800".parse().unwrap())
    }

    #[tokio::test]
    async fn test_bad_handle_still_resumes() {
        let fx = fixture(Duration::from_secs(60));
        let ctx = fx.pool.acquire(request());
        let err = fx
            .resolver
            .resolve_and_resume(ctx, b"short", None, |ctx| async move { ctx.resolution() })
            .await;
        assert!(matches!(err, Err(NfsError::BadHandle(_))));
        assert_eq!(fx.pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_root_handle_resolves_after_warm() {
        let fx = fixture(Duration::from_secs(60));
        let fh = encode_file_handle(&fx.export.root_handle()).unwrap();
        let ctx = fx.pool.acquire(request());
        let object = fx
            .resolver
            .resolve_and_resume(ctx, &fh, None, |ctx| async move {
                ctx.location().object.clone()
            })
            .await;
        assert!(object.unwrap().id().is_root());
        assert_eq!(fx.backend.calls().lookup_root, 1);
    }

    #[tokio::test]
    async fn test_dotdot_of_root_is_root() {
        let fx = fixture(Duration::from_secs(60));
        let fh = encode_file_handle(&fx.export.root_handle()).unwrap();
        let ctx = fx.pool.acquire(request());
        let target = Some(EntryTarget::new("..", EntryIntent::Lookup));
        let object = fx
            .resolver
            .resolve_and_resume(ctx, &fh, target, |ctx| async move {
                ctx.location().object.clone()
            })
            .await;
        assert!(object.unwrap().id().is_root());
        assert_eq!(fx.backend.calls().lookup_by_name, 0);
    }

    #[tokio::test]
    async fn test_create_intent_skips_child_lookup() {
        let fx = fixture(Duration::from_secs(60));
        let fh = encode_file_handle(&fx.export.root_handle()).unwrap();
        let ctx = fx.pool.acquire(request());
        let target = Some(EntryTarget::new("new-file", EntryIntent::Create));
        let (parent, child) = fx
            .resolver
            .resolve_and_resume(ctx, &fh, target, |ctx| async move {
                (
                    ctx.location().parent.clone(),
                    ctx.location().object.clone(),
                )
            })
            .await;
        assert!(parent.is_some());
        assert!(child.is_none());
        assert_eq!(fx.backend.calls().lookup_by_name, 0);
    }

    #[tokio::test]
    async fn test_replaced_entry_is_looked_up_afresh() {
        let fx = fixture(Duration::ZERO);
        let principal = Principal::root();
        let (root, _) = fx.backend.lookup_root(&principal).await.unwrap();
        let (first, _) = fx
            .backend
            .create(&principal, &root, "f", CreateMode::Unchecked, 0o644)
            .await
            .unwrap();

        let fh = encode_file_handle(&fx.export.root_handle()).unwrap();
        let lookup = |fx: &Fixture| {
            let ctx = fx.pool.acquire(request());
            let resolver = fx.resolver.clone();
            let fh = fh.clone();
            async move {
                resolver
                    .resolve_and_resume(
                        ctx,
                        &fh,
                        Some(EntryTarget::new("f", EntryIntent::Lookup)),
                        |ctx| async move { ctx.location().object.clone() },
                    )
                    .await
            }
        };

        assert_eq!(lookup(&fx).await.unwrap().id(), first.id());

        fx.backend.remove(&principal, &root, "f").await.unwrap();
        let (second, _) = fx
            .backend
            .create(&principal, &root, "f", CreateMode::Unchecked, 0o644)
            .await
            .unwrap();

        assert_eq!(lookup(&fx).await.unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn test_unknown_object_is_stale() {
        let fx = fixture(Duration::from_secs(60));
        let handle = fx.export.root_handle().child(ObjectId::new(), false);
        let fh = encode_file_handle(&handle).unwrap();
        let ctx = fx.pool.acquire(request());
        let result = fx
            .resolver
            .resolve_and_resume(ctx, &fh, None, |ctx| async move { ctx.resolution() })
            .await;
        assert_eq!(result, Err(NfsError::StaleHandle));
        assert_eq!(fx.backend.calls().lookup_by_id, 1);
    }
}
