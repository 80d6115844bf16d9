// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Export Table
//!
//! Maps the export id embedded in every file handle to the backend mount
//! serving it, its access policy, its root object and its object cache.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Export lookup and root warm-up
//! - Exports are registered once at startup from configuration
//! - An unknown export id is reported as a stale handle: clients may still
//!   hold handles for exports that have since been removed
//! - Each export's root is warmed by a single backend lookup on first use

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::domain::backend::{Backend, ObjectRef, Principal};
use crate::domain::config::GatewayConfigSpec;
use crate::domain::errors::NfsError;
use crate::domain::export::ExportPolicy;
use crate::domain::file_handle::{ExportId, FileHandle};
use crate::infrastructure::create_backend;
use crate::infrastructure::object_cache::ObjectCache;

/// One exported backend mount
pub struct Export {
    pub id: ExportId,
    pub name: String,
    pub policy: ExportPolicy,
    backend: Arc<dyn Backend>,
    root: OnceCell<ObjectRef>,
    cache: ObjectCache,
}

impl Export {
    pub fn new(
        id: ExportId,
        name: impl Into<String>,
        policy: ExportPolicy,
        backend: Arc<dyn Backend>,
        entry_timeout: Duration,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            policy,
            backend,
            root: OnceCell::new(),
            cache: ObjectCache::new(entry_timeout),
        }
    }

    /// Bound the export's object cache to `max_objects`
    pub fn with_cache_capacity(mut self, max_objects: usize) -> Self {
        self.cache = ObjectCache::with_capacity(self.cache.entry_timeout(), max_objects);
        self
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    /// True once the root has been looked up; never reset afterwards.
    pub fn root_warmed(&self) -> bool {
        self.root.initialized()
    }

    pub fn root(&self) -> Option<ObjectRef> {
        self.root.get().cloned()
    }

    pub fn root_handle(&self) -> FileHandle {
        FileHandle::root(self.id)
    }

    /// Look up the export root exactly once.
    ///
    /// Concurrent first callers wait on the same lookup. A failed lookup
    /// leaves the export cold so the next caller tries again.
    pub async fn warm_root(&self, principal: &Principal) -> Result<ObjectRef, NfsError> {
        let root = self
            .root
            .get_or_try_init(|| async {
                let (root, _attrs) = self.backend.lookup_root(principal).await.map_err(|e| {
                    warn!("Root lookup failed for export {}: {}", self.name, e);
                    NfsError::from(e)
                })?;
                self.cache.link_object(&root);
                info!("Warmed root of export {} ({})", self.name, self.id);
                Ok::<_, NfsError>(root)
            })
            .await?;
        Ok(root.clone())
    }
}

/// Export registry keyed by export id
///
/// Thread-safe with RwLock; lookups vastly outnumber registrations.
#[derive(Clone, Default)]
pub struct ExportTable {
    exports: Arc<RwLock<HashMap<ExportId, Arc<Export>>>>,
}

impl ExportTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the table from configuration, creating one backend per export
    pub fn from_config(spec: &GatewayConfigSpec) -> anyhow::Result<Self> {
        let table = Self::new();
        for config in &spec.exports {
            let export = Export::new(
                config.export_id()?,
                config.name.clone(),
                config.policy(),
                create_backend(&config.backend),
                spec.cache.entry_timeout(),
            )
            .with_cache_capacity(spec.cache.max_objects);
            table.register(export);
        }
        Ok(table)
    }

    /// Register an export
    pub fn register(&self, export: Export) -> Arc<Export> {
        let export = Arc::new(export);
        self.exports.write().insert(export.id, export.clone());
        debug!("Registered export: name={}, id={}", export.name, export.id);
        export
    }

    /// Deregister an export; handles referencing it become stale
    pub fn deregister(&self, id: ExportId) -> Option<Arc<Export>> {
        let removed = self.exports.write().remove(&id);
        debug!("Deregistered export: id={}", id);
        removed
    }

    /// Find the export for `id`
    ///
    /// # Returns
    /// * `Ok(Arc<Export>)` - The export
    /// * `Err(NfsError::StaleHandle)` - No such export (never `BadHandle`)
    pub fn lookup(&self, id: ExportId) -> Result<Arc<Export>, NfsError> {
        self.exports
            .read()
            .get(&id)
            .cloned()
            .ok_or(NfsError::StaleHandle)
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<Export>> {
        self.exports.read().values().find(|e| e.name == name).cloned()
    }

    /// Warm the root of `export`; a no-op after the first success
    pub async fn warm_root(
        &self,
        export: &Export,
        principal: &Principal,
    ) -> Result<ObjectRef, NfsError> {
        export.warm_root(principal).await
    }

    /// All exports, sorted by name
    pub fn list(&self) -> Vec<Arc<Export>> {
        let mut exports: Vec<_> = self.exports.read().values().cloned().collect();
        exports.sort_by(|a, b| a.name.cmp(&b.name));
        exports
    }

    pub fn count(&self) -> usize {
        self.exports.read().len()
    }
}
