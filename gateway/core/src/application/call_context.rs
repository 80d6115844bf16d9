// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Call Contexts
//!
//! One [`CallContext`] carries the state of one in-flight RPC request: the
//! request itself, the targeted export, the resolved location and the
//! scratch space a procedure needs between backend calls.
//!
//! Contexts come from a [`CallContextPool`] and go back to it when dropped,
//! so release happens exactly once on every exit path without the handler
//! having to remember it.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Pooled per-request state

use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::application::export_table::Export;
use crate::domain::backend::{Attrs, DirEntry, ObjectRef, Principal, RequestInfo};
use crate::domain::errors::NfsError;
use crate::domain::file_handle::FileHandle;

/// Where a handle (plus optional child name) resolved to.
///
/// With `name` set this is an entry resolution; `object` is then the child,
/// or `None` when a create-style caller skipped the child lookup.
#[derive(Debug, Clone, Default)]
pub struct ResolvedLocation {
    pub path: String,
    pub object: Option<ObjectRef>,
    pub parent: Option<ObjectRef>,
    pub name: Option<String>,
    /// Attributes observed while resolving, if any backend call produced them
    pub attrs: Option<Attrs>,
}

impl ResolvedLocation {
    pub fn is_entry(&self) -> bool {
        self.name.is_some()
    }

    fn clear(&mut self) {
        self.path.clear();
        self.object = None;
        self.parent = None;
        self.name = None;
        self.attrs = None;
    }
}

#[derive(Default)]
struct CallState {
    request: Option<RequestInfo>,
    export: Option<Arc<Export>>,
    handle: Option<FileHandle>,
    location: ResolvedLocation,
    resolve_error: Option<NfsError>,
    pre_attrs: Option<Attrs>,
    entries: Vec<DirEntry>,
    buffer: BytesMut,
}

impl CallState {
    /// Drop every reference and zero the scratch fields, keeping buffer capacity.
    fn reset(&mut self) {
        self.request = None;
        self.export = None;
        self.handle = None;
        self.location.clear();
        self.resolve_error = None;
        self.pre_attrs = None;
        self.entries.clear();
        self.buffer.clear();
    }
}

struct PoolInner {
    free: Mutex<Vec<CallState>>,
    capacity: usize,
    outstanding: AtomicUsize,
}

/// Pool of reusable call states
#[derive(Clone)]
pub struct CallContextPool {
    inner: Arc<PoolInner>,
}

impl CallContextPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::with_capacity(capacity)),
                capacity,
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Take a zeroed context for `request`
    pub fn acquire(&self, request: RequestInfo) -> CallContext {
        let mut state = self.inner.free.lock().pop().unwrap_or_default();
        state.request = Some(request);
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        CallContext {
            state,
            pool: self.inner.clone(),
        }
    }

    /// Contexts acquired and not yet released
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Released contexts waiting for reuse
    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }
}

/// Per-request state; returned to its pool on drop
pub struct CallContext {
    state: CallState,
    pool: Arc<PoolInner>,
}

impl CallContext {
    pub fn request(&self) -> Option<&RequestInfo> {
        self.state.request.as_ref()
    }

    /// Caller identity; an anonymous principal if none was attached
    pub fn principal(&self) -> Principal {
        self.state
            .request
            .as_ref()
            .map(|r| r.principal.clone())
            .unwrap_or_else(|| Principal::new(u32::MAX - 1, u32::MAX - 1))
    }

    pub fn export(&self) -> Option<&Arc<Export>> {
        self.state.export.as_ref()
    }

    pub fn set_export(&mut self, export: Arc<Export>) {
        self.state.export = Some(export);
    }

    pub fn handle(&self) -> Option<&FileHandle> {
        self.state.handle.as_ref()
    }

    pub fn set_handle(&mut self, handle: FileHandle) {
        self.state.handle = Some(handle);
    }

    pub fn location(&self) -> &ResolvedLocation {
        &self.state.location
    }

    pub fn location_mut(&mut self) -> &mut ResolvedLocation {
        &mut self.state.location
    }

    /// Record a failed resolution for the continuation to report
    pub fn fail(&mut self, err: NfsError) {
        self.state.resolve_error = Some(err);
    }

    pub fn resolve_failed(&self) -> bool {
        self.state.resolve_error.is_some()
    }

    /// Outcome of resolution as a `Result`
    pub fn resolution(&self) -> Result<(), NfsError> {
        match &self.state.resolve_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    pub fn pre_attrs(&self) -> Option<&Attrs> {
        self.state.pre_attrs.as_ref()
    }

    pub fn set_pre_attrs(&mut self, attrs: Attrs) {
        self.state.pre_attrs = Some(attrs);
    }

    pub fn entries_mut(&mut self) -> &mut Vec<DirEntry> {
        &mut self.state.entries
    }

    pub fn take_entries(&mut self) -> Vec<DirEntry> {
        std::mem::take(&mut self.state.entries)
    }

    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.state.buffer
    }
}

impl Drop for CallContext {
    fn drop(&mut self) {
        let mut state = std::mem::take(&mut self.state);
        state.reset();
        {
            let mut free = self.pool.free.lock();
            if free.len() < self.pool.capacity {
                free.push(state);
            }
        }
        self.pool.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}
