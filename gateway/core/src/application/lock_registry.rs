// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Lock Registry
//!
//! Long-lived NLM state per caller name: the backend descriptors locks are
//! held through, the cached reverse-RPC client for GRANTED callbacks, the
//! share reservations, and the pending blocking waits that CANCEL can abort.
//!
//! ## Descriptor lifetime
//!
//! Every operation that touches a descriptor holds a [`DescriptorLease`]
//! for its duration. Dropping the last lease closes the descriptor unless a
//! lock is still held through it; the final UNLOCK then closes it instead.
//!
//! ## Locking
//!
//! The client map is a `DashMap`, so unrelated callers never contend. Each
//! client's sets sit behind that client's own mutex. Share reservations are
//! additionally indexed per object; that index is always locked before any
//! client mutex.
//!
//! FREE_ALL detaches a client from the map and marks it forgotten. Requests
//! that fetched the client before that and are still in flight find the
//! mark the next time they touch it and back out instead of attaching new
//! state nobody can release.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Per-caller lock, share and callback state

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::backend::{Backend, Descriptor, ObjectRef, OpenMode, Principal};
use crate::domain::errors::NfsError;
use crate::domain::file_handle::{ExportId, ObjectId};
use crate::domain::lock::{LockOwner, LockRange, ShareAccess, ShareMode, ShareReservation};
use crate::domain::nlm::ReverseClient;

/// Identifies the descriptor a lock owner uses for one object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorKey {
    pub owner: LockOwner,
    pub export_id: ExportId,
    pub object_id: ObjectId,
}

impl DescriptorKey {
    pub fn new(owner: LockOwner, export_id: ExportId, object_id: ObjectId) -> Self {
        Self {
            owner,
            export_id,
            object_id,
        }
    }
}

struct DescriptorEntry {
    fd: Descriptor,
    backend: Arc<dyn Backend>,
    in_flight: usize,
    held: Vec<LockRange>,
}

struct PendingWait {
    id: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct ClientState {
    descriptors: HashMap<DescriptorKey, DescriptorEntry>,
    reverse_rpc: Option<Arc<dyn ReverseClient>>,
    monitored: bool,
    shares: Vec<ShareReservation>,
    pending: HashMap<(DescriptorKey, LockRange), PendingWait>,
    forgotten: bool,
}

/// State kept for one NLM caller name
pub struct LockClient {
    caller_name: String,
    state: Mutex<ClientState>,
}

impl LockClient {
    fn new(caller_name: impl Into<String>) -> Self {
        Self {
            caller_name: caller_name.into(),
            state: Mutex::new(ClientState::default()),
        }
    }

    pub fn caller_name(&self) -> &str {
        &self.caller_name
    }

    pub fn descriptor_count(&self) -> usize {
        self.state.lock().descriptors.len()
    }

    pub fn share_count(&self) -> usize {
        self.state.lock().shares.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Ranges recorded as held through the descriptor for `key`
    pub fn held_ranges(&self, key: &DescriptorKey) -> Vec<LockRange> {
        self.state
            .lock()
            .descriptors
            .get(key)
            .map(|e| e.held.clone())
            .unwrap_or_default()
    }

    /// True once FREE_ALL released this client
    pub fn is_forgotten(&self) -> bool {
        self.state.lock().forgotten
    }

    pub fn is_monitored(&self) -> bool {
        self.state.lock().monitored
    }

    /// Flag the caller as monitored; true only for the first call
    pub fn mark_monitored(&self) -> bool {
        let mut state = self.state.lock();
        !std::mem::replace(&mut state.monitored, true)
    }

    pub fn reverse_rpc(&self) -> Option<Arc<dyn ReverseClient>> {
        self.state.lock().reverse_rpc.clone()
    }

    pub fn set_reverse_rpc(&self, client: Arc<dyn ReverseClient>) {
        self.state.lock().reverse_rpc = Some(client);
    }

    /// Drop a reverse client that failed so the next grant reconnects
    pub fn clear_reverse_rpc(&self) {
        self.state.lock().reverse_rpc = None;
    }

    fn release_descriptor(&self, key: &DescriptorKey) {
        let closing = {
            let mut state = self.state.lock();
            let Some(entry) = state.descriptors.get_mut(key) else {
                return;
            };
            entry.in_flight = entry.in_flight.saturating_sub(1);
            if entry.in_flight == 0 && entry.held.is_empty() {
                state.descriptors.remove(key)
            } else {
                None
            }
        };
        if let Some(entry) = closing {
            debug!(
                "Closing descriptor {} for {} (owner {})",
                entry.fd.id(),
                self.caller_name,
                key.owner
            );
            entry.backend.close(&entry.fd);
        }
    }
}

/// Scoped use of a registered descriptor
///
/// Dropping the lease releases it; see the module docs for when that closes
/// the descriptor.
pub struct DescriptorLease {
    client: Arc<LockClient>,
    key: DescriptorKey,
    fd: Descriptor,
}

impl DescriptorLease {
    pub fn fd(&self) -> &Descriptor {
        &self.fd
    }

    pub fn key(&self) -> &DescriptorKey {
        &self.key
    }

    /// Record that `range` is now locked through this descriptor
    ///
    /// False if the client was released meanwhile; the caller still owns the
    /// backend lock and must undo it.
    #[must_use]
    pub fn note_locked(&self, range: LockRange) -> bool {
        let mut state = self.client.state.lock();
        if state.forgotten {
            return false;
        }
        match state.descriptors.get_mut(&self.key) {
            Some(entry) => {
                entry.held.push(range);
                true
            }
            None => false,
        }
    }

    /// Record that `range` was released
    pub fn note_unlocked(&self, range: LockRange) {
        if let Some(entry) = self.client.state.lock().descriptors.get_mut(&self.key) {
            entry.held = entry
                .held
                .iter()
                .flat_map(|held| held.subtract(&range))
                .collect();
        }
    }
}

impl Drop for DescriptorLease {
    fn drop(&mut self) {
        self.client.release_descriptor(&self.key);
    }
}

/// Registry of [`LockClient`]s keyed by caller name
#[derive(Default)]
pub struct LockRegistry {
    clients: DashMap<String, Arc<LockClient>>,
    shares_by_object: Mutex<HashMap<(ExportId, ObjectId), Vec<ShareReservation>>>,
    next_wait: AtomicU64,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the client for `caller_name`, creating it on first use
    pub fn get_or_create(&self, caller_name: &str) -> Arc<LockClient> {
        self.clients
            .entry(caller_name.to_string())
            .or_insert_with(|| {
                debug!("New lock client: {}", caller_name);
                Arc::new(LockClient::new(caller_name))
            })
            .clone()
    }

    pub fn get(&self, caller_name: &str) -> Option<Arc<LockClient>> {
        self.clients.get(caller_name).map(|c| c.clone())
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Bind `fd` to `key` and lease it
    ///
    /// If another request bound a descriptor for the same key first, that
    /// one is leased and `fd` is closed. A released client takes no new
    /// descriptors: `fd` is closed and `ClientReleased` returned.
    pub fn bind_descriptor(
        &self,
        client: &Arc<LockClient>,
        key: DescriptorKey,
        fd: Descriptor,
        backend: Arc<dyn Backend>,
    ) -> Result<DescriptorLease, NfsError> {
        let (leased, redundant) = {
            let mut state = client.state.lock();
            if state.forgotten {
                drop(state);
                debug!(
                    "Descriptor {} opened for released client {}, closing",
                    fd.id(),
                    client.caller_name
                );
                backend.close(&fd);
                return Err(NfsError::ClientReleased);
            }
            match state.descriptors.get_mut(&key) {
                Some(entry) => {
                    entry.in_flight += 1;
                    (entry.fd.clone(), Some((fd, backend)))
                }
                None => {
                    state.descriptors.insert(
                        key.clone(),
                        DescriptorEntry {
                            fd: fd.clone(),
                            backend,
                            in_flight: 1,
                            held: Vec::new(),
                        },
                    );
                    (fd, None)
                }
            }
        };
        if let Some((fd, backend)) = redundant {
            backend.close(&fd);
        }
        Ok(DescriptorLease {
            client: client.clone(),
            key,
            fd: leased,
        })
    }

    /// Lease the descriptor already bound to `key`, if any
    pub fn lease_descriptor(
        &self,
        client: &Arc<LockClient>,
        key: &DescriptorKey,
    ) -> Option<DescriptorLease> {
        let mut state = client.state.lock();
        let entry = state.descriptors.get_mut(key)?;
        entry.in_flight += 1;
        Some(DescriptorLease {
            client: client.clone(),
            key: key.clone(),
            fd: entry.fd.clone(),
        })
    }

    /// Lease the descriptor for `key`, opening one through `backend` if needed
    pub async fn open_descriptor(
        &self,
        client: &Arc<LockClient>,
        key: DescriptorKey,
        backend: &Arc<dyn Backend>,
        principal: &Principal,
        object: &ObjectRef,
        mode: OpenMode,
    ) -> Result<DescriptorLease, NfsError> {
        if let Some(lease) = self.lease_descriptor(client, &key) {
            return Ok(lease);
        }
        let fd = backend.open(principal, object, mode).await?;
        self.bind_descriptor(client, key, fd, backend.clone())
    }

    /// Register a blocking wait that CANCEL may abort
    ///
    /// The token of a released client comes back already cancelled.
    pub fn register_pending(
        &self,
        client: &LockClient,
        key: DescriptorKey,
        range: LockRange,
    ) -> (u64, CancellationToken) {
        let id = self.next_wait.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let replaced = {
            let mut state = client.state.lock();
            if state.forgotten {
                token.cancel();
                return (id, token);
            }
            state.pending.insert(
                (key, range),
                PendingWait {
                    id,
                    token: token.clone(),
                },
            )
        };
        if let Some(previous) = replaced {
            previous.token.cancel();
        }
        (id, token)
    }

    /// Turn the wait `id` into a held range once the backend granted it
    ///
    /// Both happen under the client mutex, so a CANCEL or FREE_ALL either
    /// sees the wait still pending or sees the range held. False means the
    /// wait was aborted first and the backend lock must be rolled back.
    #[must_use]
    pub fn complete_pending(&self, lease: &DescriptorLease, range: LockRange, id: u64) -> bool {
        let mut state = lease.client.state.lock();
        let slot = (lease.key.clone(), range);
        let live = state
            .pending
            .get(&slot)
            .is_some_and(|w| w.id == id && !w.token.is_cancelled());
        if state.forgotten || !live {
            return false;
        }
        state.pending.remove(&slot);
        match state.descriptors.get_mut(&lease.key) {
            Some(entry) => {
                entry.held.push(range);
                true
            }
            None => false,
        }
    }

    /// Forget the wait `id` once it has finished
    pub fn finish_pending(
        &self,
        client: &LockClient,
        key: &DescriptorKey,
        range: LockRange,
        id: u64,
    ) {
        let mut state = client.state.lock();
        let slot = (key.clone(), range);
        if state.pending.get(&slot).is_some_and(|w| w.id == id) {
            state.pending.remove(&slot);
        }
    }

    /// Abort the pending wait for `(key, range)`; false if there is none
    pub fn cancel_pending(
        &self,
        client: &LockClient,
        key: &DescriptorKey,
        range: LockRange,
    ) -> bool {
        let removed = client.state.lock().pending.remove(&(key.clone(), range));
        match removed {
            Some(wait) => {
                wait.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Grant a share reservation unless an existing one on the object conflicts
    pub fn add_share(
        &self,
        client: &LockClient,
        reservation: ShareReservation,
    ) -> Result<(), NfsError> {
        let key = (reservation.export_id, reservation.object.id());
        let mut by_object = self.shares_by_object.lock();
        let mut state = client.state.lock();
        if state.forgotten {
            return Err(NfsError::ClientReleased);
        }
        let held = by_object.entry(key).or_default();
        if let Some(holder) = held
            .iter()
            .find(|h| h.conflicts_with(reservation.mode, reservation.access))
        {
            debug!(
                "Share for {} denied by {} ({:?}/{:?})",
                client.caller_name, holder.caller_name, holder.mode, holder.access
            );
            return Err(NfsError::Conflict);
        }
        held.push(reservation.clone());
        state.shares.push(reservation);
        Ok(())
    }

    /// Remove the matching reservation from both the object and the client
    ///
    /// Returns false when nothing matched, which callers treat as success.
    pub fn remove_share(
        &self,
        client: &LockClient,
        export_id: ExportId,
        object_id: ObjectId,
        owner: &LockOwner,
        mode: ShareMode,
        access: ShareAccess,
    ) -> bool {
        let mut by_object = self.shares_by_object.lock();
        let Some(held) = by_object.get_mut(&(export_id, object_id)) else {
            return false;
        };
        let Some(pos) = held
            .iter()
            .position(|r| r.caller_name == client.caller_name && r.matches(owner, mode, access))
        else {
            return false;
        };
        held.remove(pos);
        if held.is_empty() {
            by_object.remove(&(export_id, object_id));
        }

        let mut state = client.state.lock();
        if let Some(pos) = state.shares.iter().position(|r| {
            r.export_id == export_id && r.object.id() == object_id && r.matches(owner, mode, access)
        }) {
            state.shares.remove(pos);
        }
        true
    }

    /// Reservations currently attached to an object
    pub fn shares_on(&self, export_id: ExportId, object_id: ObjectId) -> Vec<ShareReservation> {
        self.shares_by_object
            .lock()
            .get(&(export_id, object_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Drop every descriptor, lock, share and pending wait of `caller_name`
    ///
    /// Returns false if the caller was unknown.
    pub fn forget_all(&self, caller_name: &str) -> bool {
        let Some((_, client)) = self.clients.remove(caller_name) else {
            debug!("FREE_ALL for unknown caller {}", caller_name);
            return false;
        };

        let mut by_object = self.shares_by_object.lock();
        let state = {
            let mut state = client.state.lock();
            std::mem::replace(
                &mut *state,
                ClientState {
                    forgotten: true,
                    ..ClientState::default()
                },
            )
        };

        for reservation in &state.shares {
            let key = (reservation.export_id, reservation.object.id());
            if let Some(held) = by_object.get_mut(&key) {
                held.retain(|r| r.caller_name != caller_name);
                if held.is_empty() {
                    by_object.remove(&key);
                }
            }
        }
        drop(by_object);

        for wait in state.pending.values() {
            wait.token.cancel();
        }
        for entry in state.descriptors.values() {
            entry.backend.close(&entry.fd);
        }

        info!(
            "Released all lock state of {}: {} descriptors, {} shares, {} pending waits",
            caller_name,
            state.descriptors.len(),
            state.shares.len(),
            state.pending.len()
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backend::{CreateMode, FileType};
    use crate::domain::lock::{LockKind, LockRequest};
    use crate::infrastructure::InMemoryBackend;

    async fn file(backend: &InMemoryBackend) -> ObjectRef {
        let (root, _) = backend.lookup_root(&Principal::root()).await.unwrap();
        let (file, _) = backend
            .create(&Principal::root(), &root, "f", CreateMode::Unchecked, 0o644)
            .await
            .unwrap();
        file
    }

    fn key(owner: &[u8], object: &ObjectRef) -> DescriptorKey {
        DescriptorKey::new(
            LockOwner::new(owner.to_vec()),
            ExportId::from_name("vol0"),
            object.id(),
        )
    }

    async fn open(
        registry: &LockRegistry,
        client: &Arc<LockClient>,
        key: &DescriptorKey,
        backend: &Arc<dyn Backend>,
        object: &ObjectRef,
    ) -> Result<DescriptorLease, NfsError> {
        registry
            .open_descriptor(
                client,
                key.clone(),
                backend,
                &Principal::root(),
                object,
                OpenMode::ReadWrite,
            )
            .await
    }

    fn reservation(
        caller: &str,
        object: &ObjectRef,
        mode: ShareMode,
        access: ShareAccess,
    ) -> ShareReservation {
        ShareReservation {
            export_id: ExportId::from_name("vol0"),
            object: object.clone(),
            caller_name: caller.to_string(),
            owner: LockOwner::new(caller.as_bytes().to_vec()),
            mode,
            access,
        }
    }

    #[test]
    fn test_get_or_create_is_shared() {
        let registry = LockRegistry::new();
        let a = registry.get_or_create("host-a");
        let b = registry.get_or_create("host-a");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.client_count(), 1);
    }

    #[tokio::test]
    async fn test_descriptor_closed_when_last_lease_drops() {
        let backend = Arc::new(InMemoryBackend::new());
        let dyn_backend: Arc<dyn Backend> = backend.clone();
        let object = file(&backend).await;
        let registry = LockRegistry::new();
        let client = registry.get_or_create("host-a");
        let key = key(b"o1", &object);

        let first = open(&registry, &client, &key, &dyn_backend, &object).await.unwrap();
        let second = open(&registry, &client, &key, &dyn_backend, &object).await.unwrap();
        assert_eq!(first.fd().id(), second.fd().id());
        assert_eq!(backend.open_descriptor_count(), 1);

        drop(first);
        assert_eq!(client.descriptor_count(), 1);
        drop(second);
        assert_eq!(client.descriptor_count(), 0);
        assert_eq!(backend.open_descriptor_count(), 0);
    }

    #[tokio::test]
    async fn test_held_lock_keeps_descriptor_open() {
        let backend = Arc::new(InMemoryBackend::new());
        let dyn_backend: Arc<dyn Backend> = backend.clone();
        let object = file(&backend).await;
        let registry = LockRegistry::new();
        let client = registry.get_or_create("host-a");
        let key = key(b"o1", &object);

        let lease = open(&registry, &client, &key, &dyn_backend, &object).await.unwrap();
        let request = LockRequest {
            owner: key.owner.clone(),
            svid: 1,
            range: LockRange::new(0, 100),
            kind: LockKind::Exclusive,
        };
        backend.lock(lease.fd(), &request, false).await.unwrap();
        assert!(lease.note_locked(request.range));
        drop(lease);
        assert_eq!(client.descriptor_count(), 1);

        let lease = registry.lease_descriptor(&client, &key).unwrap();
        lease.note_unlocked(LockRange::new(0, 50));
        assert_eq!(client.held_ranges(&key), vec![LockRange::new(50, 50)]);
        lease.note_unlocked(LockRange::whole());
        drop(lease);
        assert_eq!(client.descriptor_count(), 0);
    }

    #[test]
    fn test_share_conflict_and_unshare() {
        let registry = LockRegistry::new();
        let object = ObjectRef::new(ObjectId::new(), FileType::Regular);
        let a = registry.get_or_create("host-a");
        let b = registry.get_or_create("host-b");

        let a_read = reservation("host-a", &object, ShareMode::DenyWrite, ShareAccess::Read);
        let b_write = reservation("host-b", &object, ShareMode::DenyNone, ShareAccess::Write);
        let b_read = reservation("host-b", &object, ShareMode::DenyNone, ShareAccess::Read);
        registry.add_share(&a, a_read).unwrap();
        assert_eq!(registry.add_share(&b, b_write), Err(NfsError::Conflict));
        registry.add_share(&b, b_read).unwrap();

        let owner = LockOwner::new(b"host-a".to_vec());
        let export = ExportId::from_name("vol0");
        let id = object.id();
        let (deny_none, deny_write) = (ShareMode::DenyNone, ShareMode::DenyWrite);
        assert!(!registry.remove_share(&a, export, id, &owner, deny_none, ShareAccess::Read));
        assert!(registry.remove_share(&a, export, id, &owner, deny_write, ShareAccess::Read));
        assert_eq!(a.share_count(), 0);
        assert_eq!(registry.shares_on(export, object.id()).len(), 1);
    }

    #[test]
    fn test_cancel_pending() {
        let registry = LockRegistry::new();
        let client = registry.get_or_create("host-a");
        let object = ObjectRef::new(ObjectId::new(), FileType::Regular);
        let key = key(b"o1", &object);
        let range = LockRange::new(0, 10);

        let (_, token) = registry.register_pending(&client, key.clone(), range);
        assert!(registry.cancel_pending(&client, &key, range));
        assert!(token.is_cancelled());
        assert!(!registry.cancel_pending(&client, &key, range));
    }

    #[tokio::test]
    async fn test_forget_all_clears_client() {
        let backend = Arc::new(InMemoryBackend::new());
        let dyn_backend: Arc<dyn Backend> = backend.clone();
        let object = file(&backend).await;
        let registry = LockRegistry::new();
        let client = registry.get_or_create("host-a");
        let key = key(b"o1", &object);

        let lease = open(&registry, &client, &key, &dyn_backend, &object).await.unwrap();
        assert!(lease.note_locked(LockRange::whole()));
        drop(lease);
        let share = reservation("host-a", &object, ShareMode::DenyRead, ShareAccess::Read);
        registry.add_share(&client, share).unwrap();
        let (_, token) = registry.register_pending(&client, key, LockRange::new(5, 5));

        assert!(registry.forget_all("host-a"));
        assert!(token.is_cancelled());
        assert_eq!(backend.open_descriptor_count(), 0);
        assert!(registry.shares_on(ExportId::from_name("vol0"), object.id()).is_empty());

        let fresh = registry.get_or_create("host-a");
        assert_eq!(fresh.descriptor_count(), 0);
        assert_eq!(fresh.share_count(), 0);
        assert!(!registry.forget_all("host-b"));
    }

    #[tokio::test]
    async fn test_released_client_takes_no_new_state() {
        let backend = Arc::new(InMemoryBackend::new());
        let dyn_backend: Arc<dyn Backend> = backend.clone();
        let object = file(&backend).await;
        let registry = LockRegistry::new();
        let client = registry.get_or_create("host-a");
        let key = key(b"o1", &object);

        // A request that fetched the client before FREE_ALL is still running
        assert!(registry.forget_all("host-a"));
        assert!(client.is_forgotten());

        let fd = dyn_backend
            .open(&Principal::root(), &object, OpenMode::ReadWrite)
            .await
            .unwrap();
        let bound = registry.bind_descriptor(&client, key.clone(), fd, dyn_backend.clone());
        assert!(matches!(bound, Err(NfsError::ClientReleased)));
        assert_eq!(backend.open_descriptor_count(), 0);
        assert_eq!(client.descriptor_count(), 0);

        let share = reservation("host-a", &object, ShareMode::DenyWrite, ShareAccess::Read);
        assert_eq!(registry.add_share(&client, share), Err(NfsError::ClientReleased));
        assert!(registry.shares_on(ExportId::from_name("vol0"), object.id()).is_empty());

        let (_, token) = registry.register_pending(&client, key, LockRange::whole());
        assert!(token.is_cancelled());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_complete_pending_records_held_range() {
        let backend = Arc::new(InMemoryBackend::new());
        let dyn_backend: Arc<dyn Backend> = backend.clone();
        let object = file(&backend).await;
        let registry = LockRegistry::new();
        let client = registry.get_or_create("host-a");
        let key = key(b"o1", &object);
        let range = LockRange::new(0, 10);

        let lease = open(&registry, &client, &key, &dyn_backend, &object).await.unwrap();
        let (id, _token) = registry.register_pending(&client, key.clone(), range);
        assert!(registry.complete_pending(&lease, range, id));
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.held_ranges(&key), vec![range]);

        // Already completed: a second completion finds nothing pending
        assert!(!registry.complete_pending(&lease, range, id));
        assert_eq!(client.held_ranges(&key), vec![range]);
    }

    #[tokio::test]
    async fn test_cancel_before_completion_wins() {
        let backend = Arc::new(InMemoryBackend::new());
        let dyn_backend: Arc<dyn Backend> = backend.clone();
        let object = file(&backend).await;
        let registry = LockRegistry::new();
        let client = registry.get_or_create("host-a");
        let key = key(b"o1", &object);
        let range = LockRange::new(0, 10);

        let lease = open(&registry, &client, &key, &dyn_backend, &object).await.unwrap();
        let (id, _token) = registry.register_pending(&client, key.clone(), range);
        assert!(registry.cancel_pending(&client, &key, range));
        assert!(!registry.complete_pending(&lease, range, id));
        assert!(client.held_ranges(&key).is_empty());

        drop(lease);
        assert_eq!(client.descriptor_count(), 0);
    }

    #[tokio::test]
    async fn test_note_locked_after_release() {
        let backend = Arc::new(InMemoryBackend::new());
        let dyn_backend: Arc<dyn Backend> = backend.clone();
        let object = file(&backend).await;
        let registry = LockRegistry::new();
        let client = registry.get_or_create("host-a");
        let key = key(b"o1", &object);

        let lease = open(&registry, &client, &key, &dyn_backend, &object).await.unwrap();
        registry.forget_all("host-a");
        assert!(!lease.note_locked(LockRange::whole()));
        assert!(client.held_ranges(&key).is_empty());
    }
}
