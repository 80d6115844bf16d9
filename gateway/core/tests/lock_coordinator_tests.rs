// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Integration tests for the NLM4 lock coordinator
//!
//! These tests verify:
//! 1. Grace period gate precedence over handle validation
//! 2. TEST / LOCK / UNLOCK against the in-memory backend
//! 3. Blocking LOCK followed by GRANTED, or by CANCEL
//! 4. CANCEL arriving after the GRANTED callback undoes the grant
//! 5. SHARE / UNSHARE conflict handling
//! 6. FREE_ALL clearing all per-client state, including a LOCK still
//!    waiting on its backend open

use async_trait::async_trait;
use bytes::Bytes;
use nfs3_gateway_core::application::{
    CallContextPool, Export, ExportTable, GracePeriod, LockCoordinator, LockRegistry, Resolver,
};
use nfs3_gateway_core::domain::backend::{Backend, CreateMode, ObjectRef, Principal, RequestInfo};
use nfs3_gateway_core::domain::errors::Nlm4Stat;
use nfs3_gateway_core::domain::export::ExportPolicy;
use nfs3_gateway_core::domain::file_handle::ExportId;
use nfs3_gateway_core::domain::lock::{LockOwner, ShareAccess, ShareMode};
use nfs3_gateway_core::domain::nlm::{
    HostMonitor, Nlm4CancelArgs, Nlm4GrantedArgs, Nlm4Lock, Nlm4LockArgs, Nlm4Notify,
    Nlm4Share, Nlm4ShareArgs, Nlm4TestArgs, Nlm4UnlockArgs, ReverseChannel, ReverseClient,
    ReverseRpcError,
};
use nfs3_gateway_core::infrastructure::nfs::encode_file_handle;
use nfs3_gateway_core::infrastructure::InMemoryBackend;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

// Mock reverse channel recording every GRANTED callback
#[derive(Default)]
struct MockReverseChannel {
    connects: Mutex<Vec<(SocketAddr, String)>>,
    granted: Arc<Mutex<Vec<Nlm4GrantedArgs>>>,
}

struct MockReverseClient {
    granted: Arc<Mutex<Vec<Nlm4GrantedArgs>>>,
}

#[async_trait]
impl ReverseClient for MockReverseClient {
    async fn send_granted(&self, args: &Nlm4GrantedArgs) -> Result<(), ReverseRpcError> {
        self.granted.lock().push(args.clone());
        Ok(())
    }
}

#[async_trait]
impl ReverseChannel for MockReverseChannel {
    async fn open_reverse_client(
        &self,
        peer: SocketAddr,
        caller_name: &str,
    ) -> Result<Arc<dyn ReverseClient>, ReverseRpcError> {
        self.connects.lock().push((peer, caller_name.to_string()));
        Ok(Arc::new(MockReverseClient {
            granted: self.granted.clone(),
        }))
    }
}

// Mock host monitor recording registrations
#[derive(Default)]
struct MockHostMonitor {
    monitored: Mutex<Vec<String>>,
}

#[async_trait]
impl HostMonitor for MockHostMonitor {
    async fn monitor(&self, caller_name: &str) -> Result<(), ReverseRpcError> {
        self.monitored.lock().push(caller_name.to_string());
        Ok(())
    }
}

struct Harness {
    coordinator: LockCoordinator,
    backend: Arc<InMemoryBackend>,
    reverse: Arc<MockReverseChannel>,
    monitor: Arc<MockHostMonitor>,
    file: ObjectRef,
    file_fh: Bytes,
}

async fn harness(grace: Duration) -> Harness {
    let backend = Arc::new(InMemoryBackend::new());
    let table = ExportTable::new();
    let export = table.register(Export::new(
        ExportId::from_name("vol0"),
        "vol0",
        ExportPolicy::default(),
        backend.clone(),
        Duration::from_secs(60),
    ));
    let principal = Principal::root();
    let (root, _) = backend.lookup_root(&principal).await.unwrap();
    let (file, _) = backend
        .create(&principal, &root, "shared.db", CreateMode::Unchecked, 0o666)
        .await
        .unwrap();
    let file_fh = encode_file_handle(&export.root_handle().child(file.id(), false)).unwrap();

    let reverse = Arc::new(MockReverseChannel::default());
    let monitor = Arc::new(MockHostMonitor::default());
    let coordinator = LockCoordinator::new(
        Resolver::new(table),
        CallContextPool::new(16),
        Arc::new(LockRegistry::new()),
        GracePeriod::new(grace),
        reverse.clone(),
        monitor.clone(),
    );
    Harness {
        coordinator,
        backend,
        reverse,
        monitor,
        file,
        file_fh,
    }
}

fn request() -> RequestInfo {
    RequestInfo::new(9, Principal::new(1000, 1000), "10.1.0.5:1023".parse().unwrap())
}

fn nlm_lock(fh: &Bytes, caller: &str, owner: &[u8], offset: u64, len: u64) -> Nlm4Lock {
    Nlm4Lock {
        caller_name: caller.to_string(),
        fh: fh.clone(),
        owner: LockOwner::new(owner.to_vec()),
        svid: 4242,
        offset,
        len,
    }
}

fn lock_args(lock: Nlm4Lock, block: bool) -> Nlm4LockArgs {
    Nlm4LockArgs {
        cookie: Bytes::from_static(b"c1"),
        block,
        exclusive: true,
        lock,
        reclaim: false,
        state: 1,
    }
}

fn share_args(fh: &Bytes, caller: &str, mode: ShareMode, access: ShareAccess) -> Nlm4ShareArgs {
    Nlm4ShareArgs {
        cookie: Bytes::from_static(b"s1"),
        share: Nlm4Share {
            caller_name: caller.to_string(),
            fh: fh.clone(),
            owner: LockOwner::new(caller.as_bytes().to_vec()),
            mode,
            access,
        },
        reclaim: false,
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

#[tokio::test]
async fn test_grace_period_checked_before_handle() {
    let h = harness(Duration::from_secs(50)).await;
    let junk = Bytes::from_static(b"not-a-handle");

    let res = h
        .coordinator
        .lock(request(), lock_args(nlm_lock(&junk, "host-a", b"o", 0, 10), false))
        .await;
    assert_eq!(res.stat, Nlm4Stat::DeniedGracePeriod);
    assert_eq!(res.cookie, Bytes::from_static(b"c1"));

    let mut reclaim = lock_args(nlm_lock(&junk, "host-a", b"o", 0, 10), false);
    reclaim.reclaim = true;
    assert_eq!(
        h.coordinator.lock(request(), reclaim).await.stat,
        Nlm4Stat::StaleFh
    );

    let mut reclaim = lock_args(nlm_lock(&h.file_fh, "host-a", b"o", 0, 10), false);
    reclaim.reclaim = true;
    assert_eq!(
        h.coordinator.lock(request(), reclaim).await.stat,
        Nlm4Stat::Granted
    );

    let test = Nlm4TestArgs {
        cookie: Bytes::new(),
        exclusive: false,
        lock: nlm_lock(&h.file_fh, "host-b", b"p", 0, 10),
    };
    assert_eq!(
        h.coordinator.test(request(), test).await.stat,
        Nlm4Stat::DeniedGracePeriod
    );

    let share = share_args(&junk, "host-a", ShareMode::DenyNone, ShareAccess::Read);
    assert_eq!(
        h.coordinator.share(request(), share).await.stat,
        Nlm4Stat::DeniedGracePeriod
    );
}

#[tokio::test]
async fn test_lock_test_unlock() {
    let h = harness(Duration::ZERO).await;

    let res = h
        .coordinator
        .lock(request(), lock_args(nlm_lock(&h.file_fh, "host-a", b"a", 0, 100), false))
        .await;
    assert_eq!(res.stat, Nlm4Stat::Granted);
    assert_eq!(h.backend.held_lock_count(h.file.id()), 1);

    let test = Nlm4TestArgs {
        cookie: Bytes::new(),
        exclusive: false,
        lock: nlm_lock(&h.file_fh, "host-b", b"b", 50, 10),
    };
    let tested = h.coordinator.test(request(), test).await;
    assert_eq!(tested.stat, Nlm4Stat::Denied);
    let holder = tested.holder.unwrap();
    assert!(holder.exclusive);
    assert_eq!(holder.svid, 4242);
    assert_eq!((holder.offset, holder.len), (0, 100));

    let res = h
        .coordinator
        .lock(request(), lock_args(nlm_lock(&h.file_fh, "host-b", b"b", 50, 10), false))
        .await;
    assert_eq!(res.stat, Nlm4Stat::Denied);

    let unlock = Nlm4UnlockArgs {
        cookie: Bytes::new(),
        lock: nlm_lock(&h.file_fh, "host-a", b"a", 0, 100),
    };
    assert_eq!(h.coordinator.unlock(request(), unlock).await.stat, Nlm4Stat::Granted);
    assert_eq!(h.backend.held_lock_count(h.file.id()), 0);
    assert_eq!(h.backend.open_descriptor_count(), 0);

    // Unlocking something never locked is still fine
    let unlock = Nlm4UnlockArgs {
        cookie: Bytes::new(),
        lock: nlm_lock(&h.file_fh, "host-z", b"z", 0, 1),
    };
    assert_eq!(h.coordinator.unlock(request(), unlock).await.stat, Nlm4Stat::Granted);
}

#[tokio::test]
async fn test_monitor_registered_once_and_not_for_nm_lock() {
    let h = harness(Duration::ZERO).await;

    for offset in [0, 10] {
        let res = h
            .coordinator
            .lock(request(), lock_args(nlm_lock(&h.file_fh, "host-a", b"a", offset, 5), false))
            .await;
        assert_eq!(res.stat, Nlm4Stat::Granted);
    }
    let res = h
        .coordinator
        .nm_lock(request(), lock_args(nlm_lock(&h.file_fh, "host-n", b"n", 100, 5), false))
        .await;
    assert_eq!(res.stat, Nlm4Stat::Granted);

    assert!(eventually(|| h.monitor.monitored.lock().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(*h.monitor.monitored.lock(), vec!["host-a".to_string()]);
}

#[tokio::test]
async fn test_blocking_lock_then_granted_callback() {
    let h = harness(Duration::ZERO).await;

    let held = h
        .coordinator
        .lock(request(), lock_args(nlm_lock(&h.file_fh, "host-a", b"a", 0, 0), false))
        .await;
    assert_eq!(held.stat, Nlm4Stat::Granted);

    let blocked = h
        .coordinator
        .lock(request(), lock_args(nlm_lock(&h.file_fh, "host-b", b"b", 0, 10), true))
        .await;
    assert_eq!(blocked.stat, Nlm4Stat::Blocked);
    assert!(h.reverse.granted.lock().is_empty());

    let unlock = Nlm4UnlockArgs {
        cookie: Bytes::new(),
        lock: nlm_lock(&h.file_fh, "host-a", b"a", 0, 0),
    };
    assert_eq!(h.coordinator.unlock(request(), unlock).await.stat, Nlm4Stat::Granted);

    assert!(eventually(|| h.reverse.granted.lock().len() == 1).await);
    let granted = h.reverse.granted.lock()[0].clone();
    assert_eq!(granted.lock.caller_name, "host-b");
    assert_eq!(granted.cookie, Bytes::from_static(b"c1"));
    assert!(granted.exclusive);

    let connects = h.reverse.connects.lock().clone();
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0].1, "host-b");
    assert_eq!(h.backend.held_lock_count(h.file.id()), 1);
}

#[tokio::test]
async fn test_blocking_lock_then_cancel_sends_no_callback() {
    let h = harness(Duration::ZERO).await;

    h.coordinator
        .lock(request(), lock_args(nlm_lock(&h.file_fh, "host-a", b"a", 0, 0), false))
        .await;
    let blocked = h
        .coordinator
        .lock(request(), lock_args(nlm_lock(&h.file_fh, "host-b", b"b", 0, 10), true))
        .await;
    assert_eq!(blocked.stat, Nlm4Stat::Blocked);

    let cancel = Nlm4CancelArgs {
        cookie: Bytes::from_static(b"cancel"),
        block: true,
        exclusive: true,
        lock: nlm_lock(&h.file_fh, "host-b", b"b", 0, 10),
    };
    let res = h.coordinator.cancel(request(), cancel).await;
    assert_eq!(res.stat, Nlm4Stat::Granted);
    assert_eq!(res.cookie, Bytes::from_static(b"cancel"));

    // The abandoned wait releases its descriptor
    assert!(eventually(|| h.backend.open_descriptor_count() == 1).await);

    let unlock = Nlm4UnlockArgs {
        cookie: Bytes::new(),
        lock: nlm_lock(&h.file_fh, "host-a", b"a", 0, 0),
    };
    h.coordinator.unlock(request(), unlock).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(h.reverse.granted.lock().is_empty());
    assert!(h.reverse.connects.lock().is_empty());
    assert_eq!(h.backend.held_lock_count(h.file.id()), 0);
}

#[tokio::test]
async fn test_cancel_after_granted_callback_releases_lock() {
    let h = harness(Duration::ZERO).await;

    h.coordinator
        .lock(request(), lock_args(nlm_lock(&h.file_fh, "host-a", b"a", 0, 0), false))
        .await;
    let blocked = h
        .coordinator
        .lock(request(), lock_args(nlm_lock(&h.file_fh, "host-b", b"b", 0, 10), true))
        .await;
    assert_eq!(blocked.stat, Nlm4Stat::Blocked);

    let unlock = Nlm4UnlockArgs {
        cookie: Bytes::new(),
        lock: nlm_lock(&h.file_fh, "host-a", b"a", 0, 0),
    };
    h.coordinator.unlock(request(), unlock).await;
    assert!(eventually(|| h.reverse.granted.lock().len() == 1).await);
    assert_eq!(h.backend.held_lock_count(h.file.id()), 1);

    // The client gave up before the callback reached it
    let cancel = Nlm4CancelArgs {
        cookie: Bytes::from_static(b"late"),
        block: true,
        exclusive: true,
        lock: nlm_lock(&h.file_fh, "host-b", b"b", 0, 10),
    };
    let res = h.coordinator.cancel(request(), cancel).await;
    assert_eq!(res.stat, Nlm4Stat::Granted);
    assert_eq!(h.backend.held_lock_count(h.file.id()), 0);
    assert!(eventually(|| h.backend.open_descriptor_count() == 0).await);

    let res = h
        .coordinator
        .lock(request(), lock_args(nlm_lock(&h.file_fh, "host-c", b"c", 0, 0), false))
        .await;
    assert_eq!(res.stat, Nlm4Stat::Granted);
}

#[tokio::test]
async fn test_cancel_without_pending_wait() {
    let h = harness(Duration::ZERO).await;
    let cancel = Nlm4CancelArgs {
        cookie: Bytes::new(),
        block: true,
        exclusive: true,
        lock: nlm_lock(&h.file_fh, "host-q", b"q", 0, 10),
    };
    assert_eq!(h.coordinator.cancel(request(), cancel).await.stat, Nlm4Stat::Denied);
}

#[tokio::test]
async fn test_share_conflict_and_unshare() {
    let h = harness(Duration::ZERO).await;

    let res = h
        .coordinator
        .share(
            request(),
            share_args(&h.file_fh, "host-a", ShareMode::DenyWrite, ShareAccess::Read),
        )
        .await;
    assert_eq!(res.stat, Nlm4Stat::Granted);

    let res = h
        .coordinator
        .share(
            request(),
            share_args(&h.file_fh, "host-b", ShareMode::DenyNone, ShareAccess::ReadWrite),
        )
        .await;
    assert_eq!(res.stat, Nlm4Stat::Denied);

    // Unmatched mode/access is still a success and leaves the reservation
    let res = h
        .coordinator
        .unshare(
            request(),
            share_args(&h.file_fh, "host-a", ShareMode::DenyNone, ShareAccess::Read),
        )
        .await;
    assert_eq!(res.stat, Nlm4Stat::Granted);
    assert_eq!(
        h.coordinator
            .registry()
            .shares_on(ExportId::from_name("vol0"), h.file.id())
            .len(),
        1
    );

    h.coordinator
        .unshare(
            request(),
            share_args(&h.file_fh, "host-a", ShareMode::DenyWrite, ShareAccess::Read),
        )
        .await;
    let res = h
        .coordinator
        .share(
            request(),
            share_args(&h.file_fh, "host-b", ShareMode::DenyNone, ShareAccess::ReadWrite),
        )
        .await;
    assert_eq!(res.stat, Nlm4Stat::Granted);
}

#[tokio::test]
async fn test_free_all_clears_client_state() {
    let h = harness(Duration::ZERO).await;

    h.coordinator
        .lock(request(), lock_args(nlm_lock(&h.file_fh, "host-x", b"x", 0, 0), false))
        .await;
    h.coordinator
        .share(
            request(),
            share_args(&h.file_fh, "host-x", ShareMode::DenyReadWrite, ShareAccess::ReadWrite),
        )
        .await;

    h.coordinator.free_all(&Nlm4Notify {
        name: "host-x".to_string(),
        state: 3,
    });

    let client = h.coordinator.registry().get_or_create("host-x");
    assert_eq!(client.descriptor_count(), 0);
    assert_eq!(client.share_count(), 0);
    assert_eq!(h.backend.held_lock_count(h.file.id()), 0);

    let res = h
        .coordinator
        .lock(request(), lock_args(nlm_lock(&h.file_fh, "host-y", b"y", 0, 0), false))
        .await;
    assert_eq!(res.stat, Nlm4Stat::Granted);
    let res = h
        .coordinator
        .share(
            request(),
            share_args(&h.file_fh, "host-y", ShareMode::DenyNone, ShareAccess::Write),
        )
        .await;
    assert_eq!(res.stat, Nlm4Stat::Granted);
}

#[tokio::test]
async fn test_free_all_during_backend_open_leaves_nothing_behind() {
    let h = harness(Duration::ZERO).await;
    h.backend.hold_opens();

    let lock = h
        .coordinator
        .lock(request(), lock_args(nlm_lock(&h.file_fh, "host-x", b"x", 0, 0), false));
    let free = async {
        assert!(eventually(|| h.backend.parked_open_count() == 1).await);
        h.coordinator.free_all(&Nlm4Notify {
            name: "host-x".to_string(),
            state: 7,
        });
        h.backend.release_opens();
    };
    let (res, ()) = tokio::join!(lock, free);

    assert_eq!(res.stat, Nlm4Stat::Denied);
    assert_eq!(h.backend.held_lock_count(h.file.id()), 0);
    assert_eq!(h.backend.open_descriptor_count(), 0);
    assert!(h.coordinator.registry().get("host-x").is_none());

    let res = h
        .coordinator
        .lock(request(), lock_args(nlm_lock(&h.file_fh, "host-y", b"y", 0, 0), false))
        .await;
    assert_eq!(res.stat, Nlm4Stat::Granted);
}

#[tokio::test]
async fn test_sm_notify_releases_locks() {
    let h = harness(Duration::ZERO).await;
    h.coordinator
        .lock(request(), lock_args(nlm_lock(&h.file_fh, "host-r", b"r", 0, 0), false))
        .await;
    h.coordinator.sm_notify(&Nlm4Notify {
        name: "host-r".to_string(),
        state: 5,
    });
    assert_eq!(h.backend.open_descriptor_count(), 0);
    assert!(h.coordinator.registry().get("host-r").is_none());
}
