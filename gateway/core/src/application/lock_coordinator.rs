// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! NLM4 Lock Coordinator
//!
//! Implements the NLM4 procedures on top of the resolver and the lock
//! registry. Every procedure runs the same shape:
//!
//! 1. Grace gate, before the handle is even decoded
//! 2. Resolve the handle
//! 3. Open or reuse the caller's descriptor
//! 4. Operate and reply
//!
//! A blocking LOCK replies `Blocked` straight away and keeps waiting in a
//! background task; when the backend grants it the coordinator dials back
//! to the client and sends NLM4_GRANTED. CANCEL aborts that wait.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** NLM4 TEST / LOCK / CANCEL / UNLOCK / SHARE / UNSHARE / FREE_ALL

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::call_context::{CallContext, CallContextPool};
use crate::application::grace_period::GracePeriod;
use crate::application::lock_registry::{
    DescriptorKey, DescriptorLease, LockClient, LockRegistry,
};
use crate::application::resolver::Resolver;
use crate::domain::backend::{Backend, ObjectRef, OpenMode, RequestInfo};
use crate::domain::errors::{NfsError, Nlm4Stat};
use crate::domain::file_handle::ExportId;
use crate::domain::lock::{LockRequest, ShareReservation};
use crate::domain::nlm::{
    HostMonitor, Nlm4CancelArgs, Nlm4GrantedArgs, Nlm4Lock, Nlm4LockArgs, Nlm4Notify, Nlm4Res,
    Nlm4ShareArgs, Nlm4ShareRes, Nlm4TestArgs, Nlm4TestRes, Nlm4UnlockArgs, ReverseChannel,
    ReverseRpcError,
};

/// Object an NLM request resolved to
struct Target {
    export_id: ExportId,
    backend: Arc<dyn Backend>,
    object: ObjectRef,
}

/// Everything the background wait of a blocking LOCK needs
struct BlockedLock {
    client: Arc<LockClient>,
    lease: DescriptorLease,
    backend: Arc<dyn Backend>,
    request: LockRequest,
    lock: Nlm4Lock,
    cookie: Bytes,
    exclusive: bool,
    peer: SocketAddr,
    monitor: bool,
}

#[derive(Clone)]
pub struct LockCoordinator {
    resolver: Resolver,
    pool: CallContextPool,
    registry: Arc<LockRegistry>,
    grace: GracePeriod,
    reverse: Arc<dyn ReverseChannel>,
    monitor: Arc<dyn HostMonitor>,
    shutdown: CancellationToken,
}

impl LockCoordinator {
    pub fn new(
        resolver: Resolver,
        pool: CallContextPool,
        registry: Arc<LockRegistry>,
        grace: GracePeriod,
        reverse: Arc<dyn ReverseChannel>,
        monitor: Arc<dyn HostMonitor>,
    ) -> Self {
        Self {
            resolver,
            pool,
            registry,
            grace,
            reverse,
            monitor,
            shutdown: CancellationToken::new(),
        }
    }

    /// Tie background grant waits to `token`
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn registry(&self) -> &Arc<LockRegistry> {
        &self.registry
    }

    pub fn grace(&self) -> &GracePeriod {
        &self.grace
    }

    /// NLM4_TEST
    pub async fn test(&self, request: RequestInfo, args: Nlm4TestArgs) -> Nlm4TestRes {
        if self.grace.is_active() {
            return test_res(args.cookie, Nlm4Stat::DeniedGracePeriod, None);
        }

        let ctx = self.pool.acquire(request);
        let fh = args.lock.fh.clone();
        self.resolver
            .resolve_and_resume(ctx, &fh, None, |ctx| self.test_resume(ctx, args))
            .await
    }

    async fn test_resume(&self, ctx: CallContext, args: Nlm4TestArgs) -> Nlm4TestRes {
        let target = match target_of(&ctx) {
            Ok(target) => target,
            Err(err) => return test_res(args.cookie, Nlm4Stat::from(&err), None),
        };
        let principal = ctx.principal();

        // Anonymous descriptor; TEST keeps no state
        let fd = match target
            .backend
            .open(&principal, &target.object, OpenMode::ReadOnly)
            .await
        {
            Ok(fd) => fd,
            Err(err) => return test_res(args.cookie, nlm_stat(err), None),
        };
        let outcome = target
            .backend
            .test_lock(&fd, &args.lock.request(args.exclusive))
            .await;
        target.backend.close(&fd);

        match outcome {
            Ok(None) => test_res(args.cookie, Nlm4Stat::Granted, None),
            Ok(Some(holder)) => {
                debug!(
                    "TEST by {} conflicts with owner {}",
                    args.lock.caller_name, holder.owner
                );
                test_res(args.cookie, Nlm4Stat::Denied, Some(holder.into()))
            }
            Err(err) => test_res(args.cookie, nlm_stat(err), None),
        }
    }

    /// NLM4_LOCK; the caller is registered with the host monitor after its
    /// first grant
    pub async fn lock(&self, request: RequestInfo, args: Nlm4LockArgs) -> Nlm4Res {
        self.lock_with(request, args, true).await
    }

    /// NLM4_NM_LOCK: LOCK without host monitoring
    pub async fn nm_lock(&self, request: RequestInfo, args: Nlm4LockArgs) -> Nlm4Res {
        self.lock_with(request, args, false).await
    }

    async fn lock_with(&self, request: RequestInfo, args: Nlm4LockArgs, monitor: bool) -> Nlm4Res {
        if self.grace.is_active() && !args.reclaim {
            return res(args.cookie, Nlm4Stat::DeniedGracePeriod);
        }

        let ctx = self.pool.acquire(request);
        let fh = args.lock.fh.clone();
        self.resolver
            .resolve_and_resume(ctx, &fh, None, |ctx| self.lock_resume(ctx, args, monitor))
            .await
    }

    async fn lock_resume(&self, ctx: CallContext, args: Nlm4LockArgs, monitor: bool) -> Nlm4Res {
        let target = match target_of(&ctx) {
            Ok(target) => target,
            Err(err) => return res(args.cookie, Nlm4Stat::from(&err)),
        };
        let principal = ctx.principal();
        let client = self.registry.get_or_create(&args.lock.caller_name);
        let key = DescriptorKey::new(args.lock.owner.clone(), target.export_id, target.object.id());
        let mode = if args.exclusive {
            OpenMode::ReadWrite
        } else {
            OpenMode::ReadOnly
        };

        let lease = match self
            .registry
            .open_descriptor(&client, key, &target.backend, &principal, &target.object, mode)
            .await
        {
            Ok(lease) => lease,
            Err(err) => return res(args.cookie, Nlm4Stat::from(&err)),
        };

        let request = args.lock.request(args.exclusive);
        if args.block {
            let Some(peer) = ctx.request().map(|r| r.peer) else {
                return res(args.cookie, Nlm4Stat::Failed);
            };
            let cookie = args.cookie.clone();
            self.spawn_blocked_lock(BlockedLock {
                client,
                lease,
                backend: target.backend,
                request,
                lock: args.lock,
                cookie: args.cookie,
                exclusive: args.exclusive,
                peer,
                monitor,
            });
            return res(cookie, Nlm4Stat::Blocked);
        }

        match target.backend.lock(lease.fd(), &request, false).await {
            Ok(()) => {
                if !lease.note_locked(request.range) {
                    // FREE_ALL ran while the backend was granting
                    rollback_lock(&target.backend, &lease, &request, &args.lock.caller_name)
                        .await;
                    return res(args.cookie, Nlm4Stat::Denied);
                }
                info!(
                    "Granted {} lock on {} to {} (owner {})",
                    kind_name(args.exclusive),
                    target.object.id(),
                    args.lock.caller_name,
                    args.lock.owner
                );
                if monitor {
                    self.monitor_caller(&client);
                }
                res(args.cookie, Nlm4Stat::Granted)
            }
            Err(err) => {
                debug!("LOCK by {} refused: {}", args.lock.caller_name, err);
                res(args.cookie, nlm_stat(err))
            }
        }
    }

    /// Wait for a blocked lock in the background, then deliver GRANTED
    fn spawn_blocked_lock(&self, blocked: BlockedLock) {
        let range = blocked.request.range;
        let (wait_id, token) =
            self.registry
                .register_pending(&blocked.client, blocked.lease.key().clone(), range);
        let this = self.clone();

        tokio::spawn(async move {
            let fd = blocked.lease.fd().clone();
            let outcome = tokio::select! {
                _ = token.cancelled() => None,
                _ = this.shutdown.cancelled() => None,
                result = blocked.backend.lock(&fd, &blocked.request, true) => Some(result),
            };

            match outcome {
                None => {
                    this.registry
                        .finish_pending(&blocked.client, blocked.lease.key(), range, wait_id);
                    debug!(
                        "Blocked lock of {} (owner {}) abandoned",
                        blocked.lock.caller_name, blocked.lock.owner
                    );
                }
                Some(Ok(())) if !this.registry.complete_pending(&blocked.lease, range, wait_id) => {
                    // CANCEL or FREE_ALL got in while the grant was landing
                    rollback_lock(
                        &blocked.backend,
                        &blocked.lease,
                        &blocked.request,
                        &blocked.lock.caller_name,
                    )
                    .await;
                }
                Some(Ok(())) => {
                    info!(
                        "Granted blocked {} lock to {} (owner {})",
                        kind_name(blocked.exclusive),
                        blocked.lock.caller_name,
                        blocked.lock.owner
                    );
                    if blocked.monitor {
                        this.monitor_caller(&blocked.client);
                    }
                    let granted = Nlm4GrantedArgs {
                        cookie: blocked.cookie.clone(),
                        exclusive: blocked.exclusive,
                        lock: blocked.lock.clone(),
                    };
                    if let Err(err) = this
                        .send_granted(&blocked.client, blocked.peer, &granted)
                        .await
                    {
                        warn!(
                            "GRANTED callback to {} failed: {}",
                            blocked.lock.caller_name, err
                        );
                    }
                }
                Some(Err(err)) => {
                    this.registry
                        .finish_pending(&blocked.client, blocked.lease.key(), range, wait_id);
                    warn!(
                        "Blocked lock of {} failed: {}",
                        blocked.lock.caller_name, err
                    );
                }
            }
        });
    }

    /// Send GRANTED, connecting back to the client on first use
    async fn send_granted(
        &self,
        client: &LockClient,
        peer: SocketAddr,
        args: &Nlm4GrantedArgs,
    ) -> Result<(), ReverseRpcError> {
        let reverse = match client.reverse_rpc() {
            Some(reverse) => reverse,
            None => {
                let reverse = self
                    .reverse
                    .open_reverse_client(peer, client.caller_name())
                    .await?;
                client.set_reverse_rpc(reverse.clone());
                reverse
            }
        };

        if let Err(err) = reverse.send_granted(args).await {
            client.clear_reverse_rpc();
            return Err(err);
        }
        debug!("GRANTED delivered to {} at {}", client.caller_name(), peer);
        Ok(())
    }

    /// Register the caller for reboot notification once, without waiting
    fn monitor_caller(&self, client: &LockClient) {
        if !client.mark_monitored() {
            return;
        }
        let monitor = self.monitor.clone();
        let caller = client.caller_name().to_string();
        tokio::spawn(async move {
            if let Err(err) = monitor.monitor(&caller).await {
                warn!("Could not monitor {}: {}", caller, err);
            }
        });
    }

    /// NLM4_CANCEL
    pub async fn cancel(&self, request: RequestInfo, args: Nlm4CancelArgs) -> Nlm4Res {
        if self.grace.is_active() {
            return res(args.cookie, Nlm4Stat::DeniedGracePeriod);
        }

        let ctx = self.pool.acquire(request);
        let fh = args.lock.fh.clone();
        self.resolver
            .resolve_and_resume(ctx, &fh, None, |ctx| self.cancel_resume(ctx, args))
            .await
    }

    async fn cancel_resume(&self, ctx: CallContext, args: Nlm4CancelArgs) -> Nlm4Res {
        let target = match target_of(&ctx) {
            Ok(target) => target,
            Err(err) => return res(args.cookie, Nlm4Stat::from(&err)),
        };
        let Some(client) = self.registry.get(&args.lock.caller_name) else {
            return res(args.cookie, Nlm4Stat::Denied);
        };
        let key = DescriptorKey::new(args.lock.owner.clone(), target.export_id, target.object.id());
        let range = args.lock.range();

        if self.registry.cancel_pending(&client, &key, range) {
            info!(
                "Cancelled blocked lock of {} (owner {})",
                args.lock.caller_name, args.lock.owner
            );
            return res(args.cookie, Nlm4Stat::Granted);
        }

        // The wait already ended; undo whatever it may have been granted
        let Some(lease) = self.registry.lease_descriptor(&client, &key) else {
            return res(args.cookie, Nlm4Stat::Denied);
        };
        match target.backend.unlock(lease.fd(), &args.lock.owner, range).await {
            Ok(()) => {
                lease.note_unlocked(range);
                res(args.cookie, Nlm4Stat::Granted)
            }
            Err(err) => res(args.cookie, nlm_stat(err)),
        }
    }

    /// NLM4_UNLOCK
    pub async fn unlock(&self, request: RequestInfo, args: Nlm4UnlockArgs) -> Nlm4Res {
        if self.grace.is_active() {
            return res(args.cookie, Nlm4Stat::DeniedGracePeriod);
        }

        let ctx = self.pool.acquire(request);
        let fh = args.lock.fh.clone();
        self.resolver
            .resolve_and_resume(ctx, &fh, None, |ctx| self.unlock_resume(ctx, args))
            .await
    }

    async fn unlock_resume(&self, ctx: CallContext, args: Nlm4UnlockArgs) -> Nlm4Res {
        let target = match target_of(&ctx) {
            Ok(target) => target,
            Err(err) => return res(args.cookie, Nlm4Stat::from(&err)),
        };
        let lease = self.registry.get(&args.lock.caller_name).and_then(|client| {
            let key =
                DescriptorKey::new(args.lock.owner.clone(), target.export_id, target.object.id());
            self.registry.lease_descriptor(&client, &key)
        });
        // Nothing held through this owner: unlocking is a no-op
        let Some(lease) = lease else {
            return res(args.cookie, Nlm4Stat::Granted);
        };

        let range = args.lock.range();
        match target.backend.unlock(lease.fd(), &args.lock.owner, range).await {
            Ok(()) => {
                lease.note_unlocked(range);
                debug!(
                    "Unlocked {}+{} for {} (owner {})",
                    range.offset, range.len, args.lock.caller_name, args.lock.owner
                );
                res(args.cookie, Nlm4Stat::Granted)
            }
            Err(err) => res(args.cookie, nlm_stat(err)),
        }
    }

    /// NLM4_SHARE
    pub async fn share(&self, request: RequestInfo, args: Nlm4ShareArgs) -> Nlm4ShareRes {
        if self.grace.is_active() && !args.reclaim {
            return share_res(args.cookie, Nlm4Stat::DeniedGracePeriod);
        }

        let ctx = self.pool.acquire(request);
        let fh = args.share.fh.clone();
        self.resolver
            .resolve_and_resume(ctx, &fh, None, |ctx| self.share_resume(ctx, args))
            .await
    }

    async fn share_resume(&self, ctx: CallContext, args: Nlm4ShareArgs) -> Nlm4ShareRes {
        let target = match target_of(&ctx) {
            Ok(target) => target,
            Err(err) => return share_res(args.cookie, Nlm4Stat::from(&err)),
        };
        let share = args.share;
        let client = self.registry.get_or_create(&share.caller_name);
        let reservation = ShareReservation {
            export_id: target.export_id,
            object: target.object,
            caller_name: share.caller_name.clone(),
            owner: share.owner,
            mode: share.mode,
            access: share.access,
        };

        match self.registry.add_share(&client, reservation) {
            Ok(()) => {
                debug!(
                    "Share {:?}/{:?} granted to {}",
                    share.mode, share.access, share.caller_name
                );
                share_res(args.cookie, Nlm4Stat::Granted)
            }
            Err(err) => share_res(args.cookie, Nlm4Stat::from(&err)),
        }
    }

    /// NLM4_UNSHARE; an unmatched reservation still reports success
    pub async fn unshare(&self, request: RequestInfo, args: Nlm4ShareArgs) -> Nlm4ShareRes {
        if self.grace.is_active() && !args.reclaim {
            return share_res(args.cookie, Nlm4Stat::DeniedGracePeriod);
        }

        let ctx = self.pool.acquire(request);
        let fh = args.share.fh.clone();
        self.resolver
            .resolve_and_resume(ctx, &fh, None, |ctx| self.unshare_resume(ctx, args))
            .await
    }

    async fn unshare_resume(&self, ctx: CallContext, args: Nlm4ShareArgs) -> Nlm4ShareRes {
        let target = match target_of(&ctx) {
            Ok(target) => target,
            Err(err) => return share_res(args.cookie, Nlm4Stat::from(&err)),
        };
        let share = &args.share;
        if let Some(client) = self.registry.get(&share.caller_name) {
            let removed = self.registry.remove_share(
                &client,
                target.export_id,
                target.object.id(),
                &share.owner,
                share.mode,
                share.access,
            );
            if !removed {
                debug!("UNSHARE by {} matched nothing", share.caller_name);
            }
        }
        share_res(args.cookie, Nlm4Stat::Granted)
    }

    /// NLM4_FREE_ALL: the named host rebooted and holds nothing any more
    pub fn free_all(&self, notify: &Nlm4Notify) {
        info!("FREE_ALL from {} (state {})", notify.name, notify.state);
        self.registry.forget_all(&notify.name);
    }

    /// SM_NOTIFY relayed by the status monitor; same effect as FREE_ALL
    pub fn sm_notify(&self, notify: &Nlm4Notify) {
        info!("Host {} restarted (state {})", notify.name, notify.state);
        self.registry.forget_all(&notify.name);
    }
}

fn target_of(ctx: &CallContext) -> Result<Target, NfsError> {
    ctx.resolution()?;
    let export = ctx.export().ok_or(NfsError::StaleHandle)?;
    let object = ctx
        .location()
        .object
        .clone()
        .ok_or(NfsError::StaleHandle)?;
    Ok(Target {
        export_id: export.id,
        backend: export.backend().clone(),
        object,
    })
}

/// Undo a backend lock whose grant can no longer be recorded
async fn rollback_lock(
    backend: &Arc<dyn Backend>,
    lease: &DescriptorLease,
    request: &LockRequest,
    caller_name: &str,
) {
    debug!(
        "Rolling back lock of {} (owner {}) on {}+{}",
        caller_name, request.owner, request.range.offset, request.range.len
    );
    if let Err(err) = backend.unlock(lease.fd(), &request.owner, request.range).await {
        warn!(
            "Failed to roll back lock of {} (owner {}): {}",
            caller_name, request.owner, err
        );
    }
}

fn nlm_stat(err: crate::domain::backend::BackendError) -> Nlm4Stat {
    Nlm4Stat::from(NfsError::from(err))
}

fn kind_name(exclusive: bool) -> &'static str {
    if exclusive {
        "exclusive"
    } else {
        "shared"
    }
}

fn res(cookie: Bytes, stat: Nlm4Stat) -> Nlm4Res {
    Nlm4Res { cookie, stat }
}

fn test_res(
    cookie: Bytes,
    stat: Nlm4Stat,
    holder: Option<crate::domain::nlm::Nlm4Holder>,
) -> Nlm4TestRes {
    Nlm4TestRes {
        cookie,
        stat,
        holder,
    }
}

fn share_res(cookie: Bytes, stat: Nlm4Stat) -> Nlm4ShareRes {
    Nlm4ShareRes {
        cookie,
        stat,
        sequence: 0,
    }
}
