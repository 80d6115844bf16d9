// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! NFS Gateway Composition Root
//!
//! Wires the export table, resolver, call-context pool, lock registry, lock
//! coordinator and NFSv3 service together from a [`GatewayConfigSpec`].
//!
//! ## Lifecycle
//! - `start()` arms the lock grace period
//! - `stop()` cancels every background task (grace timer, blocked lock
//!   waits) through one shared `CancellationToken`
//! - A stopped gateway cannot be started again; build a new one
//!
//! The RPC transport is not owned here: the dispatcher calls the
//! procedure handlers exposed by [`NfsGateway::nfs3`] and
//! [`NfsGateway::nlm`], and provides the reverse channel used for
//! GRANTED callbacks.

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::call_context::CallContextPool;
use crate::application::export_table::ExportTable;
use crate::application::grace_period::GracePeriod;
use crate::application::lock_coordinator::LockCoordinator;
use crate::application::lock_registry::LockRegistry;
use crate::application::nfs3_service::Nfs3Service;
use crate::application::resolver::Resolver;
use crate::domain::config::GatewayConfigSpec;
use crate::domain::nlm::{HostMonitor, ReverseChannel};

/// Gateway lifecycle errors
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid gateway configuration: {0}")]
    Config(String),

    #[error("Gateway was stopped and cannot be restarted")]
    Stopped,
}

/// Composition root of the NFSv3 gateway
pub struct NfsGateway {
    exports: ExportTable,
    pool: CallContextPool,
    nfs3: Nfs3Service,
    nlm: LockCoordinator,
    nlm_enabled: bool,
    shutdown: CancellationToken,
    running: Mutex<bool>,
}

impl NfsGateway {
    /// Build a gateway, creating one backend per configured export
    ///
    /// # Arguments
    /// * `spec` - Validated configuration
    /// * `reverse` - Transport-provided factory for GRANTED callback clients
    /// * `monitor` - Host monitor registration for lock holders
    pub fn from_config(
        spec: &GatewayConfigSpec,
        reverse: Arc<dyn ReverseChannel>,
        monitor: Arc<dyn HostMonitor>,
    ) -> Result<Self, GatewayError> {
        let exports =
            ExportTable::from_config(spec).map_err(|e| GatewayError::Config(format!("{:#}", e)))?;
        Ok(Self::with_exports(spec, exports, reverse, monitor))
    }

    /// Build a gateway over an already populated export table
    pub fn with_exports(
        spec: &GatewayConfigSpec,
        exports: ExportTable,
        reverse: Arc<dyn ReverseChannel>,
        monitor: Arc<dyn HostMonitor>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let pool = CallContextPool::new(spec.call_pool.capacity);
        let resolver = Resolver::new(exports.clone());
        let grace = GracePeriod::new(spec.nlm.grace_period());

        let nfs3 = Nfs3Service::new(resolver.clone(), pool.clone());
        let nlm = LockCoordinator::new(
            resolver,
            pool.clone(),
            Arc::new(LockRegistry::new()),
            grace,
            reverse,
            monitor,
        )
        .with_shutdown(shutdown.clone());

        Self {
            exports,
            pool,
            nfs3,
            nlm,
            nlm_enabled: spec.nlm.enabled,
            shutdown,
            running: Mutex::new(false),
        }
    }

    /// Start background tasks
    pub fn start(&self) -> Result<(), GatewayError> {
        if self.shutdown.is_cancelled() {
            return Err(GatewayError::Stopped);
        }
        let mut running = self.running.lock();
        if *running {
            warn!("NFS gateway already running");
            return Ok(());
        }

        if self.nlm_enabled {
            self.nlm.grace().start(self.shutdown.child_token());
        } else {
            self.nlm.grace().end_now();
        }
        *running = true;
        info!(
            "NFS gateway started with {} export(s), NLM {}",
            self.exports.count(),
            if self.nlm_enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Stop the gateway, cancelling background tasks
    pub fn stop(&self) {
        let mut running = self.running.lock();
        if !*running {
            warn!("NFS gateway was not running");
            return;
        }
        self.shutdown.cancel();
        *running = false;
        info!("NFS gateway stopped");
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock() && !self.shutdown.is_cancelled()
    }

    pub fn exports(&self) -> &ExportTable {
        &self.exports
    }

    pub fn call_pool(&self) -> &CallContextPool {
        &self.pool
    }

    /// NFSv3 procedure handlers
    pub fn nfs3(&self) -> &Nfs3Service {
        &self.nfs3
    }

    /// NLM4 procedure handlers; `None` when NLM is disabled
    pub fn nlm(&self) -> Option<&LockCoordinator> {
        self.nlm_enabled.then_some(&self.nlm)
    }
}
