// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! NLM4 Messages and Transport Boundary
//!
//! Decoded NLM4 arguments and results exchanged with the protocol
//! dispatcher, and the traits through which the lock coordinator reaches
//! back out to clients (GRANTED callbacks) and to the host monitor.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** NLM4 procedure payloads and outbound ports

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::errors::Nlm4Stat;
use crate::domain::lock::{
    LockHolder, LockKind, LockOwner, LockRange, LockRequest, ShareAccess, ShareMode,
};

/// `nlm4_lock`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nlm4Lock {
    pub caller_name: String,
    pub fh: Bytes,
    pub owner: LockOwner,
    pub svid: u32,
    pub offset: u64,
    pub len: u64,
}

impl Nlm4Lock {
    pub fn range(&self) -> LockRange {
        LockRange::new(self.offset, self.len)
    }

    pub fn request(&self, exclusive: bool) -> LockRequest {
        LockRequest {
            owner: self.owner.clone(),
            svid: self.svid,
            range: self.range(),
            kind: LockKind::from_exclusive(exclusive),
        }
    }
}

/// `nlm4_lockargs`
#[derive(Debug, Clone)]
pub struct Nlm4LockArgs {
    pub cookie: Bytes,
    pub block: bool,
    pub exclusive: bool,
    pub lock: Nlm4Lock,
    pub reclaim: bool,
    pub state: i32,
}

/// `nlm4_testargs`
#[derive(Debug, Clone)]
pub struct Nlm4TestArgs {
    pub cookie: Bytes,
    pub exclusive: bool,
    pub lock: Nlm4Lock,
}

/// `nlm4_cancargs`
#[derive(Debug, Clone)]
pub struct Nlm4CancelArgs {
    pub cookie: Bytes,
    pub block: bool,
    pub exclusive: bool,
    pub lock: Nlm4Lock,
}

/// `nlm4_unlockargs`
#[derive(Debug, Clone)]
pub struct Nlm4UnlockArgs {
    pub cookie: Bytes,
    pub lock: Nlm4Lock,
}

/// `nlm4_share`
#[derive(Debug, Clone)]
pub struct Nlm4Share {
    pub caller_name: String,
    pub fh: Bytes,
    pub owner: LockOwner,
    pub mode: ShareMode,
    pub access: ShareAccess,
}

/// `nlm4_shareargs`
#[derive(Debug, Clone)]
pub struct Nlm4ShareArgs {
    pub cookie: Bytes,
    pub share: Nlm4Share,
    pub reclaim: bool,
}

/// `nlm4_res`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nlm4Res {
    pub cookie: Bytes,
    pub stat: Nlm4Stat,
}

/// `nlm4_holder`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nlm4Holder {
    pub exclusive: bool,
    pub svid: u32,
    pub owner: LockOwner,
    pub offset: u64,
    pub len: u64,
}

impl From<LockHolder> for Nlm4Holder {
    fn from(holder: LockHolder) -> Self {
        Self {
            exclusive: holder.kind.is_exclusive(),
            svid: holder.svid,
            owner: holder.owner,
            offset: holder.range.offset,
            len: holder.range.len,
        }
    }
}

/// `nlm4_testres`; `holder` is set only when `stat` is `Denied`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nlm4TestRes {
    pub cookie: Bytes,
    pub stat: Nlm4Stat,
    pub holder: Option<Nlm4Holder>,
}

/// `nlm4_shareres`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nlm4ShareRes {
    pub cookie: Bytes,
    pub stat: Nlm4Stat,
    pub sequence: i32,
}

/// Payload of the NLM4_GRANTED callback (an `nlm4_testargs` on the wire).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nlm4GrantedArgs {
    pub cookie: Bytes,
    pub exclusive: bool,
    pub lock: Nlm4Lock,
}

/// `nlm4_notify` (FREE_ALL) and `nlm_sm_status` (SM_NOTIFY) carry a host name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nlm4Notify {
    pub name: String,
    pub state: i32,
}

/// Reverse-RPC failures
#[derive(Debug, Error)]
pub enum ReverseRpcError {
    #[error("Failed to connect to {peer}: {reason}")]
    Connect { peer: SocketAddr, reason: String },

    #[error("Callback send failed: {0}")]
    Send(String),

    #[error("Host monitor registration failed: {0}")]
    Monitor(String),
}

/// Outbound connection to one client's NLM service.
#[async_trait]
pub trait ReverseClient: Send + Sync {
    /// Deliver NLM4_GRANTED for a previously blocked lock
    async fn send_granted(&self, args: &Nlm4GrantedArgs) -> Result<(), ReverseRpcError>;
}

/// Factory for reverse connections, provided by the transport layer.
#[async_trait]
pub trait ReverseChannel: Send + Sync {
    /// Dial back to the client that sent a request from `peer`
    ///
    /// # Arguments
    /// * `peer` - Source address of the original request
    /// * `caller_name` - NLM caller name, for logging and portmapper lookups
    async fn open_reverse_client(
        &self,
        peer: SocketAddr,
        caller_name: &str,
    ) -> Result<Arc<dyn ReverseClient>, ReverseRpcError>;
}

/// Registration with the status monitor so a client reboot triggers FREE_ALL.
#[async_trait]
pub trait HostMonitor: Send + Sync {
    async fn monitor(&self, caller_name: &str) -> Result<(), ReverseRpcError>;
}
