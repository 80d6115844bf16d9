// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Protocol Error Taxonomy
//!
//! Every backend failure is translated exactly once into [`NfsError`] when
//! it crosses into the resolver or the lock coordinator. Procedure handlers
//! then project it onto the wire status of their protocol (`nfsstat3` or
//! `nlm4_stats`).
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Error taxonomy and its NFSv3 / NLM4 status projections

use thiserror::Error;

use crate::domain::backend::BackendError;

/// Why export policy refused an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedReason {
    /// Mutation attempted on a read-only export
    ReadOnlyExport,
    /// Operation not implemented for this object or export
    Operation,
}

/// Protocol-level error taxonomy shared by all handlers
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NfsError {
    #[error("Stale file handle")]
    StaleHandle,

    #[error("Malformed file handle: {0}")]
    BadHandle(String),

    #[error("No such entry: {0}")]
    NotFound(String),

    #[error("Conflicting lock or share holder")]
    Conflict,

    #[error("Grace period active, only reclaims are honoured")]
    GracePeriod,

    #[error("Operation not permitted by export policy: {0:?}")]
    Unsupported(UnsupportedReason),

    #[error("Lock state of the caller was released")]
    ClientReleased,

    #[error("Backend fault: {0}")]
    BackendFault(BackendError),
}

impl NfsError {
    pub fn read_only() -> Self {
        NfsError::Unsupported(UnsupportedReason::ReadOnlyExport)
    }
}

impl From<BackendError> for NfsError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Stale => NfsError::StaleHandle,
            BackendError::NotFound => NfsError::NotFound(String::new()),
            BackendError::WouldBlock => NfsError::Conflict,
            BackendError::ReadOnly => NfsError::read_only(),
            other => NfsError::BackendFault(other),
        }
    }
}

/// NFSv3 `nfsstat3`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Nfs3Status {
    Ok = 0,
    Perm = 1,
    NoEnt = 2,
    Io = 5,
    Acces = 13,
    Exist = 17,
    XDev = 18,
    NoDev = 19,
    NotDir = 20,
    IsDir = 21,
    Inval = 22,
    FBig = 27,
    NoSpc = 28,
    Rofs = 30,
    NameTooLong = 63,
    NotEmpty = 66,
    Stale = 70,
    BadHandle = 10001,
    NotSupp = 10004,
    ServerFault = 10006,
    Jukebox = 10008,
}

impl Nfs3Status {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl From<&NfsError> for Nfs3Status {
    fn from(err: &NfsError) -> Self {
        match err {
            NfsError::StaleHandle => Nfs3Status::Stale,
            NfsError::BadHandle(_) => Nfs3Status::BadHandle,
            NfsError::NotFound(_) => Nfs3Status::NoEnt,
            NfsError::Conflict | NfsError::GracePeriod => Nfs3Status::Jukebox,
            NfsError::Unsupported(UnsupportedReason::ReadOnlyExport) => Nfs3Status::Rofs,
            NfsError::Unsupported(UnsupportedReason::Operation) => Nfs3Status::NotSupp,
            NfsError::ClientReleased => Nfs3Status::ServerFault,
            NfsError::BackendFault(inner) => match inner {
                BackendError::Exists => Nfs3Status::Exist,
                BackendError::NotDirectory => Nfs3Status::NotDir,
                BackendError::IsDirectory => Nfs3Status::IsDir,
                BackendError::NotEmpty => Nfs3Status::NotEmpty,
                BackendError::AccessDenied => Nfs3Status::Acces,
                BackendError::PermissionDenied => Nfs3Status::Perm,
                BackendError::NoSpace => Nfs3Status::NoSpc,
                BackendError::FileTooLarge => Nfs3Status::FBig,
                BackendError::NameTooLong => Nfs3Status::NameTooLong,
                BackendError::Invalid(_) => Nfs3Status::Inval,
                BackendError::Io(_) => Nfs3Status::Io,
                _ => Nfs3Status::ServerFault,
            },
        }
    }
}

impl From<NfsError> for Nfs3Status {
    fn from(err: NfsError) -> Self {
        Nfs3Status::from(&err)
    }
}

/// NLM4 `nlm4_stats`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Nlm4Stat {
    Granted = 0,
    Denied = 1,
    DeniedNoLocks = 2,
    Blocked = 3,
    DeniedGracePeriod = 4,
    Deadlock = 5,
    Rofs = 6,
    StaleFh = 7,
    FBig = 8,
    Failed = 9,
}

impl Nlm4Stat {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl From<&NfsError> for Nlm4Stat {
    fn from(err: &NfsError) -> Self {
        match err {
            NfsError::StaleHandle | NfsError::BadHandle(_) => Nlm4Stat::StaleFh,
            NfsError::GracePeriod => Nlm4Stat::DeniedGracePeriod,
            NfsError::Unsupported(UnsupportedReason::ReadOnlyExport) => Nlm4Stat::Rofs,
            NfsError::BackendFault(BackendError::NoLocks) => Nlm4Stat::Failed,
            NfsError::BackendFault(BackendError::FileTooLarge) => Nlm4Stat::FBig,
            _ => Nlm4Stat::Denied,
        }
    }
}

impl From<NfsError> for Nlm4Stat {
    fn from(err: NfsError) -> Self {
        Nlm4Stat::from(&err)
    }
}
