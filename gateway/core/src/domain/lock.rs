// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Lock and Share Value Objects
//!
//! Byte-range lock descriptions shared by the backend's advisory lock
//! facility and the NLM4 coordinator, plus the share reservation model
//! that never leaves this server.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Lock owners, ranges, holders, share modes and the share conflict rule

use std::fmt;

use crate::domain::backend::ObjectRef;
use crate::domain::file_handle::ExportId;

/// Client-supplied opaque lock owner (`netobj oh` in NLM4).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockOwner(pub Vec<u8>);

impl LockOwner {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// Shared (read) or exclusive (write) byte-range lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    Shared,
    Exclusive,
}

impl LockKind {
    pub fn from_exclusive(exclusive: bool) -> Self {
        if exclusive {
            LockKind::Exclusive
        } else {
            LockKind::Shared
        }
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self, LockKind::Exclusive)
    }
}

/// Byte range `[offset, offset + len)`. A zero length runs to end of file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockRange {
    pub offset: u64,
    pub len: u64,
}

impl LockRange {
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    /// Whole file.
    pub fn whole() -> Self {
        Self::new(0, 0)
    }

    /// Exclusive end; `u64::MAX` for ranges that run to end of file.
    pub fn end(&self) -> u64 {
        if self.len == 0 {
            u64::MAX
        } else {
            self.offset.saturating_add(self.len)
        }
    }

    pub fn overlaps(&self, other: &LockRange) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    pub fn contains(&self, other: &LockRange) -> bool {
        self.offset <= other.offset && other.end() <= self.end()
    }

    /// What is left of `self` after removing `other` (zero, one or two pieces).
    pub fn subtract(&self, other: &LockRange) -> Vec<LockRange> {
        if !self.overlaps(other) {
            return vec![*self];
        }
        let mut pieces = Vec::with_capacity(2);
        if self.offset < other.offset {
            pieces.push(LockRange::new(self.offset, other.offset - self.offset));
        }
        let other_end = other.end();
        let self_end = self.end();
        if other_end < self_end {
            let len = if self.len == 0 { 0 } else { self_end - other_end };
            pieces.push(LockRange::new(other_end, len));
        }
        pieces
    }
}

/// A byte-range lock request as handed to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub owner: LockOwner,
    /// Caller's process id (`svid`), reported back to conflicting testers.
    pub svid: u32,
    pub range: LockRange,
    pub kind: LockKind,
}

/// Description of a lock currently blocking a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub owner: LockOwner,
    pub svid: u32,
    pub range: LockRange,
    pub kind: LockKind,
}

/// NLM4 `fsh4_mode`: which access the holder denies to others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ShareMode {
    DenyNone = 0,
    DenyRead = 1,
    DenyWrite = 2,
    DenyReadWrite = 3,
}

/// NLM4 `fsh4_access`: which access the holder wants for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ShareAccess {
    None = 0,
    Read = 1,
    Write = 2,
    ReadWrite = 3,
}

impl ShareMode {
    pub const ALL: [ShareMode; 4] = [
        ShareMode::DenyNone,
        ShareMode::DenyRead,
        ShareMode::DenyWrite,
        ShareMode::DenyReadWrite,
    ];

    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.bits() as u32 == value)
    }
}

impl ShareAccess {
    pub const ALL: [ShareAccess; 4] = [
        ShareAccess::None,
        ShareAccess::Read,
        ShareAccess::Write,
        ShareAccess::ReadWrite,
    ];

    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.bits() as u32 == value)
    }
}

/// True when a request for `(mode, access)` must be refused because of an
/// existing reservation holding `(held_mode, held_access)`.
///
/// The check is asymmetric: the request's deny bits are tested against the
/// holder's access, and the request's access against the holder's deny bits.
pub fn share_conflicts(
    mode: ShareMode,
    access: ShareAccess,
    held_mode: ShareMode,
    held_access: ShareAccess,
) -> bool {
    (mode.bits() & held_access.bits()) != 0 || (access.bits() & held_mode.bits()) != 0
}

/// A granted NLM4 share reservation.
#[derive(Debug, Clone)]
pub struct ShareReservation {
    pub export_id: ExportId,
    pub object: ObjectRef,
    pub caller_name: String,
    pub owner: LockOwner,
    pub mode: ShareMode,
    pub access: ShareAccess,
}

impl ShareReservation {
    pub fn conflicts_with(&self, mode: ShareMode, access: ShareAccess) -> bool {
        share_conflicts(mode, access, self.mode, self.access)
    }

    pub fn matches(&self, owner: &LockOwner, mode: ShareMode, access: ShareAccess) -> bool {
        &self.owner == owner && self.mode == mode && self.access == access
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_conflict_matrix() {
        for mode in ShareMode::ALL {
            for access in ShareAccess::ALL {
                for held_mode in ShareMode::ALL {
                    for held_access in ShareAccess::ALL {
                        let expected = (mode as u8 & held_access as u8) != 0
                            || (access as u8 & held_mode as u8) != 0;
                        assert_eq!(
                            share_conflicts(mode, access, held_mode, held_access),
                            expected,
                            "mode={:?} access={:?} held_mode={:?} held_access={:?}",
                            mode,
                            access,
                            held_mode,
                            held_access
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_share_conflict_is_asymmetric() {
        // Reader that denies nobody vs. writer that denies readers.
        assert!(share_conflicts(
            ShareMode::DenyNone,
            ShareAccess::Read,
            ShareMode::DenyRead,
            ShareAccess::Write
        ));
        // Request denying writes vs. holder that only reads: compatible.
        assert!(!share_conflicts(
            ShareMode::DenyWrite,
            ShareAccess::Read,
            ShareMode::DenyNone,
            ShareAccess::Read
        ));
        // Same request against a writer: refused.
        assert!(share_conflicts(
            ShareMode::DenyWrite,
            ShareAccess::Read,
            ShareMode::DenyNone,
            ShareAccess::Write
        ));
    }

    #[test]
    fn test_share_mode_from_u32() {
        assert_eq!(ShareMode::from_u32(3), Some(ShareMode::DenyReadWrite));
        assert_eq!(ShareAccess::from_u32(1), Some(ShareAccess::Read));
        assert_eq!(ShareMode::from_u32(4), None);
    }

    #[test]
    fn test_range_overlap() {
        let a = LockRange::new(0, 10);
        let b = LockRange::new(10, 5);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&LockRange::new(9, 1)));
        assert!(LockRange::whole().overlaps(&LockRange::new(u64::MAX - 1, 1)));
        assert!(LockRange::new(100, 0).overlaps(&LockRange::new(5000, 1)));
    }

    #[test]
    fn test_range_subtract_splits() {
        let held = LockRange::new(0, 100);
        let pieces = held.subtract(&LockRange::new(40, 20));
        assert_eq!(pieces, vec![LockRange::new(0, 40), LockRange::new(60, 40)]);

        assert!(held.subtract(&LockRange::whole()).is_empty());
        assert_eq!(held.subtract(&LockRange::new(200, 5)), vec![held]);
    }

    #[test]
    fn test_range_subtract_open_ended() {
        let held = LockRange::new(10, 0);
        let pieces = held.subtract(&LockRange::new(20, 10));
        assert_eq!(pieces, vec![LockRange::new(10, 10), LockRange::new(30, 0)]);
    }
}
