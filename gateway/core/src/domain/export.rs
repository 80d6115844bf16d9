// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Export Policy
//!
//! Per-export access policy consulted by every mutating procedure.

use serde::{Deserialize, Serialize};

use crate::domain::errors::NfsError;

/// Export access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExportAccess {
    #[default]
    ReadWrite,
    ReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExportPolicy {
    pub access: ExportAccess,
    /// Treat UNSTABLE writes as FILE_SYNC.
    pub trusted_sync: bool,
    /// Acknowledge writes as committed without flushing; COMMIT becomes a no-op.
    pub trusted_write: bool,
}

impl ExportPolicy {
    pub fn is_read_only(&self) -> bool {
        self.access == ExportAccess::ReadOnly
    }

    /// Gate for procedures that modify the export.
    pub fn check_writable(&self) -> Result<(), NfsError> {
        if self.is_read_only() {
            return Err(NfsError::read_only());
        }
        Ok(())
    }
}
