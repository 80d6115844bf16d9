// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! NFS Wire Infrastructure
//!
//! Byte-level encoding shared by every procedure that accepts or returns a
//! file handle. Per-procedure XDR marshaling belongs to the dispatcher.

pub mod file_handle;

pub use file_handle::{decode_file_handle, encode_file_handle, FileHandleError, FILE_HANDLE_SIZE};
