// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! NFS FileHandle Serialization
//!
//! Fixed 40-byte wire layout, serialized with bincode (fixed-int,
//! little-endian) so the byte image is stable across releases:
//!
//! | bytes  | field       |
//! |--------|-------------|
//! | 0..4   | ident `NFH3`|
//! | 4      | version     |
//! | 5      | flags       |
//! | 6..8   | reserved    |
//! | 8..24  | export id   |
//! | 24..40 | object id   |
//!
//! The version byte is the escape hatch for any future layout change.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Encode and decode opaque file handles

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::errors::NfsError;
use crate::domain::file_handle::{ExportId, FileHandle, HandleFlags, ObjectId};

/// Encoded handle size in bytes
pub const FILE_HANDLE_SIZE: usize = 40;

/// NFSv3 upper bound on handle size
pub const NFS3_FHSIZE: usize = 64;

const IDENT: [u8; 4] = *b"NFH3";
const VERSION: u8 = 1;

/// FileHandle serialization errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FileHandleError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("FileHandle has wrong size: {size} bytes (expected {FILE_HANDLE_SIZE})")]
    WrongSize { size: usize },

    #[error("FileHandle ident mismatch")]
    BadIdent,

    #[error("Unsupported FileHandle version {0}")]
    UnsupportedVersion(u8),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl From<FileHandleError> for NfsError {
    fn from(err: FileHandleError) -> Self {
        NfsError::BadHandle(err.to_string())
    }
}

#[derive(Serialize, Deserialize)]
struct WireHandle {
    ident: [u8; 4],
    version: u8,
    flags: u8,
    reserved: u16,
    export_id: [u8; 16],
    object_id: [u8; 16],
}

/// Encode a FileHandle for the NFS wire protocol
///
/// # Arguments
/// * `handle` - The decoded file handle
///
/// # Returns
/// * `Ok(Bytes)` - Serialized handle, always [`FILE_HANDLE_SIZE`] bytes
/// * `Err(FileHandleError)` - Serialization failed
pub fn encode_file_handle(handle: &FileHandle) -> Result<Bytes, FileHandleError> {
    let wire = WireHandle {
        ident: IDENT,
        version: VERSION,
        flags: handle.flags.bits(),
        reserved: 0,
        export_id: *handle.export_id.0.as_bytes(),
        object_id: *handle.object_id.as_bytes(),
    };
    let bytes =
        bincode::serialize(&wire).map_err(|e| FileHandleError::Serialization(e.to_string()))?;

    if bytes.len() != FILE_HANDLE_SIZE {
        return Err(FileHandleError::WrongSize { size: bytes.len() });
    }

    Ok(Bytes::from(bytes))
}

/// Decode a FileHandle from the NFS wire protocol
///
/// Only the structure is checked here. Whether the export and object
/// still exist is the resolver's business.
///
/// # Arguments
/// * `bytes` - Opaque handle as sent by the client
///
/// # Returns
/// * `Ok(FileHandle)` - Decoded handle
/// * `Err(FileHandleError)` - Wrong size, ident or version
pub fn decode_file_handle(bytes: &[u8]) -> Result<FileHandle, FileHandleError> {
    if bytes.len() != FILE_HANDLE_SIZE {
        return Err(FileHandleError::WrongSize { size: bytes.len() });
    }

    let wire: WireHandle = bincode::deserialize(bytes)
        .map_err(|e| FileHandleError::Deserialization(e.to_string()))?;

    if wire.ident != IDENT {
        return Err(FileHandleError::BadIdent);
    }
    if wire.version != VERSION {
        return Err(FileHandleError::UnsupportedVersion(wire.version));
    }

    Ok(FileHandle::new(
        ExportId(Uuid::from_bytes(wire.export_id)),
        ObjectId::from_bytes(wire.object_id),
        HandleFlags(wire.flags),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let export = ExportId::new();
        for handle in [
            FileHandle::root(export),
            FileHandle::new(export, ObjectId::new(), HandleFlags::NONE),
            FileHandle::new(export, ObjectId::new(), HandleFlags::DIRECTORY),
            FileHandle::new(export, ObjectId::new(), HandleFlags(0xff)),
        ] {
            let bytes = encode_file_handle(&handle).unwrap();
            let decoded = decode_file_handle(&bytes).unwrap();
            assert_eq!(handle, decoded);
            assert_eq!(encode_file_handle(&decoded).unwrap(), bytes);
        }
    }

    #[test]
    fn test_fixed_size_within_nfs3_limit() {
        let handle = FileHandle::new(ExportId::new(), ObjectId::new(), HandleFlags::NONE);
        let bytes = encode_file_handle(&handle).unwrap();
        assert_eq!(bytes.len(), FILE_HANDLE_SIZE);
        assert!(bytes.len() <= NFS3_FHSIZE);
    }

    #[test]
    fn test_byte_layout_is_stable() {
        let export = ExportId::from_string("00112233-4455-6677-8899-aabbccddeeff").unwrap();
        let bytes = encode_file_handle(&FileHandle::root(export)).unwrap();
        assert_eq!(&bytes[0..4], b"NFH3");
        assert_eq!(bytes[4], 1);
        assert_eq!(bytes[5], 0x03);
        assert_eq!(&bytes[6..8], &[0, 0]);
        assert_eq!(bytes[8], 0x00);
        assert_eq!(bytes[23], 0xff);
        assert_eq!(&bytes[24..39], &[0u8; 15]);
        assert_eq!(bytes[39], 1);
    }

    #[test]
    fn test_rejects_wrong_size() {
        assert_eq!(
            decode_file_handle(&[0u8; 12]),
            Err(FileHandleError::WrongSize { size: 12 })
        );
        assert!(decode_file_handle(&[]).is_err());
    }

    #[test]
    fn test_rejects_bad_marker() {
        let handle = FileHandle::root(ExportId::new());
        let mut bytes = encode_file_handle(&handle).unwrap().to_vec();
        bytes[0] = b'X';
        assert_eq!(decode_file_handle(&bytes), Err(FileHandleError::BadIdent));

        let mut bytes = encode_file_handle(&handle).unwrap().to_vec();
        bytes[4] = 9;
        assert_eq!(
            decode_file_handle(&bytes),
            Err(FileHandleError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn test_error_maps_to_bad_handle() {
        let err: NfsError = FileHandleError::BadIdent.into();
        assert!(matches!(err, NfsError::BadHandle(_)));
    }
}
