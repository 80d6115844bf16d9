// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Infrastructure Layer
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Handle codec, object cache and the in-memory backend

pub mod memory_backend;
pub mod nfs;
pub mod object_cache;

use std::sync::Arc;

use crate::domain::backend::Backend;
use crate::domain::config::BackendConfig;

pub use memory_backend::InMemoryBackend;

/// Build the backend serving one export
pub fn create_backend(config: &BackendConfig) -> Arc<dyn Backend> {
    match config {
        BackendConfig::Memory => Arc::new(InMemoryBackend::new()),
    }
}
