// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain Layer
//!
//! Value objects, the backend port, NLM4 payloads and the protocol error
//! taxonomy. Nothing in here performs I/O.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer

pub mod backend;
pub mod config;
pub mod errors;
pub mod export;
pub mod file_handle;
pub mod lock;
pub mod nlm;
