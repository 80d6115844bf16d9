// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! NFSv3 Gateway Core
//!
//! File-handle resolution and NLM4 lock coordination for an NFSv3 server
//! sitting in front of a distributed filesystem backend.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Resolver, call contexts, lock registry and coordinator,
//!   NFSv3 procedure handlers

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
