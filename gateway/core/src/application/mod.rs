// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Application Layer
//!
//! Request-scoped orchestration: resolving handles, running NFSv3 and NLM4
//! procedures, and the long-lived lock state they share.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer

pub mod call_context;
pub mod export_table;
pub mod gateway;
pub mod grace_period;
pub mod lock_coordinator;
pub mod lock_registry;
pub mod nfs3_service;
pub mod resolver;

pub use call_context::{CallContext, CallContextPool, ResolvedLocation};
pub use export_table::{Export, ExportTable};
pub use gateway::{GatewayError, NfsGateway};
pub use grace_period::GracePeriod;
pub use lock_coordinator::LockCoordinator;
pub use lock_registry::{DescriptorKey, DescriptorLease, LockClient, LockRegistry};
pub use nfs3_service::Nfs3Service;
pub use resolver::{EntryIntent, EntryTarget, Resolver};
