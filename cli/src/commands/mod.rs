// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the nfs3gw CLI

pub mod config;
pub mod exports;
pub mod handle;

pub use self::config::ConfigCommand;
pub use self::exports::ExportsCommand;
pub use self::handle::HandleCommand;
