//! Process adapter for external AI coding CLIs.
//!
//! Provides:
//! - Per-provider argument builders and stream-JSON event mapping
//! - Command building and executable resolution
//! - The generic process adapter that spawns, parses and cancels runs

pub mod adapter;
pub mod command;
pub mod provider;
pub mod providers;
pub mod resolve;

pub use adapter::{AdapterEvent, DEFAULT_GRACE_PERIOD, ProcessAdapter};
pub use command::{CommandBuildError, CommandBuilder, CommandParts};
pub use provider::{ArgsContext, ProviderEvent, ProviderSpec};
pub use resolve::resolve_executable_path;
