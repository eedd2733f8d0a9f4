//! Core abstractions for the agent relay.
//!
//! This crate provides the fundamental building blocks:
//! - `AgentMessage` - Status/error/done messages of an invocation
//! - `RunOptions` / `RunRequest` - What a caller asks a provider to do
//! - `Handler` - The run/abort/undo/redo contract consumed by the relay

pub mod message;
pub mod options;
pub mod traits;

pub use message::{AgentMessage, THINKING_STATUS};
pub use options::{RunOptions, RunRequest, compose_prompt};
pub use traits::{AgentStream, Handler, HandlerError, HandlerMethod};
