//! Session orchestration for the agent relay.
//!
//! Provides:
//! - `SessionRegistry` - In-memory session, thread and cancellation state
//! - `ProviderHandler` - `Handler` over one provider CLI

pub mod handler;
pub mod registry;

pub use handler::ProviderHandler;
pub use registry::{AgentSession, CancellationHandle, SessionRegistry};
