//! Generation engine: turns a conversation into a request, streams the
//! answer into the conversation's placeholder message and enforces that at
//! most one generation runs at a time.

#![deny(unsafe_code)]

pub mod context;
pub mod controller;
pub mod error;
pub mod session;

pub use context::ContextBuilder;
pub use controller::GenerationController;
pub use error::EngineError;
pub use session::{GenerationSession, SessionHandle};
