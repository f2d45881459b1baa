//! Shared domain types for Dictaflow: configuration, the upstream agent
//! message model, tool payload projections, request validation, and the
//! cancellation primitive.

pub mod cancel;
pub mod config;
pub mod error;
pub mod message;
pub mod payload;
pub mod validate;

pub use cancel::CancelToken;
pub use error::{Error, Result};
pub use message::{AgentMessage, BoxStream, UsageBlock};
