//! Core types for the kernel.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (ProcessId, EnvelopeId, etc.)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for kernel, pipeline, and resources

mod config;
mod errors;
mod ids;

pub use config::{CleanupConfig, Config, DefaultLimits, IpcConfig};
pub use errors::{Error, ErrorCode, Result};
pub use ids::{EnvelopeId, InterruptId, ProcessId, RequestId, SessionId, UserId};
