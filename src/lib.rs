//! # Jeeves Core - Multi-Agent Orchestration Kernel
//!
//! Rust implementation of the Jeeves kernel providing:
//! - Process lifecycle management with Unix-like state transitions
//! - Resource quota enforcement (LLM calls, tokens, hops, iterations)
//! - Rate limiting with configurable windows
//! - Flow interrupts for human-in-the-loop patterns
//! - A length-prefixed msgpack/TCP IPC service layer for external clients
//! - Message bus for pub/sub and request/response patterns
//!
//! ## Architecture
//!
//! No subsystem is owned by a single actor; each locks itself (§5):
//! ```text
//!                    ┌─────────────────────────────────┐
//!   IPC requests  →  │         Kernel (Arc)            │
//!                    │  ┌─────────┐ ┌─────────┐        │
//!                    │  │Resources│ │Lifecycle│        │
//!                    │  │ Tracker │ │ Manager │        │
//!                    │  │(RwLock) │ │(RwLock) │        │
//!                    │  └─────────┘ └─────────┘        │
//!                    │  ┌─────────┐ ┌─────────┐        │
//!                    │  │Interrupt│ │RateLimit│        │
//!                    │  │ Service │ │   er    │        │
//!                    │  │(RwLock) │ │(Mutexes)│        │
//!                    │  └─────────┘ └─────────┘        │
//!                    └─────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod commbus;
pub mod envelope;
pub mod ipc;
pub mod kernel;
pub mod types;

// Internal utilities
pub mod observability;

pub use types::{Config, Error, Result};
