//! TCP+msgpack IPC transport layer.
//!
//! Length-prefixed msgpack framing over TCP, with one service handler module
//! per RPC surface (kernel, orchestration, interrupt, commbus).

pub mod codec;
pub mod handlers;
pub mod router;
pub mod server;

pub use server::IpcServer;
