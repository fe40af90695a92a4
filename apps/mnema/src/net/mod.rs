//! # Wire Protocol Server
//!
//! Framed binary request/response protocol over TCP, adapting socket
//! commands onto a memory context.
//!
//! - [`proto`] — header layouts, command codes, parameter codec
//! - [`server`] — tokio accept loop and per-connection command pump

pub mod proto;
pub mod server;

pub use server::run_server;
