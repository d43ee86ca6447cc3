//! Control RPC: length-delimited JSON frames over a Unix socket or TCP.
//!
//! Unary methods get exactly one response frame. Server-streaming methods
//! (`StreamLogs`, `WatchRuntimeStatus`, `WatchServerInitStatus`) emit any
//! number of `eos = false` frames sharing the request id, terminated by one
//! `eos = true` frame (or an error frame).

pub mod client;
pub mod server;
pub mod wire;

pub use client::RpcClient;
pub use server::RpcServer;
pub use wire::{RpcErrorBody, RpcMethod, RpcRequest, RpcResponse};
