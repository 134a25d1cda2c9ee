//! MidOS knowledge server library.
//!
//! The binary (`src/main.rs`) is a thin clap shell; everything testable
//! lives here. `mcp::dispatch_jsonrpc` is the shared JSON-RPC entry point
//! for both the stdio and HTTP transports.

pub mod api;
pub mod catalog;
pub mod embedding;
pub mod error;
pub mod gate;
pub mod handshake;
pub mod keys;
pub mod knowledge;
pub mod mcp;
pub mod mcp_http;
pub mod profile;
pub mod store;
pub mod synapse;
pub mod types;

use std::path::PathBuf;

/// Resolve the data root: explicit flag, then `MIDOS_ROOT`, then cwd.
pub fn resolve_root(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var("MIDOS_ROOT").ok().map(PathBuf::from))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}
