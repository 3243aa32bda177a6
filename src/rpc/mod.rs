//! The daemon RPC bus (component N): a newline-delimited JSON protocol
//! over a Unix domain socket that lets a CLI (or any other client) drive a
//! long-running engine process.

pub mod client;
pub mod daemon;
pub mod protocol;
pub mod server;

pub use client::Client;
pub use protocol::{Event, EventKind, Frame, Request, RequestBody, Response};
pub use server::Server;
