//! The daemon: lifecycle orchestration, request routing, the search path
//! and the socket server.

mod cache;
mod core;
mod lifecycle;
mod router;
mod search;
mod server;
mod sink;
mod state;

pub use crate::core::{DaemonCore, InitError};
pub use lifecycle::{Daemon, DaemonConfig, ExitCode};
pub use router::Router;
pub use search::SearchService;
pub use server::Server;
pub use state::LifecycleState;
