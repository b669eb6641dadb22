#![forbid(unsafe_code)]

//! `digfleet`: supervises a fleet of automated game-client identities that
//! keep one connection each alive and dig a fixed list of blocks.

pub mod client;
pub mod config;
pub mod errors;
pub mod fleet;
pub mod ipc;
pub mod models;
pub mod session;

pub use config::FleetConfig;
pub use errors::{AppError, Result};
