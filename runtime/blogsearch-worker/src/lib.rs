//! Worker channel for the blogsearch engine.
//!
//! The engine's API is synchronous and strictly single-threaded, so a
//! dedicated thread owns the connection and everything it spawns. Callers
//! hold a [`ChannelClient`] and speak a correlated command/response
//! protocol; commands execute in arrival order, one at a time.

mod client;
mod error;
mod protocol;
mod worker;

pub use client::{ChannelClient, spawn};
pub use error::{ChannelError, Result};
pub use protocol::{Command, Reply, Request, Response};
