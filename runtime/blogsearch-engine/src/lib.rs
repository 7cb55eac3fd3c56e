//! Native SQLite binding for the blogsearch runtime.
//!
//! Safe wrappers over the raw engine C ABI: the engine handle with its
//! scratch filesystem, value marshaling in and out of engine memory,
//! prepared statements with tracked parameter allocations, and
//! connections that own everything they hand out.
//!
//! Everything here is deliberately single-threaded: a connection and its
//! statements live and die on the thread that opened them. Concurrency is
//! layered on top by the worker channel crate, never inside this one.

mod connection;
mod engine;
mod error;
mod marshal;
mod statement;

pub use connection::Connection;
pub use engine::{Engine, EngineConfig};
pub use error::{DbError, Result};
pub use marshal::{Params, QueryResult, Value};
pub use statement::Statement;
