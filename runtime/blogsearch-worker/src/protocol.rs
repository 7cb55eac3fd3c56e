//! Command/response schema for the worker channel.
//!
//! Every request carries a correlation token echoed by its replies, so a
//! response can never be attributed to the wrong command. All types are
//! serde-serializable: the transport is an in-process channel today, but
//! nothing here would have to change for a serialized pipe.

use std::collections::HashMap;
use std::path::PathBuf;

use blogsearch_engine::{Params, QueryResult, Value};
use serde::{Deserialize, Serialize};

/// A command envelope. `request_id` correlates the reply.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub request_id: u64,
    pub command: Command,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Command {
    /// Construct the engine. Idempotent per channel: a repeat init
    /// acknowledges against the already-loaded instance.
    Init {
        #[serde(default)]
        scratch_dir: Option<PathBuf>,
    },
    /// Open a database from a raw file image, replacing any open one.
    /// The buffer is moved into the command; the sender gives it up.
    Open {
        #[serde(with = "serde_bytes")]
        db_image: Vec<u8>,
    },
    /// Run a script, replying with every materialized result set.
    Exec { sql: String },
    /// Run one statement, streaming a `Row` reply per result row and a
    /// terminal `Done`.
    Each {
        sql: String,
        #[serde(default)]
        params: Option<Params>,
    },
    /// Snapshot the open database as a file image.
    Export,
    /// Close the open database.
    Close,
}

impl Command {
    pub fn tag(&self) -> &'static str {
        match self {
            Command::Init { .. } => "init",
            Command::Open { .. } => "open",
            Command::Exec { .. } => "exec",
            Command::Each { .. } => "each",
            Command::Export => "export",
            Command::Close => "close",
        }
    }
}

/// A reply envelope, echoing the request's correlation token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub request_id: u64,
    pub reply: Reply,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Reply {
    /// The engine is loaded.
    Ready,
    /// The database image is open.
    Opened,
    /// Terminal reply to `Exec`.
    Results { results: Vec<QueryResult> },
    /// One streamed row for `Each`.
    Row { row: HashMap<String, Value> },
    /// Terminal reply to `Each`.
    Done,
    /// Terminal reply to `Export`.
    Exported {
        #[serde(with = "serde_bytes")]
        db_image: Vec<u8>,
    },
    /// Terminal reply to `Close`.
    Closed,
    /// Terminal failure reply to any command.
    Error { code: i32, message: String },
}

impl Reply {
    pub fn tag(&self) -> &'static str {
        match self {
            Reply::Ready => "ready",
            Reply::Opened => "opened",
            Reply::Results { .. } => "results",
            Reply::Row { .. } => "row",
            Reply::Done => "done",
            Reply::Exported { .. } => "exported",
            Reply::Closed => "closed",
            Reply::Error { .. } => "error",
        }
    }
}
