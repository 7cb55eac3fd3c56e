//! Caller-side proxy for the worker channel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::thread::JoinHandle;

use blogsearch_engine::{Params, QueryResult, Value};
use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::error::{ChannelError, Result};
use crate::protocol::{Command, Reply, Request, Response};
use crate::worker::channel_loop;

/// Spawn a worker channel and hand back its client.
pub fn spawn() -> std::io::Result<ChannelClient> {
    let (request_tx, request_rx) = unbounded();
    let (reply_tx, reply_rx) = unbounded();
    let worker = std::thread::Builder::new()
        .name("blogsearch-db".into())
        .spawn(move || channel_loop(request_rx, reply_tx))?;
    Ok(ChannelClient {
        requests: request_tx,
        replies: reply_rx,
        next_id: 1,
        worker: Some(worker),
    })
}

/// Client half of a worker channel.
///
/// Methods take `&mut self`: a client has at most one command in flight,
/// and every reply is checked against the request's correlation token.
/// Blocking calls return [`ChannelError::ChannelClosed`] if the worker
/// goes away instead of waiting forever.
pub struct ChannelClient {
    requests: Sender<Request>,
    replies: Receiver<Response>,
    next_id: u64,
    worker: Option<JoinHandle<()>>,
}

impl ChannelClient {
    /// Load the engine with default configuration. Idempotent.
    pub fn init(&mut self) -> Result<()> {
        self.init_with(None)
    }

    /// Load the engine, pinning its scratch directory when given.
    pub fn init_with(&mut self, scratch_dir: Option<PathBuf>) -> Result<()> {
        match self.post(Command::Init { scratch_dir })? {
            (_, Reply::Ready) => Ok(()),
            (request_id, other) => Err(unexpected(request_id, &other)),
        }
    }

    /// Open a database from a raw file image. The buffer moves into the
    /// channel; any previously open database is closed first.
    pub fn open(&mut self, db_image: Vec<u8>) -> Result<()> {
        match self.post(Command::Open { db_image })? {
            (_, Reply::Opened) => Ok(()),
            (request_id, other) => Err(unexpected(request_id, &other)),
        }
    }

    /// Run a script and collect every materialized result set.
    pub fn exec(&mut self, sql: &str) -> Result<Vec<QueryResult>> {
        let command = Command::Exec {
            sql: sql.to_string(),
        };
        match self.post(command)? {
            (_, Reply::Results { results }) => Ok(results),
            (request_id, other) => Err(unexpected(request_id, &other)),
        }
    }

    /// Run one statement, invoking `on_row` per streamed row; returns
    /// once the terminal reply arrives.
    pub fn each<R>(&mut self, sql: &str, params: Option<Params>, mut on_row: R) -> Result<()>
    where
        R: FnMut(HashMap<String, Value>),
    {
        let request_id = self.send(Command::Each {
            sql: sql.to_string(),
            params,
        })?;
        loop {
            match self.recv_for(request_id)? {
                Reply::Row { row } => on_row(row),
                Reply::Done => return Ok(()),
                other => return Err(unexpected(request_id, &other)),
            }
        }
    }

    /// Snapshot the open database as a raw file image.
    pub fn export(&mut self) -> Result<Vec<u8>> {
        match self.post(Command::Export)? {
            (_, Reply::Exported { db_image }) => Ok(db_image),
            (request_id, other) => Err(unexpected(request_id, &other)),
        }
    }

    /// Close the open database.
    pub fn close(&mut self) -> Result<()> {
        match self.post(Command::Close)? {
            (_, Reply::Closed) => Ok(()),
            (request_id, other) => Err(unexpected(request_id, &other)),
        }
    }

    /// Shut the channel down and join the worker thread. Any replies
    /// still in flight are dropped.
    pub fn terminate(mut self) {
        let worker = self.worker.take();
        drop(self);
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }

    fn send(&mut self, command: Command) -> Result<u64> {
        let request_id = self.next_id;
        self.next_id += 1;
        self.requests
            .send(Request {
                request_id,
                command,
            })
            .map_err(|_| ChannelError::ChannelClosed)?;
        Ok(request_id)
    }

    fn post(&mut self, command: Command) -> Result<(u64, Reply)> {
        let request_id = self.send(command)?;
        let reply = self.recv_for(request_id)?;
        Ok((request_id, reply))
    }

    fn recv_for(&mut self, request_id: u64) -> Result<Reply> {
        let response = self
            .replies
            .recv()
            .map_err(|_| ChannelError::ChannelClosed)?;
        if response.request_id != request_id {
            return Err(ChannelError::ProtocolMismatch {
                expected: request_id,
                received: response.request_id,
            });
        }
        if let Reply::Error { code, message } = response.reply {
            return Err(ChannelError::Engine { code, message });
        }
        Ok(response.reply)
    }
}

fn unexpected(request_id: u64, reply: &Reply) -> ChannelError {
    ChannelError::UnexpectedReply {
        request_id,
        received: reply.tag(),
    }
}
