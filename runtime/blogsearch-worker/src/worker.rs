//! The channel actor: a dedicated thread owning the engine and the open
//! connection, executing commands strictly in arrival order.

use blogsearch_engine::{Connection, DbError, Engine, EngineConfig};
use crossbeam_channel::{Receiver, Sender};

use crate::protocol::{Command, Reply, Request, Response};

pub(crate) fn channel_loop(requests: Receiver<Request>, replies: Sender<Response>) {
    let mut engine: Option<Engine> = None;
    let mut connection: Option<Connection> = None;

    while let Ok(request) = requests.recv() {
        let request_id = request.request_id;
        tracing::debug!(request_id, command = request.command.tag(), "dispatch");
        match request.command {
            Command::Init { scratch_dir } => {
                let reply = if engine.is_some() {
                    // Loading is once-per-channel; a repeat init resolves
                    // against the existing instance.
                    Reply::Ready
                } else {
                    match Engine::load(EngineConfig { scratch_dir }) {
                        Ok(loaded) => {
                            engine = Some(loaded);
                            Reply::Ready
                        }
                        Err(err) => error_reply(&err),
                    }
                };
                send(&replies, request_id, reply);
            }

            Command::Open { db_image } => {
                let reply = match engine.as_ref() {
                    None => Reply::Error {
                        code: -1,
                        message: "open: engine is not initialized".into(),
                    },
                    Some(engine) => {
                        if let Some(previous) = connection.take() {
                            if let Err(err) = previous.close() {
                                tracing::warn!(error = %err, "closing previous connection failed");
                            }
                        }
                        match engine.open(Some(&db_image)) {
                            Ok(opened) => {
                                connection = Some(opened);
                                Reply::Opened
                            }
                            Err(err) => error_reply(&err),
                        }
                    }
                };
                send(&replies, request_id, reply);
            }

            Command::Exec { sql } => {
                let reply = match connection.as_ref() {
                    None => unopened("exec"),
                    Some(conn) => match conn.exec(&sql) {
                        Ok(results) => Reply::Results { results },
                        Err(err) => error_reply(&err),
                    },
                };
                send(&replies, request_id, reply);
            }

            Command::Each { sql, params } => match connection.as_ref() {
                None => send(&replies, request_id, unopened("each")),
                Some(conn) => {
                    let row_replies = replies.clone();
                    let done_replies = replies.clone();
                    let outcome = conn.each(
                        &sql,
                        params.as_ref(),
                        |row| send(&row_replies, request_id, Reply::Row { row }),
                        || send(&done_replies, request_id, Reply::Done),
                    );
                    if let Err(err) = outcome {
                        send(&replies, request_id, error_reply(&err));
                    }
                }
            },

            Command::Export => {
                let reply = match connection.as_ref() {
                    None => unopened("export"),
                    Some(conn) => match conn.export() {
                        Ok(db_image) => Reply::Exported { db_image },
                        Err(err) => error_reply(&err),
                    },
                };
                send(&replies, request_id, reply);
            }

            Command::Close => {
                let reply = match connection.take() {
                    None => unopened("close"),
                    Some(conn) => match conn.close() {
                        Ok(()) => Reply::Closed,
                        Err(err) => error_reply(&err),
                    },
                };
                send(&replies, request_id, reply);
            }
        }
    }

    // The client hung up; tear down whatever is still open.
    if let Some(conn) = connection.take() {
        if conn.is_open() {
            if let Err(err) = conn.close() {
                tracing::warn!(error = %err, "closing connection on shutdown failed");
            }
        }
    }
    tracing::debug!("channel loop finished");
}

fn send(replies: &Sender<Response>, request_id: u64, reply: Reply) {
    if replies.send(Response { request_id, reply }).is_err() {
        tracing::warn!(request_id, "reply dropped: client side is gone");
    }
}

fn error_reply(err: &DbError) -> Reply {
    match err {
        DbError::Engine { code, message } => Reply::Error {
            code: *code,
            message: message.clone(),
        },
        other => Reply::Error {
            code: -1,
            message: other.to_string(),
        },
    }
}

fn unopened(op: &str) -> Reply {
    Reply::Error {
        code: -1,
        message: format!("{op}: database is not opened"),
    }
}
