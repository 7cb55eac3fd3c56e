//! Error taxonomy for the engine binding.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    /// Non-OK return code from the engine. The message is read from the
    /// connection's error slot at the moment of failure; the slot is
    /// overwritten by the next engine call.
    #[error("engine error {code}: {message}")]
    Engine { code: i32, message: String },

    /// A dynamic value of a shape the engine cannot represent.
    #[error("cannot bind value: {0}")]
    Binding(String),

    #[error("statement has been finalized")]
    StatementClosed,

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("nothing to prepare: the SQL text contains no statement")]
    EmptyStatement,

    #[error("parameters cannot be bound to a multi-statement script")]
    ParamsOnScript,

    #[error("SQL text contains an interior NUL byte")]
    InvalidSql(#[from] std::ffi::NulError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
