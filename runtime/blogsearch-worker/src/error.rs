//! Client-facing channel errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChannelError>;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// Engine failure relayed across the channel, message text verbatim.
    #[error("engine error {code}: {message}")]
    Engine { code: i32, message: String },

    /// The worker thread is gone; the command or its reply was dropped.
    #[error("worker channel is closed")]
    ChannelClosed,

    /// A reply carried the wrong correlation token. Internal-consistency
    /// violation; never retried.
    #[error("response correlation mismatch: awaiting {expected}, received {received}")]
    ProtocolMismatch { expected: u64, received: u64 },

    /// A correctly-correlated reply carried an impossible tag for the
    /// command that was sent.
    #[error("unexpected {received:?} reply to request {request_id}")]
    UnexpectedReply {
        request_id: u64,
        received: &'static str,
    },
}
