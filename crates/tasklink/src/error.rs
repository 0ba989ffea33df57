//! Protocol-level failures on a task stream.
//!
//! Every variant is fatal for the stream it occurred on: the remote side can
//! no longer be trusted to be in step with us.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unexpected {found} frame while {state}")]
    UnexpectedFrame {
        state: &'static str,
        found: &'static str,
    },

    #[error("stream ended while {state}")]
    UnexpectedEof { state: &'static str },

    #[error("chunk received after the terminal chunk of its sequence")]
    ChunkAfterComplete,

    #[error("chunk sequence ended without a terminal chunk")]
    MissingTerminalChunk,

    #[error("dependency {0} sent twice")]
    DuplicateDependency(String),

    #[error("reply for request {found}, expected {expected}")]
    MismatchedReply { expected: String, found: String },

    #[error("frame stream failed: {0}")]
    Io(#[from] io::Error),
}
