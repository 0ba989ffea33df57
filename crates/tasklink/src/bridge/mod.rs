//! Wire bridge between a worker and its polling agent.
//!
//! # Architecture
//!
//! - **frame**: Message types (InboundFrame, OutboundFrame, TaskOutput)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **chunk**: size-bounded splitting and reassembly of byte buffers
//! - **transport**: Unix socket listener and connector

pub mod chunk;
pub mod codec;
pub mod frame;
pub mod transport;
