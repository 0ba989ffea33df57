//! tasklink: transport layer for distributed task workers.
//!
//! A worker receives one task per stream from its polling agent, runs it
//! through a [`WorkerHost`], and streams results and child tasks back.
//! Clients and workers reach the control plane through pooled channels with
//! retry ([`Submitter`], [`RpcInvoker`]). Call arguments are packed with
//! [`values`].

mod agent;
mod assembly;
mod error;
mod task;

pub mod bridge;
pub mod config;
pub mod pool;
pub mod rpc;
pub mod submitter;
pub mod telemetry;
pub mod worker;

pub use tasklink_values as values;
pub use tokio_util::sync::CancellationToken;

pub use agent::{Agent, AgentError};
pub use assembly::{TaskAssembler, receive_task};
pub use bridge::chunk::{Chunk, PendingBuffer, reassemble, split};
pub use bridge::frame::{
    CreateStatus, CreateTaskReply, InboundFrame, OutboundFrame, TaskOptions, TaskOutput,
};
pub use bridge::transport::{AgentConnection, FrameSink, FrameSource, WorkerListener, connect};
pub use config::{ConfigError, TransportConfig};
pub use error::ProtocolError;
pub use pool::{ChannelPool, PooledChannel};
pub use rpc::{ErrorClass, RetryPolicy, RpcError, RpcInvoker, StatusCode};
pub use submitter::{CompletionSummary, ControlPlane, SubmitError, Submitter};
pub use task::{TaskDescriptor, TaskError, TaskRequest};
pub use worker::{WorkerError, WorkerHost, run_worker, serve_task};
