//! Wire frames exchanged between a worker and its polling agent.
//!
//! One task stream carries, from the agent:
//! `Init`, the payload chunks, then any number of `DependencyInit` +
//! dependency chunk sequences, closed by a `DependencyInit` without a key.
//! Later, one `CreateTaskAck` per child-task batch the worker submitted.
//!
//! From the worker: child-task batches (`CreateTaskInit`, then per request a
//! `CreateTaskHeader` and its payload chunks, then `CreateTaskBatchEnd`),
//! result sequences (`ResultInit`, `ResultChunk`*, `ResultComplete`,
//! `ResultBatchLast`), and finally one `Output`.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::chunk::Chunk;
use super::codec::base64_bytes;

/// String options attached to a task.
pub type TaskOptions = BTreeMap<String, String>;

/// Frames sent by the polling agent to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    /// First frame of every task stream.
    Init {
        session_id: String,
        task_id: String,
        #[serde(default)]
        options: TaskOptions,
        #[serde(default)]
        expected_output_keys: Vec<String>,
    },

    PayloadChunk {
        #[serde(with = "base64_bytes")]
        data: Bytes,
        is_complete: bool,
    },

    /// Opens a dependency chunk sequence; an absent or empty key ends the list.
    DependencyInit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },

    DependencyChunk {
        #[serde(with = "base64_bytes")]
        data: Bytes,
        is_complete: bool,
    },

    /// Reply to one child-task batch.
    CreateTaskAck(CreateTaskReply),
}

impl InboundFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::PayloadChunk { .. } => "payload_chunk",
            Self::DependencyInit { .. } => "dependency_init",
            Self::DependencyChunk { .. } => "dependency_chunk",
            Self::CreateTaskAck(_) => "create_task_ack",
        }
    }
}

/// Frames sent by the worker to the polling agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    CreateTaskInit {
        request_id: String,
        #[serde(default)]
        shared_options: TaskOptions,
    },

    CreateTaskHeader {
        task_id: String,
        #[serde(default)]
        dependencies: Vec<String>,
        #[serde(default)]
        expected_output_keys: Vec<String>,
    },

    CreateTaskPayloadChunk {
        #[serde(with = "base64_bytes")]
        data: Bytes,
        is_complete: bool,
    },

    CreateTaskBatchEnd,

    ResultInit {
        request_id: String,
        key: String,
    },

    ResultChunk {
        request_id: String,
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },

    ResultComplete {
        request_id: String,
    },

    ResultBatchLast {
        request_id: String,
    },

    /// Final frame of a task stream.
    Output { output: TaskOutput },
}

impl OutboundFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateTaskInit { .. } => "create_task_init",
            Self::CreateTaskHeader { .. } => "create_task_header",
            Self::CreateTaskPayloadChunk { .. } => "create_task_payload_chunk",
            Self::CreateTaskBatchEnd => "create_task_batch_end",
            Self::ResultInit { .. } => "result_init",
            Self::ResultChunk { .. } => "result_chunk",
            Self::ResultComplete { .. } => "result_complete",
            Self::ResultBatchLast { .. } => "result_batch_last",
            Self::Output { .. } => "output",
        }
    }

    pub(crate) fn payload_chunk(chunk: Chunk) -> Self {
        Self::CreateTaskPayloadChunk {
            data: chunk.data,
            is_complete: chunk.is_complete,
        }
    }
}

/// Outcome of a child-task batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateStatus {
    Ok,
    /// Some or all tasks were not created; see `failed_ids`.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTaskReply {
    pub request_id: String,
    pub status: CreateStatus,
    /// Empty with a `Failed` status means the whole batch failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_ids: Vec<String>,
}

impl CreateTaskReply {
    pub fn ok(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status: CreateStatus::Ok,
            failed_ids: Vec::new(),
        }
    }

    pub fn failed(request_id: impl Into<String>, failed_ids: Vec<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status: CreateStatus::Failed,
            failed_ids,
        }
    }
}

/// Terminal status of one task attempt, as reported to the agent.
///
/// Application failures travel as `Error`; they are data, not protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutput {
    Ok,
    Error { details: String },
    /// The task stream itself was malformed; the task never ran.
    ProtocolError { details: String },
}

impl TaskOutput {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}
