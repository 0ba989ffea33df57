//! Worker-side handle on the polling agent.
//!
//! After a task is assembled, the rest of its stream belongs to an [`Agent`].
//! User code creates child tasks and returns results through it. Each logical
//! write sequence (one batch, one result) runs under a single lock so two
//! sequences never interleave on the wire.

use std::num::NonZeroUsize;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;

use crate::bridge::chunk;
use crate::bridge::frame::{
    CreateStatus, CreateTaskReply, InboundFrame, OutboundFrame, TaskOptions, TaskOutput,
};
use crate::bridge::transport::{FrameSink, FrameSource};
use crate::error::ProtocolError;
use crate::task::TaskRequest;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The agent refused some or all tasks of a batch. The stream stays usable.
    #[error("task creation failed for {}", .failed_ids.join(", "))]
    TasksRejected { failed_ids: Vec<String> },

    /// An earlier protocol failure left the stream out of step.
    #[error("task stream is broken: {0}")]
    Broken(String),
}

/// Frames for one child-task batch, with the ids they were assigned.
#[derive(Debug)]
pub(crate) struct TaskBatch {
    pub request_id: String,
    pub task_ids: Vec<String>,
    pub frames: Vec<OutboundFrame>,
}

/// Lay out a batch: init, then per request a header and its payload chunks,
/// then the batch terminator after the last request.
pub(crate) fn task_batch_frames(
    options: &TaskOptions,
    requests: Vec<TaskRequest>,
    max_chunk_size: NonZeroUsize,
) -> TaskBatch {
    let request_id = uuid::Uuid::new_v4().to_string();
    let mut frames = vec![OutboundFrame::CreateTaskInit {
        request_id: request_id.clone(),
        shared_options: options.clone(),
    }];
    let mut task_ids = Vec::with_capacity(requests.len());

    for request in requests {
        let task_id = request
            .task_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        frames.push(OutboundFrame::CreateTaskHeader {
            task_id: task_id.clone(),
            dependencies: request.dependencies,
            expected_output_keys: request.expected_output_keys,
        });
        frames.extend(
            chunk::split(request.payload, max_chunk_size).map(OutboundFrame::payload_chunk),
        );
        task_ids.push(task_id);
    }
    frames.push(OutboundFrame::CreateTaskBatchEnd);

    TaskBatch {
        request_id,
        task_ids,
        frames,
    }
}

/// Match a reply to the batch it answers.
///
/// The outer error means the reply belongs to another request; the inner one
/// lists the task ids that were not created.
pub(crate) fn check_reply(
    reply: CreateTaskReply,
    request_id: &str,
    task_ids: &[String],
) -> Result<Result<(), Vec<String>>, ProtocolError> {
    if reply.request_id != request_id {
        return Err(ProtocolError::MismatchedReply {
            expected: request_id.to_string(),
            found: reply.request_id,
        });
    }
    Ok(match reply.status {
        CreateStatus::Ok => Ok(()),
        CreateStatus::Failed if reply.failed_ids.is_empty() => Err(task_ids.to_vec()),
        CreateStatus::Failed => Err(reply.failed_ids),
    })
}

struct Link {
    source: FrameSource,
    sink: FrameSink,
    broken: Option<String>,
}

impl Link {
    fn check(&self) -> Result<(), AgentError> {
        match &self.broken {
            Some(reason) => Err(AgentError::Broken(reason.clone())),
            None => Ok(()),
        }
    }

    /// Mark a write sequence as started. A caller that drops the future before
    /// [`Link::end_sequence`] leaves the stream broken.
    fn begin_sequence(&mut self, request_id: &str) -> Result<(), AgentError> {
        self.check()?;
        self.broken = Some(format!("request {request_id} was abandoned mid-sequence"));
        Ok(())
    }

    fn end_sequence(&mut self) {
        self.broken = None;
    }

    /// Record a fatal failure; later calls see `Broken`.
    fn poison(&mut self, err: ProtocolError) -> AgentError {
        tracing::error!(error = %err, "Task stream poisoned");
        self.broken = Some(err.to_string());
        AgentError::Protocol(err)
    }

    async fn write_all(&mut self, frames: Vec<OutboundFrame>) -> Result<(), AgentError> {
        for frame in frames {
            tracing::trace!(frame = frame.kind(), "Sending frame");
            if let Err(e) = self.sink.feed(frame).await {
                return Err(self.poison(e.into()));
            }
        }
        if let Err(e) = self.sink.flush().await {
            return Err(self.poison(e.into()));
        }
        Ok(())
    }

    async fn read_reply(&mut self) -> Result<CreateTaskReply, AgentError> {
        match self.source.next().await {
            Some(Ok(InboundFrame::CreateTaskAck(reply))) => Ok(reply),
            Some(Ok(other)) => Err(self.poison(ProtocolError::UnexpectedFrame {
                state: "awaiting task creation reply",
                found: other.kind(),
            })),
            Some(Err(e)) => Err(self.poison(e.into())),
            None => Err(self.poison(ProtocolError::UnexpectedEof {
                state: "awaiting task creation reply",
            })),
        }
    }
}

/// The remainder of one task stream, shared with the worker host.
pub struct Agent {
    session_id: String,
    task_id: String,
    max_chunk_size: NonZeroUsize,
    link: Mutex<Link>,
}

impl Agent {
    pub fn new(
        session_id: impl Into<String>,
        task_id: impl Into<String>,
        source: FrameSource,
        sink: FrameSink,
        max_chunk_size: NonZeroUsize,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            task_id: task_id.into(),
            max_chunk_size,
            link: Mutex::new(Link {
                source,
                sink,
                broken: None,
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Id of the task this stream is running.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Create child tasks in one batch and wait for the agent's reply.
    ///
    /// Returns the task ids in request order. A rejected batch leaves the
    /// stream usable; any other failure breaks it, as does dropping the
    /// future before the reply arrives.
    pub async fn create_tasks(
        &self,
        options: &TaskOptions,
        requests: Vec<TaskRequest>,
    ) -> Result<Vec<String>, AgentError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let batch = task_batch_frames(options, requests, self.max_chunk_size);

        let mut link = self.link.lock().await;
        link.begin_sequence(&batch.request_id)?;
        tracing::debug!(
            request_id = %batch.request_id,
            tasks = batch.task_ids.len(),
            frames = batch.frames.len(),
            "Submitting child tasks"
        );
        link.write_all(batch.frames).await?;
        let reply = link.read_reply().await?;

        match check_reply(reply, &batch.request_id, &batch.task_ids) {
            Err(e) => Err(link.poison(e)),
            Ok(Err(failed_ids)) => {
                link.end_sequence();
                tracing::warn!(request_id = %batch.request_id, failed = failed_ids.len(), "Child tasks rejected");
                Err(AgentError::TasksRejected { failed_ids })
            }
            Ok(Ok(())) => {
                link.end_sequence();
                Ok(batch.task_ids)
            }
        }
    }

    /// Send `data` as the result stored under `key`.
    pub async fn send_result(&self, key: &str, data: Bytes) -> Result<(), AgentError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let mut frames = vec![OutboundFrame::ResultInit {
            request_id: request_id.clone(),
            key: key.to_string(),
        }];
        let chunks = chunk::split(data, self.max_chunk_size);
        let count = chunks.len();
        frames.extend(chunks.map(|c| OutboundFrame::ResultChunk {
            request_id: request_id.clone(),
            data: c.data,
        }));
        frames.push(OutboundFrame::ResultComplete {
            request_id: request_id.clone(),
        });
        frames.push(OutboundFrame::ResultBatchLast {
            request_id: request_id.clone(),
        });

        let mut link = self.link.lock().await;
        link.begin_sequence(&request_id)?;
        tracing::debug!(%request_id, %key, chunks = count, "Sending result");
        link.write_all(frames).await?;
        link.end_sequence();
        Ok(())
    }

    /// Write the terminal output frame and close the stream.
    pub async fn finish(self, output: TaskOutput) -> Result<(), AgentError> {
        let mut link = self.link.into_inner();
        link.check()?;
        link.write_all(vec![OutboundFrame::Output { output }]).await?;
        if let Err(e) = link.sink.close().await {
            return Err(link.poison(e.into()));
        }
        Ok(())
    }
}
