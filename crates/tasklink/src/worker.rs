//! Worker side of the task stream: accept, assemble, execute, report.
//!
//! Each accepted connection carries exactly one task. The stream is read
//! until the task descriptor is complete, the [`WorkerHost`] runs it with an
//! [`Agent`] for child tasks and extra results, and the stream closes with a
//! single `Output` frame.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::agent::{Agent, AgentError};
use crate::assembly::receive_task;
use crate::bridge::frame::{OutboundFrame, TaskOutput};
use crate::bridge::transport::{FrameSink, FrameSource, WorkerListener};
use crate::config::TransportConfig;
use crate::error::ProtocolError;
use crate::task::{TaskDescriptor, TaskError};

/// User business logic, loaded however the embedding process chooses.
#[async_trait::async_trait]
pub trait WorkerHost: Send + Sync + 'static {
    /// Run one task. The returned bytes become the result for the task's first
    /// expected output key.
    async fn execute(&self, task: TaskDescriptor, agent: &Agent) -> Result<Bytes, TaskError>;
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// Serve one task stream to completion.
///
/// Application failures come back as `TaskOutput::Error`; only a broken
/// stream is an `Err`.
pub async fn serve_task<H>(
    host: &H,
    mut source: FrameSource,
    mut sink: FrameSink,
    max_chunk_size: NonZeroUsize,
) -> Result<TaskOutput, WorkerError>
where
    H: WorkerHost + ?Sized,
{
    let task = match receive_task(&mut source).await {
        Ok(task) => task,
        Err(e) => {
            tracing::error!(error = %e, "Task stream rejected");
            let output = TaskOutput::ProtocolError {
                details: e.to_string(),
            };
            if let Err(send_err) = sink.send(OutboundFrame::Output { output }).await {
                tracing::debug!(error = %send_err, "Could not report protocol error");
            }
            return Err(e.into());
        }
    };

    let span = tracing::info_span!("task", session_id = %task.session_id, task_id = %task.task_id);
    let output_key = task.expected_output_keys.first().cloned();
    let agent = Agent::new(
        task.session_id.clone(),
        task.task_id.clone(),
        source,
        sink,
        max_chunk_size,
    );

    async move {
        tracing::info!("Task started");
        let output = match host.execute(task, &agent).await {
            Ok(result) => {
                match output_key {
                    Some(key) => agent.send_result(&key, result).await?,
                    None if !result.is_empty() => {
                        tracing::debug!(bytes = result.len(), "No output key; result dropped");
                    }
                    None => {}
                }
                TaskOutput::Ok
            }
            Err(e) => {
                tracing::warn!(error = %e, "Task failed");
                TaskOutput::Error {
                    details: e.message().to_string(),
                }
            }
        };
        agent.finish(output.clone()).await?;
        tracing::info!(ok = output.is_ok(), "Task finished");
        Ok::<_, WorkerError>(output)
    }
    .instrument(span)
    .await
}

/// Pause after a failed accept so a persistent error (fd exhaustion) does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept task streams until `shutdown` fires, one spawned task per stream.
///
/// A failed accept is logged and retried. In-flight tasks are allowed to
/// finish before this returns.
pub async fn run_worker<H: WorkerHost>(
    host: Arc<H>,
    listener: WorkerListener,
    config: &TransportConfig,
    shutdown: CancellationToken,
) {
    let max_chunk_size = config.max_chunk_size;
    let mut tasks = JoinSet::new();
    tracing::info!(path = %listener.path().display(), "Worker listening");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (source, sink) = match accepted {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                let host = Arc::clone(&host);
                tasks.spawn(async move {
                    if let Err(e) = serve_task(host.as_ref(), source, sink, max_chunk_size).await {
                        tracing::warn!(error = %e, "Task stream aborted");
                    }
                });
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Task handler panicked");
                }
            }
        }
    }

    tracing::info!(in_flight = tasks.len(), "Worker shutting down");
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Task handler panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::JsonCodec;
    use crate::bridge::frame::{CreateTaskReply, InboundFrame, TaskOptions};
    use crate::bridge::transport::worker_frames;
    use crate::task::TaskRequest;
    use futures::StreamExt;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio_util::codec::{FramedRead, FramedWrite};

    type AgentRead = FramedRead<ReadHalf<DuplexStream>, JsonCodec<OutboundFrame>>;
    type AgentWrite = FramedWrite<WriteHalf<DuplexStream>, JsonCodec<InboundFrame>>;

    fn stream_pair() -> (FrameSource, FrameSink, AgentRead, AgentWrite) {
        let (worker_io, agent_io) = tokio::io::duplex(64 * 1024);
        let (r, w) = tokio::io::split(worker_io);
        let (source, sink) = worker_frames(r, w);
        let (ar, aw) = tokio::io::split(agent_io);
        (source, sink, FramedRead::new(ar, JsonCodec::new()), FramedWrite::new(aw, JsonCodec::new()))
    }

    fn task_frames(payload: &'static [u8], output_keys: &[&str]) -> Vec<InboundFrame> {
        vec![
            InboundFrame::Init {
                session_id: "session".to_string(),
                task_id: "task".to_string(),
                options: TaskOptions::new(),
                expected_output_keys: output_keys.iter().map(|k| k.to_string()).collect(),
            },
            InboundFrame::PayloadChunk {
                data: Bytes::from_static(payload),
                is_complete: true,
            },
            InboundFrame::DependencyInit {
                key: Some("dep".to_string()),
            },
            InboundFrame::DependencyChunk {
                data: Bytes::from_static(b"-dep"),
                is_complete: true,
            },
            InboundFrame::DependencyInit { key: None },
        ]
    }

    async fn send_all(writer: &mut AgentWrite, frames: Vec<InboundFrame>) {
        for frame in frames {
            writer.send(frame).await.unwrap();
        }
    }

    /// Echoes payload plus dependency; fails on payload "fail".
    struct EchoHost;

    #[async_trait::async_trait]
    impl WorkerHost for EchoHost {
        async fn execute(&self, task: TaskDescriptor, _agent: &Agent) -> Result<Bytes, TaskError> {
            if task.payload == "fail" {
                return Err(TaskError::new("asked to fail"));
            }
            let mut out = task.payload.to_vec();
            out.extend_from_slice(task.dependency("dep").map(|d| d.as_ref()).unwrap_or_default());
            Ok(Bytes::from(out))
        }
    }

    /// Spawns one child task before returning.
    struct ParentHost;

    #[async_trait::async_trait]
    impl WorkerHost for ParentHost {
        async fn execute(&self, _task: TaskDescriptor, agent: &Agent) -> Result<Bytes, TaskError> {
            let ids = agent
                .create_tasks(&TaskOptions::new(), vec![TaskRequest::new("child").task_id("c1")])
                .await
                .map_err(|e| TaskError::new(e.to_string()))?;
            Ok(Bytes::from(ids.join(",")))
        }
    }

    #[tokio::test]
    async fn successful_task_sends_result_then_output() {
        let (source, sink, mut reader, mut writer) = stream_pair();
        send_all(&mut writer, task_frames(b"hello", &["out"])).await;

        let output = serve_task(&EchoHost, source, sink, NonZeroUsize::new(4).unwrap())
            .await
            .unwrap();
        assert_eq!(output, TaskOutput::Ok);

        let frames: Vec<OutboundFrame> = reader.by_ref().map(|f| f.unwrap()).collect().await;
        let kinds: Vec<_> = frames.iter().map(OutboundFrame::kind).collect();
        assert_eq!(
            kinds,
            vec![
                "result_init",
                "result_chunk",
                "result_chunk",
                "result_chunk",
                "result_complete",
                "result_batch_last",
                "output",
            ]
        );
        let data: Vec<u8> = frames
            .iter()
            .filter_map(|f| match f {
                OutboundFrame::ResultChunk { data, .. } => Some(data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(data, b"hello-dep");
    }

    #[tokio::test]
    async fn host_failure_is_reported_as_output_error() {
        let (source, sink, mut reader, mut writer) = stream_pair();
        send_all(&mut writer, task_frames(b"fail", &["out"])).await;

        let output = serve_task(&EchoHost, source, sink, NonZeroUsize::new(64).unwrap())
            .await
            .unwrap();
        let expected = TaskOutput::Error {
            details: "asked to fail".to_string(),
        };
        assert_eq!(output, expected);
        assert_eq!(
            reader.next().await.unwrap().unwrap(),
            OutboundFrame::Output { output: expected }
        );
    }

    #[tokio::test]
    async fn task_without_output_key_only_sends_output() {
        let (source, sink, mut reader, mut writer) = stream_pair();
        send_all(&mut writer, task_frames(b"x", &[])).await;

        serve_task(&EchoHost, source, sink, NonZeroUsize::new(64).unwrap())
            .await
            .unwrap();
        assert_eq!(reader.next().await.unwrap().unwrap().kind(), "output");
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn malformed_stream_reports_protocol_error() {
        let (source, sink, mut reader, mut writer) = stream_pair();
        writer
            .send(InboundFrame::PayloadChunk {
                data: Bytes::new(),
                is_complete: true,
            })
            .await
            .unwrap();

        let err = serve_task(&EchoHost, source, sink, NonZeroUsize::new(64).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Protocol(ProtocolError::UnexpectedFrame { .. })
        ));
        match reader.next().await.unwrap().unwrap() {
            OutboundFrame::Output {
                output: TaskOutput::ProtocolError { details },
            } => assert!(details.contains("payload_chunk"), "{details}"),
            other => panic!("expected protocol error output, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn early_eof_reports_protocol_error() {
        let (source, sink, _reader, mut writer) = stream_pair();
        let mut frames = task_frames(b"x", &["out"]);
        frames.truncate(2);
        send_all(&mut writer, frames).await;
        writer.close().await.unwrap();

        let err = serve_task(&EchoHost, source, sink, NonZeroUsize::new(64).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Protocol(ProtocolError::UnexpectedEof { .. })
        ));
    }

    #[tokio::test]
    async fn host_can_create_child_tasks() {
        let (source, sink, mut reader, mut writer) = stream_pair();
        send_all(&mut writer, task_frames(b"parent", &["out"])).await;

        let agent_side = tokio::spawn(async move {
            let request_id = match reader.next().await.unwrap().unwrap() {
                OutboundFrame::CreateTaskInit { request_id, .. } => request_id,
                other => panic!("expected create_task_init, got {:?}", other),
            };
            loop {
                if reader.next().await.unwrap().unwrap() == OutboundFrame::CreateTaskBatchEnd {
                    break;
                }
            }
            writer
                .send(InboundFrame::CreateTaskAck(CreateTaskReply::ok(request_id)))
                .await
                .unwrap();
            let rest: Vec<OutboundFrame> = reader.map(|f| f.unwrap()).collect().await;
            (rest, writer)
        });

        let output = serve_task(&ParentHost, source, sink, NonZeroUsize::new(64).unwrap())
            .await
            .unwrap();
        assert!(output.is_ok());

        let (rest, _writer) = agent_side.await.unwrap();
        assert!(rest.iter().any(|f| matches!(
            f,
            OutboundFrame::ResultChunk { data, .. } if data == "c1"
        )));
        assert_eq!(rest.last().map(OutboundFrame::kind), Some("output"));
    }

    #[tokio::test]
    async fn run_worker_serves_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let listener = WorkerListener::bind(dir.path().join("w.sock")).unwrap();
        let path = listener.path().to_path_buf();
        let shutdown = CancellationToken::new();
        let config = TransportConfig::default();

        let worker = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { run_worker(Arc::new(EchoHost), listener, &config, shutdown).await })
        };

        let mut conn = crate::bridge::transport::connect(&path).await.unwrap();
        for frame in task_frames(b"ping", &["out"]) {
            conn.sender.send(frame).await.unwrap();
        }
        let frames: Vec<OutboundFrame> = conn.frames.by_ref().map(|f| f.unwrap()).collect().await;
        assert_eq!(frames.last().map(OutboundFrame::kind), Some("output"));

        shutdown.cancel();
        worker.await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_streams() {
        let dir = tempfile::tempdir().unwrap();
        let listener = WorkerListener::bind(dir.path().join("w.sock")).unwrap();
        let path = listener.path().to_path_buf();
        let shutdown = CancellationToken::new();
        let config = TransportConfig::default();

        let worker = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { run_worker(Arc::new(EchoHost), listener, &config, shutdown).await })
        };

        let mut frames = task_frames(b"late", &["out"]).into_iter();
        let mut conn = crate::bridge::transport::connect(&path).await.unwrap();
        conn.sender.send(frames.next().unwrap()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!worker.is_finished());

        for frame in frames {
            conn.sender.send(frame).await.unwrap();
        }
        let out: Vec<OutboundFrame> = conn.frames.by_ref().map(|f| f.unwrap()).collect().await;
        assert_eq!(
            out.last(),
            Some(&OutboundFrame::Output {
                output: TaskOutput::Ok
            })
        );
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
    }
}
