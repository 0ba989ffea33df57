//! Client-side access to the control plane.
//!
//! Every call goes through [`RpcInvoker::execute`], so each one borrows a
//! pooled channel per attempt and retries transient failures.

use std::num::NonZeroUsize;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::agent::{check_reply, task_batch_frames};
use crate::bridge::chunk::{self, Chunk};
use crate::bridge::frame::{CreateTaskReply, OutboundFrame, TaskOptions};
use crate::config::{ConfigError, TransportConfig};
use crate::error::ProtocolError;
use crate::pool::ChannelPool;
use crate::rpc::{RetryPolicy, RpcError, RpcInvoker};
use crate::task::TaskRequest;

/// Remote methods reachable over one pooled connection.
#[async_trait::async_trait]
pub trait ControlPlane: Clone + Send + Sync + 'static {
    async fn create_tasks(
        &self,
        session_id: &str,
        frames: Vec<OutboundFrame>,
    ) -> Result<CreateTaskReply, RpcError>;

    async fn wait_for_completion(
        &self,
        session_id: &str,
        task_ids: &[String],
    ) -> Result<CompletionSummary, RpcError>;

    async fn get_result(&self, session_id: &str, key: &str) -> Result<Vec<Chunk>, RpcError>;
}

/// Final state of a set of tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionSummary {
    #[serde(default)]
    pub completed: Vec<String>,
    #[serde(default)]
    pub errored: Vec<String>,
    #[serde(default)]
    pub cancelled: Vec<String>,
}

impl CompletionSummary {
    pub fn is_success(&self) -> bool {
        self.errored.is_empty() && self.cancelled.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("task creation failed for {}", .failed_ids.join(", "))]
    TasksRejected { failed_ids: Vec<String> },

    #[error("{} tasks errored, {} cancelled", .summary.errored.len(), .summary.cancelled.len())]
    TasksFailed { summary: CompletionSummary },
}

/// Submits tasks for one session and collects their results.
pub struct Submitter<C> {
    session_id: String,
    invoker: RpcInvoker<C>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    max_chunk_size: NonZeroUsize,
}

impl<C: ControlPlane> Submitter<C> {
    pub fn new(
        session_id: impl Into<String>,
        invoker: RpcInvoker<C>,
        policy: RetryPolicy,
        max_chunk_size: NonZeroUsize,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            invoker,
            policy,
            cancel: CancellationToken::new(),
            max_chunk_size,
        }
    }

    /// Pool of `config.pool_size` channels built by `connect`, retry policy from `config`.
    pub fn from_config(
        session_id: impl Into<String>,
        config: &TransportConfig,
        connect: impl FnMut(usize) -> C,
    ) -> Result<Self, ConfigError> {
        let policy = config.retry_policy()?;
        let pool_size = config.pool_size()?;
        let pool = Arc::new(ChannelPool::with_factory(pool_size.get(), connect));
        Ok(Self::new(
            session_id,
            RpcInvoker::new(pool),
            policy,
            config.max_chunk_size,
        ))
    }

    /// Tie every call to `token`; cancelling it aborts in-flight calls and backoffs.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Create tasks in one batch. Returns their ids in request order.
    pub async fn submit_tasks(
        &self,
        options: &TaskOptions,
        requests: Vec<TaskRequest>,
    ) -> Result<Vec<String>, SubmitError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let batch = task_batch_frames(options, requests, self.max_chunk_size);
        tracing::debug!(
            session_id = %self.session_id,
            request_id = %batch.request_id,
            tasks = batch.task_ids.len(),
            "Submitting tasks"
        );

        let reply = self
            .invoker
            .execute(&self.policy, &self.cancel, |channel| {
                let session_id = self.session_id.clone();
                let frames = batch.frames.clone();
                async move { channel.create_tasks(&session_id, frames).await }
            })
            .await?;

        match check_reply(reply, &batch.request_id, &batch.task_ids)? {
            Ok(()) => {
                tracing::info!(
                    session_id = %self.session_id,
                    tasks = batch.task_ids.len(),
                    "Tasks submitted"
                );
                Ok(batch.task_ids)
            }
            Err(failed_ids) => Err(SubmitError::TasksRejected { failed_ids }),
        }
    }

    /// Block until every task in `task_ids` has finished.
    pub async fn wait_for_completion(
        &self,
        task_ids: &[String],
    ) -> Result<CompletionSummary, SubmitError> {
        let summary = self
            .invoker
            .execute(&self.policy, &self.cancel, |channel| {
                let session_id = self.session_id.clone();
                let task_ids = task_ids.to_vec();
                async move { channel.wait_for_completion(&session_id, &task_ids).await }
            })
            .await?;

        if summary.is_success() {
            Ok(summary)
        } else {
            tracing::warn!(
                errored = summary.errored.len(),
                cancelled = summary.cancelled.len(),
                "Tasks did not complete"
            );
            Err(SubmitError::TasksFailed { summary })
        }
    }

    /// Fetch and reassemble the result stored under `key`.
    pub async fn get_result(&self, key: &str) -> Result<Bytes, SubmitError> {
        let chunks = self
            .invoker
            .execute(&self.policy, &self.cancel, |channel| {
                let session_id = self.session_id.clone();
                let key = key.to_string();
                async move { channel.get_result(&session_id, &key).await }
            })
            .await?;
        tracing::trace!(%key, chunks = chunks.len(), "Result received");
        Ok(chunk::reassemble(chunks)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::StatusCode;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct State {
        /// Errors handed out before calls start succeeding.
        failures: Vec<RpcError>,
        calls: usize,
        batches: Vec<Vec<OutboundFrame>>,
        reject: Option<Vec<String>>,
        wrong_reply_id: bool,
        summary: CompletionSummary,
        result_chunks: Vec<Chunk>,
    }

    #[derive(Clone, Default)]
    struct FakeControlPlane(Arc<Mutex<State>>);

    impl FakeControlPlane {
        fn next_failure(&self) -> Option<RpcError> {
            let mut state = self.0.lock().unwrap();
            state.calls += 1;
            if state.failures.is_empty() {
                None
            } else {
                Some(state.failures.remove(0))
            }
        }
    }

    #[async_trait::async_trait]
    impl ControlPlane for FakeControlPlane {
        async fn create_tasks(
            &self,
            session_id: &str,
            frames: Vec<OutboundFrame>,
        ) -> Result<CreateTaskReply, RpcError> {
            assert_eq!(session_id, "session");
            if let Some(err) = self.next_failure() {
                return Err(err);
            }
            let request_id = match &frames[0] {
                OutboundFrame::CreateTaskInit { request_id, .. } => request_id.clone(),
                other => panic!("batch must start with init, got {:?}", other),
            };
            let mut state = self.0.lock().unwrap();
            state.batches.push(frames);
            let request_id = if state.wrong_reply_id {
                "other".to_string()
            } else {
                request_id
            };
            Ok(match state.reject.clone() {
                Some(ids) => CreateTaskReply::failed(request_id, ids),
                None => CreateTaskReply::ok(request_id),
            })
        }

        async fn wait_for_completion(
            &self,
            _session_id: &str,
            _task_ids: &[String],
        ) -> Result<CompletionSummary, RpcError> {
            if let Some(err) = self.next_failure() {
                return Err(err);
            }
            Ok(self.0.lock().unwrap().summary.clone())
        }

        async fn get_result(&self, _session_id: &str, _key: &str) -> Result<Vec<Chunk>, RpcError> {
            if let Some(err) = self.next_failure() {
                return Err(err);
            }
            Ok(self.0.lock().unwrap().result_chunks.clone())
        }
    }

    fn submitter(plane: &FakeControlPlane) -> Submitter<FakeControlPlane> {
        let pool = Arc::new(ChannelPool::new(vec![plane.clone(), plane.clone()]));
        Submitter::new(
            "session",
            RpcInvoker::new(pool),
            RetryPolicy::new(3, Duration::from_millis(5)),
            NonZeroUsize::new(4).unwrap(),
        )
    }

    #[tokio::test]
    async fn submit_retries_transient_failures() {
        let plane = FakeControlPlane::default();
        plane.0.lock().unwrap().failures = vec![
            RpcError::status(StatusCode::Unavailable, "down"),
            RpcError::from(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];

        let ids = submitter(&plane)
            .submit_tasks(
                &TaskOptions::new(),
                vec![TaskRequest::new("0123456789").task_id("a"), TaskRequest::new("x")],
            )
            .await
            .unwrap();

        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], "a");
        let state = plane.0.lock().unwrap();
        assert_eq!(state.calls, 3);
        // init, header, 3 chunks, header, 1 chunk, end
        assert_eq!(state.batches[0].len(), 8);
    }

    #[tokio::test]
    async fn submit_reports_rejected_ids() {
        let plane = FakeControlPlane::default();
        plane.0.lock().unwrap().reject = Some(vec!["b".to_string()]);

        let err = submitter(&plane)
            .submit_tasks(
                &TaskOptions::new(),
                vec![TaskRequest::new("x").task_id("a"), TaskRequest::new("y").task_id("b")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::TasksRejected { failed_ids } if failed_ids == vec!["b"]));
    }

    #[tokio::test]
    async fn submit_rejects_reply_for_other_request() {
        let plane = FakeControlPlane::default();
        plane.0.lock().unwrap().wrong_reply_id = true;

        let err = submitter(&plane)
            .submit_tasks(&TaskOptions::new(), vec![TaskRequest::new("x")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SubmitError::Protocol(ProtocolError::MismatchedReply { .. })
        ));
    }

    #[tokio::test]
    async fn fatal_rpc_error_surfaces_unchanged() {
        let plane = FakeControlPlane::default();
        let denied = RpcError::status(StatusCode::PermissionDenied, "nope");
        plane.0.lock().unwrap().failures = vec![denied.clone()];

        let err = submitter(&plane)
            .submit_tasks(&TaskOptions::new(), vec![TaskRequest::new("x")])
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Rpc(e) if e == denied));
        assert_eq!(plane.0.lock().unwrap().calls, 1);
    }

    #[tokio::test]
    async fn wait_for_completion_flags_failed_tasks() {
        let plane = FakeControlPlane::default();
        let submitter = submitter(&plane);

        plane.0.lock().unwrap().summary = CompletionSummary {
            completed: vec!["a".to_string()],
            ..Default::default()
        };
        let summary = submitter.wait_for_completion(&["a".to_string()]).await.unwrap();
        assert_eq!(summary.completed, vec!["a"]);

        plane.0.lock().unwrap().summary = CompletionSummary {
            completed: vec!["a".to_string()],
            errored: vec!["b".to_string()],
            cancelled: vec![],
        };
        let err = submitter
            .wait_for_completion(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "1 tasks errored, 0 cancelled");
    }

    #[tokio::test]
    async fn get_result_reassembles_chunks() {
        let plane = FakeControlPlane::default();
        plane.0.lock().unwrap().result_chunks = vec![
            Chunk::new("hel", false),
            Chunk::new("lo", true),
        ];
        let data = submitter(&plane).get_result("out").await.unwrap();
        assert_eq!(data, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn get_result_rejects_unterminated_chunks() {
        let plane = FakeControlPlane::default();
        plane.0.lock().unwrap().result_chunks = vec![Chunk::new("hel", false)];
        let err = submitter(&plane).get_result("out").await.unwrap_err();
        assert!(matches!(
            err,
            SubmitError::Protocol(ProtocolError::MissingTerminalChunk)
        ));
    }

    #[tokio::test]
    async fn cancelled_submitter_makes_no_calls() {
        let plane = FakeControlPlane::default();
        let token = CancellationToken::new();
        token.cancel();
        let submitter = submitter(&plane).with_cancellation(token);

        let err = submitter.get_result("out").await.unwrap_err();
        assert!(matches!(err, SubmitError::Rpc(RpcError::Cancelled)));
        assert_eq!(plane.0.lock().unwrap().calls, 0);
    }

    #[test]
    fn from_config_validates_retry_settings() {
        let mut config = TransportConfig::default();
        config.retry.max_attempts = 0;
        let result = Submitter::from_config("s", &config, |_| FakeControlPlane::default());
        assert!(matches!(result, Err(ConfigError::Retry(RpcError::InvalidArgument(_)))));
    }

    #[test]
    fn from_config_rejects_empty_pool() {
        let config: TransportConfig = serde_json::from_str(r#"{"pool_size":0}"#).unwrap();
        let result = Submitter::from_config("s", &config, |_| FakeControlPlane::default());
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { var: "pool_size", ref value }) if value == "0"
        ));
    }

    #[test]
    fn summary_wire_shape() {
        let summary: CompletionSummary =
            serde_json::from_str(r#"{"completed":["a"],"cancelled":["b"]}"#).unwrap();
        assert!(summary.errored.is_empty());
        assert!(!summary.is_success());
    }
}
