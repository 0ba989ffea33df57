//! Inbound side of a task stream: frames in, one [`TaskDescriptor`] out.
//!
//! States:
//! ```text
//! AwaitInit ─Init─▶ ReceivingPayload ─chunk(complete)─▶ ReceivingDependencies ─DependencyInit(no key)─▶ Ready
//!                         ▲    │                              │        ▲
//!                         └────┘ chunk                        └────────┘ DependencyInit(key) + chunks
//! ```
//! Any rejected frame moves the assembler to `Failed` for good.
//! One task owns one stream, so assembly is strictly sequential.

use std::collections::BTreeMap;

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::bridge::chunk::{Chunk, PendingBuffer};
use crate::bridge::frame::{InboundFrame, TaskOptions};
use crate::error::ProtocolError;
use crate::task::TaskDescriptor;

#[derive(Debug)]
enum AssemblyState {
    AwaitInit,
    ReceivingPayload,
    ReceivingDependencies {
        open: Option<(String, PendingBuffer)>,
    },
    Ready,
    /// A frame was rejected; the stream is out of step and no longer usable.
    Failed,
}

impl AssemblyState {
    fn describe(&self) -> &'static str {
        match self {
            Self::AwaitInit => "awaiting init",
            Self::ReceivingPayload => "receiving payload",
            Self::ReceivingDependencies { open: None } => "awaiting dependency",
            Self::ReceivingDependencies { open: Some(_) } => "receiving dependency",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug)]
struct Header {
    session_id: String,
    task_id: String,
    options: TaskOptions,
    expected_output_keys: Vec<String>,
}

/// Frame-by-frame builder of a [`TaskDescriptor`].
#[derive(Debug)]
pub struct TaskAssembler {
    state: AssemblyState,
    header: Option<Header>,
    payload: PendingBuffer,
    payload_bytes: Bytes,
    dependencies: BTreeMap<String, Bytes>,
}

impl Default for TaskAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskAssembler {
    pub fn new() -> Self {
        Self {
            state: AssemblyState::AwaitInit,
            header: None,
            payload: PendingBuffer::new(),
            payload_bytes: Bytes::new(),
            dependencies: BTreeMap::new(),
        }
    }

    /// Human-readable name of the current state.
    pub fn state(&self) -> &'static str {
        self.state.describe()
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, AssemblyState::Ready)
    }

    /// Feed the next frame. Returns the descriptor once the dependency list closes.
    ///
    /// After an error the assembler stays failed and rejects every later frame.
    pub fn push(&mut self, frame: InboundFrame) -> Result<Option<TaskDescriptor>, ProtocolError> {
        let state = std::mem::replace(&mut self.state, AssemblyState::Failed);
        let (next, done) = self.step(state, frame)?;
        self.state = next;
        Ok(done)
    }

    fn step(
        &mut self,
        state: AssemblyState,
        frame: InboundFrame,
    ) -> Result<(AssemblyState, Option<TaskDescriptor>), ProtocolError> {
        match (state, frame) {
            (
                AssemblyState::AwaitInit,
                InboundFrame::Init {
                    session_id,
                    task_id,
                    options,
                    expected_output_keys,
                },
            ) => {
                tracing::trace!(%session_id, %task_id, "Task stream initialized");
                self.header = Some(Header {
                    session_id,
                    task_id,
                    options,
                    expected_output_keys,
                });
                Ok((AssemblyState::ReceivingPayload, None))
            }

            (AssemblyState::ReceivingPayload, InboundFrame::PayloadChunk { data, is_complete }) => {
                self.payload.push(Chunk::new(data, is_complete))?;
                if !is_complete {
                    return Ok((AssemblyState::ReceivingPayload, None));
                }
                let payload = std::mem::take(&mut self.payload);
                self.payload_bytes = payload.finish()?;
                tracing::trace!(payload_bytes = self.payload_bytes.len(), "Payload received");
                Ok((AssemblyState::ReceivingDependencies { open: None }, None))
            }

            (AssemblyState::ReceivingDependencies { open: None }, InboundFrame::DependencyInit { key }) => {
                match key.filter(|k| !k.is_empty()) {
                    Some(key) => {
                        if self.dependencies.contains_key(&key) {
                            return Err(ProtocolError::DuplicateDependency(key));
                        }
                        Ok((
                            AssemblyState::ReceivingDependencies {
                                open: Some((key, PendingBuffer::new())),
                            },
                            None,
                        ))
                    }
                    None => {
                        let descriptor = self.build()?;
                        Ok((AssemblyState::Ready, Some(descriptor)))
                    }
                }
            }

            (
                AssemblyState::ReceivingDependencies {
                    open: Some((key, mut pending)),
                },
                InboundFrame::DependencyChunk { data, is_complete },
            ) => {
                pending.push(Chunk::new(data, is_complete))?;
                if !is_complete {
                    return Ok((
                        AssemblyState::ReceivingDependencies {
                            open: Some((key, pending)),
                        },
                        None,
                    ));
                }
                let data = pending.finish()?;
                tracing::trace!(%key, dependency_bytes = data.len(), "Dependency received");
                self.dependencies.insert(key, data);
                Ok((AssemblyState::ReceivingDependencies { open: None }, None))
            }

            (state, frame) => Err(ProtocolError::UnexpectedFrame {
                state: state.describe(),
                found: frame.kind(),
            }),
        }
    }

    fn build(&mut self) -> Result<TaskDescriptor, ProtocolError> {
        let header = self.header.take().ok_or(ProtocolError::UnexpectedEof {
            state: AssemblyState::AwaitInit.describe(),
        })?;
        Ok(TaskDescriptor {
            session_id: header.session_id,
            task_id: header.task_id,
            options: header.options,
            payload: std::mem::take(&mut self.payload_bytes),
            dependencies: std::mem::take(&mut self.dependencies),
            expected_output_keys: header.expected_output_keys,
        })
    }
}

/// Read frames from `source` until a complete task descriptor is assembled.
///
/// End of stream or a read failure before that point is a protocol error.
pub async fn receive_task<S>(source: &mut S) -> Result<TaskDescriptor, ProtocolError>
where
    S: Stream<Item = std::io::Result<InboundFrame>> + Unpin + ?Sized,
{
    let mut assembler = TaskAssembler::new();
    loop {
        let frame = match source.next().await {
            Some(frame) => frame?,
            None => {
                return Err(ProtocolError::UnexpectedEof {
                    state: assembler.state(),
                });
            }
        };
        tracing::trace!(state = assembler.state(), frame = frame.kind(), "Frame received");
        if let Some(task) = assembler.push(frame)? {
            tracing::debug!(
                session_id = %task.session_id,
                task_id = %task.task_id,
                dependencies = task.dependencies.len(),
                "Task assembled"
            );
            return Ok(task);
        }
    }
}
