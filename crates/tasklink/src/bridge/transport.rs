//! Socket transport for task streams.
//!
//! The worker binds a Unix domain socket; the polling agent opens one
//! connection per task. Each connection is split into a frame source
//! (inbound frames) and a frame sink (outbound frames).

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use futures::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::JsonCodec;
use super::frame::{InboundFrame, OutboundFrame};

/// Inbound half of a task stream, as seen by the worker.
pub type FrameSource = Pin<Box<dyn Stream<Item = io::Result<InboundFrame>> + Send>>;

/// Outbound half of a task stream, as seen by the worker.
pub type FrameSink = Pin<Box<dyn Sink<OutboundFrame, Error = io::Error> + Send>>;

/// Wrap a reader/writer pair as the worker side of a task stream.
pub fn worker_frames<R, W>(reader: R, writer: W) -> (FrameSource, FrameSink)
where
    R: AsyncRead + Send + 'static,
    W: AsyncWrite + Send + 'static,
{
    let source = FramedRead::new(reader, JsonCodec::<InboundFrame>::new());
    let sink = FramedWrite::new(writer, JsonCodec::<OutboundFrame>::new());
    (Box::pin(source), Box::pin(sink))
}

/// Listening socket of a worker process.
///
/// Removes a stale socket file before binding and its own file on drop.
pub struct WorkerListener {
    path: PathBuf,
    listener: UnixListener,
}

impl WorkerListener {
    pub fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }

        let listener = UnixListener::bind(&path)?;
        tracing::debug!(path = %path.display(), "Worker socket bound");
        Ok(Self { path, listener })
    }

    /// Wait for the next task stream.
    pub async fn accept(&self) -> io::Result<(FrameSource, FrameSink)> {
        let (stream, _) = self.listener.accept().await?;
        tracing::trace!(path = %self.path.display(), "Agent connected");
        let (read_half, write_half) = stream.into_split();
        Ok(worker_frames(read_half, write_half))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkerListener {
    fn drop(&mut self) {
        if self.path.exists()
            && let Err(e) = std::fs::remove_file(&self.path)
        {
            tracing::warn!(error = %e, path = %self.path.display(), "Failed to remove worker socket");
        }
    }
}

/// Agent side of a task stream: reads what the worker sends, writes what it receives.
pub struct AgentConnection {
    pub frames: FramedRead<OwnedReadHalf, JsonCodec<OutboundFrame>>,
    pub sender: FramedWrite<OwnedWriteHalf, JsonCodec<InboundFrame>>,
}

/// Open a task stream to a worker listening at `path`.
pub async fn connect(path: impl AsRef<Path>) -> io::Result<AgentConnection> {
    let path = path.as_ref();
    tracing::trace!(path = %path.display(), "Connecting to worker socket");
    let stream = UnixStream::connect(path).await?;
    let (read_half, write_half) = stream.into_split();
    Ok(AgentConnection {
        frames: FramedRead::new(read_half, JsonCodec::new()),
        sender: FramedWrite::new(write_half, JsonCodec::new()),
    })
}
