//! Bounded pool of reusable connection handles.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};

use crate::rpc::RpcError;

struct Entry<C> {
    id: usize,
    channel: C,
    last_error: Option<RpcError>,
}

struct PoolConnection<C> {
    pool_tx: mpsc::Sender<Entry<C>>,
    pool_available: Arc<AtomicUsize>,
}

/// A borrowed channel. Goes back to its pool when dropped.
pub struct PooledChannel<C> {
    entry: Option<Entry<C>>,
    pool: PoolConnection<C>,
}

impl<C> PooledChannel<C> {
    pub fn id(&self) -> usize {
        self.entry.as_ref().map_or(0, |e| e.id)
    }

    pub fn channel(&self) -> Option<&C> {
        self.entry.as_ref().map(|e| &e.channel)
    }

    /// Error recorded by the previous borrower, if its call failed.
    pub fn last_error(&self) -> Option<&RpcError> {
        self.entry.as_ref().and_then(|e| e.last_error.as_ref())
    }

    /// Return after a successful call.
    pub fn release_ok(mut self) {
        if let Some(entry) = self.entry.as_mut() {
            entry.last_error = None;
        }
    }

    /// Return after a failed call, keeping the error on the handle.
    pub fn release_err(mut self, err: RpcError) {
        if let Some(entry) = self.entry.as_mut() {
            entry.last_error = Some(err);
        }
    }
}

impl<C> Drop for PooledChannel<C> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            let id = entry.id;
            match self.pool.pool_tx.try_send(entry) {
                Ok(()) => {
                    self.pool.pool_available.fetch_add(1, Ordering::Release);
                    tracing::trace!(channel = id, "Channel returned to pool");
                }
                Err(e) => {
                    tracing::error!(channel = id, error = %e, "Failed to return channel to pool");
                }
            }
        }
    }
}

/// Fixed set of channels, each lent to at most one caller at a time.
pub struct ChannelPool<C> {
    available_rx: Mutex<mpsc::Receiver<Entry<C>>>,
    available_tx: mpsc::Sender<Entry<C>>,
    size: usize,
    available_count: Arc<AtomicUsize>,
}

impl<C> ChannelPool<C> {
    pub fn new(channels: Vec<C>) -> Self {
        let size = channels.len();
        let (tx, rx) = mpsc::channel(size.max(1));
        let available_count = Arc::new(AtomicUsize::new(0));

        for (id, channel) in channels.into_iter().enumerate() {
            let entry = Entry {
                id,
                channel,
                last_error: None,
            };
            if let Err(e) = tx.try_send(entry) {
                tracing::error!(channel = id, error = %e, "Failed to add channel to pool");
            } else {
                available_count.fetch_add(1, Ordering::Release);
            }
        }

        Self {
            available_rx: Mutex::new(rx),
            available_tx: tx,
            size,
            available_count,
        }
    }

    /// Build `size` channels with `factory`.
    pub fn with_factory(size: usize, factory: impl FnMut(usize) -> C) -> Self {
        Self::new((0..size).map(factory).collect())
    }

    fn lend(&self, entry: Entry<C>) -> PooledChannel<C> {
        self.available_count.fetch_sub(1, Ordering::Release);
        tracing::trace!(channel = entry.id, "Channel borrowed");
        PooledChannel {
            entry: Some(entry),
            pool: PoolConnection {
                pool_tx: self.available_tx.clone(),
                pool_available: Arc::clone(&self.available_count),
            },
        }
    }

    pub fn try_acquire(&self) -> Option<PooledChannel<C>> {
        let mut rx = self.available_rx.try_lock().ok()?;
        let entry = rx.try_recv().ok()?;
        Some(self.lend(entry))
    }

    /// Wait until a channel is free. `None` only for an empty pool.
    pub async fn acquire(&self) -> Option<PooledChannel<C>> {
        if self.size == 0 {
            return None;
        }
        let mut rx = self.available_rx.lock().await;
        let entry = rx.recv().await?;
        Some(self.lend(entry))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.available_count.load(Ordering::Acquire)
    }
}
