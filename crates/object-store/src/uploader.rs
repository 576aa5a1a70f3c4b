//! Deferred blob uploads.
//!
//! Writers hand blobs to an [`Uploader`] and move on; a single worker task
//! buffers them and writes them out when its timer fires, when the buffer is
//! full, or when asked to [`Uploader::flush`]. The queue is bounded, so a slow
//! store pushes back on writers instead of growing without limit.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{BlobStoreError, Result};
use crate::store::BlobStore;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UploadConfig {
    /// Capacity of the job queue
    pub queue_size: usize,
    /// Buffered uploads that force a write-out before the timer fires
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            queue_size: 256,
            batch_size: 32,
            flush_interval_ms: 1_000,
        }
    }
}

#[derive(Debug)]
enum Job {
    Upload { name: String, data: Bytes },
    /// Write out everything buffered, then report failures since the last flush
    Flush(oneshot::Sender<usize>),
}

/// Handle to the background upload worker.
#[derive(Debug)]
pub struct Uploader {
    tx: flume::Sender<Job>,
    worker: JoinHandle<usize>,
}

impl Uploader {
    pub fn spawn(store: Arc<dyn BlobStore>, config: UploadConfig) -> Self {
        let (tx, rx) = flume::bounded(config.queue_size.max(1));
        let worker = tokio::spawn(run_worker(store, rx, config));
        Self { tx, worker }
    }

    /// Queue a blob for writing. Waits while the queue is full.
    pub async fn enqueue(&self, name: impl Into<String>, data: Bytes) -> Result<()> {
        let name = name.into();
        tracing::trace!("queueing upload of {}", name);
        self.tx
            .send_async(Job::Upload { name, data })
            .await
            .map_err(|_| BlobStoreError::QueueClosed)
    }

    /// Write out everything queued so far.
    pub async fn flush(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send_async(Job::Flush(reply))
            .await
            .map_err(|_| BlobStoreError::QueueClosed)?;
        match done.await {
            Ok(0) => Ok(()),
            Ok(failed) => Err(BlobStoreError::UploadsFailed(failed)),
            Err(_) => Err(BlobStoreError::QueueClosed),
        }
    }

    /// Close the queue, write out what is left and wait for the worker.
    pub async fn shutdown(self) -> Result<()> {
        let Self { tx, worker } = self;
        drop(tx);
        match worker.await {
            Ok(0) => Ok(()),
            Ok(failed) => Err(BlobStoreError::UploadsFailed(failed)),
            Err(e) => {
                tracing::error!("upload worker panicked: {}", e);
                Err(BlobStoreError::QueueClosed)
            }
        }
    }
}

async fn run_worker(
    store: Arc<dyn BlobStore>,
    rx: flume::Receiver<Job>,
    config: UploadConfig,
) -> usize {
    use tokio::time::interval;

    let mut jobs = rx.into_stream();
    let mut pending: Vec<(String, Bytes)> = Vec::new();
    let mut failed = 0;

    let mut ticker = interval(Duration::from_millis(config.flush_interval_ms.max(1)));
    ticker.tick().await;

    loop {
        tokio::select! {
            job = jobs.next() => match job {
                Some(Job::Upload { name, data }) => {
                    pending.push((name, data));
                    if pending.len() >= config.batch_size {
                        failed += write_out(store.as_ref(), &mut pending).await;
                    }
                }
                Some(Job::Flush(reply)) => {
                    failed += write_out(store.as_ref(), &mut pending).await;
                    let _ = reply.send(std::mem::take(&mut failed));
                }
                None => break,
            },

            _ = ticker.tick() => {
                if !pending.is_empty() {
                    failed += write_out(store.as_ref(), &mut pending).await;
                }
            }
        }
    }

    failed += write_out(store.as_ref(), &mut pending).await;
    tracing::debug!("upload worker stopped with {} failed upload(s)", failed);
    failed
}

async fn write_out(store: &dyn BlobStore, pending: &mut Vec<(String, Bytes)>) -> usize {
    let mut failed = 0;
    for (name, data) in pending.drain(..) {
        if let Err(e) = store.write(&name, data).await {
            tracing::warn!("upload of {} failed: {}", name, e);
            failed += 1;
        }
    }
    failed
}
