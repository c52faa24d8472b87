//! Bulk indexing worker pool
//!
//! Documents go through a bounded channel to a fixed set of workers. Each
//! worker renders action and body lines into its own NDJSON buffer and
//! submits it when the buffer crosses the byte threshold or, when set, every
//! `flush_items` documents. Per-item results feed two shared counters.

use super::sink::IndexSink;
use crate::error::{Error, Result};
use crate::models::{BulkItem, SyncOutcome};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct BulkSettings {
    pub workers: usize,
    pub flush_bytes: usize,
    /// Flush every N documents per worker; `None` flushes on size only
    pub flush_items: Option<usize>,
}

#[derive(Default)]
struct Tally {
    success: AtomicU64,
    failure: AtomicU64,
}

impl Tally {
    fn add(&self, success: u64, failure: u64) {
        self.success.fetch_add(success, Ordering::Relaxed);
        self.failure.fetch_add(failure, Ordering::Relaxed);
    }

    fn outcome(&self) -> SyncOutcome {
        SyncOutcome::new(
            self.success.load(Ordering::Relaxed),
            self.failure.load(Ordering::Relaxed),
        )
    }
}

pub struct BulkIndexer {
    tx: mpsc::Sender<BulkItem>,
    workers: Vec<JoinHandle<()>>,
    tally: Arc<Tally>,
}

impl BulkIndexer {
    pub fn start(sink: Arc<dyn IndexSink>, index: &str, settings: BulkSettings) -> Self {
        let workers = settings.workers.max(1);
        info!("bulk workers: {}", workers);
        let (tx, rx) = mpsc::channel::<BulkItem>(workers);
        let rx = Arc::new(Mutex::new(rx));
        let tally = Arc::new(Tally::default());
        let index: Arc<str> = Arc::from(index);

        let handles = (1..=workers)
            .map(|id| {
                let worker = FlushWorker {
                    id,
                    sink: Arc::clone(&sink),
                    index: Arc::clone(&index),
                    items: Arc::clone(&rx),
                    tally: Arc::clone(&tally),
                    flush_bytes: settings.flush_bytes.max(1),
                    flush_items: settings.flush_items.filter(|n| *n > 0),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        Self {
            tx,
            workers: handles,
            tally,
        }
    }

    pub async fn add(&self, item: BulkItem) -> Result<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| Error::Other("bulk workers stopped".to_string()))
    }

    /// Close the queue and wait for every worker to flush
    pub async fn close(self, cancel: &CancellationToken) -> Result<SyncOutcome> {
        let BulkIndexer { tx, workers, tally } = self;
        drop(tx);
        info!("waiting for all workers...");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = futures::future::join_all(workers) => Ok(tally.outcome()),
        }
    }
}

struct FlushWorker {
    id: usize,
    sink: Arc<dyn IndexSink>,
    index: Arc<str>,
    items: Arc<Mutex<mpsc::Receiver<BulkItem>>>,
    tally: Arc<Tally>,
    flush_bytes: usize,
    flush_items: Option<usize>,
}

impl FlushWorker {
    async fn run(self) {
        let mut buf = String::new();
        let mut pending = 0u64;
        let mut count = 0usize;

        loop {
            let next = self.items.lock().await.recv().await;
            let Some(item) = next else { break };
            buf.push_str(&self.sink.bulk_action(&item));
            buf.push('\n');
            buf.push_str(&item.body);
            buf.push('\n');
            pending += 1;
            count += 1;

            let by_items = self.flush_items.is_some_and(|n| count % n == 0);
            if buf.len() >= self.flush_bytes || by_items {
                debug!("[worker-{:03}] flush {}, size:{}", self.id, count, buf.len());
                self.flush(std::mem::take(&mut buf), pending).await;
                pending = 0;
            }
        }

        if !buf.is_empty() {
            info!("[worker-{:03}] flush {}, size:{}", self.id, count, buf.len());
            self.flush(buf, pending).await;
        }
    }

    async fn flush(&self, body: String, items: u64) {
        match self.sink.bulk_submit(&self.index, body.clone()).await {
            Ok(response) => {
                let (success, failure) = response.tally();
                self.tally.add(success, failure);
            }
            Err(e) => {
                warn!("[worker-{:03}] failure indexing batch: {}", self.id, e);
                self.tally.add(0, items);
                self.sink.on_batch_rejected(&self.index, &body).await;
            }
        }
    }
}
