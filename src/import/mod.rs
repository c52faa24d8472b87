//! Extraction engine: source database → staging store
//!
//! Every `.sql` file under `sql-import/` becomes one staging table named
//! after the file. Each template is split into key-range chunks that a pool
//! of read workers executes against the source; decoded rows flow over a
//! bounded channel to a pool of write workers that batch them into
//! multi-row INSERTs. Once both pools drain, the staging file is vacuumed.

mod partition;
mod schema;

pub use partition::*;
pub use schema::*;

use crate::config::{Config, SiteConfig};
use crate::error::{Error, Result};
use crate::models::{RowBatch, RowRecord, SqlTask};
use crate::progress::{advance_progress, finish_progress, start_progress_bar};
use crate::source::{SourceDb, SourceResolver};
use crate::sql::{
    apply_row_limit, is_select, scan_sql_files, split_statements, substitute_lang, table_name_for,
    Directives,
};
use crate::staging::StagingStore;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Extraction settings for one run
#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub batch_size: usize,
    pub workers: usize,
    pub window_size: i64,
    pub small_range: i64,
    /// Appended as LIMIT to plain SELECTs without one (0 = off)
    pub row_limit: u64,
    pub lang: String,
    pub debug: bool,
    pub show_progress: bool,
}

impl ImportOptions {
    pub fn new(config: &Config, site: &SiteConfig, debug: bool) -> Self {
        Self {
            batch_size: config.import.batch_size,
            workers: config.import.resolved_workers(),
            window_size: config.import.window_size,
            small_range: config.import.small_range,
            row_limit: site.import_limit,
            lang: site.lang.clone(),
            debug,
            show_progress: false,
        }
    }
}

/// Totals reported by [`Importer::run`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportStats {
    pub files: u64,
    pub files_failed: u64,
    pub tasks: u64,
    pub tasks_failed: u64,
    pub rows_read: u64,
    pub rows_written: u64,
    pub rows_skipped: u64,
    pub batches_failed: u64,
}

#[derive(Default)]
struct Counters {
    files: AtomicU64,
    files_failed: AtomicU64,
    tasks: AtomicU64,
    tasks_failed: AtomicU64,
    rows_read: AtomicU64,
    rows_written: AtomicU64,
    rows_skipped: AtomicU64,
    batches_failed: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ImportStats {
        ImportStats {
            files: self.files.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            tasks: self.tasks.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            rows_read: self.rows_read.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            rows_skipped: self.rows_skipped.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
        }
    }
}

/// Creation state of a staging table, published by its first chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableState {
    Pending,
    Ready,
    Failed,
}

/// Per-table ordering: the first chunk owns the sender, every other chunk
/// waits on a receiver before reading rows
enum Barrier {
    Owner(watch::Sender<TableState>),
    Waiter(watch::Receiver<TableState>),
}

struct ReadJob {
    task: SqlTask,
    source: Arc<dyn SourceDb>,
    barrier: Barrier,
}

struct WriteRow {
    table: Arc<str>,
    record: RowRecord,
}

type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

async fn next_message<T>(rx: &SharedReceiver<T>) -> Option<T> {
    rx.lock().await.recv().await
}

/// Runs the import of one site
pub struct Importer {
    options: ImportOptions,
    default_source: Arc<dyn SourceDb>,
    resolver: Arc<dyn SourceResolver>,
    staging: Arc<StagingStore>,
    cancel: CancellationToken,
}

impl Importer {
    pub fn new(
        options: ImportOptions,
        default_source: Arc<dyn SourceDb>,
        resolver: Arc<dyn SourceResolver>,
        staging: Arc<StagingStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            options,
            default_source,
            resolver,
            staging,
            cancel,
        }
    }

    /// Import every template under `import_dir` into the staging store
    pub async fn run(&self, import_dir: &Path) -> Result<ImportStats> {
        if !import_dir.is_dir() {
            return Err(Error::Template(format!(
                "import directory {} not found",
                import_dir.display()
            )));
        }
        let files = scan_sql_files(import_dir)?;
        let workers = self.options.workers.max(1);
        info!(files = files.len(), workers, "starting import");

        let counters = Arc::new(Counters::default());
        let (task_tx, task_rx) = mpsc::channel::<ReadJob>(workers);
        let (row_tx, row_rx) = mpsc::channel::<WriteRow>(workers);
        let task_rx: SharedReceiver<ReadJob> = Arc::new(Mutex::new(task_rx));
        let row_rx: SharedReceiver<WriteRow> = Arc::new(Mutex::new(row_rx));

        let readers: Vec<JoinHandle<()>> = (1..=workers)
            .map(|id| {
                let worker = ReadWorker {
                    id,
                    jobs: Arc::clone(&task_rx),
                    rows: row_tx.clone(),
                    staging: Arc::clone(&self.staging),
                    counters: Arc::clone(&counters),
                    row_limit: self.options.row_limit,
                    debug: self.options.debug,
                    cancel: self.cancel.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();
        drop(row_tx);

        let writers: Vec<JoinHandle<()>> = (1..=workers)
            .map(|id| {
                let worker = WriteWorker {
                    id,
                    rows: Arc::clone(&row_rx),
                    staging: Arc::clone(&self.staging),
                    counters: Arc::clone(&counters),
                    batch_size: self.options.batch_size.max(1),
                    debug: self.options.debug,
                };
                tokio::spawn(worker.run())
            })
            .collect();

        let pb = if self.options.show_progress {
            start_progress_bar(files.len(), "import")
        } else {
            None
        };
        let partitioner = Partitioner::new(self.options.window_size, self.options.small_range);
        let mut overrides: Vec<Arc<dyn SourceDb>> = Vec::new();
        for file in &files {
            if self.cancel.is_cancelled() {
                break;
            }
            Counters::bump(&counters.files, 1);
            match self
                .enqueue_file(file, &partitioner, &task_tx, &mut overrides)
                .await
            {
                Ok(tasks) => Counters::bump(&counters.tasks, tasks),
                Err(e) => {
                    Counters::bump(&counters.files_failed, 1);
                    error!(file = %file.display(), "import template failed: {}", e);
                }
            }
            advance_progress(&pb, &file.display().to_string());
        }
        finish_progress(pb, "templates loaded");
        info!("load sql files end");

        drop(task_tx);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            _ = futures::future::join_all(readers) => {}
        }
        for source in overrides {
            debug!(data_source = source.name(), "closing data source");
            source.close().await;
        }

        info!("waiting for all import workers...");
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            _ = futures::future::join_all(writers) => {}
        }

        if let Err(e) = self.staging.vacuum().await {
            warn!("staging VACUUM failed: {}", e);
        }

        let stats = counters.snapshot();
        info!(
            files = stats.files,
            tasks = stats.tasks,
            tasks_failed = stats.tasks_failed,
            rows_read = stats.rows_read,
            rows_written = stats.rows_written,
            rows_skipped = stats.rows_skipped,
            "import done"
        );
        Ok(stats)
    }

    /// Run a template's setup statements, partition its SELECT and queue the
    /// chunks. Returns the number of chunks queued. Sources opened for a
    /// `-- ds=` directive are pushed onto `overrides` for the caller to close.
    async fn enqueue_file(
        &self,
        file: &Path,
        partitioner: &Partitioner,
        tasks: &mpsc::Sender<ReadJob>,
        overrides: &mut Vec<Arc<dyn SourceDb>>,
    ) -> Result<u64> {
        info!("Load File: {}", file.display());
        let raw = std::fs::read_to_string(file)?;
        let sql = substitute_lang(&raw, &self.options.lang);
        let table = table_name_for(file)?;
        let directives = Directives::parse(&sql);
        if self.options.debug {
            info!(table = %table, "sql: {}", sql);
        } else {
            debug!(table = %table, "sql: {}", sql);
        }

        let source = match &directives.data_source {
            Some(name) => {
                info!("special external data source={}", name);
                let source = self.resolver.resolve(name).await?;
                overrides.push(Arc::clone(&source));
                source
            }
            None => Arc::clone(&self.default_source),
        };

        let mut statements = split_statements(&sql);
        let select = statements
            .pop()
            .ok_or_else(|| Error::InvalidSql(format!("{} holds no statement", file.display())))?;
        for setup in &statements {
            if let Err(e) = source.execute(setup).await {
                warn!("{} error: {}", setup, e);
            }
        }
        if !is_select(&select) {
            return Err(Error::InvalidSql("do not start with SELECT".to_string()));
        }

        let planned = partitioner
            .plan(source.as_ref(), &select, &directives.key, &table)
            .await?;
        let count = planned.len() as u64;

        let (ready_tx, ready_rx) = watch::channel(TableState::Pending);
        let mut owner = Some(ready_tx);
        for task in planned {
            let barrier = match (task.is_first_chunk, owner.take()) {
                (true, Some(tx)) => Barrier::Owner(tx),
                (_, tx) => {
                    owner = tx;
                    Barrier::Waiter(ready_rx.clone())
                }
            };
            let job = ReadJob {
                task,
                source: Arc::clone(&source),
                barrier,
            };
            tasks
                .send(job)
                .await
                .map_err(|_| Error::Other("read workers stopped".to_string()))?;
        }
        Ok(count)
    }
}

struct ReadWorker {
    id: usize,
    jobs: SharedReceiver<ReadJob>,
    rows: mpsc::Sender<WriteRow>,
    staging: Arc<StagingStore>,
    counters: Arc<Counters>,
    row_limit: u64,
    debug: bool,
    cancel: CancellationToken,
}

impl ReadWorker {
    async fn run(self) {
        while let Some(job) = next_message(&self.jobs).await {
            if self.cancel.is_cancelled() {
                continue;
            }
            let table = job.task.table.clone();
            if let Err(e) = self.read(job).await {
                Counters::bump(&self.counters.tasks_failed, 1);
                warn!("[worker-read-{:03}][error] {}: {}", self.id, table, e);
            }
        }
        debug!("[worker-read-{:03}] done", self.id);
    }

    async fn read(&self, job: ReadJob) -> Result<()> {
        let ReadJob {
            task,
            source,
            barrier,
        } = job;
        let sql = apply_row_limit(&task.statement, self.row_limit);
        if self.debug {
            info!("[worker-read-{:03}] readSql: {}", self.id, sql);
        } else {
            debug!("[worker-read-{:03}] readSql: {}", self.id, sql);
        }

        match barrier {
            Barrier::Owner(ready) => {
                let created = self.create_table(source.as_ref(), &task.table, &sql).await;
                let state = if created.is_ok() {
                    TableState::Ready
                } else {
                    TableState::Failed
                };
                let _ = ready.send(state);
                created?;
            }
            Barrier::Waiter(mut ready) => {
                let created = ready
                    .wait_for(|state| *state != TableState::Pending)
                    .await
                    .map(|state| *state == TableState::Ready)
                    .unwrap_or(false);
                if !created {
                    return Err(Error::TableNotReady(task.table));
                }
            }
        }

        let table: Arc<str> = Arc::from(task.table.as_str());
        let mut rows = source.fetch(&sql);
        while let Some(row) = rows.next().await {
            match row {
                Ok(record) => {
                    Counters::bump(&self.counters.rows_read, 1);
                    let msg = WriteRow {
                        table: Arc::clone(&table),
                        record,
                    };
                    if self.rows.send(msg).await.is_err() {
                        return Err(Error::Other("write workers stopped".to_string()));
                    }
                }
                Err(Error::RowDecode(reason)) => {
                    Counters::bump(&self.counters.rows_skipped, 1);
                    warn!("[worker-read-{:03}] skip row in {}: {}", self.id, table, reason);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn create_table(&self, source: &dyn SourceDb, table: &str, sql: &str) -> Result<()> {
        let columns = source.describe(sql).await?;
        let create_sql = create_table_sql(table, &columns);
        if self.debug {
            info!("{}", create_sql);
        } else {
            debug!("{}", create_sql);
        }
        self.staging.recreate_table(table, &create_sql).await
    }
}

struct WriteWorker {
    id: usize,
    rows: SharedReceiver<WriteRow>,
    staging: Arc<StagingStore>,
    counters: Arc<Counters>,
    batch_size: usize,
    debug: bool,
}

impl WriteWorker {
    async fn run(self) {
        let mut batches: HashMap<Arc<str>, RowBatch> = HashMap::new();
        let mut count: u64 = 0;

        while let Some(WriteRow { table, record }) = next_message(&self.rows).await {
            count += 1;
            let batch = batches
                .entry(Arc::clone(&table))
                .or_insert_with(|| RowBatch::new(table.as_ref(), Arc::clone(&record.columns)));

            if !Arc::ptr_eq(&batch.columns, &record.columns) && batch.columns != record.columns {
                let pending = batch.take();
                self.flush(pending).await;
                batch.columns = Arc::clone(&record.columns);
            }
            batch.push(record.values);

            if batch.len() >= self.batch_size {
                if self.debug {
                    info!(
                        "[worker-write-{:03}] {} flush count:{}, size:{}",
                        self.id,
                        table,
                        count,
                        batch.len()
                    );
                }
                let pending = batch.take();
                self.flush(pending).await;
            }
        }

        for (_, mut batch) in batches {
            if !batch.is_empty() {
                let pending = batch.take();
                self.flush(pending).await;
            }
        }
        debug!("[worker-write-{:03}] done after {} rows", self.id, count);
    }

    async fn flush(&self, batch: RowBatch) {
        if batch.is_empty() {
            return;
        }
        match self.staging.insert_batch(&batch).await {
            Ok(written) => Counters::bump(&self.counters.rows_written, written),
            Err(e) => {
                Counters::bump(&self.counters.batches_failed, 1);
                warn!(
                    "[worker-write-{:03}] error executing batch insert into {} ({} rows): {}",
                    self.id,
                    batch.table,
                    batch.len(),
                    e
                );
            }
        }
    }
}
