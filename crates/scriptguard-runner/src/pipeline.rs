//! Per-run Log Pipeline.
//!
//! Stream readers push entries into a bounded queue with `try_send`; a
//! single writer task drains it in batches. A full queue drops the entry and
//! bumps a per-stream counter instead of stalling the reader. When the run
//! ends, [`LogPipeline::finish`] closes the queue, waits for the final flush
//! and writes one warning entry if anything was dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use scriptguard_core::config::LogsConfig;
use scriptguard_core::{ExecutionId, LogEntry, LogLevel, LogMessage, SharedClock, TaskId};
use scriptguard_store::Store;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl PipelineSettings {
    pub fn from_config(logs: &LogsConfig) -> Self {
        Self {
            queue_capacity: logs.queue_capacity,
            batch_size: logs.batch_size,
            flush_interval: Duration::from_millis(logs.flush_interval_ms),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&LogsConfig::default())
    }
}

/// Entries discarded because the queue was full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounts {
    pub stdout: u64,
    pub stderr: u64,
}

impl DropCounts {
    pub fn total(&self) -> u64 {
        self.stdout + self.stderr
    }
}

#[derive(Debug, Default)]
struct DropCounters {
    stdout: AtomicU64,
    stderr: AtomicU64,
}

/// Producer handle given to each stream reader.
#[derive(Debug, Clone)]
pub struct LogSink {
    tx: mpsc::Sender<LogEntry>,
    drops: Arc<DropCounters>,
}

impl LogSink {
    /// Enqueue without waiting. Returns `false` if the entry was dropped.
    pub fn push(&self, entry: LogEntry) -> bool {
        let level = entry.level;
        match self.tx.try_send(entry) {
            Ok(()) => true,
            Err(_) => {
                let counter = match level {
                    LogLevel::Stderr => &self.drops.stderr,
                    _ => &self.drops.stdout,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

pub struct LogPipeline {
    sink: LogSink,
    writer: JoinHandle<()>,
    store: Arc<dyn Store>,
    clock: SharedClock,
    execution_id: ExecutionId,
    task_id: TaskId,
}

impl LogPipeline {
    /// Create the queue and spawn its writer. Must be called inside a Tokio
    /// runtime.
    pub fn start(
        settings: &PipelineSettings,
        store: Arc<dyn Store>,
        clock: SharedClock,
        execution_id: ExecutionId,
        task_id: TaskId,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let writer = tokio::spawn(run_writer(
            rx,
            Arc::clone(&store),
            settings.batch_size.max(1),
            settings.flush_interval,
            execution_id.clone(),
        ));
        Self {
            sink: LogSink {
                tx,
                drops: Arc::new(DropCounters::default()),
            },
            writer,
            store,
            clock,
            execution_id,
            task_id,
        }
    }

    pub fn sink(&self) -> LogSink {
        self.sink.clone()
    }

    /// Close the queue, wait for the writer's final flush and persist the
    /// drop summary if needed.
    ///
    /// Every [`LogSink`] clone must be dropped first or the writer never
    /// sees the queue close.
    pub async fn finish(self) -> DropCounts {
        let LogPipeline {
            sink,
            writer,
            store,
            clock,
            execution_id,
            task_id,
        } = self;

        let drops = DropCounts {
            stdout: sink.drops.stdout.load(Ordering::Relaxed),
            stderr: sink.drops.stderr.load(Ordering::Relaxed),
        };
        drop(sink);

        if let Err(e) = writer.await {
            error!(execution_id = %execution_id, "log writer task failed: {e}");
        }

        if drops.total() > 0 {
            warn!(
                execution_id = %execution_id,
                stdout = drops.stdout,
                stderr = drops.stderr,
                "log queue overflowed; entries were dropped"
            );
            let summary = LogMessage::new(
                Some(execution_id.clone()),
                task_id,
                clock.now(),
                LogLevel::Warning,
                format!(
                    "log queue overflowed: dropped stdout={} lines, stderr={} lines \
                     (output was discarded so the script would not block)",
                    drops.stdout, drops.stderr
                ),
            );
            if let Err(e) = store.insert_log(&summary.into()) {
                error!(execution_id = %execution_id, "failed to persist drop summary: {e}");
            }
        }
        drops
    }
}

async fn run_writer(
    mut rx: mpsc::Receiver<LogEntry>,
    store: Arc<dyn Store>,
    batch_size: usize,
    flush_interval: Duration,
    execution_id: ExecutionId,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut batch: Vec<LogEntry> = Vec::with_capacity(batch_size);

    loop {
        tokio::select! {
            entry = rx.recv() => match entry {
                Some(entry) => {
                    batch.push(entry);
                    if batch.len() >= batch_size {
                        flush(store.as_ref(), &mut batch, &execution_id);
                    }
                }
                None => {
                    flush(store.as_ref(), &mut batch, &execution_id);
                    return;
                }
            },
            _ = ticker.tick() => flush(store.as_ref(), &mut batch, &execution_id),
        }
    }
}

fn flush(store: &dyn Store, batch: &mut Vec<LogEntry>, execution_id: &ExecutionId) {
    if batch.is_empty() {
        return;
    }
    match store.insert_logs(batch) {
        Ok(()) => debug!(execution_id = %execution_id, count = batch.len(), "flushed log batch"),
        Err(e) => error!(
            execution_id = %execution_id,
            count = batch.len(),
            "failed to persist log batch: {e}"
        ),
    }
    batch.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};
    use scriptguard_core::ManualClock;
    use scriptguard_store::{LogFilter, SqliteStore};

    fn setup() -> (Arc<dyn Store>, SharedClock) {
        let start = FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 2, 1, 12, 0, 0)
            .unwrap();
        let clock: SharedClock = Arc::new(ManualClock::new(start));
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory(clock.clone()).unwrap());
        (store, clock)
    }

    fn entry(clock: &SharedClock, exec: &ExecutionId, level: LogLevel, n: usize) -> LogEntry {
        LogMessage::new(
            Some(exec.clone()),
            TaskId::from("task"),
            clock.now(),
            level,
            format!("line {n}"),
        )
        .into()
    }

    #[tokio::test]
    async fn everything_is_flushed_on_finish_in_order() {
        let (store, clock) = setup();
        let exec = ExecutionId::new();
        let settings = PipelineSettings {
            queue_capacity: 100,
            batch_size: 7,
            flush_interval: Duration::from_secs(60),
        };
        let pipeline = LogPipeline::start(
            &settings,
            store.clone(),
            clock.clone(),
            exec.clone(),
            TaskId::from("task"),
        );
        let sink = pipeline.sink();
        for n in 0..50 {
            assert!(sink.push(entry(&clock, &exec, LogLevel::Stdout, n)));
        }
        drop(sink);

        let drops = pipeline.finish().await;
        assert_eq!(drops, DropCounts::default());

        let logs = store.list_logs(LogFilter::Execution(&exec), 1000).unwrap();
        assert_eq!(logs.len(), 50);
        assert_eq!(logs[0].content, "line 0");
        assert_eq!(logs[49].content, "line 49");
    }

    #[tokio::test]
    async fn full_queue_drops_and_writes_one_summary() {
        let (store, clock) = setup();
        let exec = ExecutionId::new();
        let settings = PipelineSettings {
            queue_capacity: 4,
            batch_size: 200,
            flush_interval: Duration::from_secs(60),
        };
        let pipeline = LogPipeline::start(
            &settings,
            store.clone(),
            clock.clone(),
            exec.clone(),
            TaskId::from("task"),
        );
        let sink = pipeline.sink();
        // No await between pushes, so on the current-thread runtime the
        // writer cannot drain the queue in the meantime.
        for n in 0..10 {
            sink.push(entry(&clock, &exec, LogLevel::Stdout, n));
        }
        for n in 0..3 {
            sink.push(entry(&clock, &exec, LogLevel::Stderr, n));
        }
        drop(sink);

        let drops = pipeline.finish().await;
        assert_eq!(drops, DropCounts { stdout: 6, stderr: 3 });

        let logs = store.list_logs(LogFilter::Execution(&exec), 1000).unwrap();
        let warnings: Vec<_> = logs.iter().filter(|l| l.level == LogLevel::Warning).collect();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].content.contains("stdout=6"));
        assert!(warnings[0].content.contains("stderr=3"));
        assert_eq!(logs.len(), 4 + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_flushes_partial_batches() {
        let (store, clock) = setup();
        let exec = ExecutionId::new();
        let settings = PipelineSettings {
            queue_capacity: 10,
            batch_size: 200,
            flush_interval: Duration::from_millis(200),
        };
        let pipeline = LogPipeline::start(
            &settings,
            store.clone(),
            clock.clone(),
            exec.clone(),
            TaskId::from("task"),
        );
        pipeline.sink().push(entry(&clock, &exec, LogLevel::Stdout, 0));

        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(store.list_logs(LogFilter::Execution(&exec), 10).unwrap().len(), 1);

        pipeline.finish().await;
    }
}
