use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use redis::AsyncCommands;
use ringlog::*;
use serde::{Deserialize, Serialize};

use crate::config::Action;
use crate::coord::{Coord, Keyspace};
use crate::RUNNING;

/// Pipeline progress counters for the publisher. The generate/batch/send
/// counters are swept-and-reset once per second by the monitor; `finish`
/// accumulates sent jobs for the lifetime of the current task.
pub struct PublisherStats {
    state: Mutex<TaskState>,
    finish: AtomicU64,
    json: AtomicU64,
    batch: AtomicU64,
    sent: AtomicU64,
    start: Instant,
}

#[derive(Default)]
struct TaskState {
    task: String,
    total: u64,
    qps: u64,
}

/// One monitor tick's view of the publisher pipeline.
pub struct Progress {
    pub task: String,
    pub finish: u64,
    pub total: u64,
    pub qps: u64,
    pub elapsed: Duration,
    pub json: u64,
    pub batch: u64,
    pub sent: u64,
}

impl Default for PublisherStats {
    fn default() -> Self {
        Self::new()
    }
}

impl PublisherStats {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TaskState::default()),
            finish: AtomicU64::new(0),
            json: AtomicU64::new(0),
            batch: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    pub fn update(&self, task: &str, total: u64, qps: u64, reset: bool) {
        let mut state = self.state.lock().unwrap();
        state.task = task.to_string();
        state.total = total;
        state.qps = qps;
        if reset {
            self.finish.store(0, Ordering::Relaxed);
        }
    }

    pub fn add_json(&self, n: u64) {
        self.json.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_batch(&self, n: u64) {
        self.batch.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_sent(&self, n: u64) {
        self.sent.fetch_add(n, Ordering::Relaxed);
    }

    /// Sweep-and-reset. The swap makes each tick's rates independent.
    pub fn progress(&self) -> Progress {
        let json = self.json.swap(0, Ordering::Relaxed);
        let batch = self.batch.swap(0, Ordering::Relaxed);
        let sent = self.sent.swap(0, Ordering::Relaxed);
        let finish = self.finish.fetch_add(sent, Ordering::Relaxed) + sent;

        let state = self.state.lock().unwrap();
        Progress {
            task: state.task.clone(),
            finish,
            total: state.total,
            qps: state.qps,
            elapsed: self.start.elapsed(),
            json,
            batch,
            sent,
        }
    }
}

/// Per-action success counters plus a single error counter, owned by one
/// worker process. `snapshot` atomically swaps each cell to zero so a tick
/// reports the rate for the preceding second.
#[derive(Default)]
pub struct WorkerCounters {
    put: AtomicU64,
    update: AtomicU64,
    get: AtomicU64,
    get_sub: AtomicU64,
    delete: AtomicU64,
    batch_get: AtomicU64,
    batch_get_sub: AtomicU64,
    batch_put: AtomicU64,
    errors: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub put: u64,
    pub update: u64,
    pub get: u64,
    pub get_sub: u64,
    pub delete: u64,
    pub batch_get: u64,
    pub batch_get_sub: u64,
    pub batch_put: u64,
    pub errors: u64,
}

impl CounterSnapshot {
    /// Successful dispatches only; errors are reported separately.
    pub fn total(&self) -> u64 {
        self.put
            + self.update
            + self.get
            + self.get_sub
            + self.delete
            + self.batch_get
            + self.batch_get_sub
            + self.batch_put
    }
}

impl WorkerCounters {
    pub fn record(&self, action: Action) {
        let cell = match action {
            Action::Put => &self.put,
            Action::Update => &self.update,
            Action::Get => &self.get,
            Action::GetSub => &self.get_sub,
            Action::Delete => &self.delete,
            Action::BatchGet => &self.batch_get,
            Action::BatchGetSub => &self.batch_get_sub,
            Action::BatchPut => &self.batch_put,
        };
        cell.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            put: self.put.swap(0, Ordering::Relaxed),
            update: self.update.swap(0, Ordering::Relaxed),
            get: self.get.swap(0, Ordering::Relaxed),
            get_sub: self.get_sub.swap(0, Ordering::Relaxed),
            delete: self.delete.swap(0, Ordering::Relaxed),
            batch_get: self.batch_get.swap(0, Ordering::Relaxed),
            batch_get_sub: self.batch_get_sub.swap(0, Ordering::Relaxed),
            batch_put: self.batch_put.swap(0, Ordering::Relaxed),
            errors: self.errors.swap(0, Ordering::Relaxed),
        }
    }
}

/// One worker's per-second telemetry message, published on `<prefix>_stats`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerReport {
    pub worker_id: String,
    pub put: u64,
    pub update: u64,
    pub get: u64,
    pub get_sub: u64,
    pub delete: u64,
    pub batch_get: u64,
    pub batch_get_sub: u64,
    pub batch_put: u64,
    pub errors: u64,
    pub total: u64,
    pub queued: i64,
    pub queues: Vec<i64>,
    pub elapsed: i64,
    pub timestamp: i64,
}

impl WorkerReport {
    pub fn new(
        worker_id: &str,
        snapshot: CounterSnapshot,
        queues: Vec<i64>,
        elapsed: Duration,
    ) -> Self {
        let queued = queues.iter().sum();
        Self {
            worker_id: worker_id.to_string(),
            put: snapshot.put,
            update: snapshot.update,
            get: snapshot.get,
            get_sub: snapshot.get_sub,
            delete: snapshot.delete,
            batch_get: snapshot.batch_get,
            batch_get_sub: snapshot.batch_get_sub,
            batch_put: snapshot.batch_put,
            errors: snapshot.errors,
            total: snapshot.total(),
            queued,
            queues,
            elapsed: elapsed.as_secs() as i64,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Samples every shard queue's depth.
pub async fn queue_lengths(
    conn: &mut crate::coord::Conn,
    keyspace: &Keyspace,
    threads: usize,
) -> Vec<i64> {
    let mut lengths = Vec::with_capacity(threads);
    for shard in 0..threads {
        let length: i64 = conn.llen(keyspace.queue(shard)).await.unwrap_or(0);
        lengths.push(length);
    }
    lengths
}

/// Publisher-side monitor: accumulates the last-seen report per worker from
/// `<prefix>_stats` and prints a rolled-up line plus per-worker details once
/// per second.
pub async fn monitor(
    coord: Coord,
    keyspace: Keyspace,
    threads: usize,
    stats: Arc<PublisherStats>,
) {
    let reports: Arc<Mutex<HashMap<String, WorkerReport>>> =
        Arc::new(Mutex::new(HashMap::new()));

    {
        let coord = coord.clone();
        let stats_channel = keyspace.stats();
        let reports = reports.clone();
        tokio::spawn(async move {
            let mut pubsub = match coord.pubsub().await {
                Ok(pubsub) => pubsub,
                Err(error) => {
                    error!("stats subscription failed: {error}");
                    return;
                }
            };
            if let Err(error) = pubsub.subscribe(&stats_channel).await {
                error!("stats subscription failed: {error}");
                return;
            }
            let mut messages = pubsub.on_message();
            while let Some(message) = messages.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(_) => continue,
                };
                if let Ok(report) = serde_json::from_str::<WorkerReport>(&payload) {
                    reports
                        .lock()
                        .unwrap()
                        .insert(report.worker_id.clone(), report);
                }
            }
        });
    }

    let mut conn = match coord.connect().await {
        Ok(conn) => conn,
        Err(error) => {
            error!("stats monitor connection failed: {error}");
            return;
        }
    };

    let mut interval = tokio::time::interval(Duration::from_secs(1));
    while RUNNING.load(Ordering::Relaxed) {
        interval.tick().await;

        let progress = stats.progress();

        let mut lengths = queue_lengths(&mut conn, &keyspace, threads).await;
        for length in lengths.iter_mut() {
            *length /= 1000;
        }
        let total_queued: i64 = lengths.iter().sum();

        if !progress.task.is_empty() {
            let remaining = progress.total.saturating_sub(progress.finish);
            // remain->[generate/batch/send]->done
            info!(
                "T:{:?} {} {}k->[{}/{}/{}k]->{}k QPS:{}k Q:{}k{:?}",
                Duration::from_secs(progress.elapsed.as_secs()),
                progress.task,
                remaining / 1000,
                progress.json / 1000,
                progress.batch / 1000,
                progress.sent / 1000,
                progress.finish / 1000,
                progress.qps / 1000,
                total_queued,
                lengths,
            );
        }

        let drained: Vec<WorkerReport> = {
            let mut map = reports.lock().unwrap();
            let mut all: Vec<_> = map.drain().map(|(_, report)| report).collect();
            all.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
            all
        };
        for report in drained {
            info!(
                "W:{} P:{} U:{} G:{} GS:{} D:{} BG:{} BGS:{} BP:{} E:{} T:{} Q:{}",
                report.worker_id,
                report.put,
                report.update,
                report.get,
                report.get_sub,
                report.delete,
                report.batch_get,
                report.batch_get_sub,
                report.batch_put,
                report.errors,
                report.total,
                report.queued,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_swap_and_reset() {
        let counters = WorkerCounters::default();
        counters.record(Action::Put);
        counters.record(Action::Put);
        counters.record(Action::Get);
        counters.record(Action::BatchPut);
        counters.record_error();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.put, 2);
        assert_eq!(snapshot.get, 1);
        assert_eq!(snapshot.batch_put, 1);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.total(), 4);

        // reset after read
        let empty = counters.snapshot();
        assert_eq!(empty, CounterSnapshot::default());
    }

    #[test]
    fn counter_soundness_across_snapshots() {
        // successes plus errors equals jobs dispatched, even when snapshots
        // interleave with recording
        let counters = WorkerCounters::default();
        let dispatched = 1000u64;
        let mut observed = 0u64;
        for i in 0..dispatched {
            if i % 7 == 0 {
                counters.record_error();
            } else {
                counters.record(Action::Update);
            }
            if i % 100 == 99 {
                let snap = counters.snapshot();
                observed += snap.total() + snap.errors;
            }
        }
        let snap = counters.snapshot();
        observed += snap.total() + snap.errors;
        assert_eq!(observed, dispatched);
    }

    #[test]
    fn publisher_stats_accumulate_finish() {
        let stats = PublisherStats::new();
        stats.update("putItem", 100, 1000, true);
        stats.add_json(10);
        stats.add_batch(10);
        stats.add_sent(10);

        let progress = stats.progress();
        assert_eq!(progress.task, "putItem");
        assert_eq!(progress.json, 10);
        assert_eq!(progress.sent, 10);
        assert_eq!(progress.finish, 10);

        stats.add_sent(5);
        let progress = stats.progress();
        // swept counters reset, finish accumulates
        assert_eq!(progress.json, 0);
        assert_eq!(progress.sent, 5);
        assert_eq!(progress.finish, 15);

        stats.update("getItem", 50, 500, true);
        assert_eq!(stats.progress().finish, 0);
    }

    #[test]
    fn worker_report_totals() {
        let snapshot = CounterSnapshot {
            put: 3,
            get: 2,
            errors: 1,
            ..Default::default()
        };
        let report =
            WorkerReport::new("worker-1", snapshot, vec![5, 7], Duration::from_secs(9));
        assert_eq!(report.total, 5);
        assert_eq!(report.queued, 12);
        assert_eq!(report.elapsed, 9);

        let encoded = serde_json::to_string(&report).unwrap();
        let decoded: WorkerReport = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.worker_id, "worker-1");
        assert_eq!(decoded.queues, vec![5, 7]);
    }
}
