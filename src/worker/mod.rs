use core::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use ringlog::*;

use crate::backends::Backend;
use crate::config::Action;
use crate::coord::{Conn, Coord, Keyspace};
use crate::job::Job;
use crate::stats::{queue_lengths, WorkerCounters, WorkerReport};
use crate::{RESTART, RUNNING};

/// Jobs drained per LPOP.
const POP_BATCH: usize = 500;

/// Idle back-off between empty pops and after pull failures.
const IDLE: Duration = Duration::from_millis(10);

/// This worker's identity in telemetry, taken from the host name.
pub fn worker_id() -> String {
    std::process::Command::new("hostname")
        .output()
        .ok()
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("worker-{}", std::process::id()))
}

/// Drains one shard queue in batches and feeds decoded jobs into the
/// dispatcher channel. Exits when shutdown begins or the channel closes;
/// the channel itself closes once every puller has dropped its sender.
pub async fn puller(
    mut conn: Conn,
    queue: String,
    job_tx: async_channel::Sender<Job>,
    counters: Arc<WorkerCounters>,
) {
    while RUNNING.load(Ordering::Relaxed) {
        let popped: Result<Vec<String>, redis::RedisError> = redis::cmd("LPOP")
            .arg(&queue)
            .arg(POP_BATCH)
            .query_async(&mut conn)
            .await;

        match popped {
            Ok(items) if items.is_empty() => {
                tokio::time::sleep(IDLE).await;
            }
            Ok(items) => {
                for raw in items {
                    match Job::decode(raw.as_bytes()) {
                        Ok(job) => {
                            if job_tx.send(job).await.is_err() {
                                return;
                            }
                        }
                        Err(error) => {
                            debug!("job decode failed: {error}");
                            counters.record_error();
                        }
                    }
                }
            }
            Err(error) => {
                if RUNNING.load(Ordering::Relaxed) {
                    debug!("queue pull failed: {error}");
                }
                tokio::time::sleep(IDLE).await;
            }
        }
    }
}

/// One dispatcher: consumes jobs until the channel closes, calling into the
/// backend and counting outcomes. Dispatch is fire-and-forget; failures are
/// never requeued.
pub async fn dispatcher(
    job_rx: async_channel::Receiver<Job>,
    backend: Arc<dyn Backend>,
    counters: Arc<WorkerCounters>,
) {
    while let Ok(job) = job_rx.recv().await {
        execute(&*backend, &counters, job).await;
    }
}

async fn execute(backend: &dyn Backend, counters: &WorkerCounters, job: Job) {
    let (action, result) = match job {
        Job::Put { key, data } => (Action::Put, backend.put_record(&key, &data).await),
        Job::Update { key, data } => (Action::Update, backend.update_record(&key, &data).await),
        Job::Get { key } => (Action::Get, backend.get_record(&key).await.map(|_| ())),
        Job::GetSub { key, data } => {
            let names: Vec<String> = data.keys().cloned().collect();
            (
                Action::GetSub,
                backend.get_record_fields(&key, &names).await.map(|_| ()),
            )
        }
        Job::Delete { key } => (Action::Delete, backend.delete_record(&key).await),
        Job::BatchGet { items } => (
            Action::BatchGet,
            backend.batch_get_records(&items).await.map(|_| ()),
        ),
        Job::BatchGetSub { items, data } => {
            let names: Vec<String> = data.keys().cloned().collect();
            (
                Action::BatchGetSub,
                backend
                    .batch_get_record_fields(&items, &names)
                    .await
                    .map(|_| ()),
            )
        }
        Job::BatchPut { items } => (
            Action::BatchPut,
            backend.batch_put_records(&items).await,
        ),
    };

    match result {
        Ok(()) => counters.record(action),
        Err(error) => {
            // failures observed after shutdown begins are cancellation
            // noise, not workload errors
            if RUNNING.load(Ordering::Relaxed) {
                debug!("{} failed: {error}", action.name());
                counters.record_error();
            }
        }
    }
}

/// Control-plane listener on `<prefix>_notify`.
pub async fn listen_notify(coord: Coord, keyspace: Keyspace) {
    let mut pubsub = match coord.pubsub().await {
        Ok(pubsub) => pubsub,
        Err(error) => {
            error!("notify subscription failed: {error}");
            return;
        }
    };
    if let Err(error) = pubsub.subscribe(keyspace.notify()).await {
        error!("notify subscription failed: {error}");
        return;
    }

    let mut control = match coord.connect().await {
        Ok(conn) => Some(conn),
        Err(_) => None,
    };

    let mut messages = pubsub.on_message();
    while let Some(message) = messages.next().await {
        let payload: String = message.get_payload().unwrap_or_default();
        match payload.as_str() {
            "update_config" => {
                if let Some(conn) = control.as_mut() {
                    let raw: Result<Option<String>, redis::RedisError> =
                        redis::cmd("GET").arg(keyspace.cfg()).query_async(conn).await;
                    if let Ok(Some(raw)) = raw {
                        info!("config updated ({} bytes); restarting", raw.len());
                    }
                }
                RESTART.store(true, Ordering::Relaxed);
                RUNNING.store(false, Ordering::Relaxed);
                return;
            }
            "stop" => {
                info!("stop requested");
                RUNNING.store(false, Ordering::Relaxed);
                return;
            }
            "execute_bash" => {
                info!("execute_bash notification received");
            }
            "reboot_instance" => {
                warn!("rebooting instance");
                let _ = tokio::process::Command::new("sudo")
                    .arg("reboot")
                    .status()
                    .await;
            }
            "terminate_instance" => {
                warn!("terminating instance");
                let _ = std::process::Command::new("kill")
                    .args(["-TERM", &std::process::id().to_string()])
                    .status();
            }
            other => {
                debug!("ignored notification: {other}");
            }
        }
    }
}

/// Once a second: swap-and-read the counters, sample queue depths, publish
/// the report on `<prefix>_stats`, and log a local summary.
pub async fn telemetry(
    mut conn: Conn,
    keyspace: Keyspace,
    threads: usize,
    counters: Arc<WorkerCounters>,
    worker_id: String,
) {
    let start = Instant::now();
    let mut interval = tokio::time::interval(Duration::from_secs(1));

    while RUNNING.load(Ordering::Relaxed) {
        interval.tick().await;

        let snapshot = counters.snapshot();
        let queues = queue_lengths(&mut conn, &keyspace, threads).await;
        let report = WorkerReport::new(&worker_id, snapshot, queues, start.elapsed());

        let payload = match serde_json::to_string(&report) {
            Ok(payload) => payload,
            Err(_) => continue,
        };
        let published: Result<(), redis::RedisError> = redis::cmd("PUBLISH")
            .arg(keyspace.stats())
            .arg(&payload)
            .query_async(&mut conn)
            .await;
        if let Err(error) = published {
            debug!("stats publish failed: {error}");
        }

        info!(
            "[STATS] P:{} U:{} G:{} GS:{} D:{} BG:{} BGS:{} BP:{} E:{} T:{} Q:{}{:?} T:{:?}",
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
            report.queues,
            Duration::from_secs(report.elapsed as u64),
        );
    }
}

/// Replaces this process with a fresh copy of itself, preserving argv.
/// Used for the `update_config` graceful handoff.
pub fn reexec() -> ! {
    use std::os::unix::process::CommandExt;

    let args: Vec<String> = std::env::args().collect();
    let error = std::process::Command::new(&args[0]).args(&args[1..]).exec();
    eprintln!("re-exec failed: {error}");
    std::process::exit(1);
}
