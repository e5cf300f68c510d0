use core::sync::atomic::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Timelike;
use futures::future::join_all;
use ringlog::*;

use crate::config::{smooth, Action, Stage, Task, TemplateValue};
use crate::coord::{Conn, Coord, Keyspace};
use crate::job::{placeholder_offset, FieldMap, FieldValue, Job, PLACEHOLDER_ID};
use crate::keygen::KeyGenerator;
use crate::stats::PublisherStats;
use crate::{output, RUNNING};

/// Generation tick cadence. Each tick emits `run_qps / 100` jobs and sleeps
/// to the next absolute deadline, so generation work does not drift the rate.
const TICK: Duration = Duration::from_millis(10);

/// Effectively unbounded end time for tasks limited by `times` alone.
const FOREVER: Duration = Duration::from_secs(100 * 365 * 86400);

/// Jobs per 10 ms tick for a QPS target.
pub(crate) fn tick_batch(run_qps: u64) -> u64 {
    std::cmp::max(1, run_qps / 100)
}

/// Pipeline tunings scale with the QPS target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Tuning {
    pub job_buffer: usize,
    pub batch_buffer: usize,
    pub batch_size: usize,
    pub senders: usize,
}

impl Tuning {
    pub fn for_qps(qps: u64) -> Self {
        if qps > 100_000 {
            Self {
                job_buffer: 30,
                batch_buffer: 80,
                batch_size: 160_000,
                senders: 30,
            }
        } else {
            Self {
                job_buffer: 3,
                batch_buffer: 3,
                batch_size: 1000,
                senders: 5,
            }
        }
    }
}

/// Strict round-robin keeps per-shard queue depths within one job of each
/// other.
pub(crate) struct RoundRobin {
    next: usize,
    shards: usize,
}

impl RoundRobin {
    pub fn new(shards: usize) -> Self {
        Self { next: 0, shards }
    }

    pub fn next(&mut self) -> usize {
        let shard = self.next;
        self.next += 1;
        if self.next >= self.shards {
            self.next = 0;
        }
        shard
    }
}

struct QueuedJob {
    shard: usize,
    payload: Vec<u8>,
}

struct JobBatch {
    jobs: Vec<QueuedJob>,
}

/// Expands a field template: `{r, len}` entries get a random decimal suffix
/// appended to the base name; literals pass through. Draws come from the
/// auxiliary stream only.
fn expand_data(template: &BTreeMap<String, TemplateValue>, keygen: &mut KeyGenerator) -> FieldMap {
    let mut data = FieldMap::new();
    for (name, value) in template {
        match value {
            TemplateValue::Random { r, len } => {
                data.insert(keygen.next_key_for(name, *r), FieldValue::Len(*len));
            }
            TemplateValue::Literal(text) => {
                data.insert(name.clone(), FieldValue::Text(text.clone()));
            }
        }
    }
    data
}

/// Builds one serialized job payload. With `init` set, non-batch payloads
/// carry the placeholder id instead of a fresh key, for the sample cache.
pub(crate) fn build_payload(task: &Task, keygen: &mut KeyGenerator, init: bool) -> Vec<u8> {
    let key = |keygen: &mut KeyGenerator| {
        if init {
            PLACEHOLDER_ID.to_string()
        } else {
            keygen.next_key()
        }
    };

    let job = match task.action {
        Action::Put => Job::Put {
            key: key(keygen),
            data: expand_data(&task.data, keygen),
        },
        Action::Update => Job::Update {
            key: key(keygen),
            data: expand_data(&task.data, keygen),
        },
        Action::Get => Job::Get { key: key(keygen) },
        Action::GetSub => Job::GetSub {
            key: key(keygen),
            data: expand_data(&task.data, keygen),
        },
        Action::Delete => Job::Delete { key: key(keygen) },
        Action::BatchGet => Job::BatchGet {
            items: (0..task.batch_size()).map(|_| keygen.next_key()).collect(),
        },
        Action::BatchGetSub => Job::BatchGetSub {
            items: (0..task.batch_size()).map(|_| keygen.next_key()).collect(),
            data: expand_data(&task.data, keygen),
        },
        Action::BatchPut => Job::BatchPut {
            items: (0..task.batch_size())
                .map(|_| (keygen.next_key(), expand_data(&task.data, keygen)))
                .collect(),
        },
    };

    job.encode()
}

/// Pre-generated payloads with a known placeholder region. Rendering copies
/// the bytes and overlays a fresh key, skipping JSON work on the hot path.
pub(crate) struct SampleCache {
    payloads: Vec<Vec<u8>>,
    offsets: Vec<usize>,
}

impl SampleCache {
    pub fn build(task: &Task, keygen: &mut KeyGenerator) -> Option<Self> {
        if task.samples == 0 || task.action.is_batch() {
            return None;
        }

        let mut payloads = Vec::with_capacity(task.samples);
        let mut offsets = Vec::with_capacity(task.samples);
        for _ in 0..task.samples {
            let payload = build_payload(task, keygen, true);
            let offset = placeholder_offset(&payload)
                .expect("sample payloads always embed the placeholder id");
            payloads.push(payload);
            offsets.push(offset);
        }
        Some(Self { payloads, offsets })
    }

    pub fn render(&self, keygen: &mut KeyGenerator) -> Vec<u8> {
        let pick = keygen.next_intn(self.payloads.len());
        let mut payload = self.payloads[pick].clone();
        let offset = self.offsets[pick];
        keygen.fill_key(&mut payload[offset..offset + 32]);
        payload
    }
}

/// Runs one traffic task to completion: paced generation into the batcher,
/// batches into the sender pool, pipelined RPUSH into the shard queues.
pub async fn publish_task(
    coord: Coord,
    keyspace: Keyspace,
    threads: usize,
    task: Task,
    stats: Arc<PublisherStats>,
) {
    let curve = if task.qpss.is_empty() {
        Vec::new()
    } else {
        let curve = smooth(&task.qpss);
        output!("{curve:?}");
        curve
    };

    let run_qps = task.qps;
    let total_tasks = task.total_tasks(run_qps);
    let tuning = Tuning::for_qps(run_qps);

    stats.update(task.action.name(), total_tasks, run_qps, true);

    let (job_tx, job_rx) = async_channel::bounded::<QueuedJob>(tuning.job_buffer);
    let (batch_tx, batch_rx) = async_channel::bounded::<JobBatch>(tuning.batch_buffer);

    // stage two: accumulate fixed-size batches
    let batcher = {
        let stats = stats.clone();
        let batch_size = tuning.batch_size;
        tokio::spawn(async move {
            let mut jobs = Vec::with_capacity(batch_size);
            while let Ok(job) = job_rx.recv().await {
                jobs.push(job);
                if jobs.len() >= batch_size {
                    stats.add_batch(jobs.len() as u64);
                    let full = std::mem::replace(&mut jobs, Vec::with_capacity(batch_size));
                    if batch_tx.send(JobBatch { jobs: full }).await.is_err() {
                        return;
                    }
                }
            }
            if !jobs.is_empty() {
                stats.add_batch(jobs.len() as u64);
                let _ = batch_tx.send(JobBatch { jobs }).await;
            }
        })
    };

    // stage three: sender pool, each with its own connection
    let mut senders = Vec::with_capacity(tuning.senders);
    for _ in 0..tuning.senders {
        let batch_rx = batch_rx.clone();
        let keyspace = keyspace.clone();
        let stats = stats.clone();
        let coord = coord.clone();
        senders.push(tokio::spawn(async move {
            let mut conn = match coord.connect().await {
                Ok(conn) => conn,
                Err(error) => {
                    error!("sender connection failed: {error}");
                    return;
                }
            };
            while let Ok(batch) = batch_rx.recv().await {
                send_batch(&mut conn, &keyspace, threads, batch, &stats).await;
            }
        }));
    }
    drop(batch_rx);

    // stage one: paced generation on a blocking thread
    let generator = {
        let task = task.clone();
        let stats = stats.clone();
        tokio::task::spawn_blocking(move || {
            generate(task, curve, threads, total_tasks, job_tx, stats);
        })
    };

    let _ = generator.await;
    let _ = batcher.await;
    for sender in senders {
        let _ = sender.await;
    }

    // let the monitor catch the final counts
    tokio::time::sleep(Duration::from_secs(1)).await;
}

fn generate(
    task: Task,
    curve: Vec<f64>,
    threads: usize,
    mut total_tasks: u64,
    job_tx: async_channel::Sender<QueuedJob>,
    stats: Arc<PublisherStats>,
) {
    let mut keygen = KeyGenerator::new(task.seed, &task.seeds);
    let samples = SampleCache::build(&task, &mut keygen);

    let mut run_qps = task.qps;
    let mut shards = RoundRobin::new(threads);
    let mut counter: u64 = 0;
    let mut last_hour: i64 = -1;

    let start = Instant::now();
    let mut next_tick = start;
    let end = if task.duration > 0 {
        start + Duration::from_secs(task.duration)
    } else {
        start + FOREVER
    };

    while RUNNING.load(Ordering::Relaxed) {
        if next_tick > end || counter >= total_tasks {
            break;
        }

        if !curve.is_empty() {
            let hour = chrono::Local::now().hour() as i64;
            if hour != last_hour {
                last_hour = hour;
                run_qps = (task.qps as f64 * curve[hour as usize % curve.len()]) as u64;
                if task.times == 0 {
                    total_tasks = run_qps * task.duration;
                }
                stats.update(task.action.name(), total_tasks, run_qps, false);
            }
        }

        let batch = tick_batch(run_qps);
        let mut emitted = 0u64;
        for _ in 0..batch {
            if counter >= total_tasks {
                break;
            }
            counter += 1;

            let payload = match &samples {
                Some(samples) => samples.render(&mut keygen),
                None => build_payload(&task, &mut keygen, false),
            };
            if job_tx
                .send_blocking(QueuedJob {
                    shard: shards.next(),
                    payload,
                })
                .is_err()
            {
                return;
            }
            emitted += 1;
        }
        stats.add_json(emitted);

        next_tick += TICK;
        let now = Instant::now();
        if next_tick > now {
            std::thread::sleep(next_tick - now);
        }
    }
}

/// Groups one batch by shard and ships it with a pipelined RPUSH. A failed
/// push is logged and dropped; the widening remaining-task count surfaces
/// the loss.
async fn send_batch(
    conn: &mut Conn,
    keyspace: &Keyspace,
    threads: usize,
    batch: JobBatch,
    stats: &PublisherStats,
) {
    let count = batch.jobs.len() as u64;
    let mut grouped: Vec<Vec<Vec<u8>>> = vec![Vec::new(); threads];
    for job in batch.jobs {
        debug!("{} {}", keyspace.queue(job.shard), String::from_utf8_lossy(&job.payload));
        grouped[job.shard].push(job.payload);
    }

    let mut pipe = redis::pipe();
    for (shard, payloads) in grouped.iter().enumerate() {
        if !payloads.is_empty() {
            pipe.cmd("RPUSH")
                .arg(keyspace.queue(shard))
                .arg(payloads)
                .ignore();
        }
    }

    let result: Result<(), redis::RedisError> = pipe.query_async(conn).await;
    match result {
        Ok(()) => stats.add_sent(count),
        Err(error) => error!("queue push failed: {error}"),
    }
}

/// Walks the traffic script: stages in order, parallel groups concurrently.
pub async fn process_traffic(
    coord: Coord,
    keyspace: Keyspace,
    threads: usize,
    stages: Vec<Stage>,
    stats: Arc<PublisherStats>,
) {
    for stage in stages {
        match stage {
            Stage::Single(task) => {
                info!(
                    "publishing task: action={} qps={}",
                    task.action.name(),
                    task.qps
                );
                publish_task(coord.clone(), keyspace.clone(), threads, task, stats.clone()).await;
            }
            Stage::Parallel(tasks) => {
                let runs = tasks.into_iter().map(|task| {
                    info!(
                        "publishing parallel task: action={} qps={}",
                        task.action.name(),
                        task.qps
                    );
                    publish_task(
                        coord.clone(),
                        keyspace.clone(),
                        threads,
                        task,
                        stats.clone(),
                    )
                });
                join_all(runs).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(raw: &str) -> Task {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn tick_batch_tracks_qps() {
        assert_eq!(tick_batch(100_000), 1000);
        assert_eq!(tick_batch(1000), 10);
        // clamped to at least one job per tick
        assert_eq!(tick_batch(50), 1);
        assert_eq!(tick_batch(0), 1);
    }

    #[test]
    fn tunings_scale_with_qps() {
        assert_eq!(
            Tuning::for_qps(200_000),
            Tuning {
                job_buffer: 30,
                batch_buffer: 80,
                batch_size: 160_000,
                senders: 30,
            }
        );
        assert_eq!(
            Tuning::for_qps(100_000),
            Tuning {
                job_buffer: 3,
                batch_buffer: 3,
                batch_size: 1000,
                senders: 5,
            }
        );
    }

    #[test]
    fn round_robin_balances_within_one() {
        let shards = 7;
        let mut rr = RoundRobin::new(shards);
        let mut counts = vec![0u64; shards];
        for _ in 0..10_003 {
            counts[rr.next()] += 1;
        }
        let max = counts.iter().max().unwrap();
        let min = counts.iter().min().unwrap();
        assert!(max - min <= 1, "counts: {counts:?}");
    }

    #[test]
    fn expansion_draws_only_from_aux_stream() {
        let raw = r#"{"action": "putItem", "qps": 1,
                       "data": {"col": {"r": 4, "len": 100}}}"#;

        // keys with expansion interleaved must match keys generated alone
        let mut with_data = KeyGenerator::new(42, &[]);
        let mut keys_only = KeyGenerator::new(42, &[]);

        let t = task(raw);
        let mut seen = Vec::new();
        for _ in 0..10 {
            let payload = build_payload(&t, &mut with_data, false);
            let decoded = Job::decode(&payload).unwrap();
            match decoded {
                Job::Put { key, .. } => seen.push(key),
                other => panic!("wrong variant: {other:?}"),
            }
        }
        for key in seen {
            assert_eq!(key, keys_only.next_key());
        }
    }

    #[test]
    fn expanded_field_names_stay_in_range() {
        let t = task(
            r#"{"action": "putItem", "qps": 1, "data": {"col": {"r": 4, "len": 100}}}"#,
        );
        let mut keygen = KeyGenerator::new(42, &[]);
        for _ in 0..200 {
            let payload = build_payload(&t, &mut keygen, false);
            match Job::decode(&payload).unwrap() {
                Job::Put { data, .. } => {
                    assert_eq!(data.len(), 1);
                    let name = data.keys().next().unwrap();
                    assert!(["col0", "col1", "col2", "col3"].contains(&name.as_str()));
                    assert_eq!(data.values().next(), Some(&FieldValue::Len(100)));
                }
                other => panic!("wrong variant: {other:?}"),
            }
        }
    }

    #[test]
    fn batch_payloads_size_from_samples() {
        let t = task(r#"{"action": "batchGetItem", "qps": 1, "samples": 500}"#);
        let mut keygen = KeyGenerator::new(1, &[]);
        match Job::decode(&build_payload(&t, &mut keygen, false)).unwrap() {
            Job::BatchGet { items } => assert_eq!(items.len(), 500),
            other => panic!("wrong variant: {other:?}"),
        }

        let t = task(r#"{"action": "batchGetItem", "qps": 1}"#);
        match Job::decode(&build_payload(&t, &mut keygen, false)).unwrap() {
            Job::BatchGet { items } => assert_eq!(items.len(), 10),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn sample_cache_skips_batch_actions() {
        let mut keygen = KeyGenerator::new(1, &[]);
        let t = task(r#"{"action": "batchGetItem", "qps": 1, "samples": 5}"#);
        assert!(SampleCache::build(&t, &mut keygen).is_none());

        let t = task(r#"{"action": "putItem", "qps": 1}"#);
        assert!(SampleCache::build(&t, &mut keygen).is_none());

        let t = task(r#"{"action": "putItem", "qps": 1, "samples": 5}"#);
        let cache = SampleCache::build(&t, &mut keygen).unwrap();
        assert_eq!(cache.payloads.len(), 5);
    }

    #[test]
    fn sample_overlay_touches_only_the_key_region() {
        let t = task(
            r#"{"action": "putItem", "qps": 1, "samples": 1, "seed": 9,
                "data": {"col": {"r": 4, "len": 100}}}"#,
        );
        let mut keygen = KeyGenerator::new(9, &[]);
        let cache = SampleCache::build(&t, &mut keygen).unwrap();
        let template = cache.payloads[0].clone();
        let offset = cache.offsets[0];

        for _ in 0..100 {
            let rendered = cache.render(&mut keygen);
            assert_eq!(rendered.len(), template.len());
            // bytes outside the placeholder region identical to the sample
            assert_eq!(rendered[..offset], template[..offset]);
            assert_eq!(rendered[offset + 32..], template[offset + 32..]);
            // region holds 32 lowercase-hex characters
            let key = std::str::from_utf8(&rendered[offset..offset + 32]).unwrap();
            assert!(key
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
            // payload still decodes
            assert!(Job::decode(&rendered).is_ok());
        }
    }

    #[test]
    fn fixed_seed_payload_streams_are_identical() {
        let raw = r#"{"action": "updateItem", "qps": 1, "seed": 7,
                       "data": {"a": {"r": 2, "len": 10}, "b": "lit"}}"#;
        let mut first = KeyGenerator::new(7, &[]);
        let mut second = KeyGenerator::new(7, &[]);
        let t = task(raw);
        for _ in 0..100 {
            assert_eq!(
                build_payload(&t, &mut first, false),
                build_payload(&t, &mut second, false)
            );
        }
    }
}
