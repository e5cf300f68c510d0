use core::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use backtrace::Backtrace;
use clap::{Arg, ArgAction, Command};
use ringlog::*;
use tokio::runtime::Builder;
use tokio::time::sleep;

use kv_stress::backends::{self, DbKind};
use kv_stress::config::Config;
use kv_stress::coord::{Coord, Keyspace};
use kv_stress::stats::WorkerCounters;
use kv_stress::worker::{dispatcher, listen_notify, puller, reexec, telemetry, worker_id};
use kv_stress::{RESTART, RUNNING};

fn main() {
    // custom panic hook to terminate whole process after unwinding
    std::panic::set_hook(Box::new(|s| {
        eprintln!("{s}");
        eprintln!("{:?}", Backtrace::new());
        std::process::exit(101);
    }));

    let matches = Command::new("worker")
        .version(env!("CARGO_PKG_VERSION"))
        .long_about(
            "Pulls jobs from an assigned queue shard and executes them \
            against the target backend.",
        )
        .arg(
            Arg::new("redis")
                .long("redis")
                .help("Coordination store address")
                .action(ArgAction::Set)
                .default_value("localhost:6379"),
        )
        .arg(
            Arg::new("prefix")
                .long("prefix")
                .help("Coordination store key prefix")
                .action(ArgAction::Set)
                .default_value("dst"),
        )
        .arg(
            Arg::new("db")
                .long("db")
                .help("Backend type: dynamodb, redis, or redis-hash")
                .action(ArgAction::Set)
                .default_value("dynamodb"),
        )
        .arg(
            Arg::new("tls")
                .long("tls")
                .help("Enable TLS to the coordination store")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats")
                .long("stats")
                .help("Enable stats reporting")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .help("Enable debug logging")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("prof")
                .long("prof")
                .help("Write a CPU flamegraph on shutdown")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let level = if matches.get_flag("debug") {
        Level::Debug
    } else {
        Level::Info
    };

    let debug_log = LogBuilder::new()
        .output(Box::new(Stderr::new()))
        .build()
        .expect("failed to initialize debug log");

    let mut log = MultiLogBuilder::new()
        .level_filter(level.to_level_filter())
        .default(debug_log)
        .build()
        .start();

    let db_kind: DbKind = match matches.get_one::<String>("db").unwrap().parse() {
        Ok(kind) => kind,
        Err(error) => {
            eprintln!("{error}");
            std::process::exit(1);
        }
    };

    let addr = matches.get_one::<String>("redis").unwrap();
    let prefix = matches.get_one::<String>("prefix").unwrap();
    let tls = matches.get_flag("tls");

    let coord = match Coord::open(addr, tls) {
        Ok(coord) => coord,
        Err(error) => {
            eprintln!("failed to open coordination store client: {error}");
            std::process::exit(1);
        }
    };
    let keyspace = Keyspace::new(prefix);

    let profiler = if matches.get_flag("prof") {
        match pprof::ProfilerGuardBuilder::default().frequency(99).build() {
            Ok(guard) => Some(guard),
            Err(error) => {
                eprintln!("failed to start profiler: {error}");
                None
            }
        }
    } else {
        None
    };

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to initialize tokio runtime");

    // flush the log until shutdown completes
    runtime.spawn(async move {
        while RUNNING.load(Ordering::Relaxed) {
            sleep(Duration::from_millis(1)).await;
            let _ = log.flush();
        }
        let _ = log.flush();
    });

    // startup config is required; its absence is fatal
    let (config, backend) = runtime.block_on(async {
        let mut conn = match coord.connect().await {
            Ok(conn) => conn,
            Err(error) => {
                eprintln!("failed to connect to coordination store: {error}");
                std::process::exit(1);
            }
        };

        let raw: Option<String> = redis::cmd("GET")
            .arg(keyspace.cfg())
            .query_async(&mut conn)
            .await
            .unwrap_or_default();
        let raw = match raw {
            Some(raw) => raw,
            None => {
                eprintln!("failed to get config from coordination store");
                std::process::exit(1);
            }
        };
        let config = match Config::from_json(&raw) {
            Ok(config) => config,
            Err(error) => {
                eprintln!("failed to parse stored config: {error}");
                std::process::exit(1);
            }
        };

        let backend = match backends::build(db_kind, &config).await {
            Ok(backend) => backend,
            Err(error) => {
                eprintln!("failed to initialize backend: {error}");
                std::process::exit(1);
            }
        };

        (config, backend)
    });

    let counters = Arc::new(WorkerCounters::default());
    let concurrency = std::cmp::max(1, config.concurrency());
    let (job_tx, job_rx) = async_channel::bounded(concurrency);

    runtime.block_on(async {
        for shard in 0..config.threads() {
            let conn = match coord.connect().await {
                Ok(conn) => conn,
                Err(error) => {
                    eprintln!("failed to connect to coordination store: {error}");
                    std::process::exit(1);
                }
            };
            tokio::spawn(puller(
                conn,
                keyspace.queue(shard),
                job_tx.clone(),
                counters.clone(),
            ));
        }

        for _ in 0..concurrency {
            tokio::spawn(dispatcher(
                job_rx.clone(),
                backend.clone(),
                counters.clone(),
            ));
        }

        tokio::spawn(listen_notify(coord.clone(), keyspace.clone()));

        if matches.get_flag("stats") {
            let conn = match coord.connect().await {
                Ok(conn) => conn,
                Err(error) => {
                    eprintln!("failed to connect to coordination store: {error}");
                    std::process::exit(1);
                }
            };
            tokio::spawn(telemetry(
                conn,
                keyspace.clone(),
                config.threads(),
                counters.clone(),
                worker_id(),
            ));
        }
    });
    // pullers own the only senders now; dispatchers drain after they stop
    drop(job_tx);

    info!(
        "worker started with {} pullers, {} dispatchers, backend={}",
        config.threads(),
        concurrency,
        backend.name(),
    );

    while RUNNING.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_secs(1));
    }

    // let the dispatchers drain in-flight jobs, then stop the pools
    std::thread::sleep(Duration::from_millis(200));
    runtime.shutdown_timeout(Duration::from_millis(100));

    if let Some(guard) = profiler {
        if let Ok(report) = guard.report().build() {
            match std::fs::File::create("flamegraph.svg") {
                Ok(file) => {
                    if report.flamegraph(file).is_ok() {
                        eprintln!("wrote flamegraph.svg");
                    }
                }
                Err(error) => eprintln!("failed to write flamegraph: {error}"),
            }
        }
    }

    if RESTART.load(Ordering::Relaxed) {
        reexec();
    }
}
