use core::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use backtrace::Backtrace;
use clap::{Arg, ArgAction, Command};
use ringlog::*;
use tokio::runtime::Builder;
use tokio::time::sleep;

use kv_stress::config::{load_traffic, Config};
use kv_stress::coord::{Coord, Keyspace};
use kv_stress::stats::{monitor, PublisherStats};
use kv_stress::workload::process_traffic;
use kv_stress::RUNNING;

fn main() {
    // custom panic hook to terminate whole process after unwinding
    std::panic::set_hook(Box::new(|s| {
        eprintln!("{s}");
        eprintln!("{:?}", Backtrace::new());
        std::process::exit(101);
    }));

    let matches = Command::new("publisher")
        .version(env!("CARGO_PKG_VERSION"))
        .long_about(
            "Synthesizes request streams at prescribed QPS targets and \
            shards them across per-worker job queues in the coordination \
            store.",
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
            Arg::new("config")
                .long("config")
                .help("Config file path")
                .action(ArgAction::Set)
                .default_value("config.json"),
        )
        .arg(
            Arg::new("traffic")
                .long("traffic")
                .help("Traffic script path")
                .action(ArgAction::Set)
                .default_value("traffic.json"),
        )
        .arg(
            Arg::new("stats")
                .long("stats")
                .help("Enable stats monitoring")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("tls")
                .long("tls")
                .help("Enable TLS to the coordination store")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .help("Enable debug logging")
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

    let (config, raw_config) = Config::load(matches.get_one::<String>("config").unwrap());
    let stages = load_traffic(matches.get_one::<String>("traffic").unwrap());

    let stats = Arc::new(PublisherStats::new());

    runtime.block_on(async {
        let mut conn = match coord.connect().await {
            Ok(conn) => conn,
            Err(error) => {
                eprintln!("failed to connect to coordination store: {error}");
                std::process::exit(1);
            }
        };

        // reconcile the stored config; workers re-exec on update_config
        let stored: Option<Vec<u8>> = redis::cmd("GET")
            .arg(keyspace.cfg())
            .query_async(&mut conn)
            .await
            .unwrap_or_default();
        if stored.as_deref() != Some(raw_config.as_slice()) {
            let set: Result<(), redis::RedisError> = redis::cmd("SET")
                .arg(keyspace.cfg())
                .arg(&raw_config)
                .query_async(&mut conn)
                .await;
            if let Err(error) = set {
                eprintln!("failed to store config: {error}");
                std::process::exit(1);
            }
            let _: Result<(), redis::RedisError> = redis::cmd("PUBLISH")
                .arg(keyspace.notify())
                .arg("update_config")
                .query_async(&mut conn)
                .await;
            info!("config updated and notification sent");
        }

        if matches.get_flag("stats") {
            tokio::spawn(monitor(
                coord.clone(),
                keyspace.clone(),
                config.threads(),
                stats.clone(),
            ));
        }

        info!("warming up");
        sleep(Duration::from_secs(2)).await;

        process_traffic(coord, keyspace, config.threads(), stages, stats).await;

        info!("all tasks published");
    });

    RUNNING.store(false, Ordering::Relaxed);
    std::thread::sleep(Duration::from_millis(100));
}
