use core::sync::atomic::AtomicBool;

pub mod backends;
pub mod config;
pub mod coord;
pub mod job;
pub mod keygen;
pub mod stats;
pub mod worker;
pub mod workload;

/// Cleared to begin an orderly shutdown. Every long-running loop polls this.
pub static RUNNING: AtomicBool = AtomicBool::new(true);

/// Set alongside clearing `RUNNING` when the worker should re-exec itself
/// with its original arguments after draining.
pub static RESTART: AtomicBool = AtomicBool::new(false);

/// Timestamped stdout line, used for operator-facing progress output.
#[macro_export]
macro_rules! output {
    () => {
        let now = chrono::Utc::now();
        println!("{}", now.to_rfc3339_opts(chrono::SecondsFormat::Millis, false));
    };
    ($($arg:tt)*) => {{
        let now = chrono::Utc::now();
        println!("{} {}", now.to_rfc3339_opts(chrono::SecondsFormat::Millis, false), format_args!($($arg)*));
    }};
}
