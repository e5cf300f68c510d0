use serde::{Deserialize, Serialize};

mod traffic;

pub use traffic::{smooth, Action, Stage, Task, TemplateValue};

fn default_concurrency() -> usize {
    50
}

/// The shared config document. The publisher writes it to `<prefix>_cfg` in
/// the coordination store; workers read it at startup and again on an
/// `update_config` notification.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    table_name: String,
    region: String,
    threads: usize,
    /// Overrides ElastiCache endpoint discovery for the Redis backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    redis_addr: Option<String>,
    /// Dispatcher pool size per worker. Raise to 2000 for high-load runs.
    #[serde(default = "default_concurrency")]
    concurrency: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    sample_data: Vec<serde_json::Value>,
}

impl Config {
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Number of queue shards, and therefore of worker pullers.
    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn redis_addr(&self) -> Option<&str> {
        self.redis_addr.as_deref()
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn sample_data(&self) -> &[serde_json::Value] {
        &self.sample_data
    }

    /// Loads the config document from a local file, exiting on any problem.
    /// Returns the raw bytes alongside so the publisher can compare them
    /// with the stored copy byte-for-byte.
    pub fn load(filename: &str) -> (Self, Vec<u8>) {
        let raw = match std::fs::read(filename) {
            Ok(raw) => raw,
            Err(error) => {
                eprintln!("error loading config file: {filename}\n{error}");
                std::process::exit(1);
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(config) => (config, raw),
            Err(error) => {
                eprintln!("failed to parse config file: {filename}\n{error}");
                std::process::exit(1);
            }
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Loads the traffic script: a top-level array where each element is either
/// a task object or an array of task objects to run in parallel.
pub fn load_traffic(filename: &str) -> Vec<Stage> {
    let raw = match std::fs::read(filename) {
        Ok(raw) => raw,
        Err(error) => {
            eprintln!("error loading traffic file: {filename}\n{error}");
            std::process::exit(1);
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(stages) => stages,
        Err(error) => {
            eprintln!("failed to parse traffic file: {filename}\n{error}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_document_roundtrip() {
        let raw = r#"{"table_name":"multirow-bench","region":"us-east-1","threads":4}"#;
        let config = Config::from_json(raw).unwrap();
        assert_eq!(config.table_name(), "multirow-bench");
        assert_eq!(config.region(), "us-east-1");
        assert_eq!(config.threads(), 4);
        assert_eq!(config.concurrency(), 50);
        assert!(config.redis_addr().is_none());
    }

    #[test]
    fn config_document_extras() {
        let raw = r#"{
            "table_name": "bench",
            "region": "us-west-2",
            "threads": 8,
            "redis_addr": "cache-node:6379",
            "concurrency": 2000,
            "sample_data": [{"col": {"r": 4, "len": 100}}]
        }"#;
        let config = Config::from_json(raw).unwrap();
        assert_eq!(config.redis_addr(), Some("cache-node:6379"));
        assert_eq!(config.concurrency(), 2000);
        assert_eq!(config.sample_data().len(), 1);
    }
}
