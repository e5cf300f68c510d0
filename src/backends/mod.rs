use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use rand::RngCore;

use crate::config::Config;
use crate::job::{FieldMap, FieldValue};

mod dynamodb;
mod dynamodb_multirow;
mod redis;
mod redis_hash;
mod redis_multirow;

pub use dynamodb::SingleRowDynamo;
pub use dynamodb_multirow::MultiRowDynamo;
pub use redis::SingleRowRedis;
pub use redis_hash::HashRedis;
pub use redis_multirow::MultiRowRedis;

/// A field value read back from a backend.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordValue {
    Text(String),
    Bytes(Vec<u8>),
    Number(String),
}

/// A logical record as returned by read operations.
pub type RecordMap = BTreeMap<String, RecordValue>;

#[derive(Debug)]
pub enum BackendError {
    Redis(::redis::RedisError),
    Dynamo(String),
    Setup(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Redis(error) => write!(f, "redis: {error}"),
            Self::Dynamo(error) => write!(f, "dynamodb: {error}"),
            Self::Setup(error) => write!(f, "setup: {error}"),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<::redis::RedisError> for BackendError {
    fn from(error: ::redis::RedisError) -> Self {
        Self::Redis(error)
    }
}

/// Maps any AWS SDK error into the backend error space. The SDK error types
/// are generic per operation, so they are carried as rendered strings.
pub(crate) fn dynamo_err(error: impl fmt::Display) -> BackendError {
    BackendError::Dynamo(error.to_string())
}

/// The capability set every backend variant implements. Operations report
/// success or failure and are never retried here; failures propagate to the
/// dispatcher, which counts them.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Replaces the logical record. Multi-row variants relax this to a
    /// merge; see the variant docs.
    async fn put_record(&self, key: &str, fields: &FieldMap) -> Result<(), BackendError>;

    /// Merges the given fields into the record, creating it if absent.
    async fn update_record(&self, key: &str, fields: &FieldMap) -> Result<(), BackendError>;

    /// All fields; empty map if the record is absent.
    async fn get_record(&self, key: &str) -> Result<RecordMap, BackendError>;

    /// The requested subset; missing fields are omitted.
    async fn get_record_fields(
        &self,
        key: &str,
        names: &[String],
    ) -> Result<RecordMap, BackendError>;

    /// One map per input key, aligned to input order; missing records yield
    /// empty maps.
    async fn batch_get_records(&self, keys: &[String]) -> Result<Vec<RecordMap>, BackendError>;

    async fn batch_get_record_fields(
        &self,
        keys: &[String],
        names: &[String],
    ) -> Result<Vec<RecordMap>, BackendError>;

    async fn batch_put_records(
        &self,
        items: &BTreeMap<String, FieldMap>,
    ) -> Result<(), BackendError>;

    /// Removes all fields for the key.
    async fn delete_record(&self, key: &str) -> Result<(), BackendError>;

    fn name(&self) -> &'static str;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbKind {
    Dynamo,
    Redis,
    RedisHash,
}

impl std::str::FromStr for DbKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dynamodb" => Ok(Self::Dynamo),
            "redis" => Ok(Self::Redis),
            "redis-hash" => Ok(Self::RedisHash),
            other => Err(format!("unknown db type: {other}")),
        }
    }
}

/// Table names beginning with `multirow` select the row-per-field layout.
pub fn is_multirow(table_name: &str) -> bool {
    table_name.starts_with("multirow")
}

/// Builds the backend for the configured table.
pub async fn build(kind: DbKind, config: &Config) -> Result<Arc<dyn Backend>, BackendError> {
    let multirow = is_multirow(config.table_name());
    let backend: Arc<dyn Backend> = match (kind, multirow) {
        (DbKind::Dynamo, false) => Arc::new(SingleRowDynamo::new(config).await?),
        (DbKind::Dynamo, true) => Arc::new(MultiRowDynamo::new(config).await?),
        (DbKind::Redis, false) => Arc::new(SingleRowRedis::new(config).await?),
        (DbKind::Redis, true) => Arc::new(MultiRowRedis::new(config).await?),
        (DbKind::RedisHash, _) => Arc::new(HashRedis::new(config).await?),
    };
    Ok(backend)
}

/// The value sizes workloads use most; blobs for these are pre-generated so
/// hot-path writers reuse one immutable slice instead of allocating.
const CACHED_BLOB_SIZES: &[usize] = &[100, 1000, 8000, 10000, 50000, 100000];

static BLOB_CACHE: Lazy<HashMap<usize, Arc<[u8]>>> = Lazy::new(|| {
    let mut cache = HashMap::new();
    let mut rng = rand::thread_rng();
    for size in CACHED_BLOB_SIZES {
        let mut data = vec![0u8; *size];
        rng.fill_bytes(&mut data);
        cache.insert(*size, Arc::from(data.into_boxed_slice()));
    }
    cache
});

/// A random blob of `len` bytes, shared from the cache for common sizes.
pub fn blob(len: usize) -> Arc<[u8]> {
    if let Some(cached) = BLOB_CACHE.get(&len) {
        return cached.clone();
    }
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    Arc::from(data.into_boxed_slice())
}

/// Materializes a job field value: byte-count hints become blobs.
pub(crate) fn materialize(value: &FieldValue) -> MaterializedValue {
    match value {
        FieldValue::Len(len) => MaterializedValue::Bytes(blob(*len as usize)),
        FieldValue::Text(text) => MaterializedValue::Text(text.clone()),
    }
}

pub(crate) enum MaterializedValue {
    Text(String),
    Bytes(Arc<[u8]>),
}
