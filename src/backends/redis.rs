use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use redis::cluster::ClusterClient;
use ringlog::*;
use serde_json::Value;

use super::{dynamo_err, materialize, Backend, BackendError, MaterializedValue, RecordMap,
    RecordValue};
use crate::config::Config;
use crate::coord::{url_for, Conn};
use crate::job::FieldMap;

/// Resolved value-store endpoint: address, TLS, cluster mode.
pub(crate) struct Endpoint {
    pub addr: String,
    pub tls: bool,
    pub cluster: bool,
}

/// The target Redis endpoint. `redis_addr` in the config overrides
/// discovery; otherwise `table_name` is treated as an ElastiCache
/// replication group id. A configuration endpoint means cluster mode;
/// `cache.amazonaws.com` addresses get TLS.
pub(crate) async fn resolve_endpoint(config: &Config) -> Result<Endpoint, BackendError> {
    if let Some(addr) = config.redis_addr() {
        return Ok(Endpoint {
            addr: addr.to_string(),
            tls: addr.contains("cache.amazonaws.com"),
            cluster: addr.contains("cluster"),
        });
    }

    let sdk_config = aws_config::defaults(BehaviorVersion::latest())
        .region(aws_config::Region::new(config.region().to_string()))
        .load()
        .await;
    let client = aws_sdk_elasticache::Client::new(&sdk_config);

    let output = client
        .describe_replication_groups()
        .replication_group_id(config.table_name())
        .send()
        .await
        .map_err(dynamo_err)?;

    let group = output
        .replication_groups()
        .first()
        .ok_or_else(|| BackendError::Setup("replication group not found".to_string()))?;

    if let Some(endpoint) = group.configuration_endpoint() {
        let addr = format!(
            "{}:{}",
            endpoint.address().unwrap_or_default(),
            endpoint.port().unwrap_or(6379),
        );
        let tls = addr.contains("cache.amazonaws.com");
        return Ok(Endpoint {
            addr,
            tls,
            cluster: true,
        });
    }

    let endpoint = group
        .node_groups()
        .first()
        .and_then(|node_group| node_group.primary_endpoint())
        .ok_or_else(|| BackendError::Setup("replication group has no endpoint".to_string()))?;
    let addr = format!(
        "{}:{}",
        endpoint.address().unwrap_or_default(),
        endpoint.port().unwrap_or(6379),
    );
    let tls = addr.contains("cache.amazonaws.com");
    Ok(Endpoint {
        addr,
        tls,
        cluster: false,
    })
}

/// Connects to the value store and verifies the connection with a PING.
pub(crate) async fn connect(config: &Config) -> Result<Conn, BackendError> {
    let endpoint = resolve_endpoint(config).await?;
    let url = url_for(&endpoint.addr, endpoint.tls);

    let mut conn = if endpoint.cluster {
        Conn::Cluster(ClusterClient::new(vec![url])?.get_async_connection().await?)
    } else {
        Conn::Single(
            redis::Client::open(url)?
                .get_multiplexed_async_connection()
                .await?,
        )
    };

    let () = redis::cmd("PING").query_async(&mut conn).await?;
    debug!("connected to value store at {}", endpoint.addr);
    Ok(conn)
}

/// Serializes a field map into the stored JSON document. Blobs become
/// base64 strings, which is what a JSON byte-array encoding produces.
fn document_value(fields: &FieldMap) -> serde_json::Map<String, Value> {
    let mut document = serde_json::Map::with_capacity(fields.len());
    for (name, value) in fields {
        let encoded = match materialize(value) {
            MaterializedValue::Text(text) => Value::String(text),
            MaterializedValue::Bytes(bytes) => Value::String(BASE64.encode(&bytes[..])),
        };
        document.insert(name.clone(), encoded);
    }
    document
}

fn record_from_document(document: &serde_json::Map<String, Value>) -> RecordMap {
    let mut record = RecordMap::new();
    for (name, value) in document {
        let converted = match value {
            Value::String(s) => RecordValue::Text(s.clone()),
            Value::Number(n) => RecordValue::Number(n.to_string()),
            other => RecordValue::Text(other.to_string()),
        };
        record.insert(name.clone(), converted);
    }
    record
}

fn parse_document(raw: &str) -> serde_json::Map<String, Value> {
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|value| match value {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default()
}

/// One serialized JSON document per record. Updates are read-modify-write
/// with no concurrency guard; concurrent updates to one key can lose
/// writes. The hash variant avoids that.
pub struct SingleRowRedis {
    conn: Conn,
}

impl SingleRowRedis {
    pub async fn new(config: &Config) -> Result<Self, BackendError> {
        Ok(Self {
            conn: connect(config).await?,
        })
    }
}

#[async_trait]
impl Backend for SingleRowRedis {
    async fn put_record(&self, key: &str, fields: &FieldMap) -> Result<(), BackendError> {
        let document = Value::Object(document_value(fields)).to_string();
        let mut conn = self.conn.clone();
        let () = redis::cmd("SET")
            .arg(key)
            .arg(document)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn update_record(&self, key: &str, fields: &FieldMap) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let existing: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        let mut document = existing.as_deref().map(parse_document).unwrap_or_default();
        for (name, value) in document_value(fields) {
            document.insert(name, value);
        }
        let () = redis::cmd("SET")
            .arg(key)
            .arg(Value::Object(document).to_string())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_record(&self, key: &str) -> Result<RecordMap, BackendError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(raw
            .as_deref()
            .map(|raw| record_from_document(&parse_document(raw)))
            .unwrap_or_default())
    }

    async fn get_record_fields(
        &self,
        key: &str,
        names: &[String],
    ) -> Result<RecordMap, BackendError> {
        let mut record = self.get_record(key).await?;
        record.retain(|name, _| names.contains(name));
        Ok(record)
    }

    async fn batch_get_records(&self, keys: &[String]) -> Result<Vec<RecordMap>, BackendError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("GET").arg(key);
        }
        let raws: Vec<Option<String>> = pipe.query_async(&mut conn).await?;
        Ok(raws
            .into_iter()
            .map(|raw| {
                raw.as_deref()
                    .map(|raw| record_from_document(&parse_document(raw)))
                    .unwrap_or_default()
            })
            .collect())
    }

    async fn batch_get_record_fields(
        &self,
        keys: &[String],
        names: &[String],
    ) -> Result<Vec<RecordMap>, BackendError> {
        let mut records = self.batch_get_records(keys).await?;
        for record in records.iter_mut() {
            record.retain(|name, _| names.contains(name));
        }
        Ok(records)
    }

    async fn batch_put_records(
        &self,
        items: &BTreeMap<String, FieldMap>,
    ) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for (key, fields) in items {
            pipe.cmd("SET")
                .arg(key)
                .arg(Value::Object(document_value(fields)).to_string())
                .ignore();
        }
        let () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete_record(&self, key: &str) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::FieldValue;

    fn fields() -> FieldMap {
        let mut map = FieldMap::new();
        map.insert("name".to_string(), FieldValue::Text("v".into()));
        map.insert("payload".to_string(), FieldValue::Len(16));
        map
    }

    #[test]
    fn documents_encode_blobs_as_base64() {
        let document = document_value(&fields());
        assert_eq!(document.get("name"), Some(&Value::String("v".into())));
        let encoded = match document.get("payload") {
            Some(Value::String(s)) => s.clone(),
            other => panic!("expected string, got {other:?}"),
        };
        assert_eq!(BASE64.decode(encoded).unwrap().len(), 16);
    }

    #[test]
    fn documents_parse_back_into_records() {
        let raw = r#"{"name":"v","n":7}"#;
        let record = record_from_document(&parse_document(raw));
        assert_eq!(record.get("name"), Some(&RecordValue::Text("v".into())));
        assert_eq!(record.get("n"), Some(&RecordValue::Number("7".into())));
    }

    #[test]
    fn malformed_documents_read_as_empty() {
        assert!(parse_document("not-json").is_empty());
        assert!(parse_document("[1,2,3]").is_empty());
    }
}
