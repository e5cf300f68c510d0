use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;

use super::redis::connect;
use super::{materialize, Backend, BackendError, MaterializedValue, RecordMap, RecordValue};
use crate::config::Config;
use crate::coord::Conn;
use crate::job::{FieldMap, FieldValue};

fn push_value(cmd: &mut redis::Cmd, value: &FieldValue) {
    match materialize(value) {
        MaterializedValue::Text(text) => {
            cmd.arg(text);
        }
        MaterializedValue::Bytes(bytes) => {
            cmd.arg(&bytes[..]);
        }
    }
}

fn hset_cmd(key: &str, fields: &FieldMap) -> redis::Cmd {
    let mut cmd = redis::cmd("HSET");
    cmd.arg(key);
    for (name, value) in fields {
        cmd.arg(name);
        push_value(&mut cmd, value);
    }
    cmd
}

fn record_value_from_bytes(bytes: Vec<u8>) -> RecordValue {
    match String::from_utf8(bytes) {
        Ok(text) => RecordValue::Text(text),
        Err(error) => RecordValue::Bytes(error.into_bytes()),
    }
}

fn record_from_hash(hash: HashMap<String, Vec<u8>>) -> RecordMap {
    hash.into_iter()
        .map(|(name, bytes)| (name, record_value_from_bytes(bytes)))
        .collect()
}

fn record_from_values(names: &[String], values: Vec<Option<Vec<u8>>>) -> RecordMap {
    let mut record = RecordMap::new();
    for (name, value) in names.iter().zip(values) {
        if let Some(bytes) = value {
            record.insert(name.clone(), record_value_from_bytes(bytes));
        }
    }
    record
}

/// One Redis hash per record. Field-level updates need no read-before-write,
/// so this variant has none of the JSON document's lost-update window.
pub struct HashRedis {
    conn: Conn,
}

impl HashRedis {
    pub async fn new(config: &Config) -> Result<Self, BackendError> {
        Ok(Self {
            conn: connect(config).await?,
        })
    }
}

#[async_trait]
impl Backend for HashRedis {
    /// DEL then HSET in one pipeline, so absent fields are removed.
    async fn put_record(&self, key: &str, fields: &FieldMap) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.cmd("DEL").arg(key).ignore();
        if !fields.is_empty() {
            pipe.add_command(hset_cmd(key, fields)).ignore();
        }
        let () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn update_record(&self, key: &str, fields: &FieldMap) -> Result<(), BackendError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let () = hset_cmd(key, fields).query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_record(&self, key: &str) -> Result<RecordMap, BackendError> {
        let mut conn = self.conn.clone();
        let hash: HashMap<String, Vec<u8>> =
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(record_from_hash(hash))
    }

    async fn get_record_fields(
        &self,
        key: &str,
        names: &[String],
    ) -> Result<RecordMap, BackendError> {
        let mut conn = self.conn.clone();
        let values: Vec<Option<Vec<u8>>> = redis::cmd("HMGET")
            .arg(key)
            .arg(names)
            .query_async(&mut conn)
            .await?;
        Ok(record_from_values(names, values))
    }

    async fn batch_get_records(&self, keys: &[String]) -> Result<Vec<RecordMap>, BackendError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("HGETALL").arg(key);
        }
        let hashes: Vec<HashMap<String, Vec<u8>>> = pipe.query_async(&mut conn).await?;
        Ok(hashes.into_iter().map(record_from_hash).collect())
    }

    async fn batch_get_record_fields(
        &self,
        keys: &[String],
        names: &[String],
    ) -> Result<Vec<RecordMap>, BackendError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("HMGET").arg(key).arg(names);
        }
        let rows: Vec<Vec<Option<Vec<u8>>>> = pipe.query_async(&mut conn).await?;
        Ok(rows
            .into_iter()
            .map(|values| record_from_values(names, values))
            .collect())
    }

    async fn batch_put_records(
        &self,
        items: &BTreeMap<String, FieldMap>,
    ) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for (key, fields) in items {
            pipe.cmd("DEL").arg(key).ignore();
            if !fields.is_empty() {
                pipe.add_command(hset_cmd(key, fields)).ignore();
            }
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
        "redis-hash"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_values_convert_by_utf8() {
        let mut hash = HashMap::new();
        hash.insert("text".to_string(), b"hello".to_vec());
        hash.insert("blob".to_string(), vec![0xff, 0xfe, 0x00]);
        let record = record_from_hash(hash);
        assert_eq!(record.get("text"), Some(&RecordValue::Text("hello".into())));
        assert_eq!(
            record.get("blob"),
            Some(&RecordValue::Bytes(vec![0xff, 0xfe, 0x00]))
        );
    }

    #[test]
    fn missing_hash_fields_are_omitted() {
        let names = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let values = vec![Some(b"1".to_vec()), None, Some(b"3".to_vec())];
        let record = record_from_values(&names, values);
        assert_eq!(record.len(), 2);
        assert!(record.contains_key("a"));
        assert!(!record.contains_key("b"));
        assert!(record.contains_key("c"));
    }
}
