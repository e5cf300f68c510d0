use std::collections::BTreeMap;

use async_trait::async_trait;

use super::redis::connect;
use super::{materialize, Backend, BackendError, MaterializedValue, RecordMap, RecordValue};
use crate::config::Config;
use crate::coord::Conn;
use crate::job::{FieldMap, FieldValue};

/// `{<id>}:<field>`. The hash-tag braces pin every field of one record to
/// the same cluster slot.
fn field_key(key: &str, field: &str) -> String {
    format!("{{{key}}}:{field}")
}

/// Strips `{<id>}:` from an enumerated field key.
fn field_name(key: &str, full: &str) -> String {
    full[key.len() + 3..].to_string()
}

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

fn record_value_from_bytes(bytes: Vec<u8>) -> RecordValue {
    match String::from_utf8(bytes) {
        Ok(text) => RecordValue::Text(text),
        Err(error) => RecordValue::Bytes(error.into_bytes()),
    }
}

/// One Redis key per field. Record reads enumerate with a KEYS pattern
/// scan, expensive at scale, which is exactly the cost these workloads
/// measure.
pub struct MultiRowRedis {
    conn: Conn,
}

impl MultiRowRedis {
    pub async fn new(config: &Config) -> Result<Self, BackendError> {
        Ok(Self {
            conn: connect(config).await?,
        })
    }

    async fn fetch_record(&self, conn: &mut Conn, key: &str) -> Result<RecordMap, BackendError> {
        let pattern = field_key(key, "*");
        let field_keys: Vec<String> =
            redis::cmd("KEYS").arg(&pattern).query_async(conn).await?;
        if field_keys.is_empty() {
            return Ok(RecordMap::new());
        }

        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(&field_keys)
            .query_async(conn)
            .await?;

        let mut record = RecordMap::new();
        for (full, value) in field_keys.iter().zip(values) {
            if let Some(bytes) = value {
                record.insert(field_name(key, full), record_value_from_bytes(bytes));
            }
        }
        Ok(record)
    }

    async fn fetch_fields(
        &self,
        conn: &mut Conn,
        key: &str,
        names: &[String],
    ) -> Result<RecordMap, BackendError> {
        let field_keys: Vec<String> =
            names.iter().map(|name| field_key(key, name)).collect();
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(&field_keys)
            .query_async(conn)
            .await?;

        let mut record = RecordMap::new();
        for (name, value) in names.iter().zip(values) {
            if let Some(bytes) = value {
                record.insert(name.clone(), record_value_from_bytes(bytes));
            }
        }
        Ok(record)
    }
}

#[async_trait]
impl Backend for MultiRowRedis {
    /// Field keys absent from the input are left in place, so this is a
    /// merge, not a strict replace.
    async fn put_record(&self, key: &str, fields: &FieldMap) -> Result<(), BackendError> {
        self.update_record(key, fields).await
    }

    async fn update_record(&self, key: &str, fields: &FieldMap) -> Result<(), BackendError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("MSET");
        for (name, value) in fields {
            cmd.arg(field_key(key, name));
            push_value(&mut cmd, value);
        }
        let () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_record(&self, key: &str) -> Result<RecordMap, BackendError> {
        let mut conn = self.conn.clone();
        self.fetch_record(&mut conn, key).await
    }

    async fn get_record_fields(
        &self,
        key: &str,
        names: &[String],
    ) -> Result<RecordMap, BackendError> {
        let mut conn = self.conn.clone();
        self.fetch_fields(&mut conn, key, names).await
    }

    async fn batch_get_records(&self, keys: &[String]) -> Result<Vec<RecordMap>, BackendError> {
        let mut conn = self.conn.clone();
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            records.push(self.fetch_record(&mut conn, key).await?);
        }
        Ok(records)
    }

    async fn batch_get_record_fields(
        &self,
        keys: &[String],
        names: &[String],
    ) -> Result<Vec<RecordMap>, BackendError> {
        let mut conn = self.conn.clone();
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            records.push(self.fetch_fields(&mut conn, key, names).await?);
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
            for (name, value) in fields {
                let mut cmd = redis::cmd("SET");
                cmd.arg(field_key(key, name));
                push_value(&mut cmd, value);
                pipe.add_command(cmd).ignore();
            }
        }
        let () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete_record(&self, key: &str) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let pattern = field_key(key, "*");
        let field_keys: Vec<String> =
            redis::cmd("KEYS").arg(&pattern).query_async(&mut conn).await?;
        if field_keys.is_empty() {
            return Ok(());
        }
        let () = redis::cmd("DEL")
            .arg(&field_keys)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis-multirow"
    }
}
