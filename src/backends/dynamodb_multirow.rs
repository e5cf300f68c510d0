use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use aws_sdk_dynamodb::types::{AttributeValue, KeysAndAttributes, PutRequest, WriteRequest};
use aws_sdk_dynamodb::Client;
use futures::future::try_join_all;

use super::dynamodb::{client, delete_request_for, record_value, to_attribute, MAX_BATCH_WRITE};
use super::{dynamo_err, Backend, BackendError, RecordMap};
use crate::config::Config;
use crate::job::{FieldMap, FieldValue};

/// One item per (record, field) pair, keyed by `(id, sk)` with the blob in
/// attribute `val`. Field-granular writes at the cost of many rows per
/// logical record.
pub struct MultiRowDynamo {
    client: Client,
    table: String,
}

impl MultiRowDynamo {
    pub async fn new(config: &Config) -> Result<Self, BackendError> {
        Ok(Self {
            client: client(config).await?,
            table: config.table_name().to_string(),
        })
    }

    fn row(key: &str, field: &str, value: &FieldValue) -> HashMap<String, AttributeValue> {
        let mut item = HashMap::with_capacity(3);
        item.insert("id".to_string(), AttributeValue::S(key.to_string()));
        item.insert("sk".to_string(), AttributeValue::S(field.to_string()));
        item.insert("val".to_string(), to_attribute(value));
        item
    }

    fn put_requests(
        key: &str,
        fields: &FieldMap,
    ) -> Result<Vec<WriteRequest>, BackendError> {
        let mut requests = Vec::with_capacity(fields.len());
        for (field, value) in fields {
            let put = PutRequest::builder()
                .set_item(Some(Self::row(key, field, value)))
                .build()
                .map_err(dynamo_err)?;
            requests.push(WriteRequest::builder().put_request(put).build());
        }
        Ok(requests)
    }

    async fn write_chunked(&self, requests: Vec<WriteRequest>) -> Result<(), BackendError> {
        for chunk in requests.chunks(MAX_BATCH_WRITE) {
            self.client
                .batch_write_item()
                .request_items(&self.table, chunk.to_vec())
                .send()
                .await
                .map_err(dynamo_err)?;
        }
        Ok(())
    }

    /// All (sk, val) rows for one id.
    async fn query_rows(
        &self,
        key: &str,
    ) -> Result<Vec<HashMap<String, AttributeValue>>, BackendError> {
        let output = self
            .client
            .query()
            .table_name(&self.table)
            .key_condition_expression("id = :key")
            .expression_attribute_values(":key", AttributeValue::S(key.to_string()))
            .send()
            .await
            .map_err(dynamo_err)?;
        Ok(output.items.unwrap_or_default())
    }

    fn record_from_rows(rows: &[HashMap<String, AttributeValue>]) -> RecordMap {
        let mut record = RecordMap::new();
        for row in rows {
            if let (Some(AttributeValue::S(sk)), Some(val)) = (row.get("sk"), row.get("val")) {
                if let Some(value) = record_value(val) {
                    record.insert(sk.clone(), value);
                }
            }
        }
        record
    }
}

#[async_trait]
impl Backend for MultiRowDynamo {
    /// Rows for fields absent from the input are left in place, so this is
    /// a merge, not a strict replace.
    async fn put_record(&self, key: &str, fields: &FieldMap) -> Result<(), BackendError> {
        self.update_record(key, fields).await
    }

    async fn update_record(&self, key: &str, fields: &FieldMap) -> Result<(), BackendError> {
        let requests = Self::put_requests(key, fields)?;
        if requests.is_empty() {
            return Ok(());
        }
        self.write_chunked(requests).await
    }

    async fn get_record(&self, key: &str) -> Result<RecordMap, BackendError> {
        let rows = self.query_rows(key).await?;
        Ok(Self::record_from_rows(&rows))
    }

    /// One BatchGetItem over the (id, sk) composite keys.
    async fn get_record_fields(
        &self,
        key: &str,
        names: &[String],
    ) -> Result<RecordMap, BackendError> {
        if names.is_empty() {
            return Ok(RecordMap::new());
        }

        let key_maps: Vec<HashMap<String, AttributeValue>> = names
            .iter()
            .map(|field| {
                let mut map = HashMap::with_capacity(2);
                map.insert("id".to_string(), AttributeValue::S(key.to_string()));
                map.insert("sk".to_string(), AttributeValue::S(field.clone()));
                map
            })
            .collect();

        let output = self
            .client
            .batch_get_item()
            .request_items(
                &self.table,
                KeysAndAttributes::builder()
                    .set_keys(Some(key_maps))
                    .build()
                    .map_err(dynamo_err)?,
            )
            .send()
            .await
            .map_err(dynamo_err)?;

        let mut record = RecordMap::new();
        if let Some(responses) = output.responses.as_ref() {
            if let Some(items) = responses.get(&self.table) {
                record = Self::record_from_rows(items);
            }
        }
        Ok(record)
    }

    /// One Query per key, issued concurrently; results align to input order.
    async fn batch_get_records(&self, keys: &[String]) -> Result<Vec<RecordMap>, BackendError> {
        let queries = keys.iter().map(|key| async move {
            let rows = self.query_rows(key).await?;
            Ok::<RecordMap, BackendError>(Self::record_from_rows(&rows))
        });
        try_join_all(queries).await
    }

    /// One BatchGetItem over keys x columns; tuples are regrouped by id and
    /// re-aligned to input key order. Requested-column order within a record
    /// is not preserved (map semantics).
    async fn batch_get_record_fields(
        &self,
        keys: &[String],
        names: &[String],
    ) -> Result<Vec<RecordMap>, BackendError> {
        if keys.is_empty() || names.is_empty() {
            return Ok(keys.iter().map(|_| RecordMap::new()).collect());
        }

        let mut key_maps = Vec::with_capacity(keys.len() * names.len());
        for key in keys {
            for field in names {
                let mut map = HashMap::with_capacity(2);
                map.insert("id".to_string(), AttributeValue::S(key.clone()));
                map.insert("sk".to_string(), AttributeValue::S(field.clone()));
                key_maps.push(map);
            }
        }

        let output = self
            .client
            .batch_get_item()
            .request_items(
                &self.table,
                KeysAndAttributes::builder()
                    .set_keys(Some(key_maps))
                    .build()
                    .map_err(dynamo_err)?,
            )
            .send()
            .await
            .map_err(dynamo_err)?;

        let mut by_id: HashMap<String, RecordMap> = HashMap::new();
        if let Some(responses) = output.responses.as_ref() {
            if let Some(items) = responses.get(&self.table) {
                for item in items {
                    if let (Some(AttributeValue::S(id)), Some(AttributeValue::S(sk))) =
                        (item.get("id"), item.get("sk"))
                    {
                        if let Some(value) = item.get("val").and_then(record_value) {
                            by_id.entry(id.clone()).or_default().insert(sk.clone(), value);
                        }
                    }
                }
            }
        }

        Ok(keys
            .iter()
            .map(|key| by_id.remove(key).unwrap_or_default())
            .collect())
    }

    async fn batch_put_records(
        &self,
        items: &BTreeMap<String, FieldMap>,
    ) -> Result<(), BackendError> {
        let mut requests = Vec::new();
        for (key, fields) in items {
            requests.extend(Self::put_requests(key, fields)?);
        }
        self.write_chunked(requests).await
    }

    /// Query for the record's rows, then batch-delete them.
    async fn delete_record(&self, key: &str) -> Result<(), BackendError> {
        let rows = self.query_rows(key).await?;
        let mut requests = Vec::with_capacity(rows.len());
        for row in rows {
            if let (Some(id), Some(sk)) = (row.get("id"), row.get("sk")) {
                requests.push(delete_request_for(id.clone(), sk.clone())?);
            }
        }
        if requests.is_empty() {
            return Ok(());
        }
        self.write_chunked(requests).await
    }

    fn name(&self) -> &'static str {
        "dynamodb-multirow"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(n: usize) -> FieldMap {
        (0..n)
            .map(|i| (format!("col{i}"), FieldValue::Len(8)))
            .collect()
    }

    #[test]
    fn one_row_per_field() {
        let requests = MultiRowDynamo::put_requests("k", &fields(3)).unwrap();
        assert_eq!(requests.len(), 3);
        for request in &requests {
            let item = request.put_request().unwrap().item();
            assert!(matches!(item.get("id"), Some(AttributeValue::S(s)) if s == "k"));
            assert!(matches!(item.get("sk"), Some(AttributeValue::S(_))));
            assert!(matches!(item.get("val"), Some(AttributeValue::B(_))));
        }
    }

    #[test]
    fn batch_writes_chunk_at_twenty_five() {
        // 3 records x 20 fields = 60 rows -> chunks of 25, 25, 10
        let mut all = Vec::new();
        for key in ["a", "b", "c"] {
            all.extend(MultiRowDynamo::put_requests(key, &fields(20)).unwrap());
        }
        let chunks: Vec<_> = all.chunks(MAX_BATCH_WRITE).collect();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|chunk| chunk.len() <= MAX_BATCH_WRITE));
        assert_eq!(
            chunks.iter().map(|chunk| chunk.len()).sum::<usize>(),
            60
        );
    }

    #[test]
    fn rows_regroup_into_records() {
        let mut rows = Vec::new();
        for field in ["f1", "f2"] {
            rows.push(MultiRowDynamo::row("k", field, &FieldValue::Text("v".into())));
        }
        let record = MultiRowDynamo::record_from_rows(&rows);
        assert_eq!(record.len(), 2);
        assert!(record.contains_key("f1"));
        assert!(record.contains_key("f2"));
    }
}
