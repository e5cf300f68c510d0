use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::config::Region;
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::{
    AttributeValue, DeleteRequest, KeysAndAttributes, PutRequest, WriteRequest,
};
use aws_sdk_dynamodb::Client;
use aws_smithy_types::timeout::TimeoutConfig;

use super::{dynamo_err, materialize, Backend, BackendError, MaterializedValue, RecordMap,
    RecordValue};
use crate::config::Config;
use crate::job::{FieldMap, FieldValue};

/// DynamoDB caps BatchWriteItem at 25 requests; all batch writes are
/// chunked transparently at this bound.
pub(crate) const MAX_BATCH_WRITE: usize = 25;

pub(crate) async fn client(config: &Config) -> Result<Client, BackendError> {
    let sdk_config = aws_config::defaults(BehaviorVersion::latest()).load().await;

    let builder = aws_sdk_dynamodb::config::Builder::from(&sdk_config)
        .region(Region::new(config.region().to_string()))
        .retry_config(RetryConfig::standard().with_max_attempts(2))
        .timeout_config(
            TimeoutConfig::builder()
                .operation_timeout(Duration::from_secs(30))
                .build(),
        );

    Ok(Client::from_conf(builder.build()))
}

pub(crate) fn to_attribute(value: &FieldValue) -> AttributeValue {
    match materialize(value) {
        MaterializedValue::Text(text) => AttributeValue::S(text),
        MaterializedValue::Bytes(bytes) => AttributeValue::B(Blob::new(bytes.to_vec())),
    }
}

pub(crate) fn record_value(attr: &AttributeValue) -> Option<RecordValue> {
    match attr {
        AttributeValue::S(s) => Some(RecordValue::Text(s.clone())),
        AttributeValue::B(b) => Some(RecordValue::Bytes(b.as_ref().to_vec())),
        AttributeValue::N(n) => Some(RecordValue::Number(n.clone())),
        _ => None,
    }
}

fn record_from_item(item: &HashMap<String, AttributeValue>) -> RecordMap {
    let mut record = RecordMap::new();
    for (name, attr) in item {
        if name == "id" {
            continue;
        }
        if let Some(value) = record_value(attr) {
            record.insert(name.clone(), value);
        }
    }
    record
}

/// One item per record, keyed by `id`. Writes replace the whole item; reads
/// project requested attributes.
pub struct SingleRowDynamo {
    client: Client,
    table: String,
}

impl SingleRowDynamo {
    pub async fn new(config: &Config) -> Result<Self, BackendError> {
        Ok(Self {
            client: client(config).await?,
            table: config.table_name().to_string(),
        })
    }

    fn key_attr(key: &str) -> AttributeValue {
        AttributeValue::S(key.to_string())
    }
}

#[async_trait]
impl Backend for SingleRowDynamo {
    async fn put_record(&self, key: &str, fields: &FieldMap) -> Result<(), BackendError> {
        let mut request = self
            .client
            .put_item()
            .table_name(&self.table)
            .item("id", Self::key_attr(key));
        for (name, value) in fields {
            request = request.item(name, to_attribute(value));
        }
        request.send().await.map_err(dynamo_err)?;
        Ok(())
    }

    async fn update_record(&self, key: &str, fields: &FieldMap) -> Result<(), BackendError> {
        if fields.is_empty() {
            return Ok(());
        }

        let mut expression = String::from("SET ");
        let mut request = self
            .client
            .update_item()
            .table_name(&self.table)
            .key("id", Self::key_attr(key));
        for (idx, (name, value)) in fields.iter().enumerate() {
            if idx > 0 {
                expression.push_str(", ");
            }
            expression.push_str(&format!("#n{idx} = :val{idx}"));
            request = request
                .expression_attribute_names(format!("#n{idx}"), name)
                .expression_attribute_values(format!(":val{idx}"), to_attribute(value));
        }
        request
            .update_expression(expression)
            .send()
            .await
            .map_err(dynamo_err)?;
        Ok(())
    }

    async fn get_record(&self, key: &str) -> Result<RecordMap, BackendError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("id", Self::key_attr(key))
            .send()
            .await
            .map_err(dynamo_err)?;
        Ok(output
            .item
            .as_ref()
            .map(record_from_item)
            .unwrap_or_default())
    }

    async fn get_record_fields(
        &self,
        key: &str,
        names: &[String],
    ) -> Result<RecordMap, BackendError> {
        let mut request = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("id", Self::key_attr(key));
        let mut projection = Vec::with_capacity(names.len());
        for (idx, name) in names.iter().enumerate() {
            projection.push(format!("#c{idx}"));
            request = request.expression_attribute_names(format!("#c{idx}"), name);
        }
        let output = request
            .projection_expression(projection.join(", "))
            .send()
            .await
            .map_err(dynamo_err)?;
        Ok(output
            .item
            .as_ref()
            .map(record_from_item)
            .unwrap_or_default())
    }

    async fn batch_get_records(&self, keys: &[String]) -> Result<Vec<RecordMap>, BackendError> {
        self.batch_get(keys, None).await
    }

    async fn batch_get_record_fields(
        &self,
        keys: &[String],
        names: &[String],
    ) -> Result<Vec<RecordMap>, BackendError> {
        self.batch_get(keys, Some(names)).await
    }

    async fn batch_put_records(
        &self,
        items: &BTreeMap<String, FieldMap>,
    ) -> Result<(), BackendError> {
        let mut requests = Vec::with_capacity(items.len());
        for (key, fields) in items {
            let mut item = HashMap::with_capacity(fields.len() + 1);
            item.insert("id".to_string(), Self::key_attr(key));
            for (name, value) in fields {
                item.insert(name.clone(), to_attribute(value));
            }
            let put = PutRequest::builder()
                .set_item(Some(item))
                .build()
                .map_err(dynamo_err)?;
            requests.push(WriteRequest::builder().put_request(put).build());
        }

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

    async fn delete_record(&self, key: &str) -> Result<(), BackendError> {
        self.client
            .delete_item()
            .table_name(&self.table)
            .key("id", Self::key_attr(key))
            .send()
            .await
            .map_err(dynamo_err)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "dynamodb"
    }
}

impl SingleRowDynamo {
    /// Shared body for the two batch reads: one BatchGetItem, then results
    /// re-aligned to input key order with empty maps for misses.
    async fn batch_get(
        &self,
        keys: &[String],
        names: Option<&[String]>,
    ) -> Result<Vec<RecordMap>, BackendError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let key_maps: Vec<HashMap<String, AttributeValue>> = keys
            .iter()
            .map(|key| {
                let mut map = HashMap::with_capacity(1);
                map.insert("id".to_string(), Self::key_attr(key));
                map
            })
            .collect();

        let mut attrs = KeysAndAttributes::builder().set_keys(Some(key_maps));
        if let Some(names) = names {
            let mut projection = Vec::with_capacity(names.len());
            for (idx, name) in names.iter().enumerate() {
                projection.push(format!("#c{idx}"));
                attrs = attrs.expression_attribute_names(format!("#c{idx}"), name);
            }
            attrs = attrs.projection_expression(projection.join(", "));
        }

        let output = self
            .client
            .batch_get_item()
            .request_items(&self.table, attrs.build().map_err(dynamo_err)?)
            .send()
            .await
            .map_err(dynamo_err)?;

        let mut found: HashMap<String, RecordMap> = HashMap::new();
        if let Some(responses) = output.responses.as_ref() {
            if let Some(items) = responses.get(&self.table) {
                for item in items {
                    if let Some(AttributeValue::S(id)) = item.get("id") {
                        found.insert(id.clone(), record_from_item(item));
                    }
                }
            }
        }

        Ok(keys
            .iter()
            .map(|key| found.remove(key).unwrap_or_default())
            .collect())
    }
}

/// Builds a delete WriteRequest for a composite (id, sk) row.
pub(crate) fn delete_request_for(
    id: AttributeValue,
    sk: AttributeValue,
) -> Result<WriteRequest, BackendError> {
    let mut key = HashMap::with_capacity(2);
    key.insert("id".to_string(), id);
    key.insert("sk".to_string(), sk);
    let delete = DeleteRequest::builder()
        .set_key(Some(key))
        .build()
        .map_err(dynamo_err)?;
    Ok(WriteRequest::builder().delete_request(delete).build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_mapping() {
        match to_attribute(&FieldValue::Text("v".into())) {
            AttributeValue::S(s) => assert_eq!(s, "v"),
            other => panic!("expected S, got {other:?}"),
        }
        match to_attribute(&FieldValue::Len(100)) {
            AttributeValue::B(b) => assert_eq!(b.as_ref().len(), 100),
            other => panic!("expected B, got {other:?}"),
        }
    }

    #[test]
    fn record_from_item_skips_primary_key() {
        let mut item = HashMap::new();
        item.insert("id".to_string(), AttributeValue::S("k".into()));
        item.insert("col0".to_string(), AttributeValue::S("v".into()));
        item.insert("n".to_string(), AttributeValue::N("42".into()));
        let record = record_from_item(&item);
        assert_eq!(record.len(), 2);
        assert_eq!(record.get("col0"), Some(&RecordValue::Text("v".into())));
        assert_eq!(record.get("n"), Some(&RecordValue::Number("42".into())));
    }
}
