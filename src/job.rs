use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Sample payloads carry this id in place of a real key; the publisher
/// records its byte offset and overwrites the region per emission.
pub const PLACEHOLDER_ID: &str = "ABCDEF0123456789ABCDEF0123456789";

/// A job field value on the wire: either a byte-count hint (the backend
/// materializes a blob of that size) or a literal string.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Len(u64),
    Text(String),
}

/// Expanded field map. `BTreeMap` keeps serialization byte-stable.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// A queued job, discriminated by `action`. The per-action required fields
/// are the variant fields; anything else is a decode error.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Job {
    #[serde(rename = "putItem")]
    Put { key: String, data: FieldMap },
    #[serde(rename = "updateItem")]
    Update { key: String, data: FieldMap },
    #[serde(rename = "getItem")]
    Get { key: String },
    #[serde(rename = "getSubItem")]
    GetSub { key: String, data: FieldMap },
    #[serde(rename = "deleteItem")]
    Delete { key: String },
    #[serde(rename = "batchGetItem")]
    BatchGet { items: Vec<String> },
    #[serde(rename = "batchGetSubItem")]
    BatchGetSub { items: Vec<String>, data: FieldMap },
    #[serde(rename = "batchPutItem")]
    BatchPut { items: BTreeMap<String, FieldMap> },
}

impl Job {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("job payloads always serialize")
    }

    pub fn decode(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

/// Byte offset of the placeholder id within a serialized sample payload.
pub fn placeholder_offset(payload: &[u8]) -> Option<usize> {
    payload
        .windows(PLACEHOLDER_ID.len())
        .position(|window| window == PLACEHOLDER_ID.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(entries: &[(&str, FieldValue)]) -> FieldMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn put_roundtrip() {
        let job = Job::Put {
            key: "00".repeat(16),
            data: fields(&[
                ("col2", FieldValue::Len(100)),
                ("name", FieldValue::Text("fixed".into())),
            ]),
        };
        let encoded = job.encode();
        let text = String::from_utf8(encoded.clone()).unwrap();
        assert!(text.starts_with(r#"{"action":"putItem""#));

        match Job::decode(&encoded).unwrap() {
            Job::Put { key, data } => {
                assert_eq!(key.len(), 32);
                assert_eq!(data.get("col2"), Some(&FieldValue::Len(100)));
                assert_eq!(
                    data.get("name"),
                    Some(&FieldValue::Text("fixed".into()))
                );
            }
            other => panic!("decoded wrong variant: {other:?}"),
        }
    }

    #[test]
    fn batch_get_roundtrip() {
        let job = Job::BatchGet {
            items: vec!["a".repeat(32), "b".repeat(32)],
        };
        match Job::decode(&job.encode()).unwrap() {
            Job::BatchGet { items } => assert_eq!(items.len(), 2),
            other => panic!("decoded wrong variant: {other:?}"),
        }
    }

    #[test]
    fn batch_put_roundtrip() {
        let mut items = BTreeMap::new();
        items.insert("k".repeat(32), fields(&[("col0", FieldValue::Len(8))]));
        let job = Job::BatchPut { items };
        match Job::decode(&job.encode()).unwrap() {
            Job::BatchPut { items } => {
                assert_eq!(items.len(), 1);
                let data = items.values().next().unwrap();
                assert_eq!(data.get("col0"), Some(&FieldValue::Len(8)));
            }
            other => panic!("decoded wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_action_is_a_decode_error() {
        assert!(Job::decode(br#"{"action":"scanTable","key":"x"}"#).is_err());
    }

    #[test]
    fn missing_required_field_is_a_decode_error() {
        // putItem without data
        assert!(Job::decode(br#"{"action":"putItem","key":"x"}"#).is_err());
        // getItem without key
        assert!(Job::decode(br#"{"action":"getItem"}"#).is_err());
    }

    #[test]
    fn placeholder_offset_is_found() {
        let job = Job::Get {
            key: PLACEHOLDER_ID.to_string(),
        };
        let encoded = job.encode();
        let offset = placeholder_offset(&encoded).unwrap();
        assert_eq!(
            &encoded[offset..offset + 32],
            PLACEHOLDER_ID.as_bytes()
        );
    }

    #[test]
    fn serialization_is_byte_stable() {
        let build = || Job::Update {
            key: "c".repeat(32),
            data: fields(&[
                ("z", FieldValue::Len(1)),
                ("a", FieldValue::Len(2)),
                ("m", FieldValue::Text("v".into())),
            ]),
        };
        assert_eq!(build().encode(), build().encode());
    }
}
