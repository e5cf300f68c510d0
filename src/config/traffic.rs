use std::collections::BTreeMap;

use serde::Deserialize;

/// One element of the traffic script. An array element denotes tasks that
/// run concurrently; stages themselves run strictly in sequence.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum Stage {
    Parallel(Vec<Task>),
    Single(Task),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum Action {
    #[serde(rename = "putItem")]
    Put,
    #[serde(rename = "updateItem")]
    Update,
    #[serde(rename = "getItem")]
    Get,
    #[serde(rename = "getSubItem")]
    GetSub,
    #[serde(rename = "deleteItem")]
    Delete,
    #[serde(rename = "batchGetItem")]
    BatchGet,
    #[serde(rename = "batchGetSubItem")]
    BatchGetSub,
    #[serde(rename = "batchPutItem")]
    BatchPut,
}

impl Action {
    /// Batch actions never use the sample cache; `samples` instead sets the
    /// per-job batch size for them.
    pub fn is_batch(&self) -> bool {
        matches!(self, Self::BatchGet | Self::BatchGetSub | Self::BatchPut)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Put => "putItem",
            Self::Update => "updateItem",
            Self::Get => "getItem",
            Self::GetSub => "getSubItem",
            Self::Delete => "deleteItem",
            Self::BatchGet => "batchGetItem",
            Self::BatchGetSub => "batchGetSubItem",
            Self::BatchPut => "batchPutItem",
        }
    }
}

/// A field template entry: either a literal value, or `{r, len}` meaning
/// "append a uniform draw in [0, r) to the base name; the value is a blob of
/// `len` bytes".
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum TemplateValue {
    Random { r: u32, len: u64 },
    Literal(String),
}

/// A single traffic task. The template is a `BTreeMap` so that field
/// expansion consumes auxiliary-stream draws in a stable order and the
/// serialized payload bytes are reproducible.
#[derive(Clone, Debug, Deserialize)]
pub struct Task {
    pub action: Action,
    #[serde(default)]
    pub qps: u64,
    #[serde(default)]
    pub qpss: Vec<f64>,
    #[serde(default)]
    pub times: u64,
    #[serde(default)]
    pub samples: usize,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub seeds: Vec<f64>,
    #[serde(default)]
    pub data: BTreeMap<String, TemplateValue>,
}

impl Task {
    /// Total jobs for this task: explicit `times` wins, else `qps * duration`.
    /// A task with neither emits nothing.
    pub fn total_tasks(&self, run_qps: u64) -> u64 {
        if self.times > 0 {
            self.times
        } else {
            run_qps * self.duration
        }
    }

    /// Batch size for batch-* actions.
    pub fn batch_size(&self) -> usize {
        if self.samples > 0 {
            self.samples
        } else {
            10
        }
    }
}

/// Fills internal zeros of an hourly QPS curve by averaging the nearest
/// non-zero neighbors, repeated to a fixpoint. Endpoints with no non-zero
/// neighbor on either side stay zero; an all-zero curve is unchanged.
pub fn smooth(qpss: &[f64]) -> Vec<f64> {
    let mut result = qpss.to_vec();

    loop {
        let mut changed = false;
        for i in 0..result.len() {
            if result[i] != 0.0 {
                continue;
            }

            let left_val = result[..i].iter().rev().find(|v| **v != 0.0).copied();
            let right_val = result[i + 1..].iter().find(|v| **v != 0.0).copied();

            if left_val.is_some() || right_val.is_some() {
                result[i] = (left_val.unwrap_or(0.0) + right_val.unwrap_or(0.0)) / 2.0;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    result
}
