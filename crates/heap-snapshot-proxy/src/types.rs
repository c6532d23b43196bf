//! Records exchanged with the snapshot worker.
//!
//! The worker owns these shapes. Fields it may omit are optional or defaulted so
//! older workers still decode.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Summary numbers fetched once a snapshot has been built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticData {
    pub node_count: u64,
    pub root_node_index: u64,
    pub total_size: u64,
    #[serde(rename = "maxJSObjectId")]
    pub max_js_object_id: u64,
}

/// Heap size broken down by category, in bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Statistics {
    pub total: f64,
    pub v8heap: f64,
    pub native: f64,
    pub code: f64,
    pub js_arrays: f64,
    pub strings: f64,
    pub system: f64,
}

/// Allocation timeline samples. The three vectors are parallel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Samples {
    pub timestamps: Vec<f64>,
    pub last_assigned_ids: Vec<u64>,
    pub sizes: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchConfig {
    pub query: String,
    pub case_sensitive: bool,
    pub is_regex: bool,
    pub should_jump: bool,
    pub jump_backward: bool,
}

/// Restricts node listings to an id range or to one allocation site.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_node_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_node_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation_node_id: Option<u64>,
}

/// Per-class totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Aggregate {
    pub count: u64,
    pub distance: i64,
    #[serde(rename = "self")]
    pub self_size: u64,
    pub max_ret: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub idxs: Vec<u64>,
}

pub type Aggregates = BTreeMap<String, Aggregate>;

/// Per-class data a later snapshot needs to diff against this one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AggregateForDiff {
    pub indexes: Vec<u64>,
    pub ids: Vec<u64>,
    pub self_sizes: Vec<u64>,
}

pub type AggregatesForDiff = BTreeMap<String, AggregateForDiff>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Diff {
    pub added_count: u64,
    pub removed_count: u64,
    pub added_size: u64,
    pub removed_size: u64,
    pub deleted_indexes: Vec<u64>,
    pub added_indexes: Vec<u64>,
}

pub type Diffs = BTreeMap<String, Diff>;

/// Two-key sort order for a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparatorConfig {
    pub field_name1: String,
    pub ascending1: bool,
    pub field_name2: String,
    pub ascending2: bool,
}

/// One page of serialized provider items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ItemsRange {
    pub start_position: u64,
    pub end_position: u64,
    pub total_length: u64,
    pub items: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SerializedAllocationNode {
    pub id: u64,
    pub name: String,
    pub script_name: String,
    pub script_id: u64,
    pub line: u64,
    pub column: u64,
    pub count: u64,
    pub size: u64,
    pub live_count: u64,
    pub live_size: u64,
    pub has_children: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AllocationNodeCallers {
    pub nodes_with_single_caller: Vec<SerializedAllocationNode>,
    pub branching_callers: Vec<SerializedAllocationNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AllocationStackFrame {
    pub function_name: String,
    pub script_name: String,
    pub script_id: u64,
    pub line: u64,
    pub column: u64,
}
