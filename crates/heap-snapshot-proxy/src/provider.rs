//! Paginated item provider handle.

use serde_json::{Value, json};

use crate::error::Result;
use crate::protocol::ObjectId;
use crate::remote::{RemoteHandle, RemoteObject};
use crate::types::{ComparatorConfig, ItemsRange};

/// Worker-side iterator over nodes or edges, read one page at a time.
#[derive(Debug)]
pub struct ProviderProxy {
    object: RemoteObject,
}

impl RemoteHandle for ProviderProxy {
    fn from_remote(object: RemoteObject) -> Self {
        Self { object }
    }
}

impl ProviderProxy {
    pub fn object_id(&self) -> ObjectId {
        self.object.object_id()
    }

    pub async fn is_empty(&self) -> Result<bool> {
        self.object.call_method_async("isEmpty", Vec::new()).await
    }

    /// Position of the node with `snapshot_object_id` in the current order, or
    /// `-1` when the provider does not contain it.
    pub async fn node_position(&self, snapshot_object_id: u64) -> Result<i64> {
        self.object
            .call_method_async("nodePosition", vec![json!(snapshot_object_id)])
            .await
    }

    pub async fn serialize_items_range(&self, start: u64, end: u64) -> Result<ItemsRange> {
        self.object
            .call_method_async("serializeItemsRange", vec![json!(start), json!(end)])
            .await
    }

    pub async fn sort_and_rewind(&self, comparator: &ComparatorConfig) -> Result<()> {
        let _: Value = self
            .object
            .call_method_async("sortAndRewind", vec![serde_json::to_value(comparator)?])
            .await?;
        Ok(())
    }

    pub fn dispose(self) -> Result<()> {
        self.object.dispose()
    }
}
