//! Handle to a built heap snapshot.

use serde_json::{Value, json};
use tracing::{debug, error};

use crate::error::{ProxyError, Result};
use crate::protocol::{CallId, ObjectId};
use crate::provider::ProviderProxy;
use crate::remote::{RemoteHandle, RemoteObject};
use crate::types::{
    Aggregates, AggregatesForDiff, AllocationNodeCallers, AllocationStackFrame, Diffs, NodeFilter,
    Samples, SearchConfig, SerializedAllocationNode, StaticData, Statistics,
};

/// A snapshot built by the worker from a closed loader.
///
/// The worker owns the snapshot's lifetime, so this handle has no `dispose` and
/// dropping it sends nothing.
#[derive(Debug)]
pub struct SnapshotProxy {
    object: RemoteObject,
    static_data: Option<StaticData>,
    profile_uid: Option<u64>,
}

impl RemoteHandle for SnapshotProxy {
    fn from_remote(mut object: RemoteObject) -> Self {
        object.mark_worker_owned();
        Self {
            object,
            static_data: None,
            profile_uid: None,
        }
    }
}

impl SnapshotProxy {
    pub fn object_id(&self) -> ObjectId {
        self.object.object_id()
    }

    pub fn uid(&self) -> Option<u64> {
        self.profile_uid
    }

    pub fn set_profile_uid(&mut self, profile_uid: u64) {
        self.profile_uid = Some(profile_uid);
    }

    pub fn static_data(&self) -> Option<&StaticData> {
        self.static_data.as_ref()
    }

    fn loaded(&self) -> Result<&StaticData> {
        self.static_data
            .as_ref()
            .ok_or(ProxyError::StaticDataNotLoaded)
    }

    pub fn node_count(&self) -> Result<u64> {
        Ok(self.loaded()?.node_count)
    }

    pub fn root_node_index(&self) -> Result<u64> {
        Ok(self.loaded()?.root_node_index)
    }

    pub fn total_size(&self) -> Result<u64> {
        Ok(self.loaded()?.total_size)
    }

    pub fn max_js_object_id(&self) -> Result<u64> {
        Ok(self.loaded()?.max_js_object_id)
    }

    /// Fetch static data and hand the snapshot, now populated, to `callback`.
    ///
    /// The snapshot moves into the pending call. If the worker reports a
    /// failure the callback never runs.
    pub fn update_static_data<F>(self, callback: F) -> Result<CallId>
    where
        F: FnOnce(SnapshotProxy) + Send + 'static,
    {
        let shared = self.object.proxy().upgrade()?;
        let object_id = self.object_id();
        let mut snapshot = self;
        shared.call_method(
            object_id,
            "updateStaticData",
            Vec::new(),
            Some(Box::new(move |value| {
                match serde_json::from_value::<StaticData>(value) {
                    Ok(data) => snapshot.static_data = Some(data),
                    Err(err) => {
                        error!(%object_id, error = %err, "Invalid snapshot static data");
                    }
                }
                callback(snapshot);
            })),
        )
    }

    /// Fetch static data in place.
    pub async fn refresh_static_data(&mut self) -> Result<StaticData> {
        let data: StaticData = self
            .object
            .call_method_async("updateStaticData", Vec::new())
            .await?;
        self.static_data = Some(data);
        Ok(data)
    }

    /// Node ids matching `config`.
    pub async fn search(&self, config: &SearchConfig, filter: &NodeFilter) -> Result<Vec<u64>> {
        self.object
            .call_method_async(
                "search",
                vec![serde_json::to_value(config)?, serde_json::to_value(filter)?],
            )
            .await
    }

    pub async fn aggregates_with_filter(&self, filter: &NodeFilter) -> Result<Aggregates> {
        self.object
            .call_method_async("aggregatesWithFilter", vec![serde_json::to_value(filter)?])
            .await
    }

    pub async fn aggregates_for_diff(&self) -> Result<AggregatesForDiff> {
        self.object
            .call_method_async("aggregatesForDiff", Vec::new())
            .await
    }

    /// Diff this snapshot against the aggregates of an earlier one.
    pub async fn calculate_snapshot_diff(
        &self,
        base_snapshot_id: &str,
        base_aggregates: &AggregatesForDiff,
    ) -> Result<Diffs> {
        self.object
            .call_method_async(
                "calculateSnapshotDiff",
                vec![json!(base_snapshot_id), serde_json::to_value(base_aggregates)?],
            )
            .await
    }

    pub async fn node_class_name(&self, snapshot_object_id: u64) -> Result<Option<String>> {
        self.object
            .call_method_async("nodeClassName", vec![json!(snapshot_object_id)])
            .await
    }

    pub async fn get_statistics(&self) -> Result<Statistics> {
        self.object
            .call_method_async("getStatistics", Vec::new())
            .await
    }

    /// Allocation timeline samples; `None` when the profile recorded none.
    pub async fn get_samples(&self) -> Result<Option<Samples>> {
        self.object.call_method_async("getSamples", Vec::new()).await
    }

    pub async fn allocation_traces_tops(&self) -> Result<Vec<SerializedAllocationNode>> {
        self.object
            .call_method_async("allocationTracesTops", Vec::new())
            .await
    }

    pub async fn allocation_node_callers(&self, node_id: u64) -> Result<AllocationNodeCallers> {
        self.object
            .call_method_async("allocationNodeCallers", vec![json!(node_id)])
            .await
    }

    pub async fn allocation_stack(&self, node_index: u64) -> Result<Option<Vec<AllocationStackFrame>>> {
        let frames: Option<Vec<AllocationStackFrame>> = self
            .object
            .call_method_async("allocationStack", vec![json!(node_index)])
            .await?;
        if frames.is_none() {
            debug!(node_index, "no allocation stack recorded for node");
        }
        Ok(frames)
    }

    pub fn create_edges_provider(&self, node_index: u64) -> Result<ProviderProxy> {
        self.object
            .call_factory_method_optimistic("createEdgesProvider", vec![json!(node_index)])
    }

    pub fn create_retaining_edges_provider(&self, node_index: u64) -> Result<ProviderProxy> {
        self.object
            .call_factory_method_optimistic("createRetainingEdgesProvider", vec![json!(node_index)])
    }

    pub fn create_added_nodes_provider(
        &self,
        base_snapshot_id: &str,
        class_name: &str,
    ) -> Result<ProviderProxy> {
        self.object.call_factory_method_optimistic(
            "createAddedNodesProvider",
            vec![json!(base_snapshot_id), json!(class_name)],
        )
    }

    pub fn create_deleted_nodes_provider(&self, node_indexes: &[u64]) -> Result<ProviderProxy> {
        self.object
            .call_factory_method_optimistic("createDeletedNodesProvider", vec![json!(node_indexes)])
    }

    /// Provider over the nodes accepted by `filter`, a predicate the worker
    /// knows how to interpret.
    pub fn create_nodes_provider(&self, filter: Value) -> Result<ProviderProxy> {
        self.object
            .call_factory_method_optimistic("createNodesProvider", vec![filter])
    }

    pub fn create_nodes_provider_for_class(
        &self,
        class_name: &str,
        filter: &NodeFilter,
    ) -> Result<ProviderProxy> {
        self.object.call_factory_method_optimistic(
            "createNodesProviderForClass",
            vec![json!(class_name), serde_json::to_value(filter)?],
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::channel::{WorkerChannel, WorkerEndpoint};
    use crate::config::ProxyConfig;
    use crate::lock;
    use crate::protocol::RequestBody;
    use crate::proxy::{ProxyChannels, WorkerProxy};

    fn snapshot() -> Result<(WorkerProxy, ProxyChannels, WorkerEndpoint, SnapshotProxy)> {
        let (channel, mut endpoint) = WorkerChannel::in_process();
        let (proxy, channels) = WorkerProxy::new(channel, ProxyConfig::default())?;
        let snapshot = SnapshotProxy::from_remote(proxy.create_object("Snapshot")?);
        let _create = endpoint.try_recv();
        Ok((proxy, channels, endpoint, snapshot))
    }

    #[tokio::test]
    async fn accessors_fail_until_static_data_arrives() -> Result<()> {
        let (_proxy, _channels, mut endpoint, mut snapshot) = snapshot()?;
        assert!(matches!(
            snapshot.node_count(),
            Err(ProxyError::StaticDataNotLoaded)
        ));

        let worker = async {
            let request = endpoint.recv().await.ok_or(ProxyError::ChannelClosed)?;
            endpoint.reply(
                request.call_id,
                json!({"nodeCount": 12, "rootNodeIndex": 0, "totalSize": 2048, "maxJSObjectId": 99}),
            )
        };
        let (data, served) = tokio::join!(snapshot.refresh_static_data(), worker);
        served?;

        assert_eq!(data?.node_count, 12);
        assert_eq!(snapshot.node_count()?, 12);
        assert_eq!(snapshot.root_node_index()?, 0);
        assert_eq!(snapshot.total_size()?, 2048);
        assert_eq!(snapshot.max_js_object_id()?, 99);
        Ok(())
    }

    #[tokio::test]
    async fn update_static_data_hands_back_the_populated_snapshot() -> Result<()> {
        let (_proxy, _channels, mut endpoint, mut snapshot) = snapshot()?;
        snapshot.set_profile_uid(7);
        let (tx, rx) = tokio::sync::oneshot::channel();
        snapshot.update_static_data(move |snapshot| {
            let _ = tx.send(snapshot);
        })?;

        let request = endpoint.recv().await.ok_or(ProxyError::ChannelClosed)?;
        assert!(matches!(
            &request.body,
            RequestBody::Method { method_name, .. } if method_name == "updateStaticData"
        ));
        endpoint.reply(
            request.call_id,
            json!({"nodeCount": 3, "rootNodeIndex": 1, "totalSize": 30, "maxJSObjectId": 5}),
        )?;

        let snapshot = rx.await.map_err(|_| ProxyError::CallDropped(request.call_id))?;
        assert_eq!(snapshot.uid(), Some(7));
        assert_eq!(snapshot.total_size()?, 30);
        Ok(())
    }

    #[tokio::test]
    async fn provider_factories_reserve_ids_and_send_arguments() -> Result<()> {
        let (proxy, _channels, mut endpoint, snapshot) = snapshot()?;
        let provider = snapshot.create_nodes_provider_for_class(
            "Array",
            &NodeFilter {
                min_node_id: Some(1),
                ..NodeFilter::default()
            },
        )?;
        assert!(proxy.is_live(provider.object_id()));

        let request = endpoint.recv().await.ok_or(ProxyError::ChannelClosed)?;
        assert_eq!(
            request.body,
            RequestBody::Factory {
                object_id: snapshot.object_id(),
                method_name: "createNodesProviderForClass".to_string(),
                method_arguments: vec![json!("Array"), json!({"minNodeId": 1})],
                new_object_id: provider.object_id(),
            }
        );
        assert!(!proxy.is_pending(request.call_id));
        Ok(())
    }

    #[tokio::test]
    async fn dropping_a_snapshot_sends_nothing() -> Result<()> {
        let (proxy, _channels, mut endpoint, snapshot) = snapshot()?;
        let object_id = snapshot.object_id();
        drop(snapshot);

        assert!(endpoint.try_recv().is_none());
        assert!(proxy.is_live(object_id));
        Ok(())
    }

    #[tokio::test]
    async fn worker_failure_surfaces_as_dropped_call() -> Result<()> {
        let (_proxy, _channels, mut endpoint, snapshot) = snapshot()?;
        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();

        let worker = async {
            let request = endpoint.recv().await.ok_or(ProxyError::ChannelClosed)?;
            *lock(&slot) = Some(request.call_id);
            endpoint.fail(request.call_id, Some("getStatistics"), None)
        };
        let (statistics, served) = tokio::join!(snapshot.get_statistics(), worker);
        served?;

        let call_id = lock(&seen).ok_or(ProxyError::ChannelClosed)?;
        assert!(matches!(
            statistics,
            Err(ProxyError::CallDropped(id)) if id == call_id
        ));
        Ok(())
    }
}
