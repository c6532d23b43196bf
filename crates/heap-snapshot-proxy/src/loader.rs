//! Streaming snapshot loader.

use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::error::{ProxyError, Result};
use crate::protocol::{CallId, ObjectId};
use crate::proxy::typed_factory_callback;
use crate::registry::PendingCall;
use crate::remote::RemoteObject;
use crate::snapshot::SnapshotProxy;

pub type SnapshotCallback = Box<dyn FnOnce(SnapshotProxy) + Send + 'static>;
pub type ClosedCallback = Box<dyn FnOnce() + Send + 'static>;

/// Accepts serialized snapshot text in chunks and, once closed, turns into a
/// [`SnapshotProxy`].
///
/// `close` consumes the loader, so no chunk can be written after it.
pub struct LoaderProxy {
    object: RemoteObject,
    profile_uid: u64,
    on_snapshot: SnapshotCallback,
}

impl LoaderProxy {
    pub(crate) fn new(object: RemoteObject, profile_uid: u64, on_snapshot: SnapshotCallback) -> Self {
        Self {
            object,
            profile_uid,
            on_snapshot,
        }
    }

    pub fn object_id(&self) -> ObjectId {
        self.object.object_id()
    }

    pub fn profile_uid(&self) -> u64 {
        self.profile_uid
    }

    pub fn write(&self, chunk: &str, callback: Option<PendingCall>) -> Result<CallId> {
        self.object.call_method("write", vec![json!(chunk)], callback)
    }

    /// Write a chunk and wait for the worker to accept it.
    pub async fn write_async(&self, chunk: &str) -> Result<()> {
        let _: Value = self
            .object
            .call_method_async("write", vec![json!(chunk)])
            .await?;
        Ok(())
    }

    /// Terminate the worker this loader streams into.
    pub fn dispose_worker(&self) -> Result<()> {
        self.object.dispose_worker()
    }

    /// Finish the stream.
    ///
    /// Once the worker acknowledges, `on_closed` runs and the worker is asked to
    /// build the snapshot. When it is built the loader is disposed, the snapshot
    /// gets this loader's profile uid and its static data, and it is handed to
    /// the callback given at creation.
    pub fn close(self, on_closed: Option<ClosedCallback>) -> Result<CallId> {
        let Self {
            object,
            profile_uid,
            on_snapshot,
        } = self;
        let shared = object.proxy().upgrade()?;
        let loader_id = object.object_id();

        shared.call_method(
            loader_id,
            "close",
            Vec::new(),
            Some(Box::new(move |_| {
                if let Some(on_closed) = on_closed {
                    on_closed();
                }
                build_snapshot(object, profile_uid, on_snapshot);
            })),
        )
    }

    /// Close and wait for the acknowledgment only. The snapshot still arrives
    /// through the creation callback.
    pub async fn close_async(self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let call_id = self.close(Some(Box::new(move || {
            let _ = tx.send(());
        })))?;
        rx.await.map_err(|_| ProxyError::CallDropped(call_id))
    }
}

fn build_snapshot(loader: RemoteObject, profile_uid: u64, on_snapshot: SnapshotCallback) {
    let loader_id = loader.object_id();
    let shared = match loader.proxy().upgrade() {
        Ok(shared) => shared,
        Err(err) => {
            debug!(object_id = %loader_id, error = %err, "loader closed after its proxy went away");
            return;
        }
    };

    let result = shared.call_factory(
        loader_id,
        "buildSnapshot",
        Vec::new(),
        Some(typed_factory_callback(
            move |snapshot: Option<SnapshotProxy>| {
                if let Err(err) = loader.dispose() {
                    debug!(object_id = %loader_id, error = %err, "loader disposal failed");
                }
                let Some(mut snapshot) = snapshot else {
                    error!(object_id = %loader_id, "Worker built no snapshot");
                    return;
                };
                snapshot.set_profile_uid(profile_uid);
                if let Err(err) = snapshot.update_static_data(on_snapshot) {
                    error!(error = %err, "Snapshot static data request failed");
                }
            },
        )),
    );
    if let Err(err) = result {
        error!(object_id = %loader_id, error = %err, "buildSnapshot request failed");
    }
}

impl std::fmt::Debug for LoaderProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderProxy")
            .field("object", &self.object)
            .field("profile_uid", &self.profile_uid)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::channel::WorkerChannel;
    use crate::config::ProxyConfig;
    use crate::lock;
    use crate::protocol::RequestBody;
    use crate::proxy::{HEAP_SNAPSHOT_LOADER_TYPE, WorkerProxy};

    fn method_name(body: &RequestBody) -> &str {
        match body {
            RequestBody::Method { method_name, .. }
            | RequestBody::Factory { method_name, .. }
            | RequestBody::Create { method_name, .. } => method_name,
            RequestBody::Dispose { .. } => "<dispose>",
            RequestBody::EvaluateForTest { .. } => "<evaluate>",
        }
    }

    #[tokio::test]
    async fn close_runs_the_full_conversion_chain_in_order() -> Result<()> {
        let (channel, mut endpoint) = WorkerChannel::in_process();
        let (proxy, _channels) = WorkerProxy::new(channel, ProxyConfig::default())?;
        let steps = Arc::new(Mutex::new(Vec::new()));

        let (snapshot_tx, snapshot_rx) = oneshot::channel();
        let loader = proxy.create_loader(42, move |snapshot| {
            let _ = snapshot_tx.send(snapshot);
        })?;
        let loader_id = loader.object_id();

        let create = endpoint.recv().await.ok_or(ProxyError::ChannelClosed)?;
        assert_eq!(method_name(&create.body), HEAP_SNAPSHOT_LOADER_TYPE);

        let closed_steps = steps.clone();
        let close_id = loader.close(Some(Box::new(move || {
            lock(&closed_steps).push("closed");
        })))?;

        let close = endpoint.recv().await.ok_or(ProxyError::ChannelClosed)?;
        assert_eq!(close.call_id, close_id);
        assert_eq!(method_name(&close.body), "close");
        endpoint.reply(close.call_id, Value::Null)?;

        let build = endpoint.recv().await.ok_or(ProxyError::ChannelClosed)?;
        let RequestBody::Factory {
            object_id,
            new_object_id,
            method_name: ref factory_method,
            ..
        } = build.body
        else {
            return Err(ProxyError::Protocol("expected factory request".to_string()));
        };
        assert_eq!(object_id, loader_id);
        assert_eq!(factory_method, "buildSnapshot");
        assert_eq!(*lock(&steps), vec!["closed"]);
        endpoint.reply(build.call_id, json!(true))?;

        let dispose = endpoint.recv().await.ok_or(ProxyError::ChannelClosed)?;
        assert_eq!(dispose.body, RequestBody::Dispose { object_id: loader_id });

        let update = endpoint.recv().await.ok_or(ProxyError::ChannelClosed)?;
        assert!(matches!(
            &update.body,
            RequestBody::Method { object_id, method_name, .. }
                if *object_id == new_object_id && method_name == "updateStaticData"
        ));
        endpoint.reply(
            update.call_id,
            json!({"nodeCount": 4, "rootNodeIndex": 0, "totalSize": 400, "maxJSObjectId": 8}),
        )?;

        let snapshot = snapshot_rx
            .await
            .map_err(|_| ProxyError::CallDropped(update.call_id))?;
        assert_eq!(snapshot.object_id(), new_object_id);
        assert_eq!(snapshot.uid(), Some(42));
        assert_eq!(snapshot.node_count()?, 4);
        assert!(!proxy.is_live(loader_id));
        Ok(())
    }

    #[tokio::test]
    async fn write_async_waits_for_the_acknowledgment() -> Result<()> {
        let (channel, mut endpoint) = WorkerChannel::in_process();
        let (proxy, _channels) = WorkerProxy::new(channel, ProxyConfig::default())?;
        let loader = proxy.create_loader(1, |_| {})?;
        assert_eq!(loader.profile_uid(), 1);

        let worker = async {
            let _create = endpoint.recv().await;
            let write = endpoint.recv().await.ok_or(ProxyError::ChannelClosed)?;
            assert!(matches!(
                &write.body,
                RequestBody::Method { method_arguments, .. } if method_arguments == &vec![json!("{\"snapshot\":")]
            ));
            endpoint.reply(write.call_id, Value::Null)
        };
        let (written, served) = tokio::join!(loader.write_async("{\"snapshot\":"), worker);
        served?;
        written
    }

    #[tokio::test]
    async fn close_async_resolves_on_acknowledgment() -> Result<()> {
        let (channel, mut endpoint) = WorkerChannel::in_process();
        let (proxy, _channels) = WorkerProxy::new(channel, ProxyConfig::default())?;
        let loader = proxy.create_loader(1, |_| {})?;

        let worker = async {
            let _create = endpoint.recv().await;
            let close = endpoint.recv().await.ok_or(ProxyError::ChannelClosed)?;
            endpoint.reply(close.call_id, Value::Null)?;
            endpoint.recv().await.ok_or(ProxyError::ChannelClosed)
        };
        let (closed, build) = tokio::join!(loader.close_async(), worker);
        closed?;
        assert_eq!(method_name(&build?.body), "buildSnapshot");
        Ok(())
    }

    #[tokio::test]
    async fn dispose_worker_abandons_the_stream() -> Result<()> {
        let (channel, mut endpoint) = WorkerChannel::in_process();
        let (proxy, _channels) = WorkerProxy::new(channel, ProxyConfig::default())?;
        let loader = proxy.create_loader(7, |_| {})?;

        loader.dispose_worker()?;
        assert!(proxy.is_disposed());
        assert!(matches!(
            loader.write("{}", None),
            Err(ProxyError::WorkerDisposed)
        ));
        assert!(matches!(loader.close(None), Err(ProxyError::WorkerDisposed)));

        let _create = endpoint.recv().await;
        assert!(endpoint.recv().await.is_none());
        Ok(())
    }
}
