//! Client-side handles to worker-resident objects.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error};

use crate::error::{ProxyError, Result};
use crate::proxy::{WorkerProxyRef, await_handle, await_result, typed_factory_callback};
use crate::protocol::{CallId, ObjectId};
use crate::registry::PendingCall;

/// A type that can wrap a freshly created [`RemoteObject`].
///
/// Factory calls pick the handle type through this trait at compile time.
pub trait RemoteHandle: Send + Sized + 'static {
    fn from_remote(object: RemoteObject) -> Self;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Live,
    Disposed,
    /// Freed by its owner on the worker side; never disposed from here.
    WorkerOwned,
}

/// Handle to an object living in the worker.
///
/// Every call carries this handle's object id. Dropping a live handle sends a
/// disposal request so the worker can free the object.
pub struct RemoteObject {
    proxy: WorkerProxyRef,
    object_id: ObjectId,
    state: HandleState,
}

impl RemoteHandle for RemoteObject {
    fn from_remote(object: RemoteObject) -> Self {
        object
    }
}

impl RemoteObject {
    pub(crate) fn new(proxy: WorkerProxyRef, object_id: ObjectId) -> Self {
        Self {
            proxy,
            object_id,
            state: HandleState::Live,
        }
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub(crate) fn mark_worker_owned(&mut self) {
        self.state = HandleState::WorkerOwned;
    }

    pub(crate) fn proxy(&self) -> &WorkerProxyRef {
        &self.proxy
    }

    pub fn call_method(
        &self,
        method_name: &str,
        arguments: Vec<Value>,
        callback: Option<PendingCall>,
    ) -> Result<CallId> {
        self.proxy
            .upgrade()?
            .call_method(self.object_id, method_name, arguments, callback)
    }

    /// Call `method_name` and wait for its result.
    ///
    /// A worker-side failure drops the pending call, which surfaces here as
    /// [`ProxyError::CallDropped`]. Without any response the future never
    /// resolves.
    pub async fn call_method_async<R>(&self, method_name: &str, arguments: Vec<Value>) -> Result<R>
    where
        R: DeserializeOwned,
    {
        let (call_id, rx) =
            self.proxy
                .upgrade()?
                .call_method_receiver(self.object_id, method_name, arguments)?;
        await_result(call_id, rx).await
    }

    pub fn call_factory_method<H, F>(
        &self,
        method_name: &str,
        arguments: Vec<Value>,
        callback: F,
    ) -> Result<CallId>
    where
        H: RemoteHandle,
        F: FnOnce(Option<H>) + Send + 'static,
    {
        let (call_id, _) = self.proxy.upgrade()?.call_factory(
            self.object_id,
            method_name,
            arguments,
            Some(typed_factory_callback(callback)),
        )?;
        Ok(call_id)
    }

    pub fn call_factory_method_optimistic<H>(
        &self,
        method_name: &str,
        arguments: Vec<Value>,
    ) -> Result<H>
    where
        H: RemoteHandle,
    {
        let (_, new_object_id) =
            self.proxy
                .upgrade()?
                .call_factory(self.object_id, method_name, arguments, None)?;
        Ok(H::from_remote(RemoteObject::new(
            self.proxy.clone(),
            new_object_id,
        )))
    }

    pub async fn call_factory_method_async<H>(
        &self,
        method_name: &str,
        arguments: Vec<Value>,
    ) -> Result<Option<H>>
    where
        H: RemoteHandle,
    {
        let (call_id, rx) =
            self.proxy
                .upgrade()?
                .call_factory_receiver(self.object_id, method_name, arguments)?;
        await_handle(call_id, rx).await
    }

    /// Ask the worker to free this object.
    pub fn dispose(mut self) -> Result<()> {
        self.release()
    }

    /// Tear down the whole worker channel, not just this object.
    pub fn dispose_worker(&self) -> Result<()> {
        self.proxy.upgrade()?.dispose();
        Ok(())
    }

    pub(crate) fn release(&mut self) -> Result<()> {
        let state = std::mem::replace(&mut self.state, HandleState::Disposed);
        match state {
            HandleState::Live => self.proxy.upgrade()?.dispose_object(self.object_id),
            HandleState::Disposed => Err(ProxyError::ObjectDisposed(self.object_id)),
            HandleState::WorkerOwned => {
                error!(object_id = %self.object_id, "direct disposal of a worker-owned object");
                self.state = HandleState::WorkerOwned;
                Err(ProxyError::DisposalForbidden(self.object_id))
            }
        }
    }
}

impl Drop for RemoteObject {
    fn drop(&mut self) {
        if self.state != HandleState::Live {
            return;
        }
        self.state = HandleState::Disposed;
        let Ok(shared) = self.proxy.upgrade() else {
            return;
        };
        if shared.is_disposed() {
            return;
        }
        if let Err(err) = shared.dispose_object(self.object_id) {
            debug!(object_id = %self.object_id, error = %err, "remote object release on drop failed");
        }
    }
}

impl std::fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteObject")
            .field("object_id", &self.object_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
