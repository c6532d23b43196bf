//! Client-side endpoint of the worker RPC protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, trace, warn};

use crate::channel::WorkerChannel;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::loader::LoaderProxy;
use crate::lock;
use crate::monitor::LongRunningCallMonitor;
use crate::protocol::{
    CallId, ObjectId, RequestBody, WorkerEvent, WorkerRequest, WorkerResponse, is_truthy,
};
use crate::registry::{CallRegistry, PendingCall};
use crate::remote::{RemoteHandle, RemoteObject};
use crate::snapshot::SnapshotProxy;

/// Worker-side type instantiated for every snapshot loader.
pub const HEAP_SNAPSHOT_LOADER_TYPE: &str = "HeapSnapshotWorker.HeapSnapshotLoader";

type FactoryCallback = Box<dyn FnOnce(Option<RemoteObject>) + Send + 'static>;

/// Receivers handed out alongside a new [`WorkerProxy`].
pub struct ProxyChannels {
    /// Unsolicited worker events.
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
    /// Long-running-call verdict, republished on every monitor tick.
    pub waiting: watch::Receiver<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    Event,
    EventUnheard,
    Failed,
    Delivered,
    Orphaned,
}

pub(crate) struct ProxyShared {
    channel: WorkerChannel,
    registry: Mutex<CallRegistry>,
    monitor: Mutex<LongRunningCallMonitor>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    waiting: watch::Sender<bool>,
    runtime: tokio::runtime::Handle,
    config: ProxyConfig,
    disposed: AtomicBool,
}

/// Owns the channel to one worker and every call in flight on it.
///
/// Remote object handles keep only a weak reference back to the proxy. Dropping
/// the proxy disposes it.
pub struct WorkerProxy {
    shared: Arc<ProxyShared>,
}

impl WorkerProxy {
    /// Take over `channel` and start delivering its inbound messages.
    pub fn new(channel: WorkerChannel, config: ProxyConfig) -> Result<(Self, ProxyChannels)> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ProxyError::NoRuntime)?;
        let inbound = channel.take_inbound()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (waiting_tx, waiting_rx) = watch::channel(false);

        let shared = Arc::new(ProxyShared {
            channel,
            registry: Mutex::new(CallRegistry::new()),
            monitor: Mutex::new(LongRunningCallMonitor::new()),
            monitor_task: Mutex::new(None),
            dispatch_task: Mutex::new(None),
            events: events_tx,
            waiting: waiting_tx,
            runtime: runtime.clone(),
            config,
            disposed: AtomicBool::new(false),
        });

        let task = runtime.spawn(dispatch_loop(Arc::downgrade(&shared), inbound));
        *lock(&shared.dispatch_task) = Some(task);

        Ok((
            Self { shared },
            ProxyChannels {
                events: events_rx,
                waiting: waiting_rx,
            },
        ))
    }

    /// Instantiate a worker-side object of type `type_name`.
    ///
    /// Construction is fire-and-forget: the handle is returned before the worker
    /// has seen the request.
    pub fn create_object(&self, type_name: &str) -> Result<RemoteObject> {
        let object_id = self.shared.create_object(type_name)?;
        Ok(RemoteObject::new(WorkerProxyRef::new(&self.shared), object_id))
    }

    /// Create a snapshot loader. `on_snapshot` receives the finished snapshot
    /// once the loader has been closed and converted.
    pub fn create_loader<F>(&self, profile_uid: u64, on_snapshot: F) -> Result<LoaderProxy>
    where
        F: FnOnce(SnapshotProxy) + Send + 'static,
    {
        let object = self.create_object(HEAP_SNAPSHOT_LOADER_TYPE)?;
        Ok(LoaderProxy::new(object, profile_uid, Box::new(on_snapshot)))
    }

    pub fn dispose_object(&self, object_id: ObjectId) -> Result<()> {
        self.shared.dispose_object(object_id)
    }

    /// Invoke `method_name` on a worker object. Without a callback the call is
    /// still sent but its result is discarded on arrival.
    pub fn call_method(
        &self,
        object_id: ObjectId,
        method_name: &str,
        arguments: Vec<Value>,
        callback: Option<PendingCall>,
    ) -> Result<CallId> {
        self.shared
            .call_method(object_id, method_name, arguments, callback)
    }

    pub async fn call_method_async<R>(
        &self,
        object_id: ObjectId,
        method_name: &str,
        arguments: Vec<Value>,
    ) -> Result<R>
    where
        R: DeserializeOwned,
    {
        let (call_id, rx) = self
            .shared
            .call_method_receiver(object_id, method_name, arguments)?;
        await_result(call_id, rx).await
    }

    /// Invoke a factory method. `callback` gets a handle bound to the object id
    /// reserved for this call, or `None` if the worker produced nothing.
    pub fn call_factory_method<H, F>(
        &self,
        object_id: ObjectId,
        method_name: &str,
        arguments: Vec<Value>,
        callback: F,
    ) -> Result<CallId>
    where
        H: RemoteHandle,
        F: FnOnce(Option<H>) + Send + 'static,
    {
        let (call_id, _) = self.shared.call_factory(
            object_id,
            method_name,
            arguments,
            Some(typed_factory_callback(callback)),
        )?;
        Ok(call_id)
    }

    /// Invoke a factory method and return the new handle without waiting.
    ///
    /// Requests are delivered in order, so calls queued on the handle reach the
    /// worker after the object exists.
    pub fn call_factory_method_optimistic<H>(
        &self,
        object_id: ObjectId,
        method_name: &str,
        arguments: Vec<Value>,
    ) -> Result<H>
    where
        H: RemoteHandle,
    {
        let (_, new_object_id) = self
            .shared
            .call_factory(object_id, method_name, arguments, None)?;
        Ok(H::from_remote(RemoteObject::new(
            WorkerProxyRef::new(&self.shared),
            new_object_id,
        )))
    }

    pub async fn call_factory_method_async<H>(
        &self,
        object_id: ObjectId,
        method_name: &str,
        arguments: Vec<Value>,
    ) -> Result<Option<H>>
    where
        H: RemoteHandle,
    {
        let (call_id, rx) = self
            .shared
            .call_factory_receiver(object_id, method_name, arguments)?;
        await_handle(call_id, rx).await
    }

    /// Diagnostic entry point: evaluate `script` inside the worker.
    pub fn evaluate_for_test(&self, script: &str, callback: PendingCall) -> Result<CallId> {
        self.shared.evaluate_for_test(script, Some(callback))
    }

    pub async fn evaluate_for_test_async(&self, script: &str) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        let call_id = self.shared.evaluate_for_test(
            script,
            Some(Box::new(move |value| {
                let _ = tx.send(value);
            })),
        )?;
        await_result(call_id, rx).await
    }

    /// Arm the long-running-call monitor. Calling it again is a no-op.
    pub fn start_checking_for_long_running_calls(&self) -> Result<()> {
        self.shared.start_checking_for_long_running_calls()
    }

    /// Run one monitor tick immediately and publish the verdict.
    pub fn check_long_running_calls(&self) -> bool {
        self.shared.check_long_running_calls()
    }

    pub fn pending_calls(&self) -> usize {
        lock(&self.shared.registry).pending_len()
    }

    pub fn is_pending(&self, call_id: CallId) -> bool {
        lock(&self.shared.registry).is_pending(call_id)
    }

    pub fn is_live(&self, object_id: ObjectId) -> bool {
        lock(&self.shared.registry).is_live(object_id)
    }

    /// Terminate the channel and stop background tasks. Pending calls are left
    /// unresolved.
    pub fn dispose(&self) {
        self.shared.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    #[cfg(test)]
    pub(crate) fn dispatch(&self, message: WorkerResponse) -> DispatchOutcome {
        self.shared.dispatch(message)
    }
}

impl Drop for WorkerProxy {
    fn drop(&mut self) {
        self.shared.dispose();
    }
}

/// Non-owning reference from a handle back to its proxy.
#[derive(Clone)]
pub(crate) struct WorkerProxyRef {
    shared: Weak<ProxyShared>,
}

impl WorkerProxyRef {
    pub(crate) fn new(shared: &Arc<ProxyShared>) -> Self {
        Self {
            shared: Arc::downgrade(shared),
        }
    }

    pub(crate) fn upgrade(&self) -> Result<Arc<ProxyShared>> {
        self.shared.upgrade().ok_or(ProxyError::WorkerDisposed)
    }
}

impl ProxyShared {
    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(ProxyError::WorkerDisposed);
        }
        Ok(())
    }

    fn post(&self, call_id: CallId, body: RequestBody) -> Result<()> {
        self.ensure_open()?;
        trace!(%call_id, disposition = body.disposition(), "posting worker request");
        self.channel.post_message(WorkerRequest { call_id, body })
    }

    fn not_live(object_id: ObjectId) -> ProxyError {
        error!(%object_id, "operation on a remote object that is not live");
        ProxyError::ObjectDisposed(object_id)
    }

    fn arm_monitor_if_configured(self: &Arc<Self>) {
        if self.config.watch_long_running_calls
            && let Err(err) = self.start_checking_for_long_running_calls()
        {
            debug!(error = %err, "long-running-call monitor not armed");
        }
    }

    /// Withdraw a call whose request never left. The callback is dropped after
    /// the registry lock is released.
    fn abandon(&self, call_id: CallId) {
        let callback = lock(&self.registry).take(call_id);
        drop(callback);
    }

    pub(crate) fn create_object(&self, type_name: &str) -> Result<ObjectId> {
        self.ensure_open()?;
        let (call_id, object_id) = {
            let mut registry = lock(&self.registry);
            (registry.next_call_id(), registry.allocate_object())
        };
        let result = self.post(
            call_id,
            RequestBody::Create {
                object_id,
                method_name: type_name.to_string(),
            },
        );
        if let Err(err) = result {
            lock(&self.registry).retire_object(object_id);
            return Err(err);
        }
        Ok(object_id)
    }

    pub(crate) fn dispose_object(&self, object_id: ObjectId) -> Result<()> {
        self.ensure_open()?;
        let call_id = {
            let mut registry = lock(&self.registry);
            if !registry.retire_object(object_id) {
                return Err(Self::not_live(object_id));
            }
            registry.next_call_id()
        };
        self.post(call_id, RequestBody::Dispose { object_id })
    }

    pub(crate) fn call_method(
        self: &Arc<Self>,
        object_id: ObjectId,
        method_name: &str,
        arguments: Vec<Value>,
        callback: Option<PendingCall>,
    ) -> Result<CallId> {
        self.ensure_open()?;
        self.arm_monitor_if_configured();
        let call_id = {
            let mut registry = lock(&self.registry);
            if !registry.is_live(object_id) {
                return Err(Self::not_live(object_id));
            }
            let call_id = registry.next_call_id();
            if let Some(callback) = callback {
                registry.register(call_id, callback);
            }
            call_id
        };
        let result = self.post(
            call_id,
            RequestBody::Method {
                object_id,
                method_name: method_name.to_string(),
                method_arguments: arguments,
            },
        );
        if let Err(err) = result {
            self.abandon(call_id);
            return Err(err);
        }
        Ok(call_id)
    }

    pub(crate) fn call_method_receiver(
        self: &Arc<Self>,
        object_id: ObjectId,
        method_name: &str,
        arguments: Vec<Value>,
    ) -> Result<(CallId, oneshot::Receiver<Value>)> {
        let (tx, rx) = oneshot::channel();
        let call_id = self.call_method(
            object_id,
            method_name,
            arguments,
            Some(Box::new(move |value| {
                let _ = tx.send(value);
            })),
        )?;
        Ok((call_id, rx))
    }

    /// Reserve a call id and the id of the object the factory will produce,
    /// then send the request.
    pub(crate) fn call_factory(
        self: &Arc<Self>,
        object_id: ObjectId,
        method_name: &str,
        arguments: Vec<Value>,
        callback: Option<FactoryCallback>,
    ) -> Result<(CallId, ObjectId)> {
        self.ensure_open()?;
        self.arm_monitor_if_configured();
        let (call_id, new_object_id) = {
            let mut registry = lock(&self.registry);
            if !registry.is_live(object_id) {
                return Err(Self::not_live(object_id));
            }
            let call_id = registry.next_call_id();
            let new_object_id = registry.allocate_object();
            if let Some(callback) = callback {
                let proxy = WorkerProxyRef::new(self);
                registry.register(
                    call_id,
                    Box::new(move |result| {
                        if is_truthy(&result) {
                            callback(Some(RemoteObject::new(proxy, new_object_id)));
                        } else {
                            if let Ok(shared) = proxy.upgrade() {
                                lock(&shared.registry).retire_object(new_object_id);
                            }
                            callback(None);
                        }
                    }),
                );
            }
            (call_id, new_object_id)
        };
        let result = self.post(
            call_id,
            RequestBody::Factory {
                object_id,
                method_name: method_name.to_string(),
                method_arguments: arguments,
                new_object_id,
            },
        );
        if let Err(err) = result {
            self.abandon(call_id);
            lock(&self.registry).retire_object(new_object_id);
            return Err(err);
        }
        Ok((call_id, new_object_id))
    }

    pub(crate) fn call_factory_receiver(
        self: &Arc<Self>,
        object_id: ObjectId,
        method_name: &str,
        arguments: Vec<Value>,
    ) -> Result<(CallId, oneshot::Receiver<Option<RemoteObject>>)> {
        let (tx, rx) = oneshot::channel();
        let (call_id, _) = self.call_factory(
            object_id,
            method_name,
            arguments,
            Some(Box::new(move |object| {
                let _ = tx.send(object);
            })),
        )?;
        Ok((call_id, rx))
    }

    fn evaluate_for_test(&self, script: &str, callback: Option<PendingCall>) -> Result<CallId> {
        self.ensure_open()?;
        let call_id = {
            let mut registry = lock(&self.registry);
            let call_id = registry.next_call_id();
            if let Some(callback) = callback {
                registry.register(call_id, callback);
            }
            call_id
        };
        let result = self.post(
            call_id,
            RequestBody::EvaluateForTest {
                source: script.to_string(),
            },
        );
        if let Err(err) = result {
            self.abandon(call_id);
            return Err(err);
        }
        Ok(call_id)
    }

    fn start_checking_for_long_running_calls(self: &Arc<Self>) -> Result<()> {
        self.ensure_open()?;
        let mut slot = lock(&self.monitor_task);
        // dispose may have run between the check above and taking the slot.
        self.ensure_open()?;
        if slot.is_some() {
            return Ok(());
        }

        self.check_long_running_calls();
        let shared = Arc::downgrade(self);
        let period = self.config.long_running_check_interval;
        *slot = Some(self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.check_long_running_calls();
            }
        }));
        Ok(())
    }

    fn check_long_running_calls(&self) -> bool {
        let current = lock(&self.registry).pending_ids();
        let busy = lock(&self.monitor).check(&current);
        self.waiting.send_replace(busy);
        busy
    }

    /// Route one inbound message. Callbacks run, and are dropped, only after
    /// the registry lock has been released.
    fn dispatch(&self, message: WorkerResponse) -> DispatchOutcome {
        match message {
            WorkerResponse::Event(event) => match self.events.send(event) {
                Ok(()) => DispatchOutcome::Event,
                Err(mpsc::error::SendError(event)) => {
                    debug!(event = %event.name, "no listener for worker event");
                    DispatchOutcome::EventUnheard
                }
            },
            WorkerResponse::Failure(failure) => {
                let callback = lock(&self.registry).take(failure.call_id);
                error!(
                    call_id = %failure.call_id,
                    method = failure.method_name.as_deref().unwrap_or("<unknown>"),
                    call_stack = failure.call_stack.as_deref().unwrap_or(""),
                    "An error occurred when a call to a worker method was requested"
                );
                drop(callback);
                DispatchOutcome::Failed
            }
            WorkerResponse::Success { call_id, result } => {
                let callback = lock(&self.registry).take(call_id);
                match callback {
                    Some(callback) => {
                        callback(result);
                        DispatchOutcome::Delivered
                    }
                    None => {
                        trace!(%call_id, "dropping worker response without pending call");
                        DispatchOutcome::Orphaned
                    }
                }
            }
        }
    }

    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.channel.terminate();
        if let Some(task) = lock(&self.monitor_task).take() {
            task.abort();
        }
        if let Some(task) = lock(&self.dispatch_task).take() {
            task.abort();
        }
        let pending = lock(&self.registry).pending_len();
        debug!(pending, "worker proxy disposed");
    }
}

async fn dispatch_loop(shared: Weak<ProxyShared>, mut inbound: mpsc::UnboundedReceiver<Value>) {
    while let Some(value) = inbound.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match WorkerResponse::classify(value) {
            Ok(message) => {
                shared.dispatch(message);
            }
            Err(err) => warn!(error = %err, "Malformed worker message"),
        }
    }
    debug!("worker message stream ended; pending calls stay unresolved");
}

pub(crate) fn typed_factory_callback<H, F>(callback: F) -> FactoryCallback
where
    H: RemoteHandle,
    F: FnOnce(Option<H>) + Send + 'static,
{
    Box::new(move |object: Option<RemoteObject>| callback(object.map(H::from_remote)))
}

pub(crate) async fn await_result<R>(call_id: CallId, rx: oneshot::Receiver<Value>) -> Result<R>
where
    R: DeserializeOwned,
{
    let value = rx.await.map_err(|_| ProxyError::CallDropped(call_id))?;
    Ok(serde_json::from_value(value)?)
}

pub(crate) async fn await_handle<H>(
    call_id: CallId,
    rx: oneshot::Receiver<Option<RemoteObject>>,
) -> Result<Option<H>>
where
    H: RemoteHandle,
{
    let object = rx.await.map_err(|_| ProxyError::CallDropped(call_id))?;
    Ok(object.map(H::from_remote))
}
