//! Call and object bookkeeping for a single worker proxy.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::protocol::{CallId, ObjectId};

/// Completion handler for a call; invoked at most once with the worker's result.
pub type PendingCall = Box<dyn FnOnce(Value) + Send + 'static>;

/// Allocates call ids and object ids and correlates pending calls with their
/// completion handlers.
///
/// Ids start at 1 and are never reused for the lifetime of the registry.
pub struct CallRegistry {
    next_call_id: u64,
    next_object_id: u64,
    pending: HashMap<CallId, PendingCall>,
    live_objects: HashSet<ObjectId>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self {
            next_call_id: 1,
            next_object_id: 1,
            pending: HashMap::new(),
            live_objects: HashSet::new(),
        }
    }

    pub fn next_call_id(&mut self) -> CallId {
        let id = CallId(self.next_call_id);
        self.next_call_id += 1;
        id
    }

    /// Reserve a fresh object id and mark it live.
    pub fn allocate_object(&mut self) -> ObjectId {
        let id = ObjectId(self.next_object_id);
        self.next_object_id += 1;
        self.live_objects.insert(id);
        id
    }

    pub fn is_live(&self, object_id: ObjectId) -> bool {
        self.live_objects.contains(&object_id)
    }

    /// Mark an object as disposed. Returns `false` when it was not live.
    pub fn retire_object(&mut self, object_id: ObjectId) -> bool {
        self.live_objects.remove(&object_id)
    }

    pub fn register(&mut self, call_id: CallId, callback: PendingCall) {
        self.pending.insert(call_id, callback);
    }

    /// Remove and return the handler for `call_id`, if one is pending.
    pub fn take(&mut self, call_id: CallId) -> Option<PendingCall> {
        self.pending.remove(&call_id)
    }

    /// Drop the handler for `call_id` without invoking it.
    pub fn discard(&mut self, call_id: CallId) -> bool {
        self.pending.remove(&call_id).is_some()
    }

    pub fn is_pending(&self, call_id: CallId) -> bool {
        self.pending.contains_key(&call_id)
    }

    pub fn pending_ids(&self) -> HashSet<CallId> {
        self.pending.keys().copied().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}
