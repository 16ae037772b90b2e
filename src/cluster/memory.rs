//! In-memory cluster
//!
//! Behaves like an API server for the four boundary calls: typed
//! not-found/already-exists errors, resource versions, and namespace
//! deletion removing everything inside the namespace. Every call is
//! journaled and faults can be injected per operation and object name.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use kube::api::DynamicObject;
use tracing::debug;

use super::{ClusterApi, ClusterError};
use crate::resource::{resource_id, ResourceId};

/// Boundary operation, as recorded in the call journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Get,
    Update,
    Delete,
}

/// One journaled call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Operation,
    pub id: ResourceId,
}

#[derive(Debug, Clone)]
struct Fault {
    op: Operation,
    name: Option<String>,
    message: String,
    transient: bool,
    remaining: Option<usize>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ResourceId, DynamicObject>,
    calls: Vec<Call>,
    faults: Vec<Fault>,
    version: u64,
}

impl State {
    fn take_fault(&mut self, op: Operation, id: &ResourceId) -> Option<ClusterError> {
        let index = self.faults.iter().position(|f| {
            f.op == op && f.name.as_deref().map_or(true, |n| n == id.name)
        })?;

        let fault = &mut self.faults[index];
        let err = if fault.transient {
            ClusterError::Transient {
                id: id.clone(),
                message: fault.message.clone(),
            }
        } else {
            ClusterError::Rejected {
                id: id.clone(),
                message: fault.message.clone(),
            }
        };

        if let Some(remaining) = fault.remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                self.faults.remove(index);
            }
        }

        Some(err)
    }

    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// In-memory [`ClusterApi`] implementation
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
    latency: Option<Duration>,
}

impl MemoryCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` before it is served
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an object directly, bypassing the journal
    pub fn insert(&self, obj: DynamicObject) -> Result<ResourceId, ClusterError> {
        let id = resource_id(&obj)?;
        self.lock().objects.insert(id.clone(), obj);
        Ok(id)
    }

    /// Mutate a stored object in place, as a controller would
    pub fn modify<F>(&self, id: &ResourceId, f: F) -> Result<(), ClusterError>
    where
        F: FnOnce(&mut DynamicObject),
    {
        let mut state = self.lock();
        let version = state.next_version();
        let obj = state
            .objects
            .get_mut(id)
            .ok_or_else(|| ClusterError::NotFound(id.clone()))?;
        f(obj);
        obj.metadata.resource_version = Some(version);
        Ok(())
    }

    /// Whether an object with this identity is stored
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.lock().objects.contains_key(id)
    }

    /// Snapshot of every stored object, ordered by identity
    #[must_use]
    pub fn objects(&self) -> Vec<DynamicObject> {
        self.lock().objects.values().cloned().collect()
    }

    /// Identities of every stored object
    #[must_use]
    pub fn ids(&self) -> Vec<ResourceId> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Every call served so far, in order
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Calls of one operation, in order
    #[must_use]
    pub fn calls_for(&self, op: Operation) -> Vec<Call> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }

    /// Reject every `op` on objects named `name` (any name if `None`)
    pub fn fail(&self, op: Operation, name: Option<&str>, message: impl Into<String>) {
        self.lock().faults.push(Fault {
            op,
            name: name.map(str::to_string),
            message: message.into(),
            transient: false,
            remaining: None,
        });
    }

    /// Fail the next `times` matching calls with a transient error
    pub fn fail_transient(&self, op: Operation, name: Option<&str>, times: usize) {
        if times == 0 {
            return;
        }
        self.lock().faults.push(Fault {
            op,
            name: name.map(str::to_string),
            message: "service unavailable".to_string(),
            transient: true,
            remaining: Some(times),
        });
    }

    async fn serve(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Journal the call and return any injected fault
    fn begin(&self, op: Operation, id: &ResourceId) -> Result<MutexGuard<'_, State>, ClusterError> {
        let mut state = self.lock();
        state.calls.push(Call { op, id: id.clone() });
        match state.take_fault(op, id) {
            Some(err) => Err(err),
            None => Ok(state),
        }
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let id = resource_id(obj)?;
        self.serve().await;

        let mut state = self.begin(Operation::Create, &id)?;
        if state.objects.contains_key(&id) {
            return Err(ClusterError::AlreadyExists(id));
        }

        let mut stored = obj.clone();
        stored.metadata.resource_version = Some(state.next_version());
        if stored.metadata.uid.is_none() {
            stored.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        state.objects.insert(id.clone(), stored.clone());

        debug!(resource = %id, "Created object in memory cluster");
        Ok(stored)
    }

    async fn get(&self, id: &ResourceId) -> Result<DynamicObject, ClusterError> {
        self.serve().await;

        let state = self.begin(Operation::Get, id)?;
        state
            .objects
            .get(id)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(id.clone()))
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let id = resource_id(obj)?;
        self.serve().await;

        let mut state = self.begin(Operation::Update, &id)?;
        let current = state
            .objects
            .get(&id)
            .ok_or_else(|| ClusterError::NotFound(id.clone()))?;

        if let Some(expected) = &obj.metadata.resource_version {
            if current.metadata.resource_version.as_ref() != Some(expected) {
                return Err(ClusterError::Conflict(id));
            }
        }

        let mut stored = obj.clone();
        stored.metadata.uid.clone_from(&current.metadata.uid);
        stored.metadata.resource_version = Some(state.next_version());
        state.objects.insert(id, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), ClusterError> {
        self.serve().await;

        let mut state = self.begin(Operation::Delete, id)?;
        if state.objects.remove(id).is_none() {
            return Err(ClusterError::NotFound(id.clone()));
        }

        if id.kind == "Namespace" {
            state
                .objects
                .retain(|other, _| other.namespace.as_deref() != Some(id.name.as_str()));
        }

        debug!(resource = %id, "Deleted object from memory cluster");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
