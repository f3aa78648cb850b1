use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use scriptctl_core::{ProcessId, ProcessStatus};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};

/// Distinguishes successive launches of the same script
pub type InstanceId = u64;

/// Lifecycle of a registered instance. Removal from the registry is the
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InstanceState {
    Running,
    /// A stop was requested or the process was seen exiting
    Exiting,
}

/// What the supervisor observed while ending an instance
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StopReport {
    pub escalated: bool,
    pub status: Option<ProcessStatus>,
}

pub(crate) struct StopRequest {
    /// `None` when nobody waits for the outcome
    pub reply: Option<oneshot::Sender<StopReport>>,
}

pub(crate) struct RunningInstance {
    pub id: InstanceId,
    pub pid: Option<ProcessId>,
    pub started_at: DateTime<Utc>,
    pub state: InstanceState,
    pub control: mpsc::Sender<StopRequest>,
}

/// Read-only view of a registered instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub script_name: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub state: InstanceState,
}

/// Map from script name to its single running instance.
///
/// Map mutations are short critical sections under a synchronous lock.
/// Whole start/stop sequences for one name are serialized by the per-name
/// async lock from [`Registry::key_lock`], which callers hold across awaits.
#[derive(Default)]
pub(crate) struct Registry {
    instances: Mutex<HashMap<String, RunningInstance>>,
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> InstanceId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn key_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.key_locks
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Forget the key lock of `name` unless someone still holds a clone of
    /// it or an instance is registered under the name. Callers drop their
    /// own clone first.
    pub fn prune_key_lock(&self, name: &str) {
        let mut key_locks = self.key_locks.lock();
        let idle = key_locks
            .get(name)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle && !self.contains(name) {
            key_locks.remove(name);
        }
    }

    #[cfg(test)]
    pub fn key_lock_count(&self) -> usize {
        self.key_locks.lock().len()
    }

    /// Register an instance. Callers hold the key lock and have already
    /// stopped any previous instance.
    pub fn insert(&self, name: &str, instance: RunningInstance) {
        let previous = self.instances.lock().insert(name.to_string(), instance);
        debug_assert!(previous.is_none(), "two instances registered for {name}");
    }

    pub fn contains(&self, name: &str) -> bool {
        self.instances.lock().contains_key(name)
    }

    /// Mark the instance as exiting and hand out its control channel
    pub fn begin_exit(&self, name: &str) -> Option<(InstanceId, mpsc::Sender<StopRequest>)> {
        let mut instances = self.instances.lock();
        let instance = instances.get_mut(name)?;
        instance.state = InstanceState::Exiting;
        Some((instance.id, instance.control.clone()))
    }

    /// Mark a specific instance as exiting, ignoring newer ones
    pub fn mark_exiting(&self, name: &str, id: InstanceId) {
        if let Some(instance) = self.instances.lock().get_mut(name) {
            if instance.id == id {
                instance.state = InstanceState::Exiting;
            }
        }
    }

    /// Remove the entry only if it still belongs to the given instance
    pub fn remove_if(&self, name: &str, id: InstanceId) -> bool {
        let mut instances = self.instances.lock();
        match instances.get(name) {
            Some(instance) if instance.id == id => {
                instances.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.instances.lock().keys().cloned().collect()
    }

    pub fn pids(&self) -> Vec<ProcessId> {
        self.instances.lock().values().filter_map(|i| i.pid).collect()
    }

    /// Empty the registry, returning what was left in it
    pub fn drain(&self) -> Vec<(String, RunningInstance)> {
        self.instances.lock().drain().collect()
    }

    pub fn snapshot(&self) -> Vec<InstanceInfo> {
        self.instances
            .lock()
            .iter()
            .map(|(name, instance)| InstanceInfo {
                script_name: name.clone(),
                pid: instance.pid.map(|pid| pid.0),
                started_at: instance.started_at,
                state: instance.state,
            })
            .collect()
    }
}
