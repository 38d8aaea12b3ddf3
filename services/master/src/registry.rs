//! Durable registry of admitted agents and maintenance state.
//!
//! The registry applies one [`RegistryOperation`] at a time; each either
//! fully commits or is rejected. The log implementation itself is outside
//! the master, which only sees [`Registry`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corral_id::AgentId;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::maintenance::{self, MachineId, MachineInfo, MachineMode, Schedule};
use crate::operation::Operation;
use crate::state::AgentInfo;

// =============================================================================
// Operations
// =============================================================================

/// A single transactional registry mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistryOperation {
    AdmitAgent { agent_id: AgentId, info: AgentInfo },
    MarkAgentUnreachable { agent_id: AgentId, at: DateTime<Utc> },
    RemoveAgent { agent_id: AgentId },
    MarkAgentGone { agent_id: AgentId, at: DateTime<Utc> },
    UpdateSchedule { schedule: Schedule },
    StartMaintenance { machine_ids: Vec<MachineId> },
    StopMaintenance { machine_ids: Vec<MachineId> },
    ApplyOperation { agent_id: AgentId, operation: Operation },
}

impl RegistryOperation {
    pub fn name(&self) -> &'static str {
        match self {
            RegistryOperation::AdmitAgent { .. } => "ADMIT_AGENT",
            RegistryOperation::MarkAgentUnreachable { .. } => "MARK_AGENT_UNREACHABLE",
            RegistryOperation::RemoveAgent { .. } => "REMOVE_AGENT",
            RegistryOperation::MarkAgentGone { .. } => "MARK_AGENT_GONE",
            RegistryOperation::UpdateSchedule { .. } => "UPDATE_SCHEDULE",
            RegistryOperation::StartMaintenance { .. } => "START_MAINTENANCE",
            RegistryOperation::StopMaintenance { .. } => "STOP_MAINTENANCE",
            RegistryOperation::ApplyOperation { .. } => "APPLY_OPERATION",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The backing store could not be reached or written.
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    /// The store refused the write.
    #[error("registry aborted: {0}")]
    Aborted(String),
}

/// Everything the master recovers on startup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrySnapshot {
    pub admitted: BTreeMap<AgentId, AgentInfo>,
    pub unreachable: BTreeMap<AgentId, DateTime<Utc>>,
    pub gone: BTreeMap<AgentId, DateTime<Utc>>,
    pub machines: BTreeMap<MachineId, MachineInfo>,
    pub schedules: Vec<Schedule>,
}

#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// Reads the committed state.
    async fn recover(&self) -> Result<RegistrySnapshot, RegistryError>;

    /// Applies one operation. `Ok(false)` means the operation was a no-op
    /// against the committed state.
    async fn apply(&self, operation: RegistryOperation) -> Result<bool, RegistryError>;
}

impl RegistrySnapshot {
    fn apply(&mut self, operation: &RegistryOperation) -> bool {
        match operation {
            RegistryOperation::AdmitAgent { agent_id, info } => {
                if self.admitted.contains_key(agent_id) || self.gone.contains_key(agent_id) {
                    return false;
                }
                self.unreachable.remove(agent_id);
                self.admitted.insert(*agent_id, info.clone());
                true
            }
            RegistryOperation::MarkAgentUnreachable { agent_id, at } => {
                if self.admitted.remove(agent_id).is_none() {
                    return false;
                }
                self.unreachable.insert(*agent_id, *at);
                true
            }
            RegistryOperation::RemoveAgent { agent_id } => {
                self.admitted.remove(agent_id).is_some()
            }
            RegistryOperation::MarkAgentGone { agent_id, at } => {
                if self.gone.contains_key(agent_id) {
                    return false;
                }
                self.admitted.remove(agent_id);
                self.unreachable.remove(agent_id);
                self.gone.insert(*agent_id, *at);
                true
            }
            RegistryOperation::UpdateSchedule { schedule } => {
                let diff = maintenance::diff_schedule(
                    |id| self.machines.get(id).map(|m| m.mode),
                    &self.schedules,
                    schedule,
                );
                maintenance::apply_diff(&mut self.machines, &diff);
                self.schedules = if schedule.windows.is_empty() {
                    Vec::new()
                } else {
                    vec![schedule.clone()]
                };
                true
            }
            RegistryOperation::StartMaintenance { machine_ids } => {
                for id in machine_ids {
                    if let Some(machine) = self.machines.get_mut(id) {
                        machine.mode = MachineMode::Down;
                    }
                }
                true
            }
            RegistryOperation::StopMaintenance { machine_ids } => {
                for id in machine_ids {
                    if let Some(machine) = self.machines.get_mut(id) {
                        machine.mode = MachineMode::Up;
                        machine.unavailability = None;
                    }
                }
                maintenance::remove_from_schedules(&mut self.schedules, machine_ids);
                true
            }
            RegistryOperation::ApplyOperation {
                agent_id,
                operation,
            } => {
                let Some(info) = self.admitted.get_mut(agent_id) else {
                    return false;
                };
                match info.resources.apply(operation) {
                    Ok(updated) => {
                        info.resources = updated;
                        true
                    }
                    Err(e) => {
                        warn!(agent_id = %agent_id, error = %e, "Registry rejected operation");
                        false
                    }
                }
            }
        }
    }
}

// =============================================================================
// In-memory registry
// =============================================================================

enum Fault {
    Fail(RegistryError),
    Reject,
}

struct Inner {
    snapshot: RegistrySnapshot,
    history: Vec<RegistryOperation>,
    faults: VecDeque<Fault>,
}

/// Registry kept in process memory. Applies are serialized behind one lock.
pub struct InMemoryRegistry {
    inner: Mutex<Inner>,
    gate: watch::Sender<bool>,
    blocked: AtomicUsize,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::with_snapshot(RegistrySnapshot::default())
    }

    pub fn with_snapshot(snapshot: RegistrySnapshot) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            inner: Mutex::new(Inner {
                snapshot,
                history: Vec::new(),
                faults: VecDeque::new(),
            }),
            gate,
            blocked: AtomicUsize::new(0),
        }
    }

    /// Makes the next apply fail with `error`.
    pub async fn fail_next(&self, error: RegistryError) {
        self.inner.lock().await.faults.push_back(Fault::Fail(error));
    }

    /// Makes the next apply return `Ok(false)`.
    pub async fn reject_next(&self) {
        self.inner.lock().await.faults.push_back(Fault::Reject);
    }

    /// Holds every apply until [`InMemoryRegistry::resume`].
    pub fn pause(&self) {
        self.gate.send_replace(false);
    }

    pub fn resume(&self) {
        self.gate.send_replace(true);
    }

    /// Number of applies currently held by [`InMemoryRegistry::pause`].
    pub fn blocked(&self) -> usize {
        self.blocked.load(Ordering::SeqCst)
    }

    /// Every operation passed to `apply`, in arrival order.
    pub async fn history(&self) -> Vec<RegistryOperation> {
        self.inner.lock().await.history.clone()
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        self.inner.lock().await.snapshot.clone()
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn recover(&self) -> Result<RegistrySnapshot, RegistryError> {
        let snapshot = self.inner.lock().await.snapshot.clone();
        info!(
            admitted = snapshot.admitted.len(),
            machines = snapshot.machines.len(),
            "Recovered registry"
        );
        Ok(snapshot)
    }

    async fn apply(&self, operation: RegistryOperation) -> Result<bool, RegistryError> {
        let mut gate = self.gate.subscribe();
        if !*gate.borrow() {
            self.blocked.fetch_add(1, Ordering::SeqCst);
            while !*gate.borrow_and_update() {
                if gate.changed().await.is_err() {
                    break;
                }
            }
            self.blocked.fetch_sub(1, Ordering::SeqCst);
        }

        let mut inner = self.inner.lock().await;
        inner.history.push(operation.clone());

        match inner.faults.pop_front() {
            Some(Fault::Fail(error)) => {
                warn!(operation = operation.name(), error = %error, "Registry apply failed");
                return Err(error);
            }
            Some(Fault::Reject) => {
                debug!(operation = operation.name(), "Registry apply rejected");
                return Ok(false);
            }
            None => {}
        }

        let applied = inner.snapshot.apply(&operation);
        debug!(operation = operation.name(), applied, "Registry apply");
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{Reservation, Resource, Resources};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn agent_info(cpus: f64) -> AgentInfo {
        AgentInfo {
            hostname: "node-1".to_string(),
            ip: None,
            capabilities: BTreeSet::new(),
            resources: vec![Resource::scalar("cpus", cpus)].into(),
        }
    }

    #[tokio::test]
    async fn test_admit_is_idempotent() {
        let registry = InMemoryRegistry::new();
        let agent_id = AgentId::new();
        let admit = RegistryOperation::AdmitAgent {
            agent_id,
            info: agent_info(4.0),
        };

        assert_eq!(registry.apply(admit.clone()).await, Ok(true));
        assert_eq!(registry.apply(admit).await, Ok(false));
        assert_eq!(registry.history().await.len(), 2);
    }

    #[tokio::test]
    async fn test_apply_operation_updates_checkpointed_resources() {
        let registry = InMemoryRegistry::new();
        let agent_id = AgentId::new();
        registry
            .apply(RegistryOperation::AdmitAgent {
                agent_id,
                info: agent_info(4.0),
            })
            .await
            .unwrap();

        let reserved = Resource::scalar("cpus", 1.0).with_reservation(Reservation::dynamic("web", None));
        let applied = registry
            .apply(RegistryOperation::ApplyOperation {
                agent_id,
                operation: Operation::Reserve {
                    resources: vec![reserved.clone()].into(),
                },
            })
            .await
            .unwrap();
        assert!(applied);

        let snapshot = registry.snapshot().await;
        let expected: Resources = vec![Resource::scalar("cpus", 3.0), reserved].into();
        assert_eq!(snapshot.admitted[&agent_id].resources, expected);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let registry = InMemoryRegistry::new();
        registry
            .fail_next(RegistryError::Unavailable("disk full".into()))
            .await;
        registry.reject_next().await;

        let op = RegistryOperation::RemoveAgent {
            agent_id: AgentId::new(),
        };
        assert!(registry.apply(op.clone()).await.is_err());
        assert_eq!(registry.apply(op.clone()).await, Ok(false));
        assert_eq!(registry.apply(op).await, Ok(false));
    }

    #[tokio::test]
    async fn test_pause_holds_applies() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.pause();

        let task = tokio::spawn({
            let registry = registry.clone();
            async move {
                registry
                    .apply(RegistryOperation::MarkAgentGone {
                        agent_id: AgentId::new(),
                        at: Utc::now(),
                    })
                    .await
            }
        });

        while registry.blocked() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(registry.history().await.is_empty());

        registry.resume();
        assert_eq!(task.await.unwrap(), Ok(true));
    }

    #[tokio::test]
    async fn test_start_and_stop_maintenance() {
        let id = MachineId::hostname("m1");
        let schedule = Schedule {
            windows: vec![maintenance::Window {
                machine_ids: vec![id.clone()],
                unavailability: maintenance::Unavailability {
                    start: Utc::now(),
                    duration_secs: None,
                },
            }],
        };
        let registry = InMemoryRegistry::new();
        registry
            .apply(RegistryOperation::UpdateSchedule { schedule })
            .await
            .unwrap();
        registry
            .apply(RegistryOperation::StartMaintenance {
                machine_ids: vec![id.clone()],
            })
            .await
            .unwrap();
        assert_eq!(registry.snapshot().await.machines[&id].mode, MachineMode::Down);

        registry
            .apply(RegistryOperation::StopMaintenance {
                machine_ids: vec![id.clone()],
            })
            .await
            .unwrap();
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.machines[&id].mode, MachineMode::Up);
        assert!(snapshot.schedules.is_empty());
    }
}
