//! In-memory cluster state owned by the master actor.
//!
//! Entities live in maps keyed by typed ids and refer to each other by id.
//! Nothing here is shared: the master actor holds the only [`ClusterState`]
//! and read-only handlers borrow it while the actor is blocked.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use corral_id::{AgentId, ExecutorId, FrameworkId, OfferId, OperationId, StreamId, TaskId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::maintenance::{MachineId, MachineInfo, MachineMode, Schedule, Unavailability};
use crate::operation::{AgentContext, OperationRecord};
use crate::queue::Queue;
use crate::resources::Resources;
use crate::scheduler::{Event, FrameworkInfo, TaskState};

// =============================================================================
// Agents
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentCapability {
    MultiRole,
    HierarchicalRole,
    ReservationRefinement,
    ResourceProvider,
    ResizeVolume,
}

/// What an agent reports about itself at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default)]
    pub capabilities: BTreeSet<AgentCapability>,
    pub resources: Resources,
}

impl AgentInfo {
    pub fn machine_id(&self) -> MachineId {
        MachineId::new(Some(self.hostname.clone()), self.ip.clone())
    }
}

#[derive(Debug, Clone)]
pub struct Agent {
    pub id: AgentId,
    pub info: AgentInfo,
    /// Checkpointed resources, including reservations and volumes.
    pub total: Resources,
    /// Resources held by launched tasks, per framework.
    pub used: BTreeMap<FrameworkId, Resources>,
    /// Unallocated form of every outstanding offer.
    pub offered: BTreeMap<OfferId, Resources>,
    pub inverse_offers: BTreeSet<OfferId>,
    /// Resources consumed by operations awaiting the registry.
    pub pending: BTreeMap<OperationId, Resources>,
    /// Unallocated resources of tasks that in-flight ACCEPTs will launch,
    /// keyed by the ACCEPT's hold.
    pub pending_tasks: BTreeMap<OperationId, Resources>,
    pub operations: BTreeMap<OperationId, OperationRecord>,
    pub tasks: BTreeSet<(FrameworkId, TaskId)>,
    pub executors: BTreeSet<(FrameworkId, ExecutorId)>,
    pub registered_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(id: AgentId, info: AgentInfo) -> Self {
        Self {
            id,
            total: info.resources.clone(),
            info,
            used: BTreeMap::new(),
            offered: BTreeMap::new(),
            inverse_offers: BTreeSet::new(),
            pending: BTreeMap::new(),
            pending_tasks: BTreeMap::new(),
            operations: BTreeMap::new(),
            tasks: BTreeSet::new(),
            executors: BTreeSet::new(),
            registered_at: Utc::now(),
        }
    }

    pub fn used_resources(&self) -> Resources {
        self.used.values().fold(Resources::new(), |mut acc, r| {
            acc += r;
            acc
        })
    }

    /// Unallocated resources: total minus used, offered and pending.
    pub fn available(&self) -> Resources {
        let mut available = self.total.clone();
        for r in self
            .used
            .values()
            .chain(self.offered.values())
            .chain(self.pending.values())
        {
            available -= &r.unallocate();
        }
        available
    }

    pub fn pending_resources(&self) -> Resources {
        self.pending.values().fold(Resources::new(), |mut acc, r| {
            acc += r;
            acc
        })
    }

    pub fn machine_id(&self) -> MachineId {
        self.info.machine_id()
    }
}

/// Agents in every lifecycle stage plus the in-flight transition guards.
#[derive(Debug, Default)]
pub struct Agents {
    pub registered: BTreeMap<AgentId, Agent>,
    /// Admitted in the registry but not yet re-registered since recovery.
    pub recovered: BTreeMap<AgentId, AgentInfo>,
    pub unreachable: BTreeMap<AgentId, DateTime<Utc>>,
    pub gone: BTreeMap<AgentId, DateTime<Utc>>,
    pub marking_gone: BTreeSet<AgentId>,
    pub marking_unreachable: BTreeSet<AgentId>,
    pub removing: BTreeSet<AgentId>,
}

impl Agents {
    pub fn is_transitioning(&self, agent_id: &AgentId) -> bool {
        self.marking_gone.contains(agent_id)
            || self.marking_unreachable.contains(agent_id)
            || self.removing.contains(agent_id)
    }

    /// Known in any non-gone stage.
    pub fn is_known(&self, agent_id: &AgentId) -> bool {
        self.registered.contains_key(agent_id)
            || self.recovered.contains_key(agent_id)
            || self.unreachable.contains_key(agent_id)
    }
}

// =============================================================================
// Frameworks and tasks
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub task_id: TaskId,
    pub framework_id: FrameworkId,
    pub agent_id: AgentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<ExecutorId>,
    pub name: String,
    pub resources: Resources,
    pub state: TaskState,
    /// Latest status update not yet acknowledged by the framework.
    #[serde(skip)]
    pub pending_ack: Option<uuid::Uuid>,
}

#[derive(Debug)]
pub struct Framework {
    pub id: FrameworkId,
    pub info: FrameworkInfo,
    pub connected: bool,
    pub active: bool,
    pub stream_id: Option<StreamId>,
    pub events: Option<Queue<Event>>,
    pub tasks: BTreeMap<TaskId, Task>,
    pub completed_tasks: VecDeque<Task>,
    pub offers: BTreeSet<OfferId>,
    pub inverse_offers: BTreeSet<OfferId>,
    pub registered_at: DateTime<Utc>,
}

impl Framework {
    pub fn new(id: FrameworkId, info: FrameworkInfo) -> Self {
        Self {
            id,
            info,
            connected: false,
            active: true,
            stream_id: None,
            events: None,
            tasks: BTreeMap::new(),
            completed_tasks: VecDeque::new(),
            offers: BTreeSet::new(),
            inverse_offers: BTreeSet::new(),
            registered_at: Utc::now(),
        }
    }

    /// Delivers an event if the framework is subscribed.
    pub fn send(&self, event: Event) {
        match &self.events {
            Some(events) if self.connected => {
                if !events.put(event) {
                    debug!(framework_id = %self.id, "Dropped event for closed stream");
                }
            }
            _ => debug!(framework_id = %self.id, "Dropped event for disconnected framework"),
        }
    }

    /// Moves a terminal task to the bounded completed list.
    pub fn complete_task(&mut self, task_id: &TaskId, max_completed: usize) -> Option<Task> {
        let task = self.tasks.remove(task_id)?;
        self.completed_tasks.push_back(task.clone());
        while self.completed_tasks.len() > max_completed {
            self.completed_tasks.pop_front();
        }
        Some(task)
    }

    pub fn roles(&self) -> &[String] {
        &self.info.roles
    }
}

// =============================================================================
// Offers
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Offer {
    pub id: OfferId,
    pub framework_id: FrameworkId,
    pub agent_id: AgentId,
    pub hostname: String,
    /// Allocated to one of the framework's roles.
    pub resources: Resources,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InverseOffer {
    pub id: OfferId,
    pub framework_id: FrameworkId,
    pub agent_id: AgentId,
    pub unavailability: Unavailability,
}

// =============================================================================
// Cluster state
// =============================================================================

#[derive(Debug)]
pub struct ClusterState {
    pub agents: Agents,
    pub frameworks: BTreeMap<FrameworkId, Framework>,
    pub completed_frameworks: VecDeque<FrameworkId>,
    pub offers: BTreeMap<OfferId, Offer>,
    pub inverse_offers: BTreeMap<OfferId, InverseOffer>,
    pub machines: BTreeMap<MachineId, MachineInfo>,
    pub machine_agents: BTreeMap<MachineId, BTreeSet<AgentId>>,
    pub schedules: Vec<Schedule>,
    pub started_at: DateTime<Utc>,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self {
            agents: Agents::default(),
            frameworks: BTreeMap::new(),
            completed_frameworks: VecDeque::new(),
            offers: BTreeMap::new(),
            inverse_offers: BTreeMap::new(),
            machines: BTreeMap::new(),
            machine_agents: BTreeMap::new(),
            schedules: Vec::new(),
            started_at: Utc::now(),
        }
    }
}

impl ClusterState {
    /// Adds an offer, charging the agent and the framework.
    pub fn add_offer(&mut self, offer: Offer) {
        if let Some(agent) = self.agents.registered.get_mut(&offer.agent_id) {
            agent.offered.insert(offer.id, offer.resources.unallocate());
        }
        if let Some(framework) = self.frameworks.get_mut(&offer.framework_id) {
            framework.offers.insert(offer.id);
        }
        self.offers.insert(offer.id, offer);
    }

    /// Forgets an offer everywhere. Idempotent: a second call returns `None`.
    pub fn remove_offer(&mut self, offer_id: &OfferId) -> Option<Offer> {
        let offer = self.offers.remove(offer_id)?;
        if let Some(agent) = self.agents.registered.get_mut(&offer.agent_id) {
            agent.offered.remove(offer_id);
        }
        if let Some(framework) = self.frameworks.get_mut(&offer.framework_id) {
            framework.offers.remove(offer_id);
        }
        Some(offer)
    }

    pub fn add_inverse_offer(&mut self, inverse_offer: InverseOffer) {
        if let Some(agent) = self.agents.registered.get_mut(&inverse_offer.agent_id) {
            agent.inverse_offers.insert(inverse_offer.id);
        }
        if let Some(framework) = self.frameworks.get_mut(&inverse_offer.framework_id) {
            framework.inverse_offers.insert(inverse_offer.id);
        }
        self.inverse_offers.insert(inverse_offer.id, inverse_offer);
    }

    pub fn remove_inverse_offer(&mut self, id: &OfferId) -> Option<InverseOffer> {
        let inverse_offer = self.inverse_offers.remove(id)?;
        if let Some(agent) = self.agents.registered.get_mut(&inverse_offer.agent_id) {
            agent.inverse_offers.remove(id);
        }
        if let Some(framework) = self.frameworks.get_mut(&inverse_offer.framework_id) {
            framework.inverse_offers.remove(id);
        }
        Some(inverse_offer)
    }

    /// Outstanding offers on an agent in ascending id order.
    pub fn agent_offers(&self, agent_id: &AgentId) -> Vec<OfferId> {
        self.agents
            .registered
            .get(agent_id)
            .map(|a| a.offered.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn machine_mode(&self, id: &MachineId) -> Option<MachineMode> {
        self.machines.get(id).map(|m| m.mode)
    }

    pub fn machine_unavailability(&self, id: &MachineId) -> Option<Unavailability> {
        self.machines.get(id).and_then(|m| m.unavailability.clone())
    }

    /// Agents attached to a machine, in id order.
    pub fn agents_on(&self, id: &MachineId) -> Vec<AgentId> {
        self.machine_agents
            .get(id)
            .map(|agents| agents.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Records the agent under its machine, creating an UP machine if new.
    pub fn attach_agent(&mut self, agent_id: AgentId, machine_id: MachineId) {
        self.machines
            .entry(machine_id.clone())
            .or_insert_with(|| MachineInfo::up(machine_id.clone()));
        self.machine_agents
            .entry(machine_id)
            .or_default()
            .insert(agent_id);
    }

    pub fn detach_agent(&mut self, agent_id: &AgentId, machine_id: &MachineId) {
        if let Some(agents) = self.machine_agents.get_mut(machine_id) {
            agents.remove(agent_id);
            if agents.is_empty() {
                self.machine_agents.remove(machine_id);
            }
        }
    }

    /// Resources held by tasks on the agent across all frameworks.
    /// Runs `f` with the agent's validation context. Tasks pending under
    /// `accept` are left out so an ACCEPT is not blocked by its own launches.
    pub fn with_agent_context<T>(
        &self,
        agent_id: &AgentId,
        accept: Option<&OperationId>,
        f: impl FnOnce(&Agent, &AgentContext<'_>) -> T,
    ) -> Option<T> {
        let agent = self.agents.registered.get(agent_id)?;
        let used = agent.used_resources().unallocate();
        let pending_tasks = agent
            .pending_tasks
            .iter()
            .filter(|(hold, _)| Some(*hold) != accept)
            .fold(Resources::new(), |mut acc, (_, resources)| {
                acc += resources;
                acc
            });
        let context = AgentContext {
            checkpointed: &agent.total,
            used: &used,
            pending_tasks: &pending_tasks,
            capabilities: &agent.info.capabilities,
        };
        Some(f(agent, &context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Resource;

    fn state_with_agent() -> (ClusterState, AgentId, FrameworkId) {
        let mut state = ClusterState::default();
        let agent_id = AgentId::new();
        let info = AgentInfo {
            hostname: "node-1".to_string(),
            ip: None,
            capabilities: BTreeSet::new(),
            resources: vec![Resource::scalar("cpus", 4.0), Resource::scalar("mem", 1024.0)].into(),
        };
        state.attach_agent(agent_id, info.machine_id());
        state.agents.registered.insert(agent_id, Agent::new(agent_id, info));

        let framework_id = FrameworkId::new();
        let info = FrameworkInfo {
            id: Some(framework_id),
            name: "batch".to_string(),
            principal: None,
            roles: vec!["web".to_string()],
        };
        state.frameworks.insert(framework_id, Framework::new(framework_id, info));
        (state, agent_id, framework_id)
    }

    fn offer(agent_id: AgentId, framework_id: FrameworkId, cpus: f64) -> Offer {
        Offer {
            id: OfferId::new(),
            framework_id,
            agent_id,
            hostname: "node-1".to_string(),
            resources: Resources::from(vec![Resource::scalar("cpus", cpus)]).allocate("web"),
        }
    }

    #[test]
    fn test_offer_reduces_available() {
        let (mut state, agent_id, framework_id) = state_with_agent();
        state.add_offer(offer(agent_id, framework_id, 3.0));

        let available = state.agents.registered[&agent_id].available();
        assert_eq!(available.scalar("cpus").as_f64(), 1.0);
        assert_eq!(available.scalar("mem").as_f64(), 1024.0);
    }

    #[test]
    fn test_remove_offer_is_idempotent() {
        let (mut state, agent_id, framework_id) = state_with_agent();
        let offer = offer(agent_id, framework_id, 1.0);
        let id = offer.id;
        state.add_offer(offer);

        assert!(state.remove_offer(&id).is_some());
        assert!(state.remove_offer(&id).is_none());
        assert!(state.frameworks[&framework_id].offers.is_empty());
        assert!(state.agents.registered[&agent_id].offered.is_empty());
    }

    #[test]
    fn test_agent_offers_sorted_by_id() {
        let (mut state, agent_id, framework_id) = state_with_agent();
        let ids: Vec<_> = (0..3)
            .map(|_| {
                let offer = offer(agent_id, framework_id, 1.0);
                let id = offer.id;
                state.add_offer(offer);
                id
            })
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(state.agent_offers(&agent_id), sorted);
    }

    #[test]
    fn test_completed_tasks_bounded() {
        let (mut state, agent_id, framework_id) = state_with_agent();
        let framework = state.frameworks.get_mut(&framework_id).unwrap();
        for i in 0..3 {
            let task_id = TaskId::new(format!("t{i}")).unwrap();
            framework.tasks.insert(
                task_id.clone(),
                Task {
                    task_id: task_id.clone(),
                    framework_id,
                    agent_id,
                    executor_id: None,
                    name: "sleep".to_string(),
                    resources: Resources::new(),
                    state: TaskState::Finished,
                    pending_ack: None,
                },
            );
            framework.complete_task(&task_id, 2);
        }
        assert_eq!(framework.completed_tasks.len(), 2);
        assert_eq!(framework.completed_tasks[0].task_id.as_str(), "t1");
    }

    #[test]
    fn test_attach_creates_up_machine() {
        let (state, _, _) = state_with_agent();
        assert_eq!(
            state.machine_mode(&MachineId::hostname("node-1")),
            Some(MachineMode::Up)
        );
    }
}
