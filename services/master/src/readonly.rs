//! Read-only projections of cluster state.
//!
//! Every handler here is a pure function of a borrowed [`ClusterState`] and
//! an approvers snapshot, so a batch of them can run in parallel while the
//! master actor is blocked.

use chrono::{DateTime, Utc};
use corral_id::{AgentId, FrameworkId, OfferId, OperationId};
use serde::Serialize;

use crate::allocator::InverseOfferStatuses;
use crate::authz::{Action, Object, ObjectApprovers};
use crate::maintenance::{MachineId, MachineMode, Schedule, Window};
use crate::operation::{OperationRecord, OperationState};
use crate::operator::{Call, DrainingMachine, MaintenanceStatus, Response};
use crate::resources::{Resource, Resources};
use crate::state::{Agent, AgentCapability, ClusterState, Framework, Task};

/// Signature shared by every batched read-only handler.
pub type Handler = fn(&ClusterState, &Call, &ObjectApprovers) -> Response;

// =============================================================================
// Views
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct AgentView {
    pub id: AgentId,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub capabilities: Vec<AgentCapability>,
    pub total: Resources,
    pub used: Resources,
    pub offered: Resources,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveredAgentView {
    pub id: AgentId,
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameworkView {
    pub id: FrameworkId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    pub roles: Vec<String>,
    pub connected: bool,
    pub active: bool,
    pub offers: Vec<OfferId>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationView {
    pub id: OperationId,
    pub agent_id: AgentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework_id: Option<FrameworkId>,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub state: OperationState,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateView {
    pub started_at: DateTime<Utc>,
    pub agents: Vec<AgentView>,
    pub recovered_agents: Vec<RecoveredAgentView>,
    pub unreachable_agents: Vec<AgentId>,
    pub gone_agents: Vec<AgentId>,
    pub frameworks: Vec<FrameworkView>,
    pub completed_frameworks: Vec<FrameworkId>,
    pub tasks: Vec<Task>,
    pub completed_tasks: Vec<Task>,
}

// =============================================================================
// Filtering
// =============================================================================

fn role_visible(approvers: &ObjectApprovers, resource: &Resource) -> bool {
    !resource.is_reserved()
        || approvers.approved(
            Action::ViewRole,
            &Object::Role(resource.reservation_role().to_string()),
        )
}

fn visible_resources(approvers: &ObjectApprovers, resources: &Resources) -> Resources {
    resources.filter(|r| role_visible(approvers, r))
}

fn framework_visible(approvers: &ObjectApprovers, framework: &Framework) -> bool {
    approvers.approved(
        Action::ViewFramework,
        &Object::Framework {
            id: Some(framework.id),
            roles: framework.roles().to_vec(),
        },
    )
}

fn task_visible(approvers: &ObjectApprovers, framework: &Framework, task: &Task) -> bool {
    approvers.approved(
        Action::ViewTask,
        &Object::Task {
            framework_id: framework.id,
            task_id: task.task_id.clone(),
            roles: framework.roles().to_vec(),
        },
    )
}

fn operation_visible(approvers: &ObjectApprovers, record: &OperationRecord) -> bool {
    record
        .operation
        .authorization_objects()
        .iter()
        .all(|object| match object {
            Object::Resource(resource) => role_visible(approvers, resource),
            _ => true,
        })
}

// =============================================================================
// Projections
// =============================================================================

pub fn agent_view(approvers: &ObjectApprovers, agent: &Agent) -> AgentView {
    let offered = agent.offered.values().fold(Resources::new(), |mut acc, r| {
        acc += r;
        acc
    });
    AgentView {
        id: agent.id,
        hostname: agent.info.hostname.clone(),
        ip: agent.info.ip.clone(),
        capabilities: agent.info.capabilities.iter().copied().collect(),
        total: visible_resources(approvers, &agent.total),
        used: visible_resources(approvers, &agent.used_resources().unallocate()),
        offered: visible_resources(approvers, &offered),
        registered_at: agent.registered_at,
    }
}

pub fn framework_view(framework: &Framework) -> FrameworkView {
    FrameworkView {
        id: framework.id,
        name: framework.info.name.clone(),
        principal: framework.info.principal.clone(),
        roles: framework.info.roles.clone(),
        connected: framework.connected,
        active: framework.active,
        offers: framework.offers.iter().copied().collect(),
        registered_at: framework.registered_at,
    }
}

fn agents(state: &ClusterState, approvers: &ObjectApprovers) -> (Vec<AgentView>, Vec<RecoveredAgentView>) {
    let registered = state
        .agents
        .registered
        .values()
        .map(|agent| agent_view(approvers, agent))
        .collect();
    let recovered = state
        .agents
        .recovered
        .iter()
        .map(|(id, info)| RecoveredAgentView {
            id: *id,
            hostname: info.hostname.clone(),
        })
        .collect();
    (registered, recovered)
}

fn frameworks(state: &ClusterState, approvers: &ObjectApprovers) -> Vec<FrameworkView> {
    state
        .frameworks
        .values()
        .filter(|f| framework_visible(approvers, f))
        .map(framework_view)
        .collect()
}

fn tasks(state: &ClusterState, approvers: &ObjectApprovers) -> (Vec<Task>, Vec<Task>) {
    let mut active = Vec::new();
    let mut completed = Vec::new();
    for framework in state.frameworks.values() {
        if !framework_visible(approvers, framework) {
            continue;
        }
        active.extend(
            framework
                .tasks
                .values()
                .filter(|t| task_visible(approvers, framework, t))
                .cloned(),
        );
        completed.extend(
            framework
                .completed_tasks
                .iter()
                .filter(|t| task_visible(approvers, framework, t))
                .cloned(),
        );
    }
    (active, completed)
}

pub fn state_view(state: &ClusterState, approvers: &ObjectApprovers) -> StateView {
    let (agents, recovered_agents) = agents(state, approvers);
    let (tasks, completed_tasks) = tasks(state, approvers);
    StateView {
        started_at: state.started_at,
        agents,
        recovered_agents,
        unreachable_agents: state.agents.unreachable.keys().copied().collect(),
        gone_agents: state.agents.gone.keys().copied().collect(),
        frameworks: frameworks(state, approvers),
        completed_frameworks: state.completed_frameworks.iter().copied().collect(),
        tasks,
        completed_tasks,
    }
}

pub fn get_health(_state: &ClusterState, _call: &Call, _approvers: &ObjectApprovers) -> Response {
    Response::GetHealth { healthy: true }
}

pub fn get_state(state: &ClusterState, _call: &Call, approvers: &ObjectApprovers) -> Response {
    Response::GetState {
        state: state_view(state, approvers),
    }
}

pub fn get_agents(state: &ClusterState, _call: &Call, approvers: &ObjectApprovers) -> Response {
    let (agents, recovered_agents) = agents(state, approvers);
    Response::GetAgents {
        agents,
        recovered_agents,
    }
}

pub fn get_frameworks(state: &ClusterState, _call: &Call, approvers: &ObjectApprovers) -> Response {
    Response::GetFrameworks {
        frameworks: frameworks(state, approvers),
        completed_frameworks: state.completed_frameworks.iter().copied().collect(),
    }
}

pub fn get_tasks(state: &ClusterState, _call: &Call, approvers: &ObjectApprovers) -> Response {
    let (tasks, completed_tasks) = tasks(state, approvers);
    Response::GetTasks {
        tasks,
        completed_tasks,
    }
}

pub fn get_operations(state: &ClusterState, _call: &Call, approvers: &ObjectApprovers) -> Response {
    let operations = state
        .agents
        .registered
        .values()
        .flat_map(|agent| agent.operations.values().map(move |r| (agent.id, r)))
        .filter(|(_, record)| operation_visible(approvers, record))
        .map(|(agent_id, record)| OperationView {
            id: record.id,
            agent_id,
            framework_id: record.framework_id,
            kind: record.operation.kind().as_str(),
            state: record.state,
            applied_at: record.applied_at,
        })
        .collect();
    Response::GetOperations { operations }
}

fn machine_visible(approvers: &ObjectApprovers, action: Action, id: &MachineId) -> bool {
    approvers.approved(action, &Object::Machine(id.clone()))
}

pub fn get_maintenance_schedule(
    state: &ClusterState,
    _call: &Call,
    approvers: &ObjectApprovers,
) -> Response {
    let windows = state
        .schedules
        .iter()
        .flat_map(|s| s.windows.iter())
        .filter_map(|window| {
            let machine_ids: Vec<MachineId> = window
                .machine_ids
                .iter()
                .filter(|id| machine_visible(approvers, Action::GetMaintenanceSchedule, id))
                .cloned()
                .collect();
            (!machine_ids.is_empty()).then(|| Window {
                machine_ids,
                unavailability: window.unavailability.clone(),
            })
        })
        .collect();
    Response::GetMaintenanceSchedule {
        schedule: Schedule { windows },
    }
}

/// Draining and down machines the principal may see, joined with the
/// allocator's inverse offer statuses for their agents.
pub fn maintenance_status(
    state: &ClusterState,
    statuses: &InverseOfferStatuses,
    approvers: &ObjectApprovers,
) -> MaintenanceStatus {
    let mut status = MaintenanceStatus::default();
    for (id, info) in &state.machines {
        if !machine_visible(approvers, Action::GetMaintenanceStatus, id) {
            continue;
        }
        match info.mode {
            MachineMode::Draining => {
                let statuses = state
                    .agents_on(id)
                    .iter()
                    .filter_map(|agent_id| statuses.get(agent_id))
                    .flat_map(|per_framework| per_framework.values().cloned())
                    .collect();
                status.draining_machines.push(DrainingMachine {
                    id: id.clone(),
                    statuses,
                });
            }
            MachineMode::Down => status.down_machines.push(id.clone()),
            MachineMode::Up => {}
        }
    }
    status
}

/// The batched handler for a read-only call, if the call is one.
pub fn handler_for(call: &Call) -> Option<Handler> {
    let handler: Handler = match call {
        Call::GetHealth => get_health,
        Call::GetState => get_state,
        Call::GetAgents => get_agents,
        Call::GetFrameworks => get_frameworks,
        Call::GetTasks => get_tasks,
        Call::GetOperations => get_operations,
        Call::GetMaintenanceSchedule => get_maintenance_schedule,
        _ => return None,
    };
    Some(handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::{Acl, Acls, Authorizer, Entity, LocalAuthorizer, Principal};
    use crate::maintenance::{MachineInfo, Unavailability};
    use crate::resources::Reservation;
    use crate::scheduler::FrameworkInfo;
    use crate::state::AgentInfo;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn state() -> ClusterState {
        let mut state = ClusterState::default();
        let agent_id = AgentId::new();
        let info = AgentInfo {
            hostname: "node-1".to_string(),
            ip: None,
            capabilities: BTreeSet::new(),
            resources: vec![
                Resource::scalar("cpus", 2.0),
                Resource::scalar("cpus", 1.0).with_reservation(Reservation::dynamic("web", None)),
                Resource::scalar("cpus", 1.0).with_reservation(Reservation::dynamic("db", None)),
            ]
            .into(),
        };
        state.attach_agent(agent_id, info.machine_id());
        state.agents.registered.insert(agent_id, Agent::new(agent_id, info));

        for (name, role) in [("web-fw", "web"), ("db-fw", "db")] {
            let id = FrameworkId::new();
            let info = FrameworkInfo {
                id: Some(id),
                name: name.to_string(),
                principal: None,
                roles: vec![role.to_string()],
            };
            state.frameworks.insert(id, Framework::new(id, info));
        }
        state
    }

    async fn approvers_for(role: &str, actions: &[Action]) -> ObjectApprovers {
        let rules = actions
            .iter()
            .map(|&action| Acl {
                principals: Entity::Some(vec!["alice".to_string()]),
                action,
                objects: Entity::Some(vec![role.to_string()]),
            })
            .collect();
        let authorizer: Arc<dyn Authorizer> = Arc::new(LocalAuthorizer::new(
            Acls {
                permissive: Some(false),
                rules,
            },
            true,
        ));
        ObjectApprovers::create(Some(authorizer), Some(Principal::new("alice")), actions)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_frameworks_filtered_by_role() {
        let state = state();
        let approvers = approvers_for("web", &[Action::ViewFramework]).await;
        let Response::GetFrameworks { frameworks, .. } =
            get_frameworks(&state, &Call::GetFrameworks, &approvers)
        else {
            panic!("unexpected response");
        };
        assert_eq!(frameworks.len(), 1);
        assert_eq!(frameworks[0].name, "web-fw");
    }

    #[tokio::test]
    async fn test_agent_resources_filtered_by_role() {
        let state = state();
        let approvers = approvers_for("web", &[Action::ViewRole]).await;
        let Response::GetAgents { agents, .. } = get_agents(&state, &Call::GetAgents, &approvers)
        else {
            panic!("unexpected response");
        };
        let total = &agents[0].total;
        assert_eq!(total.scalar("cpus").as_f64(), 3.0);
        assert!(total.iter().all(|r| r.reservation_role() != "db"));
    }

    #[test]
    fn test_allow_all_sees_everything() {
        let state = state();
        let approvers = ObjectApprovers::allow_all(None, Call::GetState.actions());
        let view = state_view(&state, &approvers);
        assert_eq!(view.frameworks.len(), 2);
        assert_eq!(view.agents[0].total.scalar("cpus").as_f64(), 4.0);
    }

    #[test]
    fn test_maintenance_status_lists_draining_and_down() {
        let mut state = state();
        let draining = MachineId::hostname("node-1");
        let down = MachineId::hostname("node-2");
        let unavailability = Unavailability {
            start: Utc::now(),
            duration_secs: None,
        };
        state.machines.insert(
            draining.clone(),
            MachineInfo {
                id: draining.clone(),
                mode: MachineMode::Draining,
                unavailability: Some(unavailability.clone()),
            },
        );
        state.machines.insert(
            down.clone(),
            MachineInfo {
                id: down.clone(),
                mode: MachineMode::Down,
                unavailability: Some(unavailability),
            },
        );

        let approvers = ObjectApprovers::allow_all(None, &[Action::GetMaintenanceStatus]);
        let status = maintenance_status(&state, &InverseOfferStatuses::new(), &approvers);
        assert_eq!(status.draining_machines.len(), 1);
        assert_eq!(status.draining_machines[0].id, draining);
        assert_eq!(status.down_machines, vec![down]);
    }

    #[test]
    fn test_handler_for_read_only_calls() {
        assert!(handler_for(&Call::GetState).is_some());
        assert!(handler_for(&Call::GetMaintenanceStatus).is_none());
        assert!(handler_for(&Call::Subscribe).is_none());
    }
}
