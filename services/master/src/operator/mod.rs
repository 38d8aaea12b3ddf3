//! Operator API: calls, responses and the operator event stream.

pub mod validation;

use corral_id::{AgentId, FrameworkId};
use serde::{Deserialize, Serialize};

use crate::allocator::InverseOfferStatus;
use crate::authz::Action;
use crate::maintenance::{MachineId, Schedule};
use crate::operation::Operation;
use crate::queue::Queue;
use crate::readonly::{AgentView, FrameworkView, OperationView, RecoveredAgentView, StateView};
use crate::resources::{Resource, Resources, Scalar};
use crate::state::Task;

// =============================================================================
// Raw call
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallType {
    GetHealth,
    GetState,
    GetAgents,
    GetFrameworks,
    GetTasks,
    GetOperations,
    GetMaintenanceSchedule,
    GetMaintenanceStatus,
    UpdateMaintenanceSchedule,
    StartMaintenance,
    StopMaintenance,
    ReserveResources,
    UnreserveResources,
    CreateVolumes,
    DestroyVolumes,
    GrowVolume,
    ShrinkVolume,
    MarkAgentGone,
    Teardown,
    Subscribe,
    #[serde(other)]
    Unknown,
}

/// Only SUBSCRIBE holds the connection open.
pub fn supports_streaming(call_type: CallType) -> bool {
    call_type == CallType::Subscribe
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMaintenanceSchedule {
    pub schedule: Schedule,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machines {
    #[serde(default)]
    pub machines: Vec<MachineId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResources {
    pub agent_id: AgentId,
    pub resources: Resources,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentVolumes {
    pub agent_id: AgentId,
    pub volumes: Resources,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrowVolume {
    pub agent_id: AgentId,
    pub volume: Resource,
    pub addition: Resource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShrinkVolume {
    pub agent_id: AgentId,
    pub volume: Resource,
    pub subtract: Scalar,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkAgentGone {
    pub agent_id: AgentId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Teardown {
    pub framework_id: FrameworkId,
}

/// Wire shape of an operator call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCall {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<CallType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_maintenance_schedule: Option<UpdateMaintenanceSchedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_maintenance: Option<Machines>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_maintenance: Option<Machines>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserve_resources: Option<AgentResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unreserve_resources: Option<AgentResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_volumes: Option<AgentVolumes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destroy_volumes: Option<AgentVolumes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grow_volume: Option<GrowVolume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shrink_volume: Option<ShrinkVolume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mark_agent_gone: Option<MarkAgentGone>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teardown: Option<Teardown>,
}

// =============================================================================
// Validated call
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    GetHealth,
    GetState,
    GetAgents,
    GetFrameworks,
    GetTasks,
    GetOperations,
    GetMaintenanceSchedule,
    GetMaintenanceStatus,
    UpdateMaintenanceSchedule(Schedule),
    StartMaintenance(Vec<MachineId>),
    StopMaintenance(Vec<MachineId>),
    ReserveResources(AgentResources),
    UnreserveResources(AgentResources),
    CreateVolumes(AgentVolumes),
    DestroyVolumes(AgentVolumes),
    GrowVolume(GrowVolume),
    ShrinkVolume(ShrinkVolume),
    MarkAgentGone(AgentId),
    Teardown(FrameworkId),
    Subscribe,
    Unknown,
}

impl Call {
    pub fn call_type(&self) -> CallType {
        match self {
            Call::GetHealth => CallType::GetHealth,
            Call::GetState => CallType::GetState,
            Call::GetAgents => CallType::GetAgents,
            Call::GetFrameworks => CallType::GetFrameworks,
            Call::GetTasks => CallType::GetTasks,
            Call::GetOperations => CallType::GetOperations,
            Call::GetMaintenanceSchedule => CallType::GetMaintenanceSchedule,
            Call::GetMaintenanceStatus => CallType::GetMaintenanceStatus,
            Call::UpdateMaintenanceSchedule(_) => CallType::UpdateMaintenanceSchedule,
            Call::StartMaintenance(_) => CallType::StartMaintenance,
            Call::StopMaintenance(_) => CallType::StopMaintenance,
            Call::ReserveResources(_) => CallType::ReserveResources,
            Call::UnreserveResources(_) => CallType::UnreserveResources,
            Call::CreateVolumes(_) => CallType::CreateVolumes,
            Call::DestroyVolumes(_) => CallType::DestroyVolumes,
            Call::GrowVolume(_) => CallType::GrowVolume,
            Call::ShrinkVolume(_) => CallType::ShrinkVolume,
            Call::MarkAgentGone(_) => CallType::MarkAgentGone,
            Call::Teardown(_) => CallType::Teardown,
            Call::Subscribe => CallType::Subscribe,
            Call::Unknown => CallType::Unknown,
        }
    }

    /// The resource operation an operator call asks for, with its target
    /// agent.
    pub fn into_operation(self) -> Option<(AgentId, Operation)> {
        let (agent_id, operation) = match self {
            Call::ReserveResources(AgentResources { agent_id, resources }) => {
                (agent_id, Operation::Reserve { resources })
            }
            Call::UnreserveResources(AgentResources { agent_id, resources }) => {
                (agent_id, Operation::Unreserve { resources })
            }
            Call::CreateVolumes(AgentVolumes { agent_id, volumes }) => {
                (agent_id, Operation::Create { volumes })
            }
            Call::DestroyVolumes(AgentVolumes { agent_id, volumes }) => {
                (agent_id, Operation::Destroy { volumes })
            }
            Call::GrowVolume(GrowVolume {
                agent_id,
                volume,
                addition,
            }) => (agent_id, Operation::GrowVolume { volume, addition }),
            Call::ShrinkVolume(ShrinkVolume {
                agent_id,
                volume,
                subtract,
            }) => (agent_id, Operation::ShrinkVolume { volume, subtract }),
            _ => return None,
        };
        Some((agent_id, operation))
    }

    /// Actions whose approvers the call needs up front.
    pub fn actions(&self) -> &'static [Action] {
        match self {
            Call::GetState | Call::Subscribe => {
                &[Action::ViewFramework, Action::ViewTask, Action::ViewRole]
            }
            Call::GetAgents | Call::GetOperations => &[Action::ViewRole],
            Call::GetFrameworks => &[Action::ViewFramework],
            Call::GetTasks => &[Action::ViewFramework, Action::ViewTask],
            Call::GetMaintenanceSchedule => &[Action::GetMaintenanceSchedule],
            Call::GetMaintenanceStatus => &[Action::GetMaintenanceStatus],
            Call::UpdateMaintenanceSchedule(_) => &[Action::UpdateMaintenanceSchedule],
            Call::StartMaintenance(_) => &[Action::StartMaintenance],
            Call::StopMaintenance(_) => &[Action::StopMaintenance],
            Call::ReserveResources(_) => &[Action::ReserveResources],
            Call::UnreserveResources(_) => &[Action::UnreserveResources],
            Call::CreateVolumes(_) => &[Action::CreateVolume],
            Call::DestroyVolumes(_) => &[Action::DestroyVolume],
            Call::GrowVolume(_) | Call::ShrinkVolume(_) => &[Action::ResizeVolume],
            Call::MarkAgentGone(_) => &[Action::MarkAgentGone],
            Call::Teardown(_) => &[Action::TeardownFramework],
            Call::GetHealth | Call::Unknown => &[],
        }
    }
}

// =============================================================================
// Responses and events
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct DrainingMachine {
    pub id: MachineId,
    pub statuses: Vec<InverseOfferStatus>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceStatus {
    pub draining_machines: Vec<DrainingMachine>,
    pub down_machines: Vec<MachineId>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Response {
    GetHealth {
        healthy: bool,
    },
    GetState {
        state: StateView,
    },
    GetAgents {
        agents: Vec<AgentView>,
        recovered_agents: Vec<RecoveredAgentView>,
    },
    GetFrameworks {
        frameworks: Vec<FrameworkView>,
        completed_frameworks: Vec<FrameworkId>,
    },
    GetTasks {
        tasks: Vec<Task>,
        completed_tasks: Vec<Task>,
    },
    GetOperations {
        operations: Vec<OperationView>,
    },
    GetMaintenanceSchedule {
        schedule: Schedule,
    },
    GetMaintenanceStatus {
        status: MaintenanceStatus,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatorEvent {
    Subscribed {
        state: StateView,
        heartbeat_interval_secs: f64,
    },
    AgentAdded {
        agent: AgentView,
    },
    AgentRemoved {
        agent_id: AgentId,
    },
    FrameworkAdded {
        framework: FrameworkView,
    },
    FrameworkRemoved {
        framework_id: FrameworkId,
    },
    Heartbeat,
}

#[derive(Debug)]
pub enum OperatorResponse {
    Accepted,
    Reply(Response),
    Subscribed(Queue<OperatorEvent>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_operation() {
        let agent_id = AgentId::new();
        let call = Call::DestroyVolumes(AgentVolumes {
            agent_id,
            volumes: Resources::new(),
        });
        let (target, operation) = call.into_operation().unwrap();
        assert_eq!(target, agent_id);
        assert_eq!(operation.kind().as_str(), "DESTROY");

        assert!(Call::GetState.into_operation().is_none());
    }

    #[test]
    fn test_raw_call_from_json() {
        let raw: RawCall = serde_json::from_str(
            r#"{"type": "START_MAINTENANCE", "start_maintenance": {"machines": [{"hostname": "m1"}]}}"#,
        )
        .unwrap();
        assert_eq!(raw.call_type, Some(CallType::StartMaintenance));
        assert_eq!(
            raw.start_maintenance.unwrap().machines,
            vec![MachineId::hostname("m1")]
        );
    }

    #[test]
    fn test_response_is_tagged() {
        let json = serde_json::to_value(Response::GetHealth { healthy: true }).unwrap();
        assert_eq!(json["type"], "GET_HEALTH");
        assert_eq!(json["healthy"], true);
    }
}
