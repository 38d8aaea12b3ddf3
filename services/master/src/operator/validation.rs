//! Structural validation of operator calls.

use thiserror::Error;

use super::{Call, CallType, RawCall};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Expecting 'type' to be present")]
    MissingType,

    #[error("Expecting '{0}' to be present")]
    MissingField(&'static str),
}

fn require<T>(field: Option<T>, name: &'static str) -> Result<T, ValidationError> {
    field.ok_or(ValidationError::MissingField(name))
}

/// Checks that `raw` carries the payload its type needs.
pub fn validate(raw: RawCall) -> Result<Call, ValidationError> {
    let call_type = raw.call_type.ok_or(ValidationError::MissingType)?;

    Ok(match call_type {
        CallType::GetHealth => Call::GetHealth,
        CallType::GetState => Call::GetState,
        CallType::GetAgents => Call::GetAgents,
        CallType::GetFrameworks => Call::GetFrameworks,
        CallType::GetTasks => Call::GetTasks,
        CallType::GetOperations => Call::GetOperations,
        CallType::GetMaintenanceSchedule => Call::GetMaintenanceSchedule,
        CallType::GetMaintenanceStatus => Call::GetMaintenanceStatus,
        CallType::UpdateMaintenanceSchedule => Call::UpdateMaintenanceSchedule(
            require(raw.update_maintenance_schedule, "update_maintenance_schedule")?.schedule,
        ),
        CallType::StartMaintenance => {
            Call::StartMaintenance(require(raw.start_maintenance, "start_maintenance")?.machines)
        }
        CallType::StopMaintenance => {
            Call::StopMaintenance(require(raw.stop_maintenance, "stop_maintenance")?.machines)
        }
        CallType::ReserveResources => {
            Call::ReserveResources(require(raw.reserve_resources, "reserve_resources")?)
        }
        CallType::UnreserveResources => {
            Call::UnreserveResources(require(raw.unreserve_resources, "unreserve_resources")?)
        }
        CallType::CreateVolumes => {
            Call::CreateVolumes(require(raw.create_volumes, "create_volumes")?)
        }
        CallType::DestroyVolumes => {
            Call::DestroyVolumes(require(raw.destroy_volumes, "destroy_volumes")?)
        }
        CallType::GrowVolume => Call::GrowVolume(require(raw.grow_volume, "grow_volume")?),
        CallType::ShrinkVolume => Call::ShrinkVolume(require(raw.shrink_volume, "shrink_volume")?),
        CallType::MarkAgentGone => {
            Call::MarkAgentGone(require(raw.mark_agent_gone, "mark_agent_gone")?.agent_id)
        }
        CallType::Teardown => Call::Teardown(require(raw.teardown, "teardown")?.framework_id),
        CallType::Subscribe => Call::Subscribe,
        CallType::Unknown => Call::Unknown,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::MarkAgentGone;
    use corral_id::AgentId;
    use rstest::rstest;

    #[test]
    fn test_missing_type() {
        assert_eq!(validate(RawCall::default()), Err(ValidationError::MissingType));
    }

    #[rstest]
    #[case(CallType::UpdateMaintenanceSchedule, "update_maintenance_schedule")]
    #[case(CallType::StartMaintenance, "start_maintenance")]
    #[case(CallType::StopMaintenance, "stop_maintenance")]
    #[case(CallType::ReserveResources, "reserve_resources")]
    #[case(CallType::UnreserveResources, "unreserve_resources")]
    #[case(CallType::CreateVolumes, "create_volumes")]
    #[case(CallType::DestroyVolumes, "destroy_volumes")]
    #[case(CallType::GrowVolume, "grow_volume")]
    #[case(CallType::ShrinkVolume, "shrink_volume")]
    #[case(CallType::MarkAgentGone, "mark_agent_gone")]
    #[case(CallType::Teardown, "teardown")]
    fn test_payload_required(#[case] call_type: CallType, #[case] field: &'static str) {
        let raw = RawCall {
            call_type: Some(call_type),
            ..Default::default()
        };
        assert_eq!(validate(raw), Err(ValidationError::MissingField(field)));
    }

    #[rstest]
    #[case(CallType::GetHealth)]
    #[case(CallType::GetState)]
    #[case(CallType::GetMaintenanceStatus)]
    #[case(CallType::Subscribe)]
    #[case(CallType::Unknown)]
    fn test_payload_free(#[case] call_type: CallType) {
        let raw = RawCall {
            call_type: Some(call_type),
            ..Default::default()
        };
        assert_eq!(validate(raw).unwrap().call_type(), call_type);
    }

    #[test]
    fn test_mark_agent_gone() {
        let agent_id = AgentId::new();
        let raw = RawCall {
            call_type: Some(CallType::MarkAgentGone),
            mark_agent_gone: Some(MarkAgentGone { agent_id }),
            ..Default::default()
        };
        assert_eq!(validate(raw), Ok(Call::MarkAgentGone(agent_id)));
    }
}
