//! Resource operations and their agent-side validation.

use std::collections::BTreeSet;
use std::fmt;

use corral_id::{AgentId, FrameworkId, OperationId};
use serde::{Deserialize, Serialize};

use crate::authz::{Action, Object};
use crate::resources::{AccessMode, Resource, ResourceError, Resources, Scalar, VolumeCapability};
use crate::scheduler::TaskInfo;
use crate::state::AgentCapability;

/// Upper bound on the combined size of a mount volume's flags.
pub const MAX_MOUNT_FLAGS_BYTES: usize = 4096;

// =============================================================================
// Operation
// =============================================================================

/// A typed mutation of one agent's resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Reserve { resources: Resources },
    Unreserve { resources: Resources },
    Create { volumes: Resources },
    Destroy { volumes: Resources },
    GrowVolume { volume: Resource, addition: Resource },
    ShrinkVolume { volume: Resource, subtract: Scalar },
    Launch { task_infos: Vec<TaskInfo> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Reserve,
    Unreserve,
    Create,
    Destroy,
    GrowVolume,
    ShrinkVolume,
    Launch,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Reserve => "RESERVE",
            OperationKind::Unreserve => "UNRESERVE",
            OperationKind::Create => "CREATE",
            OperationKind::Destroy => "DESTROY",
            OperationKind::GrowVolume => "GROW_VOLUME",
            OperationKind::ShrinkVolume => "SHRINK_VOLUME",
            OperationKind::Launch => "LAUNCH",
        }
    }

    /// Authorization action guarding this kind of operation.
    pub fn action(self) -> Action {
        match self {
            OperationKind::Reserve => Action::ReserveResources,
            OperationKind::Unreserve => Action::UnreserveResources,
            OperationKind::Create => Action::CreateVolume,
            OperationKind::Destroy => Action::DestroyVolume,
            OperationKind::GrowVolume | OperationKind::ShrinkVolume => Action::ResizeVolume,
            OperationKind::Launch => Action::RunTask,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Reserve { .. } => OperationKind::Reserve,
            Operation::Unreserve { .. } => OperationKind::Unreserve,
            Operation::Create { .. } => OperationKind::Create,
            Operation::Destroy { .. } => OperationKind::Destroy,
            Operation::GrowVolume { .. } => OperationKind::GrowVolume,
            Operation::ShrinkVolume { .. } => OperationKind::ShrinkVolume,
            Operation::Launch { .. } => OperationKind::Launch,
        }
    }

    /// Converts every carried resource to the reservation-stack format.
    pub fn upgrade(&mut self) -> Result<(), ResourceError> {
        match self {
            Operation::Reserve { resources } | Operation::Unreserve { resources } => {
                resources.upgrade()
            }
            Operation::Create { volumes } | Operation::Destroy { volumes } => volumes.upgrade(),
            Operation::GrowVolume { volume, addition } => {
                volume.upgrade()?;
                addition.upgrade()
            }
            Operation::ShrinkVolume { volume, .. } => volume.upgrade(),
            Operation::Launch { task_infos } => {
                for task in task_infos.iter_mut() {
                    task.resources.upgrade()?;
                }
                Ok(())
            }
        }
    }

    /// Resources the agent must hold unallocated for the operation to apply.
    pub fn required(&self) -> Resources {
        match self {
            Operation::Reserve { resources } => resources.pop_reservation(),
            Operation::Unreserve { resources } => resources.clone(),
            Operation::Create { volumes } => volumes.strip_disk_infos(),
            Operation::Destroy { volumes } => volumes.clone(),
            Operation::GrowVolume { volume, addition } => {
                Resources::from(vec![volume.clone(), addition.clone()])
            }
            Operation::ShrinkVolume { volume, .. } => Resources::from(vec![volume.clone()]),
            Operation::Launch { task_infos } => task_infos
                .iter()
                .flat_map(|t| t.resources.iter().cloned())
                .collect(),
        }
    }

    /// The same operation with allocation roles stripped, as it applies to an
    /// agent's checkpointed resources.
    pub fn unallocate(&self) -> Operation {
        fn strip(resource: &Resource) -> Resource {
            let mut stripped = resource.clone();
            stripped.allocation_role = None;
            stripped
        }

        match self {
            Operation::Reserve { resources } => Operation::Reserve {
                resources: resources.unallocate(),
            },
            Operation::Unreserve { resources } => Operation::Unreserve {
                resources: resources.unallocate(),
            },
            Operation::Create { volumes } => Operation::Create {
                volumes: volumes.unallocate(),
            },
            Operation::Destroy { volumes } => Operation::Destroy {
                volumes: volumes.unallocate(),
            },
            Operation::GrowVolume { volume, addition } => Operation::GrowVolume {
                volume: strip(volume),
                addition: strip(addition),
            },
            Operation::ShrinkVolume { volume, subtract } => Operation::ShrinkVolume {
                volume: strip(volume),
                subtract: *subtract,
            },
            Operation::Launch { .. } => self.clone(),
        }
    }

    /// Objects the principal must be approved for.
    pub fn authorization_objects(&self) -> Vec<Object> {
        match self {
            Operation::Reserve { resources } | Operation::Unreserve { resources } => {
                resources.iter().cloned().map(Object::Resource).collect()
            }
            Operation::Create { volumes } | Operation::Destroy { volumes } => {
                volumes.iter().cloned().map(Object::Resource).collect()
            }
            Operation::GrowVolume { volume, .. } | Operation::ShrinkVolume { volume, .. } => {
                vec![Object::Resource(volume.clone())]
            }
            Operation::Launch { task_infos } => task_infos
                .iter()
                .flat_map(|t| t.resources.iter().cloned().map(Object::Resource))
                .collect(),
        }
    }

    /// Kind-specific checks against the target agent.
    pub fn validate(&self, agent: &AgentContext<'_>, principal: Option<&str>) -> Result<(), String> {
        match self {
            Operation::Reserve { resources } => validate_reserve(resources, agent, principal),
            Operation::Unreserve { resources } => validate_unreserve(resources),
            Operation::Create { volumes } => validate_create(volumes, agent, principal),
            Operation::Destroy { volumes } => validate_destroy(volumes, agent),
            Operation::GrowVolume { volume, addition } => validate_grow(volume, addition, agent),
            Operation::ShrinkVolume { volume, subtract } => {
                validate_shrink(volume, *subtract, agent)
            }
            Operation::Launch { task_infos } => validate_launch(task_infos),
        }
    }
}

/// What validation needs to know about the target agent.
#[derive(Debug, Clone, Copy)]
pub struct AgentContext<'a> {
    pub checkpointed: &'a Resources,
    pub used: &'a Resources,
    /// Resources named by launches that have not reached the agent yet.
    pub pending_tasks: &'a Resources,
    pub capabilities: &'a BTreeSet<AgentCapability>,
}

impl AgentContext<'_> {
    fn require_idle(&self, volume: &Resource) -> Result<(), String> {
        if self.used.contains_resource(volume) {
            return Err(format!("Persistent volume {volume} is in use"));
        }
        if self.pending_tasks.contains_resource(volume) {
            return Err(format!("Persistent volume {volume} is in use by a pending task"));
        }
        Ok(())
    }
}

// =============================================================================
// Ledger entries
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationState {
    Pending,
    Finished,
    Failed,
    Error,
    Dropped,
    Unknown,
}

/// Latest known outcome of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStatus {
    pub operation_id: OperationId,
    pub agent_id: Option<AgentId>,
    pub state: OperationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// An applied operation recorded on an agent.
#[derive(Debug, Clone, Serialize)]
pub struct OperationRecord {
    pub id: OperationId,
    pub framework_id: Option<FrameworkId>,
    pub operation: Operation,
    pub state: OperationState,
    pub applied_at: chrono::DateTime<chrono::Utc>,
}

// =============================================================================
// Validation
// =============================================================================

pub fn validate_role(role: &str) -> Result<(), String> {
    if role.is_empty() {
        return Err("Empty role name is invalid".to_string());
    }
    if role == "*" {
        return Err("Role '*' cannot be reserved".to_string());
    }
    if role == "." || role == ".." {
        return Err(format!("Role '{role}' cannot be '.' or '..'"));
    }
    if role.starts_with('-') {
        return Err(format!("Role '{role}' cannot start with '-'"));
    }
    if role.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(format!("Role '{role}' cannot contain whitespace"));
    }
    Ok(())
}

fn require_non_empty(resources: &Resources) -> Result<(), String> {
    if resources.is_empty() {
        return Err("No resources specified".to_string());
    }
    resources.validate_quantities().map_err(|e| e.to_string())
}

fn validate_reserve(
    resources: &Resources,
    agent: &AgentContext<'_>,
    principal: Option<&str>,
) -> Result<(), String> {
    require_non_empty(resources)?;

    for resource in resources {
        let Some(reservation) = resource.reservations.last() else {
            return Err(format!("Resource {resource} is not reserved"));
        };
        if !resource.is_dynamically_reserved() {
            return Err(format!("Resource {resource} is not dynamically reserved"));
        }
        for layer in &resource.reservations {
            validate_role(&layer.role)?;
        }

        if let Some(principal) = principal {
            match reservation.principal.as_deref() {
                Some(p) if p == principal => {}
                Some(p) => {
                    return Err(format!(
                        "A reserve operation was attempted by principal '{principal}', but \
                         there is a reserved resource in the request with principal '{p}'"
                    ))
                }
                None => {
                    return Err(format!(
                        "A reserve operation was attempted by principal '{principal}', but \
                         resource {resource} does not set a reservation principal"
                    ))
                }
            }
        }

        if resource.reservations.len() > 1
            && !agent
                .capabilities
                .contains(&AgentCapability::ReservationRefinement)
        {
            return Err(format!(
                "Resource {resource} refines a reservation, which requires the agent \
                 capability RESERVATION_REFINEMENT"
            ));
        }

        if resource.is_persistent_volume() {
            return Err(format!("Cannot reserve persistent volume {resource}"));
        }
    }
    Ok(())
}

fn validate_unreserve(resources: &Resources) -> Result<(), String> {
    require_non_empty(resources)?;

    for resource in resources {
        if !resource.is_dynamically_reserved() {
            return Err(format!("Resource {resource} is not dynamically reserved"));
        }
        if resource.is_persistent_volume() {
            return Err(format!(
                "Persistent volume {resource} must be destroyed before it is unreserved"
            ));
        }
    }
    Ok(())
}

pub fn validate_volume_capability(capability: &VolumeCapability) -> Result<(), String> {
    if capability.block.is_some() == capability.mount.is_some() {
        return Err("Exactly one of 'block' or 'mount' must be set".to_string());
    }
    if capability.access_mode == AccessMode::Unknown {
        return Err("'access_mode' is missing or set to UNKNOWN".to_string());
    }
    if let Some(mount) = &capability.mount {
        let size: usize = mount.mount_flags.iter().map(String::len).sum();
        if size > MAX_MOUNT_FLAGS_BYTES {
            return Err(format!(
                "Size of 'mount_flags' ({size} bytes) exceeds {MAX_MOUNT_FLAGS_BYTES} bytes"
            ));
        }
    }
    Ok(())
}

fn validate_create(
    volumes: &Resources,
    agent: &AgentContext<'_>,
    principal: Option<&str>,
) -> Result<(), String> {
    require_non_empty(volumes)?;

    let in_use: BTreeSet<&str> = agent
        .checkpointed
        .persistent_volumes()
        .filter_map(|v| v.persistence().map(|p| p.id.as_str()))
        .collect();
    let mut requested = BTreeSet::new();

    for volume in volumes {
        let Some(persistence) = volume.persistence() else {
            return Err(format!("Resource {volume} does not have a persistence id"));
        };
        if persistence.id.is_empty() {
            return Err(format!("Resource {volume} has an empty persistence id"));
        }
        if !volume.is_reserved() {
            return Err(format!(
                "Persistent volume {volume} cannot be created from unreserved resources"
            ));
        }
        if let (Some(principal), Some(owner)) = (principal, persistence.principal.as_deref()) {
            if principal != owner {
                return Err(format!(
                    "Create from principal '{principal}' cannot include a volume with \
                     persistence principal '{owner}'"
                ));
            }
        }
        if in_use.contains(persistence.id.as_str()) || !requested.insert(persistence.id.as_str()) {
            return Err(format!("Persistence id '{}' is already in use", persistence.id));
        }
        if let Some(capability) = volume.disk.as_ref().and_then(|d| d.capability.as_ref()) {
            validate_volume_capability(capability)?;
        }
    }
    Ok(())
}

fn validate_destroy(volumes: &Resources, agent: &AgentContext<'_>) -> Result<(), String> {
    require_non_empty(volumes)?;

    for volume in volumes {
        if !volume.is_persistent_volume() {
            return Err(format!("Resource {volume} is not a persistent volume"));
        }
        require_checkpointed(volume, agent)?;
        agent.require_idle(volume)?;
    }
    Ok(())
}

fn require_checkpointed(volume: &Resource, agent: &AgentContext<'_>) -> Result<(), String> {
    if agent.checkpointed.contains_resource(volume) {
        Ok(())
    } else {
        Err(format!("Persistent volume {volume} not found"))
    }
}

fn require_resize_capability(agent: &AgentContext<'_>) -> Result<(), String> {
    if agent.capabilities.contains(&AgentCapability::ResizeVolume) {
        Ok(())
    } else {
        Err("Agent does not have the RESIZE_VOLUME capability".to_string())
    }
}

fn validate_grow(volume: &Resource, addition: &Resource, agent: &AgentContext<'_>) -> Result<(), String> {
    require_resize_capability(agent)?;

    if !volume.is_persistent_volume() {
        return Err(format!("Resource {volume} is not a persistent volume"));
    }
    if !addition.scalar.is_positive() {
        return Err(format!("Addition {addition} must be positive"));
    }
    if addition.is_persistent_volume() {
        return Err(format!("Addition {addition} cannot be a persistent volume"));
    }
    if addition.name != volume.name || addition.reservations != volume.reservations {
        return Err(format!(
            "Addition {addition} must have the same name and reservations as {volume}"
        ));
    }
    require_checkpointed(volume, agent)?;
    agent.require_idle(volume)
}

fn validate_shrink(volume: &Resource, subtract: Scalar, agent: &AgentContext<'_>) -> Result<(), String> {
    require_resize_capability(agent)?;

    if !volume.is_persistent_volume() {
        return Err(format!("Resource {volume} is not a persistent volume"));
    }
    if !subtract.is_positive() {
        return Err(format!("Subtract amount {subtract} must be positive"));
    }
    if subtract >= volume.scalar {
        return Err(format!(
            "Shrinking {volume} by {subtract} would not leave a positive size"
        ));
    }
    require_checkpointed(volume, agent)?;
    agent.require_idle(volume)
}

/// Launch checks that need no agent: tasks present, unique and sized.
pub fn validate_launch(task_infos: &[TaskInfo]) -> Result<(), String> {
    if task_infos.is_empty() {
        return Err("No tasks specified".to_string());
    }
    let mut ids = BTreeSet::new();
    for task in task_infos {
        if !ids.insert(&task.task_id) {
            return Err(format!("Task '{}' appears more than once", task.task_id));
        }
        if task.resources.is_empty() {
            return Err(format!("Task '{}' uses no resources", task.task_id));
        }
        task.resources
            .validate_quantities()
            .map_err(|e| format!("Task '{}': {e}", task.task_id))?;
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
