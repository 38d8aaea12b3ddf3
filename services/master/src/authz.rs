//! Authorization.
//!
//! Authorization is computed once per request as an [`ObjectApprovers`]
//! snapshot covering a bounded set of actions. Handlers then ask the snapshot
//! about concrete objects without further round-trips.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use corral_id::{FrameworkId, TaskId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::maintenance::MachineId;
use crate::resources::Resource;

// =============================================================================
// Principal
// =============================================================================

/// Authenticated identity attached to a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub claims: BTreeMap<String, String>,
}

impl Principal {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            claims: BTreeMap::new(),
        }
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            Some(value) => f.write_str(value),
            None => write!(f, "<claims: {:?}>", self.claims),
        }
    }
}

// =============================================================================
// Actions and objects
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    RegisterFramework,
    TeardownFramework,
    RunTask,
    ReserveResources,
    UnreserveResources,
    CreateVolume,
    DestroyVolume,
    ResizeVolume,
    UpdateMaintenanceSchedule,
    StartMaintenance,
    StopMaintenance,
    GetMaintenanceSchedule,
    GetMaintenanceStatus,
    MarkAgentGone,
    ViewFramework,
    ViewTask,
    ViewRole,
}

/// The thing an action is performed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    /// Actions without a single target.
    None,
    Role(String),
    Machine(MachineId),
    Resource(Resource),
    Framework {
        id: Option<FrameworkId>,
        roles: Vec<String>,
    },
    Task {
        framework_id: FrameworkId,
        task_id: TaskId,
        roles: Vec<String>,
    },
}

impl Object {
    /// Names an ACL entry can match this object by.
    fn identities(&self) -> Vec<String> {
        match self {
            Object::None => Vec::new(),
            Object::Role(role) => vec![role.clone()],
            Object::Machine(machine) => machine.names(),
            Object::Resource(resource) => {
                vec![resource
                    .allocation_role
                    .clone()
                    .unwrap_or_else(|| resource.reservation_role().to_string())]
            }
            Object::Framework { roles, .. } | Object::Task { roles, .. } => roles.clone(),
        }
    }
}

// =============================================================================
// Authorizer
// =============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthorizationError {
    #[error("authorizer unavailable: {0}")]
    Unavailable(String),

    #[error("invalid ACLs: {0}")]
    InvalidAcls(String),
}

/// Answers whether one principal may act on a given object.
pub trait ObjectApprover: Send + Sync {
    fn approved(&self, object: &Object) -> bool;
}

/// Source of per-action approvers.
#[async_trait]
pub trait Authorizer: Send + Sync + 'static {
    async fn approver(
        &self,
        principal: Option<&Principal>,
        action: Action,
    ) -> Result<Arc<dyn ObjectApprover>, AuthorizationError>;
}

struct Fixed(bool);

impl ObjectApprover for Fixed {
    fn approved(&self, _object: &Object) -> bool {
        self.0
    }
}

/// Snapshot of approvers for a bounded set of actions.
#[derive(Clone)]
pub struct ObjectApprovers {
    principal: Option<Principal>,
    approvers: HashMap<Action, Arc<dyn ObjectApprover>>,
}

impl std::fmt::Debug for ObjectApprovers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectApprovers")
            .field("principal", &self.principal)
            .field("actions", &self.approvers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ObjectApprovers {
    /// Fetches approvers for every action. Without an authorizer every
    /// action is approved.
    pub async fn create(
        authorizer: Option<Arc<dyn Authorizer>>,
        principal: Option<Principal>,
        actions: &[Action],
    ) -> Result<Self, AuthorizationError> {
        let mut approvers: HashMap<Action, Arc<dyn ObjectApprover>> = HashMap::new();
        for &action in actions {
            let approver: Arc<dyn ObjectApprover> = match &authorizer {
                Some(authorizer) => authorizer.approver(principal.as_ref(), action).await?,
                None => Arc::new(Fixed(true)),
            };
            approvers.insert(action, approver);
        }
        Ok(Self {
            principal,
            approvers,
        })
    }

    /// Approves every listed action.
    pub fn allow_all(principal: Option<Principal>, actions: &[Action]) -> Self {
        let approvers = actions
            .iter()
            .map(|&a| (a, Arc::new(Fixed(true)) as Arc<dyn ObjectApprover>))
            .collect();
        Self {
            principal,
            approvers,
        }
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn approved(&self, action: Action, object: &Object) -> bool {
        match self.approvers.get(&action) {
            Some(approver) => approver.approved(object),
            None => {
                warn!(?action, "No approver fetched for action");
                false
            }
        }
    }

    /// For actions without a single target object.
    pub fn approved_any(&self, action: Action) -> bool {
        self.approved(action, &Object::None)
    }
}

// =============================================================================
// ACL-driven local authorizer
// =============================================================================

/// ACL subject or object selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Any,
    None,
    Some(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acl {
    pub principals: Entity,
    pub action: Action,
    pub objects: Entity,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Acls {
    /// Decision when no rule matches; the configured default applies if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissive: Option<bool>,
    #[serde(default)]
    pub rules: Vec<Acl>,
}

/// Ordered ACL evaluation: the first rule whose subject and object match
/// decides; otherwise `permissive` decides.
#[derive(Debug, Clone)]
pub struct LocalAuthorizer {
    rules: Vec<Acl>,
    permissive: bool,
}

impl LocalAuthorizer {
    pub fn new(acls: Acls, default_permissive: bool) -> Self {
        Self {
            permissive: acls.permissive.unwrap_or(default_permissive),
            rules: acls.rules,
        }
    }

    /// Loads ACLs from a JSON file.
    pub fn from_file(path: &Path, default_permissive: bool) -> Result<Self, AuthorizationError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AuthorizationError::InvalidAcls(format!("{}: {e}", path.display())))?;
        let acls: Acls = serde_json::from_str(&raw)
            .map_err(|e| AuthorizationError::InvalidAcls(format!("{}: {e}", path.display())))?;
        Ok(Self::new(acls, default_permissive))
    }
}

struct AclApprover {
    rules: Vec<Entity>,
    permissive: bool,
}

impl ObjectApprover for AclApprover {
    fn approved(&self, object: &Object) -> bool {
        let identities = object.identities();
        for objects in &self.rules {
            match objects {
                Entity::Any => return true,
                Entity::None => return false,
                Entity::Some(names) => {
                    if identities.iter().any(|id| names.contains(id)) {
                        return true;
                    }
                }
            }
        }
        self.permissive
    }
}

fn subject_matches(principals: &Entity, principal: Option<&Principal>) -> bool {
    let value = principal.and_then(Principal::value);
    match principals {
        Entity::Any => true,
        Entity::None => value.is_none(),
        Entity::Some(names) => value.is_some_and(|v| names.iter().any(|n| n == v)),
    }
}

#[async_trait]
impl Authorizer for LocalAuthorizer {
    async fn approver(
        &self,
        principal: Option<&Principal>,
        action: Action,
    ) -> Result<Arc<dyn ObjectApprover>, AuthorizationError> {
        let rules: Vec<Entity> = self
            .rules
            .iter()
            .filter(|acl| acl.action == action && subject_matches(&acl.principals, principal))
            .map(|acl| acl.objects.clone())
            .collect();

        debug!(?action, principal = ?principal.and_then(Principal::value), rules = rules.len(), "Built ACL approver");

        Ok(Arc::new(AclApprover {
            rules,
            permissive: self.permissive,
        }))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(hostname: &str) -> Object {
        Object::Machine(MachineId::hostname(hostname))
    }

    fn authorizer(rules: Vec<Acl>, permissive: bool) -> Arc<dyn Authorizer> {
        Arc::new(LocalAuthorizer::new(Acls { permissive: None, rules }, permissive))
    }

    #[tokio::test]
    async fn test_no_authorizer_approves_everything() {
        let approvers = ObjectApprovers::create(None, None, &[Action::StartMaintenance])
            .await
            .unwrap();
        assert!(approvers.approved(Action::StartMaintenance, &machine("a")));
        assert!(!approvers.approved(Action::StopMaintenance, &machine("a")));
    }

    #[tokio::test]
    async fn test_first_matching_rule_decides() {
        let rules = vec![
            Acl {
                principals: Entity::Some(vec!["ops".into()]),
                action: Action::UpdateMaintenanceSchedule,
                objects: Entity::Some(vec!["a.example".into()]),
            },
            Acl {
                principals: Entity::Any,
                action: Action::UpdateMaintenanceSchedule,
                objects: Entity::None,
            },
        ];
        let approvers = ObjectApprovers::create(
            Some(authorizer(rules, true)),
            Some(Principal::new("ops")),
            &[Action::UpdateMaintenanceSchedule],
        )
        .await
        .unwrap();

        assert!(approvers.approved(Action::UpdateMaintenanceSchedule, &machine("a.example")));
        assert!(!approvers.approved(Action::UpdateMaintenanceSchedule, &machine("b.example")));
    }

    #[tokio::test]
    async fn test_permissive_fallback() {
        let strict = ObjectApprovers::create(
            Some(authorizer(Vec::new(), false)),
            Some(Principal::new("ops")),
            &[Action::ViewRole],
        )
        .await
        .unwrap();
        assert!(!strict.approved(Action::ViewRole, &Object::Role("web".into())));

        let permissive = ObjectApprovers::create(
            Some(authorizer(Vec::new(), true)),
            None,
            &[Action::ViewRole],
        )
        .await
        .unwrap();
        assert!(permissive.approved(Action::ViewRole, &Object::Role("web".into())));
    }

    #[tokio::test]
    async fn test_none_principal_entity_matches_anonymous() {
        let rules = vec![Acl {
            principals: Entity::None,
            action: Action::MarkAgentGone,
            objects: Entity::None,
        }];
        let auth = authorizer(rules, true);

        let anonymous = ObjectApprovers::create(Some(auth.clone()), None, &[Action::MarkAgentGone])
            .await
            .unwrap();
        assert!(!anonymous.approved_any(Action::MarkAgentGone));

        let named = ObjectApprovers::create(
            Some(auth),
            Some(Principal::new("ops")),
            &[Action::MarkAgentGone],
        )
        .await
        .unwrap();
        assert!(named.approved_any(Action::MarkAgentGone));
    }

    #[test]
    fn test_acls_json() {
        let json = r#"{
            "permissive": false,
            "rules": [
                {"principals": {"some": ["ops"]}, "action": "START_MAINTENANCE", "objects": "any"}
            ]
        }"#;
        let acls: Acls = serde_json::from_str(json).unwrap();
        assert_eq!(acls.permissive, Some(false));
        assert_eq!(acls.rules[0].principals, Entity::Some(vec!["ops".to_string()]));
        assert_eq!(acls.rules[0].objects, Entity::Any);
    }
}
