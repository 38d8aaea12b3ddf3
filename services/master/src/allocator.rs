//! Allocator interface.
//!
//! The allocator owns resource accounting and offer generation. Offers are
//! handed to the master through `MasterHandle::offer`; the master in turn
//! notifies the allocator of lifecycle changes and returns resources to it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corral_id::{AgentId, FrameworkId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::maintenance::Unavailability;
use crate::operation::Operation;
use crate::resources::Resources;
use crate::scheduler::{Filters, ResourceRequest};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("unknown agent {0}")]
    UnknownAgent(AgentId),

    #[error("allocator rejected update: {0}")]
    Rejected(String),
}

/// A framework's answer to an inverse offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InverseOfferState {
    Unknown,
    Accept,
    Decline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InverseOfferStatus {
    pub state: InverseOfferState,
    pub framework_id: FrameworkId,
    pub timestamp: DateTime<Utc>,
}

pub type InverseOfferStatuses = HashMap<AgentId, HashMap<FrameworkId, InverseOfferStatus>>;

#[async_trait]
pub trait Allocator: Send + Sync + 'static {
    fn add_framework(&self, framework_id: FrameworkId, roles: &[String]);

    fn remove_framework(&self, framework_id: FrameworkId);

    fn add_agent(&self, agent_id: AgentId, total: &Resources, unavailability: Option<Unavailability>);

    fn remove_agent(&self, agent_id: AgentId);

    /// Returns resources to the unallocated pool, optionally withholding
    /// them from the framework for the filter's refusal period.
    fn recover_resources(
        &self,
        framework_id: FrameworkId,
        agent_id: AgentId,
        resources: &Resources,
        filters: Option<Filters>,
    );

    /// Applies operations to the agent's available resources.
    async fn update_available(
        &self,
        agent_id: AgentId,
        operations: Vec<Operation>,
    ) -> Result<(), AllocatorError>;

    async fn inverse_offer_statuses(&self) -> Result<InverseOfferStatuses, AllocatorError>;

    fn update_unavailability(&self, agent_id: AgentId, unavailability: Option<Unavailability>);

    fn update_inverse_offer(
        &self,
        agent_id: AgentId,
        framework_id: FrameworkId,
        state: InverseOfferState,
        filters: Option<Filters>,
    );

    fn revive(&self, framework_id: FrameworkId, roles: &[String]);

    fn suppress(&self, framework_id: FrameworkId, roles: &[String]);

    fn request_resources(&self, framework_id: FrameworkId, requests: &[ResourceRequest]);
}

// =============================================================================
// Local allocator
// =============================================================================

/// Notification recorded by [`LocalAllocator`].
#[derive(Debug, Clone, PartialEq)]
pub enum AllocatorCall {
    AddFramework { framework_id: FrameworkId },
    RemoveFramework { framework_id: FrameworkId },
    AddAgent { agent_id: AgentId, total: Resources },
    RemoveAgent { agent_id: AgentId },
    RecoverResources {
        framework_id: FrameworkId,
        agent_id: AgentId,
        resources: Resources,
        refuse_seconds: Option<f64>,
    },
    UpdateAvailable { agent_id: AgentId, operations: Vec<Operation> },
    UpdateUnavailability { agent_id: AgentId, unavailability: Option<Unavailability> },
    UpdateInverseOffer { agent_id: AgentId, framework_id: FrameworkId, state: InverseOfferState },
    Revive { framework_id: FrameworkId, roles: Vec<String> },
    Suppress { framework_id: FrameworkId, roles: Vec<String> },
    RequestResources { framework_id: FrameworkId, count: usize },
}

#[derive(Default)]
struct Inner {
    totals: HashMap<AgentId, Resources>,
    statuses: InverseOfferStatuses,
    calls: Vec<AllocatorCall>,
    fail_updates: usize,
}

/// In-process allocator that keeps per-agent totals and records every call.
/// It generates no offers of its own.
#[derive(Default)]
pub struct LocalAllocator {
    inner: Mutex<Inner>,
}

impl LocalAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every call received, in order.
    pub fn calls(&self) -> Vec<AllocatorCall> {
        self.lock().calls.clone()
    }

    /// Makes the next `update_available` fail.
    pub fn fail_next_update(&self) {
        self.lock().fail_updates += 1;
    }

    pub fn total(&self, agent_id: AgentId) -> Option<Resources> {
        self.lock().totals.get(&agent_id).cloned()
    }
}

#[async_trait]
impl Allocator for LocalAllocator {
    fn add_framework(&self, framework_id: FrameworkId, roles: &[String]) {
        info!(framework_id = %framework_id, ?roles, "Allocator added framework");
        self.lock().calls.push(AllocatorCall::AddFramework { framework_id });
    }

    fn remove_framework(&self, framework_id: FrameworkId) {
        let mut inner = self.lock();
        for statuses in inner.statuses.values_mut() {
            statuses.remove(&framework_id);
        }
        inner.calls.push(AllocatorCall::RemoveFramework { framework_id });
    }

    fn add_agent(&self, agent_id: AgentId, total: &Resources, unavailability: Option<Unavailability>) {
        let mut inner = self.lock();
        inner.totals.insert(agent_id, total.clone());
        inner.calls.push(AllocatorCall::AddAgent {
            agent_id,
            total: total.clone(),
        });
        if unavailability.is_some() {
            inner.calls.push(AllocatorCall::UpdateUnavailability {
                agent_id,
                unavailability,
            });
        }
    }

    fn remove_agent(&self, agent_id: AgentId) {
        let mut inner = self.lock();
        inner.totals.remove(&agent_id);
        inner.statuses.remove(&agent_id);
        inner.calls.push(AllocatorCall::RemoveAgent { agent_id });
    }

    fn recover_resources(
        &self,
        framework_id: FrameworkId,
        agent_id: AgentId,
        resources: &Resources,
        filters: Option<Filters>,
    ) {
        debug!(
            framework_id = %framework_id,
            agent_id = %agent_id,
            resources = %resources,
            "Recovered resources"
        );
        self.lock().calls.push(AllocatorCall::RecoverResources {
            framework_id,
            agent_id,
            resources: resources.clone(),
            refuse_seconds: filters.and_then(|f| f.refuse_seconds),
        });
    }

    async fn update_available(
        &self,
        agent_id: AgentId,
        operations: Vec<Operation>,
    ) -> Result<(), AllocatorError> {
        let mut inner = self.lock();
        inner.calls.push(AllocatorCall::UpdateAvailable {
            agent_id,
            operations: operations.clone(),
        });
        if inner.fail_updates > 0 {
            inner.fail_updates -= 1;
            return Err(AllocatorError::Rejected("injected failure".to_string()));
        }

        let total = inner
            .totals
            .get(&agent_id)
            .cloned()
            .ok_or(AllocatorError::UnknownAgent(agent_id))?;
        let mut updated = total;
        for operation in &operations {
            updated = updated
                .apply(operation)
                .map_err(|e| AllocatorError::Rejected(e.to_string()))?;
        }
        inner.totals.insert(agent_id, updated);
        Ok(())
    }

    async fn inverse_offer_statuses(&self) -> Result<InverseOfferStatuses, AllocatorError> {
        Ok(self.lock().statuses.clone())
    }

    fn update_unavailability(&self, agent_id: AgentId, unavailability: Option<Unavailability>) {
        let mut inner = self.lock();
        if unavailability.is_none() {
            inner.statuses.remove(&agent_id);
        }
        inner.calls.push(AllocatorCall::UpdateUnavailability {
            agent_id,
            unavailability,
        });
    }

    fn update_inverse_offer(
        &self,
        agent_id: AgentId,
        framework_id: FrameworkId,
        state: InverseOfferState,
        _filters: Option<Filters>,
    ) {
        let mut inner = self.lock();
        inner.statuses.entry(agent_id).or_default().insert(
            framework_id,
            InverseOfferStatus {
                state,
                framework_id,
                timestamp: Utc::now(),
            },
        );
        inner.calls.push(AllocatorCall::UpdateInverseOffer {
            agent_id,
            framework_id,
            state,
        });
    }

    fn revive(&self, framework_id: FrameworkId, roles: &[String]) {
        self.lock().calls.push(AllocatorCall::Revive {
            framework_id,
            roles: roles.to_vec(),
        });
    }

    fn suppress(&self, framework_id: FrameworkId, roles: &[String]) {
        self.lock().calls.push(AllocatorCall::Suppress {
            framework_id,
            roles: roles.to_vec(),
        });
    }

    fn request_resources(&self, framework_id: FrameworkId, requests: &[ResourceRequest]) {
        self.lock().calls.push(AllocatorCall::RequestResources {
            framework_id,
            count: requests.len(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{Reservation, Resource};

    #[tokio::test]
    async fn test_update_available_applies_operations() {
        let allocator = LocalAllocator::new();
        let agent_id = AgentId::new();
        allocator.add_agent(agent_id, &vec![Resource::scalar("cpus", 4.0)].into(), None);

        let reserved = Resource::scalar("cpus", 2.0).with_reservation(Reservation::dynamic("web", None));
        allocator
            .update_available(
                agent_id,
                vec![Operation::Reserve {
                    resources: vec![reserved.clone()].into(),
                }],
            )
            .await
            .unwrap();

        let expected: Resources = vec![Resource::scalar("cpus", 2.0), reserved].into();
        assert_eq!(allocator.total(agent_id), Some(expected));
    }

    #[tokio::test]
    async fn test_update_available_unknown_agent() {
        let allocator = LocalAllocator::new();
        let agent_id = AgentId::new();
        let result = allocator.update_available(agent_id, Vec::new()).await;
        assert_eq!(result, Err(AllocatorError::UnknownAgent(agent_id)));
    }

    #[tokio::test]
    async fn test_inverse_offer_statuses_tracked() {
        let allocator = LocalAllocator::new();
        let agent_id = AgentId::new();
        let framework_id = FrameworkId::new();
        allocator.update_inverse_offer(agent_id, framework_id, InverseOfferState::Accept, None);

        let statuses = allocator.inverse_offer_statuses().await.unwrap();
        assert_eq!(statuses[&agent_id][&framework_id].state, InverseOfferState::Accept);

        allocator.update_unavailability(agent_id, None);
        assert!(allocator.inverse_offer_statuses().await.unwrap().is_empty());
    }

    #[test]
    fn test_recover_records_refusal() {
        let allocator = LocalAllocator::new();
        let (framework_id, agent_id) = (FrameworkId::new(), AgentId::new());
        allocator.recover_resources(
            framework_id,
            agent_id,
            &vec![Resource::scalar("cpus", 1.0)].into(),
            Some(Filters {
                refuse_seconds: Some(5.0),
            }),
        );
        assert!(matches!(
            allocator.calls().as_slice(),
            [AllocatorCall::RecoverResources { refuse_seconds: Some(s), .. }] if *s == 5.0
        ));
    }
}
