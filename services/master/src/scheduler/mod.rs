//! Scheduler API: calls, events and subscription handles.
//!
//! [`RawCall`] is the flat wire shape, one optional payload per call type.
//! [`validation::validate`] turns it into a [`Call`] whose body carries
//! exactly the payload its type needs.

pub mod validation;

use chrono::{DateTime, Utc};
use corral_id::{AgentId, ExecutorId, FrameworkId, OfferId, OperationId, ResourceProviderId, StreamId, TaskId};
use serde::{Deserialize, Serialize};

use crate::operation::{Operation, OperationStatus};
use crate::queue::Queue;
use crate::resources::Resources;
use crate::state::Offer;

// =============================================================================
// Shared payload types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<FrameworkId>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Offer refusal filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Filters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refuse_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub name: String,
    pub agent_id: AgentId,
    pub resources: Resources,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<ExecutorId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    pub resources: Resources,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Staging,
    Running,
    Finished,
    Failed,
    Killed,
    Error,
    Lost,
    Dropped,
    Unreachable,
    Gone,
    GoneByOperator,
    Unknown,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Finished
                | TaskState::Failed
                | TaskState::Killed
                | TaskState::Error
                | TaskState::Lost
                | TaskState::Dropped
                | TaskState::Gone
                | TaskState::GoneByOperator
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<uuid::Uuid>,
    pub timestamp: DateTime<Utc>,
}

impl TaskStatus {
    /// Status generated by the master rather than reported by an agent.
    pub fn master_generated(
        task_id: TaskId,
        agent_id: Option<AgentId>,
        state: TaskState,
        message: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            agent_id,
            state,
            message: Some(message.into()),
            uuid: None,
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Raw call
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallType {
    Subscribe,
    Teardown,
    Accept,
    Decline,
    AcceptInverseOffers,
    DeclineInverseOffers,
    Revive,
    Suppress,
    Kill,
    Shutdown,
    Acknowledge,
    AcknowledgeOperationStatus,
    Reconcile,
    ReconcileOperations,
    Message,
    Request,
    #[serde(other)]
    Unknown,
}

/// Only subscriptions hold the connection open.
pub fn supports_streaming(call_type: CallType) -> bool {
    call_type == CallType::Subscribe
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscribePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework_info: Option<FrameworkInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Accept {
    #[serde(default)]
    pub offer_ids: Vec<OfferId>,
    #[serde(default)]
    pub operations: Vec<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Filters>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Decline {
    #[serde(default)]
    pub offer_ids: Vec<OfferId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Filters>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InverseOffers {
    #[serde(default)]
    pub inverse_offer_ids: Vec<OfferId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Filters>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roles {
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kill {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shutdown {
    pub executor_id: ExecutorId,
    pub agent_id: AgentId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgePayload {
    pub agent_id: AgentId,
    pub task_id: TaskId,
    pub uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgeOperationStatusPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_provider_id: Option<ResourceProviderId>,
    pub operation_id: OperationId,
    pub uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileTask {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconcile {
    #[serde(default)]
    pub tasks: Vec<ReconcileTask>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOperation {
    pub operation_id: OperationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOperations {
    #[serde(default)]
    pub operations: Vec<ReconcileOperation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkMessage {
    pub agent_id: AgentId,
    pub executor_id: ExecutorId,
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub requests: Vec<ResourceRequest>,
}

/// Wire shape of a scheduler call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework_id: Option<FrameworkId>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<CallType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<SubscribePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept: Option<Accept>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decline: Option<Decline>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept_inverse_offers: Option<InverseOffers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decline_inverse_offers: Option<InverseOffers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revive: Option<Roles>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppress: Option<Roles>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill: Option<Kill>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<Shutdown>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledge: Option<AcknowledgePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledge_operation_status: Option<AcknowledgeOperationStatusPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconcile: Option<Reconcile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconcile_operations: Option<ReconcileOperations>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<FrameworkMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Request>,
}

// =============================================================================
// Validated call
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub framework_id: Option<FrameworkId>,
    pub body: CallBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallBody {
    Subscribe {
        framework_info: FrameworkInfo,
    },
    Teardown,
    Accept(Accept),
    Decline(Decline),
    AcceptInverseOffers(InverseOffers),
    DeclineInverseOffers(InverseOffers),
    Revive(Roles),
    Suppress(Roles),
    Kill(Kill),
    Shutdown(Shutdown),
    Acknowledge {
        agent_id: AgentId,
        task_id: TaskId,
        uuid: uuid::Uuid,
    },
    AcknowledgeOperationStatus {
        agent_id: AgentId,
        resource_provider_id: ResourceProviderId,
        operation_id: OperationId,
        uuid: uuid::Uuid,
    },
    Reconcile(Reconcile),
    ReconcileOperations(ReconcileOperations),
    Message(FrameworkMessage),
    Request(Request),
    Unknown,
}

impl CallBody {
    pub fn call_type(&self) -> CallType {
        match self {
            CallBody::Subscribe { .. } => CallType::Subscribe,
            CallBody::Teardown => CallType::Teardown,
            CallBody::Accept(_) => CallType::Accept,
            CallBody::Decline(_) => CallType::Decline,
            CallBody::AcceptInverseOffers(_) => CallType::AcceptInverseOffers,
            CallBody::DeclineInverseOffers(_) => CallType::DeclineInverseOffers,
            CallBody::Revive(_) => CallType::Revive,
            CallBody::Suppress(_) => CallType::Suppress,
            CallBody::Kill(_) => CallType::Kill,
            CallBody::Shutdown(_) => CallType::Shutdown,
            CallBody::Acknowledge { .. } => CallType::Acknowledge,
            CallBody::AcknowledgeOperationStatus { .. } => CallType::AcknowledgeOperationStatus,
            CallBody::Reconcile(_) => CallType::Reconcile,
            CallBody::ReconcileOperations(_) => CallType::ReconcileOperations,
            CallBody::Message(_) => CallType::Message,
            CallBody::Request(_) => CallType::Request,
            CallBody::Unknown => CallType::Unknown,
        }
    }
}

// =============================================================================
// Events and responses
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    Subscribed {
        framework_id: FrameworkId,
        heartbeat_interval_secs: f64,
    },
    Offers {
        offers: Vec<Offer>,
    },
    InverseOffers {
        inverse_offers: Vec<crate::state::InverseOffer>,
    },
    Rescind {
        offer_id: OfferId,
    },
    RescindInverseOffer {
        inverse_offer_id: OfferId,
    },
    Update {
        status: TaskStatus,
    },
    UpdateOperationStatus {
        status: OperationStatus,
    },
    Message {
        agent_id: AgentId,
        executor_id: ExecutorId,
        data: String,
    },
    Failure {
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<AgentId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        executor_id: Option<ExecutorId>,
    },
    Error {
        message: String,
    },
    Heartbeat,
}

/// Live subscription handed back by SUBSCRIBE.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub framework_id: FrameworkId,
    pub stream_id: StreamId,
    pub events: Queue<Event>,
}

#[derive(Debug)]
pub enum SchedulerResponse {
    Accepted,
    Subscribed(Subscription),
    OperationStatuses(Vec<OperationStatus>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_call_type_deserializes() {
        let raw: RawCall = serde_json::from_str(r#"{"type": "SOMETHING_NEW"}"#).unwrap();
        assert_eq!(raw.call_type, Some(CallType::Unknown));
    }

    #[test]
    fn test_missing_type_is_none() {
        let raw: RawCall = serde_json::from_str("{}").unwrap();
        assert_eq!(raw.call_type, None);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(Event::Heartbeat).unwrap();
        assert_eq!(json["type"], "HEARTBEAT");
    }

    #[test]
    fn test_only_subscribe_streams() {
        assert!(supports_streaming(CallType::Subscribe));
        assert!(!supports_streaming(CallType::Reconcile));
    }
}
