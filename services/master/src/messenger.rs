//! Outbound messages to agents.

use std::sync::{Mutex, MutexGuard};

use corral_id::{AgentId, ExecutorId, FrameworkId, OperationId, TaskId};
use serde::Serialize;
use tracing::info;

use crate::operation::Operation;
use crate::scheduler::TaskInfo;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentMessage {
    Shutdown {
        message: String,
    },
    ApplyOperation {
        operation_id: OperationId,
        framework_id: Option<FrameworkId>,
        operation: Operation,
    },
    RunTask {
        framework_id: FrameworkId,
        task: TaskInfo,
    },
    KillTask {
        framework_id: FrameworkId,
        task_id: TaskId,
    },
    ShutdownExecutor {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
    },
    ShutdownFramework {
        framework_id: FrameworkId,
    },
    StatusUpdateAcknowledgement {
        framework_id: FrameworkId,
        task_id: TaskId,
        uuid: uuid::Uuid,
    },
    OperationStatusAcknowledgement {
        framework_id: FrameworkId,
        operation_id: OperationId,
        uuid: uuid::Uuid,
    },
    FrameworkMessage {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: String,
    },
}

impl AgentMessage {
    pub fn name(&self) -> &'static str {
        match self {
            AgentMessage::Shutdown { .. } => "SHUTDOWN",
            AgentMessage::ApplyOperation { .. } => "APPLY_OPERATION",
            AgentMessage::RunTask { .. } => "RUN_TASK",
            AgentMessage::KillTask { .. } => "KILL_TASK",
            AgentMessage::ShutdownExecutor { .. } => "SHUTDOWN_EXECUTOR",
            AgentMessage::ShutdownFramework { .. } => "SHUTDOWN_FRAMEWORK",
            AgentMessage::StatusUpdateAcknowledgement { .. } => "STATUS_UPDATE_ACKNOWLEDGEMENT",
            AgentMessage::OperationStatusAcknowledgement { .. } => {
                "OPERATION_STATUS_ACKNOWLEDGEMENT"
            }
            AgentMessage::FrameworkMessage { .. } => "FRAMEWORK_MESSAGE",
        }
    }
}

/// Fire-and-forget delivery to agents. Delivery may be lost.
pub trait AgentMessenger: Send + Sync + 'static {
    fn send(&self, agent_id: AgentId, message: AgentMessage);
}

/// Messenger that logs and keeps every message in memory.
#[derive(Default)]
pub struct LocalMessenger {
    sent: Mutex<Vec<(AgentId, AgentMessage)>>,
}

impl LocalMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(AgentId, AgentMessage)>> {
        self.sent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn sent(&self) -> Vec<(AgentId, AgentMessage)> {
        self.lock().clone()
    }

    pub fn sent_to(&self, agent_id: AgentId) -> Vec<AgentMessage> {
        self.lock()
            .iter()
            .filter(|(id, _)| *id == agent_id)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl AgentMessenger for LocalMessenger {
    fn send(&self, agent_id: AgentId, message: AgentMessage) {
        info!(agent_id = %agent_id, message = message.name(), "Sending message to agent");
        self.lock().push((agent_id, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sent_to_filters_by_agent() {
        let messenger = LocalMessenger::new();
        let (a, b) = (AgentId::new(), AgentId::new());
        messenger.send(a, AgentMessage::Shutdown { message: "down".into() });
        messenger.send(b, AgentMessage::Shutdown { message: "down".into() });
        messenger.send(a, AgentMessage::ShutdownFramework { framework_id: FrameworkId::new() });

        assert_eq!(messenger.sent().len(), 3);
        assert_eq!(messenger.sent_to(a).len(), 2);
        assert_eq!(messenger.sent_to(b)[0].name(), "SHUTDOWN");
    }
}
