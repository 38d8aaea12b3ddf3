//! Scheduler API flows against a running master.

mod common;

use chrono::Utc;
use common::{eventually, resources, subscribe_call, within, Cluster, Framework};
use corral_id::{AgentId, OperationId, StreamId, TaskId};
use corral_master::allocator::AllocatorCall;
use corral_master::messenger::AgentMessage;
use corral_master::operation::{Operation, OperationState};
use corral_master::operator::{self, OperatorResponse, Teardown};
use corral_master::resources::{Reservation, Resource, Resources};
use corral_master::scheduler::{
    Accept, CallType, Decline, Event, Filters, FrameworkInfo, Kill, RawCall, Reconcile,
    ReconcileOperation, ReconcileOperations, ReconcileTask, SchedulerResponse, TaskInfo,
    TaskState, TaskStatus,
};
use corral_master::MasterError;

fn call(call_type: CallType) -> RawCall {
    RawCall {
        call_type: Some(call_type),
        ..Default::default()
    }
}

fn task(id: &str, agent_id: AgentId, resources: Resources) -> TaskInfo {
    TaskInfo {
        task_id: TaskId::new(id).unwrap(),
        name: id.to_string(),
        agent_id,
        resources,
        executor_id: None,
    }
}

fn accept(offer_ids: Vec<corral_id::OfferId>, operations: Vec<Operation>) -> RawCall {
    RawCall {
        accept: Some(Accept {
            offer_ids,
            operations,
            filters: Some(Filters {
                refuse_seconds: Some(30.0),
            }),
        }),
        ..call(CallType::Accept)
    }
}

fn reconcile(tasks: Vec<ReconcileTask>) -> RawCall {
    RawCall {
        reconcile: Some(Reconcile { tasks }),
        ..call(CallType::Reconcile)
    }
}

async fn next_status(framework: &Framework) -> TaskStatus {
    match framework.next_event().await {
        Event::Update { status } => status,
        other => panic!("expected a status update, got {other:?}"),
    }
}

fn status(task_id: &str, state: TaskState) -> TaskStatus {
    TaskStatus {
        task_id: TaskId::new(task_id).unwrap(),
        agent_id: None,
        state,
        message: None,
        uuid: Some(uuid::Uuid::new_v4()),
        timestamp: Utc::now(),
    }
}

// =============================================================================
// Subscription
// =============================================================================

#[tokio::test]
async fn test_subscribe_registers_framework() {
    let cluster = Cluster::start();
    let framework = cluster.subscribe("batch", &["web"]).await;

    assert!(cluster.allocator.calls().contains(&AllocatorCall::AddFramework {
        framework_id: framework.id,
    }));
}

#[tokio::test]
async fn test_calls_require_current_stream() {
    let cluster = Cluster::start();
    let framework = cluster.subscribe("batch", &["web"]).await;

    let raw = RawCall {
        framework_id: Some(framework.id),
        ..call(CallType::Revive)
    };
    let err = cluster
        .master
        .scheduler_call(raw.clone(), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, MasterError::BadRequest(_)));

    let err = cluster
        .master
        .scheduler_call(raw.clone(), None, Some(StreamId::random()))
        .await
        .unwrap_err();
    assert!(matches!(err, MasterError::BadRequest(_)));

    let response = cluster.call(&framework, call(CallType::Revive)).await.unwrap();
    assert!(matches!(response, SchedulerResponse::Accepted));
    assert!(cluster.allocator.calls().contains(&AllocatorCall::Revive {
        framework_id: framework.id,
        roles: vec!["web".to_string()],
    }));
}

#[tokio::test]
async fn test_calls_without_framework_id_are_rejected() {
    let cluster = Cluster::start();
    let err = cluster
        .master
        .scheduler_call(call(CallType::Revive), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, MasterError::BadRequest(_)));
}

#[tokio::test]
async fn test_resubscribe_replaces_stream() {
    let cluster = Cluster::start();
    let framework = cluster.subscribe("batch", &["web"]).await;

    let info = FrameworkInfo {
        id: Some(framework.id),
        name: "batch".to_string(),
        principal: None,
        roles: vec!["web".to_string()],
    };
    let response = cluster
        .master
        .scheduler_call(subscribe_call(info), None, None)
        .await
        .unwrap();
    let SchedulerResponse::Subscribed(subscription) = response else {
        panic!("expected a subscription");
    };
    assert_eq!(subscription.framework_id, framework.id);
    assert_ne!(subscription.stream_id, framework.stream_id);
    assert!(framework.events.is_closed());

    let err = cluster
        .call(&framework, call(CallType::Revive))
        .await
        .unwrap_err();
    assert!(matches!(err, MasterError::BadRequest(_)));
}

#[tokio::test]
async fn test_teardown_forgets_framework() {
    let cluster = Cluster::start();
    let framework = cluster.subscribe("batch", &["web"]).await;

    let response = cluster.call(&framework, call(CallType::Teardown)).await.unwrap();
    assert!(matches!(response, SchedulerResponse::Accepted));
    assert!(framework.events.is_closed());
    assert!(cluster.allocator.calls().contains(&AllocatorCall::RemoveFramework {
        framework_id: framework.id,
    }));

    let info = FrameworkInfo {
        id: Some(framework.id),
        name: "batch".to_string(),
        principal: None,
        roles: vec![],
    };
    let err = cluster
        .master
        .scheduler_call(subscribe_call(info), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, MasterError::Forbidden(_)));
}

#[tokio::test]
async fn test_operator_teardown() {
    let cluster = Cluster::start();
    let framework = cluster.subscribe("batch", &["web"]).await;

    let teardown = |framework_id| operator::RawCall {
        call_type: Some(operator::CallType::Teardown),
        teardown: Some(Teardown { framework_id }),
        ..Default::default()
    };
    let response = cluster.operator(teardown(framework.id), None).await.unwrap();
    assert!(matches!(response, OperatorResponse::Accepted));
    assert!(framework.events.is_closed());

    let err = cluster.operator(teardown(framework.id), None).await.unwrap_err();
    assert!(matches!(err, MasterError::NotFound(_)));
}

// =============================================================================
// Offers and tasks
// =============================================================================

#[tokio::test]
async fn test_accept_launches_task() {
    let cluster = Cluster::start();
    let agent_id = cluster.register_agent("a", resources(4.0, 1024.0)).await;
    let framework = cluster.subscribe("batch", &["web"]).await;
    let offer = cluster
        .offer(&framework, agent_id, resources(2.0, 512.0))
        .await;

    let launch = Operation::Launch {
        task_infos: vec![task("t1", agent_id, resources(1.0, 128.0))],
    };
    let response = cluster
        .call(&framework, accept(vec![offer.id], vec![launch]))
        .await
        .unwrap();
    assert!(matches!(response, SchedulerResponse::Accepted));

    let sent = cluster.messenger.sent_to(agent_id);
    assert!(sent.iter().any(|message| matches!(
        message,
        AgentMessage::RunTask { task, .. } if task.task_id.as_str() == "t1"
    )));
    assert!(cluster.allocator.calls().contains(&AllocatorCall::RecoverResources {
        framework_id: framework.id,
        agent_id,
        resources: resources(1.0, 384.0).allocate("web"),
        refuse_seconds: Some(30.0),
    }));

    // The task now holds resources, so the offer cannot be made again.
    let err = cluster
        .master
        .offer(framework.id, agent_id, resources(4.0, 1024.0))
        .await
        .unwrap_err();
    assert!(matches!(err, MasterError::Conflict(_)));

    cluster
        .master
        .status_update(agent_id, status("t1", TaskState::Running))
        .await
        .unwrap();
    assert_eq!(next_status(&framework).await.state, TaskState::Running);

    cluster
        .master
        .status_update(agent_id, status("t1", TaskState::Finished))
        .await
        .unwrap();
    assert_eq!(next_status(&framework).await.state, TaskState::Finished);
    cluster
        .master
        .offer(framework.id, agent_id, resources(4.0, 1024.0))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_accept_holds_offered_resources_while_committing() {
    let cluster = Cluster::start();
    let agent_id = cluster.register_agent("a", resources(4.0, 1024.0)).await;
    let batch = cluster.subscribe("batch", &["web"]).await;
    let serve = cluster.subscribe("serve", &["web"]).await;
    let offer = cluster.offer(&batch, agent_id, resources(4.0, 1024.0)).await;

    let reserve = Operation::Reserve {
        resources: Resources::from(vec![Resource::scalar("cpus", 1.0)
            .with_reservation(Reservation::dynamic("web", None))]),
    };
    let raw = RawCall {
        framework_id: Some(batch.id),
        ..accept(vec![offer.id], vec![reserve])
    };

    cluster.registry.pause();
    let master = cluster.master.clone();
    let stream_id = batch.stream_id;
    let pending =
        tokio::spawn(async move { master.scheduler_call(raw, None, Some(stream_id)).await });
    eventually(|| cluster.registry.blocked() == 1).await;

    // What the reservation does not consume still belongs to the ACCEPT.
    let err = cluster
        .master
        .offer(serve.id, agent_id, resources(3.0, 1024.0))
        .await
        .unwrap_err();
    assert!(matches!(err, MasterError::Conflict(_)));
    let err = cluster
        .master
        .offer(
            serve.id,
            agent_id,
            Resources::from(vec![Resource::scalar("cpus", 0.5)]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MasterError::Conflict(_)));

    cluster.registry.resume();
    let response = within(pending).await.unwrap().unwrap();
    assert!(matches!(response, SchedulerResponse::Accepted));

    // Once the ACCEPT finishes its leftovers go back to the allocator.
    cluster
        .master
        .offer(serve.id, agent_id, resources(3.0, 1024.0))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_non_positive_quantities_are_rejected() {
    let cluster = Cluster::start();
    let negative = Resources::from(vec![Resource::scalar("cpus", -2.0)]);

    let err = cluster
        .master
        .register_agent(None, common::agent_info("bad", negative.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, MasterError::BadRequest(_)));

    let agent_id = cluster.register_agent("a", resources(4.0, 1024.0)).await;
    let framework = cluster.subscribe("batch", &["web"]).await;
    let err = cluster
        .master
        .offer(framework.id, agent_id, negative)
        .await
        .unwrap_err();
    assert!(matches!(err, MasterError::BadRequest(_)));
    let err = cluster
        .master
        .offer(framework.id, agent_id, Resources::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MasterError::BadRequest(_)));
}

#[tokio::test]
async fn test_accept_rejects_oversized_task() {
    let cluster = Cluster::start();
    let agent_id = cluster.register_agent("a", resources(4.0, 1024.0)).await;
    let framework = cluster.subscribe("batch", &["web"]).await;
    let offer = cluster.offer(&framework, agent_id, resources(1.0, 128.0)).await;

    let launch = Operation::Launch {
        task_infos: vec![task("big", agent_id, resources(2.0, 128.0))],
    };
    cluster
        .call(&framework, accept(vec![offer.id], vec![launch]))
        .await
        .unwrap();

    let status = next_status(&framework).await;
    assert_eq!(status.task_id.as_str(), "big");
    assert_eq!(status.state, TaskState::Error);
    assert!(cluster.messenger.sent_to(agent_id).is_empty());
}

#[tokio::test]
async fn test_accept_stale_offer_drops_tasks() {
    let cluster = Cluster::start();
    let agent_id = cluster.register_agent("a", resources(4.0, 1024.0)).await;
    let framework = cluster.subscribe("batch", &["web"]).await;

    let launch = Operation::Launch {
        task_infos: vec![task("t1", agent_id, resources(1.0, 128.0))],
    };
    let response = cluster
        .call(&framework, accept(vec![corral_id::OfferId::new()], vec![launch]))
        .await
        .unwrap();
    assert!(matches!(response, SchedulerResponse::Accepted));

    let status = next_status(&framework).await;
    assert_eq!(status.state, TaskState::Dropped);
    assert!(cluster.messenger.sent_to(agent_id).is_empty());
}

#[tokio::test]
async fn test_decline_returns_resources_with_filter() {
    let cluster = Cluster::start();
    let agent_id = cluster.register_agent("a", resources(4.0, 1024.0)).await;
    let framework = cluster.subscribe("batch", &["web"]).await;
    let offer = cluster.offer(&framework, agent_id, resources(2.0, 512.0)).await;

    let raw = RawCall {
        decline: Some(Decline {
            offer_ids: vec![offer.id],
            filters: Some(Filters {
                refuse_seconds: Some(60.0),
            }),
        }),
        ..call(CallType::Decline)
    };
    cluster.call(&framework, raw).await.unwrap();

    assert!(cluster.allocator.calls().contains(&AllocatorCall::RecoverResources {
        framework_id: framework.id,
        agent_id,
        resources: offer.resources,
        refuse_seconds: Some(60.0),
    }));
}

#[tokio::test]
async fn test_kill_unknown_task() {
    let cluster = Cluster::start();
    let framework = cluster.subscribe("batch", &["web"]).await;

    let raw = RawCall {
        kill: Some(Kill {
            task_id: TaskId::new("ghost").unwrap(),
            agent_id: None,
        }),
        ..call(CallType::Kill)
    };
    cluster.call(&framework, raw).await.unwrap();
    assert_eq!(next_status(&framework).await.state, TaskState::Unknown);
}

// =============================================================================
// Reconciliation
// =============================================================================

#[tokio::test]
async fn test_explicit_reconciliation() {
    let cluster = Cluster::start();
    let agent_id = cluster.register_agent("a", resources(4.0, 1024.0)).await;
    let framework = cluster.subscribe("batch", &["web"]).await;

    let tasks = vec![
        ReconcileTask {
            task_id: TaskId::new("on-live-agent").unwrap(),
            agent_id: Some(agent_id),
        },
        ReconcileTask {
            task_id: TaskId::new("nowhere").unwrap(),
            agent_id: None,
        },
    ];
    cluster.call(&framework, reconcile(tasks)).await.unwrap();

    assert_eq!(next_status(&framework).await.state, TaskState::Lost);
    assert_eq!(next_status(&framework).await.state, TaskState::Unknown);
}

#[tokio::test]
async fn test_implicit_reconciliation_reports_running_tasks() {
    let cluster = Cluster::start();
    let agent_id = cluster.register_agent("a", resources(4.0, 1024.0)).await;
    let framework = cluster.subscribe("batch", &["web"]).await;
    let offer = cluster.offer(&framework, agent_id, resources(2.0, 512.0)).await;
    let launch = Operation::Launch {
        task_infos: vec![task("t1", agent_id, resources(1.0, 128.0))],
    };
    cluster
        .call(&framework, accept(vec![offer.id], vec![launch]))
        .await
        .unwrap();

    cluster.call(&framework, reconcile(vec![])).await.unwrap();
    let status = next_status(&framework).await;
    assert_eq!(status.task_id.as_str(), "t1");
    assert_eq!(status.state, TaskState::Staging);
}

#[tokio::test]
async fn test_operation_reconciliation() {
    let cluster = Cluster::start();
    let agent_id = cluster.register_agent("a", resources(4.0, 1024.0)).await;
    let framework = cluster.subscribe("batch", &["web"]).await;

    let raw = RawCall {
        reconcile_operations: Some(ReconcileOperations {
            operations: vec![
                ReconcileOperation {
                    operation_id: OperationId::new(),
                    agent_id: Some(agent_id),
                },
                ReconcileOperation {
                    operation_id: OperationId::new(),
                    agent_id: None,
                },
            ],
        }),
        ..call(CallType::ReconcileOperations)
    };
    let SchedulerResponse::OperationStatuses(statuses) = cluster.call(&framework, raw).await.unwrap()
    else {
        panic!("expected operation statuses");
    };
    let states: Vec<_> = statuses.iter().map(|s| s.state).collect();
    assert_eq!(states, vec![OperationState::Dropped, OperationState::Unknown]);
}
