//! Scheduler calls: subscription, offer handling, task control and
//! reconciliation.
//!
//! Every call except SUBSCRIBE must come from a subscribed framework on its
//! current stream.

use std::collections::{BTreeSet, VecDeque};

use corral_id::{AgentId, FrameworkId, OperationId, StreamId};
use tracing::{debug, info, warn};

use super::{broadcast, respond, spawn_heartbeat, MasterActor, MasterMessage, Reply};
use crate::actors::{ActorContext, ActorError};
use crate::allocator::InverseOfferState;
use crate::authz::{Action, Object, ObjectApprovers, Principal};
use crate::error::MasterError;
use crate::messenger::AgentMessage;
use crate::operation::{validate_launch, Operation, OperationState, OperationStatus};
use crate::operator::OperatorEvent;
use crate::queue::Queue;
use crate::readonly;
use crate::resources::Resources;
use crate::scheduler::{
    Accept, Call, CallBody, Decline, Event, Filters, FrameworkInfo, FrameworkMessage,
    InverseOffers, Kill, Reconcile, ReconcileOperations, SchedulerResponse, Shutdown,
    Subscription, TaskInfo, TaskState, TaskStatus,
};
use crate::state::{Framework, Task};

/// Actions an ACCEPT may need approvers for.
const ACCEPT_ACTIONS: &[Action] = &[
    Action::RunTask,
    Action::ReserveResources,
    Action::UnreserveResources,
    Action::CreateVolume,
    Action::DestroyVolume,
    Action::ResizeVolume,
];

/// An ACCEPT being worked through one operation at a time.
struct AcceptState {
    framework_id: FrameworkId,
    agent_id: AgentId,
    role: String,
    /// Offered resources not yet consumed, allocated to `role`.
    pool: Resources,
    /// Pending entry on the agent that keeps `pool` from being re-offered.
    hold: OperationId,
    operations: VecDeque<Operation>,
    filters: Option<Filters>,
    approvers: ObjectApprovers,
    principal: Option<String>,
    reply_to: Reply<SchedulerResponse>,
}

impl MasterActor {
    pub(super) fn scheduler_call(
        &mut self,
        ctx: &mut ActorContext<MasterMessage>,
        call: Call,
        principal: Option<Principal>,
        stream_id: Option<StreamId>,
        reply_to: Reply<SchedulerResponse>,
    ) -> Result<(), ActorError> {
        let Call { framework_id, body } = call;
        debug!(call = ?body.call_type(), framework_id = ?framework_id, "Processing scheduler call");

        if let CallBody::Subscribe { framework_info } = body {
            return self.subscribe(ctx, principal, framework_info, reply_to);
        }

        let framework_id = match self.check_framework(framework_id, principal.as_ref(), stream_id) {
            Ok(framework_id) => framework_id,
            Err(e) => {
                respond(reply_to, Err(e));
                return Ok(());
            }
        };

        let result = match body {
            CallBody::Teardown => {
                info!(framework_id = %framework_id, "Framework requested teardown");
                self.remove_framework(framework_id);
                Ok(SchedulerResponse::Accepted)
            }
            CallBody::Accept(accept) => {
                return self.accept(ctx, framework_id, principal, accept, reply_to);
            }
            CallBody::Decline(decline) => {
                self.decline(framework_id, decline);
                Ok(SchedulerResponse::Accepted)
            }
            CallBody::AcceptInverseOffers(inverse_offers) => {
                self.answer_inverse_offers(framework_id, inverse_offers, InverseOfferState::Accept);
                Ok(SchedulerResponse::Accepted)
            }
            CallBody::DeclineInverseOffers(inverse_offers) => {
                self.answer_inverse_offers(framework_id, inverse_offers, InverseOfferState::Decline);
                Ok(SchedulerResponse::Accepted)
            }
            CallBody::Revive(roles) => {
                let roles = self.roles_or_default(framework_id, roles.roles);
                self.collaborators.allocator.revive(framework_id, &roles);
                Ok(SchedulerResponse::Accepted)
            }
            CallBody::Suppress(roles) => {
                let roles = self.roles_or_default(framework_id, roles.roles);
                self.collaborators.allocator.suppress(framework_id, &roles);
                Ok(SchedulerResponse::Accepted)
            }
            CallBody::Kill(kill) => {
                self.kill(framework_id, kill);
                Ok(SchedulerResponse::Accepted)
            }
            CallBody::Shutdown(shutdown) => {
                self.shutdown_executor(framework_id, shutdown);
                Ok(SchedulerResponse::Accepted)
            }
            CallBody::Acknowledge {
                agent_id,
                task_id,
                uuid,
            } => {
                if let Some(task) = self
                    .state
                    .frameworks
                    .get_mut(&framework_id)
                    .and_then(|f| f.tasks.get_mut(&task_id))
                {
                    if task.pending_ack == Some(uuid) {
                        task.pending_ack = None;
                    }
                }
                self.send_to_agent(
                    agent_id,
                    AgentMessage::StatusUpdateAcknowledgement {
                        framework_id,
                        task_id,
                        uuid,
                    },
                );
                Ok(SchedulerResponse::Accepted)
            }
            CallBody::AcknowledgeOperationStatus {
                agent_id,
                resource_provider_id,
                operation_id,
                uuid,
            } => {
                debug!(resource_provider_id = %resource_provider_id, "Acknowledging operation status");
                self.send_to_agent(
                    agent_id,
                    AgentMessage::OperationStatusAcknowledgement {
                        framework_id,
                        operation_id,
                        uuid,
                    },
                );
                Ok(SchedulerResponse::Accepted)
            }
            CallBody::Reconcile(reconcile) => {
                self.reconcile(framework_id, reconcile);
                Ok(SchedulerResponse::Accepted)
            }
            CallBody::ReconcileOperations(reconcile) => Ok(SchedulerResponse::OperationStatuses(
                self.reconcile_operations(framework_id, reconcile),
            )),
            CallBody::Message(message) => {
                let FrameworkMessage {
                    agent_id,
                    executor_id,
                    data,
                } = message;
                self.send_to_agent(
                    agent_id,
                    AgentMessage::FrameworkMessage {
                        framework_id,
                        executor_id,
                        data,
                    },
                );
                Ok(SchedulerResponse::Accepted)
            }
            CallBody::Request(request) => {
                self.collaborators
                    .allocator
                    .request_resources(framework_id, &request.requests);
                Ok(SchedulerResponse::Accepted)
            }
            CallBody::Subscribe { .. } | CallBody::Unknown => {
                warn!(framework_id = %framework_id, "Ignoring unknown scheduler call");
                Ok(SchedulerResponse::Accepted)
            }
        };
        respond(reply_to, result);
        Ok(())
    }

    /// Checks that a non-subscribe call comes from the subscribed framework
    /// on its current stream.
    fn check_framework(
        &self,
        framework_id: Option<FrameworkId>,
        principal: Option<&Principal>,
        stream_id: Option<StreamId>,
    ) -> Result<FrameworkId, MasterError> {
        let framework_id = framework_id.ok_or_else(|| {
            MasterError::BadRequest("Expecting 'framework_id' to be present".to_string())
        })?;
        let framework = self.state.frameworks.get(&framework_id).ok_or_else(|| {
            MasterError::BadRequest(format!("Framework {framework_id} cannot be found"))
        })?;

        let authenticated = principal.and_then(Principal::value);
        if authenticated != framework.info.principal.as_deref() {
            return Err(MasterError::BadRequest(format!(
                "Authenticated principal '{}' does not match principal '{}' of framework {framework_id}",
                authenticated.unwrap_or(""),
                framework.info.principal.as_deref().unwrap_or(""),
            )));
        }
        if !framework.connected {
            return Err(MasterError::Forbidden(format!(
                "Framework {framework_id} is not subscribed"
            )));
        }
        match stream_id {
            None => Err(MasterError::BadRequest(
                "All non-subscribe calls must include a stream id".to_string(),
            )),
            Some(stream_id) if framework.stream_id != Some(stream_id) => {
                Err(MasterError::BadRequest(format!(
                    "The stream id '{stream_id}' does not match the active stream of framework {framework_id}"
                )))
            }
            Some(_) => Ok(framework_id),
        }
    }

    fn roles_or_default(&self, framework_id: FrameworkId, roles: Vec<String>) -> Vec<String> {
        if !roles.is_empty() {
            return roles;
        }
        self.state
            .frameworks
            .get(&framework_id)
            .map(|f| f.roles().to_vec())
            .unwrap_or_default()
    }

    fn send_to_agent(&self, agent_id: AgentId, message: AgentMessage) {
        if self.state.agents.registered.contains_key(&agent_id) {
            self.collaborators.messenger.send(agent_id, message);
        } else {
            warn!(agent_id = %agent_id, message = message.name(), "Dropping message for unknown agent");
        }
    }

    // =========================================================================
    // Subscription
    // =========================================================================

    fn subscribe(
        &mut self,
        ctx: &mut ActorContext<MasterMessage>,
        principal: Option<Principal>,
        framework_info: FrameworkInfo,
        reply_to: Reply<SchedulerResponse>,
    ) -> Result<(), ActorError> {
        let action = Action::RegisterFramework;
        self.authorize(ctx, "scheduler.subscribe", principal, &[action], move |actor, _ctx, approvers| {
            let object = Object::Framework {
                id: framework_info.id,
                roles: framework_info.roles.clone(),
            };
            let result = match approvers {
                Ok(approvers) if approvers.approved(action, &object) => {
                    actor.add_subscriber(framework_info)
                }
                Ok(_) => Err(MasterError::Forbidden(format!(
                    "Not authorized to register framework '{}'",
                    framework_info.name
                ))),
                Err(e) => Err(e),
            };
            respond(reply_to, result);
            Ok(())
        });
        Ok(())
    }

    /// Registers a new framework or re-subscribes an existing one. The old
    /// stream of a re-subscribing framework is closed.
    fn add_subscriber(&mut self, mut info: FrameworkInfo) -> Result<SchedulerResponse, MasterError> {
        let framework_id = match info.id {
            Some(id) if self.state.completed_frameworks.contains(&id) => {
                return Err(MasterError::Forbidden(format!(
                    "Framework {id} has been torn down"
                )));
            }
            Some(id) => id,
            None => FrameworkId::new(),
        };
        info.id = Some(framework_id);

        let is_new = !self.state.frameworks.contains_key(&framework_id);
        if !is_new {
            // Failover: outstanding offers were made to the old connection.
            self.recover_framework_offers(framework_id);
        }

        let stream_id = StreamId::random();
        let events = Queue::new();
        let interval = self.options.heartbeat_interval;
        let roles = info.roles.clone();

        let framework = self
            .state
            .frameworks
            .entry(framework_id)
            .or_insert_with(|| Framework::new(framework_id, info.clone()));
        if let Some(previous) = framework.events.take() {
            previous.close();
        }
        framework.info = info;
        framework.connected = true;
        framework.active = true;
        framework.stream_id = Some(stream_id);
        framework.events = Some(events.clone());
        framework.send(Event::Subscribed {
            framework_id,
            heartbeat_interval_secs: interval.as_secs_f64(),
        });
        spawn_heartbeat(events.clone(), interval, || Event::Heartbeat);

        if is_new {
            self.collaborators.allocator.add_framework(framework_id, &roles);
            let view = readonly::framework_view(framework);
            broadcast(&mut self.subscribers, |approvers| {
                let object = Object::Framework {
                    id: Some(framework_id),
                    roles: roles.clone(),
                };
                approvers
                    .approved(Action::ViewFramework, &object)
                    .then(|| OperatorEvent::FrameworkAdded {
                        framework: view.clone(),
                    })
            });
            info!(framework_id = %framework_id, "Framework subscribed");
        } else {
            info!(framework_id = %framework_id, "Framework re-subscribed");
        }

        Ok(SchedulerResponse::Subscribed(Subscription {
            framework_id,
            stream_id,
            events,
        }))
    }

    /// Returns every outstanding offer and inverse offer of the framework.
    fn recover_framework_offers(&mut self, framework_id: FrameworkId) {
        let Some(framework) = self.state.frameworks.get(&framework_id) else {
            return;
        };
        let offers: Vec<_> = framework.offers.iter().copied().collect();
        let inverse_offers: Vec<_> = framework.inverse_offers.iter().copied().collect();

        for offer_id in offers {
            if let Some(offer) = self.state.remove_offer(&offer_id) {
                self.collaborators.allocator.recover_resources(
                    framework_id,
                    offer.agent_id,
                    &offer.resources,
                    None,
                );
                if let Some(framework) = self.state.frameworks.get(&framework_id) {
                    framework.send(Event::Rescind { offer_id });
                }
            }
        }
        for id in inverse_offers {
            if let Some(inverse_offer) = self.state.remove_inverse_offer(&id) {
                self.collaborators.allocator.update_inverse_offer(
                    inverse_offer.agent_id,
                    framework_id,
                    InverseOfferState::Unknown,
                    None,
                );
            }
        }
    }

    /// Tears a framework down: its offers are recovered, its tasks killed
    /// and its stream closed.
    pub(super) fn remove_framework(&mut self, framework_id: FrameworkId) {
        self.recover_framework_offers(framework_id);
        let Some(mut framework) = self.state.frameworks.remove(&framework_id) else {
            return;
        };

        let mut agents = BTreeSet::new();
        let task_ids: Vec<_> = framework.tasks.keys().cloned().collect();
        for task_id in task_ids {
            if let Some(task) = framework.tasks.get_mut(&task_id) {
                task.state = TaskState::Killed;
            }
            let Some(task) = framework.complete_task(&task_id, self.options.max_completed_tasks)
            else {
                continue;
            };
            agents.insert(task.agent_id);
            self.send_to_agent(
                task.agent_id,
                AgentMessage::KillTask {
                    framework_id,
                    task_id: task.task_id.clone(),
                },
            );
            self.release_task(&task);
            self.collaborators.allocator.recover_resources(
                framework_id,
                task.agent_id,
                &task.resources,
                None,
            );
        }
        for agent_id in agents {
            self.send_to_agent(agent_id, AgentMessage::ShutdownFramework { framework_id });
        }

        if let Some(events) = framework.events.take() {
            events.close();
        }
        self.state.completed_frameworks.push_back(framework_id);
        while self.state.completed_frameworks.len() > self.options.max_completed_frameworks {
            self.state.completed_frameworks.pop_front();
        }

        self.collaborators.allocator.remove_framework(framework_id);
        broadcast(&mut self.subscribers, |_| {
            Some(OperatorEvent::FrameworkRemoved { framework_id })
        });
        info!(framework_id = %framework_id, "Framework removed");
    }

    // =========================================================================
    // Offers
    // =========================================================================

    fn accept(
        &mut self,
        ctx: &mut ActorContext<MasterMessage>,
        framework_id: FrameworkId,
        principal: Option<Principal>,
        accept: Accept,
        reply_to: Reply<SchedulerResponse>,
    ) -> Result<(), ActorError> {
        let Accept {
            offer_ids,
            operations,
            filters,
        } = accept;

        // Every listed offer owned by the framework is used up, valid or not.
        let mut offers = Vec::new();
        let mut invalid = None;
        if offer_ids.is_empty() {
            invalid = Some("No offers specified".to_string());
        }
        for offer_id in &offer_ids {
            let owner = self.state.offers.get(offer_id).map(|offer| offer.framework_id);
            match owner {
                Some(owner) if owner == framework_id => {
                    if let Some(offer) = self.state.remove_offer(offer_id) {
                        offers.push(offer);
                    }
                }
                Some(_) => {
                    invalid.get_or_insert_with(|| {
                        format!("Offer {offer_id} belongs to another framework")
                    });
                }
                None => {
                    invalid.get_or_insert_with(|| format!("Offer {offer_id} is no longer valid"));
                }
            }
        }
        if offers.windows(2).any(|pair| pair[0].agent_id != pair[1].agent_id) {
            invalid.get_or_insert_with(|| "Offers span more than one agent".to_string());
        }
        let agent_id = offers.first().map(|offer| offer.agent_id);

        let agent_id = match (invalid, agent_id) {
            (None, Some(agent_id)) if self.state.agents.registered.contains_key(&agent_id) => {
                agent_id
            }
            (reason, _) => {
                let reason = reason.unwrap_or_else(|| "Agent is no longer registered".to_string());
                warn!(framework_id = %framework_id, %reason, "Dropping ACCEPT");
                for offer in &offers {
                    self.collaborators.allocator.recover_resources(
                        framework_id,
                        offer.agent_id,
                        &offer.resources,
                        None,
                    );
                }
                self.drop_tasks(framework_id, &operations, &reason);
                respond(reply_to, Ok(SchedulerResponse::Accepted));
                return Ok(());
            }
        };

        let mut pool = Resources::new();
        for offer in &offers {
            pool += &offer.resources;
        }
        let role = pool
            .iter()
            .find_map(|r| r.allocation_role.clone())
            .unwrap_or_else(|| "*".to_string());

        let launches = operations.iter().fold(Resources::new(), |mut acc, operation| {
            if let Operation::Launch { task_infos } = operation {
                for task in task_infos {
                    acc += &task.resources.unallocate();
                }
            }
            acc
        });

        let hold = OperationId::new();
        if let Some(agent) = self.state.agents.registered.get_mut(&agent_id) {
            agent.pending.insert(hold, pool.unallocate());
            if !launches.is_empty() {
                agent.pending_tasks.insert(hold, launches);
            }
        }

        let principal_value = principal.as_ref().and_then(|p| p.value.clone());
        self.authorize(ctx, "scheduler.accept", principal, ACCEPT_ACTIONS, move |actor, ctx, approvers| {
            let approvers = match approvers {
                Ok(approvers) => approvers,
                Err(e) => {
                    if let Some(agent) = actor.state.agents.registered.get_mut(&agent_id) {
                        agent.pending.remove(&hold);
                        agent.pending_tasks.remove(&hold);
                    }
                    actor.collaborators.allocator.recover_resources(framework_id, agent_id, &pool, None);
                    respond(reply_to, Err(e));
                    return Ok(());
                }
            };
            let state = AcceptState {
                framework_id,
                agent_id,
                role,
                pool,
                hold,
                operations: operations.into(),
                filters,
                approvers,
                principal: principal_value,
                reply_to,
            };
            actor.accept_next(ctx, state)
        });
        Ok(())
    }

    /// Sends TASK_DROPPED for every task an unusable ACCEPT asked to launch.
    fn drop_tasks(&self, framework_id: FrameworkId, operations: &[Operation], reason: &str) {
        let Some(framework) = self.state.frameworks.get(&framework_id) else {
            return;
        };
        for operation in operations {
            if let Operation::Launch { task_infos } = operation {
                for task in task_infos {
                    framework.send(Event::Update {
                        status: TaskStatus::master_generated(
                            task.task_id.clone(),
                            Some(task.agent_id),
                            TaskState::Dropped,
                            reason,
                        ),
                    });
                }
            }
        }
    }

    /// Applies the next queued operation of an ACCEPT. Launches complete
    /// synchronously; other operations resume here once committed.
    fn accept_next(
        &mut self,
        ctx: &mut ActorContext<MasterMessage>,
        mut state: AcceptState,
    ) -> Result<(), ActorError> {
        while let Some(mut operation) = state.operations.pop_front() {
            if !self.state.frameworks.contains_key(&state.framework_id)
                || !self.state.agents.registered.contains_key(&state.agent_id)
            {
                warn!(framework_id = %state.framework_id, agent_id = %state.agent_id, "Abandoning ACCEPT");
                state.operations.clear();
                break;
            }

            if let Err(e) = operation.upgrade() {
                self.reject_operation(&state, &operation, &e.to_string());
                continue;
            }

            if let Operation::Launch { task_infos } = &operation {
                if let Err(e) = validate_launch(task_infos) {
                    for task in task_infos {
                        self.task_error(&state, task, &e);
                    }
                    continue;
                }
                for task in task_infos.clone() {
                    self.launch(&mut state, task);
                }
                continue;
            }

            let action = operation.kind().action();
            if operation
                .authorization_objects()
                .iter()
                .any(|object| !state.approvers.approved(action, object))
            {
                self.reject_operation(&state, &operation, "Not authorized");
                continue;
            }

            let unallocated = operation.unallocate();
            if let Err(e) =
                self.validate_operation(
                    &state.agent_id,
                    &unallocated,
                    state.principal.as_deref(),
                    Some(&state.hold),
                )
            {
                self.reject_operation(&state, &operation, &e.to_string());
                continue;
            }
            let pool = match state.pool.unallocate().apply(&unallocated) {
                Ok(pool) => pool.allocate(&state.role),
                Err(e) => {
                    self.reject_operation(&state, &operation, &e.to_string());
                    continue;
                }
            };

            // Hand the operation its share of the hold; the rest stays held
            // while the registry write is in flight.
            let required = unallocated.required();
            if let Some(agent) = self.state.agents.registered.get_mut(&state.agent_id) {
                agent.pending.insert(state.hold, &state.pool.unallocate() - &required);
            }
            let agent_id = state.agent_id;
            let framework_id = state.framework_id;
            return self.apply_operation(
                ctx,
                agent_id,
                Some(framework_id),
                unallocated,
                Box::new(move |actor, ctx, result| {
                    match result {
                        Ok(()) => state.pool = pool,
                        Err(e) => {
                            warn!(framework_id = %framework_id, error = %e, "Offer operation failed")
                        }
                    }
                    if let Some(agent) = actor.state.agents.registered.get_mut(&agent_id) {
                        agent.pending.insert(state.hold, state.pool.unallocate());
                    }
                    actor.accept_next(ctx, state)
                }),
            );
        }

        self.finish_accept(state);
        Ok(())
    }

    fn finish_accept(&mut self, state: AcceptState) {
        if let Some(agent) = self.state.agents.registered.get_mut(&state.agent_id) {
            agent.pending.remove(&state.hold);
            agent.pending_tasks.remove(&state.hold);
            if !state.pool.is_empty() {
                self.collaborators.allocator.recover_resources(
                    state.framework_id,
                    state.agent_id,
                    &state.pool,
                    state.filters,
                );
            }
        }
        respond(state.reply_to, Ok(SchedulerResponse::Accepted));
    }

    fn reject_operation(&self, state: &AcceptState, operation: &Operation, reason: &str) {
        warn!(
            framework_id = %state.framework_id,
            agent_id = %state.agent_id,
            kind = %operation.kind(),
            %reason,
            "Dropping offer operation"
        );
        if let Operation::Launch { task_infos } = operation {
            for task in task_infos {
                self.task_error(state, task, reason);
            }
        } else if let Some(framework) = self.state.frameworks.get(&state.framework_id) {
            framework.send(Event::Error {
                message: format!("{} operation dropped: {reason}", operation.kind()),
            });
        }
    }

    fn task_error(&self, state: &AcceptState, task: &TaskInfo, reason: &str) {
        if let Some(framework) = self.state.frameworks.get(&state.framework_id) {
            framework.send(Event::Update {
                status: TaskStatus::master_generated(
                    task.task_id.clone(),
                    Some(state.agent_id),
                    TaskState::Error,
                    reason,
                ),
            });
        }
    }

    fn launch(&mut self, state: &mut AcceptState, task: TaskInfo) {
        let framework_id = state.framework_id;
        let resources = if task.resources.iter().all(|r| r.allocation_role.is_some()) {
            task.resources.clone()
        } else {
            task.resources.allocate(&state.role)
        };

        let Some(framework) = self.state.frameworks.get(&framework_id) else {
            return;
        };
        let object = Object::Task {
            framework_id,
            task_id: task.task_id.clone(),
            roles: framework.roles().to_vec(),
        };
        let rejection = if task.agent_id != state.agent_id {
            Some(format!("Task uses agent {} which was not offered", task.agent_id))
        } else if framework.tasks.contains_key(&task.task_id) {
            Some(format!("Task ID '{}' is already in use", task.task_id))
        } else if !state.approvers.approved(Action::RunTask, &object) {
            Some("Not authorized to launch task".to_string())
        } else if !state.pool.contains(&resources) {
            Some(format!(
                "Task uses more resources {resources} than available {}",
                state.pool
            ))
        } else {
            None
        };
        if let Some(reason) = rejection {
            self.task_error(state, &task, &reason);
            return;
        }

        state.pool -= &resources;
        let agent_id = state.agent_id;
        if let Some(agent) = self.state.agents.registered.get_mut(&agent_id) {
            agent.pending.insert(state.hold, state.pool.unallocate());
            *agent.used.entry(framework_id).or_default() += &resources;
            agent.tasks.insert((framework_id, task.task_id.clone()));
            if let Some(executor_id) = task.executor_id {
                agent.executors.insert((framework_id, executor_id));
            }
        }
        if let Some(framework) = self.state.frameworks.get_mut(&framework_id) {
            framework.tasks.insert(
                task.task_id.clone(),
                Task {
                    task_id: task.task_id.clone(),
                    framework_id,
                    agent_id,
                    executor_id: task.executor_id,
                    name: task.name.clone(),
                    resources: resources.clone(),
                    state: TaskState::Staging,
                    pending_ack: None,
                },
            );
        }

        info!(framework_id = %framework_id, agent_id = %agent_id, task_id = %task.task_id, "Launching task");
        self.collaborators.messenger.send(
            agent_id,
            AgentMessage::RunTask {
                framework_id,
                task: TaskInfo { resources, ..task },
            },
        );
    }

    fn decline(&mut self, framework_id: FrameworkId, decline: Decline) {
        for offer_id in &decline.offer_ids {
            match self.state.offers.get(offer_id) {
                Some(offer) if offer.framework_id == framework_id => {}
                _ => {
                    debug!(offer_id = %offer_id, "Ignoring decline of unknown offer");
                    continue;
                }
            }
            if let Some(offer) = self.state.remove_offer(offer_id) {
                self.collaborators.allocator.recover_resources(
                    framework_id,
                    offer.agent_id,
                    &offer.resources,
                    decline.filters,
                );
            }
        }
    }

    fn answer_inverse_offers(
        &mut self,
        framework_id: FrameworkId,
        inverse_offers: InverseOffers,
        answer: InverseOfferState,
    ) {
        for id in &inverse_offers.inverse_offer_ids {
            let owned = self
                .state
                .inverse_offers
                .get(id)
                .is_some_and(|io| io.framework_id == framework_id);
            if !owned {
                debug!(inverse_offer_id = %id, "Ignoring answer to unknown inverse offer");
                continue;
            }
            if let Some(inverse_offer) = self.state.remove_inverse_offer(id) {
                self.collaborators.allocator.update_inverse_offer(
                    inverse_offer.agent_id,
                    framework_id,
                    answer,
                    inverse_offers.filters,
                );
            }
        }
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    fn kill(&mut self, framework_id: FrameworkId, kill: Kill) {
        let Some(framework) = self.state.frameworks.get(&framework_id) else {
            return;
        };
        let agent_id = framework
            .tasks
            .get(&kill.task_id)
            .map(|task| task.agent_id)
            .or(kill.agent_id)
            .filter(|agent_id| self.state.agents.registered.contains_key(agent_id));

        match agent_id {
            Some(agent_id) => self.collaborators.messenger.send(
                agent_id,
                AgentMessage::KillTask {
                    framework_id,
                    task_id: kill.task_id,
                },
            ),
            None => framework.send(Event::Update {
                status: TaskStatus::master_generated(
                    kill.task_id,
                    kill.agent_id,
                    TaskState::Unknown,
                    "Attempted to kill an unknown task",
                ),
            }),
        }
    }

    fn shutdown_executor(&self, framework_id: FrameworkId, shutdown: Shutdown) {
        let Shutdown {
            executor_id,
            agent_id,
        } = shutdown;
        self.send_to_agent(
            agent_id,
            AgentMessage::ShutdownExecutor {
                framework_id,
                executor_id,
            },
        );
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Explicit reconciliation answers for the listed tasks; implicit
    /// reconciliation (no tasks) answers for every known task.
    fn reconcile(&self, framework_id: FrameworkId, reconcile: Reconcile) {
        let Some(framework) = self.state.frameworks.get(&framework_id) else {
            return;
        };
        let latest = |task: &Task| TaskStatus {
            task_id: task.task_id.clone(),
            agent_id: Some(task.agent_id),
            state: task.state,
            message: Some("Reconciliation: Latest task state".to_string()),
            uuid: None,
            timestamp: chrono::Utc::now(),
        };

        if reconcile.tasks.is_empty() {
            for task in framework.tasks.values() {
                framework.send(Event::Update { status: latest(task) });
            }
            return;
        }

        let agents = &self.state.agents;
        for requested in reconcile.tasks {
            if let Some(task) = framework.tasks.get(&requested.task_id) {
                framework.send(Event::Update { status: latest(task) });
                continue;
            }
            let state = match requested.agent_id {
                Some(agent_id) if agents.recovered.contains_key(&agent_id) => {
                    // Wait for the agent to re-register.
                    continue;
                }
                Some(agent_id) if agents.registered.contains_key(&agent_id) => TaskState::Lost,
                Some(agent_id) if agents.unreachable.contains_key(&agent_id) => {
                    TaskState::Unreachable
                }
                Some(agent_id) if agents.gone.contains_key(&agent_id) => TaskState::Gone,
                _ => TaskState::Unknown,
            };
            framework.send(Event::Update {
                status: TaskStatus::master_generated(
                    requested.task_id,
                    requested.agent_id,
                    state,
                    "Reconciliation: Task is unknown",
                ),
            });
        }
    }

    fn reconcile_operations(
        &self,
        framework_id: FrameworkId,
        reconcile: ReconcileOperations,
    ) -> Vec<OperationStatus> {
        let agents = &self.state.agents.registered;

        if reconcile.operations.is_empty() {
            return agents
                .values()
                .flat_map(|agent| {
                    agent
                        .operations
                        .values()
                        .filter(|record| record.framework_id == Some(framework_id))
                        .map(|record| OperationStatus {
                            operation_id: record.id,
                            agent_id: Some(agent.id),
                            state: record.state,
                            message: None,
                        })
                })
                .collect();
        }

        reconcile
            .operations
            .into_iter()
            .map(|requested| {
                let found = agents
                    .values()
                    .filter(|agent| requested.agent_id.map_or(true, |id| id == agent.id))
                    .find_map(|agent| {
                        agent
                            .operations
                            .get(&requested.operation_id)
                            .map(|record| (agent.id, record.state))
                    });
                match found {
                    Some((agent_id, state)) => OperationStatus {
                        operation_id: requested.operation_id,
                        agent_id: Some(agent_id),
                        state,
                        message: None,
                    },
                    None => {
                        let state = match requested.agent_id {
                            Some(agent_id) if agents.contains_key(&agent_id) => {
                                OperationState::Dropped
                            }
                            _ => OperationState::Unknown,
                        };
                        OperationStatus {
                            operation_id: requested.operation_id,
                            agent_id: requested.agent_id,
                            state,
                            message: Some("Reconciliation: Operation is unknown".to_string()),
                        }
                    }
                }
            })
            .collect()
    }
}
