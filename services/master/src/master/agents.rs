//! Agent lifecycle plus the allocator and agent callbacks that feed offers
//! and task status into the master.

use chrono::Utc;
use corral_id::{AgentId, FrameworkId, OfferId};
use tracing::{debug, info, warn};

use super::{broadcast, fail_fatally, respond, MasterActor, MasterMessage, Reply};
use crate::actors::{ActorContext, ActorError};
use crate::error::MasterError;
use crate::maintenance::MachineMode;
use crate::operator::OperatorEvent;
use crate::readonly;
use crate::registry::RegistryOperation;
use crate::resources::Resources;
use crate::scheduler::{Event, TaskState, TaskStatus};
use crate::state::{Agent, AgentInfo, InverseOffer, Offer, Task};

impl MasterActor {
    // =========================================================================
    // Registration
    // =========================================================================

    fn admission_check(&self, agent_id: Option<&AgentId>, info: &AgentInfo) -> Result<(), MasterError> {
        let machine_id = info.machine_id();
        if self.state.machine_mode(&machine_id) == Some(MachineMode::Down) {
            return Err(MasterError::Forbidden(format!(
                "Machine '{machine_id}' is down for maintenance"
            )));
        }
        if let Some(agent_id) = agent_id {
            if self.state.agents.gone.contains_key(agent_id) {
                return Err(MasterError::Forbidden(format!(
                    "Agent {agent_id} has been marked gone"
                )));
            }
            if self.state.agents.is_transitioning(agent_id) {
                return Err(MasterError::Unavailable(format!(
                    "Agent {agent_id} is transitioning"
                )));
            }
        }
        Ok(())
    }

    pub(super) fn register_agent(
        &mut self,
        ctx: &mut ActorContext<MasterMessage>,
        agent_id: Option<AgentId>,
        info: AgentInfo,
        reply_to: Reply<AgentId>,
    ) {
        if let Err(e) = info.resources.validate_quantities() {
            respond(
                reply_to,
                Err(MasterError::BadRequest(format!("Invalid agent resources: {e}"))),
            );
            return;
        }
        if let Err(e) = self.admission_check(agent_id.as_ref(), &info) {
            respond(reply_to, Err(e));
            return;
        }
        if let Some(agent_id) = agent_id.filter(|id| self.state.agents.registered.contains_key(id)) {
            debug!(agent_id = %agent_id, "Agent already registered");
            respond(reply_to, Ok(agent_id));
            return;
        }

        let agent_id = agent_id.unwrap_or_else(AgentId::new);
        let readmitting = self.state.agents.recovered.contains_key(&agent_id);
        let registry = self.collaborators.registry.clone();
        let operation = RegistryOperation::AdmitAgent {
            agent_id,
            info: info.clone(),
        };
        Self::defer(
            ctx,
            "agent.admit.registry",
            async move { registry.apply(operation).await },
            move |actor, _ctx, admitted| {
                match admitted {
                    Ok(true) => {}
                    Ok(false) if readmitting => {}
                    Ok(false) => {
                        respond(
                            reply_to,
                            Err(MasterError::Conflict(format!(
                                "Registry refused to admit agent {agent_id}"
                            ))),
                        );
                        return Ok(());
                    }
                    Err(e) => {
                        respond(reply_to, Err(e.into()));
                        return Ok(());
                    }
                }

                if let Err(e) = actor.admission_check(Some(&agent_id), &info) {
                    respond(reply_to, Err(e));
                    return Ok(());
                }
                if !actor.state.agents.registered.contains_key(&agent_id) {
                    actor.add_agent(agent_id, info);
                }
                respond(reply_to, Ok(agent_id));
                Ok(())
            },
        );
    }

    fn add_agent(&mut self, agent_id: AgentId, mut info: AgentInfo) {
        // Checkpointed resources survive re-registration.
        if let Some(recovered) = self.state.agents.recovered.remove(&agent_id) {
            info.resources = recovered.resources;
        }
        self.state.agents.unreachable.remove(&agent_id);

        let machine_id = info.machine_id();
        let agent = Agent::new(agent_id, info);
        self.collaborators.allocator.add_agent(
            agent_id,
            &agent.total,
            self.state.machine_unavailability(&machine_id),
        );
        self.state.attach_agent(agent_id, machine_id);

        broadcast(&mut self.subscribers, |approvers| {
            Some(OperatorEvent::AgentAdded {
                agent: readonly::agent_view(approvers, &agent),
            })
        });
        info!(agent_id = %agent_id, hostname = %agent.info.hostname, "Agent registered");
        self.state.agents.registered.insert(agent_id, agent);
    }

    // =========================================================================
    // Removal
    // =========================================================================

    pub(super) fn mark_agent_unreachable(
        &mut self,
        ctx: &mut ActorContext<MasterMessage>,
        agent_id: AgentId,
        reply_to: Reply<()>,
    ) -> Result<(), ActorError> {
        if !self.state.agents.registered.contains_key(&agent_id) {
            respond(reply_to, Err(super::pipeline::no_such_agent(&agent_id)));
            return Ok(());
        }
        if self.state.agents.is_transitioning(&agent_id) {
            respond(
                reply_to,
                Err(MasterError::Unavailable(format!(
                    "Agent {agent_id} is transitioning"
                ))),
            );
            return Ok(());
        }

        self.state.agents.marking_unreachable.insert(agent_id);
        let at = Utc::now();
        let registry = self.collaborators.registry.clone();
        Self::defer(
            ctx,
            "agent.unreachable.registry",
            async move {
                registry
                    .apply(RegistryOperation::MarkAgentUnreachable { agent_id, at })
                    .await
            },
            move |actor, _ctx, committed| {
                actor.state.agents.marking_unreachable.remove(&agent_id);
                match committed {
                    Ok(true) => {}
                    Ok(false) => warn!(agent_id = %agent_id, "Agent was not admitted in registry"),
                    Err(e) => {
                        return fail_fatally(
                            reply_to,
                            format!("Failed to mark agent {agent_id} unreachable: {e}"),
                        )
                    }
                }
                actor.forget_agent(agent_id, TaskState::Unreachable);
                actor.state.agents.unreachable.insert(agent_id, at);
                respond(reply_to, Ok(()));
                Ok(())
            },
        );
        Ok(())
    }

    /// Removes a registered agent from the registry and then from memory.
    /// Tasks on it are reported in `task_state`.
    pub(super) fn remove_agent(
        &mut self,
        ctx: &mut ActorContext<MasterMessage>,
        agent_id: AgentId,
        task_state: TaskState,
    ) {
        if !self.state.agents.registered.contains_key(&agent_id)
            || self.state.agents.is_transitioning(&agent_id)
        {
            return;
        }

        self.state.agents.removing.insert(agent_id);
        let registry = self.collaborators.registry.clone();
        Self::defer(
            ctx,
            "agent.remove.registry",
            async move { registry.apply(RegistryOperation::RemoveAgent { agent_id }).await },
            move |actor, _ctx, committed| {
                actor.state.agents.removing.remove(&agent_id);
                match committed {
                    Ok(applied) => {
                        if !applied {
                            warn!(agent_id = %agent_id, "Agent was not admitted in registry");
                        }
                        actor.forget_agent(agent_id, task_state);
                        Ok(())
                    }
                    Err(e) => Err(ActorError::Permanent(format!(
                        "Failed to remove agent {agent_id}: {e}"
                    ))),
                }
            },
        );
    }

    /// Drops a registered agent from memory: rescinds its offers, reports
    /// its tasks as `task_state` and tells frameworks and the allocator.
    pub(super) fn forget_agent(&mut self, agent_id: AgentId, task_state: TaskState) {
        let Some(agent) = self.state.agents.registered.remove(&agent_id) else {
            return;
        };

        for offer_id in agent.offered.keys() {
            if let Some(offer) = self.state.remove_offer(offer_id) {
                if let Some(framework) = self.state.frameworks.get(&offer.framework_id) {
                    framework.send(Event::Rescind { offer_id: *offer_id });
                }
            }
        }
        for id in &agent.inverse_offers {
            if let Some(inverse_offer) = self.state.remove_inverse_offer(id) {
                if let Some(framework) = self.state.frameworks.get(&inverse_offer.framework_id) {
                    framework.send(Event::RescindInverseOffer {
                        inverse_offer_id: *id,
                    });
                }
            }
        }

        let max_completed = self.options.max_completed_tasks;
        for (framework_id, task_id) in &agent.tasks {
            let Some(framework) = self.state.frameworks.get_mut(framework_id) else {
                continue;
            };
            if let Some(task) = framework.tasks.get_mut(task_id) {
                task.state = task_state;
                framework.send(Event::Update {
                    status: TaskStatus::master_generated(
                        task_id.clone(),
                        Some(agent_id),
                        task_state,
                        format!("Agent {agent_id} removed"),
                    ),
                });
                framework.complete_task(task_id, max_completed);
            }
        }

        for framework in self.state.frameworks.values() {
            framework.send(Event::Failure {
                agent_id: Some(agent_id),
                executor_id: None,
            });
        }

        self.state.detach_agent(&agent_id, &agent.machine_id());
        self.collaborators.allocator.remove_agent(agent_id);
        broadcast(&mut self.subscribers, |_| {
            Some(OperatorEvent::AgentRemoved { agent_id })
        });
        info!(agent_id = %agent_id, ?task_state, "Agent removed");
    }

    // =========================================================================
    // Allocator callbacks
    // =========================================================================

    pub(super) fn offer(
        &mut self,
        framework_id: FrameworkId,
        agent_id: AgentId,
        resources: Resources,
    ) -> Result<OfferId, MasterError> {
        if resources.is_empty() {
            return Err(MasterError::BadRequest("Offer has no resources".to_string()));
        }
        resources
            .validate_quantities()
            .map_err(|e| MasterError::BadRequest(format!("Invalid offer: {e}")))?;
        let framework = self.state.frameworks.get(&framework_id).ok_or_else(|| {
            MasterError::NotFound(format!("Framework {framework_id} not found"))
        })?;
        if !framework.connected || !framework.active {
            return Err(MasterError::Conflict(format!(
                "Framework {framework_id} is not accepting offers"
            )));
        }
        let agent = self
            .state
            .agents
            .registered
            .get(&agent_id)
            .ok_or_else(|| super::pipeline::no_such_agent(&agent_id))?;
        if self.state.agents.is_transitioning(&agent_id) {
            return Err(MasterError::Unavailable(format!(
                "Agent {agent_id} is transitioning"
            )));
        }
        if !agent.available().contains(&resources.unallocate()) {
            return Err(MasterError::Conflict(format!(
                "Agent {agent_id} does not have {resources} available"
            )));
        }

        let allocated = if resources.iter().all(|r| r.allocation_role.is_some()) {
            resources
        } else {
            let role = framework.roles().first().map(String::as_str).unwrap_or("*");
            resources.allocate(role)
        };
        let offer = Offer {
            id: OfferId::new(),
            framework_id,
            agent_id,
            hostname: agent.info.hostname.clone(),
            resources: allocated,
        };
        let offer_id = offer.id;

        framework.send(Event::Offers {
            offers: vec![offer.clone()],
        });
        self.state.add_offer(offer);
        debug!(offer_id = %offer_id, framework_id = %framework_id, agent_id = %agent_id, "Sent offer");
        Ok(offer_id)
    }

    pub(super) fn inverse_offer(
        &mut self,
        framework_id: FrameworkId,
        agent_id: AgentId,
    ) -> Result<OfferId, MasterError> {
        let framework = self.state.frameworks.get(&framework_id).ok_or_else(|| {
            MasterError::NotFound(format!("Framework {framework_id} not found"))
        })?;
        if !framework.connected {
            return Err(MasterError::Conflict(format!(
                "Framework {framework_id} is not connected"
            )));
        }
        let agent = self
            .state
            .agents
            .registered
            .get(&agent_id)
            .ok_or_else(|| super::pipeline::no_such_agent(&agent_id))?;
        let unavailability = self
            .state
            .machine_unavailability(&agent.machine_id())
            .ok_or_else(|| {
                MasterError::Conflict(format!("Agent {agent_id} is not scheduled for maintenance"))
            })?;

        let inverse_offer = InverseOffer {
            id: OfferId::new(),
            framework_id,
            agent_id,
            unavailability,
        };
        let id = inverse_offer.id;
        framework.send(Event::InverseOffers {
            inverse_offers: vec![inverse_offer.clone()],
        });
        self.state.add_inverse_offer(inverse_offer);
        Ok(id)
    }

    // =========================================================================
    // Task status
    // =========================================================================

    pub(super) fn status_update(
        &mut self,
        agent_id: AgentId,
        mut status: TaskStatus,
    ) -> Result<(), MasterError> {
        let agent = self
            .state
            .agents
            .registered
            .get(&agent_id)
            .ok_or_else(|| super::pipeline::no_such_agent(&agent_id))?;
        let framework_id = agent
            .tasks
            .iter()
            .find(|(_, task_id)| *task_id == status.task_id)
            .map(|(framework_id, _)| *framework_id)
            .ok_or_else(|| {
                MasterError::NotFound(format!(
                    "Task {} is not known on agent {agent_id}",
                    status.task_id
                ))
            })?;
        let framework = self.state.frameworks.get_mut(&framework_id).ok_or_else(|| {
            MasterError::NotFound(format!("Framework {framework_id} not found"))
        })?;
        let task = framework.tasks.get_mut(&status.task_id).ok_or_else(|| {
            MasterError::NotFound(format!("Task {} not found", status.task_id))
        })?;

        task.state = status.state;
        task.pending_ack = status.uuid;
        status.agent_id = Some(agent_id);
        framework.send(Event::Update {
            status: status.clone(),
        });

        if status.state.is_terminal() {
            if let Some(task) = framework.complete_task(&status.task_id, self.options.max_completed_tasks) {
                self.release_task(&task);
                self.collaborators.allocator.recover_resources(
                    framework_id,
                    agent_id,
                    &task.resources,
                    None,
                );
            }
        }
        Ok(())
    }

    /// Returns a finished task's resources to its agent's unallocated pool.
    pub(super) fn release_task(&mut self, task: &Task) {
        let Some(agent) = self.state.agents.registered.get_mut(&task.agent_id) else {
            return;
        };
        agent.tasks.remove(&(task.framework_id, task.task_id.clone()));
        if let Some(used) = agent.used.get_mut(&task.framework_id) {
            *used -= &task.resources;
            if used.is_empty() {
                agent.used.remove(&task.framework_id);
            }
        }
    }
}
