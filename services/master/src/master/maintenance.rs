//! Maintenance coordination: schedule updates, machine DOWN/UP transitions
//! and operator-initiated agent removal.
//!
//! Each call validates, authorizes every machine it touches, re-validates,
//! then commits to the registry. A registry failure here is fatal.

use chrono::Utc;
use corral_id::{AgentId, OfferId};
use tracing::{info, warn};

use super::{fail_fatally, respond, MasterActor, MasterMessage, Reply};
use crate::actors::{ActorContext, ActorError};
use crate::authz::{Action, Object, ObjectApprovers, Principal};
use crate::error::MasterError;
use crate::maintenance::{self as schedule, MachineId, MachineMode, Schedule};
use crate::messenger::AgentMessage;
use crate::operator::OperatorResponse;
use crate::registry::RegistryOperation;
use crate::scheduler::{Event, TaskState};

fn unauthorized_machine<'a>(
    approvers: &ObjectApprovers,
    action: Action,
    mut machines: impl Iterator<Item = &'a MachineId>,
) -> Option<&'a MachineId> {
    machines.find(|id| !approvers.approved(action, &Object::Machine((*id).clone())))
}

impl MasterActor {
    // =========================================================================
    // Schedule
    // =========================================================================

    pub(super) fn update_maintenance_schedule(
        &mut self,
        ctx: &mut ActorContext<MasterMessage>,
        principal: Option<Principal>,
        next: Schedule,
        reply_to: Reply<OperatorResponse>,
    ) -> Result<(), ActorError> {
        if let Err(e) = schedule::validate_schedule(&next, &self.state.machines) {
            respond(reply_to, Err(MasterError::BadRequest(e)));
            return Ok(());
        }

        let action = Action::UpdateMaintenanceSchedule;
        self.authorize(ctx, "maintenance.schedule", principal, &[action], move |actor, ctx, approvers| {
            let approvers = match approvers {
                Ok(approvers) => approvers,
                Err(e) => {
                    respond(reply_to, Err(e));
                    return Ok(());
                }
            };
            if let Some(id) = unauthorized_machine(&approvers, action, next.machine_ids()) {
                respond(
                    reply_to,
                    Err(MasterError::Forbidden(format!(
                        "Not authorized to schedule maintenance on machine '{id}'"
                    ))),
                );
                return Ok(());
            }

            if let Err(e) = schedule::validate_schedule(&next, &actor.state.machines) {
                respond(reply_to, Err(MasterError::BadRequest(e)));
                return Ok(());
            }

            let registry = actor.collaborators.registry.clone();
            let operation = RegistryOperation::UpdateSchedule {
                schedule: next.clone(),
            };
            Self::defer(
                ctx,
                "maintenance.schedule.registry",
                async move { registry.apply(operation).await },
                move |actor, _ctx, committed| match committed {
                    Ok(true) => {
                        actor.apply_schedule(next);
                        respond(reply_to, Ok(OperatorResponse::Accepted));
                        Ok(())
                    }
                    Ok(false) => fail_fatally(reply_to, "Registry did not apply maintenance schedule".to_string()),
                    Err(e) => fail_fatally(reply_to, format!("Failed to update maintenance schedule: {e}")),
                },
            );
            Ok(())
        });
        Ok(())
    }

    /// Replaces the active schedules, moving machines between UP and
    /// DRAINING and telling the allocator which agents become unavailable.
    fn apply_schedule(&mut self, next: Schedule) {
        let diff = schedule::diff_schedule(
            |id| self.state.machine_mode(id),
            &self.state.schedules,
            &next,
        );
        schedule::apply_diff(&mut self.state.machines, &diff);

        let allocator = self.collaborators.allocator.clone();
        for (id, unavailability) in diff.draining.iter().chain(diff.updated.iter()) {
            for agent_id in self.state.agents_on(id) {
                allocator.update_unavailability(agent_id, Some(unavailability.clone()));
            }
        }
        for id in &diff.released {
            for agent_id in self.state.agents_on(id) {
                allocator.update_unavailability(agent_id, None);
                self.rescind_inverse_offers(&agent_id);
            }
        }

        info!(
            draining = diff.draining.len(),
            updated = diff.updated.len(),
            released = diff.released.len(),
            "Updated maintenance schedule"
        );
        self.state.schedules = if next.windows.is_empty() {
            Vec::new()
        } else {
            vec![next]
        };
    }

    pub(super) fn rescind_inverse_offers(&mut self, agent_id: &AgentId) {
        let ids: Vec<OfferId> = self
            .state
            .agents
            .registered
            .get(agent_id)
            .map(|agent| agent.inverse_offers.iter().copied().collect())
            .unwrap_or_default();
        for id in ids {
            if let Some(inverse_offer) = self.state.remove_inverse_offer(&id) {
                if let Some(framework) = self.state.frameworks.get(&inverse_offer.framework_id) {
                    framework.send(Event::RescindInverseOffer {
                        inverse_offer_id: id,
                    });
                }
            }
        }
    }

    // =========================================================================
    // Machine transitions
    // =========================================================================

    fn check_machine_modes(&self, machines: &[MachineId], expected: MachineMode) -> Result<(), MasterError> {
        schedule::validate_machine_ids(machines).map_err(MasterError::BadRequest)?;
        for id in machines {
            match self.state.machine_mode(id) {
                None => {
                    return Err(MasterError::BadRequest(format!(
                        "Machine '{id}' is not part of a maintenance schedule"
                    )))
                }
                Some(mode) if mode != expected => {
                    return Err(MasterError::BadRequest(format!(
                        "Machine '{id}' is in {mode:?} mode, expected {expected:?}"
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    pub(super) fn start_maintenance(
        &mut self,
        ctx: &mut ActorContext<MasterMessage>,
        principal: Option<Principal>,
        machines: Vec<MachineId>,
        reply_to: Reply<OperatorResponse>,
    ) -> Result<(), ActorError> {
        self.transition_machines(ctx, principal, machines, MachineMode::Draining, reply_to)
    }

    pub(super) fn stop_maintenance(
        &mut self,
        ctx: &mut ActorContext<MasterMessage>,
        principal: Option<Principal>,
        machines: Vec<MachineId>,
        reply_to: Reply<OperatorResponse>,
    ) -> Result<(), ActorError> {
        self.transition_machines(ctx, principal, machines, MachineMode::Down, reply_to)
    }

    /// DRAINING machines go DOWN; DOWN machines come back UP.
    fn transition_machines(
        &mut self,
        ctx: &mut ActorContext<MasterMessage>,
        principal: Option<Principal>,
        machines: Vec<MachineId>,
        from: MachineMode,
        reply_to: Reply<OperatorResponse>,
    ) -> Result<(), ActorError> {
        if let Err(e) = self.check_machine_modes(&machines, from) {
            respond(reply_to, Err(e));
            return Ok(());
        }

        let (action, label) = match from {
            MachineMode::Down => (Action::StopMaintenance, "maintenance.stop"),
            _ => (Action::StartMaintenance, "maintenance.start"),
        };
        self.authorize(ctx, label, principal, &[action], move |actor, ctx, approvers| {
            let approvers = match approvers {
                Ok(approvers) => approvers,
                Err(e) => {
                    respond(reply_to, Err(e));
                    return Ok(());
                }
            };
            if let Some(id) = unauthorized_machine(&approvers, action, machines.iter()) {
                respond(
                    reply_to,
                    Err(MasterError::Forbidden(format!(
                        "Not authorized to change maintenance mode of machine '{id}'"
                    ))),
                );
                return Ok(());
            }
            if let Err(e) = actor.check_machine_modes(&machines, from) {
                respond(reply_to, Err(e));
                return Ok(());
            }

            let registry = actor.collaborators.registry.clone();
            let operation = match from {
                MachineMode::Down => RegistryOperation::StopMaintenance {
                    machine_ids: machines.clone(),
                },
                _ => RegistryOperation::StartMaintenance {
                    machine_ids: machines.clone(),
                },
            };
            Self::defer(
                ctx,
                "maintenance.transition.registry",
                async move { registry.apply(operation).await },
                move |actor, ctx, committed| {
                    match committed {
                        Ok(true) => {}
                        Ok(false) => {
                            return fail_fatally(reply_to, format!("Registry did not apply {label}"))
                        }
                        Err(e) => return fail_fatally(reply_to, format!("Failed to apply {label}: {e}")),
                    }
                    match from {
                        MachineMode::Down => actor.bring_up(&machines),
                        _ => actor.bring_down(ctx, &machines),
                    }
                    respond(reply_to, Ok(OperatorResponse::Accepted));
                    Ok(())
                },
            );
            Ok(())
        });
        Ok(())
    }

    fn bring_down(&mut self, ctx: &mut ActorContext<MasterMessage>, machines: &[MachineId]) {
        for id in machines {
            for agent_id in self.state.agents_on(id) {
                info!(agent_id = %agent_id, machine = %id, "Shutting down agent for maintenance");
                self.collaborators.messenger.send(
                    agent_id,
                    AgentMessage::Shutdown {
                        message: "Operator initiated 'Machine DOWN'".to_string(),
                    },
                );
                self.remove_agent(ctx, agent_id, TaskState::GoneByOperator);
            }
            if let Some(machine) = self.state.machines.get_mut(id) {
                machine.mode = MachineMode::Down;
            }
        }
    }

    fn bring_up(&mut self, machines: &[MachineId]) {
        for id in machines {
            if let Some(machine) = self.state.machines.get_mut(id) {
                machine.mode = MachineMode::Up;
                machine.unavailability = None;
            }
        }
        schedule::remove_from_schedules(&mut self.state.schedules, machines);
    }

    // =========================================================================
    // Gone agents
    // =========================================================================

    pub(super) fn mark_agent_gone(
        &mut self,
        ctx: &mut ActorContext<MasterMessage>,
        principal: Option<Principal>,
        agent_id: AgentId,
        reply_to: Reply<OperatorResponse>,
    ) -> Result<(), ActorError> {
        let action = Action::MarkAgentGone;
        self.authorize(ctx, "agent.gone", principal, &[action], move |actor, ctx, approvers| {
            match approvers {
                Ok(approvers) if approvers.approved_any(action) => {}
                Ok(_) => {
                    respond(
                        reply_to,
                        Err(MasterError::Forbidden("Not authorized to mark agents gone".to_string())),
                    );
                    return Ok(());
                }
                Err(e) => {
                    respond(reply_to, Err(e));
                    return Ok(());
                }
            }

            let agents = &actor.state.agents;
            if agents.gone.contains_key(&agent_id) {
                respond(reply_to, Ok(OperatorResponse::Accepted));
                return Ok(());
            }
            if agents.is_transitioning(&agent_id) {
                respond(
                    reply_to,
                    Err(MasterError::Unavailable(format!(
                        "Agent {agent_id} is already transitioning"
                    ))),
                );
                return Ok(());
            }
            if !agents.is_known(&agent_id) {
                respond(
                    reply_to,
                    Err(MasterError::NotFound(format!("Agent {agent_id} is not known"))),
                );
                return Ok(());
            }

            actor.state.agents.marking_gone.insert(agent_id);
            let at = Utc::now();
            let registry = actor.collaborators.registry.clone();
            Self::defer(
                ctx,
                "agent.gone.registry",
                async move { registry.apply(RegistryOperation::MarkAgentGone { agent_id, at }).await },
                move |actor, _ctx, committed| {
                    actor.state.agents.marking_gone.remove(&agent_id);
                    match committed {
                        Ok(true) => {}
                        Ok(false) => warn!(agent_id = %agent_id, "Agent was already gone in registry"),
                        Err(e) => {
                            return fail_fatally(reply_to, format!("Failed to mark agent {agent_id} gone: {e}"))
                        }
                    }
                    actor.agent_gone(agent_id, at);
                    respond(reply_to, Ok(OperatorResponse::Accepted));
                    Ok(())
                },
            );
            Ok(())
        });
        Ok(())
    }

    fn agent_gone(&mut self, agent_id: AgentId, at: chrono::DateTime<Utc>) {
        if self.state.agents.registered.contains_key(&agent_id) {
            self.collaborators.messenger.send(
                agent_id,
                AgentMessage::Shutdown {
                    message: "Agent has been marked gone".to_string(),
                },
            );
            self.forget_agent(agent_id, TaskState::GoneByOperator);
        }
        self.state.agents.recovered.remove(&agent_id);
        self.state.agents.unreachable.remove(&agent_id);
        self.state.agents.gone.insert(agent_id, at);
        info!(agent_id = %agent_id, "Agent marked gone");
    }
}
