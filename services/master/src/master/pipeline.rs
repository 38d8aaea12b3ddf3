//! Resource operations: validate, authorize, reclaim offered resources,
//! then commit to the registry and the allocator.
//!
//! Operator calls enter through [`MasterActor::operate`]. Scheduler ACCEPT
//! calls reuse [`MasterActor::apply_operation`] for non-launch operations.

use chrono::Utc;
use corral_id::{AgentId, FrameworkId, OperationId};
use tracing::{debug, info, warn};

use super::{respond, MasterActor, MasterMessage, Reply};
use crate::actors::{ActorContext, ActorError};
use crate::authz::Principal;
use crate::error::MasterError;
use crate::messenger::AgentMessage;
use crate::operation::{Operation, OperationRecord, OperationState};
use crate::operator::OperatorResponse;
use crate::registry::RegistryOperation;
use crate::resources::Resources;
use crate::scheduler::{Event, Filters};

/// Completion callback for [`MasterActor::apply_operation`].
pub(super) type Done = Box<
    dyn FnOnce(
            &mut MasterActor,
            &mut ActorContext<MasterMessage>,
            Result<(), MasterError>,
        ) -> Result<(), ActorError>
        + Send,
>;

impl MasterActor {
    /// Runs an operator-initiated resource operation against one agent.
    pub(super) fn operate(
        &mut self,
        ctx: &mut ActorContext<MasterMessage>,
        principal: Option<Principal>,
        agent_id: AgentId,
        mut operation: Operation,
        reply_to: Reply<OperatorResponse>,
    ) -> Result<(), ActorError> {
        if !self.state.agents.registered.contains_key(&agent_id) {
            respond(reply_to, Err(no_such_agent(&agent_id)));
            return Ok(());
        }

        if let Err(e) = operation.upgrade() {
            respond(
                reply_to,
                Err(MasterError::BadRequest(format!(
                    "Invalid {} operation: {e}",
                    operation.kind()
                ))),
            );
            return Ok(());
        }

        let principal_value = principal.as_ref().and_then(|p| p.value.clone());
        if let Err(e) =
            self.validate_operation(&agent_id, &operation, principal_value.as_deref(), None)
        {
            respond(reply_to, Err(e));
            return Ok(());
        }

        let action = operation.kind().action();
        self.authorize(
            ctx,
            "operator.operate",
            principal,
            &[action],
            move |actor, ctx, approvers| {
                let approvers = match approvers {
                    Ok(approvers) => approvers,
                    Err(e) => {
                        respond(reply_to, Err(e));
                        return Ok(());
                    }
                };

                let denied = operation
                    .authorization_objects()
                    .iter()
                    .any(|object| !approvers.approved(action, object));
                if denied {
                    respond(
                        reply_to,
                        Err(MasterError::Forbidden(format!(
                            "Not authorized to perform {} on agent {agent_id}",
                            operation.kind()
                        ))),
                    );
                    return Ok(());
                }

                // The agent may have changed while authorization ran.
                if let Err(e) =
                    actor.validate_operation(&agent_id, &operation, principal_value.as_deref(), None)
                {
                    respond(reply_to, Err(e));
                    return Ok(());
                }

                actor.reclaim_offers(&agent_id, &operation.required());
                actor.apply_operation(
                    ctx,
                    agent_id,
                    None,
                    operation,
                    Box::new(move |_, _, result| {
                        respond(reply_to, result.map(|()| OperatorResponse::Accepted));
                        Ok(())
                    }),
                )
            },
        );
        Ok(())
    }

    pub(super) fn validate_operation(
        &self,
        agent_id: &AgentId,
        operation: &Operation,
        principal: Option<&str>,
        accept: Option<&OperationId>,
    ) -> Result<(), MasterError> {
        match self
            .state
            .with_agent_context(agent_id, accept, |_, context| {
                operation.validate(context, principal)
            })
        {
            None => Err(no_such_agent(agent_id)),
            Some(Err(message)) => Err(MasterError::BadRequest(format!(
                "Invalid {} operation on agent {agent_id}: {message}",
                operation.kind()
            ))),
            Some(Ok(())) => Ok(()),
        }
    }

    /// Rescinds just enough outstanding offers on the agent to cover what
    /// `required` needs beyond its current unallocated resources. Offers
    /// are visited in ascending id order and skipped unless they hold a
    /// resource kind still owed.
    pub(super) fn reclaim_offers(&mut self, agent_id: &AgentId, required: &Resources) {
        let Some(agent) = self.state.agents.registered.get(agent_id) else {
            return;
        };
        let mut debt = required - &agent.available();

        for offer_id in self.state.agent_offers(agent_id) {
            if debt.is_empty() {
                break;
            }
            let Some(unallocated) = self
                .state
                .agents
                .registered
                .get(agent_id)
                .and_then(|agent| agent.offered.get(&offer_id))
                .cloned()
            else {
                continue;
            };
            if !unallocated.overlaps(&debt) {
                continue;
            }
            let Some(offer) = self.state.remove_offer(&offer_id) else {
                continue;
            };

            info!(
                offer_id = %offer_id,
                agent_id = %agent_id,
                framework_id = %offer.framework_id,
                "Rescinding offer to make room for operation"
            );
            self.collaborators.allocator.recover_resources(
                offer.framework_id,
                offer.agent_id,
                &offer.resources,
                Some(Filters {
                    refuse_seconds: Some(self.options.offer_refuse_seconds),
                }),
            );
            if let Some(framework) = self.state.frameworks.get(&offer.framework_id) {
                framework.send(Event::Rescind { offer_id });
            }
            debt -= &unallocated;
        }
    }

    /// Commits a validated, authorized operation.
    ///
    /// The operation's resources are held as pending while the registry
    /// applies it. Once committed, the agent's total is updated, the
    /// allocator is told, and the agent is asked to apply it.
    pub(super) fn apply_operation(
        &mut self,
        ctx: &mut ActorContext<MasterMessage>,
        agent_id: AgentId,
        framework_id: Option<FrameworkId>,
        operation: Operation,
        done: Done,
    ) -> Result<(), ActorError> {
        let required = operation.required();
        let Some(agent) = self.state.agents.registered.get_mut(&agent_id) else {
            return done(self, ctx, Err(no_such_agent(&agent_id)));
        };
        if !agent.available().contains(&required) {
            let message = format!(
                "Agent {agent_id} does not have {required} available for {}",
                operation.kind()
            );
            return done(self, ctx, Err(MasterError::Conflict(message)));
        }

        let operation_id = OperationId::new();
        agent.pending.insert(operation_id, required);
        debug!(
            operation_id = %operation_id,
            agent_id = %agent_id,
            kind = %operation.kind(),
            "Applying operation to registry"
        );

        let registry = self.collaborators.registry.clone();
        let registry_operation = RegistryOperation::ApplyOperation {
            agent_id,
            operation: operation.clone(),
        };
        Self::defer(
            ctx,
            "operation.registry",
            async move { registry.apply(registry_operation).await },
            move |actor, ctx, committed| {
                let failure = match committed {
                    Ok(true) => None,
                    Ok(false) => Some(MasterError::Conflict(format!(
                        "Registry did not apply {}",
                        operation.kind()
                    ))),
                    Err(e) => Some(e.into()),
                };

                let Some(agent) = actor.state.agents.registered.get_mut(&agent_id) else {
                    if let Some(e) = failure {
                        return done(actor, ctx, Err(e));
                    }
                    // Committed durably; the agent picks it up on re-registration.
                    warn!(agent_id = %agent_id, "Agent removed while operation was committing");
                    return done(actor, ctx, Ok(()));
                };
                if let Some(e) = failure {
                    agent.pending.remove(&operation_id);
                    return done(actor, ctx, Err(e));
                }

                match agent.total.apply(&operation) {
                    Ok(total) => {
                        // Converted resources stay held until the allocator
                        // has seen them.
                        let converted = &total - &agent.total;
                        agent.total = total;
                        agent.pending.insert(operation_id, converted);
                    }
                    Err(e) => {
                        agent.pending.remove(&operation_id);
                        let message = format!("Failed to apply {}: {e}", operation.kind());
                        return done(actor, ctx, Err(MasterError::Conflict(message)));
                    }
                }

                let allocator = actor.collaborators.allocator.clone();
                let update = vec![operation.clone()];
                Self::defer(
                    ctx,
                    "operation.allocator",
                    async move { allocator.update_available(agent_id, update).await },
                    move |actor, ctx, updated| {
                        if let Some(agent) = actor.state.agents.registered.get_mut(&agent_id) {
                            agent.pending.remove(&operation_id);
                        }
                        if let Err(e) = updated {
                            warn!(agent_id = %agent_id, error = %e, "Allocator rejected operation");
                            return done(actor, ctx, Err(e.into()));
                        }

                        if let Some(agent) = actor.state.agents.registered.get_mut(&agent_id) {
                            agent.operations.insert(
                                operation_id,
                                OperationRecord {
                                    id: operation_id,
                                    framework_id,
                                    operation: operation.clone(),
                                    state: OperationState::Finished,
                                    applied_at: Utc::now(),
                                },
                            );
                        }
                        actor.collaborators.messenger.send(
                            agent_id,
                            AgentMessage::ApplyOperation {
                                operation_id,
                                framework_id,
                                operation,
                            },
                        );
                        info!(operation_id = %operation_id, agent_id = %agent_id, "Operation applied");
                        done(actor, ctx, Ok(()))
                    },
                );
                Ok(())
            },
        );
        Ok(())
    }
}

pub(super) fn no_such_agent(agent_id: &AgentId) -> MasterError {
    MasterError::NotFound(format!("No agent found with specified ID {agent_id}"))
}
