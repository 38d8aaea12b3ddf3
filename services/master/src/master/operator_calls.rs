//! Dispatch of validated operator calls.

use corral_id::FrameworkId;
use tracing::{debug, info};

use super::batch::BatchedRequest;
use super::{
    broadcast, claims_without_value, respond, spawn_heartbeat, MasterActor, MasterMessage,
    OperatorSubscriber, Reply,
};
use crate::actors::{ActorContext, ActorError};
use crate::authz::{Action, Object, Principal};
use crate::error::MasterError;
use crate::operator::{Call, OperatorEvent, OperatorResponse, Response};
use crate::queue::Queue;
use crate::readonly;

fn is_mutation(call: &Call) -> bool {
    matches!(
        call,
        Call::UpdateMaintenanceSchedule(_)
            | Call::StartMaintenance(_)
            | Call::StopMaintenance(_)
            | Call::ReserveResources(_)
            | Call::UnreserveResources(_)
            | Call::CreateVolumes(_)
            | Call::DestroyVolumes(_)
            | Call::GrowVolume(_)
            | Call::ShrinkVolume(_)
            | Call::MarkAgentGone(_)
            | Call::Teardown(_)
    )
}

impl MasterActor {
    pub(super) fn operator_call(
        &mut self,
        ctx: &mut ActorContext<MasterMessage>,
        call: Call,
        principal: Option<Principal>,
        reply_to: Reply<OperatorResponse>,
    ) -> Result<(), ActorError> {
        debug!(call = ?call.call_type(), principal = ?principal.as_ref().and_then(Principal::value), "Processing operator call");

        if let Some(handler) = readonly::handler_for(&call) {
            let actions = call.actions();
            self.authorize(ctx, "operator.read", principal, actions, move |actor, ctx, approvers| {
                match approvers {
                    Ok(approvers) => actor.submit_read_only(
                        ctx,
                        BatchedRequest::new(handler, call, approvers, reply_to),
                    ),
                    Err(e) => respond(reply_to, Err(e)),
                }
                Ok(())
            });
            return Ok(());
        }

        if is_mutation(&call) && claims_without_value(principal.as_ref()) {
            respond(
                reply_to,
                Err(MasterError::Forbidden(
                    "Principals without a value may not modify cluster state".to_string(),
                )),
            );
            return Ok(());
        }

        match call {
            Call::GetMaintenanceStatus => self.get_maintenance_status(ctx, principal, reply_to),
            Call::UpdateMaintenanceSchedule(schedule) => {
                self.update_maintenance_schedule(ctx, principal, schedule, reply_to)
            }
            Call::StartMaintenance(machines) => self.start_maintenance(ctx, principal, machines, reply_to),
            Call::StopMaintenance(machines) => self.stop_maintenance(ctx, principal, machines, reply_to),
            Call::MarkAgentGone(agent_id) => self.mark_agent_gone(ctx, principal, agent_id, reply_to),
            Call::Teardown(framework_id) => self.operator_teardown(ctx, principal, framework_id, reply_to),
            Call::Subscribe => self.operator_subscribe(ctx, principal, reply_to),
            call => match call.into_operation() {
                Some((agent_id, operation)) => self.operate(ctx, principal, agent_id, operation, reply_to),
                None => {
                    respond(
                        reply_to,
                        Err(MasterError::BadRequest("Unsupported operator call".to_string())),
                    );
                    Ok(())
                }
            },
        }
    }

    fn get_maintenance_status(
        &mut self,
        ctx: &mut ActorContext<MasterMessage>,
        principal: Option<Principal>,
        reply_to: Reply<OperatorResponse>,
    ) -> Result<(), ActorError> {
        self.authorize(
            ctx,
            "operator.maintenance_status",
            principal,
            &[Action::GetMaintenanceStatus],
            move |actor, ctx, approvers| {
                let approvers = match approvers {
                    Ok(approvers) => approvers,
                    Err(e) => {
                        respond(reply_to, Err(e));
                        return Ok(());
                    }
                };
                let allocator = actor.collaborators.allocator.clone();
                Self::defer(
                    ctx,
                    "operator.maintenance_status.allocator",
                    async move { allocator.inverse_offer_statuses().await },
                    move |actor, _ctx, statuses| {
                        let result = statuses
                            .map_err(|e| MasterError::Unavailable(e.to_string()))
                            .map(|statuses| {
                                OperatorResponse::Reply(Response::GetMaintenanceStatus {
                                    status: readonly::maintenance_status(
                                        &actor.state,
                                        &statuses,
                                        &approvers,
                                    ),
                                })
                            });
                        respond(reply_to, result);
                        Ok(())
                    },
                );
                Ok(())
            },
        );
        Ok(())
    }

    fn operator_teardown(
        &mut self,
        ctx: &mut ActorContext<MasterMessage>,
        principal: Option<Principal>,
        framework_id: FrameworkId,
        reply_to: Reply<OperatorResponse>,
    ) -> Result<(), ActorError> {
        let action = Action::TeardownFramework;
        self.authorize(ctx, "operator.teardown", principal, &[action], move |actor, _ctx, approvers| {
            let approvers = match approvers {
                Ok(approvers) => approvers,
                Err(e) => {
                    respond(reply_to, Err(e));
                    return Ok(());
                }
            };
            let Some(framework) = actor.state.frameworks.get(&framework_id) else {
                respond(
                    reply_to,
                    Err(MasterError::NotFound(format!("Framework {framework_id} not found"))),
                );
                return Ok(());
            };
            let object = Object::Framework {
                id: Some(framework_id),
                roles: framework.roles().to_vec(),
            };
            if !approvers.approved(action, &object) {
                respond(
                    reply_to,
                    Err(MasterError::Forbidden(format!(
                        "Not authorized to tear down framework {framework_id}"
                    ))),
                );
                return Ok(());
            }

            info!(framework_id = %framework_id, "Operator tore down framework");
            actor.remove_framework(framework_id);
            respond(reply_to, Ok(OperatorResponse::Accepted));
            Ok(())
        });
        Ok(())
    }

    fn operator_subscribe(
        &mut self,
        ctx: &mut ActorContext<MasterMessage>,
        principal: Option<Principal>,
        reply_to: Reply<OperatorResponse>,
    ) -> Result<(), ActorError> {
        let actions = Call::Subscribe.actions();
        self.authorize(ctx, "operator.subscribe", principal, actions, move |actor, _ctx, approvers| {
            let approvers = match approvers {
                Ok(approvers) => approvers,
                Err(e) => {
                    respond(reply_to, Err(e));
                    return Ok(());
                }
            };

            let interval = actor.options.heartbeat_interval;
            let events = Queue::new();
            events.put(OperatorEvent::Subscribed {
                state: readonly::state_view(&actor.state, &approvers),
                heartbeat_interval_secs: interval.as_secs_f64(),
            });
            spawn_heartbeat(events.clone(), interval, || OperatorEvent::Heartbeat);
            actor.subscribers.push(OperatorSubscriber {
                events: events.clone(),
                approvers,
            });
            // Drop subscribers whose streams went away.
            broadcast(&mut actor.subscribers, |_| None);

            respond(reply_to, Ok(OperatorResponse::Subscribed(events)));
            Ok(())
        });
        Ok(())
    }
}
