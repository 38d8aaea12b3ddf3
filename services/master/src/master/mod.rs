//! The master actor.
//!
//! `MasterActor` owns the [`ClusterState`] and is the only writer to it.
//! Every asynchronous step (authorization, registry apply, allocator query)
//! runs on a spawned task and resumes by posting a [`Continuation`] to the
//! tail of the actor's mailbox; handlers re-check state after resuming.
//!
//! Callers talk to the actor through [`MasterHandle`].

mod agents;
mod batch;
mod maintenance;
mod operator_calls;
mod pipeline;
mod scheduler_calls;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use corral_id::{AgentId, FrameworkId, OfferId, StreamId};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::actors::{self, Actor, ActorContext, ActorError, ActorHandle};
use crate::allocator::Allocator;
use crate::authz::{Action, AuthorizationError, Authorizer, ObjectApprovers, Principal};
use crate::error::MasterError;
use crate::messenger::AgentMessenger;
use crate::operator::{self, OperatorEvent, OperatorResponse};
use crate::registry::Registry;
use crate::resources::Resources;
use crate::scheduler::{self, SchedulerResponse, TaskStatus};
use crate::state::{AgentInfo, ClusterState};

use batch::BatchedRequest;

// =============================================================================
// Configuration
// =============================================================================

/// The master's collaborators. Only the authorizer is optional; without one
/// every action is approved.
#[derive(Clone)]
pub struct Collaborators {
    pub registry: Arc<dyn Registry>,
    pub allocator: Arc<dyn Allocator>,
    pub messenger: Arc<dyn AgentMessenger>,
    pub authorizer: Option<Arc<dyn Authorizer>>,
}

#[derive(Debug, Clone)]
pub struct MasterOptions {
    /// Interval between heartbeat events on subscription streams.
    pub heartbeat_interval: Duration,

    /// Refusal filter applied to offers rescinded to make room for an
    /// operation.
    pub offer_refuse_seconds: f64,

    /// Completed tasks kept per framework.
    pub max_completed_tasks: usize,

    /// Completed frameworks remembered.
    pub max_completed_frameworks: usize,
}

impl Default for MasterOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            offer_refuse_seconds: 5.0,
            max_completed_tasks: 1000,
            max_completed_frameworks: 50,
        }
    }
}

// =============================================================================
// Messages
// =============================================================================

pub(crate) type Reply<T> = oneshot::Sender<Result<T, MasterError>>;

type ResumeFn =
    Box<dyn FnOnce(&mut MasterActor, &mut ActorContext<MasterMessage>) -> Result<(), ActorError> + Send>;

/// A handler step waiting to run on the actor after an asynchronous call.
pub struct Continuation {
    label: &'static str,
    run: ResumeFn,
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Continuation")
            .field("label", &self.label)
            .finish()
    }
}

/// Messages handled by the master actor.
#[derive(Debug)]
pub enum MasterMessage {
    SchedulerCall {
        call: scheduler::Call,
        principal: Option<Principal>,
        stream_id: Option<StreamId>,
        reply_to: Reply<SchedulerResponse>,
    },
    OperatorCall {
        call: operator::Call,
        principal: Option<Principal>,
        reply_to: Reply<OperatorResponse>,
    },
    RegisterAgent {
        agent_id: Option<AgentId>,
        info: AgentInfo,
        reply_to: Reply<AgentId>,
    },
    MarkAgentUnreachable {
        agent_id: AgentId,
        reply_to: Reply<()>,
    },
    Offer {
        framework_id: FrameworkId,
        agent_id: AgentId,
        resources: Resources,
        reply_to: Reply<OfferId>,
    },
    InverseOffer {
        framework_id: FrameworkId,
        agent_id: AgentId,
        reply_to: Reply<OfferId>,
    },
    StatusUpdate {
        agent_id: AgentId,
        status: TaskStatus,
        reply_to: Reply<()>,
    },
    /// Flush the read-only batch.
    ProcessBatch,
    /// Re-enter a handler after an asynchronous step.
    Resume(Continuation),
}

/// Delivers a result to a caller that may have gone away.
pub(crate) fn respond<T>(reply_to: Reply<T>, result: Result<T, MasterError>) {
    if reply_to.send(result).is_err() {
        debug!("Caller dropped before reply");
    }
}

// =============================================================================
// Actor
// =============================================================================

struct OperatorSubscriber {
    events: crate::queue::Queue<OperatorEvent>,
    approvers: ObjectApprovers,
}

pub struct MasterActor {
    state: ClusterState,
    collaborators: Collaborators,
    options: MasterOptions,
    batch: Vec<BatchedRequest>,
    subscribers: Vec<OperatorSubscriber>,
}

impl MasterActor {
    pub fn new(collaborators: Collaborators, options: MasterOptions) -> Self {
        Self {
            state: ClusterState::default(),
            collaborators,
            options,
            batch: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    /// Runs `future` off the actor and feeds its output to `then` on the
    /// actor once it completes.
    fn defer<T, F, K>(ctx: &ActorContext<MasterMessage>, label: &'static str, future: F, then: K)
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
        K: FnOnce(&mut MasterActor, &mut ActorContext<MasterMessage>, T) -> Result<(), ActorError>
            + Send
            + 'static,
    {
        let myself = ctx.myself.clone();
        tokio::spawn(async move {
            let value = future.await;
            let continuation = Continuation {
                label,
                run: Box::new(move |actor, ctx| then(actor, ctx, value)),
            };
            if myself.send(MasterMessage::Resume(continuation)).is_err() {
                warn!(label, "Master stopped before continuation could run");
            }
        });
    }

    /// Fetches approvers for `actions` off the actor, then resumes with them.
    /// Authorizer failures reach `then` as ServiceUnavailable.
    fn authorize<K>(
        &self,
        ctx: &ActorContext<MasterMessage>,
        label: &'static str,
        principal: Option<Principal>,
        actions: &[Action],
        then: K,
    ) where
        K: FnOnce(
                &mut MasterActor,
                &mut ActorContext<MasterMessage>,
                Result<ObjectApprovers, MasterError>,
            ) -> Result<(), ActorError>
            + Send
            + 'static,
    {
        let authorizer = self.collaborators.authorizer.clone();
        let actions = actions.to_vec();
        Self::defer(
            ctx,
            label,
            async move { ObjectApprovers::create(authorizer, principal, &actions).await },
            move |actor, ctx, result: Result<ObjectApprovers, AuthorizationError>| {
                then(
                    actor,
                    ctx,
                    result.map_err(|e| MasterError::Unavailable(e.to_string())),
                )
            },
        );
    }

    pub fn state(&self) -> &ClusterState {
        &self.state
    }
}

#[async_trait]
impl Actor for MasterActor {
    type Message = MasterMessage;

    fn name(&self) -> &str {
        "master"
    }

    async fn on_start(&mut self, _ctx: &mut ActorContext<MasterMessage>) -> Result<(), ActorError> {
        let snapshot = self
            .collaborators
            .registry
            .recover()
            .await
            .map_err(|e| ActorError::Permanent(format!("failed to recover registry: {e}")))?;

        info!(
            admitted = snapshot.admitted.len(),
            unreachable = snapshot.unreachable.len(),
            gone = snapshot.gone.len(),
            machines = snapshot.machines.len(),
            "Recovered cluster state"
        );

        self.state.agents.recovered = snapshot.admitted;
        self.state.agents.unreachable = snapshot.unreachable;
        self.state.agents.gone = snapshot.gone;
        self.state.machines = snapshot.machines;
        self.state.schedules = snapshot.schedules;
        Ok(())
    }

    async fn handle(
        &mut self,
        msg: MasterMessage,
        ctx: &mut ActorContext<MasterMessage>,
    ) -> Result<bool, ActorError> {
        match msg {
            MasterMessage::SchedulerCall {
                call,
                principal,
                stream_id,
                reply_to,
            } => self.scheduler_call(ctx, call, principal, stream_id, reply_to)?,
            MasterMessage::OperatorCall {
                call,
                principal,
                reply_to,
            } => self.operator_call(ctx, call, principal, reply_to)?,
            MasterMessage::RegisterAgent {
                agent_id,
                info,
                reply_to,
            } => self.register_agent(ctx, agent_id, info, reply_to),
            MasterMessage::MarkAgentUnreachable { agent_id, reply_to } => {
                self.mark_agent_unreachable(ctx, agent_id, reply_to)?
            }
            MasterMessage::Offer {
                framework_id,
                agent_id,
                resources,
                reply_to,
            } => {
                respond(reply_to, self.offer(framework_id, agent_id, resources));
            }
            MasterMessage::InverseOffer {
                framework_id,
                agent_id,
                reply_to,
            } => {
                respond(reply_to, self.inverse_offer(framework_id, agent_id));
            }
            MasterMessage::StatusUpdate {
                agent_id,
                status,
                reply_to,
            } => {
                respond(reply_to, self.status_update(agent_id, status));
            }
            MasterMessage::ProcessBatch => self.process_batch(),
            MasterMessage::Resume(continuation) => {
                debug!(label = continuation.label, "Resuming");
                (continuation.run)(self, ctx)?;
            }
        }
        Ok(true)
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext<MasterMessage>) {
        for framework in self.state.frameworks.values() {
            if let Some(events) = &framework.events {
                events.close();
            }
        }
        for subscriber in &self.subscribers {
            subscriber.events.close();
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable entry point to a running master.
#[derive(Clone, Debug)]
pub struct MasterHandle {
    actor: ActorHandle<MasterMessage>,
}

impl MasterHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> MasterMessage,
    ) -> Result<T, MasterError> {
        let (tx, rx) = oneshot::channel();
        self.actor.send(build(tx))?;
        rx.await.map_err(|_| MasterError::actor_stopped())?
    }

    /// Validates and runs a scheduler call. `stream_id` must echo the id
    /// handed out by SUBSCRIBE on every other call.
    pub async fn scheduler_call(
        &self,
        raw: scheduler::RawCall,
        principal: Option<Principal>,
        stream_id: Option<StreamId>,
    ) -> Result<SchedulerResponse, MasterError> {
        let call = scheduler::validation::validate(raw, principal.as_ref())?;
        self.request(|reply_to| MasterMessage::SchedulerCall {
            call,
            principal,
            stream_id,
            reply_to,
        })
        .await
    }

    pub async fn operator_call(
        &self,
        raw: operator::RawCall,
        principal: Option<Principal>,
    ) -> Result<OperatorResponse, MasterError> {
        let call = operator::validation::validate(raw)?;
        self.request(|reply_to| MasterMessage::OperatorCall {
            call,
            principal,
            reply_to,
        })
        .await
    }

    /// Admits an agent. A known `agent_id` re-registers a recovered agent.
    pub async fn register_agent(
        &self,
        agent_id: Option<AgentId>,
        info: AgentInfo,
    ) -> Result<AgentId, MasterError> {
        self.request(|reply_to| MasterMessage::RegisterAgent {
            agent_id,
            info,
            reply_to,
        })
        .await
    }

    pub async fn mark_agent_unreachable(&self, agent_id: AgentId) -> Result<(), MasterError> {
        self.request(|reply_to| MasterMessage::MarkAgentUnreachable { agent_id, reply_to })
            .await
    }

    /// Allocator callback: offers `resources` on `agent_id` to a framework.
    pub async fn offer(
        &self,
        framework_id: FrameworkId,
        agent_id: AgentId,
        resources: Resources,
    ) -> Result<OfferId, MasterError> {
        self.request(|reply_to| MasterMessage::Offer {
            framework_id,
            agent_id,
            resources,
            reply_to,
        })
        .await
    }

    /// Allocator callback: asks a framework to vacate a draining agent.
    pub async fn inverse_offer(
        &self,
        framework_id: FrameworkId,
        agent_id: AgentId,
    ) -> Result<OfferId, MasterError> {
        self.request(|reply_to| MasterMessage::InverseOffer {
            framework_id,
            agent_id,
            reply_to,
        })
        .await
    }

    /// Agent callback: a task changed state.
    pub async fn status_update(
        &self,
        agent_id: AgentId,
        status: TaskStatus,
    ) -> Result<(), MasterError> {
        self.request(|reply_to| MasterMessage::StatusUpdate {
            agent_id,
            status,
            reply_to,
        })
        .await
    }

    /// Returns true once the master actor has exited.
    pub fn is_stopped(&self) -> bool {
        self.actor.is_closed()
    }
}

/// Spawns the master actor. The returned task resolves with the actor's
/// exit status; a permanent error means the master must exit.
pub fn start(
    collaborators: Collaborators,
    options: MasterOptions,
    shutdown: watch::Receiver<bool>,
) -> (MasterHandle, JoinHandle<Result<(), ActorError>>) {
    let (actor, task) = actors::spawn(MasterActor::new(collaborators, options), shutdown);
    (MasterHandle { actor }, task)
}

/// Sends an operator event to every live subscriber allowed to see it,
/// dropping subscribers whose streams have closed.
fn broadcast(
    subscribers: &mut Vec<OperatorSubscriber>,
    event: impl Fn(&ObjectApprovers) -> Option<OperatorEvent>,
) {
    subscribers.retain(|subscriber| {
        if subscriber.events.is_closed() {
            return false;
        }
        match event(&subscriber.approvers) {
            Some(event) => subscriber.events.put(event),
            None => true,
        }
    });
}

/// Answers the caller with a fatal error and stops the actor.
pub(crate) fn fail_fatally<T>(reply_to: Reply<T>, message: String) -> Result<(), ActorError> {
    error!(%message, "Master cannot continue");
    respond(reply_to, Err(MasterError::Fatal(message.clone())));
    Err(ActorError::Permanent(message))
}

/// Principals carrying claims but no value may not mutate state.
fn claims_without_value(principal: Option<&Principal>) -> bool {
    principal.is_some_and(|p| p.value.is_none() && !p.claims.is_empty())
}

/// Puts a heartbeat on `events` every `interval` until the stream closes.
fn spawn_heartbeat<T: Send + 'static>(
    events: crate::queue::Queue<T>,
    interval: Duration,
    heartbeat: fn() -> T,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !events.put(heartbeat()) {
                break;
            }
        }
    });
}
