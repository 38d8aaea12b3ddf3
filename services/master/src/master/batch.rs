//! Batching of read-only operator calls.
//!
//! Read-only calls queue up while the actor is busy. The first one to arrive
//! posts a single `ProcessBatch` message; when it is handled, every queued
//! handler runs against the same borrowed state, so they all observe one
//! consistent snapshot. Handlers are split across at most one scoped thread
//! per available core.

use std::num::NonZeroUsize;
use std::thread::{self, ScopedJoinHandle};

use tracing::{debug, warn};

use super::{respond, MasterActor, MasterMessage, Reply};
use crate::actors::ActorContext;
use crate::authz::ObjectApprovers;
use crate::error::MasterError;
use crate::operator::{Call, OperatorResponse, Response};
use crate::readonly::Handler;

type Job = (Handler, Call, ObjectApprovers);

enum Running<'scope> {
    Spawned(
        ScopedJoinHandle<'scope, Vec<Result<Response, MasterError>>>,
        usize,
    ),
    Inline(Vec<Result<Response, MasterError>>),
}

pub(super) struct BatchedRequest {
    handler: Handler,
    call: Call,
    approvers: ObjectApprovers,
    reply_to: Reply<OperatorResponse>,
}

impl BatchedRequest {
    pub(super) fn new(
        handler: Handler,
        call: Call,
        approvers: ObjectApprovers,
        reply_to: Reply<OperatorResponse>,
    ) -> Self {
        Self {
            handler,
            call,
            approvers,
            reply_to,
        }
    }
}

impl MasterActor {
    pub(super) fn submit_read_only(
        &mut self,
        ctx: &ActorContext<MasterMessage>,
        request: BatchedRequest,
    ) {
        if self.batch.is_empty() && ctx.myself.send(MasterMessage::ProcessBatch).is_err() {
            warn!("Master mailbox closed; dropping read-only request");
            return;
        }
        self.batch.push(request);
    }

    pub(super) fn process_batch(&mut self) {
        let batch = std::mem::take(&mut self.batch);
        if batch.is_empty() {
            return;
        }

        let (jobs, replies): (Vec<Job>, Vec<_>) = batch
            .into_iter()
            .map(|r| ((r.handler, r.call, r.approvers), r.reply_to))
            .unzip();

        let state = &self.state;
        let workers = thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        let chunk_size = jobs.len().div_ceil(workers);
        let run = |chunk: &[Job]| -> Vec<Result<Response, MasterError>> {
            chunk
                .iter()
                .map(|(handler, call, approvers)| Ok(handler(state, call, approvers)))
                .collect()
        };

        let results: Vec<Result<Response, MasterError>> = thread::scope(|scope| {
            let running: Vec<_> = jobs
                .chunks(chunk_size)
                .map(|chunk| {
                    match thread::Builder::new()
                        .name("master-read-only".to_string())
                        .spawn_scoped(scope, move || run(chunk))
                    {
                        Ok(handle) => Running::Spawned(handle, chunk.len()),
                        Err(e) => {
                            warn!(error = %e, "Running read-only handlers inline");
                            Running::Inline(run(chunk))
                        }
                    }
                })
                .collect();
            running
                .into_iter()
                .flat_map(|running| match running {
                    Running::Inline(results) => results,
                    Running::Spawned(handle, len) => handle.join().unwrap_or_else(|_| {
                        (0..len)
                            .map(|_| {
                                Err(MasterError::Fatal("read-only handler panicked".to_string()))
                            })
                            .collect()
                    }),
                })
                .collect()
        });

        debug!(size = replies.len(), "Processed read-only batch");
        for (reply_to, result) in replies.into_iter().zip(results) {
            respond(reply_to, result.map(OperatorResponse::Reply));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::oneshot;

    use super::*;
    use crate::actors::Actor;
    use crate::allocator::LocalAllocator;
    use crate::master::{Collaborators, MasterOptions};
    use crate::messenger::LocalMessenger;
    use crate::readonly;
    use crate::registry::InMemoryRegistry;
    use crate::resources::{Resource, Resources};
    use crate::scheduler::FrameworkInfo;
    use crate::state::{Agent, AgentInfo, Framework};
    use corral_id::{AgentId, FrameworkId};

    fn actor() -> MasterActor {
        MasterActor::new(
            Collaborators {
                registry: Arc::new(InMemoryRegistry::new()),
                allocator: Arc::new(LocalAllocator::new()),
                messenger: Arc::new(LocalMessenger::new()),
                authorizer: None,
            },
            MasterOptions::default(),
        )
    }

    fn request(
        call: Call,
    ) -> (
        BatchedRequest,
        oneshot::Receiver<Result<OperatorResponse, MasterError>>,
    ) {
        let (reply_to, rx) = oneshot::channel();
        let request = BatchedRequest {
            handler: readonly::handler_for(&call).unwrap(),
            approvers: ObjectApprovers::allow_all(None, call.actions()),
            call,
            reply_to,
        };
        (request, rx)
    }

    #[tokio::test]
    async fn test_batch_is_scheduled_once() {
        let mut actor = actor();
        let (ctx, mut mailbox) = ActorContext::detached("master");

        let (health, health_rx) = request(Call::GetHealth);
        let (agents, agents_rx) = request(Call::GetAgents);
        actor.submit_read_only(&ctx, health);
        actor.submit_read_only(&ctx, agents);

        assert!(matches!(mailbox.try_recv(), Ok(MasterMessage::ProcessBatch)));
        assert!(mailbox.try_recv().is_err());

        actor.process_batch();
        assert!(actor.batch.is_empty());
        assert!(matches!(
            health_rx.await.unwrap(),
            Ok(OperatorResponse::Reply(Response::GetHealth { healthy: true }))
        ));
        assert!(matches!(
            agents_rx.await.unwrap(),
            Ok(OperatorResponse::Reply(Response::GetAgents { .. }))
        ));
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let mut actor = actor();
        actor.process_batch();
        assert!(actor.batch.is_empty());
    }

    #[tokio::test]
    async fn test_new_batch_after_flush() {
        let mut actor = actor();
        let (ctx, mut mailbox) = ActorContext::detached("master");

        let (first, _first_rx) = request(Call::GetHealth);
        actor.submit_read_only(&ctx, first);
        actor.process_batch();

        let (second, _second_rx) = request(Call::GetHealth);
        actor.submit_read_only(&ctx, second);

        assert!(matches!(mailbox.try_recv(), Ok(MasterMessage::ProcessBatch)));
        assert!(matches!(mailbox.try_recv(), Ok(MasterMessage::ProcessBatch)));
    }

    #[tokio::test]
    async fn test_large_batch_answers_every_request() {
        let mut actor = actor();
        let (ctx, _mailbox) = ActorContext::detached("master");

        let receivers: Vec<_> = (0..256)
            .map(|_| {
                let (request, rx) = request(Call::GetHealth);
                actor.submit_read_only(&ctx, request);
                rx
            })
            .collect();
        actor.process_batch();

        for rx in receivers {
            assert!(matches!(
                rx.await.unwrap(),
                Ok(OperatorResponse::Reply(Response::GetHealth { healthy: true }))
            ));
        }
    }

    async fn agents_reply(
        rx: oneshot::Receiver<Result<OperatorResponse, MasterError>>,
    ) -> serde_json::Value {
        match rx.await.unwrap() {
            Ok(OperatorResponse::Reply(response)) => serde_json::to_value(response).unwrap(),
            other => panic!("expected a reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_batch_answers_from_one_snapshot() {
        let mut actor = actor();
        let (mut ctx, mut mailbox) = ActorContext::detached("master");

        let agent_id = AgentId::new();
        let info = AgentInfo {
            hostname: "a".to_string(),
            ip: None,
            capabilities: Default::default(),
            resources: Resources::from(vec![Resource::scalar("cpus", 4.0)]),
        };
        actor
            .state
            .agents
            .registered
            .insert(agent_id, Agent::new(agent_id, info));
        let framework_id = FrameworkId::new();
        let mut framework = Framework::new(
            framework_id,
            FrameworkInfo {
                id: Some(framework_id),
                name: "batch".to_string(),
                principal: None,
                roles: vec!["web".to_string()],
            },
        );
        framework.connected = true;
        actor.state.frameworks.insert(framework_id, framework);

        let batched: Vec<_> = (0..3)
            .map(|_| {
                let (request, rx) = request(Call::GetAgents);
                actor.submit_read_only(&ctx, request);
                rx
            })
            .collect();

        // A mutation that arrives after the reads is handled after the flush.
        let (offer_tx, offer_rx) = oneshot::channel();
        ctx.myself
            .send(MasterMessage::Offer {
                framework_id,
                agent_id,
                resources: Resources::from(vec![Resource::scalar("cpus", 1.0)]),
                reply_to: offer_tx,
            })
            .unwrap();
        while let Ok(msg) = mailbox.try_recv() {
            actor.handle(msg, &mut ctx).await.unwrap();
        }
        offer_rx.await.unwrap().unwrap();

        let mut replies = Vec::new();
        for rx in batched {
            replies.push(agents_reply(rx).await);
        }
        assert!(replies.windows(2).all(|pair| pair[0] == pair[1]));

        let (later, later_rx) = request(Call::GetAgents);
        actor.submit_read_only(&ctx, later);
        actor.process_batch();
        assert_ne!(agents_reply(later_rx).await, replies[0]);
    }
}
