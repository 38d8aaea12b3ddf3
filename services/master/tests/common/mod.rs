//! Shared harness for master integration tests.
//!
//! Runs a real master actor against the in-memory registry, allocator and
//! messenger so tests can both drive calls and inspect what collaborators saw.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use corral_id::{AgentId, FrameworkId, StreamId};
use corral_master::actors::ActorError;
use corral_master::allocator::LocalAllocator;
use corral_master::authz::{Acl, Acls, Authorizer, LocalAuthorizer, Principal};
use corral_master::messenger::LocalMessenger;
use corral_master::operator::{self, OperatorResponse, Response};
use corral_master::queue::Queue;
use corral_master::registry::InMemoryRegistry;
use corral_master::resources::{Resource, Resources};
use corral_master::scheduler::{
    self, CallType, Event, FrameworkInfo, SchedulerResponse, SubscribePayload,
};
use corral_master::state::{AgentInfo, Offer};
use corral_master::{start, Collaborators, MasterError, MasterHandle, MasterOptions};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(2);

pub struct Cluster {
    pub master: MasterHandle,
    pub registry: Arc<InMemoryRegistry>,
    pub allocator: Arc<LocalAllocator>,
    pub messenger: Arc<LocalMessenger>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), ActorError>>,
}

impl Cluster {
    pub fn start() -> Self {
        Self::with_authorizer(None)
    }

    /// Starts a master that evaluates `rules` with a non-permissive default.
    pub fn with_acls(rules: Vec<Acl>) -> Self {
        let authorizer: Arc<dyn Authorizer> = Arc::new(LocalAuthorizer::new(
            Acls {
                permissive: Some(false),
                rules,
            },
            false,
        ));
        Self::with_authorizer(Some(authorizer))
    }

    fn with_authorizer(authorizer: Option<Arc<dyn Authorizer>>) -> Self {
        let registry = Arc::new(InMemoryRegistry::new());
        let allocator = Arc::new(LocalAllocator::new());
        let messenger = Arc::new(LocalMessenger::new());
        let collaborators = Collaborators {
            registry: registry.clone(),
            allocator: allocator.clone(),
            messenger: messenger.clone(),
            authorizer,
        };
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (master, task) = start(collaborators, MasterOptions::default(), shutdown_rx);
        Self {
            master,
            registry,
            allocator,
            messenger,
            shutdown,
            task,
        }
    }

    /// Stops the master and returns its exit status.
    pub async fn stop(self) -> Result<(), ActorError> {
        let _ = self.shutdown.send(true);
        within(self.task).await.expect("master task panicked")
    }

    pub async fn register_agent(&self, hostname: &str, resources: Resources) -> AgentId {
        self.master
            .register_agent(None, agent_info(hostname, resources))
            .await
            .expect("agent registration failed")
    }

    pub async fn operator(
        &self,
        raw: operator::RawCall,
        principal: Option<&str>,
    ) -> Result<OperatorResponse, MasterError> {
        self.master.operator_call(raw, principal.map(Principal::new)).await
    }

    /// Runs a read-only operator call and unwraps its reply.
    pub async fn query(&self, call_type: operator::CallType) -> Response {
        let raw = operator::RawCall {
            call_type: Some(call_type),
            ..Default::default()
        };
        match self.operator(raw, None).await {
            Ok(OperatorResponse::Reply(response)) => response,
            other => panic!("expected a reply to {call_type:?}, got {other:?}"),
        }
    }

    pub async fn subscribe(&self, name: &str, roles: &[&str]) -> Framework {
        let info = FrameworkInfo {
            id: None,
            name: name.to_string(),
            principal: None,
            roles: roles.iter().map(|r| r.to_string()).collect(),
        };
        let response = self
            .master
            .scheduler_call(subscribe_call(info), None, None)
            .await
            .expect("subscribe failed");
        let SchedulerResponse::Subscribed(subscription) = response else {
            panic!("expected a subscription, got {response:?}");
        };
        let framework = Framework {
            id: subscription.framework_id,
            stream_id: subscription.stream_id,
            events: subscription.events,
        };
        assert!(matches!(framework.next_event().await, Event::Subscribed { .. }));
        framework
    }

    /// Sends a scheduler call on behalf of `framework`'s live stream.
    pub async fn call(
        &self,
        framework: &Framework,
        raw: scheduler::RawCall,
    ) -> Result<SchedulerResponse, MasterError> {
        let raw = scheduler::RawCall {
            framework_id: Some(framework.id),
            ..raw
        };
        self.master
            .scheduler_call(raw, None, Some(framework.stream_id))
            .await
    }

    /// Offers `resources` on `agent_id` and returns the offer as the
    /// framework received it.
    pub async fn offer(
        &self,
        framework: &Framework,
        agent_id: AgentId,
        resources: Resources,
    ) -> Offer {
        let offer_id = self
            .master
            .offer(framework.id, agent_id, resources)
            .await
            .expect("offer failed");
        match framework.next_event().await {
            Event::Offers { mut offers } => {
                let offer = offers.remove(0);
                assert_eq!(offer.id, offer_id);
                offer
            }
            other => panic!("expected offers, got {other:?}"),
        }
    }
}

pub struct Framework {
    pub id: FrameworkId,
    pub stream_id: StreamId,
    pub events: Queue<Event>,
}

impl Framework {
    pub async fn next_event(&self) -> Event {
        within(self.events.get())
            .await
            .expect("event stream closed")
    }
}

pub fn agent_info(hostname: &str, resources: Resources) -> AgentInfo {
    AgentInfo {
        hostname: hostname.to_string(),
        ip: None,
        capabilities: BTreeSet::new(),
        resources,
    }
}

pub fn resources(cpus: f64, mem: f64) -> Resources {
    Resources::from(vec![
        Resource::scalar("cpus", cpus),
        Resource::scalar("mem", mem),
    ])
}

pub fn subscribe_call(info: FrameworkInfo) -> scheduler::RawCall {
    scheduler::RawCall {
        framework_id: info.id,
        call_type: Some(CallType::Subscribe),
        subscribe: Some(SubscribePayload {
            framework_info: Some(info),
        }),
        ..Default::default()
    }
}

/// Awaits `future`, failing the test if it takes unreasonably long.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out waiting for the master")
}

/// Polls `check` until it holds.
pub async fn eventually(check: impl Fn() -> bool) {
    within(async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}
