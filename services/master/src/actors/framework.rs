//! Core actor framework types and traits.
//!
//! Provides the building blocks the master runs on:
//! - `Actor` trait for defining actor behavior
//! - `ActorHandle` for posting messages to an actor's mailbox
//! - `spawn` to run an actor on its own task

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// The Actor trait defines behavior for an actor.
///
/// Actors:
/// - Process messages one at a time (no internal concurrency)
/// - Own mutable state not shared with other actors
/// - Communicate only via message passing
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop, or `Err` on failure.
    async fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &mut ActorContext<Self::Message>,
    ) -> Result<bool, ActorError>;

    /// Called before the first message is handled.
    async fn on_start(&mut self, _ctx: &mut ActorContext<Self::Message>) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called when the actor is about to stop.
    async fn on_stop(&mut self, _ctx: &mut ActorContext<Self::Message>) {}
}

/// Context provided to actors during message handling.
pub struct ActorContext<M: Message> {
    /// Actor's unique ID.
    pub actor_id: String,

    /// Handle to the actor's own mailbox, for continuations.
    pub myself: ActorHandle<M>,

    /// Shutdown signal receiver.
    pub shutdown: watch::Receiver<bool>,

    /// Message counter.
    pub messages_processed: u64,

    /// Last message processing time.
    pub last_message_at: Option<Instant>,

    /// Current actor state (for introspection).
    pub state: ActorState,
}

impl<M: Message> ActorContext<M> {
    fn new(actor_id: String, myself: ActorHandle<M>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            actor_id,
            myself,
            shutdown,
            messages_processed: 0,
            last_message_at: None,
            state: ActorState::Starting,
        }
    }

    /// Check if shutdown has been signaled.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// A context whose mailbox is drained by the caller instead of a run loop.
    #[cfg(test)]
    pub(crate) fn detached(name: &str) -> (Self, mpsc::UnboundedReceiver<M>) {
        let (myself, rx) = ActorHandle::channel(name);
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let mut ctx = Self::new(myself.actor_id().to_string(), myself, shutdown);
        ctx.state = ActorState::Running;
        (ctx, rx)
    }
}

/// Actor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    /// Actor is starting up.
    Starting,
    /// Actor is running and processing messages.
    Running,
    /// Actor is stopping.
    Stopping,
    /// Actor has stopped.
    Stopped,
    /// Actor has failed.
    Failed,
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in actors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActorError {
    /// Error the actor cannot continue past; the loop stops.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// Actor has stopped.
    #[error("actor stopped")]
    ActorStopped,
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for posting messages to an actor. The mailbox is unbounded, so
/// posting never waits.
pub struct ActorHandle<M: Message> {
    tx: mpsc::UnboundedSender<M>,
    actor_id: Arc<str>,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: Arc::clone(&self.actor_id),
        }
    }
}

impl<M: Message> Debug for ActorHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorHandle")
            .field("actor_id", &self.actor_id)
            .finish()
    }
}

impl<M: Message> ActorHandle<M> {
    fn channel(name: &str) -> (Self, mpsc::UnboundedReceiver<M>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor_id = format!("{}_{}", name, generate_actor_id());
        (
            Self {
                tx,
                actor_id: actor_id.into(),
            },
            rx,
        )
    }

    /// Append a message to the tail of the actor's mailbox.
    pub fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.send(msg).map_err(|_| ActorError::ActorStopped)
    }

    /// Returns true once the actor loop has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Get the actor ID.
    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }
}

// =============================================================================
// Spawning
// =============================================================================

/// Run `actor` on its own task. The task ends when the actor asks to stop,
/// fails permanently, or `shutdown` flips to true.
pub fn spawn<A: Actor>(
    actor: A,
    shutdown: watch::Receiver<bool>,
) -> (ActorHandle<A::Message>, JoinHandle<Result<(), ActorError>>) {
    let (handle, rx) = ActorHandle::channel(actor.name());
    let ctx = ActorContext::new(handle.actor_id().to_string(), handle.clone(), shutdown);

    info!(actor_id = %handle.actor_id(), "Spawned actor");
    let task = tokio::spawn(run_actor_loop(actor, rx, ctx));
    (handle, task)
}

// =============================================================================
// Actor Loop
// =============================================================================

#[instrument(skip_all, name = "actor_loop", fields(actor_id = %ctx.actor_id))]
async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::UnboundedReceiver<A::Message>,
    mut ctx: ActorContext<A::Message>,
) -> Result<(), ActorError> {
    let actor_id = ctx.actor_id.clone();
    let mut shutdown = ctx.shutdown.clone();

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %actor_id, error = %e, "Actor failed to start");
        ctx.state = ActorState::Failed;
        return Err(e);
    }

    ctx.state = ActorState::Running;
    debug!(actor_id = %actor_id, "Actor started");

    let mut outcome = Ok(());
    loop {
        tokio::select! {
            biased;

            // Check shutdown first
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(actor_id = %actor_id, "Actor received shutdown signal");
                    break;
                }
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!(actor_id = %actor_id, "Actor mailbox closed");
                    break;
                };
                ctx.messages_processed += 1;
                ctx.last_message_at = Some(Instant::now());

                match actor.handle(msg, &mut ctx).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(actor_id = %actor_id, "Actor requested stop");
                        break;
                    }
                    Err(e) => {
                        error!(actor_id = %actor_id, error = %e, "Actor failed");
                        ctx.state = ActorState::Failed;
                        outcome = Err(e);
                        break;
                    }
                }
            }
        }
    }

    if ctx.state != ActorState::Failed {
        ctx.state = ActorState::Stopping;
    }
    actor.on_stop(&mut ctx).await;
    if ctx.state != ActorState::Failed {
        ctx.state = ActorState::Stopped;
    }

    info!(
        actor_id = %actor_id,
        messages_processed = ctx.messages_processed,
        "Actor stopped"
    );
    outcome
}

// =============================================================================
// Helpers
// =============================================================================

static ACTOR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_actor_id() -> u64 {
    ACTOR_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

// =============================================================================
// Tests
// =============================================================================
