use std::mem;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::command::Command;
use crate::event::DomainEvent;

/// An `Aggregate` is the consistency boundary the session coordinates: an entity with a stable
/// identifier that mutates under command handlers and accumulates the events those mutations
/// emit, until the session drains them.
///
/// State and behavior live on the implementor; the session only needs the identifier and the
/// drainable queue. Embedding an [`Outbox`] is the simplest way to satisfy the queue contract.
pub trait Aggregate: Send + Sync + 'static {
    /// The aggregate name, used to qualify tracing spans and session logs.
    const NAME: &'static str;

    /// The closed set of commands this aggregate accepts.
    type Command: Command;

    /// The closed set of events this aggregate emits.
    type Event: DomainEvent;

    /// The identifier of this aggregate instance.
    fn id(&self) -> Uuid;

    /// Empties the internal event queue, returning the events in emission order.
    fn drain_events(&mut self) -> Vec<Self::Event>;
}

/// Shared handle to an aggregate enrolled in a session.
///
/// The session is the logical owner while its transaction is open; the caller keeps the handle
/// across transactions, e.g. to enroll the same aggregate into a follow-up session when
/// checkpointing long-running work with intermediate commits.
pub type SharedAggregate<A> = Arc<Mutex<A>>;

/// FIFO queue of the events an aggregate emitted but the session has not drained yet.
#[derive(Debug)]
pub struct Outbox<E> {
    pending: Vec<E>,
}

impl<E> Outbox<E> {
    /// Creates an empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self { pending: Vec::new() }
    }

    /// Appends an emitted event.
    pub fn record(&mut self, event: E) {
        self.pending.push(event);
    }

    /// Empties the queue, returning the events in emission order.
    pub fn drain(&mut self) -> Vec<E> {
        mem::take(&mut self.pending)
    }

    /// Number of pending events.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether there are no pending events.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<E> Default for Outbox<E> {
    fn default() -> Self {
        Self::new()
    }
}
