//! A transactional unit of work for driving aggregates through commands and events.
//!
//! A [`Session`] tracks a working set of aggregates behind shared handles, routes commands to
//! their handlers through a [`MessageBus`], buffers everything handlers publish, and settles
//! the whole batch at once: [`Session::commit`] persists every aggregate through its
//! [`Repository`] and releases the buffered publications to their [`Subscriber`]s, while
//! [`Session::rollback`] restores every aggregate and drops the buffer. Until then nothing is
//! written and nothing is delivered.
//!
//! Handlers declare the collaborators they need as [`Dependency`] entries; the bus resolves
//! them fresh on every dispatch, and the [`Resolver`] swaps implementations at the call site
//! without touching handler code.

mod aggregate;
mod bus;
mod command;
mod event;
mod handler;
mod publisher;
mod repository;
mod resolver;
mod session;

pub use crate::aggregate::{Aggregate, Outbox, SharedAggregate};
pub use crate::bus::{DispatchError, MessageBus, RegistryError};
pub use crate::command::{Command, Output};
pub use crate::event::{lifecycle, DomainEvent, EventPayload, SessionEvent};
pub use crate::handler::{CommandHandler, Context, EventHandler, HandlerError};
pub use crate::publisher::{
    DeliveryFailure, FlushError, Publication, PublishError, Publisher, Subscriber,
    SubscriberError,
};
pub use crate::repository::{Repository, StorageError};
pub use crate::resolver::{Dependencies, Dependency, Injected, ResolveError, Resolver};
pub use crate::session::{Session, SessionBuilder, SessionError, SessionState};
