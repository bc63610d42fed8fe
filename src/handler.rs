use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::aggregate::Aggregate;
use crate::command::Output;
use crate::event::SessionEvent;
use crate::publisher::{PublishError, Publisher};
use crate::resolver::{Dependencies, Dependency, ResolveError};

/// Error returned by a command or event handler. Wraps whatever the handler failed with; the
/// session treats it as a transaction failure and propagates it to the caller.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct HandlerError(Box<dyn std::error::Error + Send + Sync>);

impl HandlerError {
    /// Wraps a handler-specific error.
    pub fn new(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(error.into())
    }
}

impl From<ResolveError> for HandlerError {
    fn from(error: ResolveError) -> Self {
        Self(Box::new(error))
    }
}

/// Execution context handed to a handler for a single invocation: access to the declared
/// dependencies, the owning publisher, and the cascade queue.
pub struct Context<'a, E> {
    publisher: &'a mut Publisher,
    dependencies: Dependencies,
    emitted: Vec<E>,
}

impl<'a, E> Context<'a, E> {
    pub(crate) fn new(publisher: &'a mut Publisher, dependencies: Dependencies) -> Self {
        Self {
            publisher,
            dependencies,
            emitted: Vec::new(),
        }
    }

    /// Publishes a message on a topic. Inside a session this is buffered and nothing reaches a
    /// subscriber before the transaction commits; through a standalone publisher delivery is
    /// immediate.
    pub async fn publish<M>(&mut self, topic: &str, message: &M) -> Result<(), PublishError>
    where
        M: Serialize + Sync + ?Sized,
    {
        self.publisher.publish(topic, message).await
    }

    /// Typed access to a dependency declared in the handler's [`dependencies`] list.
    ///
    /// [`dependencies`]: CommandHandler::dependencies
    pub fn get<T>(&self, key: &'static str) -> Result<Arc<T>, ResolveError>
    where
        T: Send + Sync + 'static,
    {
        self.dependencies.get(key)
    }

    /// Emits a follow-up event. Emitted events are dispatched depth-first as soon as this
    /// handler returns, before anything else proceeds.
    pub fn emit(&mut self, event: E) {
        self.emitted.push(event);
    }

    pub(crate) fn into_emitted(self) -> Vec<E> {
        self.emitted
    }
}

/// This trait is used to implement a command handler: the single processor registered for a
/// command kind, invoked with exclusive access to the targeted aggregate.
#[async_trait]
pub trait CommandHandler<A>: Send + Sync
where
    A: Aggregate,
{
    /// Handle the command by mutating the aggregate, optionally publishing or emitting through
    /// the context, and optionally returning a value to the dispatching caller.
    async fn handle(
        &self,
        aggregate: &mut A,
        command: A::Command,
        ctx: &mut Context<'_, A::Event>,
    ) -> Result<Output, HandlerError>;

    /// The injected parameters this handler declares. The bus snapshots the list at
    /// registration and resolves it fresh on every dispatch.
    fn dependencies(&self) -> Vec<Dependency> {
        Vec::new()
    }

    /// The name of the command handler. By default, this is the type name of the handler,
    /// but it can be overridden to provide a custom name. This name is used as
    /// part of tracing spans, to identify the handler being run.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Blanket implementation making a [`CommandHandler`] every (smart) pointer to a
/// [`CommandHandler`], e.g. `&H`, `Box<H>`, `Arc<H>`.
#[async_trait]
impl<A, Q, T> CommandHandler<A> for T
where
    A: Aggregate,
    Q: CommandHandler<A> + ?Sized,
    T: Deref<Target = Q> + Send + Sync,
{
    /// Deref call to [`CommandHandler::handle`].
    async fn handle(
        &self,
        aggregate: &mut A,
        command: A::Command,
        ctx: &mut Context<'_, A::Event>,
    ) -> Result<Output, HandlerError> {
        self.deref().handle(aggregate, command, ctx).await
    }

    /// Deref call to [`CommandHandler::dependencies`].
    fn dependencies(&self) -> Vec<Dependency> {
        self.deref().dependencies()
    }

    /// Deref call to [`CommandHandler::name`].
    fn name(&self) -> &'static str {
        self.deref().name()
    }
}

/// This trait is used to implement an event handler: one of the processors fanned out to for an
/// event kind, in registration order. Event handlers observe facts; they cannot return values.
#[async_trait]
pub trait EventHandler<A>: Send + Sync
where
    A: Aggregate,
{
    /// Handle an event and perform an action, optionally publishing or emitting follow-up
    /// events through the context.
    async fn handle(
        &self,
        event: &SessionEvent<A::Event>,
        ctx: &mut Context<'_, A::Event>,
    ) -> Result<(), HandlerError>;

    /// The injected parameters this handler declares. The bus snapshots the list at
    /// registration and resolves it fresh on every dispatch.
    fn dependencies(&self) -> Vec<Dependency> {
        Vec::new()
    }

    /// The name of the event handler. By default, this is the type name of the handler,
    /// but it can be overridden to provide a custom name. This name is used as
    /// part of tracing spans, to identify the handler being run.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Blanket implementation making an [`EventHandler`] every (smart) pointer to an
/// [`EventHandler`], e.g. `&H`, `Box<H>`, `Arc<H>`.
#[async_trait]
impl<A, Q, T> EventHandler<A> for T
where
    A: Aggregate,
    Q: EventHandler<A> + ?Sized,
    T: Deref<Target = Q> + Send + Sync,
{
    /// Deref call to [`EventHandler::handle`].
    async fn handle(
        &self,
        event: &SessionEvent<A::Event>,
        ctx: &mut Context<'_, A::Event>,
    ) -> Result<(), HandlerError> {
        self.deref().handle(event, ctx).await
    }

    /// Deref call to [`EventHandler::dependencies`].
    fn dependencies(&self) -> Vec<Dependency> {
        self.deref().dependencies()
    }

    /// Deref call to [`EventHandler::name`].
    fn name(&self) -> &'static str {
        self.deref().name()
    }
}
