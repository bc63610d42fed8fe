use std::collections::HashMap;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::Instrument;

use crate::aggregate::Aggregate;
use crate::command::{Command, Output};
use crate::event::SessionEvent;
use crate::handler::{CommandHandler, Context, EventHandler, HandlerError};
use crate::publisher::Publisher;
use crate::resolver::{Dependency, ResolveError, Resolver};

/// Error raised while wiring handlers onto a [`MessageBus`].
#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    /// A command kind admits exactly one handler.
    #[error("a command handler is already registered for kind `{0}`")]
    HandlerAlreadyRegistered(&'static str),
}

/// Error raised while dispatching a message.
#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    /// No command handler is registered for the dispatched kind.
    #[error("no command handler registered for kind `{0}`")]
    UnregisteredCommand(&'static str),
    /// Dependency resolution for a handler failed.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// A handler returned an error.
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

struct CommandEntry<A>
where
    A: Aggregate,
{
    handler: Box<dyn CommandHandler<A>>,
    dependencies: Vec<Dependency>,
}

struct EventEntry<A>
where
    A: Aggregate,
{
    handler: Box<dyn EventHandler<A>>,
    dependencies: Vec<Dependency>,
}

/// Routes commands to their single registered handler and fans events out to every handler
/// registered for their kind, resolving each handler's declared dependencies fresh per
/// dispatch.
///
/// The bus is an explicit value: registrations are scoped to the instance, so a fresh bus per
/// test isolates handler sets, while wrapping one bus in an [`Arc`](std::sync::Arc) shares its
/// registrations among every session constructed over it. Registration borrows the bus mutably,
/// so the handler set is complete before the bus can be shared.
pub struct MessageBus<A>
where
    A: Aggregate,
{
    commands: HashMap<&'static str, CommandEntry<A>>,
    events: HashMap<&'static str, Vec<EventEntry<A>>>,
    resolver: Resolver,
}

impl<A> MessageBus<A>
where
    A: Aggregate,
{
    /// Creates a bus with no handlers registered.
    pub fn new() -> Self {
        Self {
            commands: HashMap::new(),
            events: HashMap::new(),
            resolver: Resolver::new(),
        }
    }

    /// Registers the single command handler for `kind`. The handler's dependency declarations
    /// are snapshotted here, at registration.
    ///
    /// # Errors
    ///
    /// Will return an `Err` if a handler is already registered for `kind`.
    pub fn register_command(
        &mut self,
        kind: &'static str,
        handler: impl CommandHandler<A> + 'static,
    ) -> Result<&mut Self, RegistryError> {
        if self.commands.contains_key(kind) {
            return Err(RegistryError::HandlerAlreadyRegistered(kind));
        }

        let dependencies: Vec<Dependency> = handler.dependencies();
        self.commands.insert(
            kind,
            CommandEntry {
                handler: Box::new(handler),
                dependencies,
            },
        );

        Ok(self)
    }

    /// Appends an event handler for `kind`; a kind's handlers run in registration order. The
    /// [`lifecycle`](crate::event::lifecycle) kinds register like any other.
    pub fn register_event(
        &mut self,
        kind: &'static str,
        handler: impl EventHandler<A> + 'static,
    ) -> &mut Self {
        let dependencies: Vec<Dependency> = handler.dependencies();
        self.events.entry(kind).or_default().push(EventEntry {
            handler: Box::new(handler),
            dependencies,
        });

        self
    }

    /// The resolver whose overrides apply to every handler dispatched through this bus.
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Dispatches a command to its registered handler with exclusive access to the targeted
    /// aggregate, then dispatches the events the handler emitted through its context,
    /// depth-first. Returns the handler's output.
    pub async fn dispatch_command(
        &self,
        aggregate: &mut A,
        command: A::Command,
        publisher: &mut Publisher,
    ) -> Result<Output, DispatchError> {
        let kind: &'static str = command.kind();
        let entry: &CommandEntry<A> = self
            .commands
            .get(kind)
            .ok_or(DispatchError::UnregisteredCommand(kind))?;

        let dependencies = self.resolver.resolve_entry(&entry.dependencies)?;
        let span = tracing::debug_span!(
            "uow.command_handler",
            aggregate_id = %aggregate.id(),
            kind = kind,
            command_handler = entry.handler.name()
        );

        let mut ctx: Context<'_, A::Event> = Context::new(publisher, dependencies);
        let handled: Result<Output, HandlerError> =
            entry.handler.handle(aggregate, command, &mut ctx).instrument(span).await;

        let output: Output = match handled {
            Ok(output) => output,
            Err(error) => {
                tracing::error!({
                    aggregate_id = %aggregate.id(),
                    kind = kind,
                    command_handler = entry.handler.name(),
                    error = ?error,
                }, "command handler failed to handle command");

                return Err(DispatchError::Handler(error));
            }
        };

        for event in ctx.into_emitted() {
            let envelope: SessionEvent<A::Event> = SessionEvent::new(event);
            self.dispatch_event(&envelope, publisher).await?;
        }

        Ok(output)
    }

    /// Dispatches an event envelope to every handler registered for its kind, in registration
    /// order. Events a handler emits through its context are dispatched depth-first: each is
    /// fully handled, cascades included, before the next handler of the triggering event runs.
    ///
    /// An event with no registered handlers is a no-op.
    pub fn dispatch_event<'a>(
        &'a self,
        event: &'a SessionEvent<A::Event>,
        publisher: &'a mut Publisher,
    ) -> BoxFuture<'a, Result<(), DispatchError>> {
        async move {
            let entries: &[EventEntry<A>] = match self.events.get(event.kind()) {
                Some(entries) => entries,
                None => return Ok(()),
            };

            for entry in entries {
                let dependencies = self.resolver.resolve_entry(&entry.dependencies)?;
                let span = tracing::debug_span!(
                    "uow.event_handler",
                    event_id = %event.id,
                    kind = event.kind(),
                    event_handler = entry.handler.name()
                );

                let mut ctx: Context<'_, A::Event> = Context::new(&mut *publisher, dependencies);
                let handled: Result<(), HandlerError> =
                    entry.handler.handle(event, &mut ctx).instrument(span).await;

                if let Err(error) = handled {
                    tracing::error!({
                        event_id = %event.id,
                        kind = event.kind(),
                        event_handler = entry.handler.name(),
                        error = ?error,
                    }, "event handler failed to handle event");

                    return Err(DispatchError::Handler(error));
                }

                for emitted in ctx.into_emitted() {
                    let envelope: SessionEvent<A::Event> = SessionEvent::new(emitted);
                    self.dispatch_event(&envelope, &mut *publisher).await?;
                }
            }

            Ok(())
        }
        .boxed()
    }
}

impl<A> Default for MessageBus<A>
where
    A: Aggregate,
{
    fn default() -> Self {
        Self::new()
    }
}
