use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::aggregate::{Aggregate, SharedAggregate};
use crate::bus::{DispatchError, MessageBus};
use crate::command::{Command, Output};
use crate::event::SessionEvent;
use crate::handler::HandlerError;
use crate::publisher::{FlushError, Publisher, Subscriber};
use crate::repository::{Repository, StorageError};
use crate::resolver::ResolveError;

/// Error raised by a [`Session`] operation.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    /// The aggregate is already part of this session's working set.
    #[error("aggregate `{0}` is already part of this session")]
    DuplicateAggregate(Uuid),
    /// The command targets an aggregate that is not part of this session's working set.
    #[error("aggregate `{0}` is not part of this session")]
    UnknownAggregate(Uuid),
    /// No command handler is registered for the dispatched kind.
    #[error("no command handler registered for kind `{0}`")]
    UnregisteredCommand(&'static str),
    /// Dependency resolution for a handler failed.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// A handler returned an error.
    #[error(transparent)]
    Handler(#[from] HandlerError),
    /// A repository read or write failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// One or more buffered publications could not be delivered at commit.
    #[error(transparent)]
    Delivery(#[from] FlushError),
    /// The session has already committed or rolled back.
    #[error("the session is closed")]
    Closed,
}

impl From<DispatchError> for SessionError {
    fn from(error: DispatchError) -> Self {
        match error {
            DispatchError::UnregisteredCommand(kind) => SessionError::UnregisteredCommand(kind),
            DispatchError::Resolve(error) => SessionError::Resolve(error),
            DispatchError::Handler(error) => SessionError::Handler(error),
        }
    }
}

/// Where a [`Session`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting aggregates and commands.
    Open,
    /// A commit is in progress.
    Committing,
    /// A rollback is in progress.
    RollingBack,
    /// Terminal. Every further operation fails with [`SessionError::Closed`].
    Idle,
}

/// Builder for a [`Session`]. Couples the repository and the bus with a publisher carrying
/// the subscriptions the session's committed work should reach.
pub struct SessionBuilder<A, R>
where
    A: Aggregate,
    R: Repository<A>,
{
    repository: R,
    bus: Arc<MessageBus<A>>,
    publisher: Publisher,
}

impl<A, R> SessionBuilder<A, R>
where
    A: Aggregate,
    R: Repository<A>,
{
    pub fn new(repository: R, bus: Arc<MessageBus<A>>) -> Self {
        Self {
            repository,
            bus,
            publisher: Publisher::buffered(),
        }
    }

    /// Replaces the session's publisher, keeping the subscriptions already made on it. The
    /// publisher is switched to buffered delivery when the session begins.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Publisher) -> Self {
        self.publisher = publisher;
        self
    }

    /// Subscribes `subscriber` to `topic` on the session's publisher.
    #[must_use]
    pub fn subscribe(mut self, topic: impl Into<String>, subscriber: Arc<dyn Subscriber>) -> Self {
        self.publisher.subscribe(topic, subscriber);
        self
    }

    /// Opens the session.
    pub fn begin(self) -> Session<A, R> {
        let mut publisher: Publisher = self.publisher;
        publisher.set_buffered();

        tracing::debug!({ aggregate = A::NAME }, "session opened");

        Session {
            repository: self.repository,
            bus: self.bus,
            publisher,
            working: HashMap::new(),
            order: Vec::new(),
            state: SessionState::Open,
            opened_at: Utc::now(),
        }
    }
}

/// A unit of work over a set of aggregates of one kind.
///
/// Aggregates join the working set through [`add`](Session::add) or
/// [`add_shared`](Session::add_shared) and are mutated exclusively by commands routed through
/// [`execute`](Session::execute). Nothing touches the repository and nothing reaches a
/// subscriber until [`commit`](Session::commit): repository writes happen in attach order,
/// then the publication buffer drains in publication order. [`rollback`](Session::rollback)
/// restores every aggregate from the repository and drops the buffer instead.
///
/// Commit and rollback close the session; every operation on a closed session fails with
/// [`SessionError::Closed`]. The aggregates themselves outlive it: hold on to the
/// [`SharedAggregate`] handles and attach them to the next session to work in commit-per-step
/// checkpoints.
///
/// Dropping an open session discards its buffered publications and warns. No repository
/// access happens on that path, so aggregate state diverges from storage; end a session
/// through [`commit`](Session::commit), [`rollback`](Session::rollback) or
/// [`run`](Session::run) instead.
pub struct Session<A, R>
where
    A: Aggregate,
    R: Repository<A>,
{
    repository: R,
    bus: Arc<MessageBus<A>>,
    publisher: Publisher,
    working: HashMap<Uuid, SharedAggregate<A>>,
    order: Vec<Uuid>,
    state: SessionState,
    opened_at: DateTime<Utc>,
}

impl<A, R> Session<A, R>
where
    A: Aggregate,
    R: Repository<A>,
{
    /// Opens a session whose publisher carries no subscriptions. Use a [`SessionBuilder`] to
    /// attach one that does.
    pub fn begin(repository: R, bus: Arc<MessageBus<A>>) -> Self {
        SessionBuilder::new(repository, bus).begin()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// When the session was opened.
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Whether the aggregate identified by `id` is part of the working set.
    pub fn contains(&self, id: Uuid) -> bool {
        self.working.contains_key(&id)
    }

    /// Number of aggregates in the working set.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The shared handle for `id`, if that aggregate is part of the working set.
    pub fn get(&self, id: Uuid) -> Option<SharedAggregate<A>> {
        self.working.get(&id).map(Arc::clone)
    }

    /// Attaches `aggregate` to the working set and returns the shared handle the session
    /// tracks it through.
    ///
    /// Dispatches a [`lifecycle::ADDED`](crate::event::lifecycle::ADDED) event, then any
    /// events the aggregate had queued before it was attached, in order.
    ///
    /// # Errors
    ///
    /// Will return an `Err` if the session is closed, if the aggregate is already part of the
    /// working set or if a triggered event handler fails.
    #[tracing::instrument(skip_all, fields(aggregate_id = %aggregate.id()), err)]
    pub async fn add(&mut self, aggregate: A) -> Result<SharedAggregate<A>, SessionError> {
        let handle: SharedAggregate<A> = Arc::new(Mutex::new(aggregate));
        self.add_shared(Arc::clone(&handle)).await?;
        Ok(handle)
    }

    /// Attaches an aggregate the caller already holds a shared handle to. This is how an
    /// aggregate moves between sessions: keep the handle, commit, attach it to the next one.
    ///
    /// # Errors
    ///
    /// Same conditions as [`add`](Session::add).
    #[tracing::instrument(skip_all, fields(aggregate = A::NAME), err)]
    pub async fn add_shared(&mut self, handle: SharedAggregate<A>) -> Result<(), SessionError> {
        self.ensure_open()?;

        let (id, queued) = {
            let mut aggregate = handle.lock().await;
            let id: Uuid = aggregate.id();
            if self.working.contains_key(&id) {
                return Err(SessionError::DuplicateAggregate(id));
            }

            (id, aggregate.drain_events())
        };

        self.working.insert(id, handle);
        self.order.push(id);

        tracing::debug!({ aggregate_id = %id, aggregate = A::NAME }, "aggregate added to session");

        let added: SessionEvent<A::Event> = SessionEvent::added(id);
        self.bus.dispatch_event(&added, &mut self.publisher).await?;

        for event in queued {
            let envelope: SessionEvent<A::Event> = SessionEvent::new(event);
            self.bus.dispatch_event(&envelope, &mut self.publisher).await?;
        }

        Ok(())
    }

    /// Routes `command` to its registered handler with exclusive access to the targeted
    /// aggregate, then dispatches every event the aggregate queued, depth-first, before
    /// returning the handler's output.
    ///
    /// # Errors
    ///
    /// Will return an `Err` if the session is closed, if the target is not part of the
    /// working set (the bus is never consulted in that case) or if the command handler, a
    /// triggered event handler or dependency resolution fails. The session stays open either
    /// way; the caller decides whether to retry, continue or roll back.
    #[tracing::instrument(skip_all, fields(aggregate_id = %command.target(), kind = command.kind()), err)]
    pub async fn execute(&mut self, command: A::Command) -> Result<Output, SessionError> {
        self.ensure_open()?;

        let id: Uuid = command.target();
        let handle: SharedAggregate<A> = match self.working.get(&id) {
            Some(handle) => Arc::clone(handle),
            None => return Err(SessionError::UnknownAggregate(id)),
        };

        let (output, queued) = {
            let mut aggregate = handle.lock().await;
            let output: Output = self
                .bus
                .dispatch_command(&mut aggregate, command, &mut self.publisher)
                .await?;

            (output, aggregate.drain_events())
        };

        // The guard is released before event dispatch. Handlers may reach this aggregate
        // through handles of their own.
        for event in queued {
            let envelope: SessionEvent<A::Event> = SessionEvent::new(event);
            self.bus.dispatch_event(&envelope, &mut self.publisher).await?;
        }

        Ok(output)
    }

    /// Persists every aggregate in the working set, flushes the buffered publications, then
    /// dispatches a [`lifecycle::COMMITTED`](crate::event::lifecycle::COMMITTED) event per
    /// aggregate and closes the session.
    ///
    /// The order is fixed: repository writes in attach order, the buffer in publication
    /// order, committed handlers last. Publications made by committed handlers still belong
    /// to this session and are flushed before this method returns.
    ///
    /// # Errors
    ///
    /// Will return an `Err` if a repository write fails, in which case the session rolls
    /// itself back before re-raising the write error, or if a delivery or a committed handler
    /// fails after the writes, in which case the writes stand and the session still closes.
    /// Handler errors take precedence over delivery failures when both occur.
    #[tracing::instrument(skip_all, fields(aggregate = A::NAME), err)]
    pub async fn commit(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.state = SessionState::Committing;

        for index in 0..self.order.len() {
            let id: Uuid = self.order[index];
            let handle: SharedAggregate<A> = match self.working.get(&id) {
                Some(handle) => Arc::clone(handle),
                None => continue,
            };

            let aggregate = handle.lock().await;
            if let Err(error) = self.repository.store(&aggregate).await {
                tracing::error!({ aggregate_id = %id, error = ?error }, "failed to persist aggregate, rolling back");
                drop(aggregate);

                self.state = SessionState::RollingBack;
                if let Some(secondary) = self.rollback_inner().await {
                    tracing::error!({ error = ?secondary }, "rollback after failed commit reported an error");
                }
                self.close();

                return Err(SessionError::Storage(error));
            }
        }

        let mut delivery_error: Option<FlushError> = None;
        let mut handler_error: Option<SessionError> = None;

        match self.publisher.flush().await {
            Ok(delivered) => {
                tracing::debug!({ delivered = delivered }, "session publications flushed");
            }
            Err(error) => {
                tracing::error!({ error = ?error }, "some session publications failed to deliver");
                delivery_error = Some(error);
            }
        }

        for index in 0..self.order.len() {
            let id: Uuid = self.order[index];
            let committed: SessionEvent<A::Event> = SessionEvent::committed(id);
            if let Err(error) = self.bus.dispatch_event(&committed, &mut self.publisher).await {
                tracing::error!({ aggregate_id = %id, error = ?error }, "committed handler failed");
                if handler_error.is_none() {
                    handler_error = Some(error.into());
                }
            }
        }

        if self.publisher.pending() > 0 {
            if let Err(error) = self.publisher.flush().await {
                match delivery_error.as_mut() {
                    Some(first) => {
                        first.delivered += error.delivered;
                        first.failures.extend(error.failures);
                    }
                    None => delivery_error = Some(error),
                }
            }
        }

        self.close();
        tracing::debug!({ aggregate = A::NAME }, "session committed");

        match (handler_error, delivery_error) {
            (Some(error), _) => Err(error),
            (None, Some(error)) => Err(SessionError::Delivery(error)),
            (None, None) => Ok(()),
        }
    }

    /// Restores every aggregate in the working set from the repository, discards the buffered
    /// publications, then dispatches a
    /// [`lifecycle::ROLLED_BACK`](crate::event::lifecycle::ROLLED_BACK) event per aggregate
    /// and closes the session.
    ///
    /// Every aggregate is attempted even when one restore fails; the first error is re-raised
    /// once the rollback has gone as far as it can.
    ///
    /// # Errors
    ///
    /// Will return an `Err` if a restore or a rolled-back handler fails. The session closes
    /// either way.
    #[tracing::instrument(skip_all, fields(aggregate = A::NAME), err)]
    pub async fn rollback(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.state = SessionState::RollingBack;

        let error: Option<SessionError> = self.rollback_inner().await;
        self.close();
        tracing::debug!({ aggregate = A::NAME }, "session rolled back");

        match error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Runs `operation` against this session, rolling back anything left open when it
    /// finishes.
    ///
    /// The closure decides the outcome: commit inside it to keep the work, return without
    /// committing to drop it. A session still open after the closure returns is rolled back,
    /// on success and on error alike; a rollback error on the success path replaces the
    /// result, while on the error path it is logged and the original error is returned.
    pub async fn run<T, E, F>(mut self, operation: F) -> Result<T, E>
    where
        E: From<SessionError>,
        F: for<'s> FnOnce(&'s mut Session<A, R>) -> BoxFuture<'s, Result<T, E>>,
    {
        let outcome: Result<T, E> = operation(&mut self).await;

        match outcome {
            Ok(value) => {
                if self.state == SessionState::Open {
                    self.rollback().await?;
                }

                Ok(value)
            }
            Err(error) => {
                if self.state == SessionState::Open {
                    if let Err(rollback_error) = self.rollback().await {
                        tracing::error!({ error = ?rollback_error }, "rollback after failed operation reported an error");
                    }
                }

                Err(error)
            }
        }
    }

    async fn rollback_inner(&mut self) -> Option<SessionError> {
        let mut first_error: Option<SessionError> = None;

        for index in 0..self.order.len() {
            let id: Uuid = self.order[index];
            let handle: SharedAggregate<A> = match self.working.get(&id) {
                Some(handle) => Arc::clone(handle),
                None => continue,
            };

            let mut aggregate = handle.lock().await;
            if let Err(error) = self.repository.restore(&mut aggregate).await {
                tracing::error!({ aggregate_id = %id, error = ?error }, "failed to restore aggregate");
                if first_error.is_none() {
                    first_error = Some(SessionError::Storage(error));
                }
            }

            // Whatever the aggregate queued since it was attached is stale now. Left in
            // place, a later attach would dispatch it as pre-queued work.
            aggregate.drain_events();
        }

        let discarded: usize = self.publisher.discard();
        if discarded > 0 {
            tracing::debug!({ discarded = discarded }, "buffered publications discarded");
        }

        for index in 0..self.order.len() {
            let id: Uuid = self.order[index];
            let rolled_back: SessionEvent<A::Event> = SessionEvent::rolled_back(id);
            if let Err(error) = self.bus.dispatch_event(&rolled_back, &mut self.publisher).await {
                tracing::error!({ aggregate_id = %id, error = ?error }, "rolled back handler failed");
                if first_error.is_none() {
                    first_error = Some(error.into());
                }
            }
        }

        // Rolled-back handlers may have published into the buffer. Nothing from this session
        // leaves it.
        let late: usize = self.publisher.discard();
        if late > 0 {
            tracing::debug!({ discarded = late }, "publications from rolled back handlers discarded");
        }

        first_error
    }

    fn close(&mut self) {
        self.working.clear();
        self.order.clear();
        self.state = SessionState::Idle;
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.state == SessionState::Open {
            Ok(())
        } else {
            Err(SessionError::Closed)
        }
    }
}

impl<A, R> Drop for Session<A, R>
where
    A: Aggregate,
    R: Repository<A>,
{
    fn drop(&mut self) {
        if self.state == SessionState::Open {
            let discarded: usize = self.publisher.discard();
            tracing::warn!(
                { aggregate = A::NAME, discarded = discarded },
                "session dropped while open, buffered publications discarded without restoring aggregates"
            );
        }
    }
}
