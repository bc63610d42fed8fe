use std::ops::Deref;

use async_trait::async_trait;

use crate::aggregate::Aggregate;

/// Error type for repository implementations.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    /// Input/output error
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Serialization/deserialization error
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Error raised from a custom repository implementation.
    #[error(transparent)]
    Custom(Box<dyn std::error::Error + Send + Sync>),
}

impl StorageError {
    /// Wraps an implementation-specific error.
    pub fn custom(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Custom(error.into())
    }
}

/// A `Repository` is responsible for persisting aggregate state and for restoring an aggregate
/// to its last persisted state. It is invoked only by the session, at the transaction boundary:
/// `store` for every working aggregate on commit, `restore` for every working aggregate on
/// rollback.
///
/// `store` must be idempotent under repeated calls with identical state.
#[async_trait]
pub trait Repository<A>: Send + Sync
where
    A: Aggregate,
{
    /// Persists the current state of the aggregate.
    async fn store(&self, aggregate: &A) -> Result<(), StorageError>;

    /// Replaces the aggregate's in-memory state with its last persisted state.
    async fn restore(&self, aggregate: &mut A) -> Result<(), StorageError>;
}

/// Blanket implementation making a [`Repository`] every (smart) pointer to a [`Repository`],
/// e.g. `&Repo`, `Box<Repo>`, `Arc<Repo>`.
/// This is particularly useful when there's the need in your codebase to share one repository
/// between sessions.
#[async_trait]
impl<A, R, T> Repository<A> for T
where
    A: Aggregate,
    R: Repository<A> + ?Sized,
    T: Deref<Target = R> + Send + Sync,
{
    /// Deref call to [`Repository::store`].
    async fn store(&self, aggregate: &A) -> Result<(), StorageError> {
        self.deref().store(aggregate).await
    }

    /// Deref call to [`Repository::restore`].
    async fn restore(&self, aggregate: &mut A) -> Result<(), StorageError> {
        self.deref().restore(aggregate).await
    }
}
