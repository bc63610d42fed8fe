use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// A resolved dependency value, type-erased behind a shared pointer.
pub type Injected = Arc<dyn Any + Send + Sync>;

type FactoryError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed factory producing an [`Injected`] value from the dependencies resolved so far.
type FactoryFn = dyn Fn(&Dependencies) -> Result<Injected, FactoryError> + Send + Sync;

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    /// The requested key is not among the handler's declared dependencies.
    #[error("dependency `{0}` was not declared by the handler")]
    NotDeclared(&'static str),
    /// The resolved value is not of the requested type.
    #[error("dependency `{key}` is not of type `{expected}`")]
    Downcast {
        key: &'static str,
        expected: &'static str,
    },
    /// The default or override factory failed.
    #[error("factory for dependency `{key}` failed: {source}")]
    Factory {
        key: &'static str,
        #[source]
        source: FactoryError,
    },
}

/// Declares one injected parameter of a handler: a key plus the default factory used whenever
/// no override is installed for that key.
///
/// Factories run at dispatch time, once per handler invocation; nothing is cached across
/// dispatches, so no stale state leaks from one transaction into the next.
#[derive(Clone)]
pub struct Dependency {
    key: &'static str,
    default: Arc<FactoryFn>,
}

impl Dependency {
    /// Declares a dependency built by a zero-argument factory.
    pub fn new<T, F>(key: &'static str, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            key,
            default: Arc::new(move |_| Ok(Arc::new(factory()))),
        }
    }

    /// Declares a dependency whose factory may fail, and may consult the dependencies declared
    /// before it in the handler's list. Declaration order is resolution order.
    pub fn derived<T, F>(key: &'static str, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&Dependencies) -> Result<T, FactoryError> + Send + Sync + 'static,
    {
        Self {
            key,
            default: Arc::new(move |resolved| Ok(Arc::new(factory(resolved)?))),
        }
    }

    /// The key this dependency resolves under.
    pub fn key(&self) -> &'static str {
        self.key
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency").field("key", &self.key).finish_non_exhaustive()
    }
}

/// The values resolved for one handler invocation, keyed by declaration key.
#[derive(Default)]
pub struct Dependencies {
    values: HashMap<&'static str, Injected>,
}

impl Dependencies {
    /// Typed access to a resolved value.
    ///
    /// # Errors
    ///
    /// Will return an `Err` if the key was not declared, or if the resolved value is not a `T`.
    pub fn get<T>(&self, key: &'static str) -> Result<Arc<T>, ResolveError>
    where
        T: Send + Sync + 'static,
    {
        let value: &Injected = self.values.get(key).ok_or(ResolveError::NotDeclared(key))?;

        Arc::clone(value).downcast::<T>().map_err(|_| ResolveError::Downcast {
            key,
            expected: type_name::<T>(),
        })
    }

    /// Whether a value was resolved under `key`.
    pub fn contains(&self, key: &'static str) -> bool {
        self.values.contains_key(key)
    }

    fn insert(&mut self, key: &'static str, value: Injected) {
        self.values.insert(key, value);
    }
}

impl fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

/// Override table consulted on every dispatch: an override installed for a key always wins over
/// any handler's default factory while it stays installed.
///
/// The table lives on the bus, so overrides installed through a shared bus apply to every
/// session dispatching over it. Installation goes through a lock and works on a shared
/// reference; the lock is never held while user code runs.
#[derive(Default)]
pub struct Resolver {
    overrides: RwLock<HashMap<&'static str, Arc<FactoryFn>>>,
}

impl Resolver {
    /// Creates a resolver with no overrides installed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs an override factory for `key`, replacing any previous override.
    pub fn set_override<T, F>(&self, key: &'static str, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let factory: Arc<FactoryFn> = Arc::new(move |_| Ok(Arc::new(factory())));
        self.install(key, factory);
    }

    /// Installs a fallible override factory for `key`; like [`Dependency::derived`], it may
    /// consult the dependencies resolved before `key` in the handler's declaration order.
    pub fn set_override_with<T, F>(&self, key: &'static str, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&Dependencies) -> Result<T, FactoryError> + Send + Sync + 'static,
    {
        let factory: Arc<FactoryFn> = Arc::new(move |resolved| Ok(Arc::new(factory(resolved)?)));
        self.install(key, factory);
    }

    /// Removes the override for `key`, restoring the handlers' default factories. Returns
    /// whether an override was installed.
    pub fn clear_override(&self, key: &'static str) -> bool {
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    /// Removes every installed override.
    pub fn clear_overrides(&self) {
        self.overrides.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Resolves a handler's declared dependencies, in declaration order, consulting the
    /// override table per key. Runs fresh on every dispatch.
    pub(crate) fn resolve_entry(&self, specs: &[Dependency]) -> Result<Dependencies, ResolveError> {
        let mut resolved: Dependencies = Dependencies::default();

        for spec in specs {
            let factory: Arc<FactoryFn> = self
                .overrides
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(spec.key)
                .cloned()
                .unwrap_or_else(|| Arc::clone(&spec.default));

            let value: Injected = factory(&resolved).map_err(|source| ResolveError::Factory {
                key: spec.key,
                source,
            })?;

            resolved.insert(spec.key, value);
        }

        Ok(resolved)
    }

    fn install(&self, key: &'static str, factory: Arc<FactoryFn>) {
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, factory);
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let overrides = self.overrides.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Resolver").field("overrides", &overrides.len()).finish()
    }
}
