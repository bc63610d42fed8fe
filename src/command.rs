use std::any::Any;
use std::fmt;

use uuid::Uuid;

/// This trait is used to mark the closed set of commands an aggregate accepts. A command is an
/// immutable instruction naming the aggregate instance it addresses; it is created and consumed
/// within a single dispatch.
pub trait Command: Send {
    /// Stable tag identifying the command variant. The bus routes a command to its single
    /// registered handler by this tag.
    fn kind(&self) -> &'static str;

    /// The identifier of the aggregate instance the command addresses.
    fn target(&self) -> Uuid;
}

/// Type-erased value returned by a command handler.
///
/// Commands are allowed a return value while events are not; the erasure keeps the bus registry
/// homogeneous. Use [`Output::downcast`] to recover the concrete type on the calling side.
pub struct Output(Option<Box<dyn Any + Send>>);

impl Output {
    /// An empty output, for handlers with nothing to return.
    #[must_use]
    pub fn none() -> Self {
        Self(None)
    }

    /// Wraps a concrete return value.
    pub fn new<T>(value: T) -> Self
    where
        T: Any + Send,
    {
        Self(Some(Box::new(value)))
    }

    /// Whether the handler returned nothing.
    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    /// Recovers the concrete return value, if the handler returned one of type `T`.
    pub fn downcast<T>(self) -> Option<T>
    where
        T: Any,
    {
        self.0.and_then(|value| value.downcast::<T>().ok()).map(|value| *value)
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(_) => f.write_str("Output(..)"),
            None => f.write_str("Output(none)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_round_trips_a_concrete_value() {
        let output: Output = Output::new(42_i64);

        assert!(!output.is_none());
        assert_eq!(output.downcast::<i64>(), Some(42));
    }

    #[test]
    fn output_downcast_to_the_wrong_type_yields_none() {
        let output: Output = Output::new("value".to_owned());

        assert_eq!(output.downcast::<i64>(), None);
    }

    #[test]
    fn empty_output_downcasts_to_none() {
        assert!(Output::none().is_none());
        assert_eq!(Output::none().downcast::<()>(), None);
    }
}
