use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// This trait is used to mark the closed set of events an aggregate emits. An event is an
/// immutable fact; it is drained from the aggregate by the session, dispatched, and not kept
/// afterwards unless a handler chooses to persist it.
pub trait DomainEvent: Send + Sync {
    /// Stable tag identifying the event variant. The bus fans an event out to the handlers
    /// registered for this tag, in registration order.
    fn kind(&self) -> &'static str;

    /// The identifier of the aggregate the fact is about, when there is one.
    fn subject(&self) -> Option<Uuid>;
}

/// Reserved kind tags for the notifications the session synthesizes itself. Register event
/// handlers on these tags to observe the transaction lifecycle.
///
/// The `session.` prefix is reserved: domain events must not use it.
pub mod lifecycle {
    /// An aggregate joined a session's working set.
    pub const ADDED: &str = "session.added";
    /// A session committed; dispatched once per working aggregate.
    pub const COMMITTED: &str = "session.committed";
    /// A session rolled back; dispatched once per working aggregate.
    pub const ROLLED_BACK: &str = "session.rolled_back";
}

/// A `SessionEvent` contains the payload (the original event, or a lifecycle notification)
/// alongside the event's metadata.
#[derive(Debug, Serialize)]
pub struct SessionEvent<E> {
    /// Uniquely identifies this dispatch among all events emitted from all aggregates.
    pub id: Uuid,
    /// The timestamp of when the event entered the bus.
    pub occurred_on: DateTime<Utc>,
    /// The original, emitted, event or a session lifecycle notification.
    pub payload: EventPayload<E>,
}

/// The closed set of payloads a [`SessionEvent`] can carry: a domain event, or one of the
/// notifications only the session synthesizes.
#[derive(Debug, Serialize)]
pub enum EventPayload<E> {
    /// An event emitted by an aggregate or a handler.
    Domain(E),
    /// The aggregate joined the working set.
    Added {
        /// The enrolled aggregate.
        aggregate_id: Uuid,
    },
    /// The session committed the aggregate.
    Committed {
        /// The persisted aggregate.
        aggregate_id: Uuid,
    },
    /// The session rolled the aggregate back.
    RolledBack {
        /// The restored aggregate.
        aggregate_id: Uuid,
    },
}

impl<E> SessionEvent<E>
where
    E: DomainEvent,
{
    /// Wraps a domain event into a new envelope, stamping id and timestamp.
    pub fn new(payload: E) -> Self {
        Self::with_payload(EventPayload::Domain(payload))
    }

    pub(crate) fn added(aggregate_id: Uuid) -> Self {
        Self::with_payload(EventPayload::Added { aggregate_id })
    }

    pub(crate) fn committed(aggregate_id: Uuid) -> Self {
        Self::with_payload(EventPayload::Committed { aggregate_id })
    }

    pub(crate) fn rolled_back(aggregate_id: Uuid) -> Self {
        Self::with_payload(EventPayload::RolledBack { aggregate_id })
    }

    fn with_payload(payload: EventPayload<E>) -> Self {
        Self {
            id: Uuid::new_v4(),
            occurred_on: Utc::now(),
            payload,
        }
    }

    /// The kind tag the bus dispatches this envelope by: the domain event's own tag, or one of
    /// the [`lifecycle`] constants.
    pub fn kind(&self) -> &'static str {
        match &self.payload {
            EventPayload::Domain(event) => event.kind(),
            EventPayload::Added { .. } => lifecycle::ADDED,
            EventPayload::Committed { .. } => lifecycle::COMMITTED,
            EventPayload::RolledBack { .. } => lifecycle::ROLLED_BACK,
        }
    }

    /// The aggregate this envelope is about. Lifecycle notifications always carry one; domain
    /// events may not.
    pub fn subject(&self) -> Option<Uuid> {
        match &self.payload {
            EventPayload::Domain(event) => event.subject(),
            EventPayload::Added { aggregate_id }
            | EventPayload::Committed { aggregate_id }
            | EventPayload::RolledBack { aggregate_id } => Some(*aggregate_id),
        }
    }

    /// Returns the original, emitted, event.
    pub const fn payload(&self) -> &EventPayload<E> {
        &self.payload
    }

    /// The domain payload, when this envelope is not a lifecycle notification.
    pub fn as_domain(&self) -> Option<&E> {
        match &self.payload {
            EventPayload::Domain(event) => Some(event),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    enum TestEvent {
        Opened { id: Uuid },
        Audited,
    }

    impl DomainEvent for TestEvent {
        fn kind(&self) -> &'static str {
            match self {
                TestEvent::Opened { .. } => "test.opened",
                TestEvent::Audited => "test.audited",
            }
        }

        fn subject(&self) -> Option<Uuid> {
            match self {
                TestEvent::Opened { id } => Some(*id),
                TestEvent::Audited => None,
            }
        }
    }

    #[test]
    fn domain_envelope_delegates_kind_and_subject() {
        let id: Uuid = Uuid::new_v4();
        let event: SessionEvent<TestEvent> = SessionEvent::new(TestEvent::Opened { id });

        assert_eq!(event.kind(), "test.opened");
        assert_eq!(event.subject(), Some(id));
        assert!(event.as_domain().is_some());
    }

    #[test]
    fn system_level_events_may_have_no_subject() {
        let event: SessionEvent<TestEvent> = SessionEvent::new(TestEvent::Audited);

        assert_eq!(event.subject(), None);
    }

    #[test]
    fn lifecycle_envelopes_use_reserved_kinds_and_carry_the_aggregate() {
        let id: Uuid = Uuid::new_v4();

        let added: SessionEvent<TestEvent> = SessionEvent::added(id);
        let committed: SessionEvent<TestEvent> = SessionEvent::committed(id);
        let rolled_back: SessionEvent<TestEvent> = SessionEvent::rolled_back(id);

        assert_eq!(added.kind(), lifecycle::ADDED);
        assert_eq!(committed.kind(), lifecycle::COMMITTED);
        assert_eq!(rolled_back.kind(), lifecycle::ROLLED_BACK);

        assert_eq!(added.subject(), Some(id));
        assert_eq!(committed.subject(), Some(id));
        assert_eq!(rolled_back.subject(), Some(id));

        assert!(added.as_domain().is_none());
    }

    #[test]
    fn each_envelope_gets_a_distinct_id() {
        let first: SessionEvent<TestEvent> = SessionEvent::new(TestEvent::Audited);
        let second: SessionEvent<TestEvent> = SessionEvent::new(TestEvent::Audited);

        assert_ne!(first.id, second.id);
    }
}
