mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use uow::{
    lifecycle, CommandHandler, Context, HandlerError, MessageBus, Output, Publisher, Session,
    SessionBuilder, SessionError, SessionState, Subscriber,
};

use crate::common::{
    counter_bus, CaptureSubscriber, Counter, CounterCommand, CounterEvent, EmitOnThreshold,
    IncrementHandler, KindProbe, RecordingRepository,
};

struct CountingHandler {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl CommandHandler<Counter> for CountingHandler {
    async fn handle(
        &self,
        aggregate: &mut Counter,
        command: CounterCommand,
        _ctx: &mut Context<'_, CounterEvent>,
    ) -> Result<Output, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let CounterCommand::Increment { by, .. } = command {
            aggregate.increment(by);
        }

        Ok(Output::none())
    }
}

#[tokio::test]
async fn a_command_for_an_unknown_aggregate_never_reaches_the_bus() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut bus: MessageBus<Counter> = MessageBus::new();
    bus.register_command(
        "increment",
        CountingHandler {
            calls: Arc::clone(&calls),
        },
    )
    .unwrap();

    let repository = RecordingRepository::new();
    let mut session = Session::begin(Arc::clone(&repository), Arc::new(bus));
    session.add(Counter::new(Uuid::new_v4())).await.unwrap();

    let stranger: Uuid = Uuid::new_v4();
    let error = session
        .execute(CounterCommand::Increment { id: stranger, by: 1 })
        .await
        .unwrap_err();

    assert!(matches!(error, SessionError::UnknownAggregate(id) if id == stranger));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(session.state(), SessionState::Open);
}

#[tokio::test]
async fn an_unregistered_command_kind_is_rejected() {
    let repository = RecordingRepository::new();
    let mut bus: MessageBus<Counter> = MessageBus::new();
    bus.register_command("increment", IncrementHandler).unwrap();

    let id: Uuid = Uuid::new_v4();
    let mut session = Session::begin(Arc::clone(&repository), Arc::new(bus));
    session.add(Counter::new(id)).await.unwrap();

    let error = session.execute(CounterCommand::Fail { id }).await.unwrap_err();

    assert!(matches!(error, SessionError::UnregisteredCommand("fail")));
    assert_eq!(session.state(), SessionState::Open);
}

#[tokio::test]
async fn resolver_overrides_win_until_cleared() {
    let repository = RecordingRepository::new();
    let audit = CaptureSubscriber::new();
    let bus: Arc<MessageBus<Counter>> = Arc::new(counter_bus());

    let id: Uuid = Uuid::new_v4();
    let mut session = SessionBuilder::new(Arc::clone(&repository), Arc::clone(&bus))
        .subscribe("metrics", Arc::clone(&audit) as Arc<dyn Subscriber>)
        .begin();

    session.add(Counter::new(id)).await.unwrap();
    session
        .execute(CounterCommand::Increment { id, by: 4 })
        .await
        .unwrap();

    bus.resolver().set_override("scale", || 100_i64);
    session
        .execute(CounterCommand::Report { id, topic: "metrics" })
        .await
        .unwrap();

    assert!(bus.resolver().clear_override("scale"));
    session
        .execute(CounterCommand::Report { id, topic: "metrics" })
        .await
        .unwrap();

    session.commit().await.unwrap();

    let messages = audit.messages_on("metrics");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0], serde_json::json!({ "value": 400 }));
    assert_eq!(messages[1], serde_json::json!({ "value": 4 }));
}

#[tokio::test]
async fn cascaded_events_dispatch_depth_first() {
    let probe = KindProbe::new();

    let mut bus = counter_bus();
    bus.register_event("counter.incremented", EmitOnThreshold { at: 2 });
    bus.register_event("counter.incremented", Arc::clone(&probe));
    bus.register_event("counter.threshold_crossed", Arc::clone(&probe));

    let repository = RecordingRepository::new();
    let id: Uuid = Uuid::new_v4();
    let mut session = Session::begin(Arc::clone(&repository), Arc::new(bus));
    session.add(Counter::new(id)).await.unwrap();

    session
        .execute(CounterCommand::Increment { id, by: 1 })
        .await
        .unwrap();
    assert_eq!(probe.seen(), vec!["counter.incremented".to_string()]);

    session
        .execute(CounterCommand::Increment { id, by: 1 })
        .await
        .unwrap();

    // The threshold event emitted by the first handler is fully dispatched before the probe
    // sees the increment that triggered it.
    let expected: Vec<String> = vec![
        "counter.incremented".to_string(),
        "counter.threshold_crossed".to_string(),
        "counter.incremented".to_string(),
    ];
    assert_eq!(probe.seen(), expected);
}

#[tokio::test]
async fn attaching_announces_then_replays_queued_events_in_order() {
    let probe = KindProbe::new();

    let mut bus: MessageBus<Counter> = MessageBus::new();
    bus.register_event(lifecycle::ADDED, Arc::clone(&probe));
    bus.register_event("counter.incremented", Arc::clone(&probe));
    bus.register_event("counter.threshold_crossed", Arc::clone(&probe));

    let id: Uuid = Uuid::new_v4();
    let mut counter = Counter::new(id);
    counter.record(CounterEvent::Incremented { id, value: 1 });
    counter.record(CounterEvent::ThresholdCrossed { id, value: 1 });

    let repository = RecordingRepository::new();
    let mut session = Session::begin(Arc::clone(&repository), Arc::new(bus));
    session.add(counter).await.unwrap();

    let expected: Vec<String> = vec![
        lifecycle::ADDED.to_string(),
        "counter.incremented".to_string(),
        "counter.threshold_crossed".to_string(),
    ];
    assert_eq!(probe.seen(), expected);
}

#[tokio::test]
async fn a_bus_dispatches_outside_any_session_with_immediate_delivery() {
    let audit = CaptureSubscriber::new();
    let bus = counter_bus();

    let mut publisher = Publisher::new();
    publisher.subscribe("metrics", Arc::clone(&audit) as Arc<dyn Subscriber>);

    let id: Uuid = Uuid::new_v4();
    let mut counter = Counter::new(id);

    bus.dispatch_command(
        &mut counter,
        CounterCommand::Increment { id, by: 6 },
        &mut publisher,
    )
    .await
    .unwrap();
    bus.dispatch_command(
        &mut counter,
        CounterCommand::Report { id, topic: "metrics" },
        &mut publisher,
    )
    .await
    .unwrap();

    // No session, no buffering: the report was delivered the moment it was published.
    assert_eq!(audit.messages_on("metrics"), vec![serde_json::json!({ "value": 6 })]);
    assert_eq!(publisher.pending(), 0);
}
