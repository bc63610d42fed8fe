#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use uow::{
    Aggregate, Command, CommandHandler, Context, Dependency, DomainEvent, EventHandler,
    HandlerError, MessageBus, Outbox, Output, Repository, SessionEvent, StorageError, Subscriber,
    SubscriberError,
};

#[derive(Debug)]
pub struct Counter {
    id: Uuid,
    pub value: i64,
    outbox: Outbox<CounterEvent>,
}

impl Counter {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            value: 0,
            outbox: Outbox::new(),
        }
    }

    pub fn increment(&mut self, by: i64) {
        self.value += by;
        self.outbox.record(CounterEvent::Incremented {
            id: self.id,
            value: self.value,
        });
    }

    pub fn record(&mut self, event: CounterEvent) {
        self.outbox.record(event);
    }
}

impl Aggregate for Counter {
    const NAME: &'static str = "counter";
    type Command = CounterCommand;
    type Event = CounterEvent;

    fn id(&self) -> Uuid {
        self.id
    }

    fn drain_events(&mut self) -> Vec<CounterEvent> {
        self.outbox.drain()
    }
}

pub enum CounterCommand {
    Increment { id: Uuid, by: i64 },
    Report { id: Uuid, topic: &'static str },
    Fail { id: Uuid },
}

impl Command for CounterCommand {
    fn kind(&self) -> &'static str {
        match self {
            CounterCommand::Increment { .. } => "increment",
            CounterCommand::Report { .. } => "report",
            CounterCommand::Fail { .. } => "fail",
        }
    }

    fn target(&self) -> Uuid {
        match self {
            CounterCommand::Increment { id, .. }
            | CounterCommand::Report { id, .. }
            | CounterCommand::Fail { id } => *id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum CounterEvent {
    Incremented { id: Uuid, value: i64 },
    ThresholdCrossed { id: Uuid, value: i64 },
}

impl DomainEvent for CounterEvent {
    fn kind(&self) -> &'static str {
        match self {
            CounterEvent::Incremented { .. } => "counter.incremented",
            CounterEvent::ThresholdCrossed { .. } => "counter.threshold_crossed",
        }
    }

    fn subject(&self) -> Option<Uuid> {
        match self {
            CounterEvent::Incremented { id, .. } | CounterEvent::ThresholdCrossed { id, .. } => {
                Some(*id)
            }
        }
    }
}

/// In-memory repository recording every store and restore it serves.
#[derive(Default)]
pub struct RecordingRepository {
    stored: Mutex<Vec<(Uuid, i64)>>,
    restored: Mutex<Vec<Uuid>>,
    persisted: Mutex<HashMap<Uuid, i64>>,
    fail_store: Mutex<HashSet<Uuid>>,
}

impl RecordingRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_store_on(&self, id: Uuid) {
        self.fail_store.lock().unwrap().insert(id);
    }

    pub fn seed(&self, id: Uuid, value: i64) {
        self.persisted.lock().unwrap().insert(id, value);
    }

    pub fn persisted_value(&self, id: Uuid) -> Option<i64> {
        self.persisted.lock().unwrap().get(&id).copied()
    }

    pub fn stores(&self) -> Vec<(Uuid, i64)> {
        self.stored.lock().unwrap().clone()
    }

    pub fn store_count(&self) -> usize {
        self.stored.lock().unwrap().len()
    }

    pub fn restores(&self) -> Vec<Uuid> {
        self.restored.lock().unwrap().clone()
    }

    pub fn restore_count(&self) -> usize {
        self.restored.lock().unwrap().len()
    }
}

#[async_trait]
impl Repository<Counter> for RecordingRepository {
    async fn store(&self, aggregate: &Counter) -> Result<(), StorageError> {
        if self.fail_store.lock().unwrap().contains(&aggregate.id()) {
            return Err(StorageError::custom("injected store failure"));
        }

        self.stored.lock().unwrap().push((aggregate.id(), aggregate.value));
        self.persisted.lock().unwrap().insert(aggregate.id(), aggregate.value);

        Ok(())
    }

    async fn restore(&self, aggregate: &mut Counter) -> Result<(), StorageError> {
        self.restored.lock().unwrap().push(aggregate.id());
        aggregate.value = self
            .persisted
            .lock()
            .unwrap()
            .get(&aggregate.id())
            .copied()
            .unwrap_or(0);

        Ok(())
    }
}

/// Subscriber capturing every delivery in arrival order.
#[derive(Default)]
pub struct CaptureSubscriber {
    received: Mutex<Vec<(String, Value)>>,
}

impl CaptureSubscriber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn received(&self) -> Vec<(String, Value)> {
        self.received.lock().unwrap().clone()
    }

    pub fn messages_on(&self, topic: &str) -> Vec<Value> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|(received_topic, _)| received_topic == topic)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

#[async_trait]
impl Subscriber for CaptureSubscriber {
    async fn receive(&self, topic: &str, message: &Value) -> Result<(), SubscriberError> {
        self.received.lock().unwrap().push((topic.to_string(), message.clone()));
        Ok(())
    }
}

pub struct FailingSubscriber;

#[async_trait]
impl Subscriber for FailingSubscriber {
    async fn receive(&self, _topic: &str, _message: &Value) -> Result<(), SubscriberError> {
        Err(SubscriberError::new("subscriber is wired to fail"))
    }
}

pub struct IncrementHandler;

#[async_trait]
impl CommandHandler<Counter> for IncrementHandler {
    async fn handle(
        &self,
        aggregate: &mut Counter,
        command: CounterCommand,
        _ctx: &mut Context<'_, CounterEvent>,
    ) -> Result<Output, HandlerError> {
        if let CounterCommand::Increment { by, .. } = command {
            aggregate.increment(by);
        }

        Ok(Output::new(aggregate.value))
    }
}

/// Publishes the counter's value, scaled by the `scale` dependency, on the requested topic.
pub struct ReportHandler;

#[async_trait]
impl CommandHandler<Counter> for ReportHandler {
    async fn handle(
        &self,
        aggregate: &mut Counter,
        command: CounterCommand,
        ctx: &mut Context<'_, CounterEvent>,
    ) -> Result<Output, HandlerError> {
        let scale = ctx.get::<i64>("scale")?;
        if let CounterCommand::Report { topic, .. } = command {
            let message = serde_json::json!({ "value": aggregate.value * *scale });
            ctx.publish(topic, &message).await.map_err(HandlerError::new)?;
        }

        Ok(Output::none())
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::new("scale", || 1_i64)]
    }
}

pub struct FailingHandler;

#[async_trait]
impl CommandHandler<Counter> for FailingHandler {
    async fn handle(
        &self,
        _aggregate: &mut Counter,
        _command: CounterCommand,
        _ctx: &mut Context<'_, CounterEvent>,
    ) -> Result<Output, HandlerError> {
        Err(HandlerError::new("handler is wired to fail"))
    }
}

/// Event handler recording the kind of every event it sees.
#[derive(Default)]
pub struct KindProbe {
    seen: Mutex<Vec<String>>,
}

impl KindProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler<Counter> for KindProbe {
    async fn handle(
        &self,
        event: &SessionEvent<CounterEvent>,
        _ctx: &mut Context<'_, CounterEvent>,
    ) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push(event.kind().to_string());
        Ok(())
    }
}

/// Emits a `ThresholdCrossed` event when an increment reaches the configured value.
pub struct EmitOnThreshold {
    pub at: i64,
}

#[async_trait]
impl EventHandler<Counter> for EmitOnThreshold {
    async fn handle(
        &self,
        event: &SessionEvent<CounterEvent>,
        ctx: &mut Context<'_, CounterEvent>,
    ) -> Result<(), HandlerError> {
        if let Some(CounterEvent::Incremented { id, value }) = event.as_domain() {
            if *value >= self.at {
                ctx.emit(CounterEvent::ThresholdCrossed {
                    id: *id,
                    value: *value,
                });
            }
        }

        Ok(())
    }
}

/// A bus with the three counter command handlers registered.
pub fn counter_bus() -> MessageBus<Counter> {
    let mut bus: MessageBus<Counter> = MessageBus::new();
    bus.register_command("increment", IncrementHandler).unwrap();
    bus.register_command("report", ReportHandler).unwrap();
    bus.register_command("fail", FailingHandler).unwrap();

    bus
}
