//! Checkpointed training: one session per epoch over a model aggregate.
//!
//! Each epoch trains and evaluates inside its own session and commits, so the filesystem
//! checkpoint advances one epoch at a time and metric publications flush only once the epoch's
//! state is safely on disk. The final session trains once more and rolls back, restoring the
//! model from the last checkpoint instead.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use uow::{
    lifecycle, Aggregate, Command, CommandHandler, Context, Dependency, DomainEvent,
    EventHandler, HandlerError, MessageBus, Outbox, Output, Repository, SessionBuilder,
    SessionEvent, StorageError, Subscriber, SubscriberError,
};

const TRUE_WEIGHT: f64 = 3.0;
const TRUE_BIAS: f64 = 0.5;
const BATCH_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
enum Phase {
    Train,
    Evaluation,
}

/// A linear model fit to `TRUE_WEIGHT * x + TRUE_BIAS` by stochastic gradient descent.
struct Model {
    id: Uuid,
    epoch: u32,
    phase: Phase,
    weight: f64,
    bias: f64,
    outbox: Outbox<TrainingEvent>,
}

impl Model {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            epoch: 0,
            phase: Phase::Evaluation,
            weight: 0.0,
            bias: 0.0,
            outbox: Outbox::new(),
        }
    }
}

impl Aggregate for Model {
    const NAME: &'static str = "model";
    type Command = TrainerCommand;
    type Event = TrainingEvent;

    fn id(&self) -> Uuid {
        self.id
    }

    fn drain_events(&mut self) -> Vec<TrainingEvent> {
        self.outbox.drain()
    }
}

enum TrainerCommand {
    Train { id: Uuid },
    Evaluate { id: Uuid },
}

impl Command for TrainerCommand {
    fn kind(&self) -> &'static str {
        match self {
            TrainerCommand::Train { .. } => "train",
            TrainerCommand::Evaluate { .. } => "evaluate",
        }
    }

    fn target(&self) -> Uuid {
        match self {
            TrainerCommand::Train { id } | TrainerCommand::Evaluate { id } => *id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
enum TrainingEvent {
    EpochCompleted { id: Uuid, epoch: u32, loss: f64 },
    Evaluated { id: Uuid, epoch: u32, loss: f64 },
}

impl DomainEvent for TrainingEvent {
    fn kind(&self) -> &'static str {
        match self {
            TrainingEvent::EpochCompleted { .. } => "model.epoch_completed",
            TrainingEvent::Evaluated { .. } => "model.evaluated",
        }
    }

    fn subject(&self) -> Option<Uuid> {
        match self {
            TrainingEvent::EpochCompleted { id, .. } | TrainingEvent::Evaluated { id, .. } => {
                Some(*id)
            }
        }
    }
}

/// Runs one epoch of SGD over synthetic batches. The epoch counter advances only after the
/// completed epoch was recorded, so the event carries the epoch it closes.
struct TrainHandler;

#[async_trait]
impl CommandHandler<Model> for TrainHandler {
    async fn handle(
        &self,
        model: &mut Model,
        _command: TrainerCommand,
        ctx: &mut Context<'_, TrainingEvent>,
    ) -> Result<Output, HandlerError> {
        let learning_rate: f64 = *ctx.get::<f64>("learning_rate")?;
        let batches: usize = *ctx.get::<usize>("batches")?;

        model.phase = Phase::Train;

        let loss: f64 = {
            let mut rng = rand::thread_rng();
            let mut loss_sum: f64 = 0.0;
            let mut samples: usize = 0;

            for _ in 0..batches {
                for _ in 0..BATCH_SIZE {
                    let x: f64 = rng.gen_range(-2.0..2.0);
                    let noise: f64 = rng.gen_range(-0.05..0.05);
                    let target: f64 = TRUE_WEIGHT * x + TRUE_BIAS + noise;

                    let prediction: f64 = model.weight * x + model.bias;
                    let error: f64 = prediction - target;

                    model.weight -= learning_rate * error * x;
                    model.bias -= learning_rate * error;

                    loss_sum += error * error;
                    samples += 1;
                }
            }

            loss_sum / samples as f64
        };

        let epoch: u32 = model.epoch;
        model.outbox.record(TrainingEvent::EpochCompleted {
            id: model.id,
            epoch,
            loss,
        });

        let metrics = serde_json::json!({ "epoch": epoch, "loss": loss });
        ctx.publish("metrics.training", &metrics).await.map_err(HandlerError::new)?;

        model.epoch += 1;

        Ok(Output::new(loss))
    }

    fn dependencies(&self) -> Vec<Dependency> {
        vec![
            Dependency::new("learning_rate", || 0.05_f64),
            Dependency::new("batches", || 8_usize),
        ]
    }
}

/// Measures the model against a noise-free grid. Evaluation observes; the epoch counter
/// belongs to training.
struct EvaluateHandler;

#[async_trait]
impl CommandHandler<Model> for EvaluateHandler {
    async fn handle(
        &self,
        model: &mut Model,
        _command: TrainerCommand,
        ctx: &mut Context<'_, TrainingEvent>,
    ) -> Result<Output, HandlerError> {
        model.phase = Phase::Evaluation;

        let mut loss_sum: f64 = 0.0;
        let mut samples: usize = 0;
        let mut x: f64 = -2.0;
        while x <= 2.0 {
            let target: f64 = TRUE_WEIGHT * x + TRUE_BIAS;
            let prediction: f64 = model.weight * x + model.bias;
            let error: f64 = prediction - target;

            loss_sum += error * error;
            samples += 1;
            x += 0.25;
        }

        let loss: f64 = loss_sum / samples as f64;
        model.outbox.record(TrainingEvent::Evaluated {
            id: model.id,
            epoch: model.epoch,
            loss,
        });

        let metrics = serde_json::json!({ "epoch": model.epoch, "loss": loss });
        ctx.publish("metrics.evaluation", &metrics).await.map_err(HandlerError::new)?;

        Ok(Output::new(loss))
    }
}

#[derive(Serialize, Deserialize)]
struct ModelSnapshot {
    epoch: u32,
    phase: Phase,
    weight: f64,
    bias: f64,
}

/// One JSON checkpoint file per model, under a root directory.
struct FsModels {
    root: PathBuf,
}

impl FsModels {
    fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }
}

#[async_trait]
impl Repository<Model> for FsModels {
    async fn store(&self, aggregate: &Model) -> Result<(), StorageError> {
        let snapshot = ModelSnapshot {
            epoch: aggregate.epoch,
            phase: aggregate.phase,
            weight: aggregate.weight,
            bias: aggregate.bias,
        };
        let raw: Vec<u8> = serde_json::to_vec_pretty(&snapshot)?;

        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.path_for(aggregate.id()), raw).await?;

        Ok(())
    }

    async fn restore(&self, aggregate: &mut Model) -> Result<(), StorageError> {
        let raw: Vec<u8> = tokio::fs::read(self.path_for(aggregate.id())).await?;
        let snapshot: ModelSnapshot = serde_json::from_slice(&raw)?;

        aggregate.epoch = snapshot.epoch;
        aggregate.phase = snapshot.phase;
        aggregate.weight = snapshot.weight;
        aggregate.bias = snapshot.bias;

        Ok(())
    }
}

struct MetricsConsole;

#[async_trait]
impl Subscriber for MetricsConsole {
    async fn receive(&self, topic: &str, message: &Value) -> Result<(), SubscriberError> {
        println!("[{topic}] {message}");
        Ok(())
    }
}

struct CheckpointLog;

#[async_trait]
impl EventHandler<Model> for CheckpointLog {
    async fn handle(
        &self,
        event: &SessionEvent<TrainingEvent>,
        _ctx: &mut Context<'_, TrainingEvent>,
    ) -> Result<(), HandlerError> {
        if let Some(id) = event.subject() {
            tracing::info!({ model = %id }, "checkpoint saved");
        }

        Ok(())
    }
}

fn epoch_session(
    repository: &Arc<FsModels>,
    bus: &Arc<MessageBus<Model>>,
) -> uow::Session<Model, Arc<FsModels>> {
    SessionBuilder::new(Arc::clone(repository), Arc::clone(bus))
        .subscribe("metrics.training", Arc::new(MetricsConsole))
        .subscribe("metrics.evaluation", Arc::new(MetricsConsole))
        .begin()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter("uow=debug,info").init();

    let mut bus: MessageBus<Model> = MessageBus::new();
    bus.register_command("train", TrainHandler).expect("fresh bus");
    bus.register_command("evaluate", EvaluateHandler).expect("fresh bus");
    bus.register_event(lifecycle::COMMITTED, CheckpointLog);
    let bus = Arc::new(bus);

    // Faster schedule than the handler's default.
    bus.resolver().set_override("learning_rate", || 0.1_f64);

    let repository = Arc::new(FsModels::new(std::env::temp_dir().join("uow-training")));
    let model_id: Uuid = Uuid::new_v4();

    // Epoch zero's checkpoint: the untrained model.
    let mut session = epoch_session(&repository, &bus);
    let model = session.add(Model::new(model_id)).await.expect("attach");
    session.commit().await.expect("initial checkpoint");

    // One session per epoch: each commit is a checkpoint the next epoch builds on.
    for _ in 0..3 {
        let mut session = epoch_session(&repository, &bus);
        session.add_shared(Arc::clone(&model)).await.expect("attach");
        session.execute(TrainerCommand::Train { id: model_id }).await.expect("train");
        session
            .execute(TrainerCommand::Evaluate { id: model_id })
            .await
            .expect("evaluate");
        session.commit().await.expect("checkpoint");
    }

    {
        let snapshot = model.lock().await;
        println!(
            "after {} epochs: phase={:?} weight={:.3} bias={:.3} (target {TRUE_WEIGHT} and {TRUE_BIAS})",
            snapshot.epoch, snapshot.phase, snapshot.weight, snapshot.bias
        );
    }

    // A diverging epoch: trained, then abandoned. The rollback restores the model from the
    // last checkpoint and the buffered metrics never reach the console.
    let mut session = epoch_session(&repository, &bus);
    session.add_shared(Arc::clone(&model)).await.expect("attach");
    session.execute(TrainerCommand::Train { id: model_id }).await.expect("train");
    session.rollback().await.expect("rollback");

    let snapshot = model.lock().await;
    println!(
        "after rollback: phase={:?} epoch={} weight={:.3} bias={:.3}",
        snapshot.phase, snapshot.epoch, snapshot.weight, snapshot.bias
    );
}
