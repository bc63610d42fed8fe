//! The quickstart walked through in the README: a bank account aggregate, a deposit command,
//! an audit trail published on commit, and a rollback that leaves no trace.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use uow::{
    Aggregate, Command, CommandHandler, Context, DomainEvent, EventHandler, HandlerError,
    MessageBus, Outbox, Output, Repository, SessionBuilder, SessionEvent, StorageError,
    Subscriber, SubscriberError,
};

struct Account {
    id: Uuid,
    balance: i64,
    outbox: Outbox<AccountEvent>,
}

impl Account {
    fn open(id: Uuid) -> Self {
        Self {
            id,
            balance: 0,
            outbox: Outbox::new(),
        }
    }

    fn deposit(&mut self, amount: i64) {
        self.balance += amount;
        self.outbox.record(AccountEvent::Deposited {
            id: self.id,
            amount,
            balance: self.balance,
        });
    }
}

impl Aggregate for Account {
    const NAME: &'static str = "account";
    type Command = AccountCommand;
    type Event = AccountEvent;

    fn id(&self) -> Uuid {
        self.id
    }

    fn drain_events(&mut self) -> Vec<AccountEvent> {
        self.outbox.drain()
    }
}

enum AccountCommand {
    Deposit { id: Uuid, amount: i64 },
}

impl Command for AccountCommand {
    fn kind(&self) -> &'static str {
        "deposit"
    }

    fn target(&self) -> Uuid {
        match self {
            AccountCommand::Deposit { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
enum AccountEvent {
    Deposited { id: Uuid, amount: i64, balance: i64 },
}

impl DomainEvent for AccountEvent {
    fn kind(&self) -> &'static str {
        "account.deposited"
    }

    fn subject(&self) -> Option<Uuid> {
        match self {
            AccountEvent::Deposited { id, .. } => Some(*id),
        }
    }
}

#[derive(Default)]
struct InMemoryAccounts {
    balances: Mutex<HashMap<Uuid, i64>>,
}

#[async_trait]
impl Repository<Account> for InMemoryAccounts {
    async fn store(&self, aggregate: &Account) -> Result<(), StorageError> {
        self.balances.lock().unwrap().insert(aggregate.id(), aggregate.balance);
        Ok(())
    }

    async fn restore(&self, aggregate: &mut Account) -> Result<(), StorageError> {
        aggregate.balance = self
            .balances
            .lock()
            .unwrap()
            .get(&aggregate.id())
            .copied()
            .unwrap_or(0);

        Ok(())
    }
}

struct DepositHandler;

#[async_trait]
impl CommandHandler<Account> for DepositHandler {
    async fn handle(
        &self,
        aggregate: &mut Account,
        command: AccountCommand,
        _ctx: &mut Context<'_, AccountEvent>,
    ) -> Result<Output, HandlerError> {
        let AccountCommand::Deposit { amount, .. } = command;
        aggregate.deposit(amount);

        Ok(Output::new(aggregate.balance))
    }
}

/// Turns every deposit fact into an audit entry, published for the commit-time flush.
struct AuditTrail;

#[async_trait]
impl EventHandler<Account> for AuditTrail {
    async fn handle(
        &self,
        event: &SessionEvent<AccountEvent>,
        ctx: &mut Context<'_, AccountEvent>,
    ) -> Result<(), HandlerError> {
        if let Some(AccountEvent::Deposited { id, amount, balance }) = event.as_domain() {
            let entry = serde_json::json!({
                "account": id,
                "amount": amount,
                "balance": balance,
            });

            ctx.publish("bank.audit", &entry).await.map_err(HandlerError::new)?;
        }

        Ok(())
    }
}

struct ConsoleLedger;

#[async_trait]
impl Subscriber for ConsoleLedger {
    async fn receive(&self, topic: &str, message: &Value) -> Result<(), SubscriberError> {
        println!("[{topic}] {message}");
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter("uow=debug,info").init();

    let mut bus: MessageBus<Account> = MessageBus::new();
    bus.register_command("deposit", DepositHandler).expect("fresh bus");
    bus.register_event("account.deposited", AuditTrail);
    let bus = Arc::new(bus);

    let repository = Arc::new(InMemoryAccounts::default());
    let account_id: Uuid = Uuid::new_v4();

    // First session: two deposits settled together. The audit entries reach the ledger only
    // at commit, after the balance was persisted.
    let mut session = SessionBuilder::new(Arc::clone(&repository), Arc::clone(&bus))
        .subscribe("bank.audit", Arc::new(ConsoleLedger))
        .begin();

    let account = session.add(Account::open(account_id)).await.expect("attach");
    session
        .execute(AccountCommand::Deposit { id: account_id, amount: 75 })
        .await
        .expect("deposit");
    let output = session
        .execute(AccountCommand::Deposit { id: account_id, amount: 25 })
        .await
        .expect("deposit");
    println!("balance reported by the handler: {:?}", output.downcast::<i64>());

    session.commit().await.expect("commit");
    println!("balance after commit: {}", account.lock().await.balance);

    // Second session: same account, but this deposit is abandoned. The repository still holds
    // the committed balance and no audit entry is printed.
    let mut session = SessionBuilder::new(Arc::clone(&repository), bus)
        .subscribe("bank.audit", Arc::new(ConsoleLedger))
        .begin();

    session.add_shared(Arc::clone(&account)).await.expect("attach");
    session
        .execute(AccountCommand::Deposit { id: account_id, amount: 1_000 })
        .await
        .expect("deposit");
    session.rollback().await.expect("rollback");
    println!("balance after rollback: {}", account.lock().await.balance);
}
