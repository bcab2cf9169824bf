use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use diesel_derive_newtype::DieselNewType;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::fmt;
use tokio::{
    select,
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, instrument, Span};

mod queries;
mod schema;

pub(crate) use queries::{QueryError, DEFAULT_PROVIDERS};
use queries::QueryResult;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, DieselNewType,
)]
pub struct UserId(pub i64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, DieselNewType)]
pub struct ProviderId(pub i64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, DieselNewType)]
pub struct ChargeEventId(pub i64);

impl fmt::Display for ChargeEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Copy, Clone, PartialOrd, PartialEq, DieselNewType)]
pub struct KiloWattHours(pub f64);

impl fmt::Display for KiloWattHours {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

/// Total cost of one charging session, not a per-kWh rate. An earlier schema
/// revision stored a unit rate under a confusingly similar name; the unit
/// price shown in the UI is always derived from this and the energy.
#[derive(Debug, Copy, Clone, PartialOrd, PartialEq, DieselNewType)]
pub struct Euros(pub f64);

impl fmt::Display for Euros {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

#[derive(Debug, PartialEq, Selectable, Queryable)]
#[diesel(table_name = schema::users)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Selectable, Queryable)]
#[diesel(table_name = schema::providers)]
pub struct Provider {
    pub id: ProviderId,
    pub name: String,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderCount {
    pub id: ProviderId,
    pub name: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Selectable, Queryable)]
#[diesel(table_name = schema::charge_events)]
pub struct ChargeEvent {
    pub id: ChargeEventId,
    pub date: NaiveDate,
    pub kilo_watt_hours: KiloWattHours,
    pub price_per_charge: Euros,
    pub provider_id: ProviderId,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A charge event joined with the provider it happened at.
#[derive(Debug, PartialEq)]
pub struct ChargeEventRelation {
    pub event: ChargeEvent,
    pub provider: Provider,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = schema::charge_events)]
pub struct NewChargeEvent {
    pub date: NaiveDate,
    pub kilo_watt_hours: KiloWattHours,
    pub price_per_charge: Euros,
    pub provider_id: ProviderId,
    pub user_id: UserId,
}

#[derive(Debug)]
pub struct ChargeEventUpdate {
    pub id: ChargeEventId,
    pub user_id: UserId,
    pub date: NaiveDate,
    pub kilo_watt_hours: KiloWattHours,
    pub price_per_charge: Euros,
    pub provider_id: ProviderId,
}

#[derive(Debug)]
pub struct ChargeEventDelete {
    pub id: ChargeEventId,
    pub user_id: UserId,
}

#[derive(Debug)]
enum DbCommand {
    EnsureUser {
        email: String,
        tx: oneshot::Sender<QueryResult<User>>,
    },

    ListChargeEvents {
        user_id: UserId,
        tx: oneshot::Sender<QueryResult<Vec<ChargeEventRelation>>>,
    },

    LastDeletedChargeEvent {
        user_id: UserId,
        tx: oneshot::Sender<QueryResult<Option<ChargeEvent>>>,
    },

    CreateChargeEvent {
        event: NewChargeEvent,
        tx: oneshot::Sender<QueryResult<ChargeEvent>>,
    },

    UpdateChargeEvent {
        event: ChargeEventUpdate,
        now: DateTime<Utc>,
        tx: oneshot::Sender<QueryResult<usize>>,
    },

    DeleteChargeEvent {
        event: ChargeEventDelete,
        now: DateTime<Utc>,
        tx: oneshot::Sender<QueryResult<usize>>,
    },

    RestoreLastDeleted {
        user_id: UserId,
        now: DateTime<Utc>,
        tx: oneshot::Sender<QueryResult<Option<ChargeEvent>>>,
    },

    ProviderCounts {
        user_id: UserId,
        tx: oneshot::Sender<QueryResult<Vec<ProviderCount>>>,
    },

    AddProvider {
        name: String,
        user_id: UserId,
        tx: oneshot::Sender<QueryResult<Provider>>,
    },

    RemoveProvider {
        name: String,
        user_id: UserId,
        tx: oneshot::Sender<QueryResult<()>>,
    },

    SeedDefaultProviders {
        user_id: UserId,
        tx: oneshot::Sender<QueryResult<usize>>,
    },

    #[cfg(feature = "fake-data")]
    FakeChargeEvents {
        user_id: UserId,
        now: DateTime<Utc>,
        tx: oneshot::Sender<QueryResult<usize>>,
    },
}

pub(crate) fn init(database_url: &str) -> DbResult<PgConnection> {
    let mut db = PgConnection::establish(database_url).context(ConnectSnafu)?;
    apply_migrations(&mut db)?;
    Ok(db)
}

fn apply_migrations(db: &mut PgConnection) -> DbResult<()> {
    let migrations = db
        .pending_migrations(MIGRATIONS)
        .context(MigrationListSnafu)?;

    for migration in migrations {
        info!("Starting migration {}", migration.name());
        db.run_migration(&migration).context(MigrationRunSnafu)?;
    }

    Ok(())
}

type ChannelData = (Span, DbCommand);

#[derive(Debug, Clone)]
pub struct Db(mpsc::Sender<ChannelData>);

impl Db {
    pub(crate) fn new(database_url: &str, token: CancellationToken) -> DbResult<(Self, Task)> {
        let db = init(database_url)?;

        let (tx, rx) = mpsc::channel(4);

        let this = Self(tx);
        let task = Task { rx, db, token };

        Ok((this, task))
    }

    pub(crate) async fn ensure_user(&self, email: impl Into<String>) -> DbResult<User> {
        let email = email.into();
        self.send(|tx| DbCommand::EnsureUser { email, tx })
            .await?
            .context(EnsureUserSnafu)
    }

    pub(crate) async fn list_charge_events(
        &self,
        user_id: UserId,
    ) -> DbResult<Vec<ChargeEventRelation>> {
        self.send(|tx| DbCommand::ListChargeEvents { user_id, tx })
            .await?
            .context(ListChargeEventsSnafu)
    }

    pub(crate) async fn last_deleted_charge_event(
        &self,
        user_id: UserId,
    ) -> DbResult<Option<ChargeEvent>> {
        self.send(|tx| DbCommand::LastDeletedChargeEvent { user_id, tx })
            .await?
            .context(LastDeletedChargeEventSnafu)
    }

    pub(crate) async fn create_charge_event(&self, event: NewChargeEvent) -> DbResult<ChargeEvent> {
        self.send(|tx| DbCommand::CreateChargeEvent { event, tx })
            .await?
            .context(CreateChargeEventSnafu)
    }

    /// Resolves to the number of affected rows; zero means the event does
    /// not exist or belongs to someone else.
    pub(crate) async fn update_charge_event(
        &self,
        event: ChargeEventUpdate,
        now: DateTime<Utc>,
    ) -> DbResult<usize> {
        self.send(|tx| DbCommand::UpdateChargeEvent { event, now, tx })
            .await?
            .context(UpdateChargeEventSnafu)
    }

    pub(crate) async fn delete_charge_event(
        &self,
        event: ChargeEventDelete,
        now: DateTime<Utc>,
    ) -> DbResult<usize> {
        self.send(|tx| DbCommand::DeleteChargeEvent { event, now, tx })
            .await?
            .context(DeleteChargeEventSnafu)
    }

    pub(crate) async fn restore_last_deleted(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> DbResult<Option<ChargeEvent>> {
        self.send(|tx| DbCommand::RestoreLastDeleted { user_id, now, tx })
            .await?
            .context(RestoreLastDeletedSnafu)
    }

    pub(crate) async fn provider_counts(&self, user_id: UserId) -> DbResult<Vec<ProviderCount>> {
        self.send(|tx| DbCommand::ProviderCounts { user_id, tx })
            .await?
            .context(ProviderCountsSnafu)
    }

    pub(crate) async fn add_provider(
        &self,
        name: impl Into<String>,
        user_id: UserId,
    ) -> DbResult<Provider> {
        let name = name.into();
        self.send(|tx| DbCommand::AddProvider { name, user_id, tx })
            .await?
            .context(AddProviderSnafu)
    }

    pub(crate) async fn remove_provider(
        &self,
        name: impl Into<String>,
        user_id: UserId,
    ) -> DbResult<()> {
        let name = name.into();
        self.send(|tx| DbCommand::RemoveProvider { name, user_id, tx })
            .await?
            .context(RemoveProviderSnafu)
    }

    pub(crate) async fn seed_default_providers(&self, user_id: UserId) -> DbResult<usize> {
        self.send(|tx| DbCommand::SeedDefaultProviders { user_id, tx })
            .await?
            .context(SeedDefaultProvidersSnafu)
    }

    #[cfg(feature = "fake-data")]
    pub(crate) async fn fake_charge_events(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> DbResult<usize> {
        self.send(|tx| DbCommand::FakeChargeEvents { user_id, now, tx })
            .await?
            .context(FakeChargeEventsSnafu)
    }

    async fn send<T>(&self, f: impl FnOnce(oneshot::Sender<T>) -> DbCommand) -> DbResult<T> {
        let (tx, rx) = oneshot::channel();
        let command = f(tx);
        let span = info_span!("database");
        self.0
            .send((span, command))
            .await
            .send_context(SendToTaskSnafu)?;
        rx.await.context(ReceiveFromTaskSnafu)
    }
}

trait SendContext<T, E> {
    fn send_context<C>(self, ctx: C) -> Result<(), E>
    where
        C: snafu::IntoError<E, Source = mpsc::error::SendError<()>>,
        E: snafu::Error + snafu::ErrorCompat;
}

impl<T, E> SendContext<T, E> for Result<(), mpsc::error::SendError<T>> {
    fn send_context<C>(self, ctx: C) -> Result<(), E>
    where
        C: snafu::IntoError<E, Source = mpsc::error::SendError<()>>,
        E: snafu::Error + snafu::ErrorCompat,
    {
        self.map_err(|_| mpsc::error::SendError(())).context(ctx)
    }
}

#[derive(Debug, Snafu)]
pub(crate) enum DbError {
    #[snafu(display("Could not connect to database"))]
    Connect {
        source: diesel::result::ConnectionError,
    },

    #[snafu(display("Could not determine migration status"))]
    MigrationList {
        source: Box<dyn snafu::Error + Send + Sync>,
    },

    #[snafu(display("Could not run migrations"))]
    MigrationRun {
        source: Box<dyn snafu::Error + Send + Sync>,
    },

    EnsureUser {
        source: QueryError,
    },

    ListChargeEvents {
        source: QueryError,
    },

    LastDeletedChargeEvent {
        source: QueryError,
    },

    CreateChargeEvent {
        source: QueryError,
    },

    UpdateChargeEvent {
        source: QueryError,
    },

    DeleteChargeEvent {
        source: QueryError,
    },

    RestoreLastDeleted {
        source: QueryError,
    },

    ProviderCounts {
        source: QueryError,
    },

    AddProvider {
        source: QueryError,
    },

    RemoveProvider {
        source: QueryError,
    },

    SeedDefaultProviders {
        source: QueryError,
    },

    #[cfg(feature = "fake-data")]
    FakeChargeEvents {
        source: QueryError,
    },

    SendToTask {
        source: mpsc::error::SendError<()>,
    },
    ReceiveFromTask {
        source: oneshot::error::RecvError,
    },
}

pub(crate) type DbResult<T, E = DbError> = std::result::Result<T, E>;

pub struct Task {
    rx: mpsc::Receiver<ChannelData>,
    db: PgConnection,
    token: CancellationToken,
}

impl Task {
    #[instrument(skip_all)]
    pub fn run(mut self) {
        let Self { rx, db, token } = &mut self;

        info!("starting task");

        let mut next_command = move || {
            futures::executor::block_on(async {
                select! {
                    () = token.cancelled() => None,
                    cmd = rx.recv() => cmd,
                }
            })
        };

        while let Some((span, cmd)) = next_command() {
            let _span = span.enter();

            match cmd {
                DbCommand::EnsureUser { email, tx } => {
                    let r = db.transaction(|db| queries::ensure_user(db, &email));
                    tx.send(r).ok(/* Don't care if receiver is gone */);
                }

                DbCommand::ListChargeEvents { user_id, tx } => {
                    let r = db.transaction(|db| queries::list_charge_events(db, user_id));
                    tx.send(r).ok(/* Don't care if receiver is gone */);
                }

                DbCommand::LastDeletedChargeEvent { user_id, tx } => {
                    let r = db.transaction(|db| queries::last_deleted_charge_event(db, user_id));
                    tx.send(r).ok(/* Don't care if receiver is gone */);
                }

                DbCommand::CreateChargeEvent { event, tx } => {
                    let r = db.transaction(|db| queries::create_charge_event(db, &event));
                    tx.send(r).ok(/* Don't care if receiver is gone */);
                }

                DbCommand::UpdateChargeEvent { event, now, tx } => {
                    let r = db.transaction(|db| queries::update_charge_event(db, &event, now));
                    tx.send(r).ok(/* Don't care if receiver is gone */);
                }

                DbCommand::DeleteChargeEvent { event, now, tx } => {
                    let r = db.transaction(|db| queries::delete_charge_event(db, &event, now));
                    tx.send(r).ok(/* Don't care if receiver is gone */);
                }

                DbCommand::RestoreLastDeleted { user_id, now, tx } => {
                    let r = db.transaction(|db| queries::restore_last_deleted(db, user_id, now));
                    tx.send(r).ok(/* Don't care if receiver is gone */);
                }

                DbCommand::ProviderCounts { user_id, tx } => {
                    let r = db.transaction(|db| queries::provider_counts(db, user_id));
                    tx.send(r).ok(/* Don't care if receiver is gone */);
                }

                DbCommand::AddProvider { name, user_id, tx } => {
                    let r = db.transaction(|db| queries::add_provider(db, &name, user_id));
                    tx.send(r).ok(/* Don't care if receiver is gone */);
                }

                DbCommand::RemoveProvider { name, user_id, tx } => {
                    let r = db.transaction(|db| queries::remove_provider(db, &name, user_id));
                    tx.send(r).ok(/* Don't care if receiver is gone */);
                }

                DbCommand::SeedDefaultProviders { user_id, tx } => {
                    let r = db.transaction(|db| queries::seed_default_providers(db, user_id));
                    tx.send(r).ok(/* Don't care if receiver is gone */);
                }

                #[cfg(feature = "fake-data")]
                DbCommand::FakeChargeEvents { user_id, now, tx } => {
                    let r = db.transaction(|db| queries::fake::charge_events(db, user_id, now));
                    tx.send(r).ok(/* Don't care if receiver is gone */);
                }
            }
        }

        info!("stopping task");
    }
}
