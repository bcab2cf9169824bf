#![deny(rust_2018_idioms)]
#![warn(unused_crate_dependencies)]
#![warn(clippy::items_after_statements)]

use base64::prelude::*;
use chrono::{DateTime, Utc};
use snafu::prelude::*;
use std::{env, fs, sync::Arc};
use tokio::{select, task};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::db::{Db, DbError};

const LOG_ENV_NAME: &str = "CHARGE_TRACKER_LOG";

mod calculator;
mod db;
mod format;
mod site;
mod stats;

#[derive(Debug, Clone, axum::extract::FromRef)]
pub(crate) struct AppState {
    config: Arc<Config>,
    db: Db,
    token: CancellationToken,
    time: SystemTime,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::from_env(LOG_ENV_NAME);
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn database_url_from_env() -> Option<String> {
    if let Ok(url) = env::var("DATABASE_URL") {
        return Some(url);
    }

    (|| {
        let host = env::var("DATABASE_HOST").ok()?;
        let user = env::var("DATABASE_USER").ok()?;
        let password_file = env::var("DATABASE_PASSWORD_FILE").ok()?;
        let password = fs::read_to_string(password_file).ok()?;
        let password = password.trim();
        let dbname = env::var("DATABASE_DBNAME").ok()?;

        let url = format!("host='{host}' user='{user}' password='{password}' dbname='{dbname}'");
        Some(url)
    })()
}

fn session_secret_from_env_raw() -> Option<String> {
    if let Ok(secret) = env::var("CHARGE_TRACKER_SESSION_SECRET") {
        return Some(secret);
    }

    if let Ok(secret_path) = env::var("CHARGE_TRACKER_SESSION_SECRET_FILE") {
        return fs::read_to_string(secret_path).ok();
    }

    None
}

fn session_secret_from_env() -> Vec<u8> {
    let session_secret =
        session_secret_from_env_raw().expect("CHARGE_TRACKER_SESSION_SECRET must be set");

    let session_secret = BASE64_STANDARD
        .decode(session_secret.trim())
        .expect("CHARGE_TRACKER_SESSION_SECRET is not base64");

    assert!(session_secret.len() >= 64);

    session_secret
}

fn user_password_from_env() -> Option<String> {
    if let Ok(password) = env::var("CHARGE_TRACKER_PASSWORD") {
        return Some(password);
    }

    if let Ok(password_path) = env::var("CHARGE_TRACKER_PASSWORD_FILE") {
        let password = fs::read_to_string(password_path).ok()?;
        return Some(password.trim().to_owned());
    }

    None
}

#[derive(Debug)]
struct Config {
    database_url: String,
    session_secret: Vec<u8>,
    user_email: String,
    user_password: String,
}

impl Config {
    fn from_env() -> Self {
        let database_url = database_url_from_env().expect("DATABASE_URL must be set");
        let session_secret = session_secret_from_env();
        let user_email = env::var("CHARGE_TRACKER_USER").expect("CHARGE_TRACKER_USER must be set");
        let user_password = user_password_from_env().expect("CHARGE_TRACKER_PASSWORD must be set");

        Self {
            database_url,
            session_secret,
            user_email,
            user_password,
        }
    }
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Arc::new(Config::from_env());

    let token = CancellationToken::new();

    let signal_task = tokio::spawn(signal_task(token.clone()));

    let (db, task) =
        db::Db::new(&config.database_url, token.clone()).context(DatabaseConnectSnafu)?;
    let db_task = task::spawn_blocking(|| task.run());

    let server = webserver(config, db, token.clone());

    select! {
        () = token.cancelled() => {},
        res = signal_task => panic!("the signal task should not exit {res:?}"),
        res = server => res.expect("could not run the webserver"),
        res = db_task => panic!("the database task should not exit {res:?}"),
    }

    Ok(())
}

#[derive(Debug, Snafu)]
enum Error {
    DatabaseConnect { source: DbError },
}

async fn signal_task(token: CancellationToken) -> ! {
    use tokio::signal::unix::*;

    let mut int_signals = signal(SignalKind::interrupt()).unwrap();
    let mut term_signals = signal(SignalKind::terminate()).unwrap();

    select! {
        _ = int_signals.recv() => {},
        _ = term_signals.recv() => {},
    };

    info!("Signal received, shutting down...");
    token.cancel();

    select! {
        _ = int_signals.recv() => {},
        _ = term_signals.recv() => {},
    };

    info!("Second signal received, aborting...");
    std::process::abort();
}

async fn webserver(config: Arc<Config>, db: Db, token: CancellationToken) -> std::io::Result<()> {
    let address = "0.0.0.0:80";

    let state = AppState {
        config: config.clone(),
        db,
        token,
        time: SystemTime,
    };

    let app = site::router(&config).with_state(state);

    let listener = tokio::net::TcpListener::bind(address).await?;
    info!("System listening on {address}");

    axum::serve(listener, app.into_make_service()).await
}

trait TimeSource {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone)]
struct SystemTime;

impl TimeSource for SystemTime {
    fn now(&self) -> DateTime<Utc> {
        chrono::Utc::now()
    }
}
