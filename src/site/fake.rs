use axum::{
    extract::State,
    response::{IntoResponse, Redirect, Response},
    routing::post,
    Router,
};
use snafu::prelude::*;

use super::{CurrentUser, FakeChargeEventsSnafu, Result};
use crate::{db::Db, AppState, SystemTime, TimeSource};

pub(crate) fn router() -> Router<AppState> {
    Router::new().route("/charge_events", post(charge_events))
}

async fn charge_events(
    CurrentUser(user_id): CurrentUser,
    State(db): State<Db>,
    State(time): State<SystemTime>,
) -> Result<Response> {
    let created = db
        .fake_charge_events(user_id, time.now())
        .await
        .context(FakeChargeEventsSnafu)?;

    tracing::info!(created, "Created fake charge events");

    Ok(Redirect::to(super::TRACKER_PATH).into_response())
}
