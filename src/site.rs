use axum::{
    async_trait,
    extract::{FromRequestParts, Query, State},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Router,
};
use chrono::NaiveDate;
use maud::{html, Markup, DOCTYPE};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use snafu::prelude::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    request_id::MakeRequestUuid,
    trace::{DefaultOnResponse, MakeSpan, TraceLayer},
    ServiceBuilderExt as _,
};
use tower_sessions::{cookie::Key, MemoryStore, Session, SessionManagerLayer};
use tracing::{info, info_span, warn};

use crate::{
    calculator::CalculatorInput,
    db::{
        ChargeEventDelete, ChargeEventId, ChargeEventRelation, ChargeEventUpdate, Db, DbError,
        Euros, KiloWattHours, NewChargeEvent, ProviderCount, ProviderId, QueryError, UserId,
        DEFAULT_PROVIDERS,
    },
    format::{format_day, format_day_short, round2},
    stats::ChargeStats,
    SystemTime, TimeSource,
};

#[cfg(feature = "fake-data")]
mod fake;

const SESSION_ID_COOKIE_NAME: &str = "charge_tracker_sid";
const USER_ID_SESSION_KEY: &str = "user_id";
const X_REQUEST_ID_NAME: &str = "x-request-id";

const TRACKER_PATH: &str = "/";
const CALCULATOR_PATH: &str = "/calculator";
const SETTINGS_PATH: &str = "/settings";
const PROVIDER_ADD_PATH: &str = "/settings/providers";
const PROVIDER_REMOVE_PATH: &str = "/settings/providers/remove";
const LOGIN_PATH: &str = "/login";
const LOGOUT_PATH: &str = "/logout";
const SHUTDOWN_PATH: &str = "/shutdown";

pub(crate) fn router(config: &crate::Config) -> Router<super::AppState> {
    let router = Router::new()
        .route(TRACKER_PATH, get(tracker).post(tracker_action))
        .route(CALCULATOR_PATH, get(calculator_page))
        .route(SETTINGS_PATH, get(settings))
        .route(PROVIDER_ADD_PATH, post(provider_add))
        .route(PROVIDER_REMOVE_PATH, post(provider_remove))
        .route(LOGIN_PATH, get(login_page).post(login))
        .route(LOGOUT_PATH, post(logout))
        .route(SHUTDOWN_PATH, post(shutdown));

    #[cfg(feature = "fake-data")]
    let router = router.nest("/fake", fake::router());

    let store = MemoryStore::default();
    let session_layer = SessionManagerLayer::new(store)
        .with_name(SESSION_ID_COOKIE_NAME)
        .with_signed(Key::from(&config.session_secret));

    let middleware = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(MethodUriAndRequest)
                .on_response(DefaultOnResponse::new()),
        )
        .propagate_x_request_id()
        .layer(session_layer);

    router.layer(middleware)
}

#[derive(Debug, Copy, Clone)]
struct MethodUriAndRequest;

impl<B> MakeSpan<B> for MethodUriAndRequest {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let span = info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = tracing::field::Empty,
        );

        if let Some(id) = request.headers().get(X_REQUEST_ID_NAME) {
            if let Ok(id) = id.to_str() {
                span.record("request_id", id);
            }
        }

        span
    }
}

/// The signed-in user, resolved from the session. Anything behind this
/// extractor bounces to the login page when the session is absent.
#[derive(Debug, Copy, Clone)]
struct CurrentUser(UserId);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        let session = Session::from_request_parts(parts, state)
            .await
            .map_err(IntoResponse::into_response)?;

        let user_id = session
            .get::<UserId>(USER_ID_SESSION_KEY)
            .await
            .ok()
            .flatten();

        match user_id {
            Some(user_id) => Ok(Self(user_id)),
            None => Err(Redirect::to(LOGIN_PATH).into_response()),
        }
    }
}

struct Day(NaiveDate);

impl maud::Render for Day {
    fn render(&self) -> Markup {
        html! { (format_day(self.0)) }
    }
}

fn page(body: Markup) -> Markup {
    html! {
        (DOCTYPE);
        html {
            head {
                meta charset="utf-8";
                meta name="viewport" content="width=device-width, initial-scale=1";
                title { "Charge Tracker" };
                style { (maud::PreEscaped(STYLESHEET)) };
            }
            body {
                (body)
            }
        };
    }
}

const STYLESHEET: &str = "
body { font-family: sans-serif; margin: 0; background: #f8fafc; color: #0f172a; }
nav { padding: 0.5rem; background: #581c87; color: #f1f5f9; }
nav a { color: inherit; text-decoration: none; margin-right: 1rem; }
main { padding: 0.5rem; max-width: 56rem; margin: auto; }
table { border-collapse: collapse; width: 100%; }
th { background: #0369a1; color: #e2e8f0; text-align: left; padding: 0.25rem; }
td { padding: 0.25rem; }
tr:nth-child(odd) td { background: #f1f5f9; }
td.num, th.num { text-align: right; }
form.entry label { display: inline-block; margin-right: 0.5rem; }
.flash { padding: 0.5rem; border: 1px solid; margin-bottom: 0.25rem; }
.flash-success { background: #059669; border-color: #065f46; color: #f1f5f9; }
.flash-warning { background: #fde68a; border-color: #fbbf24; }
.flash-error { background: #ef4444; border-color: #b91c1c; color: #f1f5f9; }
button { background: #0369a1; color: #f1f5f9; border: none; padding: 0.25rem 0.5rem; border-radius: 0.125rem; cursor: pointer; }
button:hover { background: #0284c7; }
";

fn top_nav() -> Markup {
    html! {
        nav {
            a href=(TRACKER_PATH) { "⚡️Charge Tracker⚡️" };
            a href=(CALCULATOR_PATH) { "Calculator" };
            a href=(SETTINGS_PATH) { "Settings" };
            form action=(LOGOUT_PATH) method="post" style="display: inline" {
                button { "Log out" };
            };
        };
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
enum Flash<T> {
    Success(T),
    Warning(T),
    Error(T),
}

impl<T> Flash<T> {
    fn value(&self) -> &T {
        use Flash::*;
        let (Success(v) | Warning(v) | Error(v)) = self;
        v
    }

    fn class(&self) -> &'static str {
        use Flash::*;
        match self {
            Success(_) => "flash flash-success",
            Warning(_) => "flash flash-warning",
            Error(_) => "flash flash-error",
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Flashes(Vec<Flash<String>>);

fn flashes(flashes: &Flashes) -> Markup {
    html! {
        div {
            @for flash in &flashes.0 {
                div.(flash.class()) { (flash.value()) };
            }
        }
    }
}

#[derive(Debug)]
struct FlashHash(Session);

// Methods take `self`; the flash is consumed by the next page load.
impl FlashHash {
    const SESSION_KEY: &'static str = "flash";

    async fn take<T>(self) -> Option<T>
    where
        T: DeserializeOwned,
    {
        self.0.remove(Self::SESSION_KEY).await.ok().flatten()
    }

    async fn set<T>(self, value: T)
    where
        T: Serialize,
    {
        self.0.insert(Self::SESSION_KEY, value).await.ok(/* The flash is best-effort */);
    }
}

async fn flash_redirect(session: Session, flash: Flash<String>, redirect_uri: &str) -> Response {
    FlashHash(session).set(Flashes(vec![flash])).await;
    Redirect::to(redirect_uri).into_response()
}

fn table<'a, I>(
    data: I,
    head: impl FnOnce() -> Markup,
    mut row: impl FnMut(I::Item) -> Markup,
) -> Markup
where
    I: IntoIterator,
{
    html! {
        table {
            thead {
                tr { (head()) };
            };
            tbody {
                @for datum in data {
                    tr { (row(datum)) };
                }
            };
        };
    }
}

#[derive(Debug, Deserialize)]
struct TrackerQuery {
    /// Prefills the entry form, e.g. from a charger display readout.
    #[serde(rename = "kWh")]
    kwh: Option<f64>,
    /// Id of the event whose row was selected for editing.
    edit: Option<i64>,
}

/// What the entry form starts out with: a selected event, a kWh prefill, or
/// today's date and zeroes.
#[derive(Debug)]
struct EntrySeed {
    id: Option<ChargeEventId>,
    date: String,
    kilo_watt_hours: f64,
    price_per_charge: f64,
    provider_id: Option<ProviderId>,
}

impl EntrySeed {
    fn new(today: NaiveDate) -> Self {
        Self {
            id: None,
            date: format_day(today),
            kilo_watt_hours: 0.0,
            price_per_charge: 0.0,
            provider_id: None,
        }
    }

    fn from_event(relation: &ChargeEventRelation) -> Self {
        let event = &relation.event;
        Self {
            id: Some(event.id),
            date: format_day(event.date),
            kilo_watt_hours: event.kilo_watt_hours.0,
            price_per_charge: event.price_per_charge.0,
            provider_id: Some(event.provider_id),
        }
    }
}

async fn tracker(
    CurrentUser(user_id): CurrentUser,
    Query(query): Query<TrackerQuery>,
    session: Session,
    State(db): State<Db>,
    State(time): State<SystemTime>,
) -> Result<Markup> {
    let flash = FlashHash(session).take::<Flashes>().await.unwrap_or_default();

    let charge_events = db.list_charge_events(user_id).await.context(TrackerSnafu)?;
    let providers = db.provider_counts(user_id).await.context(TrackerSnafu)?;
    let last_deleted = db
        .last_deleted_charge_event(user_id)
        .await
        .context(TrackerSnafu)?;

    let stats = ChargeStats::collect(charge_events.iter().map(|r| &r.event));

    let selected = query
        .edit
        .and_then(|id| charge_events.iter().find(|r| r.event.id.0 == id));
    let mut seed = match selected {
        Some(relation) => EntrySeed::from_event(relation),
        None => EntrySeed::new(time.now().date_naive()),
    };
    if selected.is_none() {
        if let Some(kwh) = query.kwh {
            seed.kilo_watt_hours = kwh;
        }
    }

    Ok(page(html! {
        (top_nav());

        main {
            (flashes(&flash));

            (stats_section(&stats));

            section {
                h2 { "Charge entry" };
                (entry_form(&seed, &providers, last_deleted.is_some()));
            };

            section {
                h2 { "Charges" };
                (charge_events_table(&charge_events));
            };

            @if cfg!(feature = "fake-data") {
                section {
                    form action="/fake/charge_events" method="post" {
                        button { "Create fake charge events" };
                    };
                };
            }
        };
    }))
}

fn stats_section(stats: &ChargeStats) -> Markup {
    let span = match (stats.first_date, stats.last_date) {
        (Some(first), Some(last)) => {
            // Events arrive date-descending, so `last` is the oldest.
            format!("{} – {}", format_day_short(last), format_day_short(first))
        }
        _ => String::new(),
    };

    html! {
        section {
            h2 { "Stats" };
            table {
                thead {
                    tr {
                        th { "Total charges" };
                        th { "Total kWh" };
                        th { "Total price" };
                        th { "Price (c/kWh)" };
                    };
                };
                tbody {
                    tr {
                        td { (stats.count) " " small { (span) } };
                        td { (stats.total_kwh) };
                        td { (stats.total_price) " Eur" };
                        td {
                            @match stats.average_unit_price_cents() {
                                Some(cents) => { (cents) },
                                None => { "–" },
                            }
                        };
                    };
                };
            };
        };
    }
}

// The provider options arrive most-used first, so a fresh form defaults to
// the usual provider.
fn entry_form(seed: &EntrySeed, providers: &[ProviderCount], can_restore: bool) -> Markup {
    html! {
        form.entry action=(TRACKER_PATH) method="post" {
            @if let Some(id) = seed.id {
                input type="hidden" name="id" value=(id);
            }

            label {
                "Date ";
                input name="date" size="10" value=(seed.date);
            };
            label {
                "kWh ";
                input name="kiloWattHours" size="6" value=(seed.kilo_watt_hours);
            };
            label {
                "Price ";
                input name="pricePerCharge" size="6" value=(seed.price_per_charge);
            };
            label {
                "Provider ";
                select name="providerId" {
                    @for provider in providers {
                        option
                            value=(provider.id.0)
                            selected[seed.provider_id == Some(provider.id)]
                        {
                            (provider.name)
                        };
                    }
                };
            };

            @if seed.id.is_some() {
                button name="_action" value="update" { "Update" };
                button name="_action" value="delete" { "Delete" };
                a href=(TRACKER_PATH) { "New entry" };
            } @else {
                button name="_action" value="insert" { "Insert" };
            }
        };

        @if can_restore {
            form action=(TRACKER_PATH) method="post" {
                button name="_action" value="restore last" { "Restore last deleted" };
            };
        }
    }
}

fn charge_events_table(charge_events: &[ChargeEventRelation]) -> Markup {
    table(
        charge_events,
        || {
            html! {
                th { "Date" };
                th.num { "kWh" };
                th.num { "e / charge" };
                th.num { "e * kWh" };
                th { "Provider" };
            }
        },
        |relation| {
            let event = &relation.event;
            let edit = format!("{TRACKER_PATH}?edit={}", event.id);

            html! {
                td { a href=(edit) { (Day(event.date)) } };
                td.num { (event.kilo_watt_hours) };
                td.num { (event.price_per_charge) };
                td.num {
                    @if event.kilo_watt_hours.0 == 0.0 {
                        "–"
                    } @else {
                        (round2(event.price_per_charge.0 / event.kilo_watt_hours.0))
                    }
                };
                td { (relation.provider.name) };
            }
        },
    )
}

#[derive(Debug, Clone, Deserialize)]
struct EntryForm {
    #[serde(rename = "_action")]
    action: EntryAction,
    id: Option<String>,
    date: Option<String>,
    #[serde(rename = "kiloWattHours")]
    kilo_watt_hours: Option<String>,
    #[serde(rename = "pricePerCharge")]
    price_per_charge: Option<String>,
    #[serde(rename = "providerId")]
    provider_id: Option<String>,
}

/// The four operations the entry form can request. An unknown `_action`
/// value fails form deserialization instead of falling through at runtime.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
enum EntryAction {
    #[serde(rename = "insert")]
    Insert,
    #[serde(rename = "update")]
    Update,
    #[serde(rename = "delete")]
    Delete,
    #[serde(rename = "restore last")]
    RestoreLast,
}

/// Field-level failures, each checked before any storage call.
#[derive(Debug, Snafu, PartialEq)]
enum EntryFormError {
    #[snafu(display("id cannot be missing"))]
    MissingId,

    #[snafu(display("providerId cannot be missing"))]
    MissingProviderId,

    #[snafu(display("date cannot be missing"))]
    MissingDate,

    #[snafu(display("'{value}' is not a valid date"))]
    InvalidDate { value: String },

    #[snafu(display("'{value}' is not a valid id"))]
    InvalidId { value: String },

    #[snafu(display("'{value}' is not a valid number for {field}"))]
    InvalidNumber { field: &'static str, value: String },
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl EntryForm {
    fn parsed_id(&self) -> Result<ChargeEventId, EntryFormError> {
        let raw = non_empty(&self.id).context(MissingIdSnafu)?;
        let id = raw.parse().ok().context(InvalidIdSnafu { value: raw })?;
        Ok(ChargeEventId(id))
    }

    fn parsed_date(&self) -> Result<NaiveDate, EntryFormError> {
        let raw = non_empty(&self.date).context(MissingDateSnafu)?;
        crate::format::parse_day(raw).context(InvalidDateSnafu { value: raw })
    }

    fn parsed_provider_id(&self) -> Result<ProviderId, EntryFormError> {
        let raw = non_empty(&self.provider_id).context(MissingProviderIdSnafu)?;
        let id = raw.parse().ok().context(InvalidIdSnafu { value: raw })?;
        Ok(ProviderId(id))
    }

    fn parsed_number(
        value: &Option<String>,
        field: &'static str,
    ) -> Result<f64, EntryFormError> {
        let Some(raw) = non_empty(value) else {
            return Ok(0.0);
        };
        raw.parse()
            .ok()
            .context(InvalidNumberSnafu { field, value: raw })
    }

    fn to_insert(&self, user_id: UserId) -> Result<NewChargeEvent, EntryFormError> {
        Ok(NewChargeEvent {
            date: self.parsed_date()?,
            kilo_watt_hours: KiloWattHours(Self::parsed_number(
                &self.kilo_watt_hours,
                "kiloWattHours",
            )?),
            price_per_charge: Euros(Self::parsed_number(
                &self.price_per_charge,
                "pricePerCharge",
            )?),
            provider_id: self.parsed_provider_id()?,
            user_id,
        })
    }

    fn to_update(&self, user_id: UserId) -> Result<ChargeEventUpdate, EntryFormError> {
        Ok(ChargeEventUpdate {
            id: self.parsed_id()?,
            user_id,
            date: self.parsed_date()?,
            kilo_watt_hours: KiloWattHours(Self::parsed_number(
                &self.kilo_watt_hours,
                "kiloWattHours",
            )?),
            price_per_charge: Euros(Self::parsed_number(
                &self.price_per_charge,
                "pricePerCharge",
            )?),
            provider_id: self.parsed_provider_id()?,
        })
    }

    fn to_delete(&self, user_id: UserId) -> Result<ChargeEventDelete, EntryFormError> {
        Ok(ChargeEventDelete {
            id: self.parsed_id()?,
            user_id,
        })
    }
}

async fn tracker_action(
    CurrentUser(user_id): CurrentUser,
    session: Session,
    State(db): State<Db>,
    State(time): State<SystemTime>,
    Form(form): Form<EntryForm>,
) -> Result<Response> {
    use Flash::*;

    info!(action = ?form.action, "entry action");

    let flash = match form.action {
        EntryAction::Insert => match form.to_insert(user_id) {
            Ok(event) => {
                let created = db
                    .create_charge_event(event)
                    .await
                    .context(EntryActionSnafu)?;
                Success(format!("Added charge on {}", format_day(created.date)))
            }
            Err(error) => Error(error.to_string()),
        },

        EntryAction::Update => match form.to_update(user_id) {
            Ok(event) => {
                let rows = db
                    .update_charge_event(event, time.now())
                    .await
                    .context(EntryActionSnafu)?;
                if rows == 0 {
                    Warning("No matching charge event was updated".into())
                } else {
                    Success("Charge updated".into())
                }
            }
            Err(error) => Error(error.to_string()),
        },

        EntryAction::Delete => match form.to_delete(user_id) {
            Ok(event) => {
                let rows = db
                    .delete_charge_event(event, time.now())
                    .await
                    .context(EntryActionSnafu)?;
                if rows == 0 {
                    Warning("No matching charge event was deleted".into())
                } else {
                    Success("Charge deleted".into())
                }
            }
            Err(error) => Error(error.to_string()),
        },

        EntryAction::RestoreLast => {
            let restored = db
                .restore_last_deleted(user_id, time.now())
                .await
                .context(EntryActionSnafu)?;
            match restored {
                Some(event) => Success(format!("Restored charge on {}", format_day(event.date))),
                None => Warning("There is nothing to restore".into()),
            }
        }
    };

    Ok(flash_redirect(session, flash, TRACKER_PATH).await)
}

#[derive(Debug, Deserialize)]
struct CalculatorForm {
    #[serde(rename = "batterySize")]
    battery_size: Option<f64>,
    #[serde(rename = "stateOfCharge")]
    state_of_charge: Option<f64>,
    #[serde(rename = "chargeRate")]
    charge_rate: Option<f64>,
    #[serde(rename = "degradationPercent")]
    degradation_percent: Option<f64>,
    #[serde(rename = "consumptionWhPerKm")]
    consumption_wh_per_km: Option<f64>,
    #[serde(rename = "chargeToSoC")]
    charge_to_soc: Option<f64>,
}

impl CalculatorForm {
    fn into_input(self) -> CalculatorInput {
        let defaults = CalculatorInput::default();

        CalculatorInput {
            battery_size_kwh: self.battery_size.unwrap_or(defaults.battery_size_kwh),
            state_of_charge_percent: self
                .state_of_charge
                .unwrap_or(defaults.state_of_charge_percent),
            charge_rate_kw: self.charge_rate.unwrap_or(defaults.charge_rate_kw),
            degradation_percent: self
                .degradation_percent
                .unwrap_or(defaults.degradation_percent),
            consumption_wh_per_km: self
                .consumption_wh_per_km
                .unwrap_or(defaults.consumption_wh_per_km),
            charge_to_soc_percent: self.charge_to_soc.unwrap_or(defaults.charge_to_soc_percent),
        }
    }
}

async fn calculator_page(
    _user: CurrentUser,
    Query(form): Query<CalculatorForm>,
) -> Markup {
    let input = form.into_input();
    let estimate = input.estimate();

    let slider = |label: &str, name: &str, min: &str, max: &str, step: &str, value: f64| {
        html! {
            label {
                (label);
                " ";
                input type="range" name=(name) min=(min) max=(max) step=(step) value=(value);
                " ";
                (value);
            };
            br;
        }
    };

    page(html! {
        (top_nav());

        main {
            section {
                h2 { "Estimates" };
                table {
                    thead {
                        tr {
                            th { "Range current" };
                            th { "Range charged" };
                            th { "Required time" };
                            th { "Available" };
                            th { "Required" };
                        };
                    };
                    tbody {
                        tr {
                            td { (estimate.range_km_display()) " km" };
                            td { (estimate.range_after_charge_km_display()) " km" };
                            td {
                                (estimate.required_hours_display()) " h ("
                                (estimate.required_minutes_display()) " min)"
                            };
                            td { (estimate.available_kwh_display()) " kWh" };
                            td { (estimate.required_kwh_display()) " kWh" };
                        };
                    };
                };
            };

            section {
                h2 { "Parameters" };
                form action=(CALCULATOR_PATH) method="get" {
                    (slider("Consumption (Wh/km)", "consumptionWhPerKm", "50", "300", "1", input.consumption_wh_per_km));
                    (slider("State of Charge %", "stateOfCharge", "0", "100", "1", input.state_of_charge_percent));
                    (slider("Charge Rate (kW)", "chargeRate", "0", "100", "0.1", input.charge_rate_kw));
                    (slider("Charge to SoC %", "chargeToSoC", "0", "100", "1", input.charge_to_soc_percent));
                    (slider("Capacity Degradation %", "degradationPercent", "0", "10", "1", input.degradation_percent));
                    label {
                        "Battery Size kWh ";
                        input name="batterySize" size="3" value=(input.battery_size_kwh);
                    };
                    br;
                    button { "Recalculate" };
                };
            };
        };
    })
}

async fn settings(
    CurrentUser(user_id): CurrentUser,
    session: Session,
    State(db): State<Db>,
) -> Result<Markup> {
    let flash = FlashHash(session).take::<Flashes>().await.unwrap_or_default();
    let providers = db.provider_counts(user_id).await.context(SettingsSnafu)?;

    Ok(page(html! {
        (top_nav());

        main {
            (flashes(&flash));

            section {
                h2 { "Providers" };

                @if providers.is_empty() {
                    p {
                        "No providers yet. The defaults ("
                        (DEFAULT_PROVIDERS.join(", "))
                        ") are created at first sign-in."
                    };
                }

                (table(
                    &providers,
                    || html! {
                        th { "Name" };
                        th.num { "Charges" };
                        th { };
                    },
                    |provider| html! {
                        td { (provider.name) };
                        td.num { (provider.count) };
                        td {
                            form action=(PROVIDER_REMOVE_PATH) method="post" {
                                input type="hidden" name="name" value=(provider.name);
                                button { "Remove" };
                            };
                        };
                    },
                ));

                form action=(PROVIDER_ADD_PATH) method="post" {
                    label {
                        "New provider ";
                        input name="name";
                    };
                    button { "Add" };
                };
            };
        };
    }))
}

#[derive(Debug, Deserialize)]
struct ProviderForm {
    name: String,
}

async fn provider_add(
    CurrentUser(user_id): CurrentUser,
    session: Session,
    State(db): State<Db>,
    Form(form): Form<ProviderForm>,
) -> Result<Response> {
    use Flash::*;

    let name = form.name.trim();

    let flash = if name.is_empty() {
        Error("Provider name cannot be empty".into())
    } else {
        match db.add_provider(name, user_id).await {
            Ok(provider) => Success(format!("Added provider '{}'", provider.name)),

            Err(DbError::AddProvider {
                source: source @ QueryError::ProviderNameTaken { .. },
            }) => Error(source.to_string()),

            Err(error) => return Err(error).context(SettingsSnafu),
        }
    };

    Ok(flash_redirect(session, flash, SETTINGS_PATH).await)
}

async fn provider_remove(
    CurrentUser(user_id): CurrentUser,
    session: Session,
    State(db): State<Db>,
    Form(form): Form<ProviderForm>,
) -> Result<Response> {
    use Flash::*;

    let name = form.name.trim();

    let flash = match db.remove_provider(name, user_id).await {
        Ok(()) => Success(format!("Removed provider '{name}'")),

        Err(DbError::RemoveProvider {
            source: source @ (QueryError::ProviderInUse { .. } | QueryError::UnknownProvider { .. }),
        }) => Error(source.to_string()),

        Err(error) => return Err(error).context(SettingsSnafu),
    };

    Ok(flash_redirect(session, flash, SETTINGS_PATH).await)
}

async fn login_page(session: Session) -> Markup {
    let flash = FlashHash(session).take::<Flashes>().await.unwrap_or_default();

    page(html! {
        main {
            (flashes(&flash));

            section {
                h1 { "Sign in" };

                form action=(LOGIN_PATH) method="post" {
                    label {
                        "Email ";
                        input name="email" type="email";
                    };
                    br;
                    label {
                        "Password ";
                        input name="password" type="password";
                    };
                    br;
                    button { "Sign in" };
                };
            };
        };
    })
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    email: String,
    password: String,
}

async fn login(
    session: Session,
    State(config): State<Arc<crate::Config>>,
    State(db): State<Db>,
    Form(form): Form<LoginForm>,
) -> Result<Response> {
    if form.email != config.user_email || form.password != config.user_password {
        warn!("Failed login attempt");
        return Ok(flash_redirect(
            session,
            Flash::Error("Invalid email or password".into()),
            LOGIN_PATH,
        )
        .await);
    }

    let user = db.ensure_user(&form.email).await.context(LoginSnafu)?;

    // Account setup happens here, not at process start.
    let seeded = db
        .seed_default_providers(user.id)
        .await
        .context(LoginSnafu)?;
    if seeded > 0 {
        info!(count = seeded, "Seeded default providers");
    }

    session
        .insert(USER_ID_SESSION_KEY, user.id)
        .await
        .context(SessionSnafu)?;

    Ok(Redirect::to(TRACKER_PATH).into_response())
}

async fn logout(session: Session) -> Response {
    session.flush().await.ok(/* A stale session will simply not resolve a user */);
    Redirect::to(LOGIN_PATH).into_response()
}

async fn shutdown(State(token): State<CancellationToken>) -> Markup {
    token.cancel();

    page(html! {
        section {
            h1 { "Server shutting down..." };
        };
    })
}

#[derive(Debug, Snafu)]
enum Error {
    Tracker { source: DbError },
    EntryAction { source: DbError },
    Settings { source: DbError },
    Login { source: DbError },

    #[cfg(feature = "fake-data")]
    FakeChargeEvents { source: DbError },

    #[snafu(display("Could not persist the session"))]
    Session { source: tower_sessions::session::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let chain = snafu::CleanedErrorText::new(&self).flat_map(|(_e, msg, _cleaned)| {
            if msg.trim().is_empty() {
                None
            } else {
                Some(msg)
            }
        });

        let page = page(html! {
            section {
                h1 { "An error occurred" };

                div {
                    ol {
                        @for msg in chain {
                            li { (msg) };
                        }
                    };

                    details {
                        summary { "Debug view" };
                        pre {
                            code { (format!("{self:#?}")) };
                        };
                    }
                }
            };
        });

        (axum::http::StatusCode::INTERNAL_SERVER_ERROR, page).into_response()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn form(action: EntryAction) -> EntryForm {
        EntryForm {
            action,
            id: Some("42".into()),
            date: Some("1.2.2023".into()),
            kilo_watt_hours: Some("12.5".into()),
            price_per_charge: Some("4.75".into()),
            provider_id: Some("7".into()),
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn insert_parses_all_fields() {
        let event = form(EntryAction::Insert).to_insert(UserId(1)).unwrap();

        assert_eq!(event.date, day(2023, 2, 1));
        assert_eq!(event.kilo_watt_hours, KiloWattHours(12.5));
        assert_eq!(event.price_per_charge, Euros(4.75));
        assert_eq!(event.provider_id, ProviderId(7));
        assert_eq!(event.user_id, UserId(1));
    }

    #[test]
    fn insert_requires_a_provider() {
        let mut f = form(EntryAction::Insert);
        f.provider_id = None;
        assert_eq!(
            f.to_insert(UserId(1)).unwrap_err(),
            EntryFormError::MissingProviderId,
        );

        // An empty select value counts as missing too
        let mut f = form(EntryAction::Insert);
        f.provider_id = Some(String::new());
        assert_eq!(
            f.to_insert(UserId(1)).unwrap_err(),
            EntryFormError::MissingProviderId,
        );
    }

    #[test]
    fn update_requires_an_id() {
        let mut f = form(EntryAction::Update);
        f.id = None;
        assert_eq!(
            f.to_update(UserId(1)).unwrap_err(),
            EntryFormError::MissingId,
        );
    }

    #[test]
    fn delete_needs_only_id_and_user() {
        let mut f = form(EntryAction::Delete);
        f.date = None;
        f.provider_id = None;

        let delete = f.to_delete(UserId(3)).unwrap();
        assert_eq!(delete.id, ChargeEventId(42));
        assert_eq!(delete.user_id, UserId(3));
    }

    #[test]
    fn bad_field_values_are_named() {
        let mut f = form(EntryAction::Insert);
        f.date = Some("2023-02-01".into());
        assert_eq!(
            f.to_insert(UserId(1)).unwrap_err(),
            EntryFormError::InvalidDate {
                value: "2023-02-01".into()
            },
        );

        let mut f = form(EntryAction::Insert);
        f.kilo_watt_hours = Some("lots".into());
        assert_eq!(
            f.to_insert(UserId(1)).unwrap_err(),
            EntryFormError::InvalidNumber {
                field: "kiloWattHours",
                value: "lots".into()
            },
        );
    }

    #[test]
    fn provider_options_keep_the_given_usage_order() {
        let providers = vec![
            ProviderCount {
                id: ProviderId(7),
                name: "virta".into(),
                count: 9,
            },
            ProviderCount {
                id: ProviderId(3),
                name: "abc".into(),
                count: 1,
            },
        ];
        let seed = EntrySeed {
            id: None,
            date: "1.2.2023".into(),
            kilo_watt_hours: 0.0,
            price_per_charge: 0.0,
            provider_id: Some(ProviderId(3)),
        };

        let markup = entry_form(&seed, &providers, false).into_string();

        let virta = markup.find(">virta<").unwrap();
        let abc = markup.find(">abc<").unwrap();
        assert!(virta < abc, "most-used provider should be the first option");
        assert!(markup.contains(r#"value="3" selected"#));
    }

    #[test]
    fn empty_amounts_default_to_zero() {
        let mut f = form(EntryAction::Insert);
        f.kilo_watt_hours = Some("  ".into());
        f.price_per_charge = None;

        let event = f.to_insert(UserId(1)).unwrap();
        assert_eq!(event.kilo_watt_hours, KiloWattHours(0.0));
        assert_eq!(event.price_per_charge, Euros(0.0));
    }
}
