use chrono::{DateTime, Utc};
use diesel::prelude::*;
use snafu::prelude::*;

use super::{
    schema::{charge_events, providers, users},
    ChargeEvent, ChargeEventDelete, ChargeEventRelation, ChargeEventUpdate, NewChargeEvent,
    Provider, ProviderCount, User, UserId,
};

/// Baseline provider names for a freshly-created account.
pub(crate) const DEFAULT_PROVIDERS: &[&str] = &["abc", "virta", "recharge", "office", "other"];

/// Finds the user for the configured login email, creating the row on first
/// login.
pub(crate) fn ensure_user(db: &mut PgConnection, email: &str) -> QueryResult<User> {
    diesel::insert_into(users::table)
        .values(users::email.eq(email))
        .on_conflict(users::email)
        .do_nothing()
        .execute(db)?;

    let user = users::table
        .filter(users::email.eq(email))
        .select(User::as_select())
        .first(db)?;

    Ok(user)
}

/// Active charge events for the user, newest first. Ties on the same day are
/// broken by id so the order stays stable across reloads.
pub(crate) fn list_charge_events(
    db: &mut PgConnection,
    user_id: UserId,
) -> QueryResult<Vec<ChargeEventRelation>> {
    let events = charge_events::table
        .inner_join(providers::table)
        .filter(charge_events::user_id.eq(user_id))
        .filter(charge_events::deleted_at.is_null())
        .order((charge_events::date.desc(), charge_events::id.desc()))
        .select((ChargeEvent::as_select(), Provider::as_select()))
        .load::<(ChargeEvent, Provider)>(db)?;

    Ok(events
        .into_iter()
        .map(|(event, provider)| ChargeEventRelation { event, provider })
        .collect())
}

/// The single most recently soft-deleted charge event, if any. Powers the
/// "restore last" undo.
pub(crate) fn last_deleted_charge_event(
    db: &mut PgConnection,
    user_id: UserId,
) -> QueryResult<Option<ChargeEvent>> {
    let event = charge_events::table
        .filter(charge_events::user_id.eq(user_id))
        .filter(charge_events::deleted_at.is_not_null())
        .order(charge_events::deleted_at.desc())
        .select(ChargeEvent::as_select())
        .first(db)
        .optional()?;

    Ok(event)
}

pub(crate) fn create_charge_event(
    db: &mut PgConnection,
    event: &NewChargeEvent,
) -> QueryResult<ChargeEvent> {
    let event = diesel::insert_into(charge_events::table)
        .values(event)
        .returning(ChargeEvent::as_returning())
        .get_result(db)?;

    Ok(event)
}

/// Matches on both id and owner; a non-owning caller affects zero rows and
/// the caller must not treat that as success. Also clears `deleted_at`,
/// which is what makes restore a plain update.
pub(crate) fn update_charge_event(
    db: &mut PgConnection,
    event: &ChargeEventUpdate,
    now: DateTime<Utc>,
) -> QueryResult<usize> {
    let rows = diesel::update(
        charge_events::table
            .filter(charge_events::id.eq(event.id))
            .filter(charge_events::user_id.eq(event.user_id)),
    )
    .set((
        charge_events::date.eq(event.date),
        charge_events::kilo_watt_hours.eq(event.kilo_watt_hours),
        charge_events::price_per_charge.eq(event.price_per_charge),
        charge_events::provider_id.eq(event.provider_id),
        charge_events::deleted_at.eq(None::<DateTime<Utc>>),
        charge_events::updated_at.eq(now),
    ))
    .execute(db)?;

    Ok(rows)
}

/// Soft delete. Deleting an already-deleted event matches zero rows.
pub(crate) fn delete_charge_event(
    db: &mut PgConnection,
    event: &ChargeEventDelete,
    now: DateTime<Utc>,
) -> QueryResult<usize> {
    let rows = diesel::update(
        charge_events::table
            .filter(charge_events::id.eq(event.id))
            .filter(charge_events::user_id.eq(event.user_id))
            .filter(charge_events::deleted_at.is_null()),
    )
    .set((
        charge_events::deleted_at.eq(Some(now)),
        charge_events::updated_at.eq(now),
    ))
    .execute(db)?;

    Ok(rows)
}

/// Clears the deletion marker on the most recently soft-deleted event.
/// `None` means there was nothing to restore.
pub(crate) fn restore_last_deleted(
    db: &mut PgConnection,
    user_id: UserId,
    now: DateTime<Utc>,
) -> QueryResult<Option<ChargeEvent>> {
    let Some(last) = last_deleted_charge_event(db, user_id)? else {
        return Ok(None);
    };

    let update = ChargeEventUpdate {
        id: last.id,
        user_id: last.user_id,
        date: last.date,
        kilo_watt_hours: last.kilo_watt_hours,
        price_per_charge: last.price_per_charge,
        provider_id: last.provider_id,
    };
    update_charge_event(db, &update, now)?;

    Ok(Some(last))
}

/// Providers annotated with the number of active charge events referencing
/// them, most-used first.
pub(crate) fn provider_counts(
    db: &mut PgConnection,
    user_id: UserId,
) -> QueryResult<Vec<ProviderCount>> {
    let counts = providers::table
        .left_join(
            charge_events::table.on(charge_events::provider_id
                .eq(providers::id)
                .and(charge_events::user_id.eq(user_id))
                .and(charge_events::deleted_at.is_null())),
        )
        .filter(providers::user_id.eq(user_id))
        .group_by((providers::id, providers::name))
        .select((
            providers::id,
            providers::name,
            diesel::dsl::count(charge_events::id.nullable()),
        ))
        .load::<(super::ProviderId, String, i64)>(db)?;

    let mut counts: Vec<_> = counts
        .into_iter()
        .map(|(id, name, count)| ProviderCount { id, name, count })
        .collect();
    sort_provider_counts(&mut counts);

    Ok(counts)
}

/// Most-used first; ties fall back to the name so the order is stable.
fn sort_provider_counts(counts: &mut [ProviderCount]) {
    counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
}

/// Explicit conflict on duplicate names instead of a silent upsert.
pub(crate) fn add_provider(
    db: &mut PgConnection,
    name: &str,
    user_id: UserId,
) -> QueryResult<Provider> {
    let existing: i64 = providers::table
        .filter(providers::user_id.eq(user_id))
        .filter(providers::name.eq(name))
        .count()
        .get_result(db)?;
    ensure!(existing == 0, ProviderNameTakenSnafu { name });

    let provider = diesel::insert_into(providers::table)
        .values((providers::name.eq(name), providers::user_id.eq(user_id)))
        .returning(Provider::as_returning())
        .get_result(db)?;

    Ok(provider)
}

/// Rejected while any active charge event still points at the provider.
/// Soft-deleted events do not block removal; they are purged together with
/// the provider since the foreign key has nowhere else to point.
pub(crate) fn remove_provider(db: &mut PgConnection, name: &str, user_id: UserId) -> QueryResult<()> {
    let provider = providers::table
        .filter(providers::user_id.eq(user_id))
        .filter(providers::name.eq(name))
        .select(Provider::as_select())
        .first(db)
        .optional()?
        .context(UnknownProviderSnafu { name })?;

    let active: i64 = charge_events::table
        .filter(charge_events::provider_id.eq(provider.id))
        .filter(charge_events::deleted_at.is_null())
        .count()
        .get_result(db)?;
    ensure!(
        active == 0,
        ProviderInUseSnafu {
            name,
            count: active,
        }
    );

    diesel::delete(
        charge_events::table
            .filter(charge_events::provider_id.eq(provider.id))
            .filter(charge_events::deleted_at.is_not_null()),
    )
    .execute(db)?;

    diesel::delete(providers::table.find(provider.id)).execute(db)?;

    Ok(())
}

/// Idempotent account setup: only fires while the user has zero providers.
pub(crate) fn seed_default_providers(db: &mut PgConnection, user_id: UserId) -> QueryResult<usize> {
    let existing: i64 = providers::table
        .filter(providers::user_id.eq(user_id))
        .count()
        .get_result(db)?;
    if existing > 0 {
        return Ok(0);
    }

    let rows: Vec<_> = DEFAULT_PROVIDERS
        .iter()
        .map(|&name| (providers::name.eq(name), providers::user_id.eq(user_id)))
        .collect();

    let inserted = diesel::insert_into(providers::table)
        .values(&rows)
        .execute(db)?;

    Ok(inserted)
}

#[derive(Debug, Snafu)]
pub(crate) enum QueryError {
    #[snafu(context(false))]
    Database { source: diesel::result::Error },

    #[snafu(display("A provider named '{name}' already exists"))]
    ProviderNameTaken { name: String },

    #[snafu(display("There is no provider named '{name}'"))]
    UnknownProvider { name: String },

    #[snafu(display("Provider '{name}' is still used by {count} charge events"))]
    ProviderInUse { name: String, count: i64 },
}

pub(crate) type QueryResult<T, E = QueryError> = std::result::Result<T, E>;

#[cfg(feature = "fake-data")]
pub(crate) mod fake {
    use chrono::{DateTime, Duration, Utc};
    use diesel::prelude::*;
    use rand::{seq::SliceRandom, Rng};

    use super::{QueryResult, UserId};
    use crate::{
        db::{schema::charge_events, Euros, KiloWattHours, NewChargeEvent},
        format::round2,
    };

    /// Inserts a handful of plausible charge events spread over the last
    /// year. Requires the user to already have providers.
    pub(crate) fn charge_events(
        db: &mut PgConnection,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> QueryResult<usize> {
        const BATCH: usize = 10;

        let providers = super::provider_counts(db, user_id)?;
        if providers.is_empty() {
            return Ok(0);
        }

        let mut rng = rand::thread_rng();
        let events: Vec<_> = (0..BATCH)
            .map(|_| {
                let provider = providers.choose(&mut rng).unwrap();
                let days_ago = rng.gen_range(0..365);
                let kilo_watt_hours = round2(rng.gen_range(2.0..60.0));
                let price_per_charge = round2(rng.gen_range(0.5..30.0));

                NewChargeEvent {
                    date: (now - Duration::days(days_ago)).date_naive(),
                    kilo_watt_hours: KiloWattHours(kilo_watt_hours),
                    price_per_charge: Euros(price_per_charge),
                    provider_id: provider.id,
                    user_id,
                }
            })
            .collect();

        let inserted = diesel::insert_into(charge_events::table)
            .values(&events)
            .execute(db)?;

        Ok(inserted)
    }
}

#[cfg(test)]
mod test {
    use chrono::{NaiveDate, Utc};
    use diesel::prelude::*;

    use super::*;
    use crate::db::{Euros, KiloWattHours, ProviderId};

    fn count(id: i64, name: &str, count: i64) -> ProviderCount {
        ProviderCount {
            id: ProviderId(id),
            name: name.into(),
            count,
        }
    }

    #[test]
    fn providers_order_by_usage_then_name() {
        let mut counts = vec![
            count(1, "virta", 2),
            count(2, "abc", 5),
            count(3, "office", 2),
        ];
        sort_provider_counts(&mut counts);

        let names: Vec<_> = counts.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["abc", "office", "virta"]);
    }

    // The remaining tests need a reachable database and are skipped
    // otherwise. Everything runs inside a transaction that is rolled back.
    fn database() -> Option<PgConnection> {
        let url = std::env::var("DATABASE_URL").ok()?;
        crate::db::init(&url).ok()
    }

    fn event_at(provider_id: ProviderId, user_id: UserId) -> NewChargeEvent {
        NewChargeEvent {
            date: NaiveDate::from_ymd_opt(2023, 2, 1).unwrap(),
            kilo_watt_hours: KiloWattHours(10.0),
            price_per_charge: Euros(4.0),
            provider_id,
            user_id,
        }
    }

    #[test]
    fn soft_deleted_events_do_not_block_provider_removal() {
        let Some(mut db) = database() else { return };

        db.test_transaction(|db| -> Result<(), QueryError> {
            let user = ensure_user(db, "removal-test@example.com")?;
            let provider = add_provider(db, "ionity", user.id)?;

            let event = create_charge_event(db, &event_at(provider.id, user.id))?;
            delete_charge_event(
                db,
                &ChargeEventDelete {
                    id: event.id,
                    user_id: user.id,
                },
                Utc::now(),
            )?;

            remove_provider(db, "ionity", user.id)?;

            let remaining = provider_counts(db, user.id)?;
            assert!(remaining.iter().all(|p| p.name != "ionity"));
            Ok(())
        });
    }

    #[test]
    fn active_events_block_provider_removal() {
        let Some(mut db) = database() else { return };

        db.test_transaction(|db| -> Result<(), QueryError> {
            let user = ensure_user(db, "in-use-test@example.com")?;
            let provider = add_provider(db, "ionity", user.id)?;
            create_charge_event(db, &event_at(provider.id, user.id))?;

            let error = remove_provider(db, "ionity", user.id).unwrap_err();
            assert!(matches!(error, QueryError::ProviderInUse { count: 1, .. }));
            Ok(())
        });
    }
}
