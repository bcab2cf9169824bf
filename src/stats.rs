//! Summary statistics over the visible charge events.

use chrono::NaiveDate;

use crate::{
    db::{ChargeEvent, Euros, KiloWattHours},
    format::{round1, round2},
};

/// A pure fold over charge events, assumed already filtered to active rows
/// and ordered the way the page shows them (date descending), so `first` is
/// the most recent event and `last` the oldest visible one.
///
/// The running sums are rounded to two decimals at every accumulation step,
/// not just at the end. That loses a little precision on long histories but
/// reproduces the totals users have already seen, so it stays.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeStats {
    pub count: usize,
    pub total_kwh: KiloWattHours,
    pub total_price: Euros,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
}

impl ChargeStats {
    pub fn collect<'a>(events: impl IntoIterator<Item = &'a ChargeEvent>) -> Self {
        let mut stats = Self {
            count: 0,
            total_kwh: KiloWattHours(0.0),
            total_price: Euros(0.0),
            first_date: None,
            last_date: None,
        };

        for event in events {
            stats.count += 1;
            stats.total_kwh = KiloWattHours(round2(stats.total_kwh.0 + event.kilo_watt_hours.0));
            stats.total_price = Euros(round2(stats.total_price.0 + event.price_per_charge.0));

            if stats.first_date.is_none() {
                stats.first_date = Some(event.date);
            }
            stats.last_date = Some(event.date);
        }

        stats
    }

    /// Effective unit price in cents per kWh, or `None` when no energy has
    /// been logged (the division would be meaningless).
    pub fn average_unit_price_cents(&self) -> Option<f64> {
        if self.total_kwh.0 == 0.0 {
            return None;
        }

        Some(round1(self.total_price.0 / self.total_kwh.0 * 100.0))
    }
}

#[cfg(test)]
mod test {
    use chrono::Utc;

    use super::*;
    use crate::db::{ChargeEventId, ProviderId, UserId};

    fn event(date: NaiveDate, kwh: f64, price: f64) -> ChargeEvent {
        let now = Utc::now();
        ChargeEvent {
            id: ChargeEventId(1),
            date,
            kilo_watt_hours: KiloWattHours(kwh),
            price_per_charge: Euros(price),
            provider_id: ProviderId(1),
            user_id: UserId(1),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn empty_input_yields_zeroes_and_no_unit_price() {
        let stats = ChargeStats::collect([]);

        assert_eq!(stats.count, 0);
        assert_eq!(stats.total_kwh, KiloWattHours(0.0));
        assert_eq!(stats.total_price, Euros(0.0));
        assert_eq!(stats.first_date, None);
        assert_eq!(stats.last_date, None);
        assert_eq!(stats.average_unit_price_cents(), None);
    }

    #[test]
    fn sums_and_dates_follow_input_order() {
        let events = [
            event(day(2023, 2, 1), 10.0, 4.0),
            event(day(2023, 1, 15), 20.5, 6.25),
            event(day(2022, 12, 24), 5.25, 1.5),
        ];
        let stats = ChargeStats::collect(&events);

        assert_eq!(stats.count, 3);
        assert_eq!(stats.total_kwh, KiloWattHours(35.75));
        assert_eq!(stats.total_price, Euros(11.75));
        assert_eq!(stats.first_date, Some(day(2023, 2, 1)));
        assert_eq!(stats.last_date, Some(day(2022, 12, 24)));
    }

    #[test]
    fn running_sum_is_rounded_at_every_step() {
        // Each step rounds before the next addition, so the sub-cent
        // contributions collapse to 0.0 instead of accumulating.
        let events = [
            event(day(2023, 1, 1), 0.001, 0.0),
            event(day(2023, 1, 2), 0.001, 0.0),
            event(day(2023, 1, 3), 0.001, 0.0),
        ];
        let stats = ChargeStats::collect(&events);

        assert_eq!(stats.total_kwh, KiloWattHours(0.0));
    }

    #[test]
    fn unit_price_is_cents_rounded_to_one_decimal() {
        let events = [event(day(2023, 1, 1), 8.0, 1.0)];
        let stats = ChargeStats::collect(&events);

        // 1.0 / 8.0 * 100 = 12.5 cents
        assert_eq!(stats.average_unit_price_cents(), Some(12.5));
    }

    #[test]
    fn collecting_twice_yields_identical_output() {
        let events = [
            event(day(2023, 2, 1), 12.34, 5.67),
            event(day(2023, 1, 1), 43.21, 7.65),
        ];

        assert_eq!(ChargeStats::collect(&events), ChargeStats::collect(&events));
    }
}
