//! Range and charge-time estimation from battery and consumption parameters.
//!
//! Pure arithmetic, no persistence. The inputs come straight from the
//! calculator page's sliders; their ranges are enforced by the form, not
//! here. Intermediate values stay unrounded, only the display accessors
//! round.

use crate::format::{round0, round1};

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct CalculatorInput {
    pub battery_size_kwh: f64,
    pub state_of_charge_percent: f64,
    pub charge_rate_kw: f64,
    pub degradation_percent: f64,
    pub consumption_wh_per_km: f64,
    pub charge_to_soc_percent: f64,
}

impl Default for CalculatorInput {
    fn default() -> Self {
        Self {
            battery_size_kwh: 28.0,
            state_of_charge_percent: 50.0,
            // 16A single phase continuous current
            charge_rate_kw: 3.3,
            degradation_percent: 4.0,
            consumption_wh_per_km: 150.0,
            charge_to_soc_percent: 100.0,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Estimate {
    pub available_battery_kwh: f64,
    pub available_kwh: f64,
    pub range_km: f64,
    pub required_kwh_to_charge: f64,
    pub required_hours: f64,
    pub required_minutes: f64,
    pub range_after_charge_km: f64,
}

impl CalculatorInput {
    pub fn estimate(&self) -> Estimate {
        let used_percentage = 100.0 - self.state_of_charge_percent;
        let available_battery_kwh =
            self.battery_size_kwh * (100.0 - self.degradation_percent) / 100.0;
        let used_kwh = available_battery_kwh * used_percentage / 100.0;
        let available_kwh = available_battery_kwh - used_kwh;
        let range_km = available_kwh / self.consumption_wh_per_km * 1000.0;

        // Not clamped: a target SoC below the current one yields a negative
        // required charge, which the page shows as-is.
        let required_kwh_to_charge = (self.charge_to_soc_percent - self.state_of_charge_percent)
            * available_battery_kwh
            / 100.0;

        let required_hours = required_kwh_to_charge / charge_rate_by_efficiency(self.charge_rate_kw);
        let required_minutes = required_hours * 60.0;

        let range_after_charge_km =
            (available_kwh + required_kwh_to_charge) / self.consumption_wh_per_km * 1000.0;

        Estimate {
            available_battery_kwh,
            available_kwh,
            range_km,
            required_kwh_to_charge,
            required_hours,
            required_minutes,
            range_after_charge_km,
        }
    }
}

/// Napkin-math efficiency reduction for charge rates at or below 11 kW
/// (16A 3-phase). Higher-rate chargers are left untouched; real losses also
/// depend on temperature, which this does not try to model.
fn charge_rate_by_efficiency(charge_rate_kw: f64) -> f64 {
    const CUTOFF_KW: f64 = 11.0;
    const EFFICIENCY: f64 = 0.9;

    if charge_rate_kw <= CUTOFF_KW {
        charge_rate_kw * EFFICIENCY
    } else {
        charge_rate_kw
    }
}

impl Estimate {
    pub fn range_km_display(&self) -> f64 {
        round0(self.range_km)
    }

    pub fn range_after_charge_km_display(&self) -> f64 {
        round0(self.range_after_charge_km)
    }

    pub fn available_kwh_display(&self) -> f64 {
        round1(self.available_kwh)
    }

    pub fn required_kwh_display(&self) -> f64 {
        round1(self.required_kwh_to_charge)
    }

    pub fn required_hours_display(&self) -> f64 {
        round1(self.required_hours)
    }

    pub fn required_minutes_display(&self) -> f64 {
        round0(self.required_minutes)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "{actual} != {expected}",
        );
    }

    #[test]
    fn default_scenario() {
        let estimate = CalculatorInput::default().estimate();

        close(estimate.available_battery_kwh, 26.88);
        close(estimate.available_kwh, 13.44);
        close(estimate.required_kwh_to_charge, 13.44);
        close(estimate.required_hours, 13.44 / (3.3 * 0.9));

        assert_eq!(estimate.range_km_display(), 90.0);
        assert_eq!(estimate.required_hours_display(), 4.5);
        assert_eq!(estimate.range_after_charge_km_display(), 179.0);
    }

    #[test]
    fn no_efficiency_derate_above_cutoff() {
        let input = CalculatorInput {
            charge_rate_kw: 50.0,
            ..CalculatorInput::default()
        };
        let estimate = input.estimate();

        close(estimate.required_hours, 13.44 / 50.0);
    }

    #[test]
    fn full_battery_needs_no_charge() {
        let input = CalculatorInput {
            state_of_charge_percent: 100.0,
            ..CalculatorInput::default()
        };
        let estimate = input.estimate();

        close(estimate.required_kwh_to_charge, 0.0);
        close(estimate.required_hours, 0.0);
        close(estimate.available_kwh, estimate.available_battery_kwh);
        close(estimate.range_after_charge_km, estimate.range_km);
    }

    #[test]
    fn target_below_current_soc_goes_negative() {
        let input = CalculatorInput {
            charge_to_soc_percent: 20.0,
            ..CalculatorInput::default()
        };
        let estimate = input.estimate();

        close(estimate.required_kwh_to_charge, -0.3 * 26.88);
        assert!(estimate.required_hours < 0.0);
    }
}
