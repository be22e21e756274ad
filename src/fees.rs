//! Parking fee calculation for ParkPoint.
//!
//! Billing is day-based: any portion of a 24-hour block past the first
//! counts as a full extra day, and a stay of any length bills at least one
//! day. Rates come from the `vehicle_rates` table with a fixed fallback for
//! unknown vehicle types. Stays longer than the overstay threshold accrue a
//! penalty on top of the base fee.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::db;

/// Daily rate applied when a vehicle type is missing from the rate card.
pub const FALLBACK_DAILY_RATE: f64 = 100.0;

/// Default overstay threshold in hours.
pub const DEFAULT_OVERSTAY_HOURS: f64 = 24.0;

/// Default overstay penalty multiplier (1.5 = base fee + 50% penalty per
/// penalty day).
pub const DEFAULT_PENALTY_MULTIPLIER: f64 = 1.5;

// ---------------------------------------------------------------------------
// Fee breakdown
// ---------------------------------------------------------------------------

/// Result of a single fee calculation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FeeBreakdown {
    pub vehicle_type: String,
    pub daily_rate: f64,
    pub chargeable_days: i64,
    pub duration_hours: f64,
    pub base_fee: f64,
    pub is_overstay: bool,
    pub penalty_fee: f64,
    pub total_fee: f64,
}

impl FeeBreakdown {
    /// Calculate the fee for a stay.
    ///
    /// Errors if `exit_time` is before `entry_time`.
    pub fn calculate(
        vehicle_type: &str,
        entry_time: DateTime<Utc>,
        exit_time: DateTime<Utc>,
        rates: &HashMap<String, f64>,
        overstay_threshold_hours: f64,
        penalty_multiplier: f64,
    ) -> Result<Self, String> {
        let duration = exit_time - entry_time;
        if duration < Duration::zero() {
            return Err(format!(
                "Exit time {exit_time} is before entry time {entry_time}"
            ));
        }

        let days = chargeable_days(duration);
        let daily_rate = rates
            .get(vehicle_type)
            .copied()
            .unwrap_or(FALLBACK_DAILY_RATE);
        let base_fee = daily_rate * days as f64;

        let duration_hours = duration.num_seconds() as f64 / 3600.0;
        let is_overstay = duration_hours > overstay_threshold_hours;
        let penalty_fee = if is_overstay {
            let overstay_hours = duration_hours - overstay_threshold_hours;
            let penalty_days = (overstay_hours / 24.0).ceil() as i64;
            daily_rate * penalty_days as f64 * (penalty_multiplier - 1.0)
        } else {
            0.0
        };

        Ok(Self {
            vehicle_type: vehicle_type.to_string(),
            daily_rate,
            chargeable_days: days,
            duration_hours,
            base_fee,
            is_overstay,
            penalty_fee,
            total_fee: base_fee + penalty_fee,
        })
    }
}

/// Number of chargeable days for a stay.
///
/// Whole 24-hour blocks plus one for any remainder; a stay of any length
/// (including zero) bills at least one day.
fn chargeable_days(duration: Duration) -> i64 {
    let whole_days = duration.num_days();
    let remainder = duration - Duration::days(whole_days);
    let days = if remainder > Duration::zero() {
        whole_days + 1
    } else {
        whole_days
    };
    days.max(1)
}

// ---------------------------------------------------------------------------
// Calculator service
// ---------------------------------------------------------------------------

/// Fee calculator holding the rate card and overstay policy.
#[derive(Debug, Clone)]
pub struct FeeCalculator {
    rates: HashMap<String, f64>,
    pub overstay_threshold_hours: f64,
    pub penalty_multiplier: f64,
}

impl FeeCalculator {
    pub fn new(rates: HashMap<String, f64>) -> Self {
        Self {
            rates,
            overstay_threshold_hours: DEFAULT_OVERSTAY_HOURS,
            penalty_multiplier: DEFAULT_PENALTY_MULTIPLIER,
        }
    }

    /// Build a calculator from the database: active rate card rows plus the
    /// `fees` settings category (overstay threshold, penalty multiplier).
    pub fn from_db(conn: &rusqlite::Connection) -> Result<Self, String> {
        let rates: HashMap<String, f64> = db::load_vehicle_rates(conn)?.into_iter().collect();
        let mut calculator = Self::new(rates);

        if let Some(hours) = db::get_setting(conn, "fees", "overstay_hours")
            .and_then(|v| v.parse::<f64>().ok())
        {
            calculator.overstay_threshold_hours = hours;
        }
        if let Some(multiplier) = db::get_setting(conn, "fees", "penalty_multiplier")
            .and_then(|v| v.parse::<f64>().ok())
        {
            calculator.penalty_multiplier = multiplier;
        }

        Ok(calculator)
    }

    /// Daily rate for a vehicle type, with fallback for unknown types.
    pub fn daily_rate(&self, vehicle_type: &str) -> f64 {
        self.rates
            .get(vehicle_type)
            .copied()
            .unwrap_or(FALLBACK_DAILY_RATE)
    }

    /// True when the vehicle type has an active rate card row.
    pub fn knows_vehicle_type(&self, vehicle_type: &str) -> bool {
        self.rates.contains_key(vehicle_type)
    }

    pub fn vehicle_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.rates.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn calculate(
        &self,
        vehicle_type: &str,
        entry_time: DateTime<Utc>,
        exit_time: DateTime<Utc>,
    ) -> Result<FeeBreakdown, String> {
        FeeBreakdown::calculate(
            vehicle_type,
            entry_time,
            exit_time,
            &self.rates,
            self.overstay_threshold_hours,
            self.penalty_multiplier,
        )
    }

    /// Estimate the base fee for a projected stay of `hours` hours.
    pub fn estimate(&self, vehicle_type: &str, hours: f64) -> f64 {
        let days = (hours / 24.0).ceil().max(1.0);
        self.daily_rate(vehicle_type) * days
    }

    /// Penalty amount for a stay of `total_hours`, zero within the threshold.
    pub fn overstay_penalty(&self, vehicle_type: &str, total_hours: f64) -> f64 {
        if total_hours <= self.overstay_threshold_hours {
            return 0.0;
        }
        let overstay_hours = total_hours - self.overstay_threshold_hours;
        let penalty_days = (overstay_hours / 24.0).ceil();
        self.daily_rate(vehicle_type) * penalty_days * (self.penalty_multiplier - 1.0)
    }

    /// Complete rate schedule for the settings screen.
    pub fn rate_schedule(&self) -> serde_json::Value {
        let mut rates: Vec<(&String, &f64)> = self.rates.iter().collect();
        rates.sort_by(|a, b| a.0.cmp(b.0));
        let rates_obj: serde_json::Map<String, serde_json::Value> = rates
            .into_iter()
            .map(|(k, v)| (k.clone(), serde_json::json!(v)))
            .collect();

        serde_json::json!({
            "rates": rates_obj,
            "fallback_daily_rate": FALLBACK_DAILY_RATE,
            "overstay_threshold_hours": self.overstay_threshold_hours,
            "penalty_multiplier": self.penalty_multiplier,
            "calculation_method": "ceiling(hours/24) days x daily rate, minimum 1 day",
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn default_rates() -> HashMap<String, f64> {
        HashMap::from([
            ("Trailer".to_string(), 225.0),
            ("6 Wheeler".to_string(), 150.0),
            ("4 Wheeler".to_string(), 100.0),
            ("2 Wheeler".to_string(), 50.0),
        ])
    }

    fn at(h: i64, m: i64, s: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap()
            + Duration::hours(h)
            + Duration::minutes(m)
            + Duration::seconds(s)
    }

    fn entry() -> DateTime<Utc> {
        at(0, 0, 0)
    }

    #[test]
    fn test_day_boundaries() {
        // (duration h, m, s) -> expected chargeable days
        let cases = [
            ((1, 0, 0), 1),   // 1 hour = 1 day
            ((12, 0, 0), 1),  // 12 hours = 1 day
            ((23, 59, 59), 1),
            ((24, 0, 0), 1),  // exactly 24 hours = 1 day
            ((24, 0, 1), 2),  // one second past a full day = 2 days
            ((25, 0, 0), 2),
            ((48, 0, 0), 2),
            ((48, 0, 1), 3),
            ((60, 0, 0), 3),  // 2.5 days = 3 days
        ];

        let rates = HashMap::from([("Test".to_string(), 40.0)]);
        for ((h, m, s), expected_days) in cases {
            let calc = FeeBreakdown::calculate(
                "Test",
                entry(),
                at(h, m, s),
                &rates,
                DEFAULT_OVERSTAY_HOURS,
                1.0, // no penalty, day logic only
            )
            .expect("calculate");
            assert_eq!(
                calc.chargeable_days, expected_days,
                "wrong day count for {h}:{m:02}:{s:02}"
            );
            assert_eq!(
                calc.base_fee,
                expected_days as f64 * 40.0,
                "wrong base fee for {h}:{m:02}:{s:02}"
            );
        }
    }

    #[test]
    fn test_zero_duration_bills_one_day() {
        let calc = FeeBreakdown::calculate(
            "4 Wheeler",
            entry(),
            entry(),
            &default_rates(),
            DEFAULT_OVERSTAY_HOURS,
            DEFAULT_PENALTY_MULTIPLIER,
        )
        .expect("calculate");
        assert_eq!(calc.chargeable_days, 1);
        assert_eq!(calc.base_fee, 100.0);
        assert_eq!(calc.total_fee, 100.0);
    }

    #[test]
    fn test_sub_second_remainder_counts() {
        // Even a microsecond past a full day boundary adds a day
        let exit = at(24, 0, 0) + Duration::microseconds(1);
        let rates = HashMap::from([("Test".to_string(), 40.0)]);
        let calc =
            FeeBreakdown::calculate("Test", entry(), exit, &rates, DEFAULT_OVERSTAY_HOURS, 1.0)
                .expect("calculate");
        assert_eq!(calc.chargeable_days, 2);
    }

    #[test]
    fn test_all_vehicle_types_two_days() {
        let exit = at(25, 0, 0); // 25 hours = 2 days, no overstay penalty check here
        let expected = [
            ("Trailer", 450.0),
            ("6 Wheeler", 300.0),
            ("4 Wheeler", 200.0),
            ("2 Wheeler", 100.0),
        ];
        for (vehicle_type, fee) in expected {
            let calc = FeeBreakdown::calculate(
                vehicle_type,
                entry(),
                exit,
                &default_rates(),
                48.0, // keep the overstay penalty out of this test
                DEFAULT_PENALTY_MULTIPLIER,
            )
            .expect("calculate");
            assert_eq!(calc.chargeable_days, 2);
            assert_eq!(calc.base_fee, fee, "wrong fee for {vehicle_type}");
            assert_eq!(calc.total_fee, fee);
        }
    }

    #[test]
    fn test_unknown_vehicle_type_uses_fallback_rate() {
        let rates = HashMap::from([("Known".to_string(), 50.0)]);
        let calc = FeeBreakdown::calculate(
            "Unknown",
            entry(),
            at(25, 0, 0),
            &rates,
            48.0,
            DEFAULT_PENALTY_MULTIPLIER,
        )
        .expect("calculate");
        assert_eq!(calc.daily_rate, FALLBACK_DAILY_RATE);
        assert_eq!(calc.base_fee, 200.0);
    }

    #[test]
    fn test_exit_before_entry_is_error() {
        let result = FeeBreakdown::calculate(
            "4 Wheeler",
            entry(),
            entry() - Duration::hours(1),
            &default_rates(),
            DEFAULT_OVERSTAY_HOURS,
            DEFAULT_PENALTY_MULTIPLIER,
        );
        assert!(result.is_err(), "negative duration should be rejected");
    }

    #[test]
    fn test_no_penalty_at_exact_threshold() {
        let calc = FeeBreakdown::calculate(
            "4 Wheeler",
            entry(),
            at(24, 0, 0),
            &default_rates(),
            24.0,
            DEFAULT_PENALTY_MULTIPLIER,
        )
        .expect("calculate");
        assert!(!calc.is_overstay);
        assert_eq!(calc.penalty_fee, 0.0);
        assert_eq!(calc.total_fee, calc.base_fee);
    }

    #[test]
    fn test_penalty_applied_over_threshold() {
        // 30 hours: 6 hours over a 24h threshold = 1 penalty day
        // penalty = 100 * 1 * (1.5 - 1.0) = 50
        let calc = FeeBreakdown::calculate(
            "4 Wheeler",
            entry(),
            at(30, 0, 0),
            &default_rates(),
            24.0,
            1.5,
        )
        .expect("calculate");
        assert!(calc.is_overstay);
        assert_eq!(calc.chargeable_days, 2);
        assert_eq!(calc.base_fee, 200.0);
        assert_eq!(calc.penalty_fee, 50.0);
        assert_eq!(calc.total_fee, 250.0);
    }

    #[test]
    fn test_penalty_day_boundaries() {
        // (total hours, expected penalty days) at a 24h threshold
        let cases = [(25, 1), (48, 1), (49, 2), (72, 2), (73, 3)];
        let rates = HashMap::from([("Test".to_string(), 40.0)]);
        for (hours, penalty_days) in cases {
            // multiplier 2.0 makes penalty = rate * penalty_days
            let calc = FeeBreakdown::calculate(
                "Test",
                entry(),
                at(hours, 0, 0),
                &rates,
                24.0,
                2.0,
            )
            .expect("calculate");
            assert_eq!(
                calc.penalty_fee,
                40.0 * penalty_days as f64,
                "wrong penalty for {hours}h"
            );
        }
    }

    #[test]
    fn test_calculator_defaults_from_db() {
        let conn = rusqlite::Connection::open_in_memory().expect("open db");
        crate::db::run_migrations_for_test(&conn);

        let calc = FeeCalculator::from_db(&conn).expect("from_db");
        assert_eq!(calc.daily_rate("Trailer"), 225.0);
        assert_eq!(calc.daily_rate("6 Wheeler"), 150.0);
        assert_eq!(calc.daily_rate("Nonexistent"), FALLBACK_DAILY_RATE);
        assert_eq!(calc.overstay_threshold_hours, DEFAULT_OVERSTAY_HOURS);
        assert_eq!(calc.penalty_multiplier, DEFAULT_PENALTY_MULTIPLIER);
        assert!(calc.knows_vehicle_type("2 Wheeler"));
        assert!(!calc.knows_vehicle_type("Hovercraft"));
    }

    #[test]
    fn test_calculator_reads_fee_settings() {
        let conn = rusqlite::Connection::open_in_memory().expect("open db");
        crate::db::run_migrations_for_test(&conn);
        crate::db::set_setting(&conn, "fees", "overstay_hours", "12").expect("set");
        crate::db::set_setting(&conn, "fees", "penalty_multiplier", "2.0").expect("set");

        let calc = FeeCalculator::from_db(&conn).expect("from_db");
        assert_eq!(calc.overstay_threshold_hours, 12.0);
        assert_eq!(calc.penalty_multiplier, 2.0);
    }

    #[test]
    fn test_estimate() {
        let calc = FeeCalculator::new(default_rates());
        assert_eq!(calc.estimate("4 Wheeler", 1.0), 100.0);
        assert_eq!(calc.estimate("4 Wheeler", 24.0), 100.0);
        assert_eq!(calc.estimate("4 Wheeler", 25.0), 200.0);
        assert_eq!(calc.estimate("Trailer", 30.0), 450.0);
    }

    #[test]
    fn test_overstay_penalty_helper() {
        let calc = FeeCalculator::new(default_rates());
        assert_eq!(calc.overstay_penalty("4 Wheeler", 24.0), 0.0);
        // 6 hours over = 1 penalty day; 100 * 1 * 0.5 = 50
        assert_eq!(calc.overstay_penalty("4 Wheeler", 30.0), 50.0);
    }

    #[test]
    fn test_rate_schedule_shape() {
        let calc = FeeCalculator::new(default_rates());
        let schedule = calc.rate_schedule();
        assert_eq!(schedule["rates"]["Trailer"], 225.0);
        assert_eq!(schedule["overstay_threshold_hours"], 24.0);
        assert_eq!(schedule["penalty_multiplier"], 1.5);
        assert!(schedule["calculation_method"]
            .as_str()
            .unwrap()
            .contains("ceiling(hours/24)"));
    }
}
