//! Linke atmospheric turbidity by day of year.
//!
//! Clear-sky radiation models take a Linke turbidity
//! coefficient describing atmospheric clarity. Published
//! tables give one value per month; this module interpolates
//! them to daily values, treating each monthly value as the
//! mid-month value and wrapping three months across the
//! year boundary so the December-January transition is as
//! smooth as any other.

use anyhow::bail;

use crate::Result;

/// Monthly Linke turbidity for Mount Gambier (latitude
/// -37.7), from the worldwide Linke turbidity tables.
pub const MOUNT_GAMBIER: [f64; 12] = [2.9, 3.0, 2.8, 2.7, 3.0, 2.8, 2.5, 2.9, 3.3, 2.9, 3.1, 3.1];

const DAYS_PER_MONTH: [f64; 12] = [31., 28., 31., 30., 31., 30., 31., 31., 30., 31., 30., 31.];

/// Number of anchor points after mirroring three months on
/// each side of the year.
const WRAPPED: usize = 18;

/// Monthly turbidity table interpolated to per-day values.
#[derive(Debug, Clone)]
pub struct LinkeTable {
    monthly: [f64; 12],
}

impl Default for LinkeTable {
    fn default() -> Self {
        LinkeTable {
            monthly: MOUNT_GAMBIER,
        }
    }
}

impl LinkeTable {
    pub fn new(monthly: [f64; 12]) -> Self {
        LinkeTable { monthly }
    }

    /// Turbidity for a day of year in `1..=365`.
    pub fn value_for_day(&self, day: u32) -> Result<f64> {
        if day < 1 || day > 365 {
            bail!("day must be within 1..365, got {}", day);
        }
        Ok(self.interpolate(day as f64))
    }

    /// Lazy iterator over the 365 daily values. Values are
    /// recomputed on each call, never cached.
    pub fn daily(&self) -> impl Iterator<Item = f64> + '_ {
        (1..=365u32).map(move |day| self.interpolate(day as f64))
    }

    /// Anchor days (mid-month, wrapped by one quarter on
    /// each side of the year) and their turbidity values.
    fn anchors(&self) -> ([f64; WRAPPED], [f64; WRAPPED]) {
        let mut mid_month = [0.; 12];
        let mut elapsed = 0.;
        for (i, mid) in mid_month.iter_mut().enumerate() {
            *mid = 15. + elapsed;
            elapsed += DAYS_PER_MONTH[i];
        }

        let mut days = [0.; WRAPPED];
        let mut values = [0.; WRAPPED];
        for i in 0..3 {
            days[i] = mid_month[9 + i] - 365.;
            values[i] = self.monthly[9 + i];

            days[15 + i] = mid_month[i] + 365.;
            values[15 + i] = self.monthly[i];
        }
        for i in 0..12 {
            days[3 + i] = mid_month[i];
            values[3 + i] = self.monthly[i];
        }
        (days, values)
    }

    /// Cubic Hermite interpolation between anchors, with
    /// centered-difference tangents. Exact at every anchor.
    fn interpolate(&self, x: f64) -> f64 {
        let (days, values) = self.anchors();

        let mut i = 0;
        while i + 2 < WRAPPED && days[i + 1] < x {
            i += 1;
        }

        let h = days[i + 1] - days[i];
        let t = (x - days[i]) / h;

        let m0 = (values[i + 1] - values[i - 1]) / (days[i + 1] - days[i - 1]);
        let m1 = (values[i + 2] - values[i]) / (days[i + 2] - days[i]);

        let t2 = t * t;
        let t3 = t2 * t;
        (2. * t3 - 3. * t2 + 1.) * values[i]
            + (t3 - 2. * t2 + t) * h * m0
            + (-2. * t3 + 3. * t2) * values[i + 1]
            + (t3 - t2) * h * m1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_at_mid_month_anchors() {
        let table = LinkeTable::default();
        // Jan 15, Feb 15, Dec 15.
        assert!((table.value_for_day(15).unwrap() - 2.9).abs() < 1e-9);
        assert!((table.value_for_day(46).unwrap() - 3.0).abs() < 1e-9);
        assert!((table.value_for_day(349).unwrap() - 3.1).abs() < 1e-9);
    }

    #[test]
    fn rejects_out_of_range_days() {
        let table = LinkeTable::default();
        assert!(table.value_for_day(0).is_err());
        assert!(table.value_for_day(366).is_err());
        assert!(table.value_for_day(1).is_ok());
        assert!(table.value_for_day(365).is_ok());
    }

    #[test]
    fn daily_matches_value_for_day() {
        let table = LinkeTable::default();
        let days: Vec<f64> = table.daily().collect();
        assert_eq!(days.len(), 365);
        assert_eq!(days[0], table.value_for_day(1).unwrap());
        assert_eq!(days[180], table.value_for_day(181).unwrap());
        assert_eq!(days[364], table.value_for_day(365).unwrap());
    }

    #[test]
    fn continuous_across_year_boundary() {
        let table = LinkeTable::default();
        let days: Vec<f64> = table.daily().collect();

        let max_intra_step = days
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .fold(0., f64::max);

        let wrap_step = (days[364] - days[0]).abs();
        assert!(
            wrap_step <= max_intra_step * 1.05 + 1e-9,
            "Dec-31 -> Jan-1 step {} exceeds intra-year max {}",
            wrap_step,
            max_intra_step
        );
    }

    #[test]
    fn values_stay_near_the_monthly_range() {
        let table = LinkeTable::default();
        for value in table.daily() {
            assert!(value > 2.0 && value < 4.0, "implausible turbidity {}", value);
        }
    }
}
