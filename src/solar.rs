//! Clear-sky solar irradiance over the terrain.
//!
//! The model follows the r.sun family (Hofierka & Suri
//! 2002): for a key day it sweeps solar hour angles from
//! sunrise to sunset at a configurable step, attenuating
//! the beam with the Kasten (1996) Rayleigh optical depth
//! and the day's Linke turbidity, adding isotropic diffuse
//! scaled by the slope's sky-view factor and a
//! ground-reflected component. Output is Wh/m^2/day per
//! cell; zero is a valid value (permanently shaded cells).
//!
//! A full-year profile is approximated by computing a
//! raster per key day and interpolating linearly between
//! key days. A single key day is accepted: the period then
//! degenerates to that one day.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use anyhow::bail;
use ndarray::Array2;
use rayon::prelude::*;

use crate::linke::LinkeTable;
use crate::session::{RasterHandle, Session};
use crate::Result;

/// Solar constant in W/m^2.
pub const SOLAR_CONSTANT: f64 = 1367.0;

/// Ground albedo used for the reflected component.
const DEFAULT_ALBEDO: f64 = 0.2;

/// Diffuse fraction of global radiation under clear sky.
const DIFFUSE_PROPORTION: f64 = 0.3;

/// Parameters of the clear-sky radiation model.
#[derive(Debug, Clone)]
pub struct ClearSky {
    /// Latitude in degrees, negative south.
    pub latitude: f64,
    /// Intra-day sampling step in decimal hours.
    pub time_step: f64,
    pub solar_constant: f64,
    pub albedo: f64,
    pub linke: LinkeTable,
}

impl ClearSky {
    pub fn new(latitude: f64, time_step: f64) -> Result<ClearSky> {
        if !(-90. ..=90.).contains(&latitude) {
            bail!("latitude must be within -90..90 degrees, got {}", latitude);
        }
        if !(time_step > 0. && time_step <= 24.) {
            bail!("time step must be within (0, 24] hours, got {}", time_step);
        }
        Ok(ClearSky {
            latitude,
            time_step,
            solar_constant: SOLAR_CONSTANT,
            albedo: DEFAULT_ALBEDO,
            linke: LinkeTable::default(),
        })
    }

    /// Compute the irradiance raster for one day, stored as
    /// `<slope base>_solar_day<day>`. Slope and aspect are
    /// in degrees as produced by terrain derivation; cells
    /// without slope are NaN, flat cells (NaN aspect) are
    /// treated as horizontal.
    pub fn day_raster(
        &self,
        session: &mut Session,
        slope: RasterHandle,
        aspect: RasterHandle,
        day: u32,
    ) -> Result<RasterHandle> {
        session.checkpoint()?;
        let turbidity = self.linke.value_for_day(day)?;

        let slopes = session.raster(slope)?;
        let aspects = session.raster(aspect)?;
        if slopes.dim() != aspects.dim() {
            bail!("slope and aspect raster shapes differ");
        }
        let (rows, cols) = slopes.dim();

        let day_arc = DayArc::new(self.latitude, day);
        let sweep = self.sweep(&day_arc);
        // Daily global on flat terrain, for the reflected
        // component.
        let ghi_flat: f64 = sweep
            .iter()
            .map(|step| {
                let beam = self.beam_normal(step.air_mass, turbidity) * step.sin_alt;
                let diffuse = self.solar_constant * step.sin_alt * DIFFUSE_PROPORTION;
                (beam + diffuse) * self.time_step
            })
            .sum();

        let cells: Vec<f64> = (0..rows)
            .into_par_iter()
            .flat_map(|row| {
                let mut row_data = vec![f64::NAN; cols];
                for col in 0..cols {
                    let slope_deg = slopes[(row, col)];
                    if slope_deg.is_nan() {
                        continue;
                    }
                    let aspect_deg = aspects[(row, col)];

                    let slp = slope_deg.to_radians();
                    // Flat cells have no meaningful aspect.
                    let asp = if aspect_deg.is_nan() {
                        0.
                    } else {
                        aspect_deg.to_radians()
                    };

                    let mut beam_daily = 0.;
                    let mut diffuse_daily = 0.;
                    let svf = (1. + slp.cos()) / 2.;

                    for step in &sweep {
                        // Incidence on the tilted surface;
                        // negative means self-shadowed.
                        let cos_inc = step.sin_alt * slp.cos()
                            + step.altitude.cos() * slp.sin() * (step.azimuth - asp).cos();
                        if cos_inc > 0. {
                            beam_daily +=
                                self.beam_normal(step.air_mass, turbidity) * cos_inc * self.time_step;
                        }

                        let dhi = self.solar_constant * step.sin_alt * DIFFUSE_PROPORTION;
                        diffuse_daily += dhi * svf * self.time_step;
                    }

                    let reflected = self.albedo * ghi_flat * (1. - slp.cos()) / 2.;
                    row_data[col] = beam_daily + diffuse_daily + reflected;
                }
                row_data
            })
            .collect();

        session.checkpoint()?;
        let grid = Array2::from_shape_vec((rows, cols), cells)?;
        let name = format!("{}_solar_day{}", session.raster_name(slope)?, day);
        session.add_raster(&name, grid)
    }

    /// Compute one irradiance raster per key day. Key days
    /// must be within `1..=365`, unique and non-empty; a
    /// single key day is accepted.
    pub fn key_day_rasters(
        &self,
        session: &mut Session,
        slope: RasterHandle,
        aspect: RasterHandle,
        key_days: &[u32],
    ) -> Result<BTreeMap<u32, RasterHandle>> {
        validate_key_days(key_days)?;

        let mut rasters = BTreeMap::new();
        for &day in key_days {
            let handle = self.day_raster(session, slope, aspect, day)?;
            rasters.insert(day, handle);
        }
        Ok(rasters)
    }

    /// Kasten (1996) beam irradiance at normal incidence
    /// for a given relative air mass and Linke turbidity.
    fn beam_normal(&self, air_mass: f64, turbidity: f64) -> f64 {
        let m = air_mass;
        let rayleigh = 1.
            / (6.6296 + 1.7513 * m - 0.1202 * m.powi(2) + 0.0065 * m.powi(3)
                - 0.00013 * m.powi(4));
        self.solar_constant * (-0.8662 * turbidity * rayleigh * m).exp()
    }

    /// Sample the sun's path on one day from sunrise to
    /// sunset at the configured time step.
    fn sweep(&self, arc: &DayArc) -> Vec<SunStep> {
        let steps = ((arc.sunset - arc.sunrise) / self.time_step).ceil() as usize;
        let lat = self.latitude.to_radians();

        let mut sweep = Vec::with_capacity(steps + 1);
        for i in 0..=steps {
            let hour = arc.sunrise + i as f64 * self.time_step;
            if hour > arc.sunset {
                break;
            }
            let omega = (hour - 12.) * 15f64.to_radians();
            let sin_alt =
                lat.sin() * arc.declination.sin() + lat.cos() * arc.declination.cos() * omega.cos();
            if sin_alt <= 0. {
                continue;
            }
            let altitude = sin_alt.asin();

            let cos_az =
                (arc.declination.sin() - lat.sin() * sin_alt) / (lat.cos() * altitude.cos());
            let azimuth = if omega > 0. {
                2. * PI - cos_az.clamp(-1., 1.).acos()
            } else {
                cos_az.clamp(-1., 1.).acos()
            };

            let air_mass =
                1. / (sin_alt + 0.50572 * (altitude.to_degrees() + 6.07995).powf(-1.6364));

            sweep.push(SunStep {
                sin_alt,
                altitude,
                azimuth,
                air_mass,
            });
        }
        sweep
    }
}

/// Solar geometry fixed for one day: declination and the
/// sunrise/sunset hours on flat terrain.
struct DayArc {
    declination: f64,
    sunrise: f64,
    sunset: f64,
}

impl DayArc {
    fn new(latitude: f64, day: u32) -> DayArc {
        // Spencer (1971) declination.
        let gamma = 2. * PI * (day as f64 - 1.) / 365.;
        let declination = 0.006918 - 0.399912 * gamma.cos() + 0.070257 * gamma.sin()
            - 0.006758 * (2. * gamma).cos()
            + 0.000907 * (2. * gamma).sin()
            - 0.002697 * (3. * gamma).cos()
            + 0.00148 * (3. * gamma).sin();

        let lat = latitude.to_radians();
        let cos_omega_s = -(lat.tan() * declination.tan());
        let omega_s = if cos_omega_s < -1. {
            PI // polar day
        } else if cos_omega_s > 1. {
            0. // polar night
        } else {
            cos_omega_s.acos()
        };

        DayArc {
            declination,
            sunrise: 12. - omega_s.to_degrees() / 15.,
            sunset: 12. + omega_s.to_degrees() / 15.,
        }
    }
}

/// One sample of the sun's position during a day sweep.
struct SunStep {
    sin_alt: f64,
    altitude: f64,
    azimuth: f64,
    air_mass: f64,
}

fn validate_key_days(key_days: &[u32]) -> Result<()> {
    if key_days.is_empty() {
        bail!("at least one key day is required");
    }
    let mut seen = std::collections::BTreeSet::new();
    for &day in key_days {
        if day < 1 || day > 365 {
            bail!("key day must be within 1..365, got {}", day);
        }
        if !seen.insert(day) {
            bail!("duplicate key day {}", day);
        }
    }
    Ok(())
}

/// Irradiance for an arbitrary day, linearly interpolated
/// between the bracketing key-day rasters. Exact at key
/// days; days outside the key-day range are an error.
pub fn interpolate_day(
    session: &Session,
    key_rasters: &BTreeMap<u32, RasterHandle>,
    day: u32,
) -> Result<Array2<f64>> {
    if let Some(&handle) = key_rasters.get(&day) {
        return Ok(session.raster(handle)?.clone());
    }

    let below = key_rasters.range(..day).next_back();
    let above = key_rasters.range(day..).next();
    let ((d0, &h0), (d1, &h1)) = match (below, above) {
        (Some(b), Some(a)) => (b, a),
        _ => bail!(
            "day {} is outside the key-day range {}..{}",
            day,
            key_rasters.keys().next().unwrap_or(&0),
            key_rasters.keys().next_back().unwrap_or(&0)
        ),
    };

    let weight = (day - d0) as f64 / (d1 - d0) as f64;
    let lower = session.raster(h0)?;
    let upper = session.raster(h1)?;

    let mut grid = lower.clone();
    for (out, &hi) in grid.iter_mut().zip(upper.iter()) {
        *out = *out * (1. - weight) + hi * weight;
    }
    Ok(grid)
}

/// Sum of the daily irradiance over the whole key-day
/// period (`min..=max` of the key days), stored under the
/// given name. With a single key day the period is that one
/// day and the total equals its raster.
pub fn period_total(
    session: &mut Session,
    key_rasters: &BTreeMap<u32, RasterHandle>,
    name: &str,
) -> Result<RasterHandle> {
    let first = match key_rasters.keys().next() {
        Some(&d) => d,
        None => bail!("at least one key day is required"),
    };
    let last = *key_rasters.keys().next_back().unwrap();

    let mut total: Option<Array2<f64>> = None;
    for day in first..=last {
        session.checkpoint()?;
        let daily = interpolate_day(session, key_rasters, day)?;
        match &mut total {
            None => total = Some(daily),
            Some(acc) => {
                for (a, &d) in acc.iter_mut().zip(daily.iter()) {
                    *a += d;
                }
            }
        }
    }

    session.add_raster(name, total.expect("period contains at least one day"))
}

/// Normalize a day's irradiance to a 0-1 coefficient grid
/// by dividing by its maximum. A raster with no positive
/// cells cannot be normalized and is a data error.
pub fn percent_of_max(grid: &Array2<f64>) -> Result<Array2<f64>> {
    let max = grid.iter().cloned().fold(f64::NAN, f64::max);
    if !(max > 0.) {
        bail!("cannot normalize irradiance raster: no positive cells");
    }
    Ok(grid.mapv(|v| v / max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::test_region;

    fn session_with_terrain(slope_deg: f64, aspect_deg: f64) -> (Session, RasterHandle, RasterHandle) {
        let mut session = Session::new();
        session.set_region(test_region());
        let slope = session
            .add_raster("dsm_slope", Array2::from_elem((8, 10), slope_deg))
            .unwrap();
        let aspect = session
            .add_raster("dsm_aspect", Array2::from_elem((8, 10), aspect_deg))
            .unwrap();
        (session, slope, aspect)
    }

    #[test]
    fn flat_terrain_receives_radiation() {
        let (mut session, slope, aspect) = session_with_terrain(0., f64::NAN);
        let model = ClearSky::new(45., 1.).unwrap();
        let day = model.day_raster(&mut session, slope, aspect, 172).unwrap();
        let value = session.raster(day).unwrap()[(4, 4)];
        assert!(value > 0., "expected positive irradiance, got {}", value);
    }

    #[test]
    fn values_are_non_negative() {
        let (mut session, slope, aspect) = session_with_terrain(60., 0.);
        let model = ClearSky::new(45., 0.5).unwrap();
        let day = model.day_raster(&mut session, slope, aspect, 355).unwrap();
        for &v in session.raster(day).unwrap() {
            assert!(v >= 0., "negative irradiance {}", v);
        }
    }

    #[test]
    fn equator_facing_slope_gets_more_sun() {
        let model = ClearSky::new(45., 1.).unwrap();

        let (mut session, slope, aspect) = session_with_terrain(30., 180.);
        let south = model.day_raster(&mut session, slope, aspect, 80).unwrap();
        let south_value = session.raster(south).unwrap()[(4, 4)];

        let (mut session, slope, aspect) = session_with_terrain(30., 0.);
        let north = model.day_raster(&mut session, slope, aspect, 80).unwrap();
        let north_value = session.raster(north).unwrap()[(4, 4)];

        assert!(
            south_value > north_value,
            "south {} should exceed north {}",
            south_value,
            north_value
        );
    }

    #[test]
    fn winter_day_yields_less_than_summer_day() {
        let (mut session, slope, aspect) = session_with_terrain(0., f64::NAN);
        let model = ClearSky::new(45., 1.).unwrap();
        let summer = model.day_raster(&mut session, slope, aspect, 172).unwrap();
        let winter = model.day_raster(&mut session, slope, aspect, 355).unwrap();

        let s = session.raster(summer).unwrap()[(2, 2)];
        let w = session.raster(winter).unwrap()[(2, 2)];
        assert!(s > w, "summer {} should exceed winter {}", s, w);
    }

    #[test]
    fn nodata_slope_stays_nodata() {
        let mut session = Session::new();
        session.set_region(test_region());
        let mut slopes = Array2::from_elem((8, 10), 10.);
        slopes[(1, 1)] = f64::NAN;
        let slope = session.add_raster("dsm_slope", slopes).unwrap();
        let aspect = session
            .add_raster("dsm_aspect", Array2::from_elem((8, 10), 90.))
            .unwrap();

        let model = ClearSky::new(45., 1.).unwrap();
        let day = model.day_raster(&mut session, slope, aspect, 100).unwrap();
        assert!(session.raster(day).unwrap()[(1, 1)].is_nan());
        assert!(!session.raster(day).unwrap()[(1, 2)].is_nan());
    }

    #[test]
    fn key_day_validation() {
        assert!(validate_key_days(&[]).is_err());
        assert!(validate_key_days(&[0]).is_err());
        assert!(validate_key_days(&[366]).is_err());
        assert!(validate_key_days(&[5, 5]).is_err());
        assert!(validate_key_days(&[5]).is_ok());
        assert!(validate_key_days(&[1, 182, 365]).is_ok());
    }

    #[test]
    fn midpoint_interpolates_between_key_days() {
        let (mut session, slope, aspect) = session_with_terrain(0., f64::NAN);
        let model = ClearSky::new(-37.7, 1.).unwrap();
        let rasters = model
            .key_day_rasters(&mut session, slope, aspect, &[1, 182])
            .unwrap();

        let first = session.raster(rasters[&1]).unwrap()[(4, 4)];
        let last = session.raster(rasters[&182]).unwrap()[(4, 4)];
        let mid = interpolate_day(&session, &rasters, 91).unwrap()[(4, 4)];

        let (lo, hi) = (first.min(last), first.max(last));
        assert!(
            mid >= lo && mid <= hi,
            "day 91 value {} outside [{}, {}]",
            mid,
            lo,
            hi
        );
    }

    #[test]
    fn interpolation_is_exact_at_key_days() {
        let (mut session, slope, aspect) = session_with_terrain(0., f64::NAN);
        let model = ClearSky::new(-37.7, 1.).unwrap();
        let rasters = model
            .key_day_rasters(&mut session, slope, aspect, &[10, 40])
            .unwrap();

        let exact = session.raster(rasters[&10]).unwrap()[(3, 3)];
        let interp = interpolate_day(&session, &rasters, 10).unwrap()[(3, 3)];
        assert_eq!(exact, interp);
    }

    #[test]
    fn day_outside_range_is_an_error() {
        let (mut session, slope, aspect) = session_with_terrain(0., f64::NAN);
        let model = ClearSky::new(-37.7, 1.).unwrap();
        let rasters = model
            .key_day_rasters(&mut session, slope, aspect, &[100, 120])
            .unwrap();

        assert!(interpolate_day(&session, &rasters, 99).is_err());
        assert!(interpolate_day(&session, &rasters, 121).is_err());
    }

    #[test]
    fn single_key_day_degenerates_to_that_day() {
        let (mut session, slope, aspect) = session_with_terrain(0., f64::NAN);
        let model = ClearSky::new(-37.7, 1.).unwrap();
        let rasters = model
            .key_day_rasters(&mut session, slope, aspect, &[50])
            .unwrap();

        let total = period_total(&mut session, &rasters, "total").unwrap();
        let day_value = session.raster(rasters[&50]).unwrap()[(4, 4)];
        let total_value = session.raster(total).unwrap()[(4, 4)];
        assert_eq!(day_value, total_value);
    }

    #[test]
    fn period_total_sums_each_day_once() {
        let (mut session, slope, aspect) = session_with_terrain(0., f64::NAN);
        let model = ClearSky::new(-37.7, 1.).unwrap();
        let rasters = model
            .key_day_rasters(&mut session, slope, aspect, &[60, 62])
            .unwrap();

        let total = period_total(&mut session, &rasters, "total").unwrap();
        let expected: f64 = (60..=62)
            .map(|d| interpolate_day(&session, &rasters, d).unwrap()[(4, 4)])
            .sum();
        let got = session.raster(total).unwrap()[(4, 4)];
        assert!((got - expected).abs() < 1e-9);
    }

    #[test]
    fn percent_of_max_peaks_at_one() {
        let grid = Array2::from_shape_fn((4, 4), |(r, c)| (r * 4 + c) as f64);
        let coeff = percent_of_max(&grid).unwrap();
        assert_eq!(coeff[(3, 3)], 1.);
        assert!(coeff.iter().all(|&v| v <= 1.));
    }

    #[test]
    fn percent_of_max_rejects_empty_raster() {
        let zeros = Array2::zeros((4, 4));
        assert!(percent_of_max(&zeros).is_err());
        let nans = Array2::from_elem((4, 4), f64::NAN);
        assert!(percent_of_max(&nans).is_err());
    }
}
