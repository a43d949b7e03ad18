//! Per-building irradiance statistics.
//!
//! Aggregation is a single pass over the zone grid and the
//! value raster: each building accumulates the count, sum,
//! min and max of its valid cells. Every building yields a
//! record; a building with no valid cells gets the sentinel
//! values (undefined mean, zero usable area) rather than
//! being dropped.

use serde_derive::Serialize;
use std::ops::AddAssign;

use anyhow::bail;
use geo::algorithm::area::Area;
use ndarray::Array2;

use crate::session::{RasterHandle, Session, VectorHandle};
use crate::Result;

/// Statistics accumulated from the cells of one zone.
/// Accumulate by add-assigning (`+=`) either an `f64`
/// sample or another `CellStats`.
#[derive(Debug, Clone, Serialize)]
pub struct CellStats {
    count: usize,
    sum: f64,
    min: f64,
    max: f64,
}

impl Default for CellStats {
    fn default() -> Self {
        CellStats {
            count: 0,
            sum: 0.,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl AddAssign<f64> for CellStats {
    fn add_assign(&mut self, sample: f64) {
        self.count += 1;
        self.sum += sample;
        self.min = self.min.min(sample);
        self.max = self.max.max(sample);
    }
}

impl AddAssign<&CellStats> for CellStats {
    fn add_assign(&mut self, other: &CellStats) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

impl CellStats {
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn sum(&self) -> f64 {
        self.sum
    }

    #[inline]
    pub fn min(&self) -> f64 {
        self.min
    }

    #[inline]
    pub fn max(&self) -> f64 {
        self.max
    }

    /// Mean of the samples; `None` when nothing was
    /// accumulated.
    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

/// One output row per building.
#[derive(Debug, Clone, Serialize)]
pub struct BuildingRecord {
    pub fid: u64,
    /// Count of valid irradiance cells on the roof.
    pub cells: usize,
    /// Total irradiance over the period, Wh.
    pub roof_sum_wh: f64,
    pub roof_kwh: f64,
    pub roof_mwh: f64,
    /// Mean per-cell irradiance; `None` when the building
    /// has no valid cells.
    pub roof_mean_wh: Option<f64>,
    /// Suitable roof area: valid cells times cell area.
    pub usable_sqm: f64,
    /// Footprint area from the geometry.
    pub area_sqm: f64,
    /// Weather-adjusted total, MWh, when a weather raster
    /// was supplied.
    pub weather_mwh: Option<f64>,
    /// `(clear - weather) / clear * 100`, when both totals
    /// are available and the clear-sky total is positive.
    pub percent_loss: Option<f64>,
}

/// Aggregate per-building statistics by intersecting the
/// zone grid with the value raster (and optionally a
/// weather-adjusted raster on the same grid).
pub fn aggregate(
    session: &Session,
    buildings: VectorHandle,
    zones: &Array2<u32>,
    clear_sky: RasterHandle,
    weather: Option<RasterHandle>,
) -> Result<Vec<BuildingRecord>> {
    let set = session.buildings(buildings)?;
    let values = session.raster(clear_sky)?;
    if values.dim() != zones.dim() {
        bail!("zone grid shape does not match raster shape");
    }
    let weather_values = match weather {
        Some(handle) => {
            let grid = session.raster(handle)?;
            if grid.dim() != zones.dim() {
                bail!("weather raster shape does not match zone grid shape");
            }
            Some(grid)
        }
        None => None,
    };

    let mut clear_stats = vec![CellStats::default(); set.len()];
    let mut weather_stats = vec![CellStats::default(); set.len()];

    let (rows, cols) = zones.dim();
    for row in 0..rows {
        for col in 0..cols {
            let zone = zones[(row, col)];
            if zone == 0 {
                continue;
            }
            let building = (zone - 1) as usize;
            if building >= set.len() {
                bail!("zone grid references building {} beyond the set", zone);
            }

            let value = values[(row, col)];
            if !value.is_nan() {
                clear_stats[building] += value;
            }
            if let Some(grid) = weather_values {
                let w = grid[(row, col)];
                if !w.is_nan() {
                    weather_stats[building] += w;
                }
            }
        }
    }

    let cell_area = session.region()?.cell_area();

    let records = set
        .buildings
        .iter()
        .zip(clear_stats.iter().zip(weather_stats.iter()))
        .map(|(building, (clear, wx))| {
            let weather_mwh = match (weather_values.is_some(), wx.count()) {
                (true, c) if c > 0 => Some(wx.sum() / 1e6),
                (true, _) => Some(0.),
                (false, _) => None,
            };
            let percent_loss = weather_mwh.and_then(|w_mwh| {
                if clear.sum() > 0. {
                    Some((clear.sum() - w_mwh * 1e6) / clear.sum() * 100.)
                } else {
                    None
                }
            });

            BuildingRecord {
                fid: building.fid,
                cells: clear.count(),
                roof_sum_wh: clear.sum(),
                roof_kwh: clear.sum() / 1e3,
                roof_mwh: clear.sum() / 1e6,
                roof_mean_wh: clear.mean(),
                usable_sqm: clear.count() as f64 * cell_area,
                area_sqm: building.footprint.unsigned_area(),
                weather_mwh,
                percent_loss,
            }
        })
        .collect();

    Ok(records)
}
