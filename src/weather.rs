//! Adjustment of clear-sky irradiance by historical
//! weather.
//!
//! A weather grid is a day-banded raster (typically the
//! shortwave-down variable of a NetCDF weather-model
//! export) in its own, usually geographic, CRS at a much
//! coarser resolution than the elevation grid. Each day's
//! field is resampled onto the session region by
//! transforming every cell centre into the weather CRS and
//! sampling bilinearly; a run whose region does not overlap
//! the weather grid fails with a diagnostic rather than
//! producing an all-empty field.
//!
//! The adjusted total multiplies each day's resampled field
//! with the day's percent-of-max clear-sky coefficient (so
//! roof geometry and shading survive the substitution) and
//! sums over the key-day period.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, bail, Context};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use gdal::{Dataset, Metadata};
use nalgebra::Point2;
use ndarray::Array2;

use crate::geometry::{transform_from_dataset, PixelTransform, RasterDims};
use crate::session::{RasterHandle, Region, Session};
use crate::solar::{interpolate_day, percent_of_max};
use crate::Result;

/// Band metadata key the GDAL NetCDF driver uses for the
/// day-of-year dimension value.
const DAY_METADATA_KEY: &str = "NETCDF_DIM_dayofyear";

/// A day-banded weather grid held in memory.
pub struct WeatherGrid {
    transform: PixelTransform,
    inverse: PixelTransform,
    dims: RasterDims,
    /// CRS the grid coordinates are in.
    crs: String,
    bands: BTreeMap<u32, Array2<f64>>,
}

impl WeatherGrid {
    /// Open a weather dataset and read every day band. The
    /// day of year is taken from the band's NetCDF
    /// dimension metadata when present, else from the band
    /// index.
    pub fn open(path: &Path, source_crs: &str) -> Result<WeatherGrid> {
        let ds = Dataset::open(path)
            .with_context(|| format!("opening weather dataset {}", path.display()))?;
        let transform = transform_from_dataset(&ds)?;
        let inverse = transform
            .try_inverse()
            .ok_or_else(|| anyhow!("weather dataset has a degenerate geo transform"))?;

        let (cols, rows) = ds.raster_size();
        let count = ds.raster_count();
        if count < 1 {
            bail!("weather dataset {} has no bands", path.display());
        }

        let mut bands = BTreeMap::new();
        for index in 1..=count {
            let band = ds.rasterband(index)?;
            let day = band
                .metadata_item(DAY_METADATA_KEY, "")
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(index as u32);

            let no_data = band.no_data_value();
            let buf = band.read_band_as::<f64>()?;
            let mut grid = Array2::from_shape_vec((rows, cols), buf.data)?;
            if let Some(nv) = no_data {
                grid.mapv_inplace(|v| if v == nv { f64::NAN } else { v });
            }
            bands.insert(day, grid);
        }

        Ok(WeatherGrid {
            transform,
            inverse,
            dims: (cols, rows),
            crs: source_crs.to_string(),
            bands,
        })
    }

    /// Days of year present in the grid, ascending.
    pub fn days(&self) -> Vec<u32> {
        self.bands.keys().cloned().collect()
    }

    /// Resample one day's field onto the region grid. Every
    /// region cell centre is transformed into the weather
    /// CRS and sampled bilinearly; cells falling outside
    /// the weather grid become NaN. Fails when no cell
    /// lands inside the weather grid at all.
    pub fn resample_day(&self, day: u32, region: &Region, target_crs: &str) -> Result<Array2<f64>> {
        let band = self
            .bands
            .get(&day)
            .ok_or_else(|| anyhow!("weather dataset has no band for day {}", day))?;

        let (cols, rows) = region.dims;

        // World coordinates of every region cell centre.
        let mut xs = Vec::with_capacity(cols * rows);
        let mut ys = Vec::with_capacity(cols * rows);
        for row in 0..rows {
            for col in 0..cols {
                let pt = region
                    .transform
                    .transform_point(&Point2::new(col as f64 + 0.5, row as f64 + 0.5));
                xs.push(pt.x);
                ys.push(pt.y);
            }
        }

        if target_crs.trim() != self.crs.trim() {
            let mut src = SpatialRef::from_definition(target_crs)?;
            let mut dst = SpatialRef::from_definition(&self.crs)?;
            src.set_axis_mapping_strategy(
                gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER,
            );
            dst.set_axis_mapping_strategy(
                gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER,
            );
            let transform = CoordTransform::new(&src, &dst)?;
            let mut zs = vec![0.; xs.len()];
            transform.transform_coords(&mut xs, &mut ys, &mut zs)?;
        }

        let mut grid = Array2::from_elem((rows, cols), f64::NAN);
        let mut hits = 0usize;
        for row in 0..rows {
            for col in 0..cols {
                let i = row * cols + col;
                let px = self
                    .inverse
                    .transform_point(&Point2::new(xs[i], ys[i]));
                if let Some(v) = bilinear(band, self.dims, px.x, px.y) {
                    grid[(row, col)] = v;
                    hits += 1;
                }
            }
        }

        if hits == 0 {
            bail!(
                "weather dataset does not overlap the region (weather CRS {}, region CRS {})",
                self.crs,
                target_crs
            );
        }
        Ok(grid)
    }
}

/// Bilinear sample at fractional pixel coordinates,
/// measuring values at cell centres. `None` outside the
/// grid.
fn bilinear(grid: &Array2<f64>, dims: RasterDims, px: f64, py: f64) -> Option<f64> {
    let (cols, rows) = dims;
    if px < 0. || py < 0. || px > cols as f64 || py > rows as f64 {
        return None;
    }

    let gx = (px - 0.5).max(0.).min(cols as f64 - 1.);
    let gy = (py - 0.5).max(0.).min(rows as f64 - 1.);

    let x0 = gx.floor() as usize;
    let y0 = gy.floor() as usize;
    let x1 = (x0 + 1).min(cols - 1);
    let y1 = (y0 + 1).min(rows - 1);
    let fx = gx - x0 as f64;
    let fy = gy - y0 as f64;

    let v00 = grid[(y0, x0)];
    let v01 = grid[(y0, x1)];
    let v10 = grid[(y1, x0)];
    let v11 = grid[(y1, x1)];
    if v00.is_nan() || v01.is_nan() || v10.is_nan() || v11.is_nan() {
        return None;
    }

    let top = v00 * (1. - fx) + v01 * fx;
    let bottom = v10 * (1. - fx) + v11 * fx;
    Some(top * (1. - fy) + bottom * fy)
}

/// Sum of the weather fields over the key-day period, each
/// day scaled by the clear-sky percent-of-max coefficient.
/// Weather days outside the key-day range are skipped with
/// a warning; at least one day must be usable.
pub fn adjusted_total(
    session: &mut Session,
    weather: &WeatherGrid,
    key_rasters: &BTreeMap<u32, RasterHandle>,
    target_crs: &str,
    name: &str,
) -> Result<RasterHandle> {
    let first = match key_rasters.keys().next() {
        Some(&d) => d,
        None => bail!("at least one key day is required"),
    };
    let last = *key_rasters.keys().next_back().unwrap();

    let region = session.region()?.clone();
    let mut total: Option<Array2<f64>> = None;

    for day in weather.days() {
        session.checkpoint()?;
        if day < first || day > last {
            log::warn!(
                "no clear-sky coefficient for weather day {} (period {}..{}), skipping",
                day,
                first,
                last
            );
            continue;
        }

        let coefficient = percent_of_max(&interpolate_day(session, key_rasters, day)?)?;
        let field = weather.resample_day(day, &region, target_crs)?;

        match &mut total {
            None => {
                let mut acc = field;
                for (a, &c) in acc.iter_mut().zip(coefficient.iter()) {
                    *a *= c;
                }
                total = Some(acc);
            }
            Some(acc) => {
                for ((a, &f), &c) in acc.iter_mut().zip(field.iter()).zip(coefficient.iter()) {
                    *a += f * c;
                }
            }
        }
    }

    let total = total.ok_or_else(|| {
        anyhow!(
            "weather dataset has no days within the key-day period {}..{}",
            first,
            last
        )
    })?;
    session.add_raster(name, total)
}
