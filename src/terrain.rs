//! Terrain derivation from the elevation surface.
//!
//! Slope and aspect come from Horn's (1981) 3x3 kernel:
//!
//! ```text
//! a b c
//! d e f
//! g h i
//! ```
//!
//! dz/dx = ((c + 2f + i) - (a + 2d + g)) / (8 * cell width)
//! dz/dy = ((g + 2h + i) - (a + 2b + c)) / (8 * cell height)
//!
//! Slope is in degrees (0-90); aspect is a compass bearing
//! in degrees (0 = north, clockwise, in [0, 360)), NaN on
//! flat cells. Edge cells and cells with nodata in the
//! neighborhood are NaN in both outputs.

use ndarray::Array2;
use rayon::prelude::*;

use anyhow::bail;

use crate::session::{RasterHandle, Session};
use crate::Result;

/// Threshold below which a gradient is considered flat.
const FLAT_THRESHOLD: f64 = 1e-10;

/// Derive slope and aspect rasters from the elevation
/// raster. Deterministic; outputs are aligned to the input
/// grid and named `<input>_slope` / `<input>_aspect`.
pub fn slope_aspect(
    session: &mut Session,
    dsm: RasterHandle,
) -> Result<(RasterHandle, RasterHandle)> {
    session.checkpoint()?;

    let (cell_w, cell_h) = session.region()?.cell_size();
    let (eight_dx, eight_dy) = (8. * cell_w.abs(), 8. * cell_h.abs());

    let grid = session.raster(dsm)?;
    let (rows, cols) = grid.dim();

    let cells: Vec<(f64, f64)> = (0..rows)
        .into_par_iter()
        .flat_map(|row| {
            let mut row_data = vec![(f64::NAN, f64::NAN); cols];

            if row == 0 || row == rows - 1 {
                return row_data;
            }
            for col in 1..cols - 1 {
                let e = grid[(row, col)];
                if e.is_nan() {
                    continue;
                }

                let a = grid[(row - 1, col - 1)];
                let b = grid[(row - 1, col)];
                let c = grid[(row - 1, col + 1)];
                let d = grid[(row, col - 1)];
                let f = grid[(row, col + 1)];
                let g = grid[(row + 1, col - 1)];
                let h = grid[(row + 1, col)];
                let i = grid[(row + 1, col + 1)];

                if [a, b, c, d, f, g, h, i].iter().any(|v| v.is_nan()) {
                    continue;
                }

                let dz_dx = ((c + 2. * f + i) - (a + 2. * d + g)) / eight_dx;
                let dz_dy = ((g + 2. * h + i) - (a + 2. * b + c)) / eight_dy;

                let slope = (dz_dx * dz_dx + dz_dy * dz_dy).sqrt().atan().to_degrees();

                // Descent direction as a compass bearing.
                // Pixel rows grow southwards, so the north
                // component is +dz_dy.
                let aspect = if dz_dx.abs() < FLAT_THRESHOLD && dz_dy.abs() < FLAT_THRESHOLD {
                    f64::NAN
                } else {
                    let bearing = (-dz_dx).atan2(dz_dy).to_degrees();
                    if bearing < 0. {
                        bearing + 360.
                    } else {
                        bearing
                    }
                };

                row_data[col] = (slope, aspect);
            }
            row_data
        })
        .collect();

    session.checkpoint()?;

    let mut slope = Array2::from_elem((rows, cols), f64::NAN);
    let mut aspect = Array2::from_elem((rows, cols), f64::NAN);
    for row in 0..rows {
        for col in 0..cols {
            let (s, a) = cells[row * cols + col];
            slope[(row, col)] = s;
            aspect[(row, col)] = a;
        }
    }

    let base = session.raster_name(dsm)?.to_string();
    let slope_handle = session.add_raster(&format!("{}_slope", base), slope)?;
    let aspect_handle = session.add_raster(&format!("{}_aspect", base), aspect)?;
    Ok((slope_handle, aspect_handle))
}

/// Copy `input`, keeping only cells whose slope does not
/// exceed `max_slope_degrees`. The boundary is inclusive:
/// cells with slope equal to the threshold are retained.
/// Excluded cells (and cells with no slope value) become
/// NaN. The output is named `<input>_filtered`.
pub fn filter_by_slope(
    session: &mut Session,
    input: RasterHandle,
    slope: RasterHandle,
    max_slope_degrees: f64,
) -> Result<RasterHandle> {
    if !(0. ..=90.).contains(&max_slope_degrees) {
        bail!(
            "max slope must be within 0..90 degrees, got {}",
            max_slope_degrees
        );
    }
    session.checkpoint()?;

    let values = session.raster(input)?;
    let slopes = session.raster(slope)?;
    if values.dim() != slopes.dim() {
        bail!("slope raster shape does not match input raster shape");
    }

    let mut filtered = values.clone();
    for (out, &s) in filtered.iter_mut().zip(slopes.iter()) {
        if !(s <= max_slope_degrees) {
            *out = f64::NAN;
        }
    }

    let name = format!("{}_filtered", session.raster_name(input)?);
    session.add_raster(&name, filtered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::test_region;

    fn session_with_dsm(fill: impl Fn(usize, usize) -> f64) -> (Session, RasterHandle) {
        let mut session = Session::new();
        session.set_region(test_region());
        let grid = Array2::from_shape_fn((8, 10), |(r, c)| fill(r, c));
        let dsm = session.add_raster("dsm", grid).unwrap();
        (session, dsm)
    }

    #[test]
    fn flat_surface_has_zero_slope_and_no_aspect() {
        let (mut session, dsm) = session_with_dsm(|_, _| 100.);
        let (slope, aspect) = slope_aspect(&mut session, dsm).unwrap();

        assert!(session.raster(slope).unwrap()[(4, 5)].abs() < 1e-9);
        assert!(session.raster(aspect).unwrap()[(4, 5)].is_nan());
    }

    #[test]
    fn tilted_plane_has_uniform_slope() {
        let (mut session, dsm) = session_with_dsm(|r, c| (r + c) as f64);
        let (slope, _) = slope_aspect(&mut session, dsm).unwrap();

        let grid = session.raster(slope).unwrap();
        assert!((grid[(3, 3)] - grid[(5, 6)]).abs() < 1e-9);
        assert!(grid[(3, 3)] > 0.);
    }

    #[test]
    fn slope_in_range_aspect_in_range() {
        let (mut session, dsm) = session_with_dsm(|r, c| ((r * 31 + c * 17) % 7) as f64 * 3.);
        let (slope, aspect) = slope_aspect(&mut session, dsm).unwrap();

        for &s in session.raster(slope).unwrap() {
            if !s.is_nan() {
                assert!((0. ..=90.).contains(&s), "slope {} out of range", s);
            }
        }
        for &a in session.raster(aspect).unwrap() {
            if !a.is_nan() {
                assert!((0. ..360.).contains(&a), "aspect {} out of range", a);
            }
        }
    }

    #[test]
    fn east_facing_descent_has_east_aspect() {
        // Elevation decreasing eastward: descent bearing 90.
        let (mut session, dsm) = session_with_dsm(|_, c| -(c as f64));
        let (_, aspect) = slope_aspect(&mut session, dsm).unwrap();
        let a = session.raster(aspect).unwrap()[(4, 5)];
        assert!((a - 90.).abs() < 1e-6, "expected ~90, got {}", a);
    }

    #[test]
    fn north_facing_descent_has_north_aspect() {
        // Elevation increasing with row: lower to the north.
        let (mut session, dsm) = session_with_dsm(|r, _| r as f64);
        let (_, aspect) = slope_aspect(&mut session, dsm).unwrap();
        let a = session.raster(aspect).unwrap()[(4, 5)];
        assert!(a < 1e-6 || a > 360. - 1e-6, "expected ~0, got {}", a);
    }

    #[test]
    fn nodata_propagates_to_both_outputs() {
        let (mut session, dsm) = session_with_dsm(|r, c| {
            if (r, c) == (4, 4) {
                f64::NAN
            } else {
                (r + c) as f64
            }
        });
        let (slope, aspect) = slope_aspect(&mut session, dsm).unwrap();
        // The nodata cell and its neighbors are NaN.
        assert!(session.raster(slope).unwrap()[(4, 4)].is_nan());
        assert!(session.raster(slope).unwrap()[(4, 5)].is_nan());
        assert!(session.raster(aspect).unwrap()[(3, 3)].is_nan());
    }

    #[test]
    fn filter_boundary_is_inclusive() {
        let mut session = Session::new();
        session.set_region(test_region());

        let values = Array2::from_elem((8, 10), 10.);
        let slopes = Array2::from_shape_fn((8, 10), |(_, c)| c as f64 * 10.);
        let input = session.add_raster("vals", values).unwrap();
        let slope = session.add_raster("slope", slopes).unwrap();

        let filtered = filter_by_slope(&mut session, input, slope, 30.).unwrap();
        let grid = session.raster(filtered).unwrap();

        // Slope 30 at col 3 is exactly the threshold: kept.
        assert_eq!(grid[(0, 3)], 10.);
        // Slope 40 at col 4: excluded.
        assert!(grid[(0, 4)].is_nan());
    }

    #[test]
    fn filter_is_monotonic_in_threshold() {
        let mut session = Session::new();
        session.set_region(test_region());

        let values = Array2::from_elem((8, 10), 1.);
        let slopes = Array2::from_shape_fn((8, 10), |(r, c)| (r + c) as f64 * 4.);
        let input = session.add_raster("vals", values).unwrap();
        let slope = session.add_raster("slope", slopes).unwrap();

        let mut previous = usize::MAX;
        for &threshold in &[60., 45., 30., 15., 0.] {
            let filtered = filter_by_slope(&mut session, input, slope, threshold).unwrap();
            let kept = session
                .raster(filtered)
                .unwrap()
                .iter()
                .filter(|v| !v.is_nan())
                .count();
            assert!(kept <= previous, "threshold {} kept {} cells", threshold, kept);
            previous = kept;
        }
    }

    #[test]
    fn filter_rejects_bad_threshold() {
        let mut session = Session::new();
        session.set_region(test_region());
        let input = session.add_raster("vals", Array2::zeros((8, 10))).unwrap();
        let slope = session.add_raster("slope", Array2::zeros((8, 10))).unwrap();

        assert!(filter_by_slope(&mut session, input, slope, -1.).is_err());
        assert!(filter_by_slope(&mut session, input, slope, 90.5).is_err());
    }

    #[test]
    fn filter_masks_cells_without_slope() {
        let mut session = Session::new();
        session.set_region(test_region());

        let values = Array2::from_elem((8, 10), 7.);
        let mut slopes = Array2::zeros((8, 10));
        slopes[(2, 2)] = f64::NAN;
        let input = session.add_raster("vals", values).unwrap();
        let slope = session.add_raster("slope", slopes).unwrap();

        let filtered = filter_by_slope(&mut session, input, slope, 45.).unwrap();
        let grid = session.raster(filtered).unwrap();
        assert!(grid[(2, 2)].is_nan());
        assert_eq!(grid[(2, 3)], 7.);
    }
}
