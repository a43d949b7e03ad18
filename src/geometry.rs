//! Pixel and world geometry of rasters.
//!
//! A raster grid is addressed two ways: by integer pixel
//! indices, and by world coordinates in the projection of
//! the dataset. The two are related by an affine transform
//! (GDAL's 6-element geo-transform), represented here as a
//! 3x3 matrix so transforms can be composed and inverted.

use gdal::Dataset;
use geo::Rect;
use nalgebra::{Matrix3, Point2};

use anyhow::anyhow;

use crate::Result;

/// Affine transform mapping pixel coordinates `(col, row)`
/// to world coordinates `(x, y)` (or between pixel spaces
/// of two rasters).
pub type PixelTransform = Matrix3<f64>;

/// Dimensions of a raster: `(cols, rows)`.
pub type RasterDims = (usize, usize);

/// Offset into a raster: `(col, row)`.
pub type RasterOffset = (isize, isize);

/// A window into a raster: offset and size.
pub type RasterWindow = (RasterOffset, RasterDims);

/// Convert GDAL's 6-element geo-transform into a
/// [`PixelTransform`].
pub fn transform_from_gdal(t: &[f64; 6]) -> PixelTransform {
    Matrix3::new(
        t[1], t[2], t[0], //
        t[4], t[5], t[3], //
        0., 0., 1.,
    )
}

/// Convert a [`PixelTransform`] back to GDAL's 6-element
/// form. Inverse of [`transform_from_gdal`]; the round trip
/// is exact.
pub fn transform_to_gdal(t: &PixelTransform) -> [f64; 6] {
    [
        t[(0, 2)],
        t[(0, 0)],
        t[(0, 1)],
        t[(1, 2)],
        t[(1, 0)],
        t[(1, 1)],
    ]
}

/// Read the pixel-to-world transform of a dataset.
pub fn transform_from_dataset(ds: &Dataset) -> Result<PixelTransform> {
    Ok(transform_from_gdal(&ds.geo_transform()?))
}

/// Compute the affine transform from pixel coordinates of
/// one grid to pixel coordinates of another.
pub fn transform_between(t1: &PixelTransform, t2: &PixelTransform) -> Result<PixelTransform> {
    t2.try_inverse()
        .ok_or_else(|| anyhow!("couldn't invert geo transform"))
        .map(|inv| inv * t1)
}

/// Size of a pixel along each axis: `(width, height)`.
/// Height is negative for north-up rasters.
pub fn cell_size(t: &PixelTransform) -> (f64, f64) {
    (t[(0, 0)], t[(1, 1)])
}

/// Area of a pixel in world units (absolute value of the
/// determinant of the linear part).
pub fn cell_area(t: &PixelTransform) -> f64 {
    (t[(0, 0)] * t[(1, 1)] - t[(0, 1)] * t[(1, 0)]).abs()
}

/// World-coordinate bounds of a grid with the given
/// transform and dimensions.
pub fn world_bounds(t: &PixelTransform, dims: RasterDims) -> Rect<f64> {
    let lt = t.transform_point(&Point2::new(0., 0.));
    let rb = t.transform_point(&Point2::new(dims.0 as f64, dims.1 as f64));
    Rect::new((lt.x, lt.y), (rb.x, rb.y))
}

/// Conversion from world-coordinate bounds to raster
/// windows.
pub trait BoundsExt {
    /// Compute the pixel window covering these bounds,
    /// truncated to the given raster dimensions.
    fn window_from_bounds(&self, dims: RasterDims) -> RasterWindow;
}

impl BoundsExt for Rect<f64> {
    fn window_from_bounds(&self, dims: RasterDims) -> RasterWindow {
        let left = (self.min().x.floor().max(0.)) as isize;
        let top = (self.min().y.floor().max(0.)) as isize;

        let right = (self.max().x.ceil() as isize).max(left).min(dims.0 as isize);
        let bottom = (self.max().y.ceil() as isize).max(top).min(dims.1 as isize);

        (
            (left, top),
            ((right - left).max(0) as usize, (bottom - top).max(0) as usize),
        )
    }
}
