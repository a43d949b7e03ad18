//! Elevation tile discovery and virtual mosaicking.
//!
//! A [`TileSet`] resolves a file glob to the elevation
//! tiles of the area of interest. A [`VirtualMosaic`]
//! unions their extents into a single grid without copying
//! any cell data; [`VirtualMosaic::import`] materializes it
//! into a session raster and sets the session region to the
//! mosaic grid.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use gdal::Dataset;
use ndarray::{s, Array2};

use crate::geometry::{transform_from_gdal, PixelTransform, RasterDims};
use crate::session::{RasterHandle, Region, Session};
use crate::Result;

/// Tolerance when comparing tile resolutions.
const RES_TOL: f64 = 1e-6;

/// Elevation tiles resolved from a file glob. Matching zero
/// files is a configuration error.
pub struct TileSet {
    pattern: String,
    paths: Vec<PathBuf>,
}

impl TileSet {
    pub fn from_glob(pattern: &str) -> Result<TileSet> {
        let paths = glob::glob(pattern)
            .with_context(|| format!("invalid glob pattern `{}`", pattern))?;
        let mut paths = paths
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("resolving glob `{}`", pattern))?;
        paths.sort();

        if paths.is_empty() {
            bail!("no elevation tiles match `{}`", pattern);
        }
        Ok(TileSet {
            pattern: pattern.to_string(),
            paths,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

struct TilePlacement {
    path: PathBuf,
    /// Top-left world coordinates of the tile.
    origin: (f64, f64),
    dims: RasterDims,
    no_data: Option<f64>,
}

/// Union of a tile set's extents as a single lazy grid.
/// Holds per-tile placements only; cell data is read at
/// [`import`](VirtualMosaic::import) time.
pub struct VirtualMosaic {
    transform: PixelTransform,
    dims: RasterDims,
    projection: String,
    tiles: Vec<TilePlacement>,
}

impl VirtualMosaic {
    /// Open every tile, verify they share resolution and
    /// projection, and compute the union extent. Mixed
    /// resolutions or projections are a data error.
    pub fn build(tiles: &TileSet) -> Result<VirtualMosaic> {
        let mut res: Option<(f64, f64)> = None;
        let mut projection: Option<String> = None;
        let mut placements = Vec::with_capacity(tiles.len());

        let (mut min_x, mut max_x) = (f64::INFINITY, f64::NEG_INFINITY);
        let (mut min_y, mut max_y) = (f64::INFINITY, f64::NEG_INFINITY);

        for path in tiles.paths() {
            let ds = Dataset::open(path)
                .with_context(|| format!("opening elevation tile {}", path.display()))?;
            let gt = ds.geo_transform()?;
            if gt[2] != 0. || gt[4] != 0. {
                bail!("tile {} is not axis-aligned", path.display());
            }

            match res {
                None => res = Some((gt[1], gt[5])),
                Some((rx, ry)) => {
                    if (gt[1] - rx).abs() > RES_TOL || (gt[5] - ry).abs() > RES_TOL {
                        bail!(
                            "tile {} resolution ({}, {}) differs from ({}, {})",
                            path.display(),
                            gt[1],
                            gt[5],
                            rx,
                            ry
                        );
                    }
                }
            }

            let proj = ds.projection();
            match &projection {
                None => projection = Some(proj),
                Some(first) => {
                    if *first != proj {
                        bail!(
                            "tile {} projection differs from the first tile's",
                            path.display()
                        );
                    }
                }
            }

            let (w, h) = ds.raster_size();
            min_x = min_x.min(gt[0]);
            max_x = max_x.max(gt[0] + w as f64 * gt[1]);
            max_y = max_y.max(gt[3]);
            min_y = min_y.min(gt[3] + h as f64 * gt[5]);

            let no_data = ds.rasterband(1)?.no_data_value();
            placements.push(TilePlacement {
                path: path.clone(),
                origin: (gt[0], gt[3]),
                dims: (w, h),
                no_data,
            });
        }

        let (res_x, res_y) = res.expect("tile set is never empty");
        let dims = (
            ((max_x - min_x) / res_x).round() as usize,
            ((min_y - max_y) / res_y).round() as usize,
        );

        Ok(VirtualMosaic {
            transform: transform_from_gdal(&[min_x, res_x, 0., max_y, 0., res_y]),
            dims,
            projection: projection.expect("tile set is never empty"),
            tiles: placements,
        })
    }

    pub fn dims(&self) -> RasterDims {
        self.dims
    }

    /// World-coordinate bounds of the mosaic (the union of
    /// the tile extents).
    pub fn bounds(&self) -> geo::Rect<f64> {
        crate::geometry::world_bounds(&self.transform, self.dims)
    }

    /// Materialize the mosaic into the session under the
    /// given name, setting the session region to the mosaic
    /// grid. Nodata cells become NaN. Importing again under
    /// the same name overwrites the previous raster.
    pub fn import(&self, session: &mut Session, name: &str) -> Result<RasterHandle> {
        let (res_x, res_y) = (self.transform[(0, 0)], self.transform[(1, 1)]);
        let (origin_x, origin_y) = (self.transform[(0, 2)], self.transform[(1, 2)]);

        let mut grid = Array2::from_elem((self.dims.1, self.dims.0), f64::NAN);

        for tile in &self.tiles {
            session.checkpoint()?;

            let data = read_band_grid(&tile.path, tile.dims, tile.no_data)?;
            let col = ((tile.origin.0 - origin_x) / res_x).round() as usize;
            let row = ((tile.origin.1 - origin_y) / res_y).round() as usize;
            grid.slice_mut(s![row..row + tile.dims.1, col..col + tile.dims.0])
                .assign(&data);
        }

        session.set_region(Region {
            transform: self.transform,
            dims: self.dims,
            projection: self.projection.clone(),
        });
        session.add_raster(name, grid)
    }
}

/// Read the first band of a raster into an array, mapping
/// nodata to NaN.
fn read_band_grid(path: &Path, dims: RasterDims, no_data: Option<f64>) -> Result<Array2<f64>> {
    let ds = Dataset::open(path)
        .with_context(|| format!("reading elevation tile {}", path.display()))?;
    let buf = ds.rasterband(1)?.read_band_as::<f64>()?;
    let mut arr = Array2::from_shape_vec((dims.1, dims.0), buf.data)?;
    if let Some(nv) = no_data {
        arr.mapv_inplace(|v| if v == nv { f64::NAN } else { v });
    }
    Ok(arr)
}
