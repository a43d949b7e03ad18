//! The processing session.
//!
//! A [`Session`] is the single mutable resource of a
//! pipeline run. It owns the computational [`Region`] (grid
//! geometry and projection) and every raster derived during
//! the run, addressed through typed [`RasterHandle`] values
//! returned at creation. Building sets loaded from vector
//! data are stored the same way under [`VectorHandle`]s.
//!
//! Long-running operations call [`Session::checkpoint`]
//! between units of work; cancelling the session's
//! [`CancelToken`] (directly, or through a [`Deadline`]
//! watchdog) makes the next checkpoint fail, halting the
//! run without emitting partial rasters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use nalgebra::Point2;
use ndarray::Array2;

use crate::buildings::BuildingSet;
use crate::geometry::{cell_area, cell_size, world_bounds, PixelTransform, RasterDims};
use crate::Result;

/// The computational region: grid geometry shared by every
/// raster of a run.
#[derive(Debug, Clone)]
pub struct Region {
    /// Pixel-to-world affine transform.
    pub transform: PixelTransform,
    /// Grid dimensions `(cols, rows)`.
    pub dims: RasterDims,
    /// Projection (WKT or any definition GDAL accepts).
    pub projection: String,
}

impl Region {
    /// Array shape `(rows, cols)` of grids on this region.
    pub fn shape(&self) -> (usize, usize) {
        (self.dims.1, self.dims.0)
    }

    pub fn cell_size(&self) -> (f64, f64) {
        cell_size(&self.transform)
    }

    /// Area of one cell in square world units.
    pub fn cell_area(&self) -> f64 {
        cell_area(&self.transform)
    }

    /// World-coordinate bounds of the region.
    pub fn bounds(&self) -> geo::Rect<f64> {
        world_bounds(&self.transform, self.dims)
    }

    /// Geographic latitude of the region centre, in
    /// degrees. Reprojects the centre to EPSG:4326; fails
    /// when the region carries no projection.
    pub fn latitude(&self) -> Result<f64> {
        if self.projection.is_empty() {
            bail!("region has no projection; supply a latitude explicitly");
        }
        let centre = self.transform.transform_point(&Point2::new(
            self.dims.0 as f64 / 2.,
            self.dims.1 as f64 / 2.,
        ));

        let mut src = SpatialRef::from_definition(&self.projection)?;
        let mut dst = SpatialRef::from_epsg(4326)?;
        src.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
        dst.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);

        let transform = CoordTransform::new(&src, &dst)?;
        let mut xs = [centre.x];
        let mut ys = [centre.y];
        let mut zs = [0.];
        transform.transform_coords(&mut xs, &mut ys, &mut zs)?;
        Ok(ys[0])
    }
}

/// Typed handle to a raster owned by a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RasterHandle(usize);

/// Typed handle to a building set owned by a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VectorHandle(usize);

struct NamedRaster {
    name: String,
    grid: Array2<f64>,
}

/// Shared cancellation flag checked by long-running
/// operations at their checkpoints.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Watchdog that cancels a [`CancelToken`] after a timeout
/// unless dropped first. Dropping it disarms the watchdog.
pub struct Deadline {
    armed: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Deadline {
    pub fn watch(token: CancelToken, timeout: Duration) -> Self {
        let armed = Arc::new(AtomicBool::new(true));
        let watcher = armed.clone();
        let handle = std::thread::spawn(move || {
            let deadline = Instant::now() + timeout;
            loop {
                if !watcher.load(Ordering::Acquire) {
                    return;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                std::thread::park_timeout(deadline - now);
            }
            if watcher.load(Ordering::Acquire) {
                token.cancel();
            }
        });
        Deadline {
            armed,
            handle: Some(handle),
        }
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.armed.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

/// Working state of one pipeline run.
#[derive(Default)]
pub struct Session {
    region: Option<Region>,
    rasters: Vec<Option<NamedRaster>>,
    buildings: Vec<BuildingSet>,
    cancel: CancelToken,
}

impl Session {
    pub fn new() -> Self {
        Default::default()
    }

    /// Set the computational region. Any rasters added
    /// afterwards must match its shape.
    pub fn set_region(&mut self, region: Region) {
        self.region = Some(region);
    }

    pub fn region(&self) -> Result<&Region> {
        self.region
            .as_ref()
            .ok_or_else(|| anyhow!("session region is not set"))
    }

    /// Add a raster under a name, returning its handle.
    /// Re-adding under an existing name overwrites that
    /// raster in place and returns the original handle.
    pub fn add_raster(&mut self, name: &str, grid: Array2<f64>) -> Result<RasterHandle> {
        let region = self.region()?;
        if grid.dim() != region.shape() {
            bail!(
                "raster `{}` shape {:?} does not match region shape {:?}",
                name,
                grid.dim(),
                region.shape()
            );
        }

        for (i, slot) in self.rasters.iter_mut().enumerate() {
            if let Some(existing) = slot {
                if existing.name == name {
                    existing.grid = grid;
                    return Ok(RasterHandle(i));
                }
            }
        }

        self.rasters.push(Some(NamedRaster {
            name: name.to_string(),
            grid,
        }));
        Ok(RasterHandle(self.rasters.len() - 1))
    }

    fn slot(&self, handle: RasterHandle) -> Result<&NamedRaster> {
        self.rasters
            .get(handle.0)
            .and_then(|s| s.as_ref())
            .ok_or_else(|| anyhow!("raster handle is no longer valid"))
    }

    pub fn raster(&self, handle: RasterHandle) -> Result<&Array2<f64>> {
        Ok(&self.slot(handle)?.grid)
    }

    pub fn raster_mut(&mut self, handle: RasterHandle) -> Result<&mut Array2<f64>> {
        Ok(&mut self
            .rasters
            .get_mut(handle.0)
            .and_then(|s| s.as_mut())
            .ok_or_else(|| anyhow!("raster handle is no longer valid"))?
            .grid)
    }

    /// Diagnostic name the raster was created under.
    pub fn raster_name(&self, handle: RasterHandle) -> Result<&str> {
        Ok(&self.slot(handle)?.name)
    }

    /// Drop a raster, freeing its memory. The handle
    /// becomes invalid.
    pub fn remove_raster(&mut self, handle: RasterHandle) -> Result<()> {
        let slot = self
            .rasters
            .get_mut(handle.0)
            .ok_or_else(|| anyhow!("raster handle is no longer valid"))?;
        if slot.take().is_none() {
            bail!("raster handle is no longer valid");
        }
        Ok(())
    }

    pub fn add_buildings(&mut self, set: BuildingSet) -> VectorHandle {
        self.buildings.push(set);
        VectorHandle(self.buildings.len() - 1)
    }

    pub fn buildings(&self, handle: VectorHandle) -> Result<&BuildingSet> {
        self.buildings
            .get(handle.0)
            .ok_or_else(|| anyhow!("vector handle is no longer valid"))
    }

    /// Token shared with [`Deadline`] watchdogs or other
    /// threads to request cancellation.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Fails once the session has been cancelled. Called by
    /// operations between units of work so a cancelled or
    /// timed-out run halts instead of producing partial
    /// output.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            bail!("operation interrupted: session cancelled or step timed out");
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::geometry::transform_from_gdal;

    /// A 10x8 metre-resolution region without projection,
    /// shared by unit tests across the crate.
    pub(crate) fn test_region() -> Region {
        Region {
            transform: transform_from_gdal(&[0., 1., 0., 8., 0., -1.]),
            dims: (10, 8),
            projection: String::new(),
        }
    }

    #[test]
    fn raster_must_match_region() {
        let mut session = Session::new();
        session.set_region(test_region());

        let bad = Array2::zeros((3, 3));
        assert!(session.add_raster("bad", bad).is_err());

        let good = Array2::zeros((8, 10));
        assert!(session.add_raster("good", good).is_ok());
    }

    #[test]
    fn same_name_overwrites() {
        let mut session = Session::new();
        session.set_region(test_region());

        let a = session.add_raster("dsm", Array2::zeros((8, 10))).unwrap();
        let b = session
            .add_raster("dsm", Array2::from_elem((8, 10), 5.))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(session.raster(a).unwrap()[(0, 0)], 5.);
    }

    #[test]
    fn removed_handle_is_invalid() {
        let mut session = Session::new();
        session.set_region(test_region());

        let h = session.add_raster("tmp", Array2::zeros((8, 10))).unwrap();
        session.remove_raster(h).unwrap();
        assert!(session.raster(h).is_err());
        assert!(session.remove_raster(h).is_err());
    }

    #[test]
    fn checkpoint_fails_after_cancel() {
        let session = Session::new();
        assert!(session.checkpoint().is_ok());
        session.cancel_token().cancel();
        assert!(session.checkpoint().is_err());
    }

    #[test]
    fn deadline_cancels_after_timeout() {
        let token = CancelToken::default();
        let deadline = Deadline::watch(token.clone(), Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(100));
        assert!(token.is_cancelled());
        drop(deadline);
    }

    #[test]
    fn dropped_deadline_never_fires() {
        let token = CancelToken::default();
        let deadline = Deadline::watch(token.clone(), Duration::from_millis(50));
        drop(deadline);
        std::thread::sleep(Duration::from_millis(100));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn region_without_projection_has_no_latitude() {
        assert!(test_region().latitude().is_err());
    }
}
