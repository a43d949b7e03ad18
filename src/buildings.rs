//! Building footprints: vector ingestion and masking.
//!
//! Footprints are read from any vector dataset GDAL can
//! open. A named layer is required; asking for a layer the
//! dataset does not have is a configuration error that
//! lists the layers it does have. Footprints are rasterized
//! into a zone grid aligned to the session region, where
//! each cell holds the ordinal (plus one) of the building
//! covering its centre, or zero outside buildings.

use std::path::Path;

use anyhow::{anyhow, bail, Context};
use gdal::vector::LayerAccess;
use gdal::Dataset;
use geo::algorithm::bounding_rect::BoundingRect;
use geo::algorithm::contains::Contains;
use geo::algorithm::map_coords::MapCoords;
use geo::{MultiPolygon, Point};
use nalgebra::Point2;
use ndarray::Array2;

use crate::geometry::BoundsExt;
use crate::session::{RasterHandle, Region, Session, VectorHandle};
use crate::Result;

/// One building footprint with its attributes.
pub struct Building {
    pub fid: u64,
    /// Scalar attributes of the feature, as strings.
    pub fields: Vec<(String, String)>,
    /// Footprint in world coordinates.
    pub footprint: MultiPolygon<f64>,
    /// Original geometry WKT, kept for re-export.
    pub wkt: String,
}

/// All buildings read from one vector layer.
pub struct BuildingSet {
    pub layer: String,
    pub buildings: Vec<Building>,
}

impl BuildingSet {
    pub fn len(&self) -> usize {
        self.buildings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buildings.is_empty()
    }
}

/// Load building footprints from the named layer of a
/// vector dataset into the session. Non-areal geometries
/// are rejected.
pub fn load(session: &mut Session, path: &Path, layer_name: &str) -> Result<VectorHandle> {
    let ds = Dataset::open(path)
        .with_context(|| format!("opening building dataset {}", path.display()))?;

    let mut layer = ds.layer_by_name(layer_name).map_err(|_| {
        let available: Vec<String> = ds.layers().map(|l| l.name()).collect();
        anyhow!(
            "layer `{}` not found in {} (available: {})",
            layer_name,
            path.display(),
            available.join(", ")
        )
    })?;

    let mut buildings = Vec::new();
    for feature in layer.features() {
        let fid = feature.fid().unwrap_or(buildings.len() as u64);
        let wkt = feature.geometry().wkt()?;
        let footprint = multipoly_from_wkt(&wkt)
            .with_context(|| format!("building fid {} in layer `{}`", fid, layer_name))?;

        let fields = feature
            .fields()
            .filter_map(|(name, value)| {
                use gdal::vector::FieldValue::*;
                let text = match value? {
                    StringValue(s) => s,
                    IntegerValue(v) => v.to_string(),
                    Integer64Value(v) => v.to_string(),
                    RealValue(v) => v.to_string(),
                    _ => return None,
                };
                Some((name, text))
            })
            .collect();

        buildings.push(Building {
            fid,
            fields,
            footprint,
            wkt,
        });
    }

    Ok(session.add_buildings(BuildingSet {
        layer: layer_name.to_string(),
        buildings,
    }))
}

fn multipoly_from_wkt(wkt: &str) -> Result<MultiPolygon<f64>> {
    let geom = gdal::vector::Geometry::from_wkt(wkt)?.into();
    use geo::Geometry::{MultiPolygon, Polygon};
    Ok(match geom {
        Polygon(p) => p.into(),
        MultiPolygon(p) => p,
        _ => bail!("geometry is not a (multi)-polygon"),
    })
}

/// Rasterize the building set onto the region grid. Each
/// cell whose centre falls inside a footprint holds that
/// building's ordinal plus one; cells outside all
/// footprints hold zero.
pub fn rasterize_zones(region: &Region, set: &BuildingSet) -> Result<Array2<u32>> {
    let inverse = region
        .transform
        .try_inverse()
        .ok_or_else(|| anyhow!("region has a degenerate geo transform"))?;

    let mut zones = Array2::<u32>::zeros(region.shape());

    for (ordinal, building) in set.buildings.iter().enumerate() {
        // Project the footprint into pixel space once, then
        // test cell centres inside its bounding window.
        let footprint = building.footprint.map_coords(|c| {
            let pt = inverse.transform_point(&Point2::new(c.x, c.y));
            (pt.x, pt.y).into()
        });

        let bounds = match footprint.bounding_rect() {
            Some(b) => b,
            None => continue,
        };
        let ((left, top), (width, height)) = bounds.window_from_bounds(region.dims);

        for row in top as usize..top as usize + height {
            for col in left as usize..left as usize + width {
                let centre = Point::new(col as f64 + 0.5, row as f64 + 0.5);
                if footprint.contains(&centre) {
                    zones[(row, col)] = ordinal as u32 + 1;
                }
            }
        }
    }
    Ok(zones)
}

/// Copy a value raster keeping only building-covered cells;
/// everything outside the zone grid becomes NaN. Stored
/// under the given name.
pub fn mask_raster(
    session: &mut Session,
    value: RasterHandle,
    zones: &Array2<u32>,
    name: &str,
) -> Result<RasterHandle> {
    session.checkpoint()?;

    let values = session.raster(value)?;
    if values.dim() != zones.dim() {
        bail!("zone grid shape does not match raster shape");
    }

    let mut masked = values.clone();
    for (out, &zone) in masked.iter_mut().zip(zones.iter()) {
        if zone == 0 {
            *out = f64::NAN;
        }
    }
    session.add_raster(name, masked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::test_region;
    use std::fs;
    use tempdir::TempDir;

    fn square(min: (f64, f64), max: (f64, f64)) -> MultiPolygon<f64> {
        use geo::{polygon, Polygon};
        let p: Polygon<f64> = polygon![
            (x: min.0, y: min.1),
            (x: max.0, y: min.1),
            (x: max.0, y: max.1),
            (x: min.0, y: max.1),
            (x: min.0, y: min.1),
        ];
        p.into()
    }

    fn set_of(footprints: Vec<MultiPolygon<f64>>) -> BuildingSet {
        BuildingSet {
            layer: "buildings".to_string(),
            buildings: footprints
                .into_iter()
                .enumerate()
                .map(|(i, footprint)| Building {
                    fid: i as u64,
                    fields: vec![],
                    footprint,
                    wkt: String::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn zones_cover_cell_centres_inside_footprints() {
        let region = test_region();
        // World coords: x right, y up from 0..8; a 2x2
        // building with corner at origin.
        let set = set_of(vec![square((1., 1.), (3., 3.)), square((6., 5.), (8., 8.))]);
        let zones = rasterize_zones(&region, &set).unwrap();

        // y=1..3 corresponds to rows 5..7.
        assert_eq!(zones[(5, 1)], 1);
        assert_eq!(zones[(6, 2)], 1);
        assert_eq!(zones[(4, 1)], 0);
        assert_eq!(zones[(1, 6)], 2);
        assert_eq!(zones[(0, 0)], 0);

        let covered = zones.iter().filter(|&&z| z == 1).count();
        assert_eq!(covered, 4);
    }

    #[test]
    fn footprint_outside_region_rasterizes_to_nothing() {
        let region = test_region();
        let set = set_of(vec![square((100., 100.), (104., 104.))]);
        let zones = rasterize_zones(&region, &set).unwrap();
        assert!(zones.iter().all(|&z| z == 0));
    }

    #[test]
    fn mask_keeps_only_building_cells() {
        let mut session = Session::new();
        session.set_region(test_region());
        let value = session
            .add_raster("solar", Array2::from_elem((8, 10), 42.))
            .unwrap();

        let set = set_of(vec![square((1., 1.), (3., 3.))]);
        let zones = rasterize_zones(session.region().unwrap(), &set).unwrap();

        let masked = mask_raster(&mut session, value, &zones, "solar_on_buildings").unwrap();
        let grid = session.raster(masked).unwrap();
        assert_eq!(grid[(5, 1)], 42.);
        assert!(grid[(0, 0)].is_nan());
        assert_eq!(grid.iter().filter(|v| !v.is_nan()).count(), 4);
    }

    #[test]
    fn wkt_round_trip_accepts_polygons_only() {
        assert!(multipoly_from_wkt("POLYGON ((0 0, 4 0, 4 4, 0 4, 0 0))").is_ok());
        assert!(multipoly_from_wkt(
            "MULTIPOLYGON (((0 0, 4 0, 4 4, 0 4, 0 0)))"
        )
        .is_ok());
        assert!(multipoly_from_wkt("POINT (1 1)").is_err());
    }

    #[test]
    fn missing_layer_lists_available_layers() {
        let tmp = TempDir::new("buildings_test").unwrap();
        let path = tmp.path().join("outlines.geojson");
        fs::write(
            &path,
            r#"{"type": "FeatureCollection", "features": [
                {"type": "Feature",
                 "properties": {"suburb": "Frankton"},
                 "geometry": {"type": "Polygon",
                              "coordinates": [[[0,0],[4,0],[4,4],[0,4],[0,0]]]}}]}"#,
        )
        .unwrap();

        let mut session = Session::new();
        let err = load(&mut session, &path, "no_such_layer").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("no_such_layer"));
        assert!(message.contains("outlines"), "got: {}", message);
    }

    #[test]
    fn load_reads_footprints_and_attributes() {
        let tmp = TempDir::new("buildings_load").unwrap();
        let path = tmp.path().join("outlines.geojson");
        fs::write(
            &path,
            r#"{"type": "FeatureCollection", "features": [
                {"type": "Feature",
                 "properties": {"suburb": "Frankton", "use": "residential"},
                 "geometry": {"type": "Polygon",
                              "coordinates": [[[0,0],[4,0],[4,4],[0,4],[0,0]]]}},
                {"type": "Feature",
                 "properties": {"suburb": "Shotover"},
                 "geometry": {"type": "Polygon",
                              "coordinates": [[[10,10],[12,10],[12,12],[10,12],[10,10]]]}}]}"#,
        )
        .unwrap();

        let mut session = Session::new();
        let handle = load(&mut session, &path, "outlines").unwrap();
        let set = session.buildings(handle).unwrap();

        assert_eq!(set.len(), 2);
        assert!(set.buildings[0]
            .fields
            .iter()
            .any(|(k, v)| k == "suburb" && v == "Frankton"));
        assert_eq!(set.buildings[0].footprint.0.len(), 1);
    }
}
