//! Export of rasters and per-building statistics.
//!
//! Rasters leave the session as GeoTIFFs carrying the
//! region's grid geometry and projection, with NaN as the
//! nodata value; re-importing an exported raster restores
//! the same cell values and grid. Statistics are written as
//! a GeoPackage layer (footprint geometry plus attributes)
//! and optionally as a flat CSV table.

use std::path::Path;

use anyhow::{bail, Context};
use gdal::raster::{Buffer, RasterCreationOption};
use gdal::spatial_ref::SpatialRef;
use gdal::vector::{
    FieldValue, Geometry, LayerAccess, LayerOptions, OGRFieldType, OGRwkbGeometryType,
};
use gdal::{Dataset, Driver};
use ndarray::Array2;

use crate::buildings::BuildingSet;
use crate::geometry::{transform_from_dataset, transform_to_gdal};
use crate::session::Region;
use crate::stats::BuildingRecord;
use crate::Result;

/// Name of the statistics layer inside the GeoPackage.
pub const STATS_LAYER: &str = "building_stats";

/// Write one grid as a single-band GeoTIFF on the region's
/// grid.
pub fn write_raster(region: &Region, grid: &Array2<f64>, path: &Path) -> Result<()> {
    write_multiband(region, &[grid], path)
}

/// Write several grids as the bands of one GeoTIFF, in the
/// order given. All grids must match the region shape.
pub fn write_multiband(region: &Region, grids: &[&Array2<f64>], path: &Path) -> Result<()> {
    if grids.is_empty() {
        bail!("at least one band is required");
    }
    for grid in grids {
        if grid.dim() != region.shape() {
            bail!(
                "grid shape {:?} does not match region shape {:?}",
                grid.dim(),
                region.shape()
            );
        }
    }

    let creation = [
        RasterCreationOption {
            key: "COMPRESS",
            value: "LZW",
        },
        RasterCreationOption {
            key: "TFW",
            value: "YES",
        },
    ];

    let (cols, rows) = region.dims;
    let driver = Driver::get("GTiff")?;
    let mut ds = driver
        .create_with_band_type_with_options::<f64, _>(
            path,
            cols as isize,
            rows as isize,
            grids.len() as isize,
            &creation,
        )
        .with_context(|| format!("creating raster {}", path.display()))?;

    ds.set_geo_transform(&transform_to_gdal(&region.transform))?;
    ds.set_projection(&region.projection)?;

    for (index, grid) in grids.iter().enumerate() {
        let mut band = ds.rasterband(index as isize + 1)?;
        band.set_no_data_value(f64::NAN)?;

        let data: Vec<f64> = grid.iter().cloned().collect();
        band.write((0, 0), (cols, rows), &Buffer::new((cols, rows), data))?;
    }
    Ok(())
}

/// Read the first band of a raster back into a grid and the
/// region it covers. Inverse of [`write_raster`]: the round
/// trip preserves cell values and grid geometry.
pub fn read_raster_grid(path: &Path) -> Result<(Region, Array2<f64>)> {
    let ds = Dataset::open(path)
        .with_context(|| format!("reading raster {}", path.display()))?;
    let transform = transform_from_dataset(&ds)?;
    let (cols, rows) = ds.raster_size();

    let band = ds.rasterband(1)?;
    let no_data = band.no_data_value();
    let buf = band.read_band_as::<f64>()?;
    let mut grid = Array2::from_shape_vec((rows, cols), buf.data)?;
    if let Some(nv) = no_data {
        if !nv.is_nan() {
            grid.mapv_inplace(|v| if v == nv { f64::NAN } else { v });
        }
    }

    Ok((
        Region {
            transform,
            dims: (cols, rows),
            projection: ds.projection(),
        },
        grid,
    ))
}

/// Write the statistics records as a GeoPackage layer named
/// [`STATS_LAYER`]: one feature per building, carrying the
/// footprint geometry, the source attributes and the
/// computed statistics. Records must be in building-set
/// order.
pub fn write_gpkg(
    set: &BuildingSet,
    records: &[BuildingRecord],
    projection: &str,
    path: &Path,
) -> Result<()> {
    if set.len() != records.len() {
        bail!(
            "building set has {} buildings but {} statistics records",
            set.len(),
            records.len()
        );
    }

    let driver = Driver::get("GPKG")?;
    let mut ds = driver
        .create_vector_only(path)
        .with_context(|| format!("creating GeoPackage {}", path.display()))?;

    let srs = if projection.is_empty() {
        None
    } else {
        Some(SpatialRef::from_definition(projection)?)
    };
    let mut layer = ds.create_layer(LayerOptions {
        name: STATS_LAYER,
        srs: srs.as_ref(),
        ty: OGRwkbGeometryType::wkbUnknown,
        ..Default::default()
    })?;

    // Source attributes: the union of field names across
    // the set, in first-seen order.
    let mut attrs: Vec<&str> = Vec::new();
    for building in &set.buildings {
        for (name, _) in &building.fields {
            if !attrs.iter().any(|a| a == name) {
                attrs.push(name);
            }
        }
    }

    let has_weather = records.iter().any(|r| r.weather_mwh.is_some());

    let mut defn: Vec<(&str, OGRFieldType::Type)> = attrs
        .iter()
        .map(|&name| (name, OGRFieldType::OFTString))
        .collect();
    defn.extend_from_slice(&[
        ("source_fid", OGRFieldType::OFTInteger64),
        ("cells", OGRFieldType::OFTInteger64),
        ("roof_sum_wh", OGRFieldType::OFTReal),
        ("roof_kwh", OGRFieldType::OFTReal),
        ("roof_mwh", OGRFieldType::OFTReal),
        ("roof_mean_wh", OGRFieldType::OFTReal),
        ("usable_sqm", OGRFieldType::OFTReal),
        ("area_sqm", OGRFieldType::OFTReal),
    ]);
    if has_weather {
        defn.extend_from_slice(&[
            ("wrf_mwh", OGRFieldType::OFTReal),
            ("percent_loss", OGRFieldType::OFTReal),
        ]);
    }
    layer.create_defn_fields(&defn)?;

    for (building, record) in set.buildings.iter().zip(records) {
        let geometry = Geometry::from_wkt(&building.wkt)?;

        let mut names: Vec<&str> = Vec::new();
        let mut values: Vec<FieldValue> = Vec::new();
        for (name, value) in &building.fields {
            names.push(name);
            values.push(FieldValue::StringValue(value.clone()));
        }

        names.push("source_fid");
        values.push(FieldValue::Integer64Value(record.fid as i64));
        names.push("cells");
        values.push(FieldValue::Integer64Value(record.cells as i64));
        names.push("roof_sum_wh");
        values.push(FieldValue::RealValue(record.roof_sum_wh));
        names.push("roof_kwh");
        values.push(FieldValue::RealValue(record.roof_kwh));
        names.push("roof_mwh");
        values.push(FieldValue::RealValue(record.roof_mwh));
        // Sentinel fields stay NULL when undefined.
        if let Some(mean) = record.roof_mean_wh {
            names.push("roof_mean_wh");
            values.push(FieldValue::RealValue(mean));
        }
        names.push("usable_sqm");
        values.push(FieldValue::RealValue(record.usable_sqm));
        names.push("area_sqm");
        values.push(FieldValue::RealValue(record.area_sqm));
        if let Some(mwh) = record.weather_mwh {
            names.push("wrf_mwh");
            values.push(FieldValue::RealValue(mwh));
        }
        if let Some(loss) = record.percent_loss {
            names.push("percent_loss");
            values.push(FieldValue::RealValue(loss));
        }

        layer.create_feature_fields(geometry, &names, &values)?;
    }
    Ok(())
}

/// Write the statistics records as a flat CSV table, one
/// row per building, no geometry.
pub fn write_csv(records: &[BuildingRecord], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("creating CSV {}", path.display()))?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}
