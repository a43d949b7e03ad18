//! Estimates rooftop solar irradiance potential per building:
//! merges DSM tiles, derives slope/aspect, models clear-sky
//! irradiance over a set of key days, clips to building
//! footprints, optionally adjusts by measured weather data,
//! and writes per-building statistics (GeoPackage + CSV).

use std::collections::BTreeMap;

use log::info;
use serde_derive::Serialize;

use insolation::mosaic::{TileSet, VirtualMosaic};
use insolation::prelude::*;
use insolation::solar::ClearSky;
use insolation::weather::WeatherGrid;
use insolation::{buildings, export, solar, stats, terrain, weather};

use insolation_tools::{utils::print_json, Result, Tracker};

mod args;

// Main function
insolation_tools::sync_main!(run());

fn run() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Parse command line
    let args = args::parse_cmd_line();

    let mut session = Session::new();
    let step_timeout = args.step_timeout;
    let watchdog = |session: &Session| -> Option<Deadline> {
        step_timeout.map(|timeout| Deadline::watch(session.cancel_token(), timeout))
    };

    // Merge DSM tiles and import the mosaic
    info!("merging DSM tiles from {}", args.dsm_glob);
    let tiles = TileSet::from_glob(&args.dsm_glob)?;
    info!("found {} tiles", tiles.len());
    let mosaic = VirtualMosaic::build(&tiles)?;
    let dsm = {
        let _guard = watchdog(&session);
        mosaic.import(&mut session, &format!("{}_dsm", args.area_name))?
    };

    // Derive terrain rasters
    info!("calculating slope and aspect");
    let (slope, aspect) = {
        let _guard = watchdog(&session);
        terrain::slope_aspect(&mut session, dsm)?
    };

    // Clear-sky irradiance per key day, then the period total
    let latitude = match args.latitude {
        Some(latitude) => latitude,
        None => session.region()?.latitude()?,
    };
    info!(
        "calculating solar irradiance for key days {:?} (latitude {:.4})",
        args.key_days, latitude
    );
    let model = ClearSky::new(latitude, args.time_step)?;
    let mut key_rasters = BTreeMap::new();
    {
        let _guard = watchdog(&session);
        let tracker = Tracker::new("key days", args.key_days.len());
        for &day in &args.key_days {
            let handle = model.day_raster(&mut session, slope, aspect, day)?;
            key_rasters.insert(day, handle);
            tracker.increment();
        }
    }
    let solar_total = {
        let _guard = watchdog(&session);
        solar::period_total(&mut session, &key_rasters, &format!("{}_solar", args.area_name))?
    };

    // Building outlines and the zone mask
    info!(
        "loading building outlines from {} (layer {})",
        args.building_dir.display(),
        args.building_layer_name
    );
    let outlines = buildings::load(&mut session, &args.building_dir, &args.building_layer_name)?;
    info!("loaded {} buildings", session.buildings(outlines)?.len());
    let zones = buildings::rasterize_zones(session.region()?, session.buildings(outlines)?)?;

    // Clip to buildings, then drop cells too steep for panels
    let on_buildings =
        buildings::mask_raster(&mut session, solar_total, &zones, &args.output_prefix)?;
    info!("filtering by slope (max {} degrees)", args.max_slope);
    let filtered = terrain::filter_by_slope(&mut session, on_buildings, slope, args.max_slope)?;

    // Optional adjustment by measured weather data
    let wrf_on_buildings = match &args.weather_file {
        Some(path) => {
            info!("adjusting by weather data from {}", path.display());
            let grid = WeatherGrid::open(path, &args.source_crs)?;
            let adjusted = {
                let _guard = watchdog(&session);
                weather::adjusted_total(
                    &mut session,
                    &grid,
                    &key_rasters,
                    &args.target_crs,
                    "wrf_adjusted_total",
                )?
            };
            let masked =
                buildings::mask_raster(&mut session, adjusted, &zones, "wrf_on_buildings_adjusted")?;
            session.remove_raster(adjusted)?;
            Some(masked)
        }
        None => None,
    };

    // Per-day rasters are no longer needed
    for (_, handle) in &key_rasters {
        session.remove_raster(*handle)?;
    }

    info!("aggregating per-building statistics");
    let records = stats::aggregate(&session, outlines, &zones, filtered, wrf_on_buildings)?;

    std::fs::create_dir_all(&args.output_dir)?;
    let gpkg_path = args
        .output_dir
        .join(format!("{}_building_stats.gpkg", args.area_name));
    let csv_path = args
        .output_dir
        .join(format!("{}_building_stats.csv", args.area_name));

    let region = session.region()?.clone();
    export::write_gpkg(
        session.buildings(outlines)?,
        &records,
        &region.projection,
        &gpkg_path,
    )?;
    export::write_csv(&records, &csv_path)?;
    info!("wrote {} and {}", gpkg_path.display(), csv_path.display());

    let mut outputs = vec![
        gpkg_path.display().to_string(),
        csv_path.display().to_string(),
    ];
    if args.export_rasters {
        let final_path = args
            .output_dir
            .join(format!("{}_solar_irradiance_on_buildings.tif", args.area_name));
        info!("exporting final raster to {}", final_path.display());
        // Bands: filtered irradiance, slope, aspect.
        export::write_multiband(
            &region,
            &[
                session.raster(filtered)?,
                session.raster(slope)?,
                session.raster(aspect)?,
            ],
            &final_path,
        )?;
        outputs.push(final_path.display().to_string());

        if let Some(wrf) = wrf_on_buildings {
            let wrf_path = args
                .output_dir
                .join(format!("{}_wrf_adjusted.tif", args.area_name));
            info!("exporting weather-adjusted raster to {}", wrf_path.display());
            export::write_raster(&region, session.raster(wrf)?, &wrf_path)?;
            outputs.push(wrf_path.display().to_string());
        }
    }

    info!("processing complete");
    print_json(&Summary {
        area: args.area_name,
        buildings: records.len(),
        buildings_with_cells: records.iter().filter(|r| r.cells > 0).count(),
        total_roof_mwh: records.iter().map(|r| r.roof_mwh).sum(),
        outputs,
    })?;
    Ok(())
}

/// Run summary printed to stdout as JSON.
#[derive(Serialize)]
struct Summary {
    area: String,
    buildings: usize,
    buildings_with_cells: usize,
    total_roof_mwh: f64,
    outputs: Vec<String>,
}
