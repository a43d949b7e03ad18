use clap::*;
use insolation_tools::*;

use std::path::PathBuf;
use std::time::Duration;

/// Program arguments
pub struct Args {
    /// Glob matching the DSM elevation tiles
    pub dsm_glob: String,
    /// Building outline dataset (directory or file)
    pub building_dir: PathBuf,
    /// Layer holding the building footprints
    pub building_layer_name: String,
    /// Area name used in raster and output file names
    pub area_name: String,
    /// Name for the solar-on-buildings raster
    pub output_prefix: String,
    /// Maximum roof slope retained, degrees
    pub max_slope: f64,
    /// Key days sampled by the irradiance model
    pub key_days: Vec<u32>,
    /// Intra-day sampling step in decimal hours
    pub time_step: f64,
    /// Optional day-banded weather dataset
    pub weather_file: Option<PathBuf>,
    /// CRS of the weather dataset
    pub source_crs: String,
    /// CRS the region coordinates are in
    pub target_crs: String,
    /// Override of the region-derived latitude
    pub latitude: Option<f64>,
    /// Watchdog timeout applied to each pipeline step
    pub step_timeout: Option<Duration>,
    /// Export final rasters as GeoTIFFs
    pub export_rasters: bool,
    /// Directory receiving the output files
    pub output_dir: PathBuf,
}

pub fn parse_cmd_line() -> Args {
    let matches = args_parser!("solar-pipeline")
        .about("Estimate rooftop solar irradiance on buildings from DSM tiles.")
        .arg(
            opt!("dsm glob")
                .required(true)
                .help("Glob for DSM GeoTIFF tiles"),
        )
        .arg(
            opt!("building dir")
                .required(true)
                .help("Building outline dataset (directory or file)"),
        )
        .arg(
            opt!("building layer name")
                .required(true)
                .help("Layer holding the building footprints"),
        )
        .arg(
            opt!("area name")
                .required(true)
                .help("Area name used in output file names"),
        )
        .arg(opt!("output prefix").help("Name for the solar-on-buildings raster (default: solar_on_buildings)"))
        .arg(opt!("max slope").help("Maximum roof slope in degrees (default: 45)"))
        .arg(
            opt!("key days")
                .use_delimiter(true)
                .help("Comma-separated key days of the year (default: 1,7)"),
        )
        .arg(opt!("time step").help("Intra-day sampling step in decimal hours (default: 1.0)"))
        .arg(opt!("weather file").help("Day-banded weather dataset for measured-radiation adjustment"))
        .arg(opt!("source crs").help("CRS of the weather dataset (default: EPSG:4326)"))
        .arg(opt!("target crs").help("CRS of the region for weather resampling (default: EPSG:2193)"))
        .arg(
            opt!("latitude")
                .allow_hyphen_values(true)
                .help("Latitude override in degrees, negative south (default: region centre)"),
        )
        .arg(opt!("step timeout secs").help("Abort any pipeline step running longer than this"))
        .arg(flag!("export rasters").help("Export final rasters as GeoTIFFs"))
        .arg(opt!("output dir").help("Directory for output files (default: .)"))
        .get_matches();

    let dsm_glob = value_t!(matches, "dsm glob", String).unwrap_or_else(|e| e.exit());
    let building_dir = value_t!(matches, "building dir", PathBuf).unwrap_or_else(|e| e.exit());
    let building_layer_name =
        value_t!(matches, "building layer name", String).unwrap_or_else(|e| e.exit());
    let area_name = value_t!(matches, "area name", String).unwrap_or_else(|e| e.exit());

    let output_prefix = value_t!(matches, "output prefix", String)
        .unwrap_or_else(|_| String::from("solar_on_buildings"));
    let max_slope = value_t!(matches, "max slope", f64).unwrap_or_else(|_| 45.0);
    let time_step = value_t!(matches, "time step", f64).unwrap_or_else(|_| 1.0);
    let source_crs =
        value_t!(matches, "source crs", String).unwrap_or_else(|_| String::from("EPSG:4326"));
    let target_crs =
        value_t!(matches, "target crs", String).unwrap_or_else(|_| String::from("EPSG:2193"));
    let output_dir =
        value_t!(matches, "output dir", PathBuf).unwrap_or_else(|_| PathBuf::from("."));

    let key_days = if matches.is_present("key days") {
        values_t!(matches, "key days", u32).unwrap_or_else(|e| e.exit())
    } else {
        vec![1, 7]
    };
    let key_days = checked_key_days(key_days);

    let weather_file = if matches.is_present("weather file") {
        Some(value_t!(matches, "weather file", PathBuf).unwrap_or_else(|e| e.exit()))
    } else {
        None
    };
    let latitude = if matches.is_present("latitude") {
        Some(value_t!(matches, "latitude", f64).unwrap_or_else(|e| e.exit()))
    } else {
        None
    };
    let step_timeout = if matches.is_present("step timeout secs") {
        let secs = value_t!(matches, "step timeout secs", u64).unwrap_or_else(|e| e.exit());
        Some(Duration::from_secs(secs))
    } else {
        None
    };

    Args {
        dsm_glob,
        building_dir,
        building_layer_name,
        area_name,
        output_prefix,
        max_slope,
        key_days,
        time_step,
        weather_file,
        source_crs,
        target_crs,
        latitude,
        step_timeout,
        export_rasters: matches.is_present("export rasters"),
        output_dir,
    }
}

/// Sort, dedupe and range-check the key days.
fn checked_key_days(mut days: Vec<u32>) -> Vec<u32> {
    use clap::{Error, ErrorKind::InvalidValue};
    days.sort_unstable();
    days.dedup();
    if days.is_empty() {
        Error::with_description("at least one key day is required", InvalidValue).exit();
    }
    if let Some(&bad) = days.iter().find(|&&d| d < 1 || d > 365) {
        Error::with_description(&format!("key day {} is outside 1..365", bad), InvalidValue)
            .exit();
    }
    days
}
