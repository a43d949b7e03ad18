//! Prints the interpolated Linke turbidity for a day of
//! year, from the built-in monthly table.

use clap::*;
use insolation::linke::LinkeTable;
use insolation_tools::{Result, *};

// Main function
insolation_tools::sync_main!(run());

fn run() -> Result<()> {
    let args = parse_cmd_line();
    let value = LinkeTable::default().value_for_day(args.day)?;
    println!("{:.4}", value);
    Ok(())
}

/// Program arguments
struct Args {
    /// Day of year
    day: u32,
}

fn parse_cmd_line() -> Args {
    let matches = args_parser!("linke-day")
        .about("Print the interpolated Linke turbidity for a day of year.")
        .arg(arg!("day").required(true).help("Day of year (1-365)"))
        .get_matches();

    let day = value_t!(matches, "day", u32).unwrap_or_else(|e| e.exit());
    Args { day }
}
