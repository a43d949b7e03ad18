//! Output helpers shared by the command-line tools.

use insolation::Result;
use serde::Serialize;

pub fn print_json<T: Serialize>(json: &T) -> Result<()> {
    let writer = std::io::BufWriter::new(std::io::stdout());
    Ok(serde_json::to_writer(writer, json)?)
}
