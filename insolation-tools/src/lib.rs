pub mod utils;
pub use insolation::{Error, Result};

pub mod proc;
pub use proc::*;

pub mod cli;
