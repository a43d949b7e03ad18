//! Estimate rooftop solar irradiance from digital surface models.
//!
//! The crate is organized around an explicit [`Session`]: every
//! operation takes the session it reads from and writes to, and
//! refers to rasters through typed handles returned at creation.
//! There is no hidden global state.
//!
//! The usual flow is: merge elevation tiles ([`mosaic`]), derive
//! slope/aspect ([`terrain`]), model clear-sky irradiance for a set
//! of key days and interpolate over the year ([`solar`], [`linke`]),
//! clip to building footprints ([`buildings`]), optionally adjust by
//! a historical weather grid ([`weather`]), then aggregate per
//! building ([`stats`]) and export ([`export`]).
//!
//! [`Session`]: session::Session

pub mod buildings;
pub mod export;
pub mod geometry;
pub mod linke;
pub mod mosaic;
pub mod session;
pub mod solar;
pub mod stats;
pub mod terrain;
pub mod weather;

pub mod prelude;

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, Error>;
