pub use crate::{Error, Result};

pub use crate::geometry::*;
pub use crate::session::*;

pub use crate::linke::*;
pub use crate::stats::*;
