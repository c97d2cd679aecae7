pub mod control;
pub mod optimize;
pub mod timeseries;

pub use control::*;
pub use optimize::*;
pub use timeseries::*;
