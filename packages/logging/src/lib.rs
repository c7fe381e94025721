mod definitions;
pub use definitions::*;

mod formatters;
pub use formatters::*;

pub mod loggers;
