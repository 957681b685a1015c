//! CLI commands module.

mod eval;
mod train;
mod util;

pub use eval::EvalCommand;
pub use train::TrainCommand;

pub(crate) use util::*;
