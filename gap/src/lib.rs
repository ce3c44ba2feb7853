// Anonymous query routing core
// Exposes internal modules for benchmarking and testing

#[macro_use]
extern crate log;

pub mod config;
pub mod env;
pub mod error;
pub mod packet;
pub mod routing;

pub use config::GapConfig;
pub use env::GapEnvironment;
pub use error::{GapError, GetStatus};
pub use routing::GapCore;
