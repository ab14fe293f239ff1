//! Plain data shared by the failover engine, its runtime and its test doubles.
mod backend;
mod config;
mod constants;
mod data;
mod error;
mod stats;

pub use backend::*;
pub use config::*;
pub use constants::*;
pub use data::*;
pub use error::*;
pub use stats::*;
