//! Row types, errors and the Postgres pool shared by the chainpulse crates.

pub mod db;
pub mod error;
pub mod types;

pub use error::PulseError;
pub use types::*;
