//! Configuration handling: the pool/host/VM graph and its file parser.

pub mod model;
pub mod parser;

pub use model::*;
pub use parser::{load, parse_str, ConfigError};
