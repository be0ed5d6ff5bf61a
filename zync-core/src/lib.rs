pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod party;
pub mod player;
pub mod service;
pub mod streaming;

#[cfg(test)]
pub mod test_helpers;

pub use config::Config;
pub use error::{Error, Result};
