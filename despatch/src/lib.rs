//! The `despatch` daemon: configuration, bootstrap and signal handling around
//! the delivery engine.

pub mod controller;
pub mod submit;

pub use controller::{Despatch, find_config_file};
