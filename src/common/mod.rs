//! Common types shared across components

pub mod cli;
pub mod error;

pub use cli::{CommonArgs, EmulatorArgs};
pub use error::DecodeError;
