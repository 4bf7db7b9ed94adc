//! Command-line surface of the report binary

pub mod args;

pub use args::{Args, Command};
