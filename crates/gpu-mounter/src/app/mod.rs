//! Application module
//!
//! Wiring of the worker's components and their lifecycle.

pub mod builder;
pub mod core;
pub mod tasks;

pub use builder::ApplicationBuilder;
pub use core::Application;
