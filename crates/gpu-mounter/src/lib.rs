pub mod allocator;
pub mod api;
pub mod app;
pub mod config;
pub mod device;
pub mod errors;
pub mod inventory;
pub mod liveness;
pub mod logging;
pub mod mount_type;
pub mod platform;
pub mod service;
pub mod splicer;
pub mod util;

#[cfg(test)]
mod testing;
