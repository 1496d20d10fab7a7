pub mod backend;
pub mod binder;
pub mod config;
pub mod defaults;
pub mod engine;
pub mod error;
pub mod model;
pub mod param;
pub mod projection;

#[cfg(test)]
mod testing;
