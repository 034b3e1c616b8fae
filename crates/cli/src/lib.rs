pub mod commands;
pub mod config;
pub mod profile;
pub mod session;

pub use config::Config;
