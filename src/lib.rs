// Library exports for stower
// This allows integration tests and external crates to use stower's modules

pub mod config;
pub mod coordinator;
pub mod db;
pub mod logging;
pub mod services;
