pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod explain;
pub mod loader;
pub mod model;
pub mod orchestrator;
pub mod report;
pub mod seed;
