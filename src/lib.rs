pub mod config;
pub mod core;
pub mod db;
pub mod logging;
