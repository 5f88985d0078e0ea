pub mod browser;
pub mod classify;
pub mod compliance;
pub mod config;
pub mod creative;
pub mod display;
pub mod error;
pub mod logging;
pub mod net;
pub mod netlog;
pub mod paths;
pub mod ports;
pub mod report;
pub mod rewrite;
pub mod server;
pub mod types;
pub mod workspace;
