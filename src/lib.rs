//! Live transit map overlay: keeps vehicle, route and stop layers on a map
//! surface in step with the latest GTFS data.

pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod gtfs_archive;
pub mod models;
pub mod overlay;
pub mod poller;
pub mod realtime_feed;
pub mod reconciler;
pub mod render;
pub mod server;
pub mod session;
pub mod source;
pub mod style;
