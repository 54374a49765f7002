// Overlay configuration: builtin defaults, optional JSON file, env overrides.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_PATH_VAR: &str = "OVERLAY_CONFIG_PATH";
const ACCESS_TOKEN_VAR: &str = "MAP_ACCESS_TOKEN";
const API_BASE_VAR: &str = "OVERLAY_API_BASE";
const BIND_VAR: &str = "OVERLAY_BIND";
const ARCHIVE_VAR: &str = "OVERLAY_GTFS_ARCHIVE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Base URL of the validation backend (`/validate`, `/routes/geometry`, ...).
    pub api_base_url: String,
    pub bind_address: String,
    pub map_access_token: String,
    pub initial_viewport: ViewportConfig,
    pub vehicle_poll_interval_ms: u64,
    pub request_timeout_secs: u64,
    pub cluster: ClusterConfig,
    pub deviation: DeviationThresholds,
    pub gtfs_rt: Option<GtfsRtFeeds>,
    /// Local static GTFS zip; when set, routes and stops are read from it
    /// instead of the backend's geometry endpoints.
    pub static_archive_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportConfig {
    /// `[longitude, latitude]`
    pub center: [f64; 2],
    pub zoom: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Clustering is active strictly below this zoom level.
    pub max_zoom: f64,
    pub radius_px: f64,
    pub min_points: usize,
    pub bands: ClusterBands,
}

/// Count thresholds and visuals for the three cluster bands.
///
/// `count < medium_from` is band A, `count < large_from` is band B, anything
/// else is band C.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterBands {
    pub medium_from: usize,
    pub large_from: usize,
    pub colors: [String; 3],
    pub radii: [u8; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviationThresholds {
    pub on_time_secs: i64,
    pub minor_delay_secs: i64,
    pub pulse_secs: i64,
}

/// Direct GTFS-RT protobuf endpoints, used instead of the backend's
/// `/realtime/vehicles` when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GtfsRtFeeds {
    pub vehicle_positions_url: String,
    pub trip_updates_url: Option<String>,
    pub alerts_url: Option<String>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000/api/v1".to_string(),
            bind_address: "0.0.0.0:8080".to_string(),
            map_access_token: String::new(),
            initial_viewport: ViewportConfig::default(),
            vehicle_poll_interval_ms: 15_000,
            request_timeout_secs: 30,
            cluster: ClusterConfig::default(),
            deviation: DeviationThresholds::default(),
            gtfs_rt: None,
            static_archive_path: None,
        }
    }
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            center: [-112.074, 33.448],
            zoom: 10.0,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            max_zoom: 14.0,
            radius_px: 50.0,
            min_points: 2,
            bands: ClusterBands::default(),
        }
    }
}

impl Default for ClusterBands {
    fn default() -> Self {
        Self {
            medium_from: 5,
            large_from: 10,
            colors: [
                "#51bbd6".to_string(),
                "#f1f075".to_string(),
                "#f28cb1".to_string(),
            ],
            radii: [20, 30, 40],
        }
    }
}

impl Default for DeviationThresholds {
    fn default() -> Self {
        Self {
            on_time_secs: 60,
            minor_delay_secs: 180,
            pulse_secs: 300,
        }
    }
}

impl OverlayConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    /// Loads the file named by `OVERLAY_CONFIG_PATH` (or builtin defaults),
    /// then applies env overrides.
    pub fn load_from_env() -> Self {
        let mut config = match env::var(CONFIG_PATH_VAR).ok().map(PathBuf::from) {
            Some(path) => match Self::from_file(&path) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "overlay_config.loaded=file");
                    config
                }
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "overlay_config.load_failed, using builtin"
                    );
                    Self::default()
                }
            },
            None => {
                tracing::info!("overlay_config.loaded=builtin");
                Self::default()
            }
        };
        config.apply_overrides(|key| env::var(key).ok());
        config
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(token) = lookup(ACCESS_TOKEN_VAR) {
            self.map_access_token = token;
        }
        if let Some(base) = lookup(API_BASE_VAR) {
            self.api_base_url = base.trim_end_matches('/').to_string();
        }
        if let Some(bind) = lookup(BIND_VAR) {
            self.bind_address = bind;
        }
        if let Some(archive) = lookup(ARCHIVE_VAR).filter(|p| !p.trim().is_empty()) {
            self.static_archive_path = Some(PathBuf::from(archive));
        }
    }

    pub fn vehicle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.vehicle_poll_interval_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl ClusterBands {
    /// Band index (0 = A, 1 = B, 2 = C) for a cluster of `count` points.
    pub fn band_for(&self, count: usize) -> usize {
        if count < self.medium_from {
            0
        } else if count < self.large_from {
            1
        } else {
            2
        }
    }
}
