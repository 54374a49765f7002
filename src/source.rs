// Snapshot sources and the validation collaborator client.
//
// All network access is blocking (reqwest::blocking); callers run fetches on
// the blocking pool.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::{self, multipart};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::config::GtfsRtFeeds;
use crate::error::{FetchFailure, ValidationError};
use crate::gtfs_archive::GtfsArchive;
use crate::models::{EntityKind, FeatureCollection, RealtimeVehiclesResponse, ReportFormat, Snapshot, ValidationReport};
use crate::realtime_feed;

/// Produces full snapshots of one entity kind.
pub trait SnapshotSource: Send + Sync {
    fn fetch_snapshot(&self, kind: EntityKind) -> Result<Snapshot, FetchFailure>;
}

pub fn create_http_client(timeout: Duration) -> Result<blocking::Client, reqwest::Error> {
    blocking::Client::builder().timeout(timeout).build()
}

// ============================================================================
// Status Mapping
// ============================================================================

/// Maps a non-success response to a fetch failure. 404 means the backend has
/// not validated a feed yet.
pub fn failure_for_status(status: StatusCode, body: &str) -> FetchFailure {
    if status == StatusCode::NOT_FOUND {
        return FetchFailure::NotValidated;
    }
    FetchFailure::Server {
        status: status.as_u16(),
        message: error_detail(body),
    }
}

/// FastAPI-style `{"detail": "..."}` bodies yield the detail; anything else
/// is returned trimmed.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

fn get_bytes(client: &blocking::Client, url: &str) -> Result<Vec<u8>, FetchFailure> {
    let response = client
        .get(url)
        .send()
        .map_err(|e| FetchFailure::Network(format!("request to {} failed: {}", url, e)))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(failure_for_status(status, &body));
    }
    let body = response
        .bytes()
        .map_err(|e| FetchFailure::Network(format!("failed to read response from {}: {}", url, e)))?;
    Ok(body.to_vec())
}

fn get_json<T: DeserializeOwned>(client: &blocking::Client, url: &str) -> Result<T, FetchFailure> {
    let body = get_bytes(client, url)?;
    serde_json::from_slice(&body).map_err(|e| FetchFailure::Parse(format!("invalid payload from {}: {}", url, e)))
}

// ============================================================================
// Backend Source
// ============================================================================

/// Reads every kind from the validation backend:
/// `/realtime/vehicles`, `/routes/geometry` and `/stops/geometry`.
pub struct HttpSnapshotSource {
    client: blocking::Client,
    base_url: String,
}

impl HttpSnapshotSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: create_http_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self, kind: EntityKind) -> String {
        let path = match kind {
            EntityKind::Vehicle => "realtime/vehicles",
            EntityKind::Route => "routes/geometry",
            EntityKind::Stop => "stops/geometry",
        };
        format!("{}/{}", self.base_url, path)
    }
}

impl SnapshotSource for HttpSnapshotSource {
    fn fetch_snapshot(&self, kind: EntityKind) -> Result<Snapshot, FetchFailure> {
        let url = self.endpoint(kind);
        debug!(%kind, %url, "source.fetch");
        match kind {
            EntityKind::Vehicle => {
                let response: RealtimeVehiclesResponse = get_json(&self.client, &url)?;
                Ok(Snapshot::from_vehicles_response(response))
            }
            EntityKind::Route | EntityKind::Stop => {
                let collection: FeatureCollection = get_json(&self.client, &url)?;
                Ok(Snapshot::from_feature_collection(kind, collection))
            }
        }
    }
}

// ============================================================================
// GTFS-RT Source
// ============================================================================

/// Vehicles straight from GTFS-RT protobuf feeds.
pub struct GtfsRtSource {
    client: blocking::Client,
    feeds: GtfsRtFeeds,
}

impl GtfsRtSource {
    pub fn new(feeds: GtfsRtFeeds, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: create_http_client(timeout)?,
            feeds,
        })
    }

    fn fetch_feed(&self, url: &str) -> Result<gtfs_rt::FeedMessage, FetchFailure> {
        let body = get_bytes(&self.client, url)?;
        realtime_feed::decode_feed(&body)
    }

    /// Secondary feeds degrade to "absent" instead of failing the snapshot.
    fn fetch_optional(&self, url: Option<&str>, feed: &'static str) -> Option<gtfs_rt::FeedMessage> {
        let url = url?;
        match self.fetch_feed(url) {
            Ok(message) => Some(message),
            Err(err) => {
                warn!(feed, error = %err, "source.gtfs_rt_feed_unavailable");
                None
            }
        }
    }
}

impl SnapshotSource for GtfsRtSource {
    fn fetch_snapshot(&self, kind: EntityKind) -> Result<Snapshot, FetchFailure> {
        if kind != EntityKind::Vehicle {
            return Err(FetchFailure::NotValidated);
        }
        let positions = self.fetch_feed(&self.feeds.vehicle_positions_url)?;
        let trip_updates = self.fetch_optional(self.feeds.trip_updates_url.as_deref(), "trip_updates");
        let alerts = self.fetch_optional(self.feeds.alerts_url.as_deref(), "alerts");
        Ok(realtime_feed::vehicle_snapshot(
            &positions,
            trip_updates.as_ref(),
            alerts.as_ref(),
        ))
    }
}

// ============================================================================
// Static Archive Source
// ============================================================================

/// Routes and stops from a local GTFS zip, re-read on every fetch.
pub struct ArchiveSnapshotSource {
    path: PathBuf,
}

impl ArchiveSnapshotSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotSource for ArchiveSnapshotSource {
    fn fetch_snapshot(&self, kind: EntityKind) -> Result<Snapshot, FetchFailure> {
        let archive = GtfsArchive::open(&self.path)?;
        archive.snapshot(kind).ok_or(FetchFailure::NotValidated)
    }
}

// ============================================================================
// Per-Kind Routing
// ============================================================================

/// Dispatches each kind to its own source. Kinds without a source report
/// `NotValidated`.
#[derive(Default, Clone)]
pub struct SourceRouter {
    sources: HashMap<EntityKind, Arc<dyn SnapshotSource>>,
}

impl SourceRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: EntityKind, source: Arc<dyn SnapshotSource>) -> Self {
        self.sources.insert(kind, source);
        self
    }
}

impl SnapshotSource for SourceRouter {
    fn fetch_snapshot(&self, kind: EntityKind) -> Result<Snapshot, FetchFailure> {
        match self.sources.get(&kind) {
            Some(source) => source.fetch_snapshot(kind),
            None => Err(FetchFailure::NotValidated),
        }
    }
}

// ============================================================================
// Validation Collaborator
// ============================================================================

pub struct ValidationClient {
    client: blocking::Client,
    base_url: String,
}

impl ValidationClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: create_http_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn validate_file(&self, path: &Path) -> Result<ValidationReport, ValidationError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        ensure_zip_name(&file_name)?;
        let bytes = fs::read(path).map_err(|source| ValidationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.validate_bytes(&file_name, bytes)
    }

    /// Uploads a feed archive as multipart `file` to `/validate`.
    pub fn validate_bytes(&self, file_name: &str, bytes: Vec<u8>) -> Result<ValidationReport, ValidationError> {
        ensure_zip_name(file_name)?;
        let size = bytes.len();
        let part = multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str("application/zip")
            .map_err(|e| ValidationError::Network(e.to_string()))?;
        let form = multipart::Form::new().part("file", part);

        let url = format!("{}/validate", self.base_url);
        info!(file = file_name, bytes = size, "validation.upload");
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .map_err(|e| ValidationError::Network(e.to_string()))?;

        let status = response.status();
        let body = response.text().map_err(|e| ValidationError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(ValidationError::Server {
                status: status.as_u16(),
                message: error_detail(&body),
            });
        }
        let report: ValidationReport =
            serde_json::from_str(&body).map_err(|e| ValidationError::Parse(e.to_string()))?;
        info!(
            is_valid = report.is_valid,
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            "validation.completed"
        );
        Ok(report)
    }

    /// Raw report export from `/report?format=...`.
    pub fn export_report(&self, format: ReportFormat) -> Result<Vec<u8>, ValidationError> {
        let url = format!("{}/report", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("format", format.as_str())])
            .send()
            .map_err(|e| ValidationError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ValidationError::Server {
                status: status.as_u16(),
                message: error_detail(&body),
            });
        }
        let body = response.bytes().map_err(|e| ValidationError::Network(e.to_string()))?;
        Ok(body.to_vec())
    }
}

fn ensure_zip_name(file_name: &str) -> Result<(), ValidationError> {
    if file_name.ends_with(".zip") {
        Ok(())
    } else {
        Err(ValidationError::NotZip(file_name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Entity, LngLat, VehicleAttributes};
    use std::io::Write;

    struct FixedSource(usize);

    impl SnapshotSource for FixedSource {
        fn fetch_snapshot(&self, kind: EntityKind) -> Result<Snapshot, FetchFailure> {
            let entities = (0..self.0)
                .map(|i| Entity::vehicle(format!("V{}", i), LngLat::new(0.0, 0.0), VehicleAttributes::default()))
                .collect();
            Ok(Snapshot::new(kind, entities))
        }
    }

    #[test]
    fn not_found_means_not_validated() {
        let failure = failure_for_status(
            StatusCode::NOT_FOUND,
            r#"{"detail":"No GTFS feed has been validated yet."}"#,
        );
        assert_eq!(failure, FetchFailure::NotValidated);
    }

    #[test]
    fn server_errors_carry_detail() {
        let failure = failure_for_status(StatusCode::INTERNAL_SERVER_ERROR, r#"{"detail":"boom"}"#);
        assert_eq!(
            failure,
            FetchFailure::Server {
                status: 500,
                message: "boom".to_string()
            }
        );
        let failure = failure_for_status(StatusCode::BAD_GATEWAY, " upstream down \n");
        assert_eq!(
            failure,
            FetchFailure::Server {
                status: 502,
                message: "upstream down".to_string()
            }
        );
    }

    #[test]
    fn endpoints_are_joined_to_base() {
        let source = HttpSnapshotSource::new("http://localhost:8000/api/v1/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            source.endpoint(EntityKind::Route),
            "http://localhost:8000/api/v1/routes/geometry"
        );
        assert_eq!(
            source.endpoint(EntityKind::Vehicle),
            "http://localhost:8000/api/v1/realtime/vehicles"
        );
    }

    #[test]
    fn router_dispatches_per_kind() {
        let router = SourceRouter::new().with(EntityKind::Vehicle, Arc::new(FixedSource(3)));
        assert_eq!(router.fetch_snapshot(EntityKind::Vehicle).unwrap().len(), 3);
        assert_eq!(
            router.fetch_snapshot(EntityKind::Stop).unwrap_err(),
            FetchFailure::NotValidated
        );
    }

    #[test]
    fn archive_source_reads_stops_from_disk() {
        let path = std::env::temp_dir().join(format!("overlay-source-test-{}.zip", std::process::id()));
        {
            let file = fs::File::create(&path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::FileOptions::default();
            writer.start_file("routes.txt", options).unwrap();
            writer.write_all(b"route_id,route_short_name\nR1,1\n").unwrap();
            writer.start_file("stops.txt", options).unwrap();
            writer
                .write_all(b"stop_id,stop_name,stop_lat,stop_lon\nS1,Main St,33.4,-112.0\n")
                .unwrap();
            writer.finish().unwrap();
        }

        let source = ArchiveSnapshotSource::new(&path);
        let stops = source.fetch_snapshot(EntityKind::Stop).unwrap();
        assert_eq!(stops.len(), 1);
        assert!(source.fetch_snapshot(EntityKind::Route).unwrap().is_empty());
        assert_eq!(
            source.fetch_snapshot(EntityKind::Vehicle).unwrap_err(),
            FetchFailure::NotValidated
        );
        fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_archive_is_not_validated() {
        let source = ArchiveSnapshotSource::new("/nonexistent/feed.zip");
        assert_eq!(
            source.fetch_snapshot(EntityKind::Route).unwrap_err(),
            FetchFailure::NotValidated
        );
    }

    #[test]
    fn non_zip_uploads_are_rejected_locally() {
        let client = ValidationClient::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        let err = client.validate_bytes("feed.txt", b"hello".to_vec()).unwrap_err();
        assert!(matches!(err, ValidationError::NotZip(name) if name == "feed.txt"));
        let err = client.validate_file(Path::new("/tmp/feed.tar.gz")).unwrap_err();
        assert!(matches!(err, ValidationError::NotZip(_)));
    }
}
