// Static GTFS archive reader: route shapes and stops from a feed zip.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Cursor, Read, Seek};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{info, warn};
use zip::ZipArchive;

use crate::error::ArchiveError;
use crate::models::{Entity, EntityKind, LngLat, RouteAttributes, Snapshot, StopAttributes};
use crate::style::{normalize_hex_color, DEFAULT_ROUTE_COLOR};

// ============================================================================
// Rows
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
struct RouteRow {
    route_id: String,
    #[serde(default)]
    route_short_name: Option<String>,
    #[serde(default)]
    route_long_name: Option<String>,
    #[serde(default)]
    route_color: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TripRow {
    route_id: String,
    #[serde(default)]
    shape_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ShapeRow {
    shape_id: String,
    shape_pt_lat: f64,
    shape_pt_lon: f64,
    shape_pt_sequence: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct StopRow {
    stop_id: String,
    #[serde(default)]
    stop_code: Option<String>,
    #[serde(default)]
    stop_name: Option<String>,
    #[serde(default)]
    stop_desc: Option<String>,
    #[serde(default)]
    stop_lat: Option<f64>,
    #[serde(default)]
    stop_lon: Option<f64>,
}

// ============================================================================
// Archive
// ============================================================================

/// The tables of a GTFS feed needed to draw routes and stops.
#[derive(Debug, Clone, Default)]
pub struct GtfsArchive {
    routes: HashMap<String, RouteRow>,
    trips: Vec<TripRow>,
    shapes: BTreeMap<String, Vec<ShapeRow>>,
    stops: Vec<StopRow>,
}

impl GtfsArchive {
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let file = File::open(path).map_err(|source| ArchiveError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mut archive = ZipArchive::new(file)?;
        Self::from_zip(&mut archive)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ArchiveError> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))?;
        Self::from_zip(&mut archive)
    }

    fn from_zip<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Result<Self, ArchiveError> {
        let routes: HashMap<String, RouteRow> = read_table::<RouteRow, _>(archive, "routes.txt", true)?
            .into_iter()
            .map(|row| (row.route_id.clone(), row))
            .collect();
        let trips = read_table::<TripRow, _>(archive, "trips.txt", false)?;
        let stops = read_table::<StopRow, _>(archive, "stops.txt", true)?;

        let mut shapes: BTreeMap<String, Vec<ShapeRow>> = BTreeMap::new();
        for row in read_table::<ShapeRow, _>(archive, "shapes.txt", false)? {
            shapes.entry(row.shape_id.clone()).or_default().push(row);
        }
        for points in shapes.values_mut() {
            points.sort_by_key(|p| p.shape_pt_sequence);
        }

        info!(
            routes = routes.len(),
            trips = trips.len(),
            shapes = shapes.len(),
            stops = stops.len(),
            "gtfs_archive.loaded"
        );
        Ok(Self {
            routes,
            trips,
            shapes,
            stops,
        })
    }

    /// One line per shape, described by the route of the first trip using it.
    pub fn route_snapshot(&self) -> Snapshot {
        let mut shape_routes: HashMap<&str, &str> = HashMap::new();
        for trip in &self.trips {
            if let Some(shape_id) = trip.shape_id.as_deref() {
                shape_routes.entry(shape_id).or_insert(trip.route_id.as_str());
            }
        }

        let entities = self
            .shapes
            .iter()
            .map(|(shape_id, points)| {
                let route_id = shape_routes.get(shape_id.as_str()).copied();
                let route = route_id.and_then(|id| self.routes.get(id));
                let line = points
                    .iter()
                    .map(|p| LngLat::new(p.shape_pt_lon, p.shape_pt_lat))
                    .collect();
                Entity::route(
                    shape_id.clone(),
                    line,
                    RouteAttributes {
                        route_id: route_id.map(str::to_string),
                        color: Some(
                            normalize_hex_color(route.and_then(|r| r.route_color.as_deref()))
                                .unwrap_or_else(|| DEFAULT_ROUTE_COLOR.to_string()),
                        ),
                        short_name: route.and_then(|r| r.route_short_name.clone()),
                        long_name: route.and_then(|r| r.route_long_name.clone()),
                    },
                )
            })
            .collect();
        Snapshot::new(EntityKind::Route, entities)
    }

    pub fn stop_snapshot(&self) -> Snapshot {
        let entities = self
            .stops
            .iter()
            .filter_map(|stop| {
                let (Some(lat), Some(lon)) = (stop.stop_lat, stop.stop_lon) else {
                    return None;
                };
                Some(Entity::stop(
                    stop.stop_id.clone(),
                    LngLat::new(lon, lat),
                    StopAttributes {
                        name: stop.stop_name.clone(),
                        code: stop.stop_code.clone(),
                        description: stop.stop_desc.clone(),
                    },
                ))
            })
            .collect();
        Snapshot::new(EntityKind::Stop, entities)
    }

    pub fn snapshot(&self, kind: EntityKind) -> Option<Snapshot> {
        match kind {
            EntityKind::Route => Some(self.route_snapshot()),
            EntityKind::Stop => Some(self.stop_snapshot()),
            EntityKind::Vehicle => None,
        }
    }
}

/// Reads a CSV table by header name. Malformed rows are skipped; an absent
/// optional file reads as empty.
fn read_table<T, R>(archive: &mut ZipArchive<R>, file: &'static str, required: bool) -> Result<Vec<T>, ArchiveError>
where
    T: DeserializeOwned,
    R: Read + Seek,
{
    let mut contents = String::new();
    match archive.by_name(file) {
        Ok(mut entry) => {
            entry
                .read_to_string(&mut contents)
                .map_err(|source| ArchiveError::Read { file, source })?;
        }
        Err(zip::result::ZipError::FileNotFound) if !required => return Ok(Vec::new()),
        Err(zip::result::ZipError::FileNotFound) => return Err(ArchiveError::MissingFile(file)),
        Err(err) => return Err(err.into()),
    }

    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(contents.as_bytes());
    rdr.headers().map_err(|source| ArchiveError::Csv { file, source })?;

    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for result in rdr.deserialize::<T>() {
        match result {
            Ok(row) => rows.push(row),
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(file, skipped, "gtfs_archive.rows_skipped");
    }
    Ok(rows)
}
