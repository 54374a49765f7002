// Entity, snapshot and wire models for the live overlay.
//
// Wire payloads mirror the validation backend:
// - GET /realtime/vehicles   -> { vehicles, realtimeMetrics, alerts }
// - GET /routes/geometry     -> GeoJSON FeatureCollection of LineStrings (one per shape)
// - GET /stops/geometry      -> GeoJSON FeatureCollection of Points
// - POST /validate           -> { is_valid, errors, warnings, feed_info?, metrics?, summary? }

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Geometry
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LngLat {
    pub lng: f64,
    pub lat: f64,
}

impl LngLat {
    pub fn new(lng: f64, lat: f64) -> Self {
        Self { lng, lat }
    }

    fn from_pair(pair: [f64; 2]) -> Self {
        Self::new(pair[0], pair[1])
    }

    pub fn is_finite(&self) -> bool {
        self.lng.is_finite() && self.lat.is_finite()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Point(LngLat),
    LineString(Vec<LngLat>),
    MultiLineString(Vec<Vec<LngLat>>),
}

impl Geometry {
    pub fn as_point(&self) -> Option<LngLat> {
        match self {
            Geometry::Point(p) => Some(*p),
            _ => None,
        }
    }

    /// A geometry with no coordinates, or any non-finite coordinate, cannot be rendered.
    pub fn is_renderable(&self) -> bool {
        match self {
            Geometry::Point(p) => p.is_finite(),
            Geometry::LineString(line) => line.len() >= 2 && line.iter().all(LngLat::is_finite),
            Geometry::MultiLineString(lines) => {
                !lines.is_empty()
                    && lines
                        .iter()
                        .all(|line| line.len() >= 2 && line.iter().all(LngLat::is_finite))
            }
        }
    }

    fn from_geojson(value: &Value) -> Option<Self> {
        let kind = value.get("type")?.as_str()?;
        let coordinates = value.get("coordinates")?.clone();
        match kind {
            "Point" => serde_json::from_value::<[f64; 2]>(coordinates)
                .ok()
                .map(|pair| Geometry::Point(LngLat::from_pair(pair))),
            "LineString" => serde_json::from_value::<Vec<[f64; 2]>>(coordinates)
                .ok()
                .map(|line| Geometry::LineString(line.into_iter().map(LngLat::from_pair).collect())),
            "MultiLineString" => serde_json::from_value::<Vec<Vec<[f64; 2]>>>(coordinates)
                .ok()
                .map(|lines| {
                    Geometry::MultiLineString(
                        lines
                            .into_iter()
                            .map(|line| line.into_iter().map(LngLat::from_pair).collect())
                            .collect(),
                    )
                }),
            _ => None,
        }
    }
}

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Vehicle,
    Route,
    Stop,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Route, EntityKind::Stop, EntityKind::Vehicle];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Vehicle => "vehicle",
            EntityKind::Route => "route",
            EntityKind::Stop => "stop",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().trim_end_matches('s') {
            "vehicle" => Ok(EntityKind::Vehicle),
            "route" => Ok(EntityKind::Route),
            "stop" => Ok(EntityKind::Stop),
            other => Err(format!("unknown entity kind `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VehicleAttributes {
    pub label: Option<String>,
    pub bearing: Option<f64>,
    pub speed: Option<f64>,
    pub schedule_deviation_seconds: Option<i64>,
    pub congestion_level: Option<String>,
    pub occupancy_status: Option<String>,
    pub current_status: Option<String>,
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub direction_id: Option<u32>,
    pub stop_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteAttributes {
    pub route_id: Option<String>,
    pub color: Option<String>,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopAttributes {
    pub name: Option<String>,
    pub code: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EntityAttributes {
    Vehicle(VehicleAttributes),
    Route(RouteAttributes),
    Stop(StopAttributes),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub geometry: Option<Geometry>,
    pub attributes: EntityAttributes,
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self.attributes {
            EntityAttributes::Vehicle(_) => EntityKind::Vehicle,
            EntityAttributes::Route(_) => EntityKind::Route,
            EntityAttributes::Stop(_) => EntityKind::Stop,
        }
    }

    pub fn vehicle(id: impl Into<String>, position: LngLat, attributes: VehicleAttributes) -> Self {
        Self {
            id: id.into(),
            geometry: Some(Geometry::Point(position)),
            attributes: EntityAttributes::Vehicle(attributes),
        }
    }

    pub fn stop(id: impl Into<String>, position: LngLat, attributes: StopAttributes) -> Self {
        Self {
            id: id.into(),
            geometry: Some(Geometry::Point(position)),
            attributes: EntityAttributes::Stop(attributes),
        }
    }

    pub fn route(id: impl Into<String>, line: Vec<LngLat>, attributes: RouteAttributes) -> Self {
        Self {
            id: id.into(),
            geometry: Some(Geometry::LineString(line)),
            attributes: EntityAttributes::Route(attributes),
        }
    }
}

// ============================================================================
// Snapshots
// ============================================================================

/// One full, timestamped set of entities of a single kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub kind: EntityKind,
    pub entities: Vec<Entity>,
    pub fetched_at: DateTime<Utc>,
    /// Feed header timestamp, when the source reports one.
    pub feed_timestamp: Option<i64>,
    pub metrics: Option<RealtimeMetrics>,
    pub alerts: Vec<AlertInfo>,
}

impl Snapshot {
    pub fn new(kind: EntityKind, entities: Vec<Entity>) -> Self {
        Self {
            kind,
            entities,
            fetched_at: Utc::now(),
            feed_timestamp: None,
            metrics: None,
            alerts: Vec::new(),
        }
    }

    pub fn from_vehicles_response(response: RealtimeVehiclesResponse) -> Self {
        let entities = response.vehicles.into_iter().map(WireVehicle::into_entity).collect();
        Self {
            kind: EntityKind::Vehicle,
            entities,
            fetched_at: Utc::now(),
            feed_timestamp: response.timestamp.and_then(|t| t.as_i64()),
            metrics: response.realtime_metrics,
            alerts: response.alerts,
        }
    }

    /// Converts a GeoJSON feature collection into a route or stop snapshot.
    ///
    /// Features whose geometry cannot be decoded keep `geometry: None`; they are
    /// rejected individually at reconciliation time.
    pub fn from_feature_collection(kind: EntityKind, collection: FeatureCollection) -> Self {
        let entities = collection
            .features
            .into_iter()
            .map(|feature| feature.into_entity(kind))
            .collect();
        Self::new(kind, entities)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

// ============================================================================
// Wire: Realtime Vehicles
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeVehiclesResponse {
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub vehicles: Vec<WireVehicle>,
    #[serde(default)]
    pub realtime_metrics: Option<RealtimeMetrics>,
    #[serde(default)]
    pub alerts: Vec<AlertInfo>,
}

/// A value the backend sends either as text or as a number: enum fields as
/// protobuf names (`"IN_TRANSIT_TO"`) or codes, ids as strings or integers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WireLabel {
    Text(String),
    Code(i64),
}

impl WireLabel {
    fn into_label(self) -> String {
        match self {
            WireLabel::Text(text) => text,
            WireLabel::Code(code) => code.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireVehicle {
    pub id: Option<WireLabel>,
    pub label: Option<String>,
    #[serde(default)]
    pub position: WirePosition,
    pub current_status: Option<WireLabel>,
    pub stop_id: Option<WireLabel>,
    pub congestion_level: Option<WireLabel>,
    pub occupancy_status: Option<WireLabel>,
    #[serde(default)]
    pub trip: WireTrip,
    #[serde(alias = "scheduleDeviationSeconds")]
    pub schedule_deviation: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WirePosition {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub bearing: Option<f64>,
    pub speed: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTrip {
    pub trip_id: Option<WireLabel>,
    pub route_id: Option<WireLabel>,
    pub direction_id: Option<u32>,
}

impl WireVehicle {
    pub fn into_entity(self) -> Entity {
        let geometry = match (self.position.longitude, self.position.latitude) {
            (Some(lng), Some(lat)) => Some(Geometry::Point(LngLat::new(lng, lat))),
            _ => None,
        };
        Entity {
            id: self.id.map(WireLabel::into_label).unwrap_or_default(),
            geometry,
            attributes: EntityAttributes::Vehicle(VehicleAttributes {
                label: self.label,
                bearing: self.position.bearing,
                speed: self.position.speed,
                schedule_deviation_seconds: self.schedule_deviation,
                congestion_level: self.congestion_level.map(WireLabel::into_label),
                occupancy_status: self.occupancy_status.map(WireLabel::into_label),
                current_status: self.current_status.map(WireLabel::into_label),
                trip_id: self.trip.trip_id.map(WireLabel::into_label),
                route_id: self.trip.route_id.map(WireLabel::into_label),
                direction_id: self.trip.direction_id,
                stop_id: self.stop_id.map(WireLabel::into_label),
            }),
        }
    }
}

/// Schedule adherence summary over vehicles that report a deviation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeMetrics {
    pub total_vehicles_reporting_deviation: u32,
    pub on_time_vehicles: u32,
    pub on_time_percentage: f64,
    pub early_vehicles_count: u32,
    pub late_vehicles_count: u32,
    pub average_early_deviation_seconds: f64,
    pub average_late_deviation_seconds: f64,
    pub average_overall_deviation_seconds: f64,
}

impl RealtimeMetrics {
    pub const ON_TIME_EARLY_THRESHOLD: i64 = -60;
    pub const ON_TIME_LATE_THRESHOLD: i64 = 300;

    pub fn from_deviations(deviations: impl IntoIterator<Item = i64>) -> Self {
        let mut total = 0u32;
        let mut on_time = 0u32;
        let mut early: Vec<i64> = Vec::new();
        let mut late: Vec<i64> = Vec::new();
        let mut sum = 0i64;

        for deviation in deviations {
            total += 1;
            sum += deviation;
            if deviation < Self::ON_TIME_EARLY_THRESHOLD {
                early.push(deviation.abs());
            } else if deviation > Self::ON_TIME_LATE_THRESHOLD {
                late.push(deviation);
            } else {
                on_time += 1;
            }
        }

        let mean = |values: &[i64]| {
            if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<i64>() as f64 / values.len() as f64
            }
        };

        Self {
            total_vehicles_reporting_deviation: total,
            on_time_vehicles: on_time,
            on_time_percentage: if total > 0 {
                round2(on_time as f64 / total as f64 * 100.0)
            } else {
                0.0
            },
            early_vehicles_count: early.len() as u32,
            late_vehicles_count: late.len() as u32,
            average_early_deviation_seconds: round2(mean(&early)),
            average_late_deviation_seconds: round2(mean(&late)),
            average_overall_deviation_seconds: if total > 0 {
                round2(sum as f64 / total as f64)
            } else {
                0.0
            },
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertInfo {
    pub id: Option<String>,
    pub cause: Option<Value>,
    pub effect: Option<Value>,
    pub url: Option<String>,
    pub header_text: Option<String>,
    pub description_text: Option<String>,
    pub informed_entities: Vec<Value>,
}

// ============================================================================
// Wire: GeoJSON
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(default)]
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    #[serde(default)]
    pub geometry: Option<Value>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Feature {
    fn property(&self, key: &str) -> Option<String> {
        match self.properties.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn into_entity(self, kind: EntityKind) -> Entity {
        let geometry = self.geometry.as_ref().and_then(Geometry::from_geojson);
        match kind {
            EntityKind::Route => {
                let attributes = RouteAttributes {
                    route_id: self.property("route_id"),
                    color: self.property("route_color"),
                    short_name: self.property("route_short_name"),
                    long_name: self.property("route_long_name"),
                };
                let id = self
                    .property("shape_id")
                    .or_else(|| attributes.route_id.clone())
                    .unwrap_or_default();
                Entity { id, geometry, attributes: EntityAttributes::Route(attributes) }
            }
            EntityKind::Stop => Entity {
                id: self.property("stop_id").unwrap_or_default(),
                geometry,
                attributes: EntityAttributes::Stop(StopAttributes {
                    name: self.property("stop_name"),
                    code: self.property("stop_code"),
                    description: self.property("stop_desc"),
                }),
            },
            EntityKind::Vehicle => Entity {
                id: self.property("id").unwrap_or_default(),
                geometry,
                attributes: EntityAttributes::Vehicle(VehicleAttributes {
                    label: self.property("label"),
                    ..VehicleAttributes::default()
                }),
            },
        }
    }
}

// ============================================================================
// Wire: Validation Report
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    #[serde(default)]
    pub errors: Vec<Value>,
    #[serde(default)]
    pub warnings: Vec<Value>,
    #[serde(default)]
    pub feed_info: Option<Value>,
    #[serde(default)]
    pub metrics: Option<Value>,
    #[serde(default)]
    pub summary: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Json,
    Csv,
}

impl ReportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportFormat::Json => "json",
            ReportFormat::Csv => "csv",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ReportFormat::Json => "application/json",
            ReportFormat::Csv => "text/csv",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_vehicle_payload() {
        let body = r#"{
            "status": "success",
            "timestamp": 1717000000,
            "vehicleCount": 2,
            "vehicles": [
                {
                    "id": "V1",
                    "label": "Bus 12",
                    "position": { "latitude": 33.45, "longitude": -112.07, "bearing": 90.0, "speed": 8.5 },
                    "currentStatus": "IN_TRANSIT_TO",
                    "stopId": "S9",
                    "congestionLevel": 2,
                    "occupancyStatus": "FEW_SEATS_AVAILABLE",
                    "trip": { "tripId": "T1", "routeId": "R1", "directionId": 1 },
                    "scheduleDeviation": 75
                },
                {
                    "id": "V2",
                    "position": { "latitude": 33.40, "longitude": -112.00 },
                    "trip": { "tripId": "T2" },
                    "scheduleDeviation": null
                }
            ],
            "realtimeMetrics": { "on_time_vehicles": 0, "total_vehicles_reporting_deviation": 1 },
            "alerts": [ { "id": "A1", "headerText": "Detour" } ]
        }"#;
        let response: RealtimeVehiclesResponse = serde_json::from_str(body).unwrap();
        let snapshot = Snapshot::from_vehicles_response(response);

        assert_eq!(snapshot.kind, EntityKind::Vehicle);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.feed_timestamp, Some(1717000000));
        assert_eq!(snapshot.alerts.len(), 1);
        assert_eq!(snapshot.metrics.as_ref().unwrap().total_vehicles_reporting_deviation, 1);

        let v1 = &snapshot.entities[0];
        assert_eq!(v1.geometry, Some(Geometry::Point(LngLat::new(-112.07, 33.45))));
        match &v1.attributes {
            EntityAttributes::Vehicle(attrs) => {
                assert_eq!(attrs.schedule_deviation_seconds, Some(75));
                assert_eq!(attrs.congestion_level.as_deref(), Some("2"));
                assert_eq!(attrs.route_id.as_deref(), Some("R1"));
            }
            other => panic!("unexpected attributes {:?}", other),
        }
        match &snapshot.entities[1].attributes {
            EntityAttributes::Vehicle(attrs) => assert_eq!(attrs.schedule_deviation_seconds, None),
            other => panic!("unexpected attributes {:?}", other),
        }
    }

    #[test]
    fn numeric_vehicle_ids_are_accepted() {
        let body = r#"{
            "vehicles": [
                {
                    "id": 4021,
                    "position": { "latitude": 33.45, "longitude": -112.07 },
                    "stopId": 17,
                    "trip": { "tripId": 88001, "routeId": "R1" }
                },
                { "id": "V2", "position": { "latitude": 33.40, "longitude": -112.00 } }
            ]
        }"#;
        let response: RealtimeVehiclesResponse = serde_json::from_str(body).unwrap();
        let snapshot = Snapshot::from_vehicles_response(response);

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.entities[0].id, "4021");
        assert_eq!(snapshot.entities[1].id, "V2");
        let EntityAttributes::Vehicle(attrs) = &snapshot.entities[0].attributes else {
            panic!("expected vehicle attributes");
        };
        assert_eq!(attrs.trip_id.as_deref(), Some("88001"));
        assert_eq!(attrs.stop_id.as_deref(), Some("17"));
    }

    #[test]
    fn parses_route_and_stop_geojson() {
        let routes: FeatureCollection = serde_json::from_str(
            r##"{ "type": "FeatureCollection", "features": [
                { "type": "Feature",
                  "geometry": { "type": "LineString", "coordinates": [[0.0, 0.0], [1.0, 1.0]] },
                  "properties": { "shape_id": "SH1", "route_id": "R1", "route_color": "#FF0000", "route_short_name": "1" } },
                { "type": "Feature", "geometry": null, "properties": { "shape_id": "SH2" } }
            ] }"##,
        )
        .unwrap();
        let snapshot = Snapshot::from_feature_collection(EntityKind::Route, routes);
        assert_eq!(snapshot.entities[0].id, "SH1");
        assert!(snapshot.entities[0].geometry.as_ref().unwrap().is_renderable());
        assert_eq!(snapshot.entities[1].geometry, None);

        let stops: FeatureCollection = serde_json::from_str(
            r#"{ "features": [
                { "geometry": { "type": "Point", "coordinates": [-112.1, 33.5] },
                  "properties": { "stop_id": 42, "stop_name": "Central Station" } }
            ] }"#,
        )
        .unwrap();
        let snapshot = Snapshot::from_feature_collection(EntityKind::Stop, stops);
        assert_eq!(snapshot.entities[0].id, "42");
        assert_eq!(snapshot.entities[0].kind(), EntityKind::Stop);
    }

    #[test]
    fn metrics_use_on_time_window() {
        let metrics = RealtimeMetrics::from_deviations([0, -120, 400, 300, -60]);
        assert_eq!(metrics.total_vehicles_reporting_deviation, 5);
        assert_eq!(metrics.on_time_vehicles, 3);
        assert_eq!(metrics.on_time_percentage, 60.0);
        assert_eq!(metrics.early_vehicles_count, 1);
        assert_eq!(metrics.late_vehicles_count, 1);
        assert_eq!(metrics.average_early_deviation_seconds, 120.0);
        assert_eq!(metrics.average_late_deviation_seconds, 400.0);
        assert_eq!(metrics.average_overall_deviation_seconds, 104.0);
    }

    #[test]
    fn empty_metrics_are_zero() {
        let metrics = RealtimeMetrics::from_deviations(Vec::new());
        assert_eq!(metrics, RealtimeMetrics::default());
    }

    #[test]
    fn kind_parses_plural_names() {
        assert_eq!("vehicles".parse::<EntityKind>(), Ok(EntityKind::Vehicle));
        assert_eq!("Route".parse::<EntityKind>(), Ok(EntityKind::Route));
        assert!("trains".parse::<EntityKind>().is_err());
    }

    #[test]
    fn degenerate_geometry_is_not_renderable() {
        assert!(!Geometry::LineString(vec![LngLat::new(0.0, 0.0)]).is_renderable());
        assert!(!Geometry::Point(LngLat::new(f64::NAN, 0.0)).is_renderable());
        assert!(Geometry::Point(LngLat::new(0.0, 0.0)).is_renderable());
    }
}
