// Style Resolver: pure mapping from entity attributes to visual style.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::Serialize;

use crate::config::DeviationThresholds;
use crate::models::{Entity, EntityAttributes, Geometry, RouteAttributes, StopAttributes, VehicleAttributes};
use crate::reconciler::Renderable;
use crate::render::PopupContent;

pub const ON_TIME_COLOR: &str = "#22c55e";
pub const MINOR_DELAY_COLOR: &str = "#eab308";
pub const MAJOR_DELAY_COLOR: &str = "#ef4444";
pub const NO_DATA_COLOR: &str = "#9ca3af";
pub const STOP_COLOR: &str = "#1d4ed8";
pub const DEFAULT_ROUTE_COLOR: &str = "#000000";

const VEHICLE_RADIUS: u8 = 8;
const STOP_RADIUS: u8 = 5;
const ROUTE_WIDTH: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviationStatus {
    OnTime,
    MinorDelay,
    MajorDelay,
    NoData,
}

impl DeviationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviationStatus::OnTime => "on-time",
            DeviationStatus::MinorDelay => "minor-delay",
            DeviationStatus::MajorDelay => "major-delay",
            DeviationStatus::NoData => "no-data",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            DeviationStatus::OnTime => ON_TIME_COLOR,
            DeviationStatus::MinorDelay => MINOR_DELAY_COLOR,
            DeviationStatus::MajorDelay => MAJOR_DELAY_COLOR,
            DeviationStatus::NoData => NO_DATA_COLOR,
        }
    }
}

impl fmt::Display for DeviationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Visual style of one rendered feature.
///
/// For point features `radius` is the circle radius in pixels, for lines it
/// is the stroke width.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Style {
    pub fill_color: String,
    pub outline_color: Option<String>,
    pub radius: u8,
    pub pulse: bool,
    pub label: String,
    pub status: Option<DeviationStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StyleFingerprint(pub u64);

impl Style {
    pub fn fingerprint(&self) -> StyleFingerprint {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        StyleFingerprint(hasher.finish())
    }
}

/// An entity paired with everything derived from it for one render cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct StyledEntity {
    pub entity: Entity,
    pub geometry: Geometry,
    pub style: Style,
    pub popup: PopupContent,
}

impl Renderable for StyledEntity {
    fn render_id(&self) -> &str {
        &self.entity.id
    }

    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn style(&self) -> &Style {
        &self.style
    }

    fn popup_content(&self) -> PopupContent {
        self.popup.clone()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StyleResolver {
    thresholds: DeviationThresholds,
}

impl StyleResolver {
    pub fn new(thresholds: DeviationThresholds) -> Self {
        Self { thresholds }
    }

    /// Unknown deviation is `NoData`, never a delay category.
    pub fn classify(&self, deviation_secs: Option<i64>) -> DeviationStatus {
        let Some(deviation) = deviation_secs else {
            return DeviationStatus::NoData;
        };
        let magnitude = deviation.abs();
        if magnitude <= self.thresholds.on_time_secs {
            DeviationStatus::OnTime
        } else if magnitude <= self.thresholds.minor_delay_secs {
            DeviationStatus::MinorDelay
        } else {
            DeviationStatus::MajorDelay
        }
    }

    pub fn is_pulsing(&self, deviation_secs: Option<i64>) -> bool {
        deviation_secs.is_some_and(|d| d.abs() > self.thresholds.pulse_secs)
    }

    pub fn resolve(&self, entity: &Entity) -> Style {
        match &entity.attributes {
            EntityAttributes::Vehicle(attrs) => self.vehicle_style(&entity.id, attrs),
            EntityAttributes::Route(attrs) => route_style(&entity.id, attrs),
            EntityAttributes::Stop(attrs) => stop_style(&entity.id, attrs),
        }
    }

    fn vehicle_style(&self, id: &str, attrs: &VehicleAttributes) -> Style {
        let status = self.classify(attrs.schedule_deviation_seconds);
        Style {
            fill_color: status.color().to_string(),
            outline_color: congestion_outline(attrs.congestion_level.as_deref()).map(str::to_string),
            radius: occupancy_radius(attrs.occupancy_status.as_deref()),
            pulse: self.is_pulsing(attrs.schedule_deviation_seconds),
            label: attrs.label.clone().unwrap_or_else(|| id.to_string()),
            status: Some(status),
        }
    }

    /// Returns `None` when the entity has no geometry to draw.
    pub fn style_entity(&self, entity: Entity) -> Option<StyledEntity> {
        let geometry = entity.geometry.clone()?;
        let style = self.resolve(&entity);
        let popup = self.popup_content(&entity);
        Some(StyledEntity {
            entity,
            geometry,
            style,
            popup,
        })
    }

    /// Popup body for an entity, rendered from its current attributes.
    pub fn popup_content(&self, entity: &Entity) -> PopupContent {
        let style = self.resolve(entity);
        let mut rows: Vec<(String, String)> = Vec::new();
        let mut push = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                rows.push((key.to_string(), value));
            }
        };

        match &entity.attributes {
            EntityAttributes::Vehicle(attrs) => {
                push("Vehicle", Some(entity.id.clone()));
                push("Route", attrs.route_id.clone());
                push("Trip", attrs.trip_id.clone());
                push("Direction", attrs.direction_id.map(|d| d.to_string()));
                push("Status", attrs.current_status.clone());
                push("Stop", attrs.stop_id.clone());
                push("Schedule", Some(describe_deviation(attrs.schedule_deviation_seconds)));
                push("Speed", attrs.speed.map(|s| format!("{:.1} m/s", s)));
                push("Bearing", attrs.bearing.map(|b| format!("{:.0}°", b)));
                push("Congestion", attrs.congestion_level.clone());
                push("Occupancy", attrs.occupancy_status.clone());
            }
            EntityAttributes::Route(attrs) => {
                push("Route", attrs.route_id.clone());
                push("Name", attrs.long_name.clone());
                push("Shape", Some(entity.id.clone()));
                push("Color", Some(style.fill_color.clone()));
            }
            EntityAttributes::Stop(attrs) => {
                push("Stop", Some(entity.id.clone()));
                push("Code", attrs.code.clone());
                push("Description", attrs.description.clone());
            }
        }

        PopupContent {
            title: style.label,
            rows,
        }
    }
}

fn route_style(id: &str, attrs: &RouteAttributes) -> Style {
    Style {
        fill_color: normalize_hex_color(attrs.color.as_deref())
            .unwrap_or_else(|| DEFAULT_ROUTE_COLOR.to_string()),
        outline_color: None,
        radius: ROUTE_WIDTH,
        pulse: false,
        label: attrs
            .short_name
            .clone()
            .or_else(|| attrs.long_name.clone())
            .unwrap_or_else(|| id.to_string()),
        status: None,
    }
}

fn stop_style(id: &str, attrs: &StopAttributes) -> Style {
    Style {
        fill_color: STOP_COLOR.to_string(),
        outline_color: None,
        radius: STOP_RADIUS,
        pulse: false,
        label: attrs.name.clone().unwrap_or_else(|| id.to_string()),
        status: None,
    }
}

/// `"ff0000"` / `"#FF0000"` -> `"#FF0000"`; anything else is rejected.
pub fn normalize_hex_color(raw: Option<&str>) -> Option<String> {
    let hex = raw?.trim().trim_start_matches('#');
    if hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(format!("#{}", hex))
    } else {
        None
    }
}

// GTFS-RT CongestionLevel, by name or numeric code.
fn congestion_outline(level: Option<&str>) -> Option<&'static str> {
    match level? {
        "STOP_AND_GO" | "2" => Some("#f97316"),
        "CONGESTION" | "SEVERE_CONGESTION" | "3" | "4" => Some("#7f1d1d"),
        _ => None,
    }
}

// GTFS-RT OccupancyStatus, by name or numeric code.
fn occupancy_radius(status: Option<&str>) -> u8 {
    match status {
        Some("STANDING_ROOM_ONLY" | "3") => VEHICLE_RADIUS + 1,
        Some("CRUSHED_STANDING_ROOM_ONLY" | "FULL" | "NOT_ACCEPTING_PASSENGERS" | "4" | "5" | "6") => {
            VEHICLE_RADIUS + 2
        }
        _ => VEHICLE_RADIUS,
    }
}

fn describe_deviation(deviation_secs: Option<i64>) -> String {
    match deviation_secs {
        None => "no data".to_string(),
        Some(0) => "on schedule".to_string(),
        Some(d) if d > 0 => format!("{}s late", d),
        Some(d) => format!("{}s early", d.abs()),
    }
}
