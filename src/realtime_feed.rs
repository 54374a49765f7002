// GTFS-RT decoding: vehicle positions, trip-update schedule deviations and
// service alerts, merged into one vehicle snapshot.

use std::collections::HashMap;

use gtfs_rt::FeedMessage;
use prost::Message;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::FetchFailure;
use crate::models::{
    AlertInfo, Entity, EntityAttributes, EntityKind, Geometry, LngLat, RealtimeMetrics, Snapshot,
    VehicleAttributes,
};

pub fn decode_feed(body: &[u8]) -> Result<FeedMessage, FetchFailure> {
    FeedMessage::decode(body).map_err(|e| FetchFailure::Parse(format!("failed to decode GTFS-RT feed: {}", e)))
}

/// Builds the vehicle snapshot from the three realtime feeds.
///
/// Trip updates and alerts are optional; without trip updates every vehicle
/// resolves to "no data".
pub fn vehicle_snapshot(
    positions: &FeedMessage,
    trip_updates: Option<&FeedMessage>,
    alerts: Option<&FeedMessage>,
) -> Snapshot {
    let mut entities = vehicles_from_feed(positions);
    let deviations = trip_updates.map(schedule_deviations).unwrap_or_default();
    let metrics = merge_deviations(&mut entities, &deviations);

    let mut snapshot = Snapshot::new(EntityKind::Vehicle, entities);
    snapshot.feed_timestamp = positions.header.timestamp.map(|t| t as i64);
    snapshot.metrics = Some(metrics);
    snapshot.alerts = alerts.map(alerts_from_feed).unwrap_or_default();
    snapshot
}

/// Vehicles with a position and a trip id. Deviation is left empty.
pub fn vehicles_from_feed(feed: &FeedMessage) -> Vec<Entity> {
    feed.entity
        .iter()
        .filter_map(|entity| {
            let vehicle = entity.vehicle.as_ref()?;
            let Some(position) = vehicle.position.as_ref() else {
                debug!(entity = %entity.id, "realtime_feed.vehicle_without_position");
                return None;
            };
            let trip = vehicle.trip.as_ref();
            let Some(trip_id) = trip.and_then(|t| t.trip_id.clone()) else {
                debug!(entity = %entity.id, "realtime_feed.vehicle_without_trip");
                return None;
            };

            let descriptor = vehicle.vehicle.as_ref();
            let id = descriptor
                .and_then(|v| v.id.clone())
                .unwrap_or_else(|| entity.id.clone());

            Some(Entity {
                id,
                geometry: Some(Geometry::Point(LngLat::new(
                    position.longitude as f64,
                    position.latitude as f64,
                ))),
                attributes: EntityAttributes::Vehicle(VehicleAttributes {
                    label: descriptor.and_then(|v| v.label.clone()),
                    bearing: position.bearing.map(f64::from),
                    speed: position.speed.map(f64::from),
                    schedule_deviation_seconds: None,
                    congestion_level: vehicle.congestion_level.map(|c| congestion_level_name(c).to_string()),
                    occupancy_status: vehicle.occupancy_status.map(|o| occupancy_status_name(o).to_string()),
                    current_status: vehicle.current_status.map(|s| stop_status_name(s).to_string()),
                    trip_id: Some(trip_id),
                    route_id: trip.and_then(|t| t.route_id.clone()),
                    direction_id: trip.and_then(|t| t.direction_id),
                    stop_id: vehicle.stop_id.clone(),
                }),
            })
        })
        .collect()
}

/// trip id -> seconds behind schedule, from the latest stop-time update
/// (by stop sequence) that reports a delay.
pub fn schedule_deviations(feed: &FeedMessage) -> HashMap<String, i64> {
    let mut deviations = HashMap::new();
    for entity in &feed.entity {
        let Some(update) = entity.trip_update.as_ref() else {
            continue;
        };
        let Some(trip_id) = update.trip.trip_id.clone() else {
            continue;
        };

        let mut updates: Vec<_> = update.stop_time_update.iter().collect();
        updates.sort_by_key(|stu| stu.stop_sequence.unwrap_or(0));
        let delay = updates.iter().rev().find_map(|stu| {
            stu.arrival
                .as_ref()
                .and_then(|a| a.delay)
                .or_else(|| stu.departure.as_ref().and_then(|d| d.delay))
        });

        if let Some(delay) = delay {
            deviations.insert(trip_id, i64::from(delay));
        }
    }
    deviations
}

/// Writes each vehicle's trip deviation and summarizes the vehicles that got one.
pub fn merge_deviations(entities: &mut [Entity], deviations: &HashMap<String, i64>) -> RealtimeMetrics {
    let mut reported = Vec::new();
    for entity in entities.iter_mut() {
        let EntityAttributes::Vehicle(attrs) = &mut entity.attributes else {
            continue;
        };
        let deviation = attrs.trip_id.as_ref().and_then(|trip| deviations.get(trip)).copied();
        if let Some(deviation) = deviation {
            attrs.schedule_deviation_seconds = Some(deviation);
            reported.push(deviation);
        }
    }
    RealtimeMetrics::from_deviations(reported)
}

pub fn alerts_from_feed(feed: &FeedMessage) -> Vec<AlertInfo> {
    feed.entity
        .iter()
        .filter_map(|entity| {
            let alert = entity.alert.as_ref()?;
            let first_text = |text: &Option<gtfs_rt::TranslatedString>| {
                text.as_ref()
                    .and_then(|t| t.translation.first().map(|tr| tr.text.clone()))
            };

            let informed_entities = alert
                .informed_entity
                .iter()
                .map(|selector| {
                    json!({
                        "agencyId": selector.agency_id,
                        "routeId": selector.route_id,
                        "stopId": selector.stop_id,
                    })
                })
                .collect();

            Some(AlertInfo {
                id: Some(entity.id.clone()),
                cause: alert.cause.map(|c| Value::from(alert_cause_name(c))),
                effect: alert.effect.map(|e| Value::from(alert_effect_name(e))),
                url: first_text(&alert.url),
                header_text: first_text(&alert.header_text),
                description_text: first_text(&alert.description_text),
                informed_entities,
            })
        })
        .collect()
}

// ============================================================================
// Enum Names
// ============================================================================

fn stop_status_name(code: i32) -> &'static str {
    match code {
        0 => "INCOMING_AT",
        1 => "STOPPED_AT",
        2 => "IN_TRANSIT_TO",
        _ => "UNKNOWN",
    }
}

fn congestion_level_name(code: i32) -> &'static str {
    match code {
        1 => "RUNNING_SMOOTHLY",
        2 => "STOP_AND_GO",
        3 => "CONGESTION",
        4 => "SEVERE_CONGESTION",
        _ => "UNKNOWN_CONGESTION_LEVEL",
    }
}

fn occupancy_status_name(code: i32) -> &'static str {
    match code {
        0 => "EMPTY",
        1 => "MANY_SEATS_AVAILABLE",
        2 => "FEW_SEATS_AVAILABLE",
        3 => "STANDING_ROOM_ONLY",
        4 => "CRUSHED_STANDING_ROOM_ONLY",
        5 => "FULL",
        6 => "NOT_ACCEPTING_PASSENGERS",
        7 => "NO_DATA_AVAILABLE",
        8 => "NOT_BOARDABLE",
        _ => "UNKNOWN",
    }
}

fn alert_cause_name(code: i32) -> &'static str {
    match code {
        2 => "OTHER_CAUSE",
        3 => "TECHNICAL_PROBLEM",
        4 => "STRIKE",
        5 => "DEMONSTRATION",
        6 => "ACCIDENT",
        7 => "HOLIDAY",
        8 => "WEATHER",
        9 => "MAINTENANCE",
        10 => "CONSTRUCTION",
        11 => "POLICE_ACTIVITY",
        12 => "MEDICAL_EMERGENCY",
        _ => "UNKNOWN_CAUSE",
    }
}

fn alert_effect_name(code: i32) -> &'static str {
    match code {
        1 => "NO_SERVICE",
        2 => "REDUCED_SERVICE",
        3 => "SIGNIFICANT_DELAYS",
        4 => "DETOUR",
        5 => "ADDITIONAL_SERVICE",
        6 => "MODIFIED_SERVICE",
        7 => "OTHER_EFFECT",
        9 => "STOP_MOVED",
        10 => "NO_EFFECT",
        11 => "ACCESSIBILITY_ISSUE",
        _ => "UNKNOWN_EFFECT",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gtfs_rt::trip_update::{StopTimeEvent, StopTimeUpdate};
    use gtfs_rt::{
        translated_string::Translation, Alert, EntitySelector, FeedEntity, FeedHeader, Position,
        TranslatedString, TripDescriptor, TripUpdate, VehicleDescriptor, VehiclePosition,
    };

    fn header() -> FeedHeader {
        FeedHeader {
            gtfs_realtime_version: "2.0".to_string(),
            timestamp: Some(1_700_000_000),
            ..Default::default()
        }
    }

    fn vehicle_entity(id: &str, trip: Option<&str>, position: Option<(f32, f32)>) -> FeedEntity {
        FeedEntity {
            id: format!("e-{}", id),
            vehicle: Some(VehiclePosition {
                trip: trip.map(|t| TripDescriptor {
                    trip_id: Some(t.to_string()),
                    route_id: Some("R1".to_string()),
                    ..Default::default()
                }),
                vehicle: Some(VehicleDescriptor {
                    id: Some(id.to_string()),
                    label: Some(format!("Bus {}", id)),
                    ..Default::default()
                }),
                position: position.map(|(lat, lng)| Position {
                    latitude: lat,
                    longitude: lng,
                    ..Default::default()
                }),
                congestion_level: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn stop_update(sequence: u32, arrival: Option<i32>, departure: Option<i32>) -> StopTimeUpdate {
        StopTimeUpdate {
            stop_sequence: Some(sequence),
            arrival: arrival.map(|delay| StopTimeEvent {
                delay: Some(delay),
                ..Default::default()
            }),
            departure: departure.map(|delay| StopTimeEvent {
                delay: Some(delay),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn trip_update_entity(trip: &str, updates: Vec<StopTimeUpdate>) -> FeedEntity {
        FeedEntity {
            id: format!("tu-{}", trip),
            trip_update: Some(TripUpdate {
                trip: TripDescriptor {
                    trip_id: Some(trip.to_string()),
                    ..Default::default()
                },
                stop_time_update: updates,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn keeps_only_vehicles_with_position_and_trip() {
        let feed = FeedMessage {
            header: header(),
            entity: vec![
                vehicle_entity("A", Some("T1"), Some((33.45, -112.07))),
                vehicle_entity("B", None, Some((33.45, -112.07))),
                vehicle_entity("C", Some("T3"), None),
            ],
        };
        let vehicles = vehicles_from_feed(&feed);
        assert_eq!(vehicles.len(), 1);
        assert_eq!(vehicles[0].id, "A");
        let EntityAttributes::Vehicle(attrs) = &vehicles[0].attributes else {
            panic!("expected vehicle attributes");
        };
        assert_eq!(attrs.congestion_level.as_deref(), Some("STOP_AND_GO"));
        assert_eq!(attrs.label.as_deref(), Some("Bus A"));
    }

    #[test]
    fn deviation_comes_from_highest_sequence_with_delay() {
        let feed = FeedMessage {
            header: header(),
            entity: vec![
                trip_update_entity("T1", vec![stop_update(3, None, None), stop_update(1, Some(30), None), stop_update(2, None, Some(240))]),
                trip_update_entity("T2", vec![stop_update(1, Some(-90), Some(10))]),
                trip_update_entity("T3", vec![stop_update(1, None, None)]),
            ],
        };
        let deviations = schedule_deviations(&feed);
        assert_eq!(deviations.get("T1"), Some(&240));
        assert_eq!(deviations.get("T2"), Some(&-90));
        assert!(!deviations.contains_key("T3"));
    }

    #[test]
    fn snapshot_merges_deviations_and_metrics() {
        let positions = FeedMessage {
            header: header(),
            entity: vec![
                vehicle_entity("A", Some("T1"), Some((33.45, -112.07))),
                vehicle_entity("B", Some("T2"), Some((33.46, -112.08))),
                vehicle_entity("C", Some("T9"), Some((33.47, -112.09))),
            ],
        };
        let updates = FeedMessage {
            header: header(),
            entity: vec![
                trip_update_entity("T1", vec![stop_update(1, Some(400), None)]),
                trip_update_entity("T2", vec![stop_update(1, Some(0), None)]),
            ],
        };
        let bytes = positions.encode_to_vec();
        let decoded = decode_feed(&bytes).unwrap();

        let snapshot = vehicle_snapshot(&decoded, Some(&updates), None);
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.feed_timestamp, Some(1_700_000_000));
        let metrics = snapshot.metrics.unwrap();
        assert_eq!(metrics.total_vehicles_reporting_deviation, 2);
        assert_eq!(metrics.on_time_vehicles, 1);
        assert_eq!(metrics.late_vehicles_count, 1);
        assert_eq!(metrics.on_time_percentage, 50.0);

        let unreported = snapshot.entities.iter().find(|e| e.id == "C").unwrap();
        let EntityAttributes::Vehicle(attrs) = &unreported.attributes else {
            panic!("expected vehicle attributes");
        };
        assert_eq!(attrs.schedule_deviation_seconds, None);
    }

    #[test]
    fn alerts_take_first_translation() {
        let text = |s: &str| TranslatedString {
            translation: vec![Translation {
                text: s.to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let feed = FeedMessage {
            header: header(),
            entity: vec![FeedEntity {
                id: "alert-1".to_string(),
                alert: Some(Alert {
                    cause: Some(10),
                    effect: Some(4),
                    header_text: Some(text("Detour on Route 1")),
                    informed_entity: vec![EntitySelector {
                        route_id: Some("R1".to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            }],
        };
        let alerts = alerts_from_feed(&feed);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].header_text.as_deref(), Some("Detour on Route 1"));
        assert_eq!(alerts[0].cause, Some(Value::from("CONSTRUCTION")));
        assert_eq!(alerts[0].effect, Some(Value::from("DETOUR")));
        assert_eq!(alerts[0].informed_entities[0]["routeId"], "R1");
    }

    #[test]
    fn garbage_bytes_are_a_parse_failure() {
        let err = decode_feed(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, FetchFailure::Parse(_)));
    }
}
