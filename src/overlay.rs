// Live overlay engine: accepts per-kind snapshots, derives styles and
// clusters, and drives one layer reconciler per entity kind through the map
// session. Errors stay per kind; one failing source never touches another
// kind's layer.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cluster::{Cluster, DensityClusterer, OverlayItem};
use crate::config::OverlayConfig;
use crate::error::{FetchFailure, RenderError, SessionError};
use crate::models::{Entity, EntityKind, LngLat, RealtimeMetrics, Snapshot};
use crate::reconciler::{LayerReconciler, LayerState, ReconcileReport, Renderable};
use crate::render::{EventKind, FeatureHandle, LayerEvent, LayerSpec, PopupContent, RenderSurface, Viewport};
use crate::session::{MapSession, SessionState};
use crate::style::StyleResolver;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum KindStatus {
    Idle,
    Ok,
    NotValidated,
    Error(String),
}

/// What happened to a snapshot (or fetch failure) handed to the overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(ReconcileReport),
    /// Accepted, rendered once the session becomes ready.
    Buffered,
    /// Accepted while the kind is hidden; rendered when shown again.
    Stored,
    /// Fetch failed; the previous visual state is left untouched.
    Retained,
    /// Session is destroyed or errored; nothing was applied.
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Selection {
    pub kind: EntityKind,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventOutcome {
    Selected {
        kind: EntityKind,
        entity: Entity,
        popup: PopupContent,
    },
    ClusterSelected {
        id: String,
        members: Vec<String>,
        popup: PopupContent,
    },
    Hovered {
        kind: EntityKind,
        id: String,
        label: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct KindReport {
    pub kind: EntityKind,
    pub visible: bool,
    pub status: KindStatus,
    pub layer: LayerState,
    pub last_updated: Option<DateTime<Utc>>,
    pub entities: usize,
    pub rendered: usize,
    pub metrics: Option<RealtimeMetrics>,
    pub alerts: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverlayStatus {
    pub session: SessionState,
    pub zoom: f64,
    pub clustering: bool,
    pub selection: Option<Selection>,
    pub kinds: Vec<KindReport>,
}

#[derive(Debug)]
struct KindChannel {
    visible: bool,
    status: KindStatus,
    accepted: Option<Snapshot>,
    /// Entity id -> position in `accepted.entities` (first occurrence wins).
    index: HashMap<String, usize>,
    clusters: HashMap<String, Cluster>,
    last_updated: Option<DateTime<Utc>>,
    layer: LayerReconciler,
}

impl KindChannel {
    fn new(kind: EntityKind) -> Self {
        Self {
            visible: true,
            status: KindStatus::Idle,
            accepted: None,
            index: HashMap::new(),
            clusters: HashMap::new(),
            last_updated: None,
            layer: LayerReconciler::new(LayerSpec::for_kind(kind)),
        }
    }

    fn entity(&self, id: &str) -> Option<&Entity> {
        let position = *self.index.get(id)?;
        self.accepted.as_ref()?.entities.get(position)
    }
}

pub struct Overlay<R: RenderSurface> {
    session: MapSession<R>,
    resolver: StyleResolver,
    clusterer: DensityClusterer,
    channels: BTreeMap<EntityKind, KindChannel>,
    selection: Option<Selection>,
    zoom: f64,
}

impl<R: RenderSurface> Overlay<R> {
    pub fn new(session: MapSession<R>, config: &OverlayConfig) -> Self {
        let zoom = session.viewport().zoom;
        let channels = EntityKind::ALL
            .into_iter()
            .map(|kind| (kind, KindChannel::new(kind)))
            .collect();
        Self {
            session,
            resolver: StyleResolver::new(config.deviation),
            clusterer: DensityClusterer::new(config.cluster.clone()),
            channels,
            selection: None,
            zoom,
        }
    }

    pub fn session(&self) -> &MapSession<R> {
        &self.session
    }

    /// Read-only surface access for inspection.
    pub fn surface(&self) -> &R {
        self.session.surface()
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    pub fn is_visible(&self, kind: EntityKind) -> bool {
        self.channels.get(&kind).is_some_and(|c| c.visible)
    }

    pub fn rendered_ids(&self, kind: EntityKind) -> Vec<String> {
        self.channels
            .get(&kind)
            .map(|c| c.layer.rendered_ids())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub fn initialize(&mut self) -> Result<(), SessionError> {
        self.session.initialize()
    }

    /// Completes session start-up and replays every buffered snapshot.
    pub fn on_style_loaded(&mut self) -> Result<Vec<(EntityKind, ReconcileReport)>, SessionError> {
        if !self.session.mark_style_loaded()? {
            return Ok(Vec::new());
        }
        let mut reports = Vec::new();
        for kind in EntityKind::ALL {
            let pending = self
                .channels
                .get(&kind)
                .is_some_and(|c| c.visible && c.accepted.is_some());
            if pending {
                if let Some(report) = self.render(kind) {
                    reports.push((kind, report));
                }
            }
        }
        info!(flushed = reports.len(), "overlay.buffer_flushed");
        Ok(reports)
    }

    /// Releases every layer, handle and listener, then destroys the session.
    pub fn teardown(&mut self) {
        if let Some(surface) = self.session.surface_mut() {
            for (kind, channel) in self.channels.iter_mut() {
                let report = channel.layer.clear(surface);
                log_failures(*kind, &report);
            }
        }
        for channel in self.channels.values_mut() {
            channel.accepted = None;
            channel.index.clear();
            channel.clusters.clear();
        }
        self.selection = None;
        self.session.destroy();
    }

    // ------------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------------

    pub fn apply(&mut self, kind: EntityKind, outcome: Result<Snapshot, FetchFailure>) -> ApplyOutcome {
        if self.session.is_terminal() {
            debug!(%kind, "overlay.snapshot_discarded: session is not live");
            return ApplyOutcome::Discarded;
        }
        let Some(channel) = self.channels.get_mut(&kind) else {
            return ApplyOutcome::Discarded;
        };

        let snapshot = match outcome {
            Ok(snapshot) if snapshot.kind == kind => snapshot,
            Ok(snapshot) => {
                warn!(%kind, got = %snapshot.kind, "overlay.snapshot_kind_mismatch");
                return ApplyOutcome::Discarded;
            }
            Err(failure) => {
                channel.status = if failure.is_not_validated() {
                    KindStatus::NotValidated
                } else {
                    KindStatus::Error(failure.to_string())
                };
                warn!(%kind, error = %failure, "overlay.fetch_failed: keeping last good state");
                return ApplyOutcome::Retained;
            }
        };

        channel.index = index_entities(kind, &snapshot);
        channel.status = KindStatus::Ok;
        channel.last_updated = Some(snapshot.fetched_at);
        channel.accepted = Some(snapshot);

        if !channel.visible {
            return ApplyOutcome::Stored;
        }
        if !self.session.is_ready() {
            debug!(%kind, "overlay.snapshot_buffered");
            return ApplyOutcome::Buffered;
        }
        match self.render(kind) {
            Some(report) => ApplyOutcome::Applied(report),
            None => ApplyOutcome::Buffered,
        }
    }

    /// Reconciles `kind`'s layer against its latest accepted snapshot.
    fn render(&mut self, kind: EntityKind) -> Option<ReconcileReport> {
        let surface = self.session.surface_mut()?;
        let channel = self.channels.get_mut(&kind)?;
        let snapshot = channel.accepted.as_ref()?;

        let mut styled = Vec::with_capacity(snapshot.entities.len());
        for entity in &snapshot.entities {
            if entity.kind() != kind {
                warn!(%kind, id = %entity.id, "overlay.entity_skipped: wrong kind");
                continue;
            }
            match self.resolver.style_entity(entity.clone()) {
                Some(item) => styled.push(item),
                None => warn!(%kind, id = %entity.id, "overlay.entity_skipped: missing geometry"),
            }
        }

        let items: Vec<OverlayItem> = if kind == EntityKind::Vehicle {
            self.clusterer.cluster(styled, self.zoom)
        } else {
            styled.into_iter().map(OverlayItem::Single).collect()
        };
        channel.clusters = items
            .iter()
            .filter_map(|item| match item {
                OverlayItem::Cluster(cluster) => Some((cluster.id.clone(), cluster.clone())),
                OverlayItem::Single(_) => None,
            })
            .collect();

        let report = channel.layer.reconcile(surface, &items);
        for skipped in &report.skipped {
            warn!(%kind, id = %skipped.id, reason = ?skipped.reason, "overlay.entity_skipped");
        }
        log_failures(kind, &report);
        debug!(
            %kind,
            created = report.created.len(),
            removed = report.removed.len(),
            retained = report.retained.len(),
            geometry_updates = report.geometry_updates,
            style_updates = report.style_updates,
            "overlay.reconciled"
        );

        if let Some(selection) = &self.selection {
            if selection.kind == kind && !channel.layer.contains(&selection.id) {
                self.selection = None;
            }
        }
        Some(report)
    }

    // ------------------------------------------------------------------------
    // Visibility & Viewport
    // ------------------------------------------------------------------------

    /// Hiding a kind clears its layer whatever its fetch state; showing it
    /// renders the latest accepted snapshot.
    pub fn set_visibility(&mut self, kind: EntityKind, visible: bool) -> Option<ReconcileReport> {
        let channel = self.channels.get_mut(&kind)?;
        if channel.visible == visible {
            return None;
        }
        channel.visible = visible;
        info!(%kind, visible, "overlay.visibility_changed");

        if visible {
            return self.render(kind);
        }
        if self.selection.as_ref().is_some_and(|s| s.kind == kind) {
            self.selection = None;
        }
        channel.clusters.clear();
        let surface = self.session.surface_mut()?;
        let report = channel.layer.clear(surface);
        log_failures(kind, &report);
        Some(report)
    }

    /// Updates the viewport. Clusters are only recomputed when the zoom
    /// crosses the clustering threshold.
    pub fn set_viewport(&mut self, center: LngLat, zoom: f64) -> Option<ReconcileReport> {
        if let Err(err) = self.session.set_viewport(Viewport { center, zoom }) {
            warn!(error = %err, "overlay.viewport_failed");
        }
        let was_clustering = self.clusterer.is_active(self.zoom);
        self.zoom = zoom;
        if was_clustering == self.clusterer.is_active(zoom) {
            return None;
        }
        if !self.is_visible(EntityKind::Vehicle) {
            return None;
        }
        self.render(EntityKind::Vehicle)
    }

    // ------------------------------------------------------------------------
    // Events & Popups
    // ------------------------------------------------------------------------

    /// Translates a raw surface event on `handle` and handles it.
    pub fn dispatch(&mut self, handle: FeatureHandle, event: EventKind) -> Option<EventOutcome> {
        let event = self.session.surface().dispatch(handle, event)?;
        self.handle_event(&event)
    }

    /// Resolves the event's entity id against the latest accepted snapshot.
    /// Events for ids that are no longer current are ignored.
    pub fn handle_event(&mut self, event: &LayerEvent) -> Option<EventOutcome> {
        let (kind, channel) = self
            .channels
            .iter()
            .find(|(_, channel)| channel.layer.owns_event(event))?;
        let kind = *kind;
        let id = event.entity_id.as_str();
        // Members folded into a cluster and skipped records have no feature.
        if !channel.layer.contains(id) {
            debug!(%kind, id, "overlay.event_ignored: not rendered");
            return None;
        }

        let (item_label, content, outcome) = if let Some(cluster) = channel.clusters.get(id) {
            let content = OverlayItem::Cluster(cluster.clone()).popup_content();
            let outcome = EventOutcome::ClusterSelected {
                id: cluster.id.clone(),
                members: cluster.members.clone(),
                popup: content.clone(),
            };
            (cluster.style.label.clone(), content, outcome)
        } else {
            let entity = channel.entity(id)?;
            let content = self.resolver.popup_content(entity);
            let outcome = EventOutcome::Selected {
                kind,
                entity: entity.clone(),
                popup: content.clone(),
            };
            (self.resolver.resolve(entity).label, content, outcome)
        };

        match event.kind {
            EventKind::Hover => Some(EventOutcome::Hovered {
                kind,
                id: id.to_string(),
                label: item_label,
            }),
            EventKind::Click => {
                self.select(kind, id, content).ok()?;
                Some(outcome)
            }
        }
    }

    fn select(&mut self, kind: EntityKind, id: &str, content: PopupContent) -> Result<(), RenderError> {
        if let Some(previous) = self.selection.clone() {
            if previous.kind != kind || previous.id != id {
                self.close_popup();
            }
        }
        let surface = self.session.surface_mut().ok_or(RenderError::NotReady)?;
        let channel = self.channels.get_mut(&kind).ok_or(RenderError::NotReady)?;
        if channel.layer.open_popup(surface, id, content)? {
            self.selection = Some(Selection {
                kind,
                id: id.to_string(),
            });
        }
        Ok(())
    }

    pub fn close_popup(&mut self) -> bool {
        let Some(selection) = self.selection.take() else {
            return false;
        };
        let Some(surface) = self.session.surface_mut() else {
            return false;
        };
        let Some(channel) = self.channels.get_mut(&selection.kind) else {
            return false;
        };
        match channel.layer.close_popup(surface, &selection.id) {
            Ok(closed) => closed,
            Err(err) => {
                warn!(kind = %selection.kind, id = %selection.id, error = %err, "overlay.popup_close_failed");
                false
            }
        }
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    pub fn status(&self) -> OverlayStatus {
        let kinds = self
            .channels
            .iter()
            .map(|(kind, channel)| KindReport {
                kind: *kind,
                visible: channel.visible,
                status: channel.status.clone(),
                layer: channel.layer.state(),
                last_updated: channel.last_updated,
                entities: channel.accepted.as_ref().map_or(0, Snapshot::len),
                rendered: channel.layer.len(),
                metrics: channel.accepted.as_ref().and_then(|s| s.metrics.clone()),
                alerts: channel.accepted.as_ref().map_or(0, |s| s.alerts.len()),
            })
            .collect();
        OverlayStatus {
            session: self.session.state().clone(),
            zoom: self.zoom,
            clustering: self.clusterer.is_active(self.zoom),
            selection: self.selection.clone(),
            kinds,
        }
    }

    pub fn kind_status(&self, kind: EntityKind) -> Option<&KindStatus> {
        self.channels.get(&kind).map(|c| &c.status)
    }
}

/// Indexes the records the reconciler will accept: a non-empty id, the
/// channel's kind and drawable geometry. The first accepted record for an id
/// wins, so events resolve to the record that was drawn.
fn index_entities(kind: EntityKind, snapshot: &Snapshot) -> HashMap<String, usize> {
    let mut index = HashMap::with_capacity(snapshot.entities.len());
    for (position, entity) in snapshot.entities.iter().enumerate() {
        let drawable = entity.geometry.as_ref().is_some_and(|g| g.is_renderable());
        if entity.id.is_empty() || entity.kind() != kind || !drawable {
            continue;
        }
        if index.contains_key(&entity.id) {
            warn!(%kind, id = %entity.id, "overlay.duplicate_id");
            continue;
        }
        index.insert(entity.id.clone(), position);
    }
    index
}

fn log_failures(kind: EntityKind, report: &ReconcileReport) {
    for failure in &report.failures {
        warn!(
            %kind,
            id = failure.id.as_deref().unwrap_or("-"),
            operation = ?failure.operation,
            error = %failure.error,
            "overlay.render_operation_failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VehicleAttributes;
    use crate::render::{LayerId, SceneRenderer};

    fn ready_overlay() -> Overlay<SceneRenderer> {
        let config = OverlayConfig {
            map_access_token: "pk.test".to_string(),
            ..OverlayConfig::default()
        };
        let mut viewport = config.initial_viewport;
        viewport.zoom = 15.0;
        let session = MapSession::new(
            SceneRenderer::new(),
            config.map_access_token.clone(),
            Viewport {
                center: LngLat::new(viewport.center[0], viewport.center[1]),
                zoom: viewport.zoom,
            },
        );
        let mut overlay = Overlay::new(session, &config);
        overlay.initialize().unwrap();
        overlay.on_style_loaded().unwrap();
        overlay
    }

    fn vehicles(points: &[(&str, f64, f64)]) -> Snapshot {
        Snapshot::new(
            EntityKind::Vehicle,
            points
                .iter()
                .map(|(id, lng, lat)| {
                    Entity::vehicle(*id, LngLat::new(*lng, *lat), VehicleAttributes::default())
                })
                .collect(),
        )
    }

    #[test]
    fn duplicate_ids_index_first_occurrence() {
        let snapshot = vehicles(&[("A", 0.0, 0.0), ("A", 1.0, 1.0), ("", 2.0, 2.0)]);
        let index = index_entities(EntityKind::Vehicle, &snapshot);
        assert_eq!(index.len(), 1);
        assert_eq!(index["A"], 0);
    }

    #[test]
    fn undrawable_records_do_not_claim_an_id() {
        let snapshot = vehicles(&[("A", f64::NAN, 0.0), ("A", 1.0, 1.0), ("B", 2.0, f64::INFINITY)]);
        let index = index_entities(EntityKind::Vehicle, &snapshot);
        assert_eq!(index.len(), 1);
        assert_eq!(index["A"], 1);
    }

    #[test]
    fn click_on_clustered_member_keeps_current_popup() {
        let mut overlay = ready_overlay();
        overlay.set_viewport(LngLat::new(0.0, 0.0), 10.0);
        overlay.apply(
            EntityKind::Vehicle,
            Ok(vehicles(&[("A", 0.001, 0.0), ("B", 0.0012, 0.0), ("FAR", 5.0, 5.0)])),
        );
        assert!(overlay.rendered_ids(EntityKind::Vehicle).contains(&"FAR".to_string()));
        let layer = LayerId::for_kind(EntityKind::Vehicle);
        let click = |id: &str| LayerEvent {
            layer: layer.clone(),
            kind: EventKind::Click,
            entity_id: id.to_string(),
        };

        assert!(overlay.handle_event(&click("FAR")).is_some());
        assert!(overlay.handle_event(&click("A")).is_none());
        assert_eq!(overlay.surface().popups().count(), 1);
        assert_eq!(overlay.selection().map(|s| s.id.as_str()), Some("FAR"));
    }

    #[test]
    fn fetch_failure_sets_status_only() {
        let mut overlay = ready_overlay();
        overlay.apply(EntityKind::Vehicle, Ok(vehicles(&[("A", 0.0, 0.0)])));
        let outcome = overlay.apply(
            EntityKind::Vehicle,
            Err(FetchFailure::Network("connection refused".to_string())),
        );
        assert_eq!(outcome, ApplyOutcome::Retained);
        assert_eq!(overlay.rendered_ids(EntityKind::Vehicle), vec!["A".to_string()]);
        assert!(matches!(
            overlay.kind_status(EntityKind::Vehicle),
            Some(KindStatus::Error(_))
        ));
    }

    #[test]
    fn not_validated_is_distinct_status() {
        let mut overlay = ready_overlay();
        overlay.apply(EntityKind::Route, Err(FetchFailure::NotValidated));
        assert_eq!(overlay.kind_status(EntityKind::Route), Some(&KindStatus::NotValidated));
    }

    #[test]
    fn mismatched_snapshot_kind_is_discarded() {
        let mut overlay = ready_overlay();
        let outcome = overlay.apply(EntityKind::Stop, Ok(vehicles(&[("A", 0.0, 0.0)])));
        assert_eq!(outcome, ApplyOutcome::Discarded);
        assert!(overlay.rendered_ids(EntityKind::Stop).is_empty());
    }

    #[test]
    fn hover_resolves_label_without_popup() {
        let mut overlay = ready_overlay();
        overlay.apply(EntityKind::Vehicle, Ok(vehicles(&[("A", 0.0, 0.0)])));
        let event = LayerEvent {
            layer: LayerId::for_kind(EntityKind::Vehicle),
            kind: EventKind::Hover,
            entity_id: "A".to_string(),
        };
        let outcome = overlay.handle_event(&event).unwrap();
        assert_eq!(
            outcome,
            EventOutcome::Hovered {
                kind: EntityKind::Vehicle,
                id: "A".to_string(),
                label: "A".to_string(),
            }
        );
        assert_eq!(overlay.surface().popups().count(), 0);
        assert!(overlay.selection().is_none());
    }

    #[test]
    fn events_for_unknown_ids_are_ignored() {
        let mut overlay = ready_overlay();
        overlay.apply(EntityKind::Vehicle, Ok(vehicles(&[("A", 0.0, 0.0)])));
        let event = LayerEvent {
            layer: LayerId::for_kind(EntityKind::Vehicle),
            kind: EventKind::Click,
            entity_id: "GONE".to_string(),
        };
        assert!(overlay.handle_event(&event).is_none());
    }

    #[test]
    fn clicking_another_entity_moves_the_popup() {
        let mut overlay = ready_overlay();
        overlay.apply(EntityKind::Vehicle, Ok(vehicles(&[("A", 0.0, 0.0), ("B", 1.0, 1.0)])));
        let layer = LayerId::for_kind(EntityKind::Vehicle);
        for id in ["A", "B"] {
            overlay.handle_event(&LayerEvent {
                layer: layer.clone(),
                kind: EventKind::Click,
                entity_id: id.to_string(),
            });
        }
        assert_eq!(overlay.surface().popups().count(), 1);
        assert_eq!(overlay.selection().map(|s| s.id.as_str()), Some("B"));
        assert!(overlay.close_popup());
        assert_eq!(overlay.surface().popups().count(), 0);
    }
}
