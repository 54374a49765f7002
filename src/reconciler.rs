// Overlay Reconciler: maps successive snapshots of one layer onto the
// rendering surface with the fewest create / update / remove operations.
//
// One routine serves every kind of renderable item: plain entities (routes,
// stops, vehicles) and synthesized clusters alike. Items are identified by
// string id only; surface handles never leave this module.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::error::RenderError;
use crate::models::Geometry;
use crate::render::{
    EventKind, FeatureHandle, FeatureSpec, LayerEvent, LayerId, LayerSpec, ListenerHandle,
    PopupContent, PopupHandle, RenderSurface,
};
use crate::style::{Style, StyleFingerprint};

/// Anything the reconciler can place on a layer.
pub trait Renderable {
    fn render_id(&self) -> &str;
    fn geometry(&self) -> &Geometry;
    fn style(&self) -> &Style;
    fn popup_content(&self) -> PopupContent;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerState {
    Empty,
    Populated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    EmptyId,
    DuplicateId,
    InvalidGeometry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedItem {
    pub id: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    AttachLayer,
    DetachLayer,
    Create,
    Remove,
    SetGeometry,
    SetStyle,
    Subscribe,
    Unsubscribe,
    OpenPopup,
    RefreshPopup,
    ClosePopup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationFailure {
    pub id: Option<String>,
    pub operation: Operation,
    pub error: RenderError,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub created: Vec<String>,
    pub removed: Vec<String>,
    /// Ids present in both the previous and the new item set.
    pub retained: Vec<String>,
    pub geometry_updates: usize,
    pub style_updates: usize,
    pub popup_refreshes: usize,
    pub skipped: Vec<SkippedItem>,
    pub failures: Vec<OperationFailure>,
}

impl ReconcileReport {
    /// True when the pass changed nothing on the surface.
    pub fn is_noop(&self) -> bool {
        self.created.is_empty()
            && self.removed.is_empty()
            && self.geometry_updates == 0
            && self.style_updates == 0
            && self.popup_refreshes == 0
    }

    pub fn mutation_count(&self) -> usize {
        self.created.len()
            + self.removed.len()
            + self.geometry_updates
            + self.style_updates
            + self.popup_refreshes
    }

    fn fail(&mut self, id: Option<&str>, operation: Operation, error: RenderError) {
        self.failures.push(OperationFailure {
            id: id.map(str::to_string),
            operation,
            error,
        });
    }
}

#[derive(Debug, Clone)]
struct OpenPopup {
    handle: PopupHandle,
    content: PopupContent,
}

#[derive(Debug, Clone)]
struct RenderedEntry {
    handle: FeatureHandle,
    geometry: Geometry,
    fingerprint: StyleFingerprint,
    popup: Option<OpenPopup>,
}

/// Owned table of everything one layer has put on the surface.
#[derive(Debug)]
pub struct LayerReconciler {
    spec: LayerSpec,
    attached: bool,
    entries: HashMap<String, RenderedEntry>,
    listeners: Vec<ListenerHandle>,
}

impl LayerReconciler {
    pub fn new(spec: LayerSpec) -> Self {
        Self {
            spec,
            attached: false,
            entries: HashMap::new(),
            listeners: Vec::new(),
        }
    }

    pub fn layer_id(&self) -> &LayerId {
        &self.spec.id
    }

    pub fn state(&self) -> LayerState {
        if self.attached {
            LayerState::Populated
        } else {
            LayerState::Empty
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn rendered_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Id of the item whose popup is currently open on this layer.
    pub fn open_popup_id(&self) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.popup.is_some())
            .map(|(id, _)| id.as_str())
    }

    pub fn owns_event(&self, event: &LayerEvent) -> bool {
        self.attached && event.layer == self.spec.id
    }

    /// Adds the layer and registers its click / hover listeners, once.
    ///
    /// Attaching is all or nothing: if a listener cannot be registered, the
    /// ones already registered and the layer are taken down again so the
    /// next pass retries from scratch.
    fn attach<S: RenderSurface + ?Sized>(&mut self, surface: &mut S) -> Result<(), RenderError> {
        if self.attached {
            return Ok(());
        }
        surface.add_layer(&self.spec)?;
        let mut listeners = Vec::with_capacity(2);
        for event in [EventKind::Click, EventKind::Hover] {
            match surface.subscribe(&self.spec.id, event) {
                Ok(listener) => listeners.push(listener),
                Err(err) => {
                    for listener in listeners {
                        let _ = surface.unsubscribe(listener);
                    }
                    let _ = surface.remove_layer(&self.spec.id);
                    return Err(err);
                }
            }
        }
        self.listeners = listeners;
        self.attached = true;
        Ok(())
    }

    /// Applies one full item set.
    ///
    /// Every operation is attempted even when an earlier one fails; failures
    /// are collected in the report and the table only records what the
    /// surface accepted, so the next pass corrects any gap.
    pub fn reconcile<S, T>(&mut self, surface: &mut S, items: &[T]) -> ReconcileReport
    where
        S: RenderSurface + ?Sized,
        T: Renderable,
    {
        let mut report = ReconcileReport::default();

        if let Err(err) = self.attach(surface) {
            report.fail(None, Operation::AttachLayer, err);
            if !self.attached {
                return report;
            }
        }

        let mut seen: HashSet<&str> = HashSet::with_capacity(items.len());
        let mut accepted: Vec<&T> = Vec::with_capacity(items.len());
        for item in items {
            let id = item.render_id();
            let reason = if id.is_empty() {
                Some(SkipReason::EmptyId)
            } else if !item.geometry().is_renderable() {
                Some(SkipReason::InvalidGeometry)
            } else if !seen.insert(id) {
                Some(SkipReason::DuplicateId)
            } else {
                None
            };
            match reason {
                Some(reason) => report.skipped.push(SkippedItem { id: id.to_string(), reason }),
                None => accepted.push(item),
            }
        }

        // Removals first, so an id freed in this pass is never confused with
        // a new item carrying the same id.
        let mut stale: Vec<String> = self
            .entries
            .keys()
            .filter(|id| !seen.contains(id.as_str()))
            .cloned()
            .collect();
        stale.sort();
        for id in stale {
            if self.release_entry(surface, &id, &mut report) {
                report.removed.push(id);
            }
        }

        for item in accepted {
            let id = item.render_id();
            if self.entries.contains_key(id) {
                self.update_entry(surface, item, &mut report);
                report.retained.push(id.to_string());
            } else {
                self.create_entry(surface, item, &mut report);
            }
        }

        report
    }

    fn create_entry<S, T>(&mut self, surface: &mut S, item: &T, report: &mut ReconcileReport)
    where
        S: RenderSurface + ?Sized,
        T: Renderable,
    {
        let id = item.render_id();
        let spec = FeatureSpec {
            entity_id: id,
            geometry: item.geometry(),
            style: item.style(),
        };
        match surface.create_feature(&self.spec.id, spec) {
            Ok(handle) => {
                self.entries.insert(
                    id.to_string(),
                    RenderedEntry {
                        handle,
                        geometry: item.geometry().clone(),
                        fingerprint: item.style().fingerprint(),
                        popup: None,
                    },
                );
                report.created.push(id.to_string());
            }
            Err(err) => report.fail(Some(id), Operation::Create, err),
        }
    }

    fn update_entry<S, T>(&mut self, surface: &mut S, item: &T, report: &mut ReconcileReport)
    where
        S: RenderSurface + ?Sized,
        T: Renderable,
    {
        let id = item.render_id();
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };

        if entry.geometry != *item.geometry() {
            match surface.set_geometry(entry.handle, item.geometry()) {
                Ok(()) => {
                    entry.geometry = item.geometry().clone();
                    report.geometry_updates += 1;
                }
                Err(err) => report.fail(Some(id), Operation::SetGeometry, err),
            }
        }

        let fingerprint = item.style().fingerprint();
        if entry.fingerprint != fingerprint {
            match surface.set_style(entry.handle, item.style()) {
                Ok(()) => {
                    entry.fingerprint = fingerprint;
                    report.style_updates += 1;
                }
                Err(err) => report.fail(Some(id), Operation::SetStyle, err),
            }
        }

        // An open popup is refreshed in place, never closed and reopened.
        if let Some(popup) = entry.popup.as_mut() {
            let content = item.popup_content();
            if popup.content != content {
                match surface.set_popup_content(popup.handle, &content) {
                    Ok(()) => {
                        popup.content = content;
                        report.popup_refreshes += 1;
                    }
                    Err(err) => report.fail(Some(id), Operation::RefreshPopup, err),
                }
            }
        }
    }

    /// Releases the handle for `id` and any popup bound to it.
    ///
    /// The entry leaves the table before the surface is touched, so a second
    /// call for the same id is a no-op returning `false`.
    fn release_entry<S: RenderSurface + ?Sized>(
        &mut self,
        surface: &mut S,
        id: &str,
        report: &mut ReconcileReport,
    ) -> bool {
        let Some(entry) = self.entries.remove(id) else {
            return false;
        };
        if let Some(popup) = entry.popup {
            if let Err(err) = surface.close_popup(popup.handle) {
                report.fail(Some(id), Operation::ClosePopup, err);
            }
        }
        if let Err(err) = surface.remove_feature(entry.handle) {
            report.fail(Some(id), Operation::Remove, err);
        }
        true
    }

    pub fn release<S: RenderSurface + ?Sized>(&mut self, surface: &mut S, id: &str) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        if self.release_entry(surface, id, &mut report) {
            report.removed.push(id.to_string());
        }
        report
    }

    /// Opens (or refreshes) the popup for `id`.
    pub fn open_popup<S: RenderSurface + ?Sized>(
        &mut self,
        surface: &mut S,
        id: &str,
        content: PopupContent,
    ) -> Result<bool, RenderError> {
        let Some(entry) = self.entries.get_mut(id) else {
            return Ok(false);
        };
        match entry.popup.as_mut() {
            Some(popup) => {
                if popup.content != content {
                    surface.set_popup_content(popup.handle, &content)?;
                    popup.content = content;
                }
            }
            None => {
                let handle = surface.open_popup(entry.handle, &content)?;
                entry.popup = Some(OpenPopup { handle, content });
            }
        }
        Ok(true)
    }

    pub fn close_popup<S: RenderSurface + ?Sized>(
        &mut self,
        surface: &mut S,
        id: &str,
    ) -> Result<bool, RenderError> {
        let Some(popup) = self.entries.get_mut(id).and_then(|entry| entry.popup.take()) else {
            return Ok(false);
        };
        surface.close_popup(popup.handle)?;
        Ok(true)
    }

    /// Releases every handle, unregisters listeners and detaches the layer.
    pub fn clear<S: RenderSurface + ?Sized>(&mut self, surface: &mut S) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        for id in ids {
            if self.release_entry(surface, &id, &mut report) {
                report.removed.push(id);
            }
        }
        for listener in self.listeners.drain(..) {
            if let Err(err) = surface.unsubscribe(listener) {
                report.fail(None, Operation::Unsubscribe, err);
            }
        }
        if self.attached {
            if let Err(err) = surface.remove_layer(&self.spec.id) {
                report.fail(None, Operation::DetachLayer, err);
            }
            self.attached = false;
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityKind, LngLat};
    use crate::render::{SceneRenderer, Viewport};

    #[derive(Debug, Clone)]
    struct Dot {
        id: String,
        geometry: Geometry,
        style: Style,
    }

    impl Dot {
        fn new(id: &str, x: f64, y: f64, color: &str) -> Self {
            Self {
                id: id.to_string(),
                geometry: Geometry::Point(LngLat::new(x, y)),
                style: Style {
                    fill_color: color.to_string(),
                    outline_color: None,
                    radius: 4,
                    pulse: false,
                    label: id.to_string(),
                    status: None,
                },
            }
        }
    }

    impl Renderable for Dot {
        fn render_id(&self) -> &str {
            &self.id
        }
        fn geometry(&self) -> &Geometry {
            &self.geometry
        }
        fn style(&self) -> &Style {
            &self.style
        }
        fn popup_content(&self) -> PopupContent {
            PopupContent {
                title: self.id.clone(),
                rows: vec![("color".to_string(), self.style.fill_color.clone())],
            }
        }
    }

    fn scene() -> SceneRenderer {
        let mut scene = SceneRenderer::new();
        scene
            .load("pk.test", Viewport { center: LngLat::new(0.0, 0.0), zoom: 10.0 })
            .unwrap();
        scene
    }

    fn layer() -> LayerReconciler {
        LayerReconciler::new(LayerSpec::for_kind(EntityKind::Stop))
    }

    #[test]
    fn first_pass_attaches_layer_and_listeners_once() {
        let mut surface = scene();
        let mut layer = layer();
        assert_eq!(layer.state(), LayerState::Empty);

        layer.reconcile(&mut surface, &[Dot::new("A", 0.0, 0.0, "red")]);
        layer.reconcile(&mut surface, &[Dot::new("B", 0.0, 0.0, "red")]);

        assert_eq!(layer.state(), LayerState::Populated);
        assert_eq!(surface.listener_count(), 2);
        assert_eq!(surface.stats().subscribes, 2);
    }

    #[test]
    fn failed_subscription_is_retried_on_next_pass() {
        let mut surface = scene();
        let mut layer = layer();
        surface.fail_subscriptions_for(EventKind::Hover);

        let report = layer.reconcile(&mut surface, &[Dot::new("A", 0.0, 0.0, "red")]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].operation, Operation::AttachLayer);
        assert!(report.created.is_empty());
        assert_eq!(layer.state(), LayerState::Empty);
        assert_eq!(surface.listener_count(), 0);
        assert!(!surface.has_layer(layer.layer_id()));

        surface.clear_failures();
        let report = layer.reconcile(&mut surface, &[Dot::new("A", 0.0, 0.0, "red")]);
        assert!(report.failures.is_empty());
        assert_eq!(report.created, vec!["A".to_string()]);
        assert_eq!(layer.state(), LayerState::Populated);
        assert_eq!(surface.listener_count(), 2);
    }

    #[test]
    fn set_difference_drives_operations() {
        let mut surface = scene();
        let mut layer = layer();
        layer.reconcile(
            &mut surface,
            &[Dot::new("A", 0.0, 0.0, "red"), Dot::new("B", 1.0, 1.0, "red")],
        );
        let report = layer.reconcile(
            &mut surface,
            &[Dot::new("B", 1.0, 1.0, "red"), Dot::new("C", 2.0, 2.0, "red")],
        );

        assert_eq!(report.created, vec!["C".to_string()]);
        assert_eq!(report.removed, vec!["A".to_string()]);
        assert_eq!(report.retained, vec!["B".to_string()]);
        assert_eq!(report.geometry_updates, 0);
        assert_eq!(layer.rendered_ids(), vec!["B".to_string(), "C".to_string()]);
    }

    #[test]
    fn identical_pass_is_noop() {
        let mut surface = scene();
        let mut layer = layer();
        let items = vec![Dot::new("A", 0.0, 0.0, "red"), Dot::new("B", 1.0, 1.0, "blue")];
        layer.reconcile(&mut surface, &items);
        let before = surface.stats();
        let report = layer.reconcile(&mut surface, &items);
        assert!(report.is_noop());
        assert_eq!(surface.stats(), before);
    }

    #[test]
    fn style_only_updated_when_fingerprint_changes() {
        let mut surface = scene();
        let mut layer = layer();
        layer.reconcile(&mut surface, &[Dot::new("A", 0.0, 0.0, "red")]);

        let moved = layer.reconcile(&mut surface, &[Dot::new("A", 5.0, 5.0, "red")]);
        assert_eq!(moved.geometry_updates, 1);
        assert_eq!(moved.style_updates, 0);

        let recolored = layer.reconcile(&mut surface, &[Dot::new("A", 5.0, 5.0, "green")]);
        assert_eq!(recolored.geometry_updates, 0);
        assert_eq!(recolored.style_updates, 1);
    }

    #[test]
    fn bad_items_are_skipped_rest_applies() {
        let mut surface = scene();
        let mut layer = layer();
        let mut broken = Dot::new("X", 0.0, 0.0, "red");
        broken.geometry = Geometry::LineString(vec![]);
        let report = layer.reconcile(
            &mut surface,
            &[
                Dot::new("A", 0.0, 0.0, "red"),
                Dot::new("A", 9.0, 9.0, "red"),
                Dot::new("", 1.0, 1.0, "red"),
                broken,
                Dot::new("B", 1.0, 1.0, "red"),
            ],
        );
        assert_eq!(report.created, vec!["A".to_string(), "B".to_string()]);
        let reasons: Vec<SkipReason> = report.skipped.iter().map(|s| s.reason.clone()).collect();
        assert_eq!(
            reasons,
            vec![SkipReason::DuplicateId, SkipReason::EmptyId, SkipReason::InvalidGeometry]
        );
        // First occurrence of a duplicate wins.
        let a = surface.feature_for(layer.layer_id(), "A").unwrap();
        assert_eq!(a.geometry, Geometry::Point(LngLat::new(0.0, 0.0)));
    }

    #[test]
    fn failed_create_is_retried_next_pass() {
        let mut surface = scene();
        let mut layer = layer();
        surface.fail_creates_for("B");
        let report = layer.reconcile(
            &mut surface,
            &[Dot::new("A", 0.0, 0.0, "red"), Dot::new("B", 1.0, 1.0, "red"), Dot::new("C", 2.0, 2.0, "red")],
        );
        assert_eq!(report.created, vec!["A".to_string(), "C".to_string()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].operation, Operation::Create);

        surface.clear_failures();
        let report = layer.reconcile(
            &mut surface,
            &[Dot::new("A", 0.0, 0.0, "red"), Dot::new("B", 1.0, 1.0, "red"), Dot::new("C", 2.0, 2.0, "red")],
        );
        assert_eq!(report.created, vec!["B".to_string()]);
        assert!(report.failures.is_empty());
    }

    #[test]
    fn popup_refreshed_in_place_and_closed_on_removal() {
        let mut surface = scene();
        let mut layer = layer();
        let a = Dot::new("A", 0.0, 0.0, "red");
        layer.reconcile(&mut surface, &[a.clone()]);
        assert!(layer.open_popup(&mut surface, "A", a.popup_content()).unwrap());

        let report = layer.reconcile(&mut surface, &[Dot::new("A", 1.0, 0.0, "green")]);
        assert_eq!(report.popup_refreshes, 1);
        assert_eq!(layer.open_popup_id(), Some("A"));
        let popup = surface.popups().next().unwrap();
        assert_eq!(popup.content.rows[0].1, "green");
        assert_eq!(surface.stats().popup_opens, 1);
        assert_eq!(surface.stats().popup_closes, 0);

        let report = layer.reconcile::<_, Dot>(&mut surface, &[]);
        assert_eq!(report.removed, vec!["A".to_string()]);
        assert_eq!(surface.stats().popup_closes, 1);
        assert_eq!(surface.popups().count(), 0);
    }

    #[test]
    fn release_is_idempotent() {
        let mut surface = scene();
        let mut layer = layer();
        layer.reconcile(&mut surface, &[Dot::new("A", 0.0, 0.0, "red")]);
        assert_eq!(layer.release(&mut surface, "A").removed.len(), 1);
        let again = layer.release(&mut surface, "A");
        assert!(again.removed.is_empty());
        assert!(again.failures.is_empty());
        assert_eq!(surface.stats().removes, 1);
    }

    #[test]
    fn clear_detaches_everything() {
        let mut surface = scene();
        let mut layer = layer();
        layer.reconcile(
            &mut surface,
            &[Dot::new("A", 0.0, 0.0, "red"), Dot::new("B", 1.0, 1.0, "red")],
        );
        let report = layer.clear(&mut surface);
        assert_eq!(report.removed.len(), 2);
        assert_eq!(layer.state(), LayerState::Empty);
        assert!(!surface.has_layer(layer.layer_id()));
        assert_eq!(surface.listener_count(), 0);

        layer.reconcile(&mut surface, &[Dot::new("A", 0.0, 0.0, "red")]);
        assert_eq!(surface.listener_count(), 2);
    }
}
