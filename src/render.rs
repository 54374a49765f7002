// Rendering surface capability and the in-memory scene implementation.
//
// The overlay never talks to a concrete map SDK. It drives anything that
// implements `RenderSurface`: layers, features carrying entity-id metadata,
// anchored popups, per-layer event listeners and viewport control.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RenderError;
use crate::models::{EntityKind, Geometry, LngLat};
use crate::style::Style;

// ============================================================================
// Identifiers & Payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(pub String);

impl LayerId {
    pub fn for_kind(kind: EntityKind) -> Self {
        let name = match kind {
            EntityKind::Vehicle => "vehicles",
            EntityKind::Route => "routes",
            EntityKind::Stop => "stops",
        };
        LayerId(name.to_string())
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeatureHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PopupHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Click,
    Hover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerGeometry {
    Circle,
    Line,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerSpec {
    pub id: LayerId,
    pub geometry: LayerGeometry,
    /// Higher draws above lower.
    pub z_index: u8,
}

impl LayerSpec {
    pub fn for_kind(kind: EntityKind) -> Self {
        let (geometry, z_index) = match kind {
            EntityKind::Route => (LayerGeometry::Line, 0),
            EntityKind::Stop => (LayerGeometry::Circle, 1),
            EntityKind::Vehicle => (LayerGeometry::Circle, 2),
        };
        Self {
            id: LayerId::for_kind(kind),
            geometry,
            z_index,
        }
    }
}

/// What the surface needs to create one feature. `entity_id` is attached as
/// feature metadata and comes back in event payloads.
#[derive(Debug, Clone, Copy)]
pub struct FeatureSpec<'a> {
    pub entity_id: &'a str,
    pub geometry: &'a Geometry,
    pub style: &'a Style,
}

/// An event raised by the surface for a feature on a subscribed layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerEvent {
    pub layer: LayerId,
    pub kind: EventKind,
    pub entity_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PopupContent {
    pub title: String,
    pub rows: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub center: LngLat,
    pub zoom: f64,
}

// ============================================================================
// Capability
// ============================================================================

pub trait RenderSurface {
    /// Loads the renderer and its base style. Only the session calls this.
    fn load(&mut self, credential: &str, viewport: Viewport) -> Result<(), RenderError>;

    fn add_layer(&mut self, layer: &LayerSpec) -> Result<(), RenderError>;
    fn remove_layer(&mut self, layer: &LayerId) -> Result<(), RenderError>;

    fn create_feature(
        &mut self,
        layer: &LayerId,
        feature: FeatureSpec<'_>,
    ) -> Result<FeatureHandle, RenderError>;
    fn set_geometry(&mut self, handle: FeatureHandle, geometry: &Geometry) -> Result<(), RenderError>;
    fn set_style(&mut self, handle: FeatureHandle, style: &Style) -> Result<(), RenderError>;
    fn remove_feature(&mut self, handle: FeatureHandle) -> Result<(), RenderError>;

    fn open_popup(
        &mut self,
        anchor: FeatureHandle,
        content: &PopupContent,
    ) -> Result<PopupHandle, RenderError>;
    fn set_popup_content(
        &mut self,
        popup: PopupHandle,
        content: &PopupContent,
    ) -> Result<(), RenderError>;
    fn close_popup(&mut self, popup: PopupHandle) -> Result<(), RenderError>;

    fn subscribe(&mut self, layer: &LayerId, event: EventKind) -> Result<ListenerHandle, RenderError>;
    fn unsubscribe(&mut self, listener: ListenerHandle) -> Result<(), RenderError>;

    fn set_viewport(&mut self, viewport: Viewport) -> Result<(), RenderError>;

    /// Decodes a raw pointer event on `handle` into a layer event, if a
    /// listener is registered for that layer and event kind.
    fn dispatch(&self, handle: FeatureHandle, event: EventKind) -> Option<LayerEvent>;

    /// Serializable view of the surface contents, when the surface supports it.
    fn export(&self) -> Option<serde_json::Value> {
        None
    }
}

// ============================================================================
// In-Memory Scene
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SceneFeature {
    pub handle: FeatureHandle,
    pub layer: LayerId,
    pub entity_id: String,
    pub geometry: Geometry,
    pub style: Style,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenePopup {
    pub handle: PopupHandle,
    pub anchor: FeatureHandle,
    pub content: PopupContent,
}

/// Counts of every mutation the scene has received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SceneStats {
    pub creates: usize,
    pub removes: usize,
    pub geometry_updates: usize,
    pub style_updates: usize,
    pub popup_opens: usize,
    pub popup_updates: usize,
    pub popup_closes: usize,
    pub subscribes: usize,
    pub unsubscribes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SceneView {
    pub viewport: Option<Viewport>,
    pub layers: Vec<SceneLayerView>,
    pub popups: Vec<ScenePopup>,
    pub stats: SceneStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct SceneLayerView {
    pub spec: LayerSpec,
    pub features: Vec<SceneFeature>,
}

/// Headless rendering surface that keeps the full scene in memory.
///
/// The server exports it as JSON for thin clients to mirror; tests use it to
/// observe every mutation the reconciler issues.
#[derive(Debug, Default)]
pub struct SceneRenderer {
    loaded: bool,
    viewport: Option<Viewport>,
    next_id: u64,
    layers: BTreeMap<LayerId, LayerSpec>,
    features: BTreeMap<FeatureHandle, SceneFeature>,
    popups: HashMap<u64, ScenePopup>,
    listeners: HashMap<u64, (LayerId, EventKind)>,
    failing_entities: HashSet<String>,
    failing_subscriptions: HashSet<EventKind>,
    fail_load: Option<String>,
    stats: SceneStats,
}

impl SceneRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `load` fail with the given message.
    pub fn failing_load(message: impl Into<String>) -> Self {
        Self {
            fail_load: Some(message.into()),
            ..Self::default()
        }
    }

    /// Makes any create for `entity_id` fail until cleared.
    pub fn fail_creates_for(&mut self, entity_id: impl Into<String>) {
        self.failing_entities.insert(entity_id.into());
    }

    /// Makes every subscription to `event` fail until cleared.
    pub fn fail_subscriptions_for(&mut self, event: EventKind) {
        self.failing_subscriptions.insert(event);
    }

    pub fn clear_failures(&mut self) {
        self.failing_entities.clear();
        self.failing_subscriptions.clear();
    }

    pub fn stats(&self) -> SceneStats {
        self.stats
    }

    pub fn has_layer(&self, layer: &LayerId) -> bool {
        self.layers.contains_key(layer)
    }

    pub fn features_in(&self, layer: &LayerId) -> Vec<&SceneFeature> {
        self.features.values().filter(|f| &f.layer == layer).collect()
    }

    pub fn feature_for(&self, layer: &LayerId, entity_id: &str) -> Option<&SceneFeature> {
        self.features
            .values()
            .find(|f| &f.layer == layer && f.entity_id == entity_id)
    }

    pub fn popups(&self) -> impl Iterator<Item = &ScenePopup> {
        self.popups.values()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn viewport(&self) -> Option<Viewport> {
        self.viewport
    }

    pub fn view(&self) -> SceneView {
        let layers = self
            .layers
            .values()
            .map(|spec| SceneLayerView {
                spec: spec.clone(),
                features: self.features_in(&spec.id).into_iter().cloned().collect(),
            })
            .collect();
        SceneView {
            viewport: self.viewport,
            layers,
            popups: self.popups.values().cloned().collect(),
            stats: self.stats,
        }
    }

    fn ensure_loaded(&self) -> Result<(), RenderError> {
        if self.loaded {
            Ok(())
        } else {
            Err(RenderError::NotReady)
        }
    }

    fn next_handle(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn feature_mut(&mut self, handle: FeatureHandle) -> Result<&mut SceneFeature, RenderError> {
        self.features
            .get_mut(&handle)
            .ok_or(RenderError::UnknownHandle(handle.0))
    }
}

impl RenderSurface for SceneRenderer {
    fn load(&mut self, credential: &str, viewport: Viewport) -> Result<(), RenderError> {
        if credential.trim().is_empty() {
            return Err(RenderError::Credential);
        }
        if let Some(message) = &self.fail_load {
            return Err(RenderError::Load(message.clone()));
        }
        self.loaded = true;
        self.viewport = Some(viewport);
        Ok(())
    }

    fn add_layer(&mut self, layer: &LayerSpec) -> Result<(), RenderError> {
        self.ensure_loaded()?;
        self.layers.insert(layer.id.clone(), layer.clone());
        Ok(())
    }

    fn remove_layer(&mut self, layer: &LayerId) -> Result<(), RenderError> {
        self.ensure_loaded()?;
        if self.layers.remove(layer).is_none() {
            return Err(RenderError::UnknownLayer(layer.0.clone()));
        }
        let orphaned: Vec<FeatureHandle> = self
            .features
            .values()
            .filter(|f| &f.layer == layer)
            .map(|f| f.handle)
            .collect();
        for handle in orphaned {
            self.features.remove(&handle);
            self.popups.retain(|_, popup| popup.anchor != handle);
        }
        self.listeners.retain(|_, (l, _)| l != layer);
        Ok(())
    }

    fn create_feature(
        &mut self,
        layer: &LayerId,
        feature: FeatureSpec<'_>,
    ) -> Result<FeatureHandle, RenderError> {
        self.ensure_loaded()?;
        if !self.layers.contains_key(layer) {
            return Err(RenderError::UnknownLayer(layer.0.clone()));
        }
        if self.failing_entities.contains(feature.entity_id) {
            return Err(RenderError::Load(format!(
                "injected failure for `{}`",
                feature.entity_id
            )));
        }
        let handle = FeatureHandle(self.next_handle());
        self.features.insert(
            handle,
            SceneFeature {
                handle,
                layer: layer.clone(),
                entity_id: feature.entity_id.to_string(),
                geometry: feature.geometry.clone(),
                style: feature.style.clone(),
            },
        );
        self.stats.creates += 1;
        Ok(handle)
    }

    fn set_geometry(&mut self, handle: FeatureHandle, geometry: &Geometry) -> Result<(), RenderError> {
        self.ensure_loaded()?;
        self.feature_mut(handle)?.geometry = geometry.clone();
        self.stats.geometry_updates += 1;
        Ok(())
    }

    fn set_style(&mut self, handle: FeatureHandle, style: &Style) -> Result<(), RenderError> {
        self.ensure_loaded()?;
        self.feature_mut(handle)?.style = style.clone();
        self.stats.style_updates += 1;
        Ok(())
    }

    fn remove_feature(&mut self, handle: FeatureHandle) -> Result<(), RenderError> {
        self.ensure_loaded()?;
        if self.features.remove(&handle).is_none() {
            return Err(RenderError::UnknownHandle(handle.0));
        }
        self.popups.retain(|_, popup| popup.anchor != handle);
        self.stats.removes += 1;
        Ok(())
    }

    fn open_popup(
        &mut self,
        anchor: FeatureHandle,
        content: &PopupContent,
    ) -> Result<PopupHandle, RenderError> {
        self.ensure_loaded()?;
        if !self.features.contains_key(&anchor) {
            return Err(RenderError::UnknownHandle(anchor.0));
        }
        let handle = PopupHandle(self.next_handle());
        self.popups.insert(
            handle.0,
            ScenePopup {
                handle,
                anchor,
                content: content.clone(),
            },
        );
        self.stats.popup_opens += 1;
        Ok(handle)
    }

    fn set_popup_content(
        &mut self,
        popup: PopupHandle,
        content: &PopupContent,
    ) -> Result<(), RenderError> {
        self.ensure_loaded()?;
        let entry = self
            .popups
            .get_mut(&popup.0)
            .ok_or(RenderError::UnknownPopup(popup.0))?;
        entry.content = content.clone();
        self.stats.popup_updates += 1;
        Ok(())
    }

    fn close_popup(&mut self, popup: PopupHandle) -> Result<(), RenderError> {
        self.ensure_loaded()?;
        if self.popups.remove(&popup.0).is_none() {
            return Err(RenderError::UnknownPopup(popup.0));
        }
        self.stats.popup_closes += 1;
        Ok(())
    }

    fn subscribe(&mut self, layer: &LayerId, event: EventKind) -> Result<ListenerHandle, RenderError> {
        self.ensure_loaded()?;
        if !self.layers.contains_key(layer) {
            return Err(RenderError::UnknownLayer(layer.0.clone()));
        }
        if self.failing_subscriptions.contains(&event) {
            return Err(RenderError::Load(format!("injected {:?} subscription failure", event)));
        }
        let handle = ListenerHandle(self.next_handle());
        self.listeners.insert(handle.0, (layer.clone(), event));
        self.stats.subscribes += 1;
        Ok(handle)
    }

    fn unsubscribe(&mut self, listener: ListenerHandle) -> Result<(), RenderError> {
        self.ensure_loaded()?;
        if self.listeners.remove(&listener.0).is_some() {
            self.stats.unsubscribes += 1;
        }
        Ok(())
    }

    fn set_viewport(&mut self, viewport: Viewport) -> Result<(), RenderError> {
        self.ensure_loaded()?;
        self.viewport = Some(viewport);
        Ok(())
    }

    fn dispatch(&self, handle: FeatureHandle, event: EventKind) -> Option<LayerEvent> {
        let feature = self.features.get(&handle)?;
        let subscribed = self
            .listeners
            .values()
            .any(|(layer, kind)| layer == &feature.layer && *kind == event);
        subscribed.then(|| LayerEvent {
            layer: feature.layer.clone(),
            kind: event,
            entity_id: feature.entity_id.clone(),
        })
    }

    fn export(&self) -> Option<serde_json::Value> {
        serde_json::to_value(self.view()).ok()
    }
}
