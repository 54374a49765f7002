// Density Clusterer: groups nearby point entities into cluster items at low
// zoom. Clusters go through the same reconciler as single entities.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::hash::{Hash, Hasher};

use serde::Serialize;

use crate::config::ClusterConfig;
use crate::models::{Geometry, LngLat};
use crate::reconciler::Renderable;
use crate::render::PopupContent;
use crate::style::{DeviationStatus, Style, StyledEntity};

const TILE_SIZE: f64 = 512.0;
const MAX_LATITUDE: f64 = 85.051_128_78;
const POPUP_MEMBER_LIMIT: usize = 10;

/// A synthesized item standing in for several nearby entities.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cluster {
    pub id: String,
    /// Sorted member entity ids.
    pub members: Vec<String>,
    pub geometry: Geometry,
    pub style: Style,
    pub band: usize,
    #[serde(skip)]
    status_counts: BTreeMap<&'static str, usize>,
}

impl Cluster {
    pub fn count(&self) -> usize {
        self.members.len()
    }
}

/// Item placed on a clustered layer: an entity or a cluster of entities.
#[derive(Debug, Clone, PartialEq)]
pub enum OverlayItem {
    Single(StyledEntity),
    Cluster(Cluster),
}

impl Renderable for OverlayItem {
    fn render_id(&self) -> &str {
        match self {
            OverlayItem::Single(item) => item.render_id(),
            OverlayItem::Cluster(cluster) => &cluster.id,
        }
    }

    fn geometry(&self) -> &Geometry {
        match self {
            OverlayItem::Single(item) => item.geometry(),
            OverlayItem::Cluster(cluster) => &cluster.geometry,
        }
    }

    fn style(&self) -> &Style {
        match self {
            OverlayItem::Single(item) => item.style(),
            OverlayItem::Cluster(cluster) => &cluster.style,
        }
    }

    fn popup_content(&self) -> PopupContent {
        match self {
            OverlayItem::Single(item) => item.popup_content(),
            OverlayItem::Cluster(cluster) => {
                let mut rows: Vec<(String, String)> = cluster
                    .status_counts
                    .iter()
                    .map(|(status, count)| (status.to_string(), count.to_string()))
                    .collect();
                for member in cluster.members.iter().take(POPUP_MEMBER_LIMIT) {
                    rows.push(("Member".to_string(), member.clone()));
                }
                if cluster.count() > POPUP_MEMBER_LIMIT {
                    rows.push((
                        "More".to_string(),
                        (cluster.count() - POPUP_MEMBER_LIMIT).to_string(),
                    ));
                }
                PopupContent {
                    title: format!("{} vehicles", cluster.count()),
                    rows,
                }
            }
        }
    }
}

/// Cluster id derived from member composition only, so the same membership
/// yields the same id on every cycle.
pub fn cluster_id(members: &[String]) -> String {
    let mut hasher = DefaultHasher::new();
    for member in members {
        member.hash(&mut hasher);
    }
    format!("cluster:{:016x}", hasher.finish())
}

#[derive(Debug, Clone)]
pub struct DensityClusterer {
    config: ClusterConfig,
}

impl DensityClusterer {
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    pub fn is_active(&self, zoom: f64) -> bool {
        zoom < self.config.max_zoom
    }

    /// Groups `items` into grid cells of `radius_px` at `zoom`.
    ///
    /// Above the threshold, or for non-point geometry, items pass through
    /// untouched. Output order is deterministic.
    pub fn cluster(&self, items: Vec<StyledEntity>, zoom: f64) -> Vec<OverlayItem> {
        if !self.is_active(zoom) {
            return items.into_iter().map(OverlayItem::Single).collect();
        }

        let world = TILE_SIZE * 2f64.powf(zoom.max(0.0).floor());
        let cell_size = self.config.radius_px.max(1.0);
        let mut cells: BTreeMap<(i64, i64), Vec<StyledEntity>> = BTreeMap::new();
        let mut output = Vec::with_capacity(items.len());

        for item in items {
            match item.geometry.as_point() {
                Some(point) => {
                    let (x, y) = project(point, world);
                    let cell = ((x / cell_size).floor() as i64, (y / cell_size).floor() as i64);
                    cells.entry(cell).or_default().push(item);
                }
                None => output.push(OverlayItem::Single(item)),
            }
        }

        let min_points = self.config.min_points.max(2);
        for (_, members) in cells {
            if members.len() >= min_points {
                output.push(OverlayItem::Cluster(self.build_cluster(members)));
            } else {
                output.extend(members.into_iter().map(OverlayItem::Single));
            }
        }
        output
    }

    fn build_cluster(&self, members: Vec<StyledEntity>) -> Cluster {
        let count = members.len();
        let (sum_lng, sum_lat) = members
            .iter()
            .filter_map(|m| m.geometry.as_point())
            .fold((0.0, 0.0), |(lng, lat), p| (lng + p.lng, lat + p.lat));
        let centroid = LngLat::new(sum_lng / count as f64, sum_lat / count as f64);

        let mut status_counts: BTreeMap<&'static str, usize> = BTreeMap::new();
        for member in &members {
            let status = member.style.status.unwrap_or(DeviationStatus::NoData);
            *status_counts.entry(status.as_str()).or_insert(0) += 1;
        }

        let mut ids: Vec<String> = members.iter().map(|m| m.entity.id.clone()).collect();
        ids.sort();

        let bands = &self.config.bands;
        let band = bands.band_for(count);
        Cluster {
            id: cluster_id(&ids),
            members: ids,
            geometry: Geometry::Point(centroid),
            style: Style {
                fill_color: bands.colors[band].clone(),
                outline_color: None,
                radius: bands.radii[band],
                pulse: members.iter().any(|m| m.style.pulse),
                label: count.to_string(),
                status: None,
            },
            band,
            status_counts,
        }
    }
}

/// Web-mercator pixel coordinates for a world `world` pixels wide.
fn project(point: LngLat, world: f64) -> (f64, f64) {
    let lat = point.lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
    let x = (point.lng + 180.0) / 360.0 * world;
    let y = (1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / PI) / 2.0 * world;
    (x, y)
}
