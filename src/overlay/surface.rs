// Rendering surface seam: the only capabilities the overlay needs from a map backend.

use std::collections::HashMap;

use serde::Serialize;

use super::blip::Position;
use super::catalog::IconStyle;
use super::marker_table::SlotIndex;

/// Opaque handle to one rendered marker. Move-only: whoever holds it owns the marker,
/// and [`RenderSurface::destroy`] consumes it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct MarkerHandle(u64);

impl MarkerHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Identifier of a cluster layer created by the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ClusterLayerId(pub u64);

/// Where a marker is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Destination {
    Map,
    Cluster(ClusterLayerId),
}

/// Construction parameters of the player cluster layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterOptions {
    pub max_cluster_radius: u32,
    pub spiderfy_on_max_zoom: bool,
    pub show_coverage_on_hover: bool,
    pub zoom_to_bounds_on_click: bool,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            max_cluster_radius: 20,
            spiderfy_on_max_zoom: false,
            show_coverage_on_hover: false,
            zoom_to_bounds_on_click: false,
        }
    }
}

/// Everything the surface needs to build a marker.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerSpec {
    pub slot: SlotIndex,
    pub title: String,
    pub position: Position,
    pub icon: Option<IconStyle>,
    pub draggable: bool,
    /// Player identifier for player markers.
    pub player: Option<String>,
}

/// A row of the info popup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum InfoRow {
    Position(Position),
    Field { label: String, value: String },
}

/// Structured popup content; the surface decides how to render it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InfoPayload {
    pub heading: String,
    pub rows: Vec<InfoRow>,
}

/// Capabilities required from the concrete map backend. Coordinate projection and
/// icon geometry are the backend's concern.
pub trait RenderSurface {
    fn create_marker(&mut self, spec: &MarkerSpec) -> MarkerHandle;
    fn attach(&mut self, handle: &MarkerHandle, destination: Destination);
    fn detach(&mut self, handle: &MarkerHandle);
    fn move_marker(&mut self, handle: &MarkerHandle, position: Position);
    fn bind_info(&mut self, handle: &MarkerHandle, info: &InfoPayload);
    fn destroy(&mut self, handle: MarkerHandle);

    fn create_cluster_layer(&mut self, options: &ClusterOptions) -> ClusterLayerId;
    fn attach_cluster_layer(&mut self, layer: ClusterLayerId);
    fn detach_cluster_layer(&mut self, layer: ClusterLayerId);

    /// Remove a companion element (e.g. a DOM node named `marker_<slot>`), if any.
    fn remove_element(&mut self, element_id: &str);
}

/// State of one marker inside [`RecordingSurface`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedMarker {
    pub spec: MarkerSpec,
    pub position: Position,
    pub destination: Option<Destination>,
    pub info: Option<InfoPayload>,
}

/// In-memory surface holding live markers and cluster layers. Used headless and in tests.
///
/// Destroyed markers and detached layers are dropped. The destroy and element-removal
/// logs are only kept by [`RecordingSurface::with_history`].
#[derive(Debug, Default)]
pub struct RecordingSurface {
    markers: HashMap<u64, RecordedMarker>,
    layers: HashMap<ClusterLayerId, bool>,
    keep_history: bool,
    destroyed: Vec<u64>,
    removed_elements: Vec<String>,
    next_marker: u64,
    next_layer: u64,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Surface that also logs destroyed markers and removed element ids.
    pub fn with_history() -> Self {
        Self {
            keep_history: true,
            ..Self::default()
        }
    }

    pub fn marker(&self, raw: u64) -> Option<&RecordedMarker> {
        self.markers.get(&raw)
    }

    /// Markers created and not yet destroyed.
    pub fn live_markers(&self) -> usize {
        self.markers.len()
    }

    pub fn destroyed(&self) -> &[u64] {
        &self.destroyed
    }

    pub fn removed_elements(&self) -> &[String] {
        &self.removed_elements
    }

    pub fn is_attached(&self, raw: u64) -> bool {
        self.markers
            .get(&raw)
            .is_some_and(|m| m.destination.is_some())
    }

    /// Attached to the map, or to a cluster layer that is itself attached.
    pub fn is_visible(&self, raw: u64) -> bool {
        match self.markers.get(&raw).and_then(|m| m.destination) {
            Some(Destination::Map) => true,
            Some(Destination::Cluster(layer)) => self.layers.get(&layer).copied().unwrap_or(false),
            None => false,
        }
    }

    pub fn layers_created(&self) -> u64 {
        self.next_layer
    }

    /// Cluster layers created and not yet detached.
    pub fn layers_held(&self) -> usize {
        self.layers.len()
    }

    pub fn attached_layers(&self) -> Vec<ClusterLayerId> {
        let mut attached: Vec<_> = self
            .layers
            .iter()
            .filter(|(_, &attached)| attached)
            .map(|(&id, _)| id)
            .collect();
        attached.sort_by_key(|id| id.0);
        attached
    }
}

impl RenderSurface for RecordingSurface {
    fn create_marker(&mut self, spec: &MarkerSpec) -> MarkerHandle {
        self.next_marker += 1;
        let raw = self.next_marker;
        self.markers.insert(
            raw,
            RecordedMarker {
                spec: spec.clone(),
                position: spec.position,
                destination: None,
                info: None,
            },
        );
        MarkerHandle::new(raw)
    }

    fn attach(&mut self, handle: &MarkerHandle, destination: Destination) {
        if let Some(marker) = self.markers.get_mut(&handle.raw()) {
            marker.destination = Some(destination);
        }
    }

    fn detach(&mut self, handle: &MarkerHandle) {
        if let Some(marker) = self.markers.get_mut(&handle.raw()) {
            marker.destination = None;
        }
    }

    fn move_marker(&mut self, handle: &MarkerHandle, position: Position) {
        if let Some(marker) = self.markers.get_mut(&handle.raw()) {
            marker.position = position;
        }
    }

    fn bind_info(&mut self, handle: &MarkerHandle, info: &InfoPayload) {
        if let Some(marker) = self.markers.get_mut(&handle.raw()) {
            marker.info = Some(info.clone());
        }
    }

    fn destroy(&mut self, handle: MarkerHandle) {
        self.markers.remove(&handle.raw());
        if self.keep_history {
            self.destroyed.push(handle.raw());
        }
    }

    fn create_cluster_layer(&mut self, _options: &ClusterOptions) -> ClusterLayerId {
        self.next_layer += 1;
        let id = ClusterLayerId(self.next_layer);
        self.layers.insert(id, false);
        id
    }

    fn attach_cluster_layer(&mut self, layer: ClusterLayerId) {
        tracing::debug!(layer = layer.0, "cluster layer attached");
        self.layers.insert(layer, true);
    }

    fn detach_cluster_layer(&mut self, layer: ClusterLayerId) {
        tracing::debug!(layer = layer.0, "cluster layer detached");
        self.layers.remove(&layer);
    }

    fn remove_element(&mut self, element_id: &str) {
        if self.keep_history {
            self.removed_elements.push(element_id.to_string());
        }
    }
}
