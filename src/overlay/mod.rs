// Overlay state: marker table, cluster layer, blip registry and player cache behind one owner.

pub mod blip;
pub mod catalog;
pub mod cluster;
pub mod marker_table;
pub mod players;
pub mod registry;
pub mod surface;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value};

use blip::{BlipRecord, CategoryKey};
use catalog::MarkerCatalog;
use cluster::{ClusterLayerManager, RecreateTicket};
use marker_table::{MarkerId, MarkerObject, MarkerTable};
use players::{PlayerCache, PlayerData, PlayerFilter};
use registry::{Change, EntityRegistry};
use surface::{ClusterLayerId, ClusterOptions, Destination, InfoRow, RenderSurface};

use crate::protocol::FeedEvent;

/// Mutable rendering state handed to registry and player operations.
pub struct RenderContext<'a> {
    pub surface: &'a mut dyn RenderSurface,
    pub table: &'a mut MarkerTable,
    pub clusters: &'a mut ClusterLayerManager,
    /// Send player markers to the cluster layer instead of the plain map.
    pub group_players: bool,
}

impl RenderContext<'_> {
    /// Destination for a new marker. Player markers go to the cluster layer when
    /// grouping is on, building a fallback layer if none exists.
    pub fn destination(&mut self, is_player: bool) -> Destination {
        if is_player && self.group_players {
            Destination::Cluster(self.clusters.destination_or_recover(&mut *self.surface))
        } else {
            Destination::Map
        }
    }

    pub fn create_marker(&mut self, is_player: bool, object: &MarkerObject, title: &str) -> MarkerId {
        let destination = self.destination(is_player);
        self.table
            .create(&mut *self.surface, destination, false, object, title)
    }
}

/// Info rows for free-form attributes, keys capitalized.
pub(crate) fn attribute_rows(extra: &Map<String, Value>) -> Vec<InfoRow> {
    extra
        .iter()
        .map(|(key, value)| InfoRow::Field {
            label: capitalize(key),
            value: match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        })
        .collect()
}

fn capitalize(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// User-controlled display settings.
#[derive(Debug, Clone)]
pub struct OverlaySettings {
    pub group_players: bool,
    pub show_blips: bool,
    pub disabled: BTreeSet<CategoryKey>,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        Self {
            group_players: true,
            show_blips: true,
            disabled: BTreeSet::new(),
        }
    }
}

/// Sole owner of all overlay state for one session. Every mutation goes through here.
pub struct Overlay<S> {
    surface: S,
    table: MarkerTable,
    clusters: ClusterLayerManager,
    registry: EntityRegistry,
    players: PlayerCache,
    catalog: Arc<MarkerCatalog>,
    settings: OverlaySettings,
}

impl<S: RenderSurface> Overlay<S> {
    /// Build the overlay and install the initial cluster layer.
    pub fn new(surface: S, catalog: Arc<MarkerCatalog>, settings: OverlaySettings) -> Self {
        let mut overlay = Self {
            surface,
            table: MarkerTable::new(),
            clusters: ClusterLayerManager::new(ClusterOptions::default()),
            registry: EntityRegistry::new(),
            players: PlayerCache::new(),
            catalog,
            settings,
        };
        overlay.clusters.recreate(&mut overlay.surface);
        overlay
    }

    fn parts(
        &mut self,
    ) -> (
        RenderContext<'_>,
        &mut EntityRegistry,
        &mut PlayerCache,
        &MarkerCatalog,
    ) {
        let ctx = RenderContext {
            surface: &mut self.surface,
            table: &mut self.table,
            clusters: &mut self.clusters,
            group_players: self.settings.group_players,
        };
        (ctx, &mut self.registry, &mut self.players, &*self.catalog)
    }

    fn category_visible(&self, category: &CategoryKey) -> bool {
        self.settings.show_blips && !self.settings.disabled.contains(category)
    }

    pub fn add_blip(&mut self, record: BlipRecord) -> Change {
        let visible = self.category_visible(&record.category);
        let (mut ctx, registry, _, catalog) = self.parts();
        let change = registry.add_blip(record, catalog, &mut ctx);
        if let Change::Added(slot) = change {
            if !visible {
                self.table.hide(&mut self.surface, slot);
            }
        }
        change
    }

    pub fn update_blip(&mut self, record: BlipRecord) -> Change {
        let (mut ctx, registry, _, catalog) = self.parts();
        registry.update_blip(record, catalog, &mut ctx)
    }

    pub fn remove_blip(&mut self, record: &BlipRecord) -> Change {
        let (mut ctx, registry, _, _) = self.parts();
        registry.remove_blip(record, &mut ctx)
    }

    pub fn upsert_player(&mut self, data: PlayerData) {
        let (mut ctx, _, players, _) = self.parts();
        players.upsert(data, &mut ctx);
    }

    pub fn remove_player(&mut self, identifier: &str) -> bool {
        let (mut ctx, _, players, _) = self.parts();
        players.remove(identifier, &mut ctx)
    }

    /// Forget every player; their lifecycle ends with the feed connection.
    pub fn drop_players(&mut self) {
        let (mut ctx, _, players, _) = self.parts();
        players.clear(&mut ctx);
    }

    /// Apply one feed event. Returns whether state changed.
    pub fn apply_event(&mut self, event: FeedEvent) -> bool {
        match event {
            FeedEvent::AddBlip(record) => self.add_blip(record).is_applied(),
            FeedEvent::UpdateBlip(record) => self.update_blip(record).is_applied(),
            FeedEvent::RemoveBlip(record) => self.remove_blip(&record).is_applied(),
            FeedEvent::PlayerData(players) => {
                let changed = !players.is_empty();
                for data in players {
                    self.upsert_player(data);
                }
                changed
            }
            FeedEvent::PlayerLeft(identifier) => self.remove_player(&identifier),
        }
    }

    /// Full reset: tombstone every marker, drop every blip, null player markers,
    /// and tear down the cluster layer. The returned ticket must be redeemed with
    /// [`finish_recreate`](Self::finish_recreate) in a later turn.
    pub fn reset(&mut self) -> RecreateTicket {
        self.table.clear_all(&mut self.surface);
        self.players.forget_markers();
        self.registry.reset();
        self.clusters.teardown(&mut self.surface)
    }

    /// Replace all blip state with a snapshot.
    pub fn load_snapshot(&mut self, records: Vec<BlipRecord>) -> RecreateTicket {
        let ticket = self.reset();
        for record in records {
            self.add_blip(record);
        }
        tracing::info!(blips = self.registry.count(), "snapshot loaded");
        ticket
    }

    pub fn finish_recreate(&mut self, ticket: RecreateTicket) -> Option<ClusterLayerId> {
        self.clusters.finish_recreate(ticket, &mut self.surface)
    }

    /// Re-apply category and global visibility to every blip.
    pub fn toggle_visibility(&mut self) {
        self.registry.toggle_visibility(
            &self.settings.disabled,
            self.settings.show_blips,
            &self.table,
            &mut self.surface,
        );
    }

    pub fn set_disabled_categories(&mut self, disabled: BTreeSet<CategoryKey>) {
        self.settings.disabled = disabled;
        self.toggle_visibility();
    }

    pub fn set_show_blips(&mut self, show: bool) {
        self.settings.show_blips = show;
        self.toggle_visibility();
    }

    pub fn set_player_filter(&mut self, filter: Option<PlayerFilter>) {
        self.players
            .set_filter(filter, &self.table, &mut self.surface);
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn table(&self) -> &MarkerTable {
        &self.table
    }

    pub fn clusters(&self) -> &ClusterLayerManager {
        &self.clusters
    }

    pub fn players(&self) -> &PlayerCache {
        &self.players
    }

    pub fn settings(&self) -> &OverlaySettings {
        &self.settings
    }

    pub fn catalog(&self) -> &MarkerCatalog {
        &self.catalog
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn into_surface(self) -> S {
        self.surface
    }
}
