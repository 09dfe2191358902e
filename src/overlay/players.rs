// Per-connection player cache with lazily created markers.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::blip::Position;
use super::marker_table::{MarkerObject, MarkerTable, SlotIndex};
use super::surface::{InfoPayload, InfoRow, RenderSurface};
use super::{attribute_rows, RenderContext};

/// Live player data as delivered by the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerData {
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    pub pos: Position,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PlayerData {
    fn info(&self) -> InfoPayload {
        let mut rows = vec![InfoRow::Position(self.pos)];
        rows.extend(attribute_rows(&self.extra));
        InfoPayload {
            heading: self.name.clone(),
            rows,
        }
    }
}

/// Shows only players whose `attribute` equals `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerFilter {
    pub attribute: String,
    pub value: Value,
}

impl PlayerFilter {
    pub fn matches(&self, player: &PlayerData) -> bool {
        match self.attribute.as_str() {
            "name" => self.value.as_str() == Some(player.name.as_str()),
            "identifier" => self.value.as_str() == Some(player.identifier.as_str()),
            attr => player.extra.get(attr) == Some(&self.value),
        }
    }
}

/// Cached player plus its marker slot. The slot is `None` after a reset until the
/// next update for this player re-creates it.
#[derive(Debug, Clone)]
pub struct PlayerEntity {
    pub data: PlayerData,
    pub marker: Option<SlotIndex>,
}

#[derive(Debug, Default)]
pub struct PlayerCache {
    entries: BTreeMap<String, PlayerEntity>,
    filter: Option<PlayerFilter>,
}

impl PlayerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store fresh player data, creating the marker on first sight (or after a reset)
    /// and moving it otherwise.
    pub fn upsert(&mut self, data: PlayerData, ctx: &mut RenderContext<'_>) -> SlotIndex {
        let visible = self.filter.as_ref().map_or(true, |f| f.matches(&data));
        let info = data.info();

        let existing = self
            .entries
            .get(&data.identifier)
            .and_then(|entity| entity.marker)
            .filter(|slot| ctx.table.get(*slot).is_some());

        let slot = match existing {
            Some(slot) => {
                if let Some(handle) = ctx.table.get(slot) {
                    ctx.surface.move_marker(handle, data.pos);
                    ctx.surface.bind_info(handle, &info);
                }
                slot
            }
            None => {
                let object = MarkerObject {
                    reference: data.name.clone(),
                    position: data.pos,
                    icon: None,
                    description: String::new(),
                    player: Some(data.identifier.clone()),
                };
                let slot = ctx.create_marker(true, &object, &data.name).slot();
                if let Some(handle) = ctx.table.get(slot) {
                    ctx.surface.bind_info(handle, &info);
                }
                tracing::debug!(player = %data.identifier, slot = slot.get(), "player marker created");
                slot
            }
        };

        if visible {
            ctx.table.show(&mut *ctx.surface, slot);
        } else {
            ctx.table.hide(&mut *ctx.surface, slot);
        }

        self.entries.insert(
            data.identifier.clone(),
            PlayerEntity {
                data,
                marker: Some(slot),
            },
        );
        slot
    }

    /// Drop a player that left, destroying its marker.
    pub fn remove(&mut self, identifier: &str, ctx: &mut RenderContext<'_>) -> bool {
        match self.entries.remove(identifier) {
            Some(entity) => {
                if let Some(slot) = entity.marker {
                    ctx.table.clear(&mut *ctx.surface, slot);
                }
                true
            }
            None => false,
        }
    }

    /// Drop every player and marker. Used when the feed connection is replaced.
    pub fn clear(&mut self, ctx: &mut RenderContext<'_>) {
        for entity in std::mem::take(&mut self.entries).into_values() {
            if let Some(slot) = entity.marker {
                ctx.table.clear(&mut *ctx.surface, slot);
            }
        }
    }

    /// Null every marker reference. The table is being truncated by the caller.
    pub fn forget_markers(&mut self) {
        for entity in self.entries.values_mut() {
            entity.marker = None;
        }
    }

    /// Replace the filter and re-evaluate the visibility of every player marker.
    pub fn set_filter(
        &mut self,
        filter: Option<PlayerFilter>,
        table: &MarkerTable,
        surface: &mut dyn RenderSurface,
    ) {
        self.filter = filter;
        for entity in self.entries.values() {
            let Some(slot) = entity.marker else { continue };
            if self.filter.as_ref().map_or(true, |f| f.matches(&entity.data)) {
                table.show(surface, slot);
            } else {
                table.hide(surface, slot);
            }
        }
    }

    pub fn filter(&self) -> Option<&PlayerFilter> {
        self.filter.as_ref()
    }

    /// Attributes a [`PlayerFilter`] can select on: `name`, `identifier`, and every extra
    /// key seen on a cached player.
    pub fn filter_attributes(&self) -> BTreeSet<String> {
        let mut attributes: BTreeSet<String> =
            ["identifier", "name"].into_iter().map(String::from).collect();
        for entity in self.entries.values() {
            attributes.extend(entity.data.extra.keys().cloned());
        }
        attributes
    }

    pub fn get(&self, identifier: &str) -> Option<&PlayerEntity> {
        self.entries.get(identifier)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::cluster::ClusterLayerManager;
    use crate::overlay::surface::{Destination, RecordingSurface};
    use serde_json::json;

    #[derive(Default)]
    struct Fixture {
        surface: RecordingSurface,
        table: MarkerTable,
        clusters: ClusterLayerManager,
        players: PlayerCache,
    }

    impl Fixture {
        fn upsert(&mut self, data: PlayerData) -> SlotIndex {
            let mut ctx = RenderContext {
                surface: &mut self.surface,
                table: &mut self.table,
                clusters: &mut self.clusters,
                group_players: true,
            };
            self.players.upsert(data, &mut ctx)
        }

        fn raw(&self, slot: SlotIndex) -> u64 {
            self.table.get(slot).unwrap().raw()
        }
    }

    fn player(id: &str, x: f64, job: &str) -> PlayerData {
        serde_json::from_value(json!({
            "identifier": id,
            "name": format!("Player {id}"),
            "pos": {"x": x, "y": 0.0, "z": 0.0},
            "job": job,
        }))
        .unwrap()
    }

    #[test]
    fn test_upsert_creates_once_then_moves() {
        let mut fx = Fixture::default();
        let layer = fx.clusters.recreate(&mut fx.surface);

        let first = fx.upsert(player("a", 1.0, "police"));
        let second = fx.upsert(player("a", 5.0, "police"));

        assert_eq!(first, second);
        assert_eq!(fx.table.len(), 1);
        let marker = fx.surface.marker(fx.raw(first)).unwrap();
        assert_eq!(marker.position, Position::new(5.0, 0.0, 0.0));
        assert_eq!(marker.destination, Some(Destination::Cluster(layer)));
        assert_eq!(marker.spec.player.as_deref(), Some("a"));
    }

    #[test]
    fn test_forgotten_marker_is_recreated_lazily() {
        let mut fx = Fixture::default();
        fx.clusters.recreate(&mut fx.surface);
        fx.upsert(player("a", 1.0, "police"));

        fx.table.clear_all(&mut fx.surface);
        fx.players.forget_markers();
        assert_eq!(fx.players.get("a").unwrap().marker, None);

        let slot = fx.upsert(player("a", 2.0, "police"));
        assert_eq!(slot, SlotIndex::new(0));
        assert_eq!(fx.table.live_count(), 1);
    }

    #[test]
    fn test_missing_cluster_layer_builds_fallback() {
        let mut fx = Fixture::default();
        let slot = fx.upsert(player("a", 1.0, "police"));
        let layer = fx.clusters.current().expect("fallback layer");
        assert_eq!(
            fx.surface.marker(fx.raw(slot)).unwrap().destination,
            Some(Destination::Cluster(layer))
        );
    }

    #[test]
    fn test_filter_hides_non_matching_players() {
        let mut fx = Fixture::default();
        fx.clusters.recreate(&mut fx.surface);
        let cop = fx.upsert(player("a", 1.0, "police"));
        let medic = fx.upsert(player("b", 2.0, "ems"));

        let filter = PlayerFilter {
            attribute: "job".into(),
            value: json!("police"),
        };
        fx.players
            .set_filter(Some(filter), &fx.table, &mut fx.surface);
        assert!(fx.surface.is_attached(fx.raw(cop)));
        assert!(!fx.surface.is_attached(fx.raw(medic)));

        // Updates keep honoring the filter.
        fx.upsert(player("b", 3.0, "ems"));
        assert!(!fx.surface.is_attached(fx.raw(medic)));

        fx.players.set_filter(None, &fx.table, &mut fx.surface);
        assert!(fx.surface.is_attached(fx.raw(medic)));
    }

    #[test]
    fn test_filter_attributes_follow_cached_players() {
        let mut fx = Fixture::default();
        fx.clusters.recreate(&mut fx.surface);
        let names = |fx: &Fixture| fx.players.filter_attributes().into_iter().collect::<Vec<_>>();
        assert_eq!(names(&fx), vec!["identifier", "name"]);

        fx.upsert(player("a", 1.0, "police"));
        let ranked: PlayerData = serde_json::from_value(json!({
            "identifier": "b",
            "name": "Player b",
            "pos": {"x": 2.0, "y": 0.0, "z": 0.0},
            "rank": 3,
        }))
        .unwrap();
        fx.upsert(ranked);
        assert_eq!(names(&fx), vec!["identifier", "job", "name", "rank"]);

        let mut ctx = RenderContext {
            surface: &mut fx.surface,
            table: &mut fx.table,
            clusters: &mut fx.clusters,
            group_players: true,
        };
        fx.players.clear(&mut ctx);
        assert_eq!(names(&fx), vec!["identifier", "name"]);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut fx = Fixture::default();
        fx.clusters.recreate(&mut fx.surface);
        fx.upsert(player("a", 1.0, "police"));
        fx.upsert(player("b", 2.0, "ems"));

        let mut ctx = RenderContext {
            surface: &mut fx.surface,
            table: &mut fx.table,
            clusters: &mut fx.clusters,
            group_players: true,
        };
        assert!(fx.players.remove("a", &mut ctx));
        assert!(!fx.players.remove("a", &mut ctx));
        fx.players.clear(&mut ctx);

        assert!(fx.players.is_empty());
        assert_eq!(fx.table.live_count(), 0);
    }
}
