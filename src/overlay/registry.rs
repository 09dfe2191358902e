// Blip registry: category buckets of blip records linked to marker slots.

use std::collections::{BTreeMap, BTreeSet};

use super::blip::{Blip, BlipKey, BlipRecord, CategoryKey};
use super::catalog::MarkerCatalog;
use super::marker_table::{MarkerObject, MarkerTable, SlotIndex};
use super::surface::{InfoPayload, InfoRow, RenderSurface};
use super::{attribute_rows, RenderContext};
use crate::metrics;

/// Name given to added blips with neither an explicit nor a catalog name.
pub const ADD_FALLBACK_NAME: &str = "Dynamic Marker";
/// Name shown after an update when neither the record nor the catalog has one.
pub const UPDATE_FALLBACK_NAME: &str = "No name blip..";

/// Outcome of a registry operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Added(SlotIndex),
    Updated(SlotIndex),
    Removed(SlotIndex),
    /// Duplicate add, or update/remove of an absent entity. Both mean the
    /// state has already converged.
    Unchanged,
}

impl Change {
    pub fn is_applied(self) -> bool {
        self != Change::Unchanged
    }
}

/// Category -> blips, with a global count.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    buckets: BTreeMap<CategoryKey, Vec<Blip>>,
    count: usize,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn locate(&self, key: &BlipKey) -> Option<usize> {
        self.buckets
            .get(&key.category)?
            .iter()
            .position(|blip| key.matches(blip))
    }

    pub fn find(&self, key: &BlipKey) -> Option<&Blip> {
        let index = self.locate(key)?;
        self.buckets.get(&key.category).map(|bucket| &bucket[index])
    }

    pub fn contains(&self, key: &BlipKey) -> bool {
        self.locate(key).is_some()
    }

    /// Add a blip unless one with the same category and position exists.
    pub fn add_blip(
        &mut self,
        record: BlipRecord,
        catalog: &MarkerCatalog,
        ctx: &mut RenderContext<'_>,
    ) -> Change {
        if self.contains(&record.key()) {
            tracing::debug!(category = %record.category, pos = %record.pos, "duplicate add ignored");
            return Change::Unchanged;
        }

        let is_player = record.is_player();
        let name = record
            .name
            .or_else(|| catalog.default_name(&record.category).map(str::to_string))
            .unwrap_or_else(|| ADD_FALLBACK_NAME.to_string());
        let description = record.description.unwrap_or_default();

        let object = MarkerObject {
            reference: name.clone(),
            position: record.pos,
            icon: catalog.icon(&record.category).cloned(),
            description: description.clone(),
            player: None,
        };
        let slot = ctx.create_marker(is_player, &object, "").slot();

        self.buckets
            .entry(record.category.clone())
            .or_default()
            .push(Blip {
                category: record.category,
                pos: record.pos,
                name,
                description,
                extra: record.extra,
                marker_slot: slot,
            });
        self.count += 1;
        metrics::BLIPS_TRACKED.set(self.count as i64);
        Change::Added(slot)
    }

    /// Remove the blip matching the record's identity. Absent entities are ignored.
    pub fn remove_blip(&mut self, record: &BlipRecord, ctx: &mut RenderContext<'_>) -> Change {
        let key = record.key();
        let Some(index) = self.locate(&key) else {
            tracing::debug!(category = %key.category, pos = %key.pos, "remove of unknown blip ignored");
            return Change::Unchanged;
        };
        let Some(bucket) = self.buckets.get_mut(&key.category) else {
            return Change::Unchanged;
        };

        let blip = bucket.remove(index);
        ctx.table.clear(&mut *ctx.surface, blip.marker_slot);
        if bucket.is_empty() {
            self.buckets.remove(&key.category);
        }
        self.count -= 1;
        metrics::BLIPS_TRACKED.set(self.count as i64);
        Change::Removed(blip.marker_slot)
    }

    /// Update the blip matching the record's identity in place, relocating it when the
    /// record carries `new_pos`. The marker slot is kept.
    pub fn update_blip(
        &mut self,
        mut record: BlipRecord,
        catalog: &MarkerCatalog,
        ctx: &mut RenderContext<'_>,
    ) -> Change {
        let key = record.key();
        let Some(index) = self.locate(&key) else {
            tracing::debug!(category = %key.category, pos = %key.pos, "update of unknown blip ignored");
            return Change::Unchanged;
        };
        let slot = self.buckets[&key.category][index].marker_slot;

        if let Some(new_pos) = record.new_pos.take() {
            let target = BlipKey {
                category: key.category.clone(),
                pos: new_pos,
            };
            match self.locate(&target) {
                Some(other) if other != index => {
                    tracing::warn!(
                        category = %key.category,
                        from = %key.pos,
                        to = %new_pos,
                        "relocation onto an occupied position dropped"
                    );
                }
                _ => {
                    if let Some(handle) = ctx.table.get(slot) {
                        ctx.surface.move_marker(handle, new_pos);
                    }
                    record.pos = new_pos;
                }
            }
        }

        let name = record
            .name
            .clone()
            .or_else(|| catalog.default_name(&record.category).map(str::to_string))
            .unwrap_or_else(|| UPDATE_FALLBACK_NAME.to_string());

        let info = update_info(&name, &record);
        if let Some(handle) = ctx.table.get(slot) {
            ctx.surface.bind_info(handle, &info);
        }

        let Some(bucket) = self.buckets.get_mut(&key.category) else {
            return Change::Unchanged;
        };
        bucket[index] = Blip {
            category: record.category,
            pos: record.pos,
            name,
            description: record.description.unwrap_or_default(),
            extra: record.extra,
            marker_slot: slot,
        };
        Change::Updated(slot)
    }

    /// Hide every blip of a disabled category; show or hide the rest per `show`.
    pub fn toggle_visibility(
        &self,
        disabled: &BTreeSet<CategoryKey>,
        show: bool,
        table: &MarkerTable,
        surface: &mut dyn RenderSurface,
    ) {
        for (category, bucket) in &self.buckets {
            let visible = show && !disabled.contains(category);
            for blip in bucket {
                if visible {
                    table.show(surface, blip.marker_slot);
                } else {
                    table.hide(surface, blip.marker_slot);
                }
            }
        }
    }

    /// Drop every bucket. Marker slots are released by the caller's table reset.
    pub fn reset(&mut self) {
        self.buckets.clear();
        self.count = 0;
        metrics::BLIPS_TRACKED.set(0);
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn categories(&self) -> impl Iterator<Item = &CategoryKey> {
        self.buckets.keys()
    }

    pub fn bucket(&self, category: &CategoryKey) -> Option<&[Blip]> {
        self.buckets.get(category).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Blip> {
        self.buckets.values().flatten()
    }
}

/// Popup for an updated blip: every attribute except category and name.
fn update_info(name: &str, record: &BlipRecord) -> InfoPayload {
    let mut rows = vec![InfoRow::Position(record.pos)];
    if let Some(description) = record.description.as_deref().filter(|d| !d.is_empty()) {
        rows.push(InfoRow::Field {
            label: "Description".to_string(),
            value: description.to_string(),
        });
    }
    rows.extend(attribute_rows(&record.extra));
    InfoPayload {
        heading: name.to_string(),
        rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::blip::Position;
    use crate::overlay::cluster::ClusterLayerManager;
    use crate::overlay::surface::{Destination, RecordingSurface};

    #[derive(Default)]
    struct Fixture {
        surface: RecordingSurface,
        table: MarkerTable,
        clusters: ClusterLayerManager,
        registry: EntityRegistry,
        catalog: MarkerCatalog,
    }

    impl Fixture {
        fn with_catalog(json: &str) -> Self {
            Self {
                catalog: MarkerCatalog::from_json(json).unwrap(),
                ..Default::default()
            }
        }

        fn add(&mut self, record: BlipRecord) -> Change {
            let mut ctx = RenderContext {
                surface: &mut self.surface,
                table: &mut self.table,
                clusters: &mut self.clusters,
                group_players: true,
            };
            self.registry.add_blip(record, &self.catalog, &mut ctx)
        }

        fn update(&mut self, record: BlipRecord) -> Change {
            let mut ctx = RenderContext {
                surface: &mut self.surface,
                table: &mut self.table,
                clusters: &mut self.clusters,
                group_players: true,
            };
            self.registry.update_blip(record, &self.catalog, &mut ctx)
        }

        fn remove(&mut self, record: &BlipRecord) -> Change {
            let mut ctx = RenderContext {
                surface: &mut self.surface,
                table: &mut self.table,
                clusters: &mut self.clusters,
                group_players: true,
            };
            self.registry.remove_blip(record, &mut ctx)
        }

        fn raw_handle(&self, slot: SlotIndex) -> u64 {
            self.table.get(slot).unwrap().raw()
        }
    }

    fn origin(category: &str) -> BlipRecord {
        BlipRecord::new(category, Position::new(0.0, 0.0, 0.0))
    }

    #[test]
    fn test_duplicate_add_allocates_once() {
        let mut fx = Fixture::default();
        assert!(matches!(fx.add(origin("1")), Change::Added(_)));
        assert_eq!(fx.add(origin("1")), Change::Unchanged);

        assert_eq!(fx.registry.count(), 1);
        assert_eq!(fx.table.len(), 1);
        assert_eq!(fx.registry.bucket(&"1".into()).unwrap().len(), 1);
    }

    #[test]
    fn test_same_position_different_category_are_distinct() {
        let mut fx = Fixture::default();
        fx.add(origin("1"));
        fx.add(origin("2"));
        assert_eq!(fx.registry.count(), 2);
        assert_eq!(fx.registry.categories().count(), 2);
    }

    #[test]
    fn test_add_stores_created_id_minus_one() {
        let mut fx = Fixture::default();
        fx.add(origin("1"));
        let Change::Added(slot) = fx.add(BlipRecord::new("1", Position::new(5.0, 5.0, 0.0))) else {
            panic!("expected add");
        };
        assert_eq!(slot, SlotIndex::new(1));
        let blip = fx
            .registry
            .find(&BlipRecord::new("1", Position::new(5.0, 5.0, 0.0)).key())
            .unwrap();
        assert_eq!(blip.marker_slot, slot);
    }

    #[test]
    fn test_add_name_defaults() {
        let mut fx = Fixture::with_catalog(r#"{"1": {"name": "Gas Station"}}"#);
        fx.add(origin("1"));
        fx.add(origin("9"));
        fx.add(BlipRecord::new("1", Position::new(1.0, 0.0, 0.0)).with_name("Custom"));

        let names: Vec<_> = fx.registry.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["Gas Station", "Custom", ADD_FALLBACK_NAME]);
    }

    #[test]
    fn test_add_then_remove_restores_prior_state() {
        let mut fx = Fixture::default();
        fx.add(origin("1"));
        let before: Vec<_> = fx.registry.iter().map(|b| b.pos).collect();

        let extra = BlipRecord::new("1", Position::new(3.0, 4.0, 5.0));
        fx.add(extra.clone());
        assert_eq!(fx.registry.count(), 2);
        assert!(matches!(fx.remove(&extra), Change::Removed(_)));

        let after: Vec<_> = fx.registry.iter().map(|b| b.pos).collect();
        assert_eq!(before, after);
        assert_eq!(fx.registry.count(), 1);
        assert_eq!(fx.table.live_count(), 1);
    }

    #[test]
    fn test_remove_last_blip_deletes_bucket() {
        let mut fx = Fixture::default();
        fx.add(origin("3"));
        fx.remove(&origin("3"));
        assert!(fx.registry.bucket(&"3".into()).is_none());
        assert_eq!(fx.registry.count(), 0);
    }

    #[test]
    fn test_remove_and_update_of_absent_blip_are_noops() {
        let mut fx = Fixture::default();
        fx.add(origin("1"));
        assert_eq!(fx.remove(&origin("2")), Change::Unchanged);
        assert_eq!(
            fx.update(BlipRecord::new("1", Position::new(9.0, 9.0, 9.0))),
            Change::Unchanged
        );
        assert_eq!(fx.registry.count(), 1);
    }

    #[test]
    fn test_readd_after_remove_gets_new_slot() {
        let mut fx = Fixture::default();
        let Change::Added(first) = fx.add(origin("1")) else {
            panic!("expected add");
        };
        fx.remove(&origin("1"));
        let Change::Added(second) = fx.add(origin("1")) else {
            panic!("expected add");
        };
        assert_ne!(first, second);
        assert!(fx.table.get(first).is_none());
    }

    #[test]
    fn test_update_relocates_and_discards_new_pos() {
        let mut fx = Fixture::default();
        let Change::Added(slot) = fx.add(origin("1")) else {
            panic!("expected add");
        };
        let target = Position::new(10.0, 20.0, 30.0);

        let change = fx.update(origin("1").with_new_pos(target));
        assert_eq!(change, Change::Updated(slot));

        assert!(fx.registry.find(&origin("1").key()).is_none());
        let moved = fx.registry.find(&BlipRecord::new("1", target).key()).unwrap();
        assert_eq!(moved.marker_slot, slot);
        assert!(!moved.extra.contains_key("new_pos"));

        let raw = fx.raw_handle(slot);
        assert_eq!(fx.surface.marker(raw).unwrap().position, target);
    }

    #[test]
    fn test_update_onto_occupied_position_keeps_old_position() {
        let mut fx = Fixture::default();
        fx.add(origin("1"));
        let occupied = Position::new(1.0, 1.0, 1.0);
        fx.add(BlipRecord::new("1", occupied));

        fx.update(origin("1").with_new_pos(occupied).with_name("Renamed"));

        assert_eq!(fx.registry.count(), 2);
        assert_eq!(fx.registry.find(&origin("1").key()).unwrap().name, "Renamed");
    }

    #[test]
    fn test_update_rebuilds_info_and_name() {
        let mut fx = Fixture::with_catalog(r#"{"1": {"name": "Shop"}}"#);
        let Change::Added(slot) = fx.add(origin("1").with_name("Old")) else {
            panic!("expected add");
        };

        fx.update(
            origin("1")
                .with_description("Open late")
                .with_attr("owner", "Dave")
                .with_attr("stock", 12),
        );

        let blip = fx.registry.find(&origin("1").key()).unwrap();
        assert_eq!(blip.name, "Shop");
        assert_eq!(blip.description, "Open late");

        let info = fx.surface.marker(fx.raw_handle(slot)).unwrap().info.clone().unwrap();
        assert_eq!(info.heading, "Shop");
        assert_eq!(
            info.rows,
            vec![
                InfoRow::Position(Position::new(0.0, 0.0, 0.0)),
                InfoRow::Field {
                    label: "Description".into(),
                    value: "Open late".into()
                },
                InfoRow::Field {
                    label: "Owner".into(),
                    value: "Dave".into()
                },
                InfoRow::Field {
                    label: "Stock".into(),
                    value: "12".into()
                },
            ]
        );
    }

    #[test]
    fn test_update_name_falls_back_to_literal() {
        let mut fx = Fixture::default();
        fx.add(origin("4"));
        fx.update(origin("4"));
        assert_eq!(
            fx.registry.find(&origin("4").key()).unwrap().name,
            UPDATE_FALLBACK_NAME
        );
    }

    #[test]
    fn test_toggle_visibility_hides_disabled_categories() {
        let mut fx = Fixture::default();
        let Change::Added(one) = fx.add(origin("1")) else {
            panic!("expected add");
        };
        let Change::Added(two) = fx.add(origin("2")) else {
            panic!("expected add");
        };
        let disabled: BTreeSet<CategoryKey> = ["2".into()].into_iter().collect();

        fx.registry
            .toggle_visibility(&disabled, true, &fx.table, &mut fx.surface);
        assert!(fx.surface.is_attached(fx.raw_handle(one)));
        assert!(!fx.surface.is_attached(fx.raw_handle(two)));

        fx.registry
            .toggle_visibility(&BTreeSet::new(), false, &fx.table, &mut fx.surface);
        assert!(!fx.surface.is_attached(fx.raw_handle(one)));
        assert!(!fx.surface.is_attached(fx.raw_handle(two)));

        fx.registry
            .toggle_visibility(&BTreeSet::new(), true, &fx.table, &mut fx.surface);
        assert_eq!(
            fx.surface.marker(fx.raw_handle(two)).unwrap().destination,
            Some(Destination::Map)
        );
    }

    #[test]
    fn test_player_blips_go_to_cluster_layer() {
        let mut fx = Fixture::default();
        let layer = fx.clusters.recreate(&mut fx.surface);
        let Change::Added(slot) = fx.add(origin("1").with_attr("isPlayer", true)) else {
            panic!("expected add");
        };
        assert_eq!(
            fx.surface.marker(fx.raw_handle(slot)).unwrap().destination,
            Some(Destination::Cluster(layer))
        );
    }
}
