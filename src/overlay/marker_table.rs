// Append-only marker slot table with tombstoning.
//
// Slots are never reused or compacted within an epoch, so a slot index stays valid
// until the next `clear_all`, which truncates the table and restarts allocation.

use serde::Serialize;

use super::blip::Position;
use super::catalog::IconStyle;
use super::surface::{Destination, InfoPayload, InfoRow, MarkerHandle, MarkerSpec, RenderSurface};
use crate::metrics;

/// Id returned by [`MarkerTable::create`]: the slot index plus one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MarkerId(u32);

impl MarkerId {
    pub fn get(self) -> u32 {
        self.0
    }

    /// Convert back to the storage index (`id - 1`).
    pub fn slot(self) -> SlotIndex {
        SlotIndex(self.0 - 1)
    }
}

/// Zero-based index into the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SlotIndex(u32);

impl SlotIndex {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn get(self) -> usize {
        self.0 as usize
    }

    /// Conventional name of the companion element rendered for this slot.
    pub fn element_id(self) -> String {
        format!("marker_{}", self.0)
    }
}

/// Logical object a marker represents.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerObject {
    pub reference: String,
    pub position: Position,
    pub icon: Option<IconStyle>,
    pub description: String,
    pub player: Option<String>,
}

impl MarkerObject {
    /// Popup content built at creation time: position, then the description if any.
    pub fn info(&self) -> InfoPayload {
        let mut rows = vec![InfoRow::Position(self.position)];
        if !self.description.is_empty() {
            rows.push(InfoRow::Field {
                label: "Description".to_string(),
                value: self.description.clone(),
            });
        }
        InfoPayload {
            heading: self.reference.clone(),
            rows,
        }
    }
}

#[derive(Debug)]
enum Slot {
    Live {
        handle: MarkerHandle,
        home: Destination,
    },
    Tombstone,
}

/// Exclusive owner of every rendered marker handle.
#[derive(Debug, Default)]
pub struct MarkerTable {
    slots: Vec<Slot>,
    live: usize,
    epoch: u64,
}

impl MarkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a marker in the next slot, attach it to `destination`, bind its popup,
    /// and return its id (slot index + 1).
    pub fn create(
        &mut self,
        surface: &mut dyn RenderSurface,
        destination: Destination,
        draggable: bool,
        object: &MarkerObject,
        title: &str,
    ) -> MarkerId {
        let slot = SlotIndex(self.slots.len() as u32);
        let spec = MarkerSpec {
            slot,
            title: title.to_string(),
            position: object.position,
            icon: object.icon.clone(),
            draggable,
            player: object.player.clone(),
        };

        let handle = surface.create_marker(&spec);
        surface.attach(&handle, destination);
        surface.bind_info(&handle, &object.info());

        self.slots.push(Slot::Live {
            handle,
            home: destination,
        });
        self.live += 1;
        metrics::MARKER_SLOTS_LIVE.set(self.live as i64);

        MarkerId(self.slots.len() as u32)
    }

    /// Destroy the marker in `slot` and tombstone it. No-op when already dead
    /// or out of range.
    pub fn clear(&mut self, surface: &mut dyn RenderSurface, slot: SlotIndex) {
        let Some(entry) = self.slots.get_mut(slot.get()) else {
            tracing::debug!(slot = slot.get(), epoch = self.epoch, "clear on unknown slot ignored");
            return;
        };
        if let Slot::Live { handle, .. } = std::mem::replace(entry, Slot::Tombstone) {
            surface.detach(&handle);
            surface.destroy(handle);
            surface.remove_element(&slot.element_id());
            self.live -= 1;
            metrics::MARKER_SLOTS_LIVE.set(self.live as i64);
        }
    }

    pub fn get(&self, slot: SlotIndex) -> Option<&MarkerHandle> {
        match self.slots.get(slot.get()) {
            Some(Slot::Live { handle, .. }) => Some(handle),
            _ => None,
        }
    }

    /// Destination the marker was created on.
    pub fn home(&self, slot: SlotIndex) -> Option<Destination> {
        match self.slots.get(slot.get()) {
            Some(Slot::Live { home, .. }) => Some(*home),
            _ => None,
        }
    }

    /// Re-attach a live marker to its home destination.
    pub fn show(&self, surface: &mut dyn RenderSurface, slot: SlotIndex) {
        if let Some(Slot::Live { handle, home }) = self.slots.get(slot.get()) {
            surface.attach(handle, *home);
        }
    }

    /// Detach a live marker without destroying it.
    pub fn hide(&self, surface: &mut dyn RenderSurface, slot: SlotIndex) {
        if let Some(Slot::Live { handle, .. }) = self.slots.get(slot.get()) {
            surface.detach(handle);
        }
    }

    /// Tombstone every slot and truncate the table, starting a new id epoch.
    pub fn clear_all(&mut self, surface: &mut dyn RenderSurface) {
        for index in 0..self.slots.len() {
            self.clear(surface, SlotIndex(index as u32));
        }
        self.slots.clear();
        self.epoch += 1;
        metrics::MARKER_EPOCH.set(self.epoch as i64);
        tracing::debug!(epoch = self.epoch, "marker table reset");
    }

    /// Number of allocated slots, tombstones included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}
