// Player cluster layer lifecycle.
//
// A cluster layer is never cleared in place. A reset detaches it and a brand-new one is
// built by a separate, later `finish_recreate` call.

use super::surface::{ClusterLayerId, ClusterOptions, RenderSurface};

/// Proof of a teardown, redeemed later by [`ClusterLayerManager::finish_recreate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a torn-down cluster layer stays absent until the ticket is redeemed"]
pub struct RecreateTicket {
    epoch: u64,
}

/// Owns the active cluster layer for player markers.
#[derive(Debug)]
pub struct ClusterLayerManager {
    options: ClusterOptions,
    current: Option<ClusterLayerId>,
    epoch: u64,
}

impl ClusterLayerManager {
    /// A manager with no layer yet. Call [`recreate`](Self::recreate) to install one.
    pub fn new(options: ClusterOptions) -> Self {
        Self {
            options,
            current: None,
            epoch: 0,
        }
    }

    pub fn current(&self) -> Option<ClusterLayerId> {
        self.current
    }

    /// Build a fresh, empty cluster layer and attach it. Any layer still attached is
    /// detached first, so the surface never carries two.
    pub fn recreate(&mut self, surface: &mut dyn RenderSurface) -> ClusterLayerId {
        if let Some(old) = self.current.take() {
            surface.detach_cluster_layer(old);
        }
        let layer = surface.create_cluster_layer(&self.options);
        surface.attach_cluster_layer(layer);
        self.current = Some(layer);
        tracing::debug!(layer = layer.0, epoch = self.epoch, "cluster layer created");
        layer
    }

    /// Detach the current layer and drop it. Does not recreate.
    pub fn teardown(&mut self, surface: &mut dyn RenderSurface) -> RecreateTicket {
        if let Some(layer) = self.current.take() {
            surface.detach_cluster_layer(layer);
            tracing::debug!(layer = layer.0, "cluster layer torn down");
        }
        self.epoch += 1;
        RecreateTicket { epoch: self.epoch }
    }

    /// Second phase of a reset. Ignored when a later teardown superseded the ticket,
    /// or when a fallback layer was already built in the meantime.
    pub fn finish_recreate(
        &mut self,
        ticket: RecreateTicket,
        surface: &mut dyn RenderSurface,
    ) -> Option<ClusterLayerId> {
        if ticket.epoch != self.epoch {
            tracing::debug!(
                ticket = ticket.epoch,
                epoch = self.epoch,
                "superseded cluster recreate skipped"
            );
            return None;
        }
        if self.current.is_some() {
            return None;
        }
        Some(self.recreate(surface))
    }

    /// Current layer, or an eagerly built fallback when none exists.
    pub fn destination_or_recover(&mut self, surface: &mut dyn RenderSurface) -> ClusterLayerId {
        match self.current {
            Some(layer) => layer,
            None => {
                tracing::warn!("cluster layer missing at marker creation; building a fallback layer");
                self.recreate(surface)
            }
        }
    }
}

impl Default for ClusterLayerManager {
    fn default() -> Self {
        Self::new(ClusterOptions::default())
    }
}
