//! Catalog of togglable overlay layers.
//!
//! The registry is the source of truth for layer visibility: the map widget
//! reads it on every draw pass instead of storing visibility in the rendering
//! state, so a rebuilt or restyled surface always comes back with the correct
//! layers shown. A logical layer may be rendered as several primitives (a
//! polygon fill plus its outline); all of them are gated by the single
//! `visible` flag here and therefore toggle as a unit.

use egui::Color32;

use crate::cache::DatasetKind;

/// A togglable overlay layer.
#[derive(Clone, Debug)]
pub struct OverlayLayer {
    /// Stable identifier, used by toggle commands and count updates.
    pub id: String,
    /// Human readable name for layer panels.
    pub display_name: String,
    /// The dataset kind this layer renders, if it is one of the managed
    /// dataset layers.
    pub kind: Option<DatasetKind>,
    /// Whether the layer is currently shown on the map.
    pub visible: bool,
    /// Base color for the layer's features.
    pub color: Color32,
    /// Number of features in the most recently loaded dataset for this layer.
    pub feature_count: usize,
}

/// The catalog of overlay layers and their visibility state.
pub struct LayerRegistry {
    layers: Vec<OverlayLayer>,
}

impl Default for LayerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerRegistry {
    /// Creates a registry pre-populated with one layer per dataset kind, all
    /// visible.
    pub fn new() -> Self {
        let layers = DatasetKind::ALL
            .iter()
            .map(|kind| OverlayLayer {
                id: kind.layer_id().to_string(),
                display_name: kind.display_name().to_string(),
                kind: Some(*kind),
                visible: true,
                color: kind.default_color(),
                feature_count: 0,
            })
            .collect();
        Self { layers }
    }

    /// Flips the visibility of a layer. No-op for unknown ids.
    pub fn toggle_layer(&mut self, id: &str) {
        if let Some(layer) = self.layer_mut(id) {
            layer.visible = !layer.visible;
        }
    }

    /// Sets the visibility of a layer directly. No-op for unknown ids.
    pub fn set_visible(&mut self, id: &str, visible: bool) {
        if let Some(layer) = self.layer_mut(id) {
            layer.visible = visible;
        }
    }

    /// Whether a layer is currently visible. Unknown ids are not visible.
    pub fn is_visible(&self, id: &str) -> bool {
        self.layer(id).is_some_and(|layer| layer.visible)
    }

    /// Updates the feature count of a layer. Does not affect visibility.
    pub fn set_feature_count(&mut self, id: &str, count: usize) {
        if let Some(layer) = self.layer_mut(id) {
            layer.feature_count = count;
        }
    }

    /// Registers a layer that was not known at initialization. Replaces any
    /// existing layer with the same id.
    pub fn add_layer(&mut self, layer: OverlayLayer) {
        self.remove_layer(&layer.id.clone());
        self.layers.push(layer);
    }

    /// Removes a layer from the catalog, which also removes it from the
    /// visible set. No-op for unknown ids.
    pub fn remove_layer(&mut self, id: &str) {
        self.layers.retain(|layer| layer.id != id);
    }

    /// Looks up a layer by id.
    pub fn layer(&self, id: &str) -> Option<&OverlayLayer> {
        self.layers.iter().find(|layer| layer.id == id)
    }

    fn layer_mut(&mut self, id: &str) -> Option<&mut OverlayLayer> {
        self.layers.iter_mut().find(|layer| layer.id == id)
    }

    /// Looks up the managed layer for a dataset kind.
    pub fn layer_for_kind(&self, kind: DatasetKind) -> Option<&OverlayLayer> {
        self.layers.iter().find(|layer| layer.kind == Some(kind))
    }

    /// Iterates over all layers in registration order, for layer panels.
    pub fn layers(&self) -> impl Iterator<Item = &OverlayLayer> {
        self.layers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_starts_with_all_dataset_layers_visible() {
        let registry = LayerRegistry::new();
        assert_eq!(registry.layers().count(), DatasetKind::ALL.len());
        for kind in DatasetKind::ALL {
            let layer = registry.layer_for_kind(kind).unwrap();
            assert!(layer.visible);
            assert_eq!(layer.feature_count, 0);
        }
    }

    #[test]
    fn toggle_flips_visibility() {
        let mut registry = LayerRegistry::new();
        let id = DatasetKind::Evidence.layer_id();

        registry.toggle_layer(id);
        assert!(!registry.is_visible(id));
        registry.toggle_layer(id);
        assert!(registry.is_visible(id));

        // Unknown ids are a no-op and report not visible.
        registry.toggle_layer("nope");
        assert!(!registry.is_visible("nope"));
    }

    #[test]
    fn feature_count_does_not_affect_visibility() {
        let mut registry = LayerRegistry::new();
        let id = DatasetKind::Concession.layer_id();

        registry.set_visible(id, false);
        registry.set_feature_count(id, 42);

        let layer = registry.layer(id).unwrap();
        assert_eq!(layer.feature_count, 42);
        assert!(!layer.visible);
    }

    #[test]
    fn add_and_remove_dynamic_layers() {
        let mut registry = LayerRegistry::new();
        registry.add_layer(OverlayLayer {
            id: "protected-areas".to_string(),
            display_name: "Protected areas".to_string(),
            kind: None,
            visible: true,
            color: Color32::GOLD,
            feature_count: 0,
        });

        assert!(registry.is_visible("protected-areas"));

        registry.remove_layer("protected-areas");
        assert!(registry.layer("protected-areas").is_none());
        assert!(!registry.is_visible("protected-areas"));
    }

    #[test]
    fn add_layer_replaces_same_id() {
        let mut registry = LayerRegistry::new();
        let before = registry.layers().count();

        registry.add_layer(OverlayLayer {
            id: DatasetKind::Analysis.layer_id().to_string(),
            display_name: "Analyses (renamed)".to_string(),
            kind: Some(DatasetKind::Analysis),
            visible: false,
            color: Color32::WHITE,
            feature_count: 7,
        });

        assert_eq!(registry.layers().count(), before);
        let layer = registry.layer(DatasetKind::Analysis.layer_id()).unwrap();
        assert_eq!(layer.display_name, "Analyses (renamed)");
        assert!(!layer.visible);
    }
}
