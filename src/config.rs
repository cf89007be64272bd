//! Configuration for the base-map tile provider and the dataset query endpoints.

use crate::TileId;
use crate::cache::{DatasetKind, ViewportQuery};

/// Configuration for a base-map tile provider.
pub trait MapConfig {
    /// Returns the URL for a given tile.
    fn tile_url(&self, tile: &TileId) -> String;

    /// Returns the attribution text to be displayed on the map. If returns `None`, no attribution is shown.
    fn attribution(&self) -> Option<&String>;

    /// Returns the attribution URL to be linked from the attribution text.
    fn attribution_url(&self) -> Option<&String>;

    /// The default geographical center of the map. (longitude, latitude)
    fn default_center(&self) -> (f64, f64);

    /// The default zoom level of the map.
    fn default_zoom(&self) -> u8;
}

/// Configuration for the OpenStreetMap tile server.
///
/// # Example
///
/// ```
/// use egui_inspection_map::config::OpenStreetMapConfig;
/// let config = OpenStreetMapConfig::default();
/// ```
pub struct OpenStreetMapConfig {
    base_url: String,
    attribution: String,
    attribution_url: String,
    default_center: (f64, f64),
    default_zoom: u8,
}

impl Default for OpenStreetMapConfig {
    fn default() -> Self {
        Self {
            base_url: "https://tile.openstreetmap.org".to_string(),
            attribution: "© OpenStreetMap contributors".to_string(),
            attribution_url: "https://www.openstreetmap.org".to_string(),
            default_center: (-60.0217, -3.1190), // Manaus, Brazil
            default_zoom: 6,
        }
    }
}

impl MapConfig for OpenStreetMapConfig {
    fn tile_url(&self, tile: &TileId) -> String {
        format!("{}/{}/{}/{}.png", self.base_url, tile.z, tile.x, tile.y)
    }

    fn attribution(&self) -> Option<&String> {
        Some(&self.attribution)
    }

    fn attribution_url(&self) -> Option<&String> {
        Some(&self.attribution_url)
    }

    fn default_center(&self) -> (f64, f64) {
        self.default_center
    }

    fn default_zoom(&self) -> u8 {
        self.default_zoom
    }
}

/// Endpoint configuration for the bounded viewport query interface.
///
/// The three dataset endpoints live under one base URL and share a bearer
/// token obtained by the host application. The map core only builds query
/// URLs from this configuration; it never performs authentication itself.
///
/// # Example
///
/// ```
/// use egui_inspection_map::config::DatasetEndpoints;
/// let endpoints = DatasetEndpoints::new("https://api.example.org/v1", "token");
/// ```
#[derive(Clone)]
pub struct DatasetEndpoints {
    base_url: String,
    bearer_token: String,
}

impl DatasetEndpoints {
    /// Creates a new endpoint configuration.
    pub fn new(base_url: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            bearer_token: bearer_token.into(),
        }
    }

    /// The bearer token sent with every dataset request.
    pub fn bearer_token(&self) -> &str {
        &self.bearer_token
    }

    /// Builds the bounded query URL for one dataset kind.
    ///
    /// The bounding box is serialized west,south,east,north with the same
    /// fixed precision the cache key uses.
    pub fn query_url(&self, kind: DatasetKind, query: &ViewportQuery) -> String {
        let b = &query.bounds;
        format!(
            "{}/{}?bbox={:.6},{:.6},{:.6},{:.6}&zoom={}",
            self.base_url,
            kind.endpoint_path(),
            b.west,
            b.south,
            b.east,
            b.north,
            query.zoom
        )
    }
}
