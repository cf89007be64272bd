#![warn(missing_docs)]

//! An interactive environmental-inspection map viewer for `egui`.
//!
//! This crate provides a `MapView` widget that renders a slippy base map and
//! layers live inspection datasets (point evidence, concession polygons,
//! analysis polygons) on top of it, loaded per viewport through a TTL cache.
//! It supports panning, zooming, freehand distance measurement, polygon
//! drawing, feature popups, layer toggling and raster export of the rendered
//! canvas.
//!
//! # Example
//!
//! ```no_run
//! use eframe::egui;
//! use egui_inspection_map::{MapView, config::{DatasetEndpoints, OpenStreetMapConfig}};
//!
//! struct MyApp {
//!     map: MapView,
//! }
//!
//! impl Default for MyApp {
//!     fn default() -> Self {
//!         Self {
//!             map: MapView::new(
//!                 OpenStreetMapConfig::default(),
//!                 DatasetEndpoints::new("https://api.example.org/v1", "bearer-token"),
//!             ),
//!         }
//!     }
//! }
//!
//! impl eframe::App for MyApp {
//!     fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
//!         egui::CentralPanel::default()
//!             .frame(egui::Frame::NONE)
//!             .show(ctx, |ui| {
//!                 ui.add(&mut self.map);
//!             });
//!     }
//! }
//! ```

/// Viewport-keyed dataset cache and the dataset source seam.
pub mod cache;
/// Configuration for the tile provider and the dataset query endpoints.
pub mod config;
/// Raster export of the rendered canvas.
pub mod export;
/// Pure measurement and bounding-box utilities.
pub mod geometry;
/// Dataset overlay rendering, hit-testing and popups.
pub mod overlay;
/// Map projection.
pub mod projection;
/// Catalog of togglable overlay layers.
pub mod registry;
/// Measurement and drawing tools.
pub mod tools;

use eframe::egui;
use egui::{Color32, CursorIcon, Rect, Response, Sense, Stroke, Ui, Vec2, Widget, pos2};
use eyre::{Context, Result};
use log::{debug, error};
use once_cell::sync::Lazy;
use poll_promise::Promise;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::cache::{DatasetSource, HttpDatasetSource, ViewportCache, ViewportQuery};
use crate::config::{DatasetEndpoints, MapConfig};
use crate::export::ExportOptions;
use crate::overlay::PopupInfo;
use crate::projection::{GeoPos, MapProjection};
use crate::registry::LayerRegistry;
use crate::tools::ToolLayer;

// The size of a map tile in pixels.
pub(crate) const TILE_SIZE: u32 = 256;
/// The minimum zoom level.
pub const MIN_ZOOM: u8 = 0;
/// The maximum zoom level.
pub const MAX_ZOOM: u8 = 19;

// How many frames to wait for a requested frame capture before the export is
// reported as failed. Some backends never deliver the screenshot event.
const EXPORT_TIMEOUT_FRAMES: u16 = 120;

// Reuse the reqwest client for all tile and dataset downloads by making it a
// static variable.
pub(crate) static CLIENT: Lazy<reqwest::blocking::Client> = Lazy::new(|| {
    reqwest::blocking::Client::builder()
        .user_agent(format!(
            "{}/{}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ))
        .build()
        .expect("Failed to build reqwest client")
});

/// Errors that can occur while using the map widget.
#[derive(Error, Debug)]
pub enum MapError {
    /// An error occurred while making a web request.
    #[error("Connection error")]
    ConnectionError(#[from] reqwest::Error),

    /// A map tile failed to download.
    #[error("A map tile failed to download. HTTP Status: `{0}`")]
    TileDownloadError(String),

    /// A dataset query returned a non-success status.
    #[error("A dataset query failed. HTTP Status: `{0}`")]
    DatasetDownloadError(String),

    /// A dataset payload was not valid GeoJSON.
    #[error("Invalid GeoJSON payload")]
    GeoJsonError(#[from] geojson::Error),

    /// Raster bytes could not be decoded or encoded.
    #[error("Unable to decode or encode raster image data")]
    ImageError(#[from] image::ImageError),

    /// The export file could not be written.
    #[error("Unable to write export file")]
    ExportIoError(#[from] std::io::Error),

    /// The rendered canvas could not be exported.
    #[error("Unable to export map canvas: {0}")]
    ExportError(String),
}

/// A unique identifier for a map tile.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct TileId {
    /// The zoom level.
    pub z: u8,

    /// The x-coordinate of the tile.
    pub x: u32,

    /// The y-coordinate of the tile.
    pub y: u32,
}

impl TileId {
    fn to_url(&self, config: &dyn MapConfig) -> String {
        config.tile_url(self)
    }
}

/// The state of a tile in the cache.
enum Tile {
    /// The tile is being downloaded.
    Loading(Promise<Result<egui::ColorImage, Arc<eyre::Report>>>),

    /// The tile is in memory.
    Loaded(egui::TextureHandle),

    /// The tile failed to download.
    Failed(Arc<eyre::Report>),
}

/// The inspection map widget.
///
/// Composition root of the crate: owns the live rendering state (center,
/// zoom, tile cache), the viewport dataset cache, the layer registry, the
/// interaction tools and the popup/export state. All mutation of the
/// rendering surface happens inside the widget's `ui` pass.
pub struct MapView {
    /// The geographical center of the map.
    pub center: GeoPos,

    /// The zoom level of the map.
    pub zoom: u8,

    tiles: HashMap<TileId, Tile>,

    /// The geographical position under the mouse pointer, if any.
    pub mouse_pos: Option<GeoPos>,

    /// Configuration for the base map, such as the tile server URL.
    config: Box<dyn MapConfig>,

    /// The viewport dataset cache.
    cache: ViewportCache,

    /// The overlay layer catalog; source of truth for layer visibility and
    /// feature counts, consumed by layer panels.
    pub registry: LayerRegistry,

    /// The measurement/drawing tool layer, consumed by toolbars and results
    /// panels.
    pub tools: ToolLayer,

    popup: Option<PopupInfo>,
    current_query: Option<ViewportQuery>,

    export_dir: PathBuf,
    pending_export: Option<ExportOptions>,
    screenshot_requested: bool,
    export_frames_waited: u16,
    last_export: Option<Result<PathBuf, String>>,
}

impl MapView {
    /// Creates a new `MapView` widget fetching datasets over HTTP.
    ///
    /// # Arguments
    ///
    /// * `config` - A type that implements `MapConfig`, which provides configuration for the base map.
    /// * `endpoints` - The bounded dataset query endpoints and bearer token.
    pub fn new<C: MapConfig + 'static>(config: C, endpoints: DatasetEndpoints) -> Self {
        Self::with_source(config, Arc::new(HttpDatasetSource::new(endpoints)))
    }

    /// Creates a new `MapView` widget with an explicit dataset source, which
    /// lets hosts and tests substitute the query interface.
    pub fn with_source<C: MapConfig + 'static>(config: C, source: Arc<dyn DatasetSource>) -> Self {
        let center = config.default_center().into();
        let zoom = config.default_zoom();
        Self {
            tiles: HashMap::new(),
            mouse_pos: None,
            config: Box::new(config),
            cache: ViewportCache::new(source),
            registry: LayerRegistry::new(),
            tools: ToolLayer::new(),
            popup: None,
            current_query: None,
            export_dir: PathBuf::from("."),
            pending_export: None,
            screenshot_requested: false,
            export_frames_waited: 0,
            last_export: None,
            center,
            zoom,
        }
    }

    /// The currently open feature popup, if any.
    pub fn popup(&self) -> Option<&PopupInfo> {
        self.popup.as_ref()
    }

    /// Closes the feature popup.
    pub fn close_popup(&mut self) {
        self.popup = None;
    }

    /// Sets the directory export files are written to.
    pub fn set_export_directory(&mut self, directory: impl Into<PathBuf>) {
        self.export_dir = directory.into();
    }

    /// Requests a raster export of the rendered canvas.
    ///
    /// The capture happens at the end of the current frame; the outcome is
    /// available from [`MapView::last_export`] afterwards. Map and tool state
    /// are not affected.
    pub fn request_export(&mut self, options: ExportOptions) {
        self.pending_export = Some(options);
        self.screenshot_requested = false;
        self.export_frames_waited = 0;
    }

    /// The outcome of the most recent export command: the written path, or
    /// an error message suitable for display.
    pub fn last_export(&self) -> Option<&Result<PathBuf, String>> {
        self.last_export.as_ref()
    }

    /// Handles user input for panning and zooming.
    fn handle_input(&mut self, ui: &Ui, rect: &Rect, response: &Response) {
        // Handle panning
        if response.dragged() {
            let delta = response.drag_delta();
            let center_in_tiles_x = lon_to_x(self.center.lon, self.zoom);
            let center_in_tiles_y = lat_to_y(self.center.lat, self.zoom);

            let mut new_center_x = center_in_tiles_x - (delta.x as f64 / TILE_SIZE as f64);
            let mut new_center_y = center_in_tiles_y - (delta.y as f64 / TILE_SIZE as f64);

            // Clamp the new center to the map boundaries.
            let world_size_in_tiles = 2.0_f64.powi(self.zoom as i32);
            let view_size_in_tiles_x = rect.width() as f64 / TILE_SIZE as f64;
            let view_size_in_tiles_y = rect.height() as f64 / TILE_SIZE as f64;

            let min_center_x = view_size_in_tiles_x / 2.0;
            let max_center_x = world_size_in_tiles - view_size_in_tiles_x / 2.0;
            let min_center_y = view_size_in_tiles_y / 2.0;
            let max_center_y = world_size_in_tiles - view_size_in_tiles_y / 2.0;

            // If the map is smaller than the viewport, center it. Otherwise, clamp the center.
            new_center_x = if min_center_x > max_center_x {
                world_size_in_tiles / 2.0
            } else {
                new_center_x.clamp(min_center_x, max_center_x)
            };
            new_center_y = if min_center_y > max_center_y {
                world_size_in_tiles / 2.0
            } else {
                new_center_y.clamp(min_center_y, max_center_y)
            };

            self.center = GeoPos {
                lon: x_to_lon(new_center_x, self.zoom),
                lat: y_to_lat(new_center_y, self.zoom),
            };
        }

        // Handle double-click to zoom and center
        if response.double_clicked() {
            if let Some(pointer_pos) = response.interact_pointer_pos() {
                let new_zoom = (self.zoom + 1).clamp(MIN_ZOOM, MAX_ZOOM);

                if new_zoom != self.zoom {
                    // Determine the geo-coordinate under the mouse cursor before the zoom
                    let mouse_rel = pointer_pos - rect.min;
                    let center_x = lon_to_x(self.center.lon, self.zoom);
                    let center_y = lat_to_y(self.center.lat, self.zoom);
                    let widget_center_x = rect.width() as f64 / 2.0;
                    let widget_center_y = rect.height() as f64 / 2.0;

                    let target_x =
                        center_x + (mouse_rel.x as f64 - widget_center_x) / TILE_SIZE as f64;
                    let target_y =
                        center_y + (mouse_rel.y as f64 - widget_center_y) / TILE_SIZE as f64;

                    let new_center_lon = x_to_lon(target_x, self.zoom);
                    let new_center_lat = y_to_lat(target_y, self.zoom);

                    // Set the new zoom level and center the map on the clicked location
                    self.zoom = new_zoom;
                    self.center = GeoPos {
                        lon: new_center_lon,
                        lat: new_center_lat,
                    };
                }
            }
        }

        // Handle zooming and mouse position
        if response.hovered() {
            if let Some(mouse_pos) = response.hover_pos() {
                let mouse_rel = mouse_pos - rect.min;

                // Determine the geo-coordinate under the mouse cursor.
                let center_x = lon_to_x(self.center.lon, self.zoom);
                let center_y = lat_to_y(self.center.lat, self.zoom);
                let widget_center_x = rect.width() as f64 / 2.0;
                let widget_center_y = rect.height() as f64 / 2.0;

                let target_x = center_x + (mouse_rel.x as f64 - widget_center_x) / TILE_SIZE as f64;
                let target_y = center_y + (mouse_rel.y as f64 - widget_center_y) / TILE_SIZE as f64;

                self.mouse_pos = Some(GeoPos {
                    lon: x_to_lon(target_x, self.zoom),
                    lat: y_to_lat(target_y, self.zoom),
                });

                let scroll = ui.input(|i| i.raw_scroll_delta.y);
                if scroll != 0.0 {
                    let old_zoom = self.zoom;
                    let mut new_zoom = (self.zoom as i32 + scroll.signum() as i32)
                        .clamp(MIN_ZOOM as i32, MAX_ZOOM as i32)
                        as u8;

                    // If we are zooming out, check if the new zoom level is valid.
                    if scroll < 0.0 {
                        let world_pixel_size = 2.0_f64.powi(new_zoom as i32) * TILE_SIZE as f64;
                        // If the world size would become smaller than the widget size, reject the zoom.
                        if world_pixel_size < rect.width() as f64
                            || world_pixel_size < rect.height() as f64
                        {
                            new_zoom = old_zoom; // Effectively cancel the zoom by reverting to the old value.
                        }
                    }

                    if new_zoom != old_zoom {
                        let target_lon = x_to_lon(target_x, old_zoom);
                        let target_lat = y_to_lat(target_y, old_zoom);

                        // Set the new zoom level
                        self.zoom = new_zoom;

                        // Adjust the map center so the geo-coordinate under the mouse remains the
                        // same
                        let new_target_x = lon_to_x(target_lon, new_zoom);
                        let new_target_y = lat_to_y(target_lat, new_zoom);

                        let new_center_x = new_target_x
                            - (mouse_rel.x as f64 - widget_center_x) / TILE_SIZE as f64;
                        let new_center_y = new_target_y
                            - (mouse_rel.y as f64 - widget_center_y) / TILE_SIZE as f64;

                        self.center = GeoPos {
                            lon: x_to_lon(new_center_x, new_zoom),
                            lat: y_to_lat(new_center_y, new_zoom),
                        };
                    }
                }
            } else {
                self.mouse_pos = None;
            }
        } else {
            self.mouse_pos = None;
        }
    }

    /// Dispatches map clicks: an active tool consumes them, otherwise the
    /// click selects (or clears) a feature popup.
    fn handle_click(&mut self, response: &Response, projection: &MapProjection) {
        if !response.clicked() {
            return;
        }
        let Some(pointer_pos) = response.interact_pointer_pos() else {
            return;
        };

        if self.tools.is_active() {
            // Tool clicks must not also open feature popups.
            self.tools.handle_click(projection.unproject(pointer_pos));
            return;
        }

        // Every click either replaces or clears the popup.
        self.popup = self
            .current_query
            .and_then(|query| self.cache.get(&query))
            .and_then(|bundle| overlay::hit_test(pointer_pos, projection, &self.registry, bundle));
    }

    /// Sets the cursor affordance: crosshair while a tool is active, pointer
    /// over an interactive feature. Purely cosmetic.
    fn update_cursor(&self, response: &Response, projection: &MapProjection) {
        if self.tools.is_active() {
            response.ctx.set_cursor_icon(CursorIcon::Crosshair);
            return;
        }

        if let Some(hover_pos) = response.hover_pos() {
            let hovering_feature = self
                .current_query
                .and_then(|query| self.cache.get(&query))
                .and_then(|bundle| {
                    overlay::hit_test(hover_pos, projection, &self.registry, bundle)
                })
                .is_some();
            if hovering_feature {
                response.ctx.set_cursor_icon(CursorIcon::PointingHand);
            }
        }
    }

    /// Recomputes the viewport query for the current bounds and drives the
    /// dataset cache. Safe to call every frame: a fresh key is a no-op.
    ///
    /// New fetches are only issued once the viewport has settled, meaning the
    /// query key is unchanged since the previous frame. A pan or zoom moves
    /// the bounds every frame and every intermediate viewport would otherwise
    /// issue its own fetch triple.
    fn update_viewport(&mut self, projection: &MapProjection) {
        let query = ViewportQuery {
            bounds: projection.visible_bounds(),
            zoom: self.zoom,
        };
        let settled = self
            .current_query
            .is_some_and(|previous| previous.cache_key() == query.cache_key());
        if settled {
            self.cache.load(&query, &mut self.registry);
        }
        self.cache.poll(&mut self.registry);
        self.current_query = Some(query);
    }

    /// Draws the map tiles and attribution.
    fn draw_map_and_attribution(&mut self, ui: &mut Ui, rect: &Rect) {
        let painter = ui.painter_at(*rect);
        painter.rect_filled(*rect, 0.0, Color32::from_rgb(220, 220, 220)); // Background

        let visible_tiles: Vec<_> = self.visible_tiles(rect).collect();
        for (tile_id, tile_pos) in visible_tiles {
            self.draw_tile(ui, &painter, tile_id, tile_pos);
        }

        self.draw_attribution(ui, rect);
    }

    /// Returns an iterator over the visible tiles.
    fn visible_tiles(&self, rect: &Rect) -> impl Iterator<Item = (TileId, egui::Pos2)> {
        let center_x = lon_to_x(self.center.lon, self.zoom);
        let center_y = lat_to_y(self.center.lat, self.zoom);

        let widget_center_x = rect.width() / 2.0;
        let widget_center_y = rect.height() / 2.0;

        let x_min = (center_x - widget_center_x as f64 / TILE_SIZE as f64).floor() as i32;
        let y_min = (center_y - widget_center_y as f64 / TILE_SIZE as f64).floor() as i32;
        let x_max = (center_x + widget_center_x as f64 / TILE_SIZE as f64).ceil() as i32;
        let y_max = (center_y + widget_center_y as f64 / TILE_SIZE as f64).ceil() as i32;

        let zoom = self.zoom;
        let rect_min = rect.min;
        (x_min..=x_max).flat_map(move |x| {
            (y_min..=y_max).map(move |y| {
                let tile_id = TileId {
                    z: zoom,
                    x: x as u32,
                    y: y as u32,
                };
                let screen_x = widget_center_x + (x as f64 - center_x) as f32 * TILE_SIZE as f32;
                let screen_y = widget_center_y + (y as f64 - center_y) as f32 * TILE_SIZE as f32;
                let tile_pos = rect_min + Vec2::new(screen_x, screen_y);
                (tile_id, tile_pos)
            })
        })
    }

    /// Draws a single map tile.
    fn draw_tile(
        &mut self,
        ui: &mut Ui,
        painter: &egui::Painter,
        tile_id: TileId,
        tile_pos: egui::Pos2,
    ) {
        let tile_state = self.tiles.entry(tile_id).or_insert_with(|| {
            let url = tile_id.to_url(self.config.as_ref());
            let promise =
                Promise::spawn_thread("download_tile", move || -> Result<_, Arc<eyre::Report>> {
                    let result: Result<_, eyre::Report> = (|| {
                        debug!("Downloading tile from {}", &url);
                        let response = CLIENT.get(&url).send().map_err(MapError::from)?;

                        if !response.status().is_success() {
                            return Err(MapError::TileDownloadError(response.status().to_string()));
                        }

                        let bytes = response.bytes().map_err(MapError::from)?.to_vec();
                        let image = image::load_from_memory(&bytes)
                            .map_err(MapError::from)?
                            .to_rgba8();

                        let size = [image.width() as _, image.height() as _];
                        let pixels = image.into_raw();
                        Ok(egui::ColorImage::from_rgba_unmultiplied(size, &pixels))
                    })()
                    .with_context(|| format!("Failed to download tile from {}", &url));

                    result.map_err(Arc::new)
                });
            Tile::Loading(promise)
        });

        // If the tile is loading, check if the promise is ready and update the state.
        // This is done before matching on the state, so that we can immediately draw
        // the tile if it has just finished loading.
        if let Tile::Loading(promise) = tile_state {
            if let Some(result) = promise.ready() {
                match result {
                    Ok(color_image) => {
                        let texture = ui.ctx().load_texture(
                            format!("tile_{}_{}_{}", tile_id.z, tile_id.x, tile_id.y),
                            color_image.clone(),
                            Default::default(),
                        );
                        *tile_state = Tile::Loaded(texture);
                    }
                    Err(e) => {
                        error!("{:?}", e);
                        *tile_state = Tile::Failed(e.clone());
                    }
                }
            }
        }

        let tile_rect =
            Rect::from_min_size(tile_pos, Vec2::new(TILE_SIZE as f32, TILE_SIZE as f32));

        match tile_state {
            Tile::Loading(_) => {
                // Draw a gray background and a border for the placeholder.
                painter.rect_filled(tile_rect, 0.0, Color32::from_gray(220));
                painter.rect_stroke(
                    tile_rect,
                    0.0,
                    egui::Stroke::new(1.0, Color32::GRAY),
                    egui::StrokeKind::Inside,
                );

                // The tile is still loading, so we need to tell egui to repaint.
                ui.ctx().request_repaint();
            }
            Tile::Loaded(texture) => {
                painter.image(
                    texture.id(),
                    tile_rect,
                    Rect::from_min_max(pos2(0.0, 0.0), pos2(1.0, 1.0)),
                    Color32::WHITE,
                );
            }
            Tile::Failed(e) => {
                // Draw a gray background and a border for the placeholder.
                painter.rect_filled(tile_rect, 0.0, Color32::from_gray(220));
                painter.rect_stroke(
                    tile_rect,
                    0.0,
                    egui::Stroke::new(1.0, Color32::GRAY),
                    egui::StrokeKind::Inside,
                );

                // Draw a red exclamation mark in the center.
                painter.text(
                    tile_rect.center(),
                    egui::Align2::CENTER_CENTER,
                    "!",
                    egui::FontId::proportional(40.0),
                    Color32::RED,
                );

                let response = ui.interact(tile_rect, ui.id().with(tile_id), Sense::hover());
                response.on_hover_text(format!("{}", e));
            }
        }
    }

    /// Draws dataset overlays, tool previews and committed results.
    fn draw_overlays(&self, painter: &egui::Painter, projection: &MapProjection) {
        if let Some(bundle) = self.current_query.and_then(|query| self.cache.get(&query)) {
            overlay::draw_bundle(painter, projection, &self.registry, bundle);
        }

        self.draw_committed_results(painter, projection);
        self.draw_tool_preview(painter, projection);
    }

    fn draw_committed_results(&self, painter: &egui::Painter, projection: &MapProjection) {
        let measure_color = Color32::from_rgb(255, 140, 0);
        for measurement in self.tools.measurements() {
            let screen_points: Vec<egui::Pos2> = measurement
                .vertices
                .iter()
                .map(|p| projection.project(*p))
                .collect();
            if let Some(mid) = screen_points.get(screen_points.len() / 2).copied() {
                painter.add(egui::Shape::line(
                    screen_points,
                    Stroke::new(2.0, measure_color),
                ));
                painter.text(
                    mid + egui::vec2(0.0, -12.0),
                    egui::Align2::CENTER_BOTTOM,
                    &measurement.formatted_value,
                    egui::FontId::proportional(13.0),
                    measure_color,
                );
            }
        }

        let draw_color = Color32::from_rgb(108, 113, 196);
        for drawing in self.tools.drawings() {
            overlay::draw_geo_ring(painter, projection, &drawing.vertices, draw_color);
            let label_pos = projection.project(geometry::center_from_points(&drawing.vertices));
            painter.text(
                label_pos,
                egui::Align2::CENTER_CENTER,
                &drawing.formatted_area,
                egui::FontId::proportional(13.0),
                Color32::WHITE,
            );
        }
    }

    fn draw_tool_preview(&self, painter: &egui::Painter, projection: &MapProjection) {
        let Some(points) = self.tools.active_points() else {
            return;
        };

        let preview_color = match self.tools.state() {
            tools::ToolState::Measuring { .. } => Color32::from_rgb(255, 140, 0),
            _ => Color32::from_rgb(108, 113, 196),
        };
        let screen_points: Vec<egui::Pos2> =
            points.iter().map(|p| projection.project(*p)).collect();

        match self.tools.state() {
            tools::ToolState::Measuring { .. } => {
                if screen_points.len() > 1 {
                    painter.add(egui::Shape::line(
                        screen_points.clone(),
                        Stroke::new(2.0, preview_color),
                    ));
                }
                if let (Some(distance), Some(last)) =
                    (self.tools.running_distance(), screen_points.last())
                {
                    painter.text(
                        *last + egui::vec2(10.0, -10.0),
                        egui::Align2::LEFT_BOTTOM,
                        geometry::format_distance(distance),
                        egui::FontId::proportional(13.0),
                        preview_color,
                    );
                }
            }
            tools::ToolState::Drawing { .. } => {
                if points.len() >= 3 {
                    overlay::draw_geo_ring(painter, projection, points, preview_color);
                } else if screen_points.len() > 1 {
                    painter.add(egui::Shape::line(
                        screen_points.clone(),
                        Stroke::new(2.0, preview_color),
                    ));
                }
            }
            tools::ToolState::Idle => {}
        }

        // Vertex markers on top of the preview geometry.
        for point in &screen_points {
            painter.circle_filled(*point, 4.0, Color32::WHITE);
            painter.circle_stroke(*point, 4.0, Stroke::new(1.5, preview_color));
        }
    }

    /// Draws the feature popup as a floating area over the map.
    fn draw_popup(&mut self, ui: &mut Ui, projection: &MapProjection) {
        let Some(popup) = self.popup.clone() else {
            return;
        };

        let anchor = projection.project(GeoPos {
            lon: popup.lon,
            lat: popup.lat,
        });
        let frame = egui::Frame::popup(ui.style());
        let mut close = false;

        egui::Area::new(ui.id().with("feature_popup"))
            .fixed_pos(anchor + egui::vec2(12.0, -12.0))
            .show(ui.ctx(), |ui| {
                frame.show(ui, |ui| {
                    ui.set_max_width(260.0);
                    ui.horizontal(|ui| {
                        ui.strong(popup.title());
                        if ui.small_button("✖").clicked() {
                            close = true;
                        }
                    });
                    ui.label(format!("{:.5}, {:.5}", popup.lat, popup.lon));
                    if let Some(properties) = &popup.feature.properties {
                        for (key, value) in properties.iter().take(6) {
                            ui.label(format!("{key}: {value}"));
                        }
                    }
                    if ui.small_button("Copy coordinates").clicked() {
                        ui.ctx()
                            .copy_text(format!("{:.6},{:.6}", popup.lat, popup.lon));
                    }
                });
            });

        if close {
            self.popup = None;
        }
    }

    /// Draws the loading indicator and, when every dataset failed, the error
    /// chip.
    fn draw_status_chips(&self, ui: &mut Ui, rect: &Rect) {
        let Some(query) = self.current_query else {
            return;
        };

        if self.cache.is_loading(&query) {
            egui::Area::new(ui.id().with("loading_chip"))
                .fixed_pos(rect.right_top())
                .anchor(egui::Align2::RIGHT_TOP, egui::vec2(-5.0, 5.0))
                .show(ui.ctx(), |ui| {
                    egui::Frame::popup(ui.style()).show(ui, |ui| {
                        ui.horizontal(|ui| {
                            ui.spinner();
                            ui.label("Loading datasets…");
                        });
                    });
                });
            ui.ctx().request_repaint();
        } else if self.cache.get(&query).is_some_and(cache::DatasetBundle::is_empty) {
            egui::Area::new(ui.id().with("error_chip"))
                .fixed_pos(rect.right_top())
                .anchor(egui::Align2::RIGHT_TOP, egui::vec2(-5.0, 5.0))
                .show(ui.ctx(), |ui| {
                    egui::Frame::popup(ui.style()).show(ui, |ui| {
                        ui.colored_label(Color32::RED, "Datasets unavailable");
                    });
                });
        }
    }

    /// Draws the attribution text.
    fn draw_attribution(&self, ui: &mut Ui, rect: &Rect) {
        if let Some(attribution) = self.config.attribution() {
            let (_text_color, bg_color) = if ui.visuals().dark_mode {
                (Color32::from_gray(230), Color32::from_black_alpha(150))
            } else {
                (Color32::from_gray(80), Color32::from_white_alpha(150))
            };

            let frame = egui::Frame::NONE
                .inner_margin(egui::Margin::same(5)) // A bit of padding
                .fill(bg_color)
                .corner_radius(3.0);

            egui::Area::new(ui.id().with("attribution"))
                .fixed_pos(rect.left_bottom())
                .anchor(egui::Align2::LEFT_BOTTOM, egui::vec2(5.0, -5.0))
                .show(ui.ctx(), |ui| {
                    frame.show(ui, |ui| {
                        ui.style_mut().override_text_style = Some(egui::TextStyle::Small);
                        ui.style_mut().wrap_mode = Some(egui::TextWrapMode::Extend); // Don't wrap attribution text.

                        if let Some(url) = self.config.attribution_url() {
                            ui.hyperlink_to(attribution, url);
                        } else {
                            ui.label(attribution);
                        }
                    });
                });
        }
    }

    /// Drives a pending export: requests a frame capture, then encodes and
    /// writes the arriving screenshot.
    fn handle_export(&mut self, ui: &Ui) {
        if self.pending_export.is_none() {
            return;
        }

        if !self.screenshot_requested {
            ui.ctx()
                .send_viewport_cmd(egui::ViewportCommand::Screenshot(egui::UserData::default()));
            self.screenshot_requested = true;
            return;
        }

        let capture = ui.ctx().input(|i| {
            i.raw.events.iter().find_map(|event| match event {
                egui::Event::Screenshot { image, .. } => Some(image.clone()),
                _ => None,
            })
        });

        let Some(image) = capture else {
            if self.expire_export_wait() {
                error!("Map export failed: no frame capture arrived");
            } else {
                ui.ctx().request_repaint();
            }
            return;
        };

        if let Some(options) = self.pending_export.take() {
            self.screenshot_requested = false;
            self.last_export = Some(
                export::write_export(&image, &options, &self.export_dir).map_err(|e| {
                    error!("Map export failed: {e}");
                    e.to_string()
                }),
            );
        }
    }

    /// Counts one frame spent waiting for a capture. On timeout the pending
    /// export is dropped and the failure recorded; returns whether it expired.
    fn expire_export_wait(&mut self) -> bool {
        self.export_frames_waited += 1;
        if self.export_frames_waited < EXPORT_TIMEOUT_FRAMES {
            return false;
        }
        self.pending_export = None;
        self.screenshot_requested = false;
        self.last_export = Some(Err(
            "export timed out waiting for a frame capture".to_string(),
        ));
        true
    }
}

/// Converts longitude to the x-coordinate of a tile at a given zoom level.
pub(crate) fn lon_to_x(lon: f64, zoom: u8) -> f64 {
    (lon + 180.0) / 360.0 * (2.0_f64.powi(zoom as i32))
}

/// Converts latitude to the y-coordinate of a tile at a given zoom level.
pub(crate) fn lat_to_y(lat: f64, zoom: u8) -> f64 {
    (1.0 - lat.to_radians().tan().asinh() / std::f64::consts::PI) / 2.0
        * (2.0_f64.powi(zoom as i32))
}

/// Converts the x-coordinate of a tile to longitude at a given zoom level.
pub(crate) fn x_to_lon(x: f64, zoom: u8) -> f64 {
    x / (2.0_f64.powi(zoom as i32)) * 360.0 - 180.0
}

/// Converts the y-coordinate of a tile to latitude at a given zoom level.
pub(crate) fn y_to_lat(y: f64, zoom: u8) -> f64 {
    let n = std::f64::consts::PI - 2.0 * std::f64::consts::PI * y / (2.0_f64.powi(zoom as i32));
    n.sinh().atan().to_degrees()
}

impl Widget for &mut MapView {
    fn ui(self, ui: &mut Ui) -> Response {
        let (rect, response) =
            ui.allocate_exact_size(ui.available_size(), Sense::drag().union(Sense::click()));
        self.handle_input(ui, &rect, &response);

        // The projection is rebuilt after input so clicks and drawing use the
        // settled center/zoom of this frame.
        let projection = MapProjection::new(self.zoom, self.center, rect);
        self.handle_click(&response, &projection);
        self.update_viewport(&projection);

        self.draw_map_and_attribution(ui, &rect);
        let painter = ui.painter_at(rect);
        self.draw_overlays(&painter, &projection);
        self.draw_popup(ui, &projection);
        self.draw_status_chips(ui, &rect);
        self.update_cursor(&response, &projection);
        self.handle_export(ui);

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DatasetKind;
    use crate::config::OpenStreetMapConfig;
    use geojson::FeatureCollection;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const EPSILON: f64 = 1e-9;

    #[derive(Default)]
    struct CountingSource {
        fetches: AtomicUsize,
    }

    impl DatasetSource for CountingSource {
        fn fetch(
            &self,
            _kind: DatasetKind,
            _query: &ViewportQuery,
        ) -> Result<FeatureCollection, MapError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(FeatureCollection {
                bbox: None,
                features: vec![],
                foreign_members: None,
            })
        }
    }

    #[test]
    fn test_coord_conversion_roundtrip() {
        let original_lon = -60.0217;
        let original_lat = -3.1190;
        let zoom: u8 = 10;

        let x = lon_to_x(original_lon, zoom);
        let y = lat_to_y(original_lat, zoom);

        let final_lon = x_to_lon(x, zoom);
        let final_lat = y_to_lat(y, zoom);

        assert!((original_lon - final_lon).abs() < EPSILON);
        assert!((original_lat - final_lat).abs() < EPSILON);

        let original_lon = -122.4194;
        let original_lat = 37.7749;

        let x = lon_to_x(original_lon, zoom);
        let y = lat_to_y(original_lat, zoom);

        let final_lon = x_to_lon(x, zoom);
        let final_lat = y_to_lat(y, zoom);

        assert!((original_lon - final_lon).abs() < EPSILON);
        assert!((original_lat - final_lat).abs() < EPSILON);
    }

    #[test]
    fn test_y_to_lat_conversion() {
        // y, zoom, expected_lat
        let test_cases = vec![
            // Equator
            (0.5, 0, 0.0),
            (128.0, 8, 0.0),
            // Near poles (Mercator projection limits)
            (0.0, 0, 85.0511287798),
            (1.0, 0, -85.0511287798),
            (0.0, 8, 85.0511287798),
            (256.0, 8, -85.0511287798),
            // Helsinki
            (9.262574089998255, 5, 60.16952),
            // London
            (85.12653378959828, 8, 51.5074),
        ];

        for (y, zoom, expected_lat) in test_cases {
            assert!((y_to_lat(y, zoom) - expected_lat).abs() < EPSILON);
        }
    }

    #[test]
    fn test_lat_to_y_conversion() {
        // lat, zoom, expected_y
        let test_cases = vec![
            // Equator
            (0.0, 0, 0.5),
            (0.0, 8, 128.0),
            // Near poles (Mercator projection limits)
            (85.0511287798, 0, 0.0),
            (-85.0511287798, 0, 1.0),
            (85.0511287798, 8, 0.0),
            (-85.0511287798, 8, 256.0),
            // Helsinki
            (60.16952, 5, 9.262574089998255),
            // London
            (51.5074, 8, 85.12653378959828),
        ];

        for (lat, zoom, expected_y) in test_cases {
            assert!((lat_to_y(lat, zoom) - expected_y).abs() < EPSILON);
        }
    }

    #[test]
    fn test_x_to_lon_conversion() {
        // x, zoom, expected_lon
        let test_cases = vec![
            // Center of the map
            (0.5, 0, 0.0),
            (128.0, 8, 0.0),
            // Edges of the map
            (0.0, 0, -180.0),
            (1.0, 0, 180.0),
            (0.0, 8, -180.0),
            (256.0, 8, 180.0),
            // Helsinki
            (18.216484444444444, 5, 24.93545),
        ];

        for (x, zoom, expected_lon) in test_cases {
            assert!((x_to_lon(x, zoom) - expected_lon).abs() < EPSILON);
        }
    }

    #[test]
    fn test_lon_to_x_conversion() {
        // lon, zoom, expected_x
        let test_cases = vec![
            // Center of the map
            (0.0, 0, 0.5),
            (0.0, 8, 128.0),
            // Edges of the map
            (-180.0, 0, 0.0),
            (180.0, 0, 1.0), // upper bound is exclusive for tiles, but not for coordinate space
            (-180.0, 8, 0.0),
            (180.0, 8, 256.0),
            // Helsinki
            (24.93545, 5, 18.216484444444444),
            // London
            (-0.1275, 8, 127.90933333333333),
        ];

        for (lon, zoom, expected_x) in test_cases {
            assert!((lon_to_x(lon, zoom) - expected_x).abs() < EPSILON);
        }
    }

    #[test]
    fn test_tile_id_to_url() {
        let config = OpenStreetMapConfig::default();
        let tile_id = TileId {
            z: 10,
            x: 559,
            y: 330,
        };
        let url = tile_id.to_url(&config);
        assert_eq!(url, "https://tile.openstreetmap.org/10/559/330.png");
    }

    #[test]
    fn test_map_view_new() {
        let config = OpenStreetMapConfig::default();
        let default_center: GeoPos = config.default_center().into();
        let default_zoom = config.default_zoom();

        let map = MapView::new(config, DatasetEndpoints::new("https://api.example.org", ""));

        assert_eq!(map.center, default_center);
        assert_eq!(map.zoom, default_zoom);
        assert!(map.mouse_pos.is_none());
        assert!(map.tiles.is_empty());
        assert!(map.popup().is_none());
        assert!(!map.tools.is_active());
        assert_eq!(map.registry.layers().count(), 3);
        assert!(map.last_export().is_none());
    }

    #[test]
    fn viewport_fetches_wait_for_a_settled_viewport() {
        let source = Arc::new(CountingSource::default());
        let mut map = MapView::with_source(OpenStreetMapConfig::default(), source.clone());
        let rect = Rect::from_min_size(pos2(0.0, 0.0), Vec2::new(512.0, 512.0));

        // A drag moves the bounds every frame; none of the transient
        // mid-drag viewports may issue fetches.
        for _ in 0..60 {
            map.center.lon += 0.01;
            let projection = MapProjection::new(map.zoom, map.center, rect);
            map.update_viewport(&projection);
        }
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);

        // The drag ends; the first frame with unchanged bounds still waits,
        // the second one fetches all three datasets.
        map.center.lon += 0.01;
        let projection = MapProjection::new(map.zoom, map.center, rect);
        map.update_viewport(&projection);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
        map.update_viewport(&projection);

        for _ in 0..200 {
            if source.fetches.load(Ordering::SeqCst) == DatasetKind::ALL.len() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(source.fetches.load(Ordering::SeqCst), DatasetKind::ALL.len());
    }

    #[test]
    fn export_times_out_when_no_capture_arrives() {
        let mut map = MapView::new(
            OpenStreetMapConfig::default(),
            DatasetEndpoints::new("https://api.example.org", ""),
        );
        map.request_export(ExportOptions::default());
        // The capture command went out but the backend never answers.
        map.screenshot_requested = true;

        for _ in 0..(EXPORT_TIMEOUT_FRAMES - 1) {
            assert!(!map.expire_export_wait());
            assert!(map.pending_export.is_some());
        }
        assert!(map.expire_export_wait());

        assert!(map.pending_export.is_none());
        assert!(!map.screenshot_requested);
        match map.last_export() {
            Some(Err(message)) => assert!(message.contains("timed out")),
            other => panic!("expected a timeout error, got {other:?}"),
        }
    }
}
