//! Rendering and hit-testing for the managed dataset overlays.
//!
//! Points are drawn as circles, polygons as a triangulated fill plus a
//! stroked outline; both primitives of a polygon layer are gated by the same
//! registry visibility flag. Hit-testing walks the same geometry in screen
//! space, topmost layer first, and produces the transient [`PopupInfo`]
//! selection the viewer shows.

use egui::{Color32, Mesh, Painter, Pos2, Shape, Stroke};
use geojson::{Feature, Value};
use log::warn;

use crate::cache::{DatasetBundle, DatasetKind};
use crate::projection::{GeoPos, MapProjection};
use crate::registry::LayerRegistry;

/// Screen radius of point features.
const POINT_RADIUS: f32 = 6.0;
/// Extra screen tolerance when hit-testing point features.
const POINT_HIT_TOLERANCE: f32 = 4.0;

/// Draw order, bottom to top. Point evidence is drawn last so it stays
/// clickable above the polygon layers.
const DRAW_ORDER: [DatasetKind; 3] = [
    DatasetKind::Analysis,
    DatasetKind::Concession,
    DatasetKind::Evidence,
];

/// The transient feature selection behind the detail popup.
///
/// At most one exists at a time; every map click either replaces or clears
/// it.
#[derive(Clone, Debug)]
pub struct PopupInfo {
    /// Longitude of the click that selected the feature.
    pub lon: f64,
    /// Latitude of the click that selected the feature.
    pub lat: f64,
    /// The selected GeoJSON feature.
    pub feature: Feature,
}

impl PopupInfo {
    /// A short title for the popup header, taken from common name properties
    /// with the feature id as fallback.
    pub fn title(&self) -> String {
        for key in ["name", "title", "label"] {
            if let Some(value) = self.feature.properties.as_ref().and_then(|p| p.get(key)) {
                if let Some(s) = value.as_str() {
                    return s.to_string();
                }
            }
        }
        match &self.feature.id {
            Some(geojson::feature::Id::String(s)) => s.clone(),
            Some(geojson::feature::Id::Number(n)) => n.to_string(),
            None => "Feature".to_string(),
        }
    }
}

/// Draws the dataset overlays for one bundle, respecting registry visibility.
pub fn draw_bundle(
    painter: &Painter,
    projection: &MapProjection,
    registry: &LayerRegistry,
    bundle: &DatasetBundle,
) {
    for kind in DRAW_ORDER {
        let Some(layer) = registry.layer_for_kind(kind) else {
            continue;
        };
        if !layer.visible {
            continue;
        }
        let Some(collection) = bundle.get(kind) else {
            continue;
        };

        for feature in &collection.features {
            if let Some(geometry) = &feature.geometry {
                draw_geometry(painter, projection, &geometry.value, layer.color);
            }
        }
    }
}

fn draw_geometry(painter: &Painter, projection: &MapProjection, value: &Value, color: Color32) {
    match value {
        Value::Point(position) => {
            if let Some(pos) = position_to_screen(position, projection) {
                painter.circle_filled(pos, POINT_RADIUS, color);
                painter.circle_stroke(pos, POINT_RADIUS, Stroke::new(1.5, Color32::WHITE));
            }
        }
        Value::MultiPoint(positions) => {
            for position in positions {
                draw_geometry(painter, projection, &Value::Point(position.clone()), color);
            }
        }
        Value::LineString(positions) => {
            let screen_points: Vec<Pos2> = positions
                .iter()
                .filter_map(|p| position_to_screen(p, projection))
                .collect();
            if screen_points.len() > 1 {
                painter.add(Shape::line(screen_points, Stroke::new(2.0, color)));
            }
        }
        Value::Polygon(rings) => {
            if let Some(outer_ring) = rings.first() {
                draw_polygon_ring(painter, projection, outer_ring, color);
            }
        }
        Value::MultiPolygon(polygons) => {
            for rings in polygons {
                if let Some(outer_ring) = rings.first() {
                    draw_polygon_ring(painter, projection, outer_ring, color);
                }
            }
        }
        other => {
            warn!("Unsupported overlay geometry: {}", other.type_name());
        }
    }
}

fn draw_polygon_ring(
    painter: &Painter,
    projection: &MapProjection,
    ring: &[Vec<f64>],
    color: Color32,
) {
    let screen_points: Vec<Pos2> = ring
        .iter()
        .filter_map(|p| position_to_screen(p, projection))
        .collect();
    fill_and_outline(painter, screen_points, color);
}

/// Draws a closed ring of geographic vertices as fill plus outline. Used for
/// in-progress and committed drawings.
pub fn draw_geo_ring(
    painter: &Painter,
    projection: &MapProjection,
    ring: &[GeoPos],
    color: Color32,
) {
    let screen_points: Vec<Pos2> = ring.iter().map(|p| projection.project(*p)).collect();
    fill_and_outline(painter, screen_points, color);
}

/// Fill plus outline of one screen-space ring. The two primitives share the
/// caller's visibility gate, so they always toggle together.
fn fill_and_outline(painter: &Painter, screen_points: Vec<Pos2>, color: Color32) {
    if screen_points.len() < 3 {
        warn!("Skipping degenerate polygon ring with {} points", screen_points.len());
        return;
    }

    // Triangulate for the fill.
    let flat_points: Vec<f64> = screen_points
        .iter()
        .flat_map(|p| [p.x as f64, p.y as f64])
        .collect();
    match earcutr::earcut(&flat_points, &[], 2) {
        Ok(indices) => {
            let fill = Color32::from_rgba_unmultiplied(color.r(), color.g(), color.b(), 60);
            let mut mesh = Mesh::default();
            mesh.vertices = screen_points
                .iter()
                .map(|p| egui::epaint::Vertex {
                    pos: *p,
                    uv: Default::default(),
                    color: fill,
                })
                .collect();
            mesh.indices = indices.into_iter().map(|i| i as u32).collect();
            painter.add(Shape::Mesh(mesh.into()));
        }
        Err(e) => warn!("Failed to triangulate polygon ring: {e:?}"),
    }

    let path_shape = Shape::Path(egui::epaint::PathShape {
        points: screen_points,
        closed: true,
        fill: Color32::TRANSPARENT,
        stroke: Stroke::new(2.0, color).into(),
    });
    painter.add(path_shape);
}

/// Finds the topmost visible feature under a screen position, if any.
pub fn hit_test(
    screen_pos: Pos2,
    projection: &MapProjection,
    registry: &LayerRegistry,
    bundle: &DatasetBundle,
) -> Option<PopupInfo> {
    let geo = projection.unproject(screen_pos);

    // Reverse draw order so the topmost layer wins the hit.
    for kind in DRAW_ORDER.iter().rev() {
        let Some(layer) = registry.layer_for_kind(*kind) else {
            continue;
        };
        if !layer.visible {
            continue;
        }
        let Some(collection) = bundle.get(*kind) else {
            continue;
        };

        for feature in collection.features.iter().rev() {
            let Some(geometry) = &feature.geometry else {
                continue;
            };
            if geometry_hit(screen_pos, projection, &geometry.value) {
                return Some(PopupInfo {
                    lon: geo.lon,
                    lat: geo.lat,
                    feature: feature.clone(),
                });
            }
        }
    }
    None
}

fn geometry_hit(screen_pos: Pos2, projection: &MapProjection, value: &Value) -> bool {
    match value {
        Value::Point(position) => position_to_screen(position, projection).is_some_and(|pos| {
            pos.distance(screen_pos) <= POINT_RADIUS + POINT_HIT_TOLERANCE
        }),
        Value::MultiPoint(positions) => positions.iter().any(|position| {
            geometry_hit(screen_pos, projection, &Value::Point(position.clone()))
        }),
        Value::Polygon(rings) => rings.first().is_some_and(|ring| {
            let screen_ring: Vec<Pos2> = ring
                .iter()
                .filter_map(|p| position_to_screen(p, projection))
                .collect();
            point_in_ring(screen_pos, &screen_ring)
        }),
        Value::MultiPolygon(polygons) => polygons.iter().any(|rings| {
            geometry_hit(screen_pos, projection, &Value::Polygon(rings.clone()))
        }),
        _ => false,
    }
}

/// Even-odd ray cast in screen space.
fn point_in_ring(point: Pos2, ring: &[Pos2]) -> bool {
    if ring.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let a = ring[i];
        let b = ring[j];
        if (a.y > point.y) != (b.y > point.y) {
            let x_cross = a.x + (point.y - a.y) / (b.y - a.y) * (b.x - a.x);
            if point.x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn position_to_screen(position: &[f64], projection: &MapProjection) -> Option<Pos2> {
    if position.len() < 2 {
        return None;
    }
    Some(projection.project(GeoPos {
        lon: position[0],
        lat: position[1],
    }))
}
