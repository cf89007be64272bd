//! Measurement and drawing tools.
//!
//! The active tool is one tagged [`ToolState`] value, so contradictory
//! combinations (measuring and drawing at once) cannot be represented.
//! Transitions go through `Idle`: starting the other tool while one is active
//! is rejected, while re-starting the same tool restarts it cleanly,
//! discarding the unfinished vertices without committing a result.

use std::time::SystemTime;

use log::debug;

use crate::geometry::{format_area, format_distance, path_length, polygon_area};
use crate::projection::GeoPos;

/// Minimum vertices for a measurement to commit on stop.
const MIN_MEASURE_POINTS: usize = 2;
/// Minimum vertices for a drawing to commit on stop.
const MIN_DRAW_POINTS: usize = 3;

/// The tool state machine. Exactly one non-idle tool can exist at a time.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum ToolState {
    /// No tool is active; map clicks select features.
    #[default]
    Idle,
    /// Distance measurement in progress.
    Measuring {
        /// Id the committed result will carry.
        id: u64,
        /// Vertices accumulated so far, append-only.
        points: Vec<GeoPos>,
    },
    /// Polygon drawing in progress.
    Drawing {
        /// Id the committed result will carry.
        id: u64,
        /// Vertices accumulated so far, append-only.
        points: Vec<GeoPos>,
    },
}

/// A committed distance measurement. Immutable once created.
#[derive(Clone, Debug)]
pub struct MeasurementResult {
    /// Identity for removal commands.
    pub id: u64,
    /// Total path length in meters.
    pub value_meters: f64,
    /// Display string, e.g. `"111.19 km"`.
    pub formatted_value: String,
    /// The measured vertices, frozen at commit.
    pub vertices: Vec<GeoPos>,
    /// When the measurement was committed.
    pub created_at: SystemTime,
}

/// A committed polygon drawing. Immutable once created.
#[derive(Clone, Debug)]
pub struct DrawResult {
    /// Identity for removal commands.
    pub id: u64,
    /// Planar ring area in square meters.
    pub area_square_meters: f64,
    /// Display string, e.g. `"1.24 ha"`.
    pub formatted_area: String,
    /// The ring vertices, frozen at commit.
    pub vertices: Vec<GeoPos>,
    /// When the drawing was committed.
    pub created_at: SystemTime,
}

/// The interaction tool layer: active tool state plus committed results.
#[derive(Default)]
pub struct ToolLayer {
    state: ToolState,
    next_id: u64,
    measurements: Vec<MeasurementResult>,
    drawings: Vec<DrawResult>,
}

impl ToolLayer {
    /// Creates an idle tool layer with no committed results.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current tool state.
    pub fn state(&self) -> &ToolState {
        &self.state
    }

    /// Whether any tool is active.
    pub fn is_active(&self) -> bool {
        self.state != ToolState::Idle
    }

    fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Starts (or cleanly restarts) the measurement tool.
    ///
    /// Returns `false` without changing state when the drawing tool is
    /// active; the machine must pass through idle first.
    pub fn start_measuring(&mut self) -> bool {
        match self.state {
            ToolState::Drawing { .. } => false,
            ToolState::Idle | ToolState::Measuring { .. } => {
                let id = self.fresh_id();
                debug!("Starting measurement {id}");
                self.state = ToolState::Measuring {
                    id,
                    points: Vec::new(),
                };
                true
            }
        }
    }

    /// Stops the measurement tool, committing a result when at least two
    /// vertices were collected and silently discarding otherwise.
    pub fn stop_measuring(&mut self) -> Option<&MeasurementResult> {
        if !matches!(self.state, ToolState::Measuring { .. }) {
            return None;
        }
        let ToolState::Measuring { id, points } = std::mem::take(&mut self.state) else {
            return None;
        };

        if points.len() < MIN_MEASURE_POINTS {
            debug!("Discarding measurement {id} with {} points", points.len());
            return None;
        }

        let value_meters = path_length(&points);
        self.measurements.push(MeasurementResult {
            id,
            value_meters,
            formatted_value: format_distance(value_meters),
            vertices: points,
            created_at: SystemTime::now(),
        });
        self.measurements.last()
    }

    /// Starts (or cleanly restarts) the drawing tool.
    ///
    /// Returns `false` without changing state when the measurement tool is
    /// active.
    pub fn start_drawing(&mut self) -> bool {
        match self.state {
            ToolState::Measuring { .. } => false,
            ToolState::Idle | ToolState::Drawing { .. } => {
                let id = self.fresh_id();
                debug!("Starting drawing {id}");
                self.state = ToolState::Drawing {
                    id,
                    points: Vec::new(),
                };
                true
            }
        }
    }

    /// Stops the drawing tool, committing a result when at least three
    /// vertices were collected and silently discarding otherwise.
    pub fn stop_drawing(&mut self) -> Option<&DrawResult> {
        if !matches!(self.state, ToolState::Drawing { .. }) {
            return None;
        }
        let ToolState::Drawing { id, points } = std::mem::take(&mut self.state) else {
            return None;
        };

        if points.len() < MIN_DRAW_POINTS {
            debug!("Discarding drawing {id} with {} points", points.len());
            return None;
        }

        let area_square_meters = polygon_area(&points);
        self.drawings.push(DrawResult {
            id,
            area_square_meters,
            formatted_area: format_area(area_square_meters),
            vertices: points,
            created_at: SystemTime::now(),
        });
        self.drawings.last()
    }

    /// Forces the machine to idle from any state, discarding in-progress
    /// vertices. Committed results are kept.
    pub fn clear(&mut self) {
        self.state = ToolState::Idle;
    }

    /// Feeds a map click into the active tool. Returns `true` when the click
    /// was consumed, so the caller must not also treat it as a feature
    /// selection.
    pub fn handle_click(&mut self, pos: GeoPos) -> bool {
        match &mut self.state {
            ToolState::Idle => false,
            ToolState::Measuring { points, .. } | ToolState::Drawing { points, .. } => {
                points.push(pos);
                true
            }
        }
    }

    /// Vertices of the in-progress tool, if any.
    pub fn active_points(&self) -> Option<&[GeoPos]> {
        match &self.state {
            ToolState::Idle => None,
            ToolState::Measuring { points, .. } | ToolState::Drawing { points, .. } => {
                Some(points)
            }
        }
    }

    /// The running cumulative distance of an in-progress measurement, in
    /// meters. `None` unless measuring with at least two vertices.
    pub fn running_distance(&self) -> Option<f64> {
        match &self.state {
            ToolState::Measuring { points, .. } if points.len() >= MIN_MEASURE_POINTS => {
                Some(path_length(points))
            }
            _ => None,
        }
    }

    /// Committed measurements, oldest first.
    pub fn measurements(&self) -> &[MeasurementResult] {
        &self.measurements
    }

    /// Committed drawings, oldest first.
    pub fn drawings(&self) -> &[DrawResult] {
        &self.drawings
    }

    /// Removes a committed measurement by id. No-op when not found.
    pub fn remove_measurement(&mut self, id: u64) {
        self.measurements.retain(|m| m.id != id);
    }

    /// Removes a committed drawing by id. No-op when not found.
    pub fn remove_drawing(&mut self, id: u64) {
        self.drawings.retain(|d| d.id != id);
    }
}
