//! Pure measurement and bounding-box utilities.
//!
//! Everything in this module is stateless and total: empty inputs fall back to
//! documented defaults instead of panicking. All coordinates are WGS84
//! degrees, all distances meters, all areas square meters.

use crate::projection::GeoPos;
use crate::{MAX_ZOOM, MIN_ZOOM};

/// Mean Earth radius in meters, as used by the haversine formula.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Rough length of one degree of arc in meters, used to scale planar areas.
const METERS_PER_DEGREE: f64 = 111_320.0;

/// A geographical bounding box in degrees.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bounds {
    /// Western (minimum) longitude.
    pub west: f64,
    /// Southern (minimum) latitude.
    pub south: f64,
    /// Eastern (maximum) longitude.
    pub east: f64,
    /// Northern (maximum) latitude.
    pub north: f64,
}

impl Bounds {
    /// The whole-world bounds, used as the fallback for empty input.
    pub const WORLD: Bounds = Bounds {
        west: -180.0,
        south: -85.0511287798,
        east: 180.0,
        north: 85.0511287798,
    };

    /// The center point of the bounds.
    pub fn center(&self) -> GeoPos {
        GeoPos {
            lon: (self.west + self.east) / 2.0,
            lat: (self.south + self.north) / 2.0,
        }
    }
}

/// Great-circle distance between two positions in meters.
///
/// Standard haversine formula. Symmetric, and zero for identical inputs.
pub fn haversine_distance(a: GeoPos, b: GeoPos) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().asin();

    EARTH_RADIUS_M * c
}

/// Total length of a polyline in meters, summed over consecutive segments.
pub fn path_length(points: &[GeoPos]) -> f64 {
    points
        .windows(2)
        .map(|pair| haversine_distance(pair[0], pair[1]))
        .sum()
}

/// Formats a distance for display: meters below 1 km, kilometers above.
///
/// `format_distance(999.0) == "999 m"`, `format_distance(1000.0) == "1.00 km"`.
pub fn format_distance(meters: f64) -> String {
    if meters < 1000.0 {
        format!("{} m", meters.round() as i64)
    } else {
        format!("{:.2} km", meters / 1000.0)
    }
}

/// Planar area of a polygon ring in square meters.
///
/// Plain shoelace formula on raw lon/lat degrees, scaled by a constant
/// meters-per-degree factor. No latitude correction is applied; the result is
/// a neighborhood-scale approximation, not a geodesic area. The ring may be
/// given open or explicitly closed; it is treated as closed either way.
/// Returns `0.0` for fewer than 3 distinct points.
pub fn polygon_area(ring: &[GeoPos]) -> f64 {
    // Ignore an explicit closing vertex so closed and open rings agree.
    let ring = match ring.split_last() {
        Some((last, rest)) if !rest.is_empty() && *last == ring[0] => rest,
        _ => ring,
    };

    if ring.len() < 3 {
        return 0.0;
    }

    let mut sum = 0.0;
    for i in 0..ring.len() {
        let a = ring[i];
        let b = ring[(i + 1) % ring.len()];
        sum += a.lon * b.lat - b.lon * a.lat;
    }

    (sum / 2.0).abs() * METERS_PER_DEGREE * METERS_PER_DEGREE
}

/// Formats an area for display: m² below one hectare, hectares below one km².
pub fn format_area(square_meters: f64) -> String {
    if square_meters < 10_000.0 {
        format!("{} m²", square_meters.round() as i64)
    } else if square_meters < 1_000_000.0 {
        format!("{:.2} ha", square_meters / 10_000.0)
    } else {
        format!("{:.2} km²", square_meters / 1_000_000.0)
    }
}

/// The bounding box of a point set. Falls back to [`Bounds::WORLD`] for empty
/// input.
pub fn bounds_from_points(points: &[GeoPos]) -> Bounds {
    let Some(first) = points.first() else {
        return Bounds::WORLD;
    };

    let mut bounds = Bounds {
        west: first.lon,
        south: first.lat,
        east: first.lon,
        north: first.lat,
    };
    for point in &points[1..] {
        bounds.west = bounds.west.min(point.lon);
        bounds.south = bounds.south.min(point.lat);
        bounds.east = bounds.east.max(point.lon);
        bounds.north = bounds.north.max(point.lat);
    }
    bounds
}

/// The centroid of a point set. Falls back to `(0, 0)` for empty input.
pub fn center_from_points(points: &[GeoPos]) -> GeoPos {
    if points.is_empty() {
        return GeoPos::default();
    }

    let n = points.len() as f64;
    GeoPos {
        lon: points.iter().map(|p| p.lon).sum::<f64>() / n,
        lat: points.iter().map(|p| p.lat).sum::<f64>() / n,
    }
}

/// A zoom level at which the given bounds roughly fill a map widget.
///
/// Heuristic: pick the largest zoom whose world span still covers the larger
/// of the two bound spans. Degenerate (point-sized) bounds yield a close-up
/// zoom of 15; world-sized bounds yield [`MIN_ZOOM`].
pub fn optimal_zoom_from_bounds(bounds: &Bounds) -> u8 {
    let lon_span = (bounds.east - bounds.west).abs();
    // Latitude covers half the degree range of longitude, so weigh it double.
    let lat_span = (bounds.north - bounds.south).abs() * 2.0;
    let span = lon_span.max(lat_span);

    if span <= f64::EPSILON {
        return 15;
    }

    let zoom = (360.0 / span).log2().floor();
    zoom.clamp(MIN_ZOOM as f64, MAX_ZOOM as f64) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    fn pos(lon: f64, lat: f64) -> GeoPos {
        GeoPos { lon, lat }
    }

    #[test]
    fn haversine_is_symmetric_and_zero_on_identity() {
        let points = vec![
            (pos(24.93545, 60.16952), pos(-0.1275, 51.5074)),
            (pos(0.0, 0.0), pos(180.0, 0.0)),
            (pos(-122.4194, 37.7749), pos(139.6917, 35.6895)),
        ];

        for (a, b) in points {
            assert!((haversine_distance(a, b) - haversine_distance(b, a)).abs() < EPSILON);
            assert!(haversine_distance(a, a).abs() < EPSILON);
        }
    }

    #[test]
    fn haversine_one_degree_at_equator() {
        // One degree of longitude at the equator is roughly 111.19 km.
        let distance = haversine_distance(pos(0.0, 0.0), pos(1.0, 0.0));
        assert!((distance - 111_195.0).abs() < 10.0);
    }

    #[test]
    fn haversine_triangle_inequality() {
        let a = pos(0.0, 0.0);
        let b = pos(1.0, 1.0);
        let c = pos(2.0, 0.0);
        assert!(
            haversine_distance(a, c)
                <= haversine_distance(a, b) + haversine_distance(b, c) + EPSILON
        );
    }

    #[test]
    fn path_length_accumulates_segments() {
        let points = vec![pos(0.0, 0.0), pos(1.0, 0.0), pos(2.0, 0.0)];
        let total = path_length(&points);
        let single = haversine_distance(pos(0.0, 0.0), pos(1.0, 0.0));
        assert!((total - 2.0 * single).abs() < 1.0);

        assert_eq!(path_length(&[]), 0.0);
        assert_eq!(path_length(&[pos(5.0, 5.0)]), 0.0);
    }

    #[test]
    fn distance_formatting_thresholds() {
        assert_eq!(format_distance(0.0), "0 m");
        assert_eq!(format_distance(999.0), "999 m");
        assert_eq!(format_distance(1000.0), "1.00 km");
        assert_eq!(format_distance(111_195.0), "111.19 km");
    }

    #[test]
    fn polygon_area_non_negative_and_zero_below_three_points() {
        assert_eq!(polygon_area(&[]), 0.0);
        assert_eq!(polygon_area(&[pos(0.0, 0.0)]), 0.0);
        assert_eq!(polygon_area(&[pos(0.0, 0.0), pos(1.0, 0.0)]), 0.0);

        // Winding order must not affect the sign.
        let ccw = vec![pos(0.0, 0.0), pos(0.01, 0.0), pos(0.01, 0.01)];
        let cw: Vec<GeoPos> = ccw.iter().rev().copied().collect();
        assert!(polygon_area(&ccw) > 0.0);
        assert!((polygon_area(&ccw) - polygon_area(&cw)).abs() < EPSILON);
    }

    #[test]
    fn polygon_area_ignores_explicit_closure() {
        let open = vec![pos(0.0, 0.0), pos(0.01, 0.0), pos(0.01, 0.01), pos(0.0, 0.01)];
        let mut closed = open.clone();
        closed.push(open[0]);
        assert!((polygon_area(&open) - polygon_area(&closed)).abs() < EPSILON);
    }

    #[test]
    fn polygon_area_unit_square_scale() {
        // A 0.001° square is roughly 111.32 m on a side, so about 12,392 m².
        let side = 0.001;
        let square = vec![
            pos(0.0, 0.0),
            pos(side, 0.0),
            pos(side, side),
            pos(0.0, side),
        ];
        let area = polygon_area(&square);
        let expected = (side * METERS_PER_DEGREE).powi(2);
        assert!((area - expected).abs() < 1.0);
    }

    #[test]
    fn area_formatting_thresholds() {
        assert!(format_area(9_999.0).ends_with("m²"));
        assert!(format_area(10_000.0).ends_with("ha"));
        assert_eq!(format_area(10_000.0), "1.00 ha");
        assert_eq!(format_area(1_000_000.0), "1.00 km²");
        assert_eq!(format_area(2_500_000.0), "2.50 km²");
    }

    #[test]
    fn bounds_from_points_and_fallback() {
        assert_eq!(bounds_from_points(&[]), Bounds::WORLD);

        let bounds = bounds_from_points(&[pos(1.0, 5.0), pos(-2.0, 3.0), pos(0.5, 7.0)]);
        assert_eq!(
            bounds,
            Bounds {
                west: -2.0,
                south: 3.0,
                east: 1.0,
                north: 7.0,
            }
        );
    }

    #[test]
    fn center_from_points_and_fallback() {
        assert_eq!(center_from_points(&[]), GeoPos::default());

        let center = center_from_points(&[pos(0.0, 0.0), pos(2.0, 4.0)]);
        assert!((center.lon - 1.0).abs() < EPSILON);
        assert!((center.lat - 2.0).abs() < EPSILON);
    }

    #[test]
    fn optimal_zoom_heuristic() {
        // World bounds map to the minimum zoom.
        assert_eq!(optimal_zoom_from_bounds(&Bounds::WORLD), MIN_ZOOM);

        // A point-sized bounds falls back to a close-up zoom.
        let point = Bounds {
            west: 10.0,
            south: 50.0,
            east: 10.0,
            north: 50.0,
        };
        assert_eq!(optimal_zoom_from_bounds(&point), 15);

        // Smaller bounds produce larger zoom levels.
        let city = Bounds {
            west: 24.8,
            south: 60.1,
            east: 25.1,
            north: 60.3,
        };
        let country = Bounds {
            west: 20.0,
            south: 59.0,
            east: 32.0,
            north: 70.0,
        };
        assert!(optimal_zoom_from_bounds(&city) > optimal_zoom_from_bounds(&country));
    }
}
