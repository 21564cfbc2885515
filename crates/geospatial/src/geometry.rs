//! Planar and great-circle predicates used by the spatial join.

use fire_common::geometry::Ring;
use fire_common::COORD_EPSILON;

/// Mean Earth radius (meters).
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Great-circle distance between two (lat, lon) points in meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();

    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
}

/// Whether (lat, lon) lies on a ring edge, within epsilon.
fn on_ring_boundary(lat: f64, lon: f64, ring: &[[f64; 2]]) -> bool {
    ring_segments(ring).any(|([x1, y1], [x2, y2])| {
        let cross = (x2 - x1) * (lat - y1) - (y2 - y1) * (lon - x1);
        let len = ((x2 - x1).powi(2) + (y2 - y1).powi(2)).sqrt();
        if len < COORD_EPSILON {
            return (lon - x1).abs() <= COORD_EPSILON && (lat - y1).abs() <= COORD_EPSILON;
        }
        cross.abs() / len <= COORD_EPSILON
            && lon >= x1.min(x2) - COORD_EPSILON
            && lon <= x1.max(x2) + COORD_EPSILON
            && lat >= y1.min(y2) - COORD_EPSILON
            && lat <= y1.max(y2) + COORD_EPSILON
    })
}

/// Even-odd ray cast; points on an edge count as inside.
pub fn point_in_ring(lat: f64, lon: f64, ring: &[[f64; 2]]) -> bool {
    if ring.len() < 3 {
        return false;
    }
    if on_ring_boundary(lat, lon, ring) {
        return true;
    }

    let mut inside = false;
    for ([x1, y1], [x2, y2]) in ring_segments(ring) {
        if (y1 > lat) != (y2 > lat) {
            let x_cross = x1 + (lat - y1) * (x2 - x1) / (y2 - y1);
            if lon < x_cross {
                inside = !inside;
            }
        }
    }
    inside
}

/// Point-in-polygon for an outer ring plus holes.
///
/// The boundary of the outer ring and of every hole counts as part of the
/// polygon.
pub fn point_in_polygon(lat: f64, lon: f64, rings: &[Ring]) -> bool {
    let Some((outer, holes)) = rings.split_first() else {
        return false;
    };
    if !point_in_ring(lat, lon, outer) {
        return false;
    }
    !holes
        .iter()
        .any(|hole| point_in_ring(lat, lon, hole) && !on_ring_boundary(lat, lon, hole))
}

/// Shortest distance in meters from a point to any edge of the rings.
///
/// Uses a local equirectangular projection centred on the point, which is
/// accurate for the sub-100 km buffers the join works with.
pub fn distance_to_rings_m(lat: f64, lon: f64, rings: &[Ring]) -> f64 {
    let m_per_deg_lat = EARTH_RADIUS_M.to_radians();
    let m_per_deg_lon = m_per_deg_lat * lat.to_radians().cos();
    let project = |[x, y]: [f64; 2]| ((x - lon) * m_per_deg_lon, (y - lat) * m_per_deg_lat);

    rings
        .iter()
        .flat_map(|ring| ring_segments(ring))
        .map(|(a, b)| point_segment_distance(project(a), project(b)))
        .fold(f64::INFINITY, f64::min)
}

/// Distance from the origin to segment ab.
fn point_segment_distance((ax, ay): (f64, f64), (bx, by): (f64, f64)) -> f64 {
    let (dx, dy) = (bx - ax, by - ay);
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq == 0.0 {
        0.0
    } else {
        (-(ax * dx + ay * dy) / len_sq).clamp(0.0, 1.0)
    };
    let (px, py) = (ax + t * dx, ay + t * dy);
    (px * px + py * py).sqrt()
}

fn ring_segments(ring: &[[f64; 2]]) -> impl Iterator<Item = ([f64; 2], [f64; 2])> + '_ {
    (0..ring.len()).map(move |i| (ring[i], ring[(i + 1) % ring.len()]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_square() -> Vec<Ring> {
        vec![vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0], [0.0, 0.0]]]
    }

    #[test]
    fn test_point_in_square() {
        let sq = unit_square();
        assert!(point_in_polygon(0.5, 0.5, &sq));
        assert!(!point_in_polygon(1.5, 0.5, &sq));
        assert!(!point_in_polygon(0.5, -0.1, &sq));
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let sq = unit_square();
        assert!(point_in_polygon(0.0, 0.5, &sq));
        assert!(point_in_polygon(1.0, 1.0, &sq));
        assert!(point_in_polygon(0.5, 1.0 + 1e-12, &sq));
        assert!(!point_in_polygon(0.5, 1.0 + 1e-6, &sq));
    }

    #[test]
    fn test_hole_excludes_interior_but_not_edge() {
        let mut poly = unit_square();
        poly.push(vec![[0.25, 0.25], [0.75, 0.25], [0.75, 0.75], [0.25, 0.75], [0.25, 0.25]]);
        assert!(!point_in_polygon(0.5, 0.5, &poly));
        assert!(point_in_polygon(0.25, 0.5, &poly));
        assert!(point_in_polygon(0.1, 0.1, &poly));
    }

    #[test]
    fn test_haversine_known_distance() {
        // San Francisco to Los Angeles, ~559 km
        let d = haversine_m(37.7749, -122.4194, 34.0522, -118.2437);
        assert!((d - 559_000.0).abs() < 5_000.0, "got {d}");
        assert_eq!(haversine_m(35.0, -120.0, 35.0, -120.0), 0.0);
    }

    #[test]
    fn test_distance_to_rings() {
        let sq = vec![vec![[-120.0, 37.0], [-119.9, 37.0], [-119.9, 37.1], [-120.0, 37.1], [-120.0, 37.0]]];
        // 0.01 deg of latitude south of the bottom edge, ~1.1 km
        let d = distance_to_rings_m(36.99, -119.95, &sq);
        assert!((d - 1_112.0).abs() < 10.0, "got {d}");
    }
}
