//! Integration tests across cell assignment, joins and hotspots.

use chrono::Duration;
use geospatial::{
    assign_cell, detect_hotspots, spatial_join, HotspotConfig, HotspotObservation, ReferenceIndex,
    DEFAULT_COARSE_RESOLUTION,
};
use test_utils::{assert_approx_eq, california_point, county_feature_collection, places, reference_time};

fn counties() -> ReferenceIndex {
    ReferenceIndex::from_geojson_str(&county_feature_collection(), DEFAULT_COARSE_RESOLUTION).unwrap()
}

#[test]
fn test_cell_assignment_is_idempotent_across_resolutions() {
    for i in 0..500 {
        let (lat, lon) = california_point(i);
        for res in [0u8, 5, 9, 15] {
            let first = assign_cell(lat, lon, res).unwrap();
            let second = assign_cell(lat, lon, res).unwrap();
            assert_eq!(first, second);
            assert_eq!(first.id(), second.id());
        }
    }
}

#[test]
fn test_join_places_into_counties() {
    let index = counties();

    let (lat, lon) = places::PARADISE;
    let join = spatial_join(lat, lon, &index, 0.0).unwrap();
    assert_eq!(join.polygon_id, "06007");
    assert_eq!(join.name.as_deref(), Some("Butte"));
    assert_eq!(join.attributes["state"], "CA");

    let (lat, lon) = places::RENO;
    assert!(spatial_join(lat, lon, &index, 0.0).is_none());
}

#[test]
fn test_buffered_join_reaches_just_outside_county() {
    let index = counties();
    let (lat, lon) = places::MALIBU;
    // 0.26 deg south of the center is 0.01 deg outside the box, ~1.1 km
    let join = spatial_join(lat - 0.26, lon, &index, 2_000.0).unwrap();
    assert_eq!(join.polygon_id, "06037");
    assert!(!join.contained);
    assert_approx_eq!(join.distance_m, 1_112.0, 15.0);
}

fn burst(lat: f64, lon: f64, n: usize, start_min: i64) -> Vec<HotspotObservation> {
    (0..n)
        .map(|i| HotspotObservation {
            cell: assign_cell(lat, lon, 7).unwrap(),
            observed_at: reference_time() + Duration::minutes(start_min + i as i64),
            weight: 1.0,
        })
        .collect()
}

#[test]
fn test_raising_threshold_never_adds_hotspots() {
    let mut observations = Vec::new();
    observations.extend(burst(places::PARADISE.0, places::PARADISE.1, 8, 0));
    observations.extend(burst(places::SANTA_ROSA.0, places::SANTA_ROSA.1, 5, 2));
    observations.extend(burst(places::REDDING.0, places::REDDING.1, 3, 4));
    observations.extend(burst(places::MALIBU.0, places::MALIBU.1, 1, 6));
    let end = reference_time() + Duration::minutes(30);

    let mut previous: Option<Vec<_>> = None;
    for threshold in 0..10 {
        let config = HotspotConfig {
            density_threshold: threshold as f64,
            max_hotspots: None,
            ..Default::default()
        };
        let cells: Vec<_> = detect_hotspots(&observations, &config, end)
            .into_iter()
            .map(|h| h.cell)
            .collect();
        if let Some(prev) = &previous {
            assert!(cells.iter().all(|c| prev.contains(c)), "threshold {threshold}");
        }
        previous = Some(cells);
    }
}

#[test]
fn test_truncated_hotspot_count_is_monotonic() {
    let mut observations = Vec::new();
    for (i, k) in [(0usize, 6usize), (1, 4), (2, 3), (3, 2)] {
        let (lat, lon) = california_point(i * 137);
        observations.extend(burst(lat, lon, k, i as i64));
    }
    let end = reference_time() + Duration::minutes(30);

    let counts: Vec<usize> = (0..8)
        .map(|threshold| {
            let config = HotspotConfig {
                density_threshold: threshold as f64,
                max_hotspots: Some(2),
                ..Default::default()
            };
            detect_hotspots(&observations, &config, end).len()
        })
        .collect();
    assert!(counts.windows(2).all(|w| w[1] <= w[0]), "{counts:?}");
}
