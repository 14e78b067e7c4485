use serde::{Deserialize, Serialize};

use crate::error::{BushidoError, Result};

/// Spacing between two route segments, in meters
pub const SEGMENT_INTERVAL_M: u32 = 20;

/// One point of a route profile
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteSegment {
    /// Distance from the start of the route
    pub distance_m: f64,
    /// Grade in percent
    pub slope_percent: f64,
    /// Elevation in meters
    pub elevation_m: f64,
    /// Latitude in degrees
    pub lat: f64,
    /// Longitude in degrees
    pub lon: f64,
}

/// Route smoothed to segments at a fixed [`SEGMENT_INTERVAL_M`] spacing
///
/// Segment `i` sits at `i * 20` meters. The controller looks up the segment
/// ahead of the rider, so segment 0 is the start line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteProfile {
    segments: Vec<RouteSegment>,
}

impl RouteProfile {
    /// Create a profile from already smoothed segments
    ///
    /// # Errors
    ///
    /// Returns [`BushidoError::InvalidParameters`] if a segment is not placed
    /// at its index times the segment interval.
    pub fn new(segments: Vec<RouteSegment>) -> Result<Self> {
        for (i, segment) in segments.iter().enumerate() {
            let expected = i as f64 * f64::from(SEGMENT_INTERVAL_M);
            if (segment.distance_m - expected).abs() > 1e-6 {
                return Err(BushidoError::InvalidParameters(format!(
                    "Segment {i} at {} m, expected {expected} m",
                    segment.distance_m
                )));
            }
        }
        Ok(Self { segments })
    }

    /// Build a profile from per-segment grades, without coordinates
    ///
    /// Elevation is integrated from `start_elevation_m`; each segment's grade
    /// applies to the 20 m leading up to it.
    #[must_use]
    pub fn from_slopes(slopes: &[f64], start_elevation_m: f64) -> Self {
        let interval = f64::from(SEGMENT_INTERVAL_M);
        let mut elevation = start_elevation_m;

        let segments = slopes
            .iter()
            .enumerate()
            .map(|(i, &slope_percent)| {
                if i > 0 {
                    elevation += interval * slope_percent / 100.0;
                }
                RouteSegment {
                    distance_m: i as f64 * interval,
                    slope_percent,
                    elevation_m: elevation,
                    lat: 0.0,
                    lon: 0.0,
                }
            })
            .collect();

        Self { segments }
    }

    /// Number of segments
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether the profile has no segments
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Segment at `index`
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&RouteSegment> {
        self.segments.get(index)
    }

    /// All segments in order
    #[must_use]
    pub fn segments(&self) -> &[RouteSegment] {
        &self.segments
    }

    /// Length of the route as counted for progress
    #[must_use]
    pub fn total_distance_m(&self) -> u64 {
        self.segments.len() as u64 * u64::from(SEGMENT_INTERVAL_M)
    }

    /// Index of the segment ahead of `distance_m`: `ceil(distance / 20)`
    ///
    /// Returns `None` for negative distances. The index may lie past the end
    /// of the profile.
    #[must_use]
    pub fn segment_index(distance_m: i64) -> Option<usize> {
        let distance = u64::try_from(distance_m).ok()?;
        usize::try_from(distance.div_ceil(u64::from(SEGMENT_INTERVAL_M))).ok()
    }

    /// Share of the route covered at `distance_m`, in percent
    #[must_use]
    pub fn progress_percent(&self, distance_m: i64) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        distance_m as f64 * 100.0 / self.total_distance_m() as f64
    }

    /// Position at `distance_m`, interpolated between the surrounding segments
    ///
    /// Returns `(lat, lon)`, or `None` when the distance is negative or past
    /// the last segment.
    #[must_use]
    pub fn position_at(&self, distance_m: f64) -> Option<(f64, f64)> {
        if distance_m < 0.0 {
            return None;
        }
        let index = (distance_m / f64::from(SEGMENT_INTERVAL_M)).ceil() as usize;
        let next = self.segments.get(index)?;

        let Some(prev) = index.checked_sub(1).and_then(|i| self.segments.get(i)) else {
            return Some((next.lat, next.lon));
        };

        let covered = next.distance_m - prev.distance_m;
        let t = (distance_m - prev.distance_m) / covered;
        Some((
            prev.lat + (next.lat - prev.lat) * t,
            prev.lon + (next.lon - prev.lon) * t,
        ))
    }
}
