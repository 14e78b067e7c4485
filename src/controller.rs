use std::{collections::BTreeMap, time::SystemTime};

use tracing::{debug, info, warn};

use crate::{
    route::RouteProfile,
    types::{TelemetrySample, TelemetryState},
};

/// Default largest slope change per distance update, in percent
pub const MAX_SLOPE_CHANGE: f64 = 1.0;

/// Move from `last` toward `target` by at most `max_change`
#[must_use]
pub fn rate_limit(last: f64, target: f64, max_change: f64) -> f64 {
    target.min(last + max_change).max(last - max_change)
}

/// Result of one controller run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerUpdate {
    /// Distance along the route, offset included
    pub effective_distance_m: i64,
    /// Index of the segment ahead of the rider
    pub segment: Option<usize>,
    /// New slope setpoint, when a segment was found
    pub slope_percent: Option<f64>,
    /// Sample recorded by this run
    pub sample: Option<(usize, TelemetrySample)>,
}

/// Turns distance progress into rate-limited slope setpoints
#[derive(Debug)]
pub struct ResistanceController {
    profile: RouteProfile,
    max_slope_change: f64,
    last_commanded_slope: f64,
    distance_offset_m: i64,
    last_segment: Option<usize>,
    samples: BTreeMap<usize, TelemetrySample>,
}

impl ResistanceController {
    /// Create a controller following `profile`
    #[must_use]
    pub fn new(profile: RouteProfile, max_slope_change: f64) -> Self {
        Self {
            profile,
            max_slope_change,
            last_commanded_slope: 0.0,
            distance_offset_m: 0,
            last_segment: None,
            samples: BTreeMap::new(),
        }
    }

    /// Route being followed
    #[must_use]
    pub const fn profile(&self) -> &RouteProfile {
        &self.profile
    }

    /// Last slope setpoint
    #[must_use]
    pub const fn last_commanded_slope(&self) -> f64 {
        self.last_commanded_slope
    }

    /// Offset added to the head unit distance
    #[must_use]
    pub const fn offset(&self) -> i64 {
        self.distance_offset_m
    }

    /// Route distance for a raw head unit distance, saturating at `i64::MAX`
    #[must_use]
    pub const fn effective_distance(&self, raw_distance_m: u32) -> i64 {
        (raw_distance_m as i64).saturating_add(self.distance_offset_m)
    }

    /// Samples recorded so far, keyed by segment index
    #[must_use]
    pub const fn samples(&self) -> &BTreeMap<usize, TelemetrySample> {
        &self.samples
    }

    /// Replace the setpoint that the next update is rate-limited against
    pub fn override_slope(&mut self, slope_percent: f64) {
        self.last_commanded_slope = slope_percent;
    }

    /// Run the controller for a new head unit distance
    ///
    /// A sample is recorded when the rider is not paused and has entered a
    /// segment with a higher index than on the previous run. The first sample
    /// of a segment is kept.
    pub fn on_distance_updated(
        &mut self,
        raw_distance_m: u32,
        telemetry: &TelemetryState,
        paused: bool,
    ) -> ControllerUpdate {
        let effective = self.effective_distance(raw_distance_m);
        let index = RouteProfile::segment_index(effective);
        let target = index
            .and_then(|i| self.profile.get(i))
            .map(|segment| segment.slope_percent);

        let mut update = ControllerUpdate {
            effective_distance_m: effective,
            segment: index,
            slope_percent: None,
            sample: None,
        };

        if let Some(target) = target {
            let commanded = rate_limit(self.last_commanded_slope, target, self.max_slope_change);
            debug!(
                "Segment {:?} at {} m: target {:.1}%, commanded {:.1}%",
                index, effective, target, commanded
            );
            self.last_commanded_slope = commanded;
            update.slope_percent = Some(commanded);
        }

        let advanced = match (index, self.last_segment) {
            (Some(i), Some(last)) => i > last,
            (Some(_), None) => true,
            _ => false,
        };

        if let Some(i) = index.filter(|_| advanced && !paused && target.is_some()) {
            if !self.samples.contains_key(&i) {
                let mut telemetry = *telemetry;
                telemetry.slope_percent = self.last_commanded_slope;
                let sample = TelemetrySample {
                    telemetry,
                    effective_distance_m: effective,
                    timestamp: SystemTime::now(),
                };
                self.samples.insert(i, sample);
                update.sample = Some((i, sample));
            }
        }

        self.last_segment = index;
        update
    }

    /// Shift the route position by `delta_m`
    ///
    /// Returns `None` without changing anything if the route distance would
    /// become negative or overflow; otherwise re-runs the controller at
    /// `raw_distance_m`.
    pub fn seek(
        &mut self,
        delta_m: i64,
        raw_distance_m: u32,
        telemetry: &TelemetryState,
        paused: bool,
    ) -> Option<ControllerUpdate> {
        let Some(target) = self.effective_distance(raw_distance_m).checked_add(delta_m) else {
            warn!("Rejecting seek of {} m, route distance out of range", delta_m);
            return None;
        };
        if target < 0 {
            warn!("Rejecting seek of {} m to {} m", delta_m, target);
            return None;
        }

        // target and raw distance are both non-negative, so this cannot overflow
        self.distance_offset_m = target - i64::from(raw_distance_m);
        info!("Seeked {} m, offset now {} m", delta_m, self.distance_offset_m);
        Some(self.on_distance_updated(raw_distance_m, telemetry, paused))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(slopes: &[f64]) -> ResistanceController {
        ResistanceController::new(RouteProfile::from_slopes(slopes, 0.0), MAX_SLOPE_CHANGE)
    }

    #[test]
    fn test_rate_limit() {
        assert!((rate_limit(0.0, 5.0, 1.0) - 1.0).abs() < 1e-9);
        assert!((rate_limit(0.0, -5.0, 1.0) + 1.0).abs() < 1e-9);
        assert!((rate_limit(2.0, 2.4, 1.0) - 2.4).abs() < 1e-9);
        assert!((rate_limit(2.0, 1.0, 1.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_slope_steps_are_bounded() {
        let mut c = controller(&[0.0, 8.0, 8.0, 8.0, 8.0, -6.0, -6.0, -6.0, 2.5]);
        let telemetry = TelemetryState::default();

        let mut last = 0.0;
        for distance in (0..=160).step_by(20) {
            let update = c.on_distance_updated(distance, &telemetry, false);
            let slope = update.slope_percent.unwrap();
            assert!((slope - last).abs() <= 1.0 + 1e-9);
            last = slope;
        }
        assert!((last - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_exact_slope_within_limit() {
        let mut c = controller(&[0.0, 0.7]);
        let update = c.on_distance_updated(15, &TelemetryState::default(), false);
        assert_eq!(update.segment, Some(1));
        assert!((update.slope_percent.unwrap() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_past_route_end_keeps_slope() {
        let mut c = controller(&[0.0, 1.0]);
        let telemetry = TelemetryState::default();
        c.on_distance_updated(20, &telemetry, false);

        let update = c.on_distance_updated(500, &telemetry, false);
        assert_eq!(update.slope_percent, None);
        assert!((c.last_commanded_slope() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_samples_recorded_once_per_segment() {
        let mut c = controller(&[0.0; 10]);
        let mut telemetry = TelemetryState::default();

        telemetry.power_watts = 150;
        let first = c.on_distance_updated(21, &telemetry, false);
        assert_eq!(first.sample.map(|(i, _)| i), Some(2));

        telemetry.power_watts = 300;
        assert!(c.on_distance_updated(35, &telemetry, false).sample.is_none());

        // going back and advancing again keeps the first sample
        c.on_distance_updated(5, &telemetry, false);
        assert!(c.on_distance_updated(30, &telemetry, false).sample.is_none());

        assert_eq!(c.samples().len(), 1);
        assert_eq!(c.samples()[&2].telemetry.power_watts, 150);
        assert_eq!(c.samples()[&2].effective_distance_m, 21);
    }

    #[test]
    fn test_no_samples_while_paused() {
        let mut c = controller(&[0.0; 10]);
        let telemetry = TelemetryState::default();

        assert!(c.on_distance_updated(40, &telemetry, true).sample.is_none());
        assert!(c.samples().is_empty());

        // resuming in the same segment does not count as advancing
        assert!(c.on_distance_updated(40, &telemetry, false).sample.is_none());
        assert!(c.on_distance_updated(41, &telemetry, false).sample.is_some());
    }

    #[test]
    fn test_seek() {
        let mut c = controller(&[0.0; 100]);
        let telemetry = TelemetryState::default();

        let update = c.seek(1000, 100, &telemetry, false).unwrap();
        assert_eq!(c.offset(), 1000);
        assert_eq!(update.effective_distance_m, 1100);
        assert_eq!(update.segment, Some(55));

        assert!(c.seek(-1000, 100, &telemetry, false).is_some());
        assert_eq!(c.offset(), 0);
    }

    #[test]
    fn test_seek_out_of_range_is_rejected() {
        let mut c = controller(&[0.0; 10]);
        let telemetry = TelemetryState::default();

        assert!(c.seek(i64::MAX, 0, &telemetry, false).is_some());
        assert_eq!(c.offset(), i64::MAX);

        let update = c.on_distance_updated(1, &telemetry, false);
        assert_eq!(update.effective_distance_m, i64::MAX);
        assert_eq!(update.slope_percent, None);

        assert!(c.seek(1, 1, &telemetry, false).is_none());
        assert_eq!(c.offset(), i64::MAX);

        assert!(c.seek(-i64::MAX, 0, &telemetry, false).is_some());
        assert_eq!(c.offset(), 0);
    }

    #[test]
    fn test_seek_below_zero_is_rejected() {
        let mut c = controller(&[0.0; 100]);
        let telemetry = TelemetryState::default();

        assert!(c.seek(-1000, 400, &telemetry, false).is_none());
        assert_eq!(c.offset(), 0);

        assert!(c.seek(-400, 400, &telemetry, false).is_some());
        assert_eq!(c.effective_distance(400), 0);
    }
}
