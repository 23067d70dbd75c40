//! Plausibility checks on step, distance, and speed deltas.
//!
//! These are heuristic gates with configurable thresholds, not proofs. All
//! functions are pure and I/O-free.

use chrono::Duration;

use super::result::{Remediation, ValidationReport, ValidationResult};

/// Default absolute cap on steps in a single sync.
pub const DEFAULT_MAX_STEPS_PER_SYNC: u64 = 10_000;

/// Default cap on the sustained stepping rate.
pub const DEFAULT_MAX_STEPS_PER_MINUTE: f64 = 200.0;

/// Default multiplier on a race's distance before a participant's distance is implausible.
pub const DEFAULT_DISTANCE_TOLERANCE: f64 = 1.1;

/// Default speed above which a reading is implausible for someone on foot.
pub const DEFAULT_MAX_SPEED_KMH: f64 = 20.0;

/// Elapsed time used for the rate check is clamped to this many whole minutes.
const MIN_ELAPSED_MINUTES: i64 = 1;
const MAX_ELAPSED_MINUTES: i64 = 60;

/// Thresholds for [`IntegrityValidator`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidatorConfig {
    pub max_steps_per_sync: u64,
    pub max_steps_per_minute: f64,
    pub distance_tolerance: f64,
    pub max_speed_kmh: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        ValidatorConfig {
            max_steps_per_sync: DEFAULT_MAX_STEPS_PER_SYNC,
            max_steps_per_minute: DEFAULT_MAX_STEPS_PER_MINUTE,
            distance_tolerance: DEFAULT_DISTANCE_TOLERANCE,
            max_speed_kmh: DEFAULT_MAX_SPEED_KMH,
        }
    }
}

/// Participant distance compared against the race distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceCheck {
    pub participant_km: f64,
    pub race_total_km: f64,
}

/// Distance covered over a duration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedCheck {
    pub distance_km: f64,
    pub duration: Duration,
}

/// Arguments for [`IntegrityValidator::validate_all`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationInput {
    pub previous_steps: u64,
    pub new_steps: u64,
    pub elapsed: Duration,
    pub distance: Option<DistanceCheck>,
    pub speed: Option<SpeedCheck>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityValidator {
    config: ValidatorConfig,
}

impl IntegrityValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        IntegrityValidator { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Checks a step counter change over an elapsed interval.
    ///
    /// A counter that went backwards is a warning (sensor reset). The absolute
    /// per-sync cap is checked before the rate, so a delta violating both
    /// reports the cap.
    pub fn validate_step_delta(
        &self,
        previous_steps: u64,
        new_steps: u64,
        elapsed: Duration,
    ) -> ValidationResult {
        if new_steps < previous_steps {
            return ValidationResult::warning(
                format!(
                    "step count decreased from {} to {} (sensor reset)",
                    previous_steps, new_steps
                ),
                Some(Remediation::TreatAsReset),
            );
        }

        let delta = new_steps - previous_steps;
        if delta > self.config.max_steps_per_sync {
            return ValidationResult::error(
                format!(
                    "step delta {} exceeds the per-sync cap of {}",
                    delta, self.config.max_steps_per_sync
                ),
                Some(Remediation::ClampTo(self.config.max_steps_per_sync)),
            );
        }

        let minutes = elapsed
            .num_minutes()
            .clamp(MIN_ELAPSED_MINUTES, MAX_ELAPSED_MINUTES);
        let rate = delta as f64 / minutes as f64;
        if rate > self.config.max_steps_per_minute {
            let allowed = (self.config.max_steps_per_minute * minutes as f64).floor() as u64;
            return ValidationResult::error(
                format!(
                    "step rate {:.1}/min over {} min exceeds {:.0}/min",
                    rate, minutes, self.config.max_steps_per_minute
                ),
                Some(Remediation::ClampTo(allowed)),
            );
        }

        ValidationResult::ok()
    }

    /// Checks that a participant has not covered implausibly more than the race distance.
    ///
    /// Non-finite or negative distances are rejected outright.
    pub fn validate_distance(&self, participant_km: f64, race_total_km: f64) -> ValidationResult {
        if let Some(bad) = implausible_distance("participant distance", participant_km)
            .or_else(|| implausible_distance("race distance", race_total_km))
        {
            return bad;
        }

        let limit = race_total_km * self.config.distance_tolerance;
        if participant_km > limit {
            return ValidationResult::error(
                format!(
                    "distance {:.2} km exceeds race distance {:.2} km beyond tolerance",
                    participant_km, race_total_km
                ),
                Some(Remediation::FlagForReview),
            );
        }
        ValidationResult::ok()
    }

    /// Checks the speed implied by a distance over a duration.
    ///
    /// A zero or negative duration is only plausible with zero distance.
    /// Non-finite or negative distances are rejected outright.
    pub fn validate_speed(&self, distance_km: f64, duration: Duration) -> ValidationResult {
        if let Some(bad) = implausible_distance("distance", distance_km) {
            return bad;
        }

        let hours = duration.num_milliseconds() as f64 / 3_600_000.0;
        if hours <= 0.0 {
            if distance_km > 0.0 {
                return ValidationResult::error(
                    format!("distance {:.2} km covered in no time", distance_km),
                    Some(Remediation::Reject),
                );
            }
            return ValidationResult::ok();
        }

        let speed = distance_km / hours;
        if speed > self.config.max_speed_kmh {
            return ValidationResult::error(
                format!(
                    "speed {:.2} km/h exceeds {:.1} km/h",
                    speed, self.config.max_speed_kmh
                ),
                Some(Remediation::Reject),
            );
        }
        ValidationResult::ok()
    }

    /// Runs every applicable check and returns the non-ok subset.
    pub fn validate_all(&self, input: &ValidationInput) -> ValidationReport {
        let mut results = vec![self.validate_step_delta(
            input.previous_steps,
            input.new_steps,
            input.elapsed,
        )];
        if let Some(d) = input.distance {
            results.push(self.validate_distance(d.participant_km, d.race_total_km));
        }
        if let Some(s) = input.speed {
            results.push(self.validate_speed(s.distance_km, s.duration));
        }
        ValidationReport::from_results(results)
    }
}

/// An error for a distance no sensor can report, or `None` if it is usable.
fn implausible_distance(what: &str, km: f64) -> Option<ValidationResult> {
    if km.is_finite() && km >= 0.0 {
        return None;
    }
    Some(ValidationResult::error(
        format!("{what} {km} km is not a valid distance"),
        Some(Remediation::Reject),
    ))
}
