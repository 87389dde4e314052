//! Spore Tree - pendulum phase-space trajectory trees
//!
//! Core modules:
//! - `sim`: Deterministic numerical core (pendulum model, trees, pairing, valence)
//! - `settings`: Data-driven configuration with validated ranges
//! - `error`: Typed errors for configuration, integration, trees, pairing and graphs

pub mod error;
pub mod settings;
pub mod sim;

pub use error::{ConfigError, GraphError, IntegrationError, PairingError, TreeError};
pub use settings::Settings;

use glam::DVec2;

/// Numerical configuration constants
pub mod consts {
    /// Gravity (m/s²)
    pub const DEFAULT_GRAVITY: f64 = 9.81;
    /// Pendulum length (m)
    pub const DEFAULT_LENGTH: f64 = 2.0;
    pub const DEFAULT_MASS: f64 = 1.0;
    pub const DEFAULT_DAMPING: f64 = 0.1;
    /// Nominal discretisation step (s)
    pub const DEFAULT_DT: f64 = 0.05;
    pub const DEFAULT_MAX_CONTROL: f64 = 1.0;

    /// Grandchild dt relative to the child dt in automatic trees
    pub const DT_GRANDCHILDREN_FACTOR: f64 = 0.2;
    /// Largest |dt| accepted in any dt vector
    pub const MAX_ABS_DT: f64 = 1.0;

    /// Max deviation from the group mean for a convergence group to count as converged.
    /// Uncalibrated; carried over from the exploratory scripts.
    pub const CONVERGENCE_TOLERANCE: f64 = 1e-4;
    /// Grandchildren closer than this are merged
    pub const MERGE_DISTANCE_THRESHOLD: f64 = 1e-4;

    /// A meeting pair farther apart than this is considered unpaired.
    /// Uncalibrated; carried over from the exploratory scripts.
    pub const MEETING_TOLERANCE: f64 = 0.1;
    /// Grid samples per time axis in the meeting search
    pub const PAIRING_GRID_POINTS: usize = 16;
    /// Newton refinement attempts per candidate pair
    pub const PAIRING_MAX_ITERATIONS: usize = 40;
    /// Meeting time search box (magnitudes, seconds)
    pub const PAIRING_MIN_TIME: f64 = 1e-4;
    pub const PAIRING_MAX_TIME: f64 = 0.5;
    /// Newton stops once the meeting residual drops below this
    pub const PAIRING_RESIDUAL_TOLERANCE: f64 = 1e-12;

    /// RK45 tolerances
    pub const RK45_RTOL: f64 = 1e-10;
    pub const RK45_ATOL: f64 = 1e-12;
    pub const RK45_MAX_STEPS: usize = 100_000;
    pub const RK45_MIN_STEP: f64 = 1e-14;

    /// One-step optimiser search range and effort
    pub const OPTIMIZER_DT_MIN: f64 = 0.01;
    pub const OPTIMIZER_DT_MAX: f64 = 0.1;
    pub const OPTIMIZER_GRID_POINTS: usize = 32;
    pub const OPTIMIZER_REFINE_ITERATIONS: usize = 40;

    /// Tree topology
    pub const CHILD_COUNT: usize = 4;
    pub const GRANDCHILD_COUNT: usize = 8;
    pub const TRAJECTORY_COUNT: usize = 8;
    pub const CONVERGENCE_GROUP_COUNT: usize = 4;
    pub const VALENCE_SLOT_COUNT: usize = CHILD_COUNT + GRANDCHILD_COUNT;
}

/// Angle of `to` as seen from `from` in the phase plane (θ on x, θ̇ on y)
#[inline]
pub fn phase_angle(from: DVec2, to: DVec2) -> f64 {
    let d = to - from;
    d.y.atan2(d.x)
}

/// Sign of a signed duration as ±1 (zero counts as forward)
#[inline]
pub fn time_sign(dt: f64) -> f64 {
    if dt < 0.0 { -1.0 } else { 1.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn test_phase_angle_quadrants() {
        let origin = DVec2::new(1.0, 1.0);
        assert!((phase_angle(origin, DVec2::new(2.0, 1.0))).abs() < 1e-12);
        assert!((phase_angle(origin, DVec2::new(1.0, 2.0)) - PI / 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_time_sign() {
        assert_eq!(time_sign(0.3), 1.0);
        assert_eq!(time_sign(-0.3), -1.0);
        assert_eq!(time_sign(0.0), 1.0);
    }
}
