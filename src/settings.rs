//! Simulation settings
//!
//! Loaded from a JSON file on disk. Missing fields fall back to defaults, and
//! every numeric range is checked by `Settings::validate` before use.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::consts::*;
use crate::error::ConfigError;

/// Physical pendulum parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PendulumParams {
    /// Gravity (m/s²)
    pub g: f64,
    /// Length (m), must be positive
    pub l: f64,
    pub m: f64,
    /// Nominal time step for the exact discretisation
    pub dt: f64,
    pub damping: f64,
    /// Control bound, controls live in [-max_control, max_control]
    pub max_control: f64,
}

impl Default for PendulumParams {
    fn default() -> Self {
        Self {
            g: DEFAULT_GRAVITY,
            l: DEFAULT_LENGTH,
            m: DEFAULT_MASS,
            dt: DEFAULT_DT,
            damping: DEFAULT_DAMPING,
            max_control: DEFAULT_MAX_CONTROL,
        }
    }
}

impl PendulumParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        finite("pendulum.g", self.g)?;
        positive("pendulum.l", self.l)?;
        positive("pendulum.m", self.m)?;
        finite("pendulum.dt", self.dt)?;
        non_negative("pendulum.damping", self.damping)?;
        non_negative("pendulum.max_control", self.max_control)?;
        Ok(())
    }
}

/// Adaptive RK45 tolerances
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorSettings {
    pub rtol: f64,
    pub atol: f64,
    pub max_steps: usize,
    /// Smallest step magnitude before giving up
    pub min_step: f64,
}

impl Default for IntegratorSettings {
    fn default() -> Self {
        Self {
            rtol: RK45_RTOL,
            atol: RK45_ATOL,
            max_steps: RK45_MAX_STEPS,
            min_step: RK45_MIN_STEP,
        }
    }
}

impl IntegratorSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("integrator.rtol", self.rtol)?;
        positive("integrator.atol", self.atol)?;
        positive("integrator.min_step", self.min_step)?;
        if self.max_steps == 0 {
            return Err(ConfigError::invalid(
                "integrator.max_steps",
                0.0,
                "must allow at least one step",
            ));
        }
        Ok(())
    }
}

/// Control tree and spore tree parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeSettings {
    /// Child dt magnitude in automatic spore trees
    pub dt_base: f64,
    /// Grandchild dt = dt_base * factor in automatic spore trees
    pub dt_grandchildren_factor: f64,
    /// Step magnitudes for the 8-trajectory control tree
    pub dt_vector: [f64; TRAJECTORY_COUNT],
    /// Any |dt| above this is rejected
    pub max_abs_dt: f64,
    pub convergence_tolerance: f64,
    pub merge_distance_threshold: f64,
}

impl Default for TreeSettings {
    fn default() -> Self {
        Self {
            dt_base: DEFAULT_DT,
            dt_grandchildren_factor: DT_GRANDCHILDREN_FACTOR,
            dt_vector: [DEFAULT_DT; TRAJECTORY_COUNT],
            max_abs_dt: MAX_ABS_DT,
            convergence_tolerance: CONVERGENCE_TOLERANCE,
            merge_distance_threshold: MERGE_DISTANCE_THRESHOLD,
        }
    }
}

impl TreeSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("tree.max_abs_dt", self.max_abs_dt)?;
        positive("tree.dt_base", self.dt_base)?;
        if self.dt_base > self.max_abs_dt {
            return Err(ConfigError::invalid(
                "tree.dt_base",
                self.dt_base,
                "exceeds tree.max_abs_dt",
            ));
        }
        positive("tree.dt_grandchildren_factor", self.dt_grandchildren_factor)?;
        for &dt in &self.dt_vector {
            finite("tree.dt_vector", dt)?;
            if dt.abs() > self.max_abs_dt {
                return Err(ConfigError::invalid(
                    "tree.dt_vector",
                    dt,
                    "exceeds tree.max_abs_dt",
                ));
            }
        }
        positive("tree.convergence_tolerance", self.convergence_tolerance)?;
        positive("tree.merge_distance_threshold", self.merge_distance_threshold)?;
        Ok(())
    }
}

/// Grandchild meeting search parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingSettings {
    /// Pairs farther apart than this count as not met
    pub meeting_tolerance: f64,
    /// Samples per time axis in the coarse grid
    pub grid_points: usize,
    /// Newton refinement iterations
    pub max_iterations: usize,
    /// Search box for meeting time magnitudes
    pub min_time: f64,
    pub max_time: f64,
    pub residual_tolerance: f64,
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self {
            meeting_tolerance: MEETING_TOLERANCE,
            grid_points: PAIRING_GRID_POINTS,
            max_iterations: PAIRING_MAX_ITERATIONS,
            min_time: PAIRING_MIN_TIME,
            max_time: PAIRING_MAX_TIME,
            residual_tolerance: PAIRING_RESIDUAL_TOLERANCE,
        }
    }
}

impl PairingSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("pairing.meeting_tolerance", self.meeting_tolerance)?;
        positive("pairing.min_time", self.min_time)?;
        positive("pairing.max_time", self.max_time)?;
        if self.min_time >= self.max_time {
            return Err(ConfigError::invalid(
                "pairing.min_time",
                self.min_time,
                "must be below pairing.max_time",
            ));
        }
        if self.grid_points < 2 {
            return Err(ConfigError::invalid(
                "pairing.grid_points",
                self.grid_points as f64,
                "needs at least 2 samples",
            ));
        }
        positive("pairing.residual_tolerance", self.residual_tolerance)?;
        Ok(())
    }
}

/// One-step (control, dt) optimiser parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    pub dt_min: f64,
    pub dt_max: f64,
    pub grid_points: usize,
    pub refine_iterations: usize,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            dt_min: OPTIMIZER_DT_MIN,
            dt_max: OPTIMIZER_DT_MAX,
            grid_points: OPTIMIZER_GRID_POINTS,
            refine_iterations: OPTIMIZER_REFINE_ITERATIONS,
        }
    }
}

impl OptimizerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("optimizer.dt_min", self.dt_min)?;
        positive("optimizer.dt_max", self.dt_max)?;
        if self.dt_min >= self.dt_max {
            return Err(ConfigError::invalid(
                "optimizer.dt_min",
                self.dt_min,
                "must be below optimizer.dt_max",
            ));
        }
        if self.grid_points < 2 {
            return Err(ConfigError::invalid(
                "optimizer.grid_points",
                self.grid_points as f64,
                "needs at least 2 samples",
            ));
        }
        Ok(())
    }
}

/// Complete settings file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pendulum: PendulumParams,
    pub integrator: IntegratorSettings,
    pub tree: TreeSettings,
    pub pairing: PairingSettings,
    pub optimizer: OptimizerSettings,
}

impl Settings {
    /// Check every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pendulum.validate()?;
        self.integrator.validate()?;
        self.tree.validate()?;
        self.pairing.validate()?;
        self.optimizer.validate()?;
        Ok(())
    }

    /// Parse settings from JSON text and validate them
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let settings = Self::from_json(&json)?;
        log::info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Save settings as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        log::info!("Settings saved to {}", path.display());
        Ok(())
    }
}

fn finite(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, value, "must be finite"))
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    finite(field, value)?;
    if value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, value, "must be positive"))
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    finite(field, value)?;
    if value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, value, "must not be negative"))
    }
}
