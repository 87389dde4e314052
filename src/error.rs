//! Error types for the spore tree core.
//!
//! Caller mistakes (bad configuration, malformed dt vectors, broken pairing
//! contracts) surface here. A meeting search that simply fails to converge is
//! not an error; it is reported through the pairing outcome instead.

use std::fmt;

use crate::sim::SporeId;

/// Invalid or unreadable configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// A numeric parameter is outside its valid range.
    InvalidParameter {
        field: &'static str,
        value: f64,
        reason: &'static str,
    },
    /// `sample_controls` was asked for a method it does not know.
    UnknownSamplingMethod(String),
    /// Failed to read or write a settings file.
    Io(std::io::Error),
    /// Settings file is not valid JSON for `Settings`.
    Json(serde_json::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, value: f64, reason: &'static str) -> Self {
        ConfigError::InvalidParameter {
            field,
            value,
            reason,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidParameter {
                field,
                value,
                reason,
            } => write!(f, "Invalid parameter `{}` = {}: {}", field, value, reason),
            ConfigError::UnknownSamplingMethod(name) => write!(
                f,
                "Unknown sampling method '{}': expected 'random' or 'mesh'",
                name
            ),
            ConfigError::Io(e) => write!(f, "Failed to access settings file: {}", e),
            ConfigError::Json(e) => write!(f, "Failed to parse settings: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Json(e)
    }
}

/// Failures of the adaptive RK45 integrator.
#[derive(Debug, Clone, PartialEq)]
pub enum IntegrationError {
    /// The state or the horizon became NaN/infinite.
    NonFinite { t: f64 },
    /// Step size shrank below the configured minimum.
    StepSizeUnderflow { t: f64, step: f64 },
    /// Too many steps without reaching the end of the horizon.
    StepLimit { t: f64, steps: usize },
}

impl fmt::Display for IntegrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrationError::NonFinite { t } => {
                write!(f, "Integration produced a non-finite state at t={}", t)
            }
            IntegrationError::StepSizeUnderflow { t, step } => {
                write!(f, "Integration step {} too small at t={}", step, t)
            }
            IntegrationError::StepLimit { t, steps } => {
                write!(f, "Integration gave up after {} steps at t={}", steps, t)
            }
        }
    }
}

impl std::error::Error for IntegrationError {}

/// Errors raised while building control trees and spore trees.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeError {
    /// A dt vector entry is non-finite or exceeds the allowed magnitude.
    InvalidDt { index: usize, value: f64, max_abs: f64 },
    /// A spore tree dt is NaN or infinite.
    NonFiniteDt { index: usize, value: f64 },
    /// A dt vector has the wrong number of entries.
    WrongLength { expected: usize, found: usize },
    /// A sorted grandchild pair shares its parent.
    SortedPairSameParent { pair: usize, parent: usize },
    /// A trajectory step failed to integrate.
    Integration(IntegrationError),
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeError::InvalidDt {
                index,
                value,
                max_abs,
            } => write!(
                f,
                "dt[{}] = {} is invalid (must be finite with |dt| <= {})",
                index, value, max_abs
            ),
            TreeError::NonFiniteDt { index, value } => {
                write!(f, "dt[{}] = {} is not finite", index, value)
            }
            TreeError::WrongLength { expected, found } => {
                write!(f, "dt vector must have {} entries, got {}", expected, found)
            }
            TreeError::SortedPairSameParent { pair, parent } => write!(
                f,
                "Sorted pair {} contains two grandchildren of parent {}",
                pair, parent
            ),
            TreeError::Integration(e) => write!(f, "Trajectory integration failed: {}", e),
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TreeError::Integration(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IntegrationError> for TreeError {
    fn from(e: IntegrationError) -> Self {
        TreeError::Integration(e)
    }
}

/// Errors raised by the grandchild meeting search.
#[derive(Debug, Clone, PartialEq)]
pub enum PairingError {
    /// The pairing must cover every grandchild exactly once.
    PairCount { expected: usize, found: usize },
    /// Grandchild count is odd or no cross-parent perfect matching exists.
    NoMatching { grandchildren: usize },
    /// Evaluating a grandchild trajectory failed.
    Tree(TreeError),
}

impl fmt::Display for PairingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingError::PairCount { expected, found } => {
                write!(f, "Found {} pairs, expected exactly {}", found, expected)
            }
            PairingError::NoMatching { grandchildren } => write!(
                f,
                "No cross-parent pairing covers all {} grandchildren",
                grandchildren
            ),
            PairingError::Tree(e) => write!(f, "Meeting search failed: {}", e),
        }
    }
}

impl std::error::Error for PairingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PairingError::Tree(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TreeError> for PairingError {
    fn from(e: TreeError) -> Self {
        PairingError::Tree(e)
    }
}

impl From<IntegrationError> for PairingError {
    fn from(e: IntegrationError) -> Self {
        PairingError::Tree(TreeError::Integration(e))
    }
}

/// Errors raised by spore graph mutations and lookups.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphError {
    UnknownSpore(SporeId),
    /// Edges must connect two distinct spores.
    SelfLoop(SporeId),
    DuplicateEdge { parent: SporeId, child: SporeId },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::UnknownSpore(id) => write!(f, "Spore {} is not in the graph", id),
            GraphError::SelfLoop(id) => write!(f, "Spore {} cannot link to itself", id),
            GraphError::DuplicateEdge { parent, child } => {
                write!(f, "Edge {} -> {} already exists", parent, child)
            }
        }
    }
}

impl std::error::Error for GraphError {}
