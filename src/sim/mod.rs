//! Deterministic numerical core
//!
//! Everything that decides where a spore goes lives here. This module must be
//! pure and deterministic:
//! - Signed durations only (backward time is a negative dt, never a flag)
//! - Seeded RNG only
//! - Stable iteration order (by spore ID)
//! - No rendering or platform dependencies

pub mod control_tree;
pub mod graph;
pub mod integrator;
pub mod linalg;
pub mod optimizer;
pub mod pairing;
pub mod pendulum;
pub mod spore;
pub mod spore_tree;
pub mod valence;

/// Stable identifier of a spore inside a `SporeGraph`
pub type SporeId = u32;

pub use control_tree::{
    ControlTreeBuilder, ConvergenceGroup, ConvergenceInfo, TreeBuild, TreeEdge, TreeNode,
    Trajectory,
};
pub use graph::{Edge, EdgeKind, SporeGraph, TreeNodeIds};
pub use optimizer::{OptimalStep, apply_optimal_step, find_optimal_step};
pub use pairing::{GrandchildPair, MeetingInfo, PairedDtVector, apply_pairs, find_optimal_pairs, pair_tree};
pub use pendulum::{DiscretizationCheck, PendulumSystem};
pub use spore::{SamplingMethod, SporeLogic};
pub use spore_tree::{Child, Grandchild, MergeReport, MergeSource, SporeTree};
pub use valence::{
    ControlType, GraphSummary, SlotType, SporeValence, TimeDirection, ValenceAnalyzer,
    ValenceSlot,
};
