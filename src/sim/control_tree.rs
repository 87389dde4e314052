//! Eight two-step control trajectories converging pairwise
//!
//! Each trajectory applies `(±u_max, ±dt)` twice. Trajectories `2k` and `2k+1`
//! use the same two dt entries in swapped order, so for zero control they end
//! at the same point; how far apart they land with control on is the
//! convergence measure of the group.

use glam::DVec2;
use serde::Serialize;

use super::pendulum::PendulumSystem;
use super::valence::ControlType;
use crate::consts::{CONVERGENCE_GROUP_COUNT, TRAJECTORY_COUNT};
use crate::error::TreeError;
use crate::settings::TreeSettings;

/// `(sign(u), sign(dt))` for both steps of every trajectory
const CONTROL_SEQUENCES: [[(f64, f64); 2]; TRAJECTORY_COUNT] = [
    [(1.0, 1.0), (-1.0, 1.0)],
    [(-1.0, 1.0), (1.0, 1.0)],
    [(-1.0, 1.0), (1.0, -1.0)],
    [(1.0, -1.0), (-1.0, 1.0)],
    [(1.0, -1.0), (-1.0, -1.0)],
    [(-1.0, -1.0), (1.0, -1.0)],
    [(1.0, 1.0), (-1.0, -1.0)],
    [(-1.0, -1.0), (1.0, 1.0)],
];

/// dt_vector indices used by each step of trajectory `id`
#[inline]
fn dt_indices(id: usize) -> [usize; 2] {
    if id % 2 == 0 { [id, id + 1] } else { [id, id - 1] }
}

/// A two-step trajectory from the root
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trajectory {
    pub id: usize,
    /// Signed `(control, dt)` of both steps
    pub sequence: [(f64, f64); 2],
    /// Start, middle and end point
    pub points: [DVec2; 3],
    pub convergence_group: usize,
}

impl Trajectory {
    pub fn endpoint(&self) -> DVec2 {
        self.points[2]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvergenceGroup {
    pub group_id: usize,
    pub trajectories: [usize; 2],
    pub mean_point: DVec2,
    /// Largest endpoint distance from `mean_point`
    pub max_deviation: f64,
    pub converged: bool,
    pub endpoints: [DVec2; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvergenceInfo {
    pub groups: Vec<ConvergenceGroup>,
    pub num_converged: usize,
    pub total_groups: usize,
}

/// Node of the flattened tree view (`root`, `mid_i`, `end_i`)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeNode {
    pub id: String,
    pub level: u8,
    pub position: DVec2,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeEdge {
    pub parent_id: String,
    pub child_id: String,
    pub control: f64,
    pub dt: f64,
    pub is_forward: bool,
    /// `None` for zero control
    pub control_type: Option<ControlType>,
}

/// Everything one `build_tree` call produces
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeBuild {
    pub trajectories: Vec<Trajectory>,
    pub convergence: ConvergenceInfo,
    pub dt_vector: [f64; TRAJECTORY_COUNT],
    pub nodes: Vec<TreeNode>,
    pub edges: Vec<TreeEdge>,
}

/// Builds the 8-trajectory control tree from a root state
#[derive(Debug, Clone)]
pub struct ControlTreeBuilder {
    dt_vector: [f64; TRAJECTORY_COUNT],
    max_abs_dt: f64,
    tolerance: f64,
    trajectories: Vec<Trajectory>,
}

impl ControlTreeBuilder {
    /// `None` uses the default step for every entry
    pub fn new(
        dt_vector: Option<[f64; TRAJECTORY_COUNT]>,
        max_abs_dt: f64,
        tolerance: f64,
    ) -> Result<Self, TreeError> {
        let dt_vector = dt_vector.unwrap_or(TreeSettings::default().dt_vector);
        validate_dt_vector(&dt_vector, max_abs_dt)?;
        Ok(Self {
            dt_vector,
            max_abs_dt,
            tolerance,
            trajectories: Vec::with_capacity(TRAJECTORY_COUNT),
        })
    }

    pub fn from_settings(settings: &TreeSettings) -> Result<Self, TreeError> {
        Self::new(
            Some(settings.dt_vector),
            settings.max_abs_dt,
            settings.convergence_tolerance,
        )
    }

    pub fn dt_vector(&self) -> [f64; TRAJECTORY_COUNT] {
        self.dt_vector
    }

    /// Validate and replace the dt vector; built trajectories are kept until
    /// the next `build_tree`
    pub fn update_dt_vector(&mut self, dt_vector: &[f64]) -> Result<(), TreeError> {
        let dt_vector: [f64; TRAJECTORY_COUNT] =
            dt_vector.try_into().map_err(|_| TreeError::WrongLength {
                expected: TRAJECTORY_COUNT,
                found: dt_vector.len(),
            })?;
        validate_dt_vector(&dt_vector, self.max_abs_dt)?;
        self.dt_vector = dt_vector;
        log::info!("Control tree dt vector updated: {:?}", self.dt_vector);
        Ok(())
    }

    /// Integrate all 8 trajectories from `initial` and measure convergence
    pub fn build_tree(
        &mut self,
        pendulum: &PendulumSystem,
        initial: DVec2,
    ) -> Result<TreeBuild, TreeError> {
        let u_max = pendulum.get_control_bounds().1;
        let mut trajectories = Vec::with_capacity(TRAJECTORY_COUNT);

        for (id, steps) in CONTROL_SEQUENCES.iter().enumerate() {
            let indices = dt_indices(id);
            let mut points = [initial; 3];
            let mut sequence = [(0.0, 0.0); 2];
            for (k, &(u_sign, dt_sign)) in steps.iter().enumerate() {
                let control = u_max * u_sign;
                let dt = self.dt_vector[indices[k]] * dt_sign;
                points[k + 1] = pendulum.rk45_step(points[k], control, dt)?;
                sequence[k] = (control, dt);
            }
            log::debug!(
                "Trajectory {} (dt[{}], dt[{}]): {:?} -> {:?}",
                id,
                indices[0],
                indices[1],
                sequence,
                points
            );
            trajectories.push(Trajectory {
                id,
                sequence,
                points,
                convergence_group: id / 2,
            });
        }

        let convergence = analyze_convergence(&trajectories, self.tolerance);
        let (nodes, edges) = graph_view(&trajectories);
        self.trajectories = trajectories.clone();

        if convergence.num_converged < convergence.total_groups {
            log::warn!(
                "Control tree from {:?}: only {}/{} groups converged",
                initial,
                convergence.num_converged,
                convergence.total_groups
            );
        } else {
            log::info!("Control tree from {:?}: all groups converged", initial);
        }

        Ok(TreeBuild {
            trajectories,
            convergence,
            dt_vector: self.dt_vector,
            nodes,
            edges,
        })
    }

    /// Trajectory from the last build
    pub fn trajectory(&self, id: usize) -> Option<&Trajectory> {
        self.trajectories.get(id)
    }

    pub fn trajectories(&self) -> &[Trajectory] {
        &self.trajectories
    }

    /// Mean endpoint of each convergence group from the last build
    pub fn convergent_endpoints(&self) -> Vec<DVec2> {
        self.trajectories
            .chunks_exact(2)
            .map(|pair| (pair[0].endpoint() + pair[1].endpoint()) * 0.5)
            .collect()
    }
}

fn validate_dt_vector(dt_vector: &[f64], max_abs_dt: f64) -> Result<(), TreeError> {
    for (index, &value) in dt_vector.iter().enumerate() {
        if !value.is_finite() || value.abs() > max_abs_dt {
            return Err(TreeError::InvalidDt {
                index,
                value,
                max_abs: max_abs_dt,
            });
        }
    }
    Ok(())
}

fn analyze_convergence(trajectories: &[Trajectory], tolerance: f64) -> ConvergenceInfo {
    let groups: Vec<ConvergenceGroup> = trajectories
        .chunks_exact(2)
        .enumerate()
        .map(|(group_id, pair)| {
            let endpoints = [pair[0].endpoint(), pair[1].endpoint()];
            let mean_point = (endpoints[0] + endpoints[1]) * 0.5;
            let max_deviation = endpoints
                .iter()
                .map(|p| p.distance(mean_point))
                .fold(0.0, f64::max);
            log::debug!(
                "Group {}: mean {:?}, max deviation {:.3e}",
                group_id,
                mean_point,
                max_deviation
            );
            ConvergenceGroup {
                group_id,
                trajectories: [pair[0].id, pair[1].id],
                mean_point,
                max_deviation,
                converged: max_deviation < tolerance,
                endpoints,
            }
        })
        .collect();

    ConvergenceInfo {
        num_converged: groups.iter().filter(|g| g.converged).count(),
        total_groups: CONVERGENCE_GROUP_COUNT,
        groups,
    }
}

fn graph_view(trajectories: &[Trajectory]) -> (Vec<TreeNode>, Vec<TreeEdge>) {
    let mut nodes = Vec::with_capacity(1 + 2 * trajectories.len());
    let mut edges = Vec::with_capacity(2 * trajectories.len());
    let Some(first) = trajectories.first() else {
        return (nodes, edges);
    };
    nodes.push(TreeNode {
        id: "root".to_string(),
        level: 0,
        position: first.points[0],
    });

    for traj in trajectories {
        let mid_id = format!("mid_{}", traj.id);
        let end_id = format!("end_{}", traj.id);
        nodes.push(TreeNode {
            id: mid_id.clone(),
            level: 1,
            position: traj.points[1],
        });
        nodes.push(TreeNode {
            id: end_id.clone(),
            level: 2,
            position: traj.points[2],
        });
        for (parent_id, child_id, (control, dt)) in [
            ("root".to_string(), mid_id.clone(), traj.sequence[0]),
            (mid_id, end_id, traj.sequence[1]),
        ] {
            edges.push(TreeEdge {
                parent_id,
                child_id,
                control,
                dt,
                is_forward: dt >= 0.0,
                control_type: ControlType::from_control(control),
            });
        }
    }
    (nodes, edges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::PendulumParams;
    use proptest::prelude::*;

    fn pendulum(max_control: f64) -> PendulumSystem {
        PendulumSystem::new(PendulumParams {
            max_control,
            ..PendulumParams::default()
        })
        .unwrap()
    }

    fn builder(dt: [f64; 8]) -> ControlTreeBuilder {
        ControlTreeBuilder::new(Some(dt), 1.0, 1e-4).unwrap()
    }

    #[test]
    fn test_sequence_signs_and_dt_mapping() {
        let dt = [0.01, 0.02, 0.03, 0.04, 0.05, 0.06, 0.07, 0.08];
        let build = builder(dt).build_tree(&pendulum(1.0), DVec2::new(0.2, 0.0)).unwrap();
        let t = &build.trajectories;
        assert_eq!(t[0].sequence, [(1.0, 0.01), (-1.0, 0.02)]);
        assert_eq!(t[1].sequence, [(-1.0, 0.02), (1.0, 0.01)]);
        assert_eq!(t[2].sequence, [(-1.0, 0.03), (1.0, -0.04)]);
        assert_eq!(t[3].sequence, [(1.0, -0.04), (-1.0, 0.03)]);
        assert_eq!(t[4].sequence, [(1.0, -0.05), (-1.0, -0.06)]);
        assert_eq!(t[5].sequence, [(-1.0, -0.06), (1.0, -0.05)]);
        assert_eq!(t[6].sequence, [(1.0, 0.07), (-1.0, -0.08)]);
        assert_eq!(t[7].sequence, [(-1.0, -0.08), (1.0, 0.07)]);
        for traj in t {
            assert_eq!(traj.convergence_group, traj.id / 2);
            assert_eq!(traj.points[0], DVec2::new(0.2, 0.0));
        }
        assert_eq!(build.dt_vector, dt);
    }

    #[test]
    fn test_zero_control_groups_coincide() {
        let dt = [0.05, 0.03, 0.02, 0.07, 0.04, 0.01, 0.06, 0.05];
        let build = builder(dt).build_tree(&pendulum(0.0), DVec2::new(0.5, -0.3)).unwrap();
        assert_eq!(build.convergence.total_groups, 4);
        assert_eq!(build.convergence.num_converged, 4);
        for group in &build.convergence.groups {
            assert!(group.max_deviation < 1e-8);
        }
    }

    #[test]
    fn test_graph_view_shape() {
        let build = builder([0.05; 8]).build_tree(&pendulum(1.0), DVec2::ZERO).unwrap();
        assert_eq!(build.nodes.len(), 17);
        assert_eq!(build.edges.len(), 16);
        assert_eq!(build.nodes[0].id, "root");
        let e = &build.edges[4];
        assert_eq!((e.parent_id.as_str(), e.child_id.as_str()), ("root", "mid_2"));
        assert_eq!(e.control_type, Some(ControlType::Min));
        assert!(e.is_forward);
        let e = &build.edges[5];
        assert_eq!(e.control_type, Some(ControlType::Max));
        assert!(!e.is_forward);
    }

    #[test]
    fn test_results_stored_for_queries() {
        let mut b = builder([0.05; 8]);
        assert!(b.trajectory(0).is_none());
        let build = b.build_tree(&pendulum(1.0), DVec2::new(0.1, 0.1)).unwrap();
        assert_eq!(b.trajectory(3), Some(&build.trajectories[3]));
        assert!(b.trajectory(8).is_none());
        let means = b.convergent_endpoints();
        assert_eq!(means.len(), 4);
        for (mean, group) in means.iter().zip(&build.convergence.groups) {
            assert_eq!(*mean, group.mean_point);
        }
    }

    #[test]
    fn test_invalid_dt_vector_rejected() {
        let mut dt = [0.05; 8];
        dt[5] = 1.5;
        assert_eq!(
            ControlTreeBuilder::new(Some(dt), 1.0, 1e-4).unwrap_err(),
            TreeError::InvalidDt { index: 5, value: 1.5, max_abs: 1.0 }
        );
        dt[5] = f64::NAN;
        assert!(ControlTreeBuilder::new(Some(dt), 1.0, 1e-4).is_err());

        let mut b = builder([0.05; 8]);
        assert_eq!(
            b.update_dt_vector(&[0.05; 7]).unwrap_err(),
            TreeError::WrongLength { expected: 8, found: 7 }
        );
        assert!(b.update_dt_vector(&[0.1; 8]).is_ok());
        assert_eq!(b.dt_vector(), [0.1; 8]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_build_is_deterministic(
            theta in -1.0f64..1.0,
            omega in -1.0f64..1.0,
            dt in 0.01f64..0.2,
        ) {
            let p = pendulum(1.0);
            let first = builder([dt; 8]).build_tree(&p, DVec2::new(theta, omega)).unwrap();
            let second = builder([dt; 8]).build_tree(&p, DVec2::new(theta, omega)).unwrap();
            prop_assert_eq!(first, second);
        }
    }
}
