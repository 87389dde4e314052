//! Spore state: a point in the pendulum phase plane chasing a goal

use std::str::FromStr;

use glam::DVec2;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::pendulum::PendulumSystem;
use crate::error::{ConfigError, IntegrationError};

/// How `sample_controls` spreads samples over the control bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingMethod {
    /// i.i.d. uniform draws
    Random,
    /// Evenly spaced, both bounds included
    Mesh,
}

impl FromStr for SamplingMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(SamplingMethod::Random),
            "mesh" => Ok(SamplingMethod::Mesh),
            other => Err(ConfigError::UnknownSamplingMethod(other.to_string())),
        }
    }
}

/// Numerical state of one spore
///
/// The pendulum is passed into every method that steps; nothing here knows
/// which graph (if any) the spore belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SporeLogic {
    position_2d: DVec2,
    goal_position_2d: DVec2,
    /// Default step used when `evolve` gets no dt
    pub dt: f64,
    cost: f64,
    alive: bool,
    /// Set by the one-step optimiser
    pub optimal_control: Option<f64>,
    pub optimal_dt: Option<f64>,
}

impl SporeLogic {
    pub fn new(goal_position_2d: DVec2, initial_position_2d: DVec2, dt: f64) -> Self {
        let mut logic = Self {
            position_2d: initial_position_2d,
            goal_position_2d,
            dt,
            cost: 0.0,
            alive: true,
            optimal_control: None,
            optimal_dt: None,
        };
        logic.cost = logic.calculate_cost(initial_position_2d);
        logic
    }

    /// One exact discrete step from the current position, without mutating
    pub fn step(&self, pendulum: &PendulumSystem, control: f64, dt: f64) -> DVec2 {
        pendulum.discrete_step(self.position_2d, control, dt)
    }

    /// Step, store the new position and refresh the cost
    pub fn evolve(&mut self, pendulum: &PendulumSystem, control: f64, dt: Option<f64>) -> DVec2 {
        let next = self.step(pendulum, control, dt.unwrap_or(self.dt));
        self.set_position_2d(next);
        next
    }

    pub fn position_2d(&self) -> DVec2 {
        self.position_2d
    }

    pub fn goal_position_2d(&self) -> DVec2 {
        self.goal_position_2d
    }

    pub fn set_position_2d(&mut self, position: DVec2) {
        self.position_2d = position;
        self.cost = self.calculate_cost(position);
    }

    /// Euclidean distance from `position` to the goal
    #[inline]
    pub fn calculate_cost(&self, position: DVec2) -> f64 {
        position.distance(self.goal_position_2d)
    }

    /// Cost of the current position
    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Death is terminal: reviving a dead spore is refused and returns false
    pub fn set_alive(&mut self, alive: bool) -> bool {
        if alive && !self.alive {
            log::warn!("Refusing to revive a dead spore at {:?}", self.position_2d);
            return false;
        }
        self.alive = alive;
        true
    }

    /// A spore whose optimal dt collapsed to exactly zero is dead
    pub fn check_death(&mut self) {
        if self.optimal_dt == Some(0.0) && self.alive {
            self.alive = false;
            log::debug!("Spore at {:?} died (optimal dt = 0)", self.position_2d);
        }
    }

    /// `n` control samples within the pendulum's bounds
    pub fn sample_controls<R: Rng + ?Sized>(
        &self,
        pendulum: &PendulumSystem,
        n: usize,
        method: SamplingMethod,
        rng: &mut R,
    ) -> Vec<f64> {
        let (lo, hi) = pendulum.get_control_bounds();
        match method {
            SamplingMethod::Random => (0..n).map(|_| rng.random_range(lo..=hi)).collect(),
            SamplingMethod::Mesh => linspace(lo, hi, n),
        }
    }

    /// Discrete successors for each control, current state untouched
    pub fn simulate_controls(
        &self,
        pendulum: &PendulumSystem,
        controls: &[f64],
        dt: Option<f64>,
    ) -> Vec<DVec2> {
        let dt = dt.unwrap_or(self.dt);
        controls
            .iter()
            .map(|&u| pendulum.discrete_step(self.position_2d, u, dt))
            .collect()
    }

    /// Nonlinear one-step fan, one ghost per control. Negative `dt` gives
    /// the states that would reach this spore.
    pub fn ghost_positions(
        &self,
        pendulum: &PendulumSystem,
        controls: &[f64],
        dt: f64,
    ) -> Result<Vec<DVec2>, IntegrationError> {
        controls
            .iter()
            .map(|&u| pendulum.rk45_step(self.position_2d, u, dt))
            .collect()
    }
}

fn linspace(lo: f64, hi: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![lo],
        _ => {
            let step = (hi - lo) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { hi } else { lo + step * i as f64 })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::PendulumParams;
    use rand::SeedableRng;
    use rand_pcg::Pcg32;

    fn pendulum() -> PendulumSystem {
        PendulumSystem::new(PendulumParams::default()).unwrap()
    }

    #[test]
    fn test_initial_cost_is_distance() {
        let logic = SporeLogic::new(DVec2::ZERO, DVec2::new(3.0, 4.0), 0.05);
        assert_eq!(logic.cost(), 5.0);
        assert!(logic.is_alive());
        assert_eq!(logic.optimal_dt, None);
    }

    #[test]
    fn test_cost_round_trip() {
        let mut logic = SporeLogic::new(DVec2::new(1.0, -1.0), DVec2::ZERO, 0.05);
        let p = DVec2::new(0.2, 0.7);
        logic.set_position_2d(p);
        assert_eq!(logic.position_2d(), p);
        assert_eq!(logic.cost(), logic.calculate_cost(p));
    }

    #[test]
    fn test_evolve_matches_discrete_step() {
        let p = pendulum();
        let mut logic = SporeLogic::new(DVec2::ZERO, DVec2::new(0.5, 0.0), 0.05);
        let expected = p.discrete_step(DVec2::new(0.5, 0.0), 0.3, 0.05);
        let preview = logic.step(&p, 0.3, 0.05);
        assert_eq!(logic.position_2d(), DVec2::new(0.5, 0.0));
        let next = logic.evolve(&p, 0.3, None);
        assert_eq!(preview, expected);
        assert_eq!(next, expected);
        assert_eq!(logic.cost(), expected.length());
    }

    #[test]
    fn test_check_death_is_terminal() {
        let mut logic = SporeLogic::new(DVec2::ZERO, DVec2::ONE, 0.05);
        logic.optimal_dt = Some(0.03);
        logic.check_death();
        assert!(logic.is_alive());

        logic.optimal_dt = Some(0.0);
        logic.check_death();
        assert!(!logic.is_alive());
        assert!(!logic.set_alive(true));
        assert!(!logic.is_alive());
    }

    #[test]
    fn test_clone_copies_optimal_fields() {
        let mut logic = SporeLogic::new(DVec2::ZERO, DVec2::ONE, 0.05);
        logic.optimal_control = Some(-0.4);
        logic.optimal_dt = Some(0.0);
        logic.check_death();
        let copy = logic.clone();
        assert_eq!(copy.optimal_control, Some(-0.4));
        assert!(!copy.is_alive());
        assert_eq!(copy.position_2d(), logic.position_2d());
    }

    #[test]
    fn test_mesh_sampling_covers_bounds() {
        let p = pendulum();
        let logic = SporeLogic::new(DVec2::ZERO, DVec2::ZERO, 0.05);
        let mut rng = Pcg32::seed_from_u64(1);
        let mesh = logic.sample_controls(&p, 5, SamplingMethod::Mesh, &mut rng);
        assert_eq!(mesh, vec![-1.0, -0.5, 0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_random_sampling_within_bounds_and_seeded() {
        let p = pendulum();
        let logic = SporeLogic::new(DVec2::ZERO, DVec2::ZERO, 0.05);
        let a = logic.sample_controls(&p, 50, SamplingMethod::Random, &mut Pcg32::seed_from_u64(7));
        let b = logic.sample_controls(&p, 50, SamplingMethod::Random, &mut Pcg32::seed_from_u64(7));
        assert_eq!(a, b);
        assert!(a.iter().all(|u| (-1.0..=1.0).contains(u)));
    }

    #[test]
    fn test_unknown_sampling_method_rejected() {
        assert_eq!("mesh".parse::<SamplingMethod>().unwrap(), SamplingMethod::Mesh);
        assert!(matches!(
            "grid".parse::<SamplingMethod>(),
            Err(ConfigError::UnknownSamplingMethod(name)) if name == "grid"
        ));
    }

    #[test]
    fn test_simulate_controls_leaves_state() {
        let p = pendulum();
        let logic = SporeLogic::new(DVec2::ZERO, DVec2::new(0.1, 0.2), 0.05);
        let states = logic.simulate_controls(&p, &[-1.0, 1.0], Some(0.1));
        assert_eq!(states.len(), 2);
        assert!(states[1].y > states[0].y);
        assert_eq!(logic.position_2d(), DVec2::new(0.1, 0.2));
    }

    #[test]
    fn test_backward_ghosts_lead_back() {
        let p = pendulum();
        let logic = SporeLogic::new(DVec2::ZERO, DVec2::new(0.3, -0.1), 0.05);
        let back = logic.ghost_positions(&p, &[1.0, -1.0], -0.05).unwrap();
        for (ghost, u) in back.iter().zip([1.0, -1.0]) {
            let forward = p.rk45_step(*ghost, u, 0.05).unwrap();
            assert!((forward - logic.position_2d()).length() < 1e-8);
        }
    }
}
