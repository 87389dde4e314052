//! One-step (control, dt) optimiser
//!
//! For a fixed dt the exact discrete step is affine in the control, so the best
//! control is the clamped least-squares solution. Only dt needs a search: a
//! coarse grid followed by golden-section refinement around the best sample.

use glam::DVec2;
use serde::Serialize;

use super::pendulum::PendulumSystem;
use super::spore::SporeLogic;
use crate::settings::OptimizerSettings;

const INV_PHI: f64 = 0.618_033_988_749_894_8;

/// Best single step found for a spore
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OptimalStep {
    pub control: f64,
    /// 0.0 when no step improves on the current cost
    pub dt: f64,
    /// Cost after the step (current cost when not improved)
    pub cost: f64,
    pub improved: bool,
}

/// Minimise the post-step goal distance over control bounds and dt range
pub fn find_optimal_step(
    logic: &SporeLogic,
    pendulum: &PendulumSystem,
    settings: &OptimizerSettings,
) -> OptimalStep {
    let state = logic.position_2d();
    let goal = logic.goal_position_2d();
    let bounds = pendulum.get_control_bounds();
    let evaluate = |dt: f64| best_control_at(pendulum, state, goal, bounds, dt);

    let n = settings.grid_points.max(2);
    let span = settings.dt_max - settings.dt_min;
    let step = span / (n - 1) as f64;

    let mut best_index = 0;
    let mut best = evaluate(settings.dt_min);
    for i in 1..n {
        let candidate = evaluate(settings.dt_min + step * i as f64);
        if candidate.1 < best.1 {
            best = candidate;
            best_index = i;
        }
    }

    // Golden section inside the bracket around the best grid sample
    let mut lo = settings.dt_min + step * best_index.saturating_sub(1) as f64;
    let mut hi = (settings.dt_min + step * (best_index + 1) as f64).min(settings.dt_max);
    let mut best_dt = settings.dt_min + step * best_index as f64;
    let mut x1 = hi - INV_PHI * (hi - lo);
    let mut x2 = lo + INV_PHI * (hi - lo);
    let mut f1 = evaluate(x1);
    let mut f2 = evaluate(x2);
    for _ in 0..settings.refine_iterations {
        if f1.1 < f2.1 {
            hi = x2;
            x2 = x1;
            f2 = f1;
            x1 = hi - INV_PHI * (hi - lo);
            f1 = evaluate(x1);
        } else {
            lo = x1;
            x1 = x2;
            f1 = f2;
            x2 = lo + INV_PHI * (hi - lo);
            f2 = evaluate(x2);
        }
    }
    for (dt, candidate) in [(x1, f1), (x2, f2)] {
        if candidate.1 < best.1 {
            best = candidate;
            best_dt = dt;
        }
    }

    let current = logic.cost();
    if best.1 < current {
        OptimalStep {
            control: best.0,
            dt: best_dt,
            cost: best.1,
            improved: true,
        }
    } else {
        log::debug!(
            "No step improves on cost {:.6} from {:?}",
            current,
            state
        );
        OptimalStep {
            control: 0.0,
            dt: 0.0,
            cost: current,
            improved: false,
        }
    }
}

/// Store the optimum on the spore and let it die if dt collapsed to zero
pub fn apply_optimal_step(
    logic: &mut SporeLogic,
    pendulum: &PendulumSystem,
    settings: &OptimizerSettings,
) -> OptimalStep {
    let step = find_optimal_step(logic, pendulum, settings);
    logic.optimal_control = Some(step.control);
    logic.optimal_dt = Some(step.dt);
    logic.check_death();
    step
}

/// (control, cost) minimising |A_d x + B_d u - goal| for one dt
fn best_control_at(
    pendulum: &PendulumSystem,
    state: DVec2,
    goal: DVec2,
    (lo, hi): (f64, f64),
    dt: f64,
) -> (f64, f64) {
    let (a_d, b_d) = pendulum.compute_discrete_matrices_exact(dt);
    let drift = a_d * state;
    let gain = b_d.length_squared();
    let control = if gain > 0.0 {
        (b_d.dot(goal - drift) / gain).clamp(lo, hi)
    } else {
        0.0
    };
    (control, (drift + b_d * control).distance(goal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::PendulumParams;

    fn pendulum() -> PendulumSystem {
        PendulumSystem::new(PendulumParams::default()).unwrap()
    }

    #[test]
    fn test_improves_cost_within_bounds() {
        // Moving away in angle but decelerating hard: |x| shrinks
        let p = pendulum();
        let settings = OptimizerSettings::default();
        let logic = SporeLogic::new(DVec2::ZERO, DVec2::new(0.5, 1.0), 0.05);
        let step = find_optimal_step(&logic, &p, &settings);
        assert!(step.improved);
        assert!(step.cost < logic.cost());
        assert!((settings.dt_min..=settings.dt_max).contains(&step.dt));
        assert!((-1.0..=1.0).contains(&step.control));
        let reached = logic.step(&p, step.control, step.dt);
        assert!((logic.calculate_cost(reached) - step.cost).abs() < 1e-12);
    }

    #[test]
    fn test_resting_offset_cannot_improve() {
        // At rest the first-order change is zero and bounded control cannot
        // make the second-order change negative
        let p = pendulum();
        let mut logic = SporeLogic::new(DVec2::ZERO, DVec2::new(0.5, 0.0), 0.05);
        let step = apply_optimal_step(&mut logic, &p, &OptimizerSettings::default());
        assert!(!step.improved);
        assert_eq!(step.dt, 0.0);
        assert_eq!(step.cost, logic.cost());
        assert!(!logic.is_alive());
    }

    #[test]
    fn test_beats_every_grid_sample() {
        let p = pendulum();
        let settings = OptimizerSettings::default();
        let logic = SporeLogic::new(DVec2::new(0.1, 0.4), DVec2::new(-0.2, 0.3), 0.05);
        let step = find_optimal_step(&logic, &p, &settings);
        for i in 0..=20 {
            let dt = settings.dt_min + (settings.dt_max - settings.dt_min) * i as f64 / 20.0;
            for k in 0..=20 {
                let u = -1.0 + 0.1 * k as f64;
                let cost = logic.calculate_cost(logic.step(&p, u, dt));
                assert!(step.cost <= cost + 1e-9);
            }
        }
    }

    #[test]
    fn test_at_goal_no_improvement_kills() {
        let p = pendulum();
        let mut logic = SporeLogic::new(DVec2::ZERO, DVec2::ZERO, 0.05);
        let step = apply_optimal_step(&mut logic, &p, &OptimizerSettings::default());
        assert!(!step.improved);
        assert_eq!(step.dt, 0.0);
        assert_eq!(logic.optimal_dt, Some(0.0));
        assert!(!logic.is_alive());
    }

    #[test]
    fn test_apply_keeps_improving_spore_alive() {
        let p = pendulum();
        let mut logic = SporeLogic::new(DVec2::ZERO, DVec2::new(0.5, 0.2), 0.05);
        let step = apply_optimal_step(&mut logic, &p, &OptimizerSettings::default());
        assert!(step.improved);
        assert_eq!(logic.optimal_dt, Some(step.dt));
        assert_eq!(logic.optimal_control, Some(step.control));
        assert!(logic.is_alive());
    }
}
