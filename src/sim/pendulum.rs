//! Damped pendulum model
//!
//! Continuous linearisation around the hanging equilibrium:
//!
//! ```text
//! A = [[0, 1], [-g/l, -damping]],  B = [0, 1]ᵀ
//! ```
//!
//! discretised exactly through the augmented exponential
//! `exp([[A·dt, B·dt], [0, 0]]) = [[A_d, B_d], [0, 1]]`, plus adaptive RK45 of
//! the full nonlinear field `θ'' = -(g/l)·sin θ - damping·θ' + u` for tree
//! construction.

use glam::{DMat2, DMat3, DVec2, DVec3};
use serde::Serialize;

use super::integrator;
use super::linalg;
use crate::error::{ConfigError, IntegrationError};
use crate::settings::{IntegratorSettings, PendulumParams};

/// Result of the diagnostic discretisation cross-check
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DiscretizationCheck {
    /// max |A_d - expm(A·dt)|
    pub a_error: f64,
    /// max |B_d - A⁻¹(A_d - I)B|
    pub b_error: f64,
}

/// Pendulum system with cached exact discretisation
#[derive(Debug, Clone)]
pub struct PendulumSystem {
    params: PendulumParams,
    integrator: IntegratorSettings,
    a: DMat2,
    b: DVec2,
    a_discrete: DMat2,
    b_discrete: DVec2,
}

impl PendulumSystem {
    /// Build the system; the discrete pair is ready before this returns
    pub fn new(params: PendulumParams) -> Result<Self, ConfigError> {
        Self::with_integrator(params, IntegratorSettings::default())
    }

    pub fn with_integrator(
        params: PendulumParams,
        integrator: IntegratorSettings,
    ) -> Result<Self, ConfigError> {
        params.validate()?;
        integrator.validate()?;

        let a = DMat2::from_cols(
            DVec2::new(0.0, -params.g / params.l),
            DVec2::new(1.0, -params.damping),
        );
        let b = DVec2::new(0.0, 1.0);
        let (a_discrete, b_discrete) = discretize(a, b, params.dt);

        let system = Self {
            params,
            integrator,
            a,
            b,
            a_discrete,
            b_discrete,
        };
        log::debug!(
            "Pendulum discretised at dt={}: A_d={:?} B_d={:?}",
            params.dt,
            a_discrete,
            b_discrete
        );
        if let Some(check) = system.verify_discretization() {
            log::debug!(
                "Discretisation cross-check: |ΔA_d|={:.3e} |ΔB_d|={:.3e}",
                check.a_error,
                check.b_error
            );
        }
        Ok(system)
    }

    pub fn params(&self) -> &PendulumParams {
        &self.params
    }

    pub fn integrator_settings(&self) -> &IntegratorSettings {
        &self.integrator
    }

    pub fn dt(&self) -> f64 {
        self.params.dt
    }

    pub fn max_control(&self) -> f64 {
        self.params.max_control
    }

    /// Continuous state matrix A
    pub fn a(&self) -> DMat2 {
        self.a
    }

    /// Continuous control matrix B
    pub fn b(&self) -> DVec2 {
        self.b
    }

    /// Cached discrete pair for the nominal dt
    pub fn discrete_matrices(&self) -> (DMat2, DVec2) {
        (self.a_discrete, self.b_discrete)
    }

    /// Change the nominal dt and recompute the discrete pair
    pub fn set_dt(&mut self, dt: f64) -> Result<(), ConfigError> {
        if !dt.is_finite() {
            return Err(ConfigError::invalid("pendulum.dt", dt, "must be finite"));
        }
        self.params.dt = dt;
        let (a_d, b_d) = discretize(self.a, self.b, dt);
        self.a_discrete = a_d;
        self.b_discrete = b_d;
        log::debug!("Pendulum re-discretised at dt={}", dt);
        Ok(())
    }

    /// Exact discrete pair (A_d, B_d) for an arbitrary dt
    pub fn compute_discrete_matrices_exact(&self, dt: f64) -> (DMat2, DVec2) {
        discretize(self.a, self.b, dt)
    }

    /// x[k+1] = A_d·x[k] + B_d·u[k]
    pub fn discrete_step(&self, state: DVec2, control: f64, dt: f64) -> DVec2 {
        let (a_d, b_d) = if dt == self.params.dt {
            (self.a_discrete, self.b_discrete)
        } else {
            discretize(self.a, self.b, dt)
        };
        a_d * state + b_d * control
    }

    /// Repeated discrete steps at the nominal dt; the last control is reused
    /// once `controls` runs out. Returns `steps + 1` states including `x0`.
    pub fn simulate_discrete(&self, x0: DVec2, controls: &[f64], steps: usize) -> Vec<DVec2> {
        let mut states = Vec::with_capacity(steps + 1);
        let mut x = x0;
        states.push(x);
        for i in 0..steps {
            let u = controls
                .get(i)
                .or_else(|| controls.last())
                .copied()
                .unwrap_or(0.0);
            x = self.discrete_step(x, u, self.params.dt);
            states.push(x);
        }
        states
    }

    /// Nonlinear vector field
    #[inline]
    pub fn continuous_dynamics(&self, state: DVec2, control: f64) -> DVec2 {
        let p = &self.params;
        DVec2::new(
            state.y,
            -(p.g / p.l) * state.x.sin() - p.damping * state.y + control,
        )
    }

    /// Integrate the nonlinear dynamics over a signed horizon `dt`
    pub fn rk45_step(&self, state: DVec2, control: f64, dt: f64) -> Result<DVec2, IntegrationError> {
        integrator::integrate(
            |x| self.continuous_dynamics(x, control),
            state,
            dt,
            &self.integrator,
        )
    }

    /// Integrate the continuous linear model (A x + B u) over a signed horizon
    pub fn linear_rk45_step(
        &self,
        state: DVec2,
        control: f64,
        dt: f64,
    ) -> Result<DVec2, IntegrationError> {
        integrator::integrate(
            |x| self.a * x + self.b * control,
            state,
            dt,
            &self.integrator,
        )
    }

    pub fn get_control_bounds(&self) -> (f64, f64) {
        (-self.params.max_control, self.params.max_control)
    }

    /// Magnitudes of the eigenvalues of A_d, larger first
    pub fn discrete_eigenvalue_magnitudes(&self) -> [f64; 2] {
        linalg::eigenvalue_magnitudes(&self.a_discrete)
    }

    /// Compare the augmented-exponential pair against direct formulas.
    /// `None` when A is singular (g = 0); diagnostic only.
    pub fn verify_discretization(&self) -> Option<DiscretizationCheck> {
        let det = self.a.determinant();
        if det.abs() < f64::EPSILON {
            log::debug!("A is singular, skipping discretisation cross-check");
            return None;
        }
        let dt = self.params.dt;
        let exp_a = linalg::expm2(self.a * dt);
        let b_formula = self.a.inverse() * ((exp_a - DMat2::IDENTITY) * self.b);
        Some(DiscretizationCheck {
            a_error: linalg::max_abs_diff2(&self.a_discrete, &exp_a),
            b_error: (self.b_discrete - b_formula).abs().max_element(),
        })
    }
}

/// Slice A_d and B_d out of exp([[A·dt, B·dt], [0, 0]])
fn discretize(a: DMat2, b: DVec2, dt: f64) -> (DMat2, DVec2) {
    let augmented = DMat3::from_cols(
        DVec3::new(a.x_axis.x * dt, a.x_axis.y * dt, 0.0),
        DVec3::new(a.y_axis.x * dt, a.y_axis.y * dt, 0.0),
        DVec3::new(b.x * dt, b.y * dt, 0.0),
    );
    let phi = linalg::expm3(augmented);
    (linalg::upper_left(&phi), linalg::upper_right(&phi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn reference() -> PendulumSystem {
        PendulumSystem::new(PendulumParams {
            g: 9.81,
            l: 2.0,
            m: 1.0,
            dt: 0.05,
            damping: 0.1,
            max_control: 1.0,
        })
        .unwrap()
    }

    fn undamped(dt: f64) -> PendulumSystem {
        PendulumSystem::with_integrator(
            PendulumParams {
                dt,
                damping: 0.0,
                ..PendulumParams::default()
            },
            IntegratorSettings {
                rtol: 1e-13,
                atol: 1e-14,
                ..IntegratorSettings::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_continuous_matrices() {
        let p = reference();
        assert_eq!(p.a().x_axis, DVec2::new(0.0, -9.81 / 2.0));
        assert_eq!(p.a().y_axis, DVec2::new(1.0, -0.1));
        assert_eq!(p.b(), DVec2::new(0.0, 1.0));
    }

    #[test]
    fn test_rejects_non_positive_length() {
        let params = PendulumParams {
            l: 0.0,
            ..PendulumParams::default()
        };
        assert!(PendulumSystem::new(params).is_err());
    }

    #[test]
    fn test_control_bounds() {
        assert_eq!(reference().get_control_bounds(), (-1.0, 1.0));
    }

    #[test]
    fn test_verify_discretization_small_errors() {
        let check = reference().verify_discretization().unwrap();
        assert!(check.a_error < 1e-12);
        assert!(check.b_error < 1e-12);
    }

    #[test]
    fn test_verify_discretization_skips_singular() {
        let p = PendulumSystem::new(PendulumParams {
            g: 0.0,
            ..PendulumParams::default()
        })
        .unwrap();
        assert!(p.verify_discretization().is_none());
        // production path still works
        let next = p.discrete_step(DVec2::new(0.0, 1.0), 0.0, 0.5);
        assert!(next.x > 0.0);
    }

    #[test]
    fn test_set_dt_recomputes_pair() {
        let mut p = reference();
        let before = p.discrete_matrices();
        p.set_dt(0.1).unwrap();
        let after = p.discrete_matrices();
        assert_ne!(before.0, after.0);
        assert_eq!(after, p.compute_discrete_matrices_exact(0.1));
        assert!(p.set_dt(f64::NAN).is_err());
    }

    #[test]
    fn test_discrete_step_other_dt_matches_fresh_pair() {
        let p = reference();
        let state = DVec2::new(0.3, -0.2);
        let (a_d, b_d) = p.compute_discrete_matrices_exact(0.2);
        assert_eq!(p.discrete_step(state, 0.5, 0.2), a_d * state + b_d * 0.5);
    }

    #[test]
    fn test_zero_control_decays() {
        // 20 zero-control steps from (0.5, 0): amplitude and energy decay monotonically
        let p = reference();
        let states = p.simulate_discrete(DVec2::new(0.5, 0.0), &[0.0; 20], 20);
        assert_eq!(states.len(), 21);
        let w2 = 9.81 / 2.0;
        let energy = |s: &DVec2| 0.5 * s.y * s.y + 0.5 * w2 * s.x * s.x;
        for pair in states.windows(2) {
            assert!(energy(&pair[1]) <= energy(&pair[0]) + 1e-15);
        }
        assert!(energy(&states[20]) < energy(&states[0]));
        // still on the first swing: angle falls monotonically from 0.5
        for pair in states.windows(2) {
            assert!(pair[1].x < pair[0].x);
        }
    }

    #[test]
    fn test_rk45_forward_backward_symmetry() {
        let p = reference();
        let start = DVec2::new(0.8, -0.4);
        let fwd = p.rk45_step(start, 0.7, 0.2).unwrap();
        let back = p.rk45_step(fwd, 0.7, -0.2).unwrap();
        assert!((back - start).length() < 1e-8);
    }

    #[test]
    fn test_rk45_small_angle_close_to_linear() {
        let p = reference();
        let start = DVec2::new(1e-3, 0.0);
        let nonlinear = p.rk45_step(start, 0.0, 0.05).unwrap();
        let linear = p.discrete_step(start, 0.0, 0.05);
        assert!((nonlinear - linear).length() < 1e-9);
    }

    proptest! {
        #[test]
        fn prop_discrete_matches_expm(dt in 0.001f64..0.5) {
            let p = undamped(dt);
            let (a_d, _) = p.discrete_matrices();
            let direct = linalg::expm2(p.a() * dt);
            prop_assert!(linalg::max_abs_diff2(&a_d, &direct) < 1e-9);
        }

        #[test]
        fn prop_discrete_matches_linear_integration(
            dt in 0.001f64..0.3,
            theta in -1.0f64..1.0,
            omega in -1.0f64..1.0,
            u in -1.0f64..1.0,
        ) {
            let p = undamped(dt);
            let state = DVec2::new(theta, omega);
            let exact = p.discrete_step(state, u, dt);
            let integrated = p.linear_rk45_step(state, u, dt).unwrap();
            prop_assert!((exact - integrated).abs().max_element() < 1e-9);
        }

        #[test]
        fn prop_damped_is_stable(dt in 0.001f64..1.0, damping in 0.01f64..3.0) {
            let p = PendulumSystem::new(PendulumParams { dt, damping, ..PendulumParams::default() }).unwrap();
            for mag in p.discrete_eigenvalue_magnitudes() {
                prop_assert!(mag <= 1.0);
            }
        }

        #[test]
        fn prop_undamped_is_neutral(dt in 0.001f64..1.0) {
            let p = undamped(dt);
            for mag in p.discrete_eigenvalue_magnitudes() {
                prop_assert!((mag - 1.0).abs() < 1e-9);
            }
        }
    }
}
