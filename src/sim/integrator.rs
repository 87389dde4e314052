//! Adaptive Runge-Kutta 4(5) integration over a signed horizon
//!
//! Dormand-Prince pair with FSAL and an RMS error norm. The fields here are
//! autonomous, so the stage times (c coefficients) never appear. The horizon may be
//! negative: the integrator marches toward it with negative steps and never
//! looks at what the sign means physically.

use glam::DVec2;

use crate::error::IntegrationError;
use crate::settings::IntegratorSettings;

const A21: f64 = 1.0 / 5.0;
const A31: f64 = 3.0 / 40.0;
const A32: f64 = 9.0 / 40.0;
const A41: f64 = 44.0 / 45.0;
const A42: f64 = -56.0 / 15.0;
const A43: f64 = 32.0 / 9.0;
const A51: f64 = 19372.0 / 6561.0;
const A52: f64 = -25360.0 / 2187.0;
const A53: f64 = 64448.0 / 6561.0;
const A54: f64 = -212.0 / 729.0;
const A61: f64 = 9017.0 / 3168.0;
const A62: f64 = -355.0 / 33.0;
const A63: f64 = 46732.0 / 5247.0;
const A64: f64 = 49.0 / 176.0;
const A65: f64 = -5103.0 / 18656.0;
const A71: f64 = 35.0 / 384.0;
const A73: f64 = 500.0 / 1113.0;
const A74: f64 = 125.0 / 192.0;
const A75: f64 = -2187.0 / 6784.0;
const A76: f64 = 11.0 / 84.0;

// 5th minus embedded 4th order weights
const E1: f64 = 71.0 / 57600.0;
const E3: f64 = -71.0 / 16695.0;
const E4: f64 = 71.0 / 1920.0;
const E5: f64 = -17253.0 / 339200.0;
const E6: f64 = 22.0 / 525.0;
const E7: f64 = -1.0 / 40.0;

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 5.0;

/// Integrate the autonomous field `f` from `y0` over `[0, horizon]`
pub fn integrate<F>(
    f: F,
    y0: DVec2,
    horizon: f64,
    settings: &IntegratorSettings,
) -> Result<DVec2, IntegrationError>
where
    F: Fn(DVec2) -> DVec2,
{
    if !horizon.is_finite() || !y0.is_finite() {
        return Err(IntegrationError::NonFinite { t: 0.0 });
    }
    if horizon == 0.0 {
        return Ok(y0);
    }

    let direction = horizon.signum();
    let span = horizon.abs();
    let mut t = 0.0f64; // elapsed magnitude
    let mut y = y0;
    let mut k1 = f(y);
    let mut h = initial_step(&f, y, k1, direction, span, settings);

    for _ in 0..settings.max_steps {
        let remaining = span - t;
        if remaining <= span * f64::EPSILON {
            return Ok(y);
        }
        h = h.min(remaining);
        if h < settings.min_step && h < remaining {
            return Err(IntegrationError::StepSizeUnderflow {
                t: direction * t,
                step: h,
            });
        }

        let s = direction * h;
        let k2 = f(y + s * (A21 * k1));
        let k3 = f(y + s * (A31 * k1 + A32 * k2));
        let k4 = f(y + s * (A41 * k1 + A42 * k2 + A43 * k3));
        let k5 = f(y + s * (A51 * k1 + A52 * k2 + A53 * k3 + A54 * k4));
        let k6 = f(y + s * (A61 * k1 + A62 * k2 + A63 * k3 + A64 * k4 + A65 * k5));
        let y_new = y + s * (A71 * k1 + A73 * k3 + A74 * k4 + A75 * k5 + A76 * k6);
        let k7 = f(y_new);

        if !y_new.is_finite() {
            return Err(IntegrationError::NonFinite { t: direction * t });
        }

        let err_vec = s * (E1 * k1 + E3 * k3 + E4 * k4 + E5 * k5 + E6 * k6 + E7 * k7);
        let scale = DVec2::splat(settings.atol) + settings.rtol * y.abs().max(y_new.abs());
        let ratio = err_vec / scale;
        let err = (0.5 * ratio.length_squared()).sqrt();

        if err <= 1.0 {
            t += h;
            y = y_new;
            k1 = k7;
            let factor = if err == 0.0 {
                MAX_FACTOR
            } else {
                (SAFETY * err.powf(-0.2)).clamp(MIN_FACTOR, MAX_FACTOR)
            };
            h *= factor;
        } else {
            h *= (SAFETY * err.powf(-0.2)).max(MIN_FACTOR);
        }
    }

    if span - t <= span * f64::EPSILON {
        Ok(y)
    } else {
        Err(IntegrationError::StepLimit {
            t: direction * t,
            steps: settings.max_steps,
        })
    }
}

/// Initial step heuristic (Hairer, Nørsett & Wanner, II.4)
fn initial_step<F>(
    f: &F,
    y0: DVec2,
    f0: DVec2,
    direction: f64,
    span: f64,
    settings: &IntegratorSettings,
) -> f64
where
    F: Fn(DVec2) -> DVec2,
{
    let scale = DVec2::splat(settings.atol) + settings.rtol * y0.abs();
    let d0 = rms(y0 / scale);
    let d1 = rms(f0 / scale);
    let h0 = if d0 < 1e-5 || d1 < 1e-5 {
        1e-6
    } else {
        0.01 * d0 / d1
    };
    let h0 = h0.min(span);

    let y1 = y0 + (direction * h0) * f0;
    let f1 = f(y1);
    let d2 = rms((f1 - f0) / scale) / h0;
    let h1 = if d1.max(d2) <= 1e-15 {
        (h0 * 1e-3).max(1e-6)
    } else {
        (0.01 / d1.max(d2)).powf(0.2)
    };
    (100.0 * h0).min(h1).min(span).max(settings.min_step)
}

fn rms(v: DVec2) -> f64 {
    (0.5 * v.length_squared()).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tight() -> IntegratorSettings {
        IntegratorSettings::default()
    }

    #[test]
    fn test_zero_horizon_is_identity() {
        let y0 = DVec2::new(0.3, -1.2);
        let y = integrate(|y| DVec2::new(y.y, -y.x), y0, 0.0, &tight()).unwrap();
        assert_eq!(y, y0);
    }

    #[test]
    fn test_harmonic_oscillator_forward() {
        // x'' = -x, x(0) = 1, v(0) = 0 -> x = cos t, v = -sin t
        let t = 1.3;
        let y = integrate(|y| DVec2::new(y.y, -y.x), DVec2::new(1.0, 0.0), t, &tight()).unwrap();
        assert!((y.x - t.cos()).abs() < 1e-8);
        assert!((y.y + t.sin()).abs() < 1e-8);
    }

    #[test]
    fn test_negative_horizon_runs_backward() {
        let t = -0.7;
        let y = integrate(|y| DVec2::new(y.y, -y.x), DVec2::new(1.0, 0.0), t, &tight()).unwrap();
        assert!((y.x - t.cos()).abs() < 1e-8);
        assert!((y.y + t.sin()).abs() < 1e-8);
    }

    #[test]
    fn test_forward_then_backward_returns() {
        let field = |y: DVec2| DVec2::new(y.y, -4.9 * y.x.sin() - 0.1 * y.y + 0.5);
        let y0 = DVec2::new(0.4, 0.2);
        let there = integrate(field, y0, 0.35, &tight()).unwrap();
        let back = integrate(field, there, -0.35, &tight()).unwrap();
        assert!((back - y0).length() < 1e-8);
    }

    #[test]
    fn test_exponential_growth() {
        let y = integrate(|y| y, DVec2::new(1.0, 2.0), 1.0, &tight()).unwrap();
        let e = 1f64.exp();
        assert!((y.x - e).abs() < 1e-8 * e);
        assert!((y.y - 2.0 * e).abs() < 2e-8 * e);
    }

    #[test]
    fn test_non_finite_horizon_rejected() {
        let res = integrate(|y| y, DVec2::ONE, f64::NAN, &tight());
        assert!(matches!(res, Err(IntegrationError::NonFinite { .. })));
    }

    #[test]
    fn test_blow_up_reports_error() {
        // y' = y² blows up at t = 1 for y(0) = 1
        let settings = IntegratorSettings {
            max_steps: 2_000,
            ..tight()
        };
        let res = integrate(|y| DVec2::new(y.x * y.x, 0.0), DVec2::new(1.0, 0.0), 2.0, &settings);
        assert!(res.is_err());
    }
}
