//! Small dense linear algebra on glam matrices
//!
//! Matrix exponential by scaling and squaring of a truncated Taylor series.
//! After scaling the 1-norm is at most 1/2, so 20 terms are far below f64
//! round-off.

use glam::{DMat2, DMat3, DVec2, DVec3};

const EXPM_TARGET_NORM: f64 = 0.5;
const EXPM_TAYLOR_TERMS: u32 = 20;

/// Maximum absolute column sum
pub fn norm1(m: &DMat3) -> f64 {
    m.x_axis
        .abs()
        .element_sum()
        .max(m.y_axis.abs().element_sum())
        .max(m.z_axis.abs().element_sum())
}

/// Matrix exponential of a 3x3 matrix
pub fn expm3(m: DMat3) -> DMat3 {
    let norm = norm1(&m);
    let squarings = if norm > EXPM_TARGET_NORM {
        (norm / EXPM_TARGET_NORM).log2().ceil() as i32
    } else {
        0
    };
    let scaled = m * 0.5f64.powi(squarings);

    let mut result = DMat3::IDENTITY;
    let mut term = DMat3::IDENTITY;
    for k in 1..=EXPM_TAYLOR_TERMS {
        term = term * scaled * (1.0 / k as f64);
        result += term;
        if norm1(&term) < f64::EPSILON * norm1(&result) {
            break;
        }
    }

    for _ in 0..squarings {
        result = result * result;
    }
    result
}

/// Matrix exponential of a 2x2 matrix (embedded in the upper-left block)
pub fn expm2(m: DMat2) -> DMat2 {
    let embedded = DMat3::from_cols(
        DVec3::new(m.x_axis.x, m.x_axis.y, 0.0),
        DVec3::new(m.y_axis.x, m.y_axis.y, 0.0),
        DVec3::ZERO,
    );
    upper_left(&expm3(embedded))
}

/// Upper-left 2x2 block
pub fn upper_left(m: &DMat3) -> DMat2 {
    DMat2::from_cols(m.x_axis.truncate(), m.y_axis.truncate())
}

/// Upper two entries of the third column
pub fn upper_right(m: &DMat3) -> DVec2 {
    m.z_axis.truncate()
}

/// Max absolute entry difference
pub fn max_abs_diff2(a: &DMat2, b: &DMat2) -> f64 {
    (a.x_axis - b.x_axis)
        .abs()
        .max_element()
        .max((a.y_axis - b.y_axis).abs().max_element())
}

/// Magnitudes of the two eigenvalues of a real 2x2 matrix, larger first
pub fn eigenvalue_magnitudes(m: &DMat2) -> [f64; 2] {
    let trace = m.x_axis.x + m.y_axis.y;
    let det = m.determinant();
    let half = 0.5 * trace;
    let disc = half * half - det;
    if disc < 0.0 {
        // complex pair, |λ|² = det
        let r = det.sqrt();
        [r, r]
    } else {
        let root = disc.sqrt();
        let a = (half + root).abs();
        let b = (half - root).abs();
        [a.max(b), a.min(b)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expm_zero_is_identity() {
        assert_eq!(expm3(DMat3::ZERO), DMat3::IDENTITY);
    }

    #[test]
    fn test_expm_diagonal() {
        let m = DMat3::from_diagonal(DVec3::new(1.0, -2.0, 3.0));
        let e = expm3(m);
        assert!((e.x_axis.x - 1f64.exp()).abs() < 1e-12);
        assert!((e.y_axis.y - (-2f64).exp()).abs() < 1e-12);
        assert!((e.z_axis.z - 3f64.exp()).abs() < 1e-11 * 3f64.exp());
        assert!(e.x_axis.y.abs() < 1e-15);
    }

    #[test]
    fn test_expm2_rotation() {
        // exp([[0, w], [-w, 0]] t) is a rotation by w t
        let w = 1.7;
        let t = 2.3;
        let m = DMat2::from_cols(DVec2::new(0.0, -w * t), DVec2::new(w * t, 0.0));
        let e = expm2(m);
        let (s, c) = (w * t).sin_cos();
        let expected = DMat2::from_cols(DVec2::new(c, -s), DVec2::new(s, c));
        assert!(max_abs_diff2(&e, &expected) < 1e-12);
    }

    #[test]
    fn test_expm_nilpotent() {
        // [[0,1],[0,0]] -> [[1,1],[0,1]]
        let m = DMat2::from_cols(DVec2::ZERO, DVec2::new(1.0, 0.0));
        let e = expm2(m);
        let expected = DMat2::from_cols(DVec2::new(1.0, 0.0), DVec2::new(1.0, 1.0));
        assert!(max_abs_diff2(&e, &expected) < 1e-14);
    }

    #[test]
    fn test_eigenvalue_magnitudes_real_and_complex() {
        let diag = DMat2::from_diagonal(DVec2::new(0.5, -2.0));
        assert_eq!(eigenvalue_magnitudes(&diag), [2.0, 0.5]);

        let rot = DMat2::from_cols(DVec2::new(0.6, 0.8), DVec2::new(-0.8, 0.6));
        let mags = eigenvalue_magnitudes(&rot);
        assert!((mags[0] - 1.0).abs() < 1e-12);
        assert!((mags[1] - 1.0).abs() < 1e-12);
    }
}
