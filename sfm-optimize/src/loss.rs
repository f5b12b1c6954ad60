#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// A robust loss `ρ(s)` applied to the squared norm `s` of a residual block.
///
/// The total cost of a problem is `½ Σ ρ(sᵢ)`. Robust losses grow slower than `s` for large
/// residuals so that outliers do not dominate the solution.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum LossFunction {
    /// `ρ(s) = s`
    Trivial,
    /// `ρ(s) = 2a²(sqrt(1 + s/a²) - 1)`
    SoftL1 { scale: f64 },
    /// `ρ(s) = a² ln(1 + s/a²)`
    Cauchy { scale: f64 },
}

impl Default for LossFunction {
    fn default() -> Self {
        Self::Trivial
    }
}

impl LossFunction {
    pub fn rho(self, s: f64) -> f64 {
        match self {
            Self::Trivial => s,
            Self::SoftL1 { scale } => {
                let a2 = scale * scale;
                2.0 * a2 * ((1.0 + s / a2).sqrt() - 1.0)
            }
            Self::Cauchy { scale } => {
                let a2 = scale * scale;
                a2 * (s / a2).ln_1p()
            }
        }
    }

    /// Factor that turns a residual block into one whose squared norm is `ρ(s)`.
    ///
    /// Every robust loss here has `ρ'(0) = 1`, so tiny residuals are left untouched.
    pub fn residual_scale(self, s: f64) -> f64 {
        if matches!(self, Self::Trivial) || s < 1e-24 {
            return 1.0;
        }
        (self.rho(s) / s).sqrt()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn robust_losses_are_bounded_by_trivial() {
        for &s in &[1e-6, 0.5, 4.0, 100.0] {
            assert!(LossFunction::SoftL1 { scale: 1.0 }.rho(s) <= s);
            assert!(LossFunction::Cauchy { scale: 1.0 }.rho(s) <= s);
        }
    }

    #[test]
    fn residual_scale_reproduces_rho() {
        let loss = LossFunction::Cauchy { scale: 2.0 };
        let s = 9.0;
        let scale = loss.residual_scale(s);
        assert!((scale * scale * s - loss.rho(s)).abs() < 1e-12);
        assert_eq!(loss.residual_scale(0.0), 1.0);
    }
}
