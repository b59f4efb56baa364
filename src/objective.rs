//! Field-intensity objective g = Re(u† O u).
//!
//! O is a fixed bilinear operator (target-region mass matrix) assembled
//! once at construction and independent of the design; it doubles as
//! the adjoint right-hand side generator (O u).

use crate::backend::HelmholtzBackend;
use crate::types::OrpheusError;
use num_complex::Complex64;
use sprs::CsMat;

#[derive(Debug)]
pub struct ObjectiveEvaluator {
    operator: CsMat<f64>,
}

impl ObjectiveEvaluator {
    pub fn new<B: HelmholtzBackend>(backend: &B) -> Self {
        Self {
            operator: backend.objective_matrix(),
        }
    }

    /// The assembled operator O.
    pub fn operator(&self) -> &CsMat<f64> {
        &self.operator
    }

    /// g = Re(u† O u).  For the target-region mass matrix this is the
    /// field intensity ∫_target |u|² dx, real and nonnegative.
    pub fn evaluate(&self, field: &[Complex64]) -> Result<f64, OrpheusError> {
        self.check_len(field)?;
        let mut g = Complex64::new(0.0, 0.0);
        for (&val, (row, col)) in self.operator.iter() {
            g += field[row].conj() * val * field[col];
        }
        Ok(g.re)
    }

    /// Right-hand side of the adjoint system: O u.
    pub fn adjoint_rhs(&self, field: &[Complex64]) -> Result<Vec<Complex64>, OrpheusError> {
        self.check_len(field)?;
        let mut rhs = vec![Complex64::new(0.0, 0.0); field.len()];
        for (&val, (row, col)) in self.operator.iter() {
            rhs[row] += val * field[col];
        }
        Ok(rhs)
    }

    fn check_len(&self, field: &[Complex64]) -> Result<(), OrpheusError> {
        if field.len() != self.operator.rows() {
            return Err(OrpheusError::Shape(format!(
                "field has {} dofs, objective operator has {}",
                field.len(),
                self.operator.rows(),
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────
