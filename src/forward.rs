//! Forward solver adapter: projected density → coefficient field →
//! assembled-and-factored Helmholtz solve.
//!
//! The adapter owns exactly three things: the material interpolation
//! law, the sampling of the nodal projected density at cell midpoints,
//! and the call into the collaborator's assemble/factor/solve.  The
//! factorization lands in the [`PipelineCache`] so the adjoint solve of
//! the same iteration reuses it.

use crate::backend::HelmholtzBackend;
use crate::types::{OrpheusError, PipelineCache};

// ─────────────────────────────────────────────────────────────
//  Material interpolation
// ─────────────────────────────────────────────────────────────

/// Linear interpolation of the *refractive index*, squared to obtain
/// the permittivity.  Interpolating n (not ε) keeps the PDE coefficient
/// bounded away from zero for any density in [0,1].
#[derive(Debug, Clone)]
pub struct MaterialModel {
    background_index: f64,
    material_index: f64,
}

impl MaterialModel {
    pub fn new(background_index: f64, material_index: f64) -> Result<Self, OrpheusError> {
        for (name, n) in [
            ("background index", background_index),
            ("material index", material_index),
        ] {
            if !n.is_finite() || n < 1.0 {
                return Err(OrpheusError::Shape(format!("{name} {n} must be finite and >= 1")));
            }
        }
        Ok(Self { background_index, material_index })
    }

    /// ε(p_t) = (n_bg + p_t (n_mat − n_bg))²
    pub fn permittivity(&self, projected: f64) -> f64 {
        let n = self.background_index + projected * (self.material_index - self.background_index);
        n * n
    }

    /// dε/dp_t = 2 n(p_t) (n_mat − n_bg)
    pub fn permittivity_derivative(&self, projected: f64) -> f64 {
        let dn = self.material_index - self.background_index;
        let n = self.background_index + projected * dn;
        2.0 * n * dn
    }
}

// ─────────────────────────────────────────────────────────────
//  Adapter
// ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ForwardSolver {
    material: MaterialModel,
}

impl ForwardSolver {
    pub fn new(material: MaterialModel) -> Self {
        Self { material }
    }

    pub fn material(&self) -> &MaterialModel {
        &self.material
    }

    /// Per-cell coefficient field from the nodal projected density:
    /// midpoint sampling p̄_k = (p_t[k] + p_t[k+1]) / 2, then the
    /// interpolation law.
    pub fn design_permittivity(&self, projected: &[f64], out: &mut [f64]) {
        debug_assert_eq!(projected.len(), out.len() + 1);
        for k in 0..out.len() {
            let midpoint = 0.5 * (projected[k] + projected[k + 1]);
            out[k] = self.material.permittivity(midpoint);
        }
    }

    /// Transpose of `design_permittivity`: chain dg/dε (per cell) back
    /// to dg/dp_t (nodal).  Each cell's derivative splits half-and-half
    /// onto its two end nodes.
    pub fn chain_to_projected(&self, projected: &[f64], grad_eps: &[f64], out: &mut [f64]) {
        debug_assert_eq!(projected.len(), out.len());
        debug_assert_eq!(grad_eps.len() + 1, out.len());
        out.fill(0.0);
        for (k, &ge) in grad_eps.iter().enumerate() {
            let midpoint = 0.5 * (projected[k] + projected[k + 1]);
            let half = 0.5 * ge * self.material.permittivity_derivative(midpoint);
            out[k] += half;
            out[k + 1] += half;
        }
    }

    /// Assemble and solve A(p_t) u = b.  Fills `cache.permittivity`,
    /// `cache.factorization` (kept for the adjoint solve of this
    /// iteration) and `cache.field`.
    pub fn solve<B: HelmholtzBackend>(
        &self,
        backend: &B,
        cache: &mut PipelineCache<B::Factorization>,
        projected: &[f64],
    ) -> Result<(), OrpheusError> {
        if projected.len() != backend.num_design_nodes() {
            return Err(OrpheusError::Shape(format!(
                "projected density has {} nodes, expected {}",
                projected.len(),
                backend.num_design_nodes(),
            )));
        }
        self.design_permittivity(projected, &mut cache.permittivity);
        let factorization = backend.assemble_and_factor(&cache.permittivity)?;
        cache.field = backend.solve(&factorization, &backend.source_vector())?;
        cache.factorization = Some(factorization);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────
