//! Boundary to the external finite-element collaborator.
//!
//! The pipeline never touches mesh topology, basis functions or sparse
//! assembly directly: everything it needs from the discretisation is
//! expressed through [`HelmholtzBackend`].  The crate ships a 1D
//! reference implementation ([`crate::helmholtz::Helmholtz1d`]); a
//! production FE library slots in behind the same trait.

use crate::types::OrpheusError;
use num_complex::Complex64;
use sprs::CsMat;

/// Capability set the finite-element collaborator must provide.
///
/// All calls are in-process and blocking.  The factorization handle is
/// opaque to the pipeline: it is produced once per iteration by
/// `assemble_and_factor`, consumed by the forward solve and the
/// conjugate-transposed adjoint solve, and discarded when the next
/// iteration replaces it.
pub trait HelmholtzBackend {
    /// Opaque factorization of the forward operator A(p_t).
    type Factorization;

    /// Total number of degrees of freedom of the state field.
    fn num_dofs(&self) -> usize;
    /// Number of design cells (length of the raw density vector).
    fn num_design_cells(&self) -> usize;
    /// Number of nodes of the design patch (support of p_f and p_t).
    fn num_design_nodes(&self) -> usize;

    /// Assemble the forward operator from a per-design-cell relative
    /// permittivity field and factorize it.  The operator depends on the
    /// design only inside the design subdomain; absorbing-layer and bulk
    /// terms are fixed.
    fn assemble_and_factor(
        &self,
        design_permittivity: &[f64],
    ) -> Result<Self::Factorization, OrpheusError>;

    /// Solve A x = rhs with the given factorization.
    fn solve(
        &self,
        factorization: &Self::Factorization,
        rhs: &[Complex64],
    ) -> Result<Vec<Complex64>, OrpheusError>;

    /// Solve A† w = rhs (conjugate transpose) with the *same*
    /// factorization — one extra triangular solve pair, no re-assembly.
    fn solve_adjoint(
        &self,
        factorization: &Self::Factorization,
        rhs: &[Complex64],
    ) -> Result<Vec<Complex64>, OrpheusError>;

    /// The fixed source functional b of A u = b.
    fn source_vector(&self) -> Vec<Complex64>;

    /// The fixed objective operator O (target-region mass matrix),
    /// assembled once, independent of the design.
    fn objective_matrix(&self) -> CsMat<f64>;

    /// Filter operator M_L + r²K on the design patch, zero-Neumann.
    /// Must be symmetric positive definite for radius > 0.
    fn filter_matrix(&self, radius: f64) -> CsMat<f64>;

    /// Right-hand side of the filter equation: the per-cell density
    /// integrated against the nodal test functions (B p).
    fn filter_rhs(&self, cell_density: &[f64]) -> Vec<f64>;

    /// Transpose of `filter_rhs`: project a nodal dual field back onto
    /// the design-cell basis (Bᵀ z).
    fn project_to_cells(&self, nodal: &[f64]) -> Vec<f64>;

    /// Quadrature pairing Re[w† (∂A/∂ε_k) u] for each design cell k —
    /// the closed-form derivative of the assembled operator with respect
    /// to the cell permittivity, contracted against the state and
    /// adjoint fields.
    fn permittivity_sensitivity(&self, w: &[Complex64], u: &[Complex64]) -> Vec<f64>;
}
