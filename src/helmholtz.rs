//! Reference 1D finite-element collaborator.
//!
//! Piecewise-linear elements on a uniform interval mesh, perfectly
//! matched layers (quadratic stretching ramp) at both ends, outer nodes
//! pinned to zero behind the PML.  Assembly produces a complex
//! *symmetric* operator A = K_γ − k₀² M_{γ,ε}; the factorization is a
//! dense complex LU with partial pivoting that also exposes the
//! transposed solve needed by the adjoint.
//!
//! This backend exists so the pipeline is runnable and testable without
//! an external FE library; anything implementing
//! [`HelmholtzBackend`](crate::backend::HelmholtzBackend) can replace it.

use crate::backend::HelmholtzBackend;
use crate::forward::MaterialModel;
use crate::types::OrpheusError;
use ndarray::Array2;
use num_complex::Complex64;
use sprs::{CsMat, TriMat};

// ─────────────────────────────────────────────────────────────
//  Configuration
// ─────────────────────────────────────────────────────────────

/// Physical constants of one optimisation run.  Immutable after
/// construction; passed into each component rather than living in
/// module-level globals.
#[derive(Debug, Clone)]
pub struct PhysicsConfig {
    /// Vacuum wavelength (sets k₀ = 2π/λ).
    pub wavelength: f64,
    /// Refractive index of the background medium.
    pub background_index: f64,
    /// Refractive index of the deposited material (p_t = 1).
    pub material_index: f64,
    /// Peak PML absorption σ_max.
    pub pml_strength: f64,
}

impl PhysicsConfig {
    pub fn wavenumber(&self) -> f64 {
        2.0 * std::f64::consts::PI / self.wavelength
    }

    /// Material interpolation law induced by this configuration.
    pub fn material_model(&self) -> Result<MaterialModel, OrpheusError> {
        MaterialModel::new(self.background_index, self.material_index)
    }

    fn validate(&self) -> Result<(), OrpheusError> {
        if !self.wavelength.is_finite() || self.wavelength <= 0.0 {
            return Err(OrpheusError::Shape(format!(
                "wavelength {} must be finite and > 0",
                self.wavelength,
            )));
        }
        for (name, n) in [
            ("background index", self.background_index),
            ("material index", self.material_index),
        ] {
            if !n.is_finite() || n < 1.0 {
                return Err(OrpheusError::Shape(format!("{name} {n} must be finite and >= 1")));
            }
        }
        if !self.pml_strength.is_finite() || self.pml_strength < 0.0 {
            return Err(OrpheusError::Shape(format!(
                "PML strength {} must be finite and >= 0",
                self.pml_strength,
            )));
        }
        Ok(())
    }
}

/// Mesh layout: overall interval, PML depth, and the design / source /
/// target placement, all in element (cell) indices.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    /// Interval length.
    pub length: f64,
    /// Number of elements (uniform).
    pub elements: usize,
    /// PML depth in elements at each end.
    pub pml_elements: usize,
    /// First design cell.
    pub design_start: usize,
    /// Number of design cells.
    pub design_cells: usize,
    /// Node index carrying the unit source load.
    pub source_node: usize,
    /// First cell of the objective target region.
    pub target_start: usize,
    /// Number of target cells.
    pub target_cells: usize,
}

impl DomainConfig {
    fn validate(&self) -> Result<(), OrpheusError> {
        if !self.length.is_finite() || self.length <= 0.0 {
            return Err(OrpheusError::Shape(format!(
                "domain length {} must be finite and > 0",
                self.length,
            )));
        }
        if self.elements < 2 || 2 * self.pml_elements >= self.elements {
            return Err(OrpheusError::Shape(format!(
                "{} elements cannot hold two PMLs of {} elements",
                self.elements, self.pml_elements,
            )));
        }
        let interior = self.pml_elements..(self.elements - self.pml_elements);
        for (name, start, cells) in [
            ("design", self.design_start, self.design_cells),
            ("target", self.target_start, self.target_cells),
        ] {
            if cells == 0 {
                return Err(OrpheusError::Shape(format!("{name} region is empty")));
            }
            if !interior.contains(&start) || start + cells > interior.end {
                return Err(OrpheusError::Shape(format!(
                    "{name} cells {start}..{} must lie outside the PML",
                    start + cells,
                )));
            }
        }
        if !(interior.start < self.source_node && self.source_node <= interior.end) {
            return Err(OrpheusError::Shape(format!(
                "source node {} must lie outside the PML",
                self.source_node,
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  PML coordinate stretching
// ─────────────────────────────────────────────────────────────

/// Complex stretch γ(x) = 1 + i σ(x)/k₀ with a quadratic σ ramp inside
/// the two absorbing layers.  Pure function of the configuration and
/// the evaluation point.
fn pml_stretch(physics: &PhysicsConfig, domain: &DomainConfig, h: f64, x: f64) -> Complex64 {
    let pml_len = domain.pml_elements as f64 * h;
    if pml_len == 0.0 {
        return Complex64::new(1.0, 0.0);
    }
    let depth_left = pml_len - x;
    let depth_right = x - (domain.length - pml_len);
    let depth = depth_left.max(depth_right);
    if depth <= 0.0 {
        return Complex64::new(1.0, 0.0);
    }
    let ramp = depth / pml_len;
    let sigma = physics.pml_strength * ramp * ramp;
    Complex64::new(1.0, sigma / physics.wavenumber())
}

// ─────────────────────────────────────────────────────────────
//  Dense complex LU (the opaque factorization)
// ─────────────────────────────────────────────────────────────

/// LU factorization with partial pivoting, PA = LU stored in place.
///
/// Exposes both the forward solve and the transposed solve so the
/// adjoint reuses the factorization instead of re-assembling.
#[derive(Debug)]
pub struct DenseLu {
    lu: Array2<Complex64>,
    perm: Vec<usize>,
}

impl DenseLu {
    pub fn factor(mut a: Array2<Complex64>, system: &'static str) -> Result<Self, OrpheusError> {
        let n = a.nrows();
        let mut perm: Vec<usize> = (0..n).collect();

        for col in 0..n {
            // Pivot search by modulus
            let mut pivot_row = col;
            let mut pivot_mag = a[[col, col]].norm();
            for row in (col + 1)..n {
                let mag = a[[row, col]].norm();
                if mag > pivot_mag {
                    pivot_mag = mag;
                    pivot_row = row;
                }
            }
            if pivot_mag < 1e-30 {
                return Err(OrpheusError::Singular { system, index: col });
            }
            if pivot_row != col {
                for j in 0..n {
                    let tmp = a[[col, j]];
                    a[[col, j]] = a[[pivot_row, j]];
                    a[[pivot_row, j]] = tmp;
                }
                perm.swap(col, pivot_row);
            }

            let pivot = a[[col, col]];
            for row in (col + 1)..n {
                let factor = a[[row, col]] / pivot;
                a[[row, col]] = factor;
                for j in (col + 1)..n {
                    let upper = a[[col, j]];
                    a[[row, j]] -= factor * upper;
                }
            }
        }

        Ok(Self { lu: a, perm })
    }

    pub fn dim(&self) -> usize {
        self.lu.nrows()
    }

    /// Solve A x = b.
    pub fn solve(&self, b: &[Complex64]) -> Vec<Complex64> {
        let n = self.dim();
        // Apply P, then L (unit lower), then U.
        let mut x: Vec<Complex64> = (0..n).map(|i| b[self.perm[i]]).collect();
        for i in 0..n {
            for j in 0..i {
                let lij = self.lu[[i, j]];
                let xj = x[j];
                x[i] -= lij * xj;
            }
        }
        for i in (0..n).rev() {
            for j in (i + 1)..n {
                let uij = self.lu[[i, j]];
                let xj = x[j];
                x[i] -= uij * xj;
            }
            x[i] /= self.lu[[i, i]];
        }
        x
    }

    /// Solve Aᵀ x = b.  With PA = LU this is Uᵀ Lᵀ P x = b: forward
    /// substitution through Uᵀ, back substitution through Lᵀ, then the
    /// inverse row permutation.
    pub fn solve_transpose(&self, b: &[Complex64]) -> Vec<Complex64> {
        let n = self.dim();
        let mut y = b.to_vec();
        for i in 0..n {
            for j in 0..i {
                let uji = self.lu[[j, i]];
                let yj = y[j];
                y[i] -= uji * yj;
            }
            y[i] /= self.lu[[i, i]];
        }
        for i in (0..n).rev() {
            for j in (i + 1)..n {
                let lji = self.lu[[j, i]];
                let yj = y[j];
                y[i] -= lji * yj;
            }
        }
        let mut x = vec![Complex64::new(0.0, 0.0); n];
        for i in 0..n {
            x[self.perm[i]] = y[i];
        }
        x
    }
}

// ─────────────────────────────────────────────────────────────
//  The backend
// ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Helmholtz1d {
    physics: PhysicsConfig,
    domain: DomainConfig,
    h: f64,
}

impl Helmholtz1d {
    pub fn new(physics: PhysicsConfig, domain: DomainConfig) -> Result<Self, OrpheusError> {
        physics.validate()?;
        domain.validate()?;
        let h = domain.length / domain.elements as f64;
        Ok(Self { physics, domain, h })
    }

    pub fn physics(&self) -> &PhysicsConfig {
        &self.physics
    }

    pub fn domain(&self) -> &DomainConfig {
        &self.domain
    }

    pub fn grid_spacing(&self) -> f64 {
        self.h
    }

    pub fn node_position(&self, node: usize) -> f64 {
        node as f64 * self.h
    }

    /// Assemble A(ε) = K_γ − k₀² M_{γ,ε} dense, with the outer nodes
    /// pinned (row/col zeroed symmetrically, unit diagonal).
    fn assemble(&self, design_permittivity: &[f64]) -> Array2<Complex64> {
        let ne = self.domain.elements;
        let nn = ne + 1;
        let k0 = self.physics.wavenumber();
        let eps_bg = self.physics.background_index * self.physics.background_index;
        let d0 = self.domain.design_start;
        let d1 = d0 + self.domain.design_cells;

        let mut a = Array2::<Complex64>::zeros((nn, nn));
        for e in 0..ne {
            let xm = (e as f64 + 0.5) * self.h;
            let gamma = pml_stretch(&self.physics, &self.domain, self.h, xm);
            let eps = if (d0..d1).contains(&e) {
                design_permittivity[e - d0]
            } else {
                eps_bg
            };
            let k_loc = Complex64::new(1.0, 0.0) / (gamma * self.h);
            let m_loc = gamma * eps * k0 * k0 * self.h / 6.0;

            a[[e, e]] += k_loc - 2.0 * m_loc;
            a[[e + 1, e + 1]] += k_loc - 2.0 * m_loc;
            a[[e, e + 1]] += -k_loc - m_loc;
            a[[e + 1, e]] += -k_loc - m_loc;
        }

        for b in [0, ne] {
            for j in 0..nn {
                a[[b, j]] = Complex64::new(0.0, 0.0);
                a[[j, b]] = Complex64::new(0.0, 0.0);
            }
            a[[b, b]] = Complex64::new(1.0, 0.0);
        }
        a
    }

    fn check_finite(
        x: Vec<Complex64>,
        system: &'static str,
    ) -> Result<Vec<Complex64>, OrpheusError> {
        for (i, v) in x.iter().enumerate() {
            if !v.re.is_finite() || !v.im.is_finite() {
                return Err(OrpheusError::SolveFailed {
                    system,
                    detail: format!("non-finite entry at dof {i}"),
                });
            }
        }
        Ok(x)
    }
}

impl HelmholtzBackend for Helmholtz1d {
    type Factorization = DenseLu;

    fn num_dofs(&self) -> usize {
        self.domain.elements + 1
    }

    fn num_design_cells(&self) -> usize {
        self.domain.design_cells
    }

    fn num_design_nodes(&self) -> usize {
        self.domain.design_cells + 1
    }

    fn assemble_and_factor(
        &self,
        design_permittivity: &[f64],
    ) -> Result<DenseLu, OrpheusError> {
        if design_permittivity.len() != self.domain.design_cells {
            return Err(OrpheusError::Shape(format!(
                "permittivity field has {} cells, expected {}",
                design_permittivity.len(),
                self.domain.design_cells,
            )));
        }
        DenseLu::factor(self.assemble(design_permittivity), "helmholtz")
    }

    fn solve(&self, factorization: &DenseLu, rhs: &[Complex64]) -> Result<Vec<Complex64>, OrpheusError> {
        if rhs.len() != factorization.dim() {
            return Err(OrpheusError::Shape(format!(
                "rhs has {} entries, operator has {}",
                rhs.len(),
                factorization.dim(),
            )));
        }
        Self::check_finite(factorization.solve(rhs), "helmholtz")
    }

    fn solve_adjoint(
        &self,
        factorization: &DenseLu,
        rhs: &[Complex64],
    ) -> Result<Vec<Complex64>, OrpheusError> {
        if rhs.len() != factorization.dim() {
            return Err(OrpheusError::Shape(format!(
                "rhs has {} entries, operator has {}",
                rhs.len(),
                factorization.dim(),
            )));
        }
        // A† w = rhs  ⟺  Aᵀ conj(w) = conj(rhs)
        let conj_rhs: Vec<Complex64> = rhs.iter().map(|v| v.conj()).collect();
        let w: Vec<Complex64> = factorization
            .solve_transpose(&conj_rhs)
            .into_iter()
            .map(|v| v.conj())
            .collect();
        Self::check_finite(w, "adjoint helmholtz")
    }

    fn source_vector(&self) -> Vec<Complex64> {
        let mut b = vec![Complex64::new(0.0, 0.0); self.num_dofs()];
        b[self.domain.source_node] = Complex64::new(1.0, 0.0);
        b
    }

    fn objective_matrix(&self) -> CsMat<f64> {
        let nn = self.num_dofs();
        let t0 = self.domain.target_start;
        let t1 = t0 + self.domain.target_cells;
        let c = self.h / 6.0;
        let mut tri = TriMat::new((nn, nn));
        for e in t0..t1 {
            tri.add_triplet(e, e, 2.0 * c);
            tri.add_triplet(e + 1, e + 1, 2.0 * c);
            tri.add_triplet(e, e + 1, c);
            tri.add_triplet(e + 1, e, c);
        }
        tri.to_csc()
    }

    fn filter_matrix(&self, radius: f64) -> CsMat<f64> {
        let nn = self.num_design_nodes();
        let stiff = radius * radius / self.h;
        let lump = self.h / 2.0;
        let mut tri = TriMat::new((nn, nn));
        for k in 0..self.domain.design_cells {
            tri.add_triplet(k, k, stiff + lump);
            tri.add_triplet(k + 1, k + 1, stiff + lump);
            tri.add_triplet(k, k + 1, -stiff);
            tri.add_triplet(k + 1, k, -stiff);
        }
        tri.to_csc()
    }

    fn filter_rhs(&self, cell_density: &[f64]) -> Vec<f64> {
        assert_eq!(cell_density.len(), self.domain.design_cells);
        let mut rhs = vec![0.0; self.num_design_nodes()];
        let half = self.h / 2.0;
        for (k, &p) in cell_density.iter().enumerate() {
            rhs[k] += half * p;
            rhs[k + 1] += half * p;
        }
        rhs
    }

    fn project_to_cells(&self, nodal: &[f64]) -> Vec<f64> {
        assert_eq!(nodal.len(), self.num_design_nodes());
        let half = self.h / 2.0;
        (0..self.domain.design_cells)
            .map(|k| half * (nodal[k] + nodal[k + 1]))
            .collect()
    }

    fn permittivity_sensitivity(&self, w: &[Complex64], u: &[Complex64]) -> Vec<f64> {
        assert_eq!(w.len(), self.num_dofs());
        assert_eq!(u.len(), self.num_dofs());
        let k0 = self.physics.wavenumber();
        let scale = -k0 * k0 * self.h / 6.0;
        let d0 = self.domain.design_start;
        (0..self.domain.design_cells)
            .map(|k| {
                let e = d0 + k;
                // w† (∂A/∂ε_k) u with the element consistent mass (γ = 1
                // in the design region: it lies outside the PML).
                let pair = w[e].conj() * (2.0 * u[e] + u[e + 1])
                    + w[e + 1].conj() * (u[e] + 2.0 * u[e + 1]);
                scale * pair.re
            })
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────
