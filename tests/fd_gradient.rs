//! Finite-difference gradient tests for the adjoint sensitivity engine.
//!
//! Tests build a 60-element slab domain with PMLs at both ends, a
//! 12-cell design region between the source and the target window, and
//! compare every component of the analytic gradient against a central-
//! difference estimate:
//!
//!     dg/dp_k  ≈  [ g(p + h e_k) − g(p − h e_k) ] / 2h
//!
//! The adjoint gradient is exact to the discretisation, so the only
//! slack needed is finite-difference truncation and round-off.
//! Multiple β / η / radius combinations are exercised for coverage.

use orpheus::adjoint;
use orpheus::filter::DensityFilter;
use orpheus::forward::{ForwardSolver, MaterialModel};
use orpheus::helmholtz::{DomainConfig, Helmholtz1d, PhysicsConfig};
use orpheus::objective::ObjectiveEvaluator;
use orpheus::types::PipelineCache;

// ─────────────────────────────────────────────────────────────
//  Helpers: build a small slab problem
// ─────────────────────────────────────────────────────────────

/// 60 uniform elements over [0, 6]: PML · bulk · design · bulk · target
/// · bulk · PML, with the source between the left PML and the design.
fn make_backend() -> Helmholtz1d {
    let physics = PhysicsConfig {
        wavelength: 1.0,
        background_index: 1.0,
        material_index: 2.0,
        pml_strength: 12.0,
    };
    let domain = DomainConfig {
        length: 6.0,
        elements: 60,
        pml_elements: 10,
        design_start: 24,
        design_cells: 12,
        source_node: 14,
        target_start: 42,
        target_cells: 6,
    };
    Helmholtz1d::new(physics, domain).unwrap()
}

fn make_material() -> MaterialModel {
    MaterialModel::new(1.0, 2.0).unwrap()
}

/// Evaluate the objective only (fresh cache each call so factorizations
/// never leak between perturbed evaluations).
fn eval_value(
    backend: &Helmholtz1d,
    filter: &DensityFilter,
    forward: &ForwardSolver,
    objective: &ObjectiveEvaluator,
    density: &[f64],
    beta: f64,
    eta: f64,
) -> f64 {
    let mut cache = PipelineCache::new(backend);
    adjoint::value(backend, filter, forward, objective, &mut cache, density, beta, eta).unwrap()
}

// ─────────────────────────────────────────────────────────────
//  Core FD test driver
// ─────────────────────────────────────────────────────────────

/// Central-difference gradient check over every design component.
fn fd_gradient_check(
    density: &[f64],
    radius: f64,
    beta: f64,
    eta: f64,
    h: f64,
    tol_abs: f64,
    tol_rel: f64,
) {
    let backend = make_backend();
    let filter = DensityFilter::new(&backend, radius).unwrap();
    let forward = ForwardSolver::new(make_material());
    let objective = ObjectiveEvaluator::new(&backend);
    let n = density.len();

    // Analytic gradient
    let mut cache = PipelineCache::new(&backend);
    let mut grad_analytic = vec![0.0; n];
    let value = adjoint::value_and_gradient(
        &backend,
        &filter,
        &forward,
        &objective,
        &mut cache,
        density,
        beta,
        eta,
        &mut grad_analytic,
    )
    .unwrap();

    // FD gradient
    let mut grad_fd = vec![0.0; n];
    let mut plus = density.to_vec();
    let mut minus = density.to_vec();
    for k in 0..n {
        plus[k] = density[k] + h;
        minus[k] = density[k] - h;

        let f_plus = eval_value(&backend, &filter, &forward, &objective, &plus, beta, eta);
        let f_minus = eval_value(&backend, &filter, &forward, &objective, &minus, beta, eta);
        grad_fd[k] = (f_plus - f_minus) / (2.0 * h);

        plus[k] = density[k];
        minus[k] = density[k];
    }

    // Print diagnostics before asserting
    eprintln!("──────────────────────────────────────────────");
    eprintln!("FD gradient check  (beta = {beta}, eta = {eta}, r = {radius}, h = {h:.1e})");
    eprintln!("  objective g = {value:.6e}");
    for k in 0..n {
        let abs_err = (grad_analytic[k] - grad_fd[k]).abs();
        let denom = grad_fd[k].abs().max(grad_analytic[k].abs()).max(1e-14);
        let rel_err = abs_err / denom;
        let flag = if abs_err > tol_abs && rel_err > tol_rel { " <<<" } else { "" };
        eprintln!(
            "  p[{k:>2}]  analytic={:+12.6e}  fd={:+12.6e}  abs={:.2e}  rel={:.2e}{flag}",
            grad_analytic[k], grad_fd[k], abs_err, rel_err,
        );
    }
    eprintln!("──────────────────────────────────────────────");

    // Assert
    for k in 0..n {
        let abs_err = (grad_analytic[k] - grad_fd[k]).abs();
        let denom = grad_fd[k].abs().max(grad_analytic[k].abs()).max(1e-14);
        let rel_err = abs_err / denom;
        assert!(
            abs_err < tol_abs || rel_err < tol_rel,
            "component {k}: analytic={:.8e}, fd={:.8e}, abs_err={:.3e}, rel_err={:.3e}",
            grad_analytic[k],
            grad_fd[k],
            abs_err,
            rel_err,
        );
    }
}

fn graded_density(n: usize) -> Vec<f64> {
    // Asymmetric, all-interior values so no component sits on a bound
    (0..n).map(|k| 0.35 + 0.3 * ((k * 7 + 3) % 11) as f64 / 11.0).collect()
}

// ─────────────────────────────────────────────────────────────
//  Tests:  componentwise central differences
// ─────────────────────────────────────────────────────────────

#[test]
fn fd_soft_projection() {
    let p = graded_density(12);
    fd_gradient_check(&p, 0.1, 2.0, 0.5, 1e-6, 1e-9, 1e-3);
}

#[test]
fn fd_schedule_entry_beta() {
    let p = graded_density(12);
    fd_gradient_check(&p, 0.1, 8.0, 0.5, 1e-6, 1e-9, 1e-3);
}

#[test]
fn fd_sharp_projection() {
    let p = graded_density(12);
    fd_gradient_check(&p, 0.1, 32.0, 0.5, 1e-6, 1e-9, 1e-3);
}

#[test]
fn fd_offset_threshold_center() {
    let p = graded_density(12);
    fd_gradient_check(&p, 0.1, 8.0, 0.3, 1e-6, 1e-9, 1e-3);
}

#[test]
fn fd_wide_filter() {
    let p = graded_density(12);
    fd_gradient_check(&p, 0.4, 8.0, 0.5, 1e-6, 1e-9, 1e-3);
}

#[test]
fn fd_uniform_density() {
    let p = vec![0.5; 12];
    fd_gradient_check(&p, 0.1, 8.0, 0.5, 1e-6, 1e-9, 1e-3);
}

// ─────────────────────────────────────────────────────────────
//  Test:  directional perturbation (first-order expansion)
// ─────────────────────────────────────────────────────────────

/// |g(p + δp) − g(p) − ∇g·δp| / |∇g·δp| must be small for a small
/// random direction δp.
#[test]
fn fd_directional_first_order() {
    let backend = make_backend();
    let filter = DensityFilter::new(&backend, 0.1).unwrap();
    let forward = ForwardSolver::new(make_material());
    let objective = ObjectiveEvaluator::new(&backend);
    let (beta, eta) = (8.0, 0.5);

    let p = graded_density(12);
    let direction: Vec<f64> = (0..12)
        .map(|k| 2.0 * (((k * 5 + 1) % 7) as f64 / 6.0) - 1.0)
        .collect();
    let scale = 1e-6;

    let mut cache = PipelineCache::new(&backend);
    let mut grad = vec![0.0; 12];
    let g0 = adjoint::value_and_gradient(
        &backend, &filter, &forward, &objective, &mut cache, &p, beta, eta, &mut grad,
    )
    .unwrap();

    let perturbed: Vec<f64> = p.iter().zip(&direction).map(|(pi, d)| pi + scale * d).collect();
    let g1 = eval_value(&backend, &filter, &forward, &objective, &perturbed, beta, eta);

    let predicted: f64 = grad.iter().zip(&direction).map(|(g, d)| g * d * scale).sum();
    assert!(predicted.abs() > 0.0, "degenerate direction: zero predicted change");
    let rel = ((g1 - g0) - predicted).abs() / predicted.abs();
    eprintln!("directional check: actual {:.6e}, predicted {:.6e}, rel {rel:.3e}", g1 - g0, predicted);
    assert!(rel < 1e-3, "first-order mismatch: rel = {rel:.3e}");
}
