//! Smoothed threshold projection.
//!
//! Pointwise tanh sharpening of the filtered density towards {0, 1}.
//! Pure functions only: the continuation driver owns β, the projector
//! holds no state.

use crate::types::{OrpheusError, RANGE_SLACK};

/// p_t = (tanh(βη) + tanh(β(p_f − η))) / (tanh(βη) + tanh(β(1 − η)))
///
/// Approaches the unit step at p_f = η as β → ∞; fixes θ(η) = 1/2 for
/// η = 0.5 and reproduces the endpoints in the limit.
#[inline]
pub fn project(filtered: f64, beta: f64, eta: f64) -> f64 {
    let denom = (beta * eta).tanh() + (beta * (1.0 - eta)).tanh();
    ((beta * eta).tanh() + (beta * (filtered - eta)).tanh()) / denom
}

/// dp_t/dp_f = β (1 − tanh²(β(p_f − η))) / (tanh(βη) + tanh(β(1 − η)))
#[inline]
pub fn project_derivative(filtered: f64, beta: f64, eta: f64) -> f64 {
    let denom = (beta * eta).tanh() + (beta * (1.0 - eta)).tanh();
    let t = (beta * (filtered - eta)).tanh();
    beta * (1.0 - t * t) / denom
}

/// Apply the projector to a nodal field, validating the [0,1] range
/// (with [`RANGE_SLACK`] for filter round-off).  Out-of-range entries
/// are rejected, not clamped.
pub fn project_field(
    filtered: &[f64],
    beta: f64,
    eta: f64,
    out: &mut [f64],
) -> Result<(), OrpheusError> {
    debug_assert_eq!(filtered.len(), out.len());
    for (i, (&pf, o)) in filtered.iter().zip(out.iter_mut()).enumerate() {
        if !(-RANGE_SLACK..=1.0 + RANGE_SLACK).contains(&pf) {
            return Err(OrpheusError::InvalidDensity { index: i, value: pf });
        }
        *o = project(pf, beta, eta);
    }
    Ok(())
}

/// Pointwise derivative over a nodal field.  No range validation: this
/// is only called after `project_field` accepted the same input.
pub fn project_derivative_field(filtered: &[f64], beta: f64, eta: f64, out: &mut [f64]) {
    debug_assert_eq!(filtered.len(), out.len());
    for (&pf, o) in filtered.iter().zip(out.iter_mut()) {
        *o = project_derivative(pf, beta, eta);
    }
}

/// Hard 0/1 rendering of a projected field for reporting.  Ties route
/// to material: p_t ≥ η maps to 1.
pub fn binarize(projected: &[f64], eta: f64) -> Vec<f64> {
    projected
        .iter()
        .map(|&p| if p >= eta { 1.0 } else { 0.0 })
        .collect()
}

// ─────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────
