//! **Orpheus** — density-based topology optimisation for Helmholtz
//! scattering problems with hand-coded adjoints.
//!
//! This crate implements the complete inverse-design pipeline:
//!
//! 1. **Density filter** (`filter`): minimum-length-scale smoothing via a
//!    damped-diffusion solve, SPD, factorised once per run.
//! 2. **Threshold projection** (`threshold`): pointwise tanh sharpening
//!    towards a 0/1 design, continuation-controlled sharpness β.
//! 3. **Forward solve** (`forward`, `backend`): material interpolation,
//!    assemble A(p_t), factorise, solve — delegated to a finite-element
//!    collaborator behind the `HelmholtzBackend` trait.
//! 4. **Objective** (`objective`): target-region field intensity
//!    g = Re(u† O u).
//! 5. **Adjoint gradients** (`adjoint`): one extra linear solve + explicit
//!    chain-rule stages — no AD framework needed.
//! 6. **Optimiser** (`optimizer`): bound-constrained MMA via `argmin`,
//!    run over a β-continuation schedule.
//!
//! A reference 1D PML-augmented discretisation lives in `helmholtz`.

pub mod types;
pub mod backend;
pub mod helmholtz;
pub mod filter;
pub mod threshold;
pub mod forward;
pub mod objective;
pub mod adjoint;
pub mod optimizer;
