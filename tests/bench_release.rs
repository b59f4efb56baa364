//! Release-mode benchmarks for the Orpheus pipeline.
//!
//! Run with:   cargo test --release --test bench_release -- --nocapture
//!
//! These are not criterion benchmarks (to avoid an extra dependency);
//! instead they time key operations using `std::time::Instant` and print
//! the results.

use orpheus::adjoint;
use orpheus::filter::DensityFilter;
use orpheus::forward::{ForwardSolver, MaterialModel};
use orpheus::helmholtz::{DomainConfig, Helmholtz1d, PhysicsConfig};
use orpheus::objective::ObjectiveEvaluator;
use orpheus::optimizer;
use orpheus::types::{ContinuationSchedule, OptimizationSettings, PipelineCache};
use std::time::Instant;

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

/// Larger slab for timing: 240 elements, 60 design cells.
fn make_large_backend() -> Helmholtz1d {
    let physics = PhysicsConfig {
        wavelength: 1.0,
        background_index: 1.0,
        material_index: 2.0,
        pml_strength: 12.0,
    };
    let domain = DomainConfig {
        length: 12.0,
        elements: 240,
        pml_elements: 20,
        design_start: 90,
        design_cells: 60,
        source_node: 50,
        target_start: 180,
        target_cells: 15,
    };
    Helmholtz1d::new(physics, domain).unwrap()
}

fn graded_density(n: usize) -> Vec<f64> {
    (0..n).map(|k| 0.3 + 0.4 * ((k * 13 + 5) % 17) as f64 / 17.0).collect()
}

// ─────────────────────────────────────────────────────────────
//  Benchmarks
// ─────────────────────────────────────────────────────────────

#[test]
fn bench_value_and_gradient() {
    let backend = make_large_backend();
    let filter = DensityFilter::new(&backend, 0.2).unwrap();
    let forward = ForwardSolver::new(MaterialModel::new(1.0, 2.0).unwrap());
    let objective = ObjectiveEvaluator::new(&backend);
    let density = graded_density(60);

    let mut cache = PipelineCache::new(&backend);
    let mut grad = vec![0.0; 60];

    // Warm-up evaluation (also checks the pipeline runs at this size)
    let g = adjoint::value_and_gradient(
        &backend, &filter, &forward, &objective, &mut cache, &density, 8.0, 0.5, &mut grad,
    )
    .unwrap();
    assert!(g.is_finite());

    let reps = 5;
    let start = Instant::now();
    for _ in 0..reps {
        adjoint::value_and_gradient(
            &backend, &filter, &forward, &objective, &mut cache, &density, 8.0, 0.5, &mut grad,
        )
        .unwrap();
    }
    let elapsed = start.elapsed();
    eprintln!(
        "value_and_gradient (240 elements, 60 design cells): {:.2?} / eval",
        elapsed / reps,
    );
}

#[test]
fn bench_short_continuation() {
    let backend = make_large_backend();
    let settings = OptimizationSettings {
        schedule: ContinuationSchedule {
            betas: vec![8.0, 16.0],
            eta: 0.5,
        },
        filter_radius: 0.2,
        tolerance: 1e-6,
        max_iterations: 5,
        move_limit: 0.2,
        report_frequency: 0,
    };

    let start = Instant::now();
    let result = optimizer::optimize(
        &backend,
        &MaterialModel::new(1.0, 2.0).unwrap(),
        &settings,
        &vec![0.5; 60],
    )
    .unwrap();
    let elapsed = start.elapsed();

    assert!(!result.status.is_aborted());
    eprintln!(
        "short continuation (2 stages x 5 iters, 60 design cells): {:.2?}, {} evaluations, objective {:.4e}",
        elapsed,
        result.objective_trace.len(),
        result.objective,
    );
}
