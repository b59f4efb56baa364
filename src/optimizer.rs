//! Continuation optimisation driver via the `argmin` crate.
//!
//! Wraps the adjoint `value_and_gradient` into argmin's `CostFunction`
//! + `Gradient` traits, then runs one bound-constrained Method of
//! Moving Asymptotes solve per β in the continuation schedule, each
//! stage warm-started from the previous stage's best density.
//!
//! MMA is implemented as a custom argmin `Solver`: per-variable moving
//! asymptotes with oscillation-driven expansion/contraction, move
//! limits, and a closed-form solution of the separable convex
//! subproblem.  Iterates stay inside [0,1] by construction, which is
//! what lets the filter and threshold stages validate the range
//! strictly instead of clamping.

use crate::adjoint::value_and_gradient;
use crate::backend::HelmholtzBackend;
use crate::filter::DensityFilter;
use crate::forward::{ForwardSolver, MaterialModel};
use crate::objective::ObjectiveEvaluator;
use crate::types::{
    IterationRecord, OptimizationSettings, OrpheusError, PipelineCache, RunStatus, SolverResult,
};
use argmin::core::{
    CostFunction, Error as ArgminError, Executor, Gradient, IterState, Problem as ArgminProblem,
    Solver, State, TerminationReason, TerminationStatus, KV,
};
use std::cell::{Cell, RefCell};

// ─────────────────────────────────────────────────────────────
//  Method of Moving Asymptotes  (bound-constrained, no extra
//  constraints — the separable subproblem solves in closed form)
// ─────────────────────────────────────────────────────────────

const ASYMPTOTE_INIT: f64 = 0.5;
const ASYMPTOTE_TIGHTEN: f64 = 0.7;
const ASYMPTOTE_RELAX: f64 = 1.2;
const ASYMPTOTE_SHRINK_BOUND: f64 = 0.01;
const ASYMPTOTE_GROW_BOUND: f64 = 10.0;
const SUBPROBLEM_REGULARISER: f64 = 1e-5;

pub struct MovingAsymptotes {
    tolerance: f64,
    move_limit: f64,
    lower: f64,
    upper: f64,
    x_prev: Option<Vec<f64>>,
    x_prev2: Option<Vec<f64>>,
    low: Vec<f64>,
    upp: Vec<f64>,
}

impl MovingAsymptotes {
    /// Bound constraints are the unit box [0,1] — the admissible range
    /// of a density variable.
    pub fn new(tolerance: f64, move_limit: f64) -> Self {
        Self {
            tolerance,
            move_limit,
            lower: 0.0,
            upper: 1.0,
            x_prev: None,
            x_prev2: None,
            low: Vec::new(),
            upp: Vec::new(),
        }
    }

    /// One MMA update: build the convex separable approximation around
    /// `x` and minimise it per variable inside bounds ∩ move limits.
    fn update(&mut self, x: &[f64], grad: &[f64]) -> Vec<f64> {
        let n = x.len();
        let range = self.upper - self.lower;
        let mut x_new = vec![0.0; n];
        if self.low.len() != n {
            self.low = vec![0.0; n];
            self.upp = vec![0.0; n];
        }

        for j in 0..n {
            let (low_j, upp_j) = match (&self.x_prev, &self.x_prev2) {
                (Some(x1), Some(x2)) => {
                    // Expand asymptotes where the iterate moves steadily,
                    // tighten where it oscillates.
                    let osc = (x[j] - x1[j]) * (x1[j] - x2[j]);
                    let gamma = if osc > 0.0 {
                        ASYMPTOTE_RELAX
                    } else if osc < 0.0 {
                        ASYMPTOTE_TIGHTEN
                    } else {
                        1.0
                    };
                    let low = (x[j] - gamma * (x1[j] - self.low[j]))
                        .clamp(x[j] - ASYMPTOTE_GROW_BOUND * range, x[j] - ASYMPTOTE_SHRINK_BOUND * range);
                    let upp = (x[j] + gamma * (self.upp[j] - x1[j]))
                        .clamp(x[j] + ASYMPTOTE_SHRINK_BOUND * range, x[j] + ASYMPTOTE_GROW_BOUND * range);
                    (low, upp)
                }
                _ => (x[j] - ASYMPTOTE_INIT * range, x[j] + ASYMPTOTE_INIT * range),
            };

            let g = grad[j];
            let p = (upp_j - x[j]).powi(2)
                * (g.max(0.0) + 0.001 * g.abs() + SUBPROBLEM_REGULARISER / range);
            let q = (x[j] - low_j).powi(2)
                * ((-g).max(0.0) + 0.001 * g.abs() + SUBPROBLEM_REGULARISER / range);

            // Stationary point of p/(U−x) + q/(x−L)
            let candidate = (p.sqrt() * low_j + q.sqrt() * upp_j) / (p.sqrt() + q.sqrt());

            let lo = self
                .lower
                .max(low_j + 0.1 * (x[j] - low_j))
                .max(x[j] - self.move_limit * range);
            let hi = self
                .upper
                .min(upp_j - 0.1 * (upp_j - x[j]))
                .min(x[j] + self.move_limit * range);
            x_new[j] = candidate.clamp(lo, hi);

            self.low[j] = low_j;
            self.upp[j] = upp_j;
        }

        self.x_prev2 = self.x_prev.take();
        self.x_prev = Some(x.to_vec());
        x_new
    }
}

type MmaState = IterState<Vec<f64>, Vec<f64>, (), (), f64>;

impl<O> Solver<O, MmaState> for MovingAsymptotes
where
    O: CostFunction<Param = Vec<f64>, Output = f64> + Gradient<Param = Vec<f64>, Gradient = Vec<f64>>,
{
    const NAME: &'static str = "Method of Moving Asymptotes";

    fn init(
        &mut self,
        problem: &mut ArgminProblem<O>,
        mut state: MmaState,
    ) -> Result<(MmaState, Option<KV>), ArgminError> {
        let param = state
            .take_param()
            .ok_or_else(|| ArgminError::msg("MMA requires an initial parameter"))?;
        let cost = problem.cost(&param)?;
        let gradient = problem.gradient(&param)?;
        Ok((state.param(param).cost(cost).gradient(gradient), None))
    }

    fn next_iter(
        &mut self,
        problem: &mut ArgminProblem<O>,
        mut state: MmaState,
    ) -> Result<(MmaState, Option<KV>), ArgminError> {
        let x = state
            .take_param()
            .ok_or_else(|| ArgminError::msg("MMA lost its parameter"))?;
        let grad = state
            .take_gradient()
            .ok_or_else(|| ArgminError::msg("MMA lost its gradient"))?;

        let x_new = self.update(&x, &grad);
        let cost = problem.cost(&x_new)?;
        let gradient = problem.gradient(&x_new)?;
        Ok((state.param(x_new).cost(cost).gradient(gradient), None))
    }

    fn terminate(&mut self, state: &MmaState) -> TerminationStatus {
        if state.get_iter() < 1 {
            return TerminationStatus::NotTerminated;
        }
        let cost = state.cost;
        let prev = state.prev_cost;
        if !cost.is_finite() || !prev.is_finite() {
            return TerminationStatus::NotTerminated;
        }
        let denom = cost.abs().max(prev.abs()).max(1e-30);
        if (cost - prev).abs() / denom < self.tolerance {
            TerminationStatus::Terminated(TerminationReason::SolverConverged)
        } else {
            TerminationStatus::NotTerminated
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Shared per-run bookkeeping  (driver-owned, wrapper-visible)
// ─────────────────────────────────────────────────────────────

struct RunLog {
    /// Append-only objective log, one entry per accepted evaluation.
    trace: RefCell<Vec<f64>>,
    evaluations: Cell<usize>,
    /// Typed error preserved across the argmin boundary.
    failure: RefCell<Option<OrpheusError>>,
    /// Best (density, objective) of the *current* stage.
    stage_best: RefCell<Option<(Vec<f64>, f64)>>,
}

impl RunLog {
    fn new() -> Self {
        Self {
            trace: RefCell::new(Vec::new()),
            evaluations: Cell::new(0),
            failure: RefCell::new(None),
            stage_best: RefCell::new(None),
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  argmin problem wrapper
// ─────────────────────────────────────────────────────────────

/// Wraps the pipeline so argmin can evaluate cost and gradient.
///
/// `RefCell` is used for the cache because argmin's `CostFunction` /
/// `Gradient` traits take `&self`, but the pipeline mutates its
/// workspace.  The run is single-threaded, so the borrow never actually
/// conflicts.
///
/// **Evaluation cache**: argmin calls `cost(θ)` and `gradient(θ)`
/// separately at the same θ each iteration.  We cache the last
/// `(θ, cost, grad)` so the expensive forward + adjoint solve runs only
/// once per unique θ.  The driver maximises the field intensity g, so
/// the argmin cost is −g.
struct DesignProblem<'a, B: HelmholtzBackend> {
    backend: &'a B,
    filter: &'a DensityFilter,
    forward: &'a ForwardSolver,
    objective: &'a ObjectiveEvaluator,
    beta: f64,
    eta: f64,
    stage: usize,
    report_frequency: usize,
    cache: RefCell<PipelineCache<B::Factorization>>,
    last_eval: RefCell<Option<(Vec<f64>, f64, Vec<f64>)>>,
    log: &'a RunLog,
    observer: &'a RefCell<&'a mut dyn FnMut(IterationRecord)>,
}

impl<'a, B: HelmholtzBackend> DesignProblem<'a, B> {
    /// Ensure the evaluation cache contains results for `theta`.
    fn ensure_evaluated(&self, theta: &[f64]) -> Result<(), ArgminError> {
        {
            let cached = self.last_eval.borrow();
            if let Some((ref t, _, _)) = *cached {
                if t == theta {
                    return Ok(());
                }
            }
        }
        // Cache miss — run the full forward + adjoint pipeline
        let mut cache = self.cache.borrow_mut();
        let mut grad = vec![0.0; theta.len()];
        let g = value_and_gradient(
            self.backend,
            self.filter,
            self.forward,
            self.objective,
            &mut cache,
            theta,
            self.beta,
            self.eta,
            &mut grad,
        )
        .map_err(|e| {
            let msg = e.to_string();
            *self.log.failure.borrow_mut() = Some(e);
            ArgminError::msg(msg)
        })?;

        let evaluation = self.log.evaluations.get();
        self.log.evaluations.set(evaluation + 1);
        self.log.trace.borrow_mut().push(g);
        {
            let mut best = self.log.stage_best.borrow_mut();
            if best.as_ref().map_or(true, |&(_, bg)| g > bg) {
                *best = Some((theta.to_vec(), g));
            }
        }
        if self.report_frequency > 0 && evaluation % self.report_frequency == 0 {
            log::debug!(
                "stage {} (beta = {}), evaluation {}: objective {:.6e}",
                self.stage,
                self.beta,
                evaluation,
                g,
            );
        }
        {
            let mut obs = self.observer.borrow_mut();
            (*obs)(IterationRecord {
                stage: self.stage,
                beta: self.beta,
                evaluation,
                objective: g,
            });
        }

        // Maximise g ⇒ minimise −g
        for v in grad.iter_mut() {
            *v = -*v;
        }
        *self.last_eval.borrow_mut() = Some((theta.to_vec(), -g, grad));
        Ok(())
    }
}

impl<'a, B: HelmholtzBackend> CostFunction for DesignProblem<'a, B> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, theta: &Self::Param) -> Result<Self::Output, ArgminError> {
        self.ensure_evaluated(theta)?;
        let cached = self.last_eval.borrow();
        Ok(cached.as_ref().unwrap().1)
    }
}

impl<'a, B: HelmholtzBackend> Gradient for DesignProblem<'a, B> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, theta: &Self::Param) -> Result<Self::Gradient, ArgminError> {
        self.ensure_evaluated(theta)?;
        let cached = self.last_eval.borrow();
        Ok(cached.as_ref().unwrap().2.clone())
    }
}

// ─────────────────────────────────────────────────────────────
//  Top-level optimisation entry points
// ─────────────────────────────────────────────────────────────

/// Run the β-continuation optimisation.  See [`optimize_with_observer`].
pub fn optimize<B: HelmholtzBackend>(
    backend: &B,
    material: &MaterialModel,
    settings: &OptimizationSettings,
    initial_density: &[f64],
) -> Result<SolverResult, OrpheusError> {
    optimize_with_observer(backend, material, settings, initial_density, |_| {})
}

/// Run the β-continuation optimisation with a per-evaluation observer.
///
/// One MMA stage per β in the schedule; each stage is warm-started from
/// the previous stage's best density.  Linear-solve failures abort the
/// run, but the best density found up to that point is still returned
/// (`RunStatus::Aborted` carries the typed error).  Setup failures
/// (invalid settings, singular filter operator) return `Err` before any
/// iteration runs.
pub fn optimize_with_observer<B, F>(
    backend: &B,
    material: &MaterialModel,
    settings: &OptimizationSettings,
    initial_density: &[f64],
    mut observer: F,
) -> Result<SolverResult, OrpheusError>
where
    B: HelmholtzBackend,
    F: FnMut(IterationRecord),
{
    settings.validate()?;
    if initial_density.len() != backend.num_design_cells() {
        return Err(OrpheusError::Shape(format!(
            "initial density has {} cells, backend has {}",
            initial_density.len(),
            backend.num_design_cells(),
        )));
    }
    for (i, &p) in initial_density.iter().enumerate() {
        if !(0.0..=1.0).contains(&p) {
            return Err(OrpheusError::InvalidDensity { index: i, value: p });
        }
    }

    let filter = DensityFilter::new(backend, settings.filter_radius)?;
    let forward = ForwardSolver::new(material.clone());
    let objective = ObjectiveEvaluator::new(backend);
    let eta = settings.schedule.eta;

    let log = RunLog::new();
    let observer_cell: RefCell<&mut dyn FnMut(IterationRecord)> = RefCell::new(&mut observer);

    let mut density = initial_density.to_vec();
    let mut objective_value = f64::NAN;
    let mut stage_objectives = Vec::with_capacity(settings.schedule.betas.len());
    let mut total_iterations = 0usize;
    let mut final_stage_converged = false;

    for (stage, &beta) in settings.schedule.betas.iter().enumerate() {
        *log.stage_best.borrow_mut() = None;

        let problem = DesignProblem {
            backend,
            filter: &filter,
            forward: &forward,
            objective: &objective,
            beta,
            eta,
            stage,
            report_frequency: settings.report_frequency,
            cache: RefCell::new(PipelineCache::new(backend)),
            last_eval: RefCell::new(None),
            log: &log,
            observer: &observer_cell,
        };

        let solver = MovingAsymptotes::new(settings.tolerance, settings.move_limit);
        let executor = Executor::new(problem, solver).configure(|config| {
            config
                .param(density.clone())
                .max_iters(settings.max_iterations as u64)
                .target_cost(f64::NEG_INFINITY)
        });

        match executor.run() {
            Ok(result) => {
                let state = result.state();
                if let Some(best) = state.get_best_param() {
                    density = best.clone();
                }
                objective_value = -state.get_best_cost();
                stage_objectives.push(objective_value);
                total_iterations += state.get_iter() as usize;
                final_stage_converged = matches!(
                    state.get_termination_reason(),
                    Some(TerminationReason::SolverConverged),
                );
                log::info!(
                    "stage {} (beta = {}): objective {:.6e} after {} iterations ({})",
                    stage,
                    beta,
                    objective_value,
                    state.get_iter(),
                    if final_stage_converged { "converged" } else { "budget exhausted" },
                );
            }
            Err(e) => {
                let error = log
                    .failure
                    .borrow_mut()
                    .take()
                    .unwrap_or_else(|| OrpheusError::Solver(e.to_string()));
                // Preserve the best density seen in the aborted stage,
                // falling back to the last completed stage's result.
                if let Some((best_density, best_g)) = log.stage_best.borrow_mut().take() {
                    density = best_density;
                    objective_value = best_g;
                }
                log::warn!("stage {stage} (beta = {beta}) aborted: {error}");
                return Ok(SolverResult {
                    density,
                    objective: objective_value,
                    objective_trace: log.trace.into_inner(),
                    stage_objectives,
                    iterations: total_iterations,
                    status: RunStatus::Aborted(error),
                });
            }
        }
    }

    let status = if final_stage_converged {
        RunStatus::Converged
    } else {
        RunStatus::ScheduleExhausted
    };
    Ok(SolverResult {
        density,
        objective: objective_value,
        objective_trace: log.trace.into_inner(),
        stage_objectives,
        iterations: total_iterations,
        status,
    })
}

// ─────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Separable quadratic with minimum at `target`.
    struct Quadratic {
        target: Vec<f64>,
    }

    impl CostFunction for Quadratic {
        type Param = Vec<f64>;
        type Output = f64;

        fn cost(&self, x: &Vec<f64>) -> Result<f64, ArgminError> {
            Ok(x.iter()
                .zip(&self.target)
                .map(|(xi, ti)| (xi - ti) * (xi - ti))
                .sum())
        }
    }

    impl Gradient for Quadratic {
        type Param = Vec<f64>;
        type Gradient = Vec<f64>;

        fn gradient(&self, x: &Vec<f64>) -> Result<Vec<f64>, ArgminError> {
            Ok(x.iter()
                .zip(&self.target)
                .map(|(xi, ti)| 2.0 * (xi - ti))
                .collect())
        }
    }

    fn run_mma(target: Vec<f64>, x0: Vec<f64>, iters: u64) -> Vec<f64> {
        let problem = Quadratic { target };
        let solver = MovingAsymptotes::new(1e-12, 0.2);
        let result = Executor::new(problem, solver)
            .configure(|config| config.param(x0).max_iters(iters))
            .run()
            .unwrap();
        result.state().get_best_param().unwrap().clone()
    }

    #[test]
    fn mma_converges_on_interior_quadratic() {
        let best = run_mma(vec![0.3, 0.7, 0.55], vec![0.5, 0.5, 0.5], 200);
        for (b, t) in best.iter().zip(&[0.3, 0.7, 0.55]) {
            assert!((b - t).abs() < 1e-3, "{b} vs {t}");
        }
    }

    #[test]
    fn mma_respects_the_unit_box() {
        // Unconstrained minimum sits outside [0,1]; MMA must stop at
        // the boundary and never leave the box on the way.
        let best = run_mma(vec![1.5, -0.4], vec![0.5, 0.5], 200);
        assert!((best[0] - 1.0).abs() < 1e-6, "{}", best[0]);
        assert!(best[1].abs() < 1e-6, "{}", best[1]);
    }

    #[test]
    fn mma_update_stays_in_bounds_every_iteration() {
        let mut mma = MovingAsymptotes::new(1e-12, 0.2);
        let mut x = vec![0.1, 0.9, 0.5];
        let target = [1.5, -0.4, 0.2];
        for _ in 0..50 {
            let grad: Vec<f64> = x.iter().zip(&target).map(|(xi, ti)| 2.0 * (xi - ti)).collect();
            x = mma.update(&x, &grad);
            for &v in &x {
                assert!((0.0..=1.0).contains(&v), "iterate escaped the box: {v}");
            }
        }
    }
}
