use crate::backend::HelmholtzBackend;
use num_complex::Complex64;
use std::fmt;

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Unified error type for all fallible operations in the crate.
///
/// Every function in the public API returns `Result<T, OrpheusError>`
/// instead of panicking.  Linear-algebra failures are unrecoverable
/// locally: they propagate to the optimisation driver, which aborts the
/// run while preserving the best-known density vector.
#[derive(Debug)]
pub enum OrpheusError {
    /// Sparse factorization failure (singular / not-SPD filter operator).
    Linalg(sprs::errors::LinalgError),
    /// The forward operator factorization hit a zero pivot.
    Singular { system: &'static str, index: usize },
    /// A linear solve completed but produced non-finite entries.
    SolveFailed { system: &'static str, detail: String },
    /// A density entry outside [0,1] reached the filter or threshold
    /// stage.  Rejected rather than clamped: clamping would corrupt the
    /// gradient.
    InvalidDensity { index: usize, value: f64 },
    /// The forward factorization has not been computed yet.
    MissingFactorization,
    /// Argmin driver returned an error.
    Solver(String),
    /// Shape or configuration mismatch in input data.
    Shape(String),
}

impl fmt::Display for OrpheusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linalg(e) => write!(f, "linear algebra error: {e}"),
            Self::Singular { system, index } =>
                write!(f, "singular {system} system: zero pivot at row {index}"),
            Self::SolveFailed { system, detail } =>
                write!(f, "{system} solve failed: {detail}"),
            Self::InvalidDensity { index, value } =>
                write!(f, "density[{index}] = {value} outside [0,1]"),
            Self::MissingFactorization =>
                write!(f, "forward factorization not computed (solve before adjoint)"),
            Self::Solver(msg) => write!(f, "solver error: {msg}"),
            Self::Shape(msg) => write!(f, "shape error: {msg}"),
        }
    }
}

impl std::error::Error for OrpheusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Linalg(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sprs::errors::LinalgError> for OrpheusError {
    fn from(e: sprs::errors::LinalgError) -> Self {
        Self::Linalg(e)
    }
}

impl From<argmin::core::Error> for OrpheusError {
    fn from(e: argmin::core::Error) -> Self {
        Self::Solver(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────
//  Constants
// ─────────────────────────────────────────────────────────────

pub const DEFAULT_MOVE_LIMIT: f64 = 0.2;

/// Slack tolerated on the [0,1] range check of the *filtered* density.
/// The lumped-mass filter preserves [0,1] in exact arithmetic; this
/// absorbs the floating-point residue of the triangular solves.  Values
/// inside the slack pass through unmodified, never clamped.
pub const RANGE_SLACK: f64 = 1e-9;

// ─────────────────────────────────────────────────────────────
//  Continuation schedule
// ─────────────────────────────────────────────────────────────

/// Projection-sharpness continuation: one optimisation stage per β,
/// warm-started from the previous stage.  β increases monotonically so
/// the projector approaches a step function only after the design has
/// settled on a smooth optimum.
#[derive(Debug, Clone)]
pub struct ContinuationSchedule {
    /// Sharpness values, each ≥ 1, nondecreasing.
    pub betas: Vec<f64>,
    /// Threshold center η ∈ [0,1].
    pub eta: f64,
}

impl Default for ContinuationSchedule {
    fn default() -> Self {
        Self {
            betas: vec![8.0, 16.0, 32.0],
            eta: 0.5,
        }
    }
}

impl ContinuationSchedule {
    pub fn validate(&self) -> Result<(), OrpheusError> {
        if self.betas.is_empty() {
            return Err(OrpheusError::Shape("empty beta schedule".into()));
        }
        for (i, &b) in self.betas.iter().enumerate() {
            if !b.is_finite() || b < 1.0 {
                return Err(OrpheusError::Shape(format!(
                    "beta[{i}] = {b} must be finite and >= 1"
                )));
            }
            if i > 0 && b < self.betas[i - 1] {
                return Err(OrpheusError::Shape(format!(
                    "beta schedule must be nondecreasing ({} after {})",
                    b,
                    self.betas[i - 1],
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.eta) {
            return Err(OrpheusError::Shape(format!("eta = {} outside [0,1]", self.eta)));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Optimisation settings
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OptimizationSettings {
    pub schedule: ContinuationSchedule,
    /// Filter length scale r (> 0).
    pub filter_radius: f64,
    /// Relative objective-change tolerance per stage.
    pub tolerance: f64,
    /// Iteration budget per stage.
    pub max_iterations: usize,
    /// MMA move limit per iteration (fraction of the [0,1] box).
    pub move_limit: f64,
    /// Log the objective every `report_frequency` iterations (0 = never).
    pub report_frequency: usize,
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        Self {
            schedule: ContinuationSchedule::default(),
            filter_radius: 0.1,
            tolerance: 1e-5,
            max_iterations: 100,
            move_limit: DEFAULT_MOVE_LIMIT,
            report_frequency: 1,
        }
    }
}

impl OptimizationSettings {
    pub fn validate(&self) -> Result<(), OrpheusError> {
        self.schedule.validate()?;
        if !self.filter_radius.is_finite() || self.filter_radius <= 0.0 {
            return Err(OrpheusError::Shape(format!(
                "filter radius {} must be finite and > 0",
                self.filter_radius,
            )));
        }
        if !self.tolerance.is_finite() || self.tolerance <= 0.0 {
            return Err(OrpheusError::Shape(format!(
                "tolerance {} must be finite and > 0",
                self.tolerance,
            )));
        }
        if self.max_iterations == 0 {
            return Err(OrpheusError::Shape("max_iterations must be >= 1".into()));
        }
        if !self.move_limit.is_finite() || self.move_limit <= 0.0 || self.move_limit > 1.0 {
            return Err(OrpheusError::Shape(format!(
                "move limit {} must lie in (0,1]",
                self.move_limit,
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Pre-allocated evaluation cache
// ─────────────────────────────────────────────────────────────

/// All mutable workspace for one objective-and-gradient evaluation.
/// Built once per run, reused across iterations; every buffer is
/// overwritten at the start of each evaluation.
///
/// The forward factorization is the only state shared between pipeline
/// stages: written once per iteration by the forward solve, read by the
/// adjoint solve in the same iteration, replaced on the next.
#[derive(Debug)]
pub struct PipelineCache<F> {
    /// Filtered density p_f, nodal on the design patch.
    pub filtered: Vec<f64>,
    /// Projected density p_t, nodal on the design patch.
    pub projected: Vec<f64>,
    /// Per-design-cell relative permittivity ε(p_t).
    pub permittivity: Vec<f64>,
    /// State field u over all mesh nodes.
    pub field: Vec<Complex64>,
    /// Adjoint field w over all mesh nodes.
    pub adjoint: Vec<Complex64>,
    /// dg/dε per design cell.
    pub grad_permittivity: Vec<f64>,
    /// dg/dp_t, nodal.
    pub grad_projected: Vec<f64>,
    /// dg/dp_f, nodal.
    pub grad_filtered: Vec<f64>,
    /// Factorization of the forward operator A(p_t).
    pub factorization: Option<F>,
}

impl<F> PipelineCache<F> {
    pub fn new<B>(backend: &B) -> Self
    where
        B: HelmholtzBackend<Factorization = F>,
    {
        let nc = backend.num_design_cells();
        let nn = backend.num_design_nodes();
        let nd = backend.num_dofs();
        Self {
            filtered: vec![0.0; nn],
            projected: vec![0.0; nn],
            permittivity: vec![0.0; nc],
            field: vec![Complex64::new(0.0, 0.0); nd],
            adjoint: vec![Complex64::new(0.0, 0.0); nd],
            grad_permittivity: vec![0.0; nc],
            grad_projected: vec![0.0; nn],
            grad_filtered: vec![0.0; nn],
            factorization: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Run status / result
// ─────────────────────────────────────────────────────────────

/// Terminal state of an optimisation run.
#[derive(Debug)]
pub enum RunStatus {
    /// Final continuation stage met the relative-change tolerance.
    Converged,
    /// Iteration budget exhausted without meeting the tolerance.  Not an
    /// error: final density and objective are still valid.
    ScheduleExhausted,
    /// A linear solve failed mid-run.  The result carries the best
    /// density found before the failure.
    Aborted(OrpheusError),
}

impl RunStatus {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }
}

/// Per-evaluation record passed to the driver's observer hook.
#[derive(Debug, Clone, Copy)]
pub struct IterationRecord {
    /// Continuation stage index (0-based).
    pub stage: usize,
    /// Sharpness β of the stage.
    pub beta: f64,
    /// Evaluation counter within the run.
    pub evaluation: usize,
    /// Objective value g at this evaluation.
    pub objective: f64,
}

/// Result of an optimisation run.
#[derive(Debug)]
pub struct SolverResult {
    /// Best density vector found.
    pub density: Vec<f64>,
    /// Objective value at `density`, under the β it was evaluated with.
    pub objective: f64,
    /// Append-only objective log, one entry per accepted evaluation.
    pub objective_trace: Vec<f64>,
    /// Best objective per continuation stage, in schedule order.
    pub stage_objectives: Vec<f64>,
    /// Total optimiser iterations across all stages.
    pub iterations: usize,
    pub status: RunStatus,
}
