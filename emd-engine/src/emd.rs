//! Single-pair Energy Mover's Distance engine.
//!
//! Computes the EMD between two events:
//!
//! ```text
//! EMD(E0, E1) = min_f Σ_ij f_ij d_ij / R^β + |Σ E0 − Σ E1|
//! ```
//!
//! When the total weights differ and weights are not normalized, the
//! lighter event receives a synthetic particle carrying the difference so
//! the transport problem is balanced. All weights are divided by the larger
//! total before solving and the cost is scaled back afterwards.

use crate::error::{EmdError, Result};
use crate::event::{Event, ProtoEvent};
use crate::kernel::{
    check_beta, check_r, ExternalDistances, ExtraParticle, GroundDistance, ParticleDistance,
};
use crate::preprocess::Preprocessor;
use crate::solver::{EmdStatus, ShortestPathSolver, SolverParams, TransportSolver};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmdConfig {
    /// Ground distance scale
    pub r: f64,

    /// Ground distance exponent
    pub beta: f64,

    /// Normalize each event's weights to sum to one
    pub norm: bool,

    /// Record per-pair wall time
    pub do_timing: bool,

    /// Ground distances are provided by the caller
    pub external_dists: bool,

    #[serde(flatten)]
    pub solver: SolverParams,
}

impl Default for EmdConfig {
    fn default() -> Self {
        Self {
            r: 1.0,
            beta: 1.0,
            norm: false,
            do_timing: false,
            external_dists: false,
            solver: SolverParams::default(),
        }
    }
}

impl EmdConfig {
    pub fn validate(&self) -> Result<()> {
        check_r(self.r)?;
        check_beta(self.beta)?;
        self.solver.validate()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Computes the EMD between pairs of events.
///
/// `K` fills ground distances and `S` solves the transport problem. Both
/// are owned, so an engine can be cloned into as many workers as needed.
#[derive(Debug, Clone)]
pub struct Emd<K = ParticleDistance, S = ShortestPathSolver> {
    norm: bool,
    do_timing: bool,
    external_dists: bool,

    kernel: K,
    solver: S,
    preprocessors: Vec<Arc<dyn Preprocessor>>,

    // state of the last computation
    n0: usize,
    n1: usize,
    extra: ExtraParticle,
    weight_diff: f64,
    scale: f64,
    status: EmdStatus,
    emd: f64,
    duration: f64,
}

impl Emd<ParticleDistance, ShortestPathSolver> {
    /// Euclidean ground distance with the bundled solver
    pub fn new(config: EmdConfig) -> Result<Self> {
        let kernel = ParticleDistance::euclidean(config.r, config.beta)?;
        let solver = ShortestPathSolver::new(config.solver)?;
        Self::with_parts(config, kernel, solver)
    }
}

impl Emd<ExternalDistances, ShortestPathSolver> {
    /// Caller-filled ground distances with the bundled solver
    pub fn external(config: EmdConfig) -> Result<Self> {
        let solver = ShortestPathSolver::new(config.solver)?;
        Self::with_parts(config, ExternalDistances::default(), solver)
    }
}

impl<K: GroundDistance, S: TransportSolver> Emd<K, S> {
    /// Assemble an engine from a kernel and a solver.
    ///
    /// `R` and `beta` from the config override the kernel's own.
    pub fn with_parts(config: EmdConfig, mut kernel: K, mut solver: S) -> Result<Self> {
        config.validate()?;
        if config.external_dists && !kernel.is_external() {
            return Err(EmdError::InvalidParameter(
                "external distances cannot be combined with a ground distance kernel".to_string(),
            ));
        }

        kernel.set_r(config.r)?;
        kernel.set_beta(config.beta)?;
        solver.set_params(config.solver)?;

        Ok(Self {
            norm: config.norm,
            do_timing: config.do_timing,
            external_dists: kernel.is_external(),
            kernel,
            solver,
            preprocessors: Vec::new(),
            n0: 0,
            n1: 0,
            extra: ExtraParticle::Neither,
            weight_diff: 0.0,
            scale: 1.0,
            status: EmdStatus::Success,
            emd: 0.0,
            duration: 0.0,
        })
    }

    pub fn r(&self) -> f64 {
        self.kernel.r()
    }

    pub fn beta(&self) -> f64 {
        self.kernel.beta()
    }

    pub fn set_r(&mut self, r: f64) -> Result<()> {
        self.kernel.set_r(r)
    }

    pub fn set_beta(&mut self, beta: f64) -> Result<()> {
        self.kernel.set_beta(beta)
    }

    pub fn norm(&self) -> bool {
        self.norm
    }

    pub fn set_norm(&mut self, norm: bool) {
        self.norm = norm;
    }

    pub fn external_dists(&self) -> bool {
        self.external_dists
    }

    pub fn do_timing(&self) -> bool {
        self.do_timing
    }

    pub fn set_do_timing(&mut self, do_timing: bool) {
        self.do_timing = do_timing;
    }

    pub fn solver_params(&self) -> SolverParams {
        self.solver.params()
    }

    pub fn set_solver_params(&mut self, params: SolverParams) -> Result<()> {
        self.solver.set_params(params)
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn solver(&self) -> &S {
        &self.solver
    }

    /// Add a preprocessor to the end of the pipeline
    pub fn preprocess<P: Preprocessor + 'static>(&mut self, preprocessor: P) -> &mut Self {
        self.preprocessors.push(Arc::new(preprocessor));
        self
    }

    pub(crate) fn push_preprocessor(&mut self, preprocessor: Arc<dyn Preprocessor>) {
        self.preprocessors.push(preprocessor);
    }

    pub fn preprocessors(&self) -> &[Arc<dyn Preprocessor>] {
        &self.preprocessors
    }

    pub fn clear_preprocessors(&mut self) {
        self.preprocessors.clear();
    }

    /// Run the pipeline, refresh weights and normalize if requested
    pub fn preprocess_event(&self, event: &mut Event) {
        for preprocessor in &self.preprocessors {
            preprocessor.apply(event);
        }
        event.ensure_weights();
        if self.norm {
            event.normalize_weights();
        }
    }

    /// Build, preprocess and compare two events; failures become errors
    pub fn evaluate<A, B>(&mut self, a: &A, b: &B) -> Result<f64>
    where
        A: ProtoEvent + ?Sized,
        B: ProtoEvent + ?Sized,
    {
        let mut ev0 = a.to_event()?;
        let mut ev1 = b.to_event()?;
        self.preprocess_event(&mut ev0);
        self.preprocess_event(&mut ev1);
        if !self.external_dists {
            check_dimensions(&ev0, &ev1)?;
        }

        match self.compute(&ev0, &ev1) {
            EmdStatus::Success => Ok(self.emd),
            status => Err(EmdError::Computation(status)),
        }
    }

    /// Compare two already preprocessed events.
    ///
    /// Non-empty events of different particle dimension are `Infeasible`.
    pub fn compute(&mut self, ev0: &Event, ev1: &Event) -> EmdStatus {
        let start = self.do_timing.then(Instant::now);

        if !self.external_dists && check_dimensions(ev0, ev1).is_err() {
            self.n0 = 0;
            self.n1 = 0;
            self.extra = ExtraParticle::Neither;
            self.status = EmdStatus::Infeasible;
            self.emd = 0.0;
            return self.status;
        }

        let (ws0, ws1) = (ev0.weights(), ev1.weights());
        let (total0, total1) = (ev0.total_weight(), ev1.total_weight());
        self.n0 = ws0.len();
        self.n1 = ws1.len();
        self.weight_diff = total1 - total0;

        let weights = self.solver.weights_mut();
        weights.clear();
        weights.extend_from_slice(ws0);

        if self.norm || self.external_dists || self.weight_diff == 0.0 {
            self.extra = ExtraParticle::Neither;
            weights.extend_from_slice(ws1);
        } else if self.weight_diff > 0.0 {
            self.extra = ExtraParticle::Zero;
            self.n0 += 1;
            weights.push(self.weight_diff);
            weights.extend_from_slice(ws1);
        } else {
            self.extra = ExtraParticle::One;
            self.n1 += 1;
            weights.extend_from_slice(ws1);
            weights.push(-self.weight_diff);
        }

        if self.norm {
            self.scale = 1.0;
        } else {
            let scale = total0.max(total1);
            self.scale = if scale > 0.0 { scale } else { 1.0 };
            for w in weights.iter_mut() {
                *w /= self.scale;
            }
        }

        if !self.external_dists {
            let dists = self.solver.dists_mut();
            dists.clear();
            dists.resize(self.n0 * self.n1, 0.0);
            self.kernel
                .fill_distances(ev0.particles(), ev1.particles(), dists, self.extra);
        }

        self.status = self.solver.compute(self.n0, self.n1);
        self.emd = self.solver.total_cost();
        if self.status.is_success() && !self.norm {
            self.emd *= self.scale;
        }

        if let Some(start) = start {
            self.duration = start.elapsed().as_secs_f64();
        }

        self.status
    }

    /// EMD value of the last computation
    pub fn emd(&self) -> f64 {
        self.emd
    }

    pub fn status(&self) -> EmdStatus {
        self.status
    }

    /// Particle count of event zero, including a synthetic particle
    pub fn n0(&self) -> usize {
        self.n0
    }

    /// Particle count of event one, including a synthetic particle
    pub fn n1(&self) -> usize {
        self.n1
    }

    pub fn extra(&self) -> ExtraParticle {
        self.extra
    }

    /// Total weight of event one minus that of event zero
    pub fn weight_diff(&self) -> f64 {
        self.weight_diff
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Seconds spent in the last timed computation
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Ground distances of the last computation, in units of `R^β`
    pub fn dists(&self) -> Vec<f64> {
        self.solver
            .dists()
            .iter()
            .take(self.n0 * self.n1)
            .copied()
            .collect()
    }

    pub fn ground_dists(&self) -> &[f64] {
        self.solver.dists()
    }

    /// Buffer to fill when ground distances are external
    pub fn ground_dists_mut(&mut self) -> &mut Vec<f64> {
        self.solver.dists_mut()
    }

    /// All flows, row-major, in the original weight units
    pub fn flows(&self) -> Vec<f64> {
        self.solver
            .flows()
            .iter()
            .take(self.n0 * self.n1)
            .map(|f| f * self.scale)
            .collect()
    }

    /// Flows as an `(n0, n1)` matrix in the original weight units
    pub fn flows_matrix(&self) -> DMatrix<f64> {
        let flows = self.flows();
        if flows.len() < self.n0 * self.n1 {
            return DMatrix::zeros(self.n0, self.n1);
        }
        DMatrix::from_row_slice(self.n0, self.n1, &flows)
    }

    /// Flow between particle `i` of event zero and `j` of event one.
    ///
    /// Negative indices count from the end.
    pub fn flow(&self, i: isize, j: isize) -> Result<f64> {
        let (ri, rj) = resolve_index("Emd::flow", i, j, self.n0, self.n1)?;
        Ok(self
            .solver
            .flows()
            .get(ri * self.n1 + rj)
            .map_or(0.0, |f| f * self.scale))
    }

    /// Release solver scratch memory and drop all preprocessors
    pub fn clear(&mut self) {
        self.preprocessors.clear();
        self.solver.free();
    }

    /// Release solver scratch memory
    pub fn free_buffers(&mut self) {
        self.solver.free();
    }

    pub fn description(&self, write_preprocessors: bool) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "EMD");
        let _ = writeln!(out, "    norm - {}", self.norm);
        let _ = writeln!(out, "    external_dists - {}", self.external_dists);
        out.push('\n');
        out.push_str(&self.kernel.description());
        out.push_str(&self.solver.description());
        if write_preprocessors {
            out.push_str(&self.preprocessors_description());
        }
        out
    }

    pub(crate) fn preprocessors_description(&self) -> String {
        let mut out = String::from("\n  Preprocessors:\n");
        for preprocessor in &self.preprocessors {
            let _ = writeln!(out, "    - {}", preprocessor.description());
        }
        out
    }
}

/// Particles of two non-empty events must share a dimension
pub(crate) fn check_dimensions(ev0: &Event, ev1: &Event) -> Result<()> {
    if !ev0.is_empty() && !ev1.is_empty() && ev0.dim() != ev1.dim() {
        return Err(EmdError::MismatchedDimensions {
            dim0: ev0.dim(),
            dim1: ev1.dim(),
        });
    }
    Ok(())
}

/// Resolve possibly negative indices against a `(rows, cols)` shape
pub(crate) fn resolve_index(
    what: &'static str,
    i: isize,
    j: isize,
    rows: usize,
    cols: usize,
) -> Result<(usize, usize)> {
    let ri = if i < 0 { i + rows as isize } else { i };
    let rj = if j < 0 { j + cols as isize } else { j };

    if ri < 0 || rj < 0 || ri as usize >= rows || rj as usize >= cols {
        return Err(EmdError::IndexOutOfRange {
            what,
            i,
            j,
            rows,
            cols,
        });
    }
    Ok((ri as usize, rj as usize))
}
