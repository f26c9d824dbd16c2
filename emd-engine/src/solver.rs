//! Balanced transportation problem solvers.
//!
//! A [`TransportSolver`] owns three scratch buffers that the EMD engine
//! fills before calling [`TransportSolver::compute`]:
//!
//! - `weights`: `n0` supplies followed by `n1` demands
//! - `dists`: `n0 * n1` ground distances, row-major
//! - `flows`: written by the solver, same layout as `dists`
//!
//! The bundled [`ShortestPathSolver`] runs successive shortest paths with
//! node potentials over the dense bipartite graph.
//!
//! ```text
//! min Σ_ij d_ij f_ij   s.t.   Σ_j f_ij = w_i,   Σ_i f_ij = w_{n0+j},   f_ij >= 0
//! ```

use crate::error::{EmdError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a transport computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EmdStatus {
    Success = 0,
    Empty = 1,
    SupplyMismatch = 2,
    Unbounded = 3,
    MaxIterReached = 4,
    Infeasible = 5,
}

impl EmdStatus {
    /// Numeric status code
    #[inline]
    pub fn code(&self) -> u8 {
        *self as u8
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        *self == EmdStatus::Success
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EmdStatus::Success => "Success",
            EmdStatus::Empty => "Empty",
            EmdStatus::SupplyMismatch => "SupplyMismatch",
            EmdStatus::Unbounded => "Unbounded",
            EmdStatus::MaxIterReached => "MaxIterReached",
            EmdStatus::Infeasible => "Infeasible",
        }
    }
}

impl fmt::Display for EmdStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

/// Solver tuning parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverParams {
    /// Maximum number of augmenting iterations
    pub n_iter_max: usize,

    /// Multiple of machine epsilon tolerated between total supply and demand
    pub epsilon_large_factor: f64,

    /// Multiple of machine epsilon below which a quantity counts as zero
    pub epsilon_small_factor: f64,
}

impl Default for SolverParams {
    fn default() -> Self {
        Self {
            n_iter_max: 100_000,
            epsilon_large_factor: 10_000.0,
            epsilon_small_factor: 1.0,
        }
    }
}

impl SolverParams {
    pub fn validate(&self) -> Result<()> {
        if self.n_iter_max == 0 {
            return Err(EmdError::InvalidParameter(
                "n_iter_max must be positive".to_string(),
            ));
        }
        for (name, v) in [
            ("epsilon_large_factor", self.epsilon_large_factor),
            ("epsilon_small_factor", self.epsilon_small_factor),
        ] {
            if !(v.is_finite() && v > 0.0) {
                return Err(EmdError::InvalidParameter(format!(
                    "{} must be positive, got {}",
                    name, v
                )));
            }
        }
        Ok(())
    }

    /// `(epsilon_large, epsilon_small)` in absolute units
    #[inline]
    pub fn epsilons(&self) -> (f64, f64) {
        (
            self.epsilon_large_factor * f64::EPSILON,
            self.epsilon_small_factor * f64::EPSILON,
        )
    }
}

/// Solver for balanced transportation problems.
pub trait TransportSolver: Clone + Send {
    /// Solve for `n0` supplies and `n1` demands held in the buffers
    fn compute(&mut self, n0: usize, n1: usize) -> EmdStatus;

    /// Cost of the last solution, in the units of the buffers
    fn total_cost(&self) -> f64;

    fn weights_mut(&mut self) -> &mut Vec<f64>;
    fn dists(&self) -> &[f64];
    fn dists_mut(&mut self) -> &mut Vec<f64>;
    fn flows(&self) -> &[f64];

    fn params(&self) -> SolverParams;
    fn set_params(&mut self, params: SolverParams) -> Result<()>;

    /// Release scratch memory
    fn free(&mut self);

    fn description(&self) -> String;
}

/// Successive shortest path solver with Dijkstra and node potentials.
#[derive(Debug, Clone, Default)]
pub struct ShortestPathSolver {
    params: SolverParams,
    weights: Vec<f64>,
    dists: Vec<f64>,
    flows: Vec<f64>,
    total_cost: f64,
    iterations: usize,

    // scratch
    supply: Vec<f64>,
    demand: Vec<f64>,
    potential: Vec<f64>,
    distance: Vec<f64>,
    prev: Vec<usize>,
    visited: Vec<bool>,
}

const NONE: usize = usize::MAX;

impl ShortestPathSolver {
    pub fn new(params: SolverParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            params,
            ..Default::default()
        })
    }

    /// Augmenting iterations used by the last computation
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    fn validate_buffers(&self, n0: usize, n1: usize) -> EmdStatus {
        let n = n0 + n1;
        if self.weights.len() < n || self.dists.len() < n0 * n1 {
            return EmdStatus::Infeasible;
        }
        if self.weights[..n].iter().any(|w| !w.is_finite() || *w < 0.0)
            || self.dists[..n0 * n1].iter().any(|d| !d.is_finite() || *d < 0.0)
        {
            return EmdStatus::Infeasible;
        }

        let (eps_large, _) = self.params.epsilons();
        let supply: f64 = self.weights[..n0].iter().sum();
        let demand: f64 = self.weights[n0..n].iter().sum();
        if !((supply - demand).abs() <= eps_large) {
            return EmdStatus::SupplyMismatch;
        }

        EmdStatus::Success
    }

    /// Shortest path from the super source to the super sink over the
    /// residual graph, in reduced costs. Returns false if the sink is
    /// unreachable.
    fn dijkstra(&mut self, n0: usize, n1: usize, eps: f64) -> bool {
        let (source, sink) = (n0 + n1, n0 + n1 + 1);
        let nodes = n0 + n1 + 2;

        self.distance.clear();
        self.distance.resize(nodes, f64::INFINITY);
        self.prev.clear();
        self.prev.resize(nodes, NONE);
        self.visited.clear();
        self.visited.resize(nodes, false);
        self.distance[source] = 0.0;

        loop {
            let mut u = NONE;
            let mut best = f64::INFINITY;
            for v in 0..nodes {
                if !self.visited[v] && self.distance[v] < best {
                    best = self.distance[v];
                    u = v;
                }
            }
            if u == NONE {
                return false;
            }
            self.visited[u] = true;
            if u == sink {
                return true;
            }

            if u == source {
                for i in 0..n0 {
                    if self.supply[i] > eps {
                        let rc = self.potential[source] - self.potential[i];
                        self.relax(u, i, rc);
                    }
                }
            } else if u < n0 {
                for j in 0..n1 {
                    let rc = self.dists[u * n1 + j] + self.potential[u] - self.potential[n0 + j];
                    self.relax(u, n0 + j, rc);
                }
            } else {
                let j = u - n0;
                if self.demand[j] > eps {
                    let rc = self.potential[u] - self.potential[sink];
                    self.relax(u, sink, rc);
                }
                for i in 0..n0 {
                    if self.flows[i * n1 + j] > eps {
                        let rc = self.potential[u] - self.potential[i] - self.dists[i * n1 + j];
                        self.relax(u, i, rc);
                    }
                }
            }
        }
    }

    #[inline]
    fn relax(&mut self, u: usize, v: usize, reduced_cost: f64) {
        if self.visited[v] {
            return;
        }
        // rounding can push reduced costs slightly below zero
        let d = self.distance[u] + reduced_cost.max(0.0);
        if d < self.distance[v] {
            self.distance[v] = d;
            self.prev[v] = u;
        }
    }

    /// Push flow along the path found by the last `dijkstra`
    fn augment(&mut self, n0: usize, n1: usize) {
        let (source, sink) = (n0 + n1, n0 + n1 + 1);

        let last = self.prev[sink];
        let mut delta = self.demand[last - n0];
        let mut v = last;
        let first = loop {
            let u = self.prev[v];
            if u == source {
                delta = delta.min(self.supply[v]);
                break v;
            }
            if v < n0 {
                // sink u -> source v runs against existing flow
                delta = delta.min(self.flows[v * n1 + (u - n0)]);
            }
            v = u;
        };

        let mut v = last;
        while v != first {
            let u = self.prev[v];
            if v < n0 {
                self.flows[v * n1 + (u - n0)] -= delta;
            } else {
                self.flows[u * n1 + (v - n0)] += delta;
            }
            v = u;
        }

        self.supply[first] -= delta;
        self.demand[last - n0] -= delta;
    }
}

impl TransportSolver for ShortestPathSolver {
    fn compute(&mut self, n0: usize, n1: usize) -> EmdStatus {
        self.total_cost = 0.0;
        self.iterations = 0;
        self.flows.clear();
        self.flows.resize(n0 * n1, 0.0);

        if n0 == 0 || n1 == 0 {
            return EmdStatus::Empty;
        }

        let status = self.validate_buffers(n0, n1);
        if !status.is_success() {
            return status;
        }

        let n = n0 + n1;
        let (_, eps) = self.params.epsilons();
        self.supply.clear();
        self.supply.extend_from_slice(&self.weights[..n0]);
        self.demand.clear();
        self.demand.extend_from_slice(&self.weights[n0..n]);
        self.potential.clear();
        self.potential.resize(n + 2, 0.0);

        loop {
            if !self.supply.iter().any(|&s| s > eps) || !self.demand.iter().any(|&d| d > eps) {
                break;
            }
            if self.iterations >= self.params.n_iter_max {
                return EmdStatus::MaxIterReached;
            }
            self.iterations += 1;

            if !self.dijkstra(n0, n1, eps) {
                return EmdStatus::Infeasible;
            }

            let d_sink = self.distance[n + 1];
            for (p, d) in self.potential.iter_mut().zip(self.distance.iter()) {
                *p += d.min(d_sink);
            }

            self.augment(n0, n1);
        }

        self.total_cost = self
            .flows
            .iter()
            .zip(self.dists[..n0 * n1].iter())
            .map(|(f, d)| f * d)
            .sum();

        EmdStatus::Success
    }

    fn total_cost(&self) -> f64 {
        self.total_cost
    }

    fn weights_mut(&mut self) -> &mut Vec<f64> {
        &mut self.weights
    }

    fn dists(&self) -> &[f64] {
        &self.dists
    }

    fn dists_mut(&mut self) -> &mut Vec<f64> {
        &mut self.dists
    }

    fn flows(&self) -> &[f64] {
        &self.flows
    }

    fn params(&self) -> SolverParams {
        self.params
    }

    fn set_params(&mut self, params: SolverParams) -> Result<()> {
        params.validate()?;
        self.params = params;
        Ok(())
    }

    fn free(&mut self) {
        *self = Self {
            params: self.params,
            ..Default::default()
        };
    }

    fn description(&self) -> String {
        format!(
            "  ShortestPathSolver\n    n_iter_max - {}\n    epsilon_large_factor - {}\n    \
             epsilon_small_factor - {}\n",
            self.params.n_iter_max,
            self.params.epsilon_large_factor,
            self.params.epsilon_small_factor
        )
    }
}
