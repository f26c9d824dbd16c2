//! Ground distances between particles.
//!
//! A [`GroundDistance`] fills the `n0 * n1` cost matrix (row-major, event
//! zero along rows) that the transport solver consumes. When one side got a
//! synthetic particle to balance the total weight, the kernel also fills
//! that particle's row or column.
//!
//! The bundled [`ParticleDistance`] computes `(|a - b| / R)^beta` and puts
//! the synthetic particle at distance `1` from everything, i.e. `R^beta` in
//! unscaled units.

use crate::error::{EmdError, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Which event received the synthetic particle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExtraParticle {
    #[default]
    Neither,
    Zero,
    One,
}

/// Distance to and from the synthetic particle.
pub const EXTRA_PARTICLE_DISTANCE: f64 = 1.0;

/// Fills ground-distance matrices for pairs of particle collections.
pub trait GroundDistance: Clone + Send + Sync {
    fn r(&self) -> f64;
    fn beta(&self) -> f64;
    fn set_r(&mut self, r: f64) -> Result<()>;
    fn set_beta(&mut self, beta: f64) -> Result<()>;

    /// Write distances for `a` (rows) against `b` (columns) into `out`.
    ///
    /// `out` has room for the particle counts plus the synthetic particle
    /// named by `extra`.
    fn fill_distances(
        &self,
        a: &DMatrix<f64>,
        b: &DMatrix<f64>,
        out: &mut [f64],
        extra: ExtraParticle,
    );

    fn description(&self) -> String;

    /// True when the caller supplies ground distances directly
    fn is_external(&self) -> bool {
        false
    }
}

pub(crate) fn check_r(r: f64) -> Result<()> {
    if !(r.is_finite() && r > 0.0) {
        return Err(EmdError::InvalidParameter(format!("R must be positive, got {}", r)));
    }
    Ok(())
}

pub(crate) fn check_beta(beta: f64) -> Result<()> {
    if !(beta.is_finite() && beta > 0.0) {
        return Err(EmdError::InvalidParameter(format!(
            "beta must be positive, got {}",
            beta
        )));
    }
    Ok(())
}

/// Norm used by [`ParticleDistance`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Metric {
    #[default]
    Euclidean,
    Cityblock,
}

/// `(|a - b| / R)^beta` between particle coordinate rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticleDistance {
    metric: Metric,
    r: f64,
    beta: f64,
}

impl ParticleDistance {
    pub fn new(metric: Metric, r: f64, beta: f64) -> Result<Self> {
        check_r(r)?;
        check_beta(beta)?;
        Ok(Self { metric, r, beta })
    }

    pub fn euclidean(r: f64, beta: f64) -> Result<Self> {
        Self::new(Metric::Euclidean, r, beta)
    }

    pub fn cityblock(r: f64, beta: f64) -> Result<Self> {
        Self::new(Metric::Cityblock, r, beta)
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Distance between two coordinate rows
    pub fn distance(&self, a: &DMatrix<f64>, i: usize, b: &DMatrix<f64>, j: usize) -> f64 {
        let (ra, rb) = (a.row(i), b.row(j));
        let pairs = ra.iter().zip(rb.iter()).map(|(x, y)| x - y);
        let d = match self.metric {
            Metric::Euclidean => {
                let d2: f64 = pairs.map(|d| d * d).sum::<f64>() / (self.r * self.r);
                // beta = 2 skips the square root
                if self.beta == 2.0 {
                    return d2;
                }
                d2.sqrt()
            }
            Metric::Cityblock => pairs.map(f64::abs).sum::<f64>() / self.r,
        };

        if self.beta == 1.0 {
            d
        } else {
            d.powf(self.beta)
        }
    }
}

impl Default for ParticleDistance {
    fn default() -> Self {
        Self {
            metric: Metric::Euclidean,
            r: 1.0,
            beta: 1.0,
        }
    }
}

impl GroundDistance for ParticleDistance {
    fn r(&self) -> f64 {
        self.r
    }

    fn beta(&self) -> f64 {
        self.beta
    }

    fn set_r(&mut self, r: f64) -> Result<()> {
        check_r(r)?;
        self.r = r;
        Ok(())
    }

    fn set_beta(&mut self, beta: f64) -> Result<()> {
        check_beta(beta)?;
        self.beta = beta;
        Ok(())
    }

    fn fill_distances(
        &self,
        a: &DMatrix<f64>,
        b: &DMatrix<f64>,
        out: &mut [f64],
        extra: ExtraParticle,
    ) {
        let (na, nb) = (a.nrows(), b.nrows());
        let ncols = if extra == ExtraParticle::One { nb + 1 } else { nb };

        for i in 0..na {
            let row = &mut out[i * ncols..(i + 1) * ncols];
            for j in 0..nb {
                row[j] = self.distance(a, i, b, j);
            }
            if extra == ExtraParticle::One {
                row[nb] = EXTRA_PARTICLE_DISTANCE;
            }
        }

        if extra == ExtraParticle::Zero {
            out[na * ncols..(na + 1) * ncols].fill(EXTRA_PARTICLE_DISTANCE);
        }
    }

    fn description(&self) -> String {
        let metric = match self.metric {
            Metric::Euclidean => "Euclidean",
            Metric::Cityblock => "Cityblock",
        };
        format!(
            "  {} particle distance\n    R - {}\n    beta - {}\n",
            metric, self.r, self.beta
        )
    }
}

/// Placeholder kernel for ground distances filled in by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExternalDistances {
    r: f64,
    beta: f64,
}

impl Default for ExternalDistances {
    fn default() -> Self {
        Self { r: 1.0, beta: 1.0 }
    }
}

impl GroundDistance for ExternalDistances {
    fn r(&self) -> f64 {
        self.r
    }

    fn beta(&self) -> f64 {
        self.beta
    }

    fn set_r(&mut self, r: f64) -> Result<()> {
        check_r(r)?;
        self.r = r;
        Ok(())
    }

    fn set_beta(&mut self, beta: f64) -> Result<()> {
        check_beta(beta)?;
        self.beta = beta;
        Ok(())
    }

    fn fill_distances(&self, _: &DMatrix<f64>, _: &DMatrix<f64>, _: &mut [f64], _: ExtraParticle) {}

    fn description(&self) -> String {
        "  Externally provided ground distances\n".to_string()
    }

    fn is_external(&self) -> bool {
        true
    }
}
