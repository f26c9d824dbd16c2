//! Events - weighted collections of particles.
//!
//! An event holds one weight per particle and a particle coordinate matrix
//! with one row per particle. The total weight is cached and refreshed by
//! [`Event::ensure_weights`] whenever the weights were handed out mutably.

use crate::error::{EmdError, Result};
use nalgebra::{DMatrix, DVector};

/// A weighted point set.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    weights: Vec<f64>,
    particles: DMatrix<f64>,
    total_weight: f64,
    event_weight: f64,
    stale: bool,
}

impl Event {
    /// Create an event from per-particle weights and a `(n, dim)` coordinate matrix
    pub fn new(weights: Vec<f64>, particles: DMatrix<f64>) -> Result<Self> {
        if weights.len() != particles.nrows() {
            return Err(EmdError::MismatchedParticles {
                weights: weights.len(),
                particles: particles.nrows(),
            });
        }

        let total_weight = weights.iter().sum();
        Ok(Self {
            weights,
            particles,
            total_weight,
            event_weight: 1.0,
            stale: false,
        })
    }

    /// Create an event from per-particle coordinate rows
    pub fn from_coords(weights: Vec<f64>, coords: &[Vec<f64>]) -> Result<Self> {
        let dim = coords.first().map_or(0, Vec::len);
        if let Some(bad) = coords.iter().find(|c| c.len() != dim) {
            return Err(EmdError::InvalidParameter(format!(
                "particle dimension {} does not match {}",
                bad.len(),
                dim
            )));
        }

        let particles = DMatrix::from_fn(coords.len(), dim, |i, k| coords[i][k]);
        Self::new(weights, particles)
    }

    /// Set the event-level weight handed to external handlers
    pub fn with_event_weight(mut self, event_weight: f64) -> Self {
        self.event_weight = event_weight;
        self
    }

    /// Per-particle weights
    #[inline]
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Mutable weights; the total is refreshed by the next `ensure_weights`
    pub fn weights_mut(&mut self) -> &mut [f64] {
        self.stale = true;
        &mut self.weights
    }

    /// Particle coordinates, one row per particle
    #[inline]
    pub fn particles(&self) -> &DMatrix<f64> {
        &self.particles
    }

    /// Mutable particle coordinates
    pub fn particles_mut(&mut self) -> &mut DMatrix<f64> {
        &mut self.particles
    }

    /// Sum of particle weights
    pub fn total_weight(&self) -> f64 {
        if self.stale {
            self.weights.iter().sum()
        } else {
            self.total_weight
        }
    }

    /// Event-level weight (defaults to 1)
    #[inline]
    pub fn event_weight(&self) -> f64 {
        self.event_weight
    }

    pub fn set_event_weight(&mut self, event_weight: f64) {
        self.event_weight = event_weight;
    }

    /// Number of particles
    #[inline]
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Dimension of the particle coordinates
    #[inline]
    pub fn dim(&self) -> usize {
        self.particles.ncols()
    }

    /// Guarantee that the cached total weight agrees with the weights
    pub fn ensure_weights(&mut self) {
        if self.stale {
            self.total_weight = self.weights.iter().sum();
            self.stale = false;
        }
    }

    /// Scale weights so that they sum to one.
    ///
    /// A zero total leaves non-finite weights behind, which the transport
    /// solver reports as infeasible.
    pub fn normalize_weights(&mut self) {
        self.ensure_weights();
        let total = self.total_weight;
        for w in self.weights.iter_mut() {
            *w /= total;
        }
        self.total_weight = 1.0;
    }

    /// Weighted centroid of the particles, `None` for zero total weight
    pub fn weighted_centroid(&self) -> Option<DVector<f64>> {
        let total = self.total_weight();
        if total == 0.0 || self.particles.ncols() == 0 {
            return None;
        }

        let w = DVector::from_column_slice(&self.weights);
        Some(self.particles.tr_mul(&w) / total)
    }

    /// Keep only the particles for which `keep` returns true
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(usize, &[f64]) -> bool,
    {
        let mut dropped = Vec::new();
        let mut row = Vec::with_capacity(self.dim());
        for i in 0..self.len() {
            row.clear();
            row.extend(self.particles.row(i).iter().copied());
            if !keep(i, &row) {
                dropped.push(i);
            }
        }

        if dropped.is_empty() {
            return;
        }

        let particles = std::mem::replace(&mut self.particles, DMatrix::zeros(0, 0));
        self.particles = particles.remove_rows_at(&dropped);

        let mut idx = 0;
        self.weights.retain(|_| {
            let keep = dropped.binary_search(&idx).is_err();
            idx += 1;
            keep
        });
        self.stale = true;
        self.ensure_weights();
    }
}

/// Anything an [`Event`] can be built from.
pub trait ProtoEvent {
    fn to_event(&self) -> Result<Event>;
}

impl ProtoEvent for Event {
    fn to_event(&self) -> Result<Event> {
        Ok(self.clone())
    }
}

impl ProtoEvent for (Vec<f64>, DMatrix<f64>) {
    fn to_event(&self) -> Result<Event> {
        Event::new(self.0.clone(), self.1.clone())
    }
}

impl ProtoEvent for (Vec<f64>, Vec<Vec<f64>>) {
    fn to_event(&self) -> Result<Event> {
        Event::from_coords(self.0.clone(), &self.1)
    }
}
