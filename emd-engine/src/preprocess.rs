//! Event preprocessing pipeline.
//!
//! Preprocessors run in insertion order on every event before it reaches
//! the transport solver. They are shared between the per-worker engines of
//! a pairwise computation, so they must be `Send + Sync` and act on the
//! event only through `&self`.

use crate::event::Event;
use std::fmt;

/// A transformation applied to one event in place.
pub trait Preprocessor: Send + Sync + fmt::Debug {
    /// Mutate the event
    fn apply(&self, event: &mut Event);

    /// One-line human-readable description
    fn description(&self) -> String;
}

/// Translate particles so the weighted centroid sits at the origin.
#[derive(Debug, Clone, Copy, Default)]
pub struct CenterWeightedCentroid;

impl Preprocessor for CenterWeightedCentroid {
    fn apply(&self, event: &mut Event) {
        let Some(centroid) = event.weighted_centroid() else {
            return;
        };

        let particles = event.particles_mut();
        for mut row in particles.row_iter_mut() {
            for (x, c) in row.iter_mut().zip(centroid.iter()) {
                *x -= c;
            }
        }
    }

    fn description(&self) -> String {
        "Centering events using their weighted centroid".to_string()
    }
}

/// Drop particles farther than `radius` from the weighted centroid.
#[derive(Debug, Clone, Copy)]
pub struct MaskCircle {
    radius: f64,
}

impl MaskCircle {
    pub fn new(radius: f64) -> Self {
        Self { radius }
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }
}

impl Preprocessor for MaskCircle {
    fn apply(&self, event: &mut Event) {
        let Some(centroid) = event.weighted_centroid() else {
            return;
        };

        let r2 = self.radius * self.radius;
        event.retain(|_, row| {
            let d2: f64 = row
                .iter()
                .zip(centroid.iter())
                .map(|(x, c)| (x - c) * (x - c))
                .sum();
            d2 <= r2
        });
    }

    fn description(&self) -> String {
        format!("Mask particles farther than {} from the weighted centroid", self.radius)
    }
}
