//! # EMD Engine
//!
//! Energy Mover's Distance between weighted particle events, for a single
//! pair or for every pair of one or two large event collections.
//!
//! ## Theory
//!
//! The EMD is the minimal cost of transporting the weight of one event onto
//! the other, plus a penalty for weight that cannot be matched:
//!
//! ```text
//! EMD(E0, E1) = min_f Σ_ij f_ij (d_ij / R)^β + |Σ E0 − Σ E1|
//! ```
//!
//! The unmatched weight is carried by a synthetic particle added to the
//! lighter event, at distance `1` (in units of `R^β`) from every real one.
//!
//! ## Features
//!
//! - `std` (default): Standard library support
//! - `streaming`: tokio channel handler for async consumers of pairwise results
//!
//! ## Example
//!
//! ```rust
//! use emd_engine::{Emd, EmdConfig, PairwiseConfig, PairwiseEmd};
//!
//! let a = (vec![1.0], vec![vec![0.0]]);
//! let b = (vec![1.0], vec![vec![1.0]]);
//!
//! let mut emd = Emd::new(EmdConfig::default()).unwrap();
//! assert!((emd.evaluate(&a, &b).unwrap() - 1.0).abs() < 1e-12);
//!
//! let mut pairwise = PairwiseEmd::new(PairwiseConfig::default()).unwrap();
//! pairwise.run(&[a, b], &[]).unwrap();
//! println!("{:?}", pairwise.emds_matrix().unwrap());
//! ```

pub mod emd;
pub mod error;
pub mod event;
pub mod handler;
pub mod kernel;
pub mod pairwise;
pub mod preprocess;
pub mod solver;

// Re-exports
pub use emd::{Emd, EmdConfig};
pub use error::*;
pub use event::{Event, ProtoEvent};
pub use handler::{CancelHandle, EmdHandler};
pub use kernel::{
    ExternalDistances, ExtraParticle, GroundDistance, Metric, ParticleDistance,
    EXTRA_PARTICLE_DISTANCE,
};
pub use pairwise::{
    index_symmetric, symmetric_pair, ChunkPolicy, PairwiseConfig, PairwiseEmd, RequestSlot,
    StorageMode, ThreadCount,
};
pub use preprocess::{CenterWeightedCentroid, MaskCircle, Preprocessor};
pub use solver::{EmdStatus, ShortestPathSolver, SolverParams, TransportSolver};

#[cfg(feature = "streaming")]
pub use handler::{ChannelHandler, PairRecord};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
