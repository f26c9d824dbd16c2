//! Sinks for pairwise results and batch cancellation.
//!
//! A handler receives every successful `(emd, weight_a * weight_b)` pair of a
//! batch instead of matrix storage. Calls come from the worker threads in
//! no particular order within a chunk, so handlers take `&self` and keep
//! any state behind their own synchronization.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// External consumer of pairwise EMD values
pub trait EmdHandler: Send + Sync {
    /// Receive one distance and the product of the two event weights
    fn apply(&self, emd: f64, weight: f64);

    fn description(&self) -> String;
}

impl fmt::Debug for dyn EmdHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmdHandler")
            .field("description", &self.description())
            .finish()
    }
}

/// Shared flag that stops a running batch at the next chunk boundary.
///
/// The flag is cleared when a batch starts. Cancel from a handler or from
/// another thread while the batch runs; an earlier cancellation is dropped.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub(crate) fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(feature = "streaming")]
pub use channel::{ChannelHandler, PairRecord};

#[cfg(feature = "streaming")]
mod channel {
    use super::EmdHandler;
    use serde::{Deserialize, Serialize};
    use tokio::sync::mpsc;

    /// One result forwarded by [`ChannelHandler`]
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct PairRecord {
        pub emd: f64,
        pub weight: f64,
    }

    /// Forwards results to an async consumer over an unbounded channel
    #[derive(Debug, Clone)]
    pub struct ChannelHandler {
        sender: mpsc::UnboundedSender<PairRecord>,
    }

    impl ChannelHandler {
        pub fn new(sender: mpsc::UnboundedSender<PairRecord>) -> Self {
            Self { sender }
        }

        pub fn create_pair() -> (Self, mpsc::UnboundedReceiver<PairRecord>) {
            let (sender, receiver) = mpsc::unbounded_channel();
            (Self::new(sender), receiver)
        }
    }

    impl EmdHandler for ChannelHandler {
        fn apply(&self, emd: f64, weight: f64) {
            if self.sender.send(PairRecord { emd, weight }).is_err() {
                tracing::debug!("channel handler receiver dropped, discarding result");
            }
        }

        fn description(&self) -> String {
            "ChannelHandler - forwarding (emd, weight) records".to_string()
        }
    }
}
