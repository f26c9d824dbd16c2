//! Pairwise EMDs over one or two collections of events.
//!
//! [`PairwiseEmd`] owns one single-pair engine per worker thread and a
//! fixed rayon pool. A batch is walked in chunks of the global pair index
//! space; inside a chunk, workers claim small blocks of pairs from a shared
//! cursor so that large events do not stall a static split. After every
//! chunk the coordinating thread stores results, reports progress and
//! checks for cancellation.
//!
//! # Storage
//!
//! | mode                 | layout                                   |
//! |----------------------|------------------------------------------|
//! | `FlattenedSymmetric` | strict upper triangle, squareform order  |
//! | `FullSymmetric`      | `n * n`, row-major, mirrored             |
//! | `Full`               | `nev_a * nev_b`, row-major               |
//! | `External`           | nothing stored, results go to a handler  |

use crate::emd::{check_dimensions, resolve_index, Emd, EmdConfig};
use crate::error::{EmdError, Result};
use crate::event::{Event, ProtoEvent};
use crate::handler::{CancelHandle, EmdHandler};
use crate::kernel::{GroundDistance, ParticleDistance};
use crate::preprocess::Preprocessor;
use crate::solver::{ShortestPathSolver, SolverParams, TransportSolver};
use nalgebra::DMatrix;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Number of worker threads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ThreadCount {
    /// Use the hardware concurrency
    #[default]
    Auto,
    /// Use this many threads, capped at the hardware concurrency
    Fixed(usize),
}

impl ThreadCount {
    /// `<= 0` means autodetect
    pub fn from_raw(raw: i64) -> Self {
        if raw <= 0 {
            ThreadCount::Auto
        } else {
            ThreadCount::Fixed(raw as usize)
        }
    }

    pub fn to_raw(self) -> i64 {
        match self {
            ThreadCount::Auto => -1,
            ThreadCount::Fixed(n) => n as i64,
        }
    }

    pub fn resolve(self) -> usize {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        match self {
            ThreadCount::Auto => available,
            ThreadCount::Fixed(n) => n.clamp(1, available),
        }
    }
}

/// How a batch is split into chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkPolicy {
    /// Chunks of this many pairs
    Size(usize),
    /// This many roughly equal chunks
    Count(usize),
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        ChunkPolicy::Count(10)
    }
}

impl ChunkPolicy {
    /// Positive is a chunk size, negative a chunk count, zero a single chunk
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            r if r > 0 => ChunkPolicy::Size(r as usize),
            0 => ChunkPolicy::Count(1),
            r => ChunkPolicy::Count(r.unsigned_abs() as usize),
        }
    }

    pub fn to_raw(self) -> i64 {
        match self {
            ChunkPolicy::Size(n) => n as i64,
            ChunkPolicy::Count(n) => -(n as i64),
        }
    }

    /// Pairs per chunk for a batch of `num_pairs`, never zero
    pub fn chunk_size(self, num_pairs: usize) -> usize {
        match self {
            ChunkPolicy::Size(n) => n.max(1),
            ChunkPolicy::Count(n) => num_pairs.div_ceil(n.max(1)).max(1),
        }
    }
}

/// Where batch results go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageMode {
    External,
    Full,
    FullSymmetric,
    FlattenedSymmetric,
}

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairwiseConfig {
    /// Settings applied to every worker engine
    pub emd: EmdConfig,

    pub num_threads: ThreadCount,

    pub chunking: ChunkPolicy,

    /// Report progress after every chunk
    pub verbose: bool,

    /// Store a self-set as its strict upper triangle
    pub store_sym_emds_flattened: bool,

    /// Fail the batch after the chunk in which a pair failed
    pub throw_on_error: bool,

    /// Pairs claimed by a worker at a time
    pub block_size: usize,
}

impl Default for PairwiseConfig {
    fn default() -> Self {
        Self {
            emd: EmdConfig::default(),
            num_threads: ThreadCount::Auto,
            chunking: ChunkPolicy::default(),
            verbose: true,
            store_sym_emds_flattened: true,
            throw_on_error: false,
            block_size: 10,
        }
    }
}

impl PairwiseConfig {
    pub fn validate(&self) -> Result<()> {
        self.emd.validate()?;
        if self.block_size == 0 {
            return Err(EmdError::InvalidParameter(
                "block_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Position of `(i, j)` in squareform storage of an `n`-event self-set.
///
/// `None` on the diagonal or out of range.
pub fn index_symmetric(i: usize, j: usize, n: usize) -> Option<usize> {
    if i == j || i >= n || j >= n {
        return None;
    }
    let (a, b) = if i < j { (i, j) } else { (j, i) };
    let total = n * (n - 1) / 2;
    Some(total - (n - a) * (n - a - 1) / 2 + (b - a - 1))
}

/// Pair scheduled at global index `k` of an `n`-event self-set.
///
/// Folds the lower triangle onto the upper one so that every row of the
/// `k / n` scan has about the same length. Returns `(i, j)` with `i > j`.
pub fn symmetric_pair(k: usize, n: usize) -> (usize, usize) {
    let (mut i, mut j) = (k / n, k % n);
    i += 1;
    if j >= i {
        i = n - i;
        j = n - j - 1;
    }
    (i, j)
}

/// Pair layout of the current batch
#[derive(Debug, Clone, Copy, Default)]
struct PairLayout {
    nev_a: usize,
    nev_b: usize,
    two_sets: bool,
}

impl PairLayout {
    /// Batch indices and event-list positions of the pair at `k`
    fn pair(&self, k: usize) -> ((usize, usize), (usize, usize)) {
        if self.two_sets {
            let (i, j) = (k / self.nev_b, k % self.nev_b);
            ((i, j), (i, self.nev_a + j))
        } else {
            let (i, j) = symmetric_pair(k, self.nev_a);
            ((i, j), (i, j))
        }
    }

    /// Event-list positions for batch indices, negative ones counting from the end
    fn resolve(&self, i: isize, j: isize) -> Result<(usize, usize, usize, usize)> {
        let (ri, rj) = resolve_index("PairwiseEmd::emd", i, j, self.nev_a, self.nev_b)?;
        let offset = if self.two_sets { self.nev_a } else { 0 };
        Ok((ri, rj, ri, offset + rj))
    }
}

fn failure_message(i: usize, j: usize, code: u8) -> String {
    format!(
        "PairwiseEmd::compute - issue with EMD between events ({}, {}), error code {}",
        i, j, code
    )
}

/// Shared, read-only view of a chunk handed to every worker
struct ChunkContext<'a> {
    events: &'a [Event],
    layout: PairLayout,
    end: usize,
    block_size: usize,
    handler: Option<&'a dyn EmdHandler>,
    store: bool,
    errors: &'a Mutex<Vec<String>>,
    cursor: &'a AtomicUsize,
}

impl ChunkContext<'_> {
    /// Claim blocks until the chunk is exhausted; returns values to store
    fn run<K: GroundDistance, S: TransportSolver>(
        &self,
        engine: &mut Emd<K, S>,
    ) -> Vec<(usize, usize, f64)> {
        let mut results = Vec::new();

        loop {
            let begin = self.cursor.fetch_add(self.block_size, Ordering::Relaxed);
            if begin >= self.end {
                break;
            }

            for k in begin..self.end.min(begin + self.block_size) {
                let ((i, j), (a, b)) = self.layout.pair(k);
                let (ev0, ev1) = (&self.events[a], &self.events[b]);

                let status = engine.compute(ev0, ev1);
                if status.is_success() {
                    if let Some(handler) = self.handler {
                        handler.apply(engine.emd(), ev0.event_weight() * ev1.event_weight());
                    } else if self.store {
                        results.push((i, j, engine.emd()));
                    }
                } else {
                    warn!(i, j, code = status.code(), "EMD computation failed");
                    self.errors.lock().push(failure_message(i, j, status.code()));
                    if self.store {
                        results.push((i, j, f64::NAN));
                    }
                }
            }
        }

        results
    }
}

/// One worker engine borrowed for on-demand computations in request mode.
///
/// Slots borrow disjoint engines, so they can be moved to different threads.
pub struct RequestSlot<'a, K = ParticleDistance, S = ShortestPathSolver> {
    engine: &'a mut Emd<K, S>,
    events: &'a [Event],
    layout: PairLayout,
    handler: Option<&'a dyn EmdHandler>,
}

impl<K: GroundDistance, S: TransportSolver> RequestSlot<'_, K, S> {
    /// EMD between event `i` of the first set and `j` of the second
    pub fn emd(&mut self, i: isize, j: isize) -> Result<f64> {
        let (ri, rj, a, b) = self.layout.resolve(i, j)?;
        if !self.layout.two_sets && ri == rj {
            return Ok(0.0);
        }

        let (ev0, ev1) = (&self.events[a], &self.events[b]);
        let status = self.engine.compute(ev0, ev1);
        if !status.is_success() {
            return Err(EmdError::Computation(status));
        }

        let emd = self.engine.emd();
        if let Some(handler) = self.handler {
            handler.apply(emd, ev0.event_weight() * ev1.event_weight());
        }
        Ok(emd)
    }
}

/// Computes EMDs between all pairs of one event set, or across two sets.
pub struct PairwiseEmd<K = ParticleDistance, S = ShortestPathSolver> {
    engines: Vec<Emd<K, S>>,
    pool: rayon::ThreadPool,

    chunking: ChunkPolicy,
    verbose: bool,
    store_sym_emds_flattened: bool,
    throw_on_error: bool,
    block_size: usize,
    request_mode: bool,

    events: Vec<Event>,
    emds: Vec<f64>,
    storage: StorageMode,
    layout: PairLayout,
    num_pairs: usize,
    pairs_done: usize,

    handler: Option<Arc<dyn EmdHandler>>,
    error_messages: Mutex<Vec<String>>,
    cancel: CancelHandle,
    start: Instant,
}

impl PairwiseEmd<ParticleDistance, ShortestPathSolver> {
    /// Euclidean ground distance with the bundled solver
    pub fn new(config: PairwiseConfig) -> Result<Self> {
        let engine = Emd::new(config.emd.clone())?;
        Self::from_engine(config, engine)
    }
}

impl<K: GroundDistance, S: TransportSolver> PairwiseEmd<K, S> {
    /// Replicate `engine` into every worker.
    ///
    /// `config.emd` overrides the engine's `R`, `beta`, `norm` and solver
    /// parameters; the engine's preprocessors are kept.
    pub fn from_engine(config: PairwiseConfig, mut engine: Emd<K, S>) -> Result<Self> {
        config.validate()?;
        if config.emd.external_dists || engine.external_dists() {
            return Err(EmdError::InvalidParameter(
                "pairwise computation requires a ground distance kernel".to_string(),
            ));
        }

        engine.set_r(config.emd.r)?;
        engine.set_beta(config.emd.beta)?;
        engine.set_norm(config.emd.norm);
        engine.set_solver_params(config.emd.solver)?;
        engine.set_do_timing(false);

        let num_threads = config.num_threads.resolve();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("emd-worker-{}", i))
            .build()
            .map_err(|e| EmdError::ThreadPool(e.to_string()))?;
        debug!(num_threads, "built pairwise EMD worker pool");

        Ok(Self {
            engines: vec![engine; num_threads],
            pool,
            chunking: config.chunking,
            verbose: config.verbose,
            store_sym_emds_flattened: config.store_sym_emds_flattened,
            throw_on_error: config.throw_on_error,
            block_size: config.block_size,
            request_mode: false,
            events: Vec::new(),
            emds: Vec::new(),
            storage: if config.store_sym_emds_flattened {
                StorageMode::FlattenedSymmetric
            } else {
                StorageMode::FullSymmetric
            },
            layout: PairLayout::default(),
            num_pairs: 0,
            pairs_done: 0,
            handler: None,
            error_messages: Mutex::new(Vec::new()),
            cancel: CancelHandle::new(),
            start: Instant::now(),
        })
    }

    // parameters, forwarded to every worker

    pub fn r(&self) -> f64 {
        self.engines[0].r()
    }

    pub fn beta(&self) -> f64 {
        self.engines[0].beta()
    }

    pub fn norm(&self) -> bool {
        self.engines[0].norm()
    }

    pub fn set_r(&mut self, r: f64) -> Result<()> {
        self.engines.iter_mut().try_for_each(|e| e.set_r(r))
    }

    pub fn set_beta(&mut self, beta: f64) -> Result<()> {
        self.engines.iter_mut().try_for_each(|e| e.set_beta(beta))
    }

    pub fn set_norm(&mut self, norm: bool) {
        for engine in &mut self.engines {
            engine.set_norm(norm);
        }
    }

    /// Add a preprocessor shared by every worker
    pub fn preprocess<P: Preprocessor + 'static>(&mut self, preprocessor: P) -> &mut Self {
        let shared: Arc<dyn Preprocessor> = Arc::new(preprocessor);
        for engine in &mut self.engines {
            engine.push_preprocessor(Arc::clone(&shared));
        }
        self
    }

    pub fn clear_preprocessors(&mut self) {
        for engine in &mut self.engines {
            engine.clear_preprocessors();
        }
    }

    pub fn solver_params(&self) -> SolverParams {
        self.engines[0].solver_params()
    }

    pub fn set_solver_params(&mut self, params: SolverParams) -> Result<()> {
        params.validate()?;
        self.engines
            .iter_mut()
            .try_for_each(|e| e.set_solver_params(params))
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Pairs claimed by a worker at a time, from the next chunk on
    pub fn set_block_size(&mut self, block_size: usize) -> Result<()> {
        if block_size == 0 {
            return Err(EmdError::InvalidParameter(
                "block_size must be positive".to_string(),
            ));
        }
        self.block_size = block_size;
        Ok(())
    }

    /// Route results to `handler` instead of storage from the next batch on
    pub fn set_handler(&mut self, handler: Arc<dyn EmdHandler>) {
        self.handler = Some(handler);
    }

    pub fn remove_handler(&mut self) -> Option<Arc<dyn EmdHandler>> {
        self.handler.take()
    }

    pub fn handler(&self) -> Option<&Arc<dyn EmdHandler>> {
        self.handler.as_ref()
    }

    /// Leaving request mode allocates storage for the stored events
    pub fn set_request_mode(&mut self, request_mode: bool) {
        let leaving = self.request_mode && !request_mode;
        self.request_mode = request_mode;
        if leaving {
            self.allocate_storage();
        }
    }

    pub fn request_mode(&self) -> bool {
        self.request_mode
    }

    /// Handle that stops the running batch at its next chunk boundary.
    ///
    /// Every batch starts with the flag cleared, so a cancellation issued
    /// before `run`, `run_pair` or `run_events` has no effect.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn num_threads(&self) -> usize {
        self.engines.len()
    }

    pub fn storage(&self) -> StorageMode {
        self.storage
    }

    pub fn nev_a(&self) -> usize {
        self.layout.nev_a
    }

    pub fn nev_b(&self) -> usize {
        self.layout.nev_b
    }

    /// Number of unique pairs in the current batch
    pub fn num_emds(&self) -> usize {
        self.num_pairs
    }

    pub fn pairs_done(&self) -> usize {
        self.pairs_done
    }

    /// Events of the current batch, first set followed by the second
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Seconds since the last batch started
    pub fn duration(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn errored(&self) -> bool {
        !self.error_messages.lock().is_empty()
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.error_messages.lock().clone()
    }

    fn init(&mut self, nev_a: usize, nev_b: Option<usize>) {
        self.layout = PairLayout {
            nev_a,
            nev_b: nev_b.unwrap_or(nev_a),
            two_sets: nev_b.is_some(),
        };
        self.num_pairs = match nev_b {
            Some(nev_b) => nev_a * nev_b,
            None => nev_a * nev_a.saturating_sub(1) / 2,
        };
        self.pairs_done = 0;
        self.events.clear();
        self.cancel.reset();
        self.start = Instant::now();

        if self.request_mode {
            self.storage = StorageMode::External;
            self.emds.clear();
            return;
        }

        self.error_messages.lock().clear();
        self.allocate_storage();
    }

    /// Pick the storage mode for the current layout and zero the storage
    fn allocate_storage(&mut self) {
        let nev_a = self.layout.nev_a;
        self.pairs_done = 0;
        self.storage = if self.handler.is_some() {
            StorageMode::External
        } else if self.layout.two_sets {
            StorageMode::Full
        } else if self.store_sym_emds_flattened {
            StorageMode::FlattenedSymmetric
        } else {
            StorageMode::FullSymmetric
        };

        let len = match self.storage {
            StorageMode::External => 0,
            StorageMode::Full => nev_a * self.layout.nev_b,
            StorageMode::FullSymmetric => nev_a * nev_a,
            StorageMode::FlattenedSymmetric => self.num_pairs,
        };
        self.emds.clear();
        self.emds.resize(len, 0.0);
    }

    /// Build, weight and preprocess events, appending them to the batch
    fn store_proto_events<P: ProtoEvent>(
        &mut self,
        protos: &[P],
        event_weights: &[f64],
    ) -> Result<()> {
        for (k, proto) in protos.iter().enumerate() {
            let mut event = proto.to_event()?;
            if let Some(&w) = event_weights.get(k) {
                event.set_event_weight(w);
            }
            self.engines[0].preprocess_event(&mut event);
            self.events.push(event);
        }
        Ok(())
    }

    /// All pairs of one event set.
    ///
    /// `event_weights` is empty or holds one weight per event. In request
    /// mode the events are only stored for later [`emd`](Self::emd) calls.
    pub fn run<P: ProtoEvent>(&mut self, events: &[P], event_weights: &[f64]) -> Result<()> {
        check_event_weights(events.len(), event_weights)?;

        self.init(events.len(), None);
        self.store_proto_events(events, event_weights)?;
        self.start_batch()
    }

    /// All pairs of already preprocessed events, taken as they are
    pub fn run_events(&mut self, events: Vec<Event>) -> Result<()> {
        self.init(events.len(), None);
        self.events = events;
        self.start_batch()
    }

    /// Already preprocessed events of `events_a` against those of `events_b`
    pub fn run_events_pair(&mut self, events_a: Vec<Event>, events_b: Vec<Event>) -> Result<()> {
        self.init(events_a.len(), Some(events_b.len()));
        self.events = events_a;
        self.events.extend(events_b);
        self.start_batch()
    }

    fn start_batch(&mut self) -> Result<()> {
        let mut events = self.events.iter().filter(|e| !e.is_empty());
        if let Some(first) = events.next() {
            events.try_for_each(|event| check_dimensions(first, event))?;
        }

        if self.request_mode {
            return Ok(());
        }
        self.compute()
    }

    /// Every event of `events_a` against every event of `events_b`
    pub fn run_pair<P: ProtoEvent, Q: ProtoEvent>(
        &mut self,
        events_a: &[P],
        events_b: &[Q],
        event_weights_a: &[f64],
        event_weights_b: &[f64],
    ) -> Result<()> {
        check_event_weights(events_a.len(), event_weights_a)?;
        check_event_weights(events_b.len(), event_weights_b)?;

        self.init(events_a.len(), Some(events_b.len()));
        self.store_proto_events(events_a, event_weights_a)?;
        self.store_proto_events(events_b, event_weights_b)?;
        self.start_batch()
    }

    /// Work through the stored batch, resuming where a cancelled run stopped
    pub fn compute(&mut self) -> Result<()> {
        if self.request_mode {
            return Err(EmdError::RequestMode(
                "compute is unavailable while request mode is enabled",
            ));
        }
        if self.storage == StorageMode::External
            && self.handler.is_none()
            && self.pairs_done < self.num_pairs
        {
            return Err(EmdError::NoStoredDistances(
                "batch has neither storage nor a handler",
            ));
        }

        let chunk_size = self.chunking.chunk_size(self.num_pairs);
        debug!(
            num_pairs = self.num_pairs,
            chunk_size,
            storage = ?self.storage,
            "starting pairwise EMD batch"
        );
        if self.verbose && self.pairs_done == 0 {
            info!("{}", self.description());
        }

        while self.pairs_done < self.num_pairs {
            let end = (self.pairs_done + chunk_size).min(self.num_pairs);
            self.compute_chunk(self.pairs_done, end);
            self.pairs_done = end;

            if self.verbose {
                let percent = 100.0 * self.pairs_done as f64 / self.num_pairs as f64;
                info!(
                    done = self.pairs_done,
                    total = self.num_pairs,
                    elapsed_s = self.duration(),
                    "{:.2}% of EMDs computed",
                    percent
                );
            }

            if self.cancel.is_cancelled() {
                warn!(done = self.pairs_done, "pairwise EMD batch cancelled");
                return Err(EmdError::Cancelled);
            }

            if self.throw_on_error {
                if let Some(first) = self.error_messages.lock().first() {
                    return Err(EmdError::PairFailure(first.clone()));
                }
            }
        }

        debug!(elapsed_s = self.duration(), "finished pairwise EMD batch");
        Ok(())
    }

    fn compute_chunk(&mut self, begin: usize, end: usize) {
        let cursor = AtomicUsize::new(begin);
        let context = ChunkContext {
            events: &self.events,
            layout: self.layout,
            end,
            block_size: self.block_size,
            handler: self.handler.as_deref(),
            store: self.storage != StorageMode::External,
            errors: &self.error_messages,
            cursor: &cursor,
        };

        let engines = &mut self.engines;
        let results: Vec<Vec<(usize, usize, f64)>> = self.pool.install(|| {
            engines
                .par_iter_mut()
                .with_max_len(1)
                .map(|engine| context.run(engine))
                .collect()
        });

        for (i, j, value) in results.into_iter().flatten() {
            self.store(i, j, value);
        }
    }

    fn store(&mut self, i: usize, j: usize, value: f64) {
        let n = self.layout.nev_a;
        match self.storage {
            StorageMode::External => {}
            StorageMode::Full => self.emds[i * self.layout.nev_b + j] = value,
            StorageMode::FullSymmetric => {
                self.emds[i * n + j] = value;
                self.emds[j * n + i] = value;
            }
            StorageMode::FlattenedSymmetric => {
                if let Some(pos) = index_symmetric(i, j, n) {
                    self.emds[pos] = value;
                }
            }
        }
    }

    /// Stored distances in the layout of the current storage mode
    pub fn emds(&self) -> Result<&[f64]> {
        self.check_stored()?;
        Ok(&self.emds)
    }

    /// Stored distances as a matrix, `(nev_a, nev_b)` shaped
    pub fn emds_matrix(&self) -> Result<DMatrix<f64>> {
        self.check_stored()?;
        let PairLayout { nev_a, nev_b, .. } = self.layout;

        Ok(match self.storage {
            StorageMode::FlattenedSymmetric => {
                let mut full = DMatrix::zeros(nev_a, nev_a);
                for i in 0..nev_a {
                    for j in i + 1..nev_a {
                        if let Some(pos) = index_symmetric(i, j, nev_a) {
                            full[(i, j)] = self.emds[pos];
                            full[(j, i)] = self.emds[pos];
                        }
                    }
                }
                full
            }
            _ => DMatrix::from_row_slice(nev_a, nev_b, &self.emds),
        })
    }

    /// Strict upper triangle in squareform order, for a single event set
    pub fn emds_flattened(&self) -> Result<Vec<f64>> {
        self.check_stored()?;
        let n = self.layout.nev_a;
        match self.storage {
            StorageMode::FlattenedSymmetric => Ok(self.emds.clone()),
            StorageMode::FullSymmetric => Ok((0..n)
                .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
                .map(|(i, j)| self.emds[i * n + j])
                .collect()),
            _ => Err(EmdError::NoStoredDistances(
                "flattened distances need a single event set",
            )),
        }
    }

    fn check_stored(&self) -> Result<()> {
        if self.request_mode || self.storage == StorageMode::External {
            return Err(EmdError::NoStoredDistances(
                "no distances are stored with a handler or in request mode",
            ));
        }
        Ok(())
    }

    /// Distance between events `i` and `j`.
    ///
    /// In request mode it is computed on the engine of worker `slot`;
    /// otherwise it is read from storage and `slot` is ignored.
    pub fn emd(&mut self, i: isize, j: isize, slot: usize) -> Result<f64> {
        if self.request_mode {
            let num_slots = self.engines.len();
            let engine = self.engines.get_mut(slot).ok_or_else(|| {
                EmdError::InvalidParameter(format!(
                    "worker slot {} out of range for {} workers",
                    slot, num_slots
                ))
            })?;
            let mut request = RequestSlot {
                engine,
                events: &self.events,
                layout: self.layout,
                handler: self.handler.as_deref(),
            };
            return request.emd(i, j);
        }

        self.check_stored()?;
        let (ri, rj, _, _) = self.layout.resolve(i, j)?;
        let n = self.layout.nev_a;
        Ok(match self.storage {
            StorageMode::FlattenedSymmetric => {
                index_symmetric(ri, rj, n).map_or(0.0, |pos| self.emds[pos])
            }
            StorageMode::FullSymmetric => self.emds[ri * n + rj],
            StorageMode::Full => self.emds[ri * self.layout.nev_b + rj],
            StorageMode::External => 0.0,
        })
    }

    /// One independent request slot per worker engine
    pub fn request_slots(&mut self) -> Result<Vec<RequestSlot<'_, K, S>>> {
        if !self.request_mode {
            return Err(EmdError::RequestMode(
                "request slots are only available in request mode",
            ));
        }

        let (events, layout, handler) = (&self.events[..], self.layout, self.handler.as_deref());
        Ok(self
            .engines
            .iter_mut()
            .map(|engine| RequestSlot {
                engine,
                events,
                layout,
                handler,
            })
            .collect())
    }

    /// Reset batch state; `free_memory` also drops the handler and buffers
    pub fn clear(&mut self, free_memory: bool) {
        self.events.clear();
        self.emds.clear();
        self.error_messages.lock().clear();
        self.layout = PairLayout::default();
        self.num_pairs = 0;
        self.pairs_done = 0;
        self.start = Instant::now();

        if free_memory {
            self.handler = None;
            self.events = Vec::new();
            self.emds = Vec::new();
            for engine in &mut self.engines {
                engine.free_buffers();
            }
        }
    }

    pub fn description(&self) -> String {
        let mut out = String::from("Pairwise EMD\n");
        let _ = writeln!(out, "    num_threads - {}", self.engines.len());
        let _ = writeln!(out, "    chunking - {:?}", self.chunking);
        let _ = writeln!(out, "    block_size - {}", self.block_size);
        let _ = writeln!(out, "    storage - {:?}", self.storage);
        let _ = writeln!(out, "    request_mode - {}", self.request_mode);
        let _ = writeln!(out, "    throw_on_error - {}", self.throw_on_error);
        match &self.handler {
            Some(handler) => {
                let _ = writeln!(out, "    handler - {}", handler.description());
            }
            None => out.push_str("    handler - none\n"),
        }
        out.push('\n');
        out.push_str(&self.engines[0].description(true));
        out
    }
}

fn check_event_weights(events: usize, weights: &[f64]) -> Result<()> {
    if !weights.is_empty() && weights.len() != events {
        return Err(EmdError::MismatchedEventWeights {
            events,
            weights: weights.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::ExtraParticle;
    use crate::preprocess::CenterWeightedCentroid;
    use crate::solver::EmdStatus;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;
    use std::collections::HashSet;

    /// Single-particle events whose coordinate is a row of a distance table
    #[derive(Debug, Clone)]
    struct Table {
        dists: Vec<Vec<f64>>,
        r: f64,
        beta: f64,
    }

    impl GroundDistance for Table {
        fn r(&self) -> f64 {
            self.r
        }

        fn beta(&self) -> f64 {
            self.beta
        }

        fn set_r(&mut self, r: f64) -> Result<()> {
            self.r = r;
            Ok(())
        }

        fn set_beta(&mut self, beta: f64) -> Result<()> {
            self.beta = beta;
            Ok(())
        }

        fn fill_distances(
            &self,
            a: &DMatrix<f64>,
            b: &DMatrix<f64>,
            out: &mut [f64],
            _: ExtraParticle,
        ) {
            let (ia, ib) = (a[(0, 0)] as usize, b[(0, 0)] as usize);
            out[0] = self.dists[ia][ib];
        }

        fn description(&self) -> String {
            "table".to_string()
        }
    }

    fn config(threads: usize) -> PairwiseConfig {
        PairwiseConfig {
            num_threads: ThreadCount::Fixed(threads),
            verbose: false,
            ..Default::default()
        }
    }

    fn table_pairwise(config: PairwiseConfig) -> PairwiseEmd<Table> {
        let table = Table {
            dists: vec![
                vec![0.0, 2.0, 3.0],
                vec![2.0, 0.0, 4.0],
                vec![3.0, 4.0, 0.0],
            ],
            r: 1.0,
            beta: 1.0,
        };
        let engine =
            Emd::with_parts(EmdConfig::default(), table, ShortestPathSolver::default()).unwrap();
        PairwiseEmd::from_engine(config, engine).unwrap()
    }

    fn indexed_events(n: usize) -> Vec<(Vec<f64>, Vec<Vec<f64>>)> {
        (0..n).map(|k| (vec![1.0], vec![vec![k as f64]])).collect()
    }

    fn line_events(positions: &[&[f64]]) -> Vec<Event> {
        positions
            .iter()
            .map(|p| {
                Event::new(
                    vec![1.0 / p.len() as f64; p.len()],
                    DMatrix::from_column_slice(p.len(), 1, p),
                )
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_self_set_flattened() {
        let mut pw = table_pairwise(config(2));
        pw.run(&indexed_events(3), &[]).unwrap();

        assert_eq!(pw.storage(), StorageMode::FlattenedSymmetric);
        assert_eq!(pw.num_emds(), 3);
        assert_eq!(pw.pairs_done(), 3);
        assert_eq!(pw.emds().unwrap(), &[2.0, 3.0, 4.0]);

        let full = pw.emds_matrix().unwrap();
        let expected =
            DMatrix::from_row_slice(3, 3, &[0.0, 2.0, 3.0, 2.0, 0.0, 4.0, 3.0, 4.0, 0.0]);
        assert_eq!(full, expected);

        assert_eq!(pw.emd(2, 1, 0).unwrap(), 4.0);
        assert_eq!(pw.emd(-1, 0, 0).unwrap(), 3.0);
        assert_eq!(pw.emd(1, 1, 0).unwrap(), 0.0);
        assert!(pw.emd(3, 0, 0).is_err());
        assert!(!pw.errored());
    }

    #[test]
    fn test_self_set_full_symmetric() {
        let mut pw = table_pairwise(PairwiseConfig {
            store_sym_emds_flattened: false,
            chunking: ChunkPolicy::Size(1),
            block_size: 1,
            ..config(3)
        });
        pw.run(&indexed_events(3), &[]).unwrap();

        assert_eq!(pw.storage(), StorageMode::FullSymmetric);
        assert_eq!(pw.emds().unwrap().len(), 9);
        assert_eq!(pw.emds_flattened().unwrap(), vec![2.0, 3.0, 4.0]);
        assert_eq!(pw.emds_matrix().unwrap()[(2, 0)], 3.0);
    }

    #[test]
    fn test_matches_single_pair_engine() {
        let events = line_events(&[&[0.0], &[1.0, 2.0], &[0.5, 3.0, 4.0], &[-2.0], &[1.0, 1.5]]);
        let mut pw = PairwiseEmd::new(PairwiseConfig {
            chunking: ChunkPolicy::Count(3),
            block_size: 2,
            ..config(4)
        })
        .unwrap();
        pw.run(&events, &[]).unwrap();
        assert_eq!(pw.num_emds(), 10);

        let mut emd = Emd::new(EmdConfig::default()).unwrap();
        let full = pw.emds_matrix().unwrap();
        for i in 0..events.len() {
            assert_eq!(full[(i, i)], 0.0);
            for j in 0..events.len() {
                assert_eq!(full[(i, j)], full[(j, i)]);
                if i != j {
                    assert_eq!(emd.compute(&events[i], &events[j]), EmdStatus::Success);
                    assert_abs_diff_eq!(full[(i, j)], emd.emd(), epsilon = 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_cross_sets() {
        let a = line_events(&[&[0.0], &[1.0, 3.0]]);
        let b = line_events(&[&[2.0], &[0.0, 0.5], &[5.0]]);
        let mut pw = PairwiseEmd::new(config(2)).unwrap();
        pw.run_pair(&a, &b, &[], &[]).unwrap();

        assert_eq!(pw.storage(), StorageMode::Full);
        assert_eq!((pw.nev_a(), pw.nev_b()), (2, 3));
        assert_eq!(pw.num_emds(), 6);

        let full = pw.emds_matrix().unwrap();
        assert_eq!(full.shape(), (2, 3));

        let mut emd = Emd::new(EmdConfig::default()).unwrap();
        for i in 0..2 {
            for j in 0..3 {
                emd.compute(&a[i], &b[j]);
                assert_abs_diff_eq!(full[(i, j)], emd.emd(), epsilon = 1e-9);
                assert_abs_diff_eq!(
                    pw.emd(i as isize, j as isize, 0).unwrap(),
                    emd.emd(),
                    epsilon = 1e-9
                );
            }
        }
        assert!(pw.emds_flattened().is_err());
    }

    #[test]
    fn test_failures_recorded() {
        let mut events = line_events(&[&[0.0], &[1.0], &[2.0], &[3.0]]);
        events[2] =
            Event::new(vec![2.0, -1.0], DMatrix::from_column_slice(2, 1, &[0.0, 1.0])).unwrap();

        let mut pw = PairwiseEmd::new(config(2)).unwrap();
        pw.run(&events, &[]).unwrap();

        assert!(pw.errored());
        let messages = pw.error_messages();
        assert_eq!(messages.len(), 3);
        assert!(messages
            .iter()
            .all(|m| m.starts_with("PairwiseEmd::compute - issue with EMD between events")
                && m.ends_with("error code 5")));

        let full = pw.emds_matrix().unwrap();
        for k in [0, 1, 3] {
            assert!(full[(2, k)].is_nan());
            assert!(full[(k, 2)].is_nan());
        }
        assert_abs_diff_eq!(full[(0, 3)], 3.0, epsilon = 1e-9);

        // a new batch starts with a clean error list
        pw.run(&events[..2], &[]).unwrap();
        assert!(!pw.errored());
    }

    #[test]
    fn test_throw_on_error() {
        let mut events = line_events(&[&[0.0], &[1.0], &[2.0]]);
        events[0] = Event::new(vec![f64::NAN], DMatrix::zeros(1, 1)).unwrap();

        let mut pw = PairwiseEmd::new(PairwiseConfig {
            throw_on_error: true,
            ..config(1)
        })
        .unwrap();
        match pw.run(&events, &[]) {
            Err(EmdError::PairFailure(message)) => {
                let prefix = "PairwiseEmd::compute - issue with EMD between events";
                assert!(message.starts_with(prefix));
                assert_eq!(Some(message), pw.error_messages().first().cloned());
            }
            other => panic!("expected a pair failure, got {:?}", other),
        }
    }

    struct CountAndCancel {
        calls: AtomicUsize,
        weights: Mutex<Vec<f64>>,
        cancel: Option<CancelHandle>,
    }

    impl EmdHandler for CountAndCancel {
        fn apply(&self, _emd: f64, weight: f64) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.weights.lock().push(weight);
            if let Some(cancel) = &self.cancel {
                cancel.cancel();
            }
        }

        fn description(&self) -> String {
            "counting handler".to_string()
        }
    }

    #[test]
    fn test_handler_receives_weight_products() {
        let mut pw = PairwiseEmd::new(config(2)).unwrap();
        let handler = Arc::new(CountAndCancel {
            calls: AtomicUsize::new(0),
            weights: Mutex::new(Vec::new()),
            cancel: None,
        });
        pw.set_handler(handler.clone());

        let events = line_events(&[&[0.0], &[1.0], &[2.0]]);
        pw.run(&events, &[1.0, 2.0, 3.0]).unwrap();

        assert_eq!(pw.storage(), StorageMode::External);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let mut weights = handler.weights.lock().clone();
        weights.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(weights, vec![2.0, 3.0, 6.0]);

        assert!(matches!(pw.emds(), Err(EmdError::NoStoredDistances(_))));
        assert!(pw.description().contains("counting handler"));
    }

    #[test]
    fn test_cancellation() {
        let mut pw = PairwiseEmd::new(PairwiseConfig {
            chunking: ChunkPolicy::Size(1),
            block_size: 1,
            ..config(1)
        })
        .unwrap();
        let handler = Arc::new(CountAndCancel {
            calls: AtomicUsize::new(0),
            weights: Mutex::new(Vec::new()),
            cancel: Some(pw.cancel_handle()),
        });
        pw.set_handler(handler.clone());

        let events = line_events(&[&[0.0], &[1.0], &[2.0], &[3.0]]);
        assert_eq!(pw.run(&events, &[]), Err(EmdError::Cancelled));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pw.pairs_done(), 1);
    }

    #[test]
    fn test_cancel_before_run_is_dropped() {
        let mut pw = PairwiseEmd::new(config(1)).unwrap();
        pw.cancel_handle().cancel();

        let events = line_events(&[&[0.0], &[1.0], &[2.0]]);
        pw.run(&events, &[]).unwrap();
        assert_eq!(pw.pairs_done(), 3);
        assert!(!pw.cancel_handle().is_cancelled());
    }

    #[test]
    fn test_request_mode() {
        let events = line_events(&[&[0.0], &[1.0], &[3.0]]);
        let mut pw = PairwiseEmd::new(config(2)).unwrap();
        pw.set_request_mode(true);
        pw.run(&events, &[]).unwrap();

        assert_eq!(pw.pairs_done(), 0);
        assert!(matches!(pw.compute(), Err(EmdError::RequestMode(_))));
        assert!(pw.emds().is_err());

        assert_abs_diff_eq!(pw.emd(0, 1, 0).unwrap(), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(pw.emd(-1, 0, 0).unwrap(), 3.0, epsilon = 1e-9);
        assert_eq!(pw.emd(1, 1, 0).unwrap(), 0.0);
        assert!(matches!(pw.emd(0, 1, 7), Err(EmdError::InvalidParameter(_))));

        let slots = pw.request_slots().unwrap();
        let values: Vec<f64> = std::thread::scope(|scope| {
            let handles: Vec<_> = slots
                .into_iter()
                .enumerate()
                .map(|(k, mut slot)| scope.spawn(move || slot.emd(k as isize, 2).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_abs_diff_eq!(values[0], 3.0, epsilon = 1e-9);
        if values.len() > 1 {
            assert_abs_diff_eq!(values[1], 2.0, epsilon = 1e-9);
        }

        pw.set_request_mode(false);
        assert!(pw.request_slots().is_err());
    }

    #[test]
    fn test_preprocessing_applied_to_events() {
        let mut pw = PairwiseEmd::new(config(1)).unwrap();
        pw.preprocess(CenterWeightedCentroid);

        let events = line_events(&[&[0.0, 2.0], &[5.0, 7.0]]);
        pw.run(&events, &[]).unwrap();
        assert_abs_diff_eq!(pw.emds().unwrap()[0], 0.0, epsilon = 1e-12);
        assert!(pw.description().contains("weighted centroid"));
    }

    #[test]
    fn test_leaving_request_mode_allocates_storage() {
        let events = line_events(&[&[0.0], &[1.0], &[3.0]]);
        let mut pw = PairwiseEmd::new(config(2)).unwrap();
        pw.set_request_mode(true);
        pw.run(&events, &[]).unwrap();
        assert_eq!(pw.storage(), StorageMode::External);

        pw.set_request_mode(false);
        assert_eq!(pw.storage(), StorageMode::FlattenedSymmetric);
        pw.compute().unwrap();

        assert_eq!(pw.pairs_done(), 3);
        let emds = pw.emds().unwrap();
        assert_abs_diff_eq!(emds[0], 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(emds[1], 3.0, epsilon = 1e-9);
        assert_abs_diff_eq!(emds[2], 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_compute_without_storage_or_handler() {
        let events = line_events(&[&[0.0], &[1.0]]);
        let mut pw = PairwiseEmd::new(config(1)).unwrap();
        pw.set_handler(Arc::new(CountAndCancel {
            calls: AtomicUsize::new(0),
            weights: Mutex::new(Vec::new()),
            cancel: None,
        }));
        pw.set_request_mode(true);
        pw.run(&events, &[]).unwrap();
        pw.set_request_mode(false);
        assert_eq!(pw.storage(), StorageMode::External);

        pw.remove_handler();
        assert!(matches!(pw.compute(), Err(EmdError::NoStoredDistances(_))));
        assert_eq!(pw.pairs_done(), 0);
    }

    #[derive(Debug, Default)]
    struct Shift(AtomicUsize);

    impl Preprocessor for Shift {
        fn apply(&self, event: &mut Event) {
            self.0.fetch_add(1, Ordering::SeqCst);
            event.particles_mut().add_scalar_mut(1.0);
        }

        fn description(&self) -> String {
            "shift by one".to_string()
        }
    }

    #[test]
    fn test_run_events_skips_preprocessing() {
        let mut pw = PairwiseEmd::new(config(2)).unwrap();
        pw.preprocess(Shift::default());

        let events = line_events(&[&[0.0], &[1.0], &[3.0]]);
        pw.run_events(events.clone()).unwrap();
        assert_eq!(pw.events(), &events[..]);
        assert_abs_diff_eq!(pw.emds().unwrap()[1], 3.0, epsilon = 1e-9);

        pw.run(&events, &[]).unwrap();
        assert_abs_diff_eq!(pw.events()[0].particles()[(0, 0)], 1.0);
    }

    #[test]
    fn test_run_events_pair() {
        let a = line_events(&[&[0.0], &[1.0]]);
        let b = line_events(&[&[2.0], &[4.0], &[5.0]]);
        let mut pw = PairwiseEmd::new(config(2)).unwrap();
        pw.run_events_pair(a, b).unwrap();

        assert_eq!(pw.storage(), StorageMode::Full);
        assert_eq!(pw.events().len(), 5);
        let full = pw.emds_matrix().unwrap();
        assert_eq!(full.shape(), (2, 3));
        assert_abs_diff_eq!(full[(1, 2)], 4.0, epsilon = 1e-9);
    }

    #[test]
    fn test_mismatched_dimensions_in_batch() {
        let events = vec![
            Event::from_coords(vec![1.0], &[vec![0.0, 0.0]]).unwrap(),
            Event::new(Vec::new(), DMatrix::zeros(0, 5)).unwrap(),
            Event::from_coords(vec![1.0], &[vec![0.0, 0.0, 5.0]]).unwrap(),
        ];
        let mut pw = PairwiseEmd::new(config(1)).unwrap();
        assert_eq!(
            pw.run(&events, &[]),
            Err(EmdError::MismatchedDimensions { dim0: 2, dim1: 3 })
        );
        assert!(pw.run_events(events).is_err());
    }

    #[test]
    fn test_solver_params_and_block_size() {
        let mut pw = PairwiseEmd::new(config(2)).unwrap();
        pw.set_solver_params(SolverParams {
            n_iter_max: 1,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(pw.solver_params().n_iter_max, 1);
        pw.set_block_size(1).unwrap();
        assert_eq!(pw.block_size(), 1);
        assert!(pw.set_block_size(0).is_err());
        assert!(pw
            .set_solver_params(SolverParams {
                n_iter_max: 0,
                ..Default::default()
            })
            .is_err());

        // two particles per side need two augmentations
        let events = line_events(&[&[0.0, 1.0], &[2.0, 5.0], &[-1.0, 3.0]]);
        pw.run(&events, &[]).unwrap();
        let messages = pw.error_messages();
        assert_eq!(messages.len(), 3);
        assert!(messages.iter().all(|m| m.ends_with("error code 4")));
    }

    #[test]
    fn test_mismatched_event_weights() {
        let mut pw = PairwiseEmd::new(config(1)).unwrap();
        let events = line_events(&[&[0.0], &[1.0]]);
        assert_eq!(
            pw.run(&events, &[1.0]),
            Err(EmdError::MismatchedEventWeights {
                events: 2,
                weights: 1
            })
        );
        assert!(pw.run_pair(&events, &events, &[], &[1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn test_clear() {
        let mut pw = PairwiseEmd::new(config(2)).unwrap();
        pw.set_handler(Arc::new(CountAndCancel {
            calls: AtomicUsize::new(0),
            weights: Mutex::new(Vec::new()),
            cancel: None,
        }));
        let events = line_events(&[&[0.0], &[1.0]]);
        pw.run(&events, &[]).unwrap();

        pw.clear(false);
        assert!(pw.handler().is_some());
        assert_eq!(pw.num_emds(), 0);

        pw.clear(true);
        assert!(pw.handler().is_none());

        pw.run(&events, &[]).unwrap();
        assert_eq!(pw.storage(), StorageMode::FlattenedSymmetric);
        assert_abs_diff_eq!(pw.emds().unwrap()[0], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_external_engine_rejected() {
        let engine = Emd::external(EmdConfig::default()).unwrap();
        assert!(PairwiseEmd::from_engine(config(1), engine).is_err());
        assert!(PairwiseEmd::new(PairwiseConfig {
            block_size: 0,
            ..config(1)
        })
        .is_err());
    }

    #[test]
    fn test_policies() {
        assert_eq!(ThreadCount::from_raw(-1), ThreadCount::Auto);
        assert_eq!(ThreadCount::from_raw(0), ThreadCount::Auto);
        assert_eq!(ThreadCount::from_raw(3), ThreadCount::Fixed(3));
        assert!(ThreadCount::Auto.resolve() >= 1);
        assert_eq!(ThreadCount::Fixed(0).resolve(), 1);

        assert_eq!(ChunkPolicy::from_raw(25), ChunkPolicy::Size(25));
        assert_eq!(ChunkPolicy::from_raw(-4), ChunkPolicy::Count(4));
        assert_eq!(ChunkPolicy::from_raw(0), ChunkPolicy::Count(1));
        assert_eq!(ChunkPolicy::from_raw(-10).to_raw(), -10);

        assert_eq!(ChunkPolicy::Count(4).chunk_size(10), 3);
        assert_eq!(ChunkPolicy::Count(1).chunk_size(10), 10);
        assert_eq!(ChunkPolicy::Count(10).chunk_size(0), 1);
        assert_eq!(ChunkPolicy::Size(0).chunk_size(10), 1);
    }

    #[test]
    fn test_config_json() {
        let config = PairwiseConfig {
            num_threads: ThreadCount::Fixed(4),
            chunking: ChunkPolicy::Size(100),
            ..Default::default()
        };
        let json = config.to_json().unwrap();
        assert_eq!(PairwiseConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_symmetric_pair_small() {
        let pairs: Vec<_> = (0..3).map(|k| symmetric_pair(k, 3)).collect();
        assert_eq!(pairs, vec![(1, 0), (2, 1), (2, 0)]);
        assert_eq!(index_symmetric(0, 0, 3), None);
        assert_eq!(index_symmetric(0, 3, 3), None);
    }

    proptest! {
        #[test]
        fn prop_index_symmetric_bijection(n in 2usize..40) {
            let total = n * (n - 1) / 2;
            let mut seen = vec![false; total];
            for i in 0..n {
                for j in i + 1..n {
                    let pos = index_symmetric(i, j, n).unwrap();
                    prop_assert!(pos < total);
                    prop_assert!(!seen[pos]);
                    prop_assert_eq!(Some(pos), index_symmetric(j, i, n));
                    seen[pos] = true;
                }
            }
            prop_assert!(seen.iter().all(|&s| s));
        }

        #[test]
        fn prop_symmetric_pair_covers_triangle(n in 2usize..40) {
            let total = n * (n - 1) / 2;
            let pairs: HashSet<(usize, usize)> = (0..total).map(|k| symmetric_pair(k, n)).collect();
            prop_assert_eq!(pairs.len(), total);
            prop_assert!(pairs.iter().all(|&(i, j)| i > j && i < n));
        }
    }
}
