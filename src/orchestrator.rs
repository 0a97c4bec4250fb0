//! Orchestration of the two passes across worker slots.
//!
//! The fast path splits the buffer speculatively: each worker proposes its
//! chunk start by scanning forward for a row terminator under a guessed
//! quote state, the second pass runs in parallel, and every non-terminal
//! chunk must end at a record boundary for the speculation to stand. A miss
//! (or a request for error collection, or a comment-aware dialect) routes
//! through the conservative two-pass scheme, which derives boundaries from
//! cumulative quote parity and therefore cannot guess wrong.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use rayon::prelude::*;
use tracing::debug;

use crate::buffer::PaddedBuffer;
use crate::checks;
use crate::dialect::Dialect;
use crate::error::{
    ErrorCode, ErrorCollector, ErrorMode, Severity, DEFAULT_MAX_FIELD_SIZE, DEFAULT_MAX_FILE_SIZE,
};
use crate::first_pass::{first_pass, speculate_boundary, FirstPassStats};
use crate::index::IndexStore;
use crate::second_pass::{
    second_pass_simd, second_pass_with_errors, SecondPassResult,
};
use crate::simd::Backend;

/// Chunks smaller than this are not worth splitting; the whole buffer runs
/// on one worker instead.
const MIN_CHUNK_SIZE: usize = 64;

/// Upper bounds enforced before any allocation happens.
#[derive(Debug, Clone, Copy)]
pub struct SizeLimits {
    pub max_file_size: usize,
    pub max_field_size: usize,
}

impl Default for SizeLimits {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_field_size: DEFAULT_MAX_FIELD_SIZE,
        }
    }
}

/// Progress callback: receives the percentage completed so far and returns
/// `false` to cancel the parse.
pub type ProgressFn<'a> = &'a (dyn Fn(u8) -> bool + Sync);

/// Options for one parse call.
#[derive(Default)]
pub struct ParseOptions<'a> {
    pub dialect: Dialect,
    /// `Some` requests error collection in the given mode and enables the
    /// post-parse structural checks.
    pub error_mode: Option<ErrorMode>,
    pub limits: SizeLimits,
    pub progress: Option<ProgressFn<'a>>,
}

/// Result of a parse: the index, the merged error collector, and a success
/// flag. Success can be true while the collector holds warnings; callers
/// are expected to consult both.
#[derive(Debug)]
pub struct ParseOutcome {
    pub index: IndexStore,
    pub errors: ErrorCollector,
    success: bool,
}

impl ParseOutcome {
    /// Wrap an index loaded from a valid cache: nothing was parsed, so the
    /// collector is empty.
    pub(crate) fn from_cache(index: IndexStore) -> Self {
        Self {
            index,
            errors: ErrorCollector::default(),
            success: true,
        }
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn has_errors(&self) -> bool {
        self.errors.has_errors()
    }
}

/// Shared progress state: relaxed byte accumulation, compare-exchange
/// percent throttling, release-store cancellation.
struct ProgressTracker<'a> {
    callback: Option<ProgressFn<'a>>,
    /// Total weighted units: 10 per first-pass byte, 90 per second-pass
    /// byte, so a fully scanned buffer totals `100 * len`.
    total: u64,
    done: AtomicU64,
    last_percent: AtomicU32,
    cancelled: AtomicBool,
}

impl<'a> ProgressTracker<'a> {
    fn new(callback: Option<ProgressFn<'a>>, len: usize) -> Self {
        Self {
            callback,
            total: (len as u64).max(1) * 100,
            done: AtomicU64::new(0),
            last_percent: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
        }
    }

    fn report_first_pass(&self, bytes: usize) {
        self.add(bytes as u64 * 10);
    }

    fn report_second_pass(&self, bytes: usize) {
        self.add(bytes as u64 * 90);
    }

    fn add(&self, weighted: u64) {
        let Some(callback) = self.callback else { return };
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let done = self.done.fetch_add(weighted, Ordering::Relaxed) + weighted;
        let percent = ((done * 100) / self.total).min(100) as u32;
        let mut last = self.last_percent.load(Ordering::Relaxed);
        // Only the thread that wins the exchange invokes the callback, so a
        // slow callback throttles itself.
        while percent > last {
            match self.last_percent.compare_exchange_weak(
                last,
                percent,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    if !callback(percent as u8) {
                        self.cancelled.store(true, Ordering::Release);
                    }
                    return;
                }
                Err(current) => last = current,
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// The parsing engine: fans both passes out over `n_threads` worker slots.
#[derive(Debug, Clone)]
pub struct Parser {
    n_threads: usize,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new(std::thread::available_parallelism().map(|p| p.get()).unwrap_or(1))
    }
}

impl Parser {
    pub fn new(n_threads: usize) -> Self {
        Self {
            n_threads: n_threads.max(1),
        }
    }

    /// Parse `buf` and build a populated [`IndexStore`].
    pub fn parse(&self, buf: &PaddedBuffer, options: &ParseOptions) -> ParseOutcome {
        let mut errors = ErrorCollector::new(options.error_mode.unwrap_or_default());
        let len = buf.len();

        if len > options.limits.max_file_size {
            errors.add(
                ErrorCode::FileTooLarge,
                Severity::Fatal,
                buf.data(),
                0,
                format!(
                    "file of {len} bytes exceeds the limit of {} bytes",
                    options.limits.max_file_size
                ),
            );
            return ParseOutcome {
                index: IndexStore::empty(),
                errors,
                success: false,
            };
        }

        let tracker = ProgressTracker::new(options.progress, len);
        // The block scan knows nothing about comment lines or error
        // recovery, so those dialects go through the scalar state machine.
        let collecting = options.error_mode.is_some() || options.dialect.has_comments();

        // Comment-aware dialects run on one worker: a chunk boundary landing
        // on a comment line's terminator would make a parallel worker emit a
        // separator the comment skip suppresses.
        let n_threads = if len / self.n_threads < MIN_CHUNK_SIZE || options.dialect.has_comments() {
            1
        } else {
            self.n_threads
        };

        let index = if !collecting && n_threads > 1 {
            match self.parse_speculative(buf, &options.dialect, n_threads, &tracker) {
                Ok(index) => Some(index),
                Err(miss) => {
                    if miss {
                        debug!("speculative chunk boundaries missed, falling back to two-pass");
                    }
                    self.parse_conservative(
                        buf,
                        &options.dialect,
                        n_threads,
                        options,
                        &mut errors,
                        &tracker,
                    )
                }
            }
        } else if !collecting {
            self.parse_single(buf, &options.dialect, options, &mut errors, &tracker)
        } else if n_threads > 1 {
            self.parse_conservative(buf, &options.dialect, n_threads, options, &mut errors, &tracker)
        } else {
            self.parse_single(buf, &options.dialect, options, &mut errors, &tracker)
        };

        let mut index = match index {
            Some(index) => index,
            None => {
                return ParseOutcome {
                    index: IndexStore::empty(),
                    errors,
                    success: false,
                }
            }
        };

        index.derive_columns(buf.data());

        if options.error_mode.is_some() && !errors.has_fatal() {
            checks::run_structural_checks(buf.data(), &options.dialect, &mut errors);
        }
        errors.sort_by_offset();

        // Fail-fast treats any non-warning finding as a stop; the other
        // modes only fail on fatals. Warnings never flip success.
        let fail_fast_stop = options.error_mode == Some(ErrorMode::FailFast)
            && errors.errors().iter().any(|e| e.severity != Severity::Warning);
        let success = !tracker.is_cancelled() && !errors.has_fatal() && !fail_fast_stop;
        ParseOutcome {
            index,
            errors,
            success,
        }
    }

    /// One worker covers the whole buffer.
    fn parse_single(
        &self,
        buf: &PaddedBuffer,
        dialect: &Dialect,
        options: &ParseOptions,
        errors: &mut ErrorCollector,
        tracker: &ProgressTracker,
    ) -> Option<IndexStore> {
        let backend = Backend::detect();
        let len = buf.len();
        let stats = first_pass(buf, 0, len, dialect);
        tracker.report_first_pass(len);

        let mut index = self.alloc_counted(stats, 1, len, errors)?;
        let collecting = options.error_mode.is_some() || dialect.has_comments();
        let result = {
            let mut slabs = index.slabs_mut();
            if collecting {
                second_pass_with_errors(
                    buf,
                    0,
                    len,
                    slabs[0],
                    dialect,
                    errors,
                    options.limits.max_field_size,
                )
            } else {
                second_pass_simd(backend, buf, 0, len, slabs[0], dialect)
            }
        };
        tracker.report_second_pass(len);
        index.set_count(0, result.n_indexes);
        index.set_chunk_start(0, 0);
        Some(index)
    }

    /// Speculative fast path. `Err(true)` signals a speculation miss,
    /// `Err(false)` a degenerate chunking (no boundary found).
    fn parse_speculative(
        &self,
        buf: &PaddedBuffer,
        dialect: &Dialect,
        n_threads: usize,
        tracker: &ProgressTracker,
    ) -> Result<IndexStore, bool> {
        let backend = Backend::detect();
        let len = buf.len();
        let chunk_size = len / n_threads;

        // Step 1: propose boundaries from equal splits. Each proposal is the
        // split's first terminator, tagged with the parity it was seen at;
        // whichever slot got filled is the candidate start.
        let proposals: Vec<FirstPassStats> = (1..n_threads)
            .into_par_iter()
            .map(|i| speculate_boundary(buf, chunk_size * i, chunk_size * (i + 1), dialect))
            .collect();
        let mut bounds = Vec::with_capacity(n_threads + 1);
        bounds.push(0usize);
        for proposal in proposals {
            match proposal.first_even_nl.or(proposal.first_odd_nl) {
                Some(pos) => bounds.push(pos as usize),
                None => return Err(false),
            }
        }
        bounds.push(len);

        // Step 2: count separators per actual chunk for right-sizing.
        let stats: Vec<FirstPassStats> = (0..n_threads)
            .into_par_iter()
            .map(|t| {
                let s = first_pass(buf, bounds[t], bounds[t + 1], dialect);
                tracker.report_first_pass(bounds[t + 1] - bounds[t]);
                s
            })
            .collect();
        let counts: Vec<u64> = stats.iter().map(|s| s.n_separators).collect();

        // Step 3: right-sized slabs.
        let mut index = match IndexStore::with_per_thread_slabs(&counts) {
            Ok(index) => index,
            Err(_) => return Err(false),
        };

        // Step 4: parallel second pass, one slab per worker.
        let results: Vec<SecondPassResult> = {
            let slabs = index.slabs_mut();
            slabs
                .into_par_iter()
                .enumerate()
                .map(|(t, slab)| {
                    let r = second_pass_simd(backend, buf, bounds[t], bounds[t + 1], slab, dialect);
                    tracker.report_second_pass(bounds[t + 1] - bounds[t]);
                    r
                })
                .collect()
        };

        // Step 5: every non-terminal chunk must have ended at a record
        // boundary, or the proposed splits were wrong.
        if results[..n_threads - 1].iter().any(|r| !r.at_record_boundary) {
            return Err(true);
        }

        for (t, result) in results.iter().enumerate() {
            index.set_count(t, result.n_indexes);
            index.set_chunk_start(t, bounds[t] as u64);
        }
        Ok(index)
    }

    /// Conservative two-pass path: boundaries from cumulative quote parity.
    fn parse_conservative(
        &self,
        buf: &PaddedBuffer,
        dialect: &Dialect,
        n_threads: usize,
        options: &ParseOptions,
        errors: &mut ErrorCollector,
        tracker: &ProgressTracker,
    ) -> Option<IndexStore> {
        let backend = Backend::detect();
        let len = buf.len();
        let chunk_size = len / n_threads;
        let split_end = |i: usize| if i + 1 == n_threads { len } else { chunk_size * (i + 1) };

        // First pass over equal splits.
        let stats: Vec<FirstPassStats> = (0..n_threads)
            .into_par_iter()
            .map(|i| {
                let s = first_pass(buf, chunk_size * i, split_end(i), dialect);
                tracker.report_first_pass(split_end(i) - chunk_size * i);
                s
            })
            .collect();

        // Reconcile boundaries with the running quote parity: worker i
        // starts at its split's first newline seen at the parity accumulated
        // over all earlier splits.
        let mut bounds = Vec::with_capacity(n_threads + 1);
        bounds.push(0usize);
        let mut quote_parity = stats[0].n_quotes;
        for s in stats.iter().take(n_threads).skip(1) {
            let boundary = if quote_parity % 2 == 0 {
                s.first_even_nl
            } else {
                s.first_odd_nl
            };
            match boundary {
                Some(pos) => bounds.push(pos as usize),
                None => {
                    // Degenerate chunking: run the whole buffer on one worker.
                    return self.parse_single(buf, dialect, options, errors, tracker);
                }
            }
            quote_parity += s.n_quotes;
        }
        bounds.push(len);

        let total: FirstPassStats = stats.iter().fold(FirstPassStats::default(), |mut acc, s| {
            acc.n_quotes += s.n_quotes;
            acc.n_separators += s.n_separators;
            acc
        });
        let mut index = self.alloc_counted(total, n_threads, len, errors)?;

        let collecting = options.error_mode.is_some() || dialect.has_comments();
        let mode = options.error_mode.unwrap_or_default();
        let max_field = options.limits.max_field_size;

        let results: Vec<(SecondPassResult, ErrorCollector)> = {
            let slabs = index.slabs_mut();
            slabs
                .into_par_iter()
                .enumerate()
                .map(|(t, slab)| {
                    let (start, end) = (bounds[t], bounds[t + 1]);
                    let out = if collecting {
                        let mut worker_errors = ErrorCollector::new(mode);
                        let r = second_pass_with_errors(
                            buf,
                            start,
                            end,
                            slab,
                            dialect,
                            &mut worker_errors,
                            max_field,
                        );
                        (r, worker_errors)
                    } else {
                        let r = second_pass_simd(backend, buf, start, end, slab, dialect);
                        (r, ErrorCollector::new(mode))
                    };
                    tracker.report_second_pass(end - start);
                    out
                })
                .collect()
        };

        for (t, (result, worker_errors)) in results.into_iter().enumerate() {
            index.set_count(t, result.n_indexes);
            index.set_chunk_start(t, bounds[t] as u64);
            errors.merge(worker_errors);
        }
        Some(index)
    }

    fn alloc_counted(
        &self,
        stats: FirstPassStats,
        n_threads: usize,
        len: usize,
        errors: &mut ErrorCollector,
    ) -> Option<IndexStore> {
        match IndexStore::with_counted_slabs(stats.n_separators, n_threads, stats.n_quotes, len) {
            Ok(index) => Some(index),
            Err(e) => {
                errors.add(e.code(), Severity::Fatal, &[], 0, e.to_string());
                None
            }
        }
    }
}
