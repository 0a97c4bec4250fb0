//! First pass: separator counting and chunk-boundary scouting.
//!
//! One streaming scan over 64-byte blocks produces everything the
//! orchestrator needs before the indexing pass runs: the quote count and
//! outside-quote separator count for right-sized allocation, and the first
//! row terminator at even and at odd quote parity for safe chunk splits.

use crate::buffer::PaddedBuffer;
use crate::dialect::Dialect;
use crate::simd::{lane_mask, Backend};

/// Statistics from a first-pass scan over one byte range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FirstPassStats {
    /// Total quote characters in the range.
    pub n_quotes: u64,
    /// Field separators (delimiters + row terminators) outside quotes.
    pub n_separators: u64,
    /// First row terminator seen at even quote parity, if any.
    pub first_even_nl: Option<u64>,
    /// First row terminator seen at odd quote parity, if any.
    pub first_odd_nl: Option<u64>,
}

/// Scan `[start, end)` with the best available block implementation.
pub fn first_pass(buf: &PaddedBuffer, start: usize, end: usize, dialect: &Dialect) -> FirstPassStats {
    first_pass_with(Backend::detect(), buf, start, end, dialect)
}

pub(crate) fn first_pass_with(
    backend: Backend,
    buf: &PaddedBuffer,
    start: usize,
    end: usize,
    dialect: &Dialect,
) -> FirstPassStats {
    debug_assert!(start <= end && end <= buf.len());
    let padded = buf.padded();
    let mut stats = FirstPassStats::default();
    let len = end - start;
    let mut prev_inside = 0u64;
    let mut idx = 0;

    while idx < len {
        let remaining = len - idx;
        let valid = lane_mask(remaining);
        let window = &padded[start + idx..start + idx + 65];
        let masks = backend.classify(window, dialect.delimiter, dialect.quote_char);

        let quotes = masks.quotes & valid;
        let nl = masks.line_endings & valid;
        let delims = masks.delims & valid;
        let inside = backend.quote_mask(quotes, &mut prev_inside);

        stats.n_separators += ((delims | nl) & !inside).count_ones() as u64;
        stats.n_quotes += quotes.count_ones() as u64;

        if stats.first_even_nl.is_none() {
            let even_nl = nl & !inside;
            if even_nl != 0 {
                stats.first_even_nl = Some((start + idx) as u64 + even_nl.trailing_zeros() as u64);
            }
        }
        if stats.first_odd_nl.is_none() {
            let odd_nl = nl & inside;
            if odd_nl != 0 {
                stats.first_odd_nl = Some((start + idx) as u64 + odd_nl.trailing_zeros() as u64);
            }
        }

        idx += 64;
    }
    stats
}

/// Byte-wise reference implementation.
///
/// Produces the same four outputs as [`first_pass`] for any input; the SIMD
/// path is property-tested against it, and non-block callers use it for
/// tiny ranges.
pub fn first_pass_scalar(
    buf: &PaddedBuffer,
    start: usize,
    end: usize,
    dialect: &Dialect,
) -> FirstPassStats {
    debug_assert!(start <= end && end <= buf.len());
    let padded = buf.padded();
    let mut stats = FirstPassStats::default();
    let mut inside_quote = false;

    for i in start..end {
        let b = padded[i];
        // The padding is zeroed, so the lookahead at the buffer end reads a
        // non-LF byte and a trailing CR counts as a terminator.
        let is_terminator = b == b'\n' || (b == b'\r' && padded[i + 1] != b'\n');
        if is_terminator {
            if !inside_quote {
                stats.n_separators += 1;
            }
            if stats.n_quotes % 2 == 0 {
                stats.first_even_nl.get_or_insert(i as u64);
            } else {
                stats.first_odd_nl.get_or_insert(i as u64);
            }
        } else if b == dialect.quote_char {
            stats.n_quotes += 1;
            inside_quote = !inside_quote;
        } else if b == dialect.delimiter && !inside_quote {
            stats.n_separators += 1;
        }
    }
    stats
}

/// Quote state at a position, derived by bounded backward inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QuoteState {
    Ambiguous,
    Quoted,
    Unquoted,
}

/// How far backward [`quote_state_at`] looks before giving up (64 KB).
const SPECULATION_WINDOW: usize = 1 << 16;

/// Guess the quote state at `start` by scanning backward for a quote whose
/// neighbor pins down whether it opens or closes a field.
///
/// A quote followed by an ordinary byte must be an opening quote; a quote
/// preceded by an ordinary byte must be a closing one. Counting quotes
/// between that anchor and `start` gives the state. Returns `Ambiguous`
/// when no anchor exists in the window.
pub(crate) fn quote_state_at(data: &[u8], start: usize, dialect: &Dialect) -> QuoteState {
    if start == 0 {
        return QuoteState::Unquoted;
    }
    let is_other = |b: u8| {
        b != dialect.delimiter && b != dialect.quote_char && b != b'\n' && b != b'\r'
    };
    let floor = start.saturating_sub(SPECULATION_WINDOW);
    let mut num_quotes = 0u64;
    let mut i = start;
    while i > floor {
        if data[i] == dialect.quote_char {
            if i + 1 < start && is_other(data[i + 1]) {
                // Opening quote: the byte after it is field content.
                return if num_quotes % 2 == 0 {
                    QuoteState::Quoted
                } else {
                    QuoteState::Unquoted
                };
            } else if i > floor && is_other(data[i - 1]) {
                // Closing quote: the byte before it is field content.
                return if num_quotes % 2 == 0 {
                    QuoteState::Unquoted
                } else {
                    QuoteState::Quoted
                };
            }
            num_quotes += 1;
        }
        i -= 1;
    }
    QuoteState::Ambiguous
}

/// Speculatively propose a chunk boundary inside `[start, end)`.
///
/// Assumes the quote state at `start` from [`quote_state_at`], scans forward
/// byte by byte toggling on quotes, and stops at the first row terminator.
/// The terminator lands in the slot matching the parity it was seen at:
/// `first_even_nl` when the running state says unquoted (or the backward
/// scan was ambiguous), `first_odd_nl` when it says quoted. The counting
/// fields stay zero; the second pass validates the proposal either way.
pub(crate) fn speculate_boundary(
    buf: &PaddedBuffer,
    start: usize,
    end: usize,
    dialect: &Dialect,
) -> FirstPassStats {
    let padded = buf.padded();
    let mut quoted = matches!(quote_state_at(buf.data(), start, dialect), QuoteState::Quoted);
    let mut stats = FirstPassStats::default();
    for i in start..end {
        let b = padded[i];
        let is_terminator = b == b'\n' || (b == b'\r' && padded[i + 1] != b'\n');
        if is_terminator {
            if quoted {
                stats.first_odd_nl = Some(i as u64);
            } else {
                stats.first_even_nl = Some(i as u64);
            }
            return stats;
        } else if b == dialect.quote_char {
            quoted = !quoted;
        }
    }
    stats
}
