//! Second pass: emit field-separator positions into a worker's slab.
//!
//! Three variants share one contract: write the ascending byte positions of
//! every field separator in `[start, end)` into the slab, return how many
//! were written and whether the chunk ended outside any quoted field (the
//! speculation-validation signal).
//!
//! - [`second_pass_simd`]: block-mask scan, the fast path;
//! - [`second_pass_branchless`]: table-driven scalar, the reference oracle;
//! - [`second_pass_with_errors`]: table-driven scalar with error collection
//!   and comment-line skipping.

use crate::buffer::PaddedBuffer;
use crate::dialect::Dialect;
use crate::error::{ErrorCode, ErrorCollector, Severity};
use crate::simd::{lane_mask, Backend};
use crate::state_machine::{ByteClass, State, StateMachine};

/// Outcome of one second-pass scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecondPassResult {
    /// Number of separator positions written to the slab.
    pub n_indexes: u64,
    /// True if the scan ended at even quote parity. A `false` from any
    /// non-terminal chunk means the speculated boundary landed inside a
    /// quoted field.
    pub at_record_boundary: bool,
}

/// Block-mask scan of `[start, end)`, writing positions into `slab`.
///
/// Positions come out ascending because lanes are consumed low-to-high and
/// blocks run left-to-right.
pub(crate) fn second_pass_simd(
    backend: Backend,
    buf: &PaddedBuffer,
    start: usize,
    end: usize,
    slab: &mut [u64],
    dialect: &Dialect,
) -> SecondPassResult {
    debug_assert!(start <= end && end <= buf.len());
    let padded = buf.padded();
    let len = end - start;
    let mut prev_inside = 0u64;
    let mut n = 0usize;
    let mut idx = 0;

    while idx < len {
        let remaining = len - idx;
        let valid = lane_mask(remaining);
        let base = start + idx;
        let masks = backend.classify(&padded[base..base + 65], dialect.delimiter, dialect.quote_char);

        let quotes = masks.quotes & valid;
        let inside = backend.quote_mask(quotes, &mut prev_inside);
        let mut field_sep = (masks.delims | masks.line_endings) & !inside & valid;

        while field_sep != 0 {
            slab[n] = (base as u64) + field_sep.trailing_zeros() as u64;
            n += 1;
            field_sep &= field_sep - 1;
        }
        idx += 64;
    }

    SecondPassResult {
        n_indexes: n as u64,
        at_record_boundary: prev_inside == 0,
    }
}

/// Table-driven scalar scan. Same contract as [`second_pass_simd`]; serves
/// as the oracle in property tests.
pub(crate) fn second_pass_branchless(
    buf: &PaddedBuffer,
    start: usize,
    end: usize,
    slab: &mut [u64],
    dialect: &Dialect,
) -> SecondPassResult {
    let sm = StateMachine::new(dialect);
    let padded = buf.padded();
    let mut state = State::RecordStart;
    let mut n = 0usize;

    for pos in start..end {
        let mut class = sm.classify(padded[pos]);
        if class == ByteClass::Cr {
            if padded[pos + 1] == b'\n' {
                // CRLF: the LF is the terminator, the CR is inert.
                continue;
            }
            class = ByteClass::Lf;
        }
        let entry = sm.step(state, class);
        if entry.emits() {
            slab[n] = pos as u64;
            n += 1;
        }
        state = entry.next_state();
    }

    SecondPassResult {
        n_indexes: n as u64,
        at_record_boundary: state != State::QuotedField,
    }
}

/// Table-driven scan with error collection and comment-line skipping.
///
/// Reports unclosed quotes (fatal, terminal chunk only), quotes inside
/// unquoted fields, invalid characters after a closing quote, null bytes,
/// and oversized fields. Lines whose first non-blank byte is the dialect's
/// comment character are skipped without emitting.
pub(crate) fn second_pass_with_errors(
    buf: &PaddedBuffer,
    start: usize,
    end: usize,
    slab: &mut [u64],
    dialect: &Dialect,
    errors: &mut ErrorCollector,
    max_field_size: usize,
) -> SecondPassResult {
    let sm = StateMachine::new(dialect);
    let padded = buf.padded();
    let data = buf.data();
    let total_len = buf.len();
    let mut state = State::RecordStart;
    let mut n = 0usize;
    let mut pos = start;
    let mut at_line_start = true;
    let mut field_start = start;

    while pos < end {
        if at_line_start
            && dialect.has_comments()
            && is_comment_line(data, pos, end, dialect.comment_char)
        {
            pos = skip_to_line_end(data, pos, end);
            field_start = pos;
            continue;
        }
        at_line_start = false;

        let b = padded[pos];
        if b == 0 {
            errors.add(
                ErrorCode::NullByte,
                Severity::Recoverable,
                data,
                pos,
                "null byte in data",
            );
            if errors.should_stop() {
                return SecondPassResult {
                    n_indexes: n as u64,
                    at_record_boundary: state != State::QuotedField,
                };
            }
            pos += 1;
            continue;
        }

        let mut class = sm.classify(b);
        if class == ByteClass::Cr {
            if padded[pos + 1] == b'\n' {
                pos += 1;
                continue;
            }
            class = ByteClass::Lf;
        }

        let entry = sm.step(state, class);
        if let Some(code) = entry.error() {
            let message = match code {
                ErrorCode::QuoteInUnquotedField => "quote character in unquoted field",
                _ => "invalid character after closing quote",
            };
            errors.add(code, Severity::Recoverable, data, pos, message);
            if errors.should_stop() {
                return SecondPassResult {
                    n_indexes: n as u64,
                    at_record_boundary: state != State::QuotedField,
                };
            }
        }
        if entry.emits() {
            if pos - field_start > max_field_size {
                errors.add(
                    ErrorCode::FieldTooLarge,
                    Severity::Recoverable,
                    data,
                    field_start,
                    format!("field of {} bytes exceeds the size limit", pos - field_start),
                );
            }
            slab[n] = pos as u64;
            n += 1;
            field_start = pos + 1;
            if class == ByteClass::Lf {
                at_line_start = true;
            }
        }
        state = entry.next_state();
        pos += 1;
    }

    // An unclosed quote is only decidable at the true end of the input; a
    // chunk ending mid-quote is a speculation miss, not a file error.
    if state == State::QuotedField && end == total_len {
        errors.add(
            ErrorCode::UnclosedQuote,
            Severity::Fatal,
            data,
            end.saturating_sub(1),
            "quoted field not closed before end of input",
        );
    }

    SecondPassResult {
        n_indexes: n as u64,
        at_record_boundary: state != State::QuotedField,
    }
}

/// Whether the line starting at `pos` is a comment line: optional blanks,
/// then the comment character.
pub(crate) fn is_comment_line(data: &[u8], pos: usize, end: usize, comment_char: u8) -> bool {
    let mut i = pos;
    while i < end && (data[i] == b' ' || data[i] == b'\t') {
        i += 1;
    }
    i < end && data[i] == comment_char
}

/// Position just past the current line's terminator (or `end`).
pub(crate) fn skip_to_line_end(data: &[u8], pos: usize, end: usize) -> usize {
    match memchr::memchr2(b'\n', b'\r', &data[pos..end]) {
        Some(rel) => {
            let i = pos + rel;
            if data[i] == b'\r' && i + 1 < end && data[i + 1] == b'\n' {
                i + 2
            } else {
                i + 1
            }
        }
        None => end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorMode;

    fn run_simd(data: &[u8]) -> (Vec<u64>, SecondPassResult) {
        let buf = PaddedBuffer::from_slice(data);
        let mut slab = vec![0u64; data.len() + 8];
        let result = second_pass_simd(
            Backend::detect(),
            &buf,
            0,
            buf.len(),
            &mut slab,
            &Dialect::csv(),
        );
        slab.truncate(result.n_indexes as usize);
        (slab, result)
    }

    fn run_oracle(data: &[u8]) -> (Vec<u64>, SecondPassResult) {
        let buf = PaddedBuffer::from_slice(data);
        let mut slab = vec![0u64; data.len() + 8];
        let result = second_pass_branchless(&buf, 0, buf.len(), &mut slab, &Dialect::csv());
        slab.truncate(result.n_indexes as usize);
        (slab, result)
    }

    #[test]
    fn test_simple_positions() {
        let (positions, result) = run_simd(b"a,b,c\n1,2,3\n");
        assert_eq!(positions, vec![1, 3, 5, 7, 9, 11]);
        assert!(result.at_record_boundary);
        let (oracle, _) = run_oracle(b"a,b,c\n1,2,3\n");
        assert_eq!(positions, oracle);
    }

    #[test]
    fn test_quoted_delimiter_and_newline() {
        let data = b"\"a,b\",c\n\"x\ny\",z\n";
        let (positions, _) = run_simd(data);
        let (oracle, _) = run_oracle(data);
        assert_eq!(positions, oracle);
        assert_eq!(positions, vec![5, 7, 13, 15]);
    }

    #[test]
    fn test_crlf_records_lf() {
        let data = b"a,b\r\n1,2\r\n";
        let (positions, _) = run_simd(data);
        assert_eq!(positions, vec![1, 4, 6, 9]);
        let (oracle, _) = run_oracle(data);
        assert_eq!(positions, oracle);
    }

    #[test]
    fn test_unclosed_quote_not_at_boundary() {
        let (_, result) = run_simd(b"a,b\n\"open,1\n");
        assert!(!result.at_record_boundary);
        let (_, oracle) = run_oracle(b"a,b\n\"open,1\n");
        assert!(!oracle.at_record_boundary);
    }

    #[test]
    fn test_simd_matches_oracle_across_blocks() {
        let mut data = Vec::new();
        for i in 0..50 {
            if i % 7 == 0 {
                data.extend_from_slice(format!("\"q,{i}\nx\",{i}\n").as_bytes());
            } else {
                data.extend_from_slice(format!("r{i},{i},{}\n", i * 3).as_bytes());
            }
        }
        let (simd, rs) = run_simd(&data);
        let (oracle, ro) = run_oracle(&data);
        assert_eq!(simd, oracle);
        assert_eq!(rs, ro);
    }

    #[test]
    fn test_errors_unclosed_quote_fatal() {
        let buf = PaddedBuffer::from_slice(b"a,b\n\"open,1\n");
        let mut slab = vec![0u64; buf.len() + 8];
        let mut errors = ErrorCollector::new(ErrorMode::Permissive);
        let result = second_pass_with_errors(
            &buf,
            0,
            buf.len(),
            &mut slab,
            &Dialect::csv(),
            &mut errors,
            usize::MAX,
        );
        assert!(errors.has_fatal());
        assert_eq!(errors.errors()[0].code, ErrorCode::UnclosedQuote);
        assert!(!result.at_record_boundary);
    }

    #[test]
    fn test_errors_quote_in_unquoted_field() {
        let buf = PaddedBuffer::from_slice(b"a\"b,c\n");
        let mut slab = vec![0u64; buf.len() + 8];
        let mut errors = ErrorCollector::new(ErrorMode::Permissive);
        let result = second_pass_with_errors(
            &buf,
            0,
            buf.len(),
            &mut slab,
            &Dialect::csv(),
            &mut errors,
            usize::MAX,
        );
        assert_eq!(errors.errors()[0].code, ErrorCode::QuoteInUnquotedField);
        // Error recovery keeps indexing the rest of the line.
        assert_eq!(result.n_indexes, 2);
    }

    #[test]
    fn test_errors_null_byte() {
        let buf = PaddedBuffer::from_slice(b"a,\0b\n");
        let mut slab = vec![0u64; buf.len() + 8];
        let mut errors = ErrorCollector::new(ErrorMode::Permissive);
        second_pass_with_errors(
            &buf,
            0,
            buf.len(),
            &mut slab,
            &Dialect::csv(),
            &mut errors,
            usize::MAX,
        );
        assert_eq!(errors.errors()[0].code, ErrorCode::NullByte);
        assert_eq!(errors.errors()[0].byte_offset, 2);
    }

    #[test]
    fn test_comment_lines_not_indexed() {
        let buf = PaddedBuffer::from_slice(b"# comment\nh1,h2\n  # indented\n1,2\n");
        let mut slab = vec![0u64; buf.len() + 8];
        let mut errors = ErrorCollector::new(ErrorMode::Permissive);
        let dialect = Dialect::csv().with_comment_char(b'#');
        let result = second_pass_with_errors(
            &buf,
            0,
            buf.len(),
            &mut slab,
            &dialect,
            &mut errors,
            usize::MAX,
        );
        assert_eq!(result.n_indexes, 4);
        let positions: Vec<u64> = slab[..4].to_vec();
        assert_eq!(positions, vec![12, 15, 30, 32]);
        assert!(!errors.has_errors());
    }

    #[test]
    fn test_field_too_large() {
        let mut data = b"a,".to_vec();
        data.extend(std::iter::repeat(b'x').take(100));
        data.push(b'\n');
        let buf = PaddedBuffer::from_slice(&data);
        let mut slab = vec![0u64; data.len() + 8];
        let mut errors = ErrorCollector::new(ErrorMode::Permissive);
        second_pass_with_errors(&buf, 0, buf.len(), &mut slab, &Dialect::csv(), &mut errors, 50);
        assert!(errors
            .errors()
            .iter()
            .any(|e| e.code == ErrorCode::FieldTooLarge));
    }

    #[test]
    fn test_skip_to_line_end() {
        assert_eq!(skip_to_line_end(b"ab\ncd", 0, 5), 3);
        assert_eq!(skip_to_line_end(b"ab\r\ncd", 0, 6), 4);
        assert_eq!(skip_to_line_end(b"ab\rcd", 0, 5), 3);
        assert_eq!(skip_to_line_end(b"abcd", 0, 4), 4);
    }
}
