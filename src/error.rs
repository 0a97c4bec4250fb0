//! Error taxonomy and collection for parsing.
//!
//! Errors are classified along three axes: the [`ErrorCode`] (what went
//! wrong), the [`Severity`] (whether the parser can continue), and the
//! [`ErrorMode`] of the collector (how eagerly to stop). Workers each own an
//! [`ErrorCollector`]; the orchestrator merges them after joining and sorts
//! the result by byte offset.

use thiserror::Error;

/// Default cap on collected errors before suppression kicks in.
pub const DEFAULT_MAX_ERRORS: usize = 10_000;

/// Default limit on individual field size (16 MB).
pub const DEFAULT_MAX_FIELD_SIZE: usize = 16 * 1024 * 1024;

/// Default limit on total file size (4 GB).
pub const DEFAULT_MAX_FILE_SIZE: usize = 4 * 1024 * 1024 * 1024;

/// Bytes of context captured on each side of an error position.
const ERROR_CONTEXT_SIZE: usize = 20;

/// Classification of parse errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ErrorCode {
    #[error("no error")]
    None,
    #[error("quoted field not closed before end of input")]
    UnclosedQuote,
    #[error("invalid character after closing quote")]
    InvalidQuoteEscape,
    #[error("quote character in unquoted field")]
    QuoteInUnquotedField,
    #[error("row has a different number of fields than the header")]
    InconsistentFieldCount,
    #[error("field exceeds the maximum size limit")]
    FieldTooLarge,
    #[error("file mixes line-ending styles")]
    MixedLineEndings,
    #[error("invalid UTF-8 byte sequence")]
    InvalidUtf8,
    #[error("unexpected null byte in data")]
    NullByte,
    #[error("header row is empty")]
    EmptyHeader,
    #[error("header contains duplicate column names")]
    DuplicateColumnNames,
    #[error("separator cannot be determined reliably")]
    AmbiguousSeparator,
    #[error("file exceeds the maximum size limit")]
    FileTooLarge,
    #[error("index allocation would overflow")]
    IndexAllocationOverflow,
    #[error("file I/O error")]
    IoError,
    #[error("internal parser error")]
    InternalError,
}

/// How serious an error is and whether parsing can continue past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Recoverable,
    Fatal,
}

/// How eagerly a collector stops parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorMode {
    /// Stop at the first error of any severity.
    FailFast,
    /// Continue past recoverable errors, stop on fatal.
    #[default]
    Permissive,
    /// Suppress all non-fatal errors.
    BestEffort,
}

/// A single parse error with its location and context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub code: ErrorCode,
    pub severity: Severity,
    /// 1-based line number.
    pub line: usize,
    /// 1-based column number.
    pub column: usize,
    /// Byte offset into the source buffer.
    pub byte_offset: usize,
    pub message: String,
    /// Printable-safe excerpt of the bytes around the error position.
    pub context: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "line {}, column {} (byte {}): {}",
            self.line, self.column, self.byte_offset, self.message
        )
    }
}

impl std::error::Error for ParseError {}

/// Accumulates parse errors up to a configurable cap.
///
/// A fatal error always sets the sticky `has_fatal` flag, even when the
/// error itself was suppressed by the cap, so `should_stop()` remains
/// correct after truncation.
#[derive(Debug, Clone)]
pub struct ErrorCollector {
    mode: ErrorMode,
    max_errors: usize,
    errors: Vec<ParseError>,
    suppressed: usize,
    has_fatal: bool,
}

impl Default for ErrorCollector {
    fn default() -> Self {
        Self::new(ErrorMode::Permissive)
    }
}

impl ErrorCollector {
    pub fn new(mode: ErrorMode) -> Self {
        Self::with_max_errors(mode, DEFAULT_MAX_ERRORS)
    }

    pub fn with_max_errors(mode: ErrorMode, max_errors: usize) -> Self {
        Self {
            mode,
            max_errors,
            errors: Vec::new(),
            suppressed: 0,
            has_fatal: false,
        }
    }

    pub fn mode(&self) -> ErrorMode {
        self.mode
    }

    /// Record an error, honoring the collection cap and the best-effort
    /// suppression rule.
    pub fn record(&mut self, error: ParseError) {
        if error.severity == Severity::Fatal {
            self.has_fatal = true;
        } else if self.mode == ErrorMode::BestEffort {
            self.suppressed += 1;
            return;
        }
        if self.errors.len() >= self.max_errors {
            self.suppressed += 1;
            return;
        }
        self.errors.push(error);
    }

    /// Convenience for call sites that compute location lazily.
    pub fn add(
        &mut self,
        code: ErrorCode,
        severity: Severity,
        buf: &[u8],
        byte_offset: usize,
        message: impl Into<String>,
    ) {
        let (line, column) = line_column(buf, byte_offset);
        self.record(ParseError {
            code,
            severity,
            line,
            column,
            byte_offset,
            message: message.into(),
            context: context_snippet(buf, byte_offset),
        });
    }

    /// Whether parsing should stop, given the mode and errors seen so far.
    pub fn should_stop(&self) -> bool {
        match self.mode {
            ErrorMode::FailFast => self.has_fatal || !self.errors.is_empty(),
            ErrorMode::Permissive | ErrorMode::BestEffort => self.has_fatal,
        }
    }

    pub fn has_fatal(&self) -> bool {
        self.has_fatal
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty() || self.suppressed > 0
    }

    pub fn errors(&self) -> &[ParseError] {
        &self.errors
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Errors dropped after the cap was reached (or by best-effort mode).
    pub fn suppressed_count(&self) -> usize {
        self.suppressed
    }

    pub fn at_error_limit(&self) -> bool {
        self.errors.len() >= self.max_errors
    }

    /// Fold another collector into this one, honoring the cap.
    pub fn merge(&mut self, other: ErrorCollector) {
        self.suppressed += other.suppressed;
        self.has_fatal |= other.has_fatal;
        let available = self.max_errors.saturating_sub(self.errors.len());
        let take = other.errors.len().min(available);
        self.suppressed += other.errors.len() - take;
        self.errors.extend(other.errors.into_iter().take(take));
    }

    /// Sort collected errors by byte offset (used after merging workers).
    pub fn sort_by_offset(&mut self) {
        self.errors.sort_by_key(|e| e.byte_offset);
    }

    pub fn clear(&mut self) {
        self.errors.clear();
        self.suppressed = 0;
        self.has_fatal = false;
    }
}

/// Compute the 1-based line and column of a byte offset.
///
/// Scans the buffer up to the offset; intended for error paths only.
pub(crate) fn line_column(buf: &[u8], offset: usize) -> (usize, usize) {
    let end = offset.min(buf.len());
    let mut line = 1;
    let mut column = 1;
    for &b in &buf[..end] {
        if b == b'\n' {
            line += 1;
            column = 1;
        } else if b != b'\r' {
            column += 1;
        }
    }
    (line, column)
}

/// Extract a printable-safe excerpt around a byte position.
pub(crate) fn context_snippet(buf: &[u8], pos: usize) -> String {
    if buf.is_empty() {
        return String::new();
    }
    let safe_pos = pos.min(buf.len() - 1);
    let start = safe_pos.saturating_sub(ERROR_CONTEXT_SIZE);
    let end = (safe_pos + ERROR_CONTEXT_SIZE).min(buf.len());
    let mut out = String::with_capacity((end - start) * 2);
    for &b in &buf[start..end] {
        match b {
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            0 => out.push_str("\\0"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push('?'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(code: ErrorCode, severity: Severity, offset: usize) -> ParseError {
        ParseError {
            code,
            severity,
            line: 1,
            column: 1,
            byte_offset: offset,
            message: String::new(),
            context: String::new(),
        }
    }

    #[test]
    fn test_fail_fast_stops_on_first() {
        let mut c = ErrorCollector::new(ErrorMode::FailFast);
        assert!(!c.should_stop());
        c.record(err(ErrorCode::NullByte, Severity::Recoverable, 0));
        assert!(c.should_stop());
    }

    #[test]
    fn test_permissive_continues_until_fatal() {
        let mut c = ErrorCollector::new(ErrorMode::Permissive);
        c.record(err(ErrorCode::NullByte, Severity::Recoverable, 0));
        assert!(!c.should_stop());
        c.record(err(ErrorCode::UnclosedQuote, Severity::Fatal, 5));
        assert!(c.should_stop());
        assert!(c.has_fatal());
    }

    #[test]
    fn test_fatal_sticky_under_suppression() {
        let mut c = ErrorCollector::with_max_errors(ErrorMode::Permissive, 1);
        c.record(err(ErrorCode::NullByte, Severity::Recoverable, 0));
        c.record(err(ErrorCode::UnclosedQuote, Severity::Fatal, 5));
        assert_eq!(c.error_count(), 1);
        assert_eq!(c.suppressed_count(), 1);
        assert!(c.has_fatal());
        assert!(c.should_stop());
    }

    #[test]
    fn test_best_effort_suppresses_recoverable() {
        let mut c = ErrorCollector::new(ErrorMode::BestEffort);
        c.record(err(ErrorCode::NullByte, Severity::Recoverable, 0));
        assert_eq!(c.error_count(), 0);
        assert_eq!(c.suppressed_count(), 1);
        assert!(!c.should_stop());
    }

    #[test]
    fn test_merge_respects_cap() {
        let mut a = ErrorCollector::with_max_errors(ErrorMode::Permissive, 2);
        a.record(err(ErrorCode::NullByte, Severity::Recoverable, 0));
        let mut b = ErrorCollector::new(ErrorMode::Permissive);
        b.record(err(ErrorCode::NullByte, Severity::Recoverable, 1));
        b.record(err(ErrorCode::NullByte, Severity::Recoverable, 2));
        a.merge(b);
        assert_eq!(a.error_count(), 2);
        assert_eq!(a.suppressed_count(), 1);
    }

    #[test]
    fn test_line_column() {
        let buf = b"ab\ncd\r\nef";
        assert_eq!(line_column(buf, 0), (1, 1));
        assert_eq!(line_column(buf, 4), (2, 2));
        assert_eq!(line_column(buf, 7), (3, 1));
    }

    #[test]
    fn test_context_snippet_escapes() {
        let buf = b"a\n\x01b";
        let ctx = context_snippet(buf, 1);
        assert_eq!(ctx, "a\\n?b");
    }
}
