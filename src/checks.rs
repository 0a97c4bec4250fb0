//! Post-parse structural checks.
//!
//! Run single-threaded after the workers join, when error collection was
//! requested: empty header, duplicate column names, mixed line endings, and
//! per-row field-count consistency. Each is a sequential scan of the buffer
//! and none feeds back into the index.

use std::collections::HashSet;

use crate::dialect::{Dialect, LineEnding};
use crate::error::{ErrorCode, ErrorCollector, Severity};
use crate::second_pass::{is_comment_line, skip_to_line_end};

pub(crate) fn run_structural_checks(data: &[u8], dialect: &Dialect, errors: &mut ErrorCollector) {
    let header_start = leading_data_offset(data, dialect);
    check_empty_header(data, header_start, errors);
    if errors.should_stop() {
        return;
    }
    check_duplicate_columns(data, header_start, dialect, errors);
    check_line_endings(data, errors);
    check_field_counts(data, header_start, dialect, errors);
}

/// Offset of the first non-comment line.
fn leading_data_offset(data: &[u8], dialect: &Dialect) -> usize {
    let mut pos = 0;
    if dialect.has_comments() {
        while pos < data.len() && is_comment_line(data, pos, data.len(), dialect.comment_char) {
            pos = skip_to_line_end(data, pos, data.len());
        }
    }
    pos
}

fn check_empty_header(data: &[u8], header_start: usize, errors: &mut ErrorCollector) {
    let empty = header_start >= data.len()
        || data[header_start] == b'\n'
        || data[header_start] == b'\r';
    if empty {
        errors.add(
            ErrorCode::EmptyHeader,
            Severity::Recoverable,
            data,
            header_start.min(data.len().saturating_sub(1)),
            "header row is empty",
        );
    }
}

/// Split one line into raw field byte ranges, honoring quotes.
fn line_fields(data: &[u8], start: usize, dialect: &Dialect) -> (Vec<(usize, usize)>, usize) {
    let mut fields = Vec::new();
    let mut field_start = start;
    let mut in_quote = false;
    let mut pos = start;
    while pos < data.len() {
        let b = data[pos];
        if b == dialect.quote_char {
            in_quote = !in_quote;
        } else if !in_quote {
            if b == dialect.delimiter {
                fields.push((field_start, pos));
                field_start = pos + 1;
            } else if b == b'\n' || (b == b'\r' && data.get(pos + 1) != Some(&b'\n')) {
                break;
            } else if b == b'\r' {
                // CRLF: the span ends before the CR.
                fields.push((field_start, pos));
                return (fields, skip_to_line_end(data, pos, data.len()));
            }
        }
        pos += 1;
    }
    fields.push((field_start, pos));
    (fields, skip_to_line_end(data, pos.min(data.len()), data.len()))
}

fn check_duplicate_columns(
    data: &[u8],
    header_start: usize,
    dialect: &Dialect,
    errors: &mut ErrorCollector,
) {
    if header_start >= data.len() {
        return;
    }
    let (fields, _) = line_fields(data, header_start, dialect);
    let mut seen: HashSet<&[u8]> = HashSet::with_capacity(fields.len());
    for &(start, end) in &fields {
        let mut name = &data[start..end];
        // Compare the unquoted spelling so "a" and a both collide.
        if name.len() >= 2
            && name[0] == dialect.quote_char
            && name[name.len() - 1] == dialect.quote_char
        {
            name = &name[1..name.len() - 1];
        }
        if !seen.insert(name) {
            errors.add(
                ErrorCode::DuplicateColumnNames,
                Severity::Warning,
                data,
                start,
                format!(
                    "duplicate column name \"{}\"",
                    String::from_utf8_lossy(name)
                ),
            );
        }
    }
}

fn check_line_endings(data: &[u8], errors: &mut ErrorCollector) {
    let mut lf = 0usize;
    let mut crlf = 0usize;
    let mut bare_cr = 0usize;
    let mut first_minority = None;
    let mut i = 0;
    while i < data.len() {
        match data[i] {
            b'\r' => {
                if data.get(i + 1) == Some(&b'\n') {
                    crlf += 1;
                    if first_minority.is_none() && (lf > 0 || bare_cr > 0) {
                        first_minority = Some(i);
                    }
                    i += 2;
                    continue;
                }
                bare_cr += 1;
                if first_minority.is_none() && (lf > 0 || crlf > 0) {
                    first_minority = Some(i);
                }
            }
            b'\n' => {
                lf += 1;
                if first_minority.is_none() && (crlf > 0 || bare_cr > 0) {
                    first_minority = Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    let kinds = [lf > 0, crlf > 0, bare_cr > 0].iter().filter(|&&k| k).count();
    if kinds > 1 {
        errors.add(
            ErrorCode::MixedLineEndings,
            Severity::Warning,
            data,
            first_minority.unwrap_or(0),
            "file mixes line-ending styles",
        );
    }
}

/// Classify the line endings actually present; used to set the
/// informational flag on a detected dialect.
pub fn detect_line_ending(data: &[u8]) -> LineEnding {
    let mut lf = false;
    let mut crlf = false;
    let mut bare_cr = false;
    let mut i = 0;
    while i < data.len() {
        match data[i] {
            b'\r' if data.get(i + 1) == Some(&b'\n') => {
                crlf = true;
                i += 2;
                continue;
            }
            b'\r' => bare_cr = true,
            b'\n' => lf = true,
            _ => {}
        }
        i += 1;
    }
    match (lf, crlf, bare_cr) {
        (false, false, false) => LineEnding::Unknown,
        (true, false, false) => LineEnding::Lf,
        (false, true, false) => LineEnding::CrLf,
        (false, false, true) => LineEnding::Cr,
        _ => LineEnding::Mixed,
    }
}

fn check_field_counts(
    data: &[u8],
    header_start: usize,
    dialect: &Dialect,
    errors: &mut ErrorCollector,
) {
    if header_start >= data.len() {
        return;
    }
    let (header, mut pos) = line_fields(data, header_start, dialect);
    let expected = header.len();
    while pos < data.len() {
        if dialect.has_comments() && is_comment_line(data, pos, data.len(), dialect.comment_char) {
            pos = skip_to_line_end(data, pos, data.len());
            continue;
        }
        let row_start = pos;
        let (fields, next) = line_fields(data, pos, dialect);
        // The empty tail after a trailing terminator is not a row.
        if next >= data.len() && fields.len() == 1 && fields[0].0 == fields[0].1 {
            break;
        }
        if fields.len() != expected {
            errors.add(
                ErrorCode::InconsistentFieldCount,
                Severity::Recoverable,
                data,
                row_start,
                format!("expected {expected} fields, found {}", fields.len()),
            );
            if errors.should_stop() {
                return;
            }
        }
        pos = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorMode;

    fn run(data: &[u8], dialect: &Dialect) -> ErrorCollector {
        let mut errors = ErrorCollector::new(ErrorMode::Permissive);
        run_structural_checks(data, dialect, &mut errors);
        errors
    }

    #[test]
    fn test_clean_file_has_no_findings() {
        let errors = run(b"a,b,c\n1,2,3\n4,5,6\n", &Dialect::csv());
        assert!(!errors.has_errors());
    }

    #[test]
    fn test_empty_header() {
        let errors = run(b"\n1,2\n", &Dialect::csv());
        assert!(errors
            .errors()
            .iter()
            .any(|e| e.code == ErrorCode::EmptyHeader));
    }

    #[test]
    fn test_duplicate_columns() {
        let errors = run(b"id,name,id\n1,x,2\n", &Dialect::csv());
        let dup: Vec<_> = errors
            .errors()
            .iter()
            .filter(|e| e.code == ErrorCode::DuplicateColumnNames)
            .collect();
        assert_eq!(dup.len(), 1);
        assert_eq!(dup[0].severity, Severity::Warning);
    }

    #[test]
    fn test_quoted_duplicate_detected() {
        let errors = run(b"\"id\",id\n1,2\n", &Dialect::csv());
        assert!(errors
            .errors()
            .iter()
            .any(|e| e.code == ErrorCode::DuplicateColumnNames));
    }

    #[test]
    fn test_mixed_line_endings() {
        let errors = run(b"a,b\r\n1,2\n", &Dialect::csv());
        assert!(errors
            .errors()
            .iter()
            .any(|e| e.code == ErrorCode::MixedLineEndings));
    }

    #[test]
    fn test_field_count_mismatch() {
        let errors = run(b"a,b,c\n1,2\n3,4,5\n", &Dialect::csv());
        let bad: Vec<_> = errors
            .errors()
            .iter()
            .filter(|e| e.code == ErrorCode::InconsistentFieldCount)
            .collect();
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].line, 2);
    }

    #[test]
    fn test_field_count_ignores_quoted_delimiters() {
        let errors = run(b"a,b\n\"x,y\",2\n", &Dialect::csv());
        assert!(!errors
            .errors()
            .iter()
            .any(|e| e.code == ErrorCode::InconsistentFieldCount));
    }

    #[test]
    fn test_comment_lines_skipped() {
        let dialect = Dialect::csv().with_comment_char(b'#');
        let errors = run(b"# note\na,b\n# another\n1,2\n", &dialect);
        assert!(!errors.has_errors());
    }

    #[test]
    fn test_detect_line_ending() {
        assert_eq!(detect_line_ending(b"a\nb\n"), LineEnding::Lf);
        assert_eq!(detect_line_ending(b"a\r\nb\r\n"), LineEnding::CrLf);
        assert_eq!(detect_line_ending(b"a\rb\r"), LineEnding::Cr);
        assert_eq!(detect_line_ending(b"a\r\nb\n"), LineEnding::Mixed);
        assert_eq!(detect_line_ending(b"plain"), LineEnding::Unknown);
    }
}
