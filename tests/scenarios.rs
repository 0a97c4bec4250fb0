//! End-to-end scenarios over the full pipeline.

use csvidx::{
    Dialect, ErrorCode, ErrorMode, PaddedBuffer, ParseOptions, Parser, ValueExtractor,
};

fn parse(data: &[u8], n_threads: usize) -> csvidx::ParseOutcome {
    let buf = PaddedBuffer::from_slice(data);
    Parser::new(n_threads).parse(&buf, &ParseOptions::default())
}

fn flat(outcome: &mut csvidx::ParseOutcome) -> Vec<u64> {
    outcome.index.compact();
    outcome.index.flat().unwrap().to_vec()
}

#[test]
fn scenario_a_basic() {
    let data = b"a,b,c\n1,2,3\n4,5,6\n";
    let mut outcome = parse(data, 1);
    assert!(outcome.success());
    assert_eq!(flat(&mut outcome), vec![1, 3, 5, 7, 9, 11, 13, 15, 17]);
    assert_eq!(outcome.index.columns(), 3);

    let buf = PaddedBuffer::from_slice(data);
    let ex = ValueExtractor::new(buf.data(), &outcome.index, Dialect::csv());
    assert_eq!(ex.num_rows(), 2);
    assert_eq!(ex.string_view(0, 0), b"1");
    let v = ex.get::<i64>(1, 2);
    assert!(v.is_ok());
    assert_eq!(v.ok(), Some(6));
}

#[test]
fn scenario_b_embedded_delimiters_and_newlines() {
    let data = b"k,v\n\"hello, world\",1\n\"line\nbreak\",2\n";
    let mut outcome = parse(data, 1);
    assert!(outcome.success());
    // Two separators per record: the comma after the quoted field and the
    // terminator. The embedded comma and newline are not indexed.
    assert_eq!(flat(&mut outcome).len(), 6);

    let buf = PaddedBuffer::from_slice(data);
    // Physical row indexing: row 0 is the "k,v" line.
    let ex = ValueExtractor::new(buf.data(), &outcome.index, Dialect::csv()).with_header(false);
    assert_eq!(ex.string(1, 0), "hello, world");
    assert_eq!(ex.string(2, 0), "line\nbreak");
}

#[test]
fn scenario_c_escaped_quotes() {
    let data = b"q\n\"he said \"\"hi\"\"\"\n\"\"\"\"\n";
    let outcome = parse(data, 1);
    assert!(outcome.success());

    let buf = PaddedBuffer::from_slice(data);
    let ex = ValueExtractor::new(buf.data(), &outcome.index, Dialect::csv());
    assert_eq!(ex.string(0, 0), "he said \"hi\"");
    assert_eq!(ex.string(1, 0), "\"");
}

#[test]
fn scenario_d_crlf_and_bare_cr() {
    let data = b"a,b\r\n1,2\r\n3,4\r\n";
    let mut outcome = parse(data, 1);
    assert!(outcome.success());
    let positions = flat(&mut outcome);
    // Three records; every terminator position is the LF byte, not the CR.
    let terminators: Vec<u64> = positions
        .iter()
        .copied()
        .filter(|&p| data[p as usize] == b'\n')
        .collect();
    assert_eq!(terminators, vec![4, 9, 14]);

    // Bare CR terminates records too.
    let bare = b"a,b\r1,2\r";
    let mut outcome = parse(bare, 1);
    let positions = flat(&mut outcome);
    assert_eq!(positions, vec![1, 3, 5, 7]);
}

#[test]
fn scenario_e_unclosed_quote() {
    let data = b"a,b\n\"open,1\n";
    let buf = PaddedBuffer::from_slice(data);

    let options = ParseOptions {
        error_mode: Some(ErrorMode::Permissive),
        ..ParseOptions::default()
    };
    let outcome = Parser::new(1).parse(&buf, &options);
    assert!(!outcome.success());
    assert!(!outcome.errors.errors().is_empty());
    assert!(outcome
        .errors
        .errors()
        .iter()
        .any(|e| e.code == ErrorCode::UnclosedQuote));

    let options = ParseOptions {
        error_mode: Some(ErrorMode::FailFast),
        ..ParseOptions::default()
    };
    let outcome = Parser::new(1).parse(&buf, &options);
    assert!(!outcome.success());
    assert!(outcome.errors.has_fatal());
}

/// A quoted field with embedded newlines spanning a chunk boundary must
/// trip the speculation check and still produce an index identical to the
/// single-threaded parse.
#[test]
fn scenario_f_speculation_miss() {
    let mut data = Vec::with_capacity(4 << 20);
    let filler = b"alpha,beta,gamma,delta\n";
    // ~1.9 MB of plain rows.
    while data.len() < (1 << 21) {
        data.extend_from_slice(filler);
    }
    // One ~1.2 MB quoted field full of newlines, crossing several of the
    // 8-worker chunk boundaries.
    data.extend_from_slice(b"\"");
    for _ in 0..60_000 {
        data.extend_from_slice(b"embedded\nline ");
    }
    data.extend_from_slice(b"\",tail\n");
    while data.len() < (4 << 20) {
        data.extend_from_slice(filler);
    }

    let mut single = parse(&data, 1);
    let mut multi = parse(&data, 8);
    assert!(single.success());
    assert!(multi.success());
    assert_eq!(flat(&mut single), flat(&mut multi));
    assert_eq!(single.index.columns(), multi.index.columns());
}

#[test]
fn scenario_h_comment_lines() {
    let data = b"# a comment\nh1,h2\n# middle comment\n1,2\n";
    let buf = PaddedBuffer::from_slice(data);
    let dialect = Dialect::csv().with_comment_char(b'#');
    let options = ParseOptions {
        dialect,
        ..ParseOptions::default()
    };
    let outcome = Parser::new(1).parse(&buf, &options);
    assert!(outcome.success());

    let ex = ValueExtractor::new(buf.data(), &outcome.index, dialect);
    assert_eq!(ex.num_rows(), 1);
    assert_eq!(ex.header(), vec!["h1".to_string(), "h2".to_string()]);
    assert_eq!(ex.get::<i64>(0, 0).ok(), Some(1));
}

#[test]
fn column_major_extraction_agrees() {
    let data = b"a,b\n1,2\n3,4\n5,6\n";
    let buf = PaddedBuffer::from_slice(data);
    let mut outcome = Parser::new(1).parse(&buf, &ParseOptions::default());
    outcome.index.compact_column_major();
    assert!(outcome.index.col_major().is_some());

    let ex = ValueExtractor::new(buf.data(), &outcome.index, Dialect::csv());
    assert_eq!(ex.column::<i64>(0), vec![Some(1), Some(3), Some(5)]);
    assert_eq!(ex.column::<i64>(1), vec![Some(2), Some(4), Some(6)]);
}

#[test]
fn dialects_tsv_and_pipe() {
    let data = b"a\tb\n1\t2\n";
    let buf = PaddedBuffer::from_slice(data);
    let options = ParseOptions {
        dialect: Dialect::tsv(),
        ..ParseOptions::default()
    };
    let outcome = Parser::new(1).parse(&buf, &options);
    let ex = ValueExtractor::new(buf.data(), &outcome.index, Dialect::tsv());
    assert_eq!(ex.get::<i64>(0, 1).ok(), Some(2));

    let data = b"a|b\n1|2\n";
    let buf = PaddedBuffer::from_slice(data);
    let options = ParseOptions {
        dialect: Dialect::psv(),
        ..ParseOptions::default()
    };
    let outcome = Parser::new(1).parse(&buf, &options);
    let ex = ValueExtractor::new(buf.data(), &outcome.index, Dialect::psv());
    assert_eq!(ex.get::<i64>(0, 0).ok(), Some(1));
}

#[test]
fn structural_checks_surface_warnings() {
    let data = b"id,id\n1,2\n3\n";
    let buf = PaddedBuffer::from_slice(data);
    let options = ParseOptions {
        error_mode: Some(ErrorMode::Permissive),
        ..ParseOptions::default()
    };
    let outcome = Parser::new(1).parse(&buf, &options);
    // Warnings and recoverable findings leave the parse successful.
    assert!(outcome.success());
    assert!(outcome.has_errors());
    let codes: Vec<ErrorCode> = outcome.errors.errors().iter().map(|e| e.code).collect();
    assert!(codes.contains(&ErrorCode::DuplicateColumnNames));
    assert!(codes.contains(&ErrorCode::InconsistentFieldCount));
}
