//! Table-driven CSV state machine.
//!
//! Two lookup tables drive field recognition without data-dependent
//! branches: one maps each byte to a character class, one maps
//! `(state, class)` to a packed next-state / emit-flag / error-flag entry.
//! The scalar drivers in `second_pass` use it both as the error-reporting
//! path and as the reference oracle for the SIMD path.

use crate::dialect::Dialect;
use crate::error::ErrorCode;

/// Character classes fed to the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ByteClass {
    Delim = 0,
    Quote = 1,
    Cr = 2,
    Lf = 3,
    Other = 4,
}

const CLASS_COUNT: usize = 5;

/// Parser states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum State {
    RecordStart = 0,
    FieldStart = 1,
    UnquotedField = 2,
    QuotedField = 3,
    /// Just saw a quote inside a quoted field; may close it or escape.
    QuotedEnd = 4,
}

const STATE_COUNT: usize = 5;

/// Packed transition entry: bits 0..3 next state, bit 3 emit, bits 4..6
/// error tag (0 = none, 1 = quote in unquoted field, 2 = invalid character
/// after closing quote).
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Entry(u8);

impl Entry {
    fn new(next: State, emit: bool, error: u8) -> Self {
        Entry((next as u8) | ((emit as u8) << 3) | (error << 4))
    }

    #[inline]
    pub fn next_state(self) -> State {
        match self.0 & 0b111 {
            0 => State::RecordStart,
            1 => State::FieldStart,
            2 => State::UnquotedField,
            3 => State::QuotedField,
            _ => State::QuotedEnd,
        }
    }

    #[inline]
    pub fn emits(self) -> bool {
        self.0 & 0b1000 != 0
    }

    #[inline]
    pub fn error(self) -> Option<ErrorCode> {
        match self.0 >> 4 {
            0 => None,
            1 => Some(ErrorCode::QuoteInUnquotedField),
            _ => Some(ErrorCode::InvalidQuoteEscape),
        }
    }
}

/// Precomputed classification and transition tables for one dialect.
pub(crate) struct StateMachine {
    class: [ByteClass; 256],
    transition: [[Entry; CLASS_COUNT]; STATE_COUNT],
}

impl StateMachine {
    pub fn new(dialect: &Dialect) -> Self {
        let mut class = [ByteClass::Other; 256];
        class[b'\r' as usize] = ByteClass::Cr;
        class[b'\n' as usize] = ByteClass::Lf;
        class[dialect.delimiter as usize] = ByteClass::Delim;
        class[dialect.quote_char as usize] = ByteClass::Quote;

        use State::*;
        let mut transition = [[Entry::default(); CLASS_COUNT]; STATE_COUNT];
        for (s, row) in [RecordStart, FieldStart, UnquotedField, QuotedField, QuotedEnd]
            .into_iter()
            .zip(transition.iter_mut())
        {
            // A delimiter or row terminator ends a field unless we are
            // inside a quoted one. Lf stands for any terminator here; the
            // driver folds bare CR into Lf and CRLF's CR into Other.
            row[ByteClass::Delim as usize] = match s {
                QuotedField => Entry::new(QuotedField, false, 0),
                _ => Entry::new(FieldStart, true, 0),
            };
            row[ByteClass::Lf as usize] = match s {
                QuotedField => Entry::new(QuotedField, false, 0),
                _ => Entry::new(RecordStart, true, 0),
            };
            row[ByteClass::Quote as usize] = match s {
                RecordStart | FieldStart => Entry::new(QuotedField, false, 0),
                UnquotedField => Entry::new(UnquotedField, false, 1),
                QuotedField => Entry::new(QuotedEnd, false, 0),
                QuotedEnd => Entry::new(QuotedField, false, 0),
            };
            row[ByteClass::Other as usize] = match s {
                QuotedField => Entry::new(QuotedField, false, 0),
                QuotedEnd => Entry::new(UnquotedField, false, 2),
                _ => Entry::new(UnquotedField, false, 0),
            };
            // Cr entries are never consulted directly; the driver resolves
            // CR to Lf or Other first. Mirror Other to keep the table total.
            row[ByteClass::Cr as usize] = row[ByteClass::Other as usize];
        }

        Self { class, transition }
    }

    #[inline]
    pub fn classify(&self, byte: u8) -> ByteClass {
        self.class[byte as usize]
    }

    #[inline]
    pub fn step(&self, state: State, class: ByteClass) -> Entry {
        self.transition[state as usize][class as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        let sm = StateMachine::new(&Dialect::csv());
        assert_eq!(sm.classify(b','), ByteClass::Delim);
        assert_eq!(sm.classify(b'"'), ByteClass::Quote);
        assert_eq!(sm.classify(b'\n'), ByteClass::Lf);
        assert_eq!(sm.classify(b'\r'), ByteClass::Cr);
        assert_eq!(sm.classify(b'x'), ByteClass::Other);
    }

    #[test]
    fn test_quoted_field_swallows_separators() {
        let sm = StateMachine::new(&Dialect::csv());
        let e = sm.step(State::QuotedField, ByteClass::Delim);
        assert!(!e.emits());
        assert_eq!(e.next_state(), State::QuotedField);
        let e = sm.step(State::QuotedField, ByteClass::Lf);
        assert!(!e.emits());
    }

    #[test]
    fn test_escaped_quote_round_trip() {
        let sm = StateMachine::new(&Dialect::csv());
        let e = sm.step(State::QuotedField, ByteClass::Quote);
        assert_eq!(e.next_state(), State::QuotedEnd);
        let e = sm.step(State::QuotedEnd, ByteClass::Quote);
        assert_eq!(e.next_state(), State::QuotedField);
        assert!(e.error().is_none());
    }

    #[test]
    fn test_error_entries() {
        let sm = StateMachine::new(&Dialect::csv());
        let e = sm.step(State::UnquotedField, ByteClass::Quote);
        assert_eq!(e.error(), Some(ErrorCode::QuoteInUnquotedField));
        assert_eq!(e.next_state(), State::UnquotedField);

        let e = sm.step(State::QuotedEnd, ByteClass::Other);
        assert_eq!(e.error(), Some(ErrorCode::InvalidQuoteEscape));
        assert_eq!(e.next_state(), State::UnquotedField);
    }

    #[test]
    fn test_emit_transitions() {
        let sm = StateMachine::new(&Dialect::csv());
        for s in [
            State::RecordStart,
            State::FieldStart,
            State::UnquotedField,
            State::QuotedEnd,
        ] {
            assert!(sm.step(s, ByteClass::Delim).emits(), "{s:?}");
            assert_eq!(sm.step(s, ByteClass::Delim).next_state(), State::FieldStart);
            assert!(sm.step(s, ByteClass::Lf).emits(), "{s:?}");
            assert_eq!(sm.step(s, ByteClass::Lf).next_state(), State::RecordStart);
        }
    }
}
