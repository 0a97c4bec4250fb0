//! Dialect configuration for delimited text.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Line-ending style observed in a file.
///
/// Informational only; parsing accepts LF, CRLF, and bare CR regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LineEnding {
    #[default]
    Unknown,
    Lf,
    CrLf,
    Cr,
    Mixed,
}

/// Dialect of a delimited file: which bytes separate, quote, and escape.
///
/// Invariants: `delimiter != quote_char`, and neither may be `\n` or `\r`.
/// The builders debug-assert these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Dialect {
    /// Field delimiter (default: `b','`)
    pub delimiter: u8,
    /// Quote character (default: `b'"'`)
    pub quote_char: u8,
    /// Escape character; equal to `quote_char` for RFC 4180 doubling
    pub escape_char: u8,
    /// Whether `""` inside a quoted field unescapes to `"`
    pub double_quote: bool,
    /// Comment character; `0` means no comment lines
    pub comment_char: u8,
    /// Line-ending style detected for this input, if known
    pub line_ending: LineEnding,
}

impl Default for Dialect {
    fn default() -> Self {
        Self {
            delimiter: b',',
            quote_char: b'"',
            escape_char: b'"',
            double_quote: true,
            comment_char: 0,
            line_ending: LineEnding::Unknown,
        }
    }
}

impl Dialect {
    /// Create a CSV dialect (comma-separated).
    pub fn csv() -> Self {
        Self::default()
    }

    /// Create a TSV dialect (tab-separated).
    pub fn tsv() -> Self {
        Self {
            delimiter: b'\t',
            ..Self::default()
        }
    }

    /// Create a PSV dialect (pipe-separated).
    pub fn psv() -> Self {
        Self {
            delimiter: b'|',
            ..Self::default()
        }
    }

    /// Create a semicolon-separated dialect.
    pub fn ssv() -> Self {
        Self {
            delimiter: b';',
            ..Self::default()
        }
    }

    /// Set the field delimiter.
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        debug_assert!(delimiter != self.quote_char);
        debug_assert!(delimiter != b'\n' && delimiter != b'\r');
        self.delimiter = delimiter;
        self
    }

    /// Set the quote character.
    pub fn with_quote_char(mut self, quote_char: u8) -> Self {
        debug_assert!(quote_char != self.delimiter);
        debug_assert!(quote_char != b'\n' && quote_char != b'\r');
        // RFC 4180 doubling follows the quote character unless an explicit
        // escape was configured.
        if self.escape_char == self.quote_char {
            self.escape_char = quote_char;
        }
        self.quote_char = quote_char;
        self
    }

    /// Set the escape character (disables RFC 4180 doubling when it differs
    /// from the quote character).
    pub fn with_escape_char(mut self, escape_char: u8) -> Self {
        self.escape_char = escape_char;
        self.double_quote = escape_char == self.quote_char;
        self
    }

    /// Set the comment character. Lines whose first non-blank byte equals it
    /// are skipped entirely.
    pub fn with_comment_char(mut self, comment_char: u8) -> Self {
        self.comment_char = comment_char;
        self
    }

    /// Whether comment-line skipping is enabled.
    #[inline]
    pub fn has_comments(&self) -> bool {
        self.comment_char != 0
    }
}
