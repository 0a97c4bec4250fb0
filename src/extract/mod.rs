//! On-demand value extraction over a parsed index.
//!
//! A [`ValueExtractor`] turns `(row, col)` into byte spans, string views,
//! and typed values without materializing anything up front. It is a
//! read-only consumer of the buffer and the index; hand out as many as
//! needed, or use [`SharedExtractor`] to tie their lifetimes to
//! reference-counted owners.

mod config;
mod convert;

pub use config::{ColumnConfig, ColumnConfigMap, ExtractionConfig, TypeHint};
pub use convert::{ExtractResult, FieldParse};

use std::sync::Arc;

use crate::buffer::PaddedBuffer;
use crate::dialect::Dialect;
use crate::index::{FieldSpan, IndexStore, SharedIndex};

use convert::trim_blanks;

/// Typed, zero-copy access to the fields of one parsed buffer.
pub struct ValueExtractor<'a> {
    data: &'a [u8],
    index: &'a IndexStore,
    dialect: Dialect,
    config: ExtractionConfig,
    column_configs: Vec<Option<ColumnConfig>>,
    has_header: bool,
    num_columns: usize,
    num_rows: usize,
    skip: usize,
    n_max: usize,
    skip_empty_rows: bool,
}

impl<'a> ValueExtractor<'a> {
    /// Build an extractor over `data` and its index. Assumes the first row
    /// is a header; see [`with_header`](Self::with_header).
    pub fn new(data: &'a [u8], index: &'a IndexStore, dialect: Dialect) -> Self {
        let mut extractor = Self {
            data,
            index,
            dialect,
            config: ExtractionConfig::default(),
            column_configs: Vec::new(),
            has_header: true,
            num_columns: 0,
            num_rows: 0,
            skip: 0,
            n_max: 0,
            skip_empty_rows: false,
        };
        extractor.num_columns = extractor.derive_columns();
        extractor.recalculate_rows();
        extractor
    }

    /// Column count: the index's, or derived from the first row terminator
    /// among the recorded separators.
    fn derive_columns(&self) -> usize {
        if self.index.columns() > 0 {
            return self.index.columns() as usize;
        }
        let mut k = 0usize;
        for t in 0..usize::from(self.index.n_threads()) {
            for &pos in self.index.thread_data(t) {
                let pos = pos as usize;
                if pos < self.data.len() && (self.data[pos] == b'\n' || self.data[pos] == b'\r') {
                    return k + 1;
                }
                k += 1;
            }
        }
        0
    }

    fn recalculate_rows(&mut self) {
        let total = self.index.total_separators() as usize;
        self.num_rows = if self.num_columns == 0 {
            0
        } else {
            let rows = total / self.num_columns;
            if self.has_header {
                rows.saturating_sub(1)
            } else {
                rows
            }
        };
    }

    /// Declare whether row 0 of the data is a header row.
    pub fn with_header(mut self, has_header: bool) -> Self {
        self.has_header = has_header;
        self.recalculate_rows();
        self
    }

    pub fn with_config(mut self, config: ExtractionConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach per-column overrides, resolving name-based entries against
    /// the header now.
    pub fn with_column_configs(mut self, configs: &ColumnConfigMap) -> Self {
        let header = if self.has_header { self.header() } else { Vec::new() };
        self.column_configs = configs.resolve(&header, self.num_columns);
        self
    }

    /// Configure the filtered row view: drop `skip` leading data rows, keep
    /// at most `n_max` after that (0 = unlimited), and optionally drop rows
    /// whose fields are all blank.
    pub fn with_row_filter(mut self, skip: usize, n_max: usize, skip_empty_rows: bool) -> Self {
        self.skip = skip;
        self.n_max = n_max;
        self.skip_empty_rows = skip_empty_rows;
        self
    }

    #[inline]
    pub fn num_columns(&self) -> usize {
        self.num_columns
    }

    /// Number of data rows (the header, when present, is excluded).
    #[inline]
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    #[inline]
    pub fn has_header(&self) -> bool {
        self.has_header
    }

    fn field_index(&self, row: usize, col: usize) -> usize {
        (row + usize::from(self.has_header)) * self.num_columns + col
    }

    /// Skip comment lines sitting between the previous record terminator
    /// and this span's start. Comment lines are absent from the index, so
    /// the gap can only be crossed by looking at the bytes.
    fn comment_adjusted(&self, field_idx: usize, col: usize, mut span: FieldSpan) -> FieldSpan {
        if col != 0 || !self.dialect.has_comments() {
            return span;
        }
        let at_row_start = if field_idx == 0 {
            true
        } else {
            match self.index.separator(field_idx as u64 - 1) {
                Some(prev) => {
                    let prev = prev as usize;
                    prev < self.data.len()
                        && (self.data[prev] == b'\n' || self.data[prev] == b'\r')
                }
                None => false,
            }
        };
        if at_row_start {
            span.start = skip_comment_lines(self.data, span.start, self.dialect.comment_char);
            if span.end < span.start {
                span.end = span.start;
            }
        }
        span
    }

    fn span_of(&self, field_idx: usize, col: usize) -> Option<FieldSpan> {
        let mut span = self.index.field_span(field_idx as u64)?;
        span.start = span.start.min(self.data.len());
        span.end = span.end.min(self.data.len());
        Some(self.comment_adjusted(field_idx, col, span))
    }

    /// Byte span of a data field, after comment adjustment.
    pub fn field_span(&self, row: usize, col: usize) -> Option<FieldSpan> {
        if row >= self.num_rows || col >= self.num_columns {
            return None;
        }
        self.span_of(self.field_index(row, col), col)
    }

    /// Raw bytes of a field: trailing `\r` stripped, symmetric outer quotes
    /// stripped. Out-of-bounds access yields an empty view.
    pub fn string_view(&self, row: usize, col: usize) -> &'a [u8] {
        match self.field_span(row, col) {
            Some(span) => self.view_of(span),
            None => &self.data[..0],
        }
    }

    fn view_of(&self, span: FieldSpan) -> &'a [u8] {
        let mut start = span.start;
        let mut end = span.end;
        if end > start && self.data[end - 1] == b'\r' {
            end -= 1;
        }
        if end > start + 1
            && self.data[start] == self.dialect.quote_char
            && self.data[end - 1] == self.dialect.quote_char
        {
            start += 1;
            end -= 1;
        }
        if end < start {
            end = start;
        }
        &self.data[start..end]
    }

    /// Owned string of a field with escape sequences unfolded: `""` inside
    /// a quoted field collapses to `"` (or the configured escape pair).
    pub fn string(&self, row: usize, col: usize) -> String {
        match self.field_span(row, col) {
            Some(span) => {
                let mut end = span.end;
                if end > span.start && self.data[end - 1] == b'\r' {
                    end -= 1;
                }
                unescape_field(&self.data[span.start..end], &self.dialect)
            }
            None => String::new(),
        }
    }

    /// Typed access. The column's override can supply an NA set or short
    /// circuit the access entirely (`TypeHint::Skip`).
    pub fn get<T: FieldParse>(&self, row: usize, col: usize) -> ExtractResult<T> {
        if row >= self.num_rows || col >= self.num_columns {
            return ExtractResult::ParseError(format!("({row}, {col}) is out of range"));
        }
        let override_config = self.column_configs.get(col).and_then(|c| c.as_ref());
        if override_config.is_some_and(|c| c.type_hint == TypeHint::Skip) {
            return ExtractResult::Na;
        }

        let view = self.string_view(row, col);
        let bytes = if self.config.trim_whitespace {
            trim_blanks(view)
        } else {
            view
        };

        // Escaped quotes only survive inside the view; unfold them before
        // parsing so string extraction agrees with `string()`.
        let unescaped;
        let text = if bytes.contains(&self.dialect.quote_char) {
            unescaped = unescape_inner(bytes, &self.dialect);
            unescaped.as_str()
        } else {
            match std::str::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    return ExtractResult::ParseError("field is not valid UTF-8".to_string())
                }
            }
        };

        if text.is_empty() {
            return ExtractResult::Na;
        }
        let is_na = match override_config.and_then(|c| c.na_values.as_ref()) {
            Some(set) => set.contains(text),
            None => self.config.is_na(text),
        };
        if is_na {
            return ExtractResult::Na;
        }
        T::parse_field(text, &self.config)
    }

    /// Typed access collapsing NA and parse errors to `default`.
    pub fn get_or<T: FieldParse>(&self, row: usize, col: usize, default: T) -> T {
        self.get(row, col).get_or(default)
    }

    /// Extract a whole column; NA and malformed fields become `None`.
    pub fn column<T: FieldParse>(&self, col: usize) -> Vec<Option<T>> {
        (0..self.num_rows).map(|row| self.get(row, col).ok()).collect()
    }

    /// Extract a whole column, substituting `default` for NA and malformed
    /// fields.
    pub fn column_or<T: FieldParse + Clone>(&self, col: usize, default: T) -> Vec<T> {
        (0..self.num_rows)
            .map(|row| self.get(row, col).get_or(default.clone()))
            .collect()
    }

    pub fn column_string_view(&self, col: usize) -> Vec<&'a [u8]> {
        (0..self.num_rows).map(|row| self.string_view(row, col)).collect()
    }

    pub fn column_string(&self, col: usize) -> Vec<String> {
        (0..self.num_rows).map(|row| self.string(row, col)).collect()
    }

    /// Decoded, unescaped header names. Empty when the extractor was built
    /// with `with_header(false)`.
    pub fn header(&self) -> Vec<String> {
        if !self.has_header {
            return Vec::new();
        }
        (0..self.num_columns)
            .map(|col| match self.span_of(col, col) {
                Some(span) => {
                    let mut end = span.end;
                    if end > span.start && self.data[end - 1] == b'\r' {
                        end -= 1;
                    }
                    unescape_field(&self.data[span.start..end], &self.dialect)
                }
                None => String::new(),
            })
            .collect()
    }

    /// Index of the named header column.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.header().iter().position(|h| h == name)
    }

    /// Map a byte offset to the physical `(row, col)` containing it. Row 0
    /// is the header row when one is present.
    pub fn byte_offset_to_location(&self, offset: usize) -> Option<(usize, usize)> {
        if self.num_columns == 0 {
            return None;
        }
        let mut k = 0usize;
        for t in 0..usize::from(self.index.n_threads()) {
            for &pos in self.index.thread_data(t) {
                if offset as u64 <= pos {
                    return Some((k / self.num_columns, k % self.num_columns));
                }
                k += 1;
            }
        }
        None
    }

    /// Whether every field of a data row is blank.
    pub fn row_is_empty(&self, row: usize) -> bool {
        (0..self.num_columns).all(|col| trim_blanks(self.string_view(row, col)).is_empty())
    }

    /// Iterate data rows with `skip` / `n_max` / `skip_empty_rows` applied
    /// lazily.
    pub fn rows(&self) -> FilteredRows<'_, 'a> {
        FilteredRows {
            extractor: self,
            next_row: 0,
            skipped: 0,
            yielded: 0,
        }
    }

    /// Number of rows the filtered view yields. O(n) in the unfiltered row
    /// count when `skip_empty_rows` is set.
    pub fn filtered_row_count(&self) -> usize {
        if !self.skip_empty_rows {
            let after_skip = self.num_rows.saturating_sub(self.skip);
            return if self.n_max > 0 {
                after_skip.min(self.n_max)
            } else {
                after_skip
            };
        }
        self.rows().count()
    }
}

/// View of one data row, as yielded by [`ValueExtractor::rows`].
#[derive(Clone, Copy)]
pub struct RowView<'e, 'a> {
    extractor: &'e ValueExtractor<'a>,
    row: usize,
}

impl<'e, 'a> RowView<'e, 'a> {
    /// Physical data-row index behind this view.
    pub fn row_index(&self) -> usize {
        self.row
    }

    pub fn get<T: FieldParse>(&self, col: usize) -> ExtractResult<T> {
        self.extractor.get(self.row, col)
    }

    pub fn string_view(&self, col: usize) -> &'a [u8] {
        self.extractor.string_view(self.row, col)
    }

    pub fn string(&self, col: usize) -> String {
        self.extractor.string(self.row, col)
    }
}

/// Lazy filtered row iterator.
pub struct FilteredRows<'e, 'a> {
    extractor: &'e ValueExtractor<'a>,
    next_row: usize,
    skipped: usize,
    yielded: usize,
}

impl<'e, 'a> Iterator for FilteredRows<'e, 'a> {
    type Item = RowView<'e, 'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let ex = self.extractor;
        loop {
            if self.next_row >= ex.num_rows {
                return None;
            }
            if ex.n_max > 0 && self.yielded >= ex.n_max {
                return None;
            }
            let row = self.next_row;
            self.next_row += 1;
            // Empty rows are invisible: they count toward neither skip nor
            // n_max.
            if ex.skip_empty_rows && ex.row_is_empty(row) {
                continue;
            }
            if self.skipped < ex.skip {
                self.skipped += 1;
                continue;
            }
            self.yielded += 1;
            return Some(RowView {
                extractor: ex,
                row,
            });
        }
    }
}

/// Extractor bundle with shared ownership of the buffer and the index.
///
/// Clones hand the same underlying data to multiple readers; the buffer and
/// (if mmap-backed) the mapping are released when the last clone drops.
#[derive(Clone)]
pub struct SharedExtractor {
    buffer: Arc<PaddedBuffer>,
    index: SharedIndex,
    dialect: Dialect,
    config: ExtractionConfig,
    has_header: bool,
}

impl SharedExtractor {
    pub fn new(buffer: Arc<PaddedBuffer>, index: SharedIndex, dialect: Dialect) -> Self {
        Self {
            buffer,
            index,
            dialect,
            config: ExtractionConfig::default(),
            has_header: true,
        }
    }

    pub fn with_header(mut self, has_header: bool) -> Self {
        self.has_header = has_header;
        self
    }

    pub fn with_config(mut self, config: ExtractionConfig) -> Self {
        self.config = config;
        self
    }

    /// Lend a short-lived extractor view over the shared data.
    pub fn extractor(&self) -> ValueExtractor<'_> {
        ValueExtractor::new(self.buffer.data(), &self.index, self.dialect)
            .with_header(self.has_header)
            .with_config(self.config.clone())
    }
}

/// Skip whole comment lines starting at `pos`; returns the offset of the
/// first non-comment line.
fn skip_comment_lines(data: &[u8], mut pos: usize, comment_char: u8) -> usize {
    while pos < data.len() {
        let line_start = pos;
        let mut i = pos;
        while i < data.len() && (data[i] == b' ' || data[i] == b'\t') {
            i += 1;
        }
        if i < data.len() && data[i] == comment_char {
            pos = crate::second_pass::skip_to_line_end(data, i, data.len());
        } else {
            return line_start;
        }
    }
    pos
}

/// Unfold a raw field: when symmetric outer quotes are present, strip them
/// and collapse each escape pair to a single quote.
fn unescape_field(field: &[u8], dialect: &Dialect) -> String {
    if field.len() < 2
        || field[0] != dialect.quote_char
        || field[field.len() - 1] != dialect.quote_char
    {
        return String::from_utf8_lossy(field).into_owned();
    }
    unescape_inner(&field[1..field.len() - 1], dialect)
}

fn unescape_inner(inner: &[u8], dialect: &Dialect) -> String {
    let mut out = Vec::with_capacity(inner.len());
    let mut i = 0;
    while i < inner.len() {
        let b = inner[i];
        if b == dialect.escape_char && i + 1 < inner.len() && inner[i + 1] == dialect.quote_char {
            out.push(dialect.quote_char);
            i += 2;
        } else {
            out.push(b);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
