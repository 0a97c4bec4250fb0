//! # csvidx
//!
//! High-throughput CSV indexing and value extraction for Rust.
//!
//! The crate indexes a delimited byte buffer in two passes: a SIMD first
//! pass that counts separators and finds safe chunk boundaries under
//! RFC 4180 quote parity, and a speculative multi-threaded second pass that
//! records the position of every field separator. Typed `(row, col)`
//! lookups are then answered on demand without copying cell data. Indexes
//! can be persisted beside the source file and reloaded with a zero-copy
//! memory map.
//!
//! ## Module Organization
//!
//! - [`buffer`] - Aligned, padded byte sources for block scanning
//! - [`dialect`] - Delimiter/quote/escape/comment configuration
//! - [`error`] - Error taxonomy, severities, and the collector
//! - [`first_pass`] - Separator counting and boundary scouting
//! - [`second_pass`] - Field indexing (SIMD, scalar oracle, error-reporting)
//! - [`index`] - The index store: slabs, compaction, shared ownership
//! - [`orchestrator`] - Thread fan-out, speculation, fallback, progress
//! - [`cache`] - Persistent `.vidx` index cache with mmap loading
//! - [`extract`] - Typed value extraction over buffer + index
//!
//! ## Quick Start
//!
//! ```
//! use csvidx::{Dialect, PaddedBuffer, ParseOptions, Parser, ValueExtractor};
//!
//! let buf = PaddedBuffer::from_slice(b"name,score\nalice,10\nbob,12\n");
//! let outcome = Parser::new(4).parse(&buf, &ParseOptions::default());
//! assert!(outcome.success());
//!
//! let ex = ValueExtractor::new(buf.data(), &outcome.index, Dialect::csv());
//! assert_eq!(ex.get::<i64>(1, 1).ok(), Some(12));
//! assert_eq!(ex.string(0, 0), "alice");
//! ```
//!
//! ## Features
//!
//! - `serde` - Enable serialization/deserialization for dialect and
//!   extraction-config types

pub mod buffer;
pub mod cache;
mod checks;
pub mod dialect;
pub mod error;
pub mod extract;
pub mod first_pass;
pub mod index;
pub mod orchestrator;
pub mod second_pass;
pub(crate) mod simd;
pub(crate) mod state_machine;

// Core types
pub use buffer::PaddedBuffer;
pub use dialect::{Dialect, LineEnding};
pub use error::{ErrorCode, ErrorCollector, ErrorMode, ParseError, Severity};
pub use index::{FieldSpan, IndexStore, SharedIndex};
pub use orchestrator::{ParseOptions, ParseOutcome, Parser, SizeLimits};

// Cache types
pub use cache::{CacheError, CacheLocation, CacheOptions, SourceMetadata};

// Extraction types
pub use extract::{
    ColumnConfig, ColumnConfigMap, ExtractResult, ExtractionConfig, SharedExtractor, TypeHint,
    ValueExtractor,
};

pub use checks::detect_line_ending;
