//! cladecall: taxonomic sequence classification.
//!
//! Reads are decomposed into canonical minimizers, each minimizer is probed
//! against a precomputed compact hash index, and the resulting per-taxon
//! evidence is resolved against the taxonomy tree to call the most specific
//! taxon with sufficient support. The `classify` module drives batches of
//! reads through a worker pool while preserving input order on every
//! output stream.

pub mod aa_translate;
pub mod classify;
pub mod compact_hash;
pub mod errors;
pub mod hyperloglogplus;
pub mod minimizer_index;
pub mod mmscanner;
pub mod readcounts;
pub mod reports;
pub mod seqreader;
pub mod taxonomy;
pub mod types;

pub use errors::{ClassifyError, Result};
pub use types::TaxId;
