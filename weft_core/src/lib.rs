//! `weft_core` is the streaming engine under the weft scaffolding tool.
//! It transforms a source byte stream into an output byte stream by
//! recognizing a caller-registered set of multi-byte tokens (conditional
//! directives, variable references, flag toggles) and dispatching each
//! match to the operation that owns it.
//!
//! ## Processing Pipeline
//!
//! ```text
//! Source stream
//!   → ScanState (buffered bytes, cursor, global sequence number)
//!   → TokenTrie (longest-match multi-pattern lookup, refill signalling)
//!   → OperationPipeline (conditional blocks, variable substitution, flags)
//!   → OutputSink (pending tail for backward seeks, flush threshold)
//! ```
//!
//! ## Modules
//!
//! - [`config`] — Run configuration: whitespace and line-ending token
//!   sets, dialect selection, flags, variables, and the optional
//!   `weft.toml` run profile.
//! - [`expr`] — The conditional-guard expression language: one operator
//!   table, three lexical dialects, fault-as-value evaluation.
//!
//! ## Key Types
//!
//! - [`TokenTrie`] — Prefix trie over byte sequences with longest-match
//!   walks and a needs-more-input signal for tokens that straddle refills.
//! - [`ScanState`] / [`OutputSink`] — The mutable cursor, buffer, and
//!   sequence bookkeeping for one run, plus the seekable output tail.
//! - [`StreamMatcher`] — The sequence-number matcher that carries partial
//!   matches across buffer boundaries without rescanning.
//! - [`Operation`] / [`OperationPipeline`] — Pluggable token handlers and
//!   the merged dispatch trie.
//! - [`Processor`] — The run driver with its buffer and flush policy.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::io::Cursor;
//!
//! use weft_core::ConditionalOperation;
//! use weft_core::ConditionalTokens;
//! use weft_core::EngineConfig;
//! use weft_core::Processor;
//! use weft_core::VariableCollection;
//! use weft_core::VariableValue;
//!
//! let mut config = EngineConfig::default();
//! config
//! 	.variables
//! 	.set("release", VariableValue::text("true"));
//!
//! let mut processor = Processor::new(
//! 	config,
//! 	vec![Box::new(ConditionalOperation::new(
//! 		ConditionalTokens::hash_style(),
//! 	))],
//! );
//!
//! let mut input = Cursor::new("#if (release) ship it #endif");
//! let mut output = Vec::new();
//! processor.run(&mut input, &mut output).unwrap();
//! assert_eq!(output, b"ship it");
//! ```

pub use conditional::*;
pub use config::*;
pub use error::*;
pub use expr::*;
pub use matcher::*;
pub use operations::*;
pub use processor::*;
pub use scan::*;
pub use trie::*;
pub use variables::*;

mod conditional;
pub mod config;
mod error;
pub mod expr;
mod matcher;
mod operations;
mod processor;
mod scan;
mod trie;
mod variables;

#[cfg(test)]
mod __fixtures;
#[cfg(test)]
mod __tests;
