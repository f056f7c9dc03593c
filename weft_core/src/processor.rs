use std::io::Read;
use std::io::Write;
use std::sync::atomic::Ordering;

use tracing::debug;

use crate::WeftError;
use crate::WeftResult;
use crate::config::DEFAULT_BUFFER_SIZE;
use crate::config::DEFAULT_FLUSH_THRESHOLD;
use crate::config::EngineConfig;
use crate::expr::ExprDialect;
use crate::operations::Operation;
use crate::operations::OperationPipeline;
use crate::operations::RunContext;
use crate::scan::OutputSink;
use crate::scan::ScanState;
use crate::trie::TokenTrie;

/// Totals reported when a run completes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
	pub bytes_read: u64,
	pub bytes_written: u64,
	pub matches_dispatched: u64,
}

/// The stream driver: fill the buffer, match the next token through the
/// merged trie, dispatch it to the owning operation, copy everything else
/// through, refill, repeat until end of stream.
///
/// A processor is single-threaded per run. The trie and operation list are
/// assembled once in [`Processor::new`]; the variable environment and flag
/// table mutate across the run and can be inspected afterwards through
/// [`Processor::config`].
pub struct Processor {
	pipeline: OperationPipeline,
	config: EngineConfig,
	whitespace: TokenTrie,
	line_ends: TokenTrie,
	dialect: ExprDialect,
}

impl Processor {
	pub fn new(config: EngineConfig, operations: Vec<Box<dyn Operation>>) -> Self {
		let whitespace = TokenTrie::from_tokens(&config.whitespace_tokens);
		let line_ends = TokenTrie::from_tokens(&config.line_end_tokens);
		let dialect = ExprDialect::new(config.dialect);

		Self {
			pipeline: OperationPipeline::new(operations),
			config,
			whitespace,
			line_ends,
			dialect,
		}
	}

	/// The run configuration, including the variable environment and flag
	/// table as mutated by the most recent run.
	pub fn config(&self) -> &EngineConfig {
		&self.config
	}

	/// Process `reader` into `writer` with the default buffer size and
	/// flush threshold.
	pub fn run(
		&mut self,
		reader: &mut dyn Read,
		writer: &mut dyn Write,
	) -> WeftResult<RunSummary> {
		self.run_with_buffer(reader, writer, DEFAULT_BUFFER_SIZE, DEFAULT_FLUSH_THRESHOLD)
	}

	/// Process with a custom buffer size and the default flush threshold.
	pub fn run_with_buffer_size(
		&mut self,
		reader: &mut dyn Read,
		writer: &mut dyn Write,
		buffer_size: usize,
	) -> WeftResult<RunSummary> {
		self.run_with_buffer(reader, writer, buffer_size, DEFAULT_FLUSH_THRESHOLD)
	}

	/// Process with a custom buffer size and flush threshold.
	///
	/// The buffer must hold the longest registered token; that is checked
	/// here, before any input is consumed, and rejected as a configuration
	/// error. The flush threshold is raised to the same bound so backward
	/// seeks always have at least one full token of lookback.
	pub fn run_with_buffer(
		&mut self,
		reader: &mut dyn Read,
		writer: &mut dyn Write,
		buffer_size: usize,
		flush_threshold: usize,
	) -> WeftResult<RunSummary> {
		let longest_token = self.pipeline.trie().max_token_length();
		if buffer_size < longest_token.max(1) {
			return Err(WeftError::BufferTooSmall {
				buffer_size,
				longest_token,
			});
		}
		let flush_threshold = flush_threshold.max(longest_token);

		let mut scan = ScanState::new(reader, buffer_size)?;
		let mut sink = OutputSink::new(writer, flush_threshold);
		let mut summary = RunSummary::default();

		loop {
			if self.cancelled() {
				sink.finish()?;
				return Err(WeftError::Cancelled);
			}

			let mut literal_start = scan.position();

			// Scan the buffered bytes for the next token match.
			while scan.position() < scan.len() {
				let outcome = self
					.pipeline
					.trie()
					.match_at(scan.buffered(), scan.position());

				if outcome.needs_more_input && !scan.at_eof() {
					// A token may straddle the buffer edge; refill before
					// deciding there is no token here.
					break;
				}

				let Some(found) = outcome.terminal else {
					scan.advance(1);
					continue;
				};

				sink.write_bytes(scan.slice(literal_start, scan.position()))?;
				scan.advance(found.length);

				let mut ctx = RunContext {
					scan: &mut scan,
					sink: &mut sink,
					variables: &mut self.config.variables,
					flags: &mut self.config.flags,
					whitespace: &self.whitespace,
					line_ends: &self.line_ends,
					dialect: &self.dialect,
					cancel: self.config.cancel.as_deref(),
				};
				summary.matches_dispatched += 1;
				self.pipeline.dispatch(&mut ctx, found)?;

				if self.cancelled() {
					sink.finish()?;
					return Err(WeftError::Cancelled);
				}

				literal_start = scan.position();
			}

			if scan.position() > literal_start {
				sink.write_bytes(scan.slice(literal_start, scan.position()))?;
			}

			if scan.at_end() {
				break;
			}
			scan.advance_buffer(scan.position())?;
		}

		self.pipeline.finish()?;

		summary.bytes_read = scan.sequence();
		summary.bytes_written = sink.finish()?;
		debug!(
			bytes_read = summary.bytes_read,
			bytes_written = summary.bytes_written,
			matches = summary.matches_dispatched,
			"run complete"
		);
		Ok(summary)
	}

	fn cancelled(&self) -> bool {
		self.config
			.cancel
			.as_ref()
			.is_some_and(|cancel| cancel.load(Ordering::Relaxed))
	}
}
