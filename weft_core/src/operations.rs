use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tracing::debug;

use crate::WeftResult;
use crate::expr::ExprDialect;
use crate::scan::OutputSink;
use crate::scan::ScanState;
use crate::trie::TokenTrie;
use crate::trie::TrieMatch;
use crate::variables::FlagTable;
use crate::variables::VariableCollection;

/// Everything an operation may touch while handling a match: the scan
/// state (cursor already advanced past the matched token), the output
/// sink, the run's mutable variable environment and flag table, and the
/// shared whitespace/line-ending tries.
///
/// Passing one exclusive context keeps ownership of buffer, cursor, and
/// sequence bookkeeping in a single place instead of threading them
/// through every call.
pub struct RunContext<'ctx, 'run> {
	pub scan: &'ctx mut ScanState<'run>,
	pub sink: &'ctx mut OutputSink<'run>,
	pub variables: &'ctx mut VariableCollection,
	pub flags: &'ctx mut FlagTable,
	pub whitespace: &'ctx TokenTrie,
	pub line_ends: &'ctx TokenTrie,
	pub dialect: &'ctx ExprDialect,
	pub cancel: Option<&'ctx AtomicBool>,
}

impl RunContext<'_, '_> {
	pub fn cancelled(&self) -> bool {
		self.cancel
			.is_some_and(|cancel| cancel.load(Ordering::Relaxed))
	}
}

/// A pluggable handler bound to one or more tokens.
///
/// An operation declares the byte sequences it cares about; the pipeline
/// merges every operation's tokens into one trie and dispatches each match
/// back to its owner with the local token index. The handler may write
/// output and may consume input beyond the token itself (the conditional
/// operation consumes whole discarded branches this way). It returns the
/// number of bytes it wrote.
pub trait Operation {
	fn tokens(&self) -> &[Vec<u8>];

	fn handle_match(
		&mut self,
		ctx: &mut RunContext<'_, '_>,
		token: usize,
	) -> WeftResult<usize>;

	/// Called once when the stream ends, for operations that track open
	/// state across matches.
	fn finish(&mut self) -> WeftResult<()> {
		Ok(())
	}
}

/// The ordered operation list and the merged token trie built from it.
///
/// Assembled once per run configuration; when two operations register the
/// same byte sequence, the first registration wins.
pub struct OperationPipeline {
	operations: Vec<Box<dyn Operation>>,
	trie: TokenTrie,
	owners: Vec<(usize, usize)>,
}

impl OperationPipeline {
	pub fn new(operations: Vec<Box<dyn Operation>>) -> Self {
		let mut trie = TokenTrie::new();
		let mut owners = Vec::new();

		for (op_index, operation) in operations.iter().enumerate() {
			for (local, bytes) in operation.tokens().iter().enumerate() {
				let id = trie.add(bytes);
				if id == owners.len() {
					owners.push((op_index, local));
				}
			}
		}

		Self {
			operations,
			trie,
			owners,
		}
	}

	/// The merged trie over every operation's tokens.
	pub fn trie(&self) -> &TokenTrie {
		&self.trie
	}

	/// Dispatch a completed match to the operation that owns the token.
	pub fn dispatch(
		&mut self,
		ctx: &mut RunContext<'_, '_>,
		found: TrieMatch,
	) -> WeftResult<usize> {
		let (op_index, local) = self.owners[found.token];
		self.operations[op_index].handle_match(ctx, local)
	}

	/// Finalize every operation at end of stream.
	pub fn finish(&mut self) -> WeftResult<()> {
		for operation in &mut self.operations {
			operation.finish()?;
		}
		Ok(())
	}

	pub fn len(&self) -> usize {
		self.operations.len()
	}

	pub fn is_empty(&self) -> bool {
		self.operations.is_empty()
	}
}

/// Toggles a named flag when its on or off token is matched.
///
/// Whether the matched token text also appears in the output is decided by
/// the well-known `flags` entry of the flag table: directives-only when
/// unset, directives-that-also-print when set.
pub struct FlagOperation {
	name: String,
	tokens: Vec<Vec<u8>>,
}

impl FlagOperation {
	pub fn new(
		name: impl Into<String>,
		on_token: impl Into<Vec<u8>>,
		off_token: impl Into<Vec<u8>>,
	) -> Self {
		Self {
			name: name.into(),
			tokens: vec![on_token.into(), off_token.into()],
		}
	}
}

impl Operation for FlagOperation {
	fn tokens(&self) -> &[Vec<u8>] {
		&self.tokens
	}

	fn handle_match(
		&mut self,
		ctx: &mut RunContext<'_, '_>,
		token: usize,
	) -> WeftResult<usize> {
		let enabled = token == 0;
		ctx.flags.insert(self.name.clone(), enabled);
		debug!(flag = %self.name, enabled, "flag toggled");

		if ctx.flags.is_set(FlagTable::ECHO_FLAGS) {
			ctx.sink.write_bytes(&self.tokens[token])
		} else {
			Ok(0)
		}
	}
}

/// Replaces a matched variable token with the variable's rendered value,
/// or the literal `null` marker when the variable is absent.
pub struct VariableOperation {
	tokens: Vec<Vec<u8>>,
	keys: Vec<String>,
}

impl VariableOperation {
	/// One entry per substitutable variable: the token bytes recognized in
	/// the stream and the environment key they expand to.
	pub fn new(entries: impl IntoIterator<Item = (Vec<u8>, String)>) -> Self {
		let (tokens, keys) = entries.into_iter().unzip();
		Self { tokens, keys }
	}
}

impl Operation for VariableOperation {
	fn tokens(&self) -> &[Vec<u8>] {
		&self.tokens
	}

	fn handle_match(
		&mut self,
		ctx: &mut RunContext<'_, '_>,
		token: usize,
	) -> WeftResult<usize> {
		let key = &self.keys[token];
		let Some(text) = ctx.variables.render(key) else {
			debug!(%key, "variable not bound; substituting null");
			return ctx.sink.write_bytes(b"null");
		};
		ctx.sink.write_bytes(text.as_bytes())
	}
}

/// Consumes whitespace around its tokens: trailing whitespace already
/// written, leading whitespace still unread, or both.
pub struct TrimWhitespaceOperation {
	tokens: Vec<Vec<u8>>,
	trim_written: bool,
	trim_ahead: bool,
}

impl TrimWhitespaceOperation {
	pub fn new(
		tokens: impl IntoIterator<Item = Vec<u8>>,
		trim_written: bool,
		trim_ahead: bool,
	) -> Self {
		Self {
			tokens: tokens.into_iter().collect(),
			trim_written,
			trim_ahead,
		}
	}
}

impl Operation for TrimWhitespaceOperation {
	fn tokens(&self) -> &[Vec<u8>] {
		&self.tokens
	}

	fn handle_match(
		&mut self,
		ctx: &mut RunContext<'_, '_>,
		_token: usize,
	) -> WeftResult<usize> {
		if self.trim_written {
			ctx.sink.seek_back_while(ctx.whitespace);
		}
		if self.trim_ahead {
			ctx.scan.seek_forward_through(ctx.whitespace)?;
		}
		Ok(0)
	}
}
