use tracing::debug;

use crate::WeftError;
use crate::WeftResult;
use crate::expr::evaluate_condition;
use crate::operations::Operation;
use crate::operations::RunContext;
use crate::trie::TokenTrie;

/// Where a conditional block currently stands.
///
/// `Outside` is the implicit state with no open block; `Closed` is the
/// terminal state reached at the matching end directive. An `if` still
/// open at end of stream is a hard processing error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
	Outside,
	InTrueBranch,
	InFalseBranch,
	AwaitingElse,
	Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirectiveKind {
	If,
	ElseIf,
	Else,
	EndIf,
}

/// The directive spellings a conditional operation recognizes. Each
/// directive may have several spellings (`#elseif` and `#elif` both map to
/// the same continuation).
#[derive(Debug, Clone)]
pub struct ConditionalTokens {
	pub if_tokens: Vec<Vec<u8>>,
	pub elseif_tokens: Vec<Vec<u8>>,
	pub else_tokens: Vec<Vec<u8>>,
	pub endif_tokens: Vec<Vec<u8>>,
}

impl ConditionalTokens {
	/// The `#if` / `#elseif` / `#else` / `#endif` spellings.
	pub fn hash_style() -> Self {
		Self {
			if_tokens: vec![b"#if".to_vec()],
			elseif_tokens: vec![b"#elseif".to_vec(), b"#elif".to_vec()],
			else_tokens: vec![b"#else".to_vec()],
			endif_tokens: vec![b"#endif".to_vec()],
		}
	}

	/// Line-comment guarded spellings (`//#if` ...), for host languages
	/// where an untaken directive should read as a comment.
	pub fn comment_style() -> Self {
		Self {
			if_tokens: vec![b"//#if".to_vec()],
			elseif_tokens: vec![b"//#elseif".to_vec(), b"//#elif".to_vec()],
			else_tokens: vec![b"//#else".to_vec()],
			endif_tokens: vec![b"//#endif".to_vec()],
		}
	}
}

struct Frame {
	state: BranchState,
	taken: bool,
}

/// The conditional-compilation operation.
///
/// On `if`, the guard expression is evaluated against the run's variable
/// environment: a true branch streams through the normal copy loop, a
/// false branch is discarded here (tracking nested conditionals so the
/// blocks balance). Directives themselves never reach the output; the
/// whitespace before a directive and the line ending after it are
/// consumed so a taken directive vanishes without leaving a blank line.
pub struct ConditionalOperation {
	tokens: Vec<Vec<u8>>,
	kinds: Vec<DirectiveKind>,
	directive_trie: TokenTrie,
	stack: Vec<Frame>,
}

impl ConditionalOperation {
	pub fn new(tokens: ConditionalTokens) -> Self {
		let mut all = Vec::new();
		let mut kinds = Vec::new();

		let groups = [
			(tokens.if_tokens, DirectiveKind::If),
			(tokens.elseif_tokens, DirectiveKind::ElseIf),
			(tokens.else_tokens, DirectiveKind::Else),
			(tokens.endif_tokens, DirectiveKind::EndIf),
		];
		for (spellings, kind) in groups {
			for spelling in spellings {
				all.push(spelling);
				kinds.push(kind);
			}
		}

		let directive_trie = TokenTrie::from_tokens(&all);

		Self {
			tokens: all,
			kinds,
			directive_trie,
			stack: Vec::new(),
		}
	}

	/// The state of the innermost open block, `Outside` when none is open.
	pub fn current_state(&self) -> BranchState {
		self.stack
			.last()
			.map_or(BranchState::Outside, |frame| frame.state)
	}

	/// Nesting depth of open conditional blocks.
	pub fn depth(&self) -> usize {
		self.stack.len()
	}

	/// Discard input until this block resolves: with `evaluate_guards`,
	/// a continuation branch whose guard holds becomes live; otherwise
	/// everything up to the matching end directive is dropped. Nested
	/// conditionals inside the discarded span are tracked by depth so
	/// their directives cannot close the wrong block.
	fn skip_branches(
		&mut self,
		ctx: &mut RunContext<'_, '_>,
		evaluate_guards: bool,
	) -> WeftResult<()> {
		let mut nested = 0usize;

		loop {
			if ctx.cancelled() {
				return Err(WeftError::Cancelled);
			}

			let Some(found) = ctx.scan.seek_forward_until_match(&self.directive_trie)? else {
				return Err(WeftError::UnclosedConditional);
			};

			match self.kinds[found.token] {
				DirectiveKind::If => nested += 1,
				DirectiveKind::EndIf if nested > 0 => nested -= 1,
				DirectiveKind::EndIf => {
					// The matching end directive: the block reaches its
					// terminal state and the frame retires.
					self.stack.pop();
					consume_directive_tail(ctx)?;
					return Ok(());
				}
				DirectiveKind::ElseIf if nested == 0 => {
					let guard = read_guard(ctx)?;
					let Some(frame) = self.stack.last_mut() else {
						return Err(WeftError::UnexpectedDirective);
					};
					if evaluate_guards
						&& !frame.taken
						&& evaluate_condition(&guard, ctx.dialect, ctx.variables)
					{
						frame.state = BranchState::InTrueBranch;
						frame.taken = true;
						consume_directive_tail(ctx)?;
						return Ok(());
					}
					frame.state = BranchState::AwaitingElse;
				}
				DirectiveKind::Else if nested == 0 => {
					let Some(frame) = self.stack.last_mut() else {
						return Err(WeftError::UnexpectedDirective);
					};
					if evaluate_guards && !frame.taken {
						frame.state = BranchState::InTrueBranch;
						frame.taken = true;
						consume_directive_tail(ctx)?;
						return Ok(());
					}
				}
				DirectiveKind::ElseIf | DirectiveKind::Else => {}
			}
		}
	}
}

impl Operation for ConditionalOperation {
	fn tokens(&self) -> &[Vec<u8>] {
		&self.tokens
	}

	fn handle_match(
		&mut self,
		ctx: &mut RunContext<'_, '_>,
		token: usize,
	) -> WeftResult<usize> {
		// Directives never appear in output; drop the whitespace between
		// the preceding content and the directive as well.
		ctx.sink.seek_back_while(ctx.whitespace);

		match self.kinds[token] {
			DirectiveKind::If => {
				let guard = read_guard(ctx)?;
				if evaluate_condition(&guard, ctx.dialect, ctx.variables) {
					debug!(depth = self.stack.len(), "conditional guard held");
					consume_directive_tail(ctx)?;
					self.stack.push(Frame {
						state: BranchState::InTrueBranch,
						taken: true,
					});
				} else {
					debug!(depth = self.stack.len(), "conditional guard failed");
					self.stack.push(Frame {
						state: BranchState::InFalseBranch,
						taken: false,
					});
					self.skip_branches(ctx, true)?;
				}
			}
			DirectiveKind::ElseIf => {
				if self.stack.is_empty() {
					return Err(WeftError::UnexpectedDirective);
				}
				// Reached from inside a streamed branch: that branch is
				// done, and no later branch can still be taken.
				read_guard(ctx)?;
				self.skip_branches(ctx, false)?;
			}
			DirectiveKind::Else => {
				if self.stack.is_empty() {
					return Err(WeftError::UnexpectedDirective);
				}
				self.skip_branches(ctx, false)?;
			}
			DirectiveKind::EndIf => {
				if self.stack.pop().is_none() {
					return Err(WeftError::UnexpectedDirective);
				}
				consume_directive_tail(ctx)?;
			}
		}

		Ok(0)
	}

	fn finish(&mut self) -> WeftResult<()> {
		let open = !self.stack.is_empty();
		self.stack.clear();
		if open {
			return Err(WeftError::UnclosedConditional);
		}
		Ok(())
	}
}

/// Pull the guard expression for a directive. A parenthesized guard is
/// read as one balanced group (quote-aware, so a `)` inside a literal does
/// not close it); otherwise the guard runs to the end of the directive
/// line, consuming the line ending.
fn read_guard(ctx: &mut RunContext<'_, '_>) -> WeftResult<Vec<u8>> {
	ctx.scan.seek_forward_through(ctx.whitespace)?;

	if ctx.scan.peek()? != Some(b'(') {
		return ctx.scan.read_directive_line(ctx.line_ends);
	}

	let mut payload = Vec::new();
	let mut depth = 0usize;
	let mut quote: Option<u8> = None;

	while let Some(byte) = ctx.scan.next_byte()? {
		payload.push(byte);
		match quote {
			Some(open) => {
				if byte == b'\\' {
					if let Some(escaped) = ctx.scan.next_byte()? {
						payload.push(escaped);
					}
				} else if byte == open {
					quote = None;
				}
			}
			None => {
				match byte {
					b'"' | b'\'' => quote = Some(byte),
					b'(' => depth += 1,
					b')' => {
						depth -= 1;
						if depth == 0 {
							return Ok(payload);
						}
					}
					_ => {}
				}
			}
		}
	}

	// End of stream inside the group; the evaluator will fault on the
	// unbalanced payload and the open block errors at finish.
	Ok(payload)
}

/// Consume the whitespace run and the at-most-one line ending that follow
/// a directive, so the directive's line disappears from the output.
fn consume_directive_tail(ctx: &mut RunContext<'_, '_>) -> WeftResult<()> {
	ctx.scan.seek_forward_through(ctx.whitespace)?;
	ctx.scan.try_consume(ctx.line_ends)?;
	Ok(())
}
