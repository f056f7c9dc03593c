use tracing::trace;

use crate::trie::TokenTrie;
use crate::trie::TrieCursor;
use crate::trie::TrieMatch;

/// A position in the logical stream at which a full token match completed,
/// translated back into the caller's current buffer.
///
/// Produced fresh per match and consumed immediately by whichever
/// operation owns the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalLocation {
	pub token: usize,
	/// Offset of the first matched byte in the caller's buffer.
	pub start: usize,
	pub length: usize,
}

/// Streaming token matcher driven by a global sequence number.
///
/// Unlike rescanning the buffer after every refill, this matcher feeds the
/// trie one byte at a time and carries any in-progress walk across buffer
/// boundaries. The caller owns the buffer and must retain bytes from
/// [`oldest_required`](StreamMatcher::oldest_required) onward when it
/// refills, reporting how many bytes it dropped from the front through
/// `last_net_shift`.
pub struct StreamMatcher<'t> {
	trie: &'t TokenTrie,
	walk: Option<Walk<'t>>,
	/// Global sequence number of `buffer[0]` as of the last `evaluate`.
	buffer_base: u64,
}

struct Walk<'t> {
	cursor: TrieCursor<'t>,
	/// Global sequence number of the first byte of this walk.
	start: u64,
}

impl<'t> StreamMatcher<'t> {
	pub fn new(trie: &'t TokenTrie) -> Self {
		Self {
			trie,
			walk: None,
			buffer_base: 0,
		}
	}

	/// Earliest global sequence number a still-in-progress match needs.
	/// The caller must not discard buffered bytes at or past this position
	/// before the next `evaluate` call. `None` means nothing is pending.
	pub fn oldest_required(&self) -> Option<u64> {
		self.walk.as_ref().map(|walk| walk.start)
	}

	/// Advance byte-by-byte from `position` until a terminal match
	/// completes, the buffer runs dry, or `is_final` forces any match in
	/// progress to resolve.
	///
	/// Returns the next terminal, or `None` when the buffer is exhausted.
	/// With `is_final` false the caller refills (preserving bytes from
	/// `oldest_required`) and re-invokes with the net front shift; with
	/// `is_final` true a partial walk resolves to its longest already
	/// completed token, or to plain literal text when none completed.
	pub fn evaluate(
		&mut self,
		buffer: &[u8],
		is_final: bool,
		last_net_shift: usize,
		position: &mut usize,
	) -> Option<TerminalLocation> {
		self.buffer_base += last_net_shift as u64;

		loop {
			let Some(byte) = buffer.get(*position).copied() else {
				return if is_final {
					self.resolve_pending(position)
				} else {
					None
				};
			};

			let walk = self.walk.get_or_insert_with(|| {
				Walk {
					cursor: self.trie.cursor(),
					start: self.buffer_base + *position as u64,
				}
			});

			if walk.cursor.step(byte) {
				*position += 1;
				if walk.cursor.best().is_some() && !walk.cursor.can_continue() {
					return self.resolve_pending(position);
				}
			} else if walk.cursor.best().is_some() {
				return self.resolve_pending(position);
			} else {
				// Dead walk with no terminal passed: the byte that opened
				// the walk is literal text. Restart one past it.
				let restart = (walk.start - self.buffer_base) as usize + 1;
				trace!(restart, "token walk died without a terminal");
				*position = restart;
				self.walk = None;
			}
		}
	}

	/// Resolve the in-progress walk to its longest completed token, if it
	/// passed one, repositioning the caller right after the match.
	fn resolve_pending(&mut self, position: &mut usize) -> Option<TerminalLocation> {
		let walk = self.walk.take()?;
		let Some(TrieMatch { token, length }) = walk.cursor.best() else {
			// Nothing completed; the walked bytes stay literal.
			return None;
		};

		let start = (walk.start - self.buffer_base) as usize;
		*position = start + length;

		Some(TerminalLocation {
			token,
			start,
			length,
		})
	}
}
