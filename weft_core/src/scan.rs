use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;

use crate::WeftResult;
use crate::trie::TokenTrie;
use crate::trie::TrieMatch;

/// The working input buffer, read cursor, and global sequence counter for
/// one processing run.
///
/// The cursor is buffer-relative; the sequence number is the cursor's
/// position in the whole logical stream. `sequence() - position()` stays
/// constant across any refill that discards no unconsumed bytes, which is
/// what lets match locations be re-anchored after a refill.
pub struct ScanState<'r> {
	reader: &'r mut dyn Read,
	buffer: Vec<u8>,
	capacity: usize,
	position: usize,
	base_sequence: u64,
	eof: bool,
}

impl<'r> ScanState<'r> {
	/// Create a scan state over `reader` with a working buffer of
	/// `capacity` bytes, and perform the initial fill.
	pub fn new(reader: &'r mut dyn Read, capacity: usize) -> WeftResult<Self> {
		let mut state = Self {
			reader,
			buffer: Vec::with_capacity(capacity),
			capacity,
			position: 0,
			base_sequence: 0,
			eof: false,
		};
		state.fill()?;
		Ok(state)
	}

	fn fill(&mut self) -> WeftResult<()> {
		while self.buffer.len() < self.capacity && !self.eof {
			let old_len = self.buffer.len();
			self.buffer.resize(self.capacity, 0);
			match self.reader.read(&mut self.buffer[old_len..]) {
				Ok(0) => {
					self.buffer.truncate(old_len);
					self.eof = true;
				}
				Ok(read) => {
					self.buffer.truncate(old_len + read);
				}
				Err(error) if error.kind() == ErrorKind::Interrupted => {
					self.buffer.truncate(old_len);
				}
				Err(error) => {
					self.buffer.truncate(old_len);
					return Err(error.into());
				}
			}
		}
		Ok(())
	}

	/// All currently buffered bytes.
	pub fn buffered(&self) -> &[u8] {
		&self.buffer
	}

	/// The read cursor, relative to the current buffer.
	pub fn position(&self) -> usize {
		self.position
	}

	/// Number of valid bytes in the buffer.
	pub fn len(&self) -> usize {
		self.buffer.len()
	}

	pub fn is_empty(&self) -> bool {
		self.buffer.is_empty()
	}

	/// The cursor's position in the whole logical stream.
	pub fn sequence(&self) -> u64 {
		self.base_sequence + self.position as u64
	}

	/// True once the reader is exhausted. Buffered bytes may remain.
	pub fn at_eof(&self) -> bool {
		self.eof
	}

	/// True when every byte of the stream has been consumed.
	pub fn at_end(&self) -> bool {
		self.eof && self.position >= self.buffer.len()
	}

	pub fn advance(&mut self, count: usize) {
		self.position = (self.position + count).min(self.buffer.len());
	}

	pub fn slice(&self, start: usize, end: usize) -> &[u8] {
		&self.buffer[start..end]
	}

	/// Refill the buffer, discarding everything before `keep_from` and
	/// re-anchoring the cursor and sequence counter. Returns true when new
	/// bytes were obtained, false at true end of stream.
	pub fn advance_buffer(&mut self, keep_from: usize) -> WeftResult<bool> {
		let keep_from = keep_from.min(self.buffer.len());
		self.buffer.drain(..keep_from);
		self.base_sequence += keep_from as u64;
		self.position = self.position.saturating_sub(keep_from);

		let before = self.buffer.len();
		self.fill()?;
		Ok(self.buffer.len() > before)
	}

	/// Match `trie` at the cursor without consuming, refilling as needed
	/// while the trie reports that more input could change the answer.
	pub fn match_token(&mut self, trie: &TokenTrie) -> WeftResult<Option<TrieMatch>> {
		loop {
			let outcome = trie.match_at(&self.buffer, self.position);
			if outcome.needs_more_input && !self.eof {
				if !self.advance_buffer(self.position)? {
					return Ok(outcome.terminal);
				}
				continue;
			}
			return Ok(outcome.terminal);
		}
	}

	/// Match `trie` at the cursor and consume the matched bytes.
	pub fn try_consume(&mut self, trie: &TokenTrie) -> WeftResult<Option<TrieMatch>> {
		let matched = self.match_token(trie)?;
		if let Some(found) = matched {
			self.advance(found.length);
		}
		Ok(matched)
	}

	/// Advance the cursor past a maximal run of `trie` matches, consuming
	/// them and refilling across buffer boundaries. Returns the number of
	/// bytes consumed.
	pub fn seek_forward_through(&mut self, trie: &TokenTrie) -> WeftResult<usize> {
		let mut total = 0;
		while let Some(found) = self.try_consume(trie)? {
			if found.length == 0 {
				break;
			}
			total += found.length;
		}
		Ok(total)
	}

	/// Advance the cursor while `trie` matches, within the bytes already
	/// buffered. Stops at the first non-matching position or at the end of
	/// the buffer, whichever comes first.
	pub fn seek_forward_while(&mut self, trie: &TokenTrie) -> usize {
		let mut total = 0;
		loop {
			let outcome = trie.match_at(&self.buffer, self.position);
			let Some(found) = outcome.terminal else {
				break;
			};
			if found.length == 0 {
				break;
			}
			self.advance(found.length);
			total += found.length;
		}
		total
	}

	/// Discard input until the next `trie` match, consuming the match as
	/// well. Skipped bytes are dropped, not copied anywhere. Returns `None`
	/// when the stream ends without a match.
	pub fn seek_forward_until_match(
		&mut self,
		trie: &TokenTrie,
	) -> WeftResult<Option<TrieMatch>> {
		loop {
			if self.position >= self.buffer.len() {
				if !self.advance_buffer(self.position)? {
					return Ok(None);
				}
				continue;
			}

			let outcome = trie.match_at(&self.buffer, self.position);
			if outcome.needs_more_input && !self.eof {
				self.advance_buffer(self.position)?;
				continue;
			}
			if let Some(found) = outcome.terminal {
				self.advance(found.length);
				return Ok(Some(found));
			}
			self.advance(1);
		}
	}

	/// Collect bytes up to the next end-of-line token, consuming the line
	/// ending itself but not including it in the returned payload. Used to
	/// pull a directive's expression payload even when it straddles
	/// refills. At end of stream the remaining bytes are returned as-is.
	pub fn read_directive_line(&mut self, line_ends: &TokenTrie) -> WeftResult<Vec<u8>> {
		let mut payload = Vec::new();
		loop {
			if self.position >= self.buffer.len() {
				if !self.advance_buffer(self.position)? {
					return Ok(payload);
				}
				continue;
			}

			let outcome = line_ends.match_at(&self.buffer, self.position);
			if outcome.needs_more_input && !self.eof {
				self.advance_buffer(self.position)?;
				continue;
			}
			if let Some(found) = outcome.terminal {
				self.advance(found.length);
				return Ok(payload);
			}

			payload.push(self.buffer[self.position]);
			self.advance(1);
		}
	}

	/// The next unconsumed byte, refilling if necessary.
	pub fn peek(&mut self) -> WeftResult<Option<u8>> {
		if self.position >= self.buffer.len() {
			self.advance_buffer(self.position)?;
		}
		Ok(self.buffer.get(self.position).copied())
	}

	/// Consume and return the next byte.
	pub fn next_byte(&mut self) -> WeftResult<Option<u8>> {
		let byte = self.peek()?;
		if byte.is_some() {
			self.advance(1);
		}
		Ok(byte)
	}
}

/// The output side of a run: bytes written by operations and literal
/// copies, with a retained unflushed tail for backward seeks.
///
/// The flush threshold doubles as the lookback bound. Once pending output
/// grows past twice the threshold, the older half is flushed; backward
/// seeks operate on whatever is still pending and never cross bytes
/// already handed to the writer.
pub struct OutputSink<'w> {
	writer: &'w mut dyn Write,
	pending: Vec<u8>,
	flush_threshold: usize,
	flushed: u64,
}

impl<'w> OutputSink<'w> {
	pub fn new(writer: &'w mut dyn Write, flush_threshold: usize) -> Self {
		Self {
			writer,
			pending: Vec::new(),
			flush_threshold,
			flushed: 0,
		}
	}

	/// Append bytes to the output, spilling older pending output to the
	/// writer when the retained tail grows too large.
	pub fn write_bytes(&mut self, bytes: &[u8]) -> WeftResult<usize> {
		self.pending.extend_from_slice(bytes);
		self.spill()?;
		Ok(bytes.len())
	}

	fn spill(&mut self) -> WeftResult<()> {
		if self.pending.len() <= self.flush_threshold.saturating_mul(2) {
			return Ok(());
		}
		let spill_len = self.pending.len() - self.flush_threshold;
		self.writer.write_all(&self.pending[..spill_len])?;
		self.flushed += spill_len as u64;
		self.pending.drain(..spill_len);
		Ok(())
	}

	/// Trim trailing output while it matches `trie` tokens. Returns the
	/// number of bytes removed.
	pub fn seek_back_while(&mut self, trie: &TokenTrie) -> usize {
		let max_len = trie.max_token_length();
		let mut removed = 0;

		loop {
			let len = self.pending.len();
			let mut trimmed = false;
			// Longest token first, so a "\r\n" pair trims as one unit.
			for token_len in (1..=max_len.min(len)).rev() {
				let start = len - token_len;
				let outcome = trie.match_at(&self.pending, start);
				if outcome.terminal.is_some_and(|found| found.length == token_len) {
					self.pending.truncate(start);
					removed += token_len;
					trimmed = true;
					break;
				}
			}
			if !trimmed {
				return removed;
			}
		}
	}

	/// Move the end of the output back to the most recent `trie` boundary.
	/// With `consume` the boundary token itself is removed as well. When no
	/// boundary exists in the pending tail, everything pending is dropped.
	/// Returns the number of bytes removed.
	pub fn seek_back_until(&mut self, trie: &TokenTrie, consume: bool) -> usize {
		let len = self.pending.len();
		for start in (0..len).rev() {
			let Some(found) = trie.match_at(&self.pending, start).terminal else {
				continue;
			};
			let new_len = if consume { start } else { start + found.length };
			self.pending.truncate(new_len);
			return len - new_len;
		}

		self.pending.clear();
		len
	}

	/// Total bytes currently accounted for, flushed plus pending.
	pub fn written(&self) -> u64 {
		self.flushed + self.pending.len() as u64
	}

	/// Flush everything pending and the underlying writer. Returns the
	/// total number of bytes written over the whole run.
	pub fn finish(&mut self) -> WeftResult<u64> {
		self.writer.write_all(&self.pending)?;
		self.flushed += self.pending.len() as u64;
		self.pending.clear();
		self.writer.flush()?;
		Ok(self.flushed)
	}
}
