use std::collections::HashMap;

/// Identifier of a registered token, assigned in registration order.
pub type TokenId = usize;

#[derive(Debug, Default)]
struct TrieNode {
	children: HashMap<u8, TrieNode>,
	token: Option<TokenId>,
	/// Longest registered suffix below this node. A walk that reaches this
	/// node with fewer buffered bytes remaining cannot rule out a deeper
	/// match and must ask for more input.
	max_remaining: usize,
}

/// A prefix trie over byte sequences used for multi-pattern matching.
///
/// Tokens are registered once per run configuration and the trie is
/// read-only afterwards, so a built trie can be shared across parallel
/// runs by reference.
#[derive(Debug, Default)]
pub struct TokenTrie {
	root: TrieNode,
	tokens: Vec<Vec<u8>>,
}

/// A completed token match: which token, and how many bytes it spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrieMatch {
	pub token: TokenId,
	pub length: usize,
}

/// Result of walking the trie against the bytes currently buffered.
///
/// `terminal` is the deepest (longest) token completed during the walk.
/// `needs_more_input` is true when the walk ran out of buffered bytes
/// while a longer registered token was still reachable, so the answer
/// could change once more bytes arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatchOutcome {
	pub terminal: Option<TrieMatch>,
	pub needs_more_input: bool,
}

impl TokenTrie {
	pub fn new() -> Self {
		Self::default()
	}

	/// Build a trie from an iterator of byte sequences.
	pub fn from_tokens<I, B>(tokens: I) -> Self
	where
		I: IntoIterator<Item = B>,
		B: AsRef<[u8]>,
	{
		let mut trie = Self::new();
		for token in tokens {
			trie.add(token.as_ref());
		}
		trie
	}

	/// Register a byte sequence and return its stable id. Registering the
	/// same sequence again returns the id assigned the first time.
	pub fn add(&mut self, bytes: impl AsRef<[u8]>) -> TokenId {
		let bytes = bytes.as_ref();

		if let Some(existing) = self.lookup_exact(bytes) {
			return existing;
		}

		let id = self.tokens.len();
		self.tokens.push(bytes.to_vec());

		let mut node = &mut self.root;
		for (depth, byte) in bytes.iter().enumerate() {
			let remaining = bytes.len() - depth;
			node.max_remaining = node.max_remaining.max(remaining);
			node = node.children.entry(*byte).or_default();
		}
		node.token = Some(id);

		id
	}

	/// The id registered for exactly `bytes`, if any.
	pub fn lookup_exact(&self, bytes: &[u8]) -> Option<TokenId> {
		let mut node = &self.root;
		for byte in bytes {
			node = node.children.get(byte)?;
		}
		node.token
	}

	/// Walk the trie following `buffer` bytes starting at `cursor`. Never
	/// reads past the end of `buffer`. Longest match wins: the walk keeps
	/// going past shorter terminals while deeper edges exist.
	pub fn match_at(&self, buffer: &[u8], cursor: usize) -> MatchOutcome {
		let mut walk = self.cursor();
		let mut offset = cursor;

		loop {
			let Some(byte) = buffer.get(offset) else {
				return MatchOutcome {
					terminal: walk.best(),
					needs_more_input: walk.can_continue(),
				};
			};

			if !walk.step(*byte) {
				return MatchOutcome {
					terminal: walk.best(),
					needs_more_input: false,
				};
			}

			offset += 1;
		}
	}

	/// Start a byte-at-a-time walk from the root.
	pub fn cursor(&self) -> TrieCursor<'_> {
		TrieCursor {
			node: &self.root,
			depth: 0,
			best: None,
		}
	}

	/// The bytes registered under `id`.
	pub fn token_bytes(&self, id: TokenId) -> &[u8] {
		&self.tokens[id]
	}

	/// Number of registered tokens.
	pub fn len(&self) -> usize {
		self.tokens.len()
	}

	pub fn is_empty(&self) -> bool {
		self.tokens.is_empty()
	}

	/// Length in bytes of the longest registered token. Buffer sizing is
	/// validated against this before a run starts.
	pub fn max_token_length(&self) -> usize {
		self.tokens.iter().map(Vec::len).max().unwrap_or(0)
	}
}

/// An in-progress walk through the trie, fed one byte at a time.
///
/// Records the deepest terminal passed so far, so a walk that dies on a
/// later byte can still resolve to the longest completed token.
#[derive(Debug, Clone)]
pub struct TrieCursor<'t> {
	node: &'t TrieNode,
	depth: usize,
	best: Option<TrieMatch>,
}

impl TrieCursor<'_> {
	/// Advance along the edge for `byte`. Returns false when no such edge
	/// exists; the cursor is then dead and `best()` holds the final answer.
	pub fn step(&mut self, byte: u8) -> bool {
		let Some(child) = self.node.children.get(&byte) else {
			return false;
		};

		self.node = child;
		self.depth += 1;

		if let Some(token) = self.node.token {
			self.best = Some(TrieMatch {
				token,
				length: self.depth,
			});
		}

		true
	}

	/// True while deeper registered tokens remain reachable from here.
	pub fn can_continue(&self) -> bool {
		self.node.max_remaining > 0
	}

	/// The deepest terminal passed so far.
	pub fn best(&self) -> Option<TrieMatch> {
		self.best
	}

	/// Bytes consumed by this walk so far.
	pub fn depth(&self) -> usize {
		self.depth
	}
}
