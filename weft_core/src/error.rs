use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum WeftError {
	#[error(transparent)]
	#[diagnostic(code(weft::io_error))]
	Io(#[from] std::io::Error),

	#[error("conditional block was never closed")]
	#[diagnostic(
		code(weft::unclosed_conditional),
		help("every opening directive needs a matching closing directive before the end of the stream")
	)]
	UnclosedConditional,

	#[error("closing or continuation directive without a matching opening directive")]
	#[diagnostic(code(weft::unexpected_directive))]
	UnexpectedDirective,

	#[error("buffer size {buffer_size} is smaller than the longest registered token ({longest_token} bytes)")]
	#[diagnostic(
		code(weft::buffer_too_small),
		help("raise the buffer size so every registered token fits in a single buffer")
	)]
	BufferTooSmall {
		buffer_size: usize,
		longest_token: usize,
	},

	#[error("run cancelled")]
	#[diagnostic(code(weft::cancelled))]
	Cancelled,

	#[error("failed to parse run profile: {0}")]
	#[diagnostic(
		code(weft::profile_parse),
		help("check that weft.toml contains valid [variables] and [flags] tables and a known dialect")
	)]
	ProfileParse(String),
}

pub type WeftResult<T> = Result<T, WeftError>;
