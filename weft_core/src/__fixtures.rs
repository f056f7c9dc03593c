use std::io::Cursor;

use crate::ConditionalOperation;
use crate::ConditionalTokens;
use crate::DEFAULT_BUFFER_SIZE;
use crate::DEFAULT_FLUSH_THRESHOLD;
use crate::EngineConfig;
use crate::FlagOperation;
use crate::FlagTable;
use crate::Processor;
use crate::VariableOperation;
use crate::VariableValue;
use crate::WeftResult;

/// A processor recognizing `#if` style conditionals, with the given
/// variables bound as plain text.
pub fn conditional_processor(variables: &[(&str, &str)]) -> Processor {
	let mut config = EngineConfig::default();
	for (key, value) in variables {
		config.variables.set(*key, VariableValue::text(*value));
	}

	Processor::new(
		config,
		vec![Box::new(ConditionalOperation::new(
			ConditionalTokens::hash_style(),
		))],
	)
}

/// A processor substituting `${key}` tokens from the given variables.
pub fn substitution_processor(variables: &[(&str, VariableValue)]) -> Processor {
	let mut config = EngineConfig::default();
	let mut entries = Vec::new();
	for (key, value) in variables {
		config.variables.set(*key, value.clone());
		entries.push((format!("${{{key}}}").into_bytes(), (*key).to_string()));
	}
	// A token for a key that is never bound, to exercise the null path.
	entries.push((b"${missing}".to_vec(), "missing".to_string()));

	Processor::new(config, vec![Box::new(VariableOperation::new(entries))])
}

/// A processor with one `[on]`/`[off]` flag pair named `trim`. `echo`
/// preloads the well-known `flags` entry that controls whether flag
/// tokens are kept in the output.
pub fn flag_processor(echo: bool) -> Processor {
	let mut config = EngineConfig::default();
	config
		.flags
		.insert(FlagTable::ECHO_FLAGS.to_string(), echo);

	Processor::new(
		config,
		vec![Box::new(FlagOperation::new("trim", *b"[on]", *b"[off]"))],
	)
}

/// Run `input` through `processor` with default buffer policy.
pub fn transform(processor: &mut Processor, input: &str) -> WeftResult<String> {
	transform_with_buffer(processor, input, DEFAULT_BUFFER_SIZE, DEFAULT_FLUSH_THRESHOLD)
}

/// Run `input` through `processor` with an explicit buffer size and flush
/// threshold, collecting the output as a string.
pub fn transform_with_buffer(
	processor: &mut Processor,
	input: &str,
	buffer_size: usize,
	flush_threshold: usize,
) -> WeftResult<String> {
	let mut reader = Cursor::new(input.as_bytes().to_vec());
	let mut output = Vec::new();
	processor.run_with_buffer(&mut reader, &mut output, buffer_size, flush_threshold)?;
	Ok(String::from_utf8_lossy(&output).into_owned())
}
