use std::cell::RefCell;
use std::io::Cursor;
use std::io::Write as _;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use rstest::rstest;
use similar_asserts::assert_eq;
use tracing_test::traced_test;

use super::__fixtures::*;
use super::*;

#[rstest]
#[case::bang(vec!["!", "!="], "!=1", "!=")]
#[case::else_before_elseif(vec!["#else", "#elseif"], "#elseif (x)", "#elseif")]
#[case::entity_amp(vec!["&", "&amp;", "&amp;&amp;"], "&amp;&amp; rest", "&amp;&amp;")]
#[case::shorter_when_longer_breaks(vec!["<", "<<"], "<+", "<")]
fn longest_match_wins(#[case] tokens: Vec<&str>, #[case] input: &str, #[case] expected: &str) {
	let trie = TokenTrie::from_tokens(tokens);
	let outcome = trie.match_at(input.as_bytes(), 0);
	let found = outcome.terminal.expect("a token should match");
	assert_eq!(&input.as_bytes()[..found.length], expected.as_bytes());
}

#[test]
fn duplicate_registration_returns_the_same_id() {
	let mut trie = TokenTrie::new();
	let first = trie.add(b"#if");
	let second = trie.add(b"#endif");
	assert_eq!(trie.add(b"#if"), first);
	assert_eq!(trie.add(b"#endif"), second);
	assert_eq!(trie.len(), 2);
}

#[test]
fn partial_token_at_buffer_end_requests_more_input() {
	let trie = TokenTrie::from_tokens([b"<!--".as_slice()]);

	let outcome = trie.match_at(b"<!-", 0);
	assert_eq!(outcome.terminal, None);
	assert!(outcome.needs_more_input);

	let outcome = trie.match_at(b"<x", 0);
	assert_eq!(outcome.terminal, None);
	assert!(!outcome.needs_more_input);
}

#[rstest]
#[case::tiny(16)]
#[case::small(64)]
#[case::large(4096)]
fn token_free_text_round_trips(#[case] buffer_size: usize) -> WeftResult<()> {
	let input = "The quick brown fox jumps over the lazy dog.\n\
	             Second line with nothing special in it at all.\n\
	             And a third line to force several refills.\n";
	let mut processor = conditional_processor(&[]);
	let output = transform_with_buffer(&mut processor, input, buffer_size, buffer_size)?;
	assert_eq!(output, input);
	Ok(())
}

#[test]
fn refills_are_transparent_to_the_output() -> WeftResult<()> {
	let input = "Start #if (1 < 2) kept #else dropped #endif end";

	let mut tiny = conditional_processor(&[]);
	let mut reader = Cursor::new(input.as_bytes().to_vec());
	let mut tiny_output = Vec::new();
	let tiny_summary = tiny.run_with_buffer(&mut reader, &mut tiny_output, 16, 16)?;

	let mut large = conditional_processor(&[]);
	let mut reader = Cursor::new(input.as_bytes().to_vec());
	let mut large_output = Vec::new();
	let large_summary = large.run_with_buffer(&mut reader, &mut large_output, 4096, 1024)?;

	assert_eq!(tiny_output, large_output);
	assert_eq!(tiny_summary.matches_dispatched, large_summary.matches_dispatched);
	assert_eq!(tiny_summary.bytes_read, large_summary.bytes_read);
	Ok(())
}

#[rstest]
#[case::true_branch("A #if (true) B #endif C", "ABC")]
#[case::false_branch("A #if (false) B #endif C", "AC")]
#[case::nested("#if (true) #if (false) X #endif Y #endif", "Y")]
#[case::elseif_taken("#if (false) A #elseif (true) B #else C #endif", "B")]
#[case::else_taken("#if (false) A #else C #endif", "C")]
#[case::else_skipped("#if (true) A #else C #endif", "A")]
#[case::elseif_all_false("#if (false) A #elseif (false) B #endif", "")]
fn conditional_blocks_balance(#[case] input: &str, #[case] expected: &str) -> WeftResult<()> {
	let mut processor = conditional_processor(&[]);
	let output = transform(&mut processor, input)?;
	assert_eq!(output, expected);
	Ok(())
}

#[rstest]
#[case::bound_true(&[("enabled", "true")], "#if (enabled) X #endif", "X")]
#[case::bound_false(&[("enabled", "false")], "#if (enabled) X #endif", "")]
#[case::unbound_is_false(&[], "#if (missing) X #endif", "")]
#[case::comparison(&[("count", "3")], "#if (count > 2) X #endif", "X")]
fn guards_consult_the_variable_environment(
	#[case] variables: &[(&str, &str)],
	#[case] input: &str,
	#[case] expected: &str,
) -> WeftResult<()> {
	let mut processor = conditional_processor(variables);
	let output = transform(&mut processor, input)?;
	assert_eq!(output, expected);
	Ok(())
}

#[rstest]
#[case::line_form("intro\n#if (true)\nkept\n#endif\noutro\n", "intro\nkept\noutro\n")]
#[case::line_form_false("intro\n#if (false)\ndropped\n#endif\noutro\n", "intro\noutro\n")]
fn line_form_directives_disappear_with_their_lines(
	#[case] input: &str,
	#[case] expected: &str,
) -> WeftResult<()> {
	let mut processor = conditional_processor(&[]);
	let output = transform(&mut processor, input)?;
	assert_eq!(output, expected);
	Ok(())
}

#[rstest]
#[case::unmatched_endif("text #endif more")]
#[case::elseif_without_if("text #elseif (true) more")]
fn directives_without_an_open_block_error(#[case] input: &str) {
	let mut processor = conditional_processor(&[]);
	let result = transform(&mut processor, input);
	assert!(matches!(result, Err(WeftError::UnexpectedDirective)));
}

#[rstest]
#[case::open_true("#if (true) X")]
#[case::open_false("#if (false) X")]
fn unterminated_conditional_errors(#[case] input: &str) {
	let mut processor = conditional_processor(&[]);
	let result = transform(&mut processor, input);
	assert!(matches!(result, Err(WeftError::UnclosedConditional)));
}

#[test]
fn conditional_state_starts_outside() {
	let operation = ConditionalOperation::new(ConditionalTokens::hash_style());
	assert_eq!(operation.current_state(), BranchState::Outside);
	assert_eq!(operation.depth(), 0);
}

#[rstest]
#[case::symbol_gt("1 > 0", DialectKind::CStyle, true)]
#[case::entity_gt("1 &gt; 0", DialectKind::MsBuild, true)]
#[case::entity_le("2 &lt;= 1", DialectKind::MsBuild, false)]
#[case::entity_and("1 &lt; 2 &amp;&amp; 3 &gt; 2", DialectKind::MsBuild, true)]
#[case::keyword_and("true AND false", DialectKind::CStyle2, false)]
#[case::keyword_or("false OR true", DialectKind::CStyle2, true)]
#[case::keyword_not("NOT false", DialectKind::CStyle2, true)]
#[case::symbols_still_work("1 < 2 && 3 > 2", DialectKind::CStyle, true)]
fn dialects_agree_on_equivalent_expressions(
	#[case] payload: &str,
	#[case] kind: DialectKind,
	#[case] expected: bool,
) {
	let dialect = ExprDialect::new(kind);
	let variables = VariableCollection::new();
	assert_eq!(
		evaluate_condition(payload.as_bytes(), &dialect, &variables),
		expected
	);
}

#[rstest]
#[case::lower_hex("0x10 == 16", true)]
#[case::upper_hex("0X1F == 31", true)]
#[case::hex_relational("0x0A < 11", true)]
fn hex_literals_parse(#[case] payload: &str, #[case] expected: bool) {
	let dialect = ExprDialect::new(DialectKind::CStyle);
	let variables = VariableCollection::new();
	assert_eq!(
		evaluate_condition(payload.as_bytes(), &dialect, &variables),
		expected
	);
}

#[test]
fn malformed_hex_faults_instead_of_crashing() {
	let dialect = ExprDialect::new(DialectKind::CStyle);
	let variables = VariableCollection::new();

	let outcome = evaluate(b"0xZZ == 16", &dialect, &variables);
	assert_eq!(outcome, Err(EvalFault::BadNumber("0xZZ".to_string())));
	assert!(!evaluate_condition(b"0xZZ == 16", &dialect, &variables));
}

#[rstest]
#[case::mul_before_add("1 + 2 * 3 == 7", true)]
#[case::shift_before_eq("2 << 2 == 8", true)]
#[case::rel_before_and("1 < 2 && 2 < 1", false)]
#[case::grouped_bitor("(1 | 2) == 3", true)]
#[case::not_group("!(1 == 2)", true)]
#[case::rem("3 % 2 == 1", true)]
#[case::unary_minus("-1 < 0", true)]
fn precedence_is_fixed(#[case] payload: &str, #[case] expected: bool) {
	let dialect = ExprDialect::new(DialectKind::CStyle);
	let variables = VariableCollection::new();
	assert_eq!(
		evaluate_condition(payload.as_bytes(), &dialect, &variables),
		expected
	);
}

#[test]
fn bitor_binds_looser_than_equality() {
	let dialect = ExprDialect::new(DialectKind::CStyle);
	let variables = VariableCollection::new();

	// `1 | 2 == 3` parses as `1 | (2 == 3)`, whose right side is a
	// boolean and cannot be coerced to an integer.
	let outcome = evaluate(b"1 | 2 == 3", &dialect, &variables);
	assert!(matches!(outcome, Err(EvalFault::NotInteger(_))));
}

#[rstest]
#[case::divide_by_zero("4 / 0 == 1")]
#[case::rem_by_zero("4 % 0 == 1")]
#[case::unterminated("\"abc == 1")]
#[case::empty("")]
fn faulted_guards_evaluate_false(#[case] payload: &str) {
	let dialect = ExprDialect::new(DialectKind::CStyle);
	let variables = VariableCollection::new();
	assert!(!evaluate_condition(payload.as_bytes(), &dialect, &variables));
}

#[rstest]
#[case::simple_equality("\"a\" == \"a\"", true)]
#[case::doubled_quote("'it''s' == \"it's\"", true)]
#[case::backslash_escape("\"say \\\"hi\\\"\" == 'say \"hi\"'", true)]
#[case::ordering("\"apple\" < \"banana\"", true)]
fn quoted_literals_compare(#[case] payload: &str, #[case] expected: bool) {
	let dialect = ExprDialect::new(DialectKind::CStyle);
	let variables = VariableCollection::new();
	assert_eq!(
		evaluate_condition(payload.as_bytes(), &dialect, &variables),
		expected
	);
}

#[traced_test]
#[test]
fn faulted_guard_reports_a_diagnostic() {
	let dialect = ExprDialect::new(DialectKind::CStyle);
	let variables = VariableCollection::new();

	assert!(!evaluate_condition(b"0xZZ == 1", &dialect, &variables));
	assert!(logs_contain("conditional guard faulted"));
}

#[test]
fn flag_tokens_are_swallowed_without_echo() -> WeftResult<()> {
	let mut processor = flag_processor(false);
	let output = transform(&mut processor, "A[on]B")?;
	assert_eq!(output, "AB");
	assert!(processor.config().flags.is_set("trim"));

	let mut processor = flag_processor(false);
	let output = transform(&mut processor, "A[off]B")?;
	assert_eq!(output, "AB");
	assert!(!processor.config().flags.is_set("trim"));
	Ok(())
}

#[test]
fn flag_tokens_echo_when_configured() -> WeftResult<()> {
	let mut processor = flag_processor(true);
	let output = transform(&mut processor, "A[on]B")?;
	assert_eq!(output, "A[on]B");
	assert!(processor.config().flags.is_set("trim"));
	Ok(())
}

#[test]
fn variables_substitute_and_absent_keys_write_null() -> WeftResult<()> {
	let mut processor = substitution_processor(&[("name", VariableValue::text("world"))]);
	let output = transform(&mut processor, "hello ${name}, ${missing}!")?;
	assert_eq!(output, "hello world, null!");
	Ok(())
}

#[test]
fn substitution_is_idempotent_across_runs() -> WeftResult<()> {
	let input = "version = ${version}\nname = ${name}\n";
	let mut processor = substitution_processor(&[
		("version", VariableValue::text("1.2.3")),
		("name", VariableValue::text("demo")),
	]);

	let first = transform(&mut processor, input)?;
	let second = transform(&mut processor, input)?;
	assert_eq!(first, second);
	assert_eq!(first, "version = 1.2.3\nname = demo\n");
	Ok(())
}

#[test]
fn computed_variables_render_lazily() -> WeftResult<()> {
	let mut processor = substitution_processor(&[(
		"stamp",
		VariableValue::computed(|| "2026-08-06".to_string()),
	)]);
	let output = transform(&mut processor, "built on ${stamp}")?;
	assert_eq!(output, "built on 2026-08-06");
	Ok(())
}

#[test]
fn trim_operation_consumes_surrounding_whitespace() -> WeftResult<()> {
	let mut processor = Processor::new(
		EngineConfig::default(),
		vec![Box::new(TrimWhitespaceOperation::new(
			[b"<trim>".to_vec()],
			true,
			true,
		))],
	);
	let output = transform(&mut processor, "A   <trim>   B")?;
	assert_eq!(output, "AB");
	Ok(())
}

#[test]
fn run_summary_accounts_for_the_whole_stream() -> WeftResult<()> {
	let input = "hello ${name}!";
	let mut processor = substitution_processor(&[("name", VariableValue::text("world"))]);

	let mut reader = Cursor::new(input.as_bytes().to_vec());
	let mut output = Vec::new();
	let summary = processor.run(&mut reader, &mut output)?;

	assert_eq!(summary.bytes_read, input.len() as u64);
	assert_eq!(summary.bytes_written, output.len() as u64);
	assert_eq!(summary.matches_dispatched, 1);
	assert_eq!(output, b"hello world!".to_vec());
	Ok(())
}

#[test]
fn cancellation_aborts_the_run() {
	let cancel = Arc::new(AtomicBool::new(true));
	let mut config = EngineConfig::default();
	config.cancel = Some(Arc::clone(&cancel));

	let mut processor = Processor::new(
		config,
		vec![Box::new(ConditionalOperation::new(
			ConditionalTokens::hash_style(),
		))],
	);
	let result = transform(&mut processor, "some input");
	assert!(matches!(result, Err(WeftError::Cancelled)));

	cancel.store(false, Ordering::Relaxed);
	let output = transform(&mut processor, "some input").expect("run should succeed");
	assert_eq!(output, "some input");
}

#[test]
fn undersized_buffers_are_rejected_before_the_run() {
	let mut processor = conditional_processor(&[]);
	// Longest registered directive is `#elseif`, seven bytes.
	let result = transform_with_buffer(&mut processor, "anything", 4, 4);
	assert!(matches!(
		result,
		Err(WeftError::BufferTooSmall {
			buffer_size: 4,
			longest_token: 7,
		})
	));
}

#[test]
fn stream_matcher_carries_matches_across_buffers() {
	let mut trie = TokenTrie::new();
	let id = trie.add(b"${name}");
	let mut matcher = StreamMatcher::new(&trie);

	let first: &[u8] = b"ab${na";
	let mut position = 0;
	assert_eq!(matcher.evaluate(first, false, 0, &mut position), None);
	assert_eq!(position, first.len());

	let keep_from = matcher.oldest_required().expect("a match should be pending") as usize;
	assert_eq!(keep_from, 2);

	// The caller keeps the pending bytes, drops the two literal bytes in
	// front of them, and appends the next chunk.
	let second: &[u8] = b"${name}cd";
	position -= keep_from;
	let found = matcher
		.evaluate(second, false, keep_from, &mut position)
		.expect("the straddling token should complete");
	assert_eq!(
		found,
		TerminalLocation {
			token: id,
			start: 0,
			length: 7,
		}
	);
	assert_eq!(position, 7);

	assert_eq!(matcher.evaluate(second, true, 0, &mut position), None);
	assert_eq!(position, second.len());
	assert_eq!(matcher.oldest_required(), None);
}

#[test]
fn stream_matcher_finalizes_with_the_longest_completed_token() {
	let mut trie = TokenTrie::new();
	let short = trie.add(b"ab");
	trie.add(b"abcd");
	let mut matcher = StreamMatcher::new(&trie);

	let buffer: &[u8] = b"abc";
	let mut position = 0;
	assert_eq!(matcher.evaluate(buffer, false, 0, &mut position), None);

	let found = matcher
		.evaluate(buffer, true, 0, &mut position)
		.expect("the shorter token should win at end of stream");
	assert_eq!(
		found,
		TerminalLocation {
			token: short,
			start: 0,
			length: 2,
		}
	);
	assert_eq!(position, 2);
}

#[test]
fn output_sink_trims_trailing_whitespace() -> WeftResult<()> {
	let whitespace = TokenTrie::from_tokens([b" ".as_slice(), b"\t".as_slice()]);
	let mut target = Vec::new();
	let mut sink = OutputSink::new(&mut target, 64);

	sink.write_bytes(b"A  \t")?;
	assert_eq!(sink.seek_back_while(&whitespace), 3);
	assert_eq!(sink.written(), 1);
	sink.finish()?;
	assert_eq!(target, b"A".to_vec());
	Ok(())
}

#[test]
fn output_sink_seeks_back_to_a_boundary() -> WeftResult<()> {
	let line_ends = TokenTrie::from_tokens([b"\n".as_slice()]);

	let mut target = Vec::new();
	let mut sink = OutputSink::new(&mut target, 64);
	sink.write_bytes(b"line1\nline2  ")?;
	assert_eq!(sink.seek_back_until(&line_ends, false), 7);
	sink.finish()?;
	assert_eq!(target, b"line1\n".to_vec());

	let mut target = Vec::new();
	let mut sink = OutputSink::new(&mut target, 64);
	sink.write_bytes(b"line1\nline2  ")?;
	assert_eq!(sink.seek_back_until(&line_ends, true), 8);
	sink.finish()?;
	assert_eq!(target, b"line1".to_vec());
	Ok(())
}

#[test]
fn variable_scopes_chain_and_hooks_fire() {
	let mut parent = VariableCollection::new();
	parent.set("name", VariableValue::text("outer"));
	parent.set("keep", VariableValue::text("kept"));

	let mut child = VariableCollection::with_parent(Rc::new(parent));
	let reads = Rc::new(RefCell::new(Vec::new()));
	let seen = Rc::clone(&reads);
	child.on_read(move |key| seen.borrow_mut().push(key.to_string()));
	child.set("name", VariableValue::text("inner"));

	assert_eq!(child.render("name").as_deref(), Some("inner"));
	assert_eq!(child.render("keep").as_deref(), Some("kept"));
	assert!(!child.contains("absent"));
	assert_eq!(reads.borrow().len(), 2);
}

#[test]
fn run_profile_loads_from_disk() -> WeftResult<()> {
	let dir = tempfile::tempdir()?;
	std::fs::write(
		dir.path().join("weft.toml"),
		"dialect = \"ms-build\"\n\n[variables]\nname = \"demo\"\ncount = 3\n\n[flags]\nflags = true\n",
	)?;

	let profile = RunProfile::load(dir.path())?.expect("the profile should resolve");
	assert_eq!(profile.dialect, DialectKind::MsBuild);

	let config = profile.into_config();
	assert_eq!(config.variables.render("name").as_deref(), Some("demo"));
	assert_eq!(config.variables.render("count").as_deref(), Some("3"));
	assert!(config.flags.is_set(FlagTable::ECHO_FLAGS));
	Ok(())
}

#[test]
fn missing_run_profile_is_not_an_error() -> WeftResult<()> {
	let dir = tempfile::tempdir()?;
	assert!(RunProfile::load(dir.path())?.is_none());
	Ok(())
}

#[test]
fn malformed_run_profile_reports_a_parse_error() -> WeftResult<()> {
	let dir = tempfile::tempdir()?;
	std::fs::write(dir.path().join("weft.toml"), "dialect = \"no-such-dialect\"\n")?;

	let result = RunProfile::load(dir.path());
	assert!(matches!(result, Err(WeftError::ProfileParse(_))));
	Ok(())
}

#[test]
fn file_backed_streams_process_like_memory_streams() -> WeftResult<()> {
	let mut file = tempfile::NamedTempFile::new()?;
	file.write_all(b"A #if (true) B #endif C")?;
	file.flush()?;

	let mut reader = std::fs::File::open(file.path())?;
	let mut output = Vec::new();
	let mut processor = conditional_processor(&[]);
	processor.run(&mut reader, &mut output)?;

	assert_eq!(output, b"ABC".to_vec());
	Ok(())
}
