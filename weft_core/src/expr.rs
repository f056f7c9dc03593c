//! The embedded expression language used inside conditional directives.
//!
//! A directive's guard is a small boolean/relational/arithmetic expression
//! evaluated against the run's variable environment. Lexing is
//! dialect-specific (operator spellings differ between the C-style,
//! keyword, and angle-bracket-entity dialects) but every dialect shares
//! one operator table and one precedence core.
//!
//! Evaluation never panics and never propagates an error to the stream
//! driver: every failure mode (bad literal, type coercion, division by
//! zero) is an [`EvalFault`] value, and [`evaluate_condition`] maps a
//! fault to `false` with a logged diagnostic.

use std::cmp::Ordering;

use float_cmp::approx_eq;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::trie::TokenTrie;
use crate::variables::VariableCollection;
use crate::variables::VariableValue;

/// A value produced while evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
	Null,
	Bool(bool),
	Int(i64),
	Float(f64),
	Text(String),
}

impl Value {
	/// Boolean coercion. Numbers are truthy when non-zero; text must spell
	/// `true` or `false`.
	pub fn to_bool(&self) -> EvalOutcome<bool> {
		match self {
			Self::Bool(value) => Ok(*value),
			Self::Int(value) => Ok(*value != 0),
			Self::Float(value) => Ok(*value != 0.0),
			Self::Text(text) => {
				if text.eq_ignore_ascii_case("true") {
					Ok(true)
				} else if text.eq_ignore_ascii_case("false") {
					Ok(false)
				} else {
					Err(EvalFault::NotBoolean(text.clone()))
				}
			}
			Self::Null => Err(EvalFault::NotBoolean("null".to_string())),
		}
	}

	/// Integer coercion. Text accepts `0x`/`0X` hexadecimal or decimal;
	/// floats must be integral.
	pub fn to_int(&self) -> EvalOutcome<i64> {
		match self {
			Self::Int(value) => Ok(*value),
			Self::Float(value) if value.fract() == 0.0 => Ok(*value as i64),
			Self::Text(text) => parse_int_text(text),
			_ => Err(EvalFault::NotInteger(self.render_text())),
		}
	}

	/// Numeric view used by the comparison core. Text is included when it
	/// parses as a number, so `"0x10" == 16` compares numerically.
	fn as_number(&self) -> Option<f64> {
		match self {
			Self::Int(value) => Some(*value as f64),
			Self::Float(value) => Some(*value),
			Self::Text(text) => {
				parse_int_text(text)
					.map(|value| value as f64)
					.ok()
					.or_else(|| text.parse::<f64>().ok())
			}
			_ => None,
		}
	}

	/// The textual form used for string comparison and diagnostics.
	pub fn render_text(&self) -> String {
		match self {
			Self::Null => "null".to_string(),
			Self::Bool(value) => value.to_string(),
			Self::Int(value) => value.to_string(),
			Self::Float(value) => value.to_string(),
			Self::Text(text) => text.clone(),
		}
	}
}

fn parse_int_text(text: &str) -> EvalOutcome<i64> {
	if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
		return i64::from_str_radix(hex, 16)
			.map_err(|_| EvalFault::BadNumber(text.to_string()));
	}
	text.parse::<i64>()
		.map_err(|_| EvalFault::BadNumber(text.to_string()))
}

/// Why an evaluation faulted. A fault is an ordinary control-flow value:
/// the caller treats it as "condition false" and reports a diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum EvalFault {
	#[error("unterminated literal")]
	UnterminatedLiteral,
	#[error("malformed literal: `{0}`")]
	BadLiteral(String),
	#[error("malformed numeric literal: `{0}`")]
	BadNumber(String),
	#[error("malformed atom: `{0}`")]
	BadAtom(String),
	#[error("cannot convert `{0}` to a boolean")]
	NotBoolean(String),
	#[error("cannot convert `{0}` to an integer")]
	NotInteger(String),
	#[error("values are not comparable")]
	NotComparable,
	#[error("division by zero")]
	DivideByZero,
	#[error("arithmetic overflow")]
	Overflow,
	#[error("shift amount out of range")]
	ShiftOutOfRange,
	#[error("unexpected token at position {0}")]
	UnexpectedToken(usize),
	#[error("unbalanced group")]
	UnbalancedGroup,
	#[error("expression ended unexpectedly")]
	UnexpectedEnd,
}

pub type EvalOutcome<T> = Result<T, EvalFault>;

/// A binary operator. Precedence classes, low to high:
/// `||` < `&&` < `|` < `^` < `&` < equality < relational < shifts <
/// additive < multiplicative. All binaries are left-associative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
	Or,
	And,
	BitOr,
	BitXor,
	BitAnd,
	Eq,
	Ne,
	Lt,
	Le,
	Gt,
	Ge,
	Shl,
	Shr,
	Add,
	Sub,
	Mul,
	Div,
	Rem,
}

impl Operator {
	pub fn precedence(self) -> u8 {
		match self {
			Self::Or => 1,
			Self::And => 2,
			Self::BitOr => 3,
			Self::BitXor => 4,
			Self::BitAnd => 5,
			Self::Eq | Self::Ne => 6,
			Self::Lt | Self::Le | Self::Gt | Self::Ge => 7,
			Self::Shl | Self::Shr => 8,
			Self::Add | Self::Sub => 9,
			Self::Mul | Self::Div | Self::Rem => 10,
		}
	}

	/// Apply the operator to two evaluated operands.
	pub fn apply(self, lhs: &Value, rhs: &Value) -> EvalOutcome<Value> {
		match self {
			Self::Or => Ok(Value::Bool(lhs.to_bool()? || rhs.to_bool()?)),
			Self::And => Ok(Value::Bool(lhs.to_bool()? && rhs.to_bool()?)),
			Self::BitOr => Ok(Value::Int(lhs.to_int()? | rhs.to_int()?)),
			Self::BitXor => Ok(Value::Int(lhs.to_int()? ^ rhs.to_int()?)),
			Self::BitAnd => Ok(Value::Int(lhs.to_int()? & rhs.to_int()?)),
			Self::Eq => Ok(Value::Bool(compare(lhs, rhs)? == Ordering::Equal)),
			Self::Ne => Ok(Value::Bool(compare(lhs, rhs)? != Ordering::Equal)),
			Self::Lt => Ok(Value::Bool(compare(lhs, rhs)? == Ordering::Less)),
			Self::Le => Ok(Value::Bool(compare(lhs, rhs)? != Ordering::Greater)),
			Self::Gt => Ok(Value::Bool(compare(lhs, rhs)? == Ordering::Greater)),
			Self::Ge => Ok(Value::Bool(compare(lhs, rhs)? != Ordering::Less)),
			Self::Shl => shift(lhs, rhs, i64::checked_shl),
			Self::Shr => shift(lhs, rhs, i64::checked_shr),
			Self::Add => arithmetic(lhs, rhs, i64::checked_add),
			Self::Sub => arithmetic(lhs, rhs, i64::checked_sub),
			Self::Mul => arithmetic(lhs, rhs, i64::checked_mul),
			Self::Div => divide(lhs, rhs, i64::checked_div),
			Self::Rem => divide(lhs, rhs, i64::checked_rem),
		}
	}
}

/// The single 3-way comparison behind every relational operator, so that
/// `a < b`, `a <= b`, and `a == b` stay mutually consistent for the same
/// operand pair. Numeric when both sides have a numeric view, textual
/// otherwise.
fn compare(lhs: &Value, rhs: &Value) -> EvalOutcome<Ordering> {
	if let (Some(left), Some(right)) = (lhs.as_number(), rhs.as_number()) {
		if approx_eq!(f64, left, right, ulps = 2) {
			return Ok(Ordering::Equal);
		}
		return left.partial_cmp(&right).ok_or(EvalFault::NotComparable);
	}
	Ok(lhs.render_text().cmp(&rhs.render_text()))
}

fn arithmetic(
	lhs: &Value,
	rhs: &Value,
	op: fn(i64, i64) -> Option<i64>,
) -> EvalOutcome<Value> {
	op(lhs.to_int()?, rhs.to_int()?)
		.map(Value::Int)
		.ok_or(EvalFault::Overflow)
}

fn divide(lhs: &Value, rhs: &Value, op: fn(i64, i64) -> Option<i64>) -> EvalOutcome<Value> {
	let divisor = rhs.to_int()?;
	if divisor == 0 {
		return Err(EvalFault::DivideByZero);
	}
	op(lhs.to_int()?, divisor)
		.map(Value::Int)
		.ok_or(EvalFault::Overflow)
}

fn shift(lhs: &Value, rhs: &Value, op: fn(i64, u32) -> Option<i64>) -> EvalOutcome<Value> {
	let amount = rhs.to_int()?;
	let amount = u32::try_from(amount).map_err(|_| EvalFault::ShiftOutOfRange)?;
	op(lhs.to_int()?, amount)
		.map(Value::Int)
		.ok_or(EvalFault::ShiftOutOfRange)
}

/// Which lexical dialect a run's conditional guards are written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DialectKind {
	/// Symbol operators: `&&`, `||`, `==`, `<`, `<<`, ...
	#[default]
	CStyle,
	/// The symbol operators plus keyword spellings: `AND`, `OR`, `NOT`,
	/// `XOR`.
	CStyle2,
	/// The symbol operators plus HTML-entity spellings for the characters
	/// that are awkward inside angle-bracket markup: `&lt;`, `&gt;`,
	/// `&amp;&amp;`, ...
	MsBuild,
}

/// What a matched symbol means to the expression lexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SymbolKind {
	Op(Operator),
	Not,
	OpenGroup,
	CloseGroup,
	Quote(u8),
	Space,
	Eol,
}

/// A dialect's symbol table: one sub-trie over operator spellings plus the
/// meaning of each registered symbol.
///
/// Built once per run configuration and shared read-only afterwards; there
/// is deliberately no process-wide cache.
#[derive(Debug)]
pub struct ExprDialect {
	kind: DialectKind,
	symbols: TokenTrie,
	entries: Vec<SymbolKind>,
}

impl ExprDialect {
	pub fn new(kind: DialectKind) -> Self {
		let mut dialect = Self {
			kind,
			symbols: TokenTrie::new(),
			entries: Vec::new(),
		};
		dialect.register_common();
		match kind {
			DialectKind::CStyle => {}
			DialectKind::CStyle2 => dialect.register_keywords(),
			DialectKind::MsBuild => dialect.register_entities(),
		}
		dialect
	}

	pub fn kind(&self) -> DialectKind {
		self.kind
	}

	fn register(&mut self, spelling: &str, kind: SymbolKind) {
		let id = self.symbols.add(spelling.as_bytes());
		if id == self.entries.len() {
			self.entries.push(kind);
		}
	}

	fn register_common(&mut self) {
		self.register("||", SymbolKind::Op(Operator::Or));
		self.register("&&", SymbolKind::Op(Operator::And));
		self.register("|", SymbolKind::Op(Operator::BitOr));
		self.register("^", SymbolKind::Op(Operator::BitXor));
		self.register("&", SymbolKind::Op(Operator::BitAnd));
		self.register("==", SymbolKind::Op(Operator::Eq));
		self.register("!=", SymbolKind::Op(Operator::Ne));
		self.register("<=", SymbolKind::Op(Operator::Le));
		self.register(">=", SymbolKind::Op(Operator::Ge));
		self.register("<<", SymbolKind::Op(Operator::Shl));
		self.register(">>", SymbolKind::Op(Operator::Shr));
		self.register("<", SymbolKind::Op(Operator::Lt));
		self.register(">", SymbolKind::Op(Operator::Gt));
		self.register("+", SymbolKind::Op(Operator::Add));
		self.register("-", SymbolKind::Op(Operator::Sub));
		self.register("*", SymbolKind::Op(Operator::Mul));
		self.register("/", SymbolKind::Op(Operator::Div));
		self.register("%", SymbolKind::Op(Operator::Rem));
		self.register("!", SymbolKind::Not);
		self.register("(", SymbolKind::OpenGroup);
		self.register(")", SymbolKind::CloseGroup);
		self.register("\"", SymbolKind::Quote(b'"'));
		self.register("'", SymbolKind::Quote(b'\''));
		self.register(" ", SymbolKind::Space);
		self.register("\t", SymbolKind::Space);
		self.register("\r\n", SymbolKind::Eol);
		self.register("\n", SymbolKind::Eol);
		self.register("\r", SymbolKind::Eol);
	}

	fn register_keywords(&mut self) {
		self.register("AND", SymbolKind::Op(Operator::And));
		self.register("OR", SymbolKind::Op(Operator::Or));
		self.register("XOR", SymbolKind::Op(Operator::BitXor));
		self.register("NOT", SymbolKind::Not);
	}

	fn register_entities(&mut self) {
		self.register("&lt;=", SymbolKind::Op(Operator::Le));
		self.register("&gt;=", SymbolKind::Op(Operator::Ge));
		self.register("&lt;&lt;", SymbolKind::Op(Operator::Shl));
		self.register("&gt;&gt;", SymbolKind::Op(Operator::Shr));
		self.register("&lt;", SymbolKind::Op(Operator::Lt));
		self.register("&gt;", SymbolKind::Op(Operator::Gt));
		self.register("&amp;&amp;", SymbolKind::Op(Operator::And));
		self.register("&amp;", SymbolKind::Op(Operator::BitAnd));
	}
}

#[derive(Debug, Clone, PartialEq)]
enum ExprToken {
	Literal(Value),
	Op(Operator),
	Not,
	Open,
	Close,
}

/// Single pass over the payload bytes: symbols resolve through the
/// dialect's sub-trie (longest spelling wins, so `!=` beats `!` and
/// `&amp;&amp;` beats `&amp;`), quoted literals are read verbatim, and
/// anything else is an atom classified as number, boolean, or variable
/// reference.
fn tokenize(
	payload: &[u8],
	dialect: &ExprDialect,
	variables: &VariableCollection,
) -> EvalOutcome<Vec<ExprToken>> {
	let mut tokens = Vec::new();
	let mut pos = 0;

	while pos < payload.len() {
		if let Some(found) = dialect.symbols.match_at(payload, pos).terminal {
			match dialect.entries[found.token] {
				SymbolKind::Space => pos += found.length,
				SymbolKind::Eol => break,
				SymbolKind::Quote(quote) => {
					let (text, next) = read_literal(payload, pos + found.length, quote)?;
					tokens.push(ExprToken::Literal(Value::Text(text)));
					pos = next;
				}
				SymbolKind::Op(op) => {
					tokens.push(ExprToken::Op(op));
					pos += found.length;
				}
				SymbolKind::Not => {
					tokens.push(ExprToken::Not);
					pos += found.length;
				}
				SymbolKind::OpenGroup => {
					tokens.push(ExprToken::Open);
					pos += found.length;
				}
				SymbolKind::CloseGroup => {
					tokens.push(ExprToken::Close);
					pos += found.length;
				}
			}
			continue;
		}

		let start = pos;
		while pos < payload.len() && dialect.symbols.match_at(payload, pos).terminal.is_none() {
			pos += 1;
		}
		tokens.push(ExprToken::Literal(classify_atom(&payload[start..pos], variables)?));
	}

	Ok(tokens)
}

/// Read a quoted literal starting just after the opening quote. Supports
/// backslash escapes and doubled quote characters; the closing quote is
/// consumed but not included.
fn read_literal(payload: &[u8], start: usize, quote: u8) -> EvalOutcome<(String, usize)> {
	let mut raw = Vec::new();
	let mut pos = start;

	loop {
		let Some(&byte) = payload.get(pos) else {
			return Err(EvalFault::UnterminatedLiteral);
		};

		if byte == b'\\' {
			let Some(&escaped) = payload.get(pos + 1) else {
				return Err(EvalFault::UnterminatedLiteral);
			};
			raw.push(byte);
			raw.push(escaped);
			pos += 2;
			continue;
		}

		if byte == quote {
			if payload.get(pos + 1) == Some(&quote) {
				raw.push(quote);
				pos += 2;
				continue;
			}
			pos += 1;
			break;
		}

		raw.push(byte);
		pos += 1;
	}

	let text = String::from_utf8_lossy(&raw).into_owned();
	if !text.contains('\\') {
		return Ok((text, pos));
	}

	let quoted = format!("\"{text}\"");
	match snailquote::unescape(&quoted) {
		Ok(unescaped) => Ok((unescaped, pos)),
		Err(_) => Err(EvalFault::BadLiteral(text)),
	}
}

fn classify_atom(atom: &[u8], variables: &VariableCollection) -> EvalOutcome<Value> {
	let Ok(text) = std::str::from_utf8(atom) else {
		return Err(EvalFault::BadAtom(String::from_utf8_lossy(atom).into_owned()));
	};

	if text.eq_ignore_ascii_case("true") {
		return Ok(Value::Bool(true));
	}
	if text.eq_ignore_ascii_case("false") {
		return Ok(Value::Bool(false));
	}
	if text.eq_ignore_ascii_case("null") {
		return Ok(Value::Null);
	}

	if text.starts_with("0x") || text.starts_with("0X") {
		return parse_int_text(text).map(Value::Int);
	}
	if text.starts_with(|c: char| c.is_ascii_digit()) {
		if let Ok(value) = text.parse::<i64>() {
			return Ok(Value::Int(value));
		}
		return text
			.parse::<f64>()
			.map(Value::Float)
			.map_err(|_| EvalFault::BadNumber(text.to_string()));
	}

	// Anything else is a variable reference; absent variables evaluate to
	// null rather than faulting.
	match variables.get(text) {
		Some(VariableValue::Bound(bound)) => Ok(json_to_value(bound)),
		Some(computed @ VariableValue::Computed(_)) => Ok(Value::Text(computed.render())),
		None => Ok(Value::Null),
	}
}

fn json_to_value(bound: &serde_json::Value) -> Value {
	match bound {
		serde_json::Value::Null => Value::Null,
		serde_json::Value::Bool(value) => Value::Bool(*value),
		serde_json::Value::Number(number) => {
			number
				.as_i64()
				.map(Value::Int)
				.or_else(|| number.as_f64().map(Value::Float))
				.unwrap_or(Value::Null)
		}
		serde_json::Value::String(text) => Value::Text(text.clone()),
		other => Value::Text(other.to_string()),
	}
}

struct Parser<'a> {
	tokens: &'a [ExprToken],
	pos: usize,
}

impl Parser<'_> {
	fn peek(&self) -> Option<&ExprToken> {
		self.tokens.get(self.pos)
	}

	fn next(&mut self) -> Option<&ExprToken> {
		let token = self.tokens.get(self.pos);
		if token.is_some() {
			self.pos += 1;
		}
		token
	}

	/// Precedence-climbing evaluation: binds operators at or above
	/// `min_prec`, recursing one level tighter for the right-hand side so
	/// all binaries associate left.
	fn parse_expression(&mut self, min_prec: u8) -> EvalOutcome<Value> {
		let mut lhs = self.parse_primary()?;

		while let Some(ExprToken::Op(op)) = self.peek() {
			let op = *op;
			if op.precedence() < min_prec {
				break;
			}
			self.pos += 1;
			let rhs = self.parse_expression(op.precedence() + 1)?;
			lhs = op.apply(&lhs, &rhs)?;
		}

		Ok(lhs)
	}

	fn parse_primary(&mut self) -> EvalOutcome<Value> {
		let at = self.pos;
		match self.next() {
			Some(ExprToken::Literal(value)) => Ok(value.clone()),
			Some(ExprToken::Not) => {
				let operand = self.parse_primary()?;
				Ok(Value::Bool(!operand.to_bool()?))
			}
			Some(ExprToken::Op(Operator::Sub)) => {
				let operand = self.parse_primary()?;
				match operand {
					Value::Int(value) => Ok(Value::Int(-value)),
					Value::Float(value) => Ok(Value::Float(-value)),
					other => Err(EvalFault::NotInteger(other.render_text())),
				}
			}
			Some(ExprToken::Open) => {
				let value = self.parse_expression(0)?;
				match self.next() {
					Some(ExprToken::Close) => Ok(value),
					_ => Err(EvalFault::UnbalancedGroup),
				}
			}
			Some(_) => Err(EvalFault::UnexpectedToken(at)),
			None => Err(EvalFault::UnexpectedEnd),
		}
	}
}

/// Evaluate an expression payload to a value, or a fault.
pub fn evaluate(
	payload: &[u8],
	dialect: &ExprDialect,
	variables: &VariableCollection,
) -> EvalOutcome<Value> {
	let tokens = tokenize(payload, dialect, variables)?;
	if tokens.is_empty() {
		return Err(EvalFault::UnexpectedEnd);
	}

	let mut parser = Parser {
		tokens: &tokens,
		pos: 0,
	};
	let value = parser.parse_expression(0)?;
	if parser.pos < tokens.len() {
		return Err(EvalFault::UnexpectedToken(parser.pos));
	}
	Ok(value)
}

/// Evaluate a conditional guard to a boolean. Any fault is reported as a
/// diagnostic and treated as `false`; it never aborts the run.
pub fn evaluate_condition(
	payload: &[u8],
	dialect: &ExprDialect,
	variables: &VariableCollection,
) -> bool {
	match evaluate(payload, dialect, variables).and_then(|value| value.to_bool()) {
		Ok(value) => value,
		Err(fault) => {
			warn!(
				%fault,
				payload = %String::from_utf8_lossy(payload),
				"conditional guard faulted; treating as false"
			);
			false
		}
	}
}
