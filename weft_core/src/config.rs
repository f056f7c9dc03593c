use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use serde::Deserialize;

use crate::WeftError;
use crate::WeftResult;
use crate::expr::DialectKind;
use crate::variables::FlagTable;
use crate::variables::VariableCollection;
use crate::variables::VariableValue;

/// Default working buffer size for a run, in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Default flush threshold: how much pending output is retained for
/// backward seeks before older bytes spill to the writer.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 1024;

/// Supported run profile locations in discovery order (highest precedence
/// first).
pub const PROFILE_FILE_CANDIDATES: [&str; 3] = ["weft.toml", ".weft.toml", ".config/weft.toml"];

/// Run-wide configuration assembled by the surrounding tool: the initial
/// variable environment and flag table, the byte sequences treated as
/// whitespace and line endings, the expression dialect for conditional
/// guards, and an optional cancellation handle.
///
/// Built once per run; the tries derived from it are immutable for the
/// whole run.
#[derive(Debug)]
pub struct EngineConfig {
	pub variables: VariableCollection,
	pub flags: FlagTable,
	/// Byte sequences the seek primitives treat as whitespace.
	pub whitespace_tokens: Vec<Vec<u8>>,
	/// Byte sequences recognized as line endings, longest first so that
	/// `\r\n` wins over `\r`.
	pub line_end_tokens: Vec<Vec<u8>>,
	pub dialect: DialectKind,
	/// Cooperative cancellation, checked at every refill and dispatch
	/// iteration of the driver loop.
	pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			variables: VariableCollection::new(),
			flags: FlagTable::new(),
			whitespace_tokens: vec![b" ".to_vec(), b"\t".to_vec()],
			line_end_tokens: vec![b"\r\n".to_vec(), b"\n".to_vec()],
			dialect: DialectKind::default(),
			cancel: None,
		}
	}
}

/// A run profile loaded from a `weft.toml` file.
///
/// ```toml
/// dialect = "c-style"
///
/// [variables]
/// name = "my-project"
/// year = 2026
///
/// [flags]
/// flags = false
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct RunProfile {
	/// Initial variable bindings, keyed by variable name.
	#[serde(default)]
	pub variables: BTreeMap<String, toml::Value>,
	/// Initial flag table contents.
	#[serde(default)]
	pub flags: BTreeMap<String, bool>,
	/// The expression dialect for conditional guards.
	#[serde(default)]
	pub dialect: DialectKind,
}

impl RunProfile {
	/// Resolve the profile path from known discovery candidates.
	#[must_use]
	pub fn resolve_path(root: &Path) -> Option<PathBuf> {
		PROFILE_FILE_CANDIDATES
			.iter()
			.map(|candidate| root.join(candidate))
			.find(|path| path.is_file())
	}

	/// Load the profile from the first discovered candidate at `root`.
	/// Returns `None` when no profile file exists.
	pub fn load(root: &Path) -> WeftResult<Option<RunProfile>> {
		let Some(profile_path) = Self::resolve_path(root) else {
			return Ok(None);
		};

		let content = std::fs::read_to_string(&profile_path)?;
		let profile: RunProfile =
			toml::from_str(&content).map_err(|e| WeftError::ProfileParse(e.to_string()))?;

		Ok(Some(profile))
	}

	/// Turn the profile into an engine configuration with default
	/// whitespace and line-ending sets.
	pub fn into_config(self) -> EngineConfig {
		let mut config = EngineConfig {
			dialect: self.dialect,
			..EngineConfig::default()
		};

		for (key, value) in self.variables {
			config
				.variables
				.set(key, VariableValue::Bound(toml_to_json(value)));
		}
		config.flags = self.flags.into_iter().collect();

		config
	}
}

/// Convert a `toml::Value` binding to its `serde_json::Value` form.
fn toml_to_json(value: toml::Value) -> serde_json::Value {
	match value {
		toml::Value::String(text) => serde_json::Value::String(text),
		toml::Value::Integer(number) => serde_json::Value::Number(number.into()),
		toml::Value::Float(number) => {
			serde_json::Number::from_f64(number)
				.map_or(serde_json::Value::Null, serde_json::Value::Number)
		}
		toml::Value::Boolean(flag) => serde_json::Value::Bool(flag),
		toml::Value::Datetime(datetime) => serde_json::Value::String(datetime.to_string()),
		toml::Value::Array(items) => {
			serde_json::Value::Array(items.into_iter().map(toml_to_json).collect())
		}
		toml::Value::Table(table) => {
			serde_json::Value::Object(
				table
					.into_iter()
					.map(|(key, value)| (key, toml_to_json(value)))
					.collect(),
			)
		}
	}
}
