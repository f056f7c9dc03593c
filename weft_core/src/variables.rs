use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use derive_more::Deref;
use derive_more::DerefMut;

/// A value bound into the variable environment.
///
/// Bound values come from configuration (the run profile, or whatever the
/// surrounding tool injects). Computed values are evaluated lazily on each
/// substitution, for things like the current date or a fresh identifier.
#[derive(Clone)]
pub enum VariableValue {
	Bound(serde_json::Value),
	Computed(Rc<dyn Fn() -> String>),
}

impl VariableValue {
	pub fn text(value: impl Into<String>) -> Self {
		Self::Bound(serde_json::Value::String(value.into()))
	}

	pub fn computed(produce: impl Fn() -> String + 'static) -> Self {
		Self::Computed(Rc::new(produce))
	}

	/// The string form written to output on substitution.
	pub fn render(&self) -> String {
		match self {
			Self::Bound(serde_json::Value::String(text)) => text.clone(),
			Self::Bound(value) => value.to_string(),
			Self::Computed(produce) => produce(),
		}
	}
}

impl fmt::Debug for VariableValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Bound(value) => f.debug_tuple("Bound").field(value).finish(),
			Self::Computed(_) => f.debug_tuple("Computed").field(&"<lazy>").finish(),
		}
	}
}

/// Hook invoked with the key of a variable that was read or changed.
pub type VariableHook = Rc<dyn Fn(&str)>;

/// An ordered key to value mapping with parent chaining.
///
/// Lookups fall through to the parent scope when a key is absent locally,
/// so a per-file environment can override a run-wide one without copying
/// it. Read and change hooks fire on the collection they were registered
/// on.
#[derive(Default)]
pub struct VariableCollection {
	values: BTreeMap<String, VariableValue>,
	parent: Option<Rc<VariableCollection>>,
	read_hooks: Vec<VariableHook>,
	change_hooks: Vec<VariableHook>,
}

impl VariableCollection {
	pub fn new() -> Self {
		Self::default()
	}

	/// A child scope whose lookups fall through to `parent`.
	pub fn with_parent(parent: Rc<VariableCollection>) -> Self {
		Self {
			parent: Some(parent),
			..Self::default()
		}
	}

	/// Set a variable in this scope, firing change hooks.
	pub fn set(&mut self, key: impl Into<String>, value: VariableValue) {
		let key = key.into();
		for hook in &self.change_hooks {
			hook(&key);
		}
		self.values.insert(key, value);
	}

	/// Look up a variable, falling through to the parent chain. Fires this
	/// collection's read hooks whether or not the key resolves.
	pub fn get(&self, key: &str) -> Option<&VariableValue> {
		for hook in &self.read_hooks {
			hook(key);
		}
		self.lookup(key)
	}

	fn lookup(&self, key: &str) -> Option<&VariableValue> {
		if let Some(value) = self.values.get(key) {
			return Some(value);
		}
		self.parent.as_deref().and_then(|parent| parent.lookup(key))
	}

	/// The rendered string form of a variable, if present anywhere in the
	/// scope chain.
	pub fn render(&self, key: &str) -> Option<String> {
		self.get(key).map(VariableValue::render)
	}

	pub fn contains(&self, key: &str) -> bool {
		self.lookup(key).is_some()
	}

	/// Keys defined directly in this scope, in order.
	pub fn local_keys(&self) -> impl Iterator<Item = &str> {
		self.values.keys().map(String::as_str)
	}

	pub fn on_read(&mut self, hook: impl Fn(&str) + 'static) {
		self.read_hooks.push(Rc::new(hook));
	}

	pub fn on_change(&mut self, hook: impl Fn(&str) + 'static) {
		self.change_hooks.push(Rc::new(hook));
	}
}

impl fmt::Debug for VariableCollection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("VariableCollection")
			.field("values", &self.values)
			.field("parent", &self.parent)
			.finish_non_exhaustive()
	}
}

impl FromIterator<(String, VariableValue)> for VariableCollection {
	fn from_iter<I: IntoIterator<Item = (String, VariableValue)>>(iter: I) -> Self {
		Self {
			values: iter.into_iter().collect(),
			..Self::default()
		}
	}
}

/// Run-scoped name to boolean map consulted by the flag operation and the
/// conditional operation.
#[derive(Debug, Default, Deref, DerefMut)]
pub struct FlagTable(BTreeMap<String, bool>);

impl FlagTable {
	/// The well-known flag controlling whether flag tokens are echoed to
	/// output in addition to updating the table.
	pub const ECHO_FLAGS: &'static str = "flags";

	pub fn new() -> Self {
		Self::default()
	}

	/// The flag's value, false when unset.
	pub fn is_set(&self, name: &str) -> bool {
		self.0.get(name).copied().unwrap_or(false)
	}
}

impl FromIterator<(String, bool)> for FlagTable {
	fn from_iter<I: IntoIterator<Item = (String, bool)>>(iter: I) -> Self {
		Self(iter.into_iter().collect())
	}
}
