//! Process-wide map of loaded assemblies keyed by MVID hex string, with a
//! default-selection policy and simple lifecycle operations.
//!
//! Per the concurrency model: the map itself has one writer, many readers; each
//! entry is its own `RwLock` so a reader traversing one model never blocks a writer
//! mutating a different one, and mutating one model never blocks reads of another.
//! `InstanceRegistry` is meant to be owned by the composition root and handed out by
//! reference, not reached for as a process-global, so tests can build an isolated one.

use std::sync::{Arc, RwLock};

use fxhash::FxHashMap;

use crate::model::AssemblyModel;

/// A loaded assembly, shared so multiple callers can hold a handle to the same
/// entry while the registry's own map lock is released quickly.
pub type Handle = Arc<RwLock<AssemblyModel>>;

#[derive(Default)]
pub struct InstanceRegistry {
	entries: RwLock<FxHashMap<String, Handle>>,
	default: RwLock<Option<String>>,
}

impl InstanceRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers `model` under `key` (the lowercase MVID hex string), overwriting
	/// any previous entry with the same key. The first assembly ever registered
	/// becomes the default if none has been set yet.
	pub fn register(&self, key: impl Into<String>, model: AssemblyModel) -> Handle {
		let key = key.into();
		let handle: Handle = Arc::new(RwLock::new(model));

		let mut entries = self.entries.write().unwrap();
		entries.insert(key.clone(), handle.clone());
		drop(entries);

		let mut default = self.default.write().unwrap();
		if default.is_none() {
			*default = Some(key);
		}

		handle
	}

	pub fn get(&self, key: &str) -> Option<Handle> {
		self.entries.read().unwrap().get(key).cloned()
	}

	/// "Get with null key" behavior: the default entry, or the first one in
	/// iteration order if no default has been set. Analysis tools that omit the
	/// module key when context is unambiguous rely on this fallback.
	pub fn get_default(&self) -> Option<Handle> {
		let entries = self.entries.read().unwrap();
		let default = self.default.read().unwrap();
		match default.as_deref() {
			Some(key) => entries.get(key).cloned(),
			None => entries.values().next().cloned(),
		}
	}

	pub fn get_or_default(&self, key: Option<&str>) -> Option<Handle> {
		match key {
			Some(key) => self.get(key),
			None => self.get_default(),
		}
	}

	pub fn list(&self) -> Vec<String> {
		self.entries.read().unwrap().keys().cloned().collect()
	}

	/// `false` iff `key` is not a registered entry; the default pointer is left
	/// untouched in that case.
	pub fn set_default(&self, key: &str) -> bool {
		let entries = self.entries.read().unwrap();
		if !entries.contains_key(key) {
			return false;
		}
		*self.default.write().unwrap() = Some(key.to_string());
		true
	}

	/// Drops the entry and, if it was the default, clears the default pointer
	/// (never leaving it dangling on a key no longer present).
	pub fn unload(&self, key: &str) -> bool {
		let removed = self.entries.write().unwrap().remove(key).is_some();
		if removed {
			let mut default = self.default.write().unwrap();
			if default.as_deref() == Some(key) {
				*default = None;
			}
		}
		removed
	}

	pub fn count(&self) -> usize {
		self.entries.read().unwrap().len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::identifiers::Mvid;
	use crate::model::{AssemblyVersion, Module};

	fn sample(name: &str, mvid_byte: u8) -> AssemblyModel {
		AssemblyModel {
			name: name.to_string(),
			full_name: name.to_string(),
			version: AssemblyVersion { major: 1, minor: 0, build: 0, revision: 0 },
			mvid: Mvid([mvid_byte; 16]),
			target_framework_moniker: None,
			module: Module { name: name.to_string(), types: Vec::new(), assembly_refs: Vec::new(), resources: Vec::new() },
		}
	}

	#[test]
	fn first_registration_becomes_default() {
		let registry = InstanceRegistry::new();
		registry.register("a", sample("A", 1));
		assert!(registry.get_default().is_some());
	}

	#[test]
	fn get_default_falls_back_to_first_when_unset() {
		let registry = InstanceRegistry::new();
		registry.register("a", sample("A", 1));
		registry.unload("a");
		registry.register("b", sample("B", 2));
		// default pointer was cleared by unload, but "b" is now the only entry.
		assert!(registry.get_or_default(None).is_some());
	}

	#[test]
	fn set_default_fails_on_unknown_key() {
		let registry = InstanceRegistry::new();
		registry.register("a", sample("A", 1));
		assert!(!registry.set_default("nope"));
	}

	#[test]
	fn unload_clears_default_pointer_when_it_was_default() {
		let registry = InstanceRegistry::new();
		registry.register("a", sample("A", 1));
		registry.register("b", sample("B", 2));
		registry.set_default("a");
		registry.unload("a");
		// No default key remains pointing at a dead entry; fallback still works.
		let handle = registry.get_default().unwrap();
		assert_eq!(handle.read().unwrap().name, "B");
	}

	#[test]
	fn count_reflects_registered_entries() {
		let registry = InstanceRegistry::new();
		assert_eq!(registry.count(), 0);
		registry.register("a", sample("A", 1));
		registry.register("b", sample("B", 2));
		assert_eq!(registry.count(), 2);
	}

	#[test]
	fn list_contains_every_key() {
		let registry = InstanceRegistry::new();
		registry.register("a", sample("A", 1));
		registry.register("b", sample("B", 2));
		let mut keys = registry.list();
		keys.sort();
		assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
	}
}
