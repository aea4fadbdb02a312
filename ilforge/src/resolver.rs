//! Resolves a symbolic assembly-reference name (e.g. `System.Private.CoreLib`) to a
//! loaded image, under a three-level strategy: built-in runtime search locations,
//! then caller-supplied search paths, then a negative cache so repeated misses
//! short-circuit instead of re-walking the filesystem for a bounded time.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fxhash::FxHashMap;
use rust_search::SearchBuilder;

use crate::config::{CoreConfig, RUNTIME_ROOT_ENV_VAR};
use crate::loader;
use crate::model::AssemblyModel;

/// How long a failed lookup is trusted before the search tiers are retried. Bounded
/// rather than permanent so a dependency that later appears on disk (a package
/// restored, a user search path populated after construction) is found on the next
/// attempt instead of being cached as missing forever.
const NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Copy, Clone)]
pub struct ResolverStats {
	pub total_attempts: u64,
	pub cache_hits: u64,
	pub builtin_hits: u64,
	pub user_path_hits: u64,
}

impl ResolverStats {
	/// `(L1 + L2) / total`, `0.0` when nothing has been attempted yet.
	pub fn success_rate(&self) -> f64 {
		match self.total_attempts {
			0 => 0.0,
			total => (self.builtin_hits + self.user_path_hits) as f64 / total as f64,
		}
	}
}

fn builtin_search_directories() -> Vec<PathBuf> {
	let mut dirs = Vec::new();

	if let Ok(root) = std::env::var(RUNTIME_ROOT_ENV_VAR) {
		dirs.push(PathBuf::from(root).join("shared"));
	} else if cfg!(target_os = "windows") {
		if let Ok(program_files) = std::env::var("ProgramFiles") {
			dirs.push(PathBuf::from(program_files).join("dotnet").join("shared"));
		}
	} else {
		dirs.push(PathBuf::from("/usr/share/dotnet/shared"));
		dirs.push(PathBuf::from("/usr/lib/dotnet/shared"));
	}

	if cfg!(target_os = "windows") {
		if let Ok(windir) = std::env::var("windir") {
			dirs.push(PathBuf::from(windir).join("assembly"));
			dirs.push(PathBuf::from(windir).join("Microsoft.NET").join("assembly"));
		}
	}

	if let Some(home) = dirs_home() {
		dirs.push(home.join(".nuget").join("packages"));
	}

	dirs
}

fn dirs_home() -> Option<PathBuf> {
	std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")).map(PathBuf::from)
}

fn find_by_name(root: &Path, depth: usize, name: &str) -> Option<PathBuf> {
	if !root.exists() {
		return None;
	}

	for entry in SearchBuilder::default().location(root).depth(depth).ext("dll").build() {
		let path = Path::new(&entry);
		let stem = path.file_stem().and_then(|s| s.to_str());
		if stem == Some(name) {
			return Some(path.to_path_buf());
		}
	}

	None
}

enum Tier {
	Builtin,
	UserPath,
}

/// Resolves symbolic dependency names to loaded images. Guarded by a single mutex
/// per resolver so caches and statistics stay consistent under concurrent lookups
/// from distinct assembly loads; critical sections are kept short by doing the
/// filesystem walk and the load itself before taking the lock to record the result.
#[derive(Debug)]
pub struct AssemblyResolver {
	user_search_paths: Vec<PathBuf>,
	user_search_depth: usize,
	state: Mutex<ResolverState>,
}

#[derive(Debug, Default)]
struct ResolverState {
	positive: FxHashMap<String, Arc<AssemblyModel>>,
	negative: FxHashMap<String, Instant>,
	stats: ResolverStats,
}

impl AssemblyResolver {
	pub fn new(config: &CoreConfig) -> Self {
		Self {
			user_search_paths: config.resolver_search_paths.clone(),
			user_search_depth: config.resolver_max_depth,
			state: Mutex::new(ResolverState::default()),
		}
	}

	/// Never raises on a missing or unloadable dependency: returns `None` and lets
	/// the caller proceed with a partially-resolvable graph.
	pub fn resolve(&self, name: &str) -> Option<Arc<AssemblyModel>> {
		{
			let mut state = self.state.lock().unwrap();
			state.stats.total_attempts += 1;

			if let Some(model) = state.positive.get(name) {
				state.stats.cache_hits += 1;
				return Some(model.clone());
			}
			if let Some(&cached_at) = state.negative.get(name) {
				if cached_at.elapsed() < NEGATIVE_CACHE_TTL {
					state.stats.cache_hits += 1;
					return None;
				}
			}
		}

		for dir in builtin_search_directories() {
			if let Some(path) = find_by_name(&dir, usize::MAX, name) {
				if let Ok(model) = loader::load(&path) {
					return Some(self.record_hit(name, model, Tier::Builtin));
				}
			}
		}

		for dir in &self.user_search_paths {
			if let Some(path) = find_by_name(dir, self.user_search_depth, name) {
				if let Ok(model) = loader::load(&path) {
					return Some(self.record_hit(name, model, Tier::UserPath));
				}
			}
		}

		// Both tiers failed: the entry is timestamped rather than permanent, so a
		// later positive resolution for the same name (once the TTL lapses and the
		// search tiers run again) replaces it atomically, since `resolve` always
		// checks the positive cache first.
		let mut state = self.state.lock().unwrap();
		state.negative.insert(name.to_string(), Instant::now());
		None
	}

	fn record_hit(&self, name: &str, model: AssemblyModel, tier: Tier) -> Arc<AssemblyModel> {
		let model = Arc::new(model);
		let mut state = self.state.lock().unwrap();
		match tier {
			Tier::Builtin => state.stats.builtin_hits += 1,
			Tier::UserPath => state.stats.user_path_hits += 1,
		}
		state.positive.insert(name.to_string(), model.clone());
		state.negative.remove(name);
		model
	}

	pub fn stats(&self) -> ResolverStats {
		self.state.lock().unwrap().stats
	}

	pub fn clear_cache(&self) {
		let mut state = self.state.lock().unwrap();
		state.positive.clear();
		state.negative.clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::identifiers::Mvid;
	use crate::model::{AssemblyVersion, Module};

	fn sample_model(name: &str) -> AssemblyModel {
		AssemblyModel {
			name: name.into(),
			full_name: name.into(),
			version: AssemblyVersion { major: 1, minor: 0, build: 0, revision: 0 },
			mvid: Mvid([0; 16]),
			target_framework_moniker: None,
			module: Module { name: name.into(), types: Vec::new(), assembly_refs: Vec::new(), resources: Vec::new() },
		}
	}

	#[test]
	fn missing_dependency_resolves_to_none_without_panicking() {
		let config = CoreConfig { resolver_search_paths: vec![PathBuf::from("/nonexistent/path")], ..Default::default() };
		let resolver = AssemblyResolver::new(&config);
		assert!(resolver.resolve("DefinitelyNotThere").is_none());
	}

	#[test]
	fn repeated_miss_hits_the_negative_cache() {
		let config = CoreConfig::default();
		let resolver = AssemblyResolver::new(&config);
		assert!(resolver.resolve("Nope").is_none());
		assert!(resolver.resolve("Nope").is_none());
		let stats = resolver.stats();
		assert_eq!(stats.total_attempts, 2);
		assert_eq!(stats.cache_hits, 1);
	}

	#[test]
	fn negative_cache_entry_is_replaced_by_a_later_positive_resolution() {
		let config = CoreConfig::default();
		let resolver = AssemblyResolver::new(&config);
		assert!(resolver.resolve("LateArrival").is_none());

		// Simulates the dependency becoming resolvable after the first miss (a
		// package restored, a search path populated later) without waiting out
		// the TTL: inserting directly into the positive cache and clearing the
		// negative entry is exactly the post-state a fresh filesystem hit leaves
		// behind in `record_hit`.
		{
			let mut state = resolver.state.lock().unwrap();
			state.negative.remove("LateArrival");
			state.positive.insert("LateArrival".into(), Arc::new(sample_model("LateArrival")));
		}

		let resolved = resolver.resolve("LateArrival");
		assert_eq!(resolved.map(|m| m.name.clone()), Some("LateArrival".to_string()));
	}

	#[test]
	fn success_rate_is_zero_with_no_attempts() {
		assert_eq!(ResolverStats::default().success_rate(), 0.0);
	}

	#[test]
	fn positive_hit_short_circuits_search() {
		let config = CoreConfig::default();
		let resolver = AssemblyResolver::new(&config);
		resolver.state.lock().unwrap().positive.insert("Found".into(), Arc::new(sample_model("Found")));
		let resolved = resolver.resolve("Found");
		assert_eq!(resolved.map(|m| m.name.clone()), Some("Found".to_string()));
		assert_eq!(resolver.stats().cache_hits, 1);
	}
}
