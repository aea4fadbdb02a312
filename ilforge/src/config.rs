//! Configuration the core reads. Everything else — the REST surface, auth, rate
//! limiting, the compiler frontend — owns its own configuration and is out of scope
//! here; see the purpose & scope notes in `SPEC_FULL.md`.

use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 500;
pub const DEFAULT_CURSOR_TTL_SECONDS: u64 = 3600;

/// Environment variable consulted, with platform fallbacks, for the shared-framework
/// directory the resolver searches at its first tier. Mirrors the variable the CLR
/// host itself honors so a sideloaded runtime is found the same way.
pub const RUNTIME_ROOT_ENV_VAR: &str = "DOTNET_ROOT";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
	/// Extra directories the resolver searches (tier 2), depth-first, after the
	/// built-in runtime search locations have failed.
	pub resolver_search_paths: Vec<std::path::PathBuf>,
	/// Recursion depth limit applied to each user search path.
	pub resolver_max_depth: usize,
	pub default_page_size: usize,
	pub max_page_size: usize,
	pub cursor_ttl_seconds: u64,
}

impl Default for CoreConfig {
	fn default() -> Self {
		Self {
			resolver_search_paths: Vec::new(),
			resolver_max_depth: 3,
			default_page_size: DEFAULT_PAGE_SIZE,
			max_page_size: MAX_PAGE_SIZE,
			cursor_ttl_seconds: DEFAULT_CURSOR_TTL_SECONDS,
		}
	}
}

impl CoreConfig {
	/// Clamps a caller-supplied page size against this configuration's bounds.
	/// `None`, zero and negative values (already coerced to `0` by the caller)
	/// fall back to the default; anything above the cap is clamped down to it.
	pub fn clamp_page_size(&self, requested: Option<usize>) -> usize {
		match requested {
			None | Some(0) => self.default_page_size,
			Some(n) => n.min(self.max_page_size),
		}
	}
}
