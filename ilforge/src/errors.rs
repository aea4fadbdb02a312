//! The boundary error taxonomy shared by every fallible operation in the core.
//!
//! Nothing in this crate panics or unwinds on an expected failure. Every component
//! returns a `Result` whose error carries one of the [`ErrorCode`] string codes plus
//! a human-readable message, per the error handling design: recoverable failures
//! (`TypeNotFound`, `CursorExpired`, `InvalidLimit`, ...) let the caller retry with a
//! different input; fatal-to-operation failures (`InvalidFormat`, `AccessDenied`)
//! leave the registry and every other loaded model usable.

use std::fmt::{Display, Formatter};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorCode {
	NoAssemblyLoaded,
	AssemblyNotFound,
	InstanceNotFound,
	TypeNotFound,
	MethodNotFound,
	DecompileFailed,
	SearchFailed,
	XrefFailed,
	CallGraphFailed,
	InvalidLimit,
	InvalidDirection,
	InvalidParameter,
	InvalidRequest,
	CompilationError,
	CursorExpired,
	CursorInvalid,
	InvalidFormat,
	DependencyNotFound,
	AccessDenied,
}

impl ErrorCode {
	/// Recoverable errors mean the caller chose a bad input and may retry with a
	/// different one; fatal-to-operation errors mean this particular operation
	/// cannot succeed, though the process and every other loaded model remain fine.
	pub fn is_recoverable(self) -> bool {
		!matches!(self, ErrorCode::InvalidFormat | ErrorCode::AccessDenied)
	}

	pub fn as_str(self) -> &'static str {
		match self {
			ErrorCode::NoAssemblyLoaded => "NO_ASSEMBLY_LOADED",
			ErrorCode::AssemblyNotFound => "ASSEMBLY_NOT_FOUND",
			ErrorCode::InstanceNotFound => "INSTANCE_NOT_FOUND",
			ErrorCode::TypeNotFound => "TYPE_NOT_FOUND",
			ErrorCode::MethodNotFound => "METHOD_NOT_FOUND",
			ErrorCode::DecompileFailed => "DECOMPILE_FAILED",
			ErrorCode::SearchFailed => "SEARCH_FAILED",
			ErrorCode::XrefFailed => "XREF_FAILED",
			ErrorCode::CallGraphFailed => "CALLGRAPH_FAILED",
			ErrorCode::InvalidLimit => "INVALID_LIMIT",
			ErrorCode::InvalidDirection => "INVALID_DIRECTION",
			ErrorCode::InvalidParameter => "INVALID_PARAMETER",
			ErrorCode::InvalidRequest => "INVALID_REQUEST",
			ErrorCode::CompilationError => "COMPILATION_ERROR",
			ErrorCode::CursorExpired => "CURSOR_EXPIRED",
			ErrorCode::CursorInvalid => "CURSOR_INVALID",
			ErrorCode::InvalidFormat => "INVALID_FORMAT",
			ErrorCode::DependencyNotFound => "DEPENDENCY_NOT_FOUND",
			ErrorCode::AccessDenied => "ACCESS_DENIED",
		}
	}
}

impl Display for ErrorCode {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A boundary-level error: a stable code plus a message meant for a human, with an
/// optional chained cause. Never raised as a panic; always returned as a `Result`.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct CoreError {
	pub code: ErrorCode,
	pub message: String,
	#[source]
	pub cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl CoreError {
	pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
		Self { code, message: message.into(), cause: None }
	}

	pub fn with_cause(code: ErrorCode, message: impl Into<String>, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
		Self { code, message: message.into(), cause: Some(Box::new(cause)) }
	}
}

pub type CoreResult<T> = Result<T, CoreError>;
