//! Opaque, stateless pagination cursors and the pager that pairs them with the
//! [`crate::slicer`]. A cursor is `base64(json({offset, version, timestamp}))` —
//! clients treat it as an opaque blob; this module is the only code that looks
//! inside one.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::slicer;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CursorData {
	offset: i64,
	version: String,
	timestamp: u64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum CursorDecodeError {
	#[error("cursor is empty")]
	Empty,
	#[error("cursor is not valid base64")]
	InvalidBase64,
	#[error("cursor does not contain valid JSON")]
	InvalidJson,
	#[error("cursor is missing a required field")]
	MissingField,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ExpiryReason {
	VersionMismatch,
	Timeout,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Validation {
	Valid { offset: i64 },
	Invalid(CursorDecodeError),
	Expired(ExpiryReason),
}

const DEFAULT_MAX_AGE_SECONDS: u64 = 3600;

/// `base64(json({offset, version, timestamp}))`, using the standard (non-URL)
/// alphabet with padding, matching the `base64url-of` wording in the identifier
/// grammar loosely enough to decode either: [`decode_cursor`] accepts both.
pub fn encode_cursor(offset: i64, version: &str, timestamp: u64) -> String {
	let data = CursorData { offset, version: version.to_string(), timestamp };
	let json = serde_json::to_vec(&data).expect("CursorData always serializes");
	base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
}

fn decode_cursor_data(cursor: &str) -> Result<CursorData, CursorDecodeError> {
	if cursor.is_empty() {
		return Err(CursorDecodeError::Empty);
	}

	let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
		.decode(cursor)
		.or_else(|_| base64::engine::general_purpose::STANDARD.decode(cursor))
		.map_err(|_| CursorDecodeError::InvalidBase64)?;

	serde_json::from_slice(&bytes).map_err(|_| CursorDecodeError::InvalidJson)
}

pub fn decode_cursor(cursor: &str) -> Result<(i64, String, u64), CursorDecodeError> {
	let data = decode_cursor_data(cursor)?;
	Ok((data.offset, data.version, data.timestamp))
}

/// Validates a cursor against the current version and a maximum age. A structurally
/// broken cursor reports `Invalid`; a well-formed cursor whose version or age no
/// longer matches reports `Expired` with the specific reason.
pub fn validate(cursor: &str, current_version: &str, max_age_seconds: Option<u64>, now_unix: u64) -> Validation {
	let data = match decode_cursor_data(cursor) {
		Ok(data) => data,
		Err(e) => return Validation::Invalid(e),
	};

	if data.version != current_version {
		return Validation::Expired(ExpiryReason::VersionMismatch);
	}

	let max_age = max_age_seconds.unwrap_or(DEFAULT_MAX_AGE_SECONDS);
	if now_unix.saturating_sub(data.timestamp) > max_age {
		return Validation::Expired(ExpiryReason::Timeout);
	}

	Validation::Valid { offset: data.offset }
}

#[derive(Debug, Clone)]
pub struct Page<T> {
	pub items: Vec<T>,
	pub cursor: Option<String>,
	pub has_more: bool,
	pub total_count: usize,
}

/// Materializes one page out of `seq`, starting from the offset encoded in
/// `cursor` (or `0` with no cursor), clamping the requested page size to
/// `[1, max_page_size]` and defaulting `None`/`0`/negative requests to
/// `default_page_size`.
pub fn paginate<T: Clone>(
	seq: &[T],
	cursor: Option<&str>,
	requested_page_size: Option<i64>,
	default_page_size: usize,
	max_page_size: usize,
	version: &str,
	now_unix: u64,
) -> Result<Page<T>, CursorDecodeError> {
	let offset = match cursor {
		None => 0,
		Some(c) => decode_cursor(c)?.0,
	};

	let page_size = match requested_page_size {
		None | Some(0) => default_page_size,
		Some(n) if n < 0 => default_page_size,
		Some(n) => (n as usize).min(max_page_size),
	};

	let items = slicer::slice(seq, offset, page_size as i64).unwrap_or(&[]).to_vec();
	let total_count = seq.len();
	let next_offset = offset + page_size as i64;
	let has_more = next_offset < total_count as i64;

	let cursor = match has_more {
		true => Some(encode_cursor(next_offset, version, now_unix)),
		false => None,
	};

	Ok(Page { items, cursor, has_more, total_count })
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cursor_round_trips() {
		let cursor = encode_cursor(42, "v1", 1_700_000_000);
		let (offset, version, timestamp) = decode_cursor(&cursor).unwrap();
		assert_eq!(offset, 42);
		assert_eq!(version, "v1");
		assert_eq!(timestamp, 1_700_000_000);
	}

	#[test]
	fn empty_cursor_is_rejected() {
		assert_eq!(decode_cursor(""), Err(CursorDecodeError::Empty));
	}

	#[test]
	fn invalid_base64_is_rejected() {
		assert_eq!(decode_cursor("not valid base64!!"), Err(CursorDecodeError::InvalidBase64));
	}

	#[test]
	fn version_mismatch_reports_expired() {
		let cursor = encode_cursor(0, "v0", 1_700_000_000);
		let result = validate(&cursor, "v1", None, 1_700_000_100);
		assert_eq!(result, Validation::Expired(ExpiryReason::VersionMismatch));
	}

	#[test]
	fn timeout_reports_expired() {
		let cursor = encode_cursor(0, "v1", 1_700_000_000);
		let result = validate(&cursor, "v1", Some(60), 1_700_000_200);
		assert_eq!(result, Validation::Expired(ExpiryReason::Timeout));
	}

	#[test]
	fn paginates_100_items_in_pages_of_20() {
		let seq: Vec<i32> = (1..=100).collect();
		let first = paginate(&seq, None, Some(20), 50, 500, "v1", 1_700_000_000).unwrap();
		assert_eq!(first.items, (1..=20).collect::<Vec<_>>());
		assert!(first.has_more);
		assert!(first.cursor.is_some());

		let second = paginate(&seq, first.cursor.as_deref(), Some(20), 50, 500, "v1", 1_700_000_000).unwrap();
		assert_eq!(second.items, (21..=40).collect::<Vec<_>>());
	}

	#[test]
	fn cursor_is_null_exactly_at_end() {
		let seq: Vec<i32> = (1..=10).collect();
		let page = paginate(&seq, None, Some(10), 50, 500, "v1", 0).unwrap();
		assert!(!page.has_more);
		assert!(page.cursor.is_none());
	}

	#[test]
	fn zero_and_negative_page_size_use_default() {
		let seq: Vec<i32> = (1..=100).collect();
		let zero = paginate(&seq, None, Some(0), 50, 500, "v1", 0).unwrap();
		let negative = paginate(&seq, None, Some(-5), 50, 500, "v1", 0).unwrap();
		assert_eq!(zero.items.len(), 50);
		assert_eq!(negative.items.len(), 50);
	}

	#[test]
	fn page_size_is_capped() {
		let seq: Vec<i32> = (1..=1000).collect();
		let page = paginate(&seq, None, Some(10_000), 50, 500, "v1", 0).unwrap();
		assert_eq!(page.items.len(), 500);
	}
}
