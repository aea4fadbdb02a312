//! Pure, stateless range/batch extraction over any finite ordered sequence. Nothing
//! here allocates more than the returned slice/vec requires and nothing panics on
//! an out-of-range offset — an offset past the end of the sequence is not an error,
//! it is an empty result at the offset the caller asked for.

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SliceError {
	#[error("offset must not be negative")]
	InvalidOffset,
	#[error("count must not be negative")]
	InvalidCount,
}

/// Items `[offset, offset + count)`, clipped to the sequence's length. Never panics
/// on overshoot: an offset beyond `seq.len()` yields an empty slice.
pub fn slice<T>(seq: &[T], offset: i64, count: i64) -> Result<&[T], SliceError> {
	if offset < 0 {
		return Err(SliceError::InvalidOffset);
	}
	if count < 0 {
		return Err(SliceError::InvalidCount);
	}

	let len = seq.len() as i64;
	let start = offset.min(len) as usize;
	let end = (offset + count).clamp(offset, len) as usize;
	Ok(&seq[start..end])
}

/// Items `[start, end)` with an exclusive upper bound, clipped the same way as
/// [`slice`].
pub fn slice_range<T>(seq: &[T], start: i64, end: i64) -> Result<&[T], SliceError> {
	if start < 0 {
		return Err(SliceError::InvalidOffset);
	}
	if end < start {
		return Err(SliceError::InvalidCount);
	}
	slice(seq, start, end - start)
}

/// Splits `seq` into consecutive, non-overlapping chunks of `size` (the last
/// possibly short). `size == 0` yields no chunks.
pub fn batch<T>(seq: &[T], size: usize) -> impl Iterator<Item = &[T]> {
	seq.chunks(size.max(1)).take(if size == 0 { 0 } else { usize::MAX })
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn slice_clips_to_length() {
		let seq: Vec<i32> = (1..=100).collect();
		assert_eq!(slice(&seq, 95, 20).unwrap(), &seq[95..100]);
	}

	#[test]
	fn slice_past_end_is_empty_not_error() {
		let seq = [1, 2, 3];
		assert_eq!(slice(&seq, 10, 5).unwrap(), &[] as &[i32]);
	}

	#[test]
	fn slice_rejects_negative_offset_and_count() {
		let seq = [1, 2, 3];
		assert_eq!(slice(&seq, -1, 1), Err(SliceError::InvalidOffset));
		assert_eq!(slice(&seq, 0, -1), Err(SliceError::InvalidCount));
	}

	#[test]
	fn slice_len_matches_universal_property() {
		let seq: Vec<i32> = (1..=100).collect();
		for (offset, count) in [(0i64, 20i64), (90, 20), (100, 1), (5, 1000)] {
			let result = slice(&seq, offset, count).unwrap();
			let expected = count.min((seq.len() as i64 - offset).max(0)) as usize;
			assert_eq!(result.len(), expected);
		}
	}

	#[test]
	fn slice_range_uses_exclusive_end() {
		let seq = [10, 20, 30, 40];
		assert_eq!(slice_range(&seq, 1, 3).unwrap(), &[20, 30]);
	}

	#[test]
	fn batch_yields_short_last_chunk() {
		let seq = [1, 2, 3, 4, 5];
		let batches: Vec<_> = batch(&seq, 2).collect();
		assert_eq!(batches, vec![&[1, 2][..], &[3, 4][..], &[5][..]]);
	}
}
