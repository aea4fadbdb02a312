use crate::raw::heaps::{BlobIndex, SizeDebugWrapper};
use crate::utilities::read_compressed_u32;
use std::fmt::{Debug, Formatter};
use std::io::Cursor;

#[derive(Copy, Clone)]
pub struct BlobHeap<'l> {
	data: &'l [u8],
}

impl<'l> From<&'l [u8]> for BlobHeap<'l> {
	fn from(data: &'l [u8]) -> Self {
		Self { data }
	}
}

impl<'l> BlobHeap<'l> {
	/// Resolves a blob index to its ECMA-335 §II.24.2.4 compressed-length-prefixed
	/// bytes, with the length prefix itself stripped off.
	pub fn get(&self, idx: BlobIndex) -> Option<&'l [u8]> {
		let slice = self.data.get(idx.0..)?;
		let mut cursor = Cursor::new(slice);
		let len = read_compressed_u32(&mut cursor).ok()? as usize;
		let start = cursor.position() as usize;
		slice.get(start..start + len)
	}
}

impl Debug for BlobHeap<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut dbg = f.debug_struct("BlobHeap");
		dbg.field("data", &SizeDebugWrapper(self.data.len()));
		dbg.finish()
	}
}
