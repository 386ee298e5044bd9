//! Fixed-size message buffers recycled through a free list. Buffers
//! travel through the pipeline inside work elements and find their
//! own way home when the last holder drops them.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// Largest datagram the pipeline handles.
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// Free-list cap; buffers beyond it simply deallocate.
const POOL_LIMIT: usize = 1024;

type FreeList = Arc<Mutex<Vec<Vec<u8>>>>;

#[derive(Clone)]
pub struct Pool {
	free: FreeList,
}

impl Pool {
	pub fn new() -> Self {
		Self { free: Arc::new(Mutex::new(Vec::new())) }
	}

	/// An empty buffer with the full message capacity reserved.
	pub fn get(&self) -> Buf {
		let vec = self.free.lock().pop().unwrap_or_else(|| Vec::with_capacity(MAX_MESSAGE_SIZE));
		Buf { vec, home: Arc::clone(&self.free) }
	}
}

impl Default for Pool {
	fn default() -> Self {
		Self::new()
	}
}

/// A pooled message buffer; dereferences to its `Vec<u8>`.
pub struct Buf {
	vec: Vec<u8>,
	home: FreeList,
}

impl Deref for Buf {
	type Target = Vec<u8>;

	fn deref(&self) -> &Vec<u8> {
		&self.vec
	}
}

impl DerefMut for Buf {
	fn deref_mut(&mut self) -> &mut Vec<u8> {
		&mut self.vec
	}
}

impl Drop for Buf {
	fn drop(&mut self) {
		let mut free = self.home.lock();

		if free.len() < POOL_LIMIT {
			self.vec.clear();
			free.push(core::mem::take(&mut self.vec));
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn buffers_recycle() {
		let pool = Pool::new();

		let mut buf = pool.get();
		buf.extend_from_slice(b"hello");
		let ptr = buf.as_ptr();
		drop(buf);

		let buf = pool.get();
		assert_eq!(buf.len(), 0);
		assert_eq!(buf.as_ptr(), ptr);
	}
}
