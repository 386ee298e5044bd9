//! The session index table: 32-bit identifiers drawn from the
//! system's cryptographic RNG, mapping to the peer and either the
//! pending handshake or the established keypair behind them.

use std::collections::hash_map;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::peer::Peer;
use crate::session::Keypair;

#[derive(Clone)]
pub enum Kind {
	/// A handshake in flight under this index.
	Handshake,
	/// An established session.
	Keypair(Arc<Keypair>),
}

#[derive(Clone)]
pub struct Entry {
	pub peer: Arc<Peer>,
	pub kind: Kind,
}

#[derive(Default)]
pub struct IndexTable {
	map: RwLock<HashMap<u32, Entry>>,
}

impl IndexTable {
	pub fn new() -> Self {
		Self::default()
	}

	/// Allocate a fresh random index bound to `peer`'s handshake,
	/// retrying on collision.
	pub fn new_index(&self, peer: &Arc<Peer>) -> u32 {
		let mut map = self.map.write();

		loop {
			let id = OsRng.next_u32();

			if let hash_map::Entry::Vacant(slot) = map.entry(id) {
				slot.insert(Entry { peer: Arc::clone(peer), kind: Kind::Handshake });
				return id;
			}
		}
	}

	/// Re-bind `id` from its handshake to the keypair the handshake
	/// produced. Unknown ids are ignored.
	pub fn swap_keypair(&self, id: u32, keypair: Arc<Keypair>) {
		if let Some(entry) = self.map.write().get_mut(&id) {
			entry.kind = Kind::Keypair(keypair);
		}
	}

	pub fn lookup(&self, id: u32) -> Option<Entry> {
		self.map.read().get(&id).cloned()
	}

	/// Idempotent; removing an unknown id is fine.
	pub fn remove(&self, id: u32) {
		self.map.write().remove(&id);
	}

	pub fn len(&self) -> usize {
		self.map.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.map.read().is_empty()
	}
}
