//! Transport sessions: a [`Keypair`] is the pair of AEAD contexts a
//! completed handshake yields, shared between the peer's slots, the
//! index table and in-flight pipeline elements. The three [`Slots`]
//! implement the previous/current/next rotation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{ChaCha20Poly1305 as Aead, KeyInit, Nonce, Tag};
use log::warn;
use parking_lot::Mutex;
use utils::error::*;

use crate::noise::SessionKeys;
use crate::timers::{KEEPALIVE_TIMEOUT, REJECT_AFTER_TIME, REKEY_AFTER_TIME, REKEY_TIMEOUT};
use crate::window::Window;

pub const REKEY_AFTER_MESSAGES: u64 = u64::MAX - (1 << 16);
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 4);

/// Transport nonces are 32 zero bits followed by the little-endian
/// counter.
fn nonce(counter: u64) -> Nonce {
	let mut nonce = Nonce::default();
	nonce[4..].copy_from_slice(&counter.to_le_bytes());
	nonce
}

pub struct Keypair {
	send: Aead,
	recv: Aead,
	send_counter: AtomicU64,
	/// Serialized by the sequential receiver.
	pub replay: Mutex<Window>,
	pub birth: Instant,
	pub is_initiator: bool,
	pub local_index: u32,
	pub remote_index: u32,
}

impl Keypair {
	pub fn new(keys: &SessionKeys, now: Instant) -> Self {
		Self {
			send: Aead::new(&keys.send),
			recv: Aead::new(&keys.recv),
			send_counter: AtomicU64::new(0),
			replay: Mutex::new(Window::new()),
			birth: now,
			is_initiator: keys.is_initiator,
			local_index: keys.local_index,
			remote_index: keys.remote_index,
		}
	}

	/// Claim the next send counter; strictly monotonic, never reused.
	/// `None` once the hard message limit is reached.
	pub fn next_counter(&self) -> Option<u64> {
		let n = self.send_counter.fetch_add(1, Ordering::Relaxed);
		(n < REJECT_AFTER_MESSAGES).then_some(n)
	}

	pub fn counters_used(&self) -> u64 {
		self.send_counter.load(Ordering::Relaxed)
	}

	pub fn seal(&self, counter: u64, data: &mut [u8]) -> [u8; 16] {
		let tag = self
			.send
			.encrypt_in_place_detached(&nonce(counter), &[], data)
			.expect("sealing cannot fail");
		tag.into()
	}

	pub fn open(&self, counter: u64, data: &mut [u8], tag: &[u8]) -> Result {
		self.recv
			.decrypt_in_place_detached(&nonce(counter), &[], data, Tag::from_slice(tag))
			.map_err(|_| warn!("Transport payload failed to authenticate"))
	}

	/// Hard send limit: never seal under a keypair past this.
	pub fn send_expired(&self, now: Instant) -> bool {
		now.saturating_duration_since(self.birth) >= REJECT_AFTER_TIME || self.counters_used() >= REJECT_AFTER_MESSAGES
	}

	/// Hard receive limit.
	pub fn recv_expired(&self, now: Instant) -> bool {
		now.saturating_duration_since(self.birth) >= REJECT_AFTER_TIME
	}

	/// Soft limit: the holder should run a fresh handshake before
	/// continuing to send. Only the original initiator rekeys on age
	/// alone, so the two sides do not race.
	pub fn needs_rekey(&self, now: Instant) -> bool {
		self.counters_used() >= REKEY_AFTER_MESSAGES
			|| (self.is_initiator && now.saturating_duration_since(self.birth) >= REKEY_AFTER_TIME)
	}

	/// Receive-side urgency: the session will hit the hard limit
	/// before a routine rekey would run.
	pub fn expiring_soon(&self, now: Instant) -> bool {
		now.saturating_duration_since(self.birth) >= REJECT_AFTER_TIME - KEEPALIVE_TIMEOUT - REKEY_TIMEOUT
	}

	#[cfg(test)]
	pub(crate) fn force_send_counter(&self, n: u64) {
		self.send_counter.store(n, Ordering::Relaxed);
	}
}

/// The per-peer keypair rotation. Callers hold the peer's keypair
/// lock; displaced keypairs are handed back so their indices can be
/// unregistered.
#[derive(Default)]
pub struct Slots {
	pub previous: Option<Arc<Keypair>>,
	pub current: Option<Arc<Keypair>>,
	pub next: Option<Arc<Keypair>>,
}

impl Slots {
	/// Install a freshly derived keypair. Consuming the response is
	/// itself authenticated, so the initiator starts sending on the
	/// new keypair at once; the responder parks it in `next` until
	/// the first inbound packet proves the initiator has it too.
	pub fn install(&mut self, keypair: Arc<Keypair>) -> Vec<Arc<Keypair>> {
		let mut displaced = Vec::new();

		if keypair.is_initiator {
			displaced.extend(self.previous.take());
			self.previous = self.current.take();
			self.current = Some(keypair);
		} else {
			displaced.extend(self.next.take());
			self.next = Some(keypair);
		}

		displaced
	}

	/// Rotate after the first authenticated packet arrived on `next`.
	pub fn promote(&mut self) -> Vec<Arc<Keypair>> {
		let mut displaced = Vec::new();

		if let Some(next) = self.next.take() {
			displaced.extend(self.previous.take());
			self.previous = self.current.take();
			self.current = Some(next);
		}

		displaced
	}

	/// Drop all key material, returning every keypair held.
	pub fn clear(&mut self) -> Vec<Arc<Keypair>> {
		[self.previous.take(), self.current.take(), self.next.take()].into_iter().flatten().collect()
	}
}

#[cfg(test)]
mod tests {
	use x25519_dalek::StaticSecret;

	use super::*;
	use crate::noise::{self, Handshake, Identity};
	use crate::packet::{Initiation, Response};

	pub(crate) fn established_pair() -> (Keypair, Keypair) {
		use std::time::SystemTime;

		use zerocopy::FromZeroes;

		let a_id = Identity::new(StaticSecret::random());
		let b_id = Identity::new(StaticSecret::random());
		let mut a = Handshake::new(b_id.public, Some(&a_id));
		let mut b = Handshake::new(a_id.public, Some(&b_id));

		let mut init = Initiation::new_zeroed();
		a.create_initiation(&a_id, 1, SystemTime::now(), &mut init);
		let (hash, chain, _) = noise::open_initiation(&b_id, &mut init).unwrap();
		b.consume_initiation(hash, chain, Instant::now(), &mut init).unwrap();

		let mut resp = Response::new_zeroed();
		let bk = b.create_response(2, &mut resp).unwrap();
		let ak = a.consume_response(&a_id, &mut resp).unwrap();

		let now = Instant::now();
		(Keypair::new(&ak, now), Keypair::new(&bk, now))
	}

	#[test]
	fn transport_roundtrip() {
		let (a, b) = established_pair();

		let mut data = *b"ping! ping! ping";
		let counter = a.next_counter().unwrap();
		let tag = a.seal(counter, &mut data);

		b.open(counter, &mut data, &tag).unwrap();
		assert_eq!(&data, b"ping! ping! ping");

		// And the other direction.
		let mut data = *b"pong............";
		let counter = b.next_counter().unwrap();
		let tag = b.seal(counter, &mut data);
		a.open(counter, &mut data, &tag).unwrap();
		assert_eq!(&data, b"pong............");
	}

	#[test]
	fn counters_are_unique() {
		let (a, _) = established_pair();

		assert_eq!(a.next_counter(), Some(0));
		assert_eq!(a.next_counter(), Some(1));
		assert_eq!(a.next_counter(), Some(2));
	}

	#[test]
	fn tampered_payload_rejected() {
		let (a, b) = established_pair();

		let mut data = [7u8; 64];
		let counter = a.next_counter().unwrap();
		let tag = a.seal(counter, &mut data);

		data[0] ^= 1;
		assert!(b.open(counter, &mut data, &tag).is_err());
	}

	#[test]
	fn aging_limits() {
		let (a, _) = established_pair();
		let now = a.birth;

		assert!(!a.needs_rekey(now));
		a.force_send_counter(REKEY_AFTER_MESSAGES);
		assert!(a.needs_rekey(now), "message count alone forces a rekey");

		a.force_send_counter(REJECT_AFTER_MESSAGES);
		assert!(a.next_counter().is_none(), "the hard limit stops sending");
		assert!(a.send_expired(now));

		// Time expires both directions; only the initiator rekeys on
		// age alone.
		let (b, responder) = established_pair();
		let later = b.birth + REJECT_AFTER_TIME;
		assert!(b.send_expired(later) && b.recv_expired(later));
		assert!(b.needs_rekey(b.birth + REKEY_AFTER_TIME));
		assert!(!responder.needs_rekey(responder.birth + REKEY_AFTER_TIME));
	}

	#[test]
	fn slot_rotation() {
		let (a, b) = established_pair();
		let (a, b) = (Arc::new(a), Arc::new(b));

		let mut slots = Slots::default();

		// Responder side: derived keypairs park in next.
		assert!(slots.install(b.clone()).is_empty());
		assert!(slots.current.is_none());
		assert!(slots.next.is_some());

		assert!(slots.promote().is_empty());
		assert!(slots.current.is_some());
		assert!(slots.next.is_none());

		// Initiator-side keypairs take over current directly.
		assert!(slots.install(a).is_empty());
		assert!(slots.previous.is_some());

		assert_eq!(slots.clear().len(), 2);
		assert!(slots.current.is_none() && slots.previous.is_none() && slots.next.is_none());
	}
}
