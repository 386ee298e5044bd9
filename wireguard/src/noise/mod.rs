//! The Noise-IK handshake state machine, one instance per peer.
//!
//! The device drives it from the handshake workers: an initiation is
//! opened far enough to identify the sender ([`open_initiation`]),
//! then finished against that peer's state. Completion yields a
//! [`SessionKeys`] bundle and returns the state machine to `Zeroed`.

pub mod aead;
mod chain;
mod hash;

use core::mem;
use std::time::{Duration, Instant, SystemTime};

use blake2::digest::consts::U32;
pub use chain::Chain;
use generic_array::GenericArray;
pub use hash::Hash;
use log::warn;
use tai64::Tai64N;
use utils::error::*;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::packet::{Initiation, Response, MSG_INITIATION, MSG_RESPONSE};

pub type A32 = GenericArray<u8, U32>;

/// Least interval between two initiations consumed from one peer.
pub const HANDSHAKE_INITIATION_RATE: Duration = Duration::from_millis(50);

/// The device's long-term identity, plus the transcript prefix every
/// handshake addressed to it starts from.
pub struct Identity {
	pub key: StaticSecret,
	pub public: PublicKey,
	pub hash: Hash,
}

impl Identity {
	pub fn new(key: StaticSecret) -> Self {
		let public = PublicKey::from(&key);

		let mut hash = Hash::default();
		hash.update(public.as_bytes());

		Self { key, public, hash }
	}
}

enum State {
	Zeroed,
	InitiationCreated { hash: Hash, chain: Chain, ephemeral: StaticSecret },
	InitiationConsumed { hash: Hash, chain: Chain, ephemeral: PublicKey },
}

/// Per-peer handshake state. All key material is zeroized when the
/// state is cleared or dropped.
pub struct Handshake {
	state: State,
	pub remote_static: PublicKey,
	/// Transcript prefix for messages addressed to the peer.
	remote_hash: Hash,
	/// DH(local static, remote static); recomputed when the device
	/// identity changes.
	precomputed: [u8; 32],
	preshared: [u8; 32],
	pub local_index: u32,
	pub remote_index: u32,
	last_timestamp: Option<Tai64N>,
	last_initiation_consumption: Option<Instant>,
	pub last_sent_initiation: Option<Instant>,
}

/// Freshly derived transport keys. The initiator's sending key equals
/// the responder's receiving key.
pub struct SessionKeys {
	pub send: A32,
	pub recv: A32,
	pub local_index: u32,
	pub remote_index: u32,
	pub is_initiator: bool,
}

impl Drop for SessionKeys {
	fn drop(&mut self) {
		self.send.as_mut_slice().zeroize();
		self.recv.as_mut_slice().zeroize();
	}
}

/// Open an initiation far enough to learn who claims to have sent it.
/// The caller resolves the peer and finishes with
/// [`Handshake::consume_initiation`] under that peer's lock.
pub fn open_initiation(identity: &Identity, msg: &mut Initiation) -> Result<(Hash, Chain, PublicKey)> {
	let mut hash = identity.hash.clone();
	let mut chain = Chain::default();

	hash.update(&msg.ephemeral);
	chain.write(&msg.ephemeral);

	let [k] = chain.kdf(identity.key.diffie_hellman(&PublicKey::from(msg.ephemeral)).as_bytes());
	let pubkey = *msg.pubkey.open(&k, &mut hash)?;

	Ok((hash, chain, PublicKey::from(pubkey)))
}

impl Handshake {
	pub fn new(remote_static: PublicKey, identity: Option<&Identity>) -> Self {
		let mut remote_hash = Hash::default();
		remote_hash.update(remote_static.as_bytes());

		let mut this = Self {
			state: State::Zeroed,
			remote_static,
			remote_hash,
			precomputed: [0; 32],
			preshared: [0; 32],
			local_index: 0,
			remote_index: 0,
			last_timestamp: None,
			last_initiation_consumption: None,
			last_sent_initiation: None,
		};

		if let Some(identity) = identity {
			this.precompute(identity);
		}

		this
	}

	/// Refresh the static-static shared secret.
	pub fn precompute(&mut self, identity: &Identity) {
		self.precomputed = identity.key.diffie_hellman(&self.remote_static).to_bytes();
	}

	pub fn set_preshared(&mut self, psk: [u8; 32]) {
		self.preshared = psk;
	}

	pub fn preshared(&self) -> &[u8; 32] {
		&self.preshared
	}

	/// Whether an initiation is in flight awaiting a response.
	pub fn is_initiating(&self) -> bool {
		matches!(self.state, State::InitiationCreated { .. })
	}

	/// Drop any in-progress state.
	pub fn clear(&mut self) {
		self.state = State::Zeroed;
	}

	/// Build an initiation message, minus its macs. `local_index` must
	/// already be registered with the index table.
	pub fn create_initiation(&mut self, identity: &Identity, local_index: u32, now: SystemTime, msg: &mut Initiation) {
		let mut hash = self.remote_hash.clone();
		let mut chain = Chain::default();

		let ephemeral = StaticSecret::random();

		msg.tag = MSG_INITIATION.into();
		msg.sender = local_index.into();
		msg.ephemeral = PublicKey::from(&ephemeral).to_bytes();

		hash.update(&msg.ephemeral);
		chain.write(&msg.ephemeral);

		let [k] = chain.kdf(ephemeral.diffie_hellman(&self.remote_static).as_bytes());
		msg.pubkey.seal(identity.public.to_bytes(), &k, &mut hash);

		let [k] = chain.kdf(&self.precomputed);
		msg.timestamp.seal(Tai64N::from_system_time(&now).to_bytes(), &k, &mut hash);

		self.local_index = local_index;
		self.state = State::InitiationCreated { hash, chain, ephemeral };
	}

	/// Finish consuming an initiation opened by [`open_initiation`]:
	/// verify its timestamp and record the half-open session.
	pub fn consume_initiation(&mut self, mut hash: Hash, mut chain: Chain, now: Instant, msg: &mut Initiation) -> Result {
		let [k] = chain.kdf(&self.precomputed);
		let stamp = *msg.timestamp.open(&k, &mut hash)?;

		let stamp = Tai64N::try_from(stamp).map_err(|_| warn!("Initiation timestamp is malformed"))?;

		if self.last_timestamp.is_some_and(|last| stamp <= last) {
			warn!("Initiation timestamp is not newer than the last accepted one");
			return Err(());
		}

		if self.last_initiation_consumption.is_some_and(|last| now.saturating_duration_since(last) < HANDSHAKE_INITIATION_RATE) {
			warn!("Initiations arriving faster than the handshake rate");
			return Err(());
		}

		self.last_timestamp = Some(stamp);
		self.last_initiation_consumption = Some(now);
		self.remote_index = msg.sender.get();
		self.state = State::InitiationConsumed { hash, chain, ephemeral: PublicKey::from(msg.ephemeral) };

		Ok(())
	}

	/// Build the response to a consumed initiation, minus its macs,
	/// deriving the responder-side transport keys.
	pub fn create_response(&mut self, local_index: u32, msg: &mut Response) -> Result<SessionKeys> {
		if !matches!(self.state, State::InitiationConsumed { .. }) {
			warn!("No consumed initiation to respond to");
			return Err(());
		}

		let State::InitiationConsumed { mut hash, mut chain, ephemeral: remote_ephemeral } = mem::replace(&mut self.state, State::Zeroed) else {
			unreachable!()
		};

		msg.tag = MSG_RESPONSE.into();
		msg.sender = local_index.into();
		msg.receiver = self.remote_index.into();

		let ephemeral = StaticSecret::random();
		msg.ephemeral = PublicKey::from(&ephemeral).to_bytes();

		hash.update(&msg.ephemeral);
		chain.write(&msg.ephemeral);

		chain.write(ephemeral.diffie_hellman(&remote_ephemeral).as_bytes());
		chain.write(ephemeral.diffie_hellman(&self.remote_static).as_bytes());

		let [t, k] = chain.kdf(&self.preshared);
		hash.update(&t);
		msg.empty.seal([], &k, &mut hash);

		self.local_index = local_index;

		let (recv, send) = chain.split();

		Ok(SessionKeys {
			send,
			recv,
			local_index,
			remote_index: self.remote_index,
			is_initiator: false,
		})
	}

	/// Consume a response to our in-flight initiation, deriving the
	/// initiator-side transport keys. Ephemeral material is cleared
	/// as soon as the response authenticates.
	pub fn consume_response(&mut self, identity: &Identity, msg: &mut Response) -> Result<SessionKeys> {
		let State::InitiationCreated { hash, chain, ephemeral } = &self.state else {
			warn!("No initiation in flight for this response");
			return Err(());
		};

		let mut hash = hash.clone();
		let mut chain = chain.clone();
		let ephemeral = ephemeral.clone();

		let remote_ephemeral = PublicKey::from(msg.ephemeral);

		hash.update(&msg.ephemeral);
		chain.write(&msg.ephemeral);

		chain.write(ephemeral.diffie_hellman(&remote_ephemeral).as_bytes());
		chain.write(identity.key.diffie_hellman(&remote_ephemeral).as_bytes());

		let [t, k] = chain.kdf(&self.preshared);
		hash.update(&t);
		msg.empty.open(&k, &mut hash)?;

		self.state = State::Zeroed;
		self.remote_index = msg.sender.get();

		let (send, recv) = chain.split();

		Ok(SessionKeys {
			send,
			recv,
			local_index: self.local_index,
			remote_index: msg.sender.get(),
			is_initiator: true,
		})
	}
}

impl Drop for Handshake {
	fn drop(&mut self) {
		self.precomputed.zeroize();
		self.preshared.zeroize();
	}
}

#[cfg(test)]
mod tests {
	use zerocopy::{AsBytes, FromBytes, FromZeroes};

	use super::*;

	fn pair() -> (Identity, Identity, Handshake, Handshake) {
		let a_id = Identity::new(StaticSecret::random());
		let b_id = Identity::new(StaticSecret::random());

		let a = Handshake::new(b_id.public, Some(&a_id));
		let b = Handshake::new(a_id.public, Some(&b_id));

		(a_id, b_id, a, b)
	}

	#[test]
	fn full_handshake() {
		let (a_id, b_id, mut a, mut b) = pair();

		let mut init = Initiation::new_zeroed();
		a.create_initiation(&a_id, 101, SystemTime::now(), &mut init);
		assert!(a.is_initiating());

		let (hash, chain, claimed) = open_initiation(&b_id, &mut init).unwrap();
		assert_eq!(claimed.as_bytes(), a_id.public.as_bytes());
		b.consume_initiation(hash, chain, Instant::now(), &mut init).unwrap();

		let mut resp = Response::new_zeroed();
		let bk = b.create_response(202, &mut resp).unwrap();
		let ak = a.consume_response(&a_id, &mut resp).unwrap();

		assert_eq!(ak.send, bk.recv);
		assert_eq!(ak.recv, bk.send);
		assert!(ak.is_initiator);
		assert!(!bk.is_initiator);
		assert_eq!(ak.remote_index, 202);
		assert_eq!(bk.remote_index, 101);
		assert!(!a.is_initiating());
	}

	#[test]
	fn psk_must_match() {
		let (a_id, b_id, mut a, mut b) = pair();
		a.set_preshared([7; 32]);

		let mut init = Initiation::new_zeroed();
		a.create_initiation(&a_id, 1, SystemTime::now(), &mut init);

		// The initiation itself does not involve the psk.
		let (hash, chain, _) = open_initiation(&b_id, &mut init).unwrap();
		b.consume_initiation(hash, chain, Instant::now(), &mut init).unwrap();

		// But a response built over a different psk must not verify.
		let mut resp = Response::new_zeroed();
		b.create_response(2, &mut resp).unwrap();
		assert!(a.consume_response(&a_id, &mut resp).is_err());

		// And the initiator's in-flight state survives the bad reply.
		assert!(a.is_initiating());
	}

	#[test]
	fn replayed_initiation_rejected() {
		let (a_id, b_id, mut a, mut b) = pair();

		let mut init = Initiation::new_zeroed();
		a.create_initiation(&a_id, 1, SystemTime::now(), &mut init);

		// Snapshot the wire bytes before consumption decrypts them in
		// place.
		let mut replay = Initiation::read_from(init.as_bytes()).unwrap();

		let now = Instant::now();
		let (hash, chain, _) = open_initiation(&b_id, &mut init).unwrap();
		b.consume_initiation(hash, chain, now, &mut init).unwrap();

		// The same message again, past the flood window: the timestamp
		// check must reject it.
		let (hash, chain, _) = open_initiation(&b_id, &mut replay).unwrap();
		assert!(b.consume_initiation(hash, chain, now + Duration::from_secs(1), &mut replay).is_err());
	}

	#[test]
	fn initiation_flood_rejected() {
		let (a_id, b_id, mut a, mut b) = pair();
		let now = Instant::now();

		let mut first = Initiation::new_zeroed();
		a.create_initiation(&a_id, 1, SystemTime::now(), &mut first);
		let (hash, chain, _) = open_initiation(&b_id, &mut first).unwrap();
		b.consume_initiation(hash, chain, now, &mut first).unwrap();

		// A second, newer initiation arriving within the rate window.
		let mut second = Initiation::new_zeroed();
		a.create_initiation(&a_id, 2, SystemTime::now() + Duration::from_secs(1), &mut second);
		let (hash, chain, _) = open_initiation(&b_id, &mut second).unwrap();
		assert!(b.consume_initiation(hash, chain, now + Duration::from_millis(10), &mut second).is_err());

		// The same message is fine once the window has passed, but the
		// state was not consumed by the rejection; re-create to get a
		// fresh timestamp.
		let mut third = Initiation::new_zeroed();
		a.create_initiation(&a_id, 3, SystemTime::now() + Duration::from_secs(2), &mut third);
		let (hash, chain, _) = open_initiation(&b_id, &mut third).unwrap();
		assert!(b.consume_initiation(hash, chain, now + Duration::from_secs(1), &mut third).is_ok());
	}
}
