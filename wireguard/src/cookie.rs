//! The two keyed-BLAKE2s authenticators trailing every handshake
//! message, and the cookie exchange that backs `mac2` when the device
//! is under load. [`CookieChecker`] is the device half (verify,
//! mint replies); [`CookieGenerator`] is the peer half (stamp
//! outgoing messages, absorb replies).

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use blake2::digest::consts::U16;
use blake2::digest::{FixedOutput, KeyInit, Update};
use blake2::{Blake2s256, Blake2sMac};
use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{Tag, XChaCha20Poly1305 as XAead, XNonce};
use generic_array::GenericArray;
use log::{debug, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use utils::error::*;
use x25519_dalek::PublicKey;

use crate::noise::A32;
use crate::packet::{CookieReply, MACS_LEN, MSG_COOKIE_REPLY, TAG_LEN};

const LABEL_MAC1: &[u8] = b"mac1----";
const LABEL_COOKIE: &[u8] = b"cookie--";

/// How long a cookie (and the secret minting it) stays valid.
pub const COOKIE_REFRESH_TIME: Duration = Duration::from_secs(120);

type A16 = GenericArray<u8, U16>;
type Mac = Blake2sMac<U16>;

fn derive(label: &[u8], key: &[u8; 32]) -> A32 {
	let mut hasher = Blake2s256::default();
	hasher.update(label);
	hasher.update(key);
	hasher.finalize_fixed()
}

fn mac16(key: &[u8], data: &[u8]) -> A16 {
	let mut mac = Mac::new_from_slice(key).expect("BLAKE2s accepts keys up to 32 bytes");
	mac.update(data);
	mac.finalize_fixed()
}

/// Device-side mac validation, keyed off the local static public key.
pub struct CookieChecker {
	mac1_key: A32,
	cookie_aead: XAead,
	secret: [u8; 32],
	secret_birth: Option<Instant>,
}

impl CookieChecker {
	pub fn new(public: &PublicKey) -> Self {
		Self {
			mac1_key: derive(LABEL_MAC1, public.as_bytes()),
			cookie_aead: XAead::new(&derive(LABEL_COOKIE, public.as_bytes())),
			secret: [0; 32],
			secret_birth: None,
		}
	}

	/// Verify the first authenticator. A mismatch means the sender
	/// does not even know our public key.
	pub fn check_mac1(&self, msg: &[u8]) -> Result {
		let (body, macs) = msg.split_at(msg.len() - MACS_LEN);
		let mac1 = mac16(&self.mac1_key, body);

		if !bool::from(mac1.as_slice().ct_eq(&macs[..16])) {
			warn!("Handshake message carries an invalid mac1");
			return Err(());
		}

		Ok(())
	}

	/// Verify the second authenticator against the cookie the source
	/// should currently hold. Only meaningful under load.
	pub fn check_mac2(&self, msg: &[u8], src: &SocketAddr, now: Instant) -> Result {
		if !self.secret_fresh(now) {
			return Err(());
		}

		let cookie = self.cookie(src);
		let (body, mac2) = msg.split_at(msg.len() - TAG_LEN);

		if !bool::from(mac16(&cookie, body).as_slice().ct_eq(mac2)) {
			debug!("Handshake message carries a stale or missing mac2");
			return Err(());
		}

		Ok(())
	}

	/// Mint the cookie reply sent instead of processing a message
	/// whose mac2 did not verify.
	pub fn create_reply(&mut self, msg: &[u8], sender: u32, src: &SocketAddr, now: Instant, reply: &mut CookieReply) -> Result {
		if !self.secret_fresh(now) {
			OsRng.fill_bytes(&mut self.secret);
			self.secret_birth = Some(now);
		}

		let tau = self.cookie(src);

		reply.tag = MSG_COOKIE_REPLY.into();
		reply.receiver = sender.into();
		OsRng.fill_bytes(&mut reply.nonce);

		// The reply is bound to the mac1 the sender just used.
		let mac1 = &msg[msg.len() - MACS_LEN..][..TAG_LEN];

		let (body, tag_out) = reply.cookie.split_at_mut(16);
		body.copy_from_slice(&tau);

		let tag = self
			.cookie_aead
			.encrypt_in_place_detached(XNonce::from_slice(&reply.nonce), mac1, body)
			.map_err(|_| warn!("Failed to seal cookie reply"))?;
		tag_out.copy_from_slice(&tag);

		Ok(())
	}

	fn secret_fresh(&self, now: Instant) -> bool {
		self.secret_birth.is_some_and(|birth| now.saturating_duration_since(birth) < COOKIE_REFRESH_TIME)
	}

	fn cookie(&self, src: &SocketAddr) -> A16 {
		let mut mac = Mac::new_from_slice(&self.secret).expect("secret fits the key size");

		match src {
			SocketAddr::V4(a) => mac.update(&a.ip().octets()),
			SocketAddr::V6(a) => mac.update(&a.ip().octets()),
		}
		mac.update(&src.port().to_be_bytes());

		mac.finalize_fixed()
	}
}

/// Peer-side mac production, keyed off the remote static public key.
pub struct CookieGenerator {
	mac1_key: A32,
	cookie_aead: XAead,
	last_mac1: Option<A16>,
	cookie: Option<(A16, Instant)>,
}

impl CookieGenerator {
	pub fn new(remote: &PublicKey) -> Self {
		Self {
			mac1_key: derive(LABEL_MAC1, remote.as_bytes()),
			cookie_aead: XAead::new(&derive(LABEL_COOKIE, remote.as_bytes())),
			last_mac1: None,
			cookie: None,
		}
	}

	/// Stamp mac1, and mac2 when a fresh cookie is held, onto an
	/// outgoing handshake message.
	pub fn stamp(&mut self, msg: &mut [u8], now: Instant) {
		let len = msg.len();

		let mac1 = mac16(&self.mac1_key, &msg[..len - MACS_LEN]);
		msg[len - MACS_LEN..len - TAG_LEN].copy_from_slice(&mac1);
		self.last_mac1 = Some(mac1);

		let fresh = self
			.cookie
			.as_ref()
			.filter(|(_, received)| now.saturating_duration_since(*received) < COOKIE_REFRESH_TIME)
			.map(|(cookie, _)| *cookie);

		match fresh {
			Some(cookie) => {
				let mac2 = mac16(&cookie, &msg[..len - TAG_LEN]);
				msg[len - TAG_LEN..].copy_from_slice(&mac2);
			}
			None => {
				self.cookie = None;
				msg[len - TAG_LEN..].fill(0);
			}
		}
	}

	/// Absorb a cookie reply bound to our last handshake message.
	pub fn consume_reply(&mut self, msg: &mut CookieReply, now: Instant) -> Result {
		let Some(mac1) = self.last_mac1 else {
			warn!("Cookie reply without a handshake message to bind to");
			return Err(());
		};

		let (body, tag) = msg.cookie.split_at_mut(16);

		self.cookie_aead
			.decrypt_in_place_detached(XNonce::from_slice(&msg.nonce), &mac1, body, Tag::from_slice(tag))
			.map_err(|_| warn!("Failed to open cookie reply"))?;

		self.cookie = Some((A16::clone_from_slice(body), now));

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use x25519_dalek::StaticSecret;
	use zerocopy::FromZeroes;

	use super::*;
	use crate::packet::INITIATION_LEN;

	fn setup() -> (CookieChecker, CookieGenerator) {
		let device = PublicKey::from(&StaticSecret::random());
		(CookieChecker::new(&device), CookieGenerator::new(&device))
	}

	#[test]
	fn mac1_roundtrip() {
		let (checker, mut generator) = setup();
		let now = Instant::now();

		let mut msg = [0x5au8; INITIATION_LEN];
		generator.stamp(&mut msg, now);

		checker.check_mac1(&msg).unwrap();

		msg[3] ^= 1;
		assert!(checker.check_mac1(&msg).is_err());
	}

	#[test]
	fn cookie_exchange_enables_mac2() {
		let (mut checker, mut generator) = setup();
		let now = Instant::now();
		let src: SocketAddr = "192.0.2.7:51820".parse().unwrap();

		let mut msg = [0x11u8; INITIATION_LEN];
		generator.stamp(&mut msg, now);

		// Without a cookie, mac2 is all zeros and fails under load.
		assert!(checker.check_mac2(&msg, &src, now).is_err());

		let mut reply = CookieReply::new_zeroed();
		checker.create_reply(&msg, 42, &src, now, &mut reply).unwrap();
		assert_eq!(reply.receiver.get(), 42);

		generator.consume_reply(&mut reply, now).unwrap();

		generator.stamp(&mut msg, now);
		checker.check_mac1(&msg).unwrap();
		checker.check_mac2(&msg, &src, now).unwrap();

		// A different source does not share the cookie.
		let other: SocketAddr = "192.0.2.8:51820".parse().unwrap();
		assert!(checker.check_mac2(&msg, &other, now).is_err());
	}

	#[test]
	fn cookie_expires() {
		let (mut checker, mut generator) = setup();
		let now = Instant::now();
		let src: SocketAddr = "198.51.100.2:7".parse().unwrap();

		let mut msg = [0u8; INITIATION_LEN];
		generator.stamp(&mut msg, now);

		let mut reply = CookieReply::new_zeroed();
		checker.create_reply(&msg, 1, &src, now, &mut reply).unwrap();
		generator.consume_reply(&mut reply, now).unwrap();

		// Two minutes later the peer must fall back to a zero mac2.
		let later = now + COOKIE_REFRESH_TIME;
		generator.stamp(&mut msg, later);
		assert_eq!(&msg[INITIATION_LEN - TAG_LEN..], &[0u8; 16]);
	}
}
