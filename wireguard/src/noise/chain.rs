use blake2::digest::FixedOutput;
use blake2::Blake2s256;
use hmac::{Mac, SimpleHmac};
use zeroize::Zeroize;

use super::A32;

type Hmac = SimpleHmac<Blake2s256>;

/// HASH("Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s"), the initial
/// chaining key.
const CHAIN_INITIAL: [u8; 32] = [
	0x60, 0xe2, 0x6d, 0xae, 0xf3, 0x27, 0xef, 0xc0, 0x2e, 0xc3, 0x35, 0xe2, 0xa0, 0x25, 0xd2, 0xd0, 0x16, 0xeb, 0x42, 0x06, 0xf8, 0x72, 0x77, 0xf5,
	0x2d, 0x38, 0xd1, 0x98, 0x8b, 0x78, 0xcd, 0x36,
];

/// The Noise chaining key, advanced by HKDF over HMAC-BLAKE2s.
#[derive(Clone)]
pub struct Chain(A32);

impl Chain {
	fn prf(key: &[u8], a: &[u8], b: &[u8]) -> A32 {
		let mut mac = Hmac::new_from_slice(key).expect("HMAC accepts any key length");
		mac.update(a);
		mac.update(b);
		mac.finalize_fixed()
	}

	/// Absorb `input` into the chaining key, deriving nothing else.
	#[inline]
	pub fn write(&mut self, input: &[u8]) {
		let [] = self.kdf(input);
	}

	/// One HKDF step: absorb `input`, advance the chaining key to T1
	/// and return the `N` outputs that follow it.
	#[inline]
	#[must_use]
	pub fn kdf<const N: usize>(&mut self, input: &[u8]) -> [A32; N] {
		let t0 = Self::prf(&self.0, input, &[]);

		self.0 = Self::prf(&t0, &[], &[1]);

		let mut out = [A32::default(); N];
		let mut prev = self.0.clone();

		for (n, t) in out.iter_mut().enumerate() {
			*t = Self::prf(&t0, &prev, &[n as u8 + 2]);
			prev = t.clone();
		}

		out
	}

	/// Split the final chaining key into the two transport keys. The
	/// first keys the initiator-to-responder direction.
	pub fn split(mut self) -> (A32, A32) {
		let [t1] = self.kdf(&[]);
		(self.0.clone(), t1)
	}
}

impl Default for Chain {
	fn default() -> Self {
		Self(CHAIN_INITIAL.into())
	}
}

impl Drop for Chain {
	fn drop(&mut self) {
		self.0.as_mut_slice().zeroize();
	}
}

#[cfg(test)]
mod tests {
	use blake2::digest::Digest;

	use super::*;

	#[test]
	fn initial_chain() {
		assert_eq!(Blake2s256::digest(b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s").as_slice(), &CHAIN_INITIAL);
	}

	#[test]
	fn kdf_outputs_differ() {
		let mut chain = Chain::default();
		let [a, b] = chain.kdf(b"input");

		assert_ne!(a, b);
		assert_ne!(a.as_slice(), &CHAIN_INITIAL);

		// The same absorption from the same state is deterministic.
		let mut again = Chain::default();
		let [a2, b2] = again.kdf(b"input");
		assert_eq!(a, a2);
		assert_eq!(b, b2);
	}
}
