use blake2::digest::{FixedOutput, Update};
use blake2::Blake2s256;
use zeroize::Zeroize;

use super::A32;

/// HASH(Ci || "WireGuard v1 zx2c4 Jason@zx2c4.com"), the transcript
/// every handshake starts from.
const INITIAL: [u8; 32] = [
	0x22, 0x11, 0xb3, 0x61, 0x08, 0x1a, 0xc5, 0x66, 0x69, 0x12, 0x43, 0xdb, 0x45, 0x8a, 0xd5, 0x32, 0x2d, 0x9c, 0x6c, 0x66, 0x22, 0x93, 0xe8, 0xb7,
	0x0e, 0xe1, 0x9c, 0x65, 0xba, 0x07, 0x9e, 0xf3,
];

/// The running handshake transcript hash.
#[derive(Clone)]
pub struct Hash(pub(super) A32);

impl Hash {
	#[inline]
	pub fn update(&mut self, data: &[u8]) {
		let mut core = Blake2s256::default();
		core.update(&self.0);
		core.update(data);
		core.finalize_into(&mut self.0);
	}
}

impl Default for Hash {
	#[inline]
	fn default() -> Self {
		Self(INITIAL.into())
	}
}

impl Drop for Hash {
	fn drop(&mut self) {
		self.0.as_mut_slice().zeroize();
	}
}

#[cfg(test)]
mod tests {
	use blake2::digest::Digest;

	use super::*;

	#[test]
	fn initial_transcript() {
		let construction = Blake2s256::digest(b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s");
		let identifier = Blake2s256::new().chain_update(construction).chain_update(b"WireGuard v1 zx2c4 Jason@zx2c4.com").finalize();

		assert_eq!(identifier.as_slice(), &INITIAL);
	}
}
