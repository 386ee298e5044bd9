use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{ChaCha20Poly1305 as Aead, KeyInit, Nonce, Tag};
use log::warn;
use utils::error::*;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use super::{Hash, A32};

/// A fixed-size field of a handshake message, AEAD-sealed with the
/// running transcript as associated data. Handshake fields use the
/// all-zero nonce; every key is used exactly once.
#[derive(FromZeroes, FromBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct Sealed<T> {
	body: T,
	tag: [u8; 16],
}

// Derived `AsBytes` is rejected by zerocopy for generic structs unless
// `repr(transparent)`/`repr(packed)` is used; neither applies here (two
// fields, and `T` must stay naturally aligned). Implement it manually:
// the bound `T: AsBytes` together with `repr(C)` and no padding (a
// `[u8; 16]` tag immediately follows `T`, which is always byte-aligned)
// gives the same guarantee the derive would have produced.
unsafe impl<T: AsBytes> AsBytes for Sealed<T> {
	fn only_derive_is_allowed_to_implement_this_trait() {}
}

impl<T: AsBytes + FromBytes> Sealed<T> {
	#[inline]
	pub fn seal(&mut self, value: T, key: &A32, hash: &mut Hash) {
		self.body = value;

		let tag = Aead::new(key)
			.encrypt_in_place_detached(&Nonce::default(), &hash.0, self.body.as_bytes_mut())
			.expect("sealing a fixed-size field cannot fail");

		self.tag = tag.into();
		hash.update(self.as_bytes());
	}

	#[inline]
	pub fn open(&mut self, key: &A32, hash: &mut Hash) -> Result<&T> {
		let aad = hash.0;
		hash.update(self.as_bytes());

		let tag = Tag::from(self.tag);

		Aead::new(key)
			.decrypt_in_place_detached(&Nonce::default(), &aad, self.body.as_bytes_mut(), &tag)
			.map_err(|_| warn!("Failed to open sealed handshake field"))?;

		Ok(&self.body)
	}
}
