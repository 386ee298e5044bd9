//! The four message layouts of the wire protocol. Every message
//! starts with a little-endian 4-byte type discriminator; the structs
//! reinterpret the receive buffer in place.

use core::mem::size_of;

use zerocopy::little_endian::{U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::noise::aead::Sealed;

pub const MSG_INITIATION: u32 = 1;
pub const MSG_RESPONSE: u32 = 2;
pub const MSG_COOKIE_REPLY: u32 = 3;
pub const MSG_TRANSPORT: u32 = 4;

pub const INITIATION_LEN: usize = size_of::<Initiation>();
pub const RESPONSE_LEN: usize = size_of::<Response>();
pub const COOKIE_REPLY_LEN: usize = size_of::<CookieReply>();
pub const TRANSPORT_HEADER_LEN: usize = size_of::<Transport>();

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;
/// Transport header plus the tag of the (possibly empty) payload: the
/// size of a keep-alive, and the minimum size of any transport packet.
pub const TRANSPORT_OVERHEAD: usize = TRANSPORT_HEADER_LEN + TAG_LEN;
/// The two trailing authenticators every handshake message carries.
pub const MACS_LEN: usize = size_of::<Macs>();
/// Transport plaintext is zero-padded to this multiple.
pub const PADDING_MULTIPLE: usize = 16;

/// The message type, if the buffer is long enough to carry one.
pub fn message_type(buf: &[u8]) -> Option<u32> {
	buf.get(..4).map(|b| u32::from_le_bytes(b.try_into().unwrap()))
}

#[derive(FromZeroes, FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct Macs {
	pub mac1: [u8; 16],
	pub mac2: [u8; 16],
}

#[derive(FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct Initiation {
	pub tag: U32,
	pub sender: U32,
	pub ephemeral: [u8; 32],
	pub pubkey: Sealed<[u8; 32]>,
	pub timestamp: Sealed<[u8; 12]>,
	pub macs: Macs,
}

#[derive(FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct Response {
	pub tag: U32,
	pub sender: U32,
	pub receiver: U32,
	pub ephemeral: [u8; 32],
	pub empty: Sealed<[u8; 0]>,
	pub macs: Macs,
}

#[derive(FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct CookieReply {
	pub tag: U32,
	pub receiver: U32,
	pub nonce: [u8; 24],
	/// XChaCha20-Poly1305 sealed cookie: 16 bytes of ciphertext
	/// followed by the tag, bound to the sender's `mac1`.
	pub cookie: [u8; 32],
}

/// Header of a transport packet; the AEAD ciphertext follows.
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct Transport {
	pub tag: U32,
	pub receiver: U32,
	pub counter: U64,
}
