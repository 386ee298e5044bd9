use zerocopy::big_endian::U16;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

pub const HEADER_LEN: usize = 40;

/// The fixed 40-byte IPv6 header.
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct Header {
	/// Version, traffic class and flow label, packed.
	pub meta: [u8; 4],
	/// Payload length; the header itself is not included.
	pub len: U16,
	pub next: u8,
	pub hop: u8,
	pub src: [u8; 16],
	pub dst: [u8; 16],
}
