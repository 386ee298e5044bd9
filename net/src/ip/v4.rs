use zerocopy::big_endian::U16;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// The fixed 20-byte IPv4 header. Options may follow; the tunnel does
/// not interpret them.
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct Header {
	pub ver_ihl: u8,
	pub tos: u8,
	/// Total datagram length, header included.
	pub len: U16,
	pub id: U16,
	pub frg: U16,
	pub ttl: u8,
	pub proto: u8,
	pub csum: [u8; 2],
	pub src: [u8; 4],
	pub dst: [u8; 4],
}
