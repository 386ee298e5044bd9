mod v4;
mod v6;

use core::net::IpAddr;

use log::warn;
use utils::error::*;
pub use v4::Header as V4Header;
pub use v6::Header as V6Header;
use zerocopy::FromBytes;

/// A read-only view of the IP datagram carried inside the tunnel.
///
/// The tunnel never rewrites inner packets; it only needs the version,
/// the addresses (for routing and the reverse-path check) and the true
/// datagram length (to strip the cipher padding).
pub enum Packet<'a> {
	V4(&'a V4Header),
	V6(&'a V6Header),
}

impl<'a> Packet<'a> {
	/// Interpret the start of `buf` as an IP header, dispatching on
	/// the version nibble.
	pub fn parse(buf: &'a [u8]) -> Result<Self> {
		let version = buf.first().map(|b| b >> 4);

		match version {
			Some(4) => {
				let header = V4Header::ref_from_prefix(buf).ok_or_else(|| warn!("IPv4 packet shorter than its header"))?;
				Ok(Packet::V4(header))
			}
			Some(6) => {
				let header = V6Header::ref_from_prefix(buf).ok_or_else(|| warn!("IPv6 packet shorter than its header"))?;
				Ok(Packet::V6(header))
			}
			Some(v) => {
				warn!("Packet has unknown IP version {v}");
				Err(())
			}
			None => Err(()),
		}
	}

	pub fn src(&self) -> IpAddr {
		match self {
			Packet::V4(h) => IpAddr::V4(h.src.into()),
			Packet::V6(h) => IpAddr::V6(h.src.into()),
		}
	}

	pub fn dst(&self) -> IpAddr {
		match self {
			Packet::V4(h) => IpAddr::V4(h.dst.into()),
			Packet::V6(h) => IpAddr::V6(h.dst.into()),
		}
	}

	/// The length of the whole datagram, header included, as declared
	/// by the header. Anything beyond it is padding.
	#[allow(clippy::len_without_is_empty)]
	pub fn len(&self) -> usize {
		match self {
			Packet::V4(h) => h.len.get() as usize,
			Packet::V6(h) => v6::HEADER_LEN + h.len.get() as usize,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn v4_packet(src: [u8; 4], dst: [u8; 4], total: u16) -> Vec<u8> {
		let mut buf = vec![0u8; total as usize];
		buf[0] = 0x45;
		buf[2..4].copy_from_slice(&total.to_be_bytes());
		buf[12..16].copy_from_slice(&src);
		buf[16..20].copy_from_slice(&dst);
		buf
	}

	#[test]
	fn parse_v4() {
		let buf = v4_packet([10, 0, 0, 1], [10, 0, 0, 2], 40);
		let packet = Packet::parse(&buf).unwrap();

		assert_eq!(packet.src(), IpAddr::from([10, 0, 0, 1]));
		assert_eq!(packet.dst(), IpAddr::from([10, 0, 0, 2]));
		assert_eq!(packet.len(), 40);
	}

	#[test]
	fn parse_v6() {
		let mut buf = vec![0u8; 60];
		buf[0] = 0x60;
		buf[4..6].copy_from_slice(&20u16.to_be_bytes());
		buf[8] = 0xfd;
		buf[24] = 0xfd;
		buf[39] = 2;

		let packet = Packet::parse(&buf).unwrap();
		assert_eq!(packet.len(), 40 + 20);
		assert!(matches!(packet.dst(), IpAddr::V6(_)));
	}

	#[test]
	fn reject_short_and_unknown() {
		assert!(Packet::parse(&[]).is_err());
		assert!(Packet::parse(&[0x45; 10]).is_err());
		assert!(Packet::parse(&[0x50; 40]).is_err());
	}
}
