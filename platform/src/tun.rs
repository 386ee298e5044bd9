use std::io;

use crossbeam_channel::Receiver;

/// State changes of the virtual interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunEvent {
	/// The interface came up with the given MTU.
	Up(usize),
	Down,
}

/// The virtual network interface: a byte-oriented packet source/sink.
///
/// The platform driver itself (utun, wintun, /dev/net/tun) lives
/// outside this workspace; anything that can move IP datagrams and
/// report an MTU can back the tunnel.
pub trait Tun: Send + Sync {
	/// Read one packet into `buf[offset..]`, returning its length.
	/// The offset leaves room for the transport header so the packet
	/// is encrypted in place without a copy.
	fn read(&self, buf: &mut [u8], offset: usize) -> io::Result<usize>;

	/// Write one packet to the interface.
	fn write(&self, buf: &[u8]) -> io::Result<usize>;

	fn mtu(&self) -> io::Result<usize>;

	/// Interface up/down events, ending when the interface is closed.
	fn events(&self) -> Receiver<TunEvent>;

	/// Close the interface, unblocking any pending `read`.
	fn close(&self);
}
