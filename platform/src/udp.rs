use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::info;
use socket2::{Domain, Protocol, Socket, Type};

/// How long a receive call may block before re-checking for shutdown.
const RECV_TIMEOUT: Duration = Duration::from_millis(250);

/// The UDP side of the tunnel. One bind carries every peer; the core
/// multiplexes on message contents, not on sockets.
pub trait Bind: Send + Sync {
	/// Receive one datagram on the IPv4 socket. A timeout surfaces as
	/// `WouldBlock` so the caller can poll its shutdown flag.
	fn recv_v4(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

	/// Receive one datagram on the IPv6 socket.
	fn recv_v6(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

	fn send(&self, buf: &[u8], endpoint: SocketAddr) -> io::Result<()>;

	/// Bind both sockets to `port` (0 picks an ephemeral port),
	/// returning the port actually bound. On failure the previous
	/// sockets remain in service.
	fn rebind(&self, port: u16) -> io::Result<u16>;

	fn port(&self) -> u16;

	/// Set the routing mark applied to both sockets (`SO_MARK`).
	fn set_mark(&self, mark: u32) -> io::Result<()>;

	fn close(&self);
}

struct Sockets {
	v4: Arc<UdpSocket>,
	v6: Arc<UdpSocket>,
	port: u16,
}

/// Plain dual-socket bind over the standard library, one socket per
/// address family with `IPV6_V6ONLY` set so the pair can share a port.
pub struct UdpBind {
	sockets: RwLock<Sockets>,
	mark: RwLock<Option<u32>>,
	closed: AtomicBool,
}

fn open_socket(domain: Domain, port: u16, mark: Option<u32>) -> io::Result<UdpSocket> {
	let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

	let addr: SocketAddr = if domain == Domain::IPV6 {
		socket.set_only_v6(true)?;
		SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0).into()
	} else {
		SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into()
	};

	socket.bind(&addr.into())?;
	socket.set_read_timeout(Some(RECV_TIMEOUT))?;

	let socket: UdpSocket = socket.into();
	apply_mark(&socket, mark)?;

	Ok(socket)
}

fn open_pair(port: u16, mark: Option<u32>) -> io::Result<Sockets> {
	// With an ephemeral port the two sockets still have to agree, so
	// bind v4 first and chase its port on the v6 side.
	for attempt in 0.. {
		let v4 = open_socket(Domain::IPV4, port, mark)?;
		let bound = v4.local_addr()?.port();

		match open_socket(Domain::IPV6, bound, mark) {
			Ok(v6) => return Ok(Sockets { v4: Arc::new(v4), v6: Arc::new(v6), port: bound }),
			Err(e) if port == 0 && attempt < 10 => {
				info!("Port {bound} not available on both families, retrying: {e}");
			}
			Err(e) => return Err(e),
		}
	}

	unreachable!()
}

#[cfg(target_os = "linux")]
fn apply_mark(socket: &UdpSocket, mark: Option<u32>) -> io::Result<()> {
	use std::os::fd::AsRawFd;

	let Some(mark) = mark else { return Ok(()) };

	let ret = unsafe {
		libc::setsockopt(
			socket.as_raw_fd(),
			libc::SOL_SOCKET,
			libc::SO_MARK,
			&mark as *const u32 as *const libc::c_void,
			core::mem::size_of::<u32>() as libc::socklen_t,
		)
	};

	if ret != 0 {
		return Err(io::Error::last_os_error());
	}

	Ok(())
}

#[cfg(not(target_os = "linux"))]
fn apply_mark(_: &UdpSocket, _: Option<u32>) -> io::Result<()> {
	Ok(())
}

impl UdpBind {
	pub fn open(port: u16) -> io::Result<Self> {
		Ok(Self {
			sockets: RwLock::new(open_pair(port, None)?),
			mark: RwLock::new(None),
			closed: AtomicBool::new(false),
		})
	}
}

impl Bind for UdpBind {
	fn recv_v4(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
		let socket = Arc::clone(&self.sockets.read().unwrap().v4);
		socket.recv_from(buf)
	}

	fn recv_v6(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
		let socket = Arc::clone(&self.sockets.read().unwrap().v6);
		socket.recv_from(buf)
	}

	fn send(&self, buf: &[u8], endpoint: SocketAddr) -> io::Result<()> {
		if self.closed.load(Ordering::Relaxed) {
			return Err(io::ErrorKind::NotConnected.into());
		}

		let sockets = self.sockets.read().unwrap();

		let n = match endpoint {
			SocketAddr::V4(_) => sockets.v4.send_to(buf, endpoint)?,
			SocketAddr::V6(_) => sockets.v6.send_to(buf, endpoint)?,
		};

		if n != buf.len() {
			return Err(io::Error::other("short send"));
		}

		Ok(())
	}

	fn rebind(&self, port: u16) -> io::Result<u16> {
		let fresh = open_pair(port, *self.mark.read().unwrap())?;
		let bound = fresh.port;

		*self.sockets.write().unwrap() = fresh;
		info!("UDP bind moved to port {bound}");

		Ok(bound)
	}

	fn port(&self) -> u16 {
		self.sockets.read().unwrap().port
	}

	fn set_mark(&self, mark: u32) -> io::Result<()> {
		let sockets = self.sockets.read().unwrap();
		apply_mark(&sockets.v4, Some(mark))?;
		apply_mark(&sockets.v6, Some(mark))?;
		*self.mark.write().unwrap() = Some(mark);
		Ok(())
	}

	fn close(&self) {
		self.closed.store(true, Ordering::Relaxed);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pair_shares_port() {
		let bind = UdpBind::open(0).unwrap();
		let sockets = bind.sockets.read().unwrap();

		assert_eq!(sockets.v4.local_addr().unwrap().port(), sockets.v6.local_addr().unwrap().port());
		assert_eq!(sockets.port, sockets.v4.local_addr().unwrap().port());
	}

	#[test]
	fn loopback_roundtrip() {
		let a = UdpBind::open(0).unwrap();
		let b = UdpBind::open(0).unwrap();

		let to = SocketAddr::from(([127, 0, 0, 1], b.port()));
		a.send(b"ping", to).unwrap();

		let mut buf = [0u8; 32];
		let (n, from) = b.recv_v4(&mut buf).unwrap();

		assert_eq!(&buf[..n], b"ping");
		assert_eq!(from.port(), a.port());
	}
}
