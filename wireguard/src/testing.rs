//! In-process doubles for the platform collaborators: a channel-backed
//! TUN, a loopback "internet" of test binds, and helpers wiring two
//! devices together the way the integration tests need them.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use platform::{Bind, Clock, SystemClock, Tun, TunEvent};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::Device;

const POLL: Duration = Duration::from_millis(25);

pub struct TestTun {
	read_rx: Receiver<Vec<u8>>,
	write_tx: Sender<Vec<u8>>,
	events_rx: Receiver<TunEvent>,
	mtu: usize,
}

pub struct TunHandle {
	pub inject: Sender<Vec<u8>>,
	pub deliver: Receiver<Vec<u8>>,
	pub events: Sender<TunEvent>,
}

pub fn test_tun() -> (Arc<TestTun>, TunHandle) {
	let (inject, read_rx) = unbounded();
	let (write_tx, deliver) = unbounded();
	let (events, events_rx) = unbounded();

	(Arc::new(TestTun { read_rx, write_tx, events_rx, mtu: 1420 }), TunHandle { inject, deliver, events })
}

impl Tun for TestTun {
	fn read(&self, buf: &mut [u8], offset: usize) -> io::Result<usize> {
		match self.read_rx.recv_timeout(POLL) {
			Ok(packet) => {
				buf[offset..offset + packet.len()].copy_from_slice(&packet);
				Ok(packet.len())
			}
			Err(_) => Err(io::ErrorKind::WouldBlock.into()),
		}
	}

	fn write(&self, buf: &[u8]) -> io::Result<usize> {
		let _ = self.write_tx.send(buf.to_vec());
		Ok(buf.len())
	}

	fn mtu(&self) -> io::Result<usize> {
		Ok(self.mtu)
	}

	fn events(&self) -> Receiver<TunEvent> {
		self.events_rx.clone()
	}

	fn close(&self) {}
}

type Datagram = (Vec<u8>, SocketAddr);

/// A loopback network connecting test binds by socket address, with a
/// log of every datagram for wire-level assertions.
#[derive(Clone, Default)]
pub struct Network {
	links: Arc<Mutex<HashMap<SocketAddr, Sender<Datagram>>>>,
	pub log: Arc<Mutex<Vec<(SocketAddr, SocketAddr, Vec<u8>)>>>,
}

impl Network {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn bind(&self, addr: SocketAddr) -> Arc<TestBind> {
		let (tx, rx) = unbounded();
		self.links.lock().insert(addr, tx);

		Arc::new(TestBind { addr, inbox: rx, network: self.clone() })
	}

	/// Deliver a raw datagram, e.g. to replay a captured packet.
	pub fn inject(&self, to: SocketAddr, from: SocketAddr, data: Vec<u8>) {
		if let Some(link) = self.links.lock().get(&to) {
			let _ = link.send((data, from));
		}
	}

	/// Datagrams sent to `to` whose message type matches.
	pub fn sent_to(&self, to: SocketAddr, msg_type: u32) -> Vec<Vec<u8>> {
		self.log
			.lock()
			.iter()
			.filter(|(_, dst, data)| *dst == to && data.len() >= 4 && u32::from_le_bytes(data[..4].try_into().unwrap()) == msg_type)
			.map(|(_, _, data)| data.clone())
			.collect()
	}
}

pub struct TestBind {
	addr: SocketAddr,
	inbox: Receiver<Datagram>,
	network: Network,
}

impl Bind for TestBind {
	fn recv_v4(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
		match self.inbox.recv_timeout(POLL) {
			Ok((data, from)) => {
				buf[..data.len()].copy_from_slice(&data);
				Ok((data.len(), from))
			}
			Err(_) => Err(io::ErrorKind::WouldBlock.into()),
		}
	}

	fn recv_v6(&self, _: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
		// All test traffic is v4.
		std::thread::sleep(POLL);
		Err(io::ErrorKind::WouldBlock.into())
	}

	fn send(&self, buf: &[u8], endpoint: SocketAddr) -> io::Result<()> {
		self.network.log.lock().push((self.addr, endpoint, buf.to_vec()));
		self.network.inject(endpoint, self.addr, buf.to_vec());
		Ok(())
	}

	fn rebind(&self, port: u16) -> io::Result<u16> {
		Ok(if port == 0 { self.addr.port() } else { port })
	}

	fn port(&self) -> u16 {
		self.addr.port()
	}

	fn set_mark(&self, _: u32) -> io::Result<()> {
		Ok(())
	}

	fn close(&self) {}
}

pub struct TestDevice {
	pub device: Device,
	pub tun: TunHandle,
	pub public: PublicKey,
	pub addr: SocketAddr,
}

pub fn device_on(network: &Network, addr: &str) -> TestDevice {
	let addr: SocketAddr = addr.parse().unwrap();
	let (tun, handle) = test_tun();
	let bind = network.bind(addr);

	let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
	let device = Device::new(tun, bind, clock);

	let secret = StaticSecret::random();
	let public = PublicKey::from(&secret);
	device.set_private_key(Some(secret));

	TestDevice { device, tun: handle, public, addr }
}

/// Configure `a` and `b` as mutual peers with one /32 each, and bring
/// both devices up.
pub fn connect(a: &TestDevice, b: &TestDevice, a_ip: &str, b_ip: &str) {
	let peer_b = a.device.new_peer(b.public).unwrap();
	*peer_b.endpoint.write() = Some(b.addr);
	a.device.add_allowed_ip(&peer_b, format!("{b_ip}/32").parse().unwrap());

	let peer_a = b.device.new_peer(a.public).unwrap();
	*peer_a.endpoint.write() = Some(a.addr);
	b.device.add_allowed_ip(&peer_a, format!("{a_ip}/32").parse().unwrap());

	a.device.up();
	b.device.up();
}

/// A minimal IPv4 datagram with a deterministic payload.
pub fn ipv4(src: [u8; 4], dst: [u8; 4], payload: usize) -> Vec<u8> {
	let total = 20 + payload;
	let mut buf = vec![0u8; total];

	buf[0] = 0x45;
	buf[2..4].copy_from_slice(&(total as u16).to_be_bytes());
	buf[12..16].copy_from_slice(&src);
	buf[16..20].copy_from_slice(&dst);

	for (i, byte) in buf[20..].iter_mut().enumerate() {
		*byte = i as u8;
	}

	buf
}
