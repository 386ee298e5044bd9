//! The textual control plane: `get=1` dumps device and peer state,
//! `set=1` applies `key=value` updates, and either ends with an
//! `errno=N` trailer. Works over any local byte stream.

use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use ipnet::IpNet;
use log::debug;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::device::Device;
use crate::peer::Peer;

/// Configuration failures, mapped onto the errno trailer. Protocol
/// packet handling never surfaces here; these are control-plane only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
	#[error("i/o failure")]
	Io,
	#[error("malformed request")]
	Protocol,
	#[error("invalid value")]
	Invalid,
	#[error("listen port unavailable")]
	AddrInUse,
}

impl ConfigError {
	/// Negated POSIX errno, as emitted on the wire.
	pub fn errno(self) -> i32 {
		match self {
			ConfigError::Io => -5,
			ConfigError::Protocol => -71,
			ConfigError::Invalid => -22,
			ConfigError::AddrInUse => -98,
		}
	}
}

enum Op {
	PrivateKey(Option<StaticSecret>),
	ListenPort(u16),
	Fwmark(u32),
	ReplacePeers,
	Peer(PublicKey),
	Remove,
	Preshared([u8; 32]),
	Endpoint(SocketAddr),
	PersistentKeepalive(u16),
	ReplaceAllowedIps,
	AllowedIp(IpNet),
	ProtocolVersion,
}

fn key32(value: &str) -> Result<[u8; 32], ConfigError> {
	let mut out = [0u8; 32];
	hex::decode_to_slice(value, &mut out).map_err(|_| ConfigError::Invalid)?;
	Ok(out)
}

fn flag(value: &str) -> Result<(), ConfigError> {
	// Boolean keys only ever appear as `true`.
	(value == "true").then_some(()).ok_or(ConfigError::Invalid)
}

fn parse_line(key: &str, value: &str, in_peer: bool) -> Result<Op, ConfigError> {
	let device_key = matches!(key, "private_key" | "listen_port" | "fwmark" | "replace_peers");

	if device_key && in_peer {
		// Device keys cannot follow the first peer section.
		return Err(ConfigError::Protocol);
	}

	if !device_key && !in_peer && key != "public_key" {
		return Err(ConfigError::Protocol);
	}

	match key {
		"private_key" => {
			let bytes = key32(value)?;
			Ok(Op::PrivateKey((bytes != [0; 32]).then(|| StaticSecret::from(bytes))))
		}
		"listen_port" => Ok(Op::ListenPort(value.parse().map_err(|_| ConfigError::Invalid)?)),
		"fwmark" => {
			let mark = if value.is_empty() { 0 } else { value.parse().map_err(|_| ConfigError::Invalid)? };
			Ok(Op::Fwmark(mark))
		}
		"replace_peers" => flag(value).map(|()| Op::ReplacePeers),
		"public_key" => Ok(Op::Peer(PublicKey::from(key32(value)?))),
		"remove" => flag(value).map(|()| Op::Remove),
		"preshared_key" => Ok(Op::Preshared(key32(value)?)),
		"endpoint" => Ok(Op::Endpoint(value.parse().map_err(|_| ConfigError::Invalid)?)),
		"persistent_keepalive_interval" => Ok(Op::PersistentKeepalive(value.parse().map_err(|_| ConfigError::Invalid)?)),
		"replace_allowed_ips" => flag(value).map(|()| Op::ReplaceAllowedIps),
		"allowed_ip" => Ok(Op::AllowedIp(value.parse().map_err(|_| ConfigError::Invalid)?)),
		"protocol_version" => (value == "1").then_some(Op::ProtocolVersion).ok_or(ConfigError::Invalid),
		_ => Err(ConfigError::Protocol),
	}
}

/// Read the `set=1` body up to its blank line. The whole request is
/// validated before anything is applied, so a malformed line leaves
/// no partial side effects.
fn read_ops<S: BufRead>(stream: &mut S) -> Result<Vec<Op>, ConfigError> {
	let mut ops = Vec::new();
	let mut in_peer = false;

	loop {
		let mut line = String::new();

		if stream.read_line(&mut line).map_err(|_| ConfigError::Io)? == 0 {
			return Ok(ops);
		}

		let line = line.trim_end_matches('\n');

		if line.is_empty() {
			return Ok(ops);
		}

		let (key, value) = line.split_once('=').ok_or(ConfigError::Protocol)?;
		let op = parse_line(key, value, in_peer)?;

		if matches!(op, Op::Peer(_)) {
			in_peer = true;
		}

		ops.push(op);
	}
}

fn current(peer: &Option<Arc<Peer>>) -> Result<&Arc<Peer>, ConfigError> {
	peer.as_ref().ok_or(ConfigError::Protocol)
}

fn apply(device: &Device, ops: Vec<Op>) -> Result<(), ConfigError> {
	let mut peer: Option<Arc<Peer>> = None;

	for op in ops {
		match op {
			Op::PrivateKey(key) => device.set_private_key(key),
			Op::ListenPort(port) => {
				device.set_listen_port(port).map_err(|e| match e.kind() {
					io::ErrorKind::AddrInUse => ConfigError::AddrInUse,
					_ => ConfigError::Io,
				})?;
			}
			Op::Fwmark(mark) => device.set_fwmark(mark).map_err(|_| ConfigError::Io)?,
			Op::ReplacePeers => device.clear_peers(),
			Op::Peer(public) => peer = Some(device.new_peer(public)?),
			Op::Remove => {
				if let Some(peer) = peer.take() {
					device.remove_peer(&peer.public);
				}
			}
			Op::Preshared(psk) => current(&peer)?.handshake.lock().set_preshared(psk),
			Op::Endpoint(addr) => *current(&peer)?.endpoint.write() = Some(addr),
			Op::PersistentKeepalive(secs) => device.set_persistent_keepalive(current(&peer)?, secs),
			Op::ReplaceAllowedIps => device.clear_allowed_ips(current(&peer)?),
			Op::AllowedIp(net) => device.add_allowed_ip(current(&peer)?, net),
			Op::ProtocolVersion => {}
		}
	}

	Ok(())
}

fn write_state<S: Write>(device: &Device, stream: &mut S) -> io::Result<()> {
	if let Some(key) = device.private_key() {
		writeln!(stream, "private_key={}", hex::encode(key))?;
	}

	let port = device.listen_port();
	if port != 0 {
		writeln!(stream, "listen_port={port}")?;
	}

	let fwmark = device.fwmark();
	if fwmark != 0 {
		writeln!(stream, "fwmark={fwmark}")?;
	}

	for peer in device.peers() {
		writeln!(stream, "public_key={}", hex::encode(peer.public.as_bytes()))?;

		let psk = *peer.handshake.lock().preshared();
		if psk != [0; 32] {
			writeln!(stream, "preshared_key={}", hex::encode(psk))?;
		}

		if let Some(endpoint) = *peer.endpoint.read() {
			writeln!(stream, "endpoint={endpoint}")?;
		}

		let (sec, nsec) = (*peer.last_handshake.lock())
			.and_then(|at| at.duration_since(UNIX_EPOCH).ok())
			.map(|d| (d.as_secs(), d.subsec_nanos()))
			.unwrap_or((0, 0));
		writeln!(stream, "last_handshake_time_sec={sec}")?;
		writeln!(stream, "last_handshake_time_nsec={nsec}")?;

		writeln!(stream, "tx_bytes={}", peer.tx_bytes.load(Ordering::Relaxed))?;
		writeln!(stream, "rx_bytes={}", peer.rx_bytes.load(Ordering::Relaxed))?;
		writeln!(stream, "persistent_keepalive_interval={}", peer.persistent_keepalive.load(Ordering::Relaxed))?;

		for net in device.allowed_ips(&peer) {
			writeln!(stream, "allowed_ip={net}")?;
		}

		writeln!(stream, "protocol_version=1")?;
	}

	write!(stream, "errno=0\n\n")?;
	Ok(())
}

/// Serve one operation from the stream.
pub fn handle<S: BufRead + Write>(device: &Device, stream: &mut S) -> io::Result<()> {
	let mut first = String::new();

	if stream.read_line(&mut first)? == 0 {
		return Ok(());
	}

	match first.trim_end() {
		"get=1" => {
			let mut blank = String::new();
			let _ = stream.read_line(&mut blank)?;
			write_state(device, stream)?;
		}
		"set=1" => {
			let errno = match read_ops(stream).and_then(|ops| apply(device, ops)) {
				Ok(()) => 0,
				Err(e) => {
					debug!("Configuration rejected: {e}");
					e.errno()
				}
			};
			write!(stream, "errno={errno}\n\n")?;
		}
		other => {
			debug!("Unknown control operation {other:?}");
			write!(stream, "errno={}\n\n", ConfigError::Protocol.errno())?;
		}
	}

	stream.flush()
}

#[cfg(test)]
mod tests {
	use std::io::Cursor;

	use super::*;
	use crate::testing::{device_on, Network};

	/// A stream whose input is scripted and whose output is captured.
	struct Duplex {
		input: Cursor<Vec<u8>>,
		output: Vec<u8>,
	}

	impl Duplex {
		fn new(script: &str) -> Self {
			Self { input: Cursor::new(script.as_bytes().to_vec()), output: Vec::new() }
		}

		fn response(&self) -> String {
			String::from_utf8(self.output.clone()).unwrap()
		}
	}

	impl io::Read for Duplex {
		fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
			self.input.read(buf)
		}
	}

	impl BufRead for Duplex {
		fn fill_buf(&mut self) -> io::Result<&[u8]> {
			self.input.fill_buf()
		}

		fn consume(&mut self, amt: usize) {
			self.input.consume(amt)
		}
	}

	impl Write for Duplex {
		fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
			self.output.write(buf)
		}

		fn flush(&mut self) -> io::Result<()> {
			Ok(())
		}
	}

	fn run(device: &Device, script: &str) -> String {
		let mut stream = Duplex::new(script);
		handle(device, &mut stream).unwrap();
		stream.response()
	}

	#[test]
	fn set_then_get() {
		let network = Network::new();
		let dev = device_on(&network, "10.9.9.1:51820");

		let peer_key = hex::encode([0x22u8; 32]);
		let script = format!(
			"set=1\npublic_key={peer_key}\nendpoint=192.0.2.10:51820\nallowed_ip=10.0.0.2/32\nallowed_ip=fd00::/64\npersistent_keepalive_interval=25\nprotocol_version=1\n\n"
		);

		assert_eq!(run(&dev.device, &script), "errno=0\n\n");

		let state = run(&dev.device, "get=1\n\n");

		assert!(state.contains(&format!("public_key={peer_key}")));
		assert!(state.contains("endpoint=192.0.2.10:51820"));
		assert!(state.contains("allowed_ip=10.0.0.2/32"));
		assert!(state.contains("allowed_ip=fd00::/64"));
		assert!(state.contains("persistent_keepalive_interval=25"));
		assert!(state.contains("tx_bytes=0"));
		assert!(state.contains("protocol_version=1"));
		assert!(state.ends_with("errno=0\n\n"));

		dev.device.close();
	}

	#[test]
	fn remove_and_replace_peers() {
		let network = Network::new();
		let dev = device_on(&network, "10.9.9.2:51820");

		let key_a = hex::encode([0x33u8; 32]);
		let key_b = hex::encode([0x44u8; 32]);

		run(&dev.device, &format!("set=1\npublic_key={key_a}\nallowed_ip=10.1.0.1/32\npublic_key={key_b}\n\n"));
		assert_eq!(dev.device.peers().len(), 2);

		// Removing one peer leaves the other.
		assert_eq!(run(&dev.device, &format!("set=1\npublic_key={key_a}\nremove=true\n\n")), "errno=0\n\n");
		assert_eq!(dev.device.peers().len(), 1);

		// replace_peers drops everything before the new section.
		assert_eq!(run(&dev.device, &format!("set=1\nreplace_peers=true\npublic_key={key_a}\n\n")), "errno=0\n\n");
		let peers = dev.device.peers();
		assert_eq!(peers.len(), 1);
		assert_eq!(hex::encode(peers[0].public.as_bytes()), key_a);

		dev.device.close();
	}

	#[test]
	fn malformed_requests_report_errno() {
		let network = Network::new();
		let dev = device_on(&network, "10.9.9.3:51820");

		// Peer key before any peer section: EPROTO.
		assert_eq!(run(&dev.device, "set=1\nallowed_ip=10.0.0.1/32\n\n"), "errno=-71\n\n");

		// Bad hex: EINVAL.
		assert_eq!(run(&dev.device, "set=1\nprivate_key=zz\n\n"), "errno=-22\n\n");

		// Bad CIDR: EINVAL, and the earlier lines leave no peer
		// behind because validation precedes application.
		let key = hex::encode([0x55u8; 32]);
		assert_eq!(run(&dev.device, &format!("set=1\npublic_key={key}\nallowed_ip=banana\n\n")), "errno=-22\n\n");
		assert!(dev.device.peers().is_empty());

		// Unknown operation.
		assert_eq!(run(&dev.device, "frobnicate=1\n\n"), "errno=-71\n\n");

		dev.device.close();
	}

	#[test]
	fn private_key_roundtrip() {
		let network = Network::new();
		let dev = device_on(&network, "10.9.9.4:51820");

		let key = hex::encode(dev.device.private_key().unwrap());
		let state = run(&dev.device, "get=1\n\n");
		assert!(state.contains(&format!("private_key={key}")));

		// An all-zero key clears the identity.
		let zero = hex::encode([0u8; 32]);
		assert_eq!(run(&dev.device, &format!("set=1\nprivate_key={zero}\n\n")), "errno=0\n\n");
		assert!(dev.device.private_key().is_none());

		dev.device.close();
	}
}
