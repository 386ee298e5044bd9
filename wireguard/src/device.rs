//! The device: one local identity, one UDP bind, many peers. Owns
//! the worker pools (encryption, decryption, handshake), the two
//! receive loops, the TUN reader, and every table the pipeline
//! consults.
//!
//! Lock order, outermost first: identity → cookie → peers map → peer
//! handshake → peer keypairs → replay window. The index table and
//! trie take their own short internal locks and are never held across
//! another acquisition.

use core::mem;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use ipnet::IpNet;
use log::{debug, error, info};
use parking_lot::{Mutex, RwLock};
use platform::{Bind, Clock, Tun, TunEvent};
use utils::error::*;
use x25519_dalek::{PublicKey, StaticSecret};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::allowed_ips::AllowedIps;
use crate::cookie::CookieChecker;
use crate::index::{IndexTable, Kind};
use crate::noise::{self, Identity};
use crate::packet::{
	self, CookieReply, Initiation, Response, Transport, COOKIE_REPLY_LEN, INITIATION_LEN, MSG_COOKIE_REPLY, MSG_INITIATION, MSG_RESPONSE,
	MSG_TRANSPORT, PADDING_MULTIPLE, RESPONSE_LEN, TAG_LEN, TRANSPORT_HEADER_LEN, TRANSPORT_OVERHEAD,
};
use crate::peer::Peer;
use crate::pool::{Buf, Pool, MAX_MESSAGE_SIZE};
use crate::queue::{HandshakeJob, Inbound, Outbound, Queue, QUEUE_SIZE};
use crate::ratelimit::RateLimiter;
use crate::session::Keypair;
use crate::timers::REKEY_TIMEOUT;
use crate::uapi::ConfigError;

/// The handshake queue is "under load" at an eighth of its bound.
const UNDER_LOAD_QUEUE_FRACTION: usize = 8;
/// And stays under load this long after last crossing the mark.
const UNDER_LOAD_AFTER_TIME: Duration = Duration::from_secs(1);

pub struct DeviceInner {
	pub clock: Arc<dyn Clock>,
	pub tun: Arc<dyn Tun>,
	pub bind: Arc<dyn Bind>,
	pub identity: RwLock<Option<Identity>>,
	pub cookie: Mutex<Option<CookieChecker>>,
	pub peers: RwLock<HashMap<[u8; 32], Arc<Peer>>>,
	pub allowed: AllowedIps,
	pub index: IndexTable,
	pub limiter: RateLimiter,
	pub pool: Pool,
	pub encrypt_queue: Queue<Arc<Outbound>>,
	pub decrypt_queue: Queue<Arc<Inbound>>,
	pub handshake_queue: Queue<HandshakeJob>,
	up: AtomicBool,
	closed: AtomicBool,
	pub mtu: AtomicUsize,
	fwmark: AtomicU32,
	dropped_packets: AtomicU64,
	under_load_until: Mutex<Option<Instant>>,
	wait_tx: Mutex<Option<Sender<()>>>,
}

pub struct Device {
	inner: Arc<DeviceInner>,
	threads: Mutex<Vec<JoinHandle<()>>>,
	wait_rx: Receiver<()>,
}

fn spawn(name: String, f: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
	std::thread::Builder::new().name(name).spawn(f).expect("failed to spawn device routine")
}

impl Device {
	pub fn new(tun: Arc<dyn Tun>, bind: Arc<dyn Bind>, clock: Arc<dyn Clock>) -> Self {
		let (wait_tx, wait_rx) = bounded(1);

		let inner = Arc::new(DeviceInner {
			clock,
			tun,
			bind,
			identity: RwLock::new(None),
			cookie: Mutex::new(None),
			peers: RwLock::new(HashMap::new()),
			allowed: AllowedIps::new(),
			index: IndexTable::new(),
			limiter: RateLimiter::new(),
			pool: Pool::new(),
			encrypt_queue: Queue::bounded(QUEUE_SIZE),
			decrypt_queue: Queue::bounded(QUEUE_SIZE),
			handshake_queue: Queue::bounded(QUEUE_SIZE),
			up: AtomicBool::new(false),
			closed: AtomicBool::new(false),
			mtu: AtomicUsize::new(1420),
			fwmark: AtomicU32::new(0),
			dropped_packets: AtomicU64::new(0),
			under_load_until: Mutex::new(None),
			wait_tx: Mutex::new(Some(wait_tx)),
		});

		let workers = std::thread::available_parallelism().map(usize::from).unwrap_or(4);
		let mut threads = Vec::new();

		for n in 0..workers {
			let encrypt = Arc::clone(&inner);
			threads.push(spawn(format!("wg-encrypt-{n}"), move || worker_encrypt(encrypt)));

			let decrypt = Arc::clone(&inner);
			threads.push(spawn(format!("wg-decrypt-{n}"), move || worker_decrypt(decrypt)));

			let handshake = Arc::clone(&inner);
			threads.push(spawn(format!("wg-handshake-{n}"), move || worker_handshake(handshake)));
		}

		for v4 in [true, false] {
			let recv = Arc::clone(&inner);
			threads.push(spawn(format!("wg-recv-v{}", if v4 { 4 } else { 6 }), move || routine_recv(recv, v4)));
		}

		let reader = Arc::clone(&inner);
		threads.push(spawn("wg-tun-read".into(), move || routine_tun(reader)));

		let events = Arc::clone(&inner);
		threads.push(spawn("wg-tun-events".into(), move || routine_events(events)));

		info!("Device started with {workers} workers per pool");

		Self { inner, threads: Mutex::new(threads), wait_rx }
	}

	/// Unblocks on a fatal resource error or on close.
	pub fn wait(&self) -> Receiver<()> {
		self.wait_rx.clone()
	}

	pub fn up(&self) {
		self.inner.set_up(true);
	}

	pub fn down(&self) {
		self.inner.set_up(false);
	}

	pub fn is_up(&self) -> bool {
		self.inner.is_up()
	}

	/// Tear the device down: stop peers, zero keys, join every
	/// routine. Idempotent.
	pub fn close(&self) {
		let inner = &self.inner;

		inner.closed.store(true, Ordering::Release);
		inner.bind.close();
		inner.tun.close();

		inner.clear_peers();

		inner.encrypt_queue.close();
		inner.decrypt_queue.close();
		inner.handshake_queue.close();

		let threads = mem::take(&mut *self.threads.lock());
		let first_close = !threads.is_empty();

		for handle in threads {
			let _ = handle.join();
		}

		if let Some(tx) = inner.wait_tx.lock().take() {
			let _ = tx.send(());
		}

		if first_close {
			info!("Device closed ({} packets shed)", inner.dropped_packets.load(Ordering::Relaxed));
		}
	}

	pub fn set_private_key(&self, key: Option<StaticSecret>) {
		self.inner.set_private_key(key);
	}

	pub fn private_key(&self) -> Option<[u8; 32]> {
		self.inner.identity.read().as_ref().map(|id| id.key.to_bytes())
	}

	pub fn public_key(&self) -> Option<[u8; 32]> {
		self.inner.identity.read().as_ref().map(|id| id.public.to_bytes())
	}

	pub fn listen_port(&self) -> u16 {
		self.inner.bind.port()
	}

	pub fn set_listen_port(&self, port: u16) -> io::Result<u16> {
		self.inner.bind.rebind(port)
	}

	pub fn fwmark(&self) -> u32 {
		self.inner.fwmark.load(Ordering::Relaxed)
	}

	pub fn set_fwmark(&self, mark: u32) -> io::Result<()> {
		self.inner.bind.set_mark(mark)?;
		self.inner.fwmark.store(mark, Ordering::Relaxed);
		Ok(())
	}

	pub fn new_peer(&self, public: PublicKey) -> Result<Arc<Peer>, ConfigError> {
		self.inner.new_peer(public)
	}

	pub fn peer(&self, public: &PublicKey) -> Option<Arc<Peer>> {
		self.inner.peers.read().get(public.as_bytes()).cloned()
	}

	pub fn peers(&self) -> Vec<Arc<Peer>> {
		self.inner.peers.read().values().cloned().collect()
	}

	pub fn remove_peer(&self, public: &PublicKey) {
		self.inner.remove_peer(public);
	}

	pub fn clear_peers(&self) {
		self.inner.clear_peers();
	}

	pub fn set_persistent_keepalive(&self, peer: &Arc<Peer>, interval: u16) {
		peer.persistent_keepalive.store(interval.into(), Ordering::Relaxed);

		if peer.is_running() {
			peer.timers.persistent_changed(self.inner.clock.now(), interval.into());
		}
	}

	pub fn add_allowed_ip(&self, peer: &Arc<Peer>, net: IpNet) {
		self.inner.allowed.insert(net, peer);
	}

	pub fn clear_allowed_ips(&self, peer: &Arc<Peer>) {
		self.inner.allowed.remove_peer(peer);
	}

	pub fn allowed_ips(&self, peer: &Arc<Peer>) -> Vec<IpNet> {
		self.inner.allowed.entries_for_peer(peer)
	}

	/// Packets shed by the drop-oldest overflow policy so far.
	pub fn dropped_packets(&self) -> u64 {
		self.inner.dropped_packets.load(Ordering::Relaxed)
	}
}

impl Drop for Device {
	fn drop(&mut self) {
		self.close();
	}
}

impl DeviceInner {
	pub fn is_up(&self) -> bool {
		self.up.load(Ordering::Acquire)
	}

	fn set_up(&self, up: bool) {
		if self.up.swap(up, Ordering::AcqRel) == up {
			return;
		}

		info!("Device {}", if up { "up" } else { "down" });

		if up {
			if let Ok(mtu) = self.tun.mtu() {
				self.mtu.store(mtu, Ordering::Relaxed);
			}
		}

		let peers: Vec<_> = self.peers.read().values().cloned().collect();
		for peer in peers {
			if up {
				peer.start();
			} else {
				peer.stop();
			}
		}
	}

	fn set_private_key(&self, key: Option<StaticSecret>) {
		let mut identity = self.identity.write();
		let new = key.map(Identity::new);

		*self.cookie.lock() = new.as_ref().map(|id| CookieChecker::new(&id.public));

		// A new static key invalidates every precomputed ECDH value
		// and any handshake built on the old ones.
		for peer in self.peers.read().values() {
			let mut handshake = peer.handshake.lock();
			handshake.clear();

			if let Some(id) = new.as_ref() {
				handshake.precompute(id);
			}
		}

		*identity = new;
	}

	fn new_peer(self: &Arc<Self>, public: PublicKey) -> Result<Arc<Peer>, ConfigError> {
		let identity = self.identity.read();

		if identity.as_ref().is_some_and(|id| id.public == public) {
			return Err(ConfigError::Invalid);
		}

		let mut peers = self.peers.write();

		if let Some(existing) = peers.get(public.as_bytes()) {
			return Ok(Arc::clone(existing));
		}

		let peer = Peer::new(public, identity.as_ref(), Arc::downgrade(self));
		peers.insert(*public.as_bytes(), Arc::clone(&peer));

		drop(peers);
		drop(identity);

		if self.is_up() {
			peer.start();
		}

		Ok(peer)
	}

	fn remove_peer(&self, public: &PublicKey) {
		let peer = self.peers.write().remove(public.as_bytes());

		if let Some(peer) = peer {
			peer.stop();
			self.allowed.remove_peer(&peer);
		}
	}

	fn clear_peers(&self) {
		let peers: Vec<_> = self.peers.write().drain().map(|(_, peer)| peer).collect();

		for peer in peers {
			peer.stop();
			self.allowed.remove_peer(&peer);
		}
	}

	/// Resource failure: stop the world and unblock the supervisor.
	fn shutdown(&self) {
		self.closed.store(true, Ordering::Release);
		self.bind.close();
		self.tun.close();

		if let Some(tx) = self.wait_tx.lock().take() {
			let _ = tx.send(());
		}
	}

	pub fn count_dropped(&self, n: usize) {
		if n > 0 {
			let total = self.dropped_packets.fetch_add(n as u64, Ordering::Relaxed) + n as u64;
			debug!("Pipeline shed {n} packet(s) under pressure ({total} total)");
		}
	}

	fn under_load(&self, now: Instant) -> bool {
		self.under_load_until.lock().is_some_and(|until| now < until)
	}

	/// Remove a superseded handshake index, leaving keypair bindings
	/// (which share ids with the handshakes they came from) alone.
	fn release_handshake_index(&self, prev: u32, new: u32) {
		if prev != 0 && prev != new {
			if let Some(entry) = self.index.lookup(prev) {
				if matches!(entry.kind, Kind::Handshake) {
					self.index.remove(prev);
				}
			}
		}
	}

	/// Unregister keypairs displaced from a peer's slots.
	pub fn release_keypairs(&self, displaced: Vec<Arc<Keypair>>) {
		for keypair in displaced {
			self.index.remove(keypair.local_index);
		}
	}

	/// Zeroize a peer's sessions and handshake state.
	pub fn zero_keys(&self, peer: &Arc<Peer>) {
		let displaced = peer.keypairs.lock().clear();
		self.release_keypairs(displaced);

		let mut handshake = peer.handshake.lock();
		self.release_handshake_index(handshake.local_index, 0);
		handshake.clear();
	}

	/// Stage an empty transport packet.
	pub fn send_keepalive(&self, peer: &Arc<Peer>) {
		if !peer.is_running() {
			return;
		}

		debug!("{peer}: sending keep-alive");

		let mut buf = self.pool.get();
		buf.resize(TRANSPORT_HEADER_LEN, 0);
		self.count_dropped(peer.stage(buf));
	}

	/// Start (or retransmit) a handshake with `peer`, paced to one
	/// initiation per `REKEY_TIMEOUT`.
	pub fn initiate_handshake(&self, peer: &Arc<Peer>) {
		let identity = self.identity.read();
		let Some(identity) = identity.as_ref() else { return };

		let now = self.clock.now();
		let mut handshake = peer.handshake.lock();

		if handshake.last_sent_initiation.is_some_and(|last| now.saturating_duration_since(last) < REKEY_TIMEOUT) {
			return;
		}
		handshake.last_sent_initiation = Some(now);

		let prev = handshake.local_index;
		let local_index = self.index.new_index(peer);
		self.release_handshake_index(prev, local_index);

		let mut msg = Initiation::new_zeroed();
		handshake.create_initiation(identity, local_index, self.clock.system(), &mut msg);
		peer.cookie.lock().stamp(msg.as_bytes_mut(), now);

		drop(handshake);

		info!("{peer}: sending handshake initiation");

		if self.send_to_peer(peer, msg.as_bytes()).is_ok() {
			peer.timers.handshake_initiated(now);
		}
	}

	fn send_to_peer(&self, peer: &Arc<Peer>, data: &[u8]) -> Result {
		let endpoint = *peer.endpoint.read();
		let Some(endpoint) = endpoint else {
			debug!("{peer}: no known endpoint");
			return Err(());
		};

		self.bind.send(data, endpoint).map_err(|e| debug!("{peer}: send failed: {e}"))?;
		peer.tx_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);

		Ok(())
	}

	/// Classify one datagram off the bind.
	fn dispatch(&self, buf: Buf, src: SocketAddr) {
		match packet::message_type(&buf) {
			Some(MSG_INITIATION) if buf.len() == INITIATION_LEN => self.queue_handshake(buf, src),
			Some(MSG_RESPONSE) if buf.len() == RESPONSE_LEN => self.queue_handshake(buf, src),
			Some(MSG_COOKIE_REPLY) if buf.len() == COOKIE_REPLY_LEN => self.queue_handshake(buf, src),
			Some(MSG_TRANSPORT) if buf.len() >= TRANSPORT_OVERHEAD => self.dispatch_transport(buf, src),
			Some(t) => debug!("Dropping message from {src} with bad type or length ({t}, {} bytes)", buf.len()),
			None => {}
		}
	}

	fn queue_handshake(&self, buf: Buf, src: SocketAddr) {
		if (self.handshake_queue.len() + 1) * UNDER_LOAD_QUEUE_FRACTION >= self.handshake_queue.capacity() {
			let now = self.clock.now();
			let mut until = self.under_load_until.lock();

			if until.is_none() {
				info!("Handshake queue under load");
			}
			*until = Some(now + UNDER_LOAD_AFTER_TIME);
		}

		self.count_dropped(self.handshake_queue.push(HandshakeJob { buf, src }));
	}

	fn dispatch_transport(&self, buf: Buf, src: SocketAddr) {
		let header = Transport::ref_from_prefix(&buf).expect("length was checked");
		let receiver = header.receiver.get();
		let counter = header.counter.get();

		let Some(entry) = self.index.lookup(receiver) else {
			debug!("Transport packet for unknown session {receiver:#010x}");
			return;
		};

		let Kind::Keypair(keypair) = entry.kind else {
			debug!("Transport packet for a session still handshaking");
			return;
		};

		if !entry.peer.is_running() {
			return;
		}

		if keypair.recv_expired(self.clock.now()) {
			debug!("Transport packet on an expired session");
			return;
		}

		let elem = Inbound::new(buf, counter, keypair, entry.peer, src);
		self.count_dropped(elem.peer.inbound.push(Arc::clone(&elem)));
		self.count_dropped(self.decrypt_queue.push(elem));
	}

	/// Transport header, padding and seal, in place.
	fn seal_outbound(&self, elem: &Outbound) {
		let mut buf = elem.buf.lock();
		let plain = buf.len() - TRANSPORT_HEADER_LEN;

		// Zero-pad to the cipher multiple, bounded by the MTU. An
		// empty keep-alive stays empty.
		let mtu = self.mtu.load(Ordering::Relaxed);
		let padded = plain.div_ceil(PADDING_MULTIPLE) * PADDING_MULTIPLE;
		let padded = padded.min(mtu).max(plain);

		buf.resize(TRANSPORT_HEADER_LEN + padded, 0);

		let header = Transport {
			tag: MSG_TRANSPORT.into(),
			receiver: elem.keypair.remote_index.into(),
			counter: elem.counter.into(),
		};
		buf[..TRANSPORT_HEADER_LEN].copy_from_slice(header.as_bytes());

		let tag = elem.keypair.seal(elem.counter, &mut buf[TRANSPORT_HEADER_LEN..]);
		buf.extend_from_slice(&tag);
	}

	/// AEAD open in place; success drops the trailing tag and flags
	/// the element for the sequential receiver.
	fn open_inbound(&self, elem: &Inbound) {
		let mut buf = elem.buf.lock();

		if buf.len() < TRANSPORT_OVERHEAD {
			return;
		}

		let split = buf.len() - TAG_LEN;
		let (rest, tag) = buf.split_at_mut(split);

		if elem.keypair.open(elem.counter, &mut rest[TRANSPORT_HEADER_LEN..], tag).is_ok() {
			buf.truncate(split);
			elem.ok.store(true, Ordering::Release);
		}
	}

	/// Route one packet read from the TUN to the peer owning its
	/// destination.
	fn route_outbound(&self, buf: Buf) {
		if !self.is_up() {
			return;
		}

		let dst = match net::ip::Packet::parse(&buf[TRANSPORT_HEADER_LEN..]) {
			Ok(packet) => packet.dst(),
			Err(()) => return,
		};

		let Some(peer) = self.allowed.lookup(dst) else {
			debug!("No peer routes {dst}");
			return;
		};

		if !peer.is_running() {
			return;
		}

		self.count_dropped(peer.stage(buf));
	}

	fn handle_handshake(&self, mut job: HandshakeJob) {
		let now = self.clock.now();

		if packet::message_type(&job.buf) == Some(MSG_COOKIE_REPLY) {
			let _ = self.consume_cookie_reply(&mut job.buf, now);
			return;
		}

		{
			let cookie = self.cookie.lock();
			let Some(checker) = cookie.as_ref() else { return };

			if checker.check_mac1(&job.buf).is_err() {
				return;
			}
		}

		if self.under_load(now) {
			let mac2_ok = self.cookie.lock().as_ref().is_some_and(|checker| checker.check_mac2(&job.buf, &job.src, now).is_ok());

			if !mac2_ok {
				self.send_cookie_reply(&job, now);
				return;
			}

			if !self.limiter.allow(job.src.ip(), now) {
				debug!("Rate limiter dropped handshake message from {}", job.src);
				return;
			}
		}

		let _ = match packet::message_type(&job.buf) {
			Some(MSG_INITIATION) => self.consume_initiation(&mut job, now),
			Some(MSG_RESPONSE) => self.consume_response(&mut job, now),
			_ => Ok(()),
		};
	}

	fn send_cookie_reply(&self, job: &HandshakeJob, now: Instant) {
		// The sender index sits right after the type in both
		// handshake messages.
		let Some(sender) = job.buf.get(4..8).map(|b| u32::from_le_bytes(b.try_into().unwrap())) else {
			return;
		};

		let mut reply = CookieReply::new_zeroed();

		let sealed = {
			let mut cookie = self.cookie.lock();
			let Some(checker) = cookie.as_mut() else { return };
			checker.create_reply(&job.buf, sender, &job.src, now, &mut reply).is_ok()
		};

		if sealed {
			debug!("Answering {} with a cookie reply", job.src);
			let _ = self.bind.send(reply.as_bytes(), job.src).ok_or(|e| debug!("Cookie reply not sent: {e}"));
		}
	}

	fn consume_initiation(&self, job: &mut HandshakeJob, now: Instant) -> Result {
		let identity = self.identity.read();
		let Some(identity) = identity.as_ref() else { return Err(()) };

		let msg = Initiation::mut_from(&mut job.buf[..]).ok_or(())?;

		let (hash, chain, claimed) = noise::open_initiation(identity, msg)?;

		let peer = self
			.peers
			.read()
			.get(claimed.as_bytes())
			.cloned()
			.ok_or_else(|| debug!("Initiation from unknown public key"))?;

		if !peer.is_running() {
			return Err(());
		}

		peer.handshake.lock().consume_initiation(hash, chain, now, msg)?;

		info!("{peer}: consumed handshake initiation from {}", job.src);

		// Learn the source now so the response has somewhere to go.
		*peer.endpoint.write() = Some(job.src);

		self.send_handshake_response(&peer, now)
	}

	fn send_handshake_response(&self, peer: &Arc<Peer>, now: Instant) -> Result {
		let local_index = self.index.new_index(peer);
		let mut msg = Response::new_zeroed();

		let keys = {
			let mut handshake = peer.handshake.lock();
			let prev = handshake.local_index;

			match handshake.create_response(local_index, &mut msg) {
				Ok(keys) => {
					self.release_handshake_index(prev, local_index);
					keys
				}
				Err(()) => {
					self.index.remove(local_index);
					return Err(());
				}
			}
		};

		let keypair = Arc::new(Keypair::new(&keys, now));

		// The response's own index doubles as the session's receive
		// index.
		self.index.swap_keypair(local_index, Arc::clone(&keypair));

		{
			let mut slots = peer.keypairs.lock();
			let displaced = slots.install(keypair);
			self.release_keypairs(displaced);
		}

		peer.timers.session_derived(now);
		*peer.last_handshake.lock() = Some(self.clock.system());

		peer.cookie.lock().stamp(msg.as_bytes_mut(), now);

		info!("{peer}: sending handshake response");
		self.send_to_peer(peer, msg.as_bytes())
	}

	fn consume_response(&self, job: &mut HandshakeJob, now: Instant) -> Result {
		let identity = self.identity.read();
		let Some(identity) = identity.as_ref() else { return Err(()) };

		let msg = Response::mut_from(&mut job.buf[..]).ok_or(())?;
		let receiver = msg.receiver.get();

		let entry = self.index.lookup(receiver).ok_or_else(|| debug!("Response for an unknown index"))?;

		if !matches!(entry.kind, Kind::Handshake) {
			debug!("Response for a session already established");
			return Err(());
		}

		let peer = entry.peer;

		if !peer.is_running() {
			return Err(());
		}

		let keys = {
			let mut handshake = peer.handshake.lock();

			if handshake.local_index != receiver {
				debug!("Response does not match the handshake in flight");
				return Err(());
			}

			handshake.consume_response(identity, msg)?
		};

		info!("{peer}: handshake complete");

		*peer.endpoint.write() = Some(job.src);

		let keypair = Arc::new(Keypair::new(&keys, now));
		self.index.swap_keypair(receiver, Arc::clone(&keypair));

		{
			let mut slots = peer.keypairs.lock();
			let displaced = slots.install(keypair);
			self.release_keypairs(displaced);
		}

		peer.timers.handshake_complete();
		peer.timers.session_derived(now);
		*peer.last_handshake.lock() = Some(self.clock.system());
		peer.notify_keypair();

		// Confirm the session immediately so the responder can rotate
		// `next` in; staged traffic does the same job if there is any.
		if peer.staged.is_empty() {
			self.send_keepalive(&peer);
		}

		Ok(())
	}

	fn consume_cookie_reply(&self, buf: &mut [u8], now: Instant) -> Result {
		let msg = CookieReply::mut_from(buf).ok_or(())?;

		let entry = self.index.lookup(msg.receiver.get()).ok_or_else(|| debug!("Cookie reply for an unknown index"))?;

		let result = entry.peer.cookie.lock().consume_reply(msg, now);
		result
	}
}

fn worker_encrypt(inner: Arc<DeviceInner>) {
	while let Some(elem) = inner.encrypt_queue.pop() {
		if !elem.dropped.load(Ordering::Acquire) {
			inner.seal_outbound(&elem);
		}
		elem.ready.set();
	}
}

fn worker_decrypt(inner: Arc<DeviceInner>) {
	while let Some(elem) = inner.decrypt_queue.pop() {
		if !elem.dropped.load(Ordering::Acquire) {
			inner.open_inbound(&elem);
		}
		elem.ready.set();
	}
}

fn worker_handshake(inner: Arc<DeviceInner>) {
	while let Some(job) = inner.handshake_queue.pop() {
		inner.handle_handshake(job);
	}
}

fn routine_recv(inner: Arc<DeviceInner>, v4: bool) {
	loop {
		if inner.closed.load(Ordering::Acquire) {
			break;
		}

		let mut buf = inner.pool.get();
		buf.resize(MAX_MESSAGE_SIZE, 0);

		let result = if v4 { inner.bind.recv_v4(&mut buf) } else { inner.bind.recv_v6(&mut buf) };

		match result {
			Ok((n, src)) => {
				buf.truncate(n);
				inner.dispatch(buf, src);
			}
			Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => {}
			Err(e) => {
				if !inner.closed.load(Ordering::Acquire) {
					error!("Receive loop failed: {e}");
					inner.shutdown();
				}
				break;
			}
		}
	}
}

fn routine_tun(inner: Arc<DeviceInner>) {
	loop {
		if inner.closed.load(Ordering::Acquire) {
			break;
		}

		let mut buf = inner.pool.get();
		// Leave room for padding and the trailing tag.
		buf.resize(MAX_MESSAGE_SIZE - TRANSPORT_OVERHEAD, 0);

		match inner.tun.read(&mut buf, TRANSPORT_HEADER_LEN) {
			Ok(0) => {}
			Ok(n) => {
				buf.truncate(TRANSPORT_HEADER_LEN + n);
				inner.route_outbound(buf);
			}
			Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => {}
			Err(e) => {
				if !inner.closed.load(Ordering::Acquire) {
					error!("TUN reader failed: {e}");
					inner.shutdown();
				}
				break;
			}
		}
	}
}

fn routine_events(inner: Arc<DeviceInner>) {
	let events = inner.tun.events();

	loop {
		if inner.closed.load(Ordering::Acquire) {
			break;
		}

		match events.recv_timeout(Duration::from_millis(250)) {
			Ok(TunEvent::Up(mtu)) => {
				inner.mtu.store(mtu, Ordering::Relaxed);
				inner.set_up(true);
			}
			Ok(TunEvent::Down) => inner.set_up(false),
			Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
			Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
		}
	}
}

#[cfg(test)]
mod tests {
	use std::thread::sleep;

	use super::*;
	use crate::testing::{connect, device_on, ipv4, Network};

	const LONG: Duration = Duration::from_secs(10);
	const SHORT: Duration = Duration::from_millis(500);

	#[test]
	fn handshake_and_echo() {
		let network = Network::new();
		let a = device_on(&network, "203.0.113.1:51820");
		let b = device_on(&network, "203.0.113.2:51820");
		connect(&a, &b, "10.0.0.1", "10.0.0.2");

		let ping = ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64);
		a.tun.inject.send(ping.clone()).unwrap();

		assert_eq!(b.tun.deliver.recv_timeout(LONG).expect("ping crosses the tunnel"), ping);

		// The reply rides the session that already exists.
		let pong = ipv4([10, 0, 0, 2], [10, 0, 0, 1], 32);
		b.tun.inject.send(pong.clone()).unwrap();
		assert_eq!(a.tun.deliver.recv_timeout(LONG).expect("reply crosses back"), pong);

		// One initiation, one response, and transport both ways.
		assert!(!network.sent_to(b.addr, MSG_INITIATION).is_empty());
		assert!(!network.sent_to(a.addr, MSG_RESPONSE).is_empty());
		assert!(network.sent_to(b.addr, MSG_INITIATION)[0].len() == INITIATION_LEN);
		assert!(network.sent_to(a.addr, MSG_RESPONSE)[0].len() == RESPONSE_LEN);
		assert!(!network.sent_to(b.addr, MSG_TRANSPORT).is_empty());
		assert!(!network.sent_to(a.addr, MSG_TRANSPORT).is_empty());

		// Both ends recorded the completed handshake.
		assert!(a.device.peer(&b.public).unwrap().last_handshake.lock().is_some());
		assert!(b.device.peer(&a.public).unwrap().last_handshake.lock().is_some());

		// Counters moved.
		assert!(a.device.peer(&b.public).unwrap().tx_bytes.load(Ordering::Relaxed) > 0);
		assert!(b.device.peer(&a.public).unwrap().rx_bytes.load(Ordering::Relaxed) > 0);

		a.device.close();
		b.device.close();
	}

	#[test]
	fn replayed_transport_dropped() {
		let network = Network::new();
		let a = device_on(&network, "203.0.113.11:51820");
		let b = device_on(&network, "203.0.113.12:51820");
		connect(&a, &b, "10.1.0.1", "10.1.0.2");

		let ping = ipv4([10, 1, 0, 1], [10, 1, 0, 2], 64);
		a.tun.inject.send(ping.clone()).unwrap();
		assert_eq!(b.tun.deliver.recv_timeout(LONG).unwrap(), ping);

		// Capture the data-carrying transport datagram (keep-alives
		// are exactly the overhead size).
		let captured = network
			.sent_to(b.addr, MSG_TRANSPORT)
			.into_iter()
			.find(|d| d.len() > TRANSPORT_OVERHEAD)
			.expect("the ping was observed on the wire");

		let peer = b.device.peer(&a.public).unwrap();
		sleep(SHORT);
		let rx_before = peer.rx_bytes.load(Ordering::Relaxed);

		network.inject(b.addr, a.addr, captured);

		// The replay authenticates but fails the window check: no
		// delivery, no counted bytes.
		assert!(b.tun.deliver.recv_timeout(SHORT).is_err());
		assert_eq!(peer.rx_bytes.load(Ordering::Relaxed), rx_before);

		a.device.close();
		b.device.close();
	}

	#[test]
	fn disallowed_inner_source_dropped() {
		let network = Network::new();
		let a = device_on(&network, "203.0.113.21:51820");
		let b = device_on(&network, "203.0.113.22:51820");
		connect(&a, &b, "10.2.0.1", "10.2.0.2");

		// Prove the path with an allowed packet first.
		let legit = ipv4([10, 2, 0, 2], [10, 2, 0, 1], 40);
		b.tun.inject.send(legit.clone()).unwrap();
		assert_eq!(a.tun.deliver.recv_timeout(LONG).unwrap(), legit);

		// Same tunnel, forged inner source: decrypts fine, fails the
		// reverse-path check.
		b.tun.inject.send(ipv4([10, 2, 0, 99], [10, 2, 0, 1], 40)).unwrap();
		assert!(a.tun.deliver.recv_timeout(SHORT).is_err());

		a.device.close();
		b.device.close();
	}

	#[test]
	fn under_load_cookie_roundtrip() {
		let network = Network::new();
		let a = device_on(&network, "203.0.113.31:51820");
		let b = device_on(&network, "203.0.113.32:51820");
		connect(&a, &b, "10.3.0.1", "10.3.0.2");

		// Pin the responder under load before any handshake arrives.
		*b.device.inner.under_load_until.lock() = Some(b.device.inner.clock.now() + Duration::from_secs(3600));

		let ping = ipv4([10, 3, 0, 1], [10, 3, 0, 2], 64);
		a.tun.inject.send(ping.clone()).unwrap();

		// The mac2-less initiation earns a cookie reply, not a
		// response.
		let deadline = Instant::now() + LONG;
		while network.sent_to(a.addr, MSG_COOKIE_REPLY).is_empty() {
			assert!(Instant::now() < deadline, "expected a cookie reply");
			sleep(Duration::from_millis(20));
		}
		assert!(network.sent_to(a.addr, MSG_RESPONSE).is_empty());

		// Give the initiator a moment to absorb the cookie, then let
		// it retry immediately instead of waiting out the pacing.
		sleep(SHORT);
		let peer = a.device.peer(&b.public).unwrap();
		peer.handshake.lock().last_sent_initiation = None;
		a.device.inner.initiate_handshake(&peer);

		// The mac2-carrying retry completes the handshake and the
		// staged ping flows.
		assert_eq!(b.tun.deliver.recv_timeout(LONG).expect("handshake completes under load"), ping);

		a.device.close();
		b.device.close();
	}

	#[test]
	fn persistent_keepalive_flows() {
		let network = Network::new();
		let a = device_on(&network, "203.0.113.41:51820");
		let b = device_on(&network, "203.0.113.42:51820");
		connect(&a, &b, "10.4.0.1", "10.4.0.2");

		let peer = a.device.peer(&b.public).unwrap();
		a.device.set_persistent_keepalive(&peer, 1);

		let ping = ipv4([10, 4, 0, 1], [10, 4, 0, 2], 64);
		a.tun.inject.send(ping).unwrap();
		assert!(b.tun.deliver.recv_timeout(LONG).is_ok());

		let remote = b.device.peer(&a.public).unwrap();
		let rx_before = remote.rx_bytes.load(Ordering::Relaxed);

		// At a one-second interval, two and a half seconds of silence
		// must carry at least one keep-alive, and none of it reaches
		// the far TUN.
		sleep(Duration::from_millis(2500));
		assert!(remote.rx_bytes.load(Ordering::Relaxed) > rx_before);
		assert!(b.tun.deliver.try_recv().is_err());

		a.device.close();
		b.device.close();
	}

	#[test]
	fn down_up_cycle() {
		let network = Network::new();
		let a = device_on(&network, "203.0.113.51:51820");
		let b = device_on(&network, "203.0.113.52:51820");
		connect(&a, &b, "10.5.0.1", "10.5.0.2");

		let ping = ipv4([10, 5, 0, 1], [10, 5, 0, 2], 24);
		a.tun.inject.send(ping.clone()).unwrap();
		assert_eq!(b.tun.deliver.recv_timeout(LONG).unwrap(), ping);

		a.device.down();
		assert!(!a.device.is_up());

		// Down means no traffic and zeroed sessions.
		a.tun.inject.send(ping.clone()).unwrap();
		assert!(b.tun.deliver.recv_timeout(SHORT).is_err());
		assert!(a.device.peer(&b.public).unwrap().keypairs.lock().current.is_none());

		// Up again: a fresh handshake carries new traffic.
		a.device.up();
		a.tun.inject.send(ping.clone()).unwrap();
		assert_eq!(b.tun.deliver.recv_timeout(LONG).unwrap(), ping);

		a.device.close();
		b.device.close();
	}

	#[test]
	fn unknown_session_ignored() {
		let network = Network::new();
		let a = device_on(&network, "203.0.113.61:51820");
		let b = device_on(&network, "203.0.113.62:51820");
		connect(&a, &b, "10.6.0.1", "10.6.0.2");

		// A transport packet for an index nobody owns is dropped on
		// the floor.
		let mut bogus = vec![0u8; 64];
		bogus[..4].copy_from_slice(&MSG_TRANSPORT.to_le_bytes());
		bogus[4..8].copy_from_slice(&0xdead_beefu32.to_le_bytes());
		network.inject(b.addr, a.addr, bogus);

		assert!(b.tun.deliver.recv_timeout(SHORT).is_err());
		assert_eq!(b.device.dropped_packets(), 0);

		a.device.close();
		b.device.close();
	}
}
