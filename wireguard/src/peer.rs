//! A remote peer: its handshake, keypair slots, cached endpoint,
//! counters and queues, plus the four long-lived routines attached to
//! it while it runs (staging, sequential sender, sequential receiver,
//! timer scheduler).

use core::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use utils::error::*;
use x25519_dalek::PublicKey;

use crate::cookie::CookieGenerator;
use crate::device::DeviceInner;
use crate::noise::{Handshake, Identity};
use crate::packet::{TRANSPORT_HEADER_LEN, TRANSPORT_OVERHEAD};
use crate::pool::Buf;
use crate::queue::{Inbound, Outbound, Queue, QUEUE_SIZE};
use crate::session::{Keypair, Slots};
use crate::timers::{TimerKind, Timers, MAX_TIMER_HANDSHAKES, REKEY_ATTEMPT_TIME, REKEY_TIMEOUT};

pub struct Peer {
	pub public: PublicKey,
	pub handshake: Mutex<Handshake>,
	pub cookie: Mutex<CookieGenerator>,
	pub keypairs: Mutex<Slots>,
	/// Signaled (with the keypair lock) when a fresh session lands.
	keypair_ready: Condvar,
	pub endpoint: RwLock<Option<SocketAddr>>,
	pub timers: Timers,
	/// Seconds; zero disables the persistent keep-alive.
	pub persistent_keepalive: AtomicU32,
	pub tx_bytes: AtomicU64,
	pub rx_bytes: AtomicU64,
	pub last_handshake: Mutex<Option<SystemTime>>,
	running: AtomicBool,
	/// Plaintext staged for a nonce.
	pub staged: Queue<Buf>,
	/// Ciphertext awaiting the sequential sender, in staging order.
	pub outbound: Queue<Arc<Outbound>>,
	/// Transport packets awaiting the sequential receiver, in wire
	/// order.
	pub inbound: Queue<Arc<Inbound>>,
	/// Never followed during drop; the device owns its peers.
	device: Weak<DeviceInner>,
	routines: Mutex<Vec<JoinHandle<()>>>,
}

impl Peer {
	pub fn new(public: PublicKey, identity: Option<&Identity>, device: Weak<DeviceInner>) -> Arc<Self> {
		Arc::new(Self {
			handshake: Mutex::new(Handshake::new(public, identity)),
			cookie: Mutex::new(CookieGenerator::new(&public)),
			public,
			keypairs: Mutex::new(Slots::default()),
			keypair_ready: Condvar::new(),
			endpoint: RwLock::new(None),
			timers: Timers::new(),
			persistent_keepalive: AtomicU32::new(0),
			tx_bytes: AtomicU64::new(0),
			rx_bytes: AtomicU64::new(0),
			last_handshake: Mutex::new(None),
			running: AtomicBool::new(false),
			staged: Queue::bounded(QUEUE_SIZE),
			outbound: Queue::bounded(QUEUE_SIZE),
			inbound: Queue::bounded(QUEUE_SIZE),
			device,
			routines: Mutex::new(Vec::new()),
		})
	}

	pub fn device(&self) -> Option<Arc<DeviceInner>> {
		self.device.upgrade()
	}

	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::Acquire)
	}

	/// Queue an outbound packet (header space already reserved),
	/// returning how many staged packets were shed to make room.
	pub fn stage(&self, buf: Buf) -> usize {
		self.staged.push(buf)
	}

	/// Wake the staging routine after a keypair change.
	pub(crate) fn notify_keypair(&self) {
		// The waiter holds the keypair lock; taking it here orders the
		// wake after its sleep.
		let _slots = self.keypairs.lock();
		self.keypair_ready.notify_all();
	}

	/// Attach the four per-peer routines. No-op while running.
	pub fn start(self: &Arc<Self>) {
		if self.running.swap(true, Ordering::AcqRel) {
			return;
		}

		info!("{self}: starting");

		self.timers.restart();
		self.staged.reopen();
		self.outbound.reopen();
		self.inbound.reopen();

		let mut routines = self.routines.lock();

		for (name, f) in [
			("stage", Self::routine_staged as fn(Arc<Self>)),
			("send", Self::routine_send),
			("recv", Self::routine_receive),
			("timer", Self::routine_timers),
		] {
			let peer = Arc::clone(self);
			let handle = std::thread::Builder::new()
				.name(format!("wg-peer-{name}"))
				.spawn(move || f(peer))
				.expect("failed to spawn peer routine");
			routines.push(handle);
		}
	}

	/// Detach the routines, drain the queues and shred key material.
	/// Must not be called from one of the peer's own routines.
	pub fn stop(self: &Arc<Self>) {
		if !self.running.swap(false, Ordering::AcqRel) {
			return;
		}

		info!("{self}: stopping");

		self.timers.stop();
		self.staged.close();
		self.outbound.close();
		self.inbound.close();
		self.notify_keypair();

		let routines = core::mem::take(&mut *self.routines.lock());
		for handle in routines {
			let _ = handle.join();
		}

		self.staged.flush();
		self.outbound.flush();
		self.inbound.flush();

		if let Some(device) = self.device() {
			device.zero_keys(self);
		} else {
			self.keypairs.lock().clear();
			self.handshake.lock().clear();
		}
	}

	/// Block until a keypair usable for sending exists, requesting
	/// handshakes while none does. `None` flushes the packet: the
	/// peer stopped or the attempt deadline passed.
	fn sending_keypair(self: &Arc<Self>, device: &Arc<DeviceInner>) -> Option<Arc<Keypair>> {
		let started = device.clock.now();

		loop {
			let now = device.clock.now();

			{
				let slots = self.keypairs.lock();
				if let Some(keypair) = slots.current.clone() {
					if !keypair.send_expired(now) {
						return Some(keypair);
					}
				}
			}

			if !self.is_running() {
				return None;
			}

			if now.saturating_duration_since(started) >= REKEY_ATTEMPT_TIME {
				debug!("{self}: flushing staged packet, no usable keypair");
				return None;
			}

			device.initiate_handshake(self);

			let mut slots = self.keypairs.lock();
			let _ = self.keypair_ready.wait_for(&mut slots, REKEY_TIMEOUT);
		}
	}

	/// Staging routine: assign a strictly monotonic counter to each
	/// packet and hand it, in order, to both the device's encryption
	/// workers and this peer's sequential sender.
	fn routine_staged(self: Arc<Self>) {
		while let Some(buf) = self.staged.pop() {
			let Some(device) = self.device() else { break };

			let Some(keypair) = self.sending_keypair(&device) else { continue };

			// Soft rekey: keep the session fresh well before the hard
			// limit cuts it off.
			if keypair.needs_rekey(device.clock.now()) {
				device.initiate_handshake(&self);
			}

			let Some(counter) = keypair.next_counter() else {
				debug!("{self}: send counters exhausted, dropping packet");
				device.initiate_handshake(&self);
				continue;
			};

			let elem = Outbound::new(buf, counter, keypair, Arc::clone(&self));

			// Same order into both queues; the outbound queue defines
			// what the wire sees.
			device.count_dropped(self.outbound.push(Arc::clone(&elem)));
			device.count_dropped(device.encrypt_queue.push(elem));
		}
	}

	/// Sequential sender: emit ciphertext in staging order.
	fn routine_send(self: Arc<Self>) {
		while let Some(elem) = self.outbound.pop() {
			elem.ready.wait();

			if elem.dropped.load(Ordering::Acquire) {
				continue;
			}

			let Some(device) = self.device() else { break };

			let endpoint = *self.endpoint.read();
			let Some(endpoint) = endpoint else {
				debug!("{self}: no known endpoint");
				continue;
			};

			let buf = elem.buf.lock();

			match device.bind.send(&buf, endpoint) {
				Ok(()) => {
					self.tx_bytes.fetch_add(buf.len() as u64, Ordering::Relaxed);

					let now = device.clock.now();
					if buf.len() != TRANSPORT_OVERHEAD {
						self.timers.data_sent(now);
					}
					self.timers.traversal(now, self.persistent_keepalive.load(Ordering::Relaxed));
				}
				Err(e) => debug!("{self}: send failed: {e}"),
			}
		}
	}

	/// Sequential receiver: validate counters in wire order, rotate
	/// keypairs, learn the source, filter, and deliver plaintext.
	fn routine_receive(self: Arc<Self>) {
		while let Some(elem) = self.inbound.pop() {
			elem.ready.wait();

			if elem.dropped.load(Ordering::Acquire) || !elem.ok.load(Ordering::Acquire) {
				continue;
			}

			let Some(device) = self.device() else { break };
			let now = device.clock.now();

			if !elem.keypair.replay.lock().update(elem.counter) {
				debug!("{self}: replayed or stale counter {}", elem.counter);
				continue;
			}

			// The packet authenticated: remember where it came from.
			*self.endpoint.write() = Some(elem.endpoint);

			// First traffic on `next` proves the initiator holds the
			// session; rotate it in.
			let promoted = {
				let mut slots = self.keypairs.lock();

				if slots.next.as_ref().is_some_and(|next| Arc::ptr_eq(next, &elem.keypair)) {
					device.release_keypairs(slots.promote());
					true
				} else {
					false
				}
			};

			if promoted {
				info!("{self}: session confirmed by first transport packet");
				self.timers.handshake_complete();
				self.notify_keypair();
			}

			self.timers.authenticated_received();
			self.timers.traversal(now, self.persistent_keepalive.load(Ordering::Relaxed));

			// Receive-side freshness: re-initiate before the session
			// ages past the reject line.
			if elem.keypair.expiring_soon(now) && !self.timers.sent_lastminute_handshake.swap(true, Ordering::Relaxed) {
				device.initiate_handshake(&self);
			}

			let mut buf = elem.buf.lock();
			self.rx_bytes.fetch_add((buf.len() - TRANSPORT_HEADER_LEN + TRANSPORT_OVERHEAD) as u64, Ordering::Relaxed);

			let plain = &buf[TRANSPORT_HEADER_LEN..];

			if plain.is_empty() {
				debug!("{self}: received keep-alive");
				continue;
			}

			self.timers.data_received(now);

			let (src, inner_len) = match net::ip::Packet::parse(plain) {
				Ok(packet) => (packet.src(), packet.len()),
				Err(()) => {
					warn!("{self}: inner packet is not valid IP");
					continue;
				}
			};

			// Strict reverse-path filter: the inner source must route
			// back to this peer.
			match device.allowed.lookup(src) {
				Some(owner) if Arc::ptr_eq(&owner, &self) => {}
				_ => {
					warn!("{self}: dropping packet with disallowed source {src}");
					continue;
				}
			}

			if inner_len > plain.len() {
				warn!("{self}: inner length exceeds the decrypted payload");
				continue;
			}

			// Strip the cipher padding down to the datagram itself.
			buf.truncate(TRANSPORT_HEADER_LEN + inner_len);

			if device.is_up() {
				let _ = device.tun.write(&buf[TRANSPORT_HEADER_LEN..]).ok_or(|e| debug!("{self}: tun write failed: {e}"));
			}
		}
	}

	/// Timer scheduler: waits on the peer's deadlines and acts.
	fn routine_timers(self: Arc<Self>) {
		loop {
			let Some(device) = self.device() else { break };
			let Some(kind) = self.timers.wait(&*device.clock) else { break };

			let now = device.clock.now();

			match kind {
				TimerKind::RetransmitHandshake => {
					let attempts = self.timers.handshake_attempts.fetch_add(1, Ordering::Relaxed) + 1;

					if attempts > MAX_TIMER_HANDSHAKES {
						warn!("{self}: handshake did not complete after {attempts} attempts, giving up");
						self.timers.handshake_attempts.store(0, Ordering::Relaxed);
						self.handshake.lock().clear();
						self.staged.flush();
						self.timers.arm_zero_key(now);
					} else {
						debug!("{self}: handshake attempt {attempts} unanswered, retrying");
						device.initiate_handshake(&self);
					}
				}
				TimerKind::SendKeepalive => {
					device.send_keepalive(&self);

					if self.timers.need_another_keepalive.swap(false, Ordering::Relaxed) {
						self.timers.arm_send_keepalive(now);
					}
				}
				TimerKind::NewHandshake => {
					info!("{self}: no authenticated reply, reinitiating");
					device.initiate_handshake(&self);
				}
				TimerKind::ZeroKeyMaterial => {
					info!("{self}: discarding expired key material");
					device.zero_keys(&self);
				}
				TimerKind::PersistentKeepalive => device.send_keepalive(&self),
			}
		}
	}
}

impl fmt::Display for Peer {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let b64 = STANDARD.encode(self.public.as_bytes());
		write!(f, "peer({}…{})", &b64[..4], &b64[40..])
	}
}
