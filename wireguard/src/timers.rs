//! Per-peer timer state: five logical timers multiplexed onto one
//! scheduler routine. Pipeline stages report events through the
//! methods below; the peer's timer routine blocks in [`Timers::wait`]
//! and acts on whatever fires.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use log::trace;
use parking_lot::{Condvar, Mutex};
use platform::Clock;
use rand::Rng;

pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);
pub const REKEY_ATTEMPT_TIME: Duration = Duration::from_secs(90);
pub const REKEY_TIMEOUT_JITTER_MAX: Duration = Duration::from_millis(334);

pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);

/// Retransmissions before a handshake attempt is abandoned.
pub const MAX_TIMER_HANDSHAKES: u32 = (REKEY_ATTEMPT_TIME.as_secs() / REKEY_TIMEOUT.as_secs()) as u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
	/// The initiation went unanswered; resend it.
	RetransmitHandshake,
	/// Data was received but none sent back; keep the far side's
	/// reply path warm.
	SendKeepalive,
	/// Data was sent but nothing authenticated came back.
	NewHandshake,
	/// The session is long dead; shred every key.
	ZeroKeyMaterial,
	/// The configured unconditional keep-alive.
	PersistentKeepalive,
}

#[derive(Default)]
struct Deadlines {
	retransmit_handshake: Option<Instant>,
	send_keepalive: Option<Instant>,
	new_handshake: Option<Instant>,
	zero_key_material: Option<Instant>,
	persistent_keepalive: Option<Instant>,
	stopped: bool,
}

impl Deadlines {
	fn earliest(&self) -> Option<(TimerKind, Instant)> {
		let armed = [
			(TimerKind::RetransmitHandshake, self.retransmit_handshake),
			(TimerKind::SendKeepalive, self.send_keepalive),
			(TimerKind::NewHandshake, self.new_handshake),
			(TimerKind::ZeroKeyMaterial, self.zero_key_material),
			(TimerKind::PersistentKeepalive, self.persistent_keepalive),
		];

		armed
			.into_iter()
			.filter_map(|(kind, at)| at.map(|at| (kind, at)))
			.min_by_key(|&(_, at)| at)
	}

	fn slot(&mut self, kind: TimerKind) -> &mut Option<Instant> {
		match kind {
			TimerKind::RetransmitHandshake => &mut self.retransmit_handshake,
			TimerKind::SendKeepalive => &mut self.send_keepalive,
			TimerKind::NewHandshake => &mut self.new_handshake,
			TimerKind::ZeroKeyMaterial => &mut self.zero_key_material,
			TimerKind::PersistentKeepalive => &mut self.persistent_keepalive,
		}
	}
}

/// What the scheduler should do next; separated from [`Timers::wait`]
/// so tests can drive the state with a synthetic clock.
pub enum Poll {
	Fire(TimerKind),
	Sleep(Duration),
	Idle,
	Stopped,
}

pub struct Timers {
	deadlines: Mutex<Deadlines>,
	cond: Condvar,
	pub handshake_attempts: AtomicU32,
	pub need_another_keepalive: AtomicBool,
	pub sent_lastminute_handshake: AtomicBool,
}

impl Timers {
	pub fn new() -> Self {
		Self {
			deadlines: Mutex::new(Deadlines::default()),
			cond: Condvar::new(),
			handshake_attempts: AtomicU32::new(0),
			need_another_keepalive: AtomicBool::new(false),
			sent_lastminute_handshake: AtomicBool::new(false),
		}
	}

	/// Random smear applied to handshake retransmissions.
	pub fn jitter() -> Duration {
		rand::thread_rng().gen_range(Duration::ZERO..REKEY_TIMEOUT_JITTER_MAX)
	}

	fn arm(&self, kind: TimerKind, at: Instant) {
		trace!("Arming {kind:?}");
		*self.deadlines.lock().slot(kind) = Some(at);
		self.cond.notify_all();
	}

	fn disarm(&self, kind: TimerKind) {
		*self.deadlines.lock().slot(kind) = None;
		self.cond.notify_all();
	}

	/// Examine the deadlines once. A fired timer is disarmed before it
	/// is returned.
	pub fn poll(&self, now: Instant) -> Poll {
		let mut deadlines = self.deadlines.lock();

		if deadlines.stopped {
			return Poll::Stopped;
		}

		match deadlines.earliest() {
			Some((kind, at)) if at <= now => {
				*deadlines.slot(kind) = None;
				Poll::Fire(kind)
			}
			Some((_, at)) => Poll::Sleep(at - now),
			None => Poll::Idle,
		}
	}

	/// Block until a timer fires or the scheduler is stopped.
	pub fn wait(&self, clock: &dyn Clock) -> Option<TimerKind> {
		loop {
			// Recompute under the lock so an event between poll and
			// sleep is not missed.
			let mut deadlines = self.deadlines.lock();

			if deadlines.stopped {
				return None;
			}

			match deadlines.earliest() {
				Some((kind, at)) if at <= clock.now() => {
					*deadlines.slot(kind) = None;
					return Some(kind);
				}
				Some((_, at)) => {
					let timeout = at - clock.now();
					self.cond.wait_for(&mut deadlines, timeout);
				}
				None => self.cond.wait(&mut deadlines),
			}
		}
	}

	/// A data packet (not a keep-alive) went out.
	pub fn data_sent(&self, now: Instant) {
		let mut deadlines = self.deadlines.lock();

		deadlines.send_keepalive = None;

		if deadlines.new_handshake.is_none() {
			deadlines.new_handshake = Some(now + KEEPALIVE_TIMEOUT + REKEY_TIMEOUT);
		}

		self.cond.notify_all();
	}

	/// A data packet (not a keep-alive) arrived.
	pub fn data_received(&self, now: Instant) {
		let mut deadlines = self.deadlines.lock();

		if deadlines.send_keepalive.is_none() {
			deadlines.send_keepalive = Some(now + KEEPALIVE_TIMEOUT);
			self.cond.notify_all();
		} else {
			self.need_another_keepalive.store(true, Ordering::Relaxed);
		}
	}

	/// Any authenticated packet arrived; the link is alive.
	pub fn authenticated_received(&self) {
		self.disarm(TimerKind::NewHandshake);
	}

	/// Any authenticated packet traversed in either direction.
	pub fn traversal(&self, now: Instant, persistent_interval: u32) {
		if persistent_interval > 0 {
			self.arm(TimerKind::PersistentKeepalive, now + Duration::from_secs(persistent_interval.into()));
		}
	}

	pub fn arm_send_keepalive(&self, now: Instant) {
		self.arm(TimerKind::SendKeepalive, now + KEEPALIVE_TIMEOUT);
	}

	/// An initiation went out.
	pub fn handshake_initiated(&self, now: Instant) {
		let mut deadlines = self.deadlines.lock();
		deadlines.send_keepalive = None;
		deadlines.retransmit_handshake = Some(now + REKEY_TIMEOUT + Self::jitter());
		self.cond.notify_all();
	}

	/// The handshake completed: a response was consumed, or the first
	/// transport packet arrived on the `next` keypair.
	pub fn handshake_complete(&self) {
		self.handshake_attempts.store(0, Ordering::Relaxed);
		self.sent_lastminute_handshake.store(false, Ordering::Relaxed);
		self.disarm(TimerKind::RetransmitHandshake);
	}

	/// Schedule the shredding of stale key material.
	pub fn arm_zero_key(&self, now: Instant) {
		self.arm(TimerKind::ZeroKeyMaterial, now + REJECT_AFTER_TIME * 3);
	}

	/// A fresh session was derived.
	pub fn session_derived(&self, now: Instant) {
		self.arm_zero_key(now);
	}

	/// Re-arm (or disarm) the persistent keep-alive after a
	/// configuration change.
	pub fn persistent_changed(&self, now: Instant, persistent_interval: u32) {
		if persistent_interval > 0 {
			self.arm(TimerKind::PersistentKeepalive, now + Duration::from_secs(persistent_interval.into()));
		} else {
			self.disarm(TimerKind::PersistentKeepalive);
		}
	}

	/// Shut the scheduler down; `wait` returns `None` from here on.
	pub fn stop(&self) {
		let mut deadlines = self.deadlines.lock();
		*deadlines = Deadlines { stopped: true, ..Deadlines::default() };
		self.cond.notify_all();
	}

	/// Bring a stopped scheduler back, with every timer disarmed.
	pub fn restart(&self) {
		let mut deadlines = self.deadlines.lock();
		*deadlines = Deadlines::default();
		self.handshake_attempts.store(0, Ordering::Relaxed);
		self.need_another_keepalive.store(false, Ordering::Relaxed);
		self.sent_lastminute_handshake.store(false, Ordering::Relaxed);
		self.cond.notify_all();
	}
}

impl Default for Timers {
	fn default() -> Self {
		Self::new()
	}
}
