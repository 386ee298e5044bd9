//! Pipeline plumbing: bounded MPMC queues with a drop-oldest overflow
//! policy, the readiness latch between the parallel and sequential
//! stages, and the work elements that move through both.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::peer::Peer;
use crate::pool::Buf;
use crate::session::Keypair;

/// Default bound of every pipeline queue.
pub const QUEUE_SIZE: usize = 1024;

/// Implemented by queue items so an element displaced by the overflow
/// policy can be marked and skipped by stages that still hold it.
pub trait Discard {
	fn discard(&self);
}

struct Chan<T> {
	tx: Option<Sender<T>>,
	rx: Receiver<T>,
}

fn chan<T>(cap: usize) -> Chan<T> {
	let (tx, rx) = bounded(cap);
	Chan { tx: Some(tx), rx }
}

/// A bounded multi-producer multi-consumer queue. A full queue sheds
/// its oldest element rather than blocking the producer, so a stalled
/// consumer costs the stalest packet instead of liveness.
pub struct Queue<T> {
	cap: usize,
	chan: RwLock<Chan<T>>,
}

impl<T: Discard> Queue<T> {
	pub fn bounded(cap: usize) -> Self {
		Self { cap, chan: RwLock::new(chan(cap)) }
	}

	/// Push `item`, displacing the oldest element when full. Returns
	/// the number of elements discarded along the way.
	pub fn push(&self, item: T) -> usize {
		let chan = self.chan.read();

		let Some(tx) = chan.tx.as_ref() else {
			item.discard();
			return 1;
		};

		let mut item = item;
		let mut discarded = 0;

		for _ in 0..2 {
			match tx.try_send(item) {
				Ok(()) => return discarded,
				Err(TrySendError::Full(back)) => {
					item = back;

					if let Ok(oldest) = chan.rx.try_recv() {
						oldest.discard();
						discarded += 1;
					}
				}
				Err(TrySendError::Disconnected(back)) => {
					back.discard();
					return discarded + 1;
				}
			}
		}

		// Lost the displacement race twice; shed the new item instead.
		item.discard();
		discarded + 1
	}

	/// Blocking pop; `None` once the queue is closed and drained.
	pub fn pop(&self) -> Option<T> {
		let rx = self.chan.read().rx.clone();
		rx.recv().ok()
	}

	pub fn try_pop(&self) -> Option<T> {
		self.chan.read().rx.try_recv().ok()
	}

	pub fn len(&self) -> usize {
		self.chan.read().rx.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn capacity(&self) -> usize {
		self.cap
	}

	/// Close the queue: pushes discard their item, pops drain what is
	/// left and then return `None`.
	pub fn close(&self) {
		self.chan.write().tx.take();
	}

	/// Drain and discard everything queued, returning the count.
	pub fn flush(&self) -> usize {
		let mut n = 0;

		while let Some(item) = self.try_pop() {
			item.discard();
			n += 1;
		}

		n
	}

	/// Replace a closed queue with a fresh empty one.
	pub fn reopen(&self) {
		*self.chan.write() = chan(self.cap);
	}
}

/// One-shot readiness signal from a parallel worker to the sequential
/// stage waiting on its element.
pub struct Latch {
	done: Mutex<bool>,
	cond: Condvar,
}

impl Latch {
	pub fn new() -> Self {
		Self { done: Mutex::new(false), cond: Condvar::new() }
	}

	pub fn set(&self) {
		*self.done.lock() = true;
		self.cond.notify_all();
	}

	pub fn wait(&self) {
		let mut done = self.done.lock();

		while !*done {
			self.cond.wait(&mut done);
		}
	}
}

impl Default for Latch {
	fn default() -> Self {
		Self::new()
	}
}

/// An outbound packet between the staging, encryption and sending
/// stages: reserved transport header followed by the plaintext, both
/// rewritten in place by the encryption worker.
pub struct Outbound {
	pub buf: Mutex<Buf>,
	pub counter: u64,
	pub keypair: Arc<Keypair>,
	pub peer: Arc<Peer>,
	pub ready: Latch,
	pub dropped: AtomicBool,
}

impl Outbound {
	pub fn new(buf: Buf, counter: u64, keypair: Arc<Keypair>, peer: Arc<Peer>) -> Arc<Self> {
		Arc::new(Self {
			buf: Mutex::new(buf),
			counter,
			keypair,
			peer,
			ready: Latch::new(),
			dropped: AtomicBool::new(false),
		})
	}
}

impl Discard for Arc<Outbound> {
	fn discard(&self) {
		self.dropped.store(true, Ordering::Relaxed);
		// Unblock the sequential sender if it is already waiting.
		self.ready.set();
	}
}

/// An inbound transport packet between the receive loop, decryption
/// workers and the sequential receiver.
pub struct Inbound {
	pub buf: Mutex<Buf>,
	pub counter: u64,
	pub keypair: Arc<Keypair>,
	pub peer: Arc<Peer>,
	pub endpoint: SocketAddr,
	pub ready: Latch,
	pub dropped: AtomicBool,
	/// Set by the decryption worker on success.
	pub ok: AtomicBool,
}

impl Inbound {
	pub fn new(buf: Buf, counter: u64, keypair: Arc<Keypair>, peer: Arc<Peer>, endpoint: SocketAddr) -> Arc<Self> {
		Arc::new(Self {
			buf: Mutex::new(buf),
			counter,
			keypair,
			peer,
			endpoint,
			ready: Latch::new(),
			dropped: AtomicBool::new(false),
			ok: AtomicBool::new(false),
		})
	}
}

impl Discard for Arc<Inbound> {
	fn discard(&self) {
		self.dropped.store(true, Ordering::Relaxed);
		self.ready.set();
	}
}

/// A handshake message waiting for a handshake worker.
pub struct HandshakeJob {
	pub buf: Buf,
	pub src: SocketAddr,
}

impl Discard for HandshakeJob {
	fn discard(&self) {}
}

/// Staged plaintext awaiting a nonce; dropping it returns the buffer.
impl Discard for Buf {
	fn discard(&self) {}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct Item(Arc<AtomicBool>);

	impl Discard for Item {
		fn discard(&self) {
			self.0.store(true, Ordering::Relaxed);
		}
	}

	#[test]
	fn drop_oldest_under_overflow() {
		let queue = Queue::bounded(2);

		let flags: Vec<_> = (0..3).map(|_| Arc::new(AtomicBool::new(false))).collect();

		assert_eq!(queue.push(Item(flags[0].clone())), 0);
		assert_eq!(queue.push(Item(flags[1].clone())), 0);
		// Full: the oldest is displaced and marked.
		assert_eq!(queue.push(Item(flags[2].clone())), 1);

		assert!(flags[0].load(Ordering::Relaxed));
		assert!(!flags[1].load(Ordering::Relaxed));
		assert!(!flags[2].load(Ordering::Relaxed));

		// Consumers drain in order, displaced element gone.
		assert!(Arc::ptr_eq(&queue.pop().unwrap().0, &flags[1]));
		assert!(Arc::ptr_eq(&queue.pop().unwrap().0, &flags[2]));
	}

	#[test]
	fn closed_queue_discards() {
		let queue = Queue::bounded(4);
		let flag = Arc::new(AtomicBool::new(false));

		queue.close();
		queue.push(Item(flag.clone()));

		assert!(flag.load(Ordering::Relaxed));
		assert!(queue.pop().is_none());

		queue.reopen();
		let flag = Arc::new(AtomicBool::new(false));
		queue.push(Item(flag.clone()));
		assert!(!flag.load(Ordering::Relaxed));
		assert!(queue.pop().is_some());
	}

	#[test]
	fn close_drains_in_flight() {
		let queue = Queue::bounded(4);

		queue.push(Item(Arc::new(AtomicBool::new(false))));
		queue.close();

		// Items queued before the close still come out.
		assert!(queue.pop().is_some());
		assert!(queue.pop().is_none());
	}

	#[test]
	fn latch_releases_waiter() {
		let latch = Arc::new(Latch::new());

		let waiter = {
			let latch = latch.clone();
			std::thread::spawn(move || latch.wait())
		};

		latch.set();
		waiter.join().unwrap();
	}
}
