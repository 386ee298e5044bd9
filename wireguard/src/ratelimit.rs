//! Token buckets over handshake message sources: IPv4 sources are
//! tracked per address, IPv6 per /64. Buckets carry their credit as
//! nanoseconds, regenerate at the packet rate, and are garbage
//! collected after a second of silence.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub const PACKETS_PER_SECOND: u64 = 20;
pub const PACKETS_BURST: u64 = 5;

/// Credit one packet costs, in nanoseconds.
const PACKET_COST: u64 = 1_000_000_000 / PACKETS_PER_SECOND;
const MAX_TOKENS: u64 = PACKET_COST * PACKETS_BURST;

const GC_INTERVAL: Duration = Duration::from_secs(1);

struct Bucket {
	tokens: u64,
	last: Instant,
}

struct Inner {
	buckets: HashMap<IpAddr, Bucket>,
	last_gc: Option<Instant>,
}

pub struct RateLimiter {
	inner: Mutex<Inner>,
}

impl RateLimiter {
	pub fn new() -> Self {
		Self {
			inner: Mutex::new(Inner { buckets: HashMap::new(), last_gc: None }),
		}
	}

	fn key(ip: IpAddr) -> IpAddr {
		match ip {
			IpAddr::V4(_) => ip,
			IpAddr::V6(a) => {
				let mut octets = a.octets();
				octets[8..].fill(0);
				IpAddr::V6(octets.into())
			}
		}
	}

	/// Whether a handshake message from `ip` may be processed now.
	pub fn allow(&self, ip: IpAddr, now: Instant) -> bool {
		let mut inner = self.inner.lock();

		if inner.last_gc.map_or(true, |last| now.saturating_duration_since(last) >= GC_INTERVAL) {
			inner.buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last) < GC_INTERVAL);
			inner.last_gc = Some(now);
		}

		let bucket = inner.buckets.entry(Self::key(ip)).or_insert(Bucket { tokens: MAX_TOKENS, last: now });

		let refill = now.saturating_duration_since(bucket.last).as_nanos().min(u64::MAX as u128) as u64;
		bucket.tokens = bucket.tokens.saturating_add(refill).min(MAX_TOKENS);
		bucket.last = now;

		if bucket.tokens >= PACKET_COST {
			bucket.tokens -= PACKET_COST;
			true
		} else {
			false
		}
	}
}

impl Default for RateLimiter {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn burst_then_deny() {
		let limiter = RateLimiter::new();
		let now = Instant::now();
		let src: IpAddr = "192.0.2.1".parse().unwrap();

		for _ in 0..PACKETS_BURST {
			assert!(limiter.allow(src, now));
		}
		assert!(!limiter.allow(src, now));

		// Credit for exactly one packet regenerates in 50ms.
		let later = now + Duration::from_nanos(PACKET_COST);
		assert!(limiter.allow(src, later));
		assert!(!limiter.allow(src, later));
	}

	#[test]
	fn sources_are_independent() {
		let limiter = RateLimiter::new();
		let now = Instant::now();

		let a: IpAddr = "192.0.2.1".parse().unwrap();
		let b: IpAddr = "192.0.2.2".parse().unwrap();

		for _ in 0..PACKETS_BURST {
			assert!(limiter.allow(a, now));
		}
		assert!(!limiter.allow(a, now));
		assert!(limiter.allow(b, now));
	}

	#[test]
	fn v6_shares_per_64() {
		let limiter = RateLimiter::new();
		let now = Instant::now();

		let a: IpAddr = "2001:db8::1".parse().unwrap();
		let b: IpAddr = "2001:db8::2".parse().unwrap();
		let other: IpAddr = "2001:db8:0:1::1".parse().unwrap();

		for _ in 0..PACKETS_BURST {
			assert!(limiter.allow(a, now));
		}
		assert!(!limiter.allow(b, now), "same /64 shares the bucket");
		assert!(limiter.allow(other, now), "different /64 does not");
	}

	#[test]
	fn idle_buckets_collected() {
		let limiter = RateLimiter::new();
		let now = Instant::now();
		let src: IpAddr = "198.51.100.1".parse().unwrap();

		for _ in 0..PACKETS_BURST {
			assert!(limiter.allow(src, now));
		}
		assert!(!limiter.allow(src, now));

		// A second of silence evicts the bucket; the burst returns.
		let later = now + GC_INTERVAL;
		for _ in 0..PACKETS_BURST {
			assert!(limiter.allow(src, later));
		}
	}
}
