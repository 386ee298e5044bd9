//! The allowed-IPs table: a binary radix trie per address family,
//! mapping inner IP prefixes to the peer that owns them. Used for
//! egress routing and, in reverse, as the ingress source filter.
//!
//! Writes come from the control plane only; readers share a read
//! lock and never block each other.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use parking_lot::RwLock;

use crate::peer::Peer;

/// Prefix bits are left-aligned in a `u128`; IPv4 occupies the top
/// 32 bits of its own tree.
struct Node {
	key: u128,
	len: u8,
	peer: Option<Arc<Peer>>,
	child: [Option<Box<Node>>; 2],
}

#[inline]
fn bit(key: u128, i: u8) -> usize {
	((key >> (127 - i)) & 1) as usize
}

/// Length of the common prefix of `a` and `b`, capped at `cap` bits.
#[inline]
fn common(a: u128, b: u128, cap: u8) -> u8 {
	cap.min((a ^ b).leading_zeros() as u8)
}

/// Zero everything below the first `len` bits.
#[inline]
fn masked(key: u128, len: u8) -> u128 {
	match len {
		0 => 0,
		128 => key,
		_ => key & (u128::MAX << (128 - len)),
	}
}

fn insert(slot: &mut Option<Box<Node>>, key: u128, len: u8, peer: &Arc<Peer>) {
	let Some(node) = slot else {
		*slot = Some(Box::new(Node { key, len, peer: Some(Arc::clone(peer)), child: [None, None] }));
		return;
	};

	let cpl = common(key, node.key, len.min(node.len));

	if cpl == node.len {
		if cpl == len {
			// Exactly this prefix: take over ownership.
			node.peer = Some(Arc::clone(peer));
		} else {
			insert(&mut node.child[bit(key, node.len)], key, len, peer);
		}
		return;
	}

	// The prefixes diverge before the node's own length: fork.
	let old = slot.take().unwrap();
	let old_key = old.key;

	let mut fork = Box::new(Node { key: masked(key, cpl), len: cpl, peer: None, child: [None, None] });

	if cpl == len {
		// The new prefix is an ancestor of the existing node.
		fork.peer = Some(Arc::clone(peer));
		fork.child[bit(old_key, cpl)] = Some(old);
	} else {
		let leaf = Box::new(Node { key, len, peer: Some(Arc::clone(peer)), child: [None, None] });
		fork.child[bit(old_key, cpl)] = Some(old);
		fork.child[bit(key, cpl)] = Some(leaf);
	}

	*slot = Some(fork);
}

fn lookup(root: &Option<Box<Node>>, key: u128) -> Option<Arc<Peer>> {
	let mut found = None;
	let mut slot = root.as_deref();

	while let Some(node) = slot {
		if common(key, node.key, node.len) != node.len {
			break;
		}

		if let Some(peer) = &node.peer {
			found = Some(Arc::clone(peer));
		}

		if node.len >= 128 {
			break;
		}

		slot = node.child[bit(key, node.len)].as_deref();
	}

	found
}

fn remove(slot: &mut Option<Box<Node>>, peer: &Arc<Peer>) {
	let Some(node) = slot else { return };

	for child in node.child.iter_mut() {
		remove(child, peer);
	}

	if node.peer.as_ref().is_some_and(|owner| Arc::ptr_eq(owner, peer)) {
		node.peer = None;
	}

	if node.peer.is_none() {
		match node.child.iter().filter(|c| c.is_some()).count() {
			0 => *slot = None,
			1 => {
				let child = node.child.iter_mut().find_map(|c| c.take()).unwrap();
				*slot = Some(child);
			}
			_ => {}
		}
	}
}

fn collect(root: &Option<Box<Node>>, peer: &Arc<Peer>, v4: bool, out: &mut Vec<IpNet>) {
	let Some(node) = root else { return };

	if node.peer.as_ref().is_some_and(|owner| Arc::ptr_eq(owner, peer)) {
		let net = if v4 {
			IpNet::V4(Ipv4Net::new(Ipv4Addr::from((node.key >> 96) as u32), node.len).expect("prefix length fits"))
		} else {
			IpNet::V6(Ipv6Net::new(Ipv6Addr::from(node.key), node.len).expect("prefix length fits"))
		};
		out.push(net);
	}

	for child in &node.child {
		collect(child, peer, v4, out);
	}
}

fn key_of(ip: IpAddr) -> u128 {
	match ip {
		IpAddr::V4(a) => (u32::from(a) as u128) << 96,
		IpAddr::V6(a) => u128::from(a),
	}
}

#[derive(Default)]
struct Roots {
	v4: Option<Box<Node>>,
	v6: Option<Box<Node>>,
}

#[derive(Default)]
pub struct AllowedIps {
	roots: RwLock<Roots>,
}

impl AllowedIps {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert a prefix owned by `peer`. A longer prefix overrides a
	/// shorter one for the addresses it covers.
	pub fn insert(&self, net: IpNet, peer: &Arc<Peer>) {
		let mut roots = self.roots.write();

		match net {
			IpNet::V4(n) => insert(&mut roots.v4, (u32::from(n.network()) as u128) << 96, n.prefix_len(), peer),
			IpNet::V6(n) => insert(&mut roots.v6, u128::from(n.network()), n.prefix_len(), peer),
		}
	}

	/// Longest-prefix match.
	pub fn lookup(&self, ip: IpAddr) -> Option<Arc<Peer>> {
		let roots = self.roots.read();

		match ip {
			IpAddr::V4(_) => lookup(&roots.v4, key_of(ip)),
			IpAddr::V6(_) => lookup(&roots.v6, key_of(ip)),
		}
	}

	/// Detach every prefix owned by `peer`, collapsing what remains.
	pub fn remove_peer(&self, peer: &Arc<Peer>) {
		let mut roots = self.roots.write();
		remove(&mut roots.v4, peer);
		remove(&mut roots.v6, peer);
	}

	/// The prefixes `peer` owns, for the control plane.
	pub fn entries_for_peer(&self, peer: &Arc<Peer>) -> Vec<IpNet> {
		let roots = self.roots.read();
		let mut out = Vec::new();

		collect(&roots.v4, peer, true, &mut out);
		collect(&roots.v6, peer, false, &mut out);

		out
	}

	/// Drop everything (peer replacement).
	pub fn clear(&self) {
		let mut roots = self.roots.write();
		roots.v4 = None;
		roots.v6 = None;
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Weak;

	use x25519_dalek::{PublicKey, StaticSecret};

	use super::*;

	fn peer() -> Arc<Peer> {
		Peer::new(PublicKey::from(&StaticSecret::random()), None, Weak::new())
	}

	fn net(s: &str) -> IpNet {
		s.parse().unwrap()
	}

	fn ip(s: &str) -> IpAddr {
		s.parse().unwrap()
	}

	#[test]
	fn longest_prefix_wins() {
		let table = AllowedIps::new();
		let (wide, narrow) = (peer(), peer());

		table.insert(net("10.0.0.0/8"), &wide);
		table.insert(net("10.1.0.0/16"), &narrow);

		assert!(Arc::ptr_eq(&table.lookup(ip("10.2.3.4")).unwrap(), &wide));
		assert!(Arc::ptr_eq(&table.lookup(ip("10.1.3.4")).unwrap(), &narrow));
		assert!(table.lookup(ip("192.168.0.1")).is_none());
	}

	#[test]
	fn host_routes() {
		let table = AllowedIps::new();
		let (a, b) = (peer(), peer());

		table.insert(net("10.0.0.1/32"), &a);
		table.insert(net("10.0.0.2/32"), &b);

		assert!(Arc::ptr_eq(&table.lookup(ip("10.0.0.1")).unwrap(), &a));
		assert!(Arc::ptr_eq(&table.lookup(ip("10.0.0.2")).unwrap(), &b));
		assert!(table.lookup(ip("10.0.0.3")).is_none());
	}

	#[test]
	fn default_route() {
		let table = AllowedIps::new();
		let p = peer();

		table.insert(net("0.0.0.0/0"), &p);
		assert!(table.lookup(ip("203.0.113.9")).is_some());
		assert!(table.lookup(ip("::1")).is_none());
	}

	#[test]
	fn v6_prefixes() {
		let table = AllowedIps::new();
		let p = peer();

		table.insert(net("fd00::/64"), &p);
		table.insert(net("fd00:0:0:1::/64"), &p);

		assert!(table.lookup(ip("fd00::1234")).is_some());
		assert!(table.lookup(ip("fd00:0:0:1::1")).is_some());
		assert!(table.lookup(ip("fd00:0:0:2::1")).is_none());

		let mut entries = table.entries_for_peer(&p);
		entries.sort();
		assert_eq!(entries, vec![net("fd00::/64"), net("fd00:0:0:1::/64")]);
	}

	#[test]
	fn removal_detaches_and_collapses() {
		let table = AllowedIps::new();
		let (a, b) = (peer(), peer());

		table.insert(net("10.0.0.0/8"), &a);
		table.insert(net("10.1.0.0/16"), &b);
		table.insert(net("10.2.0.0/16"), &b);

		table.remove_peer(&b);

		assert!(table.entries_for_peer(&b).is_empty());
		assert!(Arc::ptr_eq(&table.lookup(ip("10.1.0.1")).unwrap(), &a));
		assert_eq!(table.entries_for_peer(&a), vec![net("10.0.0.0/8")]);

		table.remove_peer(&a);
		assert!(table.lookup(ip("10.0.0.1")).is_none());
	}

	#[test]
	fn reinsertion_moves_ownership() {
		let table = AllowedIps::new();
		let (a, b) = (peer(), peer());

		table.insert(net("10.0.0.2/32"), &a);
		table.insert(net("10.0.0.2/32"), &b);

		assert!(Arc::ptr_eq(&table.lookup(ip("10.0.0.2")).unwrap(), &b));
	}
}
