//! The collaborators the tunnel core talks to, as traits: the virtual
//! network interface, the UDP socket pair, and the clock. The core
//! never touches a file descriptor or the wall clock directly, which
//! keeps it portable and lets the tests substitute all three.

pub mod logger;
pub mod time;
pub mod tun;
pub mod udp;

pub use time::{Clock, SystemClock};
pub use tun::{Tun, TunEvent};
pub use udp::{Bind, UdpBind};
