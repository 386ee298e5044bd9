//! The error discipline of the protocol paths.
//!
//! A rejected packet carries no error payload: the log line emitted at
//! the site of the failure is the only observable, and `?` propagates
//! the drop outward. `map_err(|_| warn!(..))` converts any error into
//! this shape, since the log macros return `()`.

use core::result;

pub type Result<T = (), E = ()> = result::Result<T, E>;

pub trait Ext<T, E> {
	/// Consume the error branch with `f` (usually a log call),
	/// keeping only the success value.
	fn ok_or(self, f: impl FnOnce(E)) -> Option<T>;
}

impl<T, E> Ext<T, E> for result::Result<T, E> {
	fn ok_or(self, f: impl FnOnce(E)) -> Option<T> {
		match self {
			Ok(v) => Some(v),
			Err(e) => {
				f(e);
				None
			}
		}
	}
}

pub use Ext as _;
