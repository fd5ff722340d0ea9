/*! Storage primitives.

The `storage` module provides the arena underlying the engine's intrusive
structures: scoreboard holes, byte-tracker samples and the per-worker
connection pool all live in a [`Pool`] and reference each other through
generation-checked [`Handle`]s instead of pointers.
*/

mod pool;

pub use self::pool::{Handle, Pool};

use core::fmt;

/// A fixed capacity has been reached.
///
/// Returned whenever allocating a pool entry would exceed the configured
/// bound. The caller must drop or reject the triggering operation; no
/// partial state is left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted;

impl fmt::Display for Exhausted {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "pool exhausted")
    }
}

impl core::error::Error for Exhausted {}
