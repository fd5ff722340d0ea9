//! Compile-time capacities for the fixed-size structures of the engine.
//!
//! These bound memory per connection and per worker. Exceeding a capacity at
//! run time is reported as an explicit [`crate::storage::Exhausted`] error,
//! never absorbed silently.

/// Maximum number of scoreboard holes tracked per connection.
pub const SACK_HOLE_COUNT: usize = 256;

/// Maximum number of SACK blocks carried by one decoded segment.
pub const SEGMENT_SACK_BLOCK_COUNT: usize = 4;

/// Maximum number of byte-tracker samples per connection.
pub const BT_SAMPLE_COUNT: usize = 256;

/// Slots per timer-wheel ring. Two rings cover `512 * 512` ticks.
pub const TIMER_WHEEL_SLOT_COUNT: usize = 512;
