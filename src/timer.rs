/*! Hierarchical timer wheel.

Each worker owns one [`TimerWheel`]. The tick is deliberately coarse
(100 ms): connection timers are RTO-scale, and a coarse tick means armed
timers are moved, not reallocated, on every RTO-affecting ACK. Two rings of
512 slots cover `512 * 512` ticks (about 7 hours); longer intervals are
clamped.

Expiry runs only when the owning worker calls [`TimerWheel::advance`], and
entries that share a tick fire in insertion order. There is no further
fairness guarantee.
*/

use crate::storage::{Exhausted, Handle, Pool};
use crate::time::Duration;

use crate::config::TIMER_WHEEL_SLOT_COUNT;

/// Timer tick period. The RTO floor exceeds one tick, so coarseness never
/// rounds a retransmission timeout down to zero.
pub const TICK: Duration = Duration::from_millis(100);

const SLOTS: u64 = TIMER_WHEEL_SLOT_COUNT as u64;
const MAX_INTERVAL: u64 = SLOTS * SLOTS - 1;

/// An opaque reference to a running timer.
pub type TimerToken = Handle;

/// An expired timer, as reported by [`TimerWheel::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    /// Opaque user datum supplied at start (a pool slot index, typically).
    pub user: u32,
    /// Which of the user's timers fired.
    pub timer_id: u8,
}

#[derive(Debug)]
struct TimerEntry {
    user: u32,
    timer_id: u8,
    expires: u64,
}

/// A two-level timer wheel with O(1) amortized start, stop and expire.
///
/// Cancellation is lazy: `stop` frees the entry and the slot reference is
/// skipped (generation mismatch) when its slot later drains.
#[derive(Debug)]
pub struct TimerWheel {
    entries: Pool<TimerEntry>,
    fast: Vec<Vec<TimerToken>>,
    slow: Vec<Vec<TimerToken>>,
    current: u64,
}

impl TimerWheel {
    /// Create a wheel holding at most `capacity` concurrent timers.
    pub fn new(capacity: usize) -> TimerWheel {
        TimerWheel {
            entries: Pool::new(capacity),
            fast: (0..TIMER_WHEEL_SLOT_COUNT).map(|_| Vec::new()).collect(),
            slow: (0..TIMER_WHEEL_SLOT_COUNT).map(|_| Vec::new()).collect(),
            current: 0,
        }
    }

    /// The tick the wheel has been advanced to.
    pub fn current_tick(&self) -> u64 {
        self.current
    }

    /// Number of running timers.
    pub fn active(&self) -> usize {
        self.entries.len()
    }

    /// Start a timer `ticks` from now. `ticks` is clamped to `1..=MAX`.
    pub fn start(&mut self, user: u32, timer_id: u8, ticks: u32) -> Result<TimerToken, Exhausted> {
        let ticks = (ticks as u64).clamp(1, MAX_INTERVAL);
        let expires = self.current + ticks;
        let token = self.entries.alloc(TimerEntry {
            user,
            timer_id,
            expires,
        })?;
        self.file(token, expires);
        Ok(token)
    }

    /// Cancel a running timer. A stale token is a no-op.
    pub fn stop(&mut self, token: TimerToken) {
        self.entries.free(token);
    }

    /// Advance the wheel to `now_tick`, appending expired timers to
    /// `expired` in insertion order.
    pub fn advance(&mut self, now_tick: u64, expired: &mut Vec<TimerEvent>) {
        while self.current < now_tick {
            self.current += 1;
            if self.current % SLOTS == 0 {
                self.cascade();
            }
            let slot = (self.current % SLOTS) as usize;
            let tokens = core::mem::take(&mut self.fast[slot]);
            for token in tokens {
                match self.entries.get(token) {
                    Some(entry) if entry.expires == self.current => {
                        expired.push(TimerEvent {
                            user: entry.user,
                            timer_id: entry.timer_id,
                        });
                        self.entries.free(token);
                    }
                    // Stopped, restarted, or not this lap's entry.
                    _ => {}
                }
            }
        }
    }

    fn file(&mut self, token: TimerToken, expires: u64) {
        if expires - self.current < SLOTS {
            self.fast[(expires % SLOTS) as usize].push(token);
        } else {
            self.slow[((expires / SLOTS) % SLOTS) as usize].push(token);
        }
    }

    /// Move the slow-ring slot we just entered down into the fast ring.
    fn cascade(&mut self) {
        let slot = ((self.current / SLOTS) % SLOTS) as usize;
        let tokens = core::mem::take(&mut self.slow[slot]);
        for token in tokens {
            let Some(entry) = self.entries.get(token) else {
                continue;
            };
            let expires = entry.expires;
            if expires / SLOTS != self.current / SLOTS {
                // A later lap of the slow ring.
                self.slow[slot].push(token);
                continue;
            }
            debug_assert!(expires >= self.current);
            self.fast[(expires % SLOTS) as usize].push(token);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn drain(wheel: &mut TimerWheel, to: u64) -> Vec<TimerEvent> {
        let mut expired = Vec::new();
        wheel.advance(to, &mut expired);
        expired
    }

    #[test]
    fn test_fast_ring_expiry() {
        let mut wheel = TimerWheel::new(16);
        wheel.start(1, 0, 3).unwrap();
        assert!(drain(&mut wheel, 2).is_empty());
        assert_eq!(
            drain(&mut wheel, 3),
            [TimerEvent {
                user: 1,
                timer_id: 0
            }]
        );
        assert_eq!(wheel.active(), 0);
    }

    #[test]
    fn test_insertion_order_within_tick() {
        let mut wheel = TimerWheel::new(16);
        wheel.start(1, 0, 5).unwrap();
        wheel.start(2, 0, 5).unwrap();
        wheel.start(3, 0, 5).unwrap();
        let users: Vec<u32> = drain(&mut wheel, 5).iter().map(|e| e.user).collect();
        assert_eq!(users, [1, 2, 3]);
    }

    #[test]
    fn test_stop_prevents_expiry() {
        let mut wheel = TimerWheel::new(16);
        let token = wheel.start(1, 0, 2).unwrap();
        wheel.stop(token);
        assert!(drain(&mut wheel, 4).is_empty());
    }

    #[test]
    fn test_slow_ring_cascade() {
        let mut wheel = TimerWheel::new(16);
        wheel.start(7, 2, 600).unwrap();
        assert!(drain(&mut wheel, 599).is_empty());
        assert_eq!(
            drain(&mut wheel, 600),
            [TimerEvent {
                user: 7,
                timer_id: 2
            }]
        );
    }

    #[test]
    fn test_slow_ring_later_lap_stays() {
        let mut wheel = TimerWheel::new(16);
        // Same slow slot, different laps.
        wheel.start(1, 0, 600).unwrap();
        wheel.start(2, 0, 600 + 512 * 512 / 2).unwrap();
        let fired = drain(&mut wheel, 1000);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].user, 1);
        assert_eq!(wheel.active(), 1);
    }

    #[test]
    fn test_interval_clamped_to_at_least_one_tick() {
        let mut wheel = TimerWheel::new(16);
        wheel.start(1, 0, 0).unwrap();
        assert_eq!(drain(&mut wheel, 1).len(), 1);
    }
}
