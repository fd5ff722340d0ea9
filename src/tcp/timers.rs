//! Per-connection timer slots.
//!
//! A connection holds at most one running timer of each kind. The slots
//! store wheel tokens; the wheel entry's user datum is the connection's
//! pool slot index so an expiry can be routed back, and its `timer_id` is
//! the [`TimerKind`] discriminant.

use crate::time::Duration;
use crate::timer::{TimerToken, TimerWheel, TICK};

/// The five connection timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Retransmit = 0,
    DelAck = 1,
    Persist = 2,
    WaitClose = 3,
    RetransmitSyn = 4,
}

pub const TIMER_COUNT: usize = 5;

impl TimerKind {
    pub fn from_id(id: u8) -> Option<TimerKind> {
        match id {
            0 => Some(TimerKind::Retransmit),
            1 => Some(TimerKind::DelAck),
            2 => Some(TimerKind::Persist),
            3 => Some(TimerKind::WaitClose),
            4 => Some(TimerKind::RetransmitSyn),
            _ => None,
        }
    }
}

/// Convert a duration to wheel ticks, rounding up and never below one.
pub fn ticks(duration: Duration) -> u32 {
    let tick_ms = TICK.total_millis();
    (duration.total_millis().div_ceil(tick_ms)).max(1) as u32
}

/// The per-connection timer handle slots.
#[derive(Debug, Default)]
pub struct Timers {
    slots: [Option<TimerToken>; TIMER_COUNT],
}

impl Timers {
    pub fn new() -> Timers {
        Timers::default()
    }

    pub fn is_active(&self, kind: TimerKind) -> bool {
        self.slots[kind as usize].is_some()
    }

    /// Start a timer that is known not to be running.
    pub fn set(&mut self, wheel: &mut TimerWheel, user: u32, kind: TimerKind, interval: Duration) {
        debug_assert!(!self.is_active(kind), "timer {:?} already running", kind);
        self.slots[kind as usize] = wheel.start(user, kind as u8, ticks(interval)).ok();
    }

    /// Restart a timer, or start it if it is not running.
    pub fn update(
        &mut self,
        wheel: &mut TimerWheel,
        user: u32,
        kind: TimerKind,
        interval: Duration,
    ) {
        self.reset(wheel, kind);
        self.slots[kind as usize] = wheel.start(user, kind as u8, ticks(interval)).ok();
    }

    /// Cancel a timer if it is running.
    pub fn reset(&mut self, wheel: &mut TimerWheel, kind: TimerKind) {
        if let Some(token) = self.slots[kind as usize].take() {
            wheel.stop(token);
        }
    }

    pub fn reset_all(&mut self, wheel: &mut TimerWheel) {
        for slot in &mut self.slots {
            if let Some(token) = slot.take() {
                wheel.stop(token);
            }
        }
    }

    pub fn any_active(&self) -> bool {
        self.slots.iter().any(|slot| slot.is_some())
    }

    /// Mark a timer as fired. Called by the worker before running the
    /// expiry handler, so handlers can rearm through `set`.
    pub fn expired(&mut self, kind: TimerKind) {
        self.slots[kind as usize] = None;
    }
}
