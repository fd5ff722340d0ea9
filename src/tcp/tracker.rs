/*! Delivery rate estimation.

The byte tracker timestamps ranges of sent bytes so that, when a range is
acknowledged, the engine can compute how much data was delivered over the
interval the range was in flight. The resulting [`RateSample`]s feed
rate-based congestion controllers.

Samples live in a [`Pool`] and are ordered by a sorted handle index; the
ascending-sequence common case makes inserts append-only and lookups a
binary search. Tracking is best effort: when the sample pool fills up the
affected range simply goes unsampled, which only widens the next rate
sample's interval.
*/

use crate::config::BT_SAMPLE_COUNT;
use crate::storage::{Handle, Pool};
use crate::time::{Duration, Instant};
use crate::wire::{SackBlock, SeqNumber};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BtFlags: u8 {
        /// The range was retransmitted at least once.
        const IS_RXT = 0x01;
        /// The sender had no data to send when the range was transmitted.
        const IS_APP_LIMITED = 0x02;
        /// The range was delivered out of order.
        const IS_SACKED = 0x04;
        /// The range was retransmitted after being marked lost.
        const IS_RXT_LOST = 0x08;
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    min_seq: SeqNumber,
    max_seq: SeqNumber,
    /// Connection delivered count when the range was (last) transmitted.
    delivered: usize,
    delivered_time: Instant,
    tx_time: Instant,
    /// Transmit time of the first transmission, surviving retransmits.
    first_tx_time: Instant,
    flags: BtFlags,
}

/// One acknowledgment's worth of delivery rate data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSample {
    /// Connection delivered count when the sampled range was sent.
    pub prior_delivered: usize,
    pub prior_time: Instant,
    /// Ack interval: now minus `prior_time`.
    pub interval_time: Duration,
    /// Round trip as seen by the sampled range.
    pub rtt_time: Duration,
    /// First transmission of the sampled range. Later than `prior_time`
    /// minus `rtt_time` only when the range was retransmitted; rate
    /// controllers use it to discount `IS_RXT` samples.
    pub first_tx_time: Instant,
    /// Bytes delivered over `interval_time`.
    pub delivered: usize,
    /// Bytes this acknowledgment delivered, cumulatively or selectively.
    pub acked_and_sacked: usize,
    /// Bytes newly marked lost alongside this acknowledgment.
    pub lost: usize,
    pub flags: BtFlags,
}

/// The winning sample of one acknowledgment, before finalization.
#[derive(Debug, Clone, Copy)]
struct Best {
    prior_delivered: usize,
    prior_time: Instant,
    tx_time: Instant,
    first_tx_time: Instant,
    flags: BtFlags,
}

/// Tracks sent byte ranges for delivery rate estimation.
#[derive(Debug)]
pub struct ByteTracker {
    samples: Pool<Sample>,
    /// Handles sorted by `min_seq`; ranges are disjoint.
    lookup: Vec<Handle>,
}

impl ByteTracker {
    pub fn new() -> ByteTracker {
        ByteTracker {
            samples: Pool::new(BT_SAMPLE_COUNT),
            lookup: Vec::new(),
        }
    }

    pub fn sample_count(&self) -> usize {
        self.lookup.len()
    }

    /// Drop all samples, e.g. when the tracking state went stale across an
    /// RTO.
    pub fn flush_samples(&mut self) {
        self.samples.clear();
        self.lookup.clear();
    }

    /// Position of the first sample with `min_seq >= seq`.
    fn lower_bound(&self, seq: SeqNumber) -> usize {
        self.lookup
            .partition_point(|&h| self.samples.get(h).map_or(false, |s| s.min_seq < seq))
    }

    /// Index of the sample containing `seq`, if any.
    fn position_of(&self, seq: SeqNumber) -> Option<usize> {
        let pos = self.lower_bound(seq);
        if let Some(&h) = self.lookup.get(pos) {
            if self.samples.get(h)?.min_seq == seq {
                return Some(pos);
            }
        }
        let pos = pos.checked_sub(1)?;
        let sample = self.samples.get(self.lookup[pos])?;
        if seq < sample.max_seq { Some(pos) } else { None }
    }

    /// Record a transmission of `len` new bytes starting at `snd_nxt`.
    ///
    /// `delivered` and `delivered_time` snapshot the connection's delivery
    /// state at transmit time.
    pub fn track_tx(
        &mut self,
        snd_nxt: SeqNumber,
        len: usize,
        now: Instant,
        delivered: usize,
        delivered_time: Instant,
        app_limited: bool,
    ) {
        debug_assert!(len > 0);
        // Back-to-back sends within a tick extend the tail sample.
        if let Some(&tail) = self.lookup.last() {
            if let Some(sample) = self.samples.get_mut(tail) {
                if sample.max_seq == snd_nxt
                    && sample.tx_time == now
                    && sample.flags.contains(BtFlags::IS_APP_LIMITED) == app_limited
                {
                    sample.max_seq = sample.max_seq + len;
                    return;
                }
            }
        }
        let mut flags = BtFlags::empty();
        if app_limited {
            flags |= BtFlags::IS_APP_LIMITED;
        }
        let sample = Sample {
            min_seq: snd_nxt,
            max_seq: snd_nxt + len,
            delivered,
            delivered_time,
            tx_time: now,
            first_tx_time: now,
            flags,
        };
        match self.samples.alloc(sample) {
            Ok(handle) => self.lookup.push(handle),
            Err(_) => net_trace!("byte tracker full, range {} not sampled", snd_nxt),
        }
    }

    /// Split the sample at `pos` so a sample boundary falls on `seq`.
    /// Returns `false` when the pool has no room for the upper half.
    fn split_at(&mut self, pos: usize, seq: SeqNumber) -> bool {
        let handle = self.lookup[pos];
        let sample = match self.samples.get(handle) {
            Some(s) => *s,
            None => return false,
        };
        debug_assert!(sample.min_seq < seq && seq < sample.max_seq);
        let upper = Sample {
            min_seq: seq,
            ..sample
        };
        match self.samples.alloc(upper) {
            Ok(new) => {
                self.samples.get_mut(handle).unwrap().max_seq = seq;
                self.lookup.insert(pos + 1, new);
                true
            }
            Err(_) => false,
        }
    }

    /// Record a retransmission of `[start, end)`. Overlapped samples are
    /// re-stamped with the current delivery state; `first_tx_time` keeps
    /// the original transmit time.
    pub fn track_rxt(
        &mut self,
        start: SeqNumber,
        end: SeqNumber,
        now: Instant,
        delivered: usize,
        delivered_time: Instant,
        was_lost: bool,
    ) {
        debug_assert!(start < end);
        // Align sample boundaries to the retransmitted range.
        if let Some(pos) = self.position_of(start) {
            let min_seq = self
                .samples
                .get(self.lookup[pos])
                .map(|s| s.min_seq);
            if min_seq.is_some_and(|min| min < start) && !self.split_at(pos, start) {
                return;
            }
        }
        if let Some(pos) = self.position_of(end) {
            let min_seq = self
                .samples
                .get(self.lookup[pos])
                .map(|s| s.min_seq);
            if min_seq.is_some_and(|min| min < end) && !self.split_at(pos, end) {
                return;
            }
        }

        let mut pos = self.lower_bound(start);
        while pos < self.lookup.len() {
            let sample = match self.samples.get_mut(self.lookup[pos]) {
                Some(s) => s,
                None => break,
            };
            if sample.min_seq >= end {
                break;
            }
            debug_assert!(sample.max_seq <= end);
            sample.delivered = delivered;
            sample.delivered_time = delivered_time;
            sample.tx_time = now;
            sample.flags |= BtFlags::IS_RXT;
            if was_lost {
                sample.flags |= BtFlags::IS_RXT_LOST;
            }
            pos += 1;
        }
    }

    /// Fold `sample` into the selection. Among all ranges this
    /// acknowledgment delivered, the one sent with the highest delivered
    /// count gives the tightest (most recent) interval.
    fn consume(best: &mut Option<Best>, sample: &Sample) {
        let replace = match best {
            Some(best) => sample.delivered > best.prior_delivered,
            None => true,
        };
        if replace {
            *best = Some(Best {
                prior_delivered: sample.delivered,
                prior_time: sample.delivered_time,
                tx_time: sample.tx_time,
                first_tx_time: sample.first_tx_time,
                flags: sample.flags,
            });
        }
    }

    /// Retire samples delivered by this acknowledgment and derive its
    /// [`RateSample`].
    ///
    /// `snd_una` is the post-ACK cumulative mark and `sack_blocks` the
    /// blocks of the triggering segment. `delivered` is the connection's
    /// updated delivered total; `acked_and_sacked` and `lost` are the
    /// byte counts attributable to this acknowledgment.
    pub fn sample_delivery_rate(
        &mut self,
        snd_una: SeqNumber,
        sack_blocks: &[SackBlock],
        now: Instant,
        delivered: usize,
        acked_and_sacked: usize,
        lost: usize,
    ) -> Option<RateSample> {
        let mut best: Option<Best> = None;

        // Cumulatively delivered samples retire from the front.
        let mut retired = 0;
        for &handle in &self.lookup {
            let Some(sample) = self.samples.get(handle) else {
                break;
            };
            if sample.max_seq > snd_una {
                break;
            }
            Self::consume(&mut best, sample);
            retired += 1;
        }
        for handle in self.lookup.drain(..retired) {
            self.samples.free(handle);
        }
        // A sample straddling snd_una contributes its delivered lower part.
        if let Some(&head) = self.lookup.first() {
            if let Some(sample) = self.samples.get_mut(head) {
                if sample.min_seq < snd_una {
                    let sample = *sample;
                    Self::consume(&mut best, &sample);
                    self.samples.get_mut(head).unwrap().min_seq = snd_una;
                }
            }
        }

        // Selectively delivered samples retire out of order.
        for blk in sack_blocks {
            if blk.start >= blk.end || blk.end <= snd_una {
                continue;
            }
            self.retire_sacked(blk.start.max(snd_una), blk.end, &mut best);
        }

        let best = best?;
        Some(RateSample {
            prior_delivered: best.prior_delivered,
            prior_time: best.prior_time,
            interval_time: now - best.prior_time,
            rtt_time: now - best.tx_time,
            first_tx_time: best.first_tx_time,
            delivered: delivered - best.prior_delivered.min(delivered),
            acked_and_sacked,
            lost,
            flags: best.flags,
        })
    }

    fn retire_sacked(&mut self, start: SeqNumber, end: SeqNumber, best: &mut Option<Best>) {
        if let Some(pos) = self.position_of(start) {
            let min = self.samples.get(self.lookup[pos]).map(|s| s.min_seq);
            if min.is_some_and(|min| min < start) && !self.split_at(pos, start) {
                return;
            }
        }
        if let Some(pos) = self.position_of(end) {
            let min = self.samples.get(self.lookup[pos]).map(|s| s.min_seq);
            if min.is_some_and(|min| min < end) && !self.split_at(pos, end) {
                return;
            }
        }
        let first = self.lower_bound(start);
        let mut last = first;
        while let Some(&handle) = self.lookup.get(last) {
            let Some(sample) = self.samples.get(handle) else {
                break;
            };
            if sample.min_seq >= end {
                break;
            }
            let mut sample = *sample;
            sample.flags |= BtFlags::IS_SACKED;
            Self::consume(best, &sample);
            last += 1;
        }
        for handle in self.lookup.drain(first..last) {
            self.samples.free(handle);
        }
    }

    #[cfg(test)]
    fn ranges(&self) -> Vec<(u32, u32)> {
        self.lookup
            .iter()
            .filter_map(|&h| self.samples.get(h))
            .map(|s| (s.min_seq.0 as u32, s.max_seq.0 as u32))
            .collect()
    }
}

impl Default for ByteTracker {
    fn default() -> Self {
        Self::new()
    }
}
