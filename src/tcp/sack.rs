/*! SACK scoreboard (RFC 6675).

The scoreboard tracks, within `[snd_una, snd_nxt)`, which byte ranges are
confirmed missing ("holes") versus selectively acknowledged, and drives the
retransmission decisions of loss recovery.

Holes are kept ascending and non-overlapping in an intrusive doubly linked
list backed by a [`Pool`], so the common case of SACK blocks arriving in
ascending order is amortized O(1) per block: the walk cursor only ever
moves forward. Aggregates satisfy

```text
sacked_bytes + lost_bytes + sum(un-lost hole sizes) == snd_nxt - snd_una
```

at all times, where `lost_bytes` is the total size of holes marked lost.
*/

use core::fmt;

use crate::config::{SACK_HOLE_COUNT, SEGMENT_SACK_BLOCK_COUNT};
use crate::storage::{Exhausted, Handle, Pool};
use crate::wire::{SackBlock, SeqNumber};

/// Number of duplicate ACKs (or SACKed segments) that signal loss.
pub const DUPACK_THRESHOLD: usize = 3;

/// An unacknowledged, un-SACKed byte range `[start, end)`.
#[derive(Debug, Clone, Copy)]
pub struct Hole {
    next: Option<Handle>,
    prev: Option<Handle>,
    pub start: SeqNumber,
    pub end: SeqNumber,
    /// Lost per the RFC 6675 heuristic, or wholesale on RTO.
    pub is_lost: bool,
}

impl Hole {
    fn len(&self) -> usize {
        self.end - self.start
    }
}

/// Outcome of a [`Scoreboard::next_rxt_hole`] walk.
#[derive(Debug, Clone, Copy, Default)]
pub struct RxtNext {
    /// The hole to retransmit from, if any.
    pub hole: Option<Handle>,
    /// No candidate, but one un-SACKed rescue probe past `high_sacked` is
    /// permitted this round.
    pub can_rescue: bool,
    /// The candidate sits beyond `high_sacked`; the sender is limited, not
    /// the network.
    pub snd_limited: bool,
}

#[derive(Debug)]
pub struct Scoreboard {
    holes: Pool<Hole>,
    head: Option<Handle>,
    tail: Option<Handle>,
    /// Bytes sacked within the scoreboard.
    pub sacked_bytes: usize,
    /// Bytes newly sacked by the last update.
    pub last_sacked_bytes: usize,
    /// Previously sacked bytes the last cumulative ACK delivered.
    pub last_bytes_delivered: usize,
    /// Retransmitted bytes sacked by the last update.
    pub rxt_sacked: usize,
    /// Highest byte sacked so far.
    pub high_sacked: SeqNumber,
    /// Highest retransmitted sequence this recovery round.
    pub high_rxt: SeqNumber,
    /// Sequence of the rescue retransmission for this round.
    pub rescue_rxt: SeqNumber,
    /// Total size of holes marked lost.
    pub lost_bytes: usize,
    /// Bytes newly marked lost by the last update.
    pub last_lost_bytes: usize,
    /// Walk position for retransmission candidates.
    cur_rxt_hole: Option<Handle>,
    /// The receiver un-acknowledged previously sacked data.
    pub is_reneging: bool,
}

impl Scoreboard {
    pub fn new() -> Scoreboard {
        Scoreboard {
            holes: Pool::new(SACK_HOLE_COUNT),
            head: None,
            tail: None,
            sacked_bytes: 0,
            last_sacked_bytes: 0,
            last_bytes_delivered: 0,
            rxt_sacked: 0,
            high_sacked: SeqNumber::default(),
            high_rxt: SeqNumber::default(),
            rescue_rxt: SeqNumber::default(),
            lost_bytes: 0,
            last_lost_bytes: 0,
            cur_rxt_hole: None,
            is_reneging: false,
        }
    }

    /// Reset to the pristine state, including the recovery markers.
    pub fn init(&mut self) {
        self.clear();
        self.high_sacked = SeqNumber::default();
        self.high_rxt = SeqNumber::default();
        self.rescue_rxt = SeqNumber::default();
    }

    pub fn hole(&self, handle: Handle) -> Option<&Hole> {
        self.holes.get(handle)
    }

    pub fn first_hole(&self) -> Option<Handle> {
        self.head
    }

    pub fn last_hole(&self) -> Option<Handle> {
        self.tail
    }

    pub fn next_hole(&self, handle: Handle) -> Option<Handle> {
        self.holes.get(handle).and_then(|h| h.next)
    }

    pub fn prev_hole(&self, handle: Handle) -> Option<Handle> {
        self.holes.get(handle).and_then(|h| h.prev)
    }

    pub fn hole_count(&self) -> usize {
        self.holes.len()
    }

    pub fn iter(&self) -> HoleIter<'_> {
        HoleIter {
            sb: self,
            cur: self.head,
        }
    }

    /// Insert a hole after `prev`, or at the head when `prev` is `None`.
    fn insert_hole(
        &mut self,
        prev: Option<Handle>,
        start: SeqNumber,
        end: SeqNumber,
    ) -> Result<Handle, Exhausted> {
        debug_assert!(start < end);
        let handle = self.holes.alloc(Hole {
            next: None,
            prev: None,
            start,
            end,
            is_lost: false,
        })?;
        match prev {
            Some(prev) => {
                let next = self.holes.get(prev).and_then(|h| h.next);
                self.holes.get_mut(handle).unwrap().prev = Some(prev);
                self.holes.get_mut(handle).unwrap().next = next;
                self.holes.get_mut(prev).unwrap().next = Some(handle);
                match next {
                    Some(next) => self.holes.get_mut(next).unwrap().prev = Some(handle),
                    None => self.tail = Some(handle),
                }
            }
            None => {
                let next = self.head;
                self.holes.get_mut(handle).unwrap().next = next;
                match next {
                    Some(next) => self.holes.get_mut(next).unwrap().prev = Some(handle),
                    None => self.tail = Some(handle),
                }
                self.head = Some(handle);
            }
        }
        Ok(handle)
    }

    fn remove_hole(&mut self, handle: Handle) {
        let hole = *self.holes.get(handle).expect("removing a stale hole");
        match hole.prev {
            Some(prev) => self.holes.get_mut(prev).unwrap().next = hole.next,
            None => self.head = hole.next,
        }
        match hole.next {
            Some(next) => self.holes.get_mut(next).unwrap().prev = hole.prev,
            None => self.tail = hole.prev,
        }
        if self.cur_rxt_hole == Some(handle) {
            self.cur_rxt_hole = hole.next;
        }
        self.holes.free(handle);
    }

    /// Drop every hole and zero the byte accounting. The high-water marks
    /// (`high_sacked`, `high_rxt`, `rescue_rxt`) survive; see [`Self::init`].
    pub fn clear(&mut self) {
        self.holes.clear();
        self.head = None;
        self.tail = None;
        self.sacked_bytes = 0;
        self.last_sacked_bytes = 0;
        self.last_bytes_delivered = 0;
        self.rxt_sacked = 0;
        self.lost_bytes = 0;
        self.last_lost_bytes = 0;
        self.cur_rxt_hole = None;
        self.is_reneging = false;
    }

    /// Partial reset after the receiver reneged: everything outstanding in
    /// `[start, end)` is considered one lost hole again. Reneging is legal
    /// receiver behavior, not corruption.
    pub fn clear_reneging(&mut self, start: SeqNumber, end: SeqNumber) {
        self.clear();
        let hole = self
            .insert_hole(None, start, end)
            .expect("empty pool cannot be exhausted");
        self.holes.get_mut(hole).unwrap().is_lost = true;
        self.lost_bytes = end - start;
        self.high_sacked = start;
        self.init_rxt(start, end);
    }

    /// Prepare for a retransmission round starting at `snd_una`. If the
    /// scoreboard is empty (e.g. right after an RTO `clear`), seed a single
    /// lost hole spanning the whole unacknowledged window.
    pub fn init_rxt(&mut self, snd_una: SeqNumber, snd_nxt: SeqNumber) {
        if self.head.is_none() && snd_una < snd_nxt {
            let hole = self
                .insert_hole(None, snd_una, snd_nxt)
                .expect("empty pool cannot be exhausted");
            self.holes.get_mut(hole).unwrap().is_lost = true;
            self.lost_bytes = snd_nxt - snd_una;
            self.last_lost_bytes = self.lost_bytes;
        }
        self.high_rxt = snd_una;
        self.rescue_rxt = snd_una - 1;
        self.cur_rxt_hole = self.head;
    }

    /// Merge the received SACK `blocks` (and the cumulative `ack`) into the
    /// hole set.
    ///
    /// Must be called with the *pre-ACK* `snd_una`; the cumulative ACK is
    /// folded in as a synthetic block `[snd_una, ack)`. `has_rxt` says
    /// whether the connection is in a recovery episode, enabling the
    /// retransmitted-bytes-sacked accounting.
    pub fn update(
        &mut self,
        ack: SeqNumber,
        snd_una: SeqNumber,
        snd_nxt: SeqNumber,
        blocks: &[SackBlock],
        snd_mss: usize,
        has_rxt: bool,
    ) -> Result<(), Exhausted> {
        self.last_sacked_bytes = 0;
        self.last_bytes_delivered = 0;
        self.last_lost_bytes = 0;
        self.rxt_sacked = 0;

        if blocks.is_empty() && self.head.is_none() {
            return Ok(());
        }

        // Keep well-formed blocks above the cumulative ack and inside the
        // send window; fold the ack itself in as the lowest block.
        let mut sacks: heapless::Vec<SackBlock, { SEGMENT_SACK_BLOCK_COUNT + 1 }> =
            heapless::Vec::new();
        for blk in blocks {
            if blk.start < blk.end
                && blk.start > snd_una
                && blk.start > ack
                && blk.end <= snd_nxt
            {
                // Capacity equals the wire maximum plus the ack block.
                let _ = sacks.push(*blk);
            }
        }
        if ack > snd_una {
            let _ = sacks.push(SackBlock::new(snd_una, ack));
        }
        if sacks.is_empty() {
            return Ok(());
        }
        sacks.sort_unstable_by(|a, b| a.start.partial_cmp(&b.start).unwrap());

        let old_sacked = self.sacked_bytes;

        if self.head.is_none() {
            // First blocks for this window: everything outstanding is a
            // hole until proven sacked below.
            self.insert_hole(None, snd_una, snd_nxt)?;
            self.high_sacked = sacks.last().unwrap().end;
        } else {
            // Outstanding data may have grown past the last hole.
            let last = self.tail.unwrap();
            let (last_start, last_end) = {
                let hole = self.holes.get(last).unwrap();
                (hole.start, hole.end)
            };
            if snd_nxt > last_end {
                if last_start >= self.high_sacked {
                    self.holes.get_mut(last).unwrap().end = snd_nxt;
                } else if self.high_sacked < snd_nxt {
                    self.insert_hole(Some(last), self.high_sacked, snd_nxt)?;
                }
            }
            self.high_sacked = self.high_sacked.max(sacks.last().unwrap().end);
        }

        // Walk holes and blocks in lockstep; both are ascending.
        let mut acked_hole_bytes = 0;
        let mut cur = self.head;
        let mut blk_index = 0;
        while let Some(handle) = cur {
            if blk_index >= sacks.len() {
                break;
            }
            let blk = sacks[blk_index];
            let (start, end) = {
                let hole = self.holes.get(handle).unwrap();
                (hole.start, hole.end)
            };

            if blk.end <= start {
                // Block entirely below this hole (already-sacked region).
                blk_index += 1;
                continue;
            }
            if blk.start >= end {
                cur = self.next_hole(handle);
                continue;
            }

            let covered_start = blk.start.max(start);
            let covered_end = blk.end.min(end);
            let covered = covered_end - covered_start;
            if blk.end == ack && ack >= covered_end {
                acked_hole_bytes += covered;
            } else {
                self.last_sacked_bytes += covered;
                if has_rxt && covered_start < self.high_rxt {
                    self.rxt_sacked += self.high_rxt.min(covered_end) - covered_start;
                }
            }

            if blk.start <= start && blk.end >= end {
                // Hole fully covered.
                let next = self.next_hole(handle);
                self.remove_hole(handle);
                cur = next;
            } else if blk.start <= start {
                // Covers the low end of the hole.
                self.holes.get_mut(handle).unwrap().start = blk.end;
                blk_index += 1;
            } else if blk.end >= end {
                // Covers the high end of the hole; the block may reach into
                // the next hole as well.
                self.holes.get_mut(handle).unwrap().end = blk.start;
                cur = self.next_hole(handle);
            } else {
                // Block splits the hole.
                self.insert_hole(Some(handle), blk.end, end)?;
                self.holes.get_mut(handle).unwrap().end = blk.start;
                blk_index += 1;
            }
        }

        // Previously sacked bytes the cumulative ack delivered are exactly
        // the acked span minus the holes it plowed through.
        if ack > snd_una {
            self.last_bytes_delivered = (ack - snd_una) - acked_hole_bytes;
        }

        let base = if ack > snd_una { ack } else { snd_una };
        self.update_bytes(base, snd_mss, old_sacked);
        debug_assert!(self.is_sane(base, snd_nxt));
        Ok(())
    }

    /// Recompute `sacked_bytes`/`lost_bytes` from the hole gaps and mark
    /// holes lost per RFC 6675: a hole is lost once at least
    /// `DUPACK_THRESHOLD - 1` MSS worth of bytes (or `DUPACK_THRESHOLD`
    /// blocks) are sacked above it.
    fn update_bytes(&mut self, ack: SeqNumber, snd_mss: usize, old_sacked: usize) {
        self.lost_bytes = 0;
        self.sacked_bytes = 0;

        let Some(mut right) = self.tail else {
            if self.high_sacked > ack {
                self.sacked_bytes = self.high_sacked - ack;
            }
            self.finish_sacked_delta(old_sacked);
            return;
        };

        let mut sacked = 0;
        let mut blks = 0;
        let high_end = self.holes.get(right).unwrap().end;
        if self.high_sacked > high_end {
            sacked = self.high_sacked - high_end;
            blks = 1;
        }

        // Walk towards the head until enough is sacked above to declare
        // everything below lost.
        let mut reached_head = false;
        while sacked < (DUPACK_THRESHOLD - 1) * snd_mss && blks < DUPACK_THRESHOLD {
            let hole = *self.holes.get(right).unwrap();
            if hole.is_lost {
                self.lost_bytes += hole.len();
            }
            match hole.prev {
                Some(left) => {
                    sacked += hole.start - self.holes.get(left).unwrap().end;
                    blks += 1;
                    right = left;
                }
                None => {
                    debug_assert!(hole.start == ack || self.is_reneging || hole.start >= ack);
                    if hole.start > ack {
                        sacked += hole.start - ack;
                    }
                    reached_head = true;
                    break;
                }
            }
        }

        if !reached_head {
            // `right` and everything below it is lost.
            let mut cur = Some(right);
            while let Some(handle) = cur {
                let hole = self.holes.get_mut(handle).unwrap();
                self.lost_bytes += hole.end - hole.start;
                if !hole.is_lost {
                    self.last_lost_bytes += hole.end - hole.start;
                    hole.is_lost = true;
                }
                let hole = *self.holes.get(handle).unwrap();
                match hole.prev {
                    Some(left) => {
                        sacked += hole.start - self.holes.get(left).unwrap().end;
                        cur = Some(left);
                    }
                    None => {
                        if hole.start > ack {
                            sacked += hole.start - ack;
                        }
                        cur = None;
                    }
                }
            }
        }

        self.sacked_bytes = sacked;
        self.finish_sacked_delta(old_sacked);
    }

    fn finish_sacked_delta(&mut self, old_sacked: usize) {
        let carried = old_sacked - self.last_bytes_delivered.min(old_sacked);
        if self.sacked_bytes < carried {
            // The receiver dropped previously sacked ranges from its
            // blocks: reneging.
            self.is_reneging = true;
            self.last_sacked_bytes = 0;
        }
    }

    /// Find the next retransmission candidate at or after `start`
    /// (RFC 6675 NextSeg). `have_unsent` says whether new, never-sent data
    /// is available, which takes priority over un-lost holes.
    pub fn next_rxt_hole(&mut self, start: Option<Handle>, have_unsent: bool) -> RxtNext {
        let mut result = RxtNext::default();

        let mut cur = start.filter(|h| self.holes.contains(*h)).or(self.head);

        // Skip holes already fully retransmitted this round.
        while let Some(handle) = cur {
            let hole = self.holes.get(handle).unwrap();
            if hole.end <= self.high_rxt && hole.is_lost {
                cur = hole.next;
            } else {
                break;
            }
        }

        let Some(handle) = cur else {
            self.cur_rxt_hole = None;
            return result;
        };
        let hole = *self.holes.get(handle).unwrap();

        if hole.is_lost && hole.start < self.high_sacked {
            // Rule (1): lost and below the highest sacked byte.
            self.cur_rxt_hole = Some(handle);
        } else if have_unsent {
            // Rule (2): prefer sending new data.
            self.cur_rxt_hole = None;
            return result;
        } else if hole.start < self.high_sacked {
            // Rule (3): not lost, but sacked data above it.
            if hole.end <= self.high_rxt {
                self.cur_rxt_hole = None;
                return result;
            }
            result.snd_limited = false;
            self.cur_rxt_hole = Some(handle);
        } else {
            // Rule (4): beyond the highest sacked byte. Only a rescue
            // probe is allowed; high_rxt must not move.
            debug_assert!(hole.start >= self.high_sacked);
            result.snd_limited = true;
            result.can_rescue = true;
            return result;
        }

        if self.high_rxt < hole.start {
            self.high_rxt = hole.start;
        }
        result.hole = Some(handle);
        result
    }

    /// Aggregate-consistency check; also drives the debug assertions.
    pub fn is_sane(&self, snd_una: SeqNumber, snd_nxt: SeqNumber) -> bool {
        let mut prev_end: Option<SeqNumber> = None;
        let mut holes_unlost = 0;
        let mut holes_lost = 0;
        let mut cur = self.head;
        while let Some(handle) = cur {
            let hole = self.holes.get(handle).unwrap();
            if hole.start >= hole.end {
                return false;
            }
            if let Some(prev_end) = prev_end {
                if hole.start < prev_end {
                    return false;
                }
            }
            if hole.is_lost {
                holes_lost += hole.len();
            } else {
                holes_unlost += hole.len();
            }
            prev_end = Some(hole.end);
            cur = hole.next;
        }
        if holes_lost != self.lost_bytes {
            return false;
        }
        if self.head.is_some() {
            self.sacked_bytes + self.lost_bytes + holes_unlost == snd_nxt - snd_una
        } else {
            true
        }
    }
}

impl Default for Scoreboard {
    fn default() -> Self {
        Self::new()
    }
}

pub struct HoleIter<'a> {
    sb: &'a Scoreboard,
    cur: Option<Handle>,
}

impl<'a> Iterator for HoleIter<'a> {
    type Item = &'a Hole;

    fn next(&mut self) -> Option<&'a Hole> {
        let hole = self.sb.hole(self.cur?)?;
        self.cur = hole.next;
        Some(hole)
    }
}

impl fmt::Display for Scoreboard {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "sacked {} lost {} high_sacked {} high_rxt {} holes [",
            self.sacked_bytes, self.lost_bytes, self.high_sacked, self.high_rxt
        )?;
        for hole in self.iter() {
            write!(
                f,
                " {}-{}{}",
                hole.start,
                hole.end,
                if hole.is_lost { "!" } else { "" }
            )?;
        }
        write!(f, " ]")
    }
}
