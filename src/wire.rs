/*! Decoded segment model.

The engine consumes and produces *decoded* segments. Parsing a TCP header
into a [`Segment`] and serializing one back out (including checksums and
option encoding) is the embedder's job; everything here is already in host
byte order and validated for well-formedness.
*/

use core::{cmp, fmt, ops};

use crate::config::SEGMENT_SACK_BLOCK_COUNT;

/// A TCP sequence number.
///
/// A sequence number is a monotonically advancing integer modulo
/// 2<sup>32</sup>. Sequence numbers do not have a discontinuity when
/// compared across the ring, as long as the compared numbers are no more
/// than 2<sup>31</sup> apart, which RFC 793 window rules guarantee.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct SeqNumber(pub i32);

impl SeqNumber {
    pub fn max(self, rhs: SeqNumber) -> SeqNumber {
        if self > rhs { self } else { rhs }
    }

    pub fn min(self, rhs: SeqNumber) -> SeqNumber {
        if self < rhs { self } else { rhs }
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0 as u32)
    }
}

impl ops::Add<usize> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: usize) -> SeqNumber {
        if rhs > i32::MAX as usize {
            panic!("attempt to add to sequence number with unsigned overflow")
        }
        SeqNumber(self.0.wrapping_add(rhs as i32))
    }
}

impl ops::Sub<usize> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: usize) -> SeqNumber {
        if rhs > i32::MAX as usize {
            panic!("attempt to subtract from sequence number with unsigned overflow")
        }
        SeqNumber(self.0.wrapping_sub(rhs as i32))
    }
}

impl ops::AddAssign<usize> for SeqNumber {
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl ops::Sub for SeqNumber {
    type Output = usize;

    fn sub(self, rhs: SeqNumber) -> usize {
        let result = self.0.wrapping_sub(rhs.0);
        if result < 0 {
            panic!("attempt to subtract sequence numbers with underflow")
        }
        result as usize
    }
}

impl cmp::PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &SeqNumber) -> Option<cmp::Ordering> {
        self.0.wrapping_sub(other.0).partial_cmp(&0)
    }
}

bitflags::bitflags! {
    /// TCP header flag bits, in wire order.
    ///
    /// The low six bits index the connection dispatch table, so the values
    /// must match the header layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SegFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

impl fmt::Display for SegFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{name}")?;
            first = false;
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}

/// A selectively acknowledged range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SackBlock {
    pub start: SeqNumber,
    pub end: SeqNumber,
}

impl SackBlock {
    pub fn new(start: SeqNumber, end: SeqNumber) -> SackBlock {
        SackBlock { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for SackBlock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{},{})", self.start, self.end)
    }
}

/// The SACK blocks carried by one segment.
pub type SackBlocks = heapless::Vec<SackBlock, SEGMENT_SACK_BLOCK_COUNT>;

/// Decoded timestamp option (RFC 7323).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimestampRepr {
    pub tsval: u32,
    pub tsecr: u32,
}

/// A decoded TCP segment.
///
/// `window` is the raw header field; scaling it by the negotiated shift is
/// the connection's job since the shift does not apply to SYN segments.
#[derive(Debug, Clone, Default)]
pub struct Segment {
    pub seq: SeqNumber,
    pub ack: SeqNumber,
    pub flags: SegFlags,
    pub window: u16,
    pub payload_len: usize,
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub sack_permitted: bool,
    pub sack_blocks: SackBlocks,
    pub timestamp: Option<TimestampRepr>,
}

impl Segment {
    /// The sequence number following this segment, counting SYN and FIN.
    pub fn seq_end(&self) -> SeqNumber {
        self.seq
            + self.payload_len
            + usize::from(self.flags.contains(SegFlags::SYN))
            + usize::from(self.flags.contains(SegFlags::FIN))
    }

    pub fn is_ack(&self) -> bool {
        self.flags.contains(SegFlags::ACK)
    }

    pub fn is_syn(&self) -> bool {
        self.flags.contains(SegFlags::SYN)
    }

    pub fn is_fin(&self) -> bool {
        self.flags.contains(SegFlags::FIN)
    }

    pub fn is_rst(&self) -> bool {
        self.flags.contains(SegFlags::RST)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_seq_wraparound_cmp() {
        let a = SeqNumber(i32::MAX);
        let b = a + 10;
        assert!(b > a);
        assert_eq!(b - a, 10);
    }

    #[test]
    fn test_seq_difference() {
        assert_eq!(SeqNumber(1500) - SeqNumber(1000), 500);
    }

    #[test]
    fn test_seq_end_counts_syn_fin() {
        let seg = Segment {
            seq: SeqNumber(100),
            flags: SegFlags::SYN | SegFlags::FIN,
            payload_len: 10,
            ..Segment::default()
        };
        assert_eq!(seg.seq_end(), SeqNumber(112));
    }
}
