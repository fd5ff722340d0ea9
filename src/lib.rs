/*! A per-connection TCP transport engine.

_tcpcore_ implements the hard middle of a TCP stack: the RFC 793 connection
state machine, a pluggable congestion-control framework with NewReno as the
reference algorithm, an RFC 6675 SACK scoreboard, a delivery-rate byte
tracker and a multi-timer retransmission subsystem driven by a hierarchical
timer wheel.

It deliberately does *not* touch bytes on the wire. Segments arrive already
decoded ([`wire::Segment`]) and leave as [`worker::SegmentRequest`]s for an
external encoder; application data lives in an external stream buffer that
the engine only sees as byte counts through the [`worker::Session`] trait.
Neighbor resolution, checksums, demultiplexing and framing are likewise the
embedder's business.

# Concurrency model

Each worker thread owns a [`worker::Worker`]: a disjoint connection pool, a
private timer wheel and pending-event queues. A connection is created on,
and mutated by, exactly one worker for its entire lifetime, so the hot path
takes no locks. The single cross-thread structure is the
[`worker::HalfOpenPool`] for connections awaiting handshake completion,
because active open and SYN-ACK arrival may happen on different threads.

All operations are synchronous and non-blocking; the embedder drives the
engine with segment arrivals, application requests and periodic calls to
[`worker::Worker::advance`] which expires timers.
*/

#[macro_use]
mod macros;

pub mod config;
pub mod storage;
pub mod tcp;
pub mod time;
pub mod timer;
pub mod wire;
pub mod worker;
