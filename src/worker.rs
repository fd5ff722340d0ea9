/*! Per-thread connection management.

A [`Worker`] owns everything one thread needs to run its share of the
connections: a connection [`Pool`], a [`TimerWheel`], a listener table and
an outbound segment queue. Workers share nothing except the
[`HalfOpenPool`], the rendezvous for active opens whose SYN-ACK may arrive
on a different thread.

The embedder supplies stream buffers and event delivery through the
[`Session`] trait, demultiplexes inbound segments to `(worker, handle)`
pairs, and periodically calls [`Worker::advance`] to expire timers.
*/

use std::sync::Mutex;

use managed::ManagedMap;

use crate::storage::{Exhausted, Handle, Pool};
use crate::tcp::{Config, Connection, ConnectionError, DispatchTable, State};
use crate::tcp::timers::TimerKind;
use crate::time::Instant;
use crate::timer::{TimerEvent, TimerWheel, TICK};
use crate::wire::Segment;

use core::fmt;

/// An outbound segment, referencing payload by sequence range only. The
/// embedder serializes it, pulling `payload_len` bytes starting at
/// `segment.seq` from the connection's stream buffer.
#[derive(Debug, Clone)]
pub struct SegmentRequest {
    pub connection: Handle,
    pub segment: Segment,
    /// Retransmitted range; the embedder must not advance its stream tail.
    pub is_retransmit: bool,
}

/// Worker resources a connection borrows while processing one event.
pub struct Context<'a> {
    pub now: Instant,
    /// The connection's own pool handle, for timer user data.
    pub handle: Handle,
    pub wheel: &'a mut TimerWheel,
    pub tx: &'a mut Vec<SegmentRequest>,
}

/// The embedder's side of one connection: stream buffers and upcalls.
pub trait Session {
    /// Bytes queued for transmission at and beyond `snd_nxt`.
    fn tx_bytes_available(&self) -> usize;

    /// Free receive buffer space, advertised as the window.
    fn rx_space(&self) -> usize;

    /// `count` bytes were acknowledged; the stream tail may advance.
    fn data_delivered(&mut self, count: usize);

    /// The peer sent FIN; no more data will arrive.
    fn remote_closed(&mut self);

    /// The connection terminated in an orderly fashion.
    fn closed(&mut self);

    /// The connection terminated abnormally.
    fn aborted(&mut self, error: ConnectionError);
}

/// Resolves connection handles to their sessions.
pub trait Sessions {
    fn get(&mut self, connection: Handle) -> Option<&mut dyn Session>;
}

/// A passive-open endpoint. Connections spawned from it inherit its
/// configuration.
#[derive(Debug, Clone, Copy)]
pub struct Listener {
    pub port: u16,
    pub config: Config,
}

/// A connection awaiting its SYN-ACK. The connection record itself lives
/// in the owning worker's pool (in SYN-SENT); this is only the
/// cross-thread routing stub.
#[derive(Debug, Clone, Copy)]
pub struct HalfOpen {
    /// Index of the worker that owns the connection.
    pub worker: usize,
    pub connection: Handle,
}

/// The one structure shared between workers. Lookups happen once per
/// handshake, so a plain mutex is fine.
#[derive(Debug)]
pub struct HalfOpenPool {
    inner: Mutex<Pool<HalfOpen>>,
}

impl HalfOpenPool {
    pub fn new(capacity: usize) -> HalfOpenPool {
        HalfOpenPool {
            inner: Mutex::new(Pool::new(capacity)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pool<HalfOpen>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a half-open connection; fails when the pool is full,
    /// which bounds concurrent active opens.
    pub fn open(&self, half_open: HalfOpen) -> Result<Handle, Exhausted> {
        self.lock().alloc(half_open)
    }

    /// Route a SYN-ACK: who owns this half-open connection?
    pub fn get(&self, handle: Handle) -> Option<HalfOpen> {
        self.lock().get(handle).copied()
    }

    /// The handshake finished (either way); drop the stub.
    pub fn complete(&self, handle: Handle) -> Option<HalfOpen> {
        self.lock().free(handle)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Why a SYN could not be turned into a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptError {
    /// No listener is bound to the port.
    NoListener,
    /// The connection pool is full.
    Exhausted,
}

impl fmt::Display for AcceptError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AcceptError::NoListener => write!(f, "no listener on port"),
            AcceptError::Exhausted => write!(f, "connection pool exhausted"),
        }
    }
}

impl core::error::Error for AcceptError {}

/// One thread's share of the engine.
pub struct Worker<'a> {
    index: usize,
    config: Config,
    connections: Pool<Connection>,
    wheel: TimerWheel,
    listeners: ManagedMap<'a, u16, Listener>,
    table: DispatchTable,
    tx: Vec<SegmentRequest>,
    expired: Vec<TimerEvent>,
    iss: u32,
}

impl<'a> Worker<'a> {
    /// `capacity` bounds connections and timers alike; `listeners` is
    /// caller-supplied storage for the listener table.
    pub fn new<T>(index: usize, config: Config, capacity: usize, listeners: T) -> Worker<'a>
    where
        T: Into<ManagedMap<'a, u16, Listener>>,
    {
        Worker {
            index,
            config,
            connections: Pool::new(capacity),
            // Five timers per connection, worst case.
            wheel: TimerWheel::new(capacity * crate::tcp::timers::TIMER_COUNT),
            listeners: listeners.into(),
            table: DispatchTable::new(),
            tx: Vec::new(),
            expired: Vec::new(),
            iss: (index as u32).wrapping_mul(0x9e37_79b9),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn connection(&self, handle: Handle) -> Option<&Connection> {
        self.connections.get(handle)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn next_iss(&mut self) -> crate::wire::SeqNumber {
        self.iss = self.iss.wrapping_add(0x0001_0000);
        crate::wire::SeqNumber(self.iss as i32)
    }

    /// Bind a listener. Inbound SYNs for the port can then be fed to
    /// [`Self::accept`].
    pub fn listen(&mut self, port: u16, config: Config) -> Result<(), Exhausted> {
        match self.listeners.insert(port, Listener { port, config }) {
            Ok(_) => Ok(()),
            Err(_) => Err(Exhausted),
        }
    }

    pub fn unlisten(&mut self, port: u16) {
        self.listeners.remove(&port);
    }

    /// Active open: allocate the connection, emit its SYN and register the
    /// cross-thread half-open stub. Returns the connection handle and the
    /// half-open handle the demultiplexer routes the SYN-ACK by.
    pub fn open(
        &mut self,
        half_open: &HalfOpenPool,
        now: Instant,
    ) -> Result<(Handle, Handle), Exhausted> {
        let iss = self.next_iss();
        let handle = self
            .connections
            .alloc(Connection::new_active(self.config, iss, now))?;
        let stub = match half_open.open(HalfOpen {
            worker: self.index,
            connection: handle,
        }) {
            Ok(stub) => stub,
            Err(e) => {
                self.connections.free(handle);
                return Err(e);
            }
        };
        let conn = self.connections.get_mut(handle).expect("just allocated");
        let mut cx = Context {
            now,
            handle,
            wheel: &mut self.wheel,
            tx: &mut self.tx,
        };
        conn.connect(&mut cx);
        Ok((handle, stub))
    }

    /// Passive open: a SYN arrived for a bound port. Spawns the connection
    /// in SYN-RCVD and emits the SYN-ACK.
    pub fn accept(&mut self, port: u16, syn: &Segment, now: Instant) -> Result<Handle, AcceptError> {
        let config = match self.listeners.get(&port) {
            Some(listener) => listener.config,
            None => return Err(AcceptError::NoListener),
        };
        let iss = self.next_iss();
        let handle = self
            .connections
            .alloc(Connection::new_passive(config, iss, syn, now))
            .map_err(|Exhausted| AcceptError::Exhausted)?;
        let conn = self.connections.get_mut(handle).expect("just allocated");
        let mut cx = Context {
            now,
            handle,
            wheel: &mut self.wheel,
            tx: &mut self.tx,
        };
        conn.accept_reply(&mut cx);
        Ok(handle)
    }

    /// Feed one decoded inbound segment to its connection.
    pub fn handle_segment(
        &mut self,
        handle: Handle,
        seg: &Segment,
        now: Instant,
        sessions: &mut dyn Sessions,
    ) {
        let Some(session) = sessions.get(handle) else {
            return;
        };
        let Some(conn) = self.connections.get_mut(handle) else {
            return;
        };
        let mut cx = Context {
            now,
            handle,
            wheel: &mut self.wheel,
            tx: &mut self.tx,
        };
        conn.handle_segment(&mut cx, session, &self.table, seg);
        if conn.state == State::Closed {
            self.connections.free(handle);
        }
    }

    /// Queue new application data for transmission.
    pub fn send(&mut self, handle: Handle, now: Instant, sessions: &mut dyn Sessions) {
        let Some(session) = sessions.get(handle) else {
            return;
        };
        let Some(conn) = self.connections.get_mut(handle) else {
            return;
        };
        let mut cx = Context {
            now,
            handle,
            wheel: &mut self.wheel,
            tx: &mut self.tx,
        };
        conn.send_data(&mut cx, session);
    }

    /// Application close.
    pub fn close(&mut self, handle: Handle, now: Instant, sessions: &mut dyn Sessions) {
        let Some(session) = sessions.get(handle) else {
            return;
        };
        let Some(conn) = self.connections.get_mut(handle) else {
            return;
        };
        let mut cx = Context {
            now,
            handle,
            wheel: &mut self.wheel,
            tx: &mut self.tx,
        };
        conn.close(&mut cx, session);
        if conn.state == State::Closed {
            self.connections.free(handle);
        }
    }

    /// Immediate abort without notifying the peer.
    pub fn abort(&mut self, handle: Handle, now: Instant) {
        let Some(conn) = self.connections.get_mut(handle) else {
            return;
        };
        let mut cx = Context {
            now,
            handle,
            wheel: &mut self.wheel,
            tx: &mut self.tx,
        };
        conn.teardown(&mut cx);
        self.connections.free(handle);
    }

    /// Advance the timer wheel to `now` and run every expiry handler.
    pub fn advance(&mut self, now: Instant, sessions: &mut dyn Sessions) {
        let tick = (now.total_micros() / TICK.total_micros() as i64) as u64;
        let mut expired = core::mem::take(&mut self.expired);
        self.wheel.advance(tick, &mut expired);
        for event in expired.drain(..) {
            // Teardown cancels timers, so a fired event's slot is live.
            let Some(handle) = self.connections.handle_at(event.user) else {
                continue;
            };
            let Some(kind) = TimerKind::from_id(event.timer_id) else {
                continue;
            };
            let Some(session) = sessions.get(handle) else {
                continue;
            };
            let Some(conn) = self.connections.get_mut(handle) else {
                continue;
            };
            conn.timer_expired(kind);
            let mut cx = Context {
                now,
                handle,
                wheel: &mut self.wheel,
                tx: &mut self.tx,
            };
            conn.on_timer(&mut cx, session, kind);
            if conn.state == State::Closed {
                self.connections.free(handle);
            }
        }
        self.expired = expired;
    }

    /// Drain the outbound segment queue for serialization.
    pub fn drain_tx(&mut self) -> impl Iterator<Item = SegmentRequest> + '_ {
        self.tx.drain(..)
    }

    pub fn pending_tx(&self) -> usize {
        self.tx.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::time::Duration;
    use crate::wire::{SegFlags, SeqNumber};

    struct MockSession {
        tx_available: usize,
        delivered: usize,
        closes: usize,
        abort: Option<ConnectionError>,
    }

    impl MockSession {
        fn new() -> MockSession {
            MockSession {
                tx_available: 0,
                delivered: 0,
                closes: 0,
                abort: None,
            }
        }
    }

    impl Session for MockSession {
        fn tx_bytes_available(&self) -> usize {
            self.tx_available
        }

        fn rx_space(&self) -> usize {
            64 << 10
        }

        fn data_delivered(&mut self, count: usize) {
            self.delivered += count;
        }

        fn remote_closed(&mut self) {}

        fn closed(&mut self) {
            self.closes += 1;
        }

        fn aborted(&mut self, error: ConnectionError) {
            self.abort = Some(error);
        }
    }

    /// Every connection shares one mock session; fine for single
    /// connection tests.
    struct OneSession(MockSession);

    impl Sessions for OneSession {
        fn get(&mut self, _connection: Handle) -> Option<&mut dyn Session> {
            Some(&mut self.0)
        }
    }

    fn worker() -> Worker<'static> {
        Worker::new(
            0,
            Config::default(),
            16,
            ManagedMap::Owned(std::collections::BTreeMap::new()),
        )
    }

    fn syn(seq: u32) -> Segment {
        Segment {
            seq: SeqNumber(seq as i32),
            flags: SegFlags::SYN,
            window: 30_000,
            mss: Some(1460),
            sack_permitted: true,
            ..Segment::default()
        }
    }

    #[test]
    fn test_accept_requires_listener() {
        let mut w = worker();
        let now = Instant::from_millis(0);
        assert_eq!(
            w.accept(80, &syn(1000), now).unwrap_err(),
            AcceptError::NoListener
        );

        w.listen(80, Config::default()).unwrap();
        let handle = w.accept(80, &syn(1000), now).unwrap();
        assert_eq!(w.connection(handle).unwrap().state, State::SynRcvd);
        let out: Vec<_> = w.drain_tx().collect();
        assert_eq!(out.len(), 1);
        assert!(out[0].segment.flags.contains(SegFlags::SYN | SegFlags::ACK));
        assert_eq!(out[0].segment.ack, SeqNumber(1001));

        w.unlisten(80);
        assert_eq!(
            w.accept(80, &syn(2000), now).unwrap_err(),
            AcceptError::NoListener
        );
    }

    #[test]
    fn test_open_registers_half_open() {
        let mut w = worker();
        let ho = HalfOpenPool::new(4);
        let now = Instant::from_millis(0);

        let (conn, stub) = w.open(&ho, now).unwrap();
        assert_eq!(w.connection(conn).unwrap().state, State::SynSent);
        let routed = ho.get(stub).unwrap();
        assert_eq!(routed.worker, 0);
        assert_eq!(routed.connection, conn);
        let out: Vec<_> = w.drain_tx().collect();
        assert!(out[0].segment.flags.contains(SegFlags::SYN));

        // The handshake completes; the stub is dropped.
        let syn_ack = Segment {
            seq: SeqNumber(5000),
            ack: out[0].segment.seq + 1,
            flags: SegFlags::SYN | SegFlags::ACK,
            window: 30_000,
            mss: Some(1460),
            sack_permitted: true,
            ..Segment::default()
        };
        let mut sessions = OneSession(MockSession::new());
        w.handle_segment(conn, &syn_ack, now, &mut sessions);
        assert_eq!(w.connection(conn).unwrap().state, State::Established);
        ho.complete(stub).unwrap();
        assert!(ho.is_empty());
    }

    #[test]
    fn test_half_open_pool_bounds_opens() {
        let mut w = worker();
        let ho = HalfOpenPool::new(2);
        let now = Instant::from_millis(0);
        w.open(&ho, now).unwrap();
        w.open(&ho, now).unwrap();
        assert!(w.open(&ho, now).is_err());
        // The failed open left no connection behind.
        assert_eq!(w.connection_count(), 2);
    }

    #[test]
    fn test_advance_expires_syn_retries_to_abort() {
        let mut w = worker();
        let ho = HalfOpenPool::new(4);
        let mut sessions = OneSession(MockSession::new());
        let mut now = Instant::from_millis(0);

        let (conn, stub) = w.open(&ho, now).unwrap();
        let _ = w.drain_tx().count();

        // Each pass expires one SYN retransmission; the interval doubles
        // after the grace retries, so jump a minute at a time.
        for _ in 0..16 {
            now += Duration::from_secs(60);
            w.advance(now, &mut sessions);
            if sessions.0.abort.is_some() {
                break;
            }
        }
        assert_eq!(sessions.0.abort, Some(ConnectionError::Timeout));
        assert!(w.connection(conn).is_none());
        assert_eq!(w.connection_count(), 0);
        // Retried SYNs were emitted along the way.
        assert!(w.pending_tx() >= Config::default().syn_retries as usize);
        ho.complete(stub);
    }

    #[test]
    fn test_rst_frees_connection_slot() {
        let mut w = worker();
        let now = Instant::from_millis(0);
        let mut sessions = OneSession(MockSession::new());
        w.listen(80, Config::default()).unwrap();
        let handle = w.accept(80, &syn(1000), now).unwrap();
        assert_eq!(w.connection_count(), 1);

        let rst = Segment {
            seq: SeqNumber(1001),
            flags: SegFlags::RST,
            ..Segment::default()
        };
        w.handle_segment(handle, &rst, now, &mut sessions);
        assert!(w.connection(handle).is_none());
        assert_eq!(w.connection_count(), 0);
        assert_eq!(sessions.0.abort, Some(ConnectionError::Refused));
    }

    #[test]
    fn test_send_and_delivery_through_worker() {
        let mut w = worker();
        let now = Instant::from_millis(0);
        let mut sessions = OneSession(MockSession::new());
        w.listen(80, Config::default()).unwrap();
        let handle = w.accept(80, &syn(1000), now).unwrap();
        let iss = w.drain_tx().next().unwrap().segment.seq;

        // Third handshake segment.
        let ack = Segment {
            seq: SeqNumber(1001),
            ack: iss + 1,
            flags: SegFlags::ACK,
            window: 30_000,
            ..Segment::default()
        };
        w.handle_segment(handle, &ack, now, &mut sessions);
        assert_eq!(w.connection(handle).unwrap().state, State::Established);

        sessions.0.tx_available = 3000;
        w.send(handle, now, &mut sessions);
        let out: Vec<_> = w.drain_tx().collect();
        let sent: usize = out.iter().map(|r| r.segment.payload_len).sum();
        assert_eq!(sent, 3000);

        let ack2 = Segment {
            seq: SeqNumber(1001),
            ack: iss + 1 + 3000,
            flags: SegFlags::ACK,
            window: 30_000,
            ..Segment::default()
        };
        sessions.0.tx_available = 0;
        w.handle_segment(handle, &ack2, now + Duration::from_millis(20), &mut sessions);
        assert_eq!(sessions.0.delivered, 3000);
    }

    #[test]
    fn test_abort_releases_everything() {
        let mut w = worker();
        let ho = HalfOpenPool::new(4);
        let now = Instant::from_millis(0);
        let (conn, stub) = w.open(&ho, now).unwrap();
        w.abort(conn, now);
        assert_eq!(w.connection_count(), 0);
        assert_eq!(w.wheel_active(), 0);
        ho.complete(stub);
    }

    impl Worker<'_> {
        fn wheel_active(&self) -> usize {
            self.wheel.active()
        }
    }
}
