/*! Transmission Control Protocol.

A [`Connection`] is the per-connection engine: the RFC 793 state machine,
acknowledgment processing, SACK-based loss recovery, delivery rate
tracking and the five connection timers. It owns no buffers and no
sockets; payload bytes live in the embedder's stream buffers and are
referenced by sequence number only.

A connection is created, mutated and destroyed on a single worker thread.
Inbound segments are dispatched through a fully enumerated
`(state, flags)` table; each entry routes to one of a handful of
processors, and combinations the protocol does not define are dropped and
counted.
*/

use core::fmt;

use crate::time::{Duration, Instant};
use crate::wire::{SegFlags, Segment, SeqNumber, TimestampRepr};
use crate::worker::{Context, SegmentRequest, Session};

pub mod congestion;
pub mod sack;
pub mod timers;
pub mod tracker;

use self::congestion::{AnyController, CcEvent, CcInput, CongAck, CongestionVars, Controller};
use self::sack::{Scoreboard, DUPACK_THRESHOLD};
use self::timers::{TimerKind, Timers};
use self::tracker::{ByteTracker, RateSample};

/// Retransmission timeout floor. Deliberately below the RFC 6298 1 s
/// minimum; with the 100 ms tick this still leaves two full ticks.
pub const RTO_MIN: Duration = Duration::from_millis(200);
pub const RTO_MAX: Duration = Duration::from_secs(60);
/// Timeout before the first RTT measurement.
pub const RTO_INIT: Duration = Duration::from_secs(1);
/// SYN retries before the retransmission interval starts doubling.
pub const RTO_SYN_RETRIES: u32 = 3;
/// Retransmission backoffs tolerated before the connection is torn down.
pub const RTO_BOFF_MAX: u32 = 8;
/// Retransmission burst cap per acknowledgment.
const RXT_MAX_BURST: usize = 16;

/// The RFC 793 connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum State {
    Closed = 0,
    Listen = 1,
    SynSent = 2,
    SynRcvd = 3,
    Established = 4,
    CloseWait = 5,
    FinWait1 = 6,
    LastAck = 7,
    Closing = 8,
    FinWait2 = 9,
    TimeWait = 10,
}

pub const STATE_COUNT: usize = 11;

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            State::Closed => write!(f, "CLOSED"),
            State::Listen => write!(f, "LISTEN"),
            State::SynSent => write!(f, "SYN-SENT"),
            State::SynRcvd => write!(f, "SYN-RCVD"),
            State::Established => write!(f, "ESTABLISHED"),
            State::CloseWait => write!(f, "CLOSE-WAIT"),
            State::FinWait1 => write!(f, "FIN-WAIT-1"),
            State::LastAck => write!(f, "LAST-ACK"),
            State::Closing => write!(f, "CLOSING"),
            State::FinWait2 => write!(f, "FIN-WAIT-2"),
            State::TimeWait => write!(f, "TIME-WAIT"),
        }
    }
}

/// Why a connection terminated abnormally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    /// The peer sent RST.
    Reset,
    /// The peer refused the connection during the handshake.
    Refused,
    /// Retransmission backoff was exhausted.
    Timeout,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionError::Reset => write!(f, "connection reset"),
            ConnectionError::Refused => write!(f, "connection refused"),
            ConnectionError::Timeout => write!(f, "connection timed out"),
        }
    }
}

impl core::error::Error for ConnectionError {}

/// Where the dispatch table routes a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    /// Not a defined combination for the state; drop and count.
    Drop,
    /// Answer with RST (or process an inbound RST fatally).
    Reset,
    SynSent,
    RcvProcess,
    Established,
}

/// Drop accounting attached to a table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropKind {
    None,
    Dispatch,
    AckInvalid,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    dispatch: Dispatch,
    drop_kind: DropKind,
}

/// The `(state, flag-bits)` dispatch table: 11 states by 64 combinations
/// of the low six header flags. Unmapped combinations drop the segment
/// and count a protocol error.
pub struct DispatchTable {
    entries: [[Entry; 64]; STATE_COUNT],
}

impl DispatchTable {
    pub fn new() -> DispatchTable {
        const F: u8 = SegFlags::FIN.bits();
        const S: u8 = SegFlags::SYN.bits();
        const R: u8 = SegFlags::RST.bits();
        const A: u8 = SegFlags::ACK.bits();

        let mut table = DispatchTable {
            entries: [[Entry {
                dispatch: Dispatch::Drop,
                drop_kind: DropKind::Dispatch,
            }; 64]; STATE_COUNT],
        };

        // PSH and URG never affect routing; every mapping covers all four
        // of their combinations.
        let mut set = |state: State, flags: u8, dispatch: Dispatch, drop_kind: DropKind| {
            const P: u8 = SegFlags::PSH.bits();
            const U: u8 = SegFlags::URG.bits();
            for extra in [0, P, U, P | U] {
                table.entries[state as usize][(flags | extra) as usize] = Entry {
                    dispatch,
                    drop_kind,
                };
            }
        };

        use Dispatch::*;
        use DropKind::None as Ok_;

        // A closed connection answers everything but RST with RST.
        for flags in [S, S | A, A, F | A, F] {
            set(State::Closed, flags, Reset, DropKind::AckInvalid);
        }
        set(State::Closed, R, Drop, Ok_);
        set(State::Closed, R | A, Drop, Ok_);

        // Listeners are separate records; a connection parked in LISTEN
        // only ever refuses.
        set(State::Listen, S, Drop, Ok_);
        set(State::Listen, A, Reset, DropKind::AckInvalid);
        set(State::Listen, S | A, Reset, DropKind::AckInvalid);
        set(State::Listen, F | A, Reset, DropKind::AckInvalid);
        set(State::Listen, R, Drop, Ok_);
        set(State::Listen, R | A, Drop, Ok_);

        for flags in [S, S | A, A, R, R | A, F | A] {
            set(State::SynSent, flags, SynSent, Ok_);
        }

        for flags in [A, F | A, S, S | A, R, R | A] {
            set(State::SynRcvd, flags, RcvProcess, Ok_);
        }

        for flags in [A, F | A, S, S | A] {
            set(State::Established, flags, Established, Ok_);
        }
        set(State::Established, R, Reset, Ok_);
        set(State::Established, R | A, Reset, Ok_);

        for state in [
            State::CloseWait,
            State::FinWait1,
            State::LastAck,
            State::Closing,
            State::FinWait2,
        ] {
            for flags in [A, F | A, S, S | A] {
                set(state, flags, RcvProcess, Ok_);
            }
            set(state, R, Reset, Ok_);
            set(state, R | A, Reset, Ok_);
        }

        // RST in TIME-WAIT is ignored, not fatal.
        set(State::TimeWait, A, RcvProcess, Ok_);
        set(State::TimeWait, F | A, RcvProcess, Ok_);
        set(State::TimeWait, R, Drop, Ok_);
        set(State::TimeWait, R | A, Drop, Ok_);

        table
    }

    fn lookup(&self, state: State, flags: SegFlags) -> Entry {
        self.entries[state as usize][(flags.bits() & 0x3f) as usize]
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection parameters, read once at connection initialization.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Maximum segment size offered and defaulted to when the peer offers
    /// none.
    pub mss: usize,
    /// Send buffer bound; the congestion window never grows past it.
    pub tx_buffer_size: usize,
    pub rx_buffer_size: usize,
    /// Congestion algorithm, by registered name.
    pub cc_algo: &'static str,
    /// Initial window in MSS units; 0 selects the RFC 5681 default.
    pub initial_cwnd_multiplier: usize,
    pub delack_time: Duration,
    /// 2MSL hold in TIME-WAIT.
    pub timewait_time: Duration,
    /// Guard timeout for the half-close states.
    pub finwait_time: Duration,
    /// SYN retransmissions before the connection is reported timed out.
    pub syn_retries: u32,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            mss: 1460,
            tx_buffer_size: 64 << 10,
            rx_buffer_size: 64 << 10,
            cc_algo: "newreno",
            initial_cwnd_multiplier: 0,
            delack_time: Duration::from_millis(100),
            timewait_time: Duration::from_secs(10),
            finwait_time: Duration::from_secs(10),
            syn_retries: 6,
        }
    }
}

/// RFC 6298 retransmission timeout estimation.
#[derive(Debug, Clone, Copy, Default)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
}

impl RttEstimator {
    pub fn new() -> RttEstimator {
        RttEstimator::default()
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn sample(&mut self, measured: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(measured);
                self.rttvar = measured / 2;
            }
            Some(srtt) => {
                let delta = if srtt > measured {
                    srtt - measured
                } else {
                    measured - srtt
                };
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                self.srtt = Some((srtt * 7 + measured) / 8);
            }
        }
    }

    pub fn rto(&self) -> Duration {
        match self.srtt {
            None => RTO_INIT,
            Some(srtt) => {
                let var = (self.rttvar * 4).max(crate::timer::TICK);
                (srtt + var).clamp(RTO_MIN, RTO_MAX)
            }
        }
    }
}

/// Window-check failures that drop a segment without affecting state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftErrors {
    pub below_data_wnd: u64,
    pub above_data_wnd: u64,
    pub below_ack_wnd: u64,
    pub above_ack_wnd: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub segs_in: u64,
    pub segs_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub dupacks_in: u64,
    pub rxt_segs: u64,
    pub rxt_bytes: u64,
    pub protocol_errors: u64,
}

#[derive(Debug)]
pub struct Connection {
    pub state: State,

    // Sequence space (RFC 793 names).
    iss: SeqNumber,
    irs: SeqNumber,
    snd_una: SeqNumber,
    snd_nxt: SeqNumber,
    snd_wnd: usize,
    snd_wl1: SeqNumber,
    snd_wl2: SeqNumber,
    rcv_nxt: SeqNumber,
    rcv_wnd: usize,

    // Negotiated options.
    snd_mss: usize,
    snd_wscale: u8,
    sack_permitted: bool,
    timestamps: bool,
    ts_recent: u32,

    // Congestion state.
    cc: AnyController,
    cc_vars: CongestionVars,
    sb: Scoreboard,
    bt: ByteTracker,

    // Recovery episode.
    fast_recovery: bool,
    rto_recovery: bool,
    snd_congestion: SeqNumber,
    snd_rxt_bytes: usize,
    rxt_delivered: usize,
    /// Our timestamp value at the first retransmission of the episode;
    /// an echo older than this proves the retransmission spurious.
    snd_rxt_ts: u32,
    dupacks: u32,

    // Timers and timeout state.
    timers: Timers,
    rtt: RttEstimator,
    /// Sequence currently being timed and its transmit instant.
    rtt_ts: Option<(SeqNumber, Instant)>,
    rto_boff: u32,
    persist_boff: u32,

    // Delivery accounting for the byte tracker.
    delivered: usize,
    delivered_time: Instant,
    /// Delivered mark below which rate samples are application limited.
    app_limited: Option<usize>,

    fin_sent: bool,
    ack_pending: bool,

    pub soft_errors: SoftErrors,
    pub stats: Stats,
    cfg: Config,
}

impl Connection {
    fn new(cfg: Config, iss: SeqNumber, now: Instant) -> Connection {
        let cc = AnyController::from_name(cfg.cc_algo)
            .unwrap_or(AnyController::NewReno(congestion::NewReno::new()));
        Connection {
            state: State::Closed,
            iss,
            irs: SeqNumber::default(),
            snd_una: iss,
            snd_nxt: iss,
            snd_wnd: 0,
            snd_wl1: SeqNumber::default(),
            snd_wl2: SeqNumber::default(),
            rcv_nxt: SeqNumber::default(),
            rcv_wnd: cfg.rx_buffer_size,
            snd_mss: cfg.mss,
            snd_wscale: 0,
            sack_permitted: true,
            timestamps: true,
            ts_recent: 0,
            cc,
            cc_vars: CongestionVars::default(),
            sb: Scoreboard::new(),
            bt: ByteTracker::new(),
            fast_recovery: false,
            rto_recovery: false,
            snd_congestion: iss,
            snd_rxt_bytes: 0,
            rxt_delivered: 0,
            snd_rxt_ts: 0,
            dupacks: 0,
            timers: Timers::new(),
            rtt: RttEstimator::new(),
            rtt_ts: None,
            rto_boff: 0,
            persist_boff: 0,
            delivered: 0,
            delivered_time: now,
            app_limited: None,
            fin_sent: false,
            ack_pending: false,
            soft_errors: SoftErrors::default(),
            stats: Stats::default(),
            cfg,
        }
    }

    /// Active open: SYN goes out, RETRANSMIT_SYN is armed by the worker.
    pub fn new_active(cfg: Config, iss: SeqNumber, now: Instant) -> Connection {
        let mut conn = Connection::new(cfg, iss, now);
        conn.state = State::SynSent;
        conn
    }

    /// Passive open from a listener's SYN: straight to SYN-RCVD.
    pub fn new_passive(cfg: Config, iss: SeqNumber, syn: &Segment, now: Instant) -> Connection {
        debug_assert!(syn.is_syn() && !syn.is_ack());
        let mut conn = Connection::new(cfg, iss, now);
        conn.state = State::SynRcvd;
        conn.irs = syn.seq;
        conn.rcv_nxt = syn.seq + 1;
        conn.negotiate(syn);
        conn.init_congestion();
        conn
    }

    pub fn snd_una(&self) -> SeqNumber {
        self.snd_una
    }

    pub fn snd_nxt(&self) -> SeqNumber {
        self.snd_nxt
    }

    pub fn rcv_nxt(&self) -> SeqNumber {
        self.rcv_nxt
    }

    pub fn cwnd(&self) -> usize {
        self.cc_vars.cwnd
    }

    pub fn ssthresh(&self) -> usize {
        self.cc_vars.ssthresh
    }

    pub fn in_recovery(&self) -> bool {
        self.fast_recovery || self.rto_recovery
    }

    pub fn scoreboard(&self) -> &Scoreboard {
        &self.sb
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    /// The pacing rate in bytes per second, from the controller or the
    /// `cwnd / srtt` default.
    pub fn pacing_rate(&self) -> Option<u64> {
        let srtt = self.rtt.srtt()?;
        self.cc
            .pacing_rate(&self.cc_vars, srtt)
            .or_else(|| {
                let micros = srtt.total_micros().max(1);
                Some(self.cc_vars.cwnd as u64 * 1_000_000 / micros)
            })
    }

    /// Bytes outstanding in the network (RFC 6675 pipe).
    pub fn flight_size(&self) -> usize {
        let outstanding = self.snd_nxt - self.snd_una;
        let accounted = self.sb.sacked_bytes + self.sb.lost_bytes;
        let rxt = self.snd_rxt_bytes - self.rxt_delivered.min(self.snd_rxt_bytes);
        debug_assert!(
            accounted <= outstanding,
            "scoreboard accounts for more than is outstanding"
        );
        outstanding.saturating_sub(accounted) + rxt
    }

    fn negotiate(&mut self, seg: &Segment) {
        if let Some(mss) = seg.mss {
            self.snd_mss = self.cfg.mss.min(mss as usize);
        }
        self.snd_wscale = seg.window_scale.unwrap_or(0);
        self.sack_permitted = seg.sack_permitted;
        self.timestamps = seg.timestamp.is_some();
        if let Some(ts) = seg.timestamp {
            self.ts_recent = ts.tsval;
        }
    }

    fn init_congestion(&mut self) {
        let input = self.cc_input(0, 0);
        self.cc.init(&mut self.cc_vars, &input);
        if self.cfg.initial_cwnd_multiplier > 0 {
            self.cc_vars.cwnd =
                congestion::initial_cwnd(self.snd_mss, self.cfg.initial_cwnd_multiplier);
        }
    }

    fn cc_input(&self, bytes_acked: usize, flight_size: usize) -> CcInput {
        CcInput {
            bytes_acked,
            flight_size,
            snd_mss: self.snd_mss,
            sack_permitted: self.sack_permitted,
            tx_buffer_size: self.cfg.tx_buffer_size,
        }
    }

    fn seg_wnd(&self, seg: &Segment) -> usize {
        // The shift never applies to SYN segments.
        if seg.is_syn() {
            seg.window as usize
        } else {
            (seg.window as usize) << self.snd_wscale
        }
    }

    // === Segment emission =================================================

    fn tsopt(&self, now: Instant) -> Option<TimestampRepr> {
        self.timestamps.then(|| TimestampRepr {
            tsval: now.total_millis() as u32,
            tsecr: self.ts_recent,
        })
    }

    fn emit(&mut self, cx: &mut Context<'_>, segment: Segment, is_retransmit: bool) {
        self.stats.segs_out += 1;
        self.stats.bytes_out += segment.payload_len as u64;
        cx.tx.push(SegmentRequest {
            connection: cx.handle,
            segment,
            is_retransmit,
        });
    }

    fn send_syn(&mut self, cx: &mut Context<'_>) {
        let segment = Segment {
            seq: self.iss,
            ack: SeqNumber::default(),
            flags: SegFlags::SYN,
            window: self.rcv_wnd.min(u16::MAX as usize) as u16,
            payload_len: 0,
            mss: Some(self.cfg.mss as u16),
            window_scale: Some(0),
            sack_permitted: true,
            sack_blocks: Default::default(),
            timestamp: self.tsopt(cx.now),
        };
        self.snd_nxt = self.iss + 1;
        self.emit(cx, segment, false);
    }

    fn send_syn_ack(&mut self, cx: &mut Context<'_>) {
        let segment = Segment {
            seq: self.iss,
            ack: self.rcv_nxt,
            flags: SegFlags::SYN | SegFlags::ACK,
            window: self.rcv_wnd.min(u16::MAX as usize) as u16,
            payload_len: 0,
            mss: Some(self.cfg.mss as u16),
            window_scale: Some(0),
            sack_permitted: self.sack_permitted,
            sack_blocks: Default::default(),
            timestamp: self.tsopt(cx.now),
        };
        self.snd_nxt = self.iss + 1;
        self.emit(cx, segment, false);
    }

    fn send_ack(&mut self, cx: &mut Context<'_>) {
        let segment = Segment {
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
            flags: SegFlags::ACK,
            window: self.rcv_wnd.min(u16::MAX as usize) as u16,
            timestamp: self.tsopt(cx.now),
            ..Segment::default()
        };
        self.ack_pending = false;
        self.timers.reset(cx.wheel, TimerKind::DelAck);
        self.emit(cx, segment, false);
    }

    fn send_rst(&mut self, cx: &mut Context<'_>, seg: &Segment) {
        // RFC 793: RST carries the offending segment's ack, or acks its
        // sequence when it had none.
        let segment = if seg.is_ack() {
            Segment {
                seq: seg.ack,
                flags: SegFlags::RST,
                ..Segment::default()
            }
        } else {
            Segment {
                seq: SeqNumber::default(),
                ack: seg.seq_end(),
                flags: SegFlags::RST | SegFlags::ACK,
                ..Segment::default()
            }
        };
        self.emit(cx, segment, false);
    }

    fn send_fin(&mut self, cx: &mut Context<'_>) {
        let segment = Segment {
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
            flags: SegFlags::FIN | SegFlags::ACK,
            window: self.rcv_wnd.min(u16::MAX as usize) as u16,
            timestamp: self.tsopt(cx.now),
            ..Segment::default()
        };
        self.snd_nxt += 1;
        self.fin_sent = true;
        self.ack_pending = false;
        self.emit(cx, segment, false);
        self.retransmit_timer_update(cx, true);
    }

    fn send_data_segment(&mut self, cx: &mut Context<'_>, seq: SeqNumber, len: usize) {
        let segment = Segment {
            seq,
            ack: self.rcv_nxt,
            flags: SegFlags::ACK,
            window: self.rcv_wnd.min(u16::MAX as usize) as u16,
            payload_len: len,
            timestamp: self.tsopt(cx.now),
            ..Segment::default()
        };
        self.ack_pending = false;
        self.emit(cx, segment, false);
    }

    /// Send as much new data as the windows allow.
    pub fn send_data(&mut self, cx: &mut Context<'_>, session: &mut dyn Session) {
        if !matches!(
            self.state,
            State::Established | State::CloseWait | State::SynRcvd
        ) {
            return;
        }
        let flight = self.flight_size();
        let avail = session.tx_bytes_available();
        let mut space = self
            .cc_vars
            .cwnd
            .min(self.snd_wnd)
            .saturating_sub(flight)
            .min(avail);
        if space == 0 {
            if avail > 0 && self.snd_wnd == 0 && !self.timers.is_active(TimerKind::Persist) {
                self.persist_boff = 0;
                self.timers
                    .set(cx.wheel, cx.handle.index(), TimerKind::Persist, self.rtt.rto());
            }
            return;
        }
        if flight == 0 {
            self.cc.event(&mut self.cc_vars, CcEvent::StartTx);
        }
        self.check_app_limited(avail, flight);
        while space > 0 {
            let len = space.min(self.snd_mss);
            let seq = self.snd_nxt;
            self.send_data_segment(cx, seq, len);
            self.bt.track_tx(
                seq,
                len,
                cx.now,
                self.delivered,
                self.delivered_time,
                self.app_limited.is_some(),
            );
            if self.rtt_ts.is_none() {
                self.rtt_ts = Some((seq, cx.now));
            }
            self.snd_nxt += len;
            space -= len;
        }
        self.retransmit_timer_update(cx, true);
    }

    /// Mark the delivery point as application limited when the sender ran
    /// out of data rather than window.
    fn check_app_limited(&mut self, avail: usize, flight: usize) {
        if avail + flight < self.cc_vars.cwnd.min(self.snd_wnd) {
            self.app_limited = Some((self.delivered + flight).max(1));
        }
    }

    /// Arm or disarm RETRANSMIT according to what is outstanding.
    fn retransmit_timer_update(&mut self, cx: &mut Context<'_>, outstanding: bool) {
        if !outstanding && self.snd_una == self.snd_nxt {
            self.timers.reset(cx.wheel, TimerKind::Retransmit);
            return;
        }
        self.timers
            .update(cx.wheel, cx.handle.index(), TimerKind::Retransmit, self.rto_backed_off());
    }

    fn rto_backed_off(&self) -> Duration {
        let shift = self.rto_boff.min(RTO_BOFF_MAX);
        (self.rtt.rto() * (1u32 << shift)).min(RTO_MAX)
    }

    // === Inbound dispatch =================================================

    /// Process one decoded inbound segment.
    pub fn handle_segment(
        &mut self,
        cx: &mut Context<'_>,
        session: &mut dyn Session,
        table: &DispatchTable,
        seg: &Segment,
    ) {
        self.stats.segs_in += 1;
        self.stats.bytes_in += seg.payload_len as u64;
        self.rcv_wnd = session.rx_space();
        let entry = table.lookup(self.state, seg.flags);
        net_trace!(
            "{}: {} seq {} ack {} len {} -> {:?}",
            self.state,
            seg.flags,
            seg.seq,
            seg.ack,
            seg.payload_len,
            entry.dispatch
        );
        match entry.dispatch {
            Dispatch::Drop => {
                if entry.drop_kind != DropKind::None {
                    self.stats.protocol_errors += 1;
                }
            }
            Dispatch::Reset => {
                if seg.is_rst() {
                    self.process_rst(cx, session, seg);
                } else {
                    self.stats.protocol_errors += 1;
                    self.send_rst(cx, seg);
                }
            }
            Dispatch::SynSent => self.process_syn_sent(cx, session, seg),
            Dispatch::Established => self.process_established(cx, session, seg),
            Dispatch::RcvProcess => self.process_rcv_process(cx, session, seg),
        }
    }

    /// Inbound RST: fatal, immediate, full teardown.
    fn process_rst(&mut self, cx: &mut Context<'_>, session: &mut dyn Session, seg: &Segment) {
        // Only an in-window RST is honored (RFC 5961 spirit).
        if seg.seq != self.rcv_nxt && !self.seq_in_rcv_wnd(seg.seq) {
            self.soft_errors.above_data_wnd += 1;
            return;
        }
        net_debug!("{}: reset by peer", self.state);
        self.teardown(cx);
        session.aborted(ConnectionError::Reset);
    }

    fn seq_in_rcv_wnd(&self, seq: SeqNumber) -> bool {
        seq >= self.rcv_nxt && seq < self.rcv_nxt + self.rcv_wnd.max(1)
    }

    fn process_syn_sent(&mut self, cx: &mut Context<'_>, session: &mut dyn Session, seg: &Segment) {
        let ack_acceptable =
            seg.is_ack() && seg.ack > self.iss && seg.ack <= self.snd_nxt;

        if seg.is_rst() {
            // A RST is only meaningful if it acks our SYN.
            if ack_acceptable {
                self.teardown(cx);
                session.aborted(ConnectionError::Refused);
            }
            return;
        }
        if seg.is_ack() && !ack_acceptable {
            self.soft_errors.above_ack_wnd += 1;
            self.send_rst(cx, seg);
            return;
        }
        if !seg.is_syn() {
            return;
        }

        self.irs = seg.seq;
        self.rcv_nxt = seg.seq + 1;
        self.negotiate(seg);

        if ack_acceptable {
            // SYN-ACK completes the handshake.
            self.snd_una = seg.ack;
            self.snd_wnd = self.seg_wnd(seg);
            self.snd_wl1 = seg.seq;
            self.snd_wl2 = seg.ack;
            self.init_congestion();
            self.timers.reset(cx.wheel, TimerKind::RetransmitSyn);
            self.rto_boff = 0;
            self.state = State::Established;
            net_debug!("{}: established (active)", self.state);
            self.send_ack(cx);
            self.send_data(cx, session);
        } else {
            // Simultaneous open.
            self.init_congestion();
            self.timers.reset(cx.wheel, TimerKind::RetransmitSyn);
            self.state = State::SynRcvd;
            self.snd_nxt = self.iss;
            self.send_syn_ack(cx);
        }
    }

    /// Segment acceptance per RFC 793: some part of the segment must fall
    /// inside the receive window.
    fn check_segment(&mut self, cx: &mut Context<'_>, seg: &Segment) -> bool {
        let seg_end = seg.seq_end();
        if seg_end < self.rcv_nxt {
            // Entirely old; answer so the peer resynchronizes.
            self.soft_errors.below_data_wnd += 1;
            self.send_ack(cx);
            return false;
        }
        if seg.seq >= self.rcv_nxt + self.rcv_wnd.max(1) {
            self.soft_errors.above_data_wnd += 1;
            self.send_ack(cx);
            return false;
        }
        if let Some(ts) = seg.timestamp {
            if seg.seq <= self.rcv_nxt {
                self.ts_recent = ts.tsval;
            }
        }
        true
    }

    fn process_established(
        &mut self,
        cx: &mut Context<'_>,
        session: &mut dyn Session,
        seg: &Segment,
    ) {
        if seg.is_syn() {
            // In-window SYN after establishment: challenge ACK.
            self.stats.protocol_errors += 1;
            self.send_ack(cx);
            return;
        }
        if !self.check_segment(cx, seg) {
            return;
        }
        if !self.process_ack(cx, session, seg) {
            return;
        }
        self.process_data(cx, seg);
        if seg.is_fin() && self.state == State::Established && seg.seq_end() == self.rcv_nxt {
            // FIN consumed in order: half close, exactly once.
            self.state = State::CloseWait;
            net_debug!("{}: peer closed", self.state);
            session.remote_closed();
            self.send_ack(cx);
        }
        self.send_data(cx, session);
    }

    /// Consume in-order payload; out-of-order data is the embedder's
    /// reassembly problem, we only ack what we have.
    fn process_data(&mut self, cx: &mut Context<'_>, seg: &Segment) {
        if seg.payload_len == 0 && !seg.is_fin() {
            return;
        }
        if seg.seq > self.rcv_nxt {
            // A gap: duplicate ack so the peer's recovery sees it.
            self.send_ack(cx);
            return;
        }
        let dup = self.rcv_nxt - seg.seq;
        let fresh = seg.payload_len.saturating_sub(dup);
        if fresh > 0 {
            self.rcv_nxt += fresh;
            if seg.is_fin() {
                self.fin_to_rcv_nxt(seg);
                self.send_ack(cx);
            } else {
                self.delayed_ack(cx);
            }
        } else if seg.is_fin() {
            self.fin_to_rcv_nxt(seg);
        } else {
            // Pure duplicate payload.
            self.send_ack(cx);
        }
    }

    fn fin_to_rcv_nxt(&mut self, seg: &Segment) {
        if seg.seq_end() == self.rcv_nxt + 1 {
            self.rcv_nxt += 1;
        }
    }

    fn delayed_ack(&mut self, cx: &mut Context<'_>) {
        if self.ack_pending {
            // Second segment since the last ack: ack immediately.
            self.send_ack(cx);
            return;
        }
        self.ack_pending = true;
        if !self.timers.is_active(TimerKind::DelAck) {
            self.timers
                .set(cx.wheel, cx.handle.index(), TimerKind::DelAck, self.cfg.delack_time);
        }
    }

    fn is_dupack(&self, seg: &Segment) -> bool {
        seg.ack == self.snd_una
            && self.snd_nxt > self.snd_una
            && seg.payload_len == 0
            && !seg.is_fin()
            && self.seg_wnd(seg) == self.snd_wnd
    }

    /// Acknowledgment processing. Returns false when the segment must be
    /// dropped.
    fn process_ack(&mut self, cx: &mut Context<'_>, session: &mut dyn Session, seg: &Segment) -> bool {
        if seg.ack > self.snd_nxt {
            // Acks data never sent.
            self.soft_errors.above_ack_wnd += 1;
            self.send_ack(cx);
            return false;
        }
        if seg.ack < self.snd_una {
            // Old ack; window updates are still taken from it.
            self.soft_errors.below_ack_wnd += 1;
            return true;
        }

        if self.is_dupack(seg) {
            self.handle_dupack(cx, session, seg);
            return true;
        }

        self.update_snd_wnd(cx, seg);

        let bytes_acked = seg.ack - self.snd_una;
        let had_rxt = self.in_recovery();
        if self.sack_permitted && (!seg.sack_blocks.is_empty() || bytes_acked > 0) {
            if self
                .sb
                .update(
                    seg.ack,
                    self.snd_una,
                    self.snd_nxt,
                    &seg.sack_blocks,
                    self.snd_mss,
                    had_rxt,
                )
                .is_err()
            {
                // Out of holes: collapse and resynchronize from the ack.
                self.sb.clear_reneging(seg.ack.max(self.snd_una), self.snd_nxt);
            }
            self.rxt_delivered = (self.rxt_delivered + self.sb.rxt_sacked).min(self.snd_rxt_bytes);
        }

        if bytes_acked == 0 {
            // Not a duplicate (window update or sack-only ack).
            if self.sb.last_sacked_bytes > 0 && self.in_recovery() {
                self.retransmit(cx, session);
            }
            return true;
        }

        // Our FIN occupies sequence space but is not data.
        let fin_acked = self.fin_sent && seg.ack == self.snd_nxt;
        let data_acked = bytes_acked - usize::from(fin_acked);

        self.snd_una = seg.ack;
        self.dupacks = 0;
        self.rto_boff = 0;
        if self.sb.is_reneging {
            self.sb.clear_reneging(self.snd_una, self.snd_nxt);
        }

        self.update_rtt(cx, seg);
        self.account_delivery(cx, session, seg, data_acked);
        session.data_delivered(data_acked);

        if self.snd_una == self.snd_nxt {
            self.timers.reset(cx.wheel, TimerKind::Retransmit);
        } else {
            self.retransmit_timer_update(cx, true);
        }
        true
    }

    fn update_snd_wnd(&mut self, cx: &mut Context<'_>, seg: &Segment) {
        let wnd = self.seg_wnd(seg);
        if seg.seq > self.snd_wl1 || (seg.seq == self.snd_wl1 && seg.ack >= self.snd_wl2) {
            self.snd_wnd = wnd;
            self.snd_wl1 = seg.seq;
            self.snd_wl2 = seg.ack;
            if wnd > 0 {
                self.persist_boff = 0;
                self.timers.reset(cx.wheel, TimerKind::Persist);
            }
        }
    }

    fn handle_dupack(&mut self, cx: &mut Context<'_>, session: &mut dyn Session, seg: &Segment) {
        self.dupacks += 1;
        self.stats.dupacks_in += 1;

        if self.sack_permitted && !seg.sack_blocks.is_empty() {
            let had_rxt = self.in_recovery();
            if self
                .sb
                .update(
                    seg.ack,
                    self.snd_una,
                    self.snd_nxt,
                    &seg.sack_blocks,
                    self.snd_mss,
                    had_rxt,
                )
                .is_err()
            {
                self.sb.clear_reneging(self.snd_una, self.snd_nxt);
            }
            self.rxt_delivered = (self.rxt_delivered + self.sb.rxt_sacked).min(self.snd_rxt_bytes);
        }

        if !self.in_recovery() {
            let enough_dupacks = self.dupacks >= DUPACK_THRESHOLD as u32;
            let enough_sacked = self.sb.lost_bytes > 0
                || self.sb.sacked_bytes > (DUPACK_THRESHOLD - 1) * self.snd_mss;
            if enough_dupacks || enough_sacked {
                self.enter_fast_recovery(cx, session);
            } else {
                // Limited transmit: sacked bytes shrink the flight, so new
                // data may fit under the unchanged window (RFC 3042).
                self.send_data(cx, session);
            }
            return;
        }

        let flight = self.flight_size();
        let input = self.cc_input(0, flight);
        self.cc
            .rcv_cong_ack(&mut self.cc_vars, &input, CongAck::DupAck, None);
        if self.sack_permitted {
            self.retransmit(cx, session);
        } else {
            // The inflated window lets the next segment out (RFC 5681).
            self.send_data(cx, session);
        }
    }

    fn enter_fast_recovery(&mut self, cx: &mut Context<'_>, session: &mut dyn Session) {
        net_debug!("{}: fast recovery, cwnd {}", self.state, self.cc_vars.cwnd);
        self.cc_vars.prev_cwnd = self.cc_vars.cwnd;
        self.cc_vars.prev_ssthresh = self.cc_vars.ssthresh;
        let flight = self.flight_size();
        let input = self.cc_input(0, flight);
        self.cc.congestion(&mut self.cc_vars, &input);
        self.fast_recovery = true;
        self.snd_congestion = self.snd_nxt;
        self.snd_rxt_ts = cx.now.total_millis() as u32;
        self.snd_rxt_bytes = 0;
        self.rxt_delivered = 0;

        if self.sack_permitted {
            self.sb.init_rxt(self.snd_una, self.snd_nxt);
            self.retransmit(cx, session);
        } else {
            // Classic fast retransmit plus RFC 5681 window inflation.
            self.cc_vars.cwnd += DUPACK_THRESHOLD * self.snd_mss;
            let len = self.snd_mss.min(self.snd_nxt - self.snd_una);
            let start = self.snd_una;
            self.emit_rxt(cx, start, len, true);
        }
    }

    /// SACK-driven retransmissions (RFC 6675 NextSeg loop).
    fn retransmit(&mut self, cx: &mut Context<'_>, session: &mut dyn Session) {
        if !self.sack_permitted {
            return;
        }
        let mut cur = None;
        for _ in 0..RXT_MAX_BURST {
            if self.flight_size() + self.snd_mss > self.cc_vars.cwnd {
                break;
            }
            let have_unsent = session.tx_bytes_available() > 0;
            let next = self.sb.next_rxt_hole(cur, have_unsent);
            let Some(handle) = next.hole else {
                if next.can_rescue && self.sb.rescue_rxt < self.snd_una {
                    // One rescue probe per round, carrying the highest
                    // un-sacked bytes below the recovery point so a tail
                    // loss still elicits sack feedback.
                    let len = self.snd_mss.min(self.snd_congestion - self.snd_una);
                    if len > 0 {
                        let start = self.snd_congestion - len;
                        self.emit_rxt(cx, start, len, false);
                        self.sb.rescue_rxt = self.snd_congestion;
                    }
                }
                break;
            };
            let (end, was_lost) = {
                let hole = self.sb.hole(handle).expect("candidate hole is live");
                (hole.end, hole.is_lost)
            };
            let start = self.sb.high_rxt;
            if start >= end {
                cur = self.sb.next_hole(handle);
                continue;
            }
            let len = self.snd_mss.min(end - start);
            self.emit_rxt(cx, start, len, was_lost);
            self.sb.high_rxt = start + len;
            cur = Some(handle);
        }
        self.retransmit_timer_update(cx, true);
    }

    fn emit_rxt(&mut self, cx: &mut Context<'_>, start: SeqNumber, len: usize, was_lost: bool) {
        debug_assert!(len > 0);
        let segment = Segment {
            seq: start,
            ack: self.rcv_nxt,
            flags: SegFlags::ACK,
            window: self.rcv_wnd.min(u16::MAX as usize) as u16,
            payload_len: len,
            timestamp: self.tsopt(cx.now),
            ..Segment::default()
        };
        self.emit(cx, segment, true);
        self.bt
            .track_rxt(start, start + len, cx.now, self.delivered, self.delivered_time, was_lost);
        self.snd_rxt_bytes += len;
        self.stats.rxt_segs += 1;
        self.stats.rxt_bytes += len as u64;
        // Karn: a retransmitted range must not be RTT-timed.
        if let Some((seq, _)) = self.rtt_ts {
            if seq >= start && seq < start + len {
                self.rtt_ts = None;
            }
        }
    }

    fn update_rtt(&mut self, cx: &mut Context<'_>, seg: &Segment) {
        if let Some((seq, sent_at)) = self.rtt_ts {
            if seg.ack > seq {
                self.rtt.sample(cx.now - sent_at);
                self.rtt_ts = None;
                return;
            }
        }
        // Fall back to the timestamp echo when available.
        if let Some(ts) = seg.timestamp {
            if ts.tsecr != 0 {
                let now_ms = cx.now.total_millis() as u32;
                let echo = now_ms.wrapping_sub(ts.tsecr);
                if (echo as i32) >= 0 {
                    self.rtt.sample(Duration::from_millis(echo as u64));
                }
            }
        }
    }

    fn account_delivery(
        &mut self,
        cx: &mut Context<'_>,
        session: &mut dyn Session,
        seg: &Segment,
        bytes_acked: usize,
    ) {
        let newly_delivered =
            bytes_acked + self.sb.last_sacked_bytes - self.sb.last_bytes_delivered;
        self.delivered += newly_delivered;
        self.delivered_time = cx.now;
        if let Some(mark) = self.app_limited {
            if self.delivered > mark {
                self.app_limited = None;
            }
        }
        let rs = self.bt.sample_delivery_rate(
            self.snd_una,
            &seg.sack_blocks,
            cx.now,
            self.delivered,
            newly_delivered,
            self.sb.last_lost_bytes,
        );

        if self.in_recovery() {
            self.recovery_ack(cx, session, seg, bytes_acked, rs.as_ref());
        } else {
            let flight = self.flight_size();
            let input = self.cc_input(bytes_acked, flight);
            self.cc.rcv_ack(&mut self.cc_vars, &input, rs.as_ref());
        }
    }

    fn recovery_ack(
        &mut self,
        cx: &mut Context<'_>,
        session: &mut dyn Session,
        seg: &Segment,
        bytes_acked: usize,
        rs: Option<&RateSample>,
    ) {
        if self.spurious_retransmit(seg) {
            net_debug!("{}: spurious retransmit, undoing", self.state);
            let flight = self.flight_size();
            let input = self.cc_input(0, flight);
            self.cc.undo_recovery(&mut self.cc_vars, &input);
            self.recovery_done(cx);
            return;
        }
        if self.snd_una >= self.snd_congestion {
            // The recovery point is acknowledged.
            let flight = self.flight_size();
            let input = self.cc_input(0, flight);
            self.cc.recovered(&mut self.cc_vars, &input);
            self.recovery_done(cx);
            net_debug!("{}: recovered, cwnd {}", self.state, self.cc_vars.cwnd);
            return;
        }
        let flight = self.flight_size();
        let input = self.cc_input(bytes_acked, flight);
        self.cc
            .rcv_cong_ack(&mut self.cc_vars, &input, CongAck::PartialAck, rs);
        if self.sack_permitted {
            self.retransmit(cx, session);
        } else {
            // RFC 6582: a partial ack means the next segment was lost
            // too; retransmit the first unacknowledged segment.
            let len = self.snd_mss.min(self.snd_nxt - self.snd_una);
            if len > 0 {
                let start = self.snd_una;
                self.emit_rxt(cx, start, len, true);
            }
        }
    }

    /// An echo older than the first retransmission of the episode proves
    /// the original arrived (Eifel, RFC 3522 spirit).
    fn spurious_retransmit(&self, seg: &Segment) -> bool {
        if self.snd_rxt_bytes == 0 {
            return false;
        }
        match seg.timestamp {
            Some(ts) if ts.tsecr != 0 => {
                (self.snd_rxt_ts.wrapping_sub(ts.tsecr) as i32) > 0
            }
            _ => false,
        }
    }

    fn recovery_done(&mut self, cx: &mut Context<'_>) {
        let _ = cx;
        self.fast_recovery = false;
        self.rto_recovery = false;
        self.dupacks = 0;
        self.snd_rxt_bytes = 0;
        self.rxt_delivered = 0;
        self.sb.clear();
    }

    /// Handshake completion and the half-close states.
    fn process_rcv_process(
        &mut self,
        cx: &mut Context<'_>,
        session: &mut dyn Session,
        seg: &Segment,
    ) {
        if seg.is_rst() {
            match self.state {
                State::SynRcvd => {
                    self.teardown(cx);
                    session.aborted(ConnectionError::Refused);
                }
                _ => self.process_rst(cx, session, seg),
            }
            return;
        }
        if seg.is_syn() {
            // Retransmitted SYN or in-window SYN after sync: challenge.
            if self.state == State::SynRcvd && seg.seq + 1 == self.rcv_nxt {
                self.snd_nxt = self.iss;
                self.send_syn_ack(cx);
            } else {
                self.stats.protocol_errors += 1;
                self.send_ack(cx);
            }
            return;
        }
        if !self.check_segment(cx, seg) {
            return;
        }

        if self.state == State::SynRcvd {
            if !(seg.is_ack() && seg.ack > self.iss && seg.ack <= self.snd_nxt) {
                self.stats.protocol_errors += 1;
                self.send_rst(cx, seg);
                return;
            }
            self.snd_una = seg.ack;
            self.snd_wnd = self.seg_wnd(seg);
            self.snd_wl1 = seg.seq;
            self.snd_wl2 = seg.ack;
            self.timers.reset(cx.wheel, TimerKind::Retransmit);
            self.rto_boff = 0;
            self.state = State::Established;
            net_debug!("{}: established (passive)", self.state);
        }

        if !self.process_ack(cx, session, seg) {
            return;
        }
        self.process_data(cx, seg);

        let fin_here = seg.is_fin() && seg.seq_end() == self.rcv_nxt;
        let our_fin_acked = self.fin_sent && self.snd_una == self.snd_nxt;

        match self.state {
            State::Established => {
                if fin_here {
                    self.state = State::CloseWait;
                    session.remote_closed();
                    self.send_ack(cx);
                }
                self.send_data(cx, session);
            }
            State::CloseWait => {
                self.send_data(cx, session);
            }
            State::FinWait1 => match (fin_here, our_fin_acked) {
                (true, true) => {
                    session.remote_closed();
                    self.send_ack(cx);
                    self.enter_time_wait(cx);
                }
                (true, false) => {
                    session.remote_closed();
                    self.send_ack(cx);
                    self.state = State::Closing;
                }
                (false, true) => self.state = State::FinWait2,
                (false, false) => {}
            },
            State::FinWait2 => {
                if fin_here {
                    session.remote_closed();
                    self.send_ack(cx);
                    self.enter_time_wait(cx);
                }
            }
            State::Closing => {
                if our_fin_acked {
                    self.enter_time_wait(cx);
                }
            }
            State::LastAck => {
                if our_fin_acked {
                    self.teardown(cx);
                    session.closed();
                }
            }
            State::TimeWait => {
                if fin_here {
                    // Peer retransmitted its FIN; re-ack and hold.
                    self.send_ack(cx);
                    self.timers.update(
                        cx.wheel,
                        cx.handle.index(),
                        TimerKind::WaitClose,
                        self.cfg.timewait_time,
                    );
                }
            }
            _ => {}
        }
    }

    fn enter_time_wait(&mut self, cx: &mut Context<'_>) {
        self.state = State::TimeWait;
        self.timers.reset(cx.wheel, TimerKind::Retransmit);
        self.timers.reset(cx.wheel, TimerKind::Persist);
        self.timers.reset(cx.wheel, TimerKind::DelAck);
        self.timers.update(
            cx.wheel,
            cx.handle.index(),
            TimerKind::WaitClose,
            self.cfg.timewait_time,
        );
    }

    // === Application-driven transitions ==================================

    /// Application close: half-close branches per RFC 793.
    pub fn close(&mut self, cx: &mut Context<'_>, session: &mut dyn Session) {
        match self.state {
            State::SynSent => {
                self.teardown(cx);
                session.closed();
            }
            State::SynRcvd | State::Established => {
                self.send_fin(cx);
                self.state = State::FinWait1;
                self.timers.update(
                    cx.wheel,
                    cx.handle.index(),
                    TimerKind::WaitClose,
                    self.cfg.finwait_time,
                );
            }
            State::CloseWait => {
                self.send_fin(cx);
                self.state = State::LastAck;
                self.timers.update(
                    cx.wheel,
                    cx.handle.index(),
                    TimerKind::WaitClose,
                    self.cfg.finwait_time,
                );
            }
            _ => {}
        }
    }

    /// Release every resource; the record is ready to return to its pool.
    pub fn teardown(&mut self, cx: &mut Context<'_>) {
        self.timers.reset_all(cx.wheel);
        self.sb.init();
        self.bt.flush_samples();
        self.fast_recovery = false;
        self.rto_recovery = false;
        self.state = State::Closed;
        debug_assert!(!self.timers.any_active());
        debug_assert_eq!(self.sb.hole_count(), 0);
        debug_assert_eq!(self.bt.sample_count(), 0);
    }

    // === Timer expiry =====================================================

    /// Clear the slot of a fired timer before its handler runs, so the
    /// handler can rearm.
    pub fn timer_expired(&mut self, kind: TimerKind) {
        self.timers.expired(kind);
    }

    /// Route a fired timer to its handler. The worker has already cleared
    /// the slot.
    pub fn on_timer(&mut self, cx: &mut Context<'_>, session: &mut dyn Session, kind: TimerKind) {
        match kind {
            TimerKind::Retransmit => self.on_retransmit_timeout(cx, session),
            TimerKind::DelAck => self.on_delack_timeout(cx),
            TimerKind::Persist => self.on_persist_timeout(cx, session),
            TimerKind::WaitClose => self.on_waitclose_timeout(cx, session),
            TimerKind::RetransmitSyn => self.on_syn_timeout(cx, session),
        }
    }

    fn on_retransmit_timeout(&mut self, cx: &mut Context<'_>, session: &mut dyn Session) {
        if self.snd_una == self.snd_nxt {
            return;
        }
        self.rto_boff += 1;
        if self.rto_boff > RTO_BOFF_MAX {
            net_debug!("{}: retransmit backoff exhausted", self.state);
            self.teardown(cx);
            session.aborted(ConnectionError::Timeout);
            return;
        }
        if self.rto_boff == 1 {
            // First timeout of the episode: congestion response and a
            // fresh retransmission round.
            self.cc_vars.prev_cwnd = self.cc_vars.cwnd;
            self.cc_vars.prev_ssthresh = self.cc_vars.ssthresh;
            let flight = self.flight_size();
            let input = self.cc_input(0, flight);
            self.cc.loss(&mut self.cc_vars, &input);
            self.rto_recovery = true;
            self.fast_recovery = false;
            self.snd_congestion = self.snd_nxt;
            self.snd_rxt_ts = cx.now.total_millis() as u32;
            self.snd_rxt_bytes = 0;
            self.rxt_delivered = 0;
            self.sb.clear();
            if self.sack_permitted {
                self.sb.init_rxt(self.snd_una, self.snd_nxt);
            }
            // Stale in-flight timing is useless after an RTO.
            self.bt.flush_samples();
        }
        let len = self.snd_mss.min(self.snd_nxt - self.snd_una);
        let start = self.snd_una;
        self.emit_rxt(cx, start, len, true);
        if self.sack_permitted {
            self.sb.high_rxt = start + len;
        }
        self.timers.set(
            cx.wheel,
            cx.handle.index(),
            TimerKind::Retransmit,
            self.rto_backed_off(),
        );
    }

    fn on_delack_timeout(&mut self, cx: &mut Context<'_>) {
        if self.ack_pending {
            self.send_ack(cx);
        }
    }

    fn on_persist_timeout(&mut self, cx: &mut Context<'_>, session: &mut dyn Session) {
        if self.snd_wnd > 0 || self.state == State::Closed {
            return;
        }
        if session.tx_bytes_available() > 0 {
            // Window probe: one byte past the window edge.
            let seq = self.snd_nxt;
            self.send_data_segment(cx, seq, 1);
            self.stats.rxt_segs += 1;
        } else {
            self.send_ack(cx);
        }
        self.persist_boff = (self.persist_boff + 1).min(RTO_BOFF_MAX);
        let interval = (self.rtt.rto() * (1u32 << self.persist_boff)).min(RTO_MAX);
        self.timers
            .set(cx.wheel, cx.handle.index(), TimerKind::Persist, interval);
    }

    fn on_waitclose_timeout(&mut self, cx: &mut Context<'_>, session: &mut dyn Session) {
        match self.state {
            State::TimeWait => {
                self.teardown(cx);
                session.closed();
            }
            State::FinWait1 | State::FinWait2 | State::Closing | State::LastAck => {
                // The peer never finished its side; give up.
                net_debug!("{}: close guard expired", self.state);
                self.teardown(cx);
                session.closed();
            }
            _ => {}
        }
    }

    fn on_syn_timeout(&mut self, cx: &mut Context<'_>, session: &mut dyn Session) {
        if self.state != State::SynSent {
            return;
        }
        self.rto_boff += 1;
        if self.rto_boff > self.cfg.syn_retries {
            net_debug!("{}: handshake timed out", self.state);
            self.teardown(cx);
            session.aborted(ConnectionError::Timeout);
            return;
        }
        self.send_syn(cx);
        self.stats.rxt_segs += 1;
        // The interval doubles once the grace retries are spent.
        let shift = self.rto_boff.saturating_sub(RTO_SYN_RETRIES).min(RTO_BOFF_MAX);
        let interval = (RTO_INIT * (1u32 << shift)).min(RTO_MAX);
        self.timers
            .set(cx.wheel, cx.handle.index(), TimerKind::RetransmitSyn, interval);
    }

    /// Arm the initial SYN retransmission timer; worker calls this right
    /// after pool insertion, when the slot index is known.
    pub fn arm_syn_timer(&mut self, cx: &mut Context<'_>) {
        self.timers
            .set(cx.wheel, cx.handle.index(), TimerKind::RetransmitSyn, RTO_INIT);
    }

    /// Emit the initial SYN (active open).
    pub fn connect(&mut self, cx: &mut Context<'_>) {
        debug_assert_eq!(self.state, State::SynSent);
        self.send_syn(cx);
        self.arm_syn_timer(cx);
    }

    /// Emit the SYN-ACK (passive open).
    pub fn accept_reply(&mut self, cx: &mut Context<'_>) {
        debug_assert_eq!(self.state, State::SynRcvd);
        self.send_syn_ack(cx);
        self.timers.set(
            cx.wheel,
            cx.handle.index(),
            TimerKind::Retransmit,
            RTO_INIT,
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::Pool;
    use crate::timer::TimerWheel;
    use crate::wire::SackBlock;

    struct MockSession {
        tx_available: usize,
        rx_space: usize,
        delivered: usize,
        remote_closes: usize,
        closes: usize,
        abort: Option<ConnectionError>,
    }

    impl MockSession {
        fn new() -> MockSession {
            MockSession {
                tx_available: 0,
                rx_space: 64 << 10,
                delivered: 0,
                remote_closes: 0,
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
            self.rx_space
        }

        fn data_delivered(&mut self, count: usize) {
            self.delivered += count;
        }

        fn remote_closed(&mut self) {
            self.remote_closes += 1;
        }

        fn closed(&mut self) {
            self.closes += 1;
        }

        fn aborted(&mut self, error: ConnectionError) {
            self.abort = Some(error);
        }
    }

    struct Harness {
        wheel: TimerWheel,
        tx: Vec<SegmentRequest>,
        table: DispatchTable,
        handle: crate::storage::Handle,
        now: Instant,
    }

    impl Harness {
        fn new() -> Harness {
            let mut pool: Pool<()> = Pool::new(4);
            let handle = pool.alloc(()).unwrap();
            Harness {
                wheel: TimerWheel::new(64),
                tx: Vec::new(),
                table: DispatchTable::new(),
                handle,
                now: Instant::from_millis(1_000),
            }
        }

        fn cx(&mut self) -> Context<'_> {
            Context {
                now: self.now,
                handle: self.handle,
                wheel: &mut self.wheel,
                tx: &mut self.tx,
            }
        }

        fn deliver(&mut self, conn: &mut Connection, session: &mut MockSession, seg: &Segment) {
            let mut cx = Context {
                now: self.now,
                handle: self.handle,
                wheel: &mut self.wheel,
                tx: &mut self.tx,
            };
            conn.handle_segment(&mut cx, session, &self.table, seg);
        }
    }

    fn seq(n: u32) -> SeqNumber {
        SeqNumber(n as i32)
    }

    fn syn_ack(seq_: u32, ack: u32) -> Segment {
        Segment {
            seq: seq(seq_),
            ack: seq(ack),
            flags: SegFlags::SYN | SegFlags::ACK,
            window: 65_000,
            mss: Some(1460),
            sack_permitted: true,
            ..Segment::default()
        }
    }

    fn ack(seq_: u32, ack_: u32, window: u16) -> Segment {
        Segment {
            seq: seq(seq_),
            ack: seq(ack_),
            flags: SegFlags::ACK,
            window,
            ..Segment::default()
        }
    }

    /// Active-open connection brought to ESTABLISHED, iss = 100, irs = 900.
    fn established(h: &mut Harness, session: &mut MockSession) -> Connection {
        let mut conn = Connection::new_active(Config::default(), seq(100), h.now);
        conn.connect(&mut h.cx());
        h.tx.clear();
        h.deliver(&mut conn, session, &syn_ack(900, 101));
        assert_eq!(conn.state, State::Established);
        h.tx.clear();
        conn
    }

    /// Same, but the peer did not offer SACK.
    fn established_nonsack(h: &mut Harness, session: &mut MockSession) -> Connection {
        let mut conn = Connection::new_active(Config::default(), seq(100), h.now);
        conn.connect(&mut h.cx());
        h.tx.clear();
        let mut sa = syn_ack(900, 101);
        sa.sack_permitted = false;
        h.deliver(&mut conn, session, &sa);
        assert_eq!(conn.state, State::Established);
        assert!(!conn.sack_permitted);
        h.tx.clear();
        conn
    }

    #[test]
    fn test_active_open_handshake() {
        let mut h = Harness::new();
        let mut session = MockSession::new();
        let mut conn = Connection::new_active(Config::default(), seq(100), h.now);
        conn.connect(&mut h.cx());
        assert_eq!(h.tx.len(), 1);
        assert!(h.tx[0].segment.flags.contains(SegFlags::SYN));
        assert!(conn.timers().is_active(TimerKind::RetransmitSyn));

        h.deliver(&mut conn, &mut session, &syn_ack(900, 101));
        assert_eq!(conn.state, State::Established);
        assert_eq!(conn.rcv_nxt(), seq(901));
        assert_eq!(conn.snd_una(), seq(101));
        assert!(!conn.timers().is_active(TimerKind::RetransmitSyn));
        // The handshake completion acked the SYN-ACK.
        let last = h.tx.last().unwrap();
        assert!(last.segment.flags.contains(SegFlags::ACK));
        assert_eq!(last.segment.ack, seq(901));
    }

    #[test]
    fn test_passive_open_handshake() {
        let mut h = Harness::new();
        let mut session = MockSession::new();
        let syn = Segment {
            seq: seq(500),
            flags: SegFlags::SYN,
            window: 30_000,
            mss: Some(1200),
            sack_permitted: true,
            ..Segment::default()
        };
        let mut conn = Connection::new_passive(Config::default(), seq(100), &syn, h.now);
        conn.accept_reply(&mut h.cx());
        assert_eq!(conn.state, State::SynRcvd);
        assert_eq!(conn.snd_mss, 1200);
        assert!(h.tx[0].segment.flags.contains(SegFlags::SYN | SegFlags::ACK));

        h.deliver(&mut conn, &mut session, &ack(501, 101, 30_000));
        assert_eq!(conn.state, State::Established);
    }

    #[test]
    fn test_fin_transitions_to_close_wait_exactly_once() {
        let mut h = Harness::new();
        let mut session = MockSession::new();
        let mut conn = established(&mut h, &mut session);

        let fin = Segment {
            seq: seq(901),
            ack: seq(101),
            flags: SegFlags::FIN | SegFlags::ACK,
            window: 65_000,
            ..Segment::default()
        };
        h.deliver(&mut conn, &mut session, &fin);
        assert_eq!(conn.state, State::CloseWait);
        assert_eq!(conn.rcv_nxt(), seq(902));
        assert_eq!(session.remote_closes, 1);

        // The retransmitted FIN changes nothing.
        h.deliver(&mut conn, &mut session, &fin);
        assert_eq!(conn.state, State::CloseWait);
        assert_eq!(conn.rcv_nxt(), seq(902));
        assert_eq!(session.remote_closes, 1);
    }

    #[test]
    fn test_unmapped_flags_count_protocol_error() {
        let mut h = Harness::new();
        let mut session = MockSession::new();
        let mut conn = established(&mut h, &mut session);
        let state = conn.state;

        // A bare FIN without ACK is undefined after establishment.
        let seg = Segment {
            seq: seq(901),
            flags: SegFlags::FIN,
            ..Segment::default()
        };
        h.deliver(&mut conn, &mut session, &seg);
        assert_eq!(conn.state, state);
        assert_eq!(conn.stats.protocol_errors, 1);
        assert!(h.tx.is_empty());
    }

    #[test]
    fn test_rst_triggers_full_teardown() {
        let mut h = Harness::new();
        let mut session = MockSession::new();
        let mut conn = established(&mut h, &mut session);

        // Put resources in play first.
        session.tx_available = 5000;
        conn.send_data(&mut h.cx(), &mut session);
        assert!(conn.bt.sample_count() > 0);
        assert!(conn.timers().any_active());

        let rst = Segment {
            seq: seq(901),
            flags: SegFlags::RST,
            ..Segment::default()
        };
        h.deliver(&mut conn, &mut session, &rst);
        assert_eq!(conn.state, State::Closed);
        assert_eq!(session.abort, Some(ConnectionError::Reset));
        assert!(!conn.timers().any_active());
        assert_eq!(conn.scoreboard().hole_count(), 0);
        assert_eq!(conn.bt.sample_count(), 0);
        assert_eq!(h.wheel.active(), 0);
    }

    #[test]
    fn test_out_of_window_rst_ignored() {
        let mut h = Harness::new();
        let mut session = MockSession::new();
        let mut conn = established(&mut h, &mut session);
        let rst = Segment {
            seq: seq(500_000),
            flags: SegFlags::RST,
            ..Segment::default()
        };
        h.deliver(&mut conn, &mut session, &rst);
        assert_eq!(conn.state, State::Established);
        assert!(session.abort.is_none());
    }

    #[test]
    fn test_syn_retry_exhaustion_reports_timeout() {
        let mut h = Harness::new();
        let mut session = MockSession::new();
        let cfg = Config {
            syn_retries: 2,
            ..Config::default()
        };
        let mut conn = Connection::new_active(cfg, seq(100), h.now);
        conn.connect(&mut h.cx());

        for _ in 0..2 {
            conn.timers.expired(TimerKind::RetransmitSyn);
            conn.on_timer(&mut h.cx(), &mut session, TimerKind::RetransmitSyn);
            assert_eq!(conn.state, State::SynSent);
        }
        conn.timers.expired(TimerKind::RetransmitSyn);
        conn.on_timer(&mut h.cx(), &mut session, TimerKind::RetransmitSyn);
        assert_eq!(conn.state, State::Closed);
        assert_eq!(session.abort, Some(ConnectionError::Timeout));
        assert!(!conn.timers().any_active());
    }

    #[test]
    fn test_send_data_respects_windows_and_tracks() {
        let mut h = Harness::new();
        let mut session = MockSession::new();
        let mut conn = established(&mut h, &mut session);

        session.tx_available = 100_000;
        conn.send_data(&mut h.cx(), &mut session);
        let sent: usize = h.tx.iter().map(|r| r.segment.payload_len).sum();
        assert_eq!(sent, conn.cwnd().min(65_000));
        assert_eq!(conn.snd_nxt() - conn.snd_una(), sent);
        assert!(conn.timers().is_active(TimerKind::Retransmit));
        assert!(conn.bt.sample_count() > 0);
        // Every segment respects the MSS.
        assert!(h.tx.iter().all(|r| r.segment.payload_len <= 1460));
    }

    #[test]
    fn test_cumulative_ack_advances_and_delivers() {
        let mut h = Harness::new();
        let mut session = MockSession::new();
        let mut conn = established(&mut h, &mut session);

        session.tx_available = 5000;
        conn.send_data(&mut h.cx(), &mut session);
        session.tx_available = 0;
        h.tx.clear();
        let snd_nxt = conn.snd_nxt();

        h.now += Duration::from_millis(30);
        h.deliver(&mut conn, &mut session, &ack(901, 101 + 2920, 65_000));
        assert_eq!(conn.snd_una(), seq(101 + 2920));
        assert_eq!(session.delivered, 2920);
        assert!(conn.rtt.srtt().is_some());
        assert_eq!(conn.snd_nxt(), snd_nxt);
    }

    #[test]
    fn test_three_dupacks_enter_fast_recovery() {
        let mut h = Harness::new();
        let mut session = MockSession::new();
        let mut conn = established(&mut h, &mut session);

        session.tx_available = 20_000;
        conn.send_data(&mut h.cx(), &mut session);
        session.tx_available = 0;
        h.tx.clear();
        let cwnd_before = conn.cwnd();

        for _ in 0..2 {
            h.deliver(&mut conn, &mut session, &ack(901, 101, 65_000));
            assert!(!conn.in_recovery());
        }
        h.deliver(&mut conn, &mut session, &ack(901, 101, 65_000));
        assert!(conn.in_recovery());
        assert!(conn.cwnd() <= cwnd_before);
        assert_eq!(conn.stats.dupacks_in, 3);
        // The first retransmission went out.
        assert!(h.tx.iter().any(|r| r.is_retransmit));
        assert!(conn.scoreboard().hole_count() > 0);
    }

    #[test]
    fn test_sacked_dupacks_drive_sack_retransmit() {
        let mut h = Harness::new();
        let mut session = MockSession::new();
        let mut conn = established(&mut h, &mut session);

        session.tx_available = 20_000;
        conn.send_data(&mut h.cx(), &mut session);
        session.tx_available = 0;
        h.tx.clear();

        // One block sacking everything above the first segment marks the
        // head lost immediately.
        let una = 101u32;
        let mut seg = ack(901, una, 65_000);
        seg.sack_blocks
            .push(SackBlock::new(seq(una + 1460), seq(una + 4380)))
            .unwrap();
        h.deliver(&mut conn, &mut session, &seg);
        assert!(conn.in_recovery());
        let rxt: Vec<_> = h.tx.iter().filter(|r| r.is_retransmit).collect();
        assert!(!rxt.is_empty());
        assert_eq!(rxt[0].segment.seq, seq(una));
    }

    #[test]
    fn test_recovery_completes_at_recovery_point() {
        let mut h = Harness::new();
        let mut session = MockSession::new();
        let mut conn = established(&mut h, &mut session);

        session.tx_available = 20_000;
        conn.send_data(&mut h.cx(), &mut session);
        session.tx_available = 0;
        let snd_nxt = conn.snd_nxt();
        for _ in 0..3 {
            h.deliver(&mut conn, &mut session, &ack(901, 101, 65_000));
        }
        assert!(conn.in_recovery());
        let ssthresh = conn.ssthresh();

        // Partial ack stays in recovery.
        h.deliver(&mut conn, &mut session, &ack(901, 101 + 1460, 65_000));
        assert!(conn.in_recovery());

        // Ack of the recovery point completes it.
        h.deliver(
            &mut conn,
            &mut session,
            &ack(901, (snd_nxt - seq(0)) as u32, 65_000),
        );
        assert!(!conn.in_recovery());
        assert_eq!(conn.cwnd(), ssthresh);
        assert_eq!(conn.scoreboard().hole_count(), 0);
    }

    #[test]
    fn test_rescue_probe_carries_window_tail() {
        let mut h = Harness::new();
        let mut session = MockSession::new();
        let mut conn = established(&mut h, &mut session);

        session.tx_available = 20_000;
        conn.send_data(&mut h.cx(), &mut session);
        session.tx_available = 0;
        h.tx.clear();

        // Pure duplicate acks carry no sack blocks; the only candidate is
        // the rescue probe, which must cover the bytes just below the
        // recovery point rather than re-sending the head.
        for _ in 0..3 {
            h.deliver(&mut conn, &mut session, &ack(901, 101, 65_000));
        }
        assert!(conn.in_recovery());
        let rxt: Vec<_> = h.tx.iter().filter(|r| r.is_retransmit).collect();
        assert_eq!(rxt.len(), 1);
        assert_eq!(rxt[0].segment.seq, seq(101 + 4380 - 1460));
        assert_eq!(rxt[0].segment.payload_len, 1460);
        // The probe moves rescue_rxt, never high_rxt.
        assert_eq!(conn.scoreboard().high_rxt, seq(101));
        assert_eq!(conn.scoreboard().rescue_rxt, seq(101 + 4380));
    }

    #[test]
    fn test_nonsack_partial_ack_retransmits_head() {
        let mut h = Harness::new();
        let mut session = MockSession::new();
        let mut conn = established_nonsack(&mut h, &mut session);

        session.tx_available = 20_000;
        conn.send_data(&mut h.cx(), &mut session);
        session.tx_available = 0;
        h.tx.clear();

        for _ in 0..3 {
            h.deliver(&mut conn, &mut session, &ack(901, 101, 65_000));
        }
        assert!(conn.in_recovery());
        assert_eq!(h.tx.iter().filter(|r| r.is_retransmit).count(), 1);
        h.tx.clear();

        // A partial ack means the next segment was lost too; it must go
        // out immediately, not wait for the retransmission timer.
        h.deliver(&mut conn, &mut session, &ack(901, 101 + 1460, 65_000));
        assert!(conn.in_recovery());
        let rxt: Vec<_> = h.tx.iter().filter(|r| r.is_retransmit).collect();
        assert_eq!(rxt.len(), 1);
        assert_eq!(rxt[0].segment.seq, seq(101 + 1460));
        assert_eq!(rxt[0].segment.payload_len, 1460);

        // Ack of the recovery point completes recovery as usual.
        h.deliver(&mut conn, &mut session, &ack(901, 101 + 4380, 65_000));
        assert!(!conn.in_recovery());
        assert_eq!(conn.cwnd(), conn.ssthresh());
    }

    #[test]
    fn test_nonsack_dupack_inflation_sends_new_data() {
        let mut h = Harness::new();
        let mut session = MockSession::new();
        let mut conn = established_nonsack(&mut h, &mut session);

        session.tx_available = 20_000;
        conn.send_data(&mut h.cx(), &mut session);
        session.tx_available = 0;
        for _ in 0..3 {
            h.deliver(&mut conn, &mut session, &ack(901, 101, 65_000));
        }
        assert!(conn.in_recovery());
        h.tx.clear();

        // A further dupack inflates the window by one MSS, which lets new
        // segments out even though nothing was acknowledged.
        session.tx_available = 1460;
        h.deliver(&mut conn, &mut session, &ack(901, 101, 65_000));
        assert!(!h.tx.is_empty());
        assert!(h.tx.iter().all(|r| !r.is_retransmit));
        assert_eq!(h.tx[0].segment.seq, seq(101 + 4380));
        assert_eq!(h.tx[0].segment.payload_len, 1460);
    }

    #[test]
    fn test_spurious_retransmit_undoes_recovery() {
        let mut h = Harness::new();
        let mut session = MockSession::new();
        let mut conn = established(&mut h, &mut session);

        session.tx_available = 20_000;
        conn.send_data(&mut h.cx(), &mut session);
        session.tx_available = 0;
        let cwnd_before = conn.cwnd();
        let ssthresh_before = conn.ssthresh();
        for _ in 0..3 {
            h.deliver(&mut conn, &mut session, &ack(901, 101, 65_000));
        }
        assert!(conn.in_recovery());
        assert!(conn.cwnd() < cwnd_before);

        // The echo predates the first retransmission of the episode, so
        // the originals arrived and the congestion signal was false.
        let mut seg = ack(901, 101 + 1460, 65_000);
        seg.timestamp = Some(TimestampRepr {
            tsval: 2_000,
            tsecr: 500,
        });
        h.deliver(&mut conn, &mut session, &seg);
        assert!(!conn.in_recovery());
        assert_eq!(conn.cwnd(), cwnd_before);
        assert_eq!(conn.ssthresh(), ssthresh_before);
        assert_eq!(conn.scoreboard().hole_count(), 0);
    }

    #[test]
    fn test_retransmit_timeout_backoff_and_abort() {
        let mut h = Harness::new();
        let mut session = MockSession::new();
        let mut conn = established(&mut h, &mut session);

        session.tx_available = 5000;
        conn.send_data(&mut h.cx(), &mut session);
        session.tx_available = 0;
        h.tx.clear();

        conn.timers.expired(TimerKind::Retransmit);
        conn.on_timer(&mut h.cx(), &mut session, TimerKind::Retransmit);
        assert!(conn.rto_recovery);
        assert_eq!(h.tx.iter().filter(|r| r.is_retransmit).count(), 1);
        assert_eq!(h.tx[0].segment.seq, seq(101));
        // The whole window is one lost hole again.
        assert_eq!(conn.scoreboard().hole_count(), 1);

        for _ in 0..RTO_BOFF_MAX {
            conn.timers.expired(TimerKind::Retransmit);
            conn.on_timer(&mut h.cx(), &mut session, TimerKind::Retransmit);
        }
        assert_eq!(conn.state, State::Closed);
        assert_eq!(session.abort, Some(ConnectionError::Timeout));
    }

    #[test]
    fn test_zero_window_arms_persist() {
        let mut h = Harness::new();
        let mut session = MockSession::new();
        let mut conn = established(&mut h, &mut session);

        // Peer closes the window.
        h.deliver(&mut conn, &mut session, &ack(901, 101, 0));
        session.tx_available = 1000;
        conn.send_data(&mut h.cx(), &mut session);
        assert!(conn.timers().is_active(TimerKind::Persist));
        h.tx.clear();

        // Probe goes out on expiry.
        conn.timers.expired(TimerKind::Persist);
        conn.on_timer(&mut h.cx(), &mut session, TimerKind::Persist);
        assert_eq!(h.tx.len(), 1);
        assert_eq!(h.tx[0].segment.payload_len, 1);
        assert!(conn.timers().is_active(TimerKind::Persist));

        // Window opens: persist is disarmed by the next ack.
        h.deliver(&mut conn, &mut session, &ack(901, 101, 30_000));
        assert!(!conn.timers().is_active(TimerKind::Persist));
    }

    #[test]
    fn test_active_close_to_time_wait() {
        let mut h = Harness::new();
        let mut session = MockSession::new();
        let mut conn = established(&mut h, &mut session);

        conn.close(&mut h.cx(), &mut session);
        assert_eq!(conn.state, State::FinWait1);
        assert!(h.tx[0].segment.flags.contains(SegFlags::FIN));
        h.tx.clear();

        // Peer acks our FIN, then sends its own.
        h.deliver(&mut conn, &mut session, &ack(901, 102, 65_000));
        assert_eq!(conn.state, State::FinWait2);
        let fin = Segment {
            seq: seq(901),
            ack: seq(102),
            flags: SegFlags::FIN | SegFlags::ACK,
            window: 65_000,
            ..Segment::default()
        };
        h.deliver(&mut conn, &mut session, &fin);
        assert_eq!(conn.state, State::TimeWait);
        assert!(conn.timers().is_active(TimerKind::WaitClose));

        conn.timers.expired(TimerKind::WaitClose);
        conn.on_timer(&mut h.cx(), &mut session, TimerKind::WaitClose);
        assert_eq!(conn.state, State::Closed);
        assert_eq!(session.closes, 1);
    }

    #[test]
    fn test_passive_close_last_ack() {
        let mut h = Harness::new();
        let mut session = MockSession::new();
        let mut conn = established(&mut h, &mut session);

        let fin = Segment {
            seq: seq(901),
            ack: seq(101),
            flags: SegFlags::FIN | SegFlags::ACK,
            window: 65_000,
            ..Segment::default()
        };
        h.deliver(&mut conn, &mut session, &fin);
        assert_eq!(conn.state, State::CloseWait);

        conn.close(&mut h.cx(), &mut session);
        assert_eq!(conn.state, State::LastAck);

        h.deliver(&mut conn, &mut session, &ack(902, 102, 65_000));
        assert_eq!(conn.state, State::Closed);
        assert_eq!(session.closes, 1);
    }

    #[test]
    fn test_delayed_ack_coalesces() {
        let mut h = Harness::new();
        let mut session = MockSession::new();
        let mut conn = established(&mut h, &mut session);

        let mut data = ack(901, 101, 65_000);
        data.payload_len = 1000;
        h.deliver(&mut conn, &mut session, &data);
        // First in-order segment: ack is delayed.
        assert!(h.tx.is_empty());
        assert!(conn.timers().is_active(TimerKind::DelAck));

        // Second segment forces the ack out.
        let mut data2 = ack(1901, 101, 65_000);
        data2.payload_len = 1000;
        h.deliver(&mut conn, &mut session, &data2);
        assert_eq!(h.tx.len(), 1);
        assert_eq!(h.tx[0].segment.ack, seq(2901));
        assert!(!conn.timers().is_active(TimerKind::DelAck));
    }

    #[test]
    fn test_old_segment_counts_soft_error() {
        let mut h = Harness::new();
        let mut session = MockSession::new();
        let mut conn = established(&mut h, &mut session);

        let mut old = ack(1, 101, 65_000);
        old.payload_len = 100;
        h.deliver(&mut conn, &mut session, &old);
        assert_eq!(conn.soft_errors.below_data_wnd, 1);
        assert_eq!(conn.state, State::Established);
        // A resynchronizing ack was produced.
        assert_eq!(h.tx.len(), 1);
    }

    #[test]
    fn test_ack_above_snd_nxt_dropped() {
        let mut h = Harness::new();
        let mut session = MockSession::new();
        let mut conn = established(&mut h, &mut session);

        h.deliver(&mut conn, &mut session, &ack(901, 50_000, 65_000));
        assert_eq!(conn.soft_errors.above_ack_wnd, 1);
        assert_eq!(conn.snd_una(), seq(101));
    }
}
