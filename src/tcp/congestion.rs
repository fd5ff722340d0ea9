/*! Congestion control.

Controllers are notified of acknowledgment, loss and recovery events and
in response adjust the window variables in [`CongestionVars`]. The
connection itself decides *when* recovery starts and ends; controllers
only decide window sizes.

Algorithm state lives by value inside [`AnyController`], so a connection
carries its controller with no allocation or indirection.
*/

use crate::time::Duration;

use super::tracker::RateSample;

pub mod newreno;

pub use self::newreno::NewReno;

/// Window variables owned by the connection, adjusted by the controller.
#[derive(Debug, Clone, Copy, Default)]
pub struct CongestionVars {
    /// Congestion window, in bytes.
    pub cwnd: usize,
    /// Slow start threshold, in bytes.
    pub ssthresh: usize,
    /// Fractional-MSS credit accumulated in congestion avoidance.
    pub cwnd_acc: usize,
    /// Window saved at recovery entry, for undo.
    pub prev_cwnd: usize,
    pub prev_ssthresh: usize,
}

impl CongestionVars {
    pub fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }
}

/// Read-only acknowledgment context handed to controller hooks.
#[derive(Debug, Clone, Copy)]
pub struct CcInput {
    /// Bytes the cumulative ACK newly acknowledged.
    pub bytes_acked: usize,
    /// Bytes outstanding in the network.
    pub flight_size: usize,
    pub snd_mss: usize,
    /// The peer negotiated SACK.
    pub sack_permitted: bool,
    /// Hard cap for the window; growing past the send buffer is pointless.
    pub tx_buffer_size: usize,
}

/// Acknowledgments received while the connection suspects congestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongAck {
    DupAck,
    /// Advances `snd_una` without leaving recovery (RFC 6582).
    PartialAck,
}

/// Out-of-band notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcEvent {
    /// Transmission (re)started after an idle period.
    StartTx,
}

pub trait Controller {
    /// Connection establishment; seed the window variables.
    fn init(&mut self, vars: &mut CongestionVars, input: &CcInput);

    /// In-order acknowledgment outside recovery.
    fn rcv_ack(&mut self, vars: &mut CongestionVars, input: &CcInput, rs: Option<&RateSample>);

    /// Acknowledgment during recovery.
    fn rcv_cong_ack(
        &mut self,
        vars: &mut CongestionVars,
        input: &CcInput,
        ack: CongAck,
        rs: Option<&RateSample>,
    );

    /// Fast-recovery entry (third duplicate acknowledgment).
    fn congestion(&mut self, vars: &mut CongestionVars, input: &CcInput);

    /// Retransmission timeout.
    fn loss(&mut self, vars: &mut CongestionVars, input: &CcInput);

    /// Recovery completed; `snd_una` reached the recovery point.
    fn recovered(&mut self, vars: &mut CongestionVars, input: &CcInput);

    /// The congestion signal proved spurious; restore the saved window.
    fn undo_recovery(&mut self, vars: &mut CongestionVars, _input: &CcInput) {
        vars.cwnd = vars.prev_cwnd;
        vars.ssthresh = vars.prev_ssthresh;
    }

    fn event(&mut self, _vars: &mut CongestionVars, _event: CcEvent) {}

    /// Bytes per second the connection should pace at, if the algorithm
    /// has an opinion. `None` falls back to `cwnd / srtt`.
    fn pacing_rate(&self, _vars: &CongestionVars, _srtt: Duration) -> Option<u64> {
        None
    }
}

/// Initial congestion window per RFC 5681, or `multiplier * mss` when the
/// configuration pins it.
pub fn initial_cwnd(snd_mss: usize, multiplier: usize) -> usize {
    if multiplier > 0 {
        return multiplier * snd_mss;
    }
    if snd_mss > 2190 {
        2 * snd_mss
    } else if snd_mss > 1095 {
        3 * snd_mss
    } else {
        4 * snd_mss
    }
}

/// Grow the window by one MSS per `thresh` bytes acknowledged, carrying
/// the remainder across acknowledgments.
pub fn cwnd_accumulate(vars: &mut CongestionVars, input: &CcInput, thresh: usize, bytes: usize) {
    vars.cwnd_acc += bytes;
    if vars.cwnd_acc >= thresh {
        let inc = vars.cwnd_acc / thresh;
        vars.cwnd_acc -= inc * thresh;
        vars.cwnd += inc * input.snd_mss;
        vars.cwnd = vars.cwnd.min(input.tx_buffer_size);
    }
}

/// A congestion controller of any supported algorithm.
#[derive(Debug, Clone)]
pub enum AnyController {
    NewReno(NewReno),
}

impl AnyController {
    /// Look an algorithm up by its configuration name.
    pub fn from_name(name: &str) -> Option<AnyController> {
        match name {
            "newreno" => Some(AnyController::NewReno(NewReno::new())),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AnyController::NewReno(_) => "newreno",
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Controller {
        match self {
            AnyController::NewReno(cc) => cc,
        }
    }

    fn inner(&self) -> &dyn Controller {
        match self {
            AnyController::NewReno(cc) => cc,
        }
    }
}

impl Controller for AnyController {
    fn init(&mut self, vars: &mut CongestionVars, input: &CcInput) {
        self.inner_mut().init(vars, input)
    }

    fn rcv_ack(&mut self, vars: &mut CongestionVars, input: &CcInput, rs: Option<&RateSample>) {
        self.inner_mut().rcv_ack(vars, input, rs)
    }

    fn rcv_cong_ack(
        &mut self,
        vars: &mut CongestionVars,
        input: &CcInput,
        ack: CongAck,
        rs: Option<&RateSample>,
    ) {
        self.inner_mut().rcv_cong_ack(vars, input, ack, rs)
    }

    fn congestion(&mut self, vars: &mut CongestionVars, input: &CcInput) {
        self.inner_mut().congestion(vars, input)
    }

    fn loss(&mut self, vars: &mut CongestionVars, input: &CcInput) {
        self.inner_mut().loss(vars, input)
    }

    fn recovered(&mut self, vars: &mut CongestionVars, input: &CcInput) {
        self.inner_mut().recovered(vars, input)
    }

    fn undo_recovery(&mut self, vars: &mut CongestionVars, input: &CcInput) {
        self.inner_mut().undo_recovery(vars, input)
    }

    fn event(&mut self, vars: &mut CongestionVars, event: CcEvent) {
        self.inner_mut().event(vars, event)
    }

    fn pacing_rate(&self, vars: &CongestionVars, srtt: Duration) -> Option<u64> {
        self.inner().pacing_rate(vars, srtt)
    }
}
