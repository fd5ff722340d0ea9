//! NewReno congestion control (RFC 5681, RFC 6582).

use super::{cwnd_accumulate, initial_cwnd, CcInput, CongAck, CongestionVars, Controller};
use crate::tcp::tracker::RateSample;

#[derive(Debug, Clone, Default)]
pub struct NewReno {}

impl NewReno {
    pub fn new() -> NewReno {
        NewReno {}
    }
}

impl Controller for NewReno {
    fn init(&mut self, vars: &mut CongestionVars, input: &CcInput) {
        vars.cwnd = initial_cwnd(input.snd_mss, 0);
        vars.ssthresh = input.tx_buffer_size;
        vars.cwnd_acc = 0;
    }

    fn rcv_ack(&mut self, vars: &mut CongestionVars, input: &CcInput, _rs: Option<&RateSample>) {
        if vars.in_slow_start() {
            // Grow by everything newly acknowledged. The classic
            // one-MSS-per-ACK variant undercounts badly with stretch ACKs
            // from offload and ACK coalescing (RFC 5681 appropriate byte
            // counting, uncapped).
            vars.cwnd += input.bytes_acked;
            vars.cwnd = vars.cwnd.min(input.tx_buffer_size);
        } else {
            let thresh = vars.cwnd;
            cwnd_accumulate(vars, input, thresh, input.bytes_acked);
        }
    }

    fn rcv_cong_ack(
        &mut self,
        vars: &mut CongestionVars,
        input: &CcInput,
        ack: CongAck,
        _rs: Option<&RateSample>,
    ) {
        match ack {
            CongAck::DupAck => {
                // With SACK the scoreboard already accounts for segments
                // that left the network; without it, inflate (RFC 5681).
                if !input.sack_permitted {
                    vars.cwnd += input.snd_mss;
                }
            }
            CongAck::PartialAck => {
                // RFC 6582 sec. 3.2: deflate by the newly acknowledged
                // bytes; if at least one MSS was acknowledged, add one
                // MSS back for the segment that left the network.
                if !input.sack_permitted {
                    let deflate = if input.bytes_acked >= input.snd_mss {
                        input.bytes_acked - input.snd_mss
                    } else {
                        input.bytes_acked
                    };
                    vars.cwnd = vars.cwnd.saturating_sub(deflate).max(input.snd_mss);
                }
            }
        }
    }

    fn congestion(&mut self, vars: &mut CongestionVars, input: &CcInput) {
        vars.ssthresh = (input.flight_size / 2).max(2 * input.snd_mss);
        vars.cwnd = vars.ssthresh;
    }

    fn loss(&mut self, vars: &mut CongestionVars, input: &CcInput) {
        vars.ssthresh = (input.flight_size / 2).max(2 * input.snd_mss);
        // Room for what is still in flight plus the retransmission about
        // to go out.
        vars.cwnd = input.flight_size + input.snd_mss;
        vars.cwnd_acc = 0;
    }

    fn recovered(&mut self, vars: &mut CongestionVars, _input: &CcInput) {
        vars.cwnd = vars.ssthresh;
        vars.cwnd_acc = 0;
    }
}
