//! Delay-based congestion control and retransmission timing.
//!
//! The window grows or shrinks from one-way delay measurements: each
//! inbound packet's timestamp yields a delay sample, the minimum over a
//! rolling window is the baseline, and the current excess over that
//! baseline steers `max_window`. Loss only enters the picture through the
//! RTO, which collapses the window to a single packet.

use crate::protocol::MTU;
use crate::time::wrapping_elapsed;
use std::time::Duration;

/// Window growth budget per round trip, in packets.
pub const MAX_CWND_INCREASE_PACKETS_PER_RTT: u32 = 8;

/// Lower bound for the retransmission timeout.
pub const MIN_RTO_MICROS: u64 = 500_000;

/// Baseline delay expires after this long without a new minimum.
pub const BASE_DELAY_WINDOW_MICROS: u32 = 120_000_000;

/// Window before any delay feedback arrives.
pub const INITIAL_MAX_WINDOW: u32 = 3 * MTU as u32;

/// Consecutive unanswered timeouts before the connection is torn down.
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 5;

/// Minimum observed one-way delay and when it was recorded.
#[derive(Debug, Clone, Copy)]
struct BaseDelay {
    delay: u32,
    recorded_at: u32,
}

/// Per-connection congestion state: smoothed RTT, RTO, and the
/// delay-driven send window.
#[derive(Debug)]
pub struct CongestionController {
    /// Smoothed round-trip time, microseconds. Zero until the first sample.
    rtt: u64,
    /// Mean deviation of the RTT, microseconds.
    rtt_var: u64,
    /// Current retransmission timeout, microseconds.
    rto: u64,
    /// Rolling-minimum one-way delay.
    base_delay: Option<BaseDelay>,
    /// Most recent delay above the baseline, microseconds.
    our_delay: u32,
    /// Allowed in-flight bytes.
    max_window: u32,
    /// Consecutive RTO firings without an intervening ACK.
    timeouts: u32,
}

impl Default for CongestionController {
    fn default() -> Self {
        Self::new()
    }
}

impl CongestionController {
    pub fn new() -> Self {
        Self {
            rtt: 0,
            rtt_var: 0,
            rto: MIN_RTO_MICROS,
            base_delay: None,
            our_delay: 0,
            max_window: INITIAL_MAX_WINDOW,
            timeouts: 0,
        }
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        Duration::from_micros(self.rto)
    }

    /// Allowed in-flight bytes.
    pub fn max_window(&self) -> u32 {
        self.max_window
    }

    /// Consecutive unanswered timeouts so far.
    pub fn consecutive_timeouts(&self) -> u32 {
        self.timeouts
    }

    /// True when one more full packet fits into the window.
    pub fn window_allows(&self, cur_window: u32) -> bool {
        cur_window + MTU as u32 <= self.max_window
    }

    /// Feeds one round-trip measurement (microseconds) into the smoothed
    /// estimators and refreshes the RTO.
    pub fn on_rtt_sample(&mut self, packet_rtt: u64) {
        if self.rtt == 0 {
            self.rtt = packet_rtt;
            self.rtt_var = packet_rtt / 2;
        } else {
            let delta = self.rtt as i64 - packet_rtt as i64;
            let var = self.rtt_var as i64 + (delta.abs() - self.rtt_var as i64) / 4;
            self.rtt_var = var.max(0) as u64;
            let rtt = self.rtt as i64 + (packet_rtt as i64 - self.rtt as i64) / 8;
            self.rtt = rtt.max(0) as u64;
        }
        self.rto = (self.rtt + 4 * self.rtt_var).max(MIN_RTO_MICROS);
        self.timeouts = 0;
    }

    /// Feeds the one-way delay carried by an inbound packet's timestamp
    /// and rescales the window.
    ///
    /// `cur_window` is the sender's current in-flight byte count.
    pub fn on_delay_sample(&mut self, remote_timestamp: u32, now: u32, cur_window: u32) {
        let delay = wrapping_elapsed(now, remote_timestamp);

        let refresh = match self.base_delay {
            None => true,
            Some(base) => {
                delay < base.delay
                    || wrapping_elapsed(now, base.recorded_at) > BASE_DELAY_WINDOW_MICROS
            }
        };
        if refresh {
            self.base_delay = Some(BaseDelay { delay, recorded_at: now });
        }
        let base = self.base_delay.expect("baseline was just refreshed");
        self.our_delay = delay.wrapping_sub(base.delay);

        if base.delay == 0 {
            // No usable scale until the baseline is nonzero.
            return;
        }

        let off_target = base.delay as f64 - self.our_delay as f64;
        let delay_factor = off_target / base.delay as f64;
        let window_factor = cur_window as f64 / self.max_window.max(1) as f64;
        let scaled_gain = MAX_CWND_INCREASE_PACKETS_PER_RTT as f64
            * delay_factor
            * window_factor
            * MTU as f64;

        self.max_window = (self.max_window as f64 + scaled_gain).max(0.0) as u32;
    }

    /// Timeout response: collapse the window to one packet and double the
    /// RTO.
    pub fn throttle(&mut self) {
        self.max_window = MTU as u32;
        self.rto = self.rto.saturating_mul(2);
        self.timeouts += 1;
    }

    #[cfg(test)]
    pub(crate) fn set_max_window(&mut self, window: u32) {
        self.max_window = window;
    }
}
