//! Retransmission-timeout policy.
//!
//! Reliable delivery requires that unacknowledged packets are re-sent if no
//! ACK arrives within a bounded time.  [`RtoPolicy`] decides how long that
//! is:
//! - **Fixed**: a configured interval, never changed.  This is the default
//!   and matches a game loop's need for predictable resend pacing.
//! - **Adaptive**: a variant of Jacobson's algorithm (RFC 6298):
//!   `RTO = SRTT + 4 × RTTVAR`, clamped to `[min_rto, max_rto]`.
//!
//! Samples must only come from packets that were never retransmitted
//! (Karn's rule); the sender enforces that before calling
//! [`RtoPolicy::record_sample`].

use std::time::Duration;

/// Retransmission-timeout state for one sender.
#[derive(Debug, Clone)]
pub struct RtoPolicy {
    /// RTO before any sample is available, and the floor for adaptive mode.
    pub min_rto: Duration,
    /// Upper bound after back-off or a slow sample.
    pub max_rto: Duration,
    adaptive: bool,
    current: Duration,
    /// Smoothed RTT estimate (SRTT).
    srtt: Option<Duration>,
    /// RTT variance estimate (RTTVAR).
    rttvar: Option<Duration>,
}

impl RtoPolicy {
    /// A constant RTO.
    pub fn fixed(rto: Duration) -> Self {
        Self {
            min_rto: rto,
            max_rto: rto,
            adaptive: false,
            current: rto,
            srtt: None,
            rttvar: None,
        }
    }

    /// An RFC 6298 estimator starting at `initial` and never dropping below it.
    pub fn adaptive(initial: Duration, max_rto: Duration) -> Self {
        Self {
            min_rto: initial,
            max_rto: max_rto.max(initial),
            adaptive: true,
            current: initial,
            srtt: None,
            rttvar: None,
        }
    }

    /// The timeout to apply right now.
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn is_adaptive(&self) -> bool {
        self.adaptive
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Record a new RTT sample and update SRTT / RTTVAR / RTO (RFC 6298 §2).
    ///
    /// On the first sample:  SRTT = R,  RTTVAR = R/2.
    /// Subsequent samples:   RTTVAR = 3/4·RTTVAR + 1/4·|SRTT − R|
    ///                       SRTT   = 7/8·SRTT   + 1/8·R
    ///
    /// No-op for a fixed policy.
    pub fn record_sample(&mut self, sample: Duration) {
        if !self.adaptive {
            return;
        }
        match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => {
                let diff = sample.abs_diff(srtt);
                self.rttvar = Some(rttvar * 3 / 4 + diff / 4);
                self.srtt = Some(srtt * 7 / 8 + sample / 8);
            }
            _ => {
                self.srtt = Some(sample);
                self.rttvar = Some(sample / 2);
            }
        }
        self.reset();
    }

    /// Double the RTO after a retransmission round (RFC 6298 §5.5).
    ///
    /// Capped at `max_rto`.  No-op for a fixed policy.
    pub fn back_off(&mut self) {
        if self.adaptive {
            self.current = (self.current * 2).min(self.max_rto);
        }
    }

    fn reset(&mut self) {
        self.current = match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => (srtt + rttvar * 4).clamp(self.min_rto, self.max_rto),
            _ => self.min_rto,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn fixed_policy_never_moves() {
        let mut p = RtoPolicy::fixed(ms(40));
        p.record_sample(ms(500));
        p.back_off();
        assert_eq!(p.current(), ms(40));
        assert!(p.srtt().is_none());
    }

    #[test]
    fn first_sample_sets_srtt_and_rto() {
        let mut p = RtoPolicy::adaptive(ms(10), ms(1000));
        p.record_sample(ms(100));
        // SRTT = 100, RTTVAR = 50 -> RTO = 300
        assert_eq!(p.srtt(), Some(ms(100)));
        assert_eq!(p.current(), ms(300));
    }

    #[test]
    fn rto_is_clamped_to_bounds() {
        let mut p = RtoPolicy::adaptive(ms(40), ms(200));
        p.record_sample(ms(1));
        assert_eq!(p.current(), ms(40));
        p.record_sample(ms(900));
        assert_eq!(p.current(), ms(200));
    }

    #[test]
    fn back_off_doubles_up_to_max() {
        let mut p = RtoPolicy::adaptive(ms(40), ms(100));
        p.back_off();
        assert_eq!(p.current(), ms(80));
        p.back_off();
        assert_eq!(p.current(), ms(100));
    }

    #[test]
    fn steady_samples_converge() {
        let mut p = RtoPolicy::adaptive(ms(1), ms(10_000));
        for _ in 0..200 {
            p.record_sample(ms(20));
        }
        let srtt = p.srtt().unwrap();
        assert!(srtt.abs_diff(ms(20)) < ms(1));
        // RTTVAR decays toward zero, so RTO approaches SRTT.
        assert!(p.current() < ms(25));
    }
}
