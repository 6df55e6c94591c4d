//! Round-trip time estimation (RFC 6298).

use std::time::Duration;

use crate::core::constants::{MAX_RTO, MIN_RTO, RTO_BACKOFF};

/// Alpha for SRTT smoothing (1/8).
const SRTT_ALPHA: f64 = 0.125;

/// Beta for RTTVAR smoothing (1/4).
const RTTVAR_BETA: f64 = 0.25;

/// K multiplier for the variance term.
const RTO_K: f64 = 4.0;

/// Clock granularity floor for the variance term, in milliseconds.
const GRANULARITY_MS: f64 = 100.0;

/// Smoothed RTT estimator producing an adaptive retransmission timeout.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// Smoothed RTT in milliseconds.
    srtt: f64,
    /// RTT variance in milliseconds.
    rttvar: f64,
    rto: Duration,
    samples: u64,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(crate::core::constants::INITIAL_RTO)
    }
}

impl RttEstimator {
    /// Create an estimator that reports `initial_rto` until the first sample.
    pub fn new(initial_rto: Duration) -> Self {
        let initial_rto = clamp_rto(initial_rto);
        Self {
            srtt: 0.0,
            rttvar: 0.0,
            rto: initial_rto,
            samples: 0,
        }
    }

    /// Feed one RTT sample.
    ///
    /// First sample: SRTT = R, RTTVAR = R/2. Later samples:
    /// RTTVAR = 3/4 RTTVAR + 1/4 |SRTT - R|, SRTT = 7/8 SRTT + 1/8 R.
    pub fn update(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;

        if self.samples == 0 {
            self.srtt = sample_ms;
            self.rttvar = sample_ms / 2.0;
        } else {
            self.rttvar =
                (1.0 - RTTVAR_BETA) * self.rttvar + RTTVAR_BETA * (self.srtt - sample_ms).abs();
            self.srtt = (1.0 - SRTT_ALPHA) * self.srtt + SRTT_ALPHA * sample_ms;
        }
        self.samples += 1;
        self.rto = self.computed_rto();
    }

    fn computed_rto(&self) -> Duration {
        let rto_ms = self.srtt + f64::max(GRANULARITY_MS, RTO_K * self.rttvar);
        clamp_rto(Duration::from_millis(rto_ms as u64))
    }

    /// Smoothed RTT, `None` before the first sample.
    pub fn srtt(&self) -> Option<Duration> {
        (self.samples > 0).then(|| Duration::from_secs_f64(self.srtt / 1000.0))
    }

    /// RTT variance, `None` before the first sample.
    pub fn rttvar(&self) -> Option<Duration> {
        (self.samples > 0).then(|| Duration::from_secs_f64(self.rttvar / 1000.0))
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }
}

/// Next timeout after a retransmission: doubled, capped at [`MAX_RTO`].
pub fn backoff(rto: Duration) -> Duration {
    rto.saturating_mul(RTO_BACKOFF).min(MAX_RTO)
}

fn clamp_rto(rto: Duration) -> Duration {
    rto.clamp(MIN_RTO, MAX_RTO)
}
