//! Round-trip estimation and the retransmission timeout (RFC 6298).

use std::time::Duration;

const ALPHA: f64 = 0.125;
const BETA: f64 = 0.25;
const K: f64 = 4.0;

/// Clock granularity G.
const GRANULARITY: Duration = Duration::from_millis(100);
const RTO_MIN: Duration = Duration::from_millis(200);
const RTO_MAX: Duration = Duration::from_secs(60);

/// Smoothed round-trip state feeding the retransmission timeout.
///
/// Samples must never be taken from retransmitted segments (Karn's rule);
/// that filtering is the caller's job.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Option<f64>,
    rttvar: f64,
    rto: Duration,
}

impl RttEstimator {
    #[must_use]
    pub fn new(initial_rto: Duration) -> RttEstimator {
        RttEstimator {
            srtt: None,
            rttvar: 0.0,
            rto: initial_rto,
        }
    }

    /// Feeds one round-trip measurement.
    pub fn sample(&mut self, rtt: Duration) {
        let r = rtt.as_secs_f64();
        match self.srtt {
            None => {
                self.srtt = Some(r);
                self.rttvar = r / 2.0;
            }
            Some(srtt) => {
                self.rttvar = (1.0 - BETA) * self.rttvar + BETA * (srtt - r).abs();
                self.srtt = Some((1.0 - ALPHA) * srtt + ALPHA * r);
            }
        }

        let srtt = self.srtt.unwrap_or(r);
        let variance = (K * self.rttvar).max(GRANULARITY.as_secs_f64());
        self.rto = Duration::from_secs_f64(srtt + variance).clamp(RTO_MIN, RTO_MAX);
    }

    /// The current retransmission timeout.
    #[must_use]
    pub fn rto(&self) -> Duration {
        self.rto
    }
}
