use std::time::Duration;

const SMOOTHING_WEIGHT: f64 = 0.125;
const VARIANCE_WEIGHT: f64 = 0.25;
const MIN_RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(50);

/// Exponentially weighted RTT statistics driven by ack and heartbeat samples.
///
/// Until the first sample arrives both estimates are zero, so retransmissions
///  start at the 50ms floor; the first sample then initializes the mean with
///  itself and the variance with half of it, and subsequent samples are blended
///  in with the classic 1/8 / 1/4 weights.
#[derive(Debug)]
pub struct RttEstimator {
    smoothed_rtt: f64,
    rtt_variance: f64,
    has_sample: bool,
}

impl RttEstimator {
    pub fn new() -> RttEstimator {
        RttEstimator {
            smoothed_rtt: 0.0,
            rtt_variance: 0.0,
            has_sample: false,
        }
    }

    pub fn sample(&mut self, rtt: Duration) {
        let rtt = rtt.as_secs_f64();
        if !self.has_sample {
            self.smoothed_rtt = rtt;
            self.rtt_variance = rtt / 2.0;
            self.has_sample = true;
            return;
        }

        let deviation = (rtt - self.smoothed_rtt).abs();
        self.rtt_variance += (deviation - self.rtt_variance) * VARIANCE_WEIGHT;
        self.smoothed_rtt += (rtt - self.smoothed_rtt) * SMOOTHING_WEIGHT;
    }

    pub fn smoothed_rtt(&self) -> Duration {
        Duration::from_secs_f64(self.smoothed_rtt)
    }

    /// how long to leave a reliable frame unacknowledged before re-sending it
    pub fn retransmit_timeout(&self) -> Duration {
        let timeout = Duration::from_secs_f64(self.smoothed_rtt + 4.0 * self.rtt_variance);
        timeout.max(MIN_RETRANSMIT_TIMEOUT)
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}
