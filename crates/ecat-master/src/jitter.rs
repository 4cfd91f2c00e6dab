//! Cyclic-arrival jitter estimation.
//!
//! Exponentially-weighted interarrival jitter per RFC 1889: for each
//! arrival the deviation of the observed interval from the nominal cycle
//! time feeds a low-pass filter with gain 1/16. The estimate gates
//! promotion to OP; a bus that cannot hold its cycle never goes
//! operational.
//!
//! The estimator itself is plain state written only from the thread
//! calling `receive`; the master publishes estimate and sample count
//! through lock-free atomics (see `MasterMonitor`).

/// RFC 1889 interarrival jitter estimator.
#[derive(Debug)]
pub struct JitterEstimator {
    cycle_time_ns: u64,
    previous_arrival: Option<i64>,
    estimate_ns: u64,
    samples: u64,
}

impl JitterEstimator {
    /// Estimator for the given nominal cycle time.
    #[must_use]
    pub fn new(cycle_time_ns: u64) -> Self {
        Self {
            cycle_time_ns,
            previous_arrival: None,
            estimate_ns: 0,
            samples: 0,
        }
    }

    /// Record a frame arrival at DC time `arrival_ns`.
    ///
    /// The first arrival only seeds the reference point; every later one
    /// updates the estimate with `estimate += (D - estimate) / 16` where
    /// `D = |interval - cycle_time|`.
    pub fn record_arrival(&mut self, arrival_ns: i64) {
        if let Some(previous) = self.previous_arrival {
            let deviation = (arrival_ns - previous - self.cycle_time_ns as i64).unsigned_abs();
            let delta = (deviation as i64 - self.estimate_ns as i64) / 16;
            self.estimate_ns = (self.estimate_ns as i64 + delta).max(0) as u64;
            self.samples += 1;
        }
        self.previous_arrival = Some(arrival_ns);
    }

    /// Current jitter estimate in nanoseconds.
    #[must_use]
    pub fn estimate_ns(&self) -> u64 {
        self.estimate_ns
    }

    /// Number of intervals that have fed the estimate.
    #[must_use]
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Forget all history, e.g. after the bus was re-primed.
    pub fn reset(&mut self) {
        self.previous_arrival = None;
        self.estimate_ns = 0;
        self.samples = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CYCLE: i64 = 1_000_000;

    #[test]
    fn test_first_arrival_only_seeds() {
        let mut jitter = JitterEstimator::new(CYCLE as u64);
        jitter.record_arrival(5_000_000);
        assert_eq!(jitter.estimate_ns(), 0);
        assert_eq!(jitter.samples(), 0);
    }

    #[test]
    fn test_perfect_cycle_keeps_estimate_zero() {
        let mut jitter = JitterEstimator::new(CYCLE as u64);
        let mut t = 0;
        for _ in 0..100 {
            jitter.record_arrival(t);
            t += CYCLE;
        }
        assert_eq!(jitter.estimate_ns(), 0);
        assert_eq!(jitter.samples(), 99);
    }

    #[test]
    fn test_filter_sequence() {
        // Intervals 1_000_000, 1_000_200, 999_800, 1_050_000 give
        // deviations 0, 200, 200, 50_000 and filtered estimates
        // 0, 12, 23, 3146.
        let mut jitter = JitterEstimator::new(CYCLE as u64);
        let mut t = 0;
        jitter.record_arrival(t);

        let mut estimates = Vec::new();
        for interval in [1_000_000, 1_000_200, 999_800, 1_050_000] {
            t += interval;
            jitter.record_arrival(t);
            estimates.push(jitter.estimate_ns());
        }

        assert_eq!(estimates, vec![0, 12, 23, 3146]);
        assert_eq!(jitter.samples(), 4);
    }

    #[test]
    fn test_estimate_decays_after_disturbance() {
        let mut jitter = JitterEstimator::new(CYCLE as u64);
        let mut t = 0;
        jitter.record_arrival(t);
        t += CYCLE + 160_000;
        jitter.record_arrival(t);
        let disturbed = jitter.estimate_ns();
        assert_eq!(disturbed, 10_000);

        for _ in 0..200 {
            t += CYCLE;
            jitter.record_arrival(t);
        }
        assert!(jitter.estimate_ns() < disturbed / 100);
    }

    #[test]
    fn test_early_frames_never_go_negative() {
        let mut jitter = JitterEstimator::new(CYCLE as u64);
        jitter.record_arrival(0);
        // Frame 400µs early: deviation is the magnitude, not signed.
        jitter.record_arrival(CYCLE - 400_000);
        assert_eq!(jitter.estimate_ns(), 25_000);
    }

    #[test]
    fn test_reset() {
        let mut jitter = JitterEstimator::new(CYCLE as u64);
        jitter.record_arrival(0);
        jitter.record_arrival(CYCLE + 16_000);
        assert!(jitter.estimate_ns() > 0);

        jitter.reset();
        assert_eq!(jitter.estimate_ns(), 0);
        assert_eq!(jitter.samples(), 0);
    }
}
