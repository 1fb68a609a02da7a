use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

use log::{debug, warn};

use meridian_common::config::{BPS_DENOMINATOR, BREAKER_FAILURE_RATE_BPS, BREAKER_OPEN_SECS, BREAKER_WINDOW};

use super::GatewayError;

// Minimum samples before the failure rate is meaningful
const MIN_SAMPLES: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    opened_at: Option<Instant>,
    outcomes: VecDeque<bool>,
    failures: usize,
    probe_taken: bool,
}

// Rolling-window circuit breaker per transport. Opens when the failure rate
// over the last `window` calls exceeds the threshold, stays open for the
// cooldown, then half-opens on a single probe.
pub struct CircuitBreaker {
    name: &'static str,
    window: usize,
    threshold_bps: u64,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str) -> Self {
        Self::with(
            name,
            BREAKER_WINDOW,
            BREAKER_FAILURE_RATE_BPS,
            Duration::from_secs(BREAKER_OPEN_SECS),
        )
    }

    pub fn with(name: &'static str, window: usize, threshold_bps: u64, cooldown: Duration) -> Self {
        Self {
            name,
            window,
            threshold_bps,
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                opened_at: None,
                outcomes: VecDeque::with_capacity(window),
                failures: 0,
                probe_taken: false,
            }),
        }
    }

    // Ask permission before a call. While half-open only one probe passes.
    pub fn permit(&self) -> Result<(), GatewayError> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let lapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if lapsed {
                    debug!("breaker '{}' half-open, allowing probe", self.name);
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_taken = true;
                    Ok(())
                } else {
                    Err(GatewayError::BreakerOpen)
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_taken {
                    Err(GatewayError::BreakerOpen)
                } else {
                    inner.probe_taken = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record(&self, success: bool) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        if inner.state == BreakerState::HalfOpen {
            inner.probe_taken = false;
            if success {
                debug!("breaker '{}' closing after successful probe", self.name);
                inner.state = BreakerState::Closed;
                inner.outcomes.clear();
                inner.failures = 0;
            } else {
                warn!("breaker '{}' re-opening after failed probe", self.name);
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            return;
        }

        if inner.outcomes.len() == self.window {
            if let Some(evicted) = inner.outcomes.pop_front() {
                if !evicted {
                    inner.failures -= 1;
                }
            }
        }
        inner.outcomes.push_back(success);
        if !success {
            inner.failures += 1;
        }

        if inner.state == BreakerState::Closed && inner.outcomes.len() >= MIN_SAMPLES {
            let rate_bps = inner.failures as u64 * BPS_DENOMINATOR / inner.outcomes.len() as u64;
            if rate_bps > self.threshold_bps {
                warn!(
                    "breaker '{}' opening: {}/{} recent calls failed",
                    self.name,
                    inner.failures,
                    inner.outcomes.len()
                );
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().expect("breaker lock poisoned").state == BreakerState::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tripped_breaker() -> CircuitBreaker {
        let breaker = CircuitBreaker::with("test", 100, 2_000, Duration::from_secs(30));
        for _ in 0..20 {
            breaker.record(true);
        }
        for _ in 0..10 {
            breaker.record(false);
        }
        breaker
    }

    #[test]
    fn closed_until_rate_exceeded() {
        let breaker = CircuitBreaker::with("test", 100, 2_000, Duration::from_secs(30));
        for _ in 0..24 {
            breaker.record(false);
        }
        // below the sample floor, still closed
        assert!(breaker.permit().is_ok());
        breaker.record(false);
        assert!(breaker.is_open());
        assert!(matches!(breaker.permit(), Err(GatewayError::BreakerOpen)));
    }

    #[test]
    fn trips_at_failure_rate() {
        let breaker = tripped_breaker();
        // 10 failures out of 30 = 33% > 20%
        assert!(breaker.is_open());
    }

    #[test]
    fn half_open_probe_closes_on_success() {
        let breaker = CircuitBreaker::with("test", 100, 2_000, Duration::from_millis(0));
        for _ in 0..25 {
            breaker.record(false);
        }
        assert!(breaker.is_open());

        // cooldown of zero: next permit is the half-open probe
        assert!(breaker.permit().is_ok());
        // a second caller is rejected while the probe is in flight
        assert!(breaker.permit().is_err());

        breaker.record(true);
        assert!(breaker.permit().is_ok());
        assert!(!breaker.is_open());
    }

    #[test]
    fn half_open_probe_reopens_on_failure() {
        let breaker = CircuitBreaker::with("test", 100, 2_000, Duration::from_millis(0));
        for _ in 0..25 {
            breaker.record(false);
        }
        assert!(breaker.permit().is_ok());
        breaker.record(false);
        assert!(breaker.is_open());
    }

    #[test]
    fn window_evicts_old_outcomes() {
        let breaker = CircuitBreaker::with("test", 10, 2_000, Duration::from_secs(30));
        for _ in 0..10 {
            breaker.record(false);
        }
        assert!(breaker.is_open());
    }
}
