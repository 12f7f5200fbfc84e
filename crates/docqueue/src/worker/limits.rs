use std::time::{Duration, Instant};

/// Soft and hard execution limits for one engine call.
///
/// Past the soft limit the engine is asked to stop; past the hard limit the
/// executor stops waiting for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeLimits {
    pub soft: Duration,
    pub hard: Duration,
}

impl TimeLimits {
    /// Creates limits, clamping `soft` to at most `hard`.
    pub fn new(soft: Duration, hard: Duration) -> Self {
        Self {
            soft: soft.min(hard),
            hard,
        }
    }
}

impl Default for TimeLimits {
    fn default() -> Self {
        Self::new(Duration::from_secs(25 * 60), Duration::from_secs(30 * 60))
    }
}

/// What a [`LimitClock`] observed on a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitEvent {
    Running,
    /// The soft limit just passed. Reported once.
    SoftReached,
    HardReached,
}

/// Tracks one engine call against its limits.
#[derive(Debug)]
pub struct LimitClock {
    started: Instant,
    limits: TimeLimits,
    soft_fired: bool,
}

impl LimitClock {
    pub fn start(limits: TimeLimits) -> Self {
        Self::start_at(limits, Instant::now())
    }

    pub fn start_at(limits: TimeLimits, started: Instant) -> Self {
        Self {
            started,
            limits,
            soft_fired: false,
        }
    }

    pub fn poll(&mut self, now: Instant) -> LimitEvent {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed >= self.limits.hard {
            LimitEvent::HardReached
        } else if !self.soft_fired && elapsed >= self.limits.soft {
            self.soft_fired = true;
            LimitEvent::SoftReached
        } else {
            LimitEvent::Running
        }
    }

    /// The next instant at which [`poll`](Self::poll) can change its answer.
    pub fn next_deadline(&self) -> Instant {
        if self.soft_fired {
            self.started + self.limits.hard
        } else {
            self.started + self.limits.soft
        }
    }

    pub fn soft_fired(&self) -> bool {
        self.soft_fired
    }

    pub fn limits(&self) -> TimeLimits {
        self.limits
    }
}
