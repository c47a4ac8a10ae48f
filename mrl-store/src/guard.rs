//! Rate limiting for polled resources.
//!
//! A polled resource (the set of unassigned jobs, or one job's task groups)
//! goes idle -> in-flight -> cooling-down -> idle. A new request may only
//! start from idle, so callers can suggest a poll on every local tick without
//! overlapping requests or exceeding one request per interval.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    InFlight { since: Instant },
    CoolingDown { until: Instant },
}

#[derive(Debug, Clone)]
pub struct PollGuard {
    interval: Duration,
    state: PollState,
    retiring: bool,
}

impl PollGuard {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: PollState::Idle,
            retiring: false,
        }
    }

    fn in_flight(&self) -> bool {
        matches!(self.state, PollState::InFlight { .. })
    }

    /// The state as of `now`. A cool-down that has run out reads as idle.
    pub fn state(&self, now: Instant) -> PollState {
        match self.state {
            PollState::CoolingDown { until } if now >= until => PollState::Idle,
            state => state,
        }
    }

    /// Start a request if the resource is idle. Returns whether it started.
    pub fn try_begin(&mut self, now: Instant) -> bool {
        match self.state(now) {
            PollState::Idle => {
                self.state = PollState::InFlight { since: now };
                true
            }
            _ => false,
        }
    }

    /// The outstanding request completed (successfully or not).
    ///
    /// The interval is measured from completion, not from the start.
    pub fn finish(&mut self, now: Instant) {
        self.state = PollState::CoolingDown {
            until: now + self.interval,
        };
    }
}

/// Poll guards for a family of resources, keyed by name.
#[derive(Debug, Default)]
pub struct PollGuards {
    guards: DashMap<String, PollGuard>,
}

impl PollGuards {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to start a request against `resource`, creating its guard on
    /// first use.
    pub fn try_begin(&self, resource: &str, interval: Duration) -> bool {
        let now = Instant::now();
        self.guards
            .entry(resource.to_string())
            .or_insert_with(|| PollGuard::new(interval))
            .try_begin(now)
    }

    pub fn finish(&self, resource: &str) {
        if let Some(mut guard) = self.guards.get_mut(resource) {
            guard.finish(Instant::now());
        }
        self.guards.remove_if(resource, |_, guard| guard.retiring);
    }

    pub fn state(&self, resource: &str) -> PollState {
        self.guards
            .get(resource)
            .map_or(PollState::Idle, |guard| guard.state(Instant::now()))
    }

    /// Drop a resource's guard once nobody will poll it again.
    ///
    /// A guard with a request in flight is kept until that request
    /// finishes, so a new watcher cannot overlap it.
    pub fn forget(&self, resource: &str) {
        if let Some(mut guard) = self.guards.get_mut(resource) {
            if guard.in_flight() {
                guard.retiring = true;
                return;
            }
        }
        self.guards.remove_if(resource, |_, guard| !guard.in_flight());
    }
}
