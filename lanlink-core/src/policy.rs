//! Adaptive polling: derive interval, probe timeout, cache use and validation budget
//! from the current power reading. Pure; recomputed on every tick and power change.

use std::time::Duration;

use crate::power::PowerState;

/// Probe timeout under normal conditions.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Probe timeout under low power or low battery.
pub const CONSTRAINED_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Minimum spacing between background polls in low-power mode.
pub const LOW_POWER_MIN_SPACING: Duration = Duration::from_secs(120);

/// Hard cap on one browse pass in low-power mode when not user-initiated.
pub const LOW_POWER_BROWSE_TIMEOUT: Duration = Duration::from_secs(15);

/// Confirmed endpoints after which low-power mode stops validating.
pub const LOW_POWER_VALIDATION_BUDGET: usize = 3;

/// How long a foregrounded engine trusts its last poll before rescanning.
pub const FOREGROUND_STALENESS: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Always hit the network; send `Cache-Control: no-cache`.
    ReloadIgnoringCache,
    /// Reuse a recent probe result for the same endpoint.
    PreferCache,
}

/// What a validator needs from the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    pub timeout: Duration,
    pub cache: CachePolicy,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PROBE_TIMEOUT,
            cache: CachePolicy::ReloadIgnoringCache,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    Run,
    /// Too soon after the last background poll; try again next interval.
    Skip,
    /// Polling is off until the lifecycle changes.
    Suppressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingPolicy {
    /// `None` when polling is suppressed (backgrounded, not user-initiated).
    pub interval: Option<Duration>,
    pub probe: ProbePolicy,
    /// Stop dispatching validations once this many endpoints are confirmed.
    pub validation_budget: Option<usize>,
    /// Minimum time since the last background poll before another one runs.
    pub min_spacing: Option<Duration>,
    pub browse_timeout: Option<Duration>,
}

impl PollingPolicy {
    /// `floor` is the shortest interval the host supports.
    pub fn for_state(state: &PowerState, user_initiated: bool, floor: Duration) -> Self {
        let probe = if state.is_constrained() {
            ProbePolicy {
                timeout: CONSTRAINED_PROBE_TIMEOUT,
                cache: CachePolicy::PreferCache,
            }
        } else {
            ProbePolicy::default()
        };

        if state.in_background && !user_initiated {
            return Self {
                interval: None,
                probe,
                validation_budget: None,
                min_spacing: None,
                browse_timeout: None,
            };
        }

        // Low power keeps the short interval; `min_spacing` thins out the ticks that run.
        let low_power = state.low_power_mode;
        Self {
            interval: Some(floor),
            probe,
            validation_budget: low_power.then_some(LOW_POWER_VALIDATION_BUDGET),
            min_spacing: (low_power && !user_initiated).then_some(LOW_POWER_MIN_SPACING),
            browse_timeout: (low_power && !user_initiated).then_some(LOW_POWER_BROWSE_TIMEOUT),
        }
    }

    pub fn is_suppressed(&self) -> bool {
        self.interval.is_none()
    }

    /// `since_last_background_poll` is `None` if no background poll has run yet.
    pub fn decide_tick(&self, since_last_background_poll: Option<Duration>) -> TickDecision {
        if self.is_suppressed() {
            return TickDecision::Suppressed;
        }
        match (self.min_spacing, since_last_background_poll) {
            (Some(min), Some(elapsed)) if elapsed < min => TickDecision::Skip,
            _ => TickDecision::Run,
        }
    }

    /// True when validation should be skipped given the number of confirmed endpoints.
    pub fn budget_exhausted(&self, confirmed: usize) -> bool {
        self.validation_budget.is_some_and(|b| confirmed >= b)
    }
}

/// True if a foregrounded engine should poll immediately.
pub fn is_stale(endpoint_count: usize, since_last_successful_poll: Option<Duration>) -> bool {
    endpoint_count == 0 || since_last_successful_poll.map_or(true, |d| d >= FOREGROUND_STALENESS)
}
