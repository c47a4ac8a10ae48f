use std::time::Duration;

use clap::Args;

use crate::timeout::StallAction;

fn parse_millis(s: &str) -> Result<Duration, std::num::ParseIntError> {
    s.parse().map(Duration::from_millis)
}

/// How a coordinator paces itself and reacts to trouble.
#[derive(Debug, Clone, Args)]
pub struct CoordinatorConfig {
    /// Local tick. Polls are suggested to the store this often; the store
    /// decides whether to issue them.
    #[arg(long = "tick-ms", default_value = "250", value_parser = parse_millis)]
    pub tick: Duration,

    /// Time without progress after which a phase counts as stalled.
    #[arg(long = "phase-timeout-ms", value_parser = parse_millis)]
    pub phase_timeout: Option<Duration>,

    /// What to do about a stalled phase.
    #[arg(long, value_enum, default_value = "log")]
    pub stall_action: StallAction,

    /// Retries of a transiently failed request made at `retry-delay-ms`.
    /// Later retries back off, but a claimed job never stops retrying.
    #[arg(long, default_value = "3")]
    pub retry_limit: u32,

    /// Pause between the first retries.
    #[arg(long = "retry-delay-ms", default_value = "500", value_parser = parse_millis)]
    pub retry_delay: Duration,

    /// Longest pause between retries once backing off.
    #[arg(long = "retry-max-delay-ms", default_value = "30000", value_parser = parse_millis)]
    pub retry_max_delay: Duration,

    /// Capacity of the queues polls deliver into.
    #[arg(long, default_value = "64")]
    pub feed_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(250),
            phase_timeout: None,
            stall_action: StallAction::Log,
            retry_limit: 3,
            retry_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            feed_capacity: 64,
        }
    }
}
