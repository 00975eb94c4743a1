//! Runtime configuration for the execution core.

use std::time::Duration;

use serde::Deserialize;

/// Configuration shared by the dispatcher, lease monitor, HITL state
/// machine, and store.
///
/// Durations are carried as milliseconds so the struct can be deserialized
/// from flat configuration sources; accessor methods expose `Duration`s.
#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    /// Maximum concurrent in-flight tickets across the fleet.
    #[serde(default = "CoreConfig::default_max_fleet")]
    pub max_fleet: u32,

    /// Dispatcher poll interval.
    #[serde(default = "CoreConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Lease duration granted on claim and extended by heartbeats.
    #[serde(default = "CoreConfig::default_lease_duration_ms")]
    pub lease_duration_ms: u64,

    /// Interval between coordinator heartbeat refreshes.
    #[serde(default = "CoreConfig::default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// How long without a heartbeat before a lease is considered stale.
    #[serde(default = "CoreConfig::default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,

    /// Interval between stale-lease reclamation sweeps.
    #[serde(default = "CoreConfig::default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,

    /// Maximum claim attempts per ticket before it fails out.
    #[serde(default = "CoreConfig::default_max_attempts")]
    pub max_attempts: u32,

    /// Maximum clarification turns before a session must move on.
    #[serde(default = "CoreConfig::default_max_clarification_turns")]
    pub max_clarification_turns: u32,

    /// Coverage percentage at which clarification is considered complete.
    #[serde(default = "CoreConfig::default_coverage_ready_threshold")]
    pub coverage_ready_threshold: u8,

    /// Per-tenant cap on concurrent in-flight tickets. Defaults to
    /// `max_fleet` (no extra restriction).
    #[serde(default)]
    pub tenant_concurrency_cap: Option<u32>,
}

impl CoreConfig {
    const fn default_max_fleet() -> u32 {
        10
    }

    const fn default_poll_interval_ms() -> u64 {
        5_000
    }

    const fn default_lease_duration_ms() -> u64 {
        1_800_000
    }

    const fn default_heartbeat_interval_ms() -> u64 {
        30_000
    }

    const fn default_stale_threshold_ms() -> u64 {
        300_000
    }

    const fn default_reaper_interval_ms() -> u64 {
        60_000
    }

    const fn default_max_attempts() -> u32 {
        3
    }

    const fn default_max_clarification_turns() -> u32 {
        10
    }

    const fn default_coverage_ready_threshold() -> u8 {
        80
    }

    /// Dispatcher poll interval as a `Duration`.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Lease duration as a `Duration`.
    #[must_use]
    pub const fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    /// Heartbeat interval as a `Duration`.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Stale threshold as a `Duration`.
    #[must_use]
    pub const fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    /// Reaper interval as a `Duration`.
    #[must_use]
    pub const fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    /// Effective per-tenant concurrency cap.
    #[must_use]
    pub fn tenant_cap(&self) -> u32 {
        self.tenant_concurrency_cap.unwrap_or(self.max_fleet)
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_fleet: Self::default_max_fleet(),
            poll_interval_ms: Self::default_poll_interval_ms(),
            lease_duration_ms: Self::default_lease_duration_ms(),
            heartbeat_interval_ms: Self::default_heartbeat_interval_ms(),
            stale_threshold_ms: Self::default_stale_threshold_ms(),
            reaper_interval_ms: Self::default_reaper_interval_ms(),
            max_attempts: Self::default_max_attempts(),
            max_clarification_turns: Self::default_max_clarification_turns(),
            coverage_ready_threshold: Self::default_coverage_ready_threshold(),
            tenant_concurrency_cap: None,
        }
    }
}
