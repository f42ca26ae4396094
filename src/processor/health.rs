//! Health-state machine of the queue processor.
//!
//! Pure transition logic, kept free of threads and channels so the sampling
//! targets, the CRITICAL-to-DEGRADED hysteresis, and recovery stepping are
//! testable in isolation. The processor's monitor thread drives it.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Coarse classification of a processor's condition. `Stopped` is the
/// initial and terminal state around `start()`/`stop()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
    Stopped,
}

impl HealthStatus {
    fn rank(self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Critical => 2,
            HealthStatus::Stopped => 3,
        }
    }

    pub fn is_better_than(self, other: HealthStatus) -> bool {
        self.rank() < other.rank()
    }
}

/// Mutable thresholds and intervals of one processor.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Utilization above which the processor is degraded.
    pub max_queue_utilization: f64,
    /// Utilization above which the processor is critical.
    pub critical_queue_utilization: f64,
    /// Average per-item latency above which the processor is degraded.
    pub max_processing_time_ms: f64,
    /// Idle time with a non-empty queue after which the worker counts as stuck.
    pub stuck_threshold: Duration,
    pub health_check_interval: Duration,
    pub recovery_check_interval: Duration,
    /// Minimum dwell time in a state before recovery may step out of it.
    pub min_time_in_state: Duration,
    pub max_recovery_attempts: u32,
    /// After the attempt budget is spent, the cooldown that re-arms it.
    pub recovery_cooldown: Duration,
    /// Reset the rolling latency window when recovery leaves CRITICAL.
    pub reset_counters_on_recovery: bool,
    /// Enables dynamic threshold adjustment.
    pub adjust_thresholds: bool,
    pub threshold_adjust_interval: Duration,
    /// Bounded wait of `submit` before it escalates.
    pub submit_timeout: Duration,
    pub healthy_log_interval: Duration,
    pub unhealthy_log_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_queue_utilization: 0.8,
            critical_queue_utilization: 0.95,
            max_processing_time_ms: 100.0,
            stuck_threshold: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(5),
            recovery_check_interval: Duration::from_secs(10),
            min_time_in_state: Duration::from_secs(10),
            max_recovery_attempts: 3,
            recovery_cooldown: Duration::from_secs(60),
            reset_counters_on_recovery: true,
            adjust_thresholds: false,
            threshold_adjust_interval: Duration::from_secs(30),
            submit_timeout: Duration::from_secs(1),
            healthy_log_interval: Duration::from_secs(300),
            unhealthy_log_interval: Duration::from_secs(30),
        }
    }
}

/// Comprehensive snapshot returned by `get_health_metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    pub queue_size: usize,
    pub queue_capacity: usize,
    pub queue_utilization: f64,
    pub events_processed: u64,
    pub events_dropped: u64,
    pub avg_processing_time_ms: f64,
    pub health_status: HealthStatus,
    pub worker_alive: bool,
    pub consecutive_empty_cycles: u64,
    pub last_processed_age_secs: f64,
    pub seconds_in_state: f64,
    pub recovery_attempts: u32,
}

/// One observation of the processor, as fed to the state machine.
#[derive(Debug, Clone, Copy)]
pub struct HealthSample {
    pub utilization: f64,
    pub queue_size: usize,
    pub avg_processing_time_ms: f64,
    pub worker_alive: bool,
    /// Time since the worker last finished an item.
    pub idle_for: Duration,
}

#[derive(Debug, Clone, Copy)]
struct ThresholdDefaults {
    max_queue_utilization: f64,
    critical_queue_utilization: f64,
    max_processing_time_ms: f64,
}

/// The state machine proper. Guarded by the processor's health mutex.
pub(crate) struct HealthState {
    pub status: HealthStatus,
    pub last_transition: Instant,
    pub recovery_attempts: u32,
    pub last_recovery_attempt: Option<Instant>,
    defaults: ThresholdDefaults,
}

impl HealthState {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            status: HealthStatus::Stopped,
            last_transition: Instant::now(),
            recovery_attempts: 0,
            last_recovery_attempt: None,
            defaults: ThresholdDefaults {
                max_queue_utilization: config.max_queue_utilization,
                critical_queue_utilization: config.critical_queue_utilization,
                max_processing_time_ms: config.max_processing_time_ms,
            },
        }
    }

    /// Re-captures the baseline that `adjust_thresholds` relaxes from and
    /// resets to. Called when the configuration is replaced at runtime.
    pub fn rebase_defaults(&mut self, config: &HealthConfig) {
        self.defaults = ThresholdDefaults {
            max_queue_utilization: config.max_queue_utilization,
            critical_queue_utilization: config.critical_queue_utilization,
            max_processing_time_ms: config.max_processing_time_ms,
        };
    }

    /// Raw per-sample target, before hysteresis.
    pub fn target(config: &HealthConfig, sample: &HealthSample) -> HealthStatus {
        let stuck = sample.queue_size > 0
            && sample.worker_alive
            && sample.idle_for > config.stuck_threshold;
        if !sample.worker_alive
            || stuck
            || sample.utilization > config.critical_queue_utilization
        {
            HealthStatus::Critical
        } else if sample.utilization > config.max_queue_utilization
            || sample.avg_processing_time_ms > config.max_processing_time_ms
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Applies one health sample. A transition out of CRITICAL may land only
    /// on DEGRADED even when the raw target is HEALTHY; a later sample may
    /// then reach HEALTHY from DEGRADED. Any transition resets the
    /// recovery-attempt counter. Returns `(old, new)` when the state changed.
    pub fn apply_sample(
        &mut self,
        config: &HealthConfig,
        sample: &HealthSample,
        now: Instant,
    ) -> Option<(HealthStatus, HealthStatus)> {
        let mut target = Self::target(config, sample);
        if self.status == HealthStatus::Critical && target == HealthStatus::Healthy {
            target = HealthStatus::Degraded;
        }
        if target == self.status {
            return None;
        }
        let old = self.status;
        self.status = target;
        self.last_transition = now;
        self.recovery_attempts = 0;
        Some((old, target))
    }

    /// Bounded recovery step: requires an unhealthy state, a minimum dwell
    /// time, and either attempt budget or an elapsed cooldown; then steps one
    /// level toward a strictly better target (through DEGRADED when leaving
    /// CRITICAL). Recovery steps consume the attempt budget instead of
    /// resetting it. Returns `(old, new)` when a step was taken.
    pub fn attempt_recovery(
        &mut self,
        config: &HealthConfig,
        sample: &HealthSample,
        now: Instant,
    ) -> Option<(HealthStatus, HealthStatus)> {
        if matches!(self.status, HealthStatus::Healthy | HealthStatus::Stopped) {
            return None;
        }
        if now.duration_since(self.last_transition) < config.min_time_in_state {
            return None;
        }
        let budget_available = self.recovery_attempts < config.max_recovery_attempts
            || self
                .last_recovery_attempt
                .map_or(true, |at| now.duration_since(at) >= config.recovery_cooldown);
        if !budget_available {
            return None;
        }
        let target = Self::target(config, sample);
        if !target.is_better_than(self.status) {
            return None;
        }
        let next = if self.status == HealthStatus::Critical {
            HealthStatus::Degraded
        } else {
            target
        };
        let old = self.status;
        self.status = next;
        self.last_transition = now;
        self.recovery_attempts += 1;
        self.last_recovery_attempt = Some(now);
        Some((old, next))
    }

    /// Dynamic threshold adjustment from a blended load factor. High load
    /// relaxes all three thresholds, moderate load relaxes them less, and
    /// anything below that resets them to their configured defaults.
    pub fn adjust_thresholds(&self, config: &mut HealthConfig, sample: &HealthSample) {
        let normalized_latency =
            (sample.avg_processing_time_ms / self.defaults.max_processing_time_ms).min(1.0);
        let load = 0.7 * sample.utilization + 0.3 * normalized_latency;
        let defaults = self.defaults;
        if load > 0.9 {
            config.max_queue_utilization = (defaults.max_queue_utilization * 1.15)
                .min(defaults.critical_queue_utilization - 0.01);
            config.critical_queue_utilization =
                (defaults.critical_queue_utilization + 0.03).min(0.99);
            config.max_processing_time_ms = defaults.max_processing_time_ms * 2.0;
        } else if load > 0.7 {
            config.max_queue_utilization = (defaults.max_queue_utilization * 1.05)
                .min(defaults.critical_queue_utilization - 0.01);
            config.critical_queue_utilization =
                (defaults.critical_queue_utilization + 0.01).min(0.99);
            config.max_processing_time_ms = defaults.max_processing_time_ms * 1.5;
        } else {
            config.max_queue_utilization = defaults.max_queue_utilization;
            config.critical_queue_utilization = defaults.critical_queue_utilization;
            config.max_processing_time_ms = defaults.max_processing_time_ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_sample(utilization: f64, avg_ms: f64) -> HealthSample {
        HealthSample {
            utilization,
            queue_size: (utilization * 100.0) as usize,
            avg_processing_time_ms: avg_ms,
            worker_alive: true,
            idle_for: Duration::from_millis(1),
        }
    }

    #[test]
    fn targets_follow_thresholds() {
        let config = HealthConfig::default();
        assert_eq!(
            HealthState::target(&config, &idle_sample(0.1, 1.0)),
            HealthStatus::Healthy
        );
        assert_eq!(
            HealthState::target(&config, &idle_sample(0.85, 1.0)),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthState::target(&config, &idle_sample(0.1, 150.0)),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthState::target(&config, &idle_sample(0.97, 1.0)),
            HealthStatus::Critical
        );
    }

    #[test]
    fn dead_worker_is_critical() {
        let config = HealthConfig::default();
        let mut sample = idle_sample(0.0, 0.0);
        sample.worker_alive = false;
        assert_eq!(
            HealthState::target(&config, &sample),
            HealthStatus::Critical
        );
    }

    #[test]
    fn stuck_worker_is_critical() {
        let config = HealthConfig::default();
        let sample = HealthSample {
            utilization: 0.01,
            queue_size: 1,
            avg_processing_time_ms: 1.0,
            worker_alive: true,
            idle_for: Duration::from_secs(31),
        };
        assert_eq!(
            HealthState::target(&config, &sample),
            HealthStatus::Critical
        );
    }

    #[test]
    fn leaving_critical_passes_through_degraded() {
        let config = HealthConfig::default();
        let mut state = HealthState::new(&config);
        state.status = HealthStatus::Healthy;

        let now = Instant::now();
        state.apply_sample(&config, &idle_sample(0.97, 1.0), now);
        assert_eq!(state.status, HealthStatus::Critical);

        // Raw conditions qualify for HEALTHY, but hysteresis lands on DEGRADED.
        state.apply_sample(&config, &idle_sample(0.1, 1.0), now);
        assert_eq!(state.status, HealthStatus::Degraded);

        // A later sample may then reach HEALTHY.
        state.apply_sample(&config, &idle_sample(0.1, 1.0), now);
        assert_eq!(state.status, HealthStatus::Healthy);
    }

    #[test]
    fn transitions_reset_recovery_attempts() {
        let config = HealthConfig::default();
        let mut state = HealthState::new(&config);
        state.status = HealthStatus::Healthy;
        state.recovery_attempts = 2;
        state.apply_sample(&config, &idle_sample(0.97, 1.0), Instant::now());
        assert_eq!(state.recovery_attempts, 0);
    }

    #[test]
    fn recovery_steps_from_critical_to_degraded_only() {
        let config = HealthConfig::default();
        let mut state = HealthState::new(&config);
        state.status = HealthStatus::Critical;
        state.last_transition = Instant::now() - Duration::from_secs(60);

        let stepped =
            state.attempt_recovery(&config, &idle_sample(0.1, 1.0), Instant::now());
        assert_eq!(
            stepped,
            Some((HealthStatus::Critical, HealthStatus::Degraded))
        );
        assert_eq!(state.recovery_attempts, 1);
    }

    #[test]
    fn recovery_respects_dwell_time() {
        let config = HealthConfig::default();
        let mut state = HealthState::new(&config);
        state.status = HealthStatus::Degraded;
        state.last_transition = Instant::now();

        let stepped =
            state.attempt_recovery(&config, &idle_sample(0.1, 1.0), Instant::now());
        assert_eq!(stepped, None);
    }

    #[test]
    fn recovery_budget_depletes_until_cooldown() {
        let mut config = HealthConfig::default();
        config.min_time_in_state = Duration::from_secs(0);
        let mut state = HealthState::new(&config);
        state.status = HealthStatus::Critical;
        state.last_transition = Instant::now() - Duration::from_secs(120);
        state.recovery_attempts = config.max_recovery_attempts;
        state.last_recovery_attempt = Some(Instant::now());

        let stepped =
            state.attempt_recovery(&config, &idle_sample(0.1, 1.0), Instant::now());
        assert_eq!(stepped, None, "budget spent and cooldown not elapsed");

        state.last_recovery_attempt =
            Some(Instant::now() - config.recovery_cooldown - Duration::from_secs(1));
        let stepped =
            state.attempt_recovery(&config, &idle_sample(0.1, 1.0), Instant::now());
        assert!(stepped.is_some(), "cooldown re-arms the budget");
    }

    #[test]
    fn recovery_never_steps_to_a_worse_state() {
        let config = HealthConfig::default();
        let mut state = HealthState::new(&config);
        state.status = HealthStatus::Degraded;
        state.last_transition = Instant::now() - Duration::from_secs(60);

        let stepped =
            state.attempt_recovery(&config, &idle_sample(0.97, 1.0), Instant::now());
        assert_eq!(stepped, None);
        assert_eq!(state.status, HealthStatus::Degraded);
    }

    #[test]
    fn thresholds_relax_under_load_and_reset_when_calm() {
        let mut config = HealthConfig::default();
        let state = HealthState::new(&config);

        state.adjust_thresholds(&mut config, &idle_sample(0.95, 200.0));
        assert!(config.max_queue_utilization > 0.8);
        assert!(config.critical_queue_utilization > 0.95);
        assert!(config.max_processing_time_ms > 100.0);
        assert!(config.max_queue_utilization < config.critical_queue_utilization);

        state.adjust_thresholds(&mut config, &idle_sample(0.1, 1.0));
        assert_eq!(config.max_queue_utilization, 0.8);
        assert_eq!(config.critical_queue_utilization, 0.95);
        assert_eq!(config.max_processing_time_ms, 100.0);
    }
}
