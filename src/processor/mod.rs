//! Self-monitoring sequential queue processor.
//!
//! A `QueueProcessor` owns a bounded queue of type-erased items, one worker
//! thread that dispatches them to registered handlers in strict submission
//! order, and one monitor thread that samples queue health, steps recovery,
//! and optionally adjusts thresholds under sustained load.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::thread_util::{join_with_timeout, JOIN_TIMEOUT};

pub mod health;

pub use health::{HealthConfig, HealthMetrics, HealthSample, HealthStatus};

use health::HealthState;

/// Monitor wake-up granularity. Every periodic deadline is checked on this
/// cadence, so intervals below it are effectively rounded up.
const MONITOR_TICK: Duration = Duration::from_millis(100);

/// Worker poll timeout. Bounds both stop latency and the granularity of the
/// consecutive-empty counter.
const WORKER_POLL: Duration = Duration::from_secs(1);

const DRAIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("processor `{0}` already started")]
    AlreadyStarted(String),
    #[error("failed to spawn thread: {0}")]
    Spawn(String),
}

/// Token returned by `register_handler`, used to unregister it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct HandlerEntry {
    id: u64,
    type_name: &'static str,
    run: Box<dyn Fn(&(dyn Any + Send)) + Send + Sync>,
}

struct Timing {
    total_ms: f64,
    samples: u64,
    last_processed: Instant,
}

struct Shared {
    name: String,
    tx: Sender<Box<dyn Any + Send>>,
    rx: Receiver<Box<dyn Any + Send>>,
    capacity: usize,
    handlers: Mutex<HashMap<TypeId, Vec<Arc<HandlerEntry>>>>,
    next_handler_id: AtomicU64,
    stop_flag: AtomicBool,
    worker_alive: AtomicBool,
    // Items committed to the queue and not yet dispatched or cleared.
    // `events_processed >= events_accepted` means fully drained.
    events_accepted: AtomicU64,
    events_processed: AtomicU64,
    events_dropped: AtomicU64,
    consecutive_empty: AtomicU64,
    timing: Mutex<Timing>,
    health: Mutex<HealthState>,
    config: Mutex<HealthConfig>,
}

impl Shared {
    fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.tx.len() as f64 / self.capacity as f64
    }

    fn avg_processing_time_ms(&self) -> f64 {
        let timing = self.timing.lock().unwrap();
        if timing.samples == 0 {
            0.0
        } else {
            timing.total_ms / timing.samples as f64
        }
    }

    fn sample(&self) -> HealthSample {
        let idle_for = self.timing.lock().unwrap().last_processed.elapsed();
        HealthSample {
            utilization: self.utilization(),
            queue_size: self.tx.len(),
            avg_processing_time_ms: self.avg_processing_time_ms(),
            worker_alive: self.worker_alive.load(Ordering::SeqCst),
            idle_for,
        }
    }

    fn metrics(&self) -> HealthMetrics {
        let sample = self.sample();
        let health = self.health.lock().unwrap();
        HealthMetrics {
            queue_size: sample.queue_size,
            queue_capacity: self.capacity,
            queue_utilization: sample.utilization,
            events_processed: self.events_processed.load(Ordering::SeqCst),
            events_dropped: self.events_dropped.load(Ordering::SeqCst),
            avg_processing_time_ms: sample.avg_processing_time_ms,
            health_status: health.status,
            worker_alive: sample.worker_alive,
            consecutive_empty_cycles: self.consecutive_empty.load(Ordering::SeqCst),
            last_processed_age_secs: sample.idle_for.as_secs_f64(),
            seconds_in_state: health.last_transition.elapsed().as_secs_f64(),
            recovery_attempts: health.recovery_attempts,
        }
    }

    /// Forces the health state to CRITICAL without waiting for the next
    /// monitor sample. Used when a submit times out on a full queue.
    fn force_critical(&self, reason: &str) {
        let mut health = self.health.lock().unwrap();
        if health.status != HealthStatus::Critical {
            warn!(
                "[{}] health {:?} -> Critical ({})",
                self.name, health.status, reason
            );
            health.status = HealthStatus::Critical;
            health.last_transition = Instant::now();
            health.recovery_attempts = 0;
        }
    }

    fn dispatch(&self, item: Box<dyn Any + Send>) {
        let tid = (*item).type_id();
        let entries: Vec<Arc<HandlerEntry>> = {
            let handlers = self.handlers.lock().unwrap();
            match handlers.get(&tid) {
                Some(list) => list.clone(),
                None => {
                    warn!("[{}] no handler registered for queued item", self.name);
                    return;
                }
            }
        };
        for entry in entries {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (entry.run)(item.as_ref())));
            if outcome.is_err() {
                error!(
                    "[{}] handler for {} panicked, continuing",
                    self.name, entry.type_name
                );
            }
        }
    }

    fn worker_loop(&self) {
        self.worker_alive.store(true, Ordering::SeqCst);
        self.timing.lock().unwrap().last_processed = Instant::now();
        while !self.stop_flag.load(Ordering::SeqCst) {
            match self.rx.recv_timeout(WORKER_POLL) {
                Ok(item) => {
                    self.consecutive_empty.store(0, Ordering::SeqCst);
                    let started = Instant::now();
                    self.dispatch(item);
                    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                    {
                        let mut timing = self.timing.lock().unwrap();
                        timing.total_ms += elapsed_ms;
                        timing.samples += 1;
                        timing.last_processed = Instant::now();
                    }
                    self.events_processed.fetch_add(1, Ordering::SeqCst);
                    let slow_after = self.config.lock().unwrap().max_processing_time_ms;
                    if elapsed_ms > slow_after {
                        warn!(
                            "[{}] slow item: {:.1}ms (threshold {:.1}ms)",
                            self.name, elapsed_ms, slow_after
                        );
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.consecutive_empty.fetch_add(1, Ordering::SeqCst);
                    // An empty queue is never stuck.
                    self.timing.lock().unwrap().last_processed = Instant::now();
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.worker_alive.store(false, Ordering::SeqCst);
        debug!("[{}] worker thread exiting", self.name);
    }

    fn monitor_loop(&self) {
        let now = Instant::now();
        let (mut next_check, mut next_recovery, mut next_adjust, mut next_log) = {
            let config = self.config.lock().unwrap();
            (
                now + config.health_check_interval,
                now + config.recovery_check_interval,
                now + config.threshold_adjust_interval,
                now + config.healthy_log_interval,
            )
        };
        while !self.stop_flag.load(Ordering::SeqCst) {
            thread::sleep(MONITOR_TICK);
            let now = Instant::now();
            if now >= next_check {
                let config = self.config.lock().unwrap().clone();
                let sample = self.sample();
                let mut health = self.health.lock().unwrap();
                if let Some((old, new)) = health.apply_sample(&config, &sample, now) {
                    if new.is_better_than(old) {
                        info!("[{}] health {:?} -> {:?}", self.name, old, new);
                    } else {
                        warn!(
                            "[{}] health {:?} -> {:?} (utilization {:.2}, avg {:.1}ms)",
                            self.name, old, new, sample.utilization,
                            sample.avg_processing_time_ms
                        );
                    }
                }
                next_check = now + config.health_check_interval;
            }
            if now >= next_recovery {
                let config = self.config.lock().unwrap().clone();
                let sample = self.sample();
                let mut health = self.health.lock().unwrap();
                if let Some((old, new)) = health.attempt_recovery(&config, &sample, now) {
                    info!(
                        "[{}] recovery step {:?} -> {:?} (attempt {})",
                        self.name, old, new, health.recovery_attempts
                    );
                    if old == HealthStatus::Critical && config.reset_counters_on_recovery {
                        let mut timing = self.timing.lock().unwrap();
                        timing.total_ms = 0.0;
                        timing.samples = 0;
                    }
                }
                next_recovery = now + config.recovery_check_interval;
            }
            if now >= next_adjust {
                let mut config = self.config.lock().unwrap();
                if config.adjust_thresholds {
                    let sample = self.sample();
                    self.health.lock().unwrap().adjust_thresholds(&mut config, &sample);
                }
                next_adjust = now + config.threshold_adjust_interval;
            }
            if now >= next_log {
                let metrics = self.metrics();
                match serde_json::to_string(&metrics) {
                    Ok(json) => info!("[{}] health report {}", self.name, json),
                    Err(e) => warn!("[{}] failed to serialize health report: {}", self.name, e),
                }
                let config = self.config.lock().unwrap();
                let interval = if metrics.health_status == HealthStatus::Healthy {
                    config.healthy_log_interval
                } else {
                    config.unhealthy_log_interval
                };
                next_log = now + interval;
            }
        }
        debug!("[{}] monitor thread exiting", self.name);
    }
}

/// Bounded queue with an owned worker and health monitor.
pub struct QueueProcessor {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl QueueProcessor {
    pub fn new(name: &str, capacity: usize) -> Self {
        Self::with_config(name, capacity, HealthConfig::default())
    }

    pub fn with_config(name: &str, capacity: usize, config: HealthConfig) -> Self {
        let (tx, rx) = bounded(capacity);
        let shared = Arc::new(Shared {
            name: name.to_string(),
            tx,
            rx,
            capacity,
            handlers: Mutex::new(HashMap::new()),
            next_handler_id: AtomicU64::new(1),
            stop_flag: AtomicBool::new(false),
            worker_alive: AtomicBool::new(false),
            events_accepted: AtomicU64::new(0),
            events_processed: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            consecutive_empty: AtomicU64::new(0),
            timing: Mutex::new(Timing {
                total_ms: 0.0,
                samples: 0,
                last_processed: Instant::now(),
            }),
            health: Mutex::new(HealthState::new(&config)),
            config: Mutex::new(config),
        });
        Self {
            shared,
            worker: None,
            monitor: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Registers a typed handler. Handlers for the same type run in
    /// registration order; the returned token unregisters this one.
    pub fn register_handler<T, F>(&self, handler: F) -> HandlerId
    where
        T: Any + Send,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.shared.next_handler_id.fetch_add(1, Ordering::SeqCst);
        let entry = Arc::new(HandlerEntry {
            id,
            type_name: std::any::type_name::<T>(),
            run: Box::new(move |any| {
                if let Some(item) = any.downcast_ref::<T>() {
                    handler(item);
                }
            }),
        });
        self.shared
            .handlers
            .lock()
            .unwrap()
            .entry(TypeId::of::<T>())
            .or_default()
            .push(entry);
        HandlerId(id)
    }

    /// Removes a previously registered handler. Returns whether it was found.
    pub fn unregister_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.shared.handlers.lock().unwrap();
        for list in handlers.values_mut() {
            if let Some(pos) = list.iter().position(|e| e.id == id.0) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Enqueues an item with backpressure. Waits up to the configured submit
    /// timeout when the queue is full; on timeout the processor is forced
    /// CRITICAL, the item counts as dropped once, and the call falls back to
    /// a blocking enqueue so the item is never lost. Returns `false` only
    /// when the processor is already CRITICAL with the queue at or above the
    /// critical utilization threshold.
    pub fn submit<T: Any + Send>(&self, item: T) -> bool {
        self.submit_boxed(Box::new(item))
    }

    pub fn submit_boxed(&self, item: Box<dyn Any + Send>) -> bool {
        let (timeout, critical_utilization) = {
            let config = self.shared.config.lock().unwrap();
            (config.submit_timeout, config.critical_queue_utilization)
        };
        {
            let health = self.shared.health.lock().unwrap();
            if health.status == HealthStatus::Critical
                && self.shared.utilization() >= critical_utilization
            {
                drop(health);
                self.shared.events_dropped.fetch_add(1, Ordering::SeqCst);
                debug!("[{}] submit rejected while critical", self.shared.name);
                return false;
            }
        }
        // Counted before the enqueue so the item is never invisible to
        // wait_until_empty while it sits in the channel.
        self.shared.events_accepted.fetch_add(1, Ordering::SeqCst);
        match self.shared.tx.send_timeout(item, timeout) {
            Ok(()) => true,
            Err(crossbeam_channel::SendTimeoutError::Timeout(item)) => {
                self.shared.events_dropped.fetch_add(1, Ordering::SeqCst);
                self.shared.force_critical("submit timed out on full queue");
                warn!(
                    "[{}] queue full for {:?}, falling back to blocking enqueue",
                    self.shared.name, timeout
                );
                // Last resort: block until the worker frees a slot.
                if self.shared.tx.send(item).is_ok() {
                    true
                } else {
                    self.shared.events_accepted.fetch_sub(1, Ordering::SeqCst);
                    false
                }
            }
            Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => {
                self.shared.events_accepted.fetch_sub(1, Ordering::SeqCst);
                false
            }
        }
    }

    /// Non-blocking enqueue. A full queue counts the item as dropped.
    pub fn submit_nowait<T: Any + Send>(&self, item: T) -> bool {
        self.shared.events_accepted.fetch_add(1, Ordering::SeqCst);
        match self.shared.tx.try_send(Box::new(item)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.shared.events_accepted.fetch_sub(1, Ordering::SeqCst);
                self.shared.events_dropped.fetch_add(1, Ordering::SeqCst);
                false
            }
        }
    }

    /// Spawns the worker and monitor threads and marks the processor HEALTHY.
    pub fn start(&mut self) -> Result<(), ProcessorError> {
        if self.worker.is_some() {
            return Err(ProcessorError::AlreadyStarted(self.shared.name.clone()));
        }
        self.shared.stop_flag.store(false, Ordering::SeqCst);
        {
            let mut health = self.shared.health.lock().unwrap();
            health.status = HealthStatus::Healthy;
            health.last_transition = Instant::now();
            health.recovery_attempts = 0;
        }
        let worker_shared = Arc::clone(&self.shared);
        self.worker = Some(
            thread::Builder::new()
                .name(format!("{}-worker", self.shared.name))
                .spawn(move || worker_shared.worker_loop())
                .map_err(|e| ProcessorError::Spawn(e.to_string()))?,
        );
        let monitor_shared = Arc::clone(&self.shared);
        self.monitor = Some(
            thread::Builder::new()
                .name(format!("{}-monitor", self.shared.name))
                .spawn(move || monitor_shared.monitor_loop())
                .map_err(|e| ProcessorError::Spawn(e.to_string()))?,
        );
        info!("[{}] processor started", self.shared.name);
        Ok(())
    }

    /// Signals both threads to stop, joins them, and marks the processor
    /// STOPPED. Items still queued remain in the queue.
    pub fn stop(&mut self) {
        self.shared.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            join_with_timeout(&format!("{}-worker", self.shared.name), handle, JOIN_TIMEOUT);
        }
        if let Some(handle) = self.monitor.take() {
            join_with_timeout(
                &format!("{}-monitor", self.shared.name),
                handle,
                JOIN_TIMEOUT,
            );
        }
        let mut health = self.shared.health.lock().unwrap();
        if health.status != HealthStatus::Stopped {
            health.status = HealthStatus::Stopped;
            health.last_transition = Instant::now();
        }
        info!("[{}] processor stopped", self.shared.name);
    }

    /// Blocks until every accepted item has been dispatched or cleared, or
    /// the timeout elapses. Returns whether the queue drained.
    pub fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            // An item counts against `events_accepted` from the moment a
            // submit commits to it until the worker finishes dispatching it,
            // so reading accepted before processed never misses an item that
            // was popped but not yet handled.
            let accepted = self.shared.events_accepted.load(Ordering::SeqCst);
            let processed = self.shared.events_processed.load(Ordering::SeqCst);
            if processed >= accepted {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(DRAIN_POLL);
        }
    }

    /// Discards every queued item without dispatching it. Discarded items
    /// count as dropped. Returns how many were removed.
    pub fn clear_queue(&self) -> usize {
        let mut cleared = 0;
        while self.shared.rx.try_recv().is_ok() {
            cleared += 1;
        }
        if cleared > 0 {
            self.shared
                .events_accepted
                .fetch_sub(cleared as u64, Ordering::SeqCst);
            self.shared
                .events_dropped
                .fetch_add(cleared as u64, Ordering::SeqCst);
            info!("[{}] cleared {} queued items", self.shared.name, cleared);
        }
        cleared
    }

    pub fn get_health_status(&self) -> HealthStatus {
        self.shared.health.lock().unwrap().status
    }

    pub fn get_health_metrics(&self) -> HealthMetrics {
        self.shared.metrics()
    }

    /// Replaces the health configuration. The new thresholds become the
    /// baseline that dynamic adjustment relaxes from and resets to.
    pub fn update_health_config(&self, config: HealthConfig) {
        let mut current = self.shared.config.lock().unwrap();
        *current = config;
        self.shared.health.lock().unwrap().rebase_defaults(&current);
    }

    pub fn queue_size(&self) -> usize {
        self.shared.tx.len()
    }

    pub fn queue_utilization(&self) -> f64 {
        self.shared.utilization()
    }
}

impl Drop for QueueProcessor {
    fn drop(&mut self) {
        if self.worker.is_some() || self.monitor.is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct Tick(usize);

    #[test]
    fn handlers_receive_items_in_order() {
        let mut processor = QueueProcessor::new("test-order", 16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        processor.register_handler::<Tick, _>(move |t| {
            sink.lock().unwrap().push(t.0);
        });
        processor.start().unwrap();
        for i in 0..8 {
            assert!(processor.submit(Tick(i)));
        }
        assert!(processor.wait_until_empty(Duration::from_secs(5)));
        processor.stop();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn unregistered_handler_stops_receiving() {
        let mut processor = QueueProcessor::new("test-unregister", 16);
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        let id = processor.register_handler::<Tick, _>(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });
        processor.start().unwrap();
        processor.submit(Tick(1));
        assert!(processor.wait_until_empty(Duration::from_secs(5)));
        assert!(processor.unregister_handler(id));
        assert!(!processor.unregister_handler(id));
        processor.submit(Tick(2));
        assert!(processor.wait_until_empty(Duration::from_secs(5)));
        processor.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_does_not_kill_worker() {
        let mut processor = QueueProcessor::new("test-panic", 16);
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        processor.register_handler::<Tick, _>(|t| {
            if t.0 == 1 {
                panic!("boom");
            }
        });
        processor.register_handler::<Tick, _>(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });
        processor.start().unwrap();
        processor.submit(Tick(1));
        processor.submit(Tick(2));
        assert!(processor.wait_until_empty(Duration::from_secs(5)));
        processor.stop();
        // Both items reached the second handler despite the first panicking.
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(processor.get_health_metrics().events_processed, 2);
    }

    #[test]
    fn submit_nowait_counts_drops_when_full() {
        let processor = QueueProcessor::new("test-nowait", 2);
        assert!(processor.submit_nowait(Tick(1)));
        assert!(processor.submit_nowait(Tick(2)));
        assert!(!processor.submit_nowait(Tick(3)));
        let metrics = processor.get_health_metrics();
        assert_eq!(metrics.events_dropped, 1);
        assert_eq!(metrics.queue_size, 2);
    }

    #[test]
    fn clear_queue_discards_and_counts() {
        let processor = QueueProcessor::new("test-clear", 8);
        for i in 0..5 {
            processor.submit_nowait(Tick(i));
        }
        assert_eq!(processor.clear_queue(), 5);
        assert_eq!(processor.queue_size(), 0);
        assert_eq!(processor.queue_utilization(), 0.0);
        assert_eq!(processor.get_health_metrics().events_dropped, 5);
    }

    #[test]
    fn double_start_is_rejected() {
        let mut processor = QueueProcessor::new("test-double-start", 4);
        processor.start().unwrap();
        assert!(matches!(
            processor.start(),
            Err(ProcessorError::AlreadyStarted(_))
        ));
        processor.stop();
        assert_eq!(processor.get_health_status(), HealthStatus::Stopped);
    }
}
