//! Drift-free periodic scheduler on a dedicated OS thread.
//!
//! The loop computes every sleep target from the absolute schedule
//! (`origin + (tick − start)`), never from the previous tick's wall-clock
//! return, so callback latency does not accumulate drift. Cancellation is
//! cooperative: [`Timer::stop`] raises a flag checked once per iteration
//! and joins the thread, guaranteeing no tick callback is in flight once
//! it returns.
//!
//! A panicking tick/stop callback kills the timer thread; the panic is
//! re-raised at the next join instead of being swallowed. A silently dead
//! timer while a sequence is running would mean safety monitoring stopped
//! without anyone noticing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

/// Timer usage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimerError {
    /// The timer already has an active run.
    #[error("timer {0:?} already has an active run")]
    AlreadyRunning(String),

    /// The requested tick interval is not positive.
    #[error("tick interval must be positive, got {0}")]
    InvalidInterval(i64),

    /// The OS refused to spawn the timer thread.
    #[error("failed to spawn timer thread: {0}")]
    Spawn(String),
}

struct Worker {
    handle: JoinHandle<()>,
    thread_id: ThreadId,
}

/// Periodic scheduler invoking a tick callback at a fixed microsecond
/// cadence on its own named thread, then a stop callback exactly once.
///
/// One instance supports one active run at a time; after a run finishes
/// (or is stopped) the instance can be started again.
pub struct Timer {
    name: String,
    cancel: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    last_tick_us: Arc<AtomicI64>,
    worker: Mutex<Option<Worker>>,
}

impl Timer {
    /// Create an idle timer. `name` becomes the worker thread name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cancel: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            last_tick_us: Arc::new(AtomicI64::new(i64::MIN)),
            worker: Mutex::new(None),
        }
    }

    /// Run `on_tick(tick_us)` once per interval from `start_us` through
    /// `end_us` inclusive, then `on_stop()` exactly once.
    ///
    /// Returns immediately; callbacks run on the timer thread. `start_us`
    /// may be negative (countdown sequences).
    pub fn start<F, G>(
        &self,
        start_us: i64,
        end_us: i64,
        interval_us: i64,
        on_tick: F,
        on_stop: G,
    ) -> Result<(), TimerError>
    where
        F: FnMut(i64) + Send + 'static,
        G: FnOnce() + Send + 'static,
    {
        self.spawn_run(start_us, Some(end_us), interval_us, on_tick, on_stop)
    }

    /// Unbounded variant of [`start`](Timer::start); runs until
    /// [`stop`](Timer::stop).
    pub fn start_continuous<F, G>(
        &self,
        start_us: i64,
        interval_us: i64,
        on_tick: F,
        on_stop: G,
    ) -> Result<(), TimerError>
    where
        F: FnMut(i64) + Send + 'static,
        G: FnOnce() + Send + 'static,
    {
        self.spawn_run(start_us, None, interval_us, on_tick, on_stop)
    }

    fn spawn_run<F, G>(
        &self,
        start_us: i64,
        end_us: Option<i64>,
        interval_us: i64,
        mut on_tick: F,
        on_stop: G,
    ) -> Result<(), TimerError>
    where
        F: FnMut(i64) + Send + 'static,
        G: FnOnce() + Send + 'static,
    {
        if interval_us <= 0 {
            return Err(TimerError::InvalidInterval(interval_us));
        }

        let mut guard = self.worker.lock();
        if let Some(worker) = guard.take() {
            if self.running.load(Ordering::Acquire) && !self.cancel.load(Ordering::Acquire) {
                *guard = Some(worker);
                return Err(TimerError::AlreadyRunning(self.name.clone()));
            }
            // Previous run finished or is winding down after a stop
            // request; reap it before reusing the instance.
            if let Err(panic) = worker.handle.join() {
                std::panic::resume_unwind(panic);
            }
        }

        self.cancel.store(false, Ordering::Release);
        self.running.store(true, Ordering::Release);

        let cancel = Arc::clone(&self.cancel);
        let running = Arc::clone(&self.running);
        let last_tick_us = Arc::clone(&self.last_tick_us);

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let origin = Instant::now();
                let mut tick_us = start_us;
                loop {
                    if cancel.load(Ordering::Acquire) {
                        break;
                    }
                    on_tick(tick_us);
                    last_tick_us.store(tick_us, Ordering::Release);
                    if end_us.is_some_and(|end| tick_us >= end) {
                        break;
                    }
                    tick_us += interval_us;
                    // Absolute schedule: sleep to origin + (tick - start),
                    // so callback latency never shifts later ticks.
                    let target = origin + Duration::from_micros((tick_us - start_us) as u64);
                    let now = Instant::now();
                    if target > now {
                        thread::sleep(target - now);
                    }
                }
                debug!("timer loop exiting");
                on_stop();
                running.store(false, Ordering::Release);
            })
            .map_err(|e| TimerError::Spawn(e.to_string()))?;

        let thread_id = handle.thread().id();
        *guard = Some(Worker { handle, thread_id });
        Ok(())
    }

    /// Request termination and wait for it.
    ///
    /// Idempotent. When called from any thread other than the timer
    /// thread, this joins the worker and only returns once the stop
    /// callback has completed — no tick is in flight afterwards. When
    /// called from inside a tick callback (self-stop on abort), it only
    /// raises the cancellation flag: the loop exits once the callback
    /// returns and runs the stop callback on the same thread; joining
    /// here would deadlock.
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::Release);

        let worker = {
            let mut guard = self.worker.lock();
            match guard.take() {
                None => None,
                Some(worker) if worker.thread_id == thread::current().id() => {
                    *guard = Some(worker);
                    return;
                }
                Some(worker) => Some(worker),
            }
        };

        match worker {
            Some(worker) => {
                if let Err(panic) = worker.handle.join() {
                    std::panic::resume_unwind(panic);
                }
            }
            None => {
                // Another stop() owns the join; wait until the stop
                // callback has finished so the no-tick-in-flight
                // guarantee still holds for this caller.
                while self.running.load(Ordering::Acquire) {
                    thread::yield_now();
                }
            }
        }
    }

    /// Whether a run is currently active.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Most recent tick time [µs], `i64::MIN` before the first tick.
    /// Usable as a liveness probe on the timer thread.
    #[inline]
    pub fn last_tick_us(&self) -> i64 {
        self.last_tick_us.load(Ordering::Acquire)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(worker) = self.worker.get_mut().take() {
            if worker.thread_id != thread::current().id() {
                // Swallow callback panics here; a second panic while
                // unwinding would abort the process.
                let _ = worker.handle.join();
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn wait_for_completion(timer: &Timer) {
        while timer.is_running() {
            thread::sleep(Duration::from_millis(1));
        }
        // Reap the finished worker.
        timer.stop();
    }

    fn recorded_run(start_us: i64, end_us: i64, interval_us: i64) -> Vec<i64> {
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&ticks);
        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_flag = Arc::clone(&stopped);

        let timer = Timer::new("test-timer");
        timer
            .start(
                start_us,
                end_us,
                interval_us,
                move |t| sink.lock().push(t),
                move || stopped_flag.store(true, Ordering::SeqCst),
            )
            .unwrap();
        wait_for_completion(&timer);

        assert!(stopped.load(Ordering::SeqCst));
        let ticks = ticks.lock().clone();
        ticks
    }

    #[test]
    fn bounded_run_covers_start_through_end_inclusive() {
        let ticks = recorded_run(0, 10_000, 1_000);
        assert_eq!(ticks.len(), 11);
        assert_eq!(ticks.first(), Some(&0));
        assert_eq!(ticks.last(), Some(&10_000));
        assert!(ticks.windows(2).all(|w| w[1] - w[0] == 1_000));
    }

    #[test]
    fn negative_start_counts_down_through_zero() {
        let ticks = recorded_run(-5_000, 0, 1_000);
        assert_eq!(ticks, vec![-5_000, -4_000, -3_000, -2_000, -1_000, 0]);
    }

    #[test]
    fn continuous_run_stops_on_request() {
        let count = Arc::new(AtomicUsize::new(0));
        let tick_count = Arc::clone(&count);

        let timer = Timer::new("test-continuous");
        timer
            .start_continuous(0, 1_000, move |_| {
                tick_count.fetch_add(1, Ordering::SeqCst);
            }, || {})
            .unwrap();

        thread::sleep(Duration::from_millis(20));
        timer.stop();

        let at_stop = count.load(Ordering::SeqCst);
        assert!(at_stop > 0);

        // No tick in flight after stop() returns.
        thread::sleep(Duration::from_millis(10));
        assert_eq!(count.load(Ordering::SeqCst), at_stop);
    }

    #[test]
    fn stop_is_idempotent_and_safe_before_start() {
        let timer = Timer::new("test-idle");
        timer.stop();
        timer.stop();
        assert!(!timer.is_running());
    }

    #[test]
    fn instance_is_reusable_after_completion() {
        let timer = Timer::new("test-reuse");
        timer.start(0, 1_000, 1_000, |_| {}, || {}).unwrap();
        wait_for_completion(&timer);
        assert!(!timer.is_running());
        timer.start(0, 1_000, 1_000, |_| {}, || {}).unwrap();
        wait_for_completion(&timer);
    }

    #[test]
    fn start_while_running_is_rejected() {
        let timer = Timer::new("test-busy");
        timer.start_continuous(0, 1_000, |_| {}, || {}).unwrap();
        assert_eq!(
            timer.start_continuous(0, 1_000, |_| {}, || {}),
            Err(TimerError::AlreadyRunning("test-busy".into()))
        );
        timer.stop();
    }

    #[test]
    fn non_positive_interval_is_rejected() {
        let timer = Timer::new("test-interval");
        assert_eq!(
            timer.start(0, 1_000, 0, |_| {}, || {}),
            Err(TimerError::InvalidInterval(0))
        );
        assert_eq!(
            timer.start(0, 1_000, -5, |_| {}, || {}),
            Err(TimerError::InvalidInterval(-5))
        );
    }

    #[test]
    fn self_stop_from_tick_callback() {
        let timer = Arc::new(Timer::new("test-self-stop"));
        let count = Arc::new(AtomicUsize::new(0));

        let tick_timer = Arc::clone(&timer);
        let tick_count = Arc::clone(&count);
        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_flag = Arc::clone(&stopped);

        timer
            .start_continuous(0, 500, move |_| {
                if tick_count.fetch_add(1, Ordering::SeqCst) == 4 {
                    tick_timer.stop();
                }
            }, move || stopped_flag.store(true, Ordering::SeqCst))
            .unwrap();

        // External stop joins the winding-down thread.
        thread::sleep(Duration::from_millis(20));
        timer.stop();

        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn last_tick_advances() {
        let timer = Timer::new("test-liveness");
        assert_eq!(timer.last_tick_us(), i64::MIN);
        timer.start(0, 5_000, 1_000, |_| {}, || {}).unwrap();
        wait_for_completion(&timer);
        assert_eq!(timer.last_tick_us(), 5_000);
    }
}
