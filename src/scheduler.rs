/// Fixed-interval task scheduler
///
/// Runs an async task immediately and then once per interval, with at most
/// one execution in flight. A tick that finds the previous execution still
/// running is dropped; three dropped ticks in a row stop the scheduler. The
/// next tick is armed from the moment an execution finishes, so a slow cycle
/// never causes catch-up runs. An execution left running by `stop` or
/// `set_interval` still blocks the restarted timer until it finishes.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{MeterError, MeterResult};
use crate::logging::CallbackLogger;

const COMPONENT: &str = "scheduler";

/// Consecutive skipped ticks that stop the scheduler
pub const MAX_SKIPPED_TICKS: u32 = 3;

/// Consecutive failures before failures are reported
pub const FAILURE_REPORT_THRESHOLD: u32 = 3;

/// The scheduled unit of work
pub type ScheduledTask<T> = Arc<dyn Fn() -> BoxFuture<'static, MeterResult<T>> + Send + Sync>;

/// Receiver of scheduler notifications
pub type SchedulerCallback<T> = Arc<dyn Fn(SchedulerEvent<T>) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent<T> {
    /// An execution returned a value
    CycleCompleted(T),
    /// An execution failed and the failure streak is at or past the threshold
    CycleFailed { error: MeterError, consecutive_failures: u32 },
    /// The scheduler stopped itself after repeated overlapping ticks
    StuckTask { skipped_ticks: u32 },
}

struct Run {
    cancel: CancellationToken,
    driver: JoinHandle<()>,
}

/// Clears the shared busy flag when an execution ends, even if it panics
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Scheduler<T: Send + 'static> {
    task: ScheduledTask<T>,
    callback: SchedulerCallback<T>,
    interval: Mutex<Duration>,
    run: Mutex<Option<Run>>,
    // Outlives any single driver so a restarted timer sees a detached execution
    busy: Arc<AtomicBool>,
    logger: CallbackLogger,
}

impl<T: Send + 'static> Scheduler<T> {
    /// Create a stopped scheduler; fails on a zero interval
    pub fn new(
        interval: Duration,
        task: ScheduledTask<T>,
        callback: SchedulerCallback<T>,
        logger: CallbackLogger,
    ) -> MeterResult<Self> {
        validate_interval(interval)?;
        Ok(Self {
            task,
            callback,
            interval: Mutex::new(interval),
            run: Mutex::new(None),
            busy: Arc::new(AtomicBool::new(false)),
            logger,
        })
    }

    pub fn interval(&self) -> Duration {
        *lock(&self.interval)
    }

    /// Whether the driver is alive and not cancelled
    pub fn is_running(&self) -> bool {
        lock(&self.run)
            .as_ref()
            .map_or(false, |run| !run.cancel.is_cancelled() && !run.driver.is_finished())
    }

    /// Whether an execution is in flight, including one left behind by a
    /// stopped or restarted timer
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Run the task now and then every interval
    ///
    /// Calling it on a running scheduler only logs a warning.
    pub fn start(&self) {
        let mut run = lock(&self.run);
        if let Some(current) = run.as_ref() {
            if !current.cancel.is_cancelled() && !current.driver.is_finished() {
                self.logger.warn(COMPONENT, "Scheduler already running, start ignored");
                return;
            }
        }
        *run = Some(self.spawn_driver(self.interval()));
    }

    /// Cancel the timer without waiting for the driver to exit
    ///
    /// Safe to call from inside a callback. An execution already in flight is
    /// left to finish on its own; its result is discarded.
    pub fn halt(&self) {
        if let Some(run) = lock(&self.run).as_ref() {
            run.cancel.cancel();
        }
    }

    /// Stop scheduling and wait until no further execution can start
    ///
    /// Stopping a stopped scheduler does nothing. Must not be awaited from a
    /// scheduler callback; use [`halt`](Self::halt) there.
    pub async fn stop(&self) {
        let run = lock(&self.run).take();
        if let Some(run) = run {
            run.cancel.cancel();
            let _ = run.driver.await;
            self.logger.info(COMPONENT, "Scheduler stopped");
        }
    }

    /// Change the interval, restarting the timer if running
    pub fn set_interval(&self, interval: Duration) -> MeterResult<()> {
        validate_interval(interval)?;

        let mut run = lock(&self.run);
        *lock(&self.interval) = interval;
        if let Some(previous) = run.take() {
            let was_running = !previous.cancel.is_cancelled() && !previous.driver.is_finished();
            previous.cancel.cancel();
            if was_running {
                *run = Some(self.spawn_driver(interval));
            }
        }
        self.logger.info(COMPONENT, &format!("Interval set to {:?}", interval));
        Ok(())
    }

    fn spawn_driver(&self, period: Duration) -> Run {
        let cancel = CancellationToken::new();
        let driver = tokio::spawn(drive(
            self.task.clone(),
            self.callback.clone(),
            self.busy.clone(),
            period,
            cancel.clone(),
            self.logger.clone(),
        ));
        self.logger.info(COMPONENT, &format!("Scheduler started with interval {:?}", period));
        Run { cancel, driver }
    }
}

impl<T: Send + 'static> Drop for Scheduler<T> {
    fn drop(&mut self) {
        if let Some(run) = lock(&self.run).take() {
            run.cancel.cancel();
        }
    }
}

async fn drive<T: Send + 'static>(
    task: ScheduledTask<T>,
    callback: SchedulerCallback<T>,
    busy: Arc<AtomicBool>,
    period: Duration,
    cancel: CancellationToken,
    logger: CallbackLogger,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut in_flight: Option<JoinHandle<MeterResult<T>>> = None;
    let mut skipped_ticks = 0u32;
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            joined = join_in_flight(&mut in_flight) => {
                in_flight = None;
                skipped_ticks = 0;
                if cancel.is_cancelled() {
                    break;
                }

                let outcome = joined.unwrap_or_else(|error| {
                    Err(MeterError::internal(format!("Scheduled task aborted: {}", error)))
                });
                match outcome {
                    Ok(value) => {
                        consecutive_failures = 0;
                        callback(SchedulerEvent::CycleCompleted(value));
                    }
                    Err(error) => {
                        consecutive_failures += 1;
                        if consecutive_failures >= FAILURE_REPORT_THRESHOLD {
                            callback(SchedulerEvent::CycleFailed { error, consecutive_failures });
                        } else {
                            logger.debug(COMPONENT, &format!("Cycle failed ({}): {}", consecutive_failures, error));
                        }
                    }
                }
                ticker.reset();
            }

            _ = ticker.tick() => {
                if in_flight.is_some() || busy.load(Ordering::SeqCst) {
                    skipped_ticks += 1;
                    logger.warn(COMPONENT, &format!("Previous cycle still running, tick skipped ({}/{})", skipped_ticks, MAX_SKIPPED_TICKS));
                    if skipped_ticks >= MAX_SKIPPED_TICKS {
                        logger.error(COMPONENT, "Task appears stuck, scheduler stopping");
                        callback(SchedulerEvent::StuckTask { skipped_ticks });
                        break;
                    }
                    continue;
                }
                if cancel.is_cancelled() {
                    break;
                }
                if busy.swap(true, Ordering::SeqCst) {
                    continue;
                }
                skipped_ticks = 0;
                let guard = BusyGuard(busy.clone());
                let execution = task();
                in_flight = Some(tokio::spawn(async move {
                    let _guard = guard;
                    execution.await
                }));
            }
        }
    }
}

async fn join_in_flight<R>(in_flight: &mut Option<JoinHandle<R>>) -> Result<R, JoinError> {
    match in_flight {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

fn validate_interval(interval: Duration) -> MeterResult<()> {
    if interval.is_zero() {
        return Err(MeterError::invalid_interval(0));
    }
    Ok(())
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
