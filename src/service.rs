//! # Polling Service
//!
//! Composition root for one meter. A [`PollingService`] owns exactly one
//! connection manager, one scheduler and one disconnection countdown, and
//! reports everything it observes through a single typed event callback.
//!
//! ```rust,no_run
//! use meter_poller::{PollingConfig, PollingService, PollEvent};
//!
//! #[tokio::main]
//! async fn main() -> meter_poller::MeterResult<()> {
//!     let config = PollingConfig::new("192.168.1.40");
//!     let (service, mut events) = PollingService::with_channel(config)?;
//!     service.start()?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let PollEvent::CycleCompleted(readings) = event {
//!             println!("{} readings", readings.len());
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;

use crate::config::PollingConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::countdown::{CountdownEvent, CountdownState, DisconnectionCountdown};
use crate::diagnostics::{AlertSeverity, Diagnostics, DiagnosticsRecorder};
use crate::error::{MeterError, MeterResult};
use crate::logging::CallbackLogger;
use crate::reader::ReadCycleExecutor;
use crate::register::{RegisterTable, SensorReading};
use crate::scheduler::{ScheduledTask, Scheduler, SchedulerCallback, SchedulerEvent};
use crate::transport::{RegisterTransport, TcpTransport, TransportStats};

const COMPONENT: &str = "service";

/// Everything a [`PollingService`] reports to its host
#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    /// A cycle produced at least one reading
    CycleCompleted(Vec<SensorReading>),
    /// Every cycle while a disconnection alarm is active
    DisconnectionWarning { seconds_remaining: i64 },
    /// Once per alarm episode
    FirstDisconnectionWarning { seconds_remaining: i64 },
    /// Once when an alarm episode that produced a warning ends
    StopWarning,
    /// Third and later consecutive failed cycles
    CycleFailed { error: MeterError, consecutive_failures: u32 },
    /// Failure streak reached an alert threshold
    FailureAlert { consecutive_failures: u32, severity: AlertSeverity },
    /// Scheduler stopped itself after repeated overlapping ticks
    StuckTask { skipped_ticks: u32 },
    /// Reconnect budget spent; the instance will not poll again
    ReconnectExhausted { attempts: u32 },
}

/// Receiver of [`PollEvent`]s
pub type EventCallback = Arc<dyn Fn(PollEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
struct AlarmRegisters {
    event_timestamp: Option<i64>,
    remaining_seconds: Option<i64>,
}

/// State shared between the service and its scheduled task
struct Engine<T: RegisterTransport + 'static> {
    reader: ReadCycleExecutor<T>,
    table: RegisterTable,
    event_timestamp_register: String,
    remaining_seconds_register: String,
    alarm: Mutex<AlarmRegisters>,
    countdown: Mutex<DisconnectionCountdown>,
    events: EventCallback,
}

impl<T: RegisterTransport + 'static> Engine<T> {
    async fn read(&self) -> MeterResult<Vec<SensorReading>> {
        self.reader.try_run_cycle(&self.table).await
    }

    /// Publish a cycle's readings and advance the countdown
    fn complete(&self, readings: Vec<SensorReading>) {
        let alarm = {
            let mut alarm = lock(&self.alarm);
            for reading in &readings {
                if reading.id == self.event_timestamp_register {
                    alarm.event_timestamp = Some(reading.value);
                } else if reading.id == self.remaining_seconds_register {
                    alarm.remaining_seconds = Some(reading.value);
                }
            }
            *alarm
        };

        (self.events)(PollEvent::CycleCompleted(readings));

        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        let updates = lock(&self.countdown).update(alarm.event_timestamp, alarm.remaining_seconds, now);
        for update in updates {
            (self.events)(match update {
                CountdownEvent::FirstWarning { seconds_remaining } => {
                    PollEvent::FirstDisconnectionWarning { seconds_remaining }
                }
                CountdownEvent::Warning { seconds_remaining } => PollEvent::DisconnectionWarning { seconds_remaining },
                CountdownEvent::Stopped => PollEvent::StopWarning,
            });
        }
    }
}

/// Resilient poller for one meter
pub struct PollingService<T: RegisterTransport + 'static = TcpTransport> {
    config: PollingConfig,
    connection: ConnectionManager<T>,
    engine: Arc<Engine<T>>,
    scheduler: Arc<Scheduler<Vec<SensorReading>>>,
    diagnostics: DiagnosticsRecorder,
    logger: CallbackLogger,
    stopped: AtomicBool,
}

impl PollingService<TcpTransport> {
    /// Poll a Modbus TCP meter, reporting to `events`
    pub fn new(config: PollingConfig, events: EventCallback) -> MeterResult<Self> {
        Self::with_logger(config, events, CallbackLogger::disabled())
    }

    /// Poll a Modbus TCP meter with a structured log sink
    pub fn with_logger(config: PollingConfig, events: EventCallback, logger: CallbackLogger) -> MeterResult<Self> {
        config.validate()?;
        let transport = TcpTransport::with_logger(config.transport_config(), logger.clone());
        Self::with_transport(config, transport, events, logger)
    }

    /// Poll a Modbus TCP meter, delivering events on a channel
    pub fn with_channel(config: PollingConfig) -> MeterResult<(Self, mpsc::UnboundedReceiver<PollEvent>)> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let events: EventCallback = Arc::new(move |event| {
            let _ = sender.send(event);
        });
        Ok((Self::new(config, events)?, receiver))
    }
}

impl<T: RegisterTransport + 'static> PollingService<T> {
    /// Wire a service around any transport
    ///
    /// Fails synchronously on an invalid configuration.
    pub fn with_transport(
        config: PollingConfig,
        transport: T,
        events: EventCallback,
        logger: CallbackLogger,
    ) -> MeterResult<Self> {
        config.validate()?;
        let table = config.register_table();
        if table.is_empty() {
            return Err(MeterError::configuration("Register table is empty"));
        }

        let diagnostics = DiagnosticsRecorder::new();
        let connection =
            ConnectionManager::new(transport, config.reconnect_policy(), diagnostics.clone(), logger.clone());

        let alert_events = events.clone();
        let reader = ReadCycleExecutor::new(
            connection.clone(),
            diagnostics.clone(),
            logger.clone(),
            config.register_read_timeout(),
        )
        .with_alert_callback(Arc::new(move |consecutive_failures, severity| {
            alert_events(PollEvent::FailureAlert { consecutive_failures, severity });
        }));

        let engine = Arc::new(Engine {
            reader,
            table,
            event_timestamp_register: config.event_timestamp_register.clone(),
            remaining_seconds_register: config.remaining_seconds_register.clone(),
            alarm: Mutex::new(AlarmRegisters::default()),
            countdown: Mutex::new(DisconnectionCountdown::new()),
            events: events.clone(),
        });

        let task_engine = engine.clone();
        let task: ScheduledTask<Vec<SensorReading>> = Arc::new(move || {
            let engine = task_engine.clone();
            async move { engine.read().await }.boxed()
        });

        let callback_engine = engine.clone();
        let callback_events = events.clone();
        let callback: SchedulerCallback<Vec<SensorReading>> = Arc::new(move |event| match event {
            SchedulerEvent::CycleCompleted(readings) => callback_engine.complete(readings),
            SchedulerEvent::CycleFailed { error, consecutive_failures } => {
                callback_events(PollEvent::CycleFailed { error, consecutive_failures })
            }
            SchedulerEvent::StuckTask { skipped_ticks } => callback_events(PollEvent::StuckTask { skipped_ticks }),
        });

        let scheduler = Arc::new(Scheduler::new(config.poll_interval(), task, callback, logger.clone())?);

        let halt: Weak<Scheduler<Vec<SensorReading>>> = Arc::downgrade(&scheduler);
        let exhausted_logger = logger.clone();
        connection.on_exhausted(Arc::new(move |attempts| {
            if let Some(scheduler) = halt.upgrade() {
                scheduler.halt();
            }
            exhausted_logger.error(COMPONENT, "Meter unreachable, polling halted until the service is recreated");
            events(PollEvent::ReconnectExhausted { attempts });
        }));

        logger.info(
            COMPONENT,
            &format!(
                "Polling {} every {:?} ({} registers)",
                config.target(),
                config.poll_interval(),
                engine.table.len()
            ),
        );

        Ok(Self {
            config,
            connection,
            engine,
            scheduler,
            diagnostics,
            logger,
            stopped: AtomicBool::new(false),
        })
    }

    /// Start polling: one cycle now, then one per interval
    pub fn start(&self) -> MeterResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(MeterError::Stopped);
        }
        self.scheduler.start();
        Ok(())
    }

    /// Stop polling and release the connection
    ///
    /// After this returns no new cycle starts. A register read already on
    /// the wire finishes before the transport is closed. Calling it again is
    /// a no-op.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.scheduler.stop().await;
        self.connection.shutdown().await;
        lock(&self.engine.countdown).reset();
        self.logger.info(COMPONENT, &format!("Stopped polling {}", self.config.target()));
    }

    /// Change the polling interval; zero is rejected
    pub fn set_interval(&self, interval: Duration) -> MeterResult<()> {
        self.scheduler.set_interval(interval)
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst) && self.scheduler.is_running()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Snapshot of the engine counters; no side effects
    pub fn get_diagnostics(&self) -> Diagnostics {
        self.diagnostics.snapshot()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn countdown_state(&self) -> CountdownState {
        lock(&self.engine.countdown).state()
    }

    /// Transport counters; `None` while a register read holds the transport
    pub fn transport_stats(&self) -> Option<TransportStats> {
        self.connection.transport_stats()
    }

    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    pub fn register_table(&self) -> &RegisterTable {
        &self.engine.table
    }

    pub fn interval(&self) -> Duration {
        self.scheduler.interval()
    }

    /// Run one cycle outside the schedule
    ///
    /// Readings and countdown events are published exactly as for a
    /// scheduled cycle. Overlaps with a scheduled cycle are rejected.
    pub async fn run_once(&self) -> MeterResult<Vec<SensorReading>> {
        if self.is_stopped() {
            return Err(MeterError::Stopped);
        }
        let readings = self.engine.read().await?;
        self.engine.complete(readings.clone());
        Ok(readings)
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::{RegisterDescriptor, WordType};
    use crate::transport::{FaultHandler, TransportStats};
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// In-memory meter
    #[derive(Clone, Default)]
    struct MemoryTransport {
        words: Arc<Mutex<HashMap<u16, u16>>>,
        reachable: Arc<AtomicBool>,
        connected: bool,
    }

    impl MemoryTransport {
        fn set_u32(&self, address: u16, value: u32) {
            let mut words = self.words.lock().unwrap();
            words.insert(address, (value >> 16) as u16);
            words.insert(address + 1, value as u16);
        }
    }

    #[async_trait]
    impl RegisterTransport for MemoryTransport {
        async fn connect(&mut self) -> MeterResult<()> {
            if self.reachable.load(Ordering::SeqCst) {
                self.connected = true;
                Ok(())
            } else {
                Err(MeterError::connection("refused"))
            }
        }

        async fn close(&mut self) -> MeterResult<()> {
            self.connected = false;
            Ok(())
        }

        async fn read_holding_registers(&mut self, address: u16, quantity: u16) -> MeterResult<Vec<u16>> {
            let words = self.words.lock().unwrap();
            Ok((address..address + quantity)
                .map(|a| words.get(&a).copied().unwrap_or(0))
                .collect())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn is_healthy(&self) -> bool {
            self.connected
        }

        fn set_response_timeout(&mut self, _timeout: Duration) {}

        fn enable_keepalive(&mut self, _idle: Duration) -> MeterResult<()> {
            Ok(())
        }

        fn set_fault_handler(&mut self, _handler: Option<FaultHandler>) {}

        fn get_stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    fn alarm_table() -> RegisterTable {
        RegisterTable::new(vec![
            RegisterDescriptor::new("power", "Power", 0x10, WordType::Uint32, "W"),
            RegisterDescriptor::new("event_ts", "Event", 0x40, WordType::Uint32, "s").internal(),
            RegisterDescriptor::new("remaining", "Remaining", 0x42, WordType::Uint32, "s").internal(),
        ])
        .unwrap()
    }

    fn service(transport: MemoryTransport) -> (PollingService<MemoryTransport>, Arc<Mutex<Vec<PollEvent>>>) {
        let mut config = PollingConfig::new("memory").with_registers(alarm_table());
        config.event_timestamp_register = "event_ts".into();
        config.remaining_seconds_register = "remaining".into();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let service = PollingService::with_transport(
            config,
            transport,
            Arc::new(move |event| sink.lock().unwrap().push(event)),
            CallbackLogger::disabled(),
        )
        .unwrap();
        (service, events)
    }

    #[tokio::test]
    async fn test_alarm_episode_events() {
        let transport = MemoryTransport::default();
        transport.reachable.store(true, Ordering::SeqCst);
        transport.set_u32(0x10, 1500);
        transport.set_u32(0x40, 0xFFFF_FFFF);
        transport.set_u32(0x42, 0);
        let (service, events) = service(transport.clone());

        assert_eq!(service.run_once().await.unwrap().len(), 3);
        assert_eq!(events.lock().unwrap().len(), 1);

        assert_eq!(service.countdown_state(), CountdownState::default());

        transport.set_u32(0x40, 1_700_000_000);
        transport.set_u32(0x42, 600);
        service.run_once().await.unwrap();
        service.run_once().await.unwrap();

        let counting = service.countdown_state();
        assert!(counting.warning_triggered);
        assert_eq!(counting.countdown_start_value, Some(600));
        assert!(counting.countdown_start_time.is_some());

        transport.set_u32(0x40, 0xFFFF_FFFF);
        service.run_once().await.unwrap();
        service.run_once().await.unwrap();
        assert_eq!(service.countdown_state(), CountdownState::default());

        let events = events.lock().unwrap();
        let first = events
            .iter()
            .filter(|event| matches!(event, PollEvent::FirstDisconnectionWarning { .. }))
            .count();
        let warnings: Vec<i64> = events
            .iter()
            .filter_map(|event| match event {
                PollEvent::DisconnectionWarning { seconds_remaining } => Some(*seconds_remaining),
                _ => None,
            })
            .collect();
        let stops = events.iter().filter(|event| **event == PollEvent::StopWarning).count();

        assert_eq!(first, 1);
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().all(|seconds| (598..=600).contains(seconds)));
        assert_eq!(stops, 1);
        assert_eq!(service.get_diagnostics().cycles_succeeded, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_halts_polling() {
        let transport = MemoryTransport::default();
        let (service, events) = service(transport);
        service.start().unwrap();

        // Ten reconnects five seconds apart, plus slack
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(!service.is_running());
        assert!(service.connection_state().exhausted);
        let exhausted = events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| matches!(event, PollEvent::ReconnectExhausted { attempts: 10 }))
            .count();
        assert_eq!(exhausted, 1);
        service.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let transport = MemoryTransport::default();
        transport.reachable.store(true, Ordering::SeqCst);
        let (service, _) = service(transport);

        service.start().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(service.is_running());

        service.stop().await;
        let after_first = service.get_diagnostics();
        service.stop().await;

        assert_eq!(service.get_diagnostics(), after_first);
        assert!(!service.is_running());
        assert!(matches!(service.start(), Err(MeterError::Stopped)));
        assert!(matches!(service.run_once().await, Err(MeterError::Stopped)));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(service.get_diagnostics().cycles_run, after_first.cycles_run);
    }

    #[tokio::test]
    async fn test_invalid_configuration_fails_fast() {
        let result = PollingService::with_transport(
            PollingConfig::new(""),
            MemoryTransport::default(),
            Arc::new(|_| {}),
            CallbackLogger::disabled(),
        );
        assert!(matches!(result, Err(MeterError::Configuration { .. })));

        let (service, _) = service(MemoryTransport::default());
        assert!(matches!(
            service.set_interval(Duration::ZERO),
            Err(MeterError::InvalidInterval { .. })
        ));
        assert!(service.set_interval(Duration::from_secs(10)).is_ok());
        assert_eq!(service.interval(), Duration::from_secs(10));
    }
}
