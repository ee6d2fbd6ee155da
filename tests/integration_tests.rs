//! Integration Tests for Meter Poller
//!
//! These tests run the polling service against the in-process meter
//! simulator over real TCP sockets, plus a mock transport where exact
//! timing matters.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_test::{assert_err, assert_ok};

use meter_poller::transport::FaultHandler;
use meter_poller::utils::logging::init_test_logger;
use meter_poller::*;

/// Mock transport for testing without a meter
///
/// Every word reads back as its own address. Reads touching a stalled
/// address never complete.
#[derive(Clone, Default)]
pub struct MockTransport {
    stalled: Arc<Mutex<HashSet<u16>>>,
    unreachable: Arc<AtomicBool>,
    connects: Arc<AtomicU32>,
    connected: bool,
}

impl MockTransport {
    pub fn stall(&self, address: u16) {
        self.stalled.lock().unwrap().insert(address);
    }
}

#[async_trait]
impl RegisterTransport for MockTransport {
    async fn connect(&mut self) -> MeterResult<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(MeterError::connection("Connection refused"));
        }
        self.connected = true;
        Ok(())
    }

    async fn close(&mut self) -> MeterResult<()> {
        self.connected = false;
        Ok(())
    }

    async fn read_holding_registers(&mut self, address: u16, quantity: u16) -> MeterResult<Vec<u16>> {
        let stalled = (0..quantity).any(|i| self.stalled.lock().unwrap().contains(&(address + i)));
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok((address..address + quantity).collect())
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

fn five_registers() -> RegisterTable {
    RegisterTable::new(vec![
        RegisterDescriptor::new("voltage", "Voltage", 0x00, WordType::Uint16, "dV"),
        RegisterDescriptor::new("current", "Current", 0x01, WordType::Uint16, "cA"),
        RegisterDescriptor::new("power", "Power", 0x10, WordType::Uint32, "W"),
        RegisterDescriptor::new(DEFAULT_EVENT_TIMESTAMP_REGISTER, "Event", 0x40, WordType::Uint32, "s").internal(),
        RegisterDescriptor::new(DEFAULT_REMAINING_SECONDS_REGISTER, "Remaining", 0x42, WordType::Uint32, "s")
            .internal(),
    ])
    .unwrap()
}

async fn start_simulator() -> (MeterSimulator, MeterRegisterBank, PollingConfig) {
    init_test_logger();
    let bank = MeterRegisterBank::for_table(&RegisterTable::default_meter()).unwrap();
    let mut simulator = MeterSimulator::new("127.0.0.1:0", bank.clone()).unwrap();
    let addr = simulator.start().await.unwrap();
    let config = PollingConfig::new("127.0.0.1").with_port(addr.port());
    (simulator, bank, config)
}

async fn next_matching<F>(events: &mut mpsc::UnboundedReceiver<PollEvent>, wait: Duration, predicate: F) -> Option<PollEvent>
where
    F: Fn(&PollEvent) -> bool,
{
    timeout(wait, async {
        while let Some(event) = events.recv().await {
            if predicate(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Full cycle against the simulator
#[tokio::test]
async fn test_poll_simulated_meter() {
    let (_simulator, bank, config) = start_simulator().await;
    bank.set_u32(0x0010, 4_321).unwrap();
    bank.set_u32(0x0020, 0x0001_0002).unwrap();

    let (service, _events) = PollingService::with_channel(config).unwrap();
    let readings = service.run_once().await.unwrap();

    let expected = RegisterTable::default_meter().for_config(false);
    assert_eq!(readings.len(), expected.len());
    let ids: Vec<_> = readings.iter().map(|r| r.id.as_str()).collect();
    let declared: Vec<_> = expected.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, declared);

    let power = readings.iter().find(|r| r.id == "active_power_import").unwrap();
    assert_eq!(power.value, 4_321);
    let energy = readings.iter().find(|r| r.id == "energy_import_total").unwrap();
    assert_eq!(energy.value, 65_538);

    let diagnostics = service.get_diagnostics();
    assert_eq!(diagnostics.cycles_succeeded, 1);
    assert_eq!(diagnostics.successful_connects, 1);
    assert!(service.connection_state().is_connected);

    let stats = service.transport_stats().unwrap();
    assert_eq!(stats.connects, 1);
    assert_eq!(stats.requests_sent, readings.len() as u64);
    assert_eq!(stats.responses_received, stats.requests_sent);
    service.stop().await;
}

/// Export registers only when enabled
#[tokio::test]
async fn test_export_energy_toggle() {
    let (_simulator, _bank, config) = start_simulator().await;

    let (without, _) = PollingService::with_channel(config.clone()).unwrap();
    let (with, _) = PollingService::with_channel(config.with_export_energy(true)).unwrap();

    let without = without.run_once().await.unwrap();
    let with = with.run_once().await.unwrap();
    assert!(without.iter().all(|r| r.id != "energy_export_total"));
    assert!(with.iter().any(|r| r.id == "energy_export_total"));
    assert_eq!(with.len(), without.len() + 2);
}

/// Exception responses cost only the affected registers
#[tokio::test]
async fn test_failing_registers_are_isolated() {
    let (_simulator, bank, config) = start_simulator().await;
    bank.inject_fault(0x0003, RegisterFault::Exception(0x02)).unwrap();
    bank.inject_fault(0x0020, RegisterFault::Exception(0x04)).unwrap();

    let (service, _events) = PollingService::with_channel(config).unwrap();
    let readings = service.run_once().await.unwrap();

    let expected = service.register_table().len() - 2;
    assert_eq!(readings.len(), expected);
    assert!(readings.iter().all(|r| r.id != "current_l1" && r.id != "energy_import_total"));

    let diagnostics = service.get_diagnostics();
    assert_eq!(diagnostics.register_read_failures, 2);
    assert_eq!(diagnostics.cycles_succeeded, 1);

    // Exception responses keep the socket
    assert!(service.connection_state().is_connected);
    service.run_once().await.unwrap();
    assert_eq!(service.get_diagnostics().successful_connects, 1);
}

/// Two of five registers time out; the cycle still succeeds with three
#[tokio::test(start_paused = true)]
async fn test_timed_out_registers_with_mock_transport() {
    let transport = MockTransport::default();
    transport.stall(0x01);
    transport.stall(0x42);

    let (sender, _events) = mpsc::unbounded_channel();
    let service = PollingService::with_transport(
        PollingConfig::new("mock").with_registers(five_registers()),
        transport,
        Arc::new(move |event| {
            let _ = sender.send(event);
        }),
        CallbackLogger::disabled(),
    )
    .unwrap();

    let readings = service.run_once().await.unwrap();
    let ids: Vec<_> = readings.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["voltage", "power", DEFAULT_EVENT_TIMESTAMP_REGISTER]);
    assert_eq!(readings[1].value, (0x10 << 16) | 0x11);
    assert_eq!(service.get_diagnostics().cycles_succeeded, 1);
}

/// A socket the meter closed is detected and replaced before the next cycle
#[tokio::test]
async fn test_reconnect_after_dropped_socket() {
    let (simulator, _bank, config) = start_simulator().await;
    let (service, _events) = PollingService::with_channel(config).unwrap();

    assert!(!service.run_once().await.unwrap().is_empty());

    simulator.drop_connections();
    sleep(Duration::from_millis(200)).await;

    assert!(!service.run_once().await.unwrap().is_empty());
    let diagnostics = service.get_diagnostics();
    assert_eq!(diagnostics.successful_connects, 2);
    assert_eq!(diagnostics.cycles_failed, 0);
    assert!(simulator.get_stats().connections_count >= 2);
}

/// Unreachable meter: capped reconnects, one terminal report, no more polling
#[tokio::test]
async fn test_reconnect_exhaustion_is_terminal() {
    init_test_logger();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = PollingConfig::new("127.0.0.1")
        .with_port(port)
        .with_reconnect(Duration::from_millis(20), 3);
    let (service, mut events) = PollingService::with_channel(config).unwrap();
    service.start().unwrap();

    let event = next_matching(&mut events, Duration::from_secs(10), |event| {
        matches!(event, PollEvent::ReconnectExhausted { .. })
    })
    .await;
    assert_eq!(event, Some(PollEvent::ReconnectExhausted { attempts: 3 }));

    sleep(Duration::from_millis(200)).await;
    let state = service.connection_state();
    assert!(state.exhausted);
    assert!(!state.pending_reconnect_scheduled);
    assert!(!service.is_running());

    let again = next_matching(&mut events, Duration::from_millis(300), |event| {
        matches!(event, PollEvent::ReconnectExhausted { .. })
    })
    .await;
    assert!(again.is_none());
    service.stop().await;
}

/// Alarm registers drive the countdown events end to end
#[tokio::test]
async fn test_disconnection_alarm_episode() {
    let (_simulator, bank, config) = start_simulator().await;
    let (service, mut events) = PollingService::with_channel(config).unwrap();

    service.run_once().await.unwrap();

    bank.set_u32(0x0040, 1_700_000_000).unwrap();
    bank.set_u32(0x0042, 900).unwrap();
    service.run_once().await.unwrap();
    service.run_once().await.unwrap();

    // The meter shortens the window
    bank.set_u32(0x0042, 120).unwrap();
    service.run_once().await.unwrap();

    bank.set_u32(0x0040, 0xFFFF_FFFF).unwrap();
    service.run_once().await.unwrap();
    service.stop().await;

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }

    let countdown: Vec<_> = received
        .into_iter()
        .filter(|event| !matches!(event, PollEvent::CycleCompleted(_)))
        .collect();
    assert_eq!(countdown.len(), 5);
    assert!(matches!(countdown[0], PollEvent::FirstDisconnectionWarning { seconds_remaining } if seconds_remaining >= 899));
    assert!(matches!(countdown[1], PollEvent::DisconnectionWarning { seconds_remaining } if seconds_remaining >= 899));
    assert!(matches!(countdown[2], PollEvent::DisconnectionWarning { seconds_remaining } if seconds_remaining <= 900));
    assert!(matches!(countdown[3], PollEvent::DisconnectionWarning { seconds_remaining } if seconds_remaining <= 120));
    assert_eq!(countdown[4], PollEvent::StopWarning);
}

/// Scheduled polling delivers cycles; stop is final and idempotent
#[tokio::test]
async fn test_scheduled_polling_start_stop() {
    let (_simulator, _bank, config) = start_simulator().await;
    let config = config.with_poll_interval(Duration::from_secs(1));
    let (service, mut events) = PollingService::with_channel(config).unwrap();

    service.start().unwrap();
    service.start().unwrap();
    assert!(service.is_running());

    let completed = next_matching(&mut events, Duration::from_secs(5), |event| {
        matches!(event, PollEvent::CycleCompleted(_))
    })
    .await;
    assert!(completed.is_some());

    service.stop().await;
    service.stop().await;
    assert!(!service.is_running());

    let cycles = service.get_diagnostics().cycles_run;
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(service.get_diagnostics().cycles_run, cycles);
    assert!(matches!(service.start(), Err(MeterError::Stopped)));
}

/// Invalid configuration fails at construction
#[tokio::test]
async fn test_configuration_errors() {
    assert!(matches!(
        PollingService::with_channel(PollingConfig::new("")),
        Err(MeterError::Configuration { .. })
    ));

    let yaml = "host: meter.local\npoll_interval_ms: 0\n";
    assert!(matches!(
        PollingConfig::from_yaml_str(yaml),
        Err(MeterError::InvalidInterval { .. })
    ));

    let (service, _) = assert_ok!(PollingService::with_channel(PollingConfig::new("meter.local")));
    let err = assert_err!(service.set_interval(Duration::ZERO));
    assert_eq!(err, MeterError::InvalidInterval { interval_ms: 0 });
    assert_ok!(service.set_interval(Duration::from_secs(5)));
    assert_eq!(service.interval(), Duration::from_secs(5));
    service.stop().await;
}
