/// Connection management for a single meter
///
/// [`ConnectionManager`] owns the transport and is the only place that opens,
/// closes or re-opens it. Callers ask [`ensure_connected`] before every cycle;
/// faults anywhere in the engine end up in [`schedule_reconnect`], which
/// retries after a flat delay, never stacks two pending retries, and gives up
/// for good after a fixed number of attempts.
///
/// [`ensure_connected`]: ConnectionManager::ensure_connected
/// [`schedule_reconnect`]: ConnectionManager::schedule_reconnect
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::diagnostics::DiagnosticsRecorder;
use crate::error::{MeterError, MeterResult};
use crate::logging::CallbackLogger;
use crate::transport::{FaultHandler, RegisterTransport, TransportFault, TransportStats};

const COMPONENT: &str = "connection";

/// Called once when the reconnect budget is spent, with the attempt count
pub type ExhaustedCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Reconnect and post-connect settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Flat delay before each scheduled attempt
    pub delay: Duration,
    /// Scheduled attempts allowed before the terminal state
    pub max_attempts: u32,
    /// Protocol-level response timeout applied after every connect
    pub response_timeout: Duration,
    /// Keep-alive idle time applied after every connect
    pub keepalive_idle: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(crate::DEFAULT_RECONNECT_DELAY_MS),
            max_attempts: crate::DEFAULT_MAX_RECONNECT_ATTEMPTS,
            response_timeout: Duration::from_millis(crate::DEFAULT_RESPONSE_TIMEOUT_MS),
            keepalive_idle: Duration::from_secs(crate::DEFAULT_KEEPALIVE_IDLE_SECS),
        }
    }
}

/// Connection bookkeeping, exposed read-only to the host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub is_connected: bool,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    pub pending_reconnect_scheduled: bool,
    /// Terminal: no reconnect will ever be scheduled again
    pub exhausted: bool,
}

struct Inner<T> {
    transport: tokio::sync::Mutex<T>,
    state: Mutex<ConnectionState>,
    policy: ReconnectPolicy,
    diagnostics: DiagnosticsRecorder,
    logger: CallbackLogger,
    cancel: CancellationToken,
    shut_down: AtomicBool,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    on_exhausted: Mutex<Option<ExhaustedCallback>>,
}

/// Lazily (re)connecting owner of one [`RegisterTransport`]
///
/// Cheap to clone; clones share the same transport and state.
pub struct ConnectionManager<T: RegisterTransport + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: RegisterTransport + 'static> Clone for ConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: RegisterTransport + 'static> ConnectionManager<T> {
    /// Wrap a transport; nothing is connected until the first
    /// [`ensure_connected`](Self::ensure_connected)
    pub fn new(transport: T, policy: ReconnectPolicy, diagnostics: DiagnosticsRecorder, logger: CallbackLogger) -> Self {
        let state = ConnectionState {
            max_reconnect_attempts: policy.max_attempts,
            ..ConnectionState::default()
        };

        Self {
            inner: Arc::new(Inner {
                transport: tokio::sync::Mutex::new(transport),
                state: Mutex::new(state),
                policy,
                diagnostics,
                logger,
                cancel: CancellationToken::new(),
                shut_down: AtomicBool::new(false),
                reconnect_task: Mutex::new(None),
                on_exhausted: Mutex::new(None),
            }),
        }
    }

    /// Register the terminal-condition callback
    pub fn on_exhausted(&self, callback: ExhaustedCallback) {
        *lock(&self.inner.on_exhausted) = Some(callback);
    }

    /// Copy of the connection bookkeeping
    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    /// Manager-level connection flag
    pub fn is_connected(&self) -> bool {
        lock(&self.inner.state).is_connected
    }

    /// Whether the reconnect budget is spent
    pub fn is_exhausted(&self) -> bool {
        lock(&self.inner.state).exhausted
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Transport statistics, if the transport is not busy right now
    pub fn transport_stats(&self) -> Option<TransportStats> {
        self.inner.transport.try_lock().ok().map(|transport| transport.get_stats())
    }

    /// Return `true` if the transport is connected and healthy; otherwise make
    /// exactly one fresh connect attempt and return its outcome
    ///
    /// A failed attempt schedules a delayed reconnect. Once the reconnect
    /// budget is spent, or after shutdown, this returns `false` without
    /// touching the network.
    pub async fn ensure_connected(&self) -> bool {
        if self.is_stopped() || self.is_exhausted() {
            return false;
        }

        let mut transport = self.inner.transport.lock().await;
        if self.is_stopped() {
            return false;
        }

        let flagged = self.is_connected();
        if flagged && transport.is_connected() && transport.is_healthy() {
            return true;
        }
        if flagged || transport.is_connected() {
            self.inner.logger.info(COMPONENT, "Connection is stale, reconnecting");
        }

        transport.set_fault_handler(None);
        let _ = transport.close().await;
        self.set_connected(false);

        self.inner.diagnostics.record_connect_attempt();
        match transport.connect().await {
            Ok(()) => {
                self.after_connect(&mut *transport);
                true
            }
            Err(error) => {
                drop(transport);
                let message = format!("Connect failed: {}", error);
                self.inner.diagnostics.record_connect_failure(&message);
                self.inner.logger.warn(COMPONENT, &message);
                self.schedule_reconnect(&message);
                false
            }
        }
    }

    /// Post-connect setup: response timeout, keep-alive, fault handler
    fn after_connect(&self, transport: &mut T) {
        transport.set_response_timeout(self.inner.policy.response_timeout);
        if let Err(error) = transport.enable_keepalive(self.inner.policy.keepalive_idle) {
            self.inner.logger.warn(COMPONENT, &format!("Failed to enable keep-alive: {}", error));
        }

        transport.set_fault_handler(None);
        transport.set_fault_handler(Some(self.fault_handler()));

        {
            let mut state = lock(&self.inner.state);
            state.is_connected = true;
            state.reconnect_attempts = 0;
        }
        self.inner.diagnostics.record_connect_success();
        self.inner.logger.info(COMPONENT, "Connected to meter");
    }

    fn fault_handler(&self) -> FaultHandler {
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Arc::new(move |fault: TransportFault| {
            if let Some(inner) = weak.upgrade() {
                ConnectionManager { inner }.handle_fault(fault);
            }
        })
    }

    /// Socket-level fault reported by the transport
    ///
    /// Runs inside whatever operation observed the fault, so it only flips the
    /// flag and schedules work.
    fn handle_fault(&self, fault: TransportFault) {
        self.set_connected(false);
        self.inner.diagnostics.record_socket_reset();
        self.schedule_reconnect(&fault.to_string());
    }

    /// Flag the connection as suspect without reconnecting now; the next
    /// [`ensure_connected`](Self::ensure_connected) reconciles
    pub fn mark_unhealthy(&self, reason: &str) {
        if self.is_connected() {
            self.inner.logger.debug(COMPONENT, &format!("Connection marked unhealthy: {}", reason));
        }
        self.set_connected(false);
    }

    /// Schedule one delayed reconnect attempt
    ///
    /// No-op while another attempt is pending, after shutdown, or once the
    /// budget is spent. The call that finds the budget spent reports the
    /// terminal condition; later calls stay silent.
    pub fn schedule_reconnect(&self, reason: &str) {
        if self.is_stopped() {
            return;
        }

        let attempt = {
            let mut state = lock(&self.inner.state);
            if state.exhausted {
                return;
            }
            if state.pending_reconnect_scheduled {
                return;
            }
            if state.reconnect_attempts >= self.inner.policy.max_attempts {
                state.exhausted = true;
                let attempts = state.reconnect_attempts;
                drop(state);
                self.report_exhausted(attempts);
                return;
            }
            state.reconnect_attempts += 1;
            state.pending_reconnect_scheduled = true;
            state.reconnect_attempts
        };

        let delay = self.inner.policy.delay;
        self.inner.logger.info(
            COMPONENT,
            &format!(
                "Reconnect attempt {}/{} in {:?} ({})",
                attempt, self.inner.policy.max_attempts, delay, reason
            ),
        );

        let manager = self.clone();
        let cancel = self.inner.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    lock(&manager.inner.state).pending_reconnect_scheduled = false;
                    manager.ensure_connected().await;
                }
            }
        });
        *lock(&self.inner.reconnect_task) = Some(handle);
    }

    fn report_exhausted(&self, attempts: u32) {
        let error = MeterError::reconnect_exhausted(attempts);
        self.inner.diagnostics.record_connect_failure(&error.to_string());
        self.inner.logger.error(COMPONENT, &error.to_string());

        let callback = lock(&self.inner.on_exhausted).clone();
        if let Some(callback) = callback {
            callback(attempts);
        }
    }

    /// Read holding registers over the managed transport
    pub async fn read_holding_registers(&self, address: u16, quantity: u16) -> MeterResult<Vec<u16>> {
        if self.is_stopped() {
            return Err(MeterError::Stopped);
        }
        let mut transport = self.inner.transport.lock().await;
        transport.read_holding_registers(address, quantity).await
    }

    /// Cancel any pending reconnect and release the transport
    ///
    /// Waits for an in-flight register read to finish before closing.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        if let Some(handle) = lock(&self.inner.reconnect_task).take() {
            handle.abort();
        }

        let mut transport = self.inner.transport.lock().await;
        transport.set_fault_handler(None);
        if let Err(error) = transport.close().await {
            self.inner.logger.warn(COMPONENT, &format!("Error while closing transport: {}", error));
        }
        drop(transport);

        {
            let mut state = lock(&self.inner.state);
            state.is_connected = false;
            state.pending_reconnect_scheduled = false;
        }
        self.inner.logger.info(COMPONENT, "Connection manager stopped");
    }

    fn set_connected(&self, connected: bool) {
        lock(&self.inner.state).is_connected = connected;
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Transport whose connect outcome and health are scripted
    #[derive(Default)]
    struct ScriptedTransport {
        connect_ok: Arc<AtomicBool>,
        healthy: Arc<AtomicBool>,
        connects: Arc<AtomicU32>,
        handler_installs: Arc<AtomicU32>,
        connected: bool,
        handler: Option<FaultHandler>,
    }

    #[async_trait]
    impl RegisterTransport for ScriptedTransport {
        async fn connect(&mut self) -> MeterResult<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.connect_ok.load(Ordering::SeqCst) {
                self.connected = true;
                self.healthy.store(true, Ordering::SeqCst);
                Ok(())
            } else {
                Err(MeterError::connection("refused"))
            }
        }

        async fn close(&mut self) -> MeterResult<()> {
            self.connected = false;
            Ok(())
        }

        async fn read_holding_registers(&mut self, _address: u16, quantity: u16) -> MeterResult<Vec<u16>> {
            if let Some(handler) = &self.handler {
                if !self.healthy.load(Ordering::SeqCst) {
                    handler(TransportFault::Closed);
                    return Err(MeterError::connection("closed"));
                }
            }
            Ok(vec![0; quantity as usize])
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn is_healthy(&self) -> bool {
            self.connected && self.healthy.load(Ordering::SeqCst)
        }

        fn set_response_timeout(&mut self, _timeout: Duration) {}

        fn enable_keepalive(&mut self, _idle: Duration) -> MeterResult<()> {
            Ok(())
        }

        fn set_fault_handler(&mut self, handler: Option<FaultHandler>) {
            if handler.is_some() {
                self.handler_installs.fetch_add(1, Ordering::SeqCst);
            }
            self.handler = handler;
        }

        fn get_stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            delay: Duration::from_secs(5),
            max_attempts: 10,
            ..ReconnectPolicy::default()
        }
    }

    fn manager(transport: ScriptedTransport) -> ConnectionManager<ScriptedTransport> {
        ConnectionManager::new(transport, policy(), DiagnosticsRecorder::new(), CallbackLogger::disabled())
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_connected_is_idempotent() {
        let transport = ScriptedTransport::default();
        transport.connect_ok.store(true, Ordering::SeqCst);
        let connects = transport.connects.clone();
        let installs = transport.handler_installs.clone();

        let manager = manager(transport);
        assert!(manager.ensure_connected().await);
        assert!(manager.ensure_connected().await);
        assert!(manager.ensure_connected().await);

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(installs.load(Ordering::SeqCst), 1);
        assert!(manager.state().is_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_socket_with_stale_flag_reconnects() {
        let transport = ScriptedTransport::default();
        transport.connect_ok.store(true, Ordering::SeqCst);
        let healthy = transport.healthy.clone();
        let connects = transport.connects.clone();

        let manager = manager(transport);
        assert!(manager.ensure_connected().await);

        // Socket died but nothing has told the manager yet
        healthy.store(false, Ordering::SeqCst);
        assert!(manager.is_connected());

        assert!(manager.ensure_connected().await);
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_is_deduplicated() {
        let transport = ScriptedTransport::default();
        let manager = manager(transport);

        manager.schedule_reconnect("first fault");
        manager.schedule_reconnect("second fault");
        manager.schedule_reconnect("third fault");

        let state = manager.state();
        assert!(state.pending_reconnect_scheduled);
        assert_eq!(state.reconnect_attempts, 1);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_budget_exhausts_once() {
        let transport = ScriptedTransport::default();
        let connects = transport.connects.clone();
        let manager = manager(transport);

        let reports = Arc::new(AtomicU32::new(0));
        let counter = reports.clone();
        manager.on_exhausted(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(!manager.ensure_connected().await);

        // Ten scheduled attempts, five seconds apart
        tokio::time::sleep(Duration::from_secs(5 * 10 + 1)).await;

        let state = manager.state();
        assert!(state.exhausted);
        assert_eq!(state.reconnect_attempts, 10);
        assert!(!state.pending_reconnect_scheduled);
        assert_eq!(reports.load(Ordering::SeqCst), 1);
        assert_eq!(connects.load(Ordering::SeqCst), 11);

        // Further faults and cycles stay idle
        manager.schedule_reconnect("late fault");
        assert!(!manager.ensure_connected().await);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(reports.load(Ordering::SeqCst), 1);
        assert_eq!(connects.load(Ordering::SeqCst), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_reconnect_resets_attempts() {
        let transport = ScriptedTransport::default();
        let connect_ok = transport.connect_ok.clone();
        let manager = manager(transport);

        assert!(!manager.ensure_connected().await);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(manager.state().reconnect_attempts, 3);

        connect_ok.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;

        let state = manager.state();
        assert!(state.is_connected);
        assert_eq!(state.reconnect_attempts, 0);
        assert!(!state.pending_reconnect_scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_handler_schedules_reconnect() {
        let transport = ScriptedTransport::default();
        transport.connect_ok.store(true, Ordering::SeqCst);
        let healthy = transport.healthy.clone();

        let diagnostics = DiagnosticsRecorder::new();
        let manager = ConnectionManager::new(transport, policy(), diagnostics.clone(), CallbackLogger::disabled());
        assert!(manager.ensure_connected().await);

        healthy.store(false, Ordering::SeqCst);
        assert!(manager.read_holding_registers(0, 1).await.is_err());

        let state = manager.state();
        assert!(!state.is_connected);
        assert!(state.pending_reconnect_scheduled);
        assert_eq!(diagnostics.snapshot().socket_resets, 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_reconnect() {
        let transport = ScriptedTransport::default();
        let connects = transport.connects.clone();
        let manager = manager(transport);

        assert!(!manager.ensure_connected().await);
        manager.shutdown().await;
        manager.shutdown().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert!(!manager.ensure_connected().await);
        assert!(matches!(manager.read_holding_registers(0, 1).await, Err(MeterError::Stopped)));
    }
}
