/// Modbus TCP meter simulator
///
/// Serves holding-register reads (function 0x03) from a [`MeterRegisterBank`]
/// and answers every other function code with exception 0x01. Faults
/// injected into the bank make single registers slow, failing or silent, and
/// [`MeterSimulator::drop_connections`] severs every client socket, which is
/// what the integration tests and the `meter_simulator` binary use to exercise
/// reconnects.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use log::{info, error, debug, warn};

use crate::error::{MeterError, MeterResult};
use crate::protocol::{
    encode_exception_response, encode_read_response, MbapHeader, ModbusException, ReadRequest,
    MAX_TCP_FRAME_SIZE,
};
use crate::register_bank::{MeterRegisterBank, RegisterBankStats, RegisterFault};

/// Simulator statistics
#[derive(Debug, Clone, Default)]
pub struct SimulatorStats {
    pub connections_count: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub exception_responses: u64,
    pub unanswered_requests: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub uptime_seconds: u64,
    pub register_bank_stats: Option<RegisterBankStats>,
}

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub bind_address: SocketAddr,
    /// Close a client that sends nothing for this long
    pub idle_timeout: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], crate::DEFAULT_TCP_PORT)),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Outcome of processing one request frame
enum Reply {
    Frame(Vec<u8>),
    Exception(Vec<u8>),
    Silent,
}

/// Modbus TCP meter simulator
pub struct MeterSimulator {
    config: SimulatorConfig,
    register_bank: MeterRegisterBank,
    stats: Arc<Mutex<SimulatorStats>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    drop_tx: broadcast::Sender<()>,
    local_addr: Option<SocketAddr>,
    start_time: Option<Instant>,
}

impl MeterSimulator {
    /// Create a simulator bound to `bind_address` once started
    pub fn new(bind_address: &str, register_bank: MeterRegisterBank) -> MeterResult<Self> {
        let addr = bind_address.parse()
            .map_err(|e| MeterError::configuration(format!("Invalid bind address: {}", e)))?;

        let config = SimulatorConfig {
            bind_address: addr,
            ..Default::default()
        };

        Ok(Self::with_config(config, register_bank))
    }

    /// Create a simulator with custom configuration
    pub fn with_config(config: SimulatorConfig, register_bank: MeterRegisterBank) -> Self {
        let (drop_tx, _) = broadcast::channel(4);
        Self {
            config,
            register_bank,
            stats: Arc::new(Mutex::new(SimulatorStats::default())),
            shutdown_tx: None,
            drop_tx,
            local_addr: None,
            start_time: None,
        }
    }

    /// Shared handle to the register bank
    pub fn register_bank(&self) -> MeterRegisterBank {
        self.register_bank.clone()
    }

    /// Bound address; useful with port 0
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Bind and start accepting clients
    pub async fn start(&mut self) -> MeterResult<SocketAddr> {
        if self.shutdown_tx.is_some() {
            return Err(MeterError::configuration("Simulator is already running"));
        }

        let listener = TcpListener::bind(self.config.bind_address).await
            .map_err(|e| MeterError::connection(format!("Failed to bind to {}: {}", self.config.bind_address, e)))?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());
        self.local_addr = Some(local_addr);
        self.start_time = Some(Instant::now());

        info!("Meter simulator listening on {}", local_addr);

        let register_bank = self.register_bank.clone();
        let stats = self.stats.clone();
        let idle_timeout = self.config.idle_timeout;
        let drop_tx = self.drop_tx.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                debug!("Accepted connection from {}", addr);

                                let register_bank = register_bank.clone();
                                let stats = stats.clone();
                                let shutdown_rx = shutdown_tx.subscribe();
                                let drop_rx = drop_tx.subscribe();

                                tokio::spawn(async move {
                                    Self::handle_client(stream, register_bank, stats, shutdown_rx, drop_rx, idle_timeout).await;
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Shutdown signal received, stopping simulator");
                        break;
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Stop accepting and close every client
    pub fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
            info!("Meter simulator stopped");
        }
    }

    /// Close every open client socket; the listener keeps accepting
    pub fn drop_connections(&self) {
        let _ = self.drop_tx.send(());
    }

    pub fn get_stats(&self) -> SimulatorStats {
        let mut stats = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        if let Some(start_time) = self.start_time {
            stats.uptime_seconds = start_time.elapsed().as_secs();
        }
        stats.register_bank_stats = Some(self.register_bank.get_stats());
        stats
    }

    fn update_stats(stats: &Mutex<SimulatorStats>, update: impl FnOnce(&mut SimulatorStats)) {
        if let Ok(mut stats) = stats.lock() {
            update(&mut stats);
        }
    }

    async fn handle_client(
        mut stream: TcpStream,
        register_bank: MeterRegisterBank,
        stats: Arc<Mutex<SimulatorStats>>,
        mut shutdown_rx: broadcast::Receiver<()>,
        mut drop_rx: broadcast::Receiver<()>,
        idle_timeout: Duration,
    ) {
        let peer_addr = stream.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "unknown".to_string());
        info!("Client connected: {}", peer_addr);
        Self::update_stats(&stats, |s| s.connections_count += 1);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Shutdown signal received for client {}", peer_addr);
                    break;
                }

                _ = drop_rx.recv() => {
                    info!("Dropping client {}", peer_addr);
                    break;
                }

                result = timeout(idle_timeout, Self::read_frame(&mut stream)) => {
                    let frame = match result {
                        Ok(Ok(Some(frame))) => frame,
                        Ok(Ok(None)) => {
                            debug!("Client {} disconnected", peer_addr);
                            break;
                        }
                        Ok(Err(e)) => {
                            warn!("Bad frame from {}: {}", peer_addr, e);
                            break;
                        }
                        Err(_) => {
                            warn!("Idle timeout for {}", peer_addr);
                            break;
                        }
                    };

                    let received = frame.len() as u64;
                    Self::update_stats(&stats, |s| {
                        s.total_requests += 1;
                        s.bytes_received += received;
                    });

                    let reply = match Self::process_request(&frame, &register_bank).await {
                        Ok(reply) => reply,
                        Err(e) => {
                            error!("Error processing request from {}: {}", peer_addr, e);
                            break;
                        }
                    };

                    let (bytes, exception) = match reply {
                        Reply::Frame(bytes) => (bytes, false),
                        Reply::Exception(bytes) => (bytes, true),
                        Reply::Silent => {
                            Self::update_stats(&stats, |s| s.unanswered_requests += 1);
                            continue;
                        }
                    };

                    if let Err(e) = stream.write_all(&bytes).await {
                        error!("Failed to send response to {}: {}", peer_addr, e);
                        break;
                    }
                    let sent = bytes.len() as u64;
                    Self::update_stats(&stats, |s| {
                        s.bytes_sent += sent;
                        if exception {
                            s.exception_responses += 1;
                        } else {
                            s.successful_requests += 1;
                        }
                    });
                }
            }
        }

        info!("Client {} disconnected", peer_addr);
    }

    /// Read one MBAP frame; `None` on a clean close
    async fn read_frame(stream: &mut TcpStream) -> MeterResult<Option<Vec<u8>>> {
        let mut header = [0u8; MbapHeader::SIZE];
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let parsed = MbapHeader::parse(&header)?;
        let total = parsed.frame_len();
        if total > MAX_TCP_FRAME_SIZE {
            return Err(MeterError::frame(format!("Frame too long: {} bytes", total)));
        }

        let mut frame = vec![0u8; total];
        frame[..MbapHeader::SIZE].copy_from_slice(&header);
        stream.read_exact(&mut frame[MbapHeader::SIZE..]).await?;
        Ok(Some(frame))
    }

    async fn process_request(frame: &[u8], register_bank: &MeterRegisterBank) -> MeterResult<Reply> {
        let (header, function, request) = ReadRequest::decode(frame)?;
        debug!("Processing request: TID={}, Function=0x{:02x}, Unit={}",
               header.transaction_id, function, header.unit_id);

        let exception = |code: ModbusException| {
            Reply::Exception(encode_exception_response(header.transaction_id, header.unit_id, function, code.to_u8()))
        };

        let Some(request) = request else {
            return Ok(exception(ModbusException::IllegalFunction));
        };
        if request.validate().is_err() {
            return Ok(exception(ModbusException::IllegalDataValue));
        }

        match register_bank.fault_for(request.address, request.quantity) {
            Some(RegisterFault::Silent) => return Ok(Reply::Silent),
            Some(RegisterFault::Exception(code)) => {
                return Ok(Reply::Exception(encode_exception_response(
                    header.transaction_id,
                    header.unit_id,
                    function,
                    code,
                )))
            }
            Some(RegisterFault::Delay(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }

        let registers = register_bank.read_holding_registers(request.address, request.quantity)?;
        Ok(Reply::Frame(encode_read_response(header.transaction_id, header.unit_id, &registers)))
    }
}

impl Drop for MeterSimulator {
    fn drop(&mut self) {
        self.stop();
    }
}
