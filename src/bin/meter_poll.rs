//! Meter Poller command-line client
//!
//! Polls one meter and prints readings, countdown warnings and failures as
//! they arrive. Stops on Ctrl-C, after `--cycles` successful cycles, or when
//! the meter stays unreachable past the reconnect budget.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use meter_poller::utils::format;
use meter_poller::{CallbackLogger, EventCallback, PollEvent, PollingConfig, PollingService};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML or JSON configuration file
    #[arg(short, long, value_name = "FILE", conflicts_with = "host")]
    config: Option<PathBuf>,

    /// Meter host name or IP address
    #[arg(long, env = "METER_HOST")]
    host: Option<String>,

    /// Meter TCP port
    #[arg(short, long, default_value_t = meter_poller::DEFAULT_TCP_PORT)]
    port: u16,

    /// Polling interval in seconds
    #[arg(short, long)]
    interval: Option<u64>,

    /// Also read the export-energy registers
    #[arg(long)]
    export_energy: bool,

    /// Exit after this many successful cycles (0 runs until Ctrl-C)
    #[arg(long, default_value_t = 0)]
    cycles: u64,

    /// Run a single cycle outside the scheduler and exit
    #[arg(long, conflicts_with = "cycles")]
    once: bool,

    /// Echo engine log records to the console
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn polling_config(&self) -> Result<PollingConfig> {
        let mut config = match (&self.config, &self.host) {
            (Some(path), _) => PollingConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            (None, Some(host)) => PollingConfig::new(host.clone())
                .with_port(self.port)
                .with_export_energy(self.export_energy),
            (None, None) => bail!("either --config or --host is required"),
        };
        if let Some(seconds) = self.interval {
            config = config.with_poll_interval(Duration::from_secs(seconds));
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = args.polling_config()?;

    println!("⚡ {}", meter_poller::info());
    println!("==========================================");
    println!("Meter:     {}", config.target());
    println!("Interval:  {}", format::format_duration(config.poll_interval()));
    println!("Registers: {}", config.register_table().len());
    println!();

    let (sender, mut events) = mpsc::unbounded_channel();
    let callback: EventCallback = Arc::new(move |event| {
        let _ = sender.send(event);
    });
    let logger = if args.verbose {
        CallbackLogger::console()
    } else {
        CallbackLogger::disabled()
    };

    let service = PollingService::with_logger(config, callback, logger)?;

    if args.once {
        let result = service.run_once().await;
        service.stop().await;
        let readings = result.context("polling cycle failed")?;
        println!("{}", format::format_readings(&readings));
        return Ok(());
    }

    service.start()?;

    let mut completed = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    PollEvent::CycleCompleted(readings) => {
                        completed += 1;
                        println!("📊 Cycle {} ({} readings)", completed, readings.len());
                        println!("{}", format::format_readings(&readings));
                        if args.cycles > 0 && completed >= args.cycles {
                            break;
                        }
                    }
                    PollEvent::FirstDisconnectionWarning { seconds_remaining } => {
                        println!("🚨 Disconnection announced, power off in {}", format::format_countdown(seconds_remaining));
                    }
                    PollEvent::DisconnectionWarning { seconds_remaining } => {
                        println!("⏳ Power off in {}", format::format_countdown(seconds_remaining));
                    }
                    PollEvent::StopWarning => println!("✅ Disconnection cancelled"),
                    PollEvent::CycleFailed { error, consecutive_failures } => {
                        println!("❌ Cycle failed ({} in a row): {}", consecutive_failures, error);
                    }
                    PollEvent::FailureAlert { consecutive_failures, severity } => {
                        println!("⚠️  {:?}: {} consecutive failed cycles", severity, consecutive_failures);
                    }
                    PollEvent::StuckTask { skipped_ticks } => {
                        println!("🛑 Polling stuck after {} skipped ticks", skipped_ticks);
                        break;
                    }
                    PollEvent::ReconnectExhausted { attempts } => {
                        println!("🛑 Meter unreachable after {} reconnect attempts", attempts);
                        break;
                    }
                }
            }
        }
    }

    service.stop().await;

    let diagnostics = service.get_diagnostics();
    println!();
    println!("📈 Diagnostics (success rate {:.1}%)", diagnostics.success_rate());
    println!("{}", serde_json::to_string_pretty(&diagnostics)?);
    if let Some(stats) = service.transport_stats() {
        println!("🔌 Transport");
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }
    Ok(())
}
