//! Meter simulator
//!
//! Serves the built-in three-phase register map over Modbus TCP with slowly
//! drifting values. With `--alarm-after` it announces a disconnection and
//! refreshes the remaining-seconds register only every `--alarm-refresh`
//! seconds, the way real meters do. `--drop-every` severs client sockets
//! periodically to exercise reconnects.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use tokio::time::{interval, Instant};

use meter_poller::{MeterRegisterBank, MeterSimulator, RegisterTable, SimulatorConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:5020")]
    bind: String,

    /// Start a disconnection alarm after this many seconds
    #[arg(long)]
    alarm_after: Option<u64>,

    /// Length of the announced disconnection window in seconds
    #[arg(long, default_value_t = 600)]
    alarm_window: u32,

    /// How often the meter refreshes its remaining-seconds register
    #[arg(long, default_value_t = 60)]
    alarm_refresh: u64,

    /// Drop every client connection at this period in seconds
    #[arg(long)]
    drop_every: Option<u64>,
}

fn address_of(table: &RegisterTable, id: &str) -> Result<u16> {
    table
        .get(id)
        .map(|descriptor| descriptor.start_address)
        .with_context(|| format!("register {} missing from the default map", id))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let mut args = Args::parse();
    let table = RegisterTable::default_meter();
    let bank = MeterRegisterBank::for_table(&table)?;

    let config = SimulatorConfig {
        bind_address: args.bind.parse().context("invalid --bind address")?,
        ..Default::default()
    };
    let mut simulator = MeterSimulator::with_config(config, bank.clone());
    let addr = simulator.start().await?;

    println!("🔌 Meter simulator");
    println!("==================");
    println!("Listening on: {}", addr);
    println!("Registers:    {}", table.len());
    println!();

    let power = address_of(&table, "active_power_import")?;
    let energy = address_of(&table, "energy_import_total")?;
    let event = address_of(&table, meter_poller::DEFAULT_EVENT_TIMESTAMP_REGISTER)?;
    let remaining = address_of(&table, meter_poller::DEFAULT_REMAINING_SECONDS_REGISTER)?;

    let started = Instant::now();
    let mut ticker = interval(Duration::from_secs(1));
    let mut energy_wh = 100_000u32;
    let mut alarm_since: Option<Instant> = None;
    let mut last_drop = Instant::now();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let elapsed = started.elapsed().as_secs();
                let watts = 1200 + (elapsed % 60) as u32 * 10;
                energy_wh = energy_wh.wrapping_add(watts / 3600 + 1);
                bank.set_u32(power, watts)?;
                bank.set_u32(energy, energy_wh)?;

                if let Some(after) = args.alarm_after {
                    if elapsed >= after && alarm_since.is_none() {
                        warn!("Announcing disconnection in {}s", args.alarm_window);
                        bank.set_u32(event, chrono::Utc::now().timestamp() as u32)?;
                        bank.set_u32(remaining, args.alarm_window)?;
                        alarm_since = Some(Instant::now());
                    }
                }

                if let Some(since) = alarm_since {
                    let alarm_elapsed = since.elapsed().as_secs();
                    if alarm_elapsed >= args.alarm_window as u64 {
                        info!("Disconnection window over, clearing alarm");
                        bank.set_u32(event, u32::MAX)?;
                        bank.set_u32(remaining, 0)?;
                        alarm_since = None;
                        if let Some(after) = args.alarm_after.as_mut() {
                            *after = elapsed + args.alarm_window as u64;
                        }
                    } else if alarm_elapsed % args.alarm_refresh.max(1) == 0 {
                        bank.set_u32(remaining, args.alarm_window - alarm_elapsed as u32)?;
                    }
                }

                if let Some(period) = args.drop_every {
                    if last_drop.elapsed() >= Duration::from_secs(period) {
                        warn!("Dropping all client connections");
                        simulator.drop_connections();
                        last_drop = Instant::now();
                    }
                }
            }
        }
    }

    let stats = simulator.get_stats();
    simulator.stop();
    println!();
    println!("📊 Simulator statistics:");
    println!("   - Connections: {}", stats.connections_count);
    println!("   - Requests: {}", stats.total_requests);
    println!("   - Exceptions: {}", stats.exception_responses);
    println!("   - Uptime: {}s", stats.uptime_seconds);
    Ok(())
}
