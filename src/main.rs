use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use linkprobe::cli::{ClockKind, Cli};
use linkprobe::network::open_transport;
use linkprobe::record::open_sink;
use linkprobe::role::Node;
use linkprobe::time::{GpsSource, NmeaGps, SharedClock, SimulatedGps, SoftClock, SystemClock};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = cli.load_config().context("invalid configuration")?;

    info!("linkprobe {} starting as {}", linkprobe::VERSION, config.role.name());
    info!("Transport: {}", config.transport);
    info!("TX Power: {} dBm", config.tx_power_dbm);
    info!("Channel: {}", config.channel);
    info!("Packet Size: {} bytes", config.frame_len());
    info!("Packet Rate: {} Hz", config.packet_rate_hz);

    let clock: SharedClock = match cli.clock {
        ClockKind::System => Arc::new(SystemClock::new()),
        ClockKind::Soft => Arc::new(SoftClock::new()),
    };

    let gps: Box<dyn GpsSource> = if cli.simulate_gps {
        Box::new(SimulatedGps::new(
            Arc::new(SystemClock::new()),
            cli.simulated_position(),
            config.sync.leap_seconds,
        ))
    } else {
        let gps = NmeaGps::open(&config.gps, config.sync.leap_seconds)
            .with_context(|| format!("cannot open GPS receiver {}", config.gps.device))?;
        Box::new(gps)
    };

    let transport = open_transport(&config).context("cannot set up transport")?;
    let sink = open_sink(&config.log).context("cannot open record output")?;

    Node::new(config, transport, gps, clock, sink).run().await?;
    Ok(())
}
