//! Command line interface of the `linkprobe` binary

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};

use crate::core::{DeviceRole, LogFormat, MacAddress, NodeConfig, Result, TransportKind};
use crate::protocol::GpsSnapshot;

/// Clock disciplined against GPS time
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ClockKind {
    /// Operating system realtime clock (needs CAP_SYS_TIME)
    System,
    /// Process-local clock for unprivileged runs
    Soft,
}

/// File format of receiver records
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RecordFormat {
    Csv,
    Json,
}

impl From<RecordFormat> for LogFormat {
    fn from(format: RecordFormat) -> Self {
        match format {
            RecordFormat::Csv => LogFormat::Csv,
            RecordFormat::Json => LogFormat::Json,
        }
    }
}

/// GPS-synchronised one-way latency and loss probe for wireless links
#[derive(Parser, Debug, Clone)]
#[command(name = "linkprobe")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// JSON configuration file; flags below override it
    #[arg(short, long, env = "LINKPROBE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Role of this node (sender/tx or receiver/rx)
    #[arg(short, long)]
    pub role: Option<DeviceRole>,

    /// Transport under test (wifi4, wifi6, wifi-lr, esp-now)
    #[arg(short, long)]
    pub transport: Option<TransportKind>,

    /// RF channel
    #[arg(long)]
    pub channel: Option<u8>,

    /// Requested transmit power in dBm
    #[arg(long = "tx-power", allow_negative_numbers = true)]
    pub tx_power_dbm: Option<i8>,

    /// Test packet payload size in bytes
    #[arg(long)]
    pub payload_size: Option<usize>,

    /// Send rate in packets per second
    #[arg(long)]
    pub rate: Option<u32>,

    /// GPS serial device
    #[arg(long)]
    pub gps_device: Option<String>,

    /// GPS serial baud rate
    #[arg(long)]
    pub gps_baud: Option<u32>,

    /// Give up waiting for the first GPS fix after this many seconds
    #[arg(long, value_name = "SECS")]
    pub fix_timeout: Option<f64>,

    /// Replace the GPS receiver with a fixed position on host time
    #[arg(long)]
    pub simulate_gps: bool,

    /// Latitude of the simulated receiver
    #[arg(long, allow_negative_numbers = true, requires = "simulate_gps")]
    pub sim_lat: Option<f64>,

    /// Longitude of the simulated receiver
    #[arg(long, allow_negative_numbers = true, requires = "simulate_gps")]
    pub sim_lon: Option<f64>,

    /// Wireless interface whose signal level is recorded as RSSI
    #[arg(long)]
    pub interface: Option<String>,

    /// Link-layer peer address; FF:FF:FF:FF:FF:FF accepts any peer
    #[arg(long)]
    pub peer_mac: Option<MacAddress>,

    /// Link-layer address of this node
    #[arg(long)]
    pub local_mac: Option<MacAddress>,

    /// Write receiver records to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Format of the record file
    #[arg(long, value_enum)]
    pub log_format: Option<RecordFormat>,

    /// Clock to discipline
    #[arg(long, value_enum, default_value_t = ClockKind::System)]
    pub clock: ClockKind,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Loads the configuration file, applies flag overrides and validates
    pub fn load_config(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::from_json_file(path)?,
            None => NodeConfig::default(),
        };
        self.apply_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&self, config: &mut NodeConfig) {
        if let Some(role) = self.role {
            config.role = role;
        }
        if let Some(transport) = self.transport {
            config.transport = transport;
        }
        if let Some(channel) = self.channel {
            config.channel = channel;
        }
        if let Some(dbm) = self.tx_power_dbm {
            config.tx_power_dbm = dbm;
        }
        if let Some(size) = self.payload_size {
            config.payload_size = size;
        }
        if let Some(rate) = self.rate {
            config.packet_rate_hz = rate;
        }
        if let Some(device) = &self.gps_device {
            config.gps.device = device.clone();
        }
        if let Some(baud) = self.gps_baud {
            config.gps.baud_rate = baud;
        }
        if let Some(secs) = self.fix_timeout {
            config.gps.fix_timeout = Some(Duration::from_secs_f64(secs.max(0.0)));
        }
        if let Some(iface) = &self.interface {
            config.wifi.interface = Some(iface.clone());
        }
        if let Some(mac) = self.peer_mac {
            config.link.peer_mac = mac;
        }
        if let Some(mac) = self.local_mac {
            config.link.local_mac = Some(mac);
        }
        if let Some(path) = &self.log_file {
            config.log.path = Some(path.clone());
        }
        if let Some(format) = self.log_format {
            config.log.format = format.into();
        }
    }

    /// Position reported by the simulated GPS
    pub fn simulated_position(&self) -> GpsSnapshot {
        GpsSnapshot {
            latitude: self.sim_lat.unwrap_or(0.0),
            longitude: self.sim_lon.unwrap_or(0.0),
            altitude_mm: 0.0,
            satellites: 12,
            horizontal_accuracy_mm: 1_000,
        }
    }

    /// Default `tracing` filter for the verbosity flags
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}
