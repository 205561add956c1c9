use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::{DeviceRole, MacAddress, TransportKind};
use super::{Error, Result};

/// Regulatory region applied to the radio before it transmits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegulatoryConfig {
    /// ISO 3166 country code handed to the radio driver
    pub country: String,
    /// Transmit power ceiling in dBm (EIRP)
    pub max_tx_power_dbm: i8,
}

impl Default for RegulatoryConfig {
    fn default() -> Self {
        RegulatoryConfig {
            country: super::DEFAULT_COUNTRY.to_string(),
            max_tx_power_dbm: super::MAX_TX_POWER_DBM,
        }
    }
}

/// GPS receiver settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsConfig {
    /// Serial device path
    pub device: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Give up waiting for the first fix after this long (`None` waits forever)
    #[serde(with = "optional_duration")]
    pub fix_timeout: Option<Duration>,
}

impl Default for GpsConfig {
    fn default() -> Self {
        GpsConfig {
            device: "/dev/ttyACM0".to_string(),
            baud_rate: 115_200,
            fix_timeout: None,
        }
    }
}

/// Static addressing of the WiFi-family transports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WifiConfig {
    /// Access point (receiver) data address
    pub ap_addr: SocketAddr,
    /// Station (sender) data address
    pub sta_addr: SocketAddr,
    /// Host wireless interface whose signal level is reported as RSSI.
    /// Used by every transport, since they all share the one radio.
    pub interface: Option<String>,
    /// Kernel wireless statistics table the signal level is read from
    pub wireless_stats: PathBuf,
}

impl Default for WifiConfig {
    fn default() -> Self {
        WifiConfig {
            ap_addr: SocketAddr::from((Ipv4Addr::new(192, 168, 4, 1), super::DATA_PORT)),
            sta_addr: SocketAddr::from((Ipv4Addr::new(192, 168, 4, 2), super::DATA_PORT)),
            interface: None,
            wireless_stats: PathBuf::from("/proc/net/wireless"),
        }
    }
}

/// Addressing of the link-layer transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Local hardware address; derived from the host when absent
    pub local_mac: Option<MacAddress>,
    /// Peer hardware address, or broadcast to accept from anyone
    pub peer_mac: MacAddress,
    /// Port of the host emulation of the broadcast medium
    pub emulation_port: u16,
    /// Broadcast address of the host emulation of the medium
    pub emulation_broadcast: Ipv4Addr,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            local_mac: None,
            peer_mac: MacAddress::BROADCAST,
            emulation_port: super::LINK_EMULATION_PORT,
            emulation_broadcast: Ipv4Addr::BROADCAST,
        }
    }
}

/// GPS based clock reconciliation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSyncConfig {
    /// GPS-UTC leap second count
    pub leap_seconds: i64,
    /// Offsets beyond this many microseconds are hard-set instead of slewed
    pub step_threshold_us: i64,
    /// Period of the background reconciliation
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub period: Duration,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        TimeSyncConfig {
            leap_seconds: super::GPS_LEAP_SECONDS,
            step_threshold_us: super::STEP_THRESHOLD_US,
            period: Duration::from_secs(30),
        }
    }
}

/// Output format of per-packet log records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Csv,
    Json,
}

/// Where receiver log records go
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// File receiving the records; tracing only when absent
    pub path: Option<PathBuf>,
    /// Record format of the file
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            path: None,
            format: LogFormat::Csv,
        }
    }
}

/// Configuration for a probe node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Role of this node
    pub role: DeviceRole,
    /// Transport under test
    pub transport: TransportKind,
    /// RF channel
    pub channel: u8,
    /// Requested transmit power in dBm, clamped to the regulatory ceiling
    pub tx_power_dbm: i8,
    /// Test packet payload size in bytes; must match on both ends
    pub payload_size: usize,
    /// Send rate in packets per second
    pub packet_rate_hz: u32,
    /// Regulatory settings
    pub regulatory: RegulatoryConfig,
    /// GPS receiver
    pub gps: GpsConfig,
    /// WiFi addressing
    pub wifi: WifiConfig,
    /// Link-layer addressing
    pub link: LinkConfig,
    /// Clock reconciliation
    pub sync: TimeSyncConfig,
    /// Window of the receiver loss statistics
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub stats_interval: Duration,
    /// Control loop period
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub tick_interval: Duration,
    /// Receiver log output
    pub log: LogConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            role: DeviceRole::Receiver,
            transport: TransportKind::Wifi4,
            channel: 6,
            tx_power_dbm: 20,
            payload_size: super::DEFAULT_PAYLOAD_SIZE,
            packet_rate_hz: 10,
            regulatory: RegulatoryConfig::default(),
            gps: GpsConfig::default(),
            wifi: WifiConfig::default(),
            link: LinkConfig::default(),
            sync: TimeSyncConfig::default(),
            stats_interval: Duration::from_secs(10),
            tick_interval: Duration::from_millis(1),
            log: LogConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Loads a configuration from a JSON file; missing fields take defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&text)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Interval between two sent packets
    pub fn send_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.packet_rate_hz.max(1)))
    }

    /// Total size of a test packet on the wire
    pub fn frame_len(&self) -> usize {
        crate::protocol::HEADER_LEN + self.payload_size
    }

    /// Checks the values against the selected transport
    pub fn validate(&self) -> Result<()> {
        if !(super::MIN_CHANNEL..=super::MAX_CHANNEL).contains(&self.channel) {
            return Err(Error::config(format!(
                "channel {} outside {}..={}",
                self.channel,
                super::MIN_CHANNEL,
                super::MAX_CHANNEL
            )));
        }
        if self.packet_rate_hz == 0 {
            return Err(Error::config("packet rate must be at least 1 Hz"));
        }
        if self.packet_rate_hz > 1000 {
            return Err(Error::config("packet rate above 1000 Hz cannot be paced"));
        }
        let max = self.transport.max_frame_len();
        if self.frame_len() > max {
            return Err(Error::config(format!(
                "{}-byte payload makes a {}-byte frame; {} carries at most {}",
                self.payload_size,
                self.frame_len(),
                self.transport,
                max
            )));
        }
        if self.regulatory.country.len() != 2 {
            return Err(Error::config(format!(
                "country code '{}' must have two letters",
                self.regulatory.country
            )));
        }
        if self.sync.step_threshold_us <= 0 {
            return Err(Error::config("step threshold must be positive"));
        }
        if self.sync.period.is_zero() || self.stats_interval.is_zero() || self.tick_interval.is_zero() {
            return Err(Error::config("periods must be non-zero"));
        }
        Ok(())
    }
}

mod optional_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<f64>::deserialize(deserializer)?;
        match secs {
            Some(s) if s.is_finite() && s >= 0.0 => Ok(Some(Duration::from_secs_f64(s))),
            Some(s) => Err(serde::de::Error::custom(format!("invalid duration: {}", s))),
            None => Ok(None),
        }
    }
}
