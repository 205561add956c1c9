use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{Error, Result};

/// Which side of the link this node plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    /// Generates and transmits test packets
    Sender,
    /// Receives test packets and measures latency and loss
    Receiver,
}

impl DeviceRole {
    /// Human readable role name
    pub fn name(&self) -> &'static str {
        match self {
            DeviceRole::Sender => "Sender",
            DeviceRole::Receiver => "Receiver",
        }
    }
}

impl FromStr for DeviceRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sender" | "tx" => Ok(DeviceRole::Sender),
            "receiver" | "rx" => Ok(DeviceRole::Receiver),
            other => Err(Error::config(format!("unknown device role '{}'", other))),
        }
    }
}

/// Radio transport selected for a test run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// 802.11 b/g/n datagrams
    Wifi4,
    /// 802.11 b/g/n/ax datagrams
    Wifi6,
    /// Vendor long range WiFi mode
    WifiLongRange,
    /// Connectionless link-layer frames between hardware addresses
    EspNow,
}

impl TransportKind {
    /// Name recorded in every log line
    pub fn display_name(&self) -> &'static str {
        match self {
            TransportKind::Wifi4 => "WiFi 4 (802.11n)",
            TransportKind::Wifi6 => "WiFi 6 (802.11ax)",
            TransportKind::WifiLongRange => "WiFi Long Range",
            TransportKind::EspNow => "ESP-NOW",
        }
    }

    /// Whether this transport runs over the WiFi datagram stack
    pub fn is_wifi(&self) -> bool {
        !matches!(self, TransportKind::EspNow)
    }

    /// Largest frame the transport can carry in one submission
    pub fn max_frame_len(&self) -> usize {
        match self {
            TransportKind::EspNow => super::LINK_MAX_FRAME_LEN,
            _ => super::UDP_MAX_FRAME_LEN,
        }
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "wifi4" | "wifi-4" => Ok(TransportKind::Wifi4),
            "wifi6" | "wifi-6" => Ok(TransportKind::Wifi6),
            "wifi-lr" | "wifi-long-range" | "lr" => Ok(TransportKind::WifiLongRange),
            "espnow" | "esp-now" | "link" => Ok(TransportKind::EspNow),
            other => Err(Error::config(format!("unknown transport '{}'", other))),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// 6-byte hardware address used by the link-layer transport
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Reserved address meaning "accept frames from any peer"
    pub const BROADCAST: MacAddress = MacAddress([0xFF; 6]);

    /// Returns true for the all-ones broadcast address
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Raw address bytes
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({})", self)
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(Error::config(format!("invalid MAC address '{}'", s)));
        }

        let mut bytes = [0u8; 6];
        for (slot, part) in bytes.iter_mut().zip(parts) {
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| Error::config(format!("invalid MAC address '{}'", s)))?;
        }
        Ok(MacAddress(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddress = "24:6f:28:0A:bc:01".parse().unwrap();
        assert_eq!(mac.octets(), [0x24, 0x6F, 0x28, 0x0A, 0xBC, 0x01]);
        assert_eq!(mac.to_string(), "24:6F:28:0A:BC:01");
        assert!(!mac.is_broadcast());

        let any: MacAddress = "ff-ff-ff-ff-ff-ff".parse().unwrap();
        assert!(any.is_broadcast());
    }

    #[test]
    fn test_mac_rejects_garbage() {
        assert!("24:6f:28".parse::<MacAddress>().is_err());
        assert!("zz:00:00:00:00:00".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_transport_names() {
        assert_eq!("esp-now".parse::<TransportKind>().unwrap(), TransportKind::EspNow);
        assert_eq!("wifi_lr".parse::<TransportKind>().unwrap(), TransportKind::WifiLongRange);
        assert!(TransportKind::Wifi6.is_wifi());
        assert!(!TransportKind::EspNow.is_wifi());
        assert_eq!(TransportKind::EspNow.max_frame_len(), 250);
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("RX".parse::<DeviceRole>().unwrap(), DeviceRole::Receiver);
        assert!("relay".parse::<DeviceRole>().is_err());
    }
}
