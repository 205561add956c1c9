use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::{Error, MacAddress, Result, TransportKind, MAX_CHANNEL, MIN_CHANNEL};

/// Operating mode of the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioMode {
    /// Access point; the receiver side of the WiFi transports
    AccessPoint,
    /// Station; the sender side of the WiFi transports
    Station,
    /// Connectionless link-layer frames only
    LinkOnly,
}

/// Physical layer standard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phy {
    /// 802.11n (WiFi 4)
    Ieee80211n,
    /// 802.11ax (WiFi 6)
    Ieee80211ax,
    /// Vendor long-range mode
    LongRange,
    /// 802.11b/g/n mix used by connectionless frames
    Legacy,
}

impl Phy {
    /// PHY each transport runs on
    pub fn for_transport(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Wifi4 => Phy::Ieee80211n,
            TransportKind::Wifi6 => Phy::Ieee80211ax,
            TransportKind::WifiLongRange => Phy::LongRange,
            TransportKind::EspNow => Phy::Legacy,
        }
    }
}

/// Configuration step of a radio bring-up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioStep {
    Country,
    Mode,
    Phy,
    Channel,
    TxPower,
}

impl fmt::Display for RadioStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RadioStep::Country => "country",
            RadioStep::Mode => "mode",
            RadioStep::Phy => "phy",
            RadioStep::Channel => "channel",
            RadioStep::TxPower => "tx power",
        };
        f.write_str(name)
    }
}

/// Vendor radio control surface
///
/// Methods take `&self` so receive tasks can sample the signal level while
/// the transport owns the bring-up.
pub trait RadioDriver: Send + Sync {
    fn set_country(&self, country: &str) -> Result<()>;
    fn set_mode(&self, mode: RadioMode) -> Result<()>;
    fn set_phy(&self, phy: Phy) -> Result<()>;
    fn set_channel(&self, channel: u8) -> Result<()>;
    fn set_max_tx_power(&self, dbm: i8) -> Result<()>;

    /// Signal strength of the last received frame in dBm
    fn rssi(&self) -> i8;

    /// Hardware address of the interface
    fn mac_address(&self) -> MacAddress;
}

/// Radio handle shared by a transport and its receive task
pub type SharedRadio = Arc<dyn RadioDriver>;

/// Settings a [`SoftRadio`] has been given
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RadioState {
    pub country: Option<String>,
    pub mode: Option<RadioMode>,
    pub phy: Option<Phy>,
    pub channel: Option<u8>,
    pub max_tx_power_dbm: Option<i8>,
}

/// Signal level reported when the radio has no reading
pub const UNKNOWN_RSSI_DBM: i8 = -127;

/// Radio driver for hosts where the interface is configured externally
///
/// Records every setting, validates the channel range and optionally reads
/// the signal level of an interface from `/proc/net/wireless`.
pub struct SoftRadio {
    mac: MacAddress,
    state: Mutex<RadioState>,
    wireless: Option<(PathBuf, String)>,
    fixed_rssi: i8,
    fail_on: Mutex<Option<RadioStep>>,
}

impl SoftRadio {
    pub fn new(mac: MacAddress) -> Self {
        SoftRadio {
            mac,
            state: Mutex::new(RadioState::default()),
            wireless: None,
            fixed_rssi: UNKNOWN_RSSI_DBM,
            fail_on: Mutex::new(None),
        }
    }

    /// Reads the signal level of `interface` from a wireless statistics file
    pub fn with_host_signal(mut self, path: impl AsRef<Path>, interface: impl Into<String>) -> Self {
        self.wireless = Some((path.as_ref().to_path_buf(), interface.into()));
        self
    }

    /// Reports a constant signal level instead of [`UNKNOWN_RSSI_DBM`]
    pub fn with_fixed_rssi(mut self, dbm: i8) -> Self {
        self.fixed_rssi = dbm;
        self
    }

    /// Makes the given bring-up step fail
    pub fn fail_on(&self, step: Option<RadioStep>) {
        *lock(&self.fail_on) = step;
    }

    /// Settings applied so far
    pub fn state(&self) -> RadioState {
        lock(&self.state).clone()
    }

    fn check(&self, step: RadioStep) -> Result<()> {
        if *lock(&self.fail_on) == Some(step) {
            return Err(Error::radio(format!("driver rejected {} setting", step)));
        }
        Ok(())
    }
}

impl RadioDriver for SoftRadio {
    fn set_country(&self, country: &str) -> Result<()> {
        self.check(RadioStep::Country)?;
        lock(&self.state).country = Some(country.to_string());
        Ok(())
    }

    fn set_mode(&self, mode: RadioMode) -> Result<()> {
        self.check(RadioStep::Mode)?;
        lock(&self.state).mode = Some(mode);
        Ok(())
    }

    fn set_phy(&self, phy: Phy) -> Result<()> {
        self.check(RadioStep::Phy)?;
        lock(&self.state).phy = Some(phy);
        Ok(())
    }

    fn set_channel(&self, channel: u8) -> Result<()> {
        self.check(RadioStep::Channel)?;
        if !(MIN_CHANNEL..=MAX_CHANNEL).contains(&channel) {
            return Err(Error::radio(format!("channel {} out of range", channel)));
        }
        lock(&self.state).channel = Some(channel);
        Ok(())
    }

    fn set_max_tx_power(&self, dbm: i8) -> Result<()> {
        self.check(RadioStep::TxPower)?;
        lock(&self.state).max_tx_power_dbm = Some(dbm);
        Ok(())
    }

    fn rssi(&self) -> i8 {
        self.wireless
            .as_ref()
            .and_then(|(path, iface)| {
                let text = std::fs::read_to_string(path).ok()?;
                parse_wireless_level(&text, iface)
            })
            .unwrap_or(self.fixed_rssi)
    }

    fn mac_address(&self) -> MacAddress {
        self.mac
    }
}

/// Extracts the signal level column for `interface`
///
/// ```text
/// Inter-| sta-|   Quality        |   Discarded packets
///  face | tus | link level noise |  nwid  crypt   frag
///  wlan0: 0000   54.  -56.  -256        0      0      0
/// ```
fn parse_wireless_level(text: &str, interface: &str) -> Option<i8> {
    text.lines().skip(2).find_map(|line| {
        let (name, rest) = line.trim().split_once(':')?;
        if name.trim() != interface {
            return None;
        }
        let level = rest.split_whitespace().nth(2)?;
        let level: f64 = level.trim_end_matches('.').parse().ok()?;
        Some(level.clamp(i8::MIN as f64, i8::MAX as f64) as i8)
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
