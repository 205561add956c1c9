use tracing::{info, warn};

use crate::core::{RegulatoryConfig, Result};
use super::radio::{Phy, RadioDriver, RadioMode};

/// Transmit power after the regulatory ceiling was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerClamp {
    pub requested_dbm: i8,
    pub applied_dbm: i8,
    pub clamped: bool,
}

/// Limits a requested transmit power to the ceiling, warning when it bites
pub fn clamp_tx_power(requested_dbm: i8, ceiling_dbm: i8) -> PowerClamp {
    if requested_dbm > ceiling_dbm {
        warn!(
            "Requested TX power {} dBm exceeds regulatory limit, clamping to {} dBm",
            requested_dbm, ceiling_dbm
        );
        PowerClamp {
            requested_dbm,
            applied_dbm: ceiling_dbm,
            clamped: true,
        }
    } else {
        PowerClamp {
            requested_dbm,
            applied_dbm: requested_dbm,
            clamped: false,
        }
    }
}

/// Radio configuration in effect after bring-up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioSettings {
    pub country: String,
    pub mode: RadioMode,
    pub phy: Phy,
    pub channel: u8,
    pub tx_power: PowerClamp,
}

impl RadioSettings {
    /// Transmit power actually configured
    pub fn tx_power_dbm(&self) -> i8 {
        self.tx_power.applied_dbm
    }
}

/// Applies region, mode, PHY, channel and clamped power in that order
///
/// The region goes first so the driver knows which channels and power
/// levels are legal before anything else is configured.
pub fn apply_radio_settings(
    radio: &dyn RadioDriver,
    regulatory: &RegulatoryConfig,
    mode: RadioMode,
    phy: Phy,
    channel: u8,
    requested_tx_power_dbm: i8,
) -> Result<RadioSettings> {
    radio.set_country(&regulatory.country)?;
    radio.set_mode(mode)?;
    radio.set_phy(phy)?;
    radio.set_channel(channel)?;

    let tx_power = clamp_tx_power(requested_tx_power_dbm, regulatory.max_tx_power_dbm);
    radio.set_max_tx_power(tx_power.applied_dbm)?;

    info!(
        "Radio configured: country {}, {:?}/{:?}, channel {}, {} dBm",
        regulatory.country, mode, phy, channel, tx_power.applied_dbm
    );

    Ok(RadioSettings {
        country: regulatory.country.clone(),
        mode,
        phy,
        channel,
        tx_power,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Error, MacAddress};
    use crate::network::radio::{RadioStep, SoftRadio};
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_clamp_emits_warning() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let clamp = tracing::subscriber::with_default(subscriber, || clamp_tx_power(40, 30));

        assert_eq!(clamp.applied_dbm, 30);
        assert!(clamp.clamped);
        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("WARN"));
        assert!(output.contains("clamping to 30 dBm"));
    }

    #[test]
    fn test_clamp_passes_legal_power() {
        assert_eq!(
            clamp_tx_power(20, 30),
            PowerClamp { requested_dbm: 20, applied_dbm: 20, clamped: false }
        );
        assert!(!clamp_tx_power(30, 30).clamped);
    }

    #[test]
    fn test_apply_settings() {
        let radio = SoftRadio::new(MacAddress([2, 0, 0, 0, 0, 7]));
        let settings = apply_radio_settings(
            &radio,
            &RegulatoryConfig::default(),
            RadioMode::Station,
            Phy::Ieee80211ax,
            6,
            40,
        )
        .unwrap();

        assert_eq!(settings.tx_power_dbm(), 30);
        assert_eq!(settings.country, "AU");
        let state = radio.state();
        assert_eq!(state.country.as_deref(), Some("AU"));
        assert_eq!(state.phy, Some(Phy::Ieee80211ax));
        assert_eq!(state.max_tx_power_dbm, Some(30));
    }

    #[test]
    fn test_apply_stops_at_failed_step() {
        let radio = SoftRadio::new(MacAddress::BROADCAST);
        radio.fail_on(Some(RadioStep::Channel));

        let result = apply_radio_settings(
            &radio,
            &RegulatoryConfig::default(),
            RadioMode::AccessPoint,
            Phy::Ieee80211n,
            6,
            20,
        );
        assert!(matches!(result, Err(Error::Radio(_))));
        assert_eq!(radio.state().max_tx_power_dbm, None);
    }
}
