use std::io::Read;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serialport::SerialPort;
use tracing::{debug, trace};

use crate::core::{Error, GpsConfig, Result};
use crate::sync::epoch::absolute_to_gps_time;
use super::gps::{FixType, GpsFix, GpsSource};

/// User equivalent range error used to turn HDOP into metres when the
/// receiver does not emit GST
const UERE_M: f64 = 5.0;

/// Longest NMEA sentence we accept before discarding the line
const MAX_SENTENCE_LEN: usize = 120;

/// Incremental NMEA 0183 sentence interpreter
///
/// Understands RMC (time, date, validity), GGA (position, satellites,
/// quality), GSA (2-D/3-D) and GST (accuracy) from any talker.
#[derive(Debug, Clone)]
pub struct NmeaParser {
    leap_seconds: i64,
    fix: GpsFix,
    time_valid: bool,
    gga_quality: u8,
    gsa_mode: Option<FixType>,
    hdop: f64,
    gst_accuracy_m: Option<f64>,
}

impl NmeaParser {
    pub fn new(leap_seconds: i64) -> Self {
        NmeaParser {
            leap_seconds,
            fix: GpsFix::none(),
            time_valid: false,
            gga_quality: 0,
            gsa_mode: None,
            hdop: 99.99,
            gst_accuracy_m: None,
        }
    }

    /// Current solution
    pub fn fix(&self) -> GpsFix {
        self.fix
    }

    /// Interprets one sentence received just now
    pub fn feed(&mut self, sentence: &str) -> Result<()> {
        self.feed_at(sentence, Instant::now())
    }

    /// Interprets one sentence whose bytes arrived at `received_at`
    ///
    /// Unknown or corrupt sentences are ignored. NMEA is ASCII only, so any
    /// other character marks line noise.
    pub fn feed_at(&mut self, sentence: &str, received_at: Instant) -> Result<()> {
        let body = match checked_body(sentence.trim()) {
            Some(body) if body.is_ascii() => body,
            _ => {
                trace!("dropping corrupt NMEA line: {}", sentence.trim());
                return Ok(());
            }
        };

        let fields: Vec<&str> = body.split(',').collect();
        let kind = fields[0].get(2..).unwrap_or("");
        match kind {
            "RMC" => self.parse_rmc(&fields, received_at)?,
            "GGA" => self.parse_gga(&fields)?,
            "GSA" => self.parse_gsa(&fields),
            "GST" => self.parse_gst(&fields),
            _ => return Ok(()),
        }

        self.refresh_fix_type();
        Ok(())
    }

    /// Parses RMC (Recommended Minimum) sentence
    fn parse_rmc(&mut self, fields: &[&str], received_at: Instant) -> Result<()> {
        if fields.len() < 10 {
            return Ok(());
        }

        self.time_valid = fields[2] == "A";
        if !self.time_valid || fields[1].len() < 6 || fields[9].len() != 6 {
            return Ok(());
        }

        let time = parse_hms(fields[1])?;
        let day = number::<u32>(fields[9], 0..2, "Invalid GPS date format")?;
        let month = number::<u32>(fields[9], 2..4, "Invalid GPS date format")?;
        let year = 2000 + number::<i32>(fields[9], 4..6, "Invalid GPS date format")?;
        let date = NaiveDate::from_ymd_opt(year, month, day)
            .ok_or_else(|| Error::gps("Invalid GPS date"))?;

        let utc = NaiveDateTime::new(date, time).and_utc();
        let (week, ms_into_week) = absolute_to_gps_time(utc.timestamp_micros(), self.leap_seconds)
            .ok_or_else(|| Error::gps("GPS date before the GPS epoch"))?;
        self.fix.week = week;
        self.fix.ms_into_week = ms_into_week;
        self.fix.time_captured = Some(received_at);
        Ok(())
    }

    /// Parses GGA (fix data) sentence
    fn parse_gga(&mut self, fields: &[&str]) -> Result<()> {
        if fields.len() < 10 {
            return Ok(());
        }

        self.gga_quality = fields[6].parse().unwrap_or(0);
        self.fix.position.satellites = fields[7].parse().unwrap_or(0);
        if let Ok(hdop) = fields[8].parse::<f64>() {
            self.hdop = hdop;
        }
        if self.gga_quality == 0 {
            return Ok(());
        }

        if let (Some(lat), Some(lon)) = (
            parse_coordinate(fields[2], fields[3])?,
            parse_coordinate(fields[4], fields[5])?,
        ) {
            self.fix.position.latitude = lat;
            self.fix.position.longitude = lon;
        }
        if let Ok(alt_m) = fields[9].parse::<f64>() {
            self.fix.position.altitude_mm = alt_m * 1000.0;
        }
        Ok(())
    }

    /// Parses GSA (DOP and active satellites) sentence
    fn parse_gsa(&mut self, fields: &[&str]) {
        if fields.len() < 3 {
            return;
        }
        self.gsa_mode = match fields[2] {
            "3" => Some(FixType::Fix3D),
            "2" => Some(FixType::Fix2D),
            _ => Some(FixType::NoFix),
        };
    }

    /// Parses GST (pseudorange error statistics) sentence
    fn parse_gst(&mut self, fields: &[&str]) {
        if fields.len() < 8 {
            return;
        }
        if let (Ok(lat_err), Ok(lon_err)) = (fields[6].parse::<f64>(), fields[7].parse::<f64>()) {
            self.gst_accuracy_m = Some((lat_err * lat_err + lon_err * lon_err).sqrt());
        }
    }

    fn refresh_fix_type(&mut self) {
        let solution = match self.gsa_mode {
            Some(mode) => mode,
            // Without GSA, a GGA solution from four or more satellites is 3-D
            None if self.gga_quality > 0 && self.fix.position.satellites >= 4 => FixType::Fix3D,
            None if self.gga_quality > 0 => FixType::Fix2D,
            None => FixType::NoFix,
        };

        self.fix.fix_type = if self.gga_quality > 0 && self.time_valid {
            solution
        } else {
            FixType::NoFix
        };

        let accuracy_m = self.gst_accuracy_m.unwrap_or(self.hdop * UERE_M);
        self.fix.position.horizontal_accuracy_mm = (accuracy_m * 1000.0).round().min(u32::MAX as f64) as u32;
    }
}

/// Strips `$` and `*hh`, returning the body when the checksum matches
fn checked_body(sentence: &str) -> Option<&str> {
    let rest = sentence.strip_prefix('$')?;
    let (body, checksum) = rest.rsplit_once('*')?;
    let expected = u8::from_str_radix(checksum.get(..2)?, 16).ok()?;
    let actual = body.bytes().fold(0u8, |acc, b| acc ^ b);
    (actual == expected && body.len() >= 5).then_some(body)
}

/// Parses `field[range]`, failing on short fields and split characters
fn number<T: std::str::FromStr>(field: &str, range: std::ops::Range<usize>, what: &'static str) -> Result<T> {
    field
        .get(range)
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(|| Error::gps(what))
}

fn parse_hms(field: &str) -> Result<NaiveTime> {
    let hour = number::<u32>(field, 0..2, "Invalid GPS time format")?;
    let minute = number::<u32>(field, 2..4, "Invalid GPS time format")?;
    let seconds = number::<f64>(field, 4..field.len(), "Invalid GPS time format")?;

    let whole = seconds.trunc() as u32;
    let micros = ((seconds - seconds.trunc()) * 1_000_000.0).round() as u32;
    NaiveTime::from_hms_micro_opt(hour, minute, whole, micros.min(999_999))
        .ok_or_else(|| Error::gps("Invalid GPS time"))
}

/// Converts `ddmm.mmmm` / `dddmm.mmmm` plus hemisphere to signed degrees
fn parse_coordinate(value: &str, hemisphere: &str) -> Result<Option<f64>> {
    if value.is_empty() {
        return Ok(None);
    }
    let dot = value.find('.').unwrap_or(value.len());
    if dot < 3 {
        return Err(Error::gps(format!("Invalid coordinate '{}'", value)));
    }

    let invalid = || Error::gps(format!("Invalid coordinate '{}'", value));
    let degrees = value.get(..dot - 2).and_then(|d| d.parse::<f64>().ok()).ok_or_else(invalid)?;
    let minutes = value.get(dot - 2..).and_then(|m| m.parse::<f64>().ok()).ok_or_else(invalid)?;
    let magnitude = degrees + minutes / 60.0;

    match hemisphere {
        "N" | "E" => Ok(Some(magnitude)),
        "S" | "W" => Ok(Some(-magnitude)),
        other => Err(Error::gps(format!("Invalid hemisphere '{}'", other))),
    }
}

/// GPS receiver emitting NMEA over a serial port
pub struct NmeaGps {
    /// Serial port for GPS data
    port: Box<dyn SerialPort>,
    /// Partial line carried between reads
    line: Vec<u8>,
    parser: NmeaParser,
}

impl NmeaGps {
    /// Opens a GPS receiver device
    pub fn open(config: &GpsConfig, leap_seconds: i64) -> Result<Self> {
        let port = serialport::new(config.device.as_str(), config.baud_rate)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(|e| Error::gps(format!("Failed to open GPS device {}: {}", config.device, e)))?;

        debug!("GPS serial port {} open at {} baud", config.device, config.baud_rate);
        Ok(NmeaGps {
            port,
            line: Vec::with_capacity(MAX_SENTENCE_LEN),
            parser: NmeaParser::new(leap_seconds),
        })
    }

    fn consume(&mut self, bytes: &[u8], received_at: Instant) {
        for &byte in bytes {
            match byte {
                b'\n' => {
                    let line = String::from_utf8_lossy(&self.line).into_owned();
                    self.line.clear();
                    if let Err(e) = self.parser.feed_at(&line, received_at) {
                        debug!("Ignoring NMEA sentence: {}", e);
                    }
                }
                b'\r' => {}
                _ if self.line.len() >= MAX_SENTENCE_LEN => self.line.clear(),
                _ => self.line.push(byte),
            }
        }
    }
}

impl GpsSource for NmeaGps {
    fn update(&mut self) -> Result<()> {
        let available = self.port.bytes_to_read()
            .map_err(|e| Error::gps(format!("GPS port error: {}", e)))? as usize;
        if available == 0 {
            return Ok(());
        }

        let mut buf = vec![0u8; available.min(4096)];
        let n = match self.port.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => 0,
            Err(e) => return Err(e.into()),
        };
        self.consume(&buf[..n], Instant::now());
        Ok(())
    }

    fn latest(&self) -> GpsFix {
        self.parser.fix()
    }
}
