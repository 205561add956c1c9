//! Receiver log records and where they go

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::info;

use crate::core::{LogConfig, LogFormat, Result};
use crate::protocol::GpsSnapshot;

/// Column names of [`LogEntry::csv_line`]
pub const CSV_HEADER: &str = "uptime_ms,transport,sequence,sender_ts_us,receiver_ts_us,latency_us,\
latency_ms,rssi_dbm,tx_power_dbm,channel,rx_lat,rx_lon,rx_alt_mm,rx_sats,rx_hacc_mm,\
tx_lat,tx_lon,tx_alt_mm,tx_sats,tx_hacc_mm,distance_m";

/// One received test packet as seen by the receiver
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    /// Receiver monotonic time since start, for ordering
    pub uptime_ms: u64,
    pub transport: &'static str,
    pub sequence_number: u32,
    pub sender_timestamp_us: i64,
    pub receiver_timestamp_us: i64,
    /// One-way latency against the shared GPS time base
    pub latency_us: i64,
    pub rssi_dbm: i8,
    pub tx_power_dbm: i8,
    pub channel: u8,
    pub receiver_gps: GpsSnapshot,
    pub sender_gps: GpsSnapshot,
    /// Great-circle distance between the two antennas
    pub distance_m: f64,
}

impl LogEntry {
    pub fn csv_line(&self) -> String {
        let rx = &self.receiver_gps;
        let tx = &self.sender_gps;
        format!(
            "{},{},{},{},{},{},{:.3},{},{},{},{:.7},{:.7},{:.0},{},{},{:.7},{:.7},{:.0},{},{},{:.2}",
            self.uptime_ms,
            self.transport,
            self.sequence_number,
            self.sender_timestamp_us,
            self.receiver_timestamp_us,
            self.latency_us,
            self.latency_us as f64 / 1000.0,
            self.rssi_dbm,
            self.tx_power_dbm,
            self.channel,
            rx.latitude,
            rx.longitude,
            rx.altitude_mm,
            rx.satellites,
            rx.horizontal_accuracy_mm,
            tx.latitude,
            tx.longitude,
            tx.altitude_mm,
            tx.satellites,
            tx.horizontal_accuracy_mm,
            self.distance_m,
        )
    }
}

/// Loss statistics over one reporting window
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LossReport {
    pub received: u64,
    pub lost: u64,
    /// `lost / (lost + received) * 100`; `None` when nothing was expected
    pub loss_rate_percent: Option<f64>,
}

impl LossReport {
    pub fn new(received: u64, lost: u64) -> Self {
        let expected = received + lost;
        let loss_rate_percent = if expected == 0 {
            None
        } else {
            Some(lost as f64 / expected as f64 * 100.0)
        };
        LossReport {
            received,
            lost,
            loss_rate_percent,
        }
    }
}

/// Destination of receiver records
pub trait LogSink: Send {
    fn record(&mut self, entry: &LogEntry) -> Result<()>;

    fn record_loss(&mut self, _report: &LossReport) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writes every record as a CSV line through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn record(&mut self, entry: &LogEntry) -> Result<()> {
        info!(target: "linkprobe::record", "{}", entry.csv_line());
        Ok(())
    }
}

/// CSV with a header line, flushed after every record
pub struct CsvSink<W: Write + Send> {
    writer: W,
    header_written: bool,
}

impl<W: Write + Send> CsvSink<W> {
    pub fn new(writer: W) -> Self {
        CsvSink {
            writer,
            header_written: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl CsvSink<BufWriter<File>> {
    /// Creates or truncates `path`
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write + Send> LogSink for CsvSink<W> {
    fn record(&mut self, entry: &LogEntry) -> Result<()> {
        if !self.header_written {
            writeln!(self.writer, "{}", CSV_HEADER)?;
            self.header_written = true;
        }
        writeln!(self.writer, "{}", entry.csv_line())?;
        self.writer.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JsonRecord<'a> {
    Packet(&'a LogEntry),
    Loss(&'a LossReport),
}

/// One JSON object per line, packets and loss windows interleaved
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        JsonLinesSink { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write(&mut self, record: JsonRecord<'_>) -> Result<()> {
        serde_json::to_writer(&mut self.writer, &record)
            .map_err(|e| crate::core::Error::protocol(format!("JSON encoding failed: {}", e)))?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

impl JsonLinesSink<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write + Send> LogSink for JsonLinesSink<W> {
    fn record(&mut self, entry: &LogEntry) -> Result<()> {
        self.write(JsonRecord::Packet(entry))
    }

    fn record_loss(&mut self, report: &LossReport) -> Result<()> {
        self.write(JsonRecord::Loss(report))
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Captured {
    entries: Vec<LogEntry>,
    losses: Vec<LossReport>,
}

/// Keeps records in memory; clones share the same storage
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    inner: Arc<Mutex<Captured>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().entries.clone()
    }

    pub fn losses(&self) -> Vec<LossReport> {
        self.lock().losses.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Captured> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl LogSink for MemorySink {
    fn record(&mut self, entry: &LogEntry) -> Result<()> {
        self.lock().entries.push(entry.clone());
        Ok(())
    }

    fn record_loss(&mut self, report: &LossReport) -> Result<()> {
        self.lock().losses.push(*report);
        Ok(())
    }
}

/// Sink selected by the log configuration
pub fn open_sink(config: &LogConfig) -> Result<Box<dyn LogSink>> {
    let Some(path) = config.path.as_ref() else {
        return Ok(Box::new(TracingSink));
    };

    info!("Writing {:?} records to {}", config.format, path.display());
    let sink: Box<dyn LogSink> = match config.format {
        LogFormat::Csv => Box::new(CsvSink::create(path)?),
        LogFormat::Json => Box::new(JsonLinesSink::create(path)?),
    };
    Ok(sink)
}
