use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::network::{Delivery, FrameHandler};
use crate::protocol::GpsSnapshot;
use crate::record::{LogEntry, LogSink, LossReport};
use crate::time::{SharedClock, WallClock};
use crate::util::haversine_distance_m;

/// Sequence-gap loss accounting
///
/// Duplicates and reordered packets are not recognised: `last_seen` always
/// follows the newest arrival.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LossTracker {
    last_seen: Option<u32>,
    received: u64,
    lost: u64,
}

impl LossTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts for one arrival; returns the size of the gap it revealed
    pub fn observe(&mut self, sequence_number: u32) -> Option<u64> {
        let gap = self.last_seen.and_then(|last| {
            let expected = last.saturating_add(1);
            (sequence_number > expected).then(|| u64::from(sequence_number - expected))
        });

        if let Some(missing) = gap {
            self.lost += missing;
        }
        self.last_seen = Some(sequence_number);
        self.received += 1;
        gap
    }

    /// Closes the current window and starts a new one
    pub fn take_report(&mut self) -> LossReport {
        let report = LossReport::new(self.received, self.lost);
        self.received = 0;
        self.lost = 0;
        report
    }

    pub fn last_seen(&self) -> Option<u32> {
        self.last_seen
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn lost(&self) -> u64 {
        self.lost
    }
}

/// Radio parameters recorded with every packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkContext {
    pub transport: &'static str,
    pub tx_power_dbm: i8,
    pub channel: u8,
}

struct ReceiverShared {
    tracker: LossTracker,
    position: GpsSnapshot,
    sink: Box<dyn LogSink>,
}

/// Measures latency and loss of inbound test packets
///
/// State is shared between the control loop and the frame handler behind
/// one mutex; the handler only runs from the control task.
pub struct Receiver {
    shared: Arc<Mutex<ReceiverShared>>,
    stats_interval: Duration,
    last_report: Duration,
    started: Instant,
}

impl Receiver {
    pub fn new(sink: Box<dyn LogSink>, stats_interval: Duration) -> Self {
        Receiver {
            shared: Arc::new(Mutex::new(ReceiverShared {
                tracker: LossTracker::new(),
                position: GpsSnapshot::default(),
                sink,
            })),
            stats_interval,
            last_report: Duration::ZERO,
            started: Instant::now(),
        }
    }

    /// Handler to register with the transport
    pub fn handler(&self, clock: SharedClock, link: LinkContext) -> Box<dyn FrameHandler> {
        let shared = self.shared.clone();
        let started = self.started;
        Box::new(move |delivery: Delivery| {
            process_delivery(&shared, clock.as_ref(), link, started, delivery);
        })
    }

    /// Records where the receiver antenna currently is
    pub fn update_position(&self, position: GpsSnapshot) {
        lock(&self.shared).position = position;
    }

    /// Snapshot of the loss accounting
    pub fn tracker(&self) -> LossTracker {
        lock(&self.shared).tracker
    }

    /// Emits the loss report once per statistics window
    pub fn tick(&mut self, now: Duration) -> Option<LossReport> {
        if now.saturating_sub(self.last_report) < self.stats_interval {
            return None;
        }
        self.last_report = now;

        let mut shared = lock(&self.shared);
        let report = shared.tracker.take_report();
        match report.loss_rate_percent {
            Some(rate) => info!(
                "Packet statistics: received {}, lost {}, loss rate {:.2}%",
                report.received, report.lost, rate
            ),
            None => info!("Packet statistics: no packets in the last {:?}", self.stats_interval),
        }
        if let Err(e) = shared.sink.record_loss(&report) {
            warn!("Failed to record loss statistics: {}", e);
        }
        Some(report)
    }
}

fn process_delivery(
    shared: &Mutex<ReceiverShared>,
    clock: &dyn WallClock,
    link: LinkContext,
    started: Instant,
    delivery: Delivery,
) {
    let packet = delivery.packet;
    let queued_us = delivery.received_at.elapsed().as_micros() as i64;
    let now_us = clock.now_us();

    let mut shared = lock(shared);
    if let Some(missing) = shared.tracker.observe(packet.sequence_number) {
        warn!(
            "Detected {} dropped packets before sequence {}",
            missing, packet.sequence_number
        );
    }

    let receiver_timestamp_us = match now_us {
        Ok(now) => now - queued_us,
        Err(e) => {
            warn!("Cannot timestamp packet {}: {}", packet.sequence_number, e);
            return;
        }
    };
    let latency_us = receiver_timestamp_us - packet.sender_timestamp_us;
    let position = shared.position;
    let distance_m = haversine_distance_m(
        position.latitude,
        position.longitude,
        packet.sender_gps.latitude,
        packet.sender_gps.longitude,
    );

    let entry = LogEntry {
        uptime_ms: started.elapsed().as_millis() as u64,
        transport: link.transport,
        sequence_number: packet.sequence_number,
        sender_timestamp_us: packet.sender_timestamp_us,
        receiver_timestamp_us,
        latency_us,
        rssi_dbm: delivery.rssi,
        tx_power_dbm: link.tx_power_dbm,
        channel: link.channel,
        receiver_gps: position,
        sender_gps: packet.sender_gps,
        distance_m,
    };
    debug!(
        "Packet {} from {}: latency {} us, RSSI {} dBm, {:.1} m",
        entry.sequence_number, delivery.source, latency_us, delivery.rssi, distance_m
    );

    if let Err(e) = shared.sink.record(&entry) {
        warn!("Failed to record packet {}: {}", entry.sequence_number, e);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TestPacket;
    use crate::record::MemorySink;
    use crate::time::ManualClock;

    const NOW_US: i64 = 1_707_004_782_000_000;

    fn link() -> LinkContext {
        LinkContext {
            transport: "WiFi 4 (802.11n)",
            tx_power_dbm: 20,
            channel: 6,
        }
    }

    fn delivery(seq: u32, sender_ts: i64, sender_gps: GpsSnapshot) -> Delivery {
        Delivery {
            packet: TestPacket::new(seq, sender_ts, sender_gps, 75),
            rssi: -48,
            source: "192.168.4.2:5005".to_string(),
            received_at: Instant::now(),
        }
    }

    fn at(latitude: f64, longitude: f64) -> GpsSnapshot {
        GpsSnapshot {
            latitude,
            longitude,
            ..GpsSnapshot::default()
        }
    }

    #[test]
    fn test_gap_accounting() {
        let mut tracker = LossTracker::new();
        assert_eq!(tracker.observe(5), None);
        assert_eq!(tracker.observe(6), None);
        assert_eq!(tracker.observe(9), Some(2));

        assert_eq!(tracker.lost(), 2);
        assert_eq!(tracker.last_seen(), Some(9));
        assert_eq!(tracker.received(), 3);
    }

    #[test]
    fn test_first_packet_is_not_a_gap() {
        let mut tracker = LossTracker::new();
        assert_eq!(tracker.observe(1_000), None);
        assert_eq!(tracker.lost(), 0);
    }

    #[test]
    fn test_duplicates_and_reordering_pass_through() {
        let mut tracker = LossTracker::new();
        tracker.observe(10);
        tracker.observe(10);
        tracker.observe(8);
        assert_eq!(tracker.lost(), 0);
        assert_eq!(tracker.last_seen(), Some(8));
        assert_eq!(tracker.received(), 3);

        // Saturates at the top of the sequence range
        tracker.observe(u32::MAX);
        assert_eq!(tracker.observe(u32::MAX), None);
    }

    #[test]
    fn test_report_resets_window() {
        let mut tracker = LossTracker::new();
        for seq in [0, 1, 2, 5] {
            tracker.observe(seq);
        }
        let report = tracker.take_report();
        assert_eq!((report.received, report.lost), (4, 2));
        assert!((report.loss_rate_percent.unwrap() - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!((tracker.received(), tracker.lost()), (0, 0));
        assert_eq!(tracker.last_seen(), Some(5));
    }

    #[test]
    fn test_handler_logs_latency_and_distance() {
        let sink = MemorySink::new();
        let receiver = Receiver::new(Box::new(sink.clone()), Duration::from_secs(10));
        receiver.update_position(at(0.0, 0.0));

        let clock = Arc::new(ManualClock::new(NOW_US));
        let mut handler = receiver.handler(clock, link());
        handler.on_frame(delivery(0, NOW_US - 2_500, at(0.0, 1.0)));
        handler.on_frame(delivery(3, NOW_US - 1_000, at(0.0, 0.0)));

        let entries = sink.entries();
        assert_eq!(entries.len(), 2);

        let first = &entries[0];
        assert_eq!(first.transport, "WiFi 4 (802.11n)");
        assert_eq!(first.rssi_dbm, -48);
        assert_eq!((first.tx_power_dbm, first.channel), (20, 6));
        // Queueing age is subtracted, so latency can only shrink
        assert!(first.latency_us <= 2_500 && first.latency_us > 1_500);
        assert!((first.distance_m - 111_195.0).abs() < 50.0);
        assert_eq!(entries[1].distance_m, 0.0);

        let tracker = receiver.tracker();
        assert_eq!(tracker.lost(), 2);
        assert_eq!(tracker.last_seen(), Some(3));
    }

    #[test]
    fn test_clock_failure_still_counts_packet() {
        let sink = MemorySink::new();
        let receiver = Receiver::new(Box::new(sink.clone()), Duration::from_secs(10));
        let clock = Arc::new(ManualClock::new(NOW_US));
        clock.set_failing(true);

        let mut handler = receiver.handler(clock, link());
        handler.on_frame(delivery(0, NOW_US, at(0.0, 0.0)));

        assert!(sink.entries().is_empty());
        assert_eq!(receiver.tracker().received(), 1);
    }

    #[test]
    fn test_loss_report_every_window() {
        let sink = MemorySink::new();
        let mut receiver = Receiver::new(Box::new(sink.clone()), Duration::from_secs(10));
        let clock = Arc::new(ManualClock::new(NOW_US));
        let mut handler = receiver.handler(clock, link());

        for seq in [0, 1, 3] {
            handler.on_frame(delivery(seq, NOW_US, at(0.0, 0.0)));
        }

        assert!(receiver.tick(Duration::from_millis(9_999)).is_none());
        let report = receiver.tick(Duration::from_secs(10)).unwrap();
        assert_eq!(report, LossReport::new(3, 1));
        assert_eq!(report.loss_rate_percent, Some(25.0));

        // An empty window reports no rate
        let empty = receiver.tick(Duration::from_secs(20)).unwrap();
        assert_eq!(empty.loss_rate_percent, None);
        assert_eq!(sink.losses().len(), 2);
    }
}
