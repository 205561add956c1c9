use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::core::{DeviceRole, Error, NodeConfig, Result};
use crate::network::Transport;
use crate::protocol::PacketCodec;
use crate::record::LogSink;
use crate::sync::TimeSync;
use crate::time::{wait_for_fix, GpsFix, GpsSource, SharedClock};
use super::receiver::{LinkContext, LossTracker, Receiver};
use super::sender::{Sender, SenderStats};
use super::RoleState;

/// Period of the GPS status line
pub const GPS_STATUS_INTERVAL: Duration = Duration::from_secs(1);

enum ActiveRole {
    Sender(Sender),
    Receiver(Receiver),
}

/// One probe node: a transport, a GPS receiver, a disciplined clock and a role
///
/// Everything runs on the task that drives [`run`](Self::run).
pub struct Node {
    config: NodeConfig,
    state: RoleState,
    transport: Box<dyn Transport>,
    gps: Box<dyn GpsSource>,
    sync: TimeSync,
    active: ActiveRole,
    next_status: Duration,
    halted: bool,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        transport: Box<dyn Transport>,
        gps: Box<dyn GpsSource>,
        clock: SharedClock,
        sink: Box<dyn LogSink>,
    ) -> Self {
        let active = match config.role {
            DeviceRole::Sender => ActiveRole::Sender(Sender::new(
                PacketCodec::new(config.payload_size),
                config.send_period(),
            )),
            DeviceRole::Receiver => ActiveRole::Receiver(Receiver::new(sink, config.stats_interval)),
        };
        let sync = TimeSync::new(clock, config.sync.clone());

        Node {
            config,
            state: RoleState::Uninitialized,
            transport,
            gps,
            sync,
            active,
            next_status: Duration::ZERO,
            halted: false,
        }
    }

    pub fn role(&self) -> DeviceRole {
        self.config.role
    }

    pub fn state(&self) -> RoleState {
        self.state
    }

    /// Whether bring-up failed in a way this role cannot survive
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn time_sync(&self) -> &TimeSync {
        &self.sync
    }

    pub fn sender_stats(&self) -> Option<SenderStats> {
        match &self.active {
            ActiveRole::Sender(sender) => Some(sender.stats()),
            ActiveRole::Receiver(_) => None,
        }
    }

    pub fn loss_tracker(&self) -> Option<LossTracker> {
        match &self.active {
            ActiveRole::Receiver(receiver) => Some(receiver.tracker()),
            ActiveRole::Sender(_) => None,
        }
    }

    /// Brings the role up: radio, first GPS fix, forced clock sync, handler
    ///
    /// A transport failure is fatal for the receiver and marks the node
    /// halted. The sender logs it and carries on, so every send fails.
    pub async fn initialize(&mut self) -> Result<()> {
        if self.state != RoleState::Uninitialized {
            return Err(Error::invalid_state(format!("role already {:?}", self.state)));
        }
        self.state = RoleState::Initializing;
        let role = self.config.role;
        info!("Initializing {} role over {}", role.name(), self.transport.name());

        match self
            .transport
            .initialize(self.config.channel, self.config.tx_power_dbm, role)
            .await
        {
            Ok(settings) => info!(
                "{} ready: channel {}, TX power {} dBm, {} byte packets at {} Hz",
                self.transport.name(),
                settings.channel,
                settings.tx_power_dbm(),
                self.config.frame_len(),
                self.config.packet_rate_hz
            ),
            Err(e) if role == DeviceRole::Receiver => {
                error!("Failed to initialize {}: {}", self.transport.name(), e);
                self.halted = true;
                return Err(e);
            }
            Err(e) => warn!("Failed to initialize {}, continuing: {}", self.transport.name(), e),
        }

        let fix = wait_for_fix(self.gps.as_mut(), self.config.gps.fix_timeout.into()).await?;

        match self.sync.reconcile(&fix, true) {
            Ok(outcome) => info!("Initial clock offset: {} us", outcome.offset_us),
            Err(e) => warn!("Initial clock sync failed: {}", e),
        }

        if let ActiveRole::Receiver(receiver) = &self.active {
            let link = LinkContext {
                transport: self.transport.name(),
                tx_power_dbm: self.transport.tx_power(),
                channel: self.transport.channel(),
            };
            let handler = receiver.handler(self.sync.clock().clone(), link);
            self.transport.on_receive(handler);
        }

        self.state = RoleState::Running;
        info!("{} role running", role.name());
        Ok(())
    }

    /// One pass of the control loop; `now` is time since the loop started
    pub fn step(&mut self, now: Duration) {
        if self.state != RoleState::Running {
            return;
        }

        if let Err(e) = self.gps.update() {
            debug!("GPS update failed: {}", e);
        }
        let fix = self.gps.latest();
        if now >= self.next_status {
            self.next_status = now + GPS_STATUS_INTERVAL;
            log_gps_status(&fix);
        }

        self.transport.dispatch_pending();

        match &mut self.active {
            ActiveRole::Sender(sender) => {
                sender.tick(now, self.transport.as_mut(), self.sync.clock().as_ref(), fix.position);
            }
            ActiveRole::Receiver(receiver) => {
                receiver.update_position(fix.position);
                receiver.tick(now);
            }
        }

        self.sync.maybe_reconcile(now, &fix);
    }

    /// Initializes and then runs the control loop forever
    ///
    /// Returns only when initialization fails for a reason other than a
    /// receiver transport failure, which idles the node instead.
    pub async fn run(mut self) -> Result<()> {
        if let Err(e) = self.initialize().await {
            if self.halted {
                error!("{} halted: {}", self.config.role.name(), e);
                return std::future::pending().await;
            }
            return Err(e);
        }

        let started = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            self.step(started.elapsed());
        }
    }
}

fn log_gps_status(fix: &GpsFix) {
    let p = &fix.position;
    info!(
        "GPS tow:{:.3}s sats:{} lat:{:.7} lon:{:.7} alt:{:.0}mm hacc:{}mm fix:{:?}",
        fix.ms_into_week as f64 / 1000.0,
        p.satellites,
        p.latitude,
        p.longitude,
        p.altitude_mm,
        p.horizontal_accuracy_mm,
        fix.fix_type
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MacAddress, RegulatoryConfig, TransportKind};
    use crate::network::{LinkLayerTransport, MemoryMedium, RadioStep, SoftRadio};
    use crate::protocol::GpsSnapshot;
    use crate::record::MemorySink;
    use crate::sync::gps_time_to_absolute;
    use crate::time::{ClockWrite, ManualClock, SimulatedGps, WallClock};
    use std::sync::Arc;

    const SENDER_MAC: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x0A]);
    const RECEIVER_MAC: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x0B]);

    fn t0() -> i64 {
        gps_time_to_absolute(2310, 100_000_000, 18)
    }

    fn at(latitude: f64, longitude: f64) -> GpsSnapshot {
        GpsSnapshot {
            latitude,
            longitude,
            altitude_mm: 10_000.0,
            satellites: 10,
            horizontal_accuracy_mm: 1_000,
        }
    }

    struct Harness {
        node: Node,
        clock: Arc<ManualClock>,
        radio: Arc<SoftRadio>,
        sink: MemorySink,
    }

    fn harness(
        role: DeviceRole,
        medium: &MemoryMedium,
        truth: &Arc<ManualClock>,
        clock_error_us: i64,
        position: GpsSnapshot,
    ) -> Harness {
        let (mac, peer) = match role {
            DeviceRole::Sender => (SENDER_MAC, RECEIVER_MAC),
            DeviceRole::Receiver => (RECEIVER_MAC, MacAddress::BROADCAST),
        };
        let config = NodeConfig {
            role,
            transport: TransportKind::EspNow,
            ..NodeConfig::default()
        };
        let radio = Arc::new(SoftRadio::new(mac));
        let transport = LinkLayerTransport::new(
            Box::new(medium.attach(mac)),
            radio.clone(),
            PacketCodec::new(config.payload_size),
            peer,
            RegulatoryConfig::default(),
        );
        let gps = SimulatedGps::new(truth.clone(), position, 18);
        let clock = Arc::new(ManualClock::new(t0() + clock_error_us));
        let sink = MemorySink::new();

        let node = Node::new(
            config,
            Box::new(transport),
            Box::new(gps),
            clock.clone(),
            Box::new(sink.clone()),
        );
        Harness { node, clock, radio, sink }
    }

    #[tokio::test]
    async fn test_sender_to_receiver_over_one_second() {
        let truth = Arc::new(ManualClock::new(t0()));
        let medium = MemoryMedium::with_seed(5);
        let mut rx = harness(DeviceRole::Receiver, &medium, &truth, -300, at(0.0, 0.0));
        let mut tx = harness(DeviceRole::Sender, &medium, &truth, 5_000_000, at(0.0, 0.001));

        rx.node.initialize().await.unwrap();
        tx.node.initialize().await.unwrap();
        assert_eq!(rx.node.state(), RoleState::Running);
        assert_eq!(tx.node.state(), RoleState::Running);

        // Both clocks were forced onto GPS time
        assert_eq!(tx.clock.writes(), vec![ClockWrite::Set(t0())]);
        assert_eq!(rx.clock.writes(), vec![ClockWrite::Set(t0())]);
        assert_eq!(tx.node.time_sync().offset().last_offset_us, Some(5_000_000));

        for ms in 0..1_000u64 {
            let now = Duration::from_millis(ms);
            tx.node.step(now);
            tokio::task::yield_now().await;
            rx.node.step(now);
            for clock in [&truth, &tx.clock, &rx.clock] {
                clock.advance(Duration::from_millis(1));
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        rx.node.step(Duration::from_millis(1_000));

        assert_eq!(tx.node.sender_stats(), Some(SenderStats { sent: 10, failed: 0 }));
        let entries = rx.sink.entries();
        let seqs: Vec<u32> = entries.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, (0..10).collect::<Vec<u32>>());
        for entry in &entries {
            assert!(entry.latency_us.abs() < 2_000, "latency {}", entry.latency_us);
            assert!((entry.distance_m - 111.2).abs() < 1.0);
            assert_eq!(entry.transport, "ESP-NOW");
            assert_eq!((entry.tx_power_dbm, entry.channel), (20, 6));
        }
        assert_eq!(rx.node.loss_tracker().unwrap().lost(), 0);
    }

    #[tokio::test]
    async fn test_receiver_halts_without_transport() {
        let truth = Arc::new(ManualClock::new(t0()));
        let medium = MemoryMedium::with_seed(1);
        let mut rx = harness(DeviceRole::Receiver, &medium, &truth, 0, at(0.0, 0.0));
        rx.radio.fail_on(Some(RadioStep::Channel));

        assert!(matches!(rx.node.initialize().await, Err(Error::Radio(_))));
        assert!(rx.node.is_halted());
        assert_eq!(rx.node.state(), RoleState::Initializing);
        assert!(rx.clock.writes().is_empty());

        rx.node.step(Duration::from_secs(1));
        assert!(rx.sink.entries().is_empty());
    }

    #[tokio::test]
    async fn test_sender_continues_without_transport() {
        let truth = Arc::new(ManualClock::new(t0()));
        let medium = MemoryMedium::with_seed(1);
        let mut tx = harness(DeviceRole::Sender, &medium, &truth, 0, at(0.0, 0.0));
        tx.radio.fail_on(Some(RadioStep::TxPower));

        tx.node.initialize().await.unwrap();
        assert!(!tx.node.is_halted());
        assert_eq!(tx.node.state(), RoleState::Running);

        tx.node.step(Duration::ZERO);
        tx.node.step(Duration::from_millis(100));
        assert_eq!(tx.node.sender_stats(), Some(SenderStats { sent: 0, failed: 2 }));
    }

    #[tokio::test]
    async fn test_bounded_fix_wait() {
        let truth = Arc::new(ManualClock::new(t0()));
        let medium = MemoryMedium::with_seed(1);
        let mut tx = harness(DeviceRole::Sender, &medium, &truth, 0, at(0.0, 0.0));
        tx.node.config.gps.fix_timeout = Some(Duration::from_millis(150));
        tx.node.gps = Box::new(SimulatedGps::new(truth.clone(), at(0.0, 0.0), 18).acquire_after(u32::MAX));

        assert!(matches!(tx.node.initialize().await, Err(Error::Timeout(_))));
        assert!(!tx.node.is_halted());
        assert!(matches!(tx.node.initialize().await, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_periodic_resync_while_running() {
        let truth = Arc::new(ManualClock::new(t0()));
        let medium = MemoryMedium::with_seed(1);
        let mut rx = harness(DeviceRole::Receiver, &medium, &truth, 0, at(0.0, 0.0));
        rx.node.initialize().await.unwrap();

        // Drift 40 ms away from GPS time before the first periodic sync
        rx.clock.advance(Duration::from_millis(40));
        rx.node.step(Duration::from_secs(29));
        assert_eq!(rx.clock.writes().len(), 1);

        rx.node.step(Duration::from_secs(30));
        assert_eq!(rx.clock.writes().last(), Some(&ClockWrite::Slew(-40_000)));
        assert_eq!(rx.clock.now_us().unwrap(), truth.now_us().unwrap());
    }
}
