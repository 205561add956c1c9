use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::{
    DeviceRole, Error, LinkConfig, MacAddress, RegulatoryConfig, Result, TransportKind,
    LINK_MAX_FRAME_LEN,
};
use crate::protocol::{PacketCodec, TestPacket};
use super::radio::{Phy, RadioMode, SharedRadio};
use super::regulatory::{apply_radio_settings, RadioSettings};
use super::{Delivery, DeliveryQueue, FrameHandler, Transport, DELIVERY_QUEUE_DEPTH};

/// A frame as it came off the air, before any filtering
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub src: MacAddress,
    pub dst: MacAddress,
    pub data: Bytes,
    /// Signal level when the driver knows it
    pub rssi: Option<i8>,
    pub received_at: Instant,
}

/// Connectionless frame driver addressed by hardware address
#[async_trait]
pub trait LinkDriver: Send {
    fn local_mac(&self) -> MacAddress;

    /// Starts feeding every frame heard on the medium into `inbound`
    async fn start(&mut self, inbound: mpsc::Sender<RawFrame>) -> Result<()>;

    /// Puts one frame on the air for `dst`
    fn submit(&mut self, dst: MacAddress, frame: &[u8]) -> Result<()>;
}

/// Random locally administered unicast address
pub fn random_local_mac() -> MacAddress {
    let mut octets: [u8; 6] = rand::random();
    octets[0] = (octets[0] & 0xFC) | 0x02;
    MacAddress(octets)
}

/// Decides which raw frames are telemetry for this node
#[derive(Debug, Clone, Copy)]
struct LinkFilter {
    local: MacAddress,
    peer: MacAddress,
    codec: PacketCodec,
}

impl LinkFilter {
    fn accept(&self, raw: &RawFrame) -> Option<TestPacket> {
        if raw.src == self.local {
            return None;
        }
        if raw.dst != self.local && !raw.dst.is_broadcast() {
            return None;
        }
        if !self.peer.is_broadcast() && raw.src != self.peer {
            return None;
        }
        self.codec.decode_frame(&raw.data)
    }
}

/// Link-layer transport with a single registered peer
///
/// Registering the broadcast address accepts frames from any sender and
/// sends to everyone listening.
pub struct LinkLayerTransport {
    driver: Box<dyn LinkDriver>,
    radio: SharedRadio,
    codec: PacketCodec,
    peer: MacAddress,
    regulatory: RegulatoryConfig,
    queue: DeliveryQueue,
    settings: Option<RadioSettings>,
    started: bool,
}

impl LinkLayerTransport {
    pub fn new(
        driver: Box<dyn LinkDriver>,
        radio: SharedRadio,
        codec: PacketCodec,
        peer: MacAddress,
        regulatory: RegulatoryConfig,
    ) -> Self {
        LinkLayerTransport {
            driver,
            radio,
            codec,
            peer,
            regulatory,
            queue: DeliveryQueue::default(),
            settings: None,
            started: false,
        }
    }

    pub fn local_mac(&self) -> MacAddress {
        self.driver.local_mac()
    }

    pub fn peer(&self) -> MacAddress {
        self.peer
    }
}

#[async_trait]
impl Transport for LinkLayerTransport {
    async fn initialize(
        &mut self,
        channel: u8,
        requested_tx_power_dbm: i8,
        role: DeviceRole,
    ) -> Result<RadioSettings> {
        let settings = apply_radio_settings(
            self.radio.as_ref(),
            &self.regulatory,
            RadioMode::LinkOnly,
            Phy::for_transport(TransportKind::EspNow),
            channel,
            requested_tx_power_dbm,
        )?;

        if self.peer.is_broadcast() {
            info!("Link layer {} accepting frames from any peer", role.name());
        } else {
            info!("Link layer {} registered peer {}", role.name(), self.peer);
        }

        let (raw_tx, mut raw_rx) = mpsc::channel::<RawFrame>(DELIVERY_QUEUE_DEPTH);
        self.driver.start(raw_tx).await?;

        let filter = LinkFilter {
            local: self.driver.local_mac(),
            peer: self.peer,
            codec: self.codec,
        };
        let producer = self.queue.producer();
        let radio = self.radio.clone();

        tokio::spawn(async move {
            while let Some(raw) = raw_rx.recv().await {
                let Some(packet) = filter.accept(&raw) else {
                    continue;
                };
                let delivery = Delivery {
                    packet,
                    rssi: raw.rssi.unwrap_or_else(|| radio.rssi()),
                    source: raw.src.to_string(),
                    received_at: raw.received_at,
                };
                if !producer.push(delivery) && producer.is_closed() {
                    break;
                }
            }
        });

        info!("Link layer up as {} on channel {}", self.driver.local_mac(), channel);
        self.started = true;
        self.settings = Some(settings.clone());
        Ok(settings)
    }

    fn send(&mut self, frame: &[u8]) -> bool {
        if !self.started {
            debug!("Link layer send before initialization");
            return false;
        }
        if frame.len() > LINK_MAX_FRAME_LEN {
            warn!("Frame of {} bytes exceeds link layer limit of {}", frame.len(), LINK_MAX_FRAME_LEN);
            return false;
        }

        match self.driver.submit(self.peer, frame) {
            Ok(()) => true,
            Err(e) => {
                debug!("Link layer submit failed: {}", e);
                false
            }
        }
    }

    fn on_receive(&mut self, handler: Box<dyn FrameHandler>) {
        self.queue.set_handler(handler);
    }

    fn dispatch_pending(&mut self) -> usize {
        self.queue.dispatch()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::EspNow
    }

    fn settings(&self) -> Option<&RadioSettings> {
        self.settings.as_ref()
    }
}

/// Mean signal level of the in-memory medium
pub const MEDIUM_RSSI_MEAN_DBM: f64 = -55.0;
/// Spread of the in-memory medium signal level
pub const MEDIUM_RSSI_STD_DEV_DB: f64 = 3.0;

struct Air {
    stations: Vec<(MacAddress, mpsc::Sender<RawFrame>)>,
    drop_probability: f64,
    rssi_mean_dbm: f64,
    rssi_std_dev_db: f64,
    rng: StdRng,
}

/// Shared in-process medium every attached driver hears
///
/// Frames can be lost with a fixed probability and arrive with a normally
/// distributed signal level.
#[derive(Clone)]
pub struct MemoryMedium {
    air: Arc<Mutex<Air>>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Medium with reproducible losses and signal levels
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        MemoryMedium {
            air: Arc::new(Mutex::new(Air {
                stations: Vec::new(),
                drop_probability: 0.0,
                rssi_mean_dbm: MEDIUM_RSSI_MEAN_DBM,
                rssi_std_dev_db: MEDIUM_RSSI_STD_DEV_DB,
                rng,
            })),
        }
    }

    /// Probability in `[0, 1]` that a transmission is lost
    pub fn set_drop_probability(&self, probability: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&probability) {
            return Err(Error::config(format!("drop probability {} outside [0, 1]", probability)));
        }
        self.lock().drop_probability = probability;
        Ok(())
    }

    pub fn set_rssi_model(&self, mean_dbm: f64, std_dev_db: f64) -> Result<()> {
        if !std_dev_db.is_finite() || std_dev_db < 0.0 {
            return Err(Error::config(format!("invalid RSSI spread {}", std_dev_db)));
        }
        let mut air = self.lock();
        air.rssi_mean_dbm = mean_dbm;
        air.rssi_std_dev_db = std_dev_db;
        Ok(())
    }

    /// Creates a driver for a station with address `mac`
    pub fn attach(&self, mac: MacAddress) -> MemoryLinkDriver {
        MemoryLinkDriver {
            medium: self.clone(),
            mac,
        }
    }

    /// Puts raw bytes on the air; returns how many stations heard them
    pub fn transmit(&self, src: MacAddress, dst: MacAddress, data: &[u8]) -> usize {
        let mut air = self.lock();
        let drop_probability = air.drop_probability;
        if drop_probability > 0.0 && air.rng.gen_bool(drop_probability) {
            debug!("Medium dropped frame from {}", src);
            return 0;
        }

        let mean = air.rssi_mean_dbm;
        let spread = air.rssi_std_dev_db;
        let noise: f64 = air.rng.sample(StandardNormal);
        let rssi = (mean + spread * noise).round().clamp(i8::MIN as f64, 0.0) as i8;

        let frame = RawFrame {
            src,
            dst,
            data: Bytes::copy_from_slice(data),
            rssi: Some(rssi),
            received_at: Instant::now(),
        };

        air.stations.retain(|(_, tx)| !tx.is_closed());
        let mut heard = 0;
        for (mac, tx) in &air.stations {
            if *mac != src && tx.try_send(frame.clone()).is_ok() {
                heard += 1;
            }
        }
        heard
    }

    fn lock(&self) -> MutexGuard<'_, Air> {
        self.air.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for MemoryMedium {
    fn default() -> Self {
        Self::new()
    }
}

/// Station on a [`MemoryMedium`]
pub struct MemoryLinkDriver {
    medium: MemoryMedium,
    mac: MacAddress,
}

#[async_trait]
impl LinkDriver for MemoryLinkDriver {
    fn local_mac(&self) -> MacAddress {
        self.mac
    }

    async fn start(&mut self, inbound: mpsc::Sender<RawFrame>) -> Result<()> {
        self.medium.lock().stations.push((self.mac, inbound));
        Ok(())
    }

    fn submit(&mut self, dst: MacAddress, frame: &[u8]) -> Result<()> {
        self.medium.transmit(self.mac, dst, frame);
        Ok(())
    }
}

/// Largest datagram carrying an emulated link frame
const ENVELOPE_MAX_LEN: usize = 2048;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub(crate) src: [u8; 6],
    pub(crate) dst: [u8; 6],
    pub(crate) data: Vec<u8>,
}

/// Host emulation of a broadcast link over UDP broadcast
///
/// Every node binds the same port with address reuse and broadcasts
/// `bincode` envelopes carrying source and destination addresses.
pub struct UdpLinkDriver {
    mac: MacAddress,
    port: u16,
    broadcast: Ipv4Addr,
    socket: Option<Arc<UdpSocket>>,
}

impl UdpLinkDriver {
    pub fn new(mac: MacAddress, config: &LinkConfig) -> Self {
        UdpLinkDriver {
            mac,
            port: config.emulation_port,
            broadcast: config.emulation_broadcast,
            socket: None,
        }
    }

    fn open_socket(&self) -> Result<std::net::UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;

        let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port));
        socket
            .bind(&bind.into())
            .map_err(|e| Error::transport(format!("failed to bind link emulation {}: {}", bind, e)))?;
        Ok(socket.into())
    }
}

#[async_trait]
impl LinkDriver for UdpLinkDriver {
    fn local_mac(&self) -> MacAddress {
        self.mac
    }

    async fn start(&mut self, inbound: mpsc::Sender<RawFrame>) -> Result<()> {
        let socket = Arc::new(UdpSocket::from_std(self.open_socket()?)?);
        socket.writable().await?;
        let rx_socket = socket.clone();
        let local = self.mac;

        tokio::spawn(async move {
            let mut buf = vec![0u8; ENVELOPE_MAX_LEN];
            loop {
                let (len, from) = match rx_socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        debug!("Link emulation receive error: {}", e);
                        continue;
                    }
                };
                let envelope: Envelope = match bincode::deserialize(&buf[..len]) {
                    Ok(envelope) => envelope,
                    Err(_) => {
                        debug!("Ignoring non-link datagram from {}", from);
                        continue;
                    }
                };
                if MacAddress(envelope.src) == local {
                    continue;
                }

                let frame = RawFrame {
                    src: MacAddress(envelope.src),
                    dst: MacAddress(envelope.dst),
                    data: Bytes::from(envelope.data),
                    rssi: None,
                    received_at: Instant::now(),
                };
                if inbound.send(frame).await.is_err() {
                    break;
                }
            }
        });

        self.socket = Some(socket);
        Ok(())
    }

    fn submit(&mut self, dst: MacAddress, frame: &[u8]) -> Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| Error::invalid_state("link emulation not started"))?;
        let envelope = Envelope {
            src: self.mac.octets(),
            dst: dst.octets(),
            data: frame.to_vec(),
        };
        let datagram = bincode::serialize(&envelope)
            .map_err(|e| Error::transport(format!("envelope encoding failed: {}", e)))?;
        socket.try_send_to(&datagram, SocketAddr::from((self.broadcast, self.port)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::radio::SoftRadio;
    use crate::protocol::GpsSnapshot;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const SENDER: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x01]);
    const RECEIVER: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x02]);
    const STRANGER: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x03]);

    fn transport(medium: &MemoryMedium, mac: MacAddress, peer: MacAddress) -> LinkLayerTransport {
        LinkLayerTransport::new(
            Box::new(medium.attach(mac)),
            Arc::new(SoftRadio::new(mac)),
            PacketCodec::new(75),
            peer,
            RegulatoryConfig::default(),
        )
    }

    fn frame(seq: u32) -> Bytes {
        PacketCodec::new(75)
            .encode_packet(&TestPacket::new(seq, 1_000, GpsSnapshot::default(), 75))
            .unwrap()
    }

    async fn counting_receiver(
        medium: &MemoryMedium,
        peer: MacAddress,
    ) -> (LinkLayerTransport, Arc<AtomicUsize>) {
        let mut receiver = transport(medium, RECEIVER, peer);
        receiver.initialize(1, 20, DeviceRole::Receiver).await.unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        receiver.on_receive(Box::new(move |_d: Delivery| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        (receiver, count)
    }

    async fn settle(transport: &mut LinkLayerTransport) -> usize {
        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.dispatch_pending()
    }

    #[tokio::test]
    async fn test_frame_reaches_peer() {
        let medium = MemoryMedium::with_seed(7);
        let (mut receiver, count) = counting_receiver(&medium, MacAddress::BROADCAST).await;

        let mut sender = transport(&medium, SENDER, RECEIVER);
        let settings = sender.initialize(1, 20, DeviceRole::Sender).await.unwrap();
        assert_eq!(settings.mode, RadioMode::LinkOnly);

        assert!(sender.send(&frame(0)));
        assert!(sender.send(&frame(1)));

        assert_eq!(settle(&mut receiver).await, 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_malformed_length_is_discarded() {
        let medium = MemoryMedium::with_seed(7);
        let (mut receiver, count) = counting_receiver(&medium, MacAddress::BROADCAST).await;

        assert_eq!(medium.transmit(SENDER, RECEIVER, &[0u8; 8]), 1);
        assert_eq!(medium.transmit(SENDER, RECEIVER, &frame(3)[..118]), 1);

        assert_eq!(settle(&mut receiver).await, 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_address_filtering() {
        let medium = MemoryMedium::with_seed(7);
        let (mut receiver, count) = counting_receiver(&medium, SENDER).await;

        // Wrong source for a receiver bound to a specific peer
        medium.transmit(STRANGER, RECEIVER, &frame(0));
        // Addressed to somebody else
        medium.transmit(SENDER, STRANGER, &frame(1));
        assert_eq!(settle(&mut receiver).await, 0);

        medium.transmit(SENDER, MacAddress::BROADCAST, &frame(2));
        medium.transmit(SENDER, RECEIVER, &frame(3));
        assert_eq!(settle(&mut receiver).await, 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_send_limits() {
        let medium = MemoryMedium::with_seed(1);
        let mut sender = transport(&medium, SENDER, MacAddress::BROADCAST);
        assert!(!sender.send(&frame(0)));

        sender.initialize(1, 20, DeviceRole::Sender).await.unwrap();
        assert!(!sender.send(&[0u8; LINK_MAX_FRAME_LEN + 1]));
        assert!(sender.send(&[0u8; LINK_MAX_FRAME_LEN]));
    }

    #[tokio::test]
    async fn test_lossy_medium_is_best_effort() {
        let medium = MemoryMedium::with_seed(3);
        medium.set_drop_probability(1.0).unwrap();
        let (mut receiver, _count) = counting_receiver(&medium, MacAddress::BROADCAST).await;

        let mut sender = transport(&medium, SENDER, RECEIVER);
        sender.initialize(1, 20, DeviceRole::Sender).await.unwrap();
        // Submission succeeds even though nobody hears it
        assert!(sender.send(&frame(0)));
        assert_eq!(settle(&mut receiver).await, 0);

        assert!(medium.set_drop_probability(1.5).is_err());
    }

    #[tokio::test]
    async fn test_medium_rssi_model() {
        let medium = MemoryMedium::with_seed(11);
        medium.set_rssi_model(-70.0, 0.0).unwrap();
        let (raw_tx, mut raw_rx) = mpsc::channel(4);
        let mut station = medium.attach(RECEIVER);
        station.start(raw_tx).await.unwrap();

        medium.transmit(SENDER, RECEIVER, b"hello");
        let raw = raw_rx.recv().await.unwrap();
        assert_eq!(raw.rssi, Some(-70));
        assert_eq!(&raw.data[..], b"hello");
        assert!(medium.set_rssi_model(-70.0, -1.0).is_err());
    }

    #[test]
    fn test_random_mac_is_local_unicast() {
        for _ in 0..16 {
            let mac = random_local_mac();
            assert_eq!(mac.octets()[0] & 0x03, 0x02);
            assert!(!mac.is_broadcast());
        }
    }

    #[tokio::test]
    async fn test_udp_emulation_receives_envelopes() {
        let port = std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = LinkConfig {
            emulation_port: port,
            emulation_broadcast: Ipv4Addr::LOCALHOST,
            ..LinkConfig::default()
        };
        let mut driver = UdpLinkDriver::new(RECEIVER, &config);
        assert!(matches!(driver.submit(SENDER, b"x"), Err(Error::InvalidState(_))));

        let (raw_tx, mut raw_rx) = mpsc::channel(4);
        driver.start(raw_tx).await.unwrap();

        // Our own broadcasts come back and are skipped
        driver.submit(MacAddress::BROADCAST, b"echo").unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let envelope = Envelope {
            src: SENDER.octets(),
            dst: RECEIVER.octets(),
            data: vec![1, 2, 3],
        };
        peer.send_to(&bincode::serialize(&envelope).unwrap(), ("127.0.0.1", port))
            .await
            .unwrap();
        peer.send_to(b"not an envelope", ("127.0.0.1", port)).await.unwrap();

        let raw = tokio::time::timeout(Duration::from_secs(2), raw_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw.src, SENDER);
        assert_eq!(raw.dst, RECEIVER);
        assert_eq!(&raw.data[..], &[1, 2, 3]);
        assert_eq!(raw.rssi, None);
    }
}
