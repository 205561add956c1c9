//! Radio transports under test
//!
//! Every transport moves the same fixed-size test frames. Receive tasks only
//! decode and queue; the registered [`FrameHandler`] runs on the control task
//! when it calls [`Transport::dispatch_pending`], so handler state never sees
//! two frames at once.

pub mod link;
pub mod radio;
pub mod regulatory;
pub mod wifi;

pub use self::link::{LinkDriver, LinkLayerTransport, MemoryMedium, RawFrame, UdpLinkDriver};
pub use self::radio::{Phy, RadioDriver, RadioMode, RadioStep, SharedRadio, SoftRadio, UNKNOWN_RSSI_DBM};
pub use self::regulatory::{apply_radio_settings, clamp_tx_power, PowerClamp, RadioSettings};
pub use self::wifi::WifiTransport;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::{DeviceRole, NodeConfig, Result, TransportKind};
use crate::protocol::{PacketCodec, TestPacket};

/// Depth of the queue between a receive task and the control task
pub const DELIVERY_QUEUE_DEPTH: usize = 256;

/// A decoded telemetry frame waiting for dispatch
#[derive(Debug, Clone)]
pub struct Delivery {
    pub packet: TestPacket,
    /// Signal strength at reception in dBm
    pub rssi: i8,
    /// Sender address as seen by the transport
    pub source: String,
    /// Arrival at the receive task
    pub received_at: Instant,
}

/// Consumer of inbound telemetry
pub trait FrameHandler: Send {
    fn on_frame(&mut self, delivery: Delivery);
}

impl<F> FrameHandler for F
where
    F: FnMut(Delivery) + Send,
{
    fn on_frame(&mut self, delivery: Delivery) {
        self(delivery)
    }
}

/// Interchangeable radio transport
#[async_trait]
pub trait Transport: Send {
    /// Brings the radio up for `role`; fails only when the radio cannot be
    /// configured at all
    async fn initialize(
        &mut self,
        channel: u8,
        requested_tx_power_dbm: i8,
        role: DeviceRole,
    ) -> Result<RadioSettings>;

    /// Submits one frame; `false` only when the radio refused it outright
    fn send(&mut self, frame: &[u8]) -> bool;

    /// Registers the consumer of inbound telemetry, replacing any previous one
    fn on_receive(&mut self, handler: Box<dyn FrameHandler>);

    /// Hands queued frames to the handler; returns how many were delivered
    fn dispatch_pending(&mut self) -> usize;

    /// Human readable transport name
    fn name(&self) -> &'static str {
        self.kind().display_name()
    }

    fn kind(&self) -> TransportKind;

    /// Settings in effect once initialized
    fn settings(&self) -> Option<&RadioSettings>;

    /// Configured transmit power, zero before initialization
    fn tx_power(&self) -> i8 {
        self.settings().map(RadioSettings::tx_power_dbm).unwrap_or(0)
    }

    /// Configured channel, zero before initialization
    fn channel(&self) -> u8 {
        self.settings().map(|s| s.channel).unwrap_or(0)
    }
}

/// Bounded hand-off from receive tasks to the control task
pub struct DeliveryQueue {
    tx: mpsc::Sender<Delivery>,
    rx: mpsc::Receiver<Delivery>,
    handler: Option<Box<dyn FrameHandler>>,
}

impl DeliveryQueue {
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(depth);
        DeliveryQueue { tx, rx, handler: None }
    }

    /// Producer side for a receive task
    pub fn producer(&self) -> DeliveryProducer {
        DeliveryProducer { tx: self.tx.clone() }
    }

    pub fn set_handler(&mut self, handler: Box<dyn FrameHandler>) {
        self.handler = Some(handler);
    }

    /// Drains the queue into the handler; frames arriving with no handler
    /// registered are dropped
    pub fn dispatch(&mut self) -> usize {
        let mut delivered = 0;
        while let Ok(delivery) = self.rx.try_recv() {
            match self.handler.as_mut() {
                Some(handler) => {
                    handler.on_frame(delivery);
                    delivered += 1;
                }
                None => debug!(
                    "Dropping frame {} with no receive handler",
                    delivery.packet.sequence_number
                ),
            }
        }
        delivered
    }
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new(DELIVERY_QUEUE_DEPTH)
    }
}

/// Sending half of a [`DeliveryQueue`]
#[derive(Clone)]
pub struct DeliveryProducer {
    tx: mpsc::Sender<Delivery>,
}

impl DeliveryProducer {
    /// Queues a delivery without waiting; returns false when the control
    /// task has fallen behind or is gone
    pub fn push(&self, delivery: Delivery) -> bool {
        match self.tx.try_send(delivery) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(d)) => {
                debug!("Delivery queue full, dropping frame {}", d.packet.sequence_number);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// The transport owning the queue has been dropped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Builds the transport selected by `config` over a host-configured radio
pub fn open_transport(config: &NodeConfig) -> Result<Box<dyn Transport>> {
    let codec = PacketCodec::new(config.payload_size);
    let local_mac = config.link.local_mac.unwrap_or_else(link::random_local_mac);
    let mut radio = SoftRadio::new(local_mac);
    match &config.wifi.interface {
        Some(iface) => radio = radio.with_host_signal(&config.wifi.wireless_stats, iface.as_str()),
        None => warn!("No wireless interface configured; RSSI recorded as {} dBm", UNKNOWN_RSSI_DBM),
    }
    let radio: SharedRadio = Arc::new(radio);

    let transport: Box<dyn Transport> = if config.transport.is_wifi() {
        Box::new(WifiTransport::new(
            config.transport,
            radio,
            codec,
            config.wifi.clone(),
            config.regulatory.clone(),
        ))
    } else {
        let driver = UdpLinkDriver::new(radio.mac_address(), &config.link);
        Box::new(LinkLayerTransport::new(
            Box::new(driver),
            radio,
            codec,
            config.link.peer_mac,
            config.regulatory.clone(),
        ))
    };
    Ok(transport)
}
