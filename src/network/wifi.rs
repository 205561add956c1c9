use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::net::UdpSocket;
use tokio_util::udp::UdpFramed;
use tracing::{debug, info, warn};

use crate::core::{DeviceRole, Error, RegulatoryConfig, Result, TransportKind, WifiConfig};
use crate::protocol::PacketCodec;
use super::radio::{Phy, RadioMode, SharedRadio};
use super::regulatory::{apply_radio_settings, RadioSettings};
use super::{Delivery, DeliveryQueue, FrameHandler, Transport};

/// Datagram transport over a point-to-point WiFi association
///
/// The receiver runs the access point and the sender associates as a
/// station. Both use fixed addresses and one data port. The access point
/// learns its peer from the first datagram when none is known.
pub struct WifiTransport {
    kind: TransportKind,
    radio: SharedRadio,
    codec: PacketCodec,
    addrs: WifiConfig,
    regulatory: RegulatoryConfig,
    bind_override: Option<SocketAddr>,
    socket: Option<Arc<UdpSocket>>,
    peer: Arc<Mutex<Option<SocketAddr>>>,
    queue: DeliveryQueue,
    settings: Option<RadioSettings>,
}

impl WifiTransport {
    pub fn new(
        kind: TransportKind,
        radio: SharedRadio,
        codec: PacketCodec,
        addrs: WifiConfig,
        regulatory: RegulatoryConfig,
    ) -> Self {
        WifiTransport {
            kind,
            radio,
            codec,
            addrs,
            regulatory,
            bind_override: None,
            socket: None,
            peer: Arc::new(Mutex::new(None)),
            queue: DeliveryQueue::default(),
            settings: None,
        }
    }

    /// Binds to `addr` instead of the role's configured address
    pub fn bind_to(mut self, addr: SocketAddr) -> Self {
        self.bind_override = Some(addr);
        self
    }

    /// Address the data socket is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Current destination of outbound frames
    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Overrides the destination of outbound frames
    pub fn set_peer(&mut self, addr: SocketAddr) {
        *self.peer.lock().unwrap_or_else(|p| p.into_inner()) = Some(addr);
    }

    fn spawn_receiver(&self, socket: Arc<UdpSocket>) {
        let producer = self.queue.producer();
        let peer = self.peer.clone();
        let radio = self.radio.clone();
        let mut framed = UdpFramed::new(socket, self.codec);

        tokio::spawn(async move {
            while let Some(item) = framed.next().await {
                let (packet, source) = match item {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("WiFi receive error: {}", e);
                        continue;
                    }
                };

                {
                    let mut peer = peer.lock().unwrap_or_else(|p| p.into_inner());
                    if peer.is_none() {
                        info!("Learned peer address {}", source);
                        *peer = Some(source);
                    }
                }

                let delivery = Delivery {
                    packet,
                    rssi: radio.rssi(),
                    source: source.to_string(),
                    received_at: Instant::now(),
                };
                if !producer.push(delivery) && producer.is_closed() {
                    break;
                }
            }
        });
    }
}

#[async_trait]
impl Transport for WifiTransport {
    async fn initialize(
        &mut self,
        channel: u8,
        requested_tx_power_dbm: i8,
        role: DeviceRole,
    ) -> Result<RadioSettings> {
        let (mode, local, remote) = match role {
            DeviceRole::Receiver => (RadioMode::AccessPoint, self.addrs.ap_addr, None),
            DeviceRole::Sender => (RadioMode::Station, self.addrs.sta_addr, Some(self.addrs.ap_addr)),
        };

        let settings = apply_radio_settings(
            self.radio.as_ref(),
            &self.regulatory,
            mode,
            Phy::for_transport(self.kind),
            channel,
            requested_tx_power_dbm,
        )?;

        let bind = self.bind_override.unwrap_or(local);
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| Error::transport(format!("failed to bind {}: {}", bind, e)))?;
        // Registers write readiness with the reactor so the first try_send_to succeeds
        socket
            .writable()
            .await
            .map_err(|e| Error::transport(format!("socket {} not writable: {}", bind, e)))?;
        let socket = Arc::new(socket);

        if let Some(remote) = remote {
            let mut peer = self.peer.lock().unwrap_or_else(|p| p.into_inner());
            peer.get_or_insert(remote);
        }

        info!(
            "{} up as {:?} on {} (peer {:?})",
            self.kind.display_name(),
            mode,
            socket.local_addr().unwrap_or(bind),
            self.peer()
        );

        self.spawn_receiver(socket.clone());
        self.socket = Some(socket);
        self.settings = Some(settings.clone());
        Ok(settings)
    }

    fn send(&mut self, frame: &[u8]) -> bool {
        let Some(socket) = self.socket.as_ref() else {
            debug!("WiFi send before initialization");
            return false;
        };
        let Some(peer) = self.peer() else {
            debug!("WiFi send with no known peer");
            return false;
        };
        if frame.len() > self.kind.max_frame_len() {
            warn!("Frame of {} bytes exceeds {} limit", frame.len(), self.kind.display_name());
            return false;
        }

        match socket.try_send_to(frame, peer) {
            Ok(_) => true,
            Err(e) => {
                debug!("WiFi send to {} failed: {}", peer, e);
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
        self.kind
    }

    fn settings(&self) -> Option<&RadioSettings> {
        self.settings.as_ref()
    }
}
