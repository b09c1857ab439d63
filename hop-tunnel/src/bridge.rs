//! Relay side glue between a tunnel and a UDP relay pool

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use hop_nat::{RelayPool, RelayReply};

use crate::error::{Error, Result};
use crate::tunnel::Tunnel;

/// Forwards UDP packets arriving through a tunnel to their real
/// destinations and sends the replies back through the tunnel
pub struct UdpRelayBridge {
    relay: Arc<RelayPool>,
    pump: JoinHandle<()>,
}

impl UdpRelayBridge {
    /// Start pumping `replies` into `tunnel`. Must be called from within a
    /// tokio runtime.
    pub fn new(relay: Arc<RelayPool>, replies: mpsc::Receiver<RelayReply>, tunnel: Arc<Tunnel>) -> Self {
        let pump = tokio::spawn(pump_replies(replies, tunnel));
        Self { relay, pump }
    }

    /// Relay one IP packet received from the tunnel. Non-UDP packets are
    /// rejected with [`hop_nat::Error::UnsupportedProtocol`].
    pub async fn forward(&self, packet: &[u8]) -> Result<()> {
        self.relay.send_packet(packet).await?;
        Ok(())
    }

    pub fn relay(&self) -> &RelayPool {
        &self.relay
    }

    /// Stop pumping replies and shut the relay down
    pub fn close(&self) {
        self.pump.abort();
        self.relay.close();
    }
}

impl Drop for UdpRelayBridge {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump_replies(mut replies: mpsc::Receiver<RelayReply>, tunnel: Arc<Tunnel>) {
    while let Some(reply) = replies.recv().await {
        let packet = match reply.to_packet() {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("relay reply from {} dropped: {}", reply.remote, e);
                continue;
            }
        };

        match tunnel.send_packet(&packet).await {
            Ok(()) => {}
            Err(Error::Closed) => break,
            Err(e) => log::debug!("relay reply to {} not sent: {}", reply.source, e),
        }
    }
    log::debug!("relay reply pump for session {} stopped", tunnel.session_id());
}
