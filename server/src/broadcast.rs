//! Best-effort fanout over both channels. Each send takes a snapshot of the
//! registry, releases the lock, then unicasts to every member once. Failures
//! are logged per member and never abort the rest of the fanout.

use crate::registry::{SharedEndpoints, SharedSessions};
use log::{debug, warn};
use shared::{ClientId, Entity};
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Sends datagrams to every registered unreliable-channel endpoint.
#[derive(Clone)]
pub struct DatagramFanout {
    socket: Arc<UdpSocket>,
    endpoints: SharedEndpoints,
}

impl DatagramFanout {
    pub fn new(socket: Arc<UdpSocket>, endpoints: SharedEndpoints) -> Self {
        Self { socket, endpoints }
    }

    pub async fn len(&self) -> usize {
        self.endpoints.read().await.len()
    }

    /// Returns how many endpoints the datagram was handed to.
    pub async fn send_to_all(&self, payload: &[u8]) -> usize {
        self.send_each(payload, None).await
    }

    pub async fn send_to_all_except(&self, payload: &[u8], excluded: &ClientId) -> usize {
        self.send_each(payload, Some(excluded)).await
    }

    async fn send_each(&self, payload: &[u8], excluded: Option<&ClientId>) -> usize {
        let endpoints = {
            let endpoints = self.endpoints.read().await;
            endpoints.snapshot()
        };

        let mut sent = 0;
        for endpoint in endpoints {
            if Some(&endpoint) == excluded {
                continue;
            }

            match self.socket.send_to(payload, endpoint.socket_addr()).await {
                Ok(_) => sent += 1,
                Err(e) => warn!("Failed to forward datagram to {}: {}", endpoint, e),
            }
        }
        sent
    }
}

/// Queues frames on every registered reliable session.
#[derive(Clone)]
pub struct SessionFanout {
    sessions: SharedSessions,
}

impl SessionFanout {
    pub fn new(sessions: SharedSessions) -> Self {
        Self { sessions }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn send_to_all(&self, frame: &[u8]) -> usize {
        self.send_each(frame, None).await
    }

    pub async fn send_to_all_except(&self, frame: &[u8], excluded: &ClientId) -> usize {
        self.send_each(frame, Some(excluded)).await
    }

    /// Sends one removal notice per destroyed entity to every session.
    pub async fn announce_removals<'a, I>(&self, destroyed: I)
    where
        I: IntoIterator<Item = &'a Entity>,
    {
        for entity in destroyed {
            match entity.encode_removal() {
                Ok(frame) => {
                    let sent = self.send_to_all(&frame).await;
                    debug!("Announced removal of {} to {} sessions", entity, sent);
                }
                Err(e) => warn!("Failed to encode removal of {}: {}", entity, e),
            }
        }
    }

    async fn send_each(&self, frame: &[u8], excluded: Option<&ClientId>) -> usize {
        let sessions = {
            let sessions = self.sessions.read().await;
            sessions.snapshot()
        };

        let mut sent = 0;
        for session in sessions {
            if Some(&session.client()) == excluded {
                continue;
            }

            if session.send(frame.to_vec()) {
                sent += 1;
            } else {
                warn!(
                    "Session {} for {} did not take the frame",
                    session.serial(),
                    session.client()
                );
            }
        }
        sent
    }
}
