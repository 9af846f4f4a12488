//! Registries of the parties the server broadcasts to.
//!
//! [`EndpointRegistry`] holds the unreliable-channel endpoints that receive
//! forwarded position datagrams. [`SessionRegistry`] holds one
//! [`SessionHandle`] per registered reliable connection, used for removal
//! notices. Each registry is shared behind its own lock; fanout takes a
//! snapshot and sends after releasing it.

use log::{debug, info, warn};
use shared::ClientId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};

pub type SharedEndpoints = Arc<RwLock<EndpointRegistry>>;
pub type SharedSessions = Arc<RwLock<SessionRegistry>>;

/// Frames a session may have waiting for its writer. A peer that stops
/// reading loses frames past this point instead of growing the queue.
pub const SESSION_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Default)]
pub struct EndpointRegistry {
    endpoints: HashSet<ClientId>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_shared(self) -> SharedEndpoints {
        Arc::new(RwLock::new(self))
    }

    /// Returns false if the endpoint was already registered.
    pub fn add(&mut self, endpoint: ClientId) -> bool {
        let added = self.endpoints.insert(endpoint);
        if added {
            debug!("Registered endpoint {}", endpoint);
        }
        added
    }

    /// Returns false if the endpoint was not registered.
    pub fn remove(&mut self, endpoint: &ClientId) -> bool {
        let removed = self.endpoints.remove(endpoint);
        if removed {
            debug!("Unregistered endpoint {}", endpoint);
        }
        removed
    }

    pub fn contains(&self, endpoint: &ClientId) -> bool {
        self.endpoints.contains(endpoint)
    }

    pub fn snapshot(&self) -> Vec<ClientId> {
        self.endpoints.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Outbound side of one reliable session. Frames pushed here are written to
/// the connection in order by the session's writer task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    serial: u64,
    client: ClientId,
    outbound: mpsc::Sender<Vec<u8>>,
}

impl SessionHandle {
    pub fn new(serial: u64, client: ClientId, outbound: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            serial,
            client,
            outbound,
        }
    }

    /// Distinguishes connections that registered the same client id.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Queues a frame without waiting. Returns false when the writer is gone
    /// or its queue is full.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Session {} for {} is not keeping up, frame dropped",
                    self.serial, self.client
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<ClientId, SessionHandle>,
    next_serial: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_shared(self) -> SharedSessions {
        Arc::new(RwLock::new(self))
    }

    /// Hands out a serial for a freshly accepted connection.
    pub fn next_serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }

    /// Adds the session, returning the one it displaced if the client id
    /// was already registered.
    pub fn add(&mut self, handle: SessionHandle) -> Option<SessionHandle> {
        let client = handle.client;
        let serial = handle.serial;
        let replaced = self.sessions.insert(client, handle);
        match &replaced {
            Some(old) => info!(
                "Session {} for {} replaced session {}",
                serial, client, old.serial
            ),
            None => info!("Session {} registered for {}", serial, client),
        }
        replaced
    }

    /// Removes the session for `client` only if it is still the one with
    /// `serial`. Returns false if there was nothing to remove.
    pub fn remove(&mut self, client: &ClientId, serial: u64) -> bool {
        match self.sessions.get(client) {
            Some(handle) if handle.serial == serial => {
                self.sessions.remove(client);
                info!("Session {} for {} removed", serial, client);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, client: &ClientId) -> Option<&SessionHandle> {
        self.sessions.get(client)
    }

    pub fn snapshot(&self) -> Vec<SessionHandle> {
        self.sessions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
