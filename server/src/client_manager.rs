//! Registry of live TCP connections.
//!
//! Each connection owns a bounded outbound queue drained by its writer task
//! and a cancellation token that tears down its reader and writer together.
//! A client whose queue is full is treated as gone: it is cancelled rather
//! than allowed to stall the delivery loop.

use log::{info, warn};
use shared::ClientId;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

/// One connected client
#[derive(Debug)]
pub struct Client {
    pub id: ClientId,
    pub addr: SocketAddr,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl Client {
    pub fn new(
        id: ClientId,
        addr: SocketAddr,
        outbound: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            addr,
            outbound,
            cancel,
        }
    }

    /// Queues a line without waiting. Returns false when the client has to
    /// be dropped.
    pub fn queue(&self, line: String) -> bool {
        match self.outbound.try_send(line) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Client {} is not keeping up, disconnecting", self.id);
                self.cancel.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.cancel.cancel();
                false
            }
        }
    }
}

pub struct ClientManager {
    clients: HashMap<ClientId, Client>,
    next_client_id: ClientId,
    max_clients: usize,
}

impl ClientManager {
    /// Client ids start from 1 and are never reused within a process.
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Returns None when the server is at capacity.
    pub fn add_client(
        &mut self,
        addr: SocketAddr,
        outbound: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Option<ClientId> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        info!("Client {} connected from {}", client_id, addr);
        self.clients
            .insert(client_id, Client::new(client_id, addr, outbound, cancel));

        Some(client_id)
    }

    pub fn remove_client(&mut self, client_id: ClientId) -> bool {
        if let Some(client) = self.clients.remove(&client_id) {
            info!("Client {} disconnected", client.id);
            true
        } else {
            false
        }
    }

    /// Queues a line for one client. Unknown ids are ignored.
    pub fn send_to_client(&self, client_id: ClientId, line: String) -> bool {
        match self.clients.get(&client_id) {
            Some(client) => client.queue(line),
            None => false,
        }
    }

    /// Closes a connection from the server side. The connection's own tasks
    /// deregister it once they wind down.
    pub fn disconnect(&self, client_id: ClientId) -> bool {
        match self.clients.get(&client_id) {
            Some(client) => {
                client.cancel.cancel();
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn contains(&self, client_id: ClientId) -> bool {
        self.clients.contains_key(&client_id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
