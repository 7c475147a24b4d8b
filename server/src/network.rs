//! Server network layer: newline-delimited text over TCP.
//!
//! Every accepted connection gets a client id, a reader task that turns lines
//! into [`InboundCommand`]s and a writer task that drains the client's
//! outbound queue. A single delivery loop routes [`ClientDelivery`] messages
//! from the actors to those queues.

use crate::bus::{Topic, TopicBus};
use crate::client_manager::ClientManager;
use crate::config::ServerConfig;
use crate::messages::{
    ClientDelivery, InboundCommand, SessionMsg, CLIENT_DELIVERY, INCOMING_COMMANDS, SESSION_TOPIC,
};
use log::{debug, error, info, warn};
use shared::{ClientId, RawCommand, Screen, ServerMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

pub struct NetworkServer {
    listener: TcpListener,
    clients: Arc<RwLock<ClientManager>>,
    commands: Topic<InboundCommand>,
    sessions: Topic<SessionMsg>,
    delivery: mpsc::Receiver<ClientDelivery>,
    outbound_buffer: usize,
    shutdown: CancellationToken,
}

impl NetworkServer {
    pub async fn bind(
        config: &ServerConfig,
        bus: &TopicBus,
        shutdown: CancellationToken,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&config.address).await?;
        info!("Server listening on {}", listener.local_addr()?);

        Ok(NetworkServer {
            listener,
            clients: Arc::new(RwLock::new(ClientManager::new(config.max_clients))),
            commands: bus.topic(&INCOMING_COMMANDS)?,
            sessions: bus.topic(&SESSION_TOPIC)?,
            delivery: bus.subscribe(&CLIENT_DELIVERY)?,
            outbound_buffer: config.outbound_buffer.max(1),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the shutdown token fires.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let NetworkServer {
            listener,
            clients,
            commands,
            sessions,
            delivery,
            outbound_buffer,
            shutdown,
        } = self;

        let delivery_handle = tokio::spawn(run_delivery(
            delivery,
            Arc::clone(&clients),
            shutdown.clone(),
        ));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Network server shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let connection = Connection {
                            clients: Arc::clone(&clients),
                            commands: commands.clone(),
                            sessions: sessions.clone(),
                            outbound_buffer,
                            cancel: shutdown.child_token(),
                        };
                        tokio::spawn(connection.serve(stream, addr));
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }

        if let Err(e) = delivery_handle.await {
            error!("Delivery task panicked: {}", e);
        }
        Ok(())
    }
}

/// Routes actor output to client queues.
async fn run_delivery(
    mut delivery: mpsc::Receiver<ClientDelivery>,
    clients: Arc<RwLock<ClientManager>>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = delivery.recv() => message,
        };

        match message {
            Some(ClientDelivery::Text { client_id, message }) => match message.to_line() {
                Ok(line) => {
                    if !clients.read().await.send_to_client(client_id, line) {
                        debug!("Dropped {} for client {}", message.verb(), client_id);
                    }
                }
                Err(e) => error!("Failed to render {}: {}", message.verb(), e),
            },
            Some(ClientDelivery::Disconnect { client_ids }) => {
                let clients = clients.read().await;
                for client_id in client_ids {
                    clients.disconnect(client_id);
                }
            }
            None => break,
        }
    }
    debug!("Delivery loop stopped");
}

struct Connection {
    clients: Arc<RwLock<ClientManager>>,
    commands: Topic<InboundCommand>,
    sessions: Topic<SessionMsg>,
    outbound_buffer: usize,
    cancel: CancellationToken,
}

impl Connection {
    async fn serve(self, stream: TcpStream, addr: SocketAddr) {
        let (reader, mut writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::channel(self.outbound_buffer);

        let client_id = {
            let mut clients = self.clients.write().await;
            clients.add_client(addr, outbound, self.cancel.clone())
        };

        let Some(client_id) = client_id else {
            warn!("Rejecting {}: server full", addr);
            if let Ok(line) = ServerMessage::error("server is full", Screen::Entrance).to_line() {
                let _ = writer.write_all(format!("{}\n", line).as_bytes()).await;
            }
            return;
        };

        let writer_handle = tokio::spawn(write_lines(
            writer,
            outbound_rx,
            self.cancel.clone(),
            client_id,
        ));

        self.read_lines(reader, client_id).await;

        self.cancel.cancel();
        if let Err(e) = writer_handle.await {
            error!("Writer for client {} panicked: {}", client_id, e);
        }

        self.clients.write().await.remove_client(client_id);
        if let Err(e) = self
            .sessions
            .send(SessionMsg::ClientDisconnected { client_id })
            .await
        {
            debug!("Could not report disconnect of {}: {}", client_id, e);
        }
    }

    async fn read_lines(&self, reader: OwnedReadHalf, client_id: ClientId) {
        let mut lines = BufReader::new(reader).lines();

        loop {
            let line = tokio::select! {
                _ = self.cancel.cancelled() => break,
                line = lines.next_line() => line,
            };

            match line {
                Ok(Some(line)) => {
                    let Some(command) = RawCommand::parse(&line) else {
                        continue;
                    };
                    debug!("Client {} sent {}", client_id, command.verb);
                    if let Err(e) = self
                        .commands
                        .send(InboundCommand { client_id, command })
                        .await
                    {
                        error!("Failed to forward command from {}: {}", client_id, e);
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Error reading from client {}: {}", client_id, e);
                    break;
                }
            }
        }
    }
}

async fn write_lines(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<String>,
    cancel: CancellationToken,
    client_id: ClientId,
) {
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = outbound.recv() => line,
        };

        let Some(mut line) = line else {
            break;
        };
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!("Error writing to client {}: {}", client_id, e);
            break;
        }
    }

    cancel.cancel();
    let _ = writer.shutdown().await;
}
