use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use super::config::NetConfig;
use super::connection::{CloseReason, Connection, UpdateOutcome};
use super::error::NetError;
use super::interface::NetworkInterface;
use super::protocol::{Guarantee, MAX_PACKET_SIZE, Response};
use super::sent::SentThing;
use super::socket::DatagramSocket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkRole {
    Host,
    Client,
}

impl NetworkRole {
    pub fn is_host(self) -> bool {
        self == NetworkRole::Host
    }
}

/// Open connections keyed by remote address.
#[derive(Debug)]
pub struct ConnectionManager {
    connections: Mutex<HashMap<SocketAddr, Arc<Connection>>>,
    max_connections: usize,
}

impl ConnectionManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            max_connections,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SocketAddr, Arc<Connection>>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<Connection>> {
        self.lock().get(addr).cloned()
    }

    pub fn insert(&self, connection: Arc<Connection>) -> Result<Arc<Connection>, NetError> {
        let mut connections = self.lock();
        if let Some(existing) = connections.get(&connection.addr()) {
            return Ok(Arc::clone(existing));
        }
        if connections.len() >= self.max_connections {
            return Err(NetError::ServerFull);
        }
        connections.insert(connection.addr(), Arc::clone(&connection));
        Ok(connection)
    }

    pub fn remove(&self, addr: &SocketAddr) -> Option<Arc<Connection>> {
        self.lock().remove(addr)
    }

    /// Snapshot of the current connections. Callers iterate it without
    /// holding the manager lock.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Sends `response` to every open connection.
    pub fn send_to_all(&self, response: &Response, guarantee: Guarantee) -> Vec<Arc<SentThing>> {
        self.connections()
            .into_iter()
            .filter(|conn| conn.is_open())
            .filter_map(|conn| match conn.send_response(response, guarantee) {
                Ok(sent) => Some(sent),
                Err(e) => {
                    log::warn!(
                        "Failed to send {} to {}: {}",
                        response.kind.name(),
                        conn.addr(),
                        e
                    );
                    None
                }
            })
            .collect()
    }

    fn remove_closed(&self) -> Vec<Arc<Connection>> {
        let mut connections = self.lock();
        let closed: Vec<SocketAddr> = connections
            .iter()
            .filter(|(_, conn)| !conn.is_open())
            .map(|(addr, _)| *addr)
            .collect();
        closed
            .iter()
            .filter_map(|addr| connections.remove(addr))
            .collect()
    }
}

/// Owns the socket and routes datagrams to connections.
pub struct NetworkHandler {
    role: NetworkRole,
    socket: Arc<dyn DatagramSocket>,
    connections: Arc<ConnectionManager>,
    interface: Arc<dyn NetworkInterface>,
    config: Arc<NetConfig>,
}

impl NetworkHandler {
    pub fn new(
        role: NetworkRole,
        socket: Arc<dyn DatagramSocket>,
        connections: Arc<ConnectionManager>,
        interface: Arc<dyn NetworkInterface>,
        config: Arc<NetConfig>,
    ) -> Self {
        log::info!("Network handler ({:?}) on {}", role, socket.local_addr());
        Self {
            role,
            socket,
            connections,
            interface,
            config,
        }
    }

    pub fn role(&self) -> NetworkRole {
        self.role
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn config(&self) -> &Arc<NetConfig> {
        &self.config
    }

    pub fn open_connection(&self, addr: SocketAddr) -> Result<Arc<Connection>, NetError> {
        if let Some(existing) = self.connections.get(&addr) {
            return Ok(existing);
        }
        let connection = Arc::new(Connection::new(
            addr,
            Arc::clone(&self.socket),
            Arc::clone(&self.config),
        ));
        let connection = self.connections.insert(connection)?;
        log::info!("Opened connection to {}", addr);
        Ok(connection)
    }

    /// One network tick: drain the socket, then resend and time out.
    pub fn update(&self) -> Result<(), NetError> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        while let Some((len, from)) = self.socket.recv_from(&mut buf)? {
            let connection = match self.connections.get(&from) {
                Some(connection) => connection,
                None if self.role.is_host() => match self.open_connection(from) {
                    Ok(connection) => connection,
                    Err(e) => {
                        log::warn!("Rejected packet from {}: {}", from, e);
                        continue;
                    }
                },
                None => {
                    log::debug!("Ignoring packet from unknown sender {}", from);
                    continue;
                }
            };
            connection.handle_packet(&buf[..len], self.interface.as_ref());
        }

        for connection in self.connections.connections() {
            if connection.update_listening() == UpdateOutcome::TimedOut
                && self.interface.can_connection_terminate(&connection)
            {
                log::warn!("Connection to {} timed out", connection.addr());
                connection.close(CloseReason::TimedOut);
            }
        }

        for connection in self.connections.remove_closed() {
            self.interface.on_connection_closed(&connection);
        }
        Ok(())
    }

    pub fn close_connection(&self, addr: &SocketAddr) {
        if let Some(connection) = self.connections.remove(addr) {
            connection.close(CloseReason::Released);
            self.interface.on_connection_closed(&connection);
        }
    }

    pub fn send_to_all_connections(
        &self,
        response: &Response,
        guarantee: Guarantee,
    ) -> Vec<Arc<SentThing>> {
        self.connections.send_to_all(response, guarantee)
    }

    pub fn shutdown(&self) {
        for connection in self.connections.connections() {
            connection.close(CloseReason::Shutdown);
        }
        for connection in self.connections.remove_closed() {
            self.interface.on_connection_closed(&connection);
        }
        log::info!("Network handler on {} shut down", self.local_addr());
    }
}
