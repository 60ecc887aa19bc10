use std::sync::Arc;

use super::connection::{CloseReason, Connection, RestrictionMode};
use super::error::NetError;
use super::protocol::{
    Guarantee, PROTOCOL_VERSION, Request, RequestKind, Response, ResponseKind, ServerAllowKind,
};
use super::sent::SentThing;

pub const GAME_NAME: &str = env!("CARGO_PKG_NAME");
pub const GAME_VERSION: &str = env!("CARGO_PKG_VERSION");

/// What became of a response that matched no pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseHandling {
    Handled,
    /// Handled, but the packet must not be acknowledged (keepalives).
    HandledWithoutAck,
    Unhandled,
}

/// Per-role packet dispatch. Connections call into this without holding
/// their own lock, so implementations may freely send on `conn`.
pub trait NetworkInterface: Send + Sync {
    fn handle_request(&self, request: &Request, conn: &Arc<Connection>) -> Result<(), NetError> {
        handle_default_request(request, conn)
    }

    /// Called for every response before it is matched or dispatched.
    /// Returning false drops the packet without acking it.
    fn pre_handle_response(
        &self,
        _response: &Response,
        _matched: Option<&Arc<SentThing>>,
        _conn: &Arc<Connection>,
    ) -> bool {
        true
    }

    fn handle_response_only(&self, response: &Response, conn: &Arc<Connection>) -> ResponseHandling {
        handle_default_response_only(response, conn)
    }

    /// Whether `request` is the handshake that lifts the connection's restriction.
    fn accept_restricted_request(&self, request: &Request, conn: &Connection) -> bool {
        conn.restriction_mode() == RestrictionMode::ReceiveRemoteConsole
            && matches!(request.kind, RequestKind::RemoteConsoleOpen { .. })
    }

    fn can_connection_terminate(&self, _conn: &Connection) -> bool {
        true
    }

    fn on_connection_closed(&self, _conn: &Arc<Connection>) {}
}

/// Answers the requests every peer understands.
pub fn handle_default_request(request: &Request, conn: &Arc<Connection>) -> Result<(), NetError> {
    let kind = match &request.kind {
        RequestKind::Echo => ResponseKind::Echo,
        RequestKind::Identification => ResponseKind::Identification {
            game_name: GAME_NAME.to_string(),
            game_version: GAME_VERSION.to_string(),
            protocol_version: PROTOCOL_VERSION,
        },
        RequestKind::RemoteConsoleOpen { .. } => ResponseKind::ServerAllow {
            allow: ServerAllowKind::RemoteConsoleAccepted,
            detail: String::new(),
        },
        other => return Err(NetError::UnhandledRequest(other.name().to_string())),
    };

    conn.send_response(&request.respond(kind), Guarantee::Critical)?;
    Ok(())
}

pub fn handle_default_response_only(response: &Response, conn: &Arc<Connection>) -> ResponseHandling {
    match response.kind {
        ResponseKind::None | ResponseKind::Keepalive => ResponseHandling::HandledWithoutAck,
        ResponseKind::CloseConnection => {
            log::info!("Remote {} closed the connection", conn.addr());
            conn.close(CloseReason::RemoteClosed);
            ResponseHandling::Handled
        }
        _ => ResponseHandling::Unhandled,
    }
}

/// Interface that only does the default handling.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultInterface;

impl NetworkInterface for DefaultInterface {}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::net::config::NetConfig;
    use crate::net::protocol::MAX_PACKET_SIZE;
    use crate::net::socket::{DatagramSocket, MemoryNetwork};

    #[test]
    fn test_default_echo_and_identification() {
        let network = MemoryNetwork::new();
        let client_addr = SocketAddr::from(([127, 0, 0, 1], 1));
        let server_addr = SocketAddr::from(([127, 0, 0, 1], 2));
        let client_socket = network.socket(client_addr);
        let server_socket = network.socket(server_addr);
        let config = Arc::new(NetConfig::default());

        let client = Arc::new(Connection::new(server_addr, client_socket.clone(), config.clone()));
        let server = Arc::new(Connection::new(client_addr, server_socket.clone(), config));

        let echo = client.send_request(RequestKind::Echo, Guarantee::Critical).unwrap();
        let ident = client
            .send_request(RequestKind::Identification, Guarantee::Critical)
            .unwrap();

        let mut buf = [0u8; MAX_PACKET_SIZE];
        while let Some((len, _)) = server_socket.recv_from(&mut buf).unwrap() {
            server.handle_packet(&buf[..len], &DefaultInterface);
        }
        while let Some((len, _)) = client_socket.recv_from(&mut buf).unwrap() {
            client.handle_packet(&buf[..len], &DefaultInterface);
        }

        assert!(echo.succeeded());
        assert!(ident.succeeded());
        match ident.response().map(|r| r.kind) {
            Some(ResponseKind::Identification {
                protocol_version, ..
            }) => assert_eq!(protocol_version, PROTOCOL_VERSION),
            other => panic!("Expected identification, got {:?}", other),
        }
    }

    #[test]
    fn test_sync_requests_are_not_default() {
        let network = MemoryNetwork::new();
        let conn = Arc::new(Connection::new(
            SocketAddr::from(([127, 0, 0, 1], 9)),
            network.socket(SocketAddr::from(([127, 0, 0, 1], 8))),
            Arc::new(NetConfig::default()),
        ));
        let request = Request {
            id: 1,
            kind: RequestKind::GetAllSyncValues,
        };

        assert!(matches!(
            handle_default_request(&request, &conn),
            Err(NetError::UnhandledRequest(name)) if name == "GetAllSyncValues"
        ));
    }

    #[test]
    fn test_keepalive_is_not_acked() {
        let network = MemoryNetwork::new();
        let conn = Arc::new(Connection::new(
            SocketAddr::from(([127, 0, 0, 1], 9)),
            network.socket(SocketAddr::from(([127, 0, 0, 1], 8))),
            Arc::new(NetConfig::default()),
        ));

        assert_eq!(
            handle_default_response_only(&Response::without_data(ResponseKind::Keepalive), &conn),
            ResponseHandling::HandledWithoutAck
        );
        assert_eq!(
            handle_default_response_only(&Response::without_data(ResponseKind::Echo), &conn),
            ResponseHandling::Unhandled
        );
        assert!(conn.is_open());
    }
}
